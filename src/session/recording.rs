//! Optional per-session transcript recording.
//!
//! When `recording.enabled` is set, every session tees its raw PTY output to
//! `<recording.path>/<session_id>.log` through an mpsc channel drained by a
//! background writer task. Sends are best-effort `try_send` — recording must
//! never block or slow the PTY read path.

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Handle to a session's transcript recorder.
pub struct Recorder {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Recorder {
    /// Create the recording file and spawn the writer task.
    pub async fn create(dir: &Path, session_id: &str) -> Result<Self, std::io::Error> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{session_id}.log"));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(4096);
        tokio::spawn(writer_task(file, rx));
        Ok(Self { tx })
    }

    /// Clone of the sender for the PTY reader to tee into.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }
}

async fn writer_task(mut file: fs::File, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = file.write_all(&chunk).await {
            warn!("recording write failed, stopping recorder: {e}");
            return;
        }
    }
    let _ = file.flush().await;
}
