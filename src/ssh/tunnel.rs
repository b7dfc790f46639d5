//! TCP port forwarding over an SSH session.
//!
//! Two kinds of forwards:
//!
//! - **local**: bind a local listener; each accepted connection opens a
//!   `direct-tcpip` channel to the target host/port on the remote side.
//! - **reverse**: ask the server to listen on a remote port; each incoming
//!   channel is connected to a local TCP target.
//!
//! Each tunnel runs its own accept loop on an OS thread with a thread per
//! accepted connection, all joined on tunnel close. The session is
//! non-blocking, so channel operations retry on `EAGAIN` the same way the
//! shell I/O loop does.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ssh::retry_ssh2;

/// Forward direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Local,
    Reverse,
}

/// User-facing tunnel descriptor; saved for `shell_tunnel_restore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub kind: TunnelKind,
    /// Local bind port (local) or remote listen port (reverse).
    pub bind_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

/// Snapshot returned by `shell_tunnel_list`.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub tunnel_id: u64,
    #[serde(flatten)]
    pub spec: TunnelSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct Tunnel {
    spec: TunnelSpec,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
}

/// Owns all tunnels of one SSH session.
pub struct TunnelManager {
    session: Arc<ssh2::Session>,
    tunnels: Mutex<HashMap<u64, Tunnel>>,
    next_id: AtomicU64,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager").finish_non_exhaustive()
    }
}

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PUMP_POLL: Duration = Duration::from_millis(5);

impl TunnelManager {
    pub fn new(session: Arc<ssh2::Session>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            session,
            tunnels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    /// Create a forward and start its accept loop. Returns the tunnel id.
    pub fn create(&self, spec: TunnelSpec) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shutdown = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));

        let accept_thread = match spec.kind {
            TunnelKind::Local => self.start_local(&spec, &shutdown, &last_error)?,
            TunnelKind::Reverse => self.start_reverse(&spec, &shutdown, &last_error)?,
        };

        info!(
            "tunnel {id} created ({:?} port {} -> {}:{})",
            spec.kind, spec.bind_port, spec.target_host, spec.target_port
        );
        self.tunnels.lock().expect("tunnel map poisoned").insert(
            id,
            Tunnel {
                spec,
                shutdown,
                accept_thread: Some(accept_thread),
                last_error,
            },
        );
        Ok(id)
    }

    fn start_local(
        &self,
        spec: &TunnelSpec,
        shutdown: &Arc<AtomicBool>,
        last_error: &Arc<Mutex<Option<String>>>,
    ) -> Result<std::thread::JoinHandle<()>> {
        let listener = TcpListener::bind(("127.0.0.1", spec.bind_port))
            .map_err(|e| Error::LocalIo(format!("bind 127.0.0.1:{}: {e}", spec.bind_port)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::LocalIo(format!("listener nonblocking: {e}")))?;

        let session = Arc::clone(&self.session);
        let cancel = Arc::clone(&self.cancel);
        let shutdown = Arc::clone(shutdown);
        let last_error = Arc::clone(last_error);
        let target_host = spec.target_host.clone();
        let target_port = spec.target_port;

        Ok(std::thread::spawn(move || {
            let mut pumps: Vec<std::thread::JoinHandle<()>> = Vec::new();
            loop {
                if shutdown.load(Ordering::Relaxed) || cancel.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!("tunnel accepted {peer}");
                        let channel = retry_ssh2(&cancel, || {
                            session.channel_direct_tcpip(&target_host, target_port, None)
                        });
                        match channel {
                            Ok(channel) => {
                                let shutdown = Arc::clone(&shutdown);
                                let last_error = Arc::clone(&last_error);
                                pumps.push(std::thread::spawn(move || {
                                    pump(channel, stream, &shutdown, &last_error);
                                }));
                            }
                            Err(e) => {
                                warn!("direct-tcpip to {target_host}:{target_port} failed: {e}");
                                *last_error.lock().expect("tunnel error poisoned") =
                                    Some(e.to_string());
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("tunnel accept failed: {e}");
                        *last_error.lock().expect("tunnel error poisoned") = Some(e.to_string());
                        break;
                    }
                }
            }
            for p in pumps {
                let _ = p.join();
            }
        }))
    }

    fn start_reverse(
        &self,
        spec: &TunnelSpec,
        shutdown: &Arc<AtomicBool>,
        last_error: &Arc<Mutex<Option<String>>>,
    ) -> Result<std::thread::JoinHandle<()>> {
        let (listener, bound_port) = retry_ssh2(&self.cancel, || {
            self.session
                .channel_forward_listen(spec.bind_port, None, None)
        })
        .map_err(|e| Error::remote(&format!("remote port {}", spec.bind_port), e))?;
        debug!("reverse tunnel listening on remote port {bound_port}");

        let cancel = Arc::clone(&self.cancel);
        let shutdown = Arc::clone(shutdown);
        let last_error = Arc::clone(last_error);
        let target_host = spec.target_host.clone();
        let target_port = spec.target_port;

        Ok(std::thread::spawn(move || {
            let mut listener = listener;
            let mut pumps: Vec<std::thread::JoinHandle<()>> = Vec::new();
            loop {
                if shutdown.load(Ordering::Relaxed) || cancel.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok(channel) => {
                        match TcpStream::connect((target_host.as_str(), target_port)) {
                            Ok(stream) => {
                                let shutdown = Arc::clone(&shutdown);
                                let last_error = Arc::clone(&last_error);
                                pumps.push(std::thread::spawn(move || {
                                    pump(channel, stream, &shutdown, &last_error);
                                }));
                            }
                            Err(e) => {
                                warn!("reverse tunnel dial {target_host}:{target_port}: {e}");
                                *last_error.lock().expect("tunnel error poisoned") =
                                    Some(e.to_string());
                            }
                        }
                    }
                    Err(ref e) if crate::ssh::is_again(e) => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("reverse tunnel accept failed: {e}");
                        *last_error.lock().expect("tunnel error poisoned") = Some(e.to_string());
                        break;
                    }
                }
            }
            // Dropping the listener cancels the remote forward.
            for p in pumps {
                let _ = p.join();
            }
        }))
    }

    pub fn list(&self) -> Vec<TunnelInfo> {
        let tunnels = self.tunnels.lock().expect("tunnel map poisoned");
        let mut items: Vec<TunnelInfo> = tunnels
            .iter()
            .map(|(id, t)| TunnelInfo {
                tunnel_id: *id,
                spec: t.spec.clone(),
                last_error: t.last_error.lock().expect("tunnel error poisoned").clone(),
            })
            .collect();
        items.sort_by_key(|t| t.tunnel_id);
        items
    }

    /// Close one tunnel, joining its accept loop and connection pumps.
    pub fn close(&self, id: u64) -> Result<TunnelSpec> {
        let mut tunnel = {
            let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
            tunnels
                .remove(&id)
                .ok_or_else(|| Error::NotFound(format!("tunnel {id} not found")))?
        };
        tunnel.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = tunnel.accept_thread.take() {
            let _ = handle.join();
        }
        info!("tunnel {id} closed");
        Ok(tunnel.spec)
    }

    /// Close every tunnel (session teardown).
    pub fn close_all(&self) {
        let drained: Vec<Tunnel> = {
            let mut tunnels = self.tunnels.lock().expect("tunnel map poisoned");
            tunnels.drain().map(|(_, t)| t).collect()
        };
        for mut t in drained {
            t.shutdown.store(true, Ordering::Relaxed);
            if let Some(handle) = t.accept_thread.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Copy bytes both ways between an SSH channel and a TCP stream until either
/// side closes, an error occurs, or shutdown is requested.
fn pump(
    mut channel: ssh2::Channel,
    stream: TcpStream,
    shutdown: &AtomicBool,
    last_error: &Mutex<Option<String>>,
) {
    if let Err(e) = stream.set_nonblocking(true) {
        *last_error.lock().expect("tunnel error poisoned") = Some(e.to_string());
        return;
    }
    let mut stream = stream;
    let mut buf = [0u8; 16 * 1024];

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let mut progressed = false;

        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if write_all_channel(&mut channel, &buf[..n], shutdown).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                *last_error.lock().expect("tunnel error poisoned") = Some(e.to_string());
                break;
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if write_all_stream(&mut stream, &buf[..n], shutdown).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if channel.eof() {
                    break;
                }
            }
            Err(e) => {
                *last_error.lock().expect("tunnel error poisoned") = Some(e.to_string());
                break;
            }
        }

        if !progressed {
            std::thread::sleep(PUMP_POLL);
        }
    }
    let _ = channel.close();
}

fn write_all_channel(
    channel: &mut ssh2::Channel,
    data: &[u8],
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        if shutdown.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "shutdown",
            ));
        }
        match channel.write(&data[pos..]) {
            Ok(n) => pos += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(PUMP_POLL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_all_stream(
    stream: &mut TcpStream,
    data: &[u8],
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        if shutdown.load(Ordering::Relaxed) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "shutdown",
            ));
        }
        match stream.write(&data[pos..]) {
            Ok(n) => pos += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(PUMP_POLL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
