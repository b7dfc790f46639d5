//! Handlers for session lifecycle, command execution, and server config
//! tools.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::ServerEntry;
use crate::error::{Error, Result};
use crate::server::Server;
use crate::session::session::ExecOptions;
use crate::session::SshSessionRequest;
use crate::ssh;
use crate::tools::args::{
    self, ConfigAddArgs, ExecArgs, ProvideInputArgs, SendRawArgs, ServerTestArgs,
    SessionCreateArgs, SessionIdArgs,
};

pub async fn session_create(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionCreateArgs = args::parse(arguments)?;
    let session = match a.mode.as_str() {
        "local" => server.sessions.create_local().await?,
        "ssh" => {
            let host = a
                .host
                .ok_or_else(|| Error::InvalidArgument("host is required for mode=ssh".into()))?;
            let user = a
                .user
                .ok_or_else(|| Error::InvalidArgument("user is required for mode=ssh".into()))?;
            let config = server.config();
            let request = SshSessionRequest {
                server: config.server_for(&host, &user).cloned(),
                host,
                port: a.port,
                user,
                key_path: a.key_path,
            };
            server.sessions.create_ssh(request, &server.limiter).await?
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "mode must be local or ssh, got `{other}`"
            )))
        }
    };
    serde_json::to_value(session.summary())
        .map_err(|e| Error::Internal(format!("serialize summary: {e}")))
}

pub async fn session_list(server: &Arc<Server>) -> Result<Value> {
    let sessions = server.sessions.list().await;
    Ok(json!({
        "sessions": sessions,
        "count": sessions.len(),
    }))
}

pub async fn session_status(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionIdArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let mut status = serde_json::to_value(session.summary())
        .map_err(|e| Error::Internal(format!("serialize summary: {e}")))?;
    status["saved_tunnels"] = serde_json::to_value(session.saved_tunnels())
        .map_err(|e| Error::Internal(format!("serialize tunnels: {e}")))?;
    Ok(status)
}

pub async fn session_close(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionIdArgs = args::parse(arguments)?;
    server
        .sessions
        .close(&a.session_id, &server.sudo_cache)
        .await?;
    Ok(json!({ "closed": a.session_id }))
}

pub async fn exec(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: ExecArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let policy = server.exec_policy_for(&session);
    let opts = ExecOptions {
        timeout_ms: a.timeout_ms.unwrap_or(0),
        tail_lines: a.tail_lines.unwrap_or(0),
        head_lines: a.head_lines.unwrap_or(0),
    };
    let result = session
        .exec(&a.command, opts, &policy, &server.sudo_cache)
        .await?;
    serde_json::to_value(result).map_err(|e| Error::Internal(format!("serialize result: {e}")))
}

pub async fn provide_input(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: ProvideInputArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let policy = server.exec_policy_for(&session);
    let result = session
        .provide_input(&a.input, a.cache_for_sudo, &policy, &server.sudo_cache)
        .await?;
    serde_json::to_value(result).map_err(|e| Error::Internal(format!("serialize result: {e}")))
}

pub async fn send_raw(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SendRawArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let policy = server.exec_policy_for(&session);
    let result = session
        .send_raw(&a.input, &policy, &server.sudo_cache)
        .await?;
    serde_json::to_value(result).map_err(|e| Error::Internal(format!("serialize result: {e}")))
}

pub async fn interrupt(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionIdArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    session.interrupt().await?;
    Ok(json!({ "interrupted": a.session_id, "state": session.state() }))
}

pub async fn sudo_auth(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionIdArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let config = server.config();
    let entry = config
        .server_for(&session.host, &session.user)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "no configured server matches {}@{}",
                session.user, session.host
            ))
        })?;
    let var = entry.sudo_password_env.as_ref().ok_or_else(|| {
        Error::AuthFailed(format!(
            "server `{}` has no sudo_password_env configured",
            entry.name
        ))
    })?;
    let password = std::env::var(var).map_err(|_| {
        Error::AuthFailed(format!("sudo password env var `{var}` is not set"))
    })?;
    server
        .sudo_cache
        .put(&session.host, &session.user, &password);
    Ok(json!({ "cached": true, "session_id": a.session_id }))
}

pub async fn server_list(server: &Arc<Server>) -> Result<Value> {
    let config = server.config();
    let servers: Vec<Value> = config
        .servers
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "host": s.host,
                "port": s.port,
                "user": s.user,
                "auth_type": s.auth_type,
                "key_path": s.key_path,
                // Env var *names* only; values are never surfaced.
                "sudo_password_configured": s.sudo_password_env.is_some(),
            })
        })
        .collect();
    Ok(json!({ "servers": servers, "count": servers.len() }))
}

pub async fn server_test(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: ServerTestArgs = args::parse(arguments)?;
    let config = server.config();
    let entry = config
        .server(&a.name)
        .ok_or_else(|| Error::NotFound(format!("server `{}` not found", a.name)))?
        .clone();

    server.limiter.check(&entry.host, &entry.user)?;

    let timeout = std::time::Duration::from_millis(a.timeout_ms.unwrap_or(15_000));
    let host = entry.host.clone();
    let user = entry.user.clone();
    let started = std::time::Instant::now();
    let handle = tokio::task::spawn_blocking(move || ssh::test_server(&entry));

    let outcome = tokio::time::timeout(timeout, handle)
        .await
        .map_err(|_| Error::Timeout(format!("server test `{}` timed out", a.name)))?
        .map_err(|e| Error::Internal(format!("server test task: {e}")))?;

    match outcome {
        Ok(()) => {
            server.limiter.record_success(&host, &user);
            Ok(json!({
                "name": a.name,
                "reachable": true,
                "latency_ms": started.elapsed().as_millis() as u64,
            }))
        }
        Err(e) => {
            if matches!(e, Error::AuthFailed(_)) {
                server.limiter.record_failure(&host, &user);
            }
            Err(e)
        }
    }
}

pub async fn config_add(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: ConfigAddArgs = args::parse(arguments)?;
    let auth_type = a.auth_type.unwrap_or_else(|| "agent".to_string());
    match auth_type.as_str() {
        "agent" | "password" => {}
        "key" => {
            if a.key_path.is_none() {
                return Err(Error::InvalidArgument(
                    "auth_type=key requires key_path".to_string(),
                ));
            }
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "auth_type must be agent|key|password, got `{other}`"
            )))
        }
    }

    let entry = ServerEntry {
        name: a.name.clone(),
        host: a.host,
        port: a.port,
        user: a.user,
        auth_type,
        key_path: a.key_path,
        password_env: None,
        sudo_password_env: a.sudo_password_env,
    };
    server.add_server(entry)?;
    Ok(json!({ "added": a.name }))
}
