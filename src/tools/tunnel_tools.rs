//! Handlers for SSH port-forwarding tools.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::server::Server;
use crate::ssh::tunnel::{TunnelKind, TunnelSpec};
use crate::tools::args::{self, SessionIdArgs, TunnelCloseArgs, TunnelCreateArgs};

fn parse_kind(kind: &str) -> Result<TunnelKind> {
    match kind {
        "local" => Ok(TunnelKind::Local),
        "reverse" => Ok(TunnelKind::Reverse),
        other => Err(Error::InvalidArgument(format!(
            "kind must be local or reverse, got `{other}`"
        ))),
    }
}

pub async fn tunnel_create(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: TunnelCreateArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let tunnels = session.require_tunnels()?;

    let spec = TunnelSpec {
        kind: parse_kind(&a.kind)?,
        bind_port: a.bind_port,
        target_host: a.target_host,
        target_port: a.target_port,
    };
    let tunnel_id = tunnels.create(spec.clone())?;
    if a.save {
        session.save_tunnel(spec.clone());
    }
    Ok(json!({
        "tunnel_id": tunnel_id,
        "kind": spec.kind,
        "bind_port": spec.bind_port,
        "target_host": spec.target_host,
        "target_port": spec.target_port,
        "saved": a.save,
    }))
}

pub async fn tunnel_list(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionIdArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let tunnels = session.require_tunnels()?;
    let items = tunnels.list();
    Ok(json!({
        "tunnels": items,
        "saved": session.saved_tunnels(),
    }))
}

pub async fn tunnel_close(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: TunnelCloseArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let tunnels = session.require_tunnels()?;
    let spec = tunnels.close(a.tunnel_id)?;
    session.forget_saved_tunnel(&spec);
    Ok(json!({ "closed": a.tunnel_id }))
}

pub async fn tunnel_restore(arguments: &Value, server: &Arc<Server>) -> Result<Value> {
    let a: SessionIdArgs = args::parse(arguments)?;
    let session = server.sessions.get(&a.session_id).await?;
    let tunnels = session.require_tunnels()?;

    let mut restored = Vec::new();
    let mut errors = Vec::new();
    for spec in session.saved_tunnels() {
        match tunnels.create(spec.clone()) {
            Ok(id) => restored.push(json!({ "tunnel_id": id, "bind_port": spec.bind_port })),
            Err(e) => errors.push(json!({ "bind_port": spec.bind_port, "error": e.to_string() })),
        }
    }
    Ok(json!({
        "restored": restored,
        "errors": errors,
    }))
}
