//! Sesiones de transporte: una por worker conectado.
//!
//! Protocolo: el worker manda `NODE:<id>`, recibe `<id>.zip` como archivo,
//! y más tarde devuelve su shard `<id>_PostP.zip`, que queda en la carpeta de
//! recibidos como `received_<id>_PostP.zip`.

use chrono::Utc;
use common::{
    bundle::validate_node_id, Connection, Incoming, TransportEvent, TransportListener,
    WorkerStats, ERROR_PREFIX, NODE_PREFIX, RECEIVED_PREFIX,
};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{lock, AppState, SessionMeta};

pub async fn serve_transport(listener: TransportListener, state: AppState) {
    if let Ok(addr) = listener.local_addr() {
        info!("transporte escuchando en {}", addr);
    }
    loop {
        match listener.accept().await {
            Ok((conn, incoming)) => {
                let st = state.clone();
                tokio::spawn(async move {
                    handle_session(conn, incoming, st).await;
                });
            }
            Err(e) => {
                warn!("accept falló: {}", e);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn send_bundle(conn: &Connection, state: &AppState, node_id: &str) {
    let result = match state.bundle_for(node_id) {
        Some(path) => conn.send_file_as(&path, &format!("{node_id}.zip")).await,
        None => {
            conn.send_text(&format!("{ERROR_PREFIX} no hay bundle para {node_id}"))
                .await
        }
    };
    if let Err(e) = result {
        warn!("no se pudo enviar el bundle a {}: {}", node_id, e);
    }
}

pub async fn handle_session(conn: Connection, mut incoming: Incoming, state: AppState) {
    let session_id = Uuid::new_v4();
    let peer = conn.peer_addr();
    lock(&state.sessions).insert(
        session_id,
        SessionMeta {
            peer,
            node_id: None,
            opened_at: Utc::now(),
        },
    );
    info!("sesión {} abierta con {}", session_id, peer);

    let mut node_id: Option<String> = None;
    while let Some(event) = incoming.next().await {
        match event {
            TransportEvent::Text(text) => {
                if let Some(id) = text.strip_prefix(NODE_PREFIX) {
                    let id = id.trim().to_string();
                    if let Err(e) = validate_node_id(&id) {
                        let _ = conn.send_text(&format!("{ERROR_PREFIX} {e}")).await;
                        continue;
                    }
                    info!("sesión {}: worker {}", session_id, id);
                    state.set_connected(&id, true);
                    if let Some(meta) = lock(&state.sessions).get_mut(&session_id) {
                        meta.node_id = Some(id.clone());
                    }
                    send_bundle(&conn, &state, &id).await;
                    node_id = Some(id);
                } else if let Some(stats) = WorkerStats::parse_message(&text) {
                    if let Some(id) = &node_id {
                        state.record_stats(id, stats);
                    }
                } else {
                    info!("[{}] {}", node_id.as_deref().unwrap_or("?"), text);
                }
            }
            TransportEvent::FileReceived { name, path, size } => {
                state.record_shard(node_id.as_deref(), path);
                let _ = conn
                    .send_text(&format!("{RECEIVED_PREFIX} {name} {size}"))
                    .await;
            }
            TransportEvent::Truncated {
                name,
                expected,
                received,
                cause,
            } => {
                warn!(
                    "shard {} descartado: {}/{} bytes ({:?})",
                    name, received, expected, cause
                );
            }
            TransportEvent::Malformed(reason) => warn!("sesión {}: {}", session_id, reason),
            TransportEvent::StoreFailed { name, reason } => {
                warn!("no se pudo guardar {}: {}", name, reason);
                let _ = conn
                    .send_text(&format!("{ERROR_PREFIX} no se pudo guardar {name}"))
                    .await;
            }
            TransportEvent::Closed { error } => {
                if let Some(e) = error {
                    warn!("sesión {} terminó con error: {}", session_id, e);
                }
                break;
            }
        }
    }

    let meta = lock(&state.sessions).remove(&session_id);
    if let Some(id) = &node_id {
        state.set_connected(id, false);
    }
    if let Some(meta) = meta {
        info!(
            "sesión {} con {} ({}) cerrada tras {}s",
            session_id,
            meta.peer,
            meta.node_id.as_deref().unwrap_or("sin nodo"),
            (Utc::now() - meta.opened_at).num_seconds()
        );
    }
}
