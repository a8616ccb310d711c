// coordinator/src/state.rs

use chrono::{DateTime, Utc};
use common::{
    config::{env_or, env_string},
    Distribution, MergedIndex, NodeId, SplitMode, TransportConfig, WorkerStats,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

/// Rutas y direcciones del coordinator, leídas del entorno.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub http_addr: String,
    pub transport_addr: String,
    pub corpus_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub source_dir: PathBuf,
    pub bundles_dir: PathBuf,
    pub received_dir: PathBuf,
    pub split_mode: SplitMode,
    pub distribution: Distribution,
    pub max_upload_bytes: usize,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self {
            http_addr: env_string("COORDINATOR_HTTP_ADDR", "0.0.0.0:5000"),
            transport_addr: env_string("COORDINATOR_TRANSPORT_ADDR", "0.0.0.0:5002"),
            corpus_dir: PathBuf::from(env_string("COORDINATOR_CORPUS_DIR", "mydata")),
            chunks_dir: PathBuf::from(env_string("COORDINATOR_CHUNKS_DIR", "temp_input")),
            source_dir: PathBuf::from(env_string("COORDINATOR_SOURCE_DIR", "mycmd")),
            bundles_dir: PathBuf::from(env_string("COORDINATOR_BUNDLES_DIR", "bundles")),
            received_dir: PathBuf::from(env_string("COORDINATOR_RECEIVED_DIR", "receivedd")),
            split_mode: env_or("COORDINATOR_SPLIT_MODE", SplitMode::Line),
            distribution: env_or("COORDINATOR_DISTRIBUTION", Distribution::Balanced),
            max_upload_bytes: env_or("COORDINATOR_MAX_UPLOAD_MB", 512usize) * 1024 * 1024,
        }
    }

    /// Todas las carpetas bajo `root` (tests y ejecuciones aisladas).
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            http_addr: "127.0.0.1:0".into(),
            transport_addr: "127.0.0.1:0".into(),
            corpus_dir: root.join("mydata"),
            chunks_dir: root.join("temp_input"),
            source_dir: root.join("mycmd"),
            bundles_dir: root.join("bundles"),
            received_dir: root.join("receivedd"),
            split_mode: SplitMode::Line,
            distribution: Distribution::Balanced,
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }

    /// Los payloads recibidos por el transporte caen en la carpeta de recibidos.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig::from_env().with_download_dir(self.received_dir.clone())
    }
}

#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub registered_at: DateTime<Utc>,
    pub partition: Option<usize>,
    pub bundle: Option<PathBuf>,
    pub connected: bool,
    pub shard: Option<PathBuf>,
    pub last_stats: Option<WorkerStats>,
}

impl NodeMeta {
    pub fn new() -> Self {
        Self {
            registered_at: Utc::now(),
            partition: None,
            bundle: None,
            connected: false,
            shard: None,
            last_stats: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub peer: SocketAddr,
    pub node_id: Option<NodeId>,
    pub opened_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CoordinatorConfig>,
    pub nodes: Arc<Mutex<HashMap<NodeId, NodeMeta>>>,
    // orden en que se enviaron los nodos (= orden de particiones)
    pub node_order: Arc<Mutex<Vec<NodeId>>>,
    pub sessions: Arc<Mutex<HashMap<Uuid, SessionMeta>>>,
    pub received: Arc<Mutex<Vec<PathBuf>>>,
    pub merged: Arc<Mutex<Option<Arc<MergedIndex>>>>,
}

impl AppState {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config: Arc::new(config),
            nodes: Arc::new(Mutex::new(HashMap::new())),
            node_order: Arc::new(Mutex::new(Vec::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            received: Arc::new(Mutex::new(Vec::new())),
            merged: Arc::new(Mutex::new(None)),
        }
    }

    pub fn bundle_for(&self, node_id: &str) -> Option<PathBuf> {
        lock(&self.nodes).get(node_id).and_then(|m| m.bundle.clone())
    }

    pub fn set_connected(&self, node_id: &str, connected: bool) {
        let mut nodes = lock(&self.nodes);
        let meta = nodes.entry(node_id.to_string()).or_insert_with(NodeMeta::new);
        meta.connected = connected;
    }

    pub fn record_stats(&self, node_id: &str, stats: WorkerStats) {
        if let Some(meta) = lock(&self.nodes).get_mut(node_id) {
            meta.last_stats = Some(stats);
        }
    }

    /// Registra un shard recibido (por transporte o por HTTP).
    pub fn record_shard(&self, node_id: Option<&str>, path: PathBuf) {
        if let Some(id) = node_id {
            if let Some(meta) = lock(&self.nodes).get_mut(id) {
                meta.shard = Some(path.clone());
            }
        }
        let mut received = lock(&self.received);
        if !received.contains(&path) {
            received.push(path);
        }
    }
}

/// Lock que sobrevive a un panic de otro handler: el estado sigue siendo legible.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
