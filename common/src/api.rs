use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bundle::Step;
use crate::merge::SearchHit;
use crate::partition::{Distribution, SplitMode};

pub type NodeId = String;

/* --------- Envío de nodos y bundles --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitNodesRequest {
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub mode: Option<SplitMode>,
    #[serde(default)]
    pub distribution: Option<Distribution>,
    /// Si no viene, se usan los pasos por defecto del coordinator
    #[serde(default)]
    pub steps: Option<Vec<Step>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInfo {
    pub node_id: NodeId,
    pub partition: usize,
    pub units: usize,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitNodesResponse {
    pub ok: bool,
    pub nodes: Vec<NodeId>,
    pub chunks_created: usize,
    pub bundles: Vec<BundleInfo>,
    pub failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub registered_at: DateTime<Utc>,
    pub partition: Option<usize>,
    pub bundle: Option<String>,
    pub connected: bool,
    pub shard: Option<String>,
    pub last_stats: Option<WorkerStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub nodes: usize,
    pub bundles: usize,
    pub sessions: usize,
    pub received_shards: usize,
    pub merged_rows: Option<usize>,
}

/* --------- Resultados, merge y búsqueda --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadQuery {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub stored: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResponse {
    pub ok: bool,
    pub archives: usize,
    pub shards: usize,
    pub rows: usize,
    pub dim: usize,
}

fn default_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    #[serde(default = "default_k")]
    pub k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub kind: String,
    pub message: String,
}

/* --------- Mensajes de control sobre el transporte --------- */

/// `NODE:<id>`: el worker se presenta y pide su bundle.
pub const NODE_PREFIX: &str = "NODE:";
/// `RECEIVED <nombre> <bytes>`: confirmación de un shard recibido.
pub const RECEIVED_PREFIX: &str = "RECEIVED";
pub const ERROR_PREFIX: &str = "ERROR";

/* --------- Estadísticas del worker --------- */

pub const STATS_PREFIX: &str = "STATS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub folder_size_kb: u64,
    pub file_count: u64,
}

impl WorkerStats {
    /// `STATS cpu=12.5 ram=40.0 size_kb=120 files=8`
    pub fn to_message(&self) -> String {
        format!(
            "{} cpu={:.1} ram={:.1} size_kb={} files={}",
            STATS_PREFIX, self.cpu_percent, self.ram_percent, self.folder_size_kb, self.file_count
        )
    }

    pub fn parse_message(msg: &str) -> Option<WorkerStats> {
        let rest = msg.strip_prefix(STATS_PREFIX)?.trim();
        let mut stats = WorkerStats {
            cpu_percent: 0.0,
            ram_percent: 0.0,
            folder_size_kb: 0,
            file_count: 0,
        };
        for field in rest.split_whitespace() {
            let (key, value) = field.split_once('=')?;
            match key {
                "cpu" => stats.cpu_percent = value.parse().ok()?,
                "ram" => stats.ram_percent = value.parse().ok()?,
                "size_kb" => stats.folder_size_kb = value.parse().ok()?,
                "files" => stats.file_count = value.parse().ok()?,
                _ => {}
            }
        }
        Some(stats)
    }
}
