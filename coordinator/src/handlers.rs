use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    bundle::default_steps,
    merge::list_archives,
    package, split_dir,
    transport::frame::validate_file_name,
    BundleInfo, DispatchError, Distribution, ErrorResponse, MergeResponse,
    MergedIndex, NodeFailure, NodeInfo, SearchRequest, SearchResponse, SplitMode,
    StatusResponse, Step, SubmitNodesRequest, SubmitNodesResponse, UploadQuery,
    UploadResponse,
};
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{lock, AppState, CoordinatorConfig, NodeMeta};

pub fn build_router(state: AppState) -> Router {
    let max_upload = state.config.max_upload_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/nodes", post(submit_nodes).get(list_nodes))
        .route("/api/v1/bundles/:node_id", get(download_bundle))
        .route(
            "/api/v1/results",
            post(upload_result).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route("/api/v1/merge", post(run_merge))
        .route("/api/v1/search", post(search))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores HTTP ---------------- */

pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError(e)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError(DispatchError::Io(e))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError(DispatchError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("tarea bloqueante abortada: {e}"),
        )))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DispatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            DispatchError::MissingInput(_) => StatusCode::NOT_FOUND,
            DispatchError::EmptyInput => StatusCode::CONFLICT,
            DispatchError::DimensionMismatch { .. }
            | DispatchError::Npy { .. }
            | DispatchError::Archive(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::TransportError(_) | DispatchError::ConnectionClosed => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::Io(_) | DispatchError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        warn!("request fallido ({}): {}", self.0.kind(), self.0);
        let body = ErrorResponse {
            ok: false,
            kind: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (nodes, bundles) = {
        let nodes = lock(&state.nodes);
        (
            nodes.len(),
            nodes.values().filter(|m| m.bundle.is_some()).count(),
        )
    };
    let sessions = lock(&state.sessions).len();
    let received_shards = lock(&state.received).len().max(shards_on_disk(&state));
    let merged_rows = lock(&state.merged).as_ref().map(|m| m.rows());

    Json(StatusResponse {
        nodes,
        bundles,
        sessions,
        received_shards,
        merged_rows,
    })
}

/// Parte el corpus en `len(nodes)` particiones y arma un bundle por nodo.
/// Los nodos sin partición o con error de empaquetado se reportan en `failures`.
pub fn prepare_bundles(
    config: &CoordinatorConfig,
    nodes: &[String],
    mode: SplitMode,
    dist: Distribution,
    steps: &[Step],
) -> common::Result<SubmitNodesResponse> {
    let report = split_dir(
        &config.corpus_dir,
        &config.chunks_dir,
        mode,
        nodes.len(),
        dist,
    )?;

    let mut bundles = Vec::new();
    let mut failures = Vec::new();
    for (k, node_id) in nodes.iter().enumerate() {
        let index = k + 1;
        if let Some((_, msg)) = report.failures.iter().find(|(i, _)| *i == index) {
            failures.push(NodeFailure {
                node_id: node_id.clone(),
                message: format!("no se pudo escribir la partición {index}: {msg}"),
            });
            continue;
        }
        let Some(written) = report.written.iter().find(|w| w.index == index) else {
            failures.push(NodeFailure {
                node_id: node_id.clone(),
                message: "sin partición: hay más nodos que unidades en el corpus".into(),
            });
            continue;
        };
        match package(
            &written.path,
            &config.source_dir,
            node_id,
            steps,
            &config.bundles_dir,
        ) {
            Ok(path) => bundles.push(BundleInfo {
                node_id: node_id.clone(),
                partition: index,
                units: written.units,
                path: path.to_string_lossy().to_string(),
            }),
            Err(e) => {
                warn!("bundle para {} falló: {}", node_id, e);
                failures.push(NodeFailure {
                    node_id: node_id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(SubmitNodesResponse {
        ok: failures.is_empty(),
        nodes: nodes.to_vec(),
        chunks_created: report.produced(),
        bundles,
        failures,
    })
}

async fn submit_nodes(
    State(state): State<AppState>,
    Json(req): Json<SubmitNodesRequest>,
) -> Result<Json<SubmitNodesResponse>, ApiError> {
    if req.nodes.is_empty() {
        return Err(DispatchError::InvalidArgument("la lista de nodos está vacía".into()).into());
    }
    let mut seen = HashSet::new();
    if let Some(dup) = req.nodes.iter().find(|n| !seen.insert(n.as_str())) {
        return Err(DispatchError::InvalidArgument(format!("nodo repetido: {dup}")).into());
    }

    let config = state.config.clone();
    let mode = req.mode.unwrap_or(config.split_mode);
    let dist = req.distribution.unwrap_or(config.distribution);
    let steps = req.steps.clone().unwrap_or_else(default_steps);
    let nodes = req.nodes.clone();

    let response = tokio::task::spawn_blocking(move || {
        prepare_bundles(&config, &nodes, mode, dist, &steps)
    })
    .await??;

    {
        let wanted: HashSet<&String> = req.nodes.iter().collect();
        let mut nodes = lock(&state.nodes);
        nodes.retain(|id, meta| wanted.contains(id) || meta.connected);
        for id in &req.nodes {
            let meta = nodes.entry(id.clone()).or_insert_with(NodeMeta::new);
            meta.partition = None;
            meta.bundle = None;
        }
        for b in &response.bundles {
            if let Some(meta) = nodes.get_mut(&b.node_id) {
                meta.partition = Some(b.partition);
                meta.bundle = Some(PathBuf::from(&b.path));
            }
        }
    }
    *lock(&state.node_order) = req.nodes.clone();

    info!(
        "nodos recibidos: {} (particiones={}, bundles={}, fallidos={})",
        response.nodes.len(),
        response.chunks_created,
        response.bundles.len(),
        response.failures.len()
    );
    Ok(Json(response))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeInfo>> {
    let order = lock(&state.node_order).clone();
    let nodes = lock(&state.nodes);

    let mut ids: Vec<String> = order.into_iter().filter(|id| nodes.contains_key(id)).collect();
    let mut extra: Vec<String> = nodes
        .keys()
        .filter(|id| !ids.contains(id))
        .cloned()
        .collect();
    extra.sort();
    ids.extend(extra);

    let out = ids
        .into_iter()
        .filter_map(|id| {
            nodes.get(&id).map(|meta| NodeInfo {
                node_id: id.clone(),
                registered_at: meta.registered_at,
                partition: meta.partition,
                bundle: meta.bundle.as_ref().map(|p| p.to_string_lossy().to_string()),
                connected: meta.connected,
                shard: meta.shard.as_ref().map(|p| p.to_string_lossy().to_string()),
                last_stats: meta.last_stats.clone(),
            })
        })
        .collect();
    Json(out)
}

async fn download_bundle(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .bundle_for(&node_id)
        .ok_or_else(|| DispatchError::MissingInput(format!("no hay bundle para {node_id}")))?;
    let bytes = tokio::fs::read(&path).await?;
    info!("bundle de {} descargado ({} bytes)", node_id, bytes.len());

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", node_id),
        ),
    ];
    Ok((headers, bytes).into_response())
}

async fn upload_result(
    State(state): State<AppState>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    // sólo el último componente de la ruta
    let name = std::path::Path::new(&q.name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    validate_file_name(&name)?;

    let dir = state.config.received_dir.clone();
    tokio::fs::create_dir_all(&dir).await?;
    let part = dir.join(format!("{name}.part"));
    let path = dir.join(&name);
    tokio::fs::write(&part, &body).await?;
    tokio::fs::rename(&part, &path).await?;

    let node_id = name.strip_suffix("_PostP.zip").map(str::to_string);
    state.record_shard(node_id.as_deref(), path.clone());
    info!("shard {} recibido por HTTP ({} bytes)", name, body.len());

    Ok(Json(UploadResponse {
        ok: true,
        stored: path.to_string_lossy().to_string(),
        size: body.len() as u64,
    }))
}

async fn run_merge(State(state): State<AppState>) -> Result<Json<MergeResponse>, ApiError> {
    let dir = state.config.received_dir.clone();
    let outcome = tokio::task::spawn_blocking(move || common::merge(&dir)).await??;

    let response = MergeResponse {
        ok: true,
        archives: outcome.archives.len(),
        shards: outcome.shards,
        rows: outcome.merged.rows(),
        dim: outcome.merged.dim(),
    };
    *lock(&state.merged) = Some(Arc::new(outcome.merged));
    Ok(Json(response))
}

/// Índice en memoria; si no hay, se intenta cargar el último persistido.
async fn current_index(state: &AppState) -> Result<Arc<MergedIndex>, ApiError> {
    let cached = lock(&state.merged).clone();
    if let Some(merged) = cached {
        return Ok(merged);
    }
    let dir = state.config.received_dir.clone();
    let loaded = tokio::task::spawn_blocking(move || MergedIndex::load(&dir)).await??;
    let loaded = Arc::new(loaded);
    *lock(&state.merged) = Some(loaded.clone());
    Ok(loaded)
}

async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let merged = current_index(&state).await?;
    let hits = merged.search(&req.vector, req.k)?;
    Ok(Json(SearchResponse { hits }))
}

/// Cantidad de shards en disco (incluye los que llegaron antes de este proceso).
pub fn shards_on_disk(state: &AppState) -> usize {
    list_archives(&state.config.received_dir)
        .map(|a| a.len())
        .unwrap_or(0)
}
