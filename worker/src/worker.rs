use anyhow::{anyhow, bail, Context, Result};
use common::{
    bundle,
    config::{env_flag, env_or, env_string},
    package_results, Connection, Incoming, TransportConfig, TransportEvent, ERROR_PREFIX,
    NODE_PREFIX, RECEIVED_PREFIX,
};
use reqwest::Client;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use sysinfo::{System, SystemExt};
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};

use crate::stats;

const DEFAULT_BUNDLE_TIMEOUT_SECS: u64 = 120;
const RESULTS_DIR: &str = "PostProcess";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// host:puerto del listener de transporte del coordinator
    pub coordinator_addr: String,
    /// Base HTTP del coordinator (solo en modo WORKER_FETCH_HTTP)
    pub coordinator_url: String,
    pub node_id: String,
    pub workdir: PathBuf,
    /// Ejecutar el Makefile del bundle antes de empaquetar
    pub run_steps: bool,
    pub fetch_http: bool,
    /// Espera máxima por el bundle y por la confirmación del shard
    pub bundle_timeout: Duration,
    pub transport: TransportConfig,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let workdir = PathBuf::from(env_string("WORKER_WORKDIR", "./worker_data"));
        Self {
            coordinator_addr: env_string("COORDINATOR_ADDR", "localhost:5002"),
            coordinator_url: env_string("COORDINATOR_URL", "http://localhost:5000"),
            node_id: env_string("WORKER_NODE_ID", &host),
            transport: TransportConfig::from_env().with_download_dir(&workdir),
            workdir,
            run_steps: env_or("WORKER_RUN_STEPS", true),
            fetch_http: env_flag("WORKER_FETCH_HTTP"),
            bundle_timeout: Duration::from_secs(env_or(
                "WORKER_BUNDLE_TIMEOUT_SECS",
                DEFAULT_BUNDLE_TIMEOUT_SECS,
            )),
        }
    }

    fn node_dir(&self) -> PathBuf {
        self.workdir.join(&self.node_id)
    }
}

pub async fn run() -> Result<()> {
    let settings = WorkerSettings::from_env();
    bundle::validate_node_id(&settings.node_id)?;
    tokio::fs::create_dir_all(&settings.workdir)
        .await
        .with_context(|| format!("no se pudo crear {}", settings.workdir.display()))?;

    info!(
        "worker {} (workdir={}, pasos={})",
        settings.node_id,
        settings.workdir.display(),
        settings.run_steps
    );

    if settings.fetch_http {
        run_http(&settings).await
    } else {
        run_session(&settings).await
    }
}

/// Flujo completo sobre el transporte: presentarse, recibir el bundle,
/// procesarlo y devolver el shard.
pub async fn run_session(settings: &WorkerSettings) -> Result<()> {
    let (conn, mut incoming) =
        Connection::connect(settings.coordinator_addr.as_str(), settings.transport.clone())
            .await
            .with_context(|| format!("no se pudo conectar a {}", settings.coordinator_addr))?;
    info!("conectado a {}", conn.peer_addr());

    let outcome = session_steps(settings, &conn, &mut incoming).await;
    if let Err(e) = &outcome {
        let _ = conn.send_text(&format!("{ERROR_PREFIX} {e}")).await;
    }
    conn.close().await;
    outcome
}

async fn session_steps(
    settings: &WorkerSettings,
    conn: &Connection,
    incoming: &mut Incoming,
) -> Result<()> {
    conn.send_text(&format!("{NODE_PREFIX}{}", settings.node_id))
        .await?;

    let expected = bundle::bundle_file_name(&settings.node_id)?;
    let bundle_path = wait_for(settings.bundle_timeout, incoming, |event| match event {
        TransportEvent::FileReceived { name, path, .. } if name == expected => Some(Ok(path)),
        other => reject(other),
    })
    .await?;
    info!("bundle recibido en {}", bundle_path.display());

    let results = process_bundle(settings, &bundle_path).await?;

    let stats = collect_stats(settings.node_dir()).await?;
    conn.send_text(&stats.to_message()).await?;

    let shard = package(settings, results).await?;
    conn.send_file(&shard).await?;

    let shard_name = common::results::shard_file_name(&settings.node_id);
    wait_for(settings.bundle_timeout, incoming, |event| match event {
        TransportEvent::Text(text) if text.starts_with(RECEIVED_PREFIX) => {
            if text.split_whitespace().nth(1) == Some(shard_name.as_str()) {
                Some(Ok(()))
            } else {
                debug!("confirmación ajena: {}", text);
                None
            }
        }
        other => reject(other),
    })
    .await?;
    info!("shard {} confirmado por el coordinator", shard_name);
    Ok(())
}

/// Eventos que cortan la espera (`Some(Err)`) o se ignoran (`None`).
fn reject<T>(event: TransportEvent) -> Option<Result<T>> {
    match event {
        TransportEvent::Text(text) if text.starts_with(ERROR_PREFIX) => {
            Some(Err(anyhow!("el coordinator respondió: {text}")))
        }
        TransportEvent::Closed { error } => Some(Err(anyhow!(
            "conexión cerrada: {}",
            error.unwrap_or_else(|| "sin error".into())
        ))),
        TransportEvent::Truncated { name, cause, .. } => {
            Some(Err(anyhow!("{name} llegó incompleto ({cause:?})")))
        }
        TransportEvent::StoreFailed { name, reason } => {
            Some(Err(anyhow!("no se pudo guardar {name}: {reason}")))
        }
        other => {
            debug!("evento ignorado: {:?}", other);
            None
        }
    }
}

async fn wait_for<T>(
    limit: Duration,
    incoming: &mut Incoming,
    mut pick: impl FnMut(TransportEvent) -> Option<Result<T>>,
) -> Result<T> {
    let fut = async {
        while let Some(event) = incoming.next().await {
            if let Some(result) = pick(event) {
                return result;
            }
        }
        bail!("la conexión terminó sin respuesta")
    };
    timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("sin respuesta del coordinator tras {:?}", limit))?
}

/// Descomprime el bundle en `<workdir>/<node_id>` y, si corresponde, corre sus pasos.
/// Devuelve la carpeta de resultados.
async fn process_bundle(settings: &WorkerSettings, bundle_path: &Path) -> Result<PathBuf> {
    let node_dir = settings.node_dir();
    let archive = bundle_path.to_path_buf();
    let dest = node_dir.clone();
    tokio::task::spawn_blocking(move || bundle::unpack(&archive, &dest)).await??;
    info!("bundle descomprimido en {}", node_dir.display());

    if settings.run_steps {
        run_steps(&node_dir).await?;
    }
    Ok(node_dir.join(RESULTS_DIR))
}

async fn run_steps(node_dir: &Path) -> Result<()> {
    let server_files = node_dir.join(bundle::SERVER_FILES_DIR);
    info!("ejecutando pasos en {}", server_files.display());
    let status = Command::new("make")
        .arg("-C")
        .arg(&server_files)
        .arg("run")
        .status()
        .await
        .context("no se pudo lanzar make")?;
    if !status.success() {
        bail!(
            "los pasos fallaron ({}); ver {}",
            status,
            server_files.join(bundle::ERROR_LOG).display()
        );
    }
    Ok(())
}

async fn collect_stats(dir: PathBuf) -> Result<common::WorkerStats> {
    let stats = tokio::task::spawn_blocking(move || {
        let mut sys = System::new_all();
        stats::collect(&mut sys, &dir)
    })
    .await?;
    debug!("{}", stats.to_message());
    Ok(stats)
}

async fn package(settings: &WorkerSettings, results: PathBuf) -> Result<PathBuf> {
    if !results.is_dir() {
        bail!("sin resultados en {}", results.display());
    }
    let node_id = settings.node_id.clone();
    let out_dir = settings.workdir.clone();
    let shard =
        tokio::task::spawn_blocking(move || package_results(&results, &node_id, &out_dir))
            .await??;
    info!(
        "shard {} listo ({} archivos)",
        shard.path.display(),
        shard.entries.len()
    );
    Ok(shard.path)
}

/// Variante HTTP: baja el bundle de la API y sube el shard por POST.
pub async fn run_http(settings: &WorkerSettings) -> Result<()> {
    let client = Client::new();
    let base = settings.coordinator_url.trim_end_matches('/');

    let url = format!("{}/api/v1/bundles/{}", base, settings.node_id);
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        bail!(
            "GET {} devolvió {}: {}",
            url,
            resp.status(),
            resp.text().await.unwrap_or_default()
        );
    }
    let bytes = resp.bytes().await?;
    let bundle_path = settings
        .workdir
        .join(bundle::bundle_file_name(&settings.node_id)?);
    tokio::fs::write(&bundle_path, &bytes).await?;
    info!("bundle descargado ({} bytes)", bytes.len());

    let results = process_bundle(settings, &bundle_path).await?;
    let stats = collect_stats(settings.node_dir()).await?;
    info!("{}", stats.to_message());

    let shard = package(settings, results).await?;
    let name = shard
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let body = tokio::fs::read(&shard).await?;
    let resp = client
        .post(format!("{}/api/v1/results", base))
        .query(&[("name", name.as_str())])
        .body(body)
        .send()
        .await?;
    if !resp.status().is_success() {
        warn!("el coordinator rechazó el shard: {}", resp.status());
        bail!("subida fallida: {}", resp.text().await.unwrap_or_default());
    }
    info!("shard {} subido", name);
    Ok(())
}
