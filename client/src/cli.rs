use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    config::env_string, transport::Outgoing, Connection, Distribution, ErrorResponse,
    MergeResponse, NodeInfo, SearchRequest, SearchResponse, SplitMode, StatusResponse,
    SubmitNodesRequest, SubmitNodesResponse, TransportConfig, TransportEvent, UploadResponse,
};
use reqwest::{Client, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

/// - En Docker: COORDINATOR_URL=http://coordinator:5000
/// - Local: default http://localhost:5000
fn coordinator_base_url() -> String {
    env_string("COORDINATOR_URL", "http://localhost:5000")
        .trim_end_matches('/')
        .to_string()
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para hablar con el coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Nodos registrados y sus bundles
    Nodes {
        #[command(subcommand)]
        action: NodesCommand,
    },
    /// Resumen del coordinator
    Status,
    /// Descarga el bundle de un nodo
    Bundle {
        #[arg(value_name = "NODE_ID")]
        node_id: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Sube un shard `<id>_PostP.zip` a la carpeta de recibidos
    Upload {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
    },
    /// Combina los shards recibidos en un único índice
    Merge,
    /// Vecinos más cercanos a un vector, ej: `search 0.1,0.2,0.3 --k 3`
    Search {
        #[arg(value_name = "VECTOR", value_delimiter = ',', allow_negative_numbers = true)]
        vector: Vec<f32>,
        #[arg(long, default_value_t = 5)]
        k: usize,
    },
    /// Sesión interactiva sobre el transporte: cada línea se envía como texto,
    /// `file:<ruta>` envía un archivo
    Session {
        #[arg(long, env = "COORDINATOR_ADDR", default_value = "localhost:5002")]
        addr: String,
        #[arg(long, default_value = ".")]
        download_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum NodesCommand {
    /// Registra los nodos y arma un bundle por nodo
    Submit {
        #[arg(value_name = "NODE_ID", required = true)]
        nodes: Vec<String>,
        /// line | token | paragraph
        #[arg(long)]
        mode: Option<SplitMode>,
        /// balanced | ceil
        #[arg(long)]
        distribution: Option<Distribution>,
    },
    List,
}

/// Corta con el mensaje estructurado del coordinator si la respuesta no es 2xx.
async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => bail!("{} ({}): {}", status, err.kind, err.message),
        Err(_) => bail!("{}: {}", status, body),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = coordinator_base_url();

    match cli.command {
        Commands::Nodes {
            action:
                NodesCommand::Submit {
                    nodes,
                    mode,
                    distribution,
                },
        } => {
            let url = format!("{}/api/v1/nodes", base_url);
            let req = SubmitNodesRequest {
                nodes,
                mode,
                distribution,
                steps: None,
            };
            let resp = check(client.post(&url).json(&req).send().await?).await?;
            let out: SubmitNodesResponse = resp.json().await?;

            println!("Nodos: {}", out.nodes.join(", "));
            println!("  chunks creados: {}", out.chunks_created);
            for b in &out.bundles {
                println!(
                    "  {} -> chunk_{}.txt ({} unidades) {}",
                    b.node_id, b.partition, b.units, b.path
                );
            }
            for f in &out.failures {
                println!("  FALLA {}: {}", f.node_id, f.message);
            }
        }

        Commands::Nodes {
            action: NodesCommand::List,
        } => {
            let url = format!("{}/api/v1/nodes", base_url);
            let resp = check(client.get(&url).send().await?).await?;
            let nodes: Vec<NodeInfo> = resp.json().await?;
            if nodes.is_empty() {
                println!("No hay nodos registrados.");
            }
            for n in nodes {
                println!("Nodo {}", n.node_id);
                println!("  registrado : {}", n.registered_at);
                println!("  conectado  : {}", n.connected);
                println!("  bundle     : {}", n.bundle.as_deref().unwrap_or("(sin bundle)"));
                println!("  shard      : {}", n.shard.as_deref().unwrap_or("(sin shard)"));
                if let Some(stats) = n.last_stats {
                    println!(
                        "  stats      : cpu={:.1}% ram={:.1}% {} KB en {} archivos",
                        stats.cpu_percent,
                        stats.ram_percent,
                        stats.folder_size_kb,
                        stats.file_count
                    );
                }
            }
        }

        Commands::Status => {
            let url = format!("{}/api/v1/status", base_url);
            let resp = check(client.get(&url).send().await?).await?;
            let s: StatusResponse = resp.json().await?;
            println!("Coordinator:");
            println!("  nodos     : {}", s.nodes);
            println!("  bundles   : {}", s.bundles);
            println!("  sesiones  : {}", s.sessions);
            println!("  shards    : {}", s.received_shards);
            match s.merged_rows {
                Some(rows) => println!("  índice    : {} filas", rows),
                None => println!("  índice    : (sin merge)"),
            }
        }

        Commands::Bundle { node_id, out } => {
            let url = format!("{}/api/v1/bundles/{}", base_url, node_id);
            let resp = check(client.get(&url).send().await?).await?;
            let bytes = resp.bytes().await?;
            tokio::fs::create_dir_all(&out).await?;
            let path = out.join(format!("{}.zip", node_id));
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("no se pudo escribir {}", path.display()))?;
            println!("Bundle guardado en {} ({} bytes)", path.display(), bytes.len());
        }

        Commands::Upload { file } => {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("ruta sin nombre de archivo")?;
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("no se pudo leer {}", file.display()))?;
            let url = format!("{}/api/v1/results", base_url);
            let resp = check(
                client
                    .post(&url)
                    .query(&[("name", name.as_str())])
                    .body(body)
                    .send()
                    .await?,
            )
            .await?;
            let out: UploadResponse = resp.json().await?;
            println!("Shard guardado como {} ({} bytes)", out.stored, out.size);
        }

        Commands::Merge => {
            let url = format!("{}/api/v1/merge", base_url);
            let resp = check(client.post(&url).send().await?).await?;
            let out: MergeResponse = resp.json().await?;
            println!(
                "Merge: {} archivos, {} shards, {} filas de dimensión {}",
                out.archives, out.shards, out.rows, out.dim
            );
        }

        Commands::Search { vector, k } => {
            let url = format!("{}/api/v1/search", base_url);
            let resp =
                check(client.post(&url).json(&SearchRequest { vector, k }).send().await?).await?;
            let out: SearchResponse = resp.json().await?;
            if out.hits.is_empty() {
                println!("(sin resultados)");
            }
            for hit in out.hits {
                println!("#{} d={:.4}  {}", hit.row, hit.distance, hit.text);
            }
        }

        Commands::Session { addr, download_dir } => {
            session(&addr, download_dir).await?;
        }
    }

    Ok(())
}

/// Envía las líneas de stdin por el transporte e imprime lo que llega.
async fn session(addr: &str, download_dir: PathBuf) -> Result<()> {
    let config = TransportConfig::from_env().with_download_dir(download_dir);
    let (conn, mut incoming) = Connection::connect(addr, config).await?;
    println!("Conectado a {}", conn.peer_addr());

    let printer = tokio::spawn(async move {
        while let Some(event) = incoming.next().await {
            match event {
                TransportEvent::Text(t) => println!("< {}", t),
                TransportEvent::FileReceived { name, path, size } => {
                    println!("< archivo {} ({} bytes) en {}", name, size, path.display())
                }
                TransportEvent::Closed { error } => {
                    println!("< conexión cerrada{}", error.map(|e| format!(": {e}")).unwrap_or_default());
                    break;
                }
                other => println!("< {:?}", other),
            }
        }
    });

    let (tx, sender) = conn.spawn_sender();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if !line.trim().is_empty() => {
                        if tx.send(Outgoing::parse_line(&line)).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = conn.closed() => break,
        }
    }

    drop(tx);
    if let Ok(Err(e)) = sender.await {
        eprintln!("envío interrumpido: {e}");
    }
    conn.close().await;
    let _ = printer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_parsea_vector_separado_por_comas() {
        let cli = Cli::try_parse_from(["client", "search", "0.5,-1,2", "--k", "3"]).unwrap();
        match cli.command {
            Commands::Search { vector, k } => {
                assert_eq!(vector, vec![0.5, -1.0, 2.0]);
                assert_eq!(k, 3);
            }
            _ => panic!("subcomando inesperado"),
        }
    }

    #[test]
    fn nodes_submit_acepta_modo_y_distribucion() {
        let cli = Cli::try_parse_from([
            "client", "nodes", "submit", "n1", "n2", "--mode", "token", "--distribution", "ceil",
        ])
        .unwrap();
        match cli.command {
            Commands::Nodes {
                action:
                    NodesCommand::Submit {
                        nodes,
                        mode,
                        distribution,
                    },
            } => {
                assert_eq!(nodes, vec!["n1", "n2"]);
                assert_eq!(mode, Some(SplitMode::Token));
                assert_eq!(distribution, Some(Distribution::Ceil));
            }
            _ => panic!("subcomando inesperado"),
        }
        assert!(Cli::try_parse_from(["client", "nodes", "submit"]).is_err());
    }
}
