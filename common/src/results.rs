//! Empaquetado de resultados del worker: `<node_id>_PostP.zip` con todo el
//! contenido de la carpeta de resultados bajo `<node_id>_PostProcess/`.
//! Los archivos del primer nivel se prefijan con `<node_id>_` para que los
//! shards de distintos nodos no colisionen al extraerse juntos.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::info;
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::bundle::validate_node_id;
use crate::error::{DispatchError, Result};

pub fn shard_file_name(node_id: &str) -> String {
    format!("{}_PostP.zip", node_id)
}

pub fn shard_dir_name(node_id: &str) -> String {
    format!("{}_PostProcess", node_id)
}

/// Resumen de lo empaquetado.
#[derive(Debug, Clone)]
pub struct PackagedShard {
    pub path: PathBuf,
    pub entries: Vec<String>,
}

pub fn package_results(results_dir: &Path, node_id: &str, out_dir: &Path) -> Result<PackagedShard> {
    validate_node_id(node_id)?;
    if !results_dir.is_dir() {
        return Err(DispatchError::MissingInput(format!(
            "carpeta de resultados inexistente: {}",
            results_dir.display()
        )));
    }

    fs::create_dir_all(out_dir)?;
    let path = out_dir.join(shard_file_name(node_id));
    let root = shard_dir_name(node_id);
    let mut entries = Vec::new();

    let mut zip = ZipWriter::new(File::create(&path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(results_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| DispatchError::MissingInput(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(results_dir).unwrap_or(entry.path());
        let mut parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        if parts.len() == 1 {
            parts[0] = format!("{}_{}", node_id, parts[0]);
        }
        let name = format!("{}/{}", root, parts.join("/"));
        zip.start_file(name.clone(), options)?;
        zip.write_all(&fs::read(entry.path())?)?;
        entries.push(name);
    }
    zip.finish()?;

    info!(
        "resultados de {} empaquetados en {} ({} archivos)",
        node_id,
        path.display(),
        entries.len()
    );
    Ok(PackagedShard { path, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{list_entries, unpack};
    use tempfile::TempDir;

    #[test]
    fn prefija_solo_el_primer_nivel() {
        let tmp = TempDir::new().unwrap();
        let results = tmp.path().join("PostProcess");
        fs::create_dir_all(results.join("extra")).unwrap();
        fs::write(results.join("embeddings.npy"), b"npy").unwrap();
        fs::write(results.join("extra").join("log.txt"), b"log").unwrap();

        let shard = package_results(&results, "n1", tmp.path()).unwrap();
        assert_eq!(shard.path, tmp.path().join("n1_PostP.zip"));
        assert_eq!(
            list_entries(&shard.path).unwrap(),
            vec![
                "n1_PostProcess/n1_embeddings.npy",
                "n1_PostProcess/extra/log.txt"
            ]
        );

        let dest = tmp.path().join("out");
        unpack(&shard.path, &dest).unwrap();
        assert_eq!(
            fs::read(dest.join("n1_PostProcess/n1_embeddings.npy")).unwrap(),
            b"npy"
        );
        // la carpeta original no se toca
        assert!(results.join("embeddings.npy").exists());
    }

    #[test]
    fn carpeta_inexistente_es_missing_input() {
        let tmp = TempDir::new().unwrap();
        let err = package_results(&tmp.path().join("nada"), "n1", tmp.path()).unwrap_err();
        assert!(matches!(err, DispatchError::MissingInput(_)));
    }
}
