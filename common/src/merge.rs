//! ShardMerger: junta los shards de resultados (vectores + texto) recibidos de
//! los workers en una sola matriz y un índice de similitud.
//!
//! Orden: los `.zip` de la carpeta de recibidos en orden de nombre; dentro de
//! cada uno, sus directorios y luego sus `.npy` también por nombre. La fila `r`
//! de la matriz y el texto `r` siempre vienen del mismo shard y fila local.

use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bundle::unpack;
use crate::error::{DispatchError, Result};
use crate::index::{FlatL2Index, Neighbor, VectorIndex};

pub const MERGED_DIR: &str = "merged";
pub const MATRIX_FILE: &str = "merged_embeddings.npy";
pub const INDEX_FILE: &str = "final_index.bin";
pub const TEXTS_FILE: &str = "merged_texts.json";

/// Vectores de un artefacto `.npy` y sus textos, alineados fila a fila.
#[derive(Debug, Clone)]
pub struct ResultShard {
    pub source: PathBuf,
    pub vectors: Array2<f32>,
    pub texts: Vec<String>,
}

impl ResultShard {
    pub fn rows(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }
}

pub fn placeholder(row: usize) -> String {
    format!("Chunk {}", row)
}

/// Alinea el texto emparejado con las filas: una línea por fila. Si sobran
/// filas se completan con placeholders; si sobran líneas se descartan.
pub fn align_texts(raw: Option<&str>, rows: usize, source: &Path) -> Vec<String> {
    let Some(raw) = raw else {
        return (0..rows).map(placeholder).collect();
    };
    let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
    if rows == 1 && lines.len() > 1 {
        // un solo vector: el archivo entero es su texto
        return vec![raw.trim_end_matches('\n').to_string()];
    }
    if lines.len() != rows {
        warn!(
            "{}: {} líneas de texto para {} vectores, se alinean por posición",
            source.display(),
            lines.len(),
            rows
        );
    }
    lines.truncate(rows);
    while lines.len() < rows {
        lines.push(placeholder(lines.len()));
    }
    lines
}

/// Lee un `.npy` como matriz f32. Acepta f32/f64 y vectores 1-D (una fila).
pub fn load_vectors(path: &Path) -> Result<Array2<f32>> {
    let npy_err = |reason: String| DispatchError::Npy {
        path: path.to_path_buf(),
        reason,
    };
    let first = match read_npy::<_, Array2<f32>>(path) {
        Ok(a) => return Ok(a),
        Err(e) => e.to_string(),
    };
    if let Ok(a) = read_npy::<_, Array2<f64>>(path) {
        return Ok(a.mapv(|v| v as f32));
    }
    if let Ok(a) = read_npy::<_, Array1<f32>>(path) {
        let n = a.len();
        return a.into_shape((1, n)).map_err(|e| npy_err(e.to_string()));
    }
    if let Ok(a) = read_npy::<_, Array1<f64>>(path) {
        let n = a.len();
        return a
            .mapv(|v| v as f32)
            .into_shape((1, n))
            .map_err(|e| npy_err(e.to_string()));
    }
    Err(npy_err(first))
}

/// Carga todos los pares (`.npy`, `.txt`) bajo `dir`, en orden de nombre.
pub fn load_shards(dir: &Path) -> Result<Vec<ResultShard>> {
    let mut shards = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| DispatchError::MissingInput(e.to_string()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("npy") {
            continue;
        }
        let vectors = load_vectors(path)?;
        let txt_path = path.with_extension("txt");
        let raw = if txt_path.is_file() {
            Some(fs::read_to_string(&txt_path)?)
        } else {
            None
        };
        let texts = align_texts(raw.as_deref(), vectors.nrows(), path);
        debug!("shard {}: {} filas", path.display(), vectors.nrows());
        shards.push(ResultShard {
            source: path.to_path_buf(),
            vectors,
            texts,
        });
    }
    Ok(shards)
}

/// Matriz, textos e índice resultantes de un merge.
#[derive(Debug, Clone)]
pub struct MergedIndex {
    pub matrix: Array2<f32>,
    pub texts: Vec<String>,
    pub index: FlatL2Index,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub row: usize,
    pub distance: f32,
    pub text: String,
}

impl MergedIndex {
    /// Apila los shards en el orden recibido y construye el índice.
    pub fn from_shards(shards: &[ResultShard]) -> Result<Self> {
        let non_empty: Vec<&ResultShard> = shards.iter().filter(|s| s.rows() > 0).collect();
        let Some(first) = non_empty.first() else {
            return Err(DispatchError::EmptyInput);
        };
        let dim = first.dim();
        for shard in &non_empty {
            if shard.dim() != dim {
                return Err(DispatchError::DimensionMismatch {
                    path: shard.source.clone(),
                    expected: dim,
                    found: shard.dim(),
                });
            }
        }

        let views: Vec<ArrayView2<'_, f32>> = non_empty.iter().map(|s| s.vectors.view()).collect();
        let matrix = concatenate(Axis(0), &views).map_err(|e| DispatchError::Npy {
            path: first.source.clone(),
            reason: e.to_string(),
        })?;
        let texts: Vec<String> = non_empty
            .iter()
            .flat_map(|s| s.texts.iter().cloned())
            .collect();

        let mut index = FlatL2Index::new(dim);
        index.add(matrix.view())?;
        Ok(Self {
            matrix,
            texts,
            index,
        })
    }

    pub fn rows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let hits: Vec<Neighbor> = self.index.search(query, k)?;
        Ok(hits
            .into_iter()
            .map(|n| SearchHit {
                row: n.id,
                distance: n.distance,
                text: self.texts.get(n.id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    /// Guarda matriz, índice y textos por separado en `dir`.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let matrix_path = dir.join(MATRIX_FILE);
        write_npy(&matrix_path, &self.matrix).map_err(|e| DispatchError::Npy {
            path: matrix_path.clone(),
            reason: e.to_string(),
        })?;
        self.index.save(&dir.join(INDEX_FILE))?;
        fs::write(dir.join(TEXTS_FILE), serde_json::to_vec_pretty(&self.texts)?)?;
        Ok(())
    }

    /// Recarga lo guardado por `persist`. Si el índice falta o está dañado se
    /// reconstruye desde la matriz.
    pub fn load(dir: &Path) -> Result<Self> {
        let matrix_path = dir.join(MATRIX_FILE);
        if !matrix_path.is_file() {
            return Err(DispatchError::MissingInput(format!(
                "{} no existe",
                matrix_path.display()
            )));
        }
        let matrix = load_vectors(&matrix_path)?;
        let texts: Vec<String> = match fs::read(dir.join(TEXTS_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(_) => (0..matrix.nrows()).map(placeholder).collect(),
        };
        let index = match FlatL2Index::load(&dir.join(INDEX_FILE)) {
            Ok(idx) if idx.len() == matrix.nrows() && idx.dim() == matrix.ncols() => idx,
            _ => {
                warn!("índice ausente o desactualizado en {}, se reconstruye", dir.display());
                let mut idx = FlatL2Index::new(matrix.ncols());
                idx.add(matrix.view())?;
                idx
            }
        };
        Ok(Self {
            matrix,
            texts,
            index,
        })
    }
}

/// Resultado de `merge` para reportar al llamador.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub archives: Vec<PathBuf>,
    pub shards: usize,
    pub merged: MergedIndex,
}

/// Archivos `*.zip` de `received_dir`, ordenados por nombre.
pub fn list_archives(received_dir: &Path) -> Result<Vec<PathBuf>> {
    if !received_dir.is_dir() {
        return Ok(Vec::new());
    }
    let pattern = format!(
        "{}/*.zip",
        glob::Pattern::escape(&received_dir.to_string_lossy())
    );
    let mut archives: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| DispatchError::InvalidArgument(e.to_string()))?
        .filter_map(|p| p.ok())
        .filter(|p| p.is_file())
        .collect();
    archives.sort();
    Ok(archives)
}

/// Extrae cada shard de `received_dir` en `received_dir/merged/<nombre>/`,
/// los combina y persiste el resultado en `received_dir`.
pub fn merge(received_dir: &Path) -> Result<MergeOutcome> {
    let archives = list_archives(received_dir)?;
    let work = received_dir.join(MERGED_DIR);
    if work.exists() {
        fs::remove_dir_all(&work)?;
    }
    fs::create_dir_all(&work)?;

    let mut shards = Vec::new();
    for archive in &archives {
        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "shard".to_string());
        let dest = work.join(stem);
        unpack(archive, &dest)?;
        shards.extend(load_shards(&dest)?);
    }

    let merged = MergedIndex::from_shards(&shards)?;
    merged.persist(received_dir)?;
    info!(
        "merge listo: {} archivos, {} shards, matriz {}x{}",
        archives.len(),
        shards.len(),
        merged.rows(),
        merged.dim()
    );
    Ok(MergeOutcome {
        archives,
        shards: shards.len(),
        merged,
    })
}
