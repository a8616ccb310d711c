//! Partitioner: divide un corpus de texto en N particiones ordenadas.
//!
//! El corpus es la concatenación (en orden de nombre) de los archivos de un
//! directorio, con un '\n' entre archivos. Cada partición se materializa como
//! `chunk_<i>.txt` (i empieza en 1).

use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};

/// Granularidad de las unidades de texto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    Line,
    Token,
    Paragraph,
}

impl SplitMode {
    /// Parte el texto en unidades según el modo.
    /// - line: cada línea conserva su '\n' (si lo tenía)
    /// - token: separado por espacios en blanco
    /// - paragraph: bloques separados por línea en blanco, sin vacíos
    pub fn units(&self, text: &str) -> Vec<String> {
        match self {
            SplitMode::Line => text.split_inclusive('\n').map(str::to_string).collect(),
            SplitMode::Token => text.split_whitespace().map(str::to_string).collect(),
            SplitMode::Paragraph => text
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Vuelve a unir unidades con el separador original del modo.
    pub fn join(&self, units: &[String]) -> String {
        match self {
            SplitMode::Line => units.concat(),
            SplitMode::Token => units.join(" "),
            SplitMode::Paragraph => units.join("\n\n"),
        }
    }
}

impl FromStr for SplitMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" | "lines" | "1" => Ok(SplitMode::Line),
            "token" | "tokens" | "2" => Ok(SplitMode::Token),
            "paragraph" | "paragraphs" | "3" => Ok(SplitMode::Paragraph),
            other => Err(DispatchError::InvalidArgument(format!(
                "modo de partición desconocido: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitMode::Line => write!(f, "line"),
            SplitMode::Token => write!(f, "token"),
            SplitMode::Paragraph => write!(f, "paragraph"),
        }
    }
}

/// Cómo se reparten las unidades entre las N particiones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Tamaños difieren en a lo sumo 1; las primeras `U mod N` reciben la unidad extra.
    #[default]
    Balanced,
    /// Tamaño fijo `ceil(U/N)`; la última puede quedar corta y pueden salir menos de N.
    Ceil,
}

impl FromStr for Distribution {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(Distribution::Balanced),
            "ceil" => Ok(Distribution::Ceil),
            other => Err(DispatchError::InvalidArgument(format!(
                "distribución desconocida: {other:?}"
            ))),
        }
    }
}

/// Una partición del corpus, índice 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub mode: SplitMode,
    pub units: Vec<String>,
}

impl Partition {
    pub fn file_name(&self) -> String {
        chunk_file_name(self.index)
    }

    pub fn render(&self) -> String {
        self.mode.join(&self.units)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

pub fn chunk_file_name(index: usize) -> String {
    format!("chunk_{}.txt", index)
}

/// Rangos `[start, end)` de cada partición. Nunca produce particiones vacías.
pub fn partition_bounds(total_units: usize, n: usize, dist: Distribution) -> Vec<(usize, usize)> {
    if n == 0 || total_units == 0 {
        return Vec::new();
    }

    let mut out = Vec::new();
    match dist {
        Distribution::Balanced => {
            let base = total_units / n;
            let remainder = total_units % n;
            let mut start = 0;
            for i in 0..n {
                let size = base + usize::from(i < remainder);
                if size == 0 || start >= total_units {
                    break;
                }
                out.push((start, start + size));
                start += size;
            }
        }
        Distribution::Ceil => {
            let chunk_size = total_units.div_ceil(n);
            for i in 0..n {
                let start = i * chunk_size;
                if start >= total_units {
                    break;
                }
                out.push((start, (start + chunk_size).min(total_units)));
            }
        }
    }
    out
}

/// Split en memoria: devuelve hasta `n` particiones en orden del corpus.
pub fn split_text(text: &str, mode: SplitMode, n: usize, dist: Distribution) -> Result<Vec<Partition>> {
    if n < 1 {
        return Err(DispatchError::InvalidArgument(
            "el número de particiones debe ser al menos 1".to_string(),
        ));
    }

    let units = mode.units(text);
    let partitions = partition_bounds(units.len(), n, dist)
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| Partition {
            index: i + 1,
            mode,
            units: units[start..end].to_vec(),
        })
        .collect();

    Ok(partitions)
}

/// Archivos del corpus en orden de nombre (sólo el primer nivel, como un listado de directorio).
pub fn list_corpus_files(corpus_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(corpus_dir).map_err(|e| {
        DispatchError::MissingInput(format!(
            "no se pudo leer el corpus {}: {e}",
            corpus_dir.display()
        ))
    })?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(DispatchError::MissingInput(format!(
            "el corpus {} no contiene archivos",
            corpus_dir.display()
        )));
    }
    Ok(files)
}

/// Concatena los archivos del corpus con un '\n' entre cada uno.
pub fn read_corpus(corpus_dir: &Path) -> Result<String> {
    let files = list_corpus_files(corpus_dir)?;
    let mut texts = Vec::with_capacity(files.len());

    for path in &files {
        let text = fs::read_to_string(path).map_err(|e| {
            DispatchError::MissingInput(format!("no se pudo leer {}: {e}", path.display()))
        })?;
        texts.push(text);
    }

    debug!("corpus {} con {} archivos", corpus_dir.display(), files.len());
    Ok(texts.join("\n"))
}

/// Partición escrita en disco.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrittenPartition {
    pub index: usize,
    pub units: usize,
    pub path: PathBuf,
}

/// Resultado de `split_dir`: las particiones escritas y las que fallaron.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SplitReport {
    pub written: Vec<WrittenPartition>,
    /// (índice de partición, mensaje)
    pub failures: Vec<(usize, String)>,
}

impl SplitReport {
    pub fn produced(&self) -> usize {
        self.written.len()
    }

    pub fn path_for(&self, index: usize) -> Option<&Path> {
        self.written
            .iter()
            .find(|w| w.index == index)
            .map(|w| w.path.as_path())
    }
}

/// Lee `corpus_dir`, lo parte en `n` particiones y escribe `chunk_<i>.txt` en `output_dir`.
///
/// Un fallo al escribir una partición se reporta en `failures` y no detiene a las demás.
pub fn split_dir(
    corpus_dir: &Path,
    output_dir: &Path,
    mode: SplitMode,
    n: usize,
    dist: Distribution,
) -> Result<SplitReport> {
    if n < 1 {
        return Err(DispatchError::InvalidArgument(
            "el número de particiones debe ser al menos 1".to_string(),
        ));
    }

    let text = read_corpus(corpus_dir)?;
    let partitions = split_text(&text, mode, n, dist)?;

    fs::create_dir_all(output_dir)?;

    let mut report = SplitReport::default();
    for part in &partitions {
        let path = output_dir.join(part.file_name());
        match fs::write(&path, part.render()) {
            Ok(()) => report.written.push(WrittenPartition {
                index: part.index,
                units: part.len(),
                path,
            }),
            Err(e) => {
                warn!("error escribiendo partición {}: {}", part.index, e);
                report
                    .failures
                    .push((part.index, format!("{}: {e}", path.display())));
            }
        }
    }

    info!(
        "corpus dividido en {} particiones (pedidas={}, modo={}, fallidas={})",
        report.produced(),
        n,
        mode,
        report.failures.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ten_lines() -> String {
        (1..=10).map(|i| format!("linea {i}\n")).collect()
    }

    #[test]
    fn diez_lineas_en_tres_particiones_da_4_3_3() {
        let parts = split_text(&ten_lines(), SplitMode::Line, 3, Distribution::Balanced).unwrap();
        let sizes: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(parts[0].units[0], "linea 1\n");
        assert_eq!(parts[0].units[3], "linea 4\n");
        assert_eq!(parts[1].index, 2);
    }

    #[test]
    fn balanced_produce_min_n_u_particiones_y_reconstruye_el_corpus() {
        let tokens: Vec<String> = (0..17).map(|i| format!("t{i}")).collect();
        let text = tokens.join(" ");

        for n in 1..25 {
            let parts = split_text(&text, SplitMode::Token, n, Distribution::Balanced).unwrap();
            assert_eq!(parts.len(), n.min(17), "n={n}");

            let max = parts.iter().map(Partition::len).max().unwrap();
            let min = parts.iter().map(Partition::len).min().unwrap();
            assert!(max - min <= 1, "n={n}: tamaños desbalanceados");

            let rebuilt: Vec<String> = parts.into_iter().flat_map(|p| p.units).collect();
            assert_eq!(rebuilt, tokens);
        }
    }

    #[test]
    fn ceil_corta_antes_cuando_no_alcanzan_las_unidades() {
        // U=5, N=4 -> chunk=2 -> [2,2,1]
        assert_eq!(
            partition_bounds(5, 4, Distribution::Ceil),
            vec![(0, 2), (2, 4), (4, 5)]
        );
        assert_eq!(partition_bounds(10, 3, Distribution::Ceil), vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn n_cero_es_argumento_invalido() {
        let err = split_text("a b c", SplitMode::Token, 0, Distribution::Balanced).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn modo_paragraph_descarta_parrafos_vacios() {
        let text = "uno\nsigue\n\n\n\n  \n\ndos\n\ntres";
        let units = SplitMode::Paragraph.units(text);
        assert_eq!(units, vec!["uno\nsigue", "dos", "tres"]);

        let parts = split_text(text, SplitMode::Paragraph, 2, Distribution::Balanced).unwrap();
        assert_eq!(parts[0].render(), "uno\nsigue\n\ndos");
        assert_eq!(parts[1].render(), "tres");
    }

    #[test]
    fn split_mode_parsea_nombres_y_codigos_legacy() {
        assert_eq!("line".parse::<SplitMode>().unwrap(), SplitMode::Line);
        assert_eq!("2".parse::<SplitMode>().unwrap(), SplitMode::Token);
        assert_eq!("Paragraph".parse::<SplitMode>().unwrap(), SplitMode::Paragraph);
        assert!("sentence".parse::<SplitMode>().is_err());
    }

    #[test]
    fn split_dir_concatena_archivos_y_escribe_chunks() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(corpus.path().join("b.txt"), "tres cuatro").unwrap();
        fs::write(corpus.path().join("a.txt"), "uno dos").unwrap();

        let report = split_dir(corpus.path(), out.path(), SplitMode::Token, 2, Distribution::Balanced).unwrap();

        assert_eq!(report.produced(), 2);
        assert!(report.failures.is_empty());
        // a.txt va antes que b.txt
        assert_eq!(fs::read_to_string(out.path().join("chunk_1.txt")).unwrap(), "uno dos");
        assert_eq!(fs::read_to_string(out.path().join("chunk_2.txt")).unwrap(), "tres cuatro");
    }

    #[test]
    fn split_dir_con_mas_nodos_que_unidades_produce_menos_chunks() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(corpus.path().join("a.txt"), "x\ny\n").unwrap();

        let report = split_dir(corpus.path(), out.path(), SplitMode::Line, 5, Distribution::Balanced).unwrap();
        assert_eq!(report.produced(), 2);
        assert!(out.path().join("chunk_2.txt").exists());
        assert!(!out.path().join("chunk_3.txt").exists());
    }

    #[test]
    fn split_dir_sin_archivos_es_missing_input() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let err = split_dir(corpus.path(), out.path(), SplitMode::Line, 2, Distribution::Balanced).unwrap_err();
        assert!(matches!(err, DispatchError::MissingInput(_)));
    }

    #[test]
    fn split_dir_reporta_particion_que_no_se_puede_escribir() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(corpus.path().join("a.txt"), "a\nb\nc\n").unwrap();
        // un directorio con el nombre del chunk 2 impide escribir ese archivo
        fs::create_dir_all(out.path().join("chunk_2.txt")).unwrap();

        let report = split_dir(corpus.path(), out.path(), SplitMode::Line, 3, Distribution::Balanced).unwrap();
        assert_eq!(report.produced(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 2);
        assert!(report.path_for(3).is_some());
    }
}
