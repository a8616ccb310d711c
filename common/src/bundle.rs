//! BundlePackager: arma `<node_id>.zip` con la partición, una copia del código
//! fuente y un Makefile que ejecuta los pasos en orden.
//!
//! Layout dentro del zip:
//!   PreProcess/<chunk_i.txt>
//!   ServerFiles/<árbol fuente...>
//!   ServerFiles/Makefile

use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{DispatchError, Result};

pub const PREPROCESS_DIR: &str = "PreProcess";
pub const SERVER_FILES_DIR: &str = "ServerFiles";
pub const RUN_SCRIPT_PATH: &str = "ServerFiles/Makefile";
pub const OUTPUT_LOG: &str = "output.log";
pub const ERROR_LOG: &str = "error.log";

/// Un paso de ejecución dentro del bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub command: String,
}

impl Step {
    pub fn new(description: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            command: command.into(),
        }
    }
}

/// Lista de pasos por defecto del coordinator.
pub fn default_steps() -> Vec<Step> {
    vec![Step::new(
        "Train QA model on chunked text",
        "source venv/bin/activate && python main.py",
    )]
}

/// Valida un node_id: se usa como nombre de archivo y dentro del header `FILE:`.
pub fn validate_node_id(node_id: &str) -> Result<()> {
    let bad = node_id.is_empty()
        || node_id == "."
        || node_id == ".."
        || node_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control() || c.is_whitespace());
    if bad {
        return Err(DispatchError::InvalidArgument(format!(
            "node_id inválido: {node_id:?}"
        )));
    }
    Ok(())
}

pub fn bundle_file_name(node_id: &str) -> Result<String> {
    validate_node_id(node_id)?;
    Ok(format!("{}.zip", node_id))
}

/// Genera el Makefile: un target `run` que anuncia y ejecuta cada paso,
/// acumulando stdout en output.log y stderr en error.log.
pub fn render_makefile(steps: &[Step]) -> Result<String> {
    let mut out = String::from(".PHONY: run\n\nrun:\n");
    for step in steps {
        if step.command.contains('\n') || step.description.contains('\n') {
            return Err(DispatchError::InvalidArgument(format!(
                "el paso {:?} contiene saltos de línea",
                step.description
            )));
        }
        // comillas simples: el shell no expande nada de la descripción
        let description = step.description.replace('\'', r"'\''");
        out.push_str(&format!(
            "\t@echo 'Executing {}'\n",
            escape_make(&description)
        ));
        out.push_str(&format!(
            "\t{} >> {} 2>> {}\n\n",
            escape_make(&step.command),
            OUTPUT_LOG,
            ERROR_LOG
        ));
    }
    Ok(out)
}

/// make expande `$` antes de pasarle la línea al shell.
fn escape_make(line: &str) -> String {
    line.replace('$', "$$")
}

/// Ruta relativa con '/' como separador (formato zip).
fn zip_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut it| it.next().is_some())
        .unwrap_or(false)
}

/// Empaqueta la partición para `node_id` y devuelve la ruta del zip.
///
/// Re-empaquetar el mismo nodo sobrescribe el bundle anterior.
pub fn package(
    partition_file: &Path,
    source_dir: &Path,
    node_id: &str,
    steps: &[Step],
    output_dir: &Path,
) -> Result<PathBuf> {
    let file_name = bundle_file_name(node_id)?;

    if !partition_file.is_file() {
        return Err(DispatchError::MissingInput(format!(
            "partición inexistente: {}",
            partition_file.display()
        )));
    }
    let partition_name = partition_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| {
            DispatchError::InvalidArgument(format!(
                "ruta de partición sin nombre: {}",
                partition_file.display()
            ))
        })?;
    let makefile = render_makefile(steps)?;

    fs::create_dir_all(output_dir)?;
    let final_path = output_dir.join(&file_name);
    let tmp_path = output_dir.join(format!("{}.tmp", file_name));

    {
        let mut zip = ZipWriter::new(File::create(&tmp_path)?);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.add_directory(format!("{}/", PREPROCESS_DIR), options)?;
        zip.start_file(format!("{}/{}", PREPROCESS_DIR, partition_name), options)?;
        zip.write_all(&fs::read(partition_file)?)?;

        if source_dir.is_dir() && dir_has_entries(source_dir) {
            let mut copied = 0usize;
            for entry in WalkDir::new(source_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    DispatchError::MissingInput(format!(
                        "no se pudo recorrer {}: {e}",
                        source_dir.display()
                    ))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(source_dir).unwrap_or(entry.path());
                let name = format!("{}/{}", SERVER_FILES_DIR, zip_path(rel));
                if name == RUN_SCRIPT_PATH {
                    // el Makefile generado tiene prioridad
                    continue;
                }
                zip.start_file(name, options)?;
                zip.write_all(&fs::read(entry.path())?)?;
                copied += 1;
            }
            debug!("{} archivos fuente copiados para {}", copied, node_id);
        } else {
            debug!(
                "directorio fuente {} ausente o vacío, se omite",
                source_dir.display()
            );
        }

        zip.start_file(RUN_SCRIPT_PATH, options)?;
        zip.write_all(makefile.as_bytes())?;
        zip.finish()?;
    }

    fs::rename(&tmp_path, &final_path)?;
    info!(
        "bundle {} listo ({} pasos, partición {})",
        final_path.display(),
        steps.len(),
        partition_name
    );
    Ok(final_path)
}

/// Nombres de las entradas del zip, en orden de almacenamiento.
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        names.push(archive.by_index(i)?.name().to_string());
    }
    Ok(names)
}

pub fn read_entry(archive_path: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Extrae un zip (bundle o shard) en `dest`.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<()> {
    if !archive_path.is_file() {
        return Err(DispatchError::MissingInput(format!(
            "{} no existe",
            archive_path.display()
        )));
    }
    fs::create_dir_all(dest)?;
    let mut archive = ZipArchive::new(File::open(archive_path)?)?;
    archive.extract(dest)?;
    debug!(
        "{} extraído en {} ({} entradas)",
        archive_path.display(),
        dest.display(),
        archive.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let chunk = tmp.path().join("chunk_1.txt");
        fs::write(&chunk, "linea 1\nlinea 2\n").unwrap();

        let src = tmp.path().join("mycmd");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("main.py"), "print('hola')\n").unwrap();
        fs::write(src.join("lib").join("helpdef.py"), "def f(): pass\n").unwrap();
        (tmp, chunk, src)
    }

    #[test]
    fn render_makefile_redirige_en_modo_append() {
        let mk = render_makefile(&[
            Step::new("Instalar", "pip install -r req.txt"),
            Step::new("Entrenar \"QA\"", "python main.py"),
        ])
        .unwrap();

        assert!(mk.starts_with(".PHONY: run\n\nrun:\n"));
        assert!(mk.contains("\t@echo 'Executing Instalar'\n"));
        assert!(mk.contains("\tpip install -r req.txt >> output.log 2>> error.log\n"));
        assert!(mk.contains("Executing Entrenar \"QA\""));
        // el orden de los pasos se respeta
        assert!(mk.find("pip install").unwrap() < mk.find("python main.py").unwrap());
    }

    #[test]
    fn render_makefile_escapa_variables_de_shell() {
        let mk = render_makefile(&[Step::new("Usa $VAR y 'comillas'", "echo $VAR-${VAR}")])
            .unwrap();
        assert!(mk.contains("\techo $$VAR-$${VAR} >> output.log 2>> error.log\n"));
        assert!(mk.contains(r"@echo 'Executing Usa $$VAR y '\''comillas'\'''"));
    }

    #[test]
    fn el_makefile_ejecuta_el_comando_tal_cual() {
        let tmp = TempDir::new().unwrap();
        let mk = render_makefile(&[Step::new(
            "Paso \"$DESC\"",
            "echo $BUNDLE_VAR-${BUNDLE_VAR}",
        )])
        .unwrap();
        fs::write(tmp.path().join("Makefile"), mk).unwrap();

        let out = match std::process::Command::new("make")
            .arg("-C")
            .arg(tmp.path())
            .arg("run")
            .env("BUNDLE_VAR", "valor")
            .env("DESC", "expandido")
            .output()
        {
            Ok(out) => out,
            // sin make en el host no hay nada que ejecutar
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => panic!("make: {e}"),
        };
        assert!(
            out.status.success(),
            "{}",
            String::from_utf8_lossy(&out.stderr)
        );
        assert!(String::from_utf8_lossy(&out.stdout).contains("Executing Paso \"$DESC\""));
        assert_eq!(
            fs::read_to_string(tmp.path().join(OUTPUT_LOG)).unwrap(),
            "valor-valor\n"
        );
    }

    #[test]
    fn render_makefile_rechaza_comandos_multilinea() {
        let err = render_makefile(&[Step::new("x", "echo a\necho b")]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }

    #[test]
    fn package_y_unpack_preservan_particion_y_fuente() {
        let (tmp, chunk, src) = fixture();
        let out = tmp.path().join("bundles");

        let bundle = package(&chunk, &src, "n1", &default_steps(), &out).unwrap();
        assert_eq!(bundle.file_name().unwrap(), "n1.zip");

        let dest = tmp.path().join("extraido");
        unpack(&bundle, &dest).unwrap();

        assert_eq!(
            fs::read(dest.join("PreProcess/chunk_1.txt")).unwrap(),
            fs::read(&chunk).unwrap()
        );
        assert_eq!(
            fs::read_to_string(dest.join("ServerFiles/main.py")).unwrap(),
            "print('hola')\n"
        );
        assert_eq!(
            fs::read_to_string(dest.join("ServerFiles/lib/helpdef.py")).unwrap(),
            "def f(): pass\n"
        );
        let mk = fs::read_to_string(dest.join("ServerFiles/Makefile")).unwrap();
        assert!(mk.contains("python main.py >> output.log 2>> error.log"));
    }

    #[test]
    fn list_entries_respeta_el_orden_de_escritura() {
        let (tmp, chunk, src) = fixture();
        let bundle = package(&chunk, &src, "n1", &[], &tmp.path().join("bundles")).unwrap();
        assert_eq!(
            list_entries(&bundle).unwrap(),
            vec![
                "PreProcess/",
                "PreProcess/chunk_1.txt",
                "ServerFiles/lib/helpdef.py",
                "ServerFiles/main.py",
                "ServerFiles/Makefile",
            ]
        );
    }

    #[test]
    fn reempaquetar_el_mismo_nodo_da_el_mismo_contenido_logico() {
        let (tmp, chunk, src) = fixture();
        let out = tmp.path().join("bundles");
        let steps = default_steps();

        let first = package(&chunk, &src, "n1", &steps, &out).unwrap();
        let entries_1 = list_entries(&first).unwrap();
        let script_1 = read_entry(&first, RUN_SCRIPT_PATH).unwrap();

        let second = package(&chunk, &src, "n1", &steps, &out).unwrap();
        assert_eq!(first, second);
        assert_eq!(list_entries(&second).unwrap(), entries_1);
        assert_eq!(read_entry(&second, RUN_SCRIPT_PATH).unwrap(), script_1);
        assert!(!out.join("n1.zip.tmp").exists());
    }

    #[test]
    fn sin_directorio_fuente_solo_lleva_particion_y_makefile() {
        let (tmp, chunk, _src) = fixture();
        let out = tmp.path().join("bundles");

        let bundle = package(&chunk, &tmp.path().join("no-existe"), "n2", &[], &out).unwrap();
        let entries = list_entries(&bundle).unwrap();
        assert_eq!(
            entries,
            vec!["PreProcess/", "PreProcess/chunk_1.txt", "ServerFiles/Makefile"]
        );
    }

    #[test]
    fn node_id_con_separadores_es_invalido() {
        let (tmp, chunk, src) = fixture();
        for bad in ["", "a/b", "a:b", "..", "con espacio"] {
            let err = package(&chunk, &src, bad, &[], tmp.path()).unwrap_err();
            assert!(matches!(err, DispatchError::InvalidArgument(_)), "{bad:?}");
        }
    }

    #[test]
    fn particion_inexistente_es_missing_input() {
        let (tmp, _chunk, src) = fixture();
        let err = package(&tmp.path().join("chunk_9.txt"), &src, "n1", &[], tmp.path()).unwrap_err();
        assert!(matches!(err, DispatchError::MissingInput(_)));
    }
}
