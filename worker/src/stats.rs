use common::WorkerStats;
use std::path::Path;
use sysinfo::{CpuExt, System, SystemExt};
use walkdir::WalkDir;

/// Tamaño total (KB) y cantidad de archivos bajo `dir`.
pub fn folder_usage(dir: &Path) -> (u64, u64) {
    let mut bytes = 0u64;
    let mut files = 0u64;
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if entry.file_type().is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (bytes / 1024, files)
}

/// CPU y RAM del host más el uso de la carpeta de trabajo.
pub fn collect(sys: &mut System, workdir: &Path) -> WorkerStats {
    sys.refresh_cpu();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_info().cpu_usage();
    let total = sys.total_memory();
    let ram_percent = if total == 0 {
        0.0
    } else {
        (sys.used_memory() as f64 / total as f64 * 100.0) as f32
    };
    let (folder_size_kb, file_count) = folder_usage(workdir);

    WorkerStats {
        cpu_percent,
        ram_percent,
        folder_size_kb,
        file_count,
    }
}
