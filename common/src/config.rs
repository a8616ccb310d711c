use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Lee una variable de entorno y la parsea; si no existe o no parsea, usa `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/* --------- Transporte --------- */

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_HEADER_DELAY_MS: u64 = 500;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PAYLOAD_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HEADER_GRACE_MS: u64 = 200;

/// Parámetros de una conexión coordinator ⇄ worker.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Tamaño máximo de cada lectura/escritura del cuerpo de un archivo
    pub buffer_size: usize,
    /// Pausa entre el header `FILE:` y el cuerpo (peers legacy sin delimitador)
    pub header_delay: Duration,
    pub connect_timeout: Duration,
    /// Si un payload se detiene más que esto, se descarta como truncado
    pub payload_timeout: Duration,
    /// Cuánto esperar el resto de un header/mensaje sin '\n' antes de darlo por completo
    pub header_grace: Duration,
    /// Carpeta donde se escriben los `received_<nombre>`
    pub download_dir: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            header_delay: Duration::from_millis(DEFAULT_HEADER_DELAY_MS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            payload_timeout: Duration::from_secs(DEFAULT_PAYLOAD_TIMEOUT_SECS),
            header_grace: Duration::from_millis(DEFAULT_HEADER_GRACE_MS),
            download_dir: PathBuf::from("."),
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            buffer_size: env_or("TRANSPORT_BUFFER_SIZE", DEFAULT_BUFFER_SIZE).max(1),
            header_delay: Duration::from_millis(env_or(
                "TRANSPORT_HEADER_DELAY_MS",
                DEFAULT_HEADER_DELAY_MS,
            )),
            connect_timeout: Duration::from_secs(env_or(
                "TRANSPORT_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            payload_timeout: Duration::from_secs(env_or(
                "TRANSPORT_PAYLOAD_TIMEOUT_SECS",
                DEFAULT_PAYLOAD_TIMEOUT_SECS,
            )),
            header_grace: Duration::from_millis(env_or(
                "TRANSPORT_HEADER_GRACE_MS",
                DEFAULT_HEADER_GRACE_MS,
            )),
            download_dir: PathBuf::from(env_string("TRANSPORT_DOWNLOAD_DIR", ".")),
        }
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_usa_default_si_no_parsea() {
        env::set_var("CONFIG_TEST_BAD_NUMBER", "no-es-numero");
        assert_eq!(env_or("CONFIG_TEST_BAD_NUMBER", 7usize), 7);
        assert_eq!(env_or("CONFIG_TEST_NO_EXISTE", 3u64), 3);
    }

    #[test]
    fn env_or_respeta_valor_valido() {
        env::set_var("CONFIG_TEST_GOOD_NUMBER", " 42 ");
        assert_eq!(env_or("CONFIG_TEST_GOOD_NUMBER", 0u32), 42);
    }

    #[test]
    fn env_flag_acepta_1_y_true() {
        env::set_var("CONFIG_TEST_FLAG_A", "1");
        env::set_var("CONFIG_TEST_FLAG_B", "TRUE");
        env::set_var("CONFIG_TEST_FLAG_C", "nope");
        assert!(env_flag("CONFIG_TEST_FLAG_A"));
        assert!(env_flag("CONFIG_TEST_FLAG_B"));
        assert!(!env_flag("CONFIG_TEST_FLAG_C"));
    }
}
