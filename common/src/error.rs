//! Taxonomía de errores compartida por coordinator, worker y client.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Número de particiones inválido, modo desconocido, nombre de archivo con ':' ...
    #[error("argumento inválido: {0}")]
    InvalidArgument(String),

    /// Corpus vacío o ilegible, directorio fuente o bundle inexistente
    #[error("entrada faltante: {0}")]
    MissingInput(String),

    /// Falla a nivel de stream (lectura/escritura, handshake, timeout)
    #[error("error de transporte: {0}")]
    TransportError(String),

    /// Operación sobre una conexión ya cerrada
    #[error("conexión cerrada")]
    ConnectionClosed,

    /// Merge sin ningún vector
    #[error("ningún shard contiene vectores")]
    EmptyInput,

    /// Dos shards con distinta dimensionalidad por fila
    #[error("dimensión inconsistente en {path}: se esperaba {expected}, llegó {found}")]
    DimensionMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de archivo zip: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("artefacto de vectores inválido en {path}: {reason}")]
    Npy { path: PathBuf, reason: String },

    #[error("error de serialización: {0}")]
    Serialization(String),
}

impl DispatchError {
    /// Nombre estable del tipo de error, usado en las respuestas HTTP.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidArgument(_) => "InvalidArgument",
            DispatchError::MissingInput(_) => "MissingInput",
            DispatchError::TransportError(_) => "TransportError",
            DispatchError::ConnectionClosed => "ConnectionClosed",
            DispatchError::EmptyInput => "EmptyInput",
            DispatchError::DimensionMismatch { .. } => "DimensionMismatch",
            DispatchError::Io(_) => "Io",
            DispatchError::Archive(_) => "Archive",
            DispatchError::Npy { .. } => "Npy",
            DispatchError::Serialization(_) => "Serialization",
        }
    }

    /// Errores que invalidan la conexión completa (la mueven a Closed).
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            DispatchError::TransportError(_)
                | DispatchError::ConnectionClosed
                | DispatchError::Io(_)
        )
    }
}

impl From<bincode::Error> for DispatchError {
    fn from(e: bincode::Error) -> Self {
        DispatchError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
