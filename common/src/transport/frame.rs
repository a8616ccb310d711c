//! Framing del protocolo coordinator ⇄ worker.
//!
//! Texto: una línea UTF-8 terminada en '\n'.
//! Archivo: `FILE:<nombre>:<tamaño>\n` seguido de exactamente `<tamaño>` bytes.
//!
//! El decoder no hace E/S: recibe bytes con `push` y entrega frames con
//! `decode`. Cuando un header o una línea llegan sin '\n' (peers legacy), la
//! conexión llama a `flush` al vencer el período de gracia.

use crate::error::{DispatchError, Result};

pub const FILE_PREFIX: &str = "FILE:";
/// Largo máximo de un header `FILE:` sin terminar antes de descartarlo.
pub const MAX_HEADER_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

/// Nombres de payload: sin ':' (rompe el header) ni separadores de ruta
/// (el receptor escribe `received_<nombre>` en su carpeta de descarga).
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name
            .chars()
            .any(|c| c == ':' || c == '/' || c == '\\' || c.is_control())
    {
        return Err(DispatchError::InvalidArgument(format!(
            "nombre de archivo inválido para el header: {name:?}"
        )));
    }
    Ok(())
}

pub fn encode_file_header(name: &str, size: u64) -> Result<Vec<u8>> {
    validate_file_name(name)?;
    Ok(format!("{}{}:{}\n", FILE_PREFIX, name, size).into_bytes())
}

/// Codifica un mensaje de texto. Ninguna de sus líneas puede empezar con `FILE:`.
pub fn encode_text(text: &str) -> Result<Vec<u8>> {
    if text.lines().any(|l| l.starts_with(FILE_PREFIX)) {
        return Err(DispatchError::InvalidArgument(format!(
            "el prefijo {FILE_PREFIX} está reservado para archivos"
        )));
    }
    let mut out = text.as_bytes().to_vec();
    if !text.ends_with('\n') {
        out.push(b'\n');
    }
    Ok(out)
}

/// Parsea `FILE:<nombre>:<tamaño>` (sin el '\n').
pub fn parse_file_header(raw: &str) -> std::result::Result<FileHeader, String> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = raw.split(':').collect();
    if fields.len() != 3 || fields[0] != "FILE" {
        return Err(format!(
            "header con {} campos, se esperaban 3: {raw:?}",
            fields.len()
        ));
    }
    let name = fields[1];
    if validate_file_name(name).is_err() {
        return Err(format!("nombre inválido en header: {name:?}"));
    }
    let size = fields[2]
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("tamaño no numérico en header: {:?}", fields[2]))?;
    Ok(FileHeader {
        name: name.to_string(),
        size,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    FileStart(FileHeader),
    /// Un tramo del cuerpo; `done` marca el último.
    FileData { data: Vec<u8>, done: bool },
    Malformed(String),
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    /// Bytes del cuerpo que faltan, si hay un archivo en curso.
    remaining: Option<u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn in_payload(&self) -> bool {
        self.remaining.is_some()
    }

    pub fn remaining_payload(&self) -> Option<u64> {
        self.remaining
    }

    /// Hay bytes fuera de un payload esperando su '\n'.
    pub fn has_partial(&self) -> bool {
        self.remaining.is_none() && !self.pending.is_empty()
    }

    /// Abandona el payload en curso (timeout). Lo que llegue después se
    /// interpreta como frames nuevos.
    pub fn abort_payload(&mut self) {
        self.remaining = None;
    }

    pub fn decode(&mut self) -> Option<Frame> {
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                self.remaining = None;
                return Some(Frame::FileData {
                    data: Vec::new(),
                    done: true,
                });
            }
            if self.pending.is_empty() {
                return None;
            }
            let take = (remaining.min(self.pending.len() as u64)) as usize;
            let data: Vec<u8> = self.pending.drain(..take).collect();
            let left = remaining - take as u64;
            self.remaining = if left == 0 { None } else { Some(left) };
            return Some(Frame::FileData {
                data,
                done: left == 0,
            });
        }

        loop {
            if self.pending.is_empty() {
                return None;
            }
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..pos]).to_string();
                let line = line.trim_end_matches('\r');
                if line.starts_with(FILE_PREFIX) {
                    return Some(self.header_frame(line));
                }
                if line.is_empty() {
                    continue;
                }
                return Some(Frame::Text(line.to_string()));
            }

            // sin '\n' todavía
            let prefix = FILE_PREFIX.as_bytes();
            let maybe_header = self.pending.starts_with(prefix)
                || (self.pending.len() < prefix.len() && prefix.starts_with(&self.pending));
            if maybe_header && self.pending.len() > MAX_HEADER_LEN {
                let len = self.pending.len();
                self.pending.clear();
                return Some(Frame::Malformed(format!(
                    "header sin terminar de {len} bytes"
                )));
            }
            return None;
        }
    }

    /// Cierra lo pendiente sin esperar el '\n': un header legacy o un texto
    /// parcial. No hace nada si hay un payload en curso.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.remaining.is_some() || self.pending.is_empty() {
            return None;
        }
        let raw: Vec<u8> = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw).to_string();
        if text.starts_with(FILE_PREFIX) {
            return Some(self.header_frame(&text));
        }
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return None;
        }
        Some(Frame::Text(text.to_string()))
    }

    fn header_frame(&mut self, raw: &str) -> Frame {
        match parse_file_header(raw) {
            Ok(header) => {
                self.remaining = Some(header.size);
                Frame::FileStart(header)
            }
            Err(reason) => Frame::Malformed(reason),
        }
    }
}
