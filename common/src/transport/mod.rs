//! Transporte coordinator ⇄ worker sobre TCP: mensajes de texto y archivos
//! multiplexados en el mismo stream.

pub mod connection;
pub mod frame;

pub use connection::{
    Connection, ConnectionState, Incoming, Outgoing, TransportEvent, TransportListener,
    TruncationCause,
};
pub use frame::{FileHeader, FILE_PREFIX};
