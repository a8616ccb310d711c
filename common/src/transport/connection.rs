//! Una conexión = un peer. El envío se serializa con un lock sobre la mitad de
//! escritura; la recepción corre en su propia tarea y publica `TransportEvent`s
//! en un canal.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use super::frame::{self, FileHeader, Frame, FrameDecoder};
use crate::config::TransportConfig;
use crate::error::{DispatchError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const OUTGOING_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationCause {
    /// El peer cerró el stream a mitad del cuerpo
    EndOfStream,
    /// No llegaron bytes durante `payload_timeout`
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    FileReceived {
        name: String,
        path: PathBuf,
        size: u64,
    },
    /// Payload incompleto; el archivo parcial ya fue borrado.
    Truncated {
        name: String,
        expected: u64,
        received: u64,
        cause: TruncationCause,
    },
    /// Header inválido; el frame se descarta y la conexión sigue abierta.
    Malformed(String),
    /// El payload llegó completo pero no se pudo guardar localmente.
    StoreFailed { name: String, reason: String },
    /// Último evento de la conexión.
    Closed { error: Option<String> },
}

struct Inner {
    peer: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<ConnectionState>,
    config: TransportConfig,
    /// Motivo del cierre cuando lo provoca una falla local de escritura
    close_reason: std::sync::Mutex<Option<String>>,
}

impl Inner {
    async fn fail_with(&self, reason: String) {
        if let Ok(mut slot) = self.close_reason.lock() {
            slot.get_or_insert(reason);
        }
        self.mark_closed().await;
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().ok().and_then(|slot| slot.clone())
    }

    async fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }
}

/// Handle de envío. Clonable: todos los clones comparten el lock de escritura.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Eventos recibidos del peer, en orden de llegada.
pub struct Incoming {
    rx: mpsc::Receiver<TransportEvent>,
}

impl Incoming {
    pub async fn next(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

impl Connection {
    /// Conecta activamente al peer (lado worker).
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: TransportConfig,
    ) -> Result<(Connection, Incoming)> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DispatchError::TransportError("timeout al conectar".into()))?
            .map_err(|e| DispatchError::TransportError(format!("no se pudo conectar: {e}")))?;
        Ok(Self::open(stream, config))
    }

    /// Escucha en `addr` y acepta exactamente un peer.
    pub async fn accept_one(
        addr: impl ToSocketAddrs,
        config: TransportConfig,
    ) -> Result<(Connection, Incoming)> {
        let listener = TransportListener::bind(addr, config.clone()).await?;
        timeout(config.connect_timeout, listener.accept())
            .await
            .map_err(|_| DispatchError::TransportError("ningún peer se conectó a tiempo".into()))?
    }

    /// Envuelve un stream ya establecido y arranca el loop de recepción.
    pub fn open(stream: TcpStream, config: TransportConfig) -> (Connection, Incoming) {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let inner = Arc::new(Inner {
            peer,
            writer: Mutex::new(Some(writer)),
            state,
            config,
            close_reason: std::sync::Mutex::new(None),
        });
        inner.state.send_replace(ConnectionState::Open);
        info!("conexión abierta con {}", peer);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(receive_loop(reader, inner.clone(), tx));

        (Connection { inner }, Incoming { rx })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Espera hasta que la conexión pase a Closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            _ => Err(DispatchError::ConnectionClosed),
        }
    }

    async fn fail(&self, e: std::io::Error) -> DispatchError {
        warn!("falla de escritura hacia {}: {}", self.inner.peer, e);
        let err = DispatchError::TransportError(e.to_string());
        self.inner.fail_with(err.to_string()).await;
        err
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        let bytes = frame::encode_text(text)?;
        self.ensure_open()?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(DispatchError::ConnectionClosed)?;
        let res = write_all_flush(writer, &bytes).await;
        drop(guard);

        match res {
            Ok(()) => {
                debug!("texto enviado a {} ({} bytes)", self.inner.peer, bytes.len());
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Envía un archivo usando su propio nombre.
    pub async fn send_file(&self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                DispatchError::InvalidArgument(format!("ruta sin nombre: {}", path.display()))
            })?;
        self.send_file_as(path, &name).await
    }

    /// Envía `path` como payload `name`. El lock de escritura se mantiene
    /// durante todo el envío, así ningún texto se intercala en el cuerpo.
    pub async fn send_file_as(&self, path: &Path, name: &str) -> Result<()> {
        let size = fs::metadata(path)
            .await
            .map_err(|e| DispatchError::MissingInput(format!("{}: {e}", path.display())))?
            .len();
        let header = frame::encode_file_header(name, size)?;
        let mut file = File::open(path)
            .await
            .map_err(|e| DispatchError::MissingInput(format!("{}: {e}", path.display())))?;
        self.ensure_open()?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(DispatchError::ConnectionClosed)?;
        let outcome = write_payload(writer, &header, &mut file, size, &self.inner.config).await;
        drop(guard);

        match outcome {
            Ok(()) => {
                info!("archivo {} enviado a {} ({} bytes)", name, self.inner.peer, size);
                Ok(())
            }
            Err(SendFailure::Stream(e)) => Err(self.fail(e).await),
            Err(SendFailure::Source(reason)) => {
                // el peer ya espera `size` bytes: el stream quedó desalineado
                let err = DispatchError::TransportError(format!("{}: {reason}", path.display()));
                self.inner.fail_with(err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Cierra el stream; los envíos posteriores fallan con ConnectionClosed.
    pub async fn close(&self) {
        if self.state() != ConnectionState::Closed {
            info!("cerrando conexión con {}", self.inner.peer);
        }
        self.inner.mark_closed().await;
    }

    /// Cola de envío: cualquier productor (stdin, código, tests) encola
    /// mensajes y una sola tarea los escribe en orden.
    pub fn spawn_sender(&self) -> (mpsc::Sender<Outgoing>, JoinHandle<Result<()>>) {
        let (tx, mut rx) = mpsc::channel::<Outgoing>(OUTGOING_CHANNEL_CAPACITY);
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let res = match &msg {
                    Outgoing::Text(t) => conn.send_text(t).await,
                    Outgoing::File(p) => conn.send_file(p).await,
                };
                match res {
                    Ok(()) => {}
                    Err(e) if e.is_fatal_for_connection() => return Err(e),
                    Err(e) => warn!("mensaje descartado: {}", e),
                }
            }
            Ok(())
        });
        (tx, handle)
    }
}

async fn write_all_flush(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

enum SendFailure {
    Stream(std::io::Error),
    Source(String),
}

async fn write_payload(
    writer: &mut OwnedWriteHalf,
    header: &[u8],
    file: &mut File,
    size: u64,
    cfg: &TransportConfig,
) -> std::result::Result<(), SendFailure> {
    writer.write_all(header).await.map_err(SendFailure::Stream)?;
    writer.flush().await.map_err(SendFailure::Stream)?;
    if !cfg.header_delay.is_zero() {
        sleep(cfg.header_delay).await;
    }

    let mut buf = vec![0u8; cfg.buffer_size.max(1)];
    let mut sent: u64 = 0;
    while sent < size {
        let want = ((size - sent).min(buf.len() as u64)) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| SendFailure::Source(format!("lectura falló a mitad del envío: {e}")))?;
        if n == 0 {
            return Err(SendFailure::Source(format!(
                "terminó antes de lo anunciado ({sent}/{size} bytes)"
            )));
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(SendFailure::Stream)?;
        sent += n as u64;
    }
    writer.flush().await.map_err(SendFailure::Stream)
}

/// Mensaje encolado para envío.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    File(PathBuf),
}

impl Outgoing {
    /// `file:<ruta>` envía un archivo; cualquier otra línea es texto.
    pub fn parse_line(line: &str) -> Outgoing {
        match line.strip_prefix("file:") {
            Some(path) if !path.trim().is_empty() => Outgoing::File(PathBuf::from(path.trim())),
            _ => Outgoing::Text(line.to_string()),
        }
    }
}

/// Listener que entrega una `Connection` por peer aceptado.
pub struct TransportListener {
    listener: TcpListener,
    config: TransportConfig,
}

impl TransportListener {
    pub async fn bind(addr: impl ToSocketAddrs, config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DispatchError::TransportError(format!("bind falló: {e}")))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<(Connection, Incoming)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| DispatchError::TransportError(format!("accept falló: {e}")))?;
        debug!("peer aceptado: {}", peer);
        Ok(Connection::open(stream, self.config.clone()))
    }
}

/* ---------------- recepción ---------------- */

/// Payload en curso: se escribe en `.part` y se renombra al completarse.
struct PayloadSink {
    header: FileHeader,
    part_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    received: u64,
    store_error: Option<String>,
}

impl PayloadSink {
    async fn start(header: FileHeader, dir: &Path) -> Self {
        let final_path = dir.join(format!("received_{}", header.name));
        let part_path = dir.join(format!("received_{}.part", header.name));
        let mut store_error = None;
        let file = match fs::create_dir_all(dir).await {
            Ok(()) => match File::create(&part_path).await {
                Ok(f) => Some(f),
                Err(e) => {
                    store_error = Some(e.to_string());
                    None
                }
            },
            Err(e) => {
                store_error = Some(e.to_string());
                None
            }
        };
        Self {
            header,
            part_path,
            final_path,
            file,
            received: 0,
            store_error,
        }
    }

    async fn write(&mut self, data: &[u8]) {
        self.received += data.len() as u64;
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(data).await {
                warn!("no se pudo escribir {}: {}", self.part_path.display(), e);
                self.store_error = Some(e.to_string());
                self.file = None;
                let _ = fs::remove_file(&self.part_path).await;
            }
        }
    }

    async fn finish(mut self) -> TransportEvent {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                self.store_error = Some(e.to_string());
            }
            drop(file);
        }
        if let Some(reason) = self.store_error {
            let _ = fs::remove_file(&self.part_path).await;
            return TransportEvent::StoreFailed {
                name: self.header.name,
                reason,
            };
        }
        if let Err(e) = fs::rename(&self.part_path, &self.final_path).await {
            let _ = fs::remove_file(&self.part_path).await;
            return TransportEvent::StoreFailed {
                name: self.header.name,
                reason: e.to_string(),
            };
        }
        TransportEvent::FileReceived {
            name: self.header.name,
            path: self.final_path,
            size: self.received,
        }
    }

    async fn discard(mut self, cause: TruncationCause) -> TransportEvent {
        drop(self.file.take());
        let _ = fs::remove_file(&self.part_path).await;
        warn!(
            "payload {} truncado ({}/{} bytes, {:?})",
            self.header.name, self.received, self.header.size, cause
        );
        TransportEvent::Truncated {
            name: self.header.name,
            expected: self.header.size,
            received: self.received,
            cause,
        }
    }
}

enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut,
    Failed(std::io::Error),
    Cancelled,
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    inner: Arc<Inner>,
    tx: mpsc::Sender<TransportEvent>,
) {
    let cfg = inner.config.clone();
    let mut state_rx = inner.state.subscribe();
    let mut decoder = FrameDecoder::new();
    let mut sink: Option<PayloadSink> = None;
    let mut buf = vec![0u8; cfg.buffer_size.max(1)];
    let mut close_error: Option<String> = None;

    loop {
        while let Some(frame) = decoder.decode() {
            handle_frame(frame, &mut sink, &cfg, &tx).await;
        }

        // dentro de un payload nunca se lee más de lo que falta
        let limit = decoder
            .remaining_payload()
            .map(|r| r.min(buf.len() as u64) as usize)
            .unwrap_or(buf.len())
            .max(1);
        let wait = if sink.is_some() {
            Some(cfg.payload_timeout)
        } else if decoder.has_partial() {
            Some(cfg.header_grace)
        } else {
            None
        };

        let outcome = tokio::select! {
            _ = async {
                let _ = state_rx.wait_for(|s| *s == ConnectionState::Closed).await;
            } => ReadOutcome::Cancelled,
            r = async {
                match wait {
                    Some(d) => timeout(d, reader.read(&mut buf[..limit])).await.ok(),
                    None => Some(reader.read(&mut buf[..limit]).await),
                }
            } => match r {
                None => ReadOutcome::TimedOut,
                Some(Ok(0)) => ReadOutcome::Eof,
                Some(Ok(n)) => ReadOutcome::Data(n),
                Some(Err(e)) => ReadOutcome::Failed(e),
            },
        };

        match outcome {
            ReadOutcome::Data(n) => decoder.push(&buf[..n]),
            ReadOutcome::TimedOut => {
                if let Some(s) = sink.take() {
                    decoder.abort_payload();
                    let _ = tx.send(s.discard(TruncationCause::Stalled).await).await;
                } else if let Some(frame) = decoder.flush() {
                    handle_frame(frame, &mut sink, &cfg, &tx).await;
                }
            }
            ReadOutcome::Eof => {
                debug!("fin de stream desde {}", inner.peer);
                if let Some(frame) = decoder.flush() {
                    handle_frame(frame, &mut sink, &cfg, &tx).await;
                }
                break;
            }
            ReadOutcome::Failed(e) => {
                warn!("falla de lectura desde {}: {}", inner.peer, e);
                close_error = Some(DispatchError::TransportError(e.to_string()).to_string());
                break;
            }
            ReadOutcome::Cancelled => {
                close_error = inner.close_reason();
                break;
            }
        }
    }

    // un header recién parseado sin cuerpo también cuenta como truncado
    if let Some(s) = sink.take() {
        let _ = tx.send(s.discard(TruncationCause::EndOfStream).await).await;
    }
    inner.mark_closed().await;
    info!("conexión con {} cerrada", inner.peer);
    let _ = tx.send(TransportEvent::Closed { error: close_error }).await;
}

async fn handle_frame(
    frame: Frame,
    sink: &mut Option<PayloadSink>,
    cfg: &TransportConfig,
    tx: &mpsc::Sender<TransportEvent>,
) {
    match frame {
        Frame::Text(text) => {
            let _ = tx.send(TransportEvent::Text(text)).await;
        }
        Frame::FileStart(header) => {
            debug!("recibiendo {} ({} bytes)", header.name, header.size);
            *sink = Some(PayloadSink::start(header, &cfg.download_dir).await);
        }
        Frame::FileData { data, done } => {
            if let Some(s) = sink.as_mut() {
                s.write(&data).await;
            }
            if done {
                if let Some(s) = sink.take() {
                    let event = s.finish().await;
                    if let TransportEvent::FileReceived { path, size, .. } = &event {
                        info!("archivo recibido: {} ({} bytes)", path.display(), size);
                    }
                    let _ = tx.send(event).await;
                }
            }
        }
        Frame::Malformed(reason) => {
            warn!("frame descartado: {}", reason);
            let _ = tx.send(TransportEvent::Malformed(reason)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> TransportConfig {
        TransportConfig {
            buffer_size: 16,
            header_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(5),
            payload_timeout: Duration::from_millis(300),
            header_grace: Duration::from_millis(200),
            download_dir: dir.to_path_buf(),
        }
    }

    /// Listener en loopback + stream crudo del lado cliente.
    async fn raw_peer(cfg: TransportConfig) -> (Connection, Incoming, TcpStream) {
        let listener = TransportListener::bind("127.0.0.1:0", cfg).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, raw) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (conn, incoming) = accepted.unwrap();
        (conn, incoming, raw.unwrap())
    }

    async fn next_event(incoming: &mut Incoming) -> TransportEvent {
        timeout(Duration::from_secs(5), incoming.next())
            .await
            .expect("no llegó ningún evento")
            .expect("canal cerrado")
    }

    #[tokio::test]
    async fn archivo_fragmentado_y_texto_llegan_completos() {
        let tmp = TempDir::new().unwrap();
        let (_conn, mut incoming, mut raw) = raw_peer(test_config(tmp.path())).await;

        let pieces: [&[u8]; 7] = [
            b"FI",
            b"LE:dat",
            b"os.bin:10\n",
            b"012",
            b"3456789ho",
            b"la mun",
            b"do\n",
        ];
        for p in pieces {
            raw.write_all(p).await.unwrap();
            raw.flush().await.unwrap();
            sleep(Duration::from_millis(5)).await;
        }

        match next_event(&mut incoming).await {
            TransportEvent::FileReceived { name, path, size } => {
                assert_eq!(name, "datos.bin");
                assert_eq!(size, 10);
                assert_eq!(path, tmp.path().join("received_datos.bin"));
                assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
            }
            other => panic!("evento inesperado: {other:?}"),
        }
        assert_eq!(
            next_event(&mut incoming).await,
            TransportEvent::Text("hola mundo".into())
        );
        assert!(!tmp.path().join("received_datos.bin.part").exists());
    }

    #[tokio::test]
    async fn envio_de_archivo_y_texto_entre_dos_conexiones() {
        let tmp = TempDir::new().unwrap();
        let send_dir = tmp.path().join("origen");
        let recv_dir = tmp.path().join("destino");
        std::fs::create_dir_all(&send_dir).unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let src = send_dir.join("n1.zip");
        std::fs::write(&src, &payload).unwrap();

        let listener = TransportListener::bind("127.0.0.1:0", test_config(&recv_dir))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(
            listener.accept(),
            Connection::connect(addr, test_config(&send_dir))
        );
        let (_server, mut server_in) = accepted.unwrap();
        let (client, _client_in) = connected.unwrap();
        assert_eq!(client.state(), ConnectionState::Open);

        client.send_file(&src).await.unwrap();
        client.send_text("listo").await.unwrap();

        match next_event(&mut server_in).await {
            TransportEvent::FileReceived { path, size, .. } => {
                assert_eq!(size, 1000);
                assert_eq!(std::fs::read(path).unwrap(), payload);
            }
            other => panic!("evento inesperado: {other:?}"),
        }
        assert_eq!(
            next_event(&mut server_in).await,
            TransportEvent::Text("listo".into())
        );
    }

    #[tokio::test]
    async fn payload_detenido_se_descarta_y_la_conexion_sigue() {
        let tmp = TempDir::new().unwrap();
        let (conn, mut incoming, mut raw) = raw_peer(test_config(tmp.path())).await;

        raw.write_all(b"FILE:x.bin:100\n").await.unwrap();
        raw.write_all(&[7u8; 40]).await.unwrap();
        raw.flush().await.unwrap();

        match next_event(&mut incoming).await {
            TransportEvent::Truncated {
                name,
                expected,
                received,
                cause,
            } => {
                assert_eq!(name, "x.bin");
                assert_eq!(expected, 100);
                assert_eq!(received, 40);
                assert_eq!(cause, TruncationCause::Stalled);
            }
            other => panic!("evento inesperado: {other:?}"),
        }
        assert!(!tmp.path().join("received_x.bin.part").exists());
        assert!(!tmp.path().join("received_x.bin").exists());

        raw.write_all(b"sigo vivo\n").await.unwrap();
        assert_eq!(
            next_event(&mut incoming).await,
            TransportEvent::Text("sigo vivo".into())
        );
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn fin_de_stream_a_mitad_del_payload_reporta_truncado() {
        let tmp = TempDir::new().unwrap();
        let (conn, mut incoming, mut raw) = raw_peer(test_config(tmp.path())).await;

        raw.write_all(b"FILE:x.bin:100\n").await.unwrap();
        raw.write_all(&[1u8; 40]).await.unwrap();
        raw.flush().await.unwrap();
        drop(raw);

        match next_event(&mut incoming).await {
            TransportEvent::Truncated {
                received, cause, ..
            } => {
                assert_eq!(received, 40);
                assert_eq!(cause, TruncationCause::EndOfStream);
            }
            other => panic!("evento inesperado: {other:?}"),
        }
        assert_eq!(
            next_event(&mut incoming).await,
            TransportEvent::Closed { error: None }
        );
        assert!(!tmp.path().join("received_x.bin.part").exists());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn header_malformado_no_cierra_la_conexion() {
        let tmp = TempDir::new().unwrap();
        let (conn, mut incoming, mut raw) = raw_peer(test_config(tmp.path())).await;

        raw.write_all(b"FILE:a:b:c\nFILE:x:zz\nok\n").await.unwrap();

        assert!(matches!(
            next_event(&mut incoming).await,
            TransportEvent::Malformed(_)
        ));
        assert!(matches!(
            next_event(&mut incoming).await,
            TransportEvent::Malformed(_)
        ));
        assert_eq!(
            next_event(&mut incoming).await,
            TransportEvent::Text("ok".into())
        );
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn texto_sin_newline_se_entrega_tras_la_gracia() {
        let tmp = TempDir::new().unwrap();
        let (_conn, mut incoming, mut raw) = raw_peer(test_config(tmp.path())).await;

        raw.write_all(b"mensaje legacy").await.unwrap();
        assert_eq!(
            next_event(&mut incoming).await,
            TransportEvent::Text("mensaje legacy".into())
        );
    }

    #[tokio::test]
    async fn enviar_despues_del_cierre_falla() {
        let tmp = TempDir::new().unwrap();
        let (conn, mut incoming, raw) = raw_peer(test_config(tmp.path())).await;

        drop(raw);
        assert_eq!(
            next_event(&mut incoming).await,
            TransportEvent::Closed { error: None }
        );
        assert!(matches!(
            conn.send_text("hola").await,
            Err(DispatchError::ConnectionClosed)
        ));

        let (conn2, _incoming2, _raw2) = raw_peer(test_config(tmp.path())).await;
        conn2.close().await;
        assert_eq!(conn2.state(), ConnectionState::Closed);
        assert!(matches!(
            conn2.send_text("hola").await,
            Err(DispatchError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn texto_con_prefijo_reservado_no_se_envia() {
        let tmp = TempDir::new().unwrap();
        let (conn, _incoming, _raw) = raw_peer(test_config(tmp.path())).await;
        assert!(matches!(
            conn.send_text("FILE:trampa:3").await,
            Err(DispatchError::InvalidArgument(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn cola_de_envio_respeta_el_orden() {
        let tmp = TempDir::new().unwrap();
        let (conn, _incoming, mut raw) = raw_peer(test_config(tmp.path())).await;
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, b"abc").unwrap();

        let (tx, handle) = conn.spawn_sender();
        tx.send(Outgoing::parse_line("uno")).await.unwrap();
        tx.send(Outgoing::parse_line(&format!("file:{}", file.display())))
            .await
            .unwrap();
        tx.send(Outgoing::Text("dos".into())).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        let expected = b"uno\nFILE:a.txt:3\nabcdos\n";
        let mut got = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), raw.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, expected);
    }

    #[test]
    fn parse_line_distingue_archivos() {
        assert_eq!(
            Outgoing::parse_line("file: /tmp/x.zip"),
            Outgoing::File(PathBuf::from("/tmp/x.zip"))
        );
        assert_eq!(Outgoing::parse_line("file:"), Outgoing::Text("file:".into()));
        assert_eq!(Outgoing::parse_line("hola"), Outgoing::Text("hola".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn textos_concurrentes_no_se_meten_en_el_cuerpo_de_un_archivo() {
        let tmp = TempDir::new().unwrap();
        let send_dir = tmp.path().join("origen");
        let recv_dir = tmp.path().join("destino");
        std::fs::create_dir_all(&send_dir).unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let src = send_dir.join("grande.bin");
        std::fs::write(&src, &payload).unwrap();

        let cfg = |dir: &Path| TransportConfig {
            buffer_size: 1024,
            header_delay: Duration::ZERO,
            payload_timeout: Duration::from_secs(5),
            ..test_config(dir)
        };
        let listener = TransportListener::bind("127.0.0.1:0", cfg(&recv_dir))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) =
            tokio::join!(listener.accept(), Connection::connect(addr, cfg(&send_dir)));
        let (_server, mut server_in) = accepted.unwrap();
        let (client, _client_in) = connected.unwrap();

        let file_conn = client.clone();
        let file_task = tokio::spawn(async move { file_conn.send_file(&src).await });
        let text_conn = client.clone();
        let text_task = tokio::spawn(async move {
            for i in 0..20 {
                text_conn.send_text(&format!("msg {i}")).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        file_task.await.unwrap().unwrap();
        text_task.await.unwrap();

        let mut texts = Vec::new();
        let mut received = None;
        while texts.len() < 20 || received.is_none() {
            match next_event(&mut server_in).await {
                TransportEvent::Text(t) => texts.push(t),
                TransportEvent::FileReceived { name, path, size } => {
                    assert_eq!(name, "grande.bin");
                    assert_eq!(size, 200_000);
                    received = Some(path);
                }
                other => panic!("evento inesperado: {other:?}"),
            }
        }
        let expected: Vec<String> = (0..20).map(|i| format!("msg {i}")).collect();
        assert_eq!(texts, expected);
        assert_eq!(std::fs::read(received.unwrap()).unwrap(), payload);
    }

    #[tokio::test]
    async fn falla_de_escritura_llega_en_el_cierre() {
        let tmp = TempDir::new().unwrap();
        let (conn, mut incoming, _raw) = raw_peer(test_config(tmp.path())).await;

        let err = conn
            .fail(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tubo roto"))
            .await;
        assert!(matches!(err, DispatchError::TransportError(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);

        match next_event(&mut incoming).await {
            TransportEvent::Closed { error: Some(e) } => assert!(e.contains("tubo roto"), "{e}"),
            other => panic!("evento inesperado: {other:?}"),
        }
        assert!(matches!(
            conn.send_text("tarde").await,
            Err(DispatchError::ConnectionClosed)
        ));
    }
}
