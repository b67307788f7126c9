//! knxd client
//!
//! One persistent group-socket connection per client. A background reader task
//! owns the read half and pushes decoded telegrams onto an mpsc channel; sends
//! go through the write half behind an async mutex so any task may send.
//!
//! The client never reconnects on its own. An unexpected disconnect is reported
//! as [`ClientEvent::Disconnected`] and the owner decides (via the daemon
//! manager) when a new connection is worth attempting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_knx::frame::EIB_GROUP_PACKET;
use voltage_knx::{GroupAddress, KnxdFrame, Telegram};

use super::codec::KnxdCodec;
use crate::config::ClientConfig;
use crate::error::{KnxSrvError, Result};

/// Any bidirectional byte stream knxd can be reached over
pub trait KnxdStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> KnxdStream for T {}

pub type BoxedStream = Box<dyn KnxdStream>;

/// Parsed knxd connection URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `unix:///path`
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        KnxSrvError::config(format!("invalid port in knxd URL '{}'", url))
                    })?;
                    (host, port)
                },
                None => (rest, crate::config::DEFAULT_KNXD_PORT),
            };
            if host.is_empty() {
                return Err(KnxSrvError::config(format!("missing host in knxd URL '{}'", url)));
            }
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(KnxSrvError::config(format!("missing path in knxd URL '{}'", url)));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        Err(KnxSrvError::config(format!(
            "unsupported knxd URL '{}' (expected tcp://host:port or unix:///path)",
            url
        )))
    }

    /// Open a raw stream, bounded by `timeout`
    pub async fn connect(&self, timeout: Duration) -> Result<BoxedStream> {
        let stream: BoxedStream = match self {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| {
                        KnxSrvError::Timeout(format!("connect to {}:{} timed out", host, port))
                    })??;
                stream.set_nodelay(true)?;
                Box::new(stream)
            },
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
                    .await
                    .map_err(|_| {
                        KnxSrvError::Timeout(format!("connect to {} timed out", path.display()))
                    })??;
                Box::new(stream)
            },
            #[cfg(not(unix))]
            Endpoint::Unix(path) => {
                return Err(KnxSrvError::config(format!(
                    "unix sockets are not supported on this platform: {}",
                    path.display()
                )))
            },
        };
        Ok(stream)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Send `EIB_OPEN_GROUPCON` and wait for knxd to echo the message type
///
/// Returns the framed transport so bytes buffered past the reply are kept.
pub async fn open_group_socket<S>(stream: S, timeout: Duration) -> Result<Framed<S, KnxdCodec>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    open_connection(stream, KnxdFrame::open_groupcon(), timeout).await
}

/// Send an `EIB_OPEN_*` request and wait for the reply of the same type
pub async fn open_connection<S>(
    stream: S,
    request: KnxdFrame,
    timeout: Duration,
) -> Result<Framed<S, KnxdCodec>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let expected = request.msg_type;
    let mut framed = Framed::new(stream, KnxdCodec);
    framed.send(request).await?;

    let reply = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| KnxSrvError::Timeout("knxd handshake timed out".to_string()))?;
    match reply {
        Some(Ok(frame)) if frame.msg_type == expected => Ok(framed),
        Some(Ok(frame)) => Err(KnxSrvError::protocol(format!(
            "unexpected handshake reply type 0x{:04X}",
            frame.msg_type
        ))),
        Some(Err(e)) => Err(e),
        None => Err(KnxSrvError::connection("knxd closed the connection during handshake")),
    }
}

/// Events produced by the reader task
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Telegram(Telegram),
    /// Connection lost; no further events follow
    Disconnected(String),
}

/// Client counters snapshot
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClientStats {
    pub telegrams_received: u64,
    pub telegrams_sent: u64,
    pub errors: u64,
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    errors: AtomicU64,
}

/// Outbound side of a knxd connection, as seen by the bridge
#[async_trait]
pub trait TelegramSender: Send + Sync {
    async fn send(&self, telegram: Telegram) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> ClientStats;

    /// Human-readable peer, reported on the health topic
    fn endpoint(&self) -> String;
}

type Transport = Framed<BoxedStream, KnxdCodec>;
type Writer = SplitSink<Transport, KnxdFrame>;

pub struct KnxdClient {
    endpoint: String,
    writer: tokio::sync::Mutex<Option<Writer>>,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    send_timeout: Duration,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl KnxdClient {
    /// Connect to `url`, perform the handshake and start the reader task
    pub async fn connect(
        url: &str,
        config: &ClientConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ClientEvent>)> {
        let endpoint = Endpoint::parse(url)?;
        let stream = endpoint.connect(config.connect_timeout()).await?;
        let transport = open_group_socket(stream, config.connect_timeout()).await?;
        info!("[OK] Connected to knxd at {}", endpoint);
        Ok(Self::start(
            endpoint.to_string(),
            transport,
            config.send_timeout(),
            config.queue_size,
        ))
    }

    /// Wrap an already-open stream; performs the handshake
    pub async fn from_stream<S>(
        stream: S,
        config: &ClientConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ClientEvent>)>
    where
        S: KnxdStream + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        let transport = open_group_socket(stream, config.connect_timeout()).await?;
        Ok(Self::start(
            "stream".to_string(),
            transport,
            config.send_timeout(),
            config.queue_size,
        ))
    }

    fn start(
        endpoint: String,
        transport: Transport,
        send_timeout: Duration,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (sink, stream) = transport.split();
        let (tx, rx) = mpsc::channel(queue_size.max(1));

        let client = Arc::new(Self {
            endpoint,
            writer: tokio::sync::Mutex::new(Some(sink)),
            connected: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(Counters::default()),
            connected_since: Mutex::new(Some(Utc::now())),
            send_timeout,
            cancel: CancellationToken::new(),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(read_loop(
            stream,
            tx,
            Arc::clone(&client.connected),
            Arc::clone(&client.counters),
            client.cancel.clone(),
        ));
        *client.reader.lock() = Some(handle);

        (client, rx)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            telegrams_received: self.counters.received.load(Ordering::Relaxed),
            telegrams_sent: self.counters.sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            connected_since: *self.connected_since.lock(),
        }
    }

    async fn send_frame(&self, frame: KnxdFrame) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(KnxSrvError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(KnxSrvError::NotConnected)?;

        match tokio::time::timeout(self.send_timeout, writer.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.connected.store(false, Ordering::Release);
                Err(e)
            },
            Err(_) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(KnxSrvError::Timeout("knxd send timed out".to_string()))
            },
        }
    }

    pub async fn send_telegram(&self, telegram: &Telegram) -> Result<()> {
        self.send_frame(KnxdFrame::new(EIB_GROUP_PACKET, telegram.encode_outbound()))
            .await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!("TX {}", telegram);
        Ok(())
    }

    /// Group value write; `short` packs small values into the APCI byte
    pub async fn send_write(&self, ga: GroupAddress, data: &[u8], short: bool) -> Result<()> {
        self.send_telegram(&Telegram::write(ga, data, short)).await
    }

    pub async fn send_read(&self, ga: GroupAddress) -> Result<()> {
        self.send_telegram(&Telegram::read(ga)).await
    }

    pub async fn send_response(&self, ga: GroupAddress, data: &[u8], short: bool) -> Result<()> {
        self.send_telegram(&Telegram::response(ga, data, short)).await
    }

    /// Send `EIB_CLOSE` (best effort) and stop the reader
    pub async fn close(&self) {
        self.cancel.cancel();
        if self.connected.swap(false, Ordering::AcqRel) {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let close = writer.send(KnxdFrame::close());
                match tokio::time::timeout(Duration::from_millis(500), close).await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => debug!("EIB_CLOSE not sent: {}", e),
                    Err(_) => debug!("EIB_CLOSE not sent: timed out"),
                }
                let _ = writer.close().await;
            }
        }
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.connected_since.lock() = None;
        info!("knxd connection {} closed", self.endpoint);
    }
}

#[async_trait]
impl TelegramSender for KnxdClient {
    async fn send(&self, telegram: Telegram) -> Result<()> {
        self.send_telegram(&telegram).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn stats(&self) -> ClientStats {
        KnxdClient::stats(self)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

impl Drop for KnxdClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut reader: SplitStream<Transport>,
    tx: mpsc::Sender<ClientEvent>,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) if frame.msg_type == EIB_GROUP_PACKET => {
                match Telegram::decode(&frame.payload) {
                    Ok(telegram) => {
                        counters.received.fetch_add(1, Ordering::Relaxed);
                        debug!("RX {}", telegram);
                        if tx.send(ClientEvent::Telegram(telegram)).await.is_err() {
                            // Consumer gone; nothing left to deliver to
                            return;
                        }
                    },
                    Err(e) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        debug!("Dropped group packet {:02X?}: {}", frame.payload, e);
                    },
                }
            },
            Some(Ok(frame)) => {
                debug!("Ignoring knxd message type 0x{:04X}", frame.msg_type);
            },
            Some(Err(e)) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                break format!("read error: {}", e);
            },
            None => break "connection closed by knxd".to_string(),
        }
    };

    connected.store(false, Ordering::Release);
    warn!("[FAIL] knxd connection lost: {}", reason);
    let _ = tx.send(ClientEvent::Disconnected(reason)).await;
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn accept_handshake(server: &mut DuplexStream) {
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x05, 0x00, 0x26, 0x00, 0x00, 0x00]);
        server.write_all(&[0x00, 0x02, 0x00, 0x26]).await.unwrap();
    }

    async fn connected_pair() -> (Arc<KnxdClient>, mpsc::Receiver<ClientEvent>, DuplexStream) {
        let (client_side, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            accept_handshake(&mut server).await;
            server
        });
        let (client, rx) = KnxdClient::from_stream(client_side, &ClientConfig::default())
            .await
            .unwrap();
        (client, rx, server_task.await.unwrap())
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("tcp://localhost:6720").unwrap(),
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 6720
            }
        );
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.5").unwrap(),
            Endpoint::Tcp {
                host: "10.0.0.5".to_string(),
                port: 6720
            }
        );
        assert_eq!(
            Endpoint::parse("unix:///tmp/eib").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/eib"))
        );
        assert!(Endpoint::parse("http://localhost").is_err());
        assert!(Endpoint::parse("tcp://host:notaport").is_err());
        assert!(Endpoint::parse("unix://").is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_reply() {
        let (client_side, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; 7];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&[0x00, 0x02, 0x00, 0x06]).await.unwrap();
            server
        });
        let result = KnxdClient::from_stream(client_side, &ClientConfig::default()).await;
        assert!(matches!(result, Err(KnxSrvError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_receive_telegram() {
        let (client, mut rx, mut server) = connected_pair().await;

        let frame = KnxdFrame::new(EIB_GROUP_PACKET, [0x11, 0x01, 0x08, 0x01, 0x00, 0x81]);
        server.write_all(&frame.encode()).await.unwrap();

        match rx.recv().await.unwrap() {
            ClientEvent::Telegram(t) => {
                assert_eq!(t.destination.to_string(), "1/0/1");
                assert_eq!(t.payload.data(), vec![0x01]);
            },
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(client.stats().telegrams_received, 1);
    }

    #[tokio::test]
    async fn test_malformed_packet_does_not_stop_reader() {
        let (client, mut rx, mut server) = connected_pair().await;

        // Truncated group packet followed by a valid one
        server
            .write_all(&KnxdFrame::new(EIB_GROUP_PACKET, [0x11, 0x01, 0x08]).encode())
            .await
            .unwrap();
        server
            .write_all(&KnxdFrame::new(EIB_GROUP_PACKET, [0x11, 0x01, 0x08, 0x02, 0x00, 0x80]).encode())
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ClientEvent::Telegram(t) => assert_eq!(t.destination.to_string(), "1/0/2"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(client.stats().errors, 1);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_send_write_encodes_group_packet() {
        let (client, _rx, mut server) = connected_pair().await;

        let ga: GroupAddress = "1/2/3".parse().unwrap();
        client.send_write(ga, &[0x01], true).await.unwrap();

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x06, 0x00, 0x27, 0x0A, 0x03, 0x00, 0x81]);
        assert_eq!(client.stats().telegrams_sent, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_reported() {
        let (client, mut rx, server) = connected_pair().await;
        drop(server);

        match rx.recv().await.unwrap() {
            ClientEvent::Disconnected(reason) => assert!(!reason.is_empty()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!client.is_connected());
        let ga: GroupAddress = "1/0/1".parse().unwrap();
        assert!(matches!(client.send_read(ga).await, Err(KnxSrvError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_sends_eib_close() {
        let (client, _rx, mut server) = connected_pair().await;
        client.close().await;

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 0x02, 0x00, 0x06]);
        assert!(!client.is_connected());
        assert!(client.stats().connected_since.is_none());
    }
}
