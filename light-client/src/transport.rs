use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryFutureExt;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};

use crate::LightClientError;

/// Any duplex byte stream a [`LineTransport`] can run on.
pub trait LineStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LineStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn LineStream>;

/// Opens the byte stream a session runs on.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, LightClientError>;
}

#[derive(Clone, Debug)]
pub struct TcpOpener {
    timeout: Duration,
}

impl TcpOpener {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StreamOpener for TcpOpener {
    async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, LightClientError> {
        let address = format!("{host}:{port}");
        debug!("Opening boblight session to {address}");
        let connect = TcpStream::connect((host, port)).and_then(|s| async {
            s.set_nodelay(true)?;
            Ok(s)
        });
        let stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(LightClientError::ConnectionFailed {
                    reason: format!("cannot reach boblightd at {address}: {e}"),
                })
            }
            Err(_) => {
                return Err(LightClientError::ConnectionFailed {
                    reason: format!(
                        "boblightd at {address} did not accept within {:?}",
                        self.timeout
                    ),
                })
            }
        };
        match stream.peer_addr() {
            Ok(peer) => info!("Boblight session to {address} open (peer {peer})"),
            Err(_) => info!("Boblight session to {address} open"),
        }
        Ok(Box::new(stream))
    }
}

/// Everything a transport reports to its consumer.
#[derive(Debug, PartialEq)]
pub enum TransportEvent {
    /// One complete line, without its terminator.
    Line(String),
    Error(String),
    /// Nothing was received for the configured idle period.
    IdleTimeout,
    ClosedByPeer,
    ClosedLocally,
}

/// Splits a byte stream into newline terminated lines.
///
/// Incoming lines and lifecycle notifications go to the single receiver
/// returned from [`LineTransport::new`]; the transport does not react to
/// them itself.
pub struct LineTransport {
    writer: WriteHalf<BoxedStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
    reader: JoinHandle<()>,
}

impl LineTransport {
    pub fn new(
        stream: BoxedStream,
        idle_timeout: Option<Duration>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (reader, writer) = tokio::io::split(stream);
        let (events, receiver) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_lines(reader, idle_timeout, events.clone()));
        (
            Self {
                writer,
                events,
                reader,
            },
            receiver,
        )
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), LightClientError> {
        debug!("-> {line}");
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        let result = match self.writer.write_all(buf.as_bytes()).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            warn!("Failed to write to boblight server: {e}");
            LightClientError::ConnectionFailed {
                reason: e.to_string(),
            }
        })
    }

    pub async fn close(mut self) {
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            debug!("Error while shutting down connection: {e}");
        }
        let _ = self.events.send(TransportEvent::ClosedLocally);
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_lines(
    reader: ReadHalf<BoxedStream>,
    idle_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = match idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, lines.next_line()).await {
                Ok(next) => next,
                Err(_) => {
                    if events.send(TransportEvent::IdleTimeout).is_err() {
                        return;
                    }
                    continue;
                }
            },
            None => lines.next_line().await,
        };

        let (event, done) = match next {
            Ok(Some(line)) => {
                debug!("<- {line}");
                (TransportEvent::Line(line), false)
            }
            Ok(None) => {
                info!("Boblight server closed the connection");
                (TransportEvent::ClosedByPeer, true)
            }
            Err(e) => {
                warn!("Failed to read from boblight server: {e}");
                (TransportEvent::Error(e.to_string()), true)
            }
        };
        if events.send(event).is_err() || done {
            return;
        }
    }
}
