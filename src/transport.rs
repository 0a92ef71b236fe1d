//! Byte transport between the coordination machine and brokers.
//!
//! A [`Transport`] opens [`Link`]s. Every complete response frame read from a link (length
//! prefix removed) and every link shutdown is reported on one event channel, tagged with the
//! [`ConnectionId`] the link was opened with.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::auth::{self, Authenticator, NoAuthentication};
use crate::error::KafkaError;
use crate::Result;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame { id: ConnectionId, frame: Bytes },
    Closed { id: ConnectionId, reason: String },
}

/// Write half of one broker connection.
pub trait Link: Send {
    /// Queue a complete request frame.
    fn write(&self, frame: Bytes) -> Result<()>;
    /// Flush queued frames and shut the connection down.
    fn close(self: Box<Self>);
}

pub trait Transport: Send + Sync {
    /// Open a connection without waiting for it to come up. Frames written before the
    /// connection is established are queued.
    fn open(
        &self,
        host: &str,
        port: i32,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Link>>;
}

enum LinkCommand {
    Write(Bytes),
    Close,
}

struct TcpLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl Link for TcpLink {
    fn write(&self, frame: Bytes) -> Result<()> {
        self.commands
            .send(LinkCommand::Write(frame))
            .map_err(|_| KafkaError::connection("connection is closed"))
    }

    fn close(self: Box<Self>) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

/// Tokio TCP transport with exponential connect backoff.
#[derive(Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    authenticator: Arc<dyn Authenticator>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            authenticator: Arc::new(NoAuthentication),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }
}

impl Transport for TcpTransport {
    fn open(
        &self,
        host: &str,
        port: i32,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn Link>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| KafkaError::connection(format!("no tokio runtime: {}", e)))?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let address = format!("{}:{}", host, port);
        runtime.spawn(run_link(
            address,
            id,
            events,
            receiver,
            self.connect_timeout,
            self.authenticator.clone(),
        ));
        Ok(Box::new(TcpLink { commands }))
    }
}

async fn connect(address: &str, max_elapsed: Duration) -> Result<TcpStream> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(2))
        .with_max_elapsed_time(Some(max_elapsed))
        .build();
    backoff::future::retry(policy, || async {
        TcpStream::connect(address).await.map_err(|e| {
            debug!(broker = address, error = %e, "connect attempt failed");
            backoff::Error::transient(e)
        })
    })
    .await
    .map_err(|e| KafkaError::connection(format!("failed to connect to {}: {}", address, e)))
}

async fn run_link(
    address: String,
    id: ConnectionId,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    connect_timeout: Duration,
    authenticator: Arc<dyn Authenticator>,
) {
    let mut stream = match connect(&address, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(broker = %address, error = %e, "giving up on connection");
            let _ = events.send(TransportEvent::Closed {
                id,
                reason: e.to_string(),
            });
            return;
        }
    };
    if let Err(e) = authenticator.authenticate(&mut stream).await {
        warn!(broker = %address, error = %e, "authentication failed");
        let _ = events.send(TransportEvent::Closed {
            id,
            reason: e.to_string(),
        });
        return;
    }
    debug!(broker = %address, id, "connected");

    let (read_half, mut write_half) = stream.into_split();
    let reader = tokio::spawn(read_frames(read_half, id, events.clone()));

    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Write(frame) => {
                trace!(broker = %address, bytes = frame.len(), "write");
                if let Err(e) = write_half.write_all(&frame).await {
                    let _ = events.send(TransportEvent::Closed {
                        id,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            LinkCommand::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
    reader.abort();
    debug!(broker = %address, id, "connection closed");
}

async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    id: ConnectionId,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        match auth::read_frame(&mut reader).await {
            Ok(frame) => {
                if events.send(TransportEvent::Frame { id, frame }).is_err() {
                    return;
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    let _ = events.send(TransportEvent::Closed { id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = auth::read_frame(&mut socket).await.unwrap();
            assert_eq!(&request[..], b"ping");
            socket.write_all(&[0, 0, 0, 4, b'p', b'o', b'n', b'g']).await.unwrap();
            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let (events, mut received) = mpsc::unbounded_channel();
        let transport = TcpTransport::new(Duration::from_secs(5));
        let link = transport.open("127.0.0.1", port, 7, events).unwrap();
        link.write(Bytes::from_static(&[0, 0, 0, 4, b'p', b'i', b'n', b'g'])).unwrap();

        let event = received.recv().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::Frame {
                id: 7,
                frame: Bytes::from_static(b"pong")
            }
        );

        link.write(Bytes::from_static(&[0, 0, 0, 0])).unwrap();
        link.close();
        assert_eq!(broker.await.unwrap(), vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i32;
        drop(listener);

        let (events, mut received) = mpsc::unbounded_channel();
        let transport = TcpTransport::new(Duration::from_millis(200));
        let _link = transport.open("127.0.0.1", port, 1, events).unwrap();
        assert_matches!(
            received.recv().await,
            Some(TransportEvent::Closed { id: 1, .. })
        );
    }

    #[test]
    fn test_open_requires_runtime() {
        let (events, _received) = mpsc::unbounded_channel();
        let transport = TcpTransport::new(Duration::from_millis(10));
        assert!(transport.open("127.0.0.1", 1, 1, events).is_err());
    }
}
