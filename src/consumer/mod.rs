//! Consumer-group client.
//!
//! [`KafkaConsumer`] owns the configuration and the transport. [`KafkaConsumer::start`] spawns
//! one task that runs the [`CoordinationMachine`]: it ticks on a fixed timer, feeds transport
//! events to the machine and stops when the [`ConsumerHandle`] asks it to.

mod machine;
mod state;

pub use machine::{ConsumedMessage, CoordinationMachine, ErrorContext, MessageSink, Recovery};
pub use state::{StateTable, Step, StepStatus};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::auth::SaslPlainAuthenticator;
use crate::config::ConsumerConfig;
use crate::error::KafkaError;
use crate::protocol::Codec;
use crate::transport::{TcpTransport, Transport, TransportEvent};
use crate::Result;

/// A Kafka consumer that joins a consumer group and delivers the records of its assigned
/// partitions.
///
/// # Examples
///
/// Basic usage:
///
/// ```no_run
/// use tiny_kafka_group::{ConsumedMessage, ConsumerConfig, KafkaConsumer};
///
/// # async fn run() -> tiny_kafka_group::Result<()> {
/// let config = ConsumerConfig::builder()
///     .brokers("localhost:9092")
///     .group_id("my_group")
///     .topic("my_topic")
///     .build()?;
///
/// let consumer = KafkaConsumer::new(config)?;
/// let handle = consumer.start(|message: ConsumedMessage| {
///     println!("{}@{}: {:?}", message.partition, message.offset, message.value);
/// })?;
///
/// // ...
/// handle.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaConsumer {
    config: ConsumerConfig,
    transport: Arc<dyn Transport>,
}

impl KafkaConsumer {
    /// Creates a consumer speaking to brokers over TCP.
    ///
    /// Connections authenticate with SASL/PLAIN when `config.sasl` is set.
    ///
    /// # Errors
    ///
    /// Returns [`KafkaError::ConfigurationError`] when `config` does not validate.
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let mut transport = TcpTransport::new(Duration::from_millis(config.connect_timeout_ms));
        if let Some(sasl) = &config.sasl {
            let codec = Codec::new(config.client_id.clone(), &config.broker_version)?;
            transport = transport.with_authenticator(Arc::new(SaslPlainAuthenticator::new(
                codec,
                sasl.username.clone(),
                sasl.password.clone(),
            )));
        }
        Ok(Self {
            config,
            transport: Arc::new(transport),
        })
    }

    /// Creates a consumer over a caller-supplied transport.
    pub fn with_transport(config: ConsumerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Starts consuming. Every record is handed to `sink` on the coordination task, so the
    /// sink should return quickly.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn start<S>(&self, sink: S) -> Result<ConsumerHandle>
    where
        S: MessageSink + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| KafkaError::connection(format!("no tokio runtime: {}", e)))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let machine = CoordinationMachine::new(
            self.config.clone(),
            self.transport.clone(),
            events_tx,
            Box::new(sink),
            Instant::now(),
        )?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let tick = Duration::from_millis(self.config.tick_interval_ms);
        let task = runtime.spawn(drive(machine, events_rx, shutdown_rx, tick));
        info!(
            group_id = %self.config.group_id,
            topics = ?self.config.topics,
            "consumer started"
        );
        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Starts consuming into a channel.
    pub fn stream(&self) -> Result<(ConsumerHandle, mpsc::UnboundedReceiver<ConsumedMessage>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.start(move |message: ConsumedMessage| {
            let _ = tx.send(message);
        })?;
        Ok((handle, rx))
    }
}

/// Stops a running consumer. Dropping the handle stops it too, without waiting.
pub struct ConsumerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Leaves the group, closes every connection and waits for the task to end.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| KafkaError::connection(format!("consumer task failed: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn drive(
    mut machine: CoordinationMachine,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => machine.tick(Instant::now()),
            Some(event) = events.recv() => machine.handle_event(event, Instant::now()),
        }
    }
    machine.shutdown();
    debug!("coordination loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionId, Link};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Silent {
        opened: Mutex<Vec<ConnectionId>>,
    }

    struct SilentLink;

    impl Link for SilentLink {
        fn write(&self, _frame: Bytes) -> Result<()> {
            Ok(())
        }

        fn close(self: Box<Self>) {}
    }

    impl Transport for Silent {
        fn open(
            &self,
            _host: &str,
            _port: i32,
            id: ConnectionId,
            _events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn Link>> {
            self.opened.lock().unwrap().push(id);
            Ok(Box::new(SilentLink))
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder()
            .brokers("127.0.0.1:9092")
            .group_id("group")
            .topic("test")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_contacts_bootstrap_broker_and_stops() {
        let transport = Arc::new(Silent::default());
        let consumer = KafkaConsumer::with_transport(config(), transport.clone()).unwrap();
        let (handle, _messages) = consumer.stream().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(transport.opened.lock().unwrap().len(), 1);
        tokio_test::assert_ok!(handle.stop().await);
    }

    #[test]
    fn test_start_requires_runtime() {
        let consumer =
            KafkaConsumer::with_transport(config(), Arc::new(Silent::default())).unwrap();
        assert_matches!(
            consumer.start(|_m: ConsumedMessage| {}).err(),
            Some(KafkaError::ConnectionError(_))
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.group_id.clear();
        assert_matches!(
            KafkaConsumer::new(config).err(),
            Some(KafkaError::ConfigurationError(_))
        );
    }
}
