//! Live broker connections, one per `(host, port, role)`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cluster::MetadataProvider;
use crate::error::KafkaError;
use crate::protocol::BrokerEndpoint;
use crate::transport::{ConnectionId, Link, Transport, TransportEvent};
use crate::Result;

/// Traffic class of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Cluster and group coordination requests.
    Meta,
    /// Fetch and produce requests.
    Data,
}

/// How a caller names the broker it wants to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerKey {
    Node(i32),
    /// A literal `host:port`.
    Address(String),
}

impl fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerKey::Node(id) => write!(f, "node {}", id),
            BrokerKey::Address(address) => f.write_str(address),
        }
    }
}

struct Entry {
    host: String,
    port: i32,
    role: ConnectionRole,
    link: Box<dyn Link>,
}

pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    by_endpoint: HashMap<(String, i32, ConnectionRole), ConnectionId>,
    links: HashMap<ConnectionId, Entry>,
    next_id: ConnectionId,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            transport,
            events,
            by_endpoint: HashMap::new(),
            links: HashMap::new(),
            next_id: 1,
        }
    }

    /// Return the live connection for `key`, opening one if needed.
    pub fn get_connection(
        &mut self,
        key: &BrokerKey,
        role: ConnectionRole,
        provider: &dyn MetadataProvider,
    ) -> Result<ConnectionId> {
        let (host, port) = match key {
            BrokerKey::Node(node_id) => {
                let broker = provider
                    .list_brokers()
                    .into_iter()
                    .find(|b| b.node_id == *node_id)
                    .ok_or_else(|| {
                        KafkaError::connection(format!("broker {} is not known", node_id))
                    })?;
                (broker.host, broker.port)
            }
            BrokerKey::Address(address) => parse_address(address)?,
        };
        self.connect(&host, port, role)
    }

    pub fn connect_endpoint(
        &mut self,
        endpoint: &BrokerEndpoint,
        role: ConnectionRole,
    ) -> Result<ConnectionId> {
        self.connect(&endpoint.host, endpoint.port, role)
    }

    /// Connection to a broker picked uniformly among those `provider` knows.
    /// `Ok(None)` means no broker is known yet.
    pub fn get_random_connection(
        &mut self,
        role: ConnectionRole,
        provider: &dyn MetadataProvider,
    ) -> Result<Option<ConnectionId>> {
        let brokers = provider.list_brokers();
        match brokers.choose(&mut rand::thread_rng()) {
            Some(broker) => self.connect_endpoint(broker, role).map(Some),
            None => Ok(None),
        }
    }

    fn connect(&mut self, host: &str, port: i32, role: ConnectionRole) -> Result<ConnectionId> {
        let key = (host.to_string(), port, role);
        if let Some(id) = self.by_endpoint.get(&key) {
            return Ok(*id);
        }
        let id = self.next_id;
        self.next_id += 1;
        let link = self.transport.open(host, port, id, self.events.clone())?;
        debug!(broker = %format!("{}:{}", host, port), ?role, id, "opened connection");
        self.by_endpoint.insert(key, id);
        self.links.insert(
            id,
            Entry {
                host: host.to_string(),
                port,
                role,
                link,
            },
        );
        Ok(id)
    }

    pub fn write(&self, id: ConnectionId, frame: Bytes) -> Result<()> {
        let entry = self
            .links
            .get(&id)
            .ok_or_else(|| KafkaError::connection(format!("connection {} is gone", id)))?;
        trace!(id, bytes = frame.len(), "queue request");
        entry.link.write(frame)
    }

    /// Forget a connection the transport reported closed. The next lookup for the same
    /// endpoint opens a fresh one.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.links.remove(&id) {
            Some(entry) => {
                self.by_endpoint.remove(&(entry.host, entry.port, entry.role));
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        debug!(connections = self.links.len(), "closing all connections");
        self.by_endpoint.clear();
        for (_, entry) in self.links.drain() {
            entry.link.close();
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

fn parse_address(address: &str) -> Result<(String, i32)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| KafkaError::connection(format!("`{}` is not host:port", address)))?;
    let port = port
        .parse::<i32>()
        .map_err(|_| KafkaError::connection(format!("`{}` has an invalid port", address)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticBrokerList;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Opened {
        endpoints: Mutex<Vec<(String, i32, ConnectionId)>>,
        closed: Arc<Mutex<Vec<ConnectionId>>>,
        written: Arc<Mutex<Vec<(ConnectionId, Bytes)>>>,
    }

    struct FakeLink {
        id: ConnectionId,
        closed: Arc<Mutex<Vec<ConnectionId>>>,
        written: Arc<Mutex<Vec<(ConnectionId, Bytes)>>>,
    }

    impl Link for FakeLink {
        fn write(&self, frame: Bytes) -> Result<()> {
            self.written.lock().unwrap().push((self.id, frame));
            Ok(())
        }

        fn close(self: Box<Self>) {
            self.closed.lock().unwrap().push(self.id);
        }
    }

    impl Transport for Opened {
        fn open(
            &self,
            host: &str,
            port: i32,
            id: ConnectionId,
            _events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn Link>> {
            self.endpoints.lock().unwrap().push((host.to_string(), port, id));
            Ok(Box::new(FakeLink {
                id,
                closed: self.closed.clone(),
                written: self.written.clone(),
            }))
        }
    }

    fn registry() -> (ConnectionRegistry, Arc<Opened>) {
        let transport = Arc::new(Opened::default());
        let (events, _) = mpsc::unbounded_channel();
        (ConnectionRegistry::new(transport.clone(), events), transport)
    }

    fn brokers() -> StaticBrokerList {
        StaticBrokerList::new(vec![("10.0.0.1".into(), 9092)])
    }

    #[test]
    fn test_deduplicates_by_endpoint_and_role() {
        let (mut registry, transport) = registry();
        let provider = brokers();
        let meta = registry
            .get_connection(&BrokerKey::Node(-1), ConnectionRole::Meta, &provider)
            .unwrap();
        let same = registry
            .get_connection(&BrokerKey::Address("10.0.0.1:9092".into()), ConnectionRole::Meta, &provider)
            .unwrap();
        let data = registry
            .get_connection(&BrokerKey::Node(-1), ConnectionRole::Data, &provider)
            .unwrap();
        assert_eq!(meta, same);
        assert_ne!(meta, data);
        assert_eq!(transport.endpoints.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_node_is_connection_error() {
        let (mut registry, _) = registry();
        assert_matches!(
            registry.get_connection(&BrokerKey::Node(5), ConnectionRole::Meta, &brokers()),
            Err(KafkaError::ConnectionError(_))
        );
    }

    #[test]
    fn test_random_connection_without_brokers() {
        let (mut registry, _) = registry();
        let empty = StaticBrokerList::new(vec![]);
        assert_eq!(registry.get_random_connection(ConnectionRole::Meta, &empty).unwrap(), None);
        assert!(registry
            .get_random_connection(ConnectionRole::Meta, &brokers())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_remove_then_reconnect() {
        let (mut registry, transport) = registry();
        let provider = brokers();
        let first = registry
            .get_connection(&BrokerKey::Node(-1), ConnectionRole::Meta, &provider)
            .unwrap();
        registry.write(first, Bytes::from_static(b"x")).unwrap();
        assert!(registry.remove(first));
        assert_matches!(registry.write(first, Bytes::new()), Err(KafkaError::ConnectionError(_)));
        let second = registry
            .get_connection(&BrokerKey::Node(-1), ConnectionRole::Meta, &provider)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(transport.written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_close_all() {
        let (mut registry, transport) = registry();
        let provider = brokers();
        registry
            .get_connection(&BrokerKey::Node(-1), ConnectionRole::Meta, &provider)
            .unwrap();
        registry
            .get_connection(&BrokerKey::Node(-1), ConnectionRole::Data, &provider)
            .unwrap();
        registry.close_all();
        assert!(registry.is_empty());
        assert_eq!(transport.closed.lock().unwrap().len(), 2);
    }
}
