//! Process-wide table of live connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use distobj_common::coder::ClassRegistry;
use distobj_common::protocol::RemoteReference;
use distobj_common::transport::Transport;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionId};
use crate::target::RemoteObject;

pub(crate) struct RegistryInner {
    classes: Arc<ClassRegistry>,
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl RegistryInner {
    pub(crate) fn forget(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }
}

/// Owns the class registry shared by every connection it creates, hands out
/// connection ids and tracks which connections are still alive.
///
/// Clones share the same table. A connection removes itself when it closes.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_classes(ClassRegistry::new())
    }

    /// Registry whose connections can decode the classes in `classes`, in
    /// addition to remote references.
    pub fn with_classes(mut classes: ClassRegistry) -> Self {
        classes.register(RemoteReference::class_info());
        Self {
            inner: Arc::new(RegistryInner {
                classes: Arc::new(classes),
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.inner.classes
    }

    /// Starts a connection over `transport` that exports no root object.
    pub fn attach<T: Transport>(&self, transport: T, config: ConnectionConfig) -> Connection {
        self.start(transport, config, None)
    }

    /// Starts a connection over `transport` whose peer can reach `root`.
    pub fn attach_with_root<T: Transport>(
        &self,
        transport: T,
        config: ConnectionConfig,
        root: Arc<dyn RemoteObject>,
    ) -> Connection {
        self.start(transport, config, Some(root))
    }

    fn start<T: Transport>(
        &self,
        transport: T,
        config: ConnectionConfig,
        root: Option<Arc<dyn RemoteObject>>,
    ) -> Connection {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::spawn(
            id,
            transport,
            config,
            self.inner.classes.clone(),
            root,
            Arc::downgrade(&self.inner),
        );
        self.inner.connections.insert(id, connection.clone());
        // the transport may already have failed before the insert
        if !connection.is_valid() {
            self.inner.forget(id);
        }
        connection
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Shuts down every live connection.
    pub fn shutdown_all(&self) {
        // shutdown removes entries, so the map must not be borrowed meanwhile
        let connections = self.connections();
        info!(count = connections.len(), "shutting down all connections");
        for connection in connections {
            connection.shutdown();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distobj_common::coder::ClassInfo;
    use distobj_common::protocol::DISTANT_OBJECT_CLASS;
    use distobj_common::transport::MemoryTransport;

    #[test]
    fn test_remote_references_always_decodable() {
        let registry = ConnectionRegistry::new();
        assert!(registry.classes().contains(DISTANT_OBJECT_CLASS));

        let registry = ConnectionRegistry::with_classes(ClassRegistry::new().with_class(ClassInfo::new("Point")));
        assert!(registry.classes().contains("Point"));
        assert!(registry.classes().contains(DISTANT_OBJECT_CLASS));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_attach_assigns_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let (a, b) = MemoryTransport::pair();
        let first = registry.attach(a, ConnectionConfig::default());
        let second = registry.attach(b, ConnectionConfig::default());

        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.connection(first.id()).map(|c| c.id()), Some(first.id()));

        first.shutdown();
        assert!(registry.connection(first.id()).is_none());
        assert_eq!(registry.connections().len(), 1);
    }
}
