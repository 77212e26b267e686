//! Local handles for remote objects.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use distobj_common::protocol::{DistobjError, Result, TargetId};

use crate::connection::{ConnectionId, ConnectionInner};
use crate::target::{Payload, Reply};

/// Handle to an object exported by the peer.
///
/// All handles for one target on one connection share a single entry in the
/// connection's proxy table. Cloning a handle adds a holder, dropping one
/// removes it; when the last holder goes away the connection tells the peer
/// it may release the object.
///
/// A handle does not keep its connection alive. Once the connection is shut
/// down or lost, every call through the handle fails with `ConnectionLost`.
pub struct Proxy {
    target: TargetId,
    connection_id: ConnectionId,
    class_hint: Option<Arc<str>>,
    connection: Weak<ConnectionInner>,
}

impl Proxy {
    /// Builds a handle for a holder the caller has already counted.
    pub(crate) fn counted(
        target: TargetId,
        class_hint: Option<Arc<str>>,
        connection: &Arc<ConnectionInner>,
    ) -> Self {
        Self {
            target,
            connection_id: connection.id(),
            class_hint,
            connection: Arc::downgrade(connection),
        }
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn class_hint(&self) -> Option<String> {
        self.class_hint.as_deref().map(str::to_string)
    }

    /// Whether calls through this handle can still reach the peer.
    pub fn is_valid(&self) -> bool {
        self.connection
            .upgrade()
            .is_some_and(|c| c.is_valid() && c.proxy_holders(self.target).is_some())
    }

    /// Number of live handles for this target on this connection.
    pub fn holders(&self) -> usize {
        self.connection
            .upgrade()
            .and_then(|c| c.proxy_holders(self.target))
            .unwrap_or(0)
    }

    fn live_connection(&self) -> Result<Arc<ConnectionInner>> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| DistobjError::ConnectionLost(format!("connection {} is gone", self.connection_id)))?;
        if !connection.is_valid() {
            return Err(DistobjError::ConnectionLost(format!(
                "connection {} has been invalidated",
                self.connection_id
            )));
        }
        Ok(connection)
    }

    /// Sends `selector` with `arguments` and waits for the results.
    pub async fn invoke(&self, selector: &str, arguments: Payload) -> Result<Reply> {
        let connection = self.live_connection()?;
        connection.call(self.target, selector, arguments).await
    }

    /// Sends `selector` without waiting for, or receiving, any reply.
    pub async fn invoke_oneway(&self, selector: &str, arguments: Payload) -> Result<()> {
        let connection = self.live_connection()?;
        connection.call_oneway(self.target, selector, arguments)
    }

    /// Asks the peer for the method type string of `selector`.
    pub async fn method_signature(&self, selector: &str) -> Result<Option<String>> {
        let connection = self.live_connection()?;
        connection.method_signature(self.target, selector).await
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        if let Some(connection) = self.connection.upgrade() {
            connection.retain_holder(self.target);
        }
        Self {
            target: self.target,
            connection_id: self.connection_id,
            class_hint: self.class_hint.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.release_holder(self.target);
        }
    }
}

/// Two handles are equal when they name the same target on the same connection.
impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id && self.target == other.target
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connection_id.hash(state);
        self.target.hash(state);
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("connection", &self.connection_id)
            .field("target", &self.target)
            .field("class", &self.class_hint)
            .finish()
    }
}
