//! Objects that can be invoked remotely, and the values passed to and from them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use distobj_common::coder::{Archive, ObjectGraph, ObjectId, Value};
use distobj_common::protocol::{Origin, RemoteReference, Result};

use crate::connection::Connection;
use crate::proxy::Proxy;

/// An object that can be exported over a connection.
///
/// The connection calls [`invoke`](RemoteObject::invoke) for every method
/// request addressed to the object. Calls may run concurrently, including
/// nested calls made while another call on the same object is waiting for
/// the peer.
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Class name hint sent along with references to this object.
    fn class_name(&self) -> &str {
        "Object"
    }

    /// Method type string for `selector` (for example `"q@:qq"`), if known.
    ///
    /// When a signature is published, incoming arguments are checked against
    /// it before `invoke` runs.
    fn method_signature(&self, _selector: &str) -> Option<String> {
        None
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Payload>;
}

/// Values being sent: method arguments or results.
///
/// Local objects added with [`export`](Payload::export) travel by reference;
/// the peer receives a proxy for them.
#[derive(Default)]
pub struct Payload {
    archive: Archive,
    exports: Vec<(ObjectId, Arc<dyn RemoteObject>)>,
    passbacks: Vec<(ObjectId, Proxy)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends the roots of an existing archive.
    pub fn from_archive(archive: Archive) -> Self {
        Self {
            archive,
            ..Self::default()
        }
    }

    /// Appends a root value.
    pub fn with(mut self, value: Value) -> Self {
        self.push(value);
        self
    }

    pub fn push(&mut self, value: Value) {
        self.archive.roots.push(value);
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.archive.graph
    }

    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        &mut self.archive.graph
    }

    pub fn roots(&self) -> &[Value] {
        &self.archive.roots
    }

    /// Adds a C string to the payload's graph.
    pub fn cstring(&mut self, text: &str) -> Value {
        self.archive.graph.cstring(text)
    }

    /// Adds a by-reference slot for `object`. The returned value can be used
    /// as a root or as a field of another object in this payload.
    pub fn export(&mut self, object: Arc<dyn RemoteObject>) -> Value {
        // the target id is filled in when the payload is marshaled
        let reference = RemoteReference::new(0, Origin::Sender).with_class_hint(object.class_name());
        let node = reference.insert_into(&mut self.archive.graph);
        self.exports.push((node, object));
        Value::Object(Some(node))
    }

    /// Adds a reference to a proxy's remote object. The peer that exported
    /// the object receives its own object back.
    pub fn proxy(&mut self, proxy: &Proxy) -> Value {
        let mut reference = RemoteReference::new(proxy.target(), Origin::Receiver);
        reference.class_hint = proxy.class_hint();
        let node = reference.insert_into(&mut self.archive.graph);
        self.passbacks.push((node, proxy.clone()));
        Value::Object(Some(node))
    }

    pub(crate) fn into_parts(self) -> (Archive, Vec<(ObjectId, Arc<dyn RemoteObject>)>, Vec<(ObjectId, Proxy)>) {
        (self.archive, self.exports, self.passbacks)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("roots", &self.archive.roots)
            .field("exports", &self.exports.len())
            .field("passbacks", &self.passbacks.len())
            .finish()
    }
}

/// Values received from the peer, with references already resolved.
///
/// References to objects the peer exports became [`Proxy`] handles; this
/// value holds one reference on each until it is dropped.
pub struct Received {
    archive: Archive,
    proxies: HashMap<ObjectId, Proxy>,
    locals: HashMap<ObjectId, Arc<dyn RemoteObject>>,
    /// Proxy granted by a positive retain reply.
    retained: Option<Proxy>,
}

/// Results of a remote call.
pub type Reply = Received;

impl Received {
    pub(crate) fn new(
        archive: Archive,
        proxies: HashMap<ObjectId, Proxy>,
        locals: HashMap<ObjectId, Arc<dyn RemoteObject>>,
    ) -> Self {
        Self {
            archive,
            proxies,
            locals,
            retained: None,
        }
    }

    pub(crate) fn with_retained(mut self, proxy: Proxy) -> Self {
        self.retained = Some(proxy);
        self
    }

    pub(crate) fn retained(&self) -> Option<Proxy> {
        self.retained.clone()
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.archive.graph
    }

    pub fn roots(&self) -> &[Value] {
        &self.archive.roots
    }

    pub fn root(&self, index: usize) -> Option<&Value> {
        self.archive.roots.get(index)
    }

    pub fn text(&self, value: &Value) -> Option<&str> {
        self.archive.graph.text(value)
    }

    /// Proxy for a value referring to an object the peer exports.
    pub fn proxy(&self, value: &Value) -> Option<Proxy> {
        value.as_object().and_then(|id| self.proxies.get(&id)).cloned()
    }

    /// Local object for a value referring to one of our own exports.
    pub fn local(&self, value: &Value) -> Option<Arc<dyn RemoteObject>> {
        value.as_object().and_then(|id| self.locals.get(&id)).cloned()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Drops the resolved references and returns the raw archive.
    pub fn into_archive(self) -> Archive {
        self.archive
    }
}

impl fmt::Debug for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received")
            .field("roots", &self.archive.roots)
            .field("proxies", &self.proxies)
            .field("locals", &self.locals.len())
            .finish()
    }
}

/// One incoming method call.
pub struct Invocation {
    selector: String,
    arguments: Received,
    connection: Connection,
}

impl Invocation {
    pub(crate) fn new(selector: String, arguments: Received, connection: Connection) -> Self {
        Self {
            selector,
            arguments,
            connection,
        }
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn arguments(&self) -> &Received {
        &self.arguments
    }

    pub fn argument(&self, index: usize) -> Option<&Value> {
        self.arguments.root(index)
    }

    /// The connection the call arrived on, for calling back into the peer.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn into_arguments(self) -> Received {
        self.arguments
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("selector", &self.selector)
            .field("arguments", &self.arguments)
            .field("connection", &self.connection.id())
            .finish()
    }
}
