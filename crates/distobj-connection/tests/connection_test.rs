//! Connection Integration Tests
//!
//! Two connections joined by an in-memory transport, or one connection facing
//! a hand-driven peer when the test needs to control the wire. Tests cover:
//! 1. Root proxies and method calls
//! 2. Reply matching, timeouts and late replies
//! 3. Reference counting of exported objects
//! 4. Objects passed by reference in both directions
//! 5. Shutdown and cleanup after failed decodes

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use distobj_common::coder::{Archive, ObjectGraph, Value};
use distobj_common::protocol::payload::{
    decode_count, decode_method_call, decode_reply, encode_method_call, encode_retain_reply, encode_success,
};
use distobj_common::protocol::{
    DistobjError, Envelope, FailureKind, MessageKind, Origin, RemoteReference, ReplyOutcome, Result, TargetId,
};
use distobj_common::transport::{
    FrameSink, FrameSource, MemoryFrameSink, MemoryFrameSource, MemoryTransport, Transport,
};
use distobj_connection::{
    connect, Connection, ConnectionConfig, ConnectionRegistry, Invocation, Payload, RemoteObject, Server,
};
use parking_lot::Mutex;

// ============================================================================
// Test objects
// ============================================================================

#[derive(Default)]
struct Counter {
    value: AtomicI64,
}

#[async_trait]
impl RemoteObject for Counter {
    fn class_name(&self) -> &str {
        "Counter"
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        match invocation.selector() {
            "increment" => {
                let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Payload::new().with(Value::Long(value)))
            }
            "value" => Ok(Payload::new().with(Value::Long(self.value.load(Ordering::SeqCst)))),
            other => Err(DistobjError::RemoteInvocation(format!("Counter does not respond to {}", other))),
        }
    }
}

struct Pinger;

#[async_trait]
impl RemoteObject for Pinger {
    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        match invocation.selector() {
            "ping" => Ok(Payload::new().with(Value::Long(7))),
            other => Err(DistobjError::RemoteInvocation(format!("Pinger does not respond to {}", other))),
        }
    }
}

#[derive(Default)]
struct Calculator {
    shared: Weak<Counter>,
    recorded: Mutex<Vec<i64>>,
}

impl Calculator {
    fn sharing(counter: &Arc<Counter>) -> Self {
        Self {
            shared: Arc::downgrade(counter),
            ..Self::default()
        }
    }
}

fn same_object(a: &Arc<dyn RemoteObject>, b: &Arc<dyn RemoteObject>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[async_trait]
impl RemoteObject for Calculator {
    fn class_name(&self) -> &str {
        "Calculator"
    }

    fn method_signature(&self, selector: &str) -> Option<String> {
        match selector {
            "add:to:" => Some("q@:qq".to_string()),
            "echo:" => Some("*@:*".to_string()),
            _ => None,
        }
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        let arguments = invocation.arguments();
        match invocation.selector() {
            "add:to:" => {
                let a = invocation.argument(0).and_then(Value::as_i64).unwrap_or_default();
                let b = invocation.argument(1).and_then(Value::as_i64).unwrap_or_default();
                Ok(Payload::new().with(Value::Long(a + b)))
            }
            "echo:" => {
                let text = invocation
                    .argument(0)
                    .and_then(|v| arguments.text(v))
                    .unwrap_or_default()
                    .to_string();
                let mut payload = Payload::new();
                let value = payload.cstring(&text);
                Ok(payload.with(value))
            }
            "fail" => Err(DistobjError::RemoteInvocation("asked to fail".into())),
            "shared" => {
                let counter = self
                    .shared
                    .upgrade()
                    .ok_or_else(|| DistobjError::RemoteInvocation("shared counter is gone".into()))?;
                let mut payload = Payload::new();
                let value = payload.export(counter);
                Ok(payload.with(value))
            }
            "isShared:" => {
                let local = invocation.argument(0).and_then(|v| arguments.local(v));
                let shared = self.shared.upgrade().map(|c| c as Arc<dyn RemoteObject>);
                let same = matches!((local, shared), (Some(a), Some(b)) if same_object(&a, &b));
                Ok(Payload::new().with(Value::Bool(same)))
            }
            "callback:" => {
                let proxy = invocation
                    .argument(0)
                    .and_then(|v| arguments.proxy(v))
                    .ok_or_else(|| DistobjError::ProtocolViolation("callback: needs an object".into()))?;
                let reply = proxy.invoke("ping", Payload::new()).await?;
                let value = reply.root(0).cloned().unwrap_or(Value::Object(None));
                Ok(Payload::new().with(value))
            }
            "record:" => {
                let value = invocation.argument(0).and_then(Value::as_i64).unwrap_or_default();
                self.recorded.lock().push(value);
                Ok(Payload::new())
            }
            other => Err(DistobjError::RemoteInvocation(format!("Calculator does not respond to {}", other))),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// A server connection exporting `root`, linked to a client connection.
fn linked_pair(root: Arc<dyn RemoteObject>) -> (ConnectionRegistry, Connection, Connection) {
    let registry = ConnectionRegistry::new();
    let (a, b) = MemoryTransport::pair();
    let server = registry.attach_with_root(a, ConnectionConfig::default(), root);
    let client = registry.attach(b, ConnectionConfig::default());
    (registry, server, client)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5 seconds");
}

/// The far end of a connection, driven by hand.
struct RawPeer {
    sink: MemoryFrameSink,
    source: MemoryFrameSource,
}

impl RawPeer {
    /// A connection under test facing a raw peer.
    fn attach(config: ConnectionConfig) -> (ConnectionRegistry, Connection, RawPeer) {
        let registry = ConnectionRegistry::new();
        let (a, b) = MemoryTransport::pair();
        let connection = registry.attach(a, config);
        let (sink, source) = b.split();
        (registry, connection, RawPeer { sink, source })
    }

    async fn send(&mut self, envelope: Envelope) {
        self.sink.send_frame(envelope.encode().to_vec()).await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.source.recv_frame())
            .await
            .expect("no frame from connection")
            .unwrap()
            .expect("connection closed the transport");
        Envelope::decode(&frame).unwrap()
    }

    /// Answers the connection's root proxy request with a reference to `target`.
    async fn serve_root(&mut self, target: TargetId) {
        let request = self.recv().await;
        assert_eq!(request.kind, MessageKind::RootProxyRequest);
        self.reply_references(MessageKind::RootProxyReply, request.sequence, &[(target, Origin::Sender)])
            .await;
    }

    async fn reply_references(&mut self, kind: MessageKind, sequence: u32, references: &[(TargetId, Origin)]) {
        let mut graph = ObjectGraph::new();
        let roots = references
            .iter()
            .map(|&(target, origin)| Value::Object(Some(RemoteReference::new(target, origin).insert_into(&mut graph))))
            .collect();
        self.reply(kind, sequence, Archive::new(graph, roots)).await;
    }

    async fn reply(&mut self, kind: MessageKind, sequence: u32, results: Archive) {
        let payload = encode_success(&results).unwrap().into_data();
        self.send(Envelope::reply(kind, sequence, payload)).await;
    }
}

// ============================================================================
// Root proxies and calls
// ============================================================================

#[tokio::test]
async fn test_root_proxy_and_invoke() {
    let (_registry, server, client) = linked_pair(Arc::new(Calculator::default()));

    let root = client.root_proxy().await.unwrap();
    assert_eq!(root.class_hint().as_deref(), Some("Calculator"));
    assert!(root.is_valid());

    let reply = root
        .invoke("add:to:", Payload::new().with(Value::Long(2)).with(Value::Long(40)))
        .await
        .unwrap();
    assert_eq!(reply.root(0), Some(&Value::Long(42)));

    let stats = client.stats();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.replies_received, 2);
    wait_for(|| server.stats().requests_served == 2).await;
}

#[tokio::test]
async fn test_root_proxy_is_reused() {
    let calculator: Arc<dyn RemoteObject> = Arc::new(Calculator::default());
    let (_registry, server, client) = linked_pair(calculator.clone());

    let first = client.root_proxy().await.unwrap();
    let second = client.root_proxy().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.holders(), 2);
    assert_eq!(client.proxy_count(), 1);
    assert_eq!(client.stats().requests_sent, 1);

    let target = server.exported_target(&calculator).unwrap();
    assert_eq!(target, first.target());
    assert_eq!(server.remote_interest(target), Some(1));
}

#[tokio::test]
async fn test_strings_travel_by_copy() {
    let (_registry, _server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();

    let mut arguments = Payload::new();
    let text = arguments.cstring("hello, peer");
    let reply = root.invoke("echo:", arguments.with(text)).await.unwrap();
    let value = reply.root(0).unwrap();
    assert_eq!(reply.text(value), Some("hello, peer"));
}

#[tokio::test]
async fn test_remote_failure_is_reported() {
    let (_registry, server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();

    let err = root.invoke("fail", Payload::new()).await.unwrap_err();
    assert!(matches!(err, DistobjError::RemoteInvocation(ref msg) if msg == "asked to fail"));

    // the connection survives a failed call
    let reply = root.invoke("add:to:", Payload::new().with(Value::Long(1)).with(Value::Long(1))).await;
    assert!(reply.is_ok());
    wait_for(|| server.stats().error_replies_sent == 1).await;
}

#[tokio::test]
async fn test_signature_mismatch_is_rejected() {
    let (_registry, _server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();

    let mut arguments = Payload::new();
    let text = arguments.cstring("two");
    let err = root
        .invoke("add:to:", arguments.with(Value::Long(1)).with(text))
        .await
        .unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));

    let err = root.invoke("add:to:", Payload::new().with(Value::Long(1))).await.unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));
}

#[tokio::test]
async fn test_rejected_call_releases_exported_arguments() {
    let (_registry, server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();
    let pinger: Arc<dyn RemoteObject> = Arc::new(Pinger);

    let mut arguments = Payload::new();
    let value = arguments.export(pinger.clone());
    let err = root
        .invoke("add:to:", arguments.with(value).with(Value::Long(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));

    wait_for(|| client.exported_target(&pinger).is_none()).await;
    assert_eq!(client.local_target_count(), 0);
    assert_eq!(server.proxy_count(), 0);

    // a oneway call dropped for the same reason releases too
    let mut arguments = Payload::new();
    let value = arguments.export(pinger.clone());
    root.invoke_oneway("add:to:", arguments.with(value).with(Value::Long(1)))
        .await
        .unwrap();
    wait_for(|| server.stats().requests_served == 3).await;
    wait_for(|| client.exported_target(&pinger).is_none()).await;
    assert_eq!(client.stats().releases_sent, 0);
    assert_eq!(server.stats().releases_sent, 2);
}

#[tokio::test]
async fn test_method_signature_lookup() {
    let (_registry, _server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();

    assert_eq!(root.method_signature("add:to:").await.unwrap().as_deref(), Some("q@:qq"));
    assert_eq!(root.method_signature("nothing").await.unwrap(), None);
}

#[tokio::test]
async fn test_oneway_call_gets_no_reply() {
    let calculator = Arc::new(Calculator::default());
    let (_registry, server, client) = linked_pair(calculator.clone());
    let root = client.root_proxy().await.unwrap();

    root.invoke_oneway("record:", Payload::new().with(Value::Long(5)))
        .await
        .unwrap();
    wait_for(|| *calculator.recorded.lock() == vec![5]).await;

    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.stats().replies_received, 1);
    wait_for(|| server.stats().requests_served == 2).await;
}

#[tokio::test]
async fn test_no_root_object() {
    let registry = ConnectionRegistry::new();
    let (a, b) = MemoryTransport::pair();
    let _silent = registry.attach(a, ConnectionConfig::default());
    let client = registry.attach(b, ConnectionConfig::default());

    let err = client.root_proxy().await.unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));
}

// ============================================================================
// Reply matching
// ============================================================================

#[tokio::test]
async fn test_unknown_target_gets_error_reply() {
    let registry = ConnectionRegistry::new();
    let (a, b) = MemoryTransport::pair();
    let _served = registry.attach_with_root(a, ConnectionConfig::default(), Arc::new(Calculator::default()));
    let (sink, source) = b.split();
    let mut peer = RawPeer { sink, source };

    let payload = encode_method_call("add:to:", 0, &Archive::default()).unwrap().into_data();
    peer.send(Envelope::method_request(41, 999, payload)).await;

    let reply = peer.recv().await;
    assert_eq!(reply.kind, MessageKind::MethodReply);
    assert_eq!(reply.sequence, 41);
    match decode_reply(&reply.payload, registry.classes()).unwrap() {
        ReplyOutcome::Failure(failure) => assert_eq!(failure.kind, FailureKind::ProtocolViolation),
        other => panic!("expected a failure reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_garbage_request_gets_error_reply() {
    let registry = ConnectionRegistry::new();
    let (a, b) = MemoryTransport::pair();
    let _served = registry.attach_with_root(a, ConnectionConfig::default(), Arc::new(Calculator::default()));
    let (sink, source) = b.split();
    let mut peer = RawPeer { sink, source };

    // a method request whose payload is not an archive
    let mut frame = Envelope::method_request(8, 1, vec![0u8]).encode().to_vec();
    frame.extend_from_slice(&[0xff; 3]);
    peer.sink.send_frame(frame).await.unwrap();

    let reply = peer.recv().await;
    assert_eq!(reply.kind, MessageKind::MethodReply);
    assert_eq!(reply.sequence, 8);
    match decode_reply(&reply.payload, registry.classes()).unwrap() {
        ReplyOutcome::Failure(failure) => assert_eq!(failure.kind, FailureKind::MalformedStream),
        other => panic!("expected a failure reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_out_of_order_replies() {
    let (registry, connection, mut peer) = RawPeer::attach(ConnectionConfig::default());

    let bootstrap = tokio::spawn({
        let connection = connection.clone();
        async move { connection.root_proxy().await }
    });
    peer.serve_root(3).await;
    let root = bootstrap.await.unwrap().unwrap();

    let first = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("first", Payload::new()).await }
    });
    let second = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("second", Payload::new()).await }
    });

    let mut sequences = std::collections::HashMap::new();
    for _ in 0..2 {
        let request = peer.recv().await;
        assert_eq!(request.kind, MessageKind::MethodRequest);
        assert_eq!(request.target, Some(3));
        let call = decode_method_call(&request.payload, registry.classes()).unwrap();
        sequences.insert(call.selector, request.sequence);
    }

    let answer = |n: i64| Archive::new(ObjectGraph::new(), vec![Value::Long(n)]);
    peer.reply(MessageKind::MethodReply, sequences["second"], answer(2)).await;
    peer.reply(MessageKind::MethodReply, sequences["first"], answer(1)).await;

    assert_eq!(second.await.unwrap().unwrap().root(0), Some(&Value::Long(2)));
    assert_eq!(first.await.unwrap().unwrap().root(0), Some(&Value::Long(1)));
    assert_eq!(connection.pending_requests(), 0);
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let config = ConnectionConfig::default().with_reply_timeout(Duration::from_millis(100));
    let (_registry, connection, mut peer) = RawPeer::attach(config);

    let bootstrap = tokio::spawn({
        let connection = connection.clone();
        async move { connection.root_proxy().await }
    });
    peer.serve_root(1).await;
    let root = bootstrap.await.unwrap().unwrap();

    let call = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("slow", Payload::new()).await }
    });
    let request = peer.recv().await;
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, DistobjError::ConnectionLost(_)));
    assert_eq!(connection.pending_requests(), 0);

    // the reply arrives after the caller gave up and vends an object
    peer.reply_references(MessageKind::MethodReply, request.sequence, &[(9, Origin::Sender)])
        .await;

    let release = peer.recv().await;
    assert_eq!(release.kind, MessageKind::ProxyRelease);
    assert_eq!(release.target, Some(9));
    assert_eq!(decode_count(&release.payload, connection.classes()).unwrap(), 1);

    let stats = connection.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.late_replies_discarded, 1);
    assert_eq!(stats.releases_sent, 1);
    assert_eq!(connection.proxy_count(), 1);
    assert!(root.is_valid());
}

#[tokio::test]
async fn test_failed_decode_releases_minted_proxies() {
    let (_registry, connection, mut peer) = RawPeer::attach(ConnectionConfig::default());

    let bootstrap = tokio::spawn({
        let connection = connection.clone();
        async move { connection.root_proxy().await }
    });
    peer.serve_root(1).await;
    let root = bootstrap.await.unwrap().unwrap();

    let call = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("pair", Payload::new()).await }
    });
    let request = peer.recv().await;
    // the second reference names an object this side never exported
    peer.reply_references(
        MessageKind::MethodReply,
        request.sequence,
        &[(5, Origin::Sender), (77, Origin::Receiver)],
    )
    .await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));

    let release = peer.recv().await;
    assert_eq!(release.kind, MessageKind::ProxyRelease);
    assert_eq!(release.target, Some(5));
    assert_eq!(decode_count(&release.payload, connection.classes()).unwrap(), 1);
    assert_eq!(connection.proxy_holders(5), None);
    assert_eq!(connection.proxy_holders(1), Some(1));
}

// ============================================================================
// Reference counting
// ============================================================================

#[tokio::test]
async fn test_released_target_becomes_reclaimable() {
    let counter = Arc::new(Counter::default());
    let weak = Arc::downgrade(&counter);
    let (_registry, server, client) = linked_pair(Arc::new(Calculator::sharing(&counter)));
    let root = client.root_proxy().await.unwrap();

    let mut proxies = Vec::new();
    for _ in 0..5 {
        let reply = root.invoke("shared", Payload::new()).await.unwrap();
        proxies.push(reply.proxy(reply.root(0).unwrap()).unwrap());
    }
    let target = proxies[0].target();
    assert!(proxies.iter().all(|p| *p == proxies[0]));
    assert_eq!(proxies[0].class_hint().as_deref(), Some("Counter"));
    assert_eq!(proxies[0].holders(), 5);
    assert_eq!(client.proxy_count(), 2);
    assert_eq!(server.remote_interest(target), Some(5));

    let reply = proxies[0].invoke("increment", Payload::new()).await.unwrap();
    assert_eq!(reply.root(0), Some(&Value::Long(1)));

    // only the connection keeps the counter alive now
    drop(counter);
    assert!(weak.upgrade().is_some());

    proxies.truncate(1);
    assert_eq!(proxies[0].holders(), 1);
    assert_eq!(server.remote_interest(target), Some(5));

    drop(proxies);
    wait_for(|| server.remote_interest(target).is_none()).await;
    assert!(weak.upgrade().is_none());
    assert_eq!(client.proxy_count(), 1);
    assert_eq!(client.stats().releases_sent, 1);
    assert_eq!(server.stats().releases_received, 1);
}

#[tokio::test]
async fn test_root_stays_exported_after_release() {
    let calculator: Arc<dyn RemoteObject> = Arc::new(Calculator::default());
    let (_registry, server, client) = linked_pair(calculator.clone());

    let root = client.root_proxy().await.unwrap();
    let target = root.target();
    drop(root);
    assert_eq!(client.proxy_count(), 0);

    // the release is processed before the retain, both travel on one link
    let again = client.proxy_for_target(target).await.unwrap();
    assert_eq!(again.target(), target);
    assert_eq!(server.remote_interest(target), Some(1));
    assert_eq!(server.exported_target(&calculator), Some(target));

    let reused = client.proxy_for_target(target).await.unwrap();
    assert_eq!(reused.holders(), 2);

    let err = client.proxy_for_target(12345).await.unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));
}

#[tokio::test]
async fn test_late_retain_reply_is_released() {
    let config = ConnectionConfig::default().with_reply_timeout(Duration::from_millis(100));
    let (_registry, connection, mut peer) = RawPeer::attach(config);

    let retain = tokio::spawn({
        let connection = connection.clone();
        async move { connection.proxy_for_target(4).await }
    });
    let request = peer.recv().await;
    assert_eq!(request.kind, MessageKind::ProxyRetain);
    assert_eq!(request.target, Some(4));
    let err = retain.await.unwrap().unwrap_err();
    assert!(matches!(err, DistobjError::ConnectionLost(_)));

    // the peer granted the retain after the caller gave up
    let payload = encode_retain_reply(4, true).unwrap();
    peer.send(Envelope::reply(MessageKind::RetainReply, request.sequence, payload)).await;

    let release = peer.recv().await;
    assert_eq!(release.kind, MessageKind::ProxyRelease);
    assert_eq!(release.target, Some(4));
    assert_eq!(decode_count(&release.payload, connection.classes()).unwrap(), 1);
    assert_eq!(connection.proxy_count(), 0);
    assert_eq!(connection.stats().late_replies_discarded, 1);
}

#[tokio::test]
async fn test_retain_reply_grants_proxy() {
    let (_registry, connection, mut peer) = RawPeer::attach(ConnectionConfig::default());

    let retain = tokio::spawn({
        let connection = connection.clone();
        async move { connection.proxy_for_target(6).await }
    });
    let request = peer.recv().await;
    let payload = encode_retain_reply(6, true).unwrap();
    peer.send(Envelope::reply(MessageKind::RetainReply, request.sequence, payload)).await;

    let proxy = retain.await.unwrap().unwrap();
    assert_eq!(proxy.target(), 6);
    assert_eq!(proxy.holders(), 1);

    drop(proxy);
    let release = peer.recv().await;
    assert_eq!(release.target, Some(6));
    assert_eq!(decode_count(&release.payload, connection.classes()).unwrap(), 1);
}

// ============================================================================
// Objects by reference
// ============================================================================

#[tokio::test]
async fn test_callback_through_exported_argument() {
    let (_registry, _server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();

    let pinger: Arc<dyn RemoteObject> = Arc::new(Pinger);
    let mut arguments = Payload::new();
    let value = arguments.export(pinger.clone());
    let reply = root.invoke("callback:", arguments.with(value)).await.unwrap();
    assert_eq!(reply.root(0), Some(&Value::Long(7)));

    // the peer dropped its proxy once the call finished
    wait_for(|| client.exported_target(&pinger).is_none()).await;
    assert_eq!(client.local_target_count(), 0);
}

#[tokio::test]
async fn test_proxy_passed_back_resolves_to_original() {
    let counter = Arc::new(Counter::default());
    let (_registry, _server, client) = linked_pair(Arc::new(Calculator::sharing(&counter)));
    let root = client.root_proxy().await.unwrap();

    let reply = root.invoke("shared", Payload::new()).await.unwrap();
    let shared = reply.proxy(reply.root(0).unwrap()).unwrap();

    let mut arguments = Payload::new();
    let value = arguments.proxy(&shared);
    let reply = root.invoke("isShared:", arguments.with(value)).await.unwrap();
    assert_eq!(reply.root(0), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_proxy_from_other_connection_is_rejected() {
    let registry = ConnectionRegistry::new();
    let (a1, b1) = MemoryTransport::pair();
    let (a2, b2) = MemoryTransport::pair();
    let _s1 = registry.attach_with_root(a1, ConnectionConfig::default(), Arc::new(Calculator::default()));
    let _s2 = registry.attach_with_root(a2, ConnectionConfig::default(), Arc::new(Calculator::default()));
    let c1 = registry.attach(b1, ConnectionConfig::default());
    let c2 = registry.attach(b2, ConnectionConfig::default());

    let foreign = c1.root_proxy().await.unwrap();
    let root = c2.root_proxy().await.unwrap();

    let mut arguments = Payload::new();
    let value = arguments.proxy(&foreign);
    let err = root.invoke("isShared:", arguments.with(value)).await.unwrap_err();
    assert!(matches!(err, DistobjError::ProtocolViolation(_)));
    assert_eq!(c2.pending_requests(), 0);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_invalidates_proxies() {
    let (registry, server, client) = linked_pair(Arc::new(Calculator::default()));
    let root = client.root_proxy().await.unwrap();
    assert_eq!(registry.len(), 2);

    client.shutdown();
    assert!(!client.is_valid());
    assert!(!root.is_valid());
    assert_eq!(root.holders(), 0);

    let err = root.invoke("add:to:", Payload::new()).await.unwrap_err();
    assert!(matches!(err, DistobjError::ConnectionLost(_)));

    wait_for(|| !server.is_valid()).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_closed_waits_for_shutdown_notice() {
    let (_registry, connection, mut peer) = RawPeer::attach(ConnectionConfig::default());

    connection.shutdown();
    tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .expect("writer did not finish");

    let notice = peer.recv().await;
    assert_eq!(notice.kind, MessageKind::ConnectionShutdown);
    assert_eq!(peer.source.recv_frame().await.unwrap(), None);

    // already closed: resolves immediately
    connection.closed().await;
}

#[tokio::test]
async fn test_shutdown_fails_pending_requests() {
    let (_registry, connection, mut peer) = RawPeer::attach(ConnectionConfig::default());

    let bootstrap = tokio::spawn({
        let connection = connection.clone();
        async move { connection.root_proxy().await }
    });
    peer.serve_root(1).await;
    let root = bootstrap.await.unwrap().unwrap();

    let call = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("never", Payload::new()).await }
    });
    peer.recv().await;
    peer.send(Envelope::shutdown()).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, DistobjError::ConnectionLost(_)));
    assert!(!connection.is_valid());
    assert!(!root.is_valid());
}

#[tokio::test]
async fn test_transport_loss_invalidates() {
    let (_registry, connection, peer) = RawPeer::attach(ConnectionConfig::default());
    drop(peer);

    wait_for(|| !connection.is_valid()).await;
    let err = connection.root_proxy().await.unwrap_err();
    assert!(matches!(err, DistobjError::ConnectionLost(_)));
}

#[tokio::test]
async fn test_shutdown_all() {
    let (registry, server, client) = linked_pair(Arc::new(Calculator::default()));
    registry.shutdown_all();

    assert!(registry.is_empty());
    assert!(!server.is_valid());
    assert!(!client.is_valid());
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_tcp_server_and_connect() {
    let server_registry = ConnectionRegistry::new();
    let server = Server::bind(
        "127.0.0.1:0",
        server_registry.clone(),
        ConnectionConfig::default(),
        Arc::new(Calculator::default()),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let server = Arc::new(server);
    tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    let client_registry = ConnectionRegistry::new();
    let connection = connect(&addr, &client_registry, ConnectionConfig::default())
        .await
        .unwrap();
    let root = connection.root_proxy().await.unwrap();
    let reply = root
        .invoke("add:to:", Payload::new().with(Value::Long(20)).with(Value::Long(22)))
        .await
        .unwrap();
    assert_eq!(reply.root(0), Some(&Value::Long(42)));
    assert_eq!(server_registry.len(), 1);

    connection.shutdown();
    wait_for(|| server_registry.is_empty()).await;
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let registry = ConnectionRegistry::new();
    let result = connect("127.0.0.1:1", &registry, ConnectionConfig::default()).await;
    assert!(result.is_err());
    assert!(registry.is_empty());
}
