//! Connections between two peers.
//!
//! A [`Connection`] owns one transport. A writer task drains the outbound
//! queue onto the transport's sink, so all traffic leaves in the order it was
//! queued. A reader task decodes every inbound frame: replies are matched to
//! waiting callers by sequence number, requests are served, and each method
//! invocation runs in its own task so it can call back into the peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use distobj_common::coder::{ClassRegistry, Signature, Value};
use distobj_common::protocol::payload::{
    decode_count, decode_method_call, decode_reply, decode_selector, encode_count, encode_failure,
    encode_method_call, encode_retain_reply, encode_selector, encode_success, granted_target,
};
use distobj_common::protocol::{
    DistobjError, Envelope, MessageKind, RemoteFailure, ReplyOutcome, Result, SequenceNumber, TargetId,
    FLAG_ONEWAY,
};
use distobj_common::transport::{FrameSink, FrameSource, Transport};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::context::CallContext;
use crate::proxy::Proxy;
use crate::registry::RegistryInner;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::target::{Invocation, Payload, Received, RemoteObject, Reply};

/// Process-unique connection identifier, assigned by the registry.
pub type ConnectionId = u64;

enum Outbound {
    Frame(Bytes),
    Close,
}

struct LocalTarget {
    object: Arc<dyn RemoteObject>,
    /// Vend units the peer has not yet released.
    remote_interest: u32,
    /// Outbound payloads currently being marshaled with this target.
    in_flight: u32,
}

struct ProxyEntry {
    holders: usize,
    vend_units: u32,
    class_hint: Option<Arc<str>>,
}

struct PendingReply {
    expected: MessageKind,
    slot: oneshot::Sender<Result<Received>>,
}

struct ConnectionState {
    valid: bool,
    root: Option<Arc<dyn RemoteObject>>,
    local_targets: HashMap<TargetId, LocalTarget>,
    targets_by_identity: HashMap<usize, TargetId>,
    next_target: TargetId,
    proxies: HashMap<TargetId, ProxyEntry>,
    remote_root: Option<TargetId>,
    pending: HashMap<SequenceNumber, PendingReply>,
}

impl ConnectionState {
    fn new(root: Option<Arc<dyn RemoteObject>>) -> Self {
        Self {
            valid: true,
            root,
            local_targets: HashMap::new(),
            targets_by_identity: HashMap::new(),
            next_target: 1,
            proxies: HashMap::new(),
            remote_root: None,
            pending: HashMap::new(),
        }
    }

    fn allocate_target(&mut self) -> TargetId {
        loop {
            let target = self.next_target;
            self.next_target = self.next_target.wrapping_add(1);
            if target != 0 && !self.local_targets.contains_key(&target) {
                return target;
            }
        }
    }

    fn is_root(&self, object: &Arc<dyn RemoteObject>) -> bool {
        self.root.as_ref().is_some_and(|root| identity(root) == identity(object))
    }

    /// Removes `target` if nothing references it any more.
    fn prune(&mut self, target: TargetId) -> Option<LocalTarget> {
        let entry = self.local_targets.get(&target)?;
        if entry.remote_interest > 0 || entry.in_flight > 0 || self.is_root(&entry.object) {
            return None;
        }
        let entry = self.local_targets.remove(&target)?;
        self.targets_by_identity.remove(&identity(&entry.object));
        Some(entry)
    }
}

fn identity(object: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    config: ConnectionConfig,
    classes: Arc<ClassRegistry>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Mutex<ConnectionState>,
    next_sequence: AtomicU32,
    closed: Notify,
    /// Set once the writer has drained its queue and closed the sink.
    writer_done: watch::Receiver<bool>,
    stats: ConnectionStats,
    registry: Weak<RegistryInner>,
}

impl ConnectionInner {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    // ========================================================================
    // Outbound traffic
    // ========================================================================

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let size = envelope.encoded_len();
        if size > self.config.max_message_size {
            return Err(DistobjError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        debug!(
            connection = self.id,
            kind = ?envelope.kind,
            sequence = envelope.sequence,
            target_id = ?envelope.target,
            size,
            "sending"
        );
        self.outbound
            .send(Outbound::Frame(envelope.encode()))
            .map_err(|_| DistobjError::ConnectionLost(format!("connection {} writer has stopped", self.id)))
    }

    fn lost(&self) -> DistobjError {
        DistobjError::ConnectionLost(format!("connection {} has been invalidated", self.id))
    }

    /// Next free sequence number. Zero is never used, and neither is any
    /// number still awaiting its reply.
    fn allocate_sequence(&self, state: &ConnectionState) -> SequenceNumber {
        loop {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            if sequence != 0 && !state.pending.contains_key(&sequence) {
                return sequence;
            }
        }
    }

    fn register_pending(&self, expected: MessageKind) -> Result<(SequenceNumber, oneshot::Receiver<Result<Received>>)> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(self.lost());
        }
        let sequence = self.allocate_sequence(&state);
        let (slot, reply) = oneshot::channel();
        state.pending.insert(sequence, PendingReply { expected, slot });
        Ok((sequence, reply))
    }

    pub(crate) fn abandon_pending(&self, sequence: SequenceNumber) {
        self.state.lock().pending.remove(&sequence);
    }

    /// Sends a request built by `build` and waits for its reply.
    async fn request<F>(&self, mut ctx: CallContext, expected: MessageKind, build: F) -> Result<Received>
    where
        F: FnOnce(SequenceNumber) -> Envelope,
    {
        let (sequence, reply) = self.register_pending(expected)?;
        ctx.track_pending(sequence);
        self.enqueue(build(sequence))?;
        self.stats.record_request_sent();
        ctx.mark_sent();

        match tokio::time::timeout(self.config.reply_timeout, reply).await {
            Ok(Ok(result)) => {
                ctx.commit();
                result
            }
            Ok(Err(_)) => Err(self.lost()),
            Err(_) => {
                self.stats.record_timeout();
                warn!(
                    connection = self.id,
                    sequence,
                    timeout = ?self.config.reply_timeout,
                    "gave up waiting for reply"
                );
                Err(DistobjError::ConnectionLost(format!(
                    "no reply to request {} within {:?}",
                    sequence, self.config.reply_timeout
                )))
            }
        }
    }

    pub(crate) async fn call(self: &Arc<Self>, target: TargetId, selector: &str, arguments: Payload) -> Result<Reply> {
        let mut ctx = CallContext::outgoing(self.clone());
        let payload = ctx.marshal(arguments, |archive| encode_method_call(selector, 0, archive))?;
        self.request(ctx, MessageKind::MethodReply, |sequence| {
            Envelope::method_request(sequence, target, payload)
        })
        .await
    }

    pub(crate) fn call_oneway(self: &Arc<Self>, target: TargetId, selector: &str, arguments: Payload) -> Result<()> {
        let mut ctx = CallContext::outgoing(self.clone());
        let payload = ctx.marshal(arguments, |archive| encode_method_call(selector, FLAG_ONEWAY, archive))?;
        let sequence = {
            let state = self.state.lock();
            if !state.valid {
                return Err(self.lost());
            }
            self.allocate_sequence(&state)
        };
        self.enqueue(Envelope::method_request(sequence, target, payload))?;
        self.stats.record_request_sent();
        ctx.commit();
        Ok(())
    }

    pub(crate) async fn method_signature(self: &Arc<Self>, target: TargetId, selector: &str) -> Result<Option<String>> {
        let payload = encode_selector(selector)?;
        let ctx = CallContext::outgoing(self.clone());
        let reply = self
            .request(ctx, MessageKind::MethodTypeReply, |sequence| {
                Envelope::method_type_request(sequence, target, payload)
            })
            .await?;
        match reply.roots() {
            [Value::CString(None)] => Ok(None),
            [value @ Value::CString(Some(_))] => reply
                .text(value)
                .map(|text| Some(text.to_string()))
                .ok_or_else(|| DistobjError::ProtocolViolation("method signature is not valid UTF-8".into())),
            _ => Err(DistobjError::ProtocolViolation("malformed method type reply".into())),
        }
    }

    // ========================================================================
    // Local targets
    // ========================================================================

    /// Target id for `object`, registering it if it is not exported yet.
    /// Each call must be balanced by [`forget_if_unused`](Self::forget_if_unused).
    pub(crate) fn register_target(&self, object: Arc<dyn RemoteObject>) -> Result<TargetId> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(self.lost());
        }
        if let Some(&target) = state.targets_by_identity.get(&identity(&object)) {
            if let Some(entry) = state.local_targets.get_mut(&target) {
                entry.in_flight += 1;
            }
            return Ok(target);
        }
        let target = state.allocate_target();
        state.targets_by_identity.insert(identity(&object), target);
        state.local_targets.insert(
            target,
            LocalTarget {
                object,
                remote_interest: 0,
                in_flight: 1,
            },
        );
        Ok(target)
    }

    pub(crate) fn forget_if_unused(&self, target: TargetId) {
        let removed = {
            let mut state = self.state.lock();
            if let Some(entry) = state.local_targets.get_mut(&target) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
            }
            state.prune(target)
        };
        drop(removed);
    }

    pub(crate) fn add_interest(&self, target: TargetId, units: u32) {
        if let Some(entry) = self.state.lock().local_targets.get_mut(&target) {
            entry.remote_interest = entry.remote_interest.saturating_add(units);
        }
    }

    pub(crate) fn drop_interest(&self, target: TargetId, units: u32) {
        let removed = {
            let mut state = self.state.lock();
            let Some(entry) = state.local_targets.get_mut(&target) else {
                debug!(connection = self.id, target_id = target, "release for unknown target");
                return;
            };
            entry.remote_interest = entry.remote_interest.saturating_sub(units);
            state.prune(target)
        };
        if removed.is_some() {
            debug!(connection = self.id, target_id = target, "target no longer referenced by peer");
        }
        // the object may own proxies whose drop needs the state lock
        drop(removed);
    }

    pub(crate) fn local_object(&self, target: TargetId) -> Option<Arc<dyn RemoteObject>> {
        self.state
            .lock()
            .local_targets
            .get(&target)
            .map(|entry| entry.object.clone())
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Records one decoded reference to `target` and returns a handle for it.
    pub(crate) fn mint_proxy(self: &Arc<Self>, target: TargetId, class_hint: Option<&str>) -> Result<Proxy> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(self.lost());
        }
        let entry = state.proxies.entry(target).or_insert_with(|| ProxyEntry {
            holders: 0,
            vend_units: 0,
            class_hint: None,
        });
        entry.holders += 1;
        entry.vend_units = entry.vend_units.saturating_add(1);
        if entry.class_hint.is_none() {
            entry.class_hint = class_hint.map(Arc::from);
        }
        let class_hint = entry.class_hint.clone();
        drop(state);
        Ok(Proxy::counted(target, class_hint, self))
    }

    /// Another handle for a target that already has a proxy entry.
    fn existing_proxy(self: &Arc<Self>, target: TargetId) -> Option<Proxy> {
        let mut state = self.state.lock();
        if !state.valid {
            return None;
        }
        let entry = state.proxies.get_mut(&target)?;
        entry.holders += 1;
        let class_hint = entry.class_hint.clone();
        drop(state);
        Some(Proxy::counted(target, class_hint, self))
    }

    pub(crate) fn retain_holder(&self, target: TargetId) {
        if let Some(entry) = self.state.lock().proxies.get_mut(&target) {
            entry.holders += 1;
        }
    }

    pub(crate) fn release_holder(&self, target: TargetId) {
        let mut state = self.state.lock();
        let Some(entry) = state.proxies.get_mut(&target) else {
            return;
        };
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders > 0 {
            return;
        }
        let units = entry.vend_units;
        state.proxies.remove(&target);
        if state.remote_root == Some(target) {
            state.remote_root = None;
        }
        if !state.valid {
            return;
        }
        drop(state);
        self.send_release(target, units);
    }

    fn send_release(&self, target: TargetId, units: u32) {
        let sent = encode_count(units).and_then(|payload| self.enqueue(Envelope::proxy_release(target, payload)));
        match sent {
            Ok(()) => {
                self.stats.record_release_sent();
                debug!(connection = self.id, target_id = target, units, "released proxy");
            }
            Err(err) => debug!(connection = self.id, target_id = target, error = %err, "could not send release"),
        }
    }

    pub(crate) fn proxy_holders(&self, target: TargetId) -> Option<usize> {
        self.state.lock().proxies.get(&target).map(|entry| entry.holders)
    }

    // ========================================================================
    // Inbound traffic
    // ========================================================================

    fn dispatch_frame(self: &Arc<Self>, frame: Vec<u8>) {
        let err = match Envelope::decode(&frame) {
            Ok(envelope) => return self.dispatch(envelope),
            Err(err) => err,
        };
        warn!(connection = self.id, error = %err, len = frame.len(), "malformed inbound envelope");
        let Ok((kind_byte, sequence)) = Envelope::peek(&frame) else {
            return;
        };
        match MessageKind::from_u8(kind_byte) {
            Some(kind) if kind.is_reply() => {
                let pending = self.state.lock().pending.remove(&sequence);
                if let Some(pending) = pending {
                    let _ = pending.slot.send(Err(err));
                }
            }
            Some(kind) => {
                if let Some(reply_kind) = kind.reply_kind() {
                    self.send_reply(CallContext::incoming(self.clone(), sequence), reply_kind, sequence, Err(err));
                }
            }
            None => self.send_reply(
                CallContext::incoming(self.clone(), sequence),
                MessageKind::MethodReply,
                sequence,
                Err(err),
            ),
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        debug!(
            connection = self.id,
            kind = ?envelope.kind,
            sequence = envelope.sequence,
            target_id = ?envelope.target,
            "received"
        );
        let target = envelope.target.unwrap_or_default();
        match envelope.kind {
            MessageKind::MethodRequest => self.serve_method(envelope.sequence, target, &envelope.payload),
            MessageKind::RootProxyRequest => self.serve_root(envelope.sequence),
            MessageKind::MethodTypeRequest => self.serve_method_type(envelope.sequence, target, &envelope.payload),
            MessageKind::ProxyRetain => self.serve_retain(envelope.sequence, target),
            MessageKind::ProxyRelease => match decode_count(&envelope.payload, &self.classes) {
                Ok(units) => {
                    self.stats.record_release_received();
                    self.drop_interest(target, units);
                }
                Err(err) => warn!(connection = self.id, target_id = target, error = %err, "malformed release"),
            },
            MessageKind::ConnectionShutdown => self.invalidate("peer shut down the connection"),
            MessageKind::MethodReply
            | MessageKind::RootProxyReply
            | MessageKind::MethodTypeReply
            | MessageKind::RetainReply => self.complete(envelope),
        }
    }

    /// Routes a reply to the caller waiting on its sequence number. Proxies in
    /// the reply are minted here, so a reply nobody waits for any more still
    /// releases what it vended.
    fn complete(self: &Arc<Self>, envelope: Envelope) {
        let mut ctx = CallContext::incoming(self.clone(), envelope.sequence);
        let result = decode_reply(&envelope.payload, &self.classes).and_then(|outcome| match outcome {
            ReplyOutcome::Success(archive) => {
                let received = ctx.unmarshal(archive)?;
                match envelope.kind {
                    MessageKind::RetainReply => self.claim_retained(received),
                    _ => Ok(received),
                }
            }
            ReplyOutcome::Failure(failure) => Err(failure.into_error()),
        });
        ctx.commit();

        let pending = self.state.lock().pending.remove(&envelope.sequence);
        match pending {
            Some(pending) if pending.expected == envelope.kind => {
                self.stats.record_reply_received();
                let _ = pending.slot.send(result);
            }
            Some(pending) => {
                let _ = pending.slot.send(Err(DistobjError::ProtocolViolation(format!(
                    "expected {:?} for request {}, got {:?}",
                    pending.expected, envelope.sequence, envelope.kind
                ))));
            }
            None => {
                self.stats.record_late_reply();
                warn!(
                    connection = self.id,
                    sequence = envelope.sequence,
                    kind = ?envelope.kind,
                    "discarding reply with no waiting request"
                );
            }
        }
    }

    /// A positive retain reply vends one unit without carrying a reference.
    /// The proxy for it is minted here, so the unit is released even when
    /// nobody claims the reply.
    fn claim_retained(self: &Arc<Self>, received: Received) -> Result<Received> {
        match granted_target(received.roots()) {
            Some(target) => {
                let proxy = self.mint_proxy(target, None)?;
                Ok(received.with_retained(proxy))
            }
            None => Ok(received),
        }
    }

    fn serve_method(self: &Arc<Self>, sequence: SequenceNumber, target: TargetId, payload: &[u8]) {
        let mut ctx = CallContext::incoming(self.clone(), sequence);
        let call = match decode_method_call(payload, &self.classes) {
            Ok(call) => call,
            Err(err) => return self.send_reply(ctx, MessageKind::MethodReply, sequence, Err(err)),
        };
        let oneway = call.is_oneway();
        let selector = call.selector.clone();

        // references are resolved first so a rejected call still releases
        // whatever the caller vended in it
        let prepared = ctx.unmarshal(call.arguments).and_then(|arguments| {
            let object = self
                .local_object(target)
                .ok_or_else(|| DistobjError::ProtocolViolation(format!("no exported object with target {}", target)))?;
            if let Some(text) = object.method_signature(&selector) {
                let signature = Signature::parse(&text)?;
                if !signature.accepts(arguments.roots()) {
                    return Err(DistobjError::ProtocolViolation(format!(
                        "arguments do not match signature {} of {}",
                        text, selector
                    )));
                }
            }
            Ok((object, arguments))
        });

        let (object, arguments) = match prepared {
            Ok(prepared) => prepared,
            Err(err) if oneway => {
                warn!(connection = self.id, target_id = target, selector = %selector, error = %err, "dropping oneway request");
                self.stats.record_request_served(true);
                return;
            }
            Err(err) => return self.send_reply(ctx, MessageKind::MethodReply, sequence, Err(err)),
        };
        ctx.commit();

        let connection = self.clone();
        let invocation = Invocation::new(selector.clone(), arguments, Connection::from_inner(self.clone()));
        tokio::spawn(async move {
            let result = object.invoke(invocation).await;
            if oneway {
                if let Err(err) = &result {
                    warn!(connection = connection.id, target_id = target, selector = %selector, error = %err, "oneway invocation failed");
                }
                connection.stats.record_request_served(result.is_err());
                return;
            }
            let ctx = CallContext::incoming(connection.clone(), sequence);
            connection.send_reply(ctx, MessageKind::MethodReply, sequence, result);
        });
    }

    fn serve_root(self: &Arc<Self>, sequence: SequenceNumber) {
        let root = self.state.lock().root.clone();
        let result = root
            .map(|root| {
                let mut payload = Payload::new();
                let reference = payload.export(root);
                payload.with(reference)
            })
            .ok_or_else(|| DistobjError::ProtocolViolation("no root object is exported".into()));
        self.send_reply(
            CallContext::incoming(self.clone(), sequence),
            MessageKind::RootProxyReply,
            sequence,
            result,
        );
    }

    fn serve_method_type(self: &Arc<Self>, sequence: SequenceNumber, target: TargetId, payload: &[u8]) {
        let result = decode_selector(payload, &self.classes).and_then(|selector| {
            let object = self
                .local_object(target)
                .ok_or_else(|| DistobjError::ProtocolViolation(format!("no exported object with target {}", target)))?;
            let mut payload = Payload::new();
            let signature = match object.method_signature(&selector) {
                Some(text) => payload.cstring(&text),
                None => Value::CString(None),
            };
            Ok(payload.with(signature))
        });
        self.send_reply(
            CallContext::incoming(self.clone(), sequence),
            MessageKind::MethodTypeReply,
            sequence,
            result,
        );
    }

    fn serve_retain(self: &Arc<Self>, sequence: SequenceNumber, target: TargetId) {
        let mut ctx = CallContext::incoming(self.clone(), sequence);
        let exported = {
            let mut state = self.state.lock();
            match state.local_targets.get_mut(&target) {
                Some(entry) => {
                    entry.remote_interest = entry.remote_interest.saturating_add(1);
                    true
                }
                None => false,
            }
        };
        if exported {
            ctx.track_vend(target);
        }
        let reply = encode_retain_reply(target, exported);
        match reply.and_then(|bytes| self.enqueue(Envelope::reply(MessageKind::RetainReply, sequence, bytes))) {
            Ok(()) => {
                ctx.commit();
                self.stats.record_request_served(false);
            }
            Err(err) => debug!(connection = self.id, sequence, error = %err, "retain reply not sent"),
        }
    }

    /// Sends the reply for request `sequence`. A failure to marshal results
    /// turns into a failure reply, so the caller is always answered.
    fn send_reply(&self, mut ctx: CallContext, kind: MessageKind, sequence: SequenceNumber, result: Result<Payload>) {
        let encoded = match result {
            Ok(payload) => ctx.marshal(payload, encode_success).map_err(|err| {
                warn!(connection = self.id, sequence, error = %err, "could not encode results");
                err
            }),
            Err(err) => Err(err),
        };
        let (bytes, failed) = match encoded {
            Ok(bytes) => (bytes, false),
            Err(err) => match failure_bytes(&err) {
                Ok(bytes) => (bytes, true),
                Err(err) => {
                    warn!(connection = self.id, sequence, error = %err, "could not encode failure reply");
                    return;
                }
            },
        };

        match self.enqueue(Envelope::reply(kind, sequence, bytes)) {
            Ok(()) => {
                ctx.commit();
                self.stats.record_request_served(failed);
            }
            Err(err @ DistobjError::MessageTooLarge { .. }) => {
                drop(ctx);
                warn!(connection = self.id, sequence, error = %err, "reply too large, sending failure");
                let fallback = failure_bytes(&err).and_then(|bytes| self.enqueue(Envelope::reply(kind, sequence, bytes)));
                if let Err(err) = fallback {
                    debug!(connection = self.id, sequence, error = %err, "failure reply not sent");
                }
                self.stats.record_request_served(true);
            }
            Err(err) => debug!(connection = self.id, sequence, error = %err, "reply not sent"),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Moves the connection to its terminal state. Waiting callers fail with
    /// `ConnectionLost`, every proxy becomes invalid and exported objects are
    /// released without further handshaking.
    pub(crate) fn invalidate(&self, reason: &str) {
        let (pending, targets, root) = {
            let mut state = self.state.lock();
            if !state.valid {
                return;
            }
            state.valid = false;
            state.proxies.clear();
            state.remote_root = None;
            state.targets_by_identity.clear();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.local_targets),
                state.root.take(),
            )
        };

        for (_, pending) in pending {
            let _ = pending
                .slot
                .send(Err(DistobjError::ConnectionLost(format!("connection {}: {}", self.id, reason))));
        }
        drop(targets);
        drop(root);

        self.closed.notify_one();
        let _ = self.outbound.send(Outbound::Close);
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self.id);
        }
        info!(connection = self.id, reason, "connection closed");
    }
}

fn failure_bytes(err: &DistobjError) -> Result<Bytes> {
    encode_failure(&RemoteFailure::from_error(err)).map(Bytes::from)
}

async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    connection: Weak<ConnectionInner>,
    done: watch::Sender<bool>,
) {
    while let Some(item) = queue.recv().await {
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Close => break,
        };
        if let Err(err) = sink.send_frame(frame.to_vec()).await {
            if let Some(connection) = connection.upgrade() {
                connection.invalidate(&format!("send failed: {}", err));
            }
            break;
        }
    }
    if let Err(err) = sink.close().await {
        debug!(error = %err, "error closing transport");
    }
    let _ = done.send(true);
}

async fn read_loop<S: FrameSource>(mut source: S, connection: Arc<ConnectionInner>) {
    loop {
        let frame = tokio::select! {
            _ = connection.closed.notified() => break,
            frame = source.recv_frame() => frame,
        };
        match frame {
            Ok(Some(frame)) => connection.dispatch_frame(frame),
            Ok(None) => {
                connection.invalidate("transport closed by peer");
                break;
            }
            Err(err) => {
                connection.invalidate(&format!("receive failed: {}", err));
                break;
            }
        }
    }
    debug!(connection = connection.id, "reader stopped");
}

/// One end of a distributed-objects link.
///
/// Cheap to clone; all clones share the same state. The connection keeps
/// running until either side shuts it down or the transport fails, even if
/// every handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Starts the reader and writer tasks for `transport`. Must be called
    /// within a tokio runtime.
    pub(crate) fn spawn<T: Transport>(
        id: ConnectionId,
        transport: T,
        config: ConnectionConfig,
        classes: Arc<ClassRegistry>,
        root: Option<Arc<dyn RemoteObject>>,
        registry: Weak<RegistryInner>,
    ) -> Self {
        let (sink, source) = transport.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (done, writer_done) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            id,
            config,
            classes,
            outbound,
            state: Mutex::new(ConnectionState::new(root)),
            next_sequence: AtomicU32::new(1),
            closed: Notify::new(),
            writer_done,
            stats: ConnectionStats::default(),
            registry,
        });

        tokio::spawn(write_loop(sink, queue, Arc::downgrade(&inner), done));
        tokio::spawn(read_loop(source, inner.clone()));
        info!(connection = id, "connection established");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Classes this connection can decode.
    pub fn classes(&self) -> &ClassRegistry {
        &self.inner.classes
    }

    /// Sets the object the peer reaches with a root proxy request. The root
    /// stays exported for the life of the connection.
    pub fn set_root_object(&self, root: Arc<dyn RemoteObject>) {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = state.root.replace(root);
            let pruned = previous
                .as_ref()
                .and_then(|old| state.targets_by_identity.get(&identity(old)).copied())
                .and_then(|target| state.prune(target));
            (previous, pruned)
        };
        drop(previous);
    }

    /// Proxy for the peer's root object.
    ///
    /// The first call asks the peer; later calls reuse the existing proxy
    /// while any handle to it is alive.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` if the connection is closed or the peer does not
    /// answer in time, `ProtocolViolation` if the peer has no root object.
    pub async fn root_proxy(&self) -> Result<Proxy> {
        let remote_root = self.inner.state.lock().remote_root;
        if let Some(proxy) = remote_root.and_then(|target| self.inner.existing_proxy(target)) {
            return Ok(proxy);
        }
        let ctx = CallContext::outgoing(self.inner.clone());
        let reply = self
            .inner
            .request(ctx, MessageKind::RootProxyReply, Envelope::root_proxy_request)
            .await?;
        let proxy = reply
            .root(0)
            .and_then(|value| reply.proxy(value))
            .ok_or_else(|| DistobjError::ProtocolViolation("root proxy reply carries no remote reference".into()))?;
        self.inner.state.lock().remote_root = Some(proxy.target());
        Ok(proxy)
    }

    /// Proxy for target `target` on the peer.
    ///
    /// Reuses a live proxy if there is one; otherwise confirms with the peer
    /// that the target is still exported before minting a new one.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the peer no longer exports `target`.
    pub async fn proxy_for_target(&self, target: TargetId) -> Result<Proxy> {
        if let Some(proxy) = self.inner.existing_proxy(target) {
            return Ok(proxy);
        }
        let ctx = CallContext::outgoing(self.inner.clone());
        let reply = self
            .inner
            .request(ctx, MessageKind::RetainReply, |sequence| Envelope::proxy_retain(sequence, target))
            .await?;
        match (reply.roots(), reply.retained()) {
            (_, Some(proxy)) if proxy.target() == target => Ok(proxy),
            ([Value::Bool(false), ..], None) => Err(DistobjError::ProtocolViolation(format!(
                "peer does not export target {}",
                target
            ))),
            _ => Err(DistobjError::ProtocolViolation("malformed retain reply".into())),
        }
    }

    /// Unreleased vend units the peer holds on one of our targets, or `None`
    /// if `target` is not exported.
    pub fn remote_interest(&self, target: TargetId) -> Option<u32> {
        self.inner
            .state
            .lock()
            .local_targets
            .get(&target)
            .map(|entry| entry.remote_interest)
    }

    /// Target id under which `object` is currently exported.
    pub fn exported_target(&self, object: &Arc<dyn RemoteObject>) -> Option<TargetId> {
        self.inner.state.lock().targets_by_identity.get(&identity(object)).copied()
    }

    /// Live handles for the peer's `target`, if a proxy for it exists.
    pub fn proxy_holders(&self, target: TargetId) -> Option<usize> {
        self.inner.proxy_holders(target)
    }

    pub fn local_target_count(&self) -> usize {
        self.inner.state.lock().local_targets.len()
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.state.lock().proxies.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Notifies the peer and closes the connection. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.is_valid() {
            return;
        }
        if let Err(err) = self.inner.enqueue(Envelope::shutdown()) {
            debug!(connection = self.inner.id, error = %err, "shutdown notice not sent");
        }
        self.inner.invalidate("shut down locally");
    }

    /// Resolves once the connection is closed and every frame queued before
    /// the close has been handed to the transport.
    pub async fn closed(&self) {
        let mut done = self.inner.writer_done.clone();
        // Err: the writer task has already exited
        let _ = done.wait_for(|finished| *finished).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("valid", &self.inner.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distobj_common::transport::MemoryTransport;

    use crate::registry::ConnectionRegistry;

    #[tokio::test]
    async fn test_sequence_numbers_wrap_past_zero_and_pending() {
        let registry = ConnectionRegistry::new();
        let (a, _peer) = MemoryTransport::pair();
        let connection = registry.attach(a, ConnectionConfig::default());
        let inner = &connection.inner;

        inner.next_sequence.store(u32::MAX - 1, Ordering::Relaxed);
        let (slot, _outstanding) = oneshot::channel();
        inner.state.lock().pending.insert(
            u32::MAX,
            PendingReply {
                expected: MessageKind::MethodReply,
                slot,
            },
        );

        let (first, _first_reply) = inner.register_pending(MessageKind::MethodReply).unwrap();
        let (second, _second_reply) = inner.register_pending(MessageKind::MethodReply).unwrap();
        assert_eq!(first, u32::MAX - 1);
        // u32::MAX is still outstanding and zero is never handed out
        assert_eq!(second, 1);
        assert_eq!(connection.pending_requests(), 3);

        inner.abandon_pending(first);
        inner.next_sequence.store(u32::MAX - 1, Ordering::Relaxed);
        let (reused, _reply) = inner.register_pending(MessageKind::MethodReply).unwrap();
        assert_eq!(reused, u32::MAX - 1);
    }
}
