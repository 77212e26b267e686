//! Per-call bookkeeping of provisional state.
//!
//! Marshaling a call touches shared tables before the call is known to
//! succeed: targets get registered, remote interest gets counted, reply slots
//! get reserved and proxies get minted. Each of those steps is recorded here
//! first. If the call fails at any point, the entries are undone in reverse
//! order; once the call has been handed to the transport they are committed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use distobj_common::coder::{Archive, ObjectId, Value, Writer};
use distobj_common::protocol::{DistobjError, Origin, RemoteReference, Result, SequenceNumber, TargetId};
use tracing::trace;

use crate::connection::ConnectionInner;
use crate::proxy::Proxy;
use crate::target::{Payload, Received};

/// A provisional change to connection state.
pub(crate) enum Provisional {
    /// Target registered while marshaling; dropped again if nothing vended it.
    Export(TargetId),
    /// One unit of remote interest on a local target.
    Vend(TargetId),
    /// Reply slot reserved in the pending table.
    PendingReply(SequenceNumber),
    /// Proxy minted while resolving a decoded reference.
    Proxy(ObjectId, Proxy),
}

pub(crate) struct CallContext {
    connection: Arc<ConnectionInner>,
    sequence: Option<SequenceNumber>,
    cleanup: Vec<Provisional>,
}

impl CallContext {
    /// Context for a call this side originates.
    pub(crate) fn outgoing(connection: Arc<ConnectionInner>) -> Self {
        Self {
            connection,
            sequence: None,
            cleanup: Vec::new(),
        }
    }

    /// Context for a request received from the peer.
    pub(crate) fn incoming(connection: Arc<ConnectionInner>, sequence: SequenceNumber) -> Self {
        Self {
            connection,
            sequence: Some(sequence),
            cleanup: Vec::new(),
        }
    }

    pub(crate) fn track_pending(&mut self, sequence: SequenceNumber) {
        self.sequence = Some(sequence);
        self.cleanup.push(Provisional::PendingReply(sequence));
    }

    pub(crate) fn track_vend(&mut self, target: TargetId) {
        self.cleanup.push(Provisional::Vend(target));
    }

    /// Resolves the payload's exports to target ids, then encodes it with
    /// `encode`. Remote interest is counted only for exports the writer
    /// actually emitted.
    pub(crate) fn marshal<F>(&mut self, payload: Payload, encode: F) -> Result<Bytes>
    where
        F: FnOnce(&Archive) -> Result<Writer>,
    {
        let mark = self.cleanup.len();
        let result = self.marshal_entries(payload, encode);
        if result.is_err() {
            self.unwind_to(mark);
        }
        result
    }

    fn marshal_entries<F>(&mut self, payload: Payload, encode: F) -> Result<Bytes>
    where
        F: FnOnce(&Archive) -> Result<Writer>,
    {
        let (mut archive, exports, passbacks) = payload.into_parts();

        for (_, proxy) in &passbacks {
            if proxy.connection_id() != self.connection.id() {
                return Err(DistobjError::ProtocolViolation(format!(
                    "proxy for target {} belongs to connection {}, not {}",
                    proxy.target(),
                    proxy.connection_id(),
                    self.connection.id()
                )));
            }
        }

        let mut exported = Vec::with_capacity(exports.len());
        for (node, object) in exports {
            let target = self.connection.register_target(object)?;
            self.cleanup.push(Provisional::Export(target));
            archive.graph.set_field(node, 0, Value::UInt(target));
            exported.push((node, target));
        }

        let writer = encode(&archive)?;
        for (node, target) in exported {
            if writer.is_materialized(node) {
                self.connection.add_interest(target, 1);
                self.cleanup.push(Provisional::Vend(target));
            }
        }
        drop(passbacks);
        Ok(Bytes::from(writer.into_data()))
    }

    /// Turns the references in a decoded archive into proxies and local
    /// objects. On failure every proxy minted so far is released.
    pub(crate) fn unmarshal(&mut self, archive: Archive) -> Result<Received> {
        let references = RemoteReference::collect(&archive.graph)?;
        let mark = self.cleanup.len();
        let mut locals = HashMap::new();

        for (node, reference) in references {
            match reference.origin {
                Origin::Sender => {
                    match self.connection.mint_proxy(reference.target, reference.class_hint.as_deref()) {
                        Ok(proxy) => self.cleanup.push(Provisional::Proxy(node, proxy)),
                        Err(err) => {
                            self.unwind_to(mark);
                            return Err(err);
                        }
                    }
                }
                Origin::Receiver => match self.connection.local_object(reference.target) {
                    Some(object) => {
                        locals.insert(node, object);
                    }
                    None => {
                        self.unwind_to(mark);
                        return Err(DistobjError::ProtocolViolation(format!(
                            "reference to target {} which this side does not export",
                            reference.target
                        )));
                    }
                },
            }
        }

        let proxies = self
            .cleanup
            .drain(mark..)
            .filter_map(|entry| match entry {
                Provisional::Proxy(node, proxy) => Some((node, proxy)),
                _ => None,
            })
            .collect();
        Ok(Received::new(archive, proxies, locals))
    }

    /// The outgoing message is queued: interest vended in it now belongs to
    /// the peer. Only a reserved reply slot stays provisional.
    pub(crate) fn mark_sent(&mut self) {
        let entries = std::mem::take(&mut self.cleanup);
        for entry in entries {
            match entry {
                Provisional::PendingReply(sequence) => self.cleanup.push(Provisional::PendingReply(sequence)),
                Provisional::Export(target) => self.connection.forget_if_unused(target),
                Provisional::Vend(_) | Provisional::Proxy(..) => {}
            }
        }
    }

    /// The call completed: nothing is left to undo.
    pub(crate) fn commit(mut self) {
        self.mark_sent();
        // a consumed reply slot has already left the pending table
        self.cleanup.clear();
    }

    fn unwind_to(&mut self, mark: usize) {
        while self.cleanup.len() > mark {
            let Some(entry) = self.cleanup.pop() else { break };
            match entry {
                Provisional::Export(target) => self.connection.forget_if_unused(target),
                Provisional::Vend(target) => self.connection.drop_interest(target, 1),
                Provisional::PendingReply(sequence) => self.connection.abandon_pending(sequence),
                Provisional::Proxy(_, proxy) => drop(proxy),
            }
        }
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if !self.cleanup.is_empty() {
            trace!(
                connection = self.connection.id(),
                sequence = ?self.sequence,
                entries = self.cleanup.len(),
                "unwinding call context"
            );
            self.unwind_to(0);
        }
    }
}
