//! Message envelopes.
//!
//! ```text
//! [kind: u8] [sequence: u32] [target: u32, request kinds that name one] [payload: rest]
//! ```
//!
//! The payload, where present, is an archive produced by the coder. Frames on
//! the transport carry one envelope each.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::error::{DistobjError, Result};

/// Identifies an exported object within one connection.
pub type TargetId = u32;

/// Correlates a reply with its request.
pub type SequenceNumber = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    MethodRequest = 0,
    MethodReply = 1,
    RootProxyRequest = 2,
    RootProxyReply = 3,
    ConnectionShutdown = 4,
    MethodTypeRequest = 5,
    MethodTypeReply = 6,
    ProxyRelease = 7,
    ProxyRetain = 8,
    RetainReply = 9,
}

impl MessageKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        let kind = match byte {
            0 => MessageKind::MethodRequest,
            1 => MessageKind::MethodReply,
            2 => MessageKind::RootProxyRequest,
            3 => MessageKind::RootProxyReply,
            4 => MessageKind::ConnectionShutdown,
            5 => MessageKind::MethodTypeRequest,
            6 => MessageKind::MethodTypeReply,
            7 => MessageKind::ProxyRelease,
            8 => MessageKind::ProxyRetain,
            9 => MessageKind::RetainReply,
            _ => return None,
        };
        Some(kind)
    }

    /// Kinds addressed to a specific exported object.
    pub fn has_target(self) -> bool {
        matches!(
            self,
            MessageKind::MethodRequest
                | MessageKind::MethodTypeRequest
                | MessageKind::ProxyRelease
                | MessageKind::ProxyRetain
        )
    }

    /// Kinds that carry an archive payload.
    pub fn has_payload(self) -> bool {
        !matches!(
            self,
            MessageKind::RootProxyRequest | MessageKind::ConnectionShutdown | MessageKind::ProxyRetain
        )
    }

    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::MethodReply
                | MessageKind::RootProxyReply
                | MessageKind::MethodTypeReply
                | MessageKind::RetainReply
        )
    }

    /// The reply kind a request of this kind expects, if any.
    pub fn reply_kind(self) -> Option<MessageKind> {
        match self {
            MessageKind::MethodRequest => Some(MessageKind::MethodReply),
            MessageKind::RootProxyRequest => Some(MessageKind::RootProxyReply),
            MessageKind::MethodTypeRequest => Some(MessageKind::MethodTypeReply),
            MessageKind::ProxyRetain => Some(MessageKind::RetainReply),
            _ => None,
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sequence: SequenceNumber,
    pub target: Option<TargetId>,
    pub payload: Bytes,
}

/// Kind byte and sequence number, the part of an envelope that can be
/// recovered even when the rest is invalid.
pub const ENVELOPE_PREFIX_LEN: usize = 5;

impl Envelope {
    pub fn method_request(sequence: SequenceNumber, target: TargetId, payload: impl Into<Bytes>) -> Self {
        Self::targeted(MessageKind::MethodRequest, sequence, target, payload.into())
    }

    pub fn method_type_request(sequence: SequenceNumber, target: TargetId, payload: impl Into<Bytes>) -> Self {
        Self::targeted(MessageKind::MethodTypeRequest, sequence, target, payload.into())
    }

    pub fn proxy_release(target: TargetId, payload: impl Into<Bytes>) -> Self {
        Self::targeted(MessageKind::ProxyRelease, 0, target, payload.into())
    }

    pub fn proxy_retain(sequence: SequenceNumber, target: TargetId) -> Self {
        Self::targeted(MessageKind::ProxyRetain, sequence, target, Bytes::new())
    }

    pub fn root_proxy_request(sequence: SequenceNumber) -> Self {
        Self::bare(MessageKind::RootProxyRequest, sequence)
    }

    pub fn shutdown() -> Self {
        Self::bare(MessageKind::ConnectionShutdown, 0)
    }

    /// A reply of `kind` answering `sequence`.
    pub fn reply(kind: MessageKind, sequence: SequenceNumber, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            sequence,
            target: None,
            payload: payload.into(),
        }
    }

    fn targeted(kind: MessageKind, sequence: SequenceNumber, target: TargetId, payload: Bytes) -> Self {
        Self {
            kind,
            sequence,
            target: Some(target),
            payload,
        }
    }

    fn bare(kind: MessageKind, sequence: SequenceNumber) -> Self {
        Self {
            kind,
            sequence,
            target: None,
            payload: Bytes::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        ENVELOPE_PREFIX_LEN + if self.target.is_some() { 4 } else { 0 } + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.sequence);
        if let Some(target) = self.target {
            buf.put_u32(target);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (kind_byte, sequence) = Self::peek(frame)?;
        let kind = MessageKind::from_u8(kind_byte).ok_or_else(|| {
            DistobjError::ProtocolViolation(format!("unknown message kind {}", kind_byte))
        })?;

        let mut rest = &frame[ENVELOPE_PREFIX_LEN..];
        let target = if kind.has_target() {
            if rest.remaining() < 4 {
                return Err(DistobjError::TruncatedStream {
                    offset: ENVELOPE_PREFIX_LEN,
                    needed: 4,
                    available: rest.remaining(),
                });
            }
            Some(rest.get_u32())
        } else {
            None
        };

        if kind.has_payload() && rest.is_empty() {
            return Err(DistobjError::ProtocolViolation(format!("{:?} without payload", kind)));
        }
        if !kind.has_payload() && !rest.is_empty() {
            return Err(DistobjError::ProtocolViolation(format!(
                "{:?} carries {} unexpected payload bytes",
                kind,
                rest.len()
            )));
        }

        Ok(Self {
            kind,
            sequence,
            target,
            payload: Bytes::copy_from_slice(rest),
        })
    }

    /// Reads the kind byte and sequence number without validating the rest.
    pub fn peek(frame: &[u8]) -> Result<(u8, SequenceNumber)> {
        if frame.len() < ENVELOPE_PREFIX_LEN {
            return Err(DistobjError::TruncatedStream {
                offset: 0,
                needed: ENVELOPE_PREFIX_LEN,
                available: frame.len(),
            });
        }
        let mut prefix = &frame[..ENVELOPE_PREFIX_LEN];
        Ok((prefix.get_u8(), prefix.get_u32()))
    }
}
