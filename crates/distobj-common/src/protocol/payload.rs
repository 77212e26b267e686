//! Payload layouts carried inside envelopes.
//!
//! Every payload is one archive. The leading roots identify the layout:
//!
//! ```text
//! MethodRequest      [Selector, UInt flags, arguments...]
//! MethodTypeRequest  [Selector]
//! ProxyRelease       [UInt count]
//! any reply          [UChar 0, results...]
//!                    [UChar 1, UInt failure kind, CString message]
//! ```
//!
//! A root-proxy reply carries one `DistantObject` result, a method-type reply a
//! `CString` signature (nil when unknown) and a retain reply
//! `[Bool exported, UInt target]`.

use crate::coder::{Archive, ClassRegistry, ObjectGraph, Value, Writer};
use crate::protocol::error::{DistobjError, Result};
use crate::protocol::message::TargetId;

/// The call expects no reply.
pub const FLAG_ONEWAY: u32 = 1;

const STATUS_OK: u8 = 0;
const STATUS_FAILED: u8 = 1;

/// A decoded method request payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub selector: String,
    pub flags: u32,
    /// The graph of the whole payload; `roots` holds only the arguments.
    pub arguments: Archive,
}

impl MethodCall {
    pub fn is_oneway(&self) -> bool {
        self.flags & FLAG_ONEWAY != 0
    }
}

/// Error categories a reply can carry back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ProtocolViolation = 1,
    RemoteInvocation = 2,
    MalformedStream = 3,
    UnknownClass = 4,
}

impl FailureKind {
    fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(FailureKind::ProtocolViolation),
            2 => Some(FailureKind::RemoteInvocation),
            3 => Some(FailureKind::MalformedStream),
            4 => Some(FailureKind::UnknownClass),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a local error for transmission to the peer.
    pub fn from_error(error: &DistobjError) -> Self {
        match error {
            DistobjError::ProtocolViolation(msg) => Self::new(FailureKind::ProtocolViolation, msg.clone()),
            DistobjError::UnknownClass(name) => Self::new(FailureKind::UnknownClass, name.clone()),
            DistobjError::MalformedStream(_) | DistobjError::TruncatedStream { .. } => {
                Self::new(FailureKind::MalformedStream, error.to_string())
            }
            DistobjError::RemoteInvocation(msg) => Self::new(FailureKind::RemoteInvocation, msg.clone()),
            other => Self::new(FailureKind::RemoteInvocation, other.to_string()),
        }
    }

    pub fn into_error(self) -> DistobjError {
        match self.kind {
            FailureKind::ProtocolViolation => DistobjError::ProtocolViolation(self.message),
            FailureKind::RemoteInvocation => DistobjError::RemoteInvocation(self.message),
            FailureKind::MalformedStream => DistobjError::MalformedStream(self.message),
            FailureKind::UnknownClass => DistobjError::UnknownClass(self.message),
        }
    }
}

/// A decoded reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// Results as roots of the archive, status marker stripped.
    Success(Archive),
    Failure(RemoteFailure),
}

fn encode_with(graph: &ObjectGraph, roots: &[Value]) -> Result<Writer> {
    let mut writer = Writer::new();
    writer.encode_root(graph, roots)?;
    Ok(writer)
}

fn decode_all(data: &[u8], registry: &ClassRegistry) -> Result<Archive> {
    crate::coder::unarchive(data, registry)
}

/// Encodes a method request. The returned writer reports which argument
/// objects were actually written.
pub fn encode_method_call(selector: &str, flags: u32, arguments: &Archive) -> Result<Writer> {
    let mut roots = Vec::with_capacity(arguments.roots.len() + 2);
    roots.push(Value::Selector(Some(selector.to_string())));
    roots.push(Value::UInt(flags));
    roots.extend(arguments.roots.iter().cloned());
    encode_with(&arguments.graph, &roots)
}

pub fn decode_method_call(data: &[u8], registry: &ClassRegistry) -> Result<MethodCall> {
    let Archive { graph, mut roots } = decode_all(data, registry)?;
    if roots.len() < 2 {
        return Err(DistobjError::ProtocolViolation("method request without selector and flags".into()));
    }
    let arguments = roots.split_off(2);
    let selector = roots[0]
        .as_selector()
        .ok_or_else(|| DistobjError::ProtocolViolation("method request does not start with a selector".into()))?
        .to_string();
    let flags = roots[1]
        .as_u32()
        .ok_or_else(|| DistobjError::ProtocolViolation("method request flags missing".into()))?;
    Ok(MethodCall {
        selector,
        flags,
        arguments: Archive::new(graph, arguments),
    })
}

/// Encodes a successful reply whose results are the roots of `results`.
pub fn encode_success(results: &Archive) -> Result<Writer> {
    let mut roots = Vec::with_capacity(results.roots.len() + 1);
    roots.push(Value::UChar(STATUS_OK));
    roots.extend(results.roots.iter().cloned());
    encode_with(&results.graph, &roots)
}

pub fn encode_failure(failure: &RemoteFailure) -> Result<Vec<u8>> {
    let mut graph = ObjectGraph::new();
    let message = graph.cstring(&failure.message);
    let roots = [Value::UChar(STATUS_FAILED), Value::UInt(failure.kind as u32), message];
    Ok(encode_with(&graph, &roots)?.into_data())
}

pub fn decode_reply(data: &[u8], registry: &ClassRegistry) -> Result<ReplyOutcome> {
    let Archive { graph, mut roots } = decode_all(data, registry)?;
    if roots.is_empty() {
        return Err(DistobjError::ProtocolViolation("reply without status".into()));
    }
    let results = roots.split_off(1);
    match roots[0].as_u8() {
        Some(STATUS_OK) => Ok(ReplyOutcome::Success(Archive::new(graph, results))),
        Some(STATUS_FAILED) => {
            let kind = results
                .first()
                .and_then(Value::as_u32)
                .and_then(FailureKind::from_u32)
                .ok_or_else(|| DistobjError::ProtocolViolation("failure reply without a valid kind".into()))?;
            let message = results
                .get(1)
                .and_then(|v| graph.text(v))
                .unwrap_or_default()
                .to_string();
            Ok(ReplyOutcome::Failure(RemoteFailure::new(kind, message)))
        }
        _ => Err(DistobjError::ProtocolViolation("reply status is not 0 or 1".into())),
    }
}

/// Encodes the success reply to a retain request. The target is echoed so a
/// reply nobody waits for can still be released.
pub fn encode_retain_reply(target: TargetId, exported: bool) -> Result<Vec<u8>> {
    let results = Archive::new(ObjectGraph::new(), vec![Value::Bool(exported), Value::UInt(target)]);
    Ok(encode_success(&results)?.into_data())
}

/// Target a successful retain reply grants a vend unit on, if any.
pub fn granted_target(results: &[Value]) -> Option<TargetId> {
    match results {
        [Value::Bool(true), Value::UInt(target)] => Some(*target),
        _ => None,
    }
}

pub fn encode_selector(selector: &str) -> Result<Vec<u8>> {
    Ok(encode_with(&ObjectGraph::new(), &[Value::Selector(Some(selector.to_string()))])?.into_data())
}

pub fn decode_selector(data: &[u8], registry: &ClassRegistry) -> Result<String> {
    let archive = decode_all(data, registry)?;
    match archive.roots.as_slice() {
        [Value::Selector(Some(name))] => Ok(name.clone()),
        _ => Err(DistobjError::ProtocolViolation("expected a single selector".into())),
    }
}

pub fn encode_count(count: u32) -> Result<Vec<u8>> {
    Ok(encode_with(&ObjectGraph::new(), &[Value::UInt(count)])?.into_data())
}

pub fn decode_count(data: &[u8], registry: &ClassRegistry) -> Result<u32> {
    let archive = decode_all(data, registry)?;
    match archive.roots.as_slice() {
        [Value::UInt(count)] => Ok(*count),
        _ => Err(DistobjError::ProtocolViolation("expected a single count".into())),
    }
}
