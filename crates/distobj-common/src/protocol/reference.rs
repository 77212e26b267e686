//! Remote object references inside archives.
//!
//! An object exported across a connection travels as an instance of the
//! reserved class `DistantObject` with three fields: the target id, which
//! side exported it, and a class name hint.

use crate::coder::{ClassInfo, ObjectGraph, ObjectId, ObjectNode, ScalarKind, TypeKind, Value};
use crate::protocol::error::{DistobjError, Result};
use crate::protocol::message::TargetId;

pub const DISTANT_OBJECT_CLASS: &str = "DistantObject";

/// Which end of the connection owns the referenced target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Exported by whoever wrote the archive.
    Sender,
    /// Exported by whoever reads it (a proxy being handed back).
    Receiver,
}

impl Origin {
    fn to_u8(self) -> u8 {
        match self {
            Origin::Sender => 0,
            Origin::Receiver => 1,
        }
    }

    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Origin::Sender),
            1 => Some(Origin::Receiver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReference {
    pub target: TargetId,
    pub origin: Origin,
    pub class_hint: Option<String>,
}

impl RemoteReference {
    pub fn new(target: TargetId, origin: Origin) -> Self {
        Self {
            target,
            origin,
            class_hint: None,
        }
    }

    pub fn with_class_hint(mut self, class_hint: impl Into<String>) -> Self {
        self.class_hint = Some(class_hint.into());
        self
    }

    /// Registration for the reserved class; every reader on a connection needs it.
    pub fn class_info() -> ClassInfo {
        ClassInfo::new(DISTANT_OBJECT_CLASS).with_layout(vec![
            TypeKind::Scalar(ScalarKind::UInt),
            TypeKind::Scalar(ScalarKind::UChar),
            TypeKind::CString,
        ])
    }

    /// Adds a node for this reference and returns its id.
    pub fn insert_into(&self, graph: &mut ObjectGraph) -> ObjectId {
        let hint = match &self.class_hint {
            Some(name) => graph.cstring(name),
            None => Value::CString(None),
        };
        graph.insert(
            DISTANT_OBJECT_CLASS,
            vec![Value::UInt(self.target), Value::UChar(self.origin.to_u8()), hint],
        )
    }

    /// Reads a reference back from a decoded node. `None` if the node is of
    /// another class.
    pub fn from_node(graph: &ObjectGraph, node: &ObjectNode) -> Option<Result<Self>> {
        if node.class_name() != DISTANT_OBJECT_CLASS {
            return None;
        }
        let parse = || {
            let target = node.field(0).and_then(Value::as_u32);
            let origin = node.field(1).and_then(Value::as_u8).and_then(Origin::from_u8);
            let (Some(target), Some(origin)) = (target, origin) else {
                return Err(DistobjError::malformed("invalid DistantObject reference"));
            };
            let class_hint = node.field(2).and_then(|v| graph.text(v)).map(str::to_string);
            Ok(Self {
                target,
                origin,
                class_hint,
            })
        };
        Some(parse())
    }

    /// Every reference in `graph`, keyed by the node carrying it.
    pub fn collect(graph: &ObjectGraph) -> Result<Vec<(ObjectId, RemoteReference)>> {
        graph
            .objects()
            .filter_map(|(id, node)| Self::from_node(graph, node).map(|r| r.map(|r| (id, r))))
            .collect()
    }
}
