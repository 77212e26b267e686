pub mod error;
pub mod message;
pub mod payload;
pub mod reference;

#[cfg(test)]
mod tests;

pub use error::{DistobjError, Result};
pub use message::{Envelope, MessageKind, SequenceNumber, TargetId, ENVELOPE_PREFIX_LEN};
pub use payload::{FailureKind, MethodCall, RemoteFailure, ReplyOutcome, FLAG_ONEWAY};
pub use reference::{Origin, RemoteReference, DISTANT_OBJECT_CLASS};
