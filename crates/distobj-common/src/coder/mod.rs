//! Object graph archiving with cross-reference deduplication.

pub mod descriptor;
pub mod graph;
pub mod header;
pub mod reader;
pub mod registry;
pub mod writer;
pub mod xref;


pub use descriptor::{Qualifiers, ScalarKind, Signature, TypeDescriptor, TypeKind, TAG_MASK, XREF_FLAG};
pub use graph::{Archive, BlobId, ObjectGraph, ObjectId, ObjectNode, Value};
pub use header::{WireHeader, FORMAT_VERSION, HEADER_LEN};
pub use reader::Reader;
pub use registry::{ClassInfo, ClassRegistry};
pub use writer::Writer;

use crate::protocol::error::{DistobjError, Result};

/// Encodes `roots` of `graph` into a fresh buffer.
pub fn archive(graph: &ObjectGraph, roots: &[Value]) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.encode_root(graph, roots)?;
    Ok(writer.into_data())
}

/// Decodes a buffer holding exactly one archive.
pub fn unarchive(data: &[u8], registry: &ClassRegistry) -> Result<Archive> {
    let mut reader = Reader::new(data, registry);
    let archive = reader.decode_root()?;
    if !reader.is_at_end() {
        return Err(DistobjError::malformed(format!(
            "{} trailing bytes after archive",
            data.len() - reader.cursor()
        )));
    }
    Ok(archive)
}
