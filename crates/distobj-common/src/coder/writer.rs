//! Archive writer.
//!
//! Encoding a root runs twice over the graph. The preparatory pass discovers
//! which objects are reachable unconditionally and how large each
//! cross-reference table gets; its output is thrown away. The second pass
//! writes the header with those counts, then the records. A conditional
//! reference to an object that no unconditional path reaches is written as
//! nil in the second pass.

use std::collections::{HashMap, HashSet};

use bytes::BufMut;
use tracing::trace;

use crate::coder::descriptor::{TypeKind, XREF_FLAG};
use crate::coder::graph::{BlobId, ObjectGraph, ObjectId, Value};
use crate::coder::header::{WireHeader, FORMAT_VERSION};
use crate::coder::registry::ClassRegistry;
use crate::coder::xref::{PointerKey, WriterTables};
use crate::protocol::error::{DistobjError, Result};

pub struct Writer {
    data: Vec<u8>,
    start_pos: usize,
    tables: WriterTables,
    versions: HashMap<String, u32>,
    /// Objects the preparatory pass reached unconditionally.
    promoted: HashSet<ObjectId>,
    is_encoding_root: bool,
    is_in_preparatory_pass: bool,
    finished: bool,
}

impl Writer {
    pub fn new() -> Self {
        Self::with_buffer(Vec::new())
    }

    /// Appends the archive after whatever `data` already holds.
    pub fn with_buffer(data: Vec<u8>) -> Self {
        Self {
            start_pos: data.len(),
            data,
            tables: WriterTables::default(),
            versions: HashMap::new(),
            promoted: HashSet::new(),
            is_encoding_root: false,
            is_in_preparatory_pass: false,
            finished: false,
        }
    }

    /// Takes class versions from `registry`.
    pub fn with_registry(mut self, registry: &ClassRegistry) -> Self {
        self.versions.extend(registry_versions(registry));
        self
    }

    pub fn set_class_version(&mut self, class_name: impl Into<String>, version: u32) {
        self.versions.insert(class_name.into(), version);
    }

    /// Writes `archived_name` wherever the class `true_name` would appear.
    pub fn encode_class_name(&mut self, true_name: impl Into<String>, archived_name: impl Into<String>) {
        self.tables.names.insert(true_name.into(), archived_name.into());
    }

    pub fn class_name_encoded_for<'a>(&'a self, true_name: &'a str) -> &'a str {
        self.tables
            .names
            .get(true_name)
            .map(String::as_str)
            .unwrap_or(true_name)
    }

    /// Encodes `replacement` in every position where `original` is referenced.
    pub fn replace_object(&mut self, original: ObjectId, replacement: ObjectId) {
        self.tables.replacements.insert(original, replacement);
    }

    pub fn encode_root(&mut self, graph: &ObjectGraph, roots: &[Value]) -> Result<()> {
        if self.finished {
            return Err(DistobjError::InvalidGraph(
                "writer already holds an archive; reset it first".into(),
            ));
        }
        self.is_encoding_root = true;
        let result = self.encode_passes(graph, roots);
        self.is_encoding_root = false;
        self.is_in_preparatory_pass = false;
        if result.is_err() {
            self.data.truncate(self.start_pos);
            self.tables.clear_pass();
            self.promoted.clear();
        } else {
            self.finished = true;
        }
        result
    }

    fn encode_passes(&mut self, graph: &ObjectGraph, roots: &[Value]) -> Result<()> {
        self.promoted.clear();
        self.tables.clear_pass();
        self.data.truncate(self.start_pos);

        self.is_in_preparatory_pass = true;
        WireHeader::placeholder().write_at(&mut self.data, self.start_pos);
        self.encode_records(graph, roots)?;

        let header = WireHeader {
            version: FORMAT_VERSION,
            classes: self.tables.classes.len(),
            objects: self.tables.unconditional.len(),
            pointers: self.tables.pointers.len(),
        };
        self.promoted = self.tables.unconditional.keys().copied().collect();

        self.is_in_preparatory_pass = false;
        self.tables.clear_pass();
        self.data.truncate(self.start_pos);
        header.write_at(&mut self.data, self.start_pos);
        self.encode_records(graph, roots)?;

        let written = (
            self.tables.classes.len(),
            self.tables.unconditional.len(),
            self.tables.pointers.len(),
        );
        if written != (header.classes, header.objects, header.pointers) {
            return Err(DistobjError::InvalidGraph(format!(
                "second pass wrote {:?} table entries, header announced {:?}",
                written,
                (header.classes, header.objects, header.pointers)
            )));
        }

        trace!(
            classes = header.classes,
            objects = header.objects,
            pointers = header.pointers,
            bytes = self.data.len() - self.start_pos,
            "encoded archive"
        );
        Ok(())
    }

    /// Writes the root count and every root in pre-order.
    ///
    /// Objects are expanded from an explicit stack rather than by recursion,
    /// so long chains cannot exhaust the call stack.
    fn encode_records<'g>(&mut self, graph: &'g ObjectGraph, roots: &'g [Value]) -> Result<()> {
        let root_count = u32::try_from(roots.len())
            .map_err(|_| DistobjError::InvalidGraph("too many roots".into()))?;
        self.put_tag(b'I', false);
        self.data.put_u32(root_count);

        let mut stack: Vec<&'g Value> = roots.iter().rev().collect();
        while let Some(value) = stack.pop() {
            if let Some(fields) = self.encode_value(graph, value)? {
                stack.extend(fields.iter().rev());
            }
        }
        Ok(())
    }

    /// Writes one value. For an object written with its contents, returns the
    /// fields still to be written.
    fn encode_value<'g>(&mut self, graph: &'g ObjectGraph, value: &Value) -> Result<Option<&'g [Value]>> {
        match value {
            Value::Bool(v) => {
                self.put_tag(b'B', false);
                self.data.put_u8(u8::from(*v));
            }
            Value::Char(v) => {
                self.put_tag(b'c', false);
                self.data.put_i8(*v);
            }
            Value::UChar(v) => {
                self.put_tag(b'C', false);
                self.data.put_u8(*v);
            }
            Value::Short(v) => {
                self.put_tag(b's', false);
                self.data.put_i16(*v);
            }
            Value::UShort(v) => {
                self.put_tag(b'S', false);
                self.data.put_u16(*v);
            }
            Value::Int(v) => {
                self.put_tag(b'i', false);
                self.data.put_i32(*v);
            }
            Value::UInt(v) => {
                self.put_tag(b'I', false);
                self.data.put_u32(*v);
            }
            Value::Long(v) => {
                self.put_tag(b'q', false);
                self.data.put_i64(*v);
            }
            Value::ULong(v) => {
                self.put_tag(b'Q', false);
                self.data.put_u64(*v);
            }
            Value::Float(v) => {
                self.put_tag(b'f', false);
                self.data.put_f32(*v);
            }
            Value::Double(v) => {
                self.put_tag(b'd', false);
                self.data.put_f64(*v);
            }
            Value::CString(blob) => self.encode_blob(graph, TypeKind::CString, *blob)?,
            Value::Pointer(blob) => self.encode_blob(graph, TypeKind::Pointer, *blob)?,
            Value::Selector(name) => self.encode_selector(name.as_deref()),
            Value::Class(name) => self.encode_class(name.as_deref()),
            Value::Object(id) => return self.encode_object(graph, *id, false),
            Value::ConditionalObject(id) => return self.encode_object(graph, *id, true),
        }
        Ok(None)
    }

    fn encode_blob(&mut self, graph: &ObjectGraph, kind: TypeKind, blob: Option<BlobId>) -> Result<()> {
        let tag = kind.tag();
        let Some(blob) = blob else {
            self.put_nil(tag);
            return Ok(());
        };
        let key = PointerKey::Blob(blob);
        if let Some(index) = self.tables.pointers.get(&key) {
            self.put_backref(tag, index);
            return Ok(());
        }
        let bytes = graph
            .blob(blob)
            .ok_or_else(|| DistobjError::InvalidGraph(format!("dangling blob id {}", blob.index())))?;
        let index = self.tables.pointers.assign(key);
        self.put_tag(tag, false);
        self.data.put_u32(index);
        self.put_bytes(bytes)
    }

    fn encode_selector(&mut self, name: Option<&str>) {
        let Some(name) = name else {
            self.put_nil(b':');
            return;
        };
        let key = PointerKey::Selector(name.to_string());
        if let Some(index) = self.tables.pointers.get(&key) {
            self.put_backref(b':', index);
            return;
        }
        let index = self.tables.pointers.assign(key);
        self.put_tag(b':', false);
        self.data.put_u32(index);
        self.data.put_u32(name.len() as u32);
        self.data.put_slice(name.as_bytes());
    }

    fn encode_class(&mut self, true_name: Option<&str>) {
        let Some(true_name) = true_name else {
            self.put_nil(b'#');
            return;
        };
        let archived = self.class_name_encoded_for(true_name).to_string();
        if let Some(index) = self.tables.classes.get(&archived) {
            self.put_backref(b'#', index);
            return;
        }
        let version = self.versions.get(true_name).copied().unwrap_or(0);
        let index = self.tables.classes.assign(archived.clone());
        self.put_tag(b'#', false);
        self.data.put_u32(index);
        self.data.put_u32(archived.len() as u32);
        self.data.put_slice(archived.as_bytes());
        self.data.put_u32(version);
    }

    fn encode_object<'g>(
        &mut self,
        graph: &'g ObjectGraph,
        id: Option<ObjectId>,
        conditional: bool,
    ) -> Result<Option<&'g [Value]>> {
        let Some(id) = id else {
            self.put_nil(b'@');
            return Ok(None);
        };
        let id = self.tables.replacements.get(&id).copied().unwrap_or(id);

        if let Some(index) = self.tables.unconditional.get(&id) {
            self.put_backref(b'@', index);
            return Ok(None);
        }
        if conditional {
            let reachable = !self.is_in_preparatory_pass && self.promoted.contains(&id);
            if !reachable {
                if self.is_in_preparatory_pass {
                    self.tables.conditional.insert(id);
                }
                self.put_nil(b'@');
                return Ok(None);
            }
        }

        let node = graph
            .object(id)
            .ok_or_else(|| DistobjError::InvalidGraph(format!("dangling object id {}", id.index())))?;
        let field_count = u32::try_from(node.fields().len())
            .map_err(|_| DistobjError::InvalidGraph("too many fields".into()))?;

        self.tables.conditional.remove(&id);
        let index = self.tables.unconditional.assign(id);
        self.put_tag(b'@', false);
        self.data.put_u32(index);
        self.encode_class(Some(node.class_name()));
        self.data.put_u32(field_count);
        Ok(Some(node.fields()))
    }

    fn put_tag(&mut self, tag: u8, xref: bool) {
        self.data.put_u8(if xref { tag | XREF_FLAG } else { tag });
    }

    fn put_nil(&mut self, tag: u8) {
        self.put_backref(tag, 0);
    }

    fn put_backref(&mut self, tag: u8, index: u32) {
        self.put_tag(tag, true);
        self.data.put_u32(index);
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| DistobjError::InvalidGraph("blob larger than 4 GiB".into()))?;
        self.data.put_u32(len);
        self.data.put_slice(bytes);
        Ok(())
    }

    /// Whether `id` was written with its contents by the last `encode_root`.
    pub fn is_materialized(&self, id: ObjectId) -> bool {
        let id = self.tables.replacements.get(&id).copied().unwrap_or(id);
        self.tables.unconditional.contains(&id)
    }

    /// Entries (classes, objects, pointers) in the tables after the last encode.
    pub fn table_counts(&self) -> (u32, u32, u32) {
        (
            self.tables.classes.len(),
            self.tables.unconditional.len(),
            self.tables.pointers.len(),
        )
    }

    pub fn is_encoding_root(&self) -> bool {
        self.is_encoding_root
    }

    /// Archive bytes, including anything the buffer held before.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Discards the archive and every table so the writer can encode again.
    /// Bytes that preceded the archive in the buffer are kept. Class name
    /// substitutions and replacements are cleared; class versions are kept.
    pub fn reset(&mut self) {
        self.data.truncate(self.start_pos);
        self.tables = WriterTables::default();
        self.promoted.clear();
        self.finished = false;
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

fn registry_versions(registry: &ClassRegistry) -> impl Iterator<Item = (String, u32)> + '_ {
    registry.classes().map(|info| (info.name().to_string(), info.version()))
}
