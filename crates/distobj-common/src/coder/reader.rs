//! Archive reader.
//!
//! Rebuilds an [`Archive`] from bytes produced by [`Writer`](super::Writer).
//! Every length and index is checked against the remaining input and the
//! header counts before it is trusted, so hostile input fails with an error
//! instead of a panic or an unbounded allocation.

use std::collections::HashMap;

use tracing::trace;

use crate::coder::descriptor::{ScalarKind, TypeKind, TAG_MASK, XREF_FLAG};
use crate::coder::graph::{Archive, ObjectGraph, ObjectId, Value};
use crate::coder::header::{WireHeader, FORMAT_VERSION, HEADER_LEN};
use crate::coder::registry::ClassRegistry;
use crate::coder::xref::{ClassSlot, PointerSlot, ReaderTables};
use crate::protocol::error::{DistobjError, Result};

pub struct Reader<'a> {
    data: &'a [u8],
    cursor: usize,
    registry: &'a ClassRegistry,
    /// Archived class name to the class it decodes as, for this reader only.
    substitutions: HashMap<String, String>,
    tables: ReaderTables,
    header: Option<WireHeader>,
}

/// An object whose record has been read but whose fields are still arriving.
struct Frame {
    id: ObjectId,
    remaining: u32,
    fields: Vec<Value>,
}

enum Record {
    Value(Value),
    ObjectStart { id: ObjectId, field_count: u32 },
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], registry: &'a ClassRegistry) -> Self {
        Self::with_offset(data, 0, registry)
    }

    /// Starts reading at `offset`, for archives embedded after other data.
    pub fn with_offset(data: &'a [u8], offset: usize, registry: &'a ClassRegistry) -> Self {
        Self {
            data,
            cursor: offset,
            registry,
            substitutions: HashMap::new(),
            tables: ReaderTables::default(),
            header: None,
        }
    }

    /// Decodes the archived class name `archived_name` as `true_name`.
    pub fn decode_class_name(&mut self, archived_name: impl Into<String>, true_name: impl Into<String>) {
        self.substitutions.insert(archived_name.into(), true_name.into());
    }

    /// The class an archived name will decode as.
    pub fn class_name_decoded_for<'s>(&'s self, archived_name: &'s str) -> &'s str {
        match self.substitutions.get(archived_name) {
            Some(name) => name,
            None => self.registry.resolve_alias(archived_name),
        }
    }

    /// Version written for `class_name` in the archive decoded so far.
    pub fn version_for_class_name(&self, class_name: &str) -> Option<u32> {
        (1..=self.tables.classes.len())
            .filter_map(|i| self.tables.classes.get(i))
            .find(|slot| slot.name == class_name)
            .map(|slot| slot.version)
    }

    /// Format version from the header, once one has been read.
    pub fn system_version(&self) -> Option<u32> {
        self.header.map(|h| h.version)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Decodes one archive starting at the cursor.
    ///
    /// On success the cursor sits just past the archive. Any failure discards
    /// the partially built graph.
    pub fn decode_root(&mut self) -> Result<Archive> {
        self.tables.clear();
        let header = WireHeader::read_at(self.data, self.cursor)?;
        if header.version != FORMAT_VERSION {
            return Err(DistobjError::malformed(format!(
                "unsupported archive version {}",
                header.version
            )));
        }
        self.header = Some(header);
        self.cursor += HEADER_LEN;

        let root_count = match self.read_record(&mut ObjectGraph::new())? {
            Record::Value(Value::UInt(n)) => n,
            _ => return Err(DistobjError::malformed("archive does not start with a root count")),
        };

        let mut graph = ObjectGraph::new();
        let mut roots = Vec::with_capacity(self.bounded_capacity(root_count));
        let mut frames: Vec<Frame> = Vec::new();

        loop {
            match frames.last() {
                Some(frame) if frame.remaining == 0 => {
                    let Some(frame) = frames.pop() else { break };
                    self.finish_object(&mut graph, frame.id, frame.fields)?;
                    deliver(&mut frames, &mut roots, Value::Object(Some(frame.id)));
                    continue;
                }
                None if roots.len() as u32 == root_count => break,
                _ => {}
            }

            match self.read_record(&mut graph)? {
                Record::Value(value) => deliver(&mut frames, &mut roots, value),
                Record::ObjectStart { id, field_count } => frames.push(Frame {
                    id,
                    remaining: field_count,
                    fields: Vec::with_capacity(self.bounded_capacity(field_count)),
                }),
            }
        }

        let decoded = (
            self.tables.classes.len(),
            self.tables.objects.len(),
            self.tables.pointers.len(),
        );
        if decoded != (header.classes, header.objects, header.pointers) {
            return Err(DistobjError::malformed(format!(
                "header announced {:?} table entries, body introduced {:?}",
                (header.classes, header.objects, header.pointers),
                decoded
            )));
        }

        trace!(
            roots = roots.len(),
            objects = graph.object_count(),
            bytes = self.cursor,
            "decoded archive"
        );
        Ok(Archive::new(graph, roots))
    }

    fn finish_object(&self, graph: &mut ObjectGraph, id: ObjectId, fields: Vec<Value>) -> Result<()> {
        if let Some(info) = graph.object(id).and_then(|node| self.registry.get(node.class_name())) {
            info.check_fields(&fields)?;
        }
        graph.set_fields(id, fields);
        Ok(())
    }

    fn read_record(&mut self, graph: &mut ObjectGraph) -> Result<Record> {
        let offset = self.cursor;
        let tag = self.read_u8()?;
        let xref = tag & XREF_FLAG != 0;
        let kind = TypeKind::from_tag(tag & TAG_MASK).ok_or_else(|| {
            DistobjError::malformed(format!("unknown type tag 0x{:02x} at offset {}", tag, offset))
        })?;
        if xref && !kind.is_cross_referenced() {
            return Err(DistobjError::malformed(format!(
                "cross-reference flag on scalar tag at offset {}",
                offset
            )));
        }

        let value = match kind {
            TypeKind::Scalar(scalar) => self.read_scalar(scalar)?,
            TypeKind::CString | TypeKind::Pointer => {
                let blob = if xref {
                    match self.read_backref_index()? {
                        0 => None,
                        index => match self.tables.pointers.get(index) {
                            Some(PointerSlot::Blob(blob)) => Some(*blob),
                            Some(PointerSlot::Selector(_)) => {
                                return Err(DistobjError::malformed(format!(
                                    "pointer reference {} names a selector",
                                    index
                                )))
                            }
                            None => return Err(unregistered("pointer", index)),
                        },
                    }
                } else {
                    self.expect_next_index(self.tables.pointers.next_index(), self.header_pointers(), "pointer")?;
                    let bytes = self.read_bytes()?;
                    let blob = graph.add_blob(bytes);
                    self.tables.pointers.register(PointerSlot::Blob(blob));
                    Some(blob)
                };
                if kind == TypeKind::CString {
                    Value::CString(blob)
                } else {
                    Value::Pointer(blob)
                }
            }
            TypeKind::Selector => {
                if xref {
                    match self.read_backref_index()? {
                        0 => Value::Selector(None),
                        index => match self.tables.pointers.get(index) {
                            Some(PointerSlot::Selector(name)) => Value::Selector(Some(name.clone())),
                            Some(PointerSlot::Blob(_)) => {
                                return Err(DistobjError::malformed(format!(
                                    "selector reference {} names a byte string",
                                    index
                                )))
                            }
                            None => return Err(unregistered("selector", index)),
                        },
                    }
                } else {
                    self.expect_next_index(self.tables.pointers.next_index(), self.header_pointers(), "selector")?;
                    let name = self.read_string()?;
                    self.tables.pointers.register(PointerSlot::Selector(name.clone()));
                    Value::Selector(Some(name))
                }
            }
            TypeKind::Class => Value::Class(self.read_class_contents(xref)?.map(|slot| slot.name)),
            TypeKind::Object => {
                if xref {
                    match self.read_backref_index()? {
                        0 => Value::Object(None),
                        index => match self.tables.objects.get(index) {
                            Some(id) => Value::Object(Some(*id)),
                            None => return Err(unregistered("object", index)),
                        },
                    }
                } else {
                    let objects = self.header.map(|h| h.objects).unwrap_or(0);
                    self.expect_next_index(self.tables.objects.next_index(), objects, "object")?;
                    let class = self.read_class_record()?;
                    let id = graph.reserve(class.name);
                    self.tables.objects.register(id);
                    let field_count = self.read_u32()?;
                    return Ok(Record::ObjectStart { id, field_count });
                }
            }
        };
        Ok(Record::Value(value))
    }

    /// Reads the class record that must follow an object's index.
    fn read_class_record(&mut self) -> Result<ClassSlot> {
        let offset = self.cursor;
        let tag = self.read_u8()?;
        if tag & TAG_MASK != b'#' {
            return Err(DistobjError::malformed(format!(
                "expected class record at offset {}, found tag 0x{:02x}",
                offset, tag
            )));
        }
        self.read_class_contents(tag & XREF_FLAG != 0)?
            .ok_or_else(|| DistobjError::malformed(format!("nil class for object at offset {}", offset)))
    }

    fn read_class_contents(&mut self, xref: bool) -> Result<Option<ClassSlot>> {
        if xref {
            return match self.read_backref_index()? {
                0 => Ok(None),
                index => self
                    .tables
                    .classes
                    .get(index)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| unregistered("class", index)),
            };
        }
        let classes = self.header.map(|h| h.classes).unwrap_or(0);
        self.expect_next_index(self.tables.classes.next_index(), classes, "class")?;
        let archived = self.read_string()?;
        let version = self.read_u32()?;
        let name = self.class_name_decoded_for(&archived).to_string();
        if !self.registry.contains(&name) {
            return Err(DistobjError::UnknownClass(if name == archived {
                name
            } else {
                format!("{} (archived as {})", name, archived)
            }));
        }
        let slot = ClassSlot { name, version };
        self.tables.classes.register(slot.clone());
        Ok(Some(slot))
    }

    fn read_scalar(&mut self, kind: ScalarKind) -> Result<Value> {
        let bytes = self.take(kind.width())?;
        let value = match kind {
            ScalarKind::Bool => match bytes[0] {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(DistobjError::malformed(format!("invalid bool byte {}", other))),
            },
            ScalarKind::Char => Value::Char(bytes[0] as i8),
            ScalarKind::UChar => Value::UChar(bytes[0]),
            ScalarKind::Short => Value::Short(i16::from_be_bytes([bytes[0], bytes[1]])),
            ScalarKind::UShort => Value::UShort(u16::from_be_bytes([bytes[0], bytes[1]])),
            ScalarKind::Int => Value::Int(i32::from_be_bytes(array(bytes))),
            ScalarKind::UInt => Value::UInt(u32::from_be_bytes(array(bytes))),
            ScalarKind::Float => Value::Float(f32::from_be_bytes(array(bytes))),
            ScalarKind::Long => Value::Long(i64::from_be_bytes(array(bytes))),
            ScalarKind::ULong => Value::ULong(u64::from_be_bytes(array(bytes))),
            ScalarKind::Double => Value::Double(f64::from_be_bytes(array(bytes))),
        };
        Ok(value)
    }

    fn header_pointers(&self) -> u32 {
        self.header.map(|h| h.pointers).unwrap_or(0)
    }

    /// A first occurrence must carry the next sequential index, and that
    /// index must fit the header's count for the table.
    fn expect_next_index(&mut self, expected: u32, announced: u32, what: &str) -> Result<()> {
        let offset = self.cursor;
        let index = self.read_u32()?;
        if index != expected {
            return Err(DistobjError::malformed(format!(
                "{} record at offset {} has index {}, expected {}",
                what, offset, index, expected
            )));
        }
        if index > announced {
            return Err(DistobjError::malformed(format!(
                "{} index {} exceeds header count {}",
                what, index, announced
            )));
        }
        Ok(())
    }

    fn read_backref_index(&mut self) -> Result<u32> {
        self.read_u32()
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        let offset = self.cursor;
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| DistobjError::malformed(format!("invalid UTF-8 name at offset {}", offset)))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(array(self.take(4)?)))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let available = self.data.len().saturating_sub(self.cursor);
        if available < len {
            return Err(DistobjError::TruncatedStream {
                offset: self.cursor,
                needed: len,
                available,
            });
        }
        let bytes = &self.data[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(bytes)
    }

    /// Caps a pre-allocation by what the remaining input could possibly hold.
    fn bounded_capacity(&self, announced: u32) -> usize {
        let remaining = self.data.len().saturating_sub(self.cursor);
        (announced as usize).min(remaining)
    }
}

fn deliver(frames: &mut [Frame], roots: &mut Vec<Value>, value: Value) {
    match frames.last_mut() {
        Some(frame) => {
            frame.fields.push(value);
            frame.remaining -= 1;
        }
        None => roots.push(value),
    }
}

fn unregistered(what: &str, index: u32) -> DistobjError {
    DistobjError::malformed(format!("reference to unregistered {} index {}", what, index))
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
