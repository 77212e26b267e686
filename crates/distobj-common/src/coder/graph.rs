//! In-memory object graphs.
//!
//! Objects live in an arena and refer to each other by [`ObjectId`], so shared
//! and cyclic structures need no reference counting. Byte strings (C strings
//! and opaque pointer targets) live in a second arena addressed by [`BlobId`];
//! two values carrying the same `BlobId` denote the same allocation.

use std::collections::HashMap;

/// Index of an object node within its [`ObjectGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a byte blob within its [`ObjectGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(u32);

impl BlobId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One encodable value. `None` payloads encode as nil.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    CString(Option<BlobId>),
    Pointer(Option<BlobId>),
    Selector(Option<String>),
    Class(Option<String>),
    Object(Option<ObjectId>),
    /// Written only if some unconditional path reaches the object; nil otherwise.
    ConditionalObject(Option<ObjectId>),
}

impl Value {
    /// The referenced object, conditional or not.
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) | Value::ConditionalObject(id) => *id,
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::UChar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens any signed or unsigned integer scalar that fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Char(v) => Some(v.into()),
            Value::UChar(v) => Some(v.into()),
            Value::Short(v) => Some(v.into()),
            Value::UShort(v) => Some(v.into()),
            Value::Int(v) => Some(v.into()),
            Value::UInt(v) => Some(v.into()),
            Value::Long(v) => Some(v),
            Value::ULong(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v.into()),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_selector(&self) -> Option<&str> {
        match self {
            Value::Selector(Some(name)) => Some(name),
            _ => None,
        }
    }

    /// True for every nil-able variant holding `None`.
    pub fn is_nil(&self) -> bool {
        matches!(
            self,
            Value::CString(None)
                | Value::Pointer(None)
                | Value::Selector(None)
                | Value::Class(None)
                | Value::Object(None)
                | Value::ConditionalObject(None)
        )
    }
}

/// An object instance: its class name and ordered field values.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    class_name: String,
    fields: Vec<Value>,
}

impl ObjectNode {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectGraph {
    objects: Vec<ObjectNode>,
    blobs: Vec<Vec<u8>>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object and returns its id.
    pub fn insert(&mut self, class_name: impl Into<String>, fields: Vec<Value>) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(ObjectNode {
            class_name: class_name.into(),
            fields,
        });
        id
    }

    /// Adds an object with no fields yet. Lets a caller hand out the id
    /// before the fields (which may point back at it) are known.
    pub fn reserve(&mut self, class_name: impl Into<String>) -> ObjectId {
        self.insert(class_name, Vec::new())
    }

    pub fn set_fields(&mut self, id: ObjectId, fields: Vec<Value>) -> bool {
        match self.objects.get_mut(id.index()) {
            Some(node) => {
                node.fields = fields;
                true
            }
            None => false,
        }
    }

    pub fn set_field(&mut self, id: ObjectId, index: usize, value: Value) -> bool {
        match self.objects.get_mut(id.index()).and_then(|n| n.fields.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn object(&self, id: ObjectId) -> Option<&ObjectNode> {
        self.objects.get(id.index())
    }

    pub fn objects(&self) -> impl Iterator<Item = (ObjectId, &ObjectNode)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, node)| (ObjectId(i as u32), node))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn add_blob(&mut self, bytes: impl Into<Vec<u8>>) -> BlobId {
        let id = BlobId(self.blobs.len() as u32);
        self.blobs.push(bytes.into());
        id
    }

    /// Adds a C string and returns the value referring to it.
    pub fn cstring(&mut self, text: &str) -> Value {
        Value::CString(Some(self.add_blob(text.as_bytes())))
    }

    /// Adds an opaque byte buffer and returns a pointer value referring to it.
    pub fn pointer(&mut self, bytes: impl Into<Vec<u8>>) -> Value {
        Value::Pointer(Some(self.add_blob(bytes)))
    }

    pub fn blob(&self, id: BlobId) -> Option<&[u8]> {
        self.blobs.get(id.index()).map(Vec::as_slice)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Text of a `CString` value, if it is one and holds valid UTF-8.
    pub fn text(&self, value: &Value) -> Option<&str> {
        match value {
            Value::CString(Some(id)) => self.blob(*id).and_then(|b| std::str::from_utf8(b).ok()),
            _ => None,
        }
    }

    /// Structural equality of two rooted graphs up to renaming of ids.
    ///
    /// Object and blob ids are matched through a bijection, so sharing and
    /// cycles must line up exactly: two references to one object on the left
    /// must be two references to one object on the right.
    pub fn equivalent(&self, roots: &[Value], other: &ObjectGraph, other_roots: &[Value]) -> bool {
        if roots.len() != other_roots.len() {
            return false;
        }
        let mut matcher = Matcher {
            left: self,
            right: other,
            objects: HashMap::new(),
            objects_back: HashMap::new(),
            blobs: HashMap::new(),
            blobs_back: HashMap::new(),
            pending: Vec::new(),
        };
        if !roots.iter().zip(other_roots).all(|(a, b)| matcher.values(a, b)) {
            return false;
        }
        while let Some((a, b)) = matcher.pending.pop() {
            let (Some(left), Some(right)) = (self.object(a), other.object(b)) else {
                return false;
            };
            if left.class_name != right.class_name || left.fields.len() != right.fields.len() {
                return false;
            }
            if !left.fields.iter().zip(&right.fields).all(|(x, y)| matcher.values(x, y)) {
                return false;
            }
        }
        true
    }
}

struct Matcher<'a> {
    left: &'a ObjectGraph,
    right: &'a ObjectGraph,
    objects: HashMap<ObjectId, ObjectId>,
    objects_back: HashMap<ObjectId, ObjectId>,
    blobs: HashMap<BlobId, BlobId>,
    blobs_back: HashMap<BlobId, BlobId>,
    pending: Vec<(ObjectId, ObjectId)>,
}

impl Matcher<'_> {
    fn values(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (
                Value::Object(x) | Value::ConditionalObject(x),
                Value::Object(y) | Value::ConditionalObject(y),
            ) => self.objects(*x, *y),
            (Value::CString(x), Value::CString(y)) | (Value::Pointer(x), Value::Pointer(y)) => {
                self.blobs(*x, *y)
            }
            _ => a == b,
        }
    }

    fn objects(&mut self, a: Option<ObjectId>, b: Option<ObjectId>) -> bool {
        let (a, b) = match (a, b) {
            (None, None) => return true,
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        match (self.objects.get(&a), self.objects_back.get(&b)) {
            (Some(mapped), _) => *mapped == b,
            (None, Some(_)) => false,
            (None, None) => {
                self.objects.insert(a, b);
                self.objects_back.insert(b, a);
                self.pending.push((a, b));
                true
            }
        }
    }

    fn blobs(&mut self, a: Option<BlobId>, b: Option<BlobId>) -> bool {
        let (a, b) = match (a, b) {
            (None, None) => return true,
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        match (self.blobs.get(&a), self.blobs_back.get(&b)) {
            (Some(mapped), _) => *mapped == b,
            (None, Some(_)) => false,
            (None, None) => {
                if self.left.blob(a) != self.right.blob(b) {
                    return false;
                }
                self.blobs.insert(a, b);
                self.blobs_back.insert(b, a);
                true
            }
        }
    }
}

/// A decoded (or to-be-encoded) graph together with its ordered roots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Archive {
    pub graph: ObjectGraph,
    pub roots: Vec<Value>,
}

impl Archive {
    pub fn new(graph: ObjectGraph, roots: Vec<Value>) -> Self {
        Self { graph, roots }
    }

    pub fn root(&self, index: usize) -> Option<&Value> {
        self.roots.get(index)
    }

    pub fn equivalent(&self, other: &Archive) -> bool {
        self.graph.equivalent(&self.roots, &other.graph, &other.roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(graph: &mut ObjectGraph) -> (ObjectId, ObjectId) {
        let a = graph.reserve("Node");
        let b = graph.insert("Node", vec![Value::Object(Some(a))]);
        graph.set_fields(a, vec![Value::Object(Some(b))]);
        (a, b)
    }

    #[test]
    fn test_equivalent_ignores_id_renaming() {
        let mut left = ObjectGraph::new();
        let (a, _) = pair(&mut left);

        let mut right = ObjectGraph::new();
        right.insert("Unrelated", vec![]);
        let (_, b) = pair(&mut right);

        assert!(left.equivalent(&[Value::Object(Some(a))], &right, &[Value::Object(Some(b))]));
    }

    #[test]
    fn test_equivalent_detects_lost_sharing() {
        let mut shared = ObjectGraph::new();
        let leaf = shared.insert("Leaf", vec![Value::Int(1)]);
        let shared_root = shared.insert("Pair", vec![Value::Object(Some(leaf)), Value::Object(Some(leaf))]);

        let mut split = ObjectGraph::new();
        let l1 = split.insert("Leaf", vec![Value::Int(1)]);
        let l2 = split.insert("Leaf", vec![Value::Int(1)]);
        let split_root = split.insert("Pair", vec![Value::Object(Some(l1)), Value::Object(Some(l2))]);

        assert!(!shared.equivalent(
            &[Value::Object(Some(shared_root))],
            &split,
            &[Value::Object(Some(split_root))]
        ));
    }

    #[test]
    fn test_equivalent_compares_blob_contents() {
        let mut left = ObjectGraph::new();
        let a = left.cstring("hello");
        let mut right = ObjectGraph::new();
        let b = right.cstring("hello");
        let c = right.cstring("world");

        assert!(left.equivalent(&[a.clone()], &right, &[b]));
        assert!(!left.equivalent(&[a], &right, &[c]));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::UInt(7).as_i64(), Some(7));
        assert_eq!(Value::ULong(u64::MAX).as_i64(), None);
        assert!(Value::Object(None).is_nil());
        assert!(!Value::Int(0).is_nil());
    }
}
