//! Type descriptors.
//!
//! Every record in an archive starts with a one-byte tag naming the kind of
//! value that follows. Tags reuse the Objective-C type-encoding alphabet so a
//! method signature string (`"i@:ii"`) and the records of its arguments speak
//! the same vocabulary. The high bit of a tag marks a cross-reference.

use crate::coder::graph::Value;
use crate::protocol::error::{DistobjError, Result};

/// Set on a tag when the record is a backreference (or nil) instead of contents.
pub const XREF_FLAG: u8 = 0x80;

/// Mask selecting the kind bits of a tag.
pub const TAG_MASK: u8 = 0x7f;

/// Fixed-width scalar kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
}

impl ScalarKind {
    /// Number of content bytes following the tag.
    pub fn width(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::Char | ScalarKind::UChar => 1,
            ScalarKind::Short | ScalarKind::UShort => 2,
            ScalarKind::Int | ScalarKind::UInt | ScalarKind::Float => 4,
            ScalarKind::Long | ScalarKind::ULong | ScalarKind::Double => 8,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            ScalarKind::Bool => b'B',
            ScalarKind::Char => b'c',
            ScalarKind::UChar => b'C',
            ScalarKind::Short => b's',
            ScalarKind::UShort => b'S',
            ScalarKind::Int => b'i',
            ScalarKind::UInt => b'I',
            ScalarKind::Long => b'q',
            ScalarKind::ULong => b'Q',
            ScalarKind::Float => b'f',
            ScalarKind::Double => b'd',
        }
    }
}

/// The shape of one value being written or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Scalar(ScalarKind),
    Pointer,
    CString,
    Object,
    Class,
    Selector,
}

impl TypeKind {
    /// The tag byte for this kind, without the cross-reference bit.
    pub fn tag(self) -> u8 {
        match self {
            TypeKind::Scalar(scalar) => scalar.tag(),
            TypeKind::Pointer => b'^',
            TypeKind::CString => b'*',
            TypeKind::Object => b'@',
            TypeKind::Class => b'#',
            TypeKind::Selector => b':',
        }
    }

    /// Parses a tag byte (cross-reference bit already stripped).
    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            b'B' => TypeKind::Scalar(ScalarKind::Bool),
            b'c' => TypeKind::Scalar(ScalarKind::Char),
            b'C' => TypeKind::Scalar(ScalarKind::UChar),
            b's' => TypeKind::Scalar(ScalarKind::Short),
            b'S' => TypeKind::Scalar(ScalarKind::UShort),
            b'i' => TypeKind::Scalar(ScalarKind::Int),
            b'I' => TypeKind::Scalar(ScalarKind::UInt),
            b'q' => TypeKind::Scalar(ScalarKind::Long),
            b'Q' => TypeKind::Scalar(ScalarKind::ULong),
            b'f' => TypeKind::Scalar(ScalarKind::Float),
            b'd' => TypeKind::Scalar(ScalarKind::Double),
            b'^' => TypeKind::Pointer,
            b'*' => TypeKind::CString,
            b'@' => TypeKind::Object,
            b'#' => TypeKind::Class,
            b':' => TypeKind::Selector,
            _ => return None,
        };
        Some(kind)
    }

    /// Objects, classes, selectors, C strings and pointers are deduplicated
    /// through a cross-reference table; scalars are always written inline.
    pub fn is_cross_referenced(self) -> bool {
        !matches!(self, TypeKind::Scalar(_))
    }
}

/// Type qualifier bitset (`const`, `in`, `out`, `inout`, `bycopy`, `byref`, `oneway`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qualifiers(u8);

impl Qualifiers {
    pub const NONE: Qualifiers = Qualifiers(0);
    pub const CONST: Qualifiers = Qualifiers(1 << 0);
    pub const IN: Qualifiers = Qualifiers(1 << 1);
    pub const OUT: Qualifiers = Qualifiers(1 << 2);
    pub const INOUT: Qualifiers = Qualifiers(1 << 3);
    pub const BYCOPY: Qualifiers = Qualifiers(1 << 4);
    pub const BYREF: Qualifiers = Qualifiers(1 << 5);
    pub const ONEWAY: Qualifiers = Qualifiers(1 << 6);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Qualifiers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Qualifiers) {
        self.0 |= other.0;
    }

    /// Maps a signature qualifier character to its flag.
    pub fn from_char(c: char) -> Option<Qualifiers> {
        match c {
            'r' => Some(Qualifiers::CONST),
            'n' => Some(Qualifiers::IN),
            'o' => Some(Qualifiers::OUT),
            'N' => Some(Qualifiers::INOUT),
            'O' => Some(Qualifiers::BYCOPY),
            'R' => Some(Qualifiers::BYREF),
            'V' => Some(Qualifiers::ONEWAY),
            _ => None,
        }
    }
}

impl std::ops::BitOr for Qualifiers {
    type Output = Qualifiers;

    fn bitor(self, rhs: Qualifiers) -> Qualifiers {
        Qualifiers(self.0 | rhs.0)
    }
}

/// Kind plus qualifiers for a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub kind: TypeKind,
    pub qualifiers: Qualifiers,
}

impl TypeDescriptor {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            qualifiers: Qualifiers::NONE,
        }
    }

    pub fn with_qualifiers(mut self, qualifiers: Qualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    /// Classifies a value.
    pub fn of(value: &Value) -> Self {
        let kind = match value {
            Value::Bool(_) => TypeKind::Scalar(ScalarKind::Bool),
            Value::Char(_) => TypeKind::Scalar(ScalarKind::Char),
            Value::UChar(_) => TypeKind::Scalar(ScalarKind::UChar),
            Value::Short(_) => TypeKind::Scalar(ScalarKind::Short),
            Value::UShort(_) => TypeKind::Scalar(ScalarKind::UShort),
            Value::Int(_) => TypeKind::Scalar(ScalarKind::Int),
            Value::UInt(_) => TypeKind::Scalar(ScalarKind::UInt),
            Value::Long(_) => TypeKind::Scalar(ScalarKind::Long),
            Value::ULong(_) => TypeKind::Scalar(ScalarKind::ULong),
            Value::Float(_) => TypeKind::Scalar(ScalarKind::Float),
            Value::Double(_) => TypeKind::Scalar(ScalarKind::Double),
            Value::CString(_) => TypeKind::CString,
            Value::Pointer(_) => TypeKind::Pointer,
            Value::Selector(_) => TypeKind::Selector,
            Value::Class(_) => TypeKind::Class,
            Value::Object(_) | Value::ConditionalObject(_) => TypeKind::Object,
        };
        Self::new(kind)
    }

    pub fn tag(&self) -> u8 {
        self.kind.tag()
    }
}

/// A parsed method type string such as `"Vv@:i"` or `"q@:qq"`.
///
/// The first descriptor is the return type (`None` for `v`), the rest are the
/// arguments, including the implicit receiver (`@`) and selector (`:`).
/// Numeric frame offsets, as emitted by some runtimes, are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub return_type: Option<TypeDescriptor>,
    /// Qualifiers attached to the return slot; `oneway` lives here even for `void`.
    pub return_qualifiers: Qualifiers,
    pub arguments: Vec<TypeDescriptor>,
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self> {
        let mut chars = text.chars().peekable();
        let mut slots: Vec<(Qualifiers, Option<TypeKind>)> = Vec::new();

        loop {
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            let mut qualifiers = Qualifiers::NONE;
            while let Some(flag) = chars.peek().and_then(|c| Qualifiers::from_char(*c)) {
                qualifiers.insert(flag);
                chars.next();
            }
            let Some(code) = chars.next() else {
                if !qualifiers.is_empty() {
                    return Err(invalid_signature(text, "dangling qualifier"));
                }
                break;
            };
            let kind = match code {
                'v' => None,
                'l' => Some(TypeKind::Scalar(ScalarKind::Int)),
                'L' => Some(TypeKind::Scalar(ScalarKind::UInt)),
                '^' => {
                    // pointee type is informational only
                    match chars.next() {
                        Some(c) if c.is_ascii() && TypeKind::from_tag(c as u8).is_some() => {}
                        Some('v') => {}
                        _ => return Err(invalid_signature(text, "pointer without pointee type")),
                    }
                    Some(TypeKind::Pointer)
                }
                c if c.is_ascii() => match TypeKind::from_tag(c as u8) {
                    Some(kind) => Some(kind),
                    None => return Err(invalid_signature(text, &format!("unsupported type code '{}'", c))),
                },
                c => return Err(invalid_signature(text, &format!("unsupported type code '{}'", c))),
            };
            slots.push((qualifiers, kind));
        }

        let mut slots = slots.into_iter();
        let (return_qualifiers, return_kind) = slots
            .next()
            .ok_or_else(|| invalid_signature(text, "empty signature"))?;

        let mut arguments = Vec::new();
        for (qualifiers, kind) in slots {
            let kind = kind.ok_or_else(|| invalid_signature(text, "void argument"))?;
            arguments.push(TypeDescriptor::new(kind).with_qualifiers(qualifiers));
        }

        Ok(Self {
            return_type: return_kind.map(|kind| TypeDescriptor::new(kind).with_qualifiers(return_qualifiers)),
            return_qualifiers,
            arguments,
        })
    }

    pub fn is_oneway(&self) -> bool {
        self.return_qualifiers.contains(Qualifiers::ONEWAY)
    }

    /// Arguments after the implicit receiver and selector slots.
    pub fn explicit_arguments(&self) -> &[TypeDescriptor] {
        match self.arguments.as_slice() {
            [receiver, selector, rest @ ..]
                if receiver.kind == TypeKind::Object && selector.kind == TypeKind::Selector =>
            {
                rest
            }
            all => all,
        }
    }

    /// Whether `values` match the explicit arguments in count and kind.
    pub fn accepts(&self, values: &[Value]) -> bool {
        let expected = self.explicit_arguments();
        expected.len() == values.len()
            && expected
                .iter()
                .zip(values)
                .all(|(descriptor, value)| descriptor.kind == TypeDescriptor::of(value).kind)
    }
}

fn invalid_signature(text: &str, reason: &str) -> DistobjError {
    DistobjError::ProtocolViolation(format!("invalid method signature '{}': {}", text, reason))
}
