//! Class registry consulted when decoding.
//!
//! A reader only materializes objects whose class is registered here. The
//! registry also carries class versions (written into class records) and
//! optional field layouts that decoded objects must match.

use std::collections::HashMap;

use crate::coder::descriptor::{TypeDescriptor, TypeKind};
use crate::coder::graph::Value;
use crate::protocol::error::{DistobjError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    name: String,
    version: u32,
    layout: Option<Vec<TypeKind>>,
}

impl ClassInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            layout: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Requires decoded instances to carry exactly these field kinds.
    pub fn with_layout(mut self, layout: Vec<TypeKind>) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn layout(&self) -> Option<&[TypeKind]> {
        self.layout.as_deref()
    }

    /// Checks decoded fields against the declared layout, if any.
    pub fn check_fields(&self, fields: &[Value]) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };
        if layout.len() != fields.len() {
            return Err(DistobjError::malformed(format!(
                "class {} expects {} fields, found {}",
                self.name,
                layout.len(),
                fields.len()
            )));
        }
        for (i, (expected, value)) in layout.iter().zip(fields).enumerate() {
            let found = TypeDescriptor::of(value).kind;
            if *expected != found {
                return Err(DistobjError::malformed(format!(
                    "class {} field {}: expected {:?}, found {:?}",
                    self.name, i, expected, found
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassInfo>,
    /// Name found in archives to the class it should decode as.
    aliases: HashMap<String, String>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class, returning the previous entry of the same name.
    pub fn register(&mut self, info: ClassInfo) -> Option<ClassInfo> {
        self.classes.insert(info.name.clone(), info)
    }

    pub fn with_class(mut self, info: ClassInfo) -> Self {
        self.register(info);
        self
    }

    /// Decodes every archive occurrence of `archived_name` as `class_name`.
    pub fn alias(&mut self, archived_name: impl Into<String>, class_name: impl Into<String>) {
        self.aliases.insert(archived_name.into(), class_name.into());
    }

    /// The name an archived class name maps to, itself if no alias exists.
    pub fn resolve_alias<'a>(&'a self, archived_name: &'a str) -> &'a str {
        self.aliases
            .get(archived_name)
            .map(String::as_str)
            .unwrap_or(archived_name)
    }

    pub fn get(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.values()
    }

    pub fn version_of(&self, name: &str) -> Option<u32> {
        self.classes.get(name).map(|info| info.version)
    }

    /// Merges every class and alias from `other`; entries in `other` win.
    pub fn extend(&mut self, other: &ClassRegistry) {
        for info in other.classes.values() {
            self.register(info.clone());
        }
        for (from, to) in &other.aliases {
            self.aliases.insert(from.clone(), to.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
