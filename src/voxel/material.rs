//! Material registry: symbolic names to compact numeric ids

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Compact material id stored in chunk encodings
pub type MaterialId = u16;

/// Id of the implicit empty material
pub const EMPTY_MATERIAL: MaterialId = 0;

/// Name registered for [`EMPTY_MATERIAL`]
pub const EMPTY_MATERIAL_NAME: &str = "base:air";

/// Bidirectional name ⇄ id table.
///
/// Ids are handed out in registration order, so a registry rebuilt from the
/// same name list yields the same ids.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct MaterialRegistry {
    names: Vec<String>,
    ids: HashMap<String, MaterialId>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            names: Vec::new(),
            ids: HashMap::new(),
        };
        registry.insert(EMPTY_MATERIAL_NAME);
        registry
    }

    /// Build a registry from a list of names (the empty material is implicit).
    pub fn with_materials<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.register(name.as_ref())?;
        }
        Ok(registry)
    }

    /// Register a material, returning its id. Re-registering returns the
    /// existing id.
    pub fn register(&mut self, name: &str) -> Result<MaterialId> {
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }
        if self.names.len() > MaterialId::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "material registry is full, cannot add {name}"
            )));
        }
        Ok(self.insert(name))
    }

    fn insert(&mut self, name: &str) -> MaterialId {
        let id = self.names.len() as MaterialId;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<MaterialId> {
        self.ids.get(name).copied()
    }

    /// Like [`MaterialRegistry::id`] but reports a missing name as an error.
    pub fn require(&self, name: &str) -> Result<MaterialId> {
        self.id(name).ok_or_else(|| Error::UnknownMaterial(name.to_string()))
    }

    pub fn name(&self, id: MaterialId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        // The empty material is always present
        false
    }
}

impl Default for MaterialRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<String>> for MaterialRegistry {
    fn from(names: Vec<String>) -> Self {
        let mut registry = Self::new();
        for name in names {
            if name != EMPTY_MATERIAL_NAME && registry.names.len() <= MaterialId::MAX as usize {
                registry.insert(&name);
            }
        }
        registry
    }
}

impl From<MaterialRegistry> for Vec<String> {
    fn from(registry: MaterialRegistry) -> Self {
        registry.names.into_iter().skip(1).collect()
    }
}
