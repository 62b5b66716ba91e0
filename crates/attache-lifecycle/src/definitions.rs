//! Per-slot configuration, fixed when a slot is declared.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use attache_core::{Error, Result};

/// What happens to a blob when its slot lets go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// Purge the released blob once no other slot references it.
    #[default]
    Dependent,
    /// Leave the released blob and its bytes alone.
    Independent,
}

/// Declaration of one named slot on one owner type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDefinition {
    pub owner_type: String,
    pub name: String,
    #[serde(default)]
    pub dependency: Dependency,
}

impl SlotDefinition {
    /// Declare a dependent slot.
    pub fn new(owner_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            name: name.into(),
            dependency: Dependency::Dependent,
        }
    }

    /// Declare an independent slot.
    pub fn independent(owner_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(owner_type, name).with_dependency(Dependency::Independent)
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }

    pub fn is_dependent(&self) -> bool {
        self.dependency == Dependency::Dependent
    }

    /// `Owner.slot`, used in error messages and logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner_type, self.name)
    }
}

/// All declared slots, keyed by owner type and slot name.
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    definitions: BTreeMap<(String, String), SlotDefinition>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a slot. Declaring the same slot twice is a configuration error.
    pub fn register(&mut self, definition: SlotDefinition) -> Result<()> {
        let key = (definition.owner_type.clone(), definition.name.clone());
        if self.definitions.contains_key(&key) {
            return Err(Error::Config(format!(
                "slot {} declared twice",
                definition.qualified_name()
            )));
        }
        self.definitions.insert(key, definition);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, definition: SlotDefinition) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    /// Look up a declared slot.
    pub fn get(&self, owner_type: &str, name: &str) -> Result<&SlotDefinition> {
        self.definitions
            .get(&(owner_type.to_string(), name.to_string()))
            .ok_or_else(|| Error::UnknownSlot(format!("{}.{}", owner_type, name)))
    }

    /// Slots declared for one owner type, ordered by name.
    pub fn slots_for<'a>(&'a self, owner_type: &'a str) -> impl Iterator<Item = &'a SlotDefinition> + 'a {
        self.definitions
            .values()
            .filter(move |d| d.owner_type == owner_type)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
