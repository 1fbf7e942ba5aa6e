//! NF-030: Resource descriptors: static schema per resource type.
//!
//! A descriptor lists input fields with required/immutable/secret flags and
//! the output fields a resource produces. Registration, diffing, state
//! sealing and the HTTP client all read the same descriptor value, so adding
//! a resource type is one descriptor plus a thin typed facade.

use crate::resources::{branch, database, endpoint, project, random, role};
use std::fmt;

/// One declared input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputField {
    pub name: &'static str,
    pub required: bool,
    /// A change forces delete-then-create.
    pub immutable: bool,
    pub secret: bool,
}

impl InputField {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
            immutable: false,
            secret: false,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            immutable: false,
            secret: false,
        }
    }

    pub const fn immutable(self) -> Self {
        Self {
            immutable: true,
            ..self
        }
    }
}

/// One declared output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputField {
    pub name: &'static str,
    pub secret: bool,
}

impl OutputField {
    pub const fn plain(name: &'static str) -> Self {
        Self {
            name,
            secret: false,
        }
    }

    pub const fn secret(name: &'static str) -> Self {
        Self { name, secret: true }
    }
}

/// Static schema of a resource type.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Fully-qualified type token, e.g. `neon:index:Project`.
    pub type_token: &'static str,
    /// Short name accepted in YAML configs.
    pub short_name: &'static str,
    pub inputs: &'static [InputField],
    pub outputs: &'static [OutputField],
    /// Reconciled in-process instead of against the remote API.
    pub local: bool,
}

impl ResourceDescriptor {
    pub fn input(&self, name: &str) -> Option<&InputField> {
        self.inputs.iter().find(|f| f.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputField> {
        self.outputs.iter().find(|f| f.name == name)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &InputField> {
        self.inputs.iter().filter(|f| f.required)
    }

    pub fn is_immutable(&self, name: &str) -> bool {
        self.input(name).is_some_and(|f| f.immutable)
    }

    /// Every field name a handle exposes: inputs first, then outputs.
    pub fn handle_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inputs
            .iter()
            .map(|f| f.name)
            .chain(self.outputs.iter().map(|f| f.name))
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_token)
    }
}

/// Every resource type this engine manages.
pub fn all() -> [&'static ResourceDescriptor; 6] {
    [
        &project::DESCRIPTOR,
        &branch::DESCRIPTOR,
        &endpoint::DESCRIPTOR,
        &database::DESCRIPTOR,
        &role::DESCRIPTOR,
        &random::DESCRIPTOR,
    ]
}

/// Look up a descriptor by type token or short name.
pub fn lookup(name: &str) -> Option<&'static ResourceDescriptor> {
    all()
        .into_iter()
        .find(|d| d.type_token == name || d.short_name == name)
}
