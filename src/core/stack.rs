//! NF-070: Resource registration into a stack, the explicit configuration context.
//!
//! `register` validates inputs against the descriptor, merges options, derives
//! dependency edges, and returns a handle whose outputs are pending until the
//! engine reconciles the resource. Nothing touches the network here.

use super::descriptor::ResourceDescriptor;
use super::error::{EngineError, EngineResult};
use super::options::{merge, ResourceOptions};
use super::output::{Output, OutputError, Resolver, Slot};
use super::types::Fields;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Deferred inputs keyed by field name.
pub type Inputs = IndexMap<String, Output<Value>>;

/// How a registration is reconciled.
#[derive(Debug, Clone)]
pub enum RegistrationKind {
    /// Desired state, driven by create/update/delete.
    Managed,
    /// Adopt an existing object by identity; read only.
    Lookup { id: Output<String> },
}

/// Write side of a handle's outputs.
pub(crate) struct HandleResolvers {
    id: Resolver<String>,
    id_value: Resolver<Value>,
    fields: IndexMap<String, Resolver<Value>>,
}

impl HandleResolvers {
    /// Publish a reconciled object. Fields the object lacks resolve to null.
    pub(crate) fn resolve(self, id: &str, fields: &Fields) {
        self.id.resolve(id.to_string());
        self.id_value.resolve(Value::String(id.to_string()));
        for (name, resolver) in self.fields {
            resolver.resolve(fields.get(&name).cloned().unwrap_or(Value::Null));
        }
    }

    pub(crate) fn fail(self, error: OutputError) {
        self.id.fail(error.clone());
        self.id_value.fail(error.clone());
        for (_, resolver) in self.fields {
            resolver.fail(error.clone());
        }
    }
}

/// One registered resource, as the scheduler sees it.
pub struct Registration {
    pub name: String,
    pub descriptor: &'static ResourceDescriptor,
    pub kind: RegistrationKind,
    pub inputs: Inputs,
    /// Effective options after defaults, parent and overrides are merged.
    pub options: ResourceOptions,
    /// Producer names: data-flow edges, `depends_on`, and the parent.
    pub dependencies: BTreeSet<String>,
    /// Output field names carrying the secret taint.
    pub secret_outputs: BTreeSet<String>,
    pub(crate) resolvers: HandleResolvers,
}

impl Registration {
    pub fn is_lookup(&self) -> bool {
        matches!(self.kind, RegistrationKind::Lookup { .. })
    }
}

/// What `register` hands back: identity and outputs, all deferred.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub name: String,
    pub type_token: &'static str,
    pub id: Output<String>,
    outputs: IndexMap<String, Output<Value>>,
}

impl ResourceHandle {
    /// A deferred field; `"id"` is the remote identity.
    pub fn output(&self, field: &str) -> Option<Output<Value>> {
        self.outputs.get(field).cloned()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}

/// A named deployment scope and everything registered in it.
pub struct Stack {
    name: String,
    defaults: ResourceOptions,
    registrations: Vec<Registration>,
    index: HashMap<String, usize>,
}

impl Stack {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            defaults: ResourceOptions::default(),
            registrations: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Options merged under every registration.
    pub fn with_defaults(mut self, defaults: ResourceOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &ResourceOptions {
        &self.defaults
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.index.get(name).map(|&i| &self.registrations[i])
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Node → dependencies, in registration order.
    pub fn dependency_graph(&self) -> IndexMap<String, Vec<String>> {
        self.registrations
            .iter()
            .map(|r| (r.name.clone(), r.dependencies.iter().cloned().collect()))
            .collect()
    }

    pub(crate) fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }

    /// Declare desired state for one resource.
    pub fn register(
        &mut self,
        descriptor: &'static ResourceDescriptor,
        name: &str,
        inputs: Inputs,
        options: ResourceOptions,
    ) -> EngineResult<ResourceHandle> {
        self.check_name(name)?;

        if let Some(unknown) = inputs.keys().find(|k| descriptor.input(k).is_none()) {
            return Err(EngineError::Validation(format!(
                "resource '{}' ({}): unknown field '{}'",
                name, descriptor, unknown
            )));
        }

        let missing: Vec<String> = descriptor
            .required_inputs()
            .filter(|f| match inputs.get(f.name) {
                None => true,
                Some(v) => matches!(v.peek(), Slot::Resolved(Value::Null)),
            })
            .map(|f| f.name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::MissingRequiredField {
                resource: name.to_string(),
                type_token: descriptor.type_token.to_string(),
                fields: missing,
            });
        }

        let options = self.effective_options(name, &options)?;
        if let Some(field) = options
            .replace_on_changes
            .iter()
            .find(|f| descriptor.input(f).is_none())
        {
            return Err(EngineError::Validation(format!(
                "resource '{}': replace_on_changes names '{}', which is not an input of {}",
                name, field, descriptor
            )));
        }

        let inputs: Inputs = inputs
            .into_iter()
            .map(|(k, v)| {
                let secret = descriptor.input(&k).is_some_and(|f| f.secret);
                (k, if secret { v.into_secret() } else { v })
            })
            .collect();

        let mut dependencies: BTreeSet<String> = inputs
            .values()
            .flat_map(|o| o.producers().iter().cloned())
            .collect();
        self.push(descriptor, name, RegistrationKind::Managed, inputs, options, &mut dependencies)
    }

    /// Adopt an existing object by identity. Inputs are passed through
    /// unvalidated; they only address nested objects for the read.
    pub fn lookup(
        &mut self,
        descriptor: &'static ResourceDescriptor,
        name: &str,
        id: Output<String>,
        inputs: Inputs,
        options: ResourceOptions,
    ) -> EngineResult<ResourceHandle> {
        self.check_name(name)?;
        let options = self.effective_options(name, &options)?;
        let mut dependencies: BTreeSet<String> = inputs
            .values()
            .flat_map(|o| o.producers().iter().cloned())
            .chain(id.producers().iter().cloned())
            .collect();
        self.push(
            descriptor,
            name,
            RegistrationKind::Lookup { id },
            inputs,
            options,
            &mut dependencies,
        )
    }

    fn check_name(&self, name: &str) -> EngineResult<()> {
        if name.is_empty() {
            return Err(EngineError::Validation("resource name must not be empty".into()));
        }
        if self.index.contains_key(name) {
            return Err(EngineError::Validation(format!(
                "duplicate resource name '{}'",
                name
            )));
        }
        Ok(())
    }

    fn effective_options(&self, name: &str, overrides: &ResourceOptions) -> EngineResult<ResourceOptions> {
        let mut base = self.defaults.clone();
        if let Some(parent) = overrides.parent.as_ref().or(self.defaults.parent.as_ref()) {
            let p = self.get(parent).ok_or_else(|| {
                EngineError::Validation(format!(
                    "resource '{}' has unknown parent '{}'",
                    name, parent
                ))
            })?;
            base = merge(&base, &p.options.inheritable());
        }
        let options = merge(&base, overrides);
        if options.retry.as_ref().is_some_and(|r| r.max_attempts == 0) {
            return Err(EngineError::Validation(format!(
                "resource '{}': retry.max_attempts must be at least 1",
                name
            )));
        }
        Ok(options)
    }

    fn push(
        &mut self,
        descriptor: &'static ResourceDescriptor,
        name: &str,
        kind: RegistrationKind,
        inputs: Inputs,
        options: ResourceOptions,
        dependencies: &mut BTreeSet<String>,
    ) -> EngineResult<ResourceHandle> {
        dependencies.extend(options.depends_on.iter().cloned());
        dependencies.extend(options.parent.iter().cloned());
        if dependencies.contains(name) {
            return Err(EngineError::DependencyCycle {
                members: vec![name.to_string()],
            });
        }

        if let Some(field) = options
            .additional_secret_outputs
            .iter()
            .find(|f| !descriptor.handle_fields().any(|h| h == f.as_str()))
        {
            return Err(EngineError::Validation(format!(
                "resource '{}': additional_secret_outputs names unknown field '{}'",
                name, field
            )));
        }

        let secret_outputs: BTreeSet<String> = descriptor
            .handle_fields()
            .filter(|field| {
                descriptor.output(field).is_some_and(|o| o.secret)
                    || descriptor.input(field).is_some_and(|i| i.secret)
                    || inputs.get(*field).is_some_and(Output::is_secret)
                    || options.additional_secret_outputs.iter().any(|s| s == field)
            })
            .map(str::to_string)
            .collect();

        let (id_resolver, id) = Output::<String>::produced_by(name, false);
        let (id_value_resolver, id_value) = Output::<Value>::produced_by(name, false);
        let mut outputs = IndexMap::new();
        let mut field_resolvers = IndexMap::new();
        outputs.insert("id".to_string(), id_value);
        for field in descriptor.handle_fields() {
            let (resolver, output) = Output::produced_by(name, secret_outputs.contains(field));
            outputs.insert(field.to_string(), output);
            field_resolvers.insert(field.to_string(), resolver);
        }

        let handle = ResourceHandle {
            name: name.to_string(),
            type_token: descriptor.type_token,
            id,
            outputs,
        };
        self.index.insert(name.to_string(), self.registrations.len());
        self.registrations.push(Registration {
            name: name.to_string(),
            descriptor,
            kind,
            inputs,
            options,
            dependencies: std::mem::take(dependencies),
            secret_outputs,
            resolvers: HandleResolvers {
                id: id_resolver,
                id_value: id_value_resolver,
                fields: field_resolvers,
            },
        });
        Ok(handle)
    }
}
