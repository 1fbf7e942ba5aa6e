//! NF-002: YAML parsing, validation, and stack construction.
//!
//! Parses neonform.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Resource types must be known
//! - Properties must be declared inputs; required ones present (unless `get`)
//! - `${resource.field}`, depends_on and parent references must exist
//!
//! `build_stack` turns a valid config into registrations, producers first.

use super::descriptor::{self, ResourceDescriptor};
use super::error::{EngineError, EngineResult};
use super::options::ResourceOptions;
use super::output::Output;
use super::resolver;
use super::stack::{Inputs, ResourceHandle, Stack};
use super::types::*;
use crate::remote::neon::NeonApi;
use crate::remote::ProviderSet;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a neonform.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<StackConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a neonform.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StackConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut error = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        error(format!("version must be \"1.0\", got \"{}\"", config.version));
    }
    if config.name.is_empty() {
        error("name must not be empty".to_string());
    }
    if config.policy.parallelism == 0 {
        error("policy.parallelism must be at least 1".to_string());
    }
    if config.defaults.parent.is_some() {
        error("defaults.parent is not allowed".to_string());
    }

    for (id, resource) in &config.resources {
        let Some(descriptor) = descriptor::lookup(&resource.resource_type) else {
            error(format!(
                "resource '{}' has unknown type '{}'",
                id, resource.resource_type
            ));
            continue;
        };

        for field in resource.properties.keys() {
            if descriptor.input(field).is_none() {
                error(format!(
                    "resource '{}' ({}) has unknown property '{}'",
                    id, descriptor, field
                ));
            }
        }
        if resource.get.is_none() {
            for field in descriptor.required_inputs() {
                let present = resource
                    .properties
                    .get(field.name)
                    .is_some_and(|v| !v.is_null());
                if !present {
                    error(format!(
                        "resource '{}' ({}) is missing required property '{}'",
                        id, descriptor, field.name
                    ));
                }
            }
        }
        for field in &resource.secret {
            if !resource.properties.contains_key(field) {
                error(format!(
                    "resource '{}' marks unknown property '{}' as secret",
                    id, field
                ));
            }
        }

        let mut values: Vec<(&str, Option<Value>)> = resource
            .properties
            .iter()
            .map(|(k, v)| (k.as_str(), yaml_to_json(v).ok()))
            .collect();
        if let Some(get) = &resource.get {
            values.push(("get", Some(Value::String(get.clone()))));
        }
        for (field, value) in values {
            let Some(text) = value else {
                error(format!(
                    "resource '{}' property '{}' is not representable as JSON",
                    id, field
                ));
                continue;
            };
            if let Err(e) = resolver::resolve_value_templates(&text, &config.params) {
                error(format!("resource '{}' property '{}': {}", id, field, e));
                continue;
            }
            match resolver::value_references(&text) {
                Ok(refs) => {
                    for r in refs {
                        match config.resources.get(&r.resource) {
                            None => error(format!(
                                "resource '{}' references unknown resource '{}'",
                                id, r.resource
                            )),
                            Some(target) => {
                                let known = r.field == "id"
                                    || descriptor::lookup(&target.resource_type)
                                        .is_some_and(|d| d.handle_fields().any(|f| f == r.field));
                                if !known {
                                    error(format!(
                                        "resource '{}' references unknown field '{}.{}'",
                                        id, r.resource, r.field
                                    ));
                                }
                            }
                        }
                    }
                }
                Err(e) => error(format!("resource '{}' property '{}': {}", id, field, e)),
            }
        }

        if let Some(length) = resource.properties.get("length").and_then(|v| v.as_u64()) {
            if descriptor.type_token == crate::resources::random::DESCRIPTOR.type_token
                && (length == 0 || length > crate::resources::random::MAX_LENGTH)
            {
                error(format!(
                    "resource '{}' (random) length must be between 1 and {}",
                    id,
                    crate::resources::random::MAX_LENGTH
                ));
            }
        }

        let depends_on = resource.depends_on.iter().chain(&resource.options.depends_on);
        for dep in depends_on {
            if !config.resources.contains_key(dep) {
                error(format!(
                    "resource '{}' depends on unknown resource '{}'",
                    id, dep
                ));
            }
            if dep == id {
                error(format!("resource '{}' depends on itself", id));
            }
        }
        if let Some(parent) = &resource.options.parent {
            if !config.resources.contains_key(parent) {
                error(format!(
                    "resource '{}' has unknown parent '{}'",
                    id, parent
                ));
            }
        }

        if !descriptor.local {
            let provider = resource
                .options
                .provider
                .as_deref()
                .or(config.defaults.provider.as_deref())
                .unwrap_or("default");
            if !config.providers.contains_key(provider) {
                error(format!(
                    "resource '{}' uses undeclared provider '{}'",
                    id, provider
                ));
            }
        }
    }

    errors
}

/// Producers of a declaration: references, depends_on, and parent.
fn declared_dependencies(decl: &ResourceDecl) -> EngineResult<Vec<String>> {
    let mut deps = Vec::new();
    let values = decl
        .properties
        .values()
        .map(yaml_to_json)
        .chain(decl.get.iter().map(|g| Ok(Value::String(g.clone()))));
    for value in values {
        let value = value.map_err(EngineError::Validation)?;
        for r in resolver::value_references(&value).map_err(EngineError::Validation)? {
            deps.push(r.resource);
        }
    }
    deps.extend(decl.depends_on.iter().cloned());
    deps.extend(decl.options.depends_on.iter().cloned());
    deps.extend(decl.options.parent.iter().cloned());
    deps.sort();
    deps.dedup();
    Ok(deps)
}

/// Substitute templates and wire references into a deferred input.
fn build_input(
    id: &str,
    field: &str,
    value: &Value,
    config: &StackConfig,
    handles: &IndexMap<String, ResourceHandle>,
) -> EngineResult<Output<Value>> {
    let invalid = |e: String| EngineError::Validation(format!("resource '{}' property '{}': {}", id, field, e));
    let value = resolver::resolve_value_templates(value, &config.params).map_err(invalid)?;
    resolver::resolve_references(&value, handles).map_err(invalid)
}

/// Build a `Stack` from a parsed config.
///
/// Declarations are registered producers first, so every `${name.field}`
/// reference points at an existing handle. A reference cycle is reported
/// as `DependencyCycle` before anything is registered.
pub fn build_stack(config: &StackConfig) -> EngineResult<Stack> {
    let mut graph: IndexMap<String, Vec<String>> = IndexMap::new();
    for (id, decl) in &config.resources {
        graph.insert(id.clone(), declared_dependencies(decl)?);
    }
    let order = resolver::topo_order(&graph)?;

    let mut stack = Stack::new(&config.name).with_defaults(config.defaults.clone());
    let mut handles: IndexMap<String, ResourceHandle> = IndexMap::new();
    for id in order {
        let Some(decl) = config.resources.get(&id) else {
            continue;
        };
        let descriptor: &'static ResourceDescriptor = descriptor::lookup(&decl.resource_type)
            .ok_or_else(|| EngineError::UnknownResourceType(decl.resource_type.clone()))?;

        let mut inputs = Inputs::new();
        for (field, raw) in &decl.properties {
            let value = yaml_to_json(raw).map_err(EngineError::Validation)?;
            let mut input = build_input(&id, field, &value, config, &handles)?;
            if decl.secret.contains(field) {
                input = input.into_secret();
            }
            inputs.insert(field.clone(), input);
        }

        let mut options: ResourceOptions = decl.options.clone();
        for dep in &decl.depends_on {
            if !options.depends_on.contains(dep) {
                options.depends_on.push(dep.clone());
            }
        }

        let handle = match &decl.get {
            Some(get) => {
                let id_value = build_input(&id, "get", &Value::String(get.clone()), config, &handles)?;
                let identity = id_value.apply(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
                stack.lookup(descriptor, &id, identity, inputs, options)?
            }
            None => stack.register(descriptor, &id, inputs, options)?,
        };
        handles.insert(id, handle);
    }
    Ok(stack)
}

/// One `NeonApi` per declared provider binding.
///
/// Keys are read from the environment now; a missing key only fails once a
/// remote call is made.
pub fn build_providers(config: &StackConfig) -> Result<ProviderSet, String> {
    let mut set = ProviderSet::new();
    for (name, provider) in &config.providers {
        let api_key = std::env::var(&provider.api_key_env).ok().filter(|k| !k.is_empty());
        let api = NeonApi::new(
            &provider.endpoint,
            api_key,
            Duration::from_secs(provider.timeout_secs),
        )
        .map_err(|e| format!("provider '{}': {}", name, e))?;
        set = set.with(name, std::sync::Arc::new(api));
    }
    Ok(set)
}
