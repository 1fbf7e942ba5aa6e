//! NF-040: Registration options and the options merger.
//!
//! Scalar fields: the override wins when present, otherwise the default.
//! List fields: defaults followed by overrides, de-duplicated in first-seen
//! order, so merging a result with itself changes nothing.

use crate::remote::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Per-resource behavior knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceOptions {
    /// Named provider binding (endpoint + credentials). `None` means `default`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Extra dependencies by logical name, beyond data-flow edges.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Input fields that force replacement in addition to the descriptor's immutable set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replace_on_changes: Vec<String>,

    /// Output fields to treat as secret in addition to the descriptor's.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_secret_outputs: Vec<String>,

    /// Refuse replacement and deletion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protect: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Parent resource; provider, protect and retry are inherited from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl ResourceOptions {
    pub fn is_protected(&self) -> bool {
        self.protect.unwrap_or(false)
    }

    pub fn provider_name(&self) -> &str {
        self.provider.as_deref().unwrap_or("default")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }

    /// The subset a child inherits from its parent.
    pub fn inheritable(&self) -> ResourceOptions {
        ResourceOptions {
            provider: self.provider.clone(),
            protect: self.protect,
            retry: self.retry.clone(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn protected(mut self) -> Self {
        self.protect = Some(true);
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn replace_on_changes(mut self, fields: &[&str]) -> Self {
        self.replace_on_changes
            .extend(fields.iter().map(|s| s.to_string()));
        self
    }
}

/// Combine defaults with overrides into one effective option set.
pub fn merge(defaults: &ResourceOptions, overrides: &ResourceOptions) -> ResourceOptions {
    ResourceOptions {
        provider: overrides.provider.clone().or_else(|| defaults.provider.clone()),
        depends_on: concat_unique(&defaults.depends_on, &overrides.depends_on),
        replace_on_changes: concat_unique(
            &defaults.replace_on_changes,
            &overrides.replace_on_changes,
        ),
        additional_secret_outputs: concat_unique(
            &defaults.additional_secret_outputs,
            &overrides.additional_secret_outputs,
        ),
        protect: overrides.protect.or(defaults.protect),
        retry: overrides.retry.clone().or_else(|| defaults.retry.clone()),
        parent: overrides.parent.clone().or_else(|| defaults.parent.clone()),
    }
}

fn concat_unique(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(a.len() + b.len());
    for item in a.iter().chain(b) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}
