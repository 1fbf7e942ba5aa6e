//! NF-001: Configuration, state, plan, report, and provenance types.
//!
//! Defines the YAML schema for stacks and state locks, plus the in-memory
//! plan and apply report. All persisted types derive Serialize/Deserialize.

use super::options::ResourceOptions;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Concrete field values, in descriptor order.
pub type Fields = IndexMap<String, serde_json::Value>;

/// Placeholder for a value that is only known after apply.
pub const UNKNOWN: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

// ============================================================================
// Top-level neonform.yaml
// ============================================================================

/// Root configuration: the desired state of a deployment scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Stack name; scopes state and idempotency tokens
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Global parameters (templatable)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Named provider bindings
    #[serde(default = "default_providers")]
    pub providers: IndexMap<String, ProviderConfig>,

    /// Options merged under every resource
    #[serde(default)]
    pub defaults: ResourceOptions,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, ResourceDecl>,

    #[serde(default)]
    pub policy: Policy,
}

fn default_providers() -> IndexMap<String, ProviderConfig> {
    IndexMap::from([("default".to_string(), ProviderConfig::default())])
}

/// How to reach one control-plane endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    crate::remote::neon::DEFAULT_ENDPOINT.to_string()
}

fn default_api_key_env() -> String {
    "NEON_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

/// A single resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Type token (`neon:index:Branch`) or short name (`branch`)
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Input properties; strings may hold `{{params.x}}` and `${name.field}`
    #[serde(default)]
    pub properties: IndexMap<String, serde_yaml_ng::Value>,

    /// Properties to mark secret
    #[serde(default)]
    pub secret: Vec<String>,

    /// Adopt an existing object by id instead of managing it
    #[serde(default)]
    pub get: Option<String>,

    /// Dependencies (other resource names that must be applied first)
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub options: ResourceOptions,
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Process-wide cap on concurrent remote calls
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Append provenance events on every apply
    #[serde(default = "default_true")]
    pub tripwire: bool,

    /// Persist state after apply
    #[serde(default = "default_true")]
    pub lock_file: bool,

    /// Read no-op resources to refresh their outputs
    #[serde(default)]
    pub refresh: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            parallelism: default_parallelism(),
            tripwire: true,
            lock_file: true,
            refresh: false,
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every resource that has not started yet.
    StopOnFirst,
    /// Cancel only the transitive dependents of the failed resource.
    #[default]
    ContinueIndependent,
}

// ============================================================================
// State / Lock file
// ============================================================================

/// Per-stack state lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    pub schema: String,

    pub stack: String,

    pub generated_at: String,

    pub generator: String,

    /// Per-resource state, keyed by logical name
    pub resources: IndexMap<String, ResourceRecord>,
}

/// Last-known state of one resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(rename = "type")]
    pub type_token: String,

    /// Identity assigned by the remote API
    pub id: String,

    pub status: ResourceStatus,

    /// Provider binding used to reach it
    #[serde(default = "default_provider_name")]
    pub provider: String,

    /// Adopted via lookup; never deleted by this stack
    #[serde(default)]
    pub external: bool,

    #[serde(default)]
    pub protect: bool,

    /// Bumped on every replacement; feeds the idempotency token
    #[serde(default)]
    pub generation: u32,

    #[serde(default)]
    pub inputs: Fields,

    #[serde(default)]
    pub outputs: Fields,

    /// Field names whose values are sealed on disk
    #[serde(default)]
    pub secret_fields: BTreeSet<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    /// BLAKE3 of the declared input fields
    #[serde(default)]
    pub hash: String,

    #[serde(default)]
    pub applied_at: Option<String>,

    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

fn default_provider_name() -> String {
    "default".to_string()
}

/// Resource convergence status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Converged,
    Failed,
    /// A drift check found the remote object changed or gone.
    Drifted,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "CONVERGED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Drifted => write!(f, "DRIFTED"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAction {
    Create,
    Update,
    Replace,
    Delete,
    Read,
    NoOp,
}

impl ResourceAction {
    /// Plan symbol, terraform-style.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "+-",
            Self::Delete => "-",
            Self::Read => "=",
            Self::NoOp => " ",
        }
    }

    /// True if the action issues a remote write.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Replace | Self::Delete
        )
    }
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Replace => write!(f, "REPLACE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Read => write!(f, "READ"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,

    pub type_token: String,

    pub action: ResourceAction,

    /// Input fields whose desired value differs from the last-known one
    pub changed_fields: Vec<String>,

    /// Human-readable description
    pub description: String,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Stack name
    pub name: String,

    pub changes: Vec<PlannedChange>,

    /// Topological execution order (resource names)
    pub execution_order: Vec<String>,

    /// Groups that may run concurrently, in order
    pub waves: Vec<Vec<String>>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_replace: u32,
    pub to_delete: u32,
    pub to_read: u32,
    pub unchanged: u32,
}

impl ExecutionPlan {
    pub fn change(&self, resource_id: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.resource_id == resource_id)
    }
}

// ============================================================================
// Apply report
// ============================================================================

/// Final outcome of one resource in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutcome {
    Created,
    Updated,
    Replaced,
    Deleted,
    Read,
    NoOp,
    Failed { error: String },
    Skipped { reason: String },
}

impl ResourceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Skipped { .. })
    }
}

impl fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Replaced => write!(f, "replaced"),
            Self::Deleted => write!(f, "deleted"),
            Self::Read => write!(f, "read"),
            Self::NoOp => write!(f, "no-op"),
            Self::Failed { error } => write!(f, "failed: {}", error),
            Self::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutcomeEntry {
    pub type_token: String,
    pub outcome: ResourceOutcome,
    pub duration_seconds: f64,
}

/// Result of one apply/destroy run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub stack: String,
    pub run_id: String,
    pub outcomes: IndexMap<String, OutcomeEntry>,
    pub total_duration: std::time::Duration,
}

impl ApplyReport {
    pub fn outcome(&self, resource_id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.get(resource_id).map(|e| &e.outcome)
    }

    pub fn count(&self, pred: impl Fn(&ResourceOutcome) -> bool) -> u32 {
        self.outcomes.values().filter(|e| pred(&e.outcome)).count() as u32
    }

    pub fn failures(&self) -> u32 {
        self.count(ResourceOutcome::is_failure)
    }

    pub fn has_failures(&self) -> bool {
        self.failures() > 0
    }

    /// One-line summary, e.g. `2 created, 1 updated, 0 replaced, ...`.
    pub fn summary(&self) -> String {
        format!(
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged, {} failed",
            self.count(|o| *o == ResourceOutcome::Created),
            self.count(|o| *o == ResourceOutcome::Updated),
            self.count(|o| *o == ResourceOutcome::Replaced),
            self.count(|o| *o == ResourceOutcome::Deleted),
            self.count(|o| matches!(o, ResourceOutcome::NoOp | ResourceOutcome::Read)),
            self.failures(),
        )
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        neonform_version: String,
    },
    ResourceStarted {
        stack: String,
        resource: String,
        action: String,
    },
    ResourceConverged {
        stack: String,
        resource: String,
        action: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceFailed {
        stack: String,
        resource: String,
        error: String,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        summary: String,
        resources_failed: u32,
        total_seconds: f64,
    },
    DriftDetected {
        stack: String,
        resource: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Template helpers
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Convert a YAML property value to the JSON value the engine carries.
pub fn yaml_to_json(val: &serde_yaml_ng::Value) -> Result<serde_json::Value, String> {
    serde_json::to_value(val).map_err(|e| format!("unsupported property value: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nf001_config_parse() {
        let yaml = r#"
version: "1.0"
name: demo
params:
  region: aws-us-west-2
resources:
  project:
    type: project
    properties:
      name: demo
      regionId: "{{params.region}}"
  branch:
    type: neon:index:Branch
    properties:
      projectId: "${project.id}"
      name: main
    depends_on: [project]
    options:
      protect: true
policy:
  failure: stop_on_first
  parallelism: 2
"#;
        let config: StackConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources["branch"].resource_type, "neon:index:Branch");
        assert!(config.resources["branch"].options.is_protected());
        assert_eq!(config.policy.failure, FailurePolicy::StopOnFirst);
        assert_eq!(config.policy.parallelism, 2);
        assert!(config.providers.contains_key("default"));
    }

    #[test]
    fn test_nf001_policy_defaults() {
        let p = Policy::default();
        assert_eq!(p.failure, FailurePolicy::ContinueIndependent);
        assert_eq!(p.parallelism, 4);
        assert!(p.tripwire);
        assert!(p.lock_file);
        assert!(!p.refresh);
    }

    #[test]
    fn test_nf001_provider_defaults() {
        let p: ProviderConfig = serde_yaml_ng::from_str("timeout_secs: 3").unwrap();
        assert_eq!(p.api_key_env, "NEON_API_KEY");
        assert!(p.endpoint.starts_with("https://"));
        assert_eq!(p.timeout_secs, 3);
    }

    #[test]
    fn test_nf001_action_display_and_symbol() {
        assert_eq!(ResourceAction::Replace.to_string(), "REPLACE");
        assert_eq!(ResourceAction::NoOp.to_string(), "NO-OP");
        assert_eq!(ResourceAction::Replace.symbol(), "+-");
        assert!(ResourceAction::Delete.is_write());
        assert!(!ResourceAction::Read.is_write());
        assert!(!ResourceAction::NoOp.is_write());
    }

    #[test]
    fn test_nf001_state_lock_roundtrip() {
        let lock = StateLock {
            schema: "1.0".to_string(),
            stack: "demo".to_string(),
            generated_at: "2026-02-16T14:00:00Z".to_string(),
            generator: "neonform 0.1.0".to_string(),
            resources: IndexMap::from([(
                "project".to_string(),
                ResourceRecord {
                    type_token: "neon:index:Project".to_string(),
                    id: "p-1".to_string(),
                    status: ResourceStatus::Converged,
                    provider: "default".to_string(),
                    external: false,
                    protect: false,
                    generation: 0,
                    inputs: Fields::from([("name".to_string(), serde_json::json!("demo"))]),
                    outputs: Fields::new(),
                    secret_fields: BTreeSet::new(),
                    dependencies: vec![],
                    hash: "blake3:abc".to_string(),
                    applied_at: None,
                    duration_seconds: Some(0.5),
                },
            )]),
        };
        let yaml = serde_yaml_ng::to_string(&lock).unwrap();
        let lock2: StateLock = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(lock2.resources["project"], lock.resources["project"]);
    }

    #[test]
    fn test_nf001_provenance_event_serde() {
        let event = ProvenanceEvent::ApplyStarted {
            stack: "demo".to_string(),
            run_id: "r-abc".to_string(),
            neonform_version: "0.1.0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"apply_started\""));
        assert!(json.contains("\"run_id\":\"r-abc\""));
    }

    #[test]
    fn test_nf001_report_summary() {
        let mut outcomes = IndexMap::new();
        for (name, outcome) in [
            ("a", ResourceOutcome::Created),
            ("b", ResourceOutcome::NoOp),
            (
                "c",
                ResourceOutcome::Failed {
                    error: "HTTP 400".into(),
                },
            ),
        ] {
            outcomes.insert(
                name.to_string(),
                OutcomeEntry {
                    type_token: "neon:index:Project".into(),
                    outcome,
                    duration_seconds: 0.0,
                },
            );
        }
        let report = ApplyReport {
            stack: "demo".into(),
            run_id: "r-1".into(),
            outcomes,
            total_duration: std::time::Duration::ZERO,
        };
        assert!(report.has_failures());
        assert_eq!(
            report.summary(),
            "1 created, 0 updated, 0 replaced, 0 deleted, 1 unchanged, 1 failed"
        );
    }

    #[test]
    fn test_nf001_yaml_to_json() {
        let v: serde_yaml_ng::Value = serde_yaml_ng::from_str("{a: 1, b: [x]}").unwrap();
        assert_eq!(yaml_to_json(&v).unwrap(), serde_json::json!({"a": 1, "b": ["x"]}));
        assert_eq!(
            yaml_value_to_string(&serde_yaml_ng::Value::Bool(true)),
            "true"
        );
    }
}
