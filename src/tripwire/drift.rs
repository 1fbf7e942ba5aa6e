//! NF-017: Drift detection. Compares live remote objects to lock hashes.

use crate::core::descriptor::{self, ResourceDescriptor};
use crate::core::types::{Fields, ResourceRecord, ResourceStatus, StateLock};
use crate::remote::retry::{with_retry, RetryPolicy};
use crate::remote::{CrudApi, ProviderSet, RemoteError};
use crate::tripwire::hasher;
use futures::future::join_all;
use tracing::{debug, warn};

/// A single drift finding.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub resource_id: String,
    pub type_token: String,
    pub expected_hash: String,
    pub actual_hash: String,
    /// Input fields whose live value differs from the recorded one
    pub fields: Vec<String>,
    pub detail: String,
}

/// Recorded inputs overlaid with whatever the remote reports for them.
fn live_inputs(descriptor: &ResourceDescriptor, recorded: &Fields, remote: &Fields) -> Fields {
    let mut live = recorded.clone();
    for field in descriptor.inputs {
        if let Some(value) = remote.get(field.name).filter(|v| !v.is_null()) {
            live.insert(field.name.to_string(), value.clone());
        }
    }
    live
}

/// Check one recorded resource against its live object.
pub async fn check_resource_drift(
    resource_id: &str,
    record: &ResourceRecord,
    descriptor: &ResourceDescriptor,
    api: &dyn CrudApi,
) -> Option<DriftFinding> {
    let finding = |actual_hash: String, fields: Vec<String>, detail: String| DriftFinding {
        resource_id: resource_id.to_string(),
        type_token: record.type_token.clone(),
        expected_hash: record.hash.clone(),
        actual_hash,
        fields,
        detail,
    };

    debug!(resource = resource_id, id = %record.id, "drift check");
    let read = with_retry(&RetryPolicy::default(), "read", || {
        api.read(&record.type_token, &record.id, &record.inputs)
    })
    .await;
    let object = match read {
        Ok(object) => object,
        Err(RemoteError::NotFound) => {
            return Some(finding(
                "MISSING".to_string(),
                Vec::new(),
                format!("{} no longer exists", record.id),
            ))
        }
        Err(e) => {
            warn!(resource = resource_id, "drift check failed: {}", e);
            return Some(finding(format!("ERROR:{}", e), Vec::new(), e.to_string()));
        }
    };

    let live = live_inputs(descriptor, &record.inputs, &object.fields);
    let actual = hasher::hash_inputs(descriptor, &live, &record.secret_fields);
    // Secret inputs hash as a placeholder, so compare values directly too.
    let fields: Vec<String> = descriptor
        .inputs
        .iter()
        .filter(|f| record.inputs.get(f.name) != live.get(f.name))
        .map(|f| f.name.to_string())
        .collect();
    if actual == record.hash && fields.is_empty() {
        return None;
    }
    let detail = if fields.is_empty() {
        "recorded hash does not match recorded inputs".to_string()
    } else {
        format!("changed outside neonform: {}", fields.join(", "))
    };
    Some(finding(actual, fields, detail))
}

/// Read every converged or drifted remote resource in a lock and report drift.
///
/// Local resources have nothing to read. Resources bound to a provider
/// that is not in `providers` are skipped with a warning.
pub async fn detect_drift(lock: &StateLock, providers: &ProviderSet) -> Vec<DriftFinding> {
    let mut checks = Vec::new();
    for (id, record) in &lock.resources {
        if !matches!(record.status, ResourceStatus::Converged | ResourceStatus::Drifted) {
            continue;
        }
        let Some(descriptor) = descriptor::lookup(&record.type_token) else {
            warn!(resource = %id, type_token = %record.type_token, "unknown type, skipping drift check");
            continue;
        };
        if descriptor.local {
            continue;
        }
        let Some(api) = providers.api_for(descriptor, &record.provider) else {
            warn!(resource = %id, provider = %record.provider, "unknown provider, skipping drift check");
            continue;
        };
        checks.push(async move { check_resource_drift(id, record, descriptor, api.as_ref()).await });
    }

    join_all(checks).await.into_iter().flatten().collect()
}

/// Mark the records behind real findings as drifted, so the next deploy
/// reads and re-applies them. Failed checks (`ERROR:`) change nothing.
/// Returns how many records were marked.
pub fn mark_drifted(lock: &mut StateLock, findings: &[DriftFinding]) -> usize {
    let mut marked = 0;
    for finding in findings.iter().filter(|f| !f.actual_hash.starts_with("ERROR:")) {
        if let Some(record) = lock.resources.get_mut(&finding.resource_id) {
            record.status = ResourceStatus::Drifted;
            marked += 1;
        }
    }
    marked
}
