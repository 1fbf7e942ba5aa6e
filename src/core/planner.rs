//! NF-004: Diff and plan generation for desired inputs against last-known state.
//!
//! Only descriptor-declared inputs are compared. An absent field and an
//! explicit null are the same value. A change to any immutable field (or a
//! field named in `replace_on_changes`) classifies as replace.

use super::descriptor::ResourceDescriptor;
use super::options::ResourceOptions;
use super::types::*;
use serde_json::Value;

/// Diff classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    NoOp,
    Update,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub kind: DiffKind,
    /// Every input whose value differs, in descriptor order.
    pub changed: Vec<String>,
    /// The subset of `changed` that forces replacement.
    pub replace_fields: Vec<String>,
}

fn present<'a>(fields: &'a Fields, name: &str) -> Option<&'a Value> {
    fields.get(name).filter(|v| !v.is_null())
}

/// Compare last-known and desired inputs field by field.
pub fn diff(
    descriptor: &ResourceDescriptor,
    old: &Fields,
    new: &Fields,
    replace_on_changes: &[String],
) -> Diff {
    let changed: Vec<String> = descriptor
        .inputs
        .iter()
        .filter(|f| present(old, f.name) != present(new, f.name))
        .map(|f| f.name.to_string())
        .collect();
    let replace_fields: Vec<String> = changed
        .iter()
        .filter(|name| descriptor.is_immutable(name) || replace_on_changes.contains(name))
        .cloned()
        .collect();
    let kind = if changed.is_empty() {
        DiffKind::NoOp
    } else if replace_fields.is_empty() {
        DiffKind::Update
    } else {
        DiffKind::Replace
    };
    Diff {
        kind,
        changed,
        replace_fields,
    }
}

/// Decide what a registration needs, given its last-known record.
///
/// Returns the action and the input fields that motivate it.
pub fn determine_action(
    descriptor: &ResourceDescriptor,
    prior: Option<&ResourceRecord>,
    desired: &Fields,
    options: &ResourceOptions,
    lookup: bool,
) -> (ResourceAction, Vec<String>) {
    if lookup {
        return (ResourceAction::Read, Vec::new());
    }
    let Some(record) = prior.filter(|r| !r.external) else {
        return (ResourceAction::Create, Vec::new());
    };
    if record.type_token != descriptor.type_token {
        return (ResourceAction::Replace, vec!["type".to_string()]);
    }
    // Objects do not move between provider accounts.
    if record.provider != options.provider_name() {
        return (ResourceAction::Replace, vec!["provider".to_string()]);
    }
    let d = diff(descriptor, &record.inputs, desired, &options.replace_on_changes);
    match d.kind {
        DiffKind::Replace => (ResourceAction::Replace, d.replace_fields),
        DiffKind::Update => (ResourceAction::Update, d.changed),
        // Previously failed or drifted: re-apply.
        DiffKind::NoOp if record.status != ResourceStatus::Converged => {
            (ResourceAction::Update, Vec::new())
        }
        DiffKind::NoOp => (ResourceAction::NoOp, Vec::new()),
    }
}

/// Generate a human-readable description of a planned action.
pub fn describe_action(
    resource_id: &str,
    type_token: &str,
    action: ResourceAction,
    fields: &[String],
) -> String {
    let detail = if fields.is_empty() {
        String::new()
    } else {
        format!(" ({})", fields.join(", "))
    };
    match action {
        ResourceAction::Create => format!("{}: create {}", resource_id, type_token),
        ResourceAction::Update if fields.is_empty() => {
            format!("{}: update (re-apply after failure)", resource_id)
        }
        ResourceAction::Update => format!("{}: update{}", resource_id, detail),
        ResourceAction::Replace => format!("{}: replace{}", resource_id, detail),
        ResourceAction::Delete => format!("{}: delete {}", resource_id, type_token),
        ResourceAction::Read => format!("{}: read existing {}", resource_id, type_token),
        ResourceAction::NoOp => format!("{}: no changes", resource_id),
    }
}

/// Assemble a plan from individual changes and the computed order.
pub fn build_plan(
    name: &str,
    changes: Vec<PlannedChange>,
    execution_order: Vec<String>,
    waves: Vec<Vec<String>>,
) -> ExecutionPlan {
    let count = |a: ResourceAction| changes.iter().filter(|c| c.action == a).count() as u32;
    ExecutionPlan {
        name: name.to_string(),
        to_create: count(ResourceAction::Create),
        to_update: count(ResourceAction::Update),
        to_replace: count(ResourceAction::Replace),
        to_delete: count(ResourceAction::Delete),
        to_read: count(ResourceAction::Read),
        unchanged: count(ResourceAction::NoOp),
        changes,
        execution_order,
        waves,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn db(branch: &str, name: &str) -> Fields {
        fields(&[
            ("projectId", json!("p-1")),
            ("branchId", json!(branch)),
            ("name", json!(name)),
        ])
    }

    fn record(type_token: &str, inputs: Fields) -> ResourceRecord {
        ResourceRecord {
            type_token: type_token.to_string(),
            id: "x-1".to_string(),
            status: ResourceStatus::Converged,
            provider: "default".to_string(),
            external: false,
            protect: false,
            generation: 0,
            inputs,
            outputs: Fields::new(),
            secret_fields: BTreeSet::new(),
            dependencies: vec![],
            hash: String::new(),
            applied_at: None,
            duration_seconds: None,
        }
    }

    #[test]
    fn test_nf004_identical_is_noop() {
        let d = descriptor::lookup("database").unwrap();
        let r = diff(d, &db("B1", "app"), &db("B1", "app"), &[]);
        assert_eq!(r.kind, DiffKind::NoOp);
        assert!(r.changed.is_empty());
    }

    #[test]
    fn test_nf004_immutable_change_replaces() {
        let d = descriptor::lookup("database").unwrap();
        let r = diff(d, &db("B1", "app"), &db("B2", "app"), &[]);
        assert_eq!(r.kind, DiffKind::Replace);
        assert_eq!(r.replace_fields, vec!["branchId"]);
    }

    #[test]
    fn test_nf004_mutable_change_updates() {
        let d = descriptor::lookup("database").unwrap();
        let r = diff(d, &db("B1", "app"), &db("B1", "app2"), &[]);
        assert_eq!(r.kind, DiffKind::Update);
        assert_eq!(r.changed, vec!["name"]);
    }

    #[test]
    fn test_nf004_mixed_change_replaces() {
        let d = descriptor::lookup("database").unwrap();
        let r = diff(d, &db("B1", "app"), &db("B2", "app2"), &[]);
        assert_eq!(r.kind, DiffKind::Replace);
        assert_eq!(r.changed, vec!["branchId", "name"]);
        assert_eq!(r.replace_fields, vec!["branchId"]);
    }

    #[test]
    fn test_nf004_replace_on_changes_override() {
        let d = descriptor::lookup("database").unwrap();
        let r = diff(d, &db("B1", "app"), &db("B1", "app2"), &["name".to_string()]);
        assert_eq!(r.kind, DiffKind::Replace);
    }

    #[test]
    fn test_nf004_absent_equals_null_and_outputs_ignored() {
        let d = descriptor::lookup("database").unwrap();
        let mut old = db("B1", "app");
        old.insert("createdAt".into(), json!("2026-01-01"));
        let mut new = db("B1", "app");
        new.insert("ownerName".into(), Value::Null);
        assert_eq!(diff(d, &old, &new, &[]).kind, DiffKind::NoOp);
        new.insert("ownerName".into(), json!("alice"));
        assert_eq!(diff(d, &old, &new, &[]).kind, DiffKind::Update);
    }

    #[test]
    fn test_nf004_unknown_sentinel_forces_change() {
        let d = descriptor::lookup("database").unwrap();
        let r = diff(d, &db("B1", "app"), &db(UNKNOWN, "app"), &[]);
        assert_eq!(r.kind, DiffKind::Replace);
    }

    #[test]
    fn test_nf004_determine_action() {
        let d = descriptor::lookup("database").unwrap();
        let opts = ResourceOptions::default();
        assert_eq!(
            determine_action(d, None, &db("B1", "a"), &opts, false).0,
            ResourceAction::Create
        );
        assert_eq!(
            determine_action(d, None, &Fields::new(), &opts, true).0,
            ResourceAction::Read
        );
        let rec = record(d.type_token, db("B1", "a"));
        assert_eq!(
            determine_action(d, Some(&rec), &db("B1", "a"), &opts, false),
            (ResourceAction::NoOp, vec![])
        );
        assert_eq!(
            determine_action(d, Some(&rec), &db("B1", "b"), &opts, false),
            (ResourceAction::Update, vec!["name".to_string()])
        );

        let mut failed = rec.clone();
        failed.status = ResourceStatus::Failed;
        assert_eq!(
            determine_action(d, Some(&failed), &db("B1", "a"), &opts, false).0,
            ResourceAction::Update
        );

        let mut external = rec.clone();
        external.external = true;
        assert_eq!(
            determine_action(d, Some(&external), &db("B1", "a"), &opts, false).0,
            ResourceAction::Create
        );

        let other_type = record("neon:index:Branch", db("B1", "a"));
        assert_eq!(
            determine_action(d, Some(&other_type), &db("B1", "a"), &opts, false).0,
            ResourceAction::Replace
        );

        let eu = ResourceOptions::default().with_provider("eu");
        assert_eq!(
            determine_action(d, Some(&rec), &db("B1", "a"), &eu, false),
            (ResourceAction::Replace, vec!["provider".to_string()])
        );
    }

    #[test]
    fn test_nf004_describe_and_build_plan() {
        assert_eq!(
            describe_action("db", "neon:index:Database", ResourceAction::Replace, &["branchId".into()]),
            "db: replace (branchId)"
        );
        assert_eq!(
            describe_action("p", "neon:index:Project", ResourceAction::Create, &[]),
            "p: create neon:index:Project"
        );
        let change = |id: &str, action| PlannedChange {
            resource_id: id.to_string(),
            type_token: "neon:index:Branch".to_string(),
            action,
            changed_fields: vec![],
            description: String::new(),
        };
        let plan = build_plan(
            "demo",
            vec![
                change("a", ResourceAction::Create),
                change("b", ResourceAction::NoOp),
                change("c", ResourceAction::Replace),
            ],
            vec!["a".into(), "b".into(), "c".into()],
            vec![],
        );
        assert_eq!(plan.to_create, 1);
        assert_eq!(plan.to_replace, 1);
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.change("c").unwrap().action, ResourceAction::Replace);
    }
}
