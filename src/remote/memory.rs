//! NF-061: In-memory control plane for tests, previews and offline runs.
//!
//! Keeps objects in a map, honors idempotency keys, records every call, and
//! can inject faults per verb and type so the engine's retry and failure
//! paths are exercisable without a network.

use super::{CrudApi, RemoteError, RemoteObject};
use crate::core::descriptor;
use crate::core::types::Fields;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// CRUD verb, for call logs and fault rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Read,
    Update,
    Delete,
}

impl Verb {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub verb: Verb,
    pub type_token: String,
    /// Object id; `None` for creates.
    pub id: Option<String>,
    pub inputs: Fields,
}

struct Fault {
    verb: Verb,
    type_token: String,
    error: RemoteError,
    remaining: usize,
    /// Apply the call, then report the error (a lost response).
    after_commit: bool,
}

#[derive(Default)]
struct Store {
    objects: IndexMap<(String, String), Fields>,
    idempotency: HashMap<String, String>,
    next_id: u64,
    calls: Vec<Call>,
    faults: Vec<Fault>,
}

/// Fake control plane.
#[derive(Default)]
pub struct InMemoryApi {
    store: Mutex<Store>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every call open for `latency`, so overlap is observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `verb` on `type_token` with `error`.
    pub fn fail_next(&self, verb: Verb, type_token: &str, error: RemoteError, times: usize) {
        self.store().faults.push(Fault {
            verb,
            type_token: type_token.to_string(),
            error,
            remaining: times,
            after_commit: false,
        });
    }

    /// Perform the next `verb` on `type_token`, then report `error` anyway.
    pub fn fail_after_commit(&self, verb: Verb, type_token: &str, error: RemoteError) {
        self.store().faults.push(Fault {
            verb,
            type_token: type_token.to_string(),
            error,
            remaining: 1,
            after_commit: true,
        });
    }

    /// Every call so far, in arrival order.
    pub fn calls(&self) -> Vec<Call> {
        self.store().calls.clone()
    }

    pub fn calls_of(&self, verb: Verb) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb == verb).collect()
    }

    /// Number of create/update/delete calls so far.
    pub fn write_calls(&self) -> usize {
        self.store().calls.iter().filter(|c| c.verb.is_write()).count()
    }

    pub fn clear_calls(&self) {
        self.store().calls.clear();
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Stored objects of one type, as `(id, fields)`.
    pub fn objects(&self, type_token: &str) -> Vec<(String, Fields)> {
        self.store()
            .objects
            .iter()
            .filter(|((t, _), _)| t == type_token)
            .map(|((_, id), fields)| (id.clone(), fields.clone()))
            .collect()
    }

    pub fn object(&self, type_token: &str, id: &str) -> Option<Fields> {
        self.store()
            .objects
            .get(&(type_token.to_string(), id.to_string()))
            .cloned()
    }

    /// Simulate an out-of-band deletion.
    pub fn remove_object(&self, type_token: &str, id: &str) -> bool {
        self.store()
            .objects
            .shift_remove(&(type_token.to_string(), id.to_string()))
            .is_some()
    }

    /// Simulate an out-of-band edit.
    pub fn set_field(&self, type_token: &str, id: &str, field: &str, value: Value) -> bool {
        match self
            .store()
            .objects
            .get_mut(&(type_token.to_string(), id.to_string()))
        {
            Some(fields) => {
                fields.insert(field.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Seed an existing object, e.g. for lookups.
    pub fn insert_object(&self, type_token: &str, id: &str, fields: Fields) {
        self.store()
            .objects
            .insert((type_token.to_string(), id.to_string()), fields);
    }

    async fn enter(&self, verb: Verb, type_token: &str, id: Option<&str>, inputs: &Fields) -> Option<(RemoteError, bool)> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut store = self.store();
        store.calls.push(Call {
            verb,
            type_token: type_token.to_string(),
            id: id.map(str::to_string),
            inputs: inputs.clone(),
        });
        let fault = store
            .faults
            .iter_mut()
            .find(|f| f.verb == verb && f.type_token == type_token && f.remaining > 0)?;
        fault.remaining -= 1;
        Some((fault.error.clone(), fault.after_commit))
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn apply_create(&self, type_token: &str, key: &str, inputs: &Fields) -> RemoteObject {
        let mut store = self.store();
        if let Some(id) = store.idempotency.get(key).cloned() {
            if let Some(fields) = store.objects.get(&(type_token.to_string(), id.clone())) {
                return RemoteObject {
                    id,
                    fields: fields.clone(),
                };
            }
        }
        store.next_id += 1;
        let prefix = descriptor::lookup(type_token).map_or("obj", |d| d.short_name);
        let id = format!("{}-{:04}", prefix, store.next_id);
        let mut fields = inputs.clone();
        synthesize_outputs(type_token, &id, &mut fields);
        store.idempotency.insert(key.to_string(), id.clone());
        store
            .objects
            .insert((type_token.to_string(), id.clone()), fields.clone());
        RemoteObject { id, fields }
    }

    fn apply_update(&self, type_token: &str, id: &str, news: &Fields) -> Result<RemoteObject, RemoteError> {
        let mut store = self.store();
        let fields = store
            .objects
            .get_mut(&(type_token.to_string(), id.to_string()))
            .ok_or(RemoteError::NotFound)?;
        for (k, v) in news {
            fields.insert(k.clone(), v.clone());
        }
        Ok(RemoteObject {
            id: id.to_string(),
            fields: fields.clone(),
        })
    }
}

/// Fill in server-assigned outputs for a new object.
fn synthesize_outputs(type_token: &str, id: &str, fields: &mut Fields) {
    fields.insert(
        "createdAt".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    );
    match type_token {
        "neon:index:Endpoint" => {
            fields.insert("host".to_string(), Value::String(format!("{}.neon.local", id)));
        }
        "neon:index:Role" => {
            let digest = blake3::hash(id.as_bytes()).to_hex();
            fields.insert("password".to_string(), Value::String(digest.as_str()[..24].to_string()));
        }
        _ => {}
    }
}

#[async_trait]
impl CrudApi for InMemoryApi {
    async fn create(
        &self,
        type_token: &str,
        idempotency_key: &str,
        inputs: &Fields,
    ) -> Result<RemoteObject, RemoteError> {
        let fault = self.enter(Verb::Create, type_token, None, inputs).await;
        let result = match fault {
            Some((error, true)) => {
                self.apply_create(type_token, idempotency_key, inputs);
                Err(error)
            }
            Some((error, false)) => Err(error),
            None => Ok(self.apply_create(type_token, idempotency_key, inputs)),
        };
        self.leave();
        result
    }

    async fn read(&self, type_token: &str, id: &str, inputs: &Fields) -> Result<RemoteObject, RemoteError> {
        let fault = self.enter(Verb::Read, type_token, Some(id), inputs).await;
        self.leave();
        if let Some((error, _)) = fault {
            return Err(error);
        }
        self.object(type_token, id)
            .map(|fields| RemoteObject {
                id: id.to_string(),
                fields,
            })
            .ok_or(RemoteError::NotFound)
    }

    async fn update(
        &self,
        type_token: &str,
        id: &str,
        _olds: &Fields,
        news: &Fields,
    ) -> Result<RemoteObject, RemoteError> {
        let fault = self.enter(Verb::Update, type_token, Some(id), news).await;
        let result = match fault {
            Some((error, true)) => self.apply_update(type_token, id, news).and(Err(error)),
            Some((error, false)) => Err(error),
            None => self.apply_update(type_token, id, news),
        };
        self.leave();
        result
    }

    async fn delete(&self, type_token: &str, id: &str, inputs: &Fields) -> Result<(), RemoteError> {
        let fault = self.enter(Verb::Delete, type_token, Some(id), inputs).await;
        self.leave();
        match fault {
            Some((error, true)) => {
                self.remove_object(type_token, id);
                Err(error)
            }
            Some((error, false)) => Err(error),
            None if self.remove_object(type_token, id) => Ok(()),
            None => Err(RemoteError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BRANCH: &str = "neon:index:Branch";

    fn inputs(name: &str) -> Fields {
        Fields::from([
            ("projectId".to_string(), json!("project-0001")),
            ("name".to_string(), json!(name)),
        ])
    }

    #[tokio::test]
    async fn test_nf061_create_read_update_delete() {
        let api = InMemoryApi::new();
        let created = api.create(BRANCH, "k1", &inputs("main")).await.unwrap();
        assert_eq!(created.id, "branch-0001");
        assert_eq!(created.fields["name"], json!("main"));
        assert!(created.fields.contains_key("createdAt"));

        let read = api.read(BRANCH, &created.id, &Fields::new()).await.unwrap();
        assert_eq!(read, created);

        let updated = api
            .update(BRANCH, &created.id, &inputs("main"), &inputs("dev"))
            .await
            .unwrap();
        assert_eq!(updated.fields["name"], json!("dev"));

        api.delete(BRANCH, &created.id, &Fields::new()).await.unwrap();
        assert_eq!(
            api.read(BRANCH, &created.id, &Fields::new()).await,
            Err(RemoteError::NotFound)
        );
        assert_eq!(
            api.delete(BRANCH, &created.id, &Fields::new()).await,
            Err(RemoteError::NotFound)
        );
        assert_eq!(api.write_calls(), 4);
    }

    #[tokio::test]
    async fn test_nf061_idempotency_key_dedupes_create() {
        let api = InMemoryApi::new();
        let a = api.create(BRANCH, "same", &inputs("main")).await.unwrap();
        let b = api.create(BRANCH, "same", &inputs("main")).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(api.objects(BRANCH).len(), 1);
    }

    #[tokio::test]
    async fn test_nf061_fault_injection_counts_down() {
        let api = InMemoryApi::new();
        api.fail_next(Verb::Create, BRANCH, RemoteError::Transient("HTTP 503".into()), 2);
        assert!(api.create(BRANCH, "k", &inputs("a")).await.is_err());
        assert!(api.create(BRANCH, "k", &inputs("a")).await.is_err());
        assert!(api.create(BRANCH, "k", &inputs("a")).await.is_ok());
        assert_eq!(api.calls_of(Verb::Create).len(), 3);
    }

    #[tokio::test]
    async fn test_nf061_lost_response_still_commits() {
        let api = InMemoryApi::new();
        api.fail_after_commit(Verb::Create, BRANCH, RemoteError::Transient("timeout".into()));
        assert!(api.create(BRANCH, "k", &inputs("a")).await.is_err());
        assert_eq!(api.objects(BRANCH).len(), 1);
        let retried = api.create(BRANCH, "k", &inputs("a")).await.unwrap();
        assert_eq!(retried.id, api.objects(BRANCH)[0].0);
    }

    #[tokio::test]
    async fn test_nf061_role_gets_password_and_endpoint_host() {
        let api = InMemoryApi::new();
        let role = api.create("neon:index:Role", "r", &inputs("app")).await.unwrap();
        assert_eq!(role.fields["password"].as_str().unwrap().len(), 24);
        let ep = api.create("neon:index:Endpoint", "e", &inputs("x")).await.unwrap();
        assert!(ep.fields["host"].as_str().unwrap().starts_with("endpoint-"));
    }

    #[tokio::test]
    async fn test_nf061_out_of_band_edits() {
        let api = InMemoryApi::new();
        let b = api.create(BRANCH, "k", &inputs("main")).await.unwrap();
        assert!(api.set_field(BRANCH, &b.id, "name", json!("renamed")));
        assert_eq!(api.object(BRANCH, &b.id).unwrap()["name"], json!("renamed"));
        assert!(api.remove_object(BRANCH, &b.id));
        assert!(!api.set_field(BRANCH, &b.id, "name", json!("x")));
    }
}
