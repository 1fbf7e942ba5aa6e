//! NF-020: Deferred values: resource inputs and outputs that may not be known yet.
//!
//! An [`Output`] is a read handle onto a single-writer slot that is either
//! pending, resolved, or failed. The writer is a [`Resolver`], held by
//! whichever resource produces the value. Readers suspend on [`Output::get`]
//! until the slot settles; there is no polling.
//!
//! Every output carries two pieces of provenance:
//! - `secret`: sticky taint, OR-ed through [`Output::apply`] and [`all`]
//! - `producers`: the logical names of the resources the value derives from,
//!   which become implicit dependency edges when the output feeds an input

use super::types::Fields;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Why a deferred value will never resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputError {
    #[error("'{resource}' did not complete: {reason}")]
    Failed { resource: String, reason: String },

    #[error("value was abandoned before it resolved")]
    Abandoned,
}

/// State of a deferred value.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<T> {
    Pending,
    Resolved(T),
    Failed(OutputError),
}

/// A value that may become available later.
#[derive(Clone)]
pub struct Output<T> {
    rx: watch::Receiver<Slot<T>>,
    secret: bool,
    producers: Arc<BTreeSet<String>>,
}

/// Inputs and outputs share one representation.
pub type Input<T> = Output<T>;

/// Write side of a pending [`Output`]. Consumed on settle, so a value is written once.
pub struct Resolver<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: T) {
        self.tx.send_replace(Slot::Resolved(value));
    }

    pub fn fail(self, error: OutputError) {
        self.tx.send_replace(Slot::Failed(error));
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resolver")
    }
}

impl<T: Clone + Send + Sync + 'static> Output<T> {
    /// An already-resolved plain value.
    pub fn known(value: T) -> Self {
        Self::settled(Slot::Resolved(value), false, BTreeSet::new())
    }

    /// An already-resolved value carrying the secret taint.
    pub fn secret(value: T) -> Self {
        Self::settled(Slot::Resolved(value), true, BTreeSet::new())
    }

    /// An already-failed value.
    pub fn failed(error: OutputError) -> Self {
        Self::settled(Slot::Failed(error), false, BTreeSet::new())
    }

    /// A pending value with no producing resource (resolved by the caller).
    pub fn pending() -> (Resolver<T>, Self) {
        Self::pending_with(BTreeSet::new(), false)
    }

    /// A pending value produced by the named resource.
    pub(crate) fn produced_by(resource: &str, secret: bool) -> (Resolver<T>, Self) {
        Self::pending_with(BTreeSet::from([resource.to_string()]), secret)
    }

    fn pending_with(producers: BTreeSet<String>, secret: bool) -> (Resolver<T>, Self) {
        let (tx, rx) = watch::channel(Slot::Pending);
        let output = Self {
            rx,
            secret,
            producers: Arc::new(producers),
        };
        (Resolver { tx }, output)
    }

    fn settled(slot: Slot<T>, secret: bool, producers: BTreeSet<String>) -> Self {
        // Dropping the sender is fine: receivers keep the last value.
        let (_tx, rx) = watch::channel(slot);
        Self {
            rx,
            secret,
            producers: Arc::new(producers),
        }
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Mark this value secret. The taint never clears.
    pub fn into_secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Resources this value was derived from.
    pub fn producers(&self) -> &BTreeSet<String> {
        &self.producers
    }

    /// Snapshot of the current state without waiting.
    pub fn peek(&self) -> Slot<T> {
        self.rx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.rx.borrow(), Slot::Pending)
    }

    /// Wait until the value settles.
    pub async fn get(&self) -> Result<T, OutputError> {
        let mut rx = self.rx.clone();
        let slot = rx
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await
            .map_err(|_| OutputError::Abandoned)?;
        match &*slot {
            Slot::Resolved(value) => Ok(value.clone()),
            Slot::Failed(error) => Err(error.clone()),
            Slot::Pending => Err(OutputError::Abandoned),
        }
    }

    /// Transform the value once it resolves.
    ///
    /// Settled values are transformed immediately; pending ones on a Tokio task,
    /// so a runtime must be running when `apply` is called on a pending value.
    pub fn apply<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let producers = BTreeSet::clone(&self.producers);
        match self.peek() {
            Slot::Resolved(value) => Output::settled(Slot::Resolved(f(value)), self.secret, producers),
            Slot::Failed(error) => Output::settled(Slot::Failed(error), self.secret, producers),
            Slot::Pending => {
                let (resolver, output) = Output::pending_with(producers, self.secret);
                let source = self.clone();
                tokio::spawn(async move {
                    match source.get().await {
                        Ok(value) => resolver.resolve(f(value)),
                        Err(error) => resolver.fail(error),
                    }
                });
                output
            }
        }
    }
}

impl<T: serde::Serialize + Clone + Send + Sync + 'static> Output<T> {
    /// Erase the static type for registration.
    pub fn into_value(self) -> Output<serde_json::Value> {
        self.apply(|v| serde_json::to_value(v).unwrap_or(serde_json::Value::Null))
    }
}

impl<T: Clone + Send + Sync + 'static> From<T> for Output<T> {
    fn from(value: T) -> Self {
        Output::known(value)
    }
}

impl From<&str> for Output<String> {
    fn from(value: &str) -> Self {
        Output::known(value.to_string())
    }
}

impl<T: fmt::Debug> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.secret {
            return f.write_str("Output([secret])");
        }
        match &*self.rx.borrow() {
            Slot::Pending => f.write_str("Output(<pending>)"),
            Slot::Resolved(v) => write!(f, "Output({:?})", v),
            Slot::Failed(e) => write!(f, "Output(<failed: {}>)", e),
        }
    }
}

/// Combine several outputs into one that resolves when all of them have.
///
/// The first failure short-circuits the result; there is no partial value.
pub fn all<T: Clone + Send + Sync + 'static>(items: &[Output<T>]) -> Output<Vec<T>> {
    let secret = items.iter().any(Output::is_secret);
    let producers: BTreeSet<String> = items
        .iter()
        .flat_map(|o| o.producers.iter().cloned())
        .collect();

    let mut values = Vec::with_capacity(items.len());
    let mut pending = false;
    for item in items {
        match item.peek() {
            Slot::Resolved(v) => values.push(v),
            Slot::Failed(e) => return Output::settled(Slot::Failed(e), secret, producers),
            Slot::Pending => pending = true,
        }
    }
    if !pending {
        return Output::settled(Slot::Resolved(values), secret, producers);
    }

    let (resolver, output) = Output::pending_with(producers, secret);
    let owned = items.to_vec();
    tokio::spawn(async move {
        match futures::future::try_join_all(owned.iter().map(Output::get)).await {
            Ok(values) => resolver.resolve(values),
            Err(error) => resolver.fail(error),
        }
    });
    output
}

/// Wait for every input of a registration and collect concrete field values.
///
/// Returns the resolved fields and the names of those carrying the secret taint.
pub async fn resolve_fields(
    inputs: &IndexMap<String, Output<serde_json::Value>>,
) -> Result<(Fields, BTreeSet<String>), OutputError> {
    let mut fields = Fields::new();
    let mut secret = BTreeSet::new();
    for (name, input) in inputs {
        let value = input.get().await?;
        if input.is_secret() {
            secret.insert(name.clone());
        }
        fields.insert(name.clone(), value);
    }
    Ok((fields, secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_nf020_known_resolves_immediately() {
        let o = Output::known(42);
        assert_eq!(o.peek(), Slot::Resolved(42));
        assert_eq!(o.get().await, Ok(42));
        assert!(!o.is_secret());
        assert!(o.producers().is_empty());
    }

    #[tokio::test]
    async fn test_nf020_pending_then_resolved() {
        let (resolver, o) = Output::<String>::pending();
        assert!(o.is_pending());
        let waiter = {
            let o = o.clone();
            tokio::spawn(async move { o.get().await })
        };
        resolver.resolve("br-123".to_string());
        assert_eq!(waiter.await.unwrap(), Ok("br-123".to_string()));
        assert!(!o.is_pending());
    }

    #[tokio::test]
    async fn test_nf020_apply_after_resolution() {
        let (resolver, id) = Output::<String>::produced_by("project", false);
        let url = id.apply(|id| format!("/projects/{}", id));
        assert!(url.is_pending());
        assert!(url.producers().contains("project"));
        resolver.resolve("p-1".to_string());
        assert_eq!(url.get().await, Ok("/projects/p-1".to_string()));
    }

    #[tokio::test]
    async fn test_nf020_apply_on_known_is_synchronous() {
        let o = Output::known(2).apply(|v| v * 10);
        assert_eq!(o.peek(), Slot::Resolved(20));
    }

    #[tokio::test]
    async fn test_nf020_failure_propagates_through_apply() {
        let (resolver, o) = Output::<i32>::produced_by("branch", false);
        let derived = o.apply(|v| v + 1).apply(|v| v * 2);
        resolver.fail(OutputError::Failed {
            resource: "branch".into(),
            reason: "boom".into(),
        });
        let err = derived.get().await.unwrap_err();
        assert!(matches!(err, OutputError::Failed { ref resource, .. } if resource == "branch"));
    }

    #[tokio::test]
    async fn test_nf020_secret_is_sticky() {
        let s = Output::secret("hunter2".to_string());
        let derived = s.apply(|p| format!("postgres://u:{}@h/db", p));
        assert!(derived.is_secret());
        let combined = all(&[Output::known("a".to_string()), derived]);
        assert!(combined.is_secret());
        assert!(!Output::known(1).is_secret());
        assert!(Output::known(1).into_secret().is_secret());
    }

    #[tokio::test]
    async fn test_nf020_all_waits_for_every_input() {
        let (r1, a) = Output::<i32>::produced_by("a", false);
        let (r2, b) = Output::<i32>::produced_by("b", false);
        let both = all(&[a, b]);
        assert_eq!(
            both.producers().iter().cloned().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        r2.resolve(2);
        assert!(both.is_pending());
        r1.resolve(1);
        assert_eq!(both.get().await, Ok(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_nf020_all_short_circuits_on_failure() {
        let (_keep_pending, a) = Output::<i32>::produced_by("a", false);
        let (r2, b) = Output::<i32>::produced_by("b", false);
        let both = all(&[a, b]);
        r2.fail(OutputError::Failed {
            resource: "b".into(),
            reason: "rate limited".into(),
        });
        // `a` never resolves, yet the combined value fails.
        assert!(both.get().await.is_err());
    }

    #[tokio::test]
    async fn test_nf020_all_of_settled_values() {
        let failed = Output::<i32>::failed(OutputError::Abandoned);
        assert_eq!(
            all(&[Output::known(1), failed]).peek(),
            Slot::Failed(OutputError::Abandoned)
        );
        assert_eq!(all::<i32>(&[]).peek(), Slot::Resolved(vec![]));
    }

    #[tokio::test]
    async fn test_nf020_dropped_resolver_abandons() {
        let (resolver, o) = Output::<i32>::pending();
        drop(resolver);
        assert_eq!(o.get().await, Err(OutputError::Abandoned));
    }

    #[tokio::test]
    async fn test_nf020_resolve_fields_collects_secrets() {
        let mut inputs = IndexMap::new();
        inputs.insert("name".to_string(), Output::known(json!("main")));
        inputs.insert("password".to_string(), Output::secret(json!("pw")));
        let (fields, secret) = resolve_fields(&inputs).await.unwrap();
        assert_eq!(fields["name"], json!("main"));
        assert_eq!(secret, BTreeSet::from(["password".to_string()]));
    }

    #[test]
    fn test_nf020_debug_masks_secret() {
        let o = Output::secret("pw".to_string());
        assert_eq!(format!("{:?}", o), "Output([secret])");
        assert_eq!(format!("{:?}", Output::known(5)), "Output(5)");
    }

    #[tokio::test]
    async fn test_nf020_into_value() {
        let v = Output::known(24u32).into_value();
        assert_eq!(v.get().await, Ok(json!(24)));
    }
}
