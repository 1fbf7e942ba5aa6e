//! NF-005: Reconciliation engine. Drives registered resources to their desired state.
//!
//! The scheduler owns the registration graph. A resource becomes ready once
//! every producer it depends on has completed; it is then handed to a worker
//! task as an owned [`Job`]. Workers talk to the remote API and report back
//! over one channel. Only the scheduler resolves handles, builds the next
//! state, and writes the event log.
//!
//! deploy: pre-flight (cycles, providers) → schedule → orphans → report + state

use super::descriptor::{self, ResourceDescriptor};
use super::error::{EngineError, EngineResult};
use super::options::ResourceOptions;
use super::output::{resolve_fields, OutputError};
use super::planner;
use super::resolver;
use super::secrets;
use super::stack::{HandleResolvers, Inputs, Registration, RegistrationKind, Stack};
use super::state;
use super::types::*;
use crate::remote::retry::{with_retry, RetryPolicy};
use crate::remote::{CrudApi, ProviderSet, RemoteError, RemoteObject};
use crate::tripwire::{eventlog, hasher};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Deploy,
    /// Same scheduling, no remote calls.
    Preview,
}

/// What a deploy or destroy produced.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub report: ApplyReport,
    /// The state to persist for the next run.
    pub state: StateLock,
}

/// Reconciles stacks against a set of provider bindings.
pub struct Engine {
    providers: ProviderSet,
    policy: Policy,
    event_dir: Option<PathBuf>,
}

impl Engine {
    pub fn new(providers: ProviderSet) -> Self {
        Self {
            providers,
            policy: Policy::default(),
            event_dir: None,
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Append provenance events under `state_dir` (when `policy.tripwire` is set).
    pub fn with_event_log(mut self, state_dir: &Path) -> Self {
        self.event_dir = Some(state_dir.to_path_buf());
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Reconcile every registration, then delete what the stack no longer declares.
    ///
    /// Pre-flight errors (cycles, unknown dependencies or providers) are
    /// returned before any remote call. Per-resource failures land in the
    /// report instead.
    pub async fn deploy(&self, stack: Stack, prior: Option<&StateLock>) -> EngineResult<Deployment> {
        let start = Instant::now();
        let retry = stack.defaults().retry_policy();
        let prepared = self.prepare(stack)?;
        let stack_name = prepared.stack.clone();
        let run_id = eventlog::generate_run_id();
        info!(stack = %stack_name, run_id = %run_id, resources = prepared.entries.len(), "deploy started");
        self.log_event(
            &stack_name,
            ProvenanceEvent::ApplyStarted {
                stack: stack_name.clone(),
                run_id: run_id.clone(),
                neonform_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );

        let mut run = Run::new(&stack_name, &prepared.order);
        self.schedule(prepared, prior, Mode::Deploy, &mut run).await;
        let orphans = orphans(prior, &run);
        if run.cancelled {
            for (name, record) in orphans {
                run.skip(
                    &name,
                    &record.type_token,
                    &EngineError::Cancelled { resource: name.clone() },
                );
                run.records.insert(name, record);
            }
        } else {
            self.delete_records(orphans, &retry, Mode::Deploy, &mut run).await;
        }

        Ok(self.finish(run, run_id, start))
    }

    /// Compute what `deploy` would do without calling the remote API.
    ///
    /// Outputs of resources that would be created or replaced resolve to
    /// [`UNKNOWN`], so consumers of a replaced identity preview as replaced too.
    pub async fn preview(&self, stack: Stack, prior: Option<&StateLock>) -> EngineResult<ExecutionPlan> {
        let retry = stack.defaults().retry_policy();
        let prepared = self.prepare(stack)?;
        let stack_name = prepared.stack.clone();
        let order = prepared.order.clone();
        let waves = prepared.waves.clone();

        let mut run = Run::new(&stack_name, &order);
        self.schedule(prepared, prior, Mode::Preview, &mut run).await;
        let orphans = orphans(prior, &run);
        self.delete_records(orphans, &retry, Mode::Preview, &mut run).await;

        if let Some(err) = run.errors.into_iter().next() {
            return Err(err);
        }
        let mut changes = run.changes;
        changes.sort_by_key(|c| run.rank.get(&c.resource_id).copied().unwrap_or(usize::MAX));
        Ok(planner::build_plan(&stack_name, changes, order, waves))
    }

    /// Delete every managed resource in `prior`, dependents first.
    pub async fn destroy(&self, prior: &StateLock, retry: &RetryPolicy) -> EngineResult<Deployment> {
        let start = Instant::now();
        let run_id = eventlog::generate_run_id();
        info!(stack = %prior.stack, run_id = %run_id, "destroy started");
        self.log_event(
            &prior.stack,
            ProvenanceEvent::ApplyStarted {
                stack: prior.stack.clone(),
                run_id: run_id.clone(),
                neonform_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );
        let mut run = Run::new(&prior.stack, &[]);
        let records: Vec<(String, ResourceRecord)> = prior
            .resources
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.delete_records(records, retry, Mode::Deploy, &mut run).await;
        Ok(self.finish(run, run_id, start))
    }

    /// One-shot read of an existing object; no state, no lifecycle.
    pub async fn invoke(
        &self,
        type_token: &str,
        provider: &str,
        id: &str,
        inputs: &Fields,
    ) -> EngineResult<RemoteObject> {
        let descriptor = descriptor::lookup(type_token)
            .ok_or_else(|| EngineError::UnknownResourceType(type_token.to_string()))?;
        let api = self.api_for(id, descriptor, provider)?;
        debug!(type_token = descriptor.type_token, id, "invoke read");
        with_retry(&RetryPolicy::default(), "read", || {
            api.read(descriptor.type_token, id, inputs)
        })
        .await
        .map_err(|source| EngineError::Remote {
            resource: id.to_string(),
            type_token: descriptor.type_token.to_string(),
            source,
        })
    }

    fn api_for(
        &self,
        resource: &str,
        descriptor: &ResourceDescriptor,
        provider: &str,
    ) -> EngineResult<Arc<dyn CrudApi>> {
        self.providers
            .api_for(descriptor, provider)
            .ok_or_else(|| EngineError::UnknownProvider {
                resource: resource.to_string(),
                provider: provider.to_string(),
            })
    }

    /// The API that owns an already-recorded object.
    fn record_api(&self, resource: &str, record: &ResourceRecord) -> EngineResult<Arc<dyn CrudApi>> {
        let descriptor = descriptor::lookup(&record.type_token)
            .ok_or_else(|| EngineError::UnknownResourceType(record.type_token.clone()))?;
        self.api_for(resource, descriptor, &record.provider)
    }

    /// Everything that can be rejected before the first remote call.
    fn prepare(&self, stack: Stack) -> EngineResult<Prepared> {
        let graph = stack.dependency_graph();
        let order = resolver::topo_order(&graph)?;
        let waves = resolver::execution_waves(&graph)?;
        let name = stack.name().to_string();
        let mut entries = Vec::with_capacity(stack.len());
        for registration in stack.into_registrations() {
            let api = self.api_for(
                &registration.name,
                registration.descriptor,
                registration.options.provider_name(),
            )?;
            entries.push((registration, api));
        }
        Ok(Prepared {
            stack: name,
            order,
            waves,
            entries,
        })
    }

    /// Run the registration graph to completion.
    async fn schedule(&self, prepared: Prepared, prior: Option<&StateLock>, mode: Mode, run: &mut Run) {
        let prior_record = |name: &str| prior.and_then(|p| p.resources.get(name));
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();

        let mut waiting: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut jobs: HashMap<String, Job> = HashMap::new();
        let mut resolvers: HashMap<String, HandleResolvers> = HashMap::new();
        let mut ready: BTreeSet<(usize, String)> = BTreeSet::new();

        for (registration, api) in prepared.entries {
            let Registration {
                name,
                descriptor,
                kind,
                inputs,
                options,
                dependencies,
                secret_outputs,
                resolvers: handle,
            } = registration;
            for dep in &dependencies {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
            if dependencies.is_empty() {
                ready.insert((run.rank_of(&name), name.clone()));
            }
            waiting.insert(name.clone(), dependencies.len());
            resolvers.insert(name.clone(), handle);
            let last = prior_record(&name).cloned();
            let prior_api = last
                .as_ref()
                .filter(|r| !r.external)
                .map(|r| self.record_api(&name, r));
            jobs.insert(
                name.clone(),
                Job {
                    stack: prepared.stack.clone(),
                    prior: last,
                    prior_api,
                    name,
                    descriptor,
                    kind,
                    inputs,
                    options,
                    dependencies: dependencies.into_iter().collect(),
                    secret_outputs,
                    api,
                    mode,
                    refresh: self.policy.refresh,
                    events: tx.clone(),
                },
            );
        }

        let limit = self.policy.parallelism.max(1);
        let mut in_flight = 0usize;
        loop {
            while in_flight < limit && !run.cancelled {
                let Some((_, name)) = ready.pop_first() else {
                    break;
                };
                let Some(job) = jobs.remove(&name) else {
                    continue;
                };
                let span = info_span!("reconcile", resource = %job.name, type_token = job.descriptor.type_token);
                tokio::spawn(job.run().instrument(span));
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Some(event) = rx.recv().await else {
                break;
            };
            let (name, type_token, result, duration) = match event {
                WorkerEvent::Started { name, action } => {
                    if mode == Mode::Deploy {
                        debug!(resource = %name, action = %action, "started");
                        self.log_event(
                            &run.stack,
                            ProvenanceEvent::ResourceStarted {
                                stack: run.stack.clone(),
                                resource: name,
                                action: action.to_string(),
                            },
                        );
                    }
                    continue;
                }
                WorkerEvent::Finished {
                    name,
                    type_token,
                    result,
                    duration,
                } => (name, type_token, result, duration),
            };
            in_flight -= 1;

            match result {
                Ok(applied) => {
                    if let Some(handle) = resolvers.remove(&name) {
                        handle.resolve(&applied.record.id, &applied.record.outputs);
                    }
                    self.converged(run, &name, type_token, applied, duration, mode);
                    for dependent in dependents.get(&name).into_iter().flatten() {
                        if let Some(count) = waiting.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                ready.insert((run.rank_of(dependent), dependent.clone()));
                            }
                        }
                    }
                }
                Err(err) => {
                    if let Some(handle) = resolvers.remove(&name) {
                        handle.fail(OutputError::Failed {
                            resource: name.clone(),
                            reason: err.to_string(),
                        });
                    }
                    let stop = self.policy.failure == FailurePolicy::StopOnFirst
                        && !matches!(err, EngineError::Cancelled { .. });
                    self.failed(run, &name, type_token, err, duration, prior_record(&name), mode);
                    if stop && !run.cancelled {
                        warn!(resource = %name, "stop_on_first: cancelling resources that have not started");
                        run.cancelled = true;
                    }

                    // Transitive dependents can never start.
                    let mut frontier = vec![name];
                    while let Some(failed) = frontier.pop() {
                        for dependent in dependents.get(&failed).into_iter().flatten() {
                            let Some(job) = jobs.remove(dependent) else {
                                continue;
                            };
                            let err = EngineError::DependencyFailed {
                                resource: dependent.clone(),
                                dependency: failed.clone(),
                            };
                            if let Some(handle) = resolvers.remove(dependent) {
                                handle.fail(OutputError::Failed {
                                    resource: dependent.clone(),
                                    reason: err.to_string(),
                                });
                            }
                            warn!(resource = %dependent, dependency = %failed, "skipped");
                            run.skip(dependent, job.descriptor.type_token, &err);
                            if let Some(record) = prior_record(dependent) {
                                run.records.insert(dependent.clone(), record.clone());
                            }
                            frontier.push(dependent.clone());
                        }
                    }
                }
            }
        }

        // Whatever is left never started.
        let mut leftover: Vec<Job> = jobs.into_values().collect();
        leftover.sort_by_key(|job| run.rank_of(&job.name));
        for job in leftover {
            let err = EngineError::Cancelled {
                resource: job.name.clone(),
            };
            if let Some(handle) = resolvers.remove(&job.name) {
                handle.fail(OutputError::Failed {
                    resource: job.name.clone(),
                    reason: err.to_string(),
                });
            }
            run.skip(&job.name, job.descriptor.type_token, &err);
            if let Some(record) = job.prior {
                run.records.insert(job.name, record);
            }
        }
    }

    fn converged(
        &self,
        run: &mut Run,
        name: &str,
        type_token: &'static str,
        applied: Applied,
        duration: f64,
        mode: Mode,
    ) {
        let Applied {
            action,
            changed,
            mut record,
            outcome,
        } = applied;
        run.changes.push(PlannedChange {
            resource_id: name.to_string(),
            type_token: type_token.to_string(),
            action,
            description: planner::describe_action(name, type_token, action, &changed),
            changed_fields: changed,
        });
        if mode == Mode::Deploy {
            if outcome != ResourceOutcome::NoOp {
                record.duration_seconds = Some(duration);
                info!(resource = %name, type_token, action = %action, "{} in {:.2}s", outcome, duration);
                self.log_event(
                    &run.stack,
                    ProvenanceEvent::ResourceConverged {
                        stack: run.stack.clone(),
                        resource: name.to_string(),
                        action: action.to_string(),
                        duration_seconds: duration,
                        hash: record.hash.clone(),
                    },
                );
            } else {
                debug!(resource = %name, type_token, "unchanged");
            }
        }
        run.outcomes.insert(
            name.to_string(),
            OutcomeEntry {
                type_token: type_token.to_string(),
                outcome,
                duration_seconds: duration,
            },
        );
        run.records.insert(name.to_string(), record);
    }

    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        run: &mut Run,
        name: &str,
        type_token: &str,
        err: EngineError,
        duration: f64,
        prior: Option<&ResourceRecord>,
        mode: Mode,
    ) {
        if mode == Mode::Deploy {
            error!(resource = %name, type_token, "{}", err);
            self.log_event(
                &run.stack,
                ProvenanceEvent::ResourceFailed {
                    stack: run.stack.clone(),
                    resource: name.to_string(),
                    error: err.to_string(),
                },
            );
        }
        run.outcomes.insert(
            name.to_string(),
            OutcomeEntry {
                type_token: type_token.to_string(),
                outcome: ResourceOutcome::Failed {
                    error: err.to_string(),
                },
                duration_seconds: duration,
            },
        );
        // Keep the identity so the next run can retry against it.
        if let Some(record) = prior {
            let mut record = record.clone();
            record.status = ResourceStatus::Failed;
            run.records.insert(name.to_string(), record);
        }
        run.errors.push(err);
    }

    /// Delete records in reverse dependency order. A record whose dependent
    /// could not be deleted is left alone.
    async fn delete_records(
        &self,
        records: Vec<(String, ResourceRecord)>,
        retry: &RetryPolicy,
        mode: Mode,
        run: &mut Run,
    ) {
        if records.is_empty() {
            return;
        }
        let graph: IndexMap<String, Vec<String>> = records
            .iter()
            .map(|(name, record)| (name.clone(), record.dependencies.clone()))
            .collect();
        let graph = resolver::prune_unknown(&graph);
        let mut order = resolver::topo_order(&graph).unwrap_or_else(|_| graph.keys().cloned().collect());
        order.reverse();

        let mut by_name: HashMap<String, ResourceRecord> = records.into_iter().collect();
        let mut blocked: HashMap<String, String> = HashMap::new();
        for name in order {
            let Some(record) = by_name.remove(&name) else {
                continue;
            };
            if let Some(dependent) = blocked.get(&name).cloned() {
                let err = EngineError::DependencyFailed {
                    resource: name.clone(),
                    dependency: dependent,
                };
                warn!(resource = %name, "not deleted: {}", err);
                run.skip(&name, &record.type_token, &err);
                for dep in &record.dependencies {
                    blocked.entry(dep.clone()).or_insert_with(|| name.clone());
                }
                run.records.insert(name, record);
                continue;
            }

            if record.external {
                // Looked-up objects belong to someone else.
                if mode == Mode::Deploy {
                    info!(resource = %name, id = %record.id, "forgetting external resource");
                }
                run.outcomes.insert(
                    name,
                    OutcomeEntry {
                        type_token: record.type_token.clone(),
                        outcome: ResourceOutcome::NoOp,
                        duration_seconds: 0.0,
                    },
                );
                continue;
            }

            let start = Instant::now();
            let result = self.delete_one(&run.stack, &name, &record, retry, mode).await;
            let duration = start.elapsed().as_secs_f64();
            match result {
                Ok(()) => {
                    run.changes.push(PlannedChange {
                        resource_id: name.clone(),
                        type_token: record.type_token.clone(),
                        action: ResourceAction::Delete,
                        changed_fields: Vec::new(),
                        description: planner::describe_action(
                            &name,
                            &record.type_token,
                            ResourceAction::Delete,
                            &[],
                        ),
                    });
                    if mode == Mode::Deploy {
                        info!(resource = %name, type_token = %record.type_token, action = "DELETE", "deleted");
                        self.log_event(
                            &run.stack,
                            ProvenanceEvent::ResourceConverged {
                                stack: run.stack.clone(),
                                resource: name.clone(),
                                action: ResourceAction::Delete.to_string(),
                                duration_seconds: duration,
                                hash: record.hash.clone(),
                            },
                        );
                    }
                    run.outcomes.insert(
                        name,
                        OutcomeEntry {
                            type_token: record.type_token,
                            outcome: ResourceOutcome::Deleted,
                            duration_seconds: duration,
                        },
                    );
                }
                Err(err) => {
                    for dep in &record.dependencies {
                        blocked.entry(dep.clone()).or_insert_with(|| name.clone());
                    }
                    let type_token = record.type_token.clone();
                    run.records.insert(name.clone(), record);
                    self.failed(run, &name, &type_token, err, duration, None, mode);
                }
            }
        }
    }

    async fn delete_one(
        &self,
        stack: &str,
        name: &str,
        record: &ResourceRecord,
        retry: &RetryPolicy,
        mode: Mode,
    ) -> EngineResult<()> {
        if record.protect {
            return Err(EngineError::ProtectedDelete {
                resource: name.to_string(),
                type_token: record.type_token.clone(),
            });
        }
        let api = self.record_api(name, record)?;
        if mode == Mode::Preview {
            return Ok(());
        }
        self.log_event(
            stack,
            ProvenanceEvent::ResourceStarted {
                stack: stack.to_string(),
                resource: name.to_string(),
                action: ResourceAction::Delete.to_string(),
            },
        );
        delete_remote(api.as_ref(), &record.type_token, &record.id, &record.inputs, retry)
            .await
            .map_err(|source| EngineError::Remote {
                resource: name.to_string(),
                type_token: record.type_token.clone(),
                source,
            })
    }

    fn finish(&self, mut run: Run, run_id: String, start: Instant) -> Deployment {
        run.sort();
        let report = ApplyReport {
            stack: run.stack.clone(),
            run_id: run_id.clone(),
            outcomes: run.outcomes,
            total_duration: start.elapsed(),
        };
        let summary = report.summary();
        if report.has_failures() {
            warn!(stack = %report.stack, "{}", summary);
        } else {
            info!(stack = %report.stack, "{}", summary);
        }
        self.log_event(
            &report.stack,
            ProvenanceEvent::ApplyCompleted {
                stack: report.stack.clone(),
                run_id,
                summary,
                resources_failed: report.failures(),
                total_seconds: report.total_duration.as_secs_f64(),
            },
        );

        let mut lock = state::new_lock(&run.stack);
        lock.resources = run.records;
        Deployment {
            report,
            state: lock,
        }
    }

    fn log_event(&self, stack: &str, event: ProvenanceEvent) {
        if !self.policy.tripwire {
            return;
        }
        if let Some(dir) = &self.event_dir {
            if let Err(e) = eventlog::append_event(dir, stack, event) {
                warn!("cannot append provenance event: {}", e);
            }
        }
    }
}

/// Records in `prior` that this run did not register.
fn orphans(prior: Option<&StateLock>, run: &Run) -> Vec<(String, ResourceRecord)> {
    prior
        .map(|p| {
            p.resources
                .iter()
                .filter(|(name, _)| !run.rank.contains_key(name.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Delete, treating an already-absent object as success.
async fn delete_remote(
    api: &dyn CrudApi,
    type_token: &str,
    id: &str,
    inputs: &Fields,
    retry: &RetryPolicy,
) -> Result<(), RemoteError> {
    debug!(type_token, id, "delete");
    match with_retry(retry, "delete", || api.delete(type_token, id, inputs)).await {
        Ok(()) => Ok(()),
        Err(RemoteError::NotFound) => {
            debug!(type_token, id, "already absent");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Registrations that passed pre-flight, with their bound APIs.
struct Prepared {
    stack: String,
    order: Vec<String>,
    waves: Vec<Vec<String>>,
    entries: Vec<(Registration, Arc<dyn CrudApi>)>,
}

/// Scheduler-side accumulation for one run.
struct Run {
    stack: String,
    rank: HashMap<String, usize>,
    outcomes: IndexMap<String, OutcomeEntry>,
    records: IndexMap<String, ResourceRecord>,
    changes: Vec<PlannedChange>,
    errors: Vec<EngineError>,
    cancelled: bool,
}

impl Run {
    fn new(stack: &str, order: &[String]) -> Self {
        Self {
            stack: stack.to_string(),
            rank: order.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect(),
            outcomes: IndexMap::new(),
            records: IndexMap::new(),
            changes: Vec::new(),
            errors: Vec::new(),
            cancelled: false,
        }
    }

    fn rank_of(&self, name: &str) -> usize {
        self.rank.get(name).copied().unwrap_or(usize::MAX)
    }

    fn skip(&mut self, name: &str, type_token: &str, err: &EngineError) {
        self.outcomes.insert(
            name.to_string(),
            OutcomeEntry {
                type_token: type_token.to_string(),
                outcome: ResourceOutcome::Skipped {
                    reason: err.to_string(),
                },
                duration_seconds: 0.0,
            },
        );
    }

    /// Registered resources in execution order, then everything else as it came.
    fn sort(&mut self) {
        let rank = std::mem::take(&mut self.rank);
        let key = |name: &String| rank.get(name).copied().unwrap_or(usize::MAX);
        self.outcomes.sort_by(|a, _, b, _| key(a).cmp(&key(b)));
        self.records.sort_by(|a, _, b, _| key(a).cmp(&key(b)));
        self.rank = rank;
    }
}

/// Messages from workers to the scheduler.
enum WorkerEvent {
    Started {
        name: String,
        action: ResourceAction,
    },
    Finished {
        name: String,
        type_token: &'static str,
        result: EngineResult<Applied>,
        duration: f64,
    },
}

/// What a worker decided and did.
struct Applied {
    action: ResourceAction,
    changed: Vec<String>,
    record: ResourceRecord,
    outcome: ResourceOutcome,
}

/// One ready resource, owned by its worker.
struct Job {
    stack: String,
    name: String,
    descriptor: &'static ResourceDescriptor,
    kind: RegistrationKind,
    inputs: Inputs,
    options: ResourceOptions,
    dependencies: Vec<String>,
    secret_outputs: BTreeSet<String>,
    prior: Option<ResourceRecord>,
    /// Where the prior object lives; differs from `api` after a type or
    /// provider change.
    prior_api: Option<EngineResult<Arc<dyn CrudApi>>>,
    api: Arc<dyn CrudApi>,
    mode: Mode,
    refresh: bool,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Job {
    async fn run(self) {
        let start = Instant::now();
        let result = self.reconcile().await;
        // The scheduler holds the receiver until every worker has reported.
        let _ = self.events.send(WorkerEvent::Finished {
            name: self.name.clone(),
            type_token: self.descriptor.type_token,
            result,
            duration: start.elapsed().as_secs_f64(),
        });
    }

    async fn reconcile(&self) -> EngineResult<Applied> {
        let (desired, secret_inputs) = resolve_fields(&self.inputs).await?;
        let mut secret_fields = self.secret_outputs.clone();
        secret_fields.extend(secret_inputs);
        if let Some(prior) = &self.prior {
            secret_fields.extend(prior.secret_fields.iter().cloned());
        }
        debug!(inputs = %secrets::render_masked(&desired, &secret_fields), "inputs resolved");

        match &self.kind {
            RegistrationKind::Lookup { id } => {
                let id = id.get().await?;
                self.lookup(&id, desired, secret_fields).await
            }
            RegistrationKind::Managed => self.managed(desired, secret_fields).await,
        }
    }

    async fn lookup(&self, id: &str, desired: Fields, secret_fields: BTreeSet<String>) -> EngineResult<Applied> {
        let outputs = if self.mode == Mode::Preview {
            match self.prior.as_ref().filter(|r| r.external && r.id == id) {
                Some(prior) => prior.outputs.clone(),
                None => unknown_outputs(self.descriptor, &desired),
            }
        } else {
            self.started(ResourceAction::Read);
            let object = self.read(id, &desired).await.map_err(|e| self.remote(e))?;
            collect_outputs(self.descriptor, &object, &desired, None)
        };
        Ok(Applied {
            action: ResourceAction::Read,
            changed: Vec::new(),
            record: self.record(id, desired, outputs, secret_fields, true, 0),
            outcome: ResourceOutcome::Read,
        })
    }

    async fn managed(&self, desired: Fields, secret_fields: BTreeSet<String>) -> EngineResult<Applied> {
        let (action, changed) =
            planner::determine_action(self.descriptor, self.prior.as_ref(), &desired, &self.options, false);
        if action == ResourceAction::Replace && self.options.is_protected() {
            return Err(EngineError::ReplacementRequiredButProtected {
                resource: self.name.clone(),
                type_token: self.descriptor.type_token.to_string(),
                fields: changed,
            });
        }
        if self.mode == Mode::Preview {
            return Ok(self.preview(action, changed, desired, secret_fields));
        }

        let prior = self.prior.as_ref().filter(|r| !r.external);
        match (action, prior) {
            (ResourceAction::Create, _) => {
                self.started(action);
                let object = self.create(&desired, 0).await?;
                let outputs = collect_outputs(self.descriptor, &object, &desired, None);
                Ok(Applied {
                    action,
                    changed,
                    record: self.record(&object.id, desired, outputs, secret_fields, false, 0),
                    outcome: ResourceOutcome::Created,
                })
            }
            (ResourceAction::Replace, Some(prior)) => {
                self.started(action);
                info!(id = %prior.id, fields = %changed.join(", "), "replacing");
                let old_api = match &self.prior_api {
                    Some(Ok(api)) => api.clone(),
                    Some(Err(e)) => return Err(e.clone()),
                    None => self.api.clone(),
                };
                delete_remote(
                    old_api.as_ref(),
                    &prior.type_token,
                    &prior.id,
                    &prior.inputs,
                    &self.options.retry_policy(),
                )
                .await
                .map_err(|e| self.remote(e))?;
                let generation = prior.generation + 1;
                let object = self.create(&desired, generation).await?;
                let outputs = collect_outputs(self.descriptor, &object, &desired, None);
                Ok(Applied {
                    action,
                    changed,
                    record: self.record(&object.id, desired, outputs, secret_fields, false, generation),
                    outcome: ResourceOutcome::Replaced,
                })
            }
            (ResourceAction::Update, Some(prior)) => self.update(prior, changed, desired, secret_fields).await,
            (ResourceAction::NoOp, Some(prior)) => self.unchanged(prior, desired, secret_fields).await,
            (other, _) => Err(EngineError::Validation(format!(
                "resource '{}': cannot {} without a managed prior record",
                self.name, other
            ))),
        }
    }

    /// Read first; converge without a write if the object already matches.
    async fn update(
        &self,
        prior: &ResourceRecord,
        changed: Vec<String>,
        desired: Fields,
        secret_fields: BTreeSet<String>,
    ) -> EngineResult<Applied> {
        self.started(ResourceAction::Update);
        let current = match self.read(&prior.id, &prior.inputs).await {
            Ok(object) => object,
            Err(RemoteError::NotFound) => return self.recreate(prior, desired, secret_fields).await,
            Err(e) => return Err(self.remote(e)),
        };

        let diverged = diverged_fields(self.descriptor, &current.fields, &desired);
        if changed.is_empty() && diverged.is_empty() {
            let outputs = collect_outputs(self.descriptor, &current, &desired, Some(prior));
            return Ok(Applied {
                action: ResourceAction::Update,
                changed,
                record: self.record(&prior.id, desired, outputs, secret_fields, false, prior.generation),
                outcome: ResourceOutcome::NoOp,
            });
        }

        debug!(id = %prior.id, fields = %changed.join(", "), "update");
        let object = with_retry(&self.options.retry_policy(), "update", || {
            self.api
                .update(self.descriptor.type_token, &prior.id, &prior.inputs, &desired)
        })
        .await
        .map_err(|e| match e {
            RemoteError::NotFound => RemoteError::Fatal {
                status: Some(404),
                message: format!("{} disappeared during update", prior.id),
            },
            other => other,
        })
        .map_err(|e| self.remote(e))?;
        let outputs = collect_outputs(self.descriptor, &object, &desired, Some(prior));
        Ok(Applied {
            action: ResourceAction::Update,
            changed,
            record: self.record(&prior.id, desired, outputs, secret_fields, false, prior.generation),
            outcome: ResourceOutcome::Updated,
        })
    }

    /// No diff: reuse recorded outputs, or read them fresh under `refresh`.
    async fn unchanged(
        &self,
        prior: &ResourceRecord,
        desired: Fields,
        secret_fields: BTreeSet<String>,
    ) -> EngineResult<Applied> {
        let outputs = if self.refresh {
            self.started(ResourceAction::Read);
            match self.read(&prior.id, &prior.inputs).await {
                Ok(object) => collect_outputs(self.descriptor, &object, &desired, Some(prior)),
                Err(RemoteError::NotFound) => return self.recreate(prior, desired, secret_fields).await,
                Err(e) => return Err(self.remote(e)),
            }
        } else {
            prior.outputs.clone()
        };
        let mut record = self.record(&prior.id, desired, outputs, secret_fields, false, prior.generation);
        record.applied_at = prior.applied_at.clone();
        record.duration_seconds = prior.duration_seconds;
        Ok(Applied {
            action: ResourceAction::NoOp,
            changed: Vec::new(),
            record,
            outcome: ResourceOutcome::NoOp,
        })
    }

    /// The object was deleted out of band; create it again under a new generation.
    async fn recreate(
        &self,
        prior: &ResourceRecord,
        desired: Fields,
        secret_fields: BTreeSet<String>,
    ) -> EngineResult<Applied> {
        warn!(id = %prior.id, "object no longer exists remotely, recreating");
        let generation = prior.generation + 1;
        let object = self.create(&desired, generation).await?;
        let outputs = collect_outputs(self.descriptor, &object, &desired, None);
        Ok(Applied {
            action: ResourceAction::Create,
            changed: Vec::new(),
            record: self.record(&object.id, desired, outputs, secret_fields, false, generation),
            outcome: ResourceOutcome::Created,
        })
    }

    fn preview(
        &self,
        action: ResourceAction,
        changed: Vec<String>,
        desired: Fields,
        secret_fields: BTreeSet<String>,
    ) -> Applied {
        let prior = self.prior.as_ref().filter(|r| !r.external);
        let (id, outputs, generation) = match (action, prior) {
            (ResourceAction::Update | ResourceAction::NoOp, Some(prior)) => {
                let mut outputs = prior.outputs.clone();
                for (k, v) in &desired {
                    outputs.insert(k.clone(), v.clone());
                }
                (prior.id.clone(), outputs, prior.generation)
            }
            _ => (UNKNOWN.to_string(), unknown_outputs(self.descriptor, &desired), 0),
        };
        let outcome = match action {
            ResourceAction::Create => ResourceOutcome::Created,
            ResourceAction::Update => ResourceOutcome::Updated,
            ResourceAction::Replace => ResourceOutcome::Replaced,
            _ => ResourceOutcome::NoOp,
        };
        Applied {
            action,
            changed,
            record: self.record(&id, desired, outputs, secret_fields, false, generation),
            outcome,
        }
    }

    fn started(&self, action: ResourceAction) {
        let _ = self.events.send(WorkerEvent::Started {
            name: self.name.clone(),
            action,
        });
    }

    fn remote(&self, source: RemoteError) -> EngineError {
        EngineError::Remote {
            resource: self.name.clone(),
            type_token: self.descriptor.type_token.to_string(),
            source,
        }
    }

    async fn create(&self, desired: &Fields, generation: u32) -> EngineResult<RemoteObject> {
        let key = hasher::idempotency_token(&self.stack, &self.name, self.descriptor.type_token, generation);
        debug!(generation, "create");
        with_retry(&self.options.retry_policy(), "create", || {
            self.api.create(self.descriptor.type_token, &key, desired)
        })
        .await
        .map_err(|e| self.remote(e))
    }

    async fn read(&self, id: &str, inputs: &Fields) -> Result<RemoteObject, RemoteError> {
        debug!(id, "read");
        with_retry(&self.options.retry_policy(), "read", || {
            self.api.read(self.descriptor.type_token, id, inputs)
        })
        .await
    }

    fn record(
        &self,
        id: &str,
        inputs: Fields,
        outputs: Fields,
        secret_fields: BTreeSet<String>,
        external: bool,
        generation: u32,
    ) -> ResourceRecord {
        ResourceRecord {
            type_token: self.descriptor.type_token.to_string(),
            id: id.to_string(),
            status: ResourceStatus::Converged,
            provider: self.options.provider_name().to_string(),
            external,
            protect: self.options.is_protected(),
            generation,
            hash: hasher::hash_inputs(self.descriptor, &inputs, &secret_fields),
            inputs,
            outputs,
            secret_fields,
            dependencies: self.dependencies.clone(),
            applied_at: Some(eventlog::now_iso8601()),
            duration_seconds: None,
        }
    }
}

/// Handle values after a remote call.
///
/// Inputs: remote value, else desired, else last known. Outputs: remote
/// value, else last known (reads of generated values may omit them).
fn collect_outputs(
    descriptor: &ResourceDescriptor,
    object: &RemoteObject,
    desired: &Fields,
    prior: Option<&ResourceRecord>,
) -> Fields {
    let last_known = |name: &str| prior.and_then(|p| p.outputs.get(name)).filter(|v| !v.is_null());
    descriptor
        .handle_fields()
        .map(|name| {
            let remote = object.fields.get(name).filter(|v| !v.is_null());
            let value = if descriptor.input(name).is_some() {
                remote
                    .or_else(|| desired.get(name).filter(|v| !v.is_null()))
                    .or_else(|| last_known(name))
            } else {
                remote.or_else(|| last_known(name))
            };
            (name.to_string(), value.cloned().unwrap_or(Value::Null))
        })
        .collect()
}

/// Handle values for a resource that does not exist yet.
fn unknown_outputs(descriptor: &ResourceDescriptor, desired: &Fields) -> Fields {
    descriptor
        .handle_fields()
        .map(|name| {
            let value = if descriptor.input(name).is_some() {
                desired.get(name).cloned().unwrap_or(Value::Null)
            } else {
                Value::String(UNKNOWN.to_string())
            };
            (name.to_string(), value)
        })
        .collect()
}

/// Declared inputs the remote reports with a value other than the desired one.
fn diverged_fields(descriptor: &ResourceDescriptor, remote: &Fields, desired: &Fields) -> Vec<String> {
    descriptor
        .inputs
        .iter()
        .filter(|f| {
            match (
                remote.get(f.name).filter(|v| !v.is_null()),
                desired.get(f.name).filter(|v| !v.is_null()),
            ) {
                (Some(r), Some(d)) => r != d,
                _ => false,
            }
        })
        .map(|f| f.name.to_string())
        .collect()
}
