//! NF-090: CLI subcommands (init, validate, plan, apply, destroy, drift, status).

use crate::core::executor::Engine;
use crate::core::secrets::SecretKey;
use crate::core::{parser, state, types};
use crate::remote::ProviderSet;
use crate::tripwire::{drift, eventlog};
use anyhow::{anyhow, bail, Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new neonform project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate neonform.yaml without calling the API
    Validate {
        /// Path to neonform.yaml
        #[arg(short, long, default_value = "neonform.yaml")]
        file: PathBuf,
    },

    /// Show execution plan (diff desired vs recorded state)
    Plan {
        /// Path to neonform.yaml
        #[arg(short, long, default_value = "neonform.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Converge Neon resources to the desired state
    Apply {
        /// Path to neonform.yaml
        #[arg(short, long, default_value = "neonform.yaml")]
        file: PathBuf,

        /// Maximum concurrent remote operations (overrides policy.parallelism)
        #[arg(long)]
        parallel: Option<usize>,

        /// Read unchanged resources to refresh their outputs
        #[arg(long)]
        refresh: bool,

        /// Show what would be executed without running
        #[arg(long)]
        dry_run: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Delete every resource recorded for the stack
    Destroy {
        /// Path to neonform.yaml
        #[arg(short, long, default_value = "neonform.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Detect changes made outside neonform (tripwire)
    Drift {
        /// Path to neonform.yaml
        #[arg(short, long, default_value = "neonform.yaml")]
        file: PathBuf,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Exit non-zero on any drift (for CI/cron)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show recorded state
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this stack
        #[arg(short, long)]
        stack: Option<String>,
    },
}

/// Flags that shape one apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub parallel: Option<usize>,
    pub refresh: bool,
    pub dry_run: bool,
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan { file, state_dir } => cmd_plan(&file, &state_dir).await,
        Commands::Apply {
            file,
            parallel,
            refresh,
            dry_run,
            state_dir,
        } => {
            let options = ApplyOptions {
                parallel,
                refresh,
                dry_run,
            };
            cmd_apply(&file, &state_dir, &options).await
        }
        Commands::Destroy { file, state_dir } => cmd_destroy(&file, &state_dir).await,
        Commands::Drift {
            file,
            state_dir,
            tripwire,
        } => cmd_drift(&file, &state_dir, tripwire).await,
        Commands::Status { state_dir, stack } => cmd_status(&state_dir, stack.as_deref()),
    }
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("neonform.yaml");
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).context("cannot create state dir")?;

    let template = r#"version: "1.0"
name: my-neon
description: "Managed by neonform"

params:
  region: aws-us-east-2

providers:
  default:
    api_key_env: NEON_API_KEY

resources:
  project:
    type: project
    properties:
      name: my-neon
      regionId: "{{params.region}}"
  main:
    type: branch
    properties:
      projectId: "${project.id}"
      name: main

policy:
  failure: continue_independent
  parallelism: 4
  tripwire: true
  lock_file: true
"#;
    std::fs::write(&config_path, template)
        .with_context(|| format!("cannot write {}", config_path.display()))?;

    println!("Initialized neonform project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let config = parser::parse_config_file(file).map_err(|e| anyhow!(e))?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} ({} providers, {} resources)",
            config.name,
            config.providers.len(),
            config.resources.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        bail!("{} validation error(s)", errors.len())
    }
}

/// Parse and validate a config file, printing every validation error.
fn parse_and_validate(file: &Path) -> Result<types::StackConfig> {
    let config = parser::parse_config_file(file).map_err(|e| anyhow!(e))?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    bail!("validation failed")
}

fn providers_for(config: &types::StackConfig) -> Result<ProviderSet> {
    parser::build_providers(config).map_err(|e| anyhow!(e))
}

/// Recorded state for a stack, unsealed, plus the key to reseal it.
fn load_prior(state_dir: &Path, stack: &str) -> Result<(Option<types::StateLock>, SecretKey)> {
    let key = SecretKey::load_or_create(state_dir, stack).map_err(|e| anyhow!(e))?;
    let prior = state::load_state(state_dir, stack, &key).map_err(|e| anyhow!(e))?;
    Ok((prior, key))
}

/// Recorded state for read-only commands. Never creates a key file.
fn read_prior(state_dir: &Path, stack: &str) -> Result<(Option<types::StateLock>, Option<SecretKey>)> {
    let key = SecretKey::load(state_dir, stack).map_err(|e| anyhow!(e))?;
    let prior = match &key {
        Some(key) => state::load_state(state_dir, stack, key).map_err(|e| anyhow!(e))?,
        None => {
            let lock = state::load_lock(state_dir, stack).map_err(|e| anyhow!(e))?;
            if lock.as_ref().is_some_and(state::has_sealed) {
                bail!(
                    "state for {} holds sealed secrets but no key was found (set {} or restore {})",
                    stack,
                    crate::core::secrets::PASSPHRASE_ENV,
                    crate::core::secrets::key_file_path(state_dir, stack).display()
                );
            }
            lock
        }
    };
    Ok((prior, key))
}

fn engine_for(config: &types::StackConfig, state_dir: &Path, providers: ProviderSet) -> Engine {
    Engine::new(providers)
        .with_policy(config.policy.clone())
        .with_event_log(state_dir)
}

async fn cmd_plan(file: &Path, state_dir: &Path) -> Result<()> {
    let config = parse_and_validate(file)?;
    let providers = providers_for(&config)?;
    let plan = plan_with(&config, state_dir, providers).await?;
    print_plan(&plan);
    Ok(())
}

async fn plan_with(
    config: &types::StackConfig,
    state_dir: &Path,
    providers: ProviderSet,
) -> Result<types::ExecutionPlan> {
    let stack = parser::build_stack(config)?;
    let (prior, _) = read_prior(state_dir, &config.name)?;
    let plan = engine_for(config, state_dir, providers)
        .preview(stack, prior.as_ref())
        .await?;
    Ok(plan)
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan) {
    println!("Planning: {} ({} resources)", plan.name, plan.changes.len());
    println!();
    for change in &plan.changes {
        println!("  {:>2} {}", change.action.symbol(), change.description);
    }
    println!();
    println!(
        "Plan: {} to add, {} to change, {} to replace, {} to destroy, {} to read, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_replace, plan.to_delete, plan.to_read, plan.unchanged
    );
}

async fn cmd_apply(file: &Path, state_dir: &Path, options: &ApplyOptions) -> Result<()> {
    let config = parse_and_validate(file)?;
    let providers = providers_for(&config)?;
    let Some(report) = apply_with(&config, state_dir, providers, options).await? else {
        println!("Dry run: no changes applied.");
        return Ok(());
    };

    print_report(&report);
    println!();
    if report.has_failures() {
        println!("Apply completed with errors: {}", report.summary());
        bail!("{} resource(s) failed", report.failures());
    }
    println!("Apply complete: {}.", report.summary());
    Ok(())
}

/// Deploy and persist state. `None` for a dry run (the plan is printed instead).
async fn apply_with(
    config: &types::StackConfig,
    state_dir: &Path,
    providers: ProviderSet,
    options: &ApplyOptions,
) -> Result<Option<types::ApplyReport>> {
    let mut policy = config.policy.clone();
    if let Some(parallel) = options.parallel {
        if parallel == 0 {
            bail!("--parallel must be at least 1");
        }
        policy.parallelism = parallel;
    }
    policy.refresh |= options.refresh;

    let stack = parser::build_stack(config)?;
    let (prior, key) = load_prior(state_dir, &config.name)?;
    let engine = Engine::new(providers)
        .with_policy(policy.clone())
        .with_event_log(state_dir);

    if options.dry_run {
        let plan = engine.preview(stack, prior.as_ref()).await?;
        print_plan(&plan);
        return Ok(None);
    }

    let deployment = engine.deploy(stack, prior.as_ref()).await?;
    if policy.lock_file {
        state::save_state(state_dir, &deployment.state, &key)
            .map_err(|e| anyhow!(e))
            .context("cannot persist state")?;
    } else {
        warn!("policy.lock_file is off; state not saved");
    }
    Ok(Some(deployment.report))
}

fn print_report(report: &types::ApplyReport) {
    for (name, entry) in &report.outcomes {
        println!(
            "  {}: {} [{}] ({:.1}s)",
            name, entry.outcome, entry.type_token, entry.duration_seconds
        );
    }
    println!(
        "{}: run {} finished in {:.1}s",
        report.stack,
        report.run_id,
        report.total_duration.as_secs_f64()
    );
}

async fn cmd_destroy(file: &Path, state_dir: &Path) -> Result<()> {
    let config = parse_and_validate(file)?;
    let providers = providers_for(&config)?;
    let Some(report) = destroy_with(&config, state_dir, providers).await? else {
        println!("Nothing to destroy: no state for {}.", config.name);
        return Ok(());
    };

    print_report(&report);
    if report.has_failures() {
        bail!("{} resource(s) could not be destroyed", report.failures());
    }
    println!("Destroy complete: {}.", report.summary());
    Ok(())
}

async fn destroy_with(
    config: &types::StackConfig,
    state_dir: &Path,
    providers: ProviderSet,
) -> Result<Option<types::ApplyReport>> {
    let (prior, key) = load_prior(state_dir, &config.name)?;
    let Some(prior) = prior else {
        return Ok(None);
    };
    let deployment = engine_for(config, state_dir, providers)
        .destroy(&prior, &config.defaults.retry_policy())
        .await?;
    if config.policy.lock_file {
        state::save_state(state_dir, &deployment.state, &key)
            .map_err(|e| anyhow!(e))
            .context("cannot persist state")?;
    } else {
        warn!("policy.lock_file is off; state not saved");
    }
    Ok(Some(deployment.report))
}

async fn cmd_drift(file: &Path, state_dir: &Path, tripwire_mode: bool) -> Result<()> {
    let config = parse_and_validate(file)?;
    let providers = providers_for(&config)?;
    let total_drift = drift_with(&config, state_dir, providers).await?;

    if total_drift > 0 {
        println!();
        println!("Drift detected: {} resource(s)", total_drift);
        if tripwire_mode {
            bail!("{} drift finding(s)", total_drift);
        }
    } else {
        println!("No drift detected.");
    }
    Ok(())
}

/// Print findings, log them as provenance events, and mark the drifted
/// records in state. Returns the count.
async fn drift_with(config: &types::StackConfig, state_dir: &Path, providers: ProviderSet) -> Result<usize> {
    let (prior, key) = read_prior(state_dir, &config.name)?;
    let Some(mut lock) = prior else {
        println!("No state for {}. Run `neonform apply` first.", config.name);
        return Ok(0);
    };

    println!("Checking {} ({} resources)...", lock.stack, lock.resources.len());
    let findings = drift::detect_drift(&lock, &providers).await;
    for f in &findings {
        println!("  DRIFTED: {} ({})", f.resource_id, f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
        if config.policy.tripwire {
            let event = types::ProvenanceEvent::DriftDetected {
                stack: lock.stack.clone(),
                resource: f.resource_id.clone(),
                expected_hash: f.expected_hash.clone(),
                actual_hash: f.actual_hash.clone(),
            };
            if let Err(e) = eventlog::append_event(state_dir, &lock.stack, event) {
                warn!("cannot append provenance event: {}", e);
            }
        }
    }
    info!(stack = %lock.stack, findings = findings.len(), "drift check complete");

    if drift::mark_drifted(&mut lock, &findings) > 0 && config.policy.lock_file {
        let key = match key {
            Some(key) => key,
            None => SecretKey::load_or_create(state_dir, &lock.stack).map_err(|e| anyhow!(e))?,
        };
        state::save_state(state_dir, &lock, &key)
            .map_err(|e| anyhow!(e))
            .context("cannot persist drift status")?;
    }
    Ok(findings.len())
}

fn cmd_status(state_dir: &Path, stack_filter: Option<&str>) -> Result<()> {
    let entries = std::fs::read_dir(state_dir)
        .with_context(|| format!("cannot read state dir {}", state_dir.display()))?;

    let mut found = false;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if stack_filter.is_some_and(|filter| filter != name) {
            continue;
        }
        if !entry.path().is_dir() {
            continue;
        }

        // Raw lock: secret values stay sealed, which is all status needs.
        if let Some(lock) = state::load_lock(state_dir, &name).map_err(|e| anyhow!(e))? {
            found = true;
            println!("Stack: {}", lock.stack);
            println!("  Generated: {}", lock.generated_at);
            println!("  Generator: {}", lock.generator);
            println!("  Resources: {}", lock.resources.len());

            for (id, record) in &lock.resources {
                let duration = record
                    .duration_seconds
                    .map(|d| format!(" ({:.2}s)", d))
                    .unwrap_or_default();
                let external = if record.external { " external" } else { "" };
                println!(
                    "    {}: {} [{}] {}{}{}",
                    id, record.status, record.type_token, record.id, external, duration
                );
            }
            println!();
        }
    }

    if !found {
        println!("No state found. Run `neonform apply` first.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{InMemoryApi, Verb};
    use std::sync::Arc;

    const CONFIG: &str = r#"
version: "1.0"
name: test
params:
  region: aws-us-east-2
resources:
  project:
    type: project
    properties:
      name: test
      regionId: "{{params.region}}"
  main:
    type: branch
    properties:
      projectId: "${project.id}"
      name: main
  pw:
    type: random
    properties:
      length: 16
  owner:
    type: role
    properties:
      projectId: "${project.id}"
      branchId: "${main.id}"
      name: app_owner
"#;

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("neonform.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    fn memory() -> (Arc<InMemoryApi>, ProviderSet) {
        let api = Arc::new(InMemoryApi::new());
        let providers = ProviderSet::single(api.clone());
        (api, providers)
    }

    #[test]
    fn test_nf090_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("test-project");
        std::fs::create_dir_all(&sub).unwrap();
        cmd_init(&sub).unwrap();
        assert!(sub.join("state").is_dir());
        cmd_validate(&sub.join("neonform.yaml")).unwrap();
    }

    #[test]
    fn test_nf090_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("neonform.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_nf090_validate() {
        let dir = tempfile::tempdir().unwrap();
        cmd_validate(&write_config(dir.path(), CONFIG)).unwrap();

        let bad = write_config(dir.path(), "version: \"2.0\"\nname: \"\"\n");
        let err = cmd_validate(&bad).unwrap_err();
        assert!(err.to_string().contains("2 validation error(s)"));
    }

    #[tokio::test]
    async fn test_nf090_plan_is_offline() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path(), CONFIG);
        let state_dir = dir.path().join("state");
        cmd_plan(&config, &state_dir).await.unwrap();
        assert!(!crate::core::secrets::key_file_path(&state_dir, "test").exists());
    }

    #[tokio::test]
    async fn test_nf090_read_only_commands_need_existing_key() {
        if std::env::var(crate::core::secrets::PASSPHRASE_ENV).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = parser::parse_config(CONFIG).unwrap();
        let (_, providers) = memory();
        apply_with(&config, &state_dir, providers.clone(), &ApplyOptions::default())
            .await
            .unwrap();

        let key_file = crate::core::secrets::key_file_path(&state_dir, "test");
        std::fs::remove_file(&key_file).unwrap();
        let err = plan_with(&config, &state_dir, providers.clone()).await.unwrap_err();
        assert!(err.to_string().contains("no key"));
        assert!(drift_with(&config, &state_dir, providers).await.is_err());
        assert!(!key_file.exists());
    }

    #[tokio::test]
    async fn test_nf090_apply_then_plan_shows_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = parser::parse_config(CONFIG).unwrap();
        let (api, providers) = memory();

        let report = apply_with(&config, &state_dir, providers.clone(), &ApplyOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!report.has_failures(), "{:?}", report);
        assert_eq!(report.count(|o| *o == types::ResourceOutcome::Created), 4);
        assert!(state::lock_file_path(&state_dir, "test").exists());

        // Role password and random result are sealed on disk.
        let raw = std::fs::read_to_string(state::lock_file_path(&state_dir, "test")).unwrap();
        assert!(raw.contains(crate::core::secrets::SEALED_PREFIX));

        api.clear_calls();
        let plan = plan_with(&config, &state_dir, providers.clone()).await.unwrap();
        assert_eq!(plan.unchanged, 4);
        assert!(api.calls().is_empty());

        let again = apply_with(&config, &state_dir, providers, &ApplyOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.count(|o| *o == types::ResourceOutcome::NoOp), 4);
        assert_eq!(api.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_nf090_apply_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = parser::parse_config(CONFIG).unwrap();
        let (api, providers) = memory();
        let options = ApplyOptions {
            dry_run: true,
            ..ApplyOptions::default()
        };
        assert!(apply_with(&config, &state_dir, providers, &options)
            .await
            .unwrap()
            .is_none());
        assert!(api.calls().is_empty());
        assert!(!state::lock_file_path(&state_dir, "test").exists());
    }

    #[tokio::test]
    async fn test_nf090_apply_rejects_zero_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let config = parser::parse_config(CONFIG).unwrap();
        let (_, providers) = memory();
        let options = ApplyOptions {
            parallel: Some(0),
            ..ApplyOptions::default()
        };
        assert!(apply_with(&config, dir.path(), providers, &options).await.is_err());
    }

    #[tokio::test]
    async fn test_nf090_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = parser::parse_config(CONFIG).unwrap();
        let (api, providers) = memory();
        assert!(destroy_with(&config, &state_dir, providers.clone())
            .await
            .unwrap()
            .is_none());

        apply_with(&config, &state_dir, providers.clone(), &ApplyOptions::default())
            .await
            .unwrap();
        let report = destroy_with(&config, &state_dir, providers).await.unwrap().unwrap();
        assert_eq!(report.count(|o| *o == types::ResourceOutcome::Deleted), 4);
        assert_eq!(api.calls_of(Verb::Delete).len(), 3);
        let (prior, _) = load_prior(&state_dir, "test").unwrap();
        assert!(prior.unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_nf090_destroy_respects_lock_file_policy() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let mut config = parser::parse_config(CONFIG).unwrap();
        let (_, providers) = memory();
        apply_with(&config, &state_dir, providers.clone(), &ApplyOptions::default())
            .await
            .unwrap();

        config.policy.lock_file = false;
        destroy_with(&config, &state_dir, providers).await.unwrap().unwrap();
        let (prior, _) = load_prior(&state_dir, "test").unwrap();
        assert_eq!(prior.unwrap().resources.len(), 4);
    }

    #[tokio::test]
    async fn test_nf090_drift() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let config = parser::parse_config(CONFIG).unwrap();
        let (api, providers) = memory();
        assert_eq!(drift_with(&config, &state_dir, providers.clone()).await.unwrap(), 0);

        apply_with(&config, &state_dir, providers.clone(), &ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(drift_with(&config, &state_dir, providers.clone()).await.unwrap(), 0);

        let (prior, _) = load_prior(&state_dir, "test").unwrap();
        let main_id = prior.unwrap().resources["main"].id.clone();
        api.set_field("neon:index:Branch", &main_id, "name", serde_json::json!("hotfix"));
        assert_eq!(drift_with(&config, &state_dir, providers.clone()).await.unwrap(), 1);

        let (prior, _) = load_prior(&state_dir, "test").unwrap();
        assert_eq!(prior.unwrap().resources["main"].status, types::ResourceStatus::Drifted);

        // The next apply reads the drifted branch and writes it back.
        api.clear_calls();
        let report = apply_with(&config, &state_dir, providers, &ApplyOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome("main"), Some(&types::ResourceOutcome::Updated));
        assert_eq!(api.calls_of(Verb::Update).len(), 1);
        let object = api.object("neon:index:Branch", &main_id).unwrap();
        assert_eq!(object["name"], serde_json::json!("main"));

        let events = eventlog::read_events(&state_dir, "test").unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e.event, types::ProvenanceEvent::DriftDetected { ref resource, .. } if resource == "main")));
    }

    #[tokio::test]
    async fn test_nf090_status() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        cmd_status(&state_dir, None).unwrap();

        let config = parser::parse_config(CONFIG).unwrap();
        let (_, providers) = memory();
        apply_with(&config, &state_dir, providers, &ApplyOptions::default())
            .await
            .unwrap();
        std::fs::write(state_dir.join("stray.txt"), "x").unwrap();
        cmd_status(&state_dir, None).unwrap();
        cmd_status(&state_dir, Some("test")).unwrap();
        assert!(cmd_status(&dir.path().join("missing"), None).is_err());
    }

    #[tokio::test]
    async fn test_nf090_dispatch_validate_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(dir.path(), CONFIG);
        dispatch(Commands::Validate { file }).await.unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        dispatch(Commands::Status {
            state_dir: dir.path().join("state"),
            stack: None,
        })
        .await
        .unwrap();
    }
}
