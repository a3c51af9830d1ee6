//! Migration pipeline: identity translation, revision consolidation, answer projection,
//! batch writing and stage orchestration.

mod context;
mod identity;
mod orchestrator;
mod projector;
mod report;
mod resolver;
mod transform;
mod writer;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use qmig_adapters::FixtureRecordSource;
use qmig_core::{EntityType, MIGRATION_ORDER};
use qmig_storage::{
    HttpRecordSource, HttpSourceConfig, MappingStore, MemoryMappingStore, MemoryTargetStore,
    MinIntervalLimiter, PgTargetStore, RecordSource, RetryPolicy, SourceEndpoint, SourcePaginator,
    TargetStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub use context::{DryRunRows, RunContext, RunMode};
pub use identity::IdentityMap;
pub use orchestrator::{
    MigrationOrchestrator, MigrationPlan, RunOutcome, RunSummary, StageError, StageReport,
    StageStatus, MAX_BATCH_SIZE,
};
pub use projector::{
    answer_entity, deduplicate, AnswerProjector, CandidateOutcome, DedupStats, Projection,
    ProjectionStats,
};
pub use report::{
    export_dry_run_snapshots, render_summary_markdown, reports_dir_for, write_run_reports,
    SnapshotManifest, SnapshotManifestFile,
};
pub use resolver::{normalize_name, RevisionGroup, RevisionIndex, RevisionResolver, SheetGroupKey};
pub use transform::{internal_id_for, resolve_optional, resolve_required, transform_record, TransformError};
pub use writer::{
    throughput_and_eta, BatchWriter, FailureLog, ProgressSnapshot, ProgressTracker, RowFailure,
    MAX_RECORDED_FAILURES,
};

pub const CRATE_NAME: &str = "qmig-sync";

pub const ENTITY_REGISTRY_FILE: &str = "entities.yaml";

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub source_base_url: String,
    pub source_token: Option<String>,
    pub user_agent: String,
    pub page_size: u32,
    pub min_request_interval: Duration,
    pub http_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub batch_size: usize,
    pub progress_every: usize,
    pub workspace_root: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            max_connections: parsed("QMIG_MAX_CONNECTIONS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(8),
            source_base_url: non_empty("QMIG_SOURCE_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/api/1.1".to_string()),
            source_token: non_empty("QMIG_SOURCE_TOKEN"),
            user_agent: non_empty("QMIG_USER_AGENT").unwrap_or_else(|| "qmig/0.1".to_string()),
            page_size: parsed("QMIG_PAGE_SIZE")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(100),
            min_request_interval: Duration::from_millis(
                parsed("QMIG_MIN_REQUEST_INTERVAL_MS").unwrap_or(200),
            ),
            http_timeout_secs: parsed("QMIG_HTTP_TIMEOUT_SECS").unwrap_or(30),
            max_attempts: parsed("QMIG_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(5),
            backoff_step: Duration::from_millis(parsed("QMIG_BACKOFF_STEP_MS").unwrap_or(1000)),
            batch_size: parsed("QMIG_BATCH_SIZE")
                .map(|v| usize::try_from(v).unwrap_or(MAX_BATCH_SIZE))
                .unwrap_or(250)
                .clamp(1, MAX_BATCH_SIZE),
            progress_every: parsed("QMIG_PROGRESS_EVERY")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(10)
                .max(1),
            workspace_root: non_empty("QMIG_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            fixtures_dir: non_empty("QMIG_FIXTURES_DIR").map(PathBuf::from),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_step: self.backoff_step,
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEndpointConfig {
    pub type_name: String,
    #[serde(default)]
    pub constraints: Option<JsonValue>,
}

/// Source API type name and constraints per entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRegistry {
    pub entities: BTreeMap<EntityType, EntityEndpointConfig>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        let entities = MIGRATION_ORDER
            .iter()
            .map(|entity| {
                (
                    *entity,
                    EntityEndpointConfig {
                        type_name: entity.as_str().to_string(),
                        constraints: None,
                    },
                )
            })
            .collect();
        Self { entities }
    }
}

impl EntityRegistry {
    /// Reads `entities.yaml` from the workspace root. Entity types the file leaves out keep
    /// their default endpoint; a missing file yields the defaults.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(ENTITY_REGISTRY_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: EntityRegistry = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        let mut registry = Self::default();
        registry.entities.extend(parsed.entities);
        Ok(registry)
    }

    pub fn endpoints(&self) -> HashMap<EntityType, SourceEndpoint> {
        self.entities
            .iter()
            .map(|(entity, config)| {
                (
                    *entity,
                    SourceEndpoint {
                        type_name: config.type_name.clone(),
                        constraints: config.constraints.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Fixture files when `QMIG_FIXTURES_DIR` is set, the HTTP data API otherwise.
pub fn build_source(config: &MigrationConfig, registry: &EntityRegistry) -> Result<Arc<dyn RecordSource>> {
    if let Some(dir) = &config.fixtures_dir {
        info!(dir = %dir.display(), "reading source records from fixtures");
        return Ok(Arc::new(FixtureRecordSource::new(dir.clone())));
    }
    let http = HttpRecordSource::new(HttpSourceConfig {
        base_url: config.source_base_url.clone(),
        token: config.source_token.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        endpoints: registry.endpoints(),
        ..Default::default()
    })?;
    Ok(Arc::new(http))
}

pub fn build_paginator(config: &MigrationConfig, source: Arc<dyn RecordSource>) -> SourcePaginator {
    SourcePaginator::new(
        source,
        Arc::new(MinIntervalLimiter::new(config.min_request_interval)),
        config.retry_policy(),
        config.page_size,
    )
}

/// Result of one run plus where its reports went.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub summary: RunSummary,
    pub reports_dir: PathBuf,
    pub snapshot_manifest: Option<PathBuf>,
}

async fn connect_stores(
    config: &MigrationConfig,
    dry_run: bool,
) -> Result<(Arc<dyn TargetStore>, Arc<dyn MappingStore>)> {
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(PgTargetStore::connect(url, config.max_connections).await?);
            let target: Arc<dyn TargetStore> = store.clone();
            let mappings: Arc<dyn MappingStore> = store;
            Ok((target, mappings))
        }
        None if dry_run => {
            warn!("DATABASE_URL not set; dry run resolves against empty in-memory stores");
            Ok((
                Arc::new(MemoryTargetStore::new()),
                Arc::new(MemoryMappingStore::new()),
            ))
        }
        None => bail!("DATABASE_URL is not set"),
    }
}

pub async fn run_migration(config: &MigrationConfig, plan: &MigrationPlan) -> Result<MigrationReport> {
    let registry = EntityRegistry::load(&config.workspace_root)?;
    let source = build_source(config, &registry)?;
    let (target, mappings) = connect_stores(config, plan.dry_run).await?;
    let orchestrator = MigrationOrchestrator::new(build_paginator(config, source), target, mappings)
        .with_retry(config.retry_policy())
        .with_batch_size(config.batch_size)
        .with_progress_every(config.progress_every);

    let outcome = orchestrator.run(plan).await;
    let reports_dir = write_run_reports(&config.workspace_root, &outcome.summary).await?;
    let snapshot_manifest = if plan.dry_run {
        Some(export_dry_run_snapshots(&reports_dir, outcome.summary.run_id, &outcome.dry_run_rows).await?)
    } else {
        None
    };
    info!(reports_dir = %reports_dir.display(), "run reports written");
    Ok(MigrationReport {
        summary: outcome.summary,
        reports_dir,
        snapshot_manifest,
    })
}

pub async fn run_migration_from_env(plan: &MigrationPlan) -> Result<MigrationReport> {
    run_migration(&MigrationConfig::from_env(), plan).await
}

/// Applies the bundled SQL migrations to `DATABASE_URL`.
pub async fn migrate_schema(config: &MigrationConfig) -> Result<()> {
    let Some(url) = &config.database_url else {
        bail!("DATABASE_URL is not set");
    };
    let store = PgTargetStore::connect(url, 1).await?;
    store.migrate().await?;
    info!("schema migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_clamping() {
        let config = MigrationConfig::from_lookup(|key| match key {
            "QMIG_BATCH_SIZE" => Some("5000".into()),
            "QMIG_PAGE_SIZE" => Some("not-a-number".into()),
            "QMIG_FIXTURES_DIR" => Some("fixtures/sample".into()),
            _ => None,
        });
        assert_eq!(config.batch_size, MAX_BATCH_SIZE);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.min_request_interval, Duration::from_millis(200));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.fixtures_dir, Some(PathBuf::from("fixtures/sample")));
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn registry_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(ENTITY_REGISTRY_FILE),
            "entities:\n  sheet:\n    type_name: questionnaire_sheet\n    constraints:\n      - key: archived\n        constraint_type: equals\n        value: false\n",
        )
        .expect("write registry");
        let registry = EntityRegistry::load(dir.path()).expect("load");
        let endpoints = registry.endpoints();
        assert_eq!(endpoints[&EntityType::Sheet].type_name, "questionnaire_sheet");
        assert!(endpoints[&EntityType::Sheet].constraints.is_some());
        assert_eq!(endpoints[&EntityType::Answer].type_name, "answer");
        assert_eq!(endpoints.len(), MIGRATION_ORDER.len());
    }

    #[test]
    fn missing_registry_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(EntityRegistry::load(dir.path()).expect("load"), EntityRegistry::default());
    }

    #[tokio::test]
    async fn live_run_without_database_is_a_config_error() {
        let config = MigrationConfig::from_lookup(|_| None);
        let err = connect_stores(&config, false).await.err().expect("no database");
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
