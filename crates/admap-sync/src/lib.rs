//! Sync pipeline orchestration: identity pre-filter, normalization, staged
//! write, idempotent merge-commit, and count-based verification.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use admap_adapters::{AdSource, HtmlAdSource, HtmlSourceConfig, SourceError};
use admap_core::{CanonicalListing, DocumentShape, ListingSummary, SearchCriteria};
use admap_store::{ListingStore, MergeSpec, MongoStore, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "admap-sync";

/// Registry of sync targets. The historical deployment ran three copies of
/// this pipeline differing only in collection names, document shape, and
/// search parameters; each copy is now one entry here.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<SyncTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncTarget {
    pub name: String,
    pub permanent_collection: String,
    pub staging_collection: String,
    pub document_shape: DocumentShape,
    pub search: SearchCriteria,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mongodb_uri: String,
    pub database: String,
    pub targets_path: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub source_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_concurrency: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            mongodb_uri: std::env::var("ADMAP_MONGODB_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            database: std::env::var("ADMAP_DATABASE").unwrap_or_else(|_| "admap".to_string()),
            targets_path: std::env::var("ADMAP_TARGETS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./targets.yaml")),
            scheduler_enabled: std::env::var("ADMAP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ADMAP_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            source_base_url: std::env::var("ADMAP_SOURCE_BASE_URL")
                .unwrap_or_else(|_| "https://www.kijiji.ca".to_string()),
            user_agent: std::env::var("ADMAP_USER_AGENT")
                .unwrap_or_else(|_| "admap-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("ADMAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            detail_concurrency: std::env::var("ADMAP_DETAIL_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("ad source unavailable: {0}")]
    Source(#[from] SourceError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("staging incomplete: staged {staged} of {expected} documents")]
    StagingIncomplete { staged: u64, expected: u64 },
}

/// Run-completion record for one target.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_summaries: usize,
    pub candidates: usize,
    pub skipped_malformed: usize,
    pub staged: u64,
    pub net_new: u64,
}

/// Keep only summaries whose identifier the permanent collection does not
/// already hold, preserving source order. This is an efficiency pre-filter;
/// the merge's insert-if-absent policy is what actually guarantees
/// uniqueness.
pub fn filter_new_candidates(
    summaries: Vec<ListingSummary>,
    known: &HashSet<String>,
) -> Vec<ListingSummary> {
    summaries
        .into_iter()
        .filter(|summary| !known.contains(&summary.id))
        .collect()
}

pub struct SyncPipeline {
    store: Arc<dyn ListingStore>,
    source: Arc<dyn AdSource>,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn ListingStore>, source: Arc<dyn AdSource>) -> Self {
        Self { store, source }
    }

    /// One batch run against one target. Stages are strictly sequential; the
    /// staging collection is cleared on every exit path that may have written
    /// to it, merge outcome notwithstanding.
    pub async fn run_once(&self, target: &SyncTarget) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let id_path = target.document_shape.id_path();
        info!(%run_id, target = target.name.as_str(), "starting sync run");

        self.store
            .ensure_identity_index(&target.permanent_collection, id_path)
            .await?;

        let known = self.load_known_ids(target, id_path).await?;

        let summaries = self.source.search(&target.search).await?;
        let fetched_summaries = summaries.len();
        let candidates = filter_new_candidates(summaries, &known);
        let candidate_count = candidates.len();
        info!(
            %run_id,
            fetched = fetched_summaries,
            new = candidate_count,
            "filtered candidates against identity index"
        );

        if candidates.is_empty() {
            return Ok(summarize(
                run_id,
                target,
                started_at,
                RunCounts {
                    fetched_summaries,
                    ..RunCounts::default()
                },
            ));
        }

        // Detail fetches run concurrently and are awaited as a group; any
        // source failure aborts before staging sees a single write.
        let fetches = candidates
            .iter()
            .map(|summary| self.source.fetch_detail(&summary.link));
        let mut ads = Vec::with_capacity(candidate_count);
        for fetched in join_all(fetches).await {
            ads.push(fetched?);
        }

        let mut skipped_malformed = 0usize;
        let mut documents = Vec::with_capacity(ads.len());
        for ad in &ads {
            match CanonicalListing::from_raw(ad) {
                Ok(listing) => documents.push(listing.to_document(target.document_shape)),
                Err(err) => {
                    skipped_malformed += 1;
                    warn!(%run_id, ad_id = ad.id.as_str(), error = %err, "skipping malformed ad");
                }
            }
        }

        if documents.is_empty() {
            info!(%run_id, skipped = skipped_malformed, "no stageable documents after normalization");
            return Ok(summarize(
                run_id,
                target,
                started_at,
                RunCounts {
                    fetched_summaries,
                    candidates: candidate_count,
                    skipped_malformed,
                    ..RunCounts::default()
                },
            ));
        }

        let outcome = self.stage_and_commit(target, id_path, &documents, run_id).await;
        let cleanup = self.store.delete_all(&target.staging_collection).await;
        let (staged, net_new) = outcome?;
        cleanup?;
        info!(%run_id, staged, net_new, "sync run finished");

        Ok(summarize(
            run_id,
            target,
            started_at,
            RunCounts {
                fetched_summaries,
                candidates: candidate_count,
                skipped_malformed,
                staged,
                net_new,
            },
        ))
    }

    pub async fn run_all(&self, targets: &[SyncTarget]) -> Result<Vec<SyncRunSummary>, SyncError> {
        let mut summaries = Vec::with_capacity(targets.len());
        for target in targets {
            summaries.push(self.run_once(target).await?);
        }
        Ok(summaries)
    }

    async fn load_known_ids(
        &self,
        target: &SyncTarget,
        id_path: &str,
    ) -> Result<HashSet<String>, SyncError> {
        let ids = self
            .store
            .projected_ids(&target.permanent_collection, id_path)
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Staged write, merge-commit, count verification. Returns
    /// `(staged, net_new)`. The caller owns clearing the staging collection.
    async fn stage_and_commit(
        &self,
        target: &SyncTarget,
        id_path: &str,
        documents: &[JsonValue],
        run_id: Uuid,
    ) -> Result<(u64, u64), SyncError> {
        let expected = documents.len() as u64;
        let staged = self
            .store
            .insert_many(&target.staging_collection, documents)
            .await?;
        if staged != expected {
            return Err(SyncError::StagingIncomplete { staged, expected });
        }
        info!(%run_id, staged, "staging write complete");

        let before = self
            .store
            .count_documents(&target.permanent_collection)
            .await?;
        let spec = MergeSpec::insert_if_absent(&target.permanent_collection, id_path);
        self.store.merge(&target.staging_collection, &spec).await?;
        let after = self
            .store
            .count_documents(&target.permanent_collection)
            .await?;

        Ok((staged, after.saturating_sub(before)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RunCounts {
    fetched_summaries: usize,
    candidates: usize,
    skipped_malformed: usize,
    staged: u64,
    net_new: u64,
}

fn summarize(
    run_id: Uuid,
    target: &SyncTarget,
    started_at: DateTime<Utc>,
    counts: RunCounts,
) -> SyncRunSummary {
    SyncRunSummary {
        run_id,
        target: target.name.clone(),
        started_at,
        finished_at: Utc::now(),
        fetched_summaries: counts.fetched_summaries,
        candidates: counts.candidates,
        skipped_malformed: counts.skipped_malformed,
        staged: counts.staged,
        net_new: counts.net_new,
    }
}

pub async fn load_target_registry(path: &Path) -> Result<TargetRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let store = MongoStore::connect(&config.mongodb_uri, &config.database)
        .await
        .context("connecting to store")?;
    let source = HtmlAdSource::new(HtmlSourceConfig {
        base_url: config.source_base_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        detail_concurrency: config.detail_concurrency,
    })
    .context("building ad source")?;
    Ok(SyncPipeline::new(Arc::new(store), Arc::new(source)))
}

pub async fn run_sync_once_from_env() -> Result<Vec<SyncRunSummary>> {
    let config = SyncConfig::from_env();
    let registry = load_target_registry(&config.targets_path).await?;
    let pipeline = pipeline_from_config(&config).await?;
    let mut summaries = Vec::with_capacity(registry.targets.len());
    for target in &registry.targets {
        let summary = pipeline
            .run_once(target)
            .await
            .with_context(|| format!("sync run for target {}", target.name))?;
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Build the optional in-process scheduler. Runs are fired on the configured
/// cron and failures are logged, not retried; the next tick is the retry.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
    registry: TargetRegistry,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let targets = registry.targets.clone();
        Box::pin(async move {
            for target in &targets {
                match pipeline.run_once(target).await {
                    Ok(summary) => info!(
                        target = target.name.as_str(),
                        net_new = summary.net_new,
                        "scheduled sync run finished"
                    ),
                    Err(err) => warn!(
                        target = target.name.as_str(),
                        error = %err,
                        "scheduled sync run failed"
                    ),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
