//! Batch jobs: snapshot, compute, chunked write-back, epoch publish.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pumpkin_core::{fields, Collection, Contest, Grower, Pumpkin, Record};
use pumpkin_storage::{
    BatchedWriter, ChunkCommitError, DocumentStore, StoreError, WriteSummary, MAX_GROUP_OPERATIONS,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{contest_popularity, contest_record_weights, fold_sites, grower_stats, GrowerStats};
use crate::grouping::Dimension;
use crate::rank::{rank_pumpkins, rank_update, RankTable};
use crate::report;

/// Id of the `stats` document holding the latest published epoch per job.
pub const EPOCHS_DOCUMENT: &str = "epochs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Job {
    #[serde(rename = "calculateGlobalRankings")]
    GlobalRankings,
    #[serde(rename = "calculateStateRankings")]
    StateRankings,
    #[serde(rename = "calculateCountryRankings")]
    CountryRankings,
    #[serde(rename = "calculateGrowerMetrics")]
    GrowerMetrics,
    #[serde(rename = "calculateLifetimeBestRank")]
    LifetimeBestRank,
    #[serde(rename = "calculateGrowerRankings")]
    GrowerRankings,
    #[serde(rename = "calculateContestPopularityRanking")]
    ContestPopularity,
    #[serde(rename = "calculateSiteRecords")]
    SiteRecords,
    #[serde(rename = "calculateSiteStats")]
    SiteStats,
}

impl Job {
    /// Every job, in the order a full refresh runs them.
    pub const ALL: [Job; 9] = [
        Job::GlobalRankings,
        Job::StateRankings,
        Job::CountryRankings,
        Job::GrowerMetrics,
        Job::LifetimeBestRank,
        Job::GrowerRankings,
        Job::ContestPopularity,
        Job::SiteRecords,
        Job::SiteStats,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::GlobalRankings => "calculateGlobalRankings",
            Job::StateRankings => "calculateStateRankings",
            Job::CountryRankings => "calculateCountryRankings",
            Job::GrowerMetrics => "calculateGrowerMetrics",
            Job::LifetimeBestRank => "calculateLifetimeBestRank",
            Job::GrowerRankings => "calculateGrowerRankings",
            Job::ContestPopularity => "calculateContestPopularityRanking",
            Job::SiteRecords => "calculateSiteRecords",
            Job::SiteStats => "calculateSiteStats",
        }
    }

    /// Field stamped with the run id on every record this job writes.
    pub fn epoch_field(&self) -> &'static str {
        match self {
            Job::GlobalRankings => "globalRankingsEpoch",
            Job::StateRankings => "stateRankingsEpoch",
            Job::CountryRankings => "countryRankingsEpoch",
            Job::GrowerMetrics => "growerMetricsEpoch",
            Job::LifetimeBestRank => "bestRankEpoch",
            Job::GrowerRankings => "growerRankingsEpoch",
            Job::ContestPopularity => "popularityEpoch",
            Job::SiteRecords => "siteRecordsEpoch",
            Job::SiteStats => "siteStatsEpoch",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Job::GlobalRankings => "Lifetime and yearly global ranks for every pumpkin",
            Job::StateRankings => "Lifetime and yearly ranks within each state",
            Job::CountryRankings => "Lifetime and yearly ranks within each country",
            Job::GrowerMetrics => "Heaviest pumpkin and entry count per grower",
            Job::LifetimeBestRank => "Best yearly global rank per grower",
            Job::GrowerRankings => "Formatted global, state and country rankings per grower",
            Job::ContestPopularity => "Yearly and lifetime entry counts per contest",
            Job::SiteRecords => "Heaviest eligible pumpkin per contest",
            Job::SiteStats => "Site documents folded from every contest sharing a site name",
        }
    }

    fn dimension(&self) -> Option<Dimension> {
        match self {
            Job::GlobalRankings => Some(Dimension::Global),
            Job::StateRankings => Some(Dimension::State),
            Job::CountryRankings => Some(Dimension::Country),
            _ => None,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Job {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Job::ALL
            .into_iter()
            .find(|job| job.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| JobError::UnknownJob(wanted.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("loading {collection} snapshot failed: {source}")]
    Load {
        collection: Collection,
        #[source]
        source: StoreError,
    },
    #[error("write sequence aborted: {0}")]
    Write(#[from] ChunkCommitError),
    #[error("encoding {collection}/{id}: {source}")]
    Encode {
        collection: Collection,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading published epochs: {0}")]
    Epochs(#[source] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub job: Job,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub loaded: usize,
    pub malformed: usize,
    pub disqualified: usize,
    pub write: WriteSummary,
    /// The input snapshot was empty and nothing was written.
    pub empty_input: bool,
    #[serde(default)]
    pub report_dir: Option<String>,
}

impl JobSummary {
    pub fn acknowledgment(&self) -> String {
        if self.empty_input {
            return format!("{} completed: no input records (run {})", self.job, self.run_id);
        }
        format!(
            "{} completed: {} records written, {} skipped (run {})",
            self.job, self.write.committed, self.write.skipped, self.run_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub reports_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_GROUP_OPERATIONS,
            reports_dir: None,
        }
    }
}

struct Snapshot<R> {
    records: Vec<R>,
    loaded: usize,
    malformed: usize,
}

#[derive(Default)]
struct Outcome {
    loaded: usize,
    malformed: usize,
    disqualified: usize,
    write: WriteSummary,
    ranks: Option<RankTable>,
    empty_input: bool,
}

impl Outcome {
    fn empty(loaded: usize, malformed: usize) -> Self {
        Self {
            loaded,
            malformed,
            empty_input: true,
            ..Default::default()
        }
    }
}

/// Runs stats jobs against a shared document store.
pub struct StatsEngine {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
}

impl StatsEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn run(&self, job: Job) -> Result<JobSummary, JobError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("stats_job", %run_id, job = job.name());
        self.run_with_id(job, run_id).instrument(span).await
    }

    pub async fn run_by_name(&self, name: &str) -> Result<JobSummary, JobError> {
        self.run(name.parse()?).await
    }

    /// Run every job in dependency order, stopping at the first failure.
    pub async fn run_all(&self) -> Result<Vec<JobSummary>, JobError> {
        let mut summaries = Vec::with_capacity(Job::ALL.len());
        for job in Job::ALL {
            summaries.push(self.run(job).await?);
        }
        Ok(summaries)
    }

    /// Latest run id each job published, keyed by job name.
    pub async fn published_epochs(&self) -> Result<Map<String, Value>, JobError> {
        let docs = self
            .store
            .load_collection(Collection::Stats)
            .await
            .map_err(JobError::Epochs)?;
        Ok(docs
            .into_iter()
            .find(|doc| doc.id == EPOCHS_DOCUMENT)
            .map(|doc| doc.fields)
            .unwrap_or_default())
    }

    pub async fn published_epoch(&self, job: Job) -> Result<Option<Uuid>, JobError> {
        let epochs = self.published_epochs().await?;
        Ok(epochs
            .get(job.name())
            .and_then(|entry| entry.get("epoch"))
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok()))
    }

    async fn run_with_id(&self, job: Job, run_id: Uuid) -> Result<JobSummary, JobError> {
        let started_at = Utc::now();
        info!("job started");

        let outcome = match job {
            Job::GlobalRankings | Job::StateRankings | Job::CountryRankings => {
                let dimension = job.dimension().unwrap_or(Dimension::Global);
                self.rank_job(job, run_id, dimension).await?
            }
            Job::GrowerMetrics | Job::LifetimeBestRank | Job::GrowerRankings => {
                self.grower_job(job, run_id).await?
            }
            Job::ContestPopularity => self.contest_popularity_job(run_id).await?,
            Job::SiteRecords => self.site_records_job(run_id).await?,
            Job::SiteStats => self.site_stats_job(run_id).await?,
        };

        if !outcome.empty_input {
            self.publish_epoch(job, run_id, &outcome.write).await?;
        }

        let mut summary = JobSummary {
            run_id,
            job,
            started_at,
            finished_at: Utc::now(),
            loaded: outcome.loaded,
            malformed: outcome.malformed,
            disqualified: outcome.disqualified,
            write: outcome.write,
            empty_input: outcome.empty_input,
            report_dir: None,
        };

        if let (Some(dir), false) = (&self.config.reports_dir, outcome.empty_input) {
            match report::write_run_report(dir, &summary, outcome.ranks.as_ref()).await {
                Ok(path) => summary.report_dir = Some(path.display().to_string()),
                Err(err) => warn!(error = %format!("{err:#}"), "run report not written"),
            }
        }

        info!(
            loaded = summary.loaded,
            malformed = summary.malformed,
            committed = summary.write.committed,
            skipped = summary.write.skipped,
            chunks = summary.write.chunks,
            "job finished"
        );
        Ok(summary)
    }

    fn writer(&self) -> BatchedWriter<'_> {
        BatchedWriter::with_max_ops(self.store.as_ref(), self.config.batch_size)
    }

    async fn load<R: Record>(&self) -> Result<Snapshot<R>, JobError> {
        let collection = R::COLLECTION;
        let docs = self
            .store
            .load_collection(collection)
            .await
            .map_err(|source| JobError::Load { collection, source })?;

        let mut records = Vec::with_capacity(docs.len());
        let mut malformed = 0;
        for doc in &docs {
            match R::from_document(doc) {
                Ok(record) => records.push(record),
                Err(err) => {
                    malformed += 1;
                    warn!(%collection, id = %doc.id, error = %err, "skipping malformed document");
                }
            }
        }
        debug!(%collection, loaded = docs.len(), malformed, "snapshot loaded");
        Ok(Snapshot {
            records,
            loaded: docs.len(),
            malformed,
        })
    }

    async fn load_pumpkins(&self) -> Result<Snapshot<Pumpkin>, JobError> {
        let mut snapshot = self.load::<Pumpkin>().await?;
        let before = snapshot.records.len();
        snapshot.records.retain(|p| {
            let finite = p.weight.is_finite();
            if !finite {
                warn!(id = %p.id, "skipping pumpkin with non-finite weight");
            }
            finite
        });
        snapshot.malformed += before - snapshot.records.len();
        Ok(snapshot)
    }

    async fn rank_job(&self, job: Job, run_id: Uuid, dimension: Dimension) -> Result<Outcome, JobError> {
        let pumpkins = self.load_pumpkins().await?;
        if pumpkins.records.is_empty() {
            info!("no pumpkins loaded; nothing to rank");
            return Ok(Outcome::empty(pumpkins.loaded, pumpkins.malformed));
        }

        let ranks = rank_pumpkins(&pumpkins.records, &[dimension]);
        let mut disqualified = 0;
        let mut writer = self.writer();
        for pumpkin in &pumpkins.records {
            if pumpkin.is_disqualified() {
                disqualified += 1;
            }
            // Pumpkins without a rank in this dimension get its rank fields removed.
            let (mut set, clear) = rank_update(ranks.get(&pumpkin.id), dimension);
            stamp(&mut set, job, run_id);
            writer
                .merge_clearing(Collection::Pumpkins, &pumpkin.id, set, &clear)
                .await?;
        }
        let write = writer.finish().await?;
        info!(%dimension, ranked = ranks.len(), disqualified, "ranks assigned");

        Ok(Outcome {
            loaded: pumpkins.loaded,
            malformed: pumpkins.malformed,
            disqualified,
            write,
            ranks: Some(ranks),
            empty_input: false,
        })
    }

    async fn grower_job(&self, job: Job, run_id: Uuid) -> Result<Outcome, JobError> {
        let pumpkins = self.load_pumpkins().await?;
        let growers = self.load::<Grower>().await?;
        let loaded = pumpkins.loaded + growers.loaded;
        let malformed = pumpkins.malformed + growers.malformed;
        if pumpkins.records.is_empty() || growers.records.is_empty() {
            info!(
                pumpkins = pumpkins.records.len(),
                growers = growers.records.len(),
                "empty input; nothing to aggregate"
            );
            return Ok(Outcome::empty(loaded, malformed));
        }

        let stats = grower_stats(&pumpkins.records);
        let known: HashSet<&str> = growers.records.iter().map(|g| g.id.as_str()).collect();
        let orphaned = stats.keys().filter(|id| !known.contains(id.as_str())).count();
        if orphaned > 0 {
            debug!(orphaned, "pumpkins reference growers missing from the snapshot");
        }

        let none = GrowerStats::default();
        let mut writer = self.writer();
        for grower in &growers.records {
            let grower_stats = stats.get(&grower.id).unwrap_or(&none);
            let mut set = grower_fields(job, grower, grower_stats);
            stamp(&mut set, job, run_id);
            writer.merge(Collection::Growers, &grower.id, set).await?;
        }
        let write = writer.finish().await?;

        Ok(Outcome {
            loaded,
            malformed,
            disqualified: pumpkins.records.iter().filter(|p| p.is_disqualified()).count(),
            write,
            ranks: None,
            empty_input: false,
        })
    }

    async fn contest_popularity_job(&self, run_id: Uuid) -> Result<Outcome, JobError> {
        let pumpkins = self.load_pumpkins().await?;
        let contests = self.load::<Contest>().await?;
        let loaded = pumpkins.loaded + contests.loaded;
        let malformed = pumpkins.malformed + contests.malformed;
        if pumpkins.records.is_empty() || contests.records.is_empty() {
            info!("empty input; no popularity to compute");
            return Ok(Outcome::empty(loaded, malformed));
        }

        let popularity = contest_popularity(&pumpkins.records, &contests.records);
        let mut writer = self.writer();
        for (contest_id, counts) in &popularity {
            let mut set = Map::new();
            set.insert(fields::YEAR_POPULARITY.to_string(), json!(counts.year));
            set.insert(fields::LIFETIME_POPULARITY.to_string(), json!(counts.lifetime));
            stamp(&mut set, Job::ContestPopularity, run_id);
            writer.merge(Collection::Contests, contest_id, set).await?;
        }
        let write = writer.finish().await?;

        Ok(Outcome {
            loaded,
            malformed,
            disqualified: pumpkins.records.iter().filter(|p| p.is_disqualified()).count(),
            write,
            ranks: None,
            empty_input: false,
        })
    }

    async fn site_records_job(&self, run_id: Uuid) -> Result<Outcome, JobError> {
        let pumpkins = self.load_pumpkins().await?;
        let contests = self.load::<Contest>().await?;
        let loaded = pumpkins.loaded + contests.loaded;
        let malformed = pumpkins.malformed + contests.malformed;
        if pumpkins.records.is_empty() || contests.records.is_empty() {
            info!("empty input; no site records to compute");
            return Ok(Outcome::empty(loaded, malformed));
        }

        let records = contest_record_weights(&pumpkins.records);
        let mut writer = self.writer();
        for contest in &contests.records {
            let mut set = Map::new();
            set.insert(
                fields::RECORD_WEIGHT.to_string(),
                json!(records.get(contest.id.as_str())),
            );
            stamp(&mut set, Job::SiteRecords, run_id);
            writer.merge(Collection::Contests, &contest.id, set).await?;
        }
        let write = writer.finish().await?;

        Ok(Outcome {
            loaded,
            malformed,
            disqualified: pumpkins.records.iter().filter(|p| p.is_disqualified()).count(),
            write,
            ranks: None,
            empty_input: false,
        })
    }

    async fn site_stats_job(&self, run_id: Uuid) -> Result<Outcome, JobError> {
        let contests = self.load::<Contest>().await?;
        if contests.records.is_empty() {
            info!("no contests loaded; no sites to fold");
            return Ok(Outcome::empty(contests.loaded, contests.malformed));
        }

        let existing = self
            .store
            .load_collection(Collection::Sites)
            .await
            .map_err(|source| JobError::Load {
                collection: Collection::Sites,
                source,
            })?;

        let sites = fold_sites(&contests.records);
        let mut writer = self.writer();
        for (name, site) in &sites {
            let encoded = serde_json::to_value(site).map_err(|source| JobError::Encode {
                collection: Collection::Sites,
                id: name.clone(),
                source,
            })?;
            let mut set = match encoded {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            stamp(&mut set, Job::SiteStats, run_id);
            writer.replace(Collection::Sites, name, set).await?;
        }

        // Sites no contest folds into any more are emptied and left unstamped.
        let mut retired = 0;
        for doc in existing.iter().filter(|doc| !sites.contains_key(&doc.id)) {
            if writer.replace(Collection::Sites, &doc.id, Map::new()).await? {
                retired += 1;
            }
        }
        if retired > 0 {
            info!(retired, "retired site documents with no contributing contest");
        }
        let write = writer.finish().await?;

        Ok(Outcome {
            loaded: contests.loaded,
            malformed: contests.malformed,
            disqualified: 0,
            write,
            ranks: None,
            empty_input: false,
        })
    }

    /// Advance the job's epoch pointer. Only reached after every chunk committed.
    async fn publish_epoch(&self, job: Job, run_id: Uuid, write: &WriteSummary) -> Result<(), JobError> {
        let mut set = Map::new();
        set.insert(
            job.name().to_string(),
            json!({
                "epoch": run_id.to_string(),
                "completedAt": Utc::now().to_rfc3339(),
                "records": write.committed,
            }),
        );
        let mut writer = BatchedWriter::new(self.store.as_ref());
        writer.merge(Collection::Stats, EPOCHS_DOCUMENT, set).await?;
        writer.finish().await?;
        Ok(())
    }
}

fn stamp(set: &mut Map<String, Value>, job: Job, run_id: Uuid) {
    set.insert(job.epoch_field().to_string(), Value::String(run_id.to_string()));
}

fn grower_fields(job: Job, grower: &Grower, stats: &GrowerStats) -> Map<String, Value> {
    let mut set = Map::new();
    match job {
        Job::GrowerMetrics => {
            set.insert(fields::LIFETIME_MAX_WEIGHT.to_string(), json!(stats.max_weight));
            set.insert(fields::NUMBER_OF_ENTRIES.to_string(), json!(stats.entries));
        }
        Job::LifetimeBestRank => {
            set.insert(fields::BEST_RANK.to_string(), json!(stats.best_rank));
        }
        Job::GrowerRankings => {
            set.insert(fields::GLOBAL_RANKING.to_string(), json!(stats.global_ranking()));
            set.insert(fields::STATE_RANKING.to_string(), json!(stats.state_ranking(grower)));
            set.insert(fields::COUNTRY_RANKING.to_string(), json!(stats.country_ranking(grower)));
        }
        _ => {}
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumpkin_storage::MemoryStore;
    use serde_json::json;

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (id, weight, place, year, state, grower, contest, name) in [
            ("p1", 50.0, "3", 2022, "VA", "g1", "hmb-2022", "Half Moon Bay"),
            ("p2", 80.0, "1", 2022, "VA", "g1", "hmb-2022", "Half Moon Bay"),
            ("p3", 80.0, "2", 2023, "NC", "g2", "hmb-2023", "Half Moon Bay"),
            ("p4", 2000.0, "DMG", 2023, "NC", "g2", "hmb-2023", "Half Moon Bay"),
        ] {
            store
                .insert(
                    Collection::Pumpkins,
                    id,
                    json!({
                        "weight": weight, "place": place, "year": year,
                        "state": state, "country": "United States",
                        "grower": grower, "contest": contest, "contestName": name
                    }),
                )
                .await;
        }
        store
            .insert(Collection::Growers, "g1", json!({ "state": "Virginia", "country": "United States" }))
            .await;
        store
            .insert(Collection::Growers, "g2", json!({ "state": "North Carolina", "country": "" }))
            .await;
        store
            .insert(Collection::Growers, "g3", json!({ "state": "Ohio", "country": "United States" }))
            .await;
        store
            .insert(Collection::Contests, "hmb-2022", json!({ "name": "Half Moon Bay", "year": 2022 }))
            .await;
        store
            .insert(Collection::Contests, "hmb-2023", json!({ "name": "Half Moon Bay", "year": 2023 }))
            .await;
        store
    }

    fn engine(store: Arc<MemoryStore>) -> StatsEngine {
        StatsEngine::new(store, EngineConfig::default())
    }

    #[tokio::test]
    async fn global_rankings_are_written_and_dmg_is_stripped() {
        let store = seeded_store().await;
        store
            .insert(
                Collection::Pumpkins,
                "p4",
                json!({
                    "weight": 2000.0, "place": "DMG", "year": 2023, "state": "NC",
                    "grower": "g2", "contest": "hmb-2023", "lifetimeGlobalRank": 1, "yearGlobalRank": 1
                }),
            )
            .await;
        let engine = engine(store.clone());

        let summary = engine.run(Job::GlobalRankings).await.expect("run");
        assert_eq!(summary.write.committed, 4);
        assert_eq!(summary.disqualified, 1);

        let rank = |fields: Map<String, Value>| fields.get("lifetimeGlobalRank").cloned();
        assert_eq!(rank(store.get(Collection::Pumpkins, "p2").await.unwrap()), Some(json!(1)));
        assert_eq!(rank(store.get(Collection::Pumpkins, "p3").await.unwrap()), Some(json!(2)));
        assert_eq!(rank(store.get(Collection::Pumpkins, "p1").await.unwrap()), Some(json!(3)));

        let dmg = store.get(Collection::Pumpkins, "p4").await.unwrap();
        assert!(!dmg.contains_key("lifetimeGlobalRank"));
        assert!(!dmg.contains_key("yearGlobalRank"));
    }

    #[tokio::test]
    async fn epoch_pointer_matches_stamped_records() {
        let store = seeded_store().await;
        let engine = engine(store.clone());
        let summary = engine.run(Job::StateRankings).await.expect("run");

        let published = engine.published_epoch(Job::StateRankings).await.unwrap();
        assert_eq!(published, Some(summary.run_id));
        let p1 = store.get(Collection::Pumpkins, "p1").await.unwrap();
        assert_eq!(p1["stateRankingsEpoch"], json!(summary.run_id.to_string()));
    }

    #[tokio::test]
    async fn empty_snapshot_is_a_logged_no_op() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        for job in Job::ALL {
            let summary = engine.run(job).await.expect("empty run succeeds");
            assert!(summary.empty_input, "{job} should see empty input");
        }
        assert!(store.committed_group_sizes().await.is_empty());
        assert!(engine.published_epochs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped() {
        let store = seeded_store().await;
        store
            .insert(Collection::Pumpkins, "bad", json!({ "weight": "heavy", "year": 2023 }))
            .await;
        let summary = engine(store.clone()).run(Job::GlobalRankings).await.unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.write.committed, 4);
        let bad = store.get(Collection::Pumpkins, "bad").await.unwrap();
        assert!(!bad.contains_key("lifetimeGlobalRank"));
    }

    #[tokio::test]
    async fn chunk_failure_fails_the_job_and_keeps_the_old_epoch() {
        let store = seeded_store().await;
        let engine = StatsEngine::new(
            store.clone(),
            EngineConfig {
                batch_size: 2,
                reports_dir: None,
            },
        );
        let first = engine.run(Job::GlobalRankings).await.expect("first run");

        store.fail_group_at(1);
        let err = engine.run(Job::GlobalRankings).await.expect_err("second chunk fails");
        assert!(matches!(err, JobError::Write(ChunkCommitError { chunk: 1, .. })));
        assert_eq!(
            engine.published_epoch(Job::GlobalRankings).await.unwrap(),
            Some(first.run_id)
        );
    }

    #[tokio::test]
    async fn padded_ids_are_written_back_to_the_same_document() {
        let store = seeded_store().await;
        store
            .insert(
                Collection::Pumpkins,
                " p9 ",
                json!({ "weight": 3000.0, "place": "1", "year": 2024, "state": "VA", "country": "United States" }),
            )
            .await;
        let before = store.len(Collection::Pumpkins).await;

        engine(store.clone()).run(Job::GlobalRankings).await.expect("run");

        let padded = store.get(Collection::Pumpkins, " p9 ").await.expect("padded doc");
        assert_eq!(padded["lifetimeGlobalRank"], json!(1));
        assert_eq!(padded["weight"], json!(3000.0));
        assert!(store.get(Collection::Pumpkins, "p9").await.is_none());
        assert_eq!(store.len(Collection::Pumpkins).await, before);
    }

    #[tokio::test]
    async fn site_stats_retire_sites_without_contests() {
        let store = seeded_store().await;
        store
            .insert(
                Collection::Sites,
                "Old Fair",
                json!({ "Site Record": 1500.0, "Total Entries": 9, "siteStatsEpoch": "stale" }),
            )
            .await;
        let engine = engine(store.clone());
        let summary = engine.run(Job::SiteStats).await.expect("run");

        let old = store.get(Collection::Sites, "Old Fair").await.expect("old site kept");
        assert!(!old.contains_key("Site Record"));
        assert!(!old.contains_key("Total Entries"));
        assert!(!old.contains_key("siteStatsEpoch"));

        let current = store.get(Collection::Sites, "Half Moon Bay").await.unwrap();
        assert_eq!(current["siteStatsEpoch"], json!(summary.run_id.to_string()));
        assert_eq!(
            engine.published_epoch(Job::SiteStats).await.unwrap(),
            Some(summary.run_id)
        );
    }

    #[tokio::test]
    async fn grower_jobs_fill_every_grower_including_empty_ones() {
        let store = seeded_store().await;
        let engine = engine(store.clone());
        engine.run(Job::GlobalRankings).await.unwrap();
        engine.run(Job::StateRankings).await.unwrap();
        engine.run(Job::CountryRankings).await.unwrap();
        engine.run(Job::GrowerMetrics).await.unwrap();
        engine.run(Job::LifetimeBestRank).await.unwrap();
        engine.run(Job::GrowerRankings).await.unwrap();

        let g1 = store.get(Collection::Growers, "g1").await.unwrap();
        assert_eq!(g1["LifetimeMaxWeight"], json!(80.0));
        assert_eq!(g1["NumberOfEntries"], json!(2));
        assert_eq!(g1["bestRank"], json!(1));
        assert_eq!(g1["globalRanking"], json!("Global: #1"));
        assert_eq!(g1["stateRanking"], json!("Virginia: #1"));
        assert_eq!(g1["countryRanking"], json!("United States: #1"));

        let g2 = store.get(Collection::Growers, "g2").await.unwrap();
        assert_eq!(g2["NumberOfEntries"], json!(1));
        assert_eq!(g2["LifetimeMaxWeight"], json!(80.0));
        assert_eq!(g2["countryRanking"], Value::Null);

        let g3 = store.get(Collection::Growers, "g3").await.unwrap();
        assert_eq!(g3["NumberOfEntries"], json!(0));
        assert_eq!(g3["bestRank"], Value::Null);
        assert_eq!(g3["globalRanking"], Value::Null);
    }

    #[tokio::test]
    async fn full_refresh_builds_contest_and_site_stats() {
        let store = seeded_store().await;
        let summaries = engine(store.clone()).run_all().await.expect("run all");
        assert_eq!(summaries.len(), Job::ALL.len());

        let c2022 = store.get(Collection::Contests, "hmb-2022").await.unwrap();
        assert_eq!(c2022["YearPopularity"], json!(2));
        assert_eq!(c2022["LifetimePopularity"], json!(3));
        assert_eq!(c2022["recordWeight"], json!(80.0));

        let c2023 = store.get(Collection::Contests, "hmb-2023").await.unwrap();
        assert_eq!(c2023["YearPopularity"], json!(1));
        assert_eq!(c2023["LifetimePopularity"], json!(3));
        assert_eq!(c2023["recordWeight"], json!(80.0));

        let site = store.get(Collection::Sites, "Half Moon Bay").await.unwrap();
        assert_eq!(site["Site Record"], json!(80.0));
        assert_eq!(site["Total Entries"], json!(3));
        assert_eq!(site["Popularity by Year"], json!({ "2022": 2, "2023": 1 }));
        assert!(site.contains_key("siteStatsEpoch"));
    }

    #[tokio::test]
    async fn reruns_produce_identical_ranks() {
        let store = seeded_store().await;
        let engine = engine(store.clone());
        let strip = |mut fields: Map<String, Value>| {
            fields.retain(|k, _| !k.ends_with("Epoch"));
            fields
        };

        engine.run(Job::GlobalRankings).await.unwrap();
        let first = strip(store.get(Collection::Pumpkins, "p3").await.unwrap());
        engine.run(Job::GlobalRankings).await.unwrap();
        let second = strip(store.get(Collection::Pumpkins, "p3").await.unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn job_names_parse_case_insensitively() {
        assert_eq!("calculateSiteRecords".parse::<Job>().unwrap(), Job::SiteRecords);
        assert_eq!("CALCULATEGLOBALRANKINGS".parse::<Job>().unwrap(), Job::GlobalRankings);
        assert!(matches!("calculateEverything".parse::<Job>(), Err(JobError::UnknownJob(_))));
        assert_eq!(
            serde_json::to_value(Job::ContestPopularity).unwrap(),
            json!("calculateContestPopularityRanking")
        );
    }
}
