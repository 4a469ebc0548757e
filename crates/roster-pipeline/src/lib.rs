//! Profile-to-contact pipeline orchestration: cache lookup, cheap parsing,
//! structured extraction fallback, directory enrichment and reports.

pub mod directory;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use roster_core::{normalize_profile_url, MatchStatus, Participant};
use roster_extract::{
    is_complete_enough, parse_participant, OpenAiConfig, OpenAiExtractor, StructuredExtractor,
};
use roster_storage::{content_hash, write_atomic, CacheStore};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-pipeline";

pub use directory::{enrich, ColumnMapping, DatabaseIndex, DirectoryRecord, IndexStats};

pub const PARTICIPANTS_CSV_NAME: &str = "participants.csv";
pub const MATCH_REPORT_CSV_NAME: &str = "match_report.csv";
pub const RUN_SUMMARY_NAME: &str = "run_summary.json";
pub const CACHE_LOG_NAME: &str = "cache.jsonl";

const DATA_DIR_CANDIDATES: [&str; 2] = ["data", "Data"];
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no .txt inputs found in {}", dir.display())]
    NoInputs { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub database_csv: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub max_concurrent_extractions: usize,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_csv: PathBuf::from("docs").join("database.csv"),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            http_timeout_secs: 60,
            max_retries: 3,
            max_concurrent_extractions: 4,
            user_agent: "roster/0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("ROSTER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| pick_data_dir()),
            database_csv: std::env::var("ROSTER_DATABASE_CSV")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_csv),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            openai_model: std::env::var("ROSTER_OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            http_timeout_secs: env_parse("ROSTER_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_retries: env_parse("ROSTER_MAX_RETRIES").unwrap_or(defaults.max_retries),
            max_concurrent_extractions: env_parse("ROSTER_MAX_CONCURRENT_EXTRACTIONS")
                .unwrap_or(defaults.max_concurrent_extractions),
            user_agent: std::env::var("ROSTER_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn txt_dir(&self) -> PathBuf {
        self.data_dir.join("txt")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache").join(CACHE_LOG_NAME)
    }

    pub fn openai_config(&self) -> Option<OpenAiConfig> {
        self.openai_api_key.as_ref().map(|api_key| OpenAiConfig {
            api_key: api_key.clone(),
            model: self.openai_model.clone(),
            base_url: self.openai_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            max_retries: self.max_retries,
            user_agent: Some(self.user_agent.clone()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn pick_data_dir() -> PathBuf {
    DATA_DIR_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_dir())
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_CANDIDATES[0]))
}

/// How the pre-enrichment record for one input was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Cached,
    Parsed,
    Extracted,
    Degraded,
    Unreadable,
}

impl ExtractionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Parsed => "parsed",
            Self::Extracted => "extracted",
            Self::Degraded => "degraded",
            Self::Unreadable => "unreadable",
        }
    }
}

impl fmt::Display for ExtractionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedRecord {
    pub file_name: String,
    pub linkedin_raw: Option<String>,
    pub linkedin_normalized: Option<String>,
    pub status: MatchStatus,
    pub extraction: ExtractionOutcome,
    pub record: Participant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub inputs: usize,
    pub cache_hits: usize,
    pub extractor_calls: usize,
    pub extraction_failures: usize,
    pub degraded: usize,
    pub matched: usize,
    pub no_linkedin: usize,
    pub no_match: usize,
}

impl RunCounters {
    fn record_status(&mut self, status: MatchStatus) {
        match status {
            MatchStatus::Matched => self.matched += 1,
            MatchStatus::NoLinkedin => self.no_linkedin += 1,
            MatchStatus::NoMatch => self.no_match += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    pub records: Vec<ProcessedRecord>,
    pub counters: RunCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub participants_csv: String,
    pub match_report_csv: String,
}

#[derive(Debug, Clone)]
pub struct InputUnit {
    pub file_name: String,
    pub path: PathBuf,
}

/// Regular `*.txt` files directly inside `dir`, sorted by name.
pub async fn discover_inputs(dir: &Path) -> Result<Vec<InputUnit>> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Err(PipelineError::NoInputs { dir: dir.to_path_buf() }.into());
    }
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;

    let mut inputs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        let is_txt = path.extension().is_some_and(|ext| ext == "txt");
        if !is_txt || file_name.starts_with('.') {
            continue;
        }
        if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            inputs.push(InputUnit { file_name, path });
        }
    }
    inputs.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    if inputs.is_empty() {
        return Err(PipelineError::NoInputs { dir: dir.to_path_buf() }.into());
    }
    Ok(inputs)
}

enum Resolution {
    Ready {
        record: Participant,
        outcome: ExtractionOutcome,
    },
    /// Waiting on the extraction pass.
    Pending,
    /// Same content as an earlier input in this run.
    SameAs(usize),
}

struct PendingExtraction {
    unit: usize,
    hash: String,
    text: String,
    partial: Participant,
}

struct ResolvedUnit {
    file_name: String,
    resolution: Resolution,
}

pub struct Pipeline {
    config: PipelineConfig,
    extractor: Option<Arc<dyn StructuredExtractor>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let extractor = config
            .openai_config()
            .map(|openai| OpenAiExtractor::new(openai).context("building structured extractor"))
            .transpose()?
            .map(|extractor| Arc::new(extractor) as Arc<dyn StructuredExtractor>);
        Ok(Self { config, extractor })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn StructuredExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);

        async {
            let index = load_index_or_empty(&self.config.database_csv);
            let batch = self.process_inputs(&index).await?;

            let output_dir = self.config.output_dir();
            let participants_csv = output_dir.join(PARTICIPANTS_CSV_NAME);
            let match_report_csv = output_dir.join(MATCH_REPORT_CSV_NAME);
            write_atomic(&participants_csv, &participants_csv_bytes(&batch.records)?).await?;
            write_atomic(&match_report_csv, &match_report_csv_bytes(&batch.records)?).await?;

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                counters: batch.counters,
                participants_csv: participants_csv.display().to_string(),
                match_report_csv: match_report_csv.display().to_string(),
            };
            let summary_json =
                serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
            write_atomic(&output_dir.join(RUN_SUMMARY_NAME), &summary_json).await?;

            let c = &summary.counters;
            info!(
                inputs = c.inputs,
                matched = c.matched,
                no_linkedin = c.no_linkedin,
                no_match = c.no_match,
                cache_hits = c.cache_hits,
                extractor_calls = c.extractor_calls,
                extraction_failures = c.extraction_failures,
                "run complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Resolve, extract and enrich every discovered input without writing reports.
    pub async fn process_inputs(&self, index: &DatabaseIndex) -> Result<ProcessedBatch> {
        let inputs = discover_inputs(&self.config.txt_dir()).await?;
        info!(dir = %self.config.txt_dir().display(), count = inputs.len(), "inputs discovered");
        self.process_units(&inputs, index).await
    }

    /// Every unit yields exactly one record, in the order given.
    async fn process_units(
        &self,
        inputs: &[InputUnit],
        index: &DatabaseIndex,
    ) -> Result<ProcessedBatch> {
        let (cache, load) = CacheStore::open(self.config.cache_path()).await?;
        info!(
            path = %cache.path().display(),
            entries = load.entries,
            distinct_keys = load.distinct_keys,
            skipped_lines = load.skipped_lines,
            "cache replayed"
        );
        let cache = Arc::new(cache);

        let mut counters = RunCounters {
            inputs: inputs.len(),
            ..Default::default()
        };
        let (mut units, pending) = self.resolve_units(inputs, &cache, &mut counters).await;
        self.run_extractions(pending, &mut units, &cache, &mut counters).await;

        let mut finals: Vec<(Participant, ExtractionOutcome)> = Vec::with_capacity(units.len());
        let mut records = Vec::with_capacity(units.len());
        for unit in units {
            let (record, outcome) = match unit.resolution {
                Resolution::Ready { record, outcome } => (record, outcome),
                Resolution::SameAs(owner) => match finals.get(owner) {
                    Some((record, ExtractionOutcome::Degraded)) => {
                        (record.clone(), ExtractionOutcome::Degraded)
                    }
                    Some((record, _)) => {
                        counters.cache_hits += 1;
                        (record.clone(), ExtractionOutcome::Cached)
                    }
                    None => (Participant::default(), ExtractionOutcome::Degraded),
                },
                Resolution::Pending => (Participant::default(), ExtractionOutcome::Degraded),
            };
            if matches!(outcome, ExtractionOutcome::Degraded | ExtractionOutcome::Unreadable) {
                counters.degraded += 1;
            }
            finals.push((record.clone(), outcome));

            let linkedin_raw = record.linkedin.clone();
            let linkedin_normalized = linkedin_raw.as_deref().and_then(normalize_profile_url);
            let (record, status) = enrich(record, index);
            counters.record_status(status);
            info!(file = %unit.file_name, %status, extraction = %outcome, "processed");

            records.push(ProcessedRecord {
                file_name: unit.file_name,
                linkedin_raw,
                linkedin_normalized,
                status,
                extraction: outcome,
                record,
            });
        }

        Ok(ProcessedBatch { records, counters })
    }

    /// Sequential pass in discovery order: read, hash, cache lookup, cheap parse.
    async fn resolve_units(
        &self,
        inputs: &[InputUnit],
        cache: &CacheStore,
        counters: &mut RunCounters,
    ) -> (Vec<ResolvedUnit>, Vec<PendingExtraction>) {
        let mut units = Vec::with_capacity(inputs.len());
        let mut pending = Vec::new();
        let mut claimed: HashMap<String, usize> = HashMap::new();

        for input in inputs {
            let idx = units.len();
            let file_name = input.file_name.clone();

            let text = match fs::read(&input.path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    warn!(file = %file_name, error = %err, "input unreadable");
                    units.push(ResolvedUnit {
                        file_name,
                        resolution: Resolution::Ready {
                            record: Participant::default(),
                            outcome: ExtractionOutcome::Unreadable,
                        },
                    });
                    continue;
                }
            };
            let hash = content_hash(&text);

            if let Some(record) = cache.get(&hash).await {
                counters.cache_hits += 1;
                units.push(ResolvedUnit {
                    file_name,
                    resolution: Resolution::Ready {
                        record,
                        outcome: ExtractionOutcome::Cached,
                    },
                });
                continue;
            }
            if let Some(&owner) = claimed.get(&hash) {
                units.push(ResolvedUnit {
                    file_name,
                    resolution: Resolution::SameAs(owner),
                });
                continue;
            }
            claimed.insert(hash.clone(), idx);

            let parsed = parse_participant(&text);
            if is_complete_enough(&parsed) {
                persist(cache, &hash, &parsed).await;
                units.push(ResolvedUnit {
                    file_name,
                    resolution: Resolution::Ready {
                        record: parsed,
                        outcome: ExtractionOutcome::Parsed,
                    },
                });
            } else {
                units.push(ResolvedUnit {
                    file_name,
                    resolution: Resolution::Pending,
                });
                pending.push(PendingExtraction {
                    unit: idx,
                    hash,
                    text,
                    partial: parsed,
                });
            }
        }

        (units, pending)
    }

    /// One extraction per distinct pending hash, bounded by the configured
    /// concurrency. Successful results are appended to the cache; failures
    /// fall back to the cheap-parse fields and are not cached.
    async fn run_extractions(
        &self,
        pending: Vec<PendingExtraction>,
        units: &mut [ResolvedUnit],
        cache: &Arc<CacheStore>,
        counters: &mut RunCounters,
    ) {
        if pending.is_empty() {
            return;
        }
        let Some(extractor) = &self.extractor else {
            warn!(count = pending.len(), "no extractor configured (OPENAI_API_KEY unset); using parsed fields");
            for job in pending {
                units[job.unit].resolution = Resolution::Ready {
                    record: job.partial,
                    outcome: ExtractionOutcome::Degraded,
                };
            }
            return;
        };

        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_extractions.max(1)));
        let mut handles = Vec::with_capacity(pending.len());
        for job in pending {
            let PendingExtraction {
                unit,
                hash,
                text,
                partial,
            } = job;
            let extractor = extractor.clone();
            let extractor_name = extractor.name();
            let cache = cache.clone();
            let limit = limit.clone();
            let file_name = units[unit].file_name.clone();
            counters.extractor_calls += 1;

            let handle = tokio::spawn(
                async move {
                    let _permit = limit.acquire_owned().await;
                    let record = extractor.extract(&text).await?;
                    persist(&cache, &hash, &record).await;
                    Ok::<_, roster_extract::ExtractError>(record)
                }
                .instrument(info_span!("extract_input", file = %file_name, extractor = extractor_name)),
            );
            handles.push((unit, partial, handle));
        }

        for (unit, partial, handle) in handles {
            let file_name = &units[unit].file_name;
            let resolution = match handle.await {
                Ok(Ok(record)) => Resolution::Ready {
                    record,
                    outcome: ExtractionOutcome::Extracted,
                },
                Ok(Err(err)) => {
                    warn!(file = %file_name, error = %err, transient = err.is_transient(), "structured extraction failed");
                    counters.extraction_failures += 1;
                    Resolution::Ready {
                        record: partial,
                        outcome: ExtractionOutcome::Degraded,
                    }
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "structured extraction task aborted");
                    counters.extraction_failures += 1;
                    Resolution::Ready {
                        record: partial,
                        outcome: ExtractionOutcome::Degraded,
                    }
                }
            };
            units[unit].resolution = resolution;
        }
    }
}

async fn persist(cache: &CacheStore, hash: &str, record: &Participant) {
    if let Err(err) = cache.put(hash, record).await {
        warn!(key = hash, error = %err, "cache append failed; result kept for this run only");
    }
}

fn load_index_or_empty(path: &Path) -> DatabaseIndex {
    match DatabaseIndex::load(path) {
        Ok(index) => index,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "directory unusable; enrichment disabled");
            DatabaseIndex::empty()
        }
    }
}

fn finish_csv(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("finishing csv buffer: {}", err.error()))
}

pub fn participants_csv_bytes(records: &[ProcessedRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
    let mut header = vec!["file"];
    header.extend(Participant::FIELDS);
    writer.write_record(&header).context("writing participants header")?;
    for item in records {
        let mut row = vec![item.file_name.as_str()];
        row.extend(item.record.values().map(|v| v.unwrap_or_default()));
        writer.write_record(&row).context("writing participants row")?;
    }
    finish_csv(writer)
}

pub fn match_report_csv_bytes(records: &[ProcessedRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
    writer
        .write_record([
            "file",
            "linkedin_raw",
            "linkedin_normalized",
            "status",
            "extraction",
            "email_final",
            "phone_final",
        ])
        .context("writing match report header")?;
    for item in records {
        writer
            .write_record([
                item.file_name.as_str(),
                item.linkedin_raw.as_deref().unwrap_or_default(),
                item.linkedin_normalized.as_deref().unwrap_or_default(),
                item.status.as_str(),
                item.extraction.as_str(),
                item.record.email.as_deref().unwrap_or_default(),
                item.record.phone.as_deref().unwrap_or_default(),
            ])
            .context("writing match report row")?;
    }
    finish_csv(writer)
}
