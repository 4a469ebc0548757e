use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use roster_core::{MatchStatus, Participant};
use roster_extract::{ExtractError, StructuredExtractor};
use roster_pipeline::{
    DatabaseIndex, ExtractionOutcome, Pipeline, PipelineConfig, PipelineError,
    MATCH_REPORT_CSV_NAME, PARTICIPANTS_CSV_NAME, RUN_SUMMARY_NAME,
};
use tempfile::TempDir;

const DIRECTORY_CSV: &str = "\
Nome,LinkedIn,E-mail Pessoal,Celular com DDD
Jane Doe,https://www.linkedin.com/in/jane-doe/,jane@example.com,(41) 99999-1234
";

struct CountingExtractor {
    calls: AtomicUsize,
    record: Participant,
}

impl CountingExtractor {
    fn returning(record: Participant) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            record,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredExtractor for CountingExtractor {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn extract(&self, _text: &str) -> Result<Participant, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.record.clone())
    }
}

struct FailingExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl StructuredExtractor for FailingExtractor {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn extract(&self, _text: &str) -> Result<Participant, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExtractError::EmptyContent)
    }
}

struct Workspace {
    _root: TempDir,
    config: PipelineConfig,
}

impl Workspace {
    fn new(inputs: &[(&str, &str)]) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let data_dir = root.path().join("data");
        let txt_dir = data_dir.join("txt");
        std::fs::create_dir_all(&txt_dir).expect("txt dir");
        for (name, body) in inputs {
            std::fs::write(txt_dir.join(name), body).expect("write input");
        }
        let database_csv = root.path().join("database.csv");
        std::fs::write(&database_csv, DIRECTORY_CSV).expect("write directory");

        let config = PipelineConfig {
            data_dir,
            database_csv,
            max_concurrent_extractions: 2,
            ..Default::default()
        };
        Self {
            _root: root,
            config,
        }
    }

    fn pipeline(&self, extractor: Arc<dyn StructuredExtractor>) -> Pipeline {
        Pipeline::new(self.config.clone())
            .expect("pipeline")
            .with_extractor(extractor)
    }

    fn index(&self) -> DatabaseIndex {
        DatabaseIndex::load(&self.config.database_csv).expect("index")
    }

    fn cache_lines(&self) -> usize {
        read_or_empty(&self.config.cache_path()).lines().count()
    }
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn full_profile(name: &str, linkedin: &str) -> String {
    format!(
        "Nome: {name}\nLinkedIn: {linkedin}\nEmpresa Atual: Acme\nCargo: Engineer\nHeadline: Builds things\n"
    )
}

#[tokio::test]
async fn identical_inputs_are_extracted_at_most_once() {
    let text = "Nome: Jane Doe\nLinkedIn: linkedin.com/in/jane-doe\n";
    let ws = Workspace::new(&[("a.txt", text), ("b.txt", text)]);
    let extractor = CountingExtractor::returning(Participant {
        name: Some("Jane Doe".into()),
        linkedin: Some("linkedin.com/in/jane-doe".into()),
        current_company: Some("Acme".into()),
        ..Default::default()
    });

    let batch = ws
        .pipeline(extractor.clone())
        .process_inputs(&ws.index())
        .await
        .expect("batch");

    assert_eq!(extractor.calls(), 1);
    assert_eq!(batch.counters.extractor_calls, 1);
    assert_eq!(batch.counters.cache_hits, 1);
    assert_eq!(batch.records[0].extraction, ExtractionOutcome::Extracted);
    assert_eq!(batch.records[1].extraction, ExtractionOutcome::Cached);
    assert_eq!(batch.records[0].record, batch.records[1].record);
    assert_eq!(ws.cache_lines(), 1);
}

#[tokio::test]
async fn directory_contact_fills_missing_fields_only() {
    let ws = Workspace::new(&[
        ("jane.txt", "LinkedIn: linkedin.com/in/jane-doe\n"),
        ("ghost.txt", "LinkedIn: linkedin.com/in/nobody\n"),
        ("anon.txt", "Nome: Anon\n"),
        (
            "own.txt",
            "Nome: Jane\nLinkedIn: https://linkedin.com/in/jane-doe?trk=x\nEmail: own@example.com\n",
        ),
    ]);
    let extractor = Arc::new(FailingExtractor {
        calls: AtomicUsize::new(0),
    });

    let batch = ws
        .pipeline(extractor)
        .process_inputs(&ws.index())
        .await
        .expect("batch");
    let by_file = |name: &str| {
        batch
            .records
            .iter()
            .find(|r| r.file_name == name)
            .expect("record")
    };

    let jane = by_file("jane.txt");
    assert_eq!(jane.status, MatchStatus::Matched);
    assert_eq!(jane.record.email.as_deref(), Some("jane@example.com"));
    assert_eq!(jane.record.phone.as_deref(), Some("41999991234"));
    assert_eq!(
        jane.linkedin_normalized.as_deref(),
        Some("https://www.linkedin.com/in/jane-doe")
    );

    let own = by_file("own.txt");
    assert_eq!(own.status, MatchStatus::Matched);
    assert_eq!(own.record.email.as_deref(), Some("own@example.com"));
    assert_eq!(own.record.phone.as_deref(), Some("41999991234"));

    let ghost = by_file("ghost.txt");
    assert_eq!(ghost.status, MatchStatus::NoMatch);
    assert_eq!(ghost.record.email, None);

    let anon = by_file("anon.txt");
    assert_eq!(anon.status, MatchStatus::NoLinkedin);

    assert_eq!(batch.counters.matched, 2);
    assert_eq!(batch.counters.no_match, 1);
    assert_eq!(batch.counters.no_linkedin, 1);
}

#[tokio::test]
async fn failed_extraction_degrades_and_is_not_cached() {
    let text = "Nome: Jane Doe\nLinkedIn: linkedin.com/in/jane-doe\n";
    let ws = Workspace::new(&[("a.txt", text), ("b.txt", text)]);
    let extractor = Arc::new(FailingExtractor {
        calls: AtomicUsize::new(0),
    });

    let batch = ws
        .pipeline(extractor.clone())
        .process_inputs(&ws.index())
        .await
        .expect("batch");

    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(batch.counters.extraction_failures, 1);
    assert_eq!(batch.counters.degraded, 2);
    assert_eq!(batch.counters.cache_hits, 0);
    for item in &batch.records {
        assert_eq!(item.extraction, ExtractionOutcome::Degraded);
        assert_eq!(item.record.name.as_deref(), Some("Jane Doe"));
        assert_eq!(item.status, MatchStatus::Matched);
    }
    assert_eq!(ws.cache_lines(), 0);
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let complete = full_profile("Jane Doe", "linkedin.com/in/jane-doe");
    let ws = Workspace::new(&[("a.txt", complete.as_str()), ("b.txt", "Nome: Partial\n")]);
    let extractor = CountingExtractor::returning(Participant {
        name: Some("Partial Person".into()),
        ..Default::default()
    });

    let first = ws
        .pipeline(extractor.clone())
        .run_once()
        .await
        .expect("first run");
    assert_eq!(first.counters.inputs, 2);
    assert_eq!(first.counters.cache_hits, 0);
    assert_eq!(first.counters.extractor_calls, 1);

    let second = ws
        .pipeline(extractor.clone())
        .run_once()
        .await
        .expect("second run");
    assert_eq!(second.counters.cache_hits, 2);
    assert_eq!(second.counters.extractor_calls, 0);
    assert_eq!(extractor.calls(), 1);
    assert_eq!(ws.cache_lines(), 2);
}

#[tokio::test]
async fn run_writes_reports_in_discovery_order() {
    let bee = full_profile("Bee", "linkedin.com/in/nobody");
    let jane = full_profile("Jane Doe", "www.linkedin.com/in/jane-doe/");
    let ws = Workspace::new(&[("b.txt", bee.as_str()), ("a.txt", jane.as_str())]);
    let extractor = CountingExtractor::returning(Participant::default());

    let summary = ws.pipeline(extractor.clone()).run_once().await.expect("run");
    assert_eq!(extractor.calls(), 0);
    assert_eq!(summary.counters.matched, 1);
    assert_eq!(summary.counters.no_match, 1);

    let output_dir = ws.config.output_dir();
    let participants = read_or_empty(&output_dir.join(PARTICIPANTS_CSV_NAME));
    let participants = participants.trim_start_matches('\u{feff}');
    let lines: Vec<_> = participants.lines().collect();
    assert_eq!(
        lines[0],
        "file,name,phone,email,linkedin,current_company,role,headline"
    );
    assert!(lines[1].starts_with("a.txt,Jane Doe,41999991234,jane@example.com,"));
    assert!(lines[2].starts_with("b.txt,Bee,,,"));

    let report = read_or_empty(&output_dir.join(MATCH_REPORT_CSV_NAME));
    assert!(report.starts_with('\u{feff}'));
    assert!(report.contains("a.txt,www.linkedin.com/in/jane-doe/,https://www.linkedin.com/in/jane-doe,matched,parsed,"));

    let summary_json: serde_json::Value =
        serde_json::from_str(&read_or_empty(&output_dir.join(RUN_SUMMARY_NAME))).expect("json");
    assert_eq!(summary_json["inputs"], 2);
    assert_eq!(summary_json["matched"], 1);
}

#[tokio::test]
async fn empty_input_directory_is_fatal() {
    let ws = Workspace::new(&[]);
    let extractor = CountingExtractor::returning(Participant::default());

    let err = ws
        .pipeline(extractor)
        .run_once()
        .await
        .expect_err("no inputs");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NoInputs { .. })
    ));
}

#[tokio::test]
async fn invalid_utf8_input_is_still_reported() {
    let ws = Workspace::new(&[("b.txt", "Nome: Bee\n")]);
    std::fs::write(ws.config.txt_dir().join("a.txt"), b"Nome: J\xffane\nLinkedIn: linkedin.com/in/jane-doe\n")
        .expect("write bytes");
    let extractor = Arc::new(FailingExtractor {
        calls: AtomicUsize::new(0),
    });

    let summary = ws.pipeline(extractor).run_once().await.expect("run");
    assert_eq!(summary.counters.inputs, 2);
    assert_eq!(summary.counters.matched, 1);
    assert_eq!(summary.counters.no_linkedin, 1);

    let participants = read_or_empty(&ws.config.output_dir().join(PARTICIPANTS_CSV_NAME));
    let rows: Vec<_> = participants.trim_start_matches('\u{feff}').lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("a.txt,J\u{fffd}ane,41999991234,jane@example.com,"));
    assert!(rows[1].starts_with("b.txt,Bee,"));
}
