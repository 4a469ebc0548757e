//! Authoritative contact directory keyed by normalized profile URL, and the
//! enrichment policy applied against it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use roster_core::{
    normalize_email, normalize_label, normalize_phone, normalize_profile_url, MatchStatus,
    Participant,
};
use serde::Serialize;
use tracing::{info, warn};

const LINKEDIN_COLUMNS: &[&str] = &["linkedin", "perfil_linkedin", "url_linkedin", "link_linkedin"];
const EMAIL_COLUMNS: &[&str] = &["email_pessoal", "email", "mail"];
const PHONE_COLUMNS: &[&str] = &["celular_com_ddd", "telefone", "celular", "phone"];
const NAME_COLUMNS: &[&str] = &["nome", "name"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryRecord {
    pub linkedin: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl DirectoryRecord {
    /// Fill only the fields still empty here; existing values always win.
    fn absorb(&mut self, later: DirectoryRecord) {
        if self.name.is_none() {
            self.name = later.name;
        }
        if self.email.is_none() {
            self.email = later.email;
        }
        if self.phone.is_none() {
            self.phone = later.phone;
        }
    }
}

/// Normalized header names picked for each directory field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    pub linkedin: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub rows: usize,
    pub indexed: usize,
    pub skipped_without_url: usize,
    pub unreadable_rows: usize,
    pub merged_collisions: usize,
}

/// Pick a column for one field: exact match in candidate order first, then
/// the first column (header order) containing any candidate as a substring.
pub fn resolve_column(columns: &[String], candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|candidate| columns.iter().position(|c| c == candidate))
        .or_else(|| {
            columns
                .iter()
                .position(|c| candidates.iter().any(|candidate| c.contains(candidate)))
        })
}

fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let count = |needle: u8| header.iter().filter(|b| **b == needle).count();
    let commas = count(b',');
    [b';', b'\t']
        .into_iter()
        .map(|d| (d, count(d)))
        .filter(|(_, n)| *n > commas)
        .max_by_key(|(_, n)| *n)
        .map(|(d, _)| d)
        .unwrap_or(b',')
}

/// In-memory lookup from normalized profile URL to directory contact data.
///
/// Built once per run and read-only afterwards. An index without a URL
/// column is empty, which turns enrichment into a no-op.
#[derive(Debug, Clone, Default)]
pub struct DatabaseIndex {
    records: HashMap<String, DirectoryRecord>,
    columns: ColumnMapping,
    stats: IndexStats,
}

impl DatabaseIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a delimited file. A missing file gives an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "directory file not found; enrichment disabled");
            return Ok(Self::empty());
        }
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let index = Self::from_bytes(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        info!(
            path = %path.display(),
            rows = index.stats.rows,
            indexed = index.stats.indexed,
            skipped_without_url = index.stats.skipped_without_url,
            merged_collisions = index.stats.merged_collisions,
            "directory index loaded"
        );
        Ok(index)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .delimiter(sniff_delimiter(bytes))
            .from_reader(bytes);

        let columns: Vec<String> = reader
            .headers()
            .context("reading directory header row")?
            .iter()
            .map(normalize_label)
            .collect();

        let pick = |candidates: &[&str]| resolve_column(&columns, candidates);
        let (col_linkedin, col_email, col_phone, col_name) = (
            pick(LINKEDIN_COLUMNS),
            pick(EMAIL_COLUMNS),
            pick(PHONE_COLUMNS),
            pick(NAME_COLUMNS),
        );
        let mapping = ColumnMapping {
            linkedin: col_linkedin.map(|i| columns[i].clone()),
            email: col_email.map(|i| columns[i].clone()),
            phone: col_phone.map(|i| columns[i].clone()),
            name: col_name.map(|i| columns[i].clone()),
        };

        let Some(col_linkedin) = col_linkedin else {
            warn!(?columns, "directory has no profile URL column; enrichment disabled");
            return Ok(Self {
                columns: mapping,
                ..Self::default()
            });
        };

        let mut records: HashMap<String, DirectoryRecord> = HashMap::new();
        let mut stats = IndexStats::default();

        for (idx, row) in reader.records().enumerate() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    let fatal = matches!(err.kind(), csv::ErrorKind::Io(_));
                    warn!(row = idx + 1, error = %err, "skipping unreadable directory row");
                    stats.unreadable_rows += 1;
                    if fatal {
                        break;
                    }
                    continue;
                }
            };
            stats.rows += 1;

            let cell = |col: Option<usize>| col.and_then(|i| row.get(i)).map(str::trim).unwrap_or("");
            let Some(linkedin) = normalize_profile_url(cell(Some(col_linkedin))) else {
                stats.skipped_without_url += 1;
                continue;
            };

            let name = cell(col_name);
            let candidate = DirectoryRecord {
                linkedin: linkedin.clone(),
                name: (!name.is_empty()).then(|| name.to_string()),
                email: normalize_email(cell(col_email)),
                phone: normalize_phone(cell(col_phone)),
            };

            match records.entry(linkedin) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    slot.get_mut().absorb(candidate);
                    stats.merged_collisions += 1;
                }
            }
        }
        stats.indexed = records.len();

        Ok(Self {
            records,
            columns: mapping,
            stats,
        })
    }

    pub fn get(&self, normalized_linkedin: &str) -> Option<&DirectoryRecord> {
        self.records.get(normalized_linkedin)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn columns(&self) -> &ColumnMapping {
        &self.columns
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }
}

fn is_missing(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Apply the directory to one participant.
///
/// The profile URL is replaced by its normalized form whenever it has one.
/// On a match only email and phone are filled, and only where the participant
/// has none; the directory never overrides a populated contact field.
pub fn enrich(mut record: Participant, index: &DatabaseIndex) -> (Participant, MatchStatus) {
    let Some(normalized) = record.linkedin.as_deref().and_then(normalize_profile_url) else {
        return (record, MatchStatus::NoLinkedin);
    };

    let found = index.get(&normalized);
    record.linkedin = Some(normalized);
    let Some(found) = found else {
        return (record, MatchStatus::NoMatch);
    };

    if is_missing(&record.email) && found.email.is_some() {
        record.email = found.email.clone();
    }
    if is_missing(&record.phone) && found.phone.is_some() {
        record.phone = found.phone.clone();
    }
    (record, MatchStatus::Matched)
}
