//! Participant extraction: cheap labeled-line parsing plus the structured
//! extraction service used when the cheap pass leaves required fields empty.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use roster_core::{normalize_label, Participant};
use roster_storage::{BackoffPolicy, FetchError, HttpClient, HttpClientConfig, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "roster-extract";

const NAME_KEYS: &[&str] = &["nome", "name"];
const PHONE_KEYS: &[&str] = &["telefone", "celular", "phone"];
const EMAIL_KEYS: &[&str] = &["email", "mail", "email_pessoal"];
const LINKEDIN_KEYS: &[&str] = &["linkedin"];
const COMPANY_KEYS: &[&str] = &["empresa_atual", "empresaatual", "empresa", "company"];
const ROLE_KEYS: &[&str] = &["cargo", "role", "position", "posicao"];
const HEADLINE_KEYS: &[&str] = &["headline", "resumo"];

const MIN_LABEL_CHARS: usize = 2;
const MAX_LABEL_CHARS: usize = 120;

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

/// Split one line into `(label, value)` when it has a `label : value` shape.
///
/// The label is everything before the first colon and must hold between 2 and
/// 120 characters; the value is the rest of the line, trimmed.
fn split_labeled_line(line: &str) -> Option<(&str, &str)> {
    let (label, value) = line.split_once(':')?;
    if value.is_empty() {
        return None;
    }
    let label_chars = label.chars().count();
    let core_chars = label.trim().chars().count();
    if label_chars < MIN_LABEL_CHARS || core_chars > MAX_LABEL_CHARS {
        return None;
    }
    Some((label, value.trim()))
}

/// Scan `text` for labeled lines, keyed by normalized label. Later lines
/// overwrite earlier lines with the same normalized label.
pub fn parse_key_values(text: &str) -> HashMap<String, String> {
    text.split(is_line_break)
        .filter_map(split_labeled_line)
        .map(|(label, value)| (normalize_label(label), value.to_string()))
        .collect()
}

fn first_present(kv: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| kv.get(*key))
        .find(|value| !value.is_empty())
        .cloned()
}

pub fn participant_from_key_values(kv: &HashMap<String, String>) -> Participant {
    Participant {
        name: first_present(kv, NAME_KEYS),
        phone: first_present(kv, PHONE_KEYS),
        email: first_present(kv, EMAIL_KEYS),
        linkedin: first_present(kv, LINKEDIN_KEYS),
        current_company: first_present(kv, COMPANY_KEYS),
        role: first_present(kv, ROLE_KEYS),
        headline: first_present(kv, HEADLINE_KEYS),
    }
}

/// Cheap rule-based pass over a raw profile text.
pub fn parse_participant(text: &str) -> Participant {
    participant_from_key_values(&parse_key_values(text))
}

/// Whether the cheap pass found enough to skip structured extraction.
///
/// Phone and email are not required here: they are corrected later from the
/// authoritative directory once the profile URL matches.
pub fn is_complete_enough(record: &Participant) -> bool {
    [
        &record.name,
        &record.linkedin,
        &record.current_company,
        &record.role,
        &record.headline,
    ]
    .iter()
    .all(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction service unavailable: {0}")]
    Unavailable(#[source] FetchError),
    #[error("extraction service rejected the request: {0}")]
    Rejected(#[source] FetchError),
    #[error("extraction service refused: {0}")]
    Refusal(String),
    #[error("extraction service returned no content")]
    EmptyContent,
    #[error("extraction response is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("extraction response violates the participant schema: {0}")]
    Schema(String),
}

impl ExtractError {
    pub fn from_fetch(err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => Self::Unavailable(err),
            RetryDisposition::NonRetryable => Self::Rejected(err),
        }
    }

    /// Transient failures already went through the client's bounded retries;
    /// a later run may still succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// External text-understanding service that fills the participant schema.
///
/// Implementations must return `None` for anything not present in the text
/// and must never invent values.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, text: &str) -> Result<Participant, ExtractError>;
}

/// Boundary check for a service response: an object with exactly the seven
/// participant keys, each a string or null. Blank strings become `None`.
pub fn validate_extraction(value: &JsonValue) -> Result<Participant, ExtractError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ExtractError::Schema("expected a JSON object".to_string()))?;

    if let Some(unknown) = obj.keys().find(|k| !Participant::FIELDS.contains(&k.as_str())) {
        return Err(ExtractError::Schema(format!("unexpected field `{unknown}`")));
    }

    let mut fields: HashMap<&str, Option<String>> = HashMap::new();
    for key in Participant::FIELDS {
        let value = match obj.get(key) {
            None => return Err(ExtractError::Schema(format!("missing field `{key}`"))),
            Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(ExtractError::Schema(format!(
                    "field `{key}` must be a string or null"
                )))
            }
        };
        fields.insert(key, value);
    }

    let mut take = |key: &str| fields.remove(key).flatten();
    Ok(Participant {
        name: take("name"),
        phone: take("phone"),
        email: take("email"),
        linkedin: take("linkedin"),
        current_company: take("current_company"),
        role: take("role"),
        headline: take("headline"),
    }
    .sanitized())
}

pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
Extract the following fields from the candidate profile text:
name, phone, email, linkedin, current_company, role, headline.

Rules:
- Return null for any field that is not present in the text.
- Never invent or guess data.
- role must not include a city, state or country.
- linkedin must be a URL when a LinkedIn profile is referenced.
";

/// JSON schema sent with every request; all seven keys required, each nullable.
pub fn participant_json_schema() -> JsonValue {
    let nullable_string = json!({ "type": ["string", "null"] });
    let properties: serde_json::Map<String, JsonValue> = Participant::FIELDS
        .iter()
        .map(|key| (key.to_string(), nullable_string.clone()))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": Participant::FIELDS,
        "additionalProperties": false,
    })
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    response_format: JsonValue,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
    refusal: Option<String>,
}

/// Strips ```json ... ``` or ``` ... ``` fences some compatible servers add.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest).trim_start();
    rest.strip_suffix("```").map(str::trim).unwrap_or(rest)
}

/// Decode a chat-completions response body into a validated participant.
pub fn participant_from_chat_response(body: &[u8]) -> Result<Participant, ExtractError> {
    let response: ChatResponse = serde_json::from_slice(body)?;
    let reply = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or(ExtractError::EmptyContent)?;

    if let Some(refusal) = reply.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ExtractError::Refusal(refusal));
    }
    let content = reply
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or(ExtractError::EmptyContent)?;
    let value: JsonValue = serde_json::from_str(strip_json_fences(&content))?;
    validate_extraction(&value)
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub user_agent: Option<String>,
}

/// Chat-completions client with strict structured output.
#[derive(Debug, Clone)]
pub struct OpenAiExtractor {
    http: HttpClient,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiExtractor {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
            backoff: BackoffPolicy {
                max_retries: config.max_retries,
                ..Default::default()
            },
        })?;
        Ok(Self {
            http,
            api_key: config.api_key,
            model: config.model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
        })
    }

    fn request<'a>(&'a self, text: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "participant",
                    "strict": true,
                    "schema": participant_json_schema(),
                },
            }),
        }
    }
}

#[async_trait]
impl StructuredExtractor for OpenAiExtractor {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn extract(&self, text: &str) -> Result<Participant, ExtractError> {
        let span = info_span!("structured_extract", model = %self.model, chars = text.len());
        async {
            let response = self
                .http
                .post_json(&self.endpoint, Some(&self.api_key), &self.request(text))
                .await
                .map_err(ExtractError::from_fetch)?;
            debug!(attempts = response.attempts, bytes = response.body.len(), "extraction response received");
            participant_from_chat_response(&response.body).inspect_err(|err| {
                warn!(error = %err, "extraction response rejected");
            })
        }
        .instrument(span)
        .await
    }
}
