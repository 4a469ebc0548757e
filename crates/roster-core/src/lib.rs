//! Core participant model and identity canonicalization for roster.

use std::fmt;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "roster-core";

/// Canonical scheme + host every normalized profile URL starts with.
pub const CANONICAL_PROFILE_HOST: &str = "https://www.linkedin.com";

/// Minimum number of digits a phone number must keep after stripping.
pub const MIN_PHONE_DIGITS: usize = 8;

static EMBEDDED_PROFILE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:www\.)?linkedin\.com/[^\s)>\]]+").expect("static regex")
});

static PROFILE_HOST_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://(?:www\.)?linkedin\.com").expect("static regex")
});

/// Structured contact record extracted from one candidate profile.
///
/// Every field is optional. Absence is always `None`, never a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Participant {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub linkedin: Option<String>,
    pub current_company: Option<String>,
    pub role: Option<String>,
    pub headline: Option<String>,
}

impl Participant {
    /// Field keys in report/schema order.
    pub const FIELDS: [&'static str; 7] = [
        "name",
        "phone",
        "email",
        "linkedin",
        "current_company",
        "role",
        "headline",
    ];

    /// Replace blank or whitespace-only values with `None` and trim the rest.
    pub fn sanitized(self) -> Self {
        Self {
            name: non_blank(self.name),
            phone: non_blank(self.phone),
            email: non_blank(self.email),
            linkedin: non_blank(self.linkedin),
            current_company: non_blank(self.current_company),
            role: non_blank(self.role),
            headline: non_blank(self.headline),
        }
    }

    /// Values in the same order as [`Participant::FIELDS`].
    pub fn values(&self) -> [Option<&str>; 7] {
        [
            self.name.as_deref(),
            self.phone.as_deref(),
            self.email.as_deref(),
            self.linkedin.as_deref(),
            self.current_company.as_deref(),
            self.role.as_deref(),
            self.headline.as_deref(),
        ]
    }
}

/// Outcome of matching one participant against the authoritative directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    NoLinkedin,
    NoMatch,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::NoLinkedin => "no_linkedin",
            Self::NoMatch => "no_match",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == v.len() {
            Some(v)
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn starts_with_ignore_ascii_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn trim_trailing_noise(value: &str) -> &str {
    value.trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '/' | '.' | ',' | ';'))
}

/// Canonicalize a profile-network URL into `https://www.linkedin.com/...` form.
///
/// Total and idempotent: `normalize(normalize(x)) == normalize(x)`. Free text
/// around an absolute profile URL is dropped, bare `linkedin.com/...` and
/// `www.linkedin.com/...` forms get a scheme, the host is forced to the
/// canonical spelling, and query string, fragment and trailing `/ . , ;` are
/// removed.
pub fn normalize_profile_url(input: &str) -> Option<String> {
    let trimmed = input.trim().trim_end_matches(['.', ',', ';']);

    let mut value = if starts_with_ignore_ascii_case(trimmed, "linkedin.com/") {
        format!("https://www.{trimmed}")
    } else if starts_with_ignore_ascii_case(trimmed, "www.linkedin.com/") {
        format!("https://{trimmed}")
    } else {
        trimmed.to_string()
    };

    if let Some(found) = EMBEDDED_PROFILE_URL.find(&value) {
        value = found.as_str().to_string();
    }

    let value = PROFILE_HOST_PREFIX.replace(&value, NoExpand(CANONICAL_PROFILE_HOST));
    let value = value.split(['?', '#']).next().unwrap_or_default();
    let value = trim_trailing_noise(value);

    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Trim + lowercase; anything without an `@` is not an email.
pub fn normalize_email(input: &str) -> Option<String> {
    let value = input.trim().to_lowercase();
    value.contains('@').then_some(value)
}

/// Keep only ASCII digits; fewer than [`MIN_PHONE_DIGITS`] is not a phone.
pub fn normalize_phone(input: &str) -> Option<String> {
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    (digits.len() >= MIN_PHONE_DIGITS).then_some(digits)
}

const LABEL_SYNONYMS: [(&str, &str); 6] = [
    ("linked-in", "linkedin"),
    ("linked in", "linkedin"),
    ("empresa atual", "empresa_atual"),
    ("e-mail", "email"),
    ("head line", "headline"),
    ("head-line", "headline"),
];

/// Fold a free-form label ("E-mail", "Empresa Atual", "Linked In") into a
/// `[a-z0-9_]` token. Shared by the text parser and directory header resolution.
pub fn normalize_label(label: &str) -> String {
    let mut folded = label.to_lowercase().trim().to_string();
    for (from, to) in LABEL_SYNONYMS {
        if folded.contains(from) {
            folded = folded.replace(from, to);
        }
    }
    folded
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRICKY_URLS: &[&str] = &[
        "linkedin.com/in/jdoe/",
        "www.linkedin.com/in/jdoe",
        "  https://LinkedIn.com/in/Jane-Doe?trk=public#about ",
        "http://www.linkedin.com/in/a//",
        "Perfil: https://www.linkedin.com/in/x-y) e mais",
        "linkedin.com/in/x y",
        "LINKEDIN.COM/in/upper.",
        "https://linkedin.com",
        "https://linkedin.com/",
        "https://linkedin.com/)",
        "abc /",
        "x.;,/ /",
        "https://www.linkedin.com/in/x./",
        "https://br.linkedin.com/in/regional",
        "not a url at all",
        "/in/handle?",
    ];

    #[test]
    fn profile_url_examples() {
        assert_eq!(
            normalize_profile_url("linkedin.com/in/jdoe/").as_deref(),
            Some("https://www.linkedin.com/in/jdoe")
        );
        assert_eq!(
            normalize_profile_url("  https://LinkedIn.com/in/Jane-Doe?trk=public#about ").as_deref(),
            Some("https://www.linkedin.com/in/Jane-Doe")
        );
        assert_eq!(
            normalize_profile_url("Perfil: https://www.linkedin.com/in/x-y) e mais").as_deref(),
            Some("https://www.linkedin.com/in/x-y")
        );
        assert_eq!(
            normalize_profile_url("www.linkedin.com/in/jdoe;").as_deref(),
            Some("https://www.linkedin.com/in/jdoe")
        );
        assert_eq!(
            normalize_profile_url("linkedin.com/in/x y").as_deref(),
            Some("https://www.linkedin.com/in/x")
        );
    }

    #[test]
    fn profile_url_blank_is_none() {
        assert_eq!(normalize_profile_url(""), None);
        assert_eq!(normalize_profile_url("   "), None);
        assert_eq!(normalize_profile_url("?utm=1"), None);
        assert_eq!(normalize_profile_url("//"), None);
    }

    #[test]
    fn profile_url_normalization_is_idempotent() {
        for input in TRICKY_URLS {
            let once = normalize_profile_url(input);
            let twice = once.as_deref().and_then(normalize_profile_url);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email(" A@B.com ").as_deref(), Some("a@b.com"));
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email(""), None);
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(41) 99999-1234").as_deref(), Some("41999991234"));
        assert_eq!(normalize_phone("+55 41 3333-4444").as_deref(), Some("554133334444"));
        assert_eq!(normalize_phone("1234"), None);
        assert_eq!(normalize_phone("1234-567"), None);
        assert_eq!(normalize_phone("1234-5678").as_deref(), Some("12345678"));
    }

    #[test]
    fn label_folding() {
        assert_eq!(normalize_label("  LinkedIn "), "linkedin");
        assert_eq!(normalize_label("Linked In"), "linkedin");
        assert_eq!(normalize_label("Linked-in"), "linkedin");
        assert_eq!(normalize_label("Empresa Atual"), "empresa_atual");
        assert_eq!(normalize_label("E-mail"), "email");
        assert_eq!(normalize_label("Head Line"), "headline");
        assert_eq!(normalize_label("Celular com DDD"), "celularcomddd");
        assert_eq!(normalize_label("celular_com_ddd"), "celular_com_ddd");
        assert_eq!(normalize_label("Posição"), "posio");
    }

    #[test]
    fn sanitized_drops_blank_values() {
        let p = Participant {
            name: Some("  Jane ".into()),
            email: Some("   ".into()),
            ..Default::default()
        }
        .sanitized();
        assert_eq!(p.name.as_deref(), Some("Jane"));
        assert_eq!(p.email, None);
    }

    #[test]
    fn participant_serializes_with_all_seven_keys() {
        let value = serde_json::to_value(Participant::default()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), Participant::FIELDS.len());
        for key in Participant::FIELDS {
            assert!(obj.get(key).unwrap().is_null());
        }
        assert_eq!(
            serde_json::to_string(&MatchStatus::NoLinkedin).unwrap(),
            "\"no_linkedin\""
        );
    }
}
