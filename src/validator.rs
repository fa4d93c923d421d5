//! Syntactic validation and injection detection for untrusted input.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::crypto;

pub const REQUIRED_HEADERS: &[&str] = &["x-request-id", "x-client-version", "x-platform"];
const REQUEST_ID_PREFIX: &str = "req_";
const REQUEST_ID_BYTES: usize = 16;

static ALLOWED_CHARACTERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[a-zA-Z0-9\s.,!?\-_'"]+$"#).expect("invalid regex"));

/// Named injection signatures, checked in order.
static INJECTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("script_tag", r"(?i)<\s*/?\s*script"),
        ("javascript_uri", r"(?i)javascript\s*:"),
        ("event_handler", r"(?i)\bon[a-z]+\s*="),
        ("code_eval", r"(?i)\b(eval|Function|setTimeout|setInterval)\s*\("),
        ("dom_access", r"(?i)\b(document|window)\s*\."),
        ("prototype_pollution", r"(?i)__proto__|\bconstructor\s*(\.|\[)"),
        ("unicode_escape", r"(?i)\\u00[0-9a-f]{2}"),
        ("sql_tautology", r#"(?i)['"]\s*(or|and)\s+['"\w]+\s*=\s*['"\w]+"#),
        (
            "sql_stacked_query",
            r"(?i);\s*(drop|delete|insert|update|select|alter|truncate|exec)\b",
        ),
        ("sql_union", r"(?i)\bunion\s+(all\s+)?select\b"),
        ("sql_comment", r"--\s|--$|/\*"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("invalid regex")))
    .collect()
});

/// key: validation-violation
#[derive(Clone, Debug, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Violation {
    #[error("input is empty")]
    Empty,
    #[error("input shorter than {min} characters")]
    TooShort { min: usize },
    #[error("input longer than {max} characters")]
    TooLong { max: usize, actual: usize },
    #[error("input contains disallowed characters")]
    DisallowedCharacters,
    #[error("injection attempt detected ({pattern})")]
    InjectionAttempt { pattern: &'static str },
    #[error("missing required header `{name}`")]
    MissingHeader { name: &'static str },
}

impl Violation {
    pub fn is_injection(&self) -> bool {
        matches!(self, Violation::InjectionAttempt { .. })
    }
}

/// Rejection and sanitization are independent: `sanitized` is always filled.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<Violation>,
    pub sanitized: String,
}

impl ValidationReport {
    pub fn has_injection(&self) -> bool {
        self.errors.iter().any(Violation::is_injection)
    }
}

#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_length: 1,
            max_length: 500,
        }
    }
}

/// key: request-validator
#[derive(Clone, Debug, Default)]
pub struct RequestValidator {
    config: ValidatorConfig,
}

impl RequestValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, input: &str) -> ValidationReport {
        let mut errors = Vec::new();
        let length = input.chars().count();

        if length == 0 {
            errors.push(Violation::Empty);
        } else {
            if length < self.config.min_length {
                errors.push(Violation::TooShort {
                    min: self.config.min_length,
                });
            }
            if length > self.config.max_length {
                errors.push(Violation::TooLong {
                    max: self.config.max_length,
                    actual: length,
                });
            }
            if !ALLOWED_CHARACTERS.is_match(input) {
                errors.push(Violation::DisallowedCharacters);
            }
        }

        errors.extend(
            detect_injection(input)
                .into_iter()
                .map(|pattern| Violation::InjectionAttempt { pattern }),
        );

        ValidationReport {
            is_valid: errors.is_empty(),
            errors,
            sanitized: sanitize(input),
        }
    }

    /// Header names are compared case-insensitively; empty values count as missing.
    pub fn validate_headers(&self, headers: &HashMap<String, String>) -> Vec<Violation> {
        REQUIRED_HEADERS
            .iter()
            .copied()
            .filter(|required| {
                !headers.iter().any(|(name, value)| {
                    name.eq_ignore_ascii_case(required) && !value.trim().is_empty()
                })
            })
            .map(|name| Violation::MissingHeader { name })
            .collect()
    }
}

/// Names of every injection signature present in `input`.
pub fn detect_injection(input: &str) -> Vec<&'static str> {
    INJECTION_PATTERNS
        .iter()
        .filter(|(_, pattern)| pattern.is_match(input))
        .map(|(name, _)| *name)
        .collect()
}

/// Drops angle brackets and HTML-escapes the remaining metacharacters.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '<' | '>' => {}
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out.trim().to_string()
}

pub fn generate_request_id() -> String {
    crypto::random_token(REQUEST_ID_PREFIX, REQUEST_ID_BYTES)
}
