//! Sanitization barrier.
//!
//! Sensitive payload content is masked in memory before anything is persisted.
//! The barrier is a registry of [`MaskingRule`]s, each pairing a [`Detector`]
//! with a [`MaskingPolicy`]. For every scalar in a record (nested objects and
//! arrays included) the first rule whose detector matches decides the masked
//! value; unmatched values pass through unchanged.
//!
//! A record that cannot be confidently masked (a detector fails, a policy
//! cannot be applied, or the value exceeds the scan limits) is rejected as a
//! whole. The rejected copy has every successfully detected field masked and
//! the failing field replaced by the redaction token, so raw sensitive data is
//! never handed to any writer.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use strata_core::Redacted;
use strata_table::Record;

use crate::config::SanitizationConfig;
use crate::error::{IngestError, Result};
use crate::metrics::record_masked_field;

/// Masked card prefix; only the trailing digits survive.
const CARD_MASK_PREFIX: &str = "XXXX-XXXX-XXXX-";

/// Most trailing characters a truncating mask may keep.
const MAX_KEEP_LAST: usize = 4;

/// Rule name reported when nesting exceeds the configured depth.
const DEPTH_LIMIT: &str = "max_depth";

/// Rule name reported when a string exceeds the configured size.
const SIZE_LIMIT: &str = "max_value_bytes";

/// A scalar value offered to a detector.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Full path of the value within the record (`a.b[2]`).
    pub path: &'a str,
    /// Nearest enclosing field name.
    pub field: &'a str,
    /// Value rendered as text (numbers and booleans in their JSON form).
    pub text: &'a str,
}

/// A detector could not decide whether a value is sensitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DetectionError {
    /// Why detection failed.
    pub message: String,
}

impl DetectionError {
    /// Creates a detection error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// User-supplied detector.
pub trait FieldDetector: Send + Sync + fmt::Debug {
    /// Returns whether `candidate` is sensitive.
    ///
    /// # Errors
    ///
    /// Returns an error when the value cannot be classified; the whole record
    /// is then quarantined.
    fn detect(&self, candidate: &Candidate<'_>) -> std::result::Result<bool, DetectionError>;
}

/// Toxic-data detectors.
#[derive(Debug, Clone)]
pub enum Detector {
    /// The whole value is a 13-16 digit card number that passes the Luhn
    /// checksum, optionally grouped by single spaces or dashes.
    CreditCard,
    /// The whole value looks like an email address.
    Email,
    /// The field name is in the set (compared lowercase).
    FieldName(BTreeSet<String>),
    /// The value text matches the regex.
    Pattern(Regex),
    /// Custom detector.
    Custom(Arc<dyn FieldDetector>),
}

impl Detector {
    /// Field-name detector; names are matched case-insensitively.
    #[must_use]
    pub fn field_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::FieldName(
            names
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }

    /// Regex detector.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::InvalidConfig`] if the regex does not compile.
    pub fn pattern(regex: &str) -> Result<Self> {
        Regex::new(regex)
            .map(Self::Pattern)
            .map_err(|e| IngestError::invalid_config(format!("invalid detector pattern: {e}")))
    }

    /// Wraps a custom detector.
    #[must_use]
    pub fn custom(detector: impl FieldDetector + 'static) -> Self {
        Self::Custom(Arc::new(detector))
    }

    /// Runs the detector over one scalar.
    ///
    /// # Errors
    ///
    /// Only custom detectors fail.
    pub fn detect(&self, candidate: &Candidate<'_>) -> std::result::Result<bool, DetectionError> {
        match self {
            Self::CreditCard => Ok(is_card_number(candidate.text)),
            Self::Email => Ok(is_email(candidate.text)),
            Self::FieldName(_) => Ok(self.matches_field(candidate.field)),
            Self::Pattern(regex) => Ok(regex.is_match(candidate.text)),
            Self::Custom(detector) => detector.detect(candidate),
        }
    }

    fn matches_field(&self, field: &str) -> bool {
        match self {
            Self::FieldName(names) => names.contains(&field.to_ascii_lowercase()),
            _ => false,
        }
    }
}

/// How a detected value is masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskingPolicy {
    /// Keep only the last `keep_last` (at most 4) characters. Card numbers are
    /// rendered `XXXX-XXXX-XXXX-dddd` regardless of their grouping.
    TruncateAndMask {
        /// Trailing characters to keep.
        keep_last: usize,
    },
    /// Replace the value with a fixed token.
    RedactToToken {
        /// Replacement token.
        token: String,
    },
    /// Replace the value with `sha256:` + hex(SHA-256(salt ‖ value)).
    OneWayHash,
}

/// A detector paired with its masking policy.
#[derive(Debug, Clone)]
pub struct MaskingRule {
    /// Rule name, reported in metrics and rejection reasons.
    pub name: String,
    /// What to look for.
    pub detector: Detector,
    /// How to mask it.
    pub policy: MaskingPolicy,
}

impl MaskingRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(name: impl Into<String>, detector: Detector, policy: MaskingPolicy) -> Self {
        Self {
            name: name.into(),
            detector,
            policy,
        }
    }
}

/// Why a record could not be confidently masked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field `{path}` could not be masked by `{rule}`: {message}")]
pub struct SanitizationFailure {
    /// Path of the failing value.
    pub path: String,
    /// Rule (or scan limit) that failed.
    pub rule: String,
    /// Details. Never contains the value itself.
    pub message: String,
}

/// A record rejected by the barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    /// Masked copy of the record with the failing value replaced by the
    /// redaction token.
    pub record: Record,
    /// First failure encountered.
    pub failure: SanitizationFailure,
}

/// Barrier output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizedBatch {
    /// Fully masked records, in input order.
    pub records: Vec<Record>,
    /// Records that must go to quarantine.
    pub rejected: Vec<Rejected>,
}

/// The masking registry plus scan limits.
#[derive(Clone)]
pub struct SanitizationBarrier {
    rules: Vec<MaskingRule>,
    salt: Option<Redacted<String>>,
    redaction_token: String,
    max_value_bytes: usize,
    max_depth: usize,
}

impl fmt::Debug for SanitizationBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SanitizationBarrier")
            .field(
                "rules",
                &self.rules.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            )
            .field("salt", &self.salt)
            .field("max_value_bytes", &self.max_value_bytes)
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ScanState {
    failure: Option<SanitizationFailure>,
}

impl SanitizationBarrier {
    /// Creates a barrier with no rules.
    #[must_use]
    pub fn new(config: &SanitizationConfig) -> Self {
        Self {
            rules: Vec::new(),
            salt: config.hash_salt.clone(),
            redaction_token: config.redaction_token.clone(),
            max_value_bytes: config.max_value_bytes,
            max_depth: config.max_depth,
        }
    }

    /// Creates a barrier with the standard registry:
    /// 1. configured sensitive field names are redacted
    /// 2. card numbers keep their last four digits
    /// 3. email addresses are hashed (redacted when no salt is configured)
    #[must_use]
    pub fn with_default_rules(config: &SanitizationConfig) -> Self {
        let email_policy = if config.hash_salt.is_some() {
            MaskingPolicy::OneWayHash
        } else {
            MaskingPolicy::RedactToToken {
                token: config.redaction_token.clone(),
            }
        };

        Self::new(config)
            .with_rule(MaskingRule::new(
                "sensitive_field",
                Detector::field_names(&config.sensitive_field_names),
                MaskingPolicy::RedactToToken {
                    token: config.redaction_token.clone(),
                },
            ))
            .with_rule(MaskingRule::new(
                "credit_card",
                Detector::CreditCard,
                MaskingPolicy::TruncateAndMask {
                    keep_last: MAX_KEEP_LAST,
                },
            ))
            .with_rule(MaskingRule::new("email", Detector::Email, email_policy))
    }

    /// Appends a rule; earlier rules take precedence.
    #[must_use]
    pub fn with_rule(mut self, rule: MaskingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Registered rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[MaskingRule] {
        &self.rules
    }

    /// Masks a batch.
    #[must_use]
    pub fn sanitize(&self, records: Vec<Record>) -> SanitizedBatch {
        let mut batch = SanitizedBatch::default();
        for record in records {
            match self.sanitize_record(record) {
                Ok(masked) => batch.records.push(masked),
                Err(rejected) => {
                    let rejected = *rejected;
                    tracing::warn!(
                        path = %rejected.failure.path,
                        rule = %rejected.failure.rule,
                        "record rejected by sanitization barrier"
                    );
                    batch.rejected.push(rejected);
                }
            }
        }
        batch
    }

    /// Masks one record.
    ///
    /// # Errors
    ///
    /// Returns the masked copy and the first failure when any value could not
    /// be confidently masked.
    pub fn sanitize_record(&self, record: Record) -> std::result::Result<Record, Box<Rejected>> {
        let mut state = ScanState::default();
        let masked: Record = record
            .into_iter()
            .map(|(key, value)| {
                let masked = self.mask_value(value, &key, &key, 1, &mut state);
                (key, masked)
            })
            .collect();

        match state.failure {
            None => Ok(masked),
            Some(failure) => Err(Box::new(Rejected {
                record: masked,
                failure,
            })),
        }
    }

    fn mask_value(
        &self,
        value: Value,
        path: &str,
        field: &str,
        depth: usize,
        state: &mut ScanState,
    ) -> Value {
        match value {
            Value::Null => Value::Null,
            Value::Object(_) | Value::Array(_) if depth >= self.max_depth => self.fail(
                state,
                path,
                DEPTH_LIMIT,
                format!("nesting exceeds {} levels", self.max_depth),
            ),
            Value::Object(map) => {
                if let Some(masked) = self.mask_container(&map, path, field, state) {
                    return masked;
                }
                Value::Object(
                    map.into_iter()
                        .map(|(key, child)| {
                            let child_path = format!("{path}.{key}");
                            let masked =
                                self.mask_value(child, &child_path, &key, depth + 1, state);
                            (key, masked)
                        })
                        .collect(),
                )
            }
            Value::Array(items) => {
                if let Some(masked) = self.mask_container(&items, path, field, state) {
                    return masked;
                }
                Value::Array(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(index, child)| {
                            let child_path = format!("{path}[{index}]");
                            self.mask_value(child, &child_path, field, depth + 1, state)
                        })
                        .collect(),
                )
            }
            Value::String(text) if text.len() > self.max_value_bytes => self.fail(
                state,
                path,
                SIZE_LIMIT,
                format!("value exceeds {} bytes", self.max_value_bytes),
            ),
            Value::String(text) => self
                .mask_scalar(&text, path, field, state)
                .unwrap_or(Value::String(text)),
            scalar @ (Value::Number(_) | Value::Bool(_)) => {
                let text = scalar.to_string();
                self.mask_scalar(&text, path, field, state)
                    .unwrap_or(scalar)
            }
        }
    }

    /// Containers under a sensitive field name are masked whole.
    fn mask_container<T: serde::Serialize>(
        &self,
        container: &T,
        path: &str,
        field: &str,
        state: &mut ScanState,
    ) -> Option<Value> {
        let rule = self.rules.iter().find(|rule| rule.detector.matches_field(field))?;
        let text = match serde_json::to_string(container) {
            Ok(text) => text,
            Err(e) => return Some(self.fail(state, path, &rule.name, e.to_string())),
        };
        Some(self.apply_rule(rule, &text, path, state))
    }

    /// Returns `None` when no rule matches.
    fn mask_scalar(
        &self,
        text: &str,
        path: &str,
        field: &str,
        state: &mut ScanState,
    ) -> Option<Value> {
        let candidate = Candidate { path, field, text };
        for rule in &self.rules {
            match rule.detector.detect(&candidate) {
                Ok(false) => {}
                Ok(true) => return Some(self.apply_rule(rule, text, path, state)),
                Err(e) => return Some(self.fail(state, path, &rule.name, e.message)),
            }
        }
        None
    }

    fn apply_rule(&self, rule: &MaskingRule, text: &str, path: &str, state: &mut ScanState) -> Value {
        match self.apply_policy(&rule.policy, text) {
            Ok(masked) => {
                record_masked_field(&rule.name);
                Value::String(masked)
            }
            Err(message) => self.fail(state, path, &rule.name, message),
        }
    }

    fn apply_policy(&self, policy: &MaskingPolicy, text: &str) -> std::result::Result<String, String> {
        match policy {
            MaskingPolicy::TruncateAndMask { keep_last } => Ok(truncate_and_mask(text, *keep_last)),
            MaskingPolicy::RedactToToken { token } => Ok(token.clone()),
            MaskingPolicy::OneWayHash => {
                let salt = self
                    .salt
                    .as_ref()
                    .ok_or_else(|| "one-way hash requires a configured salt".to_string())?;
                let mut hasher = Sha256::new();
                hasher.update(salt.expose().as_bytes());
                hasher.update(text.as_bytes());
                Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
            }
        }
    }

    fn fail(&self, state: &mut ScanState, path: &str, rule: &str, message: String) -> Value {
        if state.failure.is_none() {
            state.failure = Some(SanitizationFailure {
                path: path.to_string(),
                rule: rule.to_string(),
                message,
            });
        }
        Value::String(self.redaction_token.clone())
    }
}

/// Returns true if the whole value is a 13-16 digit card number with a valid
/// Luhn check digit. Digits may be grouped by single spaces or dashes.
///
/// The checksum keeps 13-digit epoch-millisecond timestamps and similar ids
/// from being masked as cards.
#[must_use]
pub fn is_card_number(text: &str) -> bool {
    is_card_shaped(text) && luhn_valid(text)
}

fn is_card_shaped(text: &str) -> bool {
    let mut digits = 0_usize;
    let mut after_separator = true;
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits += 1;
            after_separator = false;
        } else if (c == ' ' || c == '-') && !after_separator {
            after_separator = true;
        } else {
            return false;
        }
    }
    !after_separator && (13..=16).contains(&digits)
}

fn luhn_valid(text: &str) -> bool {
    let sum: u32 = text
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| match (i % 2 == 1, d * 2) {
            (true, doubled) if doubled > 9 => doubled - 9,
            (true, doubled) => doubled,
            (false, _) => d,
        })
        .sum();
    sum % 10 == 0
}

fn is_email(text: &str) -> bool {
    let Some((local, domain)) = text.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !text.chars().any(char::is_whitespace)
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

fn truncate_and_mask(text: &str, keep_last: usize) -> String {
    let keep = keep_last.min(MAX_KEEP_LAST);

    if is_card_shaped(text) {
        let digits: Vec<char> = text.chars().filter(char::is_ascii_digit).collect();
        let tail: String = digits[digits.len() - keep..].iter().collect();
        return format!("{CARD_MASK_PREFIX}{}{tail}", "X".repeat(MAX_KEEP_LAST - keep));
    }

    let chars: Vec<char> = text.chars().collect();
    let keep = keep.min(chars.len());
    let split = chars.len() - keep;
    let mut masked = "X".repeat(split);
    masked.extend(&chars[split..]);
    masked
}
