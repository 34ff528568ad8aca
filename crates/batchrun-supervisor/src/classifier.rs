//! Failure classification.
//!
//! Maps a failed attempt (exit code plus diagnostic text) to a
//! [`FailureCategory`]. Anything unrecognised is `Permanent` so unknown
//! errors are never retried in a loop.

use batchrun_core::FailureCategory;
use regex::RegexSet;

use crate::config::{ClassifierConfig, ConfigError};

/// Shell-convention status (128 + 9) of a process killed with SIGKILL,
/// typically by the OOM killer.
const EXIT_SIGKILL: i32 = 137;

/// Decides the category of a failed attempt.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, exit_code: Option<i32>, diagnostic: &str) -> FailureCategory;
}

const RESOURCE_PATTERNS: &[&str] = &[
    r"(?i)out of memory",
    r"(?i)\boom\b",
    r"(?i)cannot allocate memory",
    r"(?i)memory allocation failed",
    r"(?i)no space left on device",
    r"(?i)disk (is )?full",
    r"(?i)disk quota exceeded",
    r"(?i)too many open files",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)rate[ _-]?limit",
    r"(?i)too many requests",
    r"\b429\b",
    r"(?i)\b50[234]\b",
    r"(?i)service unavailable",
    r"(?i)connection (refused|reset|closed|aborted)",
    r"(?i)econn(refused|reset)",
    r"(?i)broken pipe",
    r"(?i)network (is )?unreachable",
    r"(?i)temporary failure in name resolution",
    r"(?i)could not resolve host",
    r"(?i)timed? ?out",
    r"(?i)timeout",
    r"(?i)temporarily unavailable",
    r"(?i)overloaded",
];

/// Regex-driven classifier.
///
/// Rules are checked in the order permanent, resource, transient; the first
/// matching group wins. User-supplied patterns are combined with the
/// built-in ones.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    permanent: RegexSet,
    resource: RegexSet,
    transient: RegexSet,
}

impl PatternClassifier {
    /// Classifier with built-in rules only.
    pub fn new() -> Self {
        // The built-in patterns are literals checked by the tests below.
        Self::from_config(&ClassifierConfig::default())
            .unwrap_or_else(|e| unreachable!("built-in classifier patterns are invalid: {e}"))
    }

    /// Classifier with built-in rules plus the configured extras.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, ConfigError> {
        let build = |builtin: &[&str], extra: &[String]| {
            let patterns = builtin
                .iter()
                .map(|p| p.to_string())
                .chain(extra.iter().cloned());
            RegexSet::new(patterns).map_err(|e| ConfigError::Invalid(format!("classifier pattern: {e}")))
        };

        Ok(Self {
            permanent: build(&[], &config.permanent_patterns)?,
            resource: build(RESOURCE_PATTERNS, &config.resource_patterns)?,
            transient: build(TRANSIENT_PATTERNS, &config.transient_patterns)?,
        })
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, exit_code: Option<i32>, diagnostic: &str) -> FailureCategory {
        if self.permanent.is_match(diagnostic) {
            return FailureCategory::Permanent;
        }
        if self.resource.is_match(diagnostic) || exit_code == Some(EXIT_SIGKILL) {
            return FailureCategory::Resource;
        }
        if self.transient.is_match(diagnostic) {
            return FailureCategory::Transient;
        }
        FailureCategory::Permanent
    }
}
