//! Message-based error classification.
//!
//! Errors are matched case-insensitively against pattern tables in a fixed
//! precedence order: client-fault patterns first (never retried), then
//! transient patterns, then infrastructure keywords, and finally a fallback
//! arm that treats the unknown error as a retryable system fault.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::task::TaskType;

/// Category an error is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Caller could not be authenticated
    Authentication,
    /// Caller may not perform the operation
    Authorization,
    /// Malformed input
    Validation,
    /// Domain rule violated (e.g. resource missing)
    BusinessLogic,
    /// Third-party HTTP/API dependency
    ExternalService,
    /// Persistence layer
    Database,
    /// Transport-level failure
    Network,
    /// Unknown fault
    System,
    /// AI provider failure
    AiService,
    /// Failure specific to the task's own processing (e.g. story parsing)
    TaskSpecific,
}

impl ErrorCategory {
    /// Whether errors of this category are client faults
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Authentication | ErrorCategory::Authorization | ErrorCategory::Validation
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::Authorization => "AUTHORIZATION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::BusinessLogic => "BUSINESS_LOGIC",
            ErrorCategory::ExternalService => "EXTERNAL_SERVICE",
            ErrorCategory::Database => "DATABASE",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::System => "SYSTEM",
            ErrorCategory::AiService => "AI_SERVICE",
            ErrorCategory::TaskSpecific => "TASK_SPECIFIC",
        };
        f.write_str(name)
    }
}

/// How serious an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Expected, user-correctable
    Low,
    /// Transient
    Medium,
    /// Unknown or unexpected
    High,
    /// Needs operator attention
    Critical,
}

/// Result of classifying an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    /// Primary category
    pub category: ErrorCategory,
    /// Severity
    pub severity: ErrorSeverity,
    /// Whether another attempt may succeed
    pub retryable: bool,
}

impl ErrorClassification {
    fn new(category: ErrorCategory, severity: ErrorSeverity, retryable: bool) -> Self {
        Self {
            category,
            severity,
            retryable,
        }
    }
}

const NON_RETRYABLE: &[(&str, ErrorCategory)] = &[
    ("authentication", ErrorCategory::Authentication),
    ("unauthenticated", ErrorCategory::Authentication),
    ("unauthorized", ErrorCategory::Authentication),
    ("forbidden", ErrorCategory::Authorization),
    ("permission denied", ErrorCategory::Authorization),
    ("not found", ErrorCategory::BusinessLogic),
    ("not-found", ErrorCategory::BusinessLogic),
    ("invalid payload", ErrorCategory::Validation),
    ("invalid input", ErrorCategory::Validation),
    ("validation failed", ErrorCategory::Validation),
];

const RETRYABLE: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "temporary",
    "temporarily",
    "service unavailable",
    "connection",
    "network",
    "parsing",
    "parse error",
    "malformed",
    "quota",
    "throttl",
];

// Matched on word boundaries
const AI_KEYWORDS: &[&str] = &[
    "ai service",
    "ai provider",
    "openai",
    "anthropic",
    "llm",
    "model overloaded",
    "model unavailable",
    "chat completion",
    "completion request",
];

const DATABASE_KEYWORDS: &[&str] = &["database", "prisma", "deadlock", "sql", "query failed"];

const NETWORK_KEYWORDS: &[&str] = &[
    "connection",
    "network",
    "econnreset",
    "econnrefused",
    "socket",
    "dns",
];

const TASK_KEYWORDS: &[&str] = &["parsing", "parse error", "malformed"];

// Matched on word boundaries
const EXTERNAL_KEYWORDS: &[&str] = &[
    "service unavailable",
    "bad gateway",
    "upstream",
    "api error",
    "api request",
    "external api",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let is_word_char = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn contains_any_word(haystack: &str, words: &[&str]) -> bool {
    words.iter().any(|w| contains_word(haystack, w))
}

/// Pattern-based classifier with an explicit fallback arm.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create a classifier
    pub fn new() -> Self {
        Self
    }

    /// Classify an error message.
    ///
    /// `task_type` gives context for task-specific failures such as a story
    /// response that could not be parsed.
    pub fn classify(&self, message: &str, task_type: Option<TaskType>) -> ErrorClassification {
        let lower = message.to_lowercase();

        if let Some((_, category)) = NON_RETRYABLE.iter().find(|(p, _)| lower.contains(p)) {
            return ErrorClassification::new(*category, ErrorSeverity::Low, false);
        }

        let transient = contains_any(&lower, RETRYABLE);
        if let Some(category) = Self::infrastructure_category(&lower, task_type) {
            return ErrorClassification::new(category, ErrorSeverity::Medium, true);
        }
        if transient {
            return ErrorClassification::new(
                ErrorCategory::ExternalService,
                ErrorSeverity::Medium,
                true,
            );
        }

        ErrorClassification::new(ErrorCategory::System, ErrorSeverity::High, true)
    }

    /// Classify honoring an explicit processor hint.
    ///
    /// The hint decides retryability; the message still picks the category so
    /// the matching backoff policy applies.
    pub fn resolve(
        &self,
        message: &str,
        hint: Option<bool>,
        task_type: Option<TaskType>,
    ) -> ErrorClassification {
        let mut classification = self.classify(message, task_type);
        if let Some(retryable) = hint {
            classification.retryable = retryable;
            if !retryable && classification.severity > ErrorSeverity::Medium {
                classification.severity = ErrorSeverity::Medium;
            }
        }
        classification
    }

    fn infrastructure_category(lower: &str, task_type: Option<TaskType>) -> Option<ErrorCategory> {
        if contains_any_word(lower, AI_KEYWORDS) {
            Some(ErrorCategory::AiService)
        } else if contains_any(lower, DATABASE_KEYWORDS) {
            Some(ErrorCategory::Database)
        } else if contains_any(lower, NETWORK_KEYWORDS) {
            Some(ErrorCategory::Network)
        } else if task_type.is_some() && contains_any(lower, TASK_KEYWORDS) {
            Some(ErrorCategory::TaskSpecific)
        } else if contains_any_word(lower, EXTERNAL_KEYWORDS) {
            Some(ErrorCategory::ExternalService)
        } else {
            None
        }
    }
}
