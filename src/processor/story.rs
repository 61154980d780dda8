//! Story generation processor.
//!
//! Turns a finished chat analysis into a story: load the analysis, ask the AI
//! backend for a story, persist it. The backend is external and reached
//! through [`StoryBackend`]; each call is retried in-process under the
//! matching category policy before the task-level retry budget is touched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::{TaskContext, TaskProcessor};
use crate::config::RetryConfig;
use crate::error::{FableError, FableResult};
use crate::retry::{ErrorCategory, with_retry};
use crate::task::{TaskResult, TaskType};

/// Most characters a story request may name
pub const MAX_CHARACTERS: usize = 10;

/// Seconds added to the estimate per named character
const SECS_PER_CHARACTER: u64 = 5;

/// Requested story length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryLength {
    /// A few paragraphs
    Short,
    /// Default
    #[default]
    Medium,
    /// Multi-chapter
    Long,
}

impl StoryLength {
    /// Base processing estimate in seconds
    pub fn base_secs(&self) -> u64 {
        match self {
            StoryLength::Short => 30,
            StoryLength::Medium => 60,
            StoryLength::Long => 120,
        }
    }
}

/// Payload of a STORY_GENERATION task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRequest {
    /// Analysis the story is based on
    pub analysis_id: Uuid,
    /// Narrative style, e.g. "noir"
    pub style: String,
    /// Story length
    #[serde(default)]
    pub length: StoryLength,
    /// Characters to feature
    #[serde(default)]
    pub characters: Vec<String>,
    /// Output language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Prompt template override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<String>,
}

impl StoryRequest {
    /// Parse and check a raw payload
    pub fn parse(payload: &Value) -> FableResult<Self> {
        let request: StoryRequest = serde_json::from_value(payload.clone())
            .map_err(|e| FableError::validation(format!("invalid story request: {e}")))?;

        if request.style.trim().is_empty() {
            return Err(FableError::validation("style must not be empty"));
        }
        if request.characters.len() > MAX_CHARACTERS {
            return Err(FableError::validation(format!(
                "at most {MAX_CHARACTERS} characters allowed, got {}",
                request.characters.len()
            )));
        }
        if request.characters.iter().any(|c| c.trim().is_empty()) {
            return Err(FableError::validation("character names must not be empty"));
        }
        Ok(request)
    }

    /// Estimated processing time in seconds
    pub fn estimate_secs(&self) -> u64 {
        self.length.base_secs() + SECS_PER_CHARACTER * self.characters.len() as u64
    }
}

/// Story produced by the AI backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedStory {
    /// Title
    pub title: String,
    /// Full text
    pub content: String,
    /// Tokens consumed, when the provider reports it
    pub tokens_used: Option<u32>,
}

impl GeneratedStory {
    /// Whitespace-separated word count of the content
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

/// Failures reported by a [`StoryBackend`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoryBackendError {
    /// Referenced resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Request rejected as malformed
    #[error("invalid input: {0}")]
    InvalidRequest(String),
    /// Dependency temporarily unavailable
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// Anything else; classified by message
    #[error("{0}")]
    Other(String),
}

impl StoryBackendError {
    /// Explicit retryability hint for the task result
    pub fn retry_hint(&self) -> Option<bool> {
        match self {
            StoryBackendError::NotFound(_) | StoryBackendError::InvalidRequest(_) => Some(false),
            StoryBackendError::Unavailable(_) => Some(true),
            StoryBackendError::Other(_) => None,
        }
    }
}

/// Analysis lookup, AI generation and story persistence
#[async_trait]
pub trait StoryBackend: Send + Sync {
    /// Load the analysis a story is based on
    async fn load_analysis(
        &self,
        owner_id: &str,
        analysis_id: Uuid,
    ) -> Result<Value, StoryBackendError>;

    /// Generate a story from an analysis
    async fn generate(
        &self,
        request: &StoryRequest,
        analysis: &Value,
    ) -> Result<GeneratedStory, StoryBackendError>;

    /// Persist a story; returns its id
    async fn save_story(
        &self,
        owner_id: &str,
        request: &StoryRequest,
        story: &GeneratedStory,
    ) -> Result<Uuid, StoryBackendError>;
}

/// Processor for [`TaskType::StoryGeneration`]
pub struct StoryGenerationProcessor {
    backend: Arc<dyn StoryBackend>,
    retry: RetryConfig,
}

impl StoryGenerationProcessor {
    /// Processor over `backend` with default retry policies
    pub fn new(backend: Arc<dyn StoryBackend>) -> Self {
        Self {
            backend,
            retry: RetryConfig::default(),
        }
    }

    /// Use `retry` for in-process backend retries
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn backend_failure(task: &TaskContext, stage: &str, error: StoryBackendError) -> TaskResult {
        tracing::warn!(task_id = %task.task_id, stage, "story backend failed: {}", error);
        let result = TaskResult::failure(error.to_string());
        match error.retry_hint() {
            Some(retryable) => result.with_retryable(retryable),
            None => result,
        }
    }
}

#[async_trait]
impl TaskProcessor for StoryGenerationProcessor {
    fn task_type(&self) -> TaskType {
        TaskType::StoryGeneration
    }

    fn validate_payload(&self, payload: &Value) -> FableResult<()> {
        StoryRequest::parse(payload).map(|_| ())
    }

    fn estimate_time(&self, payload: &Value) -> u64 {
        StoryRequest::parse(payload)
            .map(|r| r.estimate_secs())
            .unwrap_or_else(|_| StoryLength::default().base_secs())
    }

    async fn process(&self, ctx: TaskContext, payload: Value) -> TaskResult {
        let request = match StoryRequest::parse(&payload) {
            Ok(request) => request,
            Err(e) => return TaskResult::permanent_failure(e.to_string()),
        };
        let backend = &self.backend;
        let owner_id = ctx.owner_id.as_str();
        let db_policy = self.retry.policy_for(ErrorCategory::Database);
        let ai_policy = self.retry.policy_for(ErrorCategory::AiService);

        ctx.report_progress(10, "loading analysis").await;
        let analysis_id = request.analysis_id;
        let analysis = match with_retry(db_policy, ErrorCategory::Database, move |_| {
            backend.load_analysis(owner_id, analysis_id)
        })
        .await
        {
            Ok(analysis) => analysis,
            Err(e) => return Self::backend_failure(&ctx, "load_analysis", e),
        };

        if ctx.is_canceled().await {
            return TaskResult::permanent_failure("canceled by user");
        }

        ctx.report_progress(30, "generating story").await;
        let (req, analysis_ref) = (&request, &analysis);
        let story = match with_retry(ai_policy, ErrorCategory::AiService, move |_| {
            backend.generate(req, analysis_ref)
        })
        .await
        {
            Ok(story) => story,
            Err(e) => return Self::backend_failure(&ctx, "generate", e),
        };

        if ctx.is_canceled().await {
            return TaskResult::permanent_failure("canceled by user");
        }

        ctx.report_progress(80, "saving story").await;
        let story_ref = &story;
        let story_id = match with_retry(db_policy, ErrorCategory::Database, move |_| {
            backend.save_story(owner_id, req, story_ref)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => return Self::backend_failure(&ctx, "save_story", e),
        };

        tracing::info!(task_id = %ctx.task_id, %story_id, "story generated");
        TaskResult::success(json!({
            "storyId": story_id,
            "title": story.title,
            "wordCount": story.word_count(),
            "tokensUsed": story.tokens_used,
        }))
    }
}
