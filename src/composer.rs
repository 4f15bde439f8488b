//! Answer and summary composition.
//!
//! Fills the fixed prompts with a [`RetrievedContext`] and sends exactly one
//! generation request. A failed or timed-out request is retried once with
//! the same prompt before the error is surfaced. Empty contexts never reach
//! the backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::{GenerationConfig, RetryConfig};
use crate::error::BackendError;
use crate::generation::GenerationBackend;
use crate::retrieval::RetrievedContext;
use crate::retry::RetryPolicy;

pub const NO_CONTEXT_ANSWER: &str =
    "I couldn't find any relevant information to answer your question.";

/// Fixed summary text when nothing was indexed during the lookback window.
pub fn no_recent_notes(lookback_hours: u64) -> String {
    format!("No new or updated notes in the last {} hours.", lookback_hours)
}

pub fn qa_prompt(context: &str, question: &str) -> String {
    format!(
        "You are a helpful AI assistant that answers questions based on the provided context. \
Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\n\
Context:\n{context}\n\n\
Question: {question}\n\
Helpful Answer:"
    )
}

pub fn summary_prompt(context: &str) -> String {
    format!(
        "You are an expert at summarizing and synthesizing information. \
Your task is to create a concise, well-organized daily summary of the following notes.\n\n\
Focus on:\n\
1. Key themes and topics\n\
2. Important decisions or action items\n\
3. New information or insights\n\
4. Any follow-up needed\n\n\
Be concise but comprehensive. Use bullet points and organize by topic when possible.\n\n\
Notes to summarize:\n{context}\n\n\
Concise Daily Summary:"
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    /// False when the text was produced without calling the model.
    pub generated: bool,
}

/// Outcome of one summary job.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub text: String,
    pub generated: bool,
    /// Distinct notes that fed the summary.
    pub notes: usize,
    pub path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Composer {
    generator: Option<Arc<dyn GenerationBackend>>,
    policy: RetryPolicy,
    temperature: f32,
    summary_temperature: f32,
    summaries_dir: PathBuf,
}

impl Composer {
    pub fn new(
        generator: Option<Arc<dyn GenerationBackend>>,
        config: &GenerationConfig,
        retry: &RetryConfig,
        summaries_dir: impl Into<PathBuf>,
    ) -> Self {
        let policy = RetryPolicy::from_config(retry)
            .with_max_attempts(2)
            .with_predicate(|_| true)
            .with_timeout(Duration::from_secs(config.timeout_secs));
        Self {
            generator,
            policy,
            temperature: config.temperature,
            summary_temperature: config.summary_temperature,
            summaries_dir: summaries_dir.into(),
        }
    }

    pub async fn answer(
        &self,
        question: &str,
        context: &RetrievedContext,
    ) -> Result<Answer, BackendError> {
        if context.is_empty() {
            return Ok(fixed(NO_CONTEXT_ANSWER));
        }
        let Some(generator) = &self.generator else {
            return Ok(fixed(&sources_only(context)));
        };
        let prompt = qa_prompt(&context.context, question);
        let text = self
            .generate(generator.as_ref(), &prompt, self.temperature)
            .await?;
        Ok(Answer {
            text,
            generated: true,
        })
    }

    /// Summarize notes gathered over the last `lookback_hours`.
    pub async fn summarize(
        &self,
        context: &RetrievedContext,
        lookback_hours: u64,
    ) -> Result<Answer, BackendError> {
        if context.is_empty() {
            return Ok(fixed(&no_recent_notes(lookback_hours)));
        }
        let Some(generator) = &self.generator else {
            return Ok(fixed(&sources_only(context)));
        };
        let prompt = summary_prompt(&context.context);
        let text = self
            .generate(generator.as_ref(), &prompt, self.summary_temperature)
            .await?;
        Ok(Answer {
            text,
            generated: true,
        })
    }

    /// Write `summary_<timestamp>.md` under the summaries directory.
    pub fn save_summary(&self, text: &str, at: DateTime<Local>) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.summaries_dir).with_context(|| {
            format!(
                "Failed to create summaries directory {}",
                self.summaries_dir.display()
            )
        })?;
        let path = self
            .summaries_dir
            .join(format!("summary_{}.md", at.format("%Y-%m-%d_%H-%M-%S")));
        let body = format!("# Daily Summary - {}\n\n{}", at.format("%Y-%m-%d %H:%M"), text);
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write summary {}", path.display()))?;
        tracing::info!(path = %path.display(), "summary saved");
        Ok(path)
    }

    async fn generate(
        &self,
        generator: &dyn GenerationBackend,
        prompt: &str,
        temperature: f32,
    ) -> Result<String, BackendError> {
        self.policy
            .run("generation", move || generator.generate(prompt, temperature))
            .await
    }
}

fn fixed(text: &str) -> Answer {
    Answer {
        text: text.to_string(),
        generated: false,
    }
}

fn sources_only(context: &RetrievedContext) -> String {
    let mut out = String::from("Generation is disabled. Most relevant sources:");
    for passage in &context.passages {
        out.push_str(&format!("\n- {} (score {:.3})", passage.path, passage.score));
    }
    out
}
