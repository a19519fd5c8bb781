//! Pluggable language-model facade.
//!
//! The engine never talks to a vendor SDK directly: hosts hand it an
//! implementation of [`LlmClient`], and every transport failure must arrive
//! wrapped as `LlmUnavailable` / `ExtractionUnavailable`. When nothing is
//! configured the [`NoopLlm`] fallback keeps the engine fully functional —
//! completion fails loudly, extraction degrades to zero candidates.

pub mod embeddings;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TxError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    /// When present, the backend is asked for schema-constrained JSON.
    pub json_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningCandidate {
    pub content: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub candidates: Vec<LearningCandidate>,
    pub source_chunk: String,
    pub was_extracted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;

    /// Pull learning candidates out of a transcript chunk.
    async fn extract(&self, chunk: &str) -> Result<Extraction>;

    fn is_available(&self) -> bool;
}

/// The mandatory fallback when no backend is configured.
pub struct NoopLlm;

#[async_trait]
impl LlmClient for NoopLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
        Err(TxError::LlmUnavailable {
            reason: "no llm backend configured".to_string(),
        })
    }

    async fn extract(&self, chunk: &str) -> Result<Extraction> {
        Ok(Extraction {
            candidates: Vec::new(),
            source_chunk: chunk.to_string(),
            was_extracted: false,
            metadata: None,
        })
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_complete_is_unavailable() {
        let err = NoopLlm
            .complete(CompletionRequest {
                prompt: "hello".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::LlmUnavailable { .. }));
        assert!(!NoopLlm.is_available());
    }

    #[tokio::test]
    async fn noop_extract_degrades_to_nothing() {
        let extraction = NoopLlm.extract("some transcript text").await.unwrap();
        assert!(extraction.candidates.is_empty());
        assert!(!extraction.was_extracted);
        assert_eq!(extraction.source_chunk, "some transcript text");
    }
}
