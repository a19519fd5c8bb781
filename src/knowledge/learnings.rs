//! Append-only learning store with hybrid recall.
//!
//! Retrieval blends three signals: BM25 over the FTS5 mirror, cosine
//! similarity over stored embeddings, and a recency decay. Weights come
//! from the `learnings_config` table (0.4/0.4/0.2 by default) and
//! renormalize when the embedding backend is unavailable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::{Result, TxError};
use crate::events::{EventStore, EventType, NewEvent};
use crate::knowledge::model::{CreateLearningInput, Learning, LearningSource};
use crate::llm::embeddings::{
    cosine_similarity, decode_embedding, encode_embedding, EmbeddingProvider,
};

/// Recency half-life for the decay component, in days.
const RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

/// How many rows each retrieval channel contributes to the candidate pool.
const CANDIDATE_POOL: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecallWeights {
    pub fts: f64,
    pub vector: f64,
    pub recency: f64,
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self {
            fts: 0.4,
            vector: 0.4,
            recency: 0.2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    pub limit: Option<i64>,
    pub weights: Option<RecallWeights>,
    /// Bump `usage_count`/`last_used_at` on returned hits.
    pub record_usage: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallHit {
    #[serde(flatten)]
    pub learning: Learning,
    pub score: f64,
    pub fts_score: f64,
    pub vector_score: f64,
    pub recency_score: f64,
}

#[derive(Clone)]
pub struct LearningStore {
    pool: SqlitePool,
    events: EventStore,
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl LearningStore {
    pub fn new(
        pool: SqlitePool,
        events: EventStore,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            pool,
            events,
            embeddings,
        }
    }

    // ─── CRUD ─────────────────────────────────────────────────────────────────

    pub async fn create(&self, input: CreateLearningInput) -> Result<Learning> {
        let content = input.content.trim();
        if content.is_empty() {
            return Err(TxError::validation("content", "must not be empty"));
        }
        let keywords =
            serde_json::to_string(&input.keywords).unwrap_or_else(|_| "[]".to_string());
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "INSERT INTO learnings
             (content, source_type, source_ref, keywords, category, outcome_score,
              run_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(content)
        .bind(input.source_type.unwrap_or(LearningSource::Manual))
        .bind(&input.source_ref)
        .bind(&keywords)
        .bind(&input.category)
        .bind(input.outcome_score.unwrap_or(0.0))
        .bind(&input.run_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();

        let mut event = NewEvent::of(EventType::LearningCaptured).content(content);
        if let Some(ref run_id) = input.run_id {
            event = event.run(run_id);
        }
        self.events.append(event).await?;

        debug!(learning_id = id, "learning captured");
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Learning> {
        sqlx::query_as("SELECT * FROM learnings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TxError::LearningNotFound { id })
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Learning>> {
        Ok(
            sqlx::query_as("SELECT * FROM learnings ORDER BY created_at DESC, id DESC LIMIT ?")
                .bind(limit.min(1000))
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn all(&self) -> Result<Vec<Learning>> {
        Ok(
            sqlx::query_as("SELECT * FROM learnings ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Hard delete (sync tombstones only — normal flow never removes).
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM learnings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert-or-replace by id preserving caller timestamps (sync import).
    pub async fn upsert(&self, learning: &Learning) -> Result<()> {
        sqlx::query(
            "INSERT INTO learnings
             (id, content, source_type, source_ref, keywords, category, usage_count,
              last_used_at, outcome_score, embedding, run_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 source_type = excluded.source_type,
                 source_ref = excluded.source_ref,
                 keywords = excluded.keywords,
                 category = excluded.category,
                 usage_count = excluded.usage_count,
                 last_used_at = excluded.last_used_at,
                 outcome_score = excluded.outcome_score,
                 run_id = excluded.run_id,
                 updated_at = excluded.updated_at",
        )
        .bind(learning.id)
        .bind(&learning.content)
        .bind(learning.source_type)
        .bind(&learning.source_ref)
        .bind(&learning.keywords)
        .bind(&learning.category)
        .bind(learning.usage_count)
        .bind(&learning.last_used_at)
        .bind(learning.outcome_score)
        .bind(&learning.embedding)
        .bind(&learning.run_id)
        .bind(&learning.created_at)
        .bind(&learning.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_used(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE learnings SET usage_count = usage_count + 1, last_used_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::LearningNotFound { id });
        }
        Ok(())
    }

    /// Attach (or recompute) the embedding for a learning.
    pub async fn set_embedding(&self, id: i64, vector: &[f32]) -> Result<()> {
        let result = sqlx::query("UPDATE learnings SET embedding = ? WHERE id = ?")
            .bind(encode_embedding(vector))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::LearningNotFound { id });
        }
        Ok(())
    }

    // ─── Recall ───────────────────────────────────────────────────────────────

    pub async fn recall(&self, query: &str, options: RecallOptions) -> Result<Vec<RecallHit>> {
        let limit = options.limit.unwrap_or(10).clamp(1, 100) as usize;
        let weights = match options.weights {
            Some(w) => w,
            None => self.configured_weights().await?,
        };

        // BM25 channel.
        let fts_scores = match fts_match_expr(query) {
            Some(expr) => self.fts_scores(&expr).await?,
            None => HashMap::new(),
        };

        // Vector channel: degrade to weight 0 when the backend is missing.
        let query_vector = if self.embeddings.is_available() && weights.vector > 0.0 {
            match self.embeddings.embed(query).await {
                Ok(v) => Some(v),
                Err(TxError::EmbeddingUnavailable { .. }) => None,
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        let candidates = self.candidate_pool(&fts_scores, query_vector.is_some()).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Renormalize over the channels that are actually live.
        let vector_weight = if query_vector.is_some() {
            weights.vector
        } else {
            0.0
        };
        let total = weights.fts + vector_weight + weights.recency;
        let (w_fts, w_vec, w_rec) = if total > 0.0 {
            (
                weights.fts / total,
                vector_weight / total,
                weights.recency / total,
            )
        } else {
            (0.0, 0.0, 1.0)
        };

        let now = Utc::now();
        let mut hits: Vec<RecallHit> = candidates
            .into_iter()
            .map(|learning| {
                let fts_score = fts_scores.get(&learning.id).copied().unwrap_or(0.0);
                let vector_score = match (&query_vector, &learning.embedding) {
                    (Some(q), Some(blob)) => decode_embedding(blob)
                        .map(|v| (cosine_similarity(q, &v) as f64 + 1.0) / 2.0)
                        .unwrap_or(0.0),
                    _ => 0.0,
                };
                let recency_score = recency_decay(&learning.created_at, now);
                let score = w_fts * fts_score + w_vec * vector_score + w_rec * recency_score;
                RecallHit {
                    learning,
                    score,
                    fts_score,
                    vector_score,
                    recency_score,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.learning.id.cmp(&a.learning.id))
        });
        hits.truncate(limit);

        if options.record_usage {
            for hit in &hits {
                self.mark_used(hit.learning.id).await?;
            }
        }
        Ok(hits)
    }

    async fn fts_scores(&self, expr: &str) -> Result<HashMap<i64, f64>> {
        let rows: Vec<(i64, f64)> = sqlx::query_as(
            "SELECT rowid, bm25(learnings_fts) FROM learnings_fts
             WHERE learnings_fts MATCH ?
             ORDER BY bm25(learnings_fts) ASC
             LIMIT ?",
        )
        .bind(expr)
        .bind(CANDIDATE_POOL)
        .fetch_all(&self.pool)
        .await?;

        // bm25() is "smaller is better" (negative for good matches);
        // squash into (0, 1] with larger = better.
        Ok(rows
            .into_iter()
            .map(|(id, rank)| {
                let goodness = (-rank).max(0.0);
                (id, goodness / (1.0 + goodness))
            })
            .collect())
    }

    async fn candidate_pool(
        &self,
        fts_scores: &HashMap<i64, f64>,
        vector_live: bool,
    ) -> Result<Vec<Learning>> {
        let mut pool: HashMap<i64, Learning> = HashMap::new();

        if !fts_scores.is_empty() {
            let ids: Vec<i64> = fts_scores.keys().copied().collect();
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!("SELECT * FROM learnings WHERE id IN ({placeholders})");
            let mut query = sqlx::query_as::<_, Learning>(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            for learning in query.fetch_all(&self.pool).await? {
                pool.insert(learning.id, learning);
            }
        }

        if vector_live {
            let rows: Vec<Learning> = sqlx::query_as(
                "SELECT * FROM learnings WHERE embedding IS NOT NULL
                 ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(CANDIDATE_POOL)
            .fetch_all(&self.pool)
            .await?;
            for learning in rows {
                pool.entry(learning.id).or_insert(learning);
            }
        }

        if pool.is_empty() {
            // No text match and no vectors: fall back to recent learnings.
            let rows: Vec<Learning> = sqlx::query_as(
                "SELECT * FROM learnings ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(CANDIDATE_POOL)
            .fetch_all(&self.pool)
            .await?;
            for learning in rows {
                pool.insert(learning.id, learning);
            }
        }

        Ok(pool.into_values().collect())
    }

    // ─── Weights config ───────────────────────────────────────────────────────

    pub async fn configured_weights(&self) -> Result<RecallWeights> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM learnings_config")
                .fetch_all(&self.pool)
                .await?;
        let map: HashMap<String, String> = rows.into_iter().collect();
        let defaults = RecallWeights::default();
        let read = |key: &str, fallback: f64| {
            map.get(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v >= 0.0)
                .unwrap_or(fallback)
        };
        Ok(RecallWeights {
            fts: read("recall_weight_fts", defaults.fts),
            vector: read("recall_weight_vector", defaults.vector),
            recency: read("recall_weight_recency", defaults.recency),
        })
    }

    pub async fn set_weights(&self, weights: RecallWeights) -> Result<()> {
        for (key, value) in [
            ("recall_weight_fts", weights.fts),
            ("recall_weight_vector", weights.vector),
            ("recall_weight_recency", weights.recency),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TxError::validation(key, "must be within [0, 1]"));
            }
            sqlx::query(
                "INSERT INTO learnings_config (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

/// Exponential decay on age: 1.0 now, 0.5 after the half-life.
fn recency_decay(created_at: &str, now: DateTime<Utc>) -> f64 {
    let Ok(created) = DateTime::parse_from_rfc3339(created_at) else {
        return 0.0;
    };
    let age_days = (now - created.with_timezone(&Utc)).num_seconds().max(0) as f64 / 86_400.0;
    (-(age_days * std::f64::consts::LN_2 / RECENCY_HALF_LIFE_DAYS)).exp()
}

/// Build an FTS5 MATCH expression from free text: each token quoted,
/// OR-joined. `None` when the query has no usable tokens.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}
