//! Knowledge graph data model: learnings, anchors, edges.

use serde::{Deserialize, Serialize};

use crate::jsontext;

// ─── Learnings ────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LearningSource {
    Compaction,
    Run,
    Manual,
    ClaudeMd,
}

/// An append-only insight. Content never mutates after insert; only the
/// usage counters and embedding move.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learning {
    pub id: i64,
    pub content: String,
    pub source_type: LearningSource,
    pub source_ref: Option<String>,
    #[serde(with = "jsontext::json_array")]
    pub keywords: String,
    pub category: Option<String>,
    pub usage_count: i64,
    pub last_used_at: Option<String>,
    pub outcome_score: f64,
    #[serde(skip)]
    pub embedding: Option<Vec<u8>>,
    pub run_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Learning {
    pub fn keyword_list(&self) -> Vec<String> {
        serde_json::from_str(&self.keywords).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLearningInput {
    pub content: String,
    pub source_type: Option<LearningSource>,
    pub source_ref: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub category: Option<String>,
    pub outcome_score: Option<f64>,
    pub run_id: Option<String>,
}

// ─── Anchors ──────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AnchorKind {
    Glob,
    Hash,
    Symbol,
    LineRange,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AnchorStatus {
    Valid,
    Drifted,
    Invalid,
}

/// A typed binding from a learning to a file location.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub id: i64,
    pub learning_id: i64,
    pub kind: AnchorKind,
    pub file_path: String,
    pub value: String,
    pub content_hash: Option<String>,
    pub symbol_fqname: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub status: AnchorStatus,
    pub created_at: String,
    pub updated_at: String,
    pub last_verified_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAnchorInput {
    pub learning_id: i64,
    pub kind: Option<AnchorKind>,
    pub file_path: String,
    pub value: String,
    pub symbol_fqname: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
}

// ─── Edges ────────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NodeKind {
    Learning,
    File,
    Run,
    Task,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Learning => "learning",
            NodeKind::File => "file",
            NodeKind::Run => "run",
            NodeKind::Task => "task",
        }
    }
}

/// The built-in edge vocabulary. Hosts may register more through
/// `EngineConfig::extra_edge_types`; the service validates against the
/// union.
pub const BUILTIN_EDGE_TYPES: &[&str] = &[
    "ANCHORED_TO",
    "DERIVED_FROM",
    "SIMILAR_TO",
    "LINKS_TO",
    "IMPORTS",
    "CO_CHANGES_WITH",
    "USED_IN_RUN",
];

/// A directed weighted typed relationship between two graph nodes.
/// Invalidation is a soft delete; queries filter on `valid`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: i64,
    pub source_kind: NodeKind,
    pub source_id: String,
    pub target_kind: NodeKind,
    pub target_id: String,
    pub edge_type: String,
    pub weight: f64,
    #[serde(with = "jsontext::json_opt")]
    pub metadata: Option<String>,
    pub valid: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEdgeInput {
    pub source_kind: NodeKind,
    pub source_id: String,
    pub target_kind: NodeKind,
    pub target_id: String,
    pub edge_type: String,
    pub weight: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}
