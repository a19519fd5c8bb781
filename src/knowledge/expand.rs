//! Bounded weighted graph expansion from seed learnings or files.
//!
//! BFS layer by layer, bidirectionally over valid edges. Every newly
//! discovered learning is scored `parentScore * edgeWeight * decayFactor`
//! and remembers the edge that first reached it plus the full id path back
//! to its seed. Expansion stops when the depth budget is spent, `maxNodes`
//! is reached, or the frontier empties.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::errors::{Result, TxError};
use crate::knowledge::edges::EdgeService;
use crate::knowledge::model::{Direction, Edge, Learning, NodeKind};

pub const DEFAULT_DEPTH: u32 = 2;
pub const DEFAULT_DECAY: f64 = 0.7;
pub const DEFAULT_MAX_NODES: usize = 100;
const MAX_DEPTH: u32 = 10;

// ─── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EdgeTypeFilter {
    /// Plain allow-list.
    Flat(Vec<String>),
    Structured(StructuredFilter),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredFilter {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    /// Per-hop overrides; the hop's filter replaces the base filter.
    pub per_hop: Option<HashMap<u32, EdgeTypeFilter>>,
}

impl EdgeTypeFilter {
    pub fn validate(&self) -> Result<()> {
        match self {
            EdgeTypeFilter::Flat(_) => Ok(()),
            EdgeTypeFilter::Structured(s) => {
                if let (Some(include), Some(exclude)) = (&s.include, &s.exclude) {
                    if include.iter().any(|t| exclude.contains(t)) {
                        return Err(TxError::validation(
                            "edgeTypes",
                            "include and exclude overlap",
                        ));
                    }
                }
                if let Some(per_hop) = &s.per_hop {
                    for filter in per_hop.values() {
                        filter.validate()?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Does this filter admit `edge_type` at `hop` (1-based)?
    pub fn permits(&self, hop: u32, edge_type: &str) -> bool {
        match self {
            EdgeTypeFilter::Flat(allowed) => allowed.iter().any(|t| t == edge_type),
            EdgeTypeFilter::Structured(s) => {
                if let Some(per_hop) = &s.per_hop {
                    if let Some(filter) = per_hop.get(&hop) {
                        return filter.permits(hop, edge_type);
                    }
                }
                if let Some(exclude) = &s.exclude {
                    if exclude.iter().any(|t| t == edge_type) {
                        return false;
                    }
                }
                match &s.include {
                    Some(include) => include.iter().any(|t| t == edge_type),
                    None => true,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandOptions {
    pub depth: Option<u32>,
    pub decay_factor: Option<f64>,
    pub max_nodes: Option<usize>,
    pub edge_types: Option<EdgeTypeFilter>,
}

struct ResolvedOptions {
    depth: u32,
    decay: f64,
    max_nodes: usize,
    filter: Option<EdgeTypeFilter>,
}

impl ExpandOptions {
    fn resolve(self) -> Result<ResolvedOptions> {
        let depth = self.depth.unwrap_or(DEFAULT_DEPTH);
        if depth > MAX_DEPTH {
            return Err(TxError::validation("depth", "must be within [0, 10]"));
        }
        let decay = self.decay_factor.unwrap_or(DEFAULT_DECAY);
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(TxError::validation("decayFactor", "must be within (0, 1]"));
        }
        let max_nodes = self.max_nodes.unwrap_or(DEFAULT_MAX_NODES);
        if max_nodes < 1 {
            return Err(TxError::validation("maxNodes", "must be at least 1"));
        }
        if let Some(ref filter) = self.edge_types {
            filter.validate()?;
        }
        Ok(ResolvedOptions {
            depth,
            decay,
            max_nodes,
            filter: self.edge_types,
        })
    }
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedLearning {
    pub learning_id: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedLearning {
    pub learning: Learning,
    /// Decayed score relative to its seed.
    pub decayed_score: f64,
    /// Hops from the seed (1-based; 0 for file-anchored hop-0 hits).
    pub depth: u32,
    /// The edge that first reached this learning (`None` for hop-0
    /// file-anchored hits, which carry no traversal weight).
    pub source_edge: Option<Edge>,
    /// Learning ids from the seed to this node, seed first.
    pub path: Vec<i64>,
}

// ─── Service ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GraphExpansion {
    pool: SqlitePool,
    edges: EdgeService,
}

impl GraphExpansion {
    pub fn new(pool: SqlitePool, edges: EdgeService) -> Self {
        Self { pool, edges }
    }

    /// Expand from seed learnings through learning↔learning edges.
    pub async fn expand(
        &self,
        seeds: &[SeedLearning],
        options: ExpandOptions,
    ) -> Result<Vec<ExpandedLearning>> {
        let options = options.resolve()?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        // Seeds must exist; a dangling seed id is a caller error.
        for seed in seeds {
            self.load_learning(seed.learning_id).await?;
        }

        let mut visited: HashSet<i64> = seeds.iter().map(|s| s.learning_id).collect();
        // (learning id, score, path back to seed)
        let mut frontier: Vec<(i64, f64, Vec<i64>)> = seeds
            .iter()
            .map(|s| (s.learning_id, s.score, vec![s.learning_id]))
            .collect();
        let mut found: Vec<ExpandedLearning> = Vec::new();

        for hop in 1..=options.depth {
            if frontier.is_empty() || found.len() >= options.max_nodes {
                break;
            }

            let refs: Vec<(NodeKind, String)> = frontier
                .iter()
                .map(|(id, _, _)| (NodeKind::Learning, id.to_string()))
                .collect();
            let edges = self
                .edges
                .edges_for_frontier(&refs, Direction::Both, None)
                .await?;

            let by_id: HashMap<i64, (f64, Vec<i64>)> = frontier
                .iter()
                .map(|(id, score, path)| (*id, (*score, path.clone())))
                .collect();
            let mut next: Vec<(i64, f64, Vec<i64>)> = Vec::new();

            for edge in edges {
                if let Some(ref filter) = options.filter {
                    if !filter.permits(hop, &edge.edge_type) {
                        continue;
                    }
                }
                // Only learning endpoints participate in seed expansion.
                let endpoints = [
                    (edge.source_kind, edge.source_id.as_str()),
                    (edge.target_kind, edge.target_id.as_str()),
                ];
                let parsed: Vec<Option<i64>> = endpoints
                    .iter()
                    .map(|(kind, id)| {
                        if *kind == NodeKind::Learning {
                            id.parse::<i64>().ok()
                        } else {
                            None
                        }
                    })
                    .collect();
                let (Some(a), Some(b)) = (parsed[0], parsed[1]) else {
                    continue;
                };

                let (parent, child) = if by_id.contains_key(&a) && !visited.contains(&b) {
                    (a, b)
                } else if by_id.contains_key(&b) && !visited.contains(&a) {
                    (b, a)
                } else {
                    continue;
                };

                let (parent_score, parent_path) = &by_id[&parent];
                let decayed = parent_score * edge.weight * options.decay;
                let mut path = parent_path.clone();
                path.push(child);

                visited.insert(child);
                let learning = self.load_learning(child).await?;
                found.push(ExpandedLearning {
                    learning,
                    decayed_score: decayed,
                    depth: hop,
                    source_edge: Some(edge),
                    path: path.clone(),
                });
                next.push((child, decayed, path));

                if found.len() >= options.max_nodes {
                    break;
                }
            }

            frontier = next;
        }

        found.sort_by(|a, b| {
            b.decayed_score
                .partial_cmp(&a.decayed_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.learning.id.cmp(&b.learning.id))
        });
        found.truncate(options.max_nodes);
        Ok(found)
    }

    /// Expand from files: hop 0 collects learnings `ANCHORED_TO` the input
    /// files; subsequent hops walk `IMPORTS` / `CO_CHANGES_WITH` edges
    /// between files, picking up each newly reached file's anchored
    /// learnings at the decayed file score.
    pub async fn expand_from_files(
        &self,
        files: &[String],
        options: ExpandOptions,
    ) -> Result<Vec<ExpandedLearning>> {
        let options = options.resolve()?;
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let mut visited_files: HashSet<String> = files.iter().cloned().collect();
        let mut visited_learnings: HashSet<i64> = HashSet::new();
        let mut anchored_hits: Vec<ExpandedLearning> = Vec::new();
        let mut hop_hits: Vec<ExpandedLearning> = Vec::new();

        // Hop 0: learnings anchored to the input files, score 1.0, no edge
        // weight applied.
        for file in files {
            for (learning_id, _edge) in self.anchored_learnings(file).await? {
                if !visited_learnings.insert(learning_id) {
                    continue;
                }
                let learning = self.load_learning(learning_id).await?;
                anchored_hits.push(ExpandedLearning {
                    learning,
                    decayed_score: 1.0,
                    depth: 0,
                    source_edge: None,
                    path: vec![learning_id],
                });
            }
        }

        // File-to-file hops.
        let mut frontier: Vec<(String, f64)> =
            files.iter().map(|f| (f.clone(), 1.0)).collect();
        let file_edge_types = ["IMPORTS".to_string(), "CO_CHANGES_WITH".to_string()];

        for hop in 1..=options.depth {
            if frontier.is_empty() {
                break;
            }
            if anchored_hits.len() + hop_hits.len() >= options.max_nodes {
                break;
            }

            let refs: Vec<(NodeKind, String)> = frontier
                .iter()
                .map(|(f, _)| (NodeKind::File, f.clone()))
                .collect();
            let edges = self
                .edges
                .edges_for_frontier(&refs, Direction::Both, Some(&file_edge_types))
                .await?;

            let by_file: HashMap<String, f64> = frontier.iter().cloned().collect();
            let mut next: Vec<(String, f64)> = Vec::new();

            for edge in edges {
                if edge.source_kind != NodeKind::File || edge.target_kind != NodeKind::File {
                    continue;
                }
                let (parent, child) = if by_file.contains_key(&edge.source_id)
                    && !visited_files.contains(&edge.target_id)
                {
                    (edge.source_id.clone(), edge.target_id.clone())
                } else if by_file.contains_key(&edge.target_id)
                    && !visited_files.contains(&edge.source_id)
                {
                    (edge.target_id.clone(), edge.source_id.clone())
                } else {
                    continue;
                };

                let score = by_file[&parent] * edge.weight * options.decay;
                visited_files.insert(child.clone());

                for (learning_id, anchor_edge) in self.anchored_learnings(&child).await? {
                    if !visited_learnings.insert(learning_id) {
                        continue;
                    }
                    let learning = self.load_learning(learning_id).await?;
                    hop_hits.push(ExpandedLearning {
                        learning,
                        decayed_score: score,
                        depth: hop,
                        source_edge: Some(anchor_edge),
                        path: vec![learning_id],
                    });
                }
                next.push((child, score));
            }

            frontier = next;
        }

        // Anchored (hop 0) learnings take priority when over budget.
        let sort_desc = |hits: &mut Vec<ExpandedLearning>| {
            hits.sort_by(|a, b| {
                b.decayed_score
                    .partial_cmp(&a.decayed_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.learning.id.cmp(&b.learning.id))
            });
        };
        sort_desc(&mut anchored_hits);
        sort_desc(&mut hop_hits);

        let mut out = anchored_hits;
        out.extend(hop_hits);
        out.truncate(options.max_nodes);
        Ok(out)
    }

    /// (learning id, edge) pairs for learnings `ANCHORED_TO` a file, in
    /// either edge orientation.
    async fn anchored_learnings(&self, file: &str) -> Result<Vec<(i64, Edge)>> {
        let edges: Vec<Edge> = sqlx::query_as(
            "SELECT * FROM edges
             WHERE valid = 1 AND edge_type = 'ANCHORED_TO'
               AND ((target_kind = 'file' AND target_id = ? AND source_kind = 'learning')
                 OR (source_kind = 'file' AND source_id = ? AND target_kind = 'learning'))
             ORDER BY id ASC",
        )
        .bind(file)
        .bind(file)
        .fetch_all(&self.pool)
        .await?;

        Ok(edges
            .into_iter()
            .filter_map(|edge| {
                let learning_id = if edge.source_kind == NodeKind::Learning {
                    edge.source_id.parse::<i64>().ok()
                } else {
                    edge.target_id.parse::<i64>().ok()
                };
                learning_id.map(|id| (id, edge))
            })
            .collect())
    }

    async fn load_learning(&self, id: i64) -> Result<Learning> {
        sqlx::query_as("SELECT * FROM learnings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TxError::LearningNotFound { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use crate::knowledge::learnings::LearningStore;
    use crate::knowledge::model::{CreateEdgeInput, CreateLearningInput};
    use crate::llm::embeddings::NoopEmbedding;
    use crate::storage::Storage;
    use std::sync::Arc;

    struct Fixture {
        expansion: GraphExpansion,
        edges: EdgeService,
        learnings: LearningStore,
        _dir: tempfile::TempDir,
    }

    async fn mk() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();
        let edges = EdgeService::new(storage.pool(), &[]);
        Fixture {
            expansion: GraphExpansion::new(storage.pool(), edges.clone()),
            edges,
            learnings: LearningStore::new(
                storage.pool(),
                EventStore::new(storage.pool()),
                Arc::new(NoopEmbedding),
            ),
            _dir: dir,
        }
    }

    async fn learning(f: &Fixture, content: &str) -> i64 {
        f.learnings
            .create(CreateLearningInput {
                content: content.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    async fn link(f: &Fixture, a: i64, b: i64, edge_type: &str, weight: f64) {
        f.edges
            .create_edge(CreateEdgeInput {
                source_kind: NodeKind::Learning,
                source_id: a.to_string(),
                target_kind: NodeKind::Learning,
                target_id: b.to_string(),
                edge_type: edge_type.to_string(),
                weight: Some(weight),
                metadata: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_seeds_expand_to_nothing() {
        let f = mk().await;
        assert!(f
            .expansion
            .expand(&[], ExpandOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn decay_multiplies_along_the_path() {
        let f = mk().await;
        let l1 = learning(&f, "seed learning").await;
        let l2 = learning(&f, "one hop out").await;
        let l3 = learning(&f, "two hops out").await;
        link(&f, l1, l2, "SIMILAR_TO", 0.5).await;
        link(&f, l2, l3, "SIMILAR_TO", 0.4).await;

        let out = f
            .expansion
            .expand(
                &[SeedLearning {
                    learning_id: l1,
                    score: 1.0,
                }],
                ExpandOptions {
                    depth: Some(2),
                    decay_factor: Some(0.7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].learning.id, l2);
        assert!((out[0].decayed_score - 0.35).abs() < 1e-9);
        assert_eq!(out[1].learning.id, l3);
        assert!((out[1].decayed_score - 0.098).abs() < 1e-9);
        assert_eq!(out[1].path, vec![l1, l2, l3]);
        assert_eq!(out[1].depth, 2);
    }

    #[tokio::test]
    async fn depth_zero_returns_only_seeds_worth_of_nothing() {
        let f = mk().await;
        let l1 = learning(&f, "seed").await;
        let l2 = learning(&f, "neighbor").await;
        link(&f, l1, l2, "SIMILAR_TO", 1.0).await;

        let out = f
            .expansion
            .expand(
                &[SeedLearning {
                    learning_id: l1,
                    score: 1.0,
                }],
                ExpandOptions {
                    depth: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn max_nodes_one_returns_at_most_one() {
        let f = mk().await;
        let l1 = learning(&f, "seed").await;
        let l2 = learning(&f, "n2").await;
        let l3 = learning(&f, "n3").await;
        link(&f, l1, l2, "SIMILAR_TO", 1.0).await;
        link(&f, l1, l3, "SIMILAR_TO", 0.9).await;

        let out = f
            .expansion
            .expand(
                &[SeedLearning {
                    learning_id: l1,
                    score: 1.0,
                }],
                ExpandOptions {
                    max_nodes: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn no_duplicates_under_cycles() {
        let f = mk().await;
        let l1 = learning(&f, "a").await;
        let l2 = learning(&f, "b").await;
        link(&f, l1, l2, "SIMILAR_TO", 1.0).await;
        link(&f, l2, l1, "LINKS_TO", 1.0).await;

        let out = f
            .expansion
            .expand(
                &[SeedLearning {
                    learning_id: l1,
                    score: 1.0,
                }],
                ExpandOptions {
                    depth: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].learning.id, l2);
    }

    #[tokio::test]
    async fn conflicting_filter_is_rejected() {
        let f = mk().await;
        let err = f
            .expansion
            .expand(
                &[],
                ExpandOptions {
                    edge_types: Some(EdgeTypeFilter::Structured(StructuredFilter {
                        include: Some(vec!["SIMILAR_TO".into()]),
                        exclude: Some(vec!["SIMILAR_TO".into()]),
                        per_hop: None,
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::Validation { .. }));
    }

    #[tokio::test]
    async fn flat_filter_limits_traversal() {
        let f = mk().await;
        let l1 = learning(&f, "seed").await;
        let l2 = learning(&f, "similar").await;
        let l3 = learning(&f, "linked").await;
        link(&f, l1, l2, "SIMILAR_TO", 1.0).await;
        link(&f, l1, l3, "LINKS_TO", 1.0).await;

        let out = f
            .expansion
            .expand(
                &[SeedLearning {
                    learning_id: l1,
                    score: 1.0,
                }],
                ExpandOptions {
                    edge_types: Some(EdgeTypeFilter::Flat(vec!["SIMILAR_TO".into()])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].learning.id, l2);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let f = mk().await;
        for options in [
            ExpandOptions {
                depth: Some(11),
                ..Default::default()
            },
            ExpandOptions {
                decay_factor: Some(0.0),
                ..Default::default()
            },
            ExpandOptions {
                decay_factor: Some(1.5),
                ..Default::default()
            },
            ExpandOptions {
                max_nodes: Some(0),
                ..Default::default()
            },
        ] {
            assert!(f.expansion.expand(&[], options).await.is_err());
        }
    }

    async fn file_edge(f: &Fixture, a: &str, b: &str, edge_type: &str, weight: f64) {
        f.edges
            .create_edge(CreateEdgeInput {
                source_kind: NodeKind::File,
                source_id: a.to_string(),
                target_kind: NodeKind::File,
                target_id: b.to_string(),
                edge_type: edge_type.to_string(),
                weight: Some(weight),
                metadata: None,
            })
            .await
            .unwrap();
    }

    async fn anchor_edge(f: &Fixture, learning_id: i64, file: &str) {
        f.edges
            .create_edge(CreateEdgeInput {
                source_kind: NodeKind::Learning,
                source_id: learning_id.to_string(),
                target_kind: NodeKind::File,
                target_id: file.to_string(),
                edge_type: "ANCHORED_TO".to_string(),
                weight: Some(1.0),
                metadata: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn file_expansion_collects_anchored_then_imported() {
        let f = mk().await;
        let direct = learning(&f, "anchored to the entry file").await;
        let imported = learning(&f, "anchored to an import").await;
        anchor_edge(&f, direct, "src/main.rs").await;
        anchor_edge(&f, imported, "src/util.rs").await;
        file_edge(&f, "src/main.rs", "src/util.rs", "IMPORTS", 0.5).await;

        let out = f
            .expansion
            .expand_from_files(
                &["src/main.rs".to_string()],
                ExpandOptions {
                    decay_factor: Some(0.7),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        // Hop 0: anchored, full score, no traversal edge.
        assert_eq!(out[0].learning.id, direct);
        assert_eq!(out[0].decayed_score, 1.0);
        assert!(out[0].source_edge.is_none());
        // Hop 1: through the IMPORTS edge.
        assert_eq!(out[1].learning.id, imported);
        assert!((out[1].decayed_score - 0.35).abs() < 1e-9);
        assert_eq!(out[1].depth, 1);
        assert!(out[1].source_edge.is_some());
    }
}
