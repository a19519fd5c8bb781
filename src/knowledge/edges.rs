//! Typed directed weighted edges between heterogeneous graph nodes, with
//! bounded BFS neighbor and path queries.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::errors::{Result, TxError};
use crate::knowledge::model::{
    CreateEdgeInput, Direction, Edge, NodeKind, BUILTIN_EDGE_TYPES,
};

/// A graph node key: kind + id.
pub type NodeRef = (NodeKind, String);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborHit {
    pub node_kind: NodeKind,
    pub node_id: String,
    /// Hop count from the origin (1-based).
    pub depth: u32,
    /// Weight of the edge that first reached this node.
    pub weight: f64,
    /// Traversal direction of that edge relative to the origin side.
    pub direction: Direction,
    pub edge_type: String,
    pub via_edge_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NeighborOptions {
    /// Upper bound on hops (default 1).
    pub depth: Option<u32>,
    pub direction: Option<Direction>,
    pub edge_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct EdgePatch {
    pub weight: Option<f64>,
    pub metadata: Option<Value>,
}

#[derive(Clone)]
pub struct EdgeService {
    pool: SqlitePool,
    allowed_types: Vec<String>,
}

impl EdgeService {
    pub fn new(pool: SqlitePool, extra_edge_types: &[String]) -> Self {
        let mut allowed_types: Vec<String> =
            BUILTIN_EDGE_TYPES.iter().map(|s| s.to_string()).collect();
        for extra in extra_edge_types {
            if !allowed_types.iter().any(|t| t == extra) {
                allowed_types.push(extra.clone());
            }
        }
        Self {
            pool,
            allowed_types,
        }
    }

    pub fn allowed_types(&self) -> &[String] {
        &self.allowed_types
    }

    fn check_type(&self, edge_type: &str) -> Result<()> {
        if self.allowed_types.iter().any(|t| t == edge_type) {
            Ok(())
        } else {
            Err(TxError::validation(
                "edgeType",
                format!("unknown edge type: {edge_type}"),
            ))
        }
    }

    fn check_weight(weight: f64) -> Result<()> {
        if weight > 0.0 && weight <= 1.0 {
            Ok(())
        } else {
            Err(TxError::validation("weight", "must be within (0, 1]"))
        }
    }

    // ─── CRUD ─────────────────────────────────────────────────────────────────

    /// Duplicate (type, source, target) triples are permitted; the caller
    /// decides their semantics.
    pub async fn create_edge(&self, input: CreateEdgeInput) -> Result<Edge> {
        self.check_type(&input.edge_type)?;
        let weight = input.weight.unwrap_or(1.0);
        Self::check_weight(weight)?;

        let result = sqlx::query(
            "INSERT INTO edges
             (source_kind, source_id, target_kind, target_id, edge_type, weight, metadata, valid, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(input.source_kind)
        .bind(&input.source_id)
        .bind(input.target_kind)
        .bind(&input.target_id)
        .bind(&input.edge_type)
        .bind(weight)
        .bind(input.metadata.map(|v| v.to_string()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<Edge> {
        sqlx::query_as("SELECT * FROM edges WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TxError::EdgeNotFound { id })
    }

    /// Soft delete. Invalidated edges drop out of every query.
    pub async fn invalidate_edge(&self, id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE edges SET valid = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::EdgeNotFound { id });
        }
        Ok(())
    }

    /// Weight and metadata may change; endpoints and type never do.
    pub async fn update(&self, id: i64, patch: EdgePatch) -> Result<Edge> {
        let mut edge = self.get(id).await?;
        if let Some(weight) = patch.weight {
            Self::check_weight(weight)?;
            edge.weight = weight;
        }
        if let Some(metadata) = patch.metadata {
            edge.metadata = Some(metadata.to_string());
        }
        sqlx::query("UPDATE edges SET weight = ?, metadata = ? WHERE id = ?")
            .bind(edge.weight)
            .bind(&edge.metadata)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get(id).await
    }

    // ─── Flat queries ─────────────────────────────────────────────────────────

    pub async fn find_by_type(&self, edge_type: &str) -> Result<Vec<Edge>> {
        Ok(
            sqlx::query_as("SELECT * FROM edges WHERE edge_type = ? AND valid = 1 ORDER BY id ASC")
                .bind(edge_type)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn find_from_source(&self, kind: NodeKind, id: &str) -> Result<Vec<Edge>> {
        Ok(sqlx::query_as(
            "SELECT * FROM edges WHERE source_kind = ? AND source_id = ? AND valid = 1 ORDER BY id ASC",
        )
        .bind(kind)
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_to_target(&self, kind: NodeKind, id: &str) -> Result<Vec<Edge>> {
        Ok(sqlx::query_as(
            "SELECT * FROM edges WHERE target_kind = ? AND target_id = ? AND valid = 1 ORDER BY id ASC",
        )
        .bind(kind)
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn count_by_type(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT edge_type, COUNT(*) FROM edges WHERE valid = 1 GROUP BY edge_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    // ─── Traversal ────────────────────────────────────────────────────────────

    /// Batch-load the valid edges touching any node in `frontier`, honoring
    /// direction and the optional type filter.
    pub(crate) async fn edges_for_frontier(
        &self,
        frontier: &[NodeRef],
        direction: Direction,
        edge_types: Option<&[String]>,
    ) -> Result<Vec<Edge>> {
        if frontier.is_empty() {
            return Ok(Vec::new());
        }

        let node_clause = |column: &str| {
            let pairs = vec![format!("({column}_kind = ? AND {column}_id = ?)"); frontier.len()];
            format!("({})", pairs.join(" OR "))
        };
        let side = match direction {
            Direction::Outgoing => node_clause("source"),
            Direction::Incoming => node_clause("target"),
            Direction::Both => format!("({} OR {})", node_clause("source"), node_clause("target")),
        };

        let type_clause = match edge_types {
            Some(types) if !types.is_empty() => {
                format!(
                    " AND edge_type IN ({})",
                    vec!["?"; types.len()].join(",")
                )
            }
            _ => String::new(),
        };

        let sql =
            format!("SELECT * FROM edges WHERE valid = 1 AND {side}{type_clause} ORDER BY id ASC");
        let mut query = sqlx::query_as::<_, Edge>(&sql);
        let sides = match direction {
            Direction::Both => 2,
            _ => 1,
        };
        for _ in 0..sides {
            for (kind, id) in frontier {
                query = query.bind(*kind).bind(id.clone());
            }
        }
        if let Some(types) = edge_types {
            for t in types {
                query = query.bind(t.clone());
            }
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Bounded BFS from a node. Each reachable node is yielded once, at the
    /// depth it was first seen; cycles are cut by the visited set.
    pub async fn find_neighbors(
        &self,
        kind: NodeKind,
        id: &str,
        options: NeighborOptions,
    ) -> Result<Vec<NeighborHit>> {
        let depth = options.depth.unwrap_or(1).min(10);
        let direction = options.direction.unwrap_or(Direction::Both);
        if let Some(ref types) = options.edge_types {
            for t in types {
                self.check_type(t)?;
            }
        }

        let origin: NodeRef = (kind, id.to_string());
        let mut visited: HashSet<NodeRef> = HashSet::from([origin.clone()]);
        let mut frontier: Vec<NodeRef> = vec![origin];
        let mut hits: Vec<NeighborHit> = Vec::new();

        for hop in 1..=depth {
            let edges = self
                .edges_for_frontier(&frontier, direction, options.edge_types.as_deref())
                .await?;
            let mut next: Vec<NodeRef> = Vec::new();

            for edge in edges {
                let source: NodeRef = (edge.source_kind, edge.source_id.clone());
                let target: NodeRef = (edge.target_kind, edge.target_id.clone());

                let (node, dir) = if frontier.contains(&source) {
                    (target, Direction::Outgoing)
                } else {
                    (source, Direction::Incoming)
                };
                if matches!(direction, Direction::Outgoing) && dir == Direction::Incoming {
                    continue;
                }
                if matches!(direction, Direction::Incoming) && dir == Direction::Outgoing {
                    continue;
                }
                if !visited.insert(node.clone()) {
                    continue;
                }
                hits.push(NeighborHit {
                    node_kind: node.0,
                    node_id: node.1.clone(),
                    depth: hop,
                    weight: edge.weight,
                    direction: dir,
                    edge_type: edge.edge_type.clone(),
                    via_edge_id: edge.id,
                });
                next.push(node);
            }

            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        Ok(hits)
    }

    /// First path (in BFS order) between two nodes, as the list of edges
    /// walked, or `None` when unreachable within `max_depth` hops.
    pub async fn find_path(
        &self,
        src_kind: NodeKind,
        src_id: &str,
        dst_kind: NodeKind,
        dst_id: &str,
        max_depth: u32,
    ) -> Result<Option<Vec<Edge>>> {
        let src: NodeRef = (src_kind, src_id.to_string());
        let dst: NodeRef = (dst_kind, dst_id.to_string());
        if src == dst {
            return Ok(Some(Vec::new()));
        }

        let max_depth = max_depth.min(10);
        let mut visited: HashSet<NodeRef> = HashSet::from([src.clone()]);
        let mut parents: HashMap<NodeRef, (NodeRef, Edge)> = HashMap::new();
        let mut queue: VecDeque<NodeRef> = VecDeque::from([src.clone()]);
        let mut frontier: Vec<NodeRef> = vec![src];

        for _ in 0..max_depth {
            let edges = self
                .edges_for_frontier(&frontier, Direction::Both, None)
                .await?;
            let mut next: Vec<NodeRef> = Vec::new();

            // Process frontier nodes in BFS order for deterministic ties.
            while let Some(node) = queue.pop_front() {
                for edge in edges.iter().filter(|e| {
                    (e.source_kind, e.source_id.as_str()) == (node.0, node.1.as_str())
                        || (e.target_kind, e.target_id.as_str()) == (node.0, node.1.as_str())
                }) {
                    let source: NodeRef = (edge.source_kind, edge.source_id.clone());
                    let target: NodeRef = (edge.target_kind, edge.target_id.clone());
                    let other = if source == node { target } else { source };
                    if !visited.insert(other.clone()) {
                        continue;
                    }
                    parents.insert(other.clone(), (node.clone(), edge.clone()));
                    if other == dst {
                        return Ok(Some(Self::unwind_path(&parents, &dst)));
                    }
                    next.push(other);
                }
            }

            if next.is_empty() {
                break;
            }
            queue = next.iter().cloned().collect();
            frontier = next;
        }

        Ok(None)
    }

    fn unwind_path(parents: &HashMap<NodeRef, (NodeRef, Edge)>, dst: &NodeRef) -> Vec<Edge> {
        let mut path = Vec::new();
        let mut cursor = dst.clone();
        while let Some((prev, edge)) = parents.get(&cursor) {
            path.push(edge.clone());
            cursor = prev.clone();
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn mk() -> (EdgeService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();
        (EdgeService::new(storage.pool(), &[]), dir)
    }

    fn edge(
        src: (&str, NodeKind),
        dst: (&str, NodeKind),
        edge_type: &str,
        weight: f64,
    ) -> CreateEdgeInput {
        CreateEdgeInput {
            source_kind: src.1,
            source_id: src.0.to_string(),
            target_kind: dst.1,
            target_id: dst.0.to_string(),
            edge_type: edge_type.to_string(),
            weight: Some(weight),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn create_validates_type_and_weight() {
        let (edges, _dir) = mk().await;
        assert!(matches!(
            edges
                .create_edge(edge(
                    ("1", NodeKind::Learning),
                    ("2", NodeKind::Learning),
                    "MADE_UP",
                    1.0
                ))
                .await
                .unwrap_err(),
            TxError::Validation { .. }
        ));
        assert!(edges
            .create_edge(edge(
                ("1", NodeKind::Learning),
                ("2", NodeKind::Learning),
                "SIMILAR_TO",
                0.0
            ))
            .await
            .is_err());
        assert!(edges
            .create_edge(edge(
                ("1", NodeKind::Learning),
                ("2", NodeKind::Learning),
                "SIMILAR_TO",
                1.1
            ))
            .await
            .is_err());

        let created = edges
            .create_edge(edge(
                ("1", NodeKind::Learning),
                ("2", NodeKind::Learning),
                "SIMILAR_TO",
                0.5,
            ))
            .await
            .unwrap();
        assert_eq!(created.weight, 0.5);
        assert!(created.valid);
    }

    #[tokio::test]
    async fn extra_types_extend_the_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();
        let edges = EdgeService::new(storage.pool(), &["REVIEWED_IN".to_string()]);
        edges
            .create_edge(edge(
                ("1", NodeKind::Learning),
                ("run-aaaa0001", NodeKind::Run),
                "REVIEWED_IN",
                1.0,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicates_are_permitted() {
        let (edges, _dir) = mk().await;
        for _ in 0..2 {
            edges
                .create_edge(edge(
                    ("1", NodeKind::Learning),
                    ("2", NodeKind::Learning),
                    "LINKS_TO",
                    1.0,
                ))
                .await
                .unwrap();
        }
        assert_eq!(edges.find_by_type("LINKS_TO").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalidated_edges_drop_out_of_queries() {
        let (edges, _dir) = mk().await;
        let created = edges
            .create_edge(edge(
                ("1", NodeKind::Learning),
                ("2", NodeKind::Learning),
                "LINKS_TO",
                1.0,
            ))
            .await
            .unwrap();
        edges.invalidate_edge(created.id).await.unwrap();

        assert!(edges.find_by_type("LINKS_TO").await.unwrap().is_empty());
        assert!(edges
            .find_neighbors(NodeKind::Learning, "1", NeighborOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn update_changes_weight_but_not_endpoints() {
        let (edges, _dir) = mk().await;
        let created = edges
            .create_edge(edge(
                ("1", NodeKind::Learning),
                ("2", NodeKind::Learning),
                "LINKS_TO",
                1.0,
            ))
            .await
            .unwrap();
        let updated = edges
            .update(
                created.id,
                EdgePatch {
                    weight: Some(0.25),
                    metadata: Some(serde_json::json!({"note": "weak"})),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.weight, 0.25);
        assert_eq!(updated.source_id, "1");
    }

    #[tokio::test]
    async fn neighbors_bfs_visits_each_node_once_with_depth() {
        let (edges, _dir) = mk().await;
        // 1 -> 2 -> 3, plus a back edge 3 -> 1 to form a cycle.
        edges
            .create_edge(edge(("1", NodeKind::Learning), ("2", NodeKind::Learning), "LINKS_TO", 0.9))
            .await
            .unwrap();
        edges
            .create_edge(edge(("2", NodeKind::Learning), ("3", NodeKind::Learning), "LINKS_TO", 0.8))
            .await
            .unwrap();
        edges
            .create_edge(edge(("3", NodeKind::Learning), ("1", NodeKind::Learning), "LINKS_TO", 0.7))
            .await
            .unwrap();

        let hits = edges
            .find_neighbors(
                NodeKind::Learning,
                "1",
                NeighborOptions {
                    depth: Some(5),
                    direction: Some(Direction::Both),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let ids: HashSet<&str> = hits.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["2", "3"]));
        // 3 is reachable at hop 1 via the back edge (bidirectional BFS).
        for hit in hits {
            assert!(hit.depth >= 1 && hit.depth <= 5);
        }
    }

    #[tokio::test]
    async fn outgoing_direction_ignores_incoming_edges() {
        let (edges, _dir) = mk().await;
        edges
            .create_edge(edge(("1", NodeKind::Learning), ("2", NodeKind::Learning), "LINKS_TO", 1.0))
            .await
            .unwrap();
        edges
            .create_edge(edge(("3", NodeKind::Learning), ("1", NodeKind::Learning), "LINKS_TO", 1.0))
            .await
            .unwrap();

        let hits = edges
            .find_neighbors(
                NodeKind::Learning,
                "1",
                NeighborOptions {
                    direction: Some(Direction::Outgoing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node_id, "2");
        assert_eq!(hits[0].direction, Direction::Outgoing);
    }

    #[tokio::test]
    async fn path_is_found_and_unwound_in_order() {
        let (edges, _dir) = mk().await;
        edges
            .create_edge(edge(("a", NodeKind::File), ("b", NodeKind::File), "IMPORTS", 1.0))
            .await
            .unwrap();
        edges
            .create_edge(edge(("b", NodeKind::File), ("c", NodeKind::File), "IMPORTS", 1.0))
            .await
            .unwrap();

        let path = edges
            .find_path(NodeKind::File, "a", NodeKind::File, "c", 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].source_id, "a");
        assert_eq!(path[1].target_id, "c");

        assert!(edges
            .find_path(NodeKind::File, "a", NodeKind::Task, "tx-none", 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn count_by_type_groups_valid_edges() {
        let (edges, _dir) = mk().await;
        edges
            .create_edge(edge(("1", NodeKind::Learning), ("f", NodeKind::File), "ANCHORED_TO", 1.0))
            .await
            .unwrap();
        edges
            .create_edge(edge(("2", NodeKind::Learning), ("f", NodeKind::File), "ANCHORED_TO", 1.0))
            .await
            .unwrap();
        let counts = edges.count_by_type().await.unwrap();
        assert_eq!(counts.get("ANCHORED_TO"), Some(&2));
    }
}
