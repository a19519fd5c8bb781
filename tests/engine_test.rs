//! End-to-end tests over the public engine surface.

use txd::config::EngineConfig;
use txd::errors::TxError;
use txd::knowledge::expand::{ExpandOptions, SeedLearning};
use txd::knowledge::model::{CreateEdgeInput, CreateLearningInput, NodeKind};
use txd::runs::heartbeat::{HeartbeatInput, ReapOptions, StallThresholds, REAPED_EXIT_CODE};
use txd::runs::model::{RunConfig, RunStatus};
use txd::tasks::model::{CreateTaskInput, TaskStatus, UpdateTaskPatch};
use txd::Engine;

async fn mk_engine() -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::init(EngineConfig::with_data_dir(dir.path().join(".tx")))
        .await
        .unwrap();
    (engine, dir)
}

async fn ready_task(engine: &Engine, title: &str) -> String {
    let view = engine
        .tasks
        .create(CreateTaskInput {
            title: title.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    engine
        .tasks
        .update(
            &view.task.id,
            UpdateTaskPatch {
                status: Some(TaskStatus::Ready),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    view.task.id
}

#[tokio::test]
async fn claim_race_has_one_winner_and_named_losers() {
    let (engine, _dir) = mk_engine().await;
    let task_id = ready_task(&engine, "contended").await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let claims = engine.claims.clone();
        let task_id = task_id.clone();
        handles.push(tokio::spawn(async move {
            claims.claim(&task_id, &format!("worker-{i}")).await
        }));
    }

    let mut winner: Option<String> = None;
    let mut loser_saw: Vec<String> = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(claim) => {
                assert!(winner.is_none(), "two claims succeeded");
                winner = Some(claim.worker_id);
            }
            Err(TxError::AlreadyClaimed { claimed_by, .. }) => loser_saw.push(claimed_by),
            Err(other) => panic!("unexpected claim error: {other:?}"),
        }
    }

    let winner = winner.expect("no claim won");
    assert_eq!(loser_saw.len(), 4);
    for seen in loser_saw {
        assert_eq!(seen, winner);
    }

    let history = engine.claims.claims_for_task(&task_id).await.unwrap();
    let active = history
        .iter()
        .filter(|c| c.status == txd::claims::ClaimStatus::Active)
        .count();
    assert_eq!(active, 1);
}

#[tokio::test]
async fn dependency_cycle_is_rejected_without_side_effects() {
    let (engine, _dir) = mk_engine().await;
    let a = ready_task(&engine, "a").await;
    let b = ready_task(&engine, "b").await;
    let c = ready_task(&engine, "c").await;

    // a blocks b, b blocks c.
    engine.deps.add_blocker(&b, &a).await.unwrap();
    engine.deps.add_blocker(&c, &b).await.unwrap();

    let err = engine.deps.add_blocker(&a, &c).await.unwrap_err();
    assert!(matches!(err, TxError::CircularDependency { .. }));

    // No edge was inserted: a still has no blockers.
    assert!(engine.deps.blockers(&a).await.unwrap().is_empty());
}

#[tokio::test]
async fn reap_with_reset_recovers_the_task() {
    let (engine, _dir) = mk_engine().await;
    let task_id = ready_task(&engine, "stalls").await;
    engine
        .tasks
        .update(
            &task_id,
            UpdateTaskPatch {
                status: Some(TaskStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let claim = engine.claims.claim(&task_id, "w1").await.unwrap();
    let run = engine
        .runs
        .start(RunConfig {
            agent: "claude".into(),
            task_id: Some(task_id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    // A heartbeat from ten minutes ago.
    let stale = (chrono::Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
    engine
        .heartbeats
        .heartbeat(HeartbeatInput {
            run_id: run.id.clone(),
            check_at: Some(stale.clone()),
            activity_at: Some(stale),
            ..Default::default()
        })
        .await
        .unwrap();

    let reaped = engine
        .heartbeats
        .reap_stalled(ReapOptions {
            thresholds: StallThresholds {
                transcript_idle_seconds: 300,
                heartbeat_lag_seconds: None,
            },
            reset_task: true,
            dry_run: false,
            terminate_processes: false,
        })
        .await
        .unwrap();

    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, run.id);
    assert_eq!(reaped[0].task_id.as_deref(), Some(task_id.as_str()));
    assert!(reaped[0].task_reset);

    let run = engine.runs.get(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.exit_code, Some(REAPED_EXIT_CODE));

    let task = engine.tasks.get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ready);

    let claim = engine.claims.get(claim.id).await.unwrap();
    assert_eq!(claim.status, txd::claims::ClaimStatus::Expired);
}

#[tokio::test]
async fn jsonl_replay_is_deterministic_across_fresh_databases() {
    let lines = [
        r#"{"v":1,"op":"upsert","ts":"2024-01-02T00:00:00Z","id":"tx-replay01","data":{"title":"middle","score":2}}"#,
        r#"{"v":1,"op":"upsert","ts":"2024-01-03T00:00:00Z","id":"tx-replay01","data":{"title":"final","score":3}}"#,
        r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-replay01","data":{"title":"first","score":1}}"#,
    ];

    let mut snapshots = Vec::new();
    for rotation in 0..3 {
        let (engine, dir) = mk_engine().await;
        // Same ops, different line order each time.
        let mut rotated: Vec<&str> = lines.to_vec();
        rotated.rotate_left(rotation);
        let path = dir.path().join("replay.jsonl");
        tokio::fs::write(&path, rotated.join("\n")).await.unwrap();

        engine.sync.import_tasks(Some(&path)).await.unwrap();

        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT id, title, score FROM tasks ORDER BY id")
                .fetch_all(&engine.storage.pool())
                .await
                .unwrap();
        snapshots.push(rows);
    }

    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[1], snapshots[2]);
    assert_eq!(
        snapshots[0],
        vec![("tx-replay01".to_string(), "final".to_string(), 3)]
    );
}

#[tokio::test]
async fn expansion_decays_scores_along_edges() {
    let (engine, _dir) = mk_engine().await;
    let mut ids = Vec::new();
    for content in ["seed", "middle", "far"] {
        ids.push(
            engine
                .learnings
                .create(CreateLearningInput {
                    content: content.to_string(),
                    ..Default::default()
                })
                .await
                .unwrap()
                .id,
        );
    }
    for (from, to, weight) in [(0usize, 1usize, 0.5f64), (1, 2, 0.4)] {
        engine
            .edges
            .create_edge(CreateEdgeInput {
                source_kind: NodeKind::Learning,
                source_id: ids[from].to_string(),
                target_kind: NodeKind::Learning,
                target_id: ids[to].to_string(),
                edge_type: "SIMILAR_TO".into(),
                weight: Some(weight),
                metadata: None,
            })
            .await
            .unwrap();
    }

    let out = engine
        .expansion
        .expand(
            &[SeedLearning {
                learning_id: ids[0],
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
    assert_eq!(out[0].learning.id, ids[1]);
    assert!((out[0].decayed_score - 0.35).abs() < 1e-9);
    assert_eq!(out[1].learning.id, ids[2]);
    assert!((out[1].decayed_score - 0.098).abs() < 1e-9);
}

#[tokio::test]
async fn self_referencing_parent_never_loops() {
    let (engine, _dir) = mk_engine().await;
    let id = ready_task(&engine, "ouroboros").await;
    sqlx::query("UPDATE tasks SET parent_id = id WHERE id = ?")
        .bind(&id)
        .execute(&engine.storage.pool())
        .await
        .unwrap();

    let tree = engine.hierarchy.get_tree(&id, None).await.unwrap();
    assert_eq!(tree.task.id, id);
    assert!(tree.children.is_empty());
    assert_eq!(engine.hierarchy.get_depth(&id).await.unwrap(), 0);
}

#[tokio::test]
async fn every_task_surface_returns_the_with_deps_shape() {
    let (engine, _dir) = mk_engine().await;
    let blocker = ready_task(&engine, "gate").await;
    let blocked = ready_task(&engine, "gated").await;
    engine.deps.add_blocker(&blocked, &blocker).await.unwrap();

    let view = engine.tasks.get_with_deps(&blocked).await.unwrap();
    let json = serde_json::to_value(&view).unwrap();
    for field in ["blockedBy", "blocks", "children", "isReady"] {
        assert!(json.get(field).is_some(), "missing field {field}");
    }
    assert_eq!(json["isReady"], false);
    assert_eq!(json["blockedBy"][0]["id"], blocker);

    let listed = engine
        .tasks
        .list_with_deps(&Default::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    let gate = listed.iter().find(|t| t.task.id == blocker).unwrap();
    assert!(gate.is_ready);
    assert_eq!(gate.blocks.len(), 1);

    // Completing the blocker flips readiness.
    for status in [TaskStatus::Active, TaskStatus::Done] {
        engine
            .tasks
            .update(
                &blocker,
                UpdateTaskPatch {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    let view = engine.tasks.get_with_deps(&blocked).await.unwrap();
    assert!(view.blocked_by.is_empty());
    assert!(view.is_ready);

    let ready = engine.ready.get_ready(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, blocked);
}

#[tokio::test]
async fn export_compact_import_preserves_state() {
    let (engine, dir) = mk_engine().await;
    let keep = ready_task(&engine, "keeper").await;
    let doomed = ready_task(&engine, "doomed").await;
    engine.tasks.remove(&doomed).await.unwrap();

    let path = dir.path().join("roundtrip.jsonl");
    engine.sync.export_tasks(Some(&path)).await.unwrap();
    engine.sync.compact(&path).await.unwrap();

    // Replay into a fresh engine.
    let (other, _other_dir) = mk_engine().await;
    let report = other.sync.import_tasks(Some(&path)).await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.parse_errors, 0);

    let restored = other.tasks.get(&keep).await.unwrap();
    assert_eq!(restored.title, "keeper");
    assert_eq!(restored.status, TaskStatus::Ready);
    assert!(other.tasks.get(&doomed).await.is_err());
}

#[tokio::test]
async fn noop_llm_degrades_gracefully() {
    let (engine, _dir) = mk_engine().await;
    let extraction = engine.llm.extract("transcript chunk").await.unwrap();
    assert!(!extraction.was_extracted);
    assert!(extraction.candidates.is_empty());

    let err = engine
        .llm
        .complete(txd::llm::CompletionRequest {
            prompt: "hi".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::LlmUnavailable { .. }));
}

#[tokio::test]
async fn migration_status_is_current_after_init() {
    let (engine, _dir) = mk_engine().await;
    let runner = txd::storage::migrations::MigrationRunner::new(engine.storage.pool());
    let status = runner.status().await.unwrap();
    assert!(status.is_current());
    assert_eq!(status.current, status.latest);
}
