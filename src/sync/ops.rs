//! JSONL op model: parse, validate, and last-writer-wins reduction.
//!
//! One JSON object per line. Consumers tolerate unknown fields, reject
//! unknown `op` tags and non-integer `v` values with a per-line error, and
//! never abort the whole file over a bad line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Current line format version.
pub const SYNC_FORMAT_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Upsert,
    Delete,
    DepAdd,
    DepRemove,
    LearningUpsert,
    FileLearningUpsert,
    AttemptUpsert,
}

impl OpKind {
    /// Tombstones disappear during compaction.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, OpKind::Delete | OpKind::DepRemove)
    }
}

/// One parsed line. Field order on disk is irrelevant; extra fields are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOp {
    pub v: i64,
    pub op: OpKind,
    pub ts: String,
    /// Entity id: a string for tasks, an integer for learnings and friends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_id: Option<String>,
}

impl SyncOp {
    pub fn upsert(op: OpKind, id: Value, ts: String, data: Value) -> Self {
        Self {
            v: SYNC_FORMAT_VERSION,
            op,
            ts,
            id: Some(id),
            data: Some(data),
            blocker_id: None,
            blocked_id: None,
        }
    }

    pub fn delete(id: Value, ts: String) -> Self {
        Self {
            v: SYNC_FORMAT_VERSION,
            op: OpKind::Delete,
            ts,
            id: Some(id),
            data: None,
            blocker_id: None,
            blocked_id: None,
        }
    }

    pub fn dep(op: OpKind, blocker_id: String, blocked_id: String, ts: String) -> Self {
        Self {
            v: SYNC_FORMAT_VERSION,
            op,
            ts,
            id: None,
            data: None,
            blocker_id: Some(blocker_id),
            blocked_id: Some(blocked_id),
        }
    }

    /// The entity id as a plain string (integer ids are rendered decimal).
    pub fn id_string(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn id_i64(&self) -> Option<i64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Reduction key: ops with the same key supersede each other.
    pub fn key(&self) -> Option<String> {
        match self.op {
            OpKind::DepAdd | OpKind::DepRemove => Some(format!(
                "dep:{}>{}",
                self.blocker_id.as_deref()?,
                self.blocked_id.as_deref()?
            )),
            _ => self.id_string(),
        }
    }

    pub fn parsed_ts(&self) -> Option<DateTime<Utc>> {
        parse_ts(&self.ts)
    }
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A line that failed to parse or validate, with its 1-based line number.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

/// Parse a whole file's worth of lines. Bad lines are reported, good lines
/// survive.
pub fn parse_lines(content: &str) -> (Vec<SyncOp>, Vec<ParseError>) {
    let mut ops = Vec::new();
    let mut errors = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(op) => ops.push(op),
            Err(reason) => errors.push(ParseError {
                line: index + 1,
                reason,
            }),
        }
    }
    (ops, errors)
}

fn parse_line(line: &str) -> Result<SyncOp, String> {
    let op: SyncOp = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if op.parsed_ts().is_none() {
        return Err(format!("invalid ts: {:?}", op.ts));
    }
    match op.op {
        OpKind::Upsert
        | OpKind::LearningUpsert
        | OpKind::FileLearningUpsert
        | OpKind::AttemptUpsert => {
            if op.id_string().is_none() {
                return Err("upsert requires an id".to_string());
            }
            if op.data.is_none() {
                return Err("upsert requires a data payload".to_string());
            }
        }
        OpKind::Delete => {
            if op.id_string().is_none() {
                return Err("delete requires an id".to_string());
            }
        }
        OpKind::DepAdd | OpKind::DepRemove => {
            if op.blocker_id.is_none() || op.blocked_id.is_none() {
                return Err("dep ops require blockerId and blockedId".to_string());
            }
            if op.blocker_id == op.blocked_id {
                return Err("dep op blockerId equals blockedId".to_string());
            }
        }
    }
    Ok(op)
}

/// Last-writer-wins reduction: one surviving op per key, greatest `ts`
/// wins. A ts tie is broken by the serialized op text so the outcome never
/// depends on line order.
pub fn reduce_ops(ops: Vec<SyncOp>) -> Vec<SyncOp> {
    let mut latest: HashMap<String, SyncOp> = HashMap::new();

    for op in ops {
        let Some(key) = op.key() else { continue };
        match latest.get(&key) {
            None => {
                latest.insert(key, op);
            }
            Some(existing) => {
                let keep_new = match (op.parsed_ts(), existing.parsed_ts()) {
                    (Some(new_ts), Some(old_ts)) if new_ts != old_ts => new_ts > old_ts,
                    _ => render(&op) > render(existing),
                };
                if keep_new {
                    latest.insert(key, op);
                }
            }
        }
    }

    let mut survivors: Vec<SyncOp> = latest.into_values().collect();
    sort_ops(&mut survivors);
    survivors
}

/// Ascending by ts, then a stable content tiebreak.
pub fn sort_ops(ops: &mut [SyncOp]) {
    ops.sort_by(|a, b| {
        let ta = a.parsed_ts();
        let tb = b.parsed_ts();
        ta.cmp(&tb).then_with(|| render(a).cmp(&render(b)))
    });
}

fn render(op: &SyncOp) -> String {
    serde_json::to_string(op).unwrap_or_default()
}

/// Serialize ops to file content: one JSON object per line, LF separated,
/// trailing newline iff non-empty.
pub fn render_file(ops: &[SyncOp]) -> String {
    if ops.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for op in ops {
        out.push_str(&render(op));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn upsert_line(id: &str, ts: &str, title: &str) -> String {
        format!(r#"{{"v":1,"op":"upsert","ts":"{ts}","id":"{id}","data":{{"title":"{title}"}}}}"#)
    }

    #[test]
    fn parses_valid_lines_and_reports_bad_ones() {
        let content = [
            upsert_line("tx-aaaa0001", "2024-01-01T00:00:00Z", "a"),
            "not json at all".to_string(),
            r#"{"v":"one","op":"upsert","ts":"2024-01-01T00:00:00Z","id":"x","data":{}}"#.to_string(),
            r#"{"v":1,"op":"frobnicate","ts":"2024-01-01T00:00:00Z","id":"x"}"#.to_string(),
            r#"{"v":1,"op":"delete","ts":"2024-01-01T00:00:00Z","id":"tx-aaaa0002"}"#.to_string(),
            r#"{"v":1,"op":"upsert","ts":"yesterday","id":"x","data":{}}"#.to_string(),
        ]
        .join("\n");

        let (ops, errors) = parse_lines(&content);
        assert_eq!(ops.len(), 2);
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0].line, 2);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let line = r#"{"v":1,"op":"delete","ts":"2024-01-01T00:00:00Z","id":"tx-x","futureField":42}"#;
        let (ops, errors) = parse_lines(line);
        assert_eq!(ops.len(), 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn reduce_keeps_greatest_ts_per_key() {
        let content = [
            upsert_line("tx-aaaa0001", "2024-01-02T00:00:00Z", "middle"),
            upsert_line("tx-aaaa0001", "2024-01-03T00:00:00Z", "latest"),
            upsert_line("tx-aaaa0001", "2024-01-01T00:00:00Z", "oldest"),
        ]
        .join("\n");
        let (ops, _) = parse_lines(&content);
        let reduced = reduce_ops(ops);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].data.as_ref().unwrap()["title"], "latest");
    }

    #[test]
    fn reduce_is_order_independent() {
        let lines = vec![
            upsert_line("tx-aaaa0001", "2024-01-01T00:00:00Z", "a"),
            upsert_line("tx-aaaa0001", "2024-01-03T00:00:00Z", "c"),
            upsert_line("tx-bbbb0002", "2024-01-02T00:00:00Z", "b"),
            r#"{"v":1,"op":"dep_add","ts":"2024-01-01T00:00:00Z","blockerId":"tx-aaaa0001","blockedId":"tx-bbbb0002"}"#.to_string(),
        ];
        let forward = {
            let (ops, _) = parse_lines(&lines.join("\n"));
            render_file(&reduce_ops(ops))
        };
        let reversed = {
            let mut rev = lines.clone();
            rev.reverse();
            let (ops, _) = parse_lines(&rev.join("\n"));
            render_file(&reduce_ops(ops))
        };
        assert_eq!(forward, reversed);
    }

    #[test]
    fn dep_ops_reduce_by_pair() {
        let content = [
            r#"{"v":1,"op":"dep_add","ts":"2024-01-01T00:00:00Z","blockerId":"a","blockedId":"b"}"#,
            r#"{"v":1,"op":"dep_remove","ts":"2024-01-02T00:00:00Z","blockerId":"a","blockedId":"b"}"#,
        ]
        .join("\n");
        let (ops, _) = parse_lines(&content);
        let reduced = reduce_ops(ops);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].op, OpKind::DepRemove);
    }

    #[test]
    fn render_has_trailing_newline_iff_nonempty() {
        assert_eq!(render_file(&[]), "");
        let (ops, _) = parse_lines(&upsert_line("tx-a0000001", "2024-01-01T00:00:00Z", "t"));
        let rendered = render_file(&ops);
        assert!(rendered.ends_with('\n'));
        assert_eq!(rendered.matches('\n').count(), 1);
    }

    #[test]
    fn integer_ids_work_for_learning_ops() {
        let line = r#"{"v":1,"op":"learning_upsert","ts":"2024-01-01T00:00:00Z","id":7,"data":{"content":"x"}}"#;
        let (ops, errors) = parse_lines(line);
        assert!(errors.is_empty());
        assert_eq!(ops[0].id_i64(), Some(7));
        assert_eq!(ops[0].id_string().as_deref(), Some("7"));
    }

    proptest! {
        /// Reduction never yields two survivors with the same key, and is
        /// idempotent.
        #[test]
        fn reduce_is_idempotent(seed in proptest::collection::vec((0u8..5, 0u8..10), 0..40)) {
            let ops: Vec<SyncOp> = seed
                .iter()
                .map(|(id, day)| SyncOp::upsert(
                    OpKind::Upsert,
                    serde_json::json!(format!("tx-id{id:07}")),
                    format!("2024-01-{:02}T00:00:00Z", day + 1),
                    serde_json::json!({"title": format!("t{day}")}),
                ))
                .collect();
            let once = reduce_ops(ops.clone());
            let twice = reduce_ops(once.clone());
            prop_assert_eq!(render_file(&once), render_file(&twice));

            let mut keys: Vec<_> = once.iter().map(|o| o.key().unwrap()).collect();
            keys.sort();
            keys.dedup();
            prop_assert_eq!(keys.len(), once.len());
        }
    }
}
