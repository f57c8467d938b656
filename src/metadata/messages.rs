// Per-query message journal with per-source collapse.
//
// Sources that repeat (a worker resending the same failure, a retry loop)
// are bounded: after `repeat_limit` entries from one source, further
// occurrences only bump a counter; the first offending payload is kept and
// a single summary entry stands in for the rest. A severity transition
// from INFO to ERROR is never suppressed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{QueryMessage, QueryMetadata, Severity};
use crate::common::QueryId;
use crate::error::Result;

pub const DEFAULT_REPEAT_LIMIT: usize = 3;

struct SourceLog {
    recorded: Vec<QueryMessage>,
    suppressed: u64,
    first_suppressed: Option<QueryMessage>,
    worst_severity: Severity,
}

#[derive(Default)]
struct StoreState {
    per_query: HashMap<QueryId, HashMap<String, SourceLog>>,
}

pub struct MessageStore {
    repeat_limit: usize,
    state: Mutex<StoreState>,
    metadata: Option<Arc<dyn QueryMetadata>>,
}

impl MessageStore {
    pub fn new(metadata: Option<Arc<dyn QueryMetadata>>) -> Self {
        Self {
            repeat_limit: DEFAULT_REPEAT_LIMIT,
            state: Mutex::new(StoreState::default()),
            metadata,
        }
    }

    pub fn with_repeat_limit(mut self, limit: usize) -> Self {
        self.repeat_limit = limit.max(1);
        self
    }

    /// Record a message from `source`. Suppressed repeats only bump the
    /// source's counter. Returns whether the message was recorded verbatim.
    pub async fn add(&self, source: &str, msg: QueryMessage) -> Result<bool> {
        let recorded = {
            let mut state = self.state.lock();
            let log = state
                .per_query
                .entry(msg.query_id)
                .or_default()
                .entry(source.to_string())
                .or_insert_with(|| SourceLog {
                    recorded: Vec::new(),
                    suppressed: 0,
                    first_suppressed: None,
                    worst_severity: Severity::Info,
                });

            let escalation =
                msg.severity == Severity::Error && log.worst_severity == Severity::Info;
            if log.recorded.len() < self.repeat_limit || escalation {
                log.worst_severity = log.worst_severity.max(msg.severity);
                log.recorded.push(msg.clone());
                true
            } else {
                log.suppressed += 1;
                if log.first_suppressed.is_none() {
                    log.first_suppressed = Some(msg.clone());
                }
                false
            }
        };

        if recorded {
            if let Some(metadata) = &self.metadata {
                metadata.add_message(&msg).await?;
            }
        } else {
            debug!(query_id = msg.query_id, source, "suppressed repeated message");
        }
        Ok(recorded)
    }

    /// All entries for a query: recorded messages plus one summary entry per
    /// source that overflowed.
    pub fn entries(&self, query_id: QueryId) -> Vec<QueryMessage> {
        let state = self.state.lock();
        let Some(sources) = state.per_query.get(&query_id) else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for (source, log) in sources {
            entries.extend(log.recorded.iter().cloned());
            if log.suppressed > 0 {
                let first = log
                    .first_suppressed
                    .as_ref()
                    .expect("suppressed count implies a first payload");
                entries.push(QueryMessage {
                    query_id,
                    chunk_id: first.chunk_id,
                    code: first.code,
                    severity: first.severity,
                    text: format!(
                        "{} further message(s) from {} suppressed; first was: {}",
                        log.suppressed, source, first.text
                    ),
                    timestamp_ms: first.timestamp_ms,
                });
            }
        }
        entries.sort_by_key(|m| m.timestamp_ms);
        entries
    }

    /// True if the query has at least one ERROR-severity entry.
    pub fn has_error(&self, query_id: QueryId) -> bool {
        let state = self.state.lock();
        state
            .per_query
            .get(&query_id)
            .map(|sources| sources.values().any(|l| l.worst_severity == Severity::Error))
            .unwrap_or(false)
    }

    pub fn remove_query(&self, query_id: QueryId) {
        self.state.lock().per_query.remove(&query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::millis_since_epoch;

    fn msg(query_id: QueryId, severity: Severity, text: &str) -> QueryMessage {
        QueryMessage {
            query_id,
            chunk_id: -1,
            code: 0,
            severity,
            text: text.to_string(),
            timestamp_ms: millis_since_epoch(),
        }
    }

    #[tokio::test]
    async fn repeats_collapse_after_limit() {
        let store = MessageStore::new(None).with_repeat_limit(3);
        for i in 0..5 {
            store
                .add("retry-loop", msg(1, Severity::Info, &format!("attempt {}", i)))
                .await
                .unwrap();
        }
        let entries = store.entries(1);
        // 3 verbatim + 1 summary standing in for the 2 suppressed.
        assert_eq!(entries.len(), 4);
        let summary = entries.iter().find(|e| e.text.contains("suppressed")).unwrap();
        assert!(summary.text.contains("2 further message(s)"));
        assert!(summary.text.contains("attempt 3"));
    }

    #[tokio::test]
    async fn severity_escalation_is_never_suppressed() {
        let store = MessageStore::new(None).with_repeat_limit(2);
        for i in 0..4 {
            store
                .add("w1", msg(7, Severity::Info, &format!("info {}", i)))
                .await
                .unwrap();
        }
        let recorded = store
            .add("w1", msg(7, Severity::Error, "it broke"))
            .await
            .unwrap();
        assert!(recorded);
        assert!(store.has_error(7));
        assert!(store.entries(7).iter().any(|e| e.text == "it broke"));
    }

    #[tokio::test]
    async fn sources_are_independent() {
        let store = MessageStore::new(None).with_repeat_limit(1);
        store.add("a", msg(1, Severity::Info, "from a")).await.unwrap();
        let recorded = store.add("b", msg(1, Severity::Info, "from b")).await.unwrap();
        assert!(recorded);
        assert_eq!(store.entries(1).len(), 2);
    }
}
