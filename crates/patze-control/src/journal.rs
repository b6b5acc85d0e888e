//! Operation journal: a bounded ring of recent operations with
//! monotonically-increasing ids. In-memory only; restarting the process
//! starts a fresh journal.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

pub const JOURNAL_CAP: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Started,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: u64,
    pub operation: String,
    pub state: OperationState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

struct Inner {
    entries: VecDeque<JournalEntry>,
    next_id: u64,
}

pub struct OperationJournal {
    inner: Mutex<Inner>,
}

impl OperationJournal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    /// Record the start of an operation; returns its journal id.
    pub fn begin(&self, operation: &str) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.entries.len() == JOURNAL_CAP {
            inner.entries.pop_front();
        }
        inner.entries.push_back(JournalEntry {
            id,
            operation: operation.to_string(),
            state: OperationState::Started,
            started_at: Utc::now(),
            ended_at: None,
            detail: None,
        });
        id
    }

    pub fn succeed(&self, id: u64) {
        self.finish(id, OperationState::Succeeded, None);
    }

    pub fn fail(&self, id: u64, detail: impl Into<String>) {
        self.finish(id, OperationState::Failed, Some(detail.into()));
    }

    fn finish(&self, id: u64, state: OperationState, detail: Option<String>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
            entry.state = state;
            entry.ended_at = Some(Utc::now());
            entry.detail = detail;
        }
    }

    /// Newest-first listing.
    pub fn entries(&self, limit: Option<usize>) -> Vec<JournalEntry> {
        let inner = self.inner.lock();
        let limit = limit.unwrap_or(JOURNAL_CAP).min(JOURNAL_CAP);
        inner.entries.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for OperationJournal {
    fn default() -> Self {
        Self::new()
    }
}
