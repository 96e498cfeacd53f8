use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use super::state::{JobRecord, SandboxJobState};

/// Storage for sandbox job state.
///
/// The manager depends only on this contract, so a persistent backend can be
/// swapped in for `InMemoryJobRegistry`.
pub trait JobRegistry: Send + Sync {
    fn insert(&self, record: JobRecord);

    /// Apply `f` to the record with the given id. Returns false if absent.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut JobRecord)) -> bool;

    fn get(&self, id: &str) -> Option<SandboxJobState>;

    /// All jobs in creation order.
    fn list(&self) -> Vec<SandboxJobState>;

    fn remove(&self, id: &str) -> bool;

    /// Ids and end times of terminal jobs, oldest first.
    fn terminal_jobs(&self) -> Vec<(String, DateTime<Utc>)>;
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<String, (u64, JobRecord)>,
}

/// Process-local registry; dies with the process.
#[derive(Default)]
pub struct InMemoryJobRegistry {
    inner: RwLock<Inner>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn insert(&self, record: JobRecord) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(record.id.clone(), (seq, record));
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut JobRecord)) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.jobs.get_mut(id) {
            Some((_, record)) => {
                f(record);
                true
            }
            None => false,
        }
    }

    fn get(&self, id: &str) -> Option<SandboxJobState> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.get(id).map(|(_, record)| record.snapshot())
    }

    fn list(&self) -> Vec<SandboxJobState> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<&(u64, JobRecord)> = inner.jobs.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, r)| r.snapshot()).collect()
    }

    fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.jobs.remove(id).is_some()
    }

    fn terminal_jobs(&self) -> Vec<(String, DateTime<Utc>)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut terminal: Vec<(u64, String, DateTime<Utc>)> = inner
            .jobs
            .values()
            .filter(|(_, r)| r.status.is_terminal())
            .map(|(seq, r)| (*seq, r.id.clone(), r.ended_at.unwrap_or(r.started_at)))
            .collect();
        terminal.sort_by_key(|(seq, _, ended)| (*ended, *seq));
        terminal.into_iter().map(|(_, id, ended)| (id, ended)).collect()
    }
}
