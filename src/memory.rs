//! In-memory collaborator implementations.
//!
//! These back the integration tests and give embedders a zero-dependency
//! starting point; production deployments supply their own log engine and
//! archive behind the same traits.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use error_stack::Report;
use futures::future::BoxFuture;

use crate::records::Record;
use crate::traits::{Archive, ArchiveError, Atlas, Wal, WalError};
use crate::types::{Generation, HostId, Position, Value};

/// Record journal held in memory, with failure injection for tests.
#[derive(Clone, Default)]
pub struct MemoryWal {
    journal: Arc<Mutex<Vec<Record>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryWal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records appended so far, in append order.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.journal.lock().unwrap().clone()
    }

    /// Records for one decree, in append order.
    #[must_use]
    pub fn records_at(&self, at: &Position) -> Vec<Record> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.at() == at)
            .cloned()
            .collect()
    }

    /// Make subsequent appends fail.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Wal for MemoryWal {
    type AppendFuture = BoxFuture<'static, Result<(), Report<WalError>>>;

    fn append(&self, record: Record) -> Self::AppendFuture {
        let journal = Arc::clone(&self.journal);
        let failing = self.failing.load(Ordering::SeqCst);
        Box::pin(async move {
            if failing {
                return Err(Report::new(WalError));
            }
            journal.lock().unwrap().push(record);
            Ok(())
        })
    }
}

/// Chosen-value store held in memory, with failure injection for tests.
#[derive(Clone, Default)]
pub struct MemoryArchive {
    cells: Arc<Mutex<HashMap<Position, (Generation, Value)>>>,
    generation: Arc<Mutex<Generation>>,
    failing: Arc<AtomicBool>,
}

impl MemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The value stored for `at`, if any.
    #[must_use]
    pub fn get(&self, at: &Position) -> Option<Value> {
        self.cells
            .lock()
            .unwrap()
            .get(at)
            .map(|(_, value)| value.clone())
    }

    /// Pre-populate a chosen value, as if a previous incarnation closed it.
    pub fn put(&self, at: Position, value: Value) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.cells.lock().unwrap().insert(at, (*generation, value));
    }

    /// Make subsequent loads and stores fail.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Archive for MemoryArchive {
    type LoadFuture = BoxFuture<'static, Result<Option<Value>, Report<ArchiveError>>>;
    type StoreFuture = BoxFuture<'static, Result<Generation, Report<ArchiveError>>>;

    fn load(&self, at: Position) -> Self::LoadFuture {
        let cells = Arc::clone(&self.cells);
        let failing = self.failing.load(Ordering::SeqCst);
        Box::pin(async move {
            if failing {
                return Err(Report::new(ArchiveError));
            }
            Ok(cells
                .lock()
                .unwrap()
                .get(&at)
                .map(|(_, value)| value.clone()))
        })
    }

    fn store(&self, at: Position, value: Value) -> Self::StoreFuture {
        let cells = Arc::clone(&self.cells);
        let generation = Arc::clone(&self.generation);
        let failing = self.failing.load(Ordering::SeqCst);
        Box::pin(async move {
            if failing {
                return Err(Report::new(ArchiveError));
            }
            let mut generation = generation.lock().unwrap();
            *generation += 1;
            cells.lock().unwrap().insert(at, (*generation, value));
            Ok(*generation)
        })
    }
}

/// Fixed peer set with simple-majority quorums.
#[derive(Clone, Debug)]
pub struct Majority {
    peers: Arc<[HostId]>,
}

impl Majority {
    #[must_use]
    pub fn new(peers: impl IntoIterator<Item = HostId>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }
}

impl Atlas for Majority {
    fn peers(&self) -> Vec<HostId> {
        self.peers.to_vec()
    }

    fn quorum(&self, have: &BTreeSet<HostId>) -> bool {
        let counted = self.peers.iter().filter(|peer| have.contains(peer)).count();
        counted > self.peers.len() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wal_appends_and_fails_on_demand() {
        let wal = MemoryWal::new();
        let record = Record::Promise {
            at: Position::new("k", 1),
            ballot: crate::types::BallotNumber::new(1, HostId(1)),
        };
        wal.append(record.clone()).await.unwrap();
        assert_eq!(wal.records(), vec![record.clone()]);
        assert_eq!(wal.records_at(&Position::new("k", 1)), vec![record]);
        assert!(wal.records_at(&Position::new("k", 2)).is_empty());

        wal.fail(true);
        assert!(wal.append(wal.records().remove(0)).await.is_err());
    }

    #[tokio::test]
    async fn archive_stamps_generations() {
        let archive = MemoryArchive::new();
        let at = Position::new("k", 1);
        assert_eq!(archive.load(at.clone()).await.unwrap(), None);

        let g1 = archive.store(at.clone(), Value::from("v")).await.unwrap();
        let g2 = archive
            .store(Position::new("k", 2), Value::from("w"))
            .await
            .unwrap();
        assert!(g2 > g1);
        assert_eq!(archive.load(at).await.unwrap(), Some(Value::from("v")));
    }
}
