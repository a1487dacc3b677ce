//! In-memory change repository.
//!
//! Mirrors the semantics of [`PgChangeRepository`](crate::PgChangeRepository)
//! without a database: used by the monitor's tests and by dry runs of the
//! supervisor (`STORE_BACKEND=memory`).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use tokio::sync::Mutex;

use sage_core::{ChangeRepository, DocumentChange, Error, PartyChange, Result, TableChange};

/// A stored row together with its reconciliation flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored<T> {
    pub id: i64,
    pub change: T,
    pub processed: bool,
}

#[derive(Default)]
struct Tables {
    documents: Vec<Stored<DocumentChange>>,
    parties: Vec<Stored<PartyChange>>,
    tables: Vec<Stored<TableChange>>,
}

/// Change repository backed by process memory.
#[derive(Default)]
pub struct MemoryChangeRepository {
    tables: Mutex<Tables>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl MemoryChangeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail until reset. Test hook.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Flag a stored document as reconciled.
    pub async fn mark_document_processed(&self, id: i64) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.documents.iter_mut().find(|d| d.id == id) {
            Some(row) => {
                row.processed = true;
                true
            }
            None => false,
        }
    }

    pub async fn documents(&self) -> Vec<Stored<DocumentChange>> {
        self.tables.lock().await.documents.clone()
    }

    pub async fn parties(&self) -> Vec<Stored<PartyChange>> {
        self.tables.lock().await.parties.clone()
    }

    pub async fn table_rows(&self) -> Vec<Stored<TableChange>> {
        self.tables.lock().await.tables.clone()
    }

    fn allocate_id(&self) -> Result<i64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("in-memory store rejected write".to_string()));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ChangeRepository for MemoryChangeRepository {
    async fn has_pending_document(
        &self,
        entity_id: &str,
        total_amount: &BigDecimal,
    ) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.documents.iter().any(|d| {
            !d.processed && d.change.entity_id == entity_id && &d.change.total_amount != total_amount
        }))
    }

    async fn party_exists(&self, entity_id: &str) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.parties.iter().any(|p| p.change.entity_id == entity_id))
    }

    async fn append_document(&self, change: &DocumentChange) -> Result<i64> {
        let id = self.allocate_id()?;
        self.tables.lock().await.documents.push(Stored {
            id,
            change: change.clone(),
            processed: false,
        });
        Ok(id)
    }

    async fn append_party(&self, change: &PartyChange) -> Result<i64> {
        let id = self.allocate_id()?;
        self.tables.lock().await.parties.push(Stored {
            id,
            change: change.clone(),
            processed: false,
        });
        Ok(id)
    }

    async fn append_table(&self, change: &TableChange) -> Result<i64> {
        let id = self.allocate_id()?;
        self.tables.lock().await.tables.push(Stored {
            id,
            change: change.clone(),
            processed: false,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sage_core::OperationKind;
    use std::str::FromStr;

    fn document(id: &str, total: &str) -> DocumentChange {
        DocumentChange {
            entity_id: id.to_string(),
            operation: OperationKind::Update,
            occurred_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            domain: 0,
            subtype: 6,
            total_amount: BigDecimal::from_str(total).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_pending_document_requires_different_total() {
        let repo = MemoryChangeRepository::new();
        repo.append_document(&document("FA1", "100.00")).await.unwrap();

        let same = BigDecimal::from_str("100").unwrap();
        let other = BigDecimal::from_str("120.50").unwrap();
        assert!(!repo.has_pending_document("FA1", &same).await.unwrap());
        assert!(repo.has_pending_document("FA1", &other).await.unwrap());
        assert!(!repo.has_pending_document("FA2", &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_processed_document_is_not_pending() {
        let repo = MemoryChangeRepository::new();
        let id = repo.append_document(&document("FA1", "100.00")).await.unwrap();
        assert!(repo.mark_document_processed(id).await);

        let other = BigDecimal::from_str("5").unwrap();
        assert!(!repo.has_pending_document("FA1", &other).await.unwrap());
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let repo = MemoryChangeRepository::new();
        let a = repo.append_document(&document("A", "1")).await.unwrap();
        let b = repo.append_document(&document("B", "1")).await.unwrap();
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let repo = MemoryChangeRepository::new();
        repo.set_fail_writes(true);
        assert!(repo.append_document(&document("A", "1")).await.is_err());
        repo.set_fail_writes(false);
        assert!(repo.append_document(&document("A", "1")).await.is_ok());
        assert_eq!(repo.documents().await.len(), 1);
    }
}
