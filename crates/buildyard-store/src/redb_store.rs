//! redb-backed request store.
//!
//! Requests and claims live in separate tables; a claim is one write
//! transaction that inserts every id into the claims table, aborting if
//! any id is already present. All values are JSON-serialized into
//! redb's `&[u8]` value columns. Supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use buildyard_core::{BuildRequest, BuildResult, RequestId};

use crate::error::{StoreError, StoreResult};
use crate::traits::RequestStore;

/// Pending requests keyed by request id.
const REQUESTS: TableDefinition<u64, &[u8]> = TableDefinition::new("requests");

/// Claim records keyed by request id; value is the claim epoch (secs).
const CLAIMS: TableDefinition<u64, u64> = TableDefinition::new("claims");

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe persistent request store backed by redb.
#[derive(Clone)]
pub struct RedbRequestStore {
    db: Arc<Database>,
}

impl RedbRequestStore {
    /// Open (or create) a persistent request store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "request store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory request store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory request store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        txn.open_table(CLAIMS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_ids(&self, ids: &std::collections::BTreeSet<RequestId>, drop_request: bool) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;
            let mut requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            for id in ids {
                claims.remove(id).map_err(map_err!(Write))?;
                if drop_request {
                    requests.remove(id).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl RequestStore for RedbRequestStore {
    fn submit(&self, request: BuildRequest) -> StoreResult<()> {
        let value = serde_json::to_vec(&request).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            table
                .insert(request.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = request.id, builder = %request.builder, "request stored");
        Ok(())
    }

    fn get_unclaimed(&self, builder: &str) -> StoreResult<Vec<BuildRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
        let claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;

        let mut results = Vec::new();
        for entry in requests.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if claims.get(key.value()).map_err(map_err!(Read))?.is_some() {
                continue;
            }
            let request: BuildRequest =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if request.builder == builder {
                results.push(request);
            }
        }
        results.sort_by_key(|r| (r.submitted_at, r.id));
        Ok(results)
    }

    fn claim(&self, ids: &std::collections::BTreeSet<RequestId>) -> StoreResult<()> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let mut claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;

            // Validate the full set before inserting anything; dropping
            // the transaction without commit aborts it, so a partial
            // validation failure leaves no trace.
            for id in ids {
                if requests.get(id).map_err(map_err!(Read))?.is_none() {
                    return Err(StoreError::NotFound(*id));
                }
                if claims.get(id).map_err(map_err!(Read))?.is_some() {
                    return Err(StoreError::AlreadyClaimed(*id));
                }
            }
            for id in ids {
                claims.insert(id, now).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = ids.len(), "requests claimed");
        Ok(())
    }

    fn unclaim(&self, ids: &std::collections::BTreeSet<RequestId>) -> StoreResult<()> {
        self.remove_ids(ids, false)?;
        debug!(count = ids.len(), "requests unclaimed");
        Ok(())
    }

    fn complete(
        &self,
        ids: &std::collections::BTreeSet<RequestId>,
        result: BuildResult,
    ) -> StoreResult<()> {
        match result {
            BuildResult::Retry => self.remove_ids(ids, false)?,
            BuildResult::Success | BuildResult::Failure => self.remove_ids(ids, true)?,
        }
        debug!(count = ids.len(), ?result, "requests completed");
        Ok(())
    }

    fn claimed_ids(&self) -> StoreResult<std::collections::BTreeSet<RequestId>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let claims = txn.open_table(CLAIMS).map_err(map_err!(Table))?;
        let mut out = std::collections::BTreeSet::new();
        for entry in claims.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            out.insert(key.value());
        }
        Ok(out)
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
