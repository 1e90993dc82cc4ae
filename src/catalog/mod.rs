//! Persistent transfer catalog.
//!
//! SQLite-backed record of models and transfers. The engine reads waiting
//! rows from here and writes status transitions and timing figures back;
//! the metadata discovery pipeline (external to this crate) inserts rows
//! through the same store.
//!
//! # Locking
//!
//! Every operation runs under one process-wide async lock shared by all
//! clones of a [`Catalog`]. The scheduler and the metadata reader access the
//! store concurrently; this lock is the only mutual-exclusion point for
//! catalog state, and correctness must not depend on anything weaker.
//!
//! # Example
//!
//! ```ignore
//! use esgf_fetch::{Catalog, Database};
//!
//! let db = Database::new(Path::new("synchro_data.db")).await?;
//! let catalog = Catalog::new(db);
//!
//! for transfer in catalog.list_new_waiting(0).await? {
//!     // ... dispatch ...
//!     catalog.mark_running(transfer.transfer_id).await?;
//! }
//! ```

mod error;
mod transfer;

pub use error::{CatalogError, CatalogErrorKind};
pub use transfer::{Model, NewTransfer, Transfer, TransferStatus, TransferTimings};

use std::sync::Arc;

use sqlx::Row;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::db::Database;

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`CatalogError::TransferNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(CatalogError::TransferNotFound(id))
    } else {
        Ok(())
    }
}

/// Columns selected for a [`Transfer`] snapshot; `datanode` comes from the
/// joined model row.
const TRANSFER_COLUMNS: &str = r"t.transfer_id, t.model, t.tracking_id, t.checksum,
       t.checksum_type, t.location, t.local_image, t.status, t.error_msg,
       t.start_date, t.end_date, t.duration, t.rate, t.size, t.variable,
       m.datanode";

/// Catalog store handle.
///
/// Cheap to clone; all clones share the same connection and the same
/// process-wide lock.
#[derive(Debug, Clone)]
pub struct Catalog {
    db: Database,
    lock: Arc<Mutex<()>>,
}

impl Catalog {
    /// Creates a catalog store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Returns waiting transfers with `transfer_id > since_id`, joined with
    /// their model, in id order.
    ///
    /// Returned rows are snapshots; the caller advances its own watermark
    /// from the ids it observes. Note that rows an operator resets from
    /// `running`/`error` back to `waiting` keep their old ids and are not
    /// picked up by a watermark that has moved past them.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_new_waiting(&self, since_id: i64) -> Result<Vec<Transfer>> {
        let _guard = self.lock.lock().await;
        let rows = sqlx::query_as::<_, Transfer>(&format!(
            r"SELECT {TRANSFER_COLUMNS}
                FROM transfer t JOIN model m ON t.model = m.name
               WHERE t.status = ? AND t.transfer_id > ?
               ORDER BY t.transfer_id ASC"
        ))
        .bind(TransferStatus::Waiting.as_str())
        .bind(since_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Fetches a single transfer by id, any status.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<Transfer>> {
        let _guard = self.lock.lock().await;
        let row = sqlx::query_as::<_, Transfer>(&format!(
            r"SELECT {TRANSFER_COLUMNS}
                FROM transfer t JOIN model m ON t.model = m.name
               WHERE t.transfer_id = ?"
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Counts transfers in a status.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: TransferStatus) -> Result<i64> {
        let _guard = self.lock.lock().await;
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM transfer WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Transitions a transfer to `running` at dispatch time.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::TransferNotFound`] if no transfer has the id.
    /// Returns [`CatalogError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_running(&self, id: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let result = sqlx::query(r"UPDATE transfer SET status = ? WHERE transfer_id = ?")
            .bind(TransferStatus::Running.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Finalizes a verified transfer: `done` plus its timing figures.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::TransferNotFound`] if no transfer has the id.
    /// Returns [`CatalogError::Database`] if the update fails.
    #[instrument(skip(self, timings))]
    pub async fn mark_done(&self, id: i64, timings: &TransferTimings) -> Result<()> {
        let _guard = self.lock.lock().await;
        let result = sqlx::query(
            r"UPDATE transfer
                 SET status = ?, error_msg = NULL,
                     start_date = ?, end_date = ?, duration = ?, rate = ?
               WHERE transfer_id = ?",
        )
        .bind(TransferStatus::Done.as_str())
        .bind(timings.start_date)
        .bind(timings.end_date)
        .bind(timings.duration)
        .bind(timings.rate)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Finalizes a failed transfer: `error`, the failure reason, and timing
    /// figures for however far it got.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::TransferNotFound`] if no transfer has the id.
    /// Returns [`CatalogError::Database`] if the update fails.
    #[instrument(skip(self, timings), fields(error_msg = %error_msg))]
    pub async fn mark_error(
        &self,
        id: i64,
        error_msg: &str,
        timings: &TransferTimings,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let result = sqlx::query(
            r"UPDATE transfer
                 SET status = ?, error_msg = ?,
                     start_date = ?, end_date = ?, duration = ?, rate = ?
               WHERE transfer_id = ?",
        )
        .bind(TransferStatus::Error.as_str())
        .bind(error_msg)
        .bind(timings.start_date)
        .bind(timings.end_date)
        .bind(timings.duration)
        .bind(timings.rate)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Resets a transfer to `waiting` so the next pass retries it.
    ///
    /// Timing fields are deliberately left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::TransferNotFound`] if no transfer has the id.
    /// Returns [`CatalogError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_waiting(&self, id: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let result = sqlx::query(r"UPDATE transfer SET status = ? WHERE transfer_id = ?")
            .bind(TransferStatus::Waiting.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Inserts a model row. Part of the metadata-pipeline seam.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Database`] if the insert fails (duplicate
    /// name included).
    #[instrument(skip(self, model), fields(name = %model.name))]
    pub async fn insert_model(&self, model: &Model) -> Result<()> {
        let _guard = self.lock.lock().await;
        sqlx::query(r"INSERT INTO model (name, datanode, institute) VALUES (?, ?, ?)")
            .bind(&model.name)
            .bind(&model.datanode)
            .bind(&model.institute)
            .execute(self.db.pool())
            .await?;

        Ok(())
    }

    /// Inserts a new waiting transfer. Part of the metadata-pipeline seam.
    ///
    /// `tracking_id` is unique; re-inserting a known file is an error the
    /// caller may ignore.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Database`] if the insert fails.
    #[instrument(skip(self, new), fields(tracking_id = %new.tracking_id))]
    pub async fn insert_transfer(&self, new: &NewTransfer<'_>) -> Result<i64> {
        let _guard = self.lock.lock().await;
        let row = sqlx::query(
            r"INSERT INTO transfer
                  (model, tracking_id, checksum, checksum_type, location,
                   local_image, status, size, variable)
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING transfer_id",
        )
        .bind(new.model)
        .bind(new.tracking_id)
        .bind(new.checksum)
        .bind(new.checksum_type)
        .bind(new.location)
        .bind(new.local_image)
        .bind(TransferStatus::Waiting.as_str())
        .bind(new.size)
        .bind(new.variable)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("transfer_id"))
    }
}
