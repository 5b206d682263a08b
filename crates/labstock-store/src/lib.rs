//! SQLite-backed record store for purchase requests.
//!
//! Every public operation opens a fresh connection, does its work, and
//! releases the handle on all exit paths. Connections are never pooled or
//! shared across operations.

use std::path::{Path, PathBuf};

use labstock_core::{InventoryRecord, RecordDraft, RecordUpdate, Status};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "labstock-store";

const CREATE_INVENTORY_SQL: &str = r"
CREATE TABLE IF NOT EXISTS inventory (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  requested_by TEXT NOT NULL,
  catalog_number TEXT NOT NULL,
  vendor TEXT NOT NULL,
  name TEXT NOT NULL,
  url TEXT,
  quantity INTEGER DEFAULT 1,
  unit TEXT,
  notes TEXT,
  cost REAL DEFAULT 0.0,
  status TEXT NOT NULL DEFAULT 'Requested',
  order_date TEXT,
  received_date TEXT
)
";

const INSERT_SQL: &str = r"
INSERT INTO inventory
  (requested_by, catalog_number, vendor, name, url, quantity, unit, notes, cost, status, order_date, received_date)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

const SELECT_COLUMNS: &str = r"
SELECT id, requested_by, catalog_number, vendor, name, url, quantity, unit, notes, cost, status, order_date, received_date
  FROM inventory
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("row {id} carries invalid status {status:?}")]
    InvalidStatus { id: i64, status: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Handle to the store file. Cheap to clone; holds no open connection.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<SqliteConnection, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true);
        Ok(options.connect().await?)
    }

    /// Idempotently creates the `inventory` table.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        sqlx::query(CREATE_INVENTORY_SQL).execute(&mut conn).await?;
        Ok(())
    }

    /// True iff the store file exists and contains the `inventory` table.
    /// Gates whether a fresh remote fetch is attempted at startup.
    pub async fn validate(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        let options = SqliteConnectOptions::new().filename(&self.path);
        let Ok(mut conn) = options.connect().await else {
            return false;
        };
        let row =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'inventory'")
                .fetch_optional(&mut conn)
                .await;
        matches!(row, Ok(Some(_)))
    }

    pub async fn insert(&self, draft: &RecordDraft) -> Result<i64, StoreError> {
        let mut conn = self.connect().await?;
        let result = bind_draft(sqlx::query(INSERT_SQL), draft)
            .execute(&mut conn)
            .await?;
        debug!(id = result.last_insert_rowid(), "inserted inventory record");
        Ok(result.last_insert_rowid())
    }

    /// Inserts all drafts in one transaction; nothing is committed if any
    /// insert fails.
    pub async fn insert_all(&self, drafts: &[RecordDraft]) -> Result<usize, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        for draft in drafts {
            bind_draft(sqlx::query(INSERT_SQL), draft)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(drafts.len())
    }

    pub async fn list_all(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(&mut conn)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<InventoryRecord>, StoreError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut conn)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Verbatim key equality; first match by id when several rows share the
    /// key (duplicates legitimately arise before a merge pass runs).
    pub async fn find_by_key(
        &self,
        catalog_number: &str,
        vendor: &str,
    ) -> Result<Option<InventoryRecord>, StoreError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE catalog_number = ? AND vendor = ? ORDER BY id LIMIT 1"
        ))
        .bind(catalog_number)
        .bind(vendor)
        .fetch_optional(&mut conn)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Updates every row matching the verbatim key. A new status of
    /// `Requested` clears both dates regardless of the caller-supplied
    /// values; other statuses write the dates as passed.
    pub async fn update_by_key(
        &self,
        catalog_number: &str,
        vendor: &str,
        update: &RecordUpdate,
    ) -> Result<u64, StoreError> {
        let (order_date, received_date) = effective_dates(
            update.status,
            update.order_date.clone(),
            update.received_date.clone(),
        );
        let mut conn = self.connect().await?;
        let result = sqlx::query(
            r"
            UPDATE inventory
               SET requested_by = ?, name = ?, quantity = ?, notes = ?, status = ?,
                   order_date = ?, received_date = ?
             WHERE catalog_number = ? AND vendor = ?
            ",
        )
        .bind(&update.requested_by)
        .bind(&update.name)
        .bind(update.quantity)
        .bind(&update.notes)
        .bind(update.status.as_str())
        .bind(order_date)
        .bind(received_date)
        .bind(catalog_number)
        .bind(vendor)
        .execute(&mut conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Rewrites the editable fields of one row. Dates are left untouched
    /// unless the new status is `Requested`, which clears both.
    pub async fn update_by_id(&self, id: i64, draft: &RecordDraft) -> Result<(), StoreError> {
        let clear_dates = draft.status == Status::Requested;
        let mut conn = self.connect().await?;
        let result = sqlx::query(
            r"
            UPDATE inventory
               SET requested_by = ?, catalog_number = ?, vendor = ?, name = ?, url = ?,
                   quantity = ?, unit = ?, notes = ?, cost = ?, status = ?,
                   order_date = CASE WHEN ? THEN NULL ELSE order_date END,
                   received_date = CASE WHEN ? THEN NULL ELSE received_date END
             WHERE id = ?
            ",
        )
        .bind(&draft.requested_by)
        .bind(&draft.catalog_number)
        .bind(&draft.vendor)
        .bind(&draft.name)
        .bind(&draft.url)
        .bind(draft.quantity)
        .bind(&draft.unit)
        .bind(&draft.notes)
        .bind(draft.cost)
        .bind(draft.status.as_str())
        .bind(clear_dates)
        .bind(clear_dates)
        .bind(id)
        .execute(&mut conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn delete_by_key(
        &self,
        catalog_number: &str,
        vendor: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query("DELETE FROM inventory WHERE catalog_number = ? AND vendor = ?")
            .bind(catalog_number)
            .bind(vendor)
            .execute(&mut conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_id(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        let result = sqlx::query("DELETE FROM inventory WHERE id = ?")
            .bind(id)
            .execute(&mut conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Folds a duplicate group in one transaction: the survivor takes the
    /// aggregated fields, every losing row is deleted.
    pub async fn apply_merge(
        &self,
        survivor_id: i64,
        quantity: i64,
        notes: Option<String>,
        order_date: Option<String>,
        received_date: Option<String>,
        remove_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let result = sqlx::query(
            "UPDATE inventory SET quantity = ?, notes = ?, order_date = ?, received_date = ? WHERE id = ?",
        )
        .bind(quantity)
        .bind(notes)
        .bind(order_date)
        .bind(received_date)
        .bind(survivor_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        for id in remove_ids {
            sqlx::query("DELETE FROM inventory WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn effective_dates(
    status: Status,
    order_date: Option<String>,
    received_date: Option<String>,
) -> (Option<String>, Option<String>) {
    if status == Status::Requested {
        (None, None)
    } else {
        (order_date, received_date)
    }
}

fn bind_draft<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    draft: &'q RecordDraft,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&draft.requested_by)
        .bind(&draft.catalog_number)
        .bind(&draft.vendor)
        .bind(&draft.name)
        .bind(&draft.url)
        .bind(draft.quantity)
        .bind(&draft.unit)
        .bind(&draft.notes)
        .bind(draft.cost)
        .bind(draft.status.as_str())
        .bind(&draft.order_date)
        .bind(&draft.received_date)
}

fn record_from_row(row: &SqliteRow) -> Result<InventoryRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let status_text: String = row.try_get("status")?;
    let status = status_text
        .parse()
        .map_err(|_| StoreError::InvalidStatus {
            id,
            status: status_text.clone(),
        })?;
    Ok(InventoryRecord {
        id,
        requested_by: row.try_get("requested_by")?,
        catalog_number: row.try_get("catalog_number")?,
        vendor: row.try_get("vendor")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        quantity: row.try_get("quantity")?,
        unit: row.try_get("unit")?,
        notes: row.try_get("notes")?,
        cost: row.try_get("cost")?,
        status,
        order_date: row.try_get("order_date")?,
        received_date: row.try_get("received_date")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn fresh_store(dir: &tempfile::TempDir) -> RecordStore {
        let store = RecordStore::new(dir.path().join("inventory.db"));
        store.ensure_schema().await.expect("schema");
        store
    }

    fn draft(catalog: &str, vendor: &str) -> RecordDraft {
        RecordDraft {
            catalog_number: catalog.to_string(),
            vendor: vendor.to_string(),
            name: "Buffer".to_string(),
            ..RecordDraft::default()
        }
    }

    #[tokio::test]
    async fn schema_ensure_is_idempotent_and_validates() {
        let dir = tempdir().expect("tempdir");
        let store = RecordStore::new(dir.path().join("inventory.db"));
        assert!(!store.validate().await);
        store.ensure_schema().await.expect("first ensure");
        store.ensure_schema().await.expect("second ensure");
        assert!(store.validate().await);
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let id = store.insert(&draft("ab-1", "sigma")).await.expect("insert");
        let all = store.list_all().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, id);
        assert_eq!(all[0].status, Status::Requested);
        assert_eq!(all[0].quantity, 1);
    }

    #[tokio::test]
    async fn find_by_key_returns_first_match_by_id() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let first = store.insert(&draft("ab-1", "sigma")).await.expect("insert");
        store.insert(&draft("ab-1", "sigma")).await.expect("insert dup");
        let found = store
            .find_by_key("ab-1", "sigma")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(found.id, first);
    }

    #[tokio::test]
    async fn update_by_key_clears_dates_on_requested() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let mut seeded = draft("ab-1", "sigma");
        seeded.status = Status::Ordered;
        seeded.order_date = Some("2024-02-01".to_string());
        seeded.received_date = Some("2024-02-10".to_string());
        store.insert(&seeded).await.expect("insert");

        let update = RecordUpdate {
            requested_by: "pat".to_string(),
            name: "Buffer".to_string(),
            quantity: 2,
            notes: None,
            status: Status::Requested,
            // Caller-supplied dates must be ignored when resetting.
            order_date: Some("2024-05-05".to_string()),
            received_date: Some("2024-05-06".to_string()),
        };
        let rows = store
            .update_by_key("ab-1", "sigma", &update)
            .await
            .expect("update");
        assert_eq!(rows, 1);

        let record = store
            .find_by_key("ab-1", "sigma")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(record.status, Status::Requested);
        assert!(record.order_date.is_none());
        assert!(record.received_date.is_none());
    }

    #[tokio::test]
    async fn update_by_key_passes_dates_through_for_other_statuses() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        store.insert(&draft("ab-1", "sigma")).await.expect("insert");

        let update = RecordUpdate {
            requested_by: "pat".to_string(),
            name: "Buffer".to_string(),
            quantity: 1,
            notes: Some("rush".to_string()),
            status: Status::Ordered,
            order_date: Some("2024-03-01".to_string()),
            received_date: None,
        };
        store
            .update_by_key("ab-1", "sigma", &update)
            .await
            .expect("update");

        let record = store
            .find_by_key("ab-1", "sigma")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(record.status, Status::Ordered);
        assert_eq!(record.order_date.as_deref(), Some("2024-03-01"));
        assert!(record.received_date.is_none());
    }

    #[tokio::test]
    async fn update_by_id_keeps_dates_unless_requested() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let mut seeded = draft("ab-1", "sigma");
        seeded.status = Status::Received;
        seeded.order_date = Some("2024-01-01".to_string());
        seeded.received_date = Some("2024-01-09".to_string());
        let id = store.insert(&seeded).await.expect("insert");

        let mut edited = seeded.clone();
        edited.name = "Buffer (1L)".to_string();
        store.update_by_id(id, &edited).await.expect("edit");
        let record = store.find_by_id(id).await.expect("find").expect("present");
        assert_eq!(record.name, "Buffer (1L)");
        assert_eq!(record.order_date.as_deref(), Some("2024-01-01"));

        edited.status = Status::Requested;
        store.update_by_id(id, &edited).await.expect("reorder");
        let record = store.find_by_id(id).await.expect("find").expect("present");
        assert!(record.order_date.is_none());
        assert!(record.received_date.is_none());
    }

    #[tokio::test]
    async fn update_by_id_reports_missing_target() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let err = store
            .update_by_id(99, &draft("ab-1", "sigma"))
            .await
            .expect_err("missing id");
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn delete_by_key_removes_all_matches() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        store.insert(&draft("ab-1", "sigma")).await.expect("insert");
        store.insert(&draft("ab-1", "sigma")).await.expect("insert dup");
        let removed = store.delete_by_key("ab-1", "sigma").await.expect("delete");
        assert_eq!(removed, 2);
        assert!(store.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn apply_merge_updates_survivor_and_deletes_losers() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let keep = store.insert(&draft("ab-1", "sigma")).await.expect("insert");
        let lose_a = store.insert(&draft("ab-1", "sigma")).await.expect("insert");
        let lose_b = store.insert(&draft("ab-1", "sigma")).await.expect("insert");

        store
            .apply_merge(
                keep,
                6,
                Some("a | b".to_string()),
                Some("2024-03-01".to_string()),
                None,
                &[lose_a, lose_b],
            )
            .await
            .expect("merge");

        let all = store.list_all().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, keep);
        assert_eq!(all[0].quantity, 6);
        assert_eq!(all[0].notes.as_deref(), Some("a | b"));
        assert_eq!(all[0].order_date.as_deref(), Some("2024-03-01"));
        assert!(all[0].received_date.is_none());
    }
}
