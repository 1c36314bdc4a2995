use std::future::Future;
use std::str::FromStr;

use scipstore_types::Document;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{MetadataRow, ProcessedMetadata};
use crate::writer::{self, ScipWriter};

// Children first so foreign keys never block a delete.
const UPLOAD_TABLES: [&str; 5] = [
    "scip_occurrences",
    "scip_document_symbols",
    "scip_documents",
    "scip_symbols_lookup",
    "scip_metadata",
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    cancel: CancellationToken,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Opens the pool described by `config` and brings the schema up to date.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(StoreError::storage("parse database url"))?
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(StoreError::storage("connect to database"))?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::new(pool))
    }

    /// Replaces the token that cancels every session opened from this store.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begins a write session. The database write lock is taken up front, so
    /// concurrent sessions queue on the busy timeout instead of failing when a
    /// read would have to be upgraded.
    pub async fn transact(&self) -> Result<Session, StoreError> {
        let cancel = self.cancel.child_token();
        let tx = guarded(
            &cancel,
            "begin transaction",
            self.pool.begin_with("BEGIN IMMEDIATE"),
        )
        .await?;
        Ok(Session { tx, cancel })
    }

    /// Runs `f` inside a fresh session, committing when it returns `Ok` and
    /// rolling back otherwise. If `f` panics the session is dropped, which
    /// rolls the transaction back as well.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: AsyncFnOnce(&mut Session) -> Result<T, StoreError>,
    {
        let mut session = self.transact().await?;
        let result = f(&mut session).await;
        session.done(result).await
    }

    pub async fn insert_metadata(
        &self,
        upload_id: i64,
        metadata: &ProcessedMetadata,
    ) -> Result<(), StoreError> {
        let query = insert_metadata_query(upload_id, metadata)?;
        guarded(&self.cancel, "insert metadata", query.execute(&self.pool)).await?;
        Ok(())
    }

    pub async fn get_metadata(
        &self,
        upload_id: i64,
    ) -> Result<Option<ProcessedMetadata>, StoreError> {
        let row = guarded(
            &self.cancel,
            "load metadata",
            sqlx::query_as::<_, MetadataRow>(
                "SELECT text_document_encoding, tool_name, tool_version, tool_arguments, protocol_version \
                 FROM scip_metadata \
                 WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool),
        )
        .await?;

        row.map(|row| row.into_metadata().map_err(StoreError::from))
            .transpose()
    }

    /// Loads the payload stored for `path` in `upload_id`.
    pub async fn get_document(
        &self,
        upload_id: i64,
        path: &str,
    ) -> Result<Option<Document>, StoreError> {
        let payload: Option<Vec<u8>> = guarded(
            &self.cancel,
            "load document",
            sqlx::query_scalar(
                "SELECT raw_payload FROM scip_documents WHERE upload_id = ? AND document_path = ?",
            )
            .bind(upload_id)
            .bind(path)
            .fetch_optional(&self.pool),
        )
        .await?;

        payload
            .map(|payload| writer::decode_payload(&payload))
            .transpose()
    }

    /// Removes every row written for `upload_ids` and returns how many rows
    /// were deleted.
    pub async fn delete_upload_data(&self, upload_ids: &[i64]) -> Result<u64, StoreError> {
        if upload_ids.is_empty() {
            return Ok(0);
        }

        let mut session = self.transact().await?;
        let result = session.delete_upload_data(upload_ids).await;
        session.done(result).await
    }
}

/// One transaction. Writers borrow the session, so it cannot be finished while
/// a writer is still alive.
pub struct Session {
    pub(crate) tx: Transaction<'static, Sqlite>,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    pub async fn new_scip_writer(&mut self, upload_id: i64) -> Result<ScipWriter<'_>, StoreError> {
        ScipWriter::new(self, upload_id).await
    }

    pub async fn insert_metadata(
        &mut self,
        upload_id: i64,
        metadata: &ProcessedMetadata,
    ) -> Result<(), StoreError> {
        let query = insert_metadata_query(upload_id, metadata)?;
        guarded(&self.cancel, "insert metadata", query.execute(&mut *self.tx)).await?;
        Ok(())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Commits when `result` is `Ok`, rolls back otherwise, and hands the
    /// result back. A failed rollback is logged; the original error wins.
    pub async fn done<T>(self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                self.tx
                    .commit()
                    .await
                    .map_err(StoreError::storage("commit transaction"))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.tx.rollback().await {
                    warn!(error = %rollback_err, cause = %err, "failed to roll back transaction");
                } else {
                    debug!(cause = %err, "transaction rolled back");
                }
                Err(err)
            }
        }
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.done(Ok(())).await
    }

    async fn delete_upload_data(&mut self, upload_ids: &[i64]) -> Result<u64, StoreError> {
        let mut total_deleted = 0_u64;

        for table in UPLOAD_TABLES {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table} WHERE upload_id IN ("));
            let mut separated = qb.separated(", ");
            for upload_id in upload_ids {
                separated.push_bind(*upload_id);
            }
            qb.push(")");

            let deleted = guarded(&self.cancel, "delete upload data", qb.build().execute(&mut *self.tx))
                .await?
                .rows_affected();
            total_deleted = total_deleted.saturating_add(deleted);
        }

        debug!(uploads = ?upload_ids, rows = total_deleted, "deleted upload data");
        Ok(total_deleted)
    }
}

/// Races a database round trip against cancellation.
pub(crate) async fn guarded<T, Fut>(
    cancel: &CancellationToken,
    operation: &'static str,
    fut: Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled { operation }),
        result = fut => result.map_err(StoreError::storage(operation)),
    }
}

fn insert_metadata_query(
    upload_id: i64,
    metadata: &ProcessedMetadata,
) -> Result<Query<'static, Sqlite, SqliteArguments<'static>>, StoreError> {
    writer::validate_upload_id(upload_id)?;
    let tool_arguments = serde_json::to_string(&metadata.tool_arguments)?;

    Ok(sqlx::query(
        "INSERT INTO scip_metadata \
         (upload_id, text_document_encoding, tool_name, tool_version, tool_arguments, protocol_version) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(upload_id)
    .bind(metadata.text_document_encoding.clone())
    .bind(metadata.tool_name.clone())
    .bind(metadata.tool_version.clone())
    .bind(tool_arguments)
    .bind(metadata.protocol_version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pretty_assertions::assert_eq;
    use scipstore_types::{Document, SymbolInformation};

    fn test_metadata() -> ProcessedMetadata {
        ProcessedMetadata {
            text_document_encoding: "UTF8".to_string(),
            tool_name: "scip-test".to_string(),
            tool_version: "0.1.0".to_string(),
            tool_arguments: vec!["-p".to_string(), "src".to_string()],
            protocol_version: 1,
        }
    }

    fn document(symbol: &str) -> Document {
        Document {
            symbols: vec![SymbolInformation::new(symbol)],
            ..Document::default()
        }
    }

    #[tokio::test]
    async fn inserts_metadata_without_writer() {
        let (_dir, store) = testing::store().await;

        store
            .insert_metadata(42, &test_metadata())
            .await
            .expect("insert metadata");

        let loaded = store.get_metadata(42).await.expect("load metadata");
        assert_eq!(loaded, Some(test_metadata()));
        assert_eq!(store.get_metadata(43).await.expect("load metadata"), None);
    }

    #[tokio::test]
    async fn rejects_duplicate_metadata() {
        let (_dir, store) = testing::store().await;
        store
            .insert_metadata(42, &test_metadata())
            .await
            .expect("insert metadata");

        let err = store
            .insert_metadata(42, &test_metadata())
            .await
            .expect_err("second insert should fail");
        assert!(matches!(err, StoreError::Storage { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn rejects_non_positive_upload_ids() {
        let (_dir, store) = testing::store().await;
        let err = store
            .insert_metadata(0, &test_metadata())
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::Validation(_)), "{err:?}");
    }

    #[tokio::test]
    async fn session_metadata_is_rolled_back() {
        let (_dir, store) = testing::store().await;

        let mut session = store.transact().await.expect("begin");
        session
            .insert_metadata(42, &test_metadata())
            .await
            .expect("insert metadata");
        let err = session
            .done::<()>(Err(StoreError::Validation("abort".to_string())))
            .await
            .expect_err("done should return the original error");
        assert!(matches!(err, StoreError::Validation(ref msg) if msg == "abort"));

        assert_eq!(store.get_metadata(42).await.expect("load metadata"), None);
    }

    #[tokio::test]
    async fn dropped_session_rolls_back() {
        let (_dir, store) = testing::store().await;

        {
            let mut session = store.transact().await.expect("begin");
            session
                .insert_metadata(42, &test_metadata())
                .await
                .expect("insert metadata");
        }

        assert_eq!(store.get_metadata(42).await.expect("load metadata"), None);
    }

    #[tokio::test]
    async fn separate_uploads_keep_separate_documents() {
        let (_dir, store) = testing::store().await;

        let mut tx1 = store.transact().await.expect("begin");
        {
            let mut writer24 = tx1.new_scip_writer(24).await.expect("writer");
            writer24
                .insert_document("internal/util.go", document("lorem ipsum dolor sit amet"))
                .expect("stage document");
            writer24.flush().await.expect("flush");
        }
        tx1.commit().await.expect("commit");

        let mut tx2 = store.transact().await.expect("begin");
        {
            let mut writer25 = tx2.new_scip_writer(25).await.expect("writer");
            writer25
                .insert_document("internal/util.go", document("lorem ipsum dolor sit amet"))
                .expect("stage document");
            writer25
                .insert_document(
                    "internal/util_test.go",
                    document("consectetur adipiscing elit, sed do eiusmod"),
                )
                .expect("stage document");
            writer25.flush().await.expect("flush");
        }
        tx2.commit().await.expect("commit");

        assert_eq!(testing::count(&store, "scip_documents", 24).await, 1);
        assert_eq!(testing::count(&store, "scip_documents", 25).await, 2);

        let util_rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scip_documents WHERE document_path = 'internal/util.go'",
        )
        .fetch_one(store.pool())
        .await
        .expect("count documents");
        assert_eq!(util_rows, 2);

        // Both uploads start their dictionaries independently.
        let scheme_ids: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT upload_id, id FROM scip_symbols_lookup WHERE parent_id IS NULL ORDER BY upload_id",
        )
        .fetch_all(store.pool())
        .await
        .expect("load schemes");
        assert_eq!(scheme_ids, vec![(24, 1), (25, 1), (25, 6)]);
    }

    async fn upload(store: &Store, upload_id: i64) -> Result<u32, StoreError> {
        store
            .with_transaction(async move |tx: &mut Session| {
                tx.insert_metadata(upload_id, &test_metadata()).await?;
                let mut writer = tx.new_scip_writer(upload_id).await?;
                writer.insert_document("internal/util.go", document("lorem ipsum dolor sit amet"))?;
                writer.insert_document(
                    "internal/util_test.go",
                    document("consectetur adipiscing elit, sed do eiusmod"),
                )?;
                let first = writer.flush().await?;

                tokio::task::yield_now().await;
                let main = format!("scip-go gomod example v{upload_id} main/main().");
                writer.insert_document("cmd/main.go", document(&main))?;
                Ok(first + writer.flush().await?)
            })
            .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_uploads_queue_for_the_write_lock() {
        let (_dir, store) = testing::store().await;

        let (a, b, c, d) = tokio::join!(
            upload(&store, 24),
            upload(&store, 25),
            upload(&store, 26),
            upload(&store, 27),
        );

        for (upload_id, result) in [(24, a), (25, b), (26, c), (27, d)] {
            assert_eq!(result.expect("concurrent upload"), 3, "upload {upload_id}");
            assert_eq!(testing::count(&store, "scip_documents", upload_id).await, 3);
            // 5 + 5 nodes from the first flush, 6 from the second
            assert_eq!(testing::count(&store, "scip_symbols_lookup", upload_id).await, 16);
            assert!(store.get_metadata(upload_id).await.expect("load").is_some());
        }
    }

    #[tokio::test]
    async fn with_transaction_commits_on_success() {
        let (_dir, store) = testing::store().await;

        let count = store
            .with_transaction(async move |tx: &mut Session| {
                tx.insert_metadata(7, &test_metadata()).await?;
                let mut writer = tx.new_scip_writer(7).await?;
                writer.insert_document("a.go", document("a b c d e#"))?;
                writer.flush().await
            })
            .await
            .expect("transaction");

        assert_eq!(count, 1);
        assert!(store.get_metadata(7).await.expect("load").is_some());
        assert_eq!(testing::count(&store, "scip_documents", 7).await, 1);
    }

    #[tokio::test]
    async fn with_transaction_rolls_back_on_error() {
        let (_dir, store) = testing::store().await;

        let err = store
            .with_transaction(async move |tx: &mut Session| {
                tx.insert_metadata(7, &test_metadata()).await?;
                let mut writer = tx.new_scip_writer(7).await?;
                writer.insert_document("a.go", document("not a symbol"))?;
                writer.flush().await
            })
            .await
            .expect_err("malformed symbol should abort");

        assert!(matches!(err, StoreError::Parse(_)), "{err:?}");
        assert_eq!(store.get_metadata(7).await.expect("load"), None);
        assert_eq!(testing::count(&store, "scip_documents", 7).await, 0);
    }

    #[tokio::test]
    async fn cancelled_store_refuses_new_sessions() {
        let (_dir, store) = testing::store().await;
        store.cancellation_token().cancel();

        let err = store.transact().await.err().expect("should be cancelled");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn deletes_upload_data() {
        let (_dir, store) = testing::store().await;

        for upload_id in [1, 2] {
            store
                .with_transaction(async move |tx: &mut Session| {
                    tx.insert_metadata(upload_id, &test_metadata()).await?;
                    let mut writer = tx.new_scip_writer(upload_id).await?;
                    writer.insert_document("a.go", document("a b c d e#"))?;
                    writer.flush().await
                })
                .await
                .expect("transaction");
        }

        // metadata + document + document symbol + 5 dictionary nodes
        let deleted = store.delete_upload_data(&[1]).await.expect("delete");
        assert_eq!(deleted, 8);
        assert_eq!(testing::count(&store, "scip_symbols_lookup", 1).await, 0);
        assert_eq!(testing::count(&store, "scip_symbols_lookup", 2).await, 5);
        assert!(store.get_metadata(2).await.expect("load").is_some());
        assert_eq!(store.delete_upload_data(&[]).await.expect("delete"), 0);
    }
}
