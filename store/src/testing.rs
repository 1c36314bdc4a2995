use tempfile::TempDir;

use crate::config::StoreConfig;
use crate::store::Store;

pub(crate) async fn store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let url = format!("sqlite://{}", dir.path().join("scip.db").display());
    let store = Store::connect(&StoreConfig::new(url))
        .await
        .expect("open store");
    (dir, store)
}

pub(crate) async fn count(store: &Store, table: &str, upload_id: i64) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE upload_id = ?"))
        .bind(upload_id)
        .fetch_one(store.pool())
        .await
        .expect("count rows")
}
