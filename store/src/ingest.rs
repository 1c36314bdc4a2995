use scipstore_types::Index;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{ProcessedMetadata, UploadSummary};
use crate::store::{Session, Store};

const DEFAULT_FLUSH_EVERY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Staged documents that trigger a flush.
    pub flush_every: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

/// Writes a whole decoded index for `upload_id` in one transaction.
///
/// Metadata goes in first, then documents are staged by relative path and
/// flushed in windows of `flush_every`. Any failure rolls the upload back.
pub async fn process_upload(
    store: &Store,
    upload_id: i64,
    index: Index,
    options: &IngestOptions,
) -> Result<UploadSummary, StoreError> {
    let flush_every = options.flush_every.max(1);
    let metadata = ProcessedMetadata::from(&index.metadata);

    let summary = store
        .with_transaction(async move |tx: &mut Session| {
            tx.insert_metadata(upload_id, &metadata).await?;

            let mut summary = UploadSummary {
                upload_id,
                ..UploadSummary::default()
            };
            let mut writer = tx.new_scip_writer(upload_id).await?;

            for document in index.documents {
                let path = document.relative_path.clone();
                writer.insert_document(path, document)?;
                summary.documents += 1;

                if writer.staged_documents() >= flush_every {
                    summary.symbols += u64::from(writer.flush().await?);
                    summary.flushes += 1;
                    debug!(upload_id, documents = summary.documents, "flushed document window");
                }
            }

            if writer.staged_documents() > 0 {
                summary.symbols += u64::from(writer.flush().await?);
                summary.flushes += 1;
            }

            Ok(summary)
        })
        .await?;

    info!(
        upload_id,
        documents = summary.documents,
        symbols = summary.symbols,
        flushes = summary.flushes,
        "processed upload"
    );

    Ok(summary)
}
