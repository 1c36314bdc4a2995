use std::collections::{BTreeMap, BTreeSet, HashSet};

use scipstore_types::Document;
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::lookup::{self, SegmentCache, SymbolLookup};
use crate::models::{StagedDocument, StagedOccurrence};
use crate::store::{Session, guarded};

const INSERT_BATCH_SIZE: usize = 1000;
const PAYLOAD_COMPRESSION_LEVEL: i32 = 3;

/// Stages the documents of one upload and writes them on [`ScipWriter::flush`].
///
/// Staging never touches the database. Each flush interns the symbol names
/// staged since the previous flush and writes dictionary, document,
/// occurrence and document-symbol rows inside the owning session.
pub struct ScipWriter<'s> {
    session: &'s mut Session,
    upload_id: i64,
    last_id: i64,
    staged: BTreeMap<String, StagedDocument>,
}

impl<'s> ScipWriter<'s> {
    pub(crate) async fn new(session: &'s mut Session, upload_id: i64) -> Result<Self, StoreError> {
        validate_upload_id(upload_id)?;

        let last_id: i64 = guarded(
            &session.cancel,
            "load last descriptor id",
            sqlx::query_scalar(
                "SELECT COALESCE(MAX(id), 0) FROM scip_symbols_lookup WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_one(&mut *session.tx),
        )
        .await?;

        Ok(Self {
            session,
            upload_id,
            last_id,
            staged: BTreeMap::new(),
        })
    }

    pub fn upload_id(&self) -> i64 {
        self.upload_id
    }

    /// Number of documents waiting for the next flush.
    pub fn staged_documents(&self) -> usize {
        self.staged.len()
    }

    /// Stages `document` under `path`, replacing anything staged for the same
    /// path since the last flush.
    pub fn insert_document(
        &mut self,
        path: impl Into<String>,
        document: Document,
    ) -> Result<(), StoreError> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "upload {}: document path must not be empty",
                self.upload_id
            )));
        }

        let mut occurrences = Vec::with_capacity(document.occurrences.len());
        for occurrence in &document.occurrences {
            let Some(range) = occurrence.full_range() else {
                return Err(StoreError::Validation(format!(
                    "{path}: occurrence range must have 3 or 4 elements, got {:?}",
                    occurrence.range
                )));
            };
            if occurrence.symbol.is_empty() {
                trace!(path = %path, ?range, "skipping occurrence without symbol");
                continue;
            }
            occurrences.push(StagedOccurrence {
                range,
                symbol: occurrence.symbol.clone(),
                symbol_roles: occurrence.symbol_roles,
            });
        }

        let symbols = document
            .symbols
            .iter()
            .filter(|info| !info.symbol.is_empty())
            .map(|info| info.symbol.clone())
            .collect();

        let raw_payload = encode_payload(&document)?;
        let payload_hash = hex::encode(Sha256::digest(&raw_payload));

        let staged = StagedDocument {
            language: document.language,
            payload_hash,
            raw_payload,
            symbols,
            occurrences,
        };
        if self.staged.insert(path.clone(), staged).is_some() {
            trace!(upload_id = self.upload_id, path = %path, "replacing staged document");
        }

        Ok(())
    }

    /// Writes everything staged since the last flush and returns the number of
    /// distinct symbol names it resolved.
    ///
    /// After an error the writer must not be reused; the owning session is
    /// expected to roll back.
    pub async fn flush(&mut self) -> Result<u32, StoreError> {
        if self.staged.is_empty() {
            return Ok(0);
        }

        let staged = std::mem::take(&mut self.staged);
        let symbol_names: BTreeSet<&str> =
            staged.values().flat_map(StagedDocument::symbol_names).collect();

        let mut cache = SegmentCache::default();
        let last_id = &mut self.last_id;
        let lookup = lookup::build_symbol_lookup(symbol_names.iter().copied(), &mut cache, || {
            *last_id += 1;
            *last_id
        })?;

        let symbol_count = u32::try_from(lookup.symbol_count()).map_err(|_| {
            StoreError::Validation(format!(
                "upload {}: too many distinct symbols in one flush",
                self.upload_id
            ))
        })?;

        self.insert_descriptors(&lookup).await?;

        for (path, document) in &staged {
            let document_id = self.replace_document(path, document).await?;
            self.insert_occurrences(document_id, path, document, &lookup)
                .await?;
            self.insert_document_symbols(document_id, path, document, &lookup)
                .await?;
        }

        debug!(
            upload_id = self.upload_id,
            documents = staged.len(),
            symbols = symbol_count,
            descriptors = lookup.node_count(),
            "flushed SCIP data"
        );

        Ok(symbol_count)
    }

    async fn insert_descriptors(&mut self, lookup: &SymbolLookup) -> Result<(), StoreError> {
        for chunk in lookup.nodes().chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO scip_symbols_lookup (upload_id, id, parent_id, segment_type, segment_quality, name) ",
            );
            qb.push_values(chunk, |mut b, node| {
                b.push_bind(self.upload_id)
                    .push_bind(node.id)
                    .push_bind(node.parent_id)
                    .push_bind(node.segment_type.as_str())
                    .push_bind(node.segment_quality.map(|quality| quality.as_str()))
                    .push_bind(node.name.as_str());
            });

            guarded(
                &self.session.cancel,
                "insert descriptors",
                qb.build().execute(&mut *self.session.tx),
            )
            .await?;
        }

        Ok(())
    }

    // Document identity is (upload, path): an earlier row for the same path is
    // removed together with its occurrences before the new one is written.
    async fn replace_document(
        &mut self,
        path: &str,
        document: &StagedDocument,
    ) -> Result<i64, StoreError> {
        let replaced = guarded(
            &self.session.cancel,
            "replace document",
            sqlx::query("DELETE FROM scip_documents WHERE upload_id = ? AND document_path = ?")
                .bind(self.upload_id)
                .bind(path)
                .execute(&mut *self.session.tx),
        )
        .await?
        .rows_affected();
        if replaced > 0 {
            debug!(upload_id = self.upload_id, path = %path, "replaced previously flushed document");
        }

        guarded(
            &self.session.cancel,
            "insert document",
            sqlx::query_scalar(
                "INSERT INTO scip_documents (upload_id, document_path, language, payload_hash, raw_payload) \
                 VALUES (?, ?, ?, ?, ?) \
                 RETURNING id",
            )
            .bind(self.upload_id)
            .bind(path)
            .bind(document.language.as_deref())
            .bind(document.payload_hash.as_str())
            .bind(document.raw_payload.as_slice())
            .fetch_one(&mut *self.session.tx),
        )
        .await
    }

    async fn insert_occurrences(
        &mut self,
        document_id: i64,
        path: &str,
        document: &StagedDocument,
        lookup: &SymbolLookup,
    ) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(document.occurrences.len());
        for occurrence in &document.occurrences {
            rows.push((resolve(lookup, path, &occurrence.symbol)?, occurrence));
        }

        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO scip_occurrences \
                 (document_id, upload_id, symbol_id, start_line, start_character, end_line, end_character, symbol_roles) ",
            );
            qb.push_values(chunk, |mut b, (symbol_id, occurrence)| {
                let [start_line, start_character, end_line, end_character] = occurrence.range;
                b.push_bind(document_id)
                    .push_bind(self.upload_id)
                    .push_bind(*symbol_id)
                    .push_bind(start_line)
                    .push_bind(start_character)
                    .push_bind(end_line)
                    .push_bind(end_character)
                    .push_bind(occurrence.symbol_roles);
            });

            guarded(
                &self.session.cancel,
                "insert occurrences",
                qb.build().execute(&mut *self.session.tx),
            )
            .await?;
        }

        Ok(())
    }

    async fn insert_document_symbols(
        &mut self,
        document_id: i64,
        path: &str,
        document: &StagedDocument,
        lookup: &SymbolLookup,
    ) -> Result<(), StoreError> {
        let mut seen = HashSet::with_capacity(document.symbols.len());
        let mut symbol_ids = Vec::with_capacity(document.symbols.len());
        for symbol in &document.symbols {
            let symbol_id = resolve(lookup, path, symbol)?;
            if seen.insert(symbol_id) {
                symbol_ids.push(symbol_id);
            }
        }

        for chunk in symbol_ids.chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO scip_document_symbols (document_id, upload_id, symbol_id) ",
            );
            qb.push_values(chunk, |mut b, symbol_id| {
                b.push_bind(document_id)
                    .push_bind(self.upload_id)
                    .push_bind(*symbol_id);
            });

            guarded(
                &self.session.cancel,
                "insert document symbols",
                qb.build().execute(&mut *self.session.tx),
            )
            .await?;
        }

        Ok(())
    }
}

fn resolve(lookup: &SymbolLookup, path: &str, symbol: &str) -> Result<i64, StoreError> {
    lookup.leaf_id(symbol).ok_or_else(|| {
        StoreError::Validation(format!("{path}: symbol {symbol:?} missing from dictionary"))
    })
}

pub(crate) fn validate_upload_id(upload_id: i64) -> Result<(), StoreError> {
    if upload_id <= 0 {
        return Err(StoreError::Validation(format!(
            "upload id must be positive, got {upload_id}"
        )));
    }
    Ok(())
}

pub(crate) fn encode_payload(document: &Document) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(document)?;
    Ok(zstd::stream::encode_all(json.as_slice(), PAYLOAD_COMPRESSION_LEVEL)?)
}

pub(crate) fn decode_payload(payload: &[u8]) -> Result<Document, StoreError> {
    let json = zstd::stream::decode_all(payload)?;
    Ok(serde_json::from_slice(&json)?)
}
