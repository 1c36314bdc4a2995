use scipstore_types::Metadata;
use serde::{Deserialize, Serialize};

// Per-upload metadata as it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProcessedMetadata {
    pub text_document_encoding: String,
    pub tool_name: String,
    pub tool_version: String,
    pub tool_arguments: Vec<String>,
    pub protocol_version: i32,
}

impl From<&Metadata> for ProcessedMetadata {
    fn from(metadata: &Metadata) -> Self {
        Self {
            text_document_encoding: metadata.text_document_encoding.clone(),
            tool_name: metadata.tool_info.name.clone(),
            tool_version: metadata.tool_info.version.clone(),
            tool_arguments: metadata.tool_info.arguments.clone(),
            protocol_version: metadata.version,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MetadataRow {
    pub text_document_encoding: String,
    pub tool_name: String,
    pub tool_version: String,
    pub tool_arguments: String,
    pub protocol_version: i32,
}

impl MetadataRow {
    pub(crate) fn into_metadata(self) -> Result<ProcessedMetadata, serde_json::Error> {
        Ok(ProcessedMetadata {
            text_document_encoding: self.text_document_encoding,
            tool_name: self.tool_name,
            tool_version: self.tool_version,
            tool_arguments: serde_json::from_str(&self.tool_arguments)?,
            protocol_version: self.protocol_version,
        })
    }
}

// An occurrence as staged by a writer, before its symbol is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedOccurrence {
    pub range: [i32; 4],
    pub symbol: String,
    pub symbol_roles: i32,
}

// A document waiting for the next flush.
#[derive(Debug, Clone)]
pub(crate) struct StagedDocument {
    pub language: Option<String>,
    pub payload_hash: String,
    pub raw_payload: Vec<u8>,
    pub symbols: Vec<String>,
    pub occurrences: Vec<StagedOccurrence>,
}

impl StagedDocument {
    pub(crate) fn symbol_names(&self) -> impl Iterator<Item = &str> {
        self.symbols
            .iter()
            .map(String::as_str)
            .chain(self.occurrences.iter().map(|occ| occ.symbol.as_str()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub upload_id: i64,
    pub documents: usize,
    pub symbols: u64,
    pub flushes: usize,
}
