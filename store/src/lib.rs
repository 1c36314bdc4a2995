//! Storage engine for SCIP code-intelligence uploads.
//!
//! Symbol strings are parsed into segments ([`symbols`]), interned into a
//! per-upload descriptor tree ([`lookup`]) and written together with documents
//! and occurrences by a [`ScipWriter`] that borrows one transactional
//! [`Session`].

pub mod config;
pub mod error;
pub mod ingest;
pub mod lookup;
pub mod models;
pub mod store;
pub mod symbols;
pub mod writer;

#[cfg(test)]
mod testing;

pub use config::StoreConfig;
pub use error::StoreError;
pub use ingest::{IngestOptions, process_upload};
pub use lookup::{BuildError, DescriptorNode, SegmentCache, SymbolLookup, build_symbol_lookup};
pub use models::{ProcessedMetadata, UploadSummary};
pub use store::{Session, Store};
pub use symbols::{
    DescriptorKind, ParseError, ParseErrorReason, Segment, SegmentType, join_segments,
    parse_symbol,
};
pub use writer::ScipWriter;
pub use tokio_util::sync::CancellationToken;
