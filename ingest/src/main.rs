mod logging;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use scipstore::{CancellationToken, IngestOptions, Store, StoreConfig};
use scipstore_types::Index;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "scipstore-ingest",
    version,
    about = "Load a SCIP index into the symbol store"
)]
struct IngestConfig {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 4)]
    max_connections: u32,
    /// How long to wait for another writer's lock (e.g. `5s`, `1m`).
    #[arg(long, env = "BUSY_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    busy_timeout: Duration,
    /// Documents staged before each flush.
    #[arg(long, env = "FLUSH_EVERY", default_value_t = 1000)]
    flush_every: usize,
    #[arg(long)]
    upload_id: i64,
    /// Treat the input as zstd-compressed regardless of its extension.
    #[arg(long)]
    compressed: bool,
    /// Increase logging verbosity (use -vv for trace level).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// JSON-encoded SCIP index (`.zst` inputs are decompressed).
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = IngestConfig::parse();
    logging::init_logging(config.verbose)?;

    let store_config = StoreConfig::new(config.database_url.clone())
        .with_max_connections(config.max_connections)
        .with_busy_timeout(config.busy_timeout);

    let cancel = CancellationToken::new();
    let store = Store::connect(&store_config)
        .await
        .context("failed to open store")?
        .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    let input = config.input.clone();
    let compressed = config.compressed;
    let index = tokio::task::spawn_blocking(move || load_index(&input, compressed))
        .await
        .context("index loader panicked")??;
    info!(
        path = %config.input.display(),
        documents = index.documents.len(),
        tool = %index.metadata.tool_info.name,
        "loaded SCIP index"
    );

    let options = IngestOptions {
        flush_every: config.flush_every,
    };
    let summary = scipstore::process_upload(&store, config.upload_id, index, &options)
        .await
        .with_context(|| format!("failed to ingest upload {}", config.upload_id))?;

    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn load_index(path: &Path, compressed: bool) -> Result<Index> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let is_zstd = compressed || path.extension().is_some_and(|ext| ext == "zst");

    let reader: Box<dyn Read> = if is_zstd {
        Box::new(
            zstd::stream::read::Decoder::new(file)
                .with_context(|| format!("failed to start zstd decoder for {}", path.display()))?,
        )
    } else {
        Box::new(file)
    };

    serde_json::from_reader(BufReader::new(reader))
        .with_context(|| format!("failed to decode SCIP index {}", path.display()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(?err, "failed to listen for CTRL+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(?err, "failed to listen for TERM signal"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("shutdown signal received, cancelling upload");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const INDEX: &str = r#"{
        "metadata": {
            "version": 1,
            "tool_info": { "name": "scip-go", "version": "0.4.0" },
            "text_document_encoding": "UTF8"
        },
        "documents": [
            {
                "relative_path": "internal/util.go",
                "occurrences": [
                    { "range": [3, 25, 30], "symbol": "scip-go gomod example 1.0 util/Ident#", "symbol_roles": 1 }
                ]
            }
        ]
    }"#;

    #[test]
    fn loads_plain_json() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("index.json");
        std::fs::write(&path, INDEX).expect("write index");

        let index = load_index(&path, false).expect("load index");
        assert_eq!(index.metadata.tool_info.name, "scip-go");
        assert_eq!(index.documents[0].occurrences[0].full_range(), Some([3, 25, 3, 30]));
    }

    #[test]
    fn decompresses_by_extension_or_flag() {
        let dir = tempfile::tempdir().expect("temp dir");
        let compressed = zstd::stream::encode_all(INDEX.as_bytes(), 3).expect("compress");

        let by_extension = dir.path().join("index.json.zst");
        std::fs::write(&by_extension, &compressed).expect("write index");
        let index = load_index(&by_extension, false).expect("load index");
        assert_eq!(index.documents.len(), 1);

        let by_flag = dir.path().join("index.bin");
        let mut file = File::create(&by_flag).expect("create index");
        file.write_all(&compressed).expect("write index");
        let index = load_index(&by_flag, true).expect("load index");
        assert_eq!(index.documents[0].relative_path, "internal/util.go");
    }

    #[test]
    fn reports_malformed_input() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("index.json");
        std::fs::write(&path, "{ not json").expect("write index");

        let err = load_index(&path, false).expect_err("should fail");
        assert!(err.to_string().contains("failed to decode SCIP index"), "{err}");
    }

    #[test]
    fn parses_cli_flags() {
        let config = IngestConfig::try_parse_from([
            "scipstore-ingest",
            "--database-url",
            "sqlite://scip.db",
            "--upload-id",
            "24",
            "--busy-timeout",
            "250ms",
            "-vv",
            "index.scip.zst",
        ])
        .expect("parse flags");

        assert_eq!(config.upload_id, 24);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.verbose, 2);
        assert_eq!(config.flush_every, 1000);
        assert_eq!(config.input, PathBuf::from("index.scip.zst"));
    }
}
