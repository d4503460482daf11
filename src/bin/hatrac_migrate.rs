//! CLI entry point for hatrac-migrate: content migration over aux URLs.
//!
//! `link` rewrites local versions to reference equivalent content on a
//! remote hatrac deployment (after verifying the remote's declared
//! digests), freeing local storage to be reclaimed. `transfer` pulls
//! linked content back into local storage, verifying digests before the
//! link is dropped.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use hatrac::config::load_config;
use hatrac::directory::records::{AuxRecord, VersionRecord};
use hatrac::directory::sqlite::SqliteDirectory;
use hatrac::storage::backend::{ByteStream, StorageBackend};
use hatrac::storage::build_storage;

#[derive(Parser)]
#[command(name = "hatrac-migrate", about = "Hatrac content migration tool")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "hatrac.conf.json")]
    config: String,

    /// Restrict the sweep to names under this prefix.
    #[arg(long)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite versions to reference a remote hatrac via aux URLs.
    Link {
        /// Base URL of the remote service (including its prefix).
        #[arg(long)]
        remote: String,
        /// Delete local backend content after a successful link.
        #[arg(long, default_value_t = false)]
        reclaim: bool,
    },
    /// Pull linked content back into local storage, dropping the links.
    Transfer,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let rc = run(cli).await;
    std::process::exit(rc);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading config: {e}");
            return 1;
        }
    };

    let directory = match SqliteDirectory::open(&config.database_path, config.database_max_retries)
    {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error opening directory: {e}");
            return 1;
        }
    };

    let storage = match build_storage(&config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error initializing storage: {e}");
            return 1;
        }
    };

    let versions = match directory.enumerate_all_versions(cli.prefix.as_deref()) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error enumerating versions: {e}");
            return 1;
        }
    };

    match cli.command {
        Commands::Link { remote, reclaim } => {
            link(&directory, storage, versions, &remote, reclaim).await
        }
        Commands::Transfer => transfer(&directory, storage, versions).await,
    }
}

/// Percent-encode a stored name for the remote URL path.
fn encode_name(name: &str) -> String {
    name.split('/')
        .map(|seg| {
            percent_encoding::utf8_percent_encode(seg, percent_encoding::NON_ALPHANUMERIC)
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn remote_url(remote: &str, record: &VersionRecord) -> String {
    format!(
        "{}{}:{}",
        remote.trim_end_matches('/'),
        encode_name(&record.object_name),
        record.version_key
    )
}

async fn link(
    directory: &SqliteDirectory,
    storage: Arc<dyn StorageBackend>,
    versions: Vec<VersionRecord>,
    remote: &str,
    reclaim: bool,
) -> i32 {
    let client = reqwest::Client::new();
    let mut linked = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for record in versions {
        // Already remote or renamed: nothing to link.
        if record.aux.url.is_some() || record.aux.rename_to.is_some() {
            skipped += 1;
            continue;
        }
        if record.metadata.content_md5.is_none() && record.metadata.content_sha256.is_none() {
            eprintln!(
                "  SKIP {}:{} (no stored digests to verify against)",
                record.object_name, record.version_key
            );
            skipped += 1;
            continue;
        }

        let url = remote_url(remote, &record);
        let response = match client.head(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                eprintln!("  FAIL {url}: remote returned {}", r.status());
                failed += 1;
                continue;
            }
            Err(e) => {
                eprintln!("  FAIL {url}: {e}");
                failed += 1;
                continue;
            }
        };

        // The remote must declare matching digests before we trust it
        // with our bytes.
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let md5_ok = match (&record.metadata.content_md5, header("content-md5")) {
            (Some(local), Some(remote)) => *local == remote,
            (Some(_), None) => false,
            (None, _) => true,
        };
        let sha_ok = match (&record.metadata.content_sha256, header("content-sha256")) {
            (Some(local), Some(remote)) => *local == remote,
            (Some(_), None) => false,
            (None, _) => true,
        };
        if !md5_ok || !sha_ok {
            eprintln!("  FAIL {url}: remote digests do not match");
            failed += 1;
            continue;
        }

        let aux = AuxRecord {
            url: Some(url.clone()),
            ..record.aux.clone()
        };
        if let Err(e) = directory.set_version_aux(record.id, &aux) {
            eprintln!("  FAIL {url}: {e}");
            failed += 1;
            continue;
        }

        if reclaim {
            let name = record
                .aux
                .hname
                .clone()
                .unwrap_or_else(|| record.object_name.clone());
            let version = record
                .aux
                .hversion
                .clone()
                .unwrap_or_else(|| record.version_key.clone());
            if let Err(e) = storage
                .delete(&name, &version, record.aux.version.as_deref())
                .await
            {
                eprintln!("  WARNING: local delete for {name}:{version}: {e}");
            }
        }
        linked += 1;
    }

    eprintln!("Linked {linked}, skipped {skipped}, failed {failed}");
    if failed > 0 {
        1
    } else {
        0
    }
}

async fn transfer(
    directory: &SqliteDirectory,
    storage: Arc<dyn StorageBackend>,
    versions: Vec<VersionRecord>,
) -> i32 {
    let client = reqwest::Client::new();
    let mut transferred = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for record in versions {
        let Some(url) = record.aux.url.clone() else {
            skipped += 1;
            continue;
        };

        let response = match client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                eprintln!("  FAIL {url}: remote returned {}", r.status());
                failed += 1;
                continue;
            }
            Err(e) => {
                eprintln!("  FAIL {url}: {e}");
                failed += 1;
                continue;
            }
        };

        let size = match record.size {
            Some(size) if size >= 0 => size as u64,
            _ => {
                eprintln!("  FAIL {url}: version has no recorded size");
                failed += 1;
                continue;
            }
        };

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );

        let stored = match storage
            .create_from_stream(&record.object_name, stream, size, &record.metadata)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                eprintln!("  FAIL {url}: {e}");
                failed += 1;
                continue;
            }
        };

        // Verify the fetched bytes against the version's declared
        // digests before dropping the link.
        if let Some(ref digests) = stored.digests {
            let md5_ok = record
                .metadata
                .content_md5
                .as_ref()
                .map(|d| *d == digests.md5)
                .unwrap_or(true);
            let sha_ok = record
                .metadata
                .content_sha256
                .as_ref()
                .map(|d| *d == digests.sha256)
                .unwrap_or(true);
            if !md5_ok || !sha_ok {
                eprintln!("  FAIL {url}: fetched content does not match stored digests");
                let _ = storage
                    .delete(&record.object_name, &stored.version_key, None)
                    .await;
                failed += 1;
                continue;
            }
        }

        // The pulled copy lives under a fresh backend key; address it
        // through hversion and drop the link.
        let aux = AuxRecord {
            url: None,
            hversion: Some(stored.version_key.clone()),
            version: stored.backend_version.clone(),
            ..record.aux.clone()
        };
        if let Err(e) = directory.set_version_aux(record.id, &aux) {
            eprintln!("  FAIL {url}: {e}");
            failed += 1;
            continue;
        }
        transferred += 1;
    }

    eprintln!("Transferred {transferred}, skipped {skipped}, failed {failed}");
    if failed > 0 {
        1
    } else {
        0
    }
}
