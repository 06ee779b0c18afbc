use std::path::Path;

use anyhow::{bail, Context};
use colored::Colorize;
use mpc_cache::{CacheConfig, CacheModule, StoreBackend};
use mpc_store::{CacheStore, FsCacheStore, FsStoreConfig, StreamRecord};
use serde::Serialize;

use crate::cli::*;
use crate::trace;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Index(args) => cmd_index(args, cli.format),
        Command::Verify(args) => cmd_verify(args, cli.format),
        Command::Replay(args) => cmd_replay(args, cli.format),
    }
}

fn open_root(root: &Path) -> anyhow::Result<FsCacheStore> {
    if !root.is_dir() {
        bail!("cache root {} does not exist", root.display());
    }
    FsCacheStore::open(root, FsStoreConfig::default())
        .with_context(|| format!("opening cache at {}", root.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_index(args: IndexArgs, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_root(&args.root)?;
    let messages = store.messages()?;
    let attachments = store.attachments()?;
    let streams = store.streams()?;

    if format == OutputFormat::Json {
        #[derive(Serialize)]
        struct Index<'a> {
            messages: &'a [mpc_store::MessageRecord],
            attachments: &'a [mpc_store::AttachmentRecord],
            streams: &'a [StreamRecord],
        }
        return print_json(&Index {
            messages: &messages,
            attachments: &attachments,
            streams: &streams,
        });
    }

    println!("{} ({})", "Messages".bold(), messages.len());
    for m in &messages {
        println!("  {:#x}/{:#x}  {}", m.folder_id, m.message_id, m.committed_at.to_rfc3339().dimmed());
    }
    println!("{} ({})", "Attachments".bold(), attachments.len());
    for a in &attachments {
        println!("  {:#x}/{:#x}/{}  {}", a.folder_id, a.message_id, a.attachment_id, a.committed_at.to_rfc3339().dimmed());
    }
    println!("{} ({})", "Streams".bold(), streams.len());
    for s in &streams {
        let state = if s.complete { "complete".green() } else { "partial".yellow() };
        println!("  {}  {} bytes  {}  {}", s.location, s.declared_size, state, s.blob.short_hex().cyan());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StreamCheck {
    location: String,
    declared_size: u64,
    blob_len: u64,
    complete: bool,
    ok: bool,
}

fn check_stream(store: &dyn CacheStore, record: &StreamRecord) -> anyhow::Result<StreamCheck> {
    let blob_len = store.blob_len(&record.blob)?;
    // A partial capture may hold any prefix of the stream.
    let ok = if record.complete {
        blob_len == record.declared_size
    } else {
        blob_len <= record.declared_size
    };
    Ok(StreamCheck {
        location: record.location.to_string(),
        declared_size: record.declared_size,
        blob_len,
        complete: record.complete,
        ok,
    })
}

fn verify_store(store: &dyn CacheStore) -> anyhow::Result<Vec<StreamCheck>> {
    store
        .streams()?
        .iter()
        .map(|record| check_stream(store, record))
        .collect()
}

fn cmd_verify(args: VerifyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_root(&args.root)?;
    let checks = verify_store(&store)?;
    let failures = checks.iter().filter(|c| !c.ok).count();

    if format == OutputFormat::Json {
        print_json(&checks)?;
    } else {
        for check in checks.iter().filter(|c| !c.ok) {
            println!(
                "  {} {}  declared {} bytes, blob holds {}",
                "✗".red().bold(),
                check.location,
                check.declared_size,
                check.blob_len
            );
        }
        if failures == 0 {
            println!("{} {} streams verified", "✓".green().bold(), checks.len());
        }
    }
    if failures > 0 {
        bail!("{failures} of {} streams failed verification", checks.len());
    }
    Ok(())
}

fn cmd_replay(args: ReplayArgs, format: OutputFormat) -> anyhow::Result<()> {
    let exchanges = trace::load(&args.trace)?;
    let config = match &args.config {
        Some(path) => CacheConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => CacheConfig {
            backend: StoreBackend::Memory,
            ..CacheConfig::at("memory")
        },
    };
    let module = CacheModule::from_config(&config)?;
    let report = trace::replay(&module, &exchanges)?;

    if format == OutputFormat::Json {
        return print_json(&report);
    }
    println!("{} Replayed {} exchanges", "✓".green().bold(), report.exchanges);
    println!("  Forwarded: {}", report.forwarded.to_string().bold());
    println!("  Served from cache: {}", report.short_circuited.to_string().green());
    println!("  Bytes from server: {}", report.stats.bytes_from_server);
    println!("  Bytes from cache: {}", report.stats.bytes_from_cache);
    println!("  Streams completed: {}", report.stats.streams_completed);
    println!("  Provisional discards: {}", report.stats.provisional_discards);
    if !report.mismatches.is_empty() {
        println!(
            "  {} local replies differ from the recording at {:?}",
            "✗".red().bold(),
            report.mismatches
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_store::{InMemoryCacheStore, StreamLocation};

    #[test]
    fn verify_flags_short_complete_blob() {
        let store = InMemoryCacheStore::new();
        let good = StreamLocation::message(1, 1, 7);
        let bad = StreamLocation::message(1, 2, 7);
        store.blob_append(&good.blob_id(), b"abcd").unwrap();
        store.blob_append(&bad.blob_id(), b"ab").unwrap();
        store.commit_stream(&StreamRecord::new(good, 4, true)).unwrap();
        store.commit_stream(&StreamRecord::new(bad, 4, true)).unwrap();

        let checks = verify_store(&store).unwrap();
        assert_eq!(checks.len(), 2);
        assert_eq!(checks.iter().filter(|c| !c.ok).count(), 1);
    }

    #[test]
    fn partial_prefix_is_ok() {
        let store = InMemoryCacheStore::new();
        let loc = StreamLocation::attachment(1, 1, 0, 7);
        store.blob_append(&loc.blob_id(), b"ab").unwrap();
        store.commit_stream(&StreamRecord::new(loc, 4, false)).unwrap();
        assert!(verify_store(&store).unwrap()[0].ok);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_root(&dir.path().join("nope")).is_err());
        assert!(open_root(dir.path()).is_ok());
    }
}
