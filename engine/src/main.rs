#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::io::{BufRead, Write};
use std::sync::Arc;

use engine::btree::{BTreeSlice, LoadOptions, bulk_load};
use engine::config::EngineConfig;
use engine::protocol::ScanRequest;
use engine::scan::ScanHandle;
use engine::storage::{BlockStore, BufferCache, FileStore, Transaction};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The loader places the superblock in the first block of a new file.
const SUPERBLOCK_ID: u64 = 0;

const USAGE: &str = "usage:
  btree-scan load                  read sorted or unsorted KEY<TAB>VALUE lines from stdin
  btree-scan get KEY
  btree-scan scan [--reverse] [--inclusive] [--limit N] [--batch N] [START [END]]";

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Load,
    Get(Vec<u8>),
    Scan(ScanRequest),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            std::process::exit(2);
        }
    };

    // Load configuration from environment variables
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: data_file={}, cache_pages={}, batch_size={}",
        config.data_file.display(),
        config.cache_pages,
        config.batch_size
    );

    let result = match command {
        Command::Load => load(&config),
        Command::Get(key) => get(&config, &key),
        Command::Scan(request) => scan(&config, request).await,
    };
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, String> {
    let mut args = args.into_iter();
    let Some(name) = args.next() else {
        return Err("missing command".to_string());
    };

    match name.as_str() {
        "load" => match args.next() {
            None => Ok(Command::Load),
            Some(extra) => Err(format!("unexpected argument: {extra}")),
        },
        "get" => match (args.next(), args.next()) {
            (Some(key), None) => Ok(Command::Get(key.into_bytes())),
            _ => Err("get takes exactly one key".to_string()),
        },
        "scan" => parse_scan(args).map(Command::Scan),
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_scan(mut args: impl Iterator<Item = String>) -> Result<ScanRequest, String> {
    let mut request = ScanRequest::default();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--reverse" => request.reverse = true,
            "--inclusive" => request.inclusive_end = true,
            "--limit" => request.limit = Some(parse_count(&arg, args.next())?),
            "--batch" => request.batch_size = Some(parse_count(&arg, args.next())?),
            flag if flag.starts_with("--") => return Err(format!("unknown flag: {flag}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    if let Some(start) = positional.next() {
        request.start = start.into_bytes();
    }
    request.end = positional.next().map(String::into_bytes);
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(request)
}

fn parse_count(flag: &str, value: Option<String>) -> Result<usize, String> {
    let value = value.ok_or_else(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .map_err(|_| format!("{flag}: '{value}' is not a number"))
}

fn open_cache(config: &EngineConfig) -> CliResult<Arc<BufferCache>> {
    let store: Arc<dyn BlockStore> = Arc::new(FileStore::open(&config.data_file)?);
    Ok(BufferCache::new(store, config.cache_pages))
}

/// Build a new tree file from tab-separated lines on stdin.
fn load(config: &EngineConfig) -> CliResult<()> {
    let mut entries = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('\t').unwrap_or((line.as_str(), ""));
        entries.push((key.as_bytes().to_vec(), value.as_bytes().to_vec()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let store: Arc<dyn BlockStore> = Arc::new(FileStore::create(&config.data_file)?);
    let cache = BufferCache::new(Arc::clone(&store), config.cache_pages);
    let txn = Transaction::begin(&cache);
    let slice = bulk_load(&txn, &entries, &LoadOptions::default())?;
    let superblock = slice.superblock(&txn)?;
    drop(txn);
    store.sync()?;

    tracing::info!(
        entries = superblock.entry_count,
        height = superblock.height,
        blocks = store.block_count(),
        "tree written to {}",
        config.data_file.display()
    );
    Ok(())
}

fn get(config: &EngineConfig, key: &[u8]) -> CliResult<()> {
    let cache = open_cache(config)?;
    let txn = Transaction::begin(&cache);
    match BTreeSlice::new(SUPERBLOCK_ID).get(&txn, key)? {
        Some(value) => println!("{}", value.escape_ascii()),
        None => {
            tracing::info!("key {} not found", key.escape_ascii());
        }
    }
    Ok(())
}

async fn scan(config: &EngineConfig, mut request: ScanRequest) -> CliResult<()> {
    request.batch_size = request.batch_size.or(Some(config.batch_size));
    let plan = request.to_plan()?;
    tracing::debug!(range = %plan.range, direction = ?plan.direction, "starting scan");

    let cache = open_cache(config)?;
    let mut handle = ScanHandle::spawn(cache, BTreeSlice::new(SUPERBLOCK_ID), plan);

    let mut out = std::io::stdout().lock();
    let mut delivered = 0usize;
    while let Some(batch) = handle.next().await {
        for (key, value) in &batch {
            writeln!(out, "{}\t{}", key.escape_ascii(), value.escape_ascii())?;
        }
        delivered += batch.len();
    }
    out.flush()?;

    let outcome = handle.finish().await?;
    tracing::info!(delivered, ?outcome, "scan finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_args(args(&["load"])), Ok(Command::Load));
        assert_eq!(
            parse_args(args(&["get", "apple"])),
            Ok(Command::Get(b"apple".to_vec()))
        );
        assert!(parse_args(args(&[])).is_err());
        assert!(parse_args(args(&["get"])).is_err());
        assert!(parse_args(args(&["load", "extra"])).is_err());
        assert!(parse_args(args(&["drop"])).is_err());
    }

    #[test]
    fn test_parse_scan() {
        let command = parse_args(args(&[
            "scan",
            "--reverse",
            "--limit",
            "10",
            "a",
            "m",
            "--inclusive",
        ]))
        .expect("parse");
        assert_eq!(
            command,
            Command::Scan(ScanRequest {
                start: b"a".to_vec(),
                end: Some(b"m".to_vec()),
                inclusive_end: true,
                reverse: true,
                limit: Some(10),
                batch_size: None,
            })
        );

        assert_eq!(
            parse_args(args(&["scan"])),
            Ok(Command::Scan(ScanRequest::default()))
        );
        assert!(parse_args(args(&["scan", "--limit"])).is_err());
        assert!(parse_args(args(&["scan", "--limit", "x"])).is_err());
        assert!(parse_args(args(&["scan", "a", "b", "c"])).is_err());
        assert!(parse_args(args(&["scan", "--fast"])).is_err());
    }
}
