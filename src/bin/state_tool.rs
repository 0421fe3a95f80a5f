use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dashstate::client::{FileSnapshotSink, HttpRemoteStore, RemoteStore, SyncEngine};
use dashstate::core::{Document, Envelope};
use dashstate::server::{BackupEntry, BackupSource, DeltaThresholds, measure_delta};
use dashstate::EngineConfig;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "state-tool")]
#[command(about = "Operator tooling for the dashboard state server")]
struct Cli {
    /// Server base URL; defaults to DASHSTATE_REMOTE_URL.
    #[arg(long, global = true)]
    url: Option<String>,
    /// Bearer token; defaults to DASHSTATE_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print or save the canonical state.
    Pull {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replace the canonical state with a document or envelope file.
    Push {
        #[arg(long)]
        file: PathBuf,
    },
    ListBackups,
    Restore {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "primary")]
        source: String,
    },
    Upload {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Export a local engine directory as a snapshot file, without contacting
    /// the server.
    Export {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Report whether replacing one document with another is a great delta.
    Delta {
        #[arg(long)]
        previous: PathBuf,
        #[arg(long)]
        next: PathBuf,
        #[arg(long, default_value = "appMeta")]
        ignore_key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Pull { out } => {
            let remote = connect(cli.url, cli.token)?;
            let data = remote.pull().await.context("pull failed")?;
            let body = Envelope::new(data).to_pretty_bytes()?;
            match out {
                Some(path) => {
                    ensure_parent_dir(&path)?;
                    fs::write(&path, &body)
                        .with_context(|| format!("Failed to write '{}'", path.display()))?;
                    println!("State written to {}", path.display());
                }
                None => println!("{}", String::from_utf8_lossy(&body)),
            }
            Ok(())
        }
        Command::Push { file } => {
            let remote = connect(cli.url, cli.token)?;
            let data = read_document(&file)?;
            remote.push(&data).await.context("push failed")?;
            println!("Pushed {} keys", data.len());
            Ok(())
        }
        Command::ListBackups => {
            let remote = connect(cli.url, cli.token)?;
            let listing = remote.list_backups().await.context("listing failed")?;
            print_entries("primary", &listing.primary);
            print_entries("secondary", &listing.secondary);
            Ok(())
        }
        Command::Restore { name, source } => {
            let source = BackupSource::parse(Some(&source))
                .ok_or_else(|| anyhow!("unknown backup source '{}'", source))?;
            let remote = connect(cli.url, cli.token)?;
            remote
                .restore_backup(&name, source)
                .await
                .with_context(|| format!("restore of '{}' failed", name))?;
            println!("Restored {} from {}", name, source.as_str());
            Ok(())
        }
        Command::Upload { file, name } => {
            let remote = connect(cli.url, cli.token)?;
            let backup = read_json(&file)?;
            let uploaded = remote
                .upload_backup(name.as_deref(), &backup)
                .await
                .context("upload failed")?;
            println!("Uploaded as {}", uploaded);
            Ok(())
        }
        Command::Export { dir, out } => export_local(&dir, &out).await,
        Command::Delta {
            previous,
            next,
            ignore_key,
        } => {
            let previous = read_document(&previous)?;
            let next = read_document(&next)?;
            let report = measure_delta(&previous, &next, Some(&ignore_key));
            let thresholds = DeltaThresholds::default();
            println!(
                "size_ratio={:.3} key_ratio={:.3} identical={} great={}",
                report.size_ratio,
                report.key_ratio,
                report.identical,
                report.is_great(&thresholds)
            );
            Ok(())
        }
    }
}

fn connect(url: Option<String>, token: Option<String>) -> Result<HttpRemoteStore> {
    let mut config = EngineConfig::from_env()?;
    if let Some(url) = url {
        config = config.remote_url(&url);
    }
    if let Some(token) = token {
        config = config.bearer_token(&token);
    }

    HttpRemoteStore::from_config(&config)?
        .ok_or_else(|| anyhow!("no server URL: pass --url or set DASHSTATE_REMOTE_URL"))
}

async fn export_local(dir: &Path, out: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("'{}' is not a directory", dir.display());
    }
    let engine = SyncEngine::open(EngineConfig::offline(), dir)?;
    let report = engine.initialize(false).await;

    ensure_parent_dir(out)?;
    let sink = FileSnapshotSink::new(out);
    engine
        .write_snapshot_to(&sink)
        .await
        .with_context(|| format!("Failed to write snapshot to '{}'", out.display()))?;

    println!(
        "Exported {} keys to {} ({:?})",
        engine.snapshot().len(),
        out.display(),
        report.local
    );
    Ok(())
}

fn print_entries(label: &str, entries: &[BackupEntry]) {
    println!("{} ({}):", label, entries.len());
    for entry in entries {
        println!("  {}  {:>10} B  {}", entry.name, entry.size, entry.modified_at);
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory '{}'", parent.display()))?;
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("'{}' is not valid JSON", path.display()))
}

fn read_document(path: &Path) -> Result<Document> {
    let value = read_json(path)?;
    Envelope::decode_data(&value)
        .ok_or_else(|| anyhow!("'{}' does not contain a JSON object", path.display()))
}
