use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use pushwork::config::{Config, ConfigOverrides};
use pushwork::engine::{EngineOptions, SyncEngine, SyncResult};
use pushwork::filters::SyncFilters;
use pushwork::path_util;
use pushwork::repo::{InMemoryRepo, Repo};
use pushwork::watch::{self, WatchOptions};

#[derive(Parser, Debug)]
#[command(name = "pushwork", version, about = "Bidirectional sync between a directory tree and a CRDT document graph")]
struct Cli {
    /// Path to a local config file, overriding `<root>/.pushwork/config.json`
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create `.pushwork/`, create the root directory document, and run an initial sync
    Init {
        path: PathBuf,
        #[arg(long = "sync-server")]
        sync_server: Option<String>,
        #[arg(long = "sync-server-storage-id")]
        sync_server_storage_id: Option<String>,
    },

    /// Create `.pushwork/`, point it at an existing root directory document, and sync to download
    Clone {
        url: String,
        path: PathBuf,
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Run the full two-phase sync protocol
    Sync {
        path: Option<PathBuf>,
        #[arg(long = "dry-run", default_value_t = false)]
        dry_run: bool,
    },

    /// Push local changes only; no network barrier
    Commit {
        path: Option<PathBuf>,
        #[arg(long = "dry-run", default_value_t = false)]
        dry_run: bool,
    },

    /// Preview pending changes without mutating the repository or snapshot
    Diff {
        path: Option<PathBuf>,
        #[arg(long = "name-only", default_value_t = false)]
        name_only: bool,
    },

    /// Report the snapshot summary and pending change count
    Status { path: Option<PathBuf> },

    /// Print the root directory document's URL
    Url { path: Option<PathBuf> },

    /// List tracked files
    Ls {
        path: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        long: bool,
    },

    /// Restore to a prior synced state (not implemented)
    Checkout {
        sync_id: String,
        path: Option<PathBuf>,
    },

    /// Print sync history (stubbed)
    Log { path: Option<PathBuf> },

    /// Delete the local `.pushwork/` control directory
    Rm { path: Option<PathBuf> },

    /// Run a script, then sync, on every filesystem change
    Watch {
        path: Option<PathBuf>,
        #[arg(long)]
        script: Option<String>,
        #[arg(long = "dir")]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn resolve_root(path: Option<&Path>) -> PathBuf {
    path_util::absolutize_path(path.unwrap_or_else(|| Path::new(".")))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn open_repo(root: &Path) -> Result<Arc<dyn Repo>> {
    let automerge_dir = root.join(".pushwork").join("automerge");
    let repo = InMemoryRepo::load_storage(automerge_dir).context("load repository storage")?;
    Ok(repo)
}

async fn open_engine(root: &Path, config_flag: Option<&Path>) -> Result<SyncEngine> {
    let control_dir = root.join(".pushwork");
    if !control_dir.join("snapshot.json").exists() {
        bail!(
            "{} is not a pushwork workspace (run `pushwork init` first)",
            root.display()
        );
    }
    let cfg = Config::load_with_overrides_from(root, config_flag, ConfigOverrides::default())
        .with_context(|| format!("load config for {}", root.display()))?;
    pushwork::logging::init_default_log_file(root).ok();
    let repo = open_repo(root).await?;
    let filters = SyncFilters::load(root, &cfg.exclude_patterns).context("load exclude filters")?;
    Ok(SyncEngine::new(root.to_path_buf(), repo, filters, options_from_config(&cfg)))
}

fn options_from_config(cfg: &Config) -> EngineOptions {
    EngineOptions {
        artifact_directories: cfg.artifact_directories.clone(),
        move_detection_threshold: cfg.move_detection_threshold,
        sync_enabled: cfg.sync_enabled && cfg.sync_server.is_some(),
        relay_id: cfg
            .sync_server_storage_id
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        ..EngineOptions::default()
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init {
            path,
            sync_server,
            sync_server_storage_id,
        } => cmd_init(&path, cli.config.as_deref(), sync_server, sync_server_storage_id).await,
        Commands::Clone { url, path, force } => cmd_clone(&url, &path, force).await,
        Commands::Sync { path, dry_run } => cmd_sync(resolve_root(path.as_deref()), cli.config.as_deref(), dry_run).await,
        Commands::Commit { path, dry_run } => {
            cmd_commit(resolve_root(path.as_deref()), cli.config.as_deref(), dry_run).await
        }
        Commands::Diff { path, name_only } => cmd_diff(resolve_root(path.as_deref()), cli.config.as_deref(), name_only).await,
        Commands::Status { path } => cmd_status(resolve_root(path.as_deref()), cli.config.as_deref()).await,
        Commands::Url { path } => cmd_url(resolve_root(path.as_deref())).await,
        Commands::Ls { path, long } => cmd_ls(resolve_root(path.as_deref()), long).await,
        Commands::Checkout { sync_id, path } => cmd_checkout(&sync_id, resolve_root(path.as_deref())),
        Commands::Log { path } => cmd_log(resolve_root(path.as_deref())),
        Commands::Rm { path } => cmd_rm(resolve_root(path.as_deref())),
        Commands::Watch { path, script, dir } => {
            cmd_watch(resolve_root(path.as_deref()), cli.config.as_deref(), script, dir).await
        }
    }
}

async fn cmd_init(
    path: &Path,
    config_flag: Option<&Path>,
    sync_server: Option<String>,
    sync_server_storage_id: Option<String>,
) -> Result<i32> {
    if sync_server.is_some() != sync_server_storage_id.is_some() {
        bail!("--sync-server and --sync-server-storage-id must be given together");
    }
    let root = resolve_root(Some(path));
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let control_dir = root.join(".pushwork");
    if control_dir.join("snapshot.json").exists() {
        bail!("{} is already initialized", root.display());
    }
    pushwork::workspace::ensure_control_dir(&control_dir)?;

    let cfg = Config::load_with_overrides_from(
        &root,
        config_flag,
        ConfigOverrides {
            sync_server: sync_server.clone(),
            sync_server_storage_id: sync_server_storage_id.clone(),
            sync_enabled: None,
        },
    )?;
    cfg.save().context("save local config")?;

    pushwork::logging::init_default_log_file(&root).ok();
    let repo = open_repo(&root).await?;
    let filters = SyncFilters::load(&root, &cfg.exclude_patterns)?;
    let engine = SyncEngine::new(root.clone(), repo, filters, options_from_config(&cfg));
    let url = engine.init_root(now()).await.context("create root directory document")?;
    let result = engine.sync(now()).await.context("initial sync")?;
    print_sync_result(&result);
    println!("root directory url: {url}");
    Ok(exit_code_for(&result))
}

async fn cmd_clone(url: &str, path: &Path, force: bool) -> Result<i32> {
    let root = resolve_root(Some(path));
    if root.exists() {
        let has_entries = std::fs::read_dir(&root)
            .map(|mut it| it.next().is_some())
            .unwrap_or(false);
        if has_entries && !force {
            bail!("{} is not empty (pass --force to clone into it anyway)", root.display());
        }
    }
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let control_dir = root.join(".pushwork");
    pushwork::workspace::ensure_control_dir(&control_dir)?;

    let cfg = Config::load_with_overrides(&root, ConfigOverrides::default())?;
    cfg.save().context("save local config")?;

    pushwork::logging::init_default_log_file(&root).ok();
    let repo = open_repo(&root).await?;
    let filters = SyncFilters::load(&root, &cfg.exclude_patterns)?;
    let engine = SyncEngine::new(root.clone(), repo, filters, options_from_config(&cfg));
    engine.set_root_directory_url(url, now()).await.context("record root directory url")?;
    let result = engine.sync(now()).await.context("clone sync")?;
    print_sync_result(&result);
    Ok(exit_code_for(&result))
}

async fn cmd_sync(root: PathBuf, config_flag: Option<&Path>, dry_run: bool) -> Result<i32> {
    let engine = open_engine(&root, config_flag).await?;
    if dry_run {
        return cmd_diff_inner(&engine, false).await;
    }
    let result = engine.sync(now()).await?;
    print_sync_result(&result);
    Ok(exit_code_for(&result))
}

async fn cmd_commit(root: PathBuf, config_flag: Option<&Path>, dry_run: bool) -> Result<i32> {
    let engine = open_engine(&root, config_flag).await?;
    if dry_run {
        return cmd_diff_inner(&engine, false).await;
    }
    let result = engine.commit_local(now()).await?;
    print_sync_result(&result);
    Ok(exit_code_for(&result))
}

async fn cmd_diff(root: PathBuf, config_flag: Option<&Path>, name_only: bool) -> Result<i32> {
    let engine = open_engine(&root, config_flag).await?;
    cmd_diff_inner(&engine, name_only).await
}

async fn cmd_diff_inner(engine: &SyncEngine, name_only: bool) -> Result<i32> {
    let changes = engine.preview_changes().await?;
    let mut changed: Vec<_> = changes
        .into_iter()
        .filter(|c| c.change_type != pushwork::change_detector::ChangeType::NoChange)
        .collect();
    changed.sort_by(|a, b| a.path.cmp(&b.path));
    for change in &changed {
        if name_only {
            println!("{}", change.path);
        } else {
            println!("{}\t{:?}", change.path, change.change_type);
        }
    }
    Ok(0)
}

async fn cmd_status(root: PathBuf, config_flag: Option<&Path>) -> Result<i32> {
    let engine = open_engine(&root, config_flag).await?;
    let status = engine.get_status().await?;
    match status.snapshot {
        Some(snapshot) => {
            println!("root: {}", snapshot.root_path.display());
            println!("files tracked: {}", snapshot.files.len());
            println!("directories tracked: {}", snapshot.directories.len());
            println!("pending changes: {}", status.change_count);
            if let Some(ts) = status.last_sync {
                println!("last sync: {ts}");
            }
        }
        None => println!("not initialized"),
    }
    Ok(0)
}

async fn cmd_url(root: PathBuf) -> Result<i32> {
    let control_dir = root.join(".pushwork");
    if !control_dir.join("snapshot.json").exists() {
        bail!("{} is not a pushwork workspace", root.display());
    }
    let store = pushwork::snapshot::SnapshotStore::new(control_dir);
    let snapshot = store.load()?.ok_or_else(|| anyhow::anyhow!("no snapshot found"))?;
    if snapshot.root_directory_url.is_empty() {
        bail!("root directory url is not set");
    }
    println!("{}", snapshot.root_directory_url);
    Ok(0)
}

async fn cmd_ls(root: PathBuf, long: bool) -> Result<i32> {
    let control_dir = root.join(".pushwork");
    if !control_dir.join("snapshot.json").exists() {
        bail!("{} is not a pushwork workspace", root.display());
    }
    let store = pushwork::snapshot::SnapshotStore::new(control_dir);
    let snapshot = store.load()?.ok_or_else(|| anyhow::anyhow!("no snapshot found"))?;
    let mut paths: Vec<_> = snapshot.files.keys().cloned().collect();
    paths.sort();
    for path in paths {
        let entry = &snapshot.files[&path];
        if long {
            println!("{}\t{}\t{}", path, entry.mime_type, entry.url);
        } else {
            println!("{path}");
        }
    }
    Ok(0)
}

fn cmd_checkout(_sync_id: &str, root: PathBuf) -> Result<i32> {
    bail!("checkout is not implemented for {}", root.display());
}

fn cmd_log(root: PathBuf) -> Result<i32> {
    println!("sync history is not tracked for {}", root.display());
    Ok(0)
}

fn cmd_rm(root: PathBuf) -> Result<i32> {
    let control_dir = root.join(".pushwork");
    if !control_dir.exists() {
        bail!("{} is not a pushwork workspace", root.display());
    }
    let store = pushwork::snapshot::SnapshotStore::new(control_dir.clone());
    let recovery_url = store
        .load()
        .ok()
        .flatten()
        .map(|s| s.root_directory_url)
        .unwrap_or_default();
    std::fs::remove_dir_all(&control_dir).with_context(|| format!("remove {}", control_dir.display()))?;
    if recovery_url.is_empty() {
        println!("removed {}", control_dir.display());
    } else {
        println!("removed {}; recovery url: {recovery_url}", control_dir.display());
    }
    Ok(0)
}

async fn cmd_watch(
    root: PathBuf,
    config_flag: Option<&Path>,
    script: Option<String>,
    dir: Option<PathBuf>,
) -> Result<i32> {
    let engine = open_engine(&root, config_flag).await?;
    let watch_dir = dir.map(|d| path_util::absolutize_path(&d)).unwrap_or_else(|| root.clone());
    watch::run_watch(
        &engine,
        WatchOptions {
            script,
            watch_dir,
            debounce: std::time::Duration::from_millis(300),
        },
        now,
    )
    .await?;
    Ok(0)
}

fn print_sync_result(result: &SyncResult) {
    println!(
        "files changed: {}, directories changed: {}",
        result.files_changed, result.directories_changed
    );
    for warning in &result.warnings {
        println!("warning: {warning}");
    }
    for error in &result.errors {
        eprintln!("error: {error}");
    }
}

fn exit_code_for(result: &SyncResult) -> i32 {
    if result.success { 0 } else { 1 }
}
