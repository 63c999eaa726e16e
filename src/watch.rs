//! Backs the `watch` CLI command: runs an optional script, then re-syncs
//! whenever the watched directory changes. Structured after the threaded
//! daemon in this crate's reference client, minus the HTTP control plane.

use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};

use crate::engine::SyncEngine;

pub struct WatchOptions {
    pub script: Option<String>,
    pub watch_dir: PathBuf,
    pub debounce: Duration,
}

pub async fn run_watch(engine: &SyncEngine, options: WatchOptions, now: impl Fn() -> i64) -> Result<()> {
    run_script_if_configured(&options)?;

    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })
    .context("create filesystem watcher")?;
    watcher
        .watch(&options.watch_dir, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", options.watch_dir.display()))?;

    crate::logging::info(format!("watching {}", options.watch_dir.display()));

    loop {
        let event = tokio::task::spawn_blocking({
            let rx_timeout = options.debounce;
            move || rx.recv_timeout(rx_timeout)
        })
        .await
        .context("join watch thread")?;

        match event {
            Ok(Ok(_)) => {
                run_script_if_configured(&options)?;
                match engine.sync(now()).await {
                    Ok(result) if result.success => {
                        crate::logging::info_kv(
                            "sync after change",
                            &[("files_changed", &result.files_changed.to_string())],
                        );
                    }
                    Ok(result) => {
                        for err in &result.errors {
                            crate::logging::error(format!("sync error: {err}"));
                        }
                    }
                    Err(e) => crate::logging::error(format!("sync failed: {e}")),
                }
            }
            Ok(Err(e)) => crate::logging::error(format!("watch error: {e}")),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn run_script_if_configured(options: &WatchOptions) -> Result<()> {
    let Some(script) = &options.script else {
        return Ok(());
    };
    let status = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(&options.watch_dir)
        .status()
        .with_context(|| format!("run script {script}"))?;
    if !status.success() {
        crate::logging::error(format!("watch script exited with {status}"));
    }
    Ok(())
}
