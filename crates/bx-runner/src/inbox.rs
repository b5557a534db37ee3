//! File-drop signal source.
//!
//! Strategies running elsewhere write one JSON-encoded `StrategySignal` per
//! file into the inbox directory. Each tick the oldest `*.json` file (by
//! name) is consumed and renamed to `*.done`; unparseable files become
//! `*.bad` so they are never read twice.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bx_core::types::StrategySignal;
use bx_exec::collaborators::{SignalSource, TickContext};
use tracing::{info, warn};

pub struct InboxSource {
    dir: PathBuf,
}

impl InboxSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn oldest_file(&self) -> std::io::Result<Option<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files.into_iter().next())
    }
}

async fn retire(path: &Path, extension: &str) {
    let target = path.with_extension(extension);
    if let Err(e) = tokio::fs::rename(path, &target).await {
        warn!("[inbox] could not rename {}: {e}", path.display());
    }
}

#[async_trait]
impl SignalSource for InboxSource {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn generate_signal(&mut self, ctx: &TickContext) -> Option<StrategySignal> {
        let path = match self.oldest_file().await {
            Ok(Some(path)) => path,
            Ok(None) => return None,
            Err(e) => {
                warn!("[inbox] cannot read {}: {e}", self.dir.display());
                return None;
            }
        };

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("[inbox] cannot read {}: {e}", path.display());
                retire(&path, "bad").await;
                return None;
            }
        };
        match serde_json::from_str::<StrategySignal>(&raw) {
            Ok(signal) => {
                info!(
                    "[inbox] bar {}: {} signal for {} from {}",
                    ctx.bar,
                    signal.strategy(),
                    signal.symbol(),
                    path.display()
                );
                retire(&path, "done").await;
                Some(signal)
            }
            Err(e) => {
                warn!("[inbox] {} is not a valid signal: {e}", path.display());
                retire(&path, "bad").await;
                None
            }
        }
    }
}
