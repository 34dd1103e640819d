//! Archive-then-cleanup for stacks that disappear from the stacks directory.

pub mod archive;
pub mod cleanup;
pub mod tracker;

pub use archive::archive_stack;
pub use cleanup::{cleanup_stack, CleanupMethod, CLEANUP_TIMEOUT};
pub use tracker::InventoryTracker;

use crate::config::Config;
use crate::runtime::StackRuntime;
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What happened to one removed stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub stack: String,
    pub archive: Option<PathBuf>,
    pub archive_error: Option<String>,
    pub cleaned: bool,
    pub cleanup_error: Option<String>,
}

pub struct RemovalHandler {
    config: Arc<Config>,
    runtime: Arc<dyn StackRuntime>,
    tracker: InventoryTracker,
    continue_on_archive_error: bool,
    cleanup_timeout: Duration,
}

impl RemovalHandler {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn StackRuntime>) -> Self {
        let continue_on_archive_error = config.global.removal.continue_on_archive_error;
        Self {
            config,
            runtime,
            tracker: InventoryTracker::new(),
            continue_on_archive_error,
            cleanup_timeout: CLEANUP_TIMEOUT,
        }
    }

    /// Record the stacks present at startup so they are never reported as
    /// removed by the first check.
    pub fn seed(&self, names: BTreeSet<String>) {
        let count = names.len();
        self.tracker.seed(names);
        tracing::info!(stacks = count, "removal tracker initialised");
    }

    /// Archive and tear down every stack missing from `current` since the
    /// previous call. Failures are logged per stack and never stop the pass.
    pub async fn check_for_removals(&self, current: &BTreeSet<String>) -> Vec<RemovalOutcome> {
        let removed = self.tracker.diff(current);
        if removed.is_empty() {
            return Vec::new();
        }
        tracing::info!(stacks = ?removed, "detected removed stacks");

        let mut outcomes = Vec::with_capacity(removed.len());
        for stack in removed {
            outcomes.push(self.handle_removed(stack).await);
        }
        outcomes
    }

    async fn handle_removed(&self, stack: String) -> RemovalOutcome {
        let mut outcome = RemovalOutcome {
            stack,
            archive: None,
            archive_error: None,
            cleaned: false,
            cleanup_error: None,
        };
        let stack = outcome.stack.as_str();

        match archive_stack(&self.config, stack, Local::now()) {
            Ok(path) => outcome.archive = Some(path),
            Err(e) => {
                tracing::error!(stack, error = %e, "failed to archive removed stack");
                outcome.archive_error = Some(e.to_string());
                if !self.continue_on_archive_error {
                    tracing::warn!(stack, "skipping cleanup after archive failure");
                    return outcome;
                }
            }
        }

        match cleanup_stack(&self.config, self.runtime.as_ref(), stack, self.cleanup_timeout).await {
            Ok(_) => {
                tracing::info!(stack, "removed stack cleaned up");
                outcome.cleaned = true;
            }
            Err(e) => {
                tracing::error!(stack, error = %e, "failed to clean up removed stack");
                outcome.cleanup_error = Some(e.to_string());
            }
        }
        outcome
    }
}
