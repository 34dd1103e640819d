//! Recursive filesystem watch over the stacks directory with a quiet-period
//! debounce: a burst of events produces one callback once no further event
//! has arrived for the debounce window.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const DEBOUNCE: Duration = Duration::from_secs(2);

/// A running watcher. Dropping it stops event delivery; [`StackWatcher::stop`]
/// also waits for an in-progress callback.
pub struct StackWatcher {
    _watcher: RecommendedWatcher,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StackWatcher {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_)
    )
}

/// Watch `root` recursively and call `on_change` with the last changed path
/// after each debounced burst.
pub fn watch_stacks<F, Fut>(root: &Path, window: Duration, on_change: F) -> notify::Result<StackWatcher>
where
    F: FnMut(PathBuf) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event.kind) => {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "stack watcher error"),
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), "watching stacks directory");

    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(debounce(rx, window, on_change, stop_rx));
    Ok(StackWatcher {
        _watcher: watcher,
        stop,
        task,
    })
}

/// Coalesce paths from `rx` and call `on_change` once per quiet period.
pub async fn debounce<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    window: Duration,
    mut on_change: F,
    mut stop: watch::Receiver<bool>,
) where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let mut last = tokio::select! {
            _ = stop.changed() => return,
            path = rx.recv() => match path {
                Some(p) => p,
                None => return,
            },
        };
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                path = rx.recv() => match path {
                    Some(p) => last = p,
                    None => break,
                },
                _ = tokio::time::sleep(window) => break,
            }
        }
        tracing::debug!(path = %last.display(), "stack change detected");
        on_change(last).await;
    }
}
