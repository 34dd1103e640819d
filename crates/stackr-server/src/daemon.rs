//! The long-lived process: scheduler, removal handler, stack watcher and
//! HTTP server sharing one set of engines.

use crate::shutdown::shutdown_signal;
use crate::state::AppState;
use crate::watch::{self, StackWatcher};
use stackr_core::config::Config;
use stackr_core::deploy::Deployer;
use stackr_core::git::{GitBackend, GitClient};
use stackr_core::locks::StackLocks;
use stackr_core::remote::RemoteSync;
use stackr_core::removal::RemovalHandler;
use stackr_core::runner::StackRunner;
use stackr_core::runtime::{ComposeRuntime, StackRuntime};
use stackr_core::scheduler::Scheduler;
use stackr_core::stack::Resolver;
use std::sync::Arc;

/// Engines wired together for one repository.
pub struct Engines {
    pub config: Arc<Config>,
    pub resolver: Resolver,
    pub deployer: Arc<Deployer>,
    pub scheduler: Arc<Scheduler>,
    pub removal: Arc<RemovalHandler>,
}

impl Engines {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn StackRuntime>, git: Arc<dyn GitBackend>) -> Self {
        let resolver = Resolver::from_config(&config);
        let locks = StackLocks::new();
        let runner = Arc::new(StackRunner::new(Arc::clone(&config), Arc::clone(&runtime)));
        let remote = RemoteSync::new(resolver.clone(), git);
        Self {
            deployer: Arc::new(Deployer::new(Arc::clone(&runner), remote, locks.clone())),
            scheduler: Arc::new(Scheduler::new(runner, resolver.clone(), locks)),
            removal: Arc::new(RemovalHandler::new(Arc::clone(&config), runtime)),
            resolver,
            config,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(Arc::clone(&self.config), Arc::clone(&self.deployer))
    }

    /// Watch-event handling: removals are processed before the scheduler
    /// reloads so no job is re-armed for a stack being torn down.
    pub async fn on_stacks_changed(&self) {
        let names = match self.resolver.stack_names() {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(error = %e, "failed to list stacks");
                return;
            }
        };
        self.removal.check_for_removals(&names).await;
        if let Err(e) = self.scheduler.reload().await {
            tracing::error!(error = %e, "failed to reload scheduler");
        }
    }
}

/// Run until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let runtime: Arc<dyn StackRuntime> = Arc::new(ComposeRuntime::detect()?);
    let git: Arc<dyn GitBackend> = Arc::new(GitClient::new());
    let engines = Arc::new(Engines::new(Arc::clone(&config), runtime, git));

    match engines.resolver.stack_names() {
        Ok(names) => engines.removal.seed(names),
        Err(e) => tracing::warn!(error = %e, "failed to load initial stack list"),
    }

    let jobs = engines.scheduler.start().await?;
    tracing::info!(jobs, "scheduler started");

    let watcher: Option<StackWatcher> = {
        let engines = Arc::clone(&engines);
        match watch::watch_stacks(&config.stacks_dir, watch::DEBOUNCE, move |path| {
            let engines = Arc::clone(&engines);
            async move {
                tracing::info!(path = %path.display(), "stack change detected");
                engines.on_stacks_changed().await;
            }
        }) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "stack watcher disabled");
                None
            }
        }
    };

    let app = crate::build_router(engines.app_state());
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, stacks_dir = %config.stacks_dir.display(), "stackr listening");

    let mut shutdown = shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    if let Some(w) = watcher {
        w.stop().await;
    }
    engines.scheduler.stop().await;
    tracing::info!("stackr stopped");
    Ok(())
}
