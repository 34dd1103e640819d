//! Label-driven job scheduler.
//!
//! Every job with a schedule gets its own timer task. `reload` stops all
//! timer tasks and waits for their in-flight runs to finish before arming
//! the freshly discovered set, so nothing from the old set starts once a
//! reload has begun. A firing whose previous run is still active is skipped.

pub mod cleanup;
pub mod job;
pub mod logs;

pub use cleanup::{cleanup_containers, CleanupReport};
pub use job::{discover, Job};
pub use logs::JobLogs;

use crate::error::{Result, StackrError};
use crate::locks::StackLocks;
use crate::process::OutputMode;
use crate::runner::StackRunner;
use crate::runtime::RunOptions;
use crate::stack::Resolver;
use chrono::Local;
use cron::Schedule;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};

pub const JOB_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Result of one job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub stack: String,
    pub service: String,
    pub container: String,
    pub stdout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_log: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_log: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner {
    runner: Arc<StackRunner>,
    resolver: Resolver,
    locks: StackLocks,
    running: Mutex<HashSet<String>>,
    job_timeout: Duration,
}

/// Marks a job as running until dropped.
struct RunningGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.key);
    }
}

impl Inner {
    fn try_begin(self: &Arc<Self>, job: &Job) -> Option<RunningGuard> {
        let key = job.key();
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(key.clone()) {
            return None;
        }
        Some(RunningGuard {
            inner: Arc::clone(self),
            key,
        })
    }

    /// Pull (best effort) and run the job's service once.
    async fn execute(&self, job: &Job, command: &[String]) -> Result<JobRun> {
        let _stack_guard = self.locks.acquire(&job.stack).await;

        let stack = self.resolver.resolve(&job.stack)?;
        let def = self
            .runner
            .definition(&stack)?
            .with_profile(job.profile.as_deref());
        let config = self.runner.config();
        let now = Local::now();

        let logs = if config.global.cron.enable_file_logs {
            match JobLogs::create(&config.logs_dir(), job, now) {
                Ok(logs) => Some(logs),
                Err(e) => {
                    tracing::warn!(job = %job.key(), error = %e, "cannot create job log files, continuing without");
                    None
                }
            }
        } else {
            None
        };
        let opts_for = |log: Option<&PathBuf>| RunOptions {
            timeout: Some(self.job_timeout),
            output: log.map_or(OutputMode::Capture, |p| OutputMode::Tee(p.clone())),
        };

        let pull = vec!["pull".to_string(), "--quiet".to_string(), job.service.clone()];
        let pull_opts = opts_for(logs.as_ref().map(|l| &l.build));
        if let Err(e) = self.runner.runtime().compose(&def, &pull, &pull_opts).await {
            tracing::warn!(job = %job.key(), error = %e, "image pull failed, image may be built locally");
            if let Some(ref l) = logs {
                append_note(&l.build, "Note: pull failed (image may be built locally)");
            }
        }

        let container = job.container_name(now.timestamp());
        tracing::info!(job = %job.key(), container = %container, "job started");
        let exec_opts = opts_for(logs.as_ref().map(|l| &l.exec));
        let result = self
            .runner
            .run_service(&def, &job.service, &container, command, &exec_opts)
            .await;

        match result {
            Ok(out) => Ok(JobRun {
                stack: job.stack.clone(),
                service: job.service.clone(),
                container,
                stdout: out.stdout,
                build_log: logs.as_ref().map(|l| l.build.clone()),
                exec_log: logs.as_ref().map(|l| l.exec.clone()),
            }),
            Err(e) => {
                if let Some(ref l) = logs {
                    append_note(&l.exec, &format!("\n=== ERROR ===\n{e}"));
                }
                Err(StackrError::Process(e))
            }
        }
    }

    async fn execute_logged(&self, job: &Job) {
        match self.execute(job, &[]).await {
            Ok(run) => tracing::info!(job = %job.key(), container = %run.container, "job finished"),
            Err(e) => tracing::error!(job = %job.key(), error = %e, "job failed"),
        }
    }
}

fn append_note(path: &std::path::Path, note: &str) {
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(path) {
        let _ = writeln!(f, "{note}");
    }
}

// ---------------------------------------------------------------------------
// Timer tasks
// ---------------------------------------------------------------------------

/// A set of running background tasks sharing one stop signal.
struct Armed {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    jobs: Vec<Job>,
}

impl Armed {
    /// Signal every task and wait for all of them, including in-flight runs.
    async fn drain(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn job_loop(inner: Arc<Inner>, job: Job, schedule: Schedule, mut stop: watch::Receiver<bool>) {
    let mut in_flight = JoinSet::new();
    let mut cursor = Local::now();
    loop {
        let Some(next) = schedule.after(&cursor).next() else {
            break;
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = stop.changed() => break,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            _ = tokio::time::sleep(wait) => {}
        }
        cursor = next;

        match inner.try_begin(&job) {
            Some(guard) => {
                let inner = Arc::clone(&inner);
                let job = job.clone();
                in_flight.spawn(async move {
                    let _guard = guard;
                    inner.execute_logged(&job).await;
                });
            }
            None => tracing::info!(job = %job.key(), "previous run still active, skipping"),
        }
    }
    while in_flight.join_next().await.is_some() {}
}

async fn cleanup_loop(inner: Arc<Inner>, retention: usize, mut stop: watch::Receiver<bool>) {
    loop {
        if let Err(e) = cleanup_containers(inner.runner.runtime().as_ref(), retention).await {
            tracing::warn!(error = %e, "job container cleanup failed");
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    inner: Arc<Inner>,
    armed: AsyncMutex<Option<Armed>>,
    janitor: AsyncMutex<Option<Armed>>,
}

impl Scheduler {
    pub fn new(runner: Arc<StackRunner>, resolver: Resolver, locks: StackLocks) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                resolver,
                locks,
                running: Mutex::new(HashSet::new()),
                job_timeout: JOB_TIMEOUT,
            }),
            armed: AsyncMutex::new(None),
            janitor: AsyncMutex::new(None),
        }
    }

    /// Fresh discovery pass over all stacks.
    pub fn discover(&self) -> Result<Vec<Job>> {
        job::discover(&self.inner.resolver)
    }

    /// Jobs currently armed.
    pub async fn jobs(&self) -> Vec<Job> {
        self.armed
            .lock()
            .await
            .as_ref()
            .map(|a| a.jobs.clone())
            .unwrap_or_default()
    }

    /// Arm all discovered jobs and start container cleanup. No-op when
    /// already started.
    pub async fn start(&self) -> Result<usize> {
        let mut armed = self.armed.lock().await;
        if armed.is_some() {
            return Ok(armed.as_ref().map_or(0, |a| a.jobs.len()));
        }
        let jobs = self.discover()?;
        let plan = plan(&jobs)?;
        let count = jobs.len();
        *armed = Some(self.arm(jobs, plan));
        drop(armed);

        self.start_janitor().await;
        Ok(count)
    }

    /// Swap in a freshly discovered job set. An invalid schedule leaves the
    /// current set armed.
    pub async fn reload(&self) -> Result<usize> {
        let mut armed = self.armed.lock().await;
        let jobs = self.discover()?;
        let plan = plan(&jobs)?;
        if let Some(old) = armed.take() {
            old.drain().await;
        }
        let count = jobs.len();
        *armed = Some(self.arm(jobs, plan));
        tracing::info!(jobs = count, "scheduler reloaded");
        Ok(count)
    }

    pub async fn stop(&self) {
        if let Some(old) = self.armed.lock().await.take() {
            old.drain().await;
        }
        if let Some(janitor) = self.janitor.lock().await.take() {
            janitor.drain().await;
        }
        tracing::info!("scheduler stopped");
    }

    /// Run a job now, bypassing its schedule. Manual-only jobs are runnable.
    pub async fn run_job(&self, stack: &str, service: &str, command: &[String]) -> Result<JobRun> {
        let job = self
            .discover()?
            .into_iter()
            .find(|j| j.stack == stack && j.service == service)
            .ok_or_else(|| StackrError::JobNotFound {
                stack: stack.to_string(),
                service: service.to_string(),
            })?;
        tracing::info!(job = %job.key(), custom_command = !command.is_empty(), "running job manually");
        self.inner.execute(&job, command).await
    }

    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let retention = self.inner.runner.config().global.cron.docker_container_retention;
        cleanup_containers(self.inner.runner.runtime().as_ref(), retention).await
    }

    fn arm(&self, jobs: Vec<Job>, plan: Vec<(Job, Schedule)>) -> Armed {
        let (stop, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for (job, schedule) in plan {
            tracing::info!(job = %job.key(), schedule = %job.schedule, "job scheduled");
            tasks.push(tokio::spawn(job_loop(
                Arc::clone(&self.inner),
                job,
                schedule,
                rx.clone(),
            )));
        }

        for job in jobs.iter().filter(|j| j.run_on_deploy) {
            let Some(guard) = self.inner.try_begin(job) else {
                continue;
            };
            tracing::info!(job = %job.key(), "run-on-deploy job triggered");
            let inner = Arc::clone(&self.inner);
            let job = job.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = guard;
                inner.execute_logged(&job).await;
            }));
        }

        if jobs.is_empty() {
            tracing::info!("no job services detected");
        }
        Armed { stop, tasks, jobs }
    }

    async fn start_janitor(&self) {
        let mut janitor = self.janitor.lock().await;
        if janitor.is_some() {
            return;
        }
        let retention = self.inner.runner.config().global.cron.docker_container_retention;
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(cleanup_loop(Arc::clone(&self.inner), retention, rx));
        *janitor = Some(Armed {
            stop,
            tasks: vec![task],
            jobs: Vec::new(),
        });
    }
}

/// Parse every schedule up front so a bad one rejects the whole set.
fn plan(jobs: &[Job]) -> Result<Vec<(Job, Schedule)>> {
    let mut out = Vec::new();
    for job in jobs {
        if let Some(schedule) = job.parse_schedule()? {
            out.push((job.clone(), schedule));
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
