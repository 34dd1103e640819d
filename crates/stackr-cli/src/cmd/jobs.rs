use crate::output::{or_dash, print_json, print_table};
use clap::Subcommand;
use stackr_core::locks::StackLocks;
use stackr_core::scheduler::{self, Scheduler};
use stackr_core::stack::Resolver;
use std::path::Path;

#[derive(Subcommand)]
pub enum JobsSubcommand {
    /// List jobs across all stacks
    List,

    /// Run a job now, optionally with a different command
    Run {
        stack: String,
        service: String,
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Remove job containers beyond the configured retention
    Cleanup,
}

pub fn run(root: &Path, subcommand: JobsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        JobsSubcommand::List => list(root, json),
        JobsSubcommand::Run {
            stack,
            service,
            command,
        } => run_job(root, &stack, &service, &command, json),
        JobsSubcommand::Cleanup => cleanup(root, json),
    }
}

fn build_scheduler(root: &Path) -> anyhow::Result<Scheduler> {
    let config = super::load_config(root)?;
    let runner = super::runner(&config, super::docker()?);
    Ok(Scheduler::new(
        runner,
        Resolver::from_config(&config),
        StackLocks::new(),
    ))
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let jobs = scheduler::discover(&Resolver::from_config(&config))?;

    if json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|j| {
            let schedule = match j.parse_schedule() {
                Ok(_) if j.is_manual() => "manual".to_string(),
                Ok(_) => j.schedule.clone(),
                Err(_) => format!("{} (invalid)", j.schedule),
            };
            vec![
                j.stack.clone(),
                j.service.clone(),
                schedule,
                or_dash(j.profile.as_deref()),
                if j.run_on_deploy { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["STACK", "SERVICE", "SCHEDULE", "PROFILE", "ON DEPLOY"], &rows);
    Ok(())
}

fn run_job(
    root: &Path,
    stack: &str,
    service: &str,
    command: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let scheduler = build_scheduler(root)?;
    let run = super::block_on(scheduler.run_job(stack, service, command))??;

    if json {
        return print_json(&run);
    }
    if !run.stdout.is_empty() {
        print!("{}", run.stdout);
    }
    println!("Job {}/{} finished in container {}", run.stack, run.service, run.container);
    if let Some(log) = &run.exec_log {
        println!("  log: {}", log.display());
    }
    Ok(())
}

fn cleanup(root: &Path, json: bool) -> anyhow::Result<()> {
    let scheduler = build_scheduler(root)?;
    let report = super::block_on(scheduler.cleanup())??;

    if json {
        return print_json(&report);
    }
    if report.removed.is_empty() {
        println!("Nothing to remove ({} job containers kept).", report.kept);
    } else {
        for name in &report.removed {
            println!("  removed: {name}");
        }
        println!("{} removed, {} kept.", report.removed.len(), report.kept);
    }
    Ok(())
}
