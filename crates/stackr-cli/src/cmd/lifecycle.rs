use crate::output::{print_json, print_table};
use anyhow::{bail, Context};
use serde::Serialize;
use stackr_core::envfile;
use stackr_core::remote::RemoteSync;
use stackr_core::runtime::RunOptions;
use stackr_core::stack::{Resolver, Stack};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Up,
    Update,
    Down,
}

impl Action {
    fn verb(self) -> &'static str {
        match self {
            Action::Up => "up",
            Action::Update => "updated",
            Action::Down => "down",
        }
    }
}

#[derive(Serialize)]
struct ActionResult {
    stack: String,
    action: &'static str,
    stdout: String,
    stderr: String,
}

/// Run `action` on each selected stack in turn, stopping at the first
/// failure. Remote stacks are synced before `up` and `update`; a failed sync
/// falls back to the cached working copy.
pub fn run(root: &Path, action: Action, names: &[String], all: bool, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let resolver = Resolver::from_config(&config);
    let stacks = super::select_stacks(&resolver, names, all)?;
    let runner = super::runner(&config, super::docker()?);
    let remote = RemoteSync::new(resolver, super::git());

    // Captured output keeps stdout clean for JSON.
    let opts = if json {
        RunOptions::default()
    } else {
        RunOptions::inherited()
    };

    let results = super::block_on(async {
        let mut results = Vec::new();
        for stack in &stacks {
            if stack.is_remote() && action != Action::Down {
                sync_remote(&remote, &config.env_file, stack).await;
            }
            let out = match action {
                Action::Up => runner.up(stack, &opts).await,
                Action::Update => runner.update(stack, &opts).await,
                Action::Down => runner.down(stack, &opts).await,
            }
            .with_context(|| format!("stack '{}'", stack.name))?;
            if !json {
                println!("{}: {}", stack.name, action.verb());
            }
            results.push(ActionResult {
                stack: stack.name.clone(),
                action: action.verb(),
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        anyhow::Ok(results)
    })??;

    if json {
        print_json(&results)?;
    }
    Ok(())
}

async fn sync_remote(remote: &RemoteSync, env_file: &Path, stack: &Stack) {
    let env = match envfile::read_values(env_file) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(stack = %stack.name, error = %e, "cannot read env file, skipping sync");
            return;
        }
    };
    if let Err(e) = remote.ensure_synced(stack, &env).await {
        tracing::warn!(stack = %stack.name, error = %e, "remote sync failed, using cached working copy");
        eprintln!("warning: {e}");
    }
}

/// `update --tag`: a deploy of exactly one stack.
pub fn update_to_tag(
    root: &Path,
    names: &[String],
    all: bool,
    tag: &str,
    json: bool,
) -> anyhow::Result<()> {
    match (all, names) {
        (false, [stack]) => super::deploy::run(root, stack, tag, None, json),
        _ => bail!("--tag applies to exactly one stack"),
    }
}

pub fn backup(root: &Path, names: &[String], all: bool, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let resolver = Resolver::from_config(&config);
    let stacks = super::select_stacks(&resolver, names, all)?;
    let runner = super::runner(&config, super::offline());

    let mut reports = Vec::new();
    for stack in &stacks {
        let report = runner
            .backup(stack)
            .with_context(|| format!("backup of stack '{}' failed", stack.name))?;
        reports.push(report);
    }

    if json {
        return print_json(&reports);
    }
    for report in &reports {
        if report.copied.is_empty() {
            println!("{}: nothing to back up", report.stack);
        } else {
            println!(
                "{}: {} -> {}",
                report.stack,
                report.copied.join(", "),
                report.destination.display()
            );
        }
    }
    Ok(())
}

pub fn get_vars(root: &Path, names: &[String], all: bool, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let resolver = Resolver::from_config(&config);
    let stacks = super::select_stacks(&resolver, names, all)?;
    let runner = super::runner(&config, super::offline());

    let mut reports = Vec::new();
    for stack in &stacks {
        reports.push(runner.get_vars(stack)?);
    }

    if json {
        return print_json(&reports);
    }
    let rows: Vec<Vec<String>> = reports
        .iter()
        .flat_map(|r| {
            r.required.iter().map(move |var| {
                let state = if r.missing.contains(var) { "missing" } else { "set" };
                vec![r.stack.clone(), var.clone(), state.to_string()]
            })
        })
        .collect();
    if !rows.is_empty() {
        print_table(&["STACK", "VARIABLE", "STATE"], &rows);
    }
    for r in reports.iter().filter(|r| r.added) {
        println!(
            "{}: added missing variables to {}; fill them in before starting the stack",
            r.stack,
            config.env_file.display()
        );
    }
    Ok(())
}
