use crate::output::{or_dash, print_json, print_table};
use clap::Subcommand;
use stackr_core::envfile;
use stackr_core::remote::{RemoteStatus, RemoteSync};
use stackr_core::stack::Resolver;
use std::path::Path;

#[derive(Subcommand)]
pub enum RemoteSubcommand {
    /// Show every remote stack and its working copy
    List,

    /// Show one remote stack in detail
    Status { stack: String },

    /// Clone or refresh the working copy and check out the configured release
    Sync { stack: String },

    /// Delete the working copy; the next sync clones again
    Clean { stack: String },
}

pub fn run(root: &Path, subcommand: RemoteSubcommand, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let remote = RemoteSync::new(Resolver::from_config(&config), super::git());
    let env = envfile::read_values(&config.env_file)?;

    match subcommand {
        RemoteSubcommand::List => {
            let all = super::block_on(remote.list(&env))??;
            if json {
                return print_json(&all);
            }
            if all.is_empty() {
                println!("No remote stacks.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = all
                .iter()
                .map(|s| {
                    vec![
                        s.stack.clone(),
                        format!("{} {}", s.release_type, or_dash(s.resolved_ref.as_deref())),
                        if s.cloned { "yes" } else { "no" }.to_string(),
                        or_dash(s.current_commit.as_deref()),
                        s.url.clone(),
                    ]
                })
                .collect();
            print_table(&["STACK", "RELEASE", "CLONED", "COMMIT", "URL"], &rows);
        }
        RemoteSubcommand::Status { stack } => {
            let status = super::block_on(remote.status(&stack, &env))??;
            if json {
                return print_json(&status);
            }
            print_status(&status);
        }
        RemoteSubcommand::Sync { stack } => {
            let outcome = super::block_on(remote.sync(&stack, &env))??;
            if json {
                return print_json(&outcome);
            }
            let action = if outcome.cloned { "cloned" } else { "refreshed" };
            println!(
                "{}: {action}, at {} ({})",
                outcome.stack,
                outcome.reference,
                or_dash(Some(outcome.commit.as_str()))
            );
            if !outcome.cloned && !outcome.refreshed {
                println!("  warning: fetch/pull failed, working copy may be stale");
            }
        }
        RemoteSubcommand::Clean { stack } => {
            let dir = remote.clean(&stack)?;
            if json {
                return print_json(&serde_json::json!({ "stack": stack, "removed": dir }));
            }
            println!("Removed {}", dir.display());
        }
    }
    Ok(())
}

fn print_status(s: &RemoteStatus) {
    println!("Stack:        {}", s.stack);
    println!("Repository:   {} ({})", s.url, s.branch);
    println!("Path:         {}", s.path);
    println!(
        "Release:      {} {} -> {}",
        s.release_type,
        s.configured_ref,
        or_dash(s.resolved_ref.as_deref())
    );
    println!("Working copy: {}", s.working_copy.display());
    if !s.cloned {
        println!("              not cloned");
        return;
    }
    println!("Commit:       {}", or_dash(s.current_commit.as_deref()));
    println!("Ref:          {}", or_dash(s.current_ref.as_deref()));
    let dirty = match s.dirty {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    };
    println!("Dirty:        {dirty}");
}
