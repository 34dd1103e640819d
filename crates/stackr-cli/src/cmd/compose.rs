use anyhow::bail;
use stackr_core::process::{self, CommandSpec, OutputMode};
use stackr_core::runtime::RunOptions;
use stackr_core::stack::Resolver;
use std::path::Path;

/// `docker compose <args>` scoped to the stack's project and environment.
pub fn compose(root: &Path, stack: &str, args: &[String]) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let stack = Resolver::from_config(&config).resolve(stack)?;
    let runner = super::runner(&config, super::docker()?);
    super::block_on(runner.compose(&stack, args, &RunOptions::inherited()))??;
    Ok(())
}

/// Any command, run in the stack's project directory with its environment.
pub fn exec(root: &Path, stack: &str, command: &[String]) -> anyhow::Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };
    let config = super::load_config(root)?;
    let stack = Resolver::from_config(&config).resolve(stack)?;
    let def = super::runner(&config, super::offline()).definition(&stack)?;

    let spec = CommandSpec::new(program.clone(), args.to_vec())
        .cwd(&def.project_dir)
        .env(def.env)
        .output(OutputMode::Inherit);
    super::block_on(process::run(&spec))??;
    Ok(())
}
