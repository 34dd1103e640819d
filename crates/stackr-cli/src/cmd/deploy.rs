use crate::output::print_json;
use stackr_core::deploy::Deployer;
use stackr_core::locks::StackLocks;
use stackr_core::remote::RemoteSync;
use stackr_core::stack::Resolver;
use stackr_core::StackrError;
use std::path::Path;

pub fn run(
    root: &Path,
    stack: &str,
    tag: &str,
    tag_var: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let runner = super::runner(&config, super::docker()?);
    let remote = RemoteSync::new(Resolver::from_config(&config), super::git());
    let deployer = Deployer::new(runner, remote, StackLocks::new());

    match super::block_on(deployer.deploy(stack, tag_var, tag))? {
        Ok(result) if json => print_json(&result),
        Ok(result) => {
            let previous = if result.previous_tag.is_empty() {
                "(unset)"
            } else {
                result.previous_tag.as_str()
            };
            println!("Deployed {} {} (previous: {previous})", result.stack, result.tag);
            for warning in &result.warnings {
                println!("  warning: {warning}");
            }
            Ok(())
        }
        Err(StackrError::Deploy(failure)) => {
            if json {
                print_json(&failure)?;
            } else {
                for stream in [&failure.stdout, &failure.stderr] {
                    if !stream.trim().is_empty() {
                        eprintln!("{}", stream.trim_end());
                    }
                }
            }
            eprintln!("{} was restored.", config.env_file.display());
            Err(StackrError::Deploy(failure).into())
        }
        Err(e) => Err(e.into()),
    }
}
