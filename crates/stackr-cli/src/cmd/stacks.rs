use crate::output::{print_json, print_table};
use stackr_core::stack::Resolver;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let stacks = Resolver::from_config(&config).discover_all()?;

    if json {
        return print_json(&stacks);
    }
    if stacks.is_empty() {
        println!("No stacks in {}.", config.stacks_dir.display());
        return Ok(());
    }

    let rows: Vec<Vec<String>> = stacks
        .iter()
        .map(|s| {
            let definition = if s.compose_path.is_file() {
                s.compose_path.display().to_string()
            } else {
                format!("{} (not cloned)", s.compose_path.display())
            };
            vec![s.name.clone(), s.kind.to_string(), definition]
        })
        .collect();
    print_table(&["NAME", "TYPE", "DEFINITION"], &rows);
    Ok(())
}
