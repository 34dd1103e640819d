use anyhow::Context;
use stackr_core::{io, paths};
use std::path::Path;

const CONFIG_TEMPLATE: &str = r#"# stackr global configuration. Relative paths resolve against this file's
# directory.
stacks_dir: stacks
remote_stacks_dir: .stackr-repos

cron:
  profile: cron
  enable_file_logs: true
  logs_dir: logs/cron
  docker_container_retention: 5

http:
  base_domain: localhost

paths:
  backup_dir: ./backups
  pools: {}
  custom: {}

removal:
  continue_on_archive_error: true

env:
  global: {}
  stacks: {}
"#;

const ENV_TEMPLATE: &str = "# Values shared by every stack. `stackr get-vars <stack>` adds\n# placeholders for anything a stack references but does not define.\n";

const EXAMPLE_COMPOSE: &str = r#"services:
  web:
    image: nginx:${EXAMPLE_IMAGE_TAG}
    restart: unless-stopped
    labels:
      stackr.deploy.auto: "true"
"#;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing stackr in: {}", root.display());

    let stacks_dir = root.join("stacks");
    io::ensure_dir(&stacks_dir)
        .with_context(|| format!("failed to create {}", stacks_dir.display()))?;

    let files = [
        (paths::CONFIG_FILE.to_string(), CONFIG_TEMPLATE),
        (paths::ENV_FILE.to_string(), ENV_TEMPLATE),
        (
            format!("stacks/example/{}", paths::COMPOSE_FILE),
            EXAMPLE_COMPOSE,
        ),
    ];
    for (rel, content) in files {
        let path = root.join(&rel);
        if let Some(parent) = path.parent() {
            io::ensure_dir(parent)?;
        }
        let created = io::write_if_missing(&path, content.as_bytes())
            .with_context(|| format!("failed to write {rel}"))?;
        if created {
            println!("  created: {rel}");
        } else {
            println!("  exists:  {rel}");
        }
    }

    println!("\nNext: stackr get-vars example");
    Ok(())
}
