//! Assemble the environment a stack's definition file is evaluated with.
//!
//! Layering, later entries winning: process env, env file, `env.global`,
//! provisioned paths, `env.stacks.<stack>`, legacy storage vars, and for
//! remote stacks the working copy's deployment override.

use crate::config::Config;
use crate::envfile;
use crate::error::Result;
use crate::remote;
use crate::runtime::StackDefinition;
use crate::stack::Stack;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const COMPOSE_DIRECTORY_VAR: &str = "COMPOSE_DIRECTORY";
pub const DOMAIN_VAR: &str = "STACKR_PROV_DOMAIN";
pub const DEFINITION_PATH_VAR: &str = "DCFP";
const POOL_VAR_PREFIX: &str = "STACKR_PROV_POOL_";

pub fn pool_var(pool: &str) -> String {
    format!("{POOL_VAR_PREFIX}{}", pool.to_uppercase())
}

/// Per-stack directory inside each configured pool, keyed by pool name.
pub fn pool_dirs(config: &Config, stack: &str) -> Result<BTreeMap<String, PathBuf>> {
    Ok(config
        .pools()?
        .into_iter()
        .map(|(name, base)| (name, base.join(stack)))
        .collect())
}

pub fn build(config: &Config, stack: &Stack) -> Result<StackDefinition> {
    build_with_base(config, stack, std::env::vars().collect())
}

/// [`build`] starting from an explicit process environment.
pub fn build_with_base(
    config: &Config,
    stack: &Stack,
    base: BTreeMap<String, String>,
) -> Result<StackDefinition> {
    let mut env = base;
    env.extend(envfile::read_values(&config.env_file)?);
    env.extend(config.global.env.global.clone());

    env.insert(
        COMPOSE_DIRECTORY_VAR.to_string(),
        config.stacks_dir.to_string_lossy().into_owned(),
    );
    let pools = pool_dirs(config, &stack.name)?;
    for (name, dir) in &pools {
        env.insert(pool_var(name), dir.to_string_lossy().into_owned());
    }
    env.insert(
        DOMAIN_VAR.to_string(),
        format!("{}.{}", stack.name, config.global.http.base_domain),
    );

    if let Some(vars) = config.global.env.stacks.get(&stack.name) {
        env.extend(vars.clone());
    }

    for legacy in ["HDD", "SSD"] {
        if let Some(dir) = pools.get(legacy) {
            env.insert(
                format!("STACK_STORAGE_{legacy}"),
                dir.to_string_lossy().into_owned(),
            );
        }
    }

    env.insert(
        DEFINITION_PATH_VAR.to_string(),
        stack.compose_path.to_string_lossy().into_owned(),
    );

    if stack.is_remote() {
        env = remote::merged_environment(stack, env)?;
    }

    Ok(StackDefinition {
        name: stack.name.clone(),
        compose_path: stack.compose_path.clone(),
        project_dir: project_dir(&stack.compose_path),
        env,
        profile: None,
    })
}

/// Minimal definition for tearing down a stack that is no longer resolvable.
pub fn for_teardown(config: &Config, name: &str, compose_path: &Path) -> Result<StackDefinition> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    env.extend(envfile::read_values(&config.env_file)?);
    env.extend(config.global.env.global.clone());
    env.insert(
        COMPOSE_DIRECTORY_VAR.to_string(),
        config.stacks_dir.to_string_lossy().into_owned(),
    );
    Ok(StackDefinition {
        name: name.to_string(),
        compose_path: compose_path.to_path_buf(),
        project_dir: project_dir(compose_path),
        env,
        profile: None,
    })
}

fn project_dir(compose_path: &Path) -> PathBuf {
    compose_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
