use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use regex::Regex;
use serde::Deserialize;
use stackr_core::compose::{self, ComposeFile};
use stackr_core::deploy::DeployResult;
use stackr_core::envfile;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Default, Deserialize)]
struct DeployRequest {
    #[serde(default)]
    stack: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    image_tag: String,
}

fn release_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v\d+\.\d+\.\d+(-[a-zA-Z0-9._-]+)?$").unwrap())
}

/// `latest` or `vX.Y.Z` with an optional `-suffix`.
pub fn is_valid_tag(tag: &str) -> bool {
    tag == DEFAULT_TAG || release_tag_re().is_match(tag)
}

/// False when any service sets `stackr.deploy.auto` to false or to a value
/// that is not a boolean. Label values may reference env file variables.
pub fn auto_deploy_enabled(stack: &str, compose_path: &Path, env_file: &Path) -> stackr_core::Result<bool> {
    let file = ComposeFile::load(compose_path)?;
    let env = envfile::read_values(env_file).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cannot read env file for auto-deploy check");
        Default::default()
    });

    for (service, meta) in &file.services {
        let Some(raw) = meta.label(compose::LABEL_DEPLOY_AUTO) else {
            continue;
        };
        let value = compose::expand(raw, &env);
        match compose::parse_bool(&value) {
            Some(true) => {}
            Some(false) => {
                tracing::info!(stack, service = %service, "auto-deployment disabled");
                return Ok(false);
            }
            None => {
                tracing::warn!(stack, service = %service, value = %value, "invalid {} value, treating as disabled", compose::LABEL_DEPLOY_AUTO);
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// POST /deploy: set a stack's image tag and update it.
pub async fn deploy(State(app): State<AppState>, body: Bytes) -> Result<Json<DeployResult>, AppError> {
    let req: DeployRequest =
        serde_json::from_slice(&body).map_err(|_| AppError::bad_request("invalid JSON body"))?;

    let stack = req.stack.trim().to_string();
    if stack.is_empty() {
        return Err(AppError::bad_request("stack is required"));
    }

    let resolver = app.resolver.clone();
    let env_file = app.config.env_file.clone();
    let name = stack.clone();
    let enabled = tokio::task::spawn_blocking(move || {
        let resolved = resolver.resolve(&name)?;
        // A remote stack that has not been cloned yet has nothing to check.
        if resolved.is_remote() && !resolved.compose_path.is_file() {
            return Ok(true);
        }
        auto_deploy_enabled(&name, &resolved.compose_path, &env_file)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    if !enabled {
        return Err(AppError::forbidden("auto-deployment is disabled for this stack"));
    }

    let tag = match (req.tag.trim(), req.image_tag.trim()) {
        ("", "") => DEFAULT_TAG,
        ("", image_tag) => image_tag,
        (tag, _) => tag,
    };
    if !is_valid_tag(tag) {
        return Err(AppError::bad_request(
            "tag must be 'latest' or semver format (v1.2.3 or v1.2.3-prerelease)",
        ));
    }

    let result = app.deployer.deploy(&stack, None, tag).await?;
    Ok(Json(result))
}
