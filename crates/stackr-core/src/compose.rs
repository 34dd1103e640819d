//! Read-only view of a definition file: per-service labels and profiles.
//! Everything else in the file is left to docker compose.

use crate::error::{Result, StackrError};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

pub const LABEL_CRON_SCHEDULE: &str = "stackr.cron.schedule";
pub const LABEL_RUN_ON_DEPLOY: &str = "stackr.cron.run_on_deploy";
pub const LABEL_DEPLOY_AUTO: &str = "stackr.deploy.auto";
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMeta {
    pub labels: BTreeMap<String, String>,
    pub profiles: Vec<String>,
}

impl ServiceMeta {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// The service's profile when it declares exactly one.
    pub fn profile(&self) -> Option<&str> {
        match self.profiles.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeFile {
    pub services: BTreeMap<String, ServiceMeta>,
}

#[derive(Deserialize)]
struct RawFile {
    #[serde(default)]
    services: Option<BTreeMap<String, Option<RawService>>>,
}

#[derive(Deserialize)]
struct RawService {
    #[serde(default)]
    labels: Option<serde_yaml::Value>,
    #[serde(default)]
    profiles: Vec<String>,
}

impl ComposeFile {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFile = serde_yaml::from_str(text)?;
        let mut services = BTreeMap::new();
        for (name, svc) in raw.services.unwrap_or_default() {
            let meta = match svc {
                Some(svc) => ServiceMeta {
                    labels: parse_labels(&name, svc.labels)?,
                    profiles: svc.profiles,
                },
                None => ServiceMeta::default(),
            };
            services.insert(name, meta);
        }
        Ok(Self { services })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| {
            StackrError::InvalidConfig(format!("failed to parse {}: {e}", path.display()))
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceMeta> {
        self.services.get(name)
    }
}

/// Labels come either as a mapping or as a list of `KEY=VALUE` strings.
fn parse_labels(service: &str, value: Option<serde_yaml::Value>) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    match value {
        None | Some(serde_yaml::Value::Null) => {}
        Some(serde_yaml::Value::Mapping(map)) => {
            for (k, v) in map {
                let (Some(key), Some(val)) = (scalar(&k), scalar(&v)) else {
                    return Err(StackrError::InvalidConfig(format!(
                        "service '{service}' has a non-scalar label"
                    )));
                };
                labels.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
        Some(serde_yaml::Value::Sequence(items)) => {
            for item in items {
                let Some(entry) = scalar(&item) else {
                    return Err(StackrError::InvalidConfig(format!(
                        "service '{service}' has a non-scalar label"
                    )));
                };
                if let Some((k, v)) = entry.split_once('=') {
                    labels.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        Some(_) => {
            return Err(StackrError::InvalidConfig(format!(
                "service '{service}' labels must be a mapping or a list"
            )))
        }
    }
    Ok(labels)
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Interpolation
// ---------------------------------------------------------------------------

fn expand_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::?-([^}]*))?\}").unwrap())
}

/// Expand `${VAR}` and `${VAR:-default}` in a label value. Unset variables
/// expand to the default, or to nothing.
pub fn expand(value: &str, env: &BTreeMap<String, String>) -> String {
    expand_re()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            match env.get(&caps[1]).filter(|v| !v.is_empty()) {
                Some(v) => v.clone(),
                None => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Parse a boolean label value the way compose users write them.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEF: &str = r#"
services:
  web:
    image: nginx
    labels:
      stackr.deploy.auto: "${WEB_AUTO:-true}"
  backup:
    image: restic
    profiles: [cron]
    labels:
      - stackr.cron.schedule=0 3 * * *
      - stackr.cron.run_on_deploy=true
  manual:
    image: tool
    labels:
      stackr.cron.schedule: ""
  bare:
"#;

    #[test]
    fn reads_mapping_and_list_labels() {
        let file = ComposeFile::parse(DEF).unwrap();
        assert_eq!(file.services.len(), 4);
        let backup = file.service("backup").unwrap();
        assert_eq!(backup.label(LABEL_CRON_SCHEDULE), Some("0 3 * * *"));
        assert_eq!(backup.label(LABEL_RUN_ON_DEPLOY), Some("true"));
        assert_eq!(backup.profile(), Some("cron"));
        assert_eq!(file.service("manual").unwrap().label(LABEL_CRON_SCHEDULE), Some(""));
        assert!(file.service("bare").unwrap().labels.is_empty());
        assert_eq!(file.service("web").unwrap().profile(), None);
    }

    #[test]
    fn expands_variables_with_defaults() {
        let mut env = BTreeMap::new();
        assert_eq!(expand("${WEB_AUTO:-true}", &env), "true");
        env.insert("WEB_AUTO".to_string(), "false".to_string());
        assert_eq!(expand("${WEB_AUTO:-true}", &env), "false");
        assert_eq!(expand("x-${NOPE}-y", &env), "x--y");
    }

    #[test]
    fn bool_values() {
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn rejects_nested_label_values() {
        let text = "services:\n  a:\n    labels:\n      k:\n        nested: 1\n";
        assert!(ComposeFile::parse(text).is_err());
    }
}
