// Package retrieval and configuration merging. Packages are cached on
// local disk keyed by `name-v{version}` and reaped after an hour of
// disuse.
use crate::error::{JudgeError, Result};
use crate::queue::TaskQueue;
use crate::workdir::WorkDir;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use verdict_common::types::PackageRef;

const UNUSED_PACKAGE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// A resolved, versioned bundle of test assets plus its configuration
/// tree. `raw_config` is the immutable source; `config` is the `_base`
/// config deep-merged with the selected variant.
#[derive(Debug, Clone)]
pub struct Package {
    pub file_name: String,
    pub path: PathBuf,
    pub raw_config: Value,
    pub config: Value,
}

impl Package {
    /// Convenience accessor for a `section.name` plugin selector in the
    /// merged config.
    pub fn plugin_name(&self, section: &str) -> Result<&str> {
        self.config[section]["name"].as_str().ok_or_else(|| {
            JudgeError::Configuration(format!(
                "package config is missing the {section}.name selector"
            ))
        })
    }

    pub fn plugin_overrides(&self, section: &str) -> Option<&Value> {
        let overrides = &self.config[section];
        overrides.is_object().then_some(overrides)
    }
}

/// Remove cached packages unused for longer than the configured age.
pub fn prune_unused_packages(workdir: &WorkDir) {
    let packages_dir = workdir.internal("packages");
    if !packages_dir.is_dir() {
        return;
    }

    let Ok(entries) = fs::read_dir(&packages_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime + UNUSED_PACKAGE_MAX_AGE < SystemTime::now())
            .unwrap_or(false);

        if expired {
            info!(package = %path.display(), "Removing unused package");
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(package = %path.display(), error = %e, "Failed to remove unused package");
            }
        }
    }
}

/// Fetch the package with matching name and version, using the local
/// cache when possible.
pub async fn get_package(
    queue: &TaskQueue,
    workdir: &WorkDir,
    package: &PackageRef,
) -> Result<Package> {
    prune_unused_packages(workdir);

    let file_name = format!("{}-v{}", package.name, package.version);
    let path = workdir.internal(PathBuf::from("packages").join(&file_name));

    if !path.is_dir() {
        if package.url.is_some() {
            // URL retrieval was dropped with the HTTP stack; the store is
            // the single source of packages now.
            warn!(name = %package.name, "Ignoring package url, fetching from the store");
        }
        queue
            .download_package(&package.name, package.version, &path)
            .await?;
    } else {
        // Refresh mtime so the reaper treats the package as in use.
        if let Ok(dir) = fs::File::open(&path) {
            let _ = dir.set_modified(SystemTime::now());
        }
    }

    let raw_config = load_raw_config(&path)?;

    Ok(Package {
        file_name,
        path,
        raw_config,
        config: Value::Null,
    })
}

fn load_raw_config(path: &std::path::Path) -> Result<Value> {
    let yml_file = path.join("config.yml");
    let json_file = path.join("config.json");

    if yml_file.exists() {
        let content = fs::read_to_string(&yml_file)?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
            JudgeError::Package(format!("failed to parse package config.yml: {e}"))
        })?;
        serde_json::to_value(yaml)
            .map_err(|e| JudgeError::Package(format!("invalid package config.yml: {e}")))
    } else if json_file.exists() {
        let content = fs::read_to_string(&json_file)?;
        serde_json::from_str(&content)
            .map_err(|e| JudgeError::Package(format!("failed to parse package config.json: {e}")))
    } else {
        Err(JudgeError::Package(
            "no configuration file found inside package, tried config.yml and config.json"
                .to_string(),
        ))
    }
}

/// Build the effective config: `configs._base` deep-merged with the
/// named variant (when present).
pub fn parse_config(pack: Package, config_name: Option<&str>) -> Package {
    let mut config = match &pack.raw_config["configs"]["_base"] {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(Default::default()),
    };

    if let Some(name) = config_name {
        let variant = &pack.raw_config["configs"][name];
        if variant.is_object() {
            deep_merge(&mut config, variant);
        }
    }

    Package { config, ..pack }
}

/// Recursive merge: nested objects merge, everything else is replaced.
pub fn deep_merge(base: &mut Value, overrides: &Value) {
    let (Value::Object(base_map), Value::Object(override_map)) = (&mut *base, overrides) else {
        *base = overrides.clone();
        return;
    };

    for (key, value) in override_map {
        match (base_map.get_mut(key), value) {
            (Some(existing @ Value::Object(_)), Value::Object(_)) => {
                deep_merge(existing, value);
            }
            _ => {
                base_map.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pack_with_config(raw: Value) -> Package {
        Package {
            file_name: "sort-v1".to_string(),
            path: PathBuf::from("/tmp/verdict/w1/packages/sort-v1"),
            raw_config: raw,
            config: Value::Null,
        }
    }

    #[test]
    fn deep_merge_replaces_scalars_and_merges_objects() {
        let mut base = json!({
            "compiler": {"name": "gcc", "command_line": "-O2"},
            "limits": {"timeout": 1000}
        });
        deep_merge(
            &mut base,
            &json!({"compiler": {"command_line": "-O0"}, "extra": true}),
        );

        assert_eq!(base["compiler"]["name"], "gcc");
        assert_eq!(base["compiler"]["command_line"], "-O0");
        assert_eq!(base["limits"]["timeout"], 1000);
        assert_eq!(base["extra"], true);
    }

    #[test]
    fn parse_config_merges_named_variant_over_base() {
        let pack = pack_with_config(json!({
            "configs": {
                "_base": {
                    "compiler": {"name": "gcc"},
                    "evaluator": {"name": "basic", "slow_program_penalty": 0.5}
                },
                "strict": {
                    "evaluator": {"slow_program_penalty": 1.0}
                }
            }
        }));

        let pack = parse_config(pack, Some("strict"));
        assert_eq!(pack.config["compiler"]["name"], "gcc");
        assert_eq!(pack.config["evaluator"]["name"], "basic");
        assert_eq!(pack.config["evaluator"]["slow_program_penalty"], 1.0);
    }

    #[test]
    fn parse_config_without_variant_keeps_base() {
        let pack = pack_with_config(json!({
            "configs": {"_base": {"runner": {"name": "bin"}}}
        }));
        let pack = parse_config(pack, None);
        assert_eq!(pack.config["runner"]["name"], "bin");
    }

    #[test]
    fn parse_config_tolerates_missing_base() {
        let pack = pack_with_config(json!({"configs": {}}));
        let pack = parse_config(pack, Some("nope"));
        assert!(pack.config.is_object());
    }

    #[test]
    fn plugin_name_selector() {
        let mut pack = pack_with_config(json!({}));
        pack.config = json!({"compiler": {"name": "gcc", "command_line": "-O2"}});
        assert_eq!(pack.plugin_name("compiler").unwrap(), "gcc");
        assert!(pack.plugin_name("evaluator").is_err());
        assert!(pack.plugin_overrides("compiler").is_some());
        assert!(pack.plugin_overrides("evaluator").is_none());
    }
}
