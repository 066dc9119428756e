// Worker configuration, loaded once at startup from config/worker.json.
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub instance_name: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_workdir_root")]
    pub workdir_root: PathBuf,
    /// Unix user/group the sandboxed process runs as; shared mounts are
    /// chowned to it so the sandbox can read/write without escalation.
    pub sandbox_user: String,
    pub sandbox_group: String,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    #[serde(default = "default_plugin_config_dir")]
    pub plugin_config_dir: PathBuf,
    pub networking: NetworkingSettings,
    #[serde(default)]
    pub debug_mode: bool,
}

/// Settings for the private client/server network segment.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkingSettings {
    pub network_name: String,
    #[serde(default = "default_network_driver")]
    pub driver: String,
    #[serde(default = "default_true")]
    pub internal: bool,
    pub subnet: String,
    pub iprange: String,
    pub client_ip: String,
    pub server_ip: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_workdir_root() -> PathBuf {
    PathBuf::from("/tmp/verdict")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_plugin_config_dir() -> PathBuf {
    PathBuf::from("config/plugins")
}

fn default_network_driver() -> String {
    "bridge".to_string()
}

fn default_true() -> bool {
    true
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("worker config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: WorkerConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(name) = std::env::var("WORKER_INSTANCE") {
            config.instance_name = name;
        }

        Ok(config)
    }

    /// Load with default path (config/worker.json).
    pub fn load_default() -> Result<Self> {
        Self::load(Path::new("config/worker.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "instance_name": "w1",
                "sandbox_user": "nobody",
                "sandbox_group": "nogroup",
                "networking": {{
                    "network_name": "testnet",
                    "subnet": "172.30.0.0/24",
                    "iprange": "172.30.0.0/28",
                    "client_ip": "172.30.0.3",
                    "server_ip": "172.30.0.2"
                }}
            }}"#
        )
        .unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.instance_name, "w1");
        assert_eq!(config.workdir_root, PathBuf::from("/tmp/verdict"));
        assert_eq!(config.networking.driver, "bridge");
        assert!(config.networking.internal);
        assert!(!config.debug_mode);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(WorkerConfig::load(Path::new("/nonexistent/worker.json")).is_err());
    }
}
