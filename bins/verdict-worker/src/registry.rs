// Strategy registry: maps string keys to capability implementations per
// namespace (compilers, runners, env providers, evaluators), resolved
// once at startup. Unknown keys are a configuration error at resolve
// time, not at call time.
use crate::config::WorkerConfig;
use crate::error::{JudgeError, Result};
use crate::package::Package;
use crate::queue::TaskQueue;
use crate::runner::RunnerConfig;
use crate::sandbox::{Mount, NetworkAttachment, SandboxController, SandboxHandle};
use crate::workdir::WorkDir;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use verdict_common::types::{CompileOutcome, ExecOutcome, Submission, TestReport, TestUnit};

pub const NS_COMPILERS: &str = "compilers";
pub const NS_RUNNERS: &str = "runners";
pub const NS_ENV_PROVIDER: &str = "env_provider";
pub const NS_EVALUATORS: &str = "evaluators";

/// Shared handles every strategy call receives. Constructed per
/// submission by the worker; components never reach for globals.
pub struct JobContext<'a> {
    pub config: &'a WorkerConfig,
    pub sandbox: &'a SandboxController,
    pub queue: &'a TaskQueue,
    pub workdir: &'a WorkDir,
    pub registry: &'a Registry,
}

/// Compiles the submitted sources inside a sandbox.
#[async_trait]
pub trait Compiler: Send + Sync {
    fn required_images(&self, conf: &Value) -> Vec<String>;
    async fn prepare(&self, ctx: &JobContext<'_>, conf: &Value) -> Result<()>;
    async fn compile(
        &self,
        ctx: &JobContext<'_>,
        conf: &Value,
        pack: &Package,
    ) -> Result<CompileOutcome>;
}

/// Drives a single sandbox through prepare → start → wait-with-timeout →
/// collect-result.
#[async_trait]
pub trait Runner: Send + Sync {
    fn required_images(&self, conf: &RunnerConfig) -> Vec<String>;
    async fn prepare(&self, ctx: &JobContext<'_>, conf: &RunnerConfig) -> Result<()>;
    async fn run(
        &self,
        ctx: &JobContext<'_>,
        conf: &RunnerConfig,
        extra_mounts: Vec<Mount>,
        network: NetworkAttachment,
    ) -> Result<SandboxHandle>;
    async fn wait(
        &self,
        ctx: &JobContext<'_>,
        conf: &RunnerConfig,
        handle: SandboxHandle,
        max_time: Option<Duration>,
    ) -> Result<ExecOutcome>;
}

/// Sets up the execution environment for a test and produces its raw
/// outcome.
#[async_trait]
pub trait EnvProvider: Send + Sync {
    fn create_test_units(&self, conf: &Value, pack: &Package) -> Result<Vec<TestUnit>>;
    async fn run_test(
        &self,
        ctx: &JobContext<'_>,
        submission: &Submission,
        conf: &Value,
        pack: &Package,
        unit: &TestUnit,
    ) -> Result<TestReport>;
}

/// Converts per-test outcomes into a numeric score.
pub trait Evaluator: Send + Sync {
    fn process_results(&self, conf: &Value, results: Vec<TestReport>)
        -> Result<(u32, Vec<TestReport>)>;
}

pub struct Registry {
    compilers: HashMap<String, Arc<dyn Compiler>>,
    runners: HashMap<String, Arc<dyn Runner>>,
    providers: HashMap<String, Arc<dyn EnvProvider>>,
    evaluators: HashMap<String, Arc<dyn Evaluator>>,
    /// Default configuration per "namespace/name", loaded from the
    /// plugin config directory at startup.
    defaults: HashMap<String, Value>,
}

impl Registry {
    /// Register the built-in strategies and load each one's default
    /// configuration file. Loading is idempotent and namespace-scoped.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let mut registry = Self {
            compilers: HashMap::new(),
            runners: HashMap::new(),
            providers: HashMap::new(),
            evaluators: HashMap::new(),
            defaults: HashMap::new(),
        };

        registry.register_compiler(config_dir, "gcc", Arc::new(crate::compilers::GccCompiler))?;
        registry.register_runner(config_dir, "bin", Arc::new(crate::runner::BinRunner))?;
        registry.register_provider(config_dir, "file", Arc::new(crate::providers::FileProvider))?;
        registry.register_provider(config_dir, "pipe", Arc::new(crate::providers::PipeProvider))?;
        registry.register_provider(
            config_dir,
            "network",
            Arc::new(crate::providers::NetworkProvider),
        )?;
        registry.register_evaluator(
            config_dir,
            "basic",
            Arc::new(crate::evaluator::BasicEvaluator),
        )?;

        for namespace in [NS_COMPILERS, NS_RUNNERS, NS_ENV_PROVIDER, NS_EVALUATORS] {
            let loaded: Vec<&str> = registry
                .defaults
                .keys()
                .filter_map(|key| key.strip_prefix(&format!("{namespace}/")))
                .collect();
            info!(namespace, plugins = ?loaded, "Loaded plugin namespace");
        }

        Ok(registry)
    }

    fn register_compiler(
        &mut self,
        config_dir: &Path,
        name: &str,
        compiler: Arc<dyn Compiler>,
    ) -> Result<()> {
        self.load_default(config_dir, NS_COMPILERS, name)?;
        self.compilers.insert(name.to_string(), compiler);
        Ok(())
    }

    fn register_runner(
        &mut self,
        config_dir: &Path,
        name: &str,
        runner: Arc<dyn Runner>,
    ) -> Result<()> {
        self.load_default(config_dir, NS_RUNNERS, name)?;
        self.runners.insert(name.to_string(), runner);
        Ok(())
    }

    fn register_provider(
        &mut self,
        config_dir: &Path,
        name: &str,
        provider: Arc<dyn EnvProvider>,
    ) -> Result<()> {
        self.load_default(config_dir, NS_ENV_PROVIDER, name)?;
        self.providers.insert(name.to_string(), provider);
        Ok(())
    }

    fn register_evaluator(
        &mut self,
        config_dir: &Path,
        name: &str,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<()> {
        self.load_default(config_dir, NS_EVALUATORS, name)?;
        self.evaluators.insert(name.to_string(), evaluator);
        Ok(())
    }

    fn load_default(&mut self, config_dir: &Path, namespace: &str, name: &str) -> Result<()> {
        let key = format!("{namespace}/{name}");
        if self.defaults.contains_key(&key) {
            return Ok(());
        }

        let path = default_config_path(config_dir, namespace, name);
        let content = fs::read_to_string(&path).map_err(|e| {
            JudgeError::Configuration(format!(
                "failed to load default plugin configuration file {}: {e}",
                path.display()
            ))
        })?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
            JudgeError::Configuration(format!(
                "malformed default plugin configuration file {}: {e}",
                path.display()
            ))
        })?;
        let value = serde_json::to_value(yaml).map_err(|e| {
            JudgeError::Configuration(format!(
                "invalid default plugin configuration {}: {e}",
                path.display()
            ))
        })?;

        self.defaults.insert(key, value);
        Ok(())
    }

    /// Default configuration with `overrides` shallow-applied on top.
    fn effective_config(
        &self,
        namespace: &str,
        name: &str,
        overrides: Option<&Value>,
    ) -> Result<Value> {
        let mut config = self
            .defaults
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| {
                JudgeError::Configuration(format!("no such plugin: {name} in namespace {namespace}"))
            })?;

        if let (Value::Object(base), Some(Value::Object(over))) = (&mut config, overrides) {
            for (key, value) in over {
                base.insert(key.clone(), value.clone());
            }
        }

        Ok(config)
    }

    pub fn resolve_compiler(
        &self,
        name: &str,
        overrides: Option<&Value>,
    ) -> Result<(Arc<dyn Compiler>, Value)> {
        let compiler = self.compilers.get(name).cloned().ok_or_else(|| {
            JudgeError::Configuration(format!("no such plugin: {name} in namespace compilers"))
        })?;
        let config = self.effective_config(NS_COMPILERS, name, overrides)?;
        Ok((compiler, config))
    }

    pub fn resolve_runner(
        &self,
        name: &str,
        overrides: Option<&Value>,
    ) -> Result<(Arc<dyn Runner>, RunnerConfig)> {
        let runner = self.runners.get(name).cloned().ok_or_else(|| {
            JudgeError::Configuration(format!("no such plugin: {name} in namespace runners"))
        })?;
        let config = self.effective_config(NS_RUNNERS, name, overrides)?;
        let config: RunnerConfig = serde_json::from_value(config).map_err(|e| {
            JudgeError::Configuration(format!("invalid runner configuration for {name}: {e}"))
        })?;
        Ok((runner, config))
    }

    pub fn resolve_provider(
        &self,
        name: &str,
        overrides: Option<&Value>,
    ) -> Result<(Arc<dyn EnvProvider>, Value)> {
        let provider = self.providers.get(name).cloned().ok_or_else(|| {
            JudgeError::Configuration(format!("no such plugin: {name} in namespace env_provider"))
        })?;
        let config = self.effective_config(NS_ENV_PROVIDER, name, overrides)?;
        Ok((provider, config))
    }

    pub fn resolve_evaluator(
        &self,
        name: &str,
        overrides: Option<&Value>,
    ) -> Result<(Arc<dyn Evaluator>, Value)> {
        let evaluator = self.evaluators.get(name).cloned().ok_or_else(|| {
            JudgeError::Configuration(format!("no such plugin: {name} in namespace evaluators"))
        })?;
        let config = self.effective_config(NS_EVALUATORS, name, overrides)?;
        Ok((evaluator, config))
    }

    /// External sandbox images every registered strategy depends on; the
    /// startup check pre-fetches these.
    pub fn required_images(&self) -> Vec<String> {
        let mut images = Vec::new();

        for (name, compiler) in &self.compilers {
            if let Some(conf) = self.defaults.get(&format!("{NS_COMPILERS}/{name}")) {
                images.extend(compiler.required_images(conf));
            }
        }
        for (name, runner) in &self.runners {
            if let Some(conf) = self.defaults.get(&format!("{NS_RUNNERS}/{name}")) {
                if let Ok(conf) = serde_json::from_value::<RunnerConfig>(conf.clone()) {
                    images.extend(runner.required_images(&conf));
                }
            }
        }

        images.sort();
        images.dedup();
        images
    }
}

fn default_config_path(config_dir: &Path, namespace: &str, name: &str) -> PathBuf {
    config_dir.join(namespace).join(format!("{name}.yml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_plugin_config(dir: &Path, namespace: &str, name: &str, content: &str) {
        let ns_dir = dir.join(namespace);
        fs::create_dir_all(&ns_dir).unwrap();
        fs::write(ns_dir.join(format!("{name}.yml")), content).unwrap();
    }

    fn seed_config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_plugin_config(
            dir.path(),
            NS_COMPILERS,
            "gcc",
            "image: gcc:latest\ncommand_line: \"-O2 -Wall\"\ninject_command_line: \"\"\nlink_command_line: \"\"\nstrip_command_line: \"\"\ninject_files: []\nlimits:\n  max_memory: 536870912\n  cpu_quota: 100000\n  cpu_period: 100000\n  timeout: 30000\n",
        );
        write_plugin_config(
            dir.path(),
            NS_RUNNERS,
            "bin",
            "image: verdict-runner:latest\nlocation: work/run\nlimits:\n  max_memory: 268435456\n  cpu_quota: 50000\n  cpu_period: 100000\n  timeout: 1000\n",
        );
        write_plugin_config(dir.path(), NS_ENV_PROVIDER, "file", "tests: {}\n");
        write_plugin_config(dir.path(), NS_ENV_PROVIDER, "pipe", "tests: {}\n");
        write_plugin_config(dir.path(), NS_ENV_PROVIDER, "network", "tests: {}\n");
        write_plugin_config(
            dir.path(),
            NS_EVALUATORS,
            "basic",
            "slow_program_threshold: 0.8\nslow_program_penalty: 0.5\nslow_program_scale: linear\n",
        );
        dir
    }

    #[test]
    fn resolves_known_strategies_with_defaults() {
        let dir = seed_config_dir();
        let registry = Registry::load(dir.path()).unwrap();

        let (_, conf) = registry.resolve_compiler("gcc", None).unwrap();
        assert_eq!(conf["image"], "gcc:latest");

        let (_, runner_conf) = registry.resolve_runner("bin", None).unwrap();
        assert_eq!(runner_conf.image, "verdict-runner:latest");
        assert_eq!(runner_conf.limits.timeout, 1000);
    }

    #[test]
    fn overrides_are_shallow_applied() {
        let dir = seed_config_dir();
        let registry = Registry::load(dir.path()).unwrap();

        let overrides = json!({"name": "gcc", "command_line": "-O0"});
        let (_, conf) = registry.resolve_compiler("gcc", Some(&overrides)).unwrap();
        assert_eq!(conf["command_line"], "-O0");
        assert_eq!(conf["image"], "gcc:latest");
    }

    #[test]
    fn unknown_name_is_a_configuration_error() {
        let dir = seed_config_dir();
        let registry = Registry::load(dir.path()).unwrap();
        assert!(matches!(
            registry.resolve_compiler("javac", None),
            Err(JudgeError::Configuration(_))
        ));
        assert!(registry.resolve_evaluator("fancy", None).is_err());
    }

    #[test]
    fn missing_default_config_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Registry::load(dir.path()),
            Err(JudgeError::Configuration(_))
        ));
    }

    #[test]
    fn required_images_are_collected_and_deduped() {
        let dir = seed_config_dir();
        let registry = Registry::load(dir.path()).unwrap();
        let images = registry.required_images();
        assert!(images.contains(&"gcc:latest".to_string()));
        assert!(images.contains(&"verdict-runner:latest".to_string()));
    }
}
