// GCC compiler strategy: stages sources and option files into a compile
// area, runs the gcc wrapper in an offline sandbox and maps its exit to
// a compile verdict.
use crate::error::{JudgeError, Result};
use crate::package::Package;
use crate::registry::{Compiler, JobContext};
use crate::sandbox::{mount_points, Mount, NetworkAttachment, SandboxLimits, SandboxSpec};
use crate::workdir::chown_recursive;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use verdict_common::types::{CompileOutcome, CompileVerdict};

const COMPILE_AREA: &str = "work/compile";

#[derive(Debug, Clone, Deserialize)]
struct GccLimits {
    max_memory: i64,
    cpu_quota: i64,
    cpu_period: i64,
    /// Whole-compilation wall-clock limit in milliseconds.
    timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct GccConfig {
    image: String,
    /// Flags for compiling the submitted sources.
    command_line: String,
    /// Flags for compiling package-provided injected sources.
    inject_command_line: String,
    link_command_line: String,
    strip_command_line: String,
    /// Files copied from the package into the compile sandbox, built
    /// alongside the submission (graders, harness mains).
    #[serde(default)]
    inject_files: Vec<String>,
    limits: GccLimits,
}

fn parse_conf(conf: &Value) -> Result<GccConfig> {
    serde_json::from_value(conf.clone())
        .map_err(|e| JudgeError::Configuration(format!("invalid gcc compiler configuration: {e}")))
}

pub struct GccCompiler;

impl GccCompiler {
    fn area(ctx: &JobContext<'_>) -> PathBuf {
        ctx.workdir.internal(COMPILE_AREA)
    }
}

#[async_trait]
impl Compiler for GccCompiler {
    fn required_images(&self, conf: &Value) -> Vec<String> {
        match conf["image"].as_str() {
            Some(image) => vec![image.to_string()],
            None => Vec::new(),
        }
    }

    /// Recreate the compile area. The submitted sources land in `in/`
    /// (staged by the caller); the wrapper works inside `work/` and
    /// leaves the linked binary in `out/`.
    async fn prepare(&self, ctx: &JobContext<'_>, conf: &Value) -> Result<()> {
        parse_conf(conf)?;

        let area = Self::area(ctx);
        let _ = fs::remove_dir_all(&area);

        for sub in ["in", "out", "work/opt", "work/src", "work/obj", "work/inject"] {
            fs::create_dir_all(area.join(sub))?;
        }

        let wrapper_src = ctx.config.scripts_dir.join("gcc.sh");
        let wrapper_dst = area.join("work/gcc.sh");
        fs::copy(&wrapper_src, &wrapper_dst)?;
        fs::set_permissions(&wrapper_dst, fs::Permissions::from_mode(0o500))?;

        chown_recursive(&area, &ctx.config.sandbox_user, &ctx.config.sandbox_group)?;
        Ok(())
    }

    async fn compile(
        &self,
        ctx: &JobContext<'_>,
        conf: &Value,
        pack: &Package,
    ) -> Result<CompileOutcome> {
        let conf = parse_conf(conf)?;
        let area = Self::area(ctx);

        // The wrapper reads its flags from option files rather than the
        // command line, keeping the sandbox command fixed.
        let opt = area.join("work/opt");
        fs::write(opt.join("comp_opt"), &conf.command_line)?;
        fs::write(opt.join("inject_comp_opt"), &conf.inject_command_line)?;
        fs::write(opt.join("link_opt"), &conf.link_command_line)?;
        fs::write(opt.join("strip_opt"), &conf.strip_command_line)?;

        for name in &conf.inject_files {
            fs::copy(pack.path.join(name), area.join("work/inject").join(name))?;
        }

        let spec = SandboxSpec {
            image: conf.image.clone(),
            command: vec![format!("{}/gcc.sh", mount_points::WORK)],
            user: ctx.config.sandbox_user.clone(),
            mounts: vec![
                Mount::read_only(area.join("in"), mount_points::INPUT),
                Mount::read_write(area.join("work"), mount_points::WORK),
                Mount::read_write(area.join("out"), mount_points::OUTPUT),
            ],
            limits: SandboxLimits {
                max_memory: conf.limits.max_memory,
                cpu_quota: conf.limits.cpu_quota,
                cpu_period: conf.limits.cpu_period,
            },
            network: NetworkAttachment::None,
        };

        let handle = ctx.sandbox.create(&spec).await?;
        ctx.sandbox.start(&handle).await?;

        let exit = match ctx
            .sandbox
            .wait_exit(&handle, Duration::from_millis(conf.limits.timeout))
            .await
        {
            Ok(exit) => exit,
            Err(e) => {
                // Runtime-level failure, not a compile outcome; clean up
                // before surfacing it.
                let _ = ctx.sandbox.destroy(&handle).await;
                return Err(e);
            }
        };

        let status = compile_verdict(exit);
        match status {
            CompileVerdict::Ok => {}
            CompileVerdict::Error => {
                debug!(code = ?exit, "Compilation sandbox exited with an error");
            }
            CompileVerdict::Timeout => {
                warn!(timeout_ms = conf.limits.timeout, "Compilation timed out");
            }
        }

        let (stdout, stderr) = ctx.sandbox.destroy(&handle).await?;

        Ok(CompileOutcome {
            status,
            message: stderr + &stdout,
        })
    }
}

/// Exit-to-verdict mapping: None means the wait deadline expired.
fn compile_verdict(exit: Option<i64>) -> CompileVerdict {
    match exit {
        Some(0) => CompileVerdict::Ok,
        Some(_) => CompileVerdict::Error,
        None => CompileVerdict::Timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_conf() -> Value {
        json!({
            "image": "gcc:latest",
            "command_line": "-O2 -Wall -std=c11",
            "inject_command_line": "-O2",
            "link_command_line": "-lm",
            "strip_command_line": "-s",
            "inject_files": ["grader.c"],
            "limits": {
                "max_memory": 536870912,
                "cpu_quota": 100000,
                "cpu_period": 100000,
                "timeout": 30000
            }
        })
    }

    #[test]
    fn configuration_parses_and_exposes_image() {
        let conf = sample_conf();
        let parsed = parse_conf(&conf).unwrap();
        assert_eq!(parsed.image, "gcc:latest");
        assert_eq!(parsed.inject_files, vec!["grader.c"]);
        assert_eq!(GccCompiler.required_images(&conf), vec!["gcc:latest"]);
    }

    #[test]
    fn exit_codes_map_to_compile_verdicts() {
        assert_eq!(compile_verdict(Some(0)), CompileVerdict::Ok);
        assert_eq!(compile_verdict(Some(1)), CompileVerdict::Error);
        assert_eq!(compile_verdict(Some(139)), CompileVerdict::Error);
        assert_eq!(compile_verdict(None), CompileVerdict::Timeout);
    }

    #[test]
    fn missing_limits_is_a_configuration_error() {
        let conf = json!({"image": "gcc:latest", "command_line": "",
                          "inject_command_line": "", "link_command_line": "",
                          "strip_command_line": ""});
        assert!(matches!(
            parse_conf(&conf),
            Err(JudgeError::Configuration(_))
        ));
    }
}
