// Binary runner: a prepared work area with `in`, `out`, `data` and
// `scripts` subtrees, one sandbox running a wrapper script, and the
// marker-file handshake deciding readiness and completion.
use crate::error::{JudgeError, Result};
use crate::handshake;
use crate::registry::{JobContext, Runner};
use crate::sandbox::{mount_points, Mount, NetworkAttachment, SandboxHandle, SandboxLimits, SandboxSpec};
use crate::workdir::chown_recursive;
use async_trait::async_trait;
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use verdict_common::types::{ExecOutcome, ExecVerdict, WrapperReport};

/// How long a freshly started sandbox gets to raise its `ready` marker.
/// Covers wrapper startup only, never the tested program.
const READY_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace added on top of the configured timeout before the sandbox is
/// declared hung: the wrapper needs a moment to write its report.
const FINISH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerLimits {
    pub max_memory: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    /// Per-execution wall-clock limit in milliseconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    pub image: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_script")]
    pub script: String,
    pub limits: RunnerLimits,
}

fn default_location() -> String {
    "work/run".to_string()
}

fn default_script() -> String {
    "run-bin.sh".to_string()
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.limits.timeout)
    }

    fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_memory: self.limits.max_memory,
            cpu_quota: self.limits.cpu_quota,
            cpu_period: self.limits.cpu_period,
        }
    }
}

pub struct BinRunner;

impl BinRunner {
    fn area(ctx: &JobContext<'_>, conf: &RunnerConfig) -> PathBuf {
        ctx.workdir.internal(&conf.location)
    }
}

#[async_trait]
impl Runner for BinRunner {
    fn required_images(&self, conf: &RunnerConfig) -> Vec<String> {
        vec![conf.image.clone()]
    }

    /// Recreate the work area and stage the wrapper script. The compiled
    /// program is placed under `<location>` by the caller before `run`.
    async fn prepare(&self, ctx: &JobContext<'_>, conf: &RunnerConfig) -> Result<()> {
        let area = Self::area(ctx, conf);
        let _ = fs::remove_dir_all(&area);

        for sub in ["in", "out", "data", "scripts"] {
            fs::create_dir_all(area.join(sub))?;
        }

        let script_src = ctx.config.scripts_dir.join(&conf.script);
        let script_dst = area.join("scripts/run.sh");
        fs::copy(&script_src, &script_dst)?;
        fs::set_permissions(&script_dst, fs::Permissions::from_mode(0o500))?;

        chown_recursive(&area, &ctx.config.sandbox_user, &ctx.config.sandbox_group)?;
        Ok(())
    }

    /// Create and start the sandbox, then complete the readiness
    /// handshake: wait for `out/ready`, zero the memory counter, raise
    /// `in/ready_ok` to release the wrapper.
    async fn run(
        &self,
        ctx: &JobContext<'_>,
        conf: &RunnerConfig,
        extra_mounts: Vec<Mount>,
        network: NetworkAttachment,
    ) -> Result<SandboxHandle> {
        let area = Self::area(ctx, conf);

        let mut mounts = base_mounts(&area);
        mounts.extend(extra_mounts);

        let spec = SandboxSpec {
            image: conf.image.clone(),
            command: vec![format!("{}/run.sh", mount_points::SCRIPTS)],
            user: ctx.config.sandbox_user.clone(),
            mounts,
            limits: conf.sandbox_limits(),
            network,
        };

        let handle = ctx.sandbox.create(&spec).await?;
        ctx.sandbox.start(&handle).await?;

        let ready = area.join("out/ready");
        if !handshake::wait_for(&ready, READY_TIMEOUT).await {
            // A wrapper that cannot even signal readiness is broken; tear
            // the sandbox down before reporting the protocol violation.
            if let Err(e) = ctx.sandbox.destroy(&handle).await {
                warn!(id = %handle.id, error = %e, "Failed to destroy unready sandbox");
            }
            return Err(JudgeError::HandshakeTimeout {
                marker: ready,
                timeout_ms: READY_TIMEOUT.as_millis() as u64,
            });
        }

        // The wrapper is idle right now, so the counter restarts from a
        // clean baseline before the measured program begins.
        if let Err(e) = ctx.sandbox.reset_peak(&handle) {
            warn!(id = %handle.id, error = %e, "Failed to reset the peak memory counter");
        }

        handshake::touch(&area.join("in/ready_ok"))?;
        debug!(id = %handle.id, "Sandbox released for execution");
        Ok(handle)
    }

    /// Wait for `out/finished` within the configured budget, then collect
    /// the measurement. The sandbox is always destroyed before returning.
    async fn wait(
        &self,
        ctx: &JobContext<'_>,
        conf: &RunnerConfig,
        handle: SandboxHandle,
        max_time: Option<Duration>,
    ) -> Result<ExecOutcome> {
        let area = Self::area(ctx, conf);

        let mut budget = conf.timeout() + FINISH_GRACE;
        if let Some(max_time) = max_time {
            budget = budget.min(max_time);
        }

        let finished = handshake::wait_for(&area.join("out/finished"), budget).await;

        let memory = ctx.sandbox.peak_memory(&handle).await;
        let (stdout, stderr) = ctx.sandbox.destroy(&handle).await?;

        if !finished {
            debug!(id = %handle.id, "Sandbox failed to finish in time");
            return Ok(ExecOutcome::hard_timeout(conf.limits.timeout, memory));
        }

        let report: WrapperReport = serde_json::from_str(stdout.trim()).map_err(|e| {
            warn!(id = %handle.id, stderr = %stderr, "Wrapper did not produce a valid report");
            JudgeError::Service(format!("malformed wrapper report: {e}"))
        })?;

        Ok(make_outcome(conf.limits.timeout, &report, memory))
    }
}

/// The sandbox sees exactly these four subtrees; the area root itself is
/// never mounted, so the tested program cannot reach its own inputs, the
/// wrapper or the handshake markers with write access.
fn base_mounts(area: &std::path::Path) -> Vec<Mount> {
    vec![
        Mount::read_only(area.join("scripts"), mount_points::SCRIPTS),
        Mount::read_only(area.join("in"), mount_points::INPUT),
        Mount::read_write(area.join("out"), mount_points::OUTPUT),
        Mount::read_write(area.join("data"), mount_points::DATA),
    ]
}

/// Map the wrapper's self-report to a verdict. A bad exit code wins over
/// slowness: a crashed program's runtime is meaningless.
fn make_outcome(timeout_ms: u64, report: &WrapperReport, memory: Option<u64>) -> ExecOutcome {
    let status = if report.exit_code != 0 {
        ExecVerdict::BadExitCode
    } else if report.exec_time_ms >= timeout_ms {
        ExecVerdict::SoftTimeout
    } else {
        ExecVerdict::Ok
    };

    ExecOutcome {
        status,
        timeout_ms,
        exit_code: Some(report.exit_code),
        exec_time_ms: report.exec_time_ms,
        memory_bytes: memory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(exit_code: i64, exec_time_ms: u64) -> WrapperReport {
        WrapperReport {
            exit_code,
            exec_time_ms,
        }
    }

    #[test]
    fn clean_fast_run_is_ok() {
        let outcome = make_outcome(1000, &report(0, 250), Some(1024));
        assert_eq!(outcome.status, ExecVerdict::Ok);
        assert_eq!(outcome.exec_time_ms, 250);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.memory_bytes, Some(1024));
    }

    #[test]
    fn nonzero_exit_beats_slow_run() {
        let outcome = make_outcome(1000, &report(139, 1500), None);
        assert_eq!(outcome.status, ExecVerdict::BadExitCode);
    }

    #[test]
    fn slow_clean_run_is_soft_timeout() {
        let outcome = make_outcome(1000, &report(0, 1000), None);
        assert_eq!(outcome.status, ExecVerdict::SoftTimeout);
    }

    #[test]
    fn hung_sandbox_maps_to_hard_timeout() {
        let outcome = ExecOutcome::hard_timeout(1000, Some(2048));
        assert_eq!(outcome.status, ExecVerdict::HardTimeout);
        assert_eq!(outcome.exec_time_ms, 1500);
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn sandbox_never_sees_the_area_root() {
        let area = PathBuf::from("/tmp/verdict/w1/work/run");
        let mounts = base_mounts(&area);

        assert_eq!(mounts.len(), 4);
        assert!(mounts.iter().all(|m| m.host_path != area));

        let writable: Vec<&str> = mounts
            .iter()
            .filter(|m| m.mode == crate::sandbox::MountMode::ReadWrite)
            .map(|m| m.container_path.as_str())
            .collect();
        assert_eq!(writable, vec![mount_points::OUTPUT, mount_points::DATA]);
    }

    #[test]
    fn default_runner_config_fields() {
        let conf: RunnerConfig = serde_json::from_str(
            r#"{"image": "verdict-runner:latest",
                "limits": {"max_memory": 268435456, "cpu_quota": 50000,
                           "cpu_period": 100000, "timeout": 1000}}"#,
        )
        .unwrap();
        assert_eq!(conf.location, "work/run");
        assert_eq!(conf.script, "run-bin.sh");
        assert_eq!(conf.timeout(), Duration::from_millis(1000));
    }
}
