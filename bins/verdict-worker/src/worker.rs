// Worker state machine: one submission at a time, fetch → compile →
// test → evaluate → report, with structured failure capture. A bad
// submission never halts the loop.
use crate::config::WorkerConfig;
use crate::error::{JudgeError, Result};
use crate::package::{self, Package};
use crate::queue::{now_ms, TaskQueue};
use crate::registry::{JobContext, Registry, NS_COMPILERS, NS_ENV_PROVIDER, NS_EVALUATORS};
use crate::sandbox::SandboxController;
use crate::workdir::{copy_dir_recursive, WorkDir};
use std::fs;
use tracing::{error, info, warn};
use verdict_common::types::{FinalResult, Submission, TestReport, TimeStats};

const SHRINK_MAX_LINES: usize = 250;
const SHRINK_MAX_BYTES: usize = 12288;

pub struct WorkerContext {
    pub config: WorkerConfig,
    pub sandbox: SandboxController,
    pub queue: TaskQueue,
    pub registry: Registry,
    pub workdir: WorkDir,
}

impl WorkerContext {
    fn job(&self) -> JobContext<'_> {
        JobContext {
            config: &self.config,
            sandbox: &self.sandbox,
            queue: &self.queue,
            workdir: &self.workdir,
            registry: &self.registry,
        }
    }

    /// Fetch-process-report until shutdown is requested. Only worker-fatal
    /// conditions (a stolen instance lock) escape this loop.
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.config.debug_mode {
                warn!(
                    "This worker is running in debug mode. Please disable it if this worker \
                     is running on the production environment."
                );
            }

            let Some(submission) = self.queue.fetch_submission().await? else {
                info!("Shutdown requested, stopping the fetch loop");
                return Ok(());
            };

            let started_ms = now_ms();
            let mut result = match self.process_submission(&submission).await {
                Ok(result) => result,
                Err(e @ JudgeError::LockStolen) => return Err(e),
                Err(e) => self.handle_failure(&submission, e).await,
            };
            let finished_ms = now_ms();

            result.checked_by = Some(self.config.instance_name.clone());
            result.time_stats = Some(TimeStats {
                started_ms,
                finished_ms,
                took_time_ms: finished_ms - started_ms,
            });

            if submission.wants_async_report() {
                if let Err(e) = self.queue.publish_report(&result).await {
                    error!(
                        uuid = %submission.uuid,
                        error = %e,
                        "Failed to publish the final report"
                    );
                }
            } else {
                error!(
                    uuid = %submission.uuid,
                    "Synchronous result reporting is no longer supported. Failed to send report."
                );
            }
        }
    }

    async fn process_submission(&self, submission: &Submission) -> Result<FinalResult> {
        info!(uuid = %submission.uuid, "Received new task");

        self.queue
            .report_status(&submission.uuid, "preparing", 0)
            .await;
        self.workdir.recreate_work()?;

        let pack = package::get_package(&self.queue, &self.workdir, &submission.package).await?;
        let pack = package::parse_config(pack, submission.config.as_deref());

        let (compiled, logs) = self.perform_compilation(submission, &pack).await?;
        let logs = shrink_logs(&logs, SHRINK_MAX_LINES, SHRINK_MAX_BYTES);

        if !compiled {
            self.queue.report_status(&submission.uuid, "done", 100).await;
            return Ok(FinalResult::compile_error(submission.uuid, logs));
        }

        let (score, results) = self.perform_run(submission, &pack).await?;

        info!(uuid = %submission.uuid, score, "Processing done");
        self.queue.report_status(&submission.uuid, "done", 100).await;

        Ok(FinalResult::ok(submission.uuid, score, logs, results))
    }

    async fn perform_compilation(
        &self,
        submission: &Submission,
        pack: &Package,
    ) -> Result<(bool, String)> {
        let ctx = self.job();
        let name = pack.plugin_name("compiler")?;
        let (compiler, conf) = self
            .registry
            .resolve_compiler(name, pack.plugin_overrides("compiler"))?;

        compiler
            .prepare(&ctx, &conf)
            .await
            .map_err(|e| JudgeError::plugin(NS_COMPILERS, name, e))?;

        self.queue
            .download_project(&submission.uuid, &self.workdir.internal("work/compile/in"))
            .await?;
        self.queue
            .report_status(&submission.uuid, "compiling", 0)
            .await;

        info!("Compiling the code...");
        let outcome = compiler
            .compile(&ctx, &conf, pack)
            .await
            .map_err(|e| JudgeError::plugin(NS_COMPILERS, name, e))?;

        Ok((outcome.succeeded(), outcome.message))
    }

    /// Run every test through the env provider, then score the batch.
    async fn perform_run(
        &self,
        submission: &Submission,
        pack: &Package,
    ) -> Result<(u32, Vec<TestReport>)> {
        let ctx = self.job();

        let env_name = pack.plugin_name("env")?;
        let (provider, env_conf) = self
            .registry
            .resolve_provider(env_name, pack.plugin_overrides("env"))?;

        let eval_name = pack.plugin_name("evaluator")?;
        let (evaluator, eval_conf) = self
            .registry
            .resolve_evaluator(eval_name, pack.plugin_overrides("evaluator"))?;

        let units = provider
            .create_test_units(&env_conf, pack)
            .map_err(|e| JudgeError::plugin(NS_ENV_PROVIDER, env_name, e))?;

        let mut results = Vec::with_capacity(units.len());
        for unit in &units {
            info!(test = %unit.name, "Processing test");
            let progress = 20 + (results.len() * 80 / units.len()) as u8;
            self.queue
                .report_status(&submission.uuid, "testing", progress)
                .await;

            let report = provider
                .run_test(&ctx, submission, &env_conf, pack, unit)
                .await
                .map_err(|e| JudgeError::plugin(NS_ENV_PROVIDER, env_name, e))?;
            results.push(report);
        }

        evaluator
            .process_results(&eval_conf, results)
            .map_err(|e| JudgeError::plugin(NS_EVALUATORS, eval_name, e))
    }

    /// Convert a submission-level failure into an `internal_error` result.
    /// Plugin failures additionally leave a postmortem dump behind.
    async fn handle_failure(&self, submission: &Submission, error: JudgeError) -> FinalResult {
        error!(uuid = %submission.uuid, error = %error, "An error occurred while processing submission");

        if let JudgeError::Plugin { namespace, name, .. } = &error {
            self.save_plugin_failure_report(submission, namespace, name, &error)
                .await;
        } else {
            // An error inside a sandbox lifecycle may have left the
            // container behind; sweep or it leaks.
            if let Err(e) = self.sandbox.reap_orphans(&self.workdir).await {
                error!(error = %e, "Orphan sweep after the failure did not complete");
            }
        }

        FinalResult::internal_error(submission.uuid, error.to_string())
    }

    async fn save_plugin_failure_report(
        &self,
        submission: &Submission,
        namespace: &str,
        name: &str,
        error: &JudgeError,
    ) {
        error!("--- PLUGIN FAILURE NOTICE ---");

        let saved = match self.sandbox.reap_orphans(&self.workdir).await {
            Ok(reports) => reports,
            Err(e) => {
                error!(error = %e, "Orphan sweep after the plugin failure did not complete");
                Vec::new()
            }
        };

        let report = (|| -> Result<std::path::PathBuf> {
            let report_dir = self.workdir.internal("error_report");
            fs::create_dir_all(&report_dir)?;

            let now = chrono::Local::now();
            let report_name =
                format!("plugin_error_{}_{}", now.format("%Y%m%d_%H%M%S"), submission.uuid);
            let report_path = report_dir.join(format!("{report_name}.log"));

            let related: Vec<String> = saved
                .iter()
                .filter_map(|p| Some(p.file_name()?.to_string_lossy().into_owned()))
                .collect();

            let mut content = String::new();
            content.push_str("Report about plugin failure\n");
            content.push_str(&format!("Offending plugin: {namespace}/{name}\n"));
            content.push_str(&format!("Generated on: {}\n", now.to_rfc3339()));
            content.push_str(&format!("Attached workdir dump: {report_name}\n"));
            content.push_str(&format!("Related lost container reports: {}\n", related.join(", ")));
            content.push_str(&format!("\n=== Error ===\n{error}\n=== End of report ===\n"));
            fs::write(&report_path, content)?;

            // Preserve the whole work tree next to the report for
            // inspection.
            copy_dir_recursive(&self.workdir.internal("work"), &report_dir.join(report_name))?;
            Ok(report_path)
        })();

        match report {
            Ok(path) => {
                error!(
                    report = %path.display(),
                    "IMPORTANT! In order to find out what happened, please refer to the plugin \
                     failure report"
                );
                error!("Work directory was archived in order to allow further inspection.");
            }
            Err(e) => {
                error!(error = %e, "Failed to save the plugin failure report");
            }
        }
        error!("-----------------------------");
    }
}

/// Cap logs at a line count and byte count, appending a truncation
/// notice when either limit was exceeded. Byte truncation respects
/// UTF-8 boundaries.
pub fn shrink_logs(logs: &str, max_lines: usize, max_bytes: usize) -> String {
    let total_lines = logs.split('\n').count();
    let total_bytes = logs.len();

    let mut shrunk: String = logs
        .split('\n')
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n");

    if total_bytes > max_bytes {
        let mut cut = max_bytes.min(shrunk.len());
        while cut > 0 && !shrunk.is_char_boundary(cut) {
            cut -= 1;
        }
        shrunk.truncate(cut);
        shrunk.push_str(&format!(
            "\n\n(verdict: truncated the rest of output, {total_bytes} bytes in total)"
        ));
    } else if total_lines > max_lines {
        shrunk.push_str(&format!(
            "\n\n(verdict: truncated the rest of output, {total_lines} lines in total)"
        ));
    }

    shrunk
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_logs_pass_through_untouched() {
        let logs = "main.c:3: warning: unused variable\n";
        assert_eq!(shrink_logs(logs, 250, 12288), logs);
    }

    #[test]
    fn long_line_count_is_capped_with_notice() {
        let logs = (0..400).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let shrunk = shrink_logs(&logs, 250, 1 << 20);

        assert!(shrunk.contains("line 249"));
        assert!(!shrunk.contains("line 250"));
        assert!(shrunk.ends_with("400 lines in total)"));
    }

    #[test]
    fn byte_limit_wins_over_line_limit() {
        let logs = "x".repeat(20000);
        let shrunk = shrink_logs(&logs, 250, 12288);
        assert!(shrunk.len() < 20000);
        assert!(shrunk.contains("20000 bytes in total"));
    }

    #[test]
    fn byte_truncation_respects_utf8_boundaries() {
        let logs = "é".repeat(10000); // 2 bytes each
        let shrunk = shrink_logs(&logs, 250, 12287);
        assert!(shrunk.contains("20000 bytes in total"));
        // Must not panic and must still be valid UTF-8 by construction;
        // the cut lands on a character boundary.
        assert!(shrunk.starts_with('é'));
    }
}
