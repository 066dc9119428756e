// Environment providers: stage a test's inputs around a runner, drive
// the execution and turn the raw outcome into a per-test report. Three
// modes: plain file I/O, named-pipe client/server, and private-network
// client/server.
use crate::error::{JudgeError, Result};
use crate::package::Package;
use crate::registry::{EnvProvider, JobContext, Runner};
use crate::runner::RunnerConfig;
use crate::sandbox::{mount_points, Mount, NetworkAttachment};
use crate::workdir::{copy_dir_recursive, grant_data_permissions};
use async_trait::async_trait;
use nix::sys::stat::Mode;
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;
use verdict_common::types::{
    ExecOutcome, ExecVerdict, RunnerMeta, ServiceReport, Submission, TestOptions, TestReport,
    TestUnit, TestVerdict,
};

const CLIENT_AREA: &str = "work/run";
const SERVER_AREA: &str = "work/srv";

/// Grace window for the server to exit once the client is done.
const SERVER_FINISH_GRACE: Duration = Duration::from_secs(1);

/// Discover test cases from the package layout: `tests/in-<name>` with a
/// matching `tests/out-<name>`, or the deprecated `input/` + `output/`
/// pair of directories.
pub fn enumerate_test_units(pack: &Package) -> Result<Vec<TestUnit>> {
    let tests_dir = pack.path.join("tests");
    let legacy_input = pack.path.join("input");

    let mut units = Vec::new();

    if tests_dir.is_dir() {
        for file_name in sorted_file_names(&tests_dir)? {
            let Some(name) = file_name.strip_prefix("in-") else {
                continue;
            };
            let name = name.to_string();
            units.push(TestUnit {
                runner_meta: RunnerMeta {
                    input_file: tests_dir.join(&file_name),
                    output_file: tests_dir.join(format!("out-{name}")),
                    options: test_options(pack, &name),
                },
                name,
            });
        }

        if units.is_empty() {
            return Err(JudgeError::Package(
                "no files with the \"in-\" prefix were found in the tests directory".to_string(),
            ));
        }
    } else if legacy_input.is_dir() {
        for file_name in sorted_file_names(&legacy_input)? {
            if file_name.starts_with('.') {
                continue;
            }
            let name = file_name
                .rsplit_once('.')
                .map_or(file_name.as_str(), |(stem, _)| stem)
                .to_string();
            units.push(TestUnit {
                runner_meta: RunnerMeta {
                    input_file: legacy_input.join(&file_name),
                    output_file: pack.path.join("output").join(&file_name),
                    options: test_options(pack, &name),
                },
                name,
            });
        }

        if units.is_empty() {
            return Err(JudgeError::Package(
                "no files were found in the input directory, expected at least one".to_string(),
            ));
        }
    } else {
        return Err(JudgeError::Package(
            "neither a tests nor an input directory was found in the package".to_string(),
        ));
    }

    Ok(units)
}

fn sorted_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| Some(entry.ok()?.file_name().to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

fn test_options(pack: &Package, name: &str) -> TestOptions {
    let raw = &pack.config["env"]["tests"][name];
    serde_json::from_value(raw.clone()).unwrap_or_default()
}

/// Line-based comparison ignoring leading/trailing whitespace per line.
/// A missing produced file is simply a mismatch.
pub fn compare(produced: &Path, expected: &Path) -> Result<bool> {
    let Ok(produced) = fs::File::open(produced) else {
        return Ok(false);
    };
    let expected = fs::File::open(expected)?;

    let mut produced = BufReader::new(produced).lines();
    let mut expected = BufReader::new(expected).lines();

    loop {
        match (produced.next(), expected.next()) {
            (None, None) => return Ok(true),
            (Some(a), Some(b)) => {
                if a?.trim() != b?.trim() {
                    return Ok(false);
                }
            }
            _ => return Ok(false),
        }
    }
}

/// Replace the runner's `data` directory with the test's package data
/// (if any) and open up permissions for the sandbox user.
fn stage_data_directory(ctx: &JobContext<'_>, pack: &Package, unit: &TestUnit, area: &str) -> Result<()> {
    let data = ctx.workdir.internal(format!("{area}/data"));
    let _ = fs::remove_dir_all(&data);

    let source = pack.path.join("data").join(&unit.name);
    if source.is_dir() {
        copy_dir_recursive(&source, &data)?;
    } else {
        fs::create_dir_all(&data)?;
    }

    grant_data_permissions(&data)?;
    Ok(())
}

/// Stage the compiled program into the runner's input mount.
fn stage_compiled_program(ctx: &JobContext<'_>, area: &str) -> Result<()> {
    let dest = ctx.workdir.internal(format!("{area}/in"));
    let _ = fs::remove_dir_all(&dest);
    copy_dir_recursive(&ctx.workdir.internal("work/compile/out"), &dest)?;
    Ok(())
}

async fn store_output(
    ctx: &JobContext<'_>,
    uuid: &Uuid,
    unit: &TestUnit,
    content: &str,
) -> Result<()> {
    if let Some(visibility) = &unit.runner_meta.options.store_output {
        if visibility != "none" {
            info!(test = %unit.name, "Storing output for the test");
            ctx.queue
                .upload_test_output(uuid, &unit.name, content, visibility)
                .await?;
        }
    }
    Ok(())
}

fn resolve_client_runner(
    ctx: &JobContext<'_>,
    pack: &Package,
) -> Result<(Arc<dyn Runner>, RunnerConfig)> {
    let name = pack.plugin_name("runner")?;
    let (runner, mut conf) = ctx
        .registry
        .resolve_runner(name, pack.plugin_overrides("runner"))?;
    conf.location = CLIENT_AREA.to_string();
    Ok((runner, conf))
}

fn resolve_service_runner(
    ctx: &JobContext<'_>,
    pack: &Package,
) -> Result<(Arc<dyn Runner>, RunnerConfig)> {
    let name = pack.plugin_name("service_runner")?;
    let (runner, mut conf) = ctx
        .registry
        .resolve_runner(name, pack.plugin_overrides("service_runner"))?;
    conf.location = SERVER_AREA.to_string();
    Ok((runner, conf))
}

/// Stage the package's service program and the test input for the
/// service sandbox.
fn stage_service_program(ctx: &JobContext<'_>, pack: &Package, unit: &TestUnit) -> Result<()> {
    let dest = ctx.workdir.internal(format!("{SERVER_AREA}/in"));
    let _ = fs::remove_dir_all(&dest);
    copy_dir_recursive(&pack.path.join("service"), &dest)?;
    fs::set_permissions(dest.join("prog"), fs::Permissions::from_mode(0o777))?;
    fs::copy(&unit.runner_meta.input_file, dest.join("input.txt"))?;
    Ok(())
}

fn hard_timeout_report(unit: &TestUnit, outcome: &ExecOutcome) -> TestReport {
    TestReport {
        name: unit.name.clone(),
        status: TestVerdict::HardTimeout,
        time_ms: outcome.exec_time_ms,
        timeout_ms: outcome.timeout_ms,
        memory_bytes: outcome.memory_bytes,
        points: 0.0,
        max_points: unit.runner_meta.options.points.unwrap_or(1.0),
    }
}

/// Client/server epilogue shared by the pipe and network modes: collect
/// the server's verdict and merge it with the client's execution result.
async fn finish_client_server(
    ctx: &JobContext<'_>,
    submission: &Submission,
    unit: &TestUnit,
    client_outcome: ExecOutcome,
    srv_runner: &Arc<dyn Runner>,
    srv_conf: &RunnerConfig,
    srv_handle: crate::sandbox::SandboxHandle,
) -> Result<TestReport> {
    if client_outcome.timed_out() {
        // The primary party already failed; don't give the server any
        // additional time.
        let _ = srv_runner
            .wait(ctx, srv_conf, srv_handle, Some(Duration::ZERO))
            .await?;
        return Ok(hard_timeout_report(unit, &client_outcome));
    }

    let service_outcome = srv_runner
        .wait(ctx, srv_conf, srv_handle, Some(SERVER_FINISH_GRACE))
        .await?;

    match service_outcome.status {
        ExecVerdict::BadExitCode => {
            return Err(JudgeError::Service("service program crashed".to_string()));
        }
        ExecVerdict::SoftTimeout | ExecVerdict::HardTimeout => {
            warn!(test = %unit.name, "Service failed to finish after the client");
            return Ok(hard_timeout_report(unit, &service_outcome));
        }
        ExecVerdict::Ok => {}
    }

    let verdict_file = ctx.workdir.internal(format!("{SERVER_AREA}/out/output.txt"));
    let raw = fs::read_to_string(&verdict_file)?;
    let service_report: ServiceReport = serde_json::from_str(&raw)
        .map_err(|e| JudgeError::Service(format!("malformed service verdict: {e}")))?;

    store_output(ctx, &submission.uuid, unit, &service_report.message).await?;

    Ok(TestReport {
        name: unit.name.clone(),
        status: client_outcome.status.into(),
        time_ms: client_outcome.exec_time_ms,
        timeout_ms: client_outcome.timeout_ms,
        memory_bytes: client_outcome.memory_bytes,
        points: service_report.points,
        max_points: service_report.max_points,
    })
}

/// Plain mode: input file in, produced output compared line-by-line
/// against the expected file.
pub struct FileProvider;

#[async_trait]
impl EnvProvider for FileProvider {
    fn create_test_units(&self, _conf: &Value, pack: &Package) -> Result<Vec<TestUnit>> {
        enumerate_test_units(pack)
    }

    async fn run_test(
        &self,
        ctx: &JobContext<'_>,
        submission: &Submission,
        _conf: &Value,
        pack: &Package,
        unit: &TestUnit,
    ) -> Result<TestReport> {
        let (runner, conf) = resolve_client_runner(ctx, pack)?;

        runner.prepare(ctx, &conf).await?;
        stage_compiled_program(ctx, CLIENT_AREA)?;
        stage_data_directory(ctx, pack, unit, CLIENT_AREA)?;

        let area = ctx.workdir.internal(CLIENT_AREA);
        fs::copy(&unit.runner_meta.input_file, area.join("in/input.txt"))?;

        let handle = runner
            .run(ctx, &conf, Vec::new(), NetworkAttachment::None)
            .await?;
        let outcome = runner.wait(ctx, &conf, handle, None).await?;

        let max_points = unit.runner_meta.options.points.unwrap_or(1.0);
        let mut points = 0.0;

        let status = if outcome.status != ExecVerdict::Ok {
            outcome.status.into()
        } else if !compare(&area.join("out/output.txt"), &unit.runner_meta.output_file)? {
            TestVerdict::BadAnswer
        } else {
            points = max_points;
            TestVerdict::Ok
        };

        let produced = fs::read_to_string(area.join("out/output.txt")).unwrap_or_default();
        store_output(ctx, &submission.uuid, unit, &produced).await?;

        Ok(TestReport {
            name: unit.name.clone(),
            status,
            time_ms: outcome.exec_time_ms,
            timeout_ms: outcome.timeout_ms,
            memory_bytes: outcome.memory_bytes,
            points,
            max_points,
        })
    }
}

/// Client/server mode over named pipes: the tested program talks to the
/// package's service through two fifos crossing the mount boundary.
pub struct PipeProvider;

#[async_trait]
impl EnvProvider for PipeProvider {
    fn create_test_units(&self, _conf: &Value, pack: &Package) -> Result<Vec<TestUnit>> {
        enumerate_test_units(pack)
    }

    async fn run_test(
        &self,
        ctx: &JobContext<'_>,
        submission: &Submission,
        _conf: &Value,
        pack: &Package,
        unit: &TestUnit,
    ) -> Result<TestReport> {
        let (runner, conf) = resolve_client_runner(ctx, pack)?;
        let (srv_runner, srv_conf) = resolve_service_runner(ctx, pack)?;

        srv_runner.prepare(ctx, &srv_conf).await?;
        runner.prepare(ctx, &conf).await?;

        stage_compiled_program(ctx, CLIENT_AREA)?;
        stage_data_directory(ctx, pack, unit, CLIENT_AREA)?;
        stage_service_program(ctx, pack, unit)?;

        // The client reads its input and writes its output through fifos
        // that the service holds the other end of.
        let area = ctx.workdir.internal(CLIENT_AREA);
        for fifo in [area.join("in/input.txt"), area.join("out/output.txt")] {
            nix::unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o777)).map_err(|e| {
                JudgeError::Service(format!("cannot create fifo {}: {e}", fifo.display()))
            })?;
            fs::set_permissions(&fifo, fs::Permissions::from_mode(0o777))?;
        }

        // Server first: its ready handshake completes inside `run`, so
        // the client never starts against an absent peer.
        let srv_handle = srv_runner
            .run(
                ctx,
                &srv_conf,
                vec![
                    Mount::read_write(area.join("in"), mount_points::PROG_IN),
                    Mount::read_write(area.join("out"), mount_points::PROG_OUT),
                ],
                NetworkAttachment::None,
            )
            .await?;

        let handle = runner
            .run(ctx, &conf, Vec::new(), NetworkAttachment::None)
            .await?;
        let client_outcome = runner.wait(ctx, &conf, handle, None).await?;

        finish_client_server(
            ctx,
            submission,
            unit,
            client_outcome,
            &srv_runner,
            &srv_conf,
            srv_handle,
        )
        .await
    }
}

/// Client/server mode over a private, internal-only network segment with
/// fixed addresses on both ends.
pub struct NetworkProvider;

#[async_trait]
impl EnvProvider for NetworkProvider {
    fn create_test_units(&self, _conf: &Value, pack: &Package) -> Result<Vec<TestUnit>> {
        enumerate_test_units(pack)
    }

    async fn run_test(
        &self,
        ctx: &JobContext<'_>,
        submission: &Submission,
        _conf: &Value,
        pack: &Package,
        unit: &TestUnit,
    ) -> Result<TestReport> {
        let network_id = ctx
            .sandbox
            .create_private_network(&ctx.config.networking)
            .await?;

        let result = self
            .run_test_on_network(ctx, submission, pack, unit, &network_id)
            .await;

        // The segment is per-test; remove it on every path so a failed
        // test cannot exhaust the address pool.
        if let Err(e) = ctx.sandbox.destroy_private_network(&network_id).await {
            warn!(network = %network_id, error = %e, "Failed to remove the private network");
        }

        result
    }
}

impl NetworkProvider {
    async fn run_test_on_network(
        &self,
        ctx: &JobContext<'_>,
        submission: &Submission,
        pack: &Package,
        unit: &TestUnit,
        network_id: &str,
    ) -> Result<TestReport> {
        let (runner, mut conf) = resolve_client_runner(ctx, pack)?;
        let (srv_runner, mut srv_conf) = resolve_service_runner(ctx, pack)?;
        conf.script = "run-client.sh".to_string();
        srv_conf.script = "run-server.sh".to_string();

        srv_runner.prepare(ctx, &srv_conf).await?;
        runner.prepare(ctx, &conf).await?;

        stage_compiled_program(ctx, CLIENT_AREA)?;
        stage_data_directory(ctx, pack, unit, CLIENT_AREA)?;
        stage_service_program(ctx, pack, unit)?;

        let net = &ctx.config.networking;

        let srv_handle = srv_runner
            .run(
                ctx,
                &srv_conf,
                Vec::new(),
                NetworkAttachment::Endpoint {
                    network: network_id.to_string(),
                    ipv4: net.server_ip.clone(),
                },
            )
            .await?;

        // The client wrapper receives the peer address through its input
        // mount.
        let area = ctx.workdir.internal(CLIENT_AREA);
        fs::write(area.join("in/server_addr"), &net.server_ip)?;
        fs::copy(&unit.runner_meta.input_file, area.join("in/input.txt"))?;

        let handle = runner
            .run(
                ctx,
                &conf,
                Vec::new(),
                NetworkAttachment::Endpoint {
                    network: network_id.to_string(),
                    ipv4: net.client_ip.clone(),
                },
            )
            .await?;
        let client_outcome = runner.wait(ctx, &conf, handle, None).await?;

        finish_client_server(
            ctx,
            submission,
            unit,
            client_outcome,
            &srv_runner,
            &srv_conf,
            srv_handle,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn write(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
    }

    fn pack_at(path: PathBuf, config: Value) -> Package {
        Package {
            file_name: "sort-v1".to_string(),
            path,
            raw_config: Value::Null,
            config,
        }
    }

    #[test]
    fn compare_ignores_per_line_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");

        write(&a, "1 2 3  \n4 5\n");
        write(&b, "1 2 3\n  4 5\n");
        assert!(compare(&a, &b).unwrap());

        write(&b, "1 2 3\n4 6\n");
        assert!(!compare(&a, &b).unwrap());

        write(&b, "1 2 3\n4 5\n6\n");
        assert!(!compare(&a, &b).unwrap());
    }

    #[test]
    fn compare_treats_missing_produced_file_as_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("expected.txt");
        write(&expected, "42\n");
        assert!(!compare(&dir.path().join("absent.txt"), &expected).unwrap());
    }

    #[test]
    fn enumerates_prefixed_tests_with_options() {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join("tests");
        fs::create_dir_all(&tests).unwrap();
        write(&tests.join("in-gr1-t1"), "1\n");
        write(&tests.join("out-gr1-t1"), "1\n");
        write(&tests.join("in-gr1-t2"), "2\n");
        write(&tests.join("out-gr1-t2"), "2\n");
        write(&tests.join("notes.txt"), "ignored\n");

        let pack = pack_at(
            dir.path().to_path_buf(),
            json!({"env": {"tests": {"gr1-t2": {"points": 6.0, "store_output": "public"}}}}),
        );

        let units = enumerate_test_units(&pack).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].name, "gr1-t1");
        assert!(units[0].runner_meta.options.points.is_none());
        assert_eq!(units[1].runner_meta.options.points, Some(6.0));
        assert_eq!(
            units[1].runner_meta.options.store_output.as_deref(),
            Some("public")
        );
        assert_eq!(units[1].runner_meta.output_file, tests.join("out-gr1-t2"));
    }

    #[test]
    fn enumerates_legacy_input_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("input")).unwrap();
        fs::create_dir_all(dir.path().join("output")).unwrap();
        write(&dir.path().join("input/t1.txt"), "1\n");
        write(&dir.path().join("output/t1.txt"), "1\n");
        write(&dir.path().join("input/.hidden"), "x\n");

        let pack = pack_at(dir.path().to_path_buf(), json!({}));
        let units = enumerate_test_units(&pack).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "t1");
    }

    #[test]
    fn empty_package_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pack = pack_at(dir.path().to_path_buf(), json!({}));
        assert!(matches!(
            enumerate_test_units(&pack),
            Err(JudgeError::Package(_))
        ));

        fs::create_dir_all(dir.path().join("tests")).unwrap();
        write(&dir.path().join("tests/readme.md"), "no tests here\n");
        assert!(enumerate_test_units(&pack).is_err());
    }
}
