use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A submission pulled from the queue. Immutable once fetched; the worker
/// consumes it exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub uuid: Uuid,
    pub package: PackageRef,
    /// Name of the package config variant to merge over `configs._base`.
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Submission {
    pub fn wants_async_report(&self) -> bool {
        self.features.iter().any(|f| f == "async_report")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub url: Option<String>,
}

/// One test case discovered from the package layout. Group membership is
/// encoded in the name via the `group-test` convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUnit {
    pub name: String,
    pub runner_meta: RunnerMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerMeta {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    #[serde(default)]
    pub options: TestOptions,
}

/// Per-test options from the package config (`env.tests.<name>`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestOptions {
    #[serde(default)]
    pub points: Option<f64>,
    #[serde(default)]
    pub store_output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileVerdict {
    Ok,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub status: CompileVerdict,
    #[serde(default)]
    pub message: String,
}

impl CompileOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == CompileVerdict::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecVerdict {
    Ok,
    BadExitCode,
    SoftTimeout,
    HardTimeout,
}

/// Normalized outcome of a single sandbox run.
///
/// `soft_timeout` means the program finished but exceeded its configured
/// timeout; `hard_timeout` means the host had to force-terminate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub status: ExecVerdict,
    pub timeout_ms: u64,
    pub exit_code: Option<i64>,
    pub exec_time_ms: u64,
    pub memory_bytes: Option<u64>,
}

impl ExecOutcome {
    /// The completion marker never appeared: reported time is pinned to
    /// `timeout + 500` regardless of actual elapsed time.
    pub fn hard_timeout(timeout_ms: u64, memory_bytes: Option<u64>) -> Self {
        Self {
            status: ExecVerdict::HardTimeout,
            timeout_ms,
            exit_code: None,
            exec_time_ms: timeout_ms + 500,
            memory_bytes,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(
            self.status,
            ExecVerdict::SoftTimeout | ExecVerdict::HardTimeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Ok,
    BadAnswer,
    BadExitCode,
    SoftTimeout,
    HardTimeout,
}

impl From<ExecVerdict> for TestVerdict {
    fn from(v: ExecVerdict) -> Self {
        match v {
            ExecVerdict::Ok => TestVerdict::Ok,
            ExecVerdict::BadExitCode => TestVerdict::BadExitCode,
            ExecVerdict::SoftTimeout => TestVerdict::SoftTimeout,
            ExecVerdict::HardTimeout => TestVerdict::HardTimeout,
        }
    }
}

/// Per-test outcome as shipped in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub status: TestVerdict,
    #[serde(rename = "time")]
    pub time_ms: u64,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(rename = "memory")]
    pub memory_bytes: Option<u64>,
    pub points: f64,
    pub max_points: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Ok,
    CompileError,
    InternalError,
}

/// Final assessment of one submission. Created once, published exactly
/// once, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub status: FinalStatus,
    pub uuid: Uuid,
    pub checked_by: Option<String>,
    pub score: u32,
    pub message: String,
    pub tests: Vec<TestReport>,
    pub time_stats: Option<TimeStats>,
}

impl FinalResult {
    pub fn ok(uuid: Uuid, score: u32, message: String, tests: Vec<TestReport>) -> Self {
        Self {
            status: FinalStatus::Ok,
            uuid,
            checked_by: None,
            score,
            message,
            tests,
            time_stats: None,
        }
    }

    pub fn compile_error(uuid: Uuid, message: String) -> Self {
        Self {
            status: FinalStatus::CompileError,
            uuid,
            checked_by: None,
            score: 0,
            message,
            tests: Vec::new(),
            time_stats: None,
        }
    }

    pub fn internal_error(uuid: Uuid, message: String) -> Self {
        Self {
            status: FinalStatus::InternalError,
            uuid,
            checked_by: None,
            score: 0,
            message,
            tests: Vec::new(),
            time_stats: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeStats {
    pub started_ms: u64,
    pub finished_ms: u64,
    pub took_time_ms: u64,
}

/// Partial progress stored under `status:{uuid}` with a short expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    pub progress: u8,
}

/// Heartbeat stored under the per-instance alive key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBeat {
    pub state: String,
    pub local_time_ms: u64,
    pub current_uuid: Option<Uuid>,
}

/// The single JSON object a sandboxed wrapper writes to stdout on
/// completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperReport {
    pub exit_code: i64,
    #[serde(rename = "exec_time")]
    pub exec_time_ms: u64,
}

/// Extra self-report written by the service sandbox in pipe/network mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReport {
    pub points: f64,
    pub max_points: f64,
    #[serde(default)]
    pub message: String,
}
