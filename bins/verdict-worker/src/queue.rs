// Task queue client: priority-ordered, at-least-once intake over the
// shared Redis store, plus status reporting, heartbeats, the instance
// lock and asynchronous result publication.
use crate::error::{JudgeError, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use verdict_common::keys::{self, Priority};
use verdict_common::types::{FinalResult, StatusUpdate, Submission, WorkerBeat};

const BLPOP_TIMEOUT_SECS: f64 = 5.0;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const STATUS_EXPIRY_SECS: u64 = 60;
const BEAT_EXPIRY_SECS: u64 = 120;
const EVALUATION_EXPIRY_SECS: i64 = 120;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct TaskQueue {
    conn: ConnectionManager,
    instance: String,
    /// Random value written to the instance lock; a different value read
    /// back means another worker shares our instance name.
    instance_uuid: Uuid,
    shutdown: CancellationToken,
}

impl TaskQueue {
    pub async fn connect(
        redis_url: &str,
        instance: &str,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            instance: instance.to_string(),
            instance_uuid: Uuid::new_v4(),
            shutdown,
        })
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to issue PING command to the store");
                false
            }
        }
    }

    /// Block until connectivity returns or shutdown is requested.
    async fn retry_ping(&self) {
        error!("Operation failed due to a store connection problem");
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if self.ping().await {
                info!("Connectivity restored, getting back to operation...");
                return;
            }
            error!("Retrying in 5 seconds...");
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    fn compare_instance_key(&self, value: Option<&str>) -> Result<()> {
        if value != Some(self.instance_uuid.to_string().as_str()) {
            return Err(JudgeError::LockStolen);
        }
        Ok(())
    }

    /// Check-then-getset on the shared instance lock. Not race-free; a
    /// best-effort double-start detector, not a distributed lock.
    pub async fn set_instance_lock(&self, fail_on_mismatch: bool) -> Result<()> {
        let key = keys::instance_lock_key(&self.instance);
        let mut conn = self.conn.clone();

        if fail_on_mismatch {
            let previous: Option<String> = conn.get(&key).await?;
            self.compare_instance_key(previous.as_deref())?;
        }

        let previous: Option<String> = conn
            .getset(&key, self.instance_uuid.to_string())
            .await?;

        if fail_on_mismatch {
            self.compare_instance_key(previous.as_deref())?;
        }
        Ok(())
    }

    pub async fn send_beat(&self, state: &str, current_uuid: Option<Uuid>) -> Result<()> {
        let beat = WorkerBeat {
            state: state.to_string(),
            local_time_ms: now_ms(),
            current_uuid,
        };
        let key = keys::alive_worker_key(&self.instance);
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(&key, serde_json::to_string(&beat)?, BEAT_EXPIRY_SECS)
            .await?;
        Ok(())
    }

    /// Report partial progress under `status:{uuid}` with a short expiry.
    /// Connectivity problems here are logged and swallowed; progress is
    /// advisory.
    pub async fn report_status(&self, uuid: &Uuid, status: &str, progress: u8) {
        let result: Result<()> = async {
            self.send_beat("checking", Some(*uuid)).await?;
            let update = StatusUpdate {
                status: status.to_string(),
                progress,
            };
            let mut conn = self.conn.clone();
            let _: () = conn
                .set_ex(
                    &keys::status_key(uuid),
                    serde_json::to_string(&update)?,
                    STATUS_EXPIRY_SECS,
                )
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(uuid = %uuid, error = %e, "Failed to report partial status");
        }
    }

    /// Blocking pop across the priority queues. Returns None when
    /// shutdown was requested; connection loss is retried with backoff
    /// and never drops a submission.
    pub async fn fetch_submission(&self) -> Result<Option<Submission>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }

            match self.try_fetch_once().await {
                Ok(Some(submission)) => return Ok(Some(submission)),
                Ok(None) => continue,
                Err(JudgeError::Redis(e)) if is_connection_error(&e) => {
                    self.retry_ping().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch_once(&self) -> Result<Option<Submission>> {
        self.set_instance_lock(true).await?;
        self.send_beat("idle", None).await?;

        let queue_keys: Vec<String> = Priority::ALL.iter().map(|p| keys::queue_key(*p)).collect();
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(&queue_keys, BLPOP_TIMEOUT_SECS).await?;

        let Some((queue, payload)) = popped else {
            return Ok(None);
        };

        let submission: Submission = serde_json::from_str(&payload)?;

        let order = keys::order_key(&queue);
        let removed: i64 = conn.zrem(&order, submission.uuid.to_string()).await?;
        if removed == 0 {
            warn!(uuid = %submission.uuid, key = %order, "Failed to remove submission from the order set");
        }

        Ok(Some(submission))
    }

    /// Download files stored as `file:<relative_path>` hash fields into
    /// `dest`, then delete the hash unless marked persistent.
    async fn download_files(&self, main_key: &str, dest: &Path) -> Result<()> {
        let _ = fs::remove_dir_all(dest);

        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn.hkeys(main_key).await?;
        if fields.is_empty() {
            return Err(JudgeError::Package(format!(
                "failed to download files, key does not exist: {main_key}"
            )));
        }

        for field in &fields {
            let Some(relative) = field.strip_prefix(keys::FILE_FIELD_PREFIX) else {
                continue;
            };

            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let data: Option<Vec<u8>> = conn.hget(main_key, field).await?;
            let data = data.ok_or_else(|| {
                JudgeError::Package(format!("hash field vanished during download: {field}"))
            })?;
            fs::write(&path, data)?;
        }

        let persistent: Option<Vec<u8>> = conn.hget(main_key, keys::PERSISTENT_FIELD).await?;
        if persistent.is_none() {
            let _: i64 = conn.del(main_key).await?;
        }
        Ok(())
    }

    pub async fn download_project(&self, uuid: &Uuid, dest: &Path) -> Result<()> {
        self.download_files(&keys::submission_key(uuid), dest).await
    }

    pub async fn download_package(&self, name: &str, version: u32, dest: &Path) -> Result<()> {
        info!(name, version, "Attempting to download missing package from the store");
        self.download_files(&keys::package_key(name, version), dest)
            .await
    }

    /// Store a test's program output so the frontend can show it. The
    /// key expires shortly after the last change.
    pub async fn upload_test_output(
        &self,
        uuid: &Uuid,
        test_name: &str,
        output: &str,
        visibility: &str,
    ) -> Result<()> {
        let key = keys::evaluation_key(uuid);
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(&key, format!("test_output:{test_name}"), output)
            .await?;
        let _: () = conn
            .hset(
                &key,
                format!("test_output_visibility:{test_name}"),
                visibility,
            )
            .await?;
        let _: () = conn.expire(&key, EVALUATION_EXPIRY_SECS).await?;
        Ok(())
    }

    /// Publish the final result on the reports channel. Returns false
    /// (and logs) when no subscriber received it. Connection loss is
    /// retried with backoff; a finished submission's report must not be
    /// dropped over a transient outage.
    pub async fn publish_report(&self, result: &FinalResult) -> Result<bool> {
        loop {
            match self.try_publish_report(result).await {
                Err(JudgeError::Redis(e))
                    if is_connection_error(&e) && !self.shutdown.is_cancelled() =>
                {
                    self.retry_ping().await;
                }
                other => return other,
            }
        }
    }

    async fn try_publish_report(&self, result: &FinalResult) -> Result<bool> {
        let payload = serde_json::to_string_pretty(result)?;
        info!(uuid = %result.uuid, "Sending final report");

        let mut conn = self.conn.clone();
        let recipients: i64 = conn.publish(keys::REPORTS_CHANNEL, payload).await?;

        if recipients == 0 {
            error!(uuid = %result.uuid, "Final report was published but no clients received it");
            Ok(false)
        } else {
            info!(uuid = %result.uuid, recipients, "Final result was published successfully");
            Ok(true)
        }
    }
}

fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() || e.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_common::types::PackageRef;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000); // past 2020
    }

    /// Round trip through a live store: one queued submission comes back
    /// with the same uuid.
    #[tokio::test]
    #[ignore] // Requires a running Redis instance
    async fn fetch_returns_queued_submission() {
        let token = CancellationToken::new();
        let queue = TaskQueue::connect("redis://127.0.0.1:6379", "test-instance", token)
            .await
            .unwrap();
        queue.set_instance_lock(false).await.unwrap();

        let submission = Submission {
            uuid: Uuid::new_v4(),
            package: PackageRef {
                name: "sort".to_string(),
                version: 1,
                url: None,
            },
            config: None,
            features: vec!["async_report".to_string()],
        };

        let mut conn = queue.conn.clone();
        let _: i64 = conn
            .rpush(
                keys::queue_key(Priority::High),
                serde_json::to_string(&submission).unwrap(),
            )
            .await
            .unwrap();

        let fetched = queue.fetch_submission().await.unwrap().unwrap();
        assert_eq!(fetched.uuid, submission.uuid);
    }

    /// Publishing to a live store with no subscriber succeeds at the
    /// transport level but reports that nobody received it.
    #[tokio::test]
    #[ignore] // Requires a running Redis instance
    async fn publish_without_subscribers_reports_unreceived() {
        let token = CancellationToken::new();
        let queue = TaskQueue::connect("redis://127.0.0.1:6379", "test-instance", token)
            .await
            .unwrap();

        let result = FinalResult::ok(Uuid::new_v4(), 100, String::new(), Vec::new());
        let received = queue.publish_report(&result).await.unwrap();
        assert!(!received);
    }
}
