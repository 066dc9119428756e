// Sandbox lifecycle against the Docker daemon: create/start/destroy with
// resource limits, cheap peak-memory reads, private networks for the
// client/server mode, and orphan reaping after a previous crash.
use crate::config::NetworkingSettings;
use crate::error::{JudgeError, Result};
use crate::workdir::WorkDir;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

const INSTANCE_LABEL: &str = "verdict.instance";

/// Opaque id of a live sandbox. Owned exclusively by the execution
/// pipeline; must be destroyed on every exit path.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl Mount {
    pub fn read_only(host_path: PathBuf, container_path: &str) -> Self {
        Self {
            host_path,
            container_path: container_path.to_string(),
            mode: MountMode::ReadOnly,
        }
    }

    pub fn read_write(host_path: PathBuf, container_path: &str) -> Self {
        Self {
            host_path,
            container_path: container_path.to_string(),
            mode: MountMode::ReadWrite,
        }
    }

    fn bind_arg(&self) -> String {
        let mode = match self.mode {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        };
        format!("{}:{}:{}", self.host_path.display(), self.container_path, mode)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SandboxLimits {
    pub max_memory: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
}

/// Network placement for a sandbox: either fully offline or attached to a
/// private segment with a fixed IPv4 address.
#[derive(Debug, Clone)]
pub enum NetworkAttachment {
    None,
    Endpoint { network: String, ipv4: String },
}

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub command: Vec<String>,
    pub user: String,
    pub mounts: Vec<Mount>,
    pub limits: SandboxLimits,
    pub network: NetworkAttachment,
}

/// Raised by the fast memory-accounting path when the cgroup counter file
/// is unavailable; callers fall back to the full stats API.
#[derive(Debug, thiserror::Error)]
#[error("quick container stats are not available: {0}")]
pub struct StatsUnavailable(String);

pub struct SandboxController {
    docker: Docker,
    instance: String,
}

impl SandboxController {
    pub fn new(instance: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            instance: instance.to_string(),
        })
    }

    pub async fn ping(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Connection to the container runtime has failed");
                false
            }
        }
    }

    fn instance_label_value(&self) -> String {
        self.instance.clone()
    }

    fn instance_label_filter(&self) -> String {
        format!("{INSTANCE_LABEL}={}", self.instance)
    }

    pub async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let binds: Vec<String> = spec.mounts.iter().map(Mount::bind_arg).collect();

        let mut labels = HashMap::new();
        labels.insert(INSTANCE_LABEL.to_string(), self.instance_label_value());

        let mut host_config = HostConfig {
            binds: Some(binds),
            memory: Some(spec.limits.max_memory),
            cpu_quota: Some(spec.limits.cpu_quota),
            cpu_period: Some(spec.limits.cpu_period),
            ..Default::default()
        };

        let networking_config = match &spec.network {
            NetworkAttachment::None => {
                host_config.network_mode = Some("none".to_string());
                None
            }
            NetworkAttachment::Endpoint { network, ipv4 } => {
                let mut endpoints = HashMap::new();
                endpoints.insert(
                    network.clone(),
                    EndpointSettings {
                        ipam_config: Some(EndpointIpamConfig {
                            ipv4_address: Some(ipv4.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                );
                Some(NetworkingConfig {
                    endpoints_config: endpoints,
                })
            }
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            user: Some(spec.user.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;

        debug!(id = %created.id, image = %spec.image, "Created sandbox");
        Ok(SandboxHandle { id: created.id })
    }

    pub async fn start(&self, handle: &SandboxHandle) -> Result<()> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Block until the sandbox's main process exits, bounded by
    /// `timeout`. Returns the exit code, or None when the deadline
    /// passed first.
    pub async fn wait_exit(
        &self,
        handle: &SandboxHandle,
        timeout: std::time::Duration,
    ) -> Result<Option<i64>> {
        let mut stream = self
            .docker
            .wait_container(&handle.id, None::<WaitContainerOptions<String>>);

        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Ok(None),
            Ok(Some(Ok(response))) => Ok(Some(response.status_code)),
            // The wait endpoint reports a non-zero exit as an error value
            // carrying the status code.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                Ok(Some(code))
            }
            Ok(Some(Err(e))) => Err(e.into()),
        }
    }

    /// Stop with zero grace. A sandbox that already exited is not an
    /// error here.
    pub async fn stop(&self, handle: &SandboxHandle) {
        if let Err(e) = self
            .docker
            .stop_container(&handle.id, Some(StopContainerOptions { t: 0 }))
            .await
        {
            debug!(id = %handle.id, error = %e, "Sandbox stop reported an error (likely already exited)");
        }
    }

    /// Stop, capture output, then force-remove. Safe to call against a
    /// sandbox that already exited; always attempted on every exit path.
    pub async fn destroy(&self, handle: &SandboxHandle) -> Result<(String, String)> {
        self.stop(handle).await;

        let stdout = self.collect_logs(&handle.id, true, false, false).await;
        let stderr = self.collect_logs(&handle.id, false, true, false).await;

        if let Err(e) = self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => {
                    debug!(id = %handle.id, "Sandbox was already removed");
                }
                other => return Err(other.into()),
            }
        }

        Ok((stdout, stderr))
    }

    async fn collect_logs(
        &self,
        id: &str,
        stdout: bool,
        stderr: bool,
        timestamps: bool,
    ) -> String {
        let options = LogsOptions::<String> {
            stdout,
            stderr,
            timestamps,
            follow: false,
            ..Default::default()
        };

        let mut collected = String::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    collected.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(id = %id, error = %e, "Error reading sandbox logs");
                    break;
                }
            }
        }
        collected
    }

    fn memory_peak_counter_path(id: &str) -> PathBuf {
        PathBuf::from(format!(
            "/sys/fs/cgroup/memory/docker/{id}/memory.max_usage_in_bytes"
        ))
    }

    /// Low-overhead peak-memory read straight from the runtime's live
    /// memory-accounting counter; the full stats API costs seconds.
    pub fn peek_peak_memory(
        &self,
        handle: &SandboxHandle,
    ) -> std::result::Result<u64, StatsUnavailable> {
        let path = Self::memory_peak_counter_path(&handle.id);
        let raw = fs::read_to_string(&path).map_err(|e| StatsUnavailable(e.to_string()))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| StatsUnavailable(e.to_string()))
    }

    /// Peak memory with fallback: fast counter first, full stats call if
    /// the counter file is absent. None when neither source answers.
    pub async fn peak_memory(&self, handle: &SandboxHandle) -> Option<u64> {
        match self.peek_peak_memory(handle) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(id = %handle.id, error = %e, "Falling back to the full stats API");
                let options = StatsOptions {
                    stream: false,
                    one_shot: true,
                };
                let mut stream = self.docker.stats(&handle.id, Some(options));
                match stream.next().await {
                    Some(Ok(stats)) => stats.memory_stats.max_usage,
                    Some(Err(e)) => {
                        warn!(id = %handle.id, error = %e, "Full stats call failed as well");
                        None
                    }
                    None => None,
                }
            }
        }
    }

    /// Zero the peak counter right after sandbox start; initialization
    /// alone consumes several MB that would pollute the measurement.
    pub fn reset_peak(&self, handle: &SandboxHandle) -> Result<()> {
        let path = Self::memory_peak_counter_path(&handle.id);
        fs::write(&path, b"0")?;
        Ok(())
    }

    fn private_network_name(&self, settings: &NetworkingSettings) -> String {
        format!("{}-{}", self.instance, settings.network_name)
    }

    /// Isolated, internal-only bridge with a fixed IPAM pool. Used
    /// exclusively by the client/server execution mode.
    pub async fn create_private_network(&self, settings: &NetworkingSettings) -> Result<String> {
        let ipam = Ipam {
            config: Some(vec![IpamConfig {
                subnet: Some(settings.subnet.clone()),
                ip_range: Some(settings.iprange.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let options = CreateNetworkOptions {
            name: self.private_network_name(settings),
            driver: settings.driver.clone(),
            internal: settings.internal,
            ipam,
            ..Default::default()
        };

        let response = self.docker.create_network(options).await?;
        let id = response.id.ok_or_else(|| {
            JudgeError::Configuration("network creation returned no network id".to_string())
        })?;
        debug!(id = %id, "Created private network");
        Ok(id)
    }

    pub async fn destroy_private_network(&self, network_id: &str) -> Result<()> {
        self.docker.remove_network(network_id).await?;
        Ok(())
    }

    /// Remove private networks left over from a previous crash, matched
    /// by the instance naming convention.
    pub async fn reap_orphan_networks(&self, settings: &NetworkingSettings) {
        info!("Checking leftover networks...");
        let name = self.private_network_name(settings);

        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name]);

        let networks = match self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
        {
            Ok(networks) => networks,
            Err(e) => {
                error!(error = %e, "Unable to check for leftover networks");
                return;
            }
        };

        let mut removed = 0usize;
        for network in networks {
            let Some(id) = network.id else { continue };
            if let Err(e) = self.docker.remove_network(&id).await {
                error!(network = %id, error = %e, "Failed to remove leftover network");
            } else {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(count = removed, "Removed leftover network(s)");
        }
    }

    /// Find all sandboxes carrying this instance's label, write a leak
    /// report (inspection metadata + full logs) for each, then
    /// force-remove them. Recovers from a previous crash.
    pub async fn reap_orphans(&self, workdir: &WorkDir) -> Result<Vec<PathBuf>> {
        info!("Checking lost sandboxes...");

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![self.instance_label_filter()]);

        let lost = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut saved_reports = Vec::new();

        for container in lost {
            let Some(id) = container.id else { continue };

            error!(id = %id, "Found lost sandbox; a leak report will be generated");
            match self.save_leak_report(&id, workdir).await {
                Ok(report_path) => {
                    error!(
                        report = %report_path.display(),
                        "IMPORTANT! Details about this leaked sandbox are stored in the report"
                    );
                    saved_reports.push(report_path);
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to save leak report");
                }
            }

            error!(id = %id, "Destroying the lost sandbox...");
            if let Err(e) = self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                error!(id = %id, error = %e, "Failed to remove lost sandbox");
            }
        }

        Ok(saved_reports)
    }

    async fn save_leak_report(&self, id: &str, workdir: &WorkDir) -> Result<PathBuf> {
        let inspect_data = serde_json::to_string_pretty(
            &self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await?,
        )?;
        let logs = self.collect_logs(id, true, true, true).await;

        let report_dir = workdir.internal("error_report");
        fs::create_dir_all(&report_dir)?;

        let now = chrono::Local::now();
        let report_name = format!("container_leak_{}_{id}.log", now.format("%Y%m%d_%H%M%S"));
        let report_path = report_dir.join(report_name);

        let mut report = String::new();
        let _ = writeln!(report, "Report about leaked sandbox {id}");
        let _ = writeln!(report, "Generated on: {}", now.to_rfc3339());
        let _ = writeln!(
            report,
            "\n=== Inspection data (length: {}) ===",
            inspect_data.len()
        );
        report.push_str(&inspect_data);
        let _ = writeln!(report, "\n=== Sandbox logs (length: {}) ===", logs.len());
        report.push_str(&logs);
        let _ = writeln!(report, "\n=== End of report ===");

        fs::write(&report_path, report)?;
        Ok(report_path)
    }

    /// Verify every required image is present locally, pulling the
    /// missing ones before any submission is accepted.
    pub async fn ensure_images(&self, required: &[String]) -> Result<()> {
        info!("Checking image dependencies...");

        let owned: HashSet<String> = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect();

        for image in required {
            if owned.contains(image) {
                debug!(image = %image, "Image already present");
                continue;
            }

            warn!(image = %image, "Image was not found locally, pulling now");
            let options = CreateImageOptions {
                from_image: image.as_str(),
                ..Default::default()
            };

            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| {
                    error!(image = %image, error = %e, "Failed to pull image");
                    JudgeError::from(e)
                })?;
            }
            info!(image = %image, "Image pulled successfully");
        }

        info!(count = required.len(), "Found all required images");
        Ok(())
    }
}

/// Fixed mount points visible inside every sandbox.
pub mod mount_points {
    pub const SCRIPTS: &str = "/mnt/scripts";
    pub const INPUT: &str = "/mnt/in";
    pub const OUTPUT: &str = "/mnt/out";
    pub const DATA: &str = "/mnt/data";
    pub const WORK: &str = "/mnt/work";
    pub const PROG_IN: &str = "/mnt/prog-in";
    pub const PROG_OUT: &str = "/mnt/prog-out";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_arg_includes_mode() {
        let ro = Mount::read_only(PathBuf::from("/tmp/w/in"), "/mnt/in");
        let rw = Mount::read_write(PathBuf::from("/tmp/w/out"), "/mnt/out");
        assert_eq!(ro.bind_arg(), "/tmp/w/in:/mnt/in:ro");
        assert_eq!(rw.bind_arg(), "/tmp/w/out:/mnt/out:rw");
    }

    /// Round trip against a live runtime: the created network has a real
    /// id that can be removed again.
    #[tokio::test]
    #[ignore] // Requires a running Docker daemon
    async fn private_network_round_trip() {
        let controller = SandboxController::new("test-instance").unwrap();
        let settings = NetworkingSettings {
            network_name: "testnet".to_string(),
            driver: "bridge".to_string(),
            internal: true,
            subnet: "172.30.0.0/24".to_string(),
            iprange: "172.30.0.0/28".to_string(),
            client_ip: "172.30.0.3".to_string(),
            server_ip: "172.30.0.2".to_string(),
        };

        let id = controller.create_private_network(&settings).await.unwrap();
        assert!(!id.is_empty());
        controller.destroy_private_network(&id).await.unwrap();
    }

    #[test]
    fn peak_counter_path_is_per_container() {
        let path = SandboxController::memory_peak_counter_path("abc123");
        assert_eq!(
            path,
            PathBuf::from("/sys/fs/cgroup/memory/docker/abc123/memory.max_usage_in_bytes")
        );
    }
}
