mod compilers;
mod config;
mod error;
mod evaluator;
mod handshake;
mod package;
mod providers;
mod queue;
mod registry;
mod runner;
mod sandbox;
mod worker;
mod workdir;

use crate::config::WorkerConfig;
use crate::queue::TaskQueue;
use crate::registry::Registry;
use crate::sandbox::SandboxController;
use crate::worker::WorkerContext;
use crate::workdir::WorkDir;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Verdict worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load the worker configuration: {}", e);
        error!("Make sure config/worker.json exists");
        e
    })?;
    info!("Running as instance: {}", config.instance_name);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let workdir = WorkDir::new(&config.workdir_root, &config.instance_name);
    let sandbox = SandboxController::new(&config.instance_name)?;
    let queue = TaskQueue::connect(&config.redis_url, &config.instance_name, shutdown).await?;

    info!("Checking connectivity with the container runtime...");
    let docker_ok = sandbox.ping().await;
    info!("Checking connectivity with the store...");
    let redis_ok = queue.ping().await;
    if !docker_ok || !redis_ok {
        error!("Failed to establish the connections, exiting...");
        std::process::exit(2);
    }

    let registry = Registry::load(&config.plugin_config_dir)?;

    // Recover from a previous crash before accepting any work.
    sandbox.reap_orphans(&workdir).await?;
    sandbox.reap_orphan_networks(&config.networking).await;
    sandbox.ensure_images(&registry.required_images()).await?;
    package::prune_unused_packages(&workdir);

    // Write this instance's random uuid to the shared lock. A different
    // value showing up later means a second worker shares our name.
    queue.set_instance_lock(false).await?;

    check_ptrace_scope();
    check_shell_script_endings(&config.scripts_dir);

    info!("Ready! Starting worker...");

    let ctx = WorkerContext {
        config,
        sandbox,
        queue,
        registry,
        workdir,
    };

    if let Err(e) = ctx.run().await {
        error!("Worker stopped with a fatal error: {}", e);
        return Err(e.into());
    }

    info!("Worker stopped cleanly");
    Ok(())
}

/// Warn when processes inside sandboxes could ptrace each other.
fn check_ptrace_scope() {
    match std::fs::read_to_string("/proc/sys/kernel/yama/ptrace_scope") {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(scope) if scope < 2 => {
                warn!(
                    scope,
                    "ATTENTION! ptrace_scope is set to a value lower than 2. This may affect \
                     security of processes inside containers."
                );
            }
            Ok(_) => {}
            Err(_) => {
                warn!("ATTENTION! ptrace_scope contains an invalid value (expected a number).");
            }
        },
        Err(_) => {
            warn!("ATTENTION! Failed to check ptrace_scope due to a file access error.");
        }
    }
}

/// Wrapper scripts with CR line endings silently misbehave inside the
/// sandbox; usually a deployment mistake.
fn check_shell_script_endings(dir: &std::path::Path) {
    for script in find_cr_shell_scripts(dir) {
        warn!(
            script = %script.display(),
            "ATTENTION! Found shell script containing a CR character. This may be a mistake \
             during deployment."
        );
    }
}

fn find_cr_shell_scripts(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut offenders = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return offenders;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            offenders.extend(find_cr_shell_scripts(&path));
        } else if path.extension().is_some_and(|ext| ext == "sh") {
            if let Ok(content) = std::fs::read(&path) {
                if content.contains(&b'\r') {
                    offenders.push(path);
                }
            }
        }
    }

    offenders.sort();
    offenders
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install the SIGINT handler: {}", e);
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install the SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }

        warn!("Received shutdown signal, will terminate soon after finishing current job.");
        shutdown.cancel();
    });
}
