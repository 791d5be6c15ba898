//! Out-of-process workers.
//!
//! Terminating a worker first fails its in-flight calls with
//! [`PluginError::Cancelled`], then asks it to shut down over the channel
//! and finally signals the process group.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nebula_core::{PLUGIN_API_VERSION, PluginName};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExitListener, SupervisorSettings, Worker, WorkerExit, WorkerToken, next_worker_id};
use crate::bridge::{DryRunGuard, ScopedContext};
use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::channel::CallChannel;
use crate::descriptor::{PluginDescriptor, PluginKind};
use crate::error::{PluginError, PluginResult};
use crate::policy::CrashCause;

/// How long a worker whose channel broke gets to exit on its own.
const TRANSPORT_EXIT_WAIT: Duration = Duration::from_millis(500);

/// Slack on top of the grace period when waiting for the exit watcher.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Budget for the `shutdown` request sent before signalling.
const SHUTDOWN_CALL_CAP: Duration = Duration::from_secs(1);

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub(super) struct Launch<'a> {
    pub(super) descriptor: &'a PluginDescriptor,
    pub(super) settings: &'a SupervisorSettings,
    pub(super) cgroups: &'a CgroupManager,
    pub(super) log_path: PathBuf,
    pub(super) bridge: Arc<ScopedContext>,
    pub(super) listener: Arc<dyn ExitListener>,
}

/// A worker running as a child process.
pub struct ProcessWorker {
    id: u64,
    plugin: PluginName,
    pid: Option<u32>,
    channel: Arc<CallChannel>,
    alive: Arc<AtomicBool>,
    oom: Arc<AtomicBool>,
    cgroup: Option<CgroupHandle>,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
    stop: Mutex<Option<oneshot::Sender<Duration>>>,
    exited: CancellationToken,
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("pid", &self.pid)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("cgroup", &self.cgroup)
            .finish_non_exhaustive()
    }
}

impl ProcessWorker {
    pub(super) fn spawn(launch: Launch<'_>) -> PluginResult<Arc<Self>> {
        let Launch {
            descriptor,
            settings,
            cgroups,
            log_path,
            bridge,
            listener,
        } = launch;
        let plugin = descriptor.name.clone();
        let PluginKind::Process { command, args, env } = &descriptor.kind else {
            return Err(PluginError::load(plugin.as_str(), "not a process plugin"));
        };

        let stderr = open_log(&log_path)?;
        let token = WorkerToken::issue(&plugin, bridge.effective(), Utc::now());
        let cgroup = cgroups.create_group(&plugin)?;

        let mut cmd = build_command(command, args, &descriptor.dir, settings);
        cmd.env_clear();
        cmd.env(
            "PATH",
            std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string()),
        );
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("NEBULA_PLUGIN_NAME", plugin.as_str())
            .env("NEBULA_PLUGIN_API_VERSION", PLUGIN_API_VERSION)
            .env("NEBULA_PLUGIN_MEMORY_MB", settings.memory_limit_mb.to_string())
            .env(
                "NEBULA_PLUGIN_CPU_SECONDS",
                settings.cpu_time_limit_secs.to_string(),
            )
            .env("NEBULA_PLUGIN_LOG_LEVEL", &settings.log_level)
            .env("NEBULA_PLUGIN_TOKEN", token.encode());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(group) = &cgroup {
                    group.cleanup();
                }
                return Err(PluginError::io(command, e));
            },
        };
        let pid = child.id();

        if let (Some(group), Some(pid)) = (&cgroup, pid)
            && let Err(e) = group.assign(pid)
        {
            if cgroups.is_required() {
                // Still in the spawning task; kill_on_drop reaps it.
                let _ = child.start_kill();
                group.cleanup();
                return Err(PluginError::ResourceBackend(e.to_string()));
            }
            warn!(plugin = %plugin, pid, error = %e, "worker not confined to its cgroup");
        }

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(PluginError::transport(&plugin, "worker stdio not captured"));
        };
        let channel = CallChannel::spawn(plugin.clone(), stdout, stdin, bridge);

        let id = next_worker_id();
        let alive = Arc::new(AtomicBool::new(true));
        let oom = Arc::new(AtomicBool::new(false));
        let exited = CancellationToken::new();
        let (stop_tx, stop_rx) = oneshot::channel();

        info!(plugin = %plugin, worker_id = id, pid = ?pid, log = %log_path.display(), "worker spawned");

        tokio::spawn(watch(
            child,
            Watch {
                plugin: plugin.clone(),
                worker_id: id,
                channel: Arc::clone(&channel),
                alive: Arc::clone(&alive),
                oom: Arc::clone(&oom),
                cgroup: cgroup.clone(),
                exited: exited.clone(),
                listener,
            },
            stop_rx,
        ));

        Ok(Arc::new(Self {
            id,
            plugin,
            pid,
            channel,
            alive,
            oom,
            cgroup,
            log_path,
            started_at: Utc::now(),
            stop: Mutex::new(Some(stop_tx)),
            exited,
        }))
    }
}

impl ProcessWorker {
    fn admit(&self, method: &str) -> PluginResult<()> {
        if self.channel.is_cancelled() {
            return Err(PluginError::cancelled(&self.plugin, method));
        }
        if !self.is_alive() {
            return Err(PluginError::transport(&self.plugin, "worker is not running"));
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> u64 {
        self.id
    }

    fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> PluginResult<Value> {
        self.admit(method)?;
        self.channel.call(method, params, timeout).await
    }

    async fn call_dry_run(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        hold: DryRunGuard,
    ) -> PluginResult<Value> {
        self.admit(method)?;
        self.channel.call_dry_run(method, params, timeout, hold).await
    }

    async fn terminate(&self, graceful: bool, grace: Duration) {
        self.channel.cancel_pending();
        if graceful && self.is_alive() {
            let budget = grace.min(SHUTDOWN_CALL_CAP);
            if let Err(e) = self.channel.request_shutdown(budget).await {
                debug!(plugin = %self.plugin, error = %e, "shutdown request not acknowledged");
            }
        }
        let sender = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let grace = if graceful { grace } else { Duration::ZERO };
            let _ = sender.send(grace);
        }
        let bound = grace.saturating_add(KILL_WAIT);
        if tokio::time::timeout(bound, self.exited.cancelled()).await.is_err() {
            warn!(plugin = %self.plugin, worker_id = self.id, "worker did not exit in time");
        }
    }

    async fn exited(&self) {
        self.exited.cancelled().await;
    }

    fn cgroup(&self) -> Option<&CgroupHandle> {
        self.cgroup.as_ref()
    }

    fn log_path(&self) -> Option<&Path> {
        Some(&self.log_path)
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn oom_killed(&self) -> bool {
        self.oom.load(Ordering::SeqCst)
    }
}

fn open_log(path: &Path) -> PluginResult<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| PluginError::io(dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PluginError::io(path, e))
}

/// Process group, working directory and rlimits.
#[allow(unsafe_code)]
fn build_command(
    command: &Path,
    args: &[String],
    dir: &Path,
    settings: &SupervisorSettings,
) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .process_group(0);

    let memory_bytes = settings.memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_secs = settings.cpu_time_limit_secs;
    // SAFETY: pre_exec runs between fork() and exec(). The closure only
    // issues setrlimit syscalls on values computed before the fork and
    // does not allocate.
    unsafe {
        cmd.pre_exec(move || {
            use nix::sys::resource::{Resource, setrlimit};
            setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)
                .map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    cmd
}

struct Watch {
    plugin: PluginName,
    worker_id: u64,
    channel: Arc<CallChannel>,
    alive: Arc<AtomicBool>,
    oom: Arc<AtomicBool>,
    cgroup: Option<CgroupHandle>,
    exited: CancellationToken,
    listener: Arc<dyn ExitListener>,
}

/// Owns the child until it exits, then reports unexpected exits.
async fn watch(mut child: Child, ctx: Watch, mut stop: oneshot::Receiver<Duration>) {
    let oom_before = ctx.cgroup.as_ref().map_or(0, CgroupHandle::oom_kills);

    let (status, expected, transport_broke) = tokio::select! {
        status = child.wait() => (status.ok(), false, false),
        grace = &mut stop => {
            // A dropped sender means the worker handle is gone: kill.
            let grace = grace.unwrap_or(Duration::ZERO);
            ctx.channel.close();
            (stop_child(&mut child, grace).await, true, false)
        },
        () = ctx.channel.closed() => {
            match tokio::time::timeout(TRANSPORT_EXIT_WAIT, child.wait()).await {
                Ok(status) => (status.ok(), false, false),
                Err(_elapsed) => (stop_child(&mut child, Duration::ZERO).await, false, true),
            }
        },
    };

    ctx.alive.store(false, Ordering::SeqCst);
    ctx.channel.close();

    let oom = ctx
        .cgroup
        .as_ref()
        .is_some_and(|group| group.oom_kills() > oom_before);
    if oom {
        ctx.oom.store(true, Ordering::SeqCst);
    }
    if let Some(group) = &ctx.cgroup {
        group.cleanup();
    }
    ctx.exited.cancel();

    if expected {
        info!(plugin = %ctx.plugin, worker_id = ctx.worker_id, status = ?status, "worker stopped");
        return;
    }

    let cause = if oom {
        CrashCause::OutOfMemory
    } else if transport_broke {
        CrashCause::Transport("worker closed its stdio".to_string())
    } else {
        exit_cause(status)
    };
    warn!(plugin = %ctx.plugin, worker_id = ctx.worker_id, cause = %cause, "worker exited unexpectedly");
    ctx.listener
        .worker_exited(WorkerExit {
            plugin: ctx.plugin,
            worker_id: ctx.worker_id,
            cause,
        })
        .await;
}

async fn stop_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if !grace.is_zero() {
        if let Some(pid) = child.id() {
            signal_group(pid, Signal::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status.ok();
        }
    }
    if let Some(pid) = child.id() {
        signal_group(pid, Signal::SIGKILL);
    }
    let _ = child.start_kill();
    child.wait().await.ok()
}

/// The worker leads its own process group.
fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!(pid, ?signal, error = %e, "killpg failed");
    }
}

fn exit_cause(status: Option<ExitStatus>) -> CrashCause {
    use std::os::unix::process::ExitStatusExt;
    CrashCause::Exit {
        code: status.and_then(|s| s.code()),
        signal: status.and_then(|s| s.signal()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AllowList, InMemoryDirectory};
    use crate::cgroup::CgroupSettings;
    use crate::supervisor::tests::settings;
    use nebula_core::ScopeSet;
    use nebula_events::EventBus;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Exits(std::sync::Mutex<Vec<WorkerExit>>);

    #[async_trait]
    impl ExitListener for Exits {
        async fn worker_exited(&self, exit: WorkerExit) {
            self.0.lock().unwrap().push(exit);
        }
    }

    fn shell(dir: &Path, script: &str) -> PluginDescriptor {
        PluginDescriptor {
            name: PluginName::new("shell").unwrap(),
            version: semver::Version::new(0, 1, 0),
            api_version: "v1".into(),
            description: String::new(),
            scopes: ScopeSet::new(),
            kind: PluginKind::Process {
                command: PathBuf::from("/bin/sh"),
                args: vec!["-c".into(), script.into()],
                env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            },
            dir: dir.to_path_buf(),
            warning: None,
        }
    }

    fn spawn(dir: &Path, script: &str, listener: Arc<Exits>) -> Arc<ProcessWorker> {
        let descriptor = shell(dir, script);
        let cgroups = CgroupManager::initialize(CgroupSettings::disabled()).unwrap();
        let bridge = Arc::new(ScopedContext::new(
            descriptor.name.clone(),
            &ScopeSet::new(),
            Arc::new(AllowList::new(ScopeSet::all())),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(EventBus::new()),
        ));
        ProcessWorker::spawn(Launch {
            descriptor: &descriptor,
            settings: &settings(dir),
            cgroups: &cgroups,
            log_path: dir.join("logs").join("shell.log"),
            bridge,
            listener,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exits = Arc::new(Exits::default());
        let worker = spawn(dir.path(), "exit 7", Arc::clone(&exits));
        tokio::time::timeout(Duration::from_secs(5), worker.exited())
            .await
            .unwrap();
        assert!(!worker.is_alive());

        // The listener runs right after the token is cancelled.
        for _ in 0..50 {
            if !exits.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let exits = exits.0.lock().unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].worker_id, worker.id());
        assert!(matches!(
            exits[0].cause,
            CrashCause::Exit { code: Some(7), .. } | CrashCause::Transport(_)
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_not_reported_as_crash() {
        let dir = tempfile::tempdir().unwrap();
        let exits = Arc::new(Exits::default());
        let worker = spawn(dir.path(), "sleep 30", Arc::clone(&exits));
        assert!(worker.is_alive());
        assert!(worker.pid().is_some());

        worker.terminate(true, Duration::from_millis(300)).await;
        assert!(!worker.is_alive());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(exits.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stderr_goes_to_log_file_with_clean_env() {
        let dir = tempfile::tempdir().unwrap();
        let exits = Arc::new(Exits::default());
        let worker = spawn(
            dir.path(),
            "echo \"$GREETING $NEBULA_PLUGIN_NAME $NEBULA_PLUGIN_API_VERSION ${HOME:-nohome}\" >&2",
            exits,
        );
        tokio::time::timeout(Duration::from_secs(5), worker.exited())
            .await
            .unwrap();
        let log = std::fs::read_to_string(worker.log_path().unwrap()).unwrap();
        assert_eq!(log.trim(), "hi shell v1 nohome");
    }

    #[test]
    fn test_exit_cause_from_status() {
        use std::os::unix::process::ExitStatusExt;
        let cause = exit_cause(Some(ExitStatus::from_raw(9)));
        assert_eq!(
            cause,
            CrashCause::Exit {
                code: None,
                signal: Some(9)
            }
        );
        assert_eq!(exit_cause(None).to_string(), "exited");
    }
}
