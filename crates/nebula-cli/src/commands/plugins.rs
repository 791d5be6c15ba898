//! Plugin runtime commands.
//!
//! Every command except `scan` starts a full manager, does its work and
//! shuts the manager down again, so one-shot commands see freshly activated
//! workers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nebula_events::EventBus;
use nebula_plugins::{
    HostServices, InMemoryDirectory, InvokeOptions, ManagerConfig, PluginError, PluginInfo,
    PluginManager, PluginStats, RescanReport, loader,
};
use serde_json::Value;
use tracing::{info, warn};

use super::OutputFormat;
use crate::config_bridge;
use crate::theme::Theme;

/// Start a manager with the built-in factories and an in-memory directory.
async fn start(config: ManagerConfig) -> Result<(PluginManager, Arc<EventBus>)> {
    let events = Arc::new(EventBus::new());
    let directory = InMemoryDirectory::new()
        .with_role("admin", "Administrators", true)
        .with_role("user", "Default role", false);
    let services = HostServices {
        directory: Arc::new(directory),
        events: events.clone(),
        registry: config_bridge::builtin_registry(),
    };
    let manager = PluginManager::start(config, services)
        .await
        .context("failed to start plugin manager")?;
    Ok((manager, events))
}

/// Run a one-shot operation against a started manager, always shutting down.
async fn with_manager<T, F, Fut>(config: ManagerConfig, op: F) -> Result<T>
where
    F: FnOnce(PluginManager) -> Fut,
    Fut: Future<Output = (PluginManager, Result<T>)>,
{
    let (manager, _events) = start(config).await?;
    let (manager, result) = op(manager).await;
    manager.shutdown().await;
    result
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn plugin_failure(e: &PluginError) -> anyhow::Error {
    anyhow::anyhow!("{} ({})", e, e.code())
}

/// `run`: serve until Ctrl-C. SIGHUP rescans the plugin directory.
pub(crate) async fn run(config: ManagerConfig) -> Result<()> {
    let (manager, events) = start(config).await?;
    print_table(&manager.list());
    for rejection in manager.rejections() {
        println!(
            "{}",
            Theme::warning(&format!("rejected {}: {}", rejection.name, rejection.reason))
        );
    }

    let mut receiver = events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            info!(event = %event.name, plugin = %event.plugin, payload = %event.payload, "plugin event");
        }
    });

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("failed to install SIGHUP handler")?;
    println!("{}", Theme::info("Plugin manager running. Press Ctrl-C to stop."));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            },
            _ = hangup.recv() => match manager.rescan().await {
                Ok(report) => print_report(&report),
                Err(e) => warn!(error = %e, "rescan failed"),
            },
        }
    }

    println!("{}", Theme::info("Shutting down..."));
    manager.shutdown().await;
    event_log.abort();
    println!("{}", Theme::success("Plugin manager stopped"));
    Ok(())
}

/// `scan [DIR]`: load manifests without starting anything.
pub(crate) fn scan(config: &ManagerConfig, dir: Option<&Path>, format: OutputFormat) -> Result<()> {
    let registry = config_bridge::builtin_registry();
    let policy = config_bridge::loader_policy(config, &registry);
    let dir = config_bridge::scan_dir(config, dir);
    let outcome = loader::scan(dir, &policy);

    if format == OutputFormat::Json {
        let valid: Vec<Value> = outcome
            .valid
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name.as_str(),
                    "version": d.version.to_string(),
                    "source": d.source(),
                    "scopes": d.scopes.to_strings(),
                    "warning": d.warning,
                })
            })
            .collect();
        return print_json(&serde_json::json!({ "valid": valid, "rejected": outcome.rejected }));
    }

    println!("{}", Theme::header(&format!("Plugins in {}", dir.display())));
    println!("{}", Theme::separator());
    if outcome.valid.is_empty() && outcome.rejected.is_empty() {
        println!("{}", Theme::dimmed("No plugins found."));
    }
    for descriptor in &outcome.valid {
        println!(
            "{} {} {}",
            Theme::success(descriptor.name.as_str()),
            Theme::dimmed(&format!("v{} [{}]", descriptor.version, descriptor.source())),
            descriptor.scopes.to_strings().join(", ")
        );
        if let Some(warning) = &descriptor.warning {
            println!("  {}", Theme::warning(warning));
        }
    }
    for rejection in &outcome.rejected {
        println!(
            "{} {}",
            Theme::error(&rejection.name),
            Theme::dimmed(&rejection.reason)
        );
    }
    Ok(())
}

/// `list`.
pub(crate) async fn list(config: ManagerConfig, format: OutputFormat) -> Result<()> {
    with_manager(config, |manager| async move {
        let rows = manager.list();
        let result = if format == OutputFormat::Json {
            print_json(&rows)
        } else {
            print_table(&rows);
            Ok(())
        };
        (manager, result)
    })
    .await
}

/// `health NAME`.
pub(crate) async fn health(config: ManagerConfig, name: String, format: OutputFormat) -> Result<()> {
    with_manager(config, |manager| async move {
        let result = match manager.health(&name).await {
            Ok(reply) if format == OutputFormat::Json => print_json(&reply),
            Ok(reply) => {
                println!("{}", Theme::success(&format!("{name} is healthy")));
                println!("{}", Theme::dimmed(&reply.to_string()));
                Ok(())
            },
            Err(e) => Err(plugin_failure(&e)),
        };
        (manager, result)
    })
    .await
}

/// Arguments of `invoke`.
pub(crate) struct InvokeArgs {
    pub(crate) name: String,
    pub(crate) method: String,
    pub(crate) payload: Option<String>,
    pub(crate) dry_run: bool,
    pub(crate) limit: Option<u64>,
    pub(crate) timeout: Option<f64>,
}

/// `invoke NAME METHOD`.
pub(crate) async fn invoke(config: ManagerConfig, args: InvokeArgs) -> Result<()> {
    let payload: Value = match args.payload.as_deref() {
        Some(raw) => serde_json::from_str(raw).context("--payload is not valid JSON")?,
        None => Value::Object(serde_json::Map::new()),
    };
    let timeout = match args.timeout {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("--timeout {secs} is not a valid duration"))?,
        ),
        None => None,
    };
    let options = InvokeOptions {
        dry_run: args.dry_run,
        limit: args.limit,
        timeout,
    };

    with_manager(config, |manager| async move {
        let result = match manager
            .invoke(&args.name, &args.method, payload, options)
            .await
        {
            Ok(reply) => print_json(&reply),
            Err(e) => {
                eprintln!("{}", Theme::error(&format!("{} failed", args.method)));
                let _ = print_json(&e.to_json());
                Err(plugin_failure(&e))
            },
        };
        (manager, result)
    })
    .await
}

/// `logs NAME --tail N`.
pub(crate) async fn logs(config: ManagerConfig, name: String, tail: Option<usize>) -> Result<()> {
    with_manager(config, |manager| async move {
        let result = match manager.logs(&name, tail).await {
            Ok(lines) if lines.is_empty() => {
                println!("{}", Theme::dimmed("(no log output)"));
                Ok(())
            },
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                Ok(())
            },
            Err(e) => Err(plugin_failure(&e)),
        };
        (manager, result)
    })
    .await
}

/// `stats NAME`.
pub(crate) async fn stats(config: ManagerConfig, name: String, format: OutputFormat) -> Result<()> {
    with_manager(config, |manager| async move {
        let result = match manager.stats(&name).await {
            Ok(stats) if format == OutputFormat::Json => print_json(&stats),
            Ok(stats) => {
                print_stats(&stats);
                Ok(())
            },
            Err(e) => Err(plugin_failure(&e)),
        };
        (manager, result)
    })
    .await
}

fn print_table(rows: &[PluginInfo]) {
    println!("{}", Theme::header("Plugins"));
    println!("{}", Theme::separator());
    if rows.is_empty() {
        println!("{}", Theme::dimmed("No plugins loaded."));
        return;
    }
    for row in rows {
        println!(
            "{:<24} {:<10} {:<14} {}",
            row.name,
            row.source,
            Theme::status(row.status),
            Theme::dimmed(&format!("v{} {}", row.version, row.message))
        );
        if let Some(since) = &row.initialized_at {
            println!("  {} {}", Theme::dimmed("up since"), Theme::timestamp(since));
        }
        if let Some(warning) = &row.warning {
            println!("  {}", Theme::warning(warning));
        }
        if let Some(error) = &row.error {
            println!("  {}", Theme::error(error));
        }
    }
}

fn print_stats(stats: &PluginStats) {
    let opt = |value: Option<u64>| value.map_or_else(|| "-".to_string(), |v| v.to_string());

    println!("{}", Theme::header(&stats.name));
    println!("{}", Theme::separator());
    println!("{}", Theme::kv("status", &Theme::status(stats.status)));
    println!("{}", Theme::kv("source", stats.source));
    println!("{}", Theme::kv("worker", &opt(stats.worker_id)));
    println!("{}", Theme::kv("pid", &opt(stats.pid.map(u64::from))));
    println!("{}", Theme::kv("alive", &stats.alive.to_string()));
    println!("{}", Theme::kv("rss (KiB)", &opt(stats.memory_rss_kb)));
    println!("{}", Theme::kv("virtual (KiB)", &opt(stats.memory_virtual_kb)));
    println!(
        "{}",
        Theme::kv("uptime (s)", &stats.uptime_secs.map_or_else(|| "-".to_string(), |s| s.to_string()))
    );
    println!("{}", Theme::kv("restarts", &stats.restart_count.to_string()));
    if let Some(path) = &stats.cgroup_path {
        println!("{}", Theme::kv("cgroup", &path.display().to_string()));
        println!("{}", Theme::kv("memory.current", &opt(stats.cgroup_memory_current)));
        for (key, value) in &stats.cgroup_memory_events {
            println!("{}", Theme::kv(&format!("memory.events.{key}"), &value.to_string()));
        }
    }
    if stats.oom_killed {
        println!("{}", Theme::error("worker was OOM-killed"));
    }
    println!("{}", Theme::kv("log", &stats.log_path.display().to_string()));
}

fn print_report(report: &RescanReport) {
    println!("{}", Theme::header("Rescan"));
    let groups = [
        ("added", &report.added),
        ("removed", &report.removed),
        ("restarted", &report.restarted),
        ("reactivated", &report.reactivated),
        ("unchanged", &report.unchanged),
    ];
    for (label, names) in groups {
        if !names.is_empty() {
            println!("{}", Theme::kv(label, &names.join(", ")));
        }
    }
    for rejection in &report.rejected {
        println!(
            "{}",
            Theme::warning(&format!("rejected {}: {}", rejection.name, rejection.reason))
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(scan: &Path, name: &str, body: &str) {
        let dir = scan.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.toml"), body).unwrap();
    }

    fn config(root: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::new(root.join("plugins"));
        config.log_dir = root.join("logs");
        config.health_interval = Duration::from_secs(3600);
        config.shutdown_grace = Duration::from_millis(200);
        config
    }

    const SAMPLE: &str = "version = \"0.2.0\"\nscopes = [\"users.read\", \"users.write\", \"identity_tags.write\", \"roles.write\"]\n\n[entry]\ntype = \"in_process\"\nfactory = \"sample_sync\"\n";

    #[test]
    fn test_scan_reports_valid_and_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let scan_path = dir.path().join("plugins");
        write_manifest(&scan_path, "sample_sync", SAMPLE);
        write_manifest(&scan_path, "broken", "[entry]\ntype = \"in_process\"\nfactory = \"nope\"\n");

        scan(&config(dir.path()), None, OutputFormat::Json).unwrap();
        scan(&config(dir.path()), Some(&scan_path), OutputFormat::Pretty).unwrap();
    }

    #[tokio::test]
    async fn test_invoke_builtin_sample_sync() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("plugins"), "sample_sync", SAMPLE);

        invoke(config(dir.path()), InvokeArgs {
            name: "sample_sync".into(),
            method: "sync_users".into(),
            payload: Some(r#"{"users": [{"username": "carol"}]}"#.into()),
            dry_run: false,
            limit: Some(5),
            timeout: Some(2.0),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_invoke_rejects_bad_payload_before_starting() {
        let dir = tempfile::tempdir().unwrap();
        let err = invoke(config(dir.path()), InvokeArgs {
            name: "sample_sync".into(),
            method: "sync_users".into(),
            payload: Some("{not json".into()),
            dry_run: true,
            limit: None,
            timeout: None,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--payload"));
    }

    #[tokio::test]
    async fn test_unknown_plugin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = health(config(dir.path()), "ghost".into(), OutputFormat::Pretty)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not_found"), "{err}");
        assert!(stats(config(dir.path()), "ghost".into(), OutputFormat::Json)
            .await
            .is_err());
    }
}
