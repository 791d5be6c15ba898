//! Terminal styling for command output.

use colored::{ColoredString, Colorize};
use nebula_plugins::PluginStatus;

/// Output styles.
pub(crate) struct Theme;

fn tagged(tag: ColoredString, text: &str) -> String {
    format!("{tag} {text}")
}

impl Theme {
    /// Section title.
    pub(crate) fn header(text: &str) -> String {
        text.bold().underline().to_string()
    }

    pub(crate) fn success(text: &str) -> String {
        tagged("ok".green().bold(), text)
    }

    pub(crate) fn error(text: &str) -> String {
        tagged("error".red().bold(), text)
    }

    pub(crate) fn warning(text: &str) -> String {
        tagged("warn".yellow().bold(), text)
    }

    pub(crate) fn info(text: &str) -> String {
        tagged("::".blue().bold(), text)
    }

    pub(crate) fn dimmed(text: &str) -> String {
        text.dimmed().to_string()
    }

    pub(crate) fn separator() -> String {
        "─".repeat(60).dimmed().to_string()
    }

    /// Indented `key: value` line.
    pub(crate) fn kv(key: &str, value: &str) -> String {
        format!("  {:<16} {value}", format!("{key}:").bold())
    }

    /// Lifecycle status, coloured by severity.
    pub(crate) fn status(status: PluginStatus) -> String {
        let label = status.as_str();
        match status {
            PluginStatus::Healthy => label.green().to_string(),
            PluginStatus::Initialized => label.cyan().to_string(),
            PluginStatus::Degraded | PluginStatus::Unresponsive => label.yellow().to_string(),
            PluginStatus::Crashed | PluginStatus::Disabled => label.red().bold().to_string(),
            PluginStatus::Stopped => label.dimmed().to_string(),
        }
    }

    pub(crate) fn timestamp(dt: &chrono::DateTime<chrono::Utc>) -> String {
        dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .dimmed()
            .to_string()
    }
}
