//! `config show`.

use anyhow::{Result, anyhow};
use nebula_config::{ResolvedConfig, ShowFormat};

use super::OutputFormat;

/// Print the resolved configuration.
pub(crate) fn show(resolved: &ResolvedConfig, format: OutputFormat) -> Result<()> {
    let format = match format {
        OutputFormat::Pretty => ShowFormat::Toml,
        OutputFormat::Json => ShowFormat::Json,
    };
    let rendered = resolved
        .render(format)
        .map_err(|e| anyhow!("failed to render configuration: {e}"))?;
    println!("{rendered}");
    Ok(())
}
