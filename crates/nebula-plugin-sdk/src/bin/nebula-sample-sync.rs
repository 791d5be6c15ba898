//! Worker binary for the bundled `sample_sync` plugin.

use std::process::ExitCode;
use std::sync::Arc;

use nebula_plugin_sdk::{SampleSync, run};

fn main() -> ExitCode {
    run(Arc::new(SampleSync::new()))
}
