use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::config::Config;
use crate::job::{JobOutput, JobRequest};

/// Execute one script file against a snapshot and write the result.
pub fn run(
    config: &Config,
    file: &Path,
    version: Option<String>,
    timeout_ms: Option<u64>,
    plot_url_base: Option<String>,
    output: Option<&Path>,
) -> Result<()> {
    let input = fs::read_to_string(file)
        .with_context(|| format!("Failed to read script at {}", file.display()))?;

    let runner = super::job_runner(config)?;
    let request = JobRequest {
        input,
        timeout: timeout_ms.map(Duration::from_millis),
        plot_url_base,
        version,
    };
    let result = runner.create_job(&request)?;

    if let Some(path) = output {
        fs::write(path, result.into_bytes())
            .with_context(|| format!("Failed to write output to {}", path.display()))?;
        return Ok(());
    }
    if let JobOutput::Archive(_) = result
        && io::stdout().is_terminal()
    {
        bail!("The script produced files; pass --output to save the zip archive");
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(&result.into_bytes())?;
    stdout.flush()?;
    Ok(())
}
