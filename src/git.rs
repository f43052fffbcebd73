//! Thin wrappers around the `git` CLI used by the snapshot builder.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::cmd::Cmd;

fn git() -> Cmd {
    // Never block on a credential prompt when running unattended.
    Cmd::new("git").env("GIT_TERMINAL_PROMPT", "0")
}

/// Clone `url` into `dest`, which must be absent or an empty directory.
pub fn clone_repository(url: &str, dest: &Path) -> Result<()> {
    info!(url, dest = %dest.display(), "git:clone");
    git()
        .args(&["clone", "--quiet", "--no-checkout"])
        .arg(url)
        .arg(dest)
        .run()
        .context("Failed to clone snapshot repository")?;
    Ok(())
}

/// List every tag in the repository.
pub fn list_tags(repo: &Path) -> Result<Vec<String>> {
    let raw = git()
        .workdir(repo)
        .args(&["tag", "--list"])
        .run_and_capture_stdout()
        .context("Failed to list repository tags")?;

    let tags: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    debug!(count = tags.len(), "git:tags listed");
    Ok(tags)
}

/// Hard-reset the working tree to `tag` and drop every untracked file, so
/// nothing from a previously checked-out tag survives.
pub fn reset_to_tag(repo: &Path, tag: &str) -> Result<()> {
    let target = format!("refs/tags/{tag}^{{commit}}");
    git()
        .workdir(repo)
        .args(&["reset", "--hard", "--quiet"])
        .arg(&target)
        .run()
        .with_context(|| format!("Failed to reset working tree to tag {tag}"))?;
    git()
        .workdir(repo)
        .args(&["clean", "-fdxq"])
        .run()
        .with_context(|| format!("Failed to clean working tree for tag {tag}"))?;
    Ok(())
}
