//! Packaging of a finished job: plain stdout, or a zip of stdout plus every
//! file the interpreter left in its workspace.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::JobOutput;

/// Name of the archive entry holding the interpreter's stdout.
pub const OUTPUT_ENTRY: &str = "OUTPUT";

/// Collect the regular files under `workspace` in lexicographic walk order.
fn workspace_files(workspace: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(workspace).min_depth(1).sort_by_file_name() {
        let entry = entry.context("Failed to walk job workspace")?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Pick a unique entry name: the base name, else the workspace-relative path,
/// else the relative path with a numeric suffix.
fn entry_name(workspace: &Path, path: &Path, used: &mut HashSet<String>) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let relative = path
        .strip_prefix(workspace)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();

    let mut name = base;
    if used.contains(&name) {
        name = relative.clone();
    }
    let mut n = 1;
    while used.contains(&name) {
        name = format!("{relative}.{n}");
        n += 1;
    }
    used.insert(name.clone());
    name
}

pub fn package(workspace: &Path, stdout: Vec<u8>) -> Result<JobOutput> {
    let files = workspace_files(workspace)?;
    if files.is_empty() {
        return Ok(JobOutput::Text(stdout));
    }

    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(OUTPUT_ENTRY, options)?;
    zip.write_all(&stdout)?;

    let mut used = HashSet::from([OUTPUT_ENTRY.to_string()]);
    for path in &files {
        let name = entry_name(workspace, path, &mut used);
        zip.start_file(name, options)?;
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open generated file {}", path.display()))?;
        io::copy(&mut file, &mut zip)?;
    }

    let archive = zip.finish()?.into_inner();
    Ok(JobOutput::Archive(archive))
}
