use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use nix::fcntl::{Flock, FlockArg};
use pep440_rs::{Version, VersionSpecifiers};
use tracing::{debug, info, warn};

use super::{SnapshotRegistry, SnapshotVersion};
use crate::git;
use crate::sandbox::{Sandbox, Workspace};

/// Site customisation appended to every snapshot's build script.
const MAXIMA_LOCAL: &str = include_str!("maximalocal.mac");

/// Advisory lock held for the whole build, relative to the workspace root.
const LOCK_FILE: &str = "maxima-pool-build.lock";

/// Where the version marker lives inside a STACK checkout.
const MARKER_FILE: [&str; 3] = ["stack", "maxima", "stackmaxima.mac"];

/// Inputs of one build cycle.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Upstream STACK repository (anything `git clone` accepts).
    pub repository: String,
    /// Oldest release to build; `None` builds every versioned tag.
    pub min_version: Option<String>,
    /// Maxima executable used to produce the images.
    pub command: String,
    /// Deadline for a single image build.
    pub timeout: Duration,
}

/// Why a tag produced no snapshot without counting as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotAVersion,
    MarkerNotFound,
    DuplicateVersion(SnapshotVersion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSkip {
    pub tag: String,
    pub reason: SkipReason,
}

#[derive(Debug)]
pub struct TagFailure {
    pub tag: String,
    pub error: anyhow::Error,
}

/// What happened to a single tag that did not fail.
#[derive(Debug)]
enum TagOutcome {
    Built(SnapshotVersion),
    MarkerNotFound,
    Duplicate(SnapshotVersion),
}

/// Outcome of a build cycle. Every entry of `built` has been persisted.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<SnapshotVersion>,
    pub skipped: Vec<TagSkip>,
    pub failed: Vec<TagFailure>,
}

/// Turns tagged STACK releases into standalone Maxima images.
///
/// A build is destructive: it wipes the artifact directory, rebuilds every
/// qualifying tag and rewrites the registry. It must not run while jobs are
/// being served from the same storage.
pub struct SnapshotBuilder {
    registry: Arc<SnapshotRegistry>,
    sandbox: Sandbox,
    settings: BuildSettings,
}

impl SnapshotBuilder {
    pub fn new(registry: Arc<SnapshotRegistry>, sandbox: Sandbox, settings: BuildSettings) -> Self {
        Self {
            registry,
            sandbox,
            settings,
        }
    }

    /// Run a full build cycle.
    ///
    /// Failures before the first tag is processed abort the cycle and nothing
    /// is persisted. A failing tag is recorded in the report and the cycle
    /// carries on; whatever was built is persisted at the end.
    pub fn build(&self) -> Result<BuildReport> {
        let _lock = acquire_lock(self.sandbox.workspace_root())?;

        let constraint = parse_constraint(self.settings.min_version.as_deref())?;

        clear_artifacts(self.registry.data_dir())?;
        self.registry.reset();

        let mut checkout = Workspace::create(self.sandbox.workspace_root(), None)
            .context("Failed to create checkout workspace")?;
        git::clone_repository(&self.settings.repository, checkout.path())?;

        let tags = git::list_tags(checkout.path())?;
        let mut report = BuildReport::default();
        let candidates = select_tags(tags, constraint.as_ref(), &mut report.skipped);
        info!(
            candidates = candidates.len(),
            min_version = ?self.settings.min_version,
            "snapshot:build start"
        );

        for tag in candidates {
            match self.build_tag(checkout.path(), &tag) {
                Ok(TagOutcome::Built(version)) if self.registry.append(version.clone()) => {
                    info!(%tag, %version, "snapshot:built");
                    report.built.push(version);
                }
                Ok(TagOutcome::Built(version) | TagOutcome::Duplicate(version)) => {
                    debug!(%tag, %version, "snapshot:duplicate version");
                    report.skipped.push(TagSkip {
                        tag,
                        reason: SkipReason::DuplicateVersion(version),
                    });
                }
                Ok(TagOutcome::MarkerNotFound) => {
                    warn!(%tag, "snapshot:marker not found, skipping tag");
                    report.skipped.push(TagSkip {
                        tag,
                        reason: SkipReason::MarkerNotFound,
                    });
                }
                Err(error) => {
                    warn!(%tag, error = format!("{error:#}"), "snapshot:tag failed");
                    report.failed.push(TagFailure { tag, error });
                }
            }
        }

        self.registry
            .store()
            .context("Failed to persist snapshot registry")?;

        if let Err(e) = checkout.cleanup() {
            warn!(error = %e, "snapshot:checkout cleanup failed");
        }

        info!(
            built = report.built.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "snapshot:build finished"
        );
        Ok(report)
    }

    /// Build the image for one tag.
    ///
    /// The image is written under a temporary name and only renamed into
    /// place once Maxima succeeds, so a failed build never touches an image
    /// that is already registered.
    fn build_tag(&self, checkout: &Path, tag: &str) -> Result<TagOutcome> {
        git::reset_to_tag(checkout, tag)?;

        let marker_path: PathBuf = MARKER_FILE.iter().fold(checkout.to_path_buf(), |p, c| p.join(c));
        let source = match fs::read_to_string(&marker_path) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TagOutcome::MarkerNotFound),
            Err(e) => return Err(e).context("Failed to read version marker"),
        };
        let Some(version) = SnapshotVersion::from_marker(&source) else {
            return Ok(TagOutcome::MarkerNotFound);
        };
        if self.registry.versions().contains(&version) {
            return Ok(TagOutcome::Duplicate(version));
        }

        let artifact = self.registry.artifact_path(&version);
        let partial = partial_path(&artifact);
        let script = build_script(checkout, &partial);
        debug!(%tag, %version, "snapshot:compiling image");

        let built = self.compile(&script, &version, &partial).and_then(|()| {
            fs::rename(&partial, &artifact)
                .with_context(|| format!("Failed to move image into place for {version}"))
        });
        if let Err(error) = built {
            match fs::remove_file(&partial) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(%tag, error = %e, "snapshot:partial image cleanup failed"),
            }
            return Err(error);
        }
        Ok(TagOutcome::Built(version))
    }

    /// Run Maxima on `script`, which must dump its image to `image`.
    fn compile(&self, script: &str, version: &SnapshotVersion, image: &Path) -> Result<()> {
        let mut execution = self
            .sandbox
            .run(
                self.settings.timeout,
                b"",
                &self.settings.command,
                &["--quiet", "--batch-string", script],
            )
            .with_context(|| format!("Maxima build for {version} failed"))?;
        if let Err(e) = execution.workspace.cleanup() {
            warn!(%version, error = %e, "snapshot:build workspace cleanup failed");
        }

        if !image.is_file() {
            bail!("Maxima finished but no image was written for {version}");
        }
        Ok(())
    }
}

fn acquire_lock(root: &Path) -> Result<Flock<File>> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open build lock {}", path.display()))?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock)
        .map_err(|(_, errno)| anyhow!("Another snapshot build is running ({errno})"))
}

fn parse_constraint(min_version: Option<&str>) -> Result<Option<VersionSpecifiers>> {
    let Some(min) = min_version.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(None);
    };
    let spec = format!(">={}", strip_tag_prefix(min));
    VersionSpecifiers::from_str(&spec)
        .map(Some)
        .map_err(|e| anyhow!("Invalid minimum version '{min}': {e}"))
}

fn strip_tag_prefix(tag: &str) -> &str {
    tag.strip_prefix(['v', 'V']).unwrap_or(tag)
}

/// Keep the tags that parse as versions and satisfy `constraint`, oldest
/// first, so the last snapshot built is the newest release.
fn select_tags(
    tags: Vec<String>,
    constraint: Option<&VersionSpecifiers>,
    skipped: &mut Vec<TagSkip>,
) -> Vec<String> {
    let mut versioned: Vec<(Version, String)> = Vec::new();
    for tag in tags {
        match Version::from_str(strip_tag_prefix(&tag)) {
            Ok(version) => {
                if constraint.is_none_or(|c| c.contains(&version)) {
                    versioned.push((version, tag));
                } else {
                    debug!(%tag, "snapshot:tag below minimum version");
                }
            }
            Err(_) => skipped.push(TagSkip {
                tag,
                reason: SkipReason::NotAVersion,
            }),
        }
    }
    versioned.sort_by(|a, b| a.0.cmp(&b.0));
    versioned.into_iter().map(|(_, tag)| tag).collect()
}

/// Remove every entry of the artifact directory, creating it if needed.
fn clear_artifacts(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create artifact directory {}", data_dir.display()))?;
    for entry in fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read artifact directory {}", data_dir.display()))?
    {
        let path = entry?.path();
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.with_context(|| format!("Failed to remove old artifact {}", path.display()))?;
    }
    debug!(dir = %data_dir.display(), "snapshot:artifacts cleared");
    Ok(())
}

/// Temporary name an image is dumped to before it is moved to `artifact`.
fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    artifact.with_file_name(name)
}

/// Maxima batch input that loads the checkout's libraries and dumps an
/// executable image to `artifact`.
fn build_script(checkout: &Path, artifact: &Path) -> String {
    let lib = checkout.join("stack").join("maxima");
    format!(
        "file_search_maxima:append([sconcat(\"{mac}\")],file_search_maxima)$\
         file_search_lisp:append([sconcat(\"{lisp}\")],file_search_lisp)$\
         {local}\
         :lisp (sb-ext:save-lisp-and-die \"{artifact}\" :toplevel #'run :executable t)",
        mac = lib.join("###.{mac,mc}").display(),
        lisp = lib.join("###.{lisp}").display(),
        local = MAXIMA_LOCAL,
        artifact = artifact.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{commit_and_tag, init};
    use std::os::unix::fs::PermissionsExt;

    /// Stand-in for `maxima --quiet --batch-string <script>` that writes a tiny
    /// executable where the real one would dump its image.
    const FAKE_MAXIMA: &str = r#"#!/bin/sh
[ "$1" = "--quiet" ] && [ "$2" = "--batch-string" ] || exit 2
case "$3" in *file_search_maxima*file_search_lisp*) ;; *) exit 3 ;; esac
out=$(printf '%s\n' "$3" | sed -n 's/.*save-lisp-and-die "\([^"]*\)".*/\1/p')
echo "$out" >> "$(dirname "$0")/calls"
printf 'half-written image' > "$out"
case "$out" in *9999999999*|*/fails/*) echo "heap exhausted" >&2; exit 1 ;; esac
printf '#!/bin/sh\ncat\n' > "$out"
chmod 755 "$out"
"#;

    struct Fixture {
        upstream: tempfile::TempDir,
        data: tempfile::TempDir,
        work: tempfile::TempDir,
        tools: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                upstream: tempfile::tempdir().unwrap(),
                data: tempfile::tempdir().unwrap(),
                work: tempfile::tempdir().unwrap(),
                tools: tempfile::tempdir().unwrap(),
            };
            init(fixture.upstream.path());
            let maxima = fixture.tools.path().join("maxima");
            fs::write(&maxima, FAKE_MAXIMA).unwrap();
            fs::set_permissions(&maxima, fs::Permissions::from_mode(0o755)).unwrap();
            fixture
        }

        fn release(&self, tag: &str, marker: Option<&str>) {
            let content = match marker {
                Some(id) => format!("/* STACK */\nstackmaximaversion:{id}$\n"),
                None => "/* no marker in this release */\n".to_string(),
            };
            commit_and_tag(
                self.upstream.path(),
                "stack/maxima/stackmaxima.mac",
                &content,
                tag,
            );
        }

        fn builder(&self, min_version: Option<&str>) -> (SnapshotBuilder, Arc<SnapshotRegistry>) {
            let registry = Arc::new(SnapshotRegistry::new(self.data.path()));
            let settings = BuildSettings {
                repository: self.upstream.path().to_string_lossy().into_owned(),
                min_version: min_version.map(String::from),
                command: self.tools.path().join("maxima").to_string_lossy().into_owned(),
                timeout: Duration::from_secs(30),
            };
            let builder = SnapshotBuilder::new(
                Arc::clone(&registry),
                Sandbox::new(self.work.path(), None),
                settings,
            );
            (builder, registry)
        }
    }

    #[test]
    fn builds_only_qualifying_tags_with_markers() {
        let fx = Fixture::new();
        fx.release("v3.0.0", Some("2019010100"));
        fx.release("v4.4.0", Some("2023010100"));
        fx.release("not-a-release", Some("2018010100"));
        fx.release("v4.4.1", None);
        fx.release("v4.3.0", Some("2022010100"));

        let (builder, registry) = fx.builder(Some("4.0"));
        let report = builder.build().unwrap();

        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(
            report.built,
            vec![
                SnapshotVersion::new("2022010100"),
                SnapshotVersion::new("2023010100")
            ]
        );
        assert!(report.skipped.contains(&TagSkip {
            tag: "v4.4.1".to_string(),
            reason: SkipReason::MarkerNotFound,
        }));
        assert!(report.skipped.contains(&TagSkip {
            tag: "not-a-release".to_string(),
            reason: SkipReason::NotAVersion,
        }));

        // The persisted record matches, and every id is a 10-digit marker.
        let reloaded = SnapshotRegistry::new(fx.data.path());
        let versions = reloaded.versions();
        assert_eq!(versions, registry.versions());
        assert_eq!(versions.len(), 2);
        for version in &versions {
            assert_eq!(version.as_str().len(), 10);
            assert!(version.as_str().bytes().all(|b| b.is_ascii_digit()));
            assert!(reloaded.artifact_path(version).is_file());
        }
        assert_eq!(reloaded.resolve("").unwrap().as_str(), "2023010100");

        // Only the build lock remains in the workspace root.
        let leftovers: Vec<_> = fs::read_dir(fx.work.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec![LOCK_FILE.to_string()]);
    }

    #[test]
    fn failing_tag_does_not_abort_the_cycle() {
        let fx = Fixture::new();
        fx.release("v4.4.0", Some("2023010100"));
        fx.release("v5.0.0", Some("9999999999"));
        fx.release("v5.1.0", Some("2024060100"));

        let (builder, _) = fx.builder(None);
        let report = builder.build().unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].tag, "v5.0.0");
        assert_eq!(
            report.built,
            vec![
                SnapshotVersion::new("2023010100"),
                SnapshotVersion::new("2024060100")
            ]
        );
        assert_eq!(SnapshotRegistry::new(fx.data.path()).versions(), report.built);

        // Nothing of the failed image is left behind.
        let names: Vec<_> = fs::read_dir(fx.data.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.contains("9999999999")), "{names:?}");
    }

    #[test]
    fn duplicate_marker_keeps_registered_image() {
        let fx = Fixture::new();
        fx.release("v4.4.0", Some("2023010100"));
        fx.release("v4.4.1", Some("2023010100"));

        let (builder, registry) = fx.builder(None);
        let report = builder.build().unwrap();

        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.built, vec![SnapshotVersion::new("2023010100")]);
        assert_eq!(
            report.skipped,
            vec![TagSkip {
                tag: "v4.4.1".to_string(),
                reason: SkipReason::DuplicateVersion(SnapshotVersion::new("2023010100")),
            }]
        );

        // The second tag was never compiled, so the first image is intact.
        let calls = fs::read_to_string(fx.tools.path().join("calls")).unwrap();
        assert_eq!(calls.lines().count(), 1);
        let image = registry.artifact_path(&SnapshotVersion::new("2023010100"));
        assert_eq!(fs::read_to_string(image).unwrap(), "#!/bin/sh\ncat\n");
    }

    #[test]
    fn failed_build_leaves_no_partial_image() {
        let fx = Fixture::new();
        let (builder, _) = fx.builder(None);
        let data = fx.data.path().join("fails");
        fs::create_dir(&data).unwrap();
        let registry = Arc::new(SnapshotRegistry::new(&data));
        let builder = SnapshotBuilder::new(registry, builder.sandbox.clone(), builder.settings.clone());

        let checkout = fx.work.path().join("checkout");
        fx.release("v4.4.0", Some("2023010100"));
        git::clone_repository(&fx.upstream.path().to_string_lossy(), &checkout).unwrap();

        let err = builder.build_tag(&checkout, "v4.4.0").unwrap_err();
        assert!(format!("{err:#}").contains("Maxima build for 2023010100 failed"), "{err:#}");
        assert_eq!(fs::read_dir(&data).unwrap().count(), 0);
    }

    #[test]
    fn partial_image_sits_next_to_artifact() {
        assert_eq!(
            partial_path(Path::new("/data/maxima-2023010100")),
            Path::new("/data/maxima-2023010100.partial")
        );
    }

    #[test]
    fn previous_artifacts_are_removed() {
        let fx = Fixture::new();
        fx.release("v4.4.0", Some("2023010100"));
        fs::write(fx.data.path().join("maxima-2000010100"), "stale").unwrap();

        let (builder, _) = fx.builder(None);
        builder.build().unwrap();

        assert!(!fx.data.path().join("maxima-2000010100").exists());
        assert!(fx.data.path().join("maxima-2023010100").is_file());
    }

    #[test]
    fn clone_failure_aborts_without_persisting() {
        let fx = Fixture::new();
        let (mut builder, _) = fx.builder(None);
        builder.settings.repository = fx.upstream.path().join("missing").to_string_lossy().into_owned();

        assert!(builder.build().is_err());
        assert!(!fx.data.path().join(SnapshotRegistry::RECORD_FILE).exists());
    }

    #[test]
    fn invalid_constraint_aborts_before_touching_storage() {
        let fx = Fixture::new();
        fs::write(fx.data.path().join("maxima-2000010100"), "keep").unwrap();
        let (builder, _) = fx.builder(Some("not a version"));

        assert!(builder.build().is_err());
        assert!(fx.data.path().join("maxima-2000010100").exists());
    }

    #[test]
    fn concurrent_build_is_rejected() {
        let fx = Fixture::new();
        let _held = acquire_lock(fx.work.path()).unwrap();
        let (builder, _) = fx.builder(None);
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("Another snapshot build"));
    }

    #[test]
    fn tags_are_ordered_by_version() {
        let mut skipped = Vec::new();
        let tags = vec!["v4.10.0", "v4.9.2", "4.2", "junk", "v3.9"]
            .into_iter()
            .map(String::from)
            .collect();
        let constraint = parse_constraint(Some("v4.0")).unwrap();
        let selected = select_tags(tags, constraint.as_ref(), &mut skipped);
        assert_eq!(selected, vec!["4.2", "v4.9.2", "v4.10.0"]);
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn build_script_extends_search_paths_and_saves_image() {
        let script = build_script(Path::new("/w/repo"), Path::new("/data/maxima-2023010100"));
        assert!(script.starts_with(
            "file_search_maxima:append([sconcat(\"/w/repo/stack/maxima/###.{mac,mc}\")],file_search_maxima)$"
        ));
        assert!(script.contains(
            "file_search_lisp:append([sconcat(\"/w/repo/stack/maxima/###.{lisp}\")],file_search_lisp)$"
        ));
        assert!(script.contains("load(\"stackmaxima.mac\")$"));
        assert!(script.ends_with(
            ":lisp (sb-ext:save-lisp-and-die \"/data/maxima-2023010100\" :toplevel #'run :executable t)"
        ));
    }
}
