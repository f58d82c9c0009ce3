//! Mount engine implementation.
//!
//! The [`MountEngine`] drives the pipeline
//! content enumeration -> conflict resolution -> linking -> manifest update.
//!
//! # Mount
//!
//! 1. Take the manifest lock and load the manifest.
//! 2. Enumerate the source ([`FsContent`]) and [`resolve`] it against the
//!    manifest. Granted paths are linked; paths the source still owns but no
//!    longer provides are released with fallback (see below). A path that is
//!    already mounted keeps the spelling it was first mounted under, whatever
//!    the case of the new owner's file.
//! 3. Run all path steps on the worker pool. Steps are independent of each other.
//! 4. Apply every step outcome to the in-memory manifest, mark the source
//!    mounted and persist the manifest once.
//!
//! # Unmount
//!
//! Every path owned by the source is unlinked, then re-resolved: the mounted
//! source with the highest priority that still provides the file takes it over
//! (ties broken by id), otherwise the base content if it provides the file,
//! otherwise the path stays unmounted. Afterwards directories left empty in the
//! mount root are pruned bottom-up.
//!
//! # Failures
//!
//! A failed path step never stops the batch. After the pass, the manifest entry
//! for a failed path is made to agree with whatever is actually on disk, the
//! manifest is saved, and [`Error::Incomplete`] lists every failure.

use crate::content::FsContent;
use crate::error::{Error, Operation, PathFailure, Result};
use crate::link::{LinkMaterializer, LinkState, SymlinkMaterializer};
use crate::manifest::{Manifest, ManifestStore, SourceRecord, BASE_CONTENT_ID};
use crate::path::VirtualPath;
use crate::resolver::{resolve, Denied};
use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Marker file in the base-content root that flags a patched game install.
pub const PATCHED_MARKER: &str = "PATCHED";

/// Filesystem locations the engine works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    /// Persisted manifest document (`timm.json`).
    pub manifest: Utf8PathBuf,
    /// Directory the engine exclusively manages (`mapkit/`).
    pub mount_root: Utf8PathBuf,
    /// Parent of every mod folder; a mod's root is `mods_dir/<id>`.
    pub mods_dir: Utf8PathBuf,
    /// Root of the base-content provider.
    pub base_content_dir: Utf8PathBuf,
}

/// Tunables for the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Number of concurrent path steps. `None` uses the available parallelism.
    pub workers: Option<usize>,
}

/// One checkpoint of the progress stream.
///
/// Emitted once per processed path. The stream for an operation ends when the
/// operation returns.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountProgress {
    pub operation: Operation,
    /// 1-based count of processed paths.
    pub current: usize,
    pub total: usize,
    pub path: VirtualPath,
}

type ProgressCallback = Arc<dyn Fn(MountProgress) + Send + Sync>;

/// Cooperative cancellation flag shared between the caller and the engine.
///
/// Checked before each path step. Steps already running finish, their results
/// are persisted, and the operation returns [`Error::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of a mount or base-content mount.
#[derive(Debug, Default)]
pub struct MountReport {
    pub source: String,
    /// Paths linked to the source during this run.
    pub linked: Vec<VirtualPath>,
    /// Paths kept by a source with greater or equal priority.
    pub denied: Vec<Denied>,
    /// Paths this source no longer provides, with the source that took them over.
    pub released: Vec<(VirtualPath, Option<String>)>,
    /// Paths left alone because something already occupied them.
    pub skipped: Vec<VirtualPath>,
    pub duration: Duration,
}

/// Summary of an unmount.
#[derive(Debug, Default)]
pub struct UnmountReport {
    pub source: String,
    /// Every released path and the source that took it over, if any.
    pub released: Vec<(VirtualPath, Option<String>)>,
    /// Directories removed from the mount root.
    pub pruned: Vec<Utf8PathBuf>,
    pub duration: Duration,
}

/// Per-source line of [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub id: String,
    pub version: String,
    pub priority: i32,
    pub mounted: bool,
    pub claimed_paths: usize,
}

/// Snapshot of the manifest for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub game_patched: bool,
    pub sources: Vec<SourceStatus>,
    pub mounted_paths: usize,
}

struct Job {
    /// Spelling of the path in the mount root.
    path: VirtualPath,
    kind: JobKind,
}

enum JobKind {
    /// Link the path to `target`, a file provided by `owner`.
    Link { owner: String, target: Utf8PathBuf },
    /// Unlink the path, then hand it to the fallback owner and file if there is one.
    Release {
        fallback: Option<(String, Utf8PathBuf)>,
    },
}

enum StepResult {
    Linked(String),
    Released(Option<String>),
    Failed {
        error: Error,
        state: LinkState,
        intended: Option<(String, Utf8PathBuf)>,
    },
    Skipped,
}

struct Outcome {
    path: VirtualPath,
    result: StepResult,
}

/// Outcomes of one pass after they have been written into the manifest.
#[derive(Default)]
struct Applied {
    linked: Vec<VirtualPath>,
    released: Vec<(VirtualPath, Option<String>)>,
    failures: Vec<PathFailure>,
    processed: usize,
    total: usize,
    cancelled: bool,
}

/// Orchestrates mount, unmount and base-content mount over one mount root.
///
/// Create an engine with [`new`](Self::new), optionally configure it with
/// [`with_options`](Self::with_options), [`with_progress`](Self::with_progress),
/// [`with_cancellation`](Self::with_cancellation) or
/// [`with_materializer`](Self::with_materializer), then call the operations.
/// Every operation holds the manifest lock from load to save.
pub struct MountEngine {
    store: ManifestStore,
    mount_root: Utf8PathBuf,
    mods_dir: Utf8PathBuf,
    base_content_dir: Utf8PathBuf,
    materializer: Box<dyn LinkMaterializer>,
    pool: rayon::ThreadPool,
    progress_callback: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl MountEngine {
    /// Create an engine. Relative paths are resolved against the working directory.
    pub fn new(paths: EnginePaths) -> Result<Self> {
        Ok(Self {
            store: ManifestStore::new(absolute(&paths.manifest)?),
            mount_root: absolute(&paths.mount_root)?,
            mods_dir: absolute(&paths.mods_dir)?,
            base_content_dir: absolute(&paths.base_content_dir)?,
            materializer: Box::new(SymlinkMaterializer),
            pool: build_pool(None)?,
            progress_callback: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_options(mut self, options: EngineOptions) -> Result<Self> {
        self.pool = build_pool(options.workers)?;
        Ok(self)
    }

    /// Register a progress observer.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(MountProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Replace the physical link mechanism.
    pub fn with_materializer<M: LinkMaterializer + 'static>(mut self, materializer: M) -> Self {
        self.materializer = Box::new(materializer);
        self
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn mount_root(&self) -> &Utf8Path {
        &self.mount_root
    }

    /// Root directory of a mod source.
    pub fn mod_root(&self, id: &str) -> Utf8PathBuf {
        self.mods_dir.join(id)
    }

    fn content_for(&self, id: &str) -> FsContent {
        if id.eq_ignore_ascii_case(BASE_CONTENT_ID) {
            FsContent::new(BASE_CONTENT_ID, self.base_content_dir.clone())
                .with_excluded([PATCHED_MARKER])
        } else {
            FsContent::new(id, self.mod_root(id))
        }
    }

    /// Register a mod (or update its version/priority), returning the stored record.
    ///
    /// Mounted state and claims of an existing record are kept; a priority change
    /// takes effect the next time the source is mounted.
    pub fn register_source(
        &self,
        name: &str,
        version: Option<&str>,
        priority: i32,
    ) -> Result<SourceRecord> {
        let id = crate::manifest::source_id_from_name(name)?;
        let _lock = self.store.lock()?;
        let mut manifest = self.store.load_or_create()?;

        let record = match manifest.source(&id) {
            Some(existing) => SourceRecord {
                version: version.map_or_else(|| existing.version.clone(), str::to_string),
                priority,
                ..existing.clone()
            },
            None => SourceRecord::new(
                id.clone(),
                version.unwrap_or(crate::manifest::DEFAULT_SOURCE_VERSION),
                priority,
            ),
        };

        manifest.upsert_source(record.clone());
        self.store.save(&manifest)?;
        tracing::info!(
            "Registered source id={} version={} priority={}",
            record.id,
            record.version,
            record.priority
        );
        Ok(record)
    }

    /// Remove an unmounted source record.
    pub fn forget_source(&self, id: &str) -> Result<SourceRecord> {
        let _lock = self.store.lock()?;
        let mut manifest = self.store.load_or_create()?;

        let record = manifest.get_source(id)?;
        if record.mounted || !manifest.owned_by(&record.id).is_empty() {
            return Err(Error::SourceMounted(record.id.clone()));
        }

        let removed = manifest
            .remove_source(id)
            .ok_or_else(|| Error::SourceNotFound(id.to_string()))?;
        self.store.save(&manifest)?;
        tracing::info!("Forgot source id={}", removed.id);
        Ok(removed)
    }

    /// Recompute `gamePatched` from the marker file and persist it if it changed.
    pub fn refresh_game_patched(&self) -> Result<bool> {
        let _lock = self.store.lock()?;
        let mut manifest = self.store.load_or_create()?;
        let patched = self.base_content_dir.join(PATCHED_MARKER).is_file();

        if manifest.game_patched != patched {
            manifest.game_patched = patched;
            self.store.save(&manifest)?;
        }
        Ok(patched)
    }

    /// Mount a registered source. See the module docs for the algorithm.
    pub fn mount_source(&self, id: &str) -> Result<MountReport> {
        if id.eq_ignore_ascii_case(BASE_CONTENT_ID) {
            return self.mount_base_content();
        }

        let start_time = Instant::now();
        let _lock = self.store.lock()?;
        let mut manifest = self.store.load_or_create()?;
        let record = manifest.get_source(id)?.clone();

        let content = self.content_for(&record.id);
        let paths = content.list_paths()?;

        tracing::info!(
            "Mounting source id={} priority={} paths={}",
            record.id,
            record.priority,
            paths.len()
        );

        let resolution = resolve(&manifest, &record.id, record.priority, &paths);
        for denied in &resolution.denied {
            if denied.is_tie(record.priority) {
                tracing::warn!(
                    "Equal priority conflict on '{}': '{}' keeps it over '{}' (priority {})",
                    denied.path,
                    denied.owner,
                    record.id,
                    record.priority
                );
            } else {
                tracing::debug!(
                    "'{}' stays with higher priority source '{}'",
                    denied.path,
                    denied.owner
                );
            }
        }
        for (path, previous) in &resolution.displaced {
            tracing::debug!("'{}' displaces '{}' on {}", record.id, previous, path);
        }

        let stale: Vec<VirtualPath> = manifest
            .owned_by(&record.id)
            .into_iter()
            .filter(|path| !paths.contains(path))
            .collect();
        if !stale.is_empty() {
            tracing::info!(
                "Source id={} no longer provides {} mounted path(s)",
                record.id,
                stale.len()
            );
        }

        let stale_dirs: BTreeSet<String> = stale
            .iter()
            .flat_map(|path| path.parent_dirs())
            .map(str::to_string)
            .collect();

        let mut jobs: Vec<Job> = resolution
            .granted
            .iter()
            .map(|path| Job {
                path: manifest
                    .mounted_path(path)
                    .unwrap_or(path)
                    .clone(),
                kind: JobKind::Link {
                    owner: record.id.clone(),
                    target: content.file_path(path),
                },
            })
            .collect();
        jobs.extend(self.release_jobs(&manifest, &record.id, stale));

        fs::create_dir_all(self.mount_root.as_std_path())?;
        let outcomes = self.run_jobs(Operation::Mount, jobs);
        let applied = self.apply(&mut manifest, outcomes);

        if let Some(source) = manifest.source_mut(&record.id) {
            source.mounted = !applied.cancelled || source.claim_count() > 0;
        }
        self.store.save(&manifest)?;
        self.prune_empty_dirs(stale_dirs);

        tracing::info!(
            "Mounted source id={} linked={} denied={} released={} failed={}",
            record.id,
            applied.linked.len(),
            resolution.denied.len(),
            applied.released.len(),
            applied.failures.len()
        );

        finish(
            Operation::Mount,
            applied,
            MountReport {
                source: record.id,
                linked: Vec::new(),
                denied: resolution.denied,
                released: Vec::new(),
                skipped: Vec::new(),
                duration: start_time.elapsed(),
            },
            |report, applied| {
                report.linked = applied.linked;
                report.released = applied.released;
            },
        )
    }

    /// Link every base-content file the mount root does not already contain.
    ///
    /// Base content never displaces anything and does not take part in
    /// priority resolution.
    pub fn mount_base_content(&self) -> Result<MountReport> {
        let start_time = Instant::now();
        let _lock = self.store.lock()?;
        let mut manifest = self.store.load_or_create()?;

        let content = self.content_for(BASE_CONTENT_ID);
        let paths = content.list_paths()?;
        tracing::info!(
            "Mounting base content from {} paths={}",
            content.root(),
            paths.len()
        );

        if manifest.source(BASE_CONTENT_ID).is_none() {
            manifest.upsert_source(SourceRecord::base_content());
        }
        manifest.game_patched = self.base_content_dir.join(PATCHED_MARKER).is_file();

        let mut skipped = Vec::new();
        let mut jobs = Vec::new();
        for path in paths {
            let occupied = manifest.owner(&path).is_some()
                || self.materializer.inspect(&path, &self.mount_root) != LinkState::Absent;
            if occupied {
                skipped.push(path);
                continue;
            }
            jobs.push(Job {
                kind: JobKind::Link {
                    owner: BASE_CONTENT_ID.to_string(),
                    target: content.file_path(&path),
                },
                path,
            });
        }

        fs::create_dir_all(self.mount_root.as_std_path())?;
        let outcomes = self.run_jobs(Operation::MountBase, jobs);
        let applied = self.apply(&mut manifest, outcomes);

        if let Some(base) = manifest.source_mut(BASE_CONTENT_ID) {
            base.mounted = !applied.cancelled || base.claim_count() > 0;
        }
        self.store.save(&manifest)?;

        tracing::info!(
            "Mounted base content linked={} skipped={} failed={}",
            applied.linked.len(),
            skipped.len(),
            applied.failures.len()
        );

        finish(
            Operation::MountBase,
            applied,
            MountReport {
                source: BASE_CONTENT_ID.to_string(),
                skipped,
                duration: start_time.elapsed(),
                ..Default::default()
            },
            |report, applied| report.linked = applied.linked,
        )
    }

    /// Unmount a source, re-resolving each released path to its next owner.
    pub fn unmount_source(&self, id: &str) -> Result<UnmountReport> {
        let start_time = Instant::now();
        let _lock = self.store.lock()?;
        let mut manifest = self.store.load_or_create()?;
        let record = manifest.get_source(id)?.clone();

        let owned = manifest.owned_by(&record.id);
        tracing::info!(
            "Unmounting source id={} paths={}",
            record.id,
            owned.len()
        );

        let prune_candidates = self.prune_candidates(&record.id, &owned);
        let jobs = self.release_jobs(&manifest, &record.id, owned);
        let outcomes = self.run_jobs(Operation::Unmount, jobs);
        let applied = self.apply(&mut manifest, outcomes);

        if let Some(source) = manifest.source_mut(&record.id) {
            source.claims.retain(|_, claimed| *claimed);
            source.mounted = source.claim_count() > 0;
        }
        self.store.save(&manifest)?;

        let pruned = self.prune_empty_dirs(prune_candidates);

        tracing::info!(
            "Unmounted source id={} released={} pruned_dirs={} failed={}",
            record.id,
            applied.released.len(),
            pruned.len(),
            applied.failures.len()
        );

        finish(
            Operation::Unmount,
            applied,
            UnmountReport {
                source: record.id,
                released: Vec::new(),
                pruned,
                duration: start_time.elapsed(),
            },
            |report, applied| report.released = applied.released,
        )
    }

    /// Current manifest contents. Read-only, so the lock is not taken and a
    /// missing manifest reads as empty without being created.
    pub fn status(&self) -> Result<StatusReport> {
        let manifest = match self.store.load() {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Manifest::default(),
            other => other?,
        };
        let mut sources: Vec<SourceStatus> = manifest
            .mods
            .iter()
            .map(|record| SourceStatus {
                id: record.id.clone(),
                version: record.version.clone(),
                priority: record.priority,
                mounted: record.mounted,
                claimed_paths: record.claim_count(),
            })
            .collect();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        Ok(StatusReport {
            game_patched: manifest.game_patched,
            sources,
            mounted_paths: manifest.mount_manifest.len(),
        })
    }

    /// Compare the manifest with the mount root. See [`crate::reconcile`].
    pub fn reconcile(&self) -> Result<crate::reconcile::ReconcileReport> {
        let _lock = self.store.lock()?;
        let manifest = self.store.load_or_create()?;
        crate::reconcile::reconcile(
            &manifest,
            &self.mount_root,
            self.materializer.as_ref(),
            |id, path| {
                let content = self.content_for(id);
                content
                    .locate(path)
                    .unwrap_or_else(|| content.file_path(path))
            },
        )
    }

    /// Build release steps for `paths`, choosing each path's fallback owner
    /// from the manifest snapshot. `releasing` is never chosen.
    fn release_jobs(&self, manifest: &Manifest, releasing: &str, paths: Vec<VirtualPath>) -> Vec<Job> {
        let mut candidates: Vec<&SourceRecord> = manifest
            .mods
            .iter()
            .filter(|s| s.mounted && !s.is_base_content() && !s.id.eq_ignore_ascii_case(releasing))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        let candidates: Vec<FsContent> = candidates
            .into_iter()
            .map(|s| self.content_for(&s.id))
            .collect();

        let base = (releasing != BASE_CONTENT_ID)
            .then(|| self.content_for(BASE_CONTENT_ID));

        paths
            .into_iter()
            .map(|path| {
                let fallback = candidates.iter().chain(base.iter()).find_map(|content| {
                    content
                        .locate(&path)
                        .map(|target| (content.id().to_string(), target))
                });

                match &fallback {
                    Some((owner, _)) => tracing::debug!("'{}' falls back to '{}'", path, owner),
                    None => tracing::debug!("'{}' has no remaining provider", path),
                }

                Job {
                    path,
                    kind: JobKind::Release { fallback },
                }
            })
            .collect()
    }

    /// Execute path steps on the worker pool.
    fn run_jobs(&self, operation: Operation, jobs: Vec<Job>) -> Vec<Outcome> {
        let total = jobs.len();
        let processed = AtomicUsize::new(0);

        self.pool.install(|| {
            jobs.into_par_iter()
                .map(|job| {
                    if self.cancel.is_cancelled() {
                        return Outcome {
                            path: job.path,
                            result: StepResult::Skipped,
                        };
                    }

                    let result = self.execute(&job);
                    let current = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    self.emit_progress(MountProgress {
                        operation,
                        current,
                        total,
                        path: job.path.clone(),
                    });

                    Outcome {
                        path: job.path,
                        result,
                    }
                })
                .collect()
        })
    }

    fn execute(&self, job: &Job) -> StepResult {
        let path = &job.path;
        match &job.kind {
            JobKind::Link { owner, target } => {
                match self.materializer.link(path, target, &self.mount_root) {
                    Ok(()) => StepResult::Linked(owner.clone()),
                    Err(error) => StepResult::Failed {
                        error,
                        state: self.materializer.inspect(path, &self.mount_root),
                        intended: Some((owner.clone(), target.clone())),
                    },
                }
            }
            JobKind::Release { fallback } => {
                if let Err(error) = self.materializer.unlink(path, &self.mount_root) {
                    return StepResult::Failed {
                        error,
                        state: self.materializer.inspect(path, &self.mount_root),
                        intended: None,
                    };
                }

                let Some((owner, target)) = fallback else {
                    return StepResult::Released(None);
                };

                match self.materializer.link(path, target, &self.mount_root) {
                    Ok(()) => StepResult::Released(Some(owner.clone())),
                    Err(error) => StepResult::Failed {
                        error,
                        state: self.materializer.inspect(path, &self.mount_root),
                        intended: Some((owner.clone(), target.clone())),
                    },
                }
            }
        }
    }

    /// Write step outcomes into the manifest so that it matches the disk.
    fn apply(&self, manifest: &mut Manifest, outcomes: Vec<Outcome>) -> Applied {
        let mut applied = Applied {
            total: outcomes.len(),
            ..Default::default()
        };

        for Outcome { path, result } in outcomes {
            match result {
                StepResult::Linked(owner) => {
                    assign(manifest, &path, &owner);
                    applied.linked.push(path);
                    applied.processed += 1;
                }
                StepResult::Released(new_owner) => {
                    manifest.release(&path);
                    if let Some(owner) = &new_owner {
                        assign(manifest, &path, owner);
                    }
                    applied.released.push((path, new_owner));
                    applied.processed += 1;
                }
                StepResult::Failed {
                    error,
                    state,
                    intended,
                } => {
                    tracing::error!("{}", error);
                    match (state, intended) {
                        (LinkState::Absent, _) => {
                            manifest.release(&path);
                        }
                        (LinkState::Linked(actual), Some((owner, target))) if actual == target => {
                            assign(manifest, &path, &owner);
                        }
                        _ => {}
                    }
                    applied.failures.push(PathFailure { path, error });
                    applied.processed += 1;
                }
                StepResult::Skipped => applied.cancelled = true,
            }
        }

        applied
    }

    /// Directories that may become empty once `released` paths are unlinked.
    fn prune_candidates(&self, id: &str, released: &[VirtualPath]) -> BTreeSet<String> {
        let mut dirs: BTreeSet<String> = released
            .iter()
            .flat_map(|path| path.parent_dirs())
            .map(str::to_string)
            .collect();

        match self.content_for(id).list_dirs() {
            Ok(source_dirs) => dirs.extend(source_dirs.into_iter().map(String::from)),
            Err(e) => tracing::debug!("Not pruning source directories of '{}': {}", id, e),
        }
        dirs
    }

    /// Remove empty directories bottom-up. Never removes the mount root itself.
    fn prune_empty_dirs(&self, candidates: BTreeSet<String>) -> Vec<Utf8PathBuf> {
        let mut ordered: Vec<String> = candidates.into_iter().collect();
        ordered.sort_by(|a, b| {
            b.matches('/')
                .count()
                .cmp(&a.matches('/').count())
                .then(b.cmp(a))
        });

        let mut pruned = Vec::new();
        for rel in ordered {
            let Ok(virtual_dir) = VirtualPath::new(&rel) else {
                continue;
            };
            let dir = virtual_dir.under(&self.mount_root);

            let is_real_dir = fs::symlink_metadata(dir.as_std_path())
                .map(|meta| meta.file_type().is_dir())
                .unwrap_or(false);
            if !is_real_dir {
                continue;
            }

            let is_empty = match fs::read_dir(dir.as_std_path()) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", dir, e);
                    continue;
                }
            };
            if !is_empty {
                continue;
            }

            match fs::remove_dir(dir.as_std_path()) {
                Ok(()) => {
                    tracing::debug!("Pruned empty directory {}", dir);
                    pruned.push(dir);
                }
                Err(e) => tracing::warn!("Failed to prune {}: {}", dir, e),
            }
        }
        pruned
    }

    /// Emit a progress event if a callback was registered.
    fn emit_progress(&self, progress: MountProgress) {
        if let Some(callback) = &self.progress_callback {
            callback(progress);
        }
    }
}

/// Assign ownership, creating the base-content record on first reference.
fn assign(manifest: &mut Manifest, path: &VirtualPath, owner: &str) {
    if owner == BASE_CONTENT_ID && manifest.source(BASE_CONTENT_ID).is_none() {
        manifest.upsert_source(SourceRecord::base_content());
    }
    manifest.assign(path, owner);
    if let Some(record) = manifest.source_mut(owner) {
        record.mounted = true;
    }
}

/// Turn an applied pass into the operation's result.
fn finish<R>(
    operation: Operation,
    applied: Applied,
    mut report: R,
    fill: impl FnOnce(&mut R, Applied),
) -> Result<R> {
    if applied.cancelled {
        tracing::warn!(
            "{} cancelled after {} of {} path(s)",
            operation,
            applied.processed,
            applied.total
        );
        return Err(Error::Cancelled {
            applied: applied.processed,
            total: applied.total,
        });
    }
    if !applied.failures.is_empty() {
        return Err(Error::Incomplete {
            operation,
            failures: applied.failures,
        });
    }
    fill(&mut report, applied);
    Ok(report)
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let abs = std::path::absolute(path.as_std_path())?;
    Utf8PathBuf::from_path_buf(abs).map_err(|p| {
        Error::Io(std::io::Error::other(format!(
            "path is not valid UTF-8: {}",
            p.display()
        )))
    })
}

fn build_pool(workers: Option<usize>) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.unwrap_or(0))
        .thread_name(|i| format!("timm-mount-{}", i))
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
            fs::create_dir_all(root.join("mapkit")).unwrap();
            fs::create_dir_all(root.join("mods")).unwrap();
            Self { _dir: dir, root }
        }

        fn paths(&self) -> EnginePaths {
            EnginePaths {
                manifest: self.root.join("timm.json"),
                mount_root: self.root.join("mapkit"),
                mods_dir: self.root.join("mods"),
                base_content_dir: self.root.join("base"),
            }
        }

        fn engine(&self) -> MountEngine {
            MountEngine::new(self.paths())
                .unwrap()
                .with_options(EngineOptions { workers: Some(2) })
                .unwrap()
        }

        fn write_mod(&self, id: &str, files: &[&str]) {
            for file in files {
                let path = self.root.join("mods").join(id).join(file);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, format!("{id}:{file}")).unwrap();
            }
        }

        fn write_base(&self, files: &[&str]) {
            for file in files {
                let path = self.root.join("base").join(file);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, format!("base:{file}")).unwrap();
            }
        }

        fn mounted(&self, file: &str) -> Option<String> {
            fs::read_to_string(self.root.join("mapkit").join(file)).ok()
        }

        fn manifest(&self) -> Manifest {
            ManifestStore::new(self.root.join("timm.json")).load().unwrap()
        }

        /// Every link under `mapkit/` with its target, sorted by location.
        fn links(&self) -> Vec<(Utf8PathBuf, Utf8PathBuf)> {
            let mut links: Vec<_> = walkdir::WalkDir::new(self.root.join("mapkit"))
                .into_iter()
                .map(|entry| entry.unwrap())
                .filter(|entry| entry.path_is_symlink())
                .map(|entry| {
                    let path = Utf8PathBuf::from_path_buf(entry.path().to_path_buf()).unwrap();
                    let target = Utf8PathBuf::from_path_buf(fs::read_link(&path).unwrap()).unwrap();
                    (path, target)
                })
                .collect();
            links.sort();
            links
        }
    }

    /// Replaces `timm.json` with a directory the first time a path is unlinked,
    /// so the save at the end of the operation fails.
    struct ManifestBreaker {
        manifest: Utf8PathBuf,
    }

    impl LinkMaterializer for ManifestBreaker {
        fn link(&self, path: &VirtualPath, target: &Utf8Path, mount_root: &Utf8Path) -> Result<()> {
            SymlinkMaterializer.link(path, target, mount_root)
        }

        fn unlink(&self, path: &VirtualPath, mount_root: &Utf8Path) -> Result<()> {
            if self.manifest.is_file() {
                fs::remove_file(&self.manifest).unwrap();
                fs::create_dir(&self.manifest).unwrap();
            }
            SymlinkMaterializer.unlink(path, mount_root)
        }

        fn inspect(&self, path: &VirtualPath, mount_root: &Utf8Path) -> LinkState {
            SymlinkMaterializer.inspect(path, mount_root)
        }
    }

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    #[test]
    fn test_priority_overlay_and_fallback_on_unmount() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["weapons/knife.model", "maps/depot/depot.bsp"]);
        fx.write_mod("beta", &["weapons/knife.model", "sounds/shot.wav"]);
        let engine = fx.engine();

        engine.register_source("Alpha", Some("1.0.0"), 5).unwrap();
        engine.register_source("beta", None, 1).unwrap();

        engine.mount_source("beta").unwrap();
        let report = engine.mount_source("alpha").unwrap();
        assert_eq!(report.linked.len(), 2);

        assert_eq!(fx.mounted("weapons/knife.model").unwrap(), "alpha:weapons/knife.model");
        assert_eq!(fx.mounted("sounds/shot.wav").unwrap(), "beta:sounds/shot.wav");

        let manifest = fx.manifest();
        assert_eq!(manifest.owner(&vp("weapons/knife.model")), Some("alpha"));
        assert!(!manifest.get_source("beta").unwrap().claims(&vp("weapons/knife.model")));

        let report = engine.unmount_source("alpha").unwrap();
        assert!(report
            .released
            .contains(&(vp("weapons/knife.model"), Some("beta".to_string()))));
        assert!(report
            .released
            .contains(&(vp("maps/depot/depot.bsp"), None)));

        assert_eq!(fx.mounted("weapons/knife.model").unwrap(), "beta:weapons/knife.model");
        assert!(fx.mounted("maps/depot/depot.bsp").is_none());
        assert!(!fx.root.join("mapkit/maps").exists());
        assert!(fx.root.join("mapkit").is_dir());

        let manifest = fx.manifest();
        assert_eq!(manifest.owner(&vp("weapons/knife.model")), Some("beta"));
        assert!(!manifest.get_source("alpha").unwrap().mounted);
        assert_eq!(manifest.get_source("alpha").unwrap().claim_count(), 0);
    }

    #[test]
    fn test_higher_priority_wins_regardless_of_mount_order() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["x.txt"]);
        fx.write_mod("beta", &["x.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 5).unwrap();
        engine.register_source("beta", None, 1).unwrap();

        engine.mount_source("alpha").unwrap();
        let report = engine.mount_source("beta").unwrap();

        assert!(report.linked.is_empty());
        assert_eq!(report.denied.len(), 1);
        assert_eq!(fx.mounted("x.txt").unwrap(), "alpha:x.txt");
    }

    #[test]
    fn test_equal_priority_incumbent_keeps_path() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["x.txt"]);
        fx.write_mod("beta", &["x.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 3).unwrap();
        engine.register_source("beta", None, 3).unwrap();

        engine.mount_source("beta").unwrap();
        engine.mount_source("alpha").unwrap();

        assert_eq!(fx.mounted("x.txt").unwrap(), "beta:x.txt");
        assert_eq!(fx.manifest().owner(&vp("x.txt")), Some("beta"));
    }

    #[test]
    fn test_mount_twice_is_idempotent() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt", "dir/b.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();

        engine.mount_source("alpha").unwrap();
        let first = fs::read(fx.root.join("timm.json")).unwrap();
        let first_links = fx.links();
        engine.mount_source("alpha").unwrap();
        let second = fs::read(fx.root.join("timm.json")).unwrap();
        let second_links = fx.links();

        assert_eq!(first, second);
        assert_eq!(first_links, second_links);
        assert_eq!(
            first_links,
            vec![
                (fx.root.join("mapkit/a.txt"), fx.root.join("mods/alpha/a.txt")),
                (fx.root.join("mapkit/dir/b.txt"), fx.root.join("mods/alpha/dir/b.txt")),
            ]
        );
        assert!(engine.reconcile().unwrap().is_clean());
    }

    #[test]
    fn test_paths_differing_only_in_case_share_one_owner() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["Materials/x.vmt"]);
        fx.write_mod("beta", &["materials/x.vmt"]);
        fx.write_mod("gamma", &["MATERIALS/X.VMT"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 5).unwrap();
        engine.register_source("beta", None, 1).unwrap();
        engine.register_source("gamma", None, 9).unwrap();

        engine.mount_source("alpha").unwrap();
        let report = engine.mount_source("beta").unwrap();
        assert!(report.linked.is_empty());
        assert_eq!(report.denied[0].owner, "alpha");
        assert_eq!(
            fx.links(),
            vec![(
                fx.root.join("mapkit/Materials/x.vmt"),
                fx.root.join("mods/alpha/Materials/x.vmt")
            )]
        );

        engine.mount_source("gamma").unwrap();
        assert_eq!(
            fx.links(),
            vec![(
                fx.root.join("mapkit/Materials/x.vmt"),
                fx.root.join("mods/gamma/MATERIALS/X.VMT")
            )]
        );
        let manifest = fx.manifest();
        assert_eq!(manifest.mount_manifest.len(), 1);
        assert_eq!(manifest.owner(&vp("materials/x.vmt")), Some("gamma"));
        assert_eq!(manifest.get_source("alpha").unwrap().claim_count(), 0);
        assert!(engine.reconcile().unwrap().is_clean());

        engine.unmount_source("gamma").unwrap();
        assert_eq!(
            fx.links(),
            vec![(
                fx.root.join("mapkit/Materials/x.vmt"),
                fx.root.join("mods/alpha/Materials/x.vmt")
            )]
        );
        assert_eq!(fx.manifest().owner(&vp("Materials/x.vmt")), Some("alpha"));
        assert!(engine.reconcile().unwrap().is_clean());
    }

    #[test]
    fn test_manifest_write_failure_is_reported_before_pruning() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["dir/a.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();
        engine.mount_source("alpha").unwrap();

        let breaking = fx.engine().with_materializer(ManifestBreaker {
            manifest: fx.root.join("timm.json"),
        });
        let err = breaking.unmount_source("alpha").unwrap_err();

        match err {
            Error::WriteFailure { path, .. } => assert_eq!(path, fx.root.join("timm.json")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.mounted("dir/a.txt").is_none());
        assert!(fx.root.join("mapkit/dir").is_dir());
    }

    #[test]
    fn test_unmount_falls_back_to_base_content() {
        let fx = Fixture::new();
        fx.write_base(&["weapons/knife.model", "PATCHED"]);
        fx.write_mod("alpha", &["weapons/knife.model"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();

        let report = engine.mount_base_content().unwrap();
        assert_eq!(report.linked, vec![vp("weapons/knife.model")]);
        assert!(fx.mounted("PATCHED").is_none());
        assert!(fx.manifest().game_patched);

        engine.mount_source("alpha").unwrap();
        assert_eq!(fx.mounted("weapons/knife.model").unwrap(), "alpha:weapons/knife.model");

        engine.unmount_source("alpha").unwrap();
        assert_eq!(fx.mounted("weapons/knife.model").unwrap(), "base:weapons/knife.model");
        assert_eq!(
            fx.manifest().owner(&vp("weapons/knife.model")),
            Some(BASE_CONTENT_ID)
        );
    }

    #[test]
    fn test_base_content_only_fills_gaps() {
        let fx = Fixture::new();
        fx.write_base(&["a.txt", "b.txt"]);
        fx.write_mod("alpha", &["a.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();
        engine.mount_source("alpha").unwrap();

        let report = engine.mount_base_content().unwrap();

        assert_eq!(report.linked, vec![vp("b.txt")]);
        assert_eq!(report.skipped, vec![vp("a.txt")]);
        assert_eq!(fx.mounted("a.txt").unwrap(), "alpha:a.txt");
    }

    #[test]
    fn test_remount_releases_files_removed_from_source() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["keep.txt", "old/gone.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();
        engine.mount_source("alpha").unwrap();

        fs::remove_file(fx.root.join("mods/alpha/old/gone.txt")).unwrap();
        let report = engine.mount_source("alpha").unwrap();

        assert_eq!(report.released, vec![(vp("old/gone.txt"), None)]);
        assert!(fx.mounted("old/gone.txt").is_none());
        assert!(!fx.root.join("mapkit/old").exists());
        assert_eq!(fx.manifest().owned_by("alpha"), vec![vp("keep.txt")]);
    }

    #[test]
    fn test_missing_source_root_fails_before_linking() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.register_source("ghost", None, 0).unwrap();

        let err = engine.mount_source("ghost").unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert!(!fx.manifest().get_source("ghost").unwrap().mounted);
    }

    #[test]
    fn test_unknown_source_is_not_found() {
        let fx = Fixture::new();
        let engine = fx.engine();

        assert!(matches!(
            engine.mount_source("nobody"),
            Err(Error::SourceNotFound(_))
        ));
        assert!(matches!(
            engine.unmount_source("nobody"),
            Err(Error::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_foreign_file_is_reported_and_rest_applied() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt", "b.txt"]);
        fs::write(fx.root.join("mapkit/b.txt"), b"user file").unwrap();
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();

        let err = engine.mount_source("alpha").unwrap_err();
        match err {
            Error::Incomplete {
                operation,
                failures,
            } => {
                assert_eq!(operation, Operation::Mount);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].path, vp("b.txt"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let manifest = fx.manifest();
        assert_eq!(manifest.owner(&vp("a.txt")), Some("alpha"));
        assert_eq!(manifest.owner(&vp("b.txt")), None);
        assert_eq!(fs::read(fx.root.join("mapkit/b.txt")).unwrap(), b"user file");
    }

    #[test]
    fn test_cancelled_before_start_changes_nothing() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt", "b.txt", "c.txt"]);
        let token = CancellationToken::new();
        let engine = fx.engine().with_cancellation(token.clone());
        engine.register_source("alpha", None, 0).unwrap();

        token.cancel();
        let err = engine.mount_source("alpha").unwrap_err();

        assert!(matches!(err, Error::Cancelled { applied: 0, total: 3 }));
        assert!(fx.mounted("a.txt").is_none());
        let manifest = fx.manifest();
        assert!(manifest.mount_manifest.is_empty());
        assert!(!manifest.get_source("alpha").unwrap().mounted);
    }

    #[test]
    fn test_progress_reports_every_path() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt", "b.txt", "c/d.txt"]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let engine = fx.engine().with_progress(move |p: MountProgress| {
            sink.lock().unwrap().push((p.current, p.total));
        });
        engine.register_source("alpha", None, 0).unwrap();
        engine.mount_source("alpha").unwrap();

        let mut events = events.lock().unwrap().clone();
        events.sort();
        assert_eq!(events, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_concurrent_operation_is_locked_out() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();

        let _held = engine.store().lock().unwrap();
        assert!(matches!(engine.mount_source("alpha"), Err(Error::Locked(_))));
    }

    #[test]
    fn test_forget_requires_unmount() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();
        engine.mount_source("alpha").unwrap();

        assert!(matches!(
            engine.forget_source("alpha"),
            Err(Error::SourceMounted(_))
        ));

        engine.unmount_source("alpha").unwrap();
        engine.forget_source("alpha").unwrap();
        assert!(fx.manifest().source("alpha").is_none());
    }

    #[test]
    fn test_register_keeps_mount_state() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 0).unwrap();
        engine.mount_source("alpha").unwrap();

        let record = engine.register_source("ALPHA", Some("2.0.0"), 7).unwrap();

        assert_eq!(record.version, "2.0.0");
        assert_eq!(record.priority, 7);
        assert!(record.mounted);
        assert!(record.claims(&vp("a.txt")));
        assert_eq!(fx.manifest().mods.len(), 1);
    }

    #[test]
    fn test_refresh_game_patched_follows_marker() {
        let fx = Fixture::new();
        fx.write_base(&["a.txt"]);
        let engine = fx.engine();

        assert!(!engine.refresh_game_patched().unwrap());
        fs::write(fx.root.join("base/PATCHED"), b"").unwrap();
        assert!(engine.refresh_game_patched().unwrap());
        assert!(fx.manifest().game_patched);
    }

    #[test]
    fn test_status_does_not_create_manifest() {
        let fx = Fixture::new();
        let engine = fx.engine();

        let status = engine.status().unwrap();

        assert!(status.sources.is_empty());
        assert_eq!(status.mounted_paths, 0);
        assert!(!fx.root.join("timm.json").exists());
    }

    #[test]
    fn test_status_sorted_by_priority() {
        let fx = Fixture::new();
        fx.write_mod("alpha", &["a.txt"]);
        let engine = fx.engine();
        engine.register_source("alpha", None, 1).unwrap();
        engine.register_source("beta", None, 9).unwrap();
        engine.mount_source("alpha").unwrap();

        let status = engine.status().unwrap();
        let ids: Vec<&str> = status.sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["beta", "alpha"]);
        assert_eq!(status.mounted_paths, 1);
        assert_eq!(status.sources[1].claimed_paths, 1);
    }
}
