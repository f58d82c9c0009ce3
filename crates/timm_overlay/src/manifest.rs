//! Persisted mount manifest (`timm.json`).
//!
//! The manifest is the single source of truth for what is mounted: every entry
//! of `mountManifest` must correspond to exactly one link in the mount root,
//! pointing at the file of the recorded owner. The engine loads it, mutates it
//! in memory while it links and unlinks, and persists it once at the end of the
//! operation.
//!
//! # JSON format
//!
//! ```json
//! {
//!   "gamePatched": false,
//!   "mods": [
//!     {
//!       "id": "alpha",
//!       "version": "1.0.0",
//!       "priority": 5,
//!       "mounted": true,
//!       "claims": { "weapons/knife.model": true }
//!     }
//!   ],
//!   "mountManifest": { "weapons/knife.model": "alpha" }
//! }
//! ```
//!
//! Loading is strict. Anything that does not match the schema, or breaks the
//! owner/claim relationship, is rejected as [`Error::CorruptManifest`] rather
//! than being repaired.

use crate::error::{Error, Result};
use crate::path::VirtualPath;
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;

/// Reserved id of the base-content source. Never a valid mod id.
pub const BASE_CONTENT_ID: &str = "_BaseGameContent";

/// Version recorded for sources registered without one.
pub const DEFAULT_SOURCE_VERSION: &str = "0.0.1";

fn default_version() -> String {
    DEFAULT_SOURCE_VERSION.to_string()
}

/// Turn a mod name into a source id.
///
/// Ids are the lower-cased name. Names must be non-empty slugs (letters, digits,
/// `-`, `_`) and must not collide with [`BASE_CONTENT_ID`].
pub fn source_id_from_name(name: &str) -> Result<String> {
    let id = name.trim().to_lowercase();
    let is_slug = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_');

    if !is_slug || id.eq_ignore_ascii_case(BASE_CONTENT_ID) {
        return Err(Error::InvalidSourceId(name.to_string()));
    }
    Ok(id)
}

/// Per-source record stored in `mods`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceRecord {
    /// Lower-case mod name, or [`BASE_CONTENT_ID`].
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Higher wins conflicts. Ignored for the base-content record.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mounted: bool,
    /// Paths this source currently owns in the mount root.
    #[serde(default)]
    pub claims: BTreeMap<VirtualPath, bool>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, version: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            priority,
            mounted: false,
            claims: BTreeMap::new(),
        }
    }

    /// Record for the base-content provider.
    pub fn base_content() -> Self {
        Self::new(BASE_CONTENT_ID, DEFAULT_SOURCE_VERSION, 0)
    }

    pub fn is_base_content(&self) -> bool {
        self.id == BASE_CONTENT_ID
    }

    pub fn claims(&self, path: &VirtualPath) -> bool {
        self.claims.get(path).copied().unwrap_or(false)
    }

    /// Number of paths this source currently claims.
    pub fn claim_count(&self) -> usize {
        self.claims.values().filter(|claimed| **claimed).count()
    }
}

/// The full persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub game_patched: bool,
    #[serde(default)]
    pub mods: Vec<SourceRecord>,
    /// Virtual path -> owning source id, one entry per live link.
    #[serde(default)]
    pub mount_manifest: BTreeMap<VirtualPath, String>,
}

impl Manifest {
    /// Look up a source record. Ids compare case-insensitively.
    pub fn source(&self, id: &str) -> Option<&SourceRecord> {
        self.mods.iter().find(|s| s.id.eq_ignore_ascii_case(id))
    }

    pub fn source_mut(&mut self, id: &str) -> Option<&mut SourceRecord> {
        self.mods.iter_mut().find(|s| s.id.eq_ignore_ascii_case(id))
    }

    /// Like [`source`](Self::source) but fails with [`Error::SourceNotFound`].
    pub fn get_source(&self, id: &str) -> Result<&SourceRecord> {
        self.source(id)
            .ok_or_else(|| Error::SourceNotFound(id.to_string()))
    }

    /// Replace the record with the same id, or append a new one.
    pub fn upsert_source(&mut self, record: SourceRecord) {
        match self.source_mut(&record.id) {
            Some(existing) => *existing = record,
            None => self.mods.push(record),
        }
    }

    /// Remove a source record, returning it if it existed.
    pub fn remove_source(&mut self, id: &str) -> Option<SourceRecord> {
        let idx = self.mods.iter().position(|s| s.id.eq_ignore_ascii_case(id))?;
        Some(self.mods.remove(idx))
    }

    /// The spelling `path` is mounted under, if it is mounted.
    pub fn mounted_path(&self, path: &VirtualPath) -> Option<&VirtualPath> {
        self.mount_manifest.get_key_value(path).map(|(mounted, _)| mounted)
    }

    /// Current owner of `path`, if it is mounted.
    pub fn owner(&self, path: &VirtualPath) -> Option<&str> {
        self.mount_manifest.get(path).map(String::as_str)
    }

    /// All mounted paths owned by `id`.
    pub fn owned_by(&self, id: &str) -> Vec<VirtualPath> {
        self.mount_manifest
            .iter()
            .filter(|(_, owner)| owner.eq_ignore_ascii_case(id))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Record `id` as the owner of `path`, moving the claim away from any
    /// previous owner. The caller must have linked the path already.
    pub fn assign(&mut self, path: &VirtualPath, id: &str) {
        if let Some(previous) = self.mount_manifest.insert(path.clone(), id.to_string()) {
            if !previous.eq_ignore_ascii_case(id) {
                if let Some(record) = self.source_mut(&previous) {
                    record.claims.remove(path);
                }
            }
        }
        if let Some(record) = self.source_mut(id) {
            record.claims.insert(path.clone(), true);
        }
    }

    /// Forget `path` entirely. The caller must have removed the link already.
    pub fn release(&mut self, path: &VirtualPath) -> Option<String> {
        let previous = self.mount_manifest.remove(path)?;
        if let Some(record) = self.source_mut(&previous) {
            record.claims.remove(path);
        }
        Some(previous)
    }

    /// Mount entries whose owner has no source record.
    pub fn unknown_owners(&self) -> Vec<(VirtualPath, String)> {
        self.mount_manifest
            .iter()
            .filter(|(_, owner)| self.source(owner).is_none())
            .map(|(path, owner)| (path.clone(), owner.clone()))
            .collect()
    }

    /// Check the invariants that serde cannot express.
    fn validate(&self, path: &Utf8Path) -> Result<()> {
        let mut seen = HashSet::new();
        for record in &self.mods {
            let well_formed = record.is_base_content()
                || source_id_from_name(&record.id).is_ok_and(|id| id == record.id);
            if !well_formed {
                return Err(Error::corrupt(
                    path,
                    format!("invalid source id '{}'", record.id),
                ));
            }
            if !seen.insert(record.id.to_lowercase()) {
                return Err(Error::corrupt(
                    path,
                    format!("duplicate source id '{}'", record.id),
                ));
            }
        }

        for (virtual_path, owner) in &self.mount_manifest {
            match self.source(owner) {
                Some(record) if !record.claims(virtual_path) => {
                    return Err(Error::corrupt(
                        path,
                        format!(
                            "'{}' is mounted from '{}' but not in its claims",
                            virtual_path, owner
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    tracing::warn!(
                        "Manifest entry '{}' references unknown source '{}'",
                        virtual_path,
                        owner
                    );
                }
            }
        }

        Ok(())
    }
}

/// Loads and atomically saves the [`Manifest`] at a fixed location.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: Utf8PathBuf,
}

impl ManifestStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn lock_path(&self) -> Utf8PathBuf {
        self.path.with_extension(match self.path.extension() {
            Some(ext) => format!("{}.lock", ext),
            None => "lock".to_string(),
        })
    }

    /// Load and validate the manifest.
    ///
    /// A missing file is an I/O error; use [`load_or_create`](Self::load_or_create)
    /// when a fresh install is expected.
    pub fn load(&self) -> Result<Manifest> {
        let contents = fs::read_to_string(self.path.as_std_path())?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .map_err(|e| Error::corrupt(&self.path, e.to_string()))?;
        manifest.validate(&self.path)?;
        Ok(manifest)
    }

    /// Load the manifest, writing the default document first if none exists.
    pub fn load_or_create(&self) -> Result<Manifest> {
        if !self.path.as_std_path().exists() {
            tracing::info!("Creating manifest at {}", self.path);
            self.save(&Manifest::default())?;
        }
        self.load()
    }

    /// Persist the manifest.
    ///
    /// The document is written to a temporary file next to the target, synced,
    /// and renamed over it, so readers observe either the old or the new
    /// manifest and never a partial one.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let contents = serde_json::to_string_pretty(manifest)?;
        self.write_atomic(contents.as_bytes())
            .map_err(|source| Error::WriteFailure {
                path: self.path.clone(),
                source,
            })
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_str().is_empty() => p.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())?;

        let mut temp = tempfile::NamedTempFile::new_in(parent.as_std_path())?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(self.path.as_std_path())
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Take the exclusive mount lock. Held for the duration of one operation.
    pub fn lock(&self) -> Result<ManifestLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path.as_std_path())?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(ManifestLock { file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(Error::Locked(lock_path))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Guard for the mount critical section. Released on drop.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release manifest lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    fn store_in(dir: &tempfile::TempDir) -> ManifestStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        ManifestStore::new(root.join("timm.json"))
    }

    fn sample_manifest() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.upsert_source(SourceRecord::new("alpha", "1.0.0", 5));
        manifest.upsert_source(SourceRecord::new("beta", "0.2.0", 1));
        manifest.assign(&vp("weapons/knife.model"), "alpha");
        manifest.source_mut("alpha").unwrap().mounted = true;
        manifest
    }

    #[test]
    fn test_default_document() {
        let manifest = Manifest::default();
        let json = serde_json::to_string(&manifest).unwrap();
        assert_eq!(json, r#"{"gamePatched":false,"mods":[],"mountManifest":{}}"#);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let manifest = sample_manifest();

        store.save(&manifest).unwrap();
        let first = fs::read_to_string(store.path()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, manifest);

        store.save(&loaded).unwrap();
        let second = fs::read_to_string(store.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let manifest = store.load_or_create().unwrap();
        assert_eq!(manifest, Manifest::default());
        assert!(store.path().exists());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"mods":[{"id":"alpha"}]}"#).unwrap();

        let manifest = store.load().unwrap();
        let alpha = manifest.get_source("alpha").unwrap();
        assert_eq!(alpha.version, DEFAULT_SOURCE_VERSION);
        assert_eq!(alpha.priority, 0);
        assert!(!alpha.mounted);
        assert!(!manifest.game_patched);
    }

    #[test]
    fn test_invalid_json_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{ invalid json }").unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptManifest { .. })));
    }

    #[test]
    fn test_unknown_field_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"gamePatched":true,"extra":1}"#).unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptManifest { .. })));
    }

    #[test]
    fn test_duplicate_ids_are_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"mods":[{"id":"alpha"},{"id":"alpha"}]}"#).unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptManifest { .. })));
    }

    #[test]
    fn test_upper_case_id_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"mods":[{"id":"Alpha"}]}"#).unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptManifest { .. })));
    }

    #[test]
    fn test_malformed_ids_are_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        for id in ["", "../../outside", "with space", " alpha", "_basegamecontent"] {
            let doc = serde_json::json!({ "mods": [{ "id": id }] });
            fs::write(store.path(), doc.to_string()).unwrap();
            assert!(
                matches!(store.load(), Err(Error::CorruptManifest { .. })),
                "id {id:?} was accepted"
            );
        }

        fs::write(store.path(), r#"{"mods":[{"id":"_BaseGameContent"}]}"#).unwrap();
        assert!(store.load().unwrap().source(BASE_CONTENT_ID).is_some());
    }

    #[test]
    fn test_mounted_path_keeps_first_spelling() {
        let mut manifest = sample_manifest();
        manifest.assign(&vp("Maps/Depot.bsp"), "alpha");
        manifest.assign(&vp("maps/depot.bsp"), "beta");

        assert_eq!(manifest.mount_manifest.len(), 2);
        assert_eq!(
            manifest.mounted_path(&vp("MAPS/DEPOT.BSP")).map(VirtualPath::as_str),
            Some("Maps/Depot.bsp")
        );
        assert_eq!(manifest.owner(&vp("maps/depot.bsp")), Some("beta"));
        assert_eq!(manifest.get_source("alpha").unwrap().claim_count(), 1);
    }

    #[test]
    fn test_unnormalized_path_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"mods":[{"id":"alpha","claims":{"./a.txt":true}}]}"#,
        )
        .unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptManifest { .. })));
    }

    #[test]
    fn test_owner_without_claim_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"mods":[{"id":"alpha"}],"mountManifest":{"a.txt":"alpha"}}"#,
        )
        .unwrap();

        assert!(matches!(store.load(), Err(Error::CorruptManifest { .. })));
    }

    #[test]
    fn test_unknown_owner_is_tolerated() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), r#"{"mountManifest":{"a.txt":"gone"}}"#).unwrap();

        let manifest = store.load().unwrap();
        assert_eq!(
            manifest.unknown_owners(),
            vec![(vp("a.txt"), "gone".to_string())]
        );
    }

    #[test]
    fn test_assign_moves_claim() {
        let mut manifest = sample_manifest();
        let knife = vp("weapons/knife.model");

        manifest.assign(&knife, "beta");

        assert_eq!(manifest.owner(&knife), Some("beta"));
        assert!(!manifest.get_source("alpha").unwrap().claims(&knife));
        assert!(manifest.get_source("beta").unwrap().claims(&knife));
    }

    #[test]
    fn test_release_drops_claim() {
        let mut manifest = sample_manifest();
        let knife = vp("weapons/knife.model");

        assert_eq!(manifest.release(&knife), Some("alpha".to_string()));
        assert_eq!(manifest.owner(&knife), None);
        assert_eq!(manifest.get_source("alpha").unwrap().claim_count(), 0);
        assert_eq!(manifest.release(&knife), None);
    }

    #[test]
    fn test_source_lookup_is_case_insensitive() {
        let manifest = sample_manifest();
        assert!(manifest.source("ALPHA").is_some());
        assert!(matches!(
            manifest.get_source("gamma"),
            Err(Error::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let mut manifest = sample_manifest();
        manifest.upsert_source(SourceRecord::new("beta", "0.3.0", 9));

        assert_eq!(manifest.mods.len(), 2);
        assert_eq!(manifest.get_source("beta").unwrap().priority, 9);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample_manifest()).unwrap();
        store.save(&Manifest::default()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["timm.json".to_string()]);
    }

    #[test]
    fn test_source_id_from_name() {
        assert_eq!(source_id_from_name("Better-Knives").unwrap(), "better-knives");
        assert_eq!(source_id_from_name(" hd_maps ").unwrap(), "hd_maps");
        assert!(source_id_from_name("").is_err());
        assert!(source_id_from_name("two words").is_err());
        assert!(source_id_from_name("../escape").is_err());
        assert!(source_id_from_name("_basegamecontent").is_err());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let guard = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(Error::Locked(_))));
        drop(guard);
        assert!(store.lock().is_ok());
    }
}
