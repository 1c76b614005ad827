//! Backup bundle inspection and verification
//!
//! A bundle is one timestamped directory (`YYYYMMDD_HHMMSS`) containing
//! unseal material (`keys`), the operator root credential (`root-token`),
//! the CA chain (`ca/`), per-service certificates and AppRole credentials,
//! an optional saved environment file (`env.backup`), optional data
//! snapshots (`snapshots/`), and a `manifest.json` with sha256 checksums of
//! everything above. Bundles are both produced ([`create_bundle`]) and
//! consumed through this module; recovery never reaches into their layout
//! directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::Config;
use crate::fsutil;
use crate::{Error, Result, SECRET_DIR_MODE, SECRET_FILE_MODE};

/// One file entry in a bundle manifest.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ManifestEntry {
    /// File size at backup time
    pub size_bytes: u64,
    /// Checksum in `sha256:<hex>` form
    pub checksum: String,
}

/// The bundle manifest, `manifest.json` at the bundle root.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackupManifest {
    /// Bundle identifier, normally the directory name
    pub backup_id: String,
    /// Creation time, RFC 3339
    pub timestamp: String,
    /// Relative path to entry, for every file in the bundle
    pub files: BTreeMap<String, ManifestEntry>,
    /// Sum of all entry sizes
    pub total_size_bytes: u64,
}

/// Result of checksum verification over a bundle.
#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    /// Files whose checksum matched
    pub verified: usize,
    /// Manifest entries whose file is gone
    pub missing: Vec<String>,
    /// Files whose checksum differs from the manifest
    pub mismatched: Vec<String>,
}

impl VerifyReport {
    /// True when every manifest entry verified.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// An opened backup bundle.
#[derive(Clone, Debug)]
pub struct BackupBundle {
    dir: PathBuf,
    manifest: Option<BackupManifest>,
}

impl BackupBundle {
    /// Open a bundle directory.
    ///
    /// The manifest is optional: bundles written by older tooling lack one
    /// and can still be restored, just not verified.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::prerequisite(format!(
                "backup bundle {} does not exist",
                dir.display()
            )));
        }

        let manifest_path = dir.join("manifest.json");
        let manifest = if manifest_path.is_file() {
            let raw = std::fs::read_to_string(&manifest_path)
                .map_err(|e| Error::io(format!("reading {}", manifest_path.display()), e))?;
            Some(
                serde_json::from_str(&raw)
                    .map_err(|e| Error::serialization(format!("{}: {e}", manifest_path.display())))?,
            )
        } else {
            None
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    /// Bundle directory path
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Bundle identifier (the directory name)
    pub fn id(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dir.display().to_string())
    }

    /// Parsed manifest, when the bundle has one
    pub fn manifest(&self) -> Option<&BackupManifest> {
        self.manifest.as_ref()
    }

    /// True when the bundle carries unseal material
    pub fn has_unseal_material(&self) -> bool {
        self.dir.join("keys").is_file()
    }

    /// True when the bundle carries the operator root credential
    pub fn has_root_credential(&self) -> bool {
        self.dir.join("root-token").is_file()
    }

    /// True when the bundle carries a CA chain
    pub fn has_pki_chain(&self) -> bool {
        self.dir.join("ca").join("ca.crt").is_file()
    }

    /// Unseal material file
    pub fn keys_file(&self) -> PathBuf {
        self.dir.join("keys")
    }

    /// Root credential file
    pub fn root_token_file(&self) -> PathBuf {
        self.dir.join("root-token")
    }

    /// CA chain directory
    pub fn ca_dir(&self) -> PathBuf {
        self.dir.join("ca")
    }

    /// Per-service certificate material
    pub fn certs_dir(&self) -> PathBuf {
        self.dir.join("certs")
    }

    /// Per-service AppRole credentials
    pub fn approles_dir(&self) -> PathBuf {
        self.dir.join("approles")
    }

    /// Saved environment file, when present
    pub fn env_config(&self) -> Option<PathBuf> {
        let path = self.dir.join("env.backup");
        path.is_file().then_some(path)
    }

    /// Data snapshot by filename, when present
    pub fn data_snapshot(&self, filename: &str) -> Option<PathBuf> {
        let path = self.dir.join("snapshots").join(filename);
        path.is_file().then_some(path)
    }

    /// Verify every manifest entry's checksum.
    ///
    /// A bundle without a manifest is a prerequisite failure: recovery must
    /// not proceed on unverifiable material unless forced.
    pub fn verify(&self) -> Result<VerifyReport> {
        let manifest = self.manifest.as_ref().ok_or_else(|| {
            Error::prerequisite(format!("bundle {} has no manifest.json", self.id()))
        })?;

        let mut report = VerifyReport::default();
        for (rel, entry) in &manifest.files {
            let path = self.dir.join(rel);
            if !path.is_file() {
                report.missing.push(rel.clone());
                continue;
            }
            let actual = checksum_file(&path)?;
            if actual == entry.checksum {
                report.verified += 1;
            } else {
                debug!(file = %rel, expected = %entry.checksum, actual = %actual, "checksum mismatch");
                report.mismatched.push(rel.clone());
            }
        }
        Ok(report)
    }
}

/// Create a timestamped bundle from the on-disk state `config` points at.
///
/// Collects unseal material, the root credential, the CA chain, per-service
/// AppRole credentials and certificates, and the environment file, then
/// writes a manifest covering every copied file. Absent material is simply
/// not collected. Data snapshots come from external dump tooling and land
/// under `snapshots/` separately; they join the manifest on the next backup.
/// Everything in a bundle is treated as secret material (700 directories,
/// 600 files); restore reapplies the proper per-file modes.
pub fn create_bundle(config: &Config) -> Result<BackupBundle> {
    let now = chrono::Utc::now();
    let id = now.format("%Y%m%d_%H%M%S").to_string();
    let dir = config.backup_dir.join(&id);
    if dir.exists() {
        return Err(Error::prerequisite(format!(
            "bundle {id} already exists in {}",
            config.backup_dir.display()
        )));
    }
    fsutil::ensure_dir_with_mode(&config.backup_dir, SECRET_DIR_MODE)?;
    fsutil::ensure_dir_with_mode(&dir, SECRET_DIR_MODE)?;

    let mut files = BTreeMap::new();
    collect_file(&config.keys_file(), &dir, "keys", &mut files)?;
    collect_file(&config.root_token_file(), &dir, "root-token", &mut files)?;
    collect_file(&config.ca_dir().join("ca.crt"), &dir, "ca/ca.crt", &mut files)?;
    if let Some(env_file) = &config.env_file {
        collect_file(env_file, &dir, "env.backup", &mut files)?;
    }
    for spec in &config.services {
        collect_dir(
            &config.service_approle_dir(&spec.name),
            &dir,
            &format!("approles/{}", spec.name),
            &mut files,
        )?;
        collect_dir(
            &config.service_cert_dir(&spec.name),
            &dir,
            &format!("certs/{}", spec.name),
            &mut files,
        )?;
    }

    let total_size_bytes = files.values().map(|e| e.size_bytes).sum();
    let manifest = BackupManifest {
        backup_id: id.clone(),
        timestamp: now.to_rfc3339(),
        files,
        total_size_bytes,
    };
    let manifest_path = dir.join("manifest.json");
    let raw = serde_json::to_string_pretty(&manifest)
        .map_err(|e| Error::serialization(format!("{}: {e}", manifest_path.display())))?;
    std::fs::write(&manifest_path, raw)
        .map_err(|e| Error::io(format!("writing {}", manifest_path.display()), e))?;

    info!(
        bundle = %id,
        files = manifest.files.len(),
        bytes = manifest.total_size_bytes,
        "backup bundle created"
    );
    BackupBundle::open(&dir)
}

/// Copy one file into the bundle and record its manifest entry. Absent
/// sources are skipped.
fn collect_file(
    src: &Path,
    bundle: &Path,
    rel: &str,
    files: &mut BTreeMap<String, ManifestEntry>,
) -> Result<()> {
    if !src.is_file() {
        debug!(file = %rel, "not present, skipping");
        return Ok(());
    }
    let dst = bundle.join(rel);
    if let Some(parent) = dst.parent() {
        fsutil::ensure_dir_with_mode(parent, SECRET_DIR_MODE)?;
    }
    fsutil::copy_with_mode(src, &dst, SECRET_FILE_MODE)?;

    let size_bytes = std::fs::metadata(&dst)
        .map_err(|e| Error::io(format!("reading {}", dst.display()), e))?
        .len();
    files.insert(
        rel.to_string(),
        ManifestEntry {
            size_bytes,
            checksum: checksum_file(&dst)?,
        },
    );
    Ok(())
}

/// Copy a flat directory of files into the bundle.
fn collect_dir(
    src: &Path,
    bundle: &Path,
    rel: &str,
    files: &mut BTreeMap<String, ManifestEntry>,
) -> Result<()> {
    if !src.is_dir() {
        return Ok(());
    }
    let entries =
        std::fs::read_dir(src).map_err(|e| Error::io(format!("listing {}", src.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("listing {}", src.display()), e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        collect_file(&path, bundle, &format!("{rel}/{name}"), files)?;
    }
    Ok(())
}

/// `sha256:<hex>` checksum of a file's contents.
pub fn checksum_file(path: &Path) -> Result<String> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&raw))))
}

/// List bundles under `backup_dir`, newest first.
///
/// Bundle directory names sort chronologically (`YYYYMMDD_HHMMSS`), so
/// newest-first is a reverse name sort. Non-directories are ignored.
pub fn list_bundles(backup_dir: &Path) -> Result<Vec<BackupBundle>> {
    if !backup_dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(backup_dir)
        .map_err(|e| Error::io(format!("listing {}", backup_dir.display()), e))?;

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.reverse();

    dirs.iter().map(|d| BackupBundle::open(d)).collect()
}

/// Delete a bundle directory and everything in it.
pub fn remove_bundle(bundle: &BackupBundle) -> Result<()> {
    std::fs::remove_dir_all(bundle.path())
        .map_err(|e| Error::io(format!("removing {}", bundle.path().display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path, id: &str, with_manifest: bool) -> PathBuf {
        let bundle = dir.join(id);
        std::fs::create_dir_all(bundle.join("ca")).unwrap();
        std::fs::create_dir_all(bundle.join("snapshots")).unwrap();
        std::fs::write(bundle.join("keys"), "unseal-key-material").unwrap();
        std::fs::write(bundle.join("root-token"), "hvs.root").unwrap();
        std::fs::write(bundle.join("ca").join("ca.crt"), "CA PEM").unwrap();
        std::fs::write(bundle.join("snapshots").join("postgres.sql"), "DUMP").unwrap();

        if with_manifest {
            let mut files = BTreeMap::new();
            for rel in ["keys", "root-token", "ca/ca.crt", "snapshots/postgres.sql"] {
                let path = bundle.join(rel);
                files.insert(
                    rel.to_string(),
                    ManifestEntry {
                        size_bytes: std::fs::metadata(&path).unwrap().len(),
                        checksum: checksum_file(&path).unwrap(),
                    },
                );
            }
            let total = files.values().map(|e| e.size_bytes).sum();
            let manifest = BackupManifest {
                backup_id: id.to_string(),
                timestamp: "2026-08-01T00:00:00Z".to_string(),
                files,
                total_size_bytes: total,
            };
            std::fs::write(
                bundle.join("manifest.json"),
                serde_json::to_string_pretty(&manifest).unwrap(),
            )
            .unwrap();
        }
        bundle
    }

    #[test]
    fn open_reads_layout_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "20260801_120000", true);

        let bundle = BackupBundle::open(&path).unwrap();
        assert_eq!(bundle.id(), "20260801_120000");
        assert!(bundle.has_unseal_material());
        assert!(bundle.has_root_credential());
        assert!(bundle.has_pki_chain());
        assert!(bundle.env_config().is_none());
        assert!(bundle.data_snapshot("postgres.sql").is_some());
        assert!(bundle.data_snapshot("redis.rdb").is_none());
        assert_eq!(bundle.manifest().unwrap().files.len(), 4);
    }

    #[test]
    fn open_missing_bundle_is_a_prerequisite_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = BackupBundle::open(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_prerequisite());
    }

    #[test]
    fn verify_passes_on_untouched_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "20260801_120000", true);

        let bundle = BackupBundle::open(&path).unwrap();
        let report = bundle.verify().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.verified, 4);
    }

    #[test]
    fn verify_detects_tampering_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "20260801_120000", true);
        std::fs::write(path.join("keys"), "tampered").unwrap();
        std::fs::remove_file(path.join("root-token")).unwrap();

        let bundle = BackupBundle::open(&path).unwrap();
        let report = bundle.verify().unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.mismatched, vec!["keys".to_string()]);
        assert_eq!(report.missing, vec!["root-token".to_string()]);
        assert_eq!(report.verified, 2);
    }

    #[test]
    fn verify_without_manifest_is_a_prerequisite_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "20260801_120000", false);

        let bundle = BackupBundle::open(&path).unwrap();
        let err = bundle.verify().unwrap_err();
        assert!(err.is_prerequisite());
    }

    #[test]
    fn list_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "20260701_090000", true);
        write_bundle(dir.path(), "20260801_120000", true);
        write_bundle(dir.path(), "20251231_235959", true);
        // Stray file alongside bundles is ignored.
        std::fs::write(dir.path().join("README"), "not a bundle").unwrap();

        let bundles = list_bundles(dir.path()).unwrap();
        let ids: Vec<String> = bundles.iter().map(|b| b.id()).collect();
        assert_eq!(
            ids,
            vec!["20260801_120000", "20260701_090000", "20251231_235959"]
        );
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let bundles = list_bundles(&dir.path().join("absent")).unwrap();
        assert!(bundles.is_empty());
    }

    fn test_config(base: &Path) -> Config {
        let yaml = format!(
            r#"
base_dir: {base}/state
backup_dir: {base}/backups
policy_dir: {base}/policies
env_file: {base}/.env
services:
  - name: postgres
"#,
            base = base.display(),
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn create_collects_state_and_writes_a_clean_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        std::fs::create_dir_all(config.ca_dir()).unwrap();
        std::fs::create_dir_all(config.service_approle_dir("postgres")).unwrap();
        std::fs::create_dir_all(config.service_cert_dir("postgres")).unwrap();
        std::fs::write(config.keys_file(), "unseal").unwrap();
        std::fs::write(config.root_token_file(), "hvs.root").unwrap();
        std::fs::write(config.ca_dir().join("ca.crt"), "CA PEM").unwrap();
        std::fs::write(config.service_approle_dir("postgres").join("role-id"), "rid").unwrap();
        std::fs::write(
            config.service_approle_dir("postgres").join("secret-id"),
            "sid",
        )
        .unwrap();
        std::fs::write(config.service_cert_dir("postgres").join("server.crt"), "CERT").unwrap();
        std::fs::write(config.service_cert_dir("postgres").join("server.key"), "KEY").unwrap();
        std::fs::write(config.env_file.as_ref().unwrap(), "TOKEN=abc").unwrap();

        let bundle = create_bundle(&config).unwrap();
        assert!(bundle.has_unseal_material());
        assert!(bundle.has_root_credential());
        assert!(bundle.has_pki_chain());
        assert!(bundle.env_config().is_some());
        assert_eq!(bundle.manifest().unwrap().files.len(), 8);
        assert!(bundle.verify().unwrap().is_clean());

        let listed = list_bundles(&config.backup_dir).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), bundle.id());

        #[cfg(unix)]
        {
            use crate::fsutil::file_mode;
            assert_eq!(file_mode(bundle.path()), Some(0o700));
            assert_eq!(file_mode(&bundle.keys_file()), Some(0o600));
        }
    }

    #[test]
    fn create_skips_absent_material() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let bundle = create_bundle(&config).unwrap();
        assert!(!bundle.has_unseal_material());
        assert!(!bundle.has_root_credential());
        assert!(bundle.manifest().unwrap().files.is_empty());
        assert!(bundle.verify().unwrap().is_clean());
    }

    #[test]
    fn remove_deletes_the_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), "20260801_120000", true);
        let bundle = BackupBundle::open(&path).unwrap();

        remove_bundle(&bundle).unwrap();
        assert!(!path.exists());
    }
}
