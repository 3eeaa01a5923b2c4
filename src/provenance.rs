// src/provenance.rs
//
// =============================================================================
// REPX-LAB: CONTENT STORE & NOTARY
// =============================================================================
//
// The Trust Layer.
//
// Responsibilities:
// 1. Hashing: SHA-256 of byte slices (job identity, manifests) and files.
// 2. Content Addressable Storage: `store/<sha256>`, one copy per content.
// 3. Atomic Renames: a store entry appears complete or not at all.
// 4. Linking: lab paths point into the store with relative symlinks.
// 5. Notarisation: re-hash a packaged file and compare with the manifest.

use crate::error::{BuildError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

pub const STORE_DIR: &str = "store";

// ============================================================================
// 1. HASHING UTILITIES
// ============================================================================

/// SHA-256 of a file, streamed.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .map_err(|e| BuildError::io(format!("opening {} for hashing", path.display()), e))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let count = file
            .read(&mut buffer)
            .map_err(|e| BuildError::io(format!("reading {}", path.display()), e))?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a byte slice (e.g. canonical JSON).
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// 2. CONTENT ADDRESSABLE STORAGE (CAS)
// ============================================================================

/// Flat store under `<lab_root>/store`.
pub struct ArtifactStore {
    lab_root: PathBuf,
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(lab_root: impl AsRef<Path>) -> Result<Self> {
        let lab_root = lab_root.as_ref().to_path_buf();
        let root = lab_root.join(STORE_DIR);
        fs::create_dir_all(&root)
            .map_err(|e| BuildError::io(format!("creating store {}", root.display()), e))?;
        Ok(Self { lab_root, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Stores `data` under its hash. Existing entries are reused.
    /// Returns: (The Hash, The Final Path)
    pub fn put_bytes(&self, data: &[u8], executable: bool) -> Result<(String, PathBuf)> {
        let hash = sha256_bytes(data);
        let final_path = self.path_of(&hash);

        if !final_path.exists() {
            // Write next to the target, then rename so readers never see a
            // partial entry.
            let temp_path = self.root.join(format!(".tmp-{hash}"));
            let mut file = File::create(&temp_path)
                .map_err(|e| BuildError::io(format!("creating {}", temp_path.display()), e))?;
            file.write_all(data)
                .and_then(|_| file.sync_all())
                .map_err(|e| BuildError::io(format!("writing {}", temp_path.display()), e))?;
            fs::rename(&temp_path, &final_path)
                .map_err(|e| BuildError::io(format!("committing {}", final_path.display()), e))?;

            if let Ok(dir) = File::open(&self.root) {
                let _ = dir.sync_all();
            }
        }

        if executable {
            set_executable(&final_path)?;
        }
        Ok((hash, final_path))
    }

    /// Copies a file into the store.
    pub fn put_file(&self, src: impl AsRef<Path>, executable: bool) -> Result<(String, PathBuf)> {
        let src = src.as_ref();
        let data = fs::read(src).map_err(|e| BuildError::io(format!("reading {}", src.display()), e))?;
        self.put_bytes(&data, executable)
    }

    /// Makes `lab_root/rel` point at the store entry `hash`.
    pub fn link(&self, hash: &str, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        let dest = self.lab_root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
        }
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(&dest)
                .map_err(|e| BuildError::io(format!("replacing {}", dest.display()), e))?;
        }
        link_into_store(&self.path_of(hash), &relative_target(rel, hash), &dest)?;
        Ok(dest)
    }
}

/// `a/b/c` -> `../../store/<hash>`.
fn relative_target(rel: &Path, hash: &str) -> PathBuf {
    let depth = rel
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
        .saturating_sub(1);
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.push(STORE_DIR);
    target.push(hash);
    target
}

#[cfg(unix)]
fn link_into_store(_absolute: &Path, relative: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(relative, dest)
        .map_err(|e| BuildError::io(format!("linking {}", dest.display()), e))
}

#[cfg(not(unix))]
fn link_into_store(absolute: &Path, _relative: &Path, dest: &Path) -> Result<()> {
    fs::copy(absolute, dest)
        .map(|_| ())
        .map_err(|e| BuildError::io(format!("copying into {}", dest.display()), e))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| BuildError::io(format!("setting permissions on {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

// ============================================================================
// 3. NOTARY
// ============================================================================

pub struct Notary;

impl Notary {
    /// Checks that `path` hashes to `expected`; returns the actual hash.
    pub fn verify(path: &Path, expected: &str) -> Result<String> {
        if !path.exists() {
            return Err(BuildError::validation(
                format!("file {}", path.display()),
                "listed in the manifest but missing",
            ));
        }

        let actual = sha256_file(path)?;
        if actual != expected {
            return Err(BuildError::validation(
                format!("file {}", path.display()),
                format!("integrity violation: expected {expected}, found {actual}"),
            ));
        }
        Ok(actual)
    }
}
