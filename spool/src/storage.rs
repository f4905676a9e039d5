//! Out-of-line storage for sampler blobs.
//!
//! Profile reports can be large, so they live outside the database and the
//! request only keeps the blob name. Backends are not required to have a
//! local path: [`MemoryStorage`] has none.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::store::atomic;
use crate::{Error, Result};

/// Blob storage backend.
pub trait BlobStorage: Send + Sync {
    /// Write `content` under `name`, replacing any previous blob of that name.
    /// Returns the name the blob was stored under.
    fn save(&self, name: &str, content: &[u8]) -> Result<String>;

    /// Read a blob back.
    fn open(&self, name: &str) -> Result<Vec<u8>>;

    fn exists(&self, name: &str) -> bool;

    /// `proposed` if it is free, otherwise a variant with a random suffix.
    fn get_available_name(&self, proposed: &str) -> String {
        if !self.exists(proposed) {
            return proposed.to_string();
        }
        loop {
            let candidate = with_random_suffix(proposed);
            if !self.exists(&candidate) {
                return candidate;
            }
        }
    }

    /// Local filesystem path of a blob, for backends that have one.
    fn path(&self, _name: &str) -> Option<PathBuf> {
        None
    }

    /// Remove a blob. Returns false if it did not exist.
    fn delete(&self, name: &str) -> Result<bool>;
}

/// Deterministic blob name for a request's sampler report.
///
/// `<slug(path)>_<request id>.prof`, with the slug capped at 50 characters and
/// omitted when the path has no usable characters.
pub fn profile_blob_name(path: &str, request_id: &Uuid) -> String {
    let slug: String = slugify(path).chars().take(50).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        format!("{}.prof", request_id)
    } else {
        format!("{}_{}.prof", slug, request_id)
    }
}

/// Lowercase, alphanumerics kept, runs of anything else collapsed to `-`.
fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

fn with_random_suffix(name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect();
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, suffix, ext),
        _ => format!("{}_{}", name, suffix),
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(Error::Storage(format!("Invalid blob name: {:?}", name)));
    }
    Ok(())
}

/// Blobs as files in one directory.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStorage for FileSystemStorage {
    fn save(&self, name: &str, content: &[u8]) -> Result<String> {
        check_name(name)?;
        atomic::write_file(&self.root.join(name), content)?;
        Ok(name.to_string())
    }

    fn open(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let path = self.root.join(name);
        if !path.exists() {
            return Err(Error::NotFound(format!("blob {}", name)));
        }
        Ok(std::fs::read(path)?)
    }

    fn exists(&self, name: &str) -> bool {
        check_name(name).is_ok() && self.root.join(name).exists()
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        check_name(name).ok()?;
        Some(self.root.join(name))
    }

    fn delete(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        Ok(atomic::remove_file(&self.root.join(name))?)
    }
}

/// Blobs held in process memory. Useful for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStorage for MemoryStorage {
    fn save(&self, name: &str, content: &[u8]) -> Result<String> {
        check_name(name)?;
        self.blobs.lock().insert(name.to_string(), content.to_vec());
        Ok(name.to_string())
    }

    fn open(&self, name: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {}", name)))
    }

    fn exists(&self, name: &str) -> bool {
        self.blobs.lock().contains_key(name)
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.lock().remove(name).is_some())
    }
}
