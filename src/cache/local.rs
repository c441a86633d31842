use std::fs;
use std::io::ErrorKind;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use super::{ArtifactStore, EntryKey, StoredEntry};
use crate::core::Hash32;

/// Cache stored in a directory on the local filesystem.
///
/// ```text
/// <root>/artifacts/<value hash>
/// <root>/entries/<entity>/<entry digest>.json
/// ```
///
/// Artifacts are content addressed and written at most once. Entries are
/// small JSON documents pointing at an artifact.
#[derive(Clone, Debug)]
pub struct LocalCache {
    root: Utf8PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn artifact_path(&self, hash: Hash32) -> Utf8PathBuf {
        self.root.join("artifacts").join(hash.to_hex())
    }

    fn entry_path(&self, key: &EntryKey) -> Utf8PathBuf {
        self.root
            .join("entries")
            .join(sanitize(&key.entity))
            .join(key.digest.to_hex())
            .with_extension("json")
    }
}

/// Entity names may contain characters that are awkward in file names, e.g.
/// tuple descriptors like `<a, b>`. The result is always a single plain
/// path component: never empty, never starting with a dot.
fn sanitize(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '.' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() || sanitized.starts_with('.') {
        sanitized.insert(0, '_');
    }

    sanitized
}

fn read_optional(path: &Utf8Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Couldn't read {path}")),
    }
}

fn write_file(path: &Utf8Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;
    }

    fs::write(path, bytes).with_context(|| format!("Couldn't write {path}"))
}

impl ArtifactStore for LocalCache {
    fn read_entry(&self, key: &EntryKey) -> anyhow::Result<Option<StoredEntry>> {
        let path = self.entry_path(key);

        match read_optional(&path)? {
            Some(bytes) => {
                let entry = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Malformed cache entry {path}"))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn write_entry(&self, key: &EntryKey, entry: &StoredEntry) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_file(&self.entry_path(key), &bytes)
    }

    fn read_artifact(&self, hash: Hash32) -> anyhow::Result<Option<Vec<u8>>> {
        read_optional(&self.artifact_path(hash))
    }

    fn write_artifact(&self, hash: Hash32, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.artifact_path(hash);

        if !path.exists() {
            write_file(&path, bytes)?;
        }

        Ok(())
    }
}
