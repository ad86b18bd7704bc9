use crate::{Result, job::ProcessStatus};
use md5::{Digest, Md5};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Canonical JSON for hashing: object keys sorted recursively, compact
/// separators. Identical inputs produce identical bytes on every machine.
pub fn canonical_json(v: &Value) -> String {
    fn sort(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), sort(&map[k.as_str()]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(v).to_string()
}

/// Content-addressed identifier of a tool invocation.
pub fn cache_key(keydict: &Value) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical_json(keydict).as_bytes());
    hex::encode(hasher.finalize())
}

/// The advisory-locked `.status` file that guards one cache entry. A
/// shared lock is held while deciding hit or miss; a miss upgrades to an
/// exclusive lock for the duration of the job, and the final status write
/// releases it. Readers therefore never observe a half-populated cache
/// directory: `success` is written last.
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Open the status file (creating it if absent), take a shared lock,
    /// and read the current status token.
    pub fn open_shared(path: &Path) -> Result<(Self, String)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        fs2::FileExt::lock_shared(&file)?;
        let mut status = String::new();
        file.read_to_string(&mut status)?;
        Ok((
            Self {
                file,
                path: path.to_path_buf(),
            },
            status,
        ))
    }

    /// Upgrade to an exclusive lock. This is the writer serialization
    /// point: at most one process populates a given cache key.
    pub fn upgrade(&self) -> Result<()> {
        fs2::FileExt::lock_exclusive(&self.file)?;
        Ok(())
    }

    /// Truncate, write the final status token, and release the lock by
    /// closing the file.
    pub fn commit(mut self, status: ProcessStatus) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(status.to_string().as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn cache_key_is_deterministic_and_order_insensitive() {
        let a = json!({"cmdline": ["echo", "hello"], "stdout": "out.txt"});
        let b = json!({"stdout": "out.txt", "cmdline": ["echo", "hello"]});
        assert_eq!(cache_key(&a), cache_key(&a));
        assert_eq!(cache_key(&a), cache_key(&b));
        // argv order is significant
        let c = json!({"cmdline": ["hello", "echo"], "stdout": "out.txt"});
        assert_ne!(cache_key(&a), cache_key(&c));
    }

    #[test]
    fn status_roundtrip_through_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.status");
        let (lock, status) = CacheLock::open_shared(&path).unwrap();
        assert_eq!(status, "");
        lock.upgrade().unwrap();
        lock.commit(ProcessStatus::Success).unwrap();
        let (_lock, status) = CacheLock::open_shared(&path).unwrap();
        assert_eq!(status, "success");
    }

    #[test]
    fn failed_status_tokens_are_spelled_like_cwl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.status");
        let (lock, _) = CacheLock::open_shared(&path).unwrap();
        lock.upgrade().unwrap();
        lock.commit(ProcessStatus::PermanentFail).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "permanentFail");
    }
}
