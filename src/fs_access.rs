use crate::{Result, value};
use globset::{GlobBuilder, GlobSetBuilder};
use itertools::Itertools;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Narrow filesystem capability used by the execution core. Locations may
/// be plain paths or `file://` URIs; implementations may be backed by a
/// real filesystem, an in-memory tree, or a remote store. The core never
/// applies platform path operations to locations directly.
pub trait FsAccess: Send + Sync {
    fn glob(&self, pattern: &str) -> Result<Vec<String>>;
    fn open_read(&self, location: &str) -> Result<Box<dyn Read>>;
    fn exists(&self, location: &str) -> bool;
    fn isfile(&self, location: &str) -> bool;
    fn isdir(&self, location: &str) -> bool;
    fn size(&self, location: &str) -> Result<u64>;
    fn listdir(&self, location: &str) -> Result<Vec<String>>;

    fn join(&self, base: &str, child: &str) -> String {
        if child.starts_with('/') || child.starts_with("file://") {
            return child.to_string();
        }
        if base.ends_with('/') {
            format!("{base}{child}")
        } else {
            format!("{base}/{child}")
        }
    }

    /// Canonicalize a location, resolving symlinks. Virtual filesystems may
    /// return the input unchanged.
    fn realpath(&self, location: &str) -> String;
}

pub struct StdFsAccess {
    basedir: PathBuf,
}

impl StdFsAccess {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
        }
    }

    fn abs(&self, location: &str) -> PathBuf {
        if location.starts_with("file://") {
            return value::uri_file_path(location)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(location.trim_start_matches("file://")));
        }
        let p = Path::new(location);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.basedir.join(p)
        }
    }
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

impl FsAccess for StdFsAccess {
    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let abs = self.abs(pattern);
        let pattern_str = abs.to_string_lossy().into_owned();
        if !has_glob_meta(&pattern_str) {
            return Ok(if abs.exists() {
                vec![value::file_uri(&pattern_str)]
            } else {
                vec![]
            });
        }
        // Walk from the deepest literal directory prefix; everything below
        // it is matched against the full pattern.
        let mut root = PathBuf::new();
        let mut rest: Vec<String> = vec![];
        for comp in abs.components() {
            let s = comp.as_os_str().to_string_lossy();
            if rest.is_empty() && !has_glob_meta(&s) {
                root.push(comp);
            } else {
                rest.push(s.into_owned());
            }
        }
        if root.as_os_str().is_empty() {
            root = PathBuf::from("/");
        }
        let glob = GlobBuilder::new(&pattern_str)
            .literal_separator(true)
            .empty_alternates(true)
            .build()?;
        let mut gsb = GlobSetBuilder::new();
        gsb.add(glob);
        let gs = gsb.build()?;
        let max_depth = if rest.iter().any(|c| c.contains("**")) {
            None
        } else {
            Some(rest.len())
        };
        let mut wb = ignore::WalkBuilder::new(&root);
        wb.hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .follow_links(false)
            .max_depth(max_depth);
        let mut hits = vec![];
        for entry in wb.build() {
            let entry = entry?;
            let p = entry.path();
            if p == root.as_path() {
                continue;
            }
            if gs.is_match(p) {
                hits.push(value::file_uri(&p.to_string_lossy()));
            }
        }
        Ok(hits.into_iter().sorted().collect())
    }

    fn open_read(&self, location: &str) -> Result<Box<dyn Read>> {
        Ok(Box::new(File::open(self.abs(location))?))
    }

    fn exists(&self, location: &str) -> bool {
        self.abs(location).exists()
    }

    fn isfile(&self, location: &str) -> bool {
        self.abs(location).is_file()
    }

    fn isdir(&self, location: &str) -> bool {
        self.abs(location).is_dir()
    }

    fn size(&self, location: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.abs(location))?.len())
    }

    fn listdir(&self, location: &str) -> Result<Vec<String>> {
        let mut entries = vec![];
        for entry in std::fs::read_dir(self.abs(location))? {
            let entry = entry?;
            entries.push(value::file_uri(&entry.path().to_string_lossy()));
        }
        Ok(entries.into_iter().sorted().collect())
    }

    fn realpath(&self, location: &str) -> String {
        let abs = self.abs(location);
        std::fs::canonicalize(&abs)
            .unwrap_or(abs)
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_literal_and_star() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("c.log"), "c").unwrap();
        let fs = StdFsAccess::new("/");

        let lit = fs
            .glob(&dir.path().join("a.txt").to_string_lossy())
            .unwrap();
        assert_eq!(lit.len(), 1);
        assert!(lit[0].ends_with("/a.txt"));

        let hits = fs.glob(&dir.path().join("*.txt").to_string_lossy()).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].ends_with("/a.txt"));
        assert!(hits[1].ends_with("/b.txt"));
    }

    #[test]
    fn glob_does_not_cross_separators() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let fs = StdFsAccess::new("/");
        let hits = fs.glob(&dir.path().join("*.txt").to_string_lossy()).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].ends_with("/b.txt"));
    }

    #[test]
    fn join_keeps_absolute_children() {
        let fs = StdFsAccess::new("/");
        assert_eq!(fs.join("/out", "result"), "/out/result");
        assert_eq!(fs.join("/out/", "result"), "/out/result");
        assert_eq!(fs.join("/out", "/abs"), "/abs");
    }

    #[test]
    fn listdir_returns_sorted_uris() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b"), "").unwrap();
        std::fs::write(dir.path().join("a"), "").unwrap();
        let fs = StdFsAccess::new("/");
        let ls = fs.listdir(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(ls.len(), 2);
        assert!(ls[0].ends_with("/a"));
        assert!(ls[1].ends_with("/b"));
    }
}
