use crate::{Result, error::Error, value};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    File,
    Directory,
    WritableFile,
    WritableDirectory,
    CreateFile,
    CreateWritableFile,
}

impl MapType {
    pub fn for_class(class: &str, writable: bool) -> Result<Self> {
        match (class, writable) {
            ("File", false) => Ok(Self::File),
            ("File", true) => Ok(Self::WritableFile),
            ("Directory", false) => Ok(Self::Directory),
            ("Directory", true) => Ok(Self::WritableDirectory),
            _ => Err(Error::validation(format!(
                "cannot map descriptor class '{class}'"
            ))),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            Self::WritableFile | Self::WritableDirectory | Self::CreateWritableFile
        )
    }

    /// Entries whose content is synthesized from an inline literal rather
    /// than copied from a host path.
    pub fn is_create(&self) -> bool {
        matches!(self, Self::CreateFile | Self::CreateWritableFile)
    }
}

#[derive(Debug, Clone)]
pub struct MapperEntry {
    /// Host-side source: a host path, or the literal contents for Create* kinds.
    pub resolved: String,
    /// In-sandbox path the descriptor is staged at.
    pub target: String,
    pub kind: MapType,
    pub staged: bool,
}

/// Bidirectional mapping between host locations and staged in-sandbox
/// paths for every File/Directory referenced by a job, directly or
/// through secondaryFiles and directory listings. Iteration order matches
/// insertion order.
pub struct PathMapper {
    map: IndexMap<String, MapperEntry>,
    stagedir: String,
    separate_dirs: bool,
}

impl PathMapper {
    pub fn new(
        referenced: &[Value],
        basedir: &str,
        stagedir: &str,
        separate_dirs: bool,
    ) -> Result<Self> {
        let mut pm = Self {
            map: IndexMap::new(),
            stagedir: stagedir.trim_end_matches('/').to_string(),
            separate_dirs,
        };
        for fob in referenced {
            let stagedir = if pm.separate_dirs {
                format!("{}/stg{}", pm.stagedir, uuid::Uuid::new_v4().simple())
            } else {
                pm.stagedir.clone()
            };
            let writable = fob.get("writable").and_then(|w| w.as_bool()).unwrap_or(false);
            pm.visit(fob, &stagedir, basedir, writable, true)?;
        }
        Ok(pm)
    }

    fn visit(
        &mut self,
        obj: &Value,
        stagedir: &str,
        basedir: &str,
        copy: bool,
        staged: bool,
    ) -> Result<()> {
        let basename = obj
            .get("basename")
            .and_then(|b| b.as_str())
            .ok_or_else(|| Error::validation(format!("descriptor is missing 'basename': {obj}")))?;
        let location = value::location_of(obj)?;
        if self.map.contains_key(location) {
            return Ok(());
        }
        let tgt = format!("{}/{}", stagedir.trim_end_matches('/'), basename);
        match value::class_of(obj) {
            Some("Directory") => {
                let resolved = if location.starts_with("file://") {
                    value::uri_file_path(location)?
                } else {
                    location.to_string()
                };
                let kind = MapType::for_class("Directory", copy)?;
                self.map.insert(
                    location.to_string(),
                    MapperEntry {
                        resolved,
                        target: tgt.clone(),
                        kind,
                        staged,
                    },
                );
                // Children of a directory that exists on the host come along
                // with the directory itself.
                let staged = if location.starts_with("file://") {
                    false
                } else {
                    staged
                };
                if let Some(listing) = obj.get("listing").and_then(|l| l.as_array()) {
                    for child in listing {
                        self.visit(child, &tgt, basedir, copy, staged)?;
                    }
                }
            }
            Some("File") => {
                if location.starts_with("_:") && obj.get("contents").is_some() {
                    let contents = obj
                        .get("contents")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let kind = if copy {
                        MapType::CreateWritableFile
                    } else {
                        MapType::CreateFile
                    };
                    self.map.insert(
                        location.to_string(),
                        MapperEntry {
                            resolved: contents,
                            target: tgt,
                            kind,
                            staged,
                        },
                    );
                } else {
                    let ab = value::abspath(location, basedir);
                    let kind = MapType::for_class("File", copy)?;
                    self.map.insert(
                        location.to_string(),
                        MapperEntry {
                            resolved: deref_links(&ab),
                            target: tgt,
                            kind,
                            staged,
                        },
                    );
                    // Secondary files live next to their primary.
                    if let Some(sfs) = obj.get("secondaryFiles").and_then(|l| l.as_array()) {
                        for sf in sfs {
                            self.visit(sf, stagedir, basedir, copy, staged)?;
                        }
                    }
                }
            }
            other => {
                return Err(Error::validation(format!(
                    "expected File or Directory, got {other:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn mapper(&self, location: &str) -> Result<&MapperEntry> {
        self.map
            .get(location)
            .ok_or_else(|| Error::workflow(format!("location '{location}' is not in the path map")))
    }

    pub fn contains(&self, location: &str) -> bool {
        self.map.contains_key(location)
    }

    /// Inverse lookup by staged target. Returns `(location, resolved)`.
    pub fn reversemap(&self, target: &str) -> Option<(&str, &str)> {
        self.map
            .iter()
            .find(|(_, e)| e.target == target)
            .map(|(k, e)| (k.as_str(), e.resolved.as_str()))
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|k| k.as_str())
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &MapperEntry)> {
        self.map.iter().map(|(k, e)| (k.as_str(), e))
    }

    /// Replace an entry in place, e.g. when the initial work directory pins
    /// a file to a specific target under the job's output directory.
    pub fn update(
        &mut self,
        location: &str,
        resolved: String,
        target: String,
        kind: MapType,
        staged: bool,
    ) {
        self.map.insert(
            location.to_string(),
            MapperEntry {
                resolved,
                target,
                kind,
                staged,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn deref_links(path: &str) -> String {
    let mut p = PathBuf::from(path);
    loop {
        match std::fs::symlink_metadata(&p) {
            Ok(md) if md.file_type().is_symlink() => match std::fs::read_link(&p) {
                Ok(rl) => {
                    p = if rl.is_absolute() {
                        rl
                    } else {
                        p.parent().map(|d| d.join(&rl)).unwrap_or(rl)
                    };
                }
                Err(_) => break,
            },
            _ => break,
        }
    }
    p.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(location: &str, basename: &str) -> Value {
        json!({"class": "File", "location": location, "basename": basename})
    }

    #[test]
    fn maps_and_reversemaps_every_entry() {
        let refs = vec![
            file("file:///data/in.txt", "in.txt"),
            file("file:///data/other.txt", "other.txt"),
        ];
        let pm = PathMapper::new(&refs, "/data", "/stage", true).unwrap();
        for loc in pm.files().map(|l| l.to_string()).collect::<Vec<_>>() {
            let ent = pm.mapper(&loc).unwrap();
            let (rloc, rres) = pm.reversemap(&ent.target).unwrap();
            assert_eq!(rloc, loc);
            assert_eq!(rres, ent.resolved);
        }
    }

    #[test]
    fn separate_dirs_gives_each_file_its_own_segment() {
        let refs = vec![
            file("file:///data/a.txt", "a.txt"),
            file("file:///data/b.txt", "b.txt"),
        ];
        let pm = PathMapper::new(&refs, "/data", "/stage", true).unwrap();
        let a = pm.mapper("file:///data/a.txt").unwrap().target.clone();
        let b = pm.mapper("file:///data/b.txt").unwrap().target.clone();
        assert!(a.starts_with("/stage/stg"));
        assert!(b.starts_with("/stage/stg"));
        assert_ne!(
            a.rsplit_once('/').unwrap().0,
            b.rsplit_once('/').unwrap().0
        );
    }

    #[test]
    fn shared_stagedir_without_separate_dirs() {
        let refs = vec![file("file:///data/a.txt", "a.txt")];
        let pm = PathMapper::new(&refs, "/data", "/stage", false).unwrap();
        assert_eq!(pm.mapper("file:///data/a.txt").unwrap().target, "/stage/a.txt");
    }

    #[test]
    fn secondary_files_stage_adjacent_to_primary() {
        let mut primary = file("file:///data/x.bam", "x.bam");
        primary["secondaryFiles"] = json!([file("file:///data/x.bam.bai", "x.bam.bai")]);
        let pm = PathMapper::new(&[primary], "/data", "/stage", true).unwrap();
        let p = pm.mapper("file:///data/x.bam").unwrap().target.clone();
        let s = pm.mapper("file:///data/x.bam.bai").unwrap().target.clone();
        assert_eq!(
            p.rsplit_once('/').unwrap().0,
            s.rsplit_once('/').unwrap().0
        );
    }

    #[test]
    fn literal_contents_map_to_create_entries() {
        let f = json!({
            "class": "File",
            "location": "_:lit0",
            "basename": "conf.ini",
            "contents": "a=1",
            "writable": true,
        });
        let pm = PathMapper::new(&[f], "/data", "/stage", false).unwrap();
        let ent = pm.mapper("_:lit0").unwrap();
        assert_eq!(ent.kind, MapType::CreateWritableFile);
        assert_eq!(ent.resolved, "a=1");
        assert_eq!(ent.target, "/stage/conf.ini");
    }

    #[test]
    fn update_replaces_entry_in_place() {
        let refs = vec![file("file:///data/a.txt", "a.txt")];
        let mut pm = PathMapper::new(&refs, "/data", "/stage", false).unwrap();
        pm.update(
            "file:///data/a.txt",
            "/data/a.txt".into(),
            "/out/a.txt".into(),
            MapType::WritableFile,
            false,
        );
        let ent = pm.mapper("file:///data/a.txt").unwrap();
        assert_eq!(ent.target, "/out/a.txt");
        assert!(ent.kind.is_writable());
        assert!(!ent.staged);
    }

    #[test]
    fn directory_listing_children_are_mapped_under_parent() {
        let d = json!({
            "class": "Directory",
            "location": "file:///data/ref",
            "basename": "ref",
            "listing": [file("file:///data/ref/genome.fa", "genome.fa")],
        });
        let pm = PathMapper::new(&[d], "/data", "/stage", false).unwrap();
        let dir = pm.mapper("file:///data/ref").unwrap().target.clone();
        let child = pm.mapper("file:///data/ref/genome.fa").unwrap();
        assert_eq!(child.target, format!("{dir}/genome.fa"));
        assert!(!child.staged);
    }
}
