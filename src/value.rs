use crate::{Result, error::Error, fs_access::FsAccess};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use url::Url;

/// Inline `contents` payloads are capped at this many bytes.
pub const CONTENT_LIMIT: usize = 64 * 1024;

pub const FILE_AND_DIR: &[&str] = &["File", "Directory"];

/// Walk a JSON value depth-first and invoke `f` on every object whose
/// `class` is one of `classes`. The object is visited before its children,
/// so `f` may rewrite fields that the recursion then descends into.
pub fn visit_class<F>(v: &mut Value, classes: &[&str], f: &mut F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    match v {
        Value::Object(_) => {
            let matched = v
                .get("class")
                .and_then(|c| c.as_str())
                .map(|c| classes.contains(&c))
                .unwrap_or(false);
            if matched {
                f(v)?;
            }
            if let Value::Object(map) = v {
                for (_, child) in map.iter_mut() {
                    visit_class(child, classes, f)?;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                visit_class(item, classes, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

pub fn adjust_file_objs<F>(v: &mut Value, f: &mut F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    visit_class(v, &["File"], f)
}

pub fn adjust_dir_objs<F>(v: &mut Value, f: &mut F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    visit_class(v, &["Directory"], f)
}

/// Clone every object with a matching `class` out of a JSON tree, in
/// depth-first order. Nested descriptors (secondaryFiles, listings) are
/// collected as their own entries in addition to their parents.
pub fn collect_class(v: &Value, classes: &[&str]) -> Vec<Value> {
    let mut out = vec![];
    collect_class_into(v, classes, &mut out);
    out
}

fn collect_class_into(v: &Value, classes: &[&str], out: &mut Vec<Value>) {
    match v {
        Value::Object(map) => {
            if v.get("class")
                .and_then(|c| c.as_str())
                .map(|c| classes.contains(&c))
                .unwrap_or(false)
            {
                out.push(v.clone());
            }
            for (_, child) in map.iter() {
                collect_class_into(child, classes, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_class_into(item, classes, out);
            }
        }
        _ => {}
    }
}

pub fn class_of(v: &Value) -> Option<&str> {
    v.get("class").and_then(|c| c.as_str())
}

pub fn location_of(v: &Value) -> Result<&str> {
    v.get("location")
        .and_then(|l| l.as_str())
        .ok_or_else(|| Error::validation(format!("descriptor is missing 'location': {v}")))
}

pub fn remove_key(v: &mut Value, key: &str) {
    if let Some(map) = v.as_object_mut() {
        map.remove(key);
    }
}

pub fn aslist(v: &Value) -> Vec<Value> {
    match v {
        Value::Array(a) => a.clone(),
        other => vec![other.clone()],
    }
}

/// JavaScript-style emptiness, used for output cardinality decisions.
pub fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

pub fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fill in `location`, `basename`, `nameroot` and `nameext` on every
/// File/Directory in the tree. Anonymous literals get a `_:`-prefixed
/// location.
pub fn normalize_files_dirs(v: &mut Value) -> Result<()> {
    visit_class(v, FILE_AND_DIR, &mut add_location)
}

fn add_location(d: &mut Value) -> Result<()> {
    let class = class_of(d).unwrap_or_default().to_string();
    if d.get("location").is_none() {
        if let Some(p) = d.get("path").cloned() {
            d["location"] = p;
            remove_key(d, "path");
        } else if class == "File" {
            if d.get("contents").is_none() {
                return Err(Error::validation(
                    "anonymous file object must have 'contents' and 'basename' fields",
                ));
            }
            d["location"] = json!(format!("_:{}", uuid::Uuid::new_v4()));
        } else {
            if d.get("listing").is_none() || d.get("basename").is_none() {
                return Err(Error::validation(
                    "anonymous directory object must have 'listing' and 'basename' fields",
                ));
            }
            d["location"] = json!(format!("_:{}", uuid::Uuid::new_v4()));
        }
    }
    let location = location_of(d)?.to_string();
    if let Some(stripped) = location.strip_suffix('/') {
        if class != "Directory" {
            return Err(Error::validation(format!(
                "location '{location}' ends with a slash but is not a Directory"
            )));
        }
        d["location"] = json!(stripped);
    }
    let location = location_of(d)?.to_string();
    let has_basename = d
        .get("basename")
        .and_then(|b| b.as_str())
        .is_some_and(|b| !b.is_empty());
    if !has_basename {
        d["basename"] = json!(basename_of(&location));
    }
    if class == "File" {
        let basename = d["basename"].as_str().unwrap_or_default().to_string();
        let (nameroot, nameext) = splitext(&basename);
        if d.get("nameroot").and_then(|n| n.as_str()) != Some(&nameroot) {
            d["nameroot"] = json!(nameroot);
        }
        if d.get("nameext").and_then(|n| n.as_str()) != Some(&nameext) {
            d["nameext"] = json!(nameext);
        }
    }
    Ok(())
}

/// Drop materialized listings from directories that can be re-listed from
/// their `file://` location.
pub fn trim_listing(d: &mut Value) {
    let local = d
        .get("location")
        .and_then(|l| l.as_str())
        .is_some_and(|l| l.starts_with("file://"));
    if local && d.get("listing").is_some() {
        remove_key(d, "listing");
    }
}

/// Materialize a directory's `listing` through the filesystem access
/// object. `recursive` corresponds to the deep_listing policy.
pub fn get_listing(fs: &dyn FsAccess, rec: &mut Value, recursive: bool) -> Result<()> {
    if rec.get("listing").is_some() {
        return Ok(());
    }
    let loc = location_of(rec)?.to_string();
    let mut listing = vec![];
    for ld in fs.listdir(&loc)? {
        let basename = basename_of(&ld);
        if fs.isdir(&ld) {
            let mut ent = json!({"class": "Directory", "location": ld, "basename": basename});
            if recursive {
                get_listing(fs, &mut ent, recursive)?;
            }
            listing.push(ent);
        } else {
            listing.push(json!({"class": "File", "location": ld, "basename": basename}));
        }
    }
    rec["listing"] = Value::Array(listing);
    Ok(())
}

/// Last fragment of a port or tool id, e.g. `file:///t.cwl#step/out` -> `out`.
pub fn shortname(id: &str) -> String {
    let frag = id.rsplit_once('#').map(|(_, f)| f).unwrap_or(id);
    frag.rsplit('/').next().unwrap_or(frag).to_string()
}

static JOB_NAMES: LazyLock<DashMap<String, u32>> = LazyLock::new(DashMap::new);

/// Process-unique job names: the first use of a stem is returned as-is,
/// later uses get `_2`, `_3`, ... appended.
pub fn uniquename(stem: &str) -> String {
    let mut count = JOB_NAMES.entry(stem.to_string()).or_insert(0);
    *count += 1;
    if *count == 1 {
        stem.to_string()
    } else {
        format!("{stem}_{}", *count)
    }
}

pub fn file_uri(path: &str) -> String {
    if path.starts_with("file://") {
        return path.to_string();
    }
    match Url::from_file_path(path) {
        Ok(u) => u.to_string(),
        Err(_) => format!("file://{path}"),
    }
}

pub fn uri_file_path(uri: &str) -> Result<String> {
    let url =
        Url::parse(uri).map_err(|e| Error::validation(format!("not a file URI: {uri}: {e}")))?;
    url.to_file_path()
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|_| Error::validation(format!("not a file URI: {uri}")))
}

/// Resolve a location to a host path, relative to `basedir` when it is not
/// already absolute or a `file://` URI.
pub fn abspath(src: &str, basedir: &str) -> String {
    if src.starts_with("file://") {
        return uri_file_path(src).unwrap_or_else(|_| src.trim_start_matches("file://").to_string());
    }
    if Path::new(src).is_absolute() {
        src.to_string()
    } else {
        Path::new(basedir).join(src).to_string_lossy().into_owned()
    }
}

pub fn basename_of(location: &str) -> String {
    let loc = location.strip_suffix('/').unwrap_or(location);
    if let Some(rest) = loc.strip_prefix("_:") {
        return rest.to_string();
    }
    if loc.starts_with("file://") {
        if let Ok(path) = uri_file_path(loc) {
            return Path::new(&path)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
    }
    loc.rsplit('/').next().unwrap_or(loc).to_string()
}

/// `os.path.splitext` semantics: the extension is the suffix from the last
/// dot, but a name consisting only of leading dots has no extension.
pub fn splitext(basename: &str) -> (String, String) {
    match basename.rfind('.') {
        Some(i) if !basename[..i].trim_start_matches('.').is_empty() => {
            (basename[..i].to_string(), basename[i..].to_string())
        }
        _ => (basename.to_string(), String::new()),
    }
}

/// Read at most CONTENT_LIMIT bytes from a file opened for `contents`
/// loading.
pub fn content_limit_read(r: &mut dyn Read) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; CONTENT_LIMIT];
    let mut total = 0;
    while total < CONTENT_LIMIT {
        let n = r.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);
    Ok(buf)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadListing {
    #[default]
    NoListing,
    ShallowListing,
    DeepListing,
}

impl LoadListing {
    pub fn from_value(v: Option<&Value>) -> Option<Self> {
        match v.and_then(|v| v.as_str()) {
            Some("no_listing") => Some(Self::NoListing),
            Some("shallow_listing") => Some(Self::ShallowListing),
            Some("deep_listing") => Some(Self::DeepListing),
            _ => None,
        }
    }

    pub fn loads(&self) -> bool {
        !matches!(self, Self::NoListing)
    }

    pub fn deep(&self) -> bool {
        matches!(self, Self::DeepListing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortname_strips_fragment_and_path() {
        assert_eq!(shortname("file:///t.cwl#main/out"), "out");
        assert_eq!(shortname("file:///t.cwl#msg"), "msg");
        assert_eq!(shortname("msg"), "msg");
    }

    #[test]
    fn splitext_matches_python() {
        assert_eq!(splitext("x.bam"), ("x".into(), ".bam".into()));
        assert_eq!(splitext(".bashrc"), (".bashrc".into(), String::new()));
        assert_eq!(splitext("noext"), ("noext".into(), String::new()));
        assert_eq!(splitext("a.tar.gz"), ("a.tar".into(), ".gz".into()));
    }

    #[test]
    fn normalize_fills_names() {
        let mut v = json!({"class": "File", "location": "file:///data/in.txt"});
        normalize_files_dirs(&mut v).unwrap();
        assert_eq!(v["basename"], "in.txt");
        assert_eq!(v["nameroot"], "in");
        assert_eq!(v["nameext"], ".txt");
    }

    #[test]
    fn normalize_moves_path_to_location() {
        let mut v = json!({"class": "File", "path": "/data/in.txt"});
        normalize_files_dirs(&mut v).unwrap();
        assert_eq!(v["location"], "/data/in.txt");
        assert!(v.get("path").is_none());
    }

    #[test]
    fn normalize_rejects_contentless_anonymous_file() {
        let mut v = json!({"class": "File"});
        assert!(normalize_files_dirs(&mut v).is_err());
        let mut v = json!({"class": "File", "contents": "hi", "basename": "x"});
        normalize_files_dirs(&mut v).unwrap();
        assert!(v["location"].as_str().unwrap().starts_with("_:"));
    }

    #[test]
    fn uniquename_appends_counter() {
        let a = uniquename("stem-for-test");
        let b = uniquename("stem-for-test");
        assert_eq!(a, "stem-for-test");
        assert_eq!(b, "stem-for-test_2");
    }

    #[test]
    fn visit_class_reaches_nested_descriptors() {
        let mut v = json!({
            "f": {"class": "File", "location": "file:///a", "secondaryFiles": [
                {"class": "File", "location": "file:///b"}
            ]}
        });
        let mut seen = vec![];
        visit_class(&mut v, &["File"], &mut |f| {
            seen.push(f["location"].as_str().unwrap().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["file:///a", "file:///b"]);
    }
}
