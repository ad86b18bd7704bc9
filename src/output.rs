use crate::{
    Result,
    builder::Builder,
    error::Error,
    fs_access::FsAccess,
    value::{self, LoadListing},
};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Collects, validates, remaps, and checksums a finished job's outputs.
/// Owns the job's builder; the readers map holds snapshots of every
/// descriptor registered with the mutation manager so they can be released
/// even when collection fails.
pub struct OutputCollector {
    pub ports: Vec<Value>,
    pub builder: Builder,
    pub compute_checksum: bool,
    pub jobname: String,
    pub readers: IndexMap<String, Value>,
    pub cwl_version: Option<String>,
}

impl OutputCollector {
    /// Traverse the declared output ports (or a tool-written
    /// `cwl.output.json` manifest) against `outdir` and produce the output
    /// record keyed by port id fragment.
    pub fn collect(&mut self, outdir: &str, exit_code: i64) -> Result<Value> {
        if self.cwl_version.as_deref() != Some("v1.0") {
            self.builder
                .resources
                .insert("exitCode".into(), json!(exit_code));
        }
        let result = self.collect_ports(outdir);
        // Reader registrations must not leak, even on failure.
        if let Some(mm) = &self.builder.mutation_manager {
            for reader in self.readers.values() {
                if let Err(err) = mm.release_reader(&self.jobname, reader) {
                    warn!("[job {}] failed to release reader: {err}", self.jobname);
                }
            }
            self.readers.clear();
        }
        result
    }

    fn collect_ports(&self, outdir: &str) -> Result<Value> {
        let fs = (self.builder.make_fs_access)(outdir);
        let custom_output = fs.join(outdir, "cwl.output.json");
        let mut ret: Value = if fs.exists(&custom_output) {
            let mut rd = fs.open_read(&custom_output)?;
            let mut buf = String::new();
            rd.read_to_string(&mut buf)?;
            let v: Value = serde_json::from_str(&buf)?;
            debug!("[job {}] raw output from {custom_output}: {v}", self.jobname);
            v
        } else {
            let mut map = Map::new();
            for port in &self.ports {
                let id = port
                    .get("id")
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| Error::validation(format!("output port is missing 'id': {port}")))?;
                let fragment = value::shortname(id);
                let v = self.collect_output(port, outdir, &fs).map_err(|err| match err {
                    Error::Workflow(msg) => Error::Workflow(format!(
                        "Error collecting output for parameter '{fragment}':\n{msg}"
                    )),
                    other => other,
                })?;
                map.insert(fragment, v);
            }
            Value::Object(map)
        };
        if !value::is_empty_value(&ret) {
            value::adjust_dir_objs(&mut ret, &mut |d| {
                value::trim_listing(d);
                Ok(())
            })?;
            value::visit_class(&mut ret, value::FILE_AND_DIR, &mut |f| {
                revmap_file(&self.builder, outdir, f)
            })?;
            value::visit_class(&mut ret, value::FILE_AND_DIR, &mut |f| {
                value::remove_key(f, "path");
                Ok(())
            })?;
            value::normalize_files_dirs(&mut ret)?;
            value::visit_class(&mut ret, value::FILE_AND_DIR, &mut |f| {
                check_valid_locations(fs.as_ref(), f)
            })?;
            if self.compute_checksum {
                value::adjust_file_objs(&mut ret, &mut |f| compute_checksums(fs.as_ref(), f))?;
            }
        }
        self.validate_record(&ret)?;
        if let Some(mm) = &self.builder.mutation_manager {
            value::adjust_file_objs(&mut ret, &mut |f| mm.set_generation(f))?;
        }
        Ok(ret)
    }

    /// Non-strict structural validation of the output record: every
    /// declared port whose type union does not admit `null` must be
    /// present.
    fn validate_record(&self, ret: &Value) -> Result<()> {
        for port in &self.ports {
            let id = port.get("id").and_then(|i| i.as_str()).unwrap_or_default();
            let fragment = value::shortname(id);
            let (optional, _) = cardinality(port.get("type"));
            let missing = ret.get(&fragment).map(|v| v.is_null()).unwrap_or(true);
            if missing && !optional {
                return Err(Error::workflow(format!(
                    "Error validating output record: missing required output '{fragment}'\n in {}",
                    serde_json::to_string_pretty(ret).unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    fn collect_output(
        &self,
        schema: &Value,
        outdir: &str,
        fs: &Arc<dyn FsAccess>,
    ) -> Result<Value> {
        let builder = &self.builder;
        let mut result = Value::Null;
        if let Some(binding) = schema.get("outputBinding") {
            let outdir_path = if outdir.starts_with("file://") {
                value::uri_file_path(outdir)?
            } else {
                outdir.to_string()
            };
            let load_listing =
                LoadListing::from_value(schema.get("loadListing")).unwrap_or(builder.load_listing);
            let mut r: Vec<Value> = vec![];
            let mut globpatterns: Vec<String> = vec![];
            if let Some(glob) = binding.get("glob") {
                for gb in value::aslist(glob) {
                    let gb = builder.do_eval(&gb, None, true)?;
                    if value::is_empty_value(&gb) {
                        continue;
                    }
                    for g in value::aslist(&gb) {
                        let g = g.as_str().ok_or_else(|| {
                            Error::workflow(format!("glob patterns must be strings, got {g}"))
                        })?;
                        globpatterns.push(g.to_string());
                    }
                }
                for gb in globpatterns.clone() {
                    let mut gb = gb;
                    if let Some(rest) = gb.strip_prefix(&format!("{}/", builder.outdir)) {
                        gb = rest.to_string();
                    }
                    if gb == "." {
                        if load_listing.loads() {
                            return Err(Error::validation(
                                "a glob of '.' cannot be combined with loadListing",
                            ));
                        }
                        gb = outdir.to_string();
                    } else if gb.starts_with('/') {
                        return Err(Error::workflow("glob patterns must not start with '/'"));
                    }
                    let hits = match fs.glob(&fs.join(outdir, &gb)) {
                        Ok(hits) => hits,
                        Err(Error::Io(err)) => {
                            warn!("{err}");
                            continue;
                        }
                        Err(err) => {
                            error!("unexpected error from fs_access: {err}");
                            return Err(err);
                        }
                    };
                    for g in hits {
                        let host_path = value::abspath(&g, &outdir_path);
                        self.check_sandbox_escape(fs, &host_path, &outdir_path)?;
                        let rel = host_path
                            .strip_prefix(&format!("{}/", outdir_path.trim_end_matches('/')))
                            .unwrap_or("");
                        let sandbox_path = if rel.is_empty() {
                            builder.outdir.clone()
                        } else {
                            fs.join(&builder.outdir, rel)
                        };
                        let basename = value::basename_of(&g);
                        let (nameroot, nameext) = value::splitext(&basename);
                        let class = if fs.isfile(&g) { "File" } else { "Directory" };
                        r.push(json!({
                            "location": g,
                            "path": sandbox_path,
                            "basename": basename,
                            "nameroot": nameroot,
                            "nameext": nameext,
                            "class": class,
                        }));
                    }
                }
                for hit in r.iter_mut() {
                    if value::class_of(hit) == Some("Directory") {
                        if load_listing.loads() {
                            value::get_listing(fs.as_ref(), hit, load_listing.deep())?;
                        }
                    } else {
                        let location = value::location_of(hit)?.to_string();
                        if binding
                            .get("loadContents")
                            .and_then(|b| b.as_bool())
                            .unwrap_or(false)
                        {
                            let mut rd = fs.open_read(&location)?;
                            let bytes = value::content_limit_read(rd.as_mut())?;
                            let contents = String::from_utf8(bytes).map_err(|_| {
                                Error::workflow(format!(
                                    "contents of {location} are not valid UTF-8"
                                ))
                            })?;
                            hit["contents"] = json!(contents);
                        }
                        if self.compute_checksum {
                            hit["checksum"] = json!(stream_checksum(fs.as_ref(), &location)?);
                        }
                        hit["size"] = json!(fs.size(&location)?);
                    }
                }
            }
            let (optional, single) = cardinality(schema.get("type"));
            result = if let Some(oe) = binding.get("outputEval") {
                builder.do_eval(oe, Some(&Value::Array(r.clone())), true)?
            } else {
                Value::Array(r)
            };
            if single {
                if value::is_empty_value(&result) {
                    if !optional {
                        return Err(Error::workflow(format!(
                            "Did not find output file with glob pattern: {globpatterns:?}"
                        )));
                    }
                } else if let Value::Array(items) = &result {
                    if items.len() > 1 {
                        return Err(Error::workflow(
                            "Multiple matches for output item that is a single file.",
                        ));
                    }
                    result = items[0].clone();
                }
            }
            if let Some(sfs) = schema.get("secondaryFiles") {
                let was_array = result.is_array();
                let mut primaries = value::aslist(&result);
                for primary in primaries.iter_mut() {
                    if !primary.is_object() {
                        continue;
                    }
                    if primary.get("secondaryFiles").is_none() {
                        primary["secondaryFiles"] = json!([]);
                    }
                    let ppath = primary
                        .get("path")
                        .and_then(|p| p.as_str())
                        .ok_or_else(|| {
                            Error::workflow(format!(
                                "cannot resolve secondary files of output without a path: {primary}"
                            ))
                        })?
                        .to_string();
                    let pathprefix = match ppath.rfind('/') {
                        Some(i) => ppath[..=i].to_string(),
                        None => String::new(),
                    };
                    for sf in value::aslist(sfs) {
                        let required = match sf.get("required") {
                            Some(req) => builder
                                .do_eval(req, Some(&*primary), true)?
                                .as_bool()
                                .unwrap_or(false),
                            None => false,
                        };
                        // v1.0 writes secondaryFiles as bare pattern strings.
                        let pattern = match &sf {
                            Value::String(s) => s.as_str(),
                            _ => sf.get("pattern").and_then(|p| p.as_str()).ok_or_else(|| {
                                Error::validation(format!(
                                    "secondaryFiles entry is missing 'pattern': {sf}"
                                ))
                            })?,
                        };
                        let sfpath = if pattern.contains("$(") || pattern.contains("${") {
                            builder.do_eval(&json!(pattern), Some(&*primary), true)?
                        } else {
                            let basename = primary
                                .get("basename")
                                .and_then(|b| b.as_str())
                                .unwrap_or_default();
                            json!(substitute(basename, pattern))
                        };
                        for sfitem in value::aslist(&sfpath) {
                            if value::is_empty_value(&sfitem) {
                                continue;
                            }
                            let mut sfitem = match sfitem {
                                Value::String(s) => json!({"path": format!("{pathprefix}{s}")}),
                                other => other,
                            };
                            let sf_path = sfitem
                                .get("path")
                                .and_then(|p| p.as_str())
                                .map(String::from);
                            if let Some(p) = &sf_path {
                                if !fs.exists(p) && required {
                                    return Err(Error::workflow(format!(
                                        "Missing required secondary file '{p}'"
                                    )));
                                }
                            }
                            if sfitem.get("path").is_some() && sfitem.get("location").is_none() {
                                revmap_file(builder, outdir, &mut sfitem)?;
                            }
                            let Some(location) =
                                sfitem.get("location").and_then(|l| l.as_str()).map(String::from)
                            else {
                                continue;
                            };
                            if fs.isfile(&location) {
                                sfitem["class"] = json!("File");
                            } else if fs.isdir(&location) {
                                sfitem["class"] = json!("Directory");
                            } else {
                                continue;
                            }
                            if let Some(list) = primary
                                .get_mut("secondaryFiles")
                                .and_then(|l| l.as_array_mut())
                            {
                                list.push(sfitem);
                            }
                        }
                    }
                }
                result = if was_array {
                    Value::Array(primaries)
                } else {
                    primaries.into_iter().next().unwrap_or(Value::Null)
                };
            }
            if let Some(fmt) = schema.get("format") {
                let was_array = result.is_array();
                let mut primaries = value::aslist(&result);
                for primary in primaries.iter_mut() {
                    if primary.is_object() {
                        let fv = builder.do_eval(fmt, Some(&*primary), true)?;
                        primary["format"] = fv;
                    }
                }
                result = if was_array {
                    Value::Array(primaries)
                } else {
                    primaries.into_iter().next().unwrap_or(Value::Null)
                };
            }
            // Outputs must point at host locations, not sandbox paths.
            value::adjust_file_objs(&mut result, &mut |f| revmap_file(builder, outdir, f))?;
            if value::is_empty_value(&result) && optional {
                // Literal 0 and "" survive; [] and null collapse to null.
                return Ok(match &result {
                    Value::Number(_) | Value::String(_) => result,
                    _ => Value::Null,
                });
            }
        }
        if let Some(t) = schema.get("type") {
            if t.get("type").and_then(|tt| tt.as_str()) == Some("record") {
                let mut out = Map::new();
                if let Some(fields) = t.get("fields").and_then(|f| f.as_array()) {
                    for field in fields {
                        let name = field
                            .get("name")
                            .and_then(|n| n.as_str())
                            .ok_or_else(|| {
                                Error::validation(format!("record field is missing 'name': {field}"))
                            })?;
                        out.insert(
                            value::shortname(name),
                            self.collect_output(field, outdir, fs)?,
                        );
                    }
                }
                return Ok(Value::Object(out));
            }
        }
        Ok(result)
    }

    /// Reject glob hits whose canonical path leaves the canonical output
    /// directory, unless they resolve to a non-writable staged input
    /// (pass-through).
    fn check_sandbox_escape(
        &self,
        fs: &Arc<dyn FsAccess>,
        host_path: &str,
        outdir_path: &str,
    ) -> Result<()> {
        let rp = fs.realpath(host_path);
        let outdir_rp = fs.realpath(outdir_path);
        if path_within(&rp, &outdir_rp) {
            return Ok(());
        }
        let passthrough = self
            .builder
            .pathmapper
            .as_ref()
            .is_some_and(|pm| pm.items().any(|(_, e)| e.resolved == rp && !e.kind.is_writable()));
        if passthrough {
            return Ok(());
        }
        Err(Error::workflow(format!(
            "Output file path {rp} must be within designated output directory ({outdir_rp}) or an input file pass through."
        )))
    }
}

fn path_within(path: &str, dir: &str) -> bool {
    let dir = dir.trim_end_matches('/');
    path == dir || path.starts_with(&format!("{dir}/"))
}

fn cardinality(t: Option<&Value>) -> (bool, bool) {
    let mut optional = false;
    let mut single = false;
    match t {
        Some(Value::Array(items)) => {
            for item in items {
                match item.as_str() {
                    Some("null") => optional = true,
                    Some("File" | "Directory") => single = true,
                    _ => {}
                }
            }
        }
        Some(Value::String(s)) => {
            if s == "File" || s == "Directory" {
                single = true;
            }
        }
        _ => {}
    }
    (optional, single)
}

/// Secondary-file pattern substitution: each leading `^` strips one
/// extension from the basename, the remainder is appended.
pub fn substitute(value: &str, replace: &str) -> String {
    if let Some(rest) = replace.strip_prefix('^') {
        match value.rfind('.') {
            Some(i) => substitute(&value[..i], rest),
            None => format!("{value}{}", replace.trim_start_matches('^')),
        }
    } else {
        format!("{value}{replace}")
    }
}

/// Remap a file observed inside the sandbox back to a host location.
/// Recognizes staged inputs through the path mapper, rebases sandbox
/// output paths onto the host output directory, and rejects anything that
/// escapes both.
pub fn revmap_file(builder: &Builder, outdir: &str, f: &mut Value) -> Result<()> {
    let outdir_uri = if outdir.contains("://") {
        outdir.to_string()
    } else {
        value::file_uri(outdir)
    };
    if f.get("location").is_some() && f.get("path").is_none() {
        let location = value::location_of(f)?.to_string();
        if location.starts_with("file://") {
            f["path"] = json!(value::uri_file_path(&location)?);
        } else {
            return Ok(());
        }
    }
    if let Some(path) = f.get("path").and_then(|p| p.as_str()).map(String::from) {
        let uripath = value::file_uri(&path);
        value::remove_key(f, "path");
        if f.get("basename").is_none() {
            f["basename"] = json!(value::basename_of(&path));
        }
        let pm = builder
            .pathmapper
            .as_ref()
            .ok_or_else(|| Error::validation("cannot reverse-map without a path mapper"))?;
        if let Some((loc, resolved)) = pm
            .reversemap(&path)
            .map(|(l, r)| (l.to_string(), r.to_string()))
        {
            if !pm.mapper(&loc)?.kind.is_writable() {
                f["location"] = json!(resolved);
                return Ok(());
            }
        }
        if uripath == outdir_uri || uripath.starts_with(&format!("{outdir_uri}/")) {
            f["location"] = json!(uripath);
        } else if path == builder.outdir
            || path.starts_with(&format!("{}/", builder.outdir.trim_end_matches('/')))
        {
            let rel = path
                .get(builder.outdir.trim_end_matches('/').len() + 1..)
                .unwrap_or("");
            f["location"] = if rel.is_empty() {
                json!(outdir_uri)
            } else {
                json!(builder.fs_access.join(&outdir_uri, rel))
            };
        } else if !Path::new(&path).is_absolute() {
            f["location"] = json!(builder.fs_access.join(&outdir_uri, &path));
        } else {
            return Err(Error::workflow(format!(
                "Output file path {path} must be within designated output directory ({}) or an input file pass through.",
                builder.outdir
            )));
        }
        return Ok(());
    }
    Err(Error::workflow(format!(
        "Output File object is missing both 'location' and 'path' fields: {f}"
    )))
}

fn check_valid_locations(fs: &dyn FsAccess, ob: &Value) -> Result<()> {
    let location = value::location_of(ob)?;
    if location.starts_with("_:") {
        return Ok(());
    }
    match value::class_of(ob) {
        Some("File") if !fs.isfile(location) => Err(Error::validation(format!(
            "Does not exist or is not a File: '{location}'"
        ))),
        Some("Directory") if !fs.isdir(location) => Err(Error::validation(format!(
            "Does not exist or is not a Directory: '{location}'"
        ))),
        _ => Ok(()),
    }
}

/// Fill in a streamed SHA-1 checksum where one is not already present.
pub fn compute_checksums(fs: &dyn FsAccess, f: &mut Value) -> Result<()> {
    if f.get("checksum").is_none() {
        let location = value::location_of(f)?.to_string();
        f["checksum"] = json!(stream_checksum(fs, &location)?);
    }
    Ok(())
}

fn stream_checksum(fs: &dyn FsAccess, location: &str) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut rd = fs.open_read(location)?;
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = rd.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha1${}", hex::encode(hasher.finalize())))
}
