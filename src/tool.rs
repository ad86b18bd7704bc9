use crate::{
    Result,
    builder::{Binding, Builder},
    cache::{self, CacheLock},
    error::Error,
    job::{CallbackJob, CommandJob, ContainerBackend, ExpressionJob, OutputCallback, Prepared},
    output::OutputCollector,
    path_mapper::{MapType, PathMapper},
    runtime::RuntimeContext,
    value::{self, LoadListing},
};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Value, json};
use shell_quote::QuoteInto;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;

static ACCEPTLIST_STRICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._+-]+$").expect("acceptlist regex"));

const INTERESTING_REQUIREMENTS: [&str; 5] = [
    "DockerRequirement",
    "EnvVarRequirement",
    "InitialWorkDirRequirement",
    "ShellCommandRequirement",
    "NetworkAccess",
];

/// The three CWL process classes this crate can prepare.
pub enum Tool {
    CommandLine(CommandLineTool),
    Expression(ExpressionTool),
    Operation(AbstractOperation),
}

impl Tool {
    pub fn from_value(tool: Value) -> Result<Self> {
        match tool.get("class").and_then(|c| c.as_str()) {
            Some("CommandLineTool") => Ok(Self::CommandLine(CommandLineTool::new(tool)?)),
            Some("ExpressionTool") => Ok(Self::Expression(ExpressionTool::new(tool))),
            Some("Operation") => Ok(Self::Operation(AbstractOperation { tool })),
            other => Err(Error::validation(format!("unknown tool class: {other:?}"))),
        }
    }

    pub fn prepare(
        &self,
        job_order: &Value,
        output_callback: OutputCallback,
        runtime: &RuntimeContext,
    ) -> Result<Prepared> {
        match self {
            Self::CommandLine(t) => t.prepare(job_order, output_callback, runtime),
            Self::Expression(t) => t
                .prepare(job_order, output_callback, runtime)
                .map(|j| Prepared::Expression(Box::new(j))),
            Self::Operation(_) => Err(Error::workflow("Abstract operation cannot be executed.")),
        }
    }
}

pub struct CommandLineTool {
    pub tool: Value,
    requirements: Vec<Value>,
    hints: Vec<Value>,
}

pub struct ExpressionTool {
    pub tool: Value,
    requirements: Vec<Value>,
    hints: Vec<Value>,
}

pub struct AbstractOperation {
    pub tool: Value,
}

fn tool_list(tool: &Value, key: &str) -> Vec<Value> {
    tool.get(key)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Last occurrence wins within each list; requirements take precedence
/// over hints. The boolean is true when the match came from requirements.
pub(crate) fn get_requirement<'a>(
    requirements: &'a [Value],
    hints: &'a [Value],
    class: &str,
) -> Option<(&'a Value, bool)> {
    for r in requirements.iter().rev() {
        if r.get("class").and_then(|c| c.as_str()) == Some(class) {
            return Some((r, true));
        }
    }
    for h in hints.iter().rev() {
        if h.get("class").and_then(|c| c.as_str()) == Some(class) {
            return Some((h, false));
        }
    }
    None
}

impl CommandLineTool {
    pub fn new(mut tool: Value) -> Result<Self> {
        desugar_streams(&mut tool)?;
        let requirements = tool_list(&tool, "requirements");
        let hints = tool_list(&tool, "hints");
        Ok(Self {
            tool,
            requirements,
            hints,
        })
    }

    fn cwl_version(&self) -> Option<String> {
        self.tool
            .get("cwlVersion")
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn exit_codes(&self, key: &str) -> Vec<i64> {
        self.tool
            .get(key)
            .and_then(|v| v.as_array())
            .map(|codes| codes.iter().filter_map(|c| c.as_i64()).collect())
            .unwrap_or_default()
    }

    /// Pick the backend for this tool, injecting a synthetic
    /// DockerRequirement when the runtime supplies a default container.
    fn make_job_runner(
        &self,
        runtime: &RuntimeContext,
    ) -> Result<(ContainerBackend, Vec<Value>)> {
        let mut requirements = self.requirements.clone();
        let mut has_docker_req =
            get_requirement(&requirements, &self.hints, "DockerRequirement").is_some();
        if !has_docker_req && runtime.use_container {
            if let Some(find) = &runtime.find_default_container {
                if let Some(image) = find(&self.tool) {
                    requirements.insert(
                        0,
                        json!({"class": "DockerRequirement", "dockerPull": image}),
                    );
                    has_docker_req = true;
                }
            }
        }
        if has_docker_req && runtime.use_container {
            if runtime.singularity {
                return Ok((ContainerBackend::Singularity, requirements));
            }
            if let Some(cmd) = &runtime.user_space_docker_cmd {
                return Ok((ContainerBackend::UserSpaceDocker(cmd.clone()), requirements));
            }
            return Ok((ContainerBackend::Docker, requirements));
        }
        for r in requirements.iter().rev() {
            if r.get("class").and_then(|c| c.as_str()) == Some("DockerRequirement") {
                return Err(Error::UnsupportedRequirement(
                    "containers are disabled, but this CommandLineTool has DockerRequirement under 'requirements'"
                        .into(),
                ));
            }
        }
        Ok((ContainerBackend::Local, requirements))
    }

    pub fn prepare(
        &self,
        job_order: &Value,
        output_callback: OutputCallback,
        runtime: &RuntimeContext,
    ) -> Result<Prepared> {
        let enable_reuse = get_requirement(&self.requirements, &self.hints, "WorkReuse")
            .map(|(r, _)| r.get("enableReuse").and_then(|b| b.as_bool()).unwrap_or(true))
            .unwrap_or(true);
        let stem = runtime.name.clone().unwrap_or_else(|| {
            value::shortname(self.tool.get("id").and_then(|i| i.as_str()).unwrap_or("job"))
        });
        let jobname = value::uniquename(&stem);
        let (backend, requirements) = self.make_job_runner(runtime)?;
        let container = backend != ContainerBackend::Local;

        let mut runtime = runtime.clone();
        let mut output_callback = output_callback;
        if let Some(cachedir) = runtime.cachedir.clone() {
            if enable_reuse {
                match self.check_cache(
                    &cachedir,
                    &requirements,
                    job_order,
                    &runtime,
                    &jobname,
                    container,
                )? {
                    CacheOutcome::Hit(cachebuilder, jobcache, lock) => {
                        info!(
                            "[job {jobname}] using cached output in {}",
                            xx::file::display_path(&jobcache)
                        );
                        let collector = OutputCollector {
                            ports: tool_list(&self.tool, "outputs"),
                            builder: cachebuilder,
                            compute_checksum: runtime.compute_checksum,
                            jobname: jobname.clone(),
                            readers: IndexMap::new(),
                            cwl_version: self.cwl_version(),
                        };
                        return Ok(Prepared::Callback(Box::new(CallbackJob {
                            name: jobname,
                            outdir: jobcache.to_string_lossy().into_owned(),
                            collector,
                            output_callback: Some(output_callback),
                            lock: Some(lock),
                        })));
                    }
                    CacheOutcome::Miss(jobcache, lock) => {
                        info!(
                            "[job {jobname}] output will be cached in {}",
                            xx::file::display_path(&jobcache)
                        );
                        runtime.outdir = Some(jobcache.to_string_lossy().into_owned());
                        // The final status is written into the lockfile
                        // (releasing the exclusive lock) before the original
                        // callback runs.
                        let mut lock = Some(lock);
                        let mut original = output_callback;
                        output_callback = Box::new(move |outputs, status| {
                            if let Some(l) = lock.take() {
                                if let Err(err) = l.commit(status) {
                                    error!("failed to write cache status: {err}");
                                }
                            }
                            original(outputs, status);
                        });
                    }
                }
            }
        }

        let mut builder = init_builder(
            &self.tool,
            &requirements,
            &self.hints,
            job_order,
            &runtime,
            container,
        )?;
        debug!(
            "[job {jobname}] initializing from {}",
            self.tool.get("id").and_then(|i| i.as_str()).unwrap_or("")
        );
        let reffiles = builder.files.clone();
        builder.pathmapper = Some(PathMapper::new(
            &reffiles,
            &runtime.basedir,
            &builder.stagedir,
            true,
        )?);
        adjust_staged_paths(&mut builder, runtime.strict_filenames)?;

        // Initial work directory
        let mut generatefiles = json!({"class": "Directory", "listing": [], "basename": ""});
        if let Some((initial_workdir, _)) =
            get_requirement(&requirements, &self.hints, "InitialWorkDirRequirement")
        {
            let listing = self.eval_initial_workdir(initial_workdir.clone(), &builder)?;
            generatefiles["listing"] = Value::Array(listing.clone());
            value::normalize_files_dirs(&mut generatefiles)?;
            let outdir = builder.outdir.clone();
            let mut pm = builder
                .pathmapper
                .take()
                .ok_or_else(|| Error::validation("builder has no path mapper"))?;
            for entry in generatefiles["listing"].as_array().cloned().unwrap_or_default() {
                update_pathmap(&mut pm, &outdir, &entry)?;
            }
            builder.pathmapper = Some(pm);
            adjust_staged_paths(&mut builder, runtime.strict_filenames)?;
        }
        if log_enabled!(log::Level::Debug) {
            if let Some(pm) = &builder.pathmapper {
                for (loc, ent) in pm.items() {
                    debug!("[job {jobname}] path mapping {loc} -> {}", ent.target);
                }
            }
        }

        // Streams
        let mut stdin_path = None;
        if let Some(sv) = self.tool.get("stdin") {
            let v = builder.do_eval(sv, None, true)?;
            if !v.is_null() {
                let s = v
                    .as_str()
                    .ok_or_else(|| Error::validation(format!("stdin must be a path, got {v}")))?
                    .to_string();
                // stdin joins the reference set so it is tracked like any
                // other input file.
                builder.files.push(json!({"class": "File", "path": s}));
                stdin_path = Some(s);
            }
        }
        let stderr_path = self.eval_stream(&builder, "stderr")?;
        let stdout_path = self.eval_stream(&builder, "stdout")?;

        // Environment
        let mut environment = IndexMap::new();
        if let Some((evr, _)) = get_requirement(&requirements, &self.hints, "EnvVarRequirement") {
            match evr.get("envDef") {
                Some(Value::Array(defs)) => {
                    for def in defs {
                        let name = def
                            .get("envName")
                            .and_then(|n| n.as_str())
                            .ok_or_else(|| {
                                Error::validation(format!("envDef entry is missing 'envName': {def}"))
                            })?;
                        let val =
                            builder.do_eval(def.get("envValue").unwrap_or(&Value::Null), None, true)?;
                        environment.insert(name.to_string(), value::stringify(&val));
                    }
                }
                Some(Value::Object(map)) => {
                    for (name, v) in map {
                        let val = builder.do_eval(v, None, true)?;
                        environment.insert(name.clone(), value::stringify(&val));
                    }
                }
                _ => {}
            }
        }

        // Limits and switches
        let mut timelimit = None;
        if let Some((tl, _)) = get_requirement(&requirements, &self.hints, "ToolTimeLimit") {
            let v = builder.do_eval(tl.get("timelimit").unwrap_or(&Value::Null), None, true)?;
            let n = v
                .as_i64()
                .filter(|n| *n >= 0)
                .ok_or_else(|| Error::workflow(format!("timelimit must be an integer >= 0, got: {v}")))?;
            timelimit = Some(n);
        }
        let mut networkaccess = false;
        if let Some((na, _)) = get_requirement(&requirements, &self.hints, "NetworkAccess") {
            let v = builder.do_eval(na.get("networkAccess").unwrap_or(&Value::Null), None, true)?;
            networkaccess = v
                .as_bool()
                .ok_or_else(|| Error::workflow(format!("networkAccess must be a boolean, got: {v}")))?;
        }
        let inplace_update =
            get_requirement(&requirements, &self.hints, "InplaceUpdateRequirement")
                .map(|(r, _)| {
                    r.get("inplaceUpdate")
                        .and_then(|b| b.as_bool())
                        .unwrap_or(false)
                })
                .unwrap_or(false);

        // Job directories: for containers the builder paths are the inner
        // view, the job fields carry the host-side directories.
        let (outdir, tmpdir, stagedir) = if container {
            let outdir = match &runtime.outdir {
                Some(o) => o.clone(),
                None => runtime.create_tmpdir()?,
            };
            let tmpdir = match &runtime.tmpdir {
                Some(t) => t.clone(),
                None => runtime.create_tmpdir()?,
            };
            (outdir, tmpdir, runtime.create_tmpdir()?)
        } else {
            (
                builder.outdir.clone(),
                builder.tmpdir.clone(),
                builder.stagedir.clone(),
            )
        };

        // Mutation registration
        let mut readers: IndexMap<String, Value> = IndexMap::new();
        if let Some(mm) = builder.mutation_manager.clone() {
            let mut muts: HashSet<String> = HashSet::new();
            {
                let mut register_mut = |f: &mut Value| -> Result<()> {
                    let loc = value::location_of(f)?.to_string();
                    mm.register_mutation(&jobname, f)?;
                    muts.insert(loc);
                    Ok(())
                };
                if let Some(listing) = generatefiles["listing"].as_array_mut() {
                    for li in listing.iter_mut() {
                        let writable =
                            li.get("writable").and_then(|w| w.as_bool()).unwrap_or(false);
                        if writable && inplace_update {
                            value::visit_class(li, value::FILE_AND_DIR, &mut register_mut)?;
                        }
                    }
                }
            }
            let mut register_reader = |f: &mut Value| -> Result<()> {
                // Descriptors without a location (e.g. the stdin stub) are
                // not tracked.
                let Some(loc) = f.get("location").and_then(|l| l.as_str()).map(String::from)
                else {
                    return Ok(());
                };
                if muts.contains(&loc) {
                    return Ok(());
                }
                mm.register_reader(&jobname, f)?;
                readers.insert(loc, f.clone());
                Ok(())
            };
            if let Some(listing) = generatefiles["listing"].as_array_mut() {
                for li in listing.iter_mut() {
                    let writable = li.get("writable").and_then(|w| w.as_bool()).unwrap_or(false);
                    if !(writable && inplace_update) {
                        value::visit_class(li, value::FILE_AND_DIR, &mut register_reader)?;
                    }
                }
            }
            for f in builder.files.iter_mut() {
                value::visit_class(f, value::FILE_AND_DIR, &mut register_reader)?;
            }
            for b in builder.bindings.iter_mut() {
                value::visit_class(&mut b.datum, value::FILE_AND_DIR, &mut register_reader)?;
            }
        }

        // Command line
        let shellcmd =
            get_requirement(&requirements, &self.hints, "ShellCommandRequirement").is_some();
        let command_line = if shellcmd {
            let mut parts: Vec<String> = vec![];
            for b in &builder.bindings {
                let args = builder.generate_arg(b)?;
                if b.shell_quote {
                    parts.extend(args.iter().map(|a| quote_posix(a)));
                } else {
                    parts.extend(args);
                }
            }
            vec!["/bin/sh".into(), "-c".into(), parts.join(" ")]
        } else {
            let mut argv = vec![];
            for b in &builder.bindings {
                argv.extend(builder.generate_arg(b)?);
            }
            argv
        };
        debug!("[job {jobname}] command line is {command_line:?}");

        let collector = OutputCollector {
            ports: tool_list(&self.tool, "outputs"),
            builder,
            compute_checksum: runtime.compute_checksum,
            jobname: jobname.clone(),
            readers,
            cwl_version: self.cwl_version(),
        };
        Ok(Prepared::Command(Box::new(CommandJob {
            name: jobname,
            backend,
            command_line,
            stdin: stdin_path,
            stdout: stdout_path,
            stderr: stderr_path,
            environment,
            timelimit,
            networkaccess,
            outdir,
            tmpdir,
            stagedir,
            generatefiles,
            inplace_update,
            success_codes: self.exit_codes("successCodes"),
            temporary_fail_codes: self.exit_codes("temporaryFailCodes"),
            permanent_fail_codes: self.exit_codes("permanentFailCodes"),
            requirements,
            hints: self.hints.clone(),
            collect_outputs: collector,
            output_callback: Some(output_callback),
        })))
    }

    fn eval_stream(&self, builder: &Builder, key: &str) -> Result<Option<String>> {
        let Some(sv) = self.tool.get(key) else {
            return Ok(None);
        };
        let v = builder.do_eval(sv, None, true)?;
        if v.is_null() {
            return Ok(None);
        }
        let s = v
            .as_str()
            .ok_or_else(|| Error::validation(format!("{key} must be a path, got {v}")))?;
        if s.is_empty() || s.starts_with('/') || s.contains("..") {
            return Err(Error::validation(format!(
                "{key} must be a relative path, got '{s}'"
            )));
        }
        Ok(Some(s.to_string()))
    }

    /// Evaluate the InitialWorkDirRequirement listing into normalized
    /// File/Directory entries.
    fn eval_initial_workdir(&self, req: Value, builder: &Builder) -> Result<Vec<Value>> {
        let mut ls: Vec<Value> = vec![];
        match req.get("listing") {
            Some(Value::String(expr)) => {
                let v = builder.do_eval(&json!(expr), None, true)?;
                ls = v.as_array().cloned().ok_or_else(|| {
                    Error::validation(
                        "InitialWorkDirRequirement listing expression must produce a list",
                    )
                })?;
            }
            Some(Value::Array(entries)) => {
                for t in entries {
                    if t.is_object() && t.get("entry").is_some() {
                        let entry_exp = builder.do_eval(&t["entry"], None, false)?;
                        for entry in value::aslist(&entry_exp) {
                            if entry.is_null() {
                                continue;
                            }
                            let entryname = match t.get("entryname") {
                                Some(en) => builder.do_eval(en, None, true)?,
                                None => Value::Null,
                            };
                            ls.push(json!({
                                "entry": entry,
                                "entryname": entryname,
                                "writable": t.get("writable").cloned().unwrap_or(json!(false)),
                            }));
                        }
                    } else {
                        let item = builder.do_eval(t, None, true)?;
                        if value::is_empty_value(&item) {
                            continue;
                        }
                        match item {
                            Value::Array(items) => ls.extend(items),
                            other => ls.push(other),
                        }
                    }
                }
            }
            _ => {}
        }
        for i in 0..ls.len() {
            if ls[i].get("entry").is_none() {
                continue;
            }
            let t2 = ls[i].clone();
            let entryname = t2.get("entryname").cloned().unwrap_or(Value::Null);
            let writable = t2.get("writable").cloned().unwrap_or(json!(false));
            match &t2["entry"] {
                Value::String(contents) => {
                    if entryname.is_null() {
                        return Err(Error::validation(
                            "'entryname' is required when an initial work directory entry is a string literal",
                        ));
                    }
                    ls[i] = json!({
                        "class": "File",
                        "basename": entryname,
                        "contents": contents,
                        "writable": writable,
                    });
                }
                entry => {
                    let mut entry = entry.clone();
                    if !entryname.is_null() {
                        entry["basename"] = entryname;
                    }
                    if writable.as_bool().unwrap_or(false) {
                        entry["writable"] = writable;
                    }
                    ls[i] = entry;
                }
            }
        }
        Ok(ls)
    }

    /// Cache lookup: build a deterministic command line against synthetic
    /// sandbox paths, hash the invocation, and consult the cache directory
    /// under its advisory lock.
    fn check_cache(
        &self,
        cachedir: &str,
        requirements: &[Value],
        job_order: &Value,
        runtime: &RuntimeContext,
        jobname: &str,
        container: bool,
    ) -> Result<CacheOutcome> {
        let mut cache_rt = runtime.clone();
        cache_rt.outdir = Some("/out".into());
        cache_rt.tmpdir = Some("/tmp".into());
        cache_rt.stagedir = Some("/stage".into());
        let mut cachebuilder = init_builder(
            &self.tool,
            requirements,
            &self.hints,
            job_order,
            &cache_rt,
            false,
        )?;
        let reffiles = cachebuilder.files.clone();
        cachebuilder.pathmapper = Some(PathMapper::new(
            &reffiles,
            &runtime.basedir,
            &cachebuilder.stagedir,
            false,
        )?);
        adjust_staged_paths(&mut cachebuilder, runtime.strict_filenames)?;
        let mut cmdline: Vec<String> = vec![];
        for b in &cachebuilder.bindings {
            cmdline.extend(cachebuilder.generate_arg(b)?);
        }
        let docker_req = get_requirement(requirements, &self.hints, "DockerRequirement");
        let dockerimg = if let Some((dr, _)) = docker_req {
            if runtime.use_container {
                dr.get("dockerImageId")
                    .or_else(|| dr.get("dockerPull"))
                    .and_then(|i| i.as_str())
                    .map(String::from)
            } else {
                None
            }
        } else if runtime.use_container {
            runtime.default_container.clone()
        } else {
            None
        };
        if let Some(img) = dockerimg {
            // Not really run through docker, only part of the hash.
            let mut prefixed = vec!["docker".to_string(), "run".to_string(), img];
            prefixed.extend(cmdline);
            cmdline = prefixed;
        }

        let mut keydict = serde_json::Map::new();
        keydict.insert("cmdline".into(), json!(cmdline));
        for shortcut in ["stdin", "stdout", "stderr"] {
            if let Some(v) = self.tool.get(shortcut) {
                keydict.insert(shortcut.into(), v.clone());
            }
        }
        if let Some(pm) = &cachebuilder.pathmapper {
            for (location, ent) in pm.items() {
                if ent.kind != MapType::File {
                    continue;
                }
                let checksum = cachebuilder.files.iter().find_map(|e| {
                    if e.get("location").and_then(|l| l.as_str()) != Some(location) {
                        return None;
                    }
                    e.get("checksum")
                        .and_then(|c| c.as_str())
                        .filter(|c| *c != "sha1$hash")
                        .map(String::from)
                });
                let md = std::fs::metadata(&ent.resolved)?;
                let entry = match checksum {
                    Some(c) => json!([md.len(), c]),
                    None => {
                        let mtime_ms = md
                            .modified()?
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        json!([md.len(), mtime_ms])
                    }
                };
                keydict.insert(ent.resolved.clone(), entry);
            }
        }
        // Only the tool's own declared requirements and hints enter the
        // key here; a DockerRequirement synthesized from the default
        // container is already covered by the cmdline prefix above.
        for rh in [self.requirements.as_slice(), self.hints.as_slice()] {
            for r in rh.iter().rev() {
                if let Some(cls) = r.get("class").and_then(|c| c.as_str()) {
                    if INTERESTING_REQUIREMENTS.contains(&cls) && !keydict.contains_key(cls) {
                        keydict.insert(cls.to_string(), r.clone());
                    }
                }
            }
        }
        let keydict = Value::Object(keydict);
        let cachekey = cache::cache_key(&keydict);
        debug!(
            "[job {jobname}] cache key is {cachekey} over {}",
            cache::canonical_json(&keydict)
        );

        let jobcache = Path::new(cachedir).join(&cachekey);
        let status_path = PathBuf::from(format!("{}.status", jobcache.display()));
        std::fs::create_dir_all(cachedir)?;
        let (lock, status) = CacheLock::open_shared(&status_path)?;
        if jobcache.is_dir() && status == "success" {
            if container {
                cachebuilder.outdir = runtime.docker_outdir.clone().unwrap_or_else(random_outdir);
            } else {
                cachebuilder.outdir = jobcache.to_string_lossy().into_owned();
            }
            return Ok(CacheOutcome::Hit(cachebuilder, jobcache, lock));
        }
        lock.upgrade()?;
        let _ = std::fs::remove_dir_all(&jobcache);
        std::fs::create_dir_all(&jobcache)?;
        Ok(CacheOutcome::Miss(jobcache, lock))
    }
}

enum CacheOutcome {
    Hit(Builder, PathBuf, CacheLock),
    Miss(PathBuf, CacheLock),
}

impl ExpressionTool {
    pub fn new(tool: Value) -> Self {
        let requirements = tool_list(&tool, "requirements");
        let hints = tool_list(&tool, "hints");
        Self {
            tool,
            requirements,
            hints,
        }
    }

    pub fn prepare(
        &self,
        job_order: &Value,
        output_callback: OutputCallback,
        runtime: &RuntimeContext,
    ) -> Result<ExpressionJob> {
        let stem = runtime.name.clone().unwrap_or_else(|| {
            value::shortname(
                self.tool
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or("expression"),
            )
        });
        let script = self
            .tool
            .get("expression")
            .and_then(|e| e.as_str())
            .ok_or_else(|| Error::validation("ExpressionTool is missing 'expression'"))?
            .to_string();
        let builder = init_builder(
            &self.tool,
            &self.requirements,
            &self.hints,
            job_order,
            runtime,
            false,
        )?;
        Ok(ExpressionJob {
            name: value::uniquename(&stem),
            builder,
            script,
            requirements: self.requirements.clone(),
            hints: self.hints.clone(),
            output_callback: Some(output_callback),
        })
    }
}

/// `stdout`/`stderr`-typed output ports are shorthand for File ports whose
/// glob is the corresponding stream filename.
fn desugar_streams(tool: &mut Value) -> Result<()> {
    for key in ["stdout", "stderr"] {
        let used = tool
            .get("outputs")
            .and_then(|o| o.as_array())
            .is_some_and(|ports| {
                ports
                    .iter()
                    .any(|p| p.get("type").and_then(|t| t.as_str()) == Some(key))
            });
        if used && tool.get(key).is_none() {
            tool[key] = json!(format!("{key}_{}", uuid::Uuid::new_v4().simple()));
        }
    }
    let stdout = tool.get("stdout").cloned();
    let stderr = tool.get("stderr").cloned();
    if let Some(ports) = tool.get_mut("outputs").and_then(|o| o.as_array_mut()) {
        for port in ports {
            let t = port.get("type").and_then(|t| t.as_str()).map(String::from);
            let filename = match t.as_deref() {
                Some("stdout") => stdout.clone(),
                Some("stderr") => stderr.clone(),
                _ => continue,
            };
            let filename = filename.ok_or_else(|| {
                Error::validation(format!("output port declares type {t:?} but the tool does not set it"))
            })?;
            port["type"] = json!("File");
            port["outputBinding"] = json!({"glob": filename});
        }
    }
    Ok(())
}

/// Build the Builder for a job: resolved inputs with defaults applied,
/// flattened file references, ordered command-line bindings, sandbox
/// paths, and resource defaults.
fn init_builder(
    tool: &Value,
    requirements: &[Value],
    hints: &[Value],
    job_order: &Value,
    runtime: &RuntimeContext,
    container: bool,
) -> Result<Builder> {
    let mut job = job_order.clone();
    if !job.is_object() {
        return Err(Error::validation(format!(
            "job order must be an object, got {job}"
        )));
    }
    let inputs = tool_list(tool, "inputs");
    for port in &inputs {
        let id = port
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| Error::validation(format!("input port is missing 'id': {port}")))?;
        let fragment = value::shortname(id);
        let missing = job.get(&fragment).map(|v| v.is_null()).unwrap_or(true);
        if missing {
            if let Some(default) = port.get("default") {
                job[&fragment] = default.clone();
            }
        }
    }
    value::normalize_files_dirs(&mut job)?;

    let mut b = Builder::new(
        job,
        runtime.fs_access(&runtime.basedir),
        runtime.fs_factory.clone(),
        runtime.evaluator.clone(),
    );
    b.requirements = requirements.to_vec();
    b.hints = hints.to_vec();
    b.mutation_manager = runtime.mutation_manager.clone();
    b.load_listing = get_requirement(requirements, hints, "LoadListingRequirement")
        .and_then(|(r, _)| LoadListing::from_value(r.get("loadListing")))
        .unwrap_or(runtime.load_listing);
    if container {
        b.outdir = runtime.docker_outdir.clone().unwrap_or_else(random_outdir);
        b.tmpdir = runtime.docker_tmpdir.clone().unwrap_or_else(|| "/tmp".into());
        b.stagedir = runtime
            .docker_stagedir
            .clone()
            .unwrap_or_else(|| "/var/lib/cwl".into());
    } else {
        let outdir = match &runtime.outdir {
            Some(o) => o.clone(),
            None => runtime.create_tmpdir()?,
        };
        b.outdir = b.fs_access.realpath(&outdir);
        b.tmpdir = match &runtime.tmpdir {
            Some(t) => t.clone(),
            None => runtime.create_tmpdir()?,
        };
        b.stagedir = match &runtime.stagedir {
            Some(s) => s.clone(),
            None => runtime.create_tmpdir()?,
        };
    }
    for (k, v) in [
        ("cores", 1),
        ("ram", 256),
        ("tmpdirSize", 1024),
        ("outdirSize", 1024),
    ] {
        b.resources.insert(k.into(), json!(v));
    }
    b.files = value::collect_class(&b.job, value::FILE_AND_DIR);

    let mut sort_index = 0;
    if let Some(base) = tool.get("baseCommand") {
        for token in value::aslist(base) {
            let token = token.as_str().ok_or_else(|| {
                Error::validation(format!("baseCommand tokens must be strings, got {token}"))
            })?;
            b.bindings
                .push(Binding::literal(token, -1_000_000, sort_index));
            sort_index += 1;
        }
    }
    if let Some(args) = tool.get("arguments").and_then(|a| a.as_array()) {
        for arg in args {
            match arg {
                Value::String(s) => {
                    b.bindings.push(Binding::literal(s.as_str(), 0, sort_index));
                }
                Value::Object(_) => {
                    b.bindings
                        .push(Binding::from_value(arg, Value::Null, sort_index)?);
                }
                other => {
                    return Err(Error::validation(format!(
                        "arguments entries must be strings or bindings, got {other}"
                    )));
                }
            }
            sort_index += 1;
        }
    }
    for port in &inputs {
        if let Some(ib) = port.get("inputBinding") {
            let id = port.get("id").and_then(|i| i.as_str()).unwrap_or_default();
            let fragment = value::shortname(id);
            let datum = b.job.get(&fragment).cloned().unwrap_or(Value::Null);
            b.bindings.push(Binding::from_value(ib, datum, sort_index)?);
            sort_index += 1;
        }
    }
    b.sort_bindings();
    Ok(b)
}

/// Walk every File/Directory known to the builder and assign its staged
/// in-sandbox path from the path mapper, recomputing the name fields.
fn adjust_staged_paths(builder: &mut Builder, strict: bool) -> Result<()> {
    let pm = builder
        .pathmapper
        .take()
        .ok_or_else(|| Error::validation("builder has no path mapper"))?;
    let result = (|| -> Result<()> {
        value::visit_class(&mut builder.job, value::FILE_AND_DIR, &mut |f| {
            check_adjust(&pm, strict, f)
        })?;
        for f in builder.files.iter_mut() {
            value::visit_class(f, value::FILE_AND_DIR, &mut |o| check_adjust(&pm, strict, o))?;
        }
        for b in builder.bindings.iter_mut() {
            value::visit_class(&mut b.datum, value::FILE_AND_DIR, &mut |o| {
                check_adjust(&pm, strict, o)
            })?;
        }
        Ok(())
    })();
    builder.pathmapper = Some(pm);
    result
}

fn check_adjust(pm: &PathMapper, strict: bool, f: &mut Value) -> Result<()> {
    let location = value::location_of(f)?.to_string();
    let target = pm.mapper(&location)?.target.clone();
    let path = docker_windows_path_adjust(&target);
    let (dirname, basename) = match path.rsplit_once('/') {
        Some((d, b)) => (d.to_string(), b.to_string()),
        None => (String::new(), path.clone()),
    };
    f["path"] = json!(path);
    f["dirname"] = json!(dirname);
    f["basename"] = json!(basename);
    if value::class_of(f) == Some("File") {
        let (nameroot, nameext) = value::splitext(&basename);
        f["nameroot"] = json!(nameroot);
        f["nameext"] = json!(nameext);
    }
    if strict && !ACCEPTLIST_STRICT_RE.is_match(&basename) {
        return Err(Error::workflow(format!(
            "Invalid filename: '{basename}' contains illegal characters"
        )));
    }
    Ok(())
}

/// Re-target initial work directory entries (and their secondary files and
/// listings) at the job's output directory.
fn update_pathmap(pm: &mut PathMapper, outdir: &str, entry: &Value) -> Result<()> {
    if let (Some(location), Some(basename)) = (
        entry.get("location").and_then(|l| l.as_str()),
        entry.get("basename").and_then(|b| b.as_str()),
    ) {
        if pm.contains(location) {
            let resolved = pm.mapper(location)?.resolved.clone();
            let writable = entry.get("writable").and_then(|w| w.as_bool()).unwrap_or(false);
            let class = value::class_of(entry).unwrap_or("File");
            pm.update(
                location,
                resolved,
                format!("{}/{basename}", outdir.trim_end_matches('/')),
                MapType::for_class(class, writable)?,
                false,
            );
        }
    }
    if let Some(sfs) = entry.get("secondaryFiles").and_then(|l| l.as_array()) {
        for sf in sfs {
            update_pathmap(pm, outdir, sf)?;
        }
    }
    if let Some(listing) = entry.get("listing").and_then(|l| l.as_array()) {
        let basename = entry
            .get("basename")
            .and_then(|b| b.as_str())
            .unwrap_or_default();
        let sub = format!("{}/{basename}", outdir.trim_end_matches('/'));
        for child in listing {
            update_pathmap(pm, &sub, child)?;
        }
    }
    Ok(())
}

fn random_outdir() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("/{}", &id[..6])
}

fn quote_posix(s: &str) -> String {
    let mut out = vec![];
    shell_quote::Sh::quote_into(s, &mut out);
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(windows)]
fn docker_windows_path_adjust(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(not(windows))]
fn docker_windows_path_adjust(path: &str) -> String {
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ProcessStatus;
    use std::sync::Mutex;

    fn noop_callback() -> OutputCallback {
        Box::new(|_, _| {})
    }

    fn capture_callback() -> (
        OutputCallback,
        std::sync::Arc<Mutex<Vec<(Value, ProcessStatus)>>>,
    ) {
        let store = std::sync::Arc::new(Mutex::new(vec![]));
        let sink = store.clone();
        (
            Box::new(move |outputs, status| {
                sink.lock().unwrap().push((outputs, status));
            }),
            store,
        )
    }

    fn runtime_in(root: &Path) -> RuntimeContext {
        let outdir = root.join("out");
        let tmpdir = root.join("tmp");
        let stagedir = root.join("stage");
        for d in [&outdir, &tmpdir, &stagedir] {
            std::fs::create_dir_all(d).unwrap();
        }
        RuntimeContext {
            basedir: root.to_string_lossy().into_owned(),
            outdir: Some(outdir.to_string_lossy().into_owned()),
            tmpdir: Some(tmpdir.to_string_lossy().into_owned()),
            stagedir: Some(stagedir.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    fn echo_tool() -> Tool {
        Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///echo.cwl",
            "baseCommand": ["echo"],
            "inputs": [{"id": "msg", "type": "string", "inputBinding": {"position": 1}}],
            "outputs": [{"id": "out", "type": "stdout"}],
            "stdout": "out.txt",
        }))
        .unwrap()
    }

    fn cat_tool() -> Tool {
        Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///cat.cwl",
            "baseCommand": ["cat"],
            "inputs": [{"id": "f", "type": "File", "inputBinding": {"position": 1}}],
            "outputs": [{"id": "o", "type": "File", "outputBinding": {"glob": "result"}}],
            "stdout": "result",
        }))
        .unwrap()
    }

    #[test]
    fn echo_tool_builds_command_line_and_collects_stdout() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let prepared = echo_tool()
            .prepare(&json!({"msg": "hello"}), noop_callback(), &rt)
            .unwrap();
        assert!(!prepared.is_cache_hit());
        let mut job = prepared.into_command().unwrap();
        assert_eq!(job.command_line, vec!["echo", "hello"]);
        assert_eq!(job.stdout.as_deref(), Some("out.txt"));
        std::fs::write(Path::new(&job.outdir).join("out.txt"), "hello\n").unwrap();
        let (outputs, status) = job.complete(0).unwrap();
        assert_eq!(status, ProcessStatus::Success);
        assert_eq!(outputs["out"]["class"], "File");
        assert_eq!(outputs["out"]["basename"], "out.txt");
        assert_eq!(outputs["out"]["size"], 6);
    }

    #[test]
    fn cat_tool_stages_input_and_remaps_output() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("in.txt");
        std::fs::write(&input, "data\n").unwrap();
        let rt = runtime_in(root.path());
        let job_order = json!({
            "f": {"class": "File", "location": value::file_uri(&input.to_string_lossy())}
        });
        let prepared = cat_tool()
            .prepare(&job_order, noop_callback(), &rt)
            .unwrap();
        let mut job = prepared.into_command().unwrap();
        assert_eq!(job.command_line[0], "cat");
        let staged = job.command_line[1].clone();
        assert!(staged.starts_with(rt.stagedir.as_deref().unwrap()));
        assert!(staged.ends_with("/in.txt"));
        assert_ne!(staged, input.to_string_lossy());

        std::fs::write(Path::new(&job.outdir).join("result"), "data\n").unwrap();
        let (outputs, status) = job.complete(0).unwrap();
        assert_eq!(status, ProcessStatus::Success);
        let location = outputs["o"]["location"].as_str().unwrap();
        assert!(location.starts_with("file://"));
        assert!(location.ends_with("/result"));
        assert_eq!(
            outputs["o"]["checksum"],
            "sha1$c5d84736ba451747dd5f0eb9d17e104f3697ef47"
        );
    }

    #[test]
    fn second_run_with_same_cachedir_is_a_cache_hit() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("in.txt");
        std::fs::write(&input, "data\n").unwrap();
        let cachedir = root.path().join("cache");
        let job_order = json!({
            "f": {"class": "File", "location": value::file_uri(&input.to_string_lossy())}
        });

        let mut rt = runtime_in(root.path());
        rt.cachedir = Some(cachedir.to_string_lossy().into_owned());
        let (cb, results) = capture_callback();
        let prepared = cat_tool().prepare(&job_order, cb, &rt).unwrap();
        let mut job = prepared.into_command().unwrap();
        // output directory is redirected into the cache
        assert!(
            Path::new(&job.outdir)
                .starts_with(std::fs::canonicalize(&cachedir).unwrap())
        );
        std::fs::write(Path::new(&job.outdir).join("result"), "data\n").unwrap();
        job.complete(0).unwrap();
        let first = results.lock().unwrap().last().unwrap().clone();
        assert_eq!(first.1, ProcessStatus::Success);

        // fresh output dir, same cache
        let second_root = tempfile::tempdir().unwrap();
        let mut rt2 = runtime_in(second_root.path());
        rt2.basedir = root.path().to_string_lossy().into_owned();
        rt2.cachedir = Some(cachedir.to_string_lossy().into_owned());
        let (cb2, results2) = capture_callback();
        let prepared = cat_tool().prepare(&job_order, cb2, &rt2).unwrap();
        assert!(prepared.is_cache_hit());
        let mut replay = prepared.into_callback().unwrap();
        let outputs = replay.run().unwrap();
        let second = results2.lock().unwrap().last().unwrap().clone();
        assert_eq!(second.1, ProcessStatus::Success);
        assert_eq!(outputs["o"]["basename"], first.0["o"]["basename"]);
        assert_eq!(outputs["o"]["size"], first.0["o"]["size"]);
        assert_eq!(outputs["o"]["checksum"], first.0["o"]["checksum"]);
    }

    #[test]
    fn shell_requirement_quotes_dangerous_arguments() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///sh.cwl",
            "requirements": [{"class": "ShellCommandRequirement"}],
            "baseCommand": [],
            "arguments": [{"valueFrom": "a b; rm -rf /"}],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let prepared = tool.prepare(&json!({}), noop_callback(), &rt).unwrap();
        let job = prepared.into_command().unwrap();
        assert_eq!(
            job.command_line,
            vec!["/bin/sh", "-c", "'a b; rm -rf /'"]
        );
    }

    #[test]
    fn shell_quote_false_passes_tokens_through() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///sh.cwl",
            "requirements": [{"class": "ShellCommandRequirement"}],
            "arguments": [{"valueFrom": "echo hi > marker", "shellQuote": false}],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let prepared = tool.prepare(&json!({}), noop_callback(), &rt).unwrap();
        let job = prepared.into_command().unwrap();
        assert_eq!(job.command_line, vec!["/bin/sh", "-c", "echo hi > marker"]);
    }

    #[test]
    fn docker_requirement_without_containers_is_unsupported() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///d.cwl",
            "requirements": [{"class": "DockerRequirement", "dockerPull": "debian:stable"}],
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let err = tool.prepare(&json!({}), noop_callback(), &rt).unwrap_err();
        assert!(matches!(err, Error::UnsupportedRequirement(_)));
    }

    #[test]
    fn docker_hint_without_containers_runs_locally() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///d.cwl",
            "hints": [{"class": "DockerRequirement", "dockerPull": "debian:stable"}],
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let prepared = tool.prepare(&json!({}), noop_callback(), &rt).unwrap();
        let job = prepared.into_command().unwrap();
        assert_eq!(job.backend, ContainerBackend::Local);
    }

    #[test]
    fn container_backend_selection_prefers_singularity_and_udocker() {
        let root = tempfile::tempdir().unwrap();
        let tool_v = json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///d.cwl",
            "requirements": [{"class": "DockerRequirement", "dockerPull": "debian:stable"}],
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [],
        });
        let mut rt = runtime_in(root.path());
        rt.use_container = true;
        let job = Tool::from_value(tool_v.clone())
            .unwrap()
            .prepare(&json!({}), noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(job.backend, ContainerBackend::Docker);

        rt.singularity = true;
        let job = Tool::from_value(tool_v.clone())
            .unwrap()
            .prepare(&json!({}), noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(job.backend, ContainerBackend::Singularity);

        rt.singularity = false;
        rt.user_space_docker_cmd = Some("udocker".into());
        let job = Tool::from_value(tool_v)
            .unwrap()
            .prepare(&json!({}), noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(
            job.backend,
            ContainerBackend::UserSpaceDocker("udocker".into())
        );
    }

    #[test]
    fn default_container_is_injected() {
        let root = tempfile::tempdir().unwrap();
        let mut rt = runtime_in(root.path());
        rt.use_container = true;
        rt.find_default_container = Some(std::sync::Arc::new(|_tool: &Value| {
            Some("docker.io/library/busybox".to_string())
        }));
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///d.cwl",
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let job = tool
            .prepare(&json!({}), noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(job.backend, ContainerBackend::Docker);
        assert_eq!(
            job.requirements[0],
            json!({"class": "DockerRequirement", "dockerPull": "docker.io/library/busybox"})
        );
    }

    #[test]
    fn stdout_must_be_a_clean_relative_path() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        for bad in ["/abs/out.txt", "../escape.txt"] {
            let tool = Tool::from_value(json!({
                "class": "CommandLineTool",
                "cwlVersion": "v1.2",
                "id": "file:///s.cwl",
                "baseCommand": ["true"],
                "inputs": [],
                "outputs": [],
                "stdout": bad,
            }))
            .unwrap();
            let err = tool.prepare(&json!({}), noop_callback(), &rt).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn environment_time_limit_and_network_access_are_evaluated() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///e.cwl",
            "requirements": [
                {"class": "EnvVarRequirement", "envDef": [
                    {"envName": "GREETING", "envValue": "hi $(inputs.who)"},
                ]},
                {"class": "ToolTimeLimit", "timelimit": 60},
                {"class": "NetworkAccess", "networkAccess": true},
            ],
            "baseCommand": ["true"],
            "inputs": [{"id": "who", "type": "string"}],
            "outputs": [],
        }))
        .unwrap();
        let job = tool
            .prepare(&json!({"who": "there"}), noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(job.environment["GREETING"], "hi there");
        assert_eq!(job.timelimit, Some(60));
        assert!(job.networkaccess);
    }

    #[test]
    fn negative_time_limit_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///t.cwl",
            "requirements": [{"class": "ToolTimeLimit", "timelimit": -5}],
            "baseCommand": ["true"],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let err = tool.prepare(&json!({}), noop_callback(), &rt).unwrap_err();
        assert!(err.to_string().contains("timelimit"));
    }

    #[test]
    fn strict_mode_rejects_illegal_basenames() {
        let root = tempfile::tempdir().unwrap();
        let bad = root.path().join("bad name.txt");
        std::fs::write(&bad, "x").unwrap();
        let job_order = json!({
            "f": {"class": "File", "location": value::file_uri(&bad.to_string_lossy())}
        });
        let rt = runtime_in(root.path());
        let err = cat_tool()
            .prepare(&job_order, noop_callback(), &rt)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid filename"));

        let mut relaxed = runtime_in(root.path());
        relaxed.strict_filenames = false;
        assert!(cat_tool().prepare(&job_order, noop_callback(), &relaxed).is_ok());
    }

    #[test]
    fn initial_workdir_literal_and_file_entries() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("in.txt");
        std::fs::write(&input, "data\n").unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///iwd.cwl",
            "requirements": [{"class": "InitialWorkDirRequirement", "listing": [
                {"entry": "cores=$(runtime.cores)", "entryname": "settings.ini"},
                {"entry": "$(inputs.f)", "writable": true},
            ]}],
            "baseCommand": ["true"],
            "inputs": [{"id": "f", "type": "File"}],
            "outputs": [],
        }))
        .unwrap();
        let job_order = json!({
            "f": {"class": "File", "location": value::file_uri(&input.to_string_lossy())}
        });
        let job = tool
            .prepare(&job_order, noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        let listing = job.generatefiles["listing"].as_array().unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0]["class"], "File");
        assert_eq!(listing[0]["basename"], "settings.ini");
        assert_eq!(listing[0]["contents"], "cores=1");
        // the input file is re-targeted into the working directory
        let location = value::file_uri(&input.to_string_lossy());
        let ent = job.pathmapper().unwrap().mapper(&location).unwrap();
        assert_eq!(ent.target, format!("{}/in.txt", job.builder().outdir));
        assert!(ent.kind.is_writable());
        assert!(!ent.staged);
    }

    #[test]
    fn readers_are_registered_and_released() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("in.txt");
        std::fs::write(&input, "data\n").unwrap();
        let mm = std::sync::Arc::new(crate::mutation::MutationManager::new());
        let mut rt = runtime_in(root.path());
        rt.mutation_manager = Some(mm.clone());
        let location = value::file_uri(&input.to_string_lossy());
        let job_order = json!({"f": {"class": "File", "location": location}});
        let mut job = cat_tool()
            .prepare(&job_order, noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        let descriptor = json!({"class": "File", "location": location});
        assert!(mm.register_mutation("rival", &descriptor).is_err());
        std::fs::write(Path::new(&job.outdir).join("result"), "data\n").unwrap();
        job.complete(0).unwrap();
        assert!(mm.register_mutation("rival", &descriptor).is_ok());
    }

    #[test]
    fn failing_collection_reports_permanent_fail() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let (cb, results) = capture_callback();
        let mut job = cat_tool()
            .prepare(
                &json!({"f": {"class": "File", "contents": "x", "basename": "x"}}),
                cb,
                &rt,
            )
            .unwrap()
            .into_command()
            .unwrap();
        // exit 0 but the declared output "result" was never produced
        let (outputs, status) = job.complete(0).unwrap();
        assert_eq!(status, ProcessStatus::PermanentFail);
        assert_eq!(outputs, json!({}));
        assert_eq!(results.lock().unwrap()[0].1, ProcessStatus::PermanentFail);
    }

    #[test]
    fn exit_code_classification_uses_declared_code_lists() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "CommandLineTool",
            "cwlVersion": "v1.2",
            "id": "file:///codes.cwl",
            "baseCommand": ["true"],
            "successCodes": [3],
            "temporaryFailCodes": [75],
            "permanentFailCodes": [1],
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let job = tool
            .prepare(&json!({}), noop_callback(), &rt)
            .unwrap()
            .into_command()
            .unwrap();
        assert_eq!(job.status_for_exit(3), ProcessStatus::Success);
        assert_eq!(job.status_for_exit(75), ProcessStatus::TemporaryFail);
        assert_eq!(job.status_for_exit(1), ProcessStatus::PermanentFail);
        assert_eq!(job.status_for_exit(0), ProcessStatus::Success);
        assert_eq!(job.status_for_exit(7), ProcessStatus::PermanentFail);
    }

    #[test]
    fn expression_tool_evaluates_and_reports_success() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "ExpressionTool",
            "cwlVersion": "v1.2",
            "id": "file:///x.cwl",
            "expression": "$(inputs)",
            "inputs": [{"id": "n", "type": "int"}],
            "outputs": [{"id": "n_out", "type": "int"}],
        }))
        .unwrap();
        let (cb, results) = capture_callback();
        let prepared = tool.prepare(&json!({"n": 5}), cb, &rt).unwrap();
        let Prepared::Expression(mut job) = prepared else {
            panic!("expected an expression job");
        };
        let ev = job.run().unwrap();
        assert_eq!(ev["n"], 5);
        assert_eq!(results.lock().unwrap()[0].1, ProcessStatus::Success);
    }

    #[test]
    fn expression_tool_failure_is_permanent_fail_with_empty_outputs() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "ExpressionTool",
            "cwlVersion": "v1.2",
            "id": "file:///x.cwl",
            "expression": "${ return {}; }",
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let (cb, results) = capture_callback();
        let prepared = tool.prepare(&json!({}), cb, &rt).unwrap();
        let Prepared::Expression(mut job) = prepared else {
            panic!("expected an expression job");
        };
        let ev = job.run().unwrap();
        assert_eq!(ev, json!({}));
        assert_eq!(results.lock().unwrap()[0].1, ProcessStatus::PermanentFail);
    }

    #[test]
    fn abstract_operations_cannot_run() {
        let root = tempfile::tempdir().unwrap();
        let rt = runtime_in(root.path());
        let tool = Tool::from_value(json!({
            "class": "Operation",
            "id": "file:///op.cwl",
            "inputs": [],
            "outputs": [],
        }))
        .unwrap();
        let err = tool.prepare(&json!({}), noop_callback(), &rt).unwrap_err();
        assert!(err.to_string().contains("Abstract operation"));
    }

    #[test]
    fn cache_key_ignores_requirement_listing_order_elsewhere() {
        // Permuting the job order map must not change the cache key: the
        // canonical serialization sorts keys.
        let a = cache::cache_key(&json!({"cmdline": ["t"], "a": 1, "b": 2}));
        let b = cache::cache_key(&json!({"b": 2, "a": 1, "cmdline": ["t"]}));
        assert_eq!(a, b);
    }
}
