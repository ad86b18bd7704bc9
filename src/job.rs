use crate::{
    Result, builder::Builder, cache::CacheLock, output::OutputCollector, path_mapper::PathMapper,
    value,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// CWL process status tokens, spelled the way they appear in status files
/// and workflow-level reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    Success,
    TemporaryFail,
    PermanentFail,
}

pub type OutputCallback = Box<dyn FnMut(Value, ProcessStatus) + Send>;

/// Which process-launching strategy the backend runner should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerBackend {
    Local,
    Docker,
    Singularity,
    UserSpaceDocker(String),
}

/// A fully prepared command-line job, ready to hand to a backend executor.
/// The executor stages files per the path mapper, launches the process,
/// and reports back through `complete`.
pub struct CommandJob {
    pub name: String,
    pub backend: ContainerBackend,
    pub command_line: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub environment: IndexMap<String, String>,
    pub timelimit: Option<i64>,
    pub networkaccess: bool,
    pub outdir: String,
    pub tmpdir: String,
    pub stagedir: String,
    /// The evaluated InitialWorkDirRequirement listing, as a Directory
    /// descriptor the backend materializes into the working directory.
    pub generatefiles: Value,
    pub inplace_update: bool,
    pub success_codes: Vec<i64>,
    pub temporary_fail_codes: Vec<i64>,
    pub permanent_fail_codes: Vec<i64>,
    pub requirements: Vec<Value>,
    pub hints: Vec<Value>,
    pub collect_outputs: OutputCollector,
    pub output_callback: Option<OutputCallback>,
}

impl CommandJob {
    pub fn builder(&self) -> &Builder {
        &self.collect_outputs.builder
    }

    pub fn pathmapper(&self) -> Option<&PathMapper> {
        self.collect_outputs.builder.pathmapper.as_ref()
    }

    /// Classify an exit code against the tool's declared code lists.
    pub fn status_for_exit(&self, code: i64) -> ProcessStatus {
        if self.success_codes.contains(&code) {
            ProcessStatus::Success
        } else if self.temporary_fail_codes.contains(&code) {
            ProcessStatus::TemporaryFail
        } else if self.permanent_fail_codes.contains(&code) {
            ProcessStatus::PermanentFail
        } else if code == 0 {
            ProcessStatus::Success
        } else {
            ProcessStatus::PermanentFail
        }
    }

    /// Collect outputs for a finished process and report them through the
    /// output callback. Collection failures downgrade the job to
    /// permanentFail with empty outputs rather than propagating.
    pub fn complete(&mut self, exit_code: i64) -> Result<(Value, ProcessStatus)> {
        let mut status = self.status_for_exit(exit_code);
        let outdir = self.outdir.clone();
        let outputs = match self.collect_outputs.collect(&outdir, exit_code) {
            Ok(outputs) => outputs,
            Err(err) if err.is_job_failure() => {
                error!("[job {}] job error: {err}", self.name);
                status = ProcessStatus::PermanentFail;
                json!({})
            }
            Err(err) => return Err(err),
        };
        if let Some(cb) = &mut self.output_callback {
            cb(outputs.clone(), status);
        }
        Ok((outputs, status))
    }
}

/// Stands in for a real job when the cache already holds a successful
/// result: running it replays the cached outputs. The shared cache lock is
/// held until the replay completes.
pub struct CallbackJob {
    pub name: String,
    pub collector: OutputCollector,
    pub outdir: String,
    pub output_callback: Option<OutputCallback>,
    pub(crate) lock: Option<CacheLock>,
}

impl CallbackJob {
    pub fn run(&mut self) -> Result<Value> {
        let outdir = self.outdir.clone();
        let outputs = self.collector.collect(&outdir, 0)?;
        if let Some(cb) = &mut self.output_callback {
            cb(outputs.clone(), ProcessStatus::Success);
        }
        drop(self.lock.take());
        Ok(outputs)
    }
}

/// Job for ExpressionTools: evaluating the expression is the whole job.
pub struct ExpressionJob {
    pub name: String,
    pub builder: Builder,
    pub script: String,
    pub requirements: Vec<Value>,
    pub hints: Vec<Value>,
    pub output_callback: Option<OutputCallback>,
}

impl ExpressionJob {
    pub fn run(&mut self) -> Result<Value> {
        match self.evaluate() {
            Ok(ev) => {
                if let Some(cb) = &mut self.output_callback {
                    cb(ev.clone(), ProcessStatus::Success);
                }
                Ok(ev)
            }
            Err(err) if err.is_job_failure() => {
                warn!("[job {}] failed to evaluate expression:\n{err}", self.name);
                let empty = json!({});
                if let Some(cb) = &mut self.output_callback {
                    cb(empty.clone(), ProcessStatus::PermanentFail);
                }
                Ok(empty)
            }
            Err(err) => Err(err),
        }
    }

    fn evaluate(&mut self) -> Result<Value> {
        value::normalize_files_dirs(&mut self.builder.job)?;
        let mut ev = self
            .builder
            .do_eval(&Value::String(self.script.clone()), None, true)?;
        value::normalize_files_dirs(&mut ev)?;
        Ok(ev)
    }
}

/// What `prepare` hands back: either a real job for a backend, a cache
/// replay, or an expression evaluation.
pub enum Prepared {
    Command(Box<CommandJob>),
    Callback(Box<CallbackJob>),
    Expression(Box<ExpressionJob>),
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prepared::Command(_) => write!(f, "Prepared::Command"),
            Prepared::Callback(_) => write!(f, "Prepared::Callback"),
            Prepared::Expression(_) => write!(f, "Prepared::Expression"),
        }
    }
}

impl Prepared {
    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Self::Callback(_))
    }

    pub fn into_command(self) -> Option<Box<CommandJob>> {
        match self {
            Self::Command(j) => Some(j),
            _ => None,
        }
    }

    pub fn into_callback(self) -> Option<Box<CallbackJob>> {
        match self {
            Self::Callback(j) => Some(j),
            _ => None,
        }
    }
}
