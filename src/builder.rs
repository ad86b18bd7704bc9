use crate::{
    Result,
    error::Error,
    expr::{EvalContext, Evaluator},
    fs_access::FsAccess,
    mutation::MutationManager,
    path_mapper::PathMapper,
    value::{self, LoadListing},
};
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::sync::Arc;

pub type FsFactory = dyn Fn(&str) -> Arc<dyn FsAccess> + Send + Sync;

/// One command-line fragment. Bindings sort stably by `(position,
/// sort_index)`; the sort index is assigned at construction time
/// (baseCommand tokens, then arguments, then inputs in declared order).
#[derive(Debug, Clone)]
pub struct Binding {
    pub position: i64,
    pub sort_index: usize,
    pub prefix: Option<String>,
    pub value_from: Option<String>,
    pub shell_quote: bool,
    pub separate: bool,
    pub item_separator: Option<String>,
    pub datum: Value,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            position: 0,
            sort_index: 0,
            prefix: None,
            value_from: None,
            shell_quote: true,
            separate: true,
            item_separator: None,
            datum: Value::Null,
        }
    }
}

impl Binding {
    pub fn literal(datum: impl Into<Value>, position: i64, sort_index: usize) -> Self {
        Self {
            position,
            sort_index,
            datum: datum.into(),
            ..Default::default()
        }
    }

    /// Parse a CommandLineBinding object. `position` must be an integer
    /// (or an integer-shaped string); binding positions that are
    /// expressions are not supported here.
    pub fn from_value(v: &Value, datum: Value, sort_index: usize) -> Result<Self> {
        let position = match v.get("position") {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                Error::validation(format!("binding position must be an integer, got {n}"))
            })?,
            Some(Value::String(s)) => s.trim().parse().map_err(|_| {
                Error::validation(format!("binding position must be an integer, got '{s}'"))
            })?,
            Some(other) => {
                return Err(Error::validation(format!(
                    "binding position must be an integer, got {other}"
                )));
            }
        };
        Ok(Self {
            position,
            sort_index,
            prefix: v.get("prefix").and_then(|p| p.as_str()).map(String::from),
            value_from: v
                .get("valueFrom")
                .and_then(|p| p.as_str())
                .map(String::from),
            shell_quote: v.get("shellQuote").and_then(|b| b.as_bool()).unwrap_or(true),
            separate: v.get("separate").and_then(|b| b.as_bool()).unwrap_or(true),
            item_separator: v
                .get("itemSeparator")
                .and_then(|p| p.as_str())
                .map(String::from),
            datum,
        })
    }
}

/// The resolved job inputs plus everything needed to turn bindings into
/// argv tokens: sandbox paths, the path mapper, filesystem access, and the
/// expression evaluator.
pub struct Builder {
    pub job: Value,
    pub files: Vec<Value>,
    pub bindings: Vec<Binding>,
    pub pathmapper: Option<PathMapper>,
    pub fs_access: Arc<dyn FsAccess>,
    pub make_fs_access: Arc<FsFactory>,
    pub evaluator: Arc<dyn Evaluator>,
    pub outdir: String,
    pub tmpdir: String,
    pub stagedir: String,
    pub requirements: Vec<Value>,
    pub hints: Vec<Value>,
    pub resources: IndexMap<String, Value>,
    pub mutation_manager: Option<Arc<MutationManager>>,
    pub load_listing: LoadListing,
}

impl Builder {
    pub fn new(
        job: Value,
        fs_access: Arc<dyn FsAccess>,
        make_fs_access: Arc<FsFactory>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            job,
            files: vec![],
            bindings: vec![],
            pathmapper: None,
            fs_access,
            make_fs_access,
            evaluator,
            outdir: String::new(),
            tmpdir: String::new(),
            stagedir: String::new(),
            requirements: vec![],
            hints: vec![],
            resources: IndexMap::new(),
            mutation_manager: None,
            load_listing: LoadListing::default(),
        }
    }

    /// Evaluate a CWL expression-or-value. Non-strings and strings without
    /// `$(`/`${` markers pass through unchanged; everything else goes to
    /// the evaluator with `inputs`, `self`, and `runtime` in scope.
    pub fn do_eval(
        &self,
        ex: &Value,
        context: Option<&Value>,
        strip_whitespace: bool,
    ) -> Result<Value> {
        match ex {
            Value::String(s) => {
                let s = if strip_whitespace { s.trim() } else { s.as_str() };
                if !s.contains("$(") && !s.contains("${") {
                    return Ok(Value::String(s.to_string()));
                }
                let runtime = self.runtime_value();
                let ctx = EvalContext {
                    inputs: &self.job,
                    self_value: context,
                    runtime: &runtime,
                };
                self.evaluator.eval(s, &ctx)
            }
            other => Ok(other.clone()),
        }
    }

    /// The `runtime` object visible to expressions: resources plus the
    /// in-sandbox output and temporary directories.
    pub fn runtime_value(&self) -> Value {
        let mut rt = serde_json::Map::new();
        for (k, v) in &self.resources {
            rt.insert(k.clone(), v.clone());
        }
        rt.insert("outdir".into(), json!(self.outdir));
        rt.insert("tmpdir".into(), json!(self.tmpdir));
        Value::Object(rt)
    }

    pub fn sort_bindings(&mut self) {
        self.bindings.sort_by_key(|b| (b.position, b.sort_index));
    }

    /// Turn one binding into argv tokens.
    pub fn generate_arg(&self, binding: &Binding) -> Result<Vec<String>> {
        let mut value = binding.datum.clone();
        if let Some(vf) = &binding.value_from {
            value = self.do_eval(&Value::String(vf.clone()), Some(&binding.datum), true)?;
        }
        let prefix = binding.prefix.clone();
        let separate = binding.separate;
        if prefix.is_none() && !separate {
            return Err(Error::validation(
                "'separate: false' cannot be specified without a prefix",
            ));
        }
        let targets: Vec<Value> = match &value {
            Value::Array(items) => {
                if binding.item_separator.is_some() && !items.is_empty() {
                    let sep = binding.item_separator.as_deref().unwrap_or_default();
                    let joined = items
                        .iter()
                        .map(|v| self.tostr(v))
                        .collect::<Result<Vec<_>>>()?
                        .join(sep);
                    vec![Value::String(joined)]
                } else if binding.value_from.is_some() {
                    let mut out: Vec<String> = prefix.into_iter().collect();
                    for item in items {
                        out.push(self.tostr(item)?);
                    }
                    return Ok(out);
                } else if prefix.is_some() && !items.is_empty() {
                    return Ok(prefix.into_iter().collect());
                } else {
                    return Ok(vec![]);
                }
            }
            Value::Object(_) if matches!(value::class_of(&value), Some("File" | "Directory")) => {
                vec![value.clone()]
            }
            Value::Object(_) => return Ok(prefix.into_iter().collect()),
            Value::Bool(true) => return Ok(prefix.into_iter().collect()),
            Value::Bool(false) | Value::Null => return Ok(vec![]),
            _ => vec![value.clone()],
        };
        let mut args = vec![];
        for t in targets {
            let s = self.tostr(&t)?;
            if separate {
                if let Some(p) = &prefix {
                    args.push(p.clone());
                }
                args.push(s);
            } else if let Some(p) = &prefix {
                args.push(format!("{p}{s}"));
            } else {
                args.push(s);
            }
        }
        Ok(args)
    }

    fn tostr(&self, v: &Value) -> Result<String> {
        match v {
            Value::Object(_) if matches!(value::class_of(v), Some("File" | "Directory")) => v
                .get("path")
                .and_then(|p| p.as_str())
                .map(String::from)
                .ok_or_else(|| {
                    Error::workflow(format!(
                        "{} object is missing 'path' (not staged?): {v}",
                        value::class_of(v).unwrap_or_default()
                    ))
                }),
            Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        }
    }
}
