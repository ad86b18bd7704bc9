use crate::{Result, error::Error};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Evaluation scope for a single expression: `inputs` is the resolved job
/// object, `self_value` the context value (where CWL defines one),
/// `runtime` the resource map plus sandbox paths.
pub struct EvalContext<'a> {
    pub inputs: &'a Value,
    pub self_value: Option<&'a Value>,
    pub runtime: &'a Value,
}

/// The expression evaluation seam. The full sandboxed JavaScript
/// interpreter lives outside this crate; implementations receive the raw
/// expression string (already known to contain `$(`/`${` markers) and the
/// evaluation scope.
pub trait Evaluator: Send + Sync {
    fn eval(&self, expr: &str, ctx: &EvalContext) -> Result<Value>;
}

/// Built-in evaluator for CWL parameter references: `$(inputs.f.path)`,
/// `$(runtime.outdir)`, `$(self[0].basename)`, `$(inputs["a key"])`, and
/// string interpolation thereof. Anything requiring JavaScript is refused
/// so the caller knows to plug a real sandbox in.
#[derive(Debug, Default)]
pub struct ParamRefEvaluator;

enum Piece {
    Lit(String),
    Val(Value),
}

impl Evaluator for ParamRefEvaluator {
    fn eval(&self, expr: &str, ctx: &EvalContext) -> Result<Value> {
        let chars: Vec<char> = expr.chars().collect();
        let len = chars.len();
        let mut pieces: Vec<Piece> = vec![];
        let mut lit = String::new();
        let mut i = 0;
        while i < len {
            if chars[i] == '\\' && i + 1 < len && (chars[i + 1] == '$' || chars[i + 1] == '\\') {
                lit.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if chars[i] == '$' && i + 1 < len && chars[i + 1] == '{' {
                return Err(js_required(expr));
            }
            if chars[i] == '$' && i + 1 < len && chars[i + 1] == '(' {
                let mut depth = 0usize;
                let mut quote: Option<char> = None;
                let mut j = i + 1;
                while j < len {
                    let c = chars[j];
                    match quote {
                        Some(q) => {
                            if c == q {
                                quote = None;
                            }
                        }
                        None => match c {
                            '\'' | '"' => quote = Some(c),
                            '(' => depth += 1,
                            ')' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        },
                    }
                    j += 1;
                }
                if depth != 0 || j >= len {
                    return Err(Error::workflow(format!(
                        "unbalanced parentheses in expression '{expr}'"
                    )));
                }
                let body: String = chars[i + 2..j].iter().collect();
                if !lit.is_empty() {
                    pieces.push(Piece::Lit(std::mem::take(&mut lit)));
                }
                pieces.push(Piece::Val(resolve_ref(&body, ctx)?));
                i = j + 1;
                continue;
            }
            lit.push(chars[i]);
            i += 1;
        }
        if !lit.is_empty() {
            pieces.push(Piece::Lit(lit));
        }
        // A bare reference keeps its type; anything else interpolates.
        if pieces.len() == 1 {
            if let Piece::Val(v) = &pieces[0] {
                return Ok(v.clone());
            }
        }
        let mut out = String::new();
        for piece in pieces {
            match piece {
                Piece::Lit(s) => out.push_str(&s),
                Piece::Val(Value::String(s)) => out.push_str(&s),
                Piece::Val(v) => out.push_str(&v.to_string()),
            }
        }
        Ok(Value::String(out))
    }
}

static ROOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").expect("root regex")
});
static SEG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:\.([A-Za-z_][A-Za-z0-9_]*)|\[(\d+)\]|\['([^']*)'\]|\["([^"]*)"\])"#)
        .expect("segment regex")
});

fn resolve_ref(body: &str, ctx: &EvalContext) -> Result<Value> {
    let body = body.trim();
    let root = ROOT_RE.find(body).ok_or_else(|| js_required(body))?;
    let mut cur = match root.as_str() {
        "inputs" => ctx.inputs.clone(),
        "self" => ctx.self_value.cloned().unwrap_or(Value::Null),
        "runtime" => ctx.runtime.clone(),
        _ => return Err(js_required(body)),
    };
    let mut rest = &body[root.end()..];
    while !rest.is_empty() {
        let caps = SEG_RE.captures(rest).ok_or_else(|| js_required(body))?;
        let whole = caps.get(0).expect("capture 0").as_str();
        cur = if let Some(key) = caps.get(1).or(caps.get(3)).or(caps.get(4)) {
            cur.get(key.as_str()).cloned().unwrap_or(Value::Null)
        } else if let Some(idx) = caps.get(2) {
            idx.as_str()
                .parse::<usize>()
                .ok()
                .and_then(|i| cur.get(i).cloned())
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        rest = &rest[whole.len()..];
    }
    Ok(cur)
}

fn js_required(expr: &str) -> Error {
    Error::workflow(format!(
        "expression '{expr}' is not a parameter reference; a JavaScript-capable evaluator is required"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(inputs: &'a Value, runtime: &'a Value) -> EvalContext<'a> {
        EvalContext {
            inputs,
            self_value: None,
            runtime,
        }
    }

    #[test]
    fn bare_reference_keeps_type() {
        let inputs = json!({"threads": 8, "f": {"class": "File", "path": "/stage/in.txt"}});
        let runtime = json!({"outdir": "/out"});
        let e = ParamRefEvaluator;
        assert_eq!(e.eval("$(inputs.threads)", &ctx(&inputs, &runtime)).unwrap(), json!(8));
        assert_eq!(
            e.eval("$(inputs.f.path)", &ctx(&inputs, &runtime)).unwrap(),
            json!("/stage/in.txt")
        );
        assert_eq!(
            e.eval("$(runtime.outdir)", &ctx(&inputs, &runtime)).unwrap(),
            json!("/out")
        );
    }

    #[test]
    fn interpolation_stringifies() {
        let inputs = json!({"n": 3, "name": "x"});
        let runtime = json!({});
        let e = ParamRefEvaluator;
        assert_eq!(
            e.eval("$(inputs.name)-$(inputs.n).txt", &ctx(&inputs, &runtime))
                .unwrap(),
            json!("x-3.txt")
        );
    }

    #[test]
    fn self_and_index_access() {
        let inputs = json!({});
        let runtime = json!({});
        let selfv = json!([{"basename": "a.bam"}]);
        let c = EvalContext {
            inputs: &inputs,
            self_value: Some(&selfv),
            runtime: &runtime,
        };
        let e = ParamRefEvaluator;
        assert_eq!(e.eval("$(self[0].basename)", &c).unwrap(), json!("a.bam"));
    }

    #[test]
    fn quoted_keys() {
        let inputs = json!({"a key": 1});
        let runtime = json!({});
        let e = ParamRefEvaluator;
        assert_eq!(
            e.eval(r#"$(inputs["a key"])"#, &ctx(&inputs, &runtime)).unwrap(),
            json!(1)
        );
        assert_eq!(
            e.eval(r"$(inputs['a key'])", &ctx(&inputs, &runtime)).unwrap(),
            json!(1)
        );
    }

    #[test]
    fn escaped_dollar_is_literal() {
        let inputs = json!({});
        let runtime = json!({});
        let e = ParamRefEvaluator;
        assert_eq!(
            e.eval(r"\$(inputs.x)", &ctx(&inputs, &runtime)).unwrap(),
            json!("$(inputs.x)")
        );
    }

    #[test]
    fn javascript_is_refused() {
        let inputs = json!({});
        let runtime = json!({});
        let e = ParamRefEvaluator;
        assert!(e.eval("${ return 1; }", &ctx(&inputs, &runtime)).is_err());
        assert!(e.eval("$(1 + 2)", &ctx(&inputs, &runtime)).is_err());
    }
}
