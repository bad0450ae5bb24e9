use rand::rngs::StdRng;
use rand::{Rng as _, RngCore as _};
use serde_json::{Map, Number, Value};

use crate::config::{EnvVars, env_lookup};
use crate::error::{Error, Result};
use crate::json_path;

/// Values a template can reach while rendering.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub setup: &'a Value,
    pub vars: &'a Map<String, Value>,
    pub env: &'a EnvVars,
    /// 1-based VU id; 0 during setup and teardown.
    pub vu: u64,
    /// Per-VU iteration counter, 0-based.
    pub iteration: u64,
    /// Repeat index of a setup step.
    pub index: Option<u64>,
    pub run_id: &'a str,
    pub scenario: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Setup,
    Vars,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Uuid,
    Vu,
    Iteration,
    Index,
    RunId,
    Scenario,
    Env(String),
    Path(Root, String),
    Random(Root, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A string with `{{ expr }}` placeholders, parsed once at plan load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| Error::template(source, "unterminated `{{`"))?;
            let expr = parse_expr(after[..close].trim()).map_err(|r| Error::template(source, r))?;
            segments.push(Segment::Expr(expr));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Renders to a JSON value. A template that is exactly one placeholder yields the raw value
    /// (arrays, objects, numbers survive); anything else is string interpolation.
    pub fn render_value(&self, scope: &Scope<'_>, rng: &mut StdRng) -> Value {
        if let [Segment::Expr(expr)] = self.segments.as_slice() {
            return eval(expr, scope, rng).unwrap_or(Value::Null);
        }
        Value::String(self.render(scope, rng))
    }

    /// Renders to text; missing values become empty strings.
    pub fn render(&self, scope: &Scope<'_>, rng: &mut StdRng) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Expr(expr) => {
                    if let Some(v) = eval(expr, scope, rng) {
                        push_text(&mut out, &v);
                    }
                }
            }
        }
        out
    }
}

fn push_text(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        other => out.push_str(&other.to_string()),
    }
}

fn parse_expr(expr: &str) -> std::result::Result<Expr, String> {
    if expr.is_empty() {
        return Err("empty placeholder".to_string());
    }

    match expr {
        "uuid" => return Ok(Expr::Uuid),
        "vu" => return Ok(Expr::Vu),
        "iteration" => return Ok(Expr::Iteration),
        "index" => return Ok(Expr::Index),
        "run_id" => return Ok(Expr::RunId),
        "scenario" => return Ok(Expr::Scenario),
        _ => {}
    }

    if let Some(name) = expr.strip_prefix("env.") {
        if name.is_empty() {
            return Err("`env.` needs a variable name".to_string());
        }
        return Ok(Expr::Env(name.to_string()));
    }

    if let Some(target) = expr.strip_prefix("random ") {
        let (root, path) = parse_path(target.trim())?;
        return Ok(Expr::Random(root, path));
    }

    let (root, path) = parse_path(expr)?;
    Ok(Expr::Path(root, path))
}

fn parse_path(expr: &str) -> std::result::Result<(Root, String), String> {
    let (root, path) = if expr == "setup" {
        (Root::Setup, "")
    } else if let Some(p) = expr.strip_prefix("setup.") {
        (Root::Setup, p)
    } else if let Some(p) = expr.strip_prefix("vars.") {
        (Root::Vars, p)
    } else {
        return Err(format!("unknown placeholder `{expr}`"));
    };

    if root == Root::Vars && path.is_empty() {
        return Err("`vars.` needs a variable name".to_string());
    }
    json_path::validate(path)?;
    Ok((root, path.to_string()))
}

fn resolve<'v>(root: Root, path: &str, scope: &Scope<'v>) -> Option<&'v Value> {
    match root {
        Root::Setup => json_path::lookup(scope.setup, path),
        Root::Vars => {
            let split = path.find(['.', '[']).unwrap_or(path.len());
            let (name, rest) = path.split_at(split);
            json_path::lookup(scope.vars.get(name)?, rest)
        }
    }
}

fn eval(expr: &Expr, scope: &Scope<'_>, rng: &mut StdRng) -> Option<Value> {
    match expr {
        Expr::Uuid => Some(Value::String(random_uuid(rng))),
        Expr::Vu => Some(Value::Number(Number::from(scope.vu))),
        Expr::Iteration => Some(Value::Number(Number::from(scope.iteration))),
        Expr::Index => scope.index.map(|i| Value::Number(Number::from(i))),
        Expr::RunId => Some(Value::String(scope.run_id.to_string())),
        Expr::Scenario => Some(Value::String(scope.scenario.to_string())),
        Expr::Env(name) => env_lookup(scope.env, name).map(|v| Value::String(v.to_string())),
        Expr::Path(root, path) => resolve(*root, path, scope).cloned(),
        Expr::Random(root, path) => match resolve(*root, path, scope)? {
            Value::Array(items) if !items.is_empty() => {
                items.get(rng.gen_range(0..items.len())).cloned()
            }
            _ => None,
        },
    }
}

/// Version-4 UUID drawn from `rng`, so seeded runs are reproducible.
pub fn random_uuid(rng: &mut StdRng) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

/// A JSON document whose string leaves are templates.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonTemplate {
    Null,
    Bool(bool),
    Number(Number),
    String(Template),
    Array(Vec<JsonTemplate>),
    Object(Vec<(String, JsonTemplate)>),
}

impl JsonTemplate {
    pub fn compile(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(Template::parse(s)?),
            Value::Array(items) => Self::Array(
                items
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::compile(v)?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    pub fn render(&self, scope: &Scope<'_>, rng: &mut StdRng) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(t) => t.render_value(scope, rng),
            Self::Array(items) => Value::Array(items.iter().map(|i| i.render(scope, rng)).collect()),
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.render(scope, rng)))
                    .collect(),
            ),
        }
    }
}
