use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use volley_http::{HttpResponse, Method};

use crate::error::{Error, Result};
use crate::exec::IterationState;
use crate::json_path;
use crate::template::{JsonTemplate, Template};

/// Shared closure used by programmatic guards and checks.
pub struct Predicate<T: ?Sized>(Arc<dyn Fn(&T) -> bool + Send + Sync>);

impl<T: ?Sized> Predicate<T> {
    pub fn new(f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn test(&self, value: &T) -> bool {
        (self.0)(value)
    }
}

impl<T: ?Sized> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: ?Sized> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Decides whether a step runs, from iteration-local state.
#[derive(Debug, Clone)]
pub enum Guard {
    /// The variable is set and not null.
    Present(String),
    Absent(String),
    Custom(Predicate<IterationState>),
}

impl Guard {
    pub fn allows(&self, state: &IterationState) -> bool {
        match self {
            Guard::Present(var) => state.var(var).is_some_and(|v| !v.is_null()),
            Guard::Absent(var) => state.var(var).is_none_or(Value::is_null),
            Guard::Custom(p) => p.test(state),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CheckKind {
    /// Status is one of the listed codes.
    Status(Vec<u16>),
    /// The JSON body has a non-null value at the path.
    JsonPath(String),
    /// The JSON body has exactly this value at the path.
    JsonEquals { path: String, value: Value },
    BodyContains(String),
    Custom(Predicate<HttpResponse>),
}

/// A named assertion over one response; recorded into the `checks` rate.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}

impl Check {
    pub fn status(name: impl Into<String>, codes: impl Into<Vec<u16>>) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::Status(codes.into()),
        }
    }

    pub fn json_path(name: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        json_path::validate(&path).map_err(|reason| Error::template(&path, reason))?;
        Ok(Self {
            name: name.into(),
            kind: CheckKind::JsonPath(path),
        })
    }

    pub fn json_equals(name: impl Into<String>, path: impl Into<String>, value: Value) -> Result<Self> {
        let path = path.into();
        json_path::validate(&path).map_err(|reason| Error::template(&path, reason))?;
        Ok(Self {
            name: name.into(),
            kind: CheckKind::JsonEquals { path, value },
        })
    }

    pub fn body_contains(name: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::BodyContains(needle.into()),
        }
    }

    pub fn custom(
        name: impl Into<String>,
        f: impl Fn(&HttpResponse) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CheckKind::Custom(Predicate::new(f)),
        }
    }

    /// `json` is the parsed body, if it parsed.
    pub fn evaluate(&self, response: &HttpResponse, json: Option<&Value>) -> bool {
        match &self.kind {
            CheckKind::Status(codes) => codes.contains(&response.status),
            CheckKind::JsonPath(path) => json.and_then(|v| json_path::lookup(v, path)).is_some(),
            CheckKind::JsonEquals { path, value } => {
                json.and_then(|v| json_path::lookup(v, path)) == Some(value)
            }
            CheckKind::BodyContains(needle) => response
                .body_utf8()
                .is_some_and(|body| body.contains(needle.as_str())),
            CheckKind::Custom(p) => p.test(response),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpStep {
    pub method: Method,
    pub url: Template,
    pub headers: Vec<(String, Template)>,
    pub body: Option<JsonTemplate>,
    pub checks: Vec<Check>,
    /// A failed check or transport error ends the iteration as failed.
    pub fatal: bool,
    /// Overrides the run's request timeout.
    pub timeout: Option<Duration>,
    /// Statuses that count as success for `http_req_failed`; default `200..=399`.
    pub expected_statuses: Option<Vec<u16>>,
}

impl HttpStep {
    pub fn new(method: &str, url: &str) -> Result<Self> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidMethod(method.to_string()))?;
        Ok(Self {
            method,
            url: Template::parse(url)?,
            headers: Vec::new(),
            body: None,
            checks: Vec::new(),
            fatal: false,
            timeout: None,
            expected_statuses: None,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new("GET", url)
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: &str) -> Result<Self> {
        self.headers.push((name.into(), Template::parse(value)?));
        Ok(self)
    }

    pub fn with_body(mut self, body: &Value) -> Result<Self> {
        self.body = Some(JsonTemplate::compile(body)?);
        Ok(self)
    }

    #[must_use]
    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_expected_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.expected_statuses = Some(statuses.into());
        self
    }
}

/// Pacing delay; `jitter` adds a uniform extra in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Think {
    pub duration: Duration,
    pub jitter: Option<Duration>,
}

/// Copies a field of the last JSON response into iteration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extract {
    pub var: String,
    pub path: String,
    /// Append to a list variable instead of replacing it.
    pub collect: bool,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Http(HttpStep),
    Think(Think),
    Extract(Extract),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub guard: Option<Guard>,
    pub kind: StepKind,
}

impl Step {
    pub fn http(name: impl Into<String>, step: HttpStep) -> Self {
        Self {
            name: name.into(),
            guard: None,
            kind: StepKind::Http(step),
        }
    }

    pub fn think(name: impl Into<String>, duration: Duration, jitter: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            guard: None,
            kind: StepKind::Think(Think { duration, jitter }),
        }
    }

    pub fn extract(
        name: impl Into<String>,
        var: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        json_path::validate(&path).map_err(|reason| Error::template(&path, reason))?;
        Ok(Self {
            name: name.into(),
            guard: None,
            kind: StepKind::Extract(Extract {
                var: var.into(),
                path,
                collect: false,
            }),
        })
    }

    /// Appends instead of replacing; only meaningful on extract steps.
    #[must_use]
    pub fn collecting(mut self) -> Self {
        if let StepKind::Extract(e) = &mut self.kind {
            e.collect = true;
        }
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }
}

/// A named, weighted transaction: vars bound at iteration start, then steps in order.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub weight: f64,
    pub vars: Vec<(String, JsonTemplate)>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            vars: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Binds `name` at iteration start; string leaves of `value` are templates and may refer
    /// to variables bound before this one.
    pub fn with_var(mut self, name: impl Into<String>, value: &Value) -> Result<Self> {
        self.vars.push((name.into(), JsonTemplate::compile(value)?));
        Ok(self)
    }

    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}
