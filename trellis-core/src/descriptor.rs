//! Operation and resource descriptors.
//!
//! A descriptor is the static description of one resource operation: its
//! stable id, its HTTP surface (verbs and path template), the parameters it
//! binds and where they come from, and the compaction hint of the entries it
//! produces. A [`ResourceDescriptor`] groups them per resource type and
//! supports both lookup directions:
//!
//! - URL to operation: [`ResourceDescriptor::route`] + [`OperationDescriptor::extract`]
//!   (used by the HTTP front-end)
//! - operation id to descriptor: [`ResourceDescriptor::operation`]
//!   (used by the dispatcher and the proposer)

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::operation::{CompactionMode, OperationId, OperationKind};

pub const APPLICATION_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Put,
    Post,
    Delete,
}

impl FromStr for HttpVerb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpVerb::Get),
            "PUT" => Ok(HttpVerb::Put),
            "POST" => Ok(HttpVerb::Post),
            "DELETE" => Ok(HttpVerb::Delete),
            other => Err(Error::bad_request(format!("unsupported method: {}", other))),
        }
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpVerb::Get => "GET",
            HttpVerb::Put => "PUT",
            HttpVerb::Post => "POST",
            HttpVerb::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Path,
    Query,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    /// Any JSON value. URL segments that do not parse as JSON are taken as strings.
    Json,
}

impl ParamType {
    /// Convert a raw URL segment or query value.
    fn coerce(self, name: &str, raw: &str) -> Result<Value> {
        match self {
            ParamType::String => Ok(Value::String(raw.to_string())),
            ParamType::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| Error::bad_request(format!("parameter '{}' must be an integer", name))),
            ParamType::Boolean => raw
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|_| Error::bad_request(format!("parameter '{}' must be a boolean", name))),
            ParamType::Json => {
                Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
            }
        }
    }

    /// Check a value taken from a JSON body, accepting stringly-typed scalars.
    fn normalize(self, name: &str, value: Value) -> Result<Value> {
        match (self, value) {
            (ParamType::Integer, Value::String(s)) => self.coerce(name, &s),
            (ParamType::Integer, v) if v.is_i64() || v.is_u64() => Ok(v),
            (ParamType::Integer, _) => Err(Error::bad_request(format!(
                "parameter '{}' must be an integer",
                name
            ))),
            (ParamType::Boolean, Value::String(s)) => self.coerce(name, &s),
            (ParamType::Boolean, v @ Value::Bool(_)) => Ok(v),
            (ParamType::Boolean, _) => Err(Error::bad_request(format!(
                "parameter '{}' must be a boolean",
                name
            ))),
            (_, v) => Ok(v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub source: ParamSource,
    pub ty: ParamType,
    pub required: bool,
}

/// How the compaction hint of a command is derived from its arguments.
#[derive(Debug, Clone)]
pub enum CompactionRule {
    Fixed(CompactionMode),
    /// `then` when the integer argument `field` is present and positive.
    IfPositive {
        field: &'static str,
        then: CompactionMode,
        otherwise: CompactionMode,
    },
}

impl CompactionRule {
    pub fn resolve(&self, args: &Value) -> CompactionMode {
        match self {
            CompactionRule::Fixed(mode) => *mode,
            CompactionRule::IfPositive {
                field,
                then,
                otherwise,
            } => {
                let positive = args
                    .get(*field)
                    .and_then(Value::as_i64)
                    .map(|v| v > 0)
                    .unwrap_or(false);
                if positive {
                    *then
                } else {
                    *otherwise
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Path template relative to a resource, e.g. `/put/{key}`.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Self {
        let segments = split(raw)
            .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names of the `{param}` segments, in order.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Match a concrete path and return the bound parameters.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = split(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut bound = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => bound.push((name.clone(), part.to_string())),
            }
        }
        Some(bound)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Static description of a single resource operation.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub id: OperationId,
    pub name: &'static str,
    pub kind: OperationKind,
    pub verbs: Vec<HttpVerb>,
    pub path: PathTemplate,
    pub params: Vec<ParameterDescriptor>,
    pub consumes: &'static str,
    pub produces: &'static str,
    pub compaction: CompactionRule,
}

impl OperationDescriptor {
    /// A mutating operation, reachable by default as `POST /{name}`.
    pub fn command(id: OperationId, name: &'static str) -> Self {
        Self::new(id, name, OperationKind::Command, vec![HttpVerb::Post])
    }

    /// A read-only operation, reachable by default as `GET /{name}`.
    pub fn query(id: OperationId, name: &'static str) -> Self {
        Self::new(id, name, OperationKind::Query, vec![HttpVerb::Get])
    }

    fn new(id: OperationId, name: &'static str, kind: OperationKind, verbs: Vec<HttpVerb>) -> Self {
        Self {
            id,
            name,
            kind,
            verbs,
            path: PathTemplate::parse(&format!("/{}", name)),
            params: Vec::new(),
            consumes: APPLICATION_JSON,
            produces: APPLICATION_JSON,
            compaction: CompactionRule::Fixed(CompactionMode::Quorum),
        }
    }

    pub fn verbs(mut self, verbs: &[HttpVerb]) -> Self {
        self.verbs = verbs.to_vec();
        self
    }

    /// Replace the path template. Every `{param}` in it becomes a required
    /// path parameter of the given type.
    pub fn path(mut self, template: &str, ty: ParamType) -> Self {
        self.path = PathTemplate::parse(template);
        let names: Vec<String> = self.path.params().map(str::to_string).collect();
        for name in names {
            self.params.retain(|p| p.name != name);
            self.params.push(ParameterDescriptor {
                name,
                source: ParamSource::Path,
                ty,
                required: true,
            });
        }
        self
    }

    /// Required argument taken from the request body.
    pub fn arg(self, name: &'static str, ty: ParamType) -> Self {
        self.param(name, ParamSource::Body, ty, true)
    }

    /// Optional argument taken from the request body.
    pub fn opt(self, name: &'static str, ty: ParamType) -> Self {
        self.param(name, ParamSource::Body, ty, false)
    }

    /// Optional argument taken from the query string (falls back to the body).
    pub fn query_param(self, name: &'static str, ty: ParamType) -> Self {
        self.param(name, ParamSource::Query, ty, false)
    }

    fn param(mut self, name: &'static str, source: ParamSource, ty: ParamType, required: bool) -> Self {
        self.params.retain(|p| p.name != name);
        self.params.push(ParameterDescriptor {
            name: name.to_string(),
            source,
            ty,
            required,
        });
        self
    }

    pub fn compaction(mut self, mode: CompactionMode) -> Self {
        self.compaction = CompactionRule::Fixed(mode);
        self
    }

    /// `then` when the integer argument `field` is positive, `otherwise` if not.
    pub fn compaction_if_positive(
        mut self,
        field: &'static str,
        then: CompactionMode,
        otherwise: CompactionMode,
    ) -> Self {
        self.compaction = CompactionRule::IfPositive {
            field,
            then,
            otherwise,
        };
        self
    }

    pub fn is_command(&self) -> bool {
        self.kind == OperationKind::Command
    }

    pub fn compaction_for(&self, args: &Value) -> CompactionMode {
        self.compaction.resolve(args)
    }

    /// Build the argument object for this operation.
    ///
    /// Path and query parameters fall back to fields of the body object, so
    /// the generic `/{op}` form can carry everything in the body. When the
    /// operation declares a single body argument and the body is not an
    /// object naming it, the whole body is that argument.
    pub fn extract(
        &self,
        path_params: &[(String, String)],
        query: &HashMap<String, String>,
        body: &Value,
    ) -> Result<Value> {
        let body_args = self
            .params
            .iter()
            .filter(|p| p.source == ParamSource::Body)
            .count();
        let mut args = Map::new();

        for p in &self.params {
            let from_url = match p.source {
                ParamSource::Path => path_params
                    .iter()
                    .find(|(name, _)| *name == p.name)
                    .map(|(_, raw)| p.ty.coerce(&p.name, raw))
                    .transpose()?,
                ParamSource::Query => query
                    .get(&p.name)
                    .map(|raw| p.ty.coerce(&p.name, raw))
                    .transpose()?,
                ParamSource::Body => None,
            };

            let value = match from_url {
                Some(v) => Some(v),
                None => match body.get(p.name.as_str()) {
                    Some(v) => Some(p.ty.normalize(&p.name, v.clone())?),
                    None if p.source == ParamSource::Body && body_args == 1 && !body.is_null() => {
                        Some(p.ty.normalize(&p.name, body.clone())?)
                    }
                    None => None,
                },
            };

            match value {
                Some(v) => {
                    args.insert(p.name.clone(), v);
                }
                None if p.required => {
                    return Err(Error::bad_request(format!(
                        "missing parameter '{}' for operation '{}'",
                        p.name, self.name
                    )))
                }
                None => {}
            }
        }

        Ok(Value::Object(args))
    }
}

/// The full operation table of one resource type.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub type_name: &'static str,
    operations: Vec<OperationDescriptor>,
    by_id: HashMap<OperationId, usize>,
    by_name: HashMap<&'static str, usize>,
}

impl ResourceDescriptor {
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            operations: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub(crate) fn push(&mut self, op: OperationDescriptor) -> Result<()> {
        if self.by_id.contains_key(&op.id) || self.by_name.contains_key(op.name) {
            return Err(Error::internal(format!(
                "duplicate operation {} ({}) on {}",
                op.name, op.id, self.type_name
            )));
        }
        let pos = self.operations.len();
        self.by_id.insert(op.id, pos);
        self.by_name.insert(op.name, pos);
        self.operations.push(op);
        Ok(())
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.iter()
    }

    pub fn operation(&self, id: OperationId) -> Option<&OperationDescriptor> {
        self.by_id.get(&id).map(|&i| &self.operations[i])
    }

    pub fn operation_by_name(&self, name: &str) -> Option<&OperationDescriptor> {
        self.by_name.get(name).map(|&i| &self.operations[i])
    }

    /// Resolve an operation selector given either as its name or its id.
    pub fn resolve(&self, selector: &Value) -> Result<&OperationDescriptor> {
        let found = match selector {
            Value::String(s) => match s.parse::<OperationId>() {
                Ok(id) => self.operation(id),
                Err(_) => self.operation_by_name(s),
            },
            Value::Number(n) => n
                .as_i64()
                .and_then(|id| OperationId::try_from(id).ok())
                .and_then(|id| self.operation(id)),
            _ => None,
        };
        found.ok_or_else(|| {
            Error::UnknownOperation(format!("{} on {}", selector, self.type_name))
        })
    }

    /// Find the operation serving `verb path`, where `path` is relative to
    /// the resource. Literal templates win over the generic `/{op}` form,
    /// which wins over templates with parameters.
    pub fn route(
        &self,
        verb: HttpVerb,
        path: &str,
    ) -> Result<(&OperationDescriptor, Vec<(String, String)>)> {
        let candidates = || self.operations.iter().filter(|op| op.verbs.contains(&verb));

        for op in candidates() {
            if op.path.params().next().is_none() && op.path.matches(path).is_some() {
                return Ok((op, Vec::new()));
            }
        }

        let mut parts = split(path);
        if let (Some(name), None) = (parts.next(), parts.next()) {
            if let Some(op) = self.operation_by_name(name) {
                if op.verbs.contains(&verb) {
                    return Ok((op, Vec::new()));
                }
            }
        }

        for op in candidates() {
            if let Some(bound) = op.path.matches(path) {
                return Ok((op, bound));
            }
        }

        Err(Error::UnknownOperation(format!(
            "{} {} on {}",
            verb, path, self.type_name
        )))
    }
}
