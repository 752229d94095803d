//! Maps `(opType, entityType)` to a concrete HTTP route (spec §4.5). Kept as
//! a thin, deterministic translation layer — no retry, auth, or header
//! concerns live here, mirroring the way the teacher's order router only
//! translates an intent into a broker-agnostic request and nothing else.

use opsync_types::{OpType, PendingOp};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub method: reqwest::Method,
    /// e.g. `/v1/devices/{entity_id}`. `{entity_id}` substitutes
    /// `PendingOp::entity_id`; `{payload.<key>}` substitutes a scalar field
    /// out of `PendingOp::payload`.
    pub path_template: String,
    pub requires_idempotency: bool,
}

/// A `GET` route used by the reconciler to fetch the server's current view
/// of a resource (spec §4.6); not part of the `(opType, entityType)` table
/// since it's keyed by `entityType` alone.
#[derive(Debug, Clone)]
pub struct LookupRouteSpec {
    pub path_template: String,
}

#[derive(Debug, Clone)]
pub enum RouterError {
    NoRoute { op_type: OpType, entity_type: String },
    NoLookupRoute { entity_type: String },
    MissingTemplateField { field: String },
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::NoRoute { op_type, entity_type } => {
                write!(f, "no route registered for {op_type:?} {entity_type}")
            }
            RouterError::NoLookupRoute { entity_type } => {
                write!(f, "no lookup route registered for {entity_type}")
            }
            RouterError::MissingTemplateField { field } => {
                write!(f, "path template references missing field: {field}")
            }
        }
    }
}

impl std::error::Error for RouterError {}

pub struct Router {
    routes: HashMap<(OpType, String), RouteSpec>,
    lookup_routes: HashMap<String, LookupRouteSpec>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            lookup_routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, op_type: OpType, entity_type: impl Into<String>, spec: RouteSpec) {
        self.routes.insert((op_type, entity_type.into()), spec);
    }

    pub fn register_lookup(&mut self, entity_type: impl Into<String>, spec: LookupRouteSpec) {
        self.lookup_routes.insert(entity_type.into(), spec);
    }

    /// Resolve the `GET` route used by the reconciler (spec §4.6).
    pub fn resolve_lookup(&self, op: &PendingOp) -> Result<String, RouterError> {
        let spec = self
            .lookup_routes
            .get(&op.entity_type)
            .ok_or_else(|| RouterError::NoLookupRoute {
                entity_type: op.entity_type.clone(),
            })?;
        render_template(&spec.path_template, op)
    }

    /// Resolve `op` to a method and fully-substituted path. A `route_override`
    /// on the op bypasses the template entirely and is used verbatim as the
    /// path (spec §3.1) — the method is still taken from the registered route.
    pub fn resolve(&self, op: &PendingOp) -> Result<(reqwest::Method, String, bool), RouterError> {
        let spec = self
            .routes
            .get(&(op.op_type, op.entity_type.clone()))
            .ok_or_else(|| RouterError::NoRoute {
                op_type: op.op_type,
                entity_type: op.entity_type.clone(),
            })?;

        if let Some(override_path) = &op.route_override {
            return Ok((spec.method.clone(), override_path.clone(), spec.requires_idempotency));
        }

        let path = render_template(&spec.path_template, op)?;
        Ok((spec.method.clone(), path, spec.requires_idempotency))
    }
}

fn render_template(template: &str, op: &PendingOp) -> Result<String, RouterError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);
        let field = &rest[start + 1..start + end];
        out.push_str(&resolve_field(field, op)?);
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_field(field: &str, op: &PendingOp) -> Result<String, RouterError> {
    if field == "entity_id" {
        return op
            .entity_id
            .clone()
            .ok_or_else(|| RouterError::MissingTemplateField { field: field.to_string() });
    }
    if let Some(key) = field.strip_prefix("payload.") {
        let value = op
            .payload
            .get(key)
            .ok_or_else(|| RouterError::MissingTemplateField { field: field.to_string() })?;
        return Ok(match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    Err(RouterError::MissingTemplateField {
        field: field.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_types::{EnqueueOptions, Payload};

    fn op_with(op_type: OpType, entity_id: Option<&str>, payload: Payload) -> PendingOp {
        PendingOp::new(
            "op-1".into(),
            op_type,
            "device".into(),
            entity_id.map(str::to_string),
            payload,
            &EnqueueOptions::default(),
            chrono::DateTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn resolves_entity_id_into_path() {
        let mut router = Router::new();
        router.register(
            OpType::Update,
            "device",
            RouteSpec {
                method: reqwest::Method::PATCH,
                path_template: "/v1/devices/{entity_id}".into(),
                requires_idempotency: true,
            },
        );
        let op = op_with(OpType::Update, Some("d1"), Payload::new());
        let (method, path, requires_idempotency) = router.resolve(&op).unwrap();
        assert_eq!(method, reqwest::Method::PATCH);
        assert_eq!(path, "/v1/devices/d1");
        assert!(requires_idempotency);
    }

    #[test]
    fn route_override_bypasses_template() {
        let mut router = Router::new();
        router.register(
            OpType::Update,
            "device",
            RouteSpec {
                method: reqwest::Method::PATCH,
                path_template: "/v1/devices/{entity_id}".into(),
                requires_idempotency: true,
            },
        );
        let mut op = op_with(OpType::Update, Some("d1"), Payload::new());
        op.route_override = Some("/v1/devices/d1/special".into());
        let (_, path, _) = router.resolve(&op).unwrap();
        assert_eq!(path, "/v1/devices/d1/special");
    }

    #[test]
    fn missing_route_is_an_error() {
        let router = Router::new();
        let op = op_with(OpType::Create, None, Payload::new());
        assert!(router.resolve(&op).is_err());
    }

    #[test]
    fn missing_template_field_is_an_error() {
        let mut router = Router::new();
        router.register(
            OpType::Create,
            "device",
            RouteSpec {
                method: reqwest::Method::POST,
                path_template: "/v1/devices/{entity_id}".into(),
                requires_idempotency: true,
            },
        );
        let op = op_with(OpType::Create, None, Payload::new());
        assert!(router.resolve(&op).is_err());
    }
}
