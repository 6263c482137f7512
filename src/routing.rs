//! Routing engine: match a queue message to a route, transform its
//! payload, and map message fields onto headers and query parameters.
//!
//! Routes are validated and their expressions compiled at startup; an
//! unsupported expression language is a configuration error, never a
//! runtime one.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::util::{nested_value, scalar_string};

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9-]+$").expect("static pattern"));
static TEMPLATE_SLOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("static pattern"));

/// Type of payload transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformType {
    Jq,
    Jsonpath,
    Template,
    Passthrough,
}

/// A single routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    pub name: String,
    pub description: Option<String>,

    /// Dot path into the full message, e.g. `metadata.type`.
    pub match_field: Option<String>,
    pub match_value: Option<String>,
    pub match_pattern: Option<String>,
    pub is_default: bool,
    /// Higher priority wins.
    pub priority: i32,

    pub endpoint: String,
    pub method: Option<String>,

    pub transform_type: TransformType,
    pub transform: Option<String>,

    /// Header name → dot path into the full message.
    pub header_mappings: Option<HashMap<String, String>>,
    /// Query parameter name → dot path into the full message.
    pub query_params: Option<HashMap<String, String>>,

    pub enabled: bool,
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            match_field: None,
            match_value: None,
            match_pattern: None,
            is_default: false,
            priority: 0,
            endpoint: String::new(),
            method: None,
            transform_type: TransformType::Passthrough,
            transform: None,
            header_mappings: None,
            query_params: None,
            enabled: true,
            timeout: None,
            max_retries: None,
        }
    }
}

/// Routing configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub version: String,
    pub routes: Vec<Route>,
    /// Endpoint name or bare URL used when no route matches.
    pub default_endpoint: Option<String>,
    pub enable_fallback: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            routes: Vec::new(),
            default_endpoint: None,
            enable_fallback: true,
        }
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub route_name: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
}

struct CompiledRoute {
    route: Route,
    pattern: Option<Regex>,
    json_path: Option<JsonPath>,
    #[cfg(feature = "jq")]
    jq_filter: Option<jaq_interpret::Filter>,
}

pub struct RoutingEngine {
    /// Enabled non-default routes, priority descending.
    routes: Vec<CompiledRoute>,
    /// Enabled default routes, priority descending.
    defaults: Vec<CompiledRoute>,
    default_endpoint: Option<String>,
    enable_fallback: bool,
}

impl RoutingEngine {
    pub fn new(config: RouteConfig) -> Result<Self> {
        validate_config(&config)?;

        let mut enabled: Vec<&Route> = config.routes.iter().filter(|r| r.enabled).collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut routes = Vec::new();
        let mut defaults = Vec::new();
        for route in enabled {
            let compiled = compile_route(route.clone())?;
            if route.is_default {
                defaults.push(compiled);
            } else {
                routes.push(compiled);
            }
        }

        info!(
            "Routing engine initialized with {} routes ({} default)",
            routes.len() + defaults.len(),
            defaults.len()
        );

        Ok(Self {
            routes,
            defaults,
            default_endpoint: config.default_endpoint,
            enable_fallback: config.enable_fallback,
        })
    }

    /// Load a routing configuration from a YAML or JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::config(format!("cannot read routing config {}: {}", path.display(), e))
        })?;

        let config: RouteConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(RelayError::config(format!(
                    "unsupported routing config format: {:?}",
                    other
                )))
            }
        };
        Self::new(config)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let config: RouteConfig = serde_json::from_value(value)?;
        Self::new(config)
    }

    /// Route a full queue message. First matching route wins; default
    /// routes apply only when no non-default route matched.
    pub fn route(&self, message: &Value) -> Result<RoutingResult> {
        let matched = self
            .routes
            .iter()
            .find(|r| matches_route(r, message))
            .or_else(|| self.defaults.first());

        let Some(compiled) = matched else {
            if self.enable_fallback {
                if let Some(endpoint) = &self.default_endpoint {
                    debug!("No route matched, falling back to default endpoint");
                    return Ok(RoutingResult {
                        route_name: None,
                        endpoint: endpoint.clone(),
                        method: "POST".to_string(),
                        payload: passthrough_payload(message),
                        headers: HashMap::new(),
                        query_params: HashMap::new(),
                        timeout: None,
                        max_retries: None,
                    });
                }
            }
            return Err(RelayError::routing(
                "no matching route found and no default configured",
            ));
        };

        let route = &compiled.route;
        debug!("Route matched: {}", route.name);

        let payload = transform_payload(compiled, message)?;
        let headers = map_fields(route.header_mappings.as_ref(), message);
        let query_params = map_fields(route.query_params.as_ref(), message);

        Ok(RoutingResult {
            route_name: Some(route.name.clone()),
            endpoint: route.endpoint.clone(),
            method: route.method.clone().unwrap_or_else(|| "POST".to_string()),
            payload,
            headers,
            query_params,
            timeout: route.timeout,
            max_retries: route.max_retries,
        })
    }
}

fn compile_route(route: Route) -> Result<CompiledRoute> {
    let pattern = match &route.match_pattern {
        Some(p) => Some(Regex::new(p).map_err(|e| {
            RelayError::config(format!("route '{}' has invalid pattern: {}", route.name, e))
        })?),
        None => None,
    };

    let json_path = match (&route.transform_type, &route.transform) {
        (TransformType::Jsonpath, Some(expr)) => Some(JsonPath::parse(expr).map_err(|e| {
            RelayError::config(format!(
                "route '{}' has invalid jsonpath expression: {}",
                route.name, e
            ))
        })?),
        _ => None,
    };

    #[cfg(feature = "jq")]
    let jq_filter = match (&route.transform_type, &route.transform) {
        (TransformType::Jq, Some(expr)) => Some(compile_jq(&route.name, expr)?),
        _ => None,
    };

    Ok(CompiledRoute {
        route,
        pattern,
        json_path,
        #[cfg(feature = "jq")]
        jq_filter,
    })
}

#[cfg(feature = "jq")]
fn compile_jq(route_name: &str, expr: &str) -> Result<jaq_interpret::Filter> {
    use jaq_interpret::ParseCtx;

    let mut ctx = ParseCtx::new(Vec::new());
    ctx.insert_natives(jaq_core::core());
    ctx.insert_defs(jaq_std::std());

    let (main, errors) = jaq_parse::parse(expr, jaq_parse::main());
    if !errors.is_empty() {
        return Err(RelayError::config(format!(
            "route '{}' has invalid jq expression: {:?}",
            route_name, errors
        )));
    }
    let main = main.ok_or_else(|| {
        RelayError::config(format!("route '{}' has empty jq expression", route_name))
    })?;

    let filter = ctx.compile(main);
    if !ctx.errs.is_empty() {
        return Err(RelayError::config(format!(
            "route '{}' jq expression failed to compile ({} undefined references)",
            route_name,
            ctx.errs.len()
        )));
    }
    Ok(filter)
}

fn matches_route(compiled: &CompiledRoute, message: &Value) -> bool {
    let route = &compiled.route;
    let Some(field) = &route.match_field else {
        return false;
    };
    let Some(field_value) = nested_value(message, field) else {
        return false;
    };
    let field_str = scalar_string(field_value);

    if let Some(expected) = &route.match_value {
        return field_str == *expected;
    }
    if let Some(pattern) = &compiled.pattern {
        // Match anchored at the start of the value.
        return pattern
            .find(&field_str)
            .map(|m| m.start() == 0)
            .unwrap_or(false);
    }
    false
}

/// The passthrough payload: the message's `payload` field, or the whole
/// message when it has none.
fn passthrough_payload(message: &Value) -> Value {
    message.get("payload").cloned().unwrap_or_else(|| message.clone())
}

fn transform_payload(compiled: &CompiledRoute, message: &Value) -> Result<Value> {
    let route = &compiled.route;
    let Some(expr) = &route.transform else {
        return Ok(passthrough_payload(message));
    };

    match route.transform_type {
        TransformType::Passthrough => Ok(passthrough_payload(message)),
        TransformType::Jsonpath => {
            let path = compiled
                .json_path
                .as_ref()
                .ok_or_else(|| RelayError::transform("jsonpath expression not compiled"))?;
            let matches: Vec<Value> = path.query(message).all().into_iter().cloned().collect();
            if matches.len() == 1 {
                Ok(matches.into_iter().next().expect("single match"))
            } else {
                Ok(serde_json::json!({ "result": matches }))
            }
        }
        TransformType::Template => apply_template(expr, message),
        TransformType::Jq => {
            #[cfg(feature = "jq")]
            {
                let filter = compiled
                    .jq_filter
                    .as_ref()
                    .ok_or_else(|| RelayError::transform("jq expression not compiled"))?;
                apply_jq(filter, message)
            }
            #[cfg(not(feature = "jq"))]
            {
                // Validation rejects jq routes in builds without the
                // feature; this is unreachable in practice.
                Err(RelayError::transform("jq transforms not compiled in"))
            }
        }
    }
}

#[cfg(feature = "jq")]
fn apply_jq(filter: &jaq_interpret::Filter, message: &Value) -> Result<Value> {
    use jaq_interpret::{Ctx, FilterT, RcIter, Val};

    let inputs = RcIter::new(core::iter::empty());
    let mut outputs = filter.run((Ctx::new([], &inputs), Val::from(message.clone())));

    match outputs.next() {
        Some(Ok(value)) => Ok(Value::from(value)),
        Some(Err(e)) => Err(RelayError::transform(format!("jq transform failed: {}", e))),
        None => Ok(serde_json::json!({})),
    }
}

/// Substitute `{{dot.path}}` slots against the message, then parse the
/// result as JSON. Strings substitute verbatim (the template supplies the
/// quotes); objects and arrays substitute as compact JSON; missing values
/// substitute the literal `null`.
fn apply_template(template: &str, message: &Value) -> Result<Value> {
    let mut rendered = template.to_string();
    for capture in TEMPLATE_SLOT.captures_iter(template) {
        let slot = capture.get(0).expect("whole match").as_str();
        let path = capture.get(1).expect("slot path").as_str().trim();
        let replacement = match nested_value(message, path) {
            Some(value) => scalar_string(value),
            None => "null".to_string(),
        };
        rendered = rendered.replace(slot, &replacement);
    }
    serde_json::from_str(&rendered)
        .map_err(|e| RelayError::transform(format!("template produced invalid JSON: {}", e)))
}

fn map_fields(
    mappings: Option<&HashMap<String, String>>,
    message: &Value,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(mappings) = mappings else {
        return out;
    };
    for (name, path) in mappings {
        match nested_value(message, path) {
            Some(Value::Null) | None => {}
            Some(value) => {
                out.insert(name.clone(), scalar_string(value));
            }
        }
    }
    out
}

fn balanced_braces(expr: &str) -> bool {
    let mut depth: i64 = 0;
    for c in expr.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn validate_config(config: &RouteConfig) -> Result<()> {
    let mut seen = std::collections::HashSet::new();

    for route in &config.routes {
        if !NAME_PATTERN.is_match(&route.name) {
            return Err(RelayError::config(format!(
                "route name '{}' must match [a-z0-9-]+",
                route.name
            )));
        }
        if !seen.insert(route.name.clone()) {
            return Err(RelayError::config(format!(
                "duplicate route name '{}'",
                route.name
            )));
        }
        if route.endpoint.is_empty() {
            return Err(RelayError::config(format!(
                "route '{}' has no endpoint",
                route.name
            )));
        }

        // Exactly one of: default, value match, pattern match.
        let criteria = [
            route.is_default,
            route.match_value.is_some(),
            route.match_pattern.is_some(),
        ]
        .iter()
        .filter(|c| **c)
        .count();
        if criteria != 1 {
            return Err(RelayError::config(format!(
                "route '{}' must have exactly one of is_default, match_value, match_pattern",
                route.name
            )));
        }
        if !route.is_default && route.match_field.is_none() {
            return Err(RelayError::config(format!(
                "route '{}' has match criteria but no match_field",
                route.name
            )));
        }

        match (&route.transform_type, &route.transform) {
            (TransformType::Passthrough, _) => {}
            (_, None) => {
                return Err(RelayError::config(format!(
                    "route '{}' requires a transform expression",
                    route.name
                )))
            }
            (TransformType::Jq, Some(expr)) | (TransformType::Template, Some(expr)) => {
                if !balanced_braces(expr) {
                    return Err(RelayError::config(format!(
                        "route '{}' has unbalanced braces in its transform",
                        route.name
                    )));
                }
                if route.transform_type == TransformType::Jq && !cfg!(feature = "jq") {
                    return Err(RelayError::config(format!(
                        "route '{}' uses jq transforms, which are not compiled into this \
                         build; rebuild with --features jq",
                        route.name
                    )));
                }
            }
            (TransformType::Jsonpath, Some(_)) => {}
        }
    }

    if config.routes.iter().all(|r| !r.enabled)
        && config.default_endpoint.is_none()
        && !config.routes.is_empty()
    {
        warn!("All routes disabled and no default endpoint configured");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route(name: &str) -> Route {
        Route {
            name: name.to_string(),
            endpoint: "api".to_string(),
            ..Default::default()
        }
    }

    fn engine(routes: Vec<Route>) -> RoutingEngine {
        RoutingEngine::new(RouteConfig {
            routes,
            ..Default::default()
        })
        .unwrap()
    }

    fn message(payload: Value, metadata: Value) -> Value {
        json!({
            "correlation_id": "cid-1",
            "payload": payload,
            "metadata": metadata,
        })
    }

    #[test]
    fn exact_match_selects_route() {
        let mut email = route("email");
        email.match_field = Some("metadata.type".to_string());
        email.match_value = Some("email".to_string());

        let engine = engine(vec![email]);
        let msg = message(json!({"x": 1}), json!({"type": "email"}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.route_name.as_deref(), Some("email"));
        assert_eq!(result.endpoint, "api");
        assert_eq!(result.method, "POST");
        assert_eq!(result.payload, json!({"x": 1}));
    }

    #[test]
    fn higher_priority_wins() {
        let mut low = route("low");
        low.match_field = Some("metadata.type".to_string());
        low.match_value = Some("email".to_string());
        low.priority = 1;

        let mut high = route("high");
        high.match_field = Some("metadata.type".to_string());
        high.match_value = Some("email".to_string());
        high.priority = 10;
        high.endpoint = "priority-api".to_string();

        let engine = engine(vec![low, high]);
        let msg = message(json!({}), json!({"type": "email"}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.route_name.as_deref(), Some("high"));
        assert_eq!(result.endpoint, "priority-api");
    }

    #[test]
    fn pattern_match_is_anchored_at_start() {
        let mut notify = route("notify");
        notify.match_field = Some("metadata.type".to_string());
        notify.match_pattern = Some(r"^notification\.".to_string());

        let engine = engine(vec![notify]);

        let hit = message(json!({}), json!({"type": "notification.email"}));
        assert!(engine.route(&hit).is_ok());

        let miss = message(json!({}), json!({"type": "some.notification.email"}));
        assert!(engine.route(&miss).is_err());
    }

    #[test]
    fn missing_field_does_not_match() {
        let mut typed = route("typed");
        typed.match_field = Some("metadata.type".to_string());
        typed.match_value = Some("email".to_string());

        let engine = engine(vec![typed]);
        let msg = message(json!({}), json!({}));
        assert!(engine.route(&msg).is_err());
    }

    #[test]
    fn default_route_catches_unmatched() {
        let mut typed = route("typed");
        typed.match_field = Some("metadata.type".to_string());
        typed.match_value = Some("email".to_string());
        typed.priority = 10;

        let mut fallback = route("fallback");
        fallback.is_default = true;
        fallback.endpoint = "default-api".to_string();
        // A high-priority default must not shadow matching routes.
        fallback.priority = 100;

        let engine = engine(vec![typed.clone(), fallback]);

        let matched = engine
            .route(&message(json!({}), json!({"type": "email"})))
            .unwrap();
        assert_eq!(matched.route_name.as_deref(), Some("typed"));

        let defaulted = engine
            .route(&message(json!({}), json!({"type": "other"})))
            .unwrap();
        assert_eq!(defaulted.route_name.as_deref(), Some("fallback"));
        assert_eq!(defaulted.endpoint, "default-api");
    }

    #[test]
    fn fallback_endpoint_synthesizes_passthrough() {
        let engine = RoutingEngine::new(RouteConfig {
            routes: Vec::new(),
            default_endpoint: Some("http://fallback.local".to_string()),
            enable_fallback: true,
            ..Default::default()
        })
        .unwrap();

        let msg = message(json!({"keep": true}), json!({}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.route_name, None);
        assert_eq!(result.endpoint, "http://fallback.local");
        assert_eq!(result.payload, json!({"keep": true}));
    }

    #[test]
    fn no_match_without_fallback_errors() {
        let engine = RoutingEngine::new(RouteConfig {
            routes: Vec::new(),
            default_endpoint: None,
            enable_fallback: false,
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            engine.route(&message(json!({}), json!({}))),
            Err(RelayError::Routing(_))
        ));
    }

    #[test]
    fn template_transform() {
        let mut tpl = route("tpl");
        tpl.is_default = true;
        tpl.transform_type = TransformType::Template;
        tpl.transform = Some(
            r#"{"to": "{{payload.user.email}}", "msg": "{{payload.message}}", "meta": {{metadata}}, "missing": {{payload.nope}}}"#
                .to_string(),
        );

        let engine = engine(vec![tpl]);
        let msg = message(
            json!({"user": {"email": "a@b"}, "message": "hi"}),
            json!({"k": 1}),
        );
        let result = engine.route(&msg).unwrap();
        assert_eq!(
            result.payload,
            json!({"to": "a@b", "msg": "hi", "meta": {"k": 1}, "missing": null})
        );
    }

    #[test]
    fn jsonpath_single_match_unwraps() {
        let mut jp = route("jp");
        jp.is_default = true;
        jp.transform_type = TransformType::Jsonpath;
        jp.transform = Some("$.payload.user".to_string());

        let engine = engine(vec![jp]);
        let msg = message(json!({"user": {"email": "a@b"}}), json!({}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.payload, json!({"email": "a@b"}));
    }

    #[test]
    fn jsonpath_multi_match_wraps() {
        let mut jp = route("jp");
        jp.is_default = true;
        jp.transform_type = TransformType::Jsonpath;
        jp.transform = Some("$.payload.items[*].id".to_string());

        let engine = engine(vec![jp]);
        let msg = message(json!({"items": [{"id": 1}, {"id": 2}]}), json!({}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.payload, json!({"result": [1, 2]}));
    }

    #[cfg(feature = "jq")]
    #[test]
    fn jq_transform() {
        let mut jq = route("jq");
        jq.is_default = true;
        jq.transform_type = TransformType::Jq;
        jq.transform = Some(".payload | {to: .user.email, msg: .message}".to_string());

        let engine = engine(vec![jq]);
        let msg = message(
            json!({"user": {"email": "a@b"}, "message": "hi"}),
            json!({"type": "notification.email"}),
        );
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.payload, json!({"to": "a@b", "msg": "hi"}));
    }

    #[test]
    fn header_and_query_mappings() {
        let mut mapped = route("mapped");
        mapped.is_default = true;
        mapped.header_mappings = Some(HashMap::from([
            ("X-Correlation-Id".to_string(), "correlation_id".to_string()),
            ("X-Missing".to_string(), "payload.absent".to_string()),
        ]));
        mapped.query_params = Some(HashMap::from([(
            "user".to_string(),
            "payload.user".to_string(),
        )]));

        let engine = engine(vec![mapped]);
        let msg = message(json!({"user": "u-1"}), json!({}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(
            result.headers.get("X-Correlation-Id"),
            Some(&"cid-1".to_string())
        );
        assert!(!result.headers.contains_key("X-Missing"));
        assert_eq!(result.query_params.get("user"), Some(&"u-1".to_string()));
    }

    #[test]
    fn validation_rejects_bad_names() {
        let mut bad = route("Bad_Name");
        bad.is_default = true;
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![bad],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn validation_rejects_duplicates() {
        let mut a = route("dup");
        a.is_default = true;
        let mut b = route("dup");
        b.is_default = true;
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![a, b],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn validation_rejects_ambiguous_criteria() {
        let mut both = route("both");
        both.match_field = Some("metadata.type".to_string());
        both.match_value = Some("a".to_string());
        both.match_pattern = Some("b".to_string());
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![both],
            ..Default::default()
        })
        .is_err());

        let neither = route("neither");
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![neither],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn validation_rejects_bad_regex_and_missing_transform() {
        let mut bad_regex = route("bad-regex");
        bad_regex.match_field = Some("metadata.type".to_string());
        bad_regex.match_pattern = Some("(unclosed".to_string());
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![bad_regex],
            ..Default::default()
        })
        .is_err());

        let mut no_expr = route("no-expr");
        no_expr.is_default = true;
        no_expr.transform_type = TransformType::Template;
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![no_expr],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn validation_rejects_unbalanced_braces() {
        let mut tpl = route("tpl");
        tpl.is_default = true;
        tpl.transform_type = TransformType::Template;
        tpl.transform = Some(r#"{"a": {{payload.x}}"#.to_string());
        assert!(RoutingEngine::new(RouteConfig {
            routes: vec![tpl],
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn disabled_routes_are_skipped() {
        let mut off = route("off");
        off.match_field = Some("metadata.type".to_string());
        off.match_value = Some("email".to_string());
        off.enabled = false;

        let engine = engine(vec![off]);
        assert!(engine
            .route(&message(json!({}), json!({"type": "email"})))
            .is_err());
    }

    #[test]
    fn yaml_config_round_trip() {
        let yaml = r#"
version: "1.0"
routes:
  - name: email-notifications
    priority: 10
    match_field: metadata.type
    match_pattern: "^notification\\."
    endpoint: notification
    transform_type: passthrough
  - name: catch-all
    is_default: true
    endpoint: api
enable_fallback: false
"#;
        let config: RouteConfig = serde_yaml::from_str(yaml).unwrap();
        let engine = RoutingEngine::new(config).unwrap();

        let msg = message(json!({"a": 1}), json!({"type": "notification.sms"}));
        let result = engine.route(&msg).unwrap();
        assert_eq!(result.route_name.as_deref(), Some("email-notifications"));
        assert_eq!(result.endpoint, "notification");
    }
}
