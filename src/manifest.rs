//! Manifest loading: JSON parsing, `Defaults` merge, and `${ }` variable
//! expansion. The defaults-merge idiom — fill in service fields from a
//! shared template before typed deserialization — keeps per-service JSON
//! terse without needing every field repeated on every entry.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\$\{\s*([A-Za-z0-9_.-]+)\s*\}").expect("static regex"));

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthProbeSpec {
    pub http: HttpProbeSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpProbeSpec {
    pub port: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_protocol")]
    pub protocol: String,
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_protocol() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default)]
    pub name: String,
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hard_deploy: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// container-port (e.g. `"8080/tcp"`) -> host binding, either
    /// `"PORT"` or `"IP:PORT"` (see `service_runtime::split_host_port`).
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    #[serde(default)]
    pub publish_all_ports: bool,
    #[serde(default)]
    pub expose: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub health: Vec<HealthProbeSpec>,
    #[serde(default)]
    pub settle_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub register: bool,
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_scale() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<(), Error> {
        if self.image.is_empty() {
            return Err(Error::custom(
                ErrorKind::ConfigValidate,
                format!("service {:?}: image must not be empty", self.name),
            ));
        }
        if self.tag.is_empty() {
            return Err(Error::custom(
                ErrorKind::ConfigValidate,
                format!("service {:?}: tag must not be empty", self.name),
            ));
        }
        if self.scale == 0 {
            return Err(Error::custom(
                ErrorKind::ConfigValidate,
                format!("service {:?}: scale must be at least 1", self.name),
            ));
        }
        for probe in &self.health {
            // The health checker's `hyper::Client` carries no TLS
            // connector, so an `https` probe would fail every tick
            // rather than ever reporting healthy; reject it up front.
            if probe.http.protocol != "http" {
                return Err(Error::custom(
                    ErrorKind::ConfigValidate,
                    format!(
                        "service {:?}: health probe protocol {:?} is not supported, only \"http\" is",
                        self.name, probe.http.protocol
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Dependency name without an `alias` suffix (`dep:alias` -> `dep`).
    pub fn dependency_names(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .map(|d| d.split_once(':').map(|(name, _)| name).unwrap_or(d))
            .collect()
    }

    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            name: "svc".into(),
            image: "image".into(),
            tag: "latest".into(),
            scale: 1,
            enabled: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistrationSpec {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_ttl", rename = "Ttl")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingConsoleSpec {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogglySpec {
    pub level: String,
    pub sub_domain: String,
    pub token: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingSpec {
    #[serde(default)]
    pub console: LoggingConsoleSpec,
    #[serde(default)]
    pub loggly: Option<LogglySpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawManifest {
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default)]
    defaults: serde_json::Value,
    #[serde(default)]
    services: HashMap<String, serde_json::Value>,
    #[serde(default)]
    registration: RegistrationSpec,
    #[serde(default)]
    logging: LoggingSpec,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub services: HashMap<String, ServiceSpec>,
    pub registration: RegistrationSpec,
    pub logging: LoggingSpec,
}

impl Manifest {
    /// Loads and fully resolves a manifest from `path`: parses JSON,
    /// expands `${ }` variables against `Variables` then the process
    /// environment, merges `Defaults` under each service entry, then
    /// deserializes into typed specs.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::source(ErrorKind::ConfigParse, e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::source(ErrorKind::ConfigParse, e))?;

        let raw_manifest: RawManifest = serde_json::from_value(value.clone())
            .map_err(|e| Error::source(ErrorKind::ConfigParse, e))?;

        let expanded = expand_value(&value, &raw_manifest.variables)?;

        let expanded_manifest: RawManifest = serde_json::from_value(expanded)
            .map_err(|e| Error::source(ErrorKind::ConfigParse, e))?;

        let defaults = expanded_manifest.defaults;

        let mut services = HashMap::new();
        for (name, value) in expanded_manifest.services {
            let merged = merge_defaults(&defaults, &value)?;
            let mut spec: ServiceSpec = serde_json::from_value(merged)
                .map_err(|e| Error::source(ErrorKind::ConfigParse, e))?;
            spec.name = name.clone();
            spec.validate()?;
            services.insert(name, spec);
        }

        for spec in services.values() {
            for dep in spec.dependency_names() {
                if !services.contains_key(dep) {
                    return Err(Error::custom(
                        ErrorKind::ConfigValidate,
                        format!("service {:?} depends on unknown service {dep:?}", spec.name),
                    ));
                }
            }
        }
        detect_dependency_cycles(&services)?;

        Ok(Manifest {
            services,
            registration: expanded_manifest.registration,
            logging: expanded_manifest.logging,
        })
    }
}

/// Shallow-merges `defaults` under `override_value`: keys present in the
/// service entry win, keys only in `Defaults` are filled in. Only applies
/// at the top object level, matching the manifest's flat per-service shape.
fn merge_defaults(
    defaults: &serde_json::Value,
    override_value: &serde_json::Value,
) -> Result<serde_json::Value, Error> {
    let mut merged = match defaults {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        _ => {
            return Err(Error::custom(
                ErrorKind::ConfigParse,
                "Defaults must be a JSON object",
            ))
        }
    };
    if let serde_json::Value::Object(overrides) = override_value {
        for (k, v) in overrides {
            merged.insert(k.clone(), v.clone());
        }
    }
    Ok(serde_json::Value::Object(merged))
}

/// Expands every string leaf in `value` for `${ key }` occurrences. A
/// fresh capture iterator is built on every call since the scanned text
/// differs per recursive call.
fn expand_value(
    value: &serde_json::Value,
    variables: &HashMap<String, String>,
) -> Result<serde_json::Value, Error> {
    expand_value_tracking(value, variables, &mut Vec::new())
}

fn expand_value_tracking(
    value: &serde_json::Value,
    variables: &HashMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<serde_json::Value, Error> {
    match value {
        serde_json::Value::String(s) => {
            Ok(serde_json::Value::String(expand_string(s, variables, stack)?))
        }
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_value_tracking(item, variables, stack)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_value_tracking(v, variables, stack)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_string(
    s: &str,
    variables: &HashMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String, Error> {
    let mut out = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in VAR_PATTERN.captures_iter(s) {
        let whole = caps.get(0).unwrap();
        let key = caps.get(1).unwrap().as_str();

        out.push_str(&s[last_end..whole.start()]);

        if stack.iter().any(|k| k.eq_ignore_ascii_case(key)) {
            return Err(Error::custom(
                ErrorKind::ConfigParse,
                format!("circular variable reference involving {key:?}"),
            ));
        }

        let resolved = resolve_variable(key, variables)?;

        stack.push(key.to_string());
        let resolved = expand_string(&resolved, variables, stack)?;
        stack.pop();

        out.push_str(&resolved);
        last_end = whole.end();
    }
    out.push_str(&s[last_end..]);
    Ok(out)
}

fn resolve_variable(key: &str, variables: &HashMap<String, String>) -> Result<String, Error> {
    if let Some(value) = variables
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.clone())
    {
        return Ok(value);
    }
    if let Ok(value) = env::var(key) {
        return Ok(value);
    }
    Err(Error::custom(
        ErrorKind::ConfigParse,
        format!("unresolved variable ${{{key}}}"),
    ))
}

/// Detects cycles in the service dependency graph via rotate-to-tail, the
/// same shape `Application`'s topological sort uses, capped at 2*N
/// rotations.
fn detect_dependency_cycles(services: &HashMap<String, ServiceSpec>) -> Result<(), Error> {
    let mut remaining: Vec<&str> = services.keys().map(|s| s.as_str()).collect();
    let n = remaining.len();
    let mut sorted: Vec<&str> = Vec::with_capacity(n);
    let mut rotations = 0usize;
    let max_rotations = 2 * n.max(1);

    while let Some(name) = remaining.first().copied() {
        let spec = &services[name];
        let unresolved = spec
            .dependency_names()
            .into_iter()
            .any(|dep| dep != name && remaining.iter().any(|r| *r == dep));

        if unresolved {
            remaining.remove(0);
            remaining.push(name);
            rotations += 1;
            if rotations > max_rotations {
                return Err(Error::custom(
                    ErrorKind::ConfigValidate,
                    "circular dependency detected among services",
                ));
            }
        } else {
            remaining.remove(0);
            sorted.push(name);
            rotations = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_variable_with_env_fallback() {
        std::env::set_var("KIR_TEST_FALLBACK", "from-env");
        let vars = HashMap::new();
        let mut stack = Vec::new();
        let out = expand_string("value=${KIR_TEST_FALLBACK}", &vars, &mut stack).unwrap();
        assert_eq!(out, "value=from-env");
    }

    #[test]
    fn expands_variable_from_manifest_variables_first() {
        let mut vars = HashMap::new();
        vars.insert("tag".to_string(), "v2".to_string());
        let mut stack = Vec::new();
        let out = expand_string("image:${ tag }", &vars, &mut stack).unwrap();
        assert_eq!(out, "image:v2");
    }

    #[test]
    fn unresolved_variable_is_an_error() {
        let vars = HashMap::new();
        let mut stack = Vec::new();
        assert!(expand_string("${nope}", &vars, &mut stack).is_err());
    }

    #[test]
    fn parses_manifest_with_defaults_merge() {
        let raw = r#"{
            "Variables": {"tag": "v1"},
            "Defaults": {"tag": "${tag}", "scale": 2},
            "Services": {
                "web": {"image": "acme/web"},
                "db": {"image": "acme/db", "scale": 1}
            }
        }"#;
        let manifest = Manifest::parse(raw).unwrap();
        assert_eq!(manifest.services["web"].tag, "v1");
        assert_eq!(manifest.services["web"].scale, 2);
        assert_eq!(manifest.services["db"].scale, 1);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let raw = r#"{
            "Services": { "web": {"image": "acme/web", "dependencies": ["missing"]} }
        }"#;
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn rejects_dependency_cycle() {
        let raw = r#"{
            "Services": {
                "a": {"image": "acme/a", "dependencies": ["b"]},
                "b": {"image": "acme/b", "dependencies": ["a"]}
            }
        }"#;
        assert!(Manifest::parse(raw).is_err());
    }

    #[test]
    fn rejects_https_health_probe() {
        let mut spec = ServiceSpec::test_default();
        spec.health.push(HealthProbeSpec {
            http: HttpProbeSpec {
                port: "8080".into(),
                ip: None,
                path: "/".into(),
                protocol: "https".into(),
            },
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn parses_camel_case_service_fields_and_pascal_case_probe() {
        let raw = r#"{
            "Registration": {"Prefix": "kir/", "Ip": "10.0.0.1", "Ttl": 30},
            "Services": {
                "web": {
                    "image": "acme/web",
                    "hardDeploy": true,
                    "publishAllPorts": true,
                    "settleTimeoutMs": 5000,
                    "health": [{"Http": {"Port": "8080", "Path": "/healthz"}}]
                }
            }
        }"#;
        let manifest = Manifest::parse(raw).unwrap();
        let web = &manifest.services["web"];
        assert!(web.hard_deploy);
        assert!(web.publish_all_ports);
        assert_eq!(web.settle_timeout_ms, Some(5000));
        assert_eq!(web.health[0].http.port, "8080");
        assert_eq!(web.health[0].http.path, "/healthz");
        assert_eq!(manifest.registration.prefix, "kir/");
        assert_eq!(manifest.registration.ttl_seconds, 30);
    }
}
