//! Phase-1 fetch specifications.
//!
//! A fetch spec describes one credentialed request. Placeholders of the form
//! `${env.NAME}` are substituted into header values only, from the
//! credentialed environment; `${var.NAME}` placeholders are bound through
//! explicit `passedVariables` declarations to fields of earlier fetch
//! results, and are the only sanctioned way a phase-1 response can influence
//! a later request's URL or body.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

static ENV_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{env\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));
static VAR_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{var\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"));

/// Reference to a field of an earlier fetch's captured result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFieldRef {
    /// Name of the earlier fetch.
    pub fetch: String,
    /// Dotted path into its captured result, e.g. `body.id`.
    pub field: String,
}

/// One declared phase-1 fetch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSpec {
    /// Name the sanitized result is stored under; also the phase-2 stub name.
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Header values may contain `${env.NAME}` and `${var.NAME}`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Body may contain `${var.NAME}` only.
    #[serde(default)]
    pub body: Option<String>,
    /// Bindings available as `${var.NAME}` in this fetch.
    #[serde(default)]
    pub passed_variables: HashMap<String, FetchFieldRef>,
    /// When set, the captured body is projected to these top-level fields.
    #[serde(default)]
    pub response_fields: Option<Vec<String>>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A fetch spec with every placeholder substituted. Header values may carry
/// live credentials; this struct must only ever reach the credentialed
/// phase-1 sub-execution.
#[derive(Debug, Clone)]
pub struct ResolvedFetch {
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl ResolvedFetch {
    /// The JSON handed to the harness script via its environment.
    pub fn to_harness_json(&self) -> String {
        serde_json::json!({
            "url": self.url,
            "method": self.method,
            "headers": self.headers,
            "body": self.body,
        })
        .to_string()
    }
}

/// Substitute placeholders in a fetch spec.
///
/// `${env.NAME}` is legal in header values only; its appearance anywhere
/// else is rejected so a phase-1 response can never steer credentials into a
/// URL or body. `${var.NAME}` requires a matching `passedVariables` entry.
pub fn resolve(
    spec: &FetchSpec,
    env: &HashMap<String, String>,
    prior: &serde_json::Map<String, serde_json::Value>,
) -> Result<ResolvedFetch> {
    let vars = bind_variables(spec, prior)?;

    if ENV_PLACEHOLDER.is_match(&spec.url) {
        return Err(Error::BadRequest {
            reason: format!("fetch '{}': ${{env.*}} is not allowed in URLs", spec.name),
        });
    }
    if let Some(body) = &spec.body {
        if ENV_PLACEHOLDER.is_match(body) {
            return Err(Error::BadRequest {
                reason: format!("fetch '{}': ${{env.*}} is not allowed in bodies", spec.name),
            });
        }
    }

    let url = substitute_vars(&spec.name, &spec.url, &vars)?;
    let body = spec
        .body
        .as_ref()
        .map(|b| substitute_vars(&spec.name, b, &vars))
        .transpose()?;

    let mut headers = HashMap::with_capacity(spec.headers.len());
    for (name, value) in &spec.headers {
        let value = substitute_env(&spec.name, value, env)?;
        let value = substitute_vars(&spec.name, &value, &vars)?;
        headers.insert(name.clone(), value);
    }

    Ok(ResolvedFetch {
        name: spec.name.clone(),
        url,
        method: spec.method.to_uppercase(),
        headers,
        body,
    })
}

fn bind_variables(
    spec: &FetchSpec,
    prior: &serde_json::Map<String, serde_json::Value>,
) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::with_capacity(spec.passed_variables.len());

    for (var_name, field_ref) in &spec.passed_variables {
        let capture = prior.get(&field_ref.fetch).ok_or_else(|| Error::BadRequest {
            reason: format!(
                "fetch '{}': passed variable '{}' references unknown fetch '{}'",
                spec.name, var_name, field_ref.fetch
            ),
        })?;

        let value = value_at_path(capture, &field_ref.field).ok_or_else(|| Error::BadRequest {
            reason: format!(
                "fetch '{}': field '{}' not found in result of fetch '{}'",
                spec.name, field_ref.field, field_ref.fetch
            ),
        })?;

        vars.insert(var_name.clone(), stringify(value));
    }

    Ok(vars)
}

/// Navigate a dotted path into a JSON value.
fn value_at_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute_env(
    fetch_name: &str,
    input: &str,
    env: &HashMap<String, String>,
) -> Result<String> {
    replace_all(&ENV_PLACEHOLDER, input, |name| {
        env.get(name).cloned().ok_or_else(|| Error::BadRequest {
            reason: format!(
                "fetch '{}': environment variable '{}' is not available",
                fetch_name, name
            ),
        })
    })
}

fn substitute_vars(
    fetch_name: &str,
    input: &str,
    vars: &HashMap<String, String>,
) -> Result<String> {
    replace_all(&VAR_PLACEHOLDER, input, |name| {
        vars.get(name).cloned().ok_or_else(|| Error::BadRequest {
            reason: format!(
                "fetch '{}': '${{var.{}}}' has no matching passedVariables entry",
                fetch_name, name
            ),
        })
    })
}

fn replace_all(
    regex: &Regex,
    input: &str,
    mut lookup: impl FnMut(&str) -> Result<String>,
) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for captures in regex.captures_iter(input) {
        let whole = captures.get(0).expect("capture 0 always present");
        let name = captures.get(1).expect("capture 1 in pattern").as_str();
        output.push_str(&input[last..whole.start()]);
        output.push_str(&lookup(name)?);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
}

/// Generate the phase-1 harness: a script whose sole job is to perform one
/// request (through the proxy, via the runtime's env-configured fetch) and
/// print the captured response as JSON.
pub fn harness_script(spec_env_var: &str) -> String {
    format!(
        r#"(async () => {{
  const spec = JSON.parse(process.env.{spec_env_var});
  try {{
    const res = await fetch(spec.url, {{
      method: spec.method,
      headers: spec.headers,
      body: spec.body ?? undefined,
    }});
    const text = await res.text();
    let body;
    try {{ body = JSON.parse(text); }} catch {{ body = text; }}
    const headers = {{}};
    for (const [k, v] of res.headers) headers[k] = v;
    process.stdout.write(JSON.stringify({{ status: res.status, headers, body }}));
  }} catch (err) {{
    process.stdout.write(JSON.stringify({{ error: String(err && err.message || err) }}));
  }}
}})();
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: serde_json::Value) -> FetchSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_env_substitution_in_headers() {
        let spec = spec(serde_json::json!({
            "name": "profile",
            "url": "https://api.example.com/me",
            "headers": {"Authorization": "Bearer ${env.CRUCIBLE_CREDENTIAL_TOKEN}"}
        }));

        let env = HashMap::from([(
            "CRUCIBLE_CREDENTIAL_TOKEN".to_string(),
            "tok-123".to_string(),
        )]);

        let resolved = resolve(&spec, &env, &serde_json::Map::new()).unwrap();
        assert_eq!(resolved.headers["Authorization"], "Bearer tok-123");
        assert_eq!(resolved.method, "GET");
    }

    #[test]
    fn test_env_in_url_is_rejected() {
        let spec = spec(serde_json::json!({
            "name": "bad",
            "url": "https://api.example.com/${env.TOKEN}",
        }));

        let result = resolve(&spec, &HashMap::new(), &serde_json::Map::new());
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_env_in_body_is_rejected() {
        let spec = spec(serde_json::json!({
            "name": "bad",
            "url": "https://api.example.com/",
            "body": "{\"token\": \"${env.TOKEN}\"}"
        }));

        let result = resolve(&spec, &HashMap::new(), &serde_json::Map::new());
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_unknown_env_is_rejected() {
        let spec = spec(serde_json::json!({
            "name": "profile",
            "url": "https://api.example.com/me",
            "headers": {"Authorization": "Bearer ${env.MISSING}"}
        }));

        let result = resolve(&spec, &HashMap::new(), &serde_json::Map::new());
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_passed_variable_chaining() {
        let spec = spec(serde_json::json!({
            "name": "orders",
            "url": "https://api.example.com/users/${var.userId}/orders",
            "passedVariables": {
                "userId": {"fetch": "profile", "field": "body.id"}
            }
        }));

        let mut prior = serde_json::Map::new();
        prior.insert(
            "profile".to_string(),
            serde_json::json!({"status": 200, "headers": {}, "body": {"id": 42}}),
        );

        let resolved = resolve(&spec, &HashMap::new(), &prior).unwrap();
        assert_eq!(resolved.url, "https://api.example.com/users/42/orders");
    }

    #[test]
    fn test_var_without_declaration_is_rejected() {
        let spec = spec(serde_json::json!({
            "name": "orders",
            "url": "https://api.example.com/users/${var.userId}",
        }));

        let result = resolve(&spec, &HashMap::new(), &serde_json::Map::new());
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_var_referencing_unknown_fetch_is_rejected() {
        let spec = spec(serde_json::json!({
            "name": "orders",
            "url": "https://api.example.com/${var.x}",
            "passedVariables": {"x": {"fetch": "nope", "field": "body.id"}}
        }));

        let result = resolve(&spec, &HashMap::new(), &serde_json::Map::new());
        assert!(matches!(result, Err(Error::BadRequest { .. })));
    }

    #[test]
    fn test_value_at_path() {
        let value = serde_json::json!({"body": {"items": [{"id": "a"}]}});
        assert_eq!(
            value_at_path(&value, "body.items.0.id"),
            Some(&serde_json::Value::String("a".to_string()))
        );
        assert!(value_at_path(&value, "body.missing").is_none());
    }

    #[test]
    fn test_method_upper_cased() {
        let spec = spec(serde_json::json!({
            "name": "p",
            "url": "https://api.example.com/",
            "method": "post"
        }));
        let resolved = resolve(&spec, &HashMap::new(), &serde_json::Map::new()).unwrap();
        assert_eq!(resolved.method, "POST");
    }

    #[test]
    fn test_harness_script_reads_spec_env() {
        let script = harness_script("CRUCIBLE_CREDENTIAL_FETCH_SPEC");
        assert!(script.contains("process.env.CRUCIBLE_CREDENTIAL_FETCH_SPEC"));
        assert!(script.contains("fetch(spec.url"));
        assert!(script.contains("status: res.status"));
    }

    #[test]
    fn test_harness_json_shape() {
        let resolved = ResolvedFetch {
            name: "p".to_string(),
            url: "https://x.test/".to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        let json: serde_json::Value = serde_json::from_str(&resolved.to_harness_json()).unwrap();
        assert_eq!(json["url"], "https://x.test/");
        assert!(json["body"].is_null());
    }
}
