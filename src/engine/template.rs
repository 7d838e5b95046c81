//! Request templates rendered per dispatched event.
//!
//! An exec entry is compiled once at rule-construction time and rendered once
//! per matching event. String values may reference the event under the
//! `message` namespace and the matcher bindings under the `match` namespace
//! with `{{message.meta.uri}}`-style placeholders. A string that is exactly
//! one placeholder substitutes the referenced value with its JSON type
//! preserved; placeholders embedded in longer strings stringify in place.
//!
//! The engine never follows redirects and treats response bodies as raw
//! bytes; those knobs live on the rule, not the template.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::errors::TemplateError;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex"));

/// A rendered, ready-to-execute HTTP request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// A compiled exec template.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: String,
    uri: Value,
    headers: Vec<(String, Value)>,
    body: Option<Value>,
    timeout: Duration,
}

impl RequestTemplate {
    /// Compile an exec entry. The `uri` field is required; `method` defaults
    /// to GET and `headers` to empty.
    pub fn compile(spec: &Value, default_timeout: Duration) -> Result<Self, TemplateError> {
        let obj = spec.as_object().ok_or_else(|| TemplateError::InvalidSpec {
            details: format!("exec entry must be an object, got {spec}"),
        })?;

        let uri = obj.get("uri").cloned().ok_or_else(|| TemplateError::InvalidSpec {
            details: "exec entry has no uri".to_string(),
        })?;
        if !uri.is_string() {
            return Err(TemplateError::InvalidSpec {
                details: format!("uri must be a string, got {uri}"),
            });
        }

        let method = match obj.get("method") {
            None => "GET".to_string(),
            Some(Value::String(m)) => {
                let upper = m.to_ascii_uppercase();
                match upper.as_str() {
                    "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "OPTIONS" | "PATCH" => upper,
                    _ => {
                        return Err(TemplateError::InvalidMethod { method: m.clone() });
                    }
                }
            }
            Some(other) => {
                return Err(TemplateError::InvalidMethod {
                    method: other.to_string(),
                });
            }
        };

        let headers = match obj.get("headers") {
            None => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect(),
            Some(other) => {
                return Err(TemplateError::InvalidSpec {
                    details: format!("headers must be an object, got {other}"),
                });
            }
        };

        let timeout = match obj.get("timeout") {
            None => default_timeout,
            Some(value) => value
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| TemplateError::InvalidSpec {
                    details: format!("timeout must be an integer, got {value}"),
                })?,
        };

        Ok(Self {
            method,
            uri,
            headers,
            body: obj.get("body").cloned(),
            timeout,
        })
    }

    /// Render a request for one event. `message` is the raw event, `bindings`
    /// the matcher output for the firing case.
    pub fn render(&self, message: &Value, bindings: &Value) -> Result<RequestSpec, TemplateError> {
        let mut context = HashMap::with_capacity(2);
        context.insert("message", message);
        context.insert("match", bindings);

        let uri = match expand(&self.uri, &context) {
            Value::String(s) if !s.is_empty() => s,
            _ => return Err(TemplateError::MissingUri),
        };

        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, template) in &self.headers {
            match expand(template, &context) {
                Value::String(s) => headers.push((name.clone(), s)),
                Value::Null => {}
                other => {
                    let scalar = stringify_scalar(&other).ok_or_else(|| {
                        TemplateError::NonStringHeader { name: name.clone() }
                    })?;
                    headers.push((name.clone(), scalar));
                }
            }
        }

        Ok(RequestSpec {
            method: self.method.clone(),
            uri,
            headers,
            body: self.body.as_ref().map(|b| expand(b, &context)),
            timeout: self.timeout,
        })
    }
}

/// Expand a free-standing template value, outside a request recipe. Used by
/// produce exec steps for their topic and message templates.
pub fn expand_template(template: &Value, message: &Value, bindings: &Value) -> Value {
    let mut context = HashMap::with_capacity(2);
    context.insert("message", message);
    context.insert("match", bindings);
    expand(template, &context)
}

/// Recursively expand placeholders in a template value.
fn expand(template: &Value, context: &HashMap<&str, &Value>) -> Value {
    match template {
        Value::String(s) => expand_string(s, context),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand(v, context)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| expand(item, context)).collect())
        }
        other => other.clone(),
    }
}

fn expand_string(s: &str, context: &HashMap<&str, &Value>) -> Value {
    // a lone placeholder substitutes the referenced value, type preserved
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            return lookup(&caps[1], context).cloned().unwrap_or(Value::Null);
        }
    }
    let replaced = PLACEHOLDER.replace_all(s, |caps: &regex::Captures<'_>| {
        lookup(&caps[1], context)
            .map(|v| stringify_scalar(v).unwrap_or_else(|| v.to_string()))
            .unwrap_or_default()
    });
    Value::String(replaced.into_owned())
}

/// Walk a dotted path starting at one of the context namespaces.
fn lookup<'a>(path: &str, context: &HashMap<&str, &'a Value>) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = *context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Stringify a scalar for embedded placeholder or header use. Containers
/// have no scalar form.
fn stringify_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Object(_) | Value::Array(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_millis(30_000);

    fn compile(spec: Value) -> RequestTemplate {
        RequestTemplate::compile(&spec, TIMEOUT).unwrap()
    }

    fn event() -> Value {
        json!({
            "meta": {
                "topic": "simple_test_rule",
                "uri": "/sample/uri",
                "request_id": "rid-1",
                "domain": "test.wiki.example",
                "dt": "2024-01-01T00:00:00Z"
            },
            "message": "test",
            "number": 3
        })
    }

    #[test]
    fn test_defaults() {
        let template = compile(json!({"uri": "http://mock.com/"}));
        let spec = template.render(&event(), &json!({})).unwrap();
        assert_eq!(spec.method, "GET");
        assert!(spec.headers.is_empty());
        assert!(spec.body.is_none());
        assert_eq!(spec.timeout, TIMEOUT);
    }

    #[test]
    fn test_embedded_placeholder_stringifies() {
        let template = compile(json!({
            "uri": "http://mock.com/{{message.meta.domain}}/page"
        }));
        let spec = template.render(&event(), &json!({})).unwrap();
        assert_eq!(spec.uri, "http://mock.com/test.wiki.example/page");
    }

    #[test]
    fn test_whole_value_placeholder_preserves_type() {
        let template = compile(json!({
            "uri": "http://mock.com/",
            "method": "post",
            "body": {
                "test_field_name": "test_field_value",
                "derived_field": "{{message.message}}",
                "count": "{{message.number}}"
            }
        }));
        let spec = template.render(&event(), &json!({})).unwrap();
        assert_eq!(spec.method, "POST");
        assert_eq!(
            spec.body.unwrap(),
            json!({
                "test_field_name": "test_field_value",
                "derived_field": "test",
                "count": 3
            })
        );
    }

    #[test]
    fn test_match_namespace() {
        let template = compile(json!({
            "uri": "http://mock.com/{{match.title.page}}"
        }));
        let bindings = json!({"title": {"page": "Main_Page"}});
        let spec = template.render(&event(), &bindings).unwrap();
        assert_eq!(spec.uri, "http://mock.com/Main_Page");
    }

    #[test]
    fn test_unresolved_reference() {
        let template = compile(json!({
            "uri": "http://mock.com/{{message.no.such.field}}x",
            "body": "{{message.also.missing}}"
        }));
        let spec = template.render(&event(), &json!({})).unwrap();
        assert_eq!(spec.uri, "http://mock.com/x");
        assert_eq!(spec.body.unwrap(), Value::Null);
    }

    #[test]
    fn test_headers_lowercase_and_render() {
        let template = compile(json!({
            "uri": "http://mock.com/",
            "headers": {"X-Custom": "{{message.meta.domain}}", "Retries": 2}
        }));
        let spec = template.render(&event(), &json!({})).unwrap();
        assert!(spec.headers.contains(&("x-custom".to_string(), "test.wiki.example".to_string())));
        assert!(spec.headers.contains(&("retries".to_string(), "2".to_string())));
    }

    #[test]
    fn test_container_header_value_rejected() {
        let template = compile(json!({
            "uri": "http://mock.com/",
            "headers": {"x-all": "{{message.meta}}"}
        }));
        let result = template.render(&event(), &json!({}));
        assert!(matches!(result, Err(TemplateError::NonStringHeader { .. })));
    }

    #[test]
    fn test_uri_rendering_to_empty_fails() {
        let template = compile(json!({"uri": "{{message.missing}}"}));
        let result = template.render(&event(), &json!({}));
        assert!(matches!(result, Err(TemplateError::MissingUri)));
    }

    #[test]
    fn test_invalid_method_rejected() {
        let err = RequestTemplate::compile(
            &json!({"uri": "http://mock.com/", "method": "FROB"}),
            TIMEOUT,
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidMethod { .. }));
    }

    #[test]
    fn test_missing_uri_rejected_at_compile() {
        let err = RequestTemplate::compile(&json!({"method": "POST"}), TIMEOUT).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidSpec { .. }));
    }

    #[test]
    fn test_per_template_timeout() {
        let template = compile(json!({"uri": "http://mock.com/", "timeout": 250}));
        let spec = template.render(&event(), &json!({})).unwrap();
        assert_eq!(spec.timeout, Duration::from_millis(250));
    }
}
