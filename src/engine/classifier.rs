//! Result classifiers compiled from `retry_on` / `ignore` stanzas.
//!
//! A stanza maps result field names to acceptable values. Within one field an
//! array is a disjunction; across fields the stanza is a conjunction. The
//! `status` field understands digit wildcards (`"50x"` matches 500–509); any
//! other field compares by canonical JSON stringification, so nested objects
//! match deterministically regardless of key declaration order.

use serde_json::Value;

use crate::errors::ClassifierError;

/// One compiled alternative for a single result field.
#[derive(Debug, Clone)]
enum FieldTest {
    /// Exact HTTP status
    StatusExact(u16),
    /// Status pattern with `x` digit wildcards, e.g. `50x`
    StatusPattern(String),
    /// Canonical-JSON equality on an arbitrary result field
    Equals(String),
}

impl FieldTest {
    fn hits(&self, field_value: Option<&Value>) -> bool {
        match self {
            FieldTest::StatusExact(expected) => {
                field_value.and_then(Value::as_u64) == Some(u64::from(*expected))
            }
            FieldTest::StatusPattern(pattern) => {
                let Some(status) = field_value.and_then(Value::as_u64) else {
                    return false;
                };
                let digits = status.to_string();
                digits.len() == pattern.len()
                    && pattern
                        .chars()
                        .zip(digits.chars())
                        .all(|(p, d)| p == 'x' || p == d)
            }
            FieldTest::Equals(canonical) => {
                field_value.is_some_and(|v| canonical_stringify(v) == *canonical)
            }
        }
    }
}

/// Compiled classifier over HTTP exec results.
#[derive(Debug, Clone)]
pub struct ResultClassifier {
    /// AND across fields, OR within each field's alternatives
    fields: Vec<(String, Vec<FieldTest>)>,
}

impl ResultClassifier {
    /// Compile a classifier stanza. An empty stanza classifies nothing.
    pub fn compile(stanza: &Value) -> Result<Self, ClassifierError> {
        let Some(map) = stanza.as_object() else {
            return Err(ClassifierError::InvalidRetryCondition {
                details: format!("stanza must be an object, got {stanza}"),
            });
        };
        let mut fields = Vec::with_capacity(map.len());
        for (name, spec) in map {
            let options = match spec {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            };
            if options.is_empty() {
                return Err(ClassifierError::InvalidRetryCondition {
                    details: format!("field {name} has no alternatives"),
                });
            }
            let tests = options
                .into_iter()
                .map(|option| compile_field_test(name, option))
                .collect::<Result<Vec<_>, _>>()?;
            fields.push((name.clone(), tests));
        }
        Ok(Self { fields })
    }

    /// True iff every field of the stanza is satisfied by the result.
    pub fn classify(&self, result: &Value) -> bool {
        if self.fields.is_empty() {
            return false;
        }
        self.fields.iter().all(|(name, tests)| {
            let field_value = result.get(name);
            tests.iter().any(|test| test.hits(field_value))
        })
    }
}

fn compile_field_test(field: &str, option: &Value) -> Result<FieldTest, ClassifierError> {
    if field == "status" {
        return match option {
            Value::Number(n) => {
                let status = n.as_u64().and_then(|v| u16::try_from(v).ok()).ok_or_else(
                    || ClassifierError::InvalidStatusPattern {
                        pattern: n.to_string(),
                    },
                )?;
                Ok(FieldTest::StatusExact(status))
            }
            Value::String(pattern) => {
                let plausible = !pattern.is_empty()
                    && pattern.chars().all(|c| c == 'x' || c.is_ascii_digit());
                if !plausible {
                    return Err(ClassifierError::InvalidStatusPattern {
                        pattern: pattern.clone(),
                    });
                }
                Ok(FieldTest::StatusPattern(pattern.clone()))
            }
            other => Err(ClassifierError::InvalidStatusPattern {
                pattern: other.to_string(),
            }),
        };
    }
    Ok(FieldTest::Equals(canonical_stringify(option)))
}

/// Key-ordered JSON stringification. `serde_json` maps are BTree-backed, so
/// serializing a re-parsed value yields a canonical ordering.
fn canonical_stringify(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| k.as_str());
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), canonicalize(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}
