//! Strict per-route contracts for JSON request bodies.
//!
//! Each schema-checked [`Route`] maps to a static table of [`Field`]s. A body is accepted only if
//! every declared field satisfies its [`FieldContract`], no required field is missing, and no
//! undeclared field is present. Fixed literals pin the sampling parameters so a caller cannot
//! change the cost or behaviour of a completion.
use crate::routes::Route;
use serde_json::{Map, Value};
use std::fmt;

/// A constant a field must equal exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    /// Compared by numeric value, so `1` and `1.0` are the same literal.
    Number(f64),
    Bool(bool),
}

impl Literal {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Literal::Number(n) => value.as_f64() == Some(*n),
            Literal::Bool(b) => value.as_bool() == Some(*b),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// The rule a single field must satisfy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldContract {
    Literal(Literal),
    /// A string drawn from a fixed set.
    OneOf(&'static [&'static str]),
    String,
    Number,
    StringArray,
    /// An array whose elements are objects checked strictly against a nested table.
    ObjectArray(&'static [Field]),
    /// The caller must not supply this field at all.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub contract: FieldContract,
}

const fn field(name: &'static str, contract: FieldContract) -> Field {
    Field { name, contract }
}

/// The contract bound to one route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchemaDefinition {
    pub route: Route,
    pub fields: &'static [Field],
}

const CHAT_MESSAGE: &[Field] = &[
    field("role", FieldContract::OneOf(&["user"])),
    field("content", FieldContract::String),
];

static CHAT_COMPLETIONS: SchemaDefinition = SchemaDefinition {
    route: Route::ChatCompletions,
    fields: &[
        field(
            "model",
            FieldContract::OneOf(&["gpt-3.5-turbo", "gpt-4-1106-preview"]),
        ),
        field("temperature", FieldContract::Literal(Literal::Number(0.8))),
        field("top_p", FieldContract::Literal(Literal::Number(1.0))),
        field(
            "frequency_penalty",
            FieldContract::Literal(Literal::Number(0.0)),
        ),
        field(
            "presence_penalty",
            FieldContract::Literal(Literal::Number(0.0)),
        ),
        field("n", FieldContract::Literal(Literal::Number(1.0))),
        field("stream", FieldContract::Literal(Literal::Bool(true))),
        field("messages", FieldContract::ObjectArray(CHAT_MESSAGE)),
        field("user", FieldContract::Absent),
    ],
};

static COMPLETIONS: SchemaDefinition = SchemaDefinition {
    route: Route::Completions,
    fields: &[
        field("model", FieldContract::OneOf(&["text-davinci-003"])),
        field("max_tokens", FieldContract::Literal(Literal::Number(100.0))),
        field("temperature", FieldContract::Literal(Literal::Number(0.5))),
        field(
            "frequency_penalty",
            FieldContract::Literal(Literal::Number(0.5)),
        ),
        field(
            "presence_penalty",
            FieldContract::Literal(Literal::Number(0.6)),
        ),
        field("stop", FieldContract::StringArray),
        field("prompt", FieldContract::String),
        field("n", FieldContract::Number),
        field("best_of", FieldContract::Number),
        field("user", FieldContract::String),
    ],
};

impl Route {
    /// The schema for this route, or `None` if its body is passed through unchecked.
    pub fn schema(self) -> Option<&'static SchemaDefinition> {
        match self {
            Route::ChatCompletions => Some(&CHAT_COMPLETIONS),
            Route::Completions => Some(&COMPLETIONS),
            Route::AudioTranscriptions => None,
        }
    }
}

/// A single reason a body was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Dotted location of the offending value, e.g. `messages[0].role`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Every issue found in a rejected body, in a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", display_issues(.issues))]
pub struct SchemaViolation {
    pub issues: Vec<Issue>,
}

fn display_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// What the gateway learned from a body that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidatedBody {
    pub model: Option<String>,
}

/// Check a request body against the schema for `route`.
///
/// Routes without a schema are exempt and always validate. The result is a pure function of
/// `route` and `body`.
pub fn validate(route: Route, body: &[u8]) -> Result<ValidatedBody, SchemaViolation> {
    let Some(schema) = route.schema() else {
        return Ok(ValidatedBody::default());
    };

    let value: Value = serde_json::from_slice(body).map_err(|e| SchemaViolation {
        issues: vec![Issue {
            path: String::new(),
            message: format!("body is not valid JSON ({e})"),
        }],
    })?;

    let Some(object) = value.as_object() else {
        return Err(SchemaViolation {
            issues: vec![Issue {
                path: String::new(),
                message: "body must be a JSON object".to_string(),
            }],
        });
    };

    let mut issues = Vec::new();
    check_object(schema.fields, object, "", &mut issues);
    if !issues.is_empty() {
        return Err(SchemaViolation { issues });
    }

    Ok(ValidatedBody {
        model: object
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_owned),
    })
}

fn check_object(
    fields: &[Field],
    object: &Map<String, Value>,
    prefix: &str,
    issues: &mut Vec<Issue>,
) {
    let path_of = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };

    for field in fields {
        match (object.get(field.name), field.contract) {
            (None, FieldContract::Absent) => {}
            (Some(_), FieldContract::Absent) => issues.push(Issue {
                path: path_of(field.name),
                message: "must not be present".to_string(),
            }),
            (None, _) => issues.push(Issue {
                path: path_of(field.name),
                message: "is required".to_string(),
            }),
            (Some(value), contract) => {
                check_value(contract, value, &path_of(field.name), issues)
            }
        }
    }

    for key in object.keys() {
        if !fields.iter().any(|f| f.name == key) {
            issues.push(Issue {
                path: path_of(key),
                message: "is not a recognised field".to_string(),
            });
        }
    }
}

fn check_value(contract: FieldContract, value: &Value, path: &str, issues: &mut Vec<Issue>) {
    let fail = |issues: &mut Vec<Issue>, message: String| {
        issues.push(Issue {
            path: path.to_string(),
            message,
        })
    };

    match contract {
        FieldContract::Literal(literal) => {
            if !literal.matches(value) {
                fail(issues, format!("must be exactly {literal}"));
            }
        }
        FieldContract::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            _ => fail(issues, format!("must be one of {}", allowed.join(", "))),
        },
        FieldContract::String => {
            if !value.is_string() {
                fail(issues, "must be a string".to_string());
            }
        }
        FieldContract::Number => {
            if !value.is_number() {
                fail(issues, "must be a number".to_string());
            }
        }
        FieldContract::StringArray => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        issues.push(Issue {
                            path: format!("{path}[{i}]"),
                            message: "must be a string".to_string(),
                        });
                    }
                }
            }
            None => fail(issues, "must be an array of strings".to_string()),
        },
        FieldContract::ObjectArray(fields) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{i}]");
                    match item.as_object() {
                        Some(object) => check_object(fields, object, &item_path, issues),
                        None => issues.push(Issue {
                            path: item_path,
                            message: "must be an object".to_string(),
                        }),
                    }
                }
            }
            None => fail(issues, "must be an array of objects".to_string()),
        },
        // Handled by the caller, which knows whether the key was present.
        FieldContract::Absent => {}
    }
}
