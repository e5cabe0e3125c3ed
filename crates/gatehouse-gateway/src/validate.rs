//! Per-route payload validation and the CSRF token check.
//!
//! Rules are declared per field as a `|`-separated list, e.g.
//! `"required|string|min:3|max:50"`. A field is checked against its rules in
//! order and only its first failure is reported.

use gatehouse_core::{GatewayError, GatewayResult};
use http::{HeaderMap, Method};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Header carrying the CSRF token.
pub const CSRF_HEADER: &str = "x-csrf-token";
/// Payload field carrying the CSRF token when the header is absent.
pub const CSRF_FIELD: &str = "csrf_token";

/// One check applied to a field.
#[derive(Debug, Clone)]
pub enum Rule {
    Required,
    /// Skip the remaining rules when the field is absent.
    Optional,
    String,
    Integer,
    Numeric,
    Boolean,
    Array,
    /// Minimum length, element count or value.
    Min(f64),
    /// Maximum length, element count or value.
    Max(f64),
    /// One of the listed values.
    In(Vec<String>),
    Email,
    Url,
    /// RFC 3339 timestamp.
    DateTime,
    Matches(Regex),
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Min(a), Self::Min(b)) | (Self::Max(a), Self::Max(b)) => a == b,
            (Self::In(a), Self::In(b)) => a == b,
            (Self::Matches(a), Self::Matches(b)) => a.as_str() == b.as_str(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for Rule {}

impl Rule {
    /// Parse one rule such as `max:100` or `in:text,image`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (name, arg) = match raw.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg)),
            None => (raw.trim(), None),
        };
        let bound = |arg: Option<&str>| {
            arg.and_then(|a| a.trim().parse::<f64>().ok())
                .ok_or_else(|| format!("rule '{raw}' needs a numeric argument"))
        };
        Ok(match name {
            "required" => Self::Required,
            "optional" => Self::Optional,
            "string" => Self::String,
            "integer" => Self::Integer,
            "numeric" => Self::Numeric,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "email" => Self::Email,
            "url" => Self::Url,
            "datetime" => Self::DateTime,
            "min" => Self::Min(bound(arg)?),
            "max" => Self::Max(bound(arg)?),
            "in" => Self::In(
                arg.unwrap_or_default()
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .collect(),
            ),
            "regex" => {
                let pattern = arg.ok_or_else(|| format!("rule '{raw}' needs a pattern"))?;
                Self::Matches(Regex::new(pattern).map_err(|e| format!("rule '{raw}': {e}"))?)
            }
            other => return Err(format!("unknown validation rule '{other}'")),
        })
    }

    /// The failure message for `field`, or `None` if `value` passes.
    ///
    /// `numeric` makes `min`/`max` compare values instead of lengths.
    fn check(&self, field: &str, value: &Value, numeric: bool) -> Option<String> {
        let ok = match self {
            Self::Required | Self::Optional => true,
            Self::String => value.is_string(),
            Self::Integer => as_integer(value).is_some(),
            Self::Numeric => as_number(value).is_some(),
            Self::Boolean => matches!(value, Value::Bool(_))
                || matches!(value.as_str(), Some("0" | "1" | "true" | "false"))
                || matches!(value.as_i64(), Some(0 | 1)),
            Self::Array => value.is_array(),
            Self::Min(min) => measure(value, numeric).map_or(true, |n| n >= *min),
            Self::Max(max) => measure(value, numeric).map_or(true, |n| n <= *max),
            Self::In(options) => options.iter().any(|o| scalar(value).as_deref() == Some(o)),
            Self::Email => value.as_str().is_some_and(is_email),
            Self::Url => value.as_str().is_some_and(|s| url::Url::parse(s).is_ok()),
            Self::DateTime => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Matches(re) => scalar(value).is_some_and(|s| re.is_match(&s)),
        };
        if ok {
            return None;
        }
        Some(match self {
            Self::Required | Self::Optional => format!("{field} is required"),
            Self::String => format!("{field} must be a string"),
            Self::Integer => format!("{field} must be an integer"),
            Self::Numeric => format!("{field} must be numeric"),
            Self::Boolean => format!("{field} must be a boolean"),
            Self::Array => format!("{field} must be an array"),
            Self::Min(min) => format!("{field} must be at least {min}"),
            Self::Max(max) => format!("{field} must be at most {max}"),
            Self::In(options) => format!("{field} must be one of: {}", options.join(", ")),
            Self::Email => format!("{field} must be a valid email address"),
            Self::Url => format!("{field} must be a valid URL"),
            Self::DateTime => format!("{field} must be an RFC 3339 timestamp"),
            Self::Matches(_) => format!("{field} has an invalid format"),
        })
    }
}

fn is_email(s: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$").ok()
        })
        .as_ref()
        .is_some_and(|re| re.is_match(s))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Characters of a string, elements of an array, or a number's value.
fn measure(value: &Value, numeric: bool) -> Option<f64> {
    if numeric {
        return as_number(value);
    }
    match value {
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Dotted lookup: `user.name` reads `payload["user"]["name"]`.
fn lookup<'a>(payload: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Field rules of one route, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    fields: BTreeMap<String, Vec<Rule>>,
}

impl RuleSet {
    /// Parse `field -> "rule|rule:arg"` declarations.
    pub fn parse(declared: &BTreeMap<String, String>) -> GatewayResult<Self> {
        let mut fields = BTreeMap::new();
        for (field, spec) in declared {
            let rules = spec
                .split('|')
                .filter(|r| !r.trim().is_empty())
                .map(Rule::parse)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| GatewayError::Config(format!("field '{field}': {e}")))?;
            fields.insert(field.clone(), rules);
        }
        Ok(Self { fields })
    }

    /// Add rules for one field.
    pub fn field(mut self, name: &str, rules: Vec<Rule>) -> Self {
        self.fields.insert(name.to_string(), rules);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every field's first failure, in field order.
    pub fn errors(&self, payload: &Value) -> Vec<String> {
        let empty = Map::new();
        let payload = payload.as_object().unwrap_or(&empty);
        let mut errors = Vec::new();
        for (field, rules) in &self.fields {
            let value = lookup(payload, field);
            if is_blank(value) {
                if rules.contains(&Rule::Required) {
                    errors.push(format!("{field} is required"));
                }
                continue;
            }
            let Some(value) = value else { continue };
            let numeric = rules
                .iter()
                .any(|r| matches!(r, Rule::Integer | Rule::Numeric));
            if let Some(error) = rules.iter().find_map(|rule| rule.check(field, value, numeric)) {
                errors.push(error);
            }
        }
        errors
    }

    /// Reject the payload with every failure joined into one message.
    pub fn validate(&self, payload: &Value) -> GatewayResult<()> {
        let errors = self.errors(payload);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Validation(errors.join("; ")))
        }
    }
}

/// Whether a method changes state and so needs a CSRF token.
pub fn is_unsafe(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Require a CSRF token of at least `min_len` characters from the header or
/// the payload's `csrf_token` field, which is removed from the payload.
pub fn check_csrf(headers: &HeaderMap, payload: &mut Value, min_len: usize) -> GatewayResult<()> {
    let from_payload = payload
        .as_object_mut()
        .and_then(|map| map.remove(CSRF_FIELD))
        .and_then(|v| v.as_str().map(str::to_string));
    let token = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(from_payload);
    match token {
        Some(t) if t.trim().chars().count() >= min_len => Ok(()),
        _ => Err(GatewayError::Csrf("Invalid or missing CSRF token".into())),
    }
}
