//! Structured filters over stored documents.
//!
//! A [`Filter`] is evaluated against the JSON form of a record, so paths use
//! the serialised field names (`daemonId`, `env.VIRTUAL_HOST`,
//! `network.ports`). When a path resolves to an array, a filter matches if
//! any element matches.
//!
//! Templates build filters from URL-encoded query strings:
//!
//! ```text
//! env.VIRTUAL_HOST                 field exists
//! !env.VIRTUAL_HOST                field does not exist
//! name=/web                        equality
//! env[VIRTUAL_HOST][$exists]=true  bracketed path with operator
//! network.ports[$in]=80,443        membership (repeatable)
//! env.VIRTUAL_HOST[$regex]=^api\.  regular expression
//! env.VIRTUAL_HOST=~^api\.         regular expression shortcut
//! ```
//!
//! Pairs are combined with logical AND.

use regex::Regex;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("empty field name in query")]
    EmptyField,

    #[error("unknown query operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid value '{value}' for operator {op}")]
    InvalidValue { op: String, value: String },

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub enum Filter {
    Equals(String, Value),
    Exists(String, bool),
    In(String, Vec<Value>),
    Regex(String, Regex),
    /// Matches when every inner filter matches. Empty matches everything.
    And(Vec<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Equals(path.into(), value.into())
    }

    pub fn exists(path: impl Into<String>, exists: bool) -> Self {
        Filter::Exists(path.into(), exists)
    }

    /// Compiles `pattern` after trimming surrounding whitespace.
    pub fn regex(path: impl Into<String>, pattern: &str) -> Result<Self, QueryError> {
        Ok(Filter::Regex(path.into(), Regex::new(pattern.trim())?))
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Equals(path, expected) => {
                any_value(lookup(doc, path), |actual| loose_eq(actual, expected))
            }
            Filter::Exists(path, exists) => lookup(doc, path).is_some() == *exists,
            Filter::In(path, candidates) => any_value(lookup(doc, path), |actual| {
                candidates.iter().any(|c| loose_eq(actual, c))
            }),
            Filter::Regex(path, re) => any_value(lookup(doc, path), |actual| match actual {
                Value::String(s) => re.is_match(s),
                Value::Number(n) => re.is_match(&n.to_string()),
                _ => false,
            }),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }

    /// Parses a URL-encoded query string. An empty query matches everything.
    pub fn from_query(query: &str) -> Result<Self, QueryError> {
        let query = query.trim().trim_start_matches('?');
        let mut filters = Vec::new();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let has_value = pair.contains('=');
            let (key, value) = url::form_urlencoded::parse(pair.as_bytes())
                .next()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .unwrap_or_default();

            if !has_value {
                let (path, exists) = match key.strip_prefix('!') {
                    Some(rest) => (rest, false),
                    None => (key.as_str(), true),
                };
                let (path, op) = split_operator(path)?;
                if let Some(op) = op {
                    return Err(QueryError::InvalidValue {
                        op,
                        value: String::new(),
                    });
                }
                filters.push(Filter::Exists(path, exists));
                continue;
            }

            let (path, op) = split_operator(&key)?;
            match op.as_deref() {
                None if value.starts_with('~') => filters.push(Filter::regex(path, &value[1..])?),
                None => filters.push(Filter::Equals(path, Value::String(value))),
                Some("$eq") => filters.push(Filter::Equals(path, Value::String(value))),
                Some("$exists") => filters.push(Filter::Exists(path, parse_bool("$exists", &value)?)),
                Some("$regex") => filters.push(Filter::regex(path, &value)?),
                Some("$in") => {
                    let values = value.split(',').map(|v| Value::String(v.to_string()));
                    // Repeated `path[$in]=..` pairs extend one membership filter.
                    let existing = filters.iter_mut().find_map(|f| match f {
                        Filter::In(p, vals) if *p == path => Some(vals),
                        _ => None,
                    });
                    match existing {
                        Some(vals) => vals.extend(values),
                        None => filters.push(Filter::In(path, values.collect())),
                    }
                }
                Some(other) => return Err(QueryError::UnknownOperator(other.to_string())),
            }
        }

        Ok(match filters.len() {
            1 => filters.remove(0),
            _ => Filter::And(filters),
        })
    }

    /// Builds a filter from a document-style object such as
    /// `{"env": {"VIRTUAL_HOST": {"$exists": true}}}`. Nested objects
    /// without operator keys recurse into sub-paths.
    pub fn from_json(doc: &Value) -> Result<Self, QueryError> {
        let mut filters = Vec::new();
        collect_json(doc, "", &mut filters)?;
        Ok(match filters.len() {
            1 => filters.remove(0),
            _ => Filter::And(filters),
        })
    }
}

fn collect_json(doc: &Value, prefix: &str, out: &mut Vec<Filter>) -> Result<(), QueryError> {
    let Value::Object(map) = doc else {
        if prefix.is_empty() {
            return Err(QueryError::InvalidValue {
                op: "filter".into(),
                value: doc.to_string(),
            });
        }
        out.push(Filter::Equals(prefix.to_string(), doc.clone()));
        return Ok(());
    };

    let is_operator_map = !map.is_empty() && map.keys().all(|k| k.starts_with('$'));
    if is_operator_map && !prefix.is_empty() {
        for (op, arg) in map {
            out.push(operator_filter(prefix, op, arg)?);
        }
        return Ok(());
    }

    for (key, value) in map {
        if key.is_empty() {
            return Err(QueryError::EmptyField);
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(_) => collect_json(value, &path, out)?,
            other => out.push(Filter::Equals(path, other.clone())),
        }
    }
    Ok(())
}

fn operator_filter(path: &str, op: &str, arg: &Value) -> Result<Filter, QueryError> {
    let invalid = || QueryError::InvalidValue {
        op: op.to_string(),
        value: arg.to_string(),
    };
    match op {
        "$eq" => Ok(Filter::Equals(path.to_string(), arg.clone())),
        "$exists" => match arg {
            Value::Bool(b) => Ok(Filter::Exists(path.to_string(), *b)),
            Value::String(s) => Ok(Filter::Exists(path.to_string(), parse_bool(op, s)?)),
            _ => Err(invalid()),
        },
        "$in" => match arg {
            Value::Array(values) => Ok(Filter::In(path.to_string(), values.clone())),
            _ => Err(invalid()),
        },
        "$regex" => match arg {
            Value::String(pattern) => Filter::regex(path, pattern),
            _ => Err(invalid()),
        },
        other => Err(QueryError::UnknownOperator(other.to_string())),
    }
}

/// Turns `env[VIRTUAL_HOST][$exists]` or `env.VIRTUAL_HOST.$exists` into a
/// dotted path and an optional trailing operator.
fn split_operator(key: &str) -> Result<(String, Option<String>), QueryError> {
    let mut segments: Vec<&str> = key
        .split(['.', '[', ']'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let op = match segments.last() {
        Some(last) if last.starts_with('$') => segments.pop().map(str::to_string),
        _ => None,
    };

    if segments.is_empty() {
        return Err(QueryError::EmptyField);
    }
    Ok((segments.join("."), op))
}

fn parse_bool(op: &str, value: &str) -> Result<bool, QueryError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(QueryError::InvalidValue {
            op: op.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Resolves a dotted path. A field stored as `null` is present; only an
/// absent key (or a non-object along the way) yields `None`.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

fn any_value(value: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match value {
        Some(Value::Array(items)) => items.iter().any(&pred),
        Some(v) => pred(v),
        None => false,
    }
}

/// Query strings only carry text, so `"80"` must match a numeric `80` and
/// `"true"` a boolean.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::String(a), Value::Number(_) | Value::Bool(_)) => *a == expected.to_string(),
        (Value::Number(_) | Value::Bool(_), Value::String(e)) => actual.to_string() == *e,
        _ => false,
    }
}
