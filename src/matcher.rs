//! CommandMatcher - structural comparison of request documents
//!
//! Compares an incoming request against the next scripted request. The
//! comparison is independent of map key order, recursive over nested maps,
//! and order-sensitive for arrays. Numbers compare by value so a handle
//! scripted as `123.0` in JSON still matches a `123` sent over the wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Generic request/response document tree.
pub type Document = Value;

/// How strictly maps are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Every expected key must be present and equal; extra actual keys are allowed
    #[default]
    Subset,
    /// As `Subset`, and keys present only in the actual document are rejected
    Exact,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Subset => "subset",
            MatchMode::Exact => "exact",
        }
    }
}

/// What diverged at the first mismatching path.
#[derive(Debug, Clone, PartialEq)]
pub enum MismatchKind {
    Missing { expected: Value },
    Unexpected { actual: Value },
    ValueDiffers { expected: Value, actual: Value },
    LengthDiffers { expected: usize, actual: usize },
}

/// First divergence between an actual and an expected document.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    /// Dotted path, array indices as plain segments (`cursors.1.id`)
    pub path: String,
    pub kind: MismatchKind,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Missing { expected } => {
                write!(f, "at '{}': missing, expected {}", self.path, expected)
            }
            MismatchKind::Unexpected { actual } => {
                write!(f, "at '{}': unexpected field with value {}", self.path, actual)
            }
            MismatchKind::ValueDiffers { expected, actual } => {
                write!(f, "at '{}': expected {}, got {}", self.path, expected, actual)
            }
            MismatchKind::LengthDiffers { expected, actual } => {
                write!(f, "at '{}': expected {} element(s), got {}", self.path, expected, actual)
            }
        }
    }
}

/// Outcome of a single comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub ok: bool,
    pub diff: Option<Mismatch>,
}

impl MatchResult {
    fn from_mismatch(diff: Option<Mismatch>) -> Self {
        Self { ok: diff.is_none(), diff }
    }

    /// Human-readable diff, empty when the documents matched
    pub fn describe(&self) -> String {
        self.diff.as_ref().map(|d| d.to_string()).unwrap_or_default()
    }
}

/// Compare `actual` against `expected`.
///
/// Pure function; the caller decides whether a mismatch is fatal.
pub fn match_command(actual: &Document, expected: &Document, mode: MatchMode) -> MatchResult {
    let mut path = Vec::new();
    MatchResult::from_mismatch(compare(actual, expected, mode, &mut path))
}

fn render_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

fn compare(actual: &Value, expected: &Value, mode: MatchMode, path: &mut Vec<String>) -> Option<Mismatch> {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            for (key, exp_value) in exp {
                path.push(key.clone());
                let result = match act.get(key) {
                    Some(act_value) => compare(act_value, exp_value, mode, path),
                    None => Some(Mismatch {
                        path: render_path(path),
                        kind: MismatchKind::Missing { expected: exp_value.clone() },
                    }),
                };
                path.pop();
                if result.is_some() {
                    return result;
                }
            }

            if mode == MatchMode::Exact {
                if let Some((key, act_value)) = act.iter().find(|(k, _)| !exp.contains_key(*k)) {
                    path.push(key.clone());
                    let mismatch = Mismatch {
                        path: render_path(path),
                        kind: MismatchKind::Unexpected { actual: act_value.clone() },
                    };
                    path.pop();
                    return Some(mismatch);
                }
            }
            None
        }

        (Value::Array(exp), Value::Array(act)) => {
            if exp.len() != act.len() {
                return Some(Mismatch {
                    path: render_path(path),
                    kind: MismatchKind::LengthDiffers { expected: exp.len(), actual: act.len() },
                });
            }
            for (i, (exp_item, act_item)) in exp.iter().zip(act).enumerate() {
                path.push(i.to_string());
                let result = compare(act_item, exp_item, mode, path);
                path.pop();
                if result.is_some() {
                    return result;
                }
            }
            None
        }

        (Value::Number(exp), Value::Number(act)) if numbers_equal(exp, act) => None,

        _ if expected == actual => None,

        _ => Some(Mismatch {
            path: render_path(path),
            kind: MismatchKind::ValueDiffers { expected: expected.clone(), actual: actual.clone() },
        }),
    }
}

/// Value equality across integer and float encodings.
pub(crate) fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (integer_of(a), integer_of(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(x), None) => b.as_f64().and_then(exact_integer).map_or(false, |y| x == y),
        (None, Some(y)) => a.as_f64().and_then(exact_integer).map_or(false, |x| x == y),
        (None, None) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn integer_of(n: &Number) -> Option<i128> {
    n.as_u64().map(i128::from).or_else(|| n.as_i64().map(i128::from))
}

/// Integral floats inside the i64/u64 range convert without rounding.
fn exact_integer(f: f64) -> Option<i128> {
    const MIN: f64 = -9_223_372_036_854_775_808.0; // -2^63
    const MAX: f64 = 18_446_744_073_709_551_616.0; // 2^64
    if f.fract() == 0.0 && (MIN..MAX).contains(&f) {
        Some(f as i128)
    } else {
        None
    }
}
