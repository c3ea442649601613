//! Canonical parameter encoding and effect key derivation.
//!
//! An effect key is the SHA-256 of a domain-separated, length-prefixed
//! encoding of `(run_id, action, stage, canonical_params)`. Two calls with
//! semantically equal parameters (same values, any key order) always derive
//! the same key; any difference in any of the four parts derives a different
//! one.
//!
//! Floating-point parameters are rejected outright: their textual form is not
//! stable across serializers, so they can never be part of a durable key.

use serde_json::Value;
use sha2::{Digest, Sha256};
use spire_core::{EffectId, RunId};

/// Domain separator mixed into every effect key.
const DOMAIN: &[u8] = b"spire.effect.v1";

/// Maximum nesting depth accepted in action parameters.
pub const MAX_PARAM_DEPTH: usize = 64;

/// Reasons effect key derivation can refuse its input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    /// The action name was empty.
    #[error("action name cannot be empty")]
    EmptyAction,

    /// A floating-point number was found in the parameters.
    #[error("floating-point parameter at {path}; encode it as integer minor units or a string")]
    FloatParameter {
        /// JSON path of the offending value, e.g. `$.amount`.
        path: String,
    },

    /// Parameters are nested deeper than [`MAX_PARAM_DEPTH`].
    #[error("parameters nested deeper than {max} levels at {path}")]
    TooDeep {
        /// JSON path where the limit was hit.
        path: String,
        /// The configured limit.
        max: usize,
    },
}

/// Encode `value` canonically: object keys sorted by byte order, array order
/// kept, no insignificant whitespace, strings JSON-escaped, integers in plain
/// decimal.
pub fn canonicalize(value: &Value) -> Result<String, IdempotencyError> {
    let mut out = String::new();
    write_canonical(value, "$", 0, &mut out)?;
    Ok(out)
}

fn write_canonical(
    value: &Value,
    path: &str,
    depth: usize,
    out: &mut String,
) -> Result<(), IdempotencyError> {
    if depth > MAX_PARAM_DEPTH {
        return Err(IdempotencyError::TooDeep {
            path: path.to_owned(),
            max: MAX_PARAM_DEPTH,
        });
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                return Err(IdempotencyError::FloatParameter {
                    path: path.to_owned(),
                });
            }
        }
        Value::String(s) => push_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, &format!("{path}[{index}]"), depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                push_json_string(key, out);
                out.push(':');
                write_canonical(&map[key], &format!("{path}.{key}"), depth + 1, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn push_json_string(s: &str, out: &mut String) {
    // Serializing a `Value::String` cannot fail.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

fn push_part(hasher: &mut Sha256, part: &[u8]) {
    hasher.update((part.len() as u64).to_be_bytes());
    hasher.update(part);
}

/// Derive the ledger key for an action invoked by `run_id` at `stage`.
///
/// Pure: the same inputs always produce the same 64-character hex key.
pub fn derive_effect_id(
    run_id: RunId,
    action: &str,
    params: &Value,
    stage: &str,
) -> Result<EffectId, IdempotencyError> {
    if action.trim().is_empty() {
        return Err(IdempotencyError::EmptyAction);
    }
    let canonical = canonicalize(params)?;

    let mut hasher = Sha256::new();
    push_part(&mut hasher, DOMAIN);
    push_part(&mut hasher, run_id.get().as_bytes());
    push_part(&mut hasher, action.as_bytes());
    push_part(&mut hasher, stage.as_bytes());
    push_part(&mut hasher, canonical.as_bytes());
    Ok(EffectId::from_digest(hasher.finalize()))
}
