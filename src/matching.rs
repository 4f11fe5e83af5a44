//! Structural message matching with wildcard semantics.
//!
//! A pattern is an ordinary message in which a `null` leaf acts as a
//! wildcard: it matches any value at that position, sub-trees included.
//! The wildcard only has meaning on the pattern side of a comparison; a
//! `null` leaf in the message itself never matches a concrete pattern
//! value.
//!
//! Three comparisons are provided:
//! - [`equal_or_less`]: every key of the message exists in the pattern
//!   (the message is structurally a sub-tree of the pattern)
//! - [`equal_or_greater`]: every key of the pattern exists in the message
//!   (extra message keys are allowed) — this is what lenient routing uses
//! - [`equal`]: both hold
//!
//! Non-object leaves compare by strict value equality; in this protocol
//! they are strings. Matching carries a depth budget so a pathological or
//! self-feeding structure fails instead of recursing unboundedly.

use crate::error::ClientError;
use serde_json::Value;
use std::cmp::Ordering;

/// Maximum nesting depth visited before matching gives up.
pub const MAX_MATCH_DEPTH: usize = 12;

/// True if every leaf of `message` is matched by `pattern`.
pub fn equal_or_less(message: &Value, pattern: &Value) -> Result<bool, ClientError> {
    sub_match(message, pattern, 0, false)
}

/// True if every leaf of `pattern` is matched within `message`.
pub fn equal_or_greater(message: &Value, pattern: &Value) -> Result<bool, ClientError> {
    sub_match(pattern, message, 0, true)
}

/// True if the message and pattern match in both directions.
pub fn equal(message: &Value, pattern: &Value) -> Result<bool, ClientError> {
    Ok(equal_or_less(message, pattern)? && equal_or_greater(message, pattern)?)
}

/// Three-valued comparison of a message against a pattern.
///
/// `Some(Less)` when the message is a strict sub-tree of the pattern,
/// `Some(Greater)` for the converse, `Some(Equal)` when both hold, and
/// `None` when the two are incomparable.
pub fn compare(message: &Value, pattern: &Value) -> Result<Option<Ordering>, ClientError> {
    let el = equal_or_less(message, pattern)?;
    let eg = equal_or_greater(message, pattern)?;
    Ok(match (el, eg) {
        (true, true) => Some(Ordering::Equal),
        (true, false) => Some(Ordering::Less),
        (false, true) => Some(Ordering::Greater),
        (false, false) => None,
    })
}

// In a forward call the pattern is the right operand; `equal_or_greater`
// swaps the operands and sets `reverse` so the wildcard stays attached to
// the pattern side.
fn sub_match(left: &Value, right: &Value, depth: usize, reverse: bool) -> Result<bool, ClientError> {
    if depth == MAX_MATCH_DEPTH {
        return Err(ClientError::RecursionLimit(MAX_MATCH_DEPTH));
    }

    match (left, right) {
        (Value::Object(lm), Value::Object(rm)) => {
            // Every key on the left must exist and match on the right.
            // No short-circuit: the depth budget applies to all branches.
            let mut all = true;
            for (key, lv) in lm {
                match rm.get(key) {
                    Some(rv) => all &= sub_match(lv, rv, depth + 1, reverse)?,
                    None => all = false,
                }
            }
            Ok(all)
        }
        (_, Value::Null) if !reverse => Ok(true),
        (Value::Null, _) if reverse => Ok(true),
        (lv, rv) => Ok(lv == rv),
    }
}
