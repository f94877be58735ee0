//! Flag merging for STORE-style updates

use crate::models::FlagsOp;
use cormorant_common::types::flags::RECENT;

/// Compute the next flag set of a message.
///
/// `current` is consumed and its allocation reused for the result; `operand`
/// is never modified. `\Recent` is server-maintained, so `Set` keeps it when
/// `current` carried it.
pub fn merge(mut current: Vec<String>, op: FlagsOp, operand: &[String]) -> Vec<String> {
    match op {
        FlagsOp::Set => {
            let had_recent = current.iter().any(|f| f == RECENT);
            current.clear();
            if had_recent {
                current.push(RECENT.to_string());
            }
            push_missing(&mut current, operand);
        }
        FlagsOp::Add => push_missing(&mut current, operand),
        FlagsOp::Remove => current.retain(|flag| !operand.contains(flag)),
    }
    current
}

fn push_missing(target: &mut Vec<String>, flags: &[String]) {
    for flag in flags {
        if !target.contains(flag) {
            target.push(flag.clone());
        }
    }
}
