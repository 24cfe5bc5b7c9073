// # Delta Validator
//
// Structural validation applied before persist. Validation never consults
// schemas: any well-formed delta is accepted, schemas only shape reads.

use crate::delta::model::{Delta, PointerTarget, PrimitiveValue};
use crate::{Result, RhizomeError};

/// Accept or reject a delta pre-persist.
///
/// Failure classes map to [`RhizomeError::InvalidDelta`] with a reason
/// naming the offending field.
pub fn validate_delta(delta: &Delta) -> Result<()> {
    if delta.id.is_empty() {
        return Err(invalid("delta id must be non-empty"));
    }
    if delta.timestamp == 0 {
        return Err(invalid("delta timestamp must be positive"));
    }
    if delta.author.is_empty() {
        return Err(invalid("delta author must be non-empty"));
    }
    if delta.system.is_empty() {
        return Err(invalid("delta system must be non-empty"));
    }

    for (idx, pointer) in delta.pointers.iter().enumerate() {
        if pointer.local_context.is_empty() {
            return Err(invalid(format!(
                "pointer {idx}: local_context must be non-empty"
            )));
        }
        if let Some(context) = &pointer.target_context {
            if context.is_empty() {
                return Err(invalid(format!(
                    "pointer {idx}: target_context must be non-empty when present"
                )));
            }
        }
        match &pointer.target {
            PointerTarget::Reference(reference) => {
                if reference.id.is_empty() {
                    return Err(invalid(format!(
                        "pointer {idx}: entity reference id must be non-empty"
                    )));
                }
            }
            PointerTarget::Primitive(PrimitiveValue::Number(n)) => {
                if !n.is_finite() {
                    return Err(invalid(format!(
                        "pointer {idx}: numeric target must be finite"
                    )));
                }
            }
            PointerTarget::Primitive(_) => {}
        }
    }

    Ok(())
}

fn invalid<S: Into<String>>(reason: S) -> RhizomeError {
    RhizomeError::InvalidDelta(reason.into())
}
