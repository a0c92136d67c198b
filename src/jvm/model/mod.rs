//! Semantic representations of classes
//!
//! This is the representation transformers and the verifier work with. Names and descriptors are
//! plain strings, method bodies are [`Code`](crate::jvm::code::Code), and the typed attributes
//! that matter for deobfuscation (code, signatures, constant values) are decoded. Everything else
//! stays as raw attributes and is written back unchanged.
//!
//!   - __Class__ is represented using [`ClassModel`]
//!   - __Method__ is represented using [`MethodModel`]
//!   - __Field__ is represented using [`FieldModel`]
//!
//! [`ClassModel::build`] and [`ClassModel::export`] convert from and to class file bytes.

mod class;
mod field;
mod method;

pub use class::*;
pub use field::*;
pub use method::*;

use crate::jvm::class_file::{Attribute, Signature};
use crate::jvm::{ClassFormatError, ConstantPool, Error};

/// Split attributes into a decoded `Signature` and the rest
///
/// A signature whose string cannot be decoded stays raw.
fn take_signature(
    attributes: &[Attribute],
    constants: &ConstantPool,
) -> Result<(Option<String>, Vec<Attribute>), ClassFormatError> {
    let mut signature = None;
    let mut rest = vec![];
    for attribute in attributes {
        if signature.is_none() && constants.utf8(attribute.name_index) == Ok("Signature") {
            let decoded: Signature = attribute.decode()?;
            if let Ok(string) = constants.utf8(decoded.signature) {
                signature = Some(string.to_owned());
                continue;
            }
        }
        rest.push(attribute.clone());
    }
    Ok((signature, rest))
}

fn signature_attribute(
    signature: &Option<String>,
    constants: &mut ConstantPool,
) -> Result<Option<Attribute>, Error> {
    match signature {
        None => Ok(None),
        Some(signature) => {
            let signature = constants.get_utf8(signature)?;
            Ok(Some(Attribute::from_typed(
                constants,
                &Signature { signature },
            )?))
        }
    }
}
