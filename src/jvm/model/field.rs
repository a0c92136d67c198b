use crate::jvm::class_file::{self, Attribute, ConstantValue};
use crate::jvm::model::{signature_attribute, take_signature};
use crate::jvm::{ClassFormatError, ConstantIndex, ConstantPool, Error, FieldAccessFlags};

/// Semantic representation of a field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldModel {
    pub access_flags: FieldAccessFlags,
    pub name: String,
    pub descriptor: String,

    /// Generic field signature
    pub signature: Option<String>,

    /// Initial value of a `static final` field
    pub constant_value: Option<ConstantIndex>,

    pub attributes: Vec<Attribute>,
}

impl FieldModel {
    pub fn new(access_flags: FieldAccessFlags, name: &str, descriptor: &str) -> FieldModel {
        FieldModel {
            access_flags,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            signature: None,
            constant_value: None,
            attributes: vec![],
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(FieldAccessFlags::STATIC)
    }

    pub(crate) fn from_raw(
        field: &class_file::Field,
        constants: &ConstantPool,
    ) -> Result<FieldModel, ClassFormatError> {
        let (signature, attributes) = take_signature(&field.attributes, constants)?;
        let mut constant_value = None;
        let mut rest = vec![];
        for attribute in attributes {
            if constant_value.is_none() && constants.utf8(attribute.name_index) == Ok("ConstantValue")
            {
                let value: ConstantValue = attribute.decode()?;
                constant_value = Some(value.0);
            } else {
                rest.push(attribute);
            }
        }
        Ok(FieldModel {
            access_flags: field.access_flags,
            name: constants.utf8(field.name_index)?.to_owned(),
            descriptor: constants.utf8(field.descriptor_index)?.to_owned(),
            signature,
            constant_value,
            attributes: rest,
        })
    }

    pub(crate) fn to_raw(&self, constants: &mut ConstantPool) -> Result<class_file::Field, Error> {
        let name_index = constants.get_utf8(&self.name)?;
        let descriptor_index = constants.get_utf8(&self.descriptor)?;

        let mut attributes = vec![];
        if let Some(value) = self.constant_value {
            attributes.push(Attribute::from_typed(constants, &ConstantValue(value))?);
        }
        if let Some(signature) = signature_attribute(&self.signature, constants)? {
            attributes.push(signature);
        }
        attributes.extend(self.attributes.iter().cloned());

        Ok(class_file::Field {
            access_flags: self.access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }
}
