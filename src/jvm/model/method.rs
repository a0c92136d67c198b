use crate::jvm::class_file::{self, Attribute};
use crate::jvm::code::{Code, ModelFrame};
use crate::jvm::model::{signature_attribute, take_signature};
use crate::jvm::{
    ClassFormatError, ConstantPool, Error, Frame, MethodAccessFlags, MethodDescriptor,
    ParseDescriptor, VerificationType,
};
use std::sync::Arc;

/// Semantic representation of a method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodModel {
    pub access_flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,

    /// Generic method signature
    ///
    /// [Format](https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.7.9.1)
    pub signature: Option<String>,

    /// Method body (absent on `abstract` and `native` methods)
    pub code: Option<Code>,

    pub attributes: Vec<Attribute>,

    /// Body as it was read, written back verbatim for as long as `code` still matches it
    read_code: Option<Arc<ReadCode>>,
}

/// `Code` attribute of a parsed method, along with what it decoded to
///
/// Re-encoding a body canonicalizes it (short instruction forms, frame encodings), so a body that
/// nothing edited keeps its original bytes.
#[derive(Debug, PartialEq)]
struct ReadCode {
    decoded: Code,
    attribute: Attribute,
}

impl MethodModel {
    /// Create a new method, without a body
    pub fn new(access_flags: MethodAccessFlags, name: &str, descriptor: &str) -> MethodModel {
        MethodModel {
            access_flags,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            signature: None,
            code: None,
            attributes: vec![],
            read_code: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    /// Does the method need a `Code` attribute?
    pub fn needs_code(&self) -> bool {
        !self
            .access_flags
            .intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE)
    }

    pub fn parsed_descriptor(&self) -> Result<MethodDescriptor, ClassFormatError> {
        MethodDescriptor::parse(&self.descriptor)
            .map_err(|_| ClassFormatError::BadDescriptor(self.descriptor.clone()))
    }

    /// Implicit frame at the start of the method: `this` (if any) then the parameters
    ///
    /// Inside a constructor (other than `Object`'s) `this` starts out uninitialized.
    pub fn entry_frame(&self, class_name: &str) -> Result<ModelFrame, ClassFormatError> {
        let descriptor = self.parsed_descriptor()?;
        let mut locals = vec![];
        if !self.is_static() {
            if self.name == "<init>" && class_name != "java/lang/Object" {
                locals.push(VerificationType::UninitializedThis);
            } else {
                locals.push(VerificationType::Object(class_name.to_owned()));
            }
        }
        for parameter in &descriptor.parameters {
            locals.push(VerificationType::from(parameter));
        }
        Ok(Frame {
            locals,
            stack: vec![],
        })
    }

    pub(crate) fn from_raw(
        method: &class_file::Method,
        constants: &ConstantPool,
        class_name: &str,
    ) -> Result<MethodModel, ClassFormatError> {
        let (signature, attributes) = take_signature(&method.attributes, constants)?;
        let mut model = MethodModel {
            access_flags: method.access_flags,
            name: constants.utf8(method.name_index)?.to_owned(),
            descriptor: constants.utf8(method.descriptor_index)?.to_owned(),
            signature,
            code: None,
            attributes: vec![],
            read_code: None,
        };

        for attribute in attributes {
            if model.code.is_none() && constants.utf8(attribute.name_index) == Ok("Code") {
                let raw: class_file::Code = attribute.decode()?;
                let entry = model.entry_frame(class_name)?;
                let decoded = Code::decode(&raw, constants, &entry)?;
                model.read_code = Some(Arc::new(ReadCode {
                    decoded: decoded.clone(),
                    attribute,
                }));
                model.code = Some(decoded);
            } else {
                model.attributes.push(attribute);
            }
        }
        Ok(model)
    }

    pub(crate) fn to_raw(
        &self,
        constants: &mut ConstantPool,
        class_name: &str,
        emit_frames: bool,
    ) -> Result<class_file::Method, Error> {
        let name_index = constants.get_utf8(&self.name)?;
        let descriptor_index = constants.get_utf8(&self.descriptor)?;

        let mut attributes = vec![];
        if let Some(code) = &self.code {
            if let Some(read) = self.read_code.as_ref().filter(|read| read.decoded == *code) {
                attributes.push(read.attribute.clone());
            } else {
                let entry = self
                    .entry_frame(class_name)
                    .map_err(|_| Error::BadDescriptor(self.descriptor.clone()))?;
                let raw = code.encode(constants, &entry, emit_frames)?;
                attributes.push(Attribute::from_typed(constants, &raw)?);
            }
        }
        if let Some(signature) = signature_attribute(&self.signature, constants)? {
            attributes.push(signature);
        }
        attributes.extend(self.attributes.iter().cloned());

        Ok(class_file::Method {
            access_flags: self.access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }
}
