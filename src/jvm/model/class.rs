use crate::jvm::class_file::{Attribute, ClassFile, Version};
use crate::jvm::model::{signature_attribute, take_signature, FieldModel, MethodModel};
use crate::jvm::{ClassAccessFlags, ClassFormatError, ConstantPool, Error};

/// Semantic representation of a class
///
/// The class owns its constant pool. Instructions refer into it by index, and new constants are
/// appended as transformers need them.
#[derive(Debug, Clone)]
pub struct ClassModel {
    pub version: Version,
    pub constants: ConstantPool,
    pub access_flags: ClassAccessFlags,

    /// Internal name (eg. `java/lang/String`)
    pub name: String,

    /// Only `java/lang/Object` (and `module-info`) have no superclass
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<FieldModel>,
    pub methods: Vec<MethodModel>,

    /// Generic class signature
    pub signature: Option<String>,

    /// Class attributes the model does not interpret
    pub attributes: Vec<Attribute>,
}

impl ClassModel {
    /// Create a new empty public class
    pub fn new(name: &str, super_name: Option<&str>) -> ClassModel {
        ClassModel {
            version: Version::JAVA8,
            constants: ConstantPool::new(),
            access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
            name: name.to_owned(),
            super_name: super_name.map(str::to_owned),
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            signature: None,
            attributes: vec![],
        }
    }

    /// Parse class bytes into a model
    pub fn build(bytes: &[u8]) -> Result<ClassModel, ClassFormatError> {
        ClassModel::from_class_file(ClassFile::parse(bytes)?)
    }

    pub fn from_class_file(class_file: ClassFile) -> Result<ClassModel, ClassFormatError> {
        let constants = class_file.constants;
        let name = constants.class_name(class_file.this_class)?.to_owned();
        let super_name = match class_file.super_class {
            None => None,
            Some(super_class) => Some(constants.class_name(super_class)?.to_owned()),
        };
        let interfaces = class_file
            .interfaces
            .iter()
            .map(|interface| Ok(constants.class_name(*interface)?.to_owned()))
            .collect::<Result<Vec<String>, ClassFormatError>>()?;
        let fields = class_file
            .fields
            .iter()
            .map(|field| FieldModel::from_raw(field, &constants))
            .collect::<Result<Vec<_>, _>>()?;
        let methods = class_file
            .methods
            .iter()
            .map(|method| MethodModel::from_raw(method, &constants, &name))
            .collect::<Result<Vec<_>, _>>()?;
        let (signature, attributes) = take_signature(&class_file.attributes, &constants)?;

        Ok(ClassModel {
            version: class_file.version,
            constants,
            access_flags: class_file.access_flags,
            name,
            super_name,
            interfaces,
            fields,
            methods,
            signature,
            attributes,
        })
    }

    /// Lower the model back into the class file structure
    ///
    /// This works on a copy of the constant pool, so exporting never changes the model.
    pub fn to_class_file(&self) -> Result<ClassFile, Error> {
        let mut constants = self.constants.clone();
        let this_class = constants.get_class(&self.name)?;
        let super_class = match &self.super_name {
            None => None,
            Some(super_name) => Some(constants.get_class(super_name)?),
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|interface| constants.get_class(interface))
            .collect::<Result<Vec<_>, _>>()?;

        let emit_frames = self.version.uses_stack_map_frames();
        let fields = self
            .fields
            .iter()
            .map(|field| field.to_raw(&mut constants))
            .collect::<Result<Vec<_>, Error>>()?;
        let methods = self
            .methods
            .iter()
            .map(|method| method.to_raw(&mut constants, &self.name, emit_frames))
            .collect::<Result<Vec<_>, Error>>()?;

        let mut attributes = vec![];
        if let Some(signature) = signature_attribute(&self.signature, &mut constants)? {
            attributes.push(signature);
        }
        attributes.extend(self.attributes.iter().cloned());

        for (what, count) in [
            ("interface", interfaces.len()),
            ("field", fields.len()),
            ("method", methods.len()),
        ] {
            if count > u16::MAX as usize {
                return Err(Error::TooManyEntries(what));
            }
        }

        Ok(ClassFile {
            version: self.version,
            constants,
            access_flags: self.access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Serialize the model into class file bytes
    pub fn export(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_class_file()?.to_bytes()?)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(ClassAccessFlags::INTERFACE)
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodModel> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    pub fn field(&self, name: &str, descriptor: &str) -> Option<&FieldModel> {
        self.fields
            .iter()
            .find(|field| field.name == name && field.descriptor == descriptor)
    }

    /// Does loading this class run code?
    pub fn has_static_initializer(&self) -> bool {
        self.methods.iter().any(|method| method.name == "<clinit>")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Code, Element, Instruction, InvokeType};
    use crate::jvm::{FieldAccessFlags, MethodAccessFlags};

    #[test]
    fn model_round_trip() {
        let mut class = ClassModel::new("a/B", Some("java/lang/Object"));
        class.interfaces.push(String::from("java/lang/Runnable"));
        class.signature = Some(String::from("Ljava/lang/Object;Ljava/lang/Runnable;"));

        let mut field = FieldModel::new(
            FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
            "X",
            "I",
        );
        field.constant_value = Some(class.constants.get_integer(7).unwrap());
        class.fields.push(field);

        let init = class
            .constants
            .get_method_ref("java/lang/Object", "<init>", "()V", false)
            .unwrap();
        let mut code = Code::new();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ALoad(0)),
            Element::Insn(Instruction::Invoke(InvokeType::Special, init)),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::PUBLIC, "<init>", "()V");
        method.code = Some(code);
        class.methods.push(method);

        let bytes = class.export().unwrap();
        let parsed = ClassModel::build(&bytes).unwrap();
        assert_eq!(parsed.name, "a/B");
        assert_eq!(parsed.super_name.as_deref(), Some("java/lang/Object"));
        assert_eq!(parsed.interfaces, class.interfaces);
        assert_eq!(parsed.signature, class.signature);
        assert_eq!(parsed.fields, class.fields);
        assert_eq!(parsed.methods[0].code.as_ref().unwrap().elements, class.methods[0].code.as_ref().unwrap().elements);

        assert_eq!(parsed.export().unwrap(), bytes);
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = ClassModel::new("a", Some("java/lang/Object")).export().unwrap();
        bytes[0] = 0;
        assert_eq!(
            ClassModel::build(&bytes).unwrap_err(),
            ClassFormatError::BadMagic(0x00FEBABE)
        );
        assert_eq!(
            ClassModel::build(&bytes[..6]).unwrap_err(),
            ClassFormatError::BadMagic(0x00FEBABE)
        );
        assert_eq!(ClassModel::build(&[0xCA, 0xFE]).unwrap_err(), ClassFormatError::Truncated);
    }
}
