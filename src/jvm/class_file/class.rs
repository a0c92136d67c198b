use crate::jvm::class_file::{Attribute, Deserialize, Field, Method, Serialize, Version};
use crate::jvm::{ClassAccessFlags, ClassConstantIndex, ClassFormatError, ConstantPool};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Representation of the [`class` file format of the JVM][0]
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub version: Version,
    pub constants: ConstantPool,
    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,

    /// Only `java/lang/Object` (and `module-info`) have no superclass
    pub super_class: Option<ClassConstantIndex>,
    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes that go at the front of the serialized class file
    pub const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

    /// Parse a complete class file, rejecting trailing garbage
    pub fn parse(bytes: &[u8]) -> Result<ClassFile, ClassFormatError> {
        let mut cursor = Cursor::new(bytes);
        let class_file = ClassFile::deserialize(&mut cursor)?;
        let leftover = bytes.len() - cursor.position() as usize;
        if leftover > 0 {
            return Err(ClassFormatError::TrailingBytes(leftover));
        }
        Ok(class_file)
    }

    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        Ok(bytes)
    }
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&ClassFile::MAGIC)?;
        self.version.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        match self.super_class {
            Some(super_class) => super_class.serialize(writer)?,
            None => 0u16.serialize(writer)?,
        }
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for ClassFile {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, ClassFormatError> {
        let magic = u32::deserialize(reader)?;
        if magic != u32::from_be_bytes(ClassFile::MAGIC) {
            return Err(ClassFormatError::BadMagic(magic));
        }
        let version = Version::deserialize(reader)?;
        let constants = ConstantPool::deserialize(reader)?;
        let access_flags = ClassAccessFlags::deserialize(reader)?;
        let this_class = ClassConstantIndex::deserialize(reader)?;
        let super_class = match u16::deserialize(reader)? {
            0 => None,
            idx => Some(ClassConstantIndex(crate::jvm::ConstantIndex(idx))),
        };
        Ok(ClassFile {
            version,
            constants,
            access_flags,
            this_class,
            super_class,
            interfaces: Vec::deserialize(reader)?,
            fields: Vec::deserialize(reader)?,
            methods: Vec::deserialize(reader)?,
            attributes: Vec::deserialize(reader)?,
        })
    }
}
