use crate::jvm::class_file::{read_bytes, Deserialize, Serialize};
use crate::jvm::ClassFormatError;
use crate::util::{Offset, OffsetVec, Width};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::result::Result;

/// Class file constant pool
///
/// The pool is an append-only arena: indices handed out (or read from the class file) stay valid
/// for the lifetime of the pool. Lookups for common constants go through `get_*` methods, which
/// reuse an existing entry when there is one and append a new entry otherwise. Existing UTF8
/// entries are never modified, since any number of other entries may share them. Renaming instead
/// repoints structural entries (see [`ConstantPool::redirect`]) at freshly appended strings.
#[derive(Clone, Debug)]
pub struct ConstantPool {
    constants: OffsetVec<Constant>,

    utf8s: HashMap<String, Utf8ConstantIndex>,
    strings: HashMap<Utf8ConstantIndex, StringConstantIndex>,
    classes: HashMap<Utf8ConstantIndex, ClassConstantIndex>,
    name_and_types: HashMap<(Utf8ConstantIndex, Utf8ConstantIndex), NameAndTypeConstantIndex>,
    field_refs: HashMap<(ClassConstantIndex, NameAndTypeConstantIndex), ConstantIndex>,
    method_refs: HashMap<(ClassConstantIndex, NameAndTypeConstantIndex, bool), ConstantIndex>,
    integers: HashMap<i32, ConstantIndex>,
    floats: HashMap<u32, ConstantIndex>,
    longs: HashMap<i64, ConstantIndex>,
    doubles: HashMap<u64, ConstantIndex>,
}

#[derive(Debug)]
pub struct ConstantPoolOverflow {
    pub constant: Constant,
    pub offset: usize,
}

impl Default for ConstantPool {
    fn default() -> Self {
        ConstantPool::new()
    }
}

impl ConstantPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantPool {
        ConstantPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            utf8s: HashMap::new(),
            strings: HashMap::new(),
            classes: HashMap::new(),
            name_and_types: HashMap::new(),
            field_refs: HashMap::new(),
            method_refs: HashMap::new(),
            integers: HashMap::new(),
            floats: HashMap::new(),
            longs: HashMap::new(),
            doubles: HashMap::new(),
        }
    }

    /// Number of slots used, which is also the `constant_pool_count` of the class file
    pub fn slot_count(&self) -> usize {
        self.constants.offset_len().0
    }

    /// Iterate over every entry along with its index
    pub fn iter(&self) -> impl Iterator<Item = (ConstantIndex, &Constant)> + '_ {
        self.constants
            .iter()
            .map(|(offset, constant)| (ConstantIndex(offset.0 as u16), constant))
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: the largest valid index is 65534, indexing starts at 1, and some constants take two
    /// spaces.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let offset = self.constants.offset_len().0;
        if offset + constant.width() > u16::MAX as usize {
            return Err(ConstantPoolOverflow { constant, offset });
        }
        let index = ConstantIndex(offset as u16);
        self.index_constant(index, &constant);
        self.constants.push(constant);
        Ok(index)
    }

    /// Register a constant in the lookup tables (the first occurrence of a value wins)
    fn index_constant(&mut self, index: ConstantIndex, constant: &Constant) {
        match constant {
            Constant::Utf8(string) => {
                self.utf8s
                    .entry(string.clone())
                    .or_insert(Utf8ConstantIndex(index));
            }
            Constant::String(utf8) => {
                self.strings
                    .entry(*utf8)
                    .or_insert(StringConstantIndex(index));
            }
            Constant::Class(utf8) => {
                self.classes
                    .entry(*utf8)
                    .or_insert(ClassConstantIndex(index));
            }
            Constant::NameAndType { name, descriptor } => {
                self.name_and_types
                    .entry((*name, *descriptor))
                    .or_insert(NameAndTypeConstantIndex(index));
            }
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                self.field_refs
                    .entry((*class, *name_and_type))
                    .or_insert(index);
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                self.method_refs
                    .entry((*class, *name_and_type, *is_interface))
                    .or_insert(index);
            }
            Constant::Integer(integer) => {
                self.integers.entry(*integer).or_insert(index);
            }
            Constant::Float(float) => {
                self.floats.entry(float.to_bits()).or_insert(index);
            }
            Constant::Long(long) => {
                self.longs.entry(*long).or_insert(index);
            }
            Constant::Double(double) => {
                self.doubles.entry(double.to_bits()).or_insert(index);
            }
            _ => (),
        }
    }

    /// Forget a lookup table entry, if it points at `index`
    fn unindex_constant(&mut self, index: ConstantIndex, constant: &Constant) {
        match constant {
            Constant::Class(utf8) => {
                if self.classes.get(utf8) == Some(&ClassConstantIndex(index)) {
                    self.classes.remove(utf8);
                }
            }
            Constant::NameAndType { name, descriptor } => {
                let key = (*name, *descriptor);
                if self.name_and_types.get(&key) == Some(&NameAndTypeConstantIndex(index)) {
                    self.name_and_types.remove(&key);
                }
            }
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                let key = (*class, *name_and_type);
                if self.field_refs.get(&key) == Some(&index) {
                    self.field_refs.remove(&key);
                }
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                let key = (*class, *name_and_type, *is_interface);
                if self.method_refs.get(&key) == Some(&index) {
                    self.method_refs.remove(&key);
                }
            }
            _ => (),
        }
    }

    /// Point a structural entry (class, member reference, name and type, method type) at other
    /// constants
    ///
    /// Every instruction referring to `index` observes the change, which is exactly what renaming
    /// needs. UTF8 and literal entries cannot be redirected.
    pub fn redirect(
        &mut self,
        index: ConstantIndex,
        constant: Constant,
    ) -> Result<(), ClassFormatError> {
        let redirectable = matches!(
            constant,
            Constant::Class(_)
                | Constant::FieldRef { .. }
                | Constant::MethodRef { .. }
                | Constant::NameAndType { .. }
                | Constant::MethodType { .. }
        );
        if !redirectable {
            return Err(ClassFormatError::UnexpectedConstant {
                index: index.0,
                expected: "redirectable constant",
            });
        }
        let new_constant = constant.clone();
        let previous = self
            .constants
            .replace_offset(Offset(index.0 as usize), constant)
            .map_err(|_| ClassFormatError::BadConstantIndex(index.0))?;
        self.unindex_constant(index, &previous);
        self.index_constant(index, &new_constant);
        Ok(())
    }

    pub fn get(&self, index: ConstantIndex) -> Result<&Constant, ClassFormatError> {
        self.constants
            .get_offset(Offset(index.0 as usize))
            .ok_or(ClassFormatError::BadConstantIndex(index.0))
    }

    pub fn utf8(&self, index: Utf8ConstantIndex) -> Result<&str, ClassFormatError> {
        match self.get(index.0)? {
            Constant::Utf8(string) => Ok(string),
            _ => Err(ClassFormatError::UnexpectedConstant {
                index: index.0 .0,
                expected: "decodable utf8",
            }),
        }
    }

    /// Name of a class constant (in internal form, eg. `java/lang/Object` or `[I`)
    pub fn class_name(&self, index: ClassConstantIndex) -> Result<&str, ClassFormatError> {
        match self.get(index.0)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(ClassFormatError::UnexpectedConstant {
                index: index.0 .0,
                expected: "class",
            }),
        }
    }

    pub fn name_and_type(
        &self,
        index: NameAndTypeConstantIndex,
    ) -> Result<(&str, &str), ClassFormatError> {
        match self.get(index.0)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(ClassFormatError::UnexpectedConstant {
                index: index.0 .0,
                expected: "name and type",
            }),
        }
    }

    /// Resolve a field or method reference
    pub fn member_ref(&self, index: ConstantIndex) -> Result<MemberRef<'_>, ClassFormatError> {
        let (kind, class, name_and_type) = match self.get(index)? {
            Constant::FieldRef {
                class,
                name_and_type,
            } => (MemberKind::Field, class, name_and_type),
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                let kind = if *is_interface {
                    MemberKind::InterfaceMethod
                } else {
                    MemberKind::Method
                };
                (kind, class, name_and_type)
            }
            _ => {
                return Err(ClassFormatError::UnexpectedConstant {
                    index: index.0,
                    expected: "member reference",
                })
            }
        };
        let (name, descriptor) = self.name_and_type(*name_and_type)?;
        Ok(MemberRef {
            kind,
            owner: self.class_name(*class)?,
            name,
            descriptor,
        })
    }

    /// Resolve the name and type of an `invokedynamic` call site
    pub fn invoke_dynamic(
        &self,
        index: InvokeDynamicConstantIndex,
    ) -> Result<(u16, &str, &str), ClassFormatError> {
        match self.get(index.0)? {
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type(*name_and_type)?;
                Ok((*bootstrap_method, name, descriptor))
            }
            _ => Err(ClassFormatError::UnexpectedConstant {
                index: index.0 .0,
                expected: "invokedynamic",
            }),
        }
    }

    /// Resolve a constant that can be pushed with `ldc`, `ldc_w`, or `ldc2_w`
    pub fn loadable(&self, index: ConstantIndex) -> Result<LoadableConstant<'_>, ClassFormatError> {
        Ok(match self.get(index)? {
            Constant::Integer(i) => LoadableConstant::Integer(*i),
            Constant::Float(f) => LoadableConstant::Float(*f),
            Constant::Long(l) => LoadableConstant::Long(*l),
            Constant::Double(d) => LoadableConstant::Double(*d),
            Constant::String(utf8) => LoadableConstant::String(self.utf8(*utf8)?),
            Constant::Class(name) => LoadableConstant::Class(self.utf8(*name)?),
            Constant::MethodType { descriptor } => {
                LoadableConstant::MethodType(self.utf8(*descriptor)?)
            }
            Constant::MethodHandle { .. } => LoadableConstant::MethodHandle,
            Constant::Dynamic { name_and_type, .. } => {
                let (_, descriptor) = self.name_and_type(*name_and_type)?;
                LoadableConstant::Dynamic(descriptor)
            }
            _ => {
                return Err(ClassFormatError::UnexpectedConstant {
                    index: index.0,
                    expected: "loadable constant",
                })
            }
        })
    }

    /// Get or insert a utf8 constant
    pub fn get_utf8(&mut self, utf8: &str) -> Result<Utf8ConstantIndex, ConstantPoolOverflow> {
        if let Some(idx) = self.utf8s.get(utf8) {
            Ok(*idx)
        } else {
            Ok(Utf8ConstantIndex(
                self.push_constant(Constant::Utf8(utf8.to_owned()))?,
            ))
        }
    }

    /// Get or insert a string constant
    pub fn get_string(&mut self, string: &str) -> Result<StringConstantIndex, ConstantPoolOverflow> {
        let utf8 = self.get_utf8(string)?;
        if let Some(idx) = self.strings.get(&utf8) {
            Ok(*idx)
        } else {
            Ok(StringConstantIndex(
                self.push_constant(Constant::String(utf8))?,
            ))
        }
    }

    /// Get or insert a class constant
    pub fn get_class(&mut self, name: &str) -> Result<ClassConstantIndex, ConstantPoolOverflow> {
        let utf8 = self.get_utf8(name)?;
        if let Some(idx) = self.classes.get(&utf8) {
            Ok(*idx)
        } else {
            Ok(ClassConstantIndex(
                self.push_constant(Constant::Class(utf8))?,
            ))
        }
    }

    /// Get or insert a name & type constant
    pub fn get_name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<NameAndTypeConstantIndex, ConstantPoolOverflow> {
        let name = self.get_utf8(name)?;
        let descriptor = self.get_utf8(descriptor)?;
        if let Some(idx) = self.name_and_types.get(&(name, descriptor)) {
            Ok(*idx)
        } else {
            let constant = Constant::NameAndType { name, descriptor };
            Ok(NameAndTypeConstantIndex(self.push_constant(constant)?))
        }
    }

    /// Get or insert a field reference
    pub fn get_field_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let class = self.get_class(owner)?;
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        if let Some(idx) = self.field_refs.get(&(class, name_and_type)) {
            Ok(*idx)
        } else {
            self.push_constant(Constant::FieldRef {
                class,
                name_and_type,
            })
        }
    }

    /// Get or insert a method reference (`Methodref` or `InterfaceMethodref`)
    pub fn get_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let class = self.get_class(owner)?;
        let name_and_type = self.get_name_and_type(name, descriptor)?;
        if let Some(idx) = self.method_refs.get(&(class, name_and_type, is_interface)) {
            Ok(*idx)
        } else {
            self.push_constant(Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            })
        }
    }

    pub fn get_integer(&mut self, integer: i32) -> Result<ConstantIndex, ConstantPoolOverflow> {
        match self.integers.get(&integer) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::Integer(integer)),
        }
    }

    pub fn get_float(&mut self, float: f32) -> Result<ConstantIndex, ConstantPoolOverflow> {
        match self.floats.get(&float.to_bits()) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::Float(float)),
        }
    }

    pub fn get_long(&mut self, long: i64) -> Result<ConstantIndex, ConstantPoolOverflow> {
        match self.longs.get(&long) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::Long(long)),
        }
    }

    pub fn get_double(&mut self, double: f64) -> Result<ConstantIndex, ConstantPoolOverflow> {
        match self.doubles.get(&double.to_bits()) {
            Some(idx) => Ok(*idx),
            None => self.push_constant(Constant::Double(double)),
        }
    }
}

impl Serialize for ConstantPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.slot_count() as u16).serialize(writer)?;
        for (_, constant) in &self.constants {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}

impl Deserialize for ConstantPool {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, ClassFormatError> {
        let count = u16::deserialize(reader)? as usize;
        let mut pool = ConstantPool::new();
        while pool.slot_count() < count {
            let index = pool.slot_count() as u16;
            let constant = Constant::deserialize_at(reader, index)?;
            pool.push_constant(constant)
                .map_err(|_| ClassFormatError::BadConstantIndex(index))?;
        }
        if pool.slot_count() != count {
            return Err(ClassFormatError::BadConstantIndex(count as u16));
        }
        Ok(pool)
    }
}

/// Field or method reference, resolved to strings
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberRef<'a> {
    pub kind: MemberKind,
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// Constant pool entry which `ldc` can push
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LoadableConstant<'a> {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(&'a str),
    Class(&'a str),
    MethodType(&'a str),
    MethodHandle,
    Dynamic(&'a str),
}

/// Constants as in the constant pool
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the encoding is not quite UTF-8 (the encoding of the
    /// null character `\u{0000}` and the encoding of supplementary characters
    /// is different).
    Utf8(String),

    /// Utf8 entry whose bytes are not valid modified UTF-8 (eg. unpaired surrogates)
    ///
    /// The JVM loads these as long as nothing resolves them as a name, so they are kept verbatim.
    RawUtf8(Vec<u8>),

    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),

    /// Class or an interface
    Class(Utf8ConstantIndex),

    /// Constant object of type `java.lang.String`
    String(Utf8ConstantIndex),

    FieldRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Method (this combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
        is_interface: bool,
    },

    NameAndType {
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    },

    MethodHandle {
        handle_kind: HandleKind,

        /// `FieldRef` for the field kinds and `MethodRef` for the rest
        member: ConstantIndex,
    },

    MethodType {
        descriptor: Utf8ConstantIndex,
    },

    /// Dynamically-computed constant
    Dynamic {
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    Module(Utf8ConstantIndex),
    Package(Utf8ConstantIndex),
}

impl Constant {
    fn deserialize_at<R: ReadBytesExt>(
        reader: &mut R,
        index: u16,
    ) -> Result<Constant, ClassFormatError> {
        let tag = u8::deserialize(reader)?;
        let utf8 = |reader: &mut R| -> Result<Utf8ConstantIndex, ClassFormatError> {
            Ok(Utf8ConstantIndex(ConstantIndex(u16::deserialize(reader)?)))
        };
        let constant = match tag {
            1 => {
                let len = u16::deserialize(reader)? as usize;
                let bytes = read_bytes(reader, len)?;
                match decode_modified_utf8(&bytes) {
                    Some(string) => Constant::Utf8(string),
                    None => {
                        log::debug!("constant #{} is not valid modified utf8", index);
                        Constant::RawUtf8(bytes)
                    }
                }
            }
            3 => Constant::Integer(i32::deserialize(reader)?),
            4 => Constant::Float(f32::deserialize(reader)?),
            5 => Constant::Long(i64::deserialize(reader)?),
            6 => Constant::Double(f64::deserialize(reader)?),
            7 => Constant::Class(utf8(reader)?),
            8 => Constant::String(utf8(reader)?),
            9 => Constant::FieldRef {
                class: ClassConstantIndex::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
            },
            10 | 11 => Constant::MethodRef {
                class: ClassConstantIndex::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
                is_interface: tag == 11,
            },
            12 => Constant::NameAndType {
                name: utf8(reader)?,
                descriptor: utf8(reader)?,
            },
            15 => {
                let kind = u8::deserialize(reader)?;
                let handle_kind =
                    HandleKind::from_u8(kind).ok_or(ClassFormatError::UnexpectedConstant {
                        index,
                        expected: "method handle kind",
                    })?;
                Constant::MethodHandle {
                    handle_kind,
                    member: ConstantIndex::deserialize(reader)?,
                }
            }
            16 => Constant::MethodType {
                descriptor: utf8(reader)?,
            },
            17 => Constant::Dynamic {
                bootstrap_method: u16::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method: u16::deserialize(reader)?,
                name_and_type: NameAndTypeConstantIndex::deserialize(reader)?,
            },
            19 => Constant::Module(utf8(reader)?),
            20 => Constant::Package(utf8(reader)?),
            tag => return Err(ClassFormatError::BadConstantTag { tag, index }),
        };
        Ok(constant)
    }
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Utf8(string) => {
                1u8.serialize(writer)?;
                let buffer: Vec<u8> = encode_modified_utf8(string);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::RawUtf8(bytes) => {
                1u8.serialize(writer)?;
                (bytes.len() as u16).serialize(writer)?;
                writer.write_all(bytes)?;
            }
            Constant::Integer(integer) => {
                3u8.serialize(writer)?;
                integer.serialize(writer)?;
            }
            Constant::Float(float) => {
                4u8.serialize(writer)?;
                float.serialize(writer)?;
            }
            Constant::Long(long) => {
                5u8.serialize(writer)?;
                long.serialize(writer)?;
            }
            Constant::Double(double) => {
                6u8.serialize(writer)?;
                double.serialize(writer)?;
            }
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::String(utf8) => {
                8u8.serialize(writer)?;
                utf8.serialize(writer)?;
            }
            Constant::FieldRef {
                class,
                name_and_type,
            } => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                (if !is_interface { 10u8 } else { 11u8 }).serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                15u8.serialize(writer)?;
                (*handle_kind as u8).serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType { descriptor } => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            } => {
                17u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::Module(name) => {
                19u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::Package(name) => {
                20u8.serialize(writer)?;
                name.serialize(writer)?;
            }
        };
        Ok(())
    }
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]. Quoting from that section:
///
/// > The differences between this format and the standard UTF-8 format are the following:
/// >
/// >  * The null byte `\u0000` is encoded in 2-byte format rather than 1-byte, so that the encoded
/// >    strings never have embedded nulls.
/// >  * Only the 1-byte, 2-byte, and 3-byte formats are used.
/// >  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    let mut units = [0u16; 2];
    for c in string.chars() {
        for unit in c.encode_utf16(&mut units) {
            let code = *unit as u32;
            match code {
                0x0001..=0x007F => buffer.push(code as u8),
                0x0000 | 0x0080..=0x07FF => {
                    buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
                    buffer.push((code & 0x3F) as u8 | 0b1000_0000);
                }
                _ => {
                    buffer.push((code >> 12 & 0x0F) as u8 | 0b1110_0000);
                    buffer.push((code >> 6 & 0x3F) as u8 | 0b1000_0000);
                    buffer.push((code & 0x3F) as u8 | 0b1000_0000);
                }
            }
        }
    }
    buffer
}

/// Inverse of [`encode_modified_utf8`]
///
/// Returns `None` for byte sequences that do not decode to a Rust string (bad continuation bytes,
/// 4-byte forms, unpaired surrogates).
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    let continuation = |byte: Option<&u8>| -> Option<u16> {
        match byte {
            Some(b) if b & 0b1100_0000 == 0b1000_0000 => Some((b & 0x3F) as u16),
            _ => None,
        }
    };
    while idx < bytes.len() {
        let b0 = bytes[idx];
        if b0 & 0x80 == 0 {
            if b0 == 0 {
                return None;
            }
            units.push(b0 as u16);
            idx += 1;
        } else if b0 & 0b1110_0000 == 0b1100_0000 {
            let b1 = continuation(bytes.get(idx + 1))?;
            units.push(((b0 & 0x1F) as u16) << 6 | b1);
            idx += 2;
        } else if b0 & 0b1111_0000 == 0b1110_0000 {
            let b1 = continuation(bytes.get(idx + 1))?;
            let b2 = continuation(bytes.get(idx + 2))?;
            units.push(((b0 & 0x0F) as u16) << 12 | b1 << 6 | b2);
            idx += 3;
        } else {
            return None;
        }
    }
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod modified_utf8_tests {
    use super::*;

    #[test]
    fn containing_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
        assert_eq!(
            decode_modified_utf8(&[97, 192, 128, 97]).as_deref(),
            Some("a\x00a")
        );
    }

    #[test]
    fn simple_ascii() {
        assert_eq!(encode_modified_utf8("foo"), vec![102, 111, 111]);
        assert_eq!(decode_modified_utf8(b"java/lang/Object").as_deref(), Some("java/lang/Object"));
    }

    #[test]
    fn supplementary_characters() {
        let encoded = encode_modified_utf8("\u{10000}\u{10FFFF}");
        assert_eq!(
            encoded,
            vec![237, 160, 128, 237, 176, 128, 237, 175, 191, 237, 191, 191]
        );
        assert_eq!(
            decode_modified_utf8(&encoded).as_deref(),
            Some("\u{10000}\u{10FFFF}")
        );
    }

    #[test]
    fn rejects_unpaired_surrogate_and_raw_null() {
        assert_eq!(decode_modified_utf8(&[237, 160, 128]), None);
        assert_eq!(decode_modified_utf8(&[97, 0]), None);
        assert_eq!(decode_modified_utf8(&[0xC3]), None);
    }
}

/// Almost all constants have width 1, except for `Constant::Long` and `Constant::Double`. Quoting
/// the JVM specification:
///
/// > All 8-byte constants take up two entries in the constant_pool table of the class file. If a
/// > CONSTANT_Long_info or CONSTANT_Double_info structure is the item in the constant_pool table
/// > at index n, then the next usable item in the pool is located at index n+2.
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ConstantIndex(pub u16);

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Deserialize for ConstantIndex {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, ClassFormatError> {
        Ok(ConstantIndex(u16::deserialize(reader)?))
    }
}

macro_rules! typed_constant_index {
    ($($(#[$attr:meta])* $name:ident;)*) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
            pub struct $name(pub ConstantIndex);

            impl From<$name> for ConstantIndex {
                fn from(index: $name) -> ConstantIndex {
                    index.0
                }
            }

            impl Serialize for $name {
                fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
                    self.0.serialize(writer)
                }
            }

            impl Deserialize for $name {
                fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self, ClassFormatError> {
                    Ok($name(ConstantIndex::deserialize(reader)?))
                }
            }
        )*
    };
}

typed_constant_index! {
    Utf8ConstantIndex;
    StringConstantIndex;
    ClassConstantIndex;
    NameAndTypeConstantIndex;
    /// Index of a `CONSTANT_InvokeDynamic_info`
    InvokeDynamicConstantIndex;
}

/// Type of method handle
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-5.html#jvms-5.4.3.5-220
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
#[repr(u8)]
pub enum HandleKind {
    GetField = 1,
    GetStatic = 2,
    PutField = 3,
    PutStatic = 4,
    InvokeVirtual = 5,
    InvokeStatic = 6,
    InvokeSpecial = 7,
    NewInvokeSpecial = 8,
    InvokeInterface = 9,
}

impl HandleKind {
    fn from_u8(kind: u8) -> Option<HandleKind> {
        Some(match kind {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn lookups_reuse_entries() {
        let mut pool = ConstantPool::new();
        let first = pool.get_method_ref("a/B", "c", "()V", false).unwrap();
        let again = pool.get_method_ref("a/B", "c", "()V", false).unwrap();
        assert_eq!(first, again);

        let long = pool.get_long(7).unwrap();
        let after = pool.get_integer(1).unwrap();
        assert_eq!(after.0, long.0 + 2, "longs take two slots");

        let member = pool.member_ref(first).unwrap();
        assert_eq!(
            (member.kind, member.owner, member.name, member.descriptor),
            (MemberKind::Method, "a/B", "c", "()V")
        );
    }

    #[test]
    fn pool_round_trip_keeps_indices_and_raw_utf8() {
        let mut pool = ConstantPool::new();
        pool.get_double(1.5).unwrap();
        let class = pool.get_class("x/Y").unwrap();
        pool.push_constant(Constant::RawUtf8(vec![237, 160, 128]))
            .unwrap();

        let mut bytes = vec![];
        pool.serialize(&mut bytes).unwrap();
        let decoded = ConstantPool::deserialize(&mut Cursor::new(&bytes)).unwrap();

        assert_eq!(decoded.slot_count(), pool.slot_count());
        assert_eq!(decoded.class_name(class).unwrap(), "x/Y");
        let mut again = vec![];
        decoded.serialize(&mut again).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn redirect_leaves_shared_utf8_alone() {
        let mut pool = ConstantPool::new();
        let class = pool.get_class("a").unwrap();
        let literal = pool.get_string("a").unwrap();

        let renamed = pool.get_utf8("pkg/Class1").unwrap();
        pool.redirect(class.0, Constant::Class(renamed)).unwrap();

        assert_eq!(pool.class_name(class).unwrap(), "pkg/Class1");
        assert_eq!(
            pool.loadable(literal.0).unwrap(),
            LoadableConstant::String("a")
        );
        assert_eq!(pool.get_class("pkg/Class1").unwrap(), class);
        assert_ne!(pool.get_class("a").unwrap(), class);
    }

    #[test]
    fn bad_tag_is_reported() {
        let bytes = [0u8, 2, 2, 0, 0];
        assert_eq!(
            ConstantPool::deserialize(&mut Cursor::new(&bytes)).unwrap_err(),
            ClassFormatError::BadConstantTag { tag: 2, index: 1 }
        );
    }
}
