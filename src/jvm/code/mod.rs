//! Method bodies as label-based instruction lists
//!
//! ### Structure
//!
//! Despite being pushed off into [just another method attribute](crate::jvm::class_file::Code),
//! the bytecode is arguably the most important part of the class file - it contains the actual
//! executable instructions. In the class model, a method body is a flat list of [`Element`]s:
//! labels, straight-line [`Instruction`]s, and [`BranchInstruction`]s. Everything that refers to
//! a position in the code (jump targets, exception ranges, debug tables, stack map frames, and
//! uninitialized `new` values) refers to a [`Label`], so inserting or removing instructions never
//! requires fixing up offsets by hand.
//!
//! Offsets come back into existence only in [`decode`] and [`encode`].

mod decode;
mod encode;
mod instructions;
mod label;
mod stack_map;

pub use decode::*;
pub use encode::*;
pub use instructions::*;
pub use label::*;
pub use stack_map::*;

use crate::jvm::class_file::{
    self, Attribute, ExceptionHandler, LineNumber, LineNumberTable, LocalVariable,
    LocalVariableTable, LocalVariableTypeTable, StackMapTable,
};
use crate::jvm::{ClassFormatError, ConstantPool, Error};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Entry in the exception table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handler {
    /// Start of the protected range (inclusive)
    pub start: Label,

    /// End of the protected range (exclusive)
    pub end: Label,

    pub handler: Label,

    /// `None` catches everything
    pub catch_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start: Label,
    pub line: u16,
}

/// Entry in a `LocalVariableTable` (or `LocalVariableTypeTable`, in which case `descriptor` is a
/// generic signature)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start: Label,
    pub end: Label,
    pub name: String,
    pub descriptor: String,
    pub index: u16,
}

/// Method body
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub elements: Vec<Element>,
    pub handlers: Vec<Handler>,
    pub line_numbers: Vec<LineNumberEntry>,
    pub local_variables: Vec<LocalVariableEntry>,
    pub local_variable_types: Vec<LocalVariableEntry>,

    /// Declared frames, keyed by the label they describe
    pub frames: HashMap<Label, ModelFrame>,

    /// Attributes of the `Code` attribute which the model does not interpret
    pub attributes: Vec<Attribute>,

    pub labels: LabelGenerator,
}

impl Code {
    /// Empty method body
    pub fn new() -> Code {
        Code {
            max_stack: 0,
            max_locals: 0,
            elements: vec![],
            handlers: vec![],
            line_numbers: vec![],
            local_variables: vec![],
            local_variable_types: vec![],
            frames: HashMap::new(),
            attributes: vec![],
            labels: LabelGenerator::default(),
        }
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh_label()
    }

    /// Iterate over instructions (skipping labels) along with their element index
    pub fn instructions(&self) -> impl Iterator<Item = (usize, &Element)> + '_ {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.is_instruction())
    }

    /// Labels that are placed in the element list
    pub fn placed_labels(&self) -> BTreeSet<Label> {
        self.elements
            .iter()
            .filter_map(|element| match element {
                Element::Label(label) => Some(*label),
                _ => None,
            })
            .collect()
    }

    /// Labels referenced by branches or exception handlers
    pub fn control_labels(&self) -> BTreeSet<Label> {
        let mut labels = BTreeSet::new();
        for element in &self.elements {
            if let Element::Branch(branch) = element {
                labels.extend(branch.targets());
            }
        }
        for handler in &self.handlers {
            labels.insert(handler.start);
            labels.insert(handler.end);
            labels.insert(handler.handler);
        }
        labels
    }

    /// Decode a raw `Code` attribute
    ///
    /// `entry` is the implicit frame at the start of the method, which the first stack map frame
    /// is relative to. Debug tables are tolerated when they point at nonsense (entries are
    /// dropped), but jump targets and exception ranges must land on instruction boundaries.
    pub fn decode(
        raw: &class_file::Code,
        constants: &ConstantPool,
        entry: &ModelFrame,
    ) -> Result<Code, ClassFormatError> {
        let raw_elements = decode_instructions(&raw.code_array)?;
        let code_len = raw.code_array.len();

        let mut boundaries: BTreeSet<usize> =
            raw_elements.iter().map(|(offset, _)| *offset).collect();
        boundaries.insert(code_len);

        let mut labels = LabelGenerator::default();
        let mut offset_labels: BTreeMap<usize, Label> = BTreeMap::new();
        let mut label_at = |offset: usize| -> Result<Label, ClassFormatError> {
            if !boundaries.contains(&offset) {
                return Err(ClassFormatError::BadCodeOffset(offset));
            }
            Ok(*offset_labels
                .entry(offset)
                .or_insert_with(|| labels.fresh_label()))
        };

        let mut elements_at: Vec<(usize, Element)> = Vec::with_capacity(raw_elements.len());
        for (offset, raw_element) in raw_elements {
            let element = match raw_element {
                RawElement::Insn(insn) => Element::Insn(insn),
                RawElement::Branch(branch) => {
                    Element::Branch(branch.map_labels(|target| label_at(*target))?)
                }
            };
            elements_at.push((offset, element));
        }

        let mut handlers = vec![];
        for handler in &raw.exception_table {
            let catch_type = match handler.catch_type {
                None => None,
                Some(class) => Some(constants.class_name(class)?.to_owned()),
            };
            handlers.push(Handler {
                start: label_at(handler.start_pc as usize)?,
                end: label_at(handler.end_pc as usize)?,
                handler: label_at(handler.handler_pc as usize)?,
                catch_type,
            });
        }

        let mut line_numbers = vec![];
        let mut local_variables = vec![];
        let mut local_variable_types = vec![];
        let mut frames = HashMap::new();
        let mut attributes = vec![];
        for attribute in &raw.attributes {
            match constants.utf8(attribute.name_index) {
                Ok("LineNumberTable") => {
                    let table: LineNumberTable = attribute.decode()?;
                    for LineNumber {
                        start_pc,
                        line_number,
                    } in table.0
                    {
                        if let Ok(start) = label_at(start_pc as usize) {
                            line_numbers.push(LineNumberEntry {
                                start,
                                line: line_number,
                            });
                        }
                    }
                }
                Ok("LocalVariableTable") => {
                    let table: LocalVariableTable = attribute.decode()?;
                    local_variables.extend(decode_local_variables(
                        &table.0,
                        constants,
                        &mut label_at,
                    ));
                }
                Ok("LocalVariableTypeTable") => {
                    let table: LocalVariableTypeTable = attribute.decode()?;
                    local_variable_types.extend(decode_local_variables(
                        &table.0,
                        constants,
                        &mut label_at,
                    ));
                }
                Ok("StackMapTable") => {
                    let table: StackMapTable = attribute.decode()?;
                    for (offset, frame) in expand_frames(&table, entry, constants, &mut label_at)? {
                        frames.insert(label_at(offset)?, frame);
                    }
                }
                _ => attributes.push(attribute.clone()),
            }
        }

        let mut elements = Vec::with_capacity(elements_at.len() + offset_labels.len());
        for (offset, element) in elements_at {
            if let Some(label) = offset_labels.get(&offset) {
                elements.push(Element::Label(*label));
            }
            elements.push(element);
        }
        if let Some(label) = offset_labels.get(&code_len) {
            elements.push(Element::Label(*label));
        }

        Ok(Code {
            max_stack: raw.max_stack,
            max_locals: raw.max_locals,
            elements,
            handlers,
            line_numbers,
            local_variables,
            local_variable_types,
            frames,
            attributes,
            labels,
        })
    }

    /// Encode into a raw `Code` attribute
    ///
    /// Stack map frames are only written when `emit_frames` is set (class version 50 and up).
    /// Debug table entries whose labels are no longer placed are dropped.
    pub fn encode(
        &self,
        constants: &mut ConstantPool,
        entry: &ModelFrame,
        emit_frames: bool,
    ) -> Result<class_file::Code, Error> {
        let encoded = encode_elements(&self.elements)?;
        let offset_of = |label: &Label| -> Result<u16, Error> {
            encoded
                .label_offsets
                .get(label)
                .map(|offset| *offset as u16)
                .ok_or(Error::UnplacedLabel(*label))
        };

        let mut exception_table = vec![];
        for handler in &self.handlers {
            let catch_type = match &handler.catch_type {
                None => None,
                Some(class) => Some(constants.get_class(class)?),
            };
            exception_table.push(ExceptionHandler {
                start_pc: offset_of(&handler.start)?,
                end_pc: offset_of(&handler.end)?,
                handler_pc: offset_of(&handler.handler)?,
                catch_type,
            });
        }

        let mut attributes = vec![];
        if emit_frames {
            let mut by_offset: BTreeMap<usize, &ModelFrame> = BTreeMap::new();
            for (label, frame) in &self.frames {
                if let Some(offset) = encoded.label_offsets.get(label) {
                    if *offset < encoded.bytes.len() {
                        by_offset.entry(*offset).or_insert(frame);
                    }
                }
            }
            for offset in &encoded.widened_fallthroughs {
                if !by_offset.contains_key(offset) {
                    return Err(Error::MissingFrame(*offset));
                }
            }
            if !by_offset.is_empty() {
                let frames: Vec<(usize, &ModelFrame)> = by_offset.into_iter().collect();
                let table = compress_frames(&frames, entry, constants, |label| {
                    encoded.label_offsets.get(label).copied()
                })?;
                attributes.push(Attribute::from_typed(constants, &table)?);
            }
        }

        let line_numbers: Vec<LineNumber> = self
            .line_numbers
            .iter()
            .filter_map(|entry| {
                let start_pc = offset_of(&entry.start).ok()?;
                Some(LineNumber {
                    start_pc,
                    line_number: entry.line,
                })
            })
            .collect();
        if !line_numbers.is_empty() {
            attributes.push(Attribute::from_typed(
                constants,
                &LineNumberTable(line_numbers),
            )?);
        }

        let local_variables =
            encode_local_variables(&self.local_variables, constants, &encoded.label_offsets)?;
        if !local_variables.is_empty() {
            attributes.push(Attribute::from_typed(
                constants,
                &LocalVariableTable(local_variables),
            )?);
        }
        let local_variable_types =
            encode_local_variables(&self.local_variable_types, constants, &encoded.label_offsets)?;
        if !local_variable_types.is_empty() {
            attributes.push(Attribute::from_typed(
                constants,
                &LocalVariableTypeTable(local_variable_types),
            )?);
        }

        attributes.extend(self.attributes.iter().cloned());

        Ok(class_file::Code {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code_array: encoded.bytes,
            exception_table,
            attributes,
        })
    }
}

impl Default for Code {
    fn default() -> Self {
        Code::new()
    }
}

fn decode_local_variables(
    table: &[LocalVariable],
    constants: &ConstantPool,
    label_at: &mut impl FnMut(usize) -> Result<Label, ClassFormatError>,
) -> Vec<LocalVariableEntry> {
    table
        .iter()
        .filter_map(|local| {
            let start = label_at(local.start_pc as usize).ok()?;
            let end = label_at(local.start_pc as usize + local.length as usize).ok()?;
            Some(LocalVariableEntry {
                start,
                end,
                name: constants.utf8(local.name_index).ok()?.to_owned(),
                descriptor: constants.utf8(local.descriptor_index).ok()?.to_owned(),
                index: local.index,
            })
        })
        .collect()
}

fn encode_local_variables(
    entries: &[LocalVariableEntry],
    constants: &mut ConstantPool,
    label_offsets: &HashMap<Label, usize>,
) -> Result<Vec<LocalVariable>, Error> {
    let mut encoded = vec![];
    for entry in entries {
        let (start, end) = match (label_offsets.get(&entry.start), label_offsets.get(&entry.end)) {
            (Some(start), Some(end)) if start <= end => (*start, *end),
            _ => continue,
        };
        encoded.push(LocalVariable {
            start_pc: start as u16,
            length: (end - start) as u16,
            name_index: constants.get_utf8(&entry.name)?,
            descriptor_index: constants.get_utf8(&entry.descriptor)?,
            index: entry.index,
        });
    }
    Ok(encoded)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::{Frame, VerificationType};

    fn entry() -> ModelFrame {
        Frame {
            locals: vec![VerificationType::Integer],
            stack: vec![],
        }
    }

    #[test]
    fn code_round_trips_through_labels() {
        let mut constants = ConstantPool::new();
        let catch = constants.get_class("java/lang/Exception").unwrap();
        let code_array = vec![
            0x1a, // 0: iload_0
            0x99, 0x00, 0x05, // 1: ifeq +5
            0x04, // 4: iconst_1
            0xac, // 5: ireturn
            0x03, // 6: iconst_0
            0xac, // 7: ireturn
        ];
        let same_frame = class_file::StackMapFrame::SameLocalsNoStack { offset_delta: 6 };
        let frames = Attribute::from_typed(&mut constants, &StackMapTable(vec![same_frame]))
            .unwrap();
        let raw = class_file::Code {
            max_stack: 1,
            max_locals: 1,
            code_array: code_array.clone(),
            exception_table: vec![ExceptionHandler {
                start_pc: 0,
                end_pc: 4,
                handler_pc: 6,
                catch_type: Some(catch),
            }],
            attributes: vec![frames],
        };

        let code = Code::decode(&raw, &constants, &entry()).unwrap();
        assert_eq!(code.handlers[0].catch_type.as_deref(), Some("java/lang/Exception"));
        assert_eq!(code.frames.len(), 1);
        assert_eq!(code.placed_labels().len(), 3);

        let again = code.encode(&mut constants, &entry(), true).unwrap();
        assert_eq!(again.code_array, code_array);
        assert_eq!(again.exception_table, raw.exception_table);
        let table: StackMapTable = again.attributes[0].decode().unwrap();
        assert_eq!(table.0, vec![same_frame_at(6)]);
    }

    fn same_frame_at(offset_delta: u16) -> class_file::StackMapFrame {
        class_file::StackMapFrame::SameLocalsNoStack { offset_delta }
    }

    #[test]
    fn misaligned_jump_is_malformed() {
        let raw = class_file::Code {
            max_stack: 1,
            max_locals: 1,
            code_array: vec![0xa7, 0x00, 0x01, 0xb1],
            exception_table: vec![],
            attributes: vec![],
        };
        assert_eq!(
            Code::decode(&raw, &ConstantPool::new(), &entry()).unwrap_err(),
            ClassFormatError::BadCodeOffset(1)
        );
    }
}
