//! Conversion between `StackMapTable` attributes and label-keyed frames
//!
//! The binary format stores frames as deltas against the previous frame (the first one is a
//! delta against the implicit frame at method entry). The class model instead stores the full
//! frame at each label, so that instructions can be moved around freely.

use crate::jvm::class_file::{StackMapFrame, StackMapTable};
use crate::jvm::code::Label;
use crate::jvm::{
    ClassConstantIndex, ClassFormatError, ConstantPool, Error, Frame, VerificationType,
};

pub type ModelFrame = Frame<String, Label>;
pub type ModelVerificationType = VerificationType<String, Label>;
type RawVerificationType = VerificationType<ClassConstantIndex, u16>;

/// Expand a `StackMapTable` into full frames at absolute offsets
pub fn expand_frames(
    table: &StackMapTable,
    entry: &ModelFrame,
    constants: &ConstantPool,
    mut label_at: impl FnMut(usize) -> Result<Label, ClassFormatError>,
) -> Result<Vec<(usize, ModelFrame)>, ClassFormatError> {
    let bad = |reason: &str| ClassFormatError::BadAttribute {
        attribute: "StackMapTable",
        reason: reason.to_owned(),
    };

    let mut convert = |raw: &RawVerificationType| -> Result<ModelVerificationType, ClassFormatError> {
        raw.map(
            |class| Ok(constants.class_name(*class)?.to_owned()),
            |offset| label_at(*offset as usize),
        )
    };

    let mut frames = vec![];
    let mut previous = entry.clone();
    let mut previous_offset: Option<usize> = None;
    for raw_frame in &table.0 {
        let offset = match previous_offset {
            None => raw_frame.offset_delta() as usize,
            Some(prev) => prev + raw_frame.offset_delta() as usize + 1,
        };
        let frame = match raw_frame {
            StackMapFrame::SameLocalsNoStack { .. } => Frame {
                locals: previous.locals.clone(),
                stack: vec![],
            },
            StackMapFrame::SameLocalsOneStack { stack, .. } => Frame {
                locals: previous.locals.clone(),
                stack: vec![convert(stack)?],
            },
            StackMapFrame::ChopLocalsNoStack { chopped_k, .. } => {
                let keep = previous
                    .locals
                    .len()
                    .checked_sub(*chopped_k as usize)
                    .ok_or_else(|| bad("chop frame removes more locals than exist"))?;
                Frame {
                    locals: previous.locals[..keep].to_vec(),
                    stack: vec![],
                }
            }
            StackMapFrame::AppendLocalsNoStack { locals, .. } => {
                let mut all = previous.locals.clone();
                for local in locals {
                    all.push(convert(local)?);
                }
                Frame {
                    locals: all,
                    stack: vec![],
                }
            }
            StackMapFrame::Full { locals, stack, .. } => Frame {
                locals: locals
                    .iter()
                    .map(&mut convert)
                    .collect::<Result<_, _>>()?,
                stack: stack.iter().map(&mut convert).collect::<Result<_, _>>()?,
            },
        };
        frames.push((offset, frame.clone()));
        previous = frame;
        previous_offset = Some(offset);
    }
    Ok(frames)
}

/// Compress full frames (sorted by offset, one per offset) into a `StackMapTable`
pub fn compress_frames(
    frames: &[(usize, &ModelFrame)],
    entry: &ModelFrame,
    constants: &mut ConstantPool,
    label_offsets: impl Fn(&Label) -> Option<usize>,
) -> Result<StackMapTable, Error> {
    let mut convert =
        |typ: &ModelVerificationType| -> Result<RawVerificationType, Error> {
            typ.map(
                |class| -> Result<ClassConstantIndex, Error> { Ok(constants.get_class(class)?) },
                |label| {
                    label_offsets(label)
                        .map(|offset| offset as u16)
                        .ok_or(Error::UnplacedLabel(*label))
                },
            )
        };

    let mut compressed = vec![];
    let mut previous = entry;
    let mut previous_offset: Option<usize> = None;
    for &(offset, frame) in frames {
        let offset_delta = match previous_offset {
            None => offset,
            Some(prev) => offset - prev - 1,
        } as u16;

        let same_locals = frame.locals == previous.locals;
        let raw = if same_locals && frame.stack.is_empty() {
            StackMapFrame::SameLocalsNoStack { offset_delta }
        } else if same_locals && frame.stack.len() == 1 {
            StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack: convert(&frame.stack[0])?,
            }
        } else if frame.stack.is_empty()
            && frame.locals.len() > previous.locals.len()
            && frame.locals.len() - previous.locals.len() <= 3
            && frame.locals.starts_with(&previous.locals)
        {
            StackMapFrame::AppendLocalsNoStack {
                offset_delta,
                locals: frame.locals[previous.locals.len()..]
                    .iter()
                    .map(&mut convert)
                    .collect::<Result<_, _>>()?,
            }
        } else if frame.stack.is_empty()
            && frame.locals.len() < previous.locals.len()
            && previous.locals.len() - frame.locals.len() <= 3
            && previous.locals.starts_with(&frame.locals)
        {
            StackMapFrame::ChopLocalsNoStack {
                offset_delta,
                chopped_k: (previous.locals.len() - frame.locals.len()) as u8,
            }
        } else {
            StackMapFrame::Full {
                offset_delta,
                locals: frame
                    .locals
                    .iter()
                    .map(&mut convert)
                    .collect::<Result<_, _>>()?,
                stack: frame
                    .stack
                    .iter()
                    .map(&mut convert)
                    .collect::<Result<_, _>>()?,
            }
        };
        compressed.push(raw);
        previous = frame;
        previous_offset = Some(offset);
    }
    Ok(StackMapTable(compressed))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::LabelGenerator;

    #[test]
    fn compressed_frames_expand_back() {
        let mut constants = ConstantPool::new();
        let entry: ModelFrame = Frame {
            locals: vec![VerificationType::Object(String::from("a/B"))],
            stack: vec![],
        };
        let appended = Frame {
            locals: vec![
                VerificationType::Object(String::from("a/B")),
                VerificationType::Integer,
                VerificationType::Long,
            ],
            stack: vec![],
        };
        let with_stack = Frame {
            locals: appended.locals.clone(),
            stack: vec![VerificationType::Object(String::from("java/lang/String"))],
        };
        let chopped = entry.clone();
        let frames = vec![(4, &appended), (9, &with_stack), (20, &chopped)];

        let table = compress_frames(&frames, &entry, &mut constants, |_| None).unwrap();
        assert!(matches!(
            table.0[0],
            StackMapFrame::AppendLocalsNoStack { offset_delta: 4, .. }
        ));
        assert!(matches!(
            table.0[1],
            StackMapFrame::SameLocalsOneStack { offset_delta: 4, .. }
        ));
        assert_eq!(
            table.0[2],
            StackMapFrame::ChopLocalsNoStack {
                offset_delta: 10,
                chopped_k: 2
            }
        );

        let mut labels = LabelGenerator::default();
        let expanded = expand_frames(&table, &entry, &constants, |_| Ok(labels.fresh_label()))
            .unwrap();
        assert_eq!(
            expanded,
            vec![(4, appended.clone()), (9, with_stack.clone()), (20, chopped)]
        );
    }
}
