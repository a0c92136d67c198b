//! Structural and type-level checks on a class
//!
//! The checks mirror what the JVM does when it loads a class, with one exception: classes outside
//! the class set (and the handful of library classes the [`ClassHierarchy`] knows about) are not
//! available, so assignability between unknown classes is assumed to hold.
//!
//! Verification is by type-checking: the [`Dataflow`] analysis runs in checking mode, using the
//! method's declared stack map frames as the types at their labels. From class file version 50
//! on, every block that is a jump or handler target or follows an unconditional branch must
//! declare a frame. Methods using subroutines (`jsr`/`ret`) cannot be type-checked that way and
//! are only checked structurally.

use crate::analysis::{
    AnalysisError, ClassHierarchy, ControlFlowGraph, Dataflow, DataflowOptions, VerifierErrorKind,
};
use crate::jvm::code::{BranchInstruction, Code, Element, Label};
use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::{ConstantPool, FieldType, ParseDescriptor};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Outcome of verifying a class, as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason")]
pub enum VerificationStatus {
    Valid,
    Invalid(String),
}

impl VerificationStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationStatus::Valid)
    }
}

impl From<Result<(), MethodVerificationError>> for VerificationStatus {
    fn from(result: Result<(), MethodVerificationError>) -> Self {
        match result {
            Ok(()) => VerificationStatus::Valid,
            Err(err) => VerificationStatus::Invalid(err.to_string()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifierError {
    #[error("method without code is neither abstract nor native")]
    MissingCode,

    #[error("abstract or native method has code")]
    UnexpectedCode,

    #[error("field descriptor {0:?} does not parse")]
    BadFieldDescriptor(String),

    #[error("label {0:?} is referenced but not placed exactly once")]
    BadLabel(Label),

    #[error("exception handler {0} has an empty or inverted range")]
    BadHandlerRange(usize),

    #[error("catch type {0:?} is not a class")]
    BadCatchType(String),

    #[error("{0}")]
    Analysis(#[from] AnalysisError),
}

/// Failure of a specific member
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{member}: {error}")]
pub struct MethodVerificationError {
    /// Name and descriptor of the offending member
    pub member: String,
    pub error: VerifierError,
}

/// Verify every field and method of a class
pub fn verify(class: &ClassModel, hierarchy: &ClassHierarchy) -> Result<(), MethodVerificationError> {
    for field in &class.fields {
        if FieldType::parse(&field.descriptor).is_err() {
            return Err(MethodVerificationError {
                member: format!("{}:{}", field.name, field.descriptor),
                error: VerifierError::BadFieldDescriptor(field.descriptor.clone()),
            });
        }
    }
    let stack_map_frames = class.version.uses_stack_map_frames();
    for method in &class.methods {
        verify_method(
            &class.name,
            method,
            &class.constants,
            hierarchy,
            stack_map_frames,
        )
        .map_err(|error| {
            log::debug!(
                "{}.{}{} fails verification: {}",
                class.name,
                method.name,
                method.descriptor,
                error
            );
            MethodVerificationError {
                member: format!("{}{}", method.name, method.descriptor),
                error,
            }
        })?;
    }
    Ok(())
}

/// Verify one method of the class `class_name`
///
/// `stack_map_frames` says whether the class version requires declared frames.
pub fn verify_method(
    class_name: &str,
    method: &MethodModel,
    constants: &ConstantPool,
    hierarchy: &ClassHierarchy,
    stack_map_frames: bool,
) -> Result<(), VerifierError> {
    let code = match (&method.code, method.needs_code()) {
        (Some(code), true) => code,
        (None, false) => return Ok(()),
        (Some(_), false) => return Err(VerifierError::UnexpectedCode),
        (None, true) => return Err(VerifierError::MissingCode),
    };

    check_structure(code)?;
    let uses_subroutines = code.elements.iter().any(|element| {
        matches!(
            element,
            Element::Branch(BranchInstruction::Jsr(_) | BranchInstruction::Ret(_))
        )
    });
    if stack_map_frames && !uses_subroutines {
        check_frames(code)?;
    }

    let options = DataflowOptions {
        iteration_factor: 256,
        checking: true,
    };
    match Dataflow::analyze(class_name, method, constants, hierarchy, &options) {
        Ok(_) => Ok(()),
        Err(AnalysisError::Subroutine) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Every block entered other than by falling through starts with a declared frame
fn check_frames(code: &Code) -> Result<(), VerifierError> {
    let cfg = ControlFlowGraph::build(code)?;
    for (id, block) in cfg.blocks.iter().enumerate() {
        if !cfg.needs_frame(id) {
            continue;
        }
        let declared = cfg
            .head_labels(code, id)
            .iter()
            .any(|label| code.frames.contains_key(label));
        if !declared {
            return Err(AnalysisError::Type {
                element: block.first_instruction,
                kind: VerifierErrorKind::MissingFrame,
            }
            .into());
        }
    }
    Ok(())
}

/// Label placement, handler ranges, and catch types
fn check_structure(code: &Code) -> Result<(), VerifierError> {
    let mut positions: HashMap<Label, usize> = HashMap::new();
    let mut duplicated = vec![];
    for (idx, element) in code.elements.iter().enumerate() {
        if let Element::Label(label) = element {
            if positions.insert(*label, idx).is_some() {
                duplicated.push(*label);
            }
        }
    }

    let debug_labels = code
        .line_numbers
        .iter()
        .map(|entry| entry.start)
        .chain(
            code.local_variables
                .iter()
                .chain(&code.local_variable_types)
                .flat_map(|entry| [entry.start, entry.end]),
        )
        .chain(code.frames.keys().copied());
    for label in code.control_labels().into_iter().chain(debug_labels) {
        if !positions.contains_key(&label) || duplicated.contains(&label) {
            return Err(VerifierError::BadLabel(label));
        }
    }

    for (idx, handler) in code.handlers.iter().enumerate() {
        let start = positions[&handler.start];
        let end = positions[&handler.end];
        let has_instruction = code.elements[start..end.max(start)]
            .iter()
            .any(|element| element.is_instruction());
        if start >= end || !has_instruction {
            return Err(VerifierError::BadHandlerRange(idx));
        }
        if let Some(catch_type) = &handler.catch_type {
            if catch_type.is_empty() || catch_type.starts_with('[') {
                return Err(VerifierError::BadCatchType(catch_type.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Element, Handler, Instruction, OrdComparison};
    use crate::jvm::{Frame, MethodAccessFlags, VerificationType, Version};

    fn class_with(method: MethodModel) -> ClassModel {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        class.methods.push(method);
        class
    }

    fn returning_int(max_stack: u16) -> MethodModel {
        let mut code = Code::new();
        code.max_stack = max_stack;
        code.elements = vec![
            Element::Insn(Instruction::IConst1),
            Element::Branch(BranchInstruction::IReturn),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "one", "()I");
        method.code = Some(code);
        method
    }

    #[test]
    fn valid_and_overflowing_methods() {
        let hierarchy = ClassHierarchy::new();
        assert_eq!(verify(&class_with(returning_int(1)), &hierarchy), Ok(()));

        let err = verify(&class_with(returning_int(0)), &hierarchy).unwrap_err();
        assert_eq!(err.member, "one()I");
        let status = VerificationStatus::from(Err(err));
        assert!(!status.is_valid());
    }

    #[test]
    fn code_presence_matches_flags() {
        let hierarchy = ClassHierarchy::new();
        let mut method = returning_int(1);
        method.access_flags |= MethodAccessFlags::ABSTRACT;
        let err = verify(&class_with(method), &hierarchy).unwrap_err();
        assert_eq!(err.error, VerifierError::UnexpectedCode);

        let method = MethodModel::new(MethodAccessFlags::STATIC, "two", "()I");
        let err = verify(&class_with(method), &hierarchy).unwrap_err();
        assert_eq!(err.error, VerifierError::MissingCode);
    }

    #[test]
    fn handler_ranges_must_be_non_empty() {
        let mut method = returning_int(1);
        let code = method.code.as_mut().unwrap();
        let start = code.fresh_label();
        let handler = code.fresh_label();
        code.elements.insert(0, Element::Label(start));
        code.elements.push(Element::Label(handler));
        code.elements.push(Element::Branch(BranchInstruction::AThrow));
        code.handlers.push(Handler {
            start,
            end: start,
            handler,
            catch_type: None,
        });
        let err = verify(&class_with(method), &ClassHierarchy::new()).unwrap_err();
        assert_eq!(err.error, VerifierError::BadHandlerRange(0));
    }

    #[test]
    fn unplaced_debug_labels_are_rejected() {
        let mut method = returning_int(1);
        let code = method.code.as_mut().unwrap();
        let dangling = code.fresh_label();
        code.line_numbers.push(crate::jvm::code::LineNumberEntry {
            start: dangling,
            line: 3,
        });
        let err = verify(&class_with(method), &ClassHierarchy::new()).unwrap_err();
        assert_eq!(err.error, VerifierError::BadLabel(dangling));
    }

    /// `static void f(int x) { if (x != 0) return; return; }`, without frames
    fn branching() -> (MethodModel, Label) {
        let mut code = Code::new();
        let zero = code.fresh_label();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, zero)),
            Element::Branch(BranchInstruction::Return),
            Element::Label(zero),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "f", "(I)V");
        method.code = Some(code);
        (method, zero)
    }

    #[test]
    fn jump_targets_need_frames_from_java_6() {
        let hierarchy = ClassHierarchy::new();
        let (method, zero) = branching();
        let mut class = class_with(method);
        let err = verify(&class, &hierarchy).unwrap_err();
        assert_eq!(
            err.error,
            VerifierError::Analysis(AnalysisError::Type {
                element: 4,
                kind: VerifierErrorKind::MissingFrame,
            })
        );

        class.version = Version::JAVA5;
        assert_eq!(verify(&class, &hierarchy), Ok(()));

        class.version = Version::JAVA8;
        class.methods[0].code.as_mut().unwrap().frames.insert(
            zero,
            Frame {
                locals: vec![VerificationType::Integer],
                stack: vec![],
            },
        );
        assert_eq!(verify(&class, &hierarchy), Ok(()));
    }

    #[test]
    fn unreachable_code_needs_a_frame_and_is_checked() {
        let hierarchy = ClassHierarchy::new();
        let mut code = Code::new();
        let dead = code.fresh_label();
        let end = code.fresh_label();
        code.max_stack = 1;
        code.elements = vec![
            Element::Branch(BranchInstruction::Goto(end)),
            Element::Label(dead),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::Pop),
            Element::Label(end),
            Element::Branch(BranchInstruction::Return),
        ];
        let empty = Frame {
            locals: vec![],
            stack: vec![],
        };
        code.frames.insert(end, empty.clone());
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "g", "()V");
        method.code = Some(code);
        let mut class = class_with(method);

        let err = verify(&class, &hierarchy).unwrap_err();
        assert_eq!(
            err.error,
            VerifierError::Analysis(AnalysisError::Type {
                element: 2,
                kind: VerifierErrorKind::MissingFrame,
            })
        );

        let code = class.methods[0].code.as_mut().unwrap();
        code.frames.insert(dead, empty);
        assert_eq!(verify(&class, &hierarchy), Ok(()));

        // Dead code is type-checked against its frame like any other code
        let code = class.methods[0].code.as_mut().unwrap();
        code.elements[2] = Element::Insn(Instruction::Nop);
        let err = verify(&class, &hierarchy).unwrap_err();
        assert_eq!(
            err.error,
            VerifierError::Analysis(AnalysisError::Type {
                element: 3,
                kind: VerifierErrorKind::EmptyStack,
            })
        );
    }
}
