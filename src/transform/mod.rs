//! Deobfuscation passes
//!
//! Every pass implements [`Transformer`]. A pass either works on one class at a time (with
//! read-only access to the rest of the class set through [`TransformContext::class`]) or on the
//! whole class set at once, which is needed when a change must be mirrored across classes (eg.
//! renaming a method and all of its overrides).
//!
//! Passes report what they did through the context, which keeps the log entries and the methods
//! that had to be skipped. A pass that edits a method body calls [`finish_method`] afterwards, so
//! that `max_stack`, `max_locals`, and stack map frames describe the edited code.

mod catalog;
pub mod interpreter;
pub mod passes;

pub use catalog::*;

use crate::analysis::{AnalysisError, ClassHierarchy, Dataflow, DataflowOptions};
use crate::engine::Settings;
use crate::jvm::code::{Element, Instruction, Label, ModelFrame};
use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::{ClassFormatError, ConstantPool, ConstantPoolOverflow};
use interpreter::InterpretationError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Obfuscation category a transformer undoes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    GenericCleanup,
    ControlFlow,
    StringDecryption,
    ReflectionResolution,
    AntiTamperRemoval,
    Renaming,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::GenericCleanup,
        Category::ControlFlow,
        Category::StringDecryption,
        Category::ReflectionResolution,
        Category::AntiTamperRemoval,
        Category::Renaming,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::GenericCleanup => "generic-cleanup",
            Category::ControlFlow => "control-flow",
            Category::StringDecryption => "string-decryption",
            Category::ReflectionResolution => "reflection-resolution",
            Category::AntiTamperRemoval => "anti-tamper-removal",
            Category::Renaming => "renaming",
        }
    }

    pub fn from_name(name: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|category| category.name() == name)
    }
}

/// What a transformer operates on
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Scope {
    /// One class at a time, in any order (possibly in parallel)
    Class,

    /// All classes together
    ClassSet,
}

#[derive(Debug, Error)]
pub enum TransformError {
    /// The transformer hit a condition it does not know how to handle
    #[error("transform failure: {0}")]
    TransformFailure(String),

    #[error("interpretation aborted: {0}")]
    InterpretationAborted(#[from] InterpretationError),

    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("bad class: {0}")]
    ClassFormat(#[from] ClassFormatError),

    #[error("export failed: {0}")]
    Export(#[from] crate::jvm::Error),
}

impl From<ConstantPoolOverflow> for TransformError {
    fn from(overflow: ConstantPoolOverflow) -> Self {
        TransformError::Export(overflow.into())
    }
}

/// Read-only view of the class set, keyed by class name
pub type ClassIndex = HashMap<String, Arc<ClassModel>>;

/// Method that a transformer had to leave alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMethod {
    /// Name and descriptor
    pub method: String,
    pub reason: String,
}

static NO_NAMES: BTreeSet<String> = BTreeSet::new();

/// Everything a transformer can see, plus where it reports to
pub struct TransformContext<'a> {
    pub index: &'a ClassIndex,
    pub hierarchy: &'a ClassHierarchy,
    pub settings: &'a Settings,

    /// Class names in use outside the class set, such as entries which failed to load
    pub reserved_names: &'a BTreeSet<String>,

    /// Log entries, keyed by the name the class had when the transformer started
    logs: BTreeMap<String, Vec<String>>,
    skipped: BTreeMap<String, Vec<SkippedMethod>>,
}

impl<'a> TransformContext<'a> {
    pub fn new(
        index: &'a ClassIndex,
        hierarchy: &'a ClassHierarchy,
        settings: &'a Settings,
    ) -> TransformContext<'a> {
        TransformContext {
            index,
            hierarchy,
            settings,
            reserved_names: &NO_NAMES,
            logs: BTreeMap::new(),
            skipped: BTreeMap::new(),
        }
    }

    pub fn with_reserved_names(mut self, names: &'a BTreeSet<String>) -> TransformContext<'a> {
        self.reserved_names = names;
        self
    }

    /// Look up a class (as it was before the current transformer started)
    pub fn class(&self, name: &str) -> Option<&ClassModel> {
        self.index.get(name).map(|class| class.as_ref())
    }

    pub fn log(&mut self, class: &str, message: impl Into<String>) {
        let message = message.into();
        log::debug!("{}: {}", class, message);
        self.logs.entry(class.to_owned()).or_default().push(message);
    }

    /// Record a method which could not be analyzed and was left unchanged
    pub fn skip_method(&mut self, class: &str, method: &MethodModel, reason: impl ToString) {
        let reason = reason.to_string();
        log::info!(
            "skipping {}.{}{}: {}",
            class,
            method.name,
            method.descriptor,
            reason
        );
        self.skipped
            .entry(class.to_owned())
            .or_default()
            .push(SkippedMethod {
                method: format!("{}{}", method.name, method.descriptor),
                reason,
            });
    }

    pub fn dataflow_options(&self) -> DataflowOptions {
        DataflowOptions {
            iteration_factor: self.settings.dataflow_factor,
            checking: false,
        }
    }

    /// Take the log entries recorded for a class
    pub fn take_log(&mut self, class: &str) -> Vec<String> {
        self.logs.remove(class).unwrap_or_default()
    }

    pub fn take_skipped(&mut self, class: &str) -> Vec<SkippedMethod> {
        self.skipped.remove(class).unwrap_or_default()
    }
}

/// A deobfuscation pass
///
/// Transformers return whether they changed anything. Returning an error (or panicking) reverts
/// the class (for [`Scope::Class`]) or every class (for [`Scope::ClassSet`]) to the state it had
/// before the transformer ran.
pub trait Transformer: Send + Sync {
    /// Unique kebab-case name, used to select the transformer
    fn name(&self) -> &'static str;

    fn category(&self) -> Category;

    fn description(&self) -> &'static str;

    fn scope(&self) -> Scope {
        Scope::Class
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        let _ = (class, ctx);
        Ok(false)
    }

    /// Transform every class, returning which ones changed (in the same order as `classes`)
    fn transform_class_set(
        &self,
        classes: &mut [ClassModel],
        ctx: &mut TransformContext,
    ) -> Result<Vec<bool>, TransformError> {
        let mut changed = vec![];
        for class in classes {
            changed.push(self.transform_class(class, ctx)?);
        }
        Ok(changed)
    }
}

/// Analyze every method with code, skipping (and recording) the ones that can't be analyzed
///
/// Methods which fail to analyze for any reason are left alone: beyond non-convergence and
/// subroutines, obfuscated input sometimes carries code that doesn't type-check in the first place.
///
/// The callback gets the dataflow of each method that could be analyzed and returns whether it
/// changed the method. Changed methods are finished with [`finish_method`].
pub fn for_each_analyzable_method(
    class: &mut ClassModel,
    ctx: &mut TransformContext,
    mut edit: impl FnMut(
        &str,
        &mut ConstantPool,
        &mut MethodModel,
        &Dataflow,
        &mut TransformContext,
    ) -> Result<bool, TransformError>,
) -> Result<bool, TransformError> {
    let emit_frames = class.version.uses_stack_map_frames();
    let mut changed = false;
    for method in &mut class.methods {
        if method.code.is_none() {
            continue;
        }
        let options = ctx.dataflow_options();
        let flow = match Dataflow::analyze(
            &class.name,
            method,
            &class.constants,
            ctx.hierarchy,
            &options,
        ) {
            Ok(flow) => flow,
            Err(err) => {
                ctx.skip_method(&class.name, method, err);
                continue;
            }
        };

        let original = method.clone();
        if edit(&class.name, &mut class.constants, method, &flow, ctx)? {
            match finish_method(&class.name, &class.constants, method, ctx, emit_frames) {
                Ok(()) => changed = true,
                Err(TransformError::Analysis(err)) if err.is_unanalyzable() => {
                    *method = original;
                    ctx.skip_method(&class.name, method, err);
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(changed)
}

/// Bring `max_stack`, `max_locals`, and stack map frames in line with an edited method body
///
/// Unreachable instructions are dropped, since no frame can describe them, and so are exception
/// handlers left covering nothing. Declared frames stay where their block still starts and still
/// needs one; every other block which is a jump target or follows an unconditional branch gets a
/// computed frame.
pub fn finish_method(
    class_name: &str,
    constants: &ConstantPool,
    method: &mut MethodModel,
    ctx: &TransformContext,
    emit_frames: bool,
) -> Result<(), TransformError> {
    let options = ctx.dataflow_options();
    let code = match method.code.as_mut() {
        Some(code) => code,
        None => return Ok(()),
    };

    // Uninitialized values in frames refer to the label before their `new`
    let mut idx = 0;
    while idx < code.elements.len() {
        let labelled = idx > 0 && matches!(code.elements[idx - 1], Element::Label(_));
        if matches!(code.elements[idx], Element::Insn(Instruction::New(_))) && !labelled {
            let label = code.fresh_label();
            code.elements.insert(idx, Element::Label(label));
            idx += 1;
        }
        idx += 1;
    }

    let mut flow = Dataflow::analyze(class_name, method, constants, ctx.hierarchy, &options)?;
    if remove_unreachable(method, &flow) {
        flow = Dataflow::analyze(class_name, method, constants, ctx.hierarchy, &options)?;
    }
    let entry_locals = method
        .entry_frame(class_name)
        .map(|frame| frame.locals.len())
        .unwrap_or(0);
    let code = match method.code.as_mut() {
        Some(code) => code,
        None => return Ok(()),
    };
    code.max_stack = flow.max_stack as u16;
    code.max_locals = flow.max_locals.max(entry_locals) as u16;

    if !emit_frames {
        code.frames.clear();
        return Ok(());
    }

    let label_before = |position: usize| -> Option<Label> {
        match code.elements.get(position.checked_sub(1)?) {
            Some(Element::Label(label)) => Some(*label),
            _ => None,
        }
    };
    // Blocks which need a frame: (position of the block head, label at the head if any, frame)
    let mut required: Vec<(usize, Option<Label>, ModelFrame)> = vec![];
    let mut frames: HashMap<Label, ModelFrame> = HashMap::new();
    let control_labels = code.control_labels();
    for (id, block) in flow.cfg.blocks.iter().enumerate() {
        if !flow.cfg.needs_frame(id) {
            continue;
        }
        let labels = flow.cfg.head_labels(code, id);
        if let Some(label) = labels.iter().find(|label| code.frames.contains_key(label)) {
            frames.insert(*label, code.frames[label].clone());
            continue;
        }
        let state = flow
            .state_before(block.first_instruction)
            .ok_or_else(|| TransformError::TransformFailure(String::from("unreachable block")))?;
        let frame = state.to_model_frame(label_before).ok_or_else(|| {
            TransformError::TransformFailure(String::from("uninitialized value without a label"))
        })?;
        let label = labels
            .iter()
            .find(|label| control_labels.contains(label))
            .or_else(|| labels.first());
        required.push((block.first_instruction, label.copied(), frame));
    }

    // Long methods may need their conditional branches widened, which turns the fall-through into
    // a jump target
    let long_method = crate::jvm::code::encode_elements(&code.elements)
        .map(|encoded| encoded.bytes.len() > i16::MAX as usize)
        .unwrap_or(true);
    if long_method {
        for (idx, element) in code.elements.iter().enumerate() {
            let conditional = matches!(element, Element::Branch(branch) if branch.is_conditional());
            let next = idx + 1;
            if !conditional || next >= code.elements.len() {
                continue;
            }
            if required.iter().any(|(position, _, _)| *position == next) {
                continue;
            }
            if let Some(state) = flow.state_before(next) {
                if let Some(frame) = state.to_model_frame(label_before) {
                    required.push((next, None, frame));
                }
            }
        }
    }

    required.sort_by_key(|(position, _, _)| *position);
    for (position, label, frame) in required.into_iter().rev() {
        let label = match label {
            Some(label) => label,
            None => {
                let label = code.fresh_label();
                code.elements.insert(position, Element::Label(label));
                label
            }
        };
        frames.insert(label, frame);
    }
    code.frames = frames;
    Ok(())
}

/// Drop instructions the analysis never reached and handlers left covering no instruction,
/// returning whether anything was removed
pub(crate) fn remove_unreachable(method: &mut MethodModel, flow: &Dataflow) -> bool {
    let code = match method.code.as_mut() {
        Some(code) => code,
        None => return false,
    };
    let before = (code.elements.len(), code.handlers.len());
    let mut idx = 0;
    code.elements.retain(|element| {
        let keep = !element.is_instruction() || flow.is_reachable(idx);
        idx += 1;
        keep
    });

    let positions: HashMap<Label, usize> = code
        .elements
        .iter()
        .enumerate()
        .filter_map(|(idx, element)| match element {
            Element::Label(label) => Some((*label, idx)),
            _ => None,
        })
        .collect();
    let elements = &code.elements;
    code.handlers.retain(|handler| {
        match (positions.get(&handler.start), positions.get(&handler.end)) {
            (Some(start), Some(end)) if start < end => elements[*start..*end]
                .iter()
                .any(|element| element.is_instruction()),
            _ => false,
        }
    });
    (code.elements.len(), code.handlers.len()) != before
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::jvm::code::{BranchInstruction, Code, OrdComparison};
    use crate::jvm::MethodAccessFlags;

    #[test]
    fn finishing_drops_dead_code_and_adds_frames() {
        let mut code = Code::new();
        let skip = code.fresh_label();
        let loop_head = code.fresh_label();
        code.elements = vec![
            Element::Insn(Instruction::IConst0),
            Element::Insn(Instruction::IStore(0)),
            Element::Branch(BranchInstruction::Goto(skip)),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::Pop),
            Element::Label(skip),
            Element::Label(loop_head),
            Element::Insn(Instruction::IInc(0, 1)),
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::NE, loop_head)),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "m", "()V");
        method.code = Some(code);

        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let ctx = TransformContext::new(&index, &hierarchy, &settings);
        finish_method("a/A", &ConstantPool::new(), &mut method, &ctx, true).unwrap();

        let code = method.code.unwrap();
        assert_eq!(code.elements.len(), 9);
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);
        assert_eq!(code.frames.len(), 1);
        let frame = &code.frames[&skip];
        assert_eq!(frame.locals, vec![crate::jvm::VerificationType::Integer]);
    }
}
