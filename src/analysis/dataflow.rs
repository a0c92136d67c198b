use crate::analysis::{AnalysisError, ClassHierarchy, ControlFlowGraph, EdgeKind, VerifierErrorKind};
use crate::jvm::code::{
    BranchInstruction, Code, Element, Instruction, InvokeType, Label, ModelFrame, ShiftType,
};
use crate::jvm::model::MethodModel;
use crate::jvm::{
    ClassFormatError, ConstantIndex, ConstantPool, FieldType, Frame, LoadableConstant, MethodDescriptor,
    ParseDescriptor, RefType, VerificationType,
};
use crate::util::Width;
use std::collections::{BTreeSet, HashMap};

/// Verification type used during analysis
///
/// Uninitialized values are identified by the element index of their `new` instruction.
pub type AnalysisType = VerificationType<String, usize>;

/// Constant value tracked by the analysis
///
/// Floating point values are stored as bits so that values compare (and merge) reflexively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstValue {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    String(String),
    Null,

    /// `java/lang/Class` instance for the named class
    Class(String),
}

/// Abstract value in a stack slot or local variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    pub ty: AnalysisType,

    /// `None` is the top of the constant lattice
    pub constant: Option<ConstValue>,
}

impl Value {
    pub fn unknown(ty: AnalysisType) -> Value {
        Value { ty, constant: None }
    }

    pub fn known(ty: AnalysisType, constant: ConstValue) -> Value {
        Value {
            ty,
            constant: Some(constant),
        }
    }

    pub fn int(value: i32) -> Value {
        Value::known(VerificationType::Integer, ConstValue::Int(value))
    }

    pub fn long(value: i64) -> Value {
        Value::known(VerificationType::Long, ConstValue::Long(value))
    }

    fn top() -> Value {
        Value::unknown(VerificationType::Top)
    }

    pub fn int_constant(&self) -> Option<i32> {
        match self.constant {
            Some(ConstValue::Int(i)) => Some(i),
            _ => None,
        }
    }

    pub fn long_constant(&self) -> Option<i64> {
        match self.constant {
            Some(ConstValue::Long(l)) => Some(l),
            _ => None,
        }
    }
}

impl Width for Value {
    fn width(&self) -> usize {
        self.ty.width()
    }
}

/// Abstract state before an instruction
///
/// Locals are indexed by slot, so a `long` in slot 3 is followed by a `Top` in slot 4. The stack
/// holds one entry per value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameState {
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
}

impl FrameState {
    /// Depth of the stack, in slots
    pub fn stack_depth(&self) -> usize {
        self.stack.iter().map(Width::width).sum()
    }

    /// Value at the top of the stack, with `0` being the topmost entry
    pub fn peek(&self, depth: usize) -> Option<&Value> {
        self.stack.len().checked_sub(depth + 1).map(|idx| &self.stack[idx])
    }

    /// Load a declared stack map frame
    pub fn from_model_frame(
        frame: &ModelFrame,
        uninitialized: impl Fn(&Label) -> Option<usize>,
    ) -> FrameState {
        let convert = |typ: &VerificationType<String, Label>| -> AnalysisType {
            typ.map::<_, _, ()>(|cls| Ok(cls.clone()), |label| uninitialized(label).ok_or(()))
                .unwrap_or(VerificationType::Top)
        };
        let mut locals = vec![];
        for local in &frame.locals {
            let value = Value::unknown(convert(local));
            let wide = value.width() == 2;
            locals.push(value);
            if wide {
                locals.push(Value::top());
            }
        }
        FrameState {
            locals,
            stack: frame
                .stack
                .iter()
                .map(|typ| Value::unknown(convert(typ)))
                .collect(),
        }
    }

    /// Turn the state into a stack map frame
    ///
    /// Returns `None` if an uninitialized value has no label to refer to.
    pub fn to_model_frame(&self, uninitialized: impl Fn(usize) -> Option<Label>) -> Option<ModelFrame> {
        let convert = |value: &Value| -> Option<VerificationType<String, Label>> {
            value
                .ty
                .map::<_, _, ()>(|cls| Ok(cls.clone()), |pos| uninitialized(*pos).ok_or(()))
                .ok()
        };
        let mut locals = vec![];
        let mut slot = 0;
        while slot < self.locals.len() {
            let value = &self.locals[slot];
            locals.push(convert(value)?);
            slot += value.width();
        }
        while let Some(VerificationType::Top) = locals.last() {
            locals.pop();
        }
        Some(Frame {
            locals,
            stack: self.stack.iter().map(convert).collect::<Option<_>>()?,
        })
    }
}

/// Knobs for [`Dataflow::analyze`]
#[derive(Debug, Clone)]
pub struct DataflowOptions {
    /// The fixed-point gets `blocks × iteration_factor` block visits before giving up
    pub iteration_factor: usize,

    /// Check operand types against the hierarchy, `max_stack`, `max_locals`, and the method
    /// descriptor (otherwise only checks needed to keep going are done)
    pub checking: bool,
}

impl Default for DataflowOptions {
    fn default() -> Self {
        DataflowOptions {
            iteration_factor: 32,
            checking: false,
        }
    }
}

/// Result of running the forward dataflow analysis on a method
#[derive(Debug, Clone)]
pub struct Dataflow {
    pub cfg: ControlFlowGraph,

    /// State before each element (`None` when the element is unreachable)
    ///
    /// In checking mode, unreachable blocks starting with a declared frame get states too.
    states: Vec<Option<FrameState>>,

    /// Largest stack depth reached, in slots
    pub max_stack: usize,

    /// Number of local variable slots used
    pub max_locals: usize,
}

impl Dataflow {
    /// Run the analysis on a method of the class `class_name`
    ///
    /// Methods without code produce an empty result. Stack map frames declared in the code are
    /// the authoritative types at their labels; the analysis only merges constants into them.
    pub fn analyze(
        class_name: &str,
        method: &MethodModel,
        constants: &ConstantPool,
        hierarchy: &ClassHierarchy,
        options: &DataflowOptions,
    ) -> Result<Dataflow, AnalysisError> {
        let empty = Code::new();
        let code = method.code.as_ref().unwrap_or(&empty);
        let cfg = ControlFlowGraph::build(code)?;

        for element in &code.elements {
            if let Element::Branch(BranchInstruction::Jsr(_) | BranchInstruction::Ret(_)) = element
            {
                return Err(AnalysisError::Subroutine);
            }
        }

        let bad_descriptor = |_| AnalysisError::Type {
            element: 0,
            kind: VerifierErrorKind::BadDescriptor(method.descriptor.clone()),
        };
        let descriptor = method.parsed_descriptor().map_err(bad_descriptor)?;
        let entry_frame = method.entry_frame(class_name).map_err(bad_descriptor)?;
        let entry = FrameState::from_model_frame(&entry_frame, |_| None);

        let mut analysis = Analysis {
            class_name,
            method,
            descriptor,
            code,
            constants,
            hierarchy,
            options,
            cfg: &cfg,
            declared: HashMap::new(),
            block_states: vec![None; cfg.blocks.len()],
            states: vec![None; code.elements.len()],
            max_stack: 0,
            max_locals: entry.locals.len(),
        };

        if options.checking && entry.locals.len() > code.max_locals as usize {
            return Err(AnalysisError::Type {
                element: 0,
                kind: VerifierErrorKind::InvalidIndex,
            });
        }

        analysis.load_declared_frames();
        if let Some(entry_block) = cfg.entry() {
            analysis.block_states[entry_block] = Some(entry);
            analysis.run()?;
        }

        let Analysis {
            states,
            max_stack,
            max_locals,
            ..
        } = analysis;
        Ok(Dataflow {
            cfg,
            states,
            max_stack,
            max_locals,
        })
    }

    pub fn state_before(&self, element: usize) -> Option<&FrameState> {
        self.states.get(element).and_then(Option::as_ref)
    }

    pub fn is_reachable(&self, element: usize) -> bool {
        self.state_before(element).is_some()
    }
}

/// Either an ill-typed step or a constant that doesn't resolve
enum StepError {
    Kind(VerifierErrorKind),
    Constant(ClassFormatError),
}

impl From<VerifierErrorKind> for StepError {
    fn from(kind: VerifierErrorKind) -> Self {
        StepError::Kind(kind)
    }
}

impl From<ClassFormatError> for StepError {
    fn from(err: ClassFormatError) -> Self {
        StepError::Constant(err)
    }
}

type StepResult<T = ()> = Result<T, StepError>;

struct Analysis<'a> {
    class_name: &'a str,
    method: &'a MethodModel,
    descriptor: MethodDescriptor,
    code: &'a Code,
    constants: &'a ConstantPool,
    hierarchy: &'a ClassHierarchy,
    options: &'a DataflowOptions,
    cfg: &'a ControlFlowGraph,

    /// Declared frames at block starts
    declared: HashMap<usize, FrameState>,
    block_states: Vec<Option<FrameState>>,
    states: Vec<Option<FrameState>>,
    max_stack: usize,
    max_locals: usize,
}

impl<'a> Analysis<'a> {
    fn load_declared_frames(&mut self) {
        let cfg = self.cfg;
        let code = self.code;
        let uninitialized = |label: &Label| -> Option<usize> {
            let position = cfg.label_position(label)?;
            (position..code.elements.len()).find(|idx| code.elements[*idx].is_instruction())
        };
        for (label, frame) in &code.frames {
            let position = match cfg.label_position(label) {
                Some(position) => position,
                None => continue,
            };
            if let Some(block) = cfg.block_of_label(label) {
                let starts_block = cfg.blocks[block].elements.start <= position
                    && position <= cfg.blocks[block].first_instruction;
                if starts_block {
                    self.declared
                        .insert(block, FrameState::from_model_frame(frame, uninitialized));
                }
            }
        }
    }

    fn run(&mut self) -> Result<(), AnalysisError> {
        let budget = self.cfg.blocks.len().max(1) * self.options.iteration_factor.max(1);
        let mut steps = 0;
        let mut worklist: BTreeSet<usize> = BTreeSet::new();
        worklist.extend(self.cfg.entry());

        loop {
            while let Some(block) = worklist.pop_first() {
                steps += 1;
                if steps > budget {
                    return Err(AnalysisError::NonConvergence(budget));
                }

                let mut state = match &self.block_states[block] {
                    Some(state) => state.clone(),
                    None => continue,
                };
                let handlers: Vec<usize> = self
                    .cfg
                    .successors(block)
                    .filter(|edge| edge.kind == EdgeKind::Exception)
                    .map(|edge| edge.to)
                    .collect();

                let range = self.cfg.blocks[block].elements.clone();
                for idx in range {
                    self.states[idx] = Some(state.clone());
                    let element = &self.code.elements[idx];
                    if !element.is_instruction() {
                        continue;
                    }
                    for handler in &handlers {
                        self.propagate_exception(*handler, &state, idx, &mut worklist)?;
                    }
                    let step = match element {
                        Element::Insn(insn) => self.execute(&mut state, insn, idx),
                        Element::Branch(branch) => self.execute_branch(&mut state, branch),
                        Element::Label(_) => Ok(()),
                    };
                    step.map_err(|err| match err {
                        StepError::Kind(kind) => AnalysisError::Type { element: idx, kind },
                        StepError::Constant(err) => AnalysisError::BadConstant(err),
                    })?;
                    self.track_maximums(&state, idx)?;
                    for handler in &handlers {
                        self.propagate_exception(*handler, &state, idx, &mut worklist)?;
                    }
                }

                let last = self.cfg.blocks[block].last_instruction;
                if self.options.checking && self.cfg.falls_off_end.contains(&block) {
                    return Err(AnalysisError::Type {
                        element: last,
                        kind: VerifierErrorKind::FallsOffEnd,
                    });
                }
                let targets: Vec<usize> = self
                    .cfg
                    .successors(block)
                    .filter(|edge| edge.kind != EdgeKind::Exception)
                    .map(|edge| edge.to)
                    .collect();
                for target in targets {
                    self.propagate(target, &state, last, &mut worklist)?;
                }
            }

            // Unreachable code is still type-checked, starting from its declared frame
            if !self.options.checking {
                return Ok(());
            }
            let unvisited = self
                .declared
                .keys()
                .copied()
                .filter(|block| self.block_states[*block].is_none())
                .min();
            match unvisited {
                Some(block) => {
                    self.block_states[block] = self.declared.get(&block).cloned();
                    worklist.insert(block);
                }
                None => return Ok(()),
            }
        }
    }

    fn track_maximums(&mut self, state: &FrameState, element: usize) -> Result<(), AnalysisError> {
        let depth = state.stack_depth();
        self.max_stack = self.max_stack.max(depth);
        self.max_locals = self.max_locals.max(state.locals.len());
        if self.options.checking {
            let code = self.code;
            if depth > code.max_stack as usize {
                return Err(AnalysisError::Type {
                    element,
                    kind: VerifierErrorKind::StackOverflow(depth),
                });
            }
            if state.locals.len() > code.max_locals as usize {
                return Err(AnalysisError::Type {
                    element,
                    kind: VerifierErrorKind::InvalidIndex,
                });
            }
        }
        Ok(())
    }

    fn propagate_exception(
        &mut self,
        handler_block: usize,
        state: &FrameState,
        element: usize,
        worklist: &mut BTreeSet<usize>,
    ) -> Result<(), AnalysisError> {
        // Several handlers may share a block, so the caught type is their common superclass
        let mut catch_type: Option<String> = None;
        for handler in &self.code.handlers {
            if self.cfg.block_of_label(&handler.handler) != Some(handler_block) {
                continue;
            }
            let caught = handler
                .catch_type
                .as_deref()
                .unwrap_or("java/lang/Throwable");
            catch_type = Some(match catch_type {
                None => caught.to_owned(),
                Some(previous) => self.hierarchy.common_super_class(&previous, caught),
            });
        }
        let catch_type = catch_type.unwrap_or_else(|| String::from("java/lang/Throwable"));
        let handler_state = FrameState {
            locals: state.locals.clone(),
            stack: vec![Value::unknown(VerificationType::Object(catch_type))],
        };
        self.max_stack = self.max_stack.max(1);
        self.propagate(handler_block, &handler_state, element, worklist)
    }

    /// Merge a state into the entry of a block, re-queueing the block if anything changed
    fn propagate(
        &mut self,
        block: usize,
        incoming: &FrameState,
        element: usize,
        worklist: &mut BTreeSet<usize>,
    ) -> Result<(), AnalysisError> {
        let mismatch = |kind| AnalysisError::Type { element, kind };

        let merged = if let Some(declared) = self.declared.get(&block) {
            if self.options.checking && !self.frame_assignable(incoming, declared) {
                return Err(mismatch(VerifierErrorKind::FrameMismatch));
            }
            let previous = self.block_states[block].as_ref();
            merge_declared(declared, incoming, previous)
        } else {
            match &self.block_states[block] {
                None => incoming.clone(),
                Some(existing) => {
                    if existing.stack.len() != incoming.stack.len() {
                        return Err(mismatch(VerifierErrorKind::StackHeightMismatch));
                    }
                    let mut stack = vec![];
                    for (left, right) in existing.stack.iter().zip(&incoming.stack) {
                        let value = self.merge_values(left, right);
                        if value.ty == VerificationType::Top {
                            return Err(mismatch(VerifierErrorKind::FrameMismatch));
                        }
                        stack.push(value);
                    }
                    let len = existing.locals.len().max(incoming.locals.len());
                    let top = Value::top();
                    let mut locals: Vec<Value> = (0..len)
                        .map(|slot| {
                            let left = existing.locals.get(slot).unwrap_or(&top);
                            let right = incoming.locals.get(slot).unwrap_or(&top);
                            self.merge_values(left, right)
                        })
                        .collect();
                    normalize_locals(&mut locals);
                    FrameState { locals, stack }
                }
            }
        };

        if self.block_states[block].as_ref() != Some(&merged) {
            self.block_states[block] = Some(merged);
            worklist.insert(block);
        }
        Ok(())
    }

    fn merge_values(&self, left: &Value, right: &Value) -> Value {
        let ty = self.least_upper_bound(&left.ty, &right.ty);
        let constant = if ty != VerificationType::Top && left.constant == right.constant {
            left.constant.clone()
        } else {
            None
        };
        Value { ty, constant }
    }

    fn least_upper_bound(&self, left: &AnalysisType, right: &AnalysisType) -> AnalysisType {
        use VerificationType::*;
        match (left, right) {
            (a, b) if a == b => a.clone(),
            (Null, Object(cls)) | (Object(cls), Null) => Object(cls.clone()),
            (Object(cls1), Object(cls2)) => Object(self.hierarchy.common_super_class(cls1, cls2)),
            _ => Top,
        }
    }

    fn is_assignable(&self, from: &AnalysisType, to: &AnalysisType) -> bool {
        use VerificationType::*;
        match (from, to) {
            (_, Top) => true,
            (a, b) if a == b => true,
            (Null, Object(_)) => true,
            (Object(sub), Object(sup)) => {
                !self.options.checking || self.hierarchy.is_assignable(sub, sup)
            }
            _ => false,
        }
    }

    fn frame_assignable(&self, incoming: &FrameState, declared: &FrameState) -> bool {
        if incoming.stack.len() != declared.stack.len() {
            return false;
        }
        let stack_ok = incoming
            .stack
            .iter()
            .zip(&declared.stack)
            .all(|(from, to)| self.is_assignable(&from.ty, &to.ty));
        let locals_ok = declared.locals.iter().enumerate().all(|(slot, to)| {
            match incoming.locals.get(slot) {
                Some(from) => self.is_assignable(&from.ty, &to.ty),
                None => to.ty == VerificationType::Top,
            }
        });
        stack_ok && locals_ok
    }

    fn pop_assignable(&self, stack: &mut Vec<Value>, expected: &AnalysisType) -> StepResult<Value> {
        let value = pop(stack)?;
        if self.is_assignable(&value.ty, expected) {
            Ok(value)
        } else {
            Err(VerifierErrorKind::InvalidType.into())
        }
    }

    fn pop_array(&self, stack: &mut Vec<Value>, expected: &[&str]) -> StepResult<AnalysisType> {
        let array = pop(stack)?;
        match &array.ty {
            VerificationType::Null => Ok(array.ty),
            VerificationType::Object(name)
                if expected.contains(&name.as_str()) || (expected.is_empty() && name.starts_with('[')) =>
            {
                Ok(array.ty)
            }
            VerificationType::Object(_) if !self.options.checking => Ok(array.ty),
            _ => Err(VerifierErrorKind::InvalidType.into()),
        }
    }

    fn execute(&self, state: &mut FrameState, insn: &Instruction, element: usize) -> StepResult {
        use Instruction::*;
        use VerificationType::{Double, Float, Integer, Long, Null, Object, Uninitialized};

        let FrameState { stack, locals } = state;
        match insn {
            Nop => (),
            AConstNull => stack.push(Value::known(Null, ConstValue::Null)),
            IConstM1 => stack.push(Value::int(-1)),
            IConst0 => stack.push(Value::int(0)),
            IConst1 => stack.push(Value::int(1)),
            IConst2 => stack.push(Value::int(2)),
            IConst3 => stack.push(Value::int(3)),
            IConst4 => stack.push(Value::int(4)),
            IConst5 => stack.push(Value::int(5)),
            LConst0 => stack.push(Value::long(0)),
            LConst1 => stack.push(Value::long(1)),
            FConst0 => stack.push(Value::known(Float, ConstValue::Float(0f32.to_bits()))),
            FConst1 => stack.push(Value::known(Float, ConstValue::Float(1f32.to_bits()))),
            FConst2 => stack.push(Value::known(Float, ConstValue::Float(2f32.to_bits()))),
            DConst0 => stack.push(Value::known(Double, ConstValue::Double(0f64.to_bits()))),
            DConst1 => stack.push(Value::known(Double, ConstValue::Double(1f64.to_bits()))),
            BiPush(b) => stack.push(Value::int(*b as i32)),
            SiPush(s) => stack.push(Value::int(*s as i32)),
            Ldc(index) => {
                let value = self.loadable(*index)?;
                if value.width() != 1 {
                    return Err(VerifierErrorKind::InvalidWidth(2).into());
                }
                stack.push(value);
            }
            Ldc2(index) => {
                let value = self.loadable(*index)?;
                if value.width() != 2 {
                    return Err(VerifierErrorKind::InvalidWidth(1).into());
                }
                stack.push(value);
            }

            ILoad(idx) => load_local(locals, stack, *idx, Some(Integer))?,
            LLoad(idx) => load_local(locals, stack, *idx, Some(Long))?,
            FLoad(idx) => load_local(locals, stack, *idx, Some(Float))?,
            DLoad(idx) => load_local(locals, stack, *idx, Some(Double))?,
            ALoad(idx) => load_local(locals, stack, *idx, None)?,

            IALoad | BALoad | CALoad | SALoad => {
                pop_expecting(stack, &Integer)?;
                let expected: &[&str] = match insn {
                    IALoad => &["[I"],
                    BALoad => &["[B", "[Z"],
                    CALoad => &["[C"],
                    _ => &["[S"],
                };
                self.pop_array(stack, expected)?;
                stack.push(Value::unknown(Integer));
            }
            LALoad => {
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &["[J"])?;
                stack.push(Value::unknown(Long));
            }
            FALoad => {
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &["[F"])?;
                stack.push(Value::unknown(Float));
            }
            DALoad => {
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &["[D"])?;
                stack.push(Value::unknown(Double));
            }
            AALoad => {
                pop_expecting(stack, &Integer)?;
                let array = self.pop_array(stack, &[])?;
                let element_type = match &array {
                    Null => Null,
                    Object(name) => match RefType::from_class_constant_name(name)
                        .ok()
                        .and_then(|array| array.element_type())
                    {
                        Some(FieldType::Ref(element)) => Object(element.class_constant_name()),
                        Some(FieldType::Base(_)) => {
                            return Err(VerifierErrorKind::InvalidType.into())
                        }
                        None => Object(String::from("java/lang/Object")),
                    },
                    _ => return Err(VerifierErrorKind::InvalidType.into()),
                };
                stack.push(Value::unknown(element_type));
            }

            IStore(idx) => {
                let value = pop_expecting(stack, &Integer)?;
                store_local(locals, *idx, value);
            }
            LStore(idx) => {
                let value = pop_expecting(stack, &Long)?;
                store_local(locals, *idx, value);
            }
            FStore(idx) => {
                let value = pop_expecting(stack, &Float)?;
                store_local(locals, *idx, value);
            }
            DStore(idx) => {
                let value = pop_expecting(stack, &Double)?;
                store_local(locals, *idx, value);
            }
            AStore(idx) => {
                let value = pop(stack)?;
                if !value.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
                store_local(locals, *idx, value);
            }

            IAStore | BAStore | CAStore | SAStore => {
                pop_expecting(stack, &Integer)?;
                pop_expecting(stack, &Integer)?;
                let expected: &[&str] = match insn {
                    IAStore => &["[I"],
                    BAStore => &["[B", "[Z"],
                    CAStore => &["[C"],
                    _ => &["[S"],
                };
                self.pop_array(stack, expected)?;
            }
            LAStore => {
                pop_expecting(stack, &Long)?;
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &["[J"])?;
            }
            FAStore => {
                pop_expecting(stack, &Float)?;
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &["[F"])?;
            }
            DAStore => {
                pop_expecting(stack, &Double)?;
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &["[D"])?;
            }
            AAStore => {
                let value = pop(stack)?;
                if !value.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
                pop_expecting(stack, &Integer)?;
                self.pop_array(stack, &[])?;
            }

            Pop => {
                pop_width(stack, 1)?;
            }
            Pop2 => {
                let arg1 = pop(stack)?;
                if arg1.width() == 1 {
                    pop_width(stack, 1)?;
                }
            }
            Dup => {
                let arg1 = pop_width(stack, 1)?;
                stack.push(arg1.clone());
                stack.push(arg1);
            }
            DupX1 => {
                let arg1 = pop_width(stack, 1)?;
                let arg2 = pop_width(stack, 1)?;
                stack.extend([arg1.clone(), arg2, arg1]);
            }
            DupX2 => {
                let arg1 = pop_width(stack, 1)?;
                let arg2 = pop(stack)?;
                if arg2.width() == 1 {
                    let arg3 = pop_width(stack, 1)?;
                    stack.extend([arg1.clone(), arg3, arg2, arg1]);
                } else {
                    stack.extend([arg1.clone(), arg2, arg1]);
                }
            }
            Dup2 => {
                let arg1 = pop(stack)?;
                if arg1.width() == 1 {
                    let arg2 = pop_width(stack, 1)?;
                    stack.extend([arg2.clone(), arg1.clone(), arg2, arg1]);
                } else {
                    stack.extend([arg1.clone(), arg1]);
                }
            }
            Dup2X1 => {
                let arg1 = pop(stack)?;
                if arg1.width() == 1 {
                    let arg2 = pop_width(stack, 1)?;
                    let arg3 = pop_width(stack, 1)?;
                    stack.extend([arg2.clone(), arg1.clone(), arg3, arg2, arg1]);
                } else {
                    let arg2 = pop_width(stack, 1)?;
                    stack.extend([arg1.clone(), arg2, arg1]);
                }
            }
            Dup2X2 => {
                let arg1 = pop(stack)?;
                if arg1.width() == 1 {
                    let arg2 = pop_width(stack, 1)?;
                    let arg3 = pop(stack)?;
                    if arg3.width() == 1 {
                        let arg4 = pop_width(stack, 1)?;
                        stack.extend([arg2.clone(), arg1.clone(), arg4, arg3, arg2, arg1]);
                    } else {
                        stack.extend([arg2.clone(), arg1.clone(), arg3, arg2, arg1]);
                    }
                } else {
                    let arg2 = pop(stack)?;
                    if arg2.width() == 1 {
                        let arg3 = pop_width(stack, 1)?;
                        stack.extend([arg1.clone(), arg3, arg2, arg1]);
                    } else {
                        stack.extend([arg1.clone(), arg2, arg1]);
                    }
                }
            }
            Swap => {
                let arg1 = pop_width(stack, 1)?;
                let arg2 = pop_width(stack, 1)?;
                stack.extend([arg1, arg2]);
            }

            IAdd => int_binop(stack, |a, b| Some(a.wrapping_add(b)))?,
            ISub => int_binop(stack, |a, b| Some(a.wrapping_sub(b)))?,
            IMul => int_binop(stack, |a, b| Some(a.wrapping_mul(b)))?,
            IDiv => int_binop(stack, |a, b| if b == 0 { None } else { Some(a.wrapping_div(b)) })?,
            IRem => int_binop(stack, |a, b| if b == 0 { None } else { Some(a.wrapping_rem(b)) })?,
            IAnd => int_binop(stack, |a, b| Some(a & b))?,
            IOr => int_binop(stack, |a, b| Some(a | b))?,
            IXor => int_binop(stack, |a, b| Some(a ^ b))?,
            ISh(shift) => {
                let shift = *shift;
                int_binop(stack, move |a, b| Some(shift_int(shift, a, b)))?
            }
            LAdd => long_binop(stack, |a, b| Some(a.wrapping_add(b)))?,
            LSub => long_binop(stack, |a, b| Some(a.wrapping_sub(b)))?,
            LMul => long_binop(stack, |a, b| Some(a.wrapping_mul(b)))?,
            LDiv => long_binop(stack, |a, b| if b == 0 { None } else { Some(a.wrapping_div(b)) })?,
            LRem => long_binop(stack, |a, b| if b == 0 { None } else { Some(a.wrapping_rem(b)) })?,
            LAnd => long_binop(stack, |a, b| Some(a & b))?,
            LOr => long_binop(stack, |a, b| Some(a | b))?,
            LXor => long_binop(stack, |a, b| Some(a ^ b))?,
            LSh(shift) => {
                let amount = pop_expecting(stack, &Integer)?;
                let value = pop_expecting(stack, &Long)?;
                let constant = match (value.long_constant(), amount.int_constant()) {
                    (Some(a), Some(b)) => Some(ConstValue::Long(shift_long(*shift, a, b))),
                    _ => None,
                };
                stack.push(Value { ty: Long, constant });
            }
            FAdd | FSub | FMul | FDiv | FRem => {
                pop_expecting(stack, &Float)?;
                pop_expecting(stack, &Float)?;
                stack.push(Value::unknown(Float));
            }
            DAdd | DSub | DMul | DDiv | DRem => {
                pop_expecting(stack, &Double)?;
                pop_expecting(stack, &Double)?;
                stack.push(Value::unknown(Double));
            }
            INeg => int_unop(stack, |a| Value::int(a.wrapping_neg()), Integer)?,
            I2B => int_unop(stack, |a| Value::int(a as i8 as i32), Integer)?,
            I2C => int_unop(stack, |a| Value::int(a as u16 as i32), Integer)?,
            I2S => int_unop(stack, |a| Value::int(a as i16 as i32), Integer)?,
            I2L => int_unop(stack, |a| Value::long(a as i64), Long)?,
            I2F => int_unop(
                stack,
                |a| Value::known(Float, ConstValue::Float((a as f32).to_bits())),
                Float,
            )?,
            I2D => int_unop(
                stack,
                |a| Value::known(Double, ConstValue::Double((a as f64).to_bits())),
                Double,
            )?,
            LNeg => {
                let value = pop_expecting(stack, &Long)?;
                stack.push(match value.long_constant() {
                    Some(l) => Value::long(l.wrapping_neg()),
                    None => Value::unknown(Long),
                });
            }
            L2I => {
                let value = pop_expecting(stack, &Long)?;
                stack.push(match value.long_constant() {
                    Some(l) => Value::int(l as i32),
                    None => Value::unknown(Integer),
                });
            }
            L2F => convert(stack, &Long, Float)?,
            L2D => convert(stack, &Long, Double)?,
            FNeg => convert(stack, &Float, Float)?,
            F2I => convert(stack, &Float, Integer)?,
            F2L => convert(stack, &Float, Long)?,
            F2D => convert(stack, &Float, Double)?,
            DNeg => convert(stack, &Double, Double)?,
            D2I => convert(stack, &Double, Integer)?,
            D2L => convert(stack, &Double, Long)?,
            D2F => convert(stack, &Double, Float)?,
            IInc(idx, diff) => {
                let local = locals
                    .get_mut(*idx as usize)
                    .ok_or(VerifierErrorKind::InvalidIndex)?;
                if local.ty != Integer {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
                if let Some(value) = local.int_constant() {
                    local.constant = Some(ConstValue::Int(value.wrapping_add(*diff as i32)));
                }
            }
            LCmp => {
                let b = pop_expecting(stack, &Long)?;
                let a = pop_expecting(stack, &Long)?;
                stack.push(match (a.long_constant(), b.long_constant()) {
                    (Some(a), Some(b)) => Value::int(a.cmp(&b) as i32),
                    _ => Value::unknown(Integer),
                });
            }
            FCmp(_) => {
                pop_expecting(stack, &Float)?;
                pop_expecting(stack, &Float)?;
                stack.push(Value::unknown(Integer));
            }
            DCmp(_) => {
                pop_expecting(stack, &Double)?;
                pop_expecting(stack, &Double)?;
                stack.push(Value::unknown(Integer));
            }

            GetStatic(index) => {
                let field = self.constants.member_ref(*index)?;
                stack.push(Value::unknown(field_verification_type(field.descriptor)?));
            }
            PutStatic(index) => {
                let field = self.constants.member_ref(*index)?;
                self.pop_assignable(stack, &field_verification_type(field.descriptor)?)?;
            }
            GetField(index) => {
                let field = self.constants.member_ref(*index)?;
                self.pop_assignable(stack, &Object(field.owner.to_owned()))?;
                stack.push(Value::unknown(field_verification_type(field.descriptor)?));
            }
            PutField(index) => {
                let field = self.constants.member_ref(*index)?;
                self.pop_assignable(stack, &field_verification_type(field.descriptor)?)?;
                let receiver = pop(stack)?;
                let in_constructor = receiver.ty == VerificationType::UninitializedThis
                    && self.method.name == "<init>";
                if !in_constructor
                    && !self.is_assignable(&receiver.ty, &Object(field.owner.to_owned()))
                {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
            }

            Invoke(invoke_type, index) => {
                let method = self.constants.member_ref(*index)?;
                let descriptor = MethodDescriptor::parse(method.descriptor)
                    .map_err(|_| VerifierErrorKind::BadDescriptor(method.descriptor.to_owned()))?;
                for parameter in descriptor.parameters.iter().rev() {
                    let expected = AnalysisType::from(parameter);
                    self.pop_assignable(stack, &expected)?;
                }

                if *invoke_type == InvokeType::Special && method.name == "<init>" {
                    let receiver = pop(stack)?;
                    let initialized = match &receiver.ty {
                        VerificationType::UninitializedThis => {
                            Object(self.class_name.to_owned())
                        }
                        Uninitialized(position) => match self.code.elements.get(*position) {
                            Some(Element::Insn(New(class))) => {
                                Object(self.constants.class_name(*class)?.to_owned())
                            }
                            _ => return Err(VerifierErrorKind::InvalidType.into()),
                        },
                        _ => return Err(VerifierErrorKind::InvalidType.into()),
                    };
                    let initialized = Value::unknown(initialized);
                    for value in stack.iter_mut().chain(locals.iter_mut()) {
                        if value.ty == receiver.ty {
                            *value = initialized.clone();
                        }
                    }
                    if descriptor.return_type.is_some() {
                        return Err(VerifierErrorKind::InvalidType.into());
                    }
                } else {
                    if *invoke_type != InvokeType::Static {
                        let receiver = pop(stack)?;
                        let owner = if method.owner.starts_with('[') {
                            String::from("java/lang/Object")
                        } else {
                            method.owner.to_owned()
                        };
                        if !receiver.ty.is_reference()
                            || !self.is_assignable(&receiver.ty, &Object(owner))
                        {
                            return Err(VerifierErrorKind::InvalidType.into());
                        }
                    }
                    if let Some(return_type) = &descriptor.return_type {
                        stack.push(Value::unknown(AnalysisType::from(return_type)));
                    }
                }
            }
            InvokeDynamic(index) => {
                let (_, _, descriptor) = self.constants.invoke_dynamic(*index)?;
                let descriptor = MethodDescriptor::parse(descriptor)
                    .map_err(|_| VerifierErrorKind::BadDescriptor(descriptor.to_owned()))?;
                for parameter in descriptor.parameters.iter().rev() {
                    self.pop_assignable(stack, &AnalysisType::from(parameter))?;
                }
                if let Some(return_type) = &descriptor.return_type {
                    stack.push(Value::unknown(AnalysisType::from(return_type)));
                }
            }

            New(class) => {
                self.constants.class_name(*class)?;
                stack.push(Value::unknown(Uninitialized(element)));
            }
            NewArray(base_type) => {
                pop_expecting(stack, &Integer)?;
                let array = RefType::array(FieldType::Base(*base_type));
                stack.push(Value::unknown(Object(array.class_constant_name())));
            }
            ANewArray(class) => {
                pop_expecting(stack, &Integer)?;
                let element_type = RefType::from_class_constant_name(self.constants.class_name(*class)?)
                    .map_err(|_| VerifierErrorKind::InvalidType)?;
                let array = RefType::array(FieldType::Ref(element_type));
                stack.push(Value::unknown(Object(array.class_constant_name())));
            }
            MultiANewArray(class, dimensions) => {
                for _ in 0..*dimensions {
                    pop_expecting(stack, &Integer)?;
                }
                stack.push(Value::unknown(Object(self.constants.class_name(*class)?.to_owned())));
            }
            ArrayLength => {
                self.pop_array(stack, &[])?;
                stack.push(Value::unknown(Integer));
            }
            CheckCast(class) => {
                let value = pop(stack)?;
                if !value.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
                let class = self.constants.class_name(*class)?.to_owned();
                let constant = match &value.constant {
                    Some(ConstValue::String(s)) if class == "java/lang/String" => {
                        Some(ConstValue::String(s.clone()))
                    }
                    _ => None,
                };
                stack.push(Value {
                    ty: Object(class),
                    constant,
                });
            }
            InstanceOf(class) => {
                self.constants.class_name(*class)?;
                let value = pop(stack)?;
                if !value.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
                stack.push(Value::unknown(Integer));
            }
            MonitorEnter | MonitorExit => {
                let value = pop(stack)?;
                if !value.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
            }
        }
        Ok(())
    }

    fn execute_branch(&self, state: &mut FrameState, branch: &BranchInstruction) -> StepResult {
        use BranchInstruction::*;
        use VerificationType::{Double, Float, Integer, Long};

        let stack = &mut state.stack;
        let return_type = self.descriptor.return_type.as_ref().map(AnalysisType::from);
        let check_return = |found: &AnalysisType| -> StepResult {
            match &return_type {
                Some(expected) if self.is_assignable(found, expected) => Ok(()),
                _ if !self.options.checking => Ok(()),
                _ => Err(VerifierErrorKind::BadReturn.into()),
            }
        };

        match branch {
            If(_, _) => {
                pop_expecting(stack, &Integer)?;
            }
            IfICmp(_, _) => {
                pop_expecting(stack, &Integer)?;
                pop_expecting(stack, &Integer)?;
            }
            IfACmp(_, _) => {
                let a = pop(stack)?;
                let b = pop(stack)?;
                if !a.ty.is_reference() || !b.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
            }
            IfNull(_, _) => {
                if !pop(stack)?.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
            }
            Goto(_) => (),
            Jsr(_) | Ret(_) => return Err(VerifierErrorKind::InvalidType.into()),
            TableSwitch { .. } | LookupSwitch { .. } => {
                pop_expecting(stack, &Integer)?;
            }
            IReturn => check_return(&pop_expecting(stack, &Integer)?.ty)?,
            LReturn => check_return(&pop_expecting(stack, &Long)?.ty)?,
            FReturn => check_return(&pop_expecting(stack, &Float)?.ty)?,
            DReturn => check_return(&pop_expecting(stack, &Double)?.ty)?,
            AReturn => {
                let value = pop(stack)?;
                if !value.ty.is_reference() {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
                check_return(&value.ty)?;
            }
            Return => {
                let uninitialized_this = self.method.name == "<init>"
                    && state
                        .locals
                        .iter()
                        .any(|local| local.ty == VerificationType::UninitializedThis);
                if self.options.checking && (return_type.is_some() || uninitialized_this) {
                    return Err(VerifierErrorKind::BadReturn.into());
                }
            }
            AThrow => {
                let thrown = pop(stack)?;
                let throwable = VerificationType::Object(String::from("java/lang/Throwable"));
                if !thrown.ty.is_reference() || !self.is_assignable(&thrown.ty, &throwable) {
                    return Err(VerifierErrorKind::InvalidType.into());
                }
            }
        }
        Ok(())
    }

    fn loadable(&self, index: ConstantIndex) -> StepResult<Value> {
        use VerificationType::{Double, Float, Object};
        Ok(match self.constants.loadable(index)? {
            LoadableConstant::Integer(i) => Value::int(i),
            LoadableConstant::Float(f) => Value::known(Float, ConstValue::Float(f.to_bits())),
            LoadableConstant::Long(l) => Value::long(l),
            LoadableConstant::Double(d) => Value::known(Double, ConstValue::Double(d.to_bits())),
            LoadableConstant::String(s) => Value::known(
                Object(String::from("java/lang/String")),
                ConstValue::String(s.to_owned()),
            ),
            LoadableConstant::Class(name) => Value::known(
                Object(String::from("java/lang/Class")),
                ConstValue::Class(name.to_owned()),
            ),
            LoadableConstant::MethodType(_) => {
                Value::unknown(Object(String::from("java/lang/invoke/MethodType")))
            }
            LoadableConstant::MethodHandle => {
                Value::unknown(Object(String::from("java/lang/invoke/MethodHandle")))
            }
            LoadableConstant::Dynamic(descriptor) => {
                Value::unknown(field_verification_type(descriptor)?)
            }
        })
    }
}

/// Types come from the declared frame, constants from whatever flows in
fn merge_declared(
    declared: &FrameState,
    incoming: &FrameState,
    previous: Option<&FrameState>,
) -> FrameState {
    let merge = |slot: &Value, incoming: Option<&Value>, previous: Option<&Value>| -> Value {
        let incoming_constant = incoming
            .filter(|value| value.ty == slot.ty)
            .and_then(|value| value.constant.clone());
        let constant = match previous {
            None => incoming_constant,
            Some(previous) if previous.constant == incoming_constant => incoming_constant,
            Some(_) => None,
        };
        Value {
            ty: slot.ty.clone(),
            constant,
        }
    };
    FrameState {
        locals: declared
            .locals
            .iter()
            .enumerate()
            .map(|(slot, value)| {
                merge(
                    value,
                    incoming.locals.get(slot),
                    previous.and_then(|p| p.locals.get(slot)),
                )
            })
            .collect(),
        stack: declared
            .stack
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                merge(
                    value,
                    incoming.stack.get(idx),
                    previous.and_then(|p| p.stack.get(idx)),
                )
            })
            .collect(),
    }
}

/// Wide values need their second slot, and trailing `Top` slots carry no information
fn normalize_locals(locals: &mut Vec<Value>) {
    for slot in 0..locals.len() {
        if locals[slot].width() == 2
            && locals.get(slot + 1).map_or(false, |next| next.ty != VerificationType::Top)
        {
            locals[slot] = Value::top();
        }
    }
    while let Some(Value {
        ty: VerificationType::Top,
        ..
    }) = locals.last()
    {
        locals.pop();
    }
}

fn load_local(
    locals: &[Value],
    stack: &mut Vec<Value>,
    index: u16,
    expected: Option<AnalysisType>,
) -> Result<(), VerifierErrorKind> {
    let value = locals
        .get(index as usize)
        .cloned()
        .ok_or(VerifierErrorKind::InvalidIndex)?;
    match expected {
        Some(expected) if value.ty != expected => Err(VerifierErrorKind::InvalidType),
        None if !value.ty.is_reference() => Err(VerifierErrorKind::InvalidType),
        _ => {
            stack.push(value);
            Ok(())
        }
    }
}

fn store_local(locals: &mut Vec<Value>, index: u16, value: Value) {
    let index = index as usize;
    let width = value.width();
    if locals.len() < index + width {
        locals.resize(index + width, Value::top());
    }
    if index > 0 && locals[index - 1].width() == 2 {
        locals[index - 1] = Value::top();
    }
    locals[index] = value;
    if width == 2 {
        locals[index + 1] = Value::top();
    }
}

fn field_verification_type(descriptor: &str) -> Result<AnalysisType, VerifierErrorKind> {
    FieldType::parse(descriptor)
        .map(|field_type| AnalysisType::from(&field_type))
        .map_err(|_| VerifierErrorKind::BadDescriptor(descriptor.to_owned()))
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, VerifierErrorKind> {
    stack.pop().ok_or(VerifierErrorKind::EmptyStack)
}

fn pop_width(stack: &mut Vec<Value>, expected_width: usize) -> Result<Value, VerifierErrorKind> {
    let value = pop(stack)?;
    let found_width = value.width();
    if found_width == expected_width {
        Ok(value)
    } else {
        Err(VerifierErrorKind::InvalidWidth(found_width))
    }
}

fn pop_expecting(stack: &mut Vec<Value>, expected: &AnalysisType) -> Result<Value, VerifierErrorKind> {
    let value = pop(stack)?;
    if value.ty == *expected {
        Ok(value)
    } else {
        Err(VerifierErrorKind::InvalidType)
    }
}

fn int_binop(stack: &mut Vec<Value>, op: impl Fn(i32, i32) -> Option<i32>) -> StepResult {
    let b = pop_expecting(stack, &VerificationType::Integer)?;
    let a = pop_expecting(stack, &VerificationType::Integer)?;
    let constant = match (a.int_constant(), b.int_constant()) {
        (Some(a), Some(b)) => op(a, b).map(ConstValue::Int),
        _ => None,
    };
    stack.push(Value {
        ty: VerificationType::Integer,
        constant,
    });
    Ok(())
}

fn long_binop(stack: &mut Vec<Value>, op: impl Fn(i64, i64) -> Option<i64>) -> StepResult {
    let b = pop_expecting(stack, &VerificationType::Long)?;
    let a = pop_expecting(stack, &VerificationType::Long)?;
    let constant = match (a.long_constant(), b.long_constant()) {
        (Some(a), Some(b)) => op(a, b).map(ConstValue::Long),
        _ => None,
    };
    stack.push(Value {
        ty: VerificationType::Long,
        constant,
    });
    Ok(())
}

fn int_unop(stack: &mut Vec<Value>, op: impl Fn(i32) -> Value, result: AnalysisType) -> StepResult {
    let value = pop_expecting(stack, &VerificationType::Integer)?;
    stack.push(match value.int_constant() {
        Some(i) => op(i),
        None => Value::unknown(result),
    });
    Ok(())
}

fn convert(stack: &mut Vec<Value>, from: &AnalysisType, to: AnalysisType) -> StepResult {
    pop_expecting(stack, from)?;
    stack.push(Value::unknown(to));
    Ok(())
}

/// `ishl`, `ishr`, and `iushr` (only the low 5 bits of the amount count)
pub fn shift_int(shift: ShiftType, value: i32, amount: i32) -> i32 {
    let amount = (amount & 0x1f) as u32;
    match shift {
        ShiftType::Left => value.wrapping_shl(amount),
        ShiftType::ArithmeticRight => value.wrapping_shr(amount),
        ShiftType::LogicalRight => ((value as u32).wrapping_shr(amount)) as i32,
    }
}

/// `lshl`, `lshr`, and `lushr` (only the low 6 bits of the amount count)
pub fn shift_long(shift: ShiftType, value: i64, amount: i32) -> i64 {
    let amount = (amount & 0x3f) as u32;
    match shift {
        ShiftType::Left => value.wrapping_shl(amount),
        ShiftType::ArithmeticRight => value.wrapping_shr(amount),
        ShiftType::LogicalRight => ((value as u64).wrapping_shr(amount)) as i64,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{OrdComparison, Handler};
    use crate::jvm::MethodAccessFlags;

    fn static_method(descriptor: &str, max_stack: u16, max_locals: u16, elements: Vec<Element>) -> MethodModel {
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "m", descriptor);
        let mut code = Code::new();
        code.max_stack = max_stack;
        code.max_locals = max_locals;
        code.elements = elements;
        method.code = Some(code);
        method
    }

    fn checking() -> DataflowOptions {
        DataflowOptions {
            checking: true,
            ..DataflowOptions::default()
        }
    }

    #[test]
    fn constants_flow_through_locals_and_arithmetic() {
        let method = static_method(
            "()I",
            2,
            1,
            vec![
                Element::Insn(Instruction::BiPush(20)),
                Element::Insn(Instruction::IStore(0)),
                Element::Insn(Instruction::IInc(0, 1)),
                Element::Insn(Instruction::ILoad(0)),
                Element::Insn(Instruction::IConst2),
                Element::Insn(Instruction::IMul),
                Element::Branch(BranchInstruction::IReturn),
            ],
        );
        let flow = Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &checking(),
        )
        .unwrap();
        assert_eq!(flow.state_before(6).unwrap().stack, vec![Value::int(42)]);
        assert_eq!(flow.max_stack, 2);
        assert_eq!(flow.max_locals, 1);
    }

    #[test]
    fn merging_drops_disagreeing_constants() {
        let mut code = Code::new();
        let other = code.fresh_label();
        let join = code.fresh_label();
        let method = static_method(
            "(I)I",
            1,
            2,
            vec![
                Element::Insn(Instruction::ILoad(0)),
                Element::Branch(BranchInstruction::If(OrdComparison::EQ, other)),
                Element::Insn(Instruction::IConst1),
                Element::Insn(Instruction::IStore(1)),
                Element::Branch(BranchInstruction::Goto(join)),
                Element::Label(other),
                Element::Insn(Instruction::IConst2),
                Element::Insn(Instruction::IStore(1)),
                Element::Label(join),
                Element::Insn(Instruction::ILoad(1)),
                Element::Branch(BranchInstruction::IReturn),
            ],
        );
        let flow = Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &checking(),
        )
        .unwrap();
        let at_join = flow.state_before(9).unwrap();
        assert_eq!(at_join.locals[1], Value::unknown(VerificationType::Integer));
    }

    #[test]
    fn type_errors_and_overflow() {
        let method = static_method(
            "()I",
            1,
            0,
            vec![
                Element::Insn(Instruction::LConst0),
                Element::Branch(BranchInstruction::IReturn),
            ],
        );
        let err = Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &checking(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            AnalysisError::Type {
                element: 0,
                kind: VerifierErrorKind::StackOverflow(2)
            }
        );

        let method = static_method("()V", 1, 0, vec![Element::Insn(Instruction::IConst0)]);
        let err = Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &checking(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Type {
                kind: VerifierErrorKind::FallsOffEnd,
                ..
            }
        ));
    }

    #[test]
    fn loops_hit_the_iteration_bound() {
        let mut code = Code::new();
        let head = code.fresh_label();
        let method = static_method(
            "()V",
            1,
            1,
            vec![
                Element::Insn(Instruction::IConst0),
                Element::Insn(Instruction::IStore(0)),
                Element::Label(head),
                Element::Insn(Instruction::IInc(0, 1)),
                Element::Insn(Instruction::ILoad(0)),
                Element::Branch(BranchInstruction::If(OrdComparison::NE, head)),
                Element::Branch(BranchInstruction::Return),
            ],
        );
        let tight = DataflowOptions {
            iteration_factor: 1,
            checking: false,
        };
        let err = Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &tight,
        )
        .unwrap_err();
        assert!(err.is_unanalyzable());

        assert!(Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &DataflowOptions::default(),
        )
        .is_ok());
    }

    #[test]
    fn handlers_see_the_exception() {
        let mut code = Code::new();
        let start = code.fresh_label();
        let end = code.fresh_label();
        let handler = code.fresh_label();
        let mut method = static_method(
            "()V",
            1,
            0,
            vec![
                Element::Label(start),
                Element::Insn(Instruction::Nop),
                Element::Label(end),
                Element::Branch(BranchInstruction::Return),
                Element::Label(handler),
                Element::Branch(BranchInstruction::AThrow),
            ],
        );
        let body = method.code.as_mut().unwrap();
        body.handlers.push(Handler {
            start,
            end,
            handler,
            catch_type: Some(String::from("java/lang/Exception")),
        });
        let flow = Dataflow::analyze(
            "a/A",
            &method,
            &ConstantPool::new(),
            &ClassHierarchy::new(),
            &checking(),
        )
        .unwrap();
        assert_eq!(
            flow.state_before(5).unwrap().stack,
            vec![Value::unknown(VerificationType::Object(String::from(
                "java/lang/Exception"
            )))]
        );
    }

    #[test]
    fn model_frames_round_trip_wide_locals() {
        let state = FrameState {
            locals: vec![
                Value::long(1),
                Value::top(),
                Value::int(3),
                Value::top(),
            ],
            stack: vec![],
        };
        let frame = state.to_model_frame(|_| None).unwrap();
        assert_eq!(
            frame.locals,
            vec![VerificationType::Long, VerificationType::Integer]
        );
        let back = FrameState::from_model_frame(&frame, |_| None);
        assert_eq!(back.locals.len(), 3);
        assert_eq!(back.locals[1].ty, VerificationType::Top);
    }
}
