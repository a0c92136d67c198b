//! Sandboxed interpreter for small static helpers
//!
//! Only a closed set of behaviours is available inside the sandbox: arithmetic, arrays, strings
//! and string builders, static fields of classes in the class set, and static methods of classes
//! in the class set. Anything else (I/O, reflection, threads, unknown library calls) aborts the
//! interpretation. Every executed instruction counts against a step budget shared by the whole
//! call tree, so a looping helper aborts instead of hanging the run. Likewise every array element
//! and string character allocated counts against a heap budget, so a helper asking for a huge
//! array aborts instead of exhausting memory.
//!
//! Static fields live in the sandbox: a class's `<clinit>` runs (in the sandbox) the first time one
//! of its fields is read, and writes never leave the sandbox.

use crate::analysis::{shift_int, shift_long};
use crate::jvm::code::{
    BranchInstruction, CompareMode, Element, EqComparison, Instruction, InvokeType, Label,
};
use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::{
    BaseType, ClassFormatError, ConstantIndex, FieldType, LoadableConstant, MethodDescriptor,
    ParseDescriptor, RefType,
};
use crate::transform::ClassIndex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterpretationError {
    #[error("step budget of {0} instructions exhausted")]
    StepBudget(usize),

    #[error("heap budget of {0} slots exhausted")]
    HeapBudget(usize),

    #[error("call depth limit of {0} exceeded")]
    CallDepth(usize),

    #[error("instruction {0} is not supported in the sandbox")]
    Unsupported(String),

    #[error("call to {0} is not allowed in the sandbox")]
    ForbiddenCall(String),

    #[error("{0} thrown")]
    Thrown(&'static str),

    #[error("ill-typed operand")]
    BadOperand,

    #[error("bad constant: {0}")]
    BadConstant(#[from] ClassFormatError),
}

type Result<T> = std::result::Result<T, InterpretationError>;

/// Value in a local variable or stack slot
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum JValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,

    /// Index into the sandbox heap
    Ref(usize),

    /// Second slot of a `long` or `double` local, or a local never written
    Top,
}

impl JValue {
    fn is_wide(&self) -> bool {
        matches!(self, JValue::Long(_) | JValue::Double(_))
    }

    fn int(self) -> Result<i32> {
        match self {
            JValue::Int(i) => Ok(i),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    fn long(self) -> Result<i64> {
        match self {
            JValue::Long(l) => Ok(l),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    fn float(self) -> Result<f32> {
        match self {
            JValue::Float(f) => Ok(f),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    fn double(self) -> Result<f64> {
        match self {
            JValue::Double(d) => Ok(d),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    fn reference(self) -> Result<Option<usize>> {
        match self {
            JValue::Ref(r) => Ok(Some(r)),
            JValue::Null => Ok(None),
            _ => Err(InterpretationError::BadOperand),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum HeapObject {
    /// UTF-16 code units, like a Java string
    String(Vec<u16>),
    Builder(Vec<u16>),
    Array { class: String, values: Vec<JValue> },
    Class(String),

    /// Result of `new`, until its constructor runs
    Uninitialized(String),
}

impl HeapObject {
    /// Slots charged against the heap budget
    fn slots(&self) -> usize {
        match self {
            HeapObject::String(units) | HeapObject::Builder(units) => units.len().max(1),
            HeapObject::Array { values, .. } => values.len().max(1),
            HeapObject::Class(_) | HeapObject::Uninitialized(_) => 1,
        }
    }
}

/// Heap slots a sandbox may allocate unless told otherwise
pub const DEFAULT_HEAP_BUDGET: usize = 1_000_000;

/// Interpreter state, shared by every call made during one evaluation
pub struct Sandbox<'a> {
    /// Class being transformed (it may differ from its entry in the index)
    current: &'a ClassModel,
    index: &'a ClassIndex,
    step_budget: usize,
    max_depth: usize,
    steps: usize,
    heap_budget: usize,
    heap_used: usize,
    heap: Vec<HeapObject>,
    statics: HashMap<(String, String), JValue>,
    initialized: HashSet<String>,
}

impl<'a> Sandbox<'a> {
    pub fn new(
        current: &'a ClassModel,
        index: &'a ClassIndex,
        step_budget: usize,
        max_depth: usize,
    ) -> Sandbox<'a> {
        Sandbox {
            current,
            index,
            step_budget,
            max_depth,
            steps: 0,
            heap_budget: DEFAULT_HEAP_BUDGET,
            heap_used: 0,
            heap: vec![],
            statics: HashMap::new(),
            initialized: HashSet::new(),
        }
    }

    /// Limit the array elements and string characters the sandbox may allocate
    pub fn with_heap_budget(mut self, slots: usize) -> Sandbox<'a> {
        self.heap_budget = slots;
        self
    }

    /// Number of instructions executed so far
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Reset the step counter, keeping static state
    pub fn reset_steps(&mut self) {
        self.steps = 0;
    }

    pub fn new_string(&mut self, string: &str) -> Result<JValue> {
        self.alloc(HeapObject::String(string.encode_utf16().collect()))
    }

    /// Read back a string produced by the sandbox
    pub fn string_value(&self, value: JValue) -> Option<String> {
        match value {
            JValue::Ref(r) => match self.heap.get(r)? {
                HeapObject::String(units) => Some(String::from_utf16_lossy(units)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Take `slots` out of the heap budget, before allocating them
    fn charge(&mut self, slots: usize) -> Result<()> {
        match self.heap_used.checked_add(slots) {
            Some(used) if used <= self.heap_budget => {
                self.heap_used = used;
                Ok(())
            }
            _ => Err(InterpretationError::HeapBudget(self.heap_budget)),
        }
    }

    fn alloc(&mut self, object: HeapObject) -> Result<JValue> {
        self.charge(object.slots())?;
        Ok(self.store(object))
    }

    /// Put an object on the heap whose slots were already charged
    fn store(&mut self, object: HeapObject) -> JValue {
        self.heap.push(object);
        JValue::Ref(self.heap.len() - 1)
    }

    fn class(&self, name: &str) -> Option<&'a ClassModel> {
        if self.current.name == name {
            Some(self.current)
        } else {
            self.index.get(name).map(|class| class.as_ref())
        }
    }

    /// Call a static method of a class in the class set
    pub fn invoke_static(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<JValue>,
    ) -> Result<Option<JValue>> {
        self.invoke_at_depth(owner, name, descriptor, args, 0)
    }

    fn invoke_at_depth(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: Vec<JValue>,
        depth: usize,
    ) -> Result<Option<JValue>> {
        if depth >= self.max_depth {
            return Err(InterpretationError::CallDepth(self.max_depth));
        }
        let class = self
            .class(owner)
            .ok_or_else(|| forbidden(owner, name, descriptor))?;
        let method = class
            .method(name, descriptor)
            .filter(|method| method.is_static() && method.code.is_some())
            .ok_or_else(|| forbidden(owner, name, descriptor))?;

        let mut locals = vec![];
        for arg in args {
            let wide = arg.is_wide();
            locals.push(arg);
            if wide {
                locals.push(JValue::Top);
            }
        }
        let mut frame = Frame::new(class, method, locals);
        loop {
            match self.step(&mut frame, depth)? {
                Step::Continue => (),
                Step::Return(value) => return Ok(value),
            }
        }
    }

    /// Run `<clinit>` of a sandbox class, once
    fn ensure_initialized(&mut self, class_name: &str, depth: usize) -> Result<()> {
        if !self.initialized.insert(class_name.to_owned()) {
            return Ok(());
        }
        let class = match self.class(class_name) {
            Some(class) => class,
            None => return Ok(()),
        };
        for field in class.fields.iter().filter(|field| field.is_static()) {
            let value = match field.constant_value {
                Some(index) => self.load_constant(class, index)?,
                None => default_value(&field.descriptor),
            };
            self.statics
                .insert((class_name.to_owned(), field.name.clone()), value);
        }
        if class.has_static_initializer() {
            self.invoke_at_depth(class_name, "<clinit>", "()V", vec![], depth + 1)?;
        }
        Ok(())
    }

    fn load_constant(&mut self, class: &ClassModel, index: ConstantIndex) -> Result<JValue> {
        Ok(match class.constants.loadable(index)? {
            LoadableConstant::Integer(i) => JValue::Int(i),
            LoadableConstant::Float(f) => JValue::Float(f),
            LoadableConstant::Long(l) => JValue::Long(l),
            LoadableConstant::Double(d) => JValue::Double(d),
            LoadableConstant::String(s) => self.new_string(s)?,
            LoadableConstant::Class(name) => self.alloc(HeapObject::Class(name.to_owned()))?,
            _ => return Err(InterpretationError::Unsupported(String::from("ldc"))),
        })
    }

    fn step(&mut self, frame: &mut Frame<'a>, depth: usize) -> Result<Step> {
        self.steps += 1;
        if self.steps > self.step_budget {
            return Err(InterpretationError::StepBudget(self.step_budget));
        }
        let element = frame
            .method_code()
            .get(frame.pc)
            .ok_or(InterpretationError::BadOperand)?;
        frame.pc += 1;
        match element {
            Element::Label(_) => {
                // Labels are free
                self.steps -= 1;
                Ok(Step::Continue)
            }
            Element::Insn(insn) => {
                self.execute(frame, insn, depth)?;
                Ok(Step::Continue)
            }
            Element::Branch(branch) => self.execute_branch(frame, branch),
        }
    }

    fn execute(&mut self, frame: &mut Frame<'a>, insn: &Instruction, depth: usize) -> Result<()> {
        use Instruction::*;
        let class = frame.class;
        match insn {
            Nop => (),
            AConstNull => frame.push(JValue::Null),
            IConstM1 => frame.push(JValue::Int(-1)),
            IConst0 => frame.push(JValue::Int(0)),
            IConst1 => frame.push(JValue::Int(1)),
            IConst2 => frame.push(JValue::Int(2)),
            IConst3 => frame.push(JValue::Int(3)),
            IConst4 => frame.push(JValue::Int(4)),
            IConst5 => frame.push(JValue::Int(5)),
            LConst0 => frame.push(JValue::Long(0)),
            LConst1 => frame.push(JValue::Long(1)),
            FConst0 => frame.push(JValue::Float(0.0)),
            FConst1 => frame.push(JValue::Float(1.0)),
            FConst2 => frame.push(JValue::Float(2.0)),
            DConst0 => frame.push(JValue::Double(0.0)),
            DConst1 => frame.push(JValue::Double(1.0)),
            BiPush(b) => frame.push(JValue::Int(*b as i32)),
            SiPush(s) => frame.push(JValue::Int(*s as i32)),
            Ldc(index) | Ldc2(index) => {
                let value = self.load_constant(class, *index)?;
                frame.push(value);
            }
            ILoad(idx) | LLoad(idx) | FLoad(idx) | DLoad(idx) | ALoad(idx) => {
                let value = frame.load(*idx)?;
                frame.push(value);
            }
            IStore(idx) | LStore(idx) | FStore(idx) | DStore(idx) | AStore(idx) => {
                let value = frame.pop()?;
                frame.store(*idx, value);
            }
            IALoad | LALoad | FALoad | DALoad | AALoad | BALoad | CALoad | SALoad => {
                let index = frame.pop()?.int()?;
                let array = frame.pop()?.reference()?;
                let value = *self.array(array)?.get(index as usize).ok_or(
                    InterpretationError::Thrown("java/lang/ArrayIndexOutOfBoundsException"),
                )?;
                frame.push(value);
            }
            IAStore | LAStore | FAStore | DAStore | AAStore | BAStore | CAStore | SAStore => {
                let value = frame.pop()?;
                let index = frame.pop()?.int()?;
                let array = frame.pop()?.reference()?;
                let value = match (insn, value) {
                    (BAStore, JValue::Int(i)) => JValue::Int(i as i8 as i32),
                    (CAStore, JValue::Int(i)) => JValue::Int(i as u16 as i32),
                    (SAStore, JValue::Int(i)) => JValue::Int(i as i16 as i32),
                    (_, value) => value,
                };
                let slot = self.array_mut(array)?.get_mut(index as usize).ok_or(
                    InterpretationError::Thrown("java/lang/ArrayIndexOutOfBoundsException"),
                )?;
                *slot = value;
            }

            Pop => {
                frame.pop()?;
            }
            Pop2 => {
                if !frame.pop()?.is_wide() {
                    frame.pop()?;
                }
            }
            Dup => {
                let value = frame.pop()?;
                frame.stack.extend([value, value]);
            }
            DupX1 => {
                let value1 = frame.pop()?;
                let value2 = frame.pop()?;
                frame.stack.extend([value1, value2, value1]);
            }
            DupX2 => {
                let value1 = frame.pop()?;
                let value2 = frame.pop()?;
                if value2.is_wide() {
                    frame.stack.extend([value1, value2, value1]);
                } else {
                    let value3 = frame.pop()?;
                    frame.stack.extend([value1, value3, value2, value1]);
                }
            }
            Dup2 => {
                let value1 = frame.pop()?;
                if value1.is_wide() {
                    frame.stack.extend([value1, value1]);
                } else {
                    let value2 = frame.pop()?;
                    frame.stack.extend([value2, value1, value2, value1]);
                }
            }
            Dup2X1 => {
                let value1 = frame.pop()?;
                if value1.is_wide() {
                    let value2 = frame.pop()?;
                    frame.stack.extend([value1, value2, value1]);
                } else {
                    let value2 = frame.pop()?;
                    let value3 = frame.pop()?;
                    frame.stack.extend([value2, value1, value3, value2, value1]);
                }
            }
            Dup2X2 => {
                let value1 = frame.pop()?;
                if value1.is_wide() {
                    let value2 = frame.pop()?;
                    if value2.is_wide() {
                        frame.stack.extend([value1, value2, value1]);
                    } else {
                        let value3 = frame.pop()?;
                        frame.stack.extend([value1, value3, value2, value1]);
                    }
                } else {
                    let value2 = frame.pop()?;
                    let value3 = frame.pop()?;
                    if value3.is_wide() {
                        frame.stack.extend([value2, value1, value3, value2, value1]);
                    } else {
                        let value4 = frame.pop()?;
                        frame
                            .stack
                            .extend([value2, value1, value4, value3, value2, value1]);
                    }
                }
            }
            Swap => {
                let value1 = frame.pop()?;
                let value2 = frame.pop()?;
                frame.stack.extend([value1, value2]);
            }

            IAdd => frame.int_op(|a, b| Ok(a.wrapping_add(b)))?,
            ISub => frame.int_op(|a, b| Ok(a.wrapping_sub(b)))?,
            IMul => frame.int_op(|a, b| Ok(a.wrapping_mul(b)))?,
            IDiv => frame.int_op(|a, b| checked_divisor(b).map(|b| a.wrapping_div(b)))?,
            IRem => frame.int_op(|a, b| checked_divisor(b).map(|b| a.wrapping_rem(b)))?,
            IAnd => frame.int_op(|a, b| Ok(a & b))?,
            IOr => frame.int_op(|a, b| Ok(a | b))?,
            IXor => frame.int_op(|a, b| Ok(a ^ b))?,
            ISh(shift) => frame.int_op(|a, b| Ok(shift_int(*shift, a, b)))?,
            LAdd => frame.long_op(|a, b| Ok(a.wrapping_add(b)))?,
            LSub => frame.long_op(|a, b| Ok(a.wrapping_sub(b)))?,
            LMul => frame.long_op(|a, b| Ok(a.wrapping_mul(b)))?,
            LDiv => frame.long_op(|a, b| checked_divisor(b).map(|b| a.wrapping_div(b)))?,
            LRem => frame.long_op(|a, b| checked_divisor(b).map(|b| a.wrapping_rem(b)))?,
            LAnd => frame.long_op(|a, b| Ok(a & b))?,
            LOr => frame.long_op(|a, b| Ok(a | b))?,
            LXor => frame.long_op(|a, b| Ok(a ^ b))?,
            LSh(shift) => {
                let amount = frame.pop()?.int()?;
                let value = frame.pop()?.long()?;
                frame.push(JValue::Long(shift_long(*shift, value, amount)));
            }
            FAdd | FSub | FMul | FDiv | FRem => {
                let b = frame.pop()?.float()?;
                let a = frame.pop()?.float()?;
                frame.push(JValue::Float(match insn {
                    FAdd => a + b,
                    FSub => a - b,
                    FMul => a * b,
                    FDiv => a / b,
                    _ => a % b,
                }));
            }
            DAdd | DSub | DMul | DDiv | DRem => {
                let b = frame.pop()?.double()?;
                let a = frame.pop()?.double()?;
                frame.push(JValue::Double(match insn {
                    DAdd => a + b,
                    DSub => a - b,
                    DMul => a * b,
                    DDiv => a / b,
                    _ => a % b,
                }));
            }
            INeg => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Int(a.wrapping_neg()));
            }
            LNeg => {
                let a = frame.pop()?.long()?;
                frame.push(JValue::Long(a.wrapping_neg()));
            }
            FNeg => {
                let a = frame.pop()?.float()?;
                frame.push(JValue::Float(-a));
            }
            DNeg => {
                let a = frame.pop()?.double()?;
                frame.push(JValue::Double(-a));
            }
            IInc(idx, diff) => {
                let value = frame.load(*idx)?.int()?;
                frame.store(*idx, JValue::Int(value.wrapping_add(*diff as i32)));
            }
            I2L => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Long(a as i64));
            }
            I2F => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Float(a as f32));
            }
            I2D => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Double(a as f64));
            }
            L2I => {
                let a = frame.pop()?.long()?;
                frame.push(JValue::Int(a as i32));
            }
            L2F => {
                let a = frame.pop()?.long()?;
                frame.push(JValue::Float(a as f32));
            }
            L2D => {
                let a = frame.pop()?.long()?;
                frame.push(JValue::Double(a as f64));
            }
            F2I => {
                let a = frame.pop()?.float()?;
                frame.push(JValue::Int(a as i32));
            }
            F2L => {
                let a = frame.pop()?.float()?;
                frame.push(JValue::Long(a as i64));
            }
            F2D => {
                let a = frame.pop()?.float()?;
                frame.push(JValue::Double(a as f64));
            }
            D2I => {
                let a = frame.pop()?.double()?;
                frame.push(JValue::Int(a as i32));
            }
            D2L => {
                let a = frame.pop()?.double()?;
                frame.push(JValue::Long(a as i64));
            }
            D2F => {
                let a = frame.pop()?.double()?;
                frame.push(JValue::Float(a as f32));
            }
            I2B => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Int(a as i8 as i32));
            }
            I2C => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Int(a as u16 as i32));
            }
            I2S => {
                let a = frame.pop()?.int()?;
                frame.push(JValue::Int(a as i16 as i32));
            }
            LCmp => {
                let b = frame.pop()?.long()?;
                let a = frame.pop()?.long()?;
                frame.push(JValue::Int(a.cmp(&b) as i32));
            }
            FCmp(mode) => {
                let b = frame.pop()?.float()?;
                let a = frame.pop()?.float()?;
                frame.push(JValue::Int(compare_floats(a.partial_cmp(&b), *mode)));
            }
            DCmp(mode) => {
                let b = frame.pop()?.double()?;
                let a = frame.pop()?.double()?;
                frame.push(JValue::Int(compare_floats(a.partial_cmp(&b), *mode)));
            }

            GetStatic(index) => {
                let field = class.constants.member_ref(*index)?;
                if self.class(field.owner).is_none() {
                    return Err(forbidden(field.owner, field.name, field.descriptor));
                }
                self.ensure_initialized(field.owner, depth)?;
                let key = (field.owner.to_owned(), field.name.to_owned());
                let value = self
                    .statics
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| default_value(field.descriptor));
                frame.push(value);
            }
            PutStatic(index) => {
                let field = class.constants.member_ref(*index)?;
                if self.class(field.owner).is_none() {
                    return Err(forbidden(field.owner, field.name, field.descriptor));
                }
                self.ensure_initialized(field.owner, depth)?;
                let value = frame.pop()?;
                self.statics
                    .insert((field.owner.to_owned(), field.name.to_owned()), value);
            }
            GetField(_) | PutField(_) => {
                return Err(InterpretationError::Unsupported(format!("{:?}", insn)))
            }

            Invoke(invoke_type, index) => {
                let method = class.constants.member_ref(*index)?;
                let descriptor = MethodDescriptor::parse(method.descriptor)
                    .map_err(|_| InterpretationError::BadOperand)?;
                let mut args = vec![];
                for _ in &descriptor.parameters {
                    args.push(frame.pop()?);
                }
                if *invoke_type != InvokeType::Static {
                    args.push(frame.pop()?);
                }
                args.reverse();

                let result = if *invoke_type == InvokeType::Static
                    && self.class(method.owner).is_some()
                {
                    self.ensure_initialized(method.owner, depth)?;
                    self.invoke_at_depth(
                        method.owner,
                        method.name,
                        method.descriptor,
                        args,
                        depth + 1,
                    )?
                } else {
                    self.call_library(method.owner, method.name, method.descriptor, &args)?
                };
                if let Some(value) = result {
                    frame.push(value);
                }
            }
            InvokeDynamic(_) => {
                return Err(InterpretationError::Unsupported(String::from("invokedynamic")))
            }

            New(class_index) => {
                let name = class.constants.class_name(*class_index)?;
                match name {
                    "java/lang/String" | "java/lang/StringBuilder" | "java/lang/StringBuffer" => {
                        let value = self.alloc(HeapObject::Uninitialized(name.to_owned()))?;
                        frame.push(value);
                    }
                    _ => return Err(forbidden(name, "<init>", "")),
                }
            }
            NewArray(base_type) => {
                let length = array_length(frame.pop()?.int()?)?;
                let class = RefType::array(FieldType::Base(*base_type)).class_constant_name();
                let value = match base_type {
                    BaseType::Long => JValue::Long(0),
                    BaseType::Float => JValue::Float(0.0),
                    BaseType::Double => JValue::Double(0.0),
                    _ => JValue::Int(0),
                };
                self.charge(length.max(1))?;
                let array = self.store(HeapObject::Array {
                    class,
                    values: vec![value; length],
                });
                frame.push(array);
            }
            ANewArray(class_index) => {
                let length = array_length(frame.pop()?.int()?)?;
                let element = RefType::from_class_constant_name(
                    class.constants.class_name(*class_index)?,
                )
                .map_err(|_| InterpretationError::BadOperand)?;
                let class = RefType::array(FieldType::Ref(element)).class_constant_name();
                self.charge(length.max(1))?;
                let array = self.store(HeapObject::Array {
                    class,
                    values: vec![JValue::Null; length],
                });
                frame.push(array);
            }
            ArrayLength => {
                let array = frame.pop()?.reference()?;
                let length = self.array(array)?.len();
                frame.push(JValue::Int(length as i32));
            }
            CheckCast(_) => {
                let value = frame.pop()?;
                value.reference()?;
                frame.push(value);
            }
            MonitorEnter | MonitorExit => {
                frame.pop()?.reference()?;
            }
            InstanceOf(_) | MultiANewArray(_, _) => {
                return Err(InterpretationError::Unsupported(format!("{:?}", insn)))
            }
        }
        Ok(())
    }

    fn execute_branch(&mut self, frame: &mut Frame<'a>, branch: &BranchInstruction) -> Result<Step> {
        use BranchInstruction::*;
        let target = match branch {
            If(comparison, target) => {
                let value = frame.pop()?.int()?;
                comparison.holds(value, 0).then_some(*target)
            }
            IfICmp(comparison, target) => {
                let b = frame.pop()?.int()?;
                let a = frame.pop()?.int()?;
                comparison.holds(a, b).then_some(*target)
            }
            IfACmp(comparison, target) => {
                let b = frame.pop()?.reference()?;
                let a = frame.pop()?.reference()?;
                let equal = a == b;
                let jump = match comparison {
                    EqComparison::EQ => equal,
                    EqComparison::NE => !equal,
                };
                jump.then_some(*target)
            }
            IfNull(comparison, target) => {
                let is_null = frame.pop()?.reference()?.is_none();
                let jump = match comparison {
                    EqComparison::EQ => is_null,
                    EqComparison::NE => !is_null,
                };
                jump.then_some(*target)
            }
            Goto(target) => Some(*target),
            TableSwitch {
                default,
                low,
                targets,
            } => {
                let value = frame.pop()?.int()?;
                let offset = (value as i64) - (*low as i64);
                Some(if offset >= 0 && (offset as usize) < targets.len() {
                    targets[offset as usize]
                } else {
                    *default
                })
            }
            LookupSwitch { default, targets } => {
                let value = frame.pop()?.int()?;
                Some(
                    targets
                        .iter()
                        .find(|(key, _)| *key == value)
                        .map_or(*default, |(_, target)| *target),
                )
            }
            IReturn | LReturn | FReturn | DReturn | AReturn => {
                return Ok(Step::Return(Some(frame.pop()?)))
            }
            Return => return Ok(Step::Return(None)),
            AThrow => return Err(InterpretationError::Thrown("java/lang/Throwable")),
            Jsr(_) | Ret(_) => {
                return Err(InterpretationError::Unsupported(String::from("jsr/ret")))
            }
        };
        if let Some(target) = target {
            frame.jump(target)?;
        }
        Ok(Step::Continue)
    }

    fn array(&self, array: Option<usize>) -> Result<&Vec<JValue>> {
        let array = array.ok_or(InterpretationError::Thrown("java/lang/NullPointerException"))?;
        match self.heap.get(array) {
            Some(HeapObject::Array { values, .. }) => Ok(values),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    fn array_mut(&mut self, array: Option<usize>) -> Result<&mut Vec<JValue>> {
        let array = array.ok_or(InterpretationError::Thrown("java/lang/NullPointerException"))?;
        match self.heap.get_mut(array) {
            Some(HeapObject::Array { values, .. }) => Ok(values),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    /// UTF-16 contents of a string or builder
    fn units(&self, value: JValue) -> Result<&Vec<u16>> {
        let r = value
            .reference()?
            .ok_or(InterpretationError::Thrown("java/lang/NullPointerException"))?;
        match self.heap.get(r) {
            Some(HeapObject::String(units)) | Some(HeapObject::Builder(units)) => Ok(units),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    fn char_array(&self, value: JValue) -> Result<Vec<u16>> {
        let values = self.array(value.reference()?)?;
        values
            .iter()
            .map(|value| value.int().map(|c| c as u16))
            .collect()
    }

    fn builder_mut(&mut self, value: JValue) -> Result<&mut Vec<u16>> {
        let r = value
            .reference()?
            .ok_or(InterpretationError::Thrown("java/lang/NullPointerException"))?;
        match self.heap.get_mut(r) {
            Some(HeapObject::Builder(units)) => Ok(units),
            _ => Err(InterpretationError::BadOperand),
        }
    }

    /// Text appended by `StringBuilder.append` for a value of the given descriptor
    fn appended_text(&self, descriptor: &str, value: JValue) -> Result<Vec<u16>> {
        Ok(match (descriptor, value) {
            ("C", JValue::Int(c)) => vec![c as u16],
            ("I" | "B" | "S", JValue::Int(i)) => i.to_string().encode_utf16().collect(),
            ("Z", JValue::Int(i)) => (if i != 0 { "true" } else { "false" })
                .encode_utf16()
                .collect(),
            ("J", JValue::Long(l)) => l.to_string().encode_utf16().collect(),
            ("Ljava/lang/String;" | "Ljava/lang/CharSequence;", JValue::Null) => {
                "null".encode_utf16().collect()
            }
            ("Ljava/lang/String;" | "Ljava/lang/CharSequence;", value) => {
                self.units(value)?.clone()
            }
            ("[C", value) => self.char_array(value)?,
            _ => return Err(InterpretationError::BadOperand),
        })
    }

    /// The library classes the sandbox models
    fn call_library(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        args: &[JValue],
    ) -> Result<Option<JValue>> {
        let arg = |idx: usize| args.get(idx).copied().ok_or(InterpretationError::BadOperand);
        let string_or_builder = matches!(
            owner,
            "java/lang/String" | "java/lang/StringBuilder" | "java/lang/StringBuffer"
        );

        match (owner, name, descriptor) {
            ("java/lang/Object", "<init>", "()V") => Ok(None),

            // Constructors
            (_, "<init>", _) if string_or_builder => {
                let receiver = arg(0)?
                    .reference()?
                    .ok_or(InterpretationError::Thrown("java/lang/NullPointerException"))?;
                let units = match descriptor {
                    "()V" | "(I)V" => vec![],
                    "(Ljava/lang/String;)V" | "(Ljava/lang/CharSequence;)V" => {
                        self.units(arg(1)?)?.clone()
                    }
                    "([C)V" => self.char_array(arg(1)?)?,
                    "([CII)V" => {
                        let chars = self.char_array(arg(1)?)?;
                        let start = arg(2)?.int()? as usize;
                        let count = arg(3)?.int()? as usize;
                        chars
                            .get(start..start + count)
                            .ok_or(InterpretationError::Thrown(
                                "java/lang/StringIndexOutOfBoundsException",
                            ))?
                            .to_vec()
                    }
                    _ => return Err(forbidden(owner, name, descriptor)),
                };
                self.charge(units.len())?;
                let object = if owner == "java/lang/String" {
                    HeapObject::String(units)
                } else {
                    HeapObject::Builder(units)
                };
                match self.heap.get_mut(receiver) {
                    Some(slot @ HeapObject::Uninitialized(_)) => *slot = object,
                    _ => return Err(InterpretationError::BadOperand),
                }
                Ok(None)
            }

            ("java/lang/String", "length", "()I")
            | ("java/lang/StringBuilder" | "java/lang/StringBuffer", "length", "()I") => {
                Ok(Some(JValue::Int(self.units(arg(0)?)?.len() as i32)))
            }
            (_, "charAt", "(I)C") if string_or_builder => {
                let index = arg(1)?.int()?;
                let unit = *self
                    .units(arg(0)?)?
                    .get(index as usize)
                    .ok_or(InterpretationError::Thrown(
                        "java/lang/StringIndexOutOfBoundsException",
                    ))?;
                Ok(Some(JValue::Int(unit as i32)))
            }
            (_, "toString", "()Ljava/lang/String;") if string_or_builder => {
                let units = self.units(arg(0)?)?.clone();
                Ok(Some(self.alloc(HeapObject::String(units))?))
            }
            ("java/lang/String", "intern", "()Ljava/lang/String;") => Ok(Some(arg(0)?)),
            ("java/lang/String", "toCharArray", "()[C") => {
                let values = self
                    .units(arg(0)?)?
                    .iter()
                    .map(|unit| JValue::Int(*unit as i32))
                    .collect();
                Ok(Some(self.alloc(HeapObject::Array {
                    class: String::from("[C"),
                    values,
                })?))
            }
            ("java/lang/String", "hashCode", "()I") => {
                let hash = self
                    .units(arg(0)?)?
                    .iter()
                    .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(*unit as i32));
                Ok(Some(JValue::Int(hash)))
            }
            ("java/lang/String", "isEmpty", "()Z") => {
                Ok(Some(JValue::Int(self.units(arg(0)?)?.is_empty() as i32)))
            }
            ("java/lang/String", "equals", "(Ljava/lang/Object;)Z") => {
                let equal = match arg(1)? {
                    JValue::Null => false,
                    other => self.units(arg(0)?)? == self.units(other)?,
                };
                Ok(Some(JValue::Int(equal as i32)))
            }
            ("java/lang/String", "concat", "(Ljava/lang/String;)Ljava/lang/String;") => {
                let mut units = self.units(arg(0)?)?.clone();
                units.extend(self.units(arg(1)?)?);
                Ok(Some(self.alloc(HeapObject::String(units))?))
            }
            ("java/lang/String", "substring", "(I)Ljava/lang/String;" | "(II)Ljava/lang/String;") => {
                let units = self.units(arg(0)?)?;
                let start = arg(1)?.int()?;
                let end = if args.len() > 2 {
                    arg(2)?.int()?
                } else {
                    units.len() as i32
                };
                if start < 0 || end < start || end as usize > units.len() {
                    return Err(InterpretationError::Thrown(
                        "java/lang/StringIndexOutOfBoundsException",
                    ));
                }
                let units = units[start as usize..end as usize].to_vec();
                Ok(Some(self.alloc(HeapObject::String(units))?))
            }
            (
                "java/lang/String",
                "valueOf" | "copyValueOf",
                "([C)Ljava/lang/String;",
            ) => {
                let units = self.char_array(arg(0)?)?;
                Ok(Some(self.alloc(HeapObject::String(units))?))
            }
            ("java/lang/String", "valueOf", "(C)Ljava/lang/String;" | "(I)Ljava/lang/String;") => {
                let units = self.appended_text(&descriptor[1..2], arg(0)?)?;
                Ok(Some(self.alloc(HeapObject::String(units))?))
            }

            ("java/lang/StringBuilder" | "java/lang/StringBuffer", "append", _) => {
                let parameter = descriptor
                    .strip_prefix('(')
                    .and_then(|rest| rest.split(')').next())
                    .ok_or(InterpretationError::BadOperand)?;
                let text = self.appended_text(parameter, arg(1)?)?;
                self.charge(text.len())?;
                self.builder_mut(arg(0)?)?.extend(text);
                Ok(Some(arg(0)?))
            }
            ("java/lang/StringBuilder" | "java/lang/StringBuffer", "reverse", _) => {
                // Surrogate pairs stay in order, like `AbstractStringBuilder.reverse`
                let builder = self.builder_mut(arg(0)?)?;
                let reversed: Vec<u16> = char::decode_utf16(builder.iter().copied())
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .flat_map(|decoded| match decoded {
                        Ok(c) => {
                            let mut buf = [0u16; 2];
                            c.encode_utf16(&mut buf).to_vec()
                        }
                        Err(err) => vec![err.unpaired_surrogate()],
                    })
                    .collect();
                *builder = reversed;
                Ok(Some(arg(0)?))
            }
            ("java/lang/StringBuilder" | "java/lang/StringBuffer", "setCharAt", "(IC)V") => {
                let index = arg(1)?.int()?;
                let unit = arg(2)?.int()? as u16;
                let slot = self
                    .builder_mut(arg(0)?)?
                    .get_mut(index as usize)
                    .ok_or(InterpretationError::Thrown(
                        "java/lang/StringIndexOutOfBoundsException",
                    ))?;
                *slot = unit;
                Ok(None)
            }

            ("java/lang/Math", "abs", "(I)I") => Ok(Some(JValue::Int(arg(0)?.int()?.wrapping_abs()))),
            ("java/lang/Math", "max", "(II)I") => {
                Ok(Some(JValue::Int(arg(0)?.int()?.max(arg(1)?.int()?))))
            }
            ("java/lang/Math", "min", "(II)I") => {
                Ok(Some(JValue::Int(arg(0)?.int()?.min(arg(1)?.int()?))))
            }
            ("java/lang/Integer", "parseInt", "(Ljava/lang/String;)I") => {
                let text = String::from_utf16_lossy(self.units(arg(0)?)?);
                text.parse::<i32>()
                    .map(|i| Some(JValue::Int(i)))
                    .map_err(|_| InterpretationError::Thrown("java/lang/NumberFormatException"))
            }

            _ => Err(forbidden(owner, name, descriptor)),
        }
    }
}

enum Step {
    Continue,
    Return(Option<JValue>),
}

/// Activation of one method
struct Frame<'a> {
    class: &'a ClassModel,
    method: &'a MethodModel,
    labels: HashMap<Label, usize>,
    pc: usize,
    locals: Vec<JValue>,
    stack: Vec<JValue>,
}

impl<'a> Frame<'a> {
    fn new(class: &'a ClassModel, method: &'a MethodModel, locals: Vec<JValue>) -> Frame<'a> {
        let labels = method
            .code
            .iter()
            .flat_map(|code| code.elements.iter().enumerate())
            .filter_map(|(idx, element)| match element {
                Element::Label(label) => Some((*label, idx)),
                _ => None,
            })
            .collect();
        Frame {
            class,
            method,
            labels,
            pc: 0,
            locals,
            stack: vec![],
        }
    }

    fn method_code(&self) -> &'a [Element] {
        self.method
            .code
            .as_ref()
            .map_or(&[][..], |code| &code.elements[..])
    }

    fn jump(&mut self, target: Label) -> Result<()> {
        self.pc = *self
            .labels
            .get(&target)
            .ok_or(InterpretationError::BadOperand)?;
        Ok(())
    }

    fn push(&mut self, value: JValue) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<JValue> {
        self.stack.pop().ok_or(InterpretationError::BadOperand)
    }

    fn load(&self, index: u16) -> Result<JValue> {
        match self.locals.get(index as usize) {
            Some(JValue::Top) | None => Err(InterpretationError::BadOperand),
            Some(value) => Ok(*value),
        }
    }

    fn store(&mut self, index: u16, value: JValue) {
        let index = index as usize;
        let width = if value.is_wide() { 2 } else { 1 };
        if self.locals.len() < index + width {
            self.locals.resize(index + width, JValue::Top);
        }
        self.locals[index] = value;
        if width == 2 {
            self.locals[index + 1] = JValue::Top;
        }
    }

    fn int_op(&mut self, op: impl Fn(i32, i32) -> Result<i32>) -> Result<()> {
        let b = self.pop()?.int()?;
        let a = self.pop()?.int()?;
        self.push(JValue::Int(op(a, b)?));
        Ok(())
    }

    fn long_op(&mut self, op: impl Fn(i64, i64) -> Result<i64>) -> Result<()> {
        let b = self.pop()?.long()?;
        let a = self.pop()?.long()?;
        self.push(JValue::Long(op(a, b)?));
        Ok(())
    }
}

fn forbidden(owner: &str, name: &str, descriptor: &str) -> InterpretationError {
    InterpretationError::ForbiddenCall(format!("{}.{}{}", owner, name, descriptor))
}

fn checked_divisor<T: PartialEq + Default>(divisor: T) -> Result<T> {
    if divisor == T::default() {
        Err(InterpretationError::Thrown("java/lang/ArithmeticException"))
    } else {
        Ok(divisor)
    }
}

fn array_length(length: i32) -> Result<usize> {
    usize::try_from(length)
        .map_err(|_| InterpretationError::Thrown("java/lang/NegativeArraySizeException"))
}

fn compare_floats(ordering: Option<std::cmp::Ordering>, mode: CompareMode) -> i32 {
    match (ordering, mode) {
        (Some(ordering), _) => ordering as i32,
        (None, CompareMode::L) => -1,
        (None, CompareMode::G) => 1,
    }
}

fn default_value(descriptor: &str) -> JValue {
    match descriptor {
        "J" => JValue::Long(0),
        "F" => JValue::Float(0.0),
        "D" => JValue::Double(0.0),
        "I" | "S" | "B" | "C" | "Z" => JValue::Int(0),
        _ => JValue::Null,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{Code, OrdComparison};
    use crate::jvm::MethodAccessFlags;

    fn helper(class: &mut ClassModel, name: &str, descriptor: &str, elements: Vec<Element>) {
        let mut code = Code::new();
        code.max_stack = 8;
        code.max_locals = 8;
        code.elements = elements;
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, name, descriptor);
        method.code = Some(code);
        class.methods.push(method);
    }

    #[test]
    fn decodes_a_xor_string() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let secret: String = "hello".chars().map(|c| (c as u8 ^ 7) as char).collect();
        let secret_index = class.constants.get_string(&secret).unwrap();
        let to_chars = class
            .constants
            .get_method_ref("java/lang/String", "toCharArray", "()[C", false)
            .unwrap();
        let value_of = class
            .constants
            .get_method_ref("java/lang/String", "valueOf", "([C)Ljava/lang/String;", false)
            .unwrap();

        let mut code = Code::new();
        let head = code.fresh_label();
        let done = code.fresh_label();
        helper(
            &mut class,
            "decrypt",
            "(I)Ljava/lang/String;",
            vec![
                Element::Insn(Instruction::Ldc(secret_index.0)),
                Element::Insn(Instruction::Invoke(InvokeType::Virtual, to_chars)),
                Element::Insn(Instruction::AStore(1)),
                Element::Insn(Instruction::IConst0),
                Element::Insn(Instruction::IStore(2)),
                Element::Label(head),
                Element::Insn(Instruction::ILoad(2)),
                Element::Insn(Instruction::ALoad(1)),
                Element::Insn(Instruction::ArrayLength),
                Element::Branch(BranchInstruction::IfICmp(OrdComparison::GE, done)),
                Element::Insn(Instruction::ALoad(1)),
                Element::Insn(Instruction::ILoad(2)),
                Element::Insn(Instruction::Dup2),
                Element::Insn(Instruction::CALoad),
                Element::Insn(Instruction::ILoad(0)),
                Element::Insn(Instruction::IXor),
                Element::Insn(Instruction::I2C),
                Element::Insn(Instruction::CAStore),
                Element::Insn(Instruction::IInc(2, 1)),
                Element::Branch(BranchInstruction::Goto(head)),
                Element::Label(done),
                Element::Insn(Instruction::ALoad(1)),
                Element::Insn(Instruction::Invoke(InvokeType::Static, value_of)),
                Element::Branch(BranchInstruction::AReturn),
            ],
        );

        let index = ClassIndex::new();
        let mut sandbox = Sandbox::new(&class, &index, 10_000, 8);
        let result = sandbox
            .invoke_static("a/A", "decrypt", "(I)Ljava/lang/String;", vec![JValue::Int(7)])
            .unwrap()
            .unwrap();
        assert_eq!(sandbox.string_value(result).as_deref(), Some("hello"));
    }

    #[test]
    fn infinite_loops_run_out_of_steps() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let mut code = Code::new();
        let head = code.fresh_label();
        helper(
            &mut class,
            "spin",
            "()V",
            vec![
                Element::Label(head),
                Element::Branch(BranchInstruction::Goto(head)),
            ],
        );
        let index = ClassIndex::new();
        let mut sandbox = Sandbox::new(&class, &index, 500, 8);
        assert_eq!(
            sandbox.invoke_static("a/A", "spin", "()V", vec![]),
            Err(InterpretationError::StepBudget(500))
        );
    }

    #[test]
    fn huge_arrays_exhaust_the_heap_budget() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let length = class.constants.get_integer(30_000_000).unwrap();
        let text = class.constants.get_string("x").unwrap();
        helper(
            &mut class,
            "hoard",
            "()Ljava/lang/String;",
            vec![
                Element::Insn(Instruction::Ldc(length)),
                Element::Insn(Instruction::NewArray(BaseType::Long)),
                Element::Insn(Instruction::Pop),
                Element::Insn(Instruction::Ldc(text.0)),
                Element::Branch(BranchInstruction::AReturn),
            ],
        );
        let index = ClassIndex::new();
        let mut sandbox = Sandbox::new(&class, &index, 10_000, 8);
        assert_eq!(
            sandbox.invoke_static("a/A", "hoard", "()Ljava/lang/String;", vec![]),
            Err(InterpretationError::HeapBudget(DEFAULT_HEAP_BUDGET))
        );

        let mut sandbox = Sandbox::new(&class, &index, 10_000, 8).with_heap_budget(3);
        assert!(sandbox.new_string("abc").is_ok());
        assert_eq!(
            sandbox.new_string("d"),
            Err(InterpretationError::HeapBudget(3))
        );
    }

    #[test]
    fn io_and_recursion_are_refused() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let exit = class
            .constants
            .get_method_ref("java/lang/System", "exit", "(I)V", false)
            .unwrap();
        let again = class
            .constants
            .get_method_ref("a/A", "again", "()V", false)
            .unwrap();
        helper(
            &mut class,
            "quit",
            "()V",
            vec![
                Element::Insn(Instruction::IConst0),
                Element::Insn(Instruction::Invoke(InvokeType::Static, exit)),
                Element::Branch(BranchInstruction::Return),
            ],
        );
        helper(
            &mut class,
            "again",
            "()V",
            vec![
                Element::Insn(Instruction::Invoke(InvokeType::Static, again)),
                Element::Branch(BranchInstruction::Return),
            ],
        );
        let index = ClassIndex::new();
        let mut sandbox = Sandbox::new(&class, &index, 10_000, 4);
        assert!(matches!(
            sandbox.invoke_static("a/A", "quit", "()V", vec![]),
            Err(InterpretationError::ForbiddenCall(call)) if call == "java/lang/System.exit(I)V"
        ));
        assert_eq!(
            sandbox.invoke_static("a/A", "again", "()V", vec![]),
            Err(InterpretationError::CallDepth(4))
        );
    }
}
