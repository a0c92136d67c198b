use crate::analysis::{BlockId, ControlFlowGraph, Dataflow, EdgeKind, Value};
use crate::jvm::code::{BranchInstruction, Element, Instruction, InvokeType};
use crate::jvm::model::ClassModel;
use crate::jvm::ConstantPool;
use crate::transform::passes::pops_for;
use crate::transform::{
    for_each_analyzable_method, Category, TransformContext, TransformError, Transformer,
};

/// Calls that inspect how the program is being run: who called, where the code was loaded from,
/// and which agents the JVM was started with
const INTEGRITY_SOURCES: &[(&str, &str)] = &[
    ("java/lang/Thread", "getStackTrace"),
    ("java/lang/Throwable", "getStackTrace"),
    ("java/lang/StackTraceElement", "getClassName"),
    ("java/lang/StackTraceElement", "getMethodName"),
    ("java/lang/StackTraceElement", "getFileName"),
    ("java/lang/StackTraceElement", "getLineNumber"),
    ("java/lang/Class", "getProtectionDomain"),
    ("java/security/ProtectionDomain", "getCodeSource"),
    ("java/security/CodeSource", "getLocation"),
    ("java/lang/management/ManagementFactory", "getRuntimeMXBean"),
    ("java/lang/management/RuntimeMXBean", "getInputArguments"),
];

/// Clock reads, used to notice single-stepping in a debugger
const TIMING_SOURCES: &[(&str, &str)] = &[
    ("java/lang/System", "currentTimeMillis"),
    ("java/lang/System", "nanoTime"),
];

/// `String` comparisons that check an inspected value against an expected name
const STRING_COMPARISONS: &[&str] = &[
    "equals",
    "equalsIgnoreCase",
    "contentEquals",
    "contains",
    "startsWith",
    "endsWith",
];

/// Blocks followed when deciding whether a branch leads to termination
const MAX_KILL_CHAIN: usize = 4;

/// How one outcome of a check ends the program
#[derive(Debug, Clone, PartialEq, Eq)]
enum Kill {
    /// `System.exit`, `Runtime.exit`, or `Runtime.halt`
    Exit,

    /// Throwing a freshly built exception
    Throw {
        exception: String,
        with_message: bool,
    },
}

/// Removes integrity and debugger checks that end the program
///
/// A conditional branch is treated as a check when exactly one of its two outcomes leads
/// straight to termination, and the block deciding it reads one of the usual tamper sources:
///
///   - a clock read only counts when the other outcome ends the process, since timeouts throw
///   - an integrity read (stack trace, code source, JVM arguments) may also end in a throw, as
///     long as the check compares against a string or throws a bare `Error`
///
/// The branch is replaced so that the surviving outcome is always taken; the terminating code
/// becomes unreachable and goes away.
pub struct AntiTamperRemoval;

impl Transformer for AntiTamperRemoval {
    fn name(&self) -> &'static str {
        "anti-tamper-removal"
    }

    fn category(&self) -> Category {
        Category::AntiTamperRemoval
    }

    fn description(&self) -> &'static str {
        "Removes checks that terminate the program when tampering is detected"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        for_each_analyzable_method(class, ctx, |class_name, constants, method, flow, ctx| {
            let code = match method.code.as_mut() {
                Some(code) => code,
                None => return Ok(false),
            };
            let constants: &ConstantPool = constants;
            let hierarchy = ctx.hierarchy;
            let cfg = &flow.cfg;

            let mut replacements: Vec<(usize, Vec<Element>)> = vec![];
            for (block_id, block) in cfg.blocks.iter().enumerate() {
                let idx = block.last_instruction;
                let (branch, taken_label) = match &code.elements[idx] {
                    Element::Branch(branch) if branch.is_conditional() => {
                        match branch.targets().first() {
                            Some(target) => (branch, *target),
                            None => continue,
                        }
                    }
                    _ => continue,
                };
                let body = &code.elements[block.elements.clone()];
                let reads_integrity = calls_any(body, INTEGRITY_SOURCES, constants);
                let reads_clock = calls_any(body, TIMING_SOURCES, constants);
                if !reads_integrity && !reads_clock {
                    continue;
                }

                let taken = cfg.block_of_label(&taken_label);
                let fall_through = cfg
                    .successors(block_id)
                    .find(|edge| edge.kind == EdgeKind::FallThrough)
                    .map(|edge| edge.to);
                let (taken, fall_through) = match (taken, fall_through) {
                    (Some(taken), Some(fall_through)) if taken != fall_through => {
                        (taken, fall_through)
                    }
                    _ => continue,
                };
                let exits = |start| kills(start, cfg, &code.elements, constants);
                let (always_jump, kill) = match (exits(taken), exits(fall_through)) {
                    (None, Some(kill)) => (true, kill),
                    (Some(kill), None) => (false, kill),
                    _ => continue,
                };
                let is_check = match &kill {
                    Kill::Exit => true,
                    Kill::Throw {
                        exception,
                        with_message,
                    } => {
                        let bare_error = !with_message
                            && hierarchy.is_subclass(exception, "java/lang/Error") == Some(true);
                        reads_integrity && (compares_strings(body, constants) || bare_error)
                    }
                };
                if !is_check {
                    continue;
                }

                let operands = match branch_operands(branch, flow, idx) {
                    Some(operands) => operands,
                    None => continue,
                };
                let mut replacement = pops_for(&operands);
                if always_jump {
                    replacement.push(Element::Branch(BranchInstruction::Goto(taken_label)));
                }
                replacements.push((idx, replacement));
            }

            if replacements.is_empty() {
                return Ok(false);
            }
            ctx.log(
                class_name,
                format!(
                    "{}{}: removed {} tamper checks",
                    method.name,
                    method.descriptor,
                    replacements.len()
                ),
            );
            for (idx, replacement) in replacements.into_iter().rev() {
                code.elements.splice(idx..idx + 1, replacement);
            }
            Ok(true)
        })
    }
}

/// Stack values a conditional branch consumes, topmost first
fn branch_operands<'a>(
    branch: &BranchInstruction,
    flow: &'a Dataflow,
    idx: usize,
) -> Option<Vec<&'a Value>> {
    let count = match branch {
        BranchInstruction::If(..) | BranchInstruction::IfNull(..) => 1,
        BranchInstruction::IfICmp(..) | BranchInstruction::IfACmp(..) => 2,
        _ => return None,
    };
    let state = flow.state_before(idx)?;
    (0..count).map(|depth| state.peek(depth)).collect()
}

fn invoked<'a>(
    element: &Element,
    constants: &'a ConstantPool,
) -> Option<(InvokeType, &'a str, &'a str, &'a str)> {
    match element {
        Element::Insn(Instruction::Invoke(invoke_type, member)) => {
            let member = constants.member_ref(*member).ok()?;
            Some((*invoke_type, member.owner, member.name, member.descriptor))
        }
        _ => None,
    }
}

fn calls_any(body: &[Element], members: &[(&str, &str)], constants: &ConstantPool) -> bool {
    body.iter().any(|element| match invoked(element, constants) {
        Some((_, owner, name, _)) => members.contains(&(owner, name)),
        None => false,
    })
}

fn compares_strings(body: &[Element], constants: &ConstantPool) -> bool {
    body.iter().any(|element| {
        matches!(
            invoked(element, constants),
            Some((InvokeType::Virtual, "java/lang/String", name, _)) if STRING_COMPARISONS.contains(&name)
        )
    })
}

fn is_exit_call(element: &Element, constants: &ConstantPool) -> bool {
    matches!(
        invoked(element, constants),
        Some((InvokeType::Static, "java/lang/System", "exit", "(I)V"))
            | Some((InvokeType::Virtual, "java/lang/Runtime", "halt" | "exit", "(I)V"))
    )
}

/// Does execution starting at this block end the program (or throw) without doing anything else
/// of interest?
fn kills(
    start: BlockId,
    cfg: &ControlFlowGraph,
    elements: &[Element],
    constants: &ConstantPool,
) -> Option<Kill> {
    let mut current = start;
    for _ in 0..MAX_KILL_CHAIN {
        let block = &cfg.blocks[current];
        let body = &elements[block.elements.clone()];
        if body.iter().any(|element| is_exit_call(element, constants)) {
            return Some(Kill::Exit);
        }

        let throws = matches!(
            elements[block.last_instruction],
            Element::Branch(BranchInstruction::AThrow)
        );
        if throws {
            return thrown_exception(body, constants);
        }

        let mut next = cfg
            .successors(current)
            .filter(|edge| edge.kind != EdgeKind::Exception);
        match (next.next(), next.next()) {
            (Some(edge), None) => current = edge.to,
            _ => return None,
        }
    }
    None
}

/// Exception a throwing block builds itself (`new`, then its constructor)
fn thrown_exception(body: &[Element], constants: &ConstantPool) -> Option<Kill> {
    let exception = body.iter().find_map(|element| match element {
        Element::Insn(Instruction::New(class)) => constants.class_name(*class).ok(),
        _ => None,
    })?;
    let descriptor = body.iter().find_map(|element| match invoked(element, constants) {
        Some((InvokeType::Special, owner, "<init>", descriptor)) if owner == exception => {
            Some(descriptor)
        }
        _ => None,
    })?;
    Some(Kill::Throw {
        exception: exception.to_owned(),
        with_message: descriptor != "()V",
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{Code, OrdComparison};
    use crate::jvm::model::MethodModel;
    use crate::jvm::MethodAccessFlags;
    use crate::transform::ClassIndex;
    use crate::verifier::verify;

    fn run(class: &mut ClassModel) -> bool {
        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        AntiTamperRemoval.transform_class(class, &mut ctx).unwrap()
    }

    fn instructions(class: &ClassModel) -> Vec<Element> {
        let code = class.methods[0].code.as_ref().unwrap();
        code.instructions().map(|(_, e)| e.clone()).collect()
    }

    #[test]
    fn timing_check_that_exits_goes() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let millis = class
            .constants
            .get_method_ref("java/lang/System", "currentTimeMillis", "()J", false)
            .unwrap();
        let exit = class
            .constants
            .get_method_ref("java/lang/System", "exit", "(I)V", false)
            .unwrap();

        let mut code = Code::new();
        let ok = code.fresh_label();
        code.max_stack = 4;
        code.elements = vec![
            Element::Insn(Instruction::Invoke(InvokeType::Static, millis)),
            Element::Insn(Instruction::LConst0),
            Element::Insn(Instruction::LCmp),
            Element::Branch(BranchInstruction::If(OrdComparison::GE, ok)),
            Element::Insn(Instruction::IConst0),
            Element::Insn(Instruction::Invoke(InvokeType::Static, exit)),
            Element::Label(ok),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "check", "()V");
        method.code = Some(code);
        class.methods.push(method);

        assert!(run(&mut class));
        assert_eq!(
            instructions(&class),
            vec![
                Element::Insn(Instruction::Invoke(InvokeType::Static, millis)),
                Element::Insn(Instruction::LConst0),
                Element::Insn(Instruction::LCmp),
                Element::Insn(Instruction::Pop),
                Element::Branch(BranchInstruction::Goto(ok)),
                Element::Branch(BranchInstruction::Return),
            ]
        );
        assert_eq!(verify(&class, &ClassHierarchy::new()), Ok(()));
        assert!(!run(&mut class));
    }

    #[test]
    fn ordinary_branches_stay() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let exit = class
            .constants
            .get_method_ref("java/lang/System", "exit", "(I)V", false)
            .unwrap();
        let mut code = Code::new();
        let ok = code.fresh_label();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::GE, ok)),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::Invoke(InvokeType::Static, exit)),
            Element::Label(ok),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "main", "(I)V");
        method.code = Some(code);
        class.methods.push(method);

        assert!(!run(&mut class));
        assert_eq!(instructions(&class).len(), 5);
    }

    /// `static void method(...) { if (<condition>) return; throw new <exception>(...); }`
    fn throwing_check(
        class: &mut ClassModel,
        descriptor: &str,
        condition: Vec<Element>,
        exception: &str,
        message: Option<&str>,
    ) {
        let exception_class = class.constants.get_class(exception).unwrap();
        let init_descriptor = if message.is_some() {
            "(Ljava/lang/String;)V"
        } else {
            "()V"
        };
        let init = class
            .constants
            .get_method_ref(exception, "<init>", init_descriptor, false)
            .unwrap();

        let mut code = Code::new();
        let ok = code.fresh_label();
        code.max_stack = 4;
        code.max_locals = 2;
        code.elements = condition;
        code.elements.push(Element::Branch(BranchInstruction::If(OrdComparison::NE, ok)));
        code.elements.push(Element::Insn(Instruction::New(exception_class)));
        code.elements.push(Element::Insn(Instruction::Dup));
        if let Some(message) = message {
            let message = class.constants.get_string(message).unwrap();
            code.elements.push(Element::Insn(Instruction::Ldc(message.0)));
        }
        code.elements.push(Element::Insn(Instruction::Invoke(InvokeType::Special, init)));
        code.elements.push(Element::Branch(BranchInstruction::AThrow));
        code.elements.push(Element::Label(ok));
        code.elements.push(Element::Branch(BranchInstruction::Return));

        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "check", descriptor);
        method.code = Some(code);
        class.methods.push(method);
    }

    fn throws(class: &ClassModel) -> bool {
        instructions(class).contains(&Element::Branch(BranchInstruction::AThrow))
    }

    #[test]
    fn timeouts_stay() {
        // if (System.currentTimeMillis() > deadline) throw new TimeoutException();
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let millis = class
            .constants
            .get_method_ref("java/lang/System", "currentTimeMillis", "()J", false)
            .unwrap();
        let condition = vec![
            Element::Insn(Instruction::Invoke(InvokeType::Static, millis)),
            Element::Insn(Instruction::LLoad(0)),
            Element::Insn(Instruction::LCmp),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::IXor),
        ];
        throwing_check(
            &mut class,
            "(J)V",
            condition,
            "java/util/concurrent/TimeoutException",
            None,
        );

        assert!(!run(&mut class));
        assert!(throws(&class));
    }

    #[test]
    fn caller_checks_that_throw_go() {
        // if (!Thread.currentThread().getStackTrace()[2].getClassName().equals("a/Main"))
        //     throw new SecurityException("tampered");
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let current = class
            .constants
            .get_method_ref("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;", false)
            .unwrap();
        let stack_trace = class
            .constants
            .get_method_ref(
                "java/lang/Thread",
                "getStackTrace",
                "()[Ljava/lang/StackTraceElement;",
                false,
            )
            .unwrap();
        let class_name = class
            .constants
            .get_method_ref(
                "java/lang/StackTraceElement",
                "getClassName",
                "()Ljava/lang/String;",
                false,
            )
            .unwrap();
        let equals = class
            .constants
            .get_method_ref("java/lang/String", "equals", "(Ljava/lang/Object;)Z", false)
            .unwrap();
        let expected = class.constants.get_string("a/Main").unwrap();
        let condition = vec![
            Element::Insn(Instruction::Invoke(InvokeType::Static, current)),
            Element::Insn(Instruction::Invoke(InvokeType::Virtual, stack_trace)),
            Element::Insn(Instruction::IConst2),
            Element::Insn(Instruction::AALoad),
            Element::Insn(Instruction::Invoke(InvokeType::Virtual, class_name)),
            Element::Insn(Instruction::Ldc(expected.0)),
            Element::Insn(Instruction::Invoke(InvokeType::Virtual, equals)),
        ];
        throwing_check(
            &mut class,
            "()V",
            condition,
            "java/lang/SecurityException",
            Some("tampered"),
        );

        assert!(run(&mut class));
        assert!(!throws(&class));
    }

    #[test]
    fn agent_checks_need_a_bare_error() {
        // if (ManagementFactory.getRuntimeMXBean().getInputArguments().isEmpty()) return;
        // throw new <exception>();
        let build = |exception: &str, message: Option<&str>| {
            let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
            let bean = class
                .constants
                .get_method_ref(
                    "java/lang/management/ManagementFactory",
                    "getRuntimeMXBean",
                    "()Ljava/lang/management/RuntimeMXBean;",
                    false,
                )
                .unwrap();
            let arguments = class
                .constants
                .get_method_ref(
                    "java/lang/management/RuntimeMXBean",
                    "getInputArguments",
                    "()Ljava/util/List;",
                    true,
                )
                .unwrap();
            let is_empty = class
                .constants
                .get_method_ref("java/util/List", "isEmpty", "()Z", true)
                .unwrap();
            let condition = vec![
                Element::Insn(Instruction::Invoke(InvokeType::Static, bean)),
                Element::Insn(Instruction::Invoke(InvokeType::Interface(1), arguments)),
                Element::Insn(Instruction::Invoke(InvokeType::Interface(1), is_empty)),
            ];
            throwing_check(&mut class, "()V", condition, exception, message);
            class
        };

        let mut bare = build("java/lang/Error", None);
        assert!(run(&mut bare));
        assert!(!throws(&bare));

        let mut explained = build("java/lang/IllegalStateException", Some("no agents allowed"));
        assert!(!run(&mut explained));
        assert!(throws(&explained));
    }
}
