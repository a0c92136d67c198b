//! Classes and archives shared by the integration tests
#![allow(dead_code)]

use untangle::archive::{Archive, Entry};
use untangle::jvm::code::{
    BranchInstruction, Code, Element, Instruction, InvokeType, Label, ModelFrame, OrdComparison,
};
use untangle::jvm::model::{ClassModel, MethodModel};
use untangle::jvm::{Frame, MethodAccessFlags, VerificationType};

pub fn static_method(name: &str, descriptor: &str, code: Code) -> MethodModel {
    let mut method = MethodModel::new(
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        name,
        descriptor,
    );
    method.code = Some(code);
    method
}

/// Frame with an empty stack
pub fn frame(locals: Vec<VerificationType<String, Label>>) -> ModelFrame {
    Frame {
        locals,
        stack: vec![],
    }
}

pub fn code(max_stack: u16, max_locals: u16, elements: Vec<Element>) -> Code {
    let mut code = Code::new();
    code.max_stack = max_stack;
    code.max_locals = max_locals;
    code.elements = elements;
    code
}

/// `static int answer() { return 42; }`
pub fn plain_class(name: &str) -> ClassModel {
    let mut class = ClassModel::new(name, Some("java/lang/Object"));
    class.methods.push(static_method(
        "answer",
        "()I",
        code(
            1,
            0,
            vec![
                Element::Insn(Instruction::BiPush(42)),
                Element::Branch(BranchInstruction::IReturn),
            ],
        ),
    ));
    class
}

/// A string helper `decrypt(int)` and a caller passing it a literal
///
/// ```java
/// static String decrypt(int key) { return key == 1 ? "hello" : "bye"; }
/// static String greeting() { return decrypt(1); }
/// ```
pub fn decrypting_class(name: &str) -> ClassModel {
    let mut class = ClassModel::new(name, Some("java/lang/Object"));
    let hello = class.constants.get_string("hello").unwrap();
    let bye = class.constants.get_string("bye").unwrap();
    let decrypt = class
        .constants
        .get_method_ref(name, "decrypt", "(I)Ljava/lang/String;", false)
        .unwrap();

    let mut helper = code(2, 1, vec![]);
    let other = helper.fresh_label();
    helper.elements = vec![
        Element::Insn(Instruction::ILoad(0)),
        Element::Insn(Instruction::IConst1),
        Element::Branch(BranchInstruction::IfICmp(OrdComparison::NE, other)),
        Element::Insn(Instruction::Ldc(hello.0)),
        Element::Branch(BranchInstruction::AReturn),
        Element::Label(other),
        Element::Insn(Instruction::Ldc(bye.0)),
        Element::Branch(BranchInstruction::AReturn),
    ];
    helper
        .frames
        .insert(other, frame(vec![VerificationType::Integer]));
    class
        .methods
        .push(static_method("decrypt", "(I)Ljava/lang/String;", helper));

    class.methods.push(static_method(
        "greeting",
        "()Ljava/lang/String;",
        code(
            1,
            0,
            vec![
                Element::Insn(Instruction::IConst1),
                Element::Insn(Instruction::Invoke(InvokeType::Static, decrypt)),
                Element::Branch(BranchInstruction::AReturn),
            ],
        ),
    ));
    class
}

/// Three blocks, the middle one unreachable since it follows an unconditional jump
pub fn unreachable_block_class(name: &str) -> ClassModel {
    let mut class = ClassModel::new(name, Some("java/lang/Object"));
    let mut body = code(1, 0, vec![]);
    let dead = body.fresh_label();
    let end = body.fresh_label();
    body.elements = vec![
        Element::Branch(BranchInstruction::Goto(end)),
        Element::Label(dead),
        Element::Insn(Instruction::IConst1),
        Element::Insn(Instruction::Pop),
        Element::Label(end),
        Element::Branch(BranchInstruction::Return),
    ];
    body.frames.insert(dead, frame(vec![]));
    body.frames.insert(end, frame(vec![]));
    class.methods.push(static_method("run", "()V", body));
    class
}

/// A timing check that exits the JVM
///
/// ```java
/// static void check() { if (System.currentTimeMillis() < 0) System.exit(0); }
/// ```
pub fn anti_tamper_class(name: &str) -> ClassModel {
    let mut class = ClassModel::new(name, Some("java/lang/Object"));
    let millis = class
        .constants
        .get_method_ref("java/lang/System", "currentTimeMillis", "()J", false)
        .unwrap();
    let exit = class
        .constants
        .get_method_ref("java/lang/System", "exit", "(I)V", false)
        .unwrap();
    let mut body = code(4, 0, vec![]);
    let ok = body.fresh_label();
    body.elements = vec![
        Element::Insn(Instruction::Invoke(InvokeType::Static, millis)),
        Element::Insn(Instruction::LConst0),
        Element::Insn(Instruction::LCmp),
        Element::Branch(BranchInstruction::If(OrdComparison::GE, ok)),
        Element::Insn(Instruction::IConst0),
        Element::Insn(Instruction::Invoke(InvokeType::Static, exit)),
        Element::Label(ok),
        Element::Branch(BranchInstruction::Return),
    ];
    body.frames.insert(ok, frame(vec![]));
    class.methods.push(static_method("check", "()V", body));
    class
}

pub fn class_entry(class: &ClassModel) -> Entry {
    Entry::new(format!("{}.class", class.name), class.export().unwrap())
}

pub fn jar(classes: &[ClassModel]) -> Archive {
    let mut entries = vec![Entry::new(
        "META-INF/MANIFEST.MF",
        b"Manifest-Version: 1.0\r\n\r\n".to_vec(),
    )];
    entries.extend(classes.iter().map(class_entry));
    Archive::new(entries)
}

/// Instructions of a method, leaving out labels and other pseudo-instructions
pub fn instructions(class: &ClassModel, name: &str) -> Vec<Element> {
    let method = class
        .methods
        .iter()
        .find(|method| method.name == name)
        .unwrap();
    method
        .code
        .as_ref()
        .unwrap()
        .instructions()
        .map(|(_, element)| element.clone())
        .collect()
}

pub fn load(archive: &Archive, entry: &str) -> ClassModel {
    ClassModel::build(&archive.get(entry).unwrap().data).unwrap()
}
