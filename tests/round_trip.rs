mod common;

use common::*;
use untangle::analysis::ClassHierarchy;
use untangle::jvm::code::{
    BranchInstruction, Element, EqComparison, Handler, Instruction, InvokeType, LineNumberEntry,
    LocalVariableEntry,
};
use untangle::jvm::model::{ClassModel, FieldModel, MethodModel};
use untangle::jvm::{ClassFormatError, FieldAccessFlags, Frame, MethodAccessFlags, VerificationType};
use untangle::verifier::{verify, VerifierError};

/// Class exercising switches, handlers, debug tables, frames, and member references
fn busy_class() -> ClassModel {
    let mut class = ClassModel::new("r/Busy", Some("java/lang/Object"));
    class.interfaces.push(String::from("java/lang/Runnable"));
    class
        .fields
        .push(FieldModel::new(FieldAccessFlags::PRIVATE, "count", "I"));

    let object_init = class
        .constants
        .get_method_ref("java/lang/Object", "<init>", "()V", false)
        .unwrap();
    let count = class.constants.get_field_ref("r/Busy", "count", "I").unwrap();

    let mut init = code(1, 1, vec![]);
    let start = init.fresh_label();
    let end = init.fresh_label();
    init.elements = vec![
        Element::Label(start),
        Element::Insn(Instruction::ALoad(0)),
        Element::Insn(Instruction::Invoke(InvokeType::Special, object_init)),
        Element::Branch(BranchInstruction::Return),
        Element::Label(end),
    ];
    init.line_numbers.push(LineNumberEntry { start, line: 1 });
    init.local_variables.push(LocalVariableEntry {
        start,
        end,
        name: String::from("this"),
        descriptor: String::from("Lr/Busy;"),
        index: 0,
    });
    let mut method = MethodModel::new(MethodAccessFlags::PUBLIC, "<init>", "()V");
    method.code = Some(init);
    class.methods.push(method);

    let mut pick = code(2, 2, vec![]);
    let one = pick.fresh_label();
    let two = pick.fresh_label();
    let other = pick.fresh_label();
    let try_start = pick.fresh_label();
    let try_end = pick.fresh_label();
    let handler = pick.fresh_label();
    pick.elements = vec![
        Element::Insn(Instruction::ILoad(1)),
        Element::Branch(BranchInstruction::TableSwitch {
            default: other,
            low: 1,
            targets: vec![one, two],
        }),
        Element::Label(one),
        Element::Insn(Instruction::IConst1),
        Element::Branch(BranchInstruction::IReturn),
        Element::Label(two),
        Element::Label(try_start),
        Element::Insn(Instruction::ALoad(0)),
        Element::Insn(Instruction::GetField(count)),
        Element::Label(try_end),
        Element::Branch(BranchInstruction::IReturn),
        Element::Label(handler),
        Element::Insn(Instruction::Pop),
        Element::Label(other),
        Element::Insn(Instruction::IConstM1),
        Element::Branch(BranchInstruction::IReturn),
    ];
    pick.handlers.push(Handler {
        start: try_start,
        end: try_end,
        handler,
        catch_type: Some(String::from("java/lang/Exception")),
    });
    let locals = vec![
        VerificationType::Object(String::from("r/Busy")),
        VerificationType::Integer,
    ];
    for target in [one, two, other] {
        pick.frames.insert(target, frame(locals.clone()));
    }
    pick.frames.insert(
        handler,
        Frame {
            locals,
            stack: vec![VerificationType::Object(String::from("java/lang/Exception"))],
        },
    );
    let mut method = MethodModel::new(MethodAccessFlags::PUBLIC, "pick", "(I)I");
    method.code = Some(pick);
    class.methods.push(method);

    let mut run = code(1, 1, vec![]);
    let done = run.fresh_label();
    run.elements = vec![
        Element::Insn(Instruction::ALoad(0)),
        Element::Branch(BranchInstruction::IfNull(EqComparison::EQ, done)),
        Element::Label(done),
        Element::Branch(BranchInstruction::Return),
    ];
    run.frames.insert(
        done,
        frame(vec![VerificationType::Object(String::from("r/Busy"))]),
    );
    let mut method = MethodModel::new(MethodAccessFlags::PUBLIC, "run", "()V");
    method.code = Some(run);
    class.methods.push(method);

    class
}

#[test]
fn export_then_build_is_stable() {
    for class in [
        busy_class(),
        plain_class("r/Plain"),
        decrypting_class("r/Strings"),
        unreachable_block_class("r/Flow"),
    ] {
        let bytes = class.export().unwrap();
        let parsed = ClassModel::build(&bytes).unwrap();
        assert_eq!(parsed.name, class.name);
        assert_eq!(parsed.interfaces, class.interfaces);
        assert_eq!(parsed.fields, class.fields);
        assert_eq!(parsed.methods.len(), class.methods.len());
        assert_eq!(parsed.export().unwrap(), bytes);
    }
}

#[test]
fn built_classes_keep_structure() {
    let parsed = ClassModel::build(&busy_class().export().unwrap()).unwrap();

    let pick = parsed.method("pick", "(I)I").unwrap();
    let code = pick.code.as_ref().unwrap();
    assert_eq!(code.handlers.len(), 1);
    assert_eq!(
        code.handlers[0].catch_type.as_deref(),
        Some("java/lang/Exception")
    );
    assert!(code.instructions().any(|(_, element)| matches!(
        element,
        Element::Branch(BranchInstruction::TableSwitch { low: 1, targets, .. }) if targets.len() == 2
    )));

    let init = parsed.method("<init>", "()V").unwrap();
    let code = init.code.as_ref().unwrap();
    assert_eq!(code.line_numbers.len(), 1);
    assert_eq!(code.local_variables[0].name, "this");
}

#[test]
fn built_classes_verify() {
    let classes: Vec<ClassModel> = [busy_class(), plain_class("r/Plain"), decrypting_class("r/Strings")]
        .iter()
        .map(|class| ClassModel::build(&class.export().unwrap()).unwrap())
        .collect();
    let hierarchy = ClassHierarchy::from_classes(&classes);
    for class in &classes {
        assert_eq!(verify(class, &hierarchy), Ok(()), "{}", class.name);
    }
}

#[test]
fn verifier_reports_the_failing_method() {
    let mut class = busy_class();
    let run = class
        .methods
        .iter_mut()
        .find(|method| method.name == "run")
        .unwrap();
    let elements = &mut run.code.as_mut().unwrap().elements;
    *elements.last_mut().unwrap() = Element::Insn(Instruction::Pop);

    let err = verify(&class, &ClassHierarchy::from_classes([&class])).unwrap_err();
    assert_eq!(err.member, "run()V");
    assert!(matches!(err.error, VerifierError::Analysis(_)));
}

#[test]
fn malformed_bytes_are_rejected() {
    let bytes = plain_class("r/Plain").export().unwrap();
    assert_eq!(
        ClassModel::build(&bytes[..bytes.len() - 3]).unwrap_err(),
        ClassFormatError::Truncated
    );

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert_eq!(
        ClassModel::build(&trailing).unwrap_err(),
        ClassFormatError::TrailingBytes(1)
    );
}
