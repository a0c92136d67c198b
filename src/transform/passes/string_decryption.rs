use crate::analysis::{ConstValue, Value};
use crate::jvm::code::{Element, Instruction, InvokeType};
use crate::jvm::model::ClassModel;
use crate::jvm::{FieldType, MethodDescriptor, ParseDescriptor};
use crate::transform::interpreter::{JValue, Sandbox};
use crate::transform::passes::{drop_dead_pushes, pops_for};
use crate::transform::{
    for_each_analyzable_method, Category, TransformContext, TransformError, Transformer,
};
use std::sync::Arc;

/// Replaces calls to string decryption helpers with the strings they return
///
/// A call qualifies when it is an `invokestatic` of a method in the class set returning `String`,
/// and every argument is a constant. The helper is run in the [`Sandbox`]; if that succeeds, the
/// call becomes `pop`s of the arguments followed by an `ldc` of the result. Helpers that touch
/// anything outside the sandbox, or run for too long, leave the call alone.
///
/// The helpers themselves are kept: other code (or reflection) may still call them.
pub struct StringDecryption;

impl Transformer for StringDecryption {
    fn name(&self) -> &'static str {
        "string-decryption"
    }

    fn category(&self) -> Category {
        Category::StringDecryption
    }

    fn description(&self) -> &'static str {
        "Evaluates string decryption helpers with constant arguments"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        // Helpers run against the class as it was before this transformer started
        let snapshot = match ctx.index.get(&class.name) {
            Some(snapshot) => snapshot.clone(),
            None => Arc::new(class.clone()),
        };
        let index = ctx.index;
        let settings = ctx.settings;

        for_each_analyzable_method(class, ctx, |class_name, constants, method, flow, ctx| {
            let code = match method.code.as_mut() {
                Some(code) => code,
                None => return Ok(false),
            };

            let mut replacements: Vec<(usize, Vec<Element>)> = vec![];
            for (idx, element) in code.elements.iter().enumerate() {
                let member = match element {
                    Element::Insn(Instruction::Invoke(InvokeType::Static, member)) => *member,
                    _ => continue,
                };
                let member = constants.member_ref(member)?;
                let (owner, name, descriptor) = (
                    member.owner.to_owned(),
                    member.name.to_owned(),
                    member.descriptor.to_owned(),
                );
                let parsed = match MethodDescriptor::parse(&descriptor) {
                    Ok(parsed) if returns_string(&parsed) => parsed,
                    _ => continue,
                };
                let helper = index
                    .get(&owner)
                    .and_then(|class| class.method(&name, &descriptor));
                if !matches!(helper, Some(helper) if helper.is_static() && helper.code.is_some()) {
                    continue;
                }
                let state = match flow.state_before(idx) {
                    Some(state) => state,
                    None => continue,
                };

                // Arguments in parameter order
                let args: Option<Vec<&Value>> = (0..parsed.parameters.len())
                    .rev()
                    .map(|depth| state.peek(depth))
                    .collect();
                let args = match args {
                    Some(args) => args,
                    None => continue,
                };

                let mut sandbox =
                    Sandbox::new(&snapshot, index, settings.step_budget, settings.call_depth)
                        .with_heap_budget(settings.heap_budget);
                let values: Option<Vec<JValue>> = args
                    .iter()
                    .map(|arg| to_jvalue(&mut sandbox, arg))
                    .collect();
                let values = match values {
                    Some(values) => values,
                    None => continue,
                };

                let result = match sandbox.invoke_static(&owner, &name, &descriptor, values) {
                    Ok(result) => result,
                    Err(err) => {
                        log::debug!(
                            "{}: not evaluating {}.{}{}: {}",
                            class_name,
                            owner,
                            name,
                            descriptor,
                            err
                        );
                        continue;
                    }
                };
                let decrypted = match result.and_then(|result| sandbox.string_value(result)) {
                    Some(decrypted) => decrypted,
                    None => continue,
                };

                let topmost_first: Vec<&Value> = args.iter().rev().copied().collect();
                let mut replacement = pops_for(&topmost_first);
                let string = constants.get_string(&decrypted)?;
                replacement.push(Element::Insn(Instruction::Ldc(string.0)));
                replacements.push((idx, replacement));
            }

            if replacements.is_empty() {
                return Ok(false);
            }
            ctx.log(
                class_name,
                format!(
                    "{}{}: decrypted {} strings",
                    method.name,
                    method.descriptor,
                    replacements.len()
                ),
            );
            for (idx, replacement) in replacements.into_iter().rev() {
                code.elements.splice(idx..idx + 1, replacement);
            }
            drop_dead_pushes(&mut code.elements);
            Ok(true)
        })
    }
}

fn returns_string(descriptor: &MethodDescriptor) -> bool {
    !descriptor.parameters.is_empty()
        && descriptor.return_type.as_ref() == Some(&FieldType::string())
}

/// Sandbox value for a constant argument
fn to_jvalue(sandbox: &mut Sandbox, value: &Value) -> Option<JValue> {
    Some(match value.constant.as_ref()? {
        ConstValue::Int(i) => JValue::Int(*i),
        ConstValue::Long(l) => JValue::Long(*l),
        ConstValue::Float(bits) => JValue::Float(f32::from_bits(*bits)),
        ConstValue::Double(bits) => JValue::Double(f64::from_bits(*bits)),
        ConstValue::String(string) => sandbox.new_string(string).ok()?,
        ConstValue::Null => JValue::Null,
        ConstValue::Class(_) => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{BranchInstruction, Code, OrdComparison};
    use crate::jvm::model::MethodModel;
    use crate::jvm::{BaseType, MethodAccessFlags};
    use crate::transform::ClassIndex;

    fn method(name: &str, descriptor: &str, code: Code) -> MethodModel {
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, name, descriptor);
        method.code = Some(code);
        method
    }

    #[test]
    fn constant_calls_become_literals() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let hello = class.constants.get_string("hello").unwrap();
        let bye = class.constants.get_string("bye").unwrap();
        let decrypt = class
            .constants
            .get_method_ref("a/A", "decrypt", "(I)Ljava/lang/String;", false)
            .unwrap();

        let mut code = Code::new();
        let other = code.fresh_label();
        code.max_stack = 2;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Insn(Instruction::IConst1),
            Element::Branch(BranchInstruction::IfICmp(OrdComparison::NE, other)),
            Element::Insn(Instruction::Ldc(hello.0)),
            Element::Branch(BranchInstruction::AReturn),
            Element::Label(other),
            Element::Insn(Instruction::Ldc(bye.0)),
            Element::Branch(BranchInstruction::AReturn),
        ];
        class
            .methods
            .push(method("decrypt", "(I)Ljava/lang/String;", code));

        let call = |arg: Instruction| {
            let mut code = Code::new();
            code.max_stack = 1;
            code.max_locals = 1;
            code.elements = vec![
                Element::Insn(arg),
                Element::Insn(Instruction::Invoke(InvokeType::Static, decrypt)),
                Element::Branch(BranchInstruction::AReturn),
            ];
            code
        };
        class
            .methods
            .push(method("constant", "()Ljava/lang/String;", call(Instruction::IConst1)));
        class
            .methods
            .push(method("dynamic", "(I)Ljava/lang/String;", call(Instruction::ILoad(0))));

        let mut index = ClassIndex::new();
        index.insert(class.name.clone(), Arc::new(class.clone()));
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(StringDecryption.transform_class(&mut class, &mut ctx).unwrap());

        let instructions = |name: &str| -> Vec<Element> {
            let method = class.methods.iter().find(|m| m.name == name).unwrap();
            let code = method.code.as_ref().unwrap();
            code.instructions().map(|(_, e)| e.clone()).collect()
        };
        assert_eq!(
            instructions("constant"),
            vec![
                Element::Insn(Instruction::Ldc(hello.0)),
                Element::Branch(BranchInstruction::AReturn),
            ]
        );
        assert_eq!(instructions("dynamic").len(), 3);
        assert_eq!(instructions("decrypt").len(), 7);
        assert_eq!(ctx.take_log("a/A").len(), 1);
    }

    #[test]
    fn helpers_hoarding_memory_are_left_alone() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let x = class.constants.get_string("x").unwrap();
        let hoard = class
            .constants
            .get_method_ref("a/A", "hoard", "(I)Ljava/lang/String;", false)
            .unwrap();

        let mut code = Code::new();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Insn(Instruction::NewArray(BaseType::Char)),
            Element::Insn(Instruction::Pop),
            Element::Insn(Instruction::Ldc(x.0)),
            Element::Branch(BranchInstruction::AReturn),
        ];
        class
            .methods
            .push(method("hoard", "(I)Ljava/lang/String;", code));

        let mut code = Code::new();
        code.max_stack = 1;
        code.elements = vec![
            Element::Insn(Instruction::SiPush(5000)),
            Element::Insn(Instruction::Invoke(InvokeType::Static, hoard)),
            Element::Branch(BranchInstruction::AReturn),
        ];
        class
            .methods
            .push(method("caller", "()Ljava/lang/String;", code));

        let mut index = ClassIndex::new();
        index.insert(class.name.clone(), Arc::new(class.clone()));
        let hierarchy = ClassHierarchy::new();
        let mut settings = Settings::default();
        settings.heap_budget = 1000;
        let before = class.clone();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(!StringDecryption.transform_class(&mut class, &mut ctx).unwrap());
        assert_eq!(class.methods, before.methods);
        assert!(ctx.take_log("a/A").is_empty());

        settings.heap_budget = 10_000;
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(StringDecryption.transform_class(&mut class, &mut ctx).unwrap());
    }
}
