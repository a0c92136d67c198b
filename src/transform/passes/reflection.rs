use crate::analysis::{ConstValue, FrameState};
use crate::jvm::code::{Element, Instruction, InvokeType};
use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::{
    BaseType, ClassAccessFlags, ConstantIndex, ConstantPool, FieldType, MethodAccessFlags,
    MethodDescriptor, ParseDescriptor,
};
use crate::transform::{
    for_each_analyzable_method, Category, ClassIndex, TransformContext, TransformError,
    Transformer,
};

/// First class file version where `ldc` can push a class
const LDC_CLASS_VERSION: u16 = 49;

const GET_METHOD_DESCRIPTOR: &str =
    "(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;";
const INVOKE_DESCRIPTOR: &str = "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;";
const FOR_NAME_DESCRIPTOR: &str = "(Ljava/lang/String;)Ljava/lang/Class;";

/// Turns reflective lookups with constant arguments back into direct references
///
///   - `Class.forName("a.B")` becomes `ldc a/B` when `a/B` is in the class set and loading it
///     runs no code
///   - `C.class.getDeclaredMethod("m", new Class[0]).invoke(null, new Object[0])` becomes
///     `invokestatic C.m()` (boxing the result) when `C.m` is a static, no-argument method in
///     the class set that the calling class can access
pub struct ReflectionResolution;

impl Transformer for ReflectionResolution {
    fn name(&self) -> &'static str {
        "reflection-resolution"
    }

    fn category(&self) -> Category {
        Category::ReflectionResolution
    }

    fn description(&self) -> &'static str {
        "Replaces reflective class and method lookups with direct references"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        let ldc_class = class.version.major_version >= LDC_CLASS_VERSION;
        let index = ctx.index;

        for_each_analyzable_method(class, ctx, |class_name, constants, method, flow, ctx| {
            let code = match method.code.as_mut() {
                Some(code) => code,
                None => return Ok(false),
            };

            // (start, length, replacement)
            let mut replacements: Vec<(usize, usize, Vec<Element>)> = vec![];
            let mut idx = 0;
            while idx < code.elements.len() {
                let state = match flow.state_before(idx) {
                    Some(state) => state,
                    None => {
                        idx += 1;
                        continue;
                    }
                };
                let found = if ldc_class {
                    resolve_for_name(&code.elements[idx], state, constants, index)?
                } else {
                    None
                };
                let found = match found {
                    Some(found) => Some((1, found)),
                    None => {
                        resolve_invoke(&code.elements[idx..], state, class_name, constants, index)?
                            .map(|found| (REFLECTIVE_CALL_LENGTH, found))
                    }
                };
                match found {
                    Some((length, replacement)) => {
                        replacements.push((idx, length, replacement));
                        idx += length;
                    }
                    None => idx += 1,
                }
            }

            if replacements.is_empty() {
                return Ok(false);
            }
            ctx.log(
                class_name,
                format!(
                    "{}{}: resolved {} reflective lookups",
                    method.name,
                    method.descriptor,
                    replacements.len()
                ),
            );
            for (start, length, replacement) in replacements.into_iter().rev() {
                code.elements.splice(start..start + length, replacement);
            }
            super::drop_dead_pushes(&mut code.elements);
            Ok(true)
        })
    }
}

fn resolve_for_name(
    element: &Element,
    state: &FrameState,
    constants: &mut ConstantPool,
    index: &ClassIndex,
) -> Result<Option<Vec<Element>>, TransformError> {
    let member = match element {
        Element::Insn(Instruction::Invoke(InvokeType::Static, member)) => *member,
        _ => return Ok(None),
    };
    if !is_member(constants, member, "java/lang/Class", "forName", FOR_NAME_DESCRIPTOR)? {
        return Ok(None);
    }
    let name = match state.peek(0).and_then(|value| value.constant.as_ref()) {
        Some(ConstValue::String(name)) => name.replace('.', "/"),
        _ => return Ok(None),
    };
    match index.get(&name) {
        Some(target) if !target.has_static_initializer() => (),
        _ => return Ok(None),
    }
    let class = constants.get_class(&name)?;
    Ok(Some(vec![
        Element::Insn(Instruction::Pop),
        Element::Insn(Instruction::Ldc(class.0)),
    ]))
}

/// `iconst_0, anewarray Class, invokevirtual getDeclaredMethod, aconst_null, iconst_0,
/// anewarray Object, invokevirtual invoke`
const REFLECTIVE_CALL_LENGTH: usize = 7;

fn resolve_invoke(
    elements: &[Element],
    state: &FrameState,
    class_name: &str,
    constants: &mut ConstantPool,
    index: &ClassIndex,
) -> Result<Option<Vec<Element>>, TransformError> {
    let (class_array, get_method, object_array, invoke) = match elements {
        [Element::Insn(Instruction::IConst0), Element::Insn(Instruction::ANewArray(class_array)), Element::Insn(Instruction::Invoke(InvokeType::Virtual, get_method)), Element::Insn(Instruction::AConstNull), Element::Insn(Instruction::IConst0), Element::Insn(Instruction::ANewArray(object_array)), Element::Insn(Instruction::Invoke(InvokeType::Virtual, invoke)), ..] =>
        {
            (*class_array, *get_method, *object_array, *invoke)
        }
        _ => return Ok(None),
    };
    if constants.class_name(class_array)? != "java/lang/Class"
        || constants.class_name(object_array)? != "java/lang/Object"
    {
        return Ok(None);
    }
    let get_method_name = constants.member_ref(get_method)?.name;
    let looks_up = (get_method_name == "getDeclaredMethod" || get_method_name == "getMethod")
        && is_member(
            constants,
            get_method,
            "java/lang/Class",
            get_method_name,
            GET_METHOD_DESCRIPTOR,
        )?;
    if !looks_up
        || !is_member(
            constants,
            invoke,
            "java/lang/reflect/Method",
            "invoke",
            INVOKE_DESCRIPTOR,
        )?
    {
        return Ok(None);
    }

    // Before `iconst_0` the stack ends with the class and the method name
    let owner = match state.peek(1).and_then(|value| value.constant.as_ref()) {
        Some(ConstValue::Class(owner)) => owner.clone(),
        _ => return Ok(None),
    };
    let name = match state.peek(0).and_then(|value| value.constant.as_ref()) {
        Some(ConstValue::String(name)) => name.clone(),
        _ => return Ok(None),
    };
    let target_class = match index.get(&owner) {
        Some(target_class) if !target_class.is_interface() => target_class,
        _ => return Ok(None),
    };
    let target = match target_class
        .methods
        .iter()
        .find(|method| method.name == name && method.descriptor.starts_with("()"))
    {
        Some(target) if target.is_static() => target,
        _ => return Ok(None),
    };
    if !accessible(class_name, target_class, target) {
        return Ok(None);
    }
    let descriptor = match MethodDescriptor::parse(&target.descriptor) {
        Ok(descriptor) => descriptor,
        Err(_) => return Ok(None),
    };

    let method_ref = constants.get_method_ref(&owner, &name, &target.descriptor, false)?;
    let mut replacement = vec![
        Element::Insn(Instruction::Pop),
        Element::Insn(Instruction::Pop),
        Element::Insn(Instruction::Invoke(InvokeType::Static, method_ref)),
    ];
    match &descriptor.return_type {
        None => replacement.push(Element::Insn(Instruction::AConstNull)),
        Some(FieldType::Base(base_type)) => {
            let (boxed, primitive) = boxing(*base_type);
            let value_of = constants.get_method_ref(
                boxed,
                "valueOf",
                &format!("({})L{};", primitive, boxed),
                false,
            )?;
            replacement.push(Element::Insn(Instruction::Invoke(
                InvokeType::Static,
                value_of,
            )));
        }
        Some(FieldType::Ref(_)) => (),
    }
    Ok(Some(replacement))
}

fn is_member(
    constants: &ConstantPool,
    index: ConstantIndex,
    owner: &str,
    name: &str,
    descriptor: &str,
) -> Result<bool, TransformError> {
    let member = constants.member_ref(index)?;
    Ok(member.owner == owner && member.name == name && member.descriptor == descriptor)
}

fn package(class_name: &str) -> &str {
    class_name.rsplit_once('/').map_or("", |(package, _)| package)
}

/// Can code in `from` call `method` of `owner` directly?
fn accessible(from: &str, owner: &ClassModel, method: &MethodModel) -> bool {
    if from == owner.name {
        return true;
    }
    let same_package = package(from) == package(&owner.name);
    let class_visible = owner.access_flags.contains(ClassAccessFlags::PUBLIC) || same_package;
    let method_visible = if method.access_flags.contains(MethodAccessFlags::PUBLIC) {
        true
    } else if method.access_flags.contains(MethodAccessFlags::PRIVATE) {
        false
    } else {
        // Protected members: subclass access is not considered
        same_package
    };
    class_visible && method_visible
}

/// Wrapper class and primitive descriptor for a base type
fn boxing(base_type: BaseType) -> (&'static str, &'static str) {
    match base_type {
        BaseType::Byte => ("java/lang/Byte", "B"),
        BaseType::Char => ("java/lang/Character", "C"),
        BaseType::Double => ("java/lang/Double", "D"),
        BaseType::Float => ("java/lang/Float", "F"),
        BaseType::Int => ("java/lang/Integer", "I"),
        BaseType::Long => ("java/lang/Long", "J"),
        BaseType::Short => ("java/lang/Short", "S"),
        BaseType::Boolean => ("java/lang/Boolean", "Z"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{BranchInstruction, Code};
    use std::sync::Arc;

    fn method(name: &str, descriptor: &str, elements: Vec<Element>) -> MethodModel {
        let mut code = Code::new();
        code.max_stack = 6;
        code.elements = elements;
        let mut method = MethodModel::new(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            name,
            descriptor,
        );
        method.code = Some(code);
        method
    }

    fn instructions(class: &ClassModel, name: &str) -> Vec<Element> {
        let method = class.methods.iter().find(|m| m.name == name).unwrap();
        let code = method.code.as_ref().unwrap();
        code.instructions().map(|(_, e)| e.clone()).collect()
    }

    #[test]
    fn lookups_become_direct_references() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let pool = &mut class.constants;
        let this_class = pool.get_class("a/A").unwrap();
        let target_name = pool.get_string("target").unwrap();
        let dotted_name = pool.get_string("a.A").unwrap();
        let class_class = pool.get_class("java/lang/Class").unwrap();
        let object_class = pool.get_class("java/lang/Object").unwrap();
        let get_method = pool
            .get_method_ref("java/lang/Class", "getDeclaredMethod", GET_METHOD_DESCRIPTOR, false)
            .unwrap();
        let invoke = pool
            .get_method_ref("java/lang/reflect/Method", "invoke", INVOKE_DESCRIPTOR, false)
            .unwrap();
        let for_name = pool
            .get_method_ref("java/lang/Class", "forName", FOR_NAME_DESCRIPTOR, false)
            .unwrap();

        class.methods.push(method(
            "target",
            "()I",
            vec![
                Element::Insn(Instruction::IConst5),
                Element::Branch(BranchInstruction::IReturn),
            ],
        ));
        class.methods.push(method(
            "reflective",
            "()Ljava/lang/Object;",
            vec![
                Element::Insn(Instruction::Ldc(this_class.0)),
                Element::Insn(Instruction::Ldc(target_name.0)),
                Element::Insn(Instruction::IConst0),
                Element::Insn(Instruction::ANewArray(class_class)),
                Element::Insn(Instruction::Invoke(InvokeType::Virtual, get_method)),
                Element::Insn(Instruction::AConstNull),
                Element::Insn(Instruction::IConst0),
                Element::Insn(Instruction::ANewArray(object_class)),
                Element::Insn(Instruction::Invoke(InvokeType::Virtual, invoke)),
                Element::Branch(BranchInstruction::AReturn),
            ],
        ));
        class.methods.push(method(
            "lookup",
            "()Ljava/lang/Class;",
            vec![
                Element::Insn(Instruction::Ldc(dotted_name.0)),
                Element::Insn(Instruction::Invoke(InvokeType::Static, for_name)),
                Element::Branch(BranchInstruction::AReturn),
            ],
        ));

        let mut index = ClassIndex::new();
        index.insert(class.name.clone(), Arc::new(class.clone()));
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(ReflectionResolution
            .transform_class(&mut class, &mut ctx)
            .unwrap());

        let target = class
            .constants
            .get_method_ref("a/A", "target", "()I", false)
            .unwrap();
        let value_of = class
            .constants
            .get_method_ref("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;", false)
            .unwrap();
        assert_eq!(
            instructions(&class, "reflective"),
            vec![
                Element::Insn(Instruction::Invoke(InvokeType::Static, target)),
                Element::Insn(Instruction::Invoke(InvokeType::Static, value_of)),
                Element::Branch(BranchInstruction::AReturn),
            ]
        );
        assert_eq!(
            instructions(&class, "lookup"),
            vec![
                Element::Insn(Instruction::Ldc(this_class.0)),
                Element::Branch(BranchInstruction::AReturn),
            ]
        );
        assert!(!ReflectionResolution
            .transform_class(&mut class, &mut ctx)
            .unwrap());
    }

    #[test]
    fn private_methods_elsewhere_stay_reflective() {
        let mut owner = ClassModel::new("b/B", Some("java/lang/Object"));
        owner.access_flags = ClassAccessFlags::PUBLIC;
        let flags = |flags: MethodAccessFlags| MethodModel::new(flags, "t", "()V");
        let private = flags(MethodAccessFlags::PRIVATE | MethodAccessFlags::STATIC);
        owner.methods.push(private.clone());
        assert!(!accessible("a/A", &owner, &private));
        let public = flags(MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC);
        assert!(accessible("a/A", &owner, &public));
        let package = flags(MethodAccessFlags::STATIC);
        assert!(!accessible("a/A", &owner, &package));
        assert!(accessible("b/C", &owner, &package));
    }
}
