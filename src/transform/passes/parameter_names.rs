use crate::jvm::code::{Element, LocalVariableEntry};
use crate::jvm::model::ClassModel;
use crate::jvm::{BaseType, FieldType, RefType, RenderDescriptor};
use crate::transform::passes::is_reserved;
use crate::transform::{Category, TransformContext, TransformError, Transformer};
use crate::util::Width;
use std::collections::HashMap;

/// Names `this` and the parameters of methods which have no local variable table
///
/// Names come from the parameter types: `String` becomes `string`, `int[]` becomes `intArray`.
/// Types appearing more than once get numbered (`string1`, `string2`).
pub struct ParameterNames;

impl Transformer for ParameterNames {
    fn name(&self) -> &'static str {
        "parameter-names"
    }

    fn category(&self) -> Category {
        Category::GenericCleanup
    }

    fn description(&self) -> &'static str {
        "Gives names to method parameters based on their type"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        let mut named = 0;
        for method in &mut class.methods {
            let descriptor = method.parsed_descriptor()?;
            let has_this = !method.is_static();
            let code = match &mut method.code {
                Some(code) if code.local_variables.is_empty() => code,
                _ => continue,
            };
            if descriptor.parameters.is_empty() && !has_this {
                continue;
            }

            let start = match code.elements.first() {
                Some(Element::Label(label)) => *label,
                _ => {
                    let label = code.fresh_label();
                    code.elements.insert(0, Element::Label(label));
                    label
                }
            };
            let end = match code.elements.last() {
                Some(Element::Label(label)) if code.elements.len() > 1 => *label,
                _ => {
                    let label = code.fresh_label();
                    code.elements.push(Element::Label(label));
                    label
                }
            };

            let mut slot = 0;
            if has_this {
                code.local_variables.push(LocalVariableEntry {
                    start,
                    end,
                    name: String::from("this"),
                    descriptor: FieldType::object(class.name.clone()).render(),
                    index: 0,
                });
                slot += 1;
                named += 1;
            }

            let mut counts: HashMap<&FieldType, usize> = HashMap::new();
            for parameter in &descriptor.parameters {
                *counts.entry(parameter).or_default() += 1;
            }
            let mut numbering: HashMap<&FieldType, usize> = HashMap::new();
            for parameter in &descriptor.parameters {
                let mut name = type_name(parameter);
                if counts[parameter] > 1 {
                    let number = numbering.entry(parameter).or_default();
                    *number += 1;
                    name.push_str(&number.to_string());
                }
                code.local_variables.push(LocalVariableEntry {
                    start,
                    end,
                    name,
                    descriptor: parameter.render(),
                    index: slot as u16,
                });
                slot += parameter.width();
                named += 1;
            }
            code.max_locals = code.max_locals.max(slot as u16);
        }

        if named > 0 {
            ctx.log(&class.name, format!("named {} locals", named));
        }
        Ok(named > 0)
    }
}

/// Lower camel case name for a value of the given type
fn type_name(field_type: &FieldType) -> String {
    let mut name = match field_type {
        FieldType::Base(base_type) => base_type_name(*base_type).to_owned(),
        FieldType::Ref(RefType::Object(class)) => simple_name(class),
        FieldType::Ref(RefType::PrimitiveArray(array)) => {
            let mut name = base_type_name(array.element_type).to_owned();
            for _ in 0..=array.additional_dimensions {
                name.push_str("Array");
            }
            name
        }
        FieldType::Ref(RefType::ObjectArray(array)) => {
            let mut name = simple_name(&array.element_type);
            for _ in 0..=array.additional_dimensions {
                name.push_str("Array");
            }
            name
        }
    };

    if let Some(first) = name.chars().next() {
        if first.is_uppercase() {
            name = first.to_lowercase().chain(name.chars().skip(1)).collect();
        }
    }
    if is_reserved(&name) {
        name.insert(0, '_');
    }
    name
}

fn base_type_name(base_type: BaseType) -> &'static str {
    match base_type {
        BaseType::Byte => "byte",
        BaseType::Char => "char",
        BaseType::Double => "double",
        BaseType::Float => "float",
        BaseType::Int => "int",
        BaseType::Long => "long",
        BaseType::Short => "short",
        BaseType::Boolean => "boolean",
    }
}

fn simple_name(class: &str) -> String {
    let simple = class.rsplit('/').next().unwrap_or(class);
    simple.replace('$', "")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{BranchInstruction, Code};
    use crate::jvm::model::MethodModel;
    use crate::jvm::{MethodAccessFlags, ParseDescriptor};
    use crate::transform::ClassIndex;

    #[test]
    fn names_follow_types() {
        let name = |descriptor: &str| type_name(&FieldType::parse(descriptor).unwrap());
        assert_eq!(name("Ljava/lang/String;"), "string");
        assert_eq!(name("[I"), "intArray");
        assert_eq!(name("[[Lcom/x/Outer$Inner;"), "outerInnerArrayArray");
        assert_eq!(name("I"), "_int");
        assert_eq!(name("Z"), "_boolean");
    }

    #[test]
    fn parameters_get_numbered_and_wide_slots_are_skipped() {
        let mut code = Code::new();
        code.max_locals = 5;
        code.elements = vec![Element::Branch(BranchInstruction::Return)];
        let mut method = MethodModel::new(
            MethodAccessFlags::PUBLIC,
            "m",
            "(Ljava/lang/String;JLjava/lang/String;)V",
        );
        method.code = Some(code);
        let mut class = ClassModel::new("a/Thing", Some("java/lang/Object"));
        class.methods.push(method);

        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(ParameterNames.transform_class(&mut class, &mut ctx).unwrap());

        let code = class.methods[0].code.as_ref().unwrap();
        let names: Vec<(&str, u16)> = code
            .local_variables
            .iter()
            .map(|entry| (entry.name.as_str(), entry.index))
            .collect();
        assert_eq!(
            names,
            vec![("this", 0), ("string1", 1), ("_long", 2), ("string2", 4)]
        );
        assert_eq!(code.local_variables[0].descriptor, "La/Thing;");
        assert_eq!(code.elements.len(), 3);

        assert!(!ParameterNames.transform_class(&mut class, &mut ctx).unwrap());
    }
}
