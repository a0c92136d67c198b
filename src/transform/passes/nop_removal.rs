use crate::jvm::code::{Element, Instruction};
use crate::jvm::model::ClassModel;
use crate::transform::{for_each_analyzable_method, Category, TransformContext, TransformError, Transformer};

/// Removes `nop` instructions
pub struct NopRemoval;

impl Transformer for NopRemoval {
    fn name(&self) -> &'static str {
        "nop-removal"
    }

    fn category(&self) -> Category {
        Category::GenericCleanup
    }

    fn description(&self) -> &'static str {
        "Removes nop instructions"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        for_each_analyzable_method(class, ctx, |class_name, _, method, _, ctx| {
            let code = match method.code.as_mut() {
                Some(code) => code,
                None => return Ok(false),
            };
            let before = code.elements.len();
            code.elements
                .retain(|element| !matches!(element, Element::Insn(Instruction::Nop)));
            let removed = before - code.elements.len();
            if removed > 0 {
                ctx.log(
                    class_name,
                    format!("removed {} nops from {}{}", removed, method.name, method.descriptor),
                );
            }
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{BranchInstruction, Code};
    use crate::jvm::model::MethodModel;
    use crate::jvm::MethodAccessFlags;
    use crate::transform::ClassIndex;

    #[test]
    fn nops_go_and_handlers_covering_only_nops_follow() {
        let mut code = Code::new();
        let start = code.fresh_label();
        let end = code.fresh_label();
        let handler = code.fresh_label();
        code.elements = vec![
            Element::Label(start),
            Element::Insn(Instruction::Nop),
            Element::Label(end),
            Element::Insn(Instruction::Nop),
            Element::Branch(BranchInstruction::Return),
            Element::Label(handler),
            Element::Insn(Instruction::Pop),
            Element::Branch(BranchInstruction::Return),
        ];
        code.handlers.push(crate::jvm::code::Handler {
            start,
            end,
            handler,
            catch_type: None,
        });
        code.max_stack = 1;
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "m", "()V");
        method.code = Some(code);
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        class.methods.push(method);

        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(NopRemoval.transform_class(&mut class, &mut ctx).unwrap());
        assert_eq!(ctx.take_log("a/A").len(), 1);

        let code = class.methods[0].code.as_ref().unwrap();
        assert!(code.handlers.is_empty());
        assert_eq!(
            code.instructions().map(|(_, element)| element).collect::<Vec<_>>(),
            vec![&Element::Branch(BranchInstruction::Return)]
        );
        assert!(!NopRemoval.transform_class(&mut class, &mut ctx).unwrap());
    }
}
