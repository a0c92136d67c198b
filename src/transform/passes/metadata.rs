use crate::jvm::code::{Code, Element, LocalVariableEntry};
use crate::jvm::model::ClassModel;
use crate::jvm::signatures::{validate_signature, SignatureKind};
use crate::jvm::{FieldType, ParseDescriptor};
use crate::transform::{Category, TransformContext, TransformError, Transformer};
use crate::util::Width;
use std::collections::HashMap;

/// Drops metadata that decompilers choke on and the JVM ignores
///
///   - generic signatures that don't parse
///   - local variable entries with unplaced labels, inverted ranges, bad descriptors, or slots
///     past `max_locals`
///   - line numbers on unplaced labels
pub struct MetadataSanitization;

impl Transformer for MetadataSanitization {
    fn name(&self) -> &'static str {
        "metadata-sanitization"
    }

    fn category(&self) -> Category {
        Category::GenericCleanup
    }

    fn description(&self) -> &'static str {
        "Removes malformed generic signatures and debug information"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        let mut removed = 0;
        removed += drop_bad_signature(&mut class.signature, SignatureKind::Class);
        for field in &mut class.fields {
            removed += drop_bad_signature(&mut field.signature, SignatureKind::Field);
        }
        for method in &mut class.methods {
            removed += drop_bad_signature(&mut method.signature, SignatureKind::Method);
            if let Some(code) = &mut method.code {
                removed += sanitize_debug_info(code);
            }
        }

        if removed > 0 {
            ctx.log(&class.name, format!("removed {} malformed metadata entries", removed));
        }
        Ok(removed > 0)
    }
}

fn drop_bad_signature(signature: &mut Option<String>, kind: SignatureKind) -> usize {
    if matches!(signature, Some(sig) if !validate_signature(sig, kind)) {
        *signature = None;
        1
    } else {
        0
    }
}

fn sanitize_debug_info(code: &mut Code) -> usize {
    let positions: HashMap<_, _> = code
        .elements
        .iter()
        .enumerate()
        .filter_map(|(idx, element)| match element {
            Element::Label(label) => Some((*label, idx)),
            _ => None,
        })
        .collect();
    let max_locals = code.max_locals as usize;

    let valid_range = |entry: &LocalVariableEntry| -> bool {
        match (positions.get(&entry.start), positions.get(&entry.end)) {
            (Some(start), Some(end)) => start <= end,
            _ => false,
        }
    };

    let before = code.local_variables.len()
        + code.local_variable_types.len()
        + code.line_numbers.len();

    code.local_variables.retain(|entry| {
        let width = match FieldType::parse(&entry.descriptor) {
            Ok(field_type) => field_type.width(),
            Err(_) => return false,
        };
        valid_range(entry) && entry.index as usize + width <= max_locals
    });
    code.local_variable_types.retain(|entry| {
        valid_range(entry)
            && (entry.index as usize) < max_locals
            && validate_signature(&entry.descriptor, SignatureKind::Field)
    });
    code.line_numbers
        .retain(|entry| positions.contains_key(&entry.start));

    before
        - code.local_variables.len()
        - code.local_variable_types.len()
        - code.line_numbers.len()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{BranchInstruction, LineNumberEntry};
    use crate::jvm::model::{FieldModel, MethodModel};
    use crate::jvm::{FieldAccessFlags, MethodAccessFlags};
    use crate::transform::ClassIndex;

    #[test]
    fn garbage_goes_and_good_metadata_stays() {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        class.signature = Some(String::from("<T:Ljava/lang/Object;>Ljava/lang/Object;"));
        let mut field = FieldModel::new(FieldAccessFlags::PRIVATE, "f", "Ljava/util/List;");
        field.signature = Some(String::from("Ljava/util/List<<<;"));
        class.fields.push(field);

        let mut code = Code::new();
        code.max_locals = 1;
        let start = code.fresh_label();
        let end = code.fresh_label();
        let dangling = code.fresh_label();
        code.elements = vec![
            Element::Label(start),
            Element::Branch(BranchInstruction::Return),
            Element::Label(end),
        ];
        code.line_numbers = vec![
            LineNumberEntry { start, line: 1 },
            LineNumberEntry {
                start: dangling,
                line: 2,
            },
        ];
        let local = |name: &str, descriptor: &str, index: u16| LocalVariableEntry {
            start,
            end,
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            index,
        };
        code.local_variables = vec![
            local("x", "I", 0),
            local("y", "J", 0),
            local("z", "Q", 0),
        ];
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "m", "(I)V");
        method.code = Some(code);
        class.methods.push(method);

        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        assert!(MetadataSanitization
            .transform_class(&mut class, &mut ctx)
            .unwrap());

        assert!(class.signature.is_some());
        assert_eq!(class.fields[0].signature, None);
        let code = class.methods[0].code.as_ref().unwrap();
        assert_eq!(code.line_numbers.len(), 1);
        assert_eq!(code.local_variables.len(), 1);
        assert_eq!(code.local_variables[0].name, "x");

        assert!(!MetadataSanitization
            .transform_class(&mut class, &mut ctx)
            .unwrap());
    }
}
