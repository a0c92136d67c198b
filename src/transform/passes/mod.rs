//! Built-in transformers, plus the pieces several of them share

mod anti_tamper;
mod control_flow;
mod mappings;
mod metadata;
mod nop_removal;
mod parameter_names;
mod reflection;
mod remap;
mod renaming;
mod string_decryption;

pub use anti_tamper::AntiTamperRemoval;
pub use control_flow::ControlFlowNormalization;
pub use mappings::{Mappings, MappingsError, MappingsRemapper};
pub use metadata::MetadataSanitization;
pub use nop_removal::NopRemoval;
pub use parameter_names::ParameterNames;
pub use reflection::ReflectionResolution;
pub use remap::Remapping;
pub use renaming::RenamingNormalization;
pub use string_decryption::StringDecryption;

use crate::analysis::Value;
use crate::jvm::code::{Element, Instruction};
use crate::util::Width;

/// Instructions that pop the given stack values, topmost first
fn pops_for(values: &[&Value]) -> Vec<Element> {
    let mut pops = vec![];
    let mut pending_narrow = false;
    for value in values {
        if value.width() == 2 {
            if pending_narrow {
                pops.push(Element::Insn(Instruction::Pop));
                pending_narrow = false;
            }
            pops.push(Element::Insn(Instruction::Pop2));
        } else if pending_narrow {
            pops.push(Element::Insn(Instruction::Pop2));
            pending_narrow = false;
        } else {
            pending_narrow = true;
        }
    }
    if pending_narrow {
        pops.push(Element::Insn(Instruction::Pop));
    }
    pops
}

fn push_width(insn: &Instruction) -> usize {
    use Instruction::*;
    match insn {
        LConst0 | LConst1 | DConst0 | DConst1 | Ldc2(_) | LLoad(_) | DLoad(_) => 2,
        _ => 1,
    }
}

/// Remove pushes whose value is immediately popped again, returning whether anything went
///
/// Only adjacent elements are considered: a label in between means the pop may be reached with a
/// different value on the stack.
fn drop_dead_pushes(elements: &mut Vec<Element>) -> bool {
    let mut changed = false;
    let mut idx = 0;
    while idx < elements.len() {
        let removed = match &elements[idx..] {
            [Element::Insn(push), Element::Insn(Instruction::Pop), ..]
                if push.is_pure_push() && push_width(push) == 1 =>
            {
                2
            }
            [Element::Insn(push), Element::Insn(Instruction::Pop2), ..]
                if push.is_pure_push() && push_width(push) == 2 =>
            {
                2
            }
            [Element::Insn(push1), Element::Insn(push2), Element::Insn(Instruction::Pop2), ..]
                if push1.is_pure_push()
                    && push2.is_pure_push()
                    && push_width(push1) == 1
                    && push_width(push2) == 1 =>
            {
                3
            }
            _ => 0,
        };
        if removed > 0 {
            elements.drain(idx..idx + removed);
            changed = true;
            // The pop may now follow an earlier push
            idx = idx.saturating_sub(2);
        } else {
            idx += 1;
        }
    }
    changed
}

/// Java keywords and literals, which are not usable as identifiers
pub const RESERVED_IDENTIFIERS: [&str; 58] = [
    "abstract",
    "continue",
    "for",
    "new",
    "switch",
    "assert",
    "default",
    "if",
    "package",
    "synchronized",
    "boolean",
    "do",
    "goto",
    "private",
    "this",
    "break",
    "double",
    "implements",
    "protected",
    "throw",
    "byte",
    "else",
    "import",
    "public",
    "throws",
    "case",
    "enum",
    "instanceof",
    "return",
    "transient",
    "catch",
    "extends",
    "int",
    "short",
    "try",
    "char",
    "final",
    "interface",
    "static",
    "void",
    "class",
    "finally",
    "long",
    "strictfp",
    "volatile",
    "const",
    "float",
    "native",
    "super",
    "while",
    "_",
    "true",
    "false",
    "null",
    "var",
    "yield",
    "record",
    "sealed",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_IDENTIFIERS.contains(&name)
}

/// Could this name appear in Java source?
pub fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => (),
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$') && !is_reserved(name)
}

/// Does this simple name look like an obfuscator produced it?
pub fn is_obfuscated_name(name: &str, min_length: usize) -> bool {
    name.chars().count() <= min_length || !is_java_identifier(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::VerificationType;

    #[test]
    fn pops_pair_up_narrow_values() {
        let int = Value::int(1);
        let long = Value::long(1);
        assert_eq!(
            pops_for(&[&int, &int, &long, &int]),
            vec![
                Element::Insn(Instruction::Pop2),
                Element::Insn(Instruction::Pop2),
                Element::Insn(Instruction::Pop),
            ]
        );
        let reference = Value::unknown(VerificationType::Null);
        assert_eq!(pops_for(&[&reference]), vec![Element::Insn(Instruction::Pop)]);
    }

    #[test]
    fn dead_pushes_cascade() {
        let mut elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::LConst0),
            Element::Insn(Instruction::Pop2),
            Element::Insn(Instruction::Pop2),
            Element::Insn(Instruction::IConst2),
        ];
        assert!(drop_dead_pushes(&mut elements));
        assert_eq!(elements, vec![Element::Insn(Instruction::IConst2)]);
        assert!(!drop_dead_pushes(&mut elements));
    }

    #[test]
    fn obfuscated_names() {
        assert!(is_obfuscated_name("a", 2));
        assert!(is_obfuscated_name("if", 2));
        assert!(is_obfuscated_name("do", 1));
        assert!(is_obfuscated_name("0bad", 2));
        assert!(!is_obfuscated_name("count", 2));
        assert!(!is_obfuscated_name("ab", 1));
    }
}
