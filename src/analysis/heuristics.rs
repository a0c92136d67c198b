//! Cheap indicators of obfuscation, computed from instruction counts
//!
//! Each indicator is averaged over the methods with code and compared to a threshold above which
//! ordinary compiler output is rare.

use crate::jvm::code::{BranchInstruction, Element, Instruction};
use crate::jvm::model::ClassModel;
use serde::Serialize;

/// Percentage of jumps relative to member and type references
pub const JUMP_PERCENTAGE_THRESHOLD: f64 = 11.0;

/// `invokedynamic` instructions per method
pub const INVOKE_DYNAMIC_THRESHOLD: f64 = 0.4;

/// `pop2`, `dup2`, `dup_x1`, `dup_x2`, `dup2_x1`, `dup2_x2`, and `swap` per method
pub const RARE_STACK_OPERATION_THRESHOLD: f64 = 0.1;

/// `nop` instructions per method
pub const NOP_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Indicator {
    pub value: f64,
    pub threshold: f64,
    pub exceeded: bool,
}

impl Indicator {
    fn new(value: f64, threshold: f64) -> Indicator {
        let value = (value * 100.0).round() / 100.0;
        Indicator {
            value,
            threshold,
            exceeded: value > threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObfuscationSummary {
    /// Number of methods with code that went into the averages
    pub methods: usize,

    /// Hints at control flow obfuscation
    pub jump_percentage: Indicator,

    /// Hints at reference obfuscation
    pub invoke_dynamics: Indicator,

    /// Hints at control flow obfuscation
    pub rare_stack_operations: Indicator,

    /// Hints at unoptimized (or padded) code
    pub nops: Indicator,
}

impl ObfuscationSummary {
    pub fn any_exceeded(&self) -> bool {
        self.jump_percentage.exceeded
            || self.invoke_dynamics.exceeded
            || self.rare_stack_operations.exceeded
            || self.nops.exceeded
    }
}

#[derive(Default)]
struct MethodCounts {
    jumps: usize,
    references: usize,
    invoke_dynamics: usize,
    rare_stack_operations: usize,
    nops: usize,
}

fn count(elements: &[Element]) -> MethodCounts {
    use Instruction::*;

    let mut counts = MethodCounts::default();
    for element in elements {
        match element {
            Element::Label(_) => (),
            Element::Branch(branch) => {
                let is_jump = branch.is_conditional()
                    || matches!(branch, BranchInstruction::Goto(_) | BranchInstruction::Jsr(_));
                if is_jump {
                    counts.jumps += 1;
                }
            }
            Element::Insn(insn) => match insn {
                GetStatic(_) | PutStatic(_) | GetField(_) | PutField(_) | Invoke(_, _) | New(_)
                | ANewArray(_) | CheckCast(_) | InstanceOf(_) => counts.references += 1,
                InvokeDynamic(_) => counts.invoke_dynamics += 1,
                Pop2 | Dup2 | DupX1 | DupX2 | Dup2X1 | Dup2X2 | Swap => {
                    counts.rare_stack_operations += 1
                }
                Nop => counts.nops += 1,
                _ => (),
            },
        }
    }
    counts
}

/// Summarize a class
pub fn summarize(class: &ClassModel) -> ObfuscationSummary {
    summarize_all(std::iter::once(class))
}

/// Summarize several classes together (methods are weighted equally)
pub fn summarize_all<'a>(classes: impl IntoIterator<Item = &'a ClassModel>) -> ObfuscationSummary {
    let mut methods = 0;
    let mut jump_percentage = 0.0;
    let mut invoke_dynamics = 0.0;
    let mut rare_stack_operations = 0.0;
    let mut nops = 0.0;

    for class in classes {
        for method in &class.methods {
            let code = match &method.code {
                Some(code) => code,
                None => continue,
            };
            let counts = count(&code.elements);
            methods += 1;
            jump_percentage += counts.jumps as f64 / counts.references.max(1) as f64 * 100.0;
            invoke_dynamics += counts.invoke_dynamics as f64;
            rare_stack_operations += counts.rare_stack_operations as f64;
            nops += counts.nops as f64;
        }
    }

    let average = |total: f64| if methods == 0 { 0.0 } else { total / methods as f64 };
    ObfuscationSummary {
        methods,
        jump_percentage: Indicator::new(average(jump_percentage), JUMP_PERCENTAGE_THRESHOLD),
        invoke_dynamics: Indicator::new(average(invoke_dynamics), INVOKE_DYNAMIC_THRESHOLD),
        rare_stack_operations: Indicator::new(
            average(rare_stack_operations),
            RARE_STACK_OPERATION_THRESHOLD,
        ),
        nops: Indicator::new(average(nops), NOP_THRESHOLD),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::Code;
    use crate::jvm::model::MethodModel;
    use crate::jvm::MethodAccessFlags;

    fn class_with(elements: Vec<Element>) -> ClassModel {
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        let mut code = Code::new();
        code.elements = elements;
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "m", "()V");
        method.code = Some(code);
        class.methods.push(method);
        class
            .methods
            .push(MethodModel::new(MethodAccessFlags::ABSTRACT, "n", "()V"));
        class
    }

    #[test]
    fn clean_code_stays_under_thresholds() {
        let summary = summarize(&class_with(vec![Element::Branch(BranchInstruction::Return)]));
        assert_eq!(summary.methods, 1);
        assert!(!summary.any_exceeded());
    }

    #[test]
    fn padded_code_is_flagged() {
        let mut code = Code::new();
        let label = code.fresh_label();
        let summary = summarize(&class_with(vec![
            Element::Insn(Instruction::Nop),
            Element::Insn(Instruction::Nop),
            Element::Label(label),
            Element::Insn(Instruction::Swap),
            Element::Branch(BranchInstruction::Goto(label)),
        ]));
        assert!(summary.nops.exceeded);
        assert_eq!(summary.nops.value, 2.0);
        assert!(summary.rare_stack_operations.exceeded);
        assert!(summary.jump_percentage.exceeded);
        assert!(!summary.invoke_dynamics.exceeded);
    }
}
