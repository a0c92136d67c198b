use crate::analysis::{ConstValue, Dataflow, FrameState};
use crate::jvm::code::{BranchInstruction, Element, EqComparison, Instruction, Label};
use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::ConstantPool;
use crate::transform::passes::drop_dead_pushes;
use crate::transform::{
    for_each_analyzable_method, remove_unreachable, Category, TransformContext, TransformError,
    Transformer,
};
use std::collections::{HashMap, HashSet};

/// Rounds of simplification per method before giving up on reaching a fixed point
const MAX_ROUNDS: usize = 64;

/// Longest chain of `goto`s followed when threading a jump
const MAX_THREADING: usize = 16;

/// Undoes control flow bloat
///
/// Each method is simplified in rounds until nothing changes, re-analyzing in between:
///
///   - unreachable instructions are removed (along with handlers left covering nothing)
///   - conditional branches and switches on constant operands become `pop`s plus an optional
///     `goto`
///   - jumps to a `goto` go straight to its target
///   - `goto`s to the next instruction are removed
///   - pushes whose value is immediately popped are removed
pub struct ControlFlowNormalization;

impl Transformer for ControlFlowNormalization {
    fn name(&self) -> &'static str {
        "control-flow-normalization"
    }

    fn category(&self) -> Category {
        Category::ControlFlow
    }

    fn description(&self) -> &'static str {
        "Removes dead code and collapses branches with constant conditions"
    }

    fn transform_class(
        &self,
        class: &mut ClassModel,
        ctx: &mut TransformContext,
    ) -> Result<bool, TransformError> {
        for_each_analyzable_method(class, ctx, |class_name, constants, method, flow, ctx| {
            normalize(class_name, constants, method, flow, ctx, MAX_ROUNDS)
        })
    }
}

/// Simplify a method until nothing changes, returning whether anything did
///
/// A method that has not settled after `max_rounds` (or that stops being analyzable along the
/// way) is put back the way it was and recorded as skipped.
fn normalize(
    class_name: &str,
    constants: &ConstantPool,
    method: &mut MethodModel,
    flow: &Dataflow,
    ctx: &mut TransformContext,
    max_rounds: usize,
) -> Result<bool, TransformError> {
    let options = ctx.dataflow_options();
    let original = method.clone();
    let mut stats = Stats::default();
    let mut reanalyzed: Option<Dataflow> = None;
    let mut settled = false;
    for _ in 0..max_rounds {
        let current = reanalyzed.as_ref().unwrap_or(flow);
        if !simplify(method, current, &mut stats) {
            settled = true;
            break;
        }
        match Dataflow::analyze(class_name, method, constants, ctx.hierarchy, &options) {
            Ok(flow) => reanalyzed = Some(flow),
            Err(err) if err.is_unanalyzable() => {
                *method = original;
                ctx.skip_method(class_name, method, err);
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
    }
    if !settled {
        *method = original;
        ctx.skip_method(
            class_name,
            method,
            format!("no fixed point after {} rounds", max_rounds),
        );
        return Ok(false);
    }

    if stats.is_empty() {
        return Ok(false);
    }
    ctx.log(
        class_name,
        format!(
            "{}{}: removed {} unreachable instructions, folded {} branches, threaded {} jumps, \
             removed {} redundant jumps",
            method.name,
            method.descriptor,
            stats.unreachable,
            stats.folded,
            stats.threaded,
            stats.redundant_jumps
        ),
    );
    Ok(true)
}

#[derive(Default)]
struct Stats {
    unreachable: usize,
    folded: usize,
    threaded: usize,
    redundant_jumps: usize,
    dead_pushes: usize,
}

impl Stats {
    fn is_empty(&self) -> bool {
        self.unreachable + self.folded + self.threaded + self.redundant_jumps + self.dead_pushes
            == 0
    }
}

/// One round of simplification, returning whether anything changed
fn simplify(method: &mut MethodModel, flow: &Dataflow, stats: &mut Stats) -> bool {
    let unreachable = match &method.code {
        Some(code) => code
            .instructions()
            .filter(|(idx, _)| !flow.is_reachable(*idx))
            .count(),
        None => return false,
    };
    if remove_unreachable(method, flow) {
        stats.unreachable += unreachable;
        // Positions in `flow` are stale now
        return true;
    }

    let code = match &mut method.code {
        Some(code) => code,
        None => return false,
    };
    let positions: HashMap<Label, usize> = code
        .elements
        .iter()
        .enumerate()
        .filter_map(|(idx, element)| match element {
            Element::Label(label) => Some((*label, idx)),
            _ => None,
        })
        .collect();

    let mut replacements: Vec<(usize, Vec<Element>)> = vec![];
    for (idx, element) in code.elements.iter().enumerate() {
        let branch = match element {
            Element::Branch(branch) => branch,
            _ => continue,
        };
        let state = match flow.state_before(idx) {
            Some(state) => state,
            None => continue,
        };

        if let Some(replacement) = fold_branch(branch, state) {
            stats.folded += 1;
            replacements.push((idx, replacement));
            continue;
        }

        if let BranchInstruction::Goto(target) = branch {
            let only_labels_between = positions.get(target).map_or(false, |position| {
                *position > idx
                    && code.elements[idx + 1..*position]
                        .iter()
                        .all(|element| !element.is_instruction())
            });
            if only_labels_between {
                stats.redundant_jumps += 1;
                replacements.push((idx, vec![]));
                continue;
            }
        }

        let mut threaded = false;
        let rewritten = branch.map_labels(|label| -> Result<Label, ()> {
            let target = thread(*label, &code.elements, &positions);
            threaded |= target != *label;
            Ok(target)
        });
        if let (Ok(rewritten), true) = (rewritten, threaded) {
            stats.threaded += 1;
            replacements.push((idx, vec![Element::Branch(rewritten)]));
        }
    }

    let changed = !replacements.is_empty();
    for (idx, replacement) in replacements.into_iter().rev() {
        code.elements.splice(idx..idx + 1, replacement);
    }

    let before = code.elements.len();
    if drop_dead_pushes(&mut code.elements) {
        stats.dead_pushes += before - code.elements.len();
        return true;
    }
    changed
}

/// Replacement for a branch whose outcome is known from constant operands
fn fold_branch(branch: &BranchInstruction, state: &FrameState) -> Option<Vec<Element>> {
    use BranchInstruction::*;

    let constant = |depth: usize| state.peek(depth).and_then(|value| value.constant.as_ref());
    let int = |depth: usize| state.peek(depth).and_then(|value| value.int_constant());
    let is_null = |depth: usize| match constant(depth)? {
        ConstValue::Null => Some(true),
        ConstValue::String(_) | ConstValue::Class(_) => Some(false),
        _ => None,
    };

    let (pop, target) = match branch {
        If(comparison, target) => {
            let value = int(0)?;
            (Instruction::Pop, comparison.holds(value, 0).then_some(*target))
        }
        IfICmp(comparison, target) => {
            let (lhs, rhs) = (int(1)?, int(0)?);
            (Instruction::Pop2, comparison.holds(lhs, rhs).then_some(*target))
        }
        IfNull(comparison, target) => {
            let is_null = is_null(0)?;
            let jump = match comparison {
                EqComparison::EQ => is_null,
                EqComparison::NE => !is_null,
            };
            (Instruction::Pop, jump.then_some(*target))
        }
        IfACmp(comparison, target) => {
            // Only two nulls are known to be the same reference
            if !(is_null(0)? && is_null(1)?) {
                return None;
            }
            let jump = *comparison == EqComparison::EQ;
            (Instruction::Pop2, jump.then_some(*target))
        }
        TableSwitch {
            default,
            low,
            targets,
        } => {
            let key = int(0)?;
            let offset = key as i64 - *low as i64;
            let target = usize::try_from(offset)
                .ok()
                .and_then(|offset| targets.get(offset))
                .unwrap_or(default);
            (Instruction::Pop, Some(*target))
        }
        LookupSwitch { default, targets } => {
            let key = int(0)?;
            let target = targets
                .iter()
                .find(|(value, _)| *value == key)
                .map_or(default, |(_, target)| target);
            (Instruction::Pop, Some(*target))
        }
        _ => return None,
    };

    let mut replacement = vec![Element::Insn(pop)];
    if let Some(target) = target {
        replacement.push(Element::Branch(Goto(target)));
    }
    Some(replacement)
}

/// Follow a chain of `goto`s starting at a label
fn thread(label: Label, elements: &[Element], positions: &HashMap<Label, usize>) -> Label {
    let mut current = label;
    let mut seen = HashSet::new();
    for _ in 0..MAX_THREADING {
        if !seen.insert(current) {
            break;
        }
        let next = positions.get(&current).and_then(|position| {
            elements[*position..]
                .iter()
                .find(|element| element.is_instruction())
        });
        match next {
            Some(Element::Branch(BranchInstruction::Goto(target))) if !seen.contains(target) => {
                current = *target;
            }
            _ => break,
        }
    }
    current
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{Code, OrdComparison};
    use crate::jvm::MethodAccessFlags;
    use crate::transform::ClassIndex;
    use crate::verifier::verify;

    fn run(class: &mut ClassModel) -> bool {
        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        ControlFlowNormalization
            .transform_class(class, &mut ctx)
            .unwrap()
    }

    fn class_with(code: Code, descriptor: &str) -> ClassModel {
        let mut method = MethodModel::new(MethodAccessFlags::STATIC, "m", descriptor);
        method.code = Some(code);
        let mut class = ClassModel::new("a/A", Some("java/lang/Object"));
        class.methods.push(method);
        class
    }

    #[test]
    fn unreachable_block_and_jump_over_it_go() {
        let mut code = Code::new();
        let end = code.fresh_label();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Insn(Instruction::Pop),
            Element::Branch(BranchInstruction::Goto(end)),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::IStore(0)),
            Element::Label(end),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut class = class_with(code, "(I)V");
        assert!(run(&mut class));

        let code = class.methods[0].code.as_ref().unwrap();
        let instructions: Vec<&Element> = code.instructions().map(|(_, e)| e).collect();
        assert_eq!(instructions, vec![&Element::Branch(BranchInstruction::Return)]);
        assert!(code.frames.is_empty());
        assert_eq!(verify(&class, &ClassHierarchy::new()), Ok(()));

        assert!(!run(&mut class));
    }

    #[test]
    fn constant_conditions_collapse() {
        let mut code = Code::new();
        let taken = code.fresh_label();
        let switch_default = code.fresh_label();
        let case = code.fresh_label();
        code.max_stack = 2;
        code.elements = vec![
            Element::Insn(Instruction::IConst3),
            Element::Insn(Instruction::IStore(0)),
            Element::Insn(Instruction::ILoad(0)),
            Element::Insn(Instruction::IConst2),
            Element::Branch(BranchInstruction::IfICmp(OrdComparison::GT, taken)),
            Element::Insn(Instruction::IConst0),
            Element::Branch(BranchInstruction::IReturn),
            Element::Label(taken),
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::LookupSwitch {
                default: switch_default,
                targets: vec![(3, case)],
            }),
            Element::Label(switch_default),
            Element::Insn(Instruction::IConst1),
            Element::Branch(BranchInstruction::IReturn),
            Element::Label(case),
            Element::Insn(Instruction::IConst2),
            Element::Branch(BranchInstruction::IReturn),
        ];
        code.max_locals = 1;
        let mut class = class_with(code, "()I");
        assert!(run(&mut class));

        let code = class.methods[0].code.as_ref().unwrap();
        let instructions: Vec<&Element> = code.instructions().map(|(_, e)| e).collect();
        assert_eq!(
            instructions,
            vec![
                &Element::Insn(Instruction::IConst3),
                &Element::Insn(Instruction::IStore(0)),
                &Element::Insn(Instruction::IConst2),
                &Element::Branch(BranchInstruction::IReturn),
            ]
        );
        assert_eq!(verify(&class, &ClassHierarchy::new()), Ok(()));
        assert!(!run(&mut class));
    }

    #[test]
    fn jumps_thread_through_gotos() {
        let mut code = Code::new();
        let hop = code.fresh_label();
        let end = code.fresh_label();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, hop)),
            Element::Insn(Instruction::IInc(0, 1)),
            Element::Branch(BranchInstruction::Return),
            Element::Label(hop),
            Element::Branch(BranchInstruction::Goto(end)),
            Element::Label(end),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut class = class_with(code, "(I)V");
        assert!(run(&mut class));

        let code = class.methods[0].code.as_ref().unwrap();
        assert_eq!(
            code.elements[1],
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, end))
        );
        assert!(!code
            .elements
            .contains(&Element::Branch(BranchInstruction::Goto(end))));
        assert!(code.frames.contains_key(&end));
        assert_eq!(verify(&class, &ClassHierarchy::new()), Ok(()));
    }

    #[test]
    fn unsettled_methods_are_restored_and_skipped() {
        let mut code = Code::new();
        let end = code.fresh_label();
        code.max_stack = 1;
        code.elements = vec![
            Element::Insn(Instruction::IConst0),
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, end)),
            Element::Insn(Instruction::IConst1),
            Element::Insn(Instruction::Pop),
            Element::Label(end),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut class = class_with(code, "()V");
        let before = class.methods[0].clone();

        let index = ClassIndex::new();
        let hierarchy = ClassHierarchy::new();
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        let changed =
            for_each_analyzable_method(&mut class, &mut ctx, |name, constants, method, flow, ctx| {
                normalize(name, constants, method, flow, ctx, 1)
            })
            .unwrap();

        assert!(!changed);
        assert_eq!(class.methods[0], before);
        let skipped = ctx.take_skipped("a/A");
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].method, "m()V");
        assert!(ctx.take_log("a/A").is_empty());

        assert!(run(&mut class));
    }
}
