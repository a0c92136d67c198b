use crate::analysis::AnalysisError;
use crate::jvm::code::{Code, Element, Label};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

pub type BlockId = usize;

/// Maximal run of elements with one entry and one exit
///
/// Blocks always contain at least one instruction. Labels which don't start a block of their own
/// (eg. labels that only anchor debug information) are just part of the block around them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Range of elements (labels included) covered by the block
    pub elements: Range<usize>,

    /// Element index of the first instruction
    pub first_instruction: usize,

    /// Element index of the last instruction
    pub last_instruction: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    FallThrough,
    Branch,
    Exception,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
}

/// Basic blocks of a method, in code order, plus the edges between them
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<Edge>,

    /// Blocks from which execution can run past the last instruction
    pub falls_off_end: Vec<BlockId>,

    block_of_element: Vec<Option<BlockId>>,
    label_positions: HashMap<Label, usize>,
}

impl ControlFlowGraph {
    /// Split a method body into blocks
    ///
    /// Fails if a label used by a branch or handler is not placed exactly once.
    pub fn build(code: &Code) -> Result<ControlFlowGraph, AnalysisError> {
        let mut label_positions = HashMap::new();
        for (idx, element) in code.elements.iter().enumerate() {
            if let Element::Label(label) = element {
                if label_positions.insert(*label, idx).is_some() {
                    return Err(AnalysisError::BadLabel(*label));
                }
            }
        }
        let position = |label: &Label| -> Result<usize, AnalysisError> {
            label_positions
                .get(label)
                .copied()
                .ok_or(AnalysisError::BadLabel(*label))
        };

        let mut leaders: BTreeSet<usize> = BTreeSet::new();
        leaders.insert(0);
        for label in code.control_labels() {
            leaders.insert(position(&label)?);
        }
        for (idx, element) in code.elements.iter().enumerate() {
            if let Element::Branch(_) = element {
                leaders.insert(idx + 1);
            }
        }
        let len = code.elements.len();
        leaders.insert(len);

        let mut blocks = vec![];
        let mut block_of_element = vec![None; len];
        let leaders: Vec<usize> = leaders.into_iter().filter(|idx| *idx <= len).collect();
        for window in leaders.windows(2) {
            let (start, end) = (window[0], window[1]);
            let mut instructions = (start..end).filter(|idx| code.elements[*idx].is_instruction());
            let first_instruction = match instructions.next() {
                Some(first) => first,
                None => continue,
            };
            let last_instruction = instructions.last().unwrap_or(first_instruction);
            let id = blocks.len();
            for slot in &mut block_of_element[start..end] {
                *slot = Some(id);
            }
            blocks.push(BasicBlock {
                elements: start..end,
                first_instruction,
                last_instruction,
            });
        }

        let mut cfg = ControlFlowGraph {
            blocks,
            edges: vec![],
            falls_off_end: vec![],
            block_of_element,
            label_positions,
        };

        let mut edges: Vec<Edge> = vec![];
        let mut falls_off_end = vec![];
        for (id, block) in cfg.blocks.iter().enumerate() {
            let falls_through = match &code.elements[block.last_instruction] {
                Element::Branch(branch) => {
                    for target in branch.targets() {
                        match cfg.block_of_label(&target) {
                            Some(to) => edges.push(Edge {
                                from: id,
                                to,
                                kind: EdgeKind::Branch,
                            }),
                            None => falls_off_end.push(id),
                        }
                    }
                    branch.falls_through()
                }
                _ => true,
            };
            if falls_through {
                if id + 1 < cfg.blocks.len() {
                    edges.push(Edge {
                        from: id,
                        to: id + 1,
                        kind: EdgeKind::FallThrough,
                    });
                } else {
                    falls_off_end.push(id);
                }
            }
        }

        for handler in &code.handlers {
            let range = cfg.label_position(&handler.start).unwrap_or(0)
                ..cfg.label_position(&handler.end).unwrap_or(0);
            let to = match cfg.block_of_label(&handler.handler) {
                Some(to) => to,
                None => continue,
            };
            for (from, block) in cfg.blocks.iter().enumerate() {
                if range.contains(&block.first_instruction) {
                    edges.push(Edge {
                        from,
                        to,
                        kind: EdgeKind::Exception,
                    });
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        edges.retain(|edge| seen.insert(*edge));
        falls_off_end.dedup();
        cfg.edges = edges;
        cfg.falls_off_end = falls_off_end;
        Ok(cfg)
    }

    pub fn entry(&self) -> Option<BlockId> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    pub fn successors(&self, block: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |edge| edge.from == block)
    }

    pub fn predecessors(&self, block: BlockId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |edge| edge.to == block)
    }

    /// Block containing an element (labels after the last instruction belong to no block)
    pub fn block_of(&self, element: usize) -> Option<BlockId> {
        self.block_of_element.get(element).copied().flatten()
    }

    /// Element index at which a label is placed
    pub fn label_position(&self, label: &Label) -> Option<usize> {
        self.label_positions.get(label).copied()
    }

    /// Block that execution enters when jumping to a label
    ///
    /// A label followed by no instruction leads nowhere (`None`).
    pub fn block_of_label(&self, label: &Label) -> Option<BlockId> {
        let position = self.label_position(label)?;
        let idx = self
            .blocks
            .partition_point(|block| block.last_instruction < position);
        if idx < self.blocks.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Does the type-checker expect a stack map frame at the start of this block?
    ///
    /// Jump and handler targets need one, and so does every block that isn't entered by falling
    /// through (which includes unreachable code after an unconditional branch).
    pub fn needs_frame(&self, block: BlockId) -> bool {
        let mut fall_through = false;
        for edge in self.predecessors(block) {
            match edge.kind {
                EdgeKind::FallThrough => fall_through = true,
                EdgeKind::Branch | EdgeKind::Exception => return true,
            }
        }
        block != 0 && !fall_through
    }

    /// Labels placed before the first instruction of a block
    pub fn head_labels(&self, code: &Code, block: BlockId) -> Vec<Label> {
        let block = &self.blocks[block];
        code.elements[block.elements.start..block.first_instruction]
            .iter()
            .filter_map(|element| match element {
                Element::Label(label) => Some(*label),
                _ => None,
            })
            .collect()
    }

    /// Which blocks can be reached from the entry, following every kind of edge
    pub fn reachable(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.blocks.len()];
        let mut to_visit: Vec<BlockId> = self.entry().into_iter().collect();
        while let Some(block) = to_visit.pop() {
            if reachable[block] {
                continue;
            }
            reachable[block] = true;
            for edge in self.successors(block) {
                if !reachable[edge.to] {
                    to_visit.push(edge.to);
                }
            }
        }
        reachable
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Handler, Instruction, OrdComparison};

    /// ```text
    ///     iload_0
    ///     ifeq L1
    ///     iconst_1
    ///     ireturn
    /// L2: iconst_2     <- unreachable
    ///     ireturn
    /// L1: iconst_0
    ///     ireturn
    /// ```
    fn diamond() -> Code {
        let mut code = Code::new();
        let l1 = code.fresh_label();
        let l2 = code.fresh_label();
        code.elements = vec![
            Element::Insn(Instruction::ILoad(0)),
            Element::Branch(BranchInstruction::If(OrdComparison::EQ, l1)),
            Element::Insn(Instruction::IConst1),
            Element::Branch(BranchInstruction::IReturn),
            Element::Label(l2),
            Element::Insn(Instruction::IConst2),
            Element::Branch(BranchInstruction::IReturn),
            Element::Label(l1),
            Element::Insn(Instruction::IConst0),
            Element::Branch(BranchInstruction::IReturn),
        ];
        code
    }

    #[test]
    fn blocks_and_edges() {
        let cfg = ControlFlowGraph::build(&diamond()).unwrap();
        assert_eq!(cfg.blocks.len(), 4);
        assert_eq!(cfg.blocks[0].elements, 0..2);
        assert_eq!(cfg.block_of(5), Some(2));
        let successors: Vec<_> = cfg.successors(0).map(|edge| (edge.to, edge.kind)).collect();
        assert_eq!(
            successors,
            vec![(3, EdgeKind::Branch), (1, EdgeKind::FallThrough)]
        );
        assert_eq!(cfg.reachable(), vec![true, true, false, true]);
        assert!(cfg.falls_off_end.is_empty());
    }

    #[test]
    fn exception_edges_make_handlers_reachable() {
        let mut code = diamond();
        let start = code.fresh_label();
        let end = code.fresh_label();
        let handler = code.fresh_label();
        code.elements.insert(0, Element::Label(start));
        code.elements.insert(3, Element::Label(end));
        code.elements.extend(vec![
            Element::Label(handler),
            Element::Insn(Instruction::Pop),
            Element::Insn(Instruction::IConst3),
            Element::Branch(BranchInstruction::IReturn),
        ]);
        code.handlers.push(Handler {
            start,
            end,
            handler,
            catch_type: None,
        });

        let cfg = ControlFlowGraph::build(&code).unwrap();
        let handler_block = cfg.block_of_label(&handler).unwrap();
        assert!(cfg
            .predecessors(handler_block)
            .any(|edge| edge.from == 0 && edge.kind == EdgeKind::Exception));
        assert!(cfg.reachable()[handler_block]);
    }

    #[test]
    fn unplaced_and_duplicate_labels() {
        let mut code = diamond();
        code.elements.remove(7);
        assert!(matches!(
            ControlFlowGraph::build(&code),
            Err(AnalysisError::BadLabel(_))
        ));

        let mut code = diamond();
        let twice = code.fresh_label();
        code.elements.push(Element::Label(twice));
        code.elements.push(Element::Label(twice));
        assert!(matches!(
            ControlFlowGraph::build(&code),
            Err(AnalysisError::BadLabel(_))
        ));
    }

    #[test]
    fn falling_off_the_end() {
        let mut code = Code::new();
        code.elements = vec![Element::Insn(Instruction::IConst0)];
        let cfg = ControlFlowGraph::build(&code).unwrap();
        assert_eq!(cfg.falls_off_end, vec![0]);
    }
}
