//! Decompiler
//!
//! Turns a [`Disassembly`] into a [`Decomp`]: per function, a tree of
//! [`Statement`]s rendered as pseudocode or C.
//!
//! # Pipeline
//! 1. **Structure** ([`structure`]): loops, conditionals and gotos per function
//! 2. **Lift** ([`lift`]): each block's instructions become statements, the
//!    branch ending it becomes a condition
//! 3. **Lower**: the structured tree is filled in with the lifted blocks;
//!    calls to known functions are named
//! 4. **Refine**: an endless loop whose header only tests a condition with
//!    one arm breaking out becomes a `while` loop
//! 5. **Emit** ([`emit`]): text in the requested [`Language`]

pub mod ast;
pub mod dominators;
pub mod emit;
pub mod lift;
pub mod structure;

pub use ast::{Expr, FunctionBody, LoopKind, Statement};
pub use structure::{structure, structure_all, StructuredNode, StructuredTree};

use crate::config::AnalysisConfig;
use crate::disasm::{BlockId, ControlFlowGraph, Disassembly};
use crate::error::{BaretkError, Result};
use lift::{lift_block, lifter_for, LiftedBlock, Lifter};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Output dialect. The discriminants are part of the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub enum Language {
    #[default]
    Pseudocode = 0,
    C = 1,
}

impl Language {
    /// Language for a C ABI tag; unknown tags fall back to pseudocode.
    pub fn from_raw(raw: u32) -> Language {
        match raw {
            1 => Language::C,
            _ => Language::Pseudocode,
        }
    }
}

impl FromStr for Language {
    type Err = BaretkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "C" | "c" => Ok(Language::C),
            "pseudo" | "pseudocode" => Ok(Language::Pseudocode),
            other => Err(BaretkError::Config {
                message: format!("unknown language `{}` (expected C or pseudocode)", other),
            }),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Language::Pseudocode => "pseudocode",
            Language::C => "C",
        })
    }
}

/// Decompiled program. Owns the [`Disassembly`] it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomp {
    disassembly: Disassembly,
    language: Language,
    trees: Vec<StructuredTree>,
    functions: Vec<FunctionBody>,
}

impl Decomp {
    /// The disassembly this result was built from.
    pub fn disassembly(&self) -> &Disassembly {
        &self.disassembly
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Structured control flow per function, in function order.
    pub fn trees(&self) -> &[StructuredTree] {
        &self.trees
    }

    /// Decompiled functions in address order.
    pub fn functions(&self) -> &[FunctionBody] {
        &self.functions
    }

    /// Render in the language chosen at decompile time.
    pub fn text(&self) -> String {
        emit::render(&self.functions, self.language)
    }

    /// Render in another dialect.
    pub fn render(&self, language: Language) -> String {
        emit::render(&self.functions, language)
    }

    pub fn into_disassembly(self) -> Disassembly {
        self.disassembly
    }
}

/// Decompile with the default configuration.
pub fn decompile(disassembly: Disassembly, language: Language) -> Result<Decomp> {
    decompile_with(disassembly, language, &AnalysisConfig::default())
}

/// Decompile a disassembly.
///
/// # Errors
/// - `EmptyControlFlow` when the disassembly has no blocks
/// - `UnsupportedMachine` when no lifter exists for the machine type
#[inline(never)] // Large function - don't inline
pub fn decompile_with(
    disassembly: Disassembly,
    language: Language,
    config: &AnalysisConfig,
) -> Result<Decomp> {
    let cfg: &ControlFlowGraph = disassembly.cfg();
    if cfg.is_empty() {
        return Err(BaretkError::EmptyControlFlow);
    }
    let machine = disassembly.program().machine();
    let lifter: Box<dyn Lifter> = lifter_for(machine).ok_or_else(|| {
        BaretkError::UnsupportedMachine {
            machine: machine.to_string(),
        }
    })?;
    log::info!(
        "decompiling {} function(s) to {}",
        disassembly.functions().len(),
        language
    );

    let trees: Vec<StructuredTree> =
        structure_all(cfg, disassembly.functions(), config.parallel);

    let lift_one = |id: usize| -> LiftedBlock {
        let block = &cfg.blocks()[id];
        lift_block(lifter.as_ref(), block, config.fold_expressions)
    };
    let lifted: Vec<LiftedBlock> = if config.parallel {
        (0..cfg.len()).into_par_iter().map(lift_one).collect()
    } else {
        (0..cfg.len()).map(lift_one).collect()
    };

    let names: HashMap<u64, String> = disassembly
        .functions()
        .iter()
        .map(|f| (f.address, f.name.clone()))
        .collect();
    let lowering = Lowering {
        cfg,
        lifted: &lifted,
        names: &names,
    };
    let functions: Vec<FunctionBody> = trees
        .iter()
        .map(|tree| FunctionBody {
            name: tree.name.clone(),
            address: tree.address,
            body: lowering.lower(&tree.nodes),
        })
        .collect();

    let statements: usize = functions.iter().map(|f| f.body.len()).sum();
    log::info!(
        "decompiled {} function(s), {} top-level statement(s)",
        functions.len(),
        statements
    );
    Ok(Decomp {
        disassembly,
        language,
        trees,
        functions,
    })
}

/// Fills a structured tree with lifted block contents.
struct Lowering<'a> {
    cfg: &'a ControlFlowGraph,
    lifted: &'a [LiftedBlock],
    names: &'a HashMap<u64, String>,
}

impl Lowering<'_> {
    fn address(&self, id: BlockId) -> u64 {
        self.cfg.block(id).map_or(0, |b| b.start)
    }

    fn block(&self, id: BlockId) -> Option<&LiftedBlock> {
        self.lifted.get(id as usize)
    }

    /// Calls to a known function entry use its name.
    fn name_call(&self, stmt: &Statement) -> Statement {
        match stmt {
            Statement::Call {
                target: Expr::Const(addr),
            } => match self.names.get(&(*addr as u64)) {
                Some(name) => Statement::Call {
                    target: Expr::Symbol(name.clone()),
                },
                None => stmt.clone(),
            },
            other => other.clone(),
        }
    }

    fn lower(&self, nodes: &[StructuredNode]) -> Vec<Statement> {
        let mut out: Vec<Statement> = Vec::new();
        for node in nodes {
            match node {
                StructuredNode::Block(id) => {
                    if let Some(block) = self.block(*id) {
                        out.extend(block.statements.iter().map(|s| self.name_call(s)));
                    }
                }
                StructuredNode::Label(id) => out.push(Statement::Label(self.address(*id))),
                StructuredNode::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    let cond: Expr = self
                        .block(*cond)
                        .and_then(|b| b.condition.clone())
                        .unwrap_or_else(|| Expr::intrinsic("unknown_condition", Vec::new()));
                    let then_body: Vec<Statement> = self.lower(then_branch);
                    let else_body: Vec<Statement> = self.lower(else_branch);
                    match (then_body.is_empty(), else_body.is_empty()) {
                        (true, true) => {}
                        (true, false) => out.push(Statement::If {
                            cond: cond.negate(),
                            then_body: else_body,
                            else_body: Vec::new(),
                        }),
                        _ => out.push(Statement::If {
                            cond,
                            then_body,
                            else_body,
                        }),
                    }
                }
                StructuredNode::Loop { body, .. } => out.push(refine_loop(self.lower(body))),
                StructuredNode::Switch { cases, .. } => out.push(Statement::Switch {
                    cases: cases
                        .iter()
                        .map(|(target, body)| (self.address(*target), self.lower(body)))
                        .collect(),
                }),
                StructuredNode::Break => out.push(Statement::Break),
                StructuredNode::Continue => out.push(Statement::Continue),
                StructuredNode::Goto(id) => out.push(Statement::Goto(self.address(*id))),
            }
        }
        out
    }
}

/// Turn `loop { if c { break } else { body } ... }` into `while !c { body ... }`.
fn refine_loop(mut body: Vec<Statement>) -> Statement {
    let is_break = |arm: &[Statement]| matches!(arm, [Statement::Break]);
    let head: Option<(Expr, Vec<Statement>)> = match body.first() {
        Some(Statement::If {
            cond,
            then_body,
            else_body,
        }) if is_break(then_body) => Some((cond.clone().negate(), else_body.clone())),
        Some(Statement::If {
            cond,
            then_body,
            else_body,
        }) if is_break(else_body) => Some((cond.clone(), then_body.clone())),
        _ => None,
    };
    match head {
        Some((cond, mut inner)) => {
            inner.extend(body.drain(1..));
            Statement::Loop {
                kind: LoopKind::While(cond),
                body: inner,
            }
        }
        None => Statement::Loop {
            kind: LoopKind::Endless,
            body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;
    use crate::loader::{ContainerKind, Endianness, Machine, Permissions, Program, Segment};
    use ast::CompareOp;
    use std::collections::BTreeMap;

    fn amd64(code: &[u8]) -> Disassembly {
        let program = Program {
            container: ContainerKind::Elf,
            endianness: Endianness::Little,
            machine: Machine::Amd64,
            bits: 64,
            entry: 0x1000,
            segments: vec![Segment {
                perm: Permissions::EXEC | Permissions::READ,
                offset: 0,
                vaddr: 0x1000,
                paddr: 0x1000,
                size: code.len(),
            }],
            sections: BTreeMap::new(),
            symbols: Vec::new(),
            image: code.to_vec(),
        };
        disassemble(program).unwrap()
    }

    #[test]
    fn language_names() {
        assert_eq!("c".parse::<Language>().unwrap(), Language::C);
        assert_eq!("pseudo".parse::<Language>().unwrap(), Language::Pseudocode);
        assert!("rust".parse::<Language>().is_err());
        assert_eq!(Language::from_raw(1), Language::C);
        assert_eq!(Language::from_raw(7), Language::Pseudocode);
    }

    #[test]
    fn counting_loop_becomes_while() {
        // 1000: xor ecx, ecx
        // 1002: cmp ecx, 10 ; 1005: jge 0x100b
        // 1007: inc ecx     ; 1009: jmp 0x1002
        // 100b: ret
        let code = [0x31, 0xc9, 0x83, 0xf9, 0x0a, 0x7d, 0x04, 0xff, 0xc1, 0xeb, 0xf7, 0xc3];
        let decomp = decompile(amd64(&code), Language::Pseudocode).unwrap();
        let body = &decomp.functions()[0].body;
        let ecx = Expr::Reg("ecx");
        assert_eq!(
            body,
            &vec![
                Statement::Assign {
                    dst: ecx.clone(),
                    src: Expr::Const(0),
                },
                Statement::Loop {
                    kind: LoopKind::While(Expr::compare(
                        CompareOp::Lt,
                        ecx.clone(),
                        Expr::Const(10)
                    )),
                    body: vec![Statement::Assign {
                        dst: ecx.clone(),
                        src: Expr::binary(ast::BinaryOp::Add, ecx, Expr::Const(1)),
                    }],
                },
                Statement::Return,
            ]
        );
        assert!(decomp.text().contains("while ecx < 0xa:"));
    }

    #[test]
    fn calls_use_function_names() {
        // call 0x1006; ret; ret
        let decomp = decompile(
            amd64(&[0xe8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0xc3]),
            Language::C,
        )
        .unwrap();
        let text = decomp.text();
        assert!(text.contains("void sub_1000(void)"));
        assert!(text.contains("    sub_1006();"));
        assert_eq!(decomp.functions().len(), 2);
    }

    #[test]
    fn decomp_owns_its_disassembly() {
        let d = amd64(&[0xc3]);
        let decomp = decompile(d.clone(), Language::Pseudocode).unwrap();
        assert_eq!(decomp.disassembly(), &d);
        assert_eq!(decomp.into_disassembly(), d);
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let code = [0x31, 0xc9, 0x83, 0xf9, 0x0a, 0x7d, 0x04, 0xff, 0xc1, 0xeb, 0xf7, 0xc3];
        let serial = AnalysisConfig {
            parallel: false,
            ..AnalysisConfig::default()
        };
        let a = decompile_with(amd64(&code), Language::C, &serial).unwrap();
        let b = decompile(amd64(&code), Language::C).unwrap();
        assert_eq!(a.text(), b.text());
    }
}
