//! Expression Lifting
//!
//! Turns the instructions of one basic block into [`Statement`]s plus, for
//! blocks ending in a conditional branch, the condition under which the
//! branch is taken.
//!
//! # Algorithm
//! 1. Walk the block; at each position first offer the next two instructions
//!    to [`Lifter::combine`], else lift one instruction with [`Lifter::lift`]
//! 2. Compares and tests only update the tracked [`Flags`]; the conditional
//!    branch ending the block reads them through [`Lifter::condition`]. A
//!    conditional branch without a static target is lifted like any other
//!    instruction
//! 3. Fold the statement list (see [`fold`])
//!
//! Lifting never fails: anything a lifter does not model is kept as
//! [`Statement::Asm`].

pub mod arm;
pub mod riscv;
pub mod x86;

use super::ast::{BinaryOp, CompareOp, Expr, Lifted, Statement};
use crate::decoder::{
    Condition, FlowKind, Instruction, MemoryOperand, Operand, ShiftAmount, ShiftKind,
};
use crate::disasm::BasicBlock;
use crate::loader::Machine;

/// What the last flag-setting instruction compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flags {
    Unknown,
    /// `cmp a, b`
    Compare(Expr, Expr),
    /// `test a, b`
    Test(Expr, Expr),
    /// Flags describe this value (result of an arithmetic instruction)
    Result(Expr),
}

/// Temporaries that keep flag operands alive across a clobbering write.
const FLAG_TEMPS: [&str; 2] = ["flags_lhs", "flags_rhs"];

impl Flags {
    fn operands_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Flags::Compare(a, b) | Flags::Test(a, b) => vec![a, b],
            Flags::Result(v) => vec![v],
            Flags::Unknown => Vec::new(),
        }
    }

    /// Prepare for a write to `dst` that leaves the flags untouched.
    ///
    /// Flag operands that read `dst` are copied into temporaries first, so the
    /// condition consuming the flags still sees the values that were compared.
    /// `overlaps(a, b)` tells whether registers `a` and `b` share storage.
    pub fn preserve(
        &mut self,
        dst: &Expr,
        overlaps: &dyn Fn(&str, &str) -> bool,
        out: &mut Vec<Statement>,
    ) {
        let clobbered = |e: &Expr| -> bool {
            match dst {
                Expr::Reg(written) => e.mentions_any(&|r| overlaps(r, *written)),
                _ => e.reads_memory(),
            }
        };
        let mut spilled: Vec<(Expr, &'static str)> = Vec::new();
        for (slot, temp) in self.operands_mut().into_iter().zip(FLAG_TEMPS) {
            if !clobbered(&*slot) {
                continue;
            }
            // `test r, r` keeps a single temporary for both operands.
            let reuse: Option<&'static str> =
                spilled.iter().find(|(v, _)| *v == *slot).map(|(_, t)| *t);
            if let Some(temp) = reuse {
                *slot = Expr::Reg(temp);
                continue;
            }
            let value: Expr = std::mem::replace(slot, Expr::Reg(temp));
            out.push(Statement::Assign {
                dst: Expr::Reg(temp),
                src: value.clone(),
            });
            spilled.push((value, temp));
        }
    }
}

/// True for the temporaries written by [`Flags::preserve`].
pub(crate) fn is_flag_temp(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Assign { dst: Expr::Reg(r), .. } if FLAG_TEMPS.contains(r))
}

/// Register overlap for instruction sets without partial registers.
pub(crate) fn same_register(a: &str, b: &str) -> bool {
    a == b
}

/// Per-architecture instruction semantics.
pub trait Lifter: Send + Sync {
    /// Lift one instruction, appending to `out` and updating `flags`.
    fn lift(&self, insn: &Instruction, flags: &mut Flags, out: &mut Vec<Statement>);

    /// Condition under which the conditional branch `insn` is taken.
    fn condition(&self, insn: &Instruction, flags: &Flags) -> Expr;

    /// Lift a recognised pair of adjacent instructions as a unit.
    fn combine(&self, _first: &Instruction, _second: &Instruction) -> Option<Lifted> {
        None
    }
}

/// Select the lifter for a machine type.
pub fn lifter_for(machine: Machine) -> Option<Box<dyn Lifter>> {
    match machine {
        Machine::X86 => Some(Box::new(x86::X86Lifter { word_size: 4 })),
        Machine::Amd64 => Some(Box::new(x86::X86Lifter { word_size: 8 })),
        Machine::RiscV32 => Some(Box::new(riscv::RiscVLifter { word_size: 4 })),
        Machine::RiscV64 => Some(Box::new(riscv::RiscVLifter { word_size: 8 })),
        Machine::Arm => Some(Box::new(arm::ArmLifter)),
        Machine::Aarch64 | Machine::Unknown => None,
    }
}

/// Lifted form of one basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiftedBlock {
    pub statements: Vec<Statement>,
    /// Taken-condition of the conditional branch ending the block
    pub condition: Option<Expr>,
}

/// Lift a whole block.
pub fn lift_block(lifter: &dyn Lifter, block: &BasicBlock, fold_expressions: bool) -> LiftedBlock {
    let insns: &[Instruction] = &block.instructions;
    let mut statements: Vec<Statement> = Vec::with_capacity(insns.len());
    let mut flags: Flags = Flags::Unknown;
    let mut condition: Option<Expr> = None;

    let mut i: usize = 0;
    while i < insns.len() {
        let insn: &Instruction = &insns[i];
        if let Some(pair) = insns.get(i + 1).and_then(|next| lifter.combine(insn, next)) {
            statements.extend(pair);
            i += 2;
            continue;
        }
        // Predicated returns and indirect jumps lift to an `if` of their own.
        if insn.flow == FlowKind::ConditionalBranch && insn.target.is_some() {
            condition = Some(lifter.condition(insn, &flags));
        } else {
            lifter.lift(insn, &mut flags, &mut statements);
        }
        i += 1;
    }

    if fold_expressions {
        statements = fold(statements);
        condition = condition.map(Expr::simplify);
    }
    LiftedBlock {
        statements,
        condition,
    }
}

/// Fold a straight-line statement list.
///
/// - every expression is simplified (constant folding, identities)
/// - `r = a; r = f(r)` becomes `r = f(a)`; when `f` does not read `r` the
///   first assignment is dead and dropped
pub fn fold(statements: Vec<Statement>) -> Vec<Statement> {
    let mut out: Vec<Statement> = Vec::with_capacity(statements.len());
    for stmt in statements {
        let stmt: Statement = match stmt {
            Statement::Assign { dst, src } => Statement::Assign {
                dst: dst.simplify(),
                src: src.simplify(),
            },
            Statement::Call { target } => Statement::Call {
                target: target.simplify(),
            },
            Statement::Intrinsic { name, args } => Statement::Intrinsic {
                name,
                args: args.into_iter().map(Expr::simplify).collect(),
            },
            other => other,
        };

        if let Statement::Assign {
            dst: Expr::Reg(r),
            src,
        } = &stmt
        {
            if let Some(Statement::Assign {
                dst: Expr::Reg(prev),
                src: prev_src,
            }) = out.last()
            {
                if prev == r {
                    let merged: Expr = src.substitute(r, prev_src).simplify();
                    let reg: &'static str = *r;
                    out.pop();
                    out.push(Statement::Assign {
                        dst: Expr::Reg(reg),
                        src: merged,
                    });
                    continue;
                }
            }
        }
        out.push(stmt);
    }
    out
}

/// Expression for a memory operand's effective address.
pub(crate) fn address_of(mem: &MemoryOperand) -> Expr {
    let mut addr: Option<Expr> = mem.base.map(|b| Expr::Reg(b.name));
    if let Some((index, scale)) = mem.index {
        let scaled: Expr = if scale > 1 {
            Expr::binary(BinaryOp::Mul, Expr::Reg(index.name), Expr::Const(i64::from(scale)))
        } else {
            Expr::Reg(index.name)
        };
        addr = Some(match addr {
            Some(a) => Expr::binary(BinaryOp::Add, a, scaled),
            None => scaled,
        });
    }
    let mut addr: Expr = match addr {
        Some(a) if mem.displacement != 0 => {
            Expr::binary(BinaryOp::Add, a, Expr::Const(mem.displacement))
        }
        Some(a) => a,
        None => Expr::Const(mem.displacement),
    };
    if let Some(seg @ ("fs" | "gs")) = mem.segment {
        addr = Expr::binary(BinaryOp::Add, Expr::Reg(seg), addr);
    }
    addr
}

/// Value of an operand; memory operands read memory.
pub(crate) fn operand_value(op: &Operand) -> Expr {
    match op {
        Operand::Register(r) => Expr::Reg(r.name),
        Operand::Immediate(v) => Expr::Const(*v),
        Operand::Address(a) => Expr::Const(*a as i64),
        Operand::Memory(m) if m.size == 0 => address_of(m),
        Operand::Memory(m) => Expr::deref(address_of(m), m.size),
        Operand::Shifted { reg, kind, amount } => {
            let value: Expr = Expr::Reg(reg.name);
            let amount: Expr = match amount {
                ShiftAmount::Immediate(n) => Expr::Const(i64::from(*n)),
                ShiftAmount::Register(r) => Expr::Reg(r.name),
            };
            let op: BinaryOp = match kind {
                ShiftKind::Lsl => BinaryOp::Shl,
                ShiftKind::Lsr => BinaryOp::Shr,
                ShiftKind::Asr => BinaryOp::Sar,
                ShiftKind::Ror => BinaryOp::Ror,
                ShiftKind::Rrx => return Expr::intrinsic("rrx", vec![value]),
            };
            Expr::binary(op, value, amount)
        }
        Operand::RegisterList(mask) => Expr::Const(i64::from(*mask)),
    }
}

/// Width in bytes of an operand, `None` for immediates and addresses.
pub(crate) fn operand_size(op: &Operand) -> Option<u8> {
    match op {
        Operand::Register(r) => Some(r.size),
        Operand::Memory(m) if m.size > 0 => Some(m.size),
        _ => None,
    }
}

/// Condition `a cc b` for a compare-and-branch or a `cmp`.
pub(crate) fn compare_condition(cc: Condition, a: Expr, b: Expr) -> Expr {
    let op: CompareOp = match cc {
        Condition::Equal => CompareOp::Eq,
        Condition::NotEqual => CompareOp::Ne,
        Condition::Below => CompareOp::LtUnsigned,
        Condition::AboveEqual => CompareOp::GeUnsigned,
        Condition::BelowEqual => CompareOp::LeUnsigned,
        Condition::Above => CompareOp::GtUnsigned,
        Condition::Less => CompareOp::Lt,
        Condition::GreaterEqual => CompareOp::Ge,
        Condition::LessEqual => CompareOp::Le,
        Condition::Greater => CompareOp::Gt,
        Condition::Sign | Condition::NotSign => {
            let diff: Expr = Expr::binary(BinaryOp::Sub, a, b);
            return value_condition(cc, diff);
        }
        _ => return flag_intrinsic(cc, vec![Expr::binary(BinaryOp::Sub, a, b)]),
    };
    Expr::compare(op, a, b)
}

/// Condition on flags that describe a single value `v` (after `test v, v` or
/// an arithmetic instruction).
pub(crate) fn value_condition(cc: Condition, v: Expr) -> Expr {
    let zero = Expr::Const(0);
    match cc {
        Condition::Equal | Condition::BelowEqual => Expr::compare(CompareOp::Eq, v, zero),
        Condition::NotEqual | Condition::Above => Expr::compare(CompareOp::Ne, v, zero),
        Condition::Sign | Condition::Less => Expr::compare(CompareOp::Lt, v, zero),
        Condition::NotSign | Condition::GreaterEqual => Expr::compare(CompareOp::Ge, v, zero),
        Condition::LessEqual => Expr::compare(CompareOp::Le, v, zero),
        Condition::Greater => Expr::compare(CompareOp::Gt, v, zero),
        // Carry and overflow are clear after a logical operation.
        Condition::Below | Condition::Overflow => Expr::Const(0),
        Condition::AboveEqual | Condition::NotOverflow => Expr::Const(1),
        Condition::Parity | Condition::NotParity => flag_intrinsic(cc, vec![v]),
    }
}

/// Condition the tracked flags cannot express directly.
pub(crate) fn flag_intrinsic(cc: Condition, args: Vec<Expr>) -> Expr {
    let name: &'static str = match cc {
        Condition::Overflow => "overflow",
        Condition::NotOverflow => "not_overflow",
        Condition::Below => "carry",
        Condition::AboveEqual => "not_carry",
        Condition::Equal => "zero",
        Condition::NotEqual => "not_zero",
        Condition::BelowEqual => "below_equal",
        Condition::Above => "above",
        Condition::Sign => "sign",
        Condition::NotSign => "not_sign",
        Condition::Parity => "parity",
        Condition::NotParity => "not_parity",
        Condition::Less => "less",
        Condition::GreaterEqual => "greater_equal",
        Condition::LessEqual => "less_equal",
        Condition::Greater => "greater",
    };
    Expr::intrinsic(name, args)
}

/// Condition `cc` under the tracked flag state.
pub(crate) fn flags_condition(cc: Condition, flags: &Flags) -> Expr {
    match flags {
        Flags::Compare(a, b) => compare_condition(cc, a.clone(), b.clone()),
        Flags::Test(a, b) if a == b => value_condition(cc, a.clone()),
        Flags::Test(a, b) => {
            value_condition(cc, Expr::binary(BinaryOp::And, a.clone(), b.clone()))
        }
        Flags::Result(v) => match cc {
            Condition::Equal
            | Condition::NotEqual
            | Condition::Sign
            | Condition::NotSign
            | Condition::Less
            | Condition::GreaterEqual
            | Condition::LessEqual
            | Condition::Greater => value_condition(cc, v.clone()),
            _ => flag_intrinsic(cc, Vec::new()),
        },
        Flags::Unknown => flag_intrinsic(cc, Vec::new()),
    }
}
