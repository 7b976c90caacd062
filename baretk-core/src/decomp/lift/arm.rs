//! ARM lifting.
//!
//! Data-processing forms read `rd = rn op op2`. `cmp`, `cmn`, `tst`, `teq`
//! and the `s`-suffixed forms set the tracked flags; every other write goes
//! through [`Flags::preserve`]. A predicated instruction becomes an `if` over
//! the flags in force. Writes to `pc` become returns or indirect jumps, and
//! `pc` reads as the instruction address plus 8.

use super::{
    address_of, flags_condition, is_flag_temp, operand_value, same_register, Flags, Lifter,
};
use crate::decoder::{FlowKind, Instruction, MemoryOperand, Operand, Operation};
use crate::decomp::ast::{BinaryOp, Expr, Statement, UnaryOp};

#[derive(Debug, Clone, Copy, Default)]
pub struct ArmLifter;

const PC: &str = "pc";

/// Flag-setting data-processing or multiply form (`subs`, `muls`).
fn sets_flags(insn: &Instruction) -> bool {
    use Operation as Op;
    match insn.operation {
        Op::Compare | Op::Test => true,
        Op::And
        | Op::Xor
        | Op::Sub
        | Op::Add
        | Op::AddCarry
        | Op::SubBorrow
        | Op::Or
        | Op::Move
        | Op::Not
        | Op::Mul => insn.mnemonic.ends_with('s'),
        _ => false,
    }
}

/// Offsets of the first slot of a block transfer and of the base writeback.
fn block_layout(mode: &str, count: i64) -> (i64, i64) {
    match mode {
        "ia" => (0, 4 * count),
        "ib" => (4, 4 * count),
        "da" => (4 - 4 * count, -4 * count),
        _ => (-4 * count, -4 * count),
    }
}

fn registers(mask: u16) -> impl Iterator<Item = &'static str> {
    (0..16u32)
        .filter(move |i| mask & (1 << i) != 0)
        .map(crate::decoder::arm::register_name)
}

impl ArmLifter {
    fn value(insn: &Instruction, op: &Operand) -> Expr {
        match op {
            Operand::Register(r) if r.name == PC => Expr::Const(insn.address as i64 + 8),
            Operand::Memory(m) => {
                let addr: Expr = Self::address(insn, m);
                if m.size == 0 {
                    addr
                } else {
                    Expr::deref(addr, m.size)
                }
            }
            other => operand_value(other),
        }
    }

    fn value_at(insn: &Instruction, i: usize) -> Option<Expr> {
        insn.operands.get(i).map(|op| Self::value(insn, op))
    }

    /// Effective address; literal-pool loads resolve to a constant.
    fn address(insn: &Instruction, m: &MemoryOperand) -> Expr {
        match (m.base, m.index) {
            (Some(base), None) if base.name == PC => {
                Expr::Const((insn.address as i64 + 8).wrapping_add(m.displacement))
            }
            _ => address_of(m),
        }
    }

    /// Write that leaves the flags untouched; writes to `pc` transfer control.
    fn write(
        insn: &Instruction,
        out: &mut Vec<Statement>,
        flags: &mut Flags,
        dst: Expr,
        src: Expr,
    ) {
        if dst == Expr::Reg(PC) {
            Self::transfer(insn, src, out);
            return;
        }
        flags.preserve(&dst, &same_register, out);
        out.push(Statement::Assign { dst, src });
    }

    fn transfer(insn: &Instruction, target: Expr, out: &mut Vec<Statement>) {
        let from_stack: bool = match &target {
            Expr::Deref { addr, .. } => **addr == Expr::Reg("sp"),
            _ => false,
        };
        let returns: bool = insn.flow == FlowKind::Return
            || matches!(insn.operation, Operation::Return | Operation::Pop)
            || target == Expr::Reg("lr")
            || from_stack;
        if returns {
            out.push(Statement::Return);
        } else {
            out.push(Statement::Intrinsic {
                name: "jump",
                args: vec![target],
            });
        }
    }

    /// `rd = rn op op2` for the sixteen data-processing opcodes.
    fn data_processing(insn: &Instruction, rn: Expr, op2: Expr) -> Option<Expr> {
        let carry = || Expr::intrinsic("carry", Vec::new());
        let borrow = || Expr::intrinsic("not_carry", Vec::new());
        let base: &str = insn.mnemonic.trim_end_matches('s');
        Some(match base {
            "and" => Expr::binary(BinaryOp::And, rn, op2),
            "eor" => Expr::binary(BinaryOp::Xor, rn, op2),
            "sub" => Expr::binary(BinaryOp::Sub, rn, op2),
            "rsb" => Expr::binary(BinaryOp::Sub, op2, rn),
            "add" => Expr::binary(BinaryOp::Add, rn, op2),
            "adc" => Expr::binary(BinaryOp::Add, Expr::binary(BinaryOp::Add, rn, op2), carry()),
            "sbc" => Expr::binary(BinaryOp::Sub, Expr::binary(BinaryOp::Sub, rn, op2), borrow()),
            "rsc" => Expr::binary(BinaryOp::Sub, Expr::binary(BinaryOp::Sub, op2, rn), borrow()),
            "orr" => Expr::binary(BinaryOp::Or, rn, op2),
            "bic" => Expr::binary(BinaryOp::And, rn, Expr::unary(UnaryOp::Not, op2)),
            _ => return None,
        })
    }

    /// `ldr`/`str` with pre-indexed writeback and post-indexed forms.
    fn single(&self, insn: &Instruction, flags: &mut Flags, out: &mut Vec<Statement>) {
        let (Some(Operand::Register(rd)), Some(Operand::Memory(m))) =
            (insn.operands.first(), insn.operands.get(1))
        else {
            return;
        };
        let base: Option<Expr> = m.base.map(|b| Expr::Reg(b.name));
        let access: Expr = match (&base, m.writeback) {
            (Some(base), true) => {
                Self::write(insn, out, flags, base.clone(), Self::address(insn, m));
                Expr::deref(base.clone(), m.size)
            }
            _ => Self::value(insn, &insn.operands[1]),
        };
        // post-indexed step
        let step: Option<Expr> = Self::value_at(insn, 2);

        let mut pc_target: Option<Expr> = None;
        if insn.operation == Operation::Load {
            let src: Expr = if m.size < 4 {
                let signed: bool = insn.mnemonic.starts_with("ldrs");
                Expr::cast(signed, m.size, 4, access)
            } else {
                access
            };
            if rd.name == PC {
                pc_target = Some(src);
            } else {
                Self::write(insn, out, flags, Expr::Reg(rd.name), src);
            }
        } else {
            let value: Expr = Self::value(insn, &insn.operands[0]);
            let value: Expr = if m.size < 4 {
                Expr::cast(false, 4, m.size, value)
            } else {
                value
            };
            Self::write(insn, out, flags, access, value);
        }
        if let (Some(base), Some(step)) = (base, step) {
            let next: Expr = Expr::binary(BinaryOp::Add, base.clone(), step);
            Self::write(insn, out, flags, base, next);
        }
        if let Some(target) = pc_target {
            Self::transfer(insn, target, out);
        }
    }

    /// `push`, `pop`, `ldm` and `stm`.
    fn block(&self, insn: &Instruction, flags: &mut Flags, out: &mut Vec<Statement>) {
        let Some(Operand::RegisterList(mask)) = insn.operands.last() else {
            return;
        };
        let list: Vec<&'static str> = registers(*mask).collect();
        match insn.operation {
            Operation::Push => {
                out.push(Statement::Intrinsic {
                    name: "push",
                    args: list.iter().map(|r| Self::value(insn, &reg(*r))).collect(),
                });
                return;
            }
            Operation::Pop => {
                for r in list.iter().copied().filter(|r| *r != PC) {
                    let src: Expr = Expr::intrinsic("pop", Vec::new());
                    Self::write(insn, out, flags, Expr::Reg(r), src);
                }
                if list.contains(&PC) {
                    Self::transfer(insn, Expr::intrinsic("pop", Vec::new()), out);
                }
                return;
            }
            _ => {}
        }

        let Some(Operand::Memory(m)) = insn.operands.first() else {
            return;
        };
        let Some(base) = m.base.map(|b| b.name) else {
            return;
        };
        let (first, writeback) = block_layout(&insn.mnemonic[3..], list.len() as i64);
        let slot = |k: usize| {
            let offset: i64 = first + 4 * k as i64;
            Expr::deref(Expr::binary(BinaryOp::Add, Expr::Reg(base), Expr::Const(offset)), 4)
        };
        let load: bool = insn.operation == Operation::Load;
        let mut pc_target: Option<Expr> = None;
        for (k, r) in list.iter().copied().enumerate() {
            match (load, r == PC) {
                (true, true) => pc_target = Some(slot(k)),
                (true, false) => Self::write(insn, out, flags, Expr::Reg(r), slot(k)),
                (false, _) => {
                    let value: Expr = Self::value(insn, &reg(r));
                    Self::write(insn, out, flags, slot(k), value);
                }
            }
        }
        // A loaded base keeps the loaded value.
        if m.writeback && !(load && list.contains(&base)) {
            let next: Expr =
                Expr::binary(BinaryOp::Add, Expr::Reg(base), Expr::Const(writeback));
            Self::write(insn, out, flags, Expr::Reg(base), next);
        }
        if let Some(target) = pc_target {
            Self::transfer(insn, target, out);
        }
    }

    /// Effects of `insn` as if its condition held.
    #[inline(never)] // Large function - don't inline
    fn effects(&self, insn: &Instruction, flags: &mut Flags, out: &mut Vec<Statement>) {
        use Operation as Op;

        let ops = &insn.operands;
        let value = |i: usize| Self::value_at(insn, i);
        let dst: Option<Expr> = match ops.first() {
            Some(Operand::Register(r)) => Some(Expr::Reg(r.name)),
            _ => None,
        };

        match insn.operation {
            Op::Nop => {}
            Op::Compare => {
                if let (Some(a), Some(b)) = (value(0), value(1)) {
                    *flags = if insn.mnemonic == "cmn" {
                        Flags::Compare(a, Expr::unary(UnaryOp::Neg, b))
                    } else {
                        Flags::Compare(a, b)
                    };
                }
            }
            Op::Test => {
                if let (Some(a), Some(b)) = (value(0), value(1)) {
                    *flags = if insn.mnemonic == "teq" {
                        Flags::Result(Expr::binary(BinaryOp::Xor, a, b))
                    } else {
                        Flags::Test(a, b)
                    };
                }
            }
            Op::Load | Op::Store | Op::Push | Op::Pop => {
                if matches!(ops.last(), Some(Operand::RegisterList(_))) {
                    self.block(insn, flags, out);
                } else {
                    self.single(insn, flags, out);
                }
            }
            Op::Move | Op::Not | Op::Mul | Op::And | Op::Xor | Op::Sub | Op::Add | Op::Or
            | Op::AddCarry | Op::SubBorrow => {
                let Some(dst) = dst else {
                    return;
                };
                let result: Option<Expr> = match insn.operation {
                    Op::Move => value(1),
                    Op::Not => value(1).map(|v| Expr::unary(UnaryOp::Not, v)),
                    Op::Mul => match (value(1), value(2), value(3)) {
                        (Some(a), Some(b), Some(acc)) => Some(Expr::binary(
                            BinaryOp::Add,
                            Expr::binary(BinaryOp::Mul, a, b),
                            acc,
                        )),
                        (Some(a), Some(b), None) => Some(Expr::binary(BinaryOp::Mul, a, b)),
                        _ => None,
                    },
                    _ => match (value(1), value(2)) {
                        (Some(rn), Some(op2)) => Self::data_processing(insn, rn, op2),
                        _ => None,
                    },
                };
                let Some(result) = result else {
                    out.push(Statement::Asm(insn.to_string()));
                    return;
                };
                if !sets_flags(insn) || dst == Expr::Reg(PC) {
                    Self::write(insn, out, flags, dst, result);
                    return;
                }
                out.push(Statement::Assign {
                    dst: dst.clone(),
                    src: result,
                });
                *flags = match insn.operation {
                    Op::Mul => Flags::Unknown,
                    _ => Flags::Result(dst),
                };
            }
            Op::Jump => match ops.first() {
                Some(Operand::Address(_)) | None => {}
                Some(target) => Self::transfer(insn, Self::value(insn, target), out),
            },
            Op::Return => out.push(Statement::Return),
            Op::Call => {
                let target: Option<Expr> = match insn.target {
                    Some(t) => Some(Expr::Const(t as i64)),
                    None => value(0),
                };
                if let Some(target) = target {
                    out.push(Statement::Call { target });
                }
                *flags = Flags::Unknown;
            }
            Op::SystemCall => {
                out.push(Statement::Intrinsic {
                    name: insn.mnemonic,
                    args: ops.iter().map(|op| Self::value(insn, op)).collect(),
                });
                *flags = Flags::Unknown;
            }
            // mrs / msr move between a register and a status register.
            Op::Other if matches!(insn.mnemonic, "mrs" | "msr") => {
                if let (Some(dst), Some(src)) = (dst, value(1)) {
                    Self::write(insn, out, flags, dst, src);
                }
                if insn.mnemonic == "msr" {
                    *flags = Flags::Unknown;
                }
            }
            // long multiplies
            Op::Other => {
                let args: Vec<Expr> = ops.iter().map(|op| Self::value(insn, op)).collect();
                for d in ops.iter().take(2) {
                    flags.preserve(&operand_value(d), &same_register, out);
                }
                out.push(Statement::Intrinsic {
                    name: insn.mnemonic,
                    args,
                });
                if insn.mnemonic.ends_with('s') {
                    *flags = Flags::Unknown;
                }
            }
            _ => {
                log::debug!("no lifting for {} at 0x{:x}", insn, insn.address);
                out.push(Statement::Asm(insn.to_string()));
                *flags = Flags::Unknown;
            }
        }
    }
}

fn reg(name: &'static str) -> Operand {
    Operand::Register(crate::decoder::Register::new(name, 4))
}

impl Lifter for ArmLifter {
    fn lift(&self, insn: &Instruction, flags: &mut Flags, out: &mut Vec<Statement>) {
        let Some(cc) = insn.condition else {
            self.effects(insn, flags, out);
            return;
        };
        let cond: Expr = flags_condition(cc, flags);
        let mut body: Vec<Statement> = Vec::new();
        self.effects(insn, flags, &mut body);
        // Flag operands are saved whether or not the condition holds.
        let (saved, then_body): (Vec<Statement>, Vec<Statement>) =
            body.into_iter().partition(is_flag_temp);
        out.extend(saved);
        out.push(Statement::If {
            cond,
            then_body,
            else_body: Vec::new(),
        });
        if sets_flags(insn) {
            *flags = Flags::Unknown;
        }
    }

    fn condition(&self, insn: &Instruction, flags: &Flags) -> Expr {
        match insn.operation {
            Operation::Branch(cc) => flags_condition(cc, flags),
            _ => Expr::intrinsic("unknown_condition", Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::arm::ArmDecoder;
    use crate::decoder::Decoder;
    use crate::decomp::ast::CompareOp;
    use crate::decomp::lift::lift_block;
    use crate::disasm::BasicBlock;
    use crate::loader::Endianness;
    use smallvec::SmallVec;

    fn lift(words: &[u32]) -> (Vec<Statement>, Option<Expr>) {
        let mut insns: Vec<Instruction> = Vec::new();
        let mut addr: u64 = 0x8000;
        for w in words {
            let (insn, len) = ArmDecoder
                .decode(&w.to_le_bytes(), addr, Endianness::Little)
                .unwrap();
            insns.push(insn);
            addr += len as u64;
        }
        let block = BasicBlock {
            id: 0,
            start: 0x8000,
            end: addr,
            instructions: insns,
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
        };
        let lifted = lift_block(&ArmLifter, &block, true);
        (lifted.statements, lifted.condition)
    }

    fn assign(dst: Expr, src: Expr) -> Statement {
        Statement::Assign { dst, src }
    }

    #[test]
    fn compare_feeds_conditional_branch() {
        // cmp r0, #5; ble +0
        let (stmts, cond) = lift(&[0xe350_0005, 0xdaff_ffff]);
        assert!(stmts.is_empty());
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Le, Expr::Reg("r0"), Expr::Const(5)))
        );
    }

    #[test]
    fn predicated_move_becomes_if() {
        // cmp r0, #0; moveq r0, #1
        let (stmts, _) = lift(&[0xe350_0000, 0x03a0_0001]);
        assert_eq!(
            stmts,
            vec![
                assign(Expr::Reg("flags_lhs"), Expr::Reg("r0")),
                // The condition is read before the guarded write.
                Statement::If {
                    cond: Expr::compare(CompareOp::Eq, Expr::Reg("r0"), Expr::Const(0)),
                    then_body: vec![assign(Expr::Reg("r0"), Expr::Const(1))],
                    else_body: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn flag_setting_subtract_drives_the_loop_test() {
        // subs r2, r2, #1; bne +0
        let (stmts, cond) = lift(&[0xe252_2001, 0x1aff_ffff]);
        assert_eq!(
            stmts,
            vec![assign(
                Expr::Reg("r2"),
                Expr::binary(BinaryOp::Sub, Expr::Reg("r2"), Expr::Const(1))
            )]
        );
        assert_eq!(
            cond,
            Some(Expr::compare(CompareOp::Ne, Expr::Reg("r2"), Expr::Const(0)))
        );
    }

    #[test]
    fn shifter_operand_and_reverse_subtract() {
        // add r0, r1, r2, lsl #2
        let (stmts, _) = lift(&[0xe081_0102]);
        let shifted = Expr::binary(BinaryOp::Shl, Expr::Reg("r2"), Expr::Const(2));
        assert_eq!(
            stmts,
            vec![assign(
                Expr::Reg("r0"),
                Expr::binary(BinaryOp::Add, Expr::Reg("r1"), shifted)
            )]
        );
        // rsb r0, r0, #0
        let (stmts, _) = lift(&[0xe260_0000]);
        assert_eq!(
            stmts,
            vec![assign(
                Expr::Reg("r0"),
                Expr::binary(BinaryOp::Sub, Expr::Const(0), Expr::Reg("r0"))
            )]
        );
    }

    #[test]
    fn returns_and_stack_traffic() {
        // push {r4, lr}; pop {r4, pc}
        let (stmts, _) = lift(&[0xe92d_4010, 0xe8bd_8010]);
        assert_eq!(
            stmts,
            vec![
                Statement::Intrinsic {
                    name: "push",
                    args: vec![Expr::Reg("r4"), Expr::Reg("lr")],
                },
                assign(Expr::Reg("r4"), Expr::intrinsic("pop", Vec::new())),
                Statement::Return,
            ]
        );
        // mov pc, lr
        assert_eq!(lift(&[0xe1a0_f00e]).0, vec![Statement::Return]);
    }

    #[test]
    fn predicated_return_is_guarded() {
        // cmp r0, #0; bxeq lr
        let (stmts, cond) = lift(&[0xe350_0000, 0x012f_ff1e]);
        assert_eq!(cond, None);
        assert_eq!(
            stmts,
            vec![Statement::If {
                cond: Expr::compare(CompareOp::Eq, Expr::Reg("r0"), Expr::Const(0)),
                then_body: vec![Statement::Return],
                else_body: Vec::new(),
            }]
        );
    }

    #[test]
    fn loads_with_writeback_and_literal_pool() {
        // ldr r0, [r1], #4
        let (stmts, _) = lift(&[0xe491_0004]);
        assert_eq!(
            stmts,
            vec![
                assign(Expr::Reg("r0"), Expr::deref(Expr::Reg("r1"), 4)),
                assign(
                    Expr::Reg("r1"),
                    Expr::binary(BinaryOp::Add, Expr::Reg("r1"), Expr::Const(4))
                ),
            ]
        );
        // ldr r0, [pc, #4] at 0x8000 reads 0x800c
        let (stmts, _) = lift(&[0xe59f_0004]);
        assert_eq!(
            stmts,
            vec![assign(Expr::Reg("r0"), Expr::deref(Expr::Const(0x800c), 4))]
        );
    }
}
