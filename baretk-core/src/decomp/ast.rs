//! Statement and expression tree produced by the decompiler.
//!
//! Registers are untyped machine words; widths only appear on memory accesses
//! (`Deref`) and explicit `Cast`s.

use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivUnsigned,
    Rem,
    RemUnsigned,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    /// Bitwise complement
    Not,
    /// Boolean negation
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LtUnsigned,
    LeUnsigned,
    GtUnsigned,
    GeUnsigned,
}

impl CompareOp {
    pub fn negate(self) -> CompareOp {
        use CompareOp::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Ge => Lt,
            Le => Gt,
            Gt => Le,
            LtUnsigned => GeUnsigned,
            GeUnsigned => LtUnsigned,
            LeUnsigned => GtUnsigned,
            GtUnsigned => LeUnsigned,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            CompareOp::LtUnsigned
                | CompareOp::LeUnsigned
                | CompareOp::GtUnsigned
                | CompareOp::GeUnsigned
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Reg(&'static str),
    Const(i64),
    /// Entry of a known function
    Symbol(String),
    /// Memory read of `size` bytes
    Deref { addr: Box<Expr>, size: u8 },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Width conversion from `from` to `to` bytes
    Cast {
        signed: bool,
        from: u8,
        to: u8,
        operand: Box<Expr>,
    },
    /// Machine operation without an operator form (`carry()`, `mulh(a, b)`)
    Intrinsic { name: &'static str, args: Vec<Expr> },
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn compare(op: CompareOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn deref(addr: Expr, size: u8) -> Expr {
        Expr::Deref {
            addr: Box::new(addr),
            size,
        }
    }

    pub fn cast(signed: bool, from: u8, to: u8, operand: Expr) -> Expr {
        Expr::Cast {
            signed,
            from,
            to,
            operand: Box::new(operand),
        }
    }

    pub fn intrinsic(name: &'static str, args: Vec<Expr>) -> Expr {
        Expr::Intrinsic { name, args }
    }

    /// Boolean negation, pushed into comparisons where possible.
    pub fn negate(self) -> Expr {
        match self {
            Expr::Compare { op, lhs, rhs } => Expr::Compare {
                op: op.negate(),
                lhs,
                rhs,
            },
            Expr::Unary {
                op: UnaryOp::LogicalNot,
                operand,
            } => *operand,
            Expr::Const(v) => Expr::Const(i64::from(v == 0)),
            other => Expr::unary(UnaryOp::LogicalNot, other),
        }
    }

    /// True if register `reg` occurs anywhere in the expression.
    pub fn mentions(&self, reg: &str) -> bool {
        self.mentions_any(&|r| r == reg)
    }

    /// True if any register occurring in the expression satisfies `pred`.
    pub fn mentions_any(&self, pred: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Expr::Reg(r) => pred(r),
            Expr::Const(_) | Expr::Symbol(_) => false,
            Expr::Deref { addr, .. } => addr.mentions_any(pred),
            Expr::Binary { lhs, rhs, .. } | Expr::Compare { lhs, rhs, .. } => {
                lhs.mentions_any(pred) || rhs.mentions_any(pred)
            }
            Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => {
                operand.mentions_any(pred)
            }
            Expr::Intrinsic { args, .. } => args.iter().any(|a| a.mentions_any(pred)),
        }
    }

    /// True if evaluating the expression reads memory.
    pub fn reads_memory(&self) -> bool {
        match self {
            Expr::Deref { .. } => true,
            Expr::Reg(_) | Expr::Const(_) | Expr::Symbol(_) => false,
            Expr::Binary { lhs, rhs, .. } | Expr::Compare { lhs, rhs, .. } => {
                lhs.reads_memory() || rhs.reads_memory()
            }
            Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => operand.reads_memory(),
            Expr::Intrinsic { args, .. } => args.iter().any(Expr::reads_memory),
        }
    }

    /// Replace every occurrence of register `reg` with `with`.
    pub fn substitute(&self, reg: &str, with: &Expr) -> Expr {
        match self {
            Expr::Reg(r) if *r == reg => with.clone(),
            Expr::Reg(_) | Expr::Const(_) | Expr::Symbol(_) => self.clone(),
            Expr::Deref { addr, size } => Expr::deref(addr.substitute(reg, with), *size),
            Expr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, lhs.substitute(reg, with), rhs.substitute(reg, with))
            }
            Expr::Compare { op, lhs, rhs } => {
                Expr::compare(*op, lhs.substitute(reg, with), rhs.substitute(reg, with))
            }
            Expr::Unary { op, operand } => Expr::unary(*op, operand.substitute(reg, with)),
            Expr::Cast {
                signed,
                from,
                to,
                operand,
            } => Expr::cast(*signed, *from, *to, operand.substitute(reg, with)),
            Expr::Intrinsic { name, args } => Expr::Intrinsic {
                name: *name,
                args: args.iter().map(|a| a.substitute(reg, with)).collect(),
            },
        }
    }

    /// Fold constants and drop identities, bottom-up.
    pub fn simplify(self) -> Expr {
        match self {
            Expr::Binary { op, lhs, rhs } => simplify_binary(op, lhs.simplify(), rhs.simplify()),
            Expr::Unary { op, operand } => match (op, operand.simplify()) {
                (UnaryOp::Neg, Expr::Const(v)) => Expr::Const(v.wrapping_neg()),
                (UnaryOp::Not, Expr::Const(v)) => Expr::Const(!v),
                (UnaryOp::LogicalNot, inner) => inner.negate(),
                (op, inner) => Expr::unary(op, inner),
            },
            Expr::Compare { op, lhs, rhs } => Expr::compare(op, lhs.simplify(), rhs.simplify()),
            Expr::Deref { addr, size } => Expr::deref(addr.simplify(), size),
            Expr::Cast {
                signed,
                from,
                to,
                operand,
            } => match operand.simplify() {
                Expr::Const(v) => Expr::Const(convert(v, signed, from, to)),
                inner => Expr::cast(signed, from, to, inner),
            },
            Expr::Intrinsic { name, args } => Expr::Intrinsic {
                name,
                args: args.into_iter().map(Expr::simplify).collect(),
            },
            leaf => leaf,
        }
    }
}

/// Value of a constant after a width conversion.
fn convert(value: i64, signed: bool, from: u8, to: u8) -> i64 {
    let narrow: u8 = from.min(to);
    if narrow >= 8 || narrow == 0 {
        return value;
    }
    let bits: u32 = u32::from(narrow) * 8;
    let shift: u32 = 64 - bits;
    if signed && to > from {
        (value << shift) >> shift
    } else {
        ((value as u64) << shift >> shift) as i64
    }
}

fn simplify_binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    use BinaryOp::*;

    if let (Expr::Const(a), Expr::Const(b)) = (&lhs, &rhs) {
        let (a, b): (i64, i64) = (*a, *b);
        let folded: Option<i64> = match op {
            Add => Some(a.wrapping_add(b)),
            Sub => Some(a.wrapping_sub(b)),
            Mul => Some(a.wrapping_mul(b)),
            And => Some(a & b),
            Or => Some(a | b),
            Xor => Some(a ^ b),
            Shl => Some(a.wrapping_shl(b as u32)),
            Shr => Some(((a as u64).wrapping_shr(b as u32)) as i64),
            Sar => Some(a.wrapping_shr(b as u32)),
            Div if b != 0 => Some(a.wrapping_div(b)),
            Rem if b != 0 => Some(a.wrapping_rem(b)),
            DivUnsigned if b != 0 => Some(((a as u64) / (b as u64)) as i64),
            RemUnsigned if b != 0 => Some(((a as u64) % (b as u64)) as i64),
            _ => None,
        };
        if let Some(v) = folded {
            return Expr::Const(v);
        }
    }

    match (op, &lhs, &rhs) {
        (Xor | Sub, a, b) if a == b => Expr::Const(0),
        (And | Or, a, b) if a == b => lhs,
        (And | Mul, _, Expr::Const(0)) => Expr::Const(0),
        (Add | Sub | Or | Xor | Shl | Shr | Sar | Rol | Ror, _, Expr::Const(0)) => lhs,
        (Add | Or | Xor, Expr::Const(0), _) => rhs,
        (Mul | Div | DivUnsigned, _, Expr::Const(1)) => lhs,
        // (x + a) + b
        (Add | Sub, Expr::Binary { op: Add, lhs: x, rhs: inner }, Expr::Const(b)) => {
            match inner.as_ref() {
                Expr::Const(a) => {
                    let sum: i64 = if op == Add {
                        a.wrapping_add(*b)
                    } else {
                        a.wrapping_sub(*b)
                    };
                    simplify_binary(Add, x.as_ref().clone(), Expr::Const(sum))
                }
                _ => Expr::binary(op, lhs, rhs),
            }
        }
        _ => Expr::binary(op, lhs, rhs),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopKind {
    /// `loop` / `while (1)`; left only through `break`, `goto` or `return`
    Endless,
    /// Runs while the condition holds, tested before each iteration
    While(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `dst` is a register or a `Deref`
    Assign { dst: Expr, src: Expr },
    Call { target: Expr },
    Return,
    /// Effectful machine operation (`syscall()`, `push(rbx)`)
    Intrinsic { name: &'static str, args: Vec<Expr> },
    /// Instruction kept as text
    Asm(String),
    If {
        cond: Expr,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    Loop { kind: LoopKind, body: Vec<Statement> },
    /// Multi-way branch; each case is keyed by its target address
    Switch { cases: Vec<(u64, Vec<Statement>)> },
    Break,
    Continue,
    Goto(u64),
    Label(u64),
}

/// Statements one instruction (or a combined pair) lifts to.
pub type Lifted = SmallVec<[Statement; 2]>;

/// Decompiled body of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBody {
    pub name: String,
    pub address: u64,
    pub body: Vec<Statement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(name: &'static str) -> Expr {
        Expr::Reg(name)
    }

    #[test]
    fn folds_upper_immediate_plus_offset() {
        let e = Expr::binary(BinaryOp::Add, Expr::Const(0x12000), Expr::Const(0x345));
        assert_eq!(e.simplify(), Expr::Const(0x12345));
    }

    #[test]
    fn xor_with_itself_is_zero() {
        let e = Expr::binary(BinaryOp::Xor, reg("eax"), reg("eax"));
        assert_eq!(e.simplify(), Expr::Const(0));
    }

    #[test]
    fn nested_offsets_merge() {
        // (rsp + 8) - 8
        let e = Expr::binary(
            BinaryOp::Sub,
            Expr::binary(BinaryOp::Add, reg("rsp"), Expr::Const(8)),
            Expr::Const(8),
        );
        assert_eq!(e.simplify(), reg("rsp"));
    }

    #[test]
    fn negation_flips_comparisons() {
        let e = Expr::compare(CompareOp::Lt, reg("a0"), Expr::Const(10));
        assert_eq!(
            e.clone().negate(),
            Expr::compare(CompareOp::Ge, reg("a0"), Expr::Const(10))
        );
        assert_eq!(e.clone().negate().negate(), e);
        assert_eq!(
            reg("a0").negate(),
            Expr::unary(UnaryOp::LogicalNot, reg("a0"))
        );
    }

    #[test]
    fn substitute_replaces_every_use() {
        let e = Expr::binary(BinaryOp::Mul, reg("eax"), Expr::deref(reg("eax"), 4));
        let s = e.substitute("eax", &Expr::Const(2));
        assert!(!s.mentions("eax"));
        assert_eq!(
            s,
            Expr::binary(BinaryOp::Mul, Expr::Const(2), Expr::deref(Expr::Const(2), 4))
        );
    }

    #[test]
    fn memory_reads_are_found_at_any_depth() {
        let load = Expr::deref(reg("rbp"), 4);
        assert!(Expr::binary(BinaryOp::Add, reg("eax"), load).reads_memory());
        assert!(!Expr::compare(CompareOp::Lt, reg("eax"), Expr::Const(1)).reads_memory());
        assert!(Expr::cast(true, 4, 8, reg("eax")).mentions_any(&|r| r.ends_with("ax")));
    }

    #[test]
    fn casts_of_constants_fold() {
        assert_eq!(Expr::cast(true, 1, 4, Expr::Const(0xff)).simplify(), Expr::Const(-1));
        assert_eq!(
            Expr::cast(false, 1, 4, Expr::Const(0x1ff)).simplify(),
            Expr::Const(0xff)
        );
        assert_eq!(
            Expr::cast(true, 4, 8, Expr::Const(0x8000_0000)).simplify(),
            Expr::Const(-0x8000_0000)
        );
    }
}
