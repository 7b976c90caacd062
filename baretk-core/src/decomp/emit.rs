//! Text emission for decompiled functions.
//!
//! Two dialects share one tree walk:
//! - pseudocode: `function f():`, `loop:`, `if c then` ... `end if`
//! - C: C statement and expression syntax, registers as free variables
//!
//! Nested operands of binary operators are always parenthesised, so the
//! output never depends on operator precedence.

use super::ast::{BinaryOp, CompareOp, Expr, FunctionBody, LoopKind, Statement, UnaryOp};
use super::Language;

const INDENT: &str = "    ";

struct Emitter {
    language: Language,
    out: String,
}

fn constant(v: i64) -> String {
    if (-9..=9).contains(&v) {
        v.to_string()
    } else if v < 0 {
        format!("-0x{:x}", v.unsigned_abs())
    } else {
        format!("0x{:x}", v)
    }
}

fn label(addr: u64) -> String {
    format!("L_{:x}", addr)
}

fn c_type(signed: bool, size: u8) -> &'static str {
    match (signed, size) {
        (true, 1) => "int8_t",
        (true, 2) => "int16_t",
        (true, 4) => "int32_t",
        (true, _) => "int64_t",
        (false, 1) => "uint8_t",
        (false, 2) => "uint16_t",
        (false, 4) => "uint32_t",
        (false, _) => "uint64_t",
    }
}

impl Emitter {
    fn pseudo(&self) -> bool {
        self.language == Language::Pseudocode
    }

    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Operand of a binary operator, parenthesised when compound.
    fn operand(&self, e: &Expr) -> String {
        match e {
            Expr::Binary { .. } | Expr::Compare { .. } => format!("({})", self.expr(e)),
            _ => self.expr(e),
        }
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Reg(r) => r.to_string(),
            Expr::Const(v) => constant(*v),
            Expr::Symbol(name) => name.clone(),
            Expr::Deref { addr, size } => {
                if self.pseudo() {
                    format!("u{}[{}]", u32::from(*size) * 8, self.expr(addr))
                } else {
                    format!("*({} *)({})", c_type(false, *size), self.expr(addr))
                }
            }
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            Expr::Unary { op, operand } => {
                let inner: String = self.operand(operand);
                match (op, self.pseudo()) {
                    (UnaryOp::Neg, _) => format!("-{}", inner),
                    (UnaryOp::Not, _) => format!("~{}", inner),
                    (UnaryOp::LogicalNot, true) => format!("not {}", inner),
                    (UnaryOp::LogicalNot, false) => format!("!{}", inner),
                }
            }
            Expr::Compare { op, lhs, rhs } => self.compare(*op, lhs, rhs),
            Expr::Cast {
                signed,
                from,
                to,
                operand,
            } => {
                let inner: String = self.operand(operand);
                if self.pseudo() {
                    let kind: &str = match (to > from, *signed) {
                        (false, _) => "trunc",
                        (true, true) => "sext",
                        (true, false) => "zext",
                    };
                    format!("{}{}({})", kind, u32::from(*to) * 8, self.expr(operand))
                } else if to > from {
                    format!(
                        "({})({}){}",
                        c_type(*signed, *to),
                        c_type(*signed, *from),
                        inner
                    )
                } else {
                    format!("({}){}", c_type(false, *to), inner)
                }
            }
            Expr::Intrinsic { name, args } => self.call(name, args),
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> String {
        let args: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
        format!("{}({})", name, args.join(", "))
    }

    fn binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> String {
        let pseudo: bool = self.pseudo();
        // x + -c reads as x - c
        if let (BinaryOp::Add, Expr::Const(c)) = (op, rhs) {
            if *c < 0 && *c != i64::MIN {
                return format!("{} - {}", self.operand(lhs), constant(-c));
            }
        }
        let (a, b): (String, String) = (self.operand(lhs), self.operand(rhs));
        let symbol: &str = match op {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::DivUnsigned if pseudo => "/u",
            BinaryOp::RemUnsigned if pseudo => "%u",
            BinaryOp::Sar if pseudo => ">>s",
            BinaryOp::DivUnsigned => return format!("(uint64_t){} / {}", a, b),
            BinaryOp::RemUnsigned => return format!("(uint64_t){} % {}", a, b),
            BinaryOp::Sar => return format!("(int64_t){} >> {}", a, b),
            BinaryOp::Rol => return format!("rol({}, {})", self.expr(lhs), self.expr(rhs)),
            BinaryOp::Ror => return format!("ror({}, {})", self.expr(lhs), self.expr(rhs)),
        };
        format!("{} {} {}", a, symbol, b)
    }

    fn compare(&self, op: CompareOp, lhs: &Expr, rhs: &Expr) -> String {
        let symbol: &str = match op {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt | CompareOp::LtUnsigned => "<",
            CompareOp::Le | CompareOp::LeUnsigned => "<=",
            CompareOp::Gt | CompareOp::GtUnsigned => ">",
            CompareOp::Ge | CompareOp::GeUnsigned => ">=",
        };
        let (a, b): (String, String) = (self.operand(lhs), self.operand(rhs));
        match (op.is_unsigned(), self.pseudo()) {
            (false, _) => format!("{} {} {}", a, symbol, b),
            (true, true) => format!("{} {}u {}", a, symbol, b),
            (true, false) => format!("(uint64_t){} {} (uint64_t){}", a, symbol, b),
        }
    }

    fn terminator(&self) -> &'static str {
        if self.pseudo() {
            ""
        } else {
            ";"
        }
    }

    fn body(&mut self, depth: usize, stmts: &[Statement]) {
        for stmt in stmts {
            self.statement(depth, stmt);
        }
    }

    #[inline(never)] // Large function - don't inline
    fn statement(&mut self, depth: usize, stmt: &Statement) {
        let end: &str = self.terminator();
        let pseudo: bool = self.pseudo();
        match stmt {
            Statement::Assign { dst, src } => {
                let text = format!("{} = {}{}", self.expr(dst), self.expr(src), end);
                self.line(depth, &text);
            }
            Statement::Call { target } => {
                let text: String = match target {
                    Expr::Symbol(name) => format!("{}(){}", name, end),
                    Expr::Const(addr) => format!("sub_{:x}(){}", addr, end),
                    other if pseudo => format!("call {}{}", self.expr(other), end),
                    other => format!("((void (*)(void)){})();", self.operand(other)),
                };
                self.line(depth, &text);
            }
            Statement::Return => self.line(depth, &format!("return{}", end)),
            Statement::Intrinsic { name, args } => {
                let text = format!("{}{}", self.call(name, args), end);
                self.line(depth, &text);
            }
            Statement::Asm(text) => {
                let text: String = if pseudo {
                    format!("asm \"{}\"", text)
                } else {
                    format!("__asm__(\"{}\");", text)
                };
                self.line(depth, &text);
            }
            Statement::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond: String = self.expr(cond);
                if pseudo {
                    self.line(depth, &format!("if {} then", cond));
                    self.body(depth + 1, then_body);
                    if !else_body.is_empty() {
                        self.line(depth, "else");
                        self.body(depth + 1, else_body);
                    }
                    self.line(depth, "end if");
                } else {
                    self.line(depth, &format!("if ({}) {{", cond));
                    self.body(depth + 1, then_body);
                    if !else_body.is_empty() {
                        self.line(depth, "} else {");
                        self.body(depth + 1, else_body);
                    }
                    self.line(depth, "}");
                }
            }
            Statement::Loop { kind, body } => {
                let (open, close): (String, &str) = match (kind, pseudo) {
                    (LoopKind::Endless, true) => ("loop:".to_string(), "end loop"),
                    (LoopKind::Endless, false) => ("while (1) {".to_string(), "}"),
                    (LoopKind::While(c), true) => (format!("while {}:", self.expr(c)), "end while"),
                    (LoopKind::While(c), false) => (format!("while ({}) {{", self.expr(c)), "}"),
                };
                self.line(depth, &open);
                self.body(depth + 1, body);
                self.line(depth, close);
            }
            Statement::Switch { cases } => {
                if pseudo {
                    self.line(depth, "switch:");
                } else {
                    self.line(depth, "switch (target) {");
                }
                for (addr, body) in cases {
                    self.line(depth, &format!("case 0x{:x}:", addr));
                    self.body(depth + 1, body);
                    if !pseudo {
                        self.line(depth + 1, "break;");
                    }
                }
                self.line(depth, if pseudo { "end switch" } else { "}" });
            }
            Statement::Break => self.line(depth, &format!("break{}", end)),
            Statement::Continue => self.line(depth, &format!("continue{}", end)),
            Statement::Goto(addr) => self.line(depth, &format!("goto {}{}", label(*addr), end)),
            Statement::Label(addr) => {
                // C labels need a statement after them.
                let text: String = if pseudo {
                    format!("{}:", label(*addr))
                } else {
                    format!("{}: ;", label(*addr))
                };
                self.line(depth.saturating_sub(1), &text);
            }
        }
    }

    fn function(&mut self, f: &FunctionBody) {
        if self.pseudo() {
            self.line(0, &format!("function {}():", f.name));
            self.body(1, &f.body);
            self.line(0, "end function");
        } else {
            self.line(0, &format!("void {}(void)", f.name));
            self.line(0, "{");
            self.body(1, &f.body);
            self.line(0, "}");
        }
    }
}

/// Render every function in `language`, separated by blank lines.
pub fn render(functions: &[FunctionBody], language: Language) -> String {
    let mut emitter = Emitter {
        language,
        out: String::new(),
    };
    if language == Language::C {
        emitter.line(0, "#include <stdint.h>");
        emitter.out.push('\n');
    }
    for (i, f) in functions.iter().enumerate() {
        if i > 0 {
            emitter.out.push('\n');
        }
        emitter.function(f);
    }
    emitter.out
}

/// Render one expression in `language`.
pub fn render_expr(e: &Expr, language: Language) -> String {
    let emitter = Emitter {
        language,
        out: String::new(),
    };
    emitter.expr(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Vec<FunctionBody> {
        let counter = Expr::Reg("eax");
        vec![FunctionBody {
            name: "main".to_string(),
            address: 0x1000,
            body: vec![
                Statement::Assign {
                    dst: counter.clone(),
                    src: Expr::Const(0),
                },
                Statement::Loop {
                    kind: LoopKind::While(Expr::compare(
                        CompareOp::Lt,
                        counter.clone(),
                        Expr::Const(10),
                    )),
                    body: vec![Statement::Assign {
                        dst: counter.clone(),
                        src: Expr::binary(BinaryOp::Add, counter, Expr::Const(1)),
                    }],
                },
                Statement::Call {
                    target: Expr::Symbol("exit".to_string()),
                },
                Statement::Return,
            ],
        }]
    }

    #[test]
    fn pseudocode_dialect() {
        let expected = "\
function main():
    eax = 0
    while eax < 0xa:
        eax = eax + 1
    end while
    exit()
    return
end function
";
        assert_eq!(render(&sample(), Language::Pseudocode), expected);
    }

    #[test]
    fn c_dialect() {
        let expected = "\
#include <stdint.h>

void main(void)
{
    eax = 0;
    while (eax < 0xa) {
        eax = eax + 1;
    }
    exit();
    return;
}
";
        assert_eq!(render(&sample(), Language::C), expected);
    }

    #[test]
    fn memory_and_casts() {
        let e = Expr::cast(
            true,
            1,
            4,
            Expr::deref(
                Expr::binary(BinaryOp::Add, Expr::Reg("rbp"), Expr::Const(-0x10)),
                1,
            ),
        );
        assert_eq!(render_expr(&e, Language::Pseudocode), "sext32(u8[rbp - 0x10])");
        assert_eq!(
            render_expr(&e, Language::C),
            "(int32_t)(int8_t)*(uint8_t *)(rbp - 0x10)"
        );
    }

    #[test]
    fn goto_and_label() {
        let f = FunctionBody {
            name: "f".to_string(),
            address: 0,
            body: vec![Statement::Label(0x40), Statement::Goto(0x40)],
        };
        assert_eq!(
            render(&[f], Language::Pseudocode),
            "function f():\nL_40:\n    goto L_40\nend function\n"
        );
    }
}
