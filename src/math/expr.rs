//! Scalar expressions over named parameters (e.g. `t2 - t1`, `k / (t2 - t1)`).
//!
//! Grammar (precedence low → high):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/') unary)*
//! unary  := ('-' | '+') unary | power
//! power  := atom ('^' unary)?
//! atom   := number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! `^` is right-associative and binds tighter than unary minus, so `-2^2 = -4`.

use std::fmt;

/// Parse or evaluation failure, with a byte offset into the source when known.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprError {
    pub message: String,
    pub position: Option<usize>,
}

impl ExprError {
    fn at(position: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: Some(position),
        }
    }

    fn eval(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
        }
    }
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(p) => write!(f, "{} (at offset {p})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Min,
    Max,
    Pow,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => Func::Exp,
            "ln" | "log" => Func::Ln,
            "log10" => Func::Log10,
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "min" => Func::Min,
            "max" => Func::Max,
            "pow" => Func::Pow,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Func::Min | Func::Max | Func::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Func::Exp => args[0].exp(),
            Func::Ln => args[0].ln(),
            Func::Log10 => args[0].log10(),
            Func::Sqrt => args[0].sqrt(),
            Func::Abs => args[0].abs(),
            Func::Sin => args[0].sin(),
            Func::Cos => args[0].cos(),
            Func::Tan => args[0].tan(),
            Func::Min => args[0].min(args[1]),
            Func::Max => args[0].max(args[1]),
            Func::Pow => args[0].powf(args[1]),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some((at, tok)) => Err(ExprError::at(*at, format!("unexpected {tok}"))),
        }
    }

    /// Variable names in order of first appearance.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(name) => {
                if !out.iter().any(|v| v == name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_vars(out),
            Expr::Bin(_, a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_vars(out)),
        }
    }

    /// Evaluate with `lookup` resolving variable names.
    pub fn eval<L>(&self, lookup: &L) -> Result<f64, ExprError>
    where
        L: Fn(&str) -> Option<f64>,
    {
        Ok(match self {
            Expr::Num(v) => *v,
            Expr::Var(name) => {
                lookup(name).ok_or_else(|| ExprError::eval(format!("unknown name `{name}`")))?
            }
            Expr::Neg(inner) => -inner.eval(lookup)?,
            Expr::Bin(op, a, b) => {
                let a = a.eval(lookup)?;
                let b = b.eval(lookup)?;
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Pow => a.powf(b),
                }
            }
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(lookup))
                    .collect::<Result<Vec<_>, _>>()?;
                func.apply(&values)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(v) => write!(f, "number {v}"),
            Token::Ident(s) => write!(f, "name `{s}`"),
            Token::Op(c) => write!(f, "`{c}`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::Comma => write!(f, "`,`"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = source.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() || c == '.' {
            while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            // Scientific notation: 1e-3, 2.5E+4
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                let mut j = i + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                    while j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                        j += 1;
                    }
                    i = j;
                }
            }
            let text = &source[start..i];
            let v: f64 = text
                .parse()
                .map_err(|_| ExprError::at(start, format!("invalid number `{text}`")))?;
            out.push((start, Token::Num(v)));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.') {
                i += 1;
            }
            out.push((start, Token::Ident(source[start..i].to_string())));
            continue;
        }
        let tok = match c {
            '+' | '-' | '*' | '/' | '^' => Token::Op(c),
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            _ => return Err(ExprError::at(start, format!("unexpected character `{c}`"))),
        };
        out.push((start, tok));
        i += 1;
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|(at, _)| at + 1).unwrap_or(0)
    }

    fn eat_op(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some((_, Token::Op(c))) if ops.contains(c) => {
                let c = *c;
                self.pos += 1;
                Some(c)
            }
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        while let Some(op) = self.eat_op(&['+', '-']) {
            let rhs = self.term()?;
            let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&['*', '/']) {
            let rhs = self.unary()?;
            let op = if op == '*' { BinOp::Mul } else { BinOp::Div };
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.eat_op(&['-', '+']) {
            Some('-') => Ok(Expr::Neg(Box::new(self.unary()?))),
            Some(_) => self.unary(),
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.atom()?;
        if self.eat_op(&['^']).is_some() {
            let exponent = self.unary()?;
            return Ok(Expr::Bin(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let Some((at, tok)) = self.tokens.get(self.pos).cloned() else {
            return Err(ExprError::at(self.end_offset(), "unexpected end of expression"));
        };
        self.pos += 1;
        match tok {
            Token::Num(v) => Ok(Expr::Num(v)),
            Token::Ident(name) => {
                if !matches!(self.peek(), Some((_, Token::LParen))) {
                    return Ok(Expr::Var(name));
                }
                let func = Func::lookup(&name)
                    .ok_or_else(|| ExprError::at(at, format!("unknown function `{name}`")))?;
                self.pos += 1;
                let mut args = vec![self.expr()?];
                while matches!(self.peek(), Some((_, Token::Comma))) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect_rparen()?;
                if args.len() != func.arity() {
                    return Err(ExprError::at(
                        at,
                        format!("`{name}` takes {} argument(s), got {}", func.arity(), args.len()),
                    ));
                }
                Ok(Expr::Call(func, args))
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect_rparen()?;
                Ok(inner)
            }
            other => Err(ExprError::at(at, format!("unexpected {other}"))),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ExprError> {
        match self.peek() {
            Some((_, Token::RParen)) => {
                self.pos += 1;
                Ok(())
            }
            Some((at, tok)) => Err(ExprError::at(*at, format!("expected `)`, found {tok}"))),
            None => Err(ExprError::at(self.end_offset(), "missing `)`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with(src: &str, vars: &[(&str, f64)]) -> f64 {
        let e = Expr::parse(src).unwrap();
        e.eval(&|name: &str| vars.iter().find(|(n, _)| *n == name).map(|(_, v)| *v))
            .unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval_with("1 + 2 * 3", &[]), 7.0);
        assert_eq!(eval_with("(1 + 2) * 3", &[]), 9.0);
        assert_eq!(eval_with("2 ^ 3 ^ 2", &[]), 512.0);
        assert_eq!(eval_with("-2 ^ 2", &[]), -4.0);
        assert_eq!(eval_with("8 / 4 / 2", &[]), 1.0);
        assert_eq!(eval_with("1.5e2 - 50", &[]), 100.0);
    }

    #[test]
    fn variables_and_functions() {
        let v = eval_with("t2 - t1", &[("t1", 38.6), ("t2", 61.0)]);
        assert!((v - 22.4).abs() < 1e-12);
        let v = eval_with("max(k, 1) / sqrt(4)", &[("k", 10.0)]);
        assert_eq!(v, 5.0);
        let e = Expr::parse("k / (t2 - t1) + t1").unwrap();
        assert_eq!(e.variables(), vec!["k", "t2", "t1"]);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(Expr::parse("t2 -").is_err());
        assert!(Expr::parse("(t1 + t2").is_err());
        assert!(Expr::parse("t1 $ t2").is_err());
        assert!(Expr::parse("foo(t1)").is_err());
        assert!(Expr::parse("max(t1)").is_err());
        assert!(Expr::parse("t1 t2").is_err());
        assert!(Expr::parse("").is_err());
    }

    #[test]
    fn unknown_variable_fails_at_eval() {
        let e = Expr::parse("a + b").unwrap();
        let err = e.eval(&|n: &str| (n == "a").then_some(1.0)).unwrap_err();
        assert!(err.message.contains("`b`"));
    }
}
