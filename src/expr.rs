//! Arithmetic and boolean expressions over resolved parameters.
//!
//! Expressions are parsed with a small Pratt parser and evaluated against the
//! resolved-parameter log of one run. Bare identifiers name parameter paths
//! with `.` in place of `/` (`optim.total_steps` is `optim/total_steps`).
//! Only values already present in the log are substituted; nothing is
//! sampled from here.

use crate::context::ResolvedLog;
use crate::error::{Error, Result};
use crate::value::Value;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Comma,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    fn binding_power(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 2),
            BinOp::And => (3, 4),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (7, 8),
            BinOp::Add | BinOp::Sub => (9, 10),
            BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod => (11, 12),
            // right associative
            BinOp::Pow => (16, 15),
        }
    }
}

const NOT_BP: u8 = 5;
const NEG_BP: u8 = 13;

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Lit(Value),
    Ref(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

fn lex(text: &str) -> core::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            let mut is_float = false;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_digit() || d == '_' {
                    i += 1;
                } else if d == '.' && !is_float {
                    is_float = true;
                    i += 1;
                } else if (d == 'e' || d == 'E')
                    && chars
                        .get(i + 1)
                        .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
                {
                    is_float = true;
                    i += 2;
                } else {
                    break;
                }
            }
            let literal: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                literal.parse().map(Token::Float).map_err(|_| format!("bad number '{literal}'"))?
            } else {
                literal.parse().map(Token::Int).map_err(|_| format!("bad number '{literal}'"))?
            };
            tokens.push(token);
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "true" | "True" => Token::True,
                "false" | "False" => Token::False,
                _ => Token::Ident(word.trim_end_matches('.').replace('.', "/")),
            });
            continue;
        }
        if c == '\'' || c == '"' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|d| *d == c)
                .ok_or_else(|| "unterminated string".to_string())?;
            tokens.push(Token::Str(chars[start..start + end].iter().collect()));
            i = start + end + 1;
            continue;
        }
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('*', Some('*')) => (Token::StarStar, 2),
            ('/', Some('/')) => (Token::SlashSlash, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('!', _) => (Token::Not, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            _ => return Err(format!("unexpected character '{c}'")),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: &Token) -> core::result::Result<(), String> {
        match self.advance() {
            Some(ref t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {want:?}, found {t:?}")),
            None => Err(format!("expected {want:?}, found end of input")),
        }
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> core::result::Result<Expr, String> {
        let mut lhs = self.parse_primary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Or) => BinOp::Or,
                Some(Token::And) => BinOp::And,
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::SlashSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                Some(Token::StarStar) => BinOp::Pow,
                _ => break,
            };

            let (l_bp, r_bp) = op.binding_power();
            if l_bp < min_bp {
                break;
            }

            self.advance();
            let rhs = self.parse_expr_bp(r_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_primary(&mut self) -> core::result::Result<Expr, String> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Lit(Value::Int(v))),
            Some(Token::Float(v)) => Ok(Expr::Lit(Value::Float(v))),
            Some(Token::Str(v)) => Ok(Expr::Lit(Value::Str(v))),
            Some(Token::True) => Ok(Expr::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(Value::Bool(false))),
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.parse_expr_bp(NEG_BP)?))),
            Some(Token::Plus) => self.parse_expr_bp(NEG_BP),
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_expr_bp(NOT_BP)?))),
            Some(Token::LParen) => {
                let inner = self.parse_expr_bp(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Ref(name));
                }
                self.advance();
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.advance();
                } else {
                    loop {
                        args.push(self.parse_expr_bp(0)?);
                        match self.advance() {
                            Some(Token::Comma) => {}
                            Some(Token::RParen) => break,
                            _ => return Err(format!("unterminated call to '{name}'")),
                        }
                    }
                }
                Ok(Expr::Call(name, args))
            }
            Some(t) => Err(format!("unexpected {t:?}")),
            None => Err("unexpected end of input".into()),
        }
    }
}

fn parse(text: &str) -> Result<Expr> {
    let fail = |reason: String| Error::Expression {
        expr: text.to_string(),
        reason,
    };
    let tokens = lex(text).map_err(fail)?;
    if tokens.is_empty() {
        return Err(fail("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr_bp(0).map_err(fail)?;
    if let Some(t) = parser.peek() {
        return Err(fail(format!("unexpected trailing {t:?}")));
    }
    Ok(expr)
}

fn collect_refs(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Lit(_) => {}
        Expr::Ref(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Neg(e) | Expr::Not(e) => collect_refs(e, out),
        Expr::Binary(_, l, r) => {
            collect_refs(l, out);
            collect_refs(r, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_refs(a, out)),
    }
}

#[allow(clippy::float_cmp)]
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::List(l) => !l.is_empty(),
    }
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Evaluates expressions against the resolved parameters of one run.
///
/// # Examples
///
/// ```
/// use hpdispatch::context::ResolvedLog;
/// use hpdispatch::expr::Evaluator;
/// use hpdispatch::Value;
///
/// let mut log = ResolvedLog::default();
/// log.insert("optim/total_steps", Value::Int(1000));
/// let warmup = Evaluator::new(&log).evaluate("0.1 * optim.total_steps").unwrap();
/// assert_eq!(warmup, Value::Float(100.0));
/// ```
pub struct Evaluator<'a> {
    resolved: &'a ResolvedLog,
}

impl<'a> Evaluator<'a> {
    /// Creates an evaluator reading from `resolved`.
    #[must_use]
    pub fn new(resolved: &'a ResolvedLog) -> Self {
        Self { resolved }
    }

    /// Parameter paths referenced by `text`, in order of first appearance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expression`] if `text` does not parse.
    pub fn references(text: &str) -> Result<Vec<String>> {
        let expr = parse(text)?;
        let mut out = Vec::new();
        collect_refs(&expr, &mut out);
        Ok(out)
    }

    /// Parses and evaluates `text`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedReference`] for an identifier missing from
    /// the log, or [`Error::Expression`] for parse and type errors.
    pub fn evaluate(&self, text: &str) -> Result<Value> {
        let expr = parse(text)?;
        self.eval(&expr).map_err(|e| match e {
            EvalError::Unresolved(path) => Error::UnresolvedReference(path),
            EvalError::Invalid(reason) => Error::Expression {
                expr: text.to_string(),
                reason,
            },
        })
    }

    fn eval(&self, expr: &Expr) -> core::result::Result<Value, EvalError> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Ref(path) => self
                .resolved
                .get(path)
                .cloned()
                .ok_or_else(|| EvalError::Unresolved(path.clone())),
            Expr::Neg(e) => match self.eval(e)? {
                Value::Int(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| EvalError::invalid("integer overflow")),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(EvalError::invalid(format!("cannot negate {}", other.type_name()))),
            },
            Expr::Not(e) => Ok(Value::Bool(!truthy(&self.eval(e)?))),
            Expr::Binary(BinOp::And, l, r) => {
                Ok(Value::Bool(truthy(&self.eval(l)?) && truthy(&self.eval(r)?)))
            }
            Expr::Binary(BinOp::Or, l, r) => {
                Ok(Value::Bool(truthy(&self.eval(l)?) || truthy(&self.eval(r)?)))
            }
            Expr::Binary(op, l, r) => binary(*op, &self.eval(l)?, &self.eval(r)?),
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<core::result::Result<Vec<_>, _>>()?;
                call(name, &args)
            }
        }
    }
}

enum EvalError {
    Unresolved(String),
    Invalid(String),
}

impl EvalError {
    fn invalid(reason: impl Into<String>) -> Self {
        EvalError::Invalid(reason.into())
    }
}

fn number(v: &Value) -> core::result::Result<f64, EvalError> {
    v.as_f64()
        .ok_or_else(|| EvalError::invalid(format!("expected a number, found {}", v.type_name())))
}

#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
fn binary(op: BinOp, l: &Value, r: &Value) -> core::result::Result<Value, EvalError> {
    let overflow = || EvalError::invalid("integer overflow");
    match op {
        BinOp::Eq | BinOp::Ne => {
            let equal = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => l == r,
            };
            return Ok(Value::Bool(equal == (op == BinOp::Eq)));
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (l, r) {
                (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                _ => number(l)?.partial_cmp(&number(r)?),
            }
            .ok_or_else(|| EvalError::invalid("comparison with NaN"))?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if let (BinOp::Add, Value::Str(a), Value::Str(b)) = (op, l, r) {
        return Ok(Value::Str(format!("{a}{b}")));
    }

    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let (a, b) = (*a, *b);
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
            BinOp::Div if b == 0 => Err(EvalError::invalid("division by zero")),
            BinOp::Div => Ok(Value::Float(a as f64 / b as f64)),
            BinOp::FloorDiv | BinOp::Mod if b == 0 => Err(EvalError::invalid("division by zero")),
            BinOp::FloorDiv => Ok(Value::Int(floor_div(a, b))),
            BinOp::Mod => Ok(Value::Int(a - b * floor_div(a, b))),
            BinOp::Pow if b >= 0 => u32::try_from(b)
                .ok()
                .and_then(|e| a.checked_pow(e))
                .map(Value::Int)
                .ok_or_else(overflow),
            BinOp::Pow => Ok(Value::Float((a as f64).powf(b as f64))),
            _ => Err(EvalError::invalid("unsupported operator")),
        };
    }

    let (a, b) = (number(l)?, number(r)?);
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if b == 0.0 => {
            return Err(EvalError::invalid("division by zero"))
        }
        BinOp::Div => a / b,
        BinOp::FloorDiv => (a / b).floor(),
        BinOp::Mod => a - b * (a / b).floor(),
        BinOp::Pow => a.powf(b),
        _ => return Err(EvalError::invalid("unsupported operator")),
    };
    Ok(Value::Float(value))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn call(name: &str, args: &[Value]) -> core::result::Result<Value, EvalError> {
    let to_int = |f: f64| {
        if f.is_finite() && f.abs() < 9.0e18 {
            Ok(Value::Int(f as i64))
        } else {
            Err(EvalError::invalid(format!("{name}: value out of integer range")))
        }
    };
    let one = || match args {
        [v] => Ok(v),
        _ => Err(EvalError::invalid(format!("{name} takes exactly one argument"))),
    };
    match name {
        "min" | "max" => {
            let first = args
                .first()
                .ok_or_else(|| EvalError::invalid(format!("{name} needs an argument")))?;
            let mut best = first.clone();
            for v in &args[1..] {
                let better = if name == "min" {
                    number(v)? < number(&best)?
                } else {
                    number(v)? > number(&best)?
                };
                if better {
                    best = v.clone();
                }
            }
            number(&best)?;
            Ok(best)
        }
        "abs" => match one()? {
            Value::Int(i) => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| EvalError::invalid("integer overflow")),
            v => Ok(Value::Float(number(v)?.abs())),
        },
        "round" => match args {
            [v] => to_int(number(v)?.round()),
            [v, digits] => {
                let digits = digits
                    .as_i64()
                    .and_then(|d| i32::try_from(d).ok())
                    .ok_or_else(|| EvalError::invalid("round: digits must be an integer"))?;
                let scale = 10_f64.powi(digits);
                Ok(Value::Float((number(v)? * scale).round() / scale))
            }
            _ => Err(EvalError::invalid("round takes one or two arguments")),
        },
        "floor" => to_int(number(one()?)?.floor()),
        "ceil" => to_int(number(one()?)?.ceil()),
        "int" => match one()? {
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            v => to_int(number(v)?.trunc()),
        },
        "float" => Ok(Value::Float(number(one()?)?)),
        "sqrt" => Ok(Value::Float(number(one()?)?.sqrt())),
        "exp" => Ok(Value::Float(number(one()?)?.exp())),
        "log" => match args {
            [v] => Ok(Value::Float(number(v)?.ln())),
            [v, base] => Ok(Value::Float(number(v)?.log(number(base)?))),
            _ => Err(EvalError::invalid("log takes one or two arguments")),
        },
        other => Err(EvalError::invalid(format!("unknown function '{other}'"))),
    }
}
