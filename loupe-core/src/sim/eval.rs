// Expression evaluation
//
// A small expression language over the locals of a frame: integer and string literals,
// identifiers, arithmetic, comparisons, boolean operators and function calls.

use super::program::Expr;
use crate::error::{DebugError, DebugResult};
use crate::types::{LoadConfig, Variable, VariableKind};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    Func(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Func(name) => write!(f, "{}", name),
        }
    }
}

impl Value {
    pub fn to_variable(&self, name: &str, cfg: &LoadConfig) -> Variable {
        let (kind, type_name) = match self {
            Value::Int(_) => (VariableKind::Int, "int"),
            Value::Str(_) => (VariableKind::String, "string"),
            Value::Bool(_) => (VariableKind::Bool, "bool"),
            Value::Func(_) => (VariableKind::Func, "func()"),
        };
        let mut value = self.to_string();
        let mut len = 0;
        if let Value::Str(s) = self {
            len = s.chars().count() as i64;
            if cfg.max_string_len >= 0 {
                value = s.chars().take(cfg.max_string_len as usize).collect();
            }
        }
        Variable {
            name: name.to_string(),
            type_name: type_name.to_string(),
            kind,
            value,
            len,
            ..Default::default()
        }
    }

    fn as_int(&self) -> DebugResult<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(DebugError::Eval(format!("{} is not an integer", other))),
        }
    }

    fn as_bool(&self) -> DebugResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(DebugError::Eval(format!("{} is not a boolean", other))),
        }
    }
}

/// Evaluate one operand of a program operation.
pub fn eval_operand(expr: &Expr, locals: &BTreeMap<String, Value>, clock: i64) -> DebugResult<Value> {
    let lookup = |name: &str| {
        locals
            .get(name)
            .cloned()
            .ok_or_else(|| DebugError::Eval(format!("could not find symbol value for {}", name)))
    };
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Var(name) => lookup(name),
        Expr::Add(name, n) => Ok(Value::Int(lookup(name)?.as_int()? + n)),
        Expr::Clock => Ok(Value::Int(clock)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Int(i64),
    Str(String),
    Ident(String),
    Not(Box<Ast>),
    Neg(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: &[&str] = &["==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "!"];

fn tokenize(src: &str) -> DebugResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse()
                .map_err(|_| DebugError::Eval(format!("invalid number {}", text)))?;
            tokens.push(Token::Int(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '[' | ']'))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '"' {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != '"' {
                i += 1;
            }
            if i >= chars.len() {
                return Err(DebugError::Eval("unterminated string literal".to_string()));
            }
            tokens.push(Token::Str(chars[start..i].iter().collect()));
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == ',' {
            tokens.push(Token::Comma);
            i += 1;
        } else {
            let rest: String = chars[i..].iter().take(2).collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(*op))
                .ok_or_else(|| DebugError::Eval(format!("unexpected character {:?}", c)))?;
            tokens.push(Token::Op(*op));
            i += op.len();
        }
    }
    Ok(tokens)
}

fn binop(op: &str) -> Option<(BinOp, u8)> {
    Some(match op {
        "||" => (BinOp::Or, 1),
        "&&" => (BinOp::And, 2),
        "==" => (BinOp::Eq, 3),
        "!=" => (BinOp::Ne, 3),
        "<" => (BinOp::Lt, 3),
        "<=" => (BinOp::Le, 3),
        ">" => (BinOp::Gt, 3),
        ">=" => (BinOp::Ge, 3),
        "+" => (BinOp::Add, 4),
        "-" => (BinOp::Sub, 4),
        "*" => (BinOp::Mul, 5),
        _ => return None,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self, min_prec: u8) -> DebugResult<Ast> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let (bin, prec) = match binop(op) {
                Some(b) if b.1 >= min_prec => b,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.expr(prec + 1)?;
            lhs = Ast::Binary(bin, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> DebugResult<Ast> {
        match self.next() {
            Some(Token::Op("!")) => Ok(Ast::Not(Box::new(self.unary()?))),
            Some(Token::Op("-")) => Ok(Ast::Neg(Box::new(self.unary()?))),
            Some(Token::Int(n)) => Ok(Ast::Int(n)),
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::LParen) => {
                let inner = self.expr(1)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(DebugError::Eval("expected )".to_string())),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Ast::Ident(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(Ast::Call(name, args));
                }
                loop {
                    args.push(self.expr(1)?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        _ => return Err(DebugError::Eval("expected , or )".to_string())),
                    }
                }
                Ok(Ast::Call(name, args))
            }
            Some(token) => Err(DebugError::Eval(format!("unexpected token {:?}", token))),
            None => Err(DebugError::Eval("unexpected end of expression".to_string())),
        }
    }
}

pub fn parse(src: &str) -> DebugResult<Ast> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let ast = parser.expr(1)?;
    if parser.pos < parser.tokens.len() {
        return Err(DebugError::Eval(format!("unexpected trailing input in {:?}", src)));
    }
    Ok(ast)
}

/// Resolves identifiers while evaluating.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

pub fn evaluate(ast: &Ast, scope: &dyn Scope) -> DebugResult<Value> {
    match ast {
        Ast::Int(n) => Ok(Value::Int(*n)),
        Ast::Str(s) => Ok(Value::Str(s.clone())),
        Ast::Ident(name) => match name.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => scope
                .lookup(name)
                .ok_or_else(|| DebugError::Eval(format!("could not find symbol value for {}", name))),
        },
        Ast::Not(inner) => Ok(Value::Bool(!evaluate(inner, scope)?.as_bool()?)),
        Ast::Neg(inner) => Ok(Value::Int(-evaluate(inner, scope)?.as_int()?)),
        Ast::Call(name, _) => Err(DebugError::Eval(format!(
            "function calls not allowed without using 'call': {}",
            name
        ))),
        Ast::Binary(op, lhs, rhs) => {
            let l = evaluate(lhs, scope)?;
            match op {
                BinOp::And if !l.as_bool()? => return Ok(Value::Bool(false)),
                BinOp::Or if l.as_bool()? => return Ok(Value::Bool(true)),
                _ => {}
            }
            let r = evaluate(rhs, scope)?;
            binary(*op, l, r)
        }
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> DebugResult<Value> {
    Ok(match op {
        BinOp::And | BinOp::Or => Value::Bool(r.as_bool()?),
        BinOp::Eq => Value::Bool(l == r),
        BinOp::Ne => Value::Bool(l != r),
        BinOp::Add => match (l, r) {
            (Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
            (a, b) => Value::Int(a.as_int()? + b.as_int()?),
        },
        BinOp::Sub => Value::Int(l.as_int()? - r.as_int()?),
        BinOp::Mul => Value::Int(l.as_int()? * r.as_int()?),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (&l, &r) {
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => l.as_int()?.cmp(&r.as_int()?),
            };
            Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            })
        }
    })
}
