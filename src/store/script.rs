//! Evaluator for compiled filter programs.
//!
//! Accepts exactly the statement shape the filter module runs per record,
//! `if <condition> then selectedRec = true end`, with the expression subset the
//! compiler emits: `or`, `and`, `not`, comparisons, unary minus, parentheses, literals,
//! bin references, `string.sub` and `string.len`. Values follow the scripting language's
//! rules: `nil` and `false` are falsy, equality across types is false, and ordering
//! across types (or against `nil`) is a runtime error.

use crate::errors::{QueryError, QueryResult};
use bson::{Bson, Document as BsonDocument};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    // Unsigned magnitude; a leading minus is a separate token.
    Int(u64),
    Float(f64),
    Str(Vec<u8>),
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    Minus,
    LParen,
    RParen,
    Comma,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
}

impl Value {
    fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::Float(_) => "number",
            Self::Str(_) => "string",
        }
    }

    fn from_bson(v: &Bson) -> Self {
        match v {
            Bson::Boolean(b) => Self::Bool(*b),
            Bson::Int32(i) => Self::Int(i64::from(*i)),
            Bson::Int64(i) => Self::Int(*i),
            Bson::Double(f) => Self::Float(*f),
            Bson::String(s) => Self::Str(s.as_bytes().to_vec()),
            // Containers and other types are opaque to the predicate language.
            _ => Self::Nil,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Sub,
    Len,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Value),
    Bin(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

/// A parsed filter program, ready to run against any number of records.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    condition: Expr,
}

impl Script {
    /// # Errors
    /// `Store` when the text is not a well-formed filter program.
    pub fn parse(source: &str) -> QueryResult<Self> {
        let tokens = tokenize(source)?;
        let mut p = Parser { tokens, pos: 0 };
        p.keyword("if")?;
        let condition = p.expr()?;
        p.keyword("then")?;
        p.keyword("selectedRec")?;
        p.expect(&Token::Assign)?;
        p.keyword("true")?;
        p.keyword("end")?;
        if p.pos != p.tokens.len() {
            return Err(syntax("trailing input after 'end'"));
        }
        Ok(Self { condition })
    }

    /// Runs the program against one record's bins.
    ///
    /// # Errors
    /// `Store` on a runtime error (ordering against nil or across types, bad builtin
    /// arguments). The filter module treats such a record as not selected.
    pub fn selects(&self, bins: &BsonDocument) -> QueryResult<bool> {
        eval(&self.condition, bins).map(|v| v.truthy())
    }
}

fn syntax(msg: impl AsRef<str>) -> QueryError {
    QueryError::Store(format!("filter program syntax error: {}", msg.as_ref()))
}

fn runtime(msg: impl AsRef<str>) -> QueryError {
    QueryError::Store(format!("filter program runtime error: {}", msg.as_ref()))
}

fn tokenize(src: &str) -> QueryResult<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                out.push(Token::LParen);
                i += 1;
            }
            b')' => {
                out.push(Token::RParen);
                i += 1;
            }
            b',' => {
                out.push(Token::Comma);
                i += 1;
            }
            b'.' => {
                out.push(Token::Dot);
                i += 1;
            }
            b'-' => {
                out.push(Token::Minus);
                i += 1;
            }
            b'=' | b'~' | b'<' | b'>' => {
                let double = bytes.get(i + 1) == Some(&b'=');
                let tok = match (c, double) {
                    (b'=', true) => Token::Eq,
                    (b'=', false) => Token::Assign,
                    (b'~', true) => Token::NotEq,
                    (b'<', true) => Token::LtEq,
                    (b'<', false) => Token::Lt,
                    (b'>', true) => Token::GtEq,
                    (b'>', false) => Token::Gt,
                    _ => return Err(syntax(format!("unexpected '~' at offset {i}"))),
                };
                out.push(tok);
                i += if double { 2 } else { 1 };
            }
            b'\'' | b'"' => {
                let (s, next) = read_string(bytes, i)?;
                out.push(Token::Str(s));
                i = next;
            }
            b'0'..=b'9' => {
                let (tok, next) = read_number(src, i)?;
                out.push(tok);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                out.push(Token::Ident(src[start..i].to_string()));
            }
            other => {
                return Err(syntax(format!("unexpected character {:?} at offset {i}", other as char)));
            }
        }
    }
    Ok(out)
}

fn read_string(bytes: &[u8], start: usize) -> QueryResult<(Vec<u8>, usize)> {
    let quote = bytes[start];
    let mut out = Vec::new();
    let mut i = start + 1;
    loop {
        let Some(&c) = bytes.get(i) else {
            return Err(syntax("unterminated string literal"));
        };
        match c {
            c if c == quote => return Ok((out, i + 1)),
            b'\n' => return Err(syntax("newline in string literal")),
            b'\\' => {
                let Some(&e) = bytes.get(i + 1) else {
                    return Err(syntax("unterminated escape"));
                };
                i += 2;
                match e {
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'a' => out.push(0x07),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'v' => out.push(0x0b),
                    b'\\' | b'\'' | b'"' => out.push(e),
                    b'0'..=b'9' => {
                        let mut code = u32::from(e - b'0');
                        let mut digits = 1;
                        while digits < 3 && bytes.get(i).is_some_and(u8::is_ascii_digit) {
                            code = code * 10 + u32::from(bytes[i] - b'0');
                            i += 1;
                            digits += 1;
                        }
                        let byte =
                            u8::try_from(code).map_err(|_| syntax("escape sequence too large"))?;
                        out.push(byte);
                    }
                    other => {
                        return Err(syntax(format!("invalid escape '\\{}'", other as char)));
                    }
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
}

fn read_number(src: &str, start: usize) -> QueryResult<(Token, usize)> {
    let bytes = src.as_bytes();
    let mut i = start;
    let mut is_float = false;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if bytes.get(i) == Some(&b'.') {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        is_float = true;
        i += 1;
        if matches!(bytes.get(i), Some(b'+' | b'-')) {
            i += 1;
        }
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == digits_start {
            return Err(syntax(format!("malformed number near offset {start}")));
        }
    }
    let text = &src[start..i];
    if !is_float && let Ok(n) = text.parse::<u64>() {
        return Ok((Token::Int(n), i));
    }
    let f = text.parse::<f64>().map_err(|_| syntax(format!("malformed number '{text}'")))?;
    Ok((Token::Float(f), i))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn keyword(&mut self, word: &str) -> QueryResult<()> {
        if self.at_keyword(word) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(format!("expected '{word}', found {:?}", self.peek())))
        }
    }

    fn expect(&mut self, tok: &Token) -> QueryResult<()> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn expr(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.at_keyword("or") {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.at_keyword("and") {
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> QueryResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::NotEq,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtEq) => CmpOp::LtEq,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtEq) => CmpOp::GtEq,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Cmp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> QueryResult<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            // -2^63 only exists as a negated literal.
            if self.peek() == Some(&Token::Int(i64::MIN.unsigned_abs())) {
                self.pos += 1;
                return Ok(Expr::Lit(Value::Int(i64::MIN)));
            }
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.at_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> QueryResult<Expr> {
        match self.bump() {
            #[allow(clippy::cast_precision_loss)]
            Some(Token::Int(n)) => {
                Ok(Expr::Lit(i64::try_from(n).map_or(Value::Float(n as f64), Value::Int)))
            }
            Some(Token::Float(f)) => Ok(Expr::Lit(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Lit(Value::Bool(true))),
                "false" => Ok(Expr::Lit(Value::Bool(false))),
                "nil" => Ok(Expr::Lit(Value::Nil)),
                "string" => self.builtin_call(),
                "and" | "or" | "not" | "if" | "then" | "end" | "else" | "elseif" => {
                    Err(syntax(format!("unexpected keyword '{word}'")))
                }
                _ => Ok(Expr::Bin(word)),
            },
            other => Err(syntax(format!("unexpected token {other:?}"))),
        }
    }

    fn builtin_call(&mut self) -> QueryResult<Expr> {
        self.expect(&Token::Dot)?;
        let builtin = match self.bump() {
            Some(Token::Ident(name)) if name == "sub" => Builtin::Sub,
            Some(Token::Ident(name)) if name == "len" => Builtin::Len,
            other => return Err(syntax(format!("unknown string function {other:?}"))),
        };
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            args.push(self.expr()?);
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                args.push(self.expr()?);
            }
        }
        self.expect(&Token::RParen)?;
        let arity_ok = match builtin {
            Builtin::Sub => (2..=3).contains(&args.len()),
            Builtin::Len => args.len() == 1,
        };
        if !arity_ok {
            return Err(syntax(format!("wrong number of arguments to {builtin:?}")));
        }
        Ok(Expr::Call(builtin, args))
    }
}

#[allow(clippy::cast_precision_loss)]
fn eval(expr: &Expr, bins: &BsonDocument) -> QueryResult<Value> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Bin(name) => Ok(bins.get(name).map_or(Value::Nil, Value::from_bson)),
        Expr::Neg(inner) => match eval(inner, bins)? {
            Value::Int(i) => Ok(i.checked_neg().map_or_else(|| Value::Float(-(i as f64)), Value::Int)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(runtime(format!("attempt to negate a {} value", other.type_name()))),
        },
        Expr::Not(inner) => Ok(Value::Bool(!eval(inner, bins)?.truthy())),
        Expr::And(a, b) => {
            let lhs = eval(a, bins)?;
            if lhs.truthy() { eval(b, bins) } else { Ok(lhs) }
        }
        Expr::Or(a, b) => {
            let lhs = eval(a, bins)?;
            if lhs.truthy() { Ok(lhs) } else { eval(b, bins) }
        }
        Expr::Cmp(op, a, b) => {
            let lhs = eval(a, bins)?;
            let rhs = eval(b, bins)?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
        Expr::Call(builtin, args) => {
            let vals = args.iter().map(|a| eval(a, bins)).collect::<QueryResult<Vec<_>>>()?;
            call(*builtin, &vals)
        }
    }
}

/// Exact ordering of an integer against a float, without rounding the integer.
#[allow(clippy::cast_possible_truncation)]
fn int_float_order(x: i64, y: f64) -> Option<Ordering> {
    // 2^63, exactly representable.
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    if y.is_nan() {
        return None;
    }
    if y >= BOUND {
        return Some(Ordering::Less);
    }
    if y < -BOUND {
        return Some(Ordering::Greater);
    }
    let whole = y.trunc();
    // In range, so the cast is exact.
    match x.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(y - whole)),
        o => Some(o),
    }
}

fn numeric_order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => int_float_order(*x, *y),
        (Value::Float(x), Value::Int(y)) => int_float_order(*y, *x).map(Ordering::reverse),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        _ => None,
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        _ => numeric_order(a, b) == Some(Ordering::Equal),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> QueryResult<bool> {
    match op {
        CmpOp::Eq => return Ok(equal(a, b)),
        CmpOp::NotEq => return Ok(!equal(a, b)),
        _ => {}
    }
    let ord = match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => numeric_order(a, b),
        _ => {
            return Err(runtime(format!(
                "attempt to compare {} with {}",
                a.type_name(),
                b.type_name()
            )));
        }
    };
    // NaN orders as nothing, so every ordering test is false.
    Ok(match (op, ord) {
        (_, None) => false,
        (CmpOp::Lt, Some(o)) => o == Ordering::Less,
        (CmpOp::LtEq, Some(o)) => o != Ordering::Greater,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (CmpOp::GtEq, Some(o)) => o != Ordering::Less,
        (CmpOp::Eq | CmpOp::NotEq, Some(_)) => false,
    })
}

fn as_index(v: &Value, what: &str) -> QueryResult<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        #[allow(clippy::cast_possible_truncation)]
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        other => Err(runtime(format!("bad argument {what} (number expected, got {})", other.type_name()))),
    }
}

fn as_bytes<'v>(v: &'v Value, what: &str) -> QueryResult<&'v [u8]> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(runtime(format!("bad argument {what} (string expected, got {})", other.type_name()))),
    }
}

fn call(builtin: Builtin, args: &[Value]) -> QueryResult<Value> {
    match builtin {
        Builtin::Len => {
            let s = as_bytes(&args[0], "#1 to 'len'")?;
            Ok(Value::Int(i64::try_from(s.len()).unwrap_or(i64::MAX)))
        }
        Builtin::Sub => {
            let s = as_bytes(&args[0], "#1 to 'sub'")?;
            let start = as_index(&args[1], "#2 to 'sub'")?;
            let end = match args.get(2) {
                Some(v) => as_index(v, "#3 to 'sub'")?,
                None => -1,
            };
            Ok(Value::Str(substring(s, start, end).to_vec()))
        }
    }
}

/// One-based inclusive byte range with negative positions counted from the end.
fn substring(s: &[u8], start: i64, end: i64) -> &[u8] {
    let len = i64::try_from(s.len()).unwrap_or(i64::MAX);
    let relative = |pos: i64| if pos < 0 { (len + pos + 1).max(0) } else { pos };
    let start = relative(start).max(1);
    let end = relative(end).min(len);
    if start > end {
        return &[];
    }
    // Both bounds are within 1..=len here.
    let from = usize::try_from(start - 1).unwrap_or(0);
    let to = usize::try_from(end).unwrap_or(0);
    &s[from..to]
}
