//! Expression engine for matcher and effect-free boolean sources.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!` (both short-circuit)
//! - Arithmetic: `+`, `-`, `*`, `/`, `%`, unary `-`
//! - Membership: `x in collection`
//! - Function calls: `g(r_sub, p_sub)`, `keyMatch(r_obj, p_obj)`
//! - Dotted access into JSON request values: `r_sub.Age`
//! - Literals: integers, floats, `"strings"` / `'strings'`, `true`, `false`
//! - Parentheses for grouping
//!
//! Sources are compiled once into an AST and evaluated per policy tuple
//! against a variable resolver and a function table. `eval(...)` is a
//! special form: its argument names a policy field holding a
//! sub-expression, which is normalized, compiled, and evaluated in the
//! caller's scope.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtins::FunctionTable;
use crate::error::{Error, Result};
use crate::util;
use crate::value::{from_json_leaf, Value};

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Lit(Value),
    Var { name: String, path: Vec<String> },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Bin { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    In { needle: Box<Expr>, haystack: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    In,
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn compile_error(source: &str, reason: impl Into<String>) -> Error {
    Error::Compile {
        source_text: source.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            quote @ ('"' | '\'') => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(compile_error(source, "unterminated string literal")),
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                                i += 2;
                            } else {
                                return Err(compile_error(source, "dangling escape in string"));
                            }
                        }
                        Some(&c) => {
                            s.push(c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // A trailing dot belongs to field access, not the number.
                if chars.get(i.wrapping_sub(1)) == Some(&'.') {
                    i -= 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.contains('.') {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| compile_error(source, format!("invalid float `{text}`")))?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = text
                        .parse()
                        .map_err(|_| compile_error(source, format!("invalid integer `{text}`")))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => return Err(compile_error(source, format!("unexpected character `{c}`"))),
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if self.advance().as_ref() == Some(&expected) {
            Ok(())
        } else {
            Err(compile_error(self.source, format!("expected {what}")))
        }
    }

    /// or := and ("||" and)*
    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Bin {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// and := cmp ("&&" cmp)*
    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::Bin {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// cmp := additive (op additive)?
    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let rhs = self.parse_additive()?;
                return Ok(Expr::In {
                    needle: Box::new(lhs),
                    haystack: Box::new(rhs),
                });
            }
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::Bin {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    /// additive := mult (("+" | "-") mult)*
    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// mult := unary (("*" | "/" | "%") unary)*
    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// unary := "!" unary | "-" unary | primary
    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    /// primary := literal | ident (call | path) | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Lit(Value::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Lit(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(Value::Bool(false))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma, "`,` between arguments")?;
                        }
                    }
                    return Ok(Expr::Call { name, args });
                }

                let mut path = Vec::new();
                while self.eat(&Token::Dot) {
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => {
                            return Err(compile_error(
                                self.source,
                                "expected identifier after `.`",
                            ))
                        }
                    }
                }
                Ok(Expr::Var { name, path })
            }
            other => Err(compile_error(
                self.source,
                format!("unexpected token {other:?}"),
            )),
        }
    }
}

// ─── Compiled form ──────────────────────────────────────────────────────

/// A matcher source compiled to its evaluable form. Compilation is pure;
/// compiling the same source twice yields behaviorally identical values.
#[derive(Debug)]
pub struct CompiledMatcher {
    source: String,
    root: Expr,
}

/// Compile an expression source. Fails with `Compile` on malformed input.
pub(crate) fn compile(source: &str) -> Result<CompiledMatcher> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(compile_error(source, "empty expression"));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let root = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(compile_error(
            source,
            format!("unexpected trailing token {:?}", parser.tokens[parser.pos]),
        ));
    }
    Ok(CompiledMatcher {
        source: source.to_string(),
        root,
    })
}

/// Maps identifiers like `r_sub` and `p_obj` to positional lookups in the
/// current request and policy tuples.
pub(crate) trait VarResolver {
    fn resolve(&self, name: &str) -> Result<Value>;
}

/// Everything an evaluation needs: the variable resolver for the current
/// (request, tuple) pair and the per-request function table.
pub(crate) struct EvalScope<'a> {
    pub resolver: &'a dyn VarResolver,
    pub functions: &'a FunctionTable,
}

impl CompiledMatcher {
    pub(crate) fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn eval(&self, scope: &EvalScope<'_>) -> Result<Value> {
        eval_expr(&self.root, scope)
    }
}

fn eval_expr(expr: &Expr, scope: &EvalScope<'_>) -> Result<Value> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Var { name, path } => {
            let base = scope.resolver.resolve(name)?;
            if path.is_empty() {
                return Ok(base);
            }
            let Value::Json(root) = &base else {
                return Err(Error::Eval(format!(
                    "cannot access field `{}` on a {} value",
                    path.join("."),
                    base.type_name()
                )));
            };
            let leaf = path
                .iter()
                .fold(root, |acc, seg| acc.get(seg).unwrap_or(&serde_json::Value::Null));
            Ok(from_json_leaf(leaf))
        }
        Expr::Not(inner) => match eval_expr(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(Error::Eval(format!(
                "`!` requires a boolean operand, got {}",
                other.type_name()
            ))),
        },
        Expr::Neg(inner) => match eval_expr(inner, scope)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(Error::Eval(format!(
                "unary `-` requires a numeric operand, got {}",
                other.type_name()
            ))),
        },
        Expr::Bin { op, lhs, rhs } => eval_bin(*op, lhs, rhs, scope),
        Expr::In { needle, haystack } => {
            let needle = eval_expr(needle, scope)?;
            match eval_expr(haystack, scope)? {
                Value::Json(serde_json::Value::Array(items)) => Ok(Value::Bool(
                    items.iter().any(|item| from_json_leaf(item) == needle),
                )),
                other => Err(Error::Eval(format!(
                    "`in` requires an array on the right side, got {}",
                    other.type_name()
                ))),
            }
        }
        Expr::Call { name, args } => {
            if name == "eval" {
                return eval_special_form(args, scope);
            }
            let f = scope
                .functions
                .get(name)
                .ok_or_else(|| Error::Eval(format!("unknown function `{name}`")))?
                .clone();
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval_expr(arg, scope)?);
            }
            f(&evaluated)
        }
    }
}

/// `eval(p_sub_rule)` reads a sub-expression out of policy data, so it is
/// compiled on the spot and evaluated in the same scope.
fn eval_special_form(args: &[Expr], scope: &EvalScope<'_>) -> Result<Value> {
    if args.len() != 1 {
        return Err(Error::Eval(format!(
            "eval() expects 1 argument, got {}",
            args.len()
        )));
    }
    let sub_rule = match eval_expr(&args[0], scope)? {
        Value::Str(s) => s,
        other => {
            return Err(Error::Eval(format!(
                "eval() argument must be a string, got {}",
                other.type_name()
            )))
        }
    };
    let compiled = compile(&util::escape_assertion(&sub_rule))?;
    compiled.eval(scope)
}

fn eval_bin(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &EvalScope<'_>) -> Result<Value> {
    // Boolean operators short-circuit; nothing else does.
    match op {
        BinOp::And => {
            return match eval_expr(lhs, scope)? {
                Value::Bool(false) => Ok(Value::Bool(false)),
                Value::Bool(true) => expect_bool(eval_expr(rhs, scope)?, "&&"),
                other => Err(non_bool_operand("&&", &other)),
            };
        }
        BinOp::Or => {
            return match eval_expr(lhs, scope)? {
                Value::Bool(true) => Ok(Value::Bool(true)),
                Value::Bool(false) => expect_bool(eval_expr(rhs, scope)?, "||"),
                other => Err(non_bool_operand("||", &other)),
            };
        }
        _ => {}
    }

    let l = eval_expr(lhs, scope)?;
    let r = eval_expr(rhs, scope)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(l == r)),
        BinOp::Ne => Ok(Value::Bool(l != r)),
        BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
            let (a, b) = numeric_operands(&l, &r, "comparison")?;
            Ok(Value::Bool(match op {
                BinOp::Gt => a > b,
                BinOp::Lt => a < b,
                BinOp::Ge => a >= b,
                BinOp::Le => a <= b,
                _ => unreachable!(),
            }))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul => {
            if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
                return Ok(Value::Int(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    _ => a * b,
                }));
            }
            let (a, b) = numeric_operands(&l, &r, "arithmetic")?;
            Ok(Value::Float(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                _ => a * b,
            }))
        }
        BinOp::Div => {
            let (a, b) = numeric_operands(&l, &r, "arithmetic")?;
            Ok(Value::Float(a / b))
        }
        BinOp::Rem => match (&l, &r) {
            (Value::Int(a), Value::Int(b)) if *b != 0 => Ok(Value::Int(a % b)),
            (Value::Int(_), Value::Int(_)) => Err(Error::Eval("`%` by zero".to_string())),
            _ => Err(Error::Eval("`%` requires integer operands".to_string())),
        },
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn expect_bool(v: Value, op: &str) -> Result<Value> {
    match v {
        Value::Bool(_) => Ok(v),
        other => Err(non_bool_operand(op, &other)),
    }
}

fn non_bool_operand(op: &str, v: &Value) -> Error {
    Error::Eval(format!("`{op}` requires boolean operands, got {}", v.type_name()))
}

fn numeric_operands(l: &Value, r: &Value, what: &str) -> Result<(f64, f64)> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::Eval(format!(
            "{what} requires numeric operands, got {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

// ─── Compiled-matcher cache ─────────────────────────────────────────────

/// Compiled expressions keyed by source, valid for exactly one model
/// version. Any model mutation moves the version forward, which empties
/// the cache on the next insert or lookup miss.
#[derive(Debug, Default)]
pub(crate) struct MatcherCache {
    model_version: u64,
    map: HashMap<String, Arc<CompiledMatcher>>,
}

impl MatcherCache {
    pub(crate) fn get(&self, model_version: u64, source: &str) -> Option<Arc<CompiledMatcher>> {
        if self.model_version != model_version {
            return None;
        }
        self.map.get(source).cloned()
    }

    /// Two racing compilations of the same source are fine: the first
    /// insert wins and the loser's copy is dropped.
    pub(crate) fn insert(
        &mut self,
        model_version: u64,
        expr: Arc<CompiledMatcher>,
    ) -> Arc<CompiledMatcher> {
        if self.model_version != model_version {
            self.map.clear();
            self.model_version = model_version;
        }
        self.map
            .entry(expr.source().to_string())
            .or_insert(expr)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MapResolver(HashMap<String, Value>);

    impl VarResolver for MapResolver {
        fn resolve(&self, name: &str) -> Result<Value> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Eval(format!("unknown parameter `{name}`")))
        }
    }

    fn eval_with(source: &str, vars: &[(&str, Value)]) -> Result<Value> {
        let resolver = MapResolver(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        let functions = FunctionTable::with_builtins();
        let scope = EvalScope {
            resolver: &resolver,
            functions: &functions,
        };
        compile(source)?.eval(&scope)
    }

    fn eval_bool(source: &str, vars: &[(&str, Value)]) -> bool {
        eval_with(source, vars).unwrap() == Value::Bool(true)
    }

    #[test]
    fn string_equality() {
        assert!(eval_bool(
            r#"r_sub == p_sub"#,
            &[
                ("r_sub", Value::from("alice")),
                ("p_sub", Value::from("alice")),
            ],
        ));
        assert!(!eval_bool(
            r#"r_sub == "bob""#,
            &[("r_sub", Value::from("alice"))],
        ));
    }

    #[test]
    fn single_quoted_strings() {
        assert!(eval_bool(r#"r_act == 'read'"#, &[("r_act", Value::from("read"))]));
    }

    #[test]
    fn boolean_operators_and_grouping() {
        assert!(eval_bool("(a || b) && !c", &[
            ("a", Value::Bool(false)),
            ("b", Value::Bool(true)),
            ("c", Value::Bool(false)),
        ]));
    }

    #[test]
    fn numeric_comparisons_cross_variants() {
        assert!(eval_bool("age > 18", &[("age", Value::Int(30))]));
        assert!(eval_bool("age >= 18.0", &[("age", Value::Int(18))]));
        assert!(!eval_bool("age < 18", &[("age", Value::Float(21.5))]));
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval_with("2 + 3 * 4", &[]).unwrap(), Value::Int(14));
        assert_eq!(eval_with("(2 + 3) * 4", &[]).unwrap(), Value::Int(20));
        assert_eq!(eval_with("-2 + 3", &[]).unwrap(), Value::Int(1));
        assert!(eval_bool("10 / 4 == 2.5", &[]));
    }

    #[test]
    fn function_calls_reach_the_table() {
        assert!(eval_bool(
            "keyMatch(r_obj, p_obj)",
            &[
                ("r_obj", Value::from("/data/1")),
                ("p_obj", Value::from("/data/*")),
            ],
        ));
        assert!(eval_bool(
            r#"regexMatch(r_act, "^(read|write)$")"#,
            &[("r_act", Value::from("write"))],
        ));
    }

    #[test]
    fn unknown_function_is_an_eval_error() {
        let err = eval_with("nosuch(1)", &[]).unwrap_err();
        assert!(matches!(err, Error::Eval(_)));
    }

    #[test]
    fn dotted_access_into_json_values() {
        let sub = Value::Json(serde_json::json!({"Age": 30, "Address": {"City": "Berlin"}}));
        assert!(eval_bool("r_sub.Age > 18", &[("r_sub", sub.clone())]));
        assert!(eval_bool(
            r#"r_sub.Address.City == "Berlin""#,
            &[("r_sub", sub.clone())],
        ));
        // Missing fields read as null and never equal anything.
        assert!(!eval_bool(r#"r_sub.Nope == "x""#, &[("r_sub", sub)]));
    }

    #[test]
    fn dotted_access_on_plain_string_is_an_error() {
        let err = eval_with("r_sub.Age > 18", &[("r_sub", Value::from("alice"))]).unwrap_err();
        assert!(matches!(err, Error::Eval(_)));
    }

    #[test]
    fn membership_over_json_arrays() {
        let ips = Value::Json(serde_json::json!(["10.0.0.1", "10.0.0.2"]));
        assert!(eval_bool("r_ip in p_ips", &[
            ("r_ip", Value::from("10.0.0.1")),
            ("p_ips", ips.clone()),
        ]));
        assert!(!eval_bool("r_ip in p_ips", &[
            ("r_ip", Value::from("10.9.9.9")),
            ("p_ips", ips),
        ]));
    }

    #[test]
    fn short_circuit_skips_rhs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut functions = FunctionTable::with_builtins();
        let counter = calls.clone();
        functions.register(
            "boom",
            Arc::new(move |_: &[Value]| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Bool(true))
            }),
        );

        let resolver = MapResolver(HashMap::new());
        let scope = EvalScope {
            resolver: &resolver,
            functions: &functions,
        };
        let and = compile("false && boom()").unwrap();
        assert_eq!(and.eval(&scope).unwrap(), Value::Bool(false));
        let or = compile("true || boom()").unwrap();
        assert_eq!(or.eval(&scope).unwrap(), Value::Bool(true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn eval_special_form_runs_in_caller_scope() {
        assert!(eval_bool(
            "eval(p_sub_rule) && r_obj == p_obj",
            &[
                ("p_sub_rule", Value::from("r.sub.Age > 18")),
                ("r_sub", Value::Json(serde_json::json!({"Age": 30}))),
                ("r_obj", Value::from("/data")),
                ("p_obj", Value::from("/data")),
            ],
        ));
        assert!(!eval_bool(
            "eval(p_sub_rule)",
            &[
                ("p_sub_rule", Value::from("r.sub.Age > 18")),
                ("r_sub", Value::Json(serde_json::json!({"Age": 10}))),
            ],
        ));
    }

    #[test]
    fn eval_argument_must_be_a_string() {
        let err = eval_with("eval(42)", &[]).unwrap_err();
        assert!(matches!(err, Error::Eval(_)));
    }

    #[test]
    fn compile_rejects_malformed_sources() {
        for source in ["", "r_sub ==", "(a && b", "a b", "\"unterminated", "x . 3"] {
            let err = compile(source).unwrap_err();
            assert!(matches!(err, Error::Compile { .. }), "source: {source}");
        }
    }

    #[test]
    fn compile_twice_is_observationally_equivalent() {
        let vars = [
            ("r_sub", Value::from("alice")),
            ("p_sub", Value::from("alice")),
        ];
        let resolver = MapResolver(vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
        let functions = FunctionTable::with_builtins();
        let scope = EvalScope {
            resolver: &resolver,
            functions: &functions,
        };

        let first = compile("r_sub == p_sub").unwrap();
        let second = compile("r_sub == p_sub").unwrap();
        assert_eq!(first.eval(&scope).unwrap(), second.eval(&scope).unwrap());
    }

    #[test]
    fn cache_hits_only_within_one_model_version() {
        let mut cache = MatcherCache::default();
        let expr = Arc::new(compile("r_sub == p_sub").unwrap());
        cache.insert(7, expr.clone());

        assert!(cache.get(7, "r_sub == p_sub").is_some());
        assert!(cache.get(8, "r_sub == p_sub").is_none());

        // Inserting under a newer version discards stale entries.
        let newer = Arc::new(compile("r_obj == p_obj").unwrap());
        cache.insert(8, newer);
        assert!(cache.get(8, "r_sub == p_sub").is_none());
        assert!(cache.get(8, "r_obj == p_obj").is_some());
    }

    #[test]
    fn first_cache_insert_wins() {
        let mut cache = MatcherCache::default();
        let a = Arc::new(compile("r_sub == p_sub").unwrap());
        let b = Arc::new(compile("r_sub == p_sub").unwrap());
        let kept = cache.insert(1, a.clone());
        assert!(Arc::ptr_eq(&kept, &a));
        let kept = cache.insert(1, b);
        assert!(Arc::ptr_eq(&kept, &a));
    }
}
