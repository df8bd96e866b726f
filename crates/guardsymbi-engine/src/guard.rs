use std::cmp::Ordering;

use tracing::{info, warn};

use guardsymbi_core::decl::{ElseAction, GuardClause, GuardCondition};
use guardsymbi_core::types::McpRequestKind;

use crate::assist::consult;
use crate::context::ExecutionContext;
use crate::interpreter::StepInterpreter;
use crate::report::{RecoveryAttempt, RemediationAction};

/// Result of evaluating a guard condition.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// Binding to introduce, if the clause names one.
    Passed {
        binding: Option<(String, serde_json::Value)>,
    },
    Failed { reason: String },
}

/// Evaluates `guard <condition> else { ... }` clauses.
///
/// Evaluation only reads the context; the caller materializes a passing
/// binding. Guards are never retried.
pub struct GuardEvaluator<'a> {
    interpreter: &'a StepInterpreter,
}

impl<'a> GuardEvaluator<'a> {
    pub fn new(interpreter: &'a StepInterpreter) -> Self {
        Self { interpreter }
    }

    pub async fn evaluate(
        &self,
        clause: &GuardClause,
        ctx: &ExecutionContext,
        step: &str,
    ) -> GuardOutcome {
        let value = match &clause.condition {
            GuardCondition::Call(op) => match self.interpreter.execute(op, ctx, step, None).await {
                Ok(serde_json::Value::Null) => {
                    return GuardOutcome::Failed {
                        reason: format!("{} returned null", op),
                    }
                }
                Ok(serde_json::Value::Bool(false)) => {
                    return GuardOutcome::Failed {
                        reason: format!("{} returned false", op),
                    }
                }
                Ok(v) => v,
                Err(failure) => {
                    return GuardOutcome::Failed {
                        reason: failure.to_string(),
                    }
                }
            },
            GuardCondition::Expr(expr) => match evaluate_expr(expr, ctx) {
                Ok(true) => serde_json::Value::Bool(true),
                Ok(false) => {
                    return GuardOutcome::Failed {
                        reason: format!("condition `{}` is false", expr),
                    }
                }
                Err(e) => {
                    return GuardOutcome::Failed {
                        reason: format!("malformed guard expression `{}`: {}", expr, e),
                    }
                }
            },
        };

        GuardOutcome::Passed {
            binding: clause.bind.clone().map(|name| (name, value)),
        }
    }

    /// Run the else block after a failed guard.
    ///
    /// Each assistance action is issued once. A failed assistance call is
    /// recorded and does not change the guard failure.
    pub async fn run_else(
        &self,
        clause: &GuardClause,
        ctx: &ExecutionContext,
        step: &str,
        reason: &str,
    ) -> Vec<RecoveryAttempt> {
        let mut path = Vec::new();
        for action in &clause.otherwise {
            let (kind, action_tag, message) = match action {
                ElseAction::SuggestFix(message) => {
                    (McpRequestKind::SuggestFix, RemediationAction::SuggestFix, message)
                }
                ElseAction::ExplainError(message) => (
                    McpRequestKind::ExplainError,
                    RemediationAction::ExplainError,
                    message,
                ),
                ElseAction::Log(message) => {
                    info!(task = %ctx.task(), step, reason, "{}", message);
                    continue;
                }
                ElseAction::Return => break,
            };

            let request = format!("{}: {}", message, reason);
            let outcome = match consult(ctx, step, kind, request, None).await {
                Ok(response) => match (response.explanation, response.value) {
                    (Some(text), _) => format!("advice: {}", text),
                    (None, Some(v)) => format!("advice: {}", v),
                    (None, None) => "no advice returned".to_string(),
                },
                Err(e) => {
                    warn!(task = %ctx.task(), step, error = %e, "Guard remediation failed");
                    format!("failed: {}", e)
                }
            };
            path.push(RecoveryAttempt::new(step, 1, action_tag, outcome));
        }
        path
    }
}

// ── Condition expressions ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Lit(serde_json::Value),
    Cmp(CmpOp),
    Not,
    And,
    Or,
    Exists,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug)]
enum Operand {
    Path(String),
    Lit(serde_json::Value),
}

#[derive(Debug)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Exists(String),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

/// Evaluate a condition against the context.
///
/// Supported: `a == b`, `!=`, `<`, `<=`, `>`, `>=`, `a contains b`,
/// `exists a`, `!a`, `&&`, `||`, parentheses, and bare `a` (truthiness).
/// Operands are dotted variable paths or literals (quoted strings, numbers,
/// `true`, `false`, `null`). Missing variables read as `null`.
pub fn evaluate_expr(expr: &str, ctx: &ExecutionContext) -> Result<bool, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected {:?}", parser.tokens[parser.pos]));
    }
    eval(&ast, ctx)
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string".to_string()),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&q) if q == c => {
                            i += 1;
                            break;
                        }
                        Some(&other) => {
                            s.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Lit(serde_json::Value::String(s)));
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Token::Cmp(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Lit(serde_json::json!(n)));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '[' | ']'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Lit(serde_json::Value::Bool(true)),
                    "false" => Token::Lit(serde_json::Value::Bool(false)),
                    "null" => Token::Lit(serde_json::Value::Null),
                    "exists" => Token::Exists,
                    "contains" => Token::Cmp(CmpOp::Contains),
                    _ => Token::Path(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Exists) => {
                self.pos += 1;
                match self.advance() {
                    Some(Token::Path(p)) => Ok(Expr::Exists(p)),
                    other => Err(format!("expected a variable after exists, got {:?}", other)),
                }
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing ')'".to_string()),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.advance() {
            Some(Token::Path(p)) => Ok(Operand::Path(p)),
            Some(Token::Lit(v)) => Ok(Operand::Lit(v)),
            Some(other) => Err(format!("expected an operand, got {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn operand_value(operand: &Operand, ctx: &ExecutionContext) -> serde_json::Value {
    match operand {
        Operand::Path(p) => ctx.resolve(p).cloned().unwrap_or(serde_json::Value::Null),
        Operand::Lit(v) => v.clone(),
    }
}

fn eval(expr: &Expr, ctx: &ExecutionContext) -> Result<bool, String> {
    Ok(match expr {
        Expr::Or(a, b) => eval(a, ctx)? || eval(b, ctx)?,
        Expr::And(a, b) => eval(a, ctx)? && eval(b, ctx)?,
        Expr::Not(inner) => !eval(inner, ctx)?,
        Expr::Exists(path) => ctx.resolve(path).is_some_and(|v| !v.is_null()),
        Expr::Truthy(operand) => truthy(&operand_value(operand, ctx)),
        Expr::Compare(a, op, b) => {
            let (a, b) = (operand_value(a, ctx), operand_value(b, ctx));
            match op {
                CmpOp::Eq => values_equal(&a, &b),
                CmpOp::Ne => !values_equal(&a, &b),
                CmpOp::Contains => contains(&a, &b),
                CmpOp::Lt => order(&a, &b)? == Ordering::Less,
                CmpOp::Le => order(&a, &b)? != Ordering::Greater,
                CmpOp::Gt => order(&a, &b)? == Ordering::Greater,
                CmpOp::Ge => order(&a, &b)? != Ordering::Less,
            }
        }
    })
}

fn truthy(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn order(a: &serde_json::Value, b: &serde_json::Value) -> Result<Ordering, String> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x
            .partial_cmp(&y)
            .ok_or_else(|| "numbers are not comparable".to_string());
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Ok(x.cmp(y)),
        _ => Err(format!("cannot order {} and {}", a, b)),
    }
}

fn contains(haystack: &serde_json::Value, needle: &serde_json::Value) -> bool {
    match haystack {
        serde_json::Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        serde_json::Value::Array(items) => items.iter().any(|i| values_equal(i, needle)),
        serde_json::Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}
