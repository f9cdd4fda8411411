//! Condition expressions for guards, routing conditions and flush triggers.
//!
//! A deliberately small language evaluated against a JSON context object:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := compare ( "&&" compare )*
//! compare := unary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") unary )?
//! unary   := "!" unary | primary
//! primary := number | string | "true" | "false" | "null"
//!          | path | "(" expr ")"
//! path    := ident ( "." ident )*
//! ```
//!
//! Paths resolve against the context (`value.amount`, `vars.count`,
//! `batch.size`); missing segments resolve to `null`. Evaluation is pure and
//! deterministic. Logical operators require booleans and ordering requires
//! two numbers or two strings; anything else is an [`ExprError`].

use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use chumsky::{input::ValueInput, prelude::*};
use serde_json::Value;

/// Byte span of a token in the source text.
type Span = SimpleSpan<usize>;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    /// The source text contains a character sequence that is not a token.
    #[error("unexpected input at offset {offset}: {message}")]
    Lex {
        /// Byte offset of the problem.
        offset: usize,
        /// Description.
        message: String,
    },

    /// The token stream does not match the grammar.
    #[error("parse error: {message}")]
    Parse {
        /// Description.
        message: String,
    },

    /// An operator was applied to operands of unsupported types.
    #[error("type mismatch: cannot apply `{op}` to {left} and {right}")]
    TypeMismatch {
        /// The operator.
        op: &'static str,
        /// Left operand type.
        left: &'static str,
        /// Right operand type.
        right: &'static str,
    },

    /// The expression evaluated to a non-boolean where a condition was needed.
    #[error("condition evaluated to {found}, expected a boolean")]
    NotBoolean {
        /// Type of the value produced.
        found: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Dot,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Ident(s) => f.write_str(s),
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::Null => f.write_str("null"),
            Self::Dot => f.write_str("."),
            Self::EqEq => f.write_str("=="),
            Self::NotEq => f.write_str("!="),
            Self::Lt => f.write_str("<"),
            Self::Le => f.write_str("<="),
            Self::Gt => f.write_str(">"),
            Self::Ge => f.write_str(">="),
            Self::AndAnd => f.write_str("&&"),
            Self::OrOr => f.write_str("||"),
            Self::Bang => f.write_str("!"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

fn next_is(chars: &mut Peekable<CharIndices<'_>>, want: char) -> bool {
    if chars.peek().map(|&(_, n)| n) == Some(want) {
        chars.next();
        true
    } else {
        false
    }
}

fn take_while(
    chars: &mut Peekable<CharIndices<'_>>,
    text: &mut String,
    keep: impl Fn(char) -> bool,
) {
    while let Some(&(_, c)) = chars.peek() {
        if !keep(c) {
            break;
        }
        text.push(c);
        chars.next();
    }
}

/// Split `source` into spanned tokens.
///
/// A digit run right after `.` is a path segment (`tags.1`), not a number.
fn lex(source: &str) -> Result<Vec<(Tok, Span)>, ExprError> {
    let mut tokens: Vec<(Tok, Span)> = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let after_dot = matches!(tokens.last(), Some((Tok::Dot, _)));
        let tok = match c {
            '(' => {
                chars.next();
                Tok::LParen
            }
            ')' => {
                chars.next();
                Tok::RParen
            }
            '.' => {
                chars.next();
                Tok::Dot
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                chars.next();
                match c {
                    '=' if next_is(&mut chars, '=') => Tok::EqEq,
                    '!' if next_is(&mut chars, '=') => Tok::NotEq,
                    '!' => Tok::Bang,
                    '<' if next_is(&mut chars, '=') => Tok::Le,
                    '<' => Tok::Lt,
                    '>' if next_is(&mut chars, '=') => Tok::Ge,
                    '>' => Tok::Gt,
                    '&' if next_is(&mut chars, '&') => Tok::AndAnd,
                    '|' if next_is(&mut chars, '|') => Tok::OrOr,
                    other => {
                        return Err(ExprError::Lex {
                            offset,
                            message: format!("incomplete operator starting with `{other}`"),
                        });
                    }
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.next() {
                            text.push(escaped);
                        }
                        continue;
                    }
                    text.push(ch);
                }
                if !closed {
                    return Err(ExprError::Lex {
                        offset,
                        message: "unterminated string literal".to_owned(),
                    });
                }
                Tok::Str(text)
            }
            c if after_dot && c.is_ascii_digit() => {
                let mut text = String::new();
                take_while(&mut chars, &mut text, |d| d.is_ascii_digit());
                Tok::Ident(text)
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                take_while(&mut chars, &mut text, |d| d.is_ascii_digit() || d == '.');
                let number = text.parse::<f64>().map_err(|_err| ExprError::Lex {
                    offset,
                    message: format!("invalid number `{text}`"),
                })?;
                Tok::Number(number)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                take_while(&mut chars, &mut text, |d| d.is_alphanumeric() || d == '_');
                match text.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(text),
                }
            }
            other => {
                return Err(ExprError::Lex {
                    offset,
                    message: format!("unexpected character `{other}`"),
                });
            }
        };
        let end = chars.peek().map_or(source.len(), |&(i, _)| i);
        tokens.push((tok, (offset..end).into()));
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Comparison operator of an [`Expr::Compare`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A dotted path into the evaluation context.
    Path(Vec<String>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Short-circuit conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Binary comparison.
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// Parser for a whole condition.
///
/// `||` binds loosest, then `&&`, then a single non-associative comparison,
/// then prefix `!`.
fn condition_parser<'tokens, I>()
-> impl Parser<'tokens, I, Expr, extra::Err<Rich<'tokens, Tok, Span>>> + Clone
where
    I: ValueInput<'tokens, Token = Tok, Span = Span>,
{
    recursive(|condition| {
        let literal = select! {
            Tok::Number(n) => Expr::Literal(number_value(n)),
            Tok::Str(s) => Expr::Literal(Value::String(s)),
            Tok::True => Expr::Literal(Value::Bool(true)),
            Tok::False => Expr::Literal(Value::Bool(false)),
            Tok::Null => Expr::Literal(Value::Null),
        }
        .labelled("literal");

        let path = select! { Tok::Ident(s) => s }
            .labelled("path segment")
            .separated_by(just(Tok::Dot))
            .at_least(1)
            .collect::<Vec<_>>()
            .map(Expr::Path);

        let group = condition.delimited_by(just(Tok::LParen), just(Tok::RParen));

        let primary = choice((literal, path, group)).labelled("expression");

        let unary = just(Tok::Bang)
            .repeated()
            .foldr(primary, |_bang, inner| Expr::Not(Box::new(inner)));

        let cmp_op = select! {
            Tok::EqEq => CmpOp::Eq,
            Tok::NotEq => CmpOp::Ne,
            Tok::Lt => CmpOp::Lt,
            Tok::Le => CmpOp::Le,
            Tok::Gt => CmpOp::Gt,
            Tok::Ge => CmpOp::Ge,
        }
        .labelled("comparison");

        let compare = unary.clone().foldl(
            cmp_op.then(unary).repeated().at_most(1),
            |left, (op, right)| Expr::Compare(op, Box::new(left), Box::new(right)),
        );

        let and = compare.clone().foldl(
            just(Tok::AndAnd).ignore_then(compare).repeated(),
            |left, right| Expr::And(Box::new(left), Box::new(right)),
        );

        and.clone().foldl(
            just(Tok::OrOr).ignore_then(and).repeated(),
            |left, right| Expr::Or(Box::new(left), Box::new(right)),
        )
    })
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

impl Expr {
    /// Parse an expression from source text.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::Lex`] or [`ExprError::Parse`] for malformed input.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = lex(source)?;
        let eoi: Span = (source.len()..source.len()).into();
        let input = tokens.as_slice().map(eoi, |(tok, span)| (tok, span));

        condition_parser()
            .then_ignore(end())
            .parse(input)
            .into_result()
            .map_err(|errors| ExprError::Parse {
                message: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            })
    }

    /// Evaluate against a context object.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::TypeMismatch`] when operand types do not fit.
    pub fn evaluate(&self, ctx: &Value) -> Result<Value, ExprError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Path(segments) => Ok(resolve_path(ctx, segments)),
            Self::Not(inner) => {
                let v = inner.evaluate(ctx)?;
                let b = as_bool(&v, "!", &Value::Bool(true))?;
                Ok(Value::Bool(!b))
            }
            Self::And(l, r) => {
                let lv = l.evaluate(ctx)?;
                if !as_bool(&lv, "&&", &lv)? {
                    return Ok(Value::Bool(false));
                }
                let rv = r.evaluate(ctx)?;
                Ok(Value::Bool(as_bool(&rv, "&&", &lv)?))
            }
            Self::Or(l, r) => {
                let lv = l.evaluate(ctx)?;
                if as_bool(&lv, "||", &lv)? {
                    return Ok(Value::Bool(true));
                }
                let rv = r.evaluate(ctx)?;
                Ok(Value::Bool(as_bool(&rv, "||", &lv)?))
            }
            Self::Compare(op, l, r) => {
                let lv = l.evaluate(ctx)?;
                let rv = r.evaluate(ctx)?;
                compare(*op, &lv, &rv).map(Value::Bool)
            }
        }
    }

    /// Evaluate and require a boolean result.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError::NotBoolean`] if the result is not a boolean, or
    /// any evaluation error.
    pub fn matches(&self, ctx: &Value) -> Result<bool, ExprError> {
        match self.evaluate(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::NotBoolean {
                found: type_name(&other),
            }),
        }
    }
}

/// Parse `source` and evaluate it as a condition in one step.
///
/// # Errors
///
/// Any [`ExprError`] from parsing or evaluation.
pub fn evaluate_condition(source: &str, ctx: &Value) -> Result<bool, ExprError> {
    Expr::parse(source)?.matches(ctx)
}

fn resolve_path(ctx: &Value, segments: &[String]) -> Value {
    let mut current = ctx;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn as_bool(v: &Value, op: &'static str, other: &Value) -> Result<bool, ExprError> {
    v.as_bool().ok_or(ExprError::TypeMismatch {
        op,
        left: type_name(v),
        right: type_name(other),
    })
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, ExprError> {
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            Some(a.total_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (CmpOp::Eq, Some(o)) => Ok(o == Ordering::Equal),
        (CmpOp::Ne, Some(o)) => Ok(o != Ordering::Equal),
        (CmpOp::Eq, None) => Ok(l == r),
        (CmpOp::Ne, None) => Ok(l != r),
        (CmpOp::Lt, Some(o)) => Ok(o == Ordering::Less),
        (CmpOp::Le, Some(o)) => Ok(o != Ordering::Greater),
        (CmpOp::Gt, Some(o)) => Ok(o == Ordering::Greater),
        (CmpOp::Ge, Some(o)) => Ok(o != Ordering::Less),
        (_, None) => Err(ExprError::TypeMismatch {
            op: op.symbol(),
            left: type_name(l),
            right: type_name(r),
        }),
    }
}

const fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx() -> Value {
        json!({
            "value": { "amount": 250, "status": "approved", "tags": ["a", "b"] },
            "vars": { "retries": 2 },
            "state": "review",
        })
    }

    #[test]
    fn numeric_comparisons() {
        assert!(evaluate_condition("value.amount > 100", &ctx()).unwrap());
        assert!(evaluate_condition("value.amount <= 250", &ctx()).unwrap());
        assert!(!evaluate_condition("value.amount < 250", &ctx()).unwrap());
        assert!(evaluate_condition("vars.retries == 2", &ctx()).unwrap());
        assert!(evaluate_condition("vars.retries >= -1.5", &ctx()).unwrap());
    }

    #[test]
    fn string_and_path_comparisons() {
        assert!(evaluate_condition("value.status == 'approved'", &ctx()).unwrap());
        assert!(evaluate_condition("state != \"done\"", &ctx()).unwrap());
        assert!(evaluate_condition("value.tags.1 == 'b'", &ctx()).unwrap());
        assert!(evaluate_condition("value.missing == null", &ctx()).unwrap());
    }

    #[test]
    fn logical_operators_and_grouping() {
        assert!(
            evaluate_condition("value.amount > 100 && (state == 'review' || state == 'x')", &ctx())
                .unwrap()
        );
        assert!(evaluate_condition("!(vars.retries > 5)", &ctx()).unwrap());
        assert!(!evaluate_condition("false || value.amount < 0", &ctx()).unwrap());
        assert!(evaluate_condition("true", &ctx()).unwrap());
    }

    #[test]
    fn short_circuit_skips_type_errors() {
        assert!(!evaluate_condition("false && value.status > 3", &ctx()).unwrap());
        assert!(evaluate_condition("true || value.status > 3", &ctx()).unwrap());
    }

    #[test]
    fn malformed_expressions_are_errors() {
        assert!(matches!(Expr::parse("value.amount >"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("(true"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("a = b"), Err(ExprError::Lex { .. })));
        assert!(matches!(Expr::parse("'open"), Err(ExprError::Lex { .. })));
        assert!(matches!(Expr::parse("a b"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("#"), Err(ExprError::Lex { .. })));
    }

    #[test]
    fn precedence_follows_the_grammar() {
        let path = |p: &str| Box::new(Expr::Path(p.split('.').map(str::to_owned).collect()));
        let parsed = Expr::parse("!a || b.c && d.0 == 1").unwrap();
        assert_eq!(
            parsed,
            Expr::Or(
                Box::new(Expr::Not(path("a"))),
                Box::new(Expr::And(
                    path("b.c"),
                    Box::new(Expr::Compare(
                        CmpOp::Eq,
                        path("d.0"),
                        Box::new(Expr::Literal(json!(1.0))),
                    )),
                )),
            )
        );
    }

    #[test]
    fn comparisons_do_not_chain() {
        assert!(matches!(Expr::parse("a == b == c"), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("a."), Err(ExprError::Parse { .. })));
        assert!(Expr::parse("(a == b) == true").is_ok());
    }

    #[test]
    fn type_mismatches_are_errors() {
        assert!(matches!(
            evaluate_condition("value.status > 3", &ctx()),
            Err(ExprError::TypeMismatch { .. })
        ));
        assert!(matches!(
            evaluate_condition("value.amount", &ctx()),
            Err(ExprError::NotBoolean { found: "number" })
        ));
        assert!(matches!(
            evaluate_condition("value.amount && true", &ctx()),
            Err(ExprError::TypeMismatch { .. })
        ));
    }
}
