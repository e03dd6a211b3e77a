//! Search-expression compiler
//!
//! The query DSL (`field:hello* AND (status:[400 TO 499] OR "fatal error")`)
//! is parsed exactly once by a hand-written scanner and drives an
//! [`ExprBuilder`] implementation, so the same parse can emit either a
//! relational predicate (see `storage::expr`) or an in-memory closure over
//! an [`Entry`](crate::ingest::Entry) (see [`memory`]).
//!
//! Compiled expressions are memoized by trimmed input via [`ExprCache`].

pub mod memory;
pub mod parser;
pub mod wildcard;

pub use parser::{compile, ExprError};

use std::collections::HashMap;
use std::sync::Mutex;

/// Boolean connective between operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

impl std::fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberCmp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl NumberCmp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            NumberCmp::Eq => "=",
            NumberCmp::Gt => ">",
            NumberCmp::Lt => "<",
            NumberCmp::Ge => ">=",
            NumberCmp::Le => "<=",
        }
    }

    pub fn matches(&self, value: f64, against: f64) -> bool {
        match self {
            NumberCmp::Eq => value == against,
            NumberCmp::Gt => value > against,
            NumberCmp::Lt => value < against,
            NumberCmp::Ge => value >= against,
            NumberCmp::Le => value <= against,
        }
    }
}

/// Strategy interface driven by the parser. No predicate is built by the
/// parser itself; each backend supplies its own builder.
pub trait ExprBuilder {
    /// The compiled predicate type.
    type Expr;

    fn group_start(&mut self);
    fn group_end(&mut self);
    fn operator(&mut self, op: LogicalOp);
    /// A text operand. `sequence` marks a quoted phrase, `wildcard` marks
    /// the presence of `*` or `?`.
    fn text(&mut self, field: &str, term: &str, sequence: bool, wildcard: bool);
    fn number(&mut self, field: &str, cmp: NumberCmp, value: f64);
    fn between(&mut self, field: &str, low: f64, high: f64);
    fn text_in(&mut self, field: &str, values: Vec<String>);
    fn number_in(&mut self, field: &str, values: Vec<f64>);
    fn build(self) -> Self::Expr;
}

/// Memoizes compiled expressions keyed by the trimmed input string, so
/// repeated queries reuse the compiled predicate.
pub struct ExprCache<E> {
    cache: Mutex<HashMap<String, E>>,
}

impl<E: Clone> ExprCache<E> {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_compile<B>(
        &self,
        expression: &str,
        builder: impl FnOnce() -> B,
    ) -> Result<E, ExprError>
    where
        B: ExprBuilder<Expr = E>,
    {
        let key = expression.trim();
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(expr) = cache.get(key) {
                return Ok(expr.clone());
            }
        }

        let compiled = compile(key, builder())?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), compiled.clone());
        Ok(compiled)
    }
}

impl<E: Clone> Default for ExprCache<E> {
    fn default() -> Self {
        Self::new()
    }
}
