//! In-memory expression builder
//!
//! Compiles the search DSL into a closure over an [`Entry`], decoding the
//! entry's content bytes as a JSON object. Useful for storages that keep
//! records in memory or for filtering before persistence.

use crate::expr::wildcard::wildcard_match;
use crate::expr::{ExprBuilder, LogicalOp, NumberCmp};
use crate::ingest::Entry;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A compiled predicate over a single entry.
pub type EntryPredicate = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Expression node tree evaluated against the decoded content object.
#[derive(Debug, Clone)]
enum MemExpr {
    Group(Vec<MemExpr>),
    And(Vec<MemExpr>),
    Or(Vec<MemExpr>),
    Text {
        field: String,
        term: String,
        sequence: bool,
        wildcard: bool,
    },
    Number {
        field: String,
        cmp: NumberCmp,
        value: f64,
    },
    Between {
        field: String,
        low: f64,
        high: f64,
    },
    TextIn {
        field: String,
        values: Vec<String>,
    },
    NumberIn {
        field: String,
        values: Vec<f64>,
    },
}

impl MemExpr {
    fn eval(&self, object: &Map<String, Value>) -> bool {
        match self {
            MemExpr::Group(exprs) | MemExpr::And(exprs) => {
                exprs.iter().all(|e| e.eval(object))
            }
            MemExpr::Or(exprs) => exprs.iter().any(|e| e.eval(object)),
            MemExpr::Text {
                field,
                term,
                sequence,
                wildcard,
            } => match field_text(object, field) {
                Some(value) => {
                    if *sequence && !*wildcard {
                        value == *term
                    } else if *wildcard {
                        wildcard_match(term, &value)
                    } else {
                        wildcard_match(&format!("*{term}*"), &value)
                    }
                }
                None => false,
            },
            MemExpr::Number { field, cmp, value } => match field_number(object, field) {
                Some(v) => cmp.matches(v, *value),
                None => false,
            },
            MemExpr::Between { field, low, high } => match field_number(object, field) {
                Some(v) => v >= *low && v <= *high,
                None => false,
            },
            MemExpr::TextIn { field, values } => match field_text(object, field) {
                Some(v) => values.iter().any(|candidate| *candidate == v),
                None => false,
            },
            MemExpr::NumberIn { field, values } => match field_number(object, field) {
                Some(v) => values.iter().any(|candidate| *candidate == v),
                None => false,
            },
        }
    }
}

fn field_text(object: &Map<String, Value>, field: &str) -> Option<String> {
    let text = match object.get(field)? {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).ok()?,
    };
    (!text.is_empty()).then_some(text)
}

fn field_number(object: &Map<String, Value>, field: &str) -> Option<f64> {
    match object.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Builds an [`EntryPredicate`] from the parse. Trailing AND/OR operators
/// absorb the operand that follows them, so `a AND b OR c` folds left.
#[derive(Default)]
pub struct MemoryExprBuilder {
    stack: Vec<MemExpr>,
    groups: Vec<Vec<MemExpr>>,
}

impl MemoryExprBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, expr: MemExpr) {
        match self.stack.last_mut() {
            Some(MemExpr::And(exprs)) | Some(MemExpr::Or(exprs)) => exprs.push(expr),
            _ => self.stack.push(expr),
        }
    }
}

impl ExprBuilder for MemoryExprBuilder {
    type Expr = EntryPredicate;

    fn group_start(&mut self) {
        self.groups.push(std::mem::take(&mut self.stack));
    }

    fn group_end(&mut self) {
        let Some(parent) = self.groups.pop() else {
            return;
        };
        let group = MemExpr::Group(std::mem::replace(&mut self.stack, parent));
        self.add(group);
    }

    fn operator(&mut self, op: LogicalOp) {
        let Some(last) = self.stack.pop() else {
            return;
        };
        let combined = match (op, last) {
            (LogicalOp::And, expr @ MemExpr::And(_)) => expr,
            (LogicalOp::Or, expr @ MemExpr::Or(_)) => expr,
            (LogicalOp::And, expr) => MemExpr::And(vec![expr]),
            (LogicalOp::Or, expr) => MemExpr::Or(vec![expr]),
        };
        self.stack.push(combined);
    }

    fn text(&mut self, field: &str, term: &str, sequence: bool, wildcard: bool) {
        self.add(MemExpr::Text {
            field: field.to_string(),
            term: term.to_string(),
            sequence,
            wildcard,
        });
    }

    fn number(&mut self, field: &str, cmp: NumberCmp, value: f64) {
        self.add(MemExpr::Number {
            field: field.to_string(),
            cmp,
            value,
        });
    }

    fn between(&mut self, field: &str, low: f64, high: f64) {
        self.add(MemExpr::Between {
            field: field.to_string(),
            low,
            high,
        });
    }

    fn text_in(&mut self, field: &str, values: Vec<String>) {
        self.add(MemExpr::TextIn {
            field: field.to_string(),
            values,
        });
    }

    fn number_in(&mut self, field: &str, values: Vec<f64>) {
        self.add(MemExpr::NumberIn {
            field: field.to_string(),
            values,
        });
    }

    fn build(self) -> EntryPredicate {
        let stack = self.stack;
        if stack.is_empty() {
            return Arc::new(|_| true);
        }
        Arc::new(move |entry: &Entry| {
            let Ok(Value::Object(object)) =
                serde_json::from_slice::<Value>(&entry.content)
            else {
                return false;
            };
            stack.iter().all(|expr| expr.eval(&object))
        })
    }
}
