//! Relational expression builder
//!
//! Emits a parameterized SQL predicate over `json_extract(e.content, ...)`.
//! Wildcard terms use GLOB so `*` and `?` map natively; numeric operands
//! are CAST to NUMERIC before comparing.

use crate::expr::{ExprBuilder, LogicalOp, NumberCmp};
use rusqlite::types::Value;

/// A compiled relational predicate: SQL fragment plus its bind arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlExpr {
    pub sql: String,
    pub args: Vec<Value>,
}

impl SqlExpr {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Builds a [`SqlExpr`] from the parse. Groups are rendered into their own
/// buffer and folded back into the parent when they close.
#[derive(Default)]
pub struct SqlExprBuilder {
    sql: String,
    args: Vec<Value>,
    groups: Vec<String>,
}

impl SqlExprBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn json_path(field: &str) -> Value {
        Value::Text(format!("$.{field}"))
    }
}

impl ExprBuilder for SqlExprBuilder {
    type Expr = SqlExpr;

    fn group_start(&mut self) {
        self.sql.push('(');
        self.groups.push(std::mem::take(&mut self.sql));
    }

    fn group_end(&mut self) {
        if let Some(mut parent) = self.groups.pop() {
            parent.push_str(&self.sql);
            self.sql = parent;
        }
        self.sql.push(')');
    }

    fn operator(&mut self, op: LogicalOp) {
        if !self.sql.is_empty() {
            self.sql.push(' ');
            self.sql.push_str(op.as_str());
            self.sql.push(' ');
        }
    }

    fn text(&mut self, field: &str, term: &str, sequence: bool, wildcard: bool) {
        if sequence && !wildcard {
            self.sql.push_str("json_extract(e.content, ?) = ?");
            self.args.push(Self::json_path(field));
            self.args.push(Value::Text(term.to_string()));
        } else {
            self.sql.push_str("json_extract(e.content, ?) GLOB ?");
            self.args.push(Self::json_path(field));
            let pattern = if wildcard {
                term.to_string()
            } else {
                format!("*{term}*")
            };
            self.args.push(Value::Text(pattern));
        }
    }

    fn number(&mut self, field: &str, cmp: NumberCmp, value: f64) {
        self.sql
            .push_str("CAST(json_extract(e.content, ?) AS NUMERIC) ");
        self.sql.push_str(cmp.as_sql());
        self.sql.push_str(" ?");
        self.args.push(Self::json_path(field));
        self.args.push(Value::Real(value));
    }

    fn between(&mut self, field: &str, low: f64, high: f64) {
        self.sql
            .push_str("CAST(json_extract(e.content, ?) AS NUMERIC) BETWEEN ? AND ?");
        self.args.push(Self::json_path(field));
        self.args.push(Value::Real(low));
        self.args.push(Value::Real(high));
    }

    fn text_in(&mut self, field: &str, values: Vec<String>) {
        self.sql.push_str("json_extract(e.content, ?) IN (");
        self.args.push(Self::json_path(field));
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push(',');
            }
            self.sql.push('?');
            self.args.push(Value::Text(value));
        }
        self.sql.push(')');
    }

    fn number_in(&mut self, field: &str, values: Vec<f64>) {
        self.sql
            .push_str("CAST(json_extract(e.content, ?) AS NUMERIC) IN (");
        self.args.push(Self::json_path(field));
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push(',');
            }
            self.sql.push('?');
            self.args.push(Value::Real(value));
        }
        self.sql.push(')');
    }

    fn build(self) -> SqlExpr {
        SqlExpr {
            sql: self.sql,
            args: self.args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::compile;

    fn sql_of(expr: &str) -> SqlExpr {
        compile(expr, SqlExprBuilder::new()).unwrap()
    }

    #[test]
    fn test_plain_term() {
        let e = sql_of("hello");
        assert_eq!(e.sql, "json_extract(e.content, ?) GLOB ?");
        assert_eq!(
            e.args,
            vec![
                Value::Text("$.msg".into()),
                Value::Text("*hello*".into())
            ]
        );
    }

    #[test]
    fn test_wildcard_term_is_not_wrapped() {
        let e = sql_of("field:hello*");
        assert_eq!(e.sql, "json_extract(e.content, ?) GLOB ?");
        assert_eq!(
            e.args,
            vec![
                Value::Text("$.field".into()),
                Value::Text("hello*".into())
            ]
        );
    }

    #[test]
    fn test_sequence_is_equality() {
        let e = sql_of(r#""hello world""#);
        assert_eq!(e.sql, "json_extract(e.content, ?) = ?");
    }

    #[test]
    fn test_numeric_compare() {
        let e = sql_of("status:>=400");
        assert_eq!(e.sql, "CAST(json_extract(e.content, ?) AS NUMERIC) >= ?");
        assert_eq!(
            e.args,
            vec![Value::Text("$.status".into()), Value::Real(400.0)]
        );
    }

    #[test]
    fn test_between() {
        let e = sql_of("status:[400 TO 499]");
        assert_eq!(
            e.sql,
            "CAST(json_extract(e.content, ?) AS NUMERIC) BETWEEN ? AND ?"
        );
    }

    #[test]
    fn test_operators_and_groups() {
        let e = sql_of("hello AND (a OR b)");
        assert_eq!(
            e.sql,
            "json_extract(e.content, ?) GLOB ? AND (json_extract(e.content, ?) GLOB ? OR json_extract(e.content, ?) GLOB ?)"
        );
    }

    #[test]
    fn test_mixed_array_groups_number_and_text() {
        let e = sql_of("field:[100 a 200]");
        assert_eq!(
            e.sql,
            "(CAST(json_extract(e.content, ?) AS NUMERIC) IN (?,?) OR json_extract(e.content, ?) IN (?))"
        );
    }

    #[test]
    fn test_empty_expression() {
        let e = sql_of("");
        assert!(e.is_empty());
    }
}
