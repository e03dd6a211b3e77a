//! Expression scanner
//!
//! A single left-to-right pass over the input bytes. Parenthesized groups
//! are extracted as balanced substrings (quote-aware) and parsed
//! recursively against the same builder. Metacharacters are escaped with
//! `\`. Unclosed quotes, brackets and parentheses at end of input are
//! auto-closed so half-typed interactive queries still compile.

use crate::expr::{ExprBuilder, LogicalOp, NumberCmp};
use thiserror::Error;

/// Field every unscoped term applies to.
const DEFAULT_FIELD: &str = "msg";

/// Expression parse failures, with the byte offset of the offending
/// character.
#[derive(Error, Debug, PartialEq)]
pub enum ExprError {
    /// A `[` opened while an array was already open.
    #[error("unexpected `[` at {0}")]
    UnexpectedBracket(usize),

    /// A `:` after the field name was already set.
    #[error("unexpected `:` at {0}")]
    UnexpectedColon(usize),

    /// A `[x TO y]` range whose bounds are not numeric.
    #[error("invalid range clause [{0}]")]
    InvalidRange(String),

    /// A nested group failed to parse.
    #[error("invalid expression `{expr}`: {source}")]
    Group {
        expr: String,
        #[source]
        source: Box<ExprError>,
    },
}

/// Compiles `expression` by driving `builder` through the parse, returning
/// the predicate the builder produced.
pub fn compile<B: ExprBuilder>(expression: &str, mut builder: B) -> Result<B::Expr, ExprError> {
    parse(expression.trim(), &mut builder)?;
    Ok(builder.build())
}

/// Runs one scanner pass over `expression`, emitting into `builder`.
/// Recursive for parenthesized groups.
pub fn parse<B: ExprBuilder>(expression: &str, builder: &mut B) -> Result<(), ExprError> {
    let qs = expression.as_bytes();
    let mut state = ParseState::default();

    let mut i = 0;
    while i < qs.len() {
        let b = qs[i];

        if b == b'(' && !state.in_array && !state.in_quote {
            // Extract the balanced group, tracking quotes so a ')' inside a
            // phrase does not close it.
            let mut inner: Vec<u8> = Vec::new();
            let mut parenthesis = 1;
            let mut inner_quote = false;
            let mut j = i + 1;
            while j < qs.len() {
                let c = qs[j];
                if c == b'(' && !inner_quote {
                    parenthesis += 1;
                    inner.push(c);
                } else if c == b')' && !inner_quote {
                    parenthesis -= 1;
                    if parenthesis == 0 {
                        break;
                    }
                    inner.push(c);
                } else if c == b'"' {
                    if qs[j - 1] != b'\\' {
                        inner_quote = !inner_quote;
                    }
                    inner.push(c);
                } else {
                    inner.push(c);
                }
                j += 1;
            }

            state.add_operator(builder);
            builder.group_start();

            let substr = String::from_utf8_lossy(&inner).into_owned();
            parse(&substr, builder).map_err(|e| ExprError::Group {
                expr: substr.clone(),
                source: Box::new(e),
            })?;

            builder.group_end();
            state.dirty = true;

            i = j;
        } else if b == b'[' && !state.in_quote {
            if i > 0 && qs[i - 1] == b'\\' {
                state.buf.pop();
                state.buf.push(b'[');
            } else if state.in_array {
                return Err(ExprError::UnexpectedBracket(i));
            } else {
                state.in_array = true;
            }
        } else if b == b']' && state.in_array && !state.in_quote {
            if i > 0 && qs[i - 1] == b'\\' {
                state.buf.pop();
                state.buf.push(b']');
            } else {
                state.add_term_single(builder);
                state.close_array(builder)?;
            }
        } else if b == b' ' {
            if state.in_quote {
                state.buf.push(b);
            } else {
                state.add_term_single(builder);
            }
        } else if b == b'"' {
            if i > 0 && qs[i - 1] == b'\\' {
                state.buf.pop();
                state.buf.push(b'"');
            } else if state.in_quote {
                state.in_quote = false;
                state.add_term_sequence(builder);
            } else {
                state.in_quote = true;
            }
        } else if b == b':' && !state.in_quote {
            if i > 0 && qs[i - 1] == b'\\' {
                state.buf.pop();
                state.buf.push(b':');
            } else if !state.field.is_empty() {
                return Err(ExprError::UnexpectedColon(i));
            } else {
                let field = String::from_utf8_lossy(&state.buf).trim().to_string();
                if !field.is_empty() {
                    state.field = field;
                }
                state.buf.clear();
            }
        } else {
            state.buf.push(b);
        }

        i += 1;
    }

    // Lenient terminal: whatever is still open gets closed as-is.
    if state.in_quote {
        state.add_term_sequence(builder);
    } else {
        state.add_term_single(builder);
    }
    state.close_array(builder)?;

    Ok(())
}

#[derive(Default)]
struct ParseState {
    in_quote: bool,
    in_array: bool,
    /// Pending explicit operator; terms separated by bare whitespace get OR.
    operator: Option<LogicalOp>,
    array_parts: Vec<String>,
    /// An operand has been emitted in this group.
    dirty: bool,
    buf: Vec<u8>,
    field: String,
}

impl ParseState {
    fn add_operator<B: ExprBuilder>(&mut self, builder: &mut B) {
        if self.dirty {
            builder.operator(self.operator.unwrap_or(LogicalOp::Or));
        }
        self.operator = None;
    }

    fn field_name(&self) -> &str {
        if self.field.is_empty() {
            DEFAULT_FIELD
        } else {
            &self.field
        }
    }

    /// A single term is a bare word such as `test` or `hello*`.
    fn add_term_single<B: ExprBuilder>(&mut self, builder: &mut B) {
        if self.in_array {
            if !self.buf.is_empty() {
                self.array_parts
                    .push(String::from_utf8_lossy(&self.buf).into_owned());
            }
            self.buf.clear();
            return;
        }

        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf).into_owned();

            // Boolean operators are uppercase only.
            if text == "AND" {
                self.operator = Some(LogicalOp::And);
                self.buf.clear();
                return;
            }
            if text == "OR" {
                self.operator = Some(LogicalOp::Or);
                self.buf.clear();
                return;
            }

            self.add_operator(builder);

            let scoped = !self.field.is_empty();
            let field = self.field_name().to_string();

            let mut numeric: Option<(NumberCmp, f64)> = None;
            if scoped {
                if text.starts_with('>') || text.starts_with('<') {
                    for (prefix, cmp) in [
                        (">=", NumberCmp::Ge),
                        (">", NumberCmp::Gt),
                        ("<=", NumberCmp::Le),
                        ("<", NumberCmp::Lt),
                    ] {
                        if let Some(rest) = text.strip_prefix(prefix) {
                            if let Ok(n) = rest.parse::<f64>() {
                                numeric = Some((cmp, n));
                            }
                            break;
                        }
                    }
                } else if let Ok(n) = text.trim().parse::<f64>() {
                    numeric = Some((NumberCmp::Eq, n));
                }
            }

            match numeric {
                Some((cmp, value)) => builder.number(&field, cmp, value),
                None => builder.text(
                    &field,
                    &text,
                    false,
                    text.contains('*') || text.contains('?'),
                ),
            }

            self.dirty = true;
        }

        self.buf.clear();
        self.field.clear();
    }

    /// A sequence is a phrase surrounded by double quotes.
    fn add_term_sequence<B: ExprBuilder>(&mut self, builder: &mut B) {
        if self.in_array {
            self.array_parts
                .push(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf.clear();
            return;
        }

        if !self.buf.is_empty() {
            self.add_operator(builder);

            let text = String::from_utf8_lossy(&self.buf).into_owned();
            builder.text(
                self.field_name(),
                &text,
                true,
                text.contains('*') || text.contains('?'),
            );
            self.dirty = true;
        }

        self.buf.clear();
        self.field.clear();
    }

    fn close_array<B: ExprBuilder>(&mut self, builder: &mut B) -> Result<(), ExprError> {
        if !self.in_array {
            return Ok(());
        }
        self.in_array = false;

        if self.array_parts.is_empty() {
            return Ok(());
        }

        self.add_operator(builder);
        let field = self.field_name().to_string();

        if self.array_parts.len() == 3 && self.array_parts[1] == "TO" {
            // field:[400 TO 499]
            let low: f64 = self.array_parts[0]
                .parse()
                .map_err(|_| ExprError::InvalidRange(self.array_parts.join(" ")))?;
            let high: f64 = self.array_parts[2]
                .parse()
                .map_err(|_| ExprError::InvalidRange(self.array_parts.join(" ")))?;
            builder.between(&field, low, high);
        } else {
            let mut numbers = Vec::new();
            let mut texts = Vec::new();
            for part in self.array_parts.drain(..) {
                match part.parse::<f64>() {
                    Ok(n) => numbers.push(n),
                    Err(_) => texts.push(part),
                }
            }

            let mixed = !numbers.is_empty() && !texts.is_empty();
            if mixed {
                builder.group_start();
            }
            if numbers.len() == 1 {
                builder.number(&field, NumberCmp::Eq, numbers[0]);
            } else if !numbers.is_empty() {
                builder.number_in(&field, numbers);
            }
            if mixed {
                builder.operator(LogicalOp::Or);
            }
            if !texts.is_empty() {
                builder.text_in(&field, texts);
            }
            if mixed {
                builder.group_end();
            }
        }

        self.dirty = true;
        self.array_parts.clear();
        Ok(())
    }
}
