//! KF-006: Expression rendering.
//!
//! Resolves `$`-prefixed references (`$local.a`, `$input.ctx.name`,
//! `$count.index`) inside nested values. References resolve from the
//! instance-local variables first, then from the variable store. The
//! referenced source is rewritten to dotless identifiers (`local_a`),
//! compiled and evaluated; the native result is returned as-is.

use super::error::{Error, Result};
use super::store::Store;
use super::types::{LocalVars, Value, COUNT_INDEX};
use crate::expr::{self, Activation, Declarations, VarType};
use indexmap::IndexSet;
use regex::Regex;
use std::sync::LazyLock;

/// Characters that mark a string as a candidate expression.
const SPECIAL_CHARS: &str = "$&+,:;=?@#|'<>-^*()%!";

/// `<namespace>.<identifier>` at the start of a token following `$`.
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_]+)").expect("static regex")
});

/// Whether a string contains any expression special character.
pub fn has_special_chars(s: &str) -> bool {
    s.chars().any(|c| SPECIAL_CHARS.contains(c))
}

/// Extract the distinct `<namespace>.<identifier>` references of an
/// expression, in order of first appearance.
pub fn get_references(expression: &str) -> IndexSet<String> {
    let mut refs = IndexSet::new();
    for token in expression.split('$').skip(1) {
        if let Some(caps) = REFERENCE.captures(token) {
            refs.insert(format!("{}.{}", &caps[1], &caps[2]));
        }
    }
    refs
}

/// References of every string nested inside a value.
pub fn value_references(value: &Value, out: &mut IndexSet<String>) {
    match value {
        Value::String(s) => out.extend(get_references(s)),
        Value::List(items) => items.iter().for_each(|v| value_references(v, out)),
        Value::Map(m) => m.values().for_each(|v| value_references(v, out)),
        _ => {}
    }
}

/// Identifier used inside the compiled expression for a dotted reference.
pub fn identifier_for(reference: &str) -> String {
    reference.replace('.', "_")
}

/// Strip `$` sigils and rewrite `$ns.id` to `ns_id`.
fn rewrite(expression: &str) -> String {
    let mut parts = expression.split('$');
    let mut out = parts.next().unwrap_or_default().to_string();
    for token in parts {
        match REFERENCE.captures(token) {
            Some(caps) => {
                let whole = &caps[0];
                out.push_str(&caps[1]);
                out.push('_');
                out.push_str(&caps[2]);
                out.push_str(&token[whole.len()..]);
            }
            None => out.push_str(token),
        }
    }
    out
}

/// Renders values against a store and one instance's local variables.
pub struct Renderer<'a> {
    store: &'a Store,
    locals: &'a LocalVars,
}

impl<'a> Renderer<'a> {
    pub fn new(store: &'a Store, locals: &'a LocalVars) -> Self {
        Self { store, locals }
    }

    /// Render a value: maps and lists recursively, strings as expressions,
    /// everything else unchanged.
    pub fn render(&self, value: Value) -> Result<Value> {
        match value {
            Value::Map(m) => Ok(Value::Map(
                m.into_iter()
                    .map(|(k, v)| Ok((k, self.render(v)?)))
                    .collect::<Result<_>>()?,
            )),
            Value::List(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|v| self.render(v))
                    .collect::<Result<_>>()?,
            )),
            Value::String(s) => self.render_string(s),
            other => Ok(other),
        }
    }

    fn render_string(&self, s: String) -> Result<Value> {
        // Without a `$` there is nothing to resolve: `app-name` or
        // `http://host:80` stay literal.
        if !has_special_chars(&s) || !s.contains('$') {
            return Ok(Value::String(s));
        }

        let mut declarations = Declarations::new();
        let mut activation = Activation::default();
        for reference in get_references(&s) {
            let value = self.resolve(&reference, &s)?;
            let var_type = if reference == COUNT_INDEX {
                VarType::Int
            } else {
                VarType::Dyn
            };
            let ident = identifier_for(&reference);
            declarations.declare(&ident, var_type);
            activation.insert(ident, value);
        }

        let source = rewrite(&s);
        let program = expr::compile(&source, &declarations).map_err(|cause| Error::Compile {
            expression: s.clone(),
            cause,
        })?;
        program.eval(&activation).map_err(|cause| Error::Evaluate {
            expression: s.clone(),
            cause,
        })
    }

    fn resolve(&self, reference: &str, expression: &str) -> Result<Value> {
        if let Some(v) = self.locals.get(reference) {
            return Ok(v.clone());
        }
        match self.store.get(reference) {
            Ok(variable) => Ok(variable.to_value()),
            Err(Error::VariableNotFound(_)) => Err(Error::UnresolvedReference {
                reference: reference.to_string(),
                expression: expression.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
