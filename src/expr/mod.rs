//! Expression engine: a small CEL-like language over [`Value`].
//!
//! Sources are compiled against typed variable declarations, then evaluated
//! against an activation binding each declared name to a value. Identifiers
//! cannot contain dots; callers rewrite `local.a` to `local_a` first.

pub mod eval;
pub mod lexer;
pub mod parser;

use crate::core::types::Value;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while compiling or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("lex error at offset {offset}: {message}")]
    Lex { offset: usize, message: String },

    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("undeclared reference to '{0}'")]
    Undeclared(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("no value bound for '{0}'")]
    Unbound(String),

    #[error("variable '{name}' is declared {expected} but bound to {actual}")]
    BindingType {
        name: String,
        expected: VarType,
        actual: String,
    },

    #[error("no such overload: {0}")]
    NoOverload(String),

    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("index {index} out of range for list of size {size}")]
    IndexOutOfRange { index: i64, size: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,
}

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Int,
    Dyn,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Dyn => write!(f, "dyn"),
        }
    }
}

/// Variable name → declared type.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    vars: IndexMap<String, VarType>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: &str, var_type: VarType) {
        self.vars.insert(name.to_string(), var_type);
    }

    pub fn get(&self, name: &str) -> Option<VarType> {
        self.vars.get(name).copied()
    }
}

/// Variable name → bound value.
pub type Activation = FxHashMap<String, Value>;

/// A compiled, reusable expression.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    ast: parser::Expr,
    declarations: Declarations,
}

/// Parse `source` and check every identifier and function against the declarations.
pub fn compile(source: &str, declarations: &Declarations) -> Result<Program, ExprError> {
    let ast = parser::parse(source)?;

    let mut idents = Vec::new();
    ast.identifiers(&mut idents);
    if let Some(missing) = idents.iter().find(|id| declarations.get(id).is_none()) {
        return Err(ExprError::Undeclared(missing.clone()));
    }
    check_functions(&ast)?;

    Ok(Program {
        source: source.to_string(),
        ast,
        declarations: declarations.clone(),
    })
}

fn check_functions(expr: &parser::Expr) -> Result<(), ExprError> {
    use parser::Expr;
    match expr {
        Expr::Call {
            target,
            function,
            args,
        } => {
            let known = match target {
                Some(t) => {
                    check_functions(t)?;
                    eval::METHODS.contains(&function.as_str())
                }
                None => eval::FUNCTIONS.contains(&function.as_str()),
            };
            if !known {
                return Err(ExprError::UnknownFunction(function.clone()));
            }
            args.iter().try_for_each(check_functions)
        }
        Expr::Literal(_) | Expr::Ident(_) => Ok(()),
        Expr::Member(t, _) => check_functions(t),
        Expr::Unary(_, e) => check_functions(e),
        Expr::Index(a, b) | Expr::Binary(_, a, b) => {
            check_functions(a)?;
            check_functions(b)
        }
        Expr::Ternary(a, b, c) => {
            check_functions(a)?;
            check_functions(b)?;
            check_functions(c)
        }
        Expr::List(items) => items.iter().try_for_each(check_functions),
        Expr::Map(entries) => entries.iter().try_for_each(|(k, v)| {
            check_functions(k)?;
            check_functions(v)
        }),
    }
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an activation. Bindings must match declared types.
    pub fn eval(&self, activation: &Activation) -> Result<Value, ExprError> {
        for (name, value) in activation {
            if self.declarations.get(name) == Some(VarType::Int) && !matches!(value, Value::Int(_))
            {
                return Err(ExprError::BindingType {
                    name: name.clone(),
                    expected: VarType::Int,
                    actual: value.type_name().to_string(),
                });
            }
        }
        eval::eval(&self.ast, activation)
    }
}
