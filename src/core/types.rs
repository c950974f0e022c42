//! KF-001: Core types: values, blocks, vertices, variables, diagnostics.
//!
//! Every payload a block carries is a [`Value`]: a tagged variant over the
//! JSON/YAML data model with order-preserving maps. All types derive
//! Serialize/Deserialize so graph documents and provider payloads roundtrip.

use indexmap::{IndexMap, IndexSet};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::dag::Dag;

/// Key used for the result list of single-valued blocks.
pub const DUMMY_KEY: &str = "__kform_dummy_key__";

/// Name of the universal start vertex of every graph.
pub const ROOT_VERTEX: &str = "root";

// ============================================================================
// Values
// ============================================================================

/// A dynamic payload value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "double",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a dotted path (`metadata.name`) through nested maps.
    pub fn pointer(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self, |current, segment| current.as_map()?.get(segment))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => write!(f, "{}", s),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "{:?}", other),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(m: IndexMap<String, Value>) -> Self {
        Self::Map(m)
    }
}

// ============================================================================
// Blocks
// ============================================================================

/// Block type enum. Determines which runner executes a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Root,
    Module,
    Input,
    Output,
    Local,
    Resource,
    Data,
    Provider,
}

impl BlockType {
    /// Block types whose per-instance results are pre-sized in the store
    /// before any instance runs.
    pub fn stores_instances(&self) -> bool {
        matches!(
            self,
            Self::Module | Self::Output | Self::Local | Self::Resource | Self::Data
        )
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Module => write!(f, "module"),
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Local => write!(f, "local"),
            Self::Resource => write!(f, "resource"),
            Self::Data => write!(f, "data"),
            Self::Provider => write!(f, "provider"),
        }
    }
}

/// Loop and meta attributes of a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    /// Number of instances (int or integer string, may be an expression)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Value>,

    /// List or map to expand over (may be an expression)
    #[serde(default, alias = "for_each", skip_serializing_if = "Option::is_none")]
    pub for_each: Option<Value>,

    /// Module source (provenance only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Explicit provider for resource/data blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Raw, unrendered payload of a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockContext {
    #[serde(default)]
    pub attributes: Attributes,

    /// Value of local/output blocks
    #[serde(default)]
    pub value: Option<Value>,

    /// Config of resource/data/provider blocks
    #[serde(default)]
    pub config: Option<Value>,

    /// Default of input blocks
    #[serde(default)]
    pub default: Option<Value>,

    /// Parameters passed to a module's inputs
    #[serde(default)]
    pub input_params: IndexMap<String, Value>,
}

impl BlockContext {
    /// All unrendered payload values, used for dependency extraction.
    pub fn payloads(&self) -> Vec<&Value> {
        let mut out: Vec<&Value> = Vec::new();
        out.extend(self.attributes.count.iter());
        out.extend(self.attributes.for_each.iter());
        out.extend(self.value.iter());
        out.extend(self.config.iter());
        out.extend(self.default.iter());
        out.extend(self.input_params.values());
        out
    }
}

// ============================================================================
// Vertices
// ============================================================================

/// The scheduler's runtime representation of a block.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub block_name: String,
    pub module_name: String,
    /// Provenance only
    pub file_name: String,
    pub block_type: BlockType,
    pub block_context: BlockContext,
    /// Block names this vertex's payload references
    pub dependencies: IndexSet<String>,
    /// Child graph, present only for module vertices
    pub dag: Option<Arc<Dag>>,
}

impl Vertex {
    pub fn new(block_name: &str, block_type: BlockType) -> Self {
        Self {
            block_name: block_name.to_string(),
            module_name: String::new(),
            file_name: String::new(),
            block_type,
            block_context: BlockContext::default(),
            dependencies: IndexSet::new(),
            dag: None,
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_VERTEX, BlockType::Root)
    }

    /// Second segment of the block name (`module.net` → `net`).
    pub fn short_name(&self) -> &str {
        self.block_name
            .split_once('.')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.block_name)
    }

    /// First segment of the block name (`kubernetes_manifest.cm` → `kubernetes_manifest`).
    pub fn namespace(&self) -> &str {
        self.block_name
            .split_once('.')
            .map(|(ns, _)| ns)
            .unwrap_or(&self.block_name)
    }
}

// ============================================================================
// Variables
// ============================================================================

/// The stored result of one vertex: sub-key → one value per loop instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub data: IndexMap<String, Vec<Value>>,
}

impl Variable {
    /// A single-valued, single-instance variable.
    pub fn single(value: Value) -> Self {
        Self {
            data: IndexMap::from([(DUMMY_KEY.to_string(), vec![value])]),
        }
    }

    /// A single-valued variable with `total` empty instance slots.
    pub fn sized(total: usize) -> Self {
        Self {
            data: IndexMap::from([(DUMMY_KEY.to_string(), vec![Value::Null; total])]),
        }
    }

    /// Convert to the value an expression sees when referencing this block.
    pub fn to_value(&self) -> Value {
        fn collapse(items: &[Value]) -> Value {
            match items {
                [one] => one.clone(),
                many => Value::List(many.to_vec()),
            }
        }

        if self.data.len() == 1 {
            if let Some(items) = self.data.get(DUMMY_KEY) {
                return collapse(items);
            }
        }
        Value::Map(
            self.data
                .iter()
                .filter(|(k, _)| k.as_str() != DUMMY_KEY)
                .map(|(k, items)| (k.clone(), collapse(items)))
                .collect(),
        )
    }
}

// ============================================================================
// Loops
// ============================================================================

/// One expansion of a block.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopItem {
    pub key: Value,
    pub value: Value,
}

/// Instance-local variables visible to the renderer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalVars {
    vars: IndexMap<String, Value>,
}

pub const COUNT_INDEX: &str = "count.index";
pub const EACH_KEY: &str = "each.key";
pub const EACH_VALUE: &str = "each.value";

impl LocalVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locals for one loop instance.
    pub fn for_item(is_for_each: bool, item: &LoopItem) -> Self {
        let mut locals = Self::new();
        if is_for_each {
            locals.insert(EACH_KEY, item.key.clone());
            locals.insert(EACH_VALUE, item.value.clone());
        } else {
            locals.insert(COUNT_INDEX, item.key.clone());
        }
        locals
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Whether a reference names a loop builtin rather than a block.
pub fn is_loop_builtin(reference: &str) -> bool {
    reference.starts_with("count.") || reference.starts_with("each.")
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "ERROR"),
            Self::Warning => write!(f, "WARNING"),
        }
    }
}

/// A severity-tagged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub detail: String,
    #[serde(default)]
    pub context: String,
}

impl Diagnostic {
    pub fn error(context: &str, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            detail: detail.into(),
            context: context.to_string(),
        }
    }

    pub fn warning(context: &str, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            detail: detail.into(),
            context: context.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}: {}", self.severity, self.detail)
        } else {
            write!(f, "{} [{}]: {}", self.severity, self.context, self.detail)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
