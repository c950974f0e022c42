//! KF-019: Graph document loading and validation.
//!
//! A graph document is the YAML serialization of an already-parsed block
//! graph: a name plus a map of block name → block spec, nested for
//! modules. Validation checks:
//! - Block names are `<namespace>.<id>`
//! - Namespaces match block types (`input.*`, `local.*`, `module.*`, ...)
//! - Only modules carry nested blocks, and they must
//! - Every reference names a block in the same scope

use super::dag::Dag;
use super::error::Result;
use super::render::value_references;
use super::types::*;
use crate::runners::resource::provider_name;
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, LazyLock};

static BLOCK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z0-9_]+$").expect("static regex"));

/// Namespaces that belong to a fixed block type or the loop builtins.
const RESERVED_NAMESPACES: &[&str] = &[
    "input", "output", "local", "module", "provider", "count", "each", "root", "data",
];

/// Top-level graph document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GraphDocument {
    /// Root module name; also the provider scope of its resources
    pub name: String,

    #[serde(default)]
    pub blocks: IndexMap<String, BlockSpec>,
}

/// One block of a graph document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockSpec {
    #[serde(rename = "type")]
    pub block_type: BlockType,

    #[serde(default)]
    pub attributes: Attributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub input_params: IndexMap<String, Value>,

    /// Nested blocks of a module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<IndexMap<String, BlockSpec>>,

    /// Extra ordering edges not visible in the payload
    #[serde(default, alias = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Source file (provenance only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl BlockSpec {
    fn context(&self) -> BlockContext {
        BlockContext {
            attributes: self.attributes.clone(),
            value: self.value.clone(),
            config: self.config.clone(),
            default: self.default.clone(),
            input_params: self.input_params.clone(),
        }
    }

    /// Block names this block depends on: payload references (loop
    /// builtins excluded) followed by explicit `depends_on` entries.
    pub fn dependencies(&self) -> IndexSet<String> {
        let mut refs = IndexSet::new();
        for payload in self.context().payloads() {
            value_references(payload, &mut refs);
        }
        refs.retain(|r| !is_loop_builtin(r));
        refs.extend(self.depends_on.iter().cloned());
        refs
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a graph document from disk.
pub fn parse_document_file(path: &Path) -> std::result::Result<GraphDocument, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_document(&content)
}

/// Parse a graph document from a string.
pub fn parse_document(yaml: &str) -> std::result::Result<GraphDocument, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a document. Returns every error found (empty = valid).
pub fn validate_document(doc: &GraphDocument) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if doc.name.is_empty() {
        errors.push(ValidationError {
            message: "name must not be empty".to_string(),
        });
    }
    validate_scope(&doc.name, &doc.blocks, &mut errors);
    errors
}

fn validate_scope(scope: &str, blocks: &IndexMap<String, BlockSpec>, errors: &mut Vec<ValidationError>) {
    let mut push = |message: String| errors.push(ValidationError { message });

    for (name, spec) in blocks {
        if !BLOCK_NAME.is_match(name) {
            push(format!(
                "{}: block name '{}' must be <namespace>.<id>",
                scope, name
            ));
            continue;
        }
        let namespace = name.split('.').next().unwrap_or_default();

        match spec.block_type {
            BlockType::Root => push(format!(
                "{}: block '{}' uses the reserved type root",
                scope, name
            )),
            BlockType::Resource | BlockType::Data => {
                if RESERVED_NAMESPACES.contains(&namespace) {
                    push(format!(
                        "{}: {} block '{}' must be named <resource type>.<id>",
                        scope, spec.block_type, name
                    ));
                }
            }
            bt => {
                if namespace != bt.to_string() {
                    push(format!(
                        "{}: {} block '{}' must be named {}.<id>",
                        scope, bt, name, bt
                    ));
                }
            }
        }

        if spec.block_type == BlockType::Input
            && (spec.attributes.count.is_some() || spec.attributes.for_each.is_some())
        {
            push(format!(
                "{}: input '{}' may not use count or forEach",
                scope, name
            ));
        }

        match (&spec.blocks, spec.block_type) {
            (None, BlockType::Module) => {
                push(format!("{}: module '{}' has no blocks", scope, name));
            }
            (Some(_), bt) if bt != BlockType::Module => {
                push(format!(
                    "{}: only modules may nest blocks, '{}' is {}",
                    scope, name, bt
                ));
            }
            _ => {}
        }

        for dep in spec.dependencies() {
            if dep == *name {
                push(format!("{}: block '{}' references itself", scope, name));
            } else if !blocks.contains_key(&dep) {
                push(format!(
                    "{}: block '{}' references unknown block '{}'",
                    scope, name, dep
                ));
            }
        }

        if let Some(nested) = &spec.blocks {
            for param in spec.input_params.keys() {
                if !nested.contains_key(&format!("input.{}", param)) {
                    push(format!(
                        "{}: module '{}' has no input '{}'",
                        scope, name, param
                    ));
                }
            }
        }
    }

    for (name, spec) in blocks {
        if let Some(nested) = &spec.blocks {
            validate_scope(&format!("{}/{}", scope, name), nested, errors);
        }
    }
}

/// Build the executable graph of a document. Nested modules get their own
/// graph on the module vertex.
pub fn build_dag(doc: &GraphDocument, file_name: &str) -> Result<Dag> {
    build_scope(&doc.name, file_name, &doc.blocks)
}

fn build_scope(module_name: &str, file_name: &str, blocks: &IndexMap<String, BlockSpec>) -> Result<Dag> {
    let mut dag = Dag::new();
    for (name, spec) in blocks {
        let mut vertex = Vertex::new(name, spec.block_type);
        vertex.module_name = module_name.to_string();
        vertex.file_name = spec.file.clone().unwrap_or_else(|| file_name.to_string());
        vertex.block_context = spec.context();
        vertex.dependencies = spec.dependencies();
        let providers = provider_dependencies(&vertex, blocks);
        vertex.dependencies.extend(providers);
        if let Some(nested) = &spec.blocks {
            let child = build_scope(vertex.short_name(), file_name, nested)?;
            vertex.dag = Some(Arc::new(child));
        }
        dag.add_vertex(vertex)?;
    }
    dag.connect_dependencies()?;
    dag.transitive_reduction();
    Ok(dag)
}

/// Provider blocks of the same scope a vertex must wait for: resources and
/// data sources wait for their own provider, modules for every provider.
fn provider_dependencies(vertex: &Vertex, blocks: &IndexMap<String, BlockSpec>) -> Vec<String> {
    match vertex.block_type {
        BlockType::Resource | BlockType::Data => {
            let name = format!("provider.{}", provider_name(vertex));
            if blocks.contains_key(&name) {
                vec![name]
            } else {
                Vec::new()
            }
        }
        BlockType::Module => blocks
            .iter()
            .filter(|(_, spec)| spec.block_type == BlockType::Provider)
            .map(|(name, _)| name.clone())
            .collect(),
        _ => Vec::new(),
    }
}

/// JSON schema of the graph document format.
pub fn document_schema() -> std::result::Result<String, String> {
    let schema = schemars::schema_for!(GraphDocument);
    serde_json::to_string_pretty(&schema).map_err(|e| format!("JSON error: {}", e))
}
