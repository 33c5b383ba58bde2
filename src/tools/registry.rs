//! Tool registry for Parley
//!
//! Maps tool names to their implementations. The registry is built once at
//! startup and then shared read-only (`Arc<ToolRegistry>`) by every session.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{Tool, ToolDefinition};

/// A registry that holds tools by name.
///
/// # Example
///
/// ```rust
/// use parley::tools::{builtin::EchoTool, ToolRegistry};
///
/// let mut registry = ToolRegistry::new();
/// registry.register(EchoTool);
///
/// assert!(registry.has("echo"));
/// assert_eq!(registry.definitions()[0].name, "echo");
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let meta = tool.metadata();
        info!(
            tool = %name,
            tier = ?meta.tier,
            safety = ?meta.safety,
            "Registering tool"
        );
        self.tools.insert(name, tool);
    }

    /// Get a shared handle to a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for session-configure, sorted by name so the advertised
    /// tool list is stable across reconnects.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
