//! Tool layer — a registry mapping tool names to capability labels, input
//! schemas, and invoke functions, plus the built-in shell / filesystem /
//! web tools.
//!
//! The executor never hardcodes tool names: schemas exposed to the LLM are
//! built from the registry table, and dispatch goes through it. Tool
//! failures are values (`ToolOutcome` with `is_error`), never panics.

mod fs;
mod registry;
mod shell;
mod web;

pub use registry::{RegisteredTool, Tool, ToolOutcome, ToolRegistry};

use std::sync::Arc;

use ab_domain::config::ToolsConfig;

/// Build the default registry with the built-in tools.
pub fn builtin_registry(config: &ToolsConfig) -> ToolRegistry {
    let registry = ToolRegistry::new();

    registry.register(RegisteredTool {
        name: "shell_run".into(),
        capability: "shell.run".into(),
        definition: shell::definition(),
        handler: Arc::new(shell::ShellTool::new(config.shell.clone())),
    });

    registry.register(RegisteredTool {
        name: "fs_read".into(),
        capability: "filesystem.read".into(),
        definition: fs::read_definition(),
        handler: Arc::new(fs::FsReadTool::new(config.allowed_fs_root.clone())),
    });

    registry.register(RegisteredTool {
        name: "fs_write".into(),
        capability: "filesystem.write".into(),
        definition: fs::write_definition(),
        handler: Arc::new(fs::FsWriteTool::new(config.allowed_fs_root.clone())),
    });

    registry.register(RegisteredTool {
        name: "fs_list".into(),
        capability: "filesystem.read".into(),
        definition: fs::list_definition(),
        handler: Arc::new(fs::FsListTool::new(config.allowed_fs_root.clone())),
    });

    registry.register(RegisteredTool {
        name: "web_fetch".into(),
        capability: "web.fetch".into(),
        definition: web::definition(),
        handler: Arc::new(web::WebFetchTool::new(config.web.clone())),
    });

    registry
}
