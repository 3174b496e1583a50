//! Runtime modules.
//!
//! A module contributes task handlers and execution listeners at startup.
//! Modules are listed explicitly in [`EngineConfig::additional_modules`] as
//! factory functions; nothing is discovered at runtime.
//!
//! [`EngineConfig::additional_modules`]: crate::config::EngineConfig::additional_modules

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use workers::{HandlerError, TaskContext, TaskHandler};

use crate::execution::{Execution, ExecutionStatus};

/// Maps queue names to in-process handlers.
pub type HandlerRegistry = HashMap<String, Arc<dyn TaskHandler>>;

/// Builds a module. Plain function pointers keep the list `Clone` and `Debug`.
pub type ModuleFactory = fn() -> Arc<dyn RuntimeModule>;

/// The places a module can plug into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionPoint {
    TaskHandlers,
    ExecutionListeners,
}

/// Notified after an execution reaches a terminal status.
#[async_trait]
pub trait ExecutionListener: Send + Sync {
    async fn on_terminal(&self, execution: &Execution);
}

pub trait RuntimeModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn extension_points(&self) -> &'static [ExtensionPoint];

    fn register(&self, registry: &mut ModuleRegistry);
}

/// Everything the loaded modules contributed.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    handlers: HandlerRegistry,
    listeners: Vec<Arc<dyn ExecutionListener>>,
    loaded: Vec<&'static str>,
}

impl ModuleRegistry {
    /// Instantiate and register every factory, in order.
    pub fn load(factories: &[ModuleFactory]) -> Self {
        let mut registry = Self::default();
        for factory in factories {
            let module = factory();
            module.register(&mut registry);
            info!(
                module = module.name(),
                extension_points = ?module.extension_points(),
                "loaded runtime module"
            );
            registry.loaded.push(module.name());
        }
        registry
    }

    /// Later registrations for the same queue replace earlier ones.
    pub fn add_handler(&mut self, queue_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let queue_name = queue_name.into();
        if self.handlers.insert(queue_name.clone(), handler).is_some() {
            warn!(%queue_name, "task handler replaced");
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn listeners(&self) -> &[Arc<dyn ExecutionListener>] {
        &self.listeners
    }

    pub fn loaded(&self) -> &[&'static str] {
        &self.loaded
    }
}

// ---------------------------------------------------------------------------
// Built-in modules
// ---------------------------------------------------------------------------

/// Modules shipped with the engine, selectable by name from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinModule {
    AuditLog,
    Echo,
}

impl BuiltinModule {
    pub fn factory(self) -> ModuleFactory {
        match self {
            Self::AuditLog => audit_log_module,
            Self::Echo => echo_module,
        }
    }
}

fn audit_log_module() -> Arc<dyn RuntimeModule> {
    Arc::new(AuditLogModule)
}

fn echo_module() -> Arc<dyn RuntimeModule> {
    Arc::new(EchoModule)
}

/// Logs one line per finished execution.
pub struct AuditLogModule;

struct AuditLogListener;

#[async_trait]
impl ExecutionListener for AuditLogListener {
    async fn on_terminal(&self, execution: &Execution) {
        let failed_tasks = execution
            .tasks
            .iter()
            .filter(|task| task.status.is_failure())
            .count();
        match execution.status {
            ExecutionStatus::Completed => info!(
                execution_id = %execution.id,
                workflow = %execution.workflow_name,
                version = execution.workflow_version,
                tasks = execution.tasks.len(),
                "execution completed"
            ),
            status => warn!(
                execution_id = %execution.id,
                workflow = %execution.workflow_name,
                version = execution.workflow_version,
                %status,
                failed_tasks,
                reason = execution.reason.as_deref().unwrap_or_default(),
                "execution did not complete"
            ),
        }
    }
}

impl RuntimeModule for AuditLogModule {
    fn name(&self) -> &'static str {
        "audit-log"
    }

    fn extension_points(&self) -> &'static [ExtensionPoint] {
        &[ExtensionPoint::ExecutionListeners]
    }

    fn register(&self, registry: &mut ModuleRegistry) {
        registry.add_listener(Arc::new(AuditLogListener));
    }
}

/// Serves the `echo` queue in-process: output = input.
pub struct EchoModule;

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, input: Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
        Ok(input)
    }
}

impl RuntimeModule for EchoModule {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn extension_points(&self) -> &'static [ExtensionPoint] {
        &[ExtensionPoint::TaskHandlers]
    }

    fn register(&self, registry: &mut ModuleRegistry) {
        registry.add_handler("echo", Arc::new(EchoHandler));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn builtin_modules_register_in_order() {
        let registry = ModuleRegistry::load(&[BuiltinModule::AuditLog.factory(), BuiltinModule::Echo.factory()]);
        assert_eq!(registry.loaded(), &["audit-log", "echo"]);
        assert_eq!(registry.listeners().len(), 1);

        let echo = registry.handlers().get("echo").expect("echo handler");
        let ctx = TaskContext {
            execution_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            reference_name: "e".into(),
            attempt: 1,
            lease_id: Uuid::new_v4(),
        };
        assert_eq!(echo.execute(json!({ "a": 1 }), &ctx).await.unwrap(), json!({ "a": 1 }));
    }
}
