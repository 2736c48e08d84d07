//! The task catalog linked into a worker binary
//!
//! Tasks are never shipped over the wire; both sides link the same catalog
//! and the pool only ships the name-to-id binding. A task receives its
//! undried arguments and a [`TaskContext`] and must complete the call
//! through the context exactly once.

use std::collections::HashMap;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use forkpool_codec::{DryRegistry, Value};

use crate::runtime::TaskContext;

/// One registered task body
pub type TaskFn = Rc<dyn Fn(Vec<Value>, TaskContext) -> LocalBoxFuture<'static, ()>>;

/// Name-keyed catalog of tasks plus the custom-type hooks their payloads use
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
    hooks: DryRegistry,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            hooks: DryRegistry::new(),
        }
    }

    /// Register a task under a name the pool will refer to it by
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: Fn(Vec<Value>, TaskContext) -> Fut + 'static,
        Fut: std::future::Future<Output = ()> + 'static,
    {
        self.tasks.insert(
            name.into(),
            Rc::new(move |args, ctx| Box::pin(task(args, ctx))),
        );
    }

    /// Register an undry hook for a custom payload type
    pub fn register_undry(
        &mut self,
        name: impl Into<String>,
        hook: impl Fn(Value) -> Value + 'static,
    ) {
        self.hooks.register(name, hook);
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn hooks(&self) -> &DryRegistry {
        &self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let mut registry = TaskRegistry::new();
        registry.register("noop", |_args, _ctx| async {});
        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn undry_hooks_are_installed_and_callable() {
        let mut registry = TaskRegistry::new();
        registry.register_undry("Tagged", |value| {
            let out = Value::object();
            out.set("inner", value);
            out
        });

        let hook = registry.hooks().hook("Tagged").unwrap();
        let restored = hook(Value::Int(9));
        assert_eq!(
            restored.get("inner").and_then(|v| v.as_i64()),
            Some(9)
        );
    }
}
