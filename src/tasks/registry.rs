use std::{collections::BTreeMap, sync::Arc};

use super::{
    builtin,
    types::{TaskDescription, TaskError, TaskSpec},
};

/// Name-keyed catalogue of tasks, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Arc<TaskSpec>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the tasks shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for spec in builtin::tasks() {
            if let Err(e) = registry.register(spec) {
                tracing::error!(error = %e, "skipping builtin task");
            }
        }
        registry
    }

    pub fn register(&mut self, spec: TaskSpec) -> Result<(), TaskError> {
        if self.tasks.contains_key(&spec.name) {
            return Err(TaskError::DuplicateTask(spec.name));
        }
        tracing::debug!(task = %spec.name, evaluation = spec.check.kind(), "registered task");
        self.tasks.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<TaskSpec>, TaskError> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn describe(&self) -> Vec<TaskDescription> {
        self.tasks.values().map(|spec| spec.describe()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
