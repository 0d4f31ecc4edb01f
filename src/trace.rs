//! Trace tasks: user-declared bundles of recipes with a kernel-name
//! filter, instantiated by type name through a factory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use crate::error::Error;
use crate::instrument::InstrumentCtx;

/// A trace task: an ordered list of recipe names plus metadata. The
/// `match_pattern` metadata key holds the mangled-name filter applied
/// per launch; a task without one never fires.
pub struct TraceTask {
    task_type: String,
    recipes: Vec<String>,
    metadata: BTreeMap<String, Value>,
    matcher: Option<Regex>,
}

impl TraceTask {
    pub fn new(task_type: &str, recipes: &[&str]) -> Self {
        TraceTask {
            task_type: task_type.to_string(),
            recipes: recipes.iter().map(|name| name.to_string()).collect(),
            metadata: BTreeMap::new(),
            matcher: None,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn recipes(&self) -> &[String] {
        &self.recipes
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) -> Result<(), Error> {
        if key == "match_pattern" {
            let pattern = value.as_str().unwrap_or_default().to_string();
            self.matcher = Some(Regex::new(&pattern).map_err(|source| {
                Error::BadMatchPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?);
        }
        self.metadata.insert(key.to_string(), value);
        Ok(())
    }

    /// Whether a launch of `kernel_name` (demangled) needs this task.
    pub fn needs_trace(&self, kernel_name: &str) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(kernel_name),
            None => false,
        }
    }

    /// The per-launch payload handed to the transport for the parent
    /// task.
    pub fn serialize(
        &self,
        global_id: &str,
        contexts: &BTreeMap<String, Arc<InstrumentCtx>>,
    ) -> Value {
        let recipes: BTreeMap<&str, Value> = contexts
            .iter()
            .map(|(name, ctx)| (name.as_str(), ctx.serialize()))
            .collect();
        json!({
            "global_id": global_id,
            "type": self.task_type.clone(),
            "metadata": self.metadata.clone(),
            "recipes": recipes,
        })
    }
}

/// Name-keyed trace-task constructors, registered at process start.
#[derive(Default)]
pub struct TraceTaskFactory {
    map: HashMap<String, fn() -> TraceTask>,
}

impl TraceTaskFactory {
    pub fn with_builtins() -> Self {
        let mut factory = TraceTaskFactory::default();
        factory.register("kernel:block_schedule", || {
            TraceTask::new("kernel:block_schedule", &["sass::count_control_flow"])
        });
        factory.register("kernel:dmem_access", || {
            TraceTask::new("kernel:dmem_access", &["sass::trace_dmem_store"])
        });
        factory
    }

    pub fn register(&mut self, task_type: &str, constructor: fn() -> TraceTask) {
        if self.map.insert(task_type.to_string(), constructor).is_some() {
            log::warn!("trace task type {task_type} registered twice, keeping the last one");
        }
    }

    pub fn create(&self, task_type: &str) -> Result<TraceTask, Error> {
        self.map
            .get(task_type)
            .map(|constructor| constructor())
            .ok_or_else(|| Error::UnknownTraceTask(task_type.to_string()))
    }
}
