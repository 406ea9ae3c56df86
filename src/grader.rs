//! Evaluation of finished runs. A runner names its evaluation function by
//! key; the function sees the run's output and returns a JSON result that
//! is cached on the queue item.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct EvaluationInput {
    pub queueid: i64,
    pub runner: String,
    pub runat: i64,
    /// Run output without the `++ {json}` header line. Empty for runners
    /// without a command.
    pub output: String,
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, input: &EvaluationInput) -> Result<Value>;
}

impl<F> Evaluator for F
where
    F: Fn(&EvaluationInput) -> Result<Value> + Send + Sync,
{
    fn evaluate(&self, input: &EvaluationInput) -> Result<Value> {
        self(input)
    }
}

/// Takes the last line of output that parses as a JSON object.
pub struct LastJsonLine;

impl Evaluator for LastJsonLine {
    fn evaluate(&self, input: &EvaluationInput) -> Result<Value> {
        input
            .output
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| match serde_json::from_str::<Value>(line) {
                Ok(v @ Value::Object(_)) => Some(v),
                _ => None,
            })
            .ok_or_else(|| anyhow!("run {} printed no JSON result", input.runat))
    }
}

#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    by_name: BTreeMap<String, Arc<dyn Evaluator>>,
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("last_json_line", LastJsonLine);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, evaluator: impl Evaluator + 'static) {
        self.by_name.insert(name.into(), Arc::new(evaluator));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Evaluator>> {
        self.by_name.get(name).cloned()
    }
}
