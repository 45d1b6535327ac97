//! Built-in digraph engine
//!
//! Compiles a [`PipelineConfig`] into a topologically ordered plan and runs
//! it node by node. Root nodes receive the envelope, a node with a single
//! predecessor receives that predecessor's output, and a node with several
//! receives an object keyed by predecessor name.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use super::nodes::{NodeOutput, NodeRunner, NodeSpec};
use super::{Envelope, Invocation, PipelineError, PipelineFactory, PipelineResult, Worker};
use crate::config::{LogLevel, PipelineConfig};

/// Extensions the built-in engine knows how to load
pub const KNOWN_EXTENSIONS: &[&str] = &["rest", "shell"];

/// Status reported when a node fails
pub const NODE_FAILURE_STATUS: i64 = 1;

/// A compiled pipeline: nodes in execution order
#[derive(Debug, Clone)]
pub struct Plan {
    nodes: Vec<NodeSpec>,
    /// Predecessor indices (into `nodes`) for each node
    preds: Vec<Vec<usize>>,
    terminal: usize,
}

impl Plan {
    /// Parse and order a pipeline definition.
    pub fn compile(
        config: &PipelineConfig,
        extensions: &HashSet<String>,
    ) -> Result<Self, PipelineError> {
        let declared: Vec<NodeSpec> = config
            .node
            .iter()
            .map(|raw| {
                serde_json::from_value(raw.clone())
                    .map_err(|e| PipelineError::InvalidNode(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        if declared.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut index = HashMap::new();
        for (i, node) in declared.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(PipelineError::DuplicateNode(node.name.clone()));
            }
            if let Some(ext) = node.kind.required_extension() {
                if !extensions.contains(ext) {
                    return Err(PipelineError::ExtensionNotLoaded {
                        node: node.name.clone(),
                        extension: ext.to_string(),
                    });
                }
            }
        }

        let mut successors = vec![Vec::new(); declared.len()];
        let mut declared_preds = vec![Vec::new(); declared.len()];
        for edge in &config.digraph {
            let (from, to) = parse_edge(edge)?;
            let from = *index
                .get(from)
                .ok_or_else(|| PipelineError::UndefinedNode(from.to_string()))?;
            let to = *index
                .get(to)
                .ok_or_else(|| PipelineError::UndefinedNode(to.to_string()))?;
            successors[from].push(to);
            declared_preds[to].push(from);
        }

        // Kahn's algorithm, ties broken by declaration order
        let mut indegree: Vec<usize> = declared_preds.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..declared.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(declared.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &successors[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != declared.len() {
            return Err(PipelineError::Cycle);
        }

        let mut position = vec![0; declared.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos;
        }

        let terminal = match &config.last {
            Some(name) => {
                let i = index
                    .get(name)
                    .ok_or_else(|| PipelineError::UndefinedNode(name.clone()))?;
                position[*i]
            }
            None => order.len() - 1,
        };

        let preds = order
            .iter()
            .map(|&i| declared_preds[i].iter().map(|&p| position[p]).collect())
            .collect();
        let nodes = order.iter().map(|&i| declared[i].clone()).collect();

        Ok(Self {
            nodes,
            preds,
            terminal,
        })
    }

    /// Node names in execution order
    pub fn order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn terminal(&self) -> &str {
        &self.nodes[self.terminal].name
    }
}

fn parse_edge(edge: &str) -> Result<(&str, &str), PipelineError> {
    let (from, to) = edge
        .split_once("->")
        .ok_or_else(|| PipelineError::InvalidEdge(edge.to_string()))?;
    let (from, to) = (from.trim(), to.trim());
    if from.is_empty() || to.is_empty() {
        return Err(PipelineError::InvalidEdge(edge.to_string()));
    }
    Ok((from, to))
}

/// Factory for [`DigraphWorker`]s
pub struct BuiltinFactory {
    extensions: RwLock<HashSet<String>>,
    log_level: RwLock<LogLevel>,
    runner: NodeRunner,
}

impl BuiltinFactory {
    pub fn new() -> Self {
        Self {
            extensions: RwLock::new(HashSet::new()),
            log_level: RwLock::new(LogLevel::default()),
            runner: NodeRunner::new(reqwest::Client::new()),
        }
    }

    pub fn loaded_extensions(&self) -> Vec<String> {
        let mut loaded: Vec<String> = self.extensions.read().iter().cloned().collect();
        loaded.sort();
        loaded
    }
}

impl Default for BuiltinFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineFactory for BuiltinFactory {
    fn set_log_level(&self, level: LogLevel) {
        *self.log_level.write() = level;
    }

    fn load_extension(&self, name: &str) -> Result<(), PipelineError> {
        if !KNOWN_EXTENSIONS.contains(&name) {
            return Err(PipelineError::UnknownExtension(name.to_string()));
        }
        if self.extensions.write().insert(name.to_string()) {
            info!("Loaded pipeline extension '{}'", name);
        }
        Ok(())
    }

    fn build(&self, config: &PipelineConfig, name: &str) -> Result<Box<dyn Worker>, PipelineError> {
        let plan = Plan::compile(config, &self.extensions.read())?;
        debug!(
            "Built worker {} ({} nodes, terminal '{}')",
            name,
            plan.nodes.len(),
            plan.terminal()
        );
        Ok(Box::new(DigraphWorker {
            name: name.to_string(),
            plan: Arc::new(plan),
            runner: self.runner.clone(),
            trace_payloads: *self.log_level.read() == LogLevel::Trace,
            invocations: 0,
        }))
    }
}

/// Worker executing a compiled [`Plan`]
pub struct DigraphWorker {
    name: String,
    plan: Arc<Plan>,
    runner: NodeRunner,
    trace_payloads: bool,
    invocations: u64,
}

impl DigraphWorker {
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    fn variables(&self, envelope: &Envelope, node: &NodeSpec, input: &Value) -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("INPUT".to_string(), input.clone());
        vars.insert("PARAM".to_string(), envelope.param.clone());
        vars.insert(
            "HEADERS".to_string(),
            Value::Object(envelope.headers.clone()),
        );
        vars.insert("CLIENT".to_string(), envelope.client.clone());
        vars.insert("NODE".to_string(), Value::String(node.name.clone()));
        vars.insert("WORKER".to_string(), Value::String(self.name.clone()));
        vars.insert(
            "TIMESTAMP".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        vars
    }
}

#[async_trait]
impl Worker for DigraphWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&mut self, envelope: &Envelope) -> Result<Invocation, PipelineError> {
        self.invocations += 1;
        if self.trace_payloads {
            trace!(worker = %self.name, "Envelope: {}", envelope.to_value());
        }

        let plan = Arc::clone(&self.plan);
        let root_input = envelope.to_value();
        let mut outputs: Vec<Option<NodeOutput>> = vec![None; plan.nodes.len()];

        for (idx, node) in plan.nodes.iter().enumerate() {
            let input = match plan.preds[idx].as_slice() {
                [] => root_input.clone(),
                [single] => output_value(&outputs, *single),
                many => Value::Object(
                    many.iter()
                        .map(|&p| (plan.nodes[p].name.clone(), output_value(&outputs, p)))
                        .collect::<Map<String, Value>>(),
                ),
            };

            let vars = self.variables(envelope, node, &input);
            match self.runner.run(node, &input, &vars).await {
                Ok(output) => outputs[idx] = Some(output),
                Err(e) => {
                    warn!(
                        worker = %self.name,
                        node = %node.name,
                        "Pipeline node failed: {}", e
                    );
                    return Ok(Invocation::failure(NODE_FAILURE_STATUS));
                }
            }
        }

        let terminal = outputs[plan.terminal]
            .take()
            .ok_or_else(|| PipelineError::Invocation("terminal node produced no output".to_string()))?;

        if self.trace_payloads {
            trace!(worker = %self.name, "Result: {}", terminal.value);
        }
        debug!(
            "Worker {} completed invocation #{}",
            self.name, self.invocations
        );

        Ok(Invocation::success(PipelineResult {
            headers: terminal.headers,
            body: (!terminal.value.is_null()).then_some(terminal.value),
        }))
    }
}

fn output_value(outputs: &[Option<NodeOutput>], idx: usize) -> Value {
    outputs[idx]
        .as_ref()
        .map(|o| o.value.clone())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> PipelineConfig {
        serde_json::from_value(value).unwrap()
    }

    fn envelope(param: Value) -> Envelope {
        Envelope {
            headers: Map::new(),
            param,
            client: json!(["127.0.0.1", 40000]),
        }
    }

    #[test]
    fn test_compile_orders_topologically() {
        let cfg = config(json!({
            "node": [
                {"name": "out", "type": "response"},
                {"name": "a", "type": "constant", "value": 1},
                {"name": "b", "type": "constant", "value": 2}
            ],
            "digraph": ["a -> out", "b->out"]
        }));
        let plan = Plan::compile(&cfg, &HashSet::new()).unwrap();
        assert_eq!(plan.order(), vec!["a", "b", "out"]);
        assert_eq!(plan.terminal(), "out");
    }

    #[test]
    fn test_compile_rejects_cycle() {
        let cfg = config(json!({
            "node": [
                {"name": "a", "type": "constant"},
                {"name": "b", "type": "constant"}
            ],
            "digraph": ["a -> b", "b -> a"]
        }));
        assert!(matches!(
            Plan::compile(&cfg, &HashSet::new()),
            Err(PipelineError::Cycle)
        ));
    }

    #[test]
    fn test_compile_rejects_unknown_edge_node() {
        let cfg = config(json!({
            "node": [{"name": "a", "type": "constant"}],
            "digraph": ["a -> ghost"]
        }));
        assert!(matches!(
            Plan::compile(&cfg, &HashSet::new()),
            Err(PipelineError::UndefinedNode(n)) if n == "ghost"
        ));
    }

    #[test]
    fn test_compile_rejects_malformed_edge() {
        let cfg = config(json!({
            "node": [{"name": "a", "type": "constant"}],
            "digraph": ["a => b"]
        }));
        assert!(matches!(
            Plan::compile(&cfg, &HashSet::new()),
            Err(PipelineError::InvalidEdge(_))
        ));
    }

    #[test]
    fn test_compile_requires_extension() {
        let cfg = config(json!({
            "node": [{"name": "call", "type": "rest", "url": "http://localhost"}]
        }));
        assert!(matches!(
            Plan::compile(&cfg, &HashSet::new()),
            Err(PipelineError::ExtensionNotLoaded { .. })
        ));

        let mut loaded = HashSet::new();
        loaded.insert("rest".to_string());
        assert!(Plan::compile(&cfg, &loaded).is_ok());
    }

    #[test]
    fn test_compile_rejects_empty_and_duplicates() {
        assert!(matches!(
            Plan::compile(&PipelineConfig::default(), &HashSet::new()),
            Err(PipelineError::Empty)
        ));
        let cfg = config(json!({
            "node": [
                {"name": "a", "type": "constant"},
                {"name": "a", "type": "constant"}
            ]
        }));
        assert!(matches!(
            Plan::compile(&cfg, &HashSet::new()),
            Err(PipelineError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_explicit_last_node() {
        let cfg = config(json!({
            "node": [
                {"name": "a", "type": "constant", "value": "A"},
                {"name": "b", "type": "constant", "value": "B"}
            ],
            "last": "a"
        }));
        let plan = Plan::compile(&cfg, &HashSet::new()).unwrap();
        assert_eq!(plan.terminal(), "a");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let factory = BuiltinFactory::new();
        assert!(factory.load_extension("rest").is_ok());
        assert!(matches!(
            factory.load_extension("grpc"),
            Err(PipelineError::UnknownExtension(_))
        ));
        assert_eq!(factory.loaded_extensions(), vec!["rest".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_response_shapes_result() {
        let factory = BuiltinFactory::new();
        let cfg = config(json!({
            "node": [
                {"name": "out", "type": "response",
                 "headers": {"x-worker": "$WORKER"},
                 "body": {"user": "$PARAM"}}
            ]
        }));
        let mut worker = factory.build(&cfg, "/v1/users[0]").unwrap();
        let invocation = worker.invoke(&envelope(json!({"id": "7"}))).await.unwrap();

        assert!(invocation.is_success());
        assert_eq!(invocation.result.body, Some(json!({"user": {"id": "7"}})));
        assert_eq!(
            invocation.result.headers.unwrap()["x-worker"],
            json!("/v1/users[0]")
        );
    }

    #[tokio::test]
    async fn test_worker_fans_in_predecessors() {
        let factory = BuiltinFactory::new();
        let cfg = config(json!({
            "node": [
                {"name": "a", "type": "constant", "value": 1},
                {"name": "b", "type": "constant", "value": 2},
                {"name": "out", "type": "response"}
            ],
            "digraph": ["a -> out", "b -> out"]
        }));
        let mut worker = factory.build(&cfg, "fan[0]").unwrap();
        let invocation = worker.invoke(&envelope(json!({}))).await.unwrap();
        assert_eq!(invocation.result.body, Some(json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn test_worker_root_receives_envelope() {
        let factory = BuiltinFactory::new();
        let cfg = config(json!({"node": [{"name": "out", "type": "response"}]}));
        let mut worker = factory.build(&cfg, "echo[0]").unwrap();
        let env = envelope(json!({"q": "x"}));
        let invocation = worker.invoke(&env).await.unwrap();
        assert_eq!(invocation.result.body, Some(env.to_value()));
    }

    #[tokio::test]
    async fn test_null_output_means_no_body() {
        let factory = BuiltinFactory::new();
        let cfg = config(json!({"node": [{"name": "nothing", "type": "constant"}]}));
        let mut worker = factory.build(&cfg, "nothing[0]").unwrap();
        let invocation = worker.invoke(&envelope(json!({}))).await.unwrap();
        assert!(invocation.is_success());
        assert_eq!(invocation.result.body, None);
        assert_eq!(invocation.result.headers, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_node_reports_status() {
        let factory = BuiltinFactory::new();
        factory.load_extension("shell").unwrap();
        let cfg = config(json!({"node": [{"name": "boom", "type": "shell", "command": "false"}]}));
        let mut worker = factory.build(&cfg, "boom[0]").unwrap();
        let invocation = worker.invoke(&envelope(json!({}))).await.unwrap();
        assert_eq!(invocation.status, NODE_FAILURE_STATUS);
        assert_eq!(invocation.result, PipelineResult::default());
    }
}
