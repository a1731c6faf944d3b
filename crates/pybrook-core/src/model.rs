//! The model compiler (C5, compilation half): turns a declarative description into a
//! compiled [`Engine`] carrying the consumer-group graph the worker runtime launches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dependency::Dependency;
use crate::error::CompileError;
use crate::field::{FieldDef, FieldValue};
use crate::ids::MessageId;
use crate::report::{InputReportDef, OutputReportDef};

/// The values available to an artificial-field function at invocation time.
pub struct FieldContext<'a> {
    pub message_id: &'a MessageId,
    /// Current-dependency values, keyed by field name.
    pub current: &'a HashMap<String, FieldValue>,
    /// Historical-dependency windows, keyed by field name. Each window is ordered
    /// oldest-first, left-padded with `None` for slots with no prior value.
    pub history: &'a HashMap<String, Vec<Option<FieldValue>>>,
}

impl<'a> FieldContext<'a> {
    pub fn current(&self, field: &str) -> Option<&FieldValue> {
        self.current.get(field)
    }

    pub fn history(&self, field: &str) -> &[Option<FieldValue>] {
        self.history
            .get(field)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// A user-supplied artificial-field computation.
///
/// Implementations may be synchronous or genuinely asynchronous (e.g. they may call out
/// to another service); the runtime treats every invocation as an awaitable unit of work
/// and never blocks its consumer loop on it.
#[async_trait]
pub trait ComputeFn: Send + Sync {
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue>;
}

/// Adapts a plain synchronous closure into a [`ComputeFn`].
pub struct SyncFn<F>(pub F)
where
    F: Fn(&FieldContext<'_>) -> anyhow::Result<FieldValue> + Send + Sync;

#[async_trait]
impl<F> ComputeFn for SyncFn<F>
where
    F: Fn(&FieldContext<'_>) -> anyhow::Result<FieldValue> + Send + Sync,
{
    async fn compute(&self, ctx: &FieldContext<'_>) -> anyhow::Result<FieldValue> {
        (self.0)(ctx)
    }
}

/// A declared artificial field: its dependencies and the function that computes it.
pub struct ArtificialFieldDef {
    pub name: String,
    /// Namespace the field's sub-stream is published under, i.e. the report-like
    /// prefix in `<namespace>:<field-name>`.
    pub namespace: String,
    pub current_deps: Vec<String>,
    pub hist_deps: Vec<(String, usize)>,
    pub compute: Arc<dyn ComputeFn>,
    pub json_type: String,
}

impl ArtificialFieldDef {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        compute: Arc<dyn ComputeFn>,
    ) -> Self {
        let name = name.into();
        Self {
            name,
            namespace: namespace.into(),
            current_deps: Vec::new(),
            hist_deps: Vec::new(),
            compute,
            json_type: "number".to_string(),
        }
    }

    pub fn depends_on_current(mut self, field: impl Into<String>) -> Self {
        self.current_deps.push(field.into());
        self
    }

    pub fn depends_on_history(mut self, field: impl Into<String>, window: usize) -> Self {
        self.hist_deps.push((field.into(), window));
        self
    }

    pub fn json_type(mut self, json_type: impl Into<String>) -> Self {
        self.json_type = json_type.into();
        self
    }

    pub fn stream_name(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }

    pub fn consumer_group(&self) -> String {
        format!("gen-{}", self.name)
    }

    fn all_deps(&self) -> impl Iterator<Item = Dependency> + '_ {
        self.current_deps
            .iter()
            .map(|f| Dependency::current(f.clone()))
            .chain(
                self.hist_deps
                    .iter()
                    .map(|(f, k)| Dependency::historical(f.clone(), *k)),
            )
    }
}

/// Accumulates a declarative model before compilation.
#[derive(Default)]
pub struct ModelBuilder {
    inputs: Vec<InputReportDef>,
    artificial: Vec<ArtificialFieldDef>,
    outputs: Vec<OutputReportDef>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_report(mut self, report: InputReportDef) -> Self {
        self.inputs.push(report);
        self
    }

    pub fn artificial_field(mut self, field: ArtificialFieldDef) -> Self {
        self.artificial.push(field);
        self
    }

    pub fn output_report(mut self, report: OutputReportDef) -> Self {
        self.outputs.push(report);
        self
    }

    /// Compiles the declared model into an [`Engine`], validating every invariant named
    /// in the data model: no unknown field references, no dependency cycle among current
    /// dependencies (self-history edges are exempt), no duplicate names, and every
    /// `id_field` present.
    pub fn compile(self) -> Result<Engine, CompileError> {
        let mut report_names: HashSet<&str> = HashSet::new();
        for r in &self.inputs {
            if !report_names.insert(r.name.as_str()) {
                return Err(CompileError::DuplicateReportName(r.name.clone()));
            }
        }
        for r in &self.outputs {
            if !report_names.insert(r.name.as_str()) {
                return Err(CompileError::DuplicateReportName(r.name.clone()));
            }
        }

        let mut field_index: HashMap<String, FieldDef> = HashMap::new();
        for r in &self.inputs {
            if r.id_field.is_empty() {
                return Err(CompileError::MissingIdField(r.name.clone()));
            }
            if r.field(&r.id_field).is_none() {
                return Err(CompileError::UnknownIdField {
                    report: r.name.clone(),
                    id_field: r.id_field.clone(),
                });
            }
            for f in &r.fields {
                if field_index.insert(f.name.clone(), f.clone()).is_some() {
                    return Err(CompileError::DuplicateFieldName(f.name.clone()));
                }
            }
        }
        for a in &self.artificial {
            let def = FieldDef::derived(a.name.clone(), &a.namespace, a.json_type.clone());
            if field_index.insert(a.name.clone(), def).is_some() {
                return Err(CompileError::DuplicateFieldName(a.name.clone()));
            }
        }

        // Validate every dependency (current and historical) names a known field.
        for a in &self.artificial {
            for dep in a.all_deps() {
                if !field_index.contains_key(dep.field_name()) {
                    if dep.is_historical() {
                        return Err(CompileError::HistoryOnUnknownField {
                            consumer: a.name.clone(),
                            field: dep.field_name().to_string(),
                        });
                    }
                    return Err(CompileError::UnknownFieldReference {
                        field: a.name.clone(),
                        dependency: dep.field_name().to_string(),
                    });
                }
            }
        }
        for o in &self.outputs {
            for f in &o.required_fields {
                if !field_index.contains_key(f) {
                    return Err(CompileError::UnknownOutputField {
                        report: o.name.clone(),
                        field: f.clone(),
                    });
                }
            }
        }

        // Build the current-dependency graph over artificial fields only; source
        // fields are leaves with no incoming edges and cannot participate in a cycle.
        // Historical deps never contribute an edge, which is what exempts self-history
        // (a field reading its own history) from cycle detection.
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_of: HashMap<&str, NodeIndex> = HashMap::new();
        for a in &self.artificial {
            let idx = graph.add_node(a.name.clone());
            node_of.insert(&a.name, idx);
        }
        for a in &self.artificial {
            for dep_name in &a.current_deps {
                if let Some(&dep_idx) = node_of.get(dep_name.as_str()) {
                    let f_idx = node_of[a.name.as_str()];
                    graph.add_edge(dep_idx, f_idx, ());
                }
            }
        }
        if is_cyclic_directed(&graph) {
            let cycle = find_a_cycle(&graph).unwrap_or_default();
            return Err(CompileError::DependencyCycle { cycle });
        }
        let topo_order = petgraph::algo::toposort(&graph, None)
            .expect("cyclicity already checked above")
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        // Observers: for every (dep, k) historical dependency declared by f, dep's
        // ring buffer must be maintained because f reads it; max_history tracks the
        // largest window declared across all consumers of that field.
        let mut observers: HashMap<String, Vec<String>> = HashMap::new();
        let mut max_history: HashMap<String, usize> = HashMap::new();
        for a in &self.artificial {
            for (dep, k) in &a.hist_deps {
                observers.entry(dep.clone()).or_default().push(a.name.clone());
                let entry = max_history.entry(dep.clone()).or_insert(0);
                if *k > *entry {
                    *entry = *k;
                }
            }
        }

        Ok(Engine {
            inputs: self.inputs,
            artificial: self.artificial,
            outputs: self.outputs,
            topo_order,
            observers,
            max_history,
            field_index,
            sep: crate::ids::DEFAULT_SEPARATOR,
        })
    }
}

/// Depth-first search that returns the field names forming one cycle, for a clear
/// compiler error naming every field on the cycle (including returning to the start).
fn find_a_cycle(graph: &DiGraph<String, ()>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color = vec![Color::White; graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    fn visit(
        graph: &DiGraph<String, ()>,
        node: NodeIndex,
        color: &mut Vec<Color>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        color[node.index()] = Color::Gray;
        stack.push(node);
        for neighbor in graph.neighbors(node) {
            match color[neighbor.index()] {
                Color::White => {
                    if let Some(cycle) = visit(graph, neighbor, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == neighbor).unwrap();
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|&n| graph[n].clone()).collect();
                    cycle.push(graph[neighbor].clone());
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[node.index()] = Color::Black;
        None
    }

    for node in graph.node_indices() {
        if color[node.index()] == Color::White {
            if let Some(cycle) = visit(graph, node, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// A fully compiled model: every field, report, and the consumer-group graph the
/// worker runtime launches roles from. Instantiated once at startup and handed to
/// workers by parameter rather than lived in a global registry.
pub struct Engine {
    pub inputs: Vec<InputReportDef>,
    pub artificial: Vec<ArtificialFieldDef>,
    pub outputs: Vec<OutputReportDef>,
    /// Artificial field names in current-dependency topological order.
    pub topo_order: Vec<String>,
    /// field -> names of artificial fields that declared a historical dependency on it.
    pub observers: HashMap<String, Vec<String>>,
    /// field -> K, the largest history window declared for that field across all consumers.
    pub max_history: HashMap<String, usize>,
    pub field_index: HashMap<String, FieldDef>,
    pub sep: char,
}

impl Engine {
    pub fn input_report(&self, name: &str) -> Option<&InputReportDef> {
        self.inputs.iter().find(|r| r.name == name)
    }

    pub fn output_report(&self, name: &str) -> Option<&OutputReportDef> {
        self.outputs.iter().find(|r| r.name == name)
    }

    pub fn artificial_field(&self, name: &str) -> Option<&ArtificialFieldDef> {
        self.artificial.iter().find(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.field_index.get(name)
    }

    /// The sub-stream name for any known field (source or derived).
    pub fn stream_of(&self, field: &str) -> Option<String> {
        self.field(field).map(|f| f.stream_name.clone())
    }

    pub fn history_window(&self, field: &str) -> usize {
        self.max_history.get(field).copied().unwrap_or(0)
    }
}
