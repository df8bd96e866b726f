use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use guardsymbi_core::decl::{GuardCondition, ModuleDecl, OperationRef, TaskDecl, AI_MODULE};
use guardsymbi_core::error::{GuardError, Result};
use guardsymbi_core::types::McpRequestKind;

/// Index of a task in the graph arena.
pub type TaskId = usize;

/// A task placed in the graph, with its resolved upstream tasks.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub module: String,
    pub decl: TaskDecl,
    /// Upstream tasks in declared input order.
    pub deps: Vec<TaskId>,
}

impl TaskNode {
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// `Module.task`.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.module, self.decl.name)
    }
}

/// Validated, acyclic task graph with a deterministic topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<TaskNode>,
    dependents: Vec<Vec<TaskId>>,
    order: Vec<TaskId>,
    by_qualified: HashMap<String, TaskId>,
    by_name: HashMap<String, Vec<TaskId>>,
    run_directive: Option<String>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, id: TaskId) -> &TaskNode {
        &self.nodes[id]
    }

    /// Topological order over the whole graph.
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn order_names(&self) -> Vec<String> {
        self.order.iter().map(|&id| self.display_name(id)).collect()
    }

    pub fn deps(&self, id: TaskId) -> &[TaskId] {
        &self.nodes[id].deps
    }

    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        &self.dependents[id]
    }

    /// All `(upstream, downstream)` edges, sorted.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut edges: Vec<(TaskId, TaskId)> = self
            .nodes
            .iter()
            .flat_map(|n| n.deps.iter().map(move |&d| (d, n.id)))
            .collect();
        edges.sort_unstable();
        edges
    }

    /// `run` directive carried by the declarations, if any.
    pub fn run_directive(&self) -> Option<&str> {
        self.run_directive.as_deref()
    }

    /// Bare name when unique across modules, otherwise `Module.task`.
    pub fn display_name(&self, id: TaskId) -> String {
        let node = &self.nodes[id];
        match self.by_name.get(node.name()) {
            Some(ids) if ids.len() == 1 => node.name().to_string(),
            _ => node.qualified(),
        }
    }

    /// Context binding for each upstream output of `id`.
    ///
    /// An upstream binds under its bare task name unless another input of the
    /// same task shares that name; then it binds under the `Module.task` path.
    pub fn input_bindings(&self, id: TaskId) -> Vec<(String, TaskId)> {
        let deps = self.deps(id);
        deps.iter()
            .map(|&dep| {
                let name = self.nodes[dep].name();
                let shared = deps
                    .iter()
                    .filter(|&&other| self.nodes[other].name() == name)
                    .count()
                    > 1;
                let binding = if shared {
                    self.nodes[dep].qualified()
                } else {
                    name.to_string()
                };
                (binding, dep)
            })
            .collect()
    }

    /// Find a task by `Module.task` or by a globally unique bare name.
    pub fn lookup(&self, name: &str) -> Result<TaskId> {
        if let Some(&id) = self.by_qualified.get(name) {
            return Ok(id);
        }
        match self.by_name.get(name).map(Vec::as_slice) {
            Some([id]) => Ok(*id),
            Some(ids) if !ids.is_empty() => Err(GuardError::AmbiguousTaskReference {
                task: "run".to_string(),
                reference: name.to_string(),
                candidates: ids.iter().map(|&i| self.nodes[i].qualified()).collect(),
            }),
            _ => Err(GuardError::UnknownEntryTask(name.to_string())),
        }
    }

    /// `entry` plus its transitive dependencies, in topological order.
    pub fn closure(&self, entry: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut stack = vec![entry];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.nodes[id].deps.iter().copied());
            }
        }
        self.order
            .iter()
            .copied()
            .filter(|id| seen.contains(id))
            .collect()
    }
}

/// Turns module declarations into a [`DependencyGraph`].
pub struct GraphBuilder {
    require_ai_annotation: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self {
            require_ai_annotation: true,
        }
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `AI.*` calls in tasks without `@mcp`/`@ai`.
    pub fn require_ai_annotation(mut self, require: bool) -> Self {
        self.require_ai_annotation = require;
        self
    }

    pub fn build(&self, modules: Vec<ModuleDecl>) -> Result<DependencyGraph> {
        let modules = select_versions(modules)?;

        // Arena
        let mut nodes: Vec<TaskNode> = Vec::new();
        let mut by_qualified = HashMap::new();
        let mut by_name: HashMap<String, Vec<TaskId>> = HashMap::new();
        let mut run_directive = None;

        for module in &modules {
            let mut seen = HashSet::new();
            for task in &module.tasks {
                if !seen.insert(task.name.as_str()) {
                    return Err(GuardError::DuplicateTaskName {
                        module: module.name.clone(),
                        task: task.name.clone(),
                    });
                }
                let id = nodes.len();
                by_qualified.insert(format!("{}.{}", module.name, task.name), id);
                by_name.entry(task.name.clone()).or_default().push(id);
                nodes.push(TaskNode {
                    id,
                    module: module.name.clone(),
                    decl: task.clone(),
                    deps: Vec::new(),
                });
            }
            if run_directive.is_none() {
                run_directive = module.run.clone();
            }
        }

        // Edges
        for id in 0..nodes.len() {
            let mut deps = Vec::new();
            for reference in &nodes[id].decl.inputs {
                let dep = resolve_reference(&nodes, &by_qualified, &by_name, id, reference)?;
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
            nodes[id].deps = deps;
        }

        for module in &modules {
            for task in &module.tasks {
                self.check_operations(module, task)?;
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        for node in &nodes {
            for &d in &node.deps {
                dependents[d].push(node.id);
            }
        }

        let order = topological_order(&nodes, &dependents)?;
        debug!(tasks = nodes.len(), "Dependency graph built");

        Ok(DependencyGraph {
            nodes,
            dependents,
            order,
            by_qualified,
            by_name,
            run_directive,
        })
    }

    fn check_operations(&self, module: &ModuleDecl, task: &TaskDecl) -> Result<()> {
        for step in &task.steps {
            let guard_call = step.guard.as_ref().and_then(|g| match &g.condition {
                GuardCondition::Call(op) => Some(op),
                GuardCondition::Expr(_) => None,
            });
            for op in step.call.iter().chain(guard_call) {
                if op.is_ai() {
                    check_ai_operation(op, task, self.require_ai_annotation)?;
                } else if !module.imports_module(&op.module) && op.module != module.name {
                    warn!(
                        module = %module.name,
                        task = %task.name,
                        operation = %op,
                        "Operation uses a module that is not imported"
                    );
                }
            }
        }
        Ok(())
    }
}

fn check_ai_operation(op: &OperationRef, task: &TaskDecl, require_annotation: bool) -> Result<()> {
    if McpRequestKind::from_function(&op.function).is_none() {
        return Err(GuardError::Declaration(format!(
            "task '{}' calls unknown operation {}.{}",
            task.name, AI_MODULE, op.function
        )));
    }
    if require_annotation && !task.ai_enabled() {
        return Err(GuardError::AiNotPermitted {
            task: task.name.clone(),
            function: op.function.clone(),
        });
    }
    Ok(())
}

/// Keep one declaration per module name: the highest version wins.
fn select_versions(modules: Vec<ModuleDecl>) -> Result<Vec<ModuleDecl>> {
    let mut selected: Vec<ModuleDecl> = Vec::new();
    for module in modules {
        match selected.iter_mut().find(|m| m.name == module.name) {
            None => selected.push(module),
            Some(existing) => {
                if existing.version == module.version {
                    return Err(GuardError::DuplicateModule {
                        module: module.name,
                        version: module.version.to_string(),
                    });
                }
                warn!(
                    module = %module.name,
                    first = %existing.version,
                    second = %module.version,
                    "Module declared twice, using the higher version"
                );
                if module.version > existing.version {
                    *existing = module;
                }
            }
        }
    }
    Ok(selected)
}

fn resolve_reference(
    nodes: &[TaskNode],
    by_qualified: &HashMap<String, TaskId>,
    by_name: &HashMap<String, Vec<TaskId>>,
    from: TaskId,
    reference: &str,
) -> Result<TaskId> {
    let task = &nodes[from];
    if let Some(&id) = by_qualified.get(reference) {
        return Ok(id);
    }
    let unknown = || GuardError::UnknownTaskReference {
        task: task.decl.name.clone(),
        reference: reference.to_string(),
    };
    let candidates = by_name.get(reference).ok_or_else(unknown)?;

    // Same module first
    if let Some(&id) = candidates.iter().find(|&&c| nodes[c].module == task.module) {
        return Ok(id);
    }
    match candidates.as_slice() {
        [id] => Ok(*id),
        [] => Err(unknown()),
        many => Err(GuardError::AmbiguousTaskReference {
            task: task.decl.name.clone(),
            reference: reference.to_string(),
            candidates: many.iter().map(|&c| nodes[c].qualified()).collect(),
        }),
    }
}

/// Kahn's algorithm; ties broken by declaration order.
fn topological_order(nodes: &[TaskNode], dependents: &[Vec<TaskId>]) -> Result<Vec<TaskId>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut ready: BTreeSet<TaskId> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &d in &dependents[id] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let blocked: BTreeSet<TaskId> = (0..nodes.len()).filter(|&i| in_degree[i] > 0).collect();
    let cycle = find_cycle(nodes, &blocked);
    Err(GuardError::CyclicDependency {
        cycle: cycle
            .into_iter()
            .map(|id| nodes[id].decl.name.clone())
            .collect(),
    })
}

/// Walk dependency edges from the first blocked task until a node repeats.
///
/// Every blocked task has a blocked dependency, so the walk must revisit a
/// node. The result runs upstream to downstream and repeats its first member
/// at the end.
fn find_cycle(nodes: &[TaskNode], blocked: &BTreeSet<TaskId>) -> Vec<TaskId> {
    let Some(&start) = blocked.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = nodes[current].deps.iter().find(|d| blocked.contains(d)) else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<TaskId> = path[pos..].to_vec();
            cycle.push(next);
            // Path follows deps; report in execution direction
            cycle.reverse();
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
