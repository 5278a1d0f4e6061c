use orchcore::{DependencyMode, Phase, Task, TaskId, WorkflowError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validated dependency DAG of a workflow, partitioned into phases
///
/// Edges point from a dependency to its dependent. Construction fails fast
/// on cycles, so a built graph is always safe to schedule.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Submission order
    order: Vec<TaskId>,
    /// Effective dependencies after lenient-mode pruning
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    phases: Vec<Phase>,
}

impl DependencyGraph {
    /// Build, validate and partition the dependency relation of `tasks`
    pub fn build(tasks: &[Task], mode: DependencyMode) -> Result<Self, WorkflowError> {
        if tasks.is_empty() {
            return Err(WorkflowError::EmptyWorkflow);
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        // Add all tasks
        for task in tasks {
            if index.contains_key(&task.id) {
                return Err(WorkflowError::DuplicateTask(task.id.clone()));
            }
            let idx = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), idx);
            order.push(task.id.clone());
        }

        // Add edges from declared dependencies
        let mut dependencies = HashMap::new();
        for task in tasks {
            let mut resolved = Vec::new();
            for dep in &task.dependencies {
                match index.get(dep) {
                    Some(from) => {
                        if !resolved.contains(dep) {
                            graph.add_edge(*from, index[&task.id], ());
                            resolved.push(dep.clone());
                        }
                    }
                    None => match mode {
                        DependencyMode::Strict => {
                            return Err(WorkflowError::UnknownDependency {
                                task: task.id.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        DependencyMode::Lenient => {
                            tracing::warn!(
                                "Dropping unknown dependency '{}' of task '{}'",
                                dep,
                                task.id
                            );
                        }
                    },
                }
            }
            dependencies.insert(task.id.clone(), resolved);
        }

        let mut built = Self {
            graph,
            index,
            order,
            dependencies,
            phases: Vec::new(),
        };

        if let Some(cycle) = built.find_cycle() {
            return Err(WorkflowError::CycleDetected(cycle));
        }

        built.phases = built.partition();
        tracing::debug!(
            "Partitioned {} tasks into {} phases",
            built.order.len(),
            built.phases.len()
        );
        Ok(built)
    }

    /// DFS 3-coloring over dependency edges, visiting roots in submission order
    ///
    /// Returns the members of the first cycle found, in the order the search
    /// entered them.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<NodeIndex, Color> = self
            .graph
            .node_indices()
            .map(|idx| (idx, Color::White))
            .collect();

        for id in &self.order {
            let root = self.index[id];
            if colors[&root] != Color::White {
                continue;
            }

            // Iterative DFS: (node, remaining dependencies to visit)
            let mut path: Vec<NodeIndex> = Vec::new();
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
            colors.insert(root, Color::Gray);
            path.push(root);
            stack.push((root, self.dependency_indices(root)));

            while let Some((node, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match colors[&next] {
                        Color::White => {
                            colors.insert(next, Color::Gray);
                            path.push(next);
                            let deps = self.dependency_indices(next);
                            stack.push((next, deps));
                        }
                        Color::Gray => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            return Some(
                                path[start..]
                                    .iter()
                                    .map(|n| self.graph[*n].clone())
                                    .collect(),
                            );
                        }
                        Color::Black => {}
                    },
                    None => {
                        let done = *node;
                        colors.insert(done, Color::Black);
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// Dependencies of `node`, reversed so that popping yields declaration order
    fn dependency_indices(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<NodeIndex> = self
            .dependencies
            .get(&self.graph[node])
            .map(|ids| ids.iter().map(|id| self.index[id]).collect())
            .unwrap_or_default();
        deps.reverse();
        deps
    }

    /// Iterative Kahn layering; each phase keeps submission order
    fn partition(&self) -> Vec<Phase> {
        let mut in_degree: HashMap<&TaskId, usize> = self
            .order
            .iter()
            .map(|id| (id, self.dependencies[id].len()))
            .collect();
        let mut placed: HashSet<&TaskId> = HashSet::new();
        let mut phases = Vec::new();

        while placed.len() < self.order.len() {
            let layer: Vec<&TaskId> = self
                .order
                .iter()
                .filter(|id| !placed.contains(id) && in_degree[id] == 0)
                .collect();

            // Unreachable for a validated DAG
            if layer.is_empty() {
                break;
            }

            for id in &layer {
                let idx = self.index[*id];
                for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&self.graph[dependent]) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
            placed.extend(layer.iter().copied());

            let task_ids = layer.into_iter().cloned().collect();
            phases.push(Phase::new(phases.len(), task_ids));
        }

        phases
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn into_phases(self) -> Vec<Phase> {
        self.phases
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Effective dependencies of a task
    pub fn dependencies(&self, id: &str) -> &[TaskId] {
        self.dependencies
            .get(id)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }

    /// Index of the phase containing `id`
    pub fn phase_of(&self, id: &str) -> Option<usize> {
        self.phases
            .iter()
            .find(|p| p.task_ids.iter().any(|t| t == id))
            .map(|p| p.index)
    }

    /// Every task that directly or transitively depends on `id`
    pub fn transitive_dependents(&self, id: &str) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        self.order
            .iter()
            .filter(|t| seen.contains(&self.index[*t]))
            .cloned()
            .collect()
    }
}
