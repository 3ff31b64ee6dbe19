//! Dependency graphs of tasks.
//!
//! Nodes live in an arena and are addressed by stable [`NodeId`]s. Edges are
//! stored explicitly as `(dependent, dependency)` pairs, so a graph can be torn
//! down to its result node with [`TaskGraph::release`] and rebuilt later with
//! the very same ids and edges by [`TaskGraph::restore`].

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{execute, Deadline, Reason, Task, TaskId, TaskState, CURRENT_FRAME};
use crate::error::GraphError;

/// Stable index of a node inside one [`TaskGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Node {
    Live(Arc<dyn Task>),
    /// Dropped by `release`; kept weakly so `restore` can bring it back.
    Released(TaskId, Weak<dyn Task>),
    Vacant,
}

impl Node {
    fn live(&self) -> Option<&Arc<dyn Task>> {
        match self {
            Node::Live(task) => Some(task),
            _ => None,
        }
    }

    fn task_id(&self) -> Option<TaskId> {
        match self {
            Node::Live(task) => Some(task.id()),
            Node::Released(id, _) => Some(*id),
            Node::Vacant => None,
        }
    }
}

struct GraphInner {
    nodes: Vec<Node>,
    /// `(dependent, dependency)`: the first node runs after the second.
    edges: BTreeSet<(NodeId, NodeId)>,
    saved_edges: Vec<(NodeId, NodeId)>,
    result: Option<NodeId>,
    deadline: Deadline,
}

impl GraphInner {
    fn live(&self, node: NodeId) -> Result<&Arc<dyn Task>, GraphError> {
        self.nodes
            .get(node.0)
            .and_then(Node::live)
            .ok_or(GraphError::UnknownNode(node.0))
    }

    fn live_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.live().is_some())
            .map(|(i, _)| NodeId(i))
    }

    fn dependencies_of(&self, node: NodeId) -> Vec<NodeId> {
        self.edges
            .range((node, NodeId(0))..=(node, NodeId(usize::MAX)))
            .map(|&(_, src)| src)
            .collect()
    }

    fn dependents_of(&self, node: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|&&(_, src)| src == node)
            .map(|&(dst, _)| dst)
            .collect()
    }

    /// All nodes that transitively depend on `node`.
    fn transitive_dependents(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([node]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for dst in self.dependents_of(current) {
                if seen.insert(dst) {
                    out.push(dst);
                    queue.push_back(dst);
                }
            }
        }
        out
    }

    /// Whether `to` is reachable from `from` by following dependency edges.
    fn depends_on(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.dependencies_of(current));
            }
        }
        false
    }

    fn topological_order(&self) -> Vec<(NodeId, Arc<dyn Task>)> {
        let live: Vec<NodeId> = self.live_ids().collect();
        let mut remaining: Vec<usize> = vec![0; self.nodes.len()];
        for &(dst, _) in &self.edges {
            remaining[dst.0] += 1;
        }

        let mut ready: VecDeque<NodeId> = live
            .iter()
            .copied()
            .filter(|n| remaining[n.0] == 0)
            .collect();
        let mut order = Vec::with_capacity(live.len());

        while let Some(node) = ready.pop_front() {
            if let Some(task) = self.nodes[node.0].live() {
                order.push((node, Arc::clone(task)));
            }
            for dst in self.dependents_of(node) {
                remaining[dst.0] -= 1;
                if remaining[dst.0] == 0 {
                    ready.push_back(dst);
                }
            }
        }
        order
    }
}

/// A set of tasks linked by dependencies, with an optional result task.
///
/// The graph is itself a [`Task`]: running it runs every pending node after
/// all of the nodes it depends on, and it is done when all nodes are done.
pub struct TaskGraph {
    id: TaskId,
    inner: Mutex<GraphInner>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            id: TaskId::next(),
            inner: Mutex::new(GraphInner {
                nodes: Vec::new(),
                edges: BTreeSet::new(),
                saved_edges: Vec::new(),
                result: None,
                deadline: CURRENT_FRAME,
            }),
        }
    }

    /// Creates a graph whose result node is `task`.
    pub fn with_result(task: Arc<dyn Task>) -> Self {
        let graph = Self::new();
        {
            let mut inner = graph.inner.lock();
            inner.nodes.push(Node::Live(task));
            inner.result = Some(NodeId(0));
        }
        graph
    }

    /// Adds a task and returns its node.
    ///
    /// Adding a task that is already in the graph returns its existing node.
    /// A task that was released keeps the node id it had before.
    pub fn add_task(&self, task: Arc<dyn Task>) -> NodeId {
        let mut inner = self.inner.lock();
        let id = task.id();
        if let Some(index) = inner.nodes.iter().position(|n| n.task_id() == Some(id)) {
            inner.nodes[index] = Node::Live(task);
            return NodeId(index);
        }
        if let Some(index) = inner.nodes.iter().position(|n| matches!(n, Node::Vacant)) {
            inner.nodes[index] = Node::Live(task);
            return NodeId(index);
        }
        inner.nodes.push(Node::Live(task));
        NodeId(inner.nodes.len() - 1)
    }

    /// Removes a task and every edge touching it.
    pub fn remove_task(&self, node: NodeId) -> Option<Arc<dyn Task>> {
        let mut inner = self.inner.lock();
        let slot = inner.nodes.get_mut(node.0)?;
        let task = match std::mem::replace(slot, Node::Vacant) {
            Node::Live(task) => task,
            other => {
                *slot = other;
                return None;
            }
        };
        inner.edges.retain(|&(dst, src)| dst != node && src != node);
        if inner.result == Some(node) {
            inner.result = None;
        }
        Some(task)
    }

    /// Makes `dependent` run after `dependency`.
    pub fn add_dependency(&self, dependent: NodeId, dependency: NodeId) -> Result<(), GraphError> {
        let mut inner = self.inner.lock();
        inner.live(dependent)?;
        inner.live(dependency)?;
        if dependent == dependency {
            return Err(GraphError::SelfDependency(dependent.0));
        }
        if inner.depends_on(dependency, dependent) {
            return Err(GraphError::Cycle {
                src: dependency.0,
                dst: dependent.0,
            });
        }
        inner.edges.insert((dependent, dependency));
        Ok(())
    }

    pub fn remove_dependency(&self, dependent: NodeId, dependency: NodeId) -> bool {
        self.inner.lock().edges.remove(&(dependent, dependency))
    }

    /// Designates the node whose completion is the purpose of the graph.
    pub fn set_result(&self, node: NodeId) -> Result<(), GraphError> {
        let mut inner = self.inner.lock();
        inner.live(node)?;
        inner.result = Some(node);
        Ok(())
    }

    pub fn result_node(&self) -> Option<NodeId> {
        self.inner.lock().result
    }

    pub fn result(&self) -> Option<Arc<dyn Task>> {
        let inner = self.inner.lock();
        inner.result.and_then(|n| inner.live(n).ok().cloned())
    }

    /// Adds `task` as a dependency of the result node.
    pub fn add_result_dependency(&self, task: Arc<dyn Task>) -> Result<NodeId, GraphError> {
        let result = self.result_node().ok_or(GraphError::NoResult)?;
        let node = self.add_task(task);
        self.add_dependency(result, node)?;
        Ok(node)
    }

    pub fn task(&self, node: NodeId) -> Option<Arc<dyn Task>> {
        self.inner.lock().live(node).ok().cloned()
    }

    pub fn node_of(&self, id: TaskId) -> Option<NodeId> {
        let inner = self.inner.lock();
        inner
            .nodes
            .iter()
            .position(|n| n.live().is_some_and(|t| t.id() == id))
            .map(NodeId)
    }

    pub fn dependencies(&self, node: NodeId) -> Vec<NodeId> {
        self.inner.lock().dependencies_of(node)
    }

    pub fn dependents(&self, node: NodeId) -> Vec<NodeId> {
        self.inner.lock().dependents_of(node)
    }

    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.inner.lock().edges.iter().copied().collect()
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().live_ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live tasks in dependency order.
    pub fn topological_order(&self) -> Vec<Arc<dyn Task>> {
        self.inner
            .lock()
            .topological_order()
            .into_iter()
            .map(|(_, task)| task)
            .collect()
    }

    /// Marks a node pending and every node depending on it, directly or not,
    /// pending with [`Reason::DependencyChanged`].
    pub fn invalidate_node(&self, node: NodeId, reason: Reason) -> Result<(), GraphError> {
        let (task, dependents) = {
            let inner = self.inner.lock();
            let task = Arc::clone(inner.live(node)?);
            let dependents: Vec<_> = inner
                .transitive_dependents(node)
                .into_iter()
                .filter_map(|n| inner.live(n).ok().cloned())
                .collect();
            (task, dependents)
        };
        task.set_state(TaskState::Pending(reason));
        for dependent in dependents {
            dependent.set_state(TaskState::Pending(Reason::DependencyChanged));
        }
        Ok(())
    }

    /// Tears the graph down to its result node.
    ///
    /// Every other node is kept only as a weak reference and the current edge
    /// set is saved. The strong references that were dropped from the graph
    /// are returned so the caller decides where they are released.
    pub fn release(&self) -> Vec<Arc<dyn Task>> {
        let mut inner = self.inner.lock();
        let result = inner.result;
        let mut released = Vec::new();
        for (index, node) in inner.nodes.iter_mut().enumerate() {
            if Some(NodeId(index)) == result {
                continue;
            }
            if let Node::Live(task) = node {
                let weak = Arc::downgrade(task);
                let id = task.id();
                if let Node::Live(task) = std::mem::replace(node, Node::Released(id, weak)) {
                    released.push(task);
                }
            }
        }
        let edges = std::mem::take(&mut inner.edges);
        inner.saved_edges.extend(edges);
        released
    }

    /// Rebuilds a released graph.
    ///
    /// Released tasks that are still alive come back under their original
    /// node ids, and saved edges between live nodes are re-inserted verbatim.
    /// Returns the number of tasks brought back.
    pub fn restore(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut restored = 0;
        for node in inner.nodes.iter_mut() {
            if let Node::Released(_, weak) = node {
                *node = match weak.upgrade() {
                    Some(task) => {
                        restored += 1;
                        Node::Live(task)
                    }
                    None => Node::Vacant,
                };
            }
        }
        let saved = std::mem::take(&mut inner.saved_edges);
        for (dst, src) in saved {
            if inner.live(dst).is_ok() && inner.live(src).is_ok() {
                inner.edges.insert((dst, src));
            }
        }
        restored
    }

    /// Whether the graph holds released nodes waiting for `restore`.
    pub fn is_released(&self) -> bool {
        let inner = self.inner.lock();
        !inner.saved_edges.is_empty()
            || inner
                .nodes
                .iter()
                .any(|n| matches!(n, Node::Released(..)))
    }

    fn pending_tasks(&self) -> Vec<Arc<dyn Task>> {
        let inner = self.inner.lock();
        inner
            .nodes
            .iter()
            .filter_map(Node::live)
            .filter(|t| !t.is_done())
            .cloned()
            .collect()
    }

    fn live_tasks(&self) -> Vec<Arc<dyn Task>> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter_map(Node::live)
            .cloned()
            .collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for TaskGraph {
    fn id(&self) -> TaskId {
        self.id
    }

    fn deadline(&self) -> Deadline {
        self.inner.lock().deadline
    }

    fn set_deadline(&self, deadline: Deadline) {
        self.inner.lock().deadline = deadline;
        for task in self.live_tasks() {
            task.set_deadline(deadline);
        }
    }

    fn is_gpu_task(&self) -> bool {
        self.live_tasks().iter().any(|t| t.is_gpu_task())
    }

    fn state(&self) -> TaskState {
        let (result, tasks) = {
            let inner = self.inner.lock();
            let result = inner.result.and_then(|n| inner.live(n).ok().cloned());
            let tasks: Vec<_> = inner.nodes.iter().filter_map(Node::live).cloned().collect();
            (result, tasks)
        };
        if let Some(TaskState::Pending(reason)) = result.map(|r| r.state()) {
            return TaskState::Pending(reason);
        }
        tasks
            .iter()
            .map(|t| t.state())
            .find(|s| !s.is_done())
            .unwrap_or(TaskState::Done)
    }

    /// `Done` marks every node done. `Pending` goes to the result node, or to
    /// every node when the graph has no result.
    fn set_state(&self, state: TaskState) {
        let targets = match state {
            TaskState::Done => self.live_tasks(),
            TaskState::Pending(_) => match self.result() {
                Some(result) => vec![result],
                None => self.live_tasks(),
            },
        };
        for task in targets {
            task.set_state(state);
        }
    }

    /// Nodes settle their own state as `run` executes them, so the graph is
    /// complete once every node is done. A node sent back to pending during
    /// the run keeps the graph pending.
    fn complete(&self, _generation: u64) -> bool {
        self.is_done()
    }

    fn init(&self) {
        for task in self.pending_tasks() {
            task.init();
        }
    }

    fn run(&self) -> bool {
        let order = self.inner.lock().topological_order();
        let mut changed = false;
        for (node, task) in order {
            if task.is_done() {
                continue;
            }
            if execute(task.as_ref()) {
                changed = true;
                let dependents: Vec<_> = {
                    let inner = self.inner.lock();
                    inner
                        .dependents_of(node)
                        .into_iter()
                        .filter_map(|n| inner.live(n).ok().cloned())
                        .collect()
                };
                for dependent in dependents.into_iter().filter(|d| d.is_done()) {
                    dependent.set_state(TaskState::Pending(Reason::DependencyChanged));
                }
            }
        }
        changed
    }
}

// =============================================================================
// Tests
// =============================================================================
