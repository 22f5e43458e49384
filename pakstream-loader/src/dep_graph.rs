use pakstream_base::hashing::{HashMap, HashSet};
use pakstream_base::SymbolIndex;

/// Weak reference to a task in the scheduler's registry. The generation
/// counter is checked on every dereference so a stale ref to a torn-down
/// task yields "gone" instead of touching a recycled slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub index: u32,
    pub generation: u32,
}

/// One unit of schedulable work: a phase gate of a package, or a sub-phase
/// of a single symbol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The package's export/import tables have been declared into the graph.
    /// Dependents may wire cross-package symbol edges past this point.
    SymbolsDeclared,
    /// All dependency packages this task waits on have declared their
    /// symbols. Gates leaving `AwaitingDependencyPackages`.
    DependenciesReady,
    /// Every export payload of this package has been serialized.
    ExportsSerialized,
    /// This task and every package it depends on have serialized their
    /// exports. Gates leaving `AwaitingDependentPostProcessing`.
    PostProcessGate,
    /// Allocate the object / resolve the pointer for one symbol.
    Create(SymbolIndex),
    /// Request the payload byte range (exports only). Fires when the
    /// covering read completes.
    StartIo(SymbolIndex),
    /// Deserialize the symbol's payload.
    Serialize(SymbolIndex),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub task: TaskRef,
    pub kind: NodeKind,
}

struct NodeState {
    prereq_count: u32,
    waiters: Vec<NodeId>,
}

/// Directed prerequisite graph shared by every in-flight task.
///
/// Nodes are created lazily as work is discovered and destroyed immediately
/// upon firing; a fired-id set is retained so firing is idempotent and edges
/// to already-satisfied prerequisites are recognized. Cyclic package
/// relationships are expressed purely as edges here, never as task-to-task
/// ownership.
#[derive(Default)]
pub struct DependencyGraph {
    nodes: HashMap<NodeId, NodeState>,
    fired: HashSet<NodeId>,
}

impl DependencyGraph {
    /// Idempotent. Returns true if the node was newly created.
    pub fn add_node(
        &mut self,
        id: NodeId,
    ) -> bool {
        if self.fired.contains(&id) || self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(
            id,
            NodeState {
                prereq_count: 0,
                waiters: Vec::default(),
            },
        );
        true
    }

    pub fn is_fired(
        &self,
        id: NodeId,
    ) -> bool {
        self.fired.contains(&id)
    }

    /// A node is ready when it exists, has no pending prerequisites and has
    /// not fired. Every ready node must be queued by the scheduler.
    pub fn is_ready(
        &self,
        id: NodeId,
    ) -> bool {
        self.nodes
            .get(&id)
            .map(|n| n.prereq_count == 0)
            .unwrap_or(false)
    }

    /// Adds `prereq -> dependent`. A fired prerequisite is already satisfied
    /// and adds nothing. Adding an edge to an already-fired dependent is a
    /// scheduler race and fatal.
    pub fn add_edge(
        &mut self,
        prereq: NodeId,
        dependent: NodeId,
    ) {
        if self.fired.contains(&dependent) {
            panic!(
                "edge added to already-fired node {:?} (prereq {:?})",
                dependent, prereq
            );
        }
        self.add_node(dependent);
        if self.fired.contains(&prereq) {
            return;
        }
        self.add_node(prereq);
        self.nodes.get_mut(&prereq).unwrap().waiters.push(dependent);
        self.nodes.get_mut(&dependent).unwrap().prereq_count += 1;
    }

    /// Fires a node, destroying it and decrementing its waiters. Waiters
    /// whose prerequisite count reaches zero are appended to `newly_ready`
    /// for the scheduler to queue; the walk is breadth-first so deep chains
    /// never grow the stack. Firing an already-fired node is a no-op.
    pub fn fire(
        &mut self,
        id: NodeId,
        newly_ready: &mut Vec<NodeId>,
    ) {
        if self.fired.contains(&id) {
            return;
        }
        let waiters = match self.nodes.remove(&id) {
            Some(state) => state.waiters,
            // Never materialized; mark fired so future edges see it satisfied.
            None => Vec::default(),
        };
        self.fired.insert(id);

        for waiter in waiters {
            if let Some(state) = self.nodes.get_mut(&waiter) {
                debug_assert!(state.prereq_count > 0);
                state.prereq_count -= 1;
                if state.prereq_count == 0 {
                    newly_ready.push(waiter);
                }
            }
            // A missing, unfired waiter belonged to a torn-down task.
        }
    }

    /// Drops every node and fired mark belonging to a task. Used on
    /// cancel/teardown after the task's nodes have been fired so that
    /// waiters in other tasks were already notified.
    pub fn remove_all_nodes_of(
        &mut self,
        task: TaskRef,
    ) -> usize {
        let before = self.nodes.len() + self.fired.len();
        self.nodes.retain(|id, _| id.task != task);
        self.fired.retain(|id| id.task != task);
        before - (self.nodes.len() + self.fired.len())
    }

    /// Unfired nodes still owned by a task. Zero is a precondition for the
    /// task to leave the worker thread.
    pub fn unfired_count_of(
        &self,
        task: TaskRef,
    ) -> usize {
        self.nodes.keys().filter(|id| id.task == task).count()
    }

    pub fn unfired_nodes_of(
        &self,
        task: TaskRef,
    ) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| id.task == task)
            .copied()
            .collect()
    }

    /// Walks the full edge set with a recursion-stack DFS and returns the
    /// first cycle found. Diagnostics and tests only, not the hot path.
    pub fn detect_cycles(&self) -> Option<Vec<NodeId>> {
        let mut visited: HashSet<NodeId> = HashSet::default();
        let mut stack: Vec<NodeId> = Vec::default();
        let mut on_stack: HashSet<NodeId> = HashSet::default();

        for &start in self.nodes.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) =
                self.dfs_cycle(start, &mut visited, &mut stack, &mut on_stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: NodeId,
        visited: &mut HashSet<NodeId>,
        stack: &mut Vec<NodeId>,
        on_stack: &mut HashSet<NodeId>,
    ) -> Option<Vec<NodeId>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(state) = self.nodes.get(&node) {
            for &waiter in &state.waiters {
                if on_stack.contains(&waiter) {
                    let cycle_start = stack.iter().position(|&n| n == waiter).unwrap();
                    return Some(stack[cycle_start..].to_vec());
                }
                if !visited.contains(&waiter) {
                    if let Some(cycle) = self.dfs_cycle(waiter, visited, stack, on_stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        on_stack.remove(&node);
        None
    }
}
