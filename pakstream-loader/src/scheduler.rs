use crate::dep_graph::{DependencyGraph, NodeId, NodeKind, TaskRef};
use crate::disk_io::{DiskIoThreadPool, ReadCompletion, ReadRequest};
use crate::error::{LoadError, LoadResult};
use crate::object_model::{ObjectFactory, ObjectRef, ObjectSpawnDesc};
use crate::package_task::{HeaderProgress, PackageTask, TaskPhase};
use crossbeam_channel::{Receiver, Sender};
use pakstream_base::hashing::{HashMap, HashSet};
use pakstream_base::{LoadPriority, PackageName, RequestId, SymbolIndex};
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Soft time limit for one tick. Checked between phases and symbols, never
/// inside one, so a single oversized symbol overruns rather than being split.
#[derive(Clone)]
pub struct TickBudget {
    deadline: Option<Instant>,
}

impl TickBudget {
    pub fn unlimited() -> Self {
        TickBudget { deadline: None }
    }

    pub fn with_limit(limit: Duration) -> Self {
        TickBudget {
            deadline: Some(Instant::now() + limit),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// Events delivered to the scheduler from I/O workers and from the calling
/// thread's finalize drain.
pub enum SchedulerEvent {
    ReadComplete(ReadCompletion),
    /// The calling thread finished fixup and callbacks for a task.
    FinalizeDone(TaskRef),
}

/// Thread-safe intake. Anything may hold a sender; the worker drains at the
/// top of every tick.
pub enum IntakeMessage {
    Load {
        request_id: RequestId,
        name: PackageName,
        source_file: Option<PathBuf>,
        priority: LoadPriority,
        callback: Box<dyn FnOnce(LoadResult) + Send>,
    },
    SetPriority {
        request_id: RequestId,
        priority: LoadPriority,
    },
    CancelAll,
}

/// Work handed to the calling thread. Fixup and callbacks must run there;
/// the scheduler only prepares the package.
pub struct FinalizeItem {
    /// None for results that never had a task (known-missing fast path,
    /// duplicate requests against an already-finished package).
    pub task: Option<TaskRef>,
    pub name: PackageName,
    pub objects: Vec<ObjectRef>,
    pub result: LoadResult,
    pub callbacks: Vec<(RequestId, Box<dyn FnOnce(LoadResult) + Send>)>,
}

struct TaskSlot {
    generation: u32,
    task: Option<PackageTask>,
}

/// Ready-queue entry. Priority is sampled at push time; priority bumps
/// re-push affected nodes and stale duplicates are skipped on pop.
struct ReadyNode {
    priority: LoadPriority,
    seq: u64,
    node: NodeId,
}

impl PartialEq for ReadyNode {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyNode {}

impl PartialOrd for ReadyNode {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyNode {
    fn cmp(
        &self,
        other: &Self,
    ) -> std::cmp::Ordering {
        // Highest priority first, oldest first within a priority
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Owns every in-flight load: the task registry, the shared dependency
/// graph, the I/O pool and the ready queue. Runs on whichever thread ticks
/// it; all cross-thread traffic goes through channels.
pub struct LoadScheduler {
    factory: Box<dyn ObjectFactory>,
    io_pool: Option<DiskIoThreadPool>,
    event_tx: Sender<SchedulerEvent>,
    event_rx: Receiver<SchedulerEvent>,
    pending_events: Vec<SchedulerEvent>,
    intake_rx: Receiver<IntakeMessage>,
    finalize_tx: Sender<FinalizeItem>,
    root_path: PathBuf,

    graph: DependencyGraph,
    slots: Vec<TaskSlot>,
    free_slots: Vec<u32>,
    by_name: HashMap<PackageName, TaskRef>,
    by_request: HashMap<RequestId, TaskRef>,

    ready_queue: BinaryHeap<ReadyNode>,
    ready_seq: u64,
    new_tasks: Vec<TaskRef>,
    declaring: Vec<TaskRef>,

    known_missing: HashSet<PackageName>,
    known_missing_hits: u64,
    active_task_count: usize,
}

impl Drop for LoadScheduler {
    fn drop(&mut self) {
        // Workers are joined while event_rx is still alive so in-flight
        // completions have somewhere to land.
        if let Some(pool) = self.io_pool.take() {
            pool.finish();
        }
    }
}

impl LoadScheduler {
    pub fn new(
        factory: Box<dyn ObjectFactory>,
        root_path: PathBuf,
        io_thread_count: usize,
    ) -> (Self, Sender<IntakeMessage>, Receiver<FinalizeItem>) {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (intake_tx, intake_rx) = crossbeam_channel::unbounded();
        let (finalize_tx, finalize_rx) = crossbeam_channel::unbounded();
        let io_pool = Some(DiskIoThreadPool::new(io_thread_count, event_tx.clone()));

        let scheduler = LoadScheduler {
            factory,
            io_pool,
            event_tx: event_tx.clone(),
            event_rx,
            pending_events: Vec::default(),
            intake_rx,
            finalize_tx,
            root_path,
            graph: DependencyGraph::default(),
            slots: Vec::default(),
            free_slots: Vec::default(),
            by_name: HashMap::default(),
            by_request: HashMap::default(),
            ready_queue: BinaryHeap::default(),
            ready_seq: 0,
            new_tasks: Vec::default(),
            declaring: Vec::default(),
            known_missing: HashSet::default(),
            known_missing_hits: 0,
            active_task_count: 0,
        };
        (scheduler, intake_tx, finalize_rx)
    }

    /// Sender for finalize acknowledgements (and any other event produced
    /// off the worker).
    pub fn event_sender(&self) -> Sender<SchedulerEvent> {
        self.event_tx.clone()
    }

    //
    // Registry access. Every task reference is generation-checked; a stale
    // ref resolves to None instead of a recycled slot.
    //

    fn task(
        &self,
        task_ref: TaskRef,
    ) -> Option<&PackageTask> {
        let slot = self.slots.get(task_ref.index as usize)?;
        if slot.generation != task_ref.generation {
            return None;
        }
        slot.task.as_ref()
    }

    fn task_mut(
        &mut self,
        task_ref: TaskRef,
    ) -> Option<&mut PackageTask> {
        let slot = self.slots.get_mut(task_ref.index as usize)?;
        if slot.generation != task_ref.generation {
            return None;
        }
        slot.task.as_mut()
    }

    fn take_task(
        &mut self,
        task_ref: TaskRef,
    ) -> Option<PackageTask> {
        let slot = self.slots.get_mut(task_ref.index as usize)?;
        if slot.generation != task_ref.generation {
            return None;
        }
        slot.task.take()
    }

    fn put_task(
        &mut self,
        task: PackageTask,
    ) {
        let index = task.task_ref.index as usize;
        self.slots[index].task = Some(task);
    }

    //
    // Introspection
    //

    pub fn active_load_count(&self) -> usize {
        self.active_task_count
    }

    pub fn known_missing_hits(&self) -> u64 {
        self.known_missing_hits
    }

    pub fn load_percentage(
        &self,
        name: &PackageName,
    ) -> Option<f32> {
        let task_ref = *self.by_name.get(name)?;
        Some(self.task(task_ref)?.load_fraction() * 100.0)
    }

    pub fn has_ready_work(&self) -> bool {
        !self.ready_queue.is_empty()
            || !self.new_tasks.is_empty()
            || !self.declaring.is_empty()
            || !self.pending_events.is_empty()
            || !self.intake_rx.is_empty()
            || !self.event_rx.is_empty()
    }

    pub fn io_outstanding(&self) -> bool {
        self.io_pool
            .as_ref()
            .map(|p| p.active_request_count() > 0)
            .unwrap_or(false)
    }

    /// Blocks up to `timeout` for an I/O completion or finalize ack. Used by
    /// flush when there is nothing else to do.
    pub fn wait_for_event(
        &mut self,
        timeout: Duration,
    ) -> bool {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.pending_events.push(event);
                true
            }
            Err(_) => false,
        }
    }

    pub fn dump_cycles(&self) {
        if let Some(cycle) = self.graph.detect_cycles() {
            log::error!("dependency cycle with no runnable node: {:?}", cycle);
        }
    }

    //
    // Tick
    //

    /// One scheduler step. Event draining, intake and header kickoff always
    /// run; node execution stops once the budget is exceeded.
    #[profiling::function]
    pub fn tick(
        &mut self,
        budget: &TickBudget,
    ) {
        self.drain_events();
        self.drain_intake();
        self.promote_new_tasks();

        let pending_declarations = std::mem::take(&mut self.declaring);
        for task_ref in pending_declarations {
            if budget.is_exceeded() {
                self.declaring.push(task_ref);
            } else {
                self.resume_declaration(task_ref, budget);
            }
        }

        let mut last_work: Option<(PackageName, &'static str)> = None;
        loop {
            if budget.is_exceeded() {
                if let Some((name, label)) = last_work {
                    log::warn!("tick budget overrun; last work was {} for {}", label, name);
                }
                break;
            }
            let Some(entry) = self.ready_queue.pop() else {
                break;
            };
            // Fired or torn down since it was queued
            if !self.graph.is_ready(entry.node) {
                continue;
            }
            if let Some(task) = self.task(entry.node.task) {
                last_work = Some((task.name.clone(), node_label(entry.node.kind)));
            }
            self.execute_node(entry.node, budget);
        }
    }

    fn drain_events(&mut self) {
        let mut events = std::mem::take(&mut self.pending_events);
        events.extend(self.event_rx.try_iter());
        for event in events {
            match event {
                SchedulerEvent::ReadComplete(completion) => self.on_read_complete(completion),
                SchedulerEvent::FinalizeDone(task_ref) => self.finish_task(task_ref),
            }
        }
    }

    fn drain_intake(&mut self) {
        let messages: Vec<IntakeMessage> = self.intake_rx.try_iter().collect();
        for message in messages {
            match message {
                IntakeMessage::Load {
                    request_id,
                    name,
                    source_file,
                    priority,
                    callback,
                } => self.on_load_request(request_id, name, source_file, priority, callback),
                IntakeMessage::SetPriority {
                    request_id,
                    priority,
                } => {
                    if let Some(&task_ref) = self.by_request.get(&request_id) {
                        self.bump_priority(task_ref, priority);
                    }
                }
                IntakeMessage::CancelAll => self.cancel_all(),
            }
        }
    }

    fn on_load_request(
        &mut self,
        request_id: RequestId,
        name: PackageName,
        source_file: Option<PathBuf>,
        priority: LoadPriority,
        callback: Box<dyn FnOnce(LoadResult) + Send>,
    ) {
        if self.known_missing.contains(&name) {
            self.known_missing_hits += 1;
            log::debug!("{}: known missing, failing without i/o", name);
            let path = source_file
                .unwrap_or_else(|| self.default_package_path(&name));
            let error = Arc::new(LoadError::FileNotFound {
                name: name.clone(),
                path,
            });
            self.finalize_tx
                .send(FinalizeItem {
                    task: None,
                    name,
                    objects: Vec::default(),
                    result: LoadResult::Failed(error),
                    callbacks: vec![(request_id, callback)],
                })
                .unwrap();
            return;
        }

        // A finished-but-retained package answers straight from its result
        if let Some(&existing) = self.by_name.get(&name) {
            if let Some(task) = self.task(existing) {
                if task.phase.is_terminal() {
                    let result = match task.phase {
                        TaskPhase::Complete => LoadResult::Succeeded(task.root_object()),
                        _ => match &task.error {
                            Some(error) => LoadResult::Failed(error.clone()),
                            None => LoadResult::Canceled,
                        },
                    };
                    self.finalize_tx
                        .send(FinalizeItem {
                            task: None,
                            name,
                            objects: Vec::default(),
                            result,
                            callbacks: vec![(request_id, callback)],
                        })
                        .unwrap();
                    return;
                }
            }
        }

        // New load, or merge into the in-flight one with the max priority
        if let Some(task_ref) = self.find_or_create_task(&name, source_file, priority) {
            if let Some(task) = self.task_mut(task_ref) {
                task.callbacks.push((request_id, callback));
            }
            self.by_request.insert(request_id, task_ref);
        }
    }

    fn default_package_path(
        &self,
        name: &PackageName,
    ) -> PathBuf {
        self.root_path.join(format!("{}.pak", name))
    }

    /// Returns the in-flight task for a package, creating one in the `New`
    /// phase if needed. None only for known-missing packages.
    fn find_or_create_task(
        &mut self,
        name: &PackageName,
        source_file: Option<PathBuf>,
        priority: LoadPriority,
    ) -> Option<TaskRef> {
        if self.known_missing.contains(name) {
            return None;
        }
        if let Some(&existing) = self.by_name.get(name) {
            if self.task(existing).is_some() {
                self.bump_priority(existing, priority);
                return Some(existing);
            }
        }

        let path = Arc::new(
            source_file.unwrap_or_else(|| self.default_package_path(name)),
        );
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize].generation += 1;
                index
            }
            None => {
                self.slots.push(TaskSlot {
                    generation: 1,
                    task: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let task_ref = TaskRef {
            index,
            generation: self.slots[index as usize].generation,
        };
        log::debug!("{}: starting load as task {:?}", name, task_ref);
        let task = PackageTask::new(task_ref, name.clone(), path, priority);
        self.slots[index as usize].task = Some(task);
        self.by_name.insert(name.clone(), task_ref);
        self.new_tasks.push(task_ref);
        self.active_task_count += 1;
        Some(task_ref)
    }

    /// Raises a task's priority and propagates the new maximum through its
    /// dependency packages, so nothing a high-priority load waits on is
    /// scheduled below it.
    fn bump_priority(
        &mut self,
        task_ref: TaskRef,
        priority: LoadPriority,
    ) {
        let mut stack = vec![task_ref];
        while let Some(current) = stack.pop() {
            let Some(task) = self.task_mut(current) else {
                continue;
            };
            let merged = task.priority.max(priority);
            if merged == task.priority {
                continue;
            }
            task.priority = merged;
            log::trace!("{}: priority raised to {:?}", task.name, priority);
            stack.extend(task.dependency_tasks.iter().copied());

            let requeue: Vec<NodeId> = self
                .graph
                .unfired_nodes_of(current)
                .into_iter()
                .filter(|&n| self.graph.is_ready(n))
                .collect();
            for node in requeue {
                self.push_ready(node);
            }
        }
    }

    fn push_ready(
        &mut self,
        node: NodeId,
    ) {
        let priority = self
            .task(node.task)
            .map(|t| t.priority)
            .unwrap_or(LoadPriority::NORMAL);
        self.ready_seq += 1;
        self.ready_queue.push(ReadyNode {
            priority,
            seq: self.ready_seq,
            node,
        });
    }

    /// Fires a node and queues everything it unblocked. Never called while a
    /// task is taken out of its slot, so queued nodes get real priorities.
    fn fire_and_queue(
        &mut self,
        node: NodeId,
    ) {
        let mut newly_ready = Vec::default();
        self.graph.fire(node, &mut newly_ready);
        for ready in newly_ready {
            self.push_ready(ready);
        }
    }

    fn send_read(
        &self,
        task_ref: TaskRef,
        path: Arc<PathBuf>,
        read: crate::precache::IssuedRead,
    ) {
        log::trace!(
            "{:?}: read [{}, +{}) from {:?}",
            task_ref,
            read.file_offset,
            read.len,
            path
        );
        self.io_pool.as_ref().unwrap().add_request(ReadRequest {
            task: task_ref,
            path,
            file_offset: read.file_offset,
            len: read.len,
        });
    }

    /// Issues the next queued read unless resident bytes still have
    /// unserialized consumers; a new completion would evict them.
    fn maybe_issue_next_read(
        &self,
        task: &mut PackageTask,
    ) {
        let consumers_pending = task
            .export_state
            .iter()
            .any(|s| s.io_ready && !s.serialized);
        if consumers_pending {
            return;
        }
        if let Some(read) = task.precache.take_next_read() {
            self.send_read(task.task_ref, task.path.clone(), read);
        }
    }

    //
    // New-task promotion and header parsing
    //

    fn promote_new_tasks(&mut self) {
        let new_tasks = std::mem::take(&mut self.new_tasks);
        for task_ref in new_tasks {
            let Some(mut task) = self.take_task(task_ref) else {
                continue;
            };
            if task.phase != TaskPhase::New {
                self.put_task(task);
                continue;
            }
            task.set_phase(TaskPhase::ReadingHeader);
            if let Some(read) = task.request_header_probe() {
                self.send_read(task_ref, task.path.clone(), read);
            }
            self.put_task(task);
        }
    }

    fn on_read_complete(
        &mut self,
        completion: ReadCompletion,
    ) {
        let Some(mut task) = self.take_task(completion.task) else {
            log::trace!("dropping read completion for stale task {:?}", completion.task);
            return;
        };

        let data = match completion.result {
            Ok(data) => data,
            Err(error) => {
                let load_error = if task.phase == TaskPhase::ReadingHeader
                    && error.kind() == std::io::ErrorKind::NotFound
                {
                    log::debug!("{}: package file missing, caching as known-missing", task.name);
                    self.known_missing.insert(task.name.clone());
                    LoadError::FileNotFound {
                        name: task.name.clone(),
                        path: (*task.path).clone(),
                    }
                } else {
                    LoadError::Io {
                        name: task.name.clone(),
                        source: error,
                    }
                };
                self.put_task(task);
                self.teardown_task(
                    completion.task,
                    LoadResult::Failed(Arc::new(load_error)),
                );
                return;
            }
        };

        let covered = task.precache.complete_read(
            completion.file_offset,
            completion.requested_len,
            data.data,
            data.file_size,
        );
        for symbol in &covered {
            if let Some(export_index) = symbol.export_index() {
                task.export_state[export_index].io_ready = true;
            }
        }

        if task.phase == TaskPhase::ReadingHeader {
            match task.try_parse_summary() {
                Err(error) => {
                    self.put_task(task);
                    self.teardown_task(completion.task, LoadResult::Failed(Arc::new(error)));
                }
                Ok(HeaderProgress::NeedBytes) => {
                    if let Some(read) = task.precache.take_next_read() {
                        self.send_read(completion.task, task.path.clone(), read);
                    }
                    self.put_task(task);
                }
                Ok(HeaderProgress::Parsed) => {
                    self.put_task(task);
                    self.on_summary_parsed(completion.task);
                }
            }
            return;
        }

        self.maybe_issue_next_read(&mut task);
        let start_io_nodes: Vec<NodeId> = covered
            .iter()
            .map(|&symbol| task.node(NodeKind::StartIo(symbol)))
            .collect();
        self.put_task(task);
        for node in start_io_nodes {
            self.fire_and_queue(node);
        }
    }

    /// Runs the phases between a parsed header and waiting on dependencies:
    /// pruning unresolvable imports, registering gate nodes, announcing our
    /// symbol table and kicking off dependency package loads.
    fn on_summary_parsed(
        &mut self,
        task_ref: TaskRef,
    ) {
        let (name, priority, dependency_names) = {
            let Some(task) = self.task_mut(task_ref) else {
                return;
            };
            task.set_phase(TaskPhase::ResolvingExternalReferences);
            (
                task.name.clone(),
                task.priority,
                task.dependency_package_names.clone(),
            )
        };

        let mut resolved_names = Vec::with_capacity(dependency_names.len());
        for dep_name in dependency_names {
            if self.known_missing.contains(&dep_name) {
                self.known_missing_hits += 1;
                log::warn!(
                    "{}: dependency package {} is known missing; its imports will not resolve",
                    name,
                    dep_name
                );
            } else {
                resolved_names.push(dep_name);
            }
        }

        let dependencies_ready;
        let post_process;
        {
            let Some(task) = self.task_mut(task_ref) else {
                return;
            };
            task.set_phase(TaskPhase::StartingDependencyPackages);
            dependencies_ready = task.node(NodeKind::DependenciesReady);
            post_process = task.node(NodeKind::PostProcessGate);
            let exports_serialized = task.node(NodeKind::ExportsSerialized);
            self.graph.add_node(dependencies_ready);
            self.graph.add_node(exports_serialized);
            self.graph.add_node(post_process);
            self.graph.add_edge(exports_serialized, post_process);
        }

        // Our export table is available; dependents may wire against it now.
        // This fires before we wait on anyone, which is what lets mutually
        // importing packages make progress.
        self.fire_and_queue(NodeId {
            task: task_ref,
            kind: NodeKind::SymbolsDeclared,
        });

        for dep_name in resolved_names {
            let Some(dep_ref) = self.find_or_create_task(&dep_name, None, priority) else {
                continue;
            };
            self.graph.add_edge(
                NodeId {
                    task: dep_ref,
                    kind: NodeKind::SymbolsDeclared,
                },
                dependencies_ready,
            );
            self.graph.add_edge(
                NodeId {
                    task: dep_ref,
                    kind: NodeKind::ExportsSerialized,
                },
                post_process,
            );
            if let Some(dep) = self.task_mut(dep_ref) {
                dep.dependent_ref_count += 1;
            }
            if let Some(task) = self.task_mut(task_ref) {
                task.dependency_tasks.push(dep_ref);
            }
        }

        if let Some(task) = self.task_mut(task_ref) {
            task.set_phase(TaskPhase::AwaitingDependencyPackages);
        }
        if self.graph.is_ready(dependencies_ready) {
            self.push_ready(dependencies_ready);
        }
    }

    //
    // Symbol declaration (budget-resumable)
    //

    fn resume_declaration(
        &mut self,
        task_ref: TaskRef,
        budget: &TickBudget,
    ) {
        let Some(mut task) = self.take_task(task_ref) else {
            return;
        };

        if task.phase == TaskPhase::DeclaringLocalSymbols {
            let export_count = task.summary.as_ref().map(|s| s.exports.len()).unwrap_or(0);
            let import_count = task.summary.as_ref().map(|s| s.imports.len()).unwrap_or(0);
            while task.declare_local_progress < export_count + import_count {
                if budget.is_exceeded() {
                    self.put_task(task);
                    self.declaring.push(task_ref);
                    return;
                }
                let cursor = task.declare_local_progress;
                if cursor < export_count {
                    task.declare_export_nodes(&mut self.graph, cursor);
                } else {
                    task.declare_import_nodes(&mut self.graph, cursor - export_count);
                }
                task.declare_local_progress += 1;
            }
            task.set_phase(TaskPhase::DeclaringExternalSymbols);
        }

        if task.phase == TaskPhase::DeclaringExternalSymbols {
            let import_count = task.summary.as_ref().map(|s| s.imports.len()).unwrap_or(0);
            while task.declare_external_progress < import_count {
                if budget.is_exceeded() {
                    self.put_task(task);
                    self.declaring.push(task_ref);
                    return;
                }
                let import_index = task.declare_external_progress;
                self.wire_import_edges(&mut task, import_index);
                task.declare_external_progress += 1;
            }
            task.set_phase(TaskPhase::CreatingAndSerializingSymbols);
        }

        self.put_task(task);

        // Everything unblocked at declaration time enters the queue in one
        // scan; everything else arrives through fire cascades.
        let ready: Vec<NodeId> = self
            .graph
            .unfired_nodes_of(task_ref)
            .into_iter()
            .filter(|&n| self.graph.is_ready(n))
            .collect();
        for node in ready {
            self.push_ready(node);
        }
    }

    /// Wires one import's sub-phases to the exporting task's nodes. The
    /// source task may not have declared its own symbols yet; edges create
    /// its nodes lazily and its declaration pass adopts them.
    fn wire_import_edges(
        &mut self,
        task: &mut PackageTask,
        import_index: usize,
    ) {
        let entry = task.summary.as_ref().unwrap().imports[import_index].clone();
        let source_name = PackageName::from(entry.source_package.as_str());
        let source_export = self
            .by_name
            .get(&source_name)
            .copied()
            .and_then(|source_ref| {
                let source = self.task(source_ref)?;
                let export_index = source.summary.as_ref()?.find_export(&entry.object_name)?;
                Some((source_ref, export_index))
            });

        let Some((source_ref, export_index)) = source_export else {
            log::warn!(
                "{}: import {} from {} has no exporter; it will degrade to null",
                task.name,
                entry.object_name,
                entry.source_package
            );
            return;
        };

        let import_symbol = SymbolIndex::from_import(import_index);
        let export_symbol = SymbolIndex::from_export(export_index);
        self.graph.add_edge(
            NodeId {
                task: source_ref,
                kind: NodeKind::Create(export_symbol),
            },
            task.node(NodeKind::Create(import_symbol)),
        );
        self.graph.add_edge(
            NodeId {
                task: source_ref,
                kind: NodeKind::Serialize(export_symbol),
            },
            task.node(NodeKind::Serialize(import_symbol)),
        );
    }

    //
    // Node execution
    //

    fn execute_node(
        &mut self,
        node: NodeId,
        budget: &TickBudget,
    ) {
        let Some(mut task) = self.take_task(node.task) else {
            return;
        };
        if task.phase == TaskPhase::Failed {
            self.put_task(task);
            return;
        }

        match node.kind {
            NodeKind::SymbolsDeclared => {
                // Fired directly from header parsing; nothing queues it.
                self.put_task(task);
            }
            NodeKind::DependenciesReady => {
                task.set_phase(TaskPhase::DeclaringLocalSymbols);
                self.put_task(task);
                self.fire_and_queue(node);
                self.resume_declaration(node.task, budget);
            }
            NodeKind::ExportsSerialized => {
                task.set_phase(TaskPhase::AwaitingDependentPostProcessing);
                self.put_task(task);
                self.fire_and_queue(node);
            }
            NodeKind::PostProcessGate => {
                self.put_task(task);
                self.fire_and_queue(node);
                self.begin_finalize(node.task);
            }
            NodeKind::Create(symbol) => {
                if let Some(export_index) = symbol.export_index() {
                    match self.run_create_export(&mut task, export_index) {
                        Ok(CreateOutcome::Created) => {
                            self.put_task(task);
                            self.fire_and_queue(node);
                        }
                        Ok(CreateOutcome::Deferred) => {
                            self.put_task(task);
                        }
                        Err(error) => {
                            self.put_task(task);
                            self.teardown_task(
                                node.task,
                                LoadResult::Failed(Arc::new(error)),
                            );
                        }
                    }
                } else if let Some(import_index) = symbol.import_index() {
                    self.run_create_import(&mut task, import_index);
                    self.put_task(task);
                    self.fire_and_queue(node);
                } else {
                    self.put_task(task);
                }
            }
            NodeKind::StartIo(symbol) => {
                let fire = symbol
                    .export_index()
                    .map(|e| self.run_start_io(&mut task, e))
                    .unwrap_or(true);
                self.put_task(task);
                if fire {
                    self.fire_and_queue(node);
                }
            }
            NodeKind::Serialize(symbol) => {
                if let Some(export_index) = symbol.export_index() {
                    match self.run_serialize_export(&mut task, export_index) {
                        Ok(()) => {
                            self.put_task(task);
                            self.fire_and_queue(node);
                        }
                        Err(error) => {
                            self.put_task(task);
                            self.teardown_task(
                                node.task,
                                LoadResult::Failed(Arc::new(error)),
                            );
                        }
                    }
                } else {
                    // Imports have no payload of their own; the node exists
                    // to mirror the exporter's progress into this task.
                    self.put_task(task);
                    self.fire_and_queue(node);
                }
            }
        }
    }

    fn run_create_export(
        &mut self,
        task: &mut PackageTask,
        export_index: usize,
    ) -> Result<CreateOutcome, LoadError> {
        profiling::scope!("create_export");
        let entry = task.summary.as_ref().unwrap().exports[export_index].clone();

        let class_ref = task.resolved_refs().resolve(entry.class_index);
        if !entry.class_index.is_null() && class_ref.is_null() {
            return Err(LoadError::SymbolResolutionFailed {
                name: task.name.clone(),
                symbol: symbol_display(task, entry.class_index),
            });
        }
        let super_ref = task.resolved_refs().resolve(entry.super_index);
        if !entry.super_index.is_null() && super_ref.is_null() {
            return Err(LoadError::SymbolResolutionFailed {
                name: task.name.clone(),
                symbol: symbol_display(task, entry.super_index),
            });
        }

        // A class mid-load cannot back instances yet; wait for its payload
        if !class_ref.is_null() && !self.factory.is_class_fully_formed(class_ref) {
            let class_serialize = task.node(NodeKind::Serialize(entry.class_index));
            let create = task.node(NodeKind::Create(SymbolIndex::from_export(export_index)));
            if !self.graph.is_fired(class_serialize) {
                log::trace!(
                    "{}: deferring create of {} until class {} is serialized",
                    task.name,
                    entry.object_name,
                    symbol_display(task, entry.class_index)
                );
                self.graph.add_edge(class_serialize, create);
                return Ok(CreateOutcome::Deferred);
            }
            log::warn!(
                "{}: class {} never finished forming; constructing {} anyway",
                task.name,
                symbol_display(task, entry.class_index),
                entry.object_name
            );
        }

        let class_name = symbol_object_name(task, entry.class_index);
        let object = match self.factory.find_existing_object(
            &class_name,
            task.name.as_str(),
            &entry.object_name,
        ) {
            Some(existing) => {
                log::trace!("{}: reusing resident object {}", task.name, entry.object_name);
                existing
            }
            None => {
                let desc = ObjectSpawnDesc {
                    name: self.factory.resolve_or_intern_name(&entry.object_name),
                    class: class_ref,
                    outer: task.resolved_refs().resolve(entry.outer_index),
                    template: task.resolved_refs().resolve(entry.template_index),
                };
                self.factory.allocate_object(&desc)
            }
        };
        self.factory.mark_reachable_while_loading(object);

        task.export_objects[export_index] = object;
        task.export_state[export_index].created = true;
        Ok(CreateOutcome::Created)
    }

    fn run_create_import(
        &mut self,
        task: &mut PackageTask,
        import_index: usize,
    ) {
        let entry = task.summary.as_ref().unwrap().imports[import_index].clone();
        let source_name = PackageName::from(entry.source_package.as_str());

        let mut resolved = self
            .by_name
            .get(&source_name)
            .copied()
            .and_then(|source_ref| {
                let source = self.task(source_ref)?;
                let export_index = source.summary.as_ref()?.find_export(&entry.object_name)?;
                let object = source.export_objects[export_index];
                if object.is_null() {
                    None
                } else {
                    Some(object)
                }
            });
        if resolved.is_none() {
            resolved = self.factory.find_existing_object(
                &entry.class_name,
                &entry.source_package,
                &entry.object_name,
            );
        }

        match resolved {
            Some(object) => task.import_objects[import_index] = object,
            None => {
                log::warn!(
                    "{}: import {} from {} did not resolve; degrading to null",
                    task.name,
                    entry.object_name,
                    entry.source_package
                );
            }
        }
        task.import_created[import_index] = true;
    }

    /// Returns true when the node should fire now (bytes already resident).
    /// Otherwise the read is queued and the completion fires the node.
    fn run_start_io(
        &mut self,
        task: &mut PackageTask,
        export_index: usize,
    ) -> bool {
        let state = &task.export_state[export_index];
        if state.io_ready {
            return true;
        }
        if state.io_requested {
            return false;
        }

        let range = task.payload_range(export_index);
        if task.precache.is_range_resident(range.file_offset, range.len) {
            task.export_state[export_index].io_ready = true;
            return true;
        }

        task.export_state[export_index].io_requested = true;
        task.precache.request_ranges(&[range]);
        self.maybe_issue_next_read(task);
        false
    }

    fn run_serialize_export(
        &mut self,
        task: &mut PackageTask,
        export_index: usize,
    ) -> Result<(), LoadError> {
        profiling::scope!("serialize_export");
        let entry = task.summary.as_ref().unwrap().exports[export_index].clone();
        let object = task.export_objects[export_index];

        if object.is_null() {
            log::warn!(
                "{}: skipping payload of degraded export {}",
                task.name,
                entry.object_name
            );
        } else {
            let Some(payload) =
                task.precache.resident_slice(entry.serial_offset, entry.serial_size)
            else {
                return Err(LoadError::PrecacheMiss {
                    name: task.name.clone(),
                    offset: entry.serial_offset,
                    len: entry.serial_size,
                });
            };
            let refs = task.resolved_refs();
            self.factory
                .deserialize_object(object, payload, &refs)
                .map_err(|source| LoadError::DeserializeFailed {
                    name: task.name.clone(),
                    object: entry.object_name.clone(),
                    source,
                })?;
            task.serialized_export_count += 1;
        }

        task.export_state[export_index].serialized = true;
        self.maybe_issue_next_read(task);
        Ok(())
    }

    //
    // Completion, failure, teardown
    //

    fn begin_finalize(
        &mut self,
        task_ref: TaskRef,
    ) {
        debug_assert_eq!(
            self.graph.unfired_count_of(task_ref),
            0,
            "task reached finalize with unfired nodes"
        );
        let Some(task) = self.task_mut(task_ref) else {
            return;
        };
        task.set_phase(TaskPhase::ReadyForFinalize);
        let objects: Vec<ObjectRef> = task
            .export_objects
            .iter()
            .copied()
            .filter(|o| !o.is_null())
            .collect();
        let callbacks = std::mem::take(&mut task.callbacks);
        let result = LoadResult::Succeeded(task.root_object());
        let name = task.name.clone();
        task.set_phase(TaskPhase::Finalizing);
        task.precache.flush();

        self.finalize_tx
            .send(FinalizeItem {
                task: Some(task_ref),
                name,
                objects,
                result,
                callbacks,
            })
            .unwrap();
    }

    /// Fails or cancels a task: unblocks everything waiting on it, releases
    /// its resident bytes and hands its objects and callbacks to the calling
    /// thread. Sibling tasks are unaffected.
    fn teardown_task(
        &mut self,
        task_ref: TaskRef,
        result: LoadResult,
    ) {
        let Some(mut task) = self.take_task(task_ref) else {
            return;
        };
        // Already handed to the calling thread; its outcome is settled
        if task.phase >= TaskPhase::ReadyForFinalize {
            self.put_task(task);
            return;
        }

        match &result {
            LoadResult::Failed(error) => {
                log::error!("{}: load failed: {}", task.name, error);
                task.error = Some(error.clone());
            }
            LoadResult::Canceled => {
                log::debug!("{}: load canceled", task.name);
            }
            LoadResult::Succeeded(_) => unreachable!("teardown with a success result"),
        }

        task.set_phase(TaskPhase::Failed);
        task.precache.flush();
        let name = task.name.clone();
        let objects: Vec<ObjectRef> = task
            .export_objects
            .iter()
            .copied()
            .filter(|o| !o.is_null())
            .collect();
        let callbacks = std::mem::take(&mut task.callbacks);
        self.put_task(task);

        // Dependents see every node as satisfied and degrade their imports
        for node in self.graph.unfired_nodes_of(task_ref) {
            self.fire_and_queue(node);
        }

        self.finalize_tx
            .send(FinalizeItem {
                task: Some(task_ref),
                name,
                objects,
                result,
                callbacks,
            })
            .unwrap();
    }

    /// The calling thread acknowledged finalize. The task becomes terminal,
    /// releases its holds on dependency packages and is destroyed once no
    /// dependent needs its symbol table.
    fn finish_task(
        &mut self,
        task_ref: TaskRef,
    ) {
        let (dependencies, late_item) = {
            let Some(task) = self.task_mut(task_ref) else {
                return;
            };
            if task.phase == TaskPhase::Finalizing {
                task.set_phase(TaskPhase::Complete);
            }
            let dependencies = std::mem::take(&mut task.dependency_tasks);

            // Requests that attached while finalize was in flight
            let late_item = if task.callbacks.is_empty() {
                None
            } else {
                let result = match task.phase {
                    TaskPhase::Complete => LoadResult::Succeeded(task.root_object()),
                    _ => match &task.error {
                        Some(error) => LoadResult::Failed(error.clone()),
                        None => LoadResult::Canceled,
                    },
                };
                Some(FinalizeItem {
                    task: None,
                    name: task.name.clone(),
                    objects: Vec::default(),
                    result,
                    callbacks: std::mem::take(&mut task.callbacks),
                })
            };
            (dependencies, late_item)
        };

        if let Some(item) = late_item {
            self.finalize_tx.send(item).unwrap();
        }

        debug_assert!(self.active_task_count > 0);
        self.active_task_count -= 1;

        for dependency in dependencies {
            if let Some(dep) = self.task_mut(dependency) {
                debug_assert!(dep.dependent_ref_count > 0);
                dep.dependent_ref_count -= 1;
            }
            self.maybe_destroy(dependency);
        }
        self.maybe_destroy(task_ref);
    }

    fn maybe_destroy(
        &mut self,
        task_ref: TaskRef,
    ) {
        let Some(task) = self.task(task_ref) else {
            return;
        };
        if !task.phase.is_terminal()
            || task.dependent_ref_count > 0
            || !task.callbacks.is_empty()
        {
            return;
        }
        let name = task.name.clone();
        log::trace!("{}: destroying task {:?}", name, task_ref);

        self.graph.remove_all_nodes_of(task_ref);
        if self.by_name.get(&name) == Some(&task_ref) {
            self.by_name.remove(&name);
        }
        let slot = &mut self.slots[task_ref.index as usize];
        slot.task = None;
        self.free_slots.push(task_ref.index);
    }

    /// Fails every task that can no longer run. Called by flush when live
    /// tasks remain but nothing is ready and no I/O is outstanding, so the
    /// remaining work will never be scheduled; failing the tasks keeps the
    /// once-per-request callback guarantee. Returns the number failed.
    pub fn fail_stalled_tasks(&mut self) -> usize {
        let stuck: Vec<(TaskRef, PackageName)> = self
            .slots
            .iter()
            .filter_map(|slot| slot.task.as_ref())
            .filter(|task| task.phase < TaskPhase::ReadyForFinalize)
            .map(|task| (task.task_ref, task.name.clone()))
            .collect();
        let count = stuck.len();
        for (task_ref, name) in stuck {
            self.teardown_task(
                task_ref,
                LoadResult::Failed(Arc::new(LoadError::Stalled { name })),
            );
        }
        count
    }

    fn cancel_all(&mut self) {
        log::debug!("canceling all in-flight loads");
        let live: Vec<TaskRef> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.task.as_ref().map(|task| {
                    debug_assert_eq!(task.task_ref.index as usize, index);
                    task.task_ref
                })
            })
            .filter(|&t| {
                self.task(t)
                    .map(|task| !task.phase.is_terminal())
                    .unwrap_or(false)
            })
            .collect();
        for task_ref in live {
            self.teardown_task(task_ref, LoadResult::Canceled);
        }
    }
}

enum CreateOutcome {
    Created,
    Deferred,
}

fn node_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::SymbolsDeclared => "symbols-declared",
        NodeKind::DependenciesReady => "dependencies-ready",
        NodeKind::ExportsSerialized => "exports-serialized",
        NodeKind::PostProcessGate => "post-process",
        NodeKind::Create(_) => "create",
        NodeKind::StartIo(_) => "start-io",
        NodeKind::Serialize(_) => "serialize",
    }
}

/// `package.Object (export 3)` style rendering for log and error text.
fn symbol_display(
    task: &PackageTask,
    index: SymbolIndex,
) -> String {
    format!("{} ({:?})", symbol_object_name(task, index), index)
}

fn symbol_object_name(
    task: &PackageTask,
    index: SymbolIndex,
) -> String {
    let Some(summary) = task.summary.as_ref() else {
        return String::default();
    };
    if let Some(e) = index.export_index() {
        summary
            .exports
            .get(e)
            .map(|entry| entry.object_name.clone())
            .unwrap_or_default()
    } else if let Some(i) = index.import_index() {
        summary
            .imports
            .get(i)
            .map(|entry| entry.object_name.clone())
            .unwrap_or_default()
    } else {
        String::default()
    }
}
