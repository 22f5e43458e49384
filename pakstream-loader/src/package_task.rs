use crate::dep_graph::{DependencyGraph, NodeId, NodeKind, TaskRef};
use crate::error::{LoadError, LoadResult};
use crate::object_model::{ObjectRef, ResolvedReferences};
use crate::package_file::{PackageSummary, SummaryError};
use crate::precache::{IssuedRead, PrecacheCache, SymbolRange, MIN_READ_SIZE};
use pakstream_base::{LoadPriority, PackageName, RequestId, SymbolIndex};
use std::path::PathBuf;
use std::sync::Arc;

/// Lifecycle of one package load. Strictly ordered except `Failed`, which is
/// reachable from any non-terminal phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPhase {
    New,
    ReadingHeader,
    ResolvingExternalReferences,
    StartingDependencyPackages,
    AwaitingDependencyPackages,
    DeclaringLocalSymbols,
    DeclaringExternalSymbols,
    CreatingAndSerializingSymbols,
    AwaitingDependentPostProcessing,
    ReadyForFinalize,
    Finalizing,
    Complete,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        self == TaskPhase::Complete || self == TaskPhase::Failed
    }
}

/// Progress flags for one export symbol. Sub-phases always advance in
/// Create, StartIo, Serialize order.
#[derive(Default, Clone)]
pub struct SymbolState {
    pub created: bool,
    pub io_requested: bool,
    pub io_ready: bool,
    pub serialized: bool,
}

pub enum HeaderProgress {
    /// Summary length prefix seen but the full summary is not resident yet;
    /// a follow-up read was queued.
    NeedBytes,
    Parsed,
}

/// State of one in-flight package. Owned by the scheduler's registry slot;
/// everything that needs a second task (cross-package edges, import
/// resolution) lives in the scheduler, everything self-contained lives here.
pub struct PackageTask {
    pub task_ref: TaskRef,
    pub name: PackageName,
    pub path: Arc<PathBuf>,
    pub priority: LoadPriority,
    pub phase: TaskPhase,
    pub callbacks: Vec<(RequestId, Box<dyn FnOnce(LoadResult) + Send>)>,

    pub precache: PrecacheCache,
    pub summary: Option<PackageSummary>,

    /// Resolved object slots, parallel to the summary's tables. Null until
    /// the symbol's Create fires, and null forever for degraded symbols.
    pub export_objects: Vec<ObjectRef>,
    pub import_objects: Vec<ObjectRef>,
    pub export_state: Vec<SymbolState>,
    pub import_created: Vec<bool>,
    pub serialized_export_count: usize,

    /// Distinct packages named by the import table, in first-seen order.
    pub dependency_package_names: Vec<PackageName>,
    pub dependency_tasks: Vec<TaskRef>,
    /// Tasks that imported from this one and have not completed yet. A
    /// finished task is retained while this is non-zero because dependents
    /// still resolve through its symbol table.
    pub dependent_ref_count: u32,

    /// Loop cursors so a budget-interrupted phase resumes where it left off.
    pub declare_local_progress: usize,
    pub declare_external_progress: usize,

    pub error: Option<Arc<LoadError>>,
}

impl PackageTask {
    pub fn new(
        task_ref: TaskRef,
        name: PackageName,
        path: Arc<PathBuf>,
        priority: LoadPriority,
    ) -> Self {
        PackageTask {
            task_ref,
            name,
            path,
            priority,
            phase: TaskPhase::New,
            callbacks: Vec::default(),
            precache: PrecacheCache::default(),
            summary: None,
            export_objects: Vec::default(),
            import_objects: Vec::default(),
            export_state: Vec::default(),
            import_created: Vec::default(),
            serialized_export_count: 0,
            dependency_package_names: Vec::default(),
            dependency_tasks: Vec::default(),
            dependent_ref_count: 0,
            declare_local_progress: 0,
            declare_external_progress: 0,
            error: None,
        }
    }

    pub fn node(
        &self,
        kind: NodeKind,
    ) -> NodeId {
        NodeId {
            task: self.task_ref,
            kind,
        }
    }

    pub fn set_phase(
        &mut self,
        phase: TaskPhase,
    ) {
        log::trace!("{} {:?} -> {:?}", self.name, self.phase, phase);
        self.phase = phase;
    }

    /// Queues the fixed-size probe read at the start of the file. Returns the
    /// read to hand to the I/O pool.
    pub fn request_header_probe(&mut self) -> Option<IssuedRead> {
        self.precache.request_ranges(&[SymbolRange {
            symbol: SymbolIndex::null(),
            file_offset: 0,
            len: MIN_READ_SIZE,
        }]);
        self.precache.take_next_read()
    }

    /// Attempts to decode the summary from resident bytes. Headers larger
    /// than the probe queue a follow-up read and report `NeedBytes`.
    pub fn try_parse_summary(&mut self) -> Result<HeaderProgress, LoadError> {
        let file_size = match self.precache.file_size() {
            Some(size) => size,
            None => return Ok(HeaderProgress::NeedBytes),
        };

        let prefix = match self.precache.resident_slice(0, 8) {
            Some(prefix) => prefix,
            None => {
                return Err(LoadError::MalformedHeader {
                    name: self.name.clone(),
                    reason: format!("file is only {} bytes", file_size),
                });
            }
        };
        let required =
            PackageSummary::required_len_from_prefix(prefix).map_err(|e| self.header_error(e))?;

        if self.precache.resident_slice(0, required).is_none() {
            if required > file_size {
                return Err(self.header_error(SummaryError::HeaderExceedsFile {
                    header_len: required,
                    file_size,
                }));
            }
            self.precache.request_ranges(&[SymbolRange {
                symbol: SymbolIndex::null(),
                file_offset: 0,
                len: required,
            }]);
            return Ok(HeaderProgress::NeedBytes);
        }

        let buffer = self.precache.resident_slice(0, required).unwrap();
        let summary =
            PackageSummary::parse(buffer, file_size).map_err(|e| self.header_error(e))?;

        // A package refers to its own objects by export index, never through
        // the import table.
        for import in &summary.imports {
            if import.source_package == self.name.as_str() {
                return Err(LoadError::MalformedHeader {
                    name: self.name.clone(),
                    reason: format!(
                        "import {} references the declaring package",
                        import.object_name
                    ),
                });
            }
        }

        self.export_objects = vec![ObjectRef::null(); summary.exports.len()];
        self.import_objects = vec![ObjectRef::null(); summary.imports.len()];
        self.export_state = vec![SymbolState::default(); summary.exports.len()];
        self.import_created = vec![false; summary.imports.len()];

        // Distinct dependency packages, preserving import order
        for import in &summary.imports {
            let package = PackageName::from(import.source_package.as_str());
            if !self.dependency_package_names.contains(&package) {
                self.dependency_package_names.push(package);
            }
        }

        log::debug!(
            "{}: parsed summary, {} exports, {} imports, {} dependency packages",
            self.name,
            summary.exports.len(),
            summary.imports.len(),
            self.dependency_package_names.len()
        );
        self.summary = Some(summary);
        Ok(HeaderProgress::Parsed)
    }

    fn header_error(
        &self,
        error: SummaryError,
    ) -> LoadError {
        LoadError::MalformedHeader {
            name: self.name.clone(),
            reason: error.to_string(),
        }
    }

    /// Declares the sub-phase nodes and intra-package edges for one export.
    pub fn declare_export_nodes(
        &self,
        graph: &mut DependencyGraph,
        export_index: usize,
    ) {
        let summary = self.summary.as_ref().unwrap();
        let symbol = SymbolIndex::from_export(export_index);
        let create = self.node(NodeKind::Create(symbol));
        let start_io = self.node(NodeKind::StartIo(symbol));
        let serialize = self.node(NodeKind::Serialize(symbol));

        graph.add_node(create);
        graph.add_edge(create, start_io);
        graph.add_edge(start_io, serialize);
        graph.add_edge(serialize, self.node(NodeKind::ExportsSerialized));

        // Objects named in the declaration must exist before this one is
        // constructed.
        let entry = &summary.exports[export_index];
        for dep in [
            entry.class_index,
            entry.super_index,
            entry.outer_index,
            entry.template_index,
        ] {
            if !dep.is_null() {
                graph.add_edge(self.node(NodeKind::Create(dep)), create);
            }
        }

        for &dep in &summary.serialize_before[export_index] {
            graph.add_edge(self.node(NodeKind::Serialize(dep)), serialize);
        }
    }

    /// Declares the sub-phase nodes for one import. Cross-package edges onto
    /// these are wired later, once the source task is known.
    pub fn declare_import_nodes(
        &self,
        graph: &mut DependencyGraph,
        import_index: usize,
    ) {
        let symbol = SymbolIndex::from_import(import_index);
        let create = self.node(NodeKind::Create(symbol));
        let serialize = self.node(NodeKind::Serialize(symbol));
        graph.add_node(create);
        graph.add_edge(create, serialize);
        // Every owned node must fire before the task may finalize, including
        // imports no export depends on.
        graph.add_edge(serialize, self.node(NodeKind::PostProcessGate));
    }

    pub fn payload_range(
        &self,
        export_index: usize,
    ) -> SymbolRange {
        let entry = &self.summary.as_ref().unwrap().exports[export_index];
        SymbolRange {
            symbol: SymbolIndex::from_export(export_index),
            file_offset: entry.serial_offset,
            len: entry.serial_size,
        }
    }

    pub fn resolved_refs(&self) -> ResolvedReferences<'_> {
        ResolvedReferences::new(&self.export_objects, &self.import_objects)
    }

    /// Serialized exports over total exports, the flush/progress metric.
    pub fn load_fraction(&self) -> f32 {
        match self.phase {
            TaskPhase::Complete => 1.0,
            _ => match &self.summary {
                Some(summary) if !summary.exports.is_empty() => {
                    self.serialized_export_count as f32 / summary.exports.len() as f32
                }
                _ => 0.0,
            },
        }
    }

    /// The object handed to completion callbacks: the first export is the
    /// package root by convention.
    pub fn root_object(&self) -> ObjectRef {
        self.export_objects
            .first()
            .copied()
            .unwrap_or_else(ObjectRef::null)
    }
}
