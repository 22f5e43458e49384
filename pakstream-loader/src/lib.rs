//! Asynchronous package loading.
//!
//! A package is a file of serialized objects plus the references between
//! them. Loading one means reading its header, loading the packages it
//! imports from, constructing every object, streaming payload bytes through
//! a chunked read cache and deserializing each object once its dependencies
//! are ready. All of that is expressed as nodes in a shared dependency graph
//! and driven by [`LoadScheduler::tick`]; the embedding engine supplies the
//! object system through the [`ObjectFactory`] and [`ObjectFinalizer`]
//! traits and pumps [`PackageLoadManager::update`] from its main loop.

mod dep_graph;
mod disk_io;
mod error;
mod object_model;
mod package_file;
mod package_task;
mod precache;
mod scheduler;

pub use dep_graph::{DependencyGraph, NodeId, NodeKind, TaskRef};
pub use error::{LoadError, LoadResult};
pub use object_model::{
    NameHandle, ObjectFactory, ObjectFinalizer, ObjectRef, ObjectSpawnDesc, ResolvedReferences,
};
pub use package_file::{
    ExportEntry, ImportEntry, PackageSummary, SummaryError, PACKAGE_FILE_TAG,
    PACKAGE_FILE_VERSION,
};
pub use package_task::TaskPhase;
pub use scheduler::{FinalizeItem, IntakeMessage, LoadScheduler, SchedulerEvent, TickBudget};

use crossbeam_channel::{Receiver, Sender};
use pakstream_base::hashing::HashSet;
use pakstream_base::{LoadPriority, PackageName, RequestId};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_IO_THREAD_COUNT: usize = 4;

/// Calling-thread entry point for package loading.
///
/// Owns the scheduler and the finalizer. `update` ticks the scheduler and
/// then drains finished packages: post-deserialize fixup, loader-flag
/// clearing and completion callbacks all run on the thread calling `update`
/// (or `flush`), never on a worker.
pub struct PackageLoadManager {
    scheduler: LoadScheduler,
    finalizer: Box<dyn ObjectFinalizer>,
    intake_tx: Sender<IntakeMessage>,
    finalize_rx: Receiver<FinalizeItem>,
    finalize_done_tx: Sender<SchedulerEvent>,
    next_request_id: u64,
    in_flight: HashSet<RequestId>,
}

impl PackageLoadManager {
    pub fn new(
        factory: Box<dyn ObjectFactory>,
        finalizer: Box<dyn ObjectFinalizer>,
        package_root: PathBuf,
    ) -> Self {
        Self::with_io_threads(factory, finalizer, package_root, DEFAULT_IO_THREAD_COUNT)
    }

    pub fn with_io_threads(
        factory: Box<dyn ObjectFactory>,
        finalizer: Box<dyn ObjectFinalizer>,
        package_root: PathBuf,
        io_thread_count: usize,
    ) -> Self {
        let (scheduler, intake_tx, finalize_rx) =
            LoadScheduler::new(factory, package_root, io_thread_count);
        let finalize_done_tx = scheduler.event_sender();
        PackageLoadManager {
            scheduler,
            finalizer,
            intake_tx,
            finalize_rx,
            finalize_done_tx,
            next_request_id: 0,
            in_flight: HashSet::default(),
        }
    }

    /// Begins loading a package by logical name. The callback runs exactly
    /// once, on the thread that pumps `update`/`flush`, with the result.
    ///
    /// A request for a package already in flight merges with it: both
    /// callbacks run on completion and the load adopts the higher priority.
    pub fn load_async(
        &mut self,
        name: &str,
        source_file: Option<PathBuf>,
        priority: LoadPriority,
        on_complete: impl FnOnce(LoadResult) + Send + 'static,
    ) -> RequestId {
        self.next_request_id += 1;
        let request_id = RequestId(self.next_request_id);
        self.in_flight.insert(request_id);
        self.intake_tx
            .send(IntakeMessage::Load {
                request_id,
                name: PackageName::from(name),
                source_file,
                priority,
                callback: Box::new(on_complete),
            })
            .unwrap();
        request_id
    }

    /// Raises the priority of an in-flight request. The new priority
    /// propagates through every package the request's package depends on.
    pub fn set_priority(
        &mut self,
        request_id: RequestId,
        priority: LoadPriority,
    ) {
        self.intake_tx
            .send(IntakeMessage::SetPriority {
                request_id,
                priority,
            })
            .unwrap();
    }

    /// One pump of the loader: ticks the scheduler under `budget`, then runs
    /// finalize work and completion callbacks for everything that finished.
    pub fn update(
        &mut self,
        budget: &TickBudget,
    ) {
        self.scheduler.tick(budget);
        self.drain_finalize();
    }

    /// Blocks until one request has completed (its callback has run). If the
    /// loader stalls with no runnable work, the stuck packages are failed so
    /// every callback still runs; returns false only when no progress could
    /// be made at all.
    pub fn flush(
        &mut self,
        request_id: RequestId,
    ) -> bool {
        self.pump_until(|manager| !manager.in_flight.contains(&request_id))
    }

    /// Blocks until every request and every dependency load has completed.
    pub fn flush_all(&mut self) -> bool {
        self.pump_until(|manager| {
            manager.in_flight.is_empty() && manager.scheduler.active_load_count() == 0
        })
    }

    /// Cancels every in-flight load. Callbacks still run, with `Canceled`.
    pub fn cancel_all(&mut self) {
        self.intake_tx.send(IntakeMessage::CancelAll).unwrap();
        self.pump_until(|manager| {
            manager.in_flight.is_empty() && manager.scheduler.active_load_count() == 0
        });
    }

    /// Serialized exports over total exports for an in-flight or retained
    /// package, as a percentage. None when the package is not being loaded.
    pub fn load_percentage(
        &self,
        name: &str,
    ) -> Option<f32> {
        self.scheduler.load_percentage(&PackageName::from(name))
    }

    pub fn is_loading(&self) -> bool {
        !self.in_flight.is_empty() || self.scheduler.active_load_count() > 0
    }

    /// Packages currently in flight, including dependency loads that were
    /// never requested directly.
    pub fn active_load_count(&self) -> usize {
        self.scheduler.active_load_count()
    }

    /// Requests that were answered from the known-missing cache without
    /// touching disk.
    pub fn known_missing_hits(&self) -> u64 {
        self.scheduler.known_missing_hits()
    }

    fn pump_until(
        &mut self,
        is_done: impl Fn(&PackageLoadManager) -> bool,
    ) -> bool {
        loop {
            if is_done(self) {
                return true;
            }
            self.update(&TickBudget::unlimited());
            if is_done(self) {
                return true;
            }
            if self.scheduler.has_ready_work() || !self.finalize_rx.is_empty() {
                continue;
            }
            if self.scheduler.io_outstanding() {
                self.scheduler.wait_for_event(Duration::from_millis(10));
                continue;
            }
            log::error!("flush stalled with no runnable work");
            self.scheduler.dump_cycles();
            if self.scheduler.fail_stalled_tasks() == 0 {
                return false;
            }
        }
    }

    fn drain_finalize(&mut self) {
        while let Ok(item) = self.finalize_rx.try_recv() {
            profiling::scope!("finalize_package");
            log::debug!("{}: finalizing ({} objects)", item.name, item.objects.len());
            match &item.result {
                LoadResult::Succeeded(_) => {
                    for &object in &item.objects {
                        self.finalizer.post_deserialize_fixup(object);
                    }
                    for &object in &item.objects {
                        self.finalizer.clear_loader_flags(object);
                    }
                }
                LoadResult::Failed(_) | LoadResult::Canceled => {
                    for &object in &item.objects {
                        self.finalizer.mark_load_failed(object);
                    }
                }
            }
            for (request_id, callback) in item.callbacks {
                self.in_flight.remove(&request_id);
                callback(item.result.clone());
            }
            if let Some(task_ref) = item.task {
                self.finalize_done_tx
                    .send(SchedulerEvent::FinalizeDone(task_ref))
                    .unwrap();
            }
        }
    }
}
