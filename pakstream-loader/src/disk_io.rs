use crate::dep_graph::TaskRef;
use crate::scheduler::SchedulerEvent;
use crossbeam_channel::{Receiver, Sender};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One ranged read against a package file. `len` may extend past the end of
/// the file; the worker clamps to the real size and reports it back.
pub struct ReadRequest {
    pub task: TaskRef,
    pub path: Arc<PathBuf>,
    pub file_offset: u64,
    pub len: u64,
}

#[derive(Debug)]
pub struct ReadData {
    pub data: Vec<u8>,
    pub file_size: u64,
}

/// Delivered to the scheduler exactly once per request, success or failure.
pub struct ReadCompletion {
    pub task: TaskRef,
    pub file_offset: u64,
    pub requested_len: u64,
    pub result: std::io::Result<ReadData>,
}

// Thread that takes jobs out of the request channel and ends when the finish
// channel is signalled
struct DiskIoWorkerThread {
    finish_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

impl DiskIoWorkerThread {
    fn new(
        request_rx: Receiver<ReadRequest>,
        result_tx: Sender<SchedulerEvent>,
        active_request_count: Arc<AtomicUsize>,
        thread_index: usize,
    ) -> Self {
        let (finish_tx, finish_rx) = crossbeam_channel::bounded(1);
        let join_handle = std::thread::Builder::new()
            .name("Package IO Thread".into())
            .spawn(move || {
                profiling::register_thread!(&format!("DiskIoWorkerThread {}", thread_index));
                loop {
                    crossbeam_channel::select! {
                        recv(request_rx) -> msg => {
                            match msg {
                                Ok(request) => {
                                    profiling::scope!("ReadRequest");
                                    log::trace!(
                                        "Start read {:?} [{}, +{})",
                                        request.path,
                                        request.file_offset,
                                        request.len
                                    );
                                    let result = do_read(&request);
                                    result_tx.send(SchedulerEvent::ReadComplete(ReadCompletion {
                                        task: request.task,
                                        file_offset: request.file_offset,
                                        requested_len: request.len,
                                        result,
                                    })).unwrap();
                                    active_request_count.fetch_sub(1, Ordering::Release);
                                },
                                // Pool dropped the sender, nothing left to do
                                Err(_) => return,
                            }
                        },
                        recv(finish_rx) -> _msg => {
                            return;
                        }
                    }
                }
            })
            .unwrap();

        DiskIoWorkerThread {
            finish_tx,
            join_handle,
        }
    }
}

fn do_read(request: &ReadRequest) -> std::io::Result<ReadData> {
    let mut file = std::fs::File::open(&*request.path)?;
    let file_size = file.metadata()?.len();

    let start = request.file_offset.min(file_size);
    let end = request
        .file_offset
        .saturating_add(request.len)
        .min(file_size);
    file.seek(SeekFrom::Start(start))?;

    let mut data = vec![0u8; (end - start) as usize];
    {
        profiling::scope!("std::fs::File::read_exact");
        file.read_exact(&mut data)?;
    }

    Ok(ReadData { data, file_size })
}

/// Spawns N worker threads serving ranged reads, proxies requests to them,
/// and joins the threads when `finish` is called.
pub struct DiskIoThreadPool {
    worker_threads: Vec<DiskIoWorkerThread>,
    request_tx: Sender<ReadRequest>,
    active_request_count: Arc<AtomicUsize>,
}

impl DiskIoThreadPool {
    pub fn new(
        max_requests_in_flight: usize,
        result_tx: Sender<SchedulerEvent>,
    ) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ReadRequest>();
        let active_request_count = Arc::new(AtomicUsize::new(0));

        let mut worker_threads = Vec::with_capacity(max_requests_in_flight);
        for thread_index in 0..max_requests_in_flight {
            let worker = DiskIoWorkerThread::new(
                request_rx.clone(),
                result_tx.clone(),
                active_request_count.clone(),
                thread_index,
            );
            worker_threads.push(worker);
        }

        DiskIoThreadPool {
            request_tx,
            worker_threads,
            active_request_count,
        }
    }

    pub fn add_request(
        &self,
        request: ReadRequest,
    ) {
        self.active_request_count.fetch_add(1, Ordering::Release);
        self.request_tx.send(request).unwrap();
    }

    /// Reads queued but not yet delivered to the scheduler.
    pub fn active_request_count(&self) -> usize {
        self.active_request_count.load(Ordering::Acquire)
    }

    /// Must be called while the scheduler's event receiver is still alive so
    /// in-flight completions have somewhere to land.
    pub fn finish(self) {
        for worker_thread in &self.worker_threads {
            worker_thread.finish_tx.send(()).unwrap();
        }

        for worker_thread in self.worker_threads {
            worker_thread.join_handle.join().unwrap();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn make_task() -> TaskRef {
        TaskRef {
            index: 0,
            generation: 1,
        }
    }

    #[test]
    fn read_clamps_to_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[7u8; 100])
            .unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = DiskIoThreadPool::new(2, tx);
        pool.add_request(ReadRequest {
            task: make_task(),
            path: Arc::new(path),
            file_offset: 64,
            len: 1024,
        });

        let event = rx.recv().unwrap();
        let SchedulerEvent::ReadComplete(completion) = event else {
            panic!("expected a read completion");
        };
        let read = completion.result.unwrap();
        assert_eq!(read.file_size, 100);
        assert_eq!(read.data.len(), 36);
        assert!(read.data.iter().all(|&b| b == 7));
        pool.finish();
    }

    #[test]
    fn missing_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = DiskIoThreadPool::new(1, tx);
        pool.add_request(ReadRequest {
            task: make_task(),
            path: Arc::new(dir.path().join("does_not_exist.bin")),
            file_offset: 0,
            len: 16,
        });

        let SchedulerEvent::ReadComplete(completion) = rx.recv().unwrap() else {
            panic!("expected a read completion");
        };
        assert_eq!(
            completion.result.unwrap_err().kind(),
            std::io::ErrorKind::NotFound
        );
        pool.finish();
    }
}
