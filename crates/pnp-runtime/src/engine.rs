//! Execution engines: an inline reference engine and a worker pool that
//! ships every task and result through the wire codec.

use crate::wire::{self, ReplyPayload, TaskPayload, ValuePayload, WireError};
use crate::{EngineError, Job, RuntimeConfig, Value};
use pnp_ndarray::ErrorKind;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Opaque handle to a result held by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteValue {
    id: u64,
}

impl RemoteValue {
    #[must_use]
    pub fn id(self) -> u64 {
        self.id
    }
}

pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Runs `job` on `args` and blocks until a result handle is available.
    /// A failing job surfaces as `Err` here, never as a poisoned handle.
    fn submit(&self, job: Arc<dyn Job>, args: &[Value]) -> Result<RemoteValue, EngineError>;

    /// Hands back the results behind `handles` and releases them; a handle
    /// is good for one download. Nothing is released when any handle is
    /// unknown.
    fn download_all(&self, handles: &[RemoteValue]) -> Result<Vec<Value>, EngineError>;

    /// Results submitted but not yet downloaded.
    fn pending(&self) -> usize;

    fn download(&self, handle: RemoteValue) -> Result<Value, EngineError> {
        self.download_all(&[handle])?
            .pop()
            .ok_or(EngineError::UnknownHandle(handle.id))
    }
}

fn lock_failed(what: &str) -> EngineError {
    EngineError::Transport(format!("{what} lock poisoned"))
}

fn take_results<T>(
    results: &mut HashMap<u64, T>,
    handles: &[RemoteValue],
) -> Result<Vec<T>, EngineError> {
    if let Some(missing) = handles.iter().find(|h| !results.contains_key(&h.id)) {
        return Err(EngineError::UnknownHandle(missing.id));
    }
    handles
        .iter()
        .map(|handle| {
            results
                .remove(&handle.id)
                .ok_or(EngineError::UnknownHandle(handle.id))
        })
        .collect()
}

/// Runs jobs on the calling thread and keeps results as plain values.
#[derive(Debug, Default)]
pub struct LocalEngine {
    next_id: AtomicU64,
    results: Mutex<HashMap<u64, Value>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, job: Arc<dyn Job>, args: &[Value]) -> Result<RemoteValue, EngineError> {
        let value = job.run(args)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.results
            .lock()
            .map_err(|_| lock_failed("local result store"))?
            .insert(id, value);
        Ok(RemoteValue { id })
    }

    fn download_all(&self, handles: &[RemoteValue]) -> Result<Vec<Value>, EngineError> {
        let mut results = self
            .results
            .lock()
            .map_err(|_| lock_failed("local result store"))?;
        take_results(&mut results, handles)
    }

    fn pending(&self) -> usize {
        self.results.lock().map_or(0, |results| results.len())
    }
}

struct Task {
    job: Arc<dyn Job>,
    frame: Vec<u8>,
    reply: Sender<Vec<u8>>,
}

/// Fixed set of worker threads fed from one shared queue.
///
/// Arguments are encoded before they leave the caller and results stay
/// encoded until [`ExecutionEngine::download_all`] decodes them, so every
/// evaluation crosses a real serialization boundary.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
    results: Mutex<HashMap<u64, ValuePayload>>,
    verify_digests: bool,
}

impl WorkerPool {
    pub fn new(workers: usize, verify_digests: bool) -> Result<Self, EngineError> {
        if workers == 0 {
            return Err(EngineError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("pnp-worker-{idx}"))
                .spawn(move || worker_loop(&receiver, verify_digests))
                .map_err(|err| EngineError::Config(format!("failed spawning worker {idx}: {err}")))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            workers: handles,
            next_id: AtomicU64::new(0),
            results: Mutex::new(HashMap::new()),
            verify_digests,
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self, EngineError> {
        Self::new(config.workers, config.verifies_digests())
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("verify_digests", &self.verify_digests)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine for WorkerPool {
    fn name(&self) -> &str {
        "worker_pool"
    }

    fn submit(&self, job: Arc<dyn Job>, args: &[Value]) -> Result<RemoteValue, EngineError> {
        let task = TaskPayload {
            job: job.name().to_string(),
            args: args.iter().map(wire::encode_value).collect(),
        };
        let frame = wire::encode_frame(&task)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| EngineError::Transport("worker pool is shut down".to_string()))?;
        sender
            .send(Task {
                job,
                frame,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::Transport("task queue closed".to_string()))?;
        let bytes = reply_rx
            .recv()
            .map_err(|_| EngineError::Transport("worker dropped the reply channel".to_string()))?;

        match wire::decode_frame::<ReplyPayload>(&bytes)? {
            ReplyPayload::Ok { value } => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                self.results
                    .lock()
                    .map_err(|_| lock_failed("worker result store"))?
                    .insert(id, value);
                Ok(RemoteValue { id })
            }
            ReplyPayload::Err { error } => Err(EngineError::Remote(error)),
        }
    }

    fn download_all(&self, handles: &[RemoteValue]) -> Result<Vec<Value>, EngineError> {
        let payloads = {
            let mut results = self
                .results
                .lock()
                .map_err(|_| lock_failed("worker result store"))?;
            take_results(&mut results, handles)?
        };
        payloads
            .iter()
            .map(|payload| {
                wire::decode_value(payload, self.verify_digests).map_err(EngineError::from)
            })
            .collect()
    }

    fn pending(&self) -> usize {
        self.results.lock().map_or(0, |results| results.len())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>, verify_digests: bool) {
    loop {
        let next = match receiver.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        let Ok(task) = next else {
            return;
        };
        let reply = match execute(&task, verify_digests) {
            Ok(value) => ReplyPayload::Ok {
                value: wire::encode_value(&value),
            },
            Err(err) => ReplyPayload::Err {
                error: WireError::from_engine_error(&err),
            },
        };
        // A reply that cannot be framed at all drops the channel, which the
        // caller reports as a transport failure.
        if let Ok(bytes) = reply_frame(&reply) {
            let _ = task.reply.send(bytes);
        }
    }
}

/// Frames `reply`, falling back to an error reply that carries the encode
/// failure.
fn reply_frame<T: Serialize>(reply: &T) -> Result<Vec<u8>, WireError> {
    wire::encode_frame(reply).or_else(|err| wire::encode_frame(&ReplyPayload::Err { error: err }))
}

fn execute(task: &Task, verify_digests: bool) -> Result<Value, EngineError> {
    let payload = wire::decode_frame::<TaskPayload>(&task.frame)?;
    let args = payload
        .args
        .iter()
        .map(|arg| wire::decode_value(arg, verify_digests))
        .collect::<Result<Vec<_>, _>>()?;
    let job = Arc::clone(&task.job);
    panic::catch_unwind(AssertUnwindSafe(|| job.run(&args))).unwrap_or_else(|_| {
        Err(EngineError::Remote(WireError {
            kind: ErrorKind::Remote,
            reason_code: "engine_job_panicked".to_string(),
            message: format!("job '{}' panicked on a worker", payload.job),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::{ExecutionEngine, LocalEngine, RemoteValue, WorkerPool, reply_frame};
    use crate::wire::{self, ReplyPayload};
    use crate::{EngineError, FnJob, Job, Operation, RuntimeConfig, RuntimeMode, Value};
    use pnp_dtype::Scalar;
    use pnp_ndarray::{ErrorKind, NdArray, Nested};
    use std::sync::Arc;
    use std::thread;

    fn matrix() -> Value {
        Value::Array(
            NdArray::from_nested(&Nested::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]))
                .expect("fixture"),
        )
    }

    fn singular() -> Value {
        Value::Array(
            NdArray::from_nested(&Nested::from(vec![vec![1.0, 2.0], vec![2.0, 4.0]]))
                .expect("fixture"),
        )
    }

    #[test]
    fn local_engine_stores_results_by_handle() {
        let engine = LocalEngine::new();
        let job: Arc<dyn Job> = Arc::new(Operation::Transpose);
        let first = engine.submit(Arc::clone(&job), &[matrix()]).expect("submit");
        let second = engine.submit(job, &[matrix()]).expect("submit");
        assert_ne!(first, second);
        assert_eq!(engine.pending(), 2);
        let values = engine.download_all(&[first, second]).expect("download");
        assert_eq!(values[0], values[1]);
        assert_eq!(engine.pending(), 0);
        let err = engine.download(first).expect_err("already downloaded");
        assert!(matches!(err, EngineError::UnknownHandle(_)));
        let err = engine
            .download(RemoteValue { id: 999 })
            .expect_err("unknown handle");
        assert!(matches!(err, EngineError::UnknownHandle(999)));
    }

    #[test]
    fn worker_pool_matches_local_results() {
        let pool = WorkerPool::new(2, true).expect("pool");
        assert_eq!(pool.worker_count(), 2);
        let local = LocalEngine::new();
        for op in [Operation::Inv, Operation::Det, Operation::Svd, Operation::ToList] {
            let job: Arc<dyn Job> = Arc::new(op);
            let remote = pool.submit(Arc::clone(&job), &[matrix()]).expect("remote");
            let inline = local.submit(job, &[matrix()]).expect("local");
            assert_eq!(
                pool.download(remote).expect("download"),
                local.download(inline).expect("download"),
                "{op}"
            );
        }
    }

    #[test]
    fn remote_failures_keep_kind_and_message() {
        let pool = WorkerPool::new(1, false).expect("pool");
        let err = pool
            .submit(Arc::new(Operation::Inv), &[singular()])
            .expect_err("singular");
        assert!(matches!(err, EngineError::Remote(_)));
        assert_eq!(err.kind(), ErrorKind::SingularMatrix);
        assert_eq!(err.to_string(), "matrix was singular");
    }

    #[test]
    fn panicking_jobs_do_not_kill_the_pool() {
        let pool = WorkerPool::new(1, false).expect("pool");
        let boom = FnJob::new("boom", |_args: &[Value]| -> Result<Value, EngineError> {
            panic!("boom")
        });
        let err = pool.submit(Arc::new(boom), &[]).expect_err("panic");
        assert_eq!(err.reason_code(), "engine_job_panicked");
        assert_eq!(err.kind(), ErrorKind::Remote);

        let handle = pool
            .submit(Arc::new(Operation::Det), &[matrix()])
            .expect("pool still serves");
        let Value::Scalar(Scalar::Float(det)) = pool.download(handle).expect("download") else {
            panic!("scalar expected");
        };
        assert!((det + 2.0).abs() < 1e-12);
    }

    #[test]
    fn pool_serves_concurrent_callers() {
        let pool = Arc::new(
            WorkerPool::from_config(
                &RuntimeConfig::default()
                    .with_mode(RuntimeMode::Hardened)
                    .with_workers(3),
            )
            .expect("pool"),
        );
        let callers = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let handle = pool
                        .submit(Arc::new(Operation::Flatten), &[matrix()])
                        .expect("submit");
                    pool.download(handle).expect("download")
                })
            })
            .collect::<Vec<_>>();
        for caller in callers {
            let value = caller.join().expect("caller thread");
            assert_eq!(value.as_array().expect("array").shape(), &[4]);
        }
    }

    #[test]
    fn downloads_release_stored_results() {
        let pool = WorkerPool::new(2, true).expect("pool");
        let handles = (0..4)
            .map(|_| pool.submit(Arc::new(Operation::Det), &[matrix()]).expect("submit"))
            .collect::<Vec<_>>();
        assert_eq!(pool.pending(), 4);

        let err = pool
            .download_all(&[handles[0], RemoteValue { id: 999 }])
            .expect_err("unknown handle");
        assert!(matches!(err, EngineError::UnknownHandle(999)));
        assert_eq!(pool.pending(), 4, "a failed download releases nothing");

        let values = pool.download_all(&handles).expect("download");
        assert_eq!(values.len(), 4);
        assert_eq!(pool.pending(), 0);
        assert!(pool.download(handles[0]).is_err());
    }

    struct Unframeable;

    impl serde::Serialize for Unframeable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("reply refused to serialize"))
        }
    }

    #[test]
    fn unframeable_replies_become_error_replies() {
        let bytes = reply_frame(&Unframeable).expect("fallback frame");
        let ReplyPayload::Err { error } = wire::decode_frame::<ReplyPayload>(&bytes).expect("reply")
        else {
            panic!("error reply expected");
        };
        assert_eq!(error.reason_code, "wire_frame_encode_failed");
        assert!(error.message.contains("reply refused to serialize"), "{}", error.message);
        assert_eq!(error.kind, ErrorKind::Remote);
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let err = WorkerPool::new(0, false).expect_err("zero workers");
        assert!(matches!(err, EngineError::Config(_)));
    }
}
