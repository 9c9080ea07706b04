//! A bounded pool of sandbox worker threads.
//!
//! Each worker owns a [PackSandbox] with every pack of the run loaded into it, so any job can call
//! any pack. Jobs are boxed closures taken from a shared queue.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, mpsc},
};

use anyhow::{Result, anyhow, bail};

use super::{PackManifest, PackSandbox, SandboxSettings};
use crate::{cancel::CancelToken, error::EngineError};

type Job = Box<dyn FnOnce(&mut PackSandbox) + Send + 'static>;

/// Code of one pack as loaded into every worker.
#[derive(Clone, Debug)]
pub struct PackSource {
    /// Script name used in exception locations.
    pub resource_name: String,
    pub code: Arc<str>,
    /// Manifest the pack produced when it was first loaded. Workers check that they agree.
    pub manifest: PackManifest,
}

pub struct SandboxPool {
    job_send: Option<mpsc::Sender<Job>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl SandboxPool {
    /// Starts `num_workers` workers and waits until each has loaded `packs`.
    pub fn start(
        settings: &SandboxSettings,
        packs: Arc<Vec<PackSource>>,
        num_workers: usize,
    ) -> Result<Self, EngineError> {
        let (job_send, job_recv) = mpsc::channel::<Job>();
        let job_recv = Arc::new(Mutex::new(job_recv));
        let (ready_send, ready_recv) = mpsc::channel::<Result<(), String>>();

        let mut pool = Self {
            job_send: Some(job_send),
            workers: Vec::with_capacity(num_workers),
        };
        for index in 0..num_workers.max(1) {
            let settings = settings.clone();
            let packs = packs.clone();
            let job_recv = job_recv.clone();
            let ready_send = ready_send.clone();
            let worker = std::thread::Builder::new()
                .name(format!("pack-sandbox-{index}"))
                .spawn(move || worker_main(index, settings, packs, job_recv, ready_send))
                .map_err(|err| EngineError::Fatal(anyhow!("spawning sandbox worker: {err}")))?;
            pool.workers.push(worker);
        }
        drop(ready_send);

        for _ in 0..pool.workers.len() {
            match ready_recv.recv() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => return Err(EngineError::fatal(message)),
                Err(_) => return Err(EngineError::fatal("sandbox worker exited during startup")),
            }
        }
        log::debug!("Started {} sandbox workers.", pool.workers.len());
        Ok(pool)
    }

    /// Runs every task on the pool, returning their results in task order.
    ///
    /// Tasks that have not started when `cancel` is set are skipped and the run reports
    /// [EngineError::Cancelled]. A task error, or a worker lost while running a task, is fatal.
    pub fn run_all<T, F>(&self, tasks: Vec<F>, cancel: &CancelToken) -> Result<Vec<T>, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PackSandbox) -> Result<T> + Send + 'static,
    {
        let job_send = self
            .job_send
            .as_ref()
            .ok_or_else(|| EngineError::fatal("sandbox pool is shut down"))?;
        let num_tasks = tasks.len();
        let (result_send, result_recv) = mpsc::channel::<(usize, Option<Result<T>>)>();

        for (index, task) in tasks.into_iter().enumerate() {
            let result_send = result_send.clone();
            let cancel = cancel.clone();
            let job: Job = Box::new(move |sandbox: &mut PackSandbox| {
                let result = if cancel.is_cancelled() {
                    None
                } else {
                    Some(task(sandbox))
                };
                // The receiver is gone if the run already failed.
                let _ = result_send.send((index, result));
            });
            job_send
                .send(job)
                .map_err(|_| EngineError::fatal("all sandbox workers have exited"))?;
        }
        drop(result_send);

        let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(num_tasks).collect();
        let mut cancelled = false;
        for _ in 0..num_tasks {
            let (index, result) = result_recv
                .recv()
                .map_err(|_| EngineError::fatal("a sandbox worker stopped while running a task"))?;
            match result {
                None => cancelled = true,
                Some(Ok(value)) => results[index] = Some(value),
                Some(Err(err)) => return Err(EngineError::Fatal(err)),
            }
        }
        if cancelled || cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        results
            .into_iter()
            .map(|result| result.ok_or_else(|| EngineError::fatal("missing task result")))
            .collect()
    }
}

impl Drop for SandboxPool {
    fn drop(&mut self) {
        // Closing the queue stops the workers once they finish their current job.
        drop(self.job_send.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Sandbox worker thread panicked.");
            }
        }
    }
}

fn worker_main(
    index: usize,
    settings: SandboxSettings,
    packs: Arc<Vec<PackSource>>,
    job_recv: Arc<Mutex<mpsc::Receiver<Job>>>,
    ready_send: mpsc::Sender<Result<(), String>>,
) {
    let mut sandbox = match start_sandbox(&settings, &packs) {
        Ok(sandbox) => {
            let _ = ready_send.send(Ok(()));
            sandbox
        }
        Err(err) => {
            let _ = ready_send.send(Err(format!("sandbox worker {index}: {err:#}")));
            return;
        }
    };
    drop(ready_send);

    loop {
        let job = {
            let job_recv = job_recv.lock().expect("failed to lock job queue");
            job_recv.recv()
        };
        let Ok(job) = job else {
            break;
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| job(&mut sandbox))).is_err() {
            log::error!("Sandbox worker {index} panicked while running a job, stopping it.");
            break;
        }
    }
}

/// Creates the thread's sandbox and loads every pack into it.
pub fn start_sandbox(settings: &SandboxSettings, packs: &[PackSource]) -> Result<PackSandbox> {
    let mut sandbox = PackSandbox::new(settings)?;
    for pack in packs {
        let manifest = match sandbox.load(&pack.resource_name, &pack.code)? {
            Ok(manifest) => manifest,
            Err(failure) => bail!("pack {} failed to load: {failure}", pack.resource_name),
        };
        if manifest != pack.manifest {
            bail!(
                "pack {} exported {manifest:?} but {:?} was expected",
                pack.resource_name,
                pack.manifest,
            );
        }
    }
    Ok(sandbox)
}

/// Runs `f` with a fresh, empty sandbox on a short-lived thread, so that it never collides with an
/// isolate owned by the calling thread.
pub fn with_scratch_sandbox<T, F>(settings: &SandboxSettings, f: F) -> Result<T>
where
    T: Send,
    F: FnOnce(&mut PackSandbox) -> Result<T> + Send,
{
    std::thread::scope(|scope| {
        let worker = std::thread::Builder::new()
            .name("pack-scratch".to_string())
            .spawn_scoped(scope, || {
                let mut sandbox = PackSandbox::new(settings)?;
                f(&mut sandbox)
            })?;
        worker
            .join()
            .map_err(|_| anyhow!("scratch sandbox thread panicked"))?
    })
}
