//! Dedicated thread running one simulation step at a time.
//!
//! The caller hands over the whole world state with [`StepWorker::submit`]
//! and gets it back through [`StepWorker::try_fetch`] or
//! [`StepWorker::fetch_blocking`]. Ownership moves with the state, so no
//! lock is ever taken on it.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// A step request: the state to advance and the time step.
struct StepTask<W> {
    world: W,
    dt: f32,
}

/// Outcome of polling the worker.
#[derive(Debug)]
pub enum StepPoll<W> {
    /// The step finished; the state is returned.
    Done(W),
    /// The step is still running.
    Pending,
    /// The worker is gone and the state with it.
    Lost,
}

/// Single background thread stepping a world of type `W`.
pub struct StepWorker<W: Send + 'static> {
    task_sender: Option<Sender<StepTask<W>>>,
    result_receiver: Receiver<W>,
    worker_handle: Option<JoinHandle<()>>,
}

impl<W: Send + 'static> StepWorker<W> {
    /// Spawns the named worker thread running `step` on each submitted world.
    pub fn spawn<F>(name: &str, step: F) -> std::io::Result<Self>
    where
        F: Fn(&mut W, f32) + Send + 'static,
    {
        let (task_tx, task_rx) = crossbeam_channel::bounded::<StepTask<W>>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(mut task) = task_rx.recv() {
                    step(&mut task.world, task.dt);
                    if result_tx.send(task.world).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            task_sender: Some(task_tx),
            result_receiver: result_rx,
            worker_handle: Some(handle),
        })
    }

    /// Hands the world to the worker. Gives it back if the worker is gone.
    pub fn submit(&self, world: W, dt: f32) -> Result<(), W> {
        match &self.task_sender {
            Some(sender) => sender
                .send(StepTask { world, dt })
                .map_err(|err| err.into_inner().world),
            None => Err(world),
        }
    }

    /// Non-blocking poll for the stepped world.
    pub fn try_fetch(&self) -> StepPoll<W> {
        match self.result_receiver.try_recv() {
            Ok(world) => StepPoll::Done(world),
            Err(TryRecvError::Empty) => StepPoll::Pending,
            Err(TryRecvError::Disconnected) => StepPoll::Lost,
        }
    }

    /// Waits for the stepped world.
    pub fn fetch_blocking(&self) -> StepPoll<W> {
        match self.result_receiver.recv() {
            Ok(world) => StepPoll::Done(world),
            Err(_) => StepPoll::Lost,
        }
    }

    /// Stops the worker after its current step.
    pub fn shutdown(&mut self) {
        self.task_sender.take();
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl<W: Send + 'static> Drop for StepWorker<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
