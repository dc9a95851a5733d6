use super::{ExecutionContext, Task};
use crate::error::{SpaceError, SpaceResult};
use crate::space::MemorySpace;
use std::sync::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

enum Command {
    Run(Task),
    Fence(Sender<()>),
}

/// An in-order work queue backed by a dedicated worker thread.
///
/// This is the host-side stand-in for an accelerator stream: work is executed
/// strictly in submission order and [`fence`](ExecutionContext::fence) waits for
/// everything submitted before it.
#[derive(Debug)]
pub struct HostStream {
    space: MemorySpace,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    /// Spawns the worker thread for a stream scheduling on `space`.
    ///
    /// # Errors
    /// Returns an `io::Error` if the worker thread cannot be spawned.
    pub fn new(space: MemorySpace) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();

        let worker = std::thread::Builder::new()
            .name(format!("memspace-stream-{space}"))
            .spawn(move || {
                for command in receiver {
                    match command {
                        Command::Run(task) => task(),
                        Command::Fence(done) => {
                            done.send(()).ok();
                        }
                    }
                }
            })?;

        Ok(Self {
            space,
            sender: Mutex::new(Some(sender)),
            worker: Some(worker),
        })
    }

    fn worker_gone(&self) -> SpaceError {
        SpaceError::Driver(format!("stream on {} has no running worker", self.space))
    }

    fn submit(&self, command: Command) -> bool {
        let guard = self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .as_ref()
            .is_some_and(|sender| sender.send(command).is_ok())
    }
}

impl ExecutionContext for HostStream {
    fn space(&self) -> MemorySpace {
        self.space
    }

    fn fence(&self) -> SpaceResult<()> {
        let (done, wait) = mpsc::channel();
        if !self.submit(Command::Fence(done)) {
            log::error!("[HostStream] {} fence could not reach the worker", self.space);
            return Err(self.worker_gone());
        }

        // A dead worker drops the marker unanswered.
        wait.recv().map_err(|_| {
            log::error!("[HostStream] {} worker died before the fence", self.space);
            self.worker_gone()
        })
    }

    fn enqueue(&self, task: Task) -> SpaceResult<()> {
        if !self.submit(Command::Run(task)) {
            log::error!("[HostStream] {} worker is gone, rejecting task", self.space);
            return Err(self.worker_gone());
        }
        Ok(())
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("[HostStream] {} worker panicked", self.space);
        }
    }
}
