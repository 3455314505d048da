//! Hand-off between the decoder on the execution thread and the presentation thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::command::RenderCommand;

/// FIFO of [`RenderCommand`]s. Producers never block on the consumer; the consumer drains the
/// whole backlog at once with [`RenderQueue::pop_all`].
#[derive(Debug, Default)]
pub struct RenderQueue {
    pending: Mutex<VecDeque<RenderCommand>>,
    ready: Condvar,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    frames: AtomicU64,
}

impl RenderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RenderCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, cmd: RenderCommand) {
        {
            let mut pending = self.lock();
            pending.push_back(cmd);
            self.total_pushed.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
    }

    pub fn push_many<I>(&self, cmds: I)
    where
        I: IntoIterator<Item = RenderCommand>,
    {
        let added = {
            let mut pending = self.lock();
            let before = pending.len();
            pending.extend(cmds);
            pending.len() - before
        };
        if added == 0 {
            return;
        }
        self.total_pushed.fetch_add(added as u64, Ordering::Relaxed);
        self.ready.notify_one();
    }

    /// Pushes [`RenderCommand::EndFrame`] and counts the frame.
    pub fn end_frame(&self) {
        self.push(RenderCommand::EndFrame);
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes every pending command, oldest first.
    pub fn pop_all(&self) -> Vec<RenderCommand> {
        let drained: Vec<_> = self.lock().drain(..).collect();
        self.total_popped
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Blocks until at least one command is pending or `timeout` elapses. Returns whether
    /// commands are available.
    pub fn wait_for_commands(&self, timeout: Duration) -> bool {
        let pending = self.lock();
        if !pending.is_empty() {
            return true;
        }
        let (pending, _) = self
            .ready
            .wait_timeout_while(pending, timeout, |pending| pending.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !pending.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drops pending commands without counting them as popped.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }

    pub fn total_popped(&self) -> u64 {
        self.total_popped.load(Ordering::Relaxed)
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}
