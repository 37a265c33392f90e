//! The background compilation thread.
//!
//! One worker drains a bounded FIFO of queued compile operations. The
//! queue carries weak references: a marker dropped by its caller before
//! the worker reaches it is skipped silently. Cancellation is coarse,
//! matching the pipeline's contract: `stall_on_pending_operations(true)`
//! makes the worker skip everything still queued and joins the thread;
//! the job in flight always runs to completion.

use super::CompileMarker;
use crate::error::{AssetError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
};

/// Queue capacity; pushes beyond this block until the worker drains a
/// slot.
pub const QUEUE_CAPACITY: usize = 256;

enum Message {
    Operation(Weak<CompileMarker>),
    Flush(Sender<()>),
    Quit,
}

/// Handle to the single background compile thread.
pub struct CompilationThread {
    sender: Sender<Message>,
    quit: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CompilationThread {
    /// Spawns the worker. `compile_op` runs once per live queued marker,
    /// on the worker thread, in strict queue order.
    pub fn new(compile_op: impl Fn(Arc<CompileMarker>) + Send + 'static) -> Result<Self> {
        let (sender, receiver) = bounded(QUEUE_CAPACITY);
        let quit = Arc::new(AtomicBool::new(false));
        let thread = std::thread::Builder::new()
            .name("asset-compile".into())
            .spawn({
                let quit = Arc::clone(&quit);
                move || worker_loop(receiver, quit, compile_op)
            })
            .map_err(|err| AssetError::msg(format!("failed to spawn compile worker: {err}")))?;
        Ok(Self { sender, quit, thread: Mutex::new(Some(thread)) })
    }

    /// Queues a compile operation. Only a weak reference is retained.
    /// After cancellation this is a no-op.
    pub fn push(&self, marker: &Arc<CompileMarker>) {
        if self.quit.load(Ordering::Acquire) {
            return;
        }
        let message = Message::Operation(Arc::downgrade(marker));
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                trace!("compile queue full; waiting for a slot");
                let _ = self.sender.send(message);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Waits for the pipeline to go idle.
    ///
    /// With `cancel_all` set, every operation still in the queue is
    /// dropped unstarted and the worker thread is joined; subsequent
    /// pushes do nothing. Otherwise the call returns once everything
    /// queued so far has been processed, leaving the worker running.
    pub fn stall_on_pending_operations(&self, cancel_all: bool) {
        if cancel_all {
            self.quit.store(true, Ordering::Release);
            let _ = self.sender.send(Message::Quit);
            if let Some(handle) = self.thread.lock().take() {
                let _ = handle.join();
            }
        } else {
            let (ack_sender, ack_receiver) = bounded(1);
            if self.sender.send(Message::Flush(ack_sender)).is_ok() {
                let _ = ack_receiver.recv();
            }
        }
    }
}

impl Drop for CompilationThread {
    fn drop(&mut self) {
        self.stall_on_pending_operations(true);
    }
}

impl std::fmt::Debug for CompilationThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationThread")
            .field("cancelled", &self.quit.load(Ordering::Acquire))
            .finish()
    }
}

fn worker_loop(
    receiver: Receiver<Message>,
    quit: Arc<AtomicBool>,
    compile_op: impl Fn(Arc<CompileMarker>),
) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Operation(weak) => {
                if quit.load(Ordering::Acquire) {
                    // cancelled before starting; skip silently
                    continue;
                }
                if let Some(operation) = weak.upgrade() {
                    compile_op(operation);
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
            Message::Quit => break,
        }
    }
}
