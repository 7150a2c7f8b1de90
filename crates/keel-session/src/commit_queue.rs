//! FIFO serialisation of commits on one unit of work.
//!
//! A commit requested while another is in flight waits on a oneshot channel
//! until the running one hands its turn over. Turns are granted strictly in
//! request order. A waiter dropped before its turn (cancelled task) is
//! skipped; one dropped right after being signalled passes the turn on.

use futures::channel::oneshot;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct QueueState {
    running: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct CommitQueue {
    state: Mutex<QueueState>,
}

impl CommitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for this caller's turn.
    pub(crate) async fn acquire(&self) -> Turn<'_> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.running = true;
                None
            }
        };

        if let Some(rx) = rx {
            tracing::debug!("Commit queued behind a running commit");
            let mut waiter = Waiter {
                queue: self,
                rx: Some(rx),
            };
            waiter.wait().await;
        }
        Turn { queue: self }
    }

    /// Number of commits waiting for a turn.
    pub(crate) fn waiting(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .iter()
            .filter(|tx| !tx.is_canceled())
            .count()
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.running = false;
    }
}

/// The right to run a commit; dropping it hands over to the next waiter.
#[derive(Debug)]
pub(crate) struct Turn<'a> {
    queue: &'a CommitQueue,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

struct Waiter<'a> {
    queue: &'a CommitQueue,
    rx: Option<oneshot::Receiver<()>>,
}

impl Waiter<'_> {
    async fn wait(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // A dropped sender only happens when the queue itself is gone.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(Some(())) = rx.try_recv() {
                self.queue.release();
            }
        }
    }
}
