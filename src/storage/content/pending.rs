//! Bookkeeping for writes queued on the background writer

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Completion signal for one queued write
///
/// Waiters block on the ticket of the record they care about; the writer
/// completes it after the commit, successful or not.
#[derive(Debug, Default)]
pub struct WriteTicket {
    done: Mutex<bool>,
    signal: Condvar,
}

impl WriteTicket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the write finished and wake every waiter
    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.signal.notify_all();
    }

    /// Block until `complete` has been called
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.signal.wait(&mut done);
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }
}

/// A write accepted for a record but not yet committed
#[derive(Debug)]
pub struct PendingWrite {
    pub ticket: Arc<WriteTicket>,
    /// Uncompressed length counted against the pending-byte limit
    pub bytes_queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_after_complete() {
        let ticket = WriteTicket::new();
        let remote = Arc::clone(&ticket);

        let waiter = thread::spawn(move || {
            remote.wait();
            remote.is_complete()
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!ticket.is_complete());
        ticket.complete();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_on_completed_ticket_is_immediate() {
        let ticket = WriteTicket::new();
        ticket.complete();
        ticket.wait();
        assert!(ticket.is_complete());
    }
}
