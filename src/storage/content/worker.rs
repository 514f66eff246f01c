//! Background writer thread
//!
//! One thread per content store drains a FIFO of write jobs, so commits are
//! serialised store-wide. Each job compresses its payload without holding
//! the store lock, then takes the lock to commit it.

use super::pending::WriteTicket;
use super::store::Shared;
use crate::error::{Error, Result};
use crate::storage::table::RecordId;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// A payload waiting to be compressed and committed
pub struct WriteJob {
    pub record: RecordId,
    pub bytes: Vec<u8>,
    pub fixed_size: bool,
    pub ticket: Arc<WriteTicket>,
}

/// Start the writer; it exits once every sender has been dropped and the
/// queue is empty
pub(crate) fn spawn_writer(shared: Arc<Shared>) -> Result<(Sender<WriteJob>, JoinHandle<()>)> {
    let (sender, receiver) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("buildstore-writer".to_string())
        .spawn(move || writer_loop(shared, receiver))
        .map_err(|e| Error::io("buildstore-writer", e))?;
    Ok((sender, handle))
}

fn writer_loop(shared: Arc<Shared>, receiver: Receiver<WriteJob>) {
    debug!("Background writer started");
    let mut committed = 0u64;
    for job in receiver {
        trace!(record = %job.record, bytes = job.bytes.len(), "Committing queued write");
        shared.compress_and_commit(job);
        committed += 1;
    }
    debug!(committed, "Background writer stopped");
}
