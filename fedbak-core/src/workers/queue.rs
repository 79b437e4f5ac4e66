use crate::metadata_store::BlockMeta;
use tokio::sync::mpsc;
use tracing::debug;

/// Producer half of the change queue. The file API and the
/// server-delete cascade push snapshots of blocks whose replicas need
/// attention; the propagation worker drains them on its tick.
///
/// Snapshots keep their replica maps even when the block itself was
/// deleted from the metadata store, which is what lets the worker
/// clean up remote copies afterwards.
#[derive(Clone)]
pub struct ChangeQueue {
    tx: mpsc::UnboundedSender<BlockMeta>,
}

pub struct ChangeReceiver {
    rx: mpsc::UnboundedReceiver<BlockMeta>,
}

impl ChangeQueue {
    pub fn channel() -> (ChangeQueue, ChangeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChangeQueue { tx }, ChangeReceiver { rx })
    }

    pub fn push(&self, block: BlockMeta) {
        if self.tx.send(block).is_err() {
            // Only possible during shutdown, once the worker is gone.
            debug!("change queue receiver dropped; discarding block snapshot");
        }
    }
}

impl ChangeReceiver {
    /// Takes everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<BlockMeta> {
        let mut drained = Vec::new();
        while let Ok(block) = self.rx.try_recv() {
            drained.push(block);
        }
        drained
    }
}
