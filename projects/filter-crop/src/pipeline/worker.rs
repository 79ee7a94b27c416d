// Batch worker: receives input batches, runs them through a stage and sends
// the outputs on.

use crate::pipeline::types::FrameBatch;
use crate::stage::FrameFilter;
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;

/// An input batch tagged with its position in the stream.
pub struct InputBatch {
    pub id: usize,
    pub name: String,
    pub frames: FrameBatch,
}

/// The stage's output for one [`InputBatch`].
pub struct OutputBatch {
    pub id: usize,
    pub name: String,
    pub frames: FrameBatch,
    pub duration_ms: f64,
}

/// Runs every received batch through `filter` until the input channel closes
/// or the output receiver goes away. Returns the number of batches processed.
pub fn batch_worker<F>(rx: Receiver<InputBatch>, tx: Sender<OutputBatch>, filter: Arc<F>) -> usize
where
    F: FrameFilter + Send + Sync,
{
    let mut processed = 0;

    for batch in rx {
        let start_inst = Instant::now();
        let frames = filter.process(batch.frames);
        let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;

        processed += 1;
        if tx
            .send(OutputBatch {
                id: batch.id,
                name: batch.name,
                frames,
                duration_ms,
            })
            .is_err()
        {
            break;
        }
    }

    processed
}
