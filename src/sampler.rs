//! Batch sampling, collation, and background prefetching.
//!
//! The sampler produces one seeded permutation per epoch; the prefetch
//! loader runs a single background worker that encodes and collates batches
//! in permutation order into a bounded buffer. One worker is deliberate: it
//! preserves the epoch order exactly (the only job of the parallelism here
//! is to overlap encoding latency with compute, never to reorder examples).
//! The trainer blocks on an empty buffer and the worker parks on a full one,
//! which is the natural backpressure point on both sides.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::Example;
use crate::encoder::{EncodedExample, Encoder};
use crate::error::{Result, TacticError};
use crate::vocab::Vocabulary;

/// A collated mini-batch of encoded examples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token-id matrix, `[batch_size, seq_len]`, u32.
    pub token_ids: Tensor,
    /// Attention-mask matrix, `[batch_size, seq_len]`, f32.
    pub attention_mask: Tensor,
    /// Multi-hot label matrix, `[batch_size, num_labels]`, f32.
    pub labels: Tensor,
    /// Number of examples in the batch (the final batch of an epoch may be
    /// undersized).
    pub len: usize,
    /// Unknown labels dropped while encoding this batch.
    pub dropped_labels: usize,
}

/// Collate encoded examples into rectangular tensors.
///
/// # Errors
///
/// Returns an error if tensor construction fails.
pub fn collate(
    examples: &[EncodedExample],
    dropped_labels: usize,
    device: &Device,
) -> Result<Batch> {
    if examples.is_empty() {
        return Err(TacticError::Training(
            "cannot collate an empty batch".to_string(),
        ));
    }
    let batch_size = examples.len();
    let seq_len = examples[0].token_ids.len();
    let num_labels = examples[0].label_vector.len();

    let mut ids = Vec::with_capacity(batch_size * seq_len);
    let mut mask = Vec::with_capacity(batch_size * seq_len);
    let mut labels = Vec::with_capacity(batch_size * num_labels);
    for example in examples {
        ids.extend_from_slice(&example.token_ids);
        mask.extend_from_slice(&example.attention_mask);
        labels.extend_from_slice(&example.label_vector);
    }

    Ok(Batch {
        token_ids: Tensor::from_vec(ids, (batch_size, seq_len), device)?,
        attention_mask: Tensor::from_vec(mask, (batch_size, seq_len), device)?,
        labels: Tensor::from_vec(labels, (batch_size, num_labels), device)?,
        len: batch_size,
        dropped_labels,
    })
}

/// Produces one shuffled index permutation per epoch.
///
/// With an explicit seed the permutation for epoch `e` is derived from
/// `seed + e`, so repeated runs shuffle identically epoch by epoch; without
/// a seed each epoch draws from entropy.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    seed: Option<u64>,
    batch_size: usize,
}

impl BatchSampler {
    /// Create a sampler. `batch_size` must be at least 1 (validated by the
    /// run configuration).
    #[must_use]
    pub fn new(batch_size: usize, seed: Option<u64>) -> Self {
        Self { seed, batch_size }
    }

    /// Micro-batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Shuffled example order for one epoch over a store of `len` examples.
    #[must_use]
    pub fn epoch_order(&self, len: usize, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
            None => StdRng::from_entropy(),
        };
        order.shuffle(&mut rng);
        order
    }

    /// Number of batches one epoch produces over `len` examples. A
    /// single-example store still produces one (undersized) batch.
    #[must_use]
    pub fn batches_per_epoch(&self, len: usize) -> usize {
        len.div_ceil(self.batch_size)
    }
}

/// Background prefetching over one epoch's batches.
///
/// The worker encodes and collates batches ahead of the trainer into a
/// bounded buffer. Dropping the loader stops the worker and joins it.
pub struct PrefetchLoader {
    buffer: Arc<Mutex<VecDeque<Result<Batch>>>>,
    finished: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl PrefetchLoader {
    /// Spawn the prefetch worker for one epoch.
    ///
    /// `order` is the epoch permutation from [`BatchSampler::epoch_order`];
    /// batches are produced strictly in that order.
    pub fn spawn(
        examples: Arc<Vec<Example>>,
        order: Vec<usize>,
        encoder: Arc<Encoder>,
        vocab: Arc<Vocabulary>,
        batch_size: usize,
        device: Device,
        capacity: usize,
    ) -> Self {
        let buffer: Arc<Mutex<VecDeque<Result<Batch>>>> = Arc::new(Mutex::new(VecDeque::new()));
        let finished = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let capacity = capacity.max(1);

        let worker = {
            let buffer = Arc::clone(&buffer);
            let finished = Arc::clone(&finished);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                'outer: for chunk in order.chunks(batch_size) {
                    let mut encoded = Vec::with_capacity(chunk.len());
                    let mut dropped = 0usize;
                    let mut produced: Option<Result<Batch>> = None;
                    for &idx in chunk {
                        match encoder.encode_example(&examples[idx], &vocab) {
                            Ok((example, d)) => {
                                dropped += d;
                                encoded.push(example);
                            }
                            Err(e) => {
                                produced = Some(Err(e));
                                break;
                            }
                        }
                    }
                    let item = match produced {
                        Some(err) => err,
                        None => collate(&encoded, dropped, &device),
                    };

                    loop {
                        if cancel.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        let mut guard = buffer.lock().expect("prefetch buffer poisoned");
                        if guard.len() < capacity {
                            guard.push_back(item);
                            break;
                        }
                        drop(guard);
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                finished.store(true, Ordering::Release);
            })
        };

        Self {
            buffer,
            finished,
            cancel,
            worker: Some(worker),
        }
    }

    /// Block until the next batch is ready, or return `None` when the epoch
    /// is exhausted.
    pub fn next_batch(&self) -> Option<Result<Batch>> {
        loop {
            {
                let mut guard = self.buffer.lock().expect("prefetch buffer poisoned");
                if let Some(item) = guard.pop_front() {
                    return Some(item);
                }
            }
            if self.finished.load(Ordering::Acquire) {
                // Re-check: the worker may have pushed between our pop and
                // the finished read.
                let mut guard = self.buffer.lock().expect("prefetch buffer poisoned");
                return guard.pop_front();
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for PrefetchLoader {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
