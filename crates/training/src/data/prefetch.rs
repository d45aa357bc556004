use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use candle_core::Device;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{AudioBatch, BatchStream, Dataset, PlannedBatch, Result};
use crate::TrainingError;

type Job = (usize, PlannedBatch);
type Delivery = (usize, Result<AudioBatch>);

/// Collates planned batches on background threads into a bounded queue and
/// yields them in plan order. The consumer blocks on an empty queue and the
/// fetchers block on a full one.
pub struct PrefetchLoader<S: Dataset + 'static> {
    dataset: Arc<S>,
    device: Device,
    inline_jobs: VecDeque<Job>,
    receiver: Option<Receiver<Delivery>>,
    reorder: BTreeMap<usize, Result<AudioBatch>>,
    next_index: usize,
    total: usize,
    workers: Vec<JoinHandle<()>>,
}

impl<S: Dataset + 'static> PrefetchLoader<S> {
    /// `num_workers == 0` collates on the calling thread.
    pub fn spawn(
        dataset: Arc<S>,
        plan: Vec<PlannedBatch>,
        device: Device,
        num_workers: usize,
        depth: usize,
    ) -> Self {
        let total = plan.len();
        let jobs: VecDeque<Job> = plan.into_iter().enumerate().collect();

        if num_workers == 0 || total == 0 {
            return Self {
                dataset,
                device,
                inline_jobs: jobs,
                receiver: None,
                reorder: BTreeMap::new(),
                next_index: 0,
                total,
                workers: Vec::new(),
            };
        }

        let (sender, receiver) = mpsc::sync_channel::<Delivery>(depth.max(1));
        let queue = Arc::new(Mutex::new(jobs));
        let workers = (0..num_workers.min(total))
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let dataset = Arc::clone(&dataset);
                let device = device.clone();
                let sender: SyncSender<Delivery> = sender.clone();
                thread::spawn(move || fetch_loop(worker, queue, dataset, device, sender))
            })
            .collect();

        Self {
            dataset,
            device,
            inline_jobs: VecDeque::new(),
            receiver: Some(receiver),
            reorder: BTreeMap::new(),
            next_index: 0,
            total,
            workers,
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn recv(&mut self) -> Result<Option<AudioBatch>> {
        if self.next_index >= self.total {
            return Ok(None);
        }

        let Some(receiver) = self.receiver.as_ref() else {
            let Some((_, planned)) = self.inline_jobs.pop_front() else {
                return Ok(None);
            };
            self.next_index += 1;
            return self
                .dataset
                .collate(&planned.indices, planned.bucket, &self.device)
                .map(Some);
        };

        while !self.reorder.contains_key(&self.next_index) {
            let (index, batch) = receiver.recv().map_err(|_| {
                TrainingError::runtime("prefetch workers exited before delivering every batch")
            })?;
            self.reorder.insert(index, batch);
        }

        let batch = self
            .reorder
            .remove(&self.next_index)
            .ok_or_else(|| TrainingError::runtime("prefetch reorder buffer lost a batch"))?;
        self.next_index += 1;
        batch.map(Some)
    }
}

fn fetch_loop<S: Dataset>(
    worker: usize,
    queue: Arc<Mutex<VecDeque<Job>>>,
    dataset: Arc<S>,
    device: Device,
    sender: SyncSender<Delivery>,
) {
    loop {
        let job = match queue.lock() {
            Ok(mut jobs) => jobs.pop_front(),
            Err(_) => {
                warn!(worker, "prefetch queue poisoned");
                return;
            }
        };
        let Some((index, planned)) = job else {
            debug!(worker, "prefetch worker drained");
            return;
        };
        let batch = dataset.collate(&planned.indices, planned.bucket, &device);
        if sender.send((index, batch)).is_err() {
            return;
        }
    }
}

impl<S: Dataset + 'static> BatchStream for PrefetchLoader<S> {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<AudioBatch>>> {
        Box::pin(async move { self.recv() })
    }
}

impl<S: Dataset + 'static> Drop for PrefetchLoader<S> {
    fn drop(&mut self) {
        // Closing the channel unblocks fetchers waiting on a full queue.
        drop(self.receiver.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
