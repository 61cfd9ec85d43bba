//! Per-job progress publication.
//!
//! One emitter per running job. Progress events are debounced to at most
//! one per window (default 250 ms) but every batch or job transition is
//! emitted unconditionally. Events go three ways: the gateway's pub/sub
//! channel, an in-process broadcast stream, and a small ring buffer for
//! readers with no live subscription.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::warn;

use halide_model::{
    BatchRecord, BatchTransitionEvent, CatalogEvent, CatalogId, JobId, JobLifecycleEvent,
    JobStatus, ProgressEvent,
};

use crate::database::CatalogGateway;

/// EWMA smoothing factor for the observed throughput.
const RATE_ALPHA: f64 = 0.2;
/// Ring buffer capacity for recent events.
const RING_CAPACITY: usize = 256;
/// In-process broadcast channel depth.
const BROADCAST_CAPACITY: usize = 64;

pub struct ProgressPublisher {
    gateway: Arc<dyn CatalogGateway>,
    channel: String,
    job_id: JobId,
    debounce: Duration,
    state: Mutex<EmitterState>,
    broadcast: broadcast::Sender<CatalogEvent>,
}

struct EmitterState {
    last_emit: Option<Instant>,
    /// Last emitted `(processed, success, error)`; events are strictly
    /// monotonic in this tuple.
    last_tuple: (u64, u64, u64),
    rate_ewma: f64,
    last_sample: Option<(Instant, u64)>,
    ring: VecDeque<CatalogEvent>,
}

impl ProgressPublisher {
    pub fn new(
        gateway: Arc<dyn CatalogGateway>,
        catalog_id: CatalogId,
        job_id: JobId,
        debounce: Duration,
    ) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            gateway,
            channel: Self::channel_for(catalog_id),
            job_id,
            debounce,
            state: Mutex::new(EmitterState {
                last_emit: None,
                last_tuple: (0, 0, 0),
                rate_ewma: 0.0,
                last_sample: None,
                ring: VecDeque::with_capacity(RING_CAPACITY),
            }),
            broadcast,
        }
    }

    /// The catalog-scoped notify channel. Identifier-safe: no hyphens.
    pub fn channel_for(catalog_id: CatalogId) -> String {
        format!("halide_catalog_{}", catalog_id.simple())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.broadcast.subscribe()
    }

    /// Recent events, oldest first, for readers without a subscription.
    pub fn recent(&self) -> Vec<CatalogEvent> {
        self.state.lock().unwrap().ring.iter().cloned().collect()
    }

    /// Whether a non-forced progress emit would currently pass the
    /// debounce. Callers use this to skip computing an expensive snapshot.
    pub fn should_emit(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .last_emit
            .map(|at| at.elapsed() >= self.debounce)
            .unwrap_or(true)
    }

    /// Emit a progress snapshot. Non-forced emits are debounced; forced
    /// emits (batch terminal transitions, job completion) always pass.
    /// Events whose counter tuple does not advance are dropped so the
    /// stream stays strictly monotonic.
    pub async fn publish_progress(
        &self,
        phase: &str,
        processed: u64,
        total: u64,
        success: u64,
        error: u64,
        force: bool,
    ) {
        let event = {
            let mut state = self.state.lock().unwrap();
            let tuple = (processed, success, error);
            if tuple <= state.last_tuple && state.last_emit.is_some() {
                return;
            }
            if !force {
                if let Some(at) = state.last_emit {
                    if at.elapsed() < self.debounce {
                        return;
                    }
                }
            }

            let now = Instant::now();
            if let Some((sample_at, sample_processed)) = state.last_sample {
                let dt = now.duration_since(sample_at).as_secs_f64();
                if dt > 0.0 && processed >= sample_processed {
                    let instantaneous = (processed - sample_processed) as f64 / dt;
                    state.rate_ewma = if state.rate_ewma == 0.0 {
                        instantaneous
                    } else {
                        RATE_ALPHA * instantaneous + (1.0 - RATE_ALPHA) * state.rate_ewma
                    };
                }
            }
            state.last_sample = Some((now, processed));
            state.last_emit = Some(now);
            state.last_tuple = tuple;

            let eta_seconds = if state.rate_ewma > f64::EPSILON && total >= processed {
                Some((total - processed) as f64 / state.rate_ewma)
            } else {
                None
            };

            let event = CatalogEvent::Progress(ProgressEvent {
                job_id: self.job_id.clone(),
                phase: phase.to_string(),
                processed,
                total,
                success,
                error,
                rate_per_sec_ewma: state.rate_ewma,
                eta_seconds,
            });
            Self::push_ring(&mut state.ring, event.clone());
            event
        };

        let _ = self.broadcast.send(event.clone());
        if let Err(e) = self.gateway.publish(&self.channel, &event).await {
            warn!("progress publish failed for job {}: {e}", self.job_id);
        }
    }

    /// Emit a batch terminal transition. Never debounced.
    pub async fn publish_batch(&self, batch: &BatchRecord) {
        let event = CatalogEvent::Batch(BatchTransitionEvent {
            job_id: self.job_id.clone(),
            batch_id: batch.id,
            batch_number: batch.batch_number,
            total_batches: batch.total_batches,
            status: batch.status,
        });
        {
            let mut state = self.state.lock().unwrap();
            Self::push_ring(&mut state.ring, event.clone());
        }
        let _ = self.broadcast.send(event.clone());
        if let Err(e) = self.gateway.publish(&self.channel, &event).await {
            warn!("batch publish failed for job {}: {e}", self.job_id);
        }
    }

    /// Emit a job lifecycle transition. Never debounced.
    pub async fn publish_job(&self, job_type: &str, status: JobStatus, error: Option<String>) {
        let event = CatalogEvent::Job(JobLifecycleEvent {
            job_id: self.job_id.clone(),
            job_type: job_type.to_string(),
            status,
            error,
        });
        {
            let mut state = self.state.lock().unwrap();
            Self::push_ring(&mut state.ring, event.clone());
        }
        let _ = self.broadcast.send(event.clone());
        if let Err(e) = self.gateway.publish(&self.channel, &event).await {
            warn!("job publish failed for job {}: {e}", self.job_id);
        }
    }

    fn push_ring(ring: &mut VecDeque<CatalogEvent>, event: CatalogEvent) {
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event);
    }
}
