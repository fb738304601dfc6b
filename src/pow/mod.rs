//! Proof-of-work coordination.
//!
//! At most one worker mines at any time. Proof requests are serialized on
//! an internal slot; a submitted external block cancels the in-flight
//! proof cooperatively: the cancellation takes effect on the first worker
//! progress tick after the initial speed calibration, and every canceller
//! is confirmed once the worker is actually gone. When the worker's nonce
//! runs past a threshold it is killed and respawned where it left off,
//! so its heap stays bounded; callers never observe the recycling.

mod worker;

pub use self::worker::{Worker, WorkerEvent, WorkerRequest};

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::blockcfg::Block;

/// Nonce distance after which the worker is respawned to reset its heap.
const RELEASE_MEMORY_THRESHOLD: u64 = 10_000_000;

/// Coordinator states, as reported by [`PowCoordinator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerPhase {
    Idle,
    /// Delayed start after a self-issued block.
    Waiting,
    Proving,
    Cancelling,
}

/// A snapshot of the worker's activity.
#[derive(Debug, Clone)]
pub struct PowStats {
    pub phase: MinerPhase,
    pub nonce: u64,
    pub tests_per_second: u64,
    pub recycles: u64,
    pub started: Option<Instant>,
}

struct Shared {
    phase: MinerPhase,
    cancels: Vec<oneshot::Sender<()>>,
    waiting: Option<CancellationToken>,
    nonce: u64,
    tests_per_second: u64,
    recycles: u64,
    started: Option<Instant>,
}

pub struct PowCoordinator {
    /// Serializes proof requests: a single mining slot.
    slot: AsyncMutex<()>,
    shared: Mutex<Shared>,
}

impl Default for PowCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PowCoordinator {
    pub fn new() -> Self {
        PowCoordinator {
            slot: AsyncMutex::new(()),
            shared: Mutex::new(Shared {
                phase: MinerPhase::Idle,
                cancels: Vec::new(),
                waiting: None,
                nonce: 0,
                tests_per_second: 0,
                recycles: 0,
                started: None,
            }),
        }
    }

    /// Mine a proof for `block`. Resolves with the signed, solved block, or
    /// `None` when the proof was cancelled by a concurrent submission.
    pub async fn prove(&self, block: Block, secret: String, zeros: usize, cpu: f64) -> Option<Block> {
        let _slot = self.slot.lock().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let request = WorkerRequest {
            block,
            zeros,
            secret,
            cpu,
            start_nonce: 0,
        };
        let mut worker = Worker::spawn(request.clone(), events_tx.clone());
        {
            let mut shared = self.shared.lock().unwrap();
            shared.phase = MinerPhase::Proving;
            shared.nonce = 0;
            shared.started = Some(Instant::now());
        }
        tracing::info!(
            number = request.block.number,
            zeros,
            "proof-of-work started"
        );

        let mut calibrated = false;
        let mut spawn_nonce = 0u64;
        let outcome = loop {
            let event = match events.recv().await {
                Some(event) => event,
                None => break None,
            };
            match event {
                WorkerEvent::Calibrated {
                    tests_per_second, ..
                } => {
                    calibrated = true;
                    self.shared.lock().unwrap().tests_per_second = tests_per_second;
                }
                WorkerEvent::Progress { nonce } => {
                    let cancel_requested = {
                        let mut shared = self.shared.lock().unwrap();
                        shared.nonce = nonce;
                        !shared.cancels.is_empty()
                    };
                    if cancel_requested && calibrated {
                        self.shared.lock().unwrap().phase = MinerPhase::Cancelling;
                        worker.kill();
                        tracing::info!("proof-of-work cancelled");
                        break None;
                    }
                    if nonce > spawn_nonce + RELEASE_MEMORY_THRESHOLD {
                        worker.kill();
                        spawn_nonce = nonce;
                        self.shared.lock().unwrap().recycles += 1;
                        let mut respawn = request.clone();
                        respawn.start_nonce = nonce;
                        worker = Worker::spawn(respawn, events_tx.clone());
                        tracing::debug!(nonce, "worker recycled");
                    }
                }
                WorkerEvent::Found {
                    block,
                    pow,
                    tests_count,
                } => {
                    tracing::info!(number = block.number, pow = %pow, tests_count, "proof found");
                    worker.kill();
                    break Some(block);
                }
            }
        };

        let mut shared = self.shared.lock().unwrap();
        shared.phase = MinerPhase::Idle;
        shared.started = None;
        for confirm in shared.cancels.drain(..) {
            let _ = confirm.send(());
        }
        outcome
    }

    /// Request cancellation of any in-flight proof and wait until it is
    /// effective. Resolves immediately when nothing is mining.
    pub async fn cancel_proof(&self) {
        let pending = {
            let mut shared = self.shared.lock().unwrap();
            if let Some(token) = shared.waiting.take() {
                token.cancel();
            }
            match shared.phase {
                MinerPhase::Proving | MinerPhase::Cancelling => {
                    let (confirm, confirmed) = oneshot::channel();
                    shared.cancels.push(confirm);
                    Some(confirmed)
                }
                MinerPhase::Idle | MinerPhase::Waiting => None,
            }
        };
        if let Some(confirmed) = pending {
            let _ = confirmed.await;
        }
    }

    /// Explicit stop: identical to a cancellation, surfaced as its own
    /// operation.
    pub async fn stop_proof(&self) {
        self.cancel_proof().await;
    }

    /// Sleep `delay` in the `Waiting` phase. Returns `false` when the wait
    /// was broken by a cancellation or an incoming block.
    pub async fn wait_before_mining(&self, delay: Duration) -> bool {
        let token = CancellationToken::new();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.phase = MinerPhase::Waiting;
            shared.waiting = Some(token.clone());
        }
        let completed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = token.cancelled() => false,
        };
        let mut shared = self.shared.lock().unwrap();
        if shared.phase == MinerPhase::Waiting {
            shared.phase = MinerPhase::Idle;
        }
        shared.waiting = None;
        completed
    }

    pub fn stats(&self) -> PowStats {
        let shared = self.shared.lock().unwrap();
        PowStats {
            phase: shared.phase,
            nonce: shared.nonce,
            tests_per_second: shared.tests_per_second,
            recycles: shared.recycles,
            started: shared.started,
        }
    }
}
