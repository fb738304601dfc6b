//! The mining worker.
//!
//! Runs on its own OS thread and talks to the coordinator exclusively by
//! message passing: a request in, calibration / progress / found events
//! out. The worker holds the secret key and signs every attempt itself,
//! since the signature is part of the hashed document.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use tokio::sync::mpsc::UnboundedSender;

use crate::{
    blockcfg::Block,
    crypto::{KeypairSigner, Signer},
};

/// Hashes spent measuring the raw hash rate before the first round.
const CALIBRATION_TESTS: u64 = 256;
/// Targeted wall-clock length of one hashing round.
const ROUND_DURATION: Duration = Duration::from_millis(200);

/// A mining request.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub block: Block,
    /// Required number of leading zero nibbles.
    pub zeros: usize,
    /// Base58 secret key of the issuer.
    pub secret: String,
    /// Fraction of one CPU the worker may consume, in `(0, 1]`.
    pub cpu: f64,
    pub start_nonce: u64,
}

#[derive(Debug)]
pub enum WorkerEvent {
    /// Sent once, after the initial speed measurement.
    Calibrated {
        tests_per_round: u64,
        tests_per_second: u64,
    },
    /// Sent after every hashing round.
    Progress { nonce: u64 },
    /// The proof was found; the embedded block is signed and solves it.
    Found {
        block: Block,
        pow: String,
        tests_count: u64,
    },
}

/// Handle over a spawned worker thread.
pub struct Worker {
    kill: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker hashing `request` and reporting on `events`.
    pub fn spawn(request: WorkerRequest, events: UnboundedSender<WorkerEvent>) -> Worker {
        let kill = Arc::new(AtomicBool::new(false));
        let kill_flag = kill.clone();
        let handle = thread::Builder::new()
            .name("pow-worker".into())
            .spawn(move || run(request, events, kill_flag))
            .expect("worker thread can be spawned");
        Worker {
            kill,
            handle: Some(handle),
        }
    }

    /// Ask the thread to stop after its current round. Does not block.
    pub fn kill(&mut self) {
        self.kill.store(true, Ordering::Relaxed);
        // the thread exits on its next round boundary; detach it
        drop(self.handle.take());
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill.store(true, Ordering::Relaxed);
    }
}

fn run(request: WorkerRequest, events: UnboundedSender<WorkerEvent>, kill: Arc<AtomicBool>) {
    let signer = match KeypairSigner::from_base58_secret(&request.secret) {
        Ok(signer) => signer,
        Err(err) => {
            tracing::error!(reason = %err, "worker cannot rebuild the signing key");
            return;
        }
    };
    let cpu = request.cpu.clamp(0.01, 1.0);
    let mut block = request.block;
    let mut nonce = request.start_nonce;
    let mut tests_count = 0u64;

    let mut attempt = |block: &mut Block, nonce: u64| -> Option<(String, String)> {
        block.nonce = nonce;
        let signature = signer.sign(block.signed_payload().as_bytes());
        block.signature = signature.clone();
        let hash = block.hash();
        if Block::zero_nibbles(&hash) >= request.zeros {
            Some((hash, signature))
        } else {
            None
        }
    };

    // initial speed measurement
    let started = Instant::now();
    for _ in 0..CALIBRATION_TESTS {
        tests_count += 1;
        if let Some((hash, _)) = attempt(&mut block, nonce) {
            let _ = events.send(WorkerEvent::Found {
                block,
                pow: hash,
                tests_count,
            });
            return;
        }
        nonce += 1;
    }
    let elapsed = started.elapsed().max(Duration::from_micros(1));
    let tests_per_second =
        (CALIBRATION_TESTS as f64 / elapsed.as_secs_f64()).max(1.0) as u64;
    let tests_per_round =
        ((tests_per_second as f64 * cpu * ROUND_DURATION.as_secs_f64()) as u64).max(1);
    let _ = events.send(WorkerEvent::Calibrated {
        tests_per_round,
        tests_per_second,
    });

    loop {
        let round_started = Instant::now();
        for _ in 0..tests_per_round {
            tests_count += 1;
            if let Some((hash, _)) = attempt(&mut block, nonce) {
                let _ = events.send(WorkerEvent::Found {
                    block,
                    pow: hash,
                    tests_count,
                });
                return;
            }
            nonce += 1;
        }
        if events.send(WorkerEvent::Progress { nonce }).is_err() {
            return;
        }
        if kill.load(Ordering::Relaxed) {
            return;
        }
        // hold the observed rate near cpu * measured maximum
        let worked = round_started.elapsed();
        let idle = worked.mul_f64((1.0 - cpu) / cpu);
        if !idle.is_zero() {
            thread::sleep(idle.min(Duration::from_secs(1)));
        }
    }
}
