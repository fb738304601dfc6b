//! Shared fixtures: a small deterministic community and block builders
//! driving the real assembler, so every crafted block is a block the node
//! itself could have produced.

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ucoin_blockchain::{
    blockcfg::{
        identity_hash, Block, MembershipDoc, MembershipType, PendingCertification,
        PendingIdentity, ProtocolParameters,
    },
    blockchain::ForkManager,
    crypto::{KeypairSigner, Signer},
    dal::Dal,
    generator::{BlockAssembler, NextBlockStrategy},
    service::BlockchainService,
    settings::Settings,
    utils::clock::Clock,
};

pub const CURRENCY: &str = "test_currency";
pub const T0: u64 = 1_700_000_000;

/// Route crate logs through the test harness; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A clock tests can advance.
pub struct StepClock(AtomicU64);

impl StepClock {
    pub fn at(start: u64) -> Arc<StepClock> {
        Arc::new(StepClock(AtomicU64::new(start)))
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for StepClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Member {
    pub signer: KeypairSigner,
    pub uid: String,
}

impl Member {
    pub fn pubkey(&self) -> String {
        self.signer.pubkey()
    }
}

/// Deterministic key seed per uid, stable across communities.
pub fn seed_for(uid: &str) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for (i, byte) in uid.bytes().enumerate() {
        seed[i % 32] ^= byte;
    }
    seed[31] = uid.len() as u8;
    seed
}

pub fn community(uids: &[&str]) -> Vec<Member> {
    uids.iter()
        .map(|uid| Member {
            signer: KeypairSigner::from_seed(seed_for(uid)),
            uid: uid.to_string(),
        })
        .collect()
}

pub fn params() -> ProtocolParameters {
    ProtocolParameters {
        c: 0.1,
        dt: 86_400,
        ud0: 100,
        sig_delay: 1_000_000,
        sig_validity: 100_000_000,
        sig_qty: 2,
        sig_wot: 2,
        ms_validity: 100_000_000,
        step_max: 3,
        median_time_blocks: 3,
        avg_gen_time: 60,
        dt_diff_eval: 1_000,
        blocks_rot: 10,
        // tests chain many blocks from few issuers; the rotation
        // surcharge math is covered by the rules unit tests
        percent_rot: 0.0,
    }
}

/// Like [`manager`] but with explicit protocol parameters.
pub fn manager_with(
    members: &[Member],
    window: u64,
    now: u64,
    params: ProtocolParameters,
) -> ForkManager {
    init_tracing();
    let mut dal = Dal::new(params);
    seed_pools(&mut dal, members, now);
    ForkManager::new(dal, window)
}

pub fn settings(window: u64, params: ProtocolParameters) -> Settings {
    let mut settings = Settings::new(CURRENCY);
    settings.branches_window_size = window;
    settings.params = params;
    settings
}

/// Seed the pending pools with every member's identity, an IN membership
/// and the full mesh of cross certifications.
pub fn seed_pools(dal: &mut Dal, members: &[Member], now: u64) {
    for member in members {
        dal.save_pending_identity(PendingIdentity {
            pubkey: member.pubkey(),
            uid: member.uid.clone(),
            time: now,
            signature: "00".repeat(64),
        });
        dal.save_pending_membership(MembershipDoc {
            issuer: member.pubkey(),
            uid: member.uid.clone(),
            certts: now,
            number: 0,
            membership: MembershipType::In,
            signature: "00".repeat(64),
        });
    }
    for from in members {
        for to in members {
            if from.uid == to.uid {
                continue;
            }
            dal.register_new_certification(PendingCertification {
                from: from.pubkey(),
                target: identity_hash(&to.uid, now, &to.pubkey()),
                block_number: 0,
                signature: "00".repeat(64),
                linked: false,
            });
        }
    }
}

pub fn sign(block: &mut Block, member: &Member) {
    block.signature = member.signer.sign(block.signed_payload().as_bytes());
}

/// Assemble and sign the root block founding the whole community.
pub fn signed_root(dal: &Dal, clock: &dyn Clock, members: &[Member], issuer: &Member) -> Block {
    let assembler = BlockAssembler::new(dal, clock, CURRENCY, 0);
    let uids = members.iter().map(|m| m.uid.clone()).collect();
    let mut block = assembler
        .generate_manual_root(&issuer.pubkey(), uids)
        .expect("root assembly succeeds on an empty chain")
        .block;
    sign(&mut block, issuer);
    block
}

/// Assemble and sign the next block on the given view.
pub fn signed_next(dal: &Dal, clock: &dyn Clock, issuer: &Member) -> Block {
    let assembler = BlockAssembler::new(dal, clock, CURRENCY, 0);
    let mut block = assembler
        .generate_next(&issuer.pubkey(), &NextBlockStrategy)
        .expect("assembly succeeds")
        .block;
    sign(&mut block, issuer);
    block
}

/// The view generation reads when extending the branch ending at `parent`
/// (`None` for the working view): the branch state plus the live pools.
pub fn generation_dal(manager: &ForkManager, parent: Option<(u64, &str)>) -> Dal {
    let mut view = match parent {
        Some((number, hash)) => manager
            .core(number, hash)
            .expect("parent core exists")
            .context()
            .dal()
            .clone(),
        None => manager.working_context().dal().clone(),
    };
    view.absorb_pending(manager.confirmed().dal());
    view
}

/// A fork manager with seeded pools, before any block.
pub fn manager(members: &[Member], window: u64, now: u64) -> ForkManager {
    init_tracing();
    let mut dal = Dal::new(params());
    seed_pools(&mut dal, members, now);
    ForkManager::new(dal, window)
}

/// A service over a freshly seeded state, signing as `members[0]`.
pub fn service(
    members: &[Member],
    window: u64,
    clock: Arc<StepClock>,
    params: ProtocolParameters,
) -> BlockchainService {
    init_tracing();
    let mut dal = Dal::new(params.clone());
    seed_pools(&mut dal, members, clock.now());
    let signer = KeypairSigner::from_seed(seed_for(&members[0].uid));
    BlockchainService::new(settings(window, params), dal, clock, Some(signer))
}
