//! Proof-of-work coordination: mining, cooperative cancellation, stats.

mod common;

use std::time::Duration;

use common::*;
use ucoin_blockchain::{
    blockcfg::Block,
    crypto,
    generator::{BlockAssembler, NextBlockStrategy},
    pow::{MinerPhase, PowCoordinator},
};

#[tokio::test]
async fn proving_signs_and_solves_the_block() {
    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut manager = manager(&members, 0, T0);

    let root = signed_root(manager.confirmed().dal(), &*clock, &members, &members[0]);
    manager.submit(&root, true).unwrap();

    clock.advance(30);
    let view = manager.confirmed().dal().clone();
    let assembler = BlockAssembler::new(&view, &*clock, CURRENCY, 0);
    let candidate = assembler
        .generate_next(&members[0].pubkey(), &NextBlockStrategy)
        .unwrap()
        .block;

    let coordinator = PowCoordinator::new();
    let proved = coordinator
        .prove(candidate, members[0].signer.secret_base58(), 1, 0.8)
        .await
        .expect("one zero nibble is reachable");

    let hash = proved.hash();
    assert!(Block::zero_nibbles(&hash) >= 1);
    assert!(crypto::verify(
        &proved.issuer,
        proved.signed_payload().as_bytes(),
        &proved.signature
    )
    .unwrap());

    manager.submit(&proved, true).unwrap();
    assert_eq!(manager.current().unwrap().number, 1);
    assert_eq!(coordinator.stats().phase, MinerPhase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incoming_block_cancels_the_proof_in_flight() {
    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let service = service(&members, 0, clock.clone(), params());

    let uids = members.iter().map(|m| m.uid.clone()).collect();
    let root = service.generate_manual_root(uids).await.unwrap();
    let root = service.make_next_block(Some(root)).await.unwrap();
    service.submit_block(&root, true).await.unwrap();

    clock.advance(30);
    let candidate = service.generate_next().await.unwrap();

    // an unreachable difficulty keeps the worker busy until cancelled
    let miner = service.clone();
    let proving = tokio::spawn(async move { miner.prove(candidate, 9).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let external = service.make_next_block(None).await.unwrap();
    let admission = service.submit_block(&external, true).await.unwrap();
    assert_eq!(admission.stamp.number, 1);

    let proved = tokio::time::timeout(Duration::from_secs(5), proving)
        .await
        .expect("the proof resolves shortly after the cancellation")
        .unwrap()
        .unwrap();
    assert!(proved.is_none());

    let current = service.current().await.unwrap();
    assert_eq!(current.number, 1);
    assert_eq!(current.hash(), external.hash());
    assert_eq!(service.pow_process_stats().phase, MinerPhase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_loop_mines_and_extends_the_chain() {
    use ucoin_blockchain::{
        crypto::KeypairSigner, dal::Dal, service::BlockchainService,
    };

    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut dal = Dal::new(params());
    seed_pools(&mut dal, &members, T0);
    let mut node_settings = settings(0, params());
    node_settings.participate = true;
    let service = BlockchainService::new(
        node_settings,
        dal,
        clock.clone(),
        Some(KeypairSigner::from_seed(seed_for("alice"))),
    );

    let uids = members.iter().map(|m| m.uid.clone()).collect();
    let root = service.generate_manual_root(uids).await.unwrap();
    let root = service.make_next_block(Some(root)).await.unwrap();
    service.submit_block(&root, true).await.unwrap();

    service.start_generation();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if service.current().await.map_or(0, |b| b.number) >= 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the generation loop made no progress"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    service.stop_generation().await;
    assert!(service.current().await.unwrap().number >= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_loop_bootstraps_an_empty_chain() {
    use ucoin_blockchain::{
        crypto::KeypairSigner, dal::Dal, service::BlockchainService,
    };

    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut dal = Dal::new(params());
    seed_pools(&mut dal, &members, T0);
    let mut node_settings = settings(0, params());
    node_settings.participate = true;
    node_settings.root_uids = members.iter().map(|m| m.uid.clone()).collect();
    let service = BlockchainService::new(
        node_settings,
        dal,
        clock.clone(),
        Some(KeypairSigner::from_seed(seed_for("alice"))),
    );

    // no block was ever submitted: the loop must found the chain itself
    service.start_generation();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if service.current().await.map_or(false, |b| b.number >= 1) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "the generation loop never bootstrapped the root"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    service.stop_generation().await;

    let root = service.promoted(0).await.unwrap();
    assert_eq!(root.number, 0);
    assert_eq!(root.members_count, 3);
    assert_eq!(root.joiners.len(), 3);
}

#[tokio::test]
async fn cancelling_an_idle_coordinator_returns_immediately() {
    let coordinator = PowCoordinator::new();
    tokio::time::timeout(Duration::from_millis(100), coordinator.cancel_proof())
        .await
        .expect("nothing to cancel");
    tokio::time::timeout(Duration::from_millis(100), coordinator.stop_proof())
        .await
        .expect("nothing to stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_breaks_the_mining_delay() {
    let coordinator = std::sync::Arc::new(PowCoordinator::new());
    let waiting = coordinator.clone();
    let wait = tokio::spawn(async move {
        waiting.wait_before_mining(Duration::from_secs(30)).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.stats().phase, MinerPhase::Waiting);

    coordinator.cancel_proof().await;
    let completed = tokio::time::timeout(Duration::from_secs(1), wait)
        .await
        .expect("the wait breaks on cancellation")
        .unwrap();
    assert!(!completed);
    assert_eq!(coordinator.stats().phase, MinerPhase::Idle);
}
