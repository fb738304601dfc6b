//! Block assembly: manual root, iterated newcomer selection, dividends.

mod common;

use common::*;
use ucoin_blockchain::{
    blockcfg::{
        identity_hash, MembershipDoc, MembershipType, PendingCertification, PendingIdentity,
    },
    dal::Dal,
    generator::{BlockAssembler, NextBlockStrategy},
};

#[test]
fn manual_root_founds_the_community() {
    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut dal = Dal::new(params());
    seed_pools(&mut dal, &members, T0);

    let assembler = BlockAssembler::new(&dal, &*clock, CURRENCY, 1_000);
    let uids = members.iter().map(|m| m.uid.clone()).collect();
    let block = assembler
        .generate_manual_root(&members[0].pubkey(), uids)
        .unwrap()
        .block;

    assert_eq!(block.number, 0);
    assert_eq!(block.members_count, 3);
    assert_eq!(block.identities.len(), 3);
    assert_eq!(block.joiners.len(), 3);
    assert_eq!(block.certifications.len(), 6);
    assert_eq!(block.median_time, T0 - 1_000);
    assert_eq!(block.pow_min, 0);
    assert!(block.dividend.is_none());
    assert!(block.parameters.is_some());
}

#[test]
fn manual_root_with_too_small_a_selection_keeps_nobody() {
    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut dal = Dal::new(params());
    seed_pools(&mut dal, &members, T0);

    // two founders cannot reach sig_qty = 2 certifications each
    let assembler = BlockAssembler::new(&dal, &*clock, CURRENCY, 0);
    let block = assembler
        .generate_manual_root(
            &members[0].pubkey(),
            vec!["alice".to_string(), "bob".to_string()],
        )
        .unwrap()
        .block;
    assert!(block.joiners.is_empty());
    assert_eq!(block.members_count, 0);
}

#[test]
fn assembled_root_passes_full_validation() {
    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut manager = manager(&members, 0, T0);

    let root = signed_root(manager.confirmed().dal(), &*clock, &members, &members[0]);
    manager.submit(&root, true).unwrap();
    assert_eq!(manager.current().unwrap().number, 0);
}

fn seed_joiner(dal: &mut Dal, joiner: &Member, certifiers: &[&Member], now: u64) {
    dal.save_pending_identity(PendingIdentity {
        pubkey: joiner.pubkey(),
        uid: joiner.uid.clone(),
        time: now,
        signature: "00".repeat(64),
    });
    dal.save_pending_membership(MembershipDoc {
        issuer: joiner.pubkey(),
        uid: joiner.uid.clone(),
        certts: now,
        number: 0,
        membership: MembershipType::In,
        signature: "00".repeat(64),
    });
    for certifier in certifiers {
        dal.register_new_certification(PendingCertification {
            from: certifier.pubkey(),
            target: identity_hash(&joiner.uid, now, &joiner.pubkey()),
            block_number: 0,
            signature: "00".repeat(64),
            linked: false,
        });
    }
}

#[test]
fn iterated_selection_converges_on_the_stable_set() {
    let founders = community(&["m1", "m2", "m3"]);
    let mut params = params();
    params.sig_qty = 1;
    params.sig_wot = 2;
    params.step_max = 2;
    let clock = StepClock::at(T0);
    let mut manager = manager_with(&founders, 0, T0, params);

    let root = signed_root(manager.confirmed().dal(), &*clock, &founders, &founders[0]);
    manager.submit(&root, true).unwrap();

    // j2 is certified by j4 only; j1, j3, j4 each by one founder
    let joiners = community(&["j1", "j2", "j3", "j4"]);
    clock.advance(60);
    let now = T0 + 60;
    {
        let dal = manager.confirmed_mut().dal_mut();
        seed_joiner(dal, &joiners[0], &[&founders[0]], now);
        seed_joiner(dal, &joiners[1], &[&joiners[3]], now);
        seed_joiner(dal, &joiners[2], &[&founders[1]], now);
        seed_joiner(dal, &joiners[3], &[&founders[2]], now);
    }

    let view = manager.confirmed().dal().clone();
    let assembler = BlockAssembler::new(&view, &*clock, CURRENCY, 0);
    let block = assembler
        .generate_next(&founders[0].pubkey(), &NextBlockStrategy)
        .unwrap()
        .block;

    let mut selected: Vec<&str> = block.joiners.iter().map(|m| m.uid.as_str()).collect();
    selected.sort_unstable();
    assert_eq!(selected, vec!["j1", "j3", "j4"]);
    assert_eq!(block.identities.len(), 3);
    assert_eq!(block.members_count, 6);

    // the assembled block is admissible as-is
    let mut block = block;
    sign(&mut block, &founders[0]);
    manager.submit(&block, true).unwrap();
    assert!(manager.confirmed().dal().is_member(&joiners[0].pubkey()));
    assert!(!manager.confirmed().dal().is_member(&joiners[1].pubkey()));
}

#[test]
fn dividend_follows_the_schedule() {
    let members = community(&["alice", "bob", "carol"]);
    let mut params = params();
    params.dt = 100;
    let clock = StepClock::at(T0);
    let mut manager = manager_with(&members, 0, T0, params);

    let root = signed_root(manager.confirmed().dal(), &*clock, &members, &members[0]);
    manager.submit(&root, true).unwrap();

    let mut dividends = Vec::new();
    for i in 0..4 {
        clock.advance(200);
        let view = manager.confirmed().dal().clone();
        let block = signed_next(&view, &*clock, &members[i % 3]);
        manager.submit(&block, true).unwrap();
        dividends.push((block.number, block.dividend, block.ud_time, block.monetary_mass));
    }

    // median time first reaches T0 + dt at the third block
    assert_eq!(dividends[0].1, None);
    assert_eq!(dividends[1].1, None);
    assert_eq!(dividends[2].1, Some(100));
    assert_eq!(dividends[2].2, Some(T0 + 100));
    assert_eq!(dividends[2].3, 300);

    // the next dividend keeps the floor of the previous one
    assert_eq!(dividends[3].1, Some(100));
    assert_eq!(dividends[3].3, 600);

    let dal = manager.confirmed().dal();
    assert_eq!(dal.last_ud().unwrap().amount, 100);
    assert_eq!(dal.monetary_mass(), 600);
}

#[test]
fn empty_next_block_carries_no_documents() {
    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let mut manager = manager(&members, 0, T0);

    let root = signed_root(manager.confirmed().dal(), &*clock, &members, &members[0]);
    manager.submit(&root, true).unwrap();

    clock.advance(30);
    let view = manager.confirmed().dal().clone();
    let assembler = BlockAssembler::new(&view, &*clock, CURRENCY, 0);
    let mut block = assembler.generate_empty(&members[1].pubkey()).unwrap().block;
    sign(&mut block, &members[1]);

    assert!(block.identities.is_empty());
    assert!(block.joiners.is_empty());
    assert!(block.certifications.is_empty());
    assert!(block.transactions.is_empty());
    manager.submit(&block, true).unwrap();
}

#[test]
fn requirements_report_missing_certifications() {
    let founders = community(&["m1", "m2", "m3"]);
    let clock = StepClock::at(T0);
    let mut manager = manager(&founders, 0, T0);

    let root = signed_root(manager.confirmed().dal(), &*clock, &founders, &founders[0]);
    manager.submit(&root, true).unwrap();

    let extended = community(&["m1", "m2", "m3", "dave"]);
    let joiner = &extended[3];
    clock.advance(60);
    let now = T0 + 60;
    seed_joiner(
        manager.confirmed_mut().dal_mut(),
        joiner,
        &[&founders[0]],
        now,
    );

    let view = manager.confirmed().dal().clone();
    let assembler = BlockAssembler::new(&view, &*clock, CURRENCY, 0);
    let identity = PendingIdentity {
        pubkey: joiner.pubkey(),
        uid: joiner.uid.clone(),
        time: now,
        signature: "00".repeat(64),
    };
    let requirements = assembler.requirements_of_identity(&identity);

    assert_eq!(requirements.certification_count, 1);
    assert_eq!(requirements.required_certifications, 2);
    assert!(requirements.membership_pending);
    // with sig_qty unmet the joiner is also left out of generation
    let block = assembler
        .generate_next(&founders[0].pubkey(), &NextBlockStrategy)
        .unwrap()
        .block;
    assert!(block.joiners.is_empty());
}
