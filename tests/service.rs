//! Service-level flows: transactions, statistics, transaction records.

mod common;

use common::*;
use ucoin_blockchain::{
    blockcfg::{SourceKey, Transaction, TxInput, TxOutput},
    crypto::Signer,
    service::BlockchainService,
};

async fn grow_until_dividend(service: &BlockchainService, clock: &StepClock) -> u64 {
    let uids = vec!["alice".into(), "bob".into(), "carol".into()];
    let root = service.generate_manual_root(uids).await.unwrap();
    let root = service.make_next_block(Some(root)).await.unwrap();
    service.submit_block(&root, true).await.unwrap();

    loop {
        clock.advance(200);
        let block = service.generate_next().await.unwrap();
        let block = service.make_next_block(Some(block)).await.unwrap();
        let admission = service.submit_block(&block, true).await.unwrap();
        if block.dividend.is_some() {
            return admission.stamp.number;
        }
        assert!(admission.stamp.number < 10, "dividend never scheduled");
    }
}

fn dividend_transfer(members: &[Member], ud_block: u64) -> Transaction {
    let alice = &members[0];
    let bob = &members[1];
    let mut transaction = Transaction {
        issuers: vec![alice.pubkey()],
        inputs: vec![TxInput {
            source: SourceKey::Dividend {
                pubkey: alice.pubkey(),
                block: ud_block,
            },
            amount: 100,
        }],
        outputs: vec![
            TxOutput {
                pubkey: bob.pubkey(),
                amount: 60,
            },
            TxOutput {
                pubkey: alice.pubkey(),
                amount: 40,
            },
        ],
        comment: Some("first transfer".into()),
        signatures: vec![],
    };
    transaction.signatures = vec![alice
        .signer
        .sign(transaction.signed_payload().as_bytes())];
    transaction
}

#[tokio::test]
async fn transactions_flow_through_generation_and_eviction() {
    let members = community(&["alice", "bob", "carol"]);
    let mut params = params();
    params.dt = 100;
    let clock = StepClock::at(T0);
    let service = service(&members, 0, clock.clone(), params);

    let ud_block = grow_until_dividend(&service, &clock).await;
    let transaction = dividend_transfer(&members, ud_block);
    service.pend_transaction(transaction.clone()).await;

    clock.advance(200);
    let block = service.generate_next().await.unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].hash(), transaction.hash());
    let block = service.make_next_block(Some(block)).await.unwrap();
    service.submit_block(&block, true).await.unwrap();

    // the same transaction now spends a consumed source: generation
    // evicts it instead of carrying it
    service.pend_transaction(transaction).await;
    clock.advance(200);
    let block = service.generate_next().await.unwrap();
    assert!(block.transactions.is_empty());
    let block = service.generate_next().await.unwrap();
    assert!(block.transactions.is_empty());
}

#[tokio::test]
async fn stats_and_records_cover_the_confirmed_chain() {
    let members = community(&["alice", "bob", "carol"]);
    let mut params = params();
    params.dt = 100;
    let clock = StepClock::at(T0);
    let service = service(&members, 0, clock.clone(), params);

    let ud_block = grow_until_dividend(&service, &clock).await;
    let transaction = dividend_transfer(&members, ud_block);
    service.pend_transaction(transaction.clone()).await;
    clock.advance(200);
    let block = service.generate_next().await.unwrap();
    let block = service.make_next_block(Some(block)).await.unwrap();
    let tx_block = service.submit_block(&block, true).await.unwrap().stamp.number;

    service.add_stat_computing().await;
    let newcomers = service.stat("newcomers").await;
    assert_eq!(newcomers.blocks, vec![0]);
    let ud = service.stat("ud").await;
    assert!(ud.blocks.contains(&ud_block));
    let tx = service.stat("tx").await;
    assert_eq!(tx.blocks, vec![tx_block]);
    assert_eq!(tx.last_parsed_block, Some(tx_block));

    // recomputation is incremental: another pass adds nothing
    service.add_stat_computing().await;
    assert_eq!(service.stat("tx").await.blocks, vec![tx_block]);

    service.recompute_tx_records().await.unwrap();
    let sent = service.tx_records(&members[0].pubkey()).await;
    assert!(sent.iter().any(|r| r.sent && r.amount == 100));
    let received = service.tx_records(&members[1].pubkey()).await;
    assert_eq!(received.len(), 1);
    assert!(!received[0].sent);
    assert_eq!(received[0].amount, 60);
}

#[tokio::test]
async fn block_queue_feeds_the_submission_pipeline() {
    use ucoin_blockchain::{
        blockchain::Process,
        intercom::{unary_reply, BlockMsg},
        utils::async_msg,
    };

    let members = community(&["alice", "bob", "carol"]);
    let clock = StepClock::at(T0);
    let service = service(&members, 0, clock.clone(), params());

    let (mut messages, queue) = async_msg::channel(8);
    tokio::spawn(Process::new(service.clone()).start(queue));

    let uids = vec!["alice".into(), "bob".into(), "carol".into()];
    let root = service.generate_manual_root(uids).await.unwrap();
    let root = service.make_next_block(Some(root)).await.unwrap();

    let (reply, outcome) = unary_reply();
    messages
        .send(BlockMsg::External {
            block: Box::new(root.clone()),
            with_check: true,
            reply,
        })
        .await
        .unwrap();
    let admission = outcome.await.unwrap();
    assert_eq!(admission.stamp.number, 0);

    // resubmission of the same block surfaces the structured rejection
    let (reply, outcome) = unary_reply();
    messages
        .send(BlockMsg::External {
            block: Box::new(root),
            with_check: true,
            reply,
        })
        .await
        .unwrap();
    assert!(outcome.await.is_err());
    assert_eq!(service.current().await.unwrap().number, 0);
}

#[tokio::test]
async fn certification_expiry_frontier_moves_with_median_time() {
    let members = community(&["alice", "bob", "carol"]);
    let mut params = params();
    params.sig_validity = 500;
    params.sig_delay = 0;
    let clock = StepClock::at(T0);
    let service = service(&members, 0, clock.clone(), params);

    let uids = vec!["alice".into(), "bob".into(), "carol".into()];
    let root = service.generate_manual_root(uids).await.unwrap();
    let root = service.make_next_block(Some(root)).await.unwrap();
    service.submit_block(&root, true).await.unwrap();
    assert_eq!(service.certifications_excluding_block().await, None);

    for _ in 0..4 {
        clock.advance(400);
        let block = service.generate_next().await.unwrap();
        let block = service.make_next_block(Some(block)).await.unwrap();
        service.submit_block(&block, true).await.unwrap();
    }

    // by now the median time is far past the root's validity window
    let frontier = service.certifications_excluding_block().await;
    assert!(frontier.is_some());

    // expired links also starved every member below sig_qty, so the
    // chain excluded them along the way
    assert_eq!(service.current().await.unwrap().members_count, 0);
}
