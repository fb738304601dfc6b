//! The blockchain service facade.
//!
//! Wires the fork manager, the block assembler and the proof-of-work
//! coordinator behind the public operations, with one serialized slot per
//! concern: block submissions, proof transitions and statistics each go
//! through their own queue.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use thiserror::Error as ThisError;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::{
    blockcfg::{Block, BlockStamp, MembershipDoc, Peer, PendingCertification, PendingIdentity, Transaction},
    blockchain::{self, Admission, ForkManager},
    crypto::{KeypairSigner, Signer},
    dal::Dal,
    generator::{
        self, Assembled, BlockAssembler, GenerationStrategy, IdentityRequirements,
        NextBlockStrategy,
    },
    pow::{PowCoordinator, PowStats},
    rules,
    settings::Settings,
    stats,
    utils::clock::SharedClock,
};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] blockchain::Error),
    #[error(transparent)]
    Generator(#[from] generator::Error),
    #[error("operation requires a signing key")]
    NoSigner,
}

impl From<rules::Error> for Error {
    fn from(err: rules::Error) -> Self {
        Error::Chain(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct Inner {
    settings: Settings,
    clock: SharedClock,
    signer: Option<KeypairSigner>,
    /// The block queue: one submission in flight at a time.
    chain: AsyncMutex<ForkManager>,
    pow: PowCoordinator,
    /// Serializes statistics recomputation.
    stat_queue: AsyncMutex<()>,
    tip_events: watch::Sender<u64>,
    generation: StdMutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct BlockchainService {
    inner: Arc<Inner>,
}

impl BlockchainService {
    pub fn new(
        settings: Settings,
        dal: Dal,
        clock: SharedClock,
        signer: Option<KeypairSigner>,
    ) -> Self {
        let window = settings.branches_window_size;
        let (tip_events, _) = watch::channel(0);
        BlockchainService {
            inner: Arc::new(Inner {
                settings,
                clock,
                signer,
                chain: AsyncMutex::new(ForkManager::new(dal, window)),
                pow: PowCoordinator::new(),
                stat_queue: AsyncMutex::new(()),
                tip_events,
                generation: StdMutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Submit a block received from the outside. Cancels any in-flight
    /// proof once the block is admitted.
    pub async fn submit_block(&self, block: &Block, with_check: bool) -> Result<Admission> {
        let admission = {
            let mut chain = self.inner.chain.lock().await;
            chain.submit(block, with_check)?
        };
        let _ = self.inner.tip_events.send(admission.stamp.number);
        self.inner.pow.cancel_proof().await;
        Ok(admission)
    }

    /// Submit a block this node just mined: same pipeline, but the proof
    /// that produced it is not cancelled.
    pub async fn submit_mined(&self, block: &Block) -> Result<Admission> {
        let admission = {
            let mut chain = self.inner.chain.lock().await;
            chain.submit(block, true)?
        };
        let _ = self.inner.tip_events.send(admission.stamp.number);
        Ok(admission)
    }

    /// Validate a block against the working view without applying it.
    pub async fn check_block(&self, block: &Block) -> Result<()> {
        let chain = self.inner.chain.lock().await;
        chain.working_context().check_block(block, true)?;
        Ok(())
    }

    /// The current block of the working view (main fork, or confirmed tip
    /// when no fork exists).
    pub async fn current(&self) -> Option<Block> {
        let chain = self.inner.chain.lock().await;
        chain.current().cloned()
    }

    /// The confirmed block at the given height.
    pub async fn promoted(&self, number: u64) -> Result<Block> {
        let chain = self.inner.chain.lock().await;
        Ok(chain.confirmed().get_promoted(number)?.clone())
    }

    /// Stamps of the leaf cores.
    pub async fn branches(&self) -> Vec<BlockStamp> {
        let chain = self.inner.chain.lock().await;
        chain.branches().iter().map(|core| core.stamp()).collect()
    }

    /// The working view enriched with the main pending pools, the snapshot
    /// generation reads from.
    async fn generation_view(&self) -> Dal {
        let chain = self.inner.chain.lock().await;
        let mut view = chain.working_context().dal().clone();
        view.absorb_pending(chain.confirmed().dal());
        view
    }

    async fn generate_with(&self, strategy: &dyn GenerationStrategy) -> Result<Block> {
        let issuer = self.issuer()?;
        let view = self.generation_view().await;
        let assembler = BlockAssembler::new(
            &view,
            &*self.inner.clock,
            &self.inner.settings.currency,
            self.inner.settings.rootoffset,
        );
        let Assembled { block, dropped_txs } = assembler.generate_next(&issuer, strategy)?;
        self.evict_transactions(&dropped_txs).await;
        Ok(block)
    }

    /// Assemble the next candidate block from the pending pools.
    pub async fn generate_next(&self) -> Result<Block> {
        self.generate_with(&NextBlockStrategy).await
    }

    /// Assemble a next block carrying no new document.
    pub async fn generate_empty_next_block(&self) -> Result<Block> {
        let issuer = self.issuer()?;
        let view = self.generation_view().await;
        let assembler = BlockAssembler::new(
            &view,
            &*self.inner.clock,
            &self.inner.settings.currency,
            self.inner.settings.rootoffset,
        );
        Ok(assembler.generate_empty(&issuer)?.block)
    }

    /// Assemble the root block from the operator's uid selection.
    pub async fn generate_manual_root(&self, selected_uids: Vec<String>) -> Result<Block> {
        let issuer = self.issuer()?;
        let view = self.generation_view().await;
        let assembler = BlockAssembler::new(
            &view,
            &*self.inner.clock,
            &self.inner.settings.currency,
            self.inner.settings.rootoffset,
        );
        let Assembled { block, .. } = assembler.generate_manual_root(&issuer, selected_uids)?;
        Ok(block)
    }

    /// Produce a signed candidate: the given block, or a freshly generated
    /// one. The proof of work is left to [`BlockchainService::prove`].
    pub async fn make_next_block(&self, block: Option<Block>) -> Result<Block> {
        let mut block = match block {
            Some(block) => block,
            None => self.generate_next().await?,
        };
        let signer = self.inner.signer.as_ref().ok_or(Error::NoSigner)?;
        block.issuer = signer.pubkey();
        block.signature = signer.sign(block.signed_payload().as_bytes());
        Ok(block)
    }

    /// Mine a proof for the block at the given zero level. Resolves with
    /// `None` when cancelled by an incoming block.
    pub async fn prove(&self, block: Block, nb_zeros: usize) -> Result<Option<Block>> {
        let signer = self.inner.signer.as_ref().ok_or(Error::NoSigner)?;
        Ok(self
            .inner
            .pow
            .prove(
                block,
                signer.secret_base58(),
                nb_zeros,
                self.inner.settings.cpu,
            )
            .await)
    }

    /// Stop any in-flight proof.
    pub async fn stop_proof(&self) {
        self.inner.pow.stop_proof().await;
    }

    pub fn pow_process_stats(&self) -> PowStats {
        self.inner.pow.stats()
    }

    /// Start the mining loop. Returns immediately; the loop runs until
    /// [`BlockchainService::stop_generation`].
    pub fn start_generation(&self) {
        let mut slot = self.inner.generation.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        let service = self.clone();
        tokio::spawn(async move {
            service.generation_loop(token).await;
        });
    }

    pub async fn stop_generation(&self) {
        let token = self.inner.generation.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
        }
        self.inner.pow.stop_proof().await;
    }

    async fn generation_loop(&self, shutdown: CancellationToken) {
        let mut tip_rx = self.inner.tip_events.subscribe();
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let progressed = match self.try_generation_round().await {
                Ok(progressed) => progressed,
                Err(err) => {
                    tracing::warn!(reason = %err, "generation round failed");
                    false
                }
            };
            if !progressed {
                // conditions not met: wait for the chain to move before
                // retrying
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = tip_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One attempt at mining the next block. `Ok(false)` means the
    /// preconditions are not met and the loop should wait for the chain
    /// to move.
    async fn try_generation_round(&self) -> Result<bool> {
        if !self.inner.settings.participate {
            return Ok(false);
        }
        let signer = match self.inner.signer.as_ref() {
            Some(signer) => signer,
            None => return Ok(false),
        };
        let pubkey = signer.pubkey();

        let (current, trial, member) = {
            let chain = self.inner.chain.lock().await;
            let context = chain.working_context();
            (
                context.current().cloned(),
                context.trial_level(&pubkey),
                context.dal().is_member(&pubkey),
            )
        };
        let current = match current {
            Some(current) => current,
            // no tip yet: the loop may still bootstrap the root block
            None => return self.try_root_round(&pubkey, trial).await,
        };
        if !member {
            return Ok(false);
        }

        if current.issuer == pubkey && self.inner.settings.pow_delay > 0 {
            let waited = self
                .inner
                .pow
                .wait_before_mining(Duration::from_secs(self.inner.settings.pow_delay))
                .await;
            if !waited {
                // a block arrived during the delay; reevaluate everything
                return Ok(true);
            }
        }

        if trial > current.pow_min + 1 {
            tracing::debug!(trial, pow_min = current.pow_min, "personal trial too high, deferring");
            return Ok(false);
        }

        let candidate = self.generate_next().await?;
        let proved = self.prove(candidate, trial).await?;
        match proved {
            Some(block) => {
                if let Err(err) = self.submit_mined(&block).await {
                    tracing::warn!(reason = %err, "mined block rejected");
                }
                Ok(true)
            }
            None => {
                tracing::debug!("proof cancelled by an incoming block");
                Ok(true)
            }
        }
    }

    /// Mine the root block from the operator's standing uid selection.
    /// `Ok(false)` when no selection is configured or the selection does
    /// not admit this node yet.
    async fn try_root_round(&self, pubkey: &str, trial: usize) -> Result<bool> {
        let selection = self.inner.settings.root_uids.clone();
        if selection.is_empty() {
            return Ok(false);
        }
        let candidate = self.generate_manual_root(selection).await?;
        if !candidate.joiners.iter().any(|j| j.issuer == pubkey) {
            tracing::debug!("root selection does not admit this node yet, deferring");
            return Ok(false);
        }
        match self.prove(candidate, trial).await? {
            Some(block) => {
                if let Err(err) = self.submit_mined(&block).await {
                    tracing::warn!(reason = %err, "mined root block rejected");
                }
                Ok(true)
            }
            None => {
                tracing::debug!("root proof cancelled by an incoming block");
                Ok(true)
            }
        }
    }

    /// What a pending identity still lacks before it can join.
    pub async fn requirements_of_identity(
        &self,
        identity: &PendingIdentity,
    ) -> IdentityRequirements {
        let view = self.generation_view().await;
        let assembler = BlockAssembler::new(
            &view,
            &*self.inner.clock,
            &self.inner.settings.currency,
            self.inner.settings.rootoffset,
        );
        assembler.requirements_of_identity(identity)
    }

    /// Recompute every counter statistic over the confirmed chain.
    pub async fn add_stat_computing(&self) {
        let _slot = self.inner.stat_queue.lock().await;
        let mut chain = self.inner.chain.lock().await;
        stats::compute(chain.confirmed_mut().dal_mut());
    }

    /// Rebuild the per-pubkey transaction records from the confirmed
    /// chain, exporting them as files when a data directory is set.
    pub async fn recompute_tx_records(&self) -> Result<()> {
        let _slot = self.inner.stat_queue.lock().await;
        let mut chain = self.inner.chain.lock().await;
        let dal = chain.confirmed_mut().dal_mut();
        dal.drop_tx_records();
        let mut entries = Vec::new();
        let top = dal.current_block().map(|b| b.number);
        if let Some(top) = top {
            for number in 0..=top {
                if let Some(block) = dal.get_block_or_null(number) {
                    for transaction in &block.transactions {
                        let hash = transaction.hash();
                        for issuer in &transaction.issuers {
                            entries.push((
                                issuer.clone(),
                                crate::dal::TxRecord {
                                    block_number: number,
                                    tx_hash: hash.clone(),
                                    sent: true,
                                    amount: transaction.input_sum(),
                                },
                            ));
                        }
                        for output in &transaction.outputs {
                            entries.push((
                                output.pubkey.clone(),
                                crate::dal::TxRecord {
                                    block_number: number,
                                    tx_hash: hash.clone(),
                                    sent: false,
                                    amount: output.amount,
                                },
                            ));
                        }
                    }
                }
            }
        }
        for (pubkey, record) in entries {
            dal.push_tx_record(&pubkey, record);
        }
        if let Some(dir) = &self.inner.settings.data_dir {
            dal.save_txs_in_files(dir)
                .map_err(blockchain::Error::from)?;
        }
        Ok(())
    }

    /// One counter statistic, as last computed.
    pub async fn stat(&self, name: &str) -> crate::dal::Stat {
        let chain = self.inner.chain.lock().await;
        chain.confirmed().dal().get_stat(name)
    }

    /// The recorded transaction history of a pubkey.
    pub async fn tx_records(&self, pubkey: &str) -> Vec<crate::dal::TxRecord> {
        let chain = self.inner.chain.lock().await;
        chain.confirmed().dal().tx_records(pubkey)
    }

    /// The highest confirmed block out of the certification validity
    /// window.
    pub async fn certifications_excluding_block(&self) -> Option<u64> {
        let chain = self.inner.chain.lock().await;
        chain.confirmed().dal().certification_excluding_block()
    }

    // ---- pending pool feeders -------------------------------------------

    pub async fn pend_identity(&self, identity: PendingIdentity) {
        let mut chain = self.inner.chain.lock().await;
        chain.confirmed_mut().dal_mut().save_pending_identity(identity);
    }

    pub async fn pend_membership(&self, doc: MembershipDoc) {
        let mut chain = self.inner.chain.lock().await;
        chain.confirmed_mut().dal_mut().save_pending_membership(doc);
    }

    pub async fn pend_certification(&self, certification: PendingCertification) {
        let mut chain = self.inner.chain.lock().await;
        chain
            .confirmed_mut()
            .dal_mut()
            .register_new_certification(certification);
    }

    pub async fn pend_transaction(&self, transaction: Transaction) {
        let mut chain = self.inner.chain.lock().await;
        chain
            .confirmed_mut()
            .dal_mut()
            .save_pending_transaction(transaction);
    }

    pub async fn pend_peer(&self, peer: Peer) {
        let mut chain = self.inner.chain.lock().await;
        chain.confirmed_mut().dal_mut().save_peer(peer);
    }

    async fn evict_transactions(&self, hashes: &[String]) {
        if hashes.is_empty() {
            return;
        }
        let mut chain = self.inner.chain.lock().await;
        for hash in hashes {
            chain.confirmed_mut().dal_mut().remove_tx_by_hash(hash);
        }
    }

    fn issuer(&self) -> Result<String> {
        self.inner
            .signer
            .as_ref()
            .map(|signer| signer.pubkey())
            .ok_or(Error::NoSigner)
    }
}
