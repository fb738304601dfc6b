//! Candidate block assembly.
//!
//! Gathers pending identities, memberships, certifications and
//! transactions from the working view and produces an unsigned candidate
//! block. Newcomer selection iterates until the kept set is stable under
//! the web-of-trust constraints: a pass drops every candidate that would
//! break them, and any drop triggers a new pass over the kept set, since
//! removing a candidate may invalidate links another one relied upon.

use std::collections::HashSet;

use thiserror::Error as ThisError;

use crate::{
    blockcfg::{
        Block, BlockCertification, BlockIdentity, BlockMembership, MembershipDoc,
        PendingCertification, PendingIdentity, Transaction,
    },
    dal::{self, Dal},
    rules::{self, global, wot},
    utils::clock::Clock,
};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("the chain already has a root block")]
    RootAlreadyExists,
    #[error("no root block to build upon")]
    EmptyChain,
    #[error(transparent)]
    Dal(#[from] dal::Error),
    #[error(transparent)]
    Rule(#[from] rules::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The per-joiner preflight data: the resolved identity, the winning
/// membership document and its individually vetted certifications.
#[derive(Debug, Clone)]
pub struct JoinerData {
    pub identity: PendingIdentity,
    pub identity_on_chain: bool,
    pub membership: MembershipDoc,
    pub certs: Vec<PendingCertification>,
}

/// The capability bundle distinguishing ordinary generation from manual
/// root generation.
pub trait GenerationStrategy: Send + Sync {
    /// Keep the joiner candidates this strategy accepts.
    fn filter_joiners(&self, dal: &Dal, candidates: Vec<JoinerData>) -> Vec<JoinerData>;

    /// Whether certifications between existing members are collected.
    fn include_wot_certs(&self) -> bool;
}

/// Ordinary next-block generation: reject joiners squatting a uid or
/// pubkey already taken by an identity that never reached membership.
pub struct NextBlockStrategy;

impl GenerationStrategy for NextBlockStrategy {
    fn filter_joiners(&self, dal: &Dal, candidates: Vec<JoinerData>) -> Vec<JoinerData> {
        candidates
            .into_iter()
            .filter(|candidate| {
                let uid_squatted = dal
                    .identity_by_uid(&candidate.identity.uid)
                    .map_or(false, |i| {
                        i.pubkey != candidate.identity.pubkey && !i.was_member
                    });
                let pubkey_squatted = dal
                    .identity_by_pubkey(&candidate.identity.pubkey)
                    .map_or(false, |i| i.uid != candidate.identity.uid && !i.was_member);
                if uid_squatted || pubkey_squatted {
                    tracing::info!(uid = %candidate.identity.uid, "joiner dropped: uid or pubkey taken");
                }
                !(uid_squatted || pubkey_squatted)
            })
            .collect()
    }

    fn include_wot_certs(&self) -> bool {
        true
    }
}

/// Root generation: the operator names the uids to found the currency
/// with. Only meaningful while the chain is empty.
pub struct ManualRootStrategy {
    pub selected_uids: Vec<String>,
}

impl GenerationStrategy for ManualRootStrategy {
    fn filter_joiners(&self, _dal: &Dal, candidates: Vec<JoinerData>) -> Vec<JoinerData> {
        candidates
            .into_iter()
            .filter(|c| self.selected_uids.iter().any(|uid| *uid == c.identity.uid))
            .collect()
    }

    fn include_wot_certs(&self) -> bool {
        false
    }
}

/// What a pending identity still lacks before it can join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequirements {
    pub pubkey: String,
    pub uid: String,
    pub certification_count: u64,
    pub required_certifications: u64,
    pub membership_pending: bool,
    pub outdistanced: bool,
}

/// An assembled candidate with the transactions evicted on the way.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub block: Block,
    /// Hashes of pending transactions that failed validation and must be
    /// removed from the pool.
    pub dropped_txs: Vec<String>,
}

pub struct BlockAssembler<'a> {
    dal: &'a Dal,
    clock: &'a dyn Clock,
    currency: &'a str,
    rootoffset: u64,
}

impl<'a> BlockAssembler<'a> {
    pub fn new(dal: &'a Dal, clock: &'a dyn Clock, currency: &'a str, rootoffset: u64) -> Self {
        BlockAssembler {
            dal,
            clock,
            currency,
            rootoffset,
        }
    }

    /// Median time the candidate block will carry.
    fn candidate_median_time(&self) -> u64 {
        match self.dal.current_block() {
            Some(_) => global::expected_median_time(self.dal),
            None => self.clock.now().saturating_sub(self.rootoffset),
        }
    }

    /// Assemble the next block with the given strategy.
    pub fn generate_next(
        &self,
        issuer: &str,
        strategy: &dyn GenerationStrategy,
    ) -> Result<Assembled> {
        let at = self.candidate_median_time();
        let preflight = self.pre_join_data(at);
        let filtered = strategy.filter_joiners(self.dal, preflight);
        let passing = self.iterated_selection(at, filtered);

        let mut certifications = self.joiner_links(&passing);
        if strategy.include_wot_certs() {
            self.merge_wot_certs(at, &mut certifications);
        }

        let (joiners, actives) = self.split_memberships(&passing);
        let leavers = self.resolve_leavers();
        let (transactions, dropped_txs) = self.select_transactions();
        let excluded = self.dal.to_be_kicked(at);

        let block = self.assemble(
            issuer,
            at,
            &passing,
            joiners,
            actives,
            leavers,
            excluded,
            certifications,
            transactions,
        );
        Ok(Assembled { block, dropped_txs })
    }

    /// Assemble a next block carrying no new document at all, exclusions
    /// excepted.
    pub fn generate_empty(&self, issuer: &str) -> Result<Assembled> {
        if self.dal.current_block().is_none() {
            return Err(Error::EmptyChain);
        }
        let at = self.candidate_median_time();
        let excluded = self.dal.to_be_kicked(at);
        let block = self.assemble(
            issuer,
            at,
            &[],
            vec![],
            vec![],
            vec![],
            excluded,
            vec![],
            vec![],
        );
        Ok(Assembled {
            block,
            dropped_txs: vec![],
        })
    }

    /// Assemble the root block from the operator's selection.
    pub fn generate_manual_root(&self, issuer: &str, selected_uids: Vec<String>) -> Result<Assembled> {
        if self.dal.current_block().is_some() {
            return Err(Error::RootAlreadyExists);
        }
        self.generate_next(issuer, &ManualRootStrategy { selected_uids })
    }

    /// Resolve every pending IN membership into preflight data.
    fn pre_join_data(&self, at: u64) -> Vec<JoinerData> {
        let params = self.dal.params();
        let mut candidates = Vec::new();
        for membership in self.dal.find_newcomers() {
            let hash = membership.identity_hash();
            let (identity, on_chain) = match self
                .dal
                .pending_identities()
                .iter()
                .find(|i| i.hash() == hash)
            {
                Some(identity) => (identity.clone(), false),
                None => match self.dal.identity_by_hash(&hash) {
                    Some(state) => (
                        PendingIdentity {
                            pubkey: state.pubkey.clone(),
                            uid: state.uid.clone(),
                            time: state.time,
                            signature: String::new(),
                        },
                        true,
                    ),
                    None => {
                        tracing::debug!(issuer = %membership.issuer, "membership without identity");
                        continue;
                    }
                },
            };

            // already a member: the IN document is a renewal, handled as
            // an active, not a joiner
            if let Some(state) = self.dal.identity_by_pubkey(&identity.pubkey) {
                if state.current_msn.map_or(false, |msn| membership.number <= msn) {
                    continue;
                }
            }

            let mut certs = Vec::new();
            let mut certifiers = HashSet::new();
            for cert in self.dal.certs_not_linked_to_target(&hash) {
                if !self.vet_certification(cert, &identity.pubkey, at, params) {
                    continue;
                }
                if !certifiers.insert(cert.from.clone()) {
                    continue;
                }
                certs.push(cert.clone());
            }

            candidates.push(JoinerData {
                identity,
                identity_on_chain: on_chain,
                membership: membership.clone(),
                certs,
            });
        }
        candidates
    }

    fn vet_certification(
        &self,
        cert: &PendingCertification,
        target_pubkey: &str,
        at: u64,
        params: &crate::blockcfg::ProtocolParameters,
    ) -> bool {
        if cert.from == target_pubkey {
            return false;
        }
        match self.dal.get_block_or_null(cert.block_number) {
            Some(basis) => {
                if at > basis.median_time + params.sig_validity {
                    return false;
                }
            }
            None => {
                // only a root candidate may carry certifications based on
                // the block being created
                if self.dal.current_block().is_some() || cert.block_number != 0 {
                    return false;
                }
            }
        }
        let replay_floor = at.saturating_sub(params.sig_delay);
        !self
            .dal
            .exists_link_from_or_after(&cert.from, target_pubkey, replay_floor)
    }

    /// Keep the largest order-respecting joiner set stable under the WoT
    /// constraints. A pass with any rejection recurses on the kept set.
    fn iterated_selection(&self, at: u64, mut joiners: Vec<JoinerData>) -> Vec<JoinerData> {
        loop {
            let mut passing: Vec<JoinerData> = Vec::new();
            let mut rejected = false;
            for joiner in &joiners {
                let mut trial: Vec<JoinerData> = passing.clone();
                trial.push(joiner.clone());
                let links = self.new_links(&trial);
                let newcomers: Vec<String> =
                    trial.iter().map(|j| j.identity.pubkey.clone()).collect();
                match wot::check_wot_constraints(self.dal, at, &newcomers, &links) {
                    Ok(()) => passing.push(joiner.clone()),
                    Err(err) => {
                        rejected = true;
                        tracing::info!(
                            uid = %joiner.identity.uid,
                            reason = %err,
                            "joiner rejected by web-of-trust constraints"
                        );
                    }
                }
            }
            if !rejected || passing.is_empty() {
                return passing;
            }
            joiners = passing;
        }
    }

    /// The links a newcomer set would materialize: vetted certifications
    /// whose certifier is a current member or part of the set, one per
    /// `(certifier, target)` pair.
    fn new_links(&self, set: &[JoinerData]) -> Vec<(String, String)> {
        let pubkeys: HashSet<&str> = set.iter().map(|j| j.identity.pubkey.as_str()).collect();
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for joiner in set {
            for cert in &joiner.certs {
                let admissible =
                    self.dal.is_member(&cert.from) || pubkeys.contains(cert.from.as_str());
                if !admissible {
                    continue;
                }
                let pair = (cert.from.clone(), joiner.identity.pubkey.clone());
                if seen.insert(pair.clone()) {
                    links.push(pair);
                }
            }
        }
        links
    }

    /// Certifications of the selected joiner set, as block records.
    fn joiner_links(&self, set: &[JoinerData]) -> Vec<BlockCertification> {
        let pubkeys: HashSet<&str> = set.iter().map(|j| j.identity.pubkey.as_str()).collect();
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for joiner in set {
            for cert in &joiner.certs {
                let admissible =
                    self.dal.is_member(&cert.from) || pubkeys.contains(cert.from.as_str());
                if !admissible {
                    continue;
                }
                if seen.insert((cert.from.clone(), joiner.identity.pubkey.clone())) {
                    records.push(BlockCertification {
                        from: cert.from.clone(),
                        to: joiner.identity.pubkey.clone(),
                        block_number: cert.block_number,
                        signature: cert.signature.clone(),
                    });
                }
            }
        }
        records
    }

    /// Add certifications between existing members. A member certifier
    /// already certifying someone in this block is skipped: joiner
    /// certifications take priority.
    fn merge_wot_certs(&self, at: u64, certifications: &mut Vec<BlockCertification>) {
        let params = self.dal.params();
        let mut used_certifiers: HashSet<String> =
            certifications.iter().map(|c| c.from.clone()).collect();
        for cert in self.dal.certs_find_new() {
            let target = match self.dal.identity_by_hash(&cert.target) {
                Some(identity) => identity.pubkey.clone(),
                None => continue,
            };
            // a leaving member keeps its memberships but stops certifying
            let certifier_active = self
                .dal
                .identity_by_pubkey(&cert.from)
                .map_or(false, |i| i.member && !i.leaving);
            if !certifier_active {
                continue;
            }
            if used_certifiers.contains(&cert.from) {
                continue;
            }
            if !self.vet_certification(cert, &target, at, params) {
                continue;
            }
            used_certifiers.insert(cert.from.clone());
            certifications.push(BlockCertification {
                from: cert.from.clone(),
                to: target,
                block_number: cert.block_number,
                signature: cert.signature.clone(),
            });
        }
    }

    /// Split the selected set into joiners proper and membership renewals.
    fn split_memberships(
        &self,
        set: &[JoinerData],
    ) -> (Vec<BlockMembership>, Vec<BlockMembership>) {
        let mut joiners = Vec::new();
        let mut actives = Vec::new();
        for joiner in set {
            let record = BlockMembership {
                issuer: joiner.membership.issuer.clone(),
                signature: joiner.membership.signature.clone(),
                number: joiner.membership.number,
                certts: joiner.membership.certts,
                uid: joiner.membership.uid.clone(),
            };
            if self.dal.is_member(&joiner.identity.pubkey) {
                actives.push(record);
            } else {
                joiners.push(record);
            }
        }
        (joiners, actives)
    }

    /// Pending OUT memberships of current members with a fresh sequence
    /// number.
    fn resolve_leavers(&self) -> Vec<BlockMembership> {
        let mut leavers = Vec::new();
        for doc in self.dal.find_leavers() {
            let member = self
                .dal
                .identity_by_pubkey(&doc.issuer)
                .filter(|i| i.member);
            let state = match member {
                Some(state) => state,
                None => continue,
            };
            if state.current_msn.map_or(true, |msn| doc.number > msn) {
                leavers.push(BlockMembership {
                    issuer: doc.issuer.clone(),
                    signature: doc.signature.clone(),
                    number: doc.number,
                    certts: doc.certts,
                    uid: doc.uid.clone(),
                });
            }
        }
        leavers
    }

    /// Walk the pending transactions in order, keeping those that pass
    /// both bunch-local and single-transaction validation. Failures are
    /// reported for eviction from the pool.
    fn select_transactions(&self) -> (Vec<Transaction>, Vec<String>) {
        let mut accepted: Vec<Transaction> = Vec::new();
        let mut consumed: HashSet<crate::blockcfg::SourceKey> = HashSet::new();
        let mut dropped = Vec::new();
        for transaction in self.dal.pending_transactions() {
            let structurally_ok = transaction.input_sum() == transaction.output_sum()
                && transaction.signatures.len() == transaction.issuers.len()
                && !transaction.inputs.is_empty();
            let bunch_ok = transaction
                .inputs
                .iter()
                .all(|input| !consumed.contains(&input.source));
            let globally_ok = global::check_single_transaction(&transaction, self.dal).is_ok();
            if structurally_ok && bunch_ok && globally_ok {
                for input in &transaction.inputs {
                    consumed.insert(input.source.clone());
                }
                accepted.push(transaction);
            } else {
                tracing::info!(hash = %transaction.hash(), "pending transaction evicted");
                dropped.push(transaction.hash());
            }
        }
        (accepted, dropped)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        issuer: &str,
        median_time: u64,
        passing: &[JoinerData],
        mut joiners: Vec<BlockMembership>,
        mut actives: Vec<BlockMembership>,
        mut leavers: Vec<BlockMembership>,
        mut excluded: Vec<String>,
        mut certifications: Vec<BlockCertification>,
        transactions: Vec<Transaction>,
    ) -> Block {
        // excluded keys lose their place everywhere else in the block
        let kicked: HashSet<&str> = excluded.iter().map(|p| p.as_str()).collect();
        joiners.retain(|m| !kicked.contains(m.issuer.as_str()));
        actives.retain(|m| !kicked.contains(m.issuer.as_str()));
        leavers.retain(|m| !kicked.contains(m.issuer.as_str()));
        certifications.retain(|c| !kicked.contains(c.to.as_str()));

        let mut identities: Vec<BlockIdentity> = passing
            .iter()
            .filter(|j| !j.identity_on_chain)
            .filter(|j| joiners.iter().any(|m| m.issuer == j.identity.pubkey))
            .map(|j| j.identity.as_block_identity())
            .collect();

        identities.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        joiners.sort_by(|a, b| a.issuer.cmp(&b.issuer));
        actives.sort_by(|a, b| a.issuer.cmp(&b.issuer));
        leavers.sort_by(|a, b| a.issuer.cmp(&b.issuer));
        excluded.sort();
        certifications.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

        let current = self.dal.current_block();
        let number = current.map(|c| c.number + 1).unwrap_or(0);
        let new_members = joiners
            .iter()
            .filter(|m| !self.dal.is_member(&m.issuer))
            .count() as u64;
        let members_count = current.map(|c| c.members_count).unwrap_or(0) + new_members
            - excluded.len() as u64;
        let dividend = global::expected_dividend(self.dal, median_time, members_count);

        Block {
            version: 1,
            currency: self.currency.to_string(),
            number,
            pow_min: global::expected_pow_min(self.dal),
            time: self.clock.now().max(median_time),
            median_time,
            dividend: dividend.map(|(amount, _, _)| amount),
            ud_time: dividend.map(|(_, ud_time, _)| ud_time),
            issuer: issuer.to_string(),
            previous_hash: current.map(|_| {
                self.dal
                    .current_hash()
                    .expect("current block implies a current hash")
                    .to_string()
            }),
            previous_issuer: current.map(|c| c.issuer.clone()),
            parameters: (number == 0).then(|| self.dal.params().to_line()),
            members_count,
            monetary_mass: dividend
                .map(|(_, _, mass)| mass)
                .unwrap_or_else(|| self.dal.monetary_mass()),
            identities,
            joiners,
            actives,
            leavers,
            excluded,
            certifications,
            transactions,
            nonce: 0,
            signature: String::new(),
        }
    }

    /// Report how far a pending identity stands from membership.
    pub fn requirements_of_identity(&self, identity: &PendingIdentity) -> IdentityRequirements {
        let params = self.dal.params();
        let at = self.candidate_median_time();
        let hash = identity.hash();
        let mut certifiers = HashSet::new();
        for cert in self.dal.certs_not_linked_to_target(&hash) {
            if self.vet_certification(cert, &identity.pubkey, at, params)
                && self.dal.is_member(&cert.from)
            {
                certifiers.insert(cert.from.clone());
            }
        }
        let existing = self.dal.valid_links_to(&identity.pubkey, at).len() as u64;
        let certification_count = existing + certifiers.len() as u64;

        let membership_pending = self
            .dal
            .find_newcomers()
            .iter()
            .any(|m| m.identity_hash() == hash);

        let links: Vec<(String, String)> = certifiers
            .iter()
            .map(|from| (from.clone(), identity.pubkey.clone()))
            .collect();
        let sentries = self.dal.sentries(at);
        let graph = wot::PostBlockGraph::build(self.dal, at, &links);
        let outdistanced = !graph
            .outdistanced_from(&sentries, &identity.pubkey, params.step_max)
            .is_empty();

        IdentityRequirements {
            pubkey: identity.pubkey.clone(),
            uid: identity.uid.clone(),
            certification_count,
            required_certifications: params.sig_qty,
            membership_pending,
            outdistanced,
        }
    }
}
