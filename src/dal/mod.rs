//! In-memory data access layer.
//!
//! The chain state lives in a [`Dal`] view. The main view backs the
//! confirmed chain; every fork core holds its own view obtained through
//! [`Dal::fork`], a snapshot of the chain-visible state with fresh local
//! pending pools. Promotion of a core merges its pending pools back into
//! the main view; since a forked view carries a full snapshot, rebinding a
//! surviving child onto the main view is pure bookkeeping.
//!
//! Persistence format is out of scope; everything here is process memory.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs, io,
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockcfg::{
    Block, Link, MembershipDoc, MembershipType, Peer, PendingCertification, PendingIdentity,
    ProtocolParameters, SourceKey, Transaction,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("chain invariant broken: {0}")]
    InvariantBroken(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tracked state of an identity written into the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityState {
    pub pubkey: String,
    pub uid: String,
    pub hash: String,
    /// Certification timestamp of the self-declaration.
    pub time: u64,
    pub member: bool,
    pub was_member: bool,
    pub leaving: bool,
    /// Last membership sequence number seen on chain.
    pub current_msn: Option<u64>,
    /// Median time at which the membership was last opened or renewed.
    pub membership_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdState {
    pub amount: u64,
    pub ud_time: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceState {
    owner: String,
    amount: u64,
    consumed: bool,
}

/// Entry of the persisted cores index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRecord {
    pub number: u64,
    pub hash: String,
    pub previous_hash: String,
}

/// One per-counter statistic: the blocks that contributed, and the last
/// block parsed when it was computed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub blocks: Vec<u64>,
    pub last_parsed_block: Option<u64>,
}

/// One line of a pubkey's transaction history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub block_number: u64,
    pub tx_hash: String,
    pub sent: bool,
    pub amount: u64,
}

#[derive(Debug, Clone, Default)]
struct ChainState {
    blocks: Vec<Block>,
    hashes: Vec<String>,
    identities: HashMap<String, IdentityState>,
    by_uid: HashMap<String, String>,
    by_hash: HashMap<String, String>,
    links: Vec<Link>,
    sources: HashMap<SourceKey, SourceState>,
    monetary_mass: u64,
    last_ud: Option<UdState>,
}

#[derive(Debug, Clone, Default)]
struct PendingPools {
    identities: Vec<PendingIdentity>,
    memberships: Vec<MembershipDoc>,
    certifications: Vec<PendingCertification>,
    transactions: Vec<Transaction>,
    peers: Vec<Peer>,
}

/// A data access view: the chain-visible state plus local pending pools.
#[derive(Debug, Clone)]
pub struct Dal {
    params: ProtocolParameters,
    chain: ChainState,
    pending: PendingPools,
    cores: Vec<CoreRecord>,
    stats: BTreeMap<String, Stat>,
    tx_records: BTreeMap<String, Vec<TxRecord>>,
}

impl Dal {
    pub fn new(params: ProtocolParameters) -> Self {
        Dal {
            params,
            chain: ChainState::default(),
            pending: PendingPools::default(),
            cores: Vec::new(),
            stats: BTreeMap::new(),
            tx_records: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &ProtocolParameters {
        &self.params
    }

    /// Derive an overlay view for a fork core: same chain state, fresh
    /// local pools.
    pub fn fork(&self) -> Dal {
        Dal {
            params: self.params.clone(),
            chain: self.chain.clone(),
            pending: PendingPools::default(),
            cores: Vec::new(),
            stats: BTreeMap::new(),
            tx_records: BTreeMap::new(),
        }
    }

    // ---- chain reads ----------------------------------------------------

    pub fn current_block(&self) -> Option<&Block> {
        self.chain.blocks.last()
    }

    pub fn current_hash(&self) -> Option<&str> {
        self.chain.hashes.last().map(|h| h.as_str())
    }

    pub fn get_block(&self, number: u64) -> Result<&Block> {
        self.get_block_or_null(number)
            .ok_or(Error::BlockNotFound(number))
    }

    pub fn get_block_or_null(&self, number: u64) -> Option<&Block> {
        self.chain.blocks.get(number as usize)
    }

    /// Hash of the confirmed block at `number`.
    pub fn get_block_hash(&self, number: u64) -> Option<&str> {
        self.chain.hashes.get(number as usize).map(|h| h.as_str())
    }

    /// Median time of the current block, or 0 on an empty chain.
    pub fn current_median_time(&self) -> u64 {
        self.current_block().map(|b| b.median_time).unwrap_or(0)
    }

    pub fn monetary_mass(&self) -> u64 {
        self.chain.monetary_mass
    }

    pub fn last_ud(&self) -> Option<&UdState> {
        self.chain.last_ud.as_ref()
    }

    // ---- identities and web of trust ------------------------------------

    pub fn identity_by_pubkey(&self, pubkey: &str) -> Option<&IdentityState> {
        self.chain.identities.get(pubkey)
    }

    pub fn identity_by_uid(&self, uid: &str) -> Option<&IdentityState> {
        self.chain
            .by_uid
            .get(uid)
            .and_then(|p| self.chain.identities.get(p))
    }

    pub fn identity_by_hash(&self, hash: &str) -> Option<&IdentityState> {
        self.chain
            .by_hash
            .get(hash)
            .and_then(|p| self.chain.identities.get(p))
    }

    pub fn is_member(&self, pubkey: &str) -> bool {
        self.chain
            .identities
            .get(pubkey)
            .map(|i| i.member)
            .unwrap_or(false)
    }

    pub fn members(&self) -> Vec<&IdentityState> {
        self.chain.identities.values().filter(|i| i.member).collect()
    }

    fn link_is_valid(&self, link: &Link, at: u64) -> bool {
        at < link.timestamp + self.params.sig_validity
    }

    /// Valid outgoing links of `from` at median time `at`.
    pub fn valid_links_from(&self, from: &str, at: u64) -> Vec<&Link> {
        self.chain
            .links
            .iter()
            .filter(|l| l.from == from && self.link_is_valid(l, at))
            .collect()
    }

    /// All links valid at median time `at`.
    pub fn valid_links(&self, at: u64) -> Vec<&Link> {
        self.chain
            .links
            .iter()
            .filter(|l| self.link_is_valid(l, at))
            .collect()
    }

    /// Valid incoming links of `to` at median time `at`.
    pub fn valid_links_to(&self, to: &str, at: u64) -> Vec<&Link> {
        self.chain
            .links
            .iter()
            .filter(|l| l.to == to && self.link_is_valid(l, at))
            .collect()
    }

    /// `true` when a link `from → to` was materialized at or after
    /// `min_time`. Used for the certification replay rule.
    pub fn exists_link_from_or_after(&self, from: &str, to: &str, min_time: u64) -> bool {
        self.chain
            .links
            .iter()
            .any(|l| l.from == from && l.to == to && l.timestamp >= min_time)
    }

    /// Members with at least `sig_wot` distinct valid outgoing links.
    pub fn sentries(&self, at: u64) -> Vec<String> {
        let mut outgoing: HashMap<&str, HashSet<&str>> = HashMap::new();
        for link in &self.chain.links {
            if self.link_is_valid(link, at) && self.is_member(&link.from) {
                outgoing
                    .entry(link.from.as_str())
                    .or_default()
                    .insert(link.to.as_str());
            }
        }
        let mut sentries: Vec<String> = outgoing
            .into_iter()
            .filter(|(_, targets)| targets.len() as u64 >= self.params.sig_wot)
            .map(|(p, _)| p.to_string())
            .collect();
        sentries.sort();
        sentries
    }

    /// Members that must leave the member set: expired membership or not
    /// enough valid incoming links.
    pub fn to_be_kicked(&self, at: u64) -> Vec<String> {
        let mut kicked: Vec<String> = self
            .chain
            .identities
            .values()
            .filter(|i| i.member)
            .filter(|i| {
                let expired = at >= i.membership_time + self.params.ms_validity;
                let starved =
                    (self.valid_links_to(&i.pubkey, at).len() as u64) < self.params.sig_qty;
                expired || starved
            })
            .map(|i| i.pubkey.clone())
            .collect();
        kicked.sort();
        kicked
    }

    /// The highest confirmed block whose median time has fallen out of the
    /// certification validity window; certifications based on it or any
    /// earlier block are expired.
    pub fn certification_excluding_block(&self) -> Option<u64> {
        let now = self.current_median_time();
        self.chain
            .blocks
            .iter()
            .rev()
            .find(|b| b.median_time + self.params.sig_validity <= now)
            .map(|b| b.number)
    }

    // ---- sources --------------------------------------------------------

    /// Amount of an unconsumed source owned by `owner`, if any.
    pub fn available_source(&self, key: &SourceKey, owner: &str) -> Option<u64> {
        self.chain
            .sources
            .get(key)
            .filter(|s| !s.consumed && s.owner == owner)
            .map(|s| s.amount)
    }

    // ---- chain writes ---------------------------------------------------

    /// Apply an already-validated block to this view. All side effects
    /// commit together or not at all.
    pub fn apply_block(&mut self, block: &Block) -> Result<()> {
        if block.number != self.chain.blocks.len() as u64 {
            return Err(Error::InvariantBroken(format!(
                "block {} applied on a chain of height {}",
                block.number,
                self.chain.blocks.len()
            )));
        }
        let mut staged = self.chain.clone();
        Self::apply_to(&mut staged, block)?;
        self.chain = staged;
        self.discharge_pending(block);
        Ok(())
    }

    fn apply_to(chain: &mut ChainState, block: &Block) -> Result<()> {
        for identity in &block.identities {
            let state = IdentityState {
                pubkey: identity.pubkey.clone(),
                uid: identity.uid.clone(),
                hash: identity.hash(),
                time: identity.time,
                member: false,
                was_member: false,
                leaving: false,
                current_msn: None,
                membership_time: block.median_time,
            };
            chain
                .by_uid
                .insert(identity.uid.clone(), identity.pubkey.clone());
            chain.by_hash.insert(state.hash.clone(), identity.pubkey.clone());
            chain.identities.insert(identity.pubkey.clone(), state);
        }
        for joiner in &block.joiners {
            let state = chain.identities.get_mut(&joiner.issuer).ok_or_else(|| {
                Error::InvariantBroken(format!("joiner {} without identity", joiner.issuer))
            })?;
            state.member = true;
            state.was_member = true;
            state.leaving = false;
            state.current_msn = Some(joiner.number);
            state.membership_time = block.median_time;
        }
        for active in &block.actives {
            if let Some(state) = chain.identities.get_mut(&active.issuer) {
                state.current_msn = Some(active.number);
                state.membership_time = block.median_time;
            }
        }
        for leaver in &block.leavers {
            if let Some(state) = chain.identities.get_mut(&leaver.issuer) {
                state.leaving = true;
                state.current_msn = Some(leaver.number);
            }
        }
        for excluded in &block.excluded {
            if let Some(state) = chain.identities.get_mut(excluded) {
                state.member = false;
                state.leaving = false;
            }
        }
        for certification in &block.certifications {
            chain.links.push(Link {
                from: certification.from.clone(),
                to: certification.to.clone(),
                timestamp: block.median_time,
                block_number: certification.block_number,
            });
        }
        for transaction in &block.transactions {
            let tx_hash = transaction.hash();
            for input in &transaction.inputs {
                let source = chain.sources.get_mut(&input.source).ok_or_else(|| {
                    Error::InvariantBroken("transaction consumes unknown source".into())
                })?;
                source.consumed = true;
            }
            for (index, output) in transaction.outputs.iter().enumerate() {
                chain.sources.insert(
                    SourceKey::TxOutput {
                        tx_hash: tx_hash.clone(),
                        index: index as u32,
                    },
                    SourceState {
                        owner: output.pubkey.clone(),
                        amount: output.amount,
                        consumed: false,
                    },
                );
            }
        }
        if let Some(dividend) = block.dividend {
            let members: Vec<String> = chain
                .identities
                .values()
                .filter(|i| i.member)
                .map(|i| i.pubkey.clone())
                .collect();
            for member in members {
                chain.sources.insert(
                    SourceKey::Dividend {
                        pubkey: member.clone(),
                        block: block.number,
                    },
                    SourceState {
                        owner: member,
                        amount: dividend,
                        consumed: false,
                    },
                );
            }
            chain.last_ud = Some(UdState {
                amount: dividend,
                ud_time: block.ud_time.unwrap_or(block.median_time),
                block_number: block.number,
            });
        }
        chain.monetary_mass = block.monetary_mass;
        chain.hashes.push(block.hash());
        chain.blocks.push(block.clone());
        Ok(())
    }

    /// Drop pending documents satisfied by an accepted block.
    fn discharge_pending(&mut self, block: &Block) {
        let written: Vec<String> = block.identities.iter().map(|i| i.hash()).collect();
        self.pending.identities.retain(|p| !written.contains(&p.hash()));

        for certification in &block.certifications {
            for pending in &mut self.pending.certifications {
                if pending.from == certification.from
                    && pending.block_number == certification.block_number
                {
                    if let Some(target) = self.chain.identities.get(&certification.to) {
                        if pending.target == target.hash {
                            pending.linked = true;
                        }
                    }
                }
            }
        }

        self.pending.memberships.retain(|doc| {
            self.chain
                .identities
                .get(&doc.issuer)
                .and_then(|i| i.current_msn)
                .map_or(true, |msn| doc.number > msn)
        });

        let included: Vec<String> = block.transactions.iter().map(|t| t.hash()).collect();
        self.pending
            .transactions
            .retain(|t| !included.contains(&t.hash()));
    }

    // ---- pending pools --------------------------------------------------

    pub fn save_pending_identity(&mut self, identity: PendingIdentity) {
        if !self.pending.identities.iter().any(|p| p.hash() == identity.hash()) {
            self.pending.identities.push(identity);
        }
    }

    pub fn save_pending_membership(&mut self, doc: MembershipDoc) {
        let duplicate = self.pending.memberships.iter().any(|m| {
            m.issuer == doc.issuer && m.number == doc.number && m.membership == doc.membership
        });
        if !duplicate {
            self.pending.memberships.push(doc);
        }
    }

    pub fn register_new_certification(&mut self, certification: PendingCertification) {
        let duplicate = self.pending.certifications.iter().any(|c| {
            c.from == certification.from
                && c.target == certification.target
                && c.block_number == certification.block_number
        });
        if !duplicate {
            self.pending.certifications.push(certification);
        }
    }

    pub fn save_pending_transaction(&mut self, transaction: Transaction) {
        if !self
            .pending
            .transactions
            .iter()
            .any(|t| t.hash() == transaction.hash())
        {
            self.pending.transactions.push(transaction);
        }
    }

    pub fn save_peer(&mut self, peer: Peer) {
        if let Some(existing) = self
            .pending
            .peers
            .iter_mut()
            .find(|p| p.pubkey == peer.pubkey)
        {
            *existing = peer;
        } else {
            self.pending.peers.push(peer);
        }
    }

    pub fn pending_identities(&self) -> &[PendingIdentity] {
        &self.pending.identities
    }

    pub fn pending_certifications(&self) -> &[PendingCertification] {
        &self.pending.certifications
    }

    pub fn pending_memberships(&self) -> &[MembershipDoc] {
        &self.pending.memberships
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending.transactions.clone()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.pending.peers
    }

    pub fn remove_tx_by_hash(&mut self, hash: &str) {
        self.pending.transactions.retain(|t| t.hash() != hash);
    }

    /// Pending IN memberships, the joiner candidates.
    pub fn find_newcomers(&self) -> Vec<&MembershipDoc> {
        self.pending
            .memberships
            .iter()
            .filter(|m| m.membership == MembershipType::In)
            .collect()
    }

    /// Pending OUT memberships, the leaver candidates.
    pub fn find_leavers(&self) -> Vec<&MembershipDoc> {
        self.pending
            .memberships
            .iter()
            .filter(|m| m.membership == MembershipType::Out)
            .collect()
    }

    /// Pending certifications aimed at the identity with the given hash and
    /// not yet materialized as links.
    pub fn certs_not_linked_to_target(&self, hash: &str) -> Vec<&PendingCertification> {
        self.pending
            .certifications
            .iter()
            .filter(|c| c.target == hash && !c.linked)
            .collect()
    }

    /// Pending certifications whose target is already a member.
    pub fn certs_find_new(&self) -> Vec<&PendingCertification> {
        self.pending
            .certifications
            .iter()
            .filter(|c| !c.linked)
            .filter(|c| {
                self.identity_by_hash(&c.target)
                    .map(|i| i.member)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn memberships_for_issuer(&self, issuer: &str) -> Vec<&MembershipDoc> {
        self.pending
            .memberships
            .iter()
            .filter(|m| m.issuer == issuer)
            .collect()
    }

    /// Merge another view's pending pools into this one, deduplicating by
    /// natural key. Used when a fork core is promoted.
    pub fn absorb_pending(&mut self, other: &Dal) {
        for identity in &other.pending.identities {
            self.save_pending_identity(identity.clone());
        }
        for membership in &other.pending.memberships {
            self.save_pending_membership(membership.clone());
        }
        for certification in &other.pending.certifications {
            self.register_new_certification(certification.clone());
        }
        for transaction in &other.pending.transactions {
            self.save_pending_transaction(transaction.clone());
        }
        for peer in &other.pending.peers {
            if !self.pending.peers.iter().any(|p| p.pubkey == peer.pubkey) {
                self.pending.peers.push(peer.clone());
            }
        }
    }

    // ---- cores index ----------------------------------------------------

    pub fn get_cores(&self) -> &[CoreRecord] {
        &self.cores
    }

    pub fn add_core(&mut self, record: CoreRecord) {
        if !self
            .cores
            .iter()
            .any(|c| c.number == record.number && c.hash == record.hash)
        {
            self.cores.push(record);
        }
    }

    pub fn remove_core(&mut self, number: u64, hash: &str) {
        self.cores.retain(|c| !(c.number == number && c.hash == hash));
    }

    // ---- statistics and transaction records -----------------------------

    pub fn save_stat(&mut self, name: &str, stat: Stat) {
        self.stats.insert(name.to_string(), stat);
    }

    pub fn get_stat(&self, name: &str) -> Stat {
        self.stats.get(name).cloned().unwrap_or_default()
    }

    pub fn drop_tx_records(&mut self) {
        self.tx_records.clear();
    }

    pub fn push_tx_record(&mut self, pubkey: &str, record: TxRecord) {
        self.tx_records
            .entry(pubkey.to_string())
            .or_default()
            .push(record);
    }

    pub fn tx_records(&self, pubkey: &str) -> Vec<TxRecord> {
        self.tx_records.get(pubkey).cloned().unwrap_or_default()
    }

    /// Export every pubkey's transaction records as a JSON file.
    pub fn save_txs_in_files(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        for (pubkey, records) in &self.tx_records {
            let path = dir.join(format!("txs-{}.json", pubkey));
            fs::write(path, serde_json::to_vec_pretty(records)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::{BlockIdentity, BlockMembership, ProtocolParameters};

    fn root_block(members: &[(&str, &str)]) -> Block {
        let identities: Vec<BlockIdentity> = members
            .iter()
            .map(|(pubkey, uid)| BlockIdentity {
                pubkey: pubkey.to_string(),
                signature: "00".into(),
                time: 1_000,
                uid: uid.to_string(),
            })
            .collect();
        let joiners: Vec<BlockMembership> = identities
            .iter()
            .map(|i| BlockMembership {
                issuer: i.pubkey.clone(),
                signature: "00".into(),
                number: 0,
                certts: i.time,
                uid: i.uid.clone(),
            })
            .collect();
        Block {
            version: 1,
            currency: "test_currency".into(),
            number: 0,
            pow_min: 0,
            time: 1_000,
            median_time: 1_000,
            dividend: None,
            ud_time: None,
            issuer: members[0].0.to_string(),
            previous_hash: None,
            previous_issuer: None,
            parameters: Some(ProtocolParameters::default().to_line()),
            members_count: members.len() as u64,
            monetary_mass: 0,
            identities,
            joiners,
            actives: vec![],
            leavers: vec![],
            excluded: vec![],
            certifications: vec![],
            transactions: vec![],
            nonce: 0,
            signature: "00".into(),
        }
    }

    #[test]
    fn apply_block_updates_membership_state() {
        let mut dal = Dal::new(ProtocolParameters::default());
        dal.apply_block(&root_block(&[("AAA", "alice"), ("BBB", "bob")]))
            .unwrap();

        assert!(dal.is_member("AAA"));
        assert!(dal.is_member("BBB"));
        assert_eq!(dal.identity_by_uid("alice").unwrap().pubkey, "AAA");
        assert_eq!(dal.current_block().unwrap().number, 0);
    }

    #[test]
    fn apply_block_rejects_height_gap() {
        let mut dal = Dal::new(ProtocolParameters::default());
        let mut block = root_block(&[("AAA", "alice")]);
        block.number = 4;
        assert!(dal.apply_block(&block).is_err());
        assert!(dal.current_block().is_none());
    }

    #[test]
    fn fork_view_does_not_share_pending_pools() {
        let mut dal = Dal::new(ProtocolParameters::default());
        dal.save_pending_identity(PendingIdentity {
            pubkey: "AAA".into(),
            uid: "alice".into(),
            time: 1_000,
            signature: "00".into(),
        });
        let fork = dal.fork();
        assert!(fork.pending_identities().is_empty());
        assert_eq!(dal.pending_identities().len(), 1);
    }

    #[test]
    fn absorb_pending_deduplicates() {
        let mut main = Dal::new(ProtocolParameters::default());
        let mut fork = main.fork();
        let identity = PendingIdentity {
            pubkey: "AAA".into(),
            uid: "alice".into(),
            time: 1_000,
            signature: "00".into(),
        };
        main.save_pending_identity(identity.clone());
        fork.save_pending_identity(identity);
        main.absorb_pending(&fork);
        assert_eq!(main.pending_identities().len(), 1);
    }
}
