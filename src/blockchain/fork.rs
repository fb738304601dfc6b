//! The fork tree: candidate cores over the confirmed chain.
//!
//! Cores live in an arena keyed by `(number, hash)`; a parent is found by
//! key lookup, never held by reference. Admission attaches a block to its
//! parent view, election picks the main fork deterministically, and
//! pruning promotes the oldest blocks of the winning branch once the
//! window overflows.

use std::collections::BTreeMap;

use crate::{
    blockcfg::{Block, BlockStamp},
    blockchain::{ChainContext, Error},
    dal::{CoreRecord, Dal},
    rules,
};

/// One fork node: a tentative block plus the chain view that includes it.
#[derive(Debug, Clone)]
pub struct Core {
    number: u64,
    hash: String,
    previous_hash: String,
    context: ChainContext,
}

impl Core {
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn context(&self) -> &ChainContext {
        &self.context
    }

    /// The tentative block this core carries.
    pub fn block(&self) -> &Block {
        self.context
            .current()
            .expect("a core view always contains its own block")
    }

    pub fn stamp(&self) -> BlockStamp {
        BlockStamp {
            number: self.number,
            hash: self.hash.clone(),
        }
    }

    fn record(&self) -> CoreRecord {
        CoreRecord {
            number: self.number,
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// The accepted block.
    pub stamp: BlockStamp,
    /// Blocks promoted into the confirmed chain by the subsequent pruning
    /// pass, in ascending height order.
    pub promoted: Vec<BlockStamp>,
}

pub struct ForkManager {
    window: u64,
    main: ChainContext,
    cores: BTreeMap<(u64, String), Core>,
}

impl ForkManager {
    pub fn new(dal: Dal, window: u64) -> Self {
        ForkManager {
            window,
            main: ChainContext::new(dal),
            cores: BTreeMap::new(),
        }
    }

    /// The context bound to the confirmed chain.
    pub fn confirmed(&self) -> &ChainContext {
        &self.main
    }

    pub fn confirmed_mut(&mut self) -> &mut ChainContext {
        &mut self.main
    }

    /// Among the cores at the greatest height, the one with the
    /// lexicographically greatest hash.
    pub fn main_fork(&self) -> Option<&Core> {
        let top = self.cores.keys().map(|(n, _)| *n).max()?;
        self.cores
            .range((top, String::new())..)
            .map(|(_, core)| core)
            .max_by(|a, b| a.hash.cmp(&b.hash))
    }

    /// The working view for reads: the main fork's view when one exists,
    /// the confirmed chain otherwise.
    pub fn working_context(&self) -> &ChainContext {
        self.main_fork()
            .map(|core| core.context())
            .unwrap_or(&self.main)
    }

    /// The current block of the working view.
    pub fn current(&self) -> Option<&Block> {
        self.working_context().current()
    }

    /// The core carrying the block `(number, hash)`, if any.
    pub fn core(&self, number: u64, hash: &str) -> Option<&Core> {
        self.cores.get(&(number, hash.to_string()))
    }

    /// Leaf cores: cores without a child in the arena.
    pub fn branches(&self) -> Vec<&Core> {
        self.cores
            .values()
            .filter(|core| {
                !self
                    .cores
                    .values()
                    .any(|other| other.number == core.number + 1 && other.previous_hash == core.hash)
            })
            .collect()
    }

    fn is_known(&self, stamp: &BlockStamp) -> bool {
        if self.cores.contains_key(&(stamp.number, stamp.hash.clone())) {
            return true;
        }
        self.main.dal().get_block_hash(stamp.number) == Some(stamp.hash.as_str())
    }

    /// Number of blocks a leaf's branch holds above the confirmed tip.
    fn branch_size(&self, leaf_number: u64) -> u64 {
        match self.main.current() {
            Some(current) => leaf_number - current.number,
            None => leaf_number + 1,
        }
    }

    /// Admit a block: either apply it directly to the confirmed chain
    /// (empty window, no cores) or attach it as a new core, then prune.
    pub fn submit(&mut self, block: &Block, with_check: bool) -> Result<Admission, Error> {
        let stamp = block.stamp();
        if self.is_known(&stamp) {
            return Err(rules::Error::AlreadyKnown.into());
        }

        if self.cores.is_empty() && self.window == 0 {
            self.main.add_block(block, with_check)?;
            tracing::info!(block = %stamp, "confirmed chain extended");
            return Ok(Admission {
                stamp,
                promoted: vec![],
            });
        }

        let parent = self.locate_parent(block)?;
        if with_check {
            parent.check_block(block, true)?;
        }

        let mut context = ChainContext::new(parent.dal().fork());
        context.add_block(block, false)?;
        let core = Core {
            number: block.number,
            hash: stamp.hash.clone(),
            previous_hash: block.previous_hash.clone().unwrap_or_default(),
            context,
        };
        self.main.dal_mut().add_core(core.record());
        self.cores
            .insert((core.number, core.hash.clone()), core);
        tracing::info!(block = %stamp, "core registered");

        let promoted = self.prune()?;
        Ok(Admission { stamp, promoted })
    }

    /// The context of the parent the block builds upon: an existing core,
    /// or the confirmed tip.
    fn locate_parent(&self, block: &Block) -> Result<&ChainContext, Error> {
        if block.number == 0 {
            return if self.main.current().is_none() {
                Ok(&self.main)
            } else {
                Err(rules::Error::AlreadyKnown.into())
            };
        }
        let previous_hash = block
            .previous_hash
            .clone()
            .ok_or(rules::Error::PreviousNotFound)?;
        let parent_number = block.number - 1;
        if let Some(core) = self.cores.get(&(parent_number, previous_hash.clone())) {
            return Ok(core.context());
        }
        let tip_matches = self.main.current().map_or(false, |current| {
            current.number == parent_number
                && self.main.dal().current_hash() == Some(previous_hash.as_str())
        });
        if tip_matches {
            Ok(&self.main)
        } else {
            Err(rules::Error::PreviousNotFound.into())
        }
    }

    /// Promote the oldest blocks of the winning branch while its length
    /// exceeds the window. Pruning is suspended while the top height is
    /// contested.
    fn prune(&mut self) -> Result<Vec<BlockStamp>, Error> {
        let top = match self.cores.keys().map(|(n, _)| *n).max() {
            Some(top) => top,
            None => return Ok(vec![]),
        };
        let top_cores: Vec<(u64, String)> = self
            .cores
            .keys()
            .filter(|(n, _)| *n == top)
            .cloned()
            .collect();
        if top_cores.len() != 1 {
            tracing::debug!(height = top, "top height contested, pruning suspended");
            return Ok(vec![]);
        }

        let branch_size = self.branch_size(top);
        if branch_size <= self.window {
            return Ok(vec![]);
        }

        // walk the branch from the leaf down to its root core
        let mut branch: Vec<(u64, String)> = Vec::new();
        let (mut number, mut hash) = top_cores.into_iter().next().expect("one top core");
        loop {
            let core = &self.cores[&(number, hash.clone())];
            let parent = (number.saturating_sub(1), core.previous_hash.clone());
            branch.push((number, hash));
            if number == 0 || !self.cores.contains_key(&parent) {
                break;
            }
            number = parent.0;
            hash = parent.1;
        }
        branch.reverse();

        let mut promoted = Vec::new();
        let eligible = (branch_size - self.window) as usize;
        for key in branch.into_iter().take(eligible) {
            let core = self
                .cores
                .remove(&key)
                .expect("branch cores are in the arena");
            self.main.add_block(core.block(), false)?;
            self.main.dal_mut().absorb_pending(core.context().dal());
            self.main.dal_mut().remove_core(core.number, &core.hash);
            tracing::info!(block = %core.stamp(), "core promoted into the confirmed chain");
            promoted.push(core.stamp());

            let orphans: Vec<(u64, String)> = self
                .cores
                .keys()
                .filter(|(n, h)| *n == core.number && *h != core.hash)
                .cloned()
                .collect();
            for orphan in orphans {
                self.discard_subtree(orphan);
            }
            // surviving children now sit directly on the confirmed chain;
            // their snapshots already contain the promoted state
        }
        Ok(promoted)
    }

    fn discard_subtree(&mut self, key: (u64, String)) {
        if let Some(core) = self.cores.remove(&key) {
            self.main.dal_mut().remove_core(core.number, &core.hash);
            tracing::info!(block = %core.stamp(), "orphaned core discarded");
            let children: Vec<(u64, String)> = self
                .cores
                .iter()
                .filter(|(_, child)| {
                    child.number == core.number + 1 && child.previous_hash == core.hash
                })
                .map(|(k, _)| k.clone())
                .collect();
            for child in children {
                self.discard_subtree(child);
            }
        }
    }
}
