use thiserror::Error as ThisError;

use crate::{
    blockcfg::Block,
    dal::{self, Dal},
    rules::{self, global, local},
};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Rule(#[from] rules::Error),

    #[error(transparent)]
    Dal(#[from] dal::Error),
}

impl Error {
    /// Stable code of the underlying failure, when it is a rule violation.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Rule(rule) => rule.code(),
            Error::Dal(_) => "ErrStorage",
        }
    }
}

/// Binds the validation rules to one data view. The main context works on
/// the confirmed chain; each fork core owns a context bound to its forked
/// view.
#[derive(Debug, Clone)]
pub struct ChainContext {
    dal: Dal,
}

impl ChainContext {
    pub fn new(dal: Dal) -> Self {
        ChainContext { dal }
    }

    pub fn dal(&self) -> &Dal {
        &self.dal
    }

    pub fn dal_mut(&mut self) -> &mut Dal {
        &mut self.dal
    }

    /// Validate a block against this view. With `with_sig_and_pow`,
    /// signatures are verified and the proof of work is checked against
    /// the issuer's personal trial level.
    pub fn check_block(&self, block: &Block, with_sig_and_pow: bool) -> rules::Result<()> {
        local::check_block(block, with_sig_and_pow)?;
        global::check_block(block, &self.dal, with_sig_and_pow)
    }

    /// Validate (optionally) then apply a block to this view. The
    /// application is transactional: on error the view is unchanged.
    pub fn add_block(&mut self, block: &Block, do_check: bool) -> Result<(), Error> {
        if do_check {
            self.check_block(block, true)?;
        }
        self.dal.apply_block(block)?;
        tracing::debug!(
            number = block.number,
            issuer = %block.issuer,
            "block applied to view"
        );
        Ok(())
    }

    pub fn current(&self) -> Option<&Block> {
        self.dal.current_block()
    }

    pub fn get_block(&self, number: u64) -> Result<&Block, Error> {
        Ok(self.dal.get_block(number)?)
    }

    /// The confirmed block at `number`; alias of [`ChainContext::get_block`]
    /// kept for the promotion vocabulary.
    pub fn get_promoted(&self, number: u64) -> Result<&Block, Error> {
        self.get_block(number)
    }

    /// Difficulty floor for the next block on this view.
    pub fn pow_min(&self) -> usize {
        global::expected_pow_min(&self.dal)
    }

    /// Median time required for the next block on this view.
    pub fn median_time(&self) -> u64 {
        global::expected_median_time(&self.dal)
    }

    /// Personal difficulty of `issuer` for the next block on this view.
    pub fn trial_level(&self, issuer: &str) -> usize {
        global::trial_level(&self.dal, issuer)
    }
}
