//! Global validation: checks of a block against a given chain view, and
//! the derived quantities (median time, difficulty floor, personal trial
//! level, dividend schedule) shared with block assembly.

use std::collections::HashSet;

use crate::{
    blockcfg::{Block, SourceKey, Transaction},
    dal::Dal,
    rules::{wot, Error, Result},
};

/// Median time required for the next block: the median of the issuer times
/// of the last `median_time_blocks` blocks, floored by the current median
/// time so it never goes backward.
pub fn expected_median_time(dal: &Dal) -> u64 {
    let current = match dal.current_block() {
        Some(current) => current,
        None => return 0,
    };
    let window = dal.params().median_time_blocks.max(1);
    let from = (current.number + 1).saturating_sub(window);
    let mut times: Vec<u64> = (from..=current.number)
        .filter_map(|n| dal.get_block_or_null(n))
        .map(|b| b.time)
        .collect();
    times.sort_unstable();
    let median = times[(times.len() - 1) / 2];
    median.max(current.median_time)
}

/// Difficulty floor required for the next block. Reevaluated every
/// `dt_diff_eval` blocks against the observed issuance speed.
pub fn expected_pow_min(dal: &Dal) -> usize {
    let current = match dal.current_block() {
        Some(current) => current,
        None => return 0,
    };
    let params = dal.params();
    let next = current.number + 1;
    let previous = current.pow_min;
    if params.dt_diff_eval == 0 || next % params.dt_diff_eval != 0 {
        return previous;
    }
    let lower_number = next.saturating_sub(params.dt_diff_eval + 1);
    let lower = dal
        .get_block_or_null(lower_number)
        .map(|b| b.median_time)
        .unwrap_or(0);
    let duration = current.median_time.saturating_sub(lower);
    let expected = params.avg_gen_time * params.dt_diff_eval;
    if duration * 10 < expected * 9 {
        previous + 1
    } else if duration * 10 > expected * 11 {
        previous.saturating_sub(1)
    } else {
        previous
    }
}

/// Personal difficulty of an issuer for the next block: the difficulty
/// floor plus a surcharge for each block it signed among the last
/// `blocks_rot` ones, scaled by `percent_rot`.
pub fn trial_level(dal: &Dal, issuer: &str) -> usize {
    let floor = expected_pow_min(dal);
    let current = match dal.current_block() {
        Some(current) => current,
        None => return floor,
    };
    let params = dal.params();
    let from = (current.number + 1).saturating_sub(params.blocks_rot);
    let signed = (from..=current.number)
        .filter_map(|n| dal.get_block_or_null(n))
        .filter(|b| b.issuer == issuer)
        .count();
    floor + (signed as f64 * params.percent_rot).floor() as usize
}

/// The dividend the next block must carry, if any:
/// `(amount, ud_time, monetary_mass)`.
pub fn expected_dividend(dal: &Dal, median_time: u64, members_count: u64) -> Option<(u64, u64, u64)> {
    let params = dal.params();
    let root_time = dal.get_block_or_null(0)?.median_time;
    let last_ud_time = dal.last_ud().map(|u| u.ud_time).unwrap_or(root_time);
    if members_count == 0 || last_ud_time + params.dt > median_time {
        return None;
    }
    let mass = dal.monetary_mass();
    let previous = dal.last_ud().map(|u| u.amount).unwrap_or(params.ud0);
    let proportional = (params.c * mass as f64 / members_count as f64).ceil() as u64;
    let amount = previous.max(proportional);
    Some((
        amount,
        last_ud_time + params.dt,
        mass + amount * members_count,
    ))
}

/// Check a block against the chain view. `with_pow` also verifies the
/// proof of work against the issuer's personal trial level.
pub fn check_block(block: &Block, dal: &Dal, with_pow: bool) -> Result<()> {
    let params = dal.params().clone();

    if block.number > 0 {
        let current = dal.current_block().ok_or(Error::PreviousNotFound)?;
        if block.number != current.number + 1
            || block.previous_hash.as_deref() != dal.current_hash()
            || block.previous_issuer.as_deref() != Some(current.issuer.as_str())
        {
            return Err(Error::PreviousNotFound);
        }
        let median = expected_median_time(dal);
        if block.median_time != median {
            return Err(Error::BadMedianTime {
                got: block.median_time,
                required: median,
            });
        }
    } else if dal.current_block().is_some() {
        return Err(Error::AlreadyKnown);
    }

    let pow_min = expected_pow_min(dal);
    if block.pow_min != pow_min {
        return Err(Error::BadPoWMin {
            got: block.pow_min,
            required: pow_min,
        });
    }
    if with_pow {
        let required = trial_level(dal, &block.issuer);
        let got = Block::zero_nibbles(&block.hash());
        if got < required {
            return Err(Error::BadPoW { got, required });
        }
    }

    let issuer_joins = block.joiners.iter().any(|j| j.issuer == block.issuer);
    if !dal.is_member(&block.issuer) && !issuer_joins {
        return Err(Error::IssuerNotMember(block.issuer.clone()));
    }

    check_identities(block, dal)?;
    let newcomers = check_memberships(block, dal, &params)?;
    check_exclusions(block, dal)?;
    check_certifications(block, dal, &params)?;

    let new_links: Vec<(String, String)> = block
        .certifications
        .iter()
        .map(|c| (c.from.clone(), c.to.clone()))
        .collect();
    wot::check_wot_constraints(dal, block.median_time, &newcomers, &new_links)?;

    let previous_count = dal.current_block().map(|c| c.members_count).unwrap_or(0);
    let expected_count =
        previous_count + newcomers.len() as u64 - block.excluded.len() as u64;
    if block.members_count != expected_count {
        return Err(Error::BadMembersCount {
            got: block.members_count,
            required: expected_count,
        });
    }

    check_dividend(block, dal)?;
    check_transactions(block, dal)?;
    Ok(())
}

fn check_identities(block: &Block, dal: &Dal) -> Result<()> {
    for identity in &block.identities {
        if let Some(existing) = dal.identity_by_uid(&identity.uid) {
            if existing.pubkey != identity.pubkey {
                return Err(Error::UidTaken(identity.uid.clone()));
            }
        }
        if dal.identity_by_pubkey(&identity.pubkey).is_some() {
            return Err(Error::PubkeyTaken(identity.pubkey.clone()));
        }
    }
    Ok(())
}

/// Validate joiners, actives and leavers; returns the pubkeys entering the
/// member set.
fn check_memberships(
    block: &Block,
    dal: &Dal,
    params: &crate::blockcfg::ProtocolParameters,
) -> Result<Vec<String>> {
    let mut newcomers = Vec::new();
    for joiner in &block.joiners {
        let in_block = block
            .identities
            .iter()
            .any(|i| i.pubkey == joiner.issuer && i.hash() == joiner.identity_hash());
        match dal.identity_by_pubkey(&joiner.issuer) {
            Some(identity) => {
                if identity.member {
                    return Err(Error::DoubleMembership(joiner.issuer.clone()));
                }
                if identity.current_msn.map_or(false, |msn| joiner.number <= msn) {
                    return Err(Error::DoubleMembership(joiner.issuer.clone()));
                }
                newcomers.push(joiner.issuer.clone());
            }
            None if in_block => newcomers.push(joiner.issuer.clone()),
            None => return Err(Error::BadStructure("joiner without identity")),
        }
        if block.median_time >= joiner.certts + params.ms_validity {
            return Err(Error::ExpiredMembership(joiner.issuer.clone()));
        }
    }
    for active in &block.actives {
        let identity = dal
            .identity_by_pubkey(&active.issuer)
            .filter(|i| i.member)
            .ok_or_else(|| Error::DoubleMembership(active.issuer.clone()))?;
        if identity.current_msn.map_or(false, |msn| active.number <= msn) {
            return Err(Error::DoubleMembership(active.issuer.clone()));
        }
    }
    for leaver in &block.leavers {
        let identity = dal
            .identity_by_pubkey(&leaver.issuer)
            .filter(|i| i.member)
            .ok_or_else(|| Error::DoubleMembership(leaver.issuer.clone()))?;
        if identity.current_msn.map_or(false, |msn| leaver.number <= msn) {
            return Err(Error::DoubleMembership(leaver.issuer.clone()));
        }
    }
    Ok(newcomers)
}

fn check_exclusions(block: &Block, dal: &Dal) -> Result<()> {
    if block.excluded.is_empty() {
        return Ok(());
    }
    let kicked = dal.to_be_kicked(block.median_time);
    for excluded in &block.excluded {
        if !kicked.contains(excluded) {
            return Err(Error::BadExcluded(excluded.clone()));
        }
    }
    Ok(())
}

fn check_certifications(
    block: &Block,
    dal: &Dal,
    params: &crate::blockcfg::ProtocolParameters,
) -> Result<()> {
    for certification in &block.certifications {
        let from_member = dal.is_member(&certification.from);
        let from_joiner = block.joiners.iter().any(|j| j.issuer == certification.from);
        if !from_member && !from_joiner {
            return Err(Error::CertFromNonMember(certification.from.clone()));
        }
        let to_member = dal.is_member(&certification.to);
        let to_joiner = block.joiners.iter().any(|j| j.issuer == certification.to);
        if !to_member && !to_joiner {
            return Err(Error::BadStructure("certification to a non-member"));
        }

        if block.number == 0 {
            if certification.block_number != 0 {
                return Err(Error::CertBasisNotFound {
                    from: certification.from.clone(),
                    to: certification.to.clone(),
                });
            }
        } else {
            let basis = dal
                .get_block_or_null(certification.block_number)
                .ok_or_else(|| Error::CertBasisNotFound {
                    from: certification.from.clone(),
                    to: certification.to.clone(),
                })?;
            if block.median_time > basis.median_time + params.sig_validity {
                return Err(Error::StaleCert {
                    from: certification.from.clone(),
                    to: certification.to.clone(),
                });
            }
        }

        let replay_floor = block.median_time.saturating_sub(params.sig_delay);
        if dal.exists_link_from_or_after(&certification.from, &certification.to, replay_floor)
        {
            return Err(Error::ReplayedCert {
                from: certification.from.clone(),
                to: certification.to.clone(),
            });
        }
    }
    Ok(())
}

fn check_dividend(block: &Block, dal: &Dal) -> Result<()> {
    match expected_dividend(dal, block.median_time, block.members_count) {
        Some((amount, ud_time, mass)) => {
            if block.dividend != Some(amount)
                || block.ud_time != Some(ud_time)
                || block.monetary_mass != mass
            {
                return Err(Error::BadDividend);
            }
        }
        None => {
            if block.dividend.is_some() || block.monetary_mass != dal.monetary_mass() {
                return Err(Error::BadDividend);
            }
        }
    }
    Ok(())
}

fn check_transactions(block: &Block, dal: &Dal) -> Result<()> {
    let mut consumed: HashSet<&SourceKey> = HashSet::new();
    for transaction in &block.transactions {
        check_single_transaction(transaction, dal)?;
        for input in &transaction.inputs {
            if !consumed.insert(&input.source) {
                return Err(Error::BadTransaction("source spent twice in the block"));
            }
        }
    }
    Ok(())
}

/// Check one transaction against the view: every input must reference an
/// unconsumed source owned by one of the issuers, with a matching amount.
pub fn check_single_transaction(transaction: &Transaction, dal: &Dal) -> Result<()> {
    for input in &transaction.inputs {
        let amount = transaction
            .issuers
            .iter()
            .find_map(|issuer| dal.available_source(&input.source, issuer));
        match amount {
            Some(amount) if amount == input.amount => {}
            Some(_) => return Err(Error::BadTransaction("input amount mismatch")),
            None => return Err(Error::BadTransaction("missing or spent source")),
        }
    }
    Ok(())
}
