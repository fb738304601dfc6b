//! Local validation: intra-block structural consistency, independent of
//! any chain history.

use std::collections::HashSet;

use crate::{
    blockcfg::Block,
    crypto,
    rules::{Error, Result},
};

/// Check a block's internal structure. With `with_signatures`, the issuer
/// and transaction signatures are verified cryptographically; otherwise
/// only their shape is checked.
pub fn check_block(block: &Block, with_signatures: bool) -> Result<()> {
    check_completeness(block)?;
    check_inline_uniqueness(block)?;
    check_ordering(block)?;
    check_certifications(block)?;
    check_transactions(block)?;
    if with_signatures {
        check_signatures(block)?;
    } else if !crypto::looks_like_signature(&block.signature) {
        return Err(Error::BadSignature(block.issuer.clone()));
    }
    Ok(())
}

fn check_completeness(block: &Block) -> Result<()> {
    if block.number == 0 {
        if block.parameters.is_none() {
            return Err(Error::BadStructure("root block without parameters"));
        }
        if block.previous_hash.is_some() || block.previous_issuer.is_some() {
            return Err(Error::BadStructure("root block with a previous block"));
        }
    } else {
        if block.parameters.is_some() {
            return Err(Error::BadStructure("parameters outside the root block"));
        }
        if block.previous_hash.is_none() || block.previous_issuer.is_none() {
            return Err(Error::BadStructure("missing previous block fields"));
        }
    }
    if block.dividend.is_some() != block.ud_time.is_some() {
        return Err(Error::BadStructure("dividend and UDTime must come together"));
    }
    if !crypto::looks_like_pubkey(&block.issuer) {
        return Err(Error::BadStructure("issuer is not a public key"));
    }
    if block.time < block.median_time {
        return Err(Error::BadIssuerTime);
    }
    Ok(())
}

fn check_inline_uniqueness(block: &Block) -> Result<()> {
    let mut uids = HashSet::new();
    let mut identity_keys = HashSet::new();
    for identity in &block.identities {
        if !uids.insert(identity.uid.as_str()) {
            return Err(Error::UidTaken(identity.uid.clone()));
        }
        if !identity_keys.insert(identity.pubkey.as_str()) {
            return Err(Error::PubkeyTaken(identity.pubkey.clone()));
        }
    }

    // one membership per key across joiners, actives and leavers
    let mut membership_keys = HashSet::new();
    for membership in block
        .joiners
        .iter()
        .chain(&block.actives)
        .chain(&block.leavers)
    {
        if !membership_keys.insert(membership.issuer.as_str()) {
            return Err(Error::DoubleMembership(membership.issuer.clone()));
        }
    }

    let mut excluded_keys = HashSet::new();
    for excluded in &block.excluded {
        if !excluded_keys.insert(excluded.as_str()) {
            return Err(Error::BadStructure("duplicate excluded entry"));
        }
        if membership_keys.contains(excluded.as_str()) {
            return Err(Error::BadStructure("excluded key also files a membership"));
        }
    }
    Ok(())
}

fn check_ordering(block: &Block) -> Result<()> {
    fn sorted_by<T>(items: &[T], key: impl Fn(&T) -> &str) -> bool {
        items.windows(2).all(|w| key(&w[0]) <= key(&w[1]))
    }
    if !sorted_by(&block.identities, |i| i.pubkey.as_str())
        || !sorted_by(&block.joiners, |m| m.issuer.as_str())
        || !sorted_by(&block.actives, |m| m.issuer.as_str())
        || !sorted_by(&block.leavers, |m| m.issuer.as_str())
        || !sorted_by(&block.excluded, |p| p.as_str())
    {
        return Err(Error::BadStructure("inline records out of order"));
    }
    let certifications_sorted = block
        .certifications
        .windows(2)
        .all(|w| (&w[0].from, &w[0].to) <= (&w[1].from, &w[1].to));
    if !certifications_sorted {
        return Err(Error::BadStructure("certifications out of order"));
    }
    Ok(())
}

fn check_certifications(block: &Block) -> Result<()> {
    let mut seen = HashSet::new();
    for certification in &block.certifications {
        if certification.from == certification.to {
            return Err(Error::BadStructure("self certification"));
        }
        if !seen.insert((certification.from.as_str(), certification.to.as_str())) {
            return Err(Error::BadStructure("duplicate certification"));
        }
    }
    Ok(())
}

fn check_transactions(block: &Block) -> Result<()> {
    let mut hashes = HashSet::new();
    for transaction in &block.transactions {
        if transaction.issuers.is_empty() {
            return Err(Error::BadTransaction("no issuer"));
        }
        if transaction.inputs.is_empty() || transaction.outputs.is_empty() {
            return Err(Error::BadTransaction("empty input or output list"));
        }
        if transaction.signatures.len() != transaction.issuers.len() {
            return Err(Error::BadTransaction("signature count mismatch"));
        }
        if transaction.input_sum() != transaction.output_sum() {
            return Err(Error::BadTransaction("inputs do not balance outputs"));
        }
        if !hashes.insert(transaction.hash()) {
            return Err(Error::BadTransaction("duplicate transaction"));
        }
    }
    Ok(())
}

fn check_signatures(block: &Block) -> Result<()> {
    let payload = block.signed_payload();
    let valid = crypto::verify(&block.issuer, payload.as_bytes(), &block.signature)
        .unwrap_or(false);
    if !valid {
        return Err(Error::BadSignature(block.issuer.clone()));
    }
    for transaction in &block.transactions {
        let tx_payload = transaction.signed_payload();
        for (issuer, signature) in transaction.issuers.iter().zip(&transaction.signatures) {
            let valid =
                crypto::verify(issuer, tx_payload.as_bytes(), signature).unwrap_or(false);
            if !valid {
                return Err(Error::BadTransaction("wrong issuer signature"));
            }
        }
    }
    Ok(())
}
