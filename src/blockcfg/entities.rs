use serde::{Deserialize, Serialize};

use super::ParseError;
use crate::crypto;

/// Compute the hash identifying a self-declared identity:
/// `SHA1(uid | certts | issuer)`, uppercase hex.
pub fn identity_hash(uid: &str, certts: u64, issuer: &str) -> String {
    crypto::sha1_hex(format!("{}{}{}", uid, certts, issuer).as_bytes())
}

/// An identity record as inlined in a block:
/// `PUBKEY:SIGNATURE:TIMESTAMP:USERID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIdentity {
    pub pubkey: String,
    pub signature: String,
    pub time: u64,
    pub uid: String,
}

impl BlockIdentity {
    pub fn hash(&self) -> String {
        identity_hash(&self.uid, self.time, &self.pubkey)
    }

    pub fn to_inline(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.pubkey, self.signature, self.time, self.uid
        )
    }

    pub fn from_inline(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(ParseError::BadInlineRecord("identity"));
        }
        Ok(BlockIdentity {
            pubkey: fields[0].to_string(),
            signature: fields[1].to_string(),
            time: fields[2]
                .parse()
                .map_err(|_| ParseError::BadInlineRecord("identity"))?,
            uid: fields[3].to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipType {
    In,
    Out,
}

impl MembershipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipType::In => "IN",
            MembershipType::Out => "OUT",
        }
    }
}

/// A membership record as inlined in a block (joiners, actives, leavers):
/// `PUBKEY:SIGNATURE:MSN:CERTTS:USERID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMembership {
    pub issuer: String,
    pub signature: String,
    /// Membership sequence number.
    pub number: u64,
    pub certts: u64,
    pub uid: String,
}

impl BlockMembership {
    pub fn to_inline(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.issuer, self.signature, self.number, self.certts, self.uid
        )
    }

    pub fn from_inline(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 5 {
            return Err(ParseError::BadInlineRecord("membership"));
        }
        Ok(BlockMembership {
            issuer: fields[0].to_string(),
            signature: fields[1].to_string(),
            number: fields[2]
                .parse()
                .map_err(|_| ParseError::BadInlineRecord("membership"))?,
            certts: fields[3]
                .parse()
                .map_err(|_| ParseError::BadInlineRecord("membership"))?,
            uid: fields[4].to_string(),
        })
    }

    /// Hash of the identity this membership refers to.
    pub fn identity_hash(&self) -> String {
        identity_hash(&self.uid, self.certts, &self.issuer)
    }
}

/// A certification record as inlined in a block:
/// `FROM:TO:BLOCKNUMBER:SIGNATURE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCertification {
    pub from: String,
    pub to: String,
    /// The block the certification is based upon.
    pub block_number: u64,
    pub signature: String,
}

impl BlockCertification {
    pub fn to_inline(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.from, self.to, self.block_number, self.signature
        )
    }

    pub fn from_inline(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            return Err(ParseError::BadInlineRecord("certification"));
        }
        Ok(BlockCertification {
            from: fields[0].to_string(),
            to: fields[1].to_string(),
            block_number: fields[2]
                .parse()
                .map_err(|_| ParseError::BadInlineRecord("certification"))?,
            signature: fields[3].to_string(),
        })
    }
}

/// A certification edge materialized by an accepted block. Links expire
/// with `sig_validity` and may not be renewed before `sig_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: String,
    pub to: String,
    /// Median time of the block that materialized the link.
    pub timestamp: u64,
    /// The basis block of the underlying certification.
    pub block_number: u64,
}

/// A standalone membership document from the pending pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipDoc {
    pub issuer: String,
    pub uid: String,
    pub certts: u64,
    /// Membership sequence number.
    pub number: u64,
    pub membership: MembershipType,
    pub signature: String,
}

impl MembershipDoc {
    pub fn identity_hash(&self) -> String {
        identity_hash(&self.uid, self.certts, &self.issuer)
    }
}

/// A self-declared identity from the pending pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIdentity {
    pub pubkey: String,
    pub uid: String,
    /// Certification timestamp of the self-declaration.
    pub time: u64,
    pub signature: String,
}

impl PendingIdentity {
    pub fn hash(&self) -> String {
        identity_hash(&self.uid, self.time, &self.pubkey)
    }

    pub fn as_block_identity(&self) -> BlockIdentity {
        BlockIdentity {
            pubkey: self.pubkey.clone(),
            signature: self.signature.clone(),
            time: self.time,
            uid: self.uid.clone(),
        }
    }
}

/// A certification from the pending pool, targeting an identity by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCertification {
    pub from: String,
    /// Hash of the target identity.
    pub target: String,
    pub block_number: u64,
    pub signature: String,
    /// Set once the certification has been written into a block.
    pub linked: bool,
}

/// A peer record forwarded between fork views on promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub pubkey: String,
    pub endpoints: Vec<String>,
}
