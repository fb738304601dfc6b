//! Block validation rules.
//!
//! Split in two pure layers: [`local`] checks a block's internal
//! consistency without any chain context; [`global`] checks it against a
//! given view of the chain. [`wot`] carries the web-of-trust reachability
//! used both by global validation and by block assembly.

pub mod global;
pub mod local;
pub mod wot;

use thiserror::Error;

/// A validation failure with a stable code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("previous block not found")]
    PreviousNotFound,
    #[error("block already known")]
    AlreadyKnown,
    #[error("wrong signature by {0}")]
    BadSignature(String),
    #[error("proof of work below the required level ({got} < {required})")]
    BadPoW { got: usize, required: usize },
    #[error("wrong PoWMin field ({got} instead of {required})")]
    BadPoWMin { got: usize, required: usize },
    #[error("newcomer {newcomer} is out of reach of {} sentries", .sentries.len())]
    Outdistanced {
        newcomer: String,
        sentries: Vec<String>,
    },
    #[error("certification {from} -> {to} replays a live link")]
    ReplayedCert { from: String, to: String },
    #[error("certification {from} -> {to} is based on an expired block")]
    StaleCert { from: String, to: String },
    #[error("certification {from} -> {to} is based on an unknown block")]
    CertBasisNotFound { from: String, to: String },
    #[error("certifier {0} is not a member")]
    CertFromNonMember(String),
    #[error("block issuer {0} is not a member")]
    IssuerNotMember(String),
    #[error("uid {0} already taken")]
    UidTaken(String),
    #[error("pubkey {0} already taken")]
    PubkeyTaken(String),
    #[error("membership of {0} conflicts with its current state")]
    DoubleMembership(String),
    #[error("membership document of {0} is expired")]
    ExpiredMembership(String),
    #[error("newcomer {pubkey} has {got} certifications, {required} required")]
    NotEnoughCerts {
        pubkey: String,
        got: u64,
        required: u64,
    },
    #[error("wrong MedianTime ({got} instead of {required})")]
    BadMedianTime { got: u64, required: u64 },
    #[error("issuer time is inconsistent with the median time")]
    BadIssuerTime,
    #[error("wrong dividend or monetary mass")]
    BadDividend,
    #[error("wrong MembersCount ({got} instead of {required})")]
    BadMembersCount { got: u64, required: u64 },
    #[error("excluded entry {0} is not to be kicked")]
    BadExcluded(String),
    #[error("malformed block: {0}")]
    BadStructure(&'static str),
    #[error("invalid transaction: {0}")]
    BadTransaction(&'static str),
}

impl Error {
    /// Stable error code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::PreviousNotFound => "ErrPreviousNotFound",
            Error::AlreadyKnown => "ErrAlreadyKnown",
            Error::BadSignature(_) => "ErrBadSignature",
            Error::BadPoW { .. } => "ErrBadPoW",
            Error::BadPoWMin { .. } => "ErrBadPoW",
            Error::Outdistanced { .. } => "ErrOutdistanced",
            Error::ReplayedCert { .. } => "ErrReplayedCert",
            Error::StaleCert { .. } => "ErrStaleCert",
            Error::CertBasisNotFound { .. } => "ErrStaleCert",
            Error::CertFromNonMember(_) => "ErrCertFromNonMember",
            Error::IssuerNotMember(_) => "ErrIssuerNotMember",
            Error::UidTaken(_) => "ErrUidTaken",
            Error::PubkeyTaken(_) => "ErrPubkeyTaken",
            Error::DoubleMembership(_) => "ErrDoubleMembership",
            Error::ExpiredMembership(_) => "ErrExpiredMembership",
            Error::NotEnoughCerts { .. } => "ErrNotEnoughCerts",
            Error::BadMedianTime { .. } => "ErrBadMedianTime",
            Error::BadIssuerTime => "ErrBadMedianTime",
            Error::BadDividend => "ErrBadDividend",
            Error::BadMembersCount { .. } => "ErrBadMembersCount",
            Error::BadExcluded(_) => "ErrBadExcluded",
            Error::BadStructure(_) => "ErrBadStructure",
            Error::BadTransaction(_) => "ErrBadTransaction",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
