//! The block data model and its raw wire grammar.
//!
//! A block is carried on the wire as a line-oriented text document. The
//! document minus its trailing signature line is the signed payload; the
//! block hash is the SHA-1 digest of the whole document, and the proof of
//! work is the number of leading zero nibbles of that digest.

mod block;
mod entities;
mod params;
mod transaction;

pub use self::{
    block::{Block, BlockStamp, ParseError},
    entities::{
        identity_hash, BlockCertification, BlockIdentity, BlockMembership, Link, MembershipDoc,
        MembershipType, Peer, PendingCertification, PendingIdentity,
    },
    params::ProtocolParameters,
    transaction::{SourceKey, Transaction, TxInput, TxOutput},
};
