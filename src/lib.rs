//! Blockchain service core of a uCoin family currency node.
//!
//! The chain encodes the evolution of a web-of-trust membership graph and
//! a universal dividend. This crate covers the consensus core: accepting
//! and ordering blocks, maintaining competing branches within a bounded
//! window, assembling candidate blocks under web-of-trust stability, and
//! coordinating the proof-of-work miner.
//!
//! Network transport, key storage and the persistence backend stay
//! outside; they interact with the core through [`service::BlockchainService`],
//! the [`intercom`] messages and the [`dal`] view.

pub mod blockcfg;
pub mod blockchain;
pub mod crypto;
pub mod dal;
pub mod generator;
pub mod intercom;
pub mod pow;
pub mod rules;
pub mod service;
pub mod settings;
pub mod stats;
pub mod utils;

pub use crate::{
    blockcfg::{Block, BlockStamp},
    blockchain::{Admission, ForkManager},
    service::BlockchainService,
    settings::Settings,
};
