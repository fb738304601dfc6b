//! Node configuration recognized by the blockchain core.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::blockcfg::ProtocolParameters;

fn default_cpu() -> f64 {
    0.6
}

fn default_window() -> u64 {
    3
}

/// Settings of the blockchain service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub currency: String,

    /// Number of candidate blocks a branch may accumulate before its oldest
    /// block is promoted into the confirmed chain.
    #[serde(default = "default_window")]
    pub branches_window_size: u64,

    /// Whether this node mines candidate blocks.
    #[serde(default)]
    pub participate: bool,

    /// Seconds to wait before mining again after a self-issued block.
    #[serde(default)]
    pub pow_delay: u64,

    /// Fraction of one CPU the miner worker may consume, in `(0, 1]`.
    #[serde(default = "default_cpu")]
    pub cpu: f64,

    /// Seconds subtracted from the wall clock to timestamp the root block.
    #[serde(default)]
    pub rootoffset: u64,

    /// Founding uids selected by the operator. While the chain is empty,
    /// the mining loop assembles the root block from this selection; when
    /// it is empty, root creation stays a manual operation.
    #[serde(default)]
    pub root_uids: Vec<String>,

    /// Directory receiving exported transaction record files.
    pub data_dir: Option<PathBuf>,

    /// The protocol constants; committed in the root block.
    #[serde(default)]
    pub params: ProtocolParameters,
}

impl Settings {
    pub fn new(currency: impl Into<String>) -> Self {
        Settings {
            currency: currency.into(),
            branches_window_size: default_window(),
            participate: false,
            pow_delay: 0,
            cpu: default_cpu(),
            rootoffset: 0,
            root_uids: Vec::new(),
            data_dir: None,
            params: ProtocolParameters::default(),
        }
    }
}
