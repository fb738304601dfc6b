use serde::{Deserialize, Serialize};

use super::ParseError;

/// The protocol constants, committed once in the root block's
/// `Parameters` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolParameters {
    /// Relative growth of the universal dividend.
    pub c: f64,
    /// Seconds between two universal dividends.
    pub dt: u64,
    /// Amount of the very first universal dividend.
    pub ud0: u64,
    /// Seconds before a certification between the same two keys may be
    /// renewed.
    pub sig_delay: u64,
    /// Lifetime of a certification, in seconds of median time.
    pub sig_validity: u64,
    /// Number of valid incoming certifications required for membership.
    pub sig_qty: u64,
    /// Number of valid outgoing certifications making a member a sentry.
    pub sig_wot: u64,
    /// Lifetime of a membership, in seconds of median time.
    pub ms_validity: u64,
    /// Maximum number of certification hops between a sentry and any
    /// newcomer.
    pub step_max: u32,
    /// Number of preceding blocks over which the median time is computed.
    pub median_time_blocks: u64,
    /// Targeted seconds between blocks.
    pub avg_gen_time: u64,
    /// Number of blocks between two difficulty reevaluations.
    pub dt_diff_eval: u64,
    /// Number of preceding blocks considered by the issuance rotation rule.
    pub blocks_rot: u64,
    /// Per-block difficulty surcharge factor applied to recurring issuers.
    pub percent_rot: f64,
}

impl ProtocolParameters {
    /// Parse the colon-joined `Parameters` value of a root block.
    pub fn from_line(line: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 14 {
            return Err(ParseError::BadParameters);
        }
        let num = |i: usize| -> Result<u64, ParseError> {
            fields[i].parse().map_err(|_| ParseError::BadParameters)
        };
        let real = |i: usize| -> Result<f64, ParseError> {
            fields[i].parse().map_err(|_| ParseError::BadParameters)
        };
        Ok(ProtocolParameters {
            c: real(0)?,
            dt: num(1)?,
            ud0: num(2)?,
            sig_delay: num(3)?,
            sig_validity: num(4)?,
            sig_qty: num(5)?,
            sig_wot: num(6)?,
            ms_validity: num(7)?,
            step_max: num(8)? as u32,
            median_time_blocks: num(9)?,
            avg_gen_time: num(10)?,
            dt_diff_eval: num(11)?,
            blocks_rot: num(12)?,
            percent_rot: real(13)?,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.c,
            self.dt,
            self.ud0,
            self.sig_delay,
            self.sig_validity,
            self.sig_qty,
            self.sig_wot,
            self.ms_validity,
            self.step_max,
            self.median_time_blocks,
            self.avg_gen_time,
            self.dt_diff_eval,
            self.blocks_rot,
            self.percent_rot
        )
    }
}

impl Default for ProtocolParameters {
    fn default() -> Self {
        ProtocolParameters {
            c: 0.0488,
            dt: 86_400,
            ud0: 100,
            sig_delay: 0,
            sig_validity: 2_629_800,
            sig_qty: 3,
            sig_wot: 3,
            ms_validity: 2_629_800,
            step_max: 3,
            median_time_blocks: 20,
            avg_gen_time: 960,
            dt_diff_eval: 10,
            blocks_rot: 20,
            percent_rot: 0.67,
        }
    }
}
