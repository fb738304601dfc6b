//! Per-counter block statistics.
//!
//! Each counter keeps the list of confirmed blocks that contributed to it
//! and the last block parsed, so recomputation is incremental.

use crate::{blockcfg::Block, dal::Dal};

pub const STAT_NAMES: [&str; 8] = [
    "newcomers",
    "certs",
    "joiners",
    "actives",
    "leavers",
    "excluded",
    "ud",
    "tx",
];

fn contributes(name: &str, block: &Block) -> bool {
    match name {
        "newcomers" => !block.identities.is_empty(),
        "certs" => !block.certifications.is_empty(),
        "joiners" => !block.joiners.is_empty(),
        "actives" => !block.actives.is_empty(),
        "leavers" => !block.leavers.is_empty(),
        "excluded" => !block.excluded.is_empty(),
        "ud" => block.dividend.is_some(),
        "tx" => !block.transactions.is_empty(),
        _ => false,
    }
}

/// Bring every counter up to date with the confirmed chain.
pub fn compute(dal: &mut Dal) {
    let current = match dal.current_block() {
        Some(current) => current.number,
        None => return,
    };
    for name in STAT_NAMES {
        let mut stat = dal.get_stat(name);
        let from = stat.last_parsed_block.map(|n| n + 1).unwrap_or(0);
        for number in from..=current {
            if let Some(block) = dal.get_block_or_null(number) {
                if contributes(name, block) {
                    stat.blocks.push(number);
                }
            }
        }
        stat.last_parsed_block = Some(current);
        dal.save_stat(name, stat);
    }
    tracing::debug!(up_to = current, "statistics recomputed");
}
