//! Web-of-trust reachability.
//!
//! The trust graph is directed: an edge goes from the certifier to the
//! certified key. A newcomer is admissible when every sentry reaches it
//! within `step_max` hops on the graph as it would stand after the block.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    blockcfg::Link,
    dal::Dal,
    rules::{Error, Result},
};

/// The certification graph a candidate block would materialize, indexed by
/// target for backward traversal.
pub struct PostBlockGraph {
    incoming: HashMap<String, Vec<String>>,
}

impl PostBlockGraph {
    /// Build from the valid links of `dal` at median time `at`, plus the
    /// prospective `new_links` `(from, to)` pairs of the block.
    pub fn build(dal: &Dal, at: u64, new_links: &[(String, String)]) -> Self {
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for link in dal.valid_links(at) {
            incoming
                .entry(link.to.clone())
                .or_default()
                .push(link.from.clone());
        }
        for (from, to) in new_links {
            incoming.entry(to.clone()).or_default().push(from.clone());
        }
        PostBlockGraph { incoming }
    }

    pub fn from_links(links: &[Link]) -> Self {
        let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
        for link in links {
            incoming
                .entry(link.to.clone())
                .or_default()
                .push(link.from.clone());
        }
        PostBlockGraph { incoming }
    }

    /// The subset of `sentries` that do NOT reach `target` within
    /// `step_max` hops. The target is admissible iff the result is empty.
    pub fn outdistanced_from(
        &self,
        sentries: &[String],
        target: &str,
        step_max: u32,
    ) -> Vec<String> {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, u32)> = VecDeque::new();
        reached.insert(target);
        queue.push_back((target, 0));
        while let Some((node, depth)) = queue.pop_front() {
            if depth == step_max {
                continue;
            }
            if let Some(certifiers) = self.incoming.get(node) {
                for certifier in certifiers {
                    if reached.insert(certifier) {
                        queue.push_back((certifier, depth + 1));
                    }
                }
            }
        }
        sentries
            .iter()
            .filter(|s| !reached.contains(s.as_str()))
            .cloned()
            .collect()
    }
}

/// Check that every key of `newcomers` would hold enough incoming
/// certifications and stay within reach of every sentry once `new_links`
/// are materialized.
pub fn check_wot_constraints(
    dal: &Dal,
    at: u64,
    newcomers: &[String],
    new_links: &[(String, String)],
) -> Result<()> {
    let params = dal.params().clone();
    let sentries = dal.sentries(at);
    let graph = PostBlockGraph::build(dal, at, new_links);
    for newcomer in newcomers {
        let existing = dal.valid_links_to(newcomer, at).len() as u64;
        let incoming = new_links.iter().filter(|(_, to)| to == newcomer).count() as u64;
        if existing + incoming < params.sig_qty {
            return Err(Error::NotEnoughCerts {
                pubkey: newcomer.clone(),
                got: existing + incoming,
                required: params.sig_qty,
            });
        }
        let failing = graph.outdistanced_from(&sentries, newcomer, params.step_max);
        if !failing.is_empty() {
            return Err(Error::Outdistanced {
                newcomer: newcomer.clone(),
                sentries: failing,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> PostBlockGraph {
        let links: Vec<Link> = edges
            .iter()
            .map(|(from, to)| Link {
                from: from.to_string(),
                to: to.to_string(),
                timestamp: 0,
                block_number: 0,
            })
            .collect();
        PostBlockGraph::from_links(&links)
    }

    #[test]
    fn direct_certifier_is_within_one_hop() {
        let g = graph(&[("S", "N")]);
        assert!(g.outdistanced_from(&["S".into()], "N", 1).is_empty());
    }

    #[test]
    fn chain_of_hops_is_bounded_by_step_max() {
        // S -> a -> b -> N: three hops
        let g = graph(&[("S", "a"), ("a", "b"), ("b", "N")]);
        assert!(g.outdistanced_from(&["S".into()], "N", 3).is_empty());
        assert_eq!(g.outdistanced_from(&["S".into()], "N", 2), vec!["S"]);
    }

    #[test]
    fn unreachable_sentry_is_reported() {
        let g = graph(&[("S1", "N")]);
        let failing = g.outdistanced_from(&["S1".into(), "S2".into()], "N", 3);
        assert_eq!(failing, vec!["S2"]);
    }
}
