// Relay topology
//
// Directed graph of relays: an edge a -> b means relay a forwards to relay b.
// Forwarding decisions never rely on call depth alone; they consult the visited
// path carried by the request and a hop budget.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::HashMap;

use crate::config::Config;

pub struct RelayGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    local: NodeIndex,
    hop_limit: u8,
}

impl RelayGraph {
    pub fn new(local_id: &str, hop_limit: u8) -> Self {
        let mut graph = DiGraph::new();
        let local = graph.add_node(local_id.to_string());
        let mut index = HashMap::new();
        index.insert(local_id.to_string(), local);
        Self {
            graph,
            index,
            local,
            hop_limit,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut topology = Self::new(&config.relay.id, config.relay.hop_limit);
        for peer in &config.peers {
            topology.add_link(&config.relay.id, &peer.id);
            for link in &peer.links {
                topology.add_link(&peer.id, link);
            }
        }
        if topology.has_cycles() {
            tracing::info!(
                "Relay topology around {} contains cycles; forwarding relies on the visited-relay guard",
                config.relay.id
            );
        }
        topology
    }

    fn node(&mut self, id: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.index.insert(id.to_string(), idx);
        idx
    }

    pub fn add_link(&mut self, from: &str, to: &str) {
        let from = self.node(from);
        let to = self.node(to);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn local_id(&self) -> &str {
        &self.graph[self.local]
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Hops left for a request that arrived carrying `requested` (absent for user requests)
    pub fn remaining_hops(&self, requested: Option<u8>) -> u8 {
        requested.map_or(self.hop_limit, |hops| hops.min(self.hop_limit))
    }

    /// May this relay forward to `peer`, given the relays the request already visited?
    pub fn may_forward(&self, peer: &str, visited: &[String], remaining_hops: u8) -> bool {
        if remaining_hops == 0 || peer == self.local_id() {
            return false;
        }
        if visited.iter().any(|relay| relay == peer) {
            return false;
        }
        match self.index.get(peer) {
            Some(idx) => self.graph.find_edge(self.local, *idx).is_some(),
            None => false,
        }
    }

    /// Relays known to be reachable from here, this relay included
    pub fn reachable(&self) -> Vec<String> {
        let mut reachable = Vec::new();
        let mut bfs = Bfs::new(&self.graph, self.local);
        while let Some(idx) = bfs.next(&self.graph) {
            reachable.push(self.graph[idx].clone());
        }
        reachable.sort();
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> RelayGraph {
        let mut graph = RelayGraph::new("a", 4);
        graph.add_link("a", "b");
        graph.add_link("b", "c");
        graph.add_link("c", "a");
        graph
    }

    #[test]
    fn test_cycle_detection() {
        assert!(ring().has_cycles());

        let mut line = RelayGraph::new("a", 4);
        line.add_link("a", "b");
        line.add_link("b", "c");
        assert!(!line.has_cycles());
    }

    #[test]
    fn test_visited_relays_are_not_revisited() {
        let graph = ring();
        assert!(graph.may_forward("b", &[], 4));
        assert!(!graph.may_forward("b", &["c".to_string(), "b".to_string()], 4));
        assert!(!graph.may_forward("a", &[], 4));
    }

    #[test]
    fn test_hop_budget() {
        let graph = ring();
        assert!(!graph.may_forward("b", &[], 0));
        assert_eq!(graph.remaining_hops(None), 4);
        assert_eq!(graph.remaining_hops(Some(9)), 4);
        assert_eq!(graph.remaining_hops(Some(1)), 1);
    }

    #[test]
    fn test_only_direct_peers_are_forward_targets() {
        let graph = ring();
        assert!(!graph.may_forward("c", &[], 4));
        assert!(!graph.may_forward("unknown", &[], 4));
        assert_eq!(graph.reachable(), vec!["a", "b", "c"]);
    }
}
