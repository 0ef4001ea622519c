//! Read-only views of a route table.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::router::{RouteTable, Router};

/// Every `(origin, destination)` pair, sorted.
pub fn edges(routes: &RouteTable) -> Vec<(String, String)> {
    routes
        .iter()
        .flat_map(|(origin, destinations)| {
            destinations
                .iter()
                .map(move |destination| (origin.clone(), destination.clone()))
        })
        .collect()
}

/// Graphviz source for the route table.
pub fn to_dot(routes: &RouteTable, name: &str) -> String {
    let lines: Vec<String> = edges(routes)
        .into_iter()
        .map(|(origin, destination)| format!("\"{origin}\" -> \"{destination}\";"))
        .collect();
    format!("digraph {name} {{\n{}\n}}", lines.join("\n"))
}

/// The route table as a petgraph graph, one vertex per name seen in any edge.
pub fn to_graph(routes: &RouteTable) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut index_of: HashMap<String, NodeIndex> = HashMap::new();

    for (origin, destination) in edges(routes) {
        let i = *index_of
            .entry(origin.clone())
            .or_insert_with(|| graph.add_node(origin));
        let j = *index_of
            .entry(destination.clone())
            .or_insert_with(|| graph.add_node(destination));
        graph.add_edge(i, j, ());
    }

    (graph, index_of)
}

/// Whether a message can travel back to a node it already passed.
pub fn has_cycles(routes: &RouteTable) -> bool {
    let (graph, _) = to_graph(routes);
    petgraph::algo::is_cyclic_directed(&graph)
}

impl Router {
    pub fn to_dot(&self, name: &str) -> String {
        to_dot(&self.routes(), name)
    }

    pub fn has_cycles(&self) -> bool {
        has_cycles(&self.routes())
    }
}
