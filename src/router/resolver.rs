//! Subscription rules and the route table derived from them.
//!
//! Registration only records intent (which names exist, which patterns each
//! destination subscribes to or ignores). The route table is then rebuilt from
//! scratch by [`RouteResolver::regenerate`]; it is never edited directly.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use regex::Regex;
use tracing::{debug, info};

use super::RouterError;

/// Pseudo-origin for calls made from outside the graph.
pub const ENTRY_POINT: &str = "__entry_point";

pub type RouteTable = BTreeMap<String, BTreeSet<String>>;

fn compile(patterns: &[String]) -> Result<Vec<Regex>, RouterError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| RouterError::Pattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct RouteResolver {
    names: BTreeSet<String>,
    subscriptions: HashMap<String, Vec<Regex>>,
    ignores: HashMap<String, Vec<Regex>>,
    entry_points: BTreeSet<String>,
    routes: RouteTable,
}

impl RouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the rules for `destination` and rebuild the table.
    ///
    /// Patterns are compiled before anything is touched, so a bad pattern
    /// leaves the resolver exactly as it was. A second registration of the
    /// same name replaces all of its earlier rules.
    pub fn register(
        &mut self,
        destination: &str,
        subscribe: &[String],
        ignore: &[String],
        entry_point: bool,
    ) -> Result<(), RouterError> {
        let subscribe = compile(subscribe)?;
        let ignore = compile(ignore)?;

        if !self.names.insert(destination.to_string()) {
            debug!("replacing routing rules for \"{}\"", destination);
        }
        self.subscriptions.insert(destination.to_string(), subscribe);
        self.ignores.insert(destination.to_string(), ignore);
        if entry_point {
            self.entry_points.insert(destination.to_string());
        } else {
            self.entry_points.remove(destination);
        }

        self.regenerate();
        Ok(())
    }

    /// Rebuild the route table from names, subscribe and ignore patterns.
    pub fn regenerate(&mut self) {
        let routes = resolve(
            &self.names,
            &self.subscriptions,
            &self.ignores,
            &self.entry_points,
        );

        for (origin, destinations) in &routes {
            let previous = self.routes.get(origin);
            for destination in destinations {
                if !previous.is_some_and(|p| p.contains(destination)) {
                    info!("added route \"{}\" -> \"{}\"", origin, destination);
                }
            }
        }

        self.routes = routes;
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn destinations(&self, origin: &str) -> Option<&BTreeSet<String>> {
        self.routes.get(origin)
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    pub fn entry_points(&self) -> &BTreeSet<String> {
        &self.entry_points
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// The route table as a pure function of the rule set.
pub fn resolve(
    names: &BTreeSet<String>,
    subscriptions: &HashMap<String, Vec<Regex>>,
    ignores: &HashMap<String, Vec<Regex>>,
    entry_points: &BTreeSet<String>,
) -> RouteTable {
    let mut routes = RouteTable::new();

    for (destination, patterns) in subscriptions {
        if patterns.is_empty() {
            continue;
        }
        let ignored = ignores.get(destination).map(Vec::as_slice).unwrap_or(&[]);

        for origin in names {
            if origin == destination || !patterns.iter().any(|p| p.is_match(origin)) {
                continue;
            }
            if ignored.iter().any(|p| p.is_match(origin)) {
                debug!("ignoring route \"{}\" -> \"{}\"", origin, destination);
                continue;
            }
            routes
                .entry(origin.clone())
                .or_default()
                .insert(destination.clone());
        }
    }

    if !entry_points.is_empty() {
        routes.insert(ENTRY_POINT.to_string(), entry_points.clone());
    }

    routes
}
