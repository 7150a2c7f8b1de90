//! Commit Order Calculator.
//!
//! Orders entity types so that a type is written after every type it holds a
//! non-nullable (or cascading) foreign key toward:
//! - Inserts/updates run in the computed order (parents first)
//! - Deletes run in reverse (children first)
//!
//! The sort is a depth-first traversal that tolerates cycles: a back edge is
//! ignored and the cycle broken where it was found. Cross-type cycles are
//! resolved at the change set level with extra updates. Nodes and edges are
//! visited in insertion order, so the same input always yields the same order.

use keel_core::{Cascade, EntityMetadata};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Visited,
}

/// Builds a dependency graph of entity types and sorts it.
#[derive(Debug, Default)]
pub struct CommitOrderCalculator {
    nodes: Vec<String>,
    /// Type -> types it depends on (has a foreign key to), in insertion order.
    dependencies: HashMap<String, Vec<String>>,
}

impl CommitOrderCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Re-adding is a no-op.
    pub fn add_node(&mut self, name: &str) {
        if !self.dependencies.contains_key(name) {
            self.nodes.push(name.to_string());
            self.dependencies.insert(name.to_string(), Vec::new());
        }
    }

    /// `from` must be written after `to`.
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.add_node(from);
        self.add_node(to);
        if let Some(deps) = self.dependencies.get_mut(from) {
            if !deps.iter().any(|d| d == to) {
                deps.push(to.to_string());
            }
        }
    }

    /// Register a type and its edges toward types already in the graph.
    ///
    /// Edges follow owning to-one relations that are non-nullable or cascade
    /// persist.
    pub fn register(&mut self, meta: &EntityMetadata, present: &dyn Fn(&str) -> bool) {
        self.add_node(&meta.name);
        for prop in meta.owning_to_one() {
            if prop.nullable && !prop.cascades(Cascade::Persist) {
                continue;
            }
            if let Some(target) = prop.target.as_deref() {
                if present(target) {
                    self.add_dependency(&meta.name, target);
                }
            }
        }
    }

    /// Types in commit order: dependencies before dependents.
    pub fn sort(&self) -> Vec<String> {
        let mut state: HashMap<&str, VisitState> = HashMap::new();
        let mut sorted = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            self.visit(node, &mut state, &mut sorted);
        }
        sorted
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        state: &mut HashMap<&'a str, VisitState>,
        sorted: &mut Vec<String>,
    ) {
        match state.get(node) {
            Some(VisitState::Visited) => return,
            Some(VisitState::InProgress) => {
                tracing::trace!(entity = %node, "Dependency cycle broken");
                return;
            }
            None => {}
        }
        state.insert(node, VisitState::InProgress);
        if let Some(deps) = self.dependencies.get(node) {
            for dep in deps {
                self.visit(dep, state, sorted);
            }
        }
        state.insert(node, VisitState::Visited);
        sorted.push(node.to_string());
    }
}
