//! Dependency invalidation tracker.
//!
//! Keeps the structural graph between fields and calculations (global, since
//! definitions are session-independent) and a per-session invalidation queue
//! of stale calculation names (values are session-scoped).
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B depends on A"  (A is a precedent of B)
//! ```
//!
//! Lookups share the calculation namespace: a lookup named `x` is the
//! calculation node `x`.

use std::collections::{BTreeSet, VecDeque};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::definitions::{Action, LegacyLookupTable, LoadedLookup};
use crate::shortcode::{normalize_name, scan, Shortcode};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepNode {
    Field(String),
    Calc(String),
}

impl DepNode {
    pub fn field(name: &str) -> Self {
        DepNode::Field(normalize_name(name))
    }

    pub fn calc(name: &str) -> Self {
        DepNode::Calc(normalize_name(name))
    }

    fn from_shortcode(code: &Shortcode) -> Self {
        match code {
            Shortcode::Field(n) => DepNode::Field(n.clone()),
            Shortcode::Calc(n) | Shortcode::Lookup(n) => DepNode::Calc(n.clone()),
        }
    }
}

/// What one calculation depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyRecord {
    pub fields: BTreeSet<String>,
    pub calculations: BTreeSet<String>,
    /// Analysis failed; any field change invalidates this calculation.
    pub any_field: bool,
}

/// Bidirectional adjacency, same invariants as a spreadsheet dependency
/// graph: preds/succs mirror each other and empty sets are never stored.
#[derive(Default)]
struct Graph {
    preds: FxHashMap<String, FxHashSet<DepNode>>,
    succs: FxHashMap<DepNode, FxHashSet<String>>,
    any_field: FxHashSet<String>,
    discovered: FxHashSet<String>,
}

impl Graph {
    fn add_edges(&mut self, calc: &str, new_preds: impl IntoIterator<Item = DepNode>) {
        for pred in new_preds {
            self.succs.entry(pred.clone()).or_default().insert(calc.to_string());
            self.preds.entry(calc.to_string()).or_default().insert(pred);
        }
    }

    fn replace_edges(&mut self, calc: &str, new_preds: FxHashSet<DepNode>) {
        if let Some(old_preds) = self.preds.remove(calc) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(calc);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }
        if new_preds.is_empty() {
            return;
        }
        for pred in &new_preds {
            self.succs.entry(pred.clone()).or_default().insert(calc.to_string());
        }
        self.preds.insert(calc.to_string(), new_preds);
    }

    fn calc_preds(&self, calc: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .preds
            .get(calc)
            .into_iter()
            .flatten()
            .filter_map(|n| match n {
                DepNode::Calc(c) => Some(c.clone()),
                DepNode::Field(_) => None,
            })
            .collect();
        out.sort();
        out
    }

    /// Transitive dependents of `start`, breadth first, excluding nothing
    /// but duplicates.
    fn transitive_dependents(&self, start: FxHashSet<String>) -> BTreeSet<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = start.into_iter().collect();
        while let Some(calc) = queue.pop_front() {
            if !seen.insert(calc.clone()) {
                continue;
            }
            if let Some(next) = self.succs.get(&DepNode::Calc(calc)) {
                queue.extend(next.iter().cloned());
            }
        }
        seen
    }
}

#[derive(Default)]
pub struct DependencyTracker {
    graph: RwLock<Graph>,
    queues: RwLock<FxHashMap<String, BTreeSet<String>>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit registration. Merges with whatever is already known.
    pub fn register<F, C>(&self, name: &str, fields: F, calculations: C)
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        let name = normalize_name(name);
        let nodes = fields
            .into_iter()
            .map(|f| DepNode::field(f.as_ref()))
            .chain(calculations.into_iter().map(|c| DepNode::calc(c.as_ref())));
        self.graph.write().add_edges(&name, nodes);
    }

    /// Replace a calculation's recorded dependencies wholesale.
    pub fn replace(&self, name: &str, record: &DependencyRecord) {
        let name = normalize_name(name);
        let nodes: FxHashSet<DepNode> = record
            .fields
            .iter()
            .map(|f| DepNode::field(f))
            .chain(record.calculations.iter().map(|c| DepNode::calc(c)))
            .collect();
        let mut graph = self.graph.write();
        graph.replace_edges(&name, nodes);
        if record.any_field {
            graph.any_field.insert(name);
        } else {
            graph.any_field.remove(&name);
        }
    }

    pub fn is_discovered(&self, name: &str) -> bool {
        self.graph.read().discovered.contains(&normalize_name(name))
    }

    /// Auto-discovery from formula text. Runs once per name; returns whether
    /// anything was scanned.
    pub fn discover(&self, name: &str, text: &str) -> bool {
        let name = normalize_name(name);
        let mut graph = self.graph.write();
        if !graph.discovered.insert(name.clone()) {
            return false;
        }
        let nodes: Vec<DepNode> = scan(text).iter().map(|s| DepNode::from_shortcode(&s.code)).collect();
        graph.add_edges(&name, nodes);
        true
    }

    /// Auto-discovery for a lookup: condition fields, shortcodes in formula
    /// actions, and key fields of keyed-table actions.
    pub fn discover_lookup(&self, name: &str, lookup: &LoadedLookup) -> bool {
        let name = normalize_name(name);
        let mut graph = self.graph.write();
        if !graph.discovered.insert(name.clone()) {
            return false;
        }
        let mut nodes: Vec<DepNode> = lookup.condition_fields().map(DepNode::field).collect();
        for action in lookup.actions() {
            match action {
                Action::Formula { formula } => {
                    nodes.extend(scan(formula).iter().map(|s| DepNode::from_shortcode(&s.code)));
                }
                Action::Lookup { key_field, .. } => nodes.push(DepNode::field(key_field)),
                Action::Value { .. } | Action::Error { .. } => {}
            }
        }
        graph.add_edges(&name, nodes);
        true
    }

    /// Auto-discovery for a legacy table: every condition field.
    pub fn discover_legacy(&self, name: &str, table: &LegacyLookupTable) -> bool {
        let name = normalize_name(name);
        let mut graph = self.graph.write();
        if !graph.discovered.insert(name.clone()) {
            return false;
        }
        let nodes: Vec<DepNode> = table
            .rows
            .iter()
            .flat_map(|r| r.conditions.iter())
            .map(|c| DepNode::field(&c.field))
            .collect();
        graph.add_edges(&name, nodes);
        true
    }

    /// Fallback when a lookup's structure can't be analyzed.
    pub fn mark_any_field(&self, name: &str) {
        let name = normalize_name(name);
        let mut graph = self.graph.write();
        tracing::debug!(calculation = %name, "dependency analysis failed, tracking every field");
        graph.any_field.insert(name);
    }

    pub fn record(&self, name: &str) -> Option<DependencyRecord> {
        let name = normalize_name(name);
        let graph = self.graph.read();
        let any_field = graph.any_field.contains(&name);
        let preds = graph.preds.get(&name);
        if preds.is_none() && !any_field {
            return None;
        }
        let mut record = DependencyRecord { any_field, ..DependencyRecord::default() };
        for node in preds.into_iter().flatten() {
            match node {
                DepNode::Field(f) => record.fields.insert(f.clone()),
                DepNode::Calc(c) => record.calculations.insert(c.clone()),
            };
        }
        Some(record)
    }

    /// Every calculation that transitively depends on `field`.
    pub fn field_dependents(&self, field: &str) -> BTreeSet<String> {
        let graph = self.graph.read();
        let mut direct: FxHashSet<String> = graph
            .succs
            .get(&DepNode::field(field))
            .cloned()
            .unwrap_or_default();
        direct.extend(graph.any_field.iter().cloned());
        graph.transitive_dependents(direct)
    }

    /// Every calculation that transitively depends on calculation `name`.
    pub fn calculation_dependents(&self, name: &str) -> BTreeSet<String> {
        let graph = self.graph.read();
        let direct = graph
            .succs
            .get(&DepNode::calc(name))
            .cloned()
            .unwrap_or_default();
        graph.transitive_dependents(direct)
    }

    /// A tracked field changed value in `session`. Returns the newly queued names.
    pub fn on_field_changed(&self, session_id: &str, field: &str) -> Vec<String> {
        let dependents = self.field_dependents(field);
        self.enqueue(session_id, dependents)
    }

    pub fn on_calculation_changed(&self, session_id: &str, name: &str) -> Vec<String> {
        let dependents = self.calculation_dependents(name);
        self.enqueue(session_id, dependents)
    }

    fn enqueue(&self, session_id: &str, names: BTreeSet<String>) -> Vec<String> {
        if names.is_empty() {
            return Vec::new();
        }
        let mut queues = self.queues.write();
        let queue = queues.entry(session_id.to_string()).or_default();
        let added: Vec<String> = names.into_iter().filter(|n| queue.insert(n.clone())).collect();
        if !added.is_empty() {
            tracing::debug!(session = session_id, invalidated = ?added, "calculations invalidated");
        }
        added
    }

    pub fn needs_recalculation(&self, session_id: &str, name: &str) -> bool {
        self.queues
            .read()
            .get(session_id)
            .is_some_and(|q| q.contains(&normalize_name(name)))
    }

    /// Remove `name` from the session's queue. Returns whether it was queued.
    pub fn mark_current(&self, session_id: &str, name: &str) -> bool {
        let mut queues = self.queues.write();
        let Some(queue) = queues.get_mut(session_id) else {
            return false;
        };
        let removed = queue.remove(&normalize_name(name));
        if queue.is_empty() {
            queues.remove(session_id);
        }
        removed
    }

    pub fn pending(&self, session_id: &str) -> Vec<String> {
        self.queues
            .read()
            .get(session_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_session(&self, session_id: &str) {
        self.queues.write().remove(session_id);
    }

    pub fn clear_all_sessions(&self) {
        self.queues.write().clear();
    }

    /// Would giving `name` these calculation precedents close a loop?
    /// Returns the offending path, starting and ending at `name`.
    pub fn would_create_cycle(&self, name: &str, new_calcs: &[&str]) -> Option<Vec<String>> {
        let name = normalize_name(name);
        let graph = self.graph.read();
        for start in new_calcs.iter().map(|c| normalize_name(c)) {
            if start == name {
                return Some(vec![name.clone(), name]);
            }
            // Walk precedents from the new pred; reaching `name` closes the loop.
            let mut parents: FxHashMap<String, String> = FxHashMap::default();
            let mut stack = vec![start.clone()];
            let mut visited = FxHashSet::default();
            while let Some(current) = stack.pop() {
                if !visited.insert(current.clone()) {
                    continue;
                }
                for pred in graph.calc_preds(&current) {
                    if pred == name {
                        let mut path = vec![name.clone()];
                        let mut cursor = current.clone();
                        let mut trail = vec![cursor.clone()];
                        while let Some(parent) = parents.get(&cursor) {
                            trail.push(parent.clone());
                            cursor = parent.clone();
                        }
                        trail.reverse();
                        path.extend(trail);
                        path.push(name.clone());
                        return Some(path);
                    }
                    if !visited.contains(&pred) {
                        parents.entry(pred.clone()).or_insert_with(|| current.clone());
                        stack.push(pred);
                    }
                }
            }
        }
        None
    }

    /// Strongly connected groups of calculations that form cycles
    /// (iterative Tarjan). Groups and their members are sorted.
    pub fn find_cycle_groups(&self) -> Vec<Vec<String>> {
        let graph = self.graph.read();
        let mut nodes: Vec<String> = graph.preds.keys().cloned().collect();
        nodes.sort();

        struct Frame {
            node: String,
            neighbours: Vec<String>,
            next_idx: usize,
        }

        let mut index_counter: u32 = 0;
        let mut stack: Vec<String> = Vec::new();
        let mut on_stack: FxHashSet<String> = FxHashSet::default();
        let mut indices: FxHashMap<String, u32> = FxHashMap::default();
        let mut lowlinks: FxHashMap<String, u32> = FxHashMap::default();
        let mut groups: Vec<Vec<String>> = Vec::new();

        for root in &nodes {
            if indices.contains_key(root) {
                continue;
            }
            indices.insert(root.clone(), index_counter);
            lowlinks.insert(root.clone(), index_counter);
            index_counter += 1;
            stack.push(root.clone());
            on_stack.insert(root.clone());
            let mut dfs: Vec<Frame> = vec![Frame {
                node: root.clone(),
                neighbours: graph.calc_preds(root),
                next_idx: 0,
            }];

            while let Some(frame) = dfs.last_mut() {
                if frame.next_idx < frame.neighbours.len() {
                    let w = frame.neighbours[frame.next_idx].clone();
                    frame.next_idx += 1;

                    if !indices.contains_key(&w) {
                        indices.insert(w.clone(), index_counter);
                        lowlinks.insert(w.clone(), index_counter);
                        index_counter += 1;
                        stack.push(w.clone());
                        on_stack.insert(w.clone());
                        let neighbours = graph.calc_preds(&w);
                        dfs.push(Frame { node: w, neighbours, next_idx: 0 });
                    } else if on_stack.contains(&w) {
                        let w_idx = indices.get(&w).copied().unwrap_or(u32::MAX);
                        if let Some(v_low) = lowlinks.get_mut(&frame.node) {
                            *v_low = (*v_low).min(w_idx);
                        }
                    }
                    continue;
                }

                let Some(finished) = dfs.pop() else { break };
                let v = finished.node;
                let v_low = lowlinks.get(&v).copied().unwrap_or(u32::MAX);
                let v_idx = indices.get(&v).copied().unwrap_or(u32::MAX);

                if let Some(parent) = dfs.last() {
                    if let Some(parent_low) = lowlinks.get_mut(&parent.node) {
                        *parent_low = (*parent_low).min(v_low);
                    }
                }

                if v_low == v_idx {
                    let mut group = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack.remove(&w);
                        let done = w == v;
                        group.push(w);
                        if done {
                            break;
                        }
                    }
                    let is_cycle = group.len() > 1
                        || graph
                            .preds
                            .get(&v)
                            .is_some_and(|p| p.contains(&DepNode::Calc(v.clone())));
                    if is_cycle {
                        group.sort();
                        groups.push(group);
                    }
                }
            }
        }

        groups.sort();
        groups
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let graph = self.graph.read();
        for (calc, preds) in &graph.preds {
            assert!(!preds.is_empty(), "Empty preds set stored for {}", calc);
            for pred in preds {
                assert!(
                    graph.succs.get(pred).is_some_and(|s| s.contains(calc)),
                    "Missing succ edge: {:?} should have {} in dependents",
                    pred,
                    calc
                );
            }
        }
        for (node, dependents) in &graph.succs {
            assert!(!dependents.is_empty(), "Empty succs set stored for {:?}", node);
            for dep in dependents {
                assert!(
                    graph.preds.get(dep).is_some_and(|p| p.contains(node)),
                    "Missing pred edge: {} should have {:?} in precedents",
                    dep,
                    node
                );
            }
        }
    }
}
