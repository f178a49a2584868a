//! Dependency ordering for derived attributes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::error::{CubistError, Result};

/// Direct dependencies keyed by attribute reference.
pub type DependencyMap = HashMap<String, BTreeSet<String>>;

/// Order `requested` and everything they transitively depend on so that each
/// attribute comes after all of its dependencies.
///
/// Attributes of the same generation come out in no particular order.
pub fn depsort<S: AsRef<str>>(requested: &[S], dependencies: &DependencyMap) -> Result<Vec<String>> {
    let required = collect_required(requested, dependencies)?;

    let mut pending: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for name in &required {
        let deps = &dependencies[name.as_str()];
        pending.insert(name.as_str(), deps.iter().map(String::as_str).collect());
        for dep in deps {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = pending
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(name, _)| *name)
        .collect();
    let mut sorted = Vec::with_capacity(required.len());

    while let Some(name) = ready.pop_front() {
        pending.remove(name);
        sorted.push(name.to_string());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(deps) = pending.get_mut(dependent) {
                deps.remove(name);
                if deps.is_empty() {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if !pending.is_empty() {
        return Err(CubistError::CircularDependency {
            attributes: cycle_members(pending),
        });
    }
    Ok(sorted)
}

fn collect_required<S: AsRef<str>>(
    requested: &[S],
    dependencies: &DependencyMap,
) -> Result<BTreeSet<String>> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<String> = requested.iter().map(|s| s.as_ref().to_string()).collect();
    while let Some(name) = queue.pop_front() {
        if seen.contains(&name) {
            continue;
        }
        let deps = dependencies
            .get(&name)
            .ok_or_else(|| CubistError::UnknownAttribute(name.clone()))?;
        queue.extend(deps.iter().filter(|d| !seen.contains(*d)).cloned());
        seen.insert(name);
    }
    Ok(seen)
}

/// Attributes of the residual graph that sit on a cycle: members of strongly
/// connected components with more than one node, or with a self-loop.
/// Attributes that merely depend on a cycle are left out.
fn cycle_members(residual: BTreeMap<&str, BTreeSet<&str>>) -> Vec<String> {
    let mut tarjan = Tarjan {
        graph: &residual,
        next_index: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        members: BTreeSet::new(),
    };
    for &node in residual.keys() {
        if !tarjan.index.contains_key(node) {
            tarjan.connect(node);
        }
    }
    tarjan.members.into_iter().map(str::to_string).collect()
}

struct Tarjan<'g, 'a> {
    graph: &'g BTreeMap<&'a str, BTreeSet<&'a str>>,
    next_index: usize,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: BTreeSet<&'a str>,
    members: BTreeSet<&'a str>,
}

impl<'a> Tarjan<'_, 'a> {
    fn connect(&mut self, node: &'a str) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let graph = self.graph;
        let edges = graph.get(node).into_iter().flatten().copied();
        for dep in edges.filter(|dep| graph.contains_key(dep)) {
            if !self.index.contains_key(dep) {
                self.connect(dep);
                let low = self.lowlink[node].min(self.lowlink[dep]);
                self.lowlink.insert(node, low);
            } else if self.on_stack.contains(dep) {
                let low = self.lowlink[node].min(self.index[dep]);
                self.lowlink.insert(node, low);
            }
        }

        if self.lowlink[node] != self.index[node] {
            return;
        }
        let mut component = Vec::new();
        while let Some(top) = self.stack.pop() {
            self.on_stack.remove(top);
            component.push(top);
            if top == node {
                break;
            }
        }
        let self_loop = graph.get(node).is_some_and(|deps| deps.contains(node));
        if component.len() > 1 || self_loop {
            self.members.extend(component);
        }
    }
}
