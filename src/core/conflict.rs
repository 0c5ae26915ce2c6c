//! Dependency-graph analysis for conflict resolution.
//!
//! Graphs map a task id to the ids it depends on. Iteration is over sorted
//! maps so reported cycles and orders are deterministic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use crate::domain::Priority;

pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// First dependency cycle found, as `[a, b, c]` meaning a -> b -> c -> a
pub fn find_cycle(graph: &DependencyGraph) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for node in graph.keys() {
        if !marks.contains_key(node.as_str()) {
            if let Some(cycle) = visit(graph, node, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    graph: &'a DependencyGraph,
    node: &'a str,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(node, Mark::InProgress);
    path.push(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            match marks.get(dep.as_str()).copied() {
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    return Some(path[start..].iter().map(|n| n.to_string()).collect());
                }
                Some(Mark::Done) => {}
                None => {
                    // Dependencies outside the graph are reported separately
                    if graph.contains_key(dep.as_str()) {
                        if let Some(cycle) = visit(graph, dep, marks, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }
    }

    path.pop();
    marks.insert(node, Mark::Done);
    None
}

/// Every disjoint cycle, found by removing each cycle's nodes and searching again
pub fn find_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut rest = graph.clone();
    let mut cycles = Vec::new();
    while let Some(cycle) = find_cycle(&rest) {
        for node in &cycle {
            rest.remove(node);
        }
        cycles.push(cycle);
    }
    cycles
}

/// Tasks that depend, directly or through other tasks, on one of `roots`
///
/// The roots themselves are not included.
pub fn dependents_of(graph: &DependencyGraph, roots: &BTreeSet<String>) -> BTreeSet<String> {
    let mut reached: BTreeSet<String> = BTreeSet::new();
    loop {
        let next: Vec<&String> = graph
            .iter()
            .filter(|(task, deps)| {
                !roots.contains(*task)
                    && !reached.contains(*task)
                    && deps.iter().any(|d| roots.contains(d) || reached.contains(d))
            })
            .map(|(task, _)| task)
            .collect();
        if next.is_empty() {
            return reached;
        }
        reached.extend(next.into_iter().cloned());
    }
}

/// Tasks whose dependencies name ids that are not in the graph
pub fn missing_dependencies(graph: &DependencyGraph) -> Vec<(String, Vec<String>)> {
    graph
        .iter()
        .filter_map(|(task, deps)| {
            let missing: Vec<String> = deps
                .iter()
                .filter(|d| !graph.contains_key(d.as_str()))
                .cloned()
                .collect();
            (!missing.is_empty()).then(|| (task.clone(), missing))
        })
        .collect()
}

/// Dependency-respecting order; among ready tasks, higher priority first, then id
///
/// Returns the offending cycle when no order exists. Unknown dependencies are ignored.
pub fn topological_order(
    graph: &DependencyGraph,
    priorities: &HashMap<String, Priority>,
) -> Result<Vec<String>, Vec<String>> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (task, deps) in graph {
        let known = deps.iter().filter(|d| graph.contains_key(d.as_str()));
        let mut count = 0;
        for dep in known {
            dependents.entry(dep.as_str()).or_default().push(task.as_str());
            count += 1;
        }
        remaining.insert(task.as_str(), count);
    }

    let priority = |task: &str| priorities.get(task).copied().unwrap_or_default();
    let mut ready: BinaryHeap<(Priority, Reverse<&str>)> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(task, _)| (priority(*task), Reverse(*task)))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some((_, Reverse(task))) = ready.pop() {
        order.push(task.to_string());
        for dependent in dependents.get(task).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push((priority(*dependent), Reverse(*dependent)));
                }
            }
        }
    }

    if order.len() < graph.len() {
        return Err(find_cycle(graph).unwrap_or_default());
    }
    Ok(order)
}
