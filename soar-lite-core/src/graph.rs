//! Playbook graph compilation.
//!
//! Turns a task definition set into an ordered list of layers. Each layer is
//! a set of tasks with no dependency ordering among them; layer order is the
//! sole execution-order guarantee. Compilation is total: any validation
//! failure aborts with no partial plan.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::definition::TaskDefinition;
use crate::error::CompileError;

/// Compile a task definition set into parallelizable execution layers.
///
/// 1. every `needs` name must resolve to a known task;
/// 2. depth-first traversal with a recursion stack rejects cycles,
///    including self-dependencies;
/// 3. Kahn layering by in-degree: the frontier of zero in-degree tasks
///    forms one layer, dependents are decremented, repeat.
///
/// Layers come out name-sorted so the plan is deterministic for a given
/// definition set.
pub fn compile_layers(
    tasks: &BTreeMap<String, TaskDefinition>,
) -> Result<Vec<Vec<String>>, CompileError> {
    // Dependency names are set-valued: duplicates in `needs` collapse.
    let mut needs: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (name, definition) in tasks {
        let deps: BTreeSet<&str> = definition.needs.iter().map(String::as_str).collect();
        for dep in &deps {
            if !tasks.contains_key(*dep) {
                return Err(CompileError::UnknownDependency {
                    task: name.clone(),
                    dependency: (*dep).to_string(),
                });
            }
        }
        needs.insert(name.as_str(), deps);
    }

    detect_cycle(&needs)?;

    // Kahn layering. `dependents` is the reverse edge map.
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, deps) in &needs {
        in_degree.insert(*name, deps.len());
        for dep in deps {
            dependents.entry(*dep).or_default().push(*name);
        }
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    while placed.len() < needs.len() {
        let mut frontier: Vec<&str> = needs
            .keys()
            .filter(|name| !placed.contains(**name) && in_degree[**name] == 0)
            .copied()
            .collect();

        if frontier.is_empty() {
            // Unreachable after the DFS pass, kept as a defensive check:
            // a non-empty remainder with no zero in-degree task is a cycle.
            let remaining = needs
                .keys()
                .find(|name| !placed.contains(**name))
                .copied()
                .unwrap_or_default();
            return Err(CompileError::CycleDetected {
                task: remaining.to_string(),
            });
        }

        frontier.sort_unstable();
        for name in &frontier {
            placed.insert(*name);
            if let Some(children) = dependents.get(name) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                    }
                }
            }
        }
        layers.push(frontier.into_iter().map(str::to_string).collect());
    }

    Ok(layers)
}

/// Depth-first cycle detection over the `needs` relation.
fn detect_cycle(needs: &BTreeMap<&str, BTreeSet<&str>>) -> Result<(), CompileError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    for start in needs.keys() {
        if visited.contains(start) {
            continue;
        }
        // Iterative DFS: (node, next-dependency cursor).
        stack.push(*start);
        on_stack.insert(*start);
        let mut cursors: Vec<std::collections::btree_set::Iter<'_, &str>> =
            vec![needs[start].iter()];

        while let Some(cursor) = cursors.last_mut() {
            match cursor.next() {
                Some(dep) => {
                    if on_stack.contains(*dep) {
                        return Err(CompileError::CycleDetected {
                            task: (*dep).to_string(),
                        });
                    }
                    if !visited.contains(*dep) {
                        stack.push(*dep);
                        on_stack.insert(*dep);
                        cursors.push(needs[dep].iter());
                    }
                }
                None => {
                    cursors.pop();
                    if let Some(done) = stack.pop() {
                        on_stack.remove(done);
                        visited.insert(done);
                    }
                }
            }
        }
    }

    Ok(())
}
