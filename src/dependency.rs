//! Prerequisite resolution between executions.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::ledger::{Execution, ExecutionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    pub satisfied: bool,
    /// Prerequisite branches not yet completed, including unknown ones.
    pub pending: Vec<String>,
}

/// Check `execution`'s prerequisites against a ledger snapshot.
///
/// A branch with no matching execution stays pending forever.
pub fn check_dependencies(execution: &Execution, all: &[Execution]) -> DependencyStatus {
    let completed: HashSet<&str> = all
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .map(|e| e.branch.as_str())
        .collect();
    let pending: Vec<String> = execution
        .dependencies
        .iter()
        .filter(|dep| !completed.contains(dep.as_str()))
        .cloned()
        .collect();
    DependencyStatus {
        satisfied: pending.is_empty(),
        pending,
    }
}

/// Pending executions that list `branch` as a prerequisite and whose
/// prerequisites are now all satisfied.
pub fn ready_dependents<'a>(branch: &str, all: &'a [Execution]) -> Vec<&'a Execution> {
    all.iter()
        .filter(|e| e.status == ExecutionStatus::Pending)
        .filter(|e| e.dependencies.iter().any(|d| d == branch))
        .filter(|e| check_dependencies(e, all).satisfied)
        .collect()
}

/// Order a batch so prerequisites come before dependents.
///
/// Only edges between members of the batch are considered. Members caught in
/// a cycle are appended in their original order instead of failing.
pub fn topological_order(batch: &[Execution]) -> Vec<&Execution> {
    let index: HashMap<&str, usize> = batch
        .iter()
        .enumerate()
        .map(|(i, e)| (e.branch.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; batch.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); batch.len()];
    for (i, exec) in batch.iter().enumerate() {
        for dep in &exec.dependencies {
            if let Some(&j) = index.get(dep.as_str())
                && j != i
            {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: Vec<usize> = (0..batch.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(batch.len());
    let mut placed = vec![false; batch.len()];
    let mut cursor = 0;
    while cursor < ready.len() {
        let i = ready[cursor];
        cursor += 1;
        placed[i] = true;
        order.push(&batch[i]);
        for &k in &dependents[i] {
            indegree[k] -= 1;
            if indegree[k] == 0 {
                ready.push(k);
            }
        }
    }
    order.extend(
        batch
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, e)| e),
    );
    order
}
