//! Dependency graph checks over a stage list.

use super::StageConfig;
use std::collections::{HashMap, HashSet};

/// Finds a dependency cycle, returning its path (first node repeated at the
/// end), or `None` if the graph is acyclic.
///
/// Stages are visited in declaration order so the reported path is stable.
#[must_use]
pub fn find_cycle(stages: &[StageConfig]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &StageConfig> = stages.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for stage in stages {
        if !visited.contains(stage.id.as_str()) {
            if let Some(cycle) = dfs_cycle(&stage.id, &by_id, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    by_id: &HashMap<&'a str, &'a StageConfig>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(&stage) = by_id.get(node) {
        for dep in &stage.dependencies {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, by_id, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

/// Returns stage ids in an order where every stage follows its
/// dependencies, breaking ties by declaration order.
///
/// Unknown dependency ids are ignored; call [`find_cycle`] first, cycles
/// are not reported here.
#[must_use]
pub fn topological_order(stages: &[StageConfig]) -> Vec<String> {
    let by_id: HashMap<&str, &StageConfig> = stages.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut result = Vec::new();
    let mut visited = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        by_id: &HashMap<&'a str, &'a StageConfig>,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node) {
            return;
        }
        if let Some(&stage) = by_id.get(node) {
            for dep in &stage.dependencies {
                if by_id.contains_key(dep.as_str()) {
                    visit(dep, by_id, visited, result);
                }
            }
        }
        result.push(node.to_string());
    }

    for stage in stages {
        visit(&stage.id, &by_id, &mut visited, &mut result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stage(id: &str, deps: &[&str]) -> StageConfig {
        StageConfig::new(id, "noop").depends_on(deps)
    }

    #[test]
    fn test_acyclic() {
        let stages = vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["a", "b"])];
        assert!(find_cycle(&stages).is_none());
    }

    #[test]
    fn test_cycle_path() {
        let stages = vec![stage("a", &["c"]), stage("b", &["a"]), stage("c", &["b"])];
        let cycle = find_cycle(&stages).unwrap();
        assert_eq!(cycle, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_self_cycle() {
        let stages = vec![stage("a", &["a"])];
        assert_eq!(find_cycle(&stages).unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_topological_order() {
        let stages = vec![stage("validate", &["classify"]), stage("extract", &[]), stage("classify", &["extract"])];
        assert_eq!(topological_order(&stages), vec!["extract", "classify", "validate"]);
    }
}
