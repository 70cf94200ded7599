use std::collections::HashSet;

/// Depth-first search for a dependency cycle.
///
/// `ids` is visited in order and `deps_of` yields the dependencies of a
/// node. Returns the cycle as a path whose first and last entries are the
/// same id, or `None` if the graph is acyclic.
pub fn find_cycle<'a, I, F>(ids: I, deps_of: F) -> Option<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
    F: Fn(&str) -> &'a [String],
{
    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    fn dfs<'a, F>(
        id: &'a str,
        deps_of: &F,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>>
    where
        F: Fn(&str) -> &'a [String],
    {
        if let Some(pos) = stack.iter().position(|s| *s == id) {
            let mut path: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
            path.push(id.to_string());
            return Some(path);
        }
        if !visited.insert(id) {
            return None;
        }

        stack.push(id);
        for dep in deps_of(id) {
            if let Some(path) = dfs(dep.as_str(), deps_of, visited, stack) {
                return Some(path);
            }
        }
        stack.pop();
        None
    }

    for id in ids {
        if !visited.contains(id) {
            if let Some(path) = dfs(id, &deps_of, &mut visited, &mut stack) {
                return Some(path);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    fn check(g: &HashMap<String, Vec<String>>) -> Option<Vec<String>> {
        let mut ids: Vec<&str> = g.keys().map(String::as_str).collect();
        ids.sort();
        find_cycle(ids, |id| g.get(id).map(Vec::as_slice).unwrap_or(&[]))
    }

    #[test]
    fn diamond_is_acyclic() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert_eq!(check(&g), None);
    }

    #[test]
    fn reports_cycle_path() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        assert_eq!(
            check(&g),
            Some(vec!["a".into(), "c".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(check(&g), Some(vec!["a".into(), "a".into()]));
    }

    #[test]
    fn missing_nodes_are_treated_as_leaves() {
        let g = graph(&[("b", &["ghost"])]);
        assert_eq!(check(&g), None);
    }
}
