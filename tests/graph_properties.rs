use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use taskdag::{DependencyGraph, GraphError, Task};

fn task(id: &str, deps: &[String]) -> Task {
    Task::from_fn(id, |_| async { Ok(json!(null)) }).depends_on(deps.iter().cloned())
}

// Each step names a task from a small pool and picks dependencies from the
// same pool, so duplicates, unknown ids and self-references all show up.
fn insertion_strategy() -> impl Strategy<Value = Vec<(usize, Vec<usize>)>> {
    proptest::collection::vec(
        (0..12usize, proptest::collection::vec(0..12usize, 0..4)),
        1..40,
    )
}

fn name(i: usize) -> String {
    format!("t{i}")
}

proptest! {
    #[test]
    fn successful_insertions_keep_graph_acyclic(steps in insertion_strategy()) {
        let mut graph = DependencyGraph::new();

        for (id, deps) in steps {
            let id = name(id);
            let deps: Vec<String> = deps.into_iter().map(name).collect();

            let len_before = graph.len();
            let edges_before = graph.edges();
            let order_before = graph.topological_order().unwrap();

            match graph.add_task(task(&id, &deps)) {
                Ok(()) => {
                    prop_assert_eq!(graph.len(), len_before + 1);
                    prop_assert!(graph.contains(&id));
                }
                Err(err) => {
                    prop_assert!(matches!(
                        err,
                        GraphError::DuplicateTask(_)
                            | GraphError::UnknownDependency { .. }
                            | GraphError::Cycle { .. }
                        ),
                        "unexpected error variant: {:?}",
                        err
                    );
                    prop_assert_eq!(graph.len(), len_before);
                    prop_assert_eq!(graph.edges(), edges_before);
                    prop_assert_eq!(graph.topological_order().unwrap(), order_before);
                }
            }

            let order = graph.topological_order().unwrap();
            prop_assert_eq!(order.len(), graph.len());
            let position: HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
            for (dep, dependent) in graph.edges() {
                prop_assert!(position[dep.as_str()] < position[dependent.as_str()]);
            }
        }
    }

    #[test]
    fn topological_order_is_deterministic(steps in insertion_strategy()) {
        let build = || {
            let mut graph = DependencyGraph::new();
            for (id, deps) in &steps {
                let deps: Vec<String> = deps.iter().copied().map(name).collect();
                let _ = graph.add_task(task(&name(*id), &deps));
            }
            graph
        };
        prop_assert_eq!(
            build().topological_order().unwrap(),
            build().topological_order().unwrap()
        );
    }
}
