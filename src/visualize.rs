use std::fmt::Write;
use crate::{DependencyGraph, TaskStatus};

fn color(status: Option<TaskStatus>) -> &'static str {
    match status {
        Some(TaskStatus::Running) => "yellow",
        Some(TaskStatus::Completed) => "green",
        Some(TaskStatus::Failed) => "red",
        Some(TaskStatus::Cancelled) => "orange",
        Some(TaskStatus::Pending) | None => "gray",
    }
}

fn quote(id: &str) -> String {
    format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Graphviz DOT source: one node per task colored by its status, one edge
/// per dependency.
pub fn to_dot<F>(graph: &DependencyGraph, status_of: F) -> String
where
    F: Fn(&str) -> Option<TaskStatus>,
{
    let mut out = String::from("digraph tasks {\n");

    for task in graph.all_tasks() {
        let id = quote(task.id());
        let status = status_of(task.id());
        let label = status.map(TaskStatus::as_str).unwrap_or("pending");
        let _ = writeln!(
            out,
            "    {id} [label={id}, color={}, tooltip=\"{label}\"];",
            color(status)
        );
    }
    for (from, to) in graph.edges() {
        let _ = writeln!(out, "    {} -> {};", quote(&from), quote(&to));
    }

    out.push_str("}\n");
    out
}

/// Every root followed by its dependents, indented one level per edge. A
/// task reachable along several paths is printed under each of them.
pub fn render_tree(graph: &DependencyGraph) -> String {
    let mut out = String::new();
    for root in graph.roots() {
        out.push_str(&root);
        out.push('\n');
        render_chain(graph, &root, "  ", &mut out);
    }
    out
}

fn render_chain(graph: &DependencyGraph, id: &str, prefix: &str, out: &mut String) {
    for child in graph.dependents(id) {
        let _ = writeln!(out, "{prefix}└─> {child}");
        render_chain(graph, child, &format!("{prefix}    "), out);
    }
}
