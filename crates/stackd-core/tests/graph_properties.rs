//! Property tests for dependency resolution.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use proptest::prelude::*;
use stackd_core::{DependencyGraph, DescriptorStore, Error, ServiceDescriptor};

fn name(i: usize) -> String {
    format!("svc{i:02}")
}

/// Random DAG: node `i` may only depend on nodes with a smaller index.
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..12).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    proptest::collection::vec(0..i, 0..=i.min(4)).boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

fn build_store(deps: &[Vec<usize>]) -> DescriptorStore {
    let descriptors = deps
        .iter()
        .enumerate()
        .map(|(i, ds)| {
            let dep_names: Vec<String> = ds.iter().map(|&d| name(d)).collect();
            let refs: Vec<&str> = dep_names.iter().map(String::as_str).collect();
            ServiceDescriptor::new(name(i), "/bin/true").with_dependencies(&refs)
        })
        .collect();
    DescriptorStore::new(descriptors).unwrap()
}

proptest! {
    #[test]
    fn order_places_every_service_after_its_dependencies(deps in dag_strategy()) {
        let store = build_store(&deps);
        let graph = DependencyGraph::build(&store).unwrap();
        let order = graph.order();
        prop_assert_eq!(order.len(), deps.len());

        let position = |n: &str| order.iter().position(|o| *o == n).unwrap();
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                prop_assert!(position(&name(d)) < position(&name(i)));
            }
        }
    }

    #[test]
    fn shutdown_order_is_exact_reverse(deps in dag_strategy()) {
        let graph = DependencyGraph::build(&build_store(&deps)).unwrap();
        let mut reversed = graph.order();
        reversed.reverse();
        prop_assert_eq!(graph.shutdown_order(), reversed);
    }

    #[test]
    fn levels_are_sorted_and_dependency_free(deps in dag_strategy()) {
        let graph = DependencyGraph::build(&build_store(&deps)).unwrap();
        for level in graph.levels() {
            let mut sorted = level.clone();
            sorted.sort_unstable();
            prop_assert_eq!(&level, &sorted);
            for member in &level {
                for dep in graph.dependencies_of(member) {
                    prop_assert!(!level.contains(&dep));
                }
            }
        }
    }

    #[test]
    fn back_edge_always_reports_cycle(deps in dag_strategy(), pick in any::<prop::sample::Index>()) {
        // Add an edge from the root of some existing edge back to its dependent.
        let edges: Vec<(usize, usize)> = deps
            .iter()
            .enumerate()
            .flat_map(|(i, ds)| ds.iter().map(move |&d| (i, d)))
            .collect();
        prop_assume!(!edges.is_empty());
        let (dependent, dependency) = edges[pick.index(edges.len())];

        let mut cyclic = deps.clone();
        cyclic[dependency].push(dependent);
        let store = build_store(&cyclic);
        match DependencyGraph::build(&store) {
            Err(Error::CyclicDependency { cycle }) => {
                prop_assert!(cycle.len() >= 2);
                prop_assert!(cycle.iter().all(|m| store.get(m).is_some()));
            }
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
            Ok(_) => prop_assert!(false, "cycle produced an order"),
        }
    }
}

#[test]
fn a_then_b_and_c_share_a_level() {
    let store = DescriptorStore::new(vec![
        ServiceDescriptor::new("a", "/bin/a"),
        ServiceDescriptor::new("b", "/bin/b").with_dependencies(&["a"]),
        ServiceDescriptor::new("c", "/bin/c").with_dependencies(&["a"]),
    ])
    .unwrap();
    let graph = DependencyGraph::build(&store).unwrap();
    assert_eq!(graph.levels(), vec![vec!["a"], vec!["b", "c"]]);
}
