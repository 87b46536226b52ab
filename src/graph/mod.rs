//! Dependency graph builder and application graph queries
//!
//! Builds an acyclic ordering over resource definitions from explicit and
//! value-derived dependencies. The computed apply order is deterministic:
//! topological, with ties broken by original declaration order, so repeated
//! runs on identical input produce identical plans. Cyclic input fails with a
//! [`Error::Cycle`](crate::Error::Cycle) naming every member exactly once,
//! before any side effect occurs.
//!
//! The same builder, run without invoking any handler, backs a pure graph
//! query: a node/edge view over an application's resources plus its
//! environment's resources, distinguishing explicit dependency edges from
//! induced environment-membership edges.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::definition::{ResourceDefinition, ResourceId};
use crate::{Error, Result};

/// An acyclic apply ordering over a set of resource definitions
#[derive(Debug)]
pub struct DependencyGraph {
    /// Indices into the definition slice, in apply order
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph from explicit dependency references only
    pub fn build(definitions: &[ResourceDefinition]) -> Result<Self> {
        Self::build_with(definitions, |_| Ok(Vec::new()))
    }

    /// Build the graph from explicit plus value-derived dependencies
    ///
    /// `derived` reports additional dependency ids induced by a definition's
    /// property values (typically the renderer's dependency scan). A
    /// dependency naming a resource outside the submitted set is rejected:
    /// the order would silently skip it otherwise.
    pub fn build_with<F>(definitions: &[ResourceDefinition], derived: F) -> Result<Self>
    where
        F: Fn(&ResourceDefinition) -> Result<Vec<ResourceId>>,
    {
        let index_of: HashMap<&ResourceId, usize> = definitions
            .iter()
            .enumerate()
            .map(|(i, def)| (&def.id, i))
            .collect();

        // Adjacency: edge dependency -> dependent
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
        let mut in_degree: Vec<usize> = vec![0; definitions.len()];

        for (i, def) in definitions.iter().enumerate() {
            let mut deps = def.depends_on.clone();
            deps.extend(derived(def)?);
            for dep in deps {
                let Some(&d) = index_of.get(&dep) else {
                    return Err(Error::UnresolvedReference {
                        resource: def.id.clone(),
                        path: dep.to_string(),
                        message: "dependency is not part of this deployment".to_string(),
                    });
                };
                if d == i {
                    // Self-dependency is a one-member cycle
                    return Err(Error::Cycle {
                        members: vec![def.id.clone()],
                    });
                }
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm with a declaration-ordered ready set: the minimum
        // ready index is always picked, which is what makes ties
        // deterministic across runs.
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(definitions.len());

        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < definitions.len() {
            return Err(Error::Cycle {
                members: cycle_members(definitions, &dependents),
            });
        }

        Ok(Self { order })
    }

    /// Definitions in apply order
    pub fn apply_order<'a>(
        &'a self,
        definitions: &'a [ResourceDefinition],
    ) -> impl Iterator<Item = &'a ResourceDefinition> {
        self.order.iter().map(move |&i| &definitions[i])
    }

    /// Definitions in delete order: the exact reverse of the apply order
    pub fn delete_order<'a>(
        &'a self,
        definitions: &'a [ResourceDefinition],
    ) -> impl Iterator<Item = &'a ResourceDefinition> {
        self.order.iter().rev().map(move |&i| &definitions[i])
    }
}

/// Every resource participating in a cycle, each named exactly once,
/// in declaration order.
fn cycle_members(
    definitions: &[ResourceDefinition],
    dependents: &[Vec<usize>],
) -> Vec<ResourceId> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..definitions.len()).map(|i| graph.add_node(i)).collect();
    for (dep, targets) in dependents.iter().enumerate() {
        for &dependent in targets {
            graph.add_edge(nodes[dep], nodes[dependent], ());
        }
    }

    let mut members: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .flatten()
        .map(|node| graph[node])
        .collect();
    members.sort_unstable();
    members
        .into_iter()
        .map(|i| definitions[i].id.clone())
        .collect()
}

// =============================================================================
// Application graph query
// =============================================================================

/// Kind of edge in an application graph view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
    /// Explicit or value-derived "depends on" relationship
    DependsOn,
    /// Induced same-environment membership
    EnvironmentMembership,
}

/// A node in an application graph view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    /// Resource id
    pub id: ResourceId,
    /// Short resource name
    pub name: String,
    /// Resource type tag
    #[serde(rename = "type")]
    pub resource_type: String,
}

/// An edge in an application graph view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Source resource id
    pub source: ResourceId,
    /// Target resource id
    pub target: ResourceId,
    /// Relationship kind
    pub kind: EdgeKind,
}

/// Node/edge view over an application's resources for external consumption
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationGraph {
    /// All resources in application and environment scope
    pub nodes: Vec<GraphNode>,
    /// Dependency and membership relationships
    pub edges: Vec<GraphEdge>,
}

/// Compute the graph view for an application plus its environment
///
/// Explicit dependency references between in-scope resources become
/// [`EdgeKind::DependsOn`] edges. Each application resource additionally gets
/// an [`EdgeKind::EnvironmentMembership`] edge to each environment-scoped
/// resource it has no explicit edge to, marking shared-environment linkage
/// for topology visualizations. Purely a read: no handler is invoked.
pub fn application_graph(
    application_resources: &[ResourceDefinition],
    environment_resources: &[ResourceDefinition],
) -> ApplicationGraph {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    let in_scope: BTreeSet<&ResourceId> = application_resources
        .iter()
        .chain(environment_resources)
        .map(|def| &def.id)
        .collect();

    for def in application_resources.iter().chain(environment_resources) {
        nodes.push(GraphNode {
            id: def.id.clone(),
            name: def.name.clone(),
            resource_type: def.resource_type.clone(),
        });
        for dep in &def.depends_on {
            if in_scope.contains(dep) {
                edges.push(GraphEdge {
                    source: def.id.clone(),
                    target: dep.clone(),
                    kind: EdgeKind::DependsOn,
                });
            }
        }
    }

    for app_def in application_resources {
        for env_def in environment_resources {
            let already_linked = app_def.depends_on.contains(&env_def.id);
            if !already_linked {
                edges.push(GraphEdge {
                    source: app_def.id.clone(),
                    target: env_def.id.clone(),
                    kind: EdgeKind::EnvironmentMembership,
                });
            }
        }
    }

    ApplicationGraph { nodes, edges }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, deps: &[&str]) -> ResourceDefinition {
        let mut definition = ResourceDefinition::new(id, id.rsplit('/').next().unwrap_or(id), "test/resource");
        for dep in deps {
            definition = definition.with_dependency(*dep);
        }
        definition
    }

    fn apply_ids(definitions: &[ResourceDefinition]) -> Vec<String> {
        let graph = DependencyGraph::build(definitions).expect("acyclic");
        graph
            .apply_order(definitions)
            .map(|d| d.id.to_string())
            .collect()
    }

    #[test]
    fn dependencies_apply_before_dependents() {
        let definitions = vec![
            def("app/web", &["app/db", "app/cache"]),
            def("app/cache", &["app/db"]),
            def("app/db", &[]),
        ];
        assert_eq!(apply_ids(&definitions), vec!["app/db", "app/cache", "app/web"]);
    }

    #[test]
    fn ties_break_by_declaration_order() {
        // b and c are both ready once a is applied; declaration order wins.
        let definitions = vec![
            def("app/c", &["app/a"]),
            def("app/b", &["app/a"]),
            def("app/a", &[]),
        ];
        assert_eq!(apply_ids(&definitions), vec!["app/a", "app/c", "app/b"]);

        // Same set, swapped declarations: the order follows.
        let definitions = vec![
            def("app/b", &["app/a"]),
            def("app/c", &["app/a"]),
            def("app/a", &[]),
        ];
        assert_eq!(apply_ids(&definitions), vec!["app/a", "app/b", "app/c"]);
    }

    #[test]
    fn order_is_reproducible_across_runs() {
        let definitions = vec![
            def("app/w", &[]),
            def("app/x", &["app/w"]),
            def("app/y", &["app/w"]),
            def("app/z", &["app/x", "app/y"]),
        ];
        let first = apply_ids(&definitions);
        for _ in 0..10 {
            assert_eq!(apply_ids(&definitions), first);
        }
    }

    #[test]
    fn delete_order_is_exact_reverse_of_apply_order() {
        let definitions = vec![
            def("app/web", &["app/db"]),
            def("app/db", &[]),
            def("app/worker", &["app/db", "app/web"]),
        ];
        let graph = DependencyGraph::build(&definitions).expect("acyclic");
        let mut applied: Vec<_> = graph.apply_order(&definitions).map(|d| &d.id).collect();
        let deleted: Vec<_> = graph.delete_order(&definitions).map(|d| &d.id).collect();
        applied.reverse();
        assert_eq!(applied, deleted);
    }

    #[test]
    fn two_member_cycle_names_both_exactly_once() {
        let definitions = vec![
            def("app/a", &["app/b"]),
            def("app/b", &["app/a"]),
            def("app/c", &[]),
        ];
        let err = DependencyGraph::build(&definitions).unwrap_err();
        match err {
            Error::Cycle { members } => {
                assert_eq!(
                    members,
                    vec![ResourceId::new("app/a"), ResourceId::new("app/b")]
                );
            }
            other => panic!("expected Cycle, got {other}"),
        }
    }

    #[test]
    fn larger_cycle_names_every_member() {
        let definitions = vec![
            def("app/a", &["app/c"]),
            def("app/b", &["app/a"]),
            def("app/c", &["app/b"]),
        ];
        let err = DependencyGraph::build(&definitions).unwrap_err();
        match err {
            Error::Cycle { members } => {
                assert_eq!(members.len(), 3);
                let unique: BTreeSet<_> = members.iter().collect();
                assert_eq!(unique.len(), 3);
            }
            other => panic!("expected Cycle, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let definitions = vec![def("app/a", &["app/a"])];
        let err = DependencyGraph::build(&definitions).unwrap_err();
        assert!(matches!(err, Error::Cycle { members } if members == vec![ResourceId::new("app/a")]));
    }

    #[test]
    fn out_of_scope_dependency_is_rejected() {
        let definitions = vec![def("app/a", &["app/missing"])];
        let err = DependencyGraph::build(&definitions).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { .. }));
    }

    #[test]
    fn value_derived_dependencies_induce_edges() {
        let definitions = vec![def("app/web", &[]), def("app/db", &[])];
        let graph = DependencyGraph::build_with(&definitions, |d| {
            if d.id.as_str() == "app/web" {
                Ok(vec![ResourceId::new("app/db")])
            } else {
                Ok(Vec::new())
            }
        })
        .expect("acyclic");
        let order: Vec<_> = graph
            .apply_order(&definitions)
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(order, vec!["app/db", "app/web"]);
    }

    #[test]
    fn application_graph_distinguishes_edge_kinds() {
        let app = vec![def("app/web", &["env/redis"]), def("app/worker", &[])];
        let env = vec![def("env/redis", &[])];

        let view = application_graph(&app, &env);

        assert_eq!(view.nodes.len(), 3);
        let depends: Vec<_> = view
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::DependsOn)
            .collect();
        let membership: Vec<_> = view
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::EnvironmentMembership)
            .collect();

        assert_eq!(depends.len(), 1);
        assert_eq!(depends[0].source, ResourceId::new("app/web"));
        assert_eq!(depends[0].target, ResourceId::new("env/redis"));

        // web already depends on redis explicitly; only worker gets a
        // membership edge.
        assert_eq!(membership.len(), 1);
        assert_eq!(membership[0].source, ResourceId::new("app/worker"));
        assert_eq!(membership[0].target, ResourceId::new("env/redis"));
    }
}
