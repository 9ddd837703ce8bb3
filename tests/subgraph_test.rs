mod common;

use common::*;
use spitegraph::commands::{CreateNodeAggregateWithNode, MoveNodeAggregate, RelationDistributionStrategy};
use spitegraph::{ContentSubgraph, DimensionSpacePoint, Node, NodeTypeName, VisibilityConstraints};

fn ids(nodes: &[Node]) -> Vec<&str> {
    nodes.iter().map(|node| node.node_aggregate_id.as_str()).collect()
}

/// ```text
/// root
/// ├── c (created last, before a)
/// ├── a
/// │   ├── a1
/// │   └── a2
/// └── b
/// ```
fn tree() -> Fixture {
    let mut fixture = Fixture::new(plain_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "a", &root, DimensionSpacePoint::empty());
    fixture.create_folder(&live, "b", &root, DimensionSpacePoint::empty());
    fixture.create_folder(&live, "a1", &id("a"), DimensionSpacePoint::empty());
    fixture.create_folder(&live, "a2", &id("a"), DimensionSpacePoint::empty());
    fixture
        .repository
        .handle(
            CreateNodeAggregateWithNode::new(
                live,
                id("c"),
                node_type("Acme:Folder"),
                DimensionSpacePoint::empty(),
                id(ROOT),
            )
            .with_node_name(name("c"))
            .with_succeeding_sibling(id("a"))
            .into(),
        )
        .unwrap();
    fixture
}

fn subgraph(fixture: &Fixture) -> ContentSubgraph<'_> {
    fixture
        .repository
        .subgraph(fixture.live.clone(), DimensionSpacePoint::empty(), VisibilityConstraints::frontend())
}

#[test]
fn test_children_respect_succeeding_sibling() {
    let fixture = tree();
    let subgraph = subgraph(&fixture);

    assert_eq!(ids(&subgraph.find_child_nodes(&id(ROOT)).unwrap()), vec!["c", "a", "b"]);
    assert_eq!(subgraph.count_child_nodes(&id("a")).unwrap(), 2);
    assert_eq!(subgraph.count_child_nodes(&id("b")).unwrap(), 0);
    assert!(subgraph.find_child_nodes(&id("missing")).unwrap().is_empty());
}

#[test]
fn test_parent_and_ancestors() {
    let fixture = tree();
    let subgraph = subgraph(&fixture);

    let parent = subgraph.find_parent_node(&id("a2")).unwrap().unwrap();
    assert_eq!(parent.node_aggregate_id.as_str(), "a");
    assert!(subgraph.find_parent_node(&id(ROOT)).unwrap().is_none());
    assert_eq!(ids(&subgraph.find_ancestor_nodes(&id("a2")).unwrap()), vec!["a", ROOT]);
}

#[test]
fn test_siblings_closest_first() {
    let fixture = tree();
    let subgraph = subgraph(&fixture);

    assert_eq!(ids(&subgraph.find_preceding_siblings(&id("b")).unwrap()), vec!["a", "c"]);
    assert_eq!(ids(&subgraph.find_succeeding_siblings(&id("c")).unwrap()), vec!["a", "b"]);
    assert!(subgraph.find_succeeding_siblings(&id("b")).unwrap().is_empty());
}

#[test]
fn test_descendants_depth_first() {
    let fixture = tree();
    let subgraph = subgraph(&fixture);

    assert_eq!(
        ids(&subgraph.find_descendant_nodes(&id(ROOT)).unwrap()),
        vec!["c", "a", "a1", "a2", "b"]
    );
}

#[test]
fn test_path_and_root_lookup() {
    let fixture = tree();
    let subgraph = subgraph(&fixture);

    let a2 = subgraph.find_node_by_path(&id(ROOT), &[name("a"), name("a2")]).unwrap().unwrap();
    assert_eq!(a2.node_aggregate_id.as_str(), "a2");
    assert!(subgraph.find_node_by_path(&id(ROOT), &[name("b"), name("a2")]).unwrap().is_none());

    let root = subgraph.find_root_node_by_type(&NodeTypeName::root()).unwrap().unwrap();
    assert!(root.is_root());
    assert_eq!(root.node_aggregate_id.as_str(), ROOT);
}

#[test]
fn test_cached_lookups_see_later_changes() {
    let mut fixture = tree();
    {
        let subgraph = subgraph(&fixture);
        assert_eq!(subgraph.find_parent_node(&id("b")).unwrap().unwrap().node_aggregate_id.as_str(), ROOT);
        assert!(!fixture.repository.caches().is_empty());
    }

    fixture
        .repository
        .handle(
            MoveNodeAggregate::new(
                fixture.live.clone(),
                id("b"),
                DimensionSpacePoint::empty(),
                RelationDistributionStrategy::GatherAll,
            )
            .with_new_parent(id("a"))
            .into(),
        )
        .unwrap();

    let subgraph = subgraph(&fixture);
    assert_eq!(subgraph.find_parent_node(&id("b")).unwrap().unwrap().node_aggregate_id.as_str(), "a");
    assert_eq!(ids(&subgraph.find_child_nodes(&id("a")).unwrap()), vec!["a1", "a2", "b"]);
}
