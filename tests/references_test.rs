mod common;

use common::*;
use serde_json::json;
use spitegraph::commands::{
    CreateNodeAggregateWithNode, CreateNodeVariant, DisableNodeAggregate, NodeReferenceToWrite,
    NodeVariantSelectionStrategy, PublishWorkspace, RebaseWorkspace, SetNodeReferences,
};
use spitegraph::{
    ContentStreamId, DimensionSpacePoint, Error, ReferenceName, Result, VisibilityConstraints, WorkspaceName,
};

fn related() -> ReferenceName {
    ReferenceName::new("related").unwrap()
}

fn set_references(
    fixture: &mut Fixture,
    content_stream_id: &ContentStreamId,
    source: &str,
    origin: DimensionSpacePoint,
    references: Vec<NodeReferenceToWrite>,
) -> Result<()> {
    fixture
        .repository
        .handle(
            SetNodeReferences {
                content_stream_id: content_stream_id.clone(),
                source_node_aggregate_id: id(source),
                source_origin_dimension_space_point: origin,
                reference_name: related(),
                references,
            }
            .into(),
        )
        .map(|_| ())
}

fn targets(fixture: &Fixture, content_stream_id: &ContentStreamId, point: DimensionSpacePoint, source: &str) -> Vec<String> {
    fixture
        .repository
        .subgraph(content_stream_id.clone(), point, VisibilityConstraints::frontend())
        .find_references(&id(source), None)
        .unwrap()
        .into_iter()
        .map(|reference| reference.node.node_aggregate_id.to_string())
        .collect()
}

/// Folders `a`, `b` and `c` below the root, in the empty point.
fn folders() -> Fixture {
    let mut fixture = Fixture::new(plain_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    for node in ["a", "b", "c"] {
        fixture.create_folder(&live, node, &root, DimensionSpacePoint::empty());
    }
    fixture
}

// =============================================================================
// Reading and Writing
// =============================================================================

#[test]
fn test_references_keep_order_and_properties() {
    let mut fixture = folders();
    let live = fixture.live.clone();
    set_references(
        &mut fixture,
        &live,
        "a",
        DimensionSpacePoint::empty(),
        vec![
            NodeReferenceToWrite::to(id("c")).with_properties(props(&[("weight", json!(3))])),
            NodeReferenceToWrite::to(id("b")),
        ],
    )
    .unwrap();

    let subgraph = fixture
        .repository
        .subgraph(live.clone(), DimensionSpacePoint::empty(), VisibilityConstraints::frontend());
    let references = subgraph.find_references(&id("a"), Some(&related())).unwrap();
    assert_eq!(references.len(), 2);
    assert_eq!(references[0].node.node_aggregate_id, id("c"));
    assert_eq!(references[0].name, related());
    assert_eq!(references[0].properties, Some(props(&[("weight", json!(3))])));
    assert_eq!(references[1].node.node_aggregate_id, id("b"));
    assert_eq!(references[1].properties, None);

    let back = subgraph.find_back_references(&id("b"), None).unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].node.node_aggregate_id, id("a"));
    assert!(subgraph.find_back_references(&id("a"), None).unwrap().is_empty());
    assert!(subgraph
        .find_references(&id("a"), Some(&ReferenceName::new("other").unwrap()))
        .unwrap()
        .is_empty());

    set_references(&mut fixture, &live, "a", DimensionSpacePoint::empty(), Vec::new()).unwrap();
    assert!(targets(&fixture, &live, DimensionSpacePoint::empty(), "a").is_empty());
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}

#[test]
fn test_reference_errors() {
    let mut fixture = folders();
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture
        .repository
        .handle(
            CreateNodeAggregateWithNode::new(
                live.clone(),
                id("home"),
                node_type("Acme:Page"),
                DimensionSpacePoint::empty(),
                root,
            )
            .into(),
        )
        .unwrap();
    let empty = DimensionSpacePoint::empty;

    let err = set_references(&mut fixture, &live, "home", empty(), vec![NodeReferenceToWrite::to(id("a"))]);
    assert!(matches!(err, Err(Error::ReferenceCannotBeSet { .. })));

    let three = ["a", "b", "c"].iter().map(|target| NodeReferenceToWrite::to(id(target))).collect();
    let err = set_references(&mut fixture, &live, "a", empty(), three);
    assert!(matches!(err, Err(Error::ReferenceCardinalityExceeded { max_items: 2, given: 3, .. })));

    let err = set_references(&mut fixture, &live, "a", empty(), vec![NodeReferenceToWrite::to(id("nope"))]);
    assert!(matches!(err, Err(Error::NodeAggregateCurrentlyDoesNotExist(_))));

    let err = set_references(&mut fixture, &live, "a", empty(), vec![NodeReferenceToWrite::to(id(ROOT))]);
    assert!(matches!(err, Err(Error::NodeAggregateIsRoot(_))));

    let err = set_references(&mut fixture, &live, ROOT, empty(), vec![NodeReferenceToWrite::to(id("a"))]);
    assert!(matches!(err, Err(Error::NodeAggregateIsRoot(_))));

    let heavy = NodeReferenceToWrite::to(id("b")).with_properties(props(&[("weight", json!("heavy"))]));
    let err = set_references(&mut fixture, &live, "a", empty(), vec![heavy]);
    assert!(matches!(err, Err(Error::InvalidPropertyType { .. })));

    let colored = NodeReferenceToWrite::to(id("b")).with_properties(props(&[("color", json!("red"))]));
    let err = set_references(&mut fixture, &live, "a", empty(), vec![colored]);
    assert!(matches!(err, Err(Error::UnknownProperty { .. })));

    assert!(targets(&fixture, &live, empty(), "a").is_empty());
}

#[test]
fn test_invisible_targets_are_left_out() {
    let mut fixture = folders();
    let live = fixture.live.clone();
    set_references(
        &mut fixture,
        &live,
        "a",
        DimensionSpacePoint::empty(),
        vec![NodeReferenceToWrite::to(id("b")), NodeReferenceToWrite::to(id("c"))],
    )
    .unwrap();
    fixture
        .repository
        .handle(
            DisableNodeAggregate {
                content_stream_id: live.clone(),
                node_aggregate_id: id("b"),
                covered_dimension_space_point: DimensionSpacePoint::empty(),
                node_variant_selection_strategy: NodeVariantSelectionStrategy::AllVariants,
            }
            .into(),
        )
        .unwrap();

    assert_eq!(targets(&fixture, &live, DimensionSpacePoint::empty(), "a"), ["c"]);
    let everything = fixture
        .repository
        .subgraph(live, DimensionSpacePoint::empty(), VisibilityConstraints::without_restrictions())
        .find_references(&id("a"), None)
        .unwrap();
    assert_eq!(everything.len(), 2);
}

// =============================================================================
// Variants
// =============================================================================

#[test]
fn test_variants_start_with_the_references_of_their_source() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    for node in ["a", "b"] {
        fixture.create_folder(&live, node, &root, lang("en"));
    }
    set_references(&mut fixture, &live, "a", lang("en"), vec![NodeReferenceToWrite::to(id("b"))]).unwrap();
    assert_eq!(targets(&fixture, &live, lang("de"), "a"), ["b"]);

    fixture
        .repository
        .handle(
            CreateNodeVariant {
                content_stream_id: live.clone(),
                node_aggregate_id: id("a"),
                source_origin: lang("en"),
                target_origin: lang("de"),
            }
            .into(),
        )
        .unwrap();
    assert_eq!(targets(&fixture, &live, lang("de"), "a"), ["b"]);

    // Each variant holds its own references from here on.
    set_references(&mut fixture, &live, "a", lang("de"), Vec::new()).unwrap();
    assert!(targets(&fixture, &live, lang("de"), "a").is_empty());
    assert!(targets(&fixture, &live, lang("de_ch"), "a").is_empty());
    assert_eq!(targets(&fixture, &live, lang("en"), "a"), ["b"]);
    assert_eq!(targets(&fixture, &live, lang("fr"), "a"), ["b"]);

    let err = set_references(&mut fixture, &live, "a", lang("fr"), Vec::new());
    assert!(matches!(err, Err(Error::DimensionSpacePointIsNotYetOccupied { .. })));
}

// =============================================================================
// Workspaces
// =============================================================================

#[test]
fn test_references_stay_in_their_workspace_until_published() {
    let mut fixture = folders();
    fixture.create_workspace("user");
    let user = workspace("user");
    let user_cs = fixture.current(&user);
    set_references(
        &mut fixture,
        &user_cs,
        "a",
        DimensionSpacePoint::empty(),
        vec![NodeReferenceToWrite::to(id("b"))],
    )
    .unwrap();

    let live = fixture.live.clone();
    assert!(targets(&fixture, &live, DimensionSpacePoint::empty(), "a").is_empty());
    assert_eq!(targets(&fixture, &user_cs, DimensionSpacePoint::empty(), "a"), ["b"]);

    fixture.repository.handle(PublishWorkspace::new(user.clone()).into()).unwrap();
    let live = fixture.current(&WorkspaceName::live());
    assert_eq!(targets(&fixture, &live, DimensionSpacePoint::empty(), "a"), ["b"]);
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}

#[test]
fn test_rebase_replays_references() {
    let mut fixture = folders();
    fixture.create_workspace("user");
    let user = workspace("user");
    let user_cs = fixture.current(&user);
    set_references(
        &mut fixture,
        &user_cs,
        "a",
        DimensionSpacePoint::empty(),
        vec![NodeReferenceToWrite::to(id("c")), NodeReferenceToWrite::to(id("b"))],
    )
    .unwrap();
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "d", &root, DimensionSpacePoint::empty());

    fixture.repository.handle(RebaseWorkspace::new(user.clone()).into()).unwrap();

    let rebased = fixture.current(&user);
    assert_ne!(rebased, user_cs);
    assert_eq!(targets(&fixture, &rebased, DimensionSpacePoint::empty(), "a"), ["c", "b"]);
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}
