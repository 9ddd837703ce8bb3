mod common;

use common::*;
use serde_json::json;
use spitegraph::commands::{CreateNodeAggregateWithNode, CreateNodeVariant, SetNodeProperties};
use spitegraph::{DimensionSpacePoint, Error, VisibilityConstraints};

fn origin_at(fixture: &Fixture, node: &str, point: &str) -> Option<DimensionSpacePoint> {
    fixture
        .repository
        .subgraph(fixture.live.clone(), lang(point), VisibilityConstraints::without_restrictions())
        .find_node_by_id(&id(node))
        .unwrap()
        .map(|node| node.origin_dimension_space_point)
}

fn create_variant(fixture: &mut Fixture, node: &str, source: &str, target: &str) -> spitegraph::Result<()> {
    fixture
        .repository
        .handle(
            CreateNodeVariant {
                content_stream_id: fixture.live.clone(),
                node_aggregate_id: id(node),
                source_origin: lang(source),
                target_origin: lang(target),
            }
            .into(),
        )
        .map(|_| ())
}

#[test]
fn test_specializations_fall_back_to_generalization() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "news", &root, lang("en"));

    for point in ["en", "de", "de_ch", "fr"] {
        assert_eq!(origin_at(&fixture, "news", point), Some(lang("en")), "point {point}");
    }

    let aggregate = fixture
        .repository
        .content_graph(live)
        .find_node_aggregate_by_id(&id("news"))
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.occupied_dimension_space_points().len(), 1);
    assert_eq!(aggregate.covered_dimension_space_points().len(), 4);
}

#[test]
fn test_node_created_in_specialization_is_invisible_in_generalization() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "neuigkeiten", &root, lang("de"));

    assert_eq!(origin_at(&fixture, "neuigkeiten", "de"), Some(lang("de")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "de_ch"), Some(lang("de")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "en"), None);
    assert_eq!(origin_at(&fixture, "neuigkeiten", "fr"), None);
}

#[test]
fn test_specialization_variant_takes_over_its_specializations() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "news", &root, lang("en"));

    create_variant(&mut fixture, "news", "en", "de").unwrap();
    fixture
        .repository
        .handle(
            SetNodeProperties::new(live, id("news"), lang("de"), props(&[("title", json!("Neuigkeiten"))])).into(),
        )
        .unwrap();

    assert_eq!(origin_at(&fixture, "news", "en"), Some(lang("en")));
    assert_eq!(origin_at(&fixture, "news", "fr"), Some(lang("en")));
    assert_eq!(origin_at(&fixture, "news", "de"), Some(lang("de")));
    assert_eq!(origin_at(&fixture, "news", "de_ch"), Some(lang("de")));

    let subgraph = fixture.repository.subgraph(
        fixture.live.clone(),
        lang("de_ch"),
        VisibilityConstraints::frontend(),
    );
    let node = subgraph.find_node_by_id(&id("news")).unwrap().unwrap();
    assert_eq!(node.property("title"), Some(&json!("Neuigkeiten")));
    let english = fixture
        .repository
        .subgraph(fixture.live.clone(), lang("en"), VisibilityConstraints::frontend())
        .find_node_by_id(&id("news"))
        .unwrap()
        .unwrap();
    assert_eq!(english.property("title"), None);
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}

#[test]
fn test_generalization_variant_covers_uncovered_points_only() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "neuigkeiten", &root, lang("de"));

    create_variant(&mut fixture, "neuigkeiten", "de", "en").unwrap();

    assert_eq!(origin_at(&fixture, "neuigkeiten", "en"), Some(lang("en")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "fr"), Some(lang("en")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "de"), Some(lang("de")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "de_ch"), Some(lang("de")));
}

#[test]
fn test_peer_variant_covers_only_its_own_branch() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "neuigkeiten", &root, lang("de"));

    create_variant(&mut fixture, "neuigkeiten", "de", "fr").unwrap();

    assert_eq!(origin_at(&fixture, "neuigkeiten", "fr"), Some(lang("fr")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "de"), Some(lang("de")));
    assert_eq!(origin_at(&fixture, "neuigkeiten", "en"), None);
}

#[test]
fn test_variant_errors() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "news", &root, lang("en"));
    fixture.create_folder(&live, "nachrichten", &id("news"), lang("de"));

    assert!(matches!(
        create_variant(&mut fixture, "news", "en", "en"),
        Err(Error::DimensionSpacePointIsAlreadyOccupied { .. })
    ));
    assert!(matches!(
        create_variant(&mut fixture, "news", "de", "fr"),
        Err(Error::DimensionSpacePointIsNotYetOccupied { .. })
    ));
    assert!(matches!(
        create_variant(&mut fixture, "nachrichten", "de", "xx"),
        Err(Error::DimensionSpacePointNotFound(_))
    ));
    assert!(matches!(
        create_variant(&mut fixture, ROOT, "en", "de"),
        Err(Error::NodeAggregateIsRoot(_))
    ));
}

#[test]
fn test_variant_of_node_below_specialized_parent_needs_parent_coverage() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "neuigkeiten", &root, lang("de"));
    fixture.create_folder(&live, "archiv", &id("neuigkeiten"), lang("de"));

    assert!(matches!(
        create_variant(&mut fixture, "archiv", "de", "en"),
        Err(Error::NodeAggregateDoesCurrentlyNotCoverDimensionSpacePoint { .. })
    ));
}

#[test]
fn test_variants_of_tethered_children_follow_their_parent() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    fixture
        .repository
        .handle(
            CreateNodeAggregateWithNode::new(live.clone(), id("home"), node_type("Acme:Page"), lang("en"), id(ROOT))
                .with_tethered_descendant("main", id("home-main"))
                .into(),
        )
        .unwrap();

    create_variant(&mut fixture, "home", "en", "de").unwrap();

    let graph = fixture.repository.content_graph(live);
    let main = graph.find_node_aggregate_by_id(&id("home-main")).unwrap().unwrap();
    assert!(main.is_tethered());
    assert!(main.occupies(&lang("de")));
    assert_eq!(origin_at(&fixture, "home-main", "de_ch"), Some(lang("de")));
    assert_eq!(origin_at(&fixture, "home-main", "en"), Some(lang("en")));
}

#[test]
fn test_unknown_points_are_rejected() {
    let mut fixture = Fixture::new(language_config("default"));
    let live = fixture.live.clone();
    let result = fixture.repository.handle(
        CreateNodeAggregateWithNode::new(live, id("news"), node_type("Acme:Folder"), lang("it"), id(ROOT)).into(),
    );
    assert!(matches!(result, Err(Error::DimensionSpacePointNotFound(_))));
}
