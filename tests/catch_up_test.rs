mod common;

use std::sync::{Arc, Mutex};

use common::*;
use serde_json::json;
use spitegraph::commands::{CreateNodeVariant, SetNodeProperties};
use spitegraph::projection::content_graph::CONTENT_GRAPH_PROJECTION;
use spitegraph::projection::workspace::WORKSPACE_PROJECTION;
use spitegraph::{CatchUpHook, ContentRepository, ProjectionUpdated, VisibilityConstraints, WorkspaceName};

/// A small multi-language tree with one variant and a user workspace.
fn populate(fixture: &mut Fixture) {
    let live = fixture.live.clone();
    let root = fixture.root.clone();
    fixture.create_folder(&live, "news", &root, lang("en"));
    fixture.create_folder(&live, "archive", &id("news"), lang("en"));
    fixture
        .repository
        .handle(
            CreateNodeVariant {
                content_stream_id: live.clone(),
                node_aggregate_id: id("news"),
                source_origin: lang("en"),
                target_origin: lang("de"),
            }
            .into(),
        )
        .unwrap();
    fixture
        .repository
        .handle(
            SetNodeProperties::new(live, id("news"), lang("de"), props(&[("title", json!("Neuigkeiten"))])).into(),
        )
        .unwrap();
    fixture.create_workspace("user");
}

/// `(id, origin, title)` of every node below the root, depth first.
fn snapshot(repository: &ContentRepository, point: &str) -> Vec<(String, String, Option<serde_json::Value>)> {
    let live = repository
        .workspaces()
        .find_by_name(&WorkspaceName::live())
        .unwrap()
        .unwrap()
        .current_content_stream_id;
    repository
        .subgraph(live, lang(point), VisibilityConstraints::without_restrictions())
        .find_descendant_nodes(&id(ROOT))
        .unwrap()
        .into_iter()
        .map(|node| {
            (
                node.node_aggregate_id.to_string(),
                node.origin_dimension_space_point.to_json(),
                node.property("title").cloned(),
            )
        })
        .collect()
}

#[test]
fn test_reopen_resumes_without_replaying() {
    init_tracing();
    let (_dir, path) = temp_db();

    let (last, before) = {
        let repository = ContentRepository::open(&path, language_config("default")).unwrap();
        let mut fixture = Fixture::with_repository(repository);
        populate(&mut fixture);
        (fixture.repository.last_sequence_number(), snapshot(&fixture.repository, "de_ch"))
    };

    let mut reopened = ContentRepository::open(&path, language_config("default")).unwrap();
    assert_eq!(reopened.last_sequence_number(), last);
    assert_eq!(reopened.catch_up().unwrap().applied, 0);
    assert_eq!(snapshot(&reopened, "de_ch"), before);
    assert!(reopened
        .workspaces()
        .find_by_name(&workspace("user"))
        .unwrap()
        .is_some());
}

#[test]
fn test_replay_rebuilds_identical_state() {
    let mut fixture = Fixture::new(language_config("default"));
    populate(&mut fixture);
    let before: Vec<_> = ["en", "de", "de_ch", "fr"]
        .iter()
        .map(|point| snapshot(&fixture.repository, point))
        .collect();
    let last = fixture.repository.last_sequence_number();

    let result = fixture.repository.replay_projection(CONTENT_GRAPH_PROJECTION).unwrap();
    assert_eq!(result.last_sequence_number, last);
    fixture.repository.replay_projection(WORKSPACE_PROJECTION).unwrap();

    let after: Vec<_> = ["en", "de", "de_ch", "fr"]
        .iter()
        .map(|point| snapshot(&fixture.repository, point))
        .collect();
    assert_eq!(after, before);
    assert!(fixture.repository.workspaces().find_by_name(&workspace("user")).unwrap().is_some());
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<ProjectionUpdated>>>);

impl CatchUpHook for Recorder {
    fn on_batch_committed(&self, update: &ProjectionUpdated) {
        self.0.lock().unwrap().push(update.clone());
    }
}

#[test]
fn test_hooks_see_each_committed_batch() {
    let mut fixture = Fixture::new(plain_config("default"));
    let recorder = Recorder::default();
    fixture.repository.add_hook(Box::new(recorder.clone()));

    let user_cs = fixture.create_workspace("user");
    let root = fixture.root.clone();
    fixture.create_folder(&user_cs, "news", &root, spitegraph::DimensionSpacePoint::empty());

    let updates = recorder.0.lock().unwrap();
    assert!(!updates.is_empty());
    let last = updates.last().unwrap();
    assert_eq!(last.last_sequence_number, fixture.repository.last_sequence_number());
    assert!(last.content_stream_ids.contains(&user_cs));
    assert!(!last.content_stream_ids.contains(&fixture.live));
}

/// Two repositories on one file, as two processes would use it.
#[test]
fn test_two_repositories_share_one_file() {
    init_tracing();
    let (_dir, path) = temp_db();
    let a = ContentRepository::open(&path, plain_config("default")).unwrap();
    let mut a = Fixture::with_repository(a);
    let mut b = ContentRepository::open(&path, plain_config("default")).unwrap();
    let live = a.live.clone();
    let root = a.root.clone();
    let empty = spitegraph::DimensionSpacePoint::empty;

    // B caches that "one" does not exist yet.
    assert!(b
        .subgraph(live.clone(), empty(), VisibilityConstraints::without_restrictions())
        .find_node_by_id(&id("one"))
        .unwrap()
        .is_none());

    a.create_folder(&live, "one", &root, empty());
    b.handle(
        spitegraph::commands::CreateNodeAggregateWithNode::new(
            live.clone(),
            id("two"),
            node_type("Acme:Folder"),
            empty(),
            root.clone(),
        )
        .into(),
    )
    .unwrap();
    a.create_folder(&live, "three", &root, empty());

    b.catch_up().unwrap();
    a.repository.catch_up().unwrap();
    for repository in [&a.repository, &b] {
        let subgraph = repository.subgraph(live.clone(), empty(), VisibilityConstraints::without_restrictions());
        let children: Vec<String> = subgraph
            .find_child_nodes(&root)
            .unwrap()
            .into_iter()
            .map(|node| node.node_aggregate_id.to_string())
            .collect();
        assert_eq!(children, ["one", "two", "three"]);
        assert!(repository.detect_integrity_violations().unwrap().is_empty());
    }
    assert_eq!(a.repository.last_sequence_number(), b.last_sequence_number());
}
