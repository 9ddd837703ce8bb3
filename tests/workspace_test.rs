mod common;

use common::*;
use serde_json::json;
use spitegraph::commands::{
    CreateWorkspace, DeleteWorkspace, DiscardWorkspace, PublishWorkspace, RebaseErrorHandlingStrategy,
    RebaseWorkspace, SetNodeProperties,
};
use spitegraph::types::{ContentStreamStatus, WorkspaceStatus};
use spitegraph::{DimensionSpacePoint, Error, VisibilityConstraints, WorkspaceName};

fn status(fixture: &Fixture, name: &str) -> WorkspaceStatus {
    fixture
        .repository
        .workspaces()
        .find_by_name(&workspace(name))
        .unwrap()
        .unwrap()
        .status
}

fn exists_in(fixture: &Fixture, name: &WorkspaceName, node: &str) -> bool {
    fixture
        .repository
        .content_graph(fixture.current(name))
        .find_node_aggregate_by_id(&id(node))
        .unwrap()
        .is_some()
}

fn title_in(fixture: &Fixture, name: &WorkspaceName, node: &str) -> Option<serde_json::Value> {
    fixture
        .repository
        .subgraph(fixture.current(name), DimensionSpacePoint::empty(), VisibilityConstraints::frontend())
        .find_node_by_id(&id(node))
        .unwrap()
        .and_then(|node| node.property("title").cloned())
}

fn set_title(fixture: &mut Fixture, name: &WorkspaceName, node: &str, title: &str) {
    let content_stream_id = fixture.current(name);
    fixture
        .repository
        .handle(
            SetNodeProperties::new(
                content_stream_id,
                id(node),
                DimensionSpacePoint::empty(),
                props(&[("title", json!(title))]),
            )
            .into(),
        )
        .unwrap();
}

fn create_in(fixture: &mut Fixture, name: &WorkspaceName, node: &str) {
    let content_stream_id = fixture.current(name);
    let root = fixture.root.clone();
    fixture.create_folder(&content_stream_id, node, &root, DimensionSpacePoint::empty());
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn test_workspace_creation_errors() {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("user");

    assert!(matches!(
        fixture
            .repository
            .handle(CreateWorkspace::new(workspace("user"), WorkspaceName::live()).into()),
        Err(Error::WorkspaceAlreadyExists(_))
    ));
    assert!(matches!(
        fixture
            .repository
            .handle(CreateWorkspace::new(workspace("other"), workspace("missing")).into()),
        Err(Error::BaseWorkspaceDoesNotExist(_))
    ));
    assert!(matches!(
        fixture.repository.handle(PublishWorkspace::new(WorkspaceName::live()).into()),
        Err(Error::WorkspaceHasNoBaseWorkspace(_))
    ));
}

#[test]
fn test_new_workspace_sees_base_content() {
    let mut fixture = Fixture::new(plain_config("default"));
    create_in(&mut fixture, &WorkspaceName::live(), "news");
    let user_cs = fixture.create_workspace("user");

    assert!(exists_in(&fixture, &workspace("user"), "news"));
    assert_eq!(status(&fixture, "user"), WorkspaceStatus::UpToDate);
    let record = fixture.repository.content_streams().find_by_id(&user_cs).unwrap().unwrap();
    assert_eq!(record.source_content_stream_id, Some(fixture.live.clone()));
    assert_eq!(record.status, ContentStreamStatus::InUseByWorkspace);
}

// =============================================================================
// Publish
// =============================================================================

#[test]
fn test_publish_then_dependents_become_outdated() {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("user");
    fixture.create_workspace("editor");
    let user = workspace("user");

    create_in(&mut fixture, &user, "news");
    assert!(!exists_in(&fixture, &WorkspaceName::live(), "news"));

    fixture.repository.handle(PublishWorkspace::new(user.clone()).into()).unwrap();

    assert!(exists_in(&fixture, &WorkspaceName::live(), "news"));
    assert!(exists_in(&fixture, &user, "news"));
    assert_eq!(status(&fixture, "user"), WorkspaceStatus::UpToDate);
    assert_eq!(status(&fixture, "editor"), WorkspaceStatus::Outdated);
    assert!(!exists_in(&fixture, &workspace("editor"), "news"));
}

#[test]
fn test_publish_conflicts_are_retryable_after_rebase() {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("user");
    let user = workspace("user");
    create_in(&mut fixture, &user, "news");
    create_in(&mut fixture, &WorkspaceName::live(), "blog");

    let err = fixture
        .repository
        .handle(PublishWorkspace::new(user.clone()).into())
        .unwrap_err();
    assert!(matches!(err, Error::BaseWorkspaceHasBeenModifiedInTheMeantime { .. }));
    assert!(err.is_retryable());

    fixture.repository.handle(RebaseWorkspace::new(user.clone()).into()).unwrap();
    fixture.repository.handle(PublishWorkspace::new(user.clone()).into()).unwrap();

    for node in ["news", "blog"] {
        assert!(exists_in(&fixture, &WorkspaceName::live(), node), "{node}");
    }
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}

#[test]
fn test_publish_through_nested_workspaces() {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("review");
    let review = workspace("review");
    let user = workspace("user");
    fixture
        .repository
        .handle(CreateWorkspace::new(user.clone(), review.clone()).into())
        .unwrap();

    create_in(&mut fixture, &user, "news");
    fixture.repository.handle(PublishWorkspace::new(user.clone()).into()).unwrap();
    assert!(exists_in(&fixture, &review, "news"));
    assert!(!exists_in(&fixture, &WorkspaceName::live(), "news"));

    fixture.repository.handle(PublishWorkspace::new(review).into()).unwrap();
    assert!(exists_in(&fixture, &WorkspaceName::live(), "news"));
}

// =============================================================================
// Rebase
// =============================================================================

/// `user` creates and titles `news` while `live` creates its own `news`.
fn conflicting_fixture() -> Fixture {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("user");
    let user = workspace("user");
    create_in(&mut fixture, &user, "news");
    set_title(&mut fixture, &user, "news", "from user");
    create_in(&mut fixture, &user, "blog");
    create_in(&mut fixture, &WorkspaceName::live(), "news");
    fixture
}

#[test]
fn test_rebase_fail_strategy_reports_every_failure() {
    let mut fixture = conflicting_fixture();
    let user = workspace("user");
    let before = fixture.current(&user);

    let err = fixture
        .repository
        .handle(RebaseWorkspace::new(user.clone()).into())
        .unwrap_err();
    let Error::WorkspaceRebaseFailed(failures) = err else {
        panic!("expected a rebase failure, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures.iter().next().unwrap().error_kind, "NodeAggregateCurrentlyExists");

    assert_eq!(fixture.current(&user), before);
    assert_eq!(status(&fixture, "user"), WorkspaceStatus::OutdatedConflict);
    assert_eq!(title_in(&fixture, &user, "news"), Some(json!("from user")));

    // The workspace can still be written to.
    set_title(&mut fixture, &user, "news", "still editable");
    assert!(fixture.repository.prune().unwrap().is_empty());
}

#[test]
fn test_rebase_force_strategy_keeps_what_applies() {
    let mut fixture = conflicting_fixture();
    let user = workspace("user");
    let before = fixture.current(&user);

    let result = fixture
        .repository
        .handle(
            RebaseWorkspace::new(user.clone())
                .with_strategy(RebaseErrorHandlingStrategy::Force)
                .into(),
        )
        .unwrap();
    let statistics = result.rebase_statistics.unwrap();
    assert_eq!(statistics.total_number_of_replayed_commands(), 3);
    assert_eq!(statistics.total_number_of_applied_commands, 2);
    assert_eq!(statistics.errors.len(), 1);
    assert_eq!(statistics.errors[0].command_index, 0);
    assert_eq!(statistics.errors[0].cause_class, "NodeAggregateCurrentlyExists");

    assert_ne!(fixture.current(&user), before);
    assert_eq!(status(&fixture, "user"), WorkspaceStatus::UpToDate);
    assert_eq!(title_in(&fixture, &user, "news"), Some(json!("from user")));
    assert!(exists_in(&fixture, &user, "blog"));
    assert_eq!(
        fixture.repository.content_streams().find_by_id(&before).unwrap().unwrap().status,
        ContentStreamStatus::NoLongerInUse
    );
}

#[test]
fn test_rebase_of_up_to_date_workspace_is_a_replay() {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("user");
    let user = workspace("user");
    create_in(&mut fixture, &user, "news");

    let statistics = fixture
        .repository
        .handle(RebaseWorkspace::new(user.clone()).into())
        .unwrap()
        .rebase_statistics
        .unwrap();
    assert_eq!(statistics.total_number_of_applied_commands, 1);
    assert!(!statistics.has_errors());
    assert!(exists_in(&fixture, &user, "news"));
}

// =============================================================================
// Discard, Delete, Prune
// =============================================================================

#[test]
fn test_discard_drops_changes_and_resets_status() {
    let mut fixture = conflicting_fixture();
    let user = workspace("user");
    assert_eq!(status(&fixture, "user"), WorkspaceStatus::Outdated);

    fixture.repository.handle(DiscardWorkspace::new(user.clone()).into()).unwrap();

    assert_eq!(status(&fixture, "user"), WorkspaceStatus::UpToDate);
    assert!(!exists_in(&fixture, &user, "blog"));
    assert!(exists_in(&fixture, &user, "news"));
    assert_eq!(title_in(&fixture, &user, "news"), None);
}

#[test]
fn test_prune_removes_replaced_streams() {
    let mut fixture = Fixture::new(plain_config("default"));
    fixture.create_workspace("user");
    let user = workspace("user");
    let first = fixture.current(&user);
    create_in(&mut fixture, &user, "news");
    fixture.repository.handle(PublishWorkspace::new(user.clone()).into()).unwrap();
    let second = fixture.current(&user);
    fixture.repository.handle(DiscardWorkspace::new(user.clone()).into()).unwrap();

    let mut pruned = fixture.repository.prune().unwrap();
    pruned.sort();
    let mut expected = vec![first.clone(), second];
    expected.sort();
    assert_eq!(pruned, expected);

    assert!(fixture.repository.content_streams().find_by_id(&first).unwrap().unwrap().removed);
    assert!(exists_in(&fixture, &user, "news"));
    assert!(exists_in(&fixture, &WorkspaceName::live(), "news"));
    assert!(fixture.repository.prune().unwrap().is_empty());
    assert!(fixture.repository.detect_integrity_violations().unwrap().is_empty());
}

#[test]
fn test_delete_workspace() {
    let mut fixture = Fixture::new(plain_config("default"));
    let user_cs = fixture.create_workspace("user");

    fixture
        .repository
        .handle(DeleteWorkspace { workspace_name: workspace("user") }.into())
        .unwrap();

    assert!(fixture.repository.workspaces().find_by_name(&workspace("user")).unwrap().is_none());
    assert!(fixture.repository.content_streams().find_by_id(&user_cs).unwrap().unwrap().removed);
    assert!(matches!(
        fixture.repository.handle(DeleteWorkspace { workspace_name: workspace("user") }.into()),
        Err(Error::WorkspaceDoesNotExist(_))
    ));
}
