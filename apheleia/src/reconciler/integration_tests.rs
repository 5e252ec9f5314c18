//! End-to-end reconcile scenarios across all three record kinds.

use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

use crate::core::{
    ArtifactBuildState, ComponentBuildState, DependencyBuildState, Kind, ObjectKey,
};
use crate::errors::ApheleiaError;
use crate::identity::{artifact_build_name, contaminated_by_annotation, dependency_build_id};
use crate::pipeline::PipelinePurpose;
use crate::store::{Resource, StoreOp, TypedStore};
use crate::testing::{Harness, TEST_NAMESPACE};

const A: &str = "org.acme:a:1.0";
const B: &str = "org.acme:b:1.0";
const Z: &str = "org.vendor:z:2.0";

/// Runs every remaining deploy and notify to success.
async fn deliver(h: &Harness) {
    loop {
        h.settle().await;
        let finished = h.complete_all(PipelinePurpose::Deploy, true)
            + h.complete_all(PipelinePurpose::Notify, true);
        if finished == 0 {
            return;
        }
    }
}

#[tokio::test]
async fn test_shared_repository_builds_once() {
    let h = Harness::new();
    h.create_component("cb", &[A, B]).await;
    h.settle().await;

    let repo = h.scm("acme");
    h.complete_discovery(A, &repo);
    h.complete_discovery(B, &repo);
    h.settle().await;

    let dbs = h.dependency_builds().await;
    assert_eq!(dbs.len(), 1);
    assert_eq!(dbs[0].metadata.owner_references.len(), 2);
    assert_eq!(h.backend.runs_for(PipelinePurpose::Build).len(), 1);

    h.complete_build(&dbs[0].metadata.name, &[A, B], "");
    deliver(&h).await;

    let cb = h.component("cb").await;
    assert_eq!(cb.status.state, ComponentBuildState::Complete);
    assert_eq!(cb.status.outstanding, 0);
    assert!(cb.status.result_notified);
    assert!(cb.status.artifact_state.values().all(|a| a.deployed));
    assert_eq!(h.backend.runs_for(PipelinePurpose::Deploy).len(), 2);
    assert_eq!(h.backend.runs_for(PipelinePurpose::Notify).len(), 1);
}

/// Discovers A and B in `order`, reconciling each artifact as soon as its
/// discovery lands. Returns the one shared build's name and owner names.
async fn shared_build_after(order: [&str; 2]) -> (String, BTreeSet<String>) {
    let h = Harness::new();
    h.create_component("cb", &[A, B]).await;
    h.settle().await;

    let repo = h.scm("acme");
    for gav in order {
        h.complete_discovery(gav, &repo);
        h.reconcile(&h.artifact(gav).await.key()).await.unwrap();
    }
    h.settle().await;

    let dbs = h.dependency_builds().await;
    assert_eq!(dbs.len(), 1);
    assert_eq!(h.backend.runs_for(PipelinePurpose::Build).len(), 1);
    let owners = dbs[0]
        .metadata
        .owner_references
        .iter()
        .map(|o| o.name.clone())
        .collect();
    (dbs[0].metadata.name.clone(), owners)
}

#[tokio::test]
async fn test_shared_build_does_not_depend_on_discovery_order() {
    let forward = shared_build_after([A, B]).await;
    let reverse = shared_build_after([B, A]).await;

    assert_eq!(forward, reverse);
    let repo = Harness::new().scm("acme");
    assert_eq!(forward.0, dependency_build_id(&repo.scm_url, &repo.tag, &repo.path));
    assert_eq!(
        forward.1,
        BTreeSet::from([artifact_build_name(A), artifact_build_name(B)])
    );
}

#[tokio::test]
async fn test_converged_state_is_a_fixed_point() {
    let h = Harness::new();
    h.create_component("cb", &[A]).await;
    h.settle().await;
    h.complete_discovery(A, &h.scm("acme"));
    h.settle().await;
    let db = h.dependency_builds().await.remove(0);
    h.complete_build(&db.metadata.name, &[A], "");
    deliver(&h).await;

    let version = h.store.last_version();
    let runs = h.backend.runs().len();
    let events = h.events.len();

    assert_eq!(h.settle().await, 1);
    for kind in Kind::ALL {
        for key in h.store.keys(kind) {
            h.reconcile(&key).await.unwrap();
        }
    }

    assert_eq!(h.store.last_version(), version);
    assert_eq!(h.backend.runs().len(), runs);
    assert_eq!(h.events.len(), events);
}

#[tokio::test]
async fn test_missing_source_fails_component() {
    let h = Harness::new();
    h.create_component("cb", &[A]).await;
    h.settle().await;
    h.complete_discovery_missing(A);
    h.settle().await;

    assert_eq!(h.artifact(A).await.status.state, ArtifactBuildState::Missing);
    let cb = h.component("cb").await;
    assert_eq!(cb.status.state, ComponentBuildState::Failed);
    assert_eq!(
        cb.status.message,
        format!("{A} Missing: source of {A} could not be located")
    );
    assert!(h.backend.runs_for(PipelinePurpose::Deploy).is_empty());

    let notify = &h.backend.runs_for(PipelinePurpose::Notify)[0];
    assert_eq!(notify.params["STATE"], "Failed");
}

#[tokio::test]
async fn test_contamination_heals_after_contaminant_rebuild() {
    let h = Harness::new();
    h.create_component("cb", &[A]).await;
    h.settle().await;
    h.complete_discovery(A, &h.scm("acme"));
    h.settle().await;

    let r = h.dependency_builds().await.remove(0);
    let contaminants = format!(r#"[{{"gav":"{Z}","contaminatedArtifacts":["{A}"]}}]"#);
    h.complete_build(&r.metadata.name, &[], &contaminants);
    h.settle().await;

    assert_eq!(
        h.dependency_build(&r.metadata.name).await.status.state,
        DependencyBuildState::Contaminated
    );
    let a = h.artifact(A).await;
    assert_eq!(a.status.state, ArtifactBuildState::Failed);
    assert_eq!(
        a.metadata.annotation(&contaminated_by_annotation(&r.metadata.name)),
        Some(r.metadata.name.as_str())
    );
    assert_eq!(h.component("cb").await.status.state, ComponentBuildState::Failed);
    let z = h.artifact(Z).await;
    assert_eq!(z.status.state, ArtifactBuildState::Discovering);

    h.complete_discovery(Z, &h.scm("vendor-z"));
    h.settle().await;
    let z_db = h.artifact(Z).await.dependency_build_name().unwrap();
    h.complete_build(&z_db, &[Z], "");
    deliver(&h).await;

    assert_eq!(h.artifact(Z).await.status.state, ArtifactBuildState::Complete);
    let r = h.dependency_build(&r.metadata.name).await;
    assert_eq!(r.status.state, DependencyBuildState::Complete);
    assert!(r.status.deployed(A));

    let a = h.artifact(A).await;
    assert_eq!(a.status.state, ArtifactBuildState::Complete);
    assert!(a.contaminated_by().is_empty());

    let cb = h.component("cb").await;
    assert_eq!(cb.status.state, ComponentBuildState::Complete);
    assert_eq!(cb.status.round, 1);
    assert!(cb.status.result_notified);
}

#[tokio::test]
async fn test_rebuild_recreates_dependency_build() {
    let h = Harness::new();
    h.create_component("cb", &[A]).await;
    h.settle().await;
    h.complete_discovery(A, &h.scm("acme"));
    h.settle().await;
    let db = h.dependency_builds().await.remove(0);
    h.complete_build(&db.metadata.name, &[A], "");
    deliver(&h).await;
    let old_uid = h.dependency_build(&db.metadata.name).await.metadata.uid;

    h.request_rebuild(A).await;
    h.settle().await;

    assert_eq!(h.events.events_of_type("dependency_build.deleted").len(), 1);
    let a = h.artifact(A).await;
    assert!(!a.rebuild_requested());
    assert_eq!(a.status.state, ArtifactBuildState::Discovering);
    assert_eq!(h.component("cb").await.status.state, ComponentBuildState::InProgress);

    h.complete_discovery(A, &h.scm("acme"));
    h.settle().await;
    let rebuilt = h.dependency_build(&db.metadata.name).await;
    assert_ne!(rebuilt.metadata.uid, old_uid);
    assert_eq!(h.backend.runs_for(PipelinePurpose::Build).len(), 2);

    h.complete_build(&db.metadata.name, &[A], "");
    deliver(&h).await;
    let cb = h.component("cb").await;
    assert_eq!(cb.status.state, ComponentBuildState::Complete);
    assert_eq!(cb.status.round, 1);
    assert_eq!(h.backend.runs_for(PipelinePurpose::Notify).len(), 2);
}

#[tokio::test]
async fn test_transient_store_failure_is_retried() {
    let h = Harness::new();
    let cb = h.create_component("cb", &[A]).await;

    h.store
        .fail_next(StoreOp::Create, ApheleiaError::Unavailable("etcd leader election".to_string()));
    let err = h.reconcile(&cb.key()).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(h.artifact_builds().await.is_empty());

    h.settle().await;
    assert_eq!(h.artifact_builds().await.len(), 1);
    assert_eq!(h.backend.runs_for(PipelinePurpose::Discover).len(), 1);
}

#[tokio::test]
async fn test_deleting_component_collects_its_graph() {
    let h = Harness::new();
    h.create_component("cb", &[A]).await;
    h.settle().await;
    h.complete_discovery(A, &h.scm("acme"));
    h.settle().await;
    assert_eq!(h.dependency_builds().await.len(), 1);

    let key = ObjectKey::new(Kind::ComponentBuild, TEST_NAMESPACE, "cb");
    assert!(h.store.delete_if_exists(&key).await.unwrap());

    assert!(h.artifact_builds().await.is_empty());
    assert!(h.dependency_builds().await.is_empty());
    assert_eq!(h.reconcile(&key).await.unwrap(), super::ReconcileOutcome::Done);
}
