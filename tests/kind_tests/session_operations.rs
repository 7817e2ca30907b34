//! Integration tests for PeeringSession metadata writes
//!
//! Each story follows one session through the writes a node's controller
//! makes: its finalizer, its processed label, and the finalizer release
//! after cleanup.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};

use peernet::controller::{SessionClient, SessionClientImpl};
use peernet::crd::{PeeringSession, PeeringSessionSpec};
use peernet::{finalizer_for, processed_label_for};

use super::helpers::{ensure_test_cluster, force_delete_session};

const NODE: &str = "kind-worker";

fn sample_session(name: &str) -> PeeringSession {
    PeeringSession {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: PeeringSessionSpec {
            cluster_id: name.to_string(),
            local_pod_cidr: "10.244.0.0/16".to_string(),
            remote_pod_cidr: "10.1.0.0/16".to_string(),
        },
        status: None,
    }
}

/// Story: a node claims a new session and marks it processed
///
/// Expected behavior:
/// - The node's finalizer is persisted alongside any existing ones
/// - The processed label is persisted with value "ready"
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_node_claims_and_processes_session() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<PeeringSession> = Api::all(client.clone());
    let sessions = SessionClientImpl::new(client.clone());
    let name = "test-claim-session";
    force_delete_session(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_session(name))
        .await
        .expect("failed to create session");

    sessions
        .add_finalizer(&created, &finalizer_for(NODE))
        .await
        .expect("failed to add finalizer");
    let claimed = api.get(name).await.expect("failed to get session");
    assert!(claimed.has_node_finalizer(NODE));

    sessions
        .mark_processed(&claimed, &processed_label_for(NODE))
        .await
        .expect("failed to label session");
    let processed = api.get(name).await.expect("failed to get session");
    assert!(processed.is_processed_by(NODE));
    assert!(processed.has_node_finalizer(NODE));

    force_delete_session(&client, name).await;
}

/// Story: two writers race on the same session
///
/// The controller computed its write from an older version of the session;
/// the API server rejects it and the client reports a conflict rather than
/// a hard failure.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_stale_write_is_a_conflict() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<PeeringSession> = Api::all(client.clone());
    let sessions = SessionClientImpl::new(client.clone());
    let name = "test-stale-session";
    force_delete_session(&client, name).await;

    let stale = api
        .create(&PostParams::default(), &sample_session(name))
        .await
        .expect("failed to create session");
    sessions
        .add_finalizer(&stale, &finalizer_for(NODE))
        .await
        .expect("failed to add finalizer");

    let err = sessions
        .mark_processed(&stale, &processed_label_for(NODE))
        .await
        .expect_err("stale write must be rejected");
    assert!(err.is_conflict());

    force_delete_session(&client, name).await;
}

/// Story: a deleted session waits for the node, then goes away
///
/// Expected behavior:
/// - Deletion leaves the session in place while the node's finalizer is set
/// - Releasing the finalizer lets the API server remove it
/// - Releasing again after removal is not an error
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deletion_waits_for_node_finalizer() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<PeeringSession> = Api::all(client.clone());
    let sessions = SessionClientImpl::new(client.clone());
    let name = "test-delete-session";
    force_delete_session(&client, name).await;

    let created = api
        .create(&PostParams::default(), &sample_session(name))
        .await
        .expect("failed to create session");
    sessions
        .add_finalizer(&created, &finalizer_for(NODE))
        .await
        .expect("failed to add finalizer");

    api.delete(name, &DeleteParams::default())
        .await
        .expect("failed to request deletion");
    let deleting = api.get(name).await.expect("session should still exist");
    assert!(deleting.is_deleting());

    sessions
        .remove_finalizer(&deleting, &finalizer_for(NODE))
        .await
        .expect("failed to remove finalizer");
    assert!(api.get_opt(name).await.expect("failed to query").is_none());

    sessions
        .remove_finalizer(&deleting, &finalizer_for(NODE))
        .await
        .expect("removing from a gone session should succeed");

    force_delete_session(&client, name).await;
}
