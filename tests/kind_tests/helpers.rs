//! Shared setup for the kind tests

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use peernet::crd::PeeringSession;
use peernet::FIELD_MANAGER;

const CRD_NAME: &str = "peeringsessions.peernet.dev";

/// Connect to the current cluster and make sure the CRD is established
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no cluster reachable: {e}"))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.patch(
        CRD_NAME,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&PeeringSession::crd()),
    )
    .await
    .map_err(|e| format!("failed to install CRD: {e}"))?;

    for _ in 0..30 {
        let crd = crds
            .get(CRD_NAME)
            .await
            .map_err(|e| format!("failed to read CRD: {e}"))?;
        let established = crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True");
        if established {
            return Ok(client);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err("CRD never became established".to_string())
}

/// Remove a session regardless of the finalizers it carries
pub async fn force_delete_session(client: &Client, name: &str) {
    let api: Api<PeeringSession> = Api::all(client.clone());
    let _ = api
        .patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": null } })),
        )
        .await;
    let _ = api.delete(name, &DeleteParams::default()).await;
}
