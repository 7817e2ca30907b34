//! PeeringSession reconciler
//!
//! Each node runs its own copy of this state machine against every
//! PeeringSession. A session moves through:
//!
//! - unseen: no finalizer for this node yet; the finalizer is added first so
//!   that deletion always waits for this node's cleanup
//! - waiting: tunnel addressing (and, on the gateway, the tunnel device) is
//!   not there yet; the session is requeued
//! - programmed: chains, per-cluster rules and routes are installed and the
//!   node's processed label is set
//! - deleting: per-cluster rules and routes are removed, then the finalizer
//!
//! Kernel changes and the in-memory record of them happen under one lock,
//! so concurrent passes for different sessions never interleave.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::NodeRole;
use crate::crd::PeeringSession;
use crate::exec::{CommandRunner, HostCommandRunner};
use crate::netfilter::{FilterState, IptablesCli, PacketFilter, RuleManager};
use crate::peer::PeerAddressing;
use crate::retry::{retry_if, RetryConfig};
use crate::routes::{IpRouteCli, RouteManager, RouteState, RouteTable};
use crate::tunnel::{IpLinkCli, LinkOps, TunnelManager};
use crate::{
    finalizer_for, processed_label_for, Error, DEFAULT_VXLAN_PORT, FIELD_MANAGER,
    PROCESSED_LABEL_VALUE,
};

/// Requeue delay for sessions whose tunnel is not ready yet
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue delay after adding the node finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Writes to PeeringSession metadata
///
/// Every write carries the resource version it was computed from; a stale
/// version fails with [`Error::PersistConflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Add `finalizer` to the session
    async fn add_finalizer(&self, session: &PeeringSession, finalizer: &str) -> Result<(), Error>;

    /// Remove `finalizer` from the session. A session that is already gone is success.
    async fn remove_finalizer(&self, session: &PeeringSession, finalizer: &str)
        -> Result<(), Error>;

    /// Set the processed label `label` on the session
    async fn mark_processed(&self, session: &PeeringSession, label: &str) -> Result<(), Error>;

    /// List all sessions
    async fn list_sessions(&self) -> Result<Vec<PeeringSession>, Error>;
}

/// [`SessionClient`] backed by the Kubernetes API
pub struct SessionClientImpl {
    client: Client,
}

impl SessionClientImpl {
    /// Create a new SessionClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_metadata(
        &self,
        session: &PeeringSession,
        mut metadata: serde_json::Value,
    ) -> Result<(), Error> {
        let name = session.name_any();
        if let Some(version) = session.resource_version() {
            metadata["resourceVersion"] = json!(version);
        }
        let patch = json!({ "metadata": metadata });

        let api: Api<PeeringSession> = Api::all(self.client.clone());
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ae) if ae.code == 409 => {
                    Error::persist_conflict(format!("session {name}: {}", ae.message))
                }
                other => Error::Kube(other),
            })?;
        Ok(())
    }
}

#[async_trait]
impl SessionClient for SessionClientImpl {
    async fn add_finalizer(&self, session: &PeeringSession, finalizer: &str) -> Result<(), Error> {
        let mut finalizers = session.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_metadata(session, json!({ "finalizers": finalizers }))
            .await
    }

    async fn remove_finalizer(
        &self,
        session: &PeeringSession,
        finalizer: &str,
    ) -> Result<(), Error> {
        let finalizers: Vec<&String> = session
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .collect();
        match self
            .patch_metadata(session, json!({ "finalizers": finalizers }))
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn mark_processed(&self, session: &PeeringSession, label: &str) -> Result<(), Error> {
        let mut labels = serde_json::Map::new();
        labels.insert(label.to_string(), json!(PROCESSED_LABEL_VALUE));
        self.patch_metadata(session, json!({ "labels": labels }))
            .await
    }

    async fn list_sessions(&self) -> Result<Vec<PeeringSession>, Error> {
        let api: Api<PeeringSession> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// What this process has installed in the kernel
#[derive(Debug, Default)]
pub struct FabricState {
    /// Chains, jump rules and per-cluster rules
    pub filter: FilterState,
    /// Per-cluster routes
    pub routes: RouteState,
}

/// Step of a reconciliation pass, attached to every failure log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Parsing the session's addressing
    Addressing,
    /// Adding or removing the node finalizer
    Finalizer,
    /// Checking the tunnel device
    Readiness,
    /// Custom chains and jump rules
    Chains,
    /// Per-cluster rules
    Rules,
    /// Per-cluster routes
    Routes,
    /// Processed label
    Label,
    /// Shutdown cleanup
    Teardown,
}

impl Stage {
    /// Stage name as logged
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Addressing => "addressing",
            Stage::Finalizer => "finalizer",
            Stage::Readiness => "readiness",
            Stage::Chains => "chains",
            Stage::Rules => "rules",
            Stage::Routes => "routes",
            Stage::Label => "label",
            Stage::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller context shared by all reconciliation passes
pub struct Context {
    /// Session metadata writes (trait object for testability)
    pub client: Arc<dyn SessionClient>,
    /// Name of this node
    pub node_name: String,
    /// This node's role
    pub role: NodeRole,
    /// Packet-filter management
    pub rules: RuleManager,
    /// Route management
    pub routes: RouteManager,
    /// Tunnel device lookups
    pub tunnels: TunnelManager,
    /// Kernel state installed by this process
    pub state: Arc<Mutex<FabricState>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, node_name: impl Into<String>, role: NodeRole) -> ContextBuilder {
        ContextBuilder::new(client, node_name.into(), role)
    }

    /// Finalizer token owned by this node
    pub fn finalizer(&self) -> String {
        finalizer_for(&self.node_name)
    }

    /// Processed label key owned by this node
    pub fn processed_label(&self) -> String {
        processed_label_for(&self.node_name)
    }

    /// Create a context over in-memory backends
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn SessionClient>,
        node_name: &str,
        role: NodeRole,
        filter: Arc<dyn PacketFilter>,
        links: Arc<dyn LinkOps>,
        routes: Arc<dyn RouteTable>,
    ) -> Self {
        Self {
            client,
            node_name: node_name.to_string(),
            rules: RuleManager::new(filter, role.clone(), DEFAULT_VXLAN_PORT),
            routes: RouteManager::new(routes, role.clone()),
            tunnels: TunnelManager::new(links),
            role,
            state: Arc::new(Mutex::new(FabricState::default())),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let filter = IptablesCli::detect(runner.clone()).await?;
/// let ctx = Context::builder(client, &config.node_name, config.role()?)
///     .overlay_port(config.overlay_port)
///     .command_runner(runner)
///     .packet_filter(Arc::new(filter))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    node_name: String,
    role: NodeRole,
    overlay_port: u16,
    runner: Option<Arc<dyn CommandRunner>>,
    sessions: Option<Arc<dyn SessionClient>>,
    filter: Option<Arc<dyn PacketFilter>>,
    links: Option<Arc<dyn LinkOps>>,
    routes: Option<Arc<dyn RouteTable>>,
}

impl ContextBuilder {
    fn new(client: Client, node_name: String, role: NodeRole) -> Self {
        Self {
            client,
            node_name,
            role,
            overlay_port: DEFAULT_VXLAN_PORT,
            runner: None,
            sessions: None,
            filter: None,
            links: None,
            routes: None,
        }
    }

    /// Set the overlay UDP port accepted on the input chain
    pub fn overlay_port(mut self, port: u16) -> Self {
        self.overlay_port = port;
        self
    }

    /// Runner used by the default command-line backends
    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Override the session client
    pub fn session_client(mut self, sessions: Arc<dyn SessionClient>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Override the packet-filter backend
    pub fn packet_filter(mut self, filter: Arc<dyn PacketFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Override the link backend
    pub fn link_ops(mut self, links: Arc<dyn LinkOps>) -> Self {
        self.links = Some(links);
        self
    }

    /// Override the routing-table backend
    pub fn route_table(mut self, routes: Arc<dyn RouteTable>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(HostCommandRunner::new()));
        let filter = self
            .filter
            .unwrap_or_else(|| Arc::new(IptablesCli::new(runner.clone())));
        let links = self
            .links
            .unwrap_or_else(|| Arc::new(IpLinkCli::new(runner.clone())));
        let routes = self
            .routes
            .unwrap_or_else(|| Arc::new(IpRouteCli::new(runner)));

        Context {
            client: self
                .sessions
                .unwrap_or_else(|| Arc::new(SessionClientImpl::new(self.client.clone()))),
            node_name: self.node_name,
            rules: RuleManager::new(filter, self.role.clone(), self.overlay_port),
            routes: RouteManager::new(routes, self.role.clone()),
            tunnels: TunnelManager::new(links),
            role: self.role,
            state: Arc::new(Mutex::new(FabricState::default())),
        }
    }
}

fn at_stage(stage: Stage, cluster_id: &str, error: Error) -> Error {
    error!(cluster_id, stage = %stage, error = %error, "reconciliation step failed");
    error
}

/// Ok(false) when the write lost to a newer version of the session
fn persisted(stage: Stage, cluster_id: &str, result: Result<(), Error>) -> Result<bool, Error> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => {
            debug!(cluster_id, stage = %stage, error = %e, "write conflict, waiting for newer version");
            Ok(false)
        }
        Err(e) => Err(at_stage(stage, cluster_id, e)),
    }
}

/// Reconcile one PeeringSession on this node
#[instrument(skip(session, ctx), fields(cluster_id = %session.cluster_id(), node = %ctx.node_name))]
pub async fn reconcile(session: Arc<PeeringSession>, ctx: Arc<Context>) -> Result<Action, Error> {
    let cluster_id = session.cluster_id();
    let node = ctx.node_name.as_str();

    if session.is_deleting() {
        if !session.has_node_finalizer(node) {
            debug!("session deleting without this node's finalizer");
            return Ok(Action::await_change());
        }
        return finalize(&session, &ctx).await;
    }

    if !session.has_node_finalizer(node) {
        let result = ctx.client.add_finalizer(&session, &ctx.finalizer()).await;
        if persisted(Stage::Finalizer, cluster_id, result)? {
            info!("node finalizer added");
            return Ok(Action::requeue(FINALIZER_REQUEUE));
        }
        return Ok(Action::await_change());
    }

    let ready = is_ready(&session, &ctx)
        .await
        .map_err(|e| at_stage(Stage::Readiness, cluster_id, e))?;
    if !ready {
        debug!("tunnel not ready");
        return Ok(Action::requeue(NOT_READY_REQUEUE));
    }

    let processed = session.is_processed_by(node);
    if apply_session(&session, &ctx).await? {
        info!(processed, "session programmed");
    } else {
        debug!("session already programmed");
    }

    if !processed {
        let result = ctx
            .client
            .mark_processed(&session, &ctx.processed_label())
            .await;
        if persisted(Stage::Label, cluster_id, result)? {
            info!("session marked processed");
        }
    }

    Ok(Action::await_change())
}

/// Error policy for the controller: retry after 5 seconds.
///
/// The failure itself was already logged with its stage.
pub fn error_policy(session: Arc<PeeringSession>, error: &Error, _ctx: Arc<Context>) -> Action {
    debug!(
        %error,
        cluster_id = %session.cluster_id(),
        "requeueing failed session"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Tunnel addressing is complete and, on the gateway, the session's tunnel
/// device exists.
pub async fn is_ready(session: &PeeringSession, ctx: &Context) -> Result<bool, Error> {
    if !session.tunnel_addresses_ready() {
        return Ok(false);
    }
    if !ctx.role.is_gateway() {
        return Ok(true);
    }

    let index = session
        .status
        .as_ref()
        .and_then(|s| s.tunnel_interface_index)
        .filter(|index| *index != 0);
    let Some(index) = index else {
        return Ok(false);
    };
    Ok(ctx.tunnels.resolve_index(index).await?.is_some())
}

/// Install chains, rules and routes for a ready session.
///
/// Returns false when the recorded state already matches the session.
async fn apply_session(session: &PeeringSession, ctx: &Context) -> Result<bool, Error> {
    let cluster_id = session.cluster_id();
    let peer = PeerAddressing::from_session(session)
        .map_err(|e| at_stage(Stage::Addressing, cluster_id, e))?;

    let mut state = ctx.state.lock().await;

    let current = ctx
        .rules
        .is_current(&state.filter, &peer)
        .and_then(|rules| Ok(rules && ctx.routes.is_current(&state.routes, &peer)?))
        .map_err(|e| at_stage(Stage::Addressing, cluster_id, e))?;
    if current {
        return Ok(false);
    }

    ctx.rules
        .ensure_chains(&mut state.filter)
        .await
        .map_err(|e| at_stage(Stage::Chains, cluster_id, e))?;
    ctx.rules
        .install_cluster_rules(&mut state.filter, &peer)
        .await
        .map_err(|e| at_stage(Stage::Rules, cluster_id, e))?;
    ctx.routes
        .install_cluster_routes(&mut state.routes, &peer)
        .await
        .map_err(|e| at_stage(Stage::Routes, cluster_id, e))?;

    Ok(true)
}

async fn finalize(session: &PeeringSession, ctx: &Context) -> Result<Action, Error> {
    let cluster_id = session.cluster_id();

    {
        let mut state = ctx.state.lock().await;

        let recorded = state.filter.has_cluster(cluster_id) || state.routes.has_cluster(cluster_id);
        if !recorded && session.is_processed_by(&ctx.node_name) {
            purge_unrecorded(session, ctx).await?;
        }

        ctx.rules
            .delete_cluster_rules(&mut state.filter, cluster_id)
            .await
            .map_err(|e| at_stage(Stage::Rules, cluster_id, e))?;
        ctx.routes
            .delete_cluster_routes(&mut state.routes, cluster_id)
            .await
            .map_err(|e| at_stage(Stage::Routes, cluster_id, e))?;
    }

    let result = ctx.client.remove_finalizer(session, &ctx.finalizer()).await;
    if persisted(Stage::Finalizer, cluster_id, result)? {
        info!("node finalizer removed");
    }
    Ok(Action::await_change())
}

/// Remove what a previous run of this process installed for the session.
///
/// A session whose addressing no longer parses has nothing derivable to
/// purge. Any other failure keeps the finalizer in place.
async fn purge_unrecorded(session: &PeeringSession, ctx: &Context) -> Result<(), Error> {
    let cluster_id = session.cluster_id();
    let peer = match PeerAddressing::from_session(session) {
        Ok(peer) => peer,
        Err(e) => {
            warn!(cluster_id, error = %e, "cannot derive session state, nothing to purge");
            return Ok(());
        }
    };

    ctx.rules
        .purge_cluster_rules(&peer)
        .await
        .map_err(|e| at_stage(Stage::Rules, cluster_id, e))?;
    ctx.routes
        .purge_cluster_routes(&peer)
        .await
        .map_err(|e| at_stage(Stage::Routes, cluster_id, e))?;
    Ok(())
}

/// Re-program every session this node had already processed.
///
/// Runs once at startup, before the controller loop, so that a restarted
/// process rebuilds its record of the kernel state. Returns the number of
/// sessions programmed.
pub async fn resync_sessions(ctx: &Context, retry: &RetryConfig) -> Result<usize, Error> {
    let client = ctx.client.clone();
    let sessions = retry_if(retry, "list_sessions", Error::is_retryable, move || {
        let client = client.clone();
        async move { client.list_sessions().await }
    })
    .await?;

    let node = ctx.node_name.as_str();
    let mut programmed = 0;
    for session in sessions.iter().filter(|s| {
        !s.is_deleting() && s.has_node_finalizer(node) && s.is_processed_by(node)
    }) {
        let cluster_id = session.cluster_id();
        match is_ready(session, ctx).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(cluster_id, "session not ready, left to the controller");
                continue;
            }
            Err(e) => {
                warn!(cluster_id, error = %e, "readiness check failed during resync");
                continue;
            }
        }
        match apply_session(session, ctx).await {
            Ok(_) => programmed += 1,
            Err(e) => warn!(cluster_id, error = %e, "resync failed, left to the controller"),
        }
    }

    info!(sessions = sessions.len(), programmed, "startup resync complete");
    Ok(programmed)
}
