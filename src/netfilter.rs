//! Packet-filter rule management
//!
//! The controller keeps its rules in four custom chains, each hooked into
//! its standard parent by one jump rule:
//!
//! | table  | custom chain          | parent      |
//! |--------|-----------------------|-------------|
//! | nat    | `PEERNET-POSTROUTING` | POSTROUTING |
//! | nat    | `PEERNET-PREROUTING`  | PREROUTING  |
//! | filter | `PEERNET-FORWARD`     | FORWARD     |
//! | filter | `PEERNET-INPUT`       | INPUT       |
//!
//! Per-cluster rules are recorded in [`FilterState`] only after the kernel
//! accepted them, so deletion removes exactly what this process installed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::NodeRole;
use crate::exec::{args, CommandOutput, CommandRunner};
use crate::peer::PeerAddressing;
use crate::remap::netmap_target;
use crate::Error;

/// NAT table
pub const NAT_TABLE: &str = "nat";
/// Filter table
pub const FILTER_TABLE: &str = "filter";

/// Custom post-routing chain (nat)
pub const POSTROUTING_CHAIN: &str = "PEERNET-POSTROUTING";
/// Custom pre-routing chain (nat)
pub const PREROUTING_CHAIN: &str = "PEERNET-PREROUTING";
/// Custom forward chain (filter)
pub const FORWARD_CHAIN: &str = "PEERNET-FORWARD";
/// Custom input chain (filter)
pub const INPUT_CHAIN: &str = "PEERNET-INPUT";

/// A single rule: table, chain and the match/target arguments
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rule {
    /// Table the rule lives in
    pub table: String,
    /// Chain the rule lives in
    pub chain: String,
    /// Match and target arguments, e.g. `["-d", "10.1.0.0/16", "-j", "ACCEPT"]`
    pub spec: Vec<String>,
}

impl Rule {
    /// Build a rule from string parts
    pub fn new<I, S>(table: &str, chain: &str, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            spec: args(spec),
        }
    }

    /// Rule arguments joined with spaces
    pub fn spec_text(&self) -> String {
        self.spec.join(" ")
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", self.table, self.chain, self.spec_text())
    }
}

/// Where a new rule goes in its chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// First position
    Insert,
    /// Last position
    Append,
}

/// A rule together with where it must be placed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedRule {
    /// The rule
    pub rule: Rule,
    /// Placement within the chain
    pub placement: Placement,
}

impl PlannedRule {
    fn append(rule: Rule) -> Self {
        Self {
            rule,
            placement: Placement::Append,
        }
    }

    fn insert(rule: Rule) -> Self {
        Self {
            rule,
            placement: Placement::Insert,
        }
    }
}

/// A custom chain created by this controller
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstalledChain {
    /// Table
    pub table: String,
    /// Chain name
    pub name: String,
}

/// Custom chain together with the jump rule hooking it into its parent
#[derive(Clone, Debug)]
pub struct ChainHook {
    /// The custom chain
    pub chain: InstalledChain,
    /// Jump rule in the standard parent chain
    pub jump: Rule,
}

/// The four custom chains and their jump rules.
///
/// Only UDP is diverted into the custom input chain.
pub fn chain_hooks() -> Vec<ChainHook> {
    vec![
        hook(NAT_TABLE, "POSTROUTING", POSTROUTING_CHAIN, &[]),
        hook(NAT_TABLE, "PREROUTING", PREROUTING_CHAIN, &[]),
        hook(FILTER_TABLE, "FORWARD", FORWARD_CHAIN, &[]),
        hook(FILTER_TABLE, "INPUT", INPUT_CHAIN, &["-p", "udp", "-m", "udp"]),
    ]
}

fn hook(table: &str, parent: &str, chain: &str, matches: &[&str]) -> ChainHook {
    let mut spec: Vec<&str> = matches.to_vec();
    spec.extend(["-j", chain]);
    ChainHook {
        chain: InstalledChain {
            table: table.to_string(),
            name: chain.to_string(),
        },
        jump: Rule::new(table, parent, spec),
    }
}

/// Static accept for the overlay's UDP data port
pub fn overlay_accept_rule(port: u16) -> Rule {
    Rule::new(
        FILTER_TABLE,
        INPUT_CHAIN,
        [
            "-p",
            "udp",
            "-m",
            "udp",
            "--dport",
            port.to_string().as_str(),
            "-j",
            "ACCEPT",
        ],
    )
}

/// Rules one remote cluster needs on this node, in installation order.
///
/// Every node accepts traffic between the local and remote pod ranges. The
/// gateway also masquerades overlay-originated traffic and, when the local
/// range is remapped, translates it in both directions on the tunnel.
pub fn cluster_rules(role: &NodeRole, peer: &PeerAddressing) -> Result<Vec<PlannedRule>, Error> {
    let local_cidr = peer.local_pod_cidr.to_string();
    let remote_cidr = peer.remote_pod_cidr.to_string();
    let (local, remote) = (local_cidr.as_str(), remote_cidr.as_str());

    let mut rules = vec![
        PlannedRule::append(Rule::new(
            NAT_TABLE,
            POSTROUTING_CHAIN,
            ["-s", local, "-d", remote, "-j", "ACCEPT"],
        )),
        PlannedRule::append(Rule::new(
            FILTER_TABLE,
            FORWARD_CHAIN,
            ["-d", remote, "-j", "ACCEPT"],
        )),
        PlannedRule::append(Rule::new(
            FILTER_TABLE,
            INPUT_CHAIN,
            ["-s", local, "-d", remote, "-j", "ACCEPT"],
        )),
    ];

    let NodeRole::Gateway { overlay_network } = role else {
        return Ok(rules);
    };

    let overlay_cidr = overlay_network.to_string();
    let overlay = overlay_cidr.as_str();
    rules.push(PlannedRule::append(Rule::new(
        NAT_TABLE,
        POSTROUTING_CHAIN,
        ["-s", overlay, "-d", remote, "-j", "MASQUERADE"],
    )));

    if let Some(remapped) = peer.local_remapped_pod_cidr {
        let iface = peer.tunnel_interface.as_deref().ok_or_else(|| {
            Error::validation(format!(
                "session {} is remapped but has no tunnel interface",
                peer.cluster_id
            ))
        })?;
        let outbound = netmap_target(&remapped.to_string(), local)?.to_string();

        // NETMAP must precede the ACCEPT for the same traffic
        rules.push(PlannedRule::insert(Rule::new(
            NAT_TABLE,
            POSTROUTING_CHAIN,
            ["-s", local, "-d", remote, "-j", "NETMAP", "--to", outbound.as_str()],
        )));
        rules.push(PlannedRule::append(Rule::new(
            NAT_TABLE,
            PREROUTING_CHAIN,
            [
                "-d",
                outbound.as_str(),
                "-i",
                iface,
                "-j",
                "NETMAP",
                "--to",
                local,
            ],
        )));
    }

    Ok(rules)
}

/// Kernel packet-filter operations
///
/// Chain creation treats "already exists" as success. Delete, flush and
/// chain removal report missing targets as not-found [`Error::Rule`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Create a chain
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error>;

    /// Check whether a rule is present
    async fn exists(&self, rule: &Rule) -> Result<bool, Error>;

    /// Insert a rule at the head of its chain
    async fn insert(&self, rule: &Rule) -> Result<(), Error>;

    /// Append a rule to its chain
    async fn append(&self, rule: &Rule) -> Result<(), Error>;

    /// Delete a rule
    async fn delete(&self, rule: &Rule) -> Result<(), Error>;

    /// Remove every rule in a chain
    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error>;

    /// Delete an empty, unreferenced chain
    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error>;
}

/// In-memory record of what this process installed
#[derive(Debug, Default)]
pub struct FilterState {
    chains: BTreeMap<String, InstalledChain>,
    jump_rules: BTreeMap<String, Rule>,
    overlay_accept: Option<Rule>,
    cluster_rules: HashMap<String, Vec<Rule>>,
}

impl FilterState {
    /// Custom chains created so far
    pub fn chains(&self) -> impl Iterator<Item = &InstalledChain> {
        self.chains.values()
    }

    /// Jump rules installed so far
    pub fn jump_rules(&self) -> impl Iterator<Item = &Rule> {
        self.jump_rules.values()
    }

    /// Rules recorded for a cluster, in installation order
    pub fn cluster_rules(&self, cluster_id: &str) -> Option<&[Rule]> {
        self.cluster_rules.get(cluster_id).map(Vec::as_slice)
    }

    /// A cluster has recorded rules
    pub fn has_cluster(&self, cluster_id: &str) -> bool {
        self.cluster_rules.contains_key(cluster_id)
    }

    /// Number of clusters with recorded rules
    pub fn cluster_count(&self) -> usize {
        self.cluster_rules.len()
    }

    fn is_initialized(&self) -> bool {
        self.chains.len() == chain_hooks().len()
            && self.jump_rules.len() == chain_hooks().len()
            && self.overlay_accept.is_some()
    }
}

fn keep_first(first: &mut Option<Error>, err: Error) {
    if first.is_none() {
        *first = Some(err);
    }
}

/// Packet-filter lifecycle on top of [`PacketFilter`]
#[derive(Clone)]
pub struct RuleManager {
    filter: Arc<dyn PacketFilter>,
    role: NodeRole,
    overlay_port: u16,
}

impl RuleManager {
    /// Create a manager for the given node role and overlay port
    pub fn new(filter: Arc<dyn PacketFilter>, role: NodeRole, overlay_port: u16) -> Self {
        Self {
            filter,
            role,
            overlay_port,
        }
    }

    /// Ensure the custom chains, their jump rules and the overlay accept rule.
    ///
    /// Anything already present in the kernel is adopted, not duplicated.
    pub async fn ensure_chains(&self, state: &mut FilterState) -> Result<(), Error> {
        if state.is_initialized() {
            return Ok(());
        }

        for hook in chain_hooks() {
            if !state.chains.contains_key(&hook.chain.name) {
                self.filter
                    .new_chain(&hook.chain.table, &hook.chain.name)
                    .await?;
                debug!(table = %hook.chain.table, chain = %hook.chain.name, "custom chain ready");
                state.chains.insert(hook.chain.name.clone(), hook.chain);
            }
        }

        for hook in chain_hooks() {
            let key = hook.jump.to_string();
            if !state.jump_rules.contains_key(&key) {
                self.ensure_rule(&hook.jump, Placement::Insert).await?;
                debug!(rule = %key, "jump rule ready");
                state.jump_rules.insert(key, hook.jump);
            }
        }

        if state.overlay_accept.is_none() {
            let rule = overlay_accept_rule(self.overlay_port);
            self.ensure_rule(&rule, Placement::Append).await?;
            state.overlay_accept = Some(rule);
        }

        info!("custom chains and jump rules installed");
        Ok(())
    }

    /// Install the rules for one remote cluster and record them.
    ///
    /// Recorded rules that are no longer wanted (the session's ranges
    /// changed) are removed afterwards.
    pub async fn install_cluster_rules(
        &self,
        state: &mut FilterState,
        peer: &PeerAddressing,
    ) -> Result<(), Error> {
        let planned = cluster_rules(&self.role, peer)?;

        for planned_rule in &planned {
            self.ensure_rule(&planned_rule.rule, planned_rule.placement)
                .await?;

            let recorded = state
                .cluster_rules
                .entry(peer.cluster_id.clone())
                .or_default();
            if !recorded.contains(&planned_rule.rule) {
                debug!(cluster_id = %peer.cluster_id, rule = %planned_rule.rule, "rule installed");
                recorded.push(planned_rule.rule.clone());
            }
        }

        let stale: Vec<Rule> = state
            .cluster_rules
            .get(&peer.cluster_id)
            .map(|recorded| {
                recorded
                    .iter()
                    .filter(|r| !planned.iter().any(|p| p.rule == **r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for rule in stale {
            match self.filter.delete(&rule).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if let Some(recorded) = state.cluster_rules.get_mut(&peer.cluster_id) {
                recorded.retain(|r| *r != rule);
            }
            debug!(cluster_id = %peer.cluster_id, rule = %rule, "stale rule removed");
        }

        info!(
            cluster_id = %peer.cluster_id,
            rules = state.cluster_rules.get(&peer.cluster_id).map_or(0, Vec::len),
            "cluster rules installed"
        );
        Ok(())
    }

    /// The recorded rules for this cluster are exactly the wanted ones
    pub fn is_current(&self, state: &FilterState, peer: &PeerAddressing) -> Result<bool, Error> {
        let planned = cluster_rules(&self.role, peer)?;
        Ok(match state.cluster_rules(&peer.cluster_id) {
            Some(recorded) => {
                recorded.len() == planned.len()
                    && planned.iter().all(|p| recorded.contains(&p.rule))
            }
            None => false,
        })
    }

    /// Delete the rules this cluster would need, without consulting the record.
    ///
    /// Used when a session is deleted after a restart, before anything was
    /// recorded for it.
    pub async fn purge_cluster_rules(&self, peer: &PeerAddressing) -> Result<(), Error> {
        for planned in cluster_rules(&self.role, peer)? {
            match self.filter.delete(&planned.rule).await {
                Ok(()) => debug!(cluster_id = %peer.cluster_id, rule = %planned.rule, "rule purged"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete every rule recorded for a cluster.
    ///
    /// Missing rules count as deleted. The record is dropped even when some
    /// deletion failed; the first such failure is returned.
    pub async fn delete_cluster_rules(
        &self,
        state: &mut FilterState,
        cluster_id: &str,
    ) -> Result<(), Error> {
        let Some(rules) = state.cluster_rules.get(cluster_id).cloned() else {
            debug!(cluster_id, "no rules recorded");
            return Ok(());
        };

        let mut first_error = None;
        for rule in &rules {
            match self.filter.delete(rule).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(cluster_id, rule = %rule, "rule already absent");
                }
                Err(e) => {
                    warn!(cluster_id, rule = %rule, error = %e, "failed to delete rule");
                    keep_first(&mut first_error, e);
                }
            }
        }
        state.cluster_rules.remove(cluster_id);

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(cluster_id, rules = rules.len(), "cluster rules deleted");
                Ok(())
            }
        }
    }

    /// Remove everything this controller added to the packet filter.
    ///
    /// Chains are flushed, then unhooked from their parents, then deleted;
    /// a chain cannot be deleted while a jump rule still references it.
    pub async fn teardown_all(&self, state: &mut FilterState) -> Result<(), Error> {
        let hooks = chain_hooks();
        let mut first_error = None;

        for hook in &hooks {
            if let Err(e) = self
                .filter
                .flush_chain(&hook.chain.table, &hook.chain.name)
                .await
            {
                if !e.is_not_found() {
                    warn!(chain = %hook.chain.name, error = %e, "failed to flush chain");
                    keep_first(&mut first_error, e);
                }
            }
        }

        let mut jumps: BTreeMap<String, Rule> = std::mem::take(&mut state.jump_rules);
        for hook in &hooks {
            jumps.entry(hook.jump.to_string()).or_insert_with(|| hook.jump.clone());
        }
        for rule in jumps.values() {
            if let Err(e) = self.filter.delete(rule).await {
                if !e.is_not_found() {
                    warn!(rule = %rule, error = %e, "failed to delete jump rule");
                    keep_first(&mut first_error, e);
                }
            }
        }

        for hook in &hooks {
            if let Err(e) = self
                .filter
                .delete_chain(&hook.chain.table, &hook.chain.name)
                .await
            {
                if !e.is_not_found() {
                    warn!(chain = %hook.chain.name, error = %e, "failed to delete chain");
                    keep_first(&mut first_error, e);
                }
            }
        }

        state.chains.clear();
        state.overlay_accept = None;
        state.cluster_rules.clear();

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("packet-filter state removed");
                Ok(())
            }
        }
    }

    async fn ensure_rule(&self, rule: &Rule, placement: Placement) -> Result<(), Error> {
        if self.filter.exists(rule).await? {
            return Ok(());
        }
        match placement {
            Placement::Insert => self.filter.insert(rule).await,
            Placement::Append => self.filter.append(rule).await,
        }
    }
}

// =============================================================================
// iptables backend
// =============================================================================

fn is_missing_rule(out: &CommandOutput) -> bool {
    out.stderr.contains("No chain/target/match by that name")
        || out.stderr.contains("does a matching rule exist")
        || out.stderr.contains("Bad rule")
        || out.stderr.contains("does not exist")
}

/// [`PacketFilter`] backed by the `iptables` tool
pub struct IptablesCli {
    runner: Arc<dyn CommandRunner>,
}

impl IptablesCli {
    /// Create a backend without checking that iptables works
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Create a backend after checking that iptables is usable.
    ///
    /// Failure here means the host lacks packet-filter support.
    pub async fn detect(runner: Arc<dyn CommandRunner>) -> Result<Self, Error> {
        let out = runner.run("iptables", &args(["--version"])).await?;
        if !out.success {
            return Err(Error::command("iptables", out.error_text()));
        }
        info!(version = %out.stdout.trim(), "packet filter available");
        Ok(Self::new(runner))
    }

    async fn iptables(&self, table: &str, op: &str, chain: &str, extra: &[String]) -> Result<CommandOutput, Error> {
        let mut argv = args(["-w", "-t", table, op, chain]);
        argv.extend_from_slice(extra);
        self.runner.run("iptables", &argv).await
    }

    fn failure(table: &str, chain: &str, out: &CommandOutput) -> Error {
        if is_missing_rule(out) {
            Error::rule_not_found(table, chain, out.error_text())
        } else {
            Error::rule(table, chain, out.error_text())
        }
    }
}

#[async_trait]
impl PacketFilter for IptablesCli {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        let out = self.iptables(table, "-N", chain, &[]).await?;
        if out.success || out.stderr.contains("Chain already exists") {
            return Ok(());
        }
        Err(Error::rule(table, chain, out.error_text()))
    }

    async fn exists(&self, rule: &Rule) -> Result<bool, Error> {
        let out = self.iptables(&rule.table, "-C", &rule.chain, &rule.spec).await?;
        if out.success {
            return Ok(true);
        }
        if is_missing_rule(&out) {
            return Ok(false);
        }
        Err(Error::rule(&rule.table, &rule.chain, out.error_text()))
    }

    async fn insert(&self, rule: &Rule) -> Result<(), Error> {
        let mut extra = vec!["1".to_string()];
        extra.extend(rule.spec.iter().cloned());
        let out = self.iptables(&rule.table, "-I", &rule.chain, &extra).await?;
        if !out.success {
            return Err(Error::rule(&rule.table, &rule.chain, out.error_text()));
        }
        Ok(())
    }

    async fn append(&self, rule: &Rule) -> Result<(), Error> {
        let out = self.iptables(&rule.table, "-A", &rule.chain, &rule.spec).await?;
        if !out.success {
            return Err(Error::rule(&rule.table, &rule.chain, out.error_text()));
        }
        Ok(())
    }

    async fn delete(&self, rule: &Rule) -> Result<(), Error> {
        let out = self.iptables(&rule.table, "-D", &rule.chain, &rule.spec).await?;
        if !out.success {
            return Err(Self::failure(&rule.table, &rule.chain, &out));
        }
        Ok(())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        let out = self.iptables(table, "-F", chain, &[]).await?;
        if !out.success {
            return Err(Self::failure(table, chain, &out));
        }
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        let out = self.iptables(table, "-X", chain, &[]).await?;
        if !out.success {
            return Err(Self::failure(table, chain, &out));
        }
        Ok(())
    }
}
