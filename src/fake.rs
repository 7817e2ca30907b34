//! In-memory kernel backends for tests
//!
//! Each fake models the relevant kernel state (links, chains, routes) so
//! tests can assert on what ends up installed rather than on call sequences.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::netfilter::{PacketFilter, Rule, FILTER_TABLE, NAT_TABLE};
use crate::routes::{Route, RouteTable};
use crate::tunnel::{LinkInfo, LinkKind, LinkOps, TunnelAttrs};
use crate::Error;

// =============================================================================
// Links
// =============================================================================

#[derive(Default)]
pub struct FakeLinks {
    links: Mutex<BTreeMap<String, LinkInfo>>,
    addresses: Mutex<BTreeMap<String, BTreeSet<Ipv4Net>>>,
    up: Mutex<BTreeSet<String>>,
    flood: Mutex<BTreeMap<String, BTreeSet<Ipv4Addr>>>,
    next_index: AtomicU32,
    created: AtomicUsize,
}

impl FakeLinks {
    pub fn new() -> Self {
        Self {
            next_index: AtomicU32::new(10),
            ..Default::default()
        }
    }

    pub fn insert_other(&self, name: &str, kind: &str) -> u32 {
        self.insert_link(name, LinkKind::Other(kind.to_string()))
    }

    pub fn insert_link(&self, name: &str, kind: LinkKind) -> u32 {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.links.lock().unwrap().insert(
            name.to_string(),
            LinkInfo {
                name: name.to_string(),
                index,
                kind,
            },
        );
        index
    }

    pub fn link(&self, name: &str) -> Option<LinkInfo> {
        self.links.lock().unwrap().get(name).cloned()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn addresses(&self, name: &str) -> Vec<Ipv4Net> {
        self.addresses
            .lock()
            .unwrap()
            .get(name)
            .map(|a| a.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.up.lock().unwrap().contains(name)
    }

    pub fn flood_peers(&self, name: &str) -> Vec<Ipv4Addr> {
        self.flood
            .lock()
            .unwrap()
            .get(name)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    fn require(&self, name: &str) -> Result<(), Error> {
        if self.links.lock().unwrap().contains_key(name) {
            Ok(())
        } else {
            Err(Error::device_not_found(name))
        }
    }
}

#[async_trait]
impl LinkOps for FakeLinks {
    async fn get_link(&self, name: &str) -> Result<Option<LinkInfo>, Error> {
        Ok(self.link(name))
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, Error> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .values()
            .find(|l| l.index == index)
            .cloned())
    }

    async fn add_link(&self, attrs: &TunnelAttrs) -> Result<(), Error> {
        let mut links = self.links.lock().unwrap();
        if links.contains_key(&attrs.name) {
            return Err(Error::device(&attrs.name, "RTNETLINK answers: File exists"));
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        links.insert(
            attrs.name.clone(),
            LinkInfo {
                name: attrs.name.clone(),
                index,
                kind: LinkKind::Tunnel(attrs.kind.clone()),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), Error> {
        if self.links.lock().unwrap().remove(name).is_none() {
            return Err(Error::device_not_found(name));
        }
        self.addresses.lock().unwrap().remove(name);
        self.up.lock().unwrap().remove(name);
        self.flood.lock().unwrap().remove(name);
        Ok(())
    }

    async fn add_address(&self, name: &str, addr: Ipv4Net) -> Result<(), Error> {
        self.require(name)?;
        self.addresses
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(addr);
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<(), Error> {
        self.require(name)?;
        self.up.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn append_flood_entry(&self, name: &str, dst: Ipv4Addr) -> Result<(), Error> {
        self.require(name)?;
        self.flood
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(dst);
        Ok(())
    }
}

// =============================================================================
// Packet filter
// =============================================================================

const BUILTIN_CHAINS: [(&str, &str); 4] = [
    (NAT_TABLE, "POSTROUTING"),
    (NAT_TABLE, "PREROUTING"),
    (FILTER_TABLE, "FORWARD"),
    (FILTER_TABLE, "INPUT"),
];

type ChainKey = (String, String);

pub struct FakeFilter {
    chains: Mutex<BTreeMap<ChainKey, Vec<Vec<String>>>>,
    failing: Mutex<Vec<String>>,
}

impl FakeFilter {
    pub fn new() -> Self {
        let chains = BUILTIN_CHAINS
            .iter()
            .map(|(t, c)| ((t.to_string(), c.to_string()), Vec::new()))
            .collect();
        Self {
            chains: Mutex::new(chains),
            failing: Mutex::new(Vec::new()),
        }
    }

    /// Make every rule write whose text contains `needle` fail
    pub fn fail_matching(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.chains
            .lock()
            .unwrap()
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    pub fn count(&self, rule: &Rule) -> usize {
        self.chains
            .lock()
            .unwrap()
            .get(&key(&rule.table, &rule.chain))
            .map(|rules| rules.iter().filter(|r| **r == rule.spec).count())
            .unwrap_or(0)
    }

    pub fn rule_texts(&self, table: &str, chain: &str) -> Vec<String> {
        self.chains
            .lock()
            .unwrap()
            .get(&key(table, chain))
            .map(|rules| rules.iter().map(|r| r.join(" ")).collect())
            .unwrap_or_default()
    }

    pub fn all_rules(&self) -> Vec<Rule> {
        self.chains
            .lock()
            .unwrap()
            .iter()
            .flat_map(|((table, chain), rules)| {
                rules.iter().map(move |spec| Rule {
                    table: table.clone(),
                    chain: chain.clone(),
                    spec: spec.clone(),
                })
            })
            .collect()
    }

    fn check_failure(&self, rule: &Rule) -> Result<(), Error> {
        let text = rule.spec_text();
        if self.failing.lock().unwrap().iter().any(|n| text.contains(n)) {
            return Err(Error::rule(&rule.table, &rule.chain, "Permission denied"));
        }
        Ok(())
    }

    fn write(&self, rule: &Rule, at_head: bool) -> Result<(), Error> {
        self.check_failure(rule)?;
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.get_mut(&key(&rule.table, &rule.chain)).ok_or_else(|| {
            Error::rule_not_found(&rule.table, &rule.chain, "No chain/target/match by that name")
        })?;
        if at_head {
            rules.insert(0, rule.spec.clone());
        } else {
            rules.push(rule.spec.clone());
        }
        Ok(())
    }
}

fn key(table: &str, chain: &str) -> ChainKey {
    (table.to_string(), chain.to_string())
}

#[async_trait]
impl PacketFilter for FakeFilter {
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        self.chains
            .lock()
            .unwrap()
            .entry(key(table, chain))
            .or_default();
        Ok(())
    }

    async fn exists(&self, rule: &Rule) -> Result<bool, Error> {
        Ok(self.count(rule) > 0)
    }

    async fn insert(&self, rule: &Rule) -> Result<(), Error> {
        self.write(rule, true)
    }

    async fn append(&self, rule: &Rule) -> Result<(), Error> {
        self.write(rule, false)
    }

    async fn delete(&self, rule: &Rule) -> Result<(), Error> {
        self.check_failure(rule)?;
        let mut chains = self.chains.lock().unwrap();
        let missing = || Error::rule_not_found(&rule.table, &rule.chain, "Bad rule");
        let rules = chains
            .get_mut(&key(&rule.table, &rule.chain))
            .ok_or_else(missing)?;
        let pos = rules.iter().position(|r| *r == rule.spec).ok_or_else(missing)?;
        rules.remove(pos);
        Ok(())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.get_mut(&key(table, chain)).ok_or_else(|| {
            Error::rule_not_found(table, chain, "No chain/target/match by that name")
        })?;
        rules.clear();
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        let mut chains = self.chains.lock().unwrap();
        let referenced = chains.iter().any(|((t, _), rules)| {
            t == table && rules.iter().any(|r| r.last().is_some_and(|target| target == chain))
        });
        if referenced {
            return Err(Error::rule(table, chain, "Too many links"));
        }
        match chains.get(&key(table, chain)) {
            None => Err(Error::rule_not_found(table, chain, "No chain/target/match by that name")),
            Some(rules) if !rules.is_empty() => {
                Err(Error::rule(table, chain, "Directory not empty"))
            }
            Some(_) => {
                chains.remove(&key(table, chain));
                Ok(())
            }
        }
    }
}

// =============================================================================
// Routes
// =============================================================================

#[derive(Default)]
pub struct FakeRoutes {
    routes: Mutex<BTreeMap<String, Route>>,
}

impl FakeRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap().values().cloned().collect()
    }

    /// Drop every route, as the kernel does when the device goes away
    pub fn clear(&self) {
        self.routes.lock().unwrap().clear();
    }
}

#[async_trait]
impl RouteTable for FakeRoutes {
    async fn replace(&self, route: &Route) -> Result<(), Error> {
        self.routes
            .lock()
            .unwrap()
            .insert(route.dst.to_string(), route.clone());
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<(), Error> {
        let mut routes = self.routes.lock().unwrap();
        match routes.get(&route.dst.to_string()) {
            Some(existing) if existing.dev == route.dev && existing.gateway == route.gateway => {
                routes.remove(&route.dst.to_string());
                Ok(())
            }
            _ => Err(Error::route_not_found(route.to_string())),
        }
    }
}
