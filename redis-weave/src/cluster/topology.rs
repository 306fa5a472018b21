//! Slot table snapshots and the parsers that build them

use crate::mux::Mux;
use rand::Rng;
use redis_weave_core::{
    command::{CLUSTER_SLOTS, INIT_SLOT},
    config::ReplicaSelector,
    error::{join_host_port, split_host_port},
    message::Message,
    types::{NodeInfo, SlotRange},
};
use std::collections::HashMap;
use std::sync::Arc;

/// One shard: `nodes[0]` is the primary, the rest are replicas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Shard {
    pub nodes: Vec<String>,
    pub slots: Vec<SlotRange>,
}

fn endpoint(fallback: &str, host: &str, port: i64) -> Option<String> {
    let port = u16::try_from(port).ok()?;
    match host {
        "?" => None,
        "" => split_host_port(fallback).map(|(h, _)| join_host_port(h, port)),
        _ => Some(join_host_port(host, port)),
    }
}

fn slot_range(start: i64, end: i64) -> Option<SlotRange> {
    let start = u16::try_from(start).ok()?;
    let end = u16::try_from(end).ok()?;
    (start <= end && end < CLUSTER_SLOTS).then(|| SlotRange::new(start, end))
}

/// Parse a `CLUSTER SLOTS` reply, keyed by primary address
///
/// Each entry is `[start, end, [host, port, id?, ...], replicas...]`. A node
/// that does not know its own address reports an empty host and is reached
/// at `queried`'s host instead.
pub(crate) fn parse_slots(reply: &Message, queried: &str) -> HashMap<String, Shard> {
    let mut shards: HashMap<String, Shard> = HashMap::new();
    for entry in reply.children() {
        let fields = entry.children();
        if fields.len() < 3 {
            continue;
        }
        let node_at = |i: usize| {
            let node = fields[i].children();
            let host = node.first().map(Message::to_string_lossy).unwrap_or_default();
            let port = node.get(1).and_then(|p| p.as_i64().ok()).unwrap_or(-1);
            endpoint(queried, &host, port)
        };
        let Some(primary) = node_at(2) else {
            continue;
        };
        let (Ok(start), Ok(end)) = (fields[0].as_i64(), fields[1].as_i64()) else {
            continue;
        };
        let shard = shards.entry(primary).or_insert_with(|| Shard {
            nodes: (2..fields.len()).filter_map(node_at).collect(),
            slots: Vec::new(),
        });
        if let Some(range) = slot_range(start, end) {
            shard.slots.push(range);
        }
    }
    shards
}

/// Parse a `CLUSTER SHARDS` reply, keyed by primary address
///
/// Only nodes reported `online` are kept. A shard without an online primary
/// is skipped.
pub(crate) fn parse_shards(reply: &Message, queried: &str, tls: bool) -> HashMap<String, Shard> {
    let mut shards = HashMap::new();
    for entry in reply.children() {
        let Ok(shard) = entry.as_map() else {
            continue;
        };
        let bounds: Vec<i64> = shard
            .get("slots")
            .map(|s| s.children().iter().filter_map(|b| b.as_i64().ok()).collect())
            .unwrap_or_default();
        let slots = bounds
            .chunks_exact(2)
            .filter_map(|pair| slot_range(pair[0], pair[1]))
            .collect();

        let mut nodes = Vec::new();
        let mut primary = None;
        let listed = shard.get("nodes").map(Message::children).unwrap_or_default();
        for node in listed {
            let Ok(node) = node.as_map() else {
                continue;
            };
            let field = |name: &str| node.get(name).map(Message::to_string_lossy).unwrap_or_default();
            if field("health") != "online" {
                continue;
            }
            let int = |name: &str| node.get(name).and_then(|v| v.as_i64().ok()).unwrap_or(0);
            let port = match int("tls-port") {
                p if tls && p > 0 => p,
                _ => int("port"),
            };
            if let Some(addr) = endpoint(queried, &field("endpoint"), port) {
                if field("role") == "master" {
                    primary = Some(nodes.len());
                }
                nodes.push(addr);
            }
        }
        if let Some(m) = primary {
            nodes.swap(0, m);
            shards.insert(nodes[0].clone(), Shard { nodes, slots });
        }
    }
    shards
}

#[derive(Clone)]
pub(crate) struct Node {
    pub mux: Mux,
    /// Seed address kept for discovery but not part of the cluster view
    pub hidden: bool,
}

/// Read candidates of one shard, shared by all of its slots
///
/// `nodes[i]` describes the replica behind `muxes[i]`.
pub(crate) struct Replicas {
    pub primary: Mux,
    pub nodes: Vec<NodeInfo>,
    pub muxes: Vec<Mux>,
}

impl Replicas {
    /// Ask the selector, or pick at random; an index it cannot resolve
    /// sends the read to the primary
    pub fn choose(&self, slot: u16, selector: Option<&ReplicaSelector>) -> Mux {
        if self.muxes.is_empty() {
            return self.primary.clone();
        }
        let i = match selector {
            Some(select) => select(slot, &self.nodes),
            None => rand::thread_rng().gen_range(0..self.muxes.len()),
        };
        self.muxes.get(i).unwrap_or(&self.primary).clone()
    }

    fn holds(&self, mux: &Mux) -> bool {
        self.primary.same(mux) || self.muxes.iter().any(|m| m.same(mux))
    }

    fn replaced(&self, stale: &Mux, fresh: &Mux) -> Self {
        let swap = |m: &Mux| if m.same(stale) { fresh.clone() } else { m.clone() };
        Self {
            primary: swap(&self.primary),
            nodes: self.nodes.clone(),
            muxes: self.muxes.iter().map(swap).collect(),
        }
    }
}

/// An immutable routing table; changes are made on a copy and swapped in
#[derive(Clone, Default)]
pub(crate) struct Topology {
    pub conns: HashMap<String, Node>,
    pub wslots: Vec<Option<Mux>>,
    /// Per-slot read candidates when replica reads are enabled, otherwise empty
    pub rslots: Vec<Option<Arc<Replicas>>>,
    pub shards: Vec<Shard>,
}

impl Topology {
    pub fn primary(&self, slot: u16) -> Option<&Mux> {
        self.wslots.get(slot as usize).and_then(Option::as_ref)
    }

    /// Where a command for `slot` goes; keyless commands may go anywhere.
    /// Replica reads consult `selector` on every call.
    pub fn pick(&self, slot: u16, to_replica: bool, selector: Option<&ReplicaSelector>) -> Option<Mux> {
        if slot == INIT_SLOT {
            return self.conns.values().next().map(|n| n.mux.clone());
        }
        if to_replica {
            if let Some(Some(replicas)) = self.rslots.get(slot as usize) {
                return Some(replicas.choose(slot, selector));
            }
        }
        self.primary(slot).cloned()
    }

    /// Point every slot served by `stale` at `fresh`
    pub fn replace(&mut self, stale: &Mux, fresh: &Mux) {
        for target in self.wslots.iter_mut().flatten() {
            if target.same(stale) {
                *target = fresh.clone();
            }
        }
        let mut rebuilt: Vec<(*const Replicas, Arc<Replicas>)> = Vec::new();
        for entry in self.rslots.iter_mut().flatten() {
            if !entry.holds(stale) {
                continue;
            }
            let key = Arc::as_ptr(entry);
            let next = match rebuilt.iter().find(|(k, _)| *k == key) {
                Some((_, next)) => next.clone(),
                None => {
                    let next = Arc::new(entry.replaced(stale, fresh));
                    rebuilt.push((key, next.clone()));
                    next
                }
            };
            *entry = next;
        }
    }

    /// The first slot that has an owner
    pub fn any_owned_slot(&self) -> Option<u16> {
        self.wslots.iter().position(Option::is_some).map(|s| s as u16)
    }

    pub fn retarget(&mut self, slot: u16, mux: Mux) {
        if slot >= CLUSTER_SLOTS {
            return;
        }
        if self.wslots.is_empty() {
            self.wslots = vec![None; CLUSTER_SLOTS as usize];
        }
        self.wslots[slot as usize] = Some(mux);
    }

    /// Visible nodes with the slot ranges their shard owns
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes = Vec::new();
        for shard in &self.shards {
            for (i, addr) in shard.nodes.iter().enumerate() {
                let Some((host, port)) = split_host_port(addr) else {
                    continue;
                };
                let mut info = NodeInfo::new(String::new(), host.to_string(), port);
                info.slots = shard.slots.clone();
                info.is_master = i == 0;
                nodes.push(info);
            }
        }
        nodes.sort_by_key(NodeInfo::addr);
        nodes
    }
}
