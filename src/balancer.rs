//! LoadBalancerTable (spec §4.5): partition id to a rotating set of
//! endpoints, with overflow-safe round-robin selection subject to health
//! and capability filters.

use crate::error::Error;
use crate::node::{Endpoint, Node};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Per-partition routing state. `states[i]` mirrors an *additional*
/// per-route health flag, independent of `endpoints[i].can_serve_requests`
/// — both must be true for an endpoint to be usable (spec §3 invariant).
pub struct PartitionRoute {
    endpoints: Vec<Endpoint>,
    cursor: AtomicI32,
    states: Vec<AtomicBool>,
}

impl PartitionRoute {
    fn new(endpoints: Vec<Endpoint>) -> Self {
        let states = endpoints.iter().map(|_| AtomicBool::new(true)).collect();
        Self {
            endpoints,
            cursor: AtomicI32::new(0),
            states,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Sets the extra per-route health flag for endpoint `i` (distinct
    /// from the endpoint's own `can_serve_requests` bit).
    pub fn set_route_state(&self, i: usize, usable: bool) {
        if let Some(flag) = self.states.get(i) {
            flag.store(usable, Ordering::Release);
        }
    }

    fn usable(&self, i: usize, capability: u64, persistent_capability: u64) -> bool {
        self.endpoints[i].can_serve_requests()
            && self.states[i].load(Ordering::Acquire)
            && self.endpoints[i].node.satisfies_capability(capability)
            && self.endpoints[i].node.satisfies_persistent_capability(persistent_capability)
    }

    /// Overflow-safe round-robin selection (spec §4.5, with the corrected
    /// `compensateCounter` arithmetic from §9).
    pub fn node_for(&self, capability: u64, persistent_capability: u64) -> Option<Arc<Node>> {
        let n = self.endpoints.len();
        if n == 0 {
            return None;
        }

        // Guard overflow, then claim the next index.
        let _ = self
            .cursor
            .compare_exchange(i32::MAX, 0, Ordering::AcqRel, Ordering::Acquire);
        let idx = self.cursor.fetch_add(1, Ordering::AcqRel);

        let start = if idx < 0 { 0usize } else { (idx as u32 as usize) % n };

        let mut found: Option<(usize, usize)> = None; // (endpoint index, position scanned)
        for k in 0..=n {
            let pos = start + k;
            let i = pos % n;
            if self.usable(i, capability, persistent_capability) {
                found = Some((i, pos));
                break;
            }
        }

        let (chosen_index, last_pos) = found.unwrap_or((start, start));
        let loop_count = last_pos / n;
        self.compensate(idx, loop_count);

        Some(self.endpoints[chosen_index].node.clone())
    }

    /// Ordered, deduplicated list of every currently-qualifying node,
    /// starting from the current cursor position. Read-only: does not
    /// consume a round-robin slot.
    pub fn nodes_for(&self, capability: u64, persistent_capability: u64) -> Vec<Arc<Node>> {
        let n = self.endpoints.len();
        if n == 0 {
            return Vec::new();
        }
        let idx = self.cursor.load(Ordering::Acquire);
        let start = if idx < 0 { 0usize } else { (idx as u32 as usize) % n };

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for k in 0..n {
            let i = (start + k) % n;
            if self.usable(i, capability, persistent_capability) {
                let node = &self.endpoints[i].node;
                if seen.insert(node.id) {
                    out.push(node.clone());
                }
            }
        }
        out
    }

    fn compensate(&self, idx: i32, loop_count: usize) {
        let new_val = idx as i64 + 1 + loop_count as i64;
        let new_val = if new_val > i32::MAX as i64 {
            new_val - i32::MAX as i64
        } else {
            new_val
        };
        self.cursor.store(new_val as i32, Ordering::Release);
    }

    #[cfg(test)]
    fn set_cursor(&self, value: i32) {
        self.cursor.store(value, Ordering::Release);
    }

    /// Exposed to integration/property tests so they can exercise the
    /// overflow boundary without waiting for 2^31 real calls.
    #[cfg(any(test, feature = "test-util"))]
    pub fn force_cursor_for_test(&self, value: i32) {
        self.cursor.store(value, Ordering::Release);
    }
}

/// Partition id → routing table. Construction enforces the coverage
/// invariant from spec §3/§4.5; a built table is replaced as a whole via
/// [`LoadBalancerTable::replace`], never mutated endpoint-by-endpoint.
pub struct LoadBalancerTable {
    routes: ArcSwap<HashMap<u32, Arc<PartitionRoute>>>,
}

impl LoadBalancerTable {
    pub fn build(
        endpoints: Vec<Endpoint>,
        num_partitions: u32,
        serve_requests_if_partition_missing: bool,
    ) -> Result<Self, Error> {
        let mut grouped: HashMap<u32, Vec<Endpoint>> = HashMap::new();
        for endpoint in &endpoints {
            for &pid in &endpoint.node.partition_ids {
                grouped.entry(pid).or_default().push(endpoint.clone());
            }
        }

        let missing: Vec<u32> = (0..num_partitions).filter(|p| !grouped.contains_key(p)).collect();

        if num_partitions > 0 && missing.len() as u32 == num_partitions {
            return Err(Error::InvalidCluster);
        }
        if !missing.is_empty() {
            if !serve_requests_if_partition_missing {
                return Err(Error::InvalidCluster);
            }
            tracing::warn!(missing = ?missing, "cluster is missing endpoints for some partitions; continuing per configuration");
        }

        let routes = grouped
            .into_iter()
            .map(|(pid, eps)| (pid, Arc::new(PartitionRoute::new(eps))))
            .collect();

        Ok(Self {
            routes: ArcSwap::from_pointee(routes),
        })
    }

    /// Whole-table, copy-on-write replacement.
    pub fn replace(&self, new_table: Self) {
        self.routes.store(new_table.routes.load_full());
    }

    pub fn route(&self, partition_id: u32) -> Option<Arc<PartitionRoute>> {
        self.routes.load().get(&partition_id).cloned()
    }

    pub fn node_for_partition(&self, partition_id: u32, capability: u64, persistent_capability: u64) -> Option<Arc<Node>> {
        self.route(partition_id)?.node_for(capability, persistent_capability)
    }

    pub fn nodes_for_partition(&self, partition_id: u32, capability: u64, persistent_capability: u64) -> Vec<Arc<Node>> {
        self.route(partition_id)
            .map(|r| r.nodes_for(capability, persistent_capability))
            .unwrap_or_default()
    }
}
