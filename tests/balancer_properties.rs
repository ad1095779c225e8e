//! Property tests for `LoadBalancerTable` round-robin fairness and
//! overflow safety (spec §8 invariants 3 and 4).

use partition_rpc::balancer::LoadBalancerTable;
use partition_rpc::node::{Endpoint, Node};
use proptest::prelude::*;
use std::collections::HashMap;

fn table_with_endpoints(count: u64) -> LoadBalancerTable {
    let endpoints: Vec<Endpoint> = (1..=count).map(|id| Endpoint::new(Node::new(id, format!("host:{id}"), [0]))).collect();
    LoadBalancerTable::build(endpoints, 1, false).unwrap()
}

proptest! {
    #[test]
    fn round_robin_never_under_selects_by_more_than_the_remainder(endpoint_count in 1u64..8, rounds in 1u32..40) {
        let table = table_with_endpoints(endpoint_count);
        let calls = rounds as u64 * endpoint_count;
        let mut counts: HashMap<u64, u64> = HashMap::new();
        for _ in 0..calls {
            let node = table.node_for_partition(0, 0, 0).unwrap();
            *counts.entry(node.id).or_insert(0) += 1;
        }
        let floor = calls / endpoint_count;
        for id in 1..=endpoint_count {
            let seen = *counts.get(&id).unwrap_or(&0);
            prop_assert!(seen >= floor, "endpoint {id} selected {seen} times, expected >= {floor}");
        }
    }

    #[test]
    fn overflow_region_never_panics_or_stalls(endpoint_count in 1u64..5, start_offset in 0i32..5) {
        let table = table_with_endpoints(endpoint_count);
        let route = table.route(0).unwrap();
        route_set_cursor_near_max(&route, start_offset);
        for _ in 0..(endpoint_count as u32 + 2) {
            prop_assert!(table.node_for_partition(0, 0, 0).is_some());
        }
    }
}

fn route_set_cursor_near_max(route: &partition_rpc::balancer::PartitionRoute, offset: i32) {
    // Exercises the same overflow boundary as the in-crate unit test, from
    // a proptest-varied starting offset below `i32::MAX`.
    route.force_cursor_for_test(i32::MAX - offset);
}
