//! Exclusive node occupancy

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use traffic_threads::simulation::{AgentId, NodeId, NodeLock, Position};

#[test]
fn test_acquire_is_exclusive() {
    let lock = NodeLock::new(NodeId(0));
    assert!(lock.try_acquire(AgentId(1)));
    assert!(!lock.try_acquire(AgentId(2)));
    assert!(!lock.try_acquire(AgentId(1)));
    assert_eq!(lock.occupant(), Some(AgentId(1)));
}

#[test]
fn test_release_only_by_holder() {
    let lock = NodeLock::new(NodeId(0));
    assert!(!lock.release(AgentId(1)), "releasing a free node is a no-op");

    assert!(lock.try_acquire(AgentId(1)));
    assert!(!lock.release(AgentId(2)));
    assert_eq!(lock.occupant(), Some(AgentId(1)));

    assert!(lock.release(AgentId(1)));
    assert!(!lock.release(AgentId(1)));
    assert_eq!(lock.occupant(), None);
    assert!(lock.try_acquire(AgentId(2)));
}

#[test]
fn test_lease_releases_on_drop() {
    let graph = common::line_graph(3);
    let node = graph.node(NodeId(1)).unwrap();

    let lease = node.try_lease(AgentId(4)).expect("free node");
    assert_eq!(lease.node(), NodeId(1));
    assert_eq!(lease.position(), Position::new(1, 0));
    assert!(node.try_lease(AgentId(5)).is_none());
    assert_eq!(graph.held_by(AgentId(4)), vec![NodeId(1)]);

    drop(lease);
    assert!(!node.is_occupied());
    assert!(graph.held_by(AgentId(4)).is_empty());
}

#[test]
fn test_lease_released_when_holder_panics() {
    let graph = Arc::new(common::line_graph(2));
    let worker = {
        let graph = Arc::clone(&graph);
        thread::spawn(move || {
            let _lease = graph.node(NodeId(0)).unwrap().try_lease(AgentId(1));
            panic!("actor failed");
        })
    };
    assert!(worker.join().is_err());
    assert_eq!(graph.node(NodeId(0)).unwrap().occupant(), None);
}

#[test]
fn test_mutual_exclusion_under_contention() {
    let graph = Arc::new(common::line_graph(1));
    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));
    let acquisitions = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let graph = Arc::clone(&graph);
            let holders = Arc::clone(&holders);
            let max_holders = Arc::clone(&max_holders);
            let acquisitions = Arc::clone(&acquisitions);
            thread::spawn(move || {
                let node = graph.node(NodeId(0)).unwrap();
                for _ in 0..500 {
                    if let Some(lease) = node.try_lease(AgentId(i)) {
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        max_holders.fetch_max(now, Ordering::SeqCst);
                        assert_eq!(node.occupant(), Some(AgentId(i)));
                        acquisitions.fetch_add(1, Ordering::SeqCst);
                        holders.fetch_sub(1, Ordering::SeqCst);
                        drop(lease);
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    assert!(acquisitions.load(Ordering::SeqCst) > 0);
    assert!(!graph.node(NodeId(0)).unwrap().is_occupied());
}

#[test]
fn test_occupancy_snapshot() {
    let graph = common::line_graph(3);
    let _lease = graph.node(NodeId(2)).unwrap().try_lease(AgentId(9)).unwrap();

    let occupancy = graph.occupancy();
    assert_eq!(occupancy.len(), 3);
    assert_eq!(occupancy[2].occupant, Some(AgentId(9)));
    assert_eq!(occupancy[2].position, Position::new(2, 0));
    assert!(occupancy[..2].iter().all(|n| n.occupant.is_none()));
}
