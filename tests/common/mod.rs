//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use traffic_threads::simulation::{
    ControllerId, LightTimings, MotionTimings, NodeId, NodeType, Position, RoadGraph, SimContext,
    TrafficLight,
};

/// Quick actor timings so scenarios finish in milliseconds
pub fn fast_motion() -> MotionTimings {
    MotionTimings {
        step: Duration::from_millis(5),
        retry: Duration::from_millis(5),
        signal_poll: Duration::from_millis(10),
        pedestrian_backoff: Duration::from_millis(10),
        crossing_poll: Duration::from_millis(5),
    }
}

/// Long phases; tests drive lights by hand with `advance_phase`
pub fn manual_timings() -> LightTimings {
    LightTimings::new(
        Duration::from_secs(60),
        Duration::from_secs(60),
        Duration::from_secs(60),
    )
    .with_check_interval(Duration::from_millis(10))
}

/// A one-way street `0 -> 1 -> ... -> len-1` along y = 0
pub fn line_graph(len: i32) -> RoadGraph {
    let mut graph = RoadGraph::new(len, 1);
    for x in 0..len {
        graph
            .add_node(Position::new(x, 0), NodeType::Street)
            .expect("add node");
    }
    for x in 0..(len as usize - 1) {
        graph
            .add_edge(NodeId(x), NodeId(x + 1), 1)
            .expect("add edge");
    }
    graph
}

/// A line graph with light 0 on `light_node`, built with the given timings
pub fn line_with_light(
    len: i32,
    light_node: usize,
    timings: LightTimings,
    motion: MotionTimings,
) -> (Arc<SimContext>, Arc<TrafficLight>) {
    let mut graph = line_graph(len);
    graph
        .attach_controller(NodeId(light_node), ControllerId(0))
        .expect("attach controller");
    let light = Arc::new(TrafficLight::new(
        ControllerId(0),
        Position::new(light_node as i32, 0),
        timings,
    ));
    let ctx = Arc::new(SimContext::new(graph, vec![Arc::clone(&light)], motion));
    (ctx, light)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}
