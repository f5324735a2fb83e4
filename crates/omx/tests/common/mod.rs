//! Shared scaffolding: a two-board fabric with one endpoint on each,
//! connected both ways, plus pumping helpers that drive both endpoints
//! and the virtual clock until a condition holds.
#![allow(dead_code)]

use omx::{
    driver::sim::SimFabric, Completion, Endpoint, EndpointAddr, EndpointParams, RequestId, Status,
};

pub const BOARD_A: u64 = 0x0011_2233_4455;
pub const BOARD_B: u64 = 0x0011_2233_4466;
pub const KEY: u32 = 0xcafe;

pub struct World {
    pub fabric: SimFabric,
    pub a: Endpoint,
    pub b: Endpoint,
    /// Address of B as seen from A.
    pub to_b: EndpointAddr,
    /// Address of A as seen from B.
    pub to_a: EndpointAddr,
}

pub fn open_pair(params: EndpointParams) -> (SimFabric, Endpoint, Endpoint) {
    let _ = omx::init();
    let fabric = SimFabric::new();
    fabric.add_board(BOARD_A, "host-a");
    fabric.add_board(BOARD_B, "host-b");
    let a = Endpoint::open(Box::new(fabric.open_endpoint(0, 0).unwrap()), KEY, params).unwrap();
    let b = Endpoint::open(Box::new(fabric.open_endpoint(1, 0).unwrap()), KEY, params).unwrap();
    (fabric, a, b)
}

pub fn world() -> World {
    world_with(EndpointParams::default())
}

pub fn world_with(params: EndpointParams) -> World {
    let (fabric, mut a, mut b) = open_pair(params);
    let to_b = connect(&mut a, &mut b, BOARD_B, KEY);
    let to_a = connect(&mut b, &mut a, BOARD_A, KEY);
    World {
        fabric,
        a,
        b,
        to_b,
        to_a,
    }
}

/// Connects `from` to `other`'s endpoint 0, pumping both sides.
pub fn connect(from: &mut Endpoint, other: &mut Endpoint, nic: u64, key: u32) -> EndpointAddr {
    let req = from.iconnect(nic, 0, key, 0).unwrap();
    for _ in 0..1000 {
        from.progress().unwrap();
        other.progress().unwrap();
        if let Some(completion) = from.test(req).unwrap() {
            assert_eq!(completion.code, Status::Success);
            return completion.addr;
        }
    }
    panic!("connect did not complete");
}

/// Pumps both endpoints until `request` (owned by `a`) completes,
/// advancing the clock so timers fire.
pub fn complete_on_a(world: &mut World, request: RequestId) -> Completion {
    for _ in 0..50_000 {
        world.a.progress().unwrap();
        world.b.progress().unwrap();
        if let Some(completion) = world.a.test(request).unwrap() {
            return completion;
        }
        world.fabric.advance_jiffies(1);
    }
    panic!("request on A did not complete");
}

/// Pumps both endpoints until `request` (owned by `b`) completes.
pub fn complete_on_b(world: &mut World, request: RequestId) -> Completion {
    for _ in 0..50_000 {
        world.a.progress().unwrap();
        world.b.progress().unwrap();
        if let Some(completion) = world.b.test(request).unwrap() {
            return completion;
        }
        world.fabric.advance_jiffies(1);
    }
    panic!("request on B did not complete");
}

/// Pumps both endpoints a fixed number of rounds.
pub fn pump(world: &mut World, rounds: usize) {
    for _ in 0..rounds {
        world.a.progress().unwrap();
        world.b.progress().unwrap();
    }
}
