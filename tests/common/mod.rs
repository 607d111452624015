//! Helpers shared by the integration tests.

use treeopt::{parse_program, run_program, Node, Outcome};

/// Fuel bound for interpreter runs, generous for every test program
/// while still stopping a runaway loop.
pub const FUEL: u64 = 1_000_000;

pub fn tree(src: &str) -> Node {
    parse_program(src).unwrap()
}

/// Evaluate a program to completion, panicking if it raises.
pub fn run(tree: &Node) -> Outcome {
    run_program(tree, FUEL).unwrap()
}
