//! Test doubles
//!
//! Lets the bridge run without a broker. The mesh side has its own in-memory client,
//! [`VirtualMesh`](crate::mesh::VirtualMesh).

pub mod mocks;

pub use mocks::*;
