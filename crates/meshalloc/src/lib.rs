//! A meshing heap: spans of the same size class whose live objects occupy
//! disjoint slots are merged onto one set of physical pages, while every
//! object keeps its virtual address.
//!
//! [`allocator::GlobalHeap`] is the entry point for Rust callers; `api`
//! exposes the `mesh_*` C functions over a process-wide instance.

extern crate libc;

pub mod allocator;
pub mod api;
pub mod arena;
pub mod config;
pub mod init;
pub mod integrity;
pub mod mesh;
pub mod platform;
pub mod slab;
pub mod sync;
pub mod util;

pub use allocator::GlobalHeap;
pub use arena::{MemfdArena, MeshArena};
pub use config::MeshConfig;
