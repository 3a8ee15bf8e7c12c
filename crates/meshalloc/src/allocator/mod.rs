pub mod global_heap;
pub mod stats;

pub use global_heap::GlobalHeap;
pub use stats::{BinStats, HeapStats, SpanInfo};
