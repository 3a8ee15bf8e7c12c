pub mod bin;
pub mod bitmap;
pub mod miniheap;
pub mod size_class;

pub use bin::BinnedTracker;
pub use bitmap::Bitmap;
pub use miniheap::{MeshState, MiniHeap, MiniHeapId, MiniHeapTable, Partition};
pub use size_class::{size_class_index, NUM_SIZE_CLASSES};
