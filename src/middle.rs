//! The middle-end of the compiler: SSA IL, the call graph, and the
//! whole-program frame and zero-page allocators.

pub mod callgraph;
pub mod frame;
pub mod il;
pub mod lower;
pub mod zeropage;

pub use lower::lower;
