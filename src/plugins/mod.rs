//! Executors that plug into sequences.

pub mod cache;
pub mod dual_selector;
pub mod forward;

pub use cache::Cache;
pub use dual_selector::DualSelector;
pub use forward::Forward;
