//! Forwarding pipeline.
//!
//! Every inbound message flows through:
//! 1. `TaskMatcher`: active tasks for the source chat
//! 2. `filter::evaluate_task()`: per-task keep/drop
//! 3. `AlbumAggregator` for grouped messages, straight on otherwise
//! 4. `ContentTransformer`: caption rewrite per task
//! 5. `Dispatcher`: fan-out to destinations, stats per outcome

pub mod album;
pub mod batch;
pub mod dispatcher;
pub mod filter;
pub mod matcher;
pub mod processor;
pub mod transform;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use album::{AlbumAggregator, AlbumConfig, AlbumWindowPolicy};
pub use dispatcher::Dispatcher;
pub use matcher::TaskMatcher;
pub use processor::{AlbumDelivery, ForwardEngine};
pub use transform::ContentTransformer;
