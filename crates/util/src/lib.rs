//! Shared async and container utilities.
//!
//! Home of the single-shot [`Promise`] every asynchronous collaborator
//! operation returns, and a small bid/arrival priority queue used by
//! sequencing-adjacent callers.

mod promise;
pub use promise::{Promise, PromiseError, PromiseProducer};

mod bid_queue;
pub use bid_queue::{Bidded, BidQueue};
