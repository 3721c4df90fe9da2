//! Deadlane - ephemeral subscription lanes for pub/sub topics
//!
//! Gives each logical client an isolated subscription with a routing rule
//! that admits only its own traffic, and continuously reclaims messages
//! that land in subscription dead-letter views.
//!
//! - [`filter`]: lane subscription assignment and rule rotation
//! - [`inventory`]: working list of subscriptions to sweep
//! - [`dlq`]: dead-letter drain engine
//! - [`scheduler`]: non-reentrant sweep loop
//! - [`producer`]: token-tagged client traffic

pub mod bus;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod filter;
pub mod inventory;
pub mod producer;
pub mod scheduler;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
