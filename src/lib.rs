//! Auto-discovery and dynamic configuration for a metrics-collection agent.
//!
//! Discoverers watch a live environment (Kubernetes today) and turn its
//! state into [`target::TargetGroup`] streams. The discovery
//! [`discovery::Manager`] fans multiple discoverers into one debounced
//! stream, and the [`pipeline::Pipeline`] diffs it against a fingerprint
//! cache, decorating fresh targets through the tag engine and rendering
//! collector configuration text through the build engine. Vanished targets
//! have their previously emitted configuration retracted as stale.

pub mod discovery;
pub mod pipeline;
pub mod selector;
pub mod tags;
pub mod target;
pub mod template;

#[cfg(test)]
mod testing;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;
