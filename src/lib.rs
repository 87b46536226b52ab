//! Strata - declarative resource deployment engine
//!
//! Strata turns a set of interdependent resource definitions into live
//! infrastructure. Definitions are ordered by their dependency graph, rendered
//! into backend-bound output resources, applied one node at a time, and each
//! applied workload is watched until it actually converges before the next
//! node proceeds. The same graph tears down in exact reverse order.
//!
//! # Architecture
//!
//! - A dependency graph is computed up front; cyclic input is rejected before
//!   any side effect occurs
//! - Renderers are pure: they build desired-state payloads and never touch
//!   the backend
//! - Handlers apply one output resource at a time with server-side apply, so
//!   repeating a deployment is safe
//! - The convergence monitor drives three event feeds (workload, replica
//!   sets, pods) into a single evaluation loop with a single-assignment
//!   result
//!
//! # Modules
//!
//! - [`definition`] - Resource definitions submitted to a deployment
//! - [`output`] - Output resources, identities, and backend provider tags
//! - [`values`] - Computed value references and property resolution
//! - [`store`] - Per-resource deployment records and their persistence
//! - [`graph`] - Dependency graph builder and application graph queries
//! - [`render`] - Renderer contract and built-in renderers
//! - [`handler`] - Resource handler contract and the Kubernetes handler
//! - [`convergence`] - Workload convergence monitor
//! - [`deploy`] - Deployment and deletion orchestrators
//! - [`error`] - Error types for the engine

#![deny(missing_docs)]

pub mod convergence;
pub mod definition;
pub mod deploy;
pub mod error;
pub mod graph;
pub mod handler;
pub mod output;
pub mod render;
pub mod store;
pub mod values;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout Strata.
// Centralizing them here ensures consistency across handler configs and test
// fixtures. They are defaults only: both durations are configuration inputs
// at handler construction, never read as globals.

/// Default maximum time to wait for a workload to converge after apply
pub const DEFAULT_CONVERGENCE_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(10 * 60);

/// Default resync interval for the convergence event feeds
pub const DEFAULT_RESYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Field manager name used for server-side apply
pub const FIELD_MANAGER: &str = "strata-engine";
