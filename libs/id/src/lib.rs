//! # spotguard-id
//!
//! Stable identity types for workloads protected by spot-guard.
//!
//! ## Design Principles
//!
//! - Names follow Kubernetes object naming rules and are validated on parse
//! - Every identity has one canonical string form with strict parsing
//! - Identities roundtrip (parse → format → parse)
//!
//! ## Formats
//!
//! A workload is addressed as `{namespace}/{name}`:
//! - `qa/web`
//! - `payments/api-gateway.v2`
//!
//! When stored as a key in a record substrate (for example a ConfigMap data
//! entry, where `/` is not allowed) the record form `{namespace}.{name}` is
//! used. Namespaces are DNS labels and never contain `.`, so the first `.`
//! always separates the two parts.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
