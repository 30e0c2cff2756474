//! Error handling for Nimbus
//!
//! Every fallible operation in the control plane returns [`NimbusResult`].
//! Errors are structured so that the command surface can turn them into a
//! uniform `{result, out, err}` answer without losing the root cause.
//!
//! ## Error Categories
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Nimbus Error Taxonomy                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Access            │  Resource            │  Infrastructure  │
//! │  • Unauthorized    │  • Not Found         │  • Storage       │
//! │  • Security        │  • Already Exists    │  • Remote Script │
//! │                    │  • In Use            │  • IO            │
//! │                    │  • Exhausted         │  • Timeout       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Logic                                │  Dispatch            │
//! │  • Validation / Configuration         │  • Unknown Command   │
//! │  • Scheduling / Invalid Operation     │  • Duplicate Request │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Compensation
//!
//! Workflows roll back earlier steps when a later one fails. A failing
//! compensation is logged, never returned: the caller always receives the
//! error that started the rollback.
//!
//! ## Authorization
//!
//! [`NimbusError::Unauthorized`] carries the denied action for logs only.
//! Its display text is fixed so callers never learn about foreign scopes.

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{format_errors, NimbusError, NimbusResult};
