//! Fault injection on store writes
//!
//! With the `failpoints` feature the store's write paths carry named
//! `fail` points. A test arms one, runs a workflow whose host steps succeed,
//! and then checks that the saga undid them. Without the feature the macro
//! expands to nothing.

/// Single-row puts and inserts
pub const STORE_PUT: &str = "store::put";
/// Multi-statement transactions
pub const STORE_TRANSACTION: &str = "store::transaction";
/// Relationship edge inserts
pub const STORE_RELATIONSHIP: &str = "store::relationship";

/// Every failpoint the store declares
pub const STORE_FAILPOINTS: [&str; 3] = [STORE_PUT, STORE_TRANSACTION, STORE_RELATIONSHIP];

/// Reset the registry; call once at the top of each failpoint test
#[cfg(feature = "failpoints")]
pub fn init() {
    scenarios::disable_all();
}

/// Return an `Internal` error from the enclosing function when `$name` is armed
#[macro_export]
#[cfg(feature = "failpoints")]
macro_rules! fail_point {
    ($name:expr) => {{
        fail::fail_point!($name, |_| {
            return Err($crate::error::NimbusError::Internal {
                message: format!("Failpoint triggered: {}", $name),
            });
        });
    }};
    ($name:expr, $err:expr) => {{
        fail::fail_point!($name, |_| {
            return Err($err);
        });
    }};
}

#[macro_export]
#[cfg(not(feature = "failpoints"))]
macro_rules! fail_point {
    ($name:expr) => {};
    ($name:expr, $err:expr) => {};
}

#[cfg(feature = "failpoints")]
pub mod scenarios {
    use tracing::error;

    pub(super) fn arm(name: &str, actions: &str) {
        if let Err(e) = fail::cfg(name, actions) {
            error!(failpoint = name, "Could not configure failpoint: {}", e);
        }
    }

    /// Let `n` hits through, then fail every later one
    pub fn fail_after_n(name: &str, n: usize) {
        arm(name, &format!("{}*off->return", n));
    }

    pub fn fail_always(name: &str) {
        arm(name, "return");
    }

    pub fn disable(name: &str) {
        arm(name, "off");
    }

    pub fn disable_all() {
        for name in super::STORE_FAILPOINTS {
            disable(name);
        }
    }
}

/// Run `f` with `name` armed as `actions`, disarming it afterwards
#[cfg(feature = "failpoints")]
pub async fn with_failpoint<F, R>(name: &str, actions: &str, f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    scenarios::arm(name, actions);
    let result = f.await;
    scenarios::disable(name);
    result
}
