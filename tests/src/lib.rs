//! modelshare testing utilities
//!
//! Deterministic collaborators for exercising the sharing service without a
//! real model runtime: a scriptable [`MockBackend`] and a [`ManualClock`].

pub mod backend;

pub use backend::MockBackend;
pub use clock::ManualClock;

/// Assert that holder sets, caller sessions and memory accounting agree.
#[macro_export]
macro_rules! assert_consistent {
    ($service:expr) => {
        if let Err(violation) = $service.check_consistency() {
            panic!("registry inconsistent: {}", violation);
        }
    };
}
