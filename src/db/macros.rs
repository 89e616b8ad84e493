//! Backend dispatch macros for reducing code duplication.
//!
//! The two drivers expose the same capability set with different concrete
//! types. These macros generate the match over [`Backend`] so each forwarding
//! method stays a one-liner.
//!
//! [`Backend`]: crate::db::backend::Backend

/// Macro for generating backend dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_backend_dispatch!(self, driver => driver.ping().await)
/// ```
#[macro_export]
macro_rules! impl_backend_dispatch {
    ($backend:expr, $driver:ident => $body:expr) => {
        match $backend {
            $crate::db::backend::Backend::Networked($driver) => $body,
            $crate::db::backend::Backend::Embedded($driver) => $body,
        }
    };
}

pub use impl_backend_dispatch;
