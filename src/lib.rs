//! shoal - a symmetric-heap PGAS runtime.
//!
//! Every participant is a *processing element* (PE). Each PE exposes two
//! symmetric memory regions - a symmetric heap carved out by a subpool
//! allocator and the static-data (etext) range of the process - and the
//! runtime translates a symmetric address into any peer's local address by
//! applying a per-PE base offset. On top of that sit:
//!
//! 1. **One-sided data movement**: blocking put/get, strided variants and
//!    remote atomics with explicit completion fences ([`fence`], [`quiet`]).
//! 2. **Collectives over active sets**: barrier, broadcast, collect,
//!    fcollect, alltoall and reductions over `(start, log_stride, size)`
//!    subsets of the world, backed by a cached subcommunicator table.
//! 3. **A distributed MCS lock** built from remote compare-and-swap and
//!    fetch-and-op on a dedicated lock window.
//!
//! The message-passing substrate is abstracted by [`substrate::Substrate`];
//! the in-tree [`substrate::smp`] transport runs every PE of the world as a
//! thread of one process on a single shared-memory node, which is also how
//! the integration tests execute ([`run_pes`]).

pub mod activeset;
pub mod api;
pub mod coll;
pub mod elem;
pub mod lock;
pub mod logger;
pub mod rma;
pub mod runtime;
pub mod subpool;
pub mod substrate;
pub mod symmetric;
pub mod wait;

pub use activeset::ActiveSet;
pub use num_complex::{Complex32, Complex64};
pub use api::*;
pub use coll::Reduce;
pub use elem::{AtomicInt, AtomicValue, Element};
pub use runtime::{run_pes, Launch, Threading};
pub use wait::Cmp;

/// Sentinel written into every pSync slot before a collective is issued.
pub const SYNC_VALUE: i64 = 0;

/// Required pSync lengths, per collective family.
pub const BARRIER_SYNC_SIZE: usize = 1;
pub const BCAST_SYNC_SIZE: usize = 1;
pub const REDUCE_SYNC_SIZE: usize = 1;
pub const COLLECT_SYNC_SIZE: usize = 2;
pub const ALLTOALL_SYNC_SIZE: usize = 1;

#[macro_export]
macro_rules! sh_log {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! sh_fatal {
    ($($arg:tt)*) => {{
        $crate::sh_log!($crate::logger::LogLevel::Fatal, $($arg)*);
    }};
}

#[macro_export]
macro_rules! sh_error {
    ($($arg:tt)*) => {{
        $crate::sh_log!($crate::logger::LogLevel::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! sh_warn {
    ($($arg:tt)*) => {{
        $crate::sh_log!($crate::logger::LogLevel::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! sh_info {
    ($($arg:tt)*) => {{
        $crate::sh_log!($crate::logger::LogLevel::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! sh_debug {
    ($($arg:tt)*) => {{
        $crate::sh_log!($crate::logger::LogLevel::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! sh_trace {
    ($($arg:tt)*) => {{
        $crate::sh_log!($crate::logger::LogLevel::Trace, $($arg)*);
    }};
}
