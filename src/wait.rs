//! Point-to-point synchronization: spin until a symmetric variable local to
//! the caller satisfies a predicate.
//!
//! Peer writes arrive either through the intra-node fast path or through
//! substrate accumulates, so every poll is separated by a local window sync
//! to keep the public and private window copies coherent.

use core::ptr;

use crate::elem::WaitElement;
use crate::rma::local_sync;
use crate::runtime::Runtime;

/// Comparison operators for [`wait_until`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Cmp {
    pub fn holds<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Ge => lhs >= rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Le => lhs <= rhs,
        }
    }
}

/// Block until `cmp(*var, value)` holds.
pub(crate) fn wait_until<T: WaitElement>(rt: &Runtime, var: *const T, cmp: Cmp, value: T) {
    rt.resolve_or_abort(var as *const u8, "wait_until");
    loop {
        local_sync(rt);
        let current = unsafe { ptr::read_volatile(var) };
        if cmp.holds(current, value) {
            return;
        }
        core::hint::spin_loop();
    }
}

/// Legacy spelling: return once `*var != value`.
pub(crate) fn wait<T: WaitElement>(rt: &Runtime, var: *const T, value: T) {
    wait_until(rt, var, Cmp::Ne, value)
}
