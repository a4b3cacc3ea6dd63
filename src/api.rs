//! Public API surface.
//!
//! Free functions over the calling PE's runtime context, mirroring the
//! classic SHMEM operation families: lifecycle and identity queries,
//! symmetric heap management, put/get, remote atomics, point-to-point
//! waits, ordering fences, collectives over active sets, and distributed
//! locks. The historical per-type entry-point fan-out collapses into
//! generics over [`Element`] and friends.

use core::ptr;

use crate::activeset::ActiveSet;
use crate::coll::{self, CollKind, Reduce};
use crate::elem::{AtomicInt, AtomicValue, Element, WaitElement};
use crate::lock;
use crate::rma;
use crate::runtime::{with, with_mut};
use crate::symmetric::{window_offset, WindowId};
use crate::wait::{self, Cmp};
use crate::{
    ALLTOALL_SYNC_SIZE, BARRIER_SYNC_SIZE, BCAST_SYNC_SIZE, COLLECT_SYNC_SIZE, REDUCE_SYNC_SIZE,
};

pub use crate::runtime::{finalize, global_exit, init};

/// Supported interface version.
pub const VERSION_MAJOR: i32 = 1;
pub const VERSION_MINOR: i32 = 1;

const VENDOR_STRING: &str = "shoal";

// ============================================================================
// Identity and queries
// ============================================================================

pub fn info_version() -> (i32, i32) {
    (VERSION_MAJOR, VERSION_MINOR)
}

pub fn info_name() -> &'static str {
    VENDOR_STRING
}

/// World rank of the calling PE.
pub fn my_pe() -> i32 {
    with(|rt| rt.world_rank)
}

/// Number of PEs in the world.
pub fn n_pes() -> i32 {
    with(|rt| rt.world_size)
}

/// Whether `pe` names a reachable PE.
pub fn pe_accessible(pe: i32) -> bool {
    with(|rt| pe >= 0 && pe < rt.world_size)
}

/// Whether `addr` is a symmetric address reachable on `pe`.
pub fn addr_accessible<T>(addr: *const T, pe: i32) -> bool {
    with(|rt| {
        if pe < 0 || pe >= rt.world_size {
            return false;
        }
        window_offset(&rt.sym.sheap, &rt.sym.etext, addr as *const u8).is_some()
    })
}

/// Wall-clock seconds, for timing loops.
pub fn wtime() -> f64 {
    with(|rt| rt.sub.wtime())
}

// ============================================================================
// Symmetric heap
// ============================================================================

/// Allocate `size` bytes from the symmetric heap. Collective by
/// convention: every PE must allocate in the same order. Null on
/// exhaustion.
pub fn sh_malloc(size: usize) -> *mut u8 {
    with(|rt| rt.sym.heap.malloc(size))
}

/// Aligned variant of [`sh_malloc`]; `align` must be a power of two.
pub fn sh_align(align: usize, size: usize) -> *mut u8 {
    with(|rt| rt.sym.heap.memalign(align, size))
}

pub fn sh_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    with(|rt| rt.sym.heap.realloc(ptr, size))
}

pub fn sh_free(ptr: *mut u8) {
    with(|rt| rt.sym.heap.free(ptr))
}

/// Typed convenience: allocate `count` elements of `T`.
pub fn sh_malloc_elems<T: Element>(count: usize) -> *mut T {
    sh_align(
        core::mem::align_of::<T>().max(crate::subpool::DEFAULT_ALIGN),
        count * core::mem::size_of::<T>(),
    ) as *mut T
}

/// Local address of `target` on `pe`, when the fast path can provide one:
/// non-null for sheap addresses on an all-on-one-node world, or for
/// `pe == my_pe()`.
pub fn remote_ptr<T>(target: *const T, pe: i32) -> *mut T {
    with(|rt| {
        rt.check_pe(pe, "remote_ptr");
        if rt.smp_enabled {
            let (win_id, _) = rt.resolve_or_abort(target as *const u8, "remote_ptr");
            if win_id == WindowId::Sheap {
                return rt.smp_peer_addr(target as *const u8, pe) as *mut T;
            }
        }
        if pe == rt.world_rank {
            target as *mut T
        } else {
            ptr::null_mut()
        }
    })
}

// ============================================================================
// Put / get
// ============================================================================

/// Store `source` into the symmetric `target` on `pe`. Locally complete on
/// return; remote visibility needs [`quiet`] or a barrier.
pub fn put<T: Element>(target: *mut T, source: &[T], pe: i32) {
    with(|rt| rma::put(rt, target, source.as_ptr(), source.len(), pe))
}

/// Fetch `target.len()` elements from the symmetric `source` on `pe`;
/// the data is valid on return.
pub fn get<T: Element>(target: &mut [T], source: *const T, pe: i32) {
    with(|rt| rma::get(rt, target.as_mut_ptr(), source, target.len(), pe))
}

/// Single-element put.
pub fn put_value<T: Element>(target: *mut T, value: T, pe: i32) {
    with(|rt| rma::put(rt, target, &value, 1, pe))
}

/// Single-element get.
pub fn get_value<T: Element>(source: *const T, pe: i32) -> T {
    with(|rt| {
        let mut out = core::mem::MaybeUninit::<T>::uninit();
        rma::get(rt, out.as_mut_ptr(), source, 1, pe);
        unsafe { out.assume_init() }
    })
}

/// Strided put: element `i` of `source` (stride `sst`) lands at
/// `target + i * tst`. Strides are signed element counts - a negative
/// stride walks backward from the start address - and must fit in a
/// 32-bit integer.
pub fn iput<T: Element>(
    target: *mut T,
    source: *const T,
    tst: isize,
    sst: isize,
    nelems: usize,
    pe: i32,
) {
    with(|rt| rma::put_strided(rt, target, source, tst, sst, nelems, pe))
}

/// Strided get: element `i` of the remote `source` (stride `sst`) lands at
/// `target + i * tst`. Strides are signed, as for [`iput`].
pub fn iget<T: Element>(
    target: *mut T,
    source: *const T,
    tst: isize,
    sst: isize,
    nelems: usize,
    pe: i32,
) {
    with(|rt| rma::get_strided(rt, target, source, tst, sst, nelems, pe))
}

/// Declared non-blocking put; currently a blocking alias.
/// TODO: issue without the trailing local flush once quiet tracks
/// outstanding transfers.
pub fn put_nbi<T: Element>(target: *mut T, source: &[T], pe: i32) {
    put(target, source, pe)
}

/// Declared non-blocking get; currently a blocking alias (see [`put_nbi`]).
pub fn get_nbi<T: Element>(target: &mut [T], source: *const T, pe: i32) {
    get(target, source, pe)
}

// ============================================================================
// Atomics
// ============================================================================

/// Atomic swap; remotely complete on return.
pub fn atomic_swap<T: AtomicValue>(target: *mut T, value: T, pe: i32) -> T {
    with(|rt| rma::swap(rt, target, value, pe))
}

/// Atomic conditional swap: replaces the remote value with `value` only if
/// it equals `cond`; returns the previous value either way.
pub fn atomic_cswap<T: AtomicInt>(target: *mut T, cond: T, value: T, pe: i32) -> T {
    with(|rt| rma::cswap(rt, target, cond, value, pe))
}

pub fn atomic_add<T: AtomicInt>(target: *mut T, value: T, pe: i32) {
    with(|rt| rma::add(rt, target, value, pe))
}

pub fn atomic_fadd<T: AtomicInt>(target: *mut T, value: T, pe: i32) -> T {
    with(|rt| rma::fadd(rt, target, value, pe))
}

pub fn atomic_inc<T: AtomicInt>(target: *mut T, pe: i32) {
    with(|rt| rma::inc(rt, target, pe))
}

pub fn atomic_finc<T: AtomicInt>(target: *mut T, pe: i32) -> T {
    with(|rt| rma::finc(rt, target, pe))
}

pub fn atomic_fetch<T: AtomicValue>(source: *const T, pe: i32) -> T {
    with(|rt| rma::fetch(rt, source, pe))
}

pub fn atomic_set<T: AtomicValue>(target: *mut T, value: T, pe: i32) {
    with(|rt| rma::set(rt, target, value, pe))
}

// ============================================================================
// Ordering and point-to-point synchronization
// ============================================================================

/// Order puts per target PE.
pub fn fence() {
    with(rma::fence)
}

/// Complete all outstanding remote operations issued by this PE.
pub fn quiet() {
    with(rma::quiet)
}

/// Block until the symmetric `var` (local to this PE) satisfies
/// `cmp(*var, value)`.
pub fn wait_until<T: WaitElement>(var: *const T, cmp: Cmp, value: T) {
    with(|rt| wait::wait_until(rt, var, cmp, value))
}

/// Legacy spelling of [`wait_until`]: return once `*var != value`.
pub fn wait<T: WaitElement>(var: *const T, value: T) {
    with(|rt| wait::wait(rt, var, value))
}

// ============================================================================
// Collectives
// ============================================================================

/// World-wide barrier with full remote completion.
pub fn barrier_all() {
    with(rma::barrier_all)
}

/// Barrier over an active set. Completes this PE's outstanding operations
/// first, like the world barrier.
pub fn barrier(set: ActiveSet, psync: &mut [i64]) {
    with_mut(|rt| {
        rma::remote_sync(rt);
        rma::local_sync(rt);
        coll::set_psync(rt, psync, BARRIER_SYNC_SIZE, "barrier");
        coll::coll(
            rt,
            CollKind::Barrier,
            crate::substrate::Kind::Uint8,
            None,
            ptr::null_mut(),
            ptr::null(),
            0,
            -1,
            set,
        );
    })
}

/// Broadcast `nelems` elements from the PE with world rank `root` to every
/// other PE of the active set. The root's `target` is left untouched.
pub fn broadcast<T: Element>(
    target: *mut T,
    source: *const T,
    nelems: usize,
    root: i32,
    set: ActiveSet,
    psync: &mut [i64],
) {
    with_mut(|rt| {
        coll::set_psync(rt, psync, BCAST_SYNC_SIZE, "broadcast");
        coll::coll(
            rt,
            CollKind::Broadcast,
            T::KIND,
            None,
            target as *mut u8,
            source as *const u8,
            nelems,
            root,
            set,
        );
    })
}

/// Concatenate equal-sized contributions over the active set ("fcollect").
pub fn fcollect<T: Element>(
    target: *mut T,
    source: *const T,
    nelems: usize,
    set: ActiveSet,
    psync: &mut [i64],
) {
    with_mut(|rt| {
        coll::set_psync(rt, psync, COLLECT_SYNC_SIZE, "fcollect");
        coll::coll(
            rt,
            CollKind::AllgatherFixed,
            T::KIND,
            None,
            target as *mut u8,
            source as *const u8,
            nelems,
            -1,
            set,
        );
    })
}

/// Concatenate variable-sized contributions over the active set
/// ("collect"); `nelems` is this PE's contribution.
pub fn collect<T: Element>(
    target: *mut T,
    source: *const T,
    nelems: usize,
    set: ActiveSet,
    psync: &mut [i64],
) {
    with_mut(|rt| {
        coll::set_psync(rt, psync, COLLECT_SYNC_SIZE, "collect");
        coll::coll(
            rt,
            CollKind::AllgatherVar,
            T::KIND,
            None,
            target as *mut u8,
            source as *const u8,
            nelems,
            -1,
            set,
        );
    })
}

/// Exchange `nelems` elements with every PE of the active set.
pub fn alltoall<T: Element>(
    target: *mut T,
    source: *const T,
    nelems: usize,
    set: ActiveSet,
    psync: &mut [i64],
) {
    with_mut(|rt| {
        coll::set_psync(rt, psync, ALLTOALL_SYNC_SIZE, "alltoall");
        coll::coll(
            rt,
            CollKind::Alltoall,
            T::KIND,
            None,
            target as *mut u8,
            source as *const u8,
            nelems,
            -1,
            set,
        );
    })
}

/// Strided alltoall; `tst`/`sst` are element strides over target/source,
/// signed as for [`iput`].
pub fn alltoalls<T: Element>(
    target: *mut T,
    source: *const T,
    tst: isize,
    sst: isize,
    nelems: usize,
    set: ActiveSet,
    psync: &mut [i64],
) {
    with_mut(|rt| {
        coll::set_psync(rt, psync, ALLTOALL_SYNC_SIZE, "alltoalls");
        coll::coll(
            rt,
            CollKind::AlltoallStrided { tst, sst },
            T::KIND,
            None,
            target as *mut u8,
            source as *const u8,
            nelems,
            -1,
            set,
        );
    })
}

/// Reduce `nreduce` elements with `op` over the active set; every member
/// receives the result. `source` and `target` may be the same array but
/// must not partially overlap.
pub fn reduce_to_all<T: Element>(
    op: Reduce,
    target: *mut T,
    source: *const T,
    nreduce: usize,
    set: ActiveSet,
    _pwrk: &mut [T],
    psync: &mut [i64],
) {
    with_mut(|rt| {
        coll::set_psync(rt, psync, REDUCE_SYNC_SIZE, "reduce_to_all");
        coll::coll(
            rt,
            CollKind::Allreduce,
            T::KIND,
            Some(op.substrate_op()),
            target as *mut u8,
            source as *const u8,
            nreduce,
            -1,
            set,
        );
    })
}

macro_rules! named_reduction {
    ($(#[$doc:meta] $name:ident => $op:expr),* $(,)?) => {
        $(
            #[$doc]
            pub fn $name<T: Element>(
                target: *mut T,
                source: *const T,
                nreduce: usize,
                set: ActiveSet,
                pwrk: &mut [T],
                psync: &mut [i64],
            ) {
                reduce_to_all($op, target, source, nreduce, set, pwrk, psync)
            }
        )*
    };
}

named_reduction! {
    /// Logical AND reduction (integer kinds).
    and_to_all => Reduce::And,
    /// Bitwise OR reduction (integer kinds).
    or_to_all => Reduce::Or,
    /// Bitwise XOR reduction (integer kinds).
    xor_to_all => Reduce::Xor,
    /// Elementwise minimum.
    min_to_all => Reduce::Min,
    /// Elementwise maximum.
    max_to_all => Reduce::Max,
    /// Elementwise sum.
    sum_to_all => Reduce::Sum,
    /// Elementwise product.
    prod_to_all => Reduce::Prod,
}

// ============================================================================
// Locks
// ============================================================================

/// Acquire the distributed lock named by the symmetric `lock_word`;
/// blocks until granted. Fair: waiters are served in queue order. The
/// word identifies the lock; the queue itself lives in the runtime's
/// lock window.
pub fn set_lock(_lock_word: *mut i64) {
    with(lock::acquire)
}

/// Release the distributed lock; the oldest waiter (if any) owns the lock
/// before this returns.
pub fn clear_lock(_lock_word: *mut i64) {
    with(lock::release)
}

/// Try to acquire the lock without queueing. Returns `true` when the lock
/// was taken.
pub fn test_lock(_lock_word: *mut i64) -> bool {
    with(lock::try_acquire)
}
