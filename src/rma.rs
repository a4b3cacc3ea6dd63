//! One-sided operation engine: blocking put/get, strided transfers, remote
//! atomics, and the completion fences.
//!
//! Every operation resolves its symmetric address to a `(window, offset)`
//! pair and either takes the intra-node fast path (native memory copies and
//! processor atomics through the per-PE sheap base table) or issues the
//! equivalent substrate RMA followed by the completion flush the operation
//! promises: local completion for put/get, full remote completion for
//! atomics.
//!
//! Counts beyond the substrate's signed 32-bit limit are packaged as one
//! element of a derived contiguous datatype.

use core::ptr;
use core::sync::atomic::{fence as cpu_fence, AtomicU32, AtomicU64, Ordering};

use crate::elem::{AtomicInt, AtomicValue, Element};
use crate::runtime::Runtime;
use crate::substrate::{Datatype, Kind, RmaOp, Win};
use crate::symmetric::{window_offset, WindowId};

/// Largest element count the substrate accepts natively.
pub(crate) const MAX_RMA_COUNT: usize = i32::MAX as usize;

/// Split a transfer into a `(count, datatype)` pair the substrate accepts:
/// native counts stay as-is, anything larger becomes one element of a
/// contiguous derived type.
pub(crate) fn contig_count(nelems: usize, kind: Kind) -> (i32, Datatype) {
    contig_count_with_limit(nelems, kind, MAX_RMA_COUNT)
}

pub(crate) fn contig_count_with_limit(
    nelems: usize,
    kind: Kind,
    limit: usize,
) -> (i32, Datatype) {
    if nelems <= limit {
        (nelems as i32, Datatype::new(kind))
    } else {
        (1, Datatype::new(kind).contiguous(nelems))
    }
}

// ============================================================================
// Resolution helpers
// ============================================================================

impl Runtime {
    pub(crate) fn win_of(&self, id: WindowId) -> Win {
        match id {
            WindowId::Sheap => self.sym.sheap.win,
            WindowId::Etext => self.sym.etext.win,
        }
    }

    /// Resolve a symmetric address or die with a diagnostic naming `op`.
    pub(crate) fn resolve_or_abort(&self, addr: *const u8, op: &str) -> (WindowId, isize) {
        match window_offset(&self.sym.sheap, &self.sym.etext, addr) {
            Some(hit) => hit,
            None => self.fatal(
                1,
                &format!("{}: address {:p} is not symmetric", op, addr),
            ),
        }
    }

    pub(crate) fn check_pe(&self, pe: i32, op: &str) {
        if pe < 0 || pe >= self.world_size {
            self.fatal(1, &format!("{}: PE {} out of range [0, {})", op, pe, self.world_size));
        }
    }

    /// Peer-local address of a sheap location, via the shared base table.
    /// Indexing by world rank relies on node rank == world rank, which
    /// holds whenever the fast path is live.
    pub(crate) fn smp_peer_addr(&self, addr: *const u8, pe: i32) -> *mut u8 {
        debug_assert!(self.world_is_smp);
        debug_assert_eq!(self.smp_rank_list.get(pe as usize).copied(), Some(pe));
        let delta = addr as usize - self.sym.sheap.base_addr();
        (self.sym.smp_sheap_ptrs[pe as usize] + delta) as *mut u8
    }

    pub(crate) fn ok<T>(&self, r: crate::substrate::Result<T>) -> T {
        match r {
            Ok(v) => v,
            Err(e) => self.fatal(e.code, &e.to_string()),
        }
    }
}

// ============================================================================
// Sync primitives
// ============================================================================

/// Make peer writes visible to local loads (and vice versa): a processor
/// fence when the fast path is live, then a window sync on both regions.
pub(crate) fn local_sync(rt: &Runtime) {
    if cfg!(feature = "smp-optimizations") {
        cpu_fence(Ordering::SeqCst);
    }
    rt.ok(rt.sub.win_sync(rt.sym.sheap.win));
    rt.ok(rt.sub.win_sync(rt.sym.etext.win));
}

/// Remote completion of everything outstanding on both regions.
pub(crate) fn remote_sync(rt: &Runtime) {
    rt.ok(rt.sub.win_flush_all(rt.sym.sheap.win));
    rt.ok(rt.sub.win_flush_all(rt.sym.etext.win));
}

/// Order puts to each target: without ordered RMA this needs a full remote
/// flush, with it a local sync suffices.
pub(crate) fn fence(rt: &Runtime) {
    if !cfg!(feature = "rma-ordering") {
        remote_sync(rt);
    }
    local_sync(rt);
}

/// Remote completion of all outstanding operations, then local sync.
pub(crate) fn quiet(rt: &Runtime) {
    remote_sync(rt);
    local_sync(rt);
}

pub(crate) fn barrier_all(rt: &Runtime) {
    remote_sync(rt);
    local_sync(rt);
    rt.ok(rt.sub.barrier(rt.world));
}

// ============================================================================
// Put / get
// ============================================================================

pub(crate) fn put<T: Element>(rt: &Runtime, target: *mut T, source: *const T, nelems: usize, pe: i32) {
    if nelems == 0 {
        return;
    }
    rt.check_pe(pe, "put");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "put");
    let bytes = nelems * core::mem::size_of::<T>();

    if rt.smp_enabled && win_id == WindowId::Sheap {
        let dst = rt.smp_peer_addr(target as *const u8, pe);
        unsafe { ptr::copy_nonoverlapping(source as *const u8, dst, bytes) };
        return;
    }

    let win = rt.win_of(win_id);
    let (count, dtype) = contig_count(nelems, T::KIND);
    if cfg!(feature = "rma-ordering") {
        rt.ok(rt.sub.accumulate(
            win,
            source as *const u8,
            count,
            dtype,
            pe,
            offset,
            RmaOp::Replace,
        ));
    } else {
        rt.ok(rt.sub.put(win, source as *const u8, count, dtype, pe, offset));
    }
    rt.ok(rt.sub.win_flush_local(pe, win));
}

pub(crate) fn get<T: Element>(rt: &Runtime, target: *mut T, source: *const T, nelems: usize, pe: i32) {
    if nelems == 0 {
        return;
    }
    rt.check_pe(pe, "get");
    let (win_id, offset) = rt.resolve_or_abort(source as *const u8, "get");
    let bytes = nelems * core::mem::size_of::<T>();

    if rt.smp_enabled && win_id == WindowId::Sheap {
        let src = rt.smp_peer_addr(source as *const u8, pe);
        unsafe { ptr::copy_nonoverlapping(src as *const u8, target as *mut u8, bytes) };
        return;
    }

    let win = rt.win_of(win_id);
    let (count, dtype) = contig_count(nelems, T::KIND);
    if cfg!(feature = "rma-ordering") {
        rt.ok(rt.sub.get_accumulate(
            win,
            None,
            target as *mut u8,
            count,
            dtype,
            pe,
            offset,
            RmaOp::NoOp,
        ));
    } else {
        rt.ok(rt.sub.get(win, target as *mut u8, count, dtype, pe, offset));
    }
    rt.ok(rt.sub.win_flush_local(pe, win));
}

/// Strides are signed: a negative stride walks backward from the start
/// address. Only the i32 endpoints are excluded, so the element-offset
/// multiply cannot overflow.
pub(crate) fn checked_stride(rt: &Runtime, stride: isize, op: &str) -> i32 {
    if stride <= i32::MIN as isize || stride >= i32::MAX as isize {
        rt.fatal(
            1,
            &format!("{}: stride {} outside the range of a 32-bit integer", op, stride),
        );
    }
    stride as i32
}

pub(crate) fn put_strided<T: Element>(
    rt: &Runtime,
    target: *mut T,
    source: *const T,
    target_stride: isize,
    source_stride: isize,
    nelems: usize,
    pe: i32,
) {
    if nelems == 0 {
        return;
    }
    rt.check_pe(pe, "iput");
    if nelems > MAX_RMA_COUNT {
        rt.fatal(1, "iput: count exceeds the range of a 32-bit integer");
    }
    let tst = checked_stride(rt, target_stride, "iput");
    let sst = checked_stride(rt, source_stride, "iput");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "iput");
    let win = rt.win_of(win_id);
    rt.ok(rt.sub.put_strided(
        win,
        source as *const u8,
        sst,
        nelems as i32,
        Datatype::new(T::KIND),
        pe,
        offset,
        tst,
    ));
    rt.ok(rt.sub.win_flush_local(pe, win));
}

pub(crate) fn get_strided<T: Element>(
    rt: &Runtime,
    target: *mut T,
    source: *const T,
    target_stride: isize,
    source_stride: isize,
    nelems: usize,
    pe: i32,
) {
    if nelems == 0 {
        return;
    }
    rt.check_pe(pe, "iget");
    if nelems > MAX_RMA_COUNT {
        rt.fatal(1, "iget: count exceeds the range of a 32-bit integer");
    }
    let tst = checked_stride(rt, target_stride, "iget");
    let sst = checked_stride(rt, source_stride, "iget");
    let (win_id, offset) = rt.resolve_or_abort(source as *const u8, "iget");
    let win = rt.win_of(win_id);
    rt.ok(rt.sub.get_strided(
        win,
        target as *mut u8,
        tst,
        nelems as i32,
        Datatype::new(T::KIND),
        pe,
        offset,
        sst,
    ));
    rt.ok(rt.sub.win_flush_local(pe, win));
}

// ============================================================================
// Fast-path processor atomics
// ============================================================================
// The fast path bypasses the substrate entirely, so it carries its own
// word-sized atomic helpers; only integer element types ever reach them.

unsafe fn fast_load(p: *mut u8, size: usize) -> u64 {
    match size {
        4 => (*(p as *const AtomicU32)).load(Ordering::SeqCst) as u64,
        8 => (*(p as *const AtomicU64)).load(Ordering::SeqCst),
        _ => unreachable!("fast path element size {}", size),
    }
}

unsafe fn fast_store(p: *mut u8, size: usize, bits: u64) {
    match size {
        4 => (*(p as *const AtomicU32)).store(bits as u32, Ordering::SeqCst),
        8 => (*(p as *const AtomicU64)).store(bits, Ordering::SeqCst),
        _ => unreachable!("fast path element size {}", size),
    }
}

unsafe fn fast_swap(p: *mut u8, size: usize, bits: u64) -> u64 {
    match size {
        4 => (*(p as *const AtomicU32)).swap(bits as u32, Ordering::SeqCst) as u64,
        8 => (*(p as *const AtomicU64)).swap(bits, Ordering::SeqCst),
        _ => unreachable!("fast path element size {}", size),
    }
}

unsafe fn fast_add(p: *mut u8, size: usize, bits: u64) -> u64 {
    match size {
        4 => (*(p as *const AtomicU32)).fetch_add(bits as u32, Ordering::SeqCst) as u64,
        8 => (*(p as *const AtomicU64)).fetch_add(bits, Ordering::SeqCst),
        _ => unreachable!("fast path element size {}", size),
    }
}

unsafe fn fast_cas(p: *mut u8, size: usize, compare: u64, bits: u64) -> u64 {
    match size {
        4 => {
            let a = &*(p as *const AtomicU32);
            match a.compare_exchange(compare as u32, bits as u32, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(old) | Err(old) => old as u64,
            }
        }
        8 => {
            let a = &*(p as *const AtomicU64);
            match a.compare_exchange(compare, bits, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(old) | Err(old) => old,
            }
        }
        _ => unreachable!("fast path element size {}", size),
    }
}

/// True when this atomic may bypass the substrate for `T` at `win_id`.
fn fast_atomic_ok<T: AtomicValue>(rt: &Runtime, win_id: WindowId) -> bool {
    rt.smp_enabled && win_id == WindowId::Sheap && T::FAST_ATOMIC
}

// ============================================================================
// Atomics
// ============================================================================

pub(crate) fn swap<T: AtomicValue>(rt: &Runtime, target: *mut T, value: T, pe: i32) -> T {
    rt.check_pe(pe, "swap");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "swap");

    if fast_atomic_ok::<T>(rt, win_id) {
        let p = rt.smp_peer_addr(target as *const u8, pe);
        let old = unsafe { fast_swap(p, core::mem::size_of::<T>(), value.to_bits64()) };
        return T::from_bits64(old);
    }

    let win = rt.win_of(win_id);
    let mut old = value;
    rt.ok(rt.sub.fetch_and_op(
        win,
        Some(&value as *const T as *const u8),
        &mut old as *mut T as *mut u8,
        T::datatype(),
        pe,
        offset,
        RmaOp::Replace,
    ));
    rt.ok(rt.sub.win_flush(pe, win));
    old
}

pub(crate) fn cswap<T: AtomicInt>(rt: &Runtime, target: *mut T, cond: T, value: T, pe: i32) -> T {
    rt.check_pe(pe, "cswap");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "cswap");

    if fast_atomic_ok::<T>(rt, win_id) {
        let p = rt.smp_peer_addr(target as *const u8, pe);
        let old = unsafe {
            fast_cas(
                p,
                core::mem::size_of::<T>(),
                cond.to_bits64(),
                value.to_bits64(),
            )
        };
        return T::from_bits64(old);
    }

    let win = rt.win_of(win_id);
    let mut old = value;
    rt.ok(rt.sub.compare_and_swap(
        win,
        &value as *const T as *const u8,
        &cond as *const T as *const u8,
        &mut old as *mut T as *mut u8,
        T::datatype(),
        pe,
        offset,
    ));
    rt.ok(rt.sub.win_flush(pe, win));
    old
}

pub(crate) fn fadd<T: AtomicInt>(rt: &Runtime, target: *mut T, value: T, pe: i32) -> T {
    rt.check_pe(pe, "fadd");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "fadd");

    if fast_atomic_ok::<T>(rt, win_id) {
        let p = rt.smp_peer_addr(target as *const u8, pe);
        let old = unsafe { fast_add(p, core::mem::size_of::<T>(), value.to_bits64()) };
        return T::from_bits64(old);
    }

    let win = rt.win_of(win_id);
    let mut old = value;
    rt.ok(rt.sub.fetch_and_op(
        win,
        Some(&value as *const T as *const u8),
        &mut old as *mut T as *mut u8,
        T::datatype(),
        pe,
        offset,
        RmaOp::Sum,
    ));
    rt.ok(rt.sub.win_flush(pe, win));
    old
}

pub(crate) fn add<T: AtomicInt>(rt: &Runtime, target: *mut T, value: T, pe: i32) {
    rt.check_pe(pe, "add");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "add");

    if fast_atomic_ok::<T>(rt, win_id) {
        let p = rt.smp_peer_addr(target as *const u8, pe);
        unsafe { fast_add(p, core::mem::size_of::<T>(), value.to_bits64()) };
        return;
    }

    let win = rt.win_of(win_id);
    rt.ok(rt.sub.accumulate(
        win,
        &value as *const T as *const u8,
        1,
        T::datatype(),
        pe,
        offset,
        RmaOp::Sum,
    ));
    rt.ok(rt.sub.win_flush(pe, win));
}

pub(crate) fn finc<T: AtomicInt>(rt: &Runtime, target: *mut T, pe: i32) -> T {
    fadd(rt, target, T::one(), pe)
}

pub(crate) fn inc<T: AtomicInt>(rt: &Runtime, target: *mut T, pe: i32) {
    add(rt, target, T::one(), pe)
}

pub(crate) fn fetch<T: AtomicValue>(rt: &Runtime, source: *const T, pe: i32) -> T {
    rt.check_pe(pe, "fetch");
    let (win_id, offset) = rt.resolve_or_abort(source as *const u8, "fetch");

    if fast_atomic_ok::<T>(rt, win_id) {
        let p = rt.smp_peer_addr(source as *const u8, pe);
        let old = unsafe { fast_load(p, core::mem::size_of::<T>()) };
        return T::from_bits64(old);
    }

    let win = rt.win_of(win_id);
    let mut out = T::from_bits64(0);
    rt.ok(rt.sub.fetch_and_op(
        win,
        None,
        &mut out as *mut T as *mut u8,
        T::datatype(),
        pe,
        offset,
        RmaOp::NoOp,
    ));
    rt.ok(rt.sub.win_flush(pe, win));
    out
}

pub(crate) fn set<T: AtomicValue>(rt: &Runtime, target: *mut T, value: T, pe: i32) {
    rt.check_pe(pe, "set");
    let (win_id, offset) = rt.resolve_or_abort(target as *const u8, "set");

    if fast_atomic_ok::<T>(rt, win_id) {
        let p = rt.smp_peer_addr(target as *const u8, pe);
        unsafe { fast_store(p, core::mem::size_of::<T>(), value.to_bits64()) };
        return;
    }

    let win = rt.win_of(win_id);
    rt.ok(rt.sub.accumulate(
        win,
        &value as *const T as *const u8,
        1,
        T::datatype(),
        pe,
        offset,
        RmaOp::Replace,
    ));
    rt.ok(rt.sub.win_flush(pe, win));
}
