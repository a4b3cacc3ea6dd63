//! Distributed MCS lock over remote atomics.
//!
//! A dedicated lock window hosts one queue record per PE; the global queue
//! tail lives in PE 0's record by convention. There is no in-process
//! pointer graph: the queue links are plain PE ranks updated with remote
//! fetch-and-op / compare-and-swap, and every waiter spins on a single
//! well-known slot of its own record. Every remote update is followed by a
//! flush on the lock window so the queue makes progress before control
//! returns to the user.

use core::ptr;

use crate::runtime::{check, Runtime};
use crate::substrate::{Comm, Datatype, Kind, RmaOp, Substrate, Win, WinHints};

/// Slot layout of the per-PE queue record (i32 slots).
const PREV_DISP: isize = 0;
/// Rank of the successor waiting on this PE.
const NEXT_DISP: isize = 4;
/// Queue tail; meaningful on PE 0 only.
const TAIL_DISP: isize = 8;
/// Spin slot: the releasing PE writes its rank here.
const SPIN_DISP: isize = 12;

const RECORD_BYTES: usize = 16;

/// "No PE": empty tail, no successor, no release signal.
const NIL: i32 = -1;

pub(crate) struct LockState {
    pub win: Win,
    /// Local base of this PE's queue record.
    pub base: *mut u8,
}

fn dt() -> Datatype {
    Datatype::new(Kind::Int32)
}

/// Collective creation of the lock window; leaves every record at
/// `(-1, -1, -1, -1)` and the window locked for the process lifetime.
pub(crate) fn create(sub: &dyn Substrate, world: Comm) -> LockState {
    let hints = WinHints {
        same_size: true,
        ..WinHints::default()
    };
    let (win, base) = check(sub, sub.win_allocate(world, RECORD_BYTES, hints));
    unsafe {
        let slots = base as *mut i32;
        for i in 0..4 {
            ptr::write(slots.add(i), NIL);
        }
    }
    check(sub, sub.win_lock_all(win));
    check(sub, sub.barrier(world));
    LockState { win, base }
}

pub(crate) fn destroy(sub: &dyn Substrate, state: &LockState) {
    check(sub, sub.win_unlock_all(state.win));
    check(sub, sub.win_free(state.win));
}

/// Spin on a slot of the local record until it is not NIL; returns the
/// observed value.
fn spin_local(rt: &Runtime, disp: isize) -> i32 {
    let slot = unsafe { rt.lock.base.offset(disp) } as *const i32;
    loop {
        rt.ok(rt.sub.win_sync(rt.lock.win));
        let v = unsafe { ptr::read_volatile(slot) };
        if v != NIL {
            return v;
        }
        core::hint::spin_loop();
    }
}

/// Atomically overwrite one slot of PE `pe`'s record.
fn store_slot(rt: &Runtime, pe: i32, disp: isize, value: i32) {
    rt.ok(rt.sub.accumulate(
        rt.lock.win,
        &value as *const i32 as *const u8,
        1,
        dt(),
        pe,
        disp,
        RmaOp::Replace,
    ));
    rt.ok(rt.sub.win_flush(pe, rt.lock.win));
}

fn fetch_slot(rt: &Runtime, pe: i32, disp: isize) -> i32 {
    let mut out = NIL;
    rt.ok(rt.sub.fetch_and_op(
        rt.lock.win,
        None,
        &mut out as *mut i32 as *mut u8,
        dt(),
        pe,
        disp,
        RmaOp::NoOp,
    ));
    rt.ok(rt.sub.win_flush(pe, rt.lock.win));
    out
}

/// Swap `value` into a slot, returning the previous occupant.
fn swap_slot(rt: &Runtime, pe: i32, disp: isize, value: i32) -> i32 {
    let mut old = NIL;
    rt.ok(rt.sub.fetch_and_op(
        rt.lock.win,
        Some(&value as *const i32 as *const u8),
        &mut old as *mut i32 as *mut u8,
        dt(),
        pe,
        disp,
        RmaOp::Replace,
    ));
    rt.ok(rt.sub.win_flush(pe, rt.lock.win));
    old
}

fn cas_slot(rt: &Runtime, pe: i32, disp: isize, compare: i32, value: i32) -> i32 {
    let mut old = NIL;
    rt.ok(rt.sub.compare_and_swap(
        rt.lock.win,
        &value as *const i32 as *const u8,
        &compare as *const i32 as *const u8,
        &mut old as *mut i32 as *mut u8,
        dt(),
        pe,
        disp,
    ));
    rt.ok(rt.sub.win_flush(pe, rt.lock.win));
    old
}

/// Enter the queue; returns once the lock is held.
pub(crate) fn acquire(rt: &Runtime) {
    let me = rt.world_rank;

    // Swing the tail to ourselves; the previous tail is our predecessor.
    let predecessor = swap_slot(rt, 0, TAIL_DISP, me);
    store_slot(rt, me, PREV_DISP, predecessor);

    if predecessor == NIL {
        // Empty queue: the lock is held immediately.
        return;
    }

    // Publish ourselves as the predecessor's successor, then wait for its
    // release signal on our own spin slot.
    store_slot(rt, predecessor, NEXT_DISP, me);
    spin_local(rt, SPIN_DISP);
    store_slot(rt, me, SPIN_DISP, NIL);
}

/// Leave the critical section and hand the lock to the successor, if any.
pub(crate) fn release(rt: &Runtime) {
    let me = rt.world_rank;

    let mut successor = fetch_slot(rt, me, NEXT_DISP);
    if successor == NIL {
        // Nobody visibly queued; try to swing the tail back to empty.
        let tail = cas_slot(rt, 0, TAIL_DISP, me, NIL);
        if tail == me {
            store_slot(rt, me, PREV_DISP, NIL);
            return;
        }
        // A successor is mid-enqueue: wait for it to publish itself.
        successor = spin_local(rt, NEXT_DISP);
    }

    store_slot(rt, successor, SPIN_DISP, me);
    store_slot(rt, me, NEXT_DISP, NIL);
    store_slot(rt, me, PREV_DISP, NIL);
}

/// One-shot acquisition attempt: take the tail only if the queue is empty.
/// Touches no other queue state.
pub(crate) fn try_acquire(rt: &Runtime) -> bool {
    let me = rt.world_rank;
    cas_slot(rt, 0, TAIL_DISP, NIL, me) == NIL
}
