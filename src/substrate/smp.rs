//! Intra-process shared-memory transport.
//!
//! Every PE of the world runs as one thread of the current process, so the
//! whole world is a single shared-memory node by construction. Windows are
//! ordinary heap allocations published through a shared base-pointer table;
//! RMA is a synchronous memory copy; atomics are processor atomics on the
//! target word (with a per-window mutex for element sizes that have no
//! native atomic); collectives rendezvous on a generation-counted monitor
//! with per-rank deposit slots.
//!
//! Windows follow the UNIFIED model: flushes and syncs lower to memory
//! fences because every copy is complete when the call returns.

use std::alloc::{self, Layout};
use std::ptr;
use std::sync::atomic::{
    fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use num_complex::Complex;
use num_traits::{Float, PrimInt, WrappingAdd, WrappingMul};

use super::{
    Comm, Datatype, Group, Kind, ReduceOp, Result, RmaOp, Substrate, SubstrateError, Threading,
    Win, WinHints, RANK_UNDEFINED,
};

/// Window memory alignment (one page, so any element type is aligned).
const PAGE_ALIGN: usize = 4096;

/// How often a blocked collective re-checks the poison flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn err(msg: impl Into<String>) -> SubstrateError {
    SubstrateError::new(1, msg)
}

// ============================================================================
// Collective rendezvous
// ============================================================================

struct CollShared {
    arrived: usize,
    generation: u64,
    slots: Vec<Vec<u8>>,
}

/// Monitor shared by the members of one communicator.
struct CollPoint {
    shared: Mutex<CollShared>,
    cv: Condvar,
}

impl CollPoint {
    fn new(n: usize) -> Self {
        Self {
            shared: Mutex::new(CollShared {
                arrived: 0,
                generation: 0,
                slots: vec![Vec::new(); n],
            }),
            cv: Condvar::new(),
        }
    }

    /// Generation-counted barrier. Panics if a peer PE died while we wait,
    /// so a failed test does not hang the whole world.
    fn barrier(&self, n: usize, node: &SmpNode) {
        let mut g = self.shared.lock().unwrap();
        g.arrived += 1;
        if g.arrived == n {
            g.arrived = 0;
            g.generation = g.generation.wrapping_add(1);
            self.cv.notify_all();
            return;
        }
        let gen = g.generation;
        while g.generation == gen {
            if node.poisoned() {
                panic!("collective abandoned: a peer PE failed");
            }
            let (guard, _) = self.cv.wait_timeout(g, POLL_INTERVAL).unwrap();
            g = guard;
        }
    }

    /// Deposit `data` in the caller's slot and return everyone's deposit.
    /// The trailing barrier keeps the slots stable until all members read.
    fn exchange(&self, n: usize, me: usize, data: Vec<u8>, node: &SmpNode) -> Vec<Vec<u8>> {
        {
            let mut g = self.shared.lock().unwrap();
            if g.slots.len() != n {
                g.slots = vec![Vec::new(); n];
            }
            g.slots[me] = data;
        }
        self.barrier(n, node);
        let all = self.shared.lock().unwrap().slots.clone();
        self.barrier(n, node);
        all
    }
}

// ============================================================================
// Registries
// ============================================================================

struct CommState {
    /// World ranks, indexed by communicator-local rank.
    ranks: Vec<i32>,
    coll: Arc<CollPoint>,
    /// Members that have not yet freed this communicator.
    alive: AtomicUsize,
}

struct WinState {
    comm: Comm,
    /// Per-window-rank segment base addresses.
    bases: Vec<usize>,
    size: usize,
    /// The transport allocated (and must release) the segments.
    owned: bool,
    /// Created via the shared-memory spelling; enables `win_shared_query`.
    shared: bool,
    /// Serializes accumulate-class updates on element sizes that have no
    /// native processor atomic.
    op_lock: Mutex<()>,
}

/// A communicator creation in flight; members join in call order, so
/// back-to-back creations of the same group pair up correctly.
struct PendingComm {
    ranks: Vec<i32>,
    tag: i32,
    id: u32,
    joined: Vec<i32>,
}

/// State shared by every endpoint of one world.
pub struct SmpNode {
    npes: i32,
    epoch: Instant,
    poisoned: AtomicBool,
    comms: spin::RwLock<Vec<Option<CommState>>>,
    groups: spin::RwLock<Vec<Option<Vec<i32>>>>,
    wins: spin::RwLock<Vec<Option<Arc<WinState>>>>,
    pending: Mutex<Vec<PendingComm>>,
}

impl SmpNode {
    pub fn new(npes: i32) -> Arc<Self> {
        assert!(npes >= 1, "world must contain at least one PE");
        let world = CommState {
            ranks: (0..npes).collect(),
            coll: Arc::new(CollPoint::new(npes as usize)),
            alive: AtomicUsize::new(npes as usize),
        };
        Arc::new(Self {
            npes,
            epoch: Instant::now(),
            poisoned: AtomicBool::new(false),
            comms: spin::RwLock::new(vec![Some(world)]),
            groups: spin::RwLock::new(Vec::new()),
            wins: spin::RwLock::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn npes(&self) -> i32 {
        self.npes
    }

    /// Mark the world as failed; peers blocked in a collective will panic
    /// instead of waiting forever.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    fn poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn insert_comm(&self, state: CommState) -> u32 {
        let mut comms = self.comms.write();
        comms.push(Some(state));
        (comms.len() - 1) as u32
    }

    fn insert_group(&self, ranks: Vec<i32>) -> u32 {
        let mut groups = self.groups.write();
        groups.push(Some(ranks));
        (groups.len() - 1) as u32
    }

    fn insert_win(&self, state: WinState) -> u32 {
        let mut wins = self.wins.write();
        wins.push(Some(Arc::new(state)));
        (wins.len() - 1) as u32
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Per-PE endpoint of an [`SmpNode`] world.
pub struct SmpTransport {
    node: Arc<SmpNode>,
    rank: i32,
}

impl SmpTransport {
    pub fn new(node: Arc<SmpNode>, rank: i32) -> Self {
        assert!(rank >= 0 && rank < node.npes());
        Self { node, rank }
    }

    pub fn node(&self) -> &Arc<SmpNode> {
        &self.node
    }

    fn comm_parts(&self, comm: Comm) -> Result<(Vec<i32>, Arc<CollPoint>, usize, usize)> {
        let comms = self.node.comms.read();
        let state = comms
            .get(comm.0 as usize)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| err(format!("invalid communicator handle {:?}", comm)))?;
        let me = state
            .ranks
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| err("calling PE is not a member of the communicator"))?;
        Ok((state.ranks.clone(), Arc::clone(&state.coll), me, state.ranks.len()))
    }

    fn group_ranks(&self, group: Group) -> Result<Vec<i32>> {
        let groups = self.node.groups.read();
        groups
            .get(group.0 as usize)
            .and_then(|g| g.clone())
            .ok_or_else(|| err(format!("invalid group handle {:?}", group)))
    }

    fn win_state(&self, win: Win) -> Result<Arc<WinState>> {
        let wins = self.node.wins.read();
        wins.get(win.0 as usize)
            .and_then(|w| w.clone())
            .ok_or_else(|| err(format!("invalid window handle {:?}", win)))
    }

    /// Validate and resolve an RMA target span.
    fn rma_target(&self, st: &WinState, pe: i32, offset: isize, bytes: usize) -> Result<*mut u8> {
        if pe < 0 || pe as usize >= st.bases.len() {
            return Err(err(format!("RMA target rank {} out of range", pe)));
        }
        if offset < 0 || offset as usize + bytes > st.size {
            return Err(err(format!(
                "RMA span [{}, {}) exceeds window size {}",
                offset,
                offset + bytes as isize,
                st.size
            )));
        }
        Ok((st.bases[pe as usize] + offset as usize) as *mut u8)
    }

    fn win_common(
        &self,
        comm: Comm,
        size: usize,
        base: *mut u8,
        owned: bool,
        shared: bool,
    ) -> Result<Win> {
        let (_, coll, me, n) = self.comm_parts(comm)?;

        let deposit = (base as usize as u64).to_ne_bytes().to_vec();
        let all = coll.exchange(n, me, deposit, &self.node);
        let mut bases = Vec::with_capacity(n);
        for slot in &all {
            let raw: [u8; 8] = slot
                .as_slice()
                .try_into()
                .map_err(|_| err("window base exchange corrupted"))?;
            bases.push(u64::from_ne_bytes(raw) as usize);
        }

        let id = if me == 0 {
            self.node.insert_win(WinState {
                comm,
                bases,
                size,
                owned,
                shared,
                op_lock: Mutex::new(()),
            })
        } else {
            0
        };
        let deposit = if me == 0 {
            id.to_ne_bytes().to_vec()
        } else {
            Vec::new()
        };
        let all = coll.exchange(n, me, deposit, &self.node);
        let raw: [u8; 4] = all[0]
            .as_slice()
            .try_into()
            .map_err(|_| err("window id exchange corrupted"))?;
        Ok(Win(u32::from_ne_bytes(raw)))
    }

    fn alloc_segment(size: usize) -> Result<*mut u8> {
        let layout = Layout::from_size_align(size.max(1), PAGE_ALIGN)
            .map_err(|_| err("bad window layout"))?;
        // Window memory starts zeroed, like freshly mapped shared memory.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(err(format!("window allocation of {} bytes failed", size)));
        }
        Ok(base)
    }
}

// ============================================================================
// Element-wise helpers
// ============================================================================

unsafe fn atomic_load_bits(ptr: *mut u8, size: usize) -> u64 {
    match size {
        4 => (*(ptr as *const AtomicU32)).load(Ordering::SeqCst) as u64,
        8 => (*(ptr as *const AtomicU64)).load(Ordering::SeqCst),
        _ => unreachable!("no native atomic for size {}", size),
    }
}

unsafe fn atomic_store_bits(ptr: *mut u8, size: usize, val: u64) {
    match size {
        4 => (*(ptr as *const AtomicU32)).store(val as u32, Ordering::SeqCst),
        8 => (*(ptr as *const AtomicU64)).store(val, Ordering::SeqCst),
        _ => unreachable!("no native atomic for size {}", size),
    }
}

unsafe fn atomic_swap_bits(ptr: *mut u8, size: usize, val: u64) -> u64 {
    match size {
        4 => (*(ptr as *const AtomicU32)).swap(val as u32, Ordering::SeqCst) as u64,
        8 => (*(ptr as *const AtomicU64)).swap(val, Ordering::SeqCst),
        _ => unreachable!("no native atomic for size {}", size),
    }
}

unsafe fn atomic_cas_bits(ptr: *mut u8, size: usize, compare: u64, val: u64) -> u64 {
    match size {
        4 => {
            let a = &*(ptr as *const AtomicU32);
            match a.compare_exchange(compare as u32, val as u32, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(old) | Err(old) => old as u64,
            }
        }
        8 => {
            let a = &*(ptr as *const AtomicU64);
            match a.compare_exchange(compare, val, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(old) | Err(old) => old,
            }
        }
        _ => unreachable!("no native atomic for size {}", size),
    }
}

/// Atomic add with the arithmetic of `kind`; returns the previous bits.
unsafe fn atomic_add_bits(ptr: *mut u8, kind: Kind, val: u64) -> u64 {
    match kind {
        Kind::Int32 | Kind::Uint32 => {
            (*(ptr as *const AtomicU32)).fetch_add(val as u32, Ordering::SeqCst) as u64
        }
        Kind::Int64 | Kind::Uint64 => (*(ptr as *const AtomicU64)).fetch_add(val, Ordering::SeqCst),
        Kind::Float => {
            let a = &*(ptr as *const AtomicU32);
            let mut old = a.load(Ordering::SeqCst);
            loop {
                let new = (f32::from_bits(old) + f32::from_bits(val as u32)).to_bits();
                match a.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => return old as u64,
                    Err(cur) => old = cur,
                }
            }
        }
        Kind::Double => {
            let a = &*(ptr as *const AtomicU64);
            let mut old = a.load(Ordering::SeqCst);
            loop {
                let new = (f64::from_bits(old) + f64::from_bits(val)).to_bits();
                match a.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => return old as u64,
                    Err(cur) => old = cur,
                }
            }
        }
        _ => unreachable!("atomic add is not defined for {:?}", kind),
    }
}

unsafe fn read_bits(ptr: *const u8, size: usize) -> u64 {
    let mut bits = [0u8; 8];
    ptr::copy_nonoverlapping(ptr, bits.as_mut_ptr(), size);
    u64::from_ne_bytes(bits)
}

unsafe fn write_bits(ptr: *mut u8, size: usize, val: u64) {
    let bits = val.to_ne_bytes();
    ptr::copy_nonoverlapping(bits.as_ptr(), ptr, size);
}

const fn has_native_atomic(size: usize) -> bool {
    size == 4 || size == 8
}

unsafe fn fold_in_place<T: Copy>(acc: *mut u8, x: *const u8, n: usize, f: impl Fn(T, T) -> T) {
    let a = acc as *mut T;
    let b = x as *const T;
    for i in 0..n {
        let v = f(a.add(i).read_unaligned(), b.add(i).read_unaligned());
        a.add(i).write_unaligned(v);
    }
}

fn fold_int<T>(op: ReduceOp, acc: &mut [u8], x: &[u8], n: usize) -> Result<()>
where
    T: PrimInt + WrappingAdd + WrappingMul + Copy,
{
    let a = acc.as_mut_ptr();
    let b = x.as_ptr();
    unsafe {
        match op {
            ReduceOp::Sum => fold_in_place::<T>(a, b, n, |p, q| p.wrapping_add(&q)),
            ReduceOp::Prod => fold_in_place::<T>(a, b, n, |p, q| p.wrapping_mul(&q)),
            ReduceOp::Min => fold_in_place::<T>(a, b, n, |p, q| p.min(q)),
            ReduceOp::Max => fold_in_place::<T>(a, b, n, |p, q| p.max(q)),
            ReduceOp::Band => fold_in_place::<T>(a, b, n, |p, q| p & q),
            ReduceOp::Bor => fold_in_place::<T>(a, b, n, |p, q| p | q),
            ReduceOp::Bxor => fold_in_place::<T>(a, b, n, |p, q| p ^ q),
            ReduceOp::Land => fold_in_place::<T>(a, b, n, |p, q| {
                if !p.is_zero() && !q.is_zero() {
                    T::one()
                } else {
                    T::zero()
                }
            }),
        }
    }
    Ok(())
}

fn fold_float<T>(op: ReduceOp, acc: &mut [u8], x: &[u8], n: usize) -> Result<()>
where
    T: Float + Copy,
{
    let a = acc.as_mut_ptr();
    let b = x.as_ptr();
    unsafe {
        match op {
            ReduceOp::Sum => fold_in_place::<T>(a, b, n, |p, q| p + q),
            ReduceOp::Prod => fold_in_place::<T>(a, b, n, |p, q| p * q),
            ReduceOp::Min => fold_in_place::<T>(a, b, n, |p, q| p.min(q)),
            ReduceOp::Max => fold_in_place::<T>(a, b, n, |p, q| p.max(q)),
            _ => return Err(err(format!("reduction {:?} is not defined for floats", op))),
        }
    }
    Ok(())
}

fn fold_complex<T>(op: ReduceOp, acc: &mut [u8], x: &[u8], n: usize) -> Result<()>
where
    T: Float + Copy + 'static,
{
    let a = acc.as_mut_ptr();
    let b = x.as_ptr();
    unsafe {
        match op {
            ReduceOp::Sum => fold_in_place::<Complex<T>>(a, b, n, |p, q| p + q),
            ReduceOp::Prod => fold_in_place::<Complex<T>>(a, b, n, |p, q| p * q),
            _ => {
                return Err(err(format!(
                    "reduction {:?} is not defined for complex elements",
                    op
                )))
            }
        }
    }
    Ok(())
}

fn apply_reduce(kind: Kind, op: ReduceOp, acc: &mut [u8], x: &[u8], n: usize) -> Result<()> {
    match kind {
        Kind::Int8 => fold_int::<i8>(op, acc, x, n),
        Kind::Int16 => fold_int::<i16>(op, acc, x, n),
        Kind::Int32 => fold_int::<i32>(op, acc, x, n),
        Kind::Int64 => fold_int::<i64>(op, acc, x, n),
        Kind::Uint8 => fold_int::<u8>(op, acc, x, n),
        Kind::Uint16 => fold_int::<u16>(op, acc, x, n),
        Kind::Uint32 => fold_int::<u32>(op, acc, x, n),
        Kind::Uint64 => fold_int::<u64>(op, acc, x, n),
        Kind::Float => fold_float::<f32>(op, acc, x, n),
        Kind::Double => fold_float::<f64>(op, acc, x, n),
        Kind::Complex32 => fold_complex::<f32>(op, acc, x, n),
        Kind::Complex64 => fold_complex::<f64>(op, acc, x, n),
    }
}

// ============================================================================
// Substrate implementation
// ============================================================================

impl Substrate for SmpTransport {
    fn provided(&self) -> Threading {
        Threading::Multiple
    }

    fn wtime(&self) -> f64 {
        self.node.epoch.elapsed().as_secs_f64()
    }

    fn abort(&self, code: i32) -> ! {
        self.node.poison();
        std::process::exit(code)
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn comm_world(&self) -> Comm {
        Comm(0)
    }

    fn comm_dup(&self, comm: Comm) -> Result<Comm> {
        let (ranks, coll, me, n) = self.comm_parts(comm)?;
        let deposit = if me == 0 {
            let id = self.node.insert_comm(CommState {
                ranks: ranks.clone(),
                coll: Arc::new(CollPoint::new(n)),
                alive: AtomicUsize::new(n),
            });
            id.to_ne_bytes().to_vec()
        } else {
            Vec::new()
        };
        let all = coll.exchange(n, me, deposit, &self.node);
        let raw: [u8; 4] = all[0]
            .as_slice()
            .try_into()
            .map_err(|_| err("communicator id exchange corrupted"))?;
        Ok(Comm(u32::from_ne_bytes(raw)))
    }

    fn comm_split_node(&self, comm: Comm) -> Result<Comm> {
        // Threads of one process always share a node, so the node
        // communicator has the same membership as the input.
        self.comm_dup(comm)
    }

    fn comm_rank(&self, comm: Comm) -> Result<i32> {
        let (_, _, me, _) = self.comm_parts(comm)?;
        Ok(me as i32)
    }

    fn comm_size(&self, comm: Comm) -> Result<i32> {
        let (_, _, _, n) = self.comm_parts(comm)?;
        Ok(n as i32)
    }

    fn comm_same_members(&self, a: Comm, b: Comm) -> Result<bool> {
        let (ra, _, _, _) = self.comm_parts(a)?;
        let (rb, _, _, _) = self.comm_parts(b)?;
        Ok(ra == rb)
    }

    fn comm_group(&self, comm: Comm) -> Result<Group> {
        let (ranks, _, _, _) = self.comm_parts(comm)?;
        Ok(Group(self.node.insert_group(ranks)))
    }

    fn comm_create_group(&self, comm: Comm, group: Group, tag: i32) -> Result<Comm> {
        self.comm_parts(comm)?;
        let members = self.group_ranks(group)?;
        if !members.contains(&self.rank) {
            return Err(err("comm_create_group: calling PE is not in the group"));
        }

        let mut pending = self.node.pending.lock().unwrap();
        // Join the oldest in-flight creation of this group that we have not
        // joined yet; creations therefore pair up in call order.
        for i in 0..pending.len() {
            let entry = &mut pending[i];
            if entry.ranks == members && entry.tag == tag && !entry.joined.contains(&self.rank) {
                entry.joined.push(self.rank);
                let id = entry.id;
                if entry.joined.len() == members.len() {
                    pending.swap_remove(i);
                }
                return Ok(Comm(id));
            }
        }

        let id = self.node.insert_comm(CommState {
            ranks: members.clone(),
            coll: Arc::new(CollPoint::new(members.len())),
            alive: AtomicUsize::new(members.len()),
        });
        if members.len() > 1 {
            pending.push(PendingComm {
                ranks: members,
                tag,
                id,
                joined: vec![self.rank],
            });
        }
        Ok(Comm(id))
    }

    fn comm_free(&self, comm: Comm) -> Result<()> {
        if comm.0 == 0 {
            return Err(err("the world communicator cannot be freed"));
        }
        let remaining = {
            let comms = self.node.comms.read();
            let state = comms
                .get(comm.0 as usize)
                .and_then(|s| s.as_ref())
                .ok_or_else(|| err(format!("invalid communicator handle {:?}", comm)))?;
            state.alive.fetch_sub(1, Ordering::SeqCst) - 1
        };
        if remaining == 0 {
            self.node.comms.write()[comm.0 as usize] = None;
        }
        Ok(())
    }

    fn group_incl(&self, group: Group, ranks: &[i32]) -> Result<Group> {
        let base = self.group_ranks(group)?;
        let mut incl = Vec::with_capacity(ranks.len());
        for &r in ranks {
            let world = *base
                .get(r as usize)
                .ok_or_else(|| err(format!("group_incl: rank {} out of range", r)))?;
            incl.push(world);
        }
        Ok(Group(self.node.insert_group(incl)))
    }

    fn group_translate_ranks(&self, from: Group, ranks: &[i32], to: Group) -> Result<Vec<i32>> {
        let from_ranks = self.group_ranks(from)?;
        let to_ranks = self.group_ranks(to)?;
        let mut out = Vec::with_capacity(ranks.len());
        for &r in ranks {
            let world = *from_ranks
                .get(r as usize)
                .ok_or_else(|| err(format!("translate: rank {} out of range", r)))?;
            out.push(
                to_ranks
                    .iter()
                    .position(|&w| w == world)
                    .map_or(RANK_UNDEFINED, |p| p as i32),
            );
        }
        Ok(out)
    }

    fn group_free(&self, group: Group) -> Result<()> {
        let mut groups = self.node.groups.write();
        match groups.get_mut(group.0 as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(err(format!("invalid group handle {:?}", group))),
        }
    }

    fn barrier(&self, comm: Comm) -> Result<()> {
        let (_, coll, _, n) = self.comm_parts(comm)?;
        coll.barrier(n, &self.node);
        Ok(())
    }

    fn bcast(
        &self,
        comm: Comm,
        buf: *mut u8,
        count: i32,
        dtype: Datatype,
        root: i32,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("bcast: negative count"));
        }
        let (_, coll, me, n) = self.comm_parts(comm)?;
        if root < 0 || root as usize >= n {
            return Err(err(format!("bcast: root {} out of range", root)));
        }
        let bytes = count as usize * dtype.extent();
        let deposit = if me == root as usize {
            unsafe { std::slice::from_raw_parts(buf, bytes).to_vec() }
        } else {
            Vec::new()
        };
        let all = coll.exchange(n, me, deposit, &self.node);
        if me != root as usize {
            let src = &all[root as usize];
            if src.len() != bytes {
                return Err(err("bcast: mismatched payload size"));
            }
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), buf, bytes) };
        }
        Ok(())
    }

    fn allgather(
        &self,
        comm: Comm,
        send: *const u8,
        recv: *mut u8,
        count: i32,
        dtype: Datatype,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("allgather: negative count"));
        }
        let (_, coll, me, n) = self.comm_parts(comm)?;
        let chunk = count as usize * dtype.extent();
        let deposit = unsafe { std::slice::from_raw_parts(send, chunk).to_vec() };
        let all = coll.exchange(n, me, deposit, &self.node);
        for (r, slot) in all.iter().enumerate() {
            if slot.len() != chunk {
                return Err(err("allgather: mismatched payload size"));
            }
            unsafe { ptr::copy_nonoverlapping(slot.as_ptr(), recv.add(r * chunk), chunk) };
        }
        Ok(())
    }

    fn allgatherv(
        &self,
        comm: Comm,
        send: *const u8,
        send_count: i32,
        recv: *mut u8,
        recv_counts: &[i32],
        displs: &[i32],
        dtype: Datatype,
    ) -> Result<()> {
        if send_count < 0 {
            return Err(err("allgatherv: negative count"));
        }
        let (_, coll, me, n) = self.comm_parts(comm)?;
        if recv_counts.len() != n || displs.len() != n {
            return Err(err("allgatherv: count/displacement arrays mismatch world"));
        }
        let extent = dtype.extent();
        let deposit =
            unsafe { std::slice::from_raw_parts(send, send_count as usize * extent).to_vec() };
        let all = coll.exchange(n, me, deposit, &self.node);
        for (r, slot) in all.iter().enumerate() {
            let bytes = recv_counts[r] as usize * extent;
            if slot.len() != bytes {
                return Err(err("allgatherv: mismatched payload size"));
            }
            let dst = unsafe { recv.add(displs[r] as usize * extent) };
            unsafe { ptr::copy_nonoverlapping(slot.as_ptr(), dst, bytes) };
        }
        Ok(())
    }

    fn allreduce(
        &self,
        comm: Comm,
        send: Option<*const u8>,
        recv: *mut u8,
        count: i32,
        dtype: Datatype,
        op: ReduceOp,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("allreduce: negative count"));
        }
        let (_, coll, me, n) = self.comm_parts(comm)?;
        let elems = count as usize * dtype.elems();
        let bytes = elems * dtype.kind().size();
        // Fail on an unsupported (kind, op) pair before the rendezvous so
        // every member sees the same outcome.
        apply_reduce(dtype.kind(), op, &mut [], &[], 0)?;

        let src = send.unwrap_or(recv as *const u8);
        let deposit = unsafe { std::slice::from_raw_parts(src, bytes).to_vec() };
        let all = coll.exchange(n, me, deposit, &self.node);

        let mut acc = all[0].clone();
        if acc.len() != bytes {
            return Err(err("allreduce: mismatched payload size"));
        }
        for slot in all.iter().skip(1) {
            if slot.len() != bytes {
                return Err(err("allreduce: mismatched payload size"));
            }
            apply_reduce(dtype.kind(), op, &mut acc, slot, elems)?;
        }
        unsafe { ptr::copy_nonoverlapping(acc.as_ptr(), recv, bytes) };
        Ok(())
    }

    fn alltoall(
        &self,
        comm: Comm,
        send: *const u8,
        recv: *mut u8,
        count: i32,
        dtype: Datatype,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("alltoall: negative count"));
        }
        let (_, coll, me, n) = self.comm_parts(comm)?;
        let chunk = count as usize * dtype.extent();
        let deposit = unsafe { std::slice::from_raw_parts(send, n * chunk).to_vec() };
        let all = coll.exchange(n, me, deposit, &self.node);
        for (r, slot) in all.iter().enumerate() {
            if slot.len() != n * chunk {
                return Err(err("alltoall: mismatched payload size"));
            }
            let src = &slot[me * chunk..(me + 1) * chunk];
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), recv.add(r * chunk), chunk) };
        }
        Ok(())
    }

    fn win_allocate(&self, comm: Comm, size: usize, _hints: WinHints) -> Result<(Win, *mut u8)> {
        let base = Self::alloc_segment(size)?;
        let win = self.win_common(comm, size, base, true, false)?;
        Ok((win, base))
    }

    fn win_allocate_shared(
        &self,
        comm: Comm,
        size: usize,
        _hints: WinHints,
    ) -> Result<(Win, *mut u8)> {
        let base = Self::alloc_segment(size)?;
        let win = self.win_common(comm, size, base, true, true)?;
        Ok((win, base))
    }

    fn win_create(&self, comm: Comm, base: *mut u8, size: usize) -> Result<Win> {
        self.win_common(comm, size, base, false, false)
    }

    fn win_shared_query(&self, win: Win, rank: i32) -> Result<*mut u8> {
        let st = self.win_state(win)?;
        if !st.shared {
            return Err(err("win_shared_query on a non-shared window"));
        }
        if rank < 0 || rank as usize >= st.bases.len() {
            return Err(err(format!("win_shared_query: rank {} out of range", rank)));
        }
        Ok(st.bases[rank as usize] as *mut u8)
    }

    fn win_lock_all(&self, win: Win) -> Result<()> {
        // Passive-target windows are always accessible in this transport.
        self.win_state(win).map(|_| ())
    }

    fn win_unlock_all(&self, win: Win) -> Result<()> {
        self.win_state(win).map(|_| ())
    }

    fn win_free(&self, win: Win) -> Result<()> {
        let st = self.win_state(win)?;
        let (_, coll, me, n) = self.comm_parts(st.comm)?;
        // Quiesce before any segment disappears.
        coll.barrier(n, &self.node);
        if st.owned {
            let layout = Layout::from_size_align(st.size.max(1), PAGE_ALIGN)
                .map_err(|_| err("bad window layout"))?;
            unsafe { alloc::dealloc(st.bases[me] as *mut u8, layout) };
        }
        coll.barrier(n, &self.node);
        if me == 0 {
            self.node.wins.write()[win.0 as usize] = None;
        }
        Ok(())
    }

    fn win_flush(&self, _pe: i32, win: Win) -> Result<()> {
        self.win_state(win)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn win_flush_local(&self, _pe: i32, win: Win) -> Result<()> {
        self.win_state(win)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn win_flush_all(&self, win: Win) -> Result<()> {
        self.win_state(win)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn win_flush_local_all(&self, win: Win) -> Result<()> {
        self.win_state(win)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn win_sync(&self, win: Win) -> Result<()> {
        self.win_state(win)?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn put(
        &self,
        win: Win,
        origin: *const u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("put: negative count"));
        }
        let st = self.win_state(win)?;
        let bytes = count as usize * dtype.extent();
        let dst = self.rma_target(&st, pe, offset, bytes)?;
        unsafe { ptr::copy_nonoverlapping(origin, dst, bytes) };
        Ok(())
    }

    fn get(
        &self,
        win: Win,
        target: *mut u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("get: negative count"));
        }
        let st = self.win_state(win)?;
        let bytes = count as usize * dtype.extent();
        let src = self.rma_target(&st, pe, offset, bytes)?;
        unsafe { ptr::copy_nonoverlapping(src as *const u8, target, bytes) };
        Ok(())
    }

    fn put_strided(
        &self,
        win: Win,
        origin: *const u8,
        origin_stride: i32,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        target_stride: i32,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("put_strided: negative count"));
        }
        if count == 0 {
            return Ok(());
        }
        let st = self.win_state(win)?;
        let esize = dtype.extent() as isize;
        let sstep = origin_stride as isize * esize;
        let tstep = target_stride as isize * esize;
        // A negative stride walks backward, so the touched span starts at
        // whichever end the last element lands on.
        let last = (count as isize - 1) * tstep;
        let lo = offset + last.min(0);
        let span = last.unsigned_abs() + esize as usize;
        let base = self.rma_target(&st, pe, lo, span)?;
        for i in 0..count as isize {
            unsafe {
                let src = origin.offset(i * sstep);
                let dst = base.offset(offset - lo + i * tstep);
                ptr::copy_nonoverlapping(src, dst, esize as usize);
            }
        }
        Ok(())
    }

    fn get_strided(
        &self,
        win: Win,
        target: *mut u8,
        target_stride: i32,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        origin_stride: i32,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("get_strided: negative count"));
        }
        if count == 0 {
            return Ok(());
        }
        let st = self.win_state(win)?;
        let esize = dtype.extent() as isize;
        let sstep = origin_stride as isize * esize;
        let tstep = target_stride as isize * esize;
        let last = (count as isize - 1) * sstep;
        let lo = offset + last.min(0);
        let span = last.unsigned_abs() + esize as usize;
        let base = self.rma_target(&st, pe, lo, span)?;
        for i in 0..count as isize {
            unsafe {
                let src = base.offset(offset - lo + i * sstep);
                let dst = target.offset(i * tstep);
                ptr::copy_nonoverlapping(src as *const u8, dst, esize as usize);
            }
        }
        Ok(())
    }

    fn accumulate(
        &self,
        win: Win,
        origin: *const u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        op: RmaOp,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("accumulate: negative count"));
        }
        if op == RmaOp::NoOp {
            return Err(err("accumulate: NO_OP is only valid on get_accumulate"));
        }
        let st = self.win_state(win)?;
        let kind = dtype.kind();
        let esize = kind.size();
        let n = count as usize * dtype.elems();
        let dst = self.rma_target(&st, pe, offset, n * esize)?;

        if has_native_atomic(esize) && !kind.is_complex() {
            for i in 0..n {
                unsafe {
                    let p = dst.add(i * esize);
                    let val = read_bits(origin.add(i * esize), esize);
                    match op {
                        RmaOp::Replace => {
                            atomic_store_bits(p, esize, val);
                        }
                        RmaOp::Sum => {
                            atomic_add_bits(p, kind, val);
                        }
                        RmaOp::NoOp => unreachable!(),
                    }
                }
            }
        } else {
            let _guard = st.op_lock.lock().unwrap();
            match op {
                RmaOp::Replace => unsafe {
                    ptr::copy_nonoverlapping(origin, dst, n * esize);
                },
                RmaOp::Sum => {
                    let acc = unsafe { std::slice::from_raw_parts_mut(dst, n * esize) };
                    let x = unsafe { std::slice::from_raw_parts(origin, n * esize) };
                    apply_reduce(kind, ReduceOp::Sum, acc, x, n)?;
                }
                RmaOp::NoOp => unreachable!(),
            }
        }
        Ok(())
    }

    fn get_accumulate(
        &self,
        win: Win,
        origin: Option<*const u8>,
        result: *mut u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        op: RmaOp,
    ) -> Result<()> {
        if count < 0 {
            return Err(err("get_accumulate: negative count"));
        }
        if op != RmaOp::NoOp && origin.is_none() {
            return Err(err("get_accumulate: missing origin buffer"));
        }
        let st = self.win_state(win)?;
        let kind = dtype.kind();
        let esize = kind.size();
        let n = count as usize * dtype.elems();
        let dst = self.rma_target(&st, pe, offset, n * esize)?;

        if has_native_atomic(esize) && !kind.is_complex() {
            for i in 0..n {
                unsafe {
                    let p = dst.add(i * esize);
                    let old = match op {
                        RmaOp::NoOp => atomic_load_bits(p, esize),
                        RmaOp::Replace => {
                            let val = read_bits(origin.unwrap().add(i * esize), esize);
                            atomic_swap_bits(p, esize, val)
                        }
                        RmaOp::Sum => {
                            let val = read_bits(origin.unwrap().add(i * esize), esize);
                            atomic_add_bits(p, kind, val)
                        }
                    };
                    write_bits(result.add(i * esize), esize, old);
                }
            }
        } else {
            let _guard = st.op_lock.lock().unwrap();
            unsafe { ptr::copy_nonoverlapping(dst as *const u8, result, n * esize) };
            match op {
                RmaOp::NoOp => {}
                RmaOp::Replace => unsafe {
                    ptr::copy_nonoverlapping(origin.unwrap(), dst, n * esize);
                },
                RmaOp::Sum => {
                    let acc = unsafe { std::slice::from_raw_parts_mut(dst, n * esize) };
                    let x = unsafe { std::slice::from_raw_parts(origin.unwrap(), n * esize) };
                    apply_reduce(kind, ReduceOp::Sum, acc, x, n)?;
                }
            }
        }
        Ok(())
    }

    fn fetch_and_op(
        &self,
        win: Win,
        origin: Option<*const u8>,
        result: *mut u8,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        op: RmaOp,
    ) -> Result<()> {
        self.get_accumulate(win, origin, result, 1, dtype, pe, offset, op)
    }

    fn compare_and_swap(
        &self,
        win: Win,
        origin: *const u8,
        compare: *const u8,
        result: *mut u8,
        dtype: Datatype,
        pe: i32,
        offset: isize,
    ) -> Result<()> {
        let st = self.win_state(win)?;
        let esize = dtype.kind().size();
        let dst = self.rma_target(&st, pe, offset, esize)?;

        if has_native_atomic(esize) {
            unsafe {
                let cmp = read_bits(compare, esize);
                let val = read_bits(origin, esize);
                let old = atomic_cas_bits(dst, esize, cmp, val);
                write_bits(result, esize, old);
            }
        } else {
            let _guard = st.op_lock.lock().unwrap();
            unsafe {
                ptr::copy_nonoverlapping(dst as *const u8, result, esize);
                let old = std::slice::from_raw_parts(dst as *const u8, esize);
                let cmp = std::slice::from_raw_parts(compare, esize);
                if old == cmp {
                    ptr::copy_nonoverlapping(origin, dst, esize);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
