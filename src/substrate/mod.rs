//! Substrate adapter: the consumption interface of the message-passing
//! substrate underneath the runtime.
//!
//! The runtime never talks to a transport directly; everything goes through
//! the [`Substrate`] trait, which mirrors the RMA/collective surface of an
//! MPI-3 style library: communicators, process groups, passive-target
//! windows, put/get, accumulate-class atomics and the usual collectives.
//!
//! Element types are described by a [`Datatype`]: a base [`Kind`] plus a
//! contiguous element count. A datatype with `elems > 1` plays the role of
//! the classic "derived contiguous type" used to push transfer counts past
//! the substrate's signed 32-bit count limit.
//!
//! The in-tree implementation is [`smp::SmpTransport`], an intra-process
//! shared-memory transport where every PE of the world is a thread of one
//! process.

pub mod smp;

use std::fmt;

/// Communicator handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Comm(pub(crate) u32);

/// Process-group handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Group(pub(crate) u32);

/// RMA window handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Win(pub(crate) u32);

/// Rank value returned by a failed group translation.
pub const RANK_UNDEFINED: i32 = -1;

/// Threading support levels, weakest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Threading {
    Single,
    Funneled,
    Serialized,
    Multiple,
}

/// Base element kinds understood by the substrate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
    Complex32,
    Complex64,
}

impl Kind {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Kind::Int8 | Kind::Uint8 => 1,
            Kind::Int16 | Kind::Uint16 => 2,
            Kind::Int32 | Kind::Uint32 | Kind::Float => 4,
            Kind::Int64 | Kind::Uint64 | Kind::Double | Kind::Complex32 => 8,
            Kind::Complex64 => 16,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Kind::Int8
                | Kind::Int16
                | Kind::Int32
                | Kind::Int64
                | Kind::Uint8
                | Kind::Uint16
                | Kind::Uint32
                | Kind::Uint64
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    pub const fn is_complex(self) -> bool {
        matches!(self, Kind::Complex32 | Kind::Complex64)
    }
}

/// An element descriptor: a base kind times a contiguous multiplier.
///
/// `Datatype::new(k)` is the plain base type; `dt.contiguous(n)` is the
/// derived type covering `n` consecutive elements, transferred as a single
/// element by the count-limited RMA and collective entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datatype {
    kind: Kind,
    elems: usize,
}

impl Datatype {
    pub const fn new(kind: Kind) -> Self {
        Self { kind, elems: 1 }
    }

    /// Derived contiguous type of `n` elements of `self`.
    pub fn contiguous(self, n: usize) -> Self {
        Self {
            kind: self.kind,
            elems: self.elems.checked_mul(n).expect("datatype extent overflow"),
        }
    }

    pub const fn kind(self) -> Kind {
        self.kind
    }

    pub const fn elems(self) -> usize {
        self.elems
    }

    /// Bytes covered by one element of this datatype.
    pub const fn extent(self) -> usize {
        self.kind.size() * self.elems
    }
}

/// Reduction operators for `allreduce`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    Band,
    Bor,
    Bxor,
    Land,
}

/// Operators for the accumulate-class RMA calls.
///
/// `Replace` on [`Substrate::accumulate`] is the ordered spelling of put;
/// `NoOp` on [`Substrate::get_accumulate`] is the ordered spelling of get.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmaOp {
    Replace,
    NoOp,
    Sum,
}

/// Window allocation hints, all advisory.
#[derive(Clone, Copy, Debug, Default)]
pub struct WinHints {
    /// Every rank passes the same size.
    pub same_size: bool,
    /// Back the window with shared memory if possible.
    pub alloc_shm: bool,
    /// A shared window may be laid out noncontiguously across ranks.
    pub alloc_shared_noncontig: bool,
}

/// Error surfaced when the substrate refuses a request. The runtime
/// elevates every substrate error to a fatal abort.
#[derive(Clone, Debug)]
pub struct SubstrateError {
    pub code: i32,
    pub message: String,
}

impl SubstrateError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "substrate error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for SubstrateError {}

pub type Result<T> = std::result::Result<T, SubstrateError>;

/// The substrate consumption interface.
///
/// One instance per PE (the *endpoint*); handles returned by one endpoint
/// are only meaningful on that endpoint. Buffer arguments are raw because
/// the caller owns placement; every method is fallible and the runtime
/// treats any error as fatal.
pub trait Substrate: Send {
    // ---- identity and lifecycle -------------------------------------------

    /// Threading level the substrate actually granted.
    fn provided(&self) -> Threading;

    /// Wall-clock seconds since an arbitrary epoch fixed per world.
    fn wtime(&self) -> f64;

    /// Unconditionally terminate the whole world with `code`.
    fn abort(&self, code: i32) -> !;

    fn finalize(&mut self) -> Result<()>;

    // ---- communicators ----------------------------------------------------

    fn comm_world(&self) -> Comm;
    fn comm_dup(&self, comm: Comm) -> Result<Comm>;
    /// Split `comm` into per-shared-memory-node communicators.
    fn comm_split_node(&self, comm: Comm) -> Result<Comm>;
    fn comm_rank(&self, comm: Comm) -> Result<i32>;
    fn comm_size(&self, comm: Comm) -> Result<i32>;
    /// True when both communicators contain the same ranks in the same order.
    fn comm_same_members(&self, a: Comm, b: Comm) -> Result<bool>;
    fn comm_group(&self, comm: Comm) -> Result<Group>;
    /// Collective over the members of `group` only; `tag` disambiguates
    /// concurrent creations on disjoint groups.
    fn comm_create_group(&self, comm: Comm, group: Group, tag: i32) -> Result<Comm>;
    fn comm_free(&self, comm: Comm) -> Result<()>;

    // ---- groups -----------------------------------------------------------

    fn group_incl(&self, group: Group, ranks: &[i32]) -> Result<Group>;
    /// Translate `ranks` of `from` into ranks of `to`; absent ranks map to
    /// [`RANK_UNDEFINED`].
    fn group_translate_ranks(&self, from: Group, ranks: &[i32], to: Group) -> Result<Vec<i32>>;
    fn group_free(&self, group: Group) -> Result<()>;

    // ---- collectives ------------------------------------------------------

    fn barrier(&self, comm: Comm) -> Result<()>;
    fn bcast(&self, comm: Comm, buf: *mut u8, count: i32, dtype: Datatype, root: i32)
        -> Result<()>;
    fn allgather(
        &self,
        comm: Comm,
        send: *const u8,
        recv: *mut u8,
        count: i32,
        dtype: Datatype,
    ) -> Result<()>;
    fn allgatherv(
        &self,
        comm: Comm,
        send: *const u8,
        send_count: i32,
        recv: *mut u8,
        recv_counts: &[i32],
        displs: &[i32],
        dtype: Datatype,
    ) -> Result<()>;
    /// `send = None` is the in-place spelling: `recv` doubles as the
    /// contribution.
    fn allreduce(
        &self,
        comm: Comm,
        send: Option<*const u8>,
        recv: *mut u8,
        count: i32,
        dtype: Datatype,
        op: ReduceOp,
    ) -> Result<()>;
    fn alltoall(
        &self,
        comm: Comm,
        send: *const u8,
        recv: *mut u8,
        count: i32,
        dtype: Datatype,
    ) -> Result<()>;

    // ---- windows ----------------------------------------------------------

    fn win_allocate(&self, comm: Comm, size: usize, hints: WinHints) -> Result<(Win, *mut u8)>;
    fn win_allocate_shared(
        &self,
        comm: Comm,
        size: usize,
        hints: WinHints,
    ) -> Result<(Win, *mut u8)>;
    /// Register caller-owned memory as a window.
    fn win_create(&self, comm: Comm, base: *mut u8, size: usize) -> Result<Win>;
    /// Local base pointer of `rank`'s segment of a shared window.
    fn win_shared_query(&self, win: Win, rank: i32) -> Result<*mut u8>;
    fn win_lock_all(&self, win: Win) -> Result<()>;
    fn win_unlock_all(&self, win: Win) -> Result<()>;
    fn win_free(&self, win: Win) -> Result<()>;
    /// Remote completion of outstanding operations targeting `pe`.
    fn win_flush(&self, pe: i32, win: Win) -> Result<()>;
    /// Local completion of outstanding operations targeting `pe`.
    fn win_flush_local(&self, pe: i32, win: Win) -> Result<()>;
    fn win_flush_all(&self, win: Win) -> Result<()>;
    fn win_flush_local_all(&self, win: Win) -> Result<()>;
    /// Synchronize the public and private window copies.
    fn win_sync(&self, win: Win) -> Result<()>;

    // ---- RMA --------------------------------------------------------------

    fn put(
        &self,
        win: Win,
        origin: *const u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
    ) -> Result<()>;
    fn get(
        &self,
        win: Win,
        target: *mut u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
    ) -> Result<()>;
    /// Element-wise strided put: element `i` of `origin` (stride
    /// `origin_stride` elements) lands at offset
    /// `offset + i * target_stride * extent`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;
    /// Element-wise atomic update of the target.
    #[allow(clippy::too_many_arguments)]
    fn accumulate(
        &self,
        win: Win,
        origin: *const u8,
        count: i32,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        op: RmaOp,
    ) -> Result<()>;
    /// Fetch the target into `result`, then apply `op` with `origin`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;
    /// Single-element fetch-and-op.
    fn fetch_and_op(
        &self,
        win: Win,
        origin: Option<*const u8>,
        result: *mut u8,
        dtype: Datatype,
        pe: i32,
        offset: isize,
        op: RmaOp,
    ) -> Result<()>;
    /// Single-element compare-and-swap; the previous value lands in
    /// `result` regardless of the outcome.
    fn compare_and_swap(
        &self,
        win: Win,
        origin: *const u8,
        compare: *const u8,
        result: *mut u8,
        dtype: Datatype,
        pe: i32,
        offset: isize,
    ) -> Result<()>;
}
