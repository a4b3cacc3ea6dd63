//! Symmetric memory manager: owns the two symmetric regions (the symmetric
//! heap and the static-data "etext" range), their RMA windows, and the
//! address-to-window resolver.
//!
//! Allocations against the symmetric heap are made in collective lock-step
//! by convention, so one PE's offset names every PE's local copy; the
//! resolver only ever consults the calling PE's own bases.

use crate::runtime::fatal;
use crate::sh_info;
use crate::subpool::Subpool;
use crate::substrate::{Comm, Datatype, Kind, Substrate, Win, WinHints};

/// Identifies which symmetric window an address fell into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowId {
    Sheap,
    Etext,
}

/// One symmetric region: a window plus the local base/size pair.
pub(crate) struct Region {
    pub win: Win,
    pub base: *mut u8,
    pub size: usize,
}

impl Region {
    pub fn base_addr(&self) -> usize {
        self.base as usize
    }
}

/// Classify `addr` against the caller's own region bases.
///
/// Offsets are computed in signed pointer-width arithmetic so addresses
/// below a base cannot wrap into range; the upper bounds are inclusive,
/// matching the historical resolver.
pub(crate) fn window_offset(
    sheap: &Region,
    etext: &Region,
    addr: *const u8,
) -> Option<(WindowId, isize)> {
    let a = addr as isize;
    let sheap_offset = a - sheap.base as isize;
    if sheap_offset >= 0 && sheap_offset <= sheap.size as isize {
        return Some((WindowId::Sheap, sheap_offset));
    }
    let etext_offset = a - etext.base as isize;
    if etext_offset >= 0 && etext_offset <= etext.size as isize {
        return Some((WindowId::Etext, etext_offset));
    }
    None
}

// ============================================================================
// Symmetric heap sizing
// ============================================================================

/// Environment variables consulted for the symmetric heap size, in priority
/// order. The list covers the spellings of the established SHMEM
/// implementations so existing job scripts keep working.
pub const HEAP_SIZE_VARS: [&str; 6] = [
    "SHMEM_SYMMETRIC_HEAP_SIZE",
    "SMA_SYMMETRIC_SIZE",
    "SYMMETRIC_SIZE",
    "X1_SYMMETRIC_HEAP_SIZE",
    "XT_SYMMETRIC_HEAP_SIZE",
    "OOSHM_SYMMETRIC_HEAP_SIZE",
];

/// First matching entry of [`HEAP_SIZE_VARS`].
pub(crate) fn heap_size_from_env() -> Option<(&'static str, String)> {
    for var in HEAP_SIZE_VARS {
        if let Ok(value) = std::env::var(var) {
            return Some((var, value));
        }
    }
    None
}

/// Parse a heap-size value: a decimal integer with an optional K/M/G
/// suffix (decimal multipliers, matching the established SHMEM spellings).
pub fn parse_size(value: &str) -> Option<i64> {
    let value = value.trim();
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    if digits_end == 0 {
        return None;
    }
    let number: i64 = value[..digits_end].parse().ok()?;
    let units = match value[digits_end..].trim() {
        "" => 1,
        "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        _ => return None,
    };
    number.checked_mul(units)
}

/// Default symmetric heap size when the environment does not choose one:
/// a per-process slice of the available memory, capped at 2 GiB.
#[cfg(target_os = "linux")]
pub(crate) fn default_heap_size(ppn: i64) -> i64 {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let availpages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };
    if pagesize < 0 || availpages < 0 {
        crate::sh_warn!("sysconf failed; defaulting the symmetric heap to 128 MB");
        return 128_000_000;
    }
    let total = pagesize * availpages / ppn.max(1);
    // Above 2 GiB the estimate is likely wrong; make the user say so.
    total.min(1 << 31)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn default_heap_size(_ppn: i64) -> i64 {
    100_000_000
}

// ============================================================================
// Static-data region discovery
// ============================================================================

/// The process's static-data range `[data start, end)` from the OS linker
/// end-markers.
#[cfg(target_os = "linux")]
pub(crate) fn static_data_range() -> (usize, usize) {
    extern "C" {
        static __data_start: u8;
        static _end: u8;
    }
    unsafe {
        (
            core::ptr::addr_of!(__data_start) as usize,
            core::ptr::addr_of!(_end) as usize,
        )
    }
}

/// Without linker end-markers, fall back to a private arena so static-range
/// lookups stay well-defined (only self-targeted accesses make sense then).
#[cfg(not(target_os = "linux"))]
pub(crate) fn static_data_range() -> (usize, usize) {
    static FALLBACK: [u8; 1 << 16] = [0; 1 << 16];
    let base = FALLBACK.as_ptr() as usize;
    (base, base + FALLBACK.len())
}

// ============================================================================
// Startup / region construction
// ============================================================================

pub(crate) struct Symmetric {
    pub sheap: Region,
    pub etext: Region,
    pub heap: Subpool,
    /// Per-world-rank sheap base addresses; empty unless the intra-node
    /// fast path is live.
    pub smp_sheap_ptrs: Vec<usize>,
}

/// Collective startup of both symmetric regions. `size_override` wins over
/// the environment; `node_size` is the number of PEs on this node; `smp`
/// selects the shared window variant and fills the peer base table.
pub(crate) fn setup(
    sub: &dyn Substrate,
    world: Comm,
    world_rank: i32,
    node_size: i32,
    smp: bool,
    size_override: Option<usize>,
) -> Symmetric {
    use crate::runtime::check;

    // Rank 0 decides the heap size and broadcasts it.
    let mut sheap_size: i64 = -1;
    if world_rank == 0 {
        if let Some(n) = size_override {
            sheap_size = n as i64;
        } else if let Some((var, value)) = heap_size_from_env() {
            match parse_size(&value) {
                Some(n) => sheap_size = n,
                None => fatal(
                    Some(sub),
                    1,
                    &format!("unparsable symmetric heap size {}={:?}", var, value),
                ),
            }
        }
    }
    check(
        sub,
        sub.bcast(
            world,
            &mut sheap_size as *mut i64 as *mut u8,
            1,
            Datatype::new(Kind::Int64),
            0,
        ),
    );

    if sheap_size == -1 {
        sheap_size = default_heap_size(node_size as i64);
        check(
            sub,
            sub.bcast(
                world,
                &mut sheap_size as *mut i64 as *mut u8,
                1,
                Datatype::new(Kind::Int64),
                0,
            ),
        );
    }
    if world_rank == 0 {
        sh_info!("symmetric heap size is {}", sheap_size);
    }

    // The heap size is symmetric by construction and assumed so for the
    // static data.
    let mut hints = WinHints {
        same_size: true,
        ..WinHints::default()
    };

    let size = sheap_size as usize;
    let (sheap_win, sheap_base) = if smp {
        // No performance advantage to a contiguous cross-PE layout.
        hints.alloc_shared_noncontig = true;
        check(sub, sub.win_allocate_shared(world, size, hints))
    } else {
        hints.alloc_shm = true;
        check(sub, sub.win_allocate(world, size, hints))
    };
    check(sub, sub.win_lock_all(sheap_win));

    let smp_sheap_ptrs = if smp {
        (0..node_size)
            .map(|r| check(sub, sub.win_shared_query(sheap_win, r)) as usize)
            .collect()
    } else {
        Vec::new()
    };

    let heap = match Subpool::create(sheap_base, size) {
        Some(h) => h,
        None => fatal(
            Some(sub),
            world_rank,
            &format!("subpool creation over {} bytes failed", size),
        ),
    };

    // Static data region.
    let (etext_start, etext_end) = static_data_range();
    let etext_size = etext_end.saturating_sub(etext_start);
    if etext_size > i32::MAX as usize {
        fatal(
            Some(sub),
            1,
            &format!("static data range of {} bytes overflows i32", etext_size),
        );
    }
    let etext_win = check(sub, sub.win_create(world, etext_start as *mut u8, etext_size));
    check(sub, sub.win_lock_all(etext_win));

    Symmetric {
        sheap: Region {
            win: sheap_win,
            base: sheap_base,
            size,
        },
        etext: Region {
            win: etext_win,
            base: etext_start as *mut u8,
            size: etext_size,
        },
        heap,
        smp_sheap_ptrs,
    }
}
