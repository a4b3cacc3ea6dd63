//! Collective engine: barrier, broadcast, collect/fcollect, alltoall and
//! reductions over active sets.
//!
//! Every user-facing call resets the caller-supplied pSync slots to the
//! sync sentinel, acquires the active-set communicator, wraps oversized
//! counts in a derived contiguous datatype, and dispatches on the operation
//! tag. Roots arrive in world coordinates and are translated to active-set
//! coordinates during acquisition; rootless operations pass -1.

use crate::activeset::{self, ActiveSet};
use crate::rma::{checked_stride, contig_count};
use crate::runtime::Runtime;
use crate::substrate::{Kind, ReduceOp, RANK_UNDEFINED};
use crate::SYNC_VALUE;

/// The closed set of collective operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CollKind {
    Barrier,
    Broadcast,
    /// Equal contribution per PE ("fcollect").
    AllgatherFixed,
    /// Per-PE contribution sizes ("collect").
    AllgatherVar,
    Allreduce,
    Alltoall,
    /// Strided alltoall; strides are in elements.
    AlltoallStrided { tst: isize, sst: isize },
}

/// User-facing reduction operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduce {
    And,
    Or,
    Xor,
    Min,
    Max,
    Sum,
    Prod,
}

impl Reduce {
    /// Map to the substrate operator once, at the dispatch boundary.
    pub(crate) fn substrate_op(self) -> ReduceOp {
        match self {
            Reduce::And => ReduceOp::Land,
            Reduce::Or => ReduceOp::Bor,
            Reduce::Xor => ReduceOp::Bxor,
            Reduce::Min => ReduceOp::Min,
            Reduce::Max => ReduceOp::Max,
            Reduce::Sum => ReduceOp::Sum,
            Reduce::Prod => ReduceOp::Prod,
        }
    }
}

/// Reset the leading pSync slots to the sentinel; the scratch carries no
/// meaning between calls.
pub(crate) fn set_psync(rt: &Runtime, psync: &mut [i64], required: usize, op: &str) {
    if psync.len() < required {
        rt.fatal(
            1,
            &format!("{}: pSync holds {} slots, {} required", op, psync.len(), required),
        );
    }
    for slot in psync.iter_mut().take(required) {
        *slot = SYNC_VALUE;
    }
}

/// Dispatch one collective over `set`. `root_world` is a world rank for
/// broadcast and -1 ("no root") otherwise.
#[allow(clippy::too_many_arguments)]
pub(crate) fn coll(
    rt: &mut Runtime,
    kind: CollKind,
    ekind: Kind,
    reduce_op: Option<ReduceOp>,
    target: *mut u8,
    source: *const u8,
    nelems: usize,
    root_world: i32,
    set: ActiveSet,
) {
    let acquired = activeset::acquire(rt, set, root_world);
    let comm = acquired.comm;
    let (count, dtype) = contig_count(nelems, ekind);

    match kind {
        CollKind::Barrier => {
            let r = rt.sub.barrier(comm);
            rt.ok(r);
        }
        CollKind::Broadcast => {
            if acquired.root == RANK_UNDEFINED || root_world < 0 {
                rt.fatal(1, "broadcast: missing root PE");
            }
            // One buffer on the wire: the source on the root, the target on
            // everyone else. The root does not copy source into target.
            let buf = if rt.world_rank == root_world {
                source as *mut u8
            } else {
                target
            };
            let r = rt.sub.bcast(comm, buf, count, dtype, acquired.root);
            rt.ok(r);
        }
        CollKind::AllgatherFixed => {
            let r = rt.sub.allgather(comm, source, target, count, dtype);
            rt.ok(r);
        }
        CollKind::AllgatherVar => {
            // Gather the per-PE counts first, then prefix-sum displacements.
            let members = rt.ok(rt.sub.comm_size(comm)) as usize;
            let mut counts = vec![0i32; members];
            let r = rt.sub.allgather(
                comm,
                &count as *const i32 as *const u8,
                counts.as_mut_ptr() as *mut u8,
                1,
                crate::substrate::Datatype::new(Kind::Int32),
            );
            rt.ok(r);
            let mut displs = vec![0i32; members];
            for i in 1..members {
                displs[i] = displs[i - 1] + counts[i - 1];
            }
            let r = rt
                .sub
                .allgatherv(comm, source, count, target, &counts, &displs, dtype);
            rt.ok(r);
        }
        CollKind::Allreduce => {
            let op = reduce_op.expect("allreduce without an operator");
            // Identical source and target is the in-place spelling.
            let send = if source as usize == target as usize {
                None
            } else {
                Some(source)
            };
            let r = rt.sub.allreduce(comm, send, target, count, dtype, op);
            rt.ok(r);
        }
        CollKind::Alltoall => {
            let r = rt.sub.alltoall(comm, source, target, count, dtype);
            rt.ok(r);
        }
        CollKind::AlltoallStrided { tst, sst } => {
            alltoall_strided(rt, comm, ekind, target, source, nelems, tst, sst);
        }
    }

    activeset::release(rt, acquired);
}

/// Pack the strided source, exchange contiguously, unpack with the target
/// stride.
#[allow(clippy::too_many_arguments)]
fn alltoall_strided(
    rt: &Runtime,
    comm: crate::substrate::Comm,
    ekind: Kind,
    target: *mut u8,
    source: *const u8,
    nelems: usize,
    tst: isize,
    sst: isize,
) {
    checked_stride(rt, tst, "alltoalls");
    checked_stride(rt, sst, "alltoalls");
    if nelems > i32::MAX as usize {
        rt.fatal(1, "alltoalls: count exceeds the range of a 32-bit integer");
    }
    let members = rt.ok(rt.sub.comm_size(comm)) as usize;
    let esize = ekind.size();
    let total = members * nelems;
    let sstep = sst * esize as isize;
    let tstep = tst * esize as isize;

    let mut packed = vec![0u8; total * esize];
    for i in 0..total {
        unsafe {
            let src = source.offset(i as isize * sstep);
            core::ptr::copy_nonoverlapping(src, packed.as_mut_ptr().add(i * esize), esize);
        }
    }

    let mut exchanged = vec![0u8; total * esize];
    let r = rt.sub.alltoall(
        comm,
        packed.as_ptr(),
        exchanged.as_mut_ptr(),
        nelems as i32,
        crate::substrate::Datatype::new(ekind),
    );
    rt.ok(r);

    for i in 0..total {
        unsafe {
            let dst = target.offset(i as isize * tstep);
            core::ptr::copy_nonoverlapping(exchanged.as_ptr().add(i * esize), dst, esize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_maps_to_substrate_ops() {
        assert_eq!(Reduce::And.substrate_op(), ReduceOp::Land);
        assert_eq!(Reduce::Or.substrate_op(), ReduceOp::Bor);
        assert_eq!(Reduce::Xor.substrate_op(), ReduceOp::Bxor);
        assert_eq!(Reduce::Min.substrate_op(), ReduceOp::Min);
        assert_eq!(Reduce::Max.substrate_op(), ReduceOp::Max);
        assert_eq!(Reduce::Sum.substrate_op(), ReduceOp::Sum);
        assert_eq!(Reduce::Prod.substrate_op(), ReduceOp::Prod);
    }
}
