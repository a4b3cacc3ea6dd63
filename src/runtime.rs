//! Lifecycle: startup, the per-PE runtime context, teardown, and the PE
//! launch harness.
//!
//! The historical implementations keep window handles, base pointers and
//! caches as process-wide globals. Here every PE runs as a thread of one
//! process under the in-tree transport, so the same state is bundled into a
//! [`Runtime`] held in a thread-local singleton; nothing in the public API
//! takes the context explicitly.

use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::activeset::CommCache;
use crate::lock::{self, LockState};
use crate::logger;
use crate::sh_fatal;
use crate::subpool;
use crate::substrate::smp::{SmpNode, SmpTransport};
use crate::substrate::{Comm, Group, Substrate};
use crate::symmetric::{self, Symmetric};

pub use crate::substrate::Threading;

/// Everything one PE needs: the substrate endpoint, the world and node
/// identities, the symmetric regions, the lock window and the active-set
/// cache.
pub(crate) struct Runtime {
    pub sub: Box<dyn Substrate>,
    pub world: Comm,
    pub world_group: Group,
    pub world_rank: i32,
    pub world_size: i32,
    pub node_comm: Comm,
    pub node_group: Group,
    pub node_rank: i32,
    pub node_size: i32,
    /// Every PE of the world lives on this shared-memory node.
    pub world_is_smp: bool,
    /// Node-rank to world-rank translation.
    pub smp_rank_list: Vec<i32>,
    /// The intra-node fast path is compiled in, possible, and not disabled.
    pub smp_enabled: bool,
    pub sym: Symmetric,
    pub lock: LockState,
    pub cache: CommCache,
}

impl Runtime {
    pub(crate) fn fatal(&self, code: i32, message: &str) -> ! {
        fatal(Some(self.sub.as_ref()), code, message)
    }
}

/// Print the diagnostic line and abort the substrate (exit codes are
/// coerced non-zero so a fatal failure never looks like success).
pub(crate) fn fatal(sub: Option<&dyn Substrate>, code: i32, message: &str) -> ! {
    sh_fatal!("{}", message);
    let code = if code == 0 { 1 } else { code };
    match sub {
        Some(sub) => sub.abort(code),
        None => std::process::exit(code),
    }
}

/// Elevate a substrate refusal to a fatal abort.
pub(crate) fn check<T>(sub: &dyn Substrate, r: crate::substrate::Result<T>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => fatal(Some(sub), e.code, &e.to_string()),
    }
}

// ============================================================================
// Thread-local context
// ============================================================================

#[derive(Clone, Default)]
pub(crate) struct LaunchConfig {
    pub sheap_size: Option<usize>,
    pub smp: Option<bool>,
}

/// Seed left by the launcher for `init` to consume.
pub(crate) struct Attach {
    node: Arc<SmpNode>,
    rank: i32,
    config: LaunchConfig,
}

thread_local! {
    static PENDING: RefCell<Option<Attach>> = const { RefCell::new(None) };
    static CONTEXT: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

pub(crate) fn is_initialized() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

pub(crate) fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
    CONTEXT.with(|c| {
        let ctx = c.borrow();
        match ctx.as_ref() {
            Some(rt) => f(rt),
            None => fatal(None, 1, "runtime is not initialized (call shoal::init first)"),
        }
    })
}

pub(crate) fn with_mut<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    CONTEXT.with(|c| {
        let mut ctx = c.borrow_mut();
        match ctx.as_mut() {
            Some(rt) => f(rt),
            None => fatal(None, 1, "runtime is not initialized (call shoal::init first)"),
        }
    })
}

// ============================================================================
// Init / finalize
// ============================================================================

fn smp_env_allows() -> bool {
    match std::env::var("SHOAL_SMP") {
        Ok(v) => !matches!(v.as_str(), "0" | "false" | "off" | "no"),
        Err(_) => true,
    }
}

/// Attach this PE to the runtime. Idempotent; aborts when the substrate
/// cannot grant `threading` or when no launcher seeded the thread.
pub fn init(threading: Threading) {
    if is_initialized() {
        return;
    }
    let attach = PENDING.with(|p| p.borrow_mut().take());
    let attach = match attach {
        Some(a) => a,
        None => fatal(
            None,
            1,
            "init: no launch environment (start PEs with shoal::run_pes)",
        ),
    };
    let rt = build_runtime(attach, threading);
    CONTEXT.with(|c| *c.borrow_mut() = Some(rt));
}

fn build_runtime(attach: Attach, threading: Threading) -> Runtime {
    logger::init();
    let sub: Box<dyn Substrate> = Box::new(SmpTransport::new(attach.node, attach.rank));
    if sub.provided() < threading {
        fatal(
            Some(sub.as_ref()),
            1,
            "the substrate did not provide the requested thread support",
        );
    }
    let s = sub.as_ref();

    let world = check(s, s.comm_dup(s.comm_world()));
    let world_rank = check(s, s.comm_rank(world));
    let world_size = check(s, s.comm_size(world));
    logger::set_rank(world_rank);
    let world_group = check(s, s.comm_group(world));

    // Node discovery: who shares memory with us, and is that everyone?
    let node_comm = check(s, s.comm_split_node(world));
    let node_rank = check(s, s.comm_rank(node_comm));
    let node_size = check(s, s.comm_size(node_comm));
    let node_group = check(s, s.comm_group(node_comm));
    let world_is_smp = check(s, s.comm_same_members(world, node_comm));
    let node_local: Vec<i32> = (0..node_size).collect();
    let smp_rank_list = check(
        s,
        s.group_translate_ranks(node_group, &node_local, world_group),
    );

    let smp_enabled = cfg!(feature = "smp-optimizations")
        && world_is_smp
        && attach.config.smp.unwrap_or_else(smp_env_allows);

    let sym = symmetric::setup(
        sub.as_ref(),
        world,
        world_rank,
        node_size,
        smp_enabled,
        attach.config.sheap_size,
    );
    let lock = lock::create(sub.as_ref(), world);

    check(s, s.barrier(world));

    let rt = Runtime {
        sub,
        world,
        world_group,
        world_rank,
        world_size,
        node_comm,
        node_group,
        node_rank,
        node_size,
        world_is_smp,
        smp_rank_list,
        smp_enabled,
        sym,
        lock,
        cache: CommCache::new(),
    };
    crate::sh_debug!(
        "PE {}/{} up (node rank {} of {}, fast path {})",
        rt.world_rank,
        rt.world_size,
        rt.node_rank,
        rt.node_size,
        if rt.smp_enabled { "on" } else { "off" }
    );
    rt
}

/// Collective teardown; a no-op when the PE never initialized. The launch
/// harness calls this for any PE whose closure returns without doing so.
pub fn finalize() {
    let rt = CONTEXT.with(|c| c.borrow_mut().take());
    if let Some(rt) = rt {
        teardown(rt);
    }
    logger::set_rank(-1);
}

fn teardown(rt: Runtime) {
    let Runtime {
        mut sub,
        world,
        world_group,
        node_comm,
        node_group,
        sym,
        lock: lock_state,
        mut cache,
        ..
    } = rt;
    // Release the lock allocation first, then quiesce the world.
    lock::destroy(sub.as_ref(), &lock_state);
    for entry in cache.drain() {
        check(sub.as_ref(), sub.comm_free(entry.comm));
        check(sub.as_ref(), sub.group_free(entry.group));
    }
    check(sub.as_ref(), sub.barrier(world));

    let Symmetric {
        sheap, etext, heap, ..
    } = sym;

    check(sub.as_ref(), sub.win_unlock_all(etext.win));
    check(sub.as_ref(), sub.win_free(etext.win));

    // The subpool sits on top of the sheap window memory, so it goes first.
    let released = heap.destroy();
    crate::sh_debug!("subpool released {} bytes", released);

    check(sub.as_ref(), sub.win_unlock_all(sheap.win));
    check(sub.as_ref(), sub.win_free(sheap.win));

    check(sub.as_ref(), sub.group_free(node_group));
    check(sub.as_ref(), sub.group_free(world_group));
    check(sub.as_ref(), sub.comm_free(node_comm));
    check(sub.as_ref(), sub.comm_free(world));
    let r = sub.finalize();
    check(sub.as_ref(), r);
}

/// Abort the whole world with `status` as its exit code.
pub fn global_exit(status: i32) -> ! {
    CONTEXT.with(|c| {
        if let Some(rt) = c.borrow().as_ref() {
            rt.sub.abort(status);
        }
    });
    std::process::exit(status)
}

// ============================================================================
// Launch harness
// ============================================================================

/// Configure and start a world of PE threads over the in-tree transport.
///
/// ```no_run
/// shoal::Launch::new(4).sheap_size(1 << 20).run(|_pe| {
///     shoal::init(shoal::Threading::Single);
///     shoal::barrier_all();
/// });
/// ```
pub struct Launch {
    npes: i32,
    config: LaunchConfig,
}

impl Launch {
    pub fn new(npes: i32) -> Self {
        assert!(npes >= 1, "a world needs at least one PE");
        Self {
            npes,
            config: LaunchConfig::default(),
        }
    }

    /// Fix the symmetric heap size, overriding the environment.
    pub fn sheap_size(mut self, bytes: usize) -> Self {
        self.config.sheap_size = Some(bytes);
        self
    }

    /// Force the intra-node fast path on or off (still subject to the
    /// `smp-optimizations` feature).
    pub fn smp(mut self, enabled: bool) -> Self {
        self.config.smp = Some(enabled);
        self
    }

    /// Run `f` once per PE and join the world. A PE that returns without
    /// finalizing is finalized here; a panicking PE poisons the world so
    /// the remaining PEs fail fast instead of blocking forever.
    pub fn run<F>(self, f: F)
    where
        F: Fn(i32) + Send + Sync,
    {
        let node = SmpNode::new(self.npes);
        // Keep the default below what the subpool needs for bookkeeping.
        debug_assert!(self.config.sheap_size.unwrap_or(usize::MAX) >= subpool::BOOKKEEPING_LIMIT);

        thread::scope(|s| {
            for pe in 0..self.npes {
                let node = Arc::clone(&node);
                let config = self.config.clone();
                let f = &f;
                thread::Builder::new()
                    .name(format!("pe-{}", pe))
                    .spawn_scoped(s, move || {
                        PENDING.with(|p| {
                            *p.borrow_mut() = Some(Attach {
                                node: Arc::clone(&node),
                                rank: pe,
                                config,
                            });
                        });
                        match catch_unwind(AssertUnwindSafe(|| f(pe))) {
                            Ok(()) => {
                                if is_initialized() {
                                    finalize();
                                }
                            }
                            Err(payload) => {
                                node.poison();
                                logger::set_rank(-1);
                                resume_unwind(payload);
                            }
                        }
                    })
                    .expect("failed to spawn PE thread");
            }
        });
    }
}

/// Spawn `npes` PEs running `f`; the classic `start_pes` shape.
pub fn run_pes<F>(npes: i32, f: F)
where
    F: Fn(i32) + Send + Sync,
{
    Launch::new(npes).run(f)
}
