//! Broadcast, collect, fcollect, alltoall and the active-set communicator
//! cache (hits, subsets, and overflow).

use shoal::{ActiveSet, Threading};

#[test]
fn broadcast_leaves_the_root_target_alone() {
    const N: i32 = 4;
    const ROOT: i32 = 1;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let source = shoal::sh_malloc_elems::<i64>(8);
        let target = shoal::sh_malloc_elems::<i64>(8);
        unsafe {
            for i in 0..8 {
                source.add(i).write(if pe == ROOT { 100 + i as i64 } else { 0 });
                target.add(i).write(-7);
            }
        }
        shoal::barrier_all();

        let mut psync = [0i64; shoal::BCAST_SYNC_SIZE];
        shoal::broadcast(target, source as *const i64, 8, ROOT, ActiveSet::world(N), &mut psync);
        shoal::barrier_all();

        let mut seen = [0i64; 8];
        shoal::get(&mut seen, target as *const i64, pe);
        if pe == ROOT {
            // The root transmits from source and keeps its target untouched.
            assert_eq!(seen, [-7; 8]);
        } else {
            let expected: Vec<i64> = (100..108).collect();
            assert_eq!(&seen[..], &expected[..]);
        }

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn broadcast_over_a_subset() {
    const N: i32 = 4;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let source = shoal::sh_malloc_elems::<i32>(2);
        let target = shoal::sh_malloc_elems::<i32>(2);
        unsafe {
            source.write(pe * 2);
            source.add(1).write(pe * 2 + 1);
            target.write(-1);
            target.add(1).write(-1);
        }
        shoal::barrier_all();

        // Odd PEs {1, 3}, rooted at world rank 3.
        let set = ActiveSet::new(1, 1, 2);
        if set.contains(pe) {
            let mut psync = [0i64; shoal::BCAST_SYNC_SIZE];
            shoal::broadcast(target, source as *const i32, 2, 3, set, &mut psync);
            if pe != 3 {
                let mut seen = [0i32; 2];
                shoal::get(&mut seen, target as *const i32, pe);
                assert_eq!(seen, [6, 7]);
            }
        }
        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn fcollect_concatenates_in_rank_order() {
    const N: i32 = 4;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let source = shoal::sh_malloc_elems::<i32>(2);
        let target = shoal::sh_malloc_elems::<i32>(2 * N as usize);
        unsafe {
            source.write(pe * 10);
            source.add(1).write(pe * 10 + 1);
        }
        shoal::barrier_all();

        let mut psync = [0i64; shoal::COLLECT_SYNC_SIZE];
        shoal::fcollect(target, source as *const i32, 2, ActiveSet::world(N), &mut psync);

        let mut seen = vec![0i32; 2 * N as usize];
        shoal::get(&mut seen, target as *const i32, pe);
        let expected: Vec<i32> = (0..N).flat_map(|r| [r * 10, r * 10 + 1]).collect();
        assert_eq!(seen, expected);

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn collect_handles_uneven_contributions() {
    const N: i32 = 4;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        // PE r contributes r + 1 copies of r.
        let total: usize = (1..=N as usize).sum();
        let source = shoal::sh_malloc_elems::<i64>(N as usize);
        let target = shoal::sh_malloc_elems::<i64>(total);
        let mine = pe as usize + 1;
        unsafe {
            for i in 0..mine {
                source.add(i).write(pe as i64);
            }
        }
        shoal::barrier_all();

        let mut psync = [0i64; shoal::COLLECT_SYNC_SIZE];
        shoal::collect(target, source as *const i64, mine, ActiveSet::world(N), &mut psync);

        let mut seen = vec![0i64; total];
        shoal::get(&mut seen, target as *const i64, pe);
        let expected: Vec<i64> = (0..N as i64).flat_map(|r| vec![r; r as usize + 1]).collect();
        assert_eq!(seen, expected);

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn alltoall_exchanges_pairwise_blocks() {
    const N: i32 = 4;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let source = shoal::sh_malloc_elems::<i32>(N as usize);
        let target = shoal::sh_malloc_elems::<i32>(N as usize);
        unsafe {
            for j in 0..N as usize {
                source.add(j).write(pe * 100 + j as i32);
            }
        }
        shoal::barrier_all();

        let mut psync = [0i64; shoal::ALLTOALL_SYNC_SIZE];
        shoal::alltoall(target, source as *const i32, 1, ActiveSet::world(N), &mut psync);

        let mut seen = vec![0i32; N as usize];
        shoal::get(&mut seen, target as *const i32, pe);
        for (j, v) in seen.iter().enumerate() {
            assert_eq!(*v, j as i32 * 100 + pe);
        }

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn alltoalls_applies_both_strides() {
    const N: i32 = 2;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        // One element per pair, source stride 2, target stride 3.
        let source = shoal::sh_malloc_elems::<i64>(2 * N as usize);
        let target = shoal::sh_malloc_elems::<i64>(3 * N as usize);
        unsafe {
            for j in 0..N as usize {
                source.add(j * 2).write((pe * 10 + j as i32) as i64);
                source.add(j * 2 + 1).write(-1);
            }
            for i in 0..3 * N as usize {
                target.add(i).write(-1);
            }
        }
        shoal::barrier_all();

        let mut psync = [0i64; shoal::ALLTOALL_SYNC_SIZE];
        shoal::alltoalls(target, source as *const i64, 3, 2, 1, ActiveSet::world(N), &mut psync);

        let mut seen = vec![0i64; 3 * N as usize];
        shoal::get(&mut seen, target as *const i64, pe);
        for j in 0..N as usize {
            assert_eq!(seen[j * 3], (j as i32 * 10 + pe) as i64);
        }

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn alltoalls_with_a_negative_target_stride() {
    const N: i32 = 2;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let source = shoal::sh_malloc_elems::<i64>(N as usize);
        let target = shoal::sh_malloc_elems::<i64>(3);
        unsafe {
            for j in 0..N as usize {
                source.add(j).write((pe * 10 + j as i32) as i64);
            }
            for i in 0..3 {
                target.add(i).write(-1);
            }
        }
        shoal::barrier_all();

        // Start at the last slot and walk backward: the block from rank j
        // lands at target[2 - 2 * j], so rank order is reversed in memory.
        let mut psync = [0i64; shoal::ALLTOALL_SYNC_SIZE];
        shoal::alltoalls(
            unsafe { target.add(2) },
            source as *const i64,
            -2,
            1,
            1,
            ActiveSet::world(N),
            &mut psync,
        );

        let mut seen = vec![0i64; 3];
        shoal::get(&mut seen, target as *const i64, pe);
        assert_eq!(seen, [10 + pe as i64, -1, pe as i64]);

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
        shoal::sh_free(source as *mut u8);
    });
}

#[test]
fn active_set_cache_hits_and_overflow() {
    const N: i32 = 4;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);

        // World triple: fast path, no caching involved.
        let mut psync = [0i64; shoal::BARRIER_SYNC_SIZE];
        shoal::barrier(ActiveSet::world(N), &mut psync);

        // Repeated use of one subset communicator exercises cache hits.
        let evens = ActiveSet::new(0, 1, 2);
        for _ in 0..3 {
            if evens.contains(pe) {
                shoal::barrier(evens, &mut psync);
            }
            shoal::barrier_all();
        }

        // More distinct singleton triples than cache slots forces the
        // create-and-free overflow path.
        for stride in 0..20 {
            let solo = ActiveSet::new(pe, stride, 1);
            shoal::barrier(solo, &mut psync);
        }
        shoal::barrier_all();
    });
}
