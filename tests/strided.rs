//! Strided put/get over shorts.

use shoal::Threading;

#[test]
fn iput_every_other_source_element() {
    const N: i32 = 2;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let target = shoal::sh_malloc_elems::<i16>(10);
        unsafe {
            for i in 0..10 {
                target.add(i).write(-1);
            }
        }
        shoal::barrier_all();

        // Source [1..=10]; every other source element lands densely.
        let source: Vec<i16> = (1..=10).collect();
        let next = (pe + 1) % N;
        shoal::iput(target, source.as_ptr(), 1, 2, 5, next);
        shoal::quiet();
        shoal::barrier_all();

        let mut seen = vec![0i16; 10];
        shoal::get(&mut seen, target as *const i16, shoal::my_pe());
        assert_eq!(&seen[..5], &[1, 3, 5, 7, 9]);
        assert_eq!(&seen[5..], &[-1, -1, -1, -1, -1]);

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
    });
}

#[test]
fn iput_with_a_negative_target_stride_reverses() {
    const N: i32 = 2;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let target = shoal::sh_malloc_elems::<i16>(5);
        unsafe {
            for i in 0..5 {
                target.add(i).write(-1);
            }
        }
        shoal::barrier_all();

        // Start at the last slot and walk backward: element i lands at
        // target[4 - i].
        let source: Vec<i16> = (1..=5).collect();
        let next = (pe + 1) % N;
        shoal::iput(unsafe { target.add(4) }, source.as_ptr(), -1, 1, 5, next);
        shoal::quiet();
        shoal::barrier_all();

        let mut seen = vec![0i16; 5];
        shoal::get(&mut seen, target as *const i16, shoal::my_pe());
        assert_eq!(seen, [5, 4, 3, 2, 1]);

        shoal::barrier_all();
        shoal::sh_free(target as *mut u8);
    });
}

#[test]
fn iget_scatters_into_the_target_stride() {
    const N: i32 = 2;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let remote = shoal::sh_malloc_elems::<i64>(6);
        unsafe {
            for i in 0..6 {
                remote.add(i).write((pe as i64 + 1) * 10 + i as i64);
            }
        }
        shoal::barrier_all();

        // Pull the neighbor's dense [0..3) into every other local slot.
        let next = (pe + 1) % N;
        let mut local = [0i64; 6];
        shoal::iget(local.as_mut_ptr(), remote as *const i64, 2, 1, 3, next);

        let base = (next as i64 + 1) * 10;
        assert_eq!(local, [base, 0, base + 1, 0, base + 2, 0]);

        shoal::barrier_all();
        shoal::sh_free(remote as *mut u8);
    });
}

#[test]
fn iget_with_a_negative_source_stride_reads_backward() {
    const N: i32 = 2;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let remote = shoal::sh_malloc_elems::<i64>(4);
        unsafe {
            for i in 0..4 {
                remote.add(i).write(pe as i64 * 100 + i as i64);
            }
        }
        shoal::barrier_all();

        // Start at the neighbor's last slot and read in reverse: element i
        // comes from remote[3 - i].
        let next = (pe + 1) % N;
        let mut local = [0i64; 3];
        shoal::iget(
            local.as_mut_ptr(),
            unsafe { remote.add(3) } as *const i64,
            1,
            -1,
            3,
            next,
        );

        let base = next as i64 * 100;
        assert_eq!(local, [base + 3, base + 2, base + 1]);

        shoal::barrier_all();
        shoal::sh_free(remote as *mut u8);
    });
}
