//! Remote atomics: fetch-increment chains, swap/cswap semantics, and the
//! commutativity of concurrent adds.

use shoal::Threading;

#[test]
fn fetch_inc_neighbor() {
    const N: i32 = 4;
    const L: i64 = 100;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let data = shoal::sh_malloc_elems::<i64>(3);
        unsafe {
            for i in 0..3 {
                data.add(i).write(0);
            }
        }
        shoal::barrier_all();

        // Each PE hammers data[1] on its right neighbor; every target has
        // exactly one incrementer, so the returned values are the exact
        // sequence 0, 1, 2, ...
        let next = (pe + 1) % N;
        for i in 0..L {
            let old = shoal::atomic_finc(unsafe { data.add(1) }, next);
            assert_eq!(old, i);
        }
        shoal::barrier_all();

        let me = shoal::my_pe();
        assert_eq!(shoal::atomic_fetch(unsafe { data.add(1) } as *const i64, me), L);
        assert_eq!(shoal::atomic_fetch(data as *const i64, me), 0);
        assert_eq!(shoal::atomic_fetch(unsafe { data.add(2) } as *const i64, me), 0);

        shoal::barrier_all();
        shoal::sh_free(data as *mut u8);
    });
}

#[test]
fn swap_and_cswap_semantics() {
    shoal::Launch::new(2).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let word = shoal::sh_malloc_elems::<i64>(1);
        unsafe { word.write(5) };
        shoal::barrier_all();

        if pe == 1 {
            let old = shoal::atomic_swap(word, 42i64, 0);
            assert_eq!(old, 5);

            // Matching compare replaces the value...
            let old = shoal::atomic_cswap(word, 42i64, 7, 0);
            assert_eq!(old, 42);
            assert_eq!(shoal::atomic_fetch(word as *const i64, 0), 7);

            // ...a mismatch leaves it alone.
            let old = shoal::atomic_cswap(word, 42i64, 99, 0);
            assert_eq!(old, 7);
            assert_eq!(shoal::atomic_fetch(word as *const i64, 0), 7);
        }

        shoal::barrier_all();
        shoal::sh_free(word as *mut u8);
    });
}

#[test]
fn float_swap_takes_the_substrate_path() {
    shoal::Launch::new(2).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let word = shoal::sh_malloc_elems::<f64>(1);
        unsafe { word.write(1.5) };
        shoal::barrier_all();

        if pe == 0 {
            let old = shoal::atomic_swap(word, 2.25f64, 1);
            assert_eq!(old, 1.5);
            assert_eq!(shoal::atomic_fetch(word as *const f64, 1), 2.25);
        }
        shoal::barrier_all();

        shoal::atomic_set(word, pe as f64, pe);
        shoal::barrier_all();
        let mine = shoal::atomic_fetch(word as *const f64, pe);
        assert_eq!(mine, pe as f64);

        shoal::barrier_all();
        shoal::sh_free(word as *mut u8);
    });
}

#[test]
fn concurrent_adds_commute() {
    const N: i32 = 4;
    const L: i64 = 50;
    shoal::Launch::new(N).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let counter = shoal::sh_malloc_elems::<i64>(1);
        unsafe { counter.write(0) };
        shoal::barrier_all();

        // Everyone adds its (pe + 1) delta to PE 0's counter.
        for _ in 0..L {
            shoal::atomic_add(counter, (pe + 1) as i64, 0);
        }
        shoal::quiet();
        shoal::barrier_all();

        if pe == 0 {
            let total: i64 = (1..=N as i64).sum::<i64>() * L;
            assert_eq!(shoal::atomic_fetch(counter as *const i64, 0), total);
        }
        shoal::barrier_all();
        shoal::sh_free(counter as *mut u8);
    });
}

#[test]
fn unsigned_and_32bit_atomics() {
    shoal::Launch::new(2).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let w32 = shoal::sh_malloc_elems::<i32>(1);
        let wu = shoal::sh_malloc_elems::<u64>(1);
        unsafe {
            w32.write(0);
            wu.write(u64::MAX);
        }
        shoal::barrier_all();

        shoal::atomic_inc(w32, (pe + 1) % 2);
        // Wrapping add on an unsigned word.
        shoal::atomic_add(wu, 1u64, (pe + 1) % 2);
        shoal::barrier_all();

        let me = shoal::my_pe();
        assert_eq!(shoal::atomic_fetch(w32 as *const i32, me), 1);
        assert_eq!(shoal::atomic_fetch(wu as *const u64, me), 0);

        shoal::barrier_all();
        shoal::sh_free(wu as *mut u8);
        shoal::sh_free(w32 as *mut u8);
    });
}
