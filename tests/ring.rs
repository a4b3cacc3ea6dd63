//! Natural ring: every PE puts a 1 KiB buffer to its right neighbor, fences,
//! and gets it back; each PE must read back exactly what it sent.

use shoal::Threading;

fn ring(npes: i32, launch: shoal::Launch) {
    launch.run(move |pe| {
        shoal::init(Threading::Single);
        const N: usize = 1024;
        let buf = shoal::sh_malloc_elems::<u8>(N);
        assert!(!buf.is_null());
        shoal::barrier_all();

        let next = (pe + 1) % npes;
        let src: Vec<u8> = (0..N).map(|i| ((i as i32 + pe * 31) % 251) as u8).collect();
        shoal::put(buf, &src, next);
        shoal::fence();
        let mut back = vec![0u8; N];
        shoal::get(&mut back, buf, next);
        assert_eq!(back, src);

        shoal::barrier_all();
        shoal::sh_free(buf as *mut u8);
    });
}

#[test]
fn natural_ring_fast_path() {
    ring(4, shoal::Launch::new(4).sheap_size(1 << 20));
}

#[test]
fn natural_ring_substrate_path() {
    // Same traffic with the intra-node fast path disabled, so the transfers
    // go through the substrate windows.
    ring(4, shoal::Launch::new(4).sheap_size(1 << 20).smp(false));
}
