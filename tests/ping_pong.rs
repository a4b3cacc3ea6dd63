//! End-to-end ping-pong: PE 0 puts a block of longs to PE 1, PE 1 waits on
//! every slot, reads the block back, and checks it.

use shoal::Threading;

#[test]
fn ping_pong_longs() {
    const N: usize = 256;
    shoal::Launch::new(2).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let recv = shoal::sh_malloc_elems::<i64>(N);
        assert!(!recv.is_null());
        for i in 0..N {
            unsafe { recv.add(i).write(-99) };
        }
        shoal::barrier_all();

        if pe == 0 {
            let data: Vec<i64> = (0..N as i64).collect();
            shoal::put(recv, &data, 1);
        } else {
            for i in 0..N {
                shoal::wait(unsafe { recv.add(i) } as *const i64, -99);
            }
            let mut back = vec![0i64; N];
            shoal::get(&mut back, recv, 1);
            for (i, v) in back.iter().enumerate() {
                assert_eq!(*v, i as i64, "slot {}", i);
            }
        }

        shoal::barrier_all();
        shoal::sh_free(recv as *mut u8);
    });
}

#[test]
fn zero_length_transfers_are_noops() {
    shoal::Launch::new(2).sheap_size(1 << 20).run(|pe| {
        shoal::init(Threading::Single);
        let buf = shoal::sh_malloc_elems::<i32>(4);
        unsafe {
            for i in 0..4 {
                buf.add(i).write(7);
            }
        }
        shoal::barrier_all();

        let empty: [i32; 0] = [];
        shoal::put(buf, &empty, (pe + 1) % 2);
        let mut none: [i32; 0] = [];
        shoal::get(&mut none, buf, (pe + 1) % 2);
        shoal::barrier_all();

        let mut check = [0i32; 4];
        shoal::get(&mut check, buf, pe);
        assert_eq!(check, [7; 4]);
        shoal::barrier_all();
        shoal::sh_free(buf as *mut u8);
    });
}
