//! Scan target whose value changes on its own: useful for trying `watch`
//! and the changed/increased scans by hand.

use std::thread;
use std::time::Duration;

fn main() {
    let mut value: u32 = 0;
    let ptr = &raw const value;
    println!("{ptr:p}");

    loop {
        value = std::hint::black_box(value.wrapping_add(1));
        thread::sleep(Duration::from_millis(500));
    }
}
