//! Scan target used by the root-gated tests: holds an i32 starting at 100,
//! prints its address, then obeys single-word commands on stdin.

use std::io::{self, BufRead, Write};

fn main() {
    let mut value: i32 = 100;
    let ptr = &raw const value;
    println!("{ptr:p}");
    io::stdout().flush().unwrap();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        match line.trim() {
            "dec" => {
                value = std::hint::black_box(value - 1);
                println!("{value}");
            }
            "inc" => {
                value = std::hint::black_box(value + 1);
                println!("{value}");
            }
            "read" => {
                println!("{}", std::hint::black_box(value));
            }
            "quit" => break,
            _ => {}
        }
        io::stdout().flush().unwrap();
    }
}
