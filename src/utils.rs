use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub struct ChildGuard(pub Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        // Try to kill the process if still running
        if let Ok(Some(_)) = self.0.try_wait() {
            // already exited
            return;
        }
        let _ = self.0.kill();
        let _ = self.0.wait(); // reap zombie
    }
}

/// A spawned demo target: prints the address of its known value on the
/// first stdout line, then answers single-word commands on stdin.
pub struct DemoTarget {
    pub child: ChildGuard,
    pub address: usize,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl DemoTarget {
    pub fn spawn(name: &str) -> Self {
        let mut child = Command::new(format!("./target/debug/examples/{name}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn demo target");

        let stdin = child.stdin.take().expect("child had no stdin");
        let stdout = child.stdout.take().expect("child had no stdout");
        let mut reader = BufReader::new(stdout);

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let address = usize::from_str_radix(line.trim().trim_start_matches("0x"), 16)
            .expect("failed to parse hex address");

        DemoTarget {
            child: ChildGuard(child),
            address,
            stdin,
            reader,
        }
    }

    pub fn pid(&self) -> i32 {
        self.child.0.id() as i32
    }

    pub fn send(&mut self, cmd: &str) {
        writeln!(self.stdin, "{cmd}").unwrap();
        self.stdin.flush().unwrap();
    }

    pub fn expect_line(&mut self, expected: &str) {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim(), expected);
    }
}
