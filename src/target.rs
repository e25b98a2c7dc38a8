use process_memory::{CopyAddress, Pid, PutAddress, TryIntoProcessHandle};
use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("could not attach to process: OS error ({0})")]
    Attach(i32),
    #[error("could not read target memory: OS error ({0})")]
    Read(i32),
    #[error("could not write target memory: OS error ({0})")]
    Write(i32),
}

fn last_os_error() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Stop the target for the duration of a scan pass. Must be paired with
/// `detach` on every exit path; `AttachGuard` does the pairing.
pub fn attach(pid: i32) -> Result<(), TargetError> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_ATTACH,
            pid,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if ret == -1 {
        return Err(TargetError::Attach(last_os_error()));
    }
    let mut status: libc::c_int = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    Ok(())
}

/// Resume the target. Idempotent: detaching an already-detached target is
/// not an error anyone can act on.
pub fn detach(pid: i32) {
    unsafe {
        libc::ptrace(
            libc::PTRACE_DETACH,
            pid,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        );
    }
}

pub struct AttachGuard {
    pid: i32,
}

impl AttachGuard {
    pub fn new(pid: i32) -> Result<Self, TargetError> {
        attach(pid)?;
        Ok(AttachGuard { pid })
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        detach(self.pid);
    }
}

pub fn read_bytes(pid: i32, addr: usize, len: usize) -> Result<Vec<u8>, TargetError> {
    let handle = (pid as Pid)
        .try_into_process_handle()
        .map_err(|e| TargetError::Attach(e.raw_os_error().unwrap_or(-1)))?;

    let mut buf = vec![0; len];
    handle
        .copy_address(addr, &mut buf)
        .map_err(|e| TargetError::Read(e.raw_os_error().unwrap_or(-1)))?;
    Ok(buf)
}

/// Read up to eight bytes at `addr`, backing off to narrower reads near an
/// unmapped boundary. Returns the bytes and how many were readable.
pub fn peek_bytes(pid: i32, addr: usize) -> Result<([u8; 8], usize), TargetError> {
    let mut last_err = TargetError::Read(-1);
    for len in [8usize, 4, 2, 1] {
        match read_bytes(pid, addr, len) {
            Ok(buf) => {
                let mut bytes = [0u8; 8];
                bytes[..len].copy_from_slice(&buf);
                return Ok((bytes, len));
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

pub fn peek_value(pid: i32, addr: usize) -> Result<Value, TargetError> {
    let (bytes, len) = peek_bytes(pid, addr)?;
    Ok(Value::from_window(&bytes[..len]))
}

pub fn write_bytes(pid: i32, addr: usize, value: &[u8]) -> Result<(), TargetError> {
    let handle = (pid as Pid)
        .try_into_process_handle()
        .map_err(|e| TargetError::Attach(e.raw_os_error().unwrap_or(-1)))?;

    handle
        .put_address(addr, value)
        .map_err(|e| TargetError::Write(e.raw_os_error().unwrap_or(-1)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_to_nonexistent_pid_fails() {
        // pid 0 is never a valid ptrace target
        let result = attach(0);
        assert!(result.is_err());
        match result {
            Err(TargetError::Attach(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    #[ignore = "requires root"]
    fn read_and_write_round_trip() {
        use crate::utils::DemoTarget;

        let mut demo = DemoTarget::spawn("counter");
        let pid = demo.pid();

        let value = read_bytes(pid, demo.address, 4).unwrap();
        assert_eq!(i32::from_ne_bytes(value.try_into().unwrap()), 100);

        let (bytes, len) = peek_bytes(pid, demo.address).unwrap();
        assert!(len >= 4);
        assert_eq!(Value::from_window(&bytes[..len]).i32(false), 100);

        write_bytes(pid, demo.address, &42i32.to_ne_bytes()).unwrap();
        let value = read_bytes(pid, demo.address, 4).unwrap();
        assert_eq!(i32::from_ne_bytes(value.try_into().unwrap()), 42);

        // the target sees the write too
        demo.send("read");
        demo.expect_line("42");
    }

    #[test]
    #[ignore = "requires root"]
    fn attach_detach_brackets_a_pass() {
        use crate::utils::DemoTarget;

        let demo = DemoTarget::spawn("counter");
        let pid = demo.pid();
        {
            let _guard = AttachGuard::new(pid).unwrap();
            let value = read_bytes(pid, demo.address, 4).unwrap();
            assert_eq!(i32::from_ne_bytes(value.try_into().unwrap()), 100);
        }
        // target resumed after the guard dropped, attach works again
        let _guard = AttachGuard::new(pid).unwrap();
    }
}
