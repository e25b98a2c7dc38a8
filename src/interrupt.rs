use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Cooperative cancellation for long scans and continuous writes. The
/// engine never unwinds out of a pass; it polls this flag at region and
/// swath boundaries and between sleep cycles.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route SIGINT into the cancel flag. SIGINT is blocked in the calling
/// thread (and everything it spawns afterwards) and consumed by a dedicated
/// sigwait thread, so Ctrl+C interrupts the current command instead of
/// killing the process.
pub fn install_sigint(flag: &CancelFlag) {
    let flag = flag.clone();

    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
    }

    thread::spawn(move || {
        loop {
            unsafe {
                let mut mask: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut mask);
                libc::sigaddset(&mut mask, libc::SIGINT);
                let mut sig: libc::c_int = 0;
                if libc::sigwait(&mask, &mut sig) == 0 {
                    flag.cancel();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_round_trip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
        flag.clear();
        assert!(!clone.is_cancelled());
    }
}
