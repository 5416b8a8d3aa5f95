use crate::status::Result;
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, Ordering};

/// Signal-driven state bits. Handlers only OR a bit into the process-wide
/// bitmask; the supervising loop reads-and-clears bits after `sigsuspend`.
pub const FLAG_REAP: u32 = 1 << 0;
pub const FLAG_TERMINATE: u32 = 1 << 1;
pub const FLAG_QUIT: u32 = 1 << 2;
pub const FLAG_RECONFIGURE: u32 = 1 << 3;
pub const FLAG_ALARM: u32 = 1 << 4;
pub const FLAG_IO: u32 = 1 << 5;
pub const FLAG_REOPEN: u32 = 1 << 6;

static FLAGS: AtomicU32 = AtomicU32::new(0);

/// Signals owned by the framework, in both supervisor and workers.
const HANDLED: [Signal; 8] = [
    Signal::SIGCHLD,
    Signal::SIGALRM,
    Signal::SIGIO,
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGUSR1,
];

#[inline]
pub fn flag_for(signal: Signal) -> Option<u32> {
    match signal {
        Signal::SIGCHLD => Some(FLAG_REAP),
        Signal::SIGTERM | Signal::SIGINT => Some(FLAG_TERMINATE),
        Signal::SIGQUIT => Some(FLAG_QUIT),
        Signal::SIGHUP => Some(FLAG_RECONFIGURE),
        Signal::SIGALRM => Some(FLAG_ALARM),
        Signal::SIGIO => Some(FLAG_IO),
        Signal::SIGUSR1 => Some(FLAG_REOPEN),
        _ => None,
    }
}

extern "C" fn on_signal(signo: libc::c_int) {
    if let Ok(signal) = Signal::try_from(signo) {
        if let Some(bit) = flag_for(signal) {
            FLAGS.fetch_or(bit, Ordering::Relaxed);
        }
    }
}

/// Installs the flag-setting handler for every framework signal.
pub fn install() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());

    for &sig in HANDLED.iter() {
        unsafe { signal::sigaction(sig, &action)? };
    }
    Ok(())
}

fn handled_set() -> SigSet {
    let mut set = SigSet::empty();
    for &sig in HANDLED.iter() {
        set.add(sig);
    }
    set
}

/// Blocks the framework signal set; they are only delivered inside
/// `suspend`.
pub fn block() -> Result<()> {
    signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&handled_set()), None)?;
    Ok(())
}

/// Clears the signal mask. Spawned workers inherit the supervisor's mask
/// across exec and must undo it before entering their own loop.
pub fn unblock_all() -> Result<()> {
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    Ok(())
}

/// Waits for one signal delivery with the mask fully open.
pub fn suspend() {
    // sigsuspend always returns EINTR once a handler has run.
    let _ = SigSet::empty().suspend();
}

/// Reads and clears one flag bit.
#[inline]
pub fn take(bit: u32) -> bool {
    FLAGS.fetch_and(!bit, Ordering::Relaxed) & bit != 0
}

/// True while the bit is set; does not clear it.
#[inline]
pub fn peek(bit: u32) -> bool {
    FLAGS.load(Ordering::Relaxed) & bit != 0
}

/// Sets a flag from regular code, e.g. when a dead worker is discovered
/// outside of SIGCHLD delivery.
#[inline]
pub fn raise(bit: u32) {
    FLAGS.fetch_or(bit, Ordering::Relaxed);
}

/// Arms the real-time interval timer to deliver SIGALRM once after
/// `delay_ms`. Drives the graceful-shutdown backoff.
pub fn arm_timer(delay_ms: u64) -> Result<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval {
            tv_sec: (delay_ms / 1000) as libc::time_t,
            tv_usec: ((delay_ms % 1000) * 1000) as libc::suseconds_t,
        },
    };

    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    if rc == -1 {
        return Err(nix::errno::Errno::last().into());
    }
    Ok(())
}

/// Command names accepted by `signal_process`, mapped onto the signal the
/// running instance interprets.
pub fn signal_by_name(name: &str) -> Option<Signal> {
    match name {
        "stop" => Some(Signal::SIGTERM),
        "quit" => Some(Signal::SIGQUIT),
        "reload" => Some(Signal::SIGHUP),
        "reopen" => Some(Signal::SIGUSR1),
        "kill" => Some(Signal::SIGKILL),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The bitmask is process-global, so each test below owns a disjoint
    // set of bits to stay independent of concurrently running tests.

    #[test]
    fn test_take_clears_single_bit() {
        raise(FLAG_QUIT | FLAG_RECONFIGURE);

        assert!(take(FLAG_QUIT));
        assert!(!take(FLAG_QUIT));
        // The other bit must survive the read-and-clear.
        assert!(take(FLAG_RECONFIGURE));
    }

    #[test]
    fn test_peek_does_not_clear() {
        raise(FLAG_IO);
        assert!(peek(FLAG_IO));
        assert!(peek(FLAG_IO));
        assert!(take(FLAG_IO));
        assert!(!peek(FLAG_IO));
    }

    #[test]
    fn test_flag_mapping() {
        assert_eq!(flag_for(Signal::SIGTERM), Some(FLAG_TERMINATE));
        assert_eq!(flag_for(Signal::SIGINT), Some(FLAG_TERMINATE));
        assert_eq!(flag_for(Signal::SIGCHLD), Some(FLAG_REAP));
        assert_eq!(flag_for(Signal::SIGHUP), Some(FLAG_RECONFIGURE));
        assert_eq!(flag_for(Signal::SIGUSR1), Some(FLAG_REOPEN));
        assert_eq!(flag_for(Signal::SIGSEGV), None);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_by_name("stop"), Some(Signal::SIGTERM));
        assert_eq!(signal_by_name("quit"), Some(Signal::SIGQUIT));
        assert_eq!(signal_by_name("reload"), Some(Signal::SIGHUP));
        assert_eq!(signal_by_name("reopen"), Some(Signal::SIGUSR1));
        assert_eq!(signal_by_name("restart"), None);
    }
}
