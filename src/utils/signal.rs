//! SIGINT/SIGTERM handling for image builds.
//!
//! The first signal only raises a flag. The pipeline checks it between
//! phases and stops, after which teardown releases everything acquired so
//! far. A second signal terminates immediately and leaves recovery to
//! `lvmrootfs cleanup`.

use crate::utils::error::{LvmRootfsError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use tracing::warn;

const HANDLED: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

const FIRST_NOTICE: &[u8] = b"\nInterrupt received, stopping after the current command...\n";
const FORCED_NOTICE: &[u8] =
    b"\nForced exit, devices may still be attached. Run: lvmrootfs cleanup\n";

/// Signals received so far
static RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Number of the first signal, 0 until one arrives
static FIRST_SIGNAL: AtomicI32 = AtomicI32::new(0);

fn notice(msg: &[u8]) {
    // write(2) is async-signal-safe; the result is irrelevant here
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
}

extern "C" fn on_signal(sig: libc::c_int) {
    if RECEIVED.fetch_add(1, Ordering::SeqCst) == 0 {
        FIRST_SIGNAL.store(sig, Ordering::SeqCst);
        notice(FIRST_NOTICE);
        return;
    }
    notice(FORCED_NOTICE);
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Route SIGINT and SIGTERM to the build's interrupt flag. Calling it again
/// just reinstalls the same handler.
pub fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in HANDLED {
        if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
            warn!("Could not install {} handler: {}", sig, e);
        }
    }
}

pub fn is_interrupted() -> bool {
    RECEIVED.load(Ordering::SeqCst) > 0
}

/// Fail with [`LvmRootfsError::Interrupted`] once a signal has arrived.
pub fn check_interrupted() -> Result<()> {
    if is_interrupted() {
        Err(LvmRootfsError::Interrupted)
    } else {
        Ok(())
    }
}

/// The first signal received, if any
pub fn received_signal() -> Option<Signal> {
    match FIRST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        n => Signal::try_from(n).ok(),
    }
}

/// After teardown: die from the first signal under its default
/// disposition, so the parent sees the real exit status.
pub fn reraise() {
    let Some(sig) = received_signal() else {
        return;
    };
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = signal::sigaction(sig, &default);
    }
    let _ = signal::raise(sig);
}
