// ABOUTME: Self-pipe bridge turning async signals into select-visible events
// ABOUTME: Handlers write the signal number to a pipe whose read end joins the select set

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd;

static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

// Async-signal-safe: one write(2) on a pre-opened nonblocking pipe.
extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        let _ = unsafe { libc::write(fd, std::ptr::from_ref(&byte).cast(), 1) };
    }
}

/// The read end of the process's signal pipe.
///
/// `install` registers handlers whose only action is to write the signal
/// number to the pipe; the main loop puts [`SignalPipe::as_fd`] in its
/// select set and calls [`SignalPipe::drain`] when it becomes readable.
/// One pipe per process.
#[derive(Debug)]
pub struct SignalPipe {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalPipe {
    /// Create the pipe and install the forwarding handler for `signals`.
    pub fn install(signals: &[Signal]) -> nix::Result<Self> {
        let (read, write) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        NOTIFY_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in signals {
            unsafe { sigaction(*sig, &action)? };
        }

        Ok(Self {
            read,
            _write: write,
        })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.read.as_fd()
    }

    /// Drain all queued notifications, returning the signals observed.
    pub fn drain(&self) -> Vec<Signal> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.as_fd().as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    for &byte in &buf[..count] {
                        if let Ok(sig) = Signal::try_from(i32::from(byte)) {
                            signals.push(sig);
                        }
                    }
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "signal pipe read failed");
                    break;
                }
            }
        }
        signals
    }
}
