// ABOUTME: Terminal plumbing: raw-mode guard, window-size ioctls, cursor escapes

use std::io::{self, Write};
use std::os::fd::{AsFd, RawFd};

use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios,
};

use crate::record::WindowSize;

/// Restores the saved terminal attributes (and the cursor) when dropped.
#[derive(Debug)]
pub struct RawModeGuard {
    saved: Termios,
}

/// Switch stdin to raw mode for an interactive session.
///
/// Disables canonical input, echo, signal generation, flow control and
/// output post-processing, and forces 8-bit characters. The returned guard
/// restores the original attributes on drop.
pub fn enter_raw_mode() -> io::Result<RawModeGuard> {
    let stdin = io::stdin();
    let saved = termios::tcgetattr(stdin.as_fd()).map_err(io::Error::from)?;

    let mut raw = saved.clone();
    raw.local_flags.remove(
        LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG | LocalFlags::IEXTEN,
    );
    raw.input_flags.remove(
        InputFlags::IXON
            | InputFlags::ICRNL
            | InputFlags::BRKINT
            | InputFlags::INPCK
            | InputFlags::ISTRIP,
    );
    raw.output_flags.remove(OutputFlags::OPOST);
    raw.control_flags.insert(ControlFlags::CS8);

    termios::tcsetattr(stdin.as_fd(), SetArg::TCSADRAIN, &raw).map_err(io::Error::from)?;
    Ok(RawModeGuard { saved })
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let stdin = io::stdin();
        let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSADRAIN, &self.saved);
        show_cursor();
    }
}

/// Re-show the cursor; shells under the relay may have hidden it.
pub fn show_cursor() {
    print!("\x1b[?25h\r\n");
    let _ = io::stdout().flush();
}

/// Query the window size of the terminal behind `fd`.
pub fn window_size(fd: RawFd) -> io::Result<WindowSize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(WindowSize::from_winsize(ws))
}

/// Apply `size` to the terminal behind `fd` (a PTY master on the server).
pub fn set_window_size(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let ws = size.to_winsize();
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn window_size_roundtrips_through_a_pty() {
        let pty = nix::pty::openpty(None, None).unwrap();
        let size = WindowSize {
            rows: 40,
            cols: 120,
            xpixel: 0,
            ypixel: 0,
        };
        set_window_size(pty.master.as_raw_fd(), size).unwrap();
        assert_eq!(window_size(pty.master.as_raw_fd()).unwrap(), size);
    }

    #[test]
    fn window_size_fails_on_a_plain_pipe() {
        let (read, _write) = nix::unistd::pipe().unwrap();
        assert!(window_size(read.as_raw_fd()).is_err());
    }
}
