// ABOUTME: vsock-shell server binary: accepts guest-side sessions over AF_VSOCK
// ABOUTME: Runs the single-threaded select loop over listener, signal pipe, and sessions

use std::os::fd::{AsFd, BorrowedFd};
use std::process;

use argh::FromArgs;
use nix::errno::Errno;
use nix::sys::select::{FdSet, select};
use nix::sys::signal::Signal;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use vsock_shell::server::Server;
use vsock_shell::signal::SignalPipe;
use vsock_shell::vsock;

/// Guest-side shell and file-transfer server over AF_VSOCK.
#[derive(FromArgs)]
struct ServerArgs {
    /// listen port number (default: 9999)
    #[argh(option, default = "vsock::DEFAULT_PORT")]
    port: u32,
}

fn main() {
    let args: ServerArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("starting vsock-shell server");

    let signal_pipe =
        match SignalPipe::install(&[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT]) {
            Ok(pipe) => pipe,
            Err(err) => {
                error!(error = %err, "failed to install signal handlers");
                process::exit(1);
            }
        };

    let listener = match vsock::listen(args.port) {
        Ok(fd) => fd,
        Err(err) => {
            error!(port = args.port, error = %err, "failed to bind listen socket");
            process::exit(1);
        }
    };
    info!(port = args.port, "listening");

    println!("vsock-shell server started on port {}", args.port);
    println!("Waiting for connections...");

    let mut server = Server::new();
    let mut running = true;

    while running {
        let sources = server.poll_sources();

        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        read_set.insert(listener.as_fd());
        read_set.insert(signal_pipe.as_fd());
        // Session fds are owned by the engine and outlive the tick; the
        // snapshot taken above is what keeps this borrow honest.
        for source in &sources {
            read_set.insert(unsafe { BorrowedFd::borrow_raw(source.socket_fd) });
            if let Some(pty_fd) = source.pty_fd {
                read_set.insert(unsafe { BorrowedFd::borrow_raw(pty_fd) });
            }
            if source.wants_write {
                write_set.insert(unsafe { BorrowedFd::borrow_raw(source.socket_fd) });
            }
        }

        match select(None, &mut read_set, &mut write_set, None, None) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!(error = %err, "select failed");
                break;
            }
        }

        if read_set.contains(listener.as_fd()) {
            accept_connection(&listener, &mut server);
        }

        if read_set.contains(signal_pipe.as_fd()) {
            for sig in signal_pipe.drain() {
                match sig {
                    Signal::SIGCHLD => server.reap_children(),
                    Signal::SIGTERM | Signal::SIGINT => {
                        info!(signal = %sig, "shutdown requested");
                        running = false;
                    }
                    _ => {}
                }
            }
        }

        for source in &sources {
            let socket_fd = unsafe { BorrowedFd::borrow_raw(source.socket_fd) };
            let socket_ready = read_set.contains(socket_fd);
            let pty_ready = source
                .pty_fd
                .is_some_and(|fd| read_set.contains(unsafe { BorrowedFd::borrow_raw(fd) }));
            server.service(source.socket_fd, socket_ready, pty_ready);
        }
    }

    server.destroy_all();
    info!("server shutdown");
}

fn accept_connection(listener: &std::os::fd::OwnedFd, server: &mut Server) {
    match vsock::accept(listener) {
        Ok((stream, peer_cid)) => {
            info!(cid = peer_cid, "new connection");
            if let Err(err) = vsock::set_nonblocking(stream.as_fd()) {
                error!(error = %err, "failed to set socket nonblocking");
                return;
            }
            server.adopt(stream, peer_cid);
        }
        Err(err) => {
            error!(error = %err, "failed to accept connection");
        }
    }
}
