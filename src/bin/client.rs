// ABOUTME: vsock-shell client binary: one terminal or file-transfer session per invocation

use std::path::PathBuf;
use std::process;

use argh::FromArgs;
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

use vsock_shell::client;
use vsock_shell::vsock;

/// Host-side client for the vsock-shell guest server.
#[derive(FromArgs)]
struct ClientArgs {
    /// guest VM context id (required, nonzero)
    #[argh(option)]
    cid: u32,

    /// server port number (default: 9999)
    #[argh(option, default = "vsock::DEFAULT_PORT")]
    port: u32,

    /// execute a one-shot command instead of an interactive shell
    #[argh(option)]
    cmd: Option<String>,

    /// upload a local file to the guest
    #[argh(option)]
    upload: Option<PathBuf>,

    /// download a remote file from the guest
    #[argh(option)]
    download: Option<String>,

    /// remote directory for uploads (default: /tmp)
    #[argh(option, default = "String::from(\"/tmp\")")]
    remote_dir: String,

    /// local directory for downloads (default: .)
    #[argh(option, default = "PathBuf::from(\".\")")]
    local_dir: PathBuf,
}

fn main() {
    let args: ClientArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if args.cid == 0 {
        eprintln!("error: --cid must be nonzero");
        process::exit(1);
    }

    println!("Connecting to CID {} on port {}...", args.cid, args.port);
    let socket = match vsock::connect(args.cid, args.port) {
        Ok(fd) => fd,
        Err(err) => {
            error!(cid = args.cid, port = args.port, error = %err, "failed to connect");
            process::exit(1);
        }
    };
    println!("Connected successfully");

    let result = if let Some(local_path) = &args.upload {
        println!(
            "Uploading '{}' to '{}' on guest...",
            local_path.display(),
            args.remote_dir
        );
        client::run_upload(socket, local_path, &args.remote_dir)
    } else if let Some(remote_path) = &args.download {
        println!(
            "Downloading '{}' to '{}' on host...",
            remote_path,
            args.local_dir.display()
        );
        client::run_download(socket, remote_path, &args.local_dir)
    } else {
        match &args.cmd {
            Some(cmd) => println!("Executing: {cmd}"),
            None => println!("Starting interactive shell..."),
        }
        client::run_terminal_session(socket, args.cmd.as_deref())
    };

    if let Err(err) = result {
        error!(error = %err, "session failed");
        eprintln!("error: {err}");
        process::exit(1);
    }
}
