// ABOUTME: Host-side upload and download drivers, each a reduced session engine
// ABOUTME: Validate paths locally, negotiate with the server, stream under backpressure

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::select::{FdSet, select};
use tracing::{info, warn};

use crate::queue::{FrameQueue, Receive};
use crate::record::{MAX_PAYLOAD, ReadyReply, Record, RecordType};
use crate::vsock;

use super::{ClientError, ClientResult};

/// Upload `local_path` into `remote_dir` on the guest.
///
/// The remote file name is the local file's basename. The driver waits for
/// the server's `FILE_READY_SEND` verdict, streams the file under the
/// saturation heuristic, and finishes on `FILE_DATA_END_ACK`.
pub fn run_upload(socket: OwnedFd, local_path: &Path, remote_dir: &str) -> ClientResult<()> {
    let remote_full = compose_remote_target(local_path, remote_dir)?;
    let file = File::open(local_path).map_err(|err| {
        ClientError::InvalidRequest(format!(
            "failed to open '{}': {err}",
            local_path.display()
        ))
    })?;

    vsock::set_nonblocking(socket.as_fd())?;
    let mut queue = FrameQueue::new();
    queue.enqueue(&Record::upload_start(
        &local_path.display().to_string(),
        &remote_full,
    ))?;

    let mut source = Some(file);
    let mut sending = false;
    let mut begun = false;

    loop {
        wait_on_socket(&socket, &queue)?;

        match queue.receive(socket.as_fd())? {
            Receive::Closed => return Err(ClientError::ConnectionClosed),
            Receive::Data(_) | Receive::WouldBlock => {}
        }

        while let Some(record) = queue.next_record()? {
            match record.record_type {
                RecordType::FileReadySend => match ReadyReply::parse(&record.payload)? {
                    ReadyReply::Ok(_) => {
                        info!("server ready, starting upload");
                        sending = true;
                    }
                    ReadyReply::Refused(reason) => return Err(ClientError::Refused(reason)),
                },
                RecordType::FileDataEndAck => {
                    info!("upload completed");
                    return Ok(());
                }
                RecordType::ClientEnd => return Err(ClientError::ConnectionClosed),
                other => {
                    warn!(record_type = ?other, "unexpected record during upload");
                }
            }
        }

        if sending && source.is_some() && !queue.is_saturated() {
            pump_upload(&mut queue, &mut source, &mut begun)?;
        }

        queue.flush(socket.as_fd());
    }
}

/// Producer half of the upload: begin marker once, then chunks until the
/// queue saturates or the file is exhausted.
fn pump_upload(
    queue: &mut FrameQueue,
    source: &mut Option<File>,
    begun: &mut bool,
) -> ClientResult<()> {
    if !*begun {
        queue.enqueue(&Record::file_data_begin())?;
        *begun = true;
    }

    let mut chunk = [0u8; MAX_PAYLOAD];
    loop {
        if queue.is_saturated() || !queue.can_accept(MAX_PAYLOAD) {
            break;
        }
        let Some(file) = source.as_mut() else { break };
        match file.read(&mut chunk) {
            Ok(0) => {
                queue.enqueue(&Record::file_data_end())?;
                *source = None;
                break;
            }
            Ok(count) => queue.enqueue(&Record::file_data(&chunk[..count]))?,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ClientError::Io(err)),
        }
    }
    Ok(())
}

/// Download `remote_path` from the guest into `local_dir`.
///
/// The local file name is the remote file's basename; an existing local
/// file is refused before anything is sent. The file is created
/// exclusively and removed again if the server refuses the transfer.
pub fn run_download(socket: OwnedFd, remote_path: &str, local_dir: &Path) -> ClientResult<()> {
    let local_full = prepare_local_target(remote_path, local_dir)?;
    let mut sink = Some(
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&local_full)
            .map_err(|err| {
                ClientError::InvalidRequest(format!(
                    "failed to create '{}': {err}",
                    local_full.display()
                ))
            })?,
    );

    vsock::set_nonblocking(socket.as_fd())?;
    let mut queue = FrameQueue::new();
    queue.enqueue(&Record::download_start(
        remote_path,
        &local_full.display().to_string(),
    ))?;

    let result = download_loop(&socket, &mut queue, &mut sink);
    if result.is_err() {
        // Do not leave a partial or empty file behind on failure.
        drop(sink.take());
        let _ = fs::remove_file(&local_full);
    }
    result
}

fn download_loop(
    socket: &OwnedFd,
    queue: &mut FrameQueue,
    sink: &mut Option<File>,
) -> ClientResult<()> {
    loop {
        wait_on_socket(socket, queue)?;

        match queue.receive(socket.as_fd())? {
            Receive::Closed => return Err(ClientError::ConnectionClosed),
            Receive::Data(_) | Receive::WouldBlock => {}
        }

        while let Some(record) = queue.next_record()? {
            match record.record_type {
                RecordType::FileReadyRecv => match ReadyReply::parse(&record.payload)? {
                    ReadyReply::Ok(_) => info!("server ready, starting download"),
                    ReadyReply::Refused(reason) => return Err(ClientError::Refused(reason)),
                },
                RecordType::FileDataBegin => {}
                RecordType::FileData => {
                    let file = sink.as_mut().ok_or_else(|| {
                        ClientError::Protocol("FILE_DATA after transfer end".into())
                    })?;
                    file.write_all(&record.payload)?;
                }
                RecordType::FileDataEnd => {
                    drop(sink.take());
                    queue.enqueue(&Record::file_data_end_ack())?;
                    // Final ack; bounded best-effort push before leaving.
                    for _ in 0..8 {
                        if !queue.has_pending() {
                            break;
                        }
                        wait_on_socket(socket, queue)?;
                        queue.flush(socket.as_fd());
                    }
                    info!("download completed");
                    return Ok(());
                }
                RecordType::ClientEnd => return Err(ClientError::ConnectionClosed),
                other => {
                    warn!(record_type = ?other, "unexpected record during download");
                }
            }
        }

        queue.flush(socket.as_fd());
    }
}

/// Block until the socket is readable, or writable while the queue holds
/// pending bytes. EINTR restarts the wait.
fn wait_on_socket(socket: &OwnedFd, queue: &FrameQueue) -> ClientResult<()> {
    loop {
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        read_set.insert(socket.as_fd());
        if queue.has_pending() {
            write_set.insert(socket.as_fd());
        }
        match select(None, &mut read_set, &mut write_set, None, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(ClientError::Io(err.into())),
        }
    }
}

/// Compose the remote destination path for an upload and validate the
/// local source.
fn compose_remote_target(local_path: &Path, remote_dir: &str) -> ClientResult<String> {
    let meta = fs::metadata(local_path).map_err(|_| {
        ClientError::InvalidRequest(format!(
            "local file '{}' does not exist",
            local_path.display()
        ))
    })?;
    if !meta.is_file() {
        return Err(ClientError::InvalidRequest(format!(
            "'{}' is not a regular file",
            local_path.display()
        )));
    }
    let name = local_path
        .file_name()
        .ok_or_else(|| {
            ClientError::InvalidRequest(format!(
                "'{}' has no file name",
                local_path.display()
            ))
        })?
        .to_string_lossy();
    Ok(format!("{remote_dir}/{name}"))
}

/// Compose the local destination path for a download and validate the
/// local directory.
fn prepare_local_target(remote_path: &str, local_dir: &Path) -> ClientResult<PathBuf> {
    let meta = fs::metadata(local_dir).map_err(|_| {
        ClientError::InvalidRequest(format!(
            "local directory '{}' does not exist",
            local_dir.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(ClientError::InvalidRequest(format!(
            "'{}' is not a directory",
            local_dir.display()
        )));
    }
    let name = Path::new(remote_path)
        .file_name()
        .ok_or_else(|| {
            ClientError::InvalidRequest(format!("'{remote_path}' has no file name"))
        })?;
    let local_full = local_dir.join(name);
    if local_full.exists() {
        return Err(ClientError::InvalidRequest(format!(
            "local file '{}' already exists",
            local_full.display()
        )));
    }
    Ok(local_full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn upload_requires_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");
        assert!(matches!(
            compose_remote_target(&missing, "/tmp"),
            Err(ClientError::InvalidRequest(_))
        ));
        assert!(matches!(
            compose_remote_target(dir.path(), "/tmp"),
            Err(ClientError::InvalidRequest(_))
        ));
    }

    #[test]
    fn upload_target_is_basename_under_remote_dir() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("payload.bin");
        std::fs::File::create(&local)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        assert_eq!(
            compose_remote_target(&local, "/tmp").unwrap(),
            "/tmp/payload.bin"
        );
    }

    #[test]
    fn download_refuses_existing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("hostname");
        std::fs::File::create(&existing).unwrap();
        assert!(matches!(
            prepare_local_target("/etc/hostname", dir.path()),
            Err(ClientError::InvalidRequest(_))
        ));
    }

    #[test]
    fn download_target_is_basename_under_local_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            prepare_local_target("/etc/hostname", dir.path()).unwrap(),
            dir.path().join("hostname")
        );
    }

    #[test]
    fn download_requires_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            prepare_local_target("/etc/hostname", &missing),
            Err(ClientError::InvalidRequest(_))
        ));
    }
}
