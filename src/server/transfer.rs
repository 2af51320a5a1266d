// ABOUTME: File-transfer branches of the server session state machine
// ABOUTME: Upload sink and download source, both under frame-queue backpressure

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{error, info};

use crate::record::{self, MAX_PAYLOAD, ReadyReply, Record};

use super::{Session, SessionError, SessionMode};

/// `FILE_UPLOAD_START`: validate the request, open the destination, reply.
///
/// The destination-exists check is the create-exclusive open itself, so
/// check and create are one race-free step. The session enters
/// `UploadSink` only when the reply is OK.
pub(super) fn handle_upload_start(
    session: &mut Session,
    payload: &[u8],
) -> Result<(), SessionError> {
    let text = record::decode_text(payload)?;
    let (source, dest) = record::split_path_pair(text)
        .ok_or_else(|| SessionError::Protocol("malformed upload request".into()))?;

    info!(source, dest, "upload request");

    let reply = match open_upload_target(dest) {
        Ok(file) => {
            session.file = Some(file);
            session.file_path = Some(dest.into());
            session.mode = SessionMode::UploadSink;
            info!(dest, "ready to receive file");
            ReadyReply::ok(source, dest)
        }
        Err(reason) => {
            error!(dest, %reason, "upload refused");
            ReadyReply::refused(reason)
        }
    };

    session.queue.enqueue(&Record::ready_send(&reply))?;
    Ok(())
}

fn open_upload_target(dest: &str) -> Result<File, String> {
    let path = Path::new(dest);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !dir.is_dir() {
        return Err(format!(
            "destination directory '{}' does not exist",
            dir.display()
        ));
    }

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(format!("destination '{dest}' already exists"))
        }
        Err(err) => Err(format!("failed to create file: {err}")),
    }
}

/// `FILE_DOWNLOAD_START`: validate the source, open it read-only, reply.
pub(super) fn handle_download_start(
    session: &mut Session,
    payload: &[u8],
) -> Result<(), SessionError> {
    let text = record::decode_text(payload)?;
    let (source, dest) = record::split_path_pair(text)
        .ok_or_else(|| SessionError::Protocol("malformed download request".into()))?;

    info!(source, dest, "download request");

    let reply = match open_download_source(source) {
        Ok(file) => {
            session.file = Some(file);
            session.file_path = Some(source.into());
            session.mode = SessionMode::DownloadSource;
            session.transfer_begun = false;
            info!(source, "ready to send file");
            ReadyReply::ok(source, dest)
        }
        Err(reason) => {
            error!(source, %reason, "download refused");
            ReadyReply::refused(reason)
        }
    };

    session.queue.enqueue(&Record::ready_recv(&reply))?;
    Ok(())
}

fn open_download_source(source: &str) -> Result<File, String> {
    let meta = std::fs::metadata(source)
        .map_err(|_| format!("source file '{source}' does not exist"))?;
    if !meta.is_file() {
        return Err(format!("'{source}' is not a regular file"));
    }
    File::open(source).map_err(|err| format!("failed to open file: {err}"))
}

/// `FILE_DATA` while in `UploadSink`: append the chunk to the file.
///
/// Any write failure is fatal for the session; a half-written upload must
/// not be acknowledged.
pub(super) fn handle_file_data(session: &mut Session, payload: &[u8]) -> Result<(), SessionError> {
    if session.mode != SessionMode::UploadSink {
        return Err(SessionError::Protocol("FILE_DATA outside upload".into()));
    }
    let file = session
        .file
        .as_mut()
        .ok_or_else(|| SessionError::Protocol("FILE_DATA after transfer end".into()))?;
    file.write_all(payload)?;
    Ok(())
}

/// `FILE_DATA_END` while in `UploadSink`: close the file and acknowledge.
pub(super) fn handle_file_data_end(session: &mut Session) -> Result<(), SessionError> {
    if session.mode != SessionMode::UploadSink {
        return Err(SessionError::Protocol("FILE_DATA_END outside upload".into()));
    }
    drop(session.file.take());
    info!(path = ?session.file_path, "file transfer completed");
    session.queue.enqueue(&Record::file_data_end_ack())?;
    Ok(())
}

/// Download producer: stream file chunks while the queue has room.
///
/// Emits `FILE_DATA_BEGIN` once, then reads up to 4096 bytes at a time,
/// yielding as soon as the queue saturates or lacks contiguous room for a
/// full chunk. The main loop re-enters on the next tick. EOF emits
/// `FILE_DATA_END` and closes the file.
pub(super) fn pump_download(session: &mut Session) -> Result<(), SessionError> {
    if !session.transfer_begun {
        session.queue.enqueue(&Record::file_data_begin())?;
        session.transfer_begun = true;
    }

    let mut chunk = [0u8; MAX_PAYLOAD];
    loop {
        if session.queue.is_saturated() || !session.queue.can_accept(MAX_PAYLOAD) {
            break;
        }
        let Some(file) = session.file.as_mut() else {
            break;
        };
        match file.read(&mut chunk) {
            Ok(0) => {
                session.queue.enqueue(&Record::file_data_end())?;
                drop(session.file.take());
                info!(path = ?session.file_path, "file send completed");
                break;
            }
            Ok(count) => {
                session.queue.enqueue(&Record::file_data(&chunk[..count]))?;
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(error = %err, path = ?session.file_path, "file read failed");
                return Err(SessionError::Io(err));
            }
        }
    }
    Ok(())
}
