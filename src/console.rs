//! Guest console capture and panic detection.
//!
//! A watcher task drains the guest's serial console, appends every
//! line to the transcript (when an output directory is configured),
//! and reports the first panic signature into the session's signal
//! channel. Output capture never blocks on the signal side.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::SessionSignal;

/// Console line every mainline kernel emits on panic.
pub const PANIC_SIGNATURE: &str = "Kernel panic - not syncing";

/// How long to wait for QEMU to bind the console socket after start.
const CONNECT_WINDOW: Duration = Duration::from_secs(10);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Connect to the console socket and scan it until EOF. Intended to be
/// spawned; a missing socket is logged and swallowed so a console-less
/// run degrades to state polling only.
pub async fn watch_console(
    sock: PathBuf,
    transcript: Option<PathBuf>,
    tx: mpsc::Sender<SessionSignal>,
) {
    let stream = match connect(&sock).await {
        Some(stream) => stream,
        None => {
            debug!(sock = %sock.display(), "Console socket never appeared");
            return;
        }
    };
    if let Err(e) = scan_stream(stream, transcript.as_deref(), tx).await {
        warn!(error = %e, "Console watcher failed");
    }
}

async fn connect(sock: &Path) -> Option<UnixStream> {
    let deadline = tokio::time::Instant::now() + CONNECT_WINDOW;
    while tokio::time::Instant::now() < deadline {
        if let Ok(stream) = UnixStream::connect(sock).await {
            return Some(stream);
        }
        tokio::time::sleep(CONNECT_RETRY).await;
    }
    None
}

/// Drain a console stream line by line. The first line carrying the
/// panic signature sends [`SessionSignal::Panic`]; the transcript keeps
/// filling afterwards so the tail of the oops is not lost.
pub async fn scan_stream<R: AsyncRead + Unpin>(
    stream: R,
    transcript: Option<&Path>,
    tx: mpsc::Sender<SessionSignal>,
) -> std::io::Result<()> {
    let mut transcript = match transcript {
        Some(path) => Some(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?,
        ),
        None => None,
    };

    let mut lines = BufReader::new(stream).lines();
    let mut panic_sent = false;
    while let Some(line) = lines.next_line().await? {
        if let Some(file) = transcript.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        if !panic_sent && line.contains(PANIC_SIGNATURE) {
            panic_sent = true;
            let _ = tx.send(SessionSignal::Panic(line.clone())).await;
        }
    }
    if let Some(file) = transcript.as_mut() {
        file.flush().await?;
    }
    Ok(())
}
