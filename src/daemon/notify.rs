//! Netfilter-flush notification socket
//!
//! External hooks (firewall scripts, firmware netfilter.d handlers) tell the
//! daemon that a netfilter table was flushed by writing one ASCII line to a
//! unix stream socket: `netfilter.d:<event>:<table>`. There is no reply;
//! the daemon reacts by re-installing its chains for that table.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::DaemonError;

/// Maximum accepted notification size
pub const MAX_NOTICE_SIZE: usize = 1024;

/// A parsed flush notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushNotice {
    /// Event name as sent by the hook (informational)
    pub event: String,
    /// Flushed table: all, nat, mangle or filter
    pub table: String,
}

/// Parse a raw notification payload
///
/// The shape is exactly three `:`-separated fields with a `netfilter.d`
/// prefix; anything else is ignored.
#[must_use]
pub fn parse_notice(raw: &str) -> Option<FlushNotice> {
    let mut parts = raw.trim().split(':');
    let prefix = parts.next()?;
    let event = parts.next()?;
    let table = parts.next()?;
    if prefix != "netfilter.d" || parts.next().is_some() {
        return None;
    }
    Some(FlushNotice {
        event: event.to_string(),
        table: table.to_string(),
    })
}

/// Listener for flush notifications
pub struct NotifyListener {
    listener: UnixListener,
    path: PathBuf,
}

impl NotifyListener {
    /// Bind the socket, unlinking any stale file at the path first
    pub fn bind(path: &Path) -> Result<Self, DaemonError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale notification socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(DaemonError::notify_socket(
                    path.display().to_string(),
                    format!("failed to remove stale socket: {e}"),
                ));
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DaemonError::notify_socket(
                        path.display().to_string(),
                        format!("failed to create parent directory: {e}"),
                    )
                })?;
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            DaemonError::notify_socket(path.display().to_string(), e.to_string())
        })?;

        info!(path = %path.display(), "notification socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept connections until shutdown, forwarding parsed notices
    ///
    /// The socket file is unlinked on the way out.
    pub async fn run(self, tx: mpsc::Sender<FlushNotice>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((mut stream, _)) => {
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                let mut buf = [0u8; MAX_NOTICE_SIZE];
                                let len = match stream.read(&mut buf).await {
                                    Ok(len) => len,
                                    Err(e) => {
                                        debug!(error = %e, "notification read failed");
                                        return;
                                    }
                                };
                                let raw = String::from_utf8_lossy(&buf[..len]);
                                match parse_notice(&raw) {
                                    Some(notice) => {
                                        debug!(table = %notice.table, event = %notice.event, "flush notice");
                                        let _ = tx.send(notice).await;
                                    }
                                    None => warn!(raw = %raw, "unrecognized notification"),
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "notification accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to unlink notification socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[test]
    fn test_parse_notice() {
        assert_eq!(
            parse_notice("netfilter.d:hook:nat"),
            Some(FlushNotice {
                event: "hook".into(),
                table: "nat".into()
            })
        );
        assert_eq!(
            parse_notice("netfilter.d::all\n"),
            Some(FlushNotice {
                event: String::new(),
                table: "all".into()
            })
        );
        assert!(parse_notice("netfilter.d:onlytwo").is_none());
        assert!(parse_notice("other.d:x:nat").is_none());
        assert!(parse_notice("netfilter.d:a:b:c").is_none());
        assert!(parse_notice("").is_none());
    }

    #[tokio::test]
    async fn test_listener_delivers_notices_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routemark.sock");

        let listener = NotifyListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(listener.run(tx, shutdown_tx.subscribe()));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"netfilter.d:iptables:mangle").await.unwrap();
        drop(stream);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.table, "mangle");

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(!path.exists(), "socket file must be unlinked on shutdown");
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routemark.sock");

        let first = NotifyListener::bind(&path).unwrap();
        drop(first);
        // The file is still there; bind must replace it.
        NotifyListener::bind(&path).unwrap();
    }
}
