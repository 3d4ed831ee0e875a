//! Best-effort event reports to the host application.
//!
//! Each report is one line of JSON over a named Unix datagram socket. The
//! receiver may not exist; sends are fire-and-forget with a one-second
//! write deadline and no queue on this side. A failed send drops the cached
//! socket so the next report lazily reconnects.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

const REPORT_SOCKET: &str = "adblock_report.sock";

/// One report record. Field order is the wire order.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMessage {
    /// Milliseconds since the Unix epoch.
    pub time: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub pid: u32,
    pub process: String,
    pub website: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl ReportMessage {
    pub fn new(kind: impl Into<String>, website: impl Into<String>) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            time,
            kind: kind.into(),
            pid: std::process::id(),
            process: current_process_name(),
            website: website.into(),
            location: None,
            rule: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }
}

fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
mod imp {
    use super::ReportMessage;
    use std::os::unix::net::UnixDatagram;
    use std::path::PathBuf;
    use std::time::Duration;

    use parking_lot::Mutex;

    pub struct ReportSender {
        path: PathBuf,
        socket: Mutex<Option<UnixDatagram>>,
    }

    impl ReportSender {
        pub fn new() -> Self {
            Self::to(std::env::temp_dir().join(super::REPORT_SOCKET))
        }

        pub fn to(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                socket: Mutex::new(None),
            }
        }

        /// Sends one report. Never blocks past the write deadline and never
        /// reports failure; an unreachable receiver simply loses the record.
        pub fn send(&self, message: &ReportMessage) {
            let line = match serde_json::to_string(message) {
                Ok(line) => line,
                Err(_) => return,
            };
            let mut slot = self.socket.lock();
            if slot.is_none() {
                let socket = match UnixDatagram::unbound() {
                    Ok(socket) => socket,
                    Err(_) => return,
                };
                let _ = socket.set_write_timeout(Some(Duration::from_secs(1)));
                if socket.connect(&self.path).is_err() {
                    return;
                }
                *slot = Some(socket);
            }
            if let Some(socket) = slot.as_ref() {
                if socket.send(line.as_bytes()).is_err() {
                    *slot = None;
                }
            }
        }
    }

    impl Default for ReportSender {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::ReportMessage;
    use std::path::PathBuf;

    /// No local datagram transport on this platform; reports are dropped.
    pub struct ReportSender;

    impl ReportSender {
        pub fn new() -> Self {
            Self
        }

        pub fn to(_path: impl Into<PathBuf>) -> Self {
            Self
        }

        pub fn send(&self, _message: &ReportMessage) {}
    }

    impl Default for ReportSender {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub use imp::ReportSender;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use std::time::{Duration, Instant};

    #[test]
    fn report_arrives_as_one_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let sender = ReportSender::to(&path);
        let message = ReportMessage::new("block", "http://ads.example/x.js")
            .with_location("http://example.com/")
            .with_rule("||ads.example^");
        sender.send(&message);

        let mut buf = [0u8; 4096];
        let n = receiver.recv(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(!text.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["type"], "block");
        assert_eq!(parsed["website"], "http://ads.example/x.js");
        assert_eq!(parsed["location"], "http://example.com/");
        assert_eq!(parsed["rule"], "||ads.example^");
        assert_eq!(parsed["pid"], std::process::id());
        assert!(parsed["time"].as_u64().unwrap() > 0);
    }

    #[test]
    fn optional_fields_are_omitted_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        ReportSender::to(&path).send(&ReportMessage::new("whitelist", "http://example.com/"));

        let mut buf = [0u8; 4096];
        let n = receiver.recv(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(!text.contains("location"));
        assert!(!text.contains("rule"));
    }

    #[test]
    fn missing_receiver_costs_bounded_time_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.sock");
        let sender = ReportSender::to(&path);

        let start = Instant::now();
        sender.send(&ReportMessage::new("block", "http://a/"));
        sender.send(&ReportMessage::new("block", "http://b/"));
        assert!(start.elapsed() < Duration::from_secs(3));

        // a receiver that appears later gets subsequent reports
        let receiver = UnixDatagram::bind(&path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        sender.send(&ReportMessage::new("block", "http://c/"));
        let mut buf = [0u8; 4096];
        let n = receiver.recv(&mut buf).unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("http://c/"));
    }
}
