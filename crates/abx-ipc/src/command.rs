//! Command channel: a small slot-pool server the blocker runs, and the
//! client other local processes use to drive it.
//!
//! The wire format is one newline-terminated JSON request per connection,
//! answered with an empty-line ack. Four slot threads share one listener;
//! each cycles accept, serve, disconnect. Malformed requests are logged,
//! acked and otherwise ignored so a buggy client cannot wedge a slot.

use serde::{Deserialize, Serialize};

pub const CMD_ENABLE: i32 = 1;
pub const CMD_DISABLE: i32 = 2;
pub const CMD_ADD_EXCEPTION: i32 = 3;
pub const CMD_REMOVE_EXCEPTION: i32 = 4;

const COMMAND_SOCKET: &str = "adblock_command.sock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub cmd: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl CommandRequest {
    pub fn enable() -> Self {
        Self {
            cmd: CMD_ENABLE,
            domain: None,
        }
    }

    pub fn disable() -> Self {
        Self {
            cmd: CMD_DISABLE,
            domain: None,
        }
    }

    pub fn add_exception(domain: impl Into<String>) -> Self {
        Self {
            cmd: CMD_ADD_EXCEPTION,
            domain: Some(domain.into()),
        }
    }

    pub fn remove_exception(domain: impl Into<String>) -> Self {
        Self {
            cmd: CMD_REMOVE_EXCEPTION,
            domain: Some(domain.into()),
        }
    }
}

/// Receives dispatched commands. Implemented by the blocker facade.
pub trait CommandHandler: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    fn add_exception(&self, domain: &str);
    fn remove_exception(&self, domain: &str);
}

fn dispatch(handler: &dyn CommandHandler, request: &CommandRequest) {
    let domain = request.domain.as_deref().unwrap_or("");
    match request.cmd {
        CMD_ENABLE => handler.set_enabled(true),
        CMD_DISABLE => handler.set_enabled(false),
        CMD_ADD_EXCEPTION => handler.add_exception(domain),
        CMD_REMOVE_EXCEPTION => handler.remove_exception(domain),
        other => log::warn!("ignoring unknown command {other}"),
    }
}

pub fn default_socket_path() -> std::path::PathBuf {
    std::env::temp_dir().join(COMMAND_SOCKET)
}

#[cfg(unix)]
mod imp {
    use super::{dispatch, CommandHandler, CommandRequest};
    use std::io::{self, BufRead, BufReader, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    /// Number of concurrent connections served.
    const SLOTS: usize = 4;

    pub struct CommandServer {
        path: PathBuf,
        shutdown: Arc<AtomicBool>,
        slots: Vec<JoinHandle<()>>,
    }

    impl CommandServer {
        /// Binds the socket (replacing any stale one) and starts the slot
        /// threads.
        pub fn start(
            path: impl Into<PathBuf>,
            handler: Arc<dyn CommandHandler>,
        ) -> io::Result<CommandServer> {
            let path = path.into();
            let _ = std::fs::remove_file(&path);
            let listener = Arc::new(UnixListener::bind(&path)?);
            let shutdown = Arc::new(AtomicBool::new(false));
            let mut slots = Vec::with_capacity(SLOTS);
            for i in 0..SLOTS {
                let listener = listener.clone();
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                slots.push(
                    thread::Builder::new()
                        .name(format!("abx-cmd-{i}"))
                        .spawn(move || serve_slot(&listener, handler.as_ref(), &shutdown))?,
                );
            }
            Ok(CommandServer {
                path,
                shutdown,
                slots,
            })
        }

        /// Stops accepting, wakes every slot and joins them.
        pub fn stop(self) {}
    }

    impl Drop for CommandServer {
        fn drop(&mut self) {
            self.shutdown.store(true, Ordering::SeqCst);
            // each slot is parked in accept(); poke them loose
            for _ in 0..SLOTS {
                let _ = UnixStream::connect(&self.path);
            }
            for slot in self.slots.drain(..) {
                let _ = slot.join();
            }
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn serve_slot(listener: &UnixListener, handler: &dyn CommandHandler, shutdown: &AtomicBool) {
        loop {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(_) => {
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
            };
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            serve_connection(stream, handler);
        }
    }

    fn serve_connection(stream: UnixStream, handler: &dyn CommandHandler) {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() {
            return;
        }
        let line = line.trim();
        if !line.is_empty() {
            match serde_json::from_str::<CommandRequest>(line) {
                Ok(request) => dispatch(handler, &request),
                Err(err) => log::warn!("malformed command request: {err}"),
            }
        }
        let mut stream = reader.into_inner();
        let _ = stream.write_all(b"\n");
        let _ = stream.flush();
    }

    /// Client side: one request per connection, with a bounded retry loop
    /// to ride out "server still starting" and "all slots busy".
    pub struct CommandClient {
        path: PathBuf,
    }

    impl CommandClient {
        pub fn new() -> Self {
            Self::to(super::default_socket_path())
        }

        pub fn to(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn send(&self, request: &CommandRequest) -> io::Result<()> {
            let line = serde_json::to_string(request)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut last_err = io::Error::new(io::ErrorKind::NotConnected, "no attempt made");
            for _ in 0..20 {
                match UnixStream::connect(&self.path) {
                    Ok(mut stream) => {
                        stream.write_all(line.as_bytes())?;
                        stream.write_all(b"\n")?;
                        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
                        let mut ack = String::new();
                        let _ = BufReader::new(stream).read_line(&mut ack);
                        return Ok(());
                    }
                    Err(err) => {
                        last_err = err;
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            Err(last_err)
        }
    }

    impl Default for CommandClient {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{CommandHandler, CommandRequest};
    use std::io;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// No local socket transport on this platform.
    pub struct CommandServer;

    impl CommandServer {
        pub fn start(
            _path: impl Into<PathBuf>,
            _handler: Arc<dyn CommandHandler>,
        ) -> io::Result<CommandServer> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "command channel requires unix sockets",
            ))
        }

        pub fn stop(self) {}
    }

    pub struct CommandClient;

    impl CommandClient {
        pub fn new() -> Self {
            Self
        }

        pub fn to(_path: impl Into<PathBuf>) -> Self {
            Self
        }

        pub fn send(&self, _request: &CommandRequest) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "command channel requires unix sockets",
            ))
        }
    }
}

pub use imp::{CommandClient, CommandServer};

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<String>>,
    }

    impl CommandHandler for RecordingHandler {
        fn set_enabled(&self, enabled: bool) {
            self.calls.lock().push(format!("enabled={enabled}"));
        }

        fn add_exception(&self, domain: &str) {
            self.calls.lock().push(format!("add={domain}"));
        }

        fn remove_exception(&self, domain: &str) {
            self.calls.lock().push(format!("remove={domain}"));
        }
    }

    #[test]
    fn all_four_commands_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let handler = Arc::new(RecordingHandler::default());
        let server = CommandServer::start(&path, handler.clone()).unwrap();

        let client = CommandClient::to(&path);
        client.send(&CommandRequest::disable()).unwrap();
        client.send(&CommandRequest::enable()).unwrap();
        client
            .send(&CommandRequest::add_exception("example.com"))
            .unwrap();
        client
            .send(&CommandRequest::remove_exception("example.com"))
            .unwrap();
        server.stop();

        let calls = handler.calls.lock();
        assert_eq!(
            calls.as_slice(),
            [
                "enabled=false",
                "enabled=true",
                "add=example.com",
                "remove=example.com"
            ]
        );
    }

    #[test]
    fn malformed_requests_are_acked_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let handler = Arc::new(RecordingHandler::default());
        let server = CommandServer::start(&path, handler.clone()).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"this is not json\n").unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut ack = String::new();
        BufReader::new(stream).read_line(&mut ack).unwrap();
        assert_eq!(ack, "\n");

        // the slot is still usable afterwards
        let client = CommandClient::to(&path);
        client.send(&CommandRequest::enable()).unwrap();
        server.stop();
        assert_eq!(handler.calls.lock().as_slice(), ["enabled=true"]);
    }

    #[test]
    fn unknown_command_numbers_do_not_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let handler = Arc::new(RecordingHandler::default());
        let server = CommandServer::start(&path, handler.clone()).unwrap();

        CommandClient::to(&path)
            .send(&CommandRequest {
                cmd: 99,
                domain: None,
            })
            .unwrap();
        server.stop();
        assert!(handler.calls.lock().is_empty());
    }

    #[test]
    fn concurrent_clients_are_all_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let handler = Arc::new(RecordingHandler::default());
        let server = CommandServer::start(&path, handler.clone()).unwrap();

        let mut joins = Vec::new();
        for i in 0..8 {
            let path = path.clone();
            joins.push(std::thread::spawn(move || {
                CommandClient::to(&path)
                    .send(&CommandRequest::add_exception(format!("d{i}.example")))
                    .unwrap();
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        server.stop();
        assert_eq!(handler.calls.lock().len(), 8);
    }
}
