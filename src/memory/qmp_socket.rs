use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use super::parse_hmp::{extract_register, parse_byte_dump};
use super::{GuestTransport, Registers, TransportError};

/// How long a read waits after seeing `WouldBlock` before deciding the
/// other side has finished writing. Grounded on `qmp_client.c`'s
/// `qmp_read`, which polls the socket with a 5ms timeout and treats an
/// empty poll as "response complete". This is a known-fragile heuristic:
/// a sufficiently slow or fragmented response can be cut short. Preserved
/// faithfully rather than papered over with a made-up framing fix.
const EMPTY_POLL_TIMEOUT: Duration = Duration::from_millis(5);

/// Guest memory/register access over a QMP Unix domain socket, issuing
/// HMP commands wrapped in `human-monitor-command`.
pub struct QmpSocket {
    stream: Option<UnixStream>,
    /// QEMU's PID, discovered via `/proc/net/unix` + `/proc/*/fd` scanning
    /// the way `qmp_client.c`'s `find_pid_by_inode` does. Logged for
    /// diagnostics; not currently used for a `/proc/<pid>/mem` fast path.
    #[allow(dead_code)]
    qemu_pid: Option<u32>,
}

impl QmpSocket {
    pub fn connect(path: &str) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path)?;
        stream.set_nonblocking(true)?;
        let qemu_pid = discover_qemu_pid(path);
        if let Some(pid) = qemu_pid {
            debug!("qmp socket {path} owned by pid {pid}");
        }
        let mut this = Self {
            stream: Some(stream),
            qemu_pid,
        };
        this.handshake()?;
        Ok(this)
    }

    fn handshake(&mut self) -> Result<(), TransportError> {
        let greeting = self.read_message()?;
        let greeting: Value = serde_json::from_str(&greeting)
            .map_err(|e| TransportError::QmpHandshakeFailed(e.to_string()))?;
        if greeting.get("QMP").is_none() {
            return Err(TransportError::QmpHandshakeFailed(
                "missing QMP greeting".into(),
            ));
        }
        self.write_message(r#"{"execute":"qmp_capabilities"}"#)?;
        let reply = self.read_message()?;
        let reply: Value = serde_json::from_str(&reply)
            .map_err(|e| TransportError::QmpHandshakeFailed(e.to_string()))?;
        if reply.get("return").is_none() {
            return Err(TransportError::QmpHandshakeFailed(format!(
                "qmp_capabilities rejected: {reply}"
            )));
        }
        Ok(())
    }

    fn write_message(&mut self, msg: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream.write_all(msg.as_bytes())?;
        stream.write_all(b"\r\n")?;
        Ok(())
    }

    /// Drains the socket until a `WouldBlock`-after-sleep indicates the
    /// peer has stopped writing, mirroring the original poll-based framing.
    fn read_message(&mut self) -> Result<String, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if out.is_empty() {
                        std::thread::sleep(EMPTY_POLL_TIMEOUT);
                        continue;
                    }
                    std::thread::sleep(EMPTY_POLL_TIMEOUT);
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => out.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        String::from_utf8(out)
            .map_err(|e| TransportError::QmpMalformedResponse(e.to_string()))
    }

    fn run_hmp(&mut self, command: &str) -> Result<String, TransportError> {
        let request = serde_json::json!({
            "execute": "human-monitor-command",
            "arguments": { "command-line": command }
        });
        self.write_message(&request.to_string())?;
        let reply = self.read_message()?;
        let reply: Value = serde_json::from_str(&reply)
            .map_err(|e| TransportError::QmpMalformedResponse(e.to_string()))?;
        let text = reply
            .get("return")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::QmpMalformedResponse(format!("no return: {reply}")))?;
        Ok(text.to_string())
    }
}

impl GuestTransport for QmpSocket {
    fn read_raw(&mut self, paddr: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        let command = format!("xp /{len}xb 0x{paddr:x}");
        let text = self.run_hmp(&command)?;
        let mut bytes = parse_byte_dump(&text);
        if bytes.len() < len {
            return Err(TransportError::TruncatedDump {
                expected: len,
                got: bytes.len(),
            });
        }
        bytes.truncate(len);
        Ok(bytes)
    }

    fn registers(&mut self) -> Result<Registers, TransportError> {
        let text = self.run_hmp("info registers")?;
        let cr3 =
            extract_register(&text, "CR3").ok_or(TransportError::RegisterNotFound("CR3"))?;
        let idtr =
            extract_register(&text, "IDT").ok_or(TransportError::RegisterNotFound("IDT"))?;
        let cr4 = extract_register(&text, "CR4").unwrap_or(0);
        Ok(Registers { idtr, cr3, cr4 })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.stream = None;
        Ok(())
    }
}

/// Resolves the PID of the QEMU process on the other end of `socket_path`
/// by matching the socket's inode in `/proc/net/unix` against fd entries
/// under `/proc/*/fd`. Grounded on `qmp_client.c`'s
/// `get_inode_from_socket`/`find_pid_by_inode`. Best-effort: returns `None`
/// on any lookup failure rather than propagating an error, since this is
/// diagnostic information only.
fn discover_qemu_pid(socket_path: &str) -> Option<u32> {
    let inode = find_socket_inode(socket_path)?;
    let entries = fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(target) = fs::read_link(fd.path()) {
                if let Some(name) = target.to_str() {
                    if name == format!("socket:[{inode}]") {
                        return Some(pid);
                    }
                }
            }
        }
    }
    None
}

fn find_socket_inode(socket_path: &str) -> Option<u64> {
    let contents = fs::read_to_string("/proc/net/unix").ok()?;
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let path = fields.last()?;
        if *path == socket_path {
            // Column layout: Num RefCount Protocol Flags Type St Inode Path
            return fields.get(6).and_then(|s| s.parse().ok());
        }
    }
    None
}
