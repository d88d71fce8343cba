//! Scripted stand-in for a serial-attached controller.
//!
//! Answers the same way the hardware does (status line for `?`, `ok` for
//! framed commands, boot banner after a reset byte) while recording every
//! request, so tests and bench bring-up can run with no stage attached.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::transport::{BYTE_JOG_CANCEL, BYTE_RESET};

const DEFAULT_STATUS: &str = "Idle|MPos:0.000,0.000,0.000|FS:0,0";

/// Transcript marker for a hard reset byte.
pub const RESET_MARKER: &str = "ctrl-x";
/// Transcript marker for a jog cancel byte.
pub const JOG_CANCEL_MARKER: &str = "jog-cancel";

#[derive(Default)]
struct MockState {
    /// Bytes queued for the driver to read.
    rx: VecDeque<u8>,
    /// Partial request line being written.
    wbuf: Vec<u8>,
    /// Every request seen, framed lines and control bytes alike.
    transcript: Vec<String>,
    /// Scripted replies for framed commands, consumed in order. A reply may
    /// span lines; exhausted scripts fall back to `ok`.
    line_replies: VecDeque<String>,
    /// Framed commands to swallow without any reply.
    drop_requests: usize,
    /// One-shot status reports, then `status` repeats.
    status_queue: VecDeque<String>,
    status: String,
    garble_next_status: usize,
    garble_all_statuses: bool,
}

/// Cloneable handle; clones share the same scripted state.
#[derive(Clone)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPort {
    pub fn new() -> Self {
        let state = MockState {
            status: DEFAULT_STATUS.to_string(),
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Replaces the repeating status report.
    pub fn set_status(&self, status: &str) {
        self.lock().status = status.to_string();
    }

    /// Queues a one-shot status report ahead of the repeating one.
    pub fn push_status(&self, status: &str) {
        self.lock().status_queue.push_back(status.to_string());
    }

    /// Scripts the reply to the next framed command; lines separated by
    /// `\n`. Terminal `ok`/`error:<n>` must be part of the script.
    pub fn push_reply(&self, reply: &str) {
        self.lock().line_replies.push_back(reply.to_string());
    }

    /// Swallows the next `n` framed commands without replying, which the
    /// transport sees as timeouts. Status queries are unaffected.
    pub fn drop_next_requests(&self, n: usize) {
        self.lock().drop_requests += n;
    }

    pub fn garble_next_status(&self) {
        self.lock().garble_next_status += 1;
    }

    /// Every status report comes back malformed until turned off again.
    pub fn garble_all_statuses(&self, garble: bool) {
        self.lock().garble_all_statuses = garble;
    }

    /// Queues raw bytes as if the controller had sent them unprompted.
    pub fn inject_rx(&self, data: &str) {
        self.lock().rx.extend(data.as_bytes());
    }

    pub fn transcript(&self) -> Vec<String> {
        self.lock().transcript.clone()
    }

    pub fn clear_transcript(&self) {
        self.lock().transcript.clear();
    }
}

impl MockState {
    fn respond(&mut self, line: &str) {
        self.rx.extend(line.as_bytes());
        self.rx.extend(b"\r\n");
    }

    fn handle_status_query(&mut self) {
        self.transcript.push("?".to_string());
        if self.garble_all_statuses || self.garble_next_status > 0 {
            self.garble_next_status = self.garble_next_status.saturating_sub(1);
            self.respond("x@#$%garbage");
            return;
        }
        let status = self
            .status_queue
            .pop_front()
            .unwrap_or_else(|| self.status.clone());
        self.respond(&format!("<{status}>"));
    }

    fn handle_line(&mut self) {
        let line = String::from_utf8_lossy(&self.wbuf).to_string();
        self.wbuf.clear();
        self.transcript.push(line);
        if self.drop_requests > 0 {
            self.drop_requests -= 1;
            return;
        }
        match self.line_replies.pop_front() {
            Some(reply) => {
                for line in reply.split('\n') {
                    self.respond(line);
                }
            }
            None => self.respond("ok"),
        }
    }

    fn handle_byte(&mut self, byte: u8) {
        if self.wbuf.is_empty() {
            match byte {
                BYTE_RESET => {
                    self.transcript.push(RESET_MARKER.to_string());
                    self.respond("");
                    self.respond("Grbl 1.1f ['$' for help]");
                    return;
                }
                BYTE_JOG_CANCEL => {
                    self.transcript.push(JOG_CANCEL_MARKER.to_string());
                    return;
                }
                b'?' => {
                    self.handle_status_query();
                    return;
                }
                b'~' | b'!' => {
                    self.transcript.push((byte as char).to_string());
                    return;
                }
                _ => {}
            }
        }
        if byte == b'\r' {
            self.handle_line();
        } else {
            self.wbuf.push(byte);
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let mut n = 0;
        while n < buf.len() {
            match state.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        for &byte in buf {
            state.handle_byte(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
