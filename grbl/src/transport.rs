//! Line-oriented exchange layer over a raw serial port.
//!
//! Each request is one ASCII line terminated by a carriage return. A reply
//! is zero or more lines followed by either `ok` or `error:<code>`, except
//! for the `?` status query which is answered by a single `<...>` line with
//! no terminal `ok`. A handful of control bytes bypass the line framing
//! entirely.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::codes;
use crate::error::{GrblError, Result};

/// All commands seen so far answer in well under 10 ms, so this leaves
/// plenty of margin.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(150);

/// Quiet window `flush` waits for before declaring the line drained.
const FLUSH_QUIET: Duration = Duration::from_millis(100);
/// Hard cap on a single `flush` call, chatty controller or not.
const FLUSH_CAP: Duration = Duration::from_millis(500);

/// Hard reset. The controller reboots and the position reference is lost.
pub const BYTE_RESET: u8 = 0x18;
/// Jog cancel. Delivery is not guaranteed; resend until status goes Idle.
pub const BYTE_JOG_CANCEL: u8 = 0x85;

pub struct Transport<P> {
    port: P,
    read_timeout: Duration,
}

impl<P: Read + Write> Transport<P> {
    pub fn new(port: P) -> Self {
        Self::with_timeout(port, DEFAULT_READ_TIMEOUT)
    }

    pub fn with_timeout(port: P, read_timeout: Duration) -> Self {
        Self { port, read_timeout }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Sends one framed line (CR appended).
    pub fn send(&mut self, line: &str) -> Result<()> {
        trace!("tx {:?}", line);
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r")?;
        self.port.flush()?;
        Ok(())
    }

    /// Sends bytes with no framing; used for `?`, `~` and `!`.
    pub fn send_unframed(&mut self, out: &str) -> Result<()> {
        trace!("tx unframed {:?}", out);
        self.port.write_all(out.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<()> {
        trace!("tx byte {:#04x}", byte);
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }

    /// Cycle start / resume from feed hold.
    pub fn resume(&mut self) -> Result<()> {
        self.send_unframed("~")
    }

    /// Feed hold. Freezes motion but not `?`.
    pub fn feed_hold(&mut self) -> Result<()> {
        self.send_unframed("!")
    }

    /// Reads one line within the default per-exchange timeout.
    pub fn read_line(&mut self) -> Result<String> {
        let timeout = self.read_timeout;
        self.read_line_deadline(timeout)
    }

    /// Reads one LF-terminated line, polling the port until `deadline`.
    ///
    /// An empty read at the deadline is a Timeout; a partial line is
    /// returned as-is and left for the caller to reject, matching how a
    /// garbled link actually presents.
    pub fn read_line_deadline(&mut self, deadline: Duration) -> Result<String> {
        let began = Instant::now();
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                    continue;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if began.elapsed() >= deadline {
                if line.is_empty() {
                    return Err(GrblError::Timeout);
                }
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let line = String::from_utf8_lossy(&line).trim().to_string();
        trace!("rx {:?}", line);
        Ok(line)
    }

    /// Drains pending input for a bounded window to resynchronize after a
    /// fault left the exchange state unknown. Never blocks past `FLUSH_CAP`.
    pub fn flush(&mut self) -> Result<()> {
        let began = Instant::now();
        let mut quiet_since = Instant::now();
        let mut sink = [0u8; 64];
        while began.elapsed() < FLUSH_CAP {
            match self.port.read(&mut sink) {
                Ok(n) if n > 0 => {
                    quiet_since = Instant::now();
                    continue;
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if quiet_since.elapsed() >= FLUSH_QUIET {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Sends a command and collects the `[...]` data lines before `ok`.
    pub fn exchange(&mut self, cmd: &str) -> Result<Vec<String>> {
        let timeout = self.read_timeout;
        self.transact(cmd, true, timeout)
    }

    /// Like `exchange`, but lines are kept verbatim (`$$` dumps are not
    /// bracketed).
    pub fn exchange_raw(&mut self, cmd: &str) -> Result<Vec<String>> {
        let timeout = self.read_timeout;
        self.transact(cmd, false, timeout)
    }

    /// Sends a command and expects nothing back before `ok`.
    pub fn exchange_none(&mut self, cmd: &str) -> Result<()> {
        let timeout = self.read_timeout;
        self.exchange_none_deadline(cmd, timeout)
    }

    /// `exchange_none` with a longer deadline for slow cycles like `$H`.
    pub fn exchange_none_deadline(&mut self, cmd: &str, deadline: Duration) -> Result<()> {
        let lines = self.transact(cmd, true, deadline)?;
        if !lines.is_empty() {
            return Err(GrblError::Protocol(format!(
                "unexpected reply to {cmd:?}: {lines:?}"
            )));
        }
        Ok(())
    }

    /// Sends a command and expects exactly one data line back before `ok`.
    pub fn exchange_one(&mut self, cmd: &str) -> Result<String> {
        let mut lines = self.exchange(cmd)?;
        if lines.len() != 1 {
            return Err(GrblError::Protocol(format!(
                "expected one reply line to {cmd:?}, got {lines:?}"
            )));
        }
        Ok(lines.remove(0))
    }

    fn transact(&mut self, cmd: &str, trim_data: bool, deadline: Duration) -> Result<Vec<String>> {
        self.send(cmd)?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line_deadline(deadline)?;
            if line.is_empty() {
                return Err(GrblError::Timeout);
            }
            if line == "ok" {
                return Ok(lines);
            }
            if let Some(code) = line.strip_prefix("error:") {
                if let Ok(code) = code.trim().parse::<u8>() {
                    warn!(
                        "controller error {}: {}",
                        code,
                        codes::error_description(code).unwrap_or("unknown code")
                    );
                }
                return Err(GrblError::Protocol(line));
            }
            if line.starts_with("error") {
                return Err(GrblError::Protocol(line));
            }
            if let Some(code) = line.strip_prefix("ALARM:") {
                if let Ok(code) = code.trim().parse::<u8>() {
                    warn!(
                        "controller alarm {}: {}",
                        code,
                        codes::alarm_description(code).unwrap_or("unknown code")
                    );
                }
                return Err(GrblError::Protocol(line));
            }
            if trim_data {
                lines.push(trim_data_line(&line)?);
            } else {
                lines.push(line);
            }
        }
    }

    /// `?` is answered by a single `<...>` line that terminates the exchange
    /// by itself.
    pub fn query_status_line(&mut self) -> Result<String> {
        self.send_unframed("?")?;
        let line = self.read_line()?;
        trim_status_line(&line)
    }
}

fn trim_data_line(line: &str) -> Result<String> {
    line.strip_prefix('[')
        .and_then(|l| l.strip_suffix(']'))
        .map(str::to_string)
        .ok_or_else(|| GrblError::Protocol(format!("unframed data line: {line:?}")))
}

fn trim_status_line(line: &str) -> Result<String> {
    if line.len() < 2 {
        return Err(GrblError::Protocol(format!("bad status line: {line:?}")));
    }
    line.strip_prefix('<')
        .and_then(|l| l.strip_suffix('>'))
        .map(str::to_string)
        .ok_or_else(|| GrblError::Protocol(format!("unframed status line: {line:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPort;

    fn fast(port: MockPort) -> Transport<MockPort> {
        // Keep timeout-path tests snappy.
        Transport::with_timeout(port, Duration::from_millis(30))
    }

    #[test]
    fn exchange_collects_data_lines_until_ok() {
        let port = MockPort::new();
        port.push_reply("[VER:1.1f.20170801:]\n[OPT:V,15,128]\nok");
        let mut transport = fast(port.clone());

        let lines = transport.exchange("$I").unwrap();
        assert_eq!(lines, vec!["VER:1.1f.20170801:", "OPT:V,15,128"]);
        assert_eq!(port.transcript(), vec!["$I"]);
    }

    #[test]
    fn exchange_raw_keeps_lines_verbatim() {
        let port = MockPort::new();
        port.push_reply("$0=10\n$1=25\nok");
        let mut transport = fast(port.clone());

        let lines = transport.exchange_raw("$$").unwrap();
        assert_eq!(lines, vec!["$0=10", "$1=25"]);
    }

    #[test]
    fn error_reply_is_protocol_error() {
        let port = MockPort::new();
        port.push_reply("error:9");
        let mut transport = fast(port);

        let err = transport.exchange_none("$J=G91 X1.000 F100").unwrap_err();
        match err {
            GrblError::Protocol(msg) => assert_eq!(msg, "error:9"),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn silence_is_a_timeout() {
        let port = MockPort::new();
        port.drop_next_requests(1);
        let mut transport = fast(port);

        assert!(matches!(
            transport.exchange_none("$J=G91 X1.000 F100"),
            Err(GrblError::Timeout)
        ));
    }

    #[test]
    fn alarm_line_fails_the_exchange_verbatim() {
        let port = MockPort::new();
        port.push_reply("ALARM:9");
        let mut transport = fast(port);

        let err = transport.exchange_none("$H").unwrap_err();
        match err {
            GrblError::Protocol(msg) => assert_eq!(msg, "ALARM:9"),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn unframed_data_line_is_rejected() {
        let port = MockPort::new();
        port.push_reply("VER:1.1f\nok");
        let mut transport = fast(port);

        assert!(matches!(
            transport.exchange("$I"),
            Err(GrblError::Protocol(_))
        ));
    }

    #[test]
    fn exchange_one_arity_is_checked() {
        let port = MockPort::new();
        port.push_reply("ok");
        let mut transport = fast(port);

        assert!(matches!(
            transport.exchange_one("$G"),
            Err(GrblError::Protocol(_))
        ));
    }

    #[test]
    fn status_query_round_trip() {
        let port = MockPort::new();
        port.set_status("Idle|MPos:8.000,0.000,0.000|FS:0,0");
        let mut transport = fast(port.clone());

        let raw = transport.query_status_line().unwrap();
        assert_eq!(raw, "Idle|MPos:8.000,0.000,0.000|FS:0,0");
        assert_eq!(port.transcript(), vec!["?"]);
    }

    #[test]
    fn garbled_status_line_is_rejected() {
        let port = MockPort::new();
        port.garble_next_status();
        let mut transport = fast(port);

        assert!(matches!(
            transport.query_status_line(),
            Err(GrblError::Protocol(_))
        ));
    }

    #[test]
    fn flush_drains_stale_output() {
        let port = MockPort::new();
        port.inject_rx("stale\r\npartial");
        let mut transport = fast(port.clone());

        transport.flush().unwrap();
        // Whatever was pending is gone; the next status query sees a clean
        // line.
        port.set_status("Idle|MPos:0.000,0.000,0.000|FS:0,0");
        assert!(transport.query_status_line().is_ok());
    }
}
