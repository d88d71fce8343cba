//! Driver for GRBL v1.1 motion controllers over a noisy serial link.
//!
//! Domain operations (moves, jogs, status, homing) are built on the line
//! transport, with bounded-attempt retry and link recovery wrapped around
//! every hardware exchange. The driver is generic over the port so it runs
//! against a real serial device or the scripted [`mock::MockPort`].

pub mod codes;
pub mod error;
pub mod mock;
pub mod status;
pub mod transport;

pub use error::GrblError;
pub use status::{MachineState, Position, Status};
pub use transport::Transport;

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use error::Result;

/// Attempts for any hardware operation before the fault propagates.
pub const DEFAULT_TRIES: usize = 3;

/// Poll interval while waiting for the controller to go Idle.
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Total budget for getting a jog cancel acknowledged by an Idle report.
const CANCEL_JOG_TIMEOUT: Duration = Duration::from_millis(500);
/// A homing cycle answers `ok` only once it completes.
const HOME_TIMEOUT: Duration = Duration::from_secs(30);
/// Boot output usually shows up within about 1.5 s of a reset.
const BOOT_OUTPUT_WINDOW: Duration = Duration::from_secs(2);
const BOOT_BANNER_WINDOW: Duration = Duration::from_secs(1);

/// Invoked on every successfully parsed status report, including the polls
/// inside `wait_idle`.
pub type StatusObserver = Box<dyn FnMut(&Status) + Send>;

pub struct Grbl<P> {
    transport: Transport<P>,
    observer: Option<StatusObserver>,
    tries: usize,
}

impl<P: Read + Write> Grbl<P> {
    /// Opens the driver over `port`: drains stale output, then probes the
    /// controller, riding out a possible in-progress boot.
    pub fn new(port: P) -> Result<Self> {
        let mut grbl = Self::from_transport(Transport::new(port));
        grbl.transport.flush()?;
        grbl.reset_probe()?;
        Ok(grbl)
    }

    /// Driver over an already-configured transport, no initial probe; lets
    /// tests script the first exchange themselves.
    pub fn from_transport(transport: Transport<P>) -> Self {
        Self {
            transport,
            observer: None,
            tries: DEFAULT_TRIES,
        }
    }

    pub fn set_status_observer(&mut self, observer: StatusObserver) {
        self.observer = Some(observer);
    }

    /// Runs `op` up to the attempt bound, recovering the link between
    /// attempts; the last fault propagates once attempts are exhausted.
    fn with_retries<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut last = None;
        for attempt in 0..self.tries {
            if attempt > 0 {
                if let Err(e) = self.general_recover() {
                    warn!("{what}: recovery failed: {e}");
                }
            }
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{what} failed (attempt {}/{}): {e}", attempt + 1, self.tries);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(GrblError::Timeout))
    }

    /// One unretried status exchange.
    fn try_query_status(&mut self) -> Result<Status> {
        let raw = self.transport.query_status_line()?;
        let status = status::parse_status(&raw)?;
        if let MachineState::Alarm = status.state {
            warn!("controller reports alarm state");
        }
        if let Some(observer) = self.observer.as_mut() {
            observer(&status);
        }
        Ok(status)
    }

    pub fn query_status(&mut self) -> Result<Status> {
        self.with_retries("status query", |grbl| grbl.try_query_status())
    }

    /// Current absolute machine position.
    pub fn mpos(&mut self) -> Result<Position> {
        Ok(self.query_status()?.mpos)
    }

    fn recover_once(&mut self) -> Result<()> {
        // Might have been put into feed hold.
        self.transport.resume()?;
        // Clear any exchange in progress.
        self.transport.flush()?;
        // Then a trivial probe.
        self.try_query_status().map(drop)
    }

    /// Recovery after a communication fault while not in reset.
    pub fn general_recover(&mut self) -> Result<()> {
        debug!("recovering controller link");
        let mut last = None;
        for _ in 0..self.tries {
            match self.recover_once() {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(GrblError::Timeout))
    }

    /// Establishes communications at open time. Opening the port can reset
    /// the controller, in which case the first probe sees nothing useful and
    /// we must wait the boot out.
    pub fn reset_probe(&mut self) -> Result<()> {
        let began = Instant::now();
        self.transport.send_unframed("?")?;
        if let Ok(line) = self.transport.read_line() {
            if line.len() > 4 && line.contains('<') && line.contains('>') {
                return Ok(());
            }
        }
        warn!("controller failed to respond, attempting reset recovery");
        self.reset_recover()?;
        // Full status round trip to be sure.
        self.query_status()?;
        debug!("recovered after {:.3}s", began.elapsed().as_secs_f64());
        Ok(())
    }

    /// Busy-polls for any boot output, then for the boot banner.
    pub fn reset_recover(&mut self) -> Result<()> {
        let began = Instant::now();
        let mut line = loop {
            if began.elapsed() >= BOOT_OUTPUT_WINDOW {
                return Err(GrblError::Timeout);
            }
            match self.transport.read_line() {
                Ok(line) if !line.is_empty() => break line,
                Ok(_) | Err(GrblError::Timeout) => continue,
                Err(e) => return Err(e),
            }
        };

        let banner_began = Instant::now();
        while banner_began.elapsed() < BOOT_BANNER_WINDOW {
            if line.contains("Grbl") {
                return Ok(());
            }
            line = match self.transport.read_line() {
                Ok(line) => line,
                Err(GrblError::Timeout) => String::new(),
                Err(e) => return Err(e),
            };
        }
        Err(GrblError::Timeout)
    }

    /// Hard reset (^X). The position reference is invalid until re-homed.
    pub fn reset(&mut self) -> Result<()> {
        self.transport.send_byte(transport::BYTE_RESET)?;
        self.reset_recover()
    }

    fn jog_line(moves: &Position, mode: &str, feed: f64) -> String {
        let mut cmd = format!("$J={mode}");
        for (axis, value) in moves {
            cmd.push_str(&format!(" {}{value:.3}", axis.to_ascii_uppercase()));
        }
        cmd.push_str(&format!(" F{feed:.0}"));
        cmd
    }

    pub fn move_absolute(&mut self, moves: &Position, feed: f64, blocking: bool) -> Result<()> {
        let cmd = Self::jog_line(moves, "G90", feed);
        self.with_retries("absolute move", |grbl| {
            grbl.transport.exchange_none(&cmd)?;
            if blocking {
                grbl.wait_idle()?;
            }
            Ok(())
        })
    }

    pub fn move_relative(&mut self, moves: &Position, feed: f64, blocking: bool) -> Result<()> {
        let cmd = Self::jog_line(moves, "G91", feed);
        self.with_retries("relative move", |grbl| {
            grbl.transport.exchange_none(&cmd)?;
            if blocking {
                grbl.wait_idle()?;
            }
            Ok(())
        })
    }

    /// Polls status until the controller reports Idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        while !self.query_status()?.state.is_idle() {
            thread::sleep(IDLE_POLL);
        }
        Ok(())
    }

    /// One relative move per axis at the given rate. A timed-out jog is
    /// dropped rather than retried: better to under-jog than to risk a
    /// duplicate jog compounding.
    pub fn jog(&mut self, scalars: &Position, rate: f64) -> Result<()> {
        for (axis, value) in scalars {
            let cmd = format!("$J=G91 {}{value:.3} F{rate:.0}", axis.to_ascii_uppercase());
            debug!("jog: {cmd}");
            match self.transport.exchange_none(&cmd) {
                Ok(()) => {}
                Err(GrblError::Timeout) => {
                    warn!("dropping timed-out jog");
                    self.general_recover()?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// A single cancel byte is not guaranteed delivered; resend until the
    /// controller reports Idle or the budget runs out.
    pub fn cancel_jog(&mut self) -> Result<()> {
        self.with_retries("jog cancel", |grbl| {
            let began = Instant::now();
            loop {
                if began.elapsed() > CANCEL_JOG_TIMEOUT {
                    return Err(GrblError::Timeout);
                }
                grbl.transport.send_byte(transport::BYTE_JOG_CANCEL)?;
                if grbl.try_query_status()?.state.is_idle() {
                    return Ok(());
                }
                debug!("cancel: not idle yet");
            }
        })
    }

    /// Runs a homing cycle (`$H`) and re-probes status.
    pub fn home(&mut self) -> Result<()> {
        self.transport.exchange_none_deadline("$H", HOME_TIMEOUT)?;
        self.query_status().map(drop)
    }

    /// Clears an alarm lock (`$X`).
    pub fn unlock(&mut self) -> Result<()> {
        self.transport.exchange("$X").map(drop)
    }

    /// Resume from feed hold.
    pub fn resume(&mut self) -> Result<()> {
        self.transport.resume()
    }

    /// Feed hold.
    pub fn feed_hold(&mut self) -> Result<()> {
        self.transport.feed_hold()
    }

    /// Settings dump (`$$`), verbatim lines.
    pub fn settings(&mut self) -> Result<Vec<String>> {
        self.transport.exchange_raw("$$")
    }

    /// Version and options (`$I`).
    pub fn build_info(&mut self) -> Result<Vec<String>> {
        self.transport.exchange("$I")
    }

    /// One-line passthrough for diagnostics; data lines joined verbatim.
    pub fn raw_command(&mut self, cmd: &str) -> Result<String> {
        Ok(self.transport.exchange_raw(cmd)?.join("\n"))
    }
}
