//! Serializes all motion onto one worker thread. Callers enqueue
//! [`MotionCommand`]s through a cloneable handle; the worker owns the
//! controller connection exclusively and services commands in order, with
//! stop/e-stop flags checked ahead of the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use grbl::Position;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::hal::{MotionError, MotionHal, Result};
use crate::models::{CommandEnvelope, CommandResponse, CommandResult, MotionCommand};

/// How long the worker blocks on the queue before re-checking flags.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
const PAUSE_POLL: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_millis(50);
/// Wait between reconnection attempts after a critical fault.
const REBOOT_BACKOFF: Duration = Duration::from_secs(3);

/// Produces a fresh controller connection; called again on reboot.
pub type HalBuilder = Box<dyn FnMut() -> Result<Box<dyn MotionHal>> + Send>;

struct Shared {
    running: AtomicBool,
    /// Queue drained and no command in flight.
    idle: AtomicBool,
    /// Pause gate; false parks the worker without touching the queue.
    normal_running: AtomicBool,
    stop: AtomicBool,
    estop: AtomicBool,
    /// Bumped by every stop/e-stop; envelopes stamped under an older epoch
    /// are discarded unexecuted.
    epoch: AtomicU64,
    pos_cache: RwLock<Option<Position>>,
}

/// Handle to the motion worker. Cheap to clone; all clones feed the same
/// queue and observe the same state.
pub struct MotionThread {
    shared: Arc<Shared>,
    tx: Sender<CommandEnvelope>,
    rx: Receiver<CommandEnvelope>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Clone for MotionThread {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl MotionThread {
    /// Builds the first controller connection on the calling thread, so
    /// bring-up failures surface immediately, then starts the worker.
    pub fn spawn(mut builder: HalBuilder, allow_reboot: bool) -> Result<Self> {
        let hal = builder()?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            idle: AtomicBool::new(true),
            normal_running: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            estop: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            pos_cache: RwLock::new(None),
        });
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut worker = Worker {
            shared: shared.clone(),
            rx: rx.clone(),
            pending: VecDeque::new(),
            builder,
            hal: None,
            allow_reboot,
        };
        worker.install_hal(hal);

        let join = thread::Builder::new()
            .name("motion".to_string())
            .spawn(move || worker.run())
            .map_err(|e| MotionError::Unavailable(format!("spawn failed: {e}")))?;

        Ok(Self {
            shared,
            tx,
            rx,
            handle: Arc::new(Mutex::new(Some(join))),
        })
    }

    /// Enqueues a command. Blocking calls return the worker's result;
    /// non-blocking calls return `Done` as soon as the command is queued.
    pub fn command(&self, command: MotionCommand, block: bool) -> CommandResult {
        if !self.is_running() {
            return Err(MotionError::Unavailable("motion service halted".into()));
        }
        let epoch = self.shared.epoch.load(Ordering::SeqCst);

        if block {
            let (done_tx, done_rx) = oneshot::channel();
            self.tx
                .send(CommandEnvelope {
                    command,
                    completion: Some(done_tx),
                    epoch,
                })
                .map_err(|_| MotionError::Unavailable("motion service halted".into()))?;
            done_rx
                .blocking_recv()
                .map_err(|_| MotionError::Unavailable("worker exited".into()))?
        } else {
            self.tx
                .send(CommandEnvelope {
                    command,
                    completion: None,
                    epoch,
                })
                .map_err(|_| MotionError::Unavailable("motion service halted".into()))?;
            Ok(CommandResponse::Done)
        }
    }

    pub fn home(&self) -> CommandResult {
        self.command(MotionCommand::Home, true)
    }

    /// Blocking absolute move; returns the position read back afterwards.
    pub fn move_absolute(&self, pos: Position) -> Result<Position> {
        into_position(self.command(MotionCommand::MoveAbsolute(pos), true)?)
    }

    pub fn move_relative(&self, delta: Position) -> Result<Position> {
        into_position(self.command(MotionCommand::MoveRelative(delta), true)?)
    }

    /// Fire-and-forget jog.
    pub fn jog(&self, scalars: Position) -> CommandResult {
        self.command(MotionCommand::Jog(scalars), false)
    }

    pub fn set_jog_rate(&self, rate: f64) -> CommandResult {
        self.command(MotionCommand::SetJogRate(rate), false)
    }

    /// Fresh position from hardware.
    pub fn pos(&self) -> Result<Position> {
        into_position(self.command(MotionCommand::Pos, true)?)
    }

    /// Refresh the cache from hardware without waiting for the answer.
    pub fn update_pos_cache(&self) -> CommandResult {
        self.command(MotionCommand::UpdatePosCache, false)
    }

    /// Last position seen by any status read, without touching hardware.
    pub fn last_position(&self) -> Option<Position> {
        self.shared.pos_cache.read().unwrap().clone()
    }

    pub fn unlock(&self) -> CommandResult {
        self.command(MotionCommand::Unlock, true)
    }

    pub fn backlash_enable(&self) -> CommandResult {
        self.command(MotionCommand::BacklashEnable, false)
    }

    pub fn backlash_disable(&self) -> CommandResult {
        self.command(MotionCommand::BacklashDisable, false)
    }

    pub fn raw_command(&self, cmd: impl Into<String>) -> Result<String> {
        match self.command(MotionCommand::Raw(cmd.into()), true)? {
            CommandResponse::Output(out) => Ok(out),
            other => Err(MotionError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }

    /// Halt current motion ahead of anything queued; commands submitted
    /// before this call are discarded.
    pub fn stop(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Emergency stop: resets the controller and discards every command
    /// submitted before this call.
    pub fn estop(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.estop.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.shared.normal_running.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.normal_running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.shared.idle.load(Ordering::SeqCst)
    }

    pub fn qsize(&self) -> usize {
        self.tx.len()
    }

    /// Discards everything queued; in-flight work is unaffected.
    pub fn queue_clear(&self) {
        while let Ok(envelope) = self.rx.try_recv() {
            complete(
                envelope.completion,
                Err(MotionError::Unavailable("queue cleared".into())),
            );
        }
    }

    /// Waits for the queue to drain, or for the worker to halt. The idle
    /// flag lags a dequeue by an instant, so one quiet sample is not
    /// trusted on its own.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut quiet = 0;
        while Instant::now() < deadline {
            if !self.is_running() {
                return true;
            }
            if self.is_idle() && self.qsize() == 0 {
                quiet += 1;
                if quiet >= 2 {
                    return true;
                }
            } else {
                quiet = 0;
            }
            thread::sleep(IDLE_POLL);
        }
        false
    }

    /// Signals the worker to exit and joins it.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("motion thread panicked");
            }
        }
    }
}

fn into_position(response: CommandResponse) -> Result<Position> {
    match response {
        CommandResponse::Position(pos) => Ok(pos),
        other => Err(MotionError::Protocol(format!(
            "unexpected response {other:?}"
        ))),
    }
}

fn complete(completion: Option<oneshot::Sender<CommandResult>>, result: CommandResult) {
    if let Some(tx) = completion {
        // The caller may have given up waiting; that is their business.
        let _ = tx.send(result);
    }
}

struct Worker {
    shared: Arc<Shared>,
    rx: Receiver<CommandEnvelope>,
    /// Envelopes kept across a stop/e-stop, serviced ahead of the queue so
    /// later submissions cannot overtake them.
    pending: VecDeque<CommandEnvelope>,
    builder: HalBuilder,
    hal: Option<Box<dyn MotionHal>>,
    allow_reboot: bool,
}

impl Worker {
    fn install_hal(&mut self, mut hal: Box<dyn MotionHal>) {
        let shared = self.shared.clone();
        hal.register_status_cb(Box::new(move |pos| {
            *shared.pos_cache.write().unwrap() = Some(pos.clone());
        }));
        self.hal = Some(hal);
    }

    fn run(mut self) {
        info!("motion thread running");
        while self.shared.running.load(Ordering::SeqCst) {
            if self.shared.estop.swap(false, Ordering::SeqCst) {
                self.handle_estop();
                continue;
            }
            if self.shared.stop.swap(false, Ordering::SeqCst) {
                self.handle_stop();
                continue;
            }
            if !self.shared.normal_running.load(Ordering::SeqCst) {
                thread::sleep(PAUSE_POLL);
                continue;
            }
            let envelope = if let Some(envelope) = self.pending.pop_front() {
                envelope
            } else {
                match self.rx.recv_timeout(DEQUEUE_TIMEOUT) {
                    Ok(envelope) => envelope,
                    Err(RecvTimeoutError::Timeout) => {
                        self.shared.idle.store(true, Ordering::SeqCst);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };
            self.shared.idle.store(false, Ordering::SeqCst);
            self.service(envelope);
            if self.pending.is_empty() && self.rx.is_empty() {
                self.shared.idle.store(true, Ordering::SeqCst);
            }
        }

        if let Some(hal) = self.hal.as_mut() {
            hal.close();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        // The handle keeps the channel alive, so anything still queued must
        // be failed here or its caller would block forever.
        for envelope in self.pending.drain(..) {
            complete(
                envelope.completion,
                Err(MotionError::Unavailable("motion service halted".into())),
            );
        }
        while let Ok(envelope) = self.rx.try_recv() {
            complete(
                envelope.completion,
                Err(MotionError::Unavailable("motion service halted".into())),
            );
        }
        self.shared.idle.store(true, Ordering::SeqCst);
        info!("motion thread exiting");
    }

    /// Flushes every envelope stamped before the current epoch; envelopes
    /// submitted after the stop/e-stop call are kept, in drained order,
    /// ahead of anything queued later.
    fn discard_stale(&mut self, reason: &str) {
        let cutoff = self.shared.epoch.load(Ordering::SeqCst);
        for envelope in self.rx.try_iter().collect::<Vec<_>>() {
            if envelope.epoch >= cutoff {
                self.pending.push_back(envelope);
            } else {
                complete(
                    envelope.completion,
                    Err(MotionError::Unavailable(reason.into())),
                );
            }
        }
    }

    fn handle_estop(&mut self) {
        warn!("emergency stop, resetting controller and discarding queue");
        self.discard_stale("discarded by emergency stop");
        *self.shared.pos_cache.write().unwrap() = None;
        if let Some(hal) = self.hal.as_mut() {
            if let Err(e) = hal.estop() {
                self.handle_critical(&e.to_string());
            }
        }
    }

    fn handle_stop(&mut self) {
        debug!("stop requested, halting current motion");
        self.discard_stale("discarded by stop");
        if let Some(hal) = self.hal.as_mut() {
            if let Err(e) = hal.stop() {
                warn!("stop failed: {e}");
            }
        }
    }

    fn service(&mut self, envelope: CommandEnvelope) {
        if envelope.epoch < self.shared.epoch.load(Ordering::SeqCst) {
            complete(
                envelope.completion,
                Err(MotionError::Unavailable("discarded by stop".into())),
            );
            return;
        }

        let label = format!("{:?}", envelope.command);
        let result = self.execute(envelope.command);
        // Log every failure; for fire-and-forget submissions this is the
        // only place the error surfaces.
        if let Err(e) = &result {
            warn!("{label} failed: {e}");
        }
        // Tear down before replying, so a caller that sees Critical also
        // sees the service halted; the reconnect loop runs after the reply.
        if let Err(MotionError::Critical(msg)) = &result {
            let msg = msg.clone();
            self.teardown_hal(&msg);
            complete(envelope.completion, result);
            if self.allow_reboot {
                self.reboot();
            }
            return;
        }
        complete(envelope.completion, result);
    }

    fn hal(&mut self) -> Result<&mut Box<dyn MotionHal>> {
        self.hal
            .as_mut()
            .ok_or_else(|| MotionError::Unavailable("controller offline".into()))
    }

    fn execute(&mut self, command: MotionCommand) -> CommandResult {
        match command {
            MotionCommand::Home => {
                self.hal()?.home()?;
                Ok(CommandResponse::Done)
            }
            MotionCommand::MoveAbsolute(pos) => {
                match self.hal()?.move_absolute(&pos) {
                    Ok(()) => {}
                    // Out-of-range targets are logged and answered with the
                    // real position instead of failing the caller.
                    Err(e @ MotionError::AxisExceeded { .. }) => warn!("move rejected: {e}"),
                    Err(e) => return Err(e),
                }
                self.finish_move()
            }
            MotionCommand::MoveRelative(delta) => {
                match self.hal()?.move_relative(&delta) {
                    Ok(()) => {}
                    Err(e @ MotionError::AxisExceeded { .. }) => warn!("move rejected: {e}"),
                    Err(e) => return Err(e),
                }
                self.finish_move()
            }
            MotionCommand::Jog(scalars) => {
                self.hal()?.jog(&scalars)?;
                Ok(CommandResponse::Done)
            }
            MotionCommand::Pos => Ok(CommandResponse::Position(self.hal()?.pos()?)),
            MotionCommand::UpdatePosCache => {
                self.hal()?.pos()?;
                Ok(CommandResponse::Done)
            }
            MotionCommand::SetJogRate(rate) => {
                self.hal()?.set_jog_rate(rate);
                Ok(CommandResponse::Done)
            }
            MotionCommand::BacklashEnable => {
                self.hal()?.backlash_enable();
                Ok(CommandResponse::Done)
            }
            MotionCommand::BacklashDisable => {
                self.hal()?.backlash_disable();
                Ok(CommandResponse::Done)
            }
            MotionCommand::Unlock => {
                self.hal()?.unlock()?;
                Ok(CommandResponse::Done)
            }
            MotionCommand::Raw(cmd) => Ok(CommandResponse::Output(self.hal()?.raw_command(&cmd)?)),
        }
    }

    /// Moves settle and answer with the position read back afterwards.
    fn finish_move(&mut self) -> CommandResult {
        let hal = self.hal()?;
        hal.settle();
        Ok(CommandResponse::Position(hal.pos()?))
    }

    /// The connection is unusable. Drop it, then either rebuild it on a
    /// backoff loop or halt the service.
    fn handle_critical(&mut self, msg: &str) {
        self.teardown_hal(msg);
        if self.allow_reboot {
            self.reboot();
        }
    }

    fn teardown_hal(&mut self, msg: &str) {
        error!("critical motion fault: {msg}");
        if let Some(mut hal) = self.hal.take() {
            hal.close();
        }
        *self.shared.pos_cache.write().unwrap() = None;
        if !self.allow_reboot {
            error!("halting motion service");
            self.shared.running.store(false, Ordering::SeqCst);
        }
    }

    fn reboot(&mut self) {
        while self.shared.running.load(Ordering::SeqCst) {
            warn!("reconnecting controller in {REBOOT_BACKOFF:?}");
            thread::sleep(REBOOT_BACKOFF);
            match (self.builder)() {
                Ok(hal) => {
                    self.install_hal(hal);
                    info!("controller back online");
                    return;
                }
                Err(e) => warn!("reconnect failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::hal::grbl::GrblHal;
    use grbl::mock::{MockPort, RESET_MARKER};
    use grbl::{Grbl, Transport};

    fn builder_for(port: MockPort, config: StageConfig) -> HalBuilder {
        Box::new(move || {
            let driver = Grbl::from_transport(Transport::with_timeout(
                port.clone(),
                Duration::from_millis(30),
            ));
            let hal = GrblHal::new(driver, &config)?;
            Ok(Box::new(hal) as Box<dyn MotionHal>)
        })
    }

    fn spawn_mock(port: MockPort, config: StageConfig) -> MotionThread {
        MotionThread::spawn(builder_for(port, config), false).unwrap()
    }

    fn moves(transcript: &[String]) -> Vec<String> {
        transcript
            .iter()
            .filter(|l| l.starts_with("$J="))
            .cloned()
            .collect()
    }

    fn target(x: f64) -> Position {
        Position::from([('x', x)])
    }

    /// Pause, then outwait a dequeue already in flight so nothing sent
    /// afterwards is serviced until resume.
    fn pause_and_park(thread: &MotionThread) {
        thread.pause();
        thread::sleep(3 * DEQUEUE_TIMEOUT);
    }

    #[test]
    fn commands_execute_in_submission_order() {
        let port = MockPort::new();
        let thread = spawn_mock(port.clone(), StageConfig::default());
        port.clear_transcript();

        thread.move_absolute(target(1.0)).unwrap();
        thread.move_absolute(target(2.0)).unwrap();
        thread.move_absolute(target(3.0)).unwrap();

        assert_eq!(
            moves(&port.transcript()),
            vec![
                "$J=G90 X1.000 F1000",
                "$J=G90 X2.000 F1000",
                "$J=G90 X3.000 F1000",
            ]
        );
        thread.shutdown();
    }

    #[test]
    fn fifo_order_holds_across_submitting_threads() {
        let port = MockPort::new();
        let motion = spawn_mock(port.clone(), StageConfig::default());
        port.clear_transcript();

        // The lock couples each enqueue with its record, so the recorded
        // order is the true submission order.
        let submitted = Arc::new(Mutex::new(Vec::new()));
        let mut workers = Vec::new();
        for i in 0..4u32 {
            let motion = motion.clone();
            let submitted = submitted.clone();
            workers.push(thread::spawn(move || {
                for j in 0..3u32 {
                    let x = f64::from(i * 10 + j);
                    let order = &mut *submitted.lock().unwrap();
                    motion
                        .command(MotionCommand::MoveAbsolute(target(x)), false)
                        .unwrap();
                    order.push(format!("$J=G90 X{x:.3} F1000"));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(motion.wait_idle(Duration::from_secs(10)));

        assert_eq!(moves(&port.transcript()), *submitted.lock().unwrap());
        motion.shutdown();
    }

    #[test]
    fn blocking_move_fills_position_cache() {
        let port = MockPort::new();
        port.set_status("Idle|MPos:5.000,0.000,0.000|FS:0,0");
        let thread = spawn_mock(port, StageConfig::default());
        assert!(thread.last_position().is_none());

        let pos = thread.move_absolute(target(5.0)).unwrap();
        assert_eq!(pos[&'x'], 5.0);
        assert_eq!(thread.last_position().unwrap()[&'x'], 5.0);
        thread.shutdown();
    }

    #[test]
    fn estop_discards_prior_commands_but_not_later_ones() {
        let port = MockPort::new();
        let thread = spawn_mock(port.clone(), StageConfig::default());
        pause_and_park(&thread);
        port.clear_transcript();

        thread
            .command(MotionCommand::MoveAbsolute(target(1.0)), false)
            .unwrap();
        thread.estop();
        thread
            .command(MotionCommand::MoveAbsolute(target(9.0)), false)
            .unwrap();
        thread.resume();
        assert!(thread.wait_idle(Duration::from_secs(5)));

        let transcript = port.transcript();
        assert!(transcript.contains(&RESET_MARKER.to_string()));
        let wire = moves(&transcript);
        assert_eq!(wire, vec!["$J=G90 X9.000 F1000"]);
        thread.shutdown();
    }

    #[test]
    fn stop_cancels_motion_and_discards_prior_commands() {
        use grbl::mock::JOG_CANCEL_MARKER;

        let port = MockPort::new();
        let thread = spawn_mock(port.clone(), StageConfig::default());
        pause_and_park(&thread);
        port.clear_transcript();

        thread
            .command(MotionCommand::MoveAbsolute(target(1.0)), false)
            .unwrap();
        thread.stop();
        thread
            .command(MotionCommand::MoveAbsolute(target(9.0)), false)
            .unwrap();
        thread
            .command(MotionCommand::MoveAbsolute(target(7.0)), false)
            .unwrap();
        thread.resume();
        assert!(thread.wait_idle(Duration::from_secs(5)));

        let transcript = port.transcript();
        assert!(transcript.contains(&JOG_CANCEL_MARKER.to_string()));
        // Kept commands run in their original submission order.
        assert_eq!(
            moves(&transcript),
            vec!["$J=G90 X9.000 F1000", "$J=G90 X7.000 F1000"]
        );
        thread.shutdown();
    }

    #[test]
    fn out_of_range_move_answers_with_real_position() {
        let mut config = StageConfig::default();
        config.axes.get_mut(&'x').unwrap().soft_limit = Some((-10.0, 10.0));
        let port = MockPort::new();
        let thread = spawn_mock(port.clone(), config);
        port.clear_transcript();

        let pos = thread.move_absolute(target(50.0)).unwrap();
        assert_eq!(pos[&'x'], 0.0);
        assert!(moves(&port.transcript()).is_empty());
        thread.shutdown();
    }

    #[test]
    fn unknown_axis_error_does_not_kill_the_worker() {
        let port = MockPort::new();
        let thread = spawn_mock(port, StageConfig::default());

        let err = thread
            .move_absolute(Position::from([('q', 1.0)]))
            .unwrap_err();
        assert!(matches!(err, MotionError::UnknownAxis('q')));

        assert!(thread.is_running());
        assert!(thread.pos().is_ok());
        thread.shutdown();
    }

    #[test]
    fn persistent_garbage_is_critical_and_halts_without_reboot() {
        let port = MockPort::new();
        let thread = spawn_mock(port.clone(), StageConfig::default());
        port.garble_all_statuses(true);

        let err = thread.pos().unwrap_err();
        assert!(matches!(err, MotionError::Critical(_)));
        assert!(!thread.is_running());
        assert!(matches!(
            thread.pos().unwrap_err(),
            MotionError::Unavailable(_)
        ));
        thread.shutdown();
    }

    #[test]
    fn reboot_policy_reconnects_after_critical_fault() {
        let port = MockPort::new();
        let thread =
            MotionThread::spawn(builder_for(port.clone(), StageConfig::default()), true).unwrap();

        port.garble_all_statuses(true);
        assert!(matches!(
            thread.pos().unwrap_err(),
            MotionError::Critical(_)
        ));
        port.garble_all_statuses(false);

        // Next command rides out the reconnect backoff.
        assert!(thread.pos().is_ok());
        assert!(thread.is_running());
        thread.shutdown();
    }

    #[test]
    fn queue_clear_fails_pending_commands() {
        let port = MockPort::new();
        let thread = spawn_mock(port, StageConfig::default());
        pause_and_park(&thread);

        thread.jog(target(0.1)).unwrap();
        thread.jog(target(0.1)).unwrap();
        assert_eq!(thread.qsize(), 2);
        thread.queue_clear();
        assert_eq!(thread.qsize(), 0);

        thread.resume();
        thread.shutdown();
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn fire_and_forget_failures_reach_the_log() {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_max_level(tracing::Level::WARN)
            .finish();
        // Only this test installs a subscriber; the worker thread logs
        // through the global dispatcher.
        let _ = tracing::subscriber::set_global_default(subscriber);

        let port = MockPort::new();
        let thread = spawn_mock(port, StageConfig::default());
        thread.jog(Position::from([('v', 1.0)])).unwrap();
        assert!(thread.wait_idle(Duration::from_secs(1)));
        thread.shutdown();

        let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("axis v is not configured"), "logs: {logs}");
    }

    #[test]
    fn shutdown_joins_the_worker() {
        let port = MockPort::new();
        let thread = spawn_mock(port, StageConfig::default());
        assert!(thread.is_running());
        thread.shutdown();
        assert!(!thread.is_running());
    }
}
