//! [`MotionHal`] adapter for GRBL controllers: runs every command through
//! the axis pipeline, then hands device-unit motion to the retrying driver.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use grbl::{Grbl, GrblError, Position};
use tracing::{debug, info, warn};

use crate::config::StageConfig;
use crate::hal::{
    descale_with, AxisPipeline, MotionError, MotionHal, MoveStep, Result, StatusCallback,
};

/// Serial read timeout; the driver layers its own deadlines on top.
const PORT_TIMEOUT: Duration = Duration::from_millis(10);

pub struct GrblHal<P> {
    driver: Grbl<P>,
    pipeline: AxisPipeline,
    feed_rate: f64,
    jog_rate: f64,
    settle: Duration,
}

/// Opens the configured serial port and brings up an adapter over it.
pub fn open_hal(config: &StageConfig) -> Result<GrblHal<Box<dyn serialport::SerialPort>>> {
    info!("opening {} at {} baud", config.port, config.baud);
    let port = serialport::new(&config.port, config.baud)
        .timeout(PORT_TIMEOUT)
        .open()
        .map_err(|e| MotionError::Critical(format!("open {}: {e}", config.port)))?;
    let driver = Grbl::new(port).map_err(|e| MotionError::Critical(e.to_string()))?;
    GrblHal::new(driver, config)
}

impl<P: Read + Write + Send> GrblHal<P> {
    /// Wraps an already-probed driver. Reads the current position once to
    /// seed the backlash reference.
    pub fn new(mut driver: Grbl<P>, config: &StageConfig) -> Result<Self> {
        let pipeline = AxisPipeline::new(&config.axes);
        let mpos = driver.mpos().map_err(Self::classify_status)?;
        let mut hal = Self {
            driver,
            pipeline,
            feed_rate: config.feed_rate,
            jog_rate: config.jog_rate,
            settle: Duration::from_millis(config.settle_ms),
        };
        let seed = hal.pipeline.descale(&mpos);
        hal.pipeline.seed_reference(&seed);
        debug!("seeded position reference: {seed:?}");
        Ok(hal)
    }

    /// A status query that cannot be answered even after retries means the
    /// link itself is gone, not just one command.
    fn classify_status(e: GrblError) -> MotionError {
        match e {
            GrblError::Protocol(msg) => MotionError::Critical(msg),
            other => other.into(),
        }
    }

    fn dispatch(&mut self, steps: Vec<MoveStep>) -> Result<()> {
        for step in steps {
            match step {
                MoveStep::Absolute(pos) => {
                    let scaled = self.pipeline.scale(&pos)?;
                    self.driver.move_absolute(&scaled, self.feed_rate, true)?;
                }
                MoveStep::Relative(delta) => {
                    let scaled = self.pipeline.scale(&delta)?;
                    self.driver.move_relative(&scaled, self.feed_rate, true)?;
                }
            }
        }
        Ok(())
    }
}

impl<P: Read + Write + Send> MotionHal for GrblHal<P> {
    fn axes(&self) -> Vec<char> {
        self.pipeline.axes()
    }

    fn register_status_cb(&mut self, mut cb: StatusCallback) {
        let scalars = self.pipeline.scalars();
        self.driver.set_status_observer(Box::new(move |status| {
            cb(&descale_with(&scalars, &status.mpos));
        }));
    }

    fn home(&mut self) -> Result<()> {
        self.driver.home()?;
        self.pipeline.reference_homed();
        Ok(())
    }

    fn move_absolute(&mut self, pos: &Position) -> Result<()> {
        self.pipeline.check_limits(pos)?;
        let steps = self.pipeline.plan_absolute(pos)?;
        self.dispatch(steps)
    }

    fn move_relative(&mut self, delta: &Position) -> Result<()> {
        let steps = self.pipeline.plan_relative(delta)?;
        self.dispatch(steps)
    }

    fn jog(&mut self, scalars: &Position) -> Result<()> {
        // Jogs are unplanned by design; the controller's own travel checks
        // reject anything out of range.
        let scaled = self.pipeline.scale(scalars)?;
        self.driver.jog(&scaled, self.jog_rate)?;
        Ok(())
    }

    fn pos(&mut self) -> Result<Position> {
        let mpos = self.driver.mpos().map_err(Self::classify_status)?;
        Ok(self.pipeline.descale(&mpos))
    }

    fn set_jog_rate(&mut self, rate: f64) {
        self.jog_rate = rate;
    }

    fn backlash_enable(&mut self) {
        self.pipeline.set_backlash_enabled(true);
    }

    fn backlash_disable(&mut self) {
        self.pipeline.set_backlash_enabled(false);
    }

    fn stop(&mut self) -> Result<()> {
        self.driver.cancel_jog()?;
        Ok(())
    }

    fn estop(&mut self) -> Result<()> {
        warn!("emergency stop: resetting controller");
        self.pipeline.clear_reference();
        self.driver
            .reset()
            .map_err(|e| MotionError::Critical(format!("reset failed: {e}")))
    }

    fn unlock(&mut self) -> Result<()> {
        self.driver.unlock()?;
        Ok(())
    }

    fn settle(&mut self) {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
    }

    fn raw_command(&mut self, cmd: &str) -> Result<String> {
        Ok(self.driver.raw_command(cmd)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AxisConfig;
    use grbl::mock::{MockPort, RESET_MARKER};
    use grbl::Transport;

    fn config() -> StageConfig {
        let mut config = StageConfig::default();
        let x = config.axes.get_mut(&'x').unwrap();
        x.backlash = 2.0;
        x.backlash_compensation = -1;
        x.soft_limit = Some((-100.0, 100.0));
        config
    }

    fn hal(port: MockPort, config: &StageConfig) -> GrblHal<MockPort> {
        let driver = Grbl::from_transport(Transport::with_timeout(
            port,
            Duration::from_millis(30),
        ));
        GrblHal::new(driver, config).unwrap()
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

    #[test]
    fn reversal_issues_two_moves() {
        let port = MockPort::new();
        let mut hal = hal(port.clone(), &config());
        port.clear_transcript();

        hal.move_absolute(&target(5.0)).unwrap();
        assert_eq!(moves(&port.transcript()).len(), 1);

        port.clear_transcript();
        hal.move_absolute(&target(0.0)).unwrap();
        let wire = moves(&port.transcript());
        assert_eq!(
            wire,
            vec!["$J=G90 X-2.000 F1000", "$J=G90 X0.000 F1000"]
        );
    }

    #[test]
    fn soft_limit_rejected_before_hardware() {
        let port = MockPort::new();
        let mut hal = hal(port.clone(), &config());
        port.clear_transcript();

        let err = hal.move_absolute(&target(150.0)).unwrap_err();
        assert!(matches!(err, MotionError::AxisExceeded { .. }));
        assert!(moves(&port.transcript()).is_empty());
    }

    #[test]
    fn moves_are_scaled_to_device_units() {
        let mut config = StageConfig::default();
        config.axes.get_mut(&'x').unwrap().scalar = 2.0;
        let port = MockPort::new();
        let mut hal = hal(port.clone(), &config);
        port.clear_transcript();

        hal.move_absolute(&target(3.0)).unwrap();
        assert_eq!(moves(&port.transcript()), vec!["$J=G90 X6.000 F1000"]);
    }

    #[test]
    fn pos_descales_machine_position() {
        let mut config = StageConfig::default();
        config.axes.get_mut(&'x').unwrap().scalar = 2.0;
        let port = MockPort::new();
        port.set_status("Idle|MPos:8.000,0.000,0.000|FS:0,0");
        let mut hal = hal(port, &config);

        let pos = hal.pos().unwrap();
        assert_eq!(pos[&'x'], 4.0);
    }

    #[test]
    fn status_callback_gets_caller_units() {
        use std::sync::{Arc, Mutex};

        let mut config = StageConfig::default();
        config.axes.get_mut(&'x').unwrap().scalar = 2.0;
        let port = MockPort::new();
        port.set_status("Idle|MPos:8.000,0.000,0.000|FS:0,0");
        let mut hal = hal(port, &config);

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        hal.register_status_cb(Box::new(move |pos| {
            *sink.lock().unwrap() = Some(pos.clone());
        }));
        hal.pos().unwrap();
        let observed = seen.lock().unwrap().clone().unwrap();
        assert_eq!(observed[&'x'], 4.0);
    }

    #[test]
    fn estop_resets_and_drops_backlash_reference() {
        let port = MockPort::new();
        let mut hal = hal(port.clone(), &config());

        hal.move_absolute(&target(5.0)).unwrap();
        hal.estop().unwrap();
        assert!(port.transcript().contains(&RESET_MARKER.to_string()));

        // Reference lost: a reversing move is not compensated.
        port.clear_transcript();
        hal.move_absolute(&target(0.0)).unwrap();
        assert_eq!(moves(&port.transcript()).len(), 1);
    }

    #[test]
    fn unplanned_jog_is_scaled_only() {
        let mut config = config();
        config.axes.get_mut(&'x').unwrap().scalar = 2.0;
        let port = MockPort::new();
        let mut hal = hal(port.clone(), &config);
        port.clear_transcript();

        hal.jog(&target(0.5)).unwrap();
        assert_eq!(moves(&port.transcript()), vec!["$J=G91 X1.000 F100"]);
    }
}
