//! Generic motion capability surface plus the per-axis dispatch pipeline
//! (soft limits, unit scaling, backlash compensation) shared by controller
//! adapters.

pub mod grbl;

use std::collections::BTreeMap;

use ::grbl::{GrblError, Position};

use crate::config::AxisConfig;

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    /// Target outside the configured soft limits; raised before any
    /// hardware dispatch.
    #[error("axis {axis} target {target} outside soft limits [{min}, {max}]")]
    AxisExceeded {
        axis: char,
        target: f64,
        min: f64,
        max: f64,
    },

    #[error("axis {0} is not configured")]
    UnknownAxis(char),

    #[error("timed out talking to the motion controller")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The controller connection itself must be discarded, as opposed to a
    /// fault local to one command.
    #[error("motion controller unrecoverable: {0}")]
    Critical(String),

    #[error("motion I/O error: {0}")]
    Io(String),

    /// The worker is gone or the command was discarded before execution.
    #[error("motion service unavailable: {0}")]
    Unavailable(String),
}

impl From<GrblError> for MotionError {
    fn from(e: GrblError) -> Self {
        match e {
            GrblError::Timeout => MotionError::Timeout,
            GrblError::Protocol(msg) => MotionError::Protocol(msg),
            GrblError::Io(source) => MotionError::Io(source.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MotionError>;

/// Receives the last-known position, caller units, on every status read.
pub type StatusCallback = Box<dyn FnMut(&Position) + Send>;

/// Uniform capability set any controller-family driver must implement.
///
/// Implementations are owned by exactly one worker thread; nothing here is
/// expected to be re-entrant.
pub trait MotionHal: Send {
    fn axes(&self) -> Vec<char>;

    /// Registers the callback fed from every status read, including polls
    /// during a blocking move.
    fn register_status_cb(&mut self, cb: StatusCallback);

    fn home(&mut self) -> Result<()>;
    fn move_absolute(&mut self, pos: &Position) -> Result<()>;
    fn move_relative(&mut self, pos: &Position) -> Result<()>;
    fn jog(&mut self, scalars: &Position) -> Result<()>;
    fn pos(&mut self) -> Result<Position>;

    fn set_jog_rate(&mut self, rate: f64);
    fn backlash_enable(&mut self);
    fn backlash_disable(&mut self);

    /// Halt current motion; the controller stays usable.
    fn stop(&mut self) -> Result<()>;
    /// Emergency stop. The position reference is lost until re-homed.
    fn estop(&mut self) -> Result<()>;
    /// Clear the alarm lock left behind by an estop.
    fn unlock(&mut self) -> Result<()>;

    /// Dwell after motion before a measurement is considered valid.
    fn settle(&mut self);

    /// Diagnostics passthrough of one raw controller command.
    fn raw_command(&mut self, cmd: &str) -> Result<String>;

    /// Release the underlying connection. Called on critical faults before
    /// the adapter is dropped.
    fn close(&mut self) {}
}

/// One leg of a planned move, in caller units.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveStep {
    Absolute(Position),
    Relative(Position),
}

/// Per-axis dispatch pipeline. Tracks the direction of travel last
/// commanded on each axis so direction reversals can take up backlash
/// before the real target is commanded.
pub struct AxisPipeline {
    axes: BTreeMap<char, AxisConfig>,
    /// Sign of the last commanded travel per axis.
    last_dir: BTreeMap<char, i8>,
    /// Last commanded position per axis, caller units. Seeded from the
    /// first status probe; cleared when the reference is lost.
    last_target: BTreeMap<char, f64>,
    backlash_enabled: bool,
}

impl AxisPipeline {
    pub fn new(axes: &BTreeMap<char, AxisConfig>) -> Self {
        Self {
            axes: axes.clone(),
            last_dir: BTreeMap::new(),
            last_target: BTreeMap::new(),
            backlash_enabled: true,
        }
    }

    pub fn axes(&self) -> Vec<char> {
        self.axes.keys().copied().collect()
    }

    pub fn scalars(&self) -> BTreeMap<char, f64> {
        self.axes
            .iter()
            .map(|(axis, config)| (*axis, config.scalar))
            .collect()
    }

    pub fn set_backlash_enabled(&mut self, enabled: bool) {
        self.backlash_enabled = enabled;
    }

    /// Seeds the commanded-position reference, e.g. from the initial status
    /// probe. Directions stay unknown.
    pub fn seed_reference(&mut self, pos: &Position) {
        for (axis, value) in pos {
            if self.axes.contains_key(axis) {
                self.last_target.insert(*axis, *value);
            }
        }
    }

    /// Forgets positions and directions; used after estop/reset when the
    /// machine coordinate reference is no longer trustworthy.
    pub fn clear_reference(&mut self) {
        self.last_dir.clear();
        self.last_target.clear();
    }

    /// After a homing cycle every axis sits at machine zero.
    pub fn reference_homed(&mut self) {
        self.last_dir.clear();
        for axis in self.axes.keys() {
            self.last_target.insert(*axis, 0.0);
        }
    }

    fn config(&self, axis: char) -> Result<&AxisConfig> {
        self.axes.get(&axis).ok_or(MotionError::UnknownAxis(axis))
    }

    /// Soft-limit check for an absolute target, caller units. Runs before
    /// anything touches hardware.
    pub fn check_limits(&self, target: &Position) -> Result<()> {
        for (axis, value) in target {
            let config = self.config(*axis)?;
            if let Some((min, max)) = config.soft_limit {
                if *value < min || *value > max {
                    return Err(MotionError::AxisExceeded {
                        axis: *axis,
                        target: *value,
                        min,
                        max,
                    });
                }
            }
        }
        Ok(())
    }

    /// Caller units to device units.
    pub fn scale(&self, pos: &Position) -> Result<Position> {
        let mut scaled = Position::new();
        for (axis, value) in pos {
            scaled.insert(*axis, value * self.config(*axis)?.scalar);
        }
        Ok(scaled)
    }

    /// Device units to caller units, dropping axes outside the configured
    /// set.
    pub fn descale(&self, pos: &Position) -> Position {
        descale_with(&self.scalars(), pos)
    }

    fn compensation_offset(&self, axis: char, dir: i8) -> f64 {
        let config = match self.axes.get(&axis) {
            Some(config) => config,
            None => return 0.0,
        };
        if !self.backlash_enabled || config.backlash == 0.0 || config.backlash_compensation == 0 {
            return 0.0;
        }
        match self.last_dir.get(&axis) {
            // Direction unchanged, slop already taken up.
            Some(last) if *last == dir => 0.0,
            // No prior direction to compare against.
            None => 0.0,
            Some(_) => dir as f64 * config.backlash,
        }
    }

    /// Plans an absolute move: either the target alone, or an intermediate
    /// overshoot taking up backlash on every reversing axis, then the
    /// target.
    pub fn plan_absolute(&mut self, target: &Position) -> Result<Vec<MoveStep>> {
        let mut overshoot = Position::new();
        let mut compensating = false;

        for (axis, value) in target {
            self.config(*axis)?;
            let dir = match self.last_target.get(axis) {
                Some(last) => sign(value - last),
                None => 0,
            };
            let offset = if dir != 0 {
                self.compensation_offset(*axis, dir)
            } else {
                0.0
            };
            if offset != 0.0 {
                compensating = true;
            }
            overshoot.insert(*axis, value + offset);
            if dir != 0 {
                self.last_dir.insert(*axis, dir);
            }
            self.last_target.insert(*axis, *value);
        }

        let steps = if compensating {
            vec![
                MoveStep::Absolute(overshoot),
                MoveStep::Absolute(target.clone()),
            ]
        } else {
            vec![MoveStep::Absolute(target.clone())]
        };
        Ok(steps)
    }

    /// Plans a relative move; reversing axes overshoot by the backlash
    /// magnitude and a second leg walks it back.
    pub fn plan_relative(&mut self, delta: &Position) -> Result<Vec<MoveStep>> {
        let mut overshoot = Position::new();
        let mut takeback = Position::new();

        for (axis, value) in delta {
            self.config(*axis)?;
            let dir = sign(*value);
            let offset = if dir != 0 {
                self.compensation_offset(*axis, dir)
            } else {
                0.0
            };
            overshoot.insert(*axis, value + offset);
            if offset != 0.0 {
                takeback.insert(*axis, -offset);
            }
            if dir != 0 {
                self.last_dir.insert(*axis, dir);
            }
            if let Some(last) = self.last_target.get(axis).copied() {
                self.last_target.insert(*axis, last + value);
            }
        }

        let steps = if takeback.is_empty() {
            vec![MoveStep::Relative(overshoot)]
        } else {
            vec![MoveStep::Relative(overshoot), MoveStep::Relative(takeback)]
        };
        Ok(steps)
    }
}

fn sign(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

pub(crate) fn descale_with(scalars: &BTreeMap<char, f64>, pos: &Position) -> Position {
    pos.iter()
        .filter_map(|(axis, value)| scalars.get(axis).map(|scalar| (*axis, value / scalar)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AxisConfig;

    fn pipeline_with_backlash() -> AxisPipeline {
        let mut axes = BTreeMap::new();
        axes.insert(
            'x',
            AxisConfig {
                scalar: 1.0,
                backlash: 2.0,
                backlash_compensation: -1,
                soft_limit: None,
            },
        );
        let mut pipeline = AxisPipeline::new(&axes);
        pipeline.seed_reference(&Position::from([('x', 0.0)]));
        pipeline
    }

    fn abs(x: f64) -> Position {
        Position::from([('x', x)])
    }

    #[test]
    fn first_move_has_no_compensation() {
        let mut pipeline = pipeline_with_backlash();
        let steps = pipeline.plan_absolute(&abs(5.0)).unwrap();
        assert_eq!(steps, vec![MoveStep::Absolute(abs(5.0))]);
    }

    #[test]
    fn reversal_overshoots_then_returns() {
        let mut pipeline = pipeline_with_backlash();
        pipeline.plan_absolute(&abs(5.0)).unwrap();

        let steps = pipeline.plan_absolute(&abs(0.0)).unwrap();
        assert_eq!(
            steps,
            vec![MoveStep::Absolute(abs(-2.0)), MoveStep::Absolute(abs(0.0))]
        );
    }

    #[test]
    fn continuing_same_direction_goes_straight() {
        let mut pipeline = pipeline_with_backlash();
        pipeline.plan_absolute(&abs(5.0)).unwrap();
        pipeline.plan_absolute(&abs(0.0)).unwrap();

        let steps = pipeline.plan_absolute(&abs(-3.0)).unwrap();
        assert_eq!(steps, vec![MoveStep::Absolute(abs(-3.0))]);
    }

    #[test]
    fn disabled_backlash_never_compensates() {
        let mut pipeline = pipeline_with_backlash();
        pipeline.set_backlash_enabled(false);
        pipeline.plan_absolute(&abs(5.0)).unwrap();
        let steps = pipeline.plan_absolute(&abs(0.0)).unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn relative_reversal_walks_back_the_overshoot() {
        let mut pipeline = pipeline_with_backlash();
        pipeline.plan_relative(&abs(5.0)).unwrap();

        let steps = pipeline.plan_relative(&abs(-5.0)).unwrap();
        assert_eq!(
            steps,
            vec![
                MoveStep::Relative(abs(-7.0)),
                MoveStep::Relative(abs(2.0)),
            ]
        );
    }

    #[test]
    fn homing_resets_direction_state() {
        let mut pipeline = pipeline_with_backlash();
        pipeline.plan_absolute(&abs(5.0)).unwrap();
        pipeline.plan_absolute(&abs(0.0)).unwrap();
        pipeline.reference_homed();

        // Fresh reference: first reversal-looking move is uncompensated.
        let steps = pipeline.plan_absolute(&abs(3.0)).unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn soft_limit_violation_is_axis_exceeded() {
        let mut axes = BTreeMap::new();
        axes.insert(
            'x',
            AxisConfig {
                soft_limit: Some((-10.0, 10.0)),
                ..AxisConfig::default()
            },
        );
        let pipeline = AxisPipeline::new(&axes);

        assert!(pipeline.check_limits(&abs(5.0)).is_ok());
        let err = pipeline.check_limits(&abs(10.5)).unwrap_err();
        match err {
            MotionError::AxisExceeded {
                axis, target, max, ..
            } => {
                assert_eq!(axis, 'x');
                assert_eq!(target, 10.5);
                assert_eq!(max, 10.0);
            }
            other => panic!("expected AxisExceeded, got {other}"),
        }
    }

    #[test]
    fn unknown_axis_is_rejected() {
        let pipeline = pipeline_with_backlash();
        assert!(matches!(
            pipeline.check_limits(&Position::from([('q', 1.0)])),
            Err(MotionError::UnknownAxis('q'))
        ));
    }

    #[test]
    fn scaling_round_trip() {
        let mut axes = BTreeMap::new();
        axes.insert(
            'x',
            AxisConfig {
                scalar: 2.5,
                ..AxisConfig::default()
            },
        );
        let pipeline = AxisPipeline::new(&axes);

        let scaled = pipeline.scale(&abs(4.0)).unwrap();
        assert_eq!(scaled[&'x'], 10.0);
        let back = pipeline.descale(&scaled);
        assert_eq!(back[&'x'], 4.0);
    }

    #[test]
    fn descale_drops_unconfigured_axes() {
        let pipeline = pipeline_with_backlash();
        let pos = Position::from([('x', 1.0), ('z', 9.0)]);
        let caller = pipeline.descale(&pos);
        assert_eq!(caller.len(), 1);
        assert!(caller.contains_key(&'x'));
    }
}
