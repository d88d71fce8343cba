use std::collections::BTreeMap;

use crate::error::{GrblError, Result};

/// Machine coordinates keyed by axis letter.
pub type Position = BTreeMap<char, f64>;

/// Axes reported in the `MPos` field, in report order.
pub const REPORT_AXES: [char; 3] = ['x', 'y', 'z'];

/// Machine state token from the first field of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MachineState {
    /// No successful probe yet.
    #[default]
    Unknown,
    Idle,
    Jog,
    Run,
    Hold,
    Alarm,
    Home,
    Other(String),
}

impl MachineState {
    /// Tokens may carry a substate, e.g. `Hold:0`.
    pub fn from_token(token: &str) -> Self {
        match token.split(':').next().unwrap_or("") {
            "Idle" => MachineState::Idle,
            "Jog" => MachineState::Jog,
            "Run" => MachineState::Run,
            "Hold" => MachineState::Hold,
            "Alarm" => MachineState::Alarm,
            "Home" => MachineState::Home,
            other => MachineState::Other(other.to_string()),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, MachineState::Idle)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: MachineState,
    pub mpos: Position,
}

/// Parses the payload of a `<...>` status report, e.g.
/// `Idle|MPos:8.000,0.000,0.000|FS:0,0`.
///
/// Field 0 is the state token, field 1 the machine position; anything after
/// that is opaque and ignored. The link is noisy enough that concatenated
/// fields show up in practice (`MPos:-72.425,-25.634,0.000FS:0,0`), which
/// must fail the parse rather than produce a bogus coordinate.
pub fn parse_status(raw: &str) -> Result<Status> {
    let mut fields = raw.split('|');

    let token = fields
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| GrblError::Protocol(format!("status line missing state token: {raw:?}")))?;
    let state = MachineState::from_token(token);

    let mpos_field = fields
        .next()
        .ok_or_else(|| GrblError::Protocol(format!("status line missing MPos field: {raw:?}")))?;
    let coords = mpos_field
        .strip_prefix("MPos:")
        .ok_or_else(|| GrblError::Protocol(format!("expected MPos field, got {mpos_field:?}")))?;

    let mut mpos = Position::new();
    for (axis, value) in REPORT_AXES.iter().zip(coords.split(',')) {
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| GrblError::Protocol(format!("bad {axis} coordinate in {raw:?}")))?;
        mpos.insert(*axis, value);
    }
    if mpos.len() != REPORT_AXES.len() {
        return Err(GrblError::Protocol(format!(
            "expected {} coordinates in {raw:?}",
            REPORT_AXES.len()
        )));
    }

    Ok(Status { state, mpos })
}
