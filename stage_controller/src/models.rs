use grbl::Position;
use tokio::sync::oneshot;

use crate::hal::MotionError;

/// Verbs the motion worker understands. All motion values are caller units.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCommand {
    Home,
    MoveAbsolute(Position),
    MoveRelative(Position),
    Jog(Position),
    /// Fresh position from hardware.
    Pos,
    /// Refresh the cached position without returning it.
    UpdatePosCache,
    SetJogRate(f64),
    BacklashEnable,
    BacklashDisable,
    /// Clear the alarm lock after an emergency stop.
    Unlock,
    /// Diagnostics passthrough of one raw controller command.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Done,
    Position(Position),
    Output(String),
}

pub type CommandResult = Result<CommandResponse, MotionError>;

/// A queued command plus its completion channel and the e-stop epoch it was
/// submitted under. Commands stamped before the latest e-stop are discarded
/// unexecuted.
pub struct CommandEnvelope {
    pub command: MotionCommand,
    pub completion: Option<oneshot::Sender<CommandResult>>,
    pub epoch: u64,
}
