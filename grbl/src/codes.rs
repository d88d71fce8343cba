//! GRBL v1.1 numeric error and alarm codes.
//!
//! Used to annotate log messages only; control flow never branches on the
//! decoded text.

pub fn error_description(code: u8) -> Option<&'static str> {
    let description = match code {
        1 => "GCode Command letter was not found",
        2 => "GCode Command value invalid or missing",
        3 => "Grbl '$' not recognized or supported",
        4 => "Negative value for an expected positive value",
        5 => "Homing fail. Homing not enabled in settings",
        6 => "Min step pulse must be greater than 3usec",
        7 => "EEPROM read failed. Default values used",
        8 => "Grbl '$' command Only valid when Idle",
        9 => "GCode commands invalid in alarm or jog state",
        10 => "Soft limits require homing to be enabled",
        11 => "Max characters per line exceeded. Ignored",
        12 => "Grbl '$' setting exceeds the maximum step rate",
        13 => "Safety door opened and door state initiated",
        14 => "Build info or start-up line > EEPROM line length",
        15 => "Jog target exceeds machine travel, ignored",
        16 => "Jog Cmd missing '=' or has prohibited GCode",
        17 => "Laser mode requires PWM output",
        20 => "Unsupported or invalid GCode command",
        21 => "> 1 GCode command in a modal group in block",
        22 => "Feed rate has not yet been set or is undefined",
        23 => "GCode command requires an integer value",
        24 => "> 1 GCode command using axis words found",
        25 => "Repeated GCode word found in block",
        26 => "No axis words found in command block",
        27 => "Line number value is invalid",
        28 => "GCode Cmd missing a required value word",
        29 => "G59.x WCS are not supported",
        30 => "G53 only valid with G0 and G1 motion modes",
        31 => "Unneeded Axis words found in block",
        32 => "G2/G3 arcs need >= 1 in-plane axis word",
        33 => "Motion command target is invalid",
        34 => "Arc radius value is invalid",
        35 => "G2/G3 arcs need >= 1 in-plane offset word",
        36 => "Unused value words found in block",
        37 => "G43.1 offset not assigned to tool length axis",
        38 => "Tool number greater than max value",
        _ => return None,
    };
    Some(description)
}

pub fn alarm_description(code: u8) -> Option<&'static str> {
    let description = match code {
        1 => "Hard limit triggered. Position Lost",
        2 => "Soft limit alarm, position kept. Unlock is Safe",
        3 => "Reset while in motion. Position lost",
        4 => "Probe fail. Probe not in expected initial state",
        5 => "Probe fail. Probe did not contact the work",
        6 => "Homing fail. The active homing cycle was reset",
        7 => "Homing fail. Door opened during homing cycle",
        8 => "Homing fail. Pull off failed to clear limit switch",
        9 => "Homing fail. Could not find limit switch",
        _ => return None,
    };
    Some(description)
}
