//! Operator commands and the command → drive lookup table.

use crate::config::{DriveEntry, DriveTableConfig, KeyBindings};

/// One discrete operator command per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    ToggleRecord,
    Quit,
    None,
}

/// Resolution order when several keys are held in the same tick.
pub const PRIORITY: [Command; 7] = [
    Command::Right,
    Command::Left,
    Command::Forward,
    Command::Backward,
    Command::Stop,
    Command::Quit,
    Command::ToggleRecord,
];

/// Maps raw key names onto commands.
#[derive(Debug, Clone)]
pub struct KeyMap {
    bindings: KeyBindings,
}

impl KeyMap {
    pub fn new(bindings: KeyBindings) -> Self {
        KeyMap { bindings }
    }

    fn key_for(&self, command: Command) -> Option<&str> {
        let key = match command {
            Command::Right => &self.bindings.right,
            Command::Left => &self.bindings.left,
            Command::Forward => &self.bindings.up,
            Command::Backward => &self.bindings.down,
            Command::Stop => &self.bindings.stop,
            Command::Quit => &self.bindings.quit,
            Command::ToggleRecord => &self.bindings.toggle_record,
            Command::None => return None,
        };
        Some(key.as_str())
    }

    /// First command in [`PRIORITY`] whose key is held wins.
    pub fn resolve<S: AsRef<str>>(&self, held: &[S]) -> Command {
        PRIORITY
            .iter()
            .copied()
            .find(|cmd| {
                self.key_for(*cmd)
                    .map(|key| held.iter().any(|h| h.as_ref() == key))
                    .unwrap_or(false)
            })
            .unwrap_or(Command::None)
    }
}

/// Scalar drive request. Both fields always lie in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveCommand {
    pub speed: f32,
    pub angle: f32,
}

impl DriveCommand {
    pub fn new(speed: f32, angle: f32) -> Self {
        DriveCommand { speed: clamp_unit(speed), angle: clamp_unit(angle) }
    }
}

impl From<DriveEntry> for DriveCommand {
    fn from(entry: DriveEntry) -> Self {
        let cmd = DriveCommand::new(entry.speed, entry.angle);
        if cmd.speed != entry.speed || cmd.angle != entry.angle {
            tracing::warn!(
                "drive entry ({}, {}) outside [-1, 1], clamped to ({}, {})",
                entry.speed,
                entry.angle,
                cmd.speed,
                cmd.angle
            );
        }
        cmd
    }
}

pub(crate) fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(-1.0, 1.0)
}

/// Fixed command → DriveCommand table. Commands that carry no drive
/// meaning (none, toggle, quit) fall back to the cruise command.
#[derive(Debug, Clone, Copy)]
pub struct CommandTable {
    right: DriveCommand,
    left: DriveCommand,
    forward: DriveCommand,
    backward: DriveCommand,
    stop: DriveCommand,
    cruise: DriveCommand,
}

impl CommandTable {
    pub fn new(table: &DriveTableConfig, cruise: DriveEntry) -> Self {
        CommandTable {
            right: table.right.into(),
            left: table.left.into(),
            forward: table.up.into(),
            backward: table.down.into(),
            stop: table.stop.into(),
            cruise: cruise.into(),
        }
    }

    pub fn lookup(&self, command: Command) -> DriveCommand {
        match command {
            Command::Right => self.right,
            Command::Left => self.left,
            Command::Forward => self.forward,
            Command::Backward => self.backward,
            Command::Stop => self.stop,
            Command::ToggleRecord | Command::Quit | Command::None => self.cruise,
        }
    }
}
