//! Record/idle lifecycle.
//!
//! `Idle --toggle--> Armed --next tick--> Active --toggle--> Idle`. A toggle
//! is an edge: holding the toggle key across ticks counts once.

use crate::command::Command;
use crate::session::{label_path, summary_path};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Armed,
    Active,
}

/// What changed during one call to [`RecordingStateMachine::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Armed,
    Activated,
    Stopped,
}

/// Rising-edge detector on the toggle command.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToggleEdge {
    previous: Option<Command>,
}

impl ToggleEdge {
    /// True only on the first tick of a toggle press. The remembered
    /// command resets on release or on any other command.
    pub fn update(&mut self, command: Command) -> bool {
        let fired = command == Command::ToggleRecord && self.previous != Some(Command::ToggleRecord);
        self.previous = match command {
            Command::None => None,
            other => Some(other),
        };
        fired
    }
}

#[derive(Debug, Default)]
pub struct RecordingStateMachine {
    state: RecordingState,
    toggle: ToggleEdge,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn advance(&mut self, command: Command) -> Transition {
        let toggled = self.toggle.update(command);
        let (next, transition) = match self.state {
            RecordingState::Idle if toggled => (RecordingState::Armed, Transition::Armed),
            RecordingState::Idle => (RecordingState::Idle, Transition::None),
            RecordingState::Armed => (RecordingState::Active, Transition::Activated),
            RecordingState::Active if toggled => (RecordingState::Idle, Transition::Stopped),
            RecordingState::Active => (RecordingState::Active, Transition::None),
        };
        if transition != Transition::None {
            tracing::debug!("recording {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        transition
    }
}

/// Hands out session folders `img{N}` under the data directory.
///
/// `N` only ever grows: scanning starts from the index after the last one
/// handed out, so a folder removed behind our back is never reused. An index
/// is also skipped while its `log_{N}.csv` or `log_{N}.json` exists.
#[derive(Debug)]
pub struct SessionFolders {
    root: PathBuf,
    next_index: u64,
}

impl SessionFolders {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).with_context(|| format!("creating data directory {}", root.display()))?;
        Ok(SessionFolders { root, next_index: 0 })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_for(&self, index: u64) -> PathBuf {
        self.root.join(format!("img{}", index))
    }

    fn is_taken(&self, index: u64) -> bool {
        self.folder_for(index).exists()
            || label_path(&self.root, index).exists()
            || summary_path(&self.root, index).exists()
    }

    pub fn allocate(&mut self) -> Result<(u64, PathBuf)> {
        let mut index = self.next_index;
        while self.is_taken(index) {
            index += 1;
        }
        let path = self.folder_for(index);
        std::fs::create_dir(&path).with_context(|| format!("creating session folder {}", path.display()))?;
        self.next_index = index + 1;
        Ok((index, path))
    }
}
