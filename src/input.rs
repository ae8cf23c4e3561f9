use crate::command::{Command, KeyMap};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

pub trait InputSource: Send {
    /// Sample the operator input once. Called exactly once per tick.
    fn poll(&mut self) -> Result<Command>;
}

/// Key batches read ahead of time, one per tick.
///
/// Each script line lists the keys held during that tick. Once the script
/// runs out the quit command is returned forever.
pub struct ScriptedInput {
    keys: KeyMap,
    ticks: VecDeque<Vec<String>>,
}

impl ScriptedInput {
    pub fn new(keys: KeyMap, ticks: Vec<Vec<String>>) -> Self {
        ScriptedInput { keys, ticks: ticks.into() }
    }

    pub fn parse(keys: KeyMap, script: &str) -> Self {
        let ticks = script
            .lines()
            .map(|line| line.split_whitespace().map(str::to_string).collect())
            .collect();
        Self::new(keys, ticks)
    }

    pub fn load(keys: KeyMap, path: &Path) -> Result<Self> {
        let script = std::fs::read_to_string(path).with_context(|| format!("reading key script {}", path.display()))?;
        Ok(Self::parse(keys, &script))
    }
}

impl InputSource for ScriptedInput {
    fn poll(&mut self) -> Result<Command> {
        match self.ticks.pop_front() {
            Some(held) => Ok(self.keys.resolve(&held)),
            None => Ok(Command::Quit),
        }
    }
}

/// Live keys delivered by a reader task.
///
/// Every `poll` drains all batches queued since the previous tick before
/// resolving; skipping the drain would leave the input stale by however
/// many batches arrived.
pub struct KeyChannel {
    keys: KeyMap,
    rx: UnboundedReceiver<Vec<String>>,
    closed: bool,
}

impl KeyChannel {
    pub fn new(keys: KeyMap) -> (Self, UnboundedSender<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (KeyChannel { keys, rx, closed: false }, tx)
    }
}

impl InputSource for KeyChannel {
    fn poll(&mut self) -> Result<Command> {
        let mut held: Vec<String> = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(batch) => held.extend(batch),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        tracing::warn!("key input closed, quitting");
                        self.closed = true;
                    }
                    break;
                }
            }
        }
        let cmd = self.keys.resolve(&held);
        if cmd == Command::None && self.closed {
            return Ok(Command::Quit);
        }
        Ok(cmd)
    }
}

/// Forward stdin lines as key batches until EOF.
///
/// Runs on a plain thread: a blocking stdin read inside the async runtime
/// would keep the runtime from shutting down.
pub fn spawn_stdin_reader(tx: UnboundedSender<Vec<String>>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    let batch: Vec<String> = line.split_whitespace().map(str::to_string).collect();
                    if tx.send(batch).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("stdin read error: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn keymap() -> KeyMap {
        KeyMap::new(AppConfig::load_default().unwrap().keys)
    }

    #[test]
    fn test_script_yields_one_command_per_line() -> Result<()> {
        let mut input = ScriptedInput::parse(keymap(), "UP\nRIGHT UP\n\nr\n");
        assert_eq!(input.poll()?, Command::Forward);
        assert_eq!(input.poll()?, Command::Right);
        assert_eq!(input.poll()?, Command::None);
        assert_eq!(input.poll()?, Command::ToggleRecord);
        assert_eq!(input.poll()?, Command::Quit);
        assert_eq!(input.poll()?, Command::Quit);
        Ok(())
    }

    #[test]
    fn test_key_channel_drains_pending_batches() -> Result<()> {
        let (mut input, tx) = KeyChannel::new(keymap());
        assert_eq!(input.poll()?, Command::None);

        tx.send(vec!["UP".into()])?;
        tx.send(vec!["LEFT".into()])?;
        assert_eq!(input.poll()?, Command::Left);
        assert_eq!(input.poll()?, Command::None);
        Ok(())
    }

    #[test]
    fn test_key_channel_quits_when_closed() -> Result<()> {
        let (mut input, tx) = KeyChannel::new(keymap());
        tx.send(vec!["s".into()])?;
        drop(tx);
        assert_eq!(input.poll()?, Command::Stop);
        assert_eq!(input.poll()?, Command::Quit);
        Ok(())
    }
}
