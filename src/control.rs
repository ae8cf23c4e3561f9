//! The manual-driving control loop.
//!
//! One tick: poll input, look up the drive command, advance the recording
//! state machine, actuate, record a sample while active, flush on stop,
//! and release hardware on quit. Everything runs on one thread in that
//! order; nothing is retried or rolled back mid-tick.

use crate::actuator::{self, ActuatorSink};
use crate::camera::{CaptureSource, ImageRef, Roi};
use crate::command::{Command, CommandTable, DriveCommand};
use crate::input::InputSource;
use crate::recording::{RecordingState, RecordingStateMachine, SessionFolders, Transition};
use crate::session::{SessionLogger, SessionSummary};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Owns the actuator and camera and releases each exactly once, whether
/// through [`Hardware::release`] or on drop.
pub struct Hardware {
    pub actuator: Box<dyn ActuatorSink>,
    pub camera: Box<dyn CaptureSource>,
    released: bool,
}

impl Hardware {
    pub fn new(actuator: Box<dyn ActuatorSink>, camera: Box<dyn CaptureSource>) -> Self {
        Hardware { actuator, camera, released: false }
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let stopped = self.actuator.stop();
        let actuator = self.actuator.release();
        let camera = self.camera.release();
        tracing::info!("hardware released");
        stopped.and(actuator).and(camera)
    }
}

impl Drop for Hardware {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("hardware release failed: {:#}", e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub roi: Option<Roi>,
    pub write_summary: bool,
    /// Lower bound on tick duration. Zero runs ticks back to back.
    pub min_tick: Duration,
}

#[derive(Debug)]
pub struct TickReport {
    pub command: Command,
    pub drive: DriveCommand,
    pub state: RecordingState,
    pub transition: Transition,
    pub sample: Option<ImageRef>,
    pub flushed: Option<SessionSummary>,
    pub quit: bool,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub ticks: u64,
    pub sessions: Vec<SessionSummary>,
    pub interrupted: bool,
}

pub struct ControlLoop {
    input: Box<dyn InputSource>,
    hardware: Hardware,
    table: CommandTable,
    recorder: RecordingStateMachine,
    folders: SessionFolders,
    session: Option<SessionLogger>,
    options: LoopOptions,
    shutdown: Arc<AtomicBool>,
}

impl ControlLoop {
    pub fn new(
        input: Box<dyn InputSource>,
        hardware: Hardware,
        table: CommandTable,
        folders: SessionFolders,
        options: LoopOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        ControlLoop {
            input,
            hardware,
            table,
            recorder: RecordingStateMachine::new(),
            folders,
            session: None,
            options,
            shutdown,
        }
    }

    pub fn tick(&mut self) -> Result<TickReport> {
        let command = self.input.poll()?;
        let drive = self.table.lookup(command);

        let transition = self.recorder.advance(command);
        if transition == Transition::Armed {
            let (index, folder) = self.folders.allocate()?;
            self.session = Some(SessionLogger::open(
                index,
                folder,
                self.folders.root().to_path_buf(),
                self.options.write_summary,
            ));
        }

        actuator::actuate(self.hardware.actuator.as_mut(), drive)?;

        let mut sample = None;
        if self.recorder.state() == RecordingState::Active {
            let session = self.session.as_mut().ok_or_else(|| anyhow!("recording active without an open session"))?;
            sample = Some(session.record_sample(
                self.hardware.camera.as_mut(),
                self.options.roi.as_ref(),
                drive.speed,
                drive.angle,
            )?);
        }

        let mut flushed = None;
        if transition == Transition::Stopped {
            if let Some(mut session) = self.session.take() {
                flushed = Some(session.flush()?);
            }
        }

        let quit = command == Command::Quit;
        if quit {
            self.shut_down("quit command");
            self.hardware.release()?;
        }

        Ok(TickReport { command, drive, state: self.recorder.state(), transition, sample, flushed, quit })
    }

    fn shut_down(&mut self, reason: &str) {
        tracing::info!("stopping control loop: {}", reason);
        if let Some(session) = self.session.take() {
            tracing::warn!(
                "session {} left unflushed, dropping {} samples (images stay in {})",
                session.index(),
                session.rows().len(),
                session.folder().display()
            );
        }
    }

    /// Tick until quit or interrupt. Hardware is released on every exit path.
    pub fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.shut_down("interrupted");
                summary.interrupted = true;
                self.hardware.release()?;
                return Ok(summary);
            }

            let started = Instant::now();
            let report = match self.tick() {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("tick {} failed: {:#}", summary.ticks, e);
                    if let Err(re) = self.hardware.release() {
                        tracing::error!("hardware release failed: {:#}", re);
                    }
                    return Err(e);
                }
            };
            tracing::trace!(
                "tick {}: {:?} -> ({:.2}, {:.2}) {:?}/{:?} sample={}",
                summary.ticks,
                report.command,
                report.drive.speed,
                report.drive.angle,
                report.state,
                report.transition,
                report.sample.as_ref().map(|s| s.to_string()).unwrap_or_default()
            );
            summary.ticks += 1;
            if let Some(s) = report.flushed {
                summary.sessions.push(s);
            }
            if report.quit {
                return Ok(summary);
            }

            let elapsed = started.elapsed();
            if elapsed < self.options.min_tick {
                std::thread::sleep(self.options.min_tick - elapsed);
            }
        }
    }
}
