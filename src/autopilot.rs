//! Autonomous replay: camera frame -> trained model -> motors.

use crate::actuator;
use crate::camera::Roi;
use crate::command::{Command, DriveCommand};
use crate::control::Hardware;
use crate::input::InputSource;
use anyhow::{anyhow, bail, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command as Process, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A trained model treated as an opaque function of one image.
pub trait Predictor: Send {
    fn predict(&mut self, image: &Path) -> Result<DriveCommand>;
}

/// Parse one `angle,speed` line, the model's output order.
pub fn parse_prediction(line: &str) -> Result<DriveCommand> {
    let mut parts = line.trim().split(',').map(str::trim);
    let (Some(angle), Some(speed), None) = (parts.next(), parts.next(), parts.next()) else {
        bail!("expected `angle,speed`, got {:?}", line.trim());
    };
    let angle: f32 = angle.parse().with_context(|| format!("bad angle {:?}", angle))?;
    let speed: f32 = speed.parse().with_context(|| format!("bad speed {:?}", speed))?;
    Ok(DriveCommand::new(speed, angle))
}

/// Long-lived predictor process speaking a line protocol: one image path
/// in on stdin, one `angle,speed` line out on stdout.
pub struct ProcessPredictor {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessPredictor {
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| anyhow!("predictor command is empty"))?;
        let mut child = Process::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("starting predictor {}", program))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("predictor stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("predictor stdout unavailable"))?;
        tracing::info!("predictor {} started (pid {})", program, child.id());
        Ok(ProcessPredictor { child, stdin, stdout: BufReader::new(stdout) })
    }
}

impl Predictor for ProcessPredictor {
    fn predict(&mut self, image: &Path) -> Result<DriveCommand> {
        writeln!(self.stdin, "{}", image.display())?;
        self.stdin.flush()?;
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            bail!("predictor closed its output");
        }
        parse_prediction(&line)
    }
}

impl Drop for ProcessPredictor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct Autopilot {
    predictor: Box<dyn Predictor>,
    hardware: Hardware,
    input: Option<Box<dyn InputSource>>,
    frame_path: PathBuf,
    roi: Option<Roi>,
    shutdown: Arc<AtomicBool>,
}

impl Autopilot {
    pub fn new(
        predictor: Box<dyn Predictor>,
        hardware: Hardware,
        input: Option<Box<dyn InputSource>>,
        frame_path: PathBuf,
        roi: Option<Roi>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Autopilot { predictor, hardware, input, frame_path, roi, shutdown }
    }

    /// Capture, predict, actuate. Returns false once the operator quit.
    pub fn tick(&mut self) -> Result<bool> {
        if let Some(input) = self.input.as_mut() {
            if input.poll()? == Command::Quit {
                return Ok(false);
            }
        }
        let image = self.hardware.camera.capture(&self.frame_path, self.roi.as_ref())?;
        let drive = self.predictor.predict(image.path());
        // The frame is rewritten every tick.
        if let Err(e) = std::fs::remove_file(image.path()) {
            tracing::debug!("could not remove frame {}: {}", image, e);
        }
        let drive = drive?;
        tracing::debug!("prediction speed={:.3} angle={:.3}", drive.speed, drive.angle);
        actuator::actuate(self.hardware.actuator.as_mut(), drive)?;
        Ok(true)
    }

    pub fn run(&mut self, max_ticks: Option<u64>) -> Result<u64> {
        let mut ticks = 0;
        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::info!("autopilot interrupted");
                break Ok(ticks);
            }
            if max_ticks.is_some_and(|max| ticks >= max) {
                break Ok(ticks);
            }
            match self.tick() {
                Ok(true) => ticks += 1,
                Ok(false) => break Ok(ticks),
                Err(e) => break Err(e),
            }
        };
        let released = self.hardware.release();
        let ticks = result?;
        released?;
        tracing::info!("autopilot stopped after {} ticks", ticks);
        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::KeyMap;
    use crate::config::AppConfig;
    use crate::control::tests::{fake_hardware, Events};
    use crate::input::ScriptedInput;
    use tempfile::TempDir;

    struct Scripted(Vec<DriveCommand>);

    impl Predictor for Scripted {
        fn predict(&mut self, image: &Path) -> Result<DriveCommand> {
            assert!(image.exists());
            if self.0.is_empty() {
                bail!("model exhausted");
            }
            Ok(self.0.remove(0))
        }
    }

    #[test]
    fn test_parse_prediction_uses_angle_then_speed() -> Result<()> {
        assert_eq!(parse_prediction("0.25, 0.5\n")?, DriveCommand::new(0.5, 0.25));
        assert_eq!(parse_prediction("-3,2")?, DriveCommand::new(1.0, -1.0));
        assert!(parse_prediction("0.1").is_err());
        assert!(parse_prediction("0.1,0.2,0.3").is_err());
        assert!(parse_prediction("a,b").is_err());
        Ok(())
    }

    #[test]
    fn test_autopilot_drives_predictions_then_releases() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let events = Events::default();
        let predictions = vec![DriveCommand::new(0.5, 0.1), DriveCommand::new(-0.3, 0.0)];
        let mut pilot = Autopilot::new(
            Box::new(Scripted(predictions)),
            fake_hardware(&events, false),
            None,
            tmpdir.path().join("road_img"),
            None,
            Arc::new(AtomicBool::new(false)),
        );

        assert_eq!(pilot.run(Some(2))?, 2);
        let log = events.lock().unwrap().clone();
        assert!(log.contains(&"drive Left Forward 0.60".to_string()));
        assert!(log.contains(&"drive Right Backward 0.30".to_string()));
        assert_eq!(log.iter().filter(|e| e.as_str() == "release camera").count(), 1);
        assert!(!tmpdir.path().join("road_img.png").exists());
        Ok(())
    }

    #[test]
    fn test_autopilot_quit_key_and_model_failure() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let cfg = AppConfig::load_default()?;
        let events = Events::default();
        let input = ScriptedInput::parse(KeyMap::new(cfg.keys), "\nk\n");
        let mut pilot = Autopilot::new(
            Box::new(Scripted(vec![DriveCommand::new(0.4, 0.0)])),
            fake_hardware(&events, false),
            Some(Box::new(input)),
            tmpdir.path().join("road_img"),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(pilot.run(None)?, 1);

        let failing = Events::default();
        let mut pilot = Autopilot::new(
            Box::new(Scripted(vec![])),
            fake_hardware(&failing, false),
            None,
            tmpdir.path().join("road_img"),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(pilot.run(None).is_err());
        assert_eq!(failing.lock().unwrap().iter().filter(|e| e.as_str() == "release actuator").count(), 1);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_process_predictor_line_protocol() -> Result<()> {
        let argv: Vec<String> = ["sh", "-c", "while read p; do echo '0.2,0.4'; done"].iter().map(|s| s.to_string()).collect();
        let mut predictor = ProcessPredictor::spawn(&argv)?;
        assert_eq!(predictor.predict(Path::new("/tmp/frame.png"))?, DriveCommand::new(0.4, 0.2));
        assert_eq!(predictor.predict(Path::new("/tmp/frame.png"))?, DriveCommand::new(0.4, 0.2));
        Ok(())
    }
}
