use crate::config::{CameraConfig, CameraKind};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command as Process;

/// Region of interest as fractions of the frame: `(x, y, width, height)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Roi {
    pub fn from_array(v: [f32; 4]) -> Result<Self> {
        let [x, y, width, height] = v;
        if v.iter().any(|f| !(0.0..=1.0).contains(f)) {
            bail!("roi components must lie in [0, 1], got {:?}", v);
        }
        if width <= 0.0 || height <= 0.0 {
            bail!("roi must have a non-empty area, got {:?}", v);
        }
        if x + width > 1.0 + f32::EPSILON || y + height > 1.0 + f32::EPSILON {
            bail!("roi extends past the frame, got {:?}", v);
        }
        Ok(Roi { x, y, width, height })
    }
}

/// Path of a captured image, as recorded in label rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(PathBuf);

impl ImageRef {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

pub trait CaptureSource: Send {
    /// Capture one frame to `target` (no extension) and block until it is
    /// on disk.
    fn capture(&mut self, target: &Path, roi: Option<&Roi>) -> Result<ImageRef>;
    fn release(&mut self) -> Result<()>;
}

pub fn open_camera(cfg: &CameraConfig, extension: &str) -> Result<Box<dyn CaptureSource>> {
    match cfg.kind {
        CameraKind::Synthetic => {
            tracing::info!("using synthetic camera {}x{}", cfg.width, cfg.height);
            Ok(Box::new(SyntheticCamera::new(cfg.width, cfg.height)?))
        }
        CameraKind::Still => {
            let cam = StillCommandCamera::new(cfg.program.clone(), cfg.args.clone(), cfg.width, cfg.height, extension);
            cam.probe().with_context(|| format!("camera program {} unavailable", cfg.program))?;
            Ok(Box::new(cam))
        }
    }
}

/// Bytes in one 8-bit grayscale frame.
fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

/// Writes flat grey PNG frames. Never overwrites an existing file.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frames: u64,
    released: bool,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("synthetic camera needs a non-zero frame size");
        }
        Ok(SyntheticCamera { width, height, frames: 0, released: false })
    }

    fn cropped(&self, roi: Option<&Roi>) -> (u32, u32) {
        match roi {
            Some(r) => (
                ((self.width as f32 * r.width).round() as u32).max(1),
                ((self.height as f32 * r.height).round() as u32).max(1),
            ),
            None => (self.width, self.height),
        }
    }
}

impl CaptureSource for SyntheticCamera {
    fn capture(&mut self, target: &Path, roi: Option<&Roi>) -> Result<ImageRef> {
        if self.released {
            bail!("camera already released");
        }
        let path = target.with_extension("png");
        let (w, h) = self.cropped(roi);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("creating frame {}", path.display()))?;

        let mut encoder = png::Encoder::new(BufWriter::new(file), w, h);
        encoder.set_color(png::ColorType::Grayscale);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        let shade = (self.frames % 200) as u8 + 28;
        writer.write_image_data(&vec![shade; frame_len(w, h)])?;
        writer.finish()?;

        self.frames += 1;
        Ok(ImageRef(path))
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        tracing::info!("synthetic camera released after {} frames", self.frames);
        Ok(())
    }
}

/// Shells out to a still-capture program such as `libcamera-still`.
pub struct StillCommandCamera {
    program: String,
    args: Vec<String>,
    width: u32,
    height: u32,
    extension: String,
    released: bool,
}

impl StillCommandCamera {
    pub fn new(program: String, args: Vec<String>, width: u32, height: u32, extension: &str) -> Self {
        StillCommandCamera { program, args, width, height, extension: extension.to_string(), released: false }
    }

    fn probe(&self) -> Result<()> {
        let output = Process::new(&self.program).arg("--version").output()?;
        tracing::info!("camera program {} responded ({})", self.program, output.status);
        Ok(())
    }

    fn command_for(&self, path: &Path, roi: Option<&Roi>) -> Process {
        let mut cmd = Process::new(&self.program);
        cmd.args(&self.args)
            .arg("--width")
            .arg(self.width.to_string())
            .arg("--height")
            .arg(self.height.to_string());
        if let Some(r) = roi {
            cmd.arg("--roi").arg(format!("{},{},{},{}", r.x, r.y, r.width, r.height));
        }
        cmd.arg("-o").arg(path);
        cmd
    }
}

impl CaptureSource for StillCommandCamera {
    fn capture(&mut self, target: &Path, roi: Option<&Roi>) -> Result<ImageRef> {
        if self.released {
            bail!("camera already released");
        }
        let path = target.with_extension(&self.extension);
        let output = self
            .command_for(&path, roi)
            .output()
            .with_context(|| format!("running {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if !path.exists() {
            bail!("{} reported success but {} is missing", self.program, path.display());
        }
        Ok(ImageRef(path))
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        tracing::info!("still camera released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roi_validation() {
        assert!(Roi::from_array([0.0, 0.2, 0.8, 0.8]).is_ok());
        assert!(Roi::from_array([0.5, 0.0, 0.6, 0.5]).is_err());
        assert!(Roi::from_array([0.0, 0.0, 0.0, 0.5]).is_err());
        assert!(Roi::from_array([-0.1, 0.0, 0.5, 0.5]).is_err());
    }

    #[test]
    fn test_synthetic_capture_writes_cropped_png() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut cam = SyntheticCamera::new(100, 50)?;
        let roi = Roi::from_array([0.0, 0.2, 0.8, 0.8])?;

        let image = cam.capture(&tmpdir.path().join("img_0_1"), Some(&roi))?;
        assert_eq!(image.path(), tmpdir.path().join("img_0_1.png"));

        let decoder = png::Decoder::new(std::fs::File::open(image.path())?);
        let reader = decoder.read_info()?;
        assert_eq!(reader.info().width, 80);
        assert_eq!(reader.info().height, 40);
        Ok(())
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_frame_len_does_not_overflow_u32() {
        assert_eq!(frame_len(70_000, 70_000), 4_900_000_000);
        assert_eq!(frame_len(320, 240), 76_800);
    }

    #[test]
    fn test_synthetic_capture_never_overwrites() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut cam = SyntheticCamera::new(8, 8)?;
        let target = tmpdir.path().join("frame");
        cam.capture(&target, None)?;
        assert!(cam.capture(&target, None).is_err());
        Ok(())
    }

    #[test]
    fn test_still_command_arguments() {
        let cam = StillCommandCamera::new("libcamera-still".into(), vec!["--nopreview".into()], 320, 240, "jpg");
        let roi = Roi { x: 0.0, y: 0.2, width: 0.8, height: 0.8 };
        let cmd = cam.command_for(Path::new("/tmp/img_3_9.jpg"), Some(&roi));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["--nopreview", "--width", "320", "--height", "240", "--roi", "0,0.2,0.8,0.8", "-o", "/tmp/img_3_9.jpg"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_still_command_failure_is_reported() -> Result<()> {
        let tmpdir = TempDir::new()?;
        let mut cam = StillCommandCamera::new("false".into(), vec![], 10, 10, "jpg");
        assert!(cam.capture(&tmpdir.path().join("x"), None).is_err());
        Ok(())
    }
}
