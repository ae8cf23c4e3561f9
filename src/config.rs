use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    #[serde(default = "default_write_summary")]
    pub write_summary: bool,
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

fn default_write_summary() -> bool {
    true
}

/// Raw `{ speed, angle }` pair as written in the config file. Clamped when
/// turned into a [`crate::command::DriveCommand`].
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DriveEntry {
    pub speed: f32,
    pub angle: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_min_tick_ms")]
    pub min_tick_ms: u64,
    pub cruise: DriveEntry,
}

fn default_min_tick_ms() -> u64 {
    0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveTableConfig {
    pub right: DriveEntry,
    pub left: DriveEntry,
    pub up: DriveEntry,
    pub down: DriveEntry,
    pub stop: DriveEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyBindings {
    pub right: String,
    pub left: String,
    pub up: String,
    pub down: String,
    pub stop: String,
    pub quit: String,
    pub toggle_record: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    Simulated,
    Sysfs,
    ServoSteering,
}

/// One side of the H-bridge: a PWM channel on the enable line and two
/// GPIO direction pins.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MotorPins {
    pub pwm_chip: u32,
    pub pwm_channel: u32,
    pub forward_pin: u32,
    pub backward_pin: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    pub kind: ActuatorKind,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default = "default_pwm_period_ns")]
    pub pwm_period_ns: u64,
    pub left: MotorPins,
    pub right: MotorPins,
    /// Only read by the `servo_steering` kind.
    pub steering: Option<SteeringConfig>,
}

/// Single drive motor plus a hobby servo on its own PWM channel.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SteeringConfig {
    pub motor: MotorPins,
    pub servo_chip: u32,
    pub servo_channel: u32,
    #[serde(default = "default_servo_period_ns")]
    pub servo_period_ns: u64,
}

fn default_servo_period_ns() -> u64 {
    // 50 Hz
    20_000_000
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class")
}

fn default_pwm_period_ns() -> u64 {
    10_000_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Synthetic,
    Still,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub kind: CameraKind,
    #[serde(default = "default_still_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub roi: Option<[f32; 4]>,
}

fn default_still_program() -> String {
    "libcamera-still".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutopilotConfig {
    pub command: Vec<String>,
    #[serde(default = "default_frame_path")]
    pub frame_path: PathBuf,
}

fn default_frame_path() -> PathBuf {
    PathBuf::from("road_img")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub control: ControlConfig,
    pub drive: DriveTableConfig,
    pub keys: KeyBindings,
    pub actuator: ActuatorConfig,
    pub camera: CameraConfig,
    pub autopilot: Option<AutopilotConfig>,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p).with_context(|| format!("reading config {}", p.display()))?;
        let cfg: AppConfig = toml::from_str(&s).with_context(|| format!("parsing config {}", p.display()))?;
        Ok(cfg)
    }
}
