use crate::command::DriveCommand;
use crate::config::{ActuatorConfig, ActuatorKind, MotorPins, SteeringConfig};
use crate::mixer::{mix, mix_servo, Direction, DriveLayout, ServoCommand, Side, WheelCommand};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};

/// Motor output. Magnitudes are unsigned; the direction flag selects the
/// forward or backward primitive.
///
/// Differential sinks implement [`ActuatorSink::drive`]. Servo-steered sinks
/// report [`DriveLayout::ServoSteering`] and implement `drive_motor` and
/// `steer` instead.
pub trait ActuatorSink: Send {
    fn layout(&self) -> DriveLayout {
        DriveLayout::Differential
    }
    fn drive(&mut self, side: Side, direction: Direction, magnitude: f32) -> Result<()>;
    fn drive_motor(&mut self, _direction: Direction, _magnitude: f32) -> Result<()> {
        bail!("actuator has no single drive motor")
    }
    /// Position the steering servo, `ratio` in [-1, 1].
    fn steer(&mut self, _ratio: f32) -> Result<()> {
        bail!("actuator has no steering servo")
    }
    fn stop(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// Mix a drive request the way the sink expects and send it.
pub fn actuate(sink: &mut dyn ActuatorSink, cmd: DriveCommand) -> Result<()> {
    match sink.layout() {
        DriveLayout::Differential => apply(sink, mix(cmd)),
        DriveLayout::ServoSteering => match mix_servo(cmd) {
            ServoCommand::Stop { steer } => {
                sink.steer(steer)?;
                sink.stop()
            }
            ServoCommand::Drive { motor, steer } => {
                sink.steer(steer)?;
                sink.drive_motor(motor.direction, motor.magnitude)
            }
        },
    }
}

fn apply(sink: &mut dyn ActuatorSink, cmd: WheelCommand) -> Result<()> {
    match cmd {
        WheelCommand::Stop => sink.stop(),
        WheelCommand::Drive { left, right } => {
            sink.drive(Side::Left, left.direction, left.magnitude)?;
            sink.drive(Side::Right, right.direction, right.magnitude)
        }
    }
}

pub fn open_actuator(cfg: &ActuatorConfig) -> Result<Box<dyn ActuatorSink>> {
    match cfg.kind {
        ActuatorKind::Simulated => {
            tracing::info!("using simulated actuator");
            Ok(Box::new(SimulatedActuator::default()))
        }
        ActuatorKind::Sysfs => {
            let driver = SysfsMotorDriver::open(&cfg.sysfs_root, cfg.pwm_period_ns, cfg.left, cfg.right)
                .context("initializing sysfs motor driver")?;
            Ok(Box::new(driver))
        }
        ActuatorKind::ServoSteering => {
            let steering = cfg.steering.ok_or_else(|| anyhow!("servo_steering needs an [actuator.steering] section"))?;
            let driver = SysfsServoSteering::open(&cfg.sysfs_root, cfg.pwm_period_ns, &steering)
                .context("initializing servo steering driver")?;
            Ok(Box::new(driver))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelState {
    pub direction: Option<Direction>,
    pub magnitude: f32,
}

/// Dry-run sink that only remembers and logs what it was told.
#[derive(Debug, Default)]
pub struct SimulatedActuator {
    pub left: WheelState,
    pub right: WheelState,
    pub released: bool,
}

impl ActuatorSink for SimulatedActuator {
    fn drive(&mut self, side: Side, direction: Direction, magnitude: f32) -> Result<()> {
        if self.released {
            bail!("actuator already released");
        }
        let state = WheelState { direction: Some(direction), magnitude: magnitude.clamp(0.0, 1.0) };
        match side {
            Side::Left => self.left = state,
            Side::Right => self.right = state,
        }
        tracing::debug!("sim motor {:?} {:?} {:.2}", side, direction, state.magnitude);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.released {
            bail!("actuator already released");
        }
        self.left = WheelState::default();
        self.right = WheelState::default();
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.left = WheelState::default();
        self.right = WheelState::default();
        self.released = true;
        tracing::info!("simulated actuator released");
        Ok(())
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).with_context(|| format!("writing {} to {}", value, path.display()))
}

/// One exported channel of a sysfs PWM chip.
struct PwmChannel {
    chip_dir: PathBuf,
    dir: PathBuf,
    channel: u32,
    period_ns: u64,
}

impl PwmChannel {
    fn open(root: &Path, chip: u32, channel: u32, period_ns: u64) -> Result<Self> {
        let chip_dir = root.join("pwm").join(format!("pwmchip{}", chip));
        let dir = chip_dir.join(format!("pwm{}", channel));
        if !dir.exists() {
            write_attr(&chip_dir.join("export"), &channel.to_string())?;
        }
        write_attr(&dir.join("period"), &period_ns.to_string())?;
        write_attr(&dir.join("duty_cycle"), "0")?;
        write_attr(&dir.join("enable"), "1")?;
        Ok(PwmChannel { chip_dir, dir, channel, period_ns })
    }

    fn set_duty_ns(&self, duty_ns: u64) -> Result<()> {
        write_attr(&self.dir.join("duty_cycle"), &duty_ns.min(self.period_ns).to_string())
    }

    /// Duty as a fraction of the period.
    fn set_fraction(&self, fraction: f64) -> Result<()> {
        self.set_duty_ns((fraction.clamp(0.0, 1.0) * self.period_ns as f64).round() as u64)
    }

    fn close(&self) -> Result<()> {
        write_attr(&self.dir.join("duty_cycle"), "0")?;
        write_attr(&self.dir.join("enable"), "0")?;
        write_attr(&self.chip_dir.join("unexport"), &self.channel.to_string())
    }
}

/// One H-bridge channel exposed through sysfs.
struct SysfsMotor {
    pwm: PwmChannel,
    forward_pin: PathBuf,
    backward_pin: PathBuf,
    gpio_root: PathBuf,
    pins: MotorPins,
}

impl SysfsMotor {
    fn open(root: &Path, pins: MotorPins, period_ns: u64) -> Result<Self> {
        let gpio_root = root.join("gpio");
        let forward_pin = export_gpio(&gpio_root, pins.forward_pin)?;
        let backward_pin = export_gpio(&gpio_root, pins.backward_pin)?;
        let pwm = PwmChannel::open(root, pins.pwm_chip, pins.pwm_channel, period_ns)?;
        Ok(SysfsMotor { pwm, forward_pin, backward_pin, gpio_root, pins })
    }

    fn set(&self, direction: Direction, magnitude: f32) -> Result<()> {
        let (active, inactive) = match direction {
            Direction::Forward => (&self.forward_pin, &self.backward_pin),
            Direction::Backward => (&self.backward_pin, &self.forward_pin),
        };
        // Never assert both directions, even transiently.
        write_attr(&inactive.join("value"), "0")?;
        write_attr(&active.join("value"), "1")?;
        self.pwm.set_fraction(magnitude as f64)
    }

    fn stop(&self) -> Result<()> {
        self.pwm.set_duty_ns(0)?;
        write_attr(&self.forward_pin.join("value"), "0")?;
        write_attr(&self.backward_pin.join("value"), "0")
    }

    fn close(&self) -> Result<()> {
        self.stop()?;
        self.pwm.close()?;
        write_attr(&self.gpio_root.join("unexport"), &self.pins.forward_pin.to_string())?;
        write_attr(&self.gpio_root.join("unexport"), &self.pins.backward_pin.to_string())
    }
}

fn export_gpio(gpio_root: &Path, pin: u32) -> Result<PathBuf> {
    let pin_dir = gpio_root.join(format!("gpio{}", pin));
    if !pin_dir.exists() {
        write_attr(&gpio_root.join("export"), &pin.to_string())?;
    }
    write_attr(&pin_dir.join("direction"), "out")?;
    write_attr(&pin_dir.join("value"), "0")?;
    Ok(pin_dir)
}

/// Undo a half-finished open so nothing stays exported.
fn close_on_error<T>(opened: impl FnOnce() -> Result<()>, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(e) = opened() {
            tracing::warn!("cleanup after failed open: {:#}", e);
        }
    }
    result
}

/// Dual H-bridge (L298N style) driven through `/sys/class/{gpio,pwm}`.
pub struct SysfsMotorDriver {
    left: SysfsMotor,
    right: SysfsMotor,
    released: bool,
}

impl SysfsMotorDriver {
    pub fn open(root: &Path, period_ns: u64, left: MotorPins, right: MotorPins) -> Result<Self> {
        if period_ns == 0 {
            bail!("pwm period must be non-zero");
        }
        let right = SysfsMotor::open(root, right, period_ns).context("right motor")?;
        let left = close_on_error(|| right.close(), SysfsMotor::open(root, left, period_ns).context("left motor"))?;
        tracing::info!("sysfs motor driver ready under {}", root.display());
        Ok(SysfsMotorDriver { left, right, released: false })
    }

    fn motor(&self, side: Side) -> &SysfsMotor {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

impl ActuatorSink for SysfsMotorDriver {
    fn drive(&mut self, side: Side, direction: Direction, magnitude: f32) -> Result<()> {
        if self.released {
            bail!("motor driver already released");
        }
        self.motor(side).set(direction, magnitude)
    }

    fn stop(&mut self) -> Result<()> {
        if self.released {
            bail!("motor driver already released");
        }
        self.right.stop()?;
        self.left.stop()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let right = self.right.close();
        let left = self.left.close();
        tracing::info!("sysfs motor driver released");
        right.and(left)
    }
}

/// Servo pulse width as a fraction of the period: 2% at full left, 12% at
/// full right.
fn servo_duty_fraction(ratio: f32) -> f64 {
    let ratio = ratio.clamp(-1.0, 1.0) as f64;
    0.02 + (ratio + 1.0) * 0.05
}

/// One H-bridge motor for speed and a hobby servo for steering.
pub struct SysfsServoSteering {
    motor: SysfsMotor,
    servo: PwmChannel,
    released: bool,
}

impl SysfsServoSteering {
    pub fn open(root: &Path, period_ns: u64, cfg: &SteeringConfig) -> Result<Self> {
        if period_ns == 0 || cfg.servo_period_ns == 0 {
            bail!("pwm period must be non-zero");
        }
        let motor = SysfsMotor::open(root, cfg.motor, period_ns).context("drive motor")?;
        let servo = close_on_error(
            || motor.close(),
            PwmChannel::open(root, cfg.servo_chip, cfg.servo_channel, cfg.servo_period_ns).context("steering servo"),
        )?;
        let driver = SysfsServoSteering { motor, servo, released: false };
        driver.servo.set_fraction(servo_duty_fraction(0.0))?;
        tracing::info!("servo steering driver ready under {}", root.display());
        Ok(driver)
    }

    fn check_open(&self) -> Result<()> {
        if self.released {
            bail!("servo steering driver already released");
        }
        Ok(())
    }
}

impl ActuatorSink for SysfsServoSteering {
    fn layout(&self) -> DriveLayout {
        DriveLayout::ServoSteering
    }

    fn drive(&mut self, side: Side, _direction: Direction, _magnitude: f32) -> Result<()> {
        bail!("servo steering has no independent {:?} wheel", side)
    }

    fn drive_motor(&mut self, direction: Direction, magnitude: f32) -> Result<()> {
        self.check_open()?;
        self.motor.set(direction, magnitude)
    }

    fn steer(&mut self, ratio: f32) -> Result<()> {
        self.check_open()?;
        self.servo.set_fraction(servo_duty_fraction(ratio))
    }

    fn stop(&mut self) -> Result<()> {
        self.check_open()?;
        self.motor.stop()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let motor = self.motor.close();
        let servo = self.servo.close();
        tracing::info!("servo steering driver released");
        motor.and(servo)
    }
}
