//! Differential-drive mixing.
//!
//! Turns a signed `(speed, angle)` request into one unsigned magnitude per
//! wheel plus a shared direction flag. The actuator primitives only accept
//! a magnitude in [0, 1], so the sign never reaches the sink.

use crate::command::{clamp_unit, DriveCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelDrive {
    pub direction: Direction,
    /// Always in [0, 1].
    pub magnitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WheelCommand {
    Stop,
    Drive { left: WheelDrive, right: WheelDrive },
}

fn clamp_magnitude(v: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, 1.0)
}

/// `right = speed - angle`, `left = speed + angle`, each clamped to [0, 1].
///
/// A backward request is mixed on the negated speed and routed to the
/// backward primitive. Zero speed maps to [`WheelCommand::Stop`].
pub fn mix(cmd: DriveCommand) -> WheelCommand {
    let speed = clamp_unit(cmd.speed);
    let angle = clamp_unit(cmd.angle);

    let (direction, magnitude) = if speed > 0.0 {
        (Direction::Forward, speed)
    } else if speed < 0.0 {
        (Direction::Backward, -speed)
    } else {
        return WheelCommand::Stop;
    };

    let right = clamp_magnitude(magnitude - angle);
    let left = clamp_magnitude(magnitude + angle);

    WheelCommand::Drive {
        left: WheelDrive { direction, magnitude: left },
        right: WheelDrive { direction, magnitude: right },
    }
}

/// Which mixing law an actuator expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveLayout {
    /// Two independently driven wheels.
    Differential,
    /// One drive motor plus a steering servo.
    ServoSteering,
}

/// Output of [`mix_servo`]. The servo is positioned even when stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoCommand {
    Stop { steer: f32 },
    Drive { motor: WheelDrive, steer: f32 },
}

/// Single-motor mix: the speed magnitude goes to the drive motor, clamped to
/// [0, 1], with its sign as the direction flag. The angle becomes the servo
/// ratio unchanged.
pub fn mix_servo(cmd: DriveCommand) -> ServoCommand {
    let speed = clamp_unit(cmd.speed);
    let steer = clamp_unit(cmd.angle);
    let direction = if speed > 0.0 {
        Direction::Forward
    } else if speed < 0.0 {
        Direction::Backward
    } else {
        return ServoCommand::Stop { steer };
    };
    ServoCommand::Drive { motor: WheelDrive { direction, magnitude: clamp_magnitude(speed.abs()) }, steer }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(cmd: WheelCommand) -> (WheelDrive, WheelDrive) {
        match cmd {
            WheelCommand::Drive { left, right } => (left, right),
            WheelCommand::Stop => panic!("expected a drive command"),
        }
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_full_lock_turn_keeps_one_wheel_stationary() {
        let (left, right) = drive(mix(DriveCommand::new(0.6, 0.6)));
        assert!(approx(right.magnitude, 0.0));
        assert!(approx(left.magnitude, 1.0));
        assert_eq!(left.direction, Direction::Forward);
    }

    #[test]
    fn test_wheel_difference_tracks_angle_when_unsaturated() {
        let speeds = [0.3f32, 0.5, 0.7];
        let angles = [-0.2f32, -0.1, 0.0, 0.1, 0.2];
        for &speed in &speeds {
            for &angle in &angles {
                let (left, right) = drive(mix(DriveCommand::new(speed, angle)));
                assert!(approx(left.magnitude - right.magnitude, 2.0 * angle), "speed={speed} angle={angle}");
            }
        }
    }

    #[test]
    fn test_outputs_always_in_range() {
        let mut v = -1.0f32;
        while v <= 1.0 {
            let mut a = -1.0f32;
            while a <= 1.0 {
                if let WheelCommand::Drive { left, right } = mix(DriveCommand::new(v, a)) {
                    assert!((0.0..=1.0).contains(&left.magnitude));
                    assert!((0.0..=1.0).contains(&right.magnitude));
                    assert_eq!(left.direction, right.direction);
                }
                a += 0.25;
            }
            v += 0.25;
        }
    }

    #[test]
    fn test_backward_uses_negated_speed() {
        let (left, right) = drive(mix(DriveCommand::new(-0.4, 0.0)));
        assert_eq!(left.direction, Direction::Backward);
        assert_eq!(right.direction, Direction::Backward);
        assert!(approx(left.magnitude, 0.4));
        assert!(approx(right.magnitude, 0.4));
    }

    #[test]
    fn test_zero_speed_stops() {
        assert_eq!(mix(DriveCommand::new(0.0, 0.0)), WheelCommand::Stop);
        assert_eq!(mix(DriveCommand::new(0.0, 0.8)), WheelCommand::Stop);
    }

    #[test]
    fn test_unclamped_input_is_clamped_first() {
        let cmd = DriveCommand { speed: 4.0, angle: -9.0 };
        let (left, right) = drive(mix(cmd));
        assert!(approx(left.magnitude, 0.0));
        assert!(approx(right.magnitude, 1.0));
    }

    #[test]
    fn test_servo_mix_splits_speed_and_angle() {
        let forward = mix_servo(DriveCommand::new(0.6, -0.6));
        assert_eq!(
            forward,
            ServoCommand::Drive { motor: WheelDrive { direction: Direction::Forward, magnitude: 0.6 }, steer: -0.6 }
        );

        match mix_servo(DriveCommand::new(-0.4, 0.2)) {
            ServoCommand::Drive { motor, steer } => {
                assert_eq!(motor.direction, Direction::Backward);
                assert!(approx(motor.magnitude, 0.4));
                assert!(approx(steer, 0.2));
            }
            ServoCommand::Stop { .. } => panic!("expected a drive command"),
        }

        assert_eq!(mix_servo(DriveCommand::new(0.0, 0.8)), ServoCommand::Stop { steer: 0.8 });
        assert_eq!(
            mix_servo(DriveCommand { speed: -3.0, angle: 2.0 }),
            ServoCommand::Drive { motor: WheelDrive { direction: Direction::Backward, magnitude: 1.0 }, steer: 1.0 }
        );
    }
}
