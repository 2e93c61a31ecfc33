//! Typed device commands

use std::fmt;
use std::ops::RangeInclusive;

use crate::{Result, SessionError};

const MOVE_RANGE_CM: RangeInclusive<u32> = 20..=500;
const ROTATE_RANGE_DEG: RangeInclusive<u32> = 1..=360;
const SPEED_RANGE_CM_S: RangeInclusive<u32> = 10..=100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Back,
    Left,
    Right,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flip {
    Left,
    Right,
    Forward,
    Back,
}

/// A command of the drone's text protocol.
///
/// Formatting with `Display` yields the exact wire text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroneCommand {
    /// Enter SDK mode; must precede every other command
    Command,
    Takeoff,
    Land,
    StreamOn,
    StreamOff,
    /// Stop all motors immediately
    Emergency,
    Move(Direction, u32),
    Rotate(Rotation, u32),
    Flip(Flip),
    Speed(u32),
    Battery,
    FlightTime,
}

impl DroneCommand {
    /// Build a move, checking the distance against what the device accepts.
    pub fn movement(direction: Direction, cm: u32) -> Result<Self> {
        check_range("distance", cm, MOVE_RANGE_CM)?;
        Ok(DroneCommand::Move(direction, cm))
    }

    /// Build a rotation, checking the angle against what the device accepts.
    pub fn rotate(rotation: Rotation, degrees: u32) -> Result<Self> {
        check_range("angle", degrees, ROTATE_RANGE_DEG)?;
        Ok(DroneCommand::Rotate(rotation, degrees))
    }

    pub fn speed(cm_per_s: u32) -> Result<Self> {
        check_range("speed", cm_per_s, SPEED_RANGE_CM_S)?;
        Ok(DroneCommand::Speed(cm_per_s))
    }

    /// Re-check arguments of a command built directly from its variants.
    pub fn validate(&self) -> Result<()> {
        match *self {
            DroneCommand::Move(_, cm) => check_range("distance", cm, MOVE_RANGE_CM),
            DroneCommand::Rotate(_, degrees) => check_range("angle", degrees, ROTATE_RANGE_DEG),
            DroneCommand::Speed(value) => check_range("speed", value, SPEED_RANGE_CM_S),
            _ => Ok(()),
        }
    }
}

fn check_range(what: &str, value: u32, range: RangeInclusive<u32>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(SessionError::invalid_command(format!(
            "{what} {value} outside {}..={}",
            range.start(),
            range.end()
        )))
    }
}

impl fmt::Display for DroneCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DroneCommand::Command => f.write_str("command"),
            DroneCommand::Takeoff => f.write_str("takeoff"),
            DroneCommand::Land => f.write_str("land"),
            DroneCommand::StreamOn => f.write_str("streamon"),
            DroneCommand::StreamOff => f.write_str("streamoff"),
            DroneCommand::Emergency => f.write_str("emergency"),
            DroneCommand::Move(direction, cm) => {
                let verb = match direction {
                    Direction::Forward => "forward",
                    Direction::Back => "back",
                    Direction::Left => "left",
                    Direction::Right => "right",
                    Direction::Up => "up",
                    Direction::Down => "down",
                };
                write!(f, "{verb} {cm}")
            }
            DroneCommand::Rotate(Rotation::Clockwise, degrees) => write!(f, "cw {degrees}"),
            DroneCommand::Rotate(Rotation::CounterClockwise, degrees) => write!(f, "ccw {degrees}"),
            DroneCommand::Flip(flip) => {
                let code = match flip {
                    Flip::Left => 'l',
                    Flip::Right => 'r',
                    Flip::Forward => 'f',
                    Flip::Back => 'b',
                };
                write!(f, "flip {code}")
            }
            DroneCommand::Speed(value) => write!(f, "speed {value}"),
            DroneCommand::Battery => f.write_str("battery?"),
            DroneCommand::FlightTime => f.write_str("time?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_text() {
        assert_eq!(DroneCommand::Command.to_string(), "command");
        assert_eq!(DroneCommand::StreamOn.to_string(), "streamon");
        assert_eq!(DroneCommand::movement(Direction::Up, 50).unwrap().to_string(), "up 50");
        assert_eq!(
            DroneCommand::rotate(Rotation::CounterClockwise, 90).unwrap().to_string(),
            "ccw 90"
        );
        assert_eq!(DroneCommand::Flip(Flip::Back).to_string(), "flip b");
        assert_eq!(DroneCommand::Battery.to_string(), "battery?");
    }

    #[test]
    fn out_of_range_arguments_are_rejected() {
        assert!(DroneCommand::movement(Direction::Forward, 19).is_err());
        assert!(DroneCommand::movement(Direction::Forward, 501).is_err());
        assert!(DroneCommand::rotate(Rotation::Clockwise, 0).is_err());
        assert!(DroneCommand::speed(101).is_err());
        assert!(DroneCommand::Move(Direction::Left, 5).validate().is_err());
        assert!(DroneCommand::Move(Direction::Left, 20).validate().is_ok());
    }
}
