//! Smoothing of raw vehicle inputs and the steer-vs-speed response.

use kinesis_scene::{CarInput, Drivetrain, TankInput};

/// Number of analog channels of a drivetrain.
pub const CHANNELS: usize = 5;

/// Analog driving inputs.
///
/// Car channels are acceleration, brake, handbrake, steer left and steer
/// right, each in `[0, 1]`. Tank channels are acceleration, left thrust,
/// right thrust, left brake and right brake; thrusts are in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AnalogInputs {
    pub values: [f32; CHANNELS],
}

impl AnalogInputs {
    pub fn from_car(input: &CarInput) -> Self {
        Self {
            values: [
                input.acceleration.clamp(0.0, 1.0),
                input.brake.clamp(0.0, 1.0),
                input.handbrake.clamp(0.0, 1.0),
                input.steer.clamp(0.0, 1.0),
                (-input.steer).clamp(0.0, 1.0),
            ],
        }
    }

    pub fn from_tank(input: &TankInput) -> Self {
        Self {
            values: [
                input.acceleration.clamp(0.0, 1.0),
                input.left_thrust.clamp(-1.0, 1.0),
                input.right_thrust.clamp(-1.0, 1.0),
                input.left_brake.clamp(0.0, 1.0),
                input.right_brake.clamp(0.0, 1.0),
            ],
        }
    }

    pub fn from_drivetrain(drivetrain: &Drivetrain) -> Self {
        match drivetrain {
            Drivetrain::Car(input) => Self::from_car(input),
            Drivetrain::Tank(input) => Self::from_tank(input),
        }
    }

    pub fn acceleration(&self) -> f32 {
        self.values[0]
    }

    /// Net car steer, positive to the left.
    pub fn steer(&self) -> f32 {
        self.values[3] - self.values[4]
    }

    /// Moves every channel toward `target` at the channel's rate, never
    /// overshooting it.
    pub fn smoothed_toward(&self, target: &AnalogInputs, rates: &SmoothingRates, dt: f32) -> Self {
        let mut values = self.values;
        for (i, value) in values.iter_mut().enumerate() {
            let goal = target.values[i];
            let rising = goal.abs() > value.abs() && goal * *value >= 0.0;
            let step = if rising { rates.rise[i] } else { rates.fall[i] } * dt;
            *value = if goal > *value {
                (*value + step).min(goal)
            } else {
                (*value - step).max(goal)
            };
        }
        Self { values }
    }
}

/// Per-channel change rates in units per second.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothingRates {
    /// Rate while a channel moves away from zero.
    pub rise: [f32; CHANNELS],
    /// Rate while a channel moves back toward zero.
    pub fall: [f32; CHANNELS],
}

impl Default for SmoothingRates {
    fn default() -> Self {
        Self {
            rise: [6.0, 6.0, 6.0, 2.5, 2.5],
            fall: [10.0, 10.0, 10.0, 5.0, 5.0],
        }
    }
}

/// Steer multiplier as a function of forward speed (m/s), linear between
/// samples and clamped at both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SteerVsSpeedTable {
    points: Vec<(f32, f32)>,
}

impl Default for SteerVsSpeedTable {
    fn default() -> Self {
        Self {
            points: vec![(0.0, 0.75), (5.0, 0.75), (30.0, 0.125), (120.0, 0.1)],
        }
    }
}

impl SteerVsSpeedTable {
    /// Builds a table from `(speed, multiplier)` samples in any order.
    pub fn new(mut points: Vec<(f32, f32)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn sample(&self, speed: f32) -> f32 {
        let Some(&(first_speed, first)) = self.points.first() else {
            return 1.0;
        };
        if speed <= first_speed {
            return first;
        }
        for pair in self.points.windows(2) {
            let ((s0, m0), (s1, m1)) = (pair[0], pair[1]);
            if speed <= s1 {
                let t = if s1 > s0 { (speed - s0) / (s1 - s0) } else { 1.0 };
                return m0 + (m1 - m0) * t;
            }
        }
        self.points.last().map_or(first, |&(_, m)| m)
    }
}
