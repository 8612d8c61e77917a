//! Spatial awareness data exchanged between vehicles.
//!
//! A `SpatialSnapshot` is the unit the sensor collaborator pushes into the
//! engine: position, velocity, acceleration and a discrete driving state,
//! optionally with a short predicted trajectory.

use crate::geometry::{Acceleration, Position, Velocity};
use serde::{Deserialize, Serialize};
use v2v_env::VehicleId;

/// Discrete driving state reported by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleState {
    Stopped,
    Moving,
    Accelerating,
    Decelerating,
    TurningLeft,
    TurningRight,
    Reversing,
    Emergency,
}

/// Message priority, most urgent first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Emergency = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
}

impl MessagePriority {
    /// Numeric wire value (1 = emergency ... 4 = low).
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single predicted point of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub position: Position,
    pub velocity: Velocity,
    pub acceleration: Acceleration,

    /// Prediction confidence (0.0 - 1.0)
    pub confidence: f64,

    /// Seconds ahead of the snapshot time
    pub time_horizon: f64,
}

/// Predicted vehicle trajectory, points ordered by `time_horizon`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub vehicle_id: VehicleId,
    pub points: Vec<TrajectoryPoint>,

    /// Prediction horizon in seconds
    pub prediction_horizon: f64,

    pub confidence: f64,
    pub timestamp_ms: u64,
}

/// Two predicted points closer than this are considered a conflict.
const INTERSECTION_THRESHOLD_M: f64 = 2.0;

impl Trajectory {
    pub fn new(vehicle_id: VehicleId, timestamp_ms: u64) -> Self {
        Self {
            vehicle_id,
            points: Vec::new(),
            prediction_horizon: 5.0,
            confidence: 1.0,
            timestamp_ms,
        }
    }

    pub fn add_point(&mut self, point: TrajectoryPoint) {
        self.points.push(point);
    }

    /// Predicted position at `time_offset` seconds, matched within 0.1 s.
    pub fn position_at(&self, time_offset: f64) -> Option<&Position> {
        self.points
            .iter()
            .find(|p| (p.time_horizon - time_offset).abs() < 0.1)
            .map(|p| &p.position)
    }

    fn points_within(&self, window: f64) -> impl Iterator<Item = &TrajectoryPoint> {
        self.points.iter().take_while(move |p| p.time_horizon <= window)
    }

    /// True if any pair of points inside `window` seconds comes within 2 m.
    pub fn intersects_with(&self, other: &Trajectory, window: f64) -> bool {
        self.min_separation(other, window)
            .map_or(false, |d| d < INTERSECTION_THRESHOLD_M)
    }

    /// Smallest pairwise distance between the two trajectories inside the window.
    pub fn min_separation(&self, other: &Trajectory, window: f64) -> Option<f64> {
        self.points_within(window)
            .flat_map(|a| {
                other
                    .points_within(window)
                    .map(move |b| a.position.distance_to(&b.position))
            })
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Complete spatial awareness data for one vehicle at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialSnapshot {
    pub vehicle_id: VehicleId,
    pub position: Position,
    pub velocity: Velocity,
    pub acceleration: Acceleration,
    pub state: VehicleState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Trajectory>,

    /// Overall data confidence (0.0 - 1.0)
    pub confidence: f64,

    pub timestamp_ms: u64,
}

impl SpatialSnapshot {
    pub fn new(
        vehicle_id: VehicleId,
        position: Position,
        velocity: Velocity,
        acceleration: Acceleration,
        state: VehicleState,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            vehicle_id,
            position,
            velocity,
            acceleration,
            state,
            trajectory: None,
            confidence: 1.0,
            timestamp_ms,
        }
    }

    /// Sets the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_trajectory(mut self, trajectory: Trajectory) -> Self {
        self.trajectory = Some(trajectory);
        self
    }

    pub fn is_emergency(&self) -> bool {
        self.state == VehicleState::Emergency
    }

    /// Message priority derived from the driving state.
    pub fn priority(&self) -> MessagePriority {
        match self.state {
            VehicleState::Emergency => MessagePriority::Emergency,
            VehicleState::Decelerating | VehicleState::TurningLeft | VehicleState::TurningRight => {
                MessagePriority::High
            }
            VehicleState::Stopped => MessagePriority::Low,
            _ => MessagePriority::Normal,
        }
    }

    /// Moves the snapshot to a new position fix.
    ///
    /// When time advanced since the previous fix, speed and heading are
    /// re-derived from the displacement.
    pub fn advance_to(&mut self, position: Position) {
        if position.timestamp_ms > self.position.timestamp_ms {
            let dt = (position.timestamp_ms - self.position.timestamp_ms) as f64 / 1000.0;
            self.velocity.speed = self.position.distance_to(&position) / dt;
            self.velocity.heading = self.position.bearing_to(&position);
            self.velocity.timestamp_ms = position.timestamp_ms;
        }
        self.timestamp_ms = self.timestamp_ms.max(position.timestamp_ms);
        self.position = position;
    }
}

/// True if the two vehicles are within `max_range` meters of each other.
pub fn is_within_communication_range(a: &SpatialSnapshot, b: &SpatialSnapshot, max_range: f64) -> bool {
    a.position.distance_to(&b.position) <= max_range
}

/// Collision risk score (0.0 - 1.0) from the predicted trajectories.
///
/// Zero when either vehicle has no trajectory or the trajectories never
/// come within 2 m inside `time_horizon`.
pub fn collision_risk(a: &SpatialSnapshot, b: &SpatialSnapshot, time_horizon: f64) -> f64 {
    let (Some(ta), Some(tb)) = (&a.trajectory, &b.trajectory) else {
        return 0.0;
    };

    match ta.min_separation(tb, time_horizon) {
        Some(d) if d < INTERSECTION_THRESHOLD_M => {
            if d < 1.0 {
                1.0
            } else {
                0.8
            }
        }
        _ => 0.0,
    }
}
