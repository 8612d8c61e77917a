//! Spatial geometry primitives.
//!
//! Pure value types and great-circle math on a spherical earth. All
//! functions are side-effect free and deterministic for identical inputs.

use serde::{Deserialize, Serialize};

/// Mean earth radius used by the Haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geodetic position reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Decimal degrees
    pub latitude: f64,

    /// Decimal degrees
    pub longitude: f64,

    /// Meters above sea level
    pub altitude: f64,

    /// Horizontal accuracy in meters
    pub accuracy: f64,

    /// Reading time (Unix milliseconds)
    pub timestamp_ms: u64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
            accuracy: 1.0,
            timestamp_ms: 0,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = altitude;
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    /// Stamps the reading with a timestamp.
    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        distance(self, other)
    }

    /// Initial bearing to `other` in degrees, in [0, 360).
    pub fn bearing_to(&self, other: &Position) -> f64 {
        bearing(self, other)
    }
}

/// Great-circle distance between two positions (Haversine), in meters.
pub fn distance(a: &Position, b: &Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` to `b` in degrees, normalized to [0, 360).
pub fn bearing(a: &Position, b: &Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let y = delta_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lon.cos();

    let degrees = (y.atan2(x).to_degrees() + 360.0) % 360.0;
    if degrees >= 360.0 {
        0.0
    } else {
        degrees
    }
}

/// Vehicle velocity reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    /// Ground speed in m/s
    pub speed: f64,

    /// Direction of travel in degrees (0 = north, clockwise, 0-360)
    pub heading: f64,

    /// Vertical speed in m/s
    pub vertical_speed: f64,

    /// Accuracy in m/s
    pub accuracy: f64,

    pub timestamp_ms: u64,
}

impl Velocity {
    pub fn new(speed: f64, heading: f64) -> Self {
        Self {
            speed,
            heading,
            vertical_speed: 0.0,
            accuracy: 0.1,
            timestamp_ms: 0,
        }
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Decomposes the velocity into `[east, north, vertical]` components.
    pub fn to_vector(&self) -> [f64; 3] {
        to_vector(self)
    }

    pub fn magnitude(&self) -> f64 {
        let [east, north, up] = self.to_vector();
        (east * east + north * north + up * up).sqrt()
    }
}

/// Decomposes speed/heading into `[east, north, vertical]` in m/s.
pub fn to_vector(velocity: &Velocity) -> [f64; 3] {
    let heading = velocity.heading.to_radians();
    [
        velocity.speed * heading.sin(),
        velocity.speed * heading.cos(),
        velocity.vertical_speed,
    ]
}

/// Vehicle acceleration reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    /// Longitudinal acceleration in m/s²
    pub linear: f64,

    /// Lateral acceleration in m/s²
    pub lateral: f64,

    /// Yaw rate in rad/s
    pub angular_velocity: f64,

    pub accuracy: f64,

    pub timestamp_ms: u64,
}

impl Acceleration {
    pub fn new(linear: f64) -> Self {
        Self {
            linear,
            lateral: 0.0,
            angular_velocity: 0.0,
            accuracy: 0.1,
            timestamp_ms: 0,
        }
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

impl Default for Acceleration {
    fn default() -> Self {
        Self::new(0.0)
    }
}
