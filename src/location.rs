//! Geolocation snapshots and the watch-style position feed.
//!
//! A producer publishes fixes (or errors) through [`LocationPublisher`];
//! the monitor holds a [`LocationWatch`] and reads the latest fix between
//! ticks to stamp each test outcome.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// A single geodetic fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Ground speed in meters per second.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Degrees clockwise from true north.
    #[serde(default)]
    pub heading: Option<f64>,
    /// Epoch milliseconds at which the fix was taken.
    pub timestamp: i64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            altitude: None,
            speed: None,
            heading: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationError {
    PermissionDenied,
    Unavailable,
    Timeout,
}

impl fmt::Display for LocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LocationError::PermissionDenied => "location permission denied",
            LocationError::Unavailable => "location unavailable",
            LocationError::Timeout => "location request timed out",
        };
        f.write_str(text)
    }
}

impl std::error::Error for LocationError {}

/// Latest known state of the feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationState {
    /// Most recent successful fix, kept across later errors.
    pub position: Option<Position>,
    /// Error reported by the most recent update, cleared by the next fix.
    pub error: Option<LocationError>,
}

#[derive(Debug)]
pub struct LocationPublisher {
    tx: watch::Sender<LocationState>,
}

impl LocationPublisher {
    pub fn publish(&self, position: Position) {
        self.tx.send_modify(|state| {
            state.position = Some(position);
            state.error = None;
        });
    }

    pub fn fail(&self, error: LocationError) {
        self.tx.send_modify(|state| state.error = Some(error));
    }

    pub fn subscribe(&self) -> LocationWatch {
        LocationWatch { rx: self.tx.subscribe() }
    }
}

#[derive(Debug, Clone)]
pub struct LocationWatch {
    rx: watch::Receiver<LocationState>,
}

impl LocationWatch {
    /// The last good fix, if any was ever published.
    pub fn current(&self) -> Option<Position> {
        self.rx.borrow().position.clone()
    }

    pub fn last_error(&self) -> Option<LocationError> {
        self.rx.borrow().error
    }
}

/// Create a connected publisher/watch pair.
pub fn channel() -> (LocationPublisher, LocationWatch) {
    let (tx, rx) = watch::channel(LocationState::default());
    (LocationPublisher { tx }, LocationWatch { rx })
}
