//! Reading classification.

use crate::event::TelemetryEvent;

/// Outcome of classifying a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Within the expected range
    Normal,
    /// Above the vibration threshold; still processed normally
    Anomalous,
    /// Above the physical-impossibility ceiling; a business-rule violation
    Invalid,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Normal => "normal",
            Classification::Anomalous => "anomalous",
            Classification::Invalid => "invalid",
        }
    }
}

/// Threshold-based classifier. Stateless; callers record metrics.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    vibration_threshold: f64,
    physical_ceiling: f64,
}

impl AnomalyDetector {
    pub fn new(vibration_threshold: f64, physical_ceiling: f64) -> Self {
        Self {
            vibration_threshold,
            physical_ceiling,
        }
    }

    pub fn classify(&self, event: &TelemetryEvent) -> Classification {
        let reading = event.reading();
        if reading > self.physical_ceiling {
            Classification::Invalid
        } else if reading > self.vibration_threshold {
            Classification::Anomalous
        } else {
            Classification::Normal
        }
    }
}
