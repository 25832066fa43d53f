use crate::frame::DetectionResult;

/// Tracks the person-present boolean and notifies the caller when it
/// changes. Derived once per segmentation cycle, local or remote.
pub struct DetectionState {
    current: Option<bool>,
    callback: Option<Box<dyn FnMut(bool) + Send>>,
}

impl DetectionState {
    pub fn new() -> Self {
        Self {
            current: None,
            callback: None,
        }
    }

    pub fn with_callback(callback: Box<dyn FnMut(bool) + Send>) -> Self {
        Self {
            current: None,
            callback: Some(callback),
        }
    }

    /// Record a detection result; the callback fires only on a change.
    pub fn update(&mut self, result: &DetectionResult) {
        let detected = result.is_person_detected;
        if self.current == Some(detected) {
            return;
        }
        self.current = Some(detected);
        tracing::debug!(
            "person detection changed: {} ({:.2}%)",
            detected,
            result.percentage * 100.0
        );
        if let Some(callback) = &mut self.callback {
            callback(detected);
        }
    }

    /// Current person-present boolean; false until the first cycle lands.
    pub fn current(&self) -> bool {
        self.current.unwrap_or(false)
    }
}

impl Default for DetectionState {
    fn default() -> Self {
        Self::new()
    }
}
