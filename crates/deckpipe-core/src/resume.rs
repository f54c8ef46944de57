use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Mutex;

pub type ResumeError = Box<dyn StdError + Send + Sync>;

/// Durable last-seen event marker, one per run id.
pub trait ResumeStore: Send + Sync {
    fn load(&self, run_id: &str) -> Result<Option<String>, ResumeError>;
    fn save(&self, run_id: &str, event_id: &str) -> Result<(), ResumeError>;
    fn clear(&self, run_id: &str) -> Result<(), ResumeError>;
}

#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    markers: Mutex<HashMap<String, String>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for MemoryResumeStore {
    fn load(&self, run_id: &str) -> Result<Option<String>, ResumeError> {
        let markers = self.markers.lock().map_err(|err| err.to_string())?;
        Ok(markers.get(run_id).cloned())
    }

    fn save(&self, run_id: &str, event_id: &str) -> Result<(), ResumeError> {
        let mut markers = self.markers.lock().map_err(|err| err.to_string())?;
        markers.insert(run_id.to_string(), event_id.to_string());
        Ok(())
    }

    fn clear(&self, run_id: &str) -> Result<(), ResumeError> {
        let mut markers = self.markers.lock().map_err(|err| err.to_string())?;
        markers.remove(run_id);
        Ok(())
    }
}
