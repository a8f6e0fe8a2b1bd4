// Strand Configuration

use serde::{Deserialize, Serialize};

use crate::error::{Fault, FaultResult, TraceFormat};

/// Runtime tuning knobs, every field is optional in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Initial value stack capacity of a fiber
    pub stack_capacity: usize,
    pub frames_capacity: usize,
    pub regions_capacity: usize,
    /// Calls nested deeper than this abort the fiber
    pub max_call_depth: usize,
    pub trace_format: TraceFormat,
    /// Task manager ticks only the first unfinished task
    pub sequential_tasks: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_capacity: 32,
            frames_capacity: 16,
            regions_capacity: 32,
            max_call_depth: 1024,
            trace_format: TraceFormat::Compact,
            sequential_tasks: false,
        }
    }
}

impl VmConfig {
    pub fn from_json(json: &str) -> FaultResult<Self> {
        serde_json::from_str(json).map_err(|e| Fault::Config(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = VmConfig::from_json(r#"{ "max_call_depth": 8, "trace_format": "verbose" }"#).unwrap();
        assert_eq!(config.max_call_depth, 8);
        assert_eq!(config.trace_format, TraceFormat::Verbose);
        assert_eq!(config.stack_capacity, 32);
        assert!(!config.sequential_tasks);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(VmConfig::from_json("{ nope"), Err(Fault::Config(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let config = VmConfig {
            sequential_tasks: true,
            ..VmConfig::default()
        };
        assert_eq!(VmConfig::from_json(&config.to_json()).unwrap(), config);
    }
}
