//! VM configuration.

use serde::{Deserialize, Serialize};

use qvm_error::{Result, VdbeError};

/// Tunables shared by every program built from a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdbeConfig {
    /// Check every register, cursor and jump operand against the declared
    /// sizes when a program is made ready. On by default in debug builds.
    pub validate_operands: bool,
    /// Halt with `Interrupt` once this many instructions have executed.
    pub max_steps: Option<u64>,
    /// Log every executed instruction at trace level.
    pub trace_ops: bool,
    /// Highest parameter index accepted by `bind`.
    pub max_variables: u16,
}

impl Default for VdbeConfig {
    fn default() -> Self {
        Self {
            validate_operands: cfg!(debug_assertions),
            max_steps: None,
            trace_ops: false,
            max_variables: 999,
        }
    }
}

impl VdbeConfig {
    /// Parse a JSON object; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VdbeError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VdbeError::Config(e.to_string()))
    }

    #[must_use]
    pub const fn with_validation(mut self, on: bool) -> Self {
        self.validate_operands = on;
        self
    }

    #[must_use]
    pub const fn with_max_steps(mut self, steps: Option<u64>) -> Self {
        self.max_steps = steps;
        self
    }

    #[must_use]
    pub const fn with_trace_ops(mut self, on: bool) -> Self {
        self.trace_ops = on;
        self
    }

    #[must_use]
    pub const fn with_max_variables(mut self, n: u16) -> Self {
        self.max_variables = n;
        self
    }
}
