//! Kernel Configuration

use serde::Deserialize;

use crate::error::KernelError;

/// Default upper bound on updates processed by one drain.
pub const DEFAULT_MAX_DRAIN: usize = 1_000_000;

/// Settings for one kernel instance.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust,ignore
/// let config = KernelConfig::from_json(r#"{ "name": "checkout" }"#)?;
/// let kernel = Kernel::with_config(config);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Label attached to the kernel's tracing spans.
    pub name: String,

    /// Maximum number of updates a single drain may process before it is
    /// aborted with [`KernelError::DrainLimit`]. `None` disables the guard.
    pub max_drain: Option<usize>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "kernel".to_string(),
            max_drain: Some(DEFAULT_MAX_DRAIN),
        }
    }
}

impl KernelConfig {
    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        Ok(serde_json::from_str(json)?)
    }
}
