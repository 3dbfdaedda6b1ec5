use crate::core::{Result, StoreError};

/// Default bound on the length of an encoded collection key.
pub const MAX_DBKEY_LENGTH: usize = 220;

/// Runtime configuration
///
/// Options that change how the engine treats durability, kind
/// redefinition and key sizes. Built with the usual builder methods:
///
/// ```
/// use vobjstore::RuntimeConfig;
///
/// let config = RuntimeConfig::new()
///     .allow_state_shape_changes(true)
///     .max_key_length(128);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Treat every non-promise reference as durable
    pub relax_durability_rules: bool,

    /// Accept a different state shape when a durable kind is redefined
    pub allow_state_shape_changes: bool,

    /// Encoded collection keys must be strictly shorter than this
    pub max_key_length: usize,

    /// Include the base ref in each instance's interface name
    pub label_instances: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            relax_durability_rules: false,
            allow_state_shape_changes: false,
            max_key_length: MAX_DBKEY_LENGTH,
            label_instances: false,
        }
    }

    pub fn relax_durability_rules(mut self, relax: bool) -> Self {
        self.relax_durability_rules = relax;
        self
    }

    pub fn allow_state_shape_changes(mut self, allow: bool) -> Self {
        self.allow_state_shape_changes = allow;
        self
    }

    pub fn max_key_length(mut self, max: usize) -> Self {
        self.max_key_length = max;
        self
    }

    pub fn label_instances(mut self, label: bool) -> Self {
        self.label_instances = label;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // the shortest encoded key is a one-character prefix
        if self.max_key_length < 2 {
            return Err(StoreError::Config(
                "max_key_length must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(!config.relax_durability_rules);
        assert!(!config.allow_state_shape_changes);
        assert_eq!(config.max_key_length, 220);
    }

    #[test]
    fn test_builder_pattern() {
        let config = RuntimeConfig::new()
            .relax_durability_rules(true)
            .label_instances(true)
            .max_key_length(64);

        assert!(config.relax_durability_rules);
        assert!(config.label_instances);
        assert_eq!(config.max_key_length, 64);
    }

    #[test]
    fn test_validate_rejects_tiny_keys() {
        assert!(RuntimeConfig::new().max_key_length(1).validate().is_err());
        assert!(RuntimeConfig::new().max_key_length(2).validate().is_ok());
    }
}
