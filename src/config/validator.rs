use crate::config::{parse_duration, CollectorConfig, SCHEMA_VERSION};
use crate::error::{CollectorError, Result, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem found
    pub fn validate(config: &CollectorConfig) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_source(config, &mut errors);
        Self::validate_flows(config, &mut errors);
        Self::validate_intervals(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CollectorError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &CollectorConfig, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_source(config: &CollectorConfig, errors: &mut Vec<ValidationError>) {
        if config.collector.source_id.is_empty() {
            errors.push(ValidationError::new(
                "collector.source_id",
                "Source id cannot be empty",
            ));
        }
    }

    fn validate_flows(config: &CollectorConfig, errors: &mut Vec<ValidationError>) {
        let flows = &config.flows;
        let durations = [
            ("flows.reconcile_min_interval", &flows.reconcile_min_interval),
            ("flows.reconcile_max_interval", &flows.reconcile_max_interval),
            ("flows.attribute_cache_ttl", &flows.attribute_cache_ttl),
            ("flows.purge_interval", &flows.purge_interval),
            ("flows.idle_timeout", &flows.idle_timeout),
            ("flows.flow_source_interval", &flows.flow_source_interval),
        ];
        for (path, value) in durations {
            Self::check_duration(path, value, errors);
        }

        // Not a timer period, zero registers sources on the next tick
        if parse_duration(&flows.flow_source_grace).is_err() {
            errors.push(ValidationError::new(
                "flows.flow_source_grace",
                format!("Invalid duration format: {}", flows.flow_source_grace),
            ));
        }

        if let (Ok(min), Ok(max)) = (
            parse_duration(&flows.reconcile_min_interval),
            parse_duration(&flows.reconcile_max_interval),
        ) {
            if min > max {
                errors.push(ValidationError::new(
                    "flows.reconcile_min_interval",
                    format!(
                        "Minimum reconcile interval {:?} exceeds maximum {:?}",
                        min, max
                    ),
                ));
            }
        }
    }

    fn validate_intervals(config: &CollectorConfig, errors: &mut Vec<ValidationError>) {
        Self::check_duration("pairs.rescan_interval", &config.pairs.rescan_interval, errors);
        Self::check_duration(
            "processes.rebuild_interval",
            &config.processes.rebuild_interval,
            errors,
        );
        Self::check_duration(
            "records.cleanup_interval",
            &config.records.cleanup_interval,
            errors,
        );
    }

    /// Durations must parse and be non-zero since they drive timers
    fn check_duration(path: &str, value: &str, errors: &mut Vec<ValidationError>) {
        match parse_duration(value) {
            Ok(d) if d.is_zero() => {
                errors.push(ValidationError::new(path, "Duration must be greater than 0"));
            }
            Ok(_) => {}
            Err(_) => {
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid duration format: {}", value),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = CollectorConfig::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = CollectorConfig::default();
        config.flows.idle_timeout = "forever".to_string();
        config.pairs.rescan_interval = "0s".to_string();
        config.collector.source_id = String::new();

        match ConfigValidator::validate(&config) {
            Err(CollectorError::ConfigValidation { errors }) => {
                let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
                assert_eq!(errors.len(), 3);
                assert!(paths.contains(&"flows.idle_timeout"));
                assert!(paths.contains(&"pairs.rescan_interval"));
                assert!(paths.contains(&"collector.source_id"));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_min_above_max() {
        let mut config = CollectorConfig::default();
        config.flows.reconcile_min_interval = "10s".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_zero_grace_allowed() {
        let mut config = CollectorConfig::default();
        config.flows.flow_source_grace = "0s".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());

        config.flows.flow_source_grace = "later".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_unsupported_schema() {
        let mut config = CollectorConfig::default();
        config.meta.schema_version = "0.9".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
