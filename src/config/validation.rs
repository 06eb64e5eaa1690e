//! Configuration validation.

use crate::config::Config;
use std::collections::HashSet;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate the configuration.
///
/// Every problem found is collected; the error message joins them with `"; "`.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.frontends.is_empty() {
        errors.push("at least one frontend must be defined".to_string());
    }
    if config.pools.is_empty() {
        errors.push("at least one pool must be defined".to_string());
    }

    let mut pool_names = HashSet::new();
    for pool in &config.pools {
        if pool.name.is_empty() {
            errors.push("pool name cannot be empty".to_string());
        }
        if !pool_names.insert(pool.name.as_str()) {
            errors.push(format!("duplicate pool name: {}", pool.name));
        }
        if pool.protocol.is_empty() {
            errors.push(format!("pool '{}' has an empty protocol", pool.name));
        }
        if pool.servers.is_empty() {
            errors.push(format!("pool '{}' must have at least one server", pool.name));
        }

        let mut servers = HashSet::new();
        for server in &pool.servers {
            if !servers.insert(server.as_str()) {
                errors.push(format!(
                    "duplicate server {} in pool '{}'",
                    server, pool.name
                ));
            }
        }
    }

    let mut frontend_names = HashSet::new();
    let mut listen_addresses = HashSet::new();
    for frontend in &config.frontends {
        if frontend.name.is_empty() {
            errors.push("frontend name cannot be empty".to_string());
        }
        if !frontend_names.insert(frontend.name.as_str()) {
            errors.push(format!("duplicate frontend name: {}", frontend.name));
        }
        if !listen_addresses.insert(frontend.listen) {
            errors.push(format!(
                "duplicate listen address: {} (frontend: {})",
                frontend.listen, frontend.name
            ));
        }
        if !pool_names.contains(frontend.pool.as_str()) {
            errors.push(format!(
                "frontend '{}' references non-existent pool '{}'",
                frontend.name, frontend.pool
            ));
        }
    }

    let weight = config.balancing.backup_session_weight;
    if !(0.0..=1.0).contains(&weight) {
        errors.push(format!(
            "backup_session_weight {weight} must be between 0 and 1"
        ));
    }

    let detection = &config.fault_detection;
    if detection.probe.timeout.is_zero() {
        errors.push("probe timeout must be greater than zero".to_string());
    }
    if detection.heartbeat.timeout <= detection.heartbeat.frequency {
        errors.push(format!(
            "heartbeat timeout ({:?}) must be greater than its frequency ({:?})",
            detection.heartbeat.timeout, detection.heartbeat.frequency
        ));
    }

    if !LOG_LEVELS.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            LOG_LEVELS.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use std::time::Duration;

    fn minimal_config() -> Config {
        Config {
            global: GlobalConfig::default(),
            balancing: BalancingConfig::default(),
            fault_detection: FaultDetectionConfig::default(),
            frontends: vec![FrontendConfig {
                name: "rtsp".to_string(),
                listen: "127.0.0.1:8554".parse().unwrap(),
                pool: "media".to_string(),
                connect_timeout: Duration::from_secs(10),
            }],
            pools: vec![PoolConfig {
                name: "media".to_string(),
                protocol: "rtsp".to_string(),
                servers: vec!["127.0.0.1:9001".to_string(), "127.0.0.1:9002".to_string()],
            }],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_no_frontends_or_pools() {
        let mut config = minimal_config();
        config.frontends.clear();
        config.pools.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("at least one frontend"));
        assert!(err.contains("at least one pool"));
    }

    #[test]
    fn test_missing_pool_reference() {
        let mut config = minimal_config();
        config.frontends[0].pool = "nonexistent".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("non-existent pool 'nonexistent'"));
    }

    #[test]
    fn test_duplicate_frontend_names() {
        let mut config = minimal_config();
        let mut second = config.frontends[0].clone();
        second.listen = "127.0.0.1:8555".parse().unwrap();
        config.frontends.push(second);
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("duplicate frontend name"));
    }

    #[test]
    fn test_duplicate_listen_address() {
        let mut config = minimal_config();
        let mut second = config.frontends[0].clone();
        second.name = "rtsp2".to_string();
        config.frontends.push(second);
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("duplicate listen address"));
    }

    #[test]
    fn test_duplicate_server_in_pool() {
        let mut config = minimal_config();
        config.pools[0].servers.push("127.0.0.1:9001".to_string());
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("duplicate server 127.0.0.1:9001"));
    }

    #[test]
    fn test_empty_pool() {
        let mut config = minimal_config();
        config.pools[0].servers.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("must have at least one server"));
    }

    #[test]
    fn test_backup_weight_out_of_range() {
        let mut config = minimal_config();
        config.balancing.backup_session_weight = 1.5;
        assert!(validate_config(&config).unwrap_err().contains("backup_session_weight"));

        config.balancing.backup_session_weight = 0.0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_frequency() {
        let mut config = minimal_config();
        config.fault_detection.heartbeat.timeout = Duration::from_millis(200);
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("heartbeat timeout"));
    }

    #[test]
    fn test_zero_probe_timeout() {
        let mut config = minimal_config();
        config.fault_detection.probe.timeout = Duration::ZERO;
        assert!(validate_config(&config).unwrap_err().contains("probe timeout"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = minimal_config();
        config.global.log_level = "loud".to_string();
        config.balancing.backup_session_weight = -0.1;
        let err = validate_config(&config).unwrap_err();
        assert_eq!(err.split("; ").count(), 2);
        assert!(err.contains("invalid log level 'loud'"));
    }
}
