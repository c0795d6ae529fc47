//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Family tree integrity: unique ids, known parents, no cycles
//! - Value ranges: caps, weights, liveness window vs heartbeat
//! - Key material parses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: LinkConfig → Result<(), Vec<ValidationError>>

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::schema::LinkConfig;
use crate::packet::signing::{decode_verifying_key, LinkKey};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &LinkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_link(config, &mut errors);
    validate_scaling(config, &mut errors);
    validate_families(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_link(config: &LinkConfig, errors: &mut Vec<ValidationError>) {
    let link = &config.link;
    if link.channel.trim().is_empty() {
        errors.push(ValidationError::new("link.channel", "must not be empty"));
    }
    if link.heartbeat_interval_secs == 0 {
        errors.push(ValidationError::new("link.heartbeat_interval_secs", "must be greater than 0"));
    }
    if link.liveness_timeout_secs <= link.heartbeat_interval_secs {
        errors.push(ValidationError::new(
            "link.liveness_timeout_secs",
            "must be longer than the heartbeat interval",
        ));
    }
    if link.sweep_interval_ms == 0 {
        errors.push(ValidationError::new("link.sweep_interval_ms", "must be greater than 0"));
    }
    if let Some(seed) = &link.private_key {
        if LinkKey::from_base64(seed).is_err() {
            errors.push(ValidationError::new("link.private_key", "is not a base64 32 byte seed"));
        }
    }
    for (i, key) in link.trusted_keys.iter().enumerate() {
        if let Err(e) = decode_verifying_key(key) {
            errors.push(ValidationError::new(format!("link.trusted_keys[{}]", i), e.to_string()));
        }
    }
    if config.transport.queue_capacity == 0 {
        errors.push(ValidationError::new("transport.queue_capacity", "must be greater than 0"));
    }
    if config.cache.capacity == 0 {
        errors.push(ValidationError::new("cache.capacity", "must be greater than 0"));
    }
}

fn validate_scaling(config: &LinkConfig, errors: &mut Vec<ValidationError>) {
    let scaling = &config.scaling;
    if scaling.interval_secs == Some(0) {
        errors.push(ValidationError::new("scaling.interval_secs", "must be greater than 0"));
    }
    if scaling.consecutive_intervals == 0 {
        errors.push(ValidationError::new("scaling.consecutive_intervals", "must be at least 1"));
    }
    if scaling.scale_down_ratio < 0.0 || scaling.scale_down_ratio >= scaling.scale_up_ratio {
        errors.push(ValidationError::new(
            "scaling.scale_down_ratio",
            "must be non-negative and below scale_up_ratio",
        ));
    }
}

fn validate_families(config: &LinkConfig, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    let mut parents: HashMap<&str, Option<&str>> = HashMap::new();

    for family in &config.families {
        let path = format!("families.{}", family.id);
        if family.id.trim().is_empty() {
            errors.push(ValidationError::new("families.id", "must not be empty"));
            continue;
        }
        if !seen.insert(family.id.as_str()) {
            errors.push(ValidationError::new(&path, "duplicate family id"));
        }
        parents.insert(family.id.as_str(), family.parent.as_deref());

        let lb = &family.load_balancer;
        if lb.weight == 0 {
            errors.push(ValidationError::new(format!("{}.load_balancer.weight", path), "must be greater than 0"));
        }
        if lb.hard_cap == 0 {
            errors.push(ValidationError::new(format!("{}.load_balancer.hard_cap", path), "must be greater than 0"));
        }
        if lb.soft_cap > lb.hard_cap {
            errors.push(ValidationError::new(
                format!("{}.load_balancer.soft_cap", path),
                "must not exceed hard_cap",
            ));
        }
        if family.parent.is_some() {
            if family.whitelist.is_some() {
                errors.push(ValidationError::new(
                    format!("{}.whitelist", path),
                    "only root families may carry a whitelist",
                ));
            }
            if family.catch_disconnecting_players {
                errors.push(ValidationError::new(
                    format!("{}.catch_disconnecting_players", path),
                    "only root families may catch disconnecting players",
                ));
            }
        }
    }

    for family in &config.families {
        if let Some(parent) = family.parent.as_deref() {
            if !parents.contains_key(parent) {
                errors.push(ValidationError::new(
                    format!("families.{}.parent", family.id),
                    format!("unknown parent family `{}`", parent),
                ));
            }
        }
    }

    // Walk each chain; a chain longer than the family count must loop.
    for family in &config.families {
        let mut current = family.parent.as_deref();
        let mut steps = 0;
        while let Some(id) = current {
            if id == family.id || steps > parents.len() {
                errors.push(ValidationError::new(
                    format!("families.{}.parent", family.id),
                    "parent chain forms a cycle",
                ));
                break;
            }
            current = parents.get(id).copied().flatten();
            steps += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{FamilyConfig, WhitelistConfig};

    fn with_families(families: Vec<FamilyConfig>) -> LinkConfig {
        LinkConfig {
            families,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&LinkConfig::default()).is_ok());
        let config = with_families(vec![
            FamilyConfig::new("lobby").with_caps(2, 3),
            FamilyConfig::new("bedwars").with_parent("lobby"),
        ]);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_reports_all_errors() {
        let mut bad = FamilyConfig::new("lobby").with_caps(5, 3);
        bad.load_balancer.weight = 0;
        let config = with_families(vec![
            bad,
            FamilyConfig::new("lobby"),
            FamilyConfig::new("orphan").with_parent("missing"),
        ]);
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"families.lobby.load_balancer.soft_cap"));
        assert!(fields.contains(&"families.lobby.load_balancer.weight"));
        assert!(fields.contains(&"families.lobby"));
        assert!(fields.contains(&"families.orphan.parent"));
    }

    #[test]
    fn test_parent_cycle() {
        let config = with_families(vec![
            FamilyConfig::new("a").with_parent("b"),
            FamilyConfig::new("b").with_parent("a"),
        ]);
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("cycle")));
    }

    #[test]
    fn test_root_only_features() {
        let mut child = FamilyConfig::new("child").with_parent("root");
        child.whitelist = Some(WhitelistConfig::default());
        child.catch_disconnecting_players = true;
        let config = with_families(vec![FamilyConfig::new("root"), child]);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_liveness_window_and_keys() {
        let mut config = LinkConfig::default();
        config.link.liveness_timeout_secs = config.link.heartbeat_interval_secs;
        config.link.private_key = Some("short".into());
        config.link.trusted_keys = vec!["???".into()];
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["link.liveness_timeout_secs", "link.private_key", "link.trusted_keys[0]"]
        );
    }
}
