//! Startup validation of the loaded configuration.
//!
//! Everything caught here is fatal; the process exits non-zero before any
//! socket is bound.

use super::types::ClusterConfig;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no ingress configured; enable desktop or web")]
    NoIngress,
    #[error("duplicate preset name '{0}'")]
    DuplicatePreset(String),
    #[error("preset '{0}' inherits unknown preset '{1}'")]
    UnknownInherit(String, String),
    #[error("preset inheritance cycle through '{0}'")]
    InheritanceCycle(String),
    #[error("more than one preset marked default")]
    MultipleDefaultPresets,
    #[error("duplicate server alias '{0}'")]
    DuplicateAlias(String),
    #[error("server '{0}' references unknown preset '{1}'")]
    UnknownServerPreset(String, String),
    #[error("duel format '{0}' references unknown preset '{1}'")]
    UnknownDuelPreset(String, String),
    #[error("more than one duel format marked default")]
    MultipleDefaultDuels,
    #[error("port range is empty ({0}..={1})")]
    EmptyPortRange(u16, u16),
}

pub fn validate(cluster: &ClusterConfig) -> Result<(), ValidationError> {
    if cluster.ingress.desktop.is_empty() && cluster.ingress.web.is_none() {
        return Err(ValidationError::NoIngress);
    }

    if cluster.spawn.min_port >= cluster.spawn.max_port {
        return Err(ValidationError::EmptyPortRange(
            cluster.spawn.min_port,
            cluster.spawn.max_port,
        ));
    }

    let mut presets: HashMap<&str, &Option<String>> = HashMap::new();
    let mut defaults = 0;
    for preset in &cluster.presets {
        if presets.insert(&preset.name, &preset.inherit).is_some() {
            return Err(ValidationError::DuplicatePreset(preset.name.clone()));
        }
        if preset.default {
            defaults += 1;
        }
    }
    if defaults > 1 {
        return Err(ValidationError::MultipleDefaultPresets);
    }

    // Walk every inheritance chain; a chain longer than the catalog loops.
    for preset in &cluster.presets {
        let mut seen = HashSet::new();
        let mut current = preset.name.as_str();
        seen.insert(current);
        while let Some(Some(parent)) = presets.get(current) {
            if !presets.contains_key(parent.as_str()) {
                return Err(ValidationError::UnknownInherit(
                    current.to_string(),
                    parent.clone(),
                ));
            }
            if !seen.insert(parent.as_str()) {
                return Err(ValidationError::InheritanceCycle(parent.clone()));
            }
            current = parent;
        }
    }

    let mut aliases = HashSet::new();
    for server in &cluster.servers {
        if !aliases.insert(server.alias.as_str()) {
            return Err(ValidationError::DuplicateAlias(server.alias.clone()));
        }
        if !presets.contains_key(server.preset.as_str()) {
            return Err(ValidationError::UnknownServerPreset(
                server.alias.clone(),
                server.preset.clone(),
            ));
        }
    }

    let mut duel_defaults = 0;
    for duel in &cluster.matchmaking.duel {
        if !presets.contains_key(duel.preset.as_str()) {
            return Err(ValidationError::UnknownDuelPreset(
                duel.name.clone(),
                duel.preset.clone(),
            ));
        }
        if duel.default {
            duel_defaults += 1;
        }
    }
    if duel_defaults > 1 {
        return Err(ValidationError::MultipleDefaultDuels);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Config;
    use super::*;

    fn parse(text: &str) -> ClusterConfig {
        toml::from_str::<Config>(text).expect("parse").cluster
    }

    #[test]
    fn minimal_web_only_config_passes() {
        let cluster = parse(
            r#"
            [cluster.ingress.web]
            port = 29999
            "#,
        );
        assert_eq!(validate(&cluster), Ok(()));
    }

    #[test]
    fn missing_ingress_is_fatal() {
        let cluster = parse("[cluster]\n");
        assert_eq!(validate(&cluster), Err(ValidationError::NoIngress));
    }

    #[test]
    fn inheritance_cycle_is_fatal() {
        let cluster = parse(
            r#"
            [cluster.ingress.web]
            port = 29999

            [[cluster.presets]]
            name = "a"
            inherit = "b"

            [[cluster.presets]]
            name = "b"
            inherit = "a"
            "#,
        );
        assert!(matches!(
            validate(&cluster),
            Err(ValidationError::InheritanceCycle(_))
        ));
    }

    #[test]
    fn duplicate_alias_is_fatal() {
        let cluster = parse(
            r#"
            [cluster.ingress.web]
            port = 29999

            [[cluster.presets]]
            name = "ffa"

            [[cluster.servers]]
            alias = "lobby"
            preset = "ffa"

            [[cluster.servers]]
            alias = "lobby"
            preset = "ffa"
            "#,
        );
        assert_eq!(
            validate(&cluster),
            Err(ValidationError::DuplicateAlias("lobby".into()))
        );
    }

    #[test]
    fn second_default_preset_is_fatal() {
        let cluster = parse(
            r#"
            [cluster.ingress.web]
            port = 29999

            [[cluster.presets]]
            name = "ffa"
            default = true

            [[cluster.presets]]
            name = "insta"
            default = true
            "#,
        );
        assert_eq!(
            validate(&cluster),
            Err(ValidationError::MultipleDefaultPresets)
        );
    }

    #[test]
    fn empty_port_range_is_fatal() {
        let cluster = parse(
            r#"
            [cluster.ingress.web]
            port = 29999

            [cluster.spawn]
            server_binary = "qserv"
            min_port = 51000
            max_port = 51000
            "#,
        );
        assert!(matches!(
            validate(&cluster),
            Err(ValidationError::EmptyPortRange(_, _))
        ));
    }
}
