//! The preset catalog.
//!
//! Presets are server templates. A preset may inherit another preset's
//! configuration text; resolution flattens the chain parent-first so a child
//! can override what it inherits. Cycles are rejected at config load.

use crate::config::PresetBlock;
use crate::error::SpawnError;
use std::collections::HashMap;

/// A fully flattened preset, ready to be written to a child's config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPreset {
    pub name: String,
    pub config: String,
    pub is_virtual: bool,
}

#[derive(Debug, Default)]
pub struct PresetCatalog {
    presets: HashMap<String, PresetBlock>,
    default: Option<String>,
}

impl PresetCatalog {
    /// Build a catalog from validated config blocks.
    pub fn new(blocks: &[PresetBlock]) -> Self {
        let default = blocks.iter().find(|p| p.default).map(|p| p.name.clone());
        Self {
            presets: blocks
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            default,
        }
    }

    /// Resolve a preset by name, or the default preset when `name` is empty.
    ///
    /// `virtual_allowed` lets internal callers (matchmaking, spaces) use
    /// presets users cannot instantiate directly.
    pub fn resolve(&self, name: &str, virtual_allowed: bool) -> Result<ResolvedPreset, SpawnError> {
        let name = if name.is_empty() {
            self.default.as_deref().ok_or(SpawnError::NoDefaultPreset)?
        } else {
            name
        };

        let preset = self
            .presets
            .get(name)
            .ok_or_else(|| SpawnError::UnknownPreset(name.to_string()))?;
        if preset.is_virtual && !virtual_allowed {
            return Err(SpawnError::VirtualPreset(name.to_string()));
        }

        // Collect the chain root-first; validation already rejected cycles.
        let mut chain = vec![preset];
        while let Some(parent) = chain
            .last()
            .and_then(|p| p.inherit.as_ref())
            .and_then(|name| self.presets.get(name))
        {
            chain.push(parent);
        }

        let mut config = String::new();
        for preset in chain.iter().rev() {
            if !preset.config.is_empty() {
                config.push_str(&preset.config);
                if !preset.config.ends_with('\n') {
                    config.push('\n');
                }
            }
        }

        Ok(ResolvedPreset {
            name: name.to_string(),
            config,
            is_virtual: preset.is_virtual,
        })
    }

    /// Whether a preset with this exact name exists and is user-visible.
    pub fn find(&self, name: &str) -> Option<ResolvedPreset> {
        self.resolve(name, false).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str, config: &str, inherit: Option<&str>) -> PresetBlock {
        PresetBlock {
            name: name.into(),
            is_virtual: false,
            config: config.into(),
            inherit: inherit.map(Into::into),
            default: false,
        }
    }

    #[test]
    fn inheritance_flattens_parent_first() {
        let catalog = PresetCatalog::new(&[
            block("base", "maxclients 16", None),
            block("insta", "mode insta", Some("base")),
        ]);
        let resolved = catalog.resolve("insta", false).unwrap();
        assert_eq!(resolved.config, "maxclients 16\nmode insta\n");
    }

    #[test]
    fn empty_name_uses_default() {
        let mut blocks = vec![block("ffa", "mode ffa", None)];
        blocks[0].default = true;
        let catalog = PresetCatalog::new(&blocks);
        assert_eq!(catalog.resolve("", false).unwrap().name, "ffa");
    }

    #[test]
    fn empty_name_without_default_fails() {
        let catalog = PresetCatalog::new(&[block("ffa", "", None)]);
        assert!(matches!(
            catalog.resolve("", false),
            Err(SpawnError::NoDefaultPreset)
        ));
    }

    #[test]
    fn virtual_presets_need_permission() {
        let mut blocks = vec![block("duel", "mode insta", None)];
        blocks[0].is_virtual = true;
        let catalog = PresetCatalog::new(&blocks);
        assert!(matches!(
            catalog.resolve("duel", false),
            Err(SpawnError::VirtualPreset(_))
        ));
        assert!(catalog.resolve("duel", true).is_ok());
    }

    #[test]
    fn unknown_preset_fails() {
        let catalog = PresetCatalog::new(&[]);
        assert!(matches!(
            catalog.resolve("nope", false),
            Err(SpawnError::UnknownPreset(_))
        ));
    }
}
