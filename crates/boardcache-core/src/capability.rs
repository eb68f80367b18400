//! Capability tiers and the relations each one requires
//!
//! This is the single place that knows which tables a tier needs. Tiers are
//! ordered by richness but their relation sets are not nested: `geometry`
//! needs hold tables that `logbook` does not, and vice versa.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Named level of schema completeness a database must reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    /// Board layouts and their background images
    Layouts,
    /// Public climb catalog
    Catalog,
    /// Climbs with hole and placement geometry (rendering)
    Geometry,
    /// Per-user ascents and attempts
    Logbook,
}

impl CapabilityTier {
    pub const ALL: [CapabilityTier; 4] = [
        CapabilityTier::Layouts,
        CapabilityTier::Catalog,
        CapabilityTier::Geometry,
        CapabilityTier::Logbook,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityTier::Layouts => "layouts",
            CapabilityTier::Catalog => "catalog",
            CapabilityTier::Geometry => "geometry",
            CapabilityTier::Logbook => "logbook",
        }
    }

    /// Relations that must exist for this tier to be served
    pub fn required_relations(self) -> &'static [&'static str] {
        match self {
            CapabilityTier::Layouts => &["layouts", "product_sizes_layouts_sets"],
            CapabilityTier::Catalog => &["climbs", "product_sizes_layouts_sets"],
            CapabilityTier::Geometry => &[
                "climbs",
                "holes",
                "placements",
                "product_sizes_layouts_sets",
            ],
            CapabilityTier::Logbook => &["climbs", "ascents", "bids"],
        }
    }

    /// Tier whose database content depends on who authenticated
    pub fn is_per_user(self) -> bool {
        matches!(self, CapabilityTier::Logbook)
    }

    /// Required relations absent from `present`, in declaration order
    pub fn missing_from(self, present: &BTreeSet<String>) -> Vec<&'static str> {
        self.required_relations()
            .iter()
            .copied()
            .filter(|name| !present.contains(*name))
            .collect()
    }

    pub fn is_satisfied_by(self, present: &BTreeSet<String>) -> bool {
        self.missing_from(present).is_empty()
    }
}

/// Required relation set for `tier`
pub fn required_relations(tier: CapabilityTier) -> BTreeSet<&'static str> {
    tier.required_relations().iter().copied().collect()
}

/// Every tier a database with `present` relations can serve
pub fn satisfied_tiers(present: &BTreeSet<String>) -> Vec<CapabilityTier> {
    CapabilityTier::ALL
        .into_iter()
        .filter(|tier| tier.is_satisfied_by(present))
        .collect()
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "layouts" => Ok(CapabilityTier::Layouts),
            "catalog" => Ok(CapabilityTier::Catalog),
            "geometry" => Ok(CapabilityTier::Geometry),
            "logbook" => Ok(CapabilityTier::Logbook),
            _ => Err(CoreError::InvalidTier {
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relations(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_every_tier_requires_something() {
        for tier in CapabilityTier::ALL {
            assert!(!required_relations(tier).is_empty(), "{tier} has no relations");
        }
    }

    #[test]
    fn test_tiers_are_not_nested() {
        let geometry = required_relations(CapabilityTier::Geometry);
        let logbook = required_relations(CapabilityTier::Logbook);
        assert!(!geometry.is_subset(&logbook));
        assert!(!logbook.is_subset(&geometry));
    }

    #[test]
    fn test_ordering_by_richness() {
        assert!(CapabilityTier::Layouts < CapabilityTier::Catalog);
        assert!(CapabilityTier::Catalog < CapabilityTier::Geometry);
        assert!(CapabilityTier::Geometry < CapabilityTier::Logbook);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(" Catalog ".parse::<CapabilityTier>().unwrap(), CapabilityTier::Catalog);
        assert_eq!("LOGBOOK".parse::<CapabilityTier>().unwrap(), CapabilityTier::Logbook);
    }

    #[test]
    fn test_parse_unknown_tier_fails() {
        let err = "images".parse::<CapabilityTier>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidTier { value } if value == "images"));
    }

    #[test]
    fn test_catalog_satisfied_by_minimal_build() {
        let present = relations(&["climbs", "product_sizes_layouts_sets"]);
        assert!(CapabilityTier::Catalog.is_satisfied_by(&present));
        assert_eq!(
            CapabilityTier::Logbook.missing_from(&present),
            vec!["ascents", "bids"]
        );
        assert_eq!(satisfied_tiers(&present), vec![CapabilityTier::Catalog]);
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&CapabilityTier::Geometry).unwrap();
        assert_eq!(json, "\"geometry\"");
    }
}
