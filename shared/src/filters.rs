//! Declarative filter evaluation over a [`crate::model::Listing`].
//!
//! `FilterDoc` is the typed form of the wire-level filter document. Unknown
//! keys are tolerated: since we deserialize into a concrete struct with
//! `#[serde(default)]` on every field, `serde_json` silently ignores JSON
//! object keys that don't map to a known field.

use serde::{Deserialize, Serialize};

use crate::model::Listing;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternListFilter {
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub seeds: Option<Vec<i64>>,
}

/// The declarative filter document attached to a [`crate::model::MonitoringTask`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterDoc {
    #[serde(default)]
    pub max_price: Option<i64>,
    #[serde(default)]
    pub min_price: Option<i64>,
    #[serde(default)]
    pub wear_max: Option<f64>,
    #[serde(default)]
    pub wear_min: Option<f64>,
    #[serde(default)]
    pub pattern_list: Option<PatternListFilter>,
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub stickers_all: Option<Vec<String>>,
}

impl FilterDoc {
    /// Parses a filter document from its stored JSON text form.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the filter document to its stored JSON text form.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Evaluates every configured predicate against a listing. A listing
    /// matches iff every predicate that is present in the document holds;
    /// absent predicates impose no constraint.
    pub fn matches(&self, listing: &Listing) -> bool {
        if let Some(max_price) = self.max_price {
            if listing.price_cents > max_price {
                return false;
            }
        }

        if let Some(min_price) = self.min_price {
            if listing.price_cents < min_price {
                return false;
            }
        }

        if let Some(wear_max) = self.wear_max {
            match listing.wear {
                Some(wear) if wear <= wear_max => {}
                _ => return false,
            }
        }

        if let Some(wear_min) = self.wear_min {
            match listing.wear {
                Some(wear) if wear >= wear_min => {}
                _ => return false,
            }
        }

        if let Some(pattern_list) = &self.pattern_list {
            if let Some(seeds) = &pattern_list.seeds {
                match listing.pattern_seed {
                    Some(seed) if seeds.contains(&seed) => {}
                    _ => return false,
                }
            }
        }

        if let Some(name_contains) = &self.name_contains {
            let needle = name_contains.to_ascii_lowercase();
            if !listing.item_name.to_ascii_lowercase().contains(&needle) {
                return false;
            }
        }

        if let Some(stickers_all) = &self.stickers_all {
            let present = listing.stickers.as_deref().unwrap_or(&[]);
            if !stickers_all.iter().all(|wanted| present.contains(wanted)) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Listing {
        Listing {
            listing_id: Some("L1".to_string()),
            item_name: "AK-47 | Redline (Field-Tested)".to_string(),
            price_cents: 1500,
            wear: Some(0.24999),
            pattern_seed: Some(661),
            stickers: Some(vec!["Katowice 2014".to_string()]),
            seller_opaque_id: Some("s1".to_string()),
            raw: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(FilterDoc::default().matches(&listing()));
    }

    #[test]
    fn max_price_rejects_over_budget() {
        let filter = FilterDoc {
            max_price: Some(1000),
            ..Default::default()
        };
        assert!(!filter.matches(&listing()));
    }

    #[test]
    fn max_price_accepts_within_budget() {
        let filter = FilterDoc {
            max_price: Some(2000),
            ..Default::default()
        };
        assert!(filter.matches(&listing()));
    }

    #[test]
    fn wear_bounds_are_inclusive() {
        let filter = FilterDoc {
            wear_min: Some(0.24999),
            wear_max: Some(0.25),
            ..Default::default()
        };
        assert!(filter.matches(&listing()));
    }

    #[test]
    fn pattern_seed_must_be_in_set() {
        let filter = FilterDoc {
            pattern_list: Some(PatternListFilter {
                item_type: Some("doppler".to_string()),
                seeds: Some(vec![1, 2, 3]),
            }),
            ..Default::default()
        };
        assert!(!filter.matches(&listing()));
    }

    #[test]
    fn name_contains_is_case_insensitive() {
        let filter = FilterDoc {
            name_contains: Some("redline".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&listing()));
    }

    #[test]
    fn stickers_all_requires_every_sticker_present() {
        let filter = FilterDoc {
            stickers_all: Some(vec!["Katowice 2014".to_string(), "iBUYPOWER".to_string()]),
            ..Default::default()
        };
        assert!(!filter.matches(&listing()));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let doc: FilterDoc =
            serde_json::from_str(r#"{"max_price": 500, "some_future_key": true}"#).unwrap();
        assert_eq!(doc.max_price, Some(500));
    }
}
