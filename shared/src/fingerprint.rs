//! Stable listing fingerprinting for de-duplication.
//!
//! A fingerprint identifies "the same listing" for a given task across
//! repeated checks. It is a `blake3` hash over the task id and the parts of
//! the listing that make it a distinct sale offer. Floats are bucketed to
//! four decimal places before hashing so that upstream float formatting
//! jitter (e.g. `0.25` vs `0.250000001`) does not mint spurious duplicates.

use crate::model::Listing;

/// Buckets a wear value to four decimal places, matching Steam Market's own
/// float-wear display precision.
fn bucket_wear(wear: f64) -> i64 {
    (wear * 10_000.0).round() as i64
}

/// Computes the stable fingerprint for `listing` under `task_id`.
///
/// Identity is, in priority order: the upstream `listing_id` if the fetcher
/// supplied one, otherwise the tuple of item name, bucketed wear, pattern
/// seed, and seller opaque id — whatever the upstream page actually exposes
/// for a given listing.
pub fn fingerprint(task_id: i64, listing: &Listing) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&task_id.to_le_bytes());

    match &listing.listing_id {
        Some(id) => {
            hasher.update(b"listing_id");
            hasher.update(id.as_bytes());
        }
        None => {
            hasher.update(b"identity");
            hasher.update(listing.item_name.as_bytes());
            hasher.update(&listing.price_cents.to_le_bytes());
            if let Some(wear) = listing.wear {
                hasher.update(&bucket_wear(wear).to_le_bytes());
            }
            if let Some(seed) = listing.pattern_seed {
                hasher.update(&seed.to_le_bytes());
            }
            if let Some(seller) = &listing.seller_opaque_id {
                hasher.update(seller.as_bytes());
            }
        }
    }

    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(item_name: &str, wear: Option<f64>) -> Listing {
        Listing {
            listing_id: None,
            item_name: item_name.to_string(),
            price_cents: 1000,
            wear,
            pattern_seed: Some(42),
            stickers: None,
            seller_opaque_id: Some("seller-1".to_string()),
            raw: None,
        }
    }

    #[test]
    fn same_listing_same_task_same_fingerprint() {
        let l = listing("AK-47 | Redline", Some(0.25));
        assert_eq!(fingerprint(1, &l), fingerprint(1, &l));
    }

    #[test]
    fn same_listing_different_task_different_fingerprint() {
        let l = listing("AK-47 | Redline", Some(0.25));
        assert_ne!(fingerprint(1, &l), fingerprint(2, &l));
    }

    #[test]
    fn wear_jitter_within_bucket_does_not_change_fingerprint() {
        let a = listing("AK-47 | Redline", Some(0.25000001));
        let b = listing("AK-47 | Redline", Some(0.24999999));
        assert_eq!(fingerprint(1, &a), fingerprint(1, &b));
    }

    #[test]
    fn wear_change_across_bucket_changes_fingerprint() {
        let a = listing("AK-47 | Redline", Some(0.2501));
        let b = listing("AK-47 | Redline", Some(0.2502));
        assert_ne!(fingerprint(1, &a), fingerprint(1, &b));
    }

    #[test]
    fn upstream_listing_id_takes_priority_over_derived_identity() {
        let mut a = listing("AK-47 | Redline", Some(0.25));
        let mut b = listing("AK-47 | Redline", Some(0.99));
        a.listing_id = Some("shared-id".to_string());
        b.listing_id = Some("shared-id".to_string());
        assert_eq!(fingerprint(1, &a), fingerprint(1, &b));
    }
}
