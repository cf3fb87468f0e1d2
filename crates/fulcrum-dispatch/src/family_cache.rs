//! Mapping `familyId -> { variantId -> set<serverId> }`, maintained per
//! proxy and registry node. Updated by `family.advertise` bus messages and,
//! at boot, by a reconciliation pass over the registry; both paths call
//! [`FamilyCache::apply_advertise`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use fulcrum_common::messages::FamilyAdvertise;
use fulcrum_common::model::SlotFamilyDescriptor;

type VariantMap = HashMap<Option<String>, HashSet<String>>;

#[derive(Default)]
pub struct FamilyCache {
    families: DashMap<String, ArcSwap<VariantMap>>,
    advertised_by_server: DashMap<String, HashSet<String>>,
}

impl FamilyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_advertise(&self, advertise: &FamilyAdvertise) {
        let server_id = &advertise.server_id;
        let mut by_family: HashMap<&str, Vec<&SlotFamilyDescriptor>> = HashMap::new();
        for descriptor in &advertise.descriptors {
            by_family.entry(descriptor.family_id.as_str()).or_default().push(descriptor);
        }
        let new_families: HashSet<String> = by_family.keys().map(|k| k.to_string()).collect();

        if let Some(prev) = self.advertised_by_server.get(server_id.as_str()) {
            for family_id in prev.iter() {
                if !new_families.contains(family_id) {
                    self.remove_server(family_id, server_id);
                }
            }
        }

        for (family_id, descriptors) in by_family {
            self.upsert(family_id, server_id, &descriptors);
        }
        self.advertised_by_server.insert(server_id.clone(), new_families);
    }

    fn upsert(&self, family_id: &str, server_id: &str, descriptors: &[&SlotFamilyDescriptor]) {
        let entry = self
            .families
            .entry(family_id.to_string())
            .or_insert_with(|| ArcSwap::from_pointee(VariantMap::new()));
        let mut map = (**entry.load()).clone();
        for descriptor in descriptors {
            map.entry(descriptor.variant_id.clone())
                .or_default()
                .insert(server_id.to_string());
        }
        entry.store(Arc::new(map));
    }

    fn remove_server(&self, family_id: &str, server_id: &str) {
        if let Some(entry) = self.families.get(family_id) {
            let mut map = (**entry.load()).clone();
            for set in map.values_mut() {
                set.remove(server_id);
            }
            entry.store(Arc::new(map));
        }
    }

    /// Candidate server ids for `family_id`/`variant_id`. `None` if the
    /// family is entirely unknown; `Some(empty)` if known but no backend
    /// currently advertises the requested variant.
    pub fn candidates(&self, family_id: &str, variant_id: Option<&str>) -> Option<HashSet<String>> {
        let entry = self.families.get(family_id)?;
        let map = entry.load();
        match variant_id {
            Some(variant) => Some(map.get(&Some(variant.to_string())).cloned().unwrap_or_default()),
            None => Some(map.values().flatten().cloned().collect()),
        }
    }

    /// Whether `family_id` has any backend advertising a non-`None` variant
    /// at all, used to decide between `NoBackendForFamily` and
    /// `NoBackendForVariant` when the caller asked for an unadvertised
    /// variant.
    pub fn has_explicit_variants(&self, family_id: &str) -> bool {
        self.families
            .get(family_id)
            .map(|entry| entry.load().keys().any(|v| v.is_some()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn descriptor(family: &str, variant: Option<&str>) -> SlotFamilyDescriptor {
        SlotFamilyDescriptor {
            family_id: family.to_string(),
            variant_id: variant.map(str::to_string),
            min_players: 2,
            max_players: 16,
            player_equivalent_factor: 10,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn advertise_then_candidates_roundtrips() {
        let cache = FamilyCache::new();
        cache.apply_advertise(&FamilyAdvertise {
            server_id: "game-1".into(),
            descriptors: vec![descriptor("bedwars", Some("four_four"))],
        });
        let candidates = cache.candidates("bedwars", Some("four_four")).unwrap();
        assert!(candidates.contains("game-1"));
        assert!(cache.candidates("skywars", None).is_none());
    }

    #[test]
    fn re_advertise_drops_stale_family_membership() {
        let cache = FamilyCache::new();
        cache.apply_advertise(&FamilyAdvertise {
            server_id: "game-1".into(),
            descriptors: vec![descriptor("bedwars", Some("four_four"))],
        });
        cache.apply_advertise(&FamilyAdvertise {
            server_id: "game-1".into(),
            descriptors: vec![descriptor("skywars", None)],
        });
        assert!(!cache.candidates("bedwars", Some("four_four")).unwrap().contains("game-1"));
        assert!(cache.candidates("skywars", None).unwrap().contains("game-1"));
    }

    #[test]
    fn no_variant_request_unions_all_variants() {
        let cache = FamilyCache::new();
        cache.apply_advertise(&FamilyAdvertise {
            server_id: "game-1".into(),
            descriptors: vec![descriptor("bedwars", Some("four_four"))],
        });
        cache.apply_advertise(&FamilyAdvertise {
            server_id: "game-2".into(),
            descriptors: vec![descriptor("bedwars", Some("eight_two"))],
        });
        let union = cache.candidates("bedwars", None).unwrap();
        assert_eq!(union.len(), 2);
    }
}
