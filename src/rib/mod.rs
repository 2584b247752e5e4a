mod attributes;
pub mod families;
pub mod path;

pub use attributes::PathAttributes;
pub use families::{Families, Family};
pub use path::{Path, PeerInfo};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use bgp_rs::Origin;
use log::debug;

/// Per-peer adjacency table: exactly what was last received from (IN) or
/// handed to (OUT) one neighbor, keyed per family in prefix order.
#[derive(Debug, Default)]
pub struct AdjRib {
    tables: HashMap<Family, BTreeMap<Vec<u8>, Path>>,
}

impl AdjRib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a path list: announcements insert/replace, withdrawals remove
    pub fn update(&mut self, paths: &[Path]) {
        for path in paths {
            let table = self.tables.entry(path.family).or_insert_with(BTreeMap::new);
            if path.is_withdraw {
                table.remove(&path.key());
            } else {
                table.insert(path.key(), path.clone());
            }
        }
    }

    pub fn clear(&mut self, family: Family) {
        if let Some(table) = self.tables.get_mut(&family) {
            table.clear();
        }
    }

    pub fn paths(&self, family: Family) -> Vec<Path> {
        self.tables
            .get(&family)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_else(Vec::new)
    }

    pub fn all_paths(&self) -> Vec<Path> {
        self.tables
            .values()
            .flat_map(|table| table.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every path known for one destination prefix
#[derive(Debug, Default)]
struct Destination {
    known: Vec<Path>,
}

impl Destination {
    fn best(&self) -> Option<&Path> {
        self.known.iter().min_by(|a, b| compare_paths(a, b))
    }
}

fn origin_rank(origin: &Origin) -> u8 {
    match origin {
        Origin::IGP => 0,
        Origin::EGP => 1,
        Origin::INCOMPLETE => 2,
    }
}

/// Decision-process ordering: higher local-pref, then shorter AS path,
/// then lower origin, then the older path, with router-id as a final
/// deterministic tie-break.
fn compare_paths(a: &Path, b: &Path) -> Ordering {
    let a_pref = a.attributes.local_pref.unwrap_or(100);
    let b_pref = b.attributes.local_pref.unwrap_or(100);
    b_pref
        .cmp(&a_pref)
        .then_with(|| a.attributes.as_path_length().cmp(&b.attributes.as_path_length()))
        .then_with(|| origin_rank(&a.attributes.origin).cmp(&origin_rank(&b.attributes.origin)))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.source.router_id.cmp(&b.source.router_id))
}

fn same_path(a: &Path, b: &Path) -> bool {
    a.source.address == b.source.address && a.timestamp == b.timestamp
}

/// The shared decision-process table.
///
/// One instance backs the global pseudo-session; every route-server client
/// owns a private instance. Callers serialize access through a mutex, so
/// the methods here can stay plain `&mut self`.
#[derive(Debug, Default)]
pub struct Rib {
    tables: HashMap<Family, BTreeMap<Vec<u8>, Destination>>,
}

impl Rib {
    pub fn new(families: &Families) -> Self {
        let tables = families
            .iter()
            .map(|family| (*family, BTreeMap::new()))
            .collect();
        Self { tables }
    }

    pub fn families(&self) -> Vec<Family> {
        self.tables.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the incoming paths through the decision process, returning the
    /// best-path changes they caused (new bests, or withdrawals where a
    /// destination emptied out).
    pub fn process_paths(&mut self, paths: Vec<Path>) -> Vec<Path> {
        let mut changes: Vec<Path> = Vec::with_capacity(paths.len());
        for path in paths {
            let table = self.tables.entry(path.family).or_insert_with(BTreeMap::new);
            let key = path.key();
            let destination = table.entry(key.clone()).or_insert_with(Destination::default);
            let old_best = destination.best().cloned();

            destination
                .known
                .retain(|known| known.source.address != path.source.address);
            if !path.is_withdraw {
                destination.known.push(path);
            }

            match destination.best() {
                Some(best) => {
                    let changed = match &old_best {
                        Some(old) => !same_path(old, best),
                        None => true,
                    };
                    if changed {
                        changes.push(best.clone());
                    }
                }
                None => {
                    table.remove(&key);
                    if let Some(old) = old_best {
                        changes.push(old.to_withdraw());
                    }
                }
            }
        }
        debug!("Decision process produced {} change(s)", changes.len());
        changes
    }

    /// Drop everything a peer originated in one family, returning the
    /// resulting best-path changes.
    pub fn delete_paths_for_peer(&mut self, peer: &PeerInfo, family: Family) -> Vec<Path> {
        let mut changes: Vec<Path> = Vec::new();
        let table = match self.tables.get_mut(&family) {
            Some(table) => table,
            None => return changes,
        };
        let mut emptied: Vec<Vec<u8>> = Vec::new();
        for (key, destination) in table.iter_mut() {
            let old_best = destination.best().cloned();
            let before = destination.known.len();
            destination
                .known
                .retain(|known| known.source.address != peer.address);
            if destination.known.len() == before {
                continue;
            }
            match destination.best() {
                Some(best) => {
                    if let Some(old) = &old_best {
                        if !same_path(old, best) {
                            changes.push(best.clone());
                        }
                    }
                }
                None => {
                    emptied.push(key.clone());
                    if let Some(old) = old_best {
                        changes.push(old.to_withdraw());
                    }
                }
            }
        }
        for key in emptied {
            table.remove(&key);
        }
        debug!(
            "Removed routes from {} for {}: {} change(s)",
            family, peer, changes.len()
        );
        changes
    }

    /// Snapshot of every family's best paths
    pub fn tables(&self) -> HashMap<Family, Vec<Path>> {
        self.tables
            .keys()
            .map(|family| (*family, self.get_path_list(*family)))
            .collect()
    }

    /// Current best path per destination for one family
    pub fn get_path_list(&self, family: Family) -> Vec<Path> {
        self.tables
            .get(&family)
            .map(|table| {
                table
                    .values()
                    .filter_map(|destination| destination.best().cloned())
                    .collect()
            })
            .unwrap_or_else(Vec::new)
    }
}

#[cfg(test)]
mod tests {
    use super::path::PeerInfo;
    use super::*;
    use crate::utils::prefix_from_str;
    use bgp_rs::{NLRIEncoding, AFI, SAFI};
    use std::sync::Arc;

    fn family() -> Family {
        Family::new(AFI::IPV4, SAFI::Unicast)
    }

    fn peer(n: u8) -> PeerInfo {
        PeerInfo::new(
            65000 + u32::from(n),
            format!("{}.{}.{}.{}", n, n, n, n).parse().unwrap(),
            format!("192.0.2.{}", n).parse().unwrap(),
        )
    }

    fn path(prefix: &str, source: PeerInfo, local_pref: Option<u32>) -> Path {
        let mut attributes = PathAttributes::default();
        attributes.next_hop = Some(source.address);
        attributes.local_pref = local_pref;
        Path::new(
            family(),
            NLRIEncoding::IP(prefix_from_str(prefix).unwrap()),
            Arc::new(attributes),
            source,
            false,
        )
    }

    #[test]
    fn test_process_paths_announce_and_withdraw() {
        let mut rib = Rib::new(&Families::new(vec![family()]));
        let announced = path("10.1.0.0/16", peer(1), None);
        let changes = rib.process_paths(vec![announced.clone()]);
        assert_eq!(changes.len(), 1);
        assert_eq!(rib.get_path_list(family()).len(), 1);
        assert_eq!(rib.tables()[&family()].len(), 1);

        let changes = rib.process_paths(vec![announced.to_withdraw()]);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_withdraw);
        assert!(rib.get_path_list(family()).is_empty());
    }

    #[test]
    fn test_best_path_prefers_local_pref() {
        let mut rib = Rib::new(&Families::new(vec![family()]));
        rib.process_paths(vec![path("10.1.0.0/16", peer(1), Some(100))]);
        let changes = rib.process_paths(vec![path("10.1.0.0/16", peer(2), Some(200))]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].source.address, peer(2).address);

        // A worse path does not change the best
        let changes = rib.process_paths(vec![path("10.1.0.0/16", peer(3), Some(50))]);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_delete_paths_for_peer() {
        let mut rib = Rib::new(&Families::new(vec![family()]));
        rib.process_paths(vec![
            path("10.1.0.0/16", peer(1), Some(200)),
            path("10.2.0.0/16", peer(1), None),
            path("10.1.0.0/16", peer(2), Some(100)),
        ]);
        let changes = rib.delete_paths_for_peer(&peer(1), family());
        // 10.1/16 falls back to peer 2; 10.2/16 is withdrawn
        assert_eq!(changes.len(), 2);
        let withdrawn: Vec<_> = changes.iter().filter(|p| p.is_withdraw).collect();
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(rib.get_path_list(family()).len(), 1);
        assert_eq!(
            rib.get_path_list(family())[0].source.address,
            peer(2).address
        );
    }

    #[test]
    fn test_adj_rib_update() {
        let mut adj = AdjRib::new();
        let announced = path("10.1.0.0/16", peer(1), None);
        adj.update(&[announced.clone()]);
        assert_eq!(adj.len(), 1);
        // Replacement, not duplication
        adj.update(&[announced.clone()]);
        assert_eq!(adj.len(), 1);
        adj.update(&[announced.to_withdraw()]);
        assert!(adj.is_empty());

        adj.update(&[announced]);
        adj.clear(family());
        assert!(adj.is_empty());
    }
}
