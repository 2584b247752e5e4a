use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::{
    ASPath, Identifier, MPReachNLRI, MPUnreachNLRI, NLRIEncoding, PathAttribute, Segment, Update,
    AFI, SAFI,
};
use chrono::{DateTime, Utc};

use super::{Families, Family, PathAttributes};
use crate::session::MessageError;
use crate::utils::{bytes_to_ipv6, nlri_to_string};

/// AS-TRANS: RFC 6793 [4.2.3.9]
pub const AS_TRANS: u32 = 23456;

/// Identifies a route's origin across the speaker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub asn: u32,
    pub router_id: IpAddr,
    pub address: IpAddr,
}

impl PeerInfo {
    pub fn new(asn: u32, router_id: IpAddr, address: IpAddr) -> Self {
        Self {
            asn,
            router_id,
            address,
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/AS{}", self.address, self.asn)
    }
}

/// A single route as it moves between session actors.
///
/// Value-typed so it can cross mailboxes; the attribute block is shared
/// behind an `Arc` and cloned only when policy rewrites it.
#[derive(Clone, Debug)]
pub struct Path {
    pub family: Family,
    pub nlri: NLRIEncoding,
    pub attributes: Arc<PathAttributes>,
    pub next_hop: Option<IpAddr>,
    pub is_withdraw: bool,
    pub source: PeerInfo,
    pub timestamp: DateTime<Utc>,
}

impl Path {
    pub fn new(
        family: Family,
        nlri: NLRIEncoding,
        attributes: Arc<PathAttributes>,
        source: PeerInfo,
        is_withdraw: bool,
    ) -> Self {
        let next_hop = attributes.next_hop;
        Self {
            family,
            nlri,
            attributes,
            next_hop,
            is_withdraw,
            source,
            timestamp: Utc::now(),
        }
    }

    /// Ordering/identity key of the NLRI within a family table
    pub fn key(&self) -> Vec<u8> {
        nlri_key(&self.nlri)
    }

    pub fn to_withdraw(&self) -> Path {
        let mut path = self.clone();
        path.is_withdraw = true;
        path
    }

    /// Replace the next-hop, keeping the attribute view in sync
    pub fn set_next_hop(&mut self, next_hop: IpAddr) {
        let mut attributes = (*self.attributes).clone();
        attributes.next_hop = Some(next_hop);
        self.attributes = Arc::new(attributes);
        self.next_hop = Some(next_hop);
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Path {} {} from {}{}>",
            self.family,
            nlri_to_string(&self.nlri),
            self.source,
            if self.is_withdraw { " withdrawn" } else { "" },
        )
    }
}

pub fn nlri_key(nlri: &NLRIEncoding) -> Vec<u8> {
    match nlri {
        NLRIEncoding::IP(prefix) => {
            let mut key = prefix.prefix.clone();
            key.push(prefix.length);
            key
        }
        // Only IP NLRI reach the tables; anything else keys on its debug form
        other => format!("{:?}", other).into_bytes(),
    }
}

/// Convert a received UPDATE into the paths it carries, tagged with the
/// receiving session's peer info. Withdrawals come first so that an UPDATE
/// replacing a route applies cleanly in order.
pub fn paths_from_update(update: &Update, source: &PeerInfo) -> Vec<Path> {
    let mut paths: Vec<Path> = Vec::with_capacity(
        update.announced_routes.len() + update.withdrawn_routes.len(),
    );
    let empty = Arc::new(PathAttributes::default());

    for withdrawn in &update.withdrawn_routes {
        paths.push(Path::new(
            Family::new(AFI::IPV4, SAFI::Unicast),
            withdrawn.clone(),
            empty.clone(),
            source.clone(),
            true,
        ));
    }
    if let Some(PathAttribute::MP_UNREACH_NLRI(mp)) = update.get(Identifier::MP_UNREACH_NLRI) {
        let family = Family::new(mp.afi, mp.safi);
        for withdrawn in &mp.withdrawn_routes {
            paths.push(Path::new(
                family,
                withdrawn.clone(),
                empty.clone(),
                source.clone(),
                true,
            ));
        }
    }

    let attributes = Arc::new(PathAttributes::from_attributes(&update.attributes));
    for announced in &update.announced_routes {
        paths.push(Path::new(
            Family::new(AFI::IPV4, SAFI::Unicast),
            announced.clone(),
            attributes.clone(),
            source.clone(),
            false,
        ));
    }
    if let Some(PathAttribute::MP_REACH_NLRI(mp)) = update.get(Identifier::MP_REACH_NLRI) {
        let family = Family::new(mp.afi, mp.safi);
        let mp_attributes = if family == Family::new(AFI::IPV6, SAFI::Unicast)
            && mp.next_hop.len() >= 16
        {
            let mut attrs = (*attributes).clone();
            attrs.next_hop = Some(bytes_to_ipv6(&mp.next_hop));
            Arc::new(attrs)
        } else {
            attributes.clone()
        };
        for announced in &mp.announced_routes {
            paths.push(Path::new(
                family,
                announced.clone(),
                mp_attributes.clone(),
                source.clone(),
                false,
            ));
        }
    }
    paths
}

/// Build the single-NLRI UPDATE announcing or withdrawing a path
pub fn update_from_path(path: &Path) -> Update {
    if path.is_withdraw {
        return match path.family.afi {
            AFI::IPV4 => Update {
                withdrawn_routes: vec![path.nlri.clone()],
                attributes: vec![],
                announced_routes: vec![],
            },
            _ => Update {
                withdrawn_routes: vec![],
                attributes: vec![PathAttribute::MP_UNREACH_NLRI(MPUnreachNLRI {
                    afi: path.family.afi,
                    safi: path.family.safi,
                    withdrawn_routes: vec![path.nlri.clone()],
                })],
                announced_routes: vec![],
            },
        };
    }

    let mut attributes = path.attributes.to_attributes(path.family);
    match path.family.afi {
        AFI::IPV4 => Update {
            withdrawn_routes: vec![],
            attributes,
            announced_routes: vec![path.nlri.clone()],
        },
        _ => {
            let next_hop = match path.next_hop {
                Some(IpAddr::V6(nh)) => nh.octets().to_vec(),
                _ => vec![],
            };
            attributes.push(PathAttribute::MP_REACH_NLRI(MPReachNLRI {
                afi: path.family.afi,
                safi: path.family.safi,
                next_hop,
                announced_routes: vec![path.nlri.clone()],
            }));
            Update {
                withdrawn_routes: vec![],
                attributes,
                announced_routes: vec![],
            }
        }
    }
}

/// Validate a received UPDATE against the negotiated families.
///
/// Errors with a zero code are dropped without a NOTIFICATION; a non-zero
/// code becomes the NOTIFICATION the session emits.
pub fn validate_update(update: &Update, families: &Families) -> Result<(), MessageError> {
    let v4_unicast = Family::new(AFI::IPV4, SAFI::Unicast);
    if !update.announced_routes.is_empty() && !families.contains(v4_unicast) {
        return Err(MessageError::silent(format!(
            "family {} not negotiated",
            v4_unicast
        )));
    }
    if !update.withdrawn_routes.is_empty() && !families.contains(v4_unicast) {
        return Err(MessageError::silent(format!(
            "family {} not negotiated",
            v4_unicast
        )));
    }
    if let Some(PathAttribute::MP_REACH_NLRI(mp)) = update.get(Identifier::MP_REACH_NLRI) {
        let family = Family::new(mp.afi, mp.safi);
        if !families.contains(family) {
            return Err(MessageError::silent(format!(
                "family {} not negotiated",
                family
            )));
        }
        if mp.safi == SAFI::Unicast && mp.next_hop.is_empty() {
            // RFC 4271 6.3: invalid NEXT_HOP
            return Err(MessageError::new(3, 8, "empty next-hop in MP_REACH_NLRI"));
        }
    }
    if let Some(PathAttribute::MP_UNREACH_NLRI(mp)) = update.get(Identifier::MP_UNREACH_NLRI) {
        let family = Family::new(mp.afi, mp.safi);
        if !families.contains(family) {
            return Err(MessageError::silent(format!(
                "family {} not negotiated",
                family
            )));
        }
    }

    let has_announcements = !update.announced_routes.is_empty()
        || update.get(Identifier::MP_REACH_NLRI).is_some();
    if has_announcements {
        // RFC 4271 6.3: missing well-known attribute
        if update.get(Identifier::ORIGIN).is_none() {
            return Err(MessageError::new(3, 3, "missing ORIGIN"));
        }
        match update.get(Identifier::AS_PATH) {
            None => return Err(MessageError::new(3, 3, "missing AS_PATH")),
            Some(PathAttribute::AS_PATH(as_path)) => {
                // RFC 4271 6.3: malformed AS_PATH
                let malformed = as_path.segments.iter().any(|segment| match segment {
                    Segment::AS_SEQUENCE(seq) => seq.is_empty(),
                    Segment::AS_SET(set) => set.is_empty(),
                });
                if malformed {
                    return Err(MessageError::new(3, 11, "empty AS_PATH segment"));
                }
            }
            Some(_) => unreachable!(),
        }
        if !update.announced_routes.is_empty() && update.get(Identifier::NEXT_HOP).is_none() {
            return Err(MessageError::new(3, 3, "missing NEXT_HOP"));
        }
    }
    Ok(())
}

/// Fold a 4-byte AS4_PATH into AS_PATH after decode (RFC 6793).
///
/// When the AS_PATH carries AS_TRANS placeholders and an AS4_PATH is
/// present, the AS4_PATH is authoritative; the transitional attribute is
/// dropped either way.
pub fn normalize_as4_attributes(update: &mut Update) {
    let as4_path = update.attributes.iter().find_map(|attr| match attr {
        PathAttribute::AS4_PATH(as_path) => Some(as_path.clone()),
        _ => None,
    });
    if let Some(as4_path) = as4_path {
        for attr in update.attributes.iter_mut() {
            if let PathAttribute::AS_PATH(as_path) = attr {
                let has_trans = as_path.segments.iter().any(|segment| match segment {
                    Segment::AS_SEQUENCE(seq) => seq.contains(&AS_TRANS),
                    Segment::AS_SET(set) => set.contains(&AS_TRANS),
                });
                if has_trans {
                    *as_path = as4_path.clone();
                }
            }
        }
    }
    update
        .attributes
        .retain(|attr| attr.id() != Identifier::AS4_PATH);
}

/// Rewrite AS-path attributes to 2-octet form for peers without the
/// 4-octet AS capability: ASNs beyond the 2-byte range become AS_TRANS.
pub fn rewrite_two_octet_asns(update: &mut Update) {
    let clamp = |asns: &[u32]| -> Vec<u32> {
        asns.iter()
            .map(|&asn| {
                if asn > u32::from(std::u16::MAX) {
                    AS_TRANS
                } else {
                    asn
                }
            })
            .collect()
    };
    for attr in update.attributes.iter_mut() {
        if let PathAttribute::AS_PATH(as_path) = attr {
            let segments = as_path
                .segments
                .iter()
                .map(|segment| match segment {
                    Segment::AS_SEQUENCE(seq) => Segment::AS_SEQUENCE(clamp(seq)),
                    Segment::AS_SET(set) => Segment::AS_SET(clamp(set)),
                })
                .collect();
            *as_path = ASPath { segments };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::prefix_from_str;
    use bgp_rs::Origin;

    fn test_peer() -> PeerInfo {
        PeerInfo::new(
            65001,
            "2.2.2.2".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        )
    }

    fn announce_update(prefix: &str, next_hop: &str) -> Update {
        Update {
            withdrawn_routes: vec![],
            attributes: vec![
                PathAttribute::ORIGIN(Origin::IGP),
                PathAttribute::NEXT_HOP(next_hop.parse().unwrap()),
                PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![65001])],
                }),
            ],
            announced_routes: vec![NLRIEncoding::IP(prefix_from_str(prefix).unwrap())],
        }
    }

    fn v4_families() -> Families {
        Families::new(vec![Family::new(AFI::IPV4, SAFI::Unicast)])
    }

    #[test]
    fn test_paths_from_update_announce() {
        let update = announce_update("10.7.0.0/24", "192.0.2.1");
        let paths = paths_from_update(&update, &test_peer());
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].is_withdraw);
        assert_eq!(paths[0].next_hop, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(paths[0].source.asn, 65001);
    }

    #[test]
    fn test_paths_from_update_withdraw_first() {
        let mut update = announce_update("10.7.0.0/24", "192.0.2.1");
        update
            .withdrawn_routes
            .push(NLRIEncoding::IP(prefix_from_str("10.8.0.0/24").unwrap()));
        let paths = paths_from_update(&update, &test_peer());
        assert_eq!(paths.len(), 2);
        assert!(paths[0].is_withdraw);
        assert!(!paths[1].is_withdraw);
    }

    #[test]
    fn test_update_from_path_roundtrip() {
        let update = announce_update("10.7.0.0/24", "192.0.2.1");
        let paths = paths_from_update(&update, &test_peer());
        let rebuilt = update_from_path(&paths[0]);
        assert_eq!(rebuilt.announced_routes, update.announced_routes);

        let withdraw = update_from_path(&paths[0].to_withdraw());
        assert!(withdraw.announced_routes.is_empty());
        assert_eq!(withdraw.withdrawn_routes.len(), 1);
    }

    #[test]
    fn test_validate_rejects_unknown_family() {
        let update = announce_update("10.7.0.0/24", "192.0.2.1");
        let err = validate_update(&update, &Families::new(vec![])).unwrap_err();
        assert_eq!(err.code, 0);
    }

    #[test]
    fn test_validate_malformed_as_path() {
        let mut update = announce_update("10.7.0.0/24", "192.0.2.1");
        update.attributes = update
            .attributes
            .into_iter()
            .map(|attr| match attr {
                PathAttribute::AS_PATH(_) => PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![])],
                }),
                attr => attr,
            })
            .collect();
        let err = validate_update(&update, &v4_families()).unwrap_err();
        assert_eq!((err.code, err.subcode), (3, 11));
    }

    #[test]
    fn test_validate_missing_well_known() {
        let mut update = announce_update("10.7.0.0/24", "192.0.2.1");
        update.attributes.retain(|a| a.id() != Identifier::ORIGIN);
        let err = validate_update(&update, &v4_families()).unwrap_err();
        assert_eq!((err.code, err.subcode), (3, 3));
    }

    #[test]
    fn test_normalize_as4() {
        let mut update = announce_update("10.7.0.0/24", "192.0.2.1");
        update.attributes = update
            .attributes
            .into_iter()
            .map(|attr| match attr {
                PathAttribute::AS_PATH(_) => PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![AS_TRANS, 100])],
                }),
                attr => attr,
            })
            .collect();
        update.attributes.push(PathAttribute::AS4_PATH(ASPath {
            segments: vec![Segment::AS_SEQUENCE(vec![4259840100, 100])],
        }));
        normalize_as4_attributes(&mut update);
        assert!(update
            .attributes
            .iter()
            .all(|a| a.id() != Identifier::AS4_PATH));
        let attrs = PathAttributes::from_attributes(&update.attributes);
        assert_eq!(&attrs.as_path_string(), "65000.100 100");
    }

    #[test]
    fn test_rewrite_two_octet() {
        let mut update = announce_update("10.7.0.0/24", "192.0.2.1");
        update.attributes = update
            .attributes
            .into_iter()
            .map(|attr| match attr {
                PathAttribute::AS_PATH(_) => PathAttribute::AS_PATH(ASPath {
                    segments: vec![Segment::AS_SEQUENCE(vec![4259840100, 100])],
                }),
                attr => attr,
            })
            .collect();
        rewrite_two_octet_asns(&mut update);
        let attrs = PathAttributes::from_attributes(&update.attributes);
        assert_eq!(&attrs.as_path_string(), "23456 100");
    }
}
