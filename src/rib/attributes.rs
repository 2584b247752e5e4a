use std::net::IpAddr;

use bgp_rs::{ASPath, Identifier, Origin, PathAttribute, Segment, AFI, SAFI};

use super::Family;
use crate::utils::bytes_to_ipv6;

/// Decoded view of the path attributes carried with a route.
///
/// Paths share one of these behind an `Arc`; policy rewrites clone it.
#[derive(Debug, Clone)]
pub struct PathAttributes {
    pub next_hop: Option<IpAddr>,
    pub origin: Origin,
    pub as_path: ASPath,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub communities: Vec<u32>,
}

impl Default for PathAttributes {
    fn default() -> Self {
        Self {
            next_hop: None,
            origin: Origin::INCOMPLETE,
            as_path: ASPath { segments: vec![] },
            local_pref: None,
            multi_exit_disc: None,
            communities: vec![],
        }
    }
}

fn get(attributes: &[PathAttribute], id: Identifier) -> Option<&PathAttribute> {
    attributes.iter().find(|attr| attr.id() == id)
}

impl PathAttributes {
    pub fn from_attributes(attributes: &[PathAttribute]) -> Self {
        let origin = get(attributes, Identifier::ORIGIN)
            .map(|attr| match attr {
                PathAttribute::ORIGIN(origin) => origin.clone(),
                _ => unreachable!(),
            })
            .unwrap_or(Origin::INCOMPLETE);
        let next_hop = get(attributes, Identifier::MP_REACH_NLRI)
            // Check for IPv6 first in MPReachNLRI
            .and_then(|attr| match attr {
                PathAttribute::MP_REACH_NLRI(nlri) => {
                    if (nlri.afi, nlri.safi) == (AFI::IPV6, SAFI::Unicast)
                        && nlri.next_hop.len() >= 16
                    {
                        Some(bytes_to_ipv6(&nlri.next_hop))
                    } else {
                        None
                    }
                }
                _ => None,
            })
            // Fallback to IPv4 Unicast
            .or_else(|| {
                get(attributes, Identifier::NEXT_HOP).map(|attr| match attr {
                    PathAttribute::NEXT_HOP(next_hop) => *next_hop,
                    _ => unreachable!(),
                })
            });
        let as_path = get(attributes, Identifier::AS_PATH)
            .map(|attr| match attr {
                PathAttribute::AS_PATH(as_path) => as_path.clone(),
                _ => unreachable!(),
            })
            .unwrap_or_else(|| ASPath { segments: vec![] });
        let local_pref = get(attributes, Identifier::LOCAL_PREF).and_then(|attr| match attr {
            PathAttribute::LOCAL_PREF(local_pref) => Some(*local_pref),
            _ => None,
        });
        let multi_exit_disc =
            get(attributes, Identifier::MULTI_EXIT_DISC).and_then(|attr| match attr {
                PathAttribute::MULTI_EXIT_DISC(metric) => Some(*metric),
                _ => None,
            });
        let communities = get(attributes, Identifier::COMMUNITY)
            .map(|attr| match attr {
                PathAttribute::COMMUNITY(communities) => communities.clone(),
                _ => unreachable!(),
            })
            .unwrap_or_else(Vec::new);

        PathAttributes {
            next_hop,
            origin,
            as_path,
            local_pref,
            multi_exit_disc,
            communities,
        }
    }

    /// Rebuild an attribute list, suitable for an outbound UPDATE.
    ///
    /// NEXT_HOP is emitted for IPv4 Unicast only; IPv6 next-hops ride in
    /// the MP_REACH_NLRI attribute built by the caller.
    pub fn to_attributes(&self, family: Family) -> Vec<PathAttribute> {
        let mut attributes: Vec<PathAttribute> = Vec::with_capacity(6);
        attributes.push(PathAttribute::ORIGIN(self.origin.clone()));
        attributes.push(PathAttribute::AS_PATH(self.as_path.clone()));
        if let (AFI::IPV4, Some(IpAddr::V4(next_hop))) = (family.afi, self.next_hop) {
            attributes.push(PathAttribute::NEXT_HOP(IpAddr::V4(next_hop)));
        }
        if let Some(local_pref) = self.local_pref {
            attributes.push(PathAttribute::LOCAL_PREF(local_pref));
        }
        if let Some(med) = self.multi_exit_disc {
            attributes.push(PathAttribute::MULTI_EXIT_DISC(med));
        }
        if !self.communities.is_empty() {
            attributes.push(PathAttribute::COMMUNITY(self.communities.clone()));
        }
        attributes
    }

    /// Number of hops in the AS path (AS_SET counts as one)
    pub fn as_path_length(&self) -> usize {
        self.as_path
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::AS_SEQUENCE(seq) => seq.len(),
                Segment::AS_SET(_) => 1,
            })
            .sum()
    }

    /// Flattened AS path for display ("100 200 65000.100")
    pub fn as_path_string(&self) -> String {
        use crate::utils::u32_to_dotted;
        self.as_path
            .segments
            .iter()
            .flat_map(|segment| match segment {
                Segment::AS_SEQUENCE(seq) => seq.clone(),
                Segment::AS_SET(set) => set.clone(),
            })
            .map(|asn| u32_to_dotted(asn, '.'))
            .collect::<Vec<String>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgp_rs::{ASPath, Origin, Segment};

    fn attribute_list() -> Vec<PathAttribute> {
        vec![
            PathAttribute::ORIGIN(Origin::IGP),
            PathAttribute::NEXT_HOP("192.0.2.1".parse().unwrap()),
            PathAttribute::AS_PATH(ASPath {
                segments: vec![Segment::AS_SEQUENCE(vec![100, 200])],
            }),
            PathAttribute::LOCAL_PREF(300),
        ]
    }

    #[test]
    fn test_from_attributes() {
        let attrs = PathAttributes::from_attributes(&attribute_list());
        assert_eq!(attrs.next_hop, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(attrs.local_pref, Some(300));
        assert_eq!(attrs.multi_exit_disc, None);
        assert_eq!(attrs.as_path_length(), 2);
        assert_eq!(&attrs.as_path_string(), "100 200");
    }

    #[test]
    fn test_to_attributes_roundtrip() {
        use bgp_rs::{AFI, SAFI};
        let attrs = PathAttributes::from_attributes(&attribute_list());
        let rebuilt = attrs.to_attributes(Family::new(AFI::IPV4, SAFI::Unicast));
        assert!(rebuilt
            .iter()
            .any(|attr| matches!(attr, PathAttribute::NEXT_HOP(_))));
        assert!(rebuilt
            .iter()
            .any(|attr| matches!(attr, PathAttribute::LOCAL_PREF(300))));

        // IPv6 updates carry the next-hop in MP_REACH_NLRI instead
        let rebuilt = attrs.to_attributes(Family::new(AFI::IPV6, SAFI::Unicast));
        assert!(!rebuilt
            .iter()
            .any(|attr| matches!(attr, PathAttribute::NEXT_HOP(_))));
    }
}
