use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use bgp_rs::{OpenCapability, AFI, SAFI};
use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::ParseError;

/// An AFI/SAFI pair identifying which kind of routes a session carries
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Family {
    pub afi: AFI,
    pub safi: SAFI,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.afi, self.safi)
    }
}

impl Family {
    pub fn new(afi: AFI, safi: SAFI) -> Self {
        Self { afi, safi }
    }

    pub fn to_open_param(self) -> OpenCapability {
        OpenCapability::MultiProtocol((self.afi, self.safi))
    }
}

impl From<&Family> for (AFI, SAFI) {
    fn from(family: &Family) -> (AFI, SAFI) {
        (family.afi, family.safi)
    }
}

impl TryFrom<(u16, u8)> for Family {
    type Error = std::io::Error;

    fn try_from(v: (u16, u8)) -> Result<Self, Self::Error> {
        Ok(Self::new(AFI::try_from(v.0)?, SAFI::try_from(v.1)?))
    }
}

impl FromStr for Family {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split_whitespace().collect();
        if parts.len() != 2 {
            return Err(ParseError::new(format!("Incorrect family format: '{}'", s)));
        }
        let afi = match parts[0].to_lowercase().as_str() {
            "ipv4" => AFI::IPV4,
            "ipv6" => AFI::IPV6,
            family => return Err(ParseError::new(format!("Unsupported AFI: '{}'", family))),
        };
        let safi = match parts[1].to_lowercase().as_str() {
            "unicast" => SAFI::Unicast,
            sfamily => return Err(ParseError::new(format!("Unsupported SAFI: '{}'", sfamily))),
        };
        Ok(Family::new(afi, safi))
    }
}

impl Serialize for Family {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Family {
    fn deserialize<D>(deserializer: D) -> Result<Family, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|err: ParseError| serde::de::Error::custom(err.reason))
    }
}

/// The set of route families a session is configured or negotiated for.
///
/// Negotiation computes a fresh intersection so a family never survives
/// without appearing on both sides.
#[derive(Debug, Clone, Default)]
pub struct Families(HashSet<Family>);

impl Families {
    pub fn new(families: Vec<Family>) -> Self {
        Self(families.into_iter().collect())
    }

    pub fn common(&self, other: &Families) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn contains(&self, family: Family) -> bool {
        self.0.contains(&family)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::collections::hash_set::Iter<Family> {
        self.0.iter()
    }
}

impl From<&[Family]> for Families {
    fn from(families: &[Family]) -> Self {
        Self(families.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::value::{Error, StrDeserializer};
    use serde::de::IntoDeserializer;

    #[test]
    fn test_serialize_family() {
        assert_eq!(
            &Family::new(AFI::IPV4, SAFI::Unicast).to_string(),
            "IPv4 Unicast"
        );
    }

    #[test]
    fn test_deserialize_family() {
        let deserializer: StrDeserializer<Error> = "ipv6 unicast".into_deserializer();
        let family = Family::deserialize(deserializer).unwrap();
        assert_eq!(family, Family::new(AFI::IPV6, SAFI::Unicast));

        let deserializer: StrDeserializer<Error> = "ipv4 flow".into_deserializer();
        assert!(Family::deserialize(deserializer).is_err());
    }

    #[test]
    fn test_intersection() {
        let configured = Families::new(vec![
            Family::new(AFI::IPV4, SAFI::Unicast),
            Family::new(AFI::IPV6, SAFI::Unicast),
        ]);
        let advertised = Families::new(vec![Family::new(AFI::IPV4, SAFI::Unicast)]);
        let negotiated = configured.common(&advertised);
        assert_eq!(negotiated.len(), 1);
        assert!(negotiated.contains(Family::new(AFI::IPV4, SAFI::Unicast)));
        assert!(!negotiated.contains(Family::new(AFI::IPV6, SAFI::Unicast)));
    }
}
