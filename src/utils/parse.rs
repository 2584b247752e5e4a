use std::error::Error;
use std::fmt;
use std::io;
use std::net::{AddrParseError, IpAddr};
use std::num::ParseIntError;

use bgp_rs::{NLRIEncoding, Prefix, AFI};
use ipnetwork::IpNetwork;

#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: String) -> Self {
        ParseError { reason }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError: {}", self.reason)
    }
}

impl Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::new(error.to_string())
    }
}

/// Convert an ASN string to a u32
/// E.g. "65000.100" -> 42598400100
pub fn asn_from_dotted(value: &str) -> std::result::Result<u32, ParseError> {
    // Iterate through chunks in reverse, so if there's no dot (only one number),
    // it will be in the least significant position
    let mut chunks = [0; 2];
    let check_for_overflow = value.contains('.');
    for (i, chunk) in value
        .splitn(2, '.')
        .collect::<Vec<&str>>()
        .into_iter()
        .rev()
        .enumerate()
    {
        let chunk: u32 = chunk
            .parse()
            .map_err(|err| ParseError::new(format!("{} '{}'", err, value)))?;
        if check_for_overflow && chunk > u32::from(std::u16::MAX) {
            return Err(ParseError::new(format!("Unsupported ASN '{}'", value)));
        }
        chunks[i] = chunk;
    }
    Ok((chunks[1] * 65536) + chunks[0])
}

/// Convert a CIDR prefix (E.g. "192.168.0.0/24") to a bgp_rs::Prefix
pub fn prefix_from_str(prefix: &str) -> std::result::Result<Prefix, ParseError> {
    if let Some(i) = prefix.find('/') {
        let (addr, mask) = prefix.split_at(i);
        let mask = &mask[1..]; // Skip remaining '/'
        let addr: IpAddr = addr
            .parse()
            .map_err(|err: AddrParseError| ParseError::new(format!("{} '{}'", err, prefix)))?;
        let length: u8 = mask
            .parse()
            .map_err(|err: ParseIntError| ParseError::new(format!("{} '{}'", err, prefix)))?;
        let (protocol, octets) = match addr {
            IpAddr::V4(v4) => (AFI::IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AFI::IPV6, v6.octets().to_vec()),
        };
        Ok(Prefix {
            protocol,
            length,
            prefix: octets,
        })
    } else {
        Err(ParseError {
            reason: format!("Not a valid prefix: '{}'", prefix),
        })
    }
}

pub fn prefix_from_network(network: &IpNetwork) -> Prefix {
    let (protocol, octets) = match network.ip() {
        IpAddr::V4(v4) => (AFI::IPV4, v4.octets().to_vec()),
        IpAddr::V6(v6) => (AFI::IPV6, v6.octets().to_vec()),
    };
    Prefix {
        protocol,
        length: network.prefix(),
        prefix: octets,
    }
}

/// Address and mask length of NLRI, where representable
pub fn nlri_to_addr(nlri: &NLRIEncoding) -> Option<(IpAddr, u8)> {
    match nlri {
        NLRIEncoding::IP(prefix) => {
            let addr = match prefix.protocol {
                AFI::IPV4 => {
                    let mut octets: [u8; 4] = [0; 4];
                    let len = prefix.prefix.len().min(4);
                    octets[..len].copy_from_slice(&prefix.prefix[..len]);
                    Some(IpAddr::from(octets))
                }
                AFI::IPV6 => {
                    let mut octets: [u8; 16] = [0; 16];
                    let len = prefix.prefix.len().min(16);
                    octets[..len].copy_from_slice(&prefix.prefix[..len]);
                    Some(IpAddr::from(octets))
                }
                _ => None,
            };
            addr.map(|addr| (addr, prefix.length))
        }
        _ => None,
    }
}

/// Printable form of NLRI ("10.1.0.0/16")
pub fn nlri_to_string(nlri: &NLRIEncoding) -> String {
    match nlri_to_addr(nlri) {
        Some((addr, length)) => format!("{}/{}", addr, length),
        None => String::from("<opaque NLRI>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asn_from_dotted() {
        assert_eq!(asn_from_dotted("100").unwrap(), 100);
        assert_eq!(asn_from_dotted("65000.100").unwrap(), 4259840100);
        assert!(asn_from_dotted("65536.100").is_err());
        assert!(asn_from_dotted("bogus").is_err());
    }

    #[test]
    fn test_prefix_from_str() {
        let prefix = prefix_from_str("192.168.10.0/24").unwrap();
        assert_eq!(prefix.length, 24);
        assert_eq!(prefix.protocol, AFI::IPV4);
        assert!(prefix_from_str("192.168.10.0").is_err());

        let v6 = prefix_from_str("3001:100::/56").unwrap();
        assert_eq!(v6.protocol, AFI::IPV6);
        assert_eq!(v6.length, 56);
    }

    #[test]
    fn test_nlri_to_string() {
        let prefix = prefix_from_str("10.1.0.0/16").unwrap();
        assert_eq!(nlri_to_string(&NLRIEncoding::IP(prefix)), "10.1.0.0/16");
    }
}
