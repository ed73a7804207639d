//! GeoIP Lookup: offline MMDB country lookup with an ordered CN IPv4
//! range fallback.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

/// Only the fields the classifier needs out of an MMDB `country` record.
#[derive(Debug, Deserialize, Default)]
struct CountryRecord<'a> {
    #[serde(borrow)]
    country: Option<IsoCode<'a>>,
    #[serde(borrow, rename = "registered_country")]
    registered_country: Option<IsoCode<'a>>,
    #[serde(borrow, rename = "represented_country")]
    represented_country: Option<IsoCode<'a>>,
}

#[derive(Debug, Deserialize)]
struct IsoCode<'a> {
    #[serde(borrow, rename = "iso_code")]
    iso_code: Option<&'a str>,
}

/// A merged, sorted CN IPv4 range index, used when the MMDB has no
/// record for an address (or no MMDB is loaded at all).
#[derive(Debug, Default, Clone)]
pub struct CnIpv4Index {
    /// Sorted by `start`; ranges are merged and non-overlapping.
    ranges: Vec<(u32, u32)>,
}

impl CnIpv4Index {
    /// Parse ASCII `CIDR/prefix` lines, merging overlapping and adjacent
    /// ranges, sorted by start address.
    pub fn parse(text: &str) -> Self {
        let mut ranges: Vec<(u32, u32)> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(parse_cidr_range)
            .collect();
        ranges.sort_unstable_by_key(|r| r.0);

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some((_, last_end)) if start <= last_end.saturating_add(1) => {
                    *last_end = (*last_end).max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        Self { ranges: merged }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Binary search on range starts for the greatest `start <= ip`, then
    /// bounds-check against that range's `end`.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip_int = u32::from(ip);
        match self.ranges.binary_search_by_key(&ip_int, |r| r.0) {
            Ok(_) => true,
            Err(0) => false,
            Err(pos) => {
                let (_, end) = self.ranges[pos - 1];
                ip_int <= end
            }
        }
    }

    /// Naive linear-scan reference implementation, used only to test the
    /// binary-search path against.
    #[cfg(test)]
    fn contains_linear(&self, ip: Ipv4Addr) -> bool {
        let ip_int = u32::from(ip);
        self.ranges.iter().any(|&(s, e)| s <= ip_int && ip_int <= e)
    }
}

fn parse_cidr_range(line: &str) -> Option<(u32, u32)> {
    let (addr, prefix) = line.split_once('/')?;
    let base: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let base_int = u32::from(base);
    let host_bits = 32 - prefix;
    let mask = if host_bits == 32 { 0 } else { !0u32 << host_bits };
    let network = base_int & mask;
    let broadcast = network | !mask;
    Some((network, broadcast))
}

/// Capability interface the classifier resolves country signals through.
/// Lets tests substitute an in-memory fake instead of a real MMDB.
pub trait GeoLookup: Send + Sync {
    fn country(&self, ip: Ipv4Addr) -> Option<String>;
    fn is_china(&self, ip: Ipv4Addr) -> bool;
}

/// Handle to an MMDB file, plus the CN IPv4 fallback index.
pub struct GeoIp {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    cn_ipv4: CnIpv4Index,
}

impl GeoIp {
    pub fn new(reader: Option<maxminddb::Reader<Vec<u8>>>, cn_ipv4: CnIpv4Index) -> Self {
        Self { reader, cn_ipv4 }
    }

    pub fn empty() -> Self {
        Self {
            reader: None,
            cn_ipv4: CnIpv4Index::default(),
        }
    }

    pub fn open_mmdb(path: &Path) -> std::io::Result<maxminddb::Reader<Vec<u8>>> {
        maxminddb::Reader::open_readfile(path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// MMDB first (country → registered_country → represented_country),
    /// then the CN IPv4 range index.
    pub fn country(&self, ip: Ipv4Addr) -> Option<String> {
        if let Some(reader) = &self.reader {
            // `AddressNotFoundError` and any other lookup failure both fall
            // through to the CN IPv4 index below.
            if let Ok(record) = reader.lookup::<CountryRecord>(ip.into()) {
                let code = record
                    .country
                    .and_then(|c| c.iso_code)
                    .or_else(|| record.registered_country.and_then(|c| c.iso_code))
                    .or_else(|| record.represented_country.and_then(|c| c.iso_code));
                if let Some(code) = code {
                    return Some(code.to_string());
                }
            }
        }
        if self.cn_ipv4.contains(ip) {
            return Some("CN".to_string());
        }
        None
    }

    pub fn is_china(&self, ip: Ipv4Addr) -> bool {
        self.country(ip).as_deref() == Some("CN")
    }
}

impl GeoLookup for GeoIp {
    fn country(&self, ip: Ipv4Addr) -> Option<String> {
        self.country(ip)
    }

    fn is_china(&self, ip: Ipv4Addr) -> bool {
        self.is_china(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_merges_overlapping_ranges() {
        let idx = CnIpv4Index::parse(
            "1.0.1.0/24\n1.0.2.0/24\n# comment\n\n203.0.113.0/25\n203.0.113.128/25\n",
        );
        // 1.0.1.0/24 and 1.0.2.0/24 are adjacent (1.0.1.255 + 1 == 1.0.2.0) -> merged.
        assert_eq!(idx.len(), 2);
        assert!(idx.contains("1.0.1.5".parse().unwrap()));
        assert!(idx.contains("1.0.2.5".parse().unwrap()));
        assert!(idx.contains("203.0.113.200".parse().unwrap()));
        assert!(!idx.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn skips_invalid_lines() {
        let idx = CnIpv4Index::parse("not-a-cidr\n1.2.3.4/99\n1.2.3.0/24\n");
        assert_eq!(idx.len(), 1);
        assert!(idx.contains("1.2.3.1".parse().unwrap()));
    }

    #[test]
    fn binary_search_matches_linear_scan() {
        let idx = CnIpv4Index::parse(
            "1.0.0.0/24\n5.5.5.0/24\n10.0.0.0/16\n100.100.0.0/20\n200.1.1.0/28\n",
        );
        let probes = [
            "0.255.255.255",
            "1.0.0.0",
            "1.0.0.255",
            "1.0.1.0",
            "5.5.5.200",
            "9.255.255.255",
            "10.0.255.255",
            "10.1.0.0",
            "100.100.15.255",
            "200.1.1.15",
            "200.1.1.16",
            "255.255.255.255",
        ];
        for p in probes {
            let ip: Ipv4Addr = p.parse().unwrap();
            assert_eq!(
                idx.contains(ip),
                idx.contains_linear(ip),
                "mismatch for {p}"
            );
        }
    }

    #[test]
    fn empty_index_never_matches() {
        let idx = CnIpv4Index::default();
        assert!(!idx.contains(Ipv4Addr::new(1, 1, 1, 1)));
    }

    #[test]
    fn geoip_without_mmdb_falls_back_to_cn_index() {
        let idx = CnIpv4Index::parse("114.114.0.0/16\n");
        let geoip = GeoIp::new(None, idx);
        assert_eq!(geoip.country("114.114.114.114".parse().unwrap()).as_deref(), Some("CN"));
        assert!(geoip.is_china("114.114.114.114".parse().unwrap()));
        assert!(!geoip.is_china("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn empty_geoip_yields_no_country() {
        let geoip = GeoIp::empty();
        assert_eq!(geoip.country("1.1.1.1".parse().unwrap()), None);
    }
}
