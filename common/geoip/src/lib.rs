use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use maxminddb::{geoip2, MaxMindDBError, Reader};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum GeoIpError {
    #[error("failed to open GeoIP database: {0}")]
    DatabaseOpenError(#[from] MaxMindDBError),
    #[error("invalid ip address: {0}")]
    InvalidIp(String),
}

/// Geographic attributes resolved for a single IP address.
///
/// Fields the database has no data for are left at their defaults, so a
/// lookup of an unknown address yields an all-empty value rather than an
/// error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoLookup {
    pub country: String,
    pub subdivision: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Read-only handle over an on-disk MaxMind City database.
pub struct GeoIpReader {
    reader: Reader<Vec<u8>>,
}

impl GeoIpReader {
    pub fn open(db_path: &Path) -> Result<Self, GeoIpError> {
        debug!("opening GeoIP database at {:?}", db_path);
        let reader = Reader::open_readfile(db_path)?;
        info!("opened GeoIP database");
        Ok(GeoIpReader { reader })
    }

    /// Resolves `ip` to its geographic attributes. An address absent from
    /// the database is not an error; it resolves to an empty lookup.
    pub fn lookup(&self, ip: &str) -> Result<GeoLookup, GeoIpError> {
        let addr = IpAddr::from_str(ip).map_err(|_| GeoIpError::InvalidIp(ip.to_string()))?;

        let city: geoip2::City = match self.reader.lookup(addr) {
            Ok(city) => city,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return Ok(GeoLookup::default()),
            Err(e) => return Err(e.into()),
        };

        let mut result = GeoLookup::default();
        if let Some(country) = city.country {
            result.country = country.iso_code.unwrap_or_default().to_string();
        }
        if let Some(location) = city.location {
            result.latitude = location.latitude.unwrap_or_default();
            result.longitude = location.longitude.unwrap_or_default();
        }
        result.subdivision = city
            .subdivisions
            .and_then(|subs| subs.into_iter().next())
            .and_then(|sub| sub.names)
            .and_then(|names| names.get("en").copied())
            .unwrap_or_default()
            .to_string();
        result.city = city
            .city
            .and_then(|c| c.names)
            .and_then(|names| names.get("en").copied())
            .unwrap_or_default()
            .to_string();

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn open_missing_file_fails() {
        let result = GeoIpReader::open(&PathBuf::from("/non/existent/geoip.mmdb"));
        assert!(matches!(result, Err(GeoIpError::DatabaseOpenError(_))));
    }

    #[test]
    fn default_lookup_is_empty() {
        let lookup = GeoLookup::default();
        assert_eq!(lookup.country, "");
        assert_eq!(lookup.subdivision, "");
        assert_eq!(lookup.city, "");
        assert_eq!(lookup.latitude, 0.0);
        assert_eq!(lookup.longitude, 0.0);
    }
}
