//! Reverse geocoding (coordinate → postal address).
//!
//! Best-effort by contract: callers treat any error as "no address".

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::constants;
use crate::protocol::{Address, GeoPoint};

/// Turns a coordinate into an address.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync + std::fmt::Debug {
    /// Look up the address at `point`. `Ok(None)` when nothing is known there.
    async fn reverse(&self, point: GeoPoint) -> Result<Option<Address>>;
}

/// Geocoder that never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGeocoder;

#[async_trait]
impl ReverseGeocoder for NoopGeocoder {
    async fn reverse(&self, _point: GeoPoint) -> Result<Option<Address>> {
        Ok(None)
    }
}

/// Reverse geocoder backed by a Nominatim-compatible `/reverse` endpoint.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<NominatimAddress>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    house_number: Option<String>,
    road: Option<String>,
    suburb: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    state: Option<String>,
    postcode: Option<String>,
    country: Option<String>,
}

impl NominatimAddress {
    fn into_address(self) -> Address {
        let line1 = match (self.house_number, self.road) {
            (Some(number), Some(road)) => Some(format!("{number} {road}")),
            (None, Some(road)) => Some(road),
            (Some(number), None) => Some(number),
            (None, None) => None,
        };
        Address {
            line1,
            line2: self.suburb,
            city: self.city.or(self.town).or(self.village).or(self.hamlet),
            state: self.state,
            zip_code: self.postcode,
            country: self.country,
        }
    }
}

impl NominatimGeocoder {
    /// Geocoder against `base_url` (e.g. `https://nominatim.openstreetmap.org`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .user_agent(concat!("fleet-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build geocoder HTTP client")?;
        Ok(Self::with_client(client, base_url))
    }

    /// Geocoder using a pre-configured HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse(&self, point: GeoPoint) -> Result<Option<Address>> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", point.latitude.to_string()),
                ("lon", point.longitude.to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await
            .context("Reverse geocode request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Reverse geocode failed: {}", response.status());
        }

        let body: ReverseResponse = response
            .json()
            .await
            .context("Malformed reverse geocode response")?;

        if let Some(error) = body.error {
            log::debug!("[Tracking] No address at {point:?}: {error}");
            return Ok(None);
        }
        Ok(body.address.map(NominatimAddress::into_address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_nominatim_maps_address_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .and(query_param("format", "jsonv2"))
            .and(query_param("lat", "41.5"))
            .and(query_param("lon", "-87.25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "display_name": "ignored",
                "address": {
                    "house_number": "12",
                    "road": "Main Street",
                    "town": "Springfield",
                    "state": "Illinois",
                    "postcode": "62701",
                    "country": "United States"
                }
            })))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(server.uri()).unwrap();
        let address = geocoder
            .reverse(GeoPoint::new(41.5, -87.25))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(address.line1.as_deref(), Some("12 Main Street"));
        assert_eq!(address.line2, None);
        assert_eq!(address.city.as_deref(), Some("Springfield"));
        assert_eq!(address.state.as_deref(), Some("Illinois"));
        assert_eq!(address.zip_code.as_deref(), Some("62701"));
        assert_eq!(address.country.as_deref(), Some("United States"));
    }

    #[tokio::test]
    async fn test_nominatim_error_body_is_no_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "Unable to geocode" })),
            )
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(server.uri()).unwrap();
        assert_eq!(geocoder.reverse(GeoPoint::new(0.0, 0.0)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nominatim_http_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(server.uri()).unwrap();
        assert!(geocoder.reverse(GeoPoint::new(0.0, 0.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_noop_geocoder() {
        assert_eq!(NoopGeocoder.reverse(GeoPoint::new(1.0, 2.0)).await.unwrap(), None);
    }
}
