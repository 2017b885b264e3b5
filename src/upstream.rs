// Client for the external route-data provider.
//
// Endpoints:
// - Route list:   GET {base}/api/route/list?city=..&vehicle_type=..   (X-Api-Token header)
// - Route detail: GET {base}/api/route/{route_id}?city=..&vehicle_type=..   (Bearer token)

use std::future::Future;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::models::{RawFeature, RawRoute, RouteDetailResponse, RouteListResponse};

#[derive(Debug, Error)]
pub enum UpstreamUnavailable {
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API returned error: {0}")]
    Status(StatusCode),
    #[error("Invalid response body: {0}")]
    Malformed(String),
}

/// Where the cache gets raw catalog data from.
pub trait RouteSource: Send + Sync {
    fn fetch_routes(&self) -> impl Future<Output = Result<Vec<RawRoute>, UpstreamUnavailable>> + Send;

    fn fetch_stops(
        &self,
        route_id: &str,
    ) -> impl Future<Output = Result<Vec<RawFeature>, UpstreamUnavailable>> + Send;
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    city: String,
    vehicle_type: String,
}

impl UpstreamClient {
    const REQUEST_TIMEOUT_SECS: u64 = 5;

    pub fn new(config: &Config) -> Result<Self, UpstreamUnavailable> {
        let base_url = Url::parse(&config.api_base_url)
            .map_err(|e| UpstreamUnavailable::InvalidUrl(format!("{}: {}", config.api_base_url, e)))?;

        if base_url.cannot_be_a_base() {
            return Err(UpstreamUnavailable::InvalidUrl(config.api_base_url.clone()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base_url,
            token: config.api_token.clone(),
            city: config.api_city.clone(),
            vehicle_type: config.api_vehicle_type.clone(),
        })
    }

    pub async fn fetch_routes_for(
        &self,
        city: &str,
        vehicle_type: &str,
    ) -> Result<Vec<RawRoute>, UpstreamUnavailable> {
        let url = self.endpoint(&["api", "route", "list"])?;
        debug!(%url, city, vehicle_type, "Fetching routes from upstream");

        let request = self
            .http
            .get(url)
            .query(&[("city", city), ("vehicle_type", vehicle_type)])
            .header("X-Api-Token", &self.token);

        let body: RouteListResponse = Self::send(request).await?;
        Ok(body.routes)
    }

    pub async fn fetch_stops_for(
        &self,
        route_id: &str,
        city: &str,
        vehicle_type: &str,
    ) -> Result<Vec<RawFeature>, UpstreamUnavailable> {
        let url = self.endpoint(&["api", "route", route_id])?;
        debug!(%url, route_id, city, vehicle_type, "Fetching stops from upstream");

        let request = self
            .http
            .get(url)
            .query(&[("city", city), ("vehicle_type", vehicle_type)])
            .bearer_auth(&self.token);

        let body: RouteDetailResponse = Self::send(request).await?;
        Ok(body.features)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, UpstreamUnavailable> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamUnavailable::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, UpstreamUnavailable> {
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(UpstreamUnavailable::Status(response.status()));
        }

        let body = response.text().await?;

        serde_json::from_str(&body).map_err(|e| UpstreamUnavailable::Malformed(e.to_string()))
    }
}

impl RouteSource for UpstreamClient {
    async fn fetch_routes(&self) -> Result<Vec<RawRoute>, UpstreamUnavailable> {
        self.fetch_routes_for(&self.city, &self.vehicle_type).await
    }

    async fn fetch_stops(&self, route_id: &str) -> Result<Vec<RawFeature>, UpstreamUnavailable> {
        self.fetch_stops_for(route_id, &self.city, &self.vehicle_type)
            .await
    }
}
