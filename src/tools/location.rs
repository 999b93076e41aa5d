//! location_search / calculate_distance：基于 Nominatim 的地理编码
//!
//! 距离用 haversine 大圆距离（地球平均半径 6371.0088 km）。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::tools::http::{build_client, get_text, str_arg, usize_arg};
use crate::tools::{Capability, CapabilityDescriptor, FieldSpec, FieldType, ValueKind};

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const EARTH_RADIUS_KM: f64 = 6371.0088;
const KM_PER_MILE: f64 = 1.609_344;

#[derive(Debug, Clone, Deserialize)]
struct Place {
    #[serde(deserialize_with = "de_coord")]
    lat: f64,
    #[serde(deserialize_with = "de_coord")]
    lon: f64,
    display_name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    address: Map<String, Value>,
}

impl Place {
    fn address_field(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.address.get(*k).and_then(|v| v.as_str()))
            .map(str::to_string)
    }

    /// display_name 的首段，作为下游步骤的地名
    fn short_name(&self) -> String {
        self.display_name
            .split(',')
            .next()
            .unwrap_or(&self.display_name)
            .trim()
            .to_string()
    }
}

/// Nominatim 的坐标是字符串，也兼容数字
fn de_coord<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Coord {
        Num(f64),
        Text(String),
    }
    match Coord::deserialize(deserializer)? {
        Coord::Num(n) => Ok(n),
        Coord::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn parse_places(body: &str) -> Result<Vec<Place>, String> {
    serde_json::from_str(body).map_err(|e| format!("Invalid geocoding response: {}", e))
}

/// 大圆距离（km）
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Nominatim 客户端，两个能力共用
#[derive(Clone)]
pub struct Geocoder {
    client: Client,
}

impl Geocoder {
    pub fn new(timeout: Duration, user_agent: &str) -> Self {
        Self {
            client: build_client(timeout, user_agent),
        }
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Place>, String> {
        let body = get_text(
            &self.client,
            NOMINATIM_URL,
            &[
                ("q", query.to_string()),
                ("format", "jsonv2".to_string()),
                ("addressdetails", "1".to_string()),
                ("limit", limit.to_string()),
            ],
        )
        .await?;
        parse_places(&body)
    }

    async fn first(&self, query: &str) -> Result<Place, String> {
        self.search(query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| format!("Could not find location: {}", query))
    }
}

pub struct LocationSearchCapability {
    geocoder: Geocoder,
}

impl LocationSearchCapability {
    pub fn new(geocoder: Geocoder) -> Self {
        Self { geocoder }
    }
}

fn format_places(query: &str, places: &[Place]) -> Result<Value, String> {
    let best = places
        .first()
        .ok_or_else(|| format!("No location found for '{}'", query))?;
    let results: Vec<Value> = places
        .iter()
        .map(|p| {
            json!({
                "name": p.display_name,
                "latitude": p.lat,
                "longitude": p.lon,
                "type": p.kind.clone().unwrap_or_else(|| "location".into()),
                "country": p.address_field(&["country"]),
                "city": p.address_field(&["city", "town", "village"]),
                "postcode": p.address_field(&["postcode"]),
            })
        })
        .collect();
    let summary = places
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}. {} ({:.6}, {:.6})", i + 1, p.display_name, p.lat, p.lon))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(json!({
        "query": query,
        "results": results,
        "summary": summary,
        "chain": best.short_name(),
    }))
}

#[async_trait]
impl Capability for LocationSearchCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "location_search",
            "Search for location information and coordinates of an address, city or landmark. Useful for geography and navigation queries.",
            ValueKind::Location,
        )
        .field(
            "query",
            FieldSpec::required(FieldType::String, "Location query (address, city, landmark)")
                .accepts(ValueKind::Text),
        )
        .field(
            "max_results",
            FieldSpec::optional(FieldType::Integer, json!(3), "Maximum number of matches"),
        )
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
        let query = str_arg(&args, "query")?;
        let limit = usize_arg(&args, "max_results", 3).clamp(1, 10);
        let places = self.geocoder.search(query, limit).await?;
        format_places(query, &places)
    }
}

pub struct DistanceCapability {
    geocoder: Geocoder,
}

impl DistanceCapability {
    pub fn new(geocoder: Geocoder) -> Self {
        Self { geocoder }
    }
}

fn format_distance(from: &Place, to: &Place) -> Value {
    let km = haversine_km((from.lat, from.lon), (to.lat, to.lon));
    let miles = km / KM_PER_MILE;
    json!({
        "from": from.display_name,
        "to": to.display_name,
        "kilometers": (km * 100.0).round() / 100.0,
        "miles": (miles * 100.0).round() / 100.0,
        "summary": format!(
            "Distance from {} to {}: {:.2} km ({:.2} miles)",
            from.display_name, to.display_name, km, miles
        ),
    })
}

#[async_trait]
impl Capability for DistanceCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "calculate_distance",
            "Calculate the distance between two locations. Useful for travel planning and geography questions.",
            ValueKind::Distance,
        )
        .field(
            "location1",
            FieldSpec::required(FieldType::String, "First location").accepts(ValueKind::Location),
        )
        .field(
            "location2",
            FieldSpec::required(FieldType::String, "Second location").accepts(ValueKind::Location),
        )
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
        let a = str_arg(&args, "location1")?;
        let b = str_arg(&args, "location2")?;
        let (from, to) = futures_util::try_join!(self.geocoder.first(a), self.geocoder.first(b))?;
        Ok(format_distance(&from, &to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARIS: &str = r#"[{"lat":"48.8588897","lon":"2.3200410","display_name":"Paris, Ile-de-France, France","type":"city","address":{"city":"Paris","country":"France","postcode":"75001"}}]"#;
    const LONDON: &str = r#"[{"lat":51.5073219,"lon":-0.1276474,"display_name":"London, Greater London, England, United Kingdom","type":"city","address":{"country":"United Kingdom"}}]"#;

    #[test]
    fn test_parse_string_and_numeric_coords() {
        let paris = parse_places(PARIS).unwrap();
        let london = parse_places(LONDON).unwrap();
        assert!((paris[0].lat - 48.8588897).abs() < 1e-9);
        assert!((london[0].lon + 0.1276474).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_paris_london() {
        let km = haversine_km((48.8566, 2.3522), (51.5074, -0.1278));
        assert!((km - 343.5).abs() < 2.0, "got {}", km);
        assert_eq!(haversine_km((10.0, 10.0), (10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_format_places_chain_is_short_name() {
        let places = parse_places(PARIS).unwrap();
        let out = format_places("Paris", &places).unwrap();
        assert_eq!(out["chain"], "Paris");
        assert_eq!(out["results"][0]["city"], "Paris");
        assert!(format_places("Nowhere", &[]).unwrap_err().contains("Nowhere"));
    }

    #[test]
    fn test_format_distance_rounds() {
        let paris = parse_places(PARIS).unwrap().remove(0);
        let london = parse_places(LONDON).unwrap().remove(0);
        let out = format_distance(&paris, &london);
        let km = out["kilometers"].as_f64().unwrap();
        assert!(km > 330.0 && km < 350.0);
        assert!(out["summary"].as_str().unwrap().contains("miles"));
    }
}
