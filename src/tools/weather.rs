//! get_weather：OpenWeather 地理编码 + 当前天气
//!
//! 先用 geo/1.0/direct 把地名解析为坐标，再查 data/2.5/weather。
//! 未配置 API Key、地名无法解析、上游非 2xx 均作为调用失败返回。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::tools::http::{build_client, get_text, str_arg, DEFAULT_USER_AGENT};
use crate::tools::{Capability, CapabilityDescriptor, FieldSpec, FieldType, ValueKind};

const GEOCODING_URL: &str = "https://api.openweathermap.org/geo/1.0/direct";
const WEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Deserialize)]
struct GeoHit {
    name: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    name: String,
    #[serde(default)]
    sys: Option<Sys>,
    main: MainBlock,
    #[serde(default)]
    weather: Vec<Condition>,
    #[serde(default)]
    wind: Option<Wind>,
    #[serde(default)]
    visibility: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Sys {
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
    feels_like: f64,
    humidity: u64,
    pressure: u64,
}

#[derive(Debug, Deserialize)]
struct Condition {
    main: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: f64,
}

pub struct WeatherCapability {
    client: Client,
    api_key: Option<String>,
    default_units: String,
}

impl WeatherCapability {
    pub fn new(api_key: Option<String>, default_units: &str, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout, DEFAULT_USER_AGENT),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            default_units: default_units.to_string(),
        }
    }

    async fn geocode(&self, api_key: &str, location: &str) -> Result<GeoHit, String> {
        let body = get_text(
            &self.client,
            GEOCODING_URL,
            &[
                ("q", location.to_string()),
                ("limit", "1".to_string()),
                ("appid", api_key.to_string()),
            ],
        )
        .await?;
        first_geo_hit(&body, location)
    }
}

fn first_geo_hit(body: &str, location: &str) -> Result<GeoHit, String> {
    let hits: Vec<GeoHit> =
        serde_json::from_str(body).map_err(|e| format!("Invalid geocoding response: {}", e))?;
    hits.into_iter()
        .next()
        .ok_or_else(|| format!("Location '{}' not found.", location))
}

fn unit_symbols(units: &str) -> (&'static str, &'static str) {
    match units {
        "metric" => ("°C", "m/s"),
        "imperial" => ("°F", "mph"),
        _ => ("K", "m/s"),
    }
}

/// 把天气响应整理为结构化结果，summary 为可直接展示的文本
fn format_weather(body: &str, hit: &GeoHit, units: &str) -> Result<Value, String> {
    let w: WeatherResponse =
        serde_json::from_str(body).map_err(|e| format!("Invalid weather response: {}", e))?;
    let (temp_unit, wind_unit) = unit_symbols(units);
    let country = w
        .sys
        .and_then(|s| s.country)
        .or_else(|| hit.country.clone())
        .unwrap_or_default();
    let (condition, description) = w
        .weather
        .first()
        .map(|c| (c.main.clone(), c.description.clone()))
        .unwrap_or_else(|| ("Unknown".to_string(), String::new()));
    let wind = w.wind.map(|x| x.speed);
    let place = if country.is_empty() {
        w.name.clone()
    } else {
        format!("{}, {}", w.name, country)
    };

    let summary = format!(
        "Weather for {place}: {temp}{tu} (feels like {feels}{tu}), {condition} - {description}. \
         Humidity {humidity}%, wind {wind} {wu}, pressure {pressure} hPa, visibility {vis}.",
        place = place,
        temp = w.main.temp,
        tu = temp_unit,
        feels = w.main.feels_like,
        condition = condition,
        description = description,
        humidity = w.main.humidity,
        wind = wind.map(|s| s.to_string()).unwrap_or_else(|| "N/A".into()),
        wu = wind_unit,
        pressure = w.main.pressure,
        vis = w
            .visibility
            .map(|v| format!("{} m", v))
            .unwrap_or_else(|| "N/A".into()),
    );

    Ok(json!({
        "location": w.name,
        "country": country,
        "latitude": hit.lat,
        "longitude": hit.lon,
        "temperature": w.main.temp,
        "feels_like": w.main.feels_like,
        "condition": condition,
        "description": description,
        "humidity": w.main.humidity,
        "wind_speed": wind,
        "units": units,
        "summary": summary,
        "chain": hit.name,
    }))
}

#[async_trait]
impl Capability for WeatherCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "get_weather",
            "Get current weather information for a specified location. Useful for weather forecasts, temperature and current conditions.",
            ValueKind::Weather,
        )
        .field(
            "location",
            FieldSpec::required(FieldType::String, "City name or location to get weather for")
                .accepts(ValueKind::Location),
        )
        .field(
            "units",
            FieldSpec::optional(
                FieldType::String,
                json!(self.default_units),
                "Temperature units: metric (Celsius), imperial (Fahrenheit), or standard (Kelvin)",
            ),
        )
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "Weather API key not configured. Set OPENWEATHER_API_KEY.".to_string())?;
        let location = str_arg(&args, "location")?;
        let units = args
            .get("units")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.default_units)
            .to_lowercase();

        let hit = self.geocode(api_key, location).await?;
        let body = get_text(
            &self.client,
            WEATHER_URL,
            &[
                ("lat", hit.lat.to_string()),
                ("lon", hit.lon.to_string()),
                ("appid", api_key.to_string()),
                ("units", units.clone()),
            ],
        )
        .await?;
        format_weather(&body, &hit, &units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKYO_WEATHER: &str = r#"{
        "name": "Tokyo",
        "sys": {"country": "JP"},
        "main": {"temp": 21.5, "feels_like": 20.9, "humidity": 60, "pressure": 1012},
        "weather": [{"main": "Clouds", "description": "scattered clouds"}],
        "wind": {"speed": 3.6},
        "visibility": 10000
    }"#;

    #[test]
    fn test_empty_geocoding_is_not_found() {
        let err = first_geo_hit("[]", "Zzzznotaplace").unwrap_err();
        assert_eq!(err, "Location 'Zzzznotaplace' not found.");
    }

    #[test]
    fn test_format_weather_metric() {
        let hit = first_geo_hit(r#"[{"name":"Tokyo","lat":35.68,"lon":139.76,"country":"JP"}]"#, "Tokyo").unwrap();
        let out = format_weather(TOKYO_WEATHER, &hit, "metric").unwrap();
        assert_eq!(out["location"], "Tokyo");
        assert_eq!(out["temperature"], 21.5);
        let summary = out["summary"].as_str().unwrap();
        assert!(summary.contains("Tokyo, JP"));
        assert!(summary.contains("21.5°C"));
        assert!(summary.contains("scattered clouds"));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_without_network() {
        let cap = WeatherCapability::new(None, "metric", Duration::from_secs(1));
        let mut args = Map::new();
        args.insert("location".into(), json!("Tokyo"));
        let err = cap.invoke(args).await.unwrap_err();
        assert!(err.contains("API key"));
    }
}
