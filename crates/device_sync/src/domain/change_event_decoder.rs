use chrono::{DateTime, Utc};
use common::domain::{ChangeEvent, Device, DomainError, DomainResult, RoomFields, RoomTemperatureSample};
use serde_json::Value;

pub const ROOMS_TABLE: &str = "rooms";
pub const DEVICES_TABLE: &str = "devices";
pub const TEMPERATURE_TABLE: &str = "temperature_data";

/// Turns raw change-feed payloads into typed [`ChangeEvent`]s.
///
/// Payloads are JSON objects carrying `table`, `eventType`
/// (`INSERT`/`UPDATE`/`DELETE`), the `new` row and the `old` row. Deletes take
/// the identifier from `old`.
#[derive(Debug, Clone, Default)]
pub struct ChangeEventDecoder;

impl ChangeEventDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, payload: &[u8]) -> DomainResult<ChangeEvent> {
        let envelope: Value = serde_json::from_slice(payload)
            .map_err(|e| DomainError::DecodeError(format!("payload is not JSON: {e}")))?;

        let table = str_field(&envelope, "table")?;
        let event_type = str_field(&envelope, "eventType")?;

        match (table, event_type) {
            (DEVICES_TABLE, "INSERT") => Ok(ChangeEvent::DeviceInserted {
                device: device_from_row(row(&envelope, "new")?)?,
            }),
            (DEVICES_TABLE, "UPDATE") => Ok(ChangeEvent::DeviceUpdated {
                device: device_from_row(row(&envelope, "new")?)?,
            }),
            (DEVICES_TABLE, "DELETE") => Ok(ChangeEvent::DeviceDeleted {
                device_id: str_field(row(&envelope, "old")?, "device_id")?.to_string(),
            }),
            (ROOMS_TABLE, "INSERT") => {
                let (room_id, fields) = room_from_row(row(&envelope, "new")?)?;
                Ok(ChangeEvent::RoomInserted { room_id, fields })
            }
            (ROOMS_TABLE, "UPDATE") => {
                let (room_id, fields) = room_from_row(row(&envelope, "new")?)?;
                Ok(ChangeEvent::RoomUpdated { room_id, fields })
            }
            (ROOMS_TABLE, "DELETE") => Ok(ChangeEvent::RoomDeleted {
                room_id: str_field(row(&envelope, "old")?, "id")?.to_string(),
            }),
            (TEMPERATURE_TABLE, "INSERT" | "UPDATE") => Ok(ChangeEvent::TemperatureRecorded {
                sample: sample_from_row(row(&envelope, "new")?)?,
            }),
            (TEMPERATURE_TABLE, "DELETE") => Err(DomainError::DecodeError(
                "temperature samples are append-only, delete ignored".to_string(),
            )),
            (table, event_type) => Err(DomainError::DecodeError(format!(
                "unsupported change {event_type} on table {table}"
            ))),
        }
    }
}

fn row<'a>(envelope: &'a Value, key: &str) -> DomainResult<&'a Value> {
    envelope
        .get(key)
        .filter(|v| v.is_object())
        .ok_or_else(|| DomainError::DecodeError(format!("missing {key} row")))
}

fn str_field<'a>(data: &'a Value, key: &str) -> DomainResult<&'a str> {
    data.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DomainError::DecodeError(format!("missing {key}")))
}

fn device_from_row(data: &Value) -> DomainResult<Device> {
    let device_id = str_field(data, "device_id")?.to_string();
    let room_id = str_field(data, "room_id")?.to_string();
    // DB column is `type`, the dashboard shows it as the device label
    let device_type = str_field(data, "type")?.to_string();

    // image_url is nullable
    let image_url = data
        .get("image_url")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let is_on = data
        .get("is_on")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| DomainError::DecodeError("missing is_on".to_string()))?;

    Ok(Device {
        device_id,
        room_id,
        device_type,
        image_url,
        is_on,
    })
}

fn room_from_row(data: &Value) -> DomainResult<(String, RoomFields)> {
    let room_id = str_field(data, "id")?.to_string();
    let name = str_field(data, "name")?.to_string();
    let image_url = data
        .get("image_url")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Ok((room_id, RoomFields { name, image_url }))
}

fn sample_from_row(data: &Value) -> DomainResult<RoomTemperatureSample> {
    let room_id = str_field(data, "room_id")?.to_string();
    let temperature = number_field(data, "temperature")?;
    let humidity = number_field(data, "humidity")?;
    let recorded_at = parse_timestamp(str_field(data, "recorded_at")?)?;

    Ok(RoomTemperatureSample {
        room_id,
        temperature,
        humidity,
        recorded_at,
    })
}

/// Numeric columns may arrive as JSON numbers or as decimal strings
fn number_field(data: &Value, key: &str) -> DomainResult<f64> {
    match data.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| DomainError::DecodeError(format!("{key} out of range"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| DomainError::DecodeError(format!("invalid {key}: {e}"))),
        _ => Err(DomainError::DecodeError(format!("missing {key}"))),
    }
}

fn parse_timestamp(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::DecodeError(format!("invalid timestamp {s}: {e}")))
}
