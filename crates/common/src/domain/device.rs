use serde::{Deserialize, Serialize};

/// A controllable household device (light, fan, camera, LED strip, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub room_id: String,
    /// Type/name label shown on the dashboard ("Light 1", "Fan")
    pub device_type: String,
    pub image_url: String,
    pub is_on: bool,
}

impl Device {
    pub fn state(&self) -> DeviceState {
        DeviceState {
            device_type: self.device_type.clone(),
            image_url: self.image_url.clone(),
            is_on: self.is_on,
        }
    }

    pub fn with_state(&self, state: DeviceState) -> Self {
        Self {
            device_id: self.device_id.clone(),
            room_id: self.room_id.clone(),
            device_type: state.device_type,
            image_url: state.image_url,
            is_on: state.is_on,
        }
    }
}

/// The mutable fields of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_type: String,
    pub image_url: String,
    pub is_on: bool,
}

/// Input for creating a device. The identifier is chosen by the user and must
/// be unique across all rooms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDeviceInput {
    pub device_id: String,
    pub room_id: String,
    pub device_type: String,
    pub image_url: String,
}

impl From<CreateDeviceInput> for Device {
    fn from(input: CreateDeviceInput) -> Self {
        Self {
            device_id: input.device_id,
            room_id: input.room_id,
            device_type: input.device_type,
            image_url: input.image_url,
            is_on: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_state_keeps_identity() {
        let device = Device {
            device_id: "d1".to_string(),
            room_id: "office".to_string(),
            device_type: "Light".to_string(),
            image_url: "/img/light.png".to_string(),
            is_on: false,
        };

        let mut state = device.state();
        state.is_on = true;
        let updated = device.with_state(state);

        assert_eq!(updated.device_id, "d1");
        assert_eq!(updated.room_id, "office");
        assert!(updated.is_on);
    }

    #[test]
    fn test_created_devices_start_powered_off() {
        let device = Device::from(CreateDeviceInput {
            device_id: "fan-1".to_string(),
            room_id: "office".to_string(),
            device_type: "Fan".to_string(),
            image_url: String::new(),
        });
        assert!(!device.is_on);
    }
}
