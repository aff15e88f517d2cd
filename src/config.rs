use std::time::Duration;

use bluest::Uuid;

/// How the client polls and how hard it tries to stay connected.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time between two polling cycles
    pub poll_interval: Duration,
    /// Upper bound for a single command write
    pub write_timeout: Duration,
    /// How long a one-shot query waits for its response notification
    pub response_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            write_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Retries after an unexpected disconnect. The initial connect is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Consecutive failed attempts after which the client gives up
    pub max_retries: u32,
    /// Upper bound for one connect attempt, discovery and subscription included
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            max_retries: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Where to find the BMS over Bluetooth Low Energy.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Advertised name to match. `None` takes the first device offering the BMS service.
    pub device_name: Option<String>,
    pub service_uuid: Uuid,
    pub notify_characteristic_uuid: Uuid,
    pub write_characteristic_uuid: Uuid,
    pub discovery_timeout: Duration,
    /// Notification buffers held between the radio and the session
    pub notification_capacity: usize,
}

impl BleConfig {
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
    pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
    pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            service_uuid: Self::SERVICE_UUID,
            notify_characteristic_uuid: Self::NOTIFY_CHARACTERISTIC_UUID,
            write_characteristic_uuid: Self::WRITE_CHARACTERISTIC_UUID,
            discovery_timeout: Duration::from_secs(30),
            notification_capacity: 64,
        }
    }
}
