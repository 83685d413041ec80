use serde::{Deserialize, Serialize};

use crate::{
    enforcement::{ApplyPolicy, DEFAULT_ENFORCEMENT_PERIOD_MS},
    mux::MuxVariant,
    topics::TOPIC_MUX_COMMAND,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    /// mDNS host name; the portal is reachable at `<hostname>.local`.
    pub hostname: String,
    pub instance_name: String,
    pub service_instance: String,
    pub http_port: u16,
    pub setup_ap_ssid: String,
    pub setup_ap_channel: u8,
    pub setup_ap_max_connections: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: "hdmi-mux".to_string(),
            instance_name: "HDMI MUX Web Interface".to_string(),
            service_instance: "HDMI MUX WebServer".to_string(),
            http_port: 80,
            setup_ap_ssid: "ESP32_Config".to_string(),
            setup_ap_channel: 1,
            setup_ap_max_connections: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MuxPins {
    pub enable: i32,
    pub select1: i32,
    pub select2: i32,
}

impl Default for MuxPins {
    fn default() -> Self {
        Self {
            enable: 8,
            select1: 2,
            select2: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MuxConfig {
    #[serde(default)]
    pub variant: MuxVariant,
    #[serde(default)]
    pub apply_policy: ApplyPolicy,
    pub enforcement_period_ms: u64,
    #[serde(default)]
    pub pins: MuxPins,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            variant: MuxVariant::default(),
            apply_policy: ApplyPolicy::default(),
            enforcement_period_ms: DEFAULT_ENFORCEMENT_PERIOD_MS,
            pins: MuxPins::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub command_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "mqtt.flespi.io".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "hdmi-mux".to_string(),
            command_topic: TOPIC_MUX_COMMAND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.mux.sanitize();
        self.mqtt.sanitize();
        self.device.sanitize();
    }
}

impl MuxConfig {
    pub fn sanitize(&mut self) {
        self.enforcement_period_ms = self.enforcement_period_ms.clamp(1_000, 60_000);

        let pins = &self.pins;
        let distinct = pins.enable != pins.select1
            && pins.enable != pins.select2
            && pins.select1 != pins.select2;
        if !distinct || pins.enable < 0 || pins.select1 < 0 || pins.select2 < 0 {
            self.pins = MuxPins::default();
        }
    }
}

impl MqttConfig {
    pub fn sanitize(&mut self) {
        if self.port == 0 {
            self.port = 1883;
        }
        if self.command_topic.trim().is_empty() {
            self.command_topic = TOPIC_MUX_COMMAND.to_string();
        }
        if self.host.trim().is_empty() {
            self.enabled = false;
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.hostname.trim().is_empty() {
            self.hostname = defaults.hostname;
        }
        if self.setup_ap_ssid.is_empty() || self.setup_ap_ssid.len() > 32 {
            self.setup_ap_ssid = defaults.setup_ap_ssid;
        }
        if !(1..=13).contains(&self.setup_ap_channel) {
            self.setup_ap_channel = defaults.setup_ap_channel;
        }
        self.setup_ap_max_connections = self.setup_ap_max_connections.clamp(1, 4);
        if self.http_port == 0 {
            self.http_port = defaults.http_port;
        }
    }
}
