//! Data model rows shared by the engine, the persistence façade, and the
//! admin REST surface.
//!
//! Grounded on `original_source/floranet/models/*.py` (`device.py`,
//! `application.py`, `gateway.py`, `appinterface.py`, `appproperty.py`),
//! translated from Twisted/twistar's row objects into plain serde structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Frequency plan selector for a deployment. One server instance serves one
/// band — matches floranet's single `freqband` config option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreqBand {
    US915,
    AU915,
    EU868,
}

/// The singleton server configuration row (spec §3 `Config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub listen: IpAddr,
    pub port: u16,
    pub webport: u16,
    pub apitoken: String,
    pub freqband: FreqBand,
    /// 24-bit network id.
    pub netid: u32,
    /// Start of the OTAA DevAddr allocation range (inclusive).
    pub otaastart: u32,
    /// End of the OTAA DevAddr allocation range (inclusive).
    pub otaaend: u32,
    /// Seconds within which a repeated (gateway, MIC) pair is a duplicate.
    pub duplicateperiod: u32,
    /// Relax frame-counter checking (resync on fcntup <= 1).
    pub fcrelaxed: bool,
    /// Queue MAC commands instead of sending them immediately.
    pub macqueueing: bool,
    /// Maximum age, in seconds, a queued MAC command may reach before eviction.
    pub macqueuelimit: u32,
    pub adrenable: bool,
    pub adrmargin: i32,
    /// Minimum seconds between ADR control cycles.
    pub adrcycletime: u32,
    /// Minimum seconds between ADR-triggering uplinks from the same device.
    pub adrmessagetime: u32,
}

impl Config {
    /// Mirrors floranet's `Config.check()` — every invariant spec §3 names.
    pub fn check(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.port == 0 || self.webport == 0 {
            return Err("port and webport must be in 1..65535".into());
        }
        if self.netid > 0xFF_FFFF {
            return Err("netid must fit in 24 bits".into());
        }
        if self.otaaend <= self.otaastart {
            return Err("otaaend must be greater than otaastart".into());
        }
        if self.duplicateperiod == 0 || self.duplicateperiod > 60 {
            return Err("duplicateperiod must be in 1..=60".into());
        }
        if self.macqueueing && !(60..=86_400).contains(&self.macqueuelimit) {
            return Err("macqueuelimit must be in 60..=86400".into());
        }
        if self.adrcycletime < 60 {
            return Err("adrcycletime must be >= 60".into());
        }
        if self.adrmessagetime < 1 {
            return Err("adrmessagetime must be >= 1".into());
        }
        Ok(())
    }

    pub fn defaults() -> Self {
        Self {
            name: "floranet".to_string(),
            listen: "0.0.0.0".parse().unwrap(),
            port: 1700,
            webport: 8080,
            apitoken: String::new(),
            freqband: FreqBand::US915,
            netid: 0x00,
            otaastart: 0x0000_0001,
            otaaend: 0x0000_00FF,
            duplicateperiod: 5,
            fcrelaxed: true,
            macqueueing: false,
            macqueuelimit: 300,
            adrenable: false,
            adrmargin: 0,
            adrcycletime: 90,
            adrmessagetime: 30,
        }
    }
}

/// An application: a collection of devices sharing an AppEUI/AppKey and
/// dispatching to one `AppInterface`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub app_eui: u64,
    /// Root key used for OTAA join MIC check and session-key derivation.
    pub app_key: [u8; 16],
    /// Default FPort for outbound application messages, if fixed.
    pub fport: Option<u8>,
    pub appinterface_id: Option<i64>,
    /// Devices that have completed an ABP/OTAA join under this application.
    pub domain: Option<String>,
}

impl Application {
    pub fn valid(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("application name must not be empty".into());
        }
        if let Some(p) = self.fport {
            if p == 0 || p > 223 {
                return Err("fport must be in 1..=223".into());
            }
        }
        Ok(())
    }
}

/// A typed property of an application payload (spec §3 `AppProperty`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppProperty {
    pub id: i64,
    pub application_id: i64,
    pub name: String,
    pub port: u8,
    pub ptype: PropertyType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Boolean,
}

impl AppProperty {
    pub fn valid(&self) -> Result<(), String> {
        if self.port == 0 || self.port > 223 {
            return Err("AppProperty port must be in 1..=223".into());
        }
        Ok(())
    }

    /// Decode the typed scalar out of raw FRMPayload bytes, floranet
    /// `AppProperty.value()` equivalent. Returns `None` if there are not
    /// enough bytes for the declared type.
    pub fn value(&self, payload: &[u8]) -> Option<PropertyValue> {
        use PropertyType::*;
        let need = match self.ptype {
            Int8 | Uint8 | Boolean => 1,
            Int16 | Uint16 => 2,
            Int32 | Uint32 | Float32 => 4,
        };
        if payload.len() < need {
            return None;
        }
        let bytes = &payload[..need];
        Some(match self.ptype {
            Int8 => PropertyValue::Int(bytes[0] as i8 as i64),
            Uint8 => PropertyValue::Uint(bytes[0] as u64),
            Boolean => PropertyValue::Boolean(bytes[0] != 0),
            Int16 => PropertyValue::Int(i16::from_le_bytes(bytes.try_into().unwrap()) as i64),
            Uint16 => PropertyValue::Uint(u16::from_le_bytes(bytes.try_into().unwrap()) as u64),
            Int32 => PropertyValue::Int(i32::from_le_bytes(bytes.try_into().unwrap()) as i64),
            Uint32 => PropertyValue::Uint(u32::from_le_bytes(bytes.try_into().unwrap()) as u64),
            Float32 => PropertyValue::Float(f32::from_le_bytes(bytes.try_into().unwrap()) as f64),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Boolean(bool),
}

/// A registered device, OTAA or ABP (spec §3/§4.4 `Device`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub dev_eui: u64,
    pub dev_addr: u32,
    pub application_id: i64,
    pub name: String,
    /// `true` for OTAA devices, `false` for ABP (statically provisioned keys).
    pub otaa: bool,
    pub enabled: bool,
    pub devclass: DeviceClass,
    pub dev_nonces: Vec<u16>,
    pub nwk_s_key: [u8; 16],
    pub app_s_key: [u8; 16],
    pub fcntup: u32,
    pub fcntdown: u32,
    pub fcnt_error: bool,
    pub adr_enable: bool,
    /// Datarate name most recently suggested by the ADR control loop.
    pub adr_datr: Option<String>,
    /// Uplink channel index of the device's most recent accepted frame.
    pub tx_chan: Option<u8>,
    /// Datarate name of the device's most recent accepted frame.
    pub tx_datr: Option<String>,
    /// Gateway timestamp (`rxpk.tmst`) of the device's most recent accepted frame.
    pub tmst: Option<u32>,
    pub app_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Ring buffer of the last 11 uplink SNR samples, oldest first.
    pub snr_history: Vec<f64>,
    /// Host of the gateway that delivered the device's most recent accepted
    /// frame — keys into `Gateway.host`, not an IP address, since a device
    /// may roam across gateways sharing one backhaul address.
    pub gw_addr: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeviceClass {
    #[default]
    A,
    C,
}

impl Device {
    pub fn valid(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("device name must not be empty".into());
        }
        Ok(())
    }

    pub fn is_class_a(&self) -> bool {
        self.devclass == DeviceClass::A
    }
}

/// A GWMP-speaking gateway (spec §3/§4.5 `Gateway`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: i64,
    pub host: String,
    pub eui: [u8; 8],
    pub name: String,
    pub power: i32,
    pub enabled: bool,
    pub gw_addr: Option<IpAddr>,
    /// UDP port learned from the gateway's most recent PULL_DATA.
    pub gw_port: Option<u16>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Gateway {
    pub fn valid(&self) -> Result<(), String> {
        if !(0..=30).contains(&self.power) {
            return Err("gateway power must be in 0..=30".into());
        }
        Ok(())
    }
}

/// The closed set of application-facing adapters (spec §9 "Polymorphic
/// adapters"). Modeled as a tagged enum, not dynamically loaded code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInterface {
    pub id: i64,
    pub name: String,
    pub kind: AppInterfaceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AppInterfaceKind {
    Reflector,
    FileTextStore { path: String },
    AzureIotHttps {
        hostname: String,
        device_id: String,
        shared_access_key: String,
    },
    AzureIotMqtt {
        hostname: String,
        device_id: String,
        shared_access_key: String,
    },
}
