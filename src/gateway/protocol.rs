//! Semtech UDP Packet Forwarder Protocol (GWMP).
//!
//! Reference: <https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT>
//!
//! Grounded on the teacher's `src/udp/protocol.rs` for the `bytes`-based
//! header framing, extended with the `Txpk`/`Stat` JSON shapes from
//! `original_source/floranet/lora_gateway.py` and the PUSH_ACK/PULL_ACK/
//! PULL_RESP variants that crate needed but didn't yet model.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

pub type GatewayEui = [u8; 8];

#[derive(Debug)]
pub enum GwmpPacket {
    PushData {
        random_token: u16,
        gateway_eui: GatewayEui,
        json_payload: String,
    },
    PullData {
        random_token: u16,
        gateway_eui: GatewayEui,
    },
    TxAck {
        random_token: u16,
        gateway_eui: GatewayEui,
        json_payload: Option<String>,
    },
}

/// Received packet metadata, reported inside a PUSH_DATA's `rxpk` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    pub time: Option<String>,
    pub tmst: Option<u64>,
    pub tmms: Option<u64>,
    pub chan: Option<u8>,
    pub rfch: Option<u8>,
    pub freq: f64,
    pub lsnr: Option<f64>,
    pub rssi: f64,
    pub modu: Option<String>,
    pub datr: String,
    pub codr: Option<String>,
    pub size: u16,
    pub data: String,
}

/// A gateway status report, sent as the `stat` object alongside `rxpk`.
/// Grounded on floranet `Stat.decode` — kept for admin visibility/logging,
/// no behavioral effect on the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stat {
    pub time: Option<String>,
    pub lati: Option<f64>,
    pub long: Option<f64>,
    pub alti: Option<i32>,
    pub rxnb: Option<u32>,
    pub rxok: Option<u32>,
    pub rxfw: Option<u32>,
    pub ackr: Option<f64>,
    pub dwnb: Option<u32>,
    pub txnb: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Option<Vec<Rxpk>>,
    pub stat: Option<Stat>,
}

/// Transmit packet, for scheduling a downlink via PULL_RESP. Preserves a
/// fixed field order in the JSON the way floranet's `OrderedDict`-backed
/// `Txpk.json()` does (several Semtech forwarders parse positionally, so
/// real deployments depend on this — see DESIGN.md's Open Question note).
#[derive(Debug, Clone, Serialize)]
pub struct Txpk {
    pub imme: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    pub freq: f64,
    pub rfch: u8,
    pub powe: u8,
    pub modu: &'static str,
    pub datr: String,
    pub codr: &'static str,
    pub ipol: bool,
    pub size: u16,
    pub data: String,
    pub ncrc: bool,
}

#[derive(Debug, Serialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

impl GwmpPacket {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Packet too short: {} bytes", data.len()));
        }

        let mut buf = &data[..];

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!("Unsupported protocol version: 0x{:02x}", version));
        }

        let random_token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        match packet_type {
            PacketType::PushData => {
                if buf.remaining() < 8 {
                    return Err(anyhow::anyhow!("PUSH_DATA too short for gateway EUI"));
                }
                let mut gateway_eui = [0u8; 8];
                buf.copy_to_slice(&mut gateway_eui);

                let json_payload = String::from_utf8(buf.to_vec())
                    .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in JSON payload: {}", e))?;

                Ok(GwmpPacket::PushData {
                    random_token,
                    gateway_eui,
                    json_payload,
                })
            }
            PacketType::PullData => {
                if buf.remaining() < 8 {
                    return Err(anyhow::anyhow!("PULL_DATA too short for gateway EUI"));
                }
                let mut gateway_eui = [0u8; 8];
                buf.copy_to_slice(&mut gateway_eui);

                Ok(GwmpPacket::PullData {
                    random_token,
                    gateway_eui,
                })
            }
            PacketType::TxAck => {
                if buf.remaining() < 8 {
                    return Err(anyhow::anyhow!("TX_ACK too short for gateway EUI"));
                }
                let mut gateway_eui = [0u8; 8];
                buf.copy_to_slice(&mut gateway_eui);

                let json_payload = if buf.has_remaining() {
                    Some(
                        String::from_utf8(buf.to_vec())
                            .map_err(|e| anyhow::anyhow!("Invalid UTF-8: {}", e))?,
                    )
                } else {
                    None
                };

                Ok(GwmpPacket::TxAck {
                    random_token,
                    gateway_eui,
                    json_payload,
                })
            }
            _ => Err(anyhow::anyhow!("Unexpected packet type for parsing: {:?}", packet_type)),
        }
    }

    pub fn push_ack(random_token: u16) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(random_token);
        buf.put_u8(PacketType::PushAck as u8);
        buf.to_vec()
    }

    pub fn pull_ack(random_token: u16) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(random_token);
        buf.put_u8(PacketType::PullAck as u8);
        buf.to_vec()
    }

    pub fn pull_resp(random_token: u16, json_payload: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + json_payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(random_token);
        buf.put_u8(PacketType::PullResp as u8);
        buf.put_slice(json_payload.as_bytes());
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_parses_rxpk_and_stat() {
        let mut data = vec![PROTOCOL_VERSION, 0x12, 0x34, PacketType::PushData as u8];
        data.extend_from_slice(&[0xAA; 8]);
        data.extend_from_slice(br#"{"rxpk":[{"freq":902.3,"rssi":-80.0,"datr":"SF7BW125","size":10,"data":"AQIDBA=="}]}"#);

        let parsed = GwmpPacket::parse(&data).unwrap();
        match parsed {
            GwmpPacket::PushData { json_payload, .. } => {
                let payload: PushDataPayload = serde_json::from_str(&json_payload).unwrap();
                assert_eq!(payload.rxpk.unwrap().len(), 1);
            }
            _ => panic!("expected PushData"),
        }
    }

    #[test]
    fn ack_round_trips_token() {
        let ack = GwmpPacket::push_ack(0xBEEF);
        assert_eq!(ack[0], PROTOCOL_VERSION);
        assert_eq!(ack[3], PacketType::PushAck as u8);
    }
}
