//! MAC commands carried in FOpts or as FRMPayload on FPort 0.
//!
//! Grounded on `original_source/floranet/lora/mac.py`'s `MACCommand` and
//! subclasses: `LinkCheckReq`/`LinkCheckAns`, `LinkADRReq`/`LinkADRAns`.
//! Unknown CIDs abort the decode of the remaining FOpts, matching the
//! original's `MACCommand.decode` returning `None` on an unrecognized CID.

#[derive(Debug, Clone, PartialEq)]
pub enum MacCommand {
    LinkCheckReq,
    LinkCheckAns { margin: u8, gw_cnt: u8 },
    LinkAdrReq {
        datarate: u8,
        tx_power: u8,
        ch_mask: u16,
        ch_mask_cntl: u8,
        nb_rep: u8,
    },
    LinkAdrAns {
        ch_mask_ack: bool,
        datarate_ack: bool,
        power_ack: bool,
    },
}

const CID_LINK_CHECK_REQ: u8 = 0x02;
const CID_LINK_CHECK_ANS: u8 = 0x02;
const CID_LINK_ADR_REQ: u8 = 0x03;
const CID_LINK_ADR_ANS: u8 = 0x03;

impl MacCommand {
    /// Decode a single command (uplink direction) starting at `data[0]`.
    /// Returns the command and the number of bytes it consumed.
    pub fn decode_uplink(data: &[u8]) -> Option<(Self, usize)> {
        if data.is_empty() {
            return None;
        }
        match data[0] {
            CID_LINK_CHECK_REQ => Some((MacCommand::LinkCheckReq, 1)),
            CID_LINK_ADR_ANS if data.len() >= 2 => {
                let status = data[1];
                Some((
                    MacCommand::LinkAdrAns {
                        ch_mask_ack: status & 0x01 != 0,
                        datarate_ack: status & 0x02 != 0,
                        power_ack: status & 0x04 != 0,
                    },
                    2,
                ))
            }
            _ => None,
        }
    }

    /// Decode a single command (downlink direction).
    pub fn decode_downlink(data: &[u8]) -> Option<(Self, usize)> {
        if data.is_empty() {
            return None;
        }
        match data[0] {
            CID_LINK_CHECK_ANS if data.len() >= 3 => Some((
                MacCommand::LinkCheckAns {
                    margin: data[1],
                    gw_cnt: data[2],
                },
                3,
            )),
            CID_LINK_ADR_REQ if data.len() >= 5 => {
                let dr_txpower = data[1];
                let ch_mask = u16::from_le_bytes([data[2], data[3]]);
                let redundancy = data[4];
                Some((
                    MacCommand::LinkAdrReq {
                        datarate: dr_txpower >> 4,
                        tx_power: dr_txpower & 0x0F,
                        ch_mask,
                        ch_mask_cntl: (redundancy >> 4) & 0x07,
                        nb_rep: redundancy & 0x0F,
                    },
                    5,
                ))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            MacCommand::LinkCheckReq => vec![CID_LINK_CHECK_REQ],
            MacCommand::LinkCheckAns { margin, gw_cnt } => {
                vec![CID_LINK_CHECK_ANS, *margin, *gw_cnt]
            }
            MacCommand::LinkAdrReq {
                datarate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                nb_rep,
            } => {
                let dr_txpower = (datarate << 4) | (tx_power & 0x0F);
                let redundancy = ((ch_mask_cntl & 0x07) << 4) | (nb_rep & 0x0F);
                let mask = ch_mask.to_le_bytes();
                vec![CID_LINK_ADR_REQ, dr_txpower, mask[0], mask[1], redundancy]
            }
            MacCommand::LinkAdrAns {
                ch_mask_ack,
                datarate_ack,
                power_ack,
            } => {
                let mut status = 0u8;
                if *ch_mask_ack {
                    status |= 0x01;
                }
                if *datarate_ack {
                    status |= 0x02;
                }
                if *power_ack {
                    status |= 0x04;
                }
                vec![CID_LINK_ADR_ANS, status]
            }
        }
    }
}

/// Decode every command out of an FOpts/FRMPayload-on-port-0 buffer,
/// stopping (without error) on the first unrecognized CID.
pub fn decode_uplink_commands(mut data: &[u8]) -> Vec<MacCommand> {
    let mut out = Vec::new();
    while !data.is_empty() {
        match MacCommand::decode_uplink(data) {
            Some((cmd, used)) => {
                out.push(cmd);
                data = &data[used..];
            }
            None => break,
        }
    }
    out
}

pub fn decode_downlink_commands(mut data: &[u8]) -> Vec<MacCommand> {
    let mut out = Vec::new();
    while !data.is_empty() {
        match MacCommand::decode_downlink(data) {
            Some((cmd, used)) => {
                out.push(cmd);
                data = &data[used..];
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_check_req_roundtrips() {
        let encoded = MacCommand::LinkCheckReq.encode();
        assert_eq!(encoded, vec![0x02]);
        let (decoded, used) = MacCommand::decode_uplink(&encoded).unwrap();
        assert_eq!(decoded, MacCommand::LinkCheckReq);
        assert_eq!(used, 1);
    }

    #[test]
    fn link_adr_req_encoding_matches_bit_layout() {
        let cmd = MacCommand::LinkAdrReq {
            datarate: 6,
            tx_power: 0,
            ch_mask: 0x0074,
            ch_mask_cntl: 0,
            nb_rep: 1,
        };
        let encoded = cmd.encode();
        // CID(0x03) DRTXPower(0x60) ChMask(0x74 0x00) Redundancy(0x01)
        assert_eq!(encoded, vec![0x03, 0x60, 0x74, 0x00, 0x01]);
    }

    #[test]
    fn piggyback_link_adr_ans_decodes() {
        let data = [0x03, 0x07];
        let (decoded, used) = MacCommand::decode_uplink(&data).unwrap();
        assert_eq!(
            decoded,
            MacCommand::LinkAdrAns {
                ch_mask_ack: true,
                datarate_ack: true,
                power_ack: true,
            }
        );
        assert_eq!(used, 2);
    }

    #[test]
    fn unknown_cid_stops_decode() {
        let data = [0xFF, 0x01, 0x02];
        assert!(MacCommand::decode_uplink(&data).is_none());
        assert_eq!(decode_uplink_commands(&data).len(), 0);
    }
}
