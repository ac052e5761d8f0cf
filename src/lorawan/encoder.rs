//! Downlink frame construction: data-down frames and join-accept messages.
//!
//! Grounded on `original_source/floranet/lora/mac.py`'s
//! `MACDataDownlinkMessage.encode` (B0 with dir=1, FRMPayload cipher, MIC
//! appended) and `JoinAcceptMessage.encode` (AppNonce/NetID/DevAddr/
//! DLSettings/RxDelay body, AES "decrypt" wrap, MIC computed over the
//! cleartext header+body before encryption).

use super::crypto::{self, Key};
use super::MType;

/// Builder for an unconfirmed/confirmed downlink data frame.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fcnt: u32,
    pub f_port: u8,
    /// Application payload, plaintext — encrypted with AppSKey during build.
    pub payload: Vec<u8>,
    /// MAC commands to carry in FOpts (empty FPort-0 frames aren't built
    /// here; piggybacked FOpts only).
    pub f_opts: Vec<u8>,
    pub ack: bool,
}

impl FrameBuilder {
    pub fn new_downlink(dev_addr: u32, fcnt: u32, f_port: u8, payload: Vec<u8>) -> Self {
        Self {
            mtype: MType::UnconfirmedDataDown,
            dev_addr,
            fcnt,
            f_port,
            payload,
            f_opts: Vec::new(),
            ack: false,
        }
    }

    /// Build the raw LoRaWAN PHY payload, encrypting the application
    /// payload with `app_s_key` and computing a real MIC with `nwk_s_key`.
    pub fn build(&self, nwk_s_key: &Key, app_s_key: &Key) -> anyhow::Result<Vec<u8>> {
        let fcnt16 = self.fcnt as u16;
        let mut frame = Vec::with_capacity(12 + self.payload.len() + self.f_opts.len());

        frame.push(self.mtype.mhdr());
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());

        let f_opts_len = self.f_opts.len() as u8;
        let mut fctrl = 0u8;
        if self.ack {
            fctrl |= 0x20;
        }
        fctrl |= f_opts_len & 0x0F;
        frame.push(fctrl);

        frame.extend_from_slice(&fcnt16.to_le_bytes());
        frame.extend_from_slice(&self.f_opts);

        if !self.payload.is_empty() {
            frame.push(self.f_port);
            // FPort 0 carries MAC commands, encrypted with NwkSKey rather
            // than AppSKey (LoRaWAN 1.0 §4.3.1).
            let cipher_key = if self.f_port == 0 { nwk_s_key } else { app_s_key };
            let ciphertext = crypto::frm_payload_cipher(cipher_key, 1, self.dev_addr, self.fcnt, &self.payload);
            frame.extend_from_slice(&ciphertext);
        }

        let mic = crypto::data_mic(nwk_s_key, 1, self.dev_addr, self.fcnt, &frame)?;
        frame.extend_from_slice(&mic.to_le_bytes());

        Ok(frame)
    }
}

/// Parameters to build a JoinAccept response.
#[derive(Debug, Clone)]
pub struct JoinAcceptBuilder {
    pub app_nonce: u32,
    pub net_id: u32,
    pub dev_addr: u32,
    pub dl_settings: u8,
    pub rx_delay: u8,
    pub cf_list: Vec<u8>,
}

impl JoinAcceptBuilder {
    /// Build the PHY payload: MHDR (cleartext) followed by the AES-wrapped
    /// body (AppNonce|NetID|DevAddr|DLSettings|RxDelay|CFList|MIC).
    pub fn build(&self, app_key: &Key) -> anyhow::Result<Vec<u8>> {
        let mut cleartext = Vec::with_capacity(16 + self.cf_list.len());
        cleartext.extend_from_slice(&self.app_nonce.to_le_bytes()[..3]);
        cleartext.extend_from_slice(&self.net_id.to_le_bytes()[..3]);
        cleartext.extend_from_slice(&self.dev_addr.to_le_bytes());
        cleartext.push(self.dl_settings);
        cleartext.push(self.rx_delay);
        cleartext.extend_from_slice(&self.cf_list);

        let mhdr = MType::JoinAccept.mhdr();
        let mut mic_preimage = vec![mhdr];
        mic_preimage.extend_from_slice(&cleartext);
        let mic = crypto::join_accept_mic(app_key, &mic_preimage)?;

        let mut body = cleartext;
        body.extend_from_slice(&mic.to_le_bytes());
        // Pad to a 16-byte boundary is not expected: AppNonce(3)+NetID(3)+
        // DevAddr(4)+DLSettings(1)+RxDelay(1)+MIC(4) = 16 bytes exactly
        // with no CFList; a present CFList is itself 16 bytes, keeping the
        // body block-aligned either way.
        let encrypted = crypto::join_accept_encrypt(app_key, &body);

        let mut frame = vec![mhdr];
        frame.extend_from_slice(&encrypted);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::{decode_join_accept, decode_phy_payload, LoRaWANFrame};

    fn keys() -> (Key, Key) {
        ([0x2b; 16], [0x2b; 16])
    }

    #[test]
    fn test_build_unconfirmed_downlink() {
        let (nwk, app) = keys();
        let builder = FrameBuilder::new_downlink(0x01AB5678, 42, 1, vec![0x48, 0x65, 0x6C, 0x6C, 0x6F]);
        let frame = builder.build(&nwk, &app).unwrap();

        assert_eq!(frame.len(), 18);
        assert_eq!(frame[0], 0x60);
        assert_eq!(&frame[1..5], &0x01AB5678u32.to_le_bytes());
        assert_eq!(frame[5], 0x00);
        assert_eq!(&frame[6..8], &42u16.to_le_bytes());
        assert_eq!(frame[8], 1);
    }

    #[test]
    fn test_build_empty_payload() {
        let (nwk, app) = keys();
        let builder = FrameBuilder {
            mtype: MType::UnconfirmedDataDown,
            dev_addr: 0x12345678,
            fcnt: 0,
            f_port: 1,
            payload: vec![],
            f_opts: vec![],
            ack: false,
        };
        let frame = builder.build(&nwk, &app).unwrap();
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn test_roundtrip_encode_decode_recovers_plaintext() {
        let (nwk, app) = keys();
        let builder = FrameBuilder::new_downlink(0xDEADBEEF, 100, 42, vec![0x01, 0x02, 0x03]);
        let encoded = builder.build(&nwk, &app).unwrap();
        let decoded = decode_phy_payload(&encoded).expect("should decode");

        match decoded {
            LoRaWANFrame::Data {
                mtype,
                dev_addr,
                fcnt,
                f_port,
                frm_payload,
                ..
            } => {
                assert_eq!(mtype, MType::UnconfirmedDataDown);
                assert_eq!(dev_addr, 0xDEADBEEF);
                assert_eq!(fcnt, 100);
                assert_eq!(f_port, Some(42));
                let cleartext = crate::lorawan::crypto::frm_payload_cipher(&app, 1, 0xDEADBEEF, 100, &frm_payload);
                assert_eq!(cleartext, vec![0x01, 0x02, 0x03]);
            }
            _ => panic!("Expected Data frame"),
        }
    }

    #[test]
    fn test_confirmed_downlink_mtype_bit() {
        let (nwk, app) = keys();
        let builder = FrameBuilder {
            mtype: MType::ConfirmedDataDown,
            dev_addr: 0x11223344,
            fcnt: 1,
            f_port: 10,
            payload: vec![0xFF],
            f_opts: vec![],
            ack: false,
        };
        let frame = builder.build(&nwk, &app).unwrap();
        assert_eq!(frame[0], 0xA0);
        let decoded = decode_phy_payload(&frame).expect("should decode");
        match decoded {
            LoRaWANFrame::Data { mtype, .. } => assert_eq!(mtype, MType::ConfirmedDataDown),
            _ => panic!("Expected Data frame"),
        }
    }

    #[test]
    fn join_accept_builds_and_decodes() {
        let app_key: Key = [0x77; 16];
        let builder = JoinAcceptBuilder {
            app_nonce: 1,
            net_id: 0x13,
            dev_addr: 0x01020304,
            dl_settings: 0,
            rx_delay: 1,
            cf_list: vec![],
        };
        let frame = builder.build(&app_key).unwrap();
        assert_eq!(frame[0], MType::JoinAccept.mhdr());

        let fields = decode_join_accept(&app_key, &frame[1..]).unwrap();
        assert_eq!(fields.app_nonce, 1);
        assert_eq!(fields.net_id, 0x13);
        assert_eq!(fields.dev_addr, 0x01020304);
    }
}
