//! Session-key derivation for OTAA joins.
//!
//! ABP devices carry their NwkSKey/AppSKey directly in the `Device` row
//! (provisioned out of band); OTAA devices derive them here from the
//! join-accept parameters, per LoRaWAN §6.2.5 / floranet's
//! `NetServer._createSessionKey`.

use super::crypto::{derive_session_key, Key};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionKeys {
    pub nwk_s_key: Key,
    pub app_s_key: Key,
}

const NWK_S_KEY_TAG: u8 = 0x01;
const APP_S_KEY_TAG: u8 = 0x02;

pub fn derive(app_key: &Key, app_nonce: u32, net_id: u32, dev_nonce: u16) -> SessionKeys {
    SessionKeys {
        nwk_s_key: derive_session_key(app_key, NWK_S_KEY_TAG, app_nonce, net_id, dev_nonce),
        app_s_key: derive_session_key(app_key, APP_S_KEY_TAG, app_nonce, net_id, dev_nonce),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nwk_and_app_keys_differ() {
        let app_key: Key = [0x42; 16];
        let keys = derive(&app_key, 1, 0x13, 7);
        assert_ne!(keys.nwk_s_key, keys.app_s_key);
    }
}
