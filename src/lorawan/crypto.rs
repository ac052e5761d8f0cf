//! AES-128 and AES-CMAC primitives, plus the LoRaWAN-specific constructions
//! built on top of them (MIC, FRMPayload cipher, session-key derivation).
//!
//! Grounded on `original_source/floranet/lora/crypto.py` for the two
//! primitives it names (AES-ECB single block, AES-CMAC), and on
//! `original_source/floranet/lora/mac.py` for the B0/Ai block layouts and
//! the join-accept key derivation. The crate API pattern (new_from_slice,
//! encrypt_block/decrypt_block, GenericArray) matches the one already used
//! in `jfabienke-mbuscrate`'s `wmbus/crypto.rs`.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::NetServerError;

pub type Key = [u8; 16];
pub type Mic = u32;

/// Single-block AES-128-ECB encrypt, in place.
fn ecb_encrypt_block(key: &Key, block: &mut [u8; 16]) {
    let cipher = Aes128::new_from_slice(key).expect("AES-128 key is always 16 bytes");
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

/// Single-block AES-128-ECB decrypt, in place.
fn ecb_decrypt_block(key: &Key, block: &mut [u8; 16]) {
    let cipher = Aes128::new_from_slice(key).expect("AES-128 key is always 16 bytes");
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut ga);
    block.copy_from_slice(&ga);
}

/// AES-CMAC(key, data), truncated to the first 4 bytes (the LoRaWAN MIC).
pub fn cmac4(key: &Key, data: &[u8]) -> Result<Mic, NetServerError> {
    let mut mac = Cmac::<Aes128>::new_from_slice(key)
        .map_err(|e| NetServerError::InvariantViolation(format!("bad CMAC key: {e}")))?;
    mac.update(data);
    let tag = mac.finalize().into_bytes();
    Ok(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]))
}

/// Build the 16-byte B0 block used as the CMAC preimage prefix for data
/// frames, per LoRaWAN §4.4. `dir` is 0 for uplink, 1 for downlink.
pub fn b0(dir: u8, dev_addr: u32, fcnt: u32, msg_len: u8) -> [u8; 16] {
    let mut b0 = [0u8; 16];
    b0[0] = 0x49;
    // b0[1..5] reserved, all zero
    b0[5] = dir;
    b0[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    // b0[14] reserved (zero)
    b0[15] = msg_len;
    b0
}

/// Compute the MIC over a data frame's MHDR..FRMPayload bytes.
pub fn data_mic(nwk_s_key: &Key, dir: u8, dev_addr: u32, fcnt: u32, msg: &[u8]) -> Result<Mic, NetServerError> {
    let prefix = b0(dir, dev_addr, fcnt, msg.len() as u8);
    let mut preimage = Vec::with_capacity(16 + msg.len());
    preimage.extend_from_slice(&prefix);
    preimage.extend_from_slice(msg);
    cmac4(nwk_s_key, &preimage)
}

/// Build the 16-byte join-request MIC preimage (the MHDR..DevNonce bytes
/// themselves, no B0 prefix — LoRaWAN §6.2.4).
pub fn join_request_mic(app_key: &Key, msg: &[u8]) -> Result<Mic, NetServerError> {
    cmac4(app_key, msg)
}

/// Join-accept MIC: CMAC(AppKey, MHDR | AppNonce | NetID | DevAddr |
/// DLSettings | RxDelay | [CFList]).
pub fn join_accept_mic(app_key: &Key, msg: &[u8]) -> Result<Mic, NetServerError> {
    cmac4(app_key, msg)
}

/// Encrypt a join-accept payload for transmission. LoRaWAN defines the
/// join-accept wire cipher as the AES *decrypt* operation applied to the
/// cleartext (so that the join-accepting device, using the normal encrypt
/// operation, recovers the plaintext) — see floranet `JoinAcceptMessage.encode`.
pub fn join_accept_encrypt(app_key: &Key, cleartext: &[u8]) -> Vec<u8> {
    assert_eq!(cleartext.len() % 16, 0, "join-accept body must be block aligned");
    let mut out = Vec::with_capacity(cleartext.len());
    for chunk in cleartext.chunks(16) {
        let mut block: [u8; 16] = chunk.try_into().expect("16-byte chunk");
        ecb_decrypt_block(app_key, &mut block);
        out.extend_from_slice(&block);
    }
    out
}

/// Decrypt a received join-accept payload (device-side operation mirrored
/// here so the engine's tests can round-trip against its own encoder).
pub fn join_accept_decrypt(app_key: &Key, ciphertext: &[u8]) -> Vec<u8> {
    assert_eq!(ciphertext.len() % 16, 0, "join-accept body must be block aligned");
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(16) {
        let mut block: [u8; 16] = chunk.try_into().expect("16-byte chunk");
        ecb_encrypt_block(app_key, &mut block);
        out.extend_from_slice(&block);
    }
    out
}

/// Derive NwkSKey or AppSKey from the join-accept parameters. `tag` is
/// 0x01 for NwkSKey, 0x02 for AppSKey (LoRaWAN §6.2.5).
pub fn derive_session_key(
    app_key: &Key,
    tag: u8,
    app_nonce: u32,
    net_id: u32,
    dev_nonce: u16,
) -> Key {
    let mut block = [0u8; 16];
    block[0] = tag;
    block[1..4].copy_from_slice(&app_nonce.to_le_bytes()[..3]);
    block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    // block[9..16] is padding, already zero
    ecb_encrypt_block(app_key, &mut block);
    block
}

/// LoRaWAN FRMPayload cipher. Produces the keystream blocks Ai, XORs them
/// against `data`, and truncates to `data.len()` — the same function
/// encrypts and decrypts (it's its own involution), matching floranet's
/// `MACDataMessage.encrypt`/`decrypt`.
pub fn frm_payload_cipher(
    key: &Key,
    dir: u8,
    dev_addr: u32,
    fcnt: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let num_blocks = data.len().div_ceil(16).max(0);
    for i in 0..num_blocks {
        let mut a = [0u8; 16];
        a[0] = 0x01;
        // a[1..5] reserved, zero
        a[5] = dir;
        a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        // a[14] reserved, zero
        a[15] = (i + 1) as u8;
        ecb_encrypt_block(key, &mut a);

        let start = i * 16;
        let end = (start + 16).min(data.len());
        for (o, k) in data[start..end].iter().zip(a.iter()) {
            out.push(o ^ k);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frm_payload_cipher_is_involution() {
        let key: Key = [0x2b; 16];
        let plaintext = b"Hello, LoRaWAN!!";
        let ciphertext = frm_payload_cipher(&key, 0, 0x01020304, 7, plaintext);
        let roundtrip = frm_payload_cipher(&key, 0, 0x01020304, 7, &ciphertext);
        assert_eq!(roundtrip, plaintext);
    }

    #[test]
    fn join_accept_round_trips_through_encrypt_decrypt() {
        let key: Key = [0x11; 16];
        let cleartext = [0x42u8; 32];
        let ciphertext = join_accept_encrypt(&key, &cleartext);
        let decoded = join_accept_decrypt(&key, &ciphertext);
        assert_eq!(decoded, cleartext);
    }

    #[test]
    fn derive_session_key_is_deterministic() {
        let app_key: Key = [0x00; 16];
        let k1 = derive_session_key(&app_key, 0x01, 1, 0x13, 42);
        let k2 = derive_session_key(&app_key, 0x01, 1, 0x13, 42);
        assert_eq!(k1, k2);
        let k3 = derive_session_key(&app_key, 0x02, 1, 0x13, 42);
        assert_ne!(k1, k3, "NwkSKey and AppSKey must differ");
    }

    #[test]
    fn data_mic_changes_with_fcnt() {
        let key: Key = [0xAB; 16];
        let msg = [0x40, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00];
        let mic1 = data_mic(&key, 0, 0x01020304, 1, &msg).unwrap();
        let mic2 = data_mic(&key, 0, 0x01020304, 2, &msg).unwrap();
        assert_ne!(mic1, mic2);
    }
}
