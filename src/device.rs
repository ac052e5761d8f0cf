//! Per-device session-state logic: DevNonce replay checking, frame-count
//! tracking, SNR history, and ADR datarate selection.
//!
//! Grounded on `original_source/floranet/models/device.py`. These are pure
//! functions over `models::Device` plus the new value, not methods that
//! reach into a persistence façade — the engine loads/saves the `Device`
//! row around each call.

use crate::lorawan::band::Band;
use crate::models::Device;

/// Maximum recent DevNonces to remember (floranet keeps 20, popping the
/// oldest when full).
const DEVNONCE_HISTORY: usize = 20;

/// SNR samples kept; ADR only acts once at least 6 are present, averaging
/// the most recent 6.
const SNR_HISTORY: usize = 11;
const SNR_ADR_WINDOW: usize = 6;

/// 3 dB margin per ADR "step".
const ADR_STEP_DB: f64 = 3.0;

/// Check whether `dev_nonce` has been seen before; if not, record it,
/// evicting the oldest entry once the history is full.
pub fn check_dev_nonce(device: &mut Device, dev_nonce: u16) -> bool {
    if device.dev_nonces.contains(&dev_nonce) {
        return false;
    }
    if device.dev_nonces.len() >= DEVNONCE_HISTORY {
        device.dev_nonces.remove(0);
    }
    device.dev_nonces.push(dev_nonce);
    true
}

/// Check (and resolve) an uplink frame counter in place, per floranet's
/// `Device.checkFrameCount`. `max_fcnt_gap` comes from the active band.
/// `fcntup`/`fcntdown` are tracked as 16-bit rolling counters (the device
/// model's field width is wider only so the MAC-layer plumbing doesn't have
/// to special-case the wraparound).
///
/// On success, `device.fcntup` is updated to `received` and `fcnt_error`
/// cleared; on failure `fcnt_error` is latched `true` and the device is
/// otherwise untouched. The caller persists the device either way.
///
/// Relaxed mode: if the device reports fcntup <= 1 (a power-cycle reset, or
/// a brand new session), the server force-resyncs (including resetting
/// fcntdown) rather than rejecting it as a replay.
pub fn check_frame_count(device: &mut Device, received: u16, max_fcnt_gap: u32, relaxed: bool) -> bool {
    let received = received as u32;
    let current = device.fcntup;

    if relaxed && received <= 1 {
        device.fcntdown = 0;
        device.fcntup = received;
        device.fcnt_error = false;
        return true;
    }

    if received > current + max_fcnt_gap {
        device.fcnt_error = true;
        return false;
    }

    if received < current && (65535 - current + received) > max_fcnt_gap {
        device.fcnt_error = true;
        return false;
    }

    device.fcntup = received;
    device.fcnt_error = false;
    true
}

/// Record a new SNR sample, evicting the oldest once the history is full.
pub fn update_snr(device: &mut Device, snr: f64) {
    if device.snr_history.len() >= SNR_HISTORY {
        device.snr_history.remove(0);
    }
    device.snr_history.push(snr);
}

/// Average of the most recent `SNR_ADR_WINDOW` samples, once at least that
/// many are present; `None` before then (ADR stays put).
fn recent_snr_average(device: &Device) -> Option<f64> {
    if device.snr_history.len() < SNR_ADR_WINDOW {
        return None;
    }
    let window = &device.snr_history[device.snr_history.len() - SNR_ADR_WINDOW..];
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

/// Threshold SNR required to support each datarate index, approximating
/// the margin needed above the receiver sensitivity floor. Matches the
/// step spacing (3 dB/datarate) floranet's ADR logic uses; the demodulation
/// floor constants themselves are LoRaWAN-standard SNR limits per SF.
fn snr_threshold(max_datr_index: u8, target_index: u8) -> f64 {
    // Higher datarate index = faster/less robust; each step up costs
    // ADR_STEP_DB more required margin relative to the floor at the
	// lowest (most robust) datarate.
    let steps_above_floor = max_datr_index.saturating_sub(target_index) as f64;
    -20.0 + steps_above_floor * ADR_STEP_DB
}

/// Pick the highest supported datarate whose required SNR the device's
/// recent average can sustain, applying `adr_margin` dB of extra headroom
/// (floranet's `ADRmargin` config knob), per `Device.getADRDatarate`.
/// Returns the datarate's name, or `None` if no change is suggested.
pub fn get_adr_datarate(device: &Device, band: &dyn Band, max_datr: u8, adr_margin: f64) -> Option<&'static str> {
    let avg = recent_snr_average(device)?;
    let current_datr = device
        .tx_datr
        .as_deref()
        .and_then(|d| band.datarate_index(d))
        .unwrap_or(0);
    let mut best = current_datr;
    for candidate in (current_datr..=max_datr).rev() {
        if avg - adr_margin >= snr_threshold(max_datr, candidate) {
            best = candidate;
            break;
        }
    }
    if best == current_datr {
        None
    } else {
        band.datarate(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn device() -> Device {
        Device {
            id: 1,
            dev_eui: 0,
            dev_addr: 0x01020304,
            application_id: 1,
            name: "test".into(),
            otaa: true,
            enabled: true,
            devclass: crate::models::DeviceClass::A,
            dev_nonces: vec![],
            nwk_s_key: [0; 16],
            app_s_key: [0; 16],
            fcntup: 0,
            fcntdown: 0,
            fcnt_error: false,
            adr_enable: true,
            adr_datr: None,
            tx_chan: None,
            tx_datr: None,
            tmst: None,
            app_name: None,
            latitude: None,
            longitude: None,
            snr_history: vec![],
            gw_addr: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn dev_nonce_rejects_replay() {
        let mut dev = device();
        assert!(check_dev_nonce(&mut dev, 42));
        assert!(!check_dev_nonce(&mut dev, 42));
    }

    #[test]
    fn dev_nonce_history_evicts_oldest() {
        let mut dev = device();
        for n in 0..20u16 {
            assert!(check_dev_nonce(&mut dev, n));
        }
        // 0 was evicted to make room for the 21st nonce
        assert!(check_dev_nonce(&mut dev, 20));
        assert!(check_dev_nonce(&mut dev, 0));
    }

    #[test]
    fn frame_count_accepts_forward_progress() {
        let mut dev = device();
        dev.fcntup = 5;
        assert!(check_frame_count(&mut dev, 6, 16384, false));
        assert_eq!(dev.fcntup, 6);
        assert!(!dev.fcnt_error);
    }

    #[test]
    fn frame_count_rejects_replay_without_relaxed_mode() {
        let mut dev = device();
        dev.fcntup = 5;
        assert!(!check_frame_count(&mut dev, 5, 16384, false));
        assert!(dev.fcnt_error);
    }

    #[test]
    fn frame_count_relaxed_mode_resyncs_on_reset() {
        let mut dev = device();
        dev.fcntup = 500;
        assert!(check_frame_count(&mut dev, 1, 16384, true));
        assert_eq!(dev.fcntup, 1);
        assert_eq!(dev.fcntdown, 0);
        assert!(!dev.fcnt_error);
    }

    #[test]
    fn frame_count_wrap_boundary_from_spec_scenario() {
        let mut dev = device();
        dev.fcntup = 65530;
        assert!(check_frame_count(&mut dev, 10, 16384, false));
        assert_eq!(dev.fcntup, 10);

        let mut dev = device();
        dev.fcntup = 65530;
        assert!(!check_frame_count(&mut dev, 50000, 16384, false));
        assert!(dev.fcnt_error);
    }

    #[test]
    fn snr_history_caps_at_eleven_and_averages_last_six() {
        let mut dev = device();
        for i in 0..11 {
            update_snr(&mut dev, i as f64);
        }
        assert_eq!(dev.snr_history.len(), 11);
        update_snr(&mut dev, 99.0);
        assert_eq!(dev.snr_history.len(), 11);
        assert_eq!(dev.snr_history[10], 99.0);
    }

    #[test]
    fn adr_no_change_below_six_samples() {
        let mut dev = device();
        for _ in 0..5 {
            update_snr(&mut dev, 20.0);
        }
        assert_eq!(get_adr_datarate(&dev, &crate::lorawan::band::Us915, 3, 0.0), None);
    }

    #[test]
    fn adr_suggests_faster_datarate_with_strong_snr() {
        let mut dev = device();
        dev.tx_datr = Some("SF10BW125".into());
        for _ in 0..6 {
            update_snr(&mut dev, 20.0);
        }
        let suggestion = get_adr_datarate(&dev, &crate::lorawan::band::Us915, 3, 0.0);
        assert!(suggestion.is_some());
    }
}
