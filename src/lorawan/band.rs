//! Regional frequency plans: US915, AU915, EU868.
//!
//! Grounded on `original_source/floranet/lora/bands.py`. AU915 is US915
//! with only the upstream channel table shifted; EU868 carries its own
//! datarate table and overrides RX2 to a fixed frequency/datarate distinct
//! from the US/AU default.

use crate::models::FreqBand;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxParams {
    pub freq: f64,
    pub datr: &'static str,
    pub index: u8,
    pub delay: u32,
}

/// Frequency-plan behavior common to every band, matching floranet's
/// `LoraBand` base class.
pub trait Band: Send + Sync {
    fn datarate(&self, index: u8) -> Option<&'static str>;
    fn datarate_index(&self, datr: &str) -> Option<u8>;
    fn downstream_freq(&self, tx_chan: u8) -> f64;
    fn rx1_index(&self, tx_datr_index: u8, rx1dr_offset: u8) -> u8;
    fn rx2(&self) -> (f64, u8);
    fn max_app_payload_len(&self, datr_index: u8) -> Option<u16>;
    fn max_mac_payload_len(&self, datr_index: u8) -> Option<u16>;

    /// RX1DR offset applied to every device on this band. Every band this
    /// server supports uses 0 (`original_source/floranet/lora/bands.py`'s
    /// `self.rx1droffset = 0`); kept as a method rather than a constant so a
    /// future band could override it without touching call sites.
    fn rx1droffset(&self) -> u8 {
        0
    }

    /// Seconds between an uplink and its RX1/RX2 windows for an ordinary
    /// data downlink (`bands.py`'s `receive_delay = {1: 1, 2: 2}`).
    fn receive_delay(&self, window: u8) -> u32 {
        if window == 1 { 1 } else { 2 }
    }

    /// Seconds between a JoinRequest and its JoinAccept's RX1/RX2 windows
    /// (`bands.py`'s `join_accept_delay = {1: 5, 2: 6}`).
    fn join_accept_delay(&self, window: u8) -> u32 {
        if window == 1 { 5 } else { 6 }
    }

    fn rx1(&self, tx_chan: u8, tx_datr: &str) -> Option<RxParams> {
        let tx_index = self.datarate_index(tx_datr)?;
        let index = self.rx1_index(tx_index, self.rx1droffset());
        Some(RxParams {
            freq: self.downstream_freq(tx_chan),
            datr: self.datarate(index)?,
            index,
            delay: self.receive_delay(1),
        })
    }

    fn rx2_params(&self) -> RxParams {
        let (freq, index) = self.rx2();
        RxParams {
            freq,
            datr: self.datarate(index).unwrap_or("SF12BW125"),
            index,
            delay: self.receive_delay(2),
        }
    }

    /// Both RX windows for a downlink, i.e. spec's `rxparams(tx_chan,
    /// tx_datr, join)`. Falls back to the RX2 window for RX1 too when
    /// `tx_datr` isn't a recognized name for this band.
    fn rx_windows(&self, tx_chan: u8, tx_datr: &str, join: bool) -> (RxParams, RxParams) {
        let mut rx1 = self.rx1(tx_chan, tx_datr).unwrap_or_else(|| self.rx2_params());
        let mut rx2 = self.rx2_params();
        if join {
            rx1.delay = self.join_accept_delay(1);
            rx2.delay = self.join_accept_delay(2);
        }
        (rx1, rx2)
    }

    fn check_app_payload_len(&self, datr: &str, len: usize) -> bool {
        match self.datarate_index(datr).and_then(|i| self.max_app_payload_len(i)) {
            Some(max) => len as u16 <= max,
            None => false,
        }
    }
}

macro_rules! table_lookup {
    ($table:expr, $index:expr) => {
        $table.iter().find(|(i, _)| *i == $index).map(|(_, v)| *v)
    };
}

pub struct Us915;

const US915_DATARATE: &[(u8, &str)] = &[
    (0, "SF10BW125"),
    (1, "SF9BW125"),
    (2, "SF8BW125"),
    (3, "SF7BW125"),
    (4, "SF8BW500"),
    (8, "SF12BW500"),
    (9, "SF11BW500"),
    (10, "SF10BW500"),
    (11, "SF9BW500"),
    (12, "SF8BW500"),
    (13, "SF7BW500"),
];

// rx1dr[tx_datarate][rx1dr_offset]
const US915_RX1DR: &[(u8, [u8; 4])] = &[
    (0, [10, 9, 8, 8]),
    (1, [11, 10, 9, 8]),
    (2, [12, 11, 10, 9]),
    (3, [13, 12, 11, 10]),
    (4, [13, 13, 12, 11]),
];

const US915_MAXPAYLOAD: &[(u8, u16)] = &[
    (0, 19), (1, 61), (2, 137), (3, 250), (4, 250),
    (8, 61), (9, 137), (10, 250), (11, 250), (12, 250), (13, 250),
];

const US915_MAXAPP: &[(u8, u16)] = &[
    (0, 11), (1, 53), (2, 129), (3, 242), (4, 242),
    (8, 53), (9, 129), (10, 242), (11, 242), (12, 242), (13, 242),
];

fn us915_downstream(chan: u8) -> f64 {
    923.3 + 0.6 * (chan % 8) as f64
}

impl Band for Us915 {
    fn datarate(&self, index: u8) -> Option<&'static str> {
        table_lookup!(US915_DATARATE, index)
    }

    fn datarate_index(&self, datr: &str) -> Option<u8> {
        US915_DATARATE.iter().find(|(_, d)| *d == datr).map(|(i, _)| *i)
    }

    fn downstream_freq(&self, tx_chan: u8) -> f64 {
        us915_downstream(tx_chan)
    }

    fn rx1_index(&self, tx_datr_index: u8, rx1dr_offset: u8) -> u8 {
        table_lookup!(US915_RX1DR, tx_datr_index)
            .map(|row| row[rx1dr_offset.min(3) as usize])
            .unwrap_or(8)
    }

    fn rx2(&self) -> (f64, u8) {
        (923.3, 8)
    }

    fn max_app_payload_len(&self, datr_index: u8) -> Option<u16> {
        table_lookup!(US915_MAXAPP, datr_index)
    }

    fn max_mac_payload_len(&self, datr_index: u8) -> Option<u16> {
        table_lookup!(US915_MAXPAYLOAD, datr_index)
    }
}

/// AU915 reuses every US915 table except the upstream channel plan, which
/// only affects the gateway's reported `chan`/`freq`, not our downstream
/// computations — so it's implementation-identical to US915 here.
pub struct Au915;

impl Band for Au915 {
    fn datarate(&self, index: u8) -> Option<&'static str> {
        Us915.datarate(index)
    }
    fn datarate_index(&self, datr: &str) -> Option<u8> {
        Us915.datarate_index(datr)
    }
    fn downstream_freq(&self, tx_chan: u8) -> f64 {
        Us915.downstream_freq(tx_chan)
    }
    fn rx1_index(&self, tx_datr_index: u8, rx1dr_offset: u8) -> u8 {
        Us915.rx1_index(tx_datr_index, rx1dr_offset)
    }
    fn rx2(&self) -> (f64, u8) {
        Us915.rx2()
    }
    fn max_app_payload_len(&self, datr_index: u8) -> Option<u16> {
        Us915.max_app_payload_len(datr_index)
    }
    fn max_mac_payload_len(&self, datr_index: u8) -> Option<u16> {
        Us915.max_mac_payload_len(datr_index)
    }
}

pub struct Eu868;

const EU868_DATARATE: &[(u8, &str)] = &[
    (0, "SF12BW125"),
    (1, "SF11BW125"),
    (2, "SF10BW125"),
    (3, "SF9BW125"),
    (4, "SF8BW125"),
    (5, "SF7BW125"),
    (6, "SF7BW250"),
];

const EU868_RX1DR: &[(u8, [u8; 6])] = &[
    (0, [0, 0, 0, 0, 0, 0]),
    (1, [1, 0, 0, 0, 0, 0]),
    (2, [2, 1, 0, 0, 0, 0]),
    (3, [3, 2, 1, 0, 0, 0]),
    (4, [4, 3, 2, 1, 0, 0]),
    (5, [5, 4, 3, 2, 1, 0]),
    (6, [6, 5, 4, 3, 2, 1]),
];

const EU868_MAXPAYLOAD: &[(u8, u16)] = &[
    (0, 59), (1, 59), (2, 59), (3, 123), (4, 250), (5, 250), (6, 250),
];

const EU868_MAXAPP: &[(u8, u16)] = &[
    (0, 51), (1, 51), (2, 51), (3, 115), (4, 242), (5, 242), (6, 242),
];

const EU868_UPSTREAM: &[f64] = &[868.10, 868.30, 868.50, 867.1, 867.3, 867.5, 867.7, 867.9, 868.8];

impl Band for Eu868 {
    fn datarate(&self, index: u8) -> Option<&'static str> {
        table_lookup!(EU868_DATARATE, index)
    }

    fn datarate_index(&self, datr: &str) -> Option<u8> {
        EU868_DATARATE.iter().find(|(_, d)| *d == datr).map(|(i, _)| *i)
    }

    fn downstream_freq(&self, tx_chan: u8) -> f64 {
        EU868_UPSTREAM[tx_chan as usize % EU868_UPSTREAM.len()]
    }

    fn rx1_index(&self, tx_datr_index: u8, rx1dr_offset: u8) -> u8 {
        table_lookup!(EU868_RX1DR, tx_datr_index)
            .map(|row| row[rx1dr_offset.min(5) as usize])
            .unwrap_or(0)
    }

    fn rx2(&self) -> (f64, u8) {
        (869.525, 0)
    }

    fn max_app_payload_len(&self, datr_index: u8) -> Option<u16> {
        table_lookup!(EU868_MAXAPP, datr_index)
    }

    fn max_mac_payload_len(&self, datr_index: u8) -> Option<u16> {
        table_lookup!(EU868_MAXPAYLOAD, datr_index)
    }
}

pub fn band_for(freq_band: FreqBand) -> Box<dyn Band> {
    match freq_band {
        FreqBand::US915 => Box::new(Us915),
        FreqBand::AU915 => Box::new(Au915),
        FreqBand::EU868 => Box::new(Eu868),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn us915_rx2_is_dr8_923_3() {
        let (freq, index) = Us915.rx2();
        assert_eq!(freq, 923.3);
        assert_eq!(index, 8);
    }

    #[test]
    fn eu868_rx2_overrides_to_dr0_869_525() {
        let (freq, index) = Eu868.rx2();
        assert_eq!(freq, 869.525);
        assert_eq!(index, 0);
    }

    #[test]
    fn au915_shares_us915_datarate_table() {
        assert_eq!(Au915.datarate(3), Us915.datarate(3));
        assert_eq!(Au915.rx2(), Us915.rx2());
    }

    #[test]
    fn us915_rx1_offset_zero_is_identity_table() {
        // tx DR3 (SF7BW125), offset 0 -> index 13 per floranet's table.
        assert_eq!(Us915.rx1_index(3, 0), 13);
    }

    #[test]
    fn rx_windows_data_vs_join_delay() {
        let (rx1, rx2) = Us915.rx_windows(0, "SF7BW125", false);
        assert_eq!(rx1.delay, 1);
        assert_eq!(rx2.delay, 2);

        let (rx1, rx2) = Us915.rx_windows(0, "SF7BW125", true);
        assert_eq!(rx1.delay, 5);
        assert_eq!(rx2.delay, 6);
    }
}
