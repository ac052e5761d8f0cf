//! The network-server engine (spec §4.6/C6): decodes uplinks, drives
//! OTAA/ABP session handling, MIC/frame-count validation, MAC command
//! dispatch, ADR, and downlink scheduling.
//!
//! Grounded on `original_source/floranet/netserver.py`'s `NetServer`:
//! `_getFreeOTAAddress`, `_getActiveDevice`, `_checkDuplicateMessage`,
//! `_createSessionKey`, `_scheduleDownlinkTime`, `_txpkResponse`,
//! `processPushDataMessage`, `_processJoinRequest`, `_sendJoinResponse`,
//! `_processLinkCheckReq`, and the standalone `_ADRLoop`/`_pruneQueue`
//! `LoopingCall`s. The teacher crate has no engine of its own (it only
//! logs decoded frames), so this module is new, but reuses the teacher's
//! async/channel idiom: adapter-initiated downlinks reach the gateway
//! server loop over an `mpsc` channel the way the teacher's UDP layer
//! feeds `mpsc::Sender<LoRaPacket>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::device;
use crate::error::{NetServerError, Result};
use crate::gateway::protocol::Rxpk;
use crate::gateway::registry::DuplicateCache;
use crate::interfaces::InterfaceManager;
use crate::lorawan::band::{band_for, Band};
use crate::lorawan::commands::{decode_uplink_commands, MacCommand};
use crate::lorawan::encoder::{FrameBuilder, JoinAcceptBuilder};
use crate::lorawan::{self, keys, LoRaWANFrame};
use crate::models::{Config, Device, Gateway};
use crate::store::Store;

/// A single RX window's radio parameters for a scheduled downlink.
#[derive(Debug, Clone)]
pub struct DownlinkWindow {
    pub freq: f64,
    pub datr: String,
    /// `None` means send immediately; `Some` is the gateway `tmst` the
    /// transmission should be scheduled against.
    pub tmst: Option<u32>,
}

/// Which RX window(s) a downlink should be transmitted in. Most downlinks
/// get both RX1 and RX2 enqueued (the gateway sends whichever fires first
/// and the device is listening for); a few responses — LinkCheckAns when
/// not queued, and ADR LinkADRReq when not queued — are RX2-only per spec.
#[derive(Debug, Clone)]
pub enum DownlinkWindows {
    Both(DownlinkWindow, DownlinkWindow),
    Rx2Only(DownlinkWindow),
}

/// A downlink the caller (gateway server loop) should transmit.
#[derive(Debug, Clone)]
pub struct ScheduledDownlink {
    pub windows: DownlinkWindows,
    pub payload: Vec<u8>,
}

impl ScheduledDownlink {
    pub fn windows(&self) -> Vec<&DownlinkWindow> {
        match &self.windows {
            DownlinkWindows::Both(a, b) => vec![a, b],
            DownlinkWindows::Rx2Only(a) => vec![a],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UplinkOutcome {
    Accepted,
    Duplicate,
    Rejected(String),
}

pub struct Engine {
    store: Arc<dyn Store>,
    interfaces: Arc<InterfaceManager>,
    duplicate_cache: DuplicateCache,
    config: RwLock<Config>,
    /// MAC commands queued per device awaiting the next downlink
    /// opportunity, with the instant they were queued (for macqueuelimit
    /// eviction).
    mac_queue: RwLock<HashMap<i64, Vec<(MacCommand, Instant)>>>,
    /// Last ADR LinkADRReq send time per device id, throttling the ADR
    /// control loop to `adrmessagetime` per device.
    last_adr_send: RwLock<HashMap<i64, Instant>>,
    /// Adapter-initiated downlinks (no live uplink/socket context) are
    /// handed to the gateway server loop through this channel, keyed by
    /// the target gateway's host.
    downlink_tx: mpsc::UnboundedSender<(String, ScheduledDownlink)>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        interfaces: Arc<InterfaceManager>,
        config: Config,
    ) -> (Self, mpsc::UnboundedReceiver<(String, ScheduledDownlink)>) {
        let (downlink_tx, downlink_rx) = mpsc::unbounded_channel();
        let engine = Self {
            store,
            interfaces,
            duplicate_cache: DuplicateCache::new(),
            config: RwLock::new(config),
            mac_queue: RwLock::new(HashMap::new()),
            last_adr_send: RwLock::new(HashMap::new()),
            downlink_tx,
        };
        (engine, downlink_rx)
    }

    pub async fn set_config(&self, config: Config) {
        *self.config.write().await = config;
    }

    pub async fn current_config(&self) -> Config {
        self.config.read().await.clone()
    }

    pub async fn sweep_duplicates(&self, period: Duration) {
        self.duplicate_cache.sweep(period).await;
    }

    pub async fn find_gateway(&self, host: &str) -> Result<Option<Gateway>> {
        self.store.find_gateway_by_host(host).await
    }

    fn band(&self, config: &Config) -> Box<dyn Band> {
        band_for(config.freqband)
    }

    /// Entry point mirroring `NetServer.processPushDataMessage`: verify the
    /// delivering gateway is registered and enabled (C5), decode the PHY
    /// payload, drop duplicates, and route to join or data handling.
    pub async fn process_uplink(
        &self,
        gw_host: &str,
        rxpk: &Rxpk,
        raw_payload: &[u8],
    ) -> Result<(UplinkOutcome, Vec<ScheduledDownlink>)> {
        let config = self.config.read().await.clone();

        let gateway = match self.store.find_gateway_by_host(gw_host).await? {
            Some(g) if g.enabled => g,
            Some(_) => return Ok((UplinkOutcome::Rejected(format!("gateway {gw_host} is disabled")), vec![])),
            None => return Ok((UplinkOutcome::Rejected(format!("gateway {gw_host} is not registered")), vec![])),
        };

        let frame = lorawan::decode_phy_payload(raw_payload).map_err(|e| NetServerError::MalformedFrame(e.to_string()))?;

        let mic = match &frame {
            LoRaWANFrame::JoinRequest { mic, .. } => Some(*mic),
            LoRaWANFrame::Data { mic, .. } => Some(*mic),
            _ => None,
        };
        if let Some(mic) = mic {
            if self
                .duplicate_cache
                .check_and_record(mic, Duration::from_secs(config.duplicateperiod as u64))
                .await
            {
                return Ok((UplinkOutcome::Duplicate, vec![]));
            }
        }

        match frame {
            LoRaWANFrame::JoinRequest { app_eui, dev_eui, dev_nonce, mic, mic_preimage } => {
                let downlink = self
                    .process_join(&gateway, app_eui, dev_eui, dev_nonce, mic, &mic_preimage, rxpk, &config)
                    .await?;
                Ok((UplinkOutcome::Accepted, downlink.into_iter().collect()))
            }
            LoRaWANFrame::Data {
                dev_addr,
                fctrl,
                fcnt,
                f_opts,
                f_port,
                frm_payload,
                mic,
                mic_preimage,
                mtype,
            } => {
                self.process_data(
                    &gateway,
                    dev_addr,
                    fctrl.adr,
                    fcnt,
                    &f_opts,
                    f_port,
                    &frm_payload,
                    mic,
                    &mic_preimage,
                    mtype.is_confirmed(),
                    rxpk,
                    &config,
                )
                .await
            }
            LoRaWANFrame::JoinAccept { .. } => Err(NetServerError::MalformedFrame("JoinAccept is a downlink-only message type".into())),
            LoRaWANFrame::Proprietary { .. } => Ok((UplinkOutcome::Rejected("proprietary frames are not processed".into()), vec![])),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_join(
        &self,
        gateway: &Gateway,
        app_eui: u64,
        dev_eui: u64,
        dev_nonce: u16,
        mic: u32,
        mic_preimage: &[u8],
        rxpk: &Rxpk,
        config: &Config,
    ) -> Result<Option<ScheduledDownlink>> {
        let mut device = self
            .store
            .find_device_by_deveui(dev_eui)
            .await?
            .ok_or_else(|| NetServerError::UnknownResource(format!("device {dev_eui:016X} not provisioned")))?;

        if !device.enabled {
            return Err(NetServerError::PolicyRejection("device is disabled".into()));
        }

        let application = self
            .store
            .find_application(device.application_id)
            .await?
            .ok_or_else(|| NetServerError::UnknownResource("application".into()))?;

        if application.app_eui != app_eui {
            return Err(NetServerError::AuthFailure("AppEUI mismatch".into()));
        }

        if !lorawan::check_join_request_mic(&application.app_key, mic_preimage, mic) {
            return Err(NetServerError::AuthFailure("join-request MIC check failed".into()));
        }

        if !device::check_dev_nonce(&mut device, dev_nonce) {
            return Err(NetServerError::AuthFailure("DevNonce replay".into()));
        }

        let dev_addr = if device.dev_addr != 0 {
            device.dev_addr
        } else {
            self.allocate_free_devaddr(config.otaastart, config.otaaend).await?
        };

        // AppNonce: a fresh, server-chosen 24-bit value. Not persisted
        // across restarts in this design; it only needs to be unique
        // enough to vary the derived session keys per join.
        let app_nonce = (std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_micros())
            & 0x00FF_FFFF;

        let session = keys::derive(&application.app_key, app_nonce, config.netid, dev_nonce);
        let band = self.band(config);
        let tx_chan = rxpk.chan.unwrap_or(0);
        let tx_datr = rxpk.datr.clone();

        device.dev_addr = dev_addr;
        device.nwk_s_key = session.nwk_s_key;
        device.app_s_key = session.app_s_key;
        device.fcntup = 0;
        device.fcntdown = 0;
        device.otaa = true;
        device.gw_addr = Some(gateway.host.clone());
        device.tx_chan = Some(tx_chan);
        device.tx_datr = Some(tx_datr.clone());
        device.tmst = rxpk.tmst.map(|t| t as u32);
        self.store.update_device(device.clone()).await?;

        let dl_settings = (band.rx1droffset() << 4) | (band.rx2().1 & 0x0F);
        let builder = JoinAcceptBuilder {
            app_nonce,
            net_id: config.netid,
            dev_addr,
            dl_settings,
            rx_delay: band.join_accept_delay(1) as u8,
            cf_list: vec![],
        };
        let payload = builder
            .build(&application.app_key)
            .map_err(|e| NetServerError::InvariantViolation(format!("failed to build JoinAccept: {e}")))?;

        let windows = self.schedule_windows(&*band, tx_chan, &tx_datr, rxpk.tmst.map(|t| t as u32), true);

        Ok(Some(ScheduledDownlink { windows, payload }))
    }

    /// Allocate the smallest unused DevAddr in `[start, end]`. The original
    /// Python picks an arbitrary element from a set difference
    /// (`diff.pop()`), which has no ordering guarantee; this implementation
    /// deliberately diverges from that incidental behavior because the
    /// design explicitly calls for allocating the smallest free value.
    async fn allocate_free_devaddr(&self, start: u32, end: u32) -> Result<u32> {
        let used: std::collections::HashSet<u32> = self
            .store
            .find_devices_in_range(start, end)
            .await?
            .into_iter()
            .map(|d| d.dev_addr)
            .collect();

        (start..=end)
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| NetServerError::ResourceExhausted("no free OTAA DevAddr in configured range".into()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_data(
        &self,
        gateway: &Gateway,
        dev_addr: u32,
        _adr: bool,
        fcnt16: u16,
        f_opts: &[u8],
        f_port: Option<u8>,
        frm_payload: &[u8],
        mic: u32,
        mic_preimage: &[u8],
        confirmed: bool,
        rxpk: &Rxpk,
        config: &Config,
    ) -> Result<(UplinkOutcome, Vec<ScheduledDownlink>)> {
        let band = self.band(config);

        let mut device = match self.store.find_device_by_devaddr(dev_addr).await?.into_iter().next() {
            Some(d) => d,
            None => return Ok((UplinkOutcome::Rejected("no device matched DevAddr".into()), vec![])),
        };

        if !device.enabled {
            return Ok((UplinkOutcome::Rejected("device is disabled".into()), vec![]));
        }

        // The MIC preimage's frame counter is the raw 16-bit on-air value
        // zero-extended — the high half is taken to be zero (§4.1).
        if !lorawan::check_data_mic(&device.nwk_s_key, 0, dev_addr, fcnt16 as u32, mic_preimage, mic) {
            return Ok((UplinkOutcome::Rejected("MIC check failed".into()), vec![]));
        }

        if !device::check_frame_count(&mut device, fcnt16, band_max_fcnt_gap(&*band), config.fcrelaxed) {
            self.store.update_device(device.clone()).await?;
            return Ok((UplinkOutcome::Rejected("frame counter rejected".into()), vec![]));
        }

        if let Some(snr) = rxpk.lsnr {
            device::update_snr(&mut device, snr);
        }

        let tx_chan = rxpk.chan.unwrap_or(0);
        device.gw_addr = Some(gateway.host.clone());
        device.tx_chan = Some(tx_chan);
        device.tx_datr = Some(rxpk.datr.clone());
        device.tmst = rxpk.tmst.map(|t| t as u32);

        let mut mac_responses: Vec<MacCommand> = Vec::new();
        let mut link_check_requested = false;

        // MAC commands piggybacked in FOpts, or carried alone on FPort 0.
        let command_bytes: &[u8] = if f_port == Some(0) { frm_payload } else { f_opts };
        for cmd in decode_uplink_commands(command_bytes) {
            match cmd {
                MacCommand::LinkCheckReq => link_check_requested = true,
                other => {
                    if let Some(response) = self.handle_mac_command(&device, other).await {
                        mac_responses.push(response);
                    }
                }
            }
        }

        if let Some(port) = f_port.filter(|p| *p != 0) {
            let cleartext = crate::lorawan::crypto::frm_payload_cipher(&device.app_s_key, 0, dev_addr, fcnt16 as u32, frm_payload);
            if let Ok(Some(application)) = self.store.find_application(device.application_id).await {
                if let Some(iface_id) = application.appinterface_id {
                    if let Ok(adapter) = self.interfaces.get(iface_id).await {
                        if let Err(e) = adapter.net_server_received(device.dev_eui, port, &cleartext).await {
                            warn!("application delivery failed: {}", e);
                        }
                    }
                }
            }
        }

        self.store.update_device(device.clone()).await?;

        let base_tmst = rxpk.tmst.map(|t| t as u32);
        let mut downlinks = Vec::new();

        // LinkCheckAns: its own RX2-only downlink, NwkSKey-encrypted, when
        // the server isn't queueing MAC responses; otherwise it rides the
        // ordinary FOpts queue like any other MAC response.
        if link_check_requested {
            let margin = (rxpk.lsnr.unwrap_or(0.0).round() as i32).max(0) as u8;
            let ans = MacCommand::LinkCheckAns { margin, gw_cnt: 1 };
            if config.macqueueing {
                mac_responses.push(ans);
            } else {
                device.fcntdown = device.fcntdown.wrapping_add(1);
                self.store.update_device(device.clone()).await?;
                let builder = FrameBuilder {
                    mtype: crate::lorawan::MType::UnconfirmedDataDown,
                    dev_addr,
                    fcnt: device.fcntdown,
                    f_port: 0,
                    payload: ans.encode(),
                    f_opts: vec![],
                    ack: true,
                };
                let payload = builder
                    .build(&device.nwk_s_key, &device.app_s_key)
                    .map_err(|e| NetServerError::InvariantViolation(e.to_string()))?;
                downlinks.push(ScheduledDownlink {
                    windows: self.rx2_only(&*band, base_tmst),
                    payload,
                });
            }
        }

        if config.macqueueing {
            self.enqueue_mac_responses(device.id, mac_responses).await;
            mac_responses = self.drain_mac_responses(device.id, config.macqueuelimit).await;
        }

        let f_opts_out: Vec<u8> = mac_responses.iter().flat_map(|c| c.encode()).collect();
        let needs_downlink = confirmed || !f_opts_out.is_empty();

        if needs_downlink {
            device.fcntdown = device.fcntdown.wrapping_add(1);
            self.store.update_device(device.clone()).await?;

            let builder = FrameBuilder {
                mtype: crate::lorawan::MType::UnconfirmedDataDown,
                dev_addr,
                fcnt: device.fcntdown,
                f_port: 0,
                payload: vec![],
                f_opts: f_opts_out,
                ack: confirmed,
            };
            let payload = builder
                .build(&device.nwk_s_key, &device.app_s_key)
                .map_err(|e| NetServerError::InvariantViolation(e.to_string()))?;

            downlinks.push(ScheduledDownlink {
                windows: self.schedule_windows(&*band, tx_chan, &rxpk.datr, base_tmst, false),
                payload,
            });
        }

        Ok((UplinkOutcome::Accepted, downlinks))
    }

    /// Both RX windows for a downlink following `tx_chan`/`tx_datr`'s
    /// uplink, offset from `base_tmst` by each window's receive delay.
    fn schedule_windows(&self, band: &dyn Band, tx_chan: u8, tx_datr: &str, base_tmst: Option<u32>, join: bool) -> DownlinkWindows {
        let (rx1, rx2) = band.rx_windows(tx_chan, tx_datr, join);
        DownlinkWindows::Both(
            DownlinkWindow {
                freq: rx1.freq,
                datr: rx1.datr.to_string(),
                tmst: base_tmst.map(|t| t.wrapping_add(rx1.delay * 1_000_000)),
            },
            DownlinkWindow {
                freq: rx2.freq,
                datr: rx2.datr.to_string(),
                tmst: base_tmst.map(|t| t.wrapping_add(rx2.delay * 1_000_000)),
            },
        )
    }

    /// Same as `schedule_windows`, but reading the triggering channel/
    /// datarate/tmst off the device's persisted fields instead of a live
    /// rxpk — used by `inbound_app_message`, which has no uplink of its own.
    fn schedule_windows_raw(&self, band: &dyn Band, device: &Device) -> DownlinkWindows {
        let tx_chan = device.tx_chan.unwrap_or(0);
        let tx_datr = device.tx_datr.as_deref().unwrap_or("SF7BW125");
        self.schedule_windows(band, tx_chan, tx_datr, device.tmst, false)
    }

    fn rx2_only(&self, band: &dyn Band, base_tmst: Option<u32>) -> DownlinkWindows {
        let rx2 = band.rx2_params();
        DownlinkWindows::Rx2Only(DownlinkWindow {
            freq: rx2.freq,
            datr: rx2.datr.to_string(),
            tmst: base_tmst.map(|t| t.wrapping_add(rx2.delay * 1_000_000)),
        })
    }

    /// Adapter-initiated cloud-to-device downlink: an `AppInterface`
    /// delivering an inbound message (MQTT publish, HTTPS callback, ...)
    /// calls this to enqueue a downlink for a device with no live uplink
    /// in flight. Requires the device to have an already-known gateway
    /// (set on its most recent accepted uplink).
    pub async fn inbound_app_message(&self, dev_eui: u64, f_port: u8, payload: Vec<u8>) -> Result<()> {
        let mut device = self
            .store
            .find_device_by_deveui(dev_eui)
            .await?
            .ok_or_else(|| NetServerError::UnknownResource(format!("device {dev_eui:016X} not provisioned")))?;

        if !device.enabled {
            return Err(NetServerError::PolicyRejection("device is disabled".into()));
        }
        let gw_addr = device
            .gw_addr
            .clone()
            .ok_or_else(|| NetServerError::PolicyRejection("device has no known gateway yet".into()))?;

        let config = self.config.read().await.clone();
        let band = self.band(&config);

        device.fcntdown = device.fcntdown.wrapping_add(1);
        let fcntdown = device.fcntdown;
        self.store.update_device(device.clone()).await?;

        let builder = FrameBuilder::new_downlink(device.dev_addr, fcntdown, f_port, payload);
        let phy = builder
            .build(&device.nwk_s_key, &device.app_s_key)
            .map_err(|e| NetServerError::InvariantViolation(e.to_string()))?;

        let windows = self.schedule_windows_raw(&*band, &device);
        self.downlink_tx
            .send((gw_addr, ScheduledDownlink { windows, payload: phy }))
            .map_err(|_| NetServerError::InvariantViolation("downlink dispatch channel closed".into()))?;
        Ok(())
    }

    /// Park MAC responses for the device instead of sending them on this
    /// uplink's downlink, per `macqueueing` (spec §4.6). Undelivered entries
    /// still age out via `drain_mac_responses`'s `macqueuelimit` check even
    /// if no further uplink ever arrives for this device.
    async fn enqueue_mac_responses(&self, device_id: i64, responses: Vec<MacCommand>) {
        if responses.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut queue = self.mac_queue.write().await;
        queue.entry(device_id).or_default().extend(responses.into_iter().map(|c| (c, now)));
    }

    /// Take every queued command for `device_id` younger than
    /// `macqueuelimit` seconds, dropping (and logging) anything older.
    async fn drain_mac_responses(&self, device_id: i64, macqueuelimit: u32) -> Vec<MacCommand> {
        let max_age = Duration::from_secs(macqueuelimit as u64);
        let now = Instant::now();
        let mut queue = self.mac_queue.write().await;
        let Some(entries) = queue.remove(&device_id) else {
            return Vec::new();
        };
        let mut fresh = Vec::with_capacity(entries.len());
        let mut evicted = 0;
        for (cmd, queued_at) in entries {
            if now.duration_since(queued_at) <= max_age {
                fresh.push(cmd);
            } else {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("evicted {} stale queued MAC command(s) for device {}", evicted, device_id);
        }
        fresh
    }

    /// Replace any already-queued LinkADRReq for `device_id` with `req` —
    /// the ADR loop's macqueueing branch dequeues-then-enqueues rather than
    /// piling up stale ADR requests behind fresher ones.
    async fn replace_queued_adr(&self, device_id: i64, req: MacCommand) {
        let mut queue = self.mac_queue.write().await;
        let entries = queue.entry(device_id).or_default();
        entries.retain(|(cmd, _)| !matches!(cmd, MacCommand::LinkAdrReq { .. }));
        entries.push((req, Instant::now()));
    }

    async fn handle_mac_command(&self, device: &Device, cmd: MacCommand) -> Option<MacCommand> {
        match cmd {
            MacCommand::LinkAdrAns { .. } => {
                debug!("LinkADRAns from device {:016X}: {:?}", device.dev_eui, cmd);
                None
            }
            _ => None,
        }
    }

    /// Standalone periodic ADR control cycle (spec §4.6), distinct from
    /// the reactive per-uplink MAC command handling above. Scans every
    /// enabled, ADR-enabled class-A device, and for any whose recent SNR
    /// history suggests a faster datarate, either queues or immediately
    /// sends a LinkADRReq — throttled to one attempt per `adrmessagetime`
    /// per device.
    pub async fn run_adr_cycle(&self) -> Vec<(String, ScheduledDownlink)> {
        let config = self.config.read().await.clone();
        if !config.adrenable {
            return Vec::new();
        }
        let band = self.band(&config);
        let mut outgoing = Vec::new();

        let devices = match self.store.find_all_devices().await {
            Ok(d) => d,
            Err(e) => {
                warn!("ADR cycle: failed to list devices: {}", e);
                return outgoing;
            }
        };

        for mut device in devices {
            if !device.enabled || !device.adr_enable || !device.is_class_a() {
                continue;
            }
            let Some(gw_addr) = device.gw_addr.clone() else { continue };
            let Some(new_dr) = device::get_adr_datarate(&device, &*band, 4, config.adrmargin as f64) else { continue };
            let Some(target_index) = band.datarate_index(new_dr) else { continue };

            {
                let now = Instant::now();
                let mut last = self.last_adr_send.write().await;
                if let Some(sent_at) = last.get(&device.id) {
                    if now.duration_since(*sent_at) < Duration::from_secs(config.adrmessagetime as u64) {
                        continue;
                    }
                }
                last.insert(device.id, now);
            }

            let req = MacCommand::LinkAdrReq {
                datarate: target_index,
                tx_power: 0,
                ch_mask: 0xFF,
                ch_mask_cntl: 6,
                nb_rep: 0,
            };

            if config.macqueueing {
                self.replace_queued_adr(device.id, req).await;
                continue;
            }

            device.fcntdown = device.fcntdown.wrapping_add(1);
            let fcntdown = device.fcntdown;
            if let Err(e) = self.store.update_device(device.clone()).await {
                warn!("ADR cycle: failed to persist device {}: {}", device.id, e);
                continue;
            }

            let builder = FrameBuilder {
                mtype: crate::lorawan::MType::UnconfirmedDataDown,
                dev_addr: device.dev_addr,
                fcnt: fcntdown,
                f_port: 0,
                payload: vec![],
                f_opts: req.encode(),
                ack: false,
            };
            let Ok(payload) = builder.build(&device.nwk_s_key, &device.app_s_key) else {
                continue;
            };

            outgoing.push((
                gw_addr,
                ScheduledDownlink {
                    windows: self.rx2_only(&*band, device.tmst),
                    payload,
                },
            ));
        }

        outgoing
    }

    /// Standalone periodic MAC-queue pruning task (spec §4.6), independent
    /// of `drain_mac_responses`'s reactive eviction on the next uplink.
    pub async fn prune_mac_queue(&self, macqueuelimit: u32) {
        let max_age = Duration::from_secs(macqueuelimit as u64);
        let now = Instant::now();
        let mut queue = self.mac_queue.write().await;
        queue.retain(|_, entries| {
            entries.retain(|(_, queued_at)| now.duration_since(*queued_at) <= max_age);
            !entries.is_empty()
        });
    }
}

fn band_max_fcnt_gap(_band: &dyn Band) -> u32 {
    // Every supported band uses the same 16384-frame tolerance window
    // (original_source's `max_fcnt_gap`), so this is a constant rather
    // than a per-band table entry.
    16384
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Application, DeviceClass, FreqBand, Gateway as GatewayModel};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn test_config() -> Config {
        Config {
            name: "test".into(),
            listen: "0.0.0.0".parse().unwrap(),
            port: 1700,
            webport: 8080,
            apitoken: "token".into(),
            freqband: FreqBand::US915,
            netid: 0x13,
            otaastart: 1,
            otaaend: 10,
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

    fn abp_device(dev_addr: u32, nwk_key: [u8; 16], app_key: [u8; 16]) -> Device {
        Device {
            id: 0,
            dev_eui: 0x1122,
            dev_addr,
            application_id: 1,
            name: "abp".into(),
            otaa: false,
            enabled: true,
            devclass: DeviceClass::A,
            dev_nonces: vec![],
            nwk_s_key: nwk_key,
            app_s_key: app_key,
            fcntup: 0,
            fcntdown: 0,
            fcnt_error: false,
            adr_enable: false,
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

    fn sample_gateway(host: &str) -> GatewayModel {
        GatewayModel {
            id: 0,
            host: host.into(),
            eui: [0xAA; 8],
            name: "gw".into(),
            power: 20,
            enabled: true,
            gw_addr: None,
            gw_port: None,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    fn sample_rxpk() -> Rxpk {
        Rxpk {
            time: None,
            tmst: Some(1000),
            tmms: None,
            chan: Some(0),
            rfch: Some(0),
            freq: 902.3,
            lsnr: Some(7.0),
            rssi: -80.0,
            modu: Some("LORA".into()),
            datr: "SF7BW125".into(),
            codr: Some("4/5".into()),
            size: 0,
            data: String::new(),
        }
    }

    #[tokio::test]
    async fn abp_uplink_with_valid_mic_is_accepted() {
        let store = Arc::new(MemoryStore::new());
        store.save_gateway(sample_gateway("gw-1")).await.unwrap();

        let nwk_key = [0x44; 16];
        let app_key = [0x55; 16];
        let mut device = abp_device(0x06824231, nwk_key, app_key);
        device = store.save_device(device).await.unwrap();

        let application = Application {
            id: 1,
            name: "app".into(),
            app_eui: 0,
            app_key,
            fport: Some(1),
            appinterface_id: None,
            domain: None,
        };
        store.save_application(application).await.unwrap();

        // Hand-assemble the uplink (the FrameBuilder in lorawan::encoder is
        // downlink-only — it always sets dir=1 for the MIC/cipher).
        let mut frame = vec![crate::lorawan::MType::UnconfirmedDataUp.mhdr()];
        frame.extend_from_slice(&device.dev_addr.to_le_bytes());
        frame.push(0x00);
        frame.extend_from_slice(&1u16.to_le_bytes());
        frame.push(1);
        let cipher = crate::lorawan::crypto::frm_payload_cipher(&app_key, 0, device.dev_addr, 1, b"@");
        frame.extend_from_slice(&cipher);
        let mic = crate::lorawan::crypto::data_mic(&nwk_key, 0, device.dev_addr, 1, &frame).unwrap();
        frame.extend_from_slice(&mic.to_le_bytes());

        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store.clone(), interfaces, test_config());
        let (outcome, _downlinks) = engine.process_uplink("gw-1", &sample_rxpk(), &frame).await.unwrap();
        assert_eq!(outcome, UplinkOutcome::Accepted);
    }

    #[tokio::test]
    async fn uplink_from_unregistered_gateway_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());

        let (outcome, downlinks) = engine.process_uplink("unknown-gw", &sample_rxpk(), &[0u8; 12]).await.unwrap();
        assert!(matches!(outcome, UplinkOutcome::Rejected(_)));
        assert!(downlinks.is_empty());
    }

    #[tokio::test]
    async fn uplink_from_disabled_gateway_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut gw = sample_gateway("gw-2");
        gw.enabled = false;
        store.save_gateway(gw).await.unwrap();
        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());

        let (outcome, downlinks) = engine.process_uplink("gw-2", &sample_rxpk(), &[0u8; 12]).await.unwrap();
        assert!(matches!(outcome, UplinkOutcome::Rejected(_)));
        assert!(downlinks.is_empty());
    }

    #[tokio::test]
    async fn mac_responses_drain_fresh_and_evict_stale() {
        let store = Arc::new(MemoryStore::new());
        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());

        engine.enqueue_mac_responses(1, vec![MacCommand::LinkCheckAns { margin: 10, gw_cnt: 1 }]).await;
        let drained = engine.drain_mac_responses(1, 300).await;
        assert_eq!(drained.len(), 1);

        // Draining empties the queue; a second drain finds nothing.
        assert!(engine.drain_mac_responses(1, 300).await.is_empty());
    }

    #[tokio::test]
    async fn prune_mac_queue_evicts_stale_entries() {
        let store = Arc::new(MemoryStore::new());
        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());

        engine.enqueue_mac_responses(1, vec![MacCommand::LinkCheckReq]).await;
        engine.prune_mac_queue(0).await;
        assert!(engine.drain_mac_responses(1, 300).await.is_empty());
    }

    #[tokio::test]
    async fn devaddr_allocation_picks_smallest_free_value() {
        let store = Arc::new(MemoryStore::new());
        let mut taken = abp_device(3, [0; 16], [0; 16]);
        taken.dev_eui = 1;
        store.save_device(taken).await.unwrap();
        let mut taken2 = abp_device(1, [0; 16], [0; 16]);
        taken2.dev_eui = 2;
        store.save_device(taken2).await.unwrap();

        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());
        let addr = engine.allocate_free_devaddr(1, 10).await.unwrap();
        assert_eq!(addr, 2);
    }

    #[tokio::test]
    async fn exhausted_range_is_resource_exhausted() {
        let store = Arc::new(MemoryStore::new());
        for (i, addr) in (1..=3).enumerate() {
            let mut d = abp_device(addr, [0; 16], [0; 16]);
            d.dev_eui = i as u64 + 1;
            store.save_device(d).await.unwrap();
        }
        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());
        let err = engine.allocate_free_devaddr(1, 3).await.unwrap_err();
        assert!(matches!(err, NetServerError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn inbound_app_message_without_known_gateway_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut device = abp_device(0x01, [0; 16], [0; 16]);
        device.dev_eui = 0xAABB;
        store.save_device(device).await.unwrap();

        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());
        let err = engine.inbound_app_message(0xAABB, 1, vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, NetServerError::PolicyRejection(_)));
    }

    #[tokio::test]
    async fn inbound_app_message_enqueues_a_downlink_for_a_known_device() {
        let store = Arc::new(MemoryStore::new());
        let mut device = abp_device(0x01, [0x11; 16], [0x22; 16]);
        device.dev_eui = 0xAABB;
        device.gw_addr = Some("gw-1".into());
        store.save_device(device).await.unwrap();

        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, mut downlink_rx) = Engine::new(store, interfaces, test_config());
        engine.inbound_app_message(0xAABB, 5, vec![9, 9]).await.unwrap();

        let (host, downlink) = downlink_rx.try_recv().unwrap();
        assert_eq!(host, "gw-1");
        assert_eq!(downlink.windows().len(), 2);
    }

    #[tokio::test]
    async fn adr_cycle_is_a_noop_when_disabled() {
        let store = Arc::new(MemoryStore::new());
        let interfaces = Arc::new(InterfaceManager::new());
        let (engine, _downlink_rx) = Engine::new(store, interfaces, test_config());
        assert!(engine.run_adr_cycle().await.is_empty());
    }
}
