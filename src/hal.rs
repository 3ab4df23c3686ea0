//! Concentrator driver interface.
//!
//! The vendor HAL is a library boundary: the slave process talks to one chip
//! through the [`Hal`] trait and nothing else. [`open`] hands out the driver
//! selected by the chip configuration; without real hardware that is the
//! deterministic simulation used by the test suite and bench setups.

use crate::error::HalError;
use heapless::Vec as HVec;
use serde::Deserialize;

/// Modulation of a received or transmitted packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Modulation {
    /// LoRa chirp spread spectrum.
    Lora,
    /// FSK.
    Fsk,
}

/// CRC state of a received frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrcStatus {
    /// CRC present and correct.
    Ok,
    /// CRC present and wrong.
    Bad,
    /// No CRC on air.
    NoCrc,
}

/// TX scheduling mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxMode {
    /// Emit when the internal counter reaches `count_us`.
    Timestamped,
    /// Emit on the PPS edge following `count_us`.
    OnGps,
}

/// State of the single TX path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxState {
    /// Nothing queued.
    Free,
    /// A packet is queued for a future counter value.
    Scheduled,
    /// A packet is on air right now.
    Emitting,
}

/// Outcome of submitting a TX packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// Queued for transmission.
    Ok,
    /// Listen-before-talk found the channel occupied.
    LbtBusy,
    /// The packet was rejected.
    Error,
}

/// A frame received by the concentrator.
#[derive(Debug, Clone)]
pub struct RxPacket {
    /// Internal 32-bit microsecond counter at end of reception.
    pub count_us: u32,
    /// Centre frequency, Hz.
    pub freq_hz: u32,
    /// Received signal strength, dBm.
    pub rssi: f32,
    /// Signal to noise ratio, dB. Meaningless for FSK.
    pub snr: f32,
    /// Modulation.
    pub modulation: Modulation,
    /// Spreading factor for LoRa, ignored for FSK.
    pub datarate: u8,
    /// Bandwidth, Hz.
    pub bandwidth: u32,
    /// Frame payload.
    pub payload: HVec<u8, { crate::MAX_FRAME_LEN }>,
    /// CRC state.
    pub crc_status: CrcStatus,
}

/// A frame to be transmitted.
#[derive(Debug, Clone)]
pub struct TxPacket {
    /// Counter value anchoring the transmission.
    pub count_us: u32,
    /// Centre frequency, Hz.
    pub freq_hz: u32,
    /// TX power, dBm.
    pub power: i8,
    /// Modulation.
    pub modulation: Modulation,
    /// Spreading factor for LoRa.
    pub datarate: u8,
    /// Bandwidth, Hz.
    pub bandwidth: u32,
    /// Preamble length in symbols.
    pub preamble: u16,
    /// Send without an explicit header (beacons).
    pub no_header: bool,
    /// Invert chirp polarity (downlinks are inverted, beacons are not).
    pub invert_pol: bool,
    /// Omit the payload CRC.
    pub no_crc: bool,
    /// Scheduling mode.
    pub mode: TxMode,
    /// Frame payload.
    pub payload: HVec<u8, { crate::MAX_FRAME_LEN }>,
}

/// Per-chip configuration handed to the driver, parsed from `slave-<i>.conf`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChipConf {
    /// Device node or driver selector, e.g. `/dev/spidev0.0` or `sim`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Run the chip-specific init script before starting the HAL.
    #[serde(default)]
    pub init_script: Option<String>,
    /// Antenna wired to this chip.
    #[serde(default)]
    pub antenna: crate::ral::AntennaType,
    /// Nominal TX power limit, dBm.
    #[serde(default = "default_txpow")]
    pub max_txpow: i8,
}

fn default_device() -> String {
    "sim".into()
}

fn default_txpow() -> i8 {
    27
}

/// One concentrator chip.
///
/// All calls are non-blocking register/FIFO operations on the order of SPI
/// transfer times; none of them suspends.
pub trait Hal {
    /// Start the radio with the configuration given at open time.
    fn start(&mut self) -> Result<(), HalError>;

    /// Stop the radio.
    fn stop(&mut self) -> Result<(), HalError>;

    /// Submit a TX packet.
    fn send(&mut self, pkt: &TxPacket) -> Result<SendStatus, HalError>;

    /// Query the TX path state.
    fn status(&mut self) -> Result<TxState, HalError>;

    /// Abort any scheduled or ongoing transmission.
    fn abort_tx(&mut self) -> Result<(), HalError>;

    /// Fetch up to `max` received packets.
    fn receive(&mut self, max: usize) -> Result<Vec<RxPacket>, HalError>;

    /// Read the instantaneous 32-bit microsecond counter.
    fn get_instcnt(&mut self) -> Result<u32, HalError>;

    /// Read the counter value latched at the last PPS edge.
    fn get_trigcnt(&mut self) -> Result<u32, HalError>;

    /// Enable or disable latching of the counter on PPS edges.
    ///
    /// Latching is disabled while the counter is being polled so a pulse
    /// cannot land mid-readout.
    fn set_gps_enable(&mut self, enable: bool) -> Result<(), HalError>;
}

/// Open the driver selected by `conf`.
pub fn open(conf: &ChipConf) -> Result<Box<dyn Hal + Send>, HalError> {
    match conf.device.as_str() {
        "sim" => Ok(Box::new(sim::SimHal::new(conf.clone()))),
        other => {
            log::error!("no driver for device `{}`", other);

            Err(HalError::Start)
        }
    }
}

pub mod sim {
    //! A deterministic software concentrator.
    //!
    //! Time is derived from a monotonic host instant; frames to "receive" are
    //! injected through [`SimHal::inject_rx`].

    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Simulated concentrator chip.
    pub struct SimHal {
        #[allow(dead_code)]
        conf: ChipConf,
        started: bool,
        epoch: Instant,
        rx_fifo: VecDeque<RxPacket>,
        tx_queue: Option<TxPacket>,
        gps_enabled: bool,
        trig_at: u32,
    }

    impl SimHal {
        /// Create a stopped simulated chip.
        pub fn new(conf: ChipConf) -> Self {
            Self {
                conf,
                started: false,
                epoch: Instant::now(),
                rx_fifo: VecDeque::new(),
                tx_queue: None,
                gps_enabled: false,
                trig_at: 0,
            }
        }

        /// Queue a frame for the next [`Hal::receive`] call.
        pub fn inject_rx(&mut self, pkt: RxPacket) {
            self.rx_fifo.push_back(pkt);
        }

        fn now(&self) -> u32 {
            self.epoch.elapsed().as_micros() as u32
        }
    }

    impl Hal for SimHal {
        fn start(&mut self) -> Result<(), HalError> {
            self.started = true;
            self.epoch = Instant::now();

            Ok(())
        }

        fn stop(&mut self) -> Result<(), HalError> {
            self.started = false;
            self.tx_queue = None;

            Ok(())
        }

        fn send(&mut self, pkt: &TxPacket) -> Result<SendStatus, HalError> {
            if !self.started {
                return Err(HalError::NotStarted);
            }

            self.tx_queue = Some(pkt.clone());

            Ok(SendStatus::Ok)
        }

        fn status(&mut self) -> Result<TxState, HalError> {
            if !self.started {
                return Err(HalError::NotStarted);
            }

            let now = self.now();

            let pending = self
                .tx_queue
                .as_ref()
                .map(|pkt| pkt.count_us.wrapping_sub(now) < 0x8000_0000);

            Ok(match pending {
                None => TxState::Free,
                Some(true) => TxState::Scheduled,
                Some(false) => {
                    // Past its counter value; pretend it went out.
                    self.tx_queue = None;

                    TxState::Free
                }
            })
        }

        fn abort_tx(&mut self) -> Result<(), HalError> {
            self.tx_queue = None;

            Ok(())
        }

        fn receive(&mut self, max: usize) -> Result<Vec<RxPacket>, HalError> {
            if !self.started {
                return Err(HalError::NotStarted);
            }

            let n = max.min(self.rx_fifo.len());

            Ok(self.rx_fifo.drain(..n).collect())
        }

        fn get_instcnt(&mut self) -> Result<u32, HalError> {
            if !self.started {
                return Err(HalError::NotStarted);
            }

            Ok(self.now())
        }

        fn get_trigcnt(&mut self) -> Result<u32, HalError> {
            if !self.started {
                return Err(HalError::NotStarted);
            }

            if self.gps_enabled {
                // Latched at the last whole simulated second.
                self.trig_at = self.now() / 1_000_000 * 1_000_000;
            }

            Ok(self.trig_at)
        }

        fn set_gps_enable(&mut self, enable: bool) -> Result<(), HalError> {
            self.gps_enabled = enable;

            Ok(())
        }
    }
}
