//! Conversions between the three gateway time bases.
//!
//! - `ustime`: host microseconds since process start, monotonic.
//! - `xtime`: the 32-bit SX130x microsecond counter of one concentrator,
//!   extended to 48 bits, tagged with a per-session byte and the txunit index.
//! - `gpstime`: microseconds since the GPS epoch, known only once a PPS pulse
//!   has been reconciled with an LNS time exchange.
//!
//! Each concentrator drifts against the host clock by tens of ppm. The master
//! keeps one sync record per txunit, measured by round-tripping a `TIMESYNC`
//! command through the owning slave, and filters both the measurement quality
//! (round-trip duration) and the inferred drift through percentile thresholds
//! before accepting an update.

use core::fmt;
use std::sync::OnceLock;
use std::time::Instant;

/// Host microseconds since process start.
pub type Ustime = i64;

/// Current `ustime`: microseconds elapsed since this function was first
/// called in the process. Monotonic.
pub fn ustime_now() -> Ustime {
    static EPOCH: OnceLock<Instant> = OnceLock::new();

    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as Ustime
}

/// Extended concentrator time. See [`xtime`].
pub type Xtime = i64;

/// Microseconds since the GPS epoch.
pub type Gpstime = i64;

/// Nominal interval between timesync measurements per txunit.
pub const TIMESYNC_INTERVAL: i64 = 10_000_000;

/// Shortest interval the rejection backoff may request.
const MIN_INTERVAL: i64 = TIMESYNC_INTERVAL >> 4;

/// Quality ring length (measurement round-trip durations).
const QUALITY_RING_N: usize = 30;

/// Drift ring length per txunit.
const DRIFT_RING_N: usize = 20;

/// Measurements that completed within this round-trip time are always good.
const QUALITY_FLOOR: i64 = 200;

/// Lower clamp of the drift threshold, tenths of ppm.
const DRIFT_THRES_MIN: i64 = 2 * 10;

/// Largest drift the platform oscillator spec allows, ppm.
const PLATFORM_MAX_PPM: i64 = 200;

/// Upper clamp of the drift threshold, tenths of ppm.
const DRIFT_THRES_MAX: i64 = PLATFORM_MAX_PPM * 10;

/// Consecutive rejections before the measurement interval starts halving.
const REJECTS_TO_HALVE: u32 = 3;

/// A PPS edge may deviate this far from the second grid, microseconds.
const MAX_PPS_ERROR: i64 = 10;

/// How long a PPS sync stays usable for GPS time conversions.
const PPS_VALID: i64 = 600_000_000;

/// Extending a 32-bit counter may step backwards at most this far.
const XTICKS_DECAY: i64 = 10_000_000;

const NO_PPS_ALARM_INIT: i64 = 10_000_000;
const NO_PPS_ALARM_MAX: i64 = 3_600_000_000;

/// One second in microseconds.
const US_PER_SEC: i64 = 1_000_000;

/// `xtime` field packing.
///
/// ```text
/// bit  63    : 0 (sign)
/// bits 56..62: txunit index
/// bits 48..55: session tag, never zero
/// bits  0..47: microseconds, wrapping
/// ```
///
/// The session tag is randomised by the slave each time the concentrator is
/// (re)started, so downlink jobs whose timestamps predate a restart can be
/// recognised and refused instead of transmitting at a bogus counter value.
pub mod xtime {
    use super::Xtime;

    /// Mask of the microsecond field.
    pub const MICROS_MASK: i64 = (1 << 48) - 1;

    const SESSION_SHIFT: u32 = 48;
    const UNIT_SHIFT: u32 = 56;

    /// Build an `xtime` from its parts. `session` must be non-zero.
    pub fn mk(txunit: u8, session: u8, micros: i64) -> Xtime {
        debug_assert!(session != 0);
        debug_assert!(txunit < 0x80);

        (i64::from(txunit) << UNIT_SHIFT)
            | (i64::from(session) << SESSION_SHIFT)
            | (micros & MICROS_MASK)
    }

    /// Extract the txunit index.
    pub fn txunit(x: Xtime) -> u8 {
        ((x >> UNIT_SHIFT) & 0x7f) as u8
    }

    /// Extract the session tag.
    pub fn session(x: Xtime) -> u8 {
        ((x >> SESSION_SHIFT) & 0xff) as u8
    }

    /// Extract the microsecond field.
    pub fn micros(x: Xtime) -> i64 {
        x & MICROS_MASK
    }
}

/// One timesync measurement round-tripped through a slave.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Measurement {
    /// Host time at the measurement midpoint.
    pub ustime: Ustime,
    /// Concentrator time read in the same instant.
    pub xtime: Xtime,
    /// Concentrator time latched at the last PPS edge, `0` if none.
    pub pps_xtime: Xtime,
}

/// A time base conversion failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimesyncError {
    /// No accepted measurement exists for this txunit yet.
    NoSync {
        /// The txunit queried.
        txunit: u8,
    },
    /// The `xtime` was produced in a previous concentrator session.
    SessionMismatch {
        /// The txunit queried.
        txunit: u8,
        /// Tag of the current session.
        expected: u8,
        /// Tag carried by the stale `xtime`.
        got: u8,
    },
    /// Extending a raw 32-bit counter stepped backwards beyond the decay
    /// budget: the reference `xtime` is stale.
    Rollover,
    /// No GPS anchor has been established.
    NoGpsSync,
    /// The PPS sync is older than its validity window.
    PpsStale,
    /// GPS time was requested but no PPS has ever been tracked.
    NoPps,
}

impl std::error::Error for TimesyncError {}

impl fmt::Display for TimesyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimesyncError::NoSync { txunit } => write!(f, "no timesync for txunit {}", txunit),
            TimesyncError::SessionMismatch {
                txunit,
                expected,
                got,
            } => write!(
                f,
                "xtime session {:#04x} does not match current session {:#04x} of txunit {}",
                got, expected, txunit
            ),
            TimesyncError::Rollover => f.write_str("counter rollover beyond decay budget"),
            TimesyncError::NoGpsSync => f.write_str("no GPS anchor"),
            TimesyncError::PpsStale => f.write_str("PPS sync expired"),
            TimesyncError::NoPps => f.write_str("no PPS tracked"),
        }
    }
}

/// Extend a raw 32-bit counter value to a full `xtime` using the last known
/// `xtime` of the same session.
///
/// The extension is the natural int32 signed-difference extension; a result
/// stepping backwards more than [`XTICKS_DECAY`] indicates the reference is
/// stale (e.g. the concentrator was restarted underneath us) and fails.
pub fn xticks_to_xtime(xticks: u32, last: Xtime) -> Result<Xtime, TimesyncError> {
    let diff = i64::from(xticks.wrapping_sub(xtime::micros(last) as u32) as i32);

    let x = last + diff;

    if x < last - XTICKS_DECAY {
        return Err(TimesyncError::Rollover);
    }

    // A negative microsecond field means the diff underflowed the session
    // epoch; the conversion would be garbage.
    if xtime::micros(x) > xtime::MICROS_MASK - XTICKS_DECAY && diff < 0 {
        return Err(TimesyncError::Rollover);
    }

    Ok(x)
}

/// Ring buffer of signed samples with percentile statistics.
///
/// Thresholds are only recomputed when the ring completes a full pass so a
/// single outlier cannot drag the acceptance window around.
#[derive(Debug, Clone)]
pub struct DriftHistory {
    vals: [i64; DRIFT_RING_N],
    idx: usize,
    filled: bool,
    thres: i64,
}

impl Default for DriftHistory {
    fn default() -> Self {
        Self {
            vals: [0; DRIFT_RING_N],
            idx: 0,
            filled: false,
            thres: DRIFT_THRES_MAX,
        }
    }
}

impl DriftHistory {
    /// Record an accepted drift sample, tenths of ppm.
    ///
    /// Recomputes the rejection threshold when a full ring pass completes.
    pub fn record(&mut self, drift: i64) {
        self.vals[self.idx] = drift;
        self.idx += 1;

        if self.idx == DRIFT_RING_N {
            self.idx = 0;
            self.filled = true;

            self.thres = self
                .percentile_abs(90)
                .clamp(DRIFT_THRES_MIN, DRIFT_THRES_MAX);
        }
    }

    /// Current rejection threshold, tenths of ppm.
    pub fn threshold(&self) -> i64 {
        self.thres
    }

    /// Reset the threshold to its maximum, keeping the samples.
    pub fn reset_threshold(&mut self) {
        self.thres = DRIFT_THRES_MAX;
    }

    /// Whether `drift` lies outside the current acceptance window.
    pub fn exceeds(&self, drift: i64) -> bool {
        drift.abs() > self.thres
    }

    fn samples(&self) -> &[i64] {
        if self.filled {
            &self.vals
        } else {
            &self.vals[..self.idx]
        }
    }

    fn percentile_abs(&self, pct: usize) -> i64 {
        let samples = self.samples();

        if samples.is_empty() {
            return DRIFT_THRES_MAX;
        }

        let mut sorted: Vec<i64> = samples.iter().map(|v| v.abs()).collect();
        sorted.sort_unstable();

        let rank = (pct * sorted.len()).div_ceil(100);

        sorted[rank.saturating_sub(1)]
    }

    /// Median drift, tenths of ppm.
    pub fn q50(&self) -> i64 {
        self.percentile_signed(50)
    }

    /// 80th percentile drift, tenths of ppm.
    pub fn q80(&self) -> i64 {
        self.percentile_signed(80)
    }

    fn percentile_signed(&self, pct: usize) -> i64 {
        let samples = self.samples();

        if samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<i64> = samples.to_vec();
        sorted.sort_unstable();

        let rank = (pct * sorted.len()).div_ceil(100);

        sorted[rank.saturating_sub(1)]
    }

    /// Correct an arbitrary `ustime` span for the median observed drift.
    pub fn normalize_span(&self, span: i64) -> i64 {
        span - span * self.q50() / 10_000_000
    }
}

/// Encode a clock rate ratio as a drift value in tenths of ppm.
pub fn encode_drift_ppm(ratio: f64) -> i64 {
    ((ratio - 1.0) * 10_000_000.0).round() as i64
}

/// Decode a tenths-of-ppm drift back to parts-per-million.
pub fn decode_ppm(drift: i64) -> f64 {
    drift as f64 / 10.0
}

#[derive(Debug, Default)]
struct QualityFilter {
    vals: [i64; QUALITY_RING_N],
    idx: usize,
    filled: bool,
    thres: i64,
}

impl QualityFilter {
    /// Record a measurement duration; returns `false` if the measurement
    /// should be discarded as too noisy.
    fn accept(&mut self, quality: i64) -> bool {
        self.vals[self.idx] = quality;
        self.idx += 1;

        if self.idx == QUALITY_RING_N {
            self.idx = 0;
            self.filled = true;

            let mut sorted = self.vals;
            sorted.sort_unstable();

            self.thres = sorted[(90 * QUALITY_RING_N).div_ceil(100) - 1].max(QUALITY_FLOOR);
        }

        if !self.filled {
            // Be permissive until the ring has seen a representative set.
            return true;
        }

        quality <= self.thres
    }
}

/// A PPS sync reference: the concentrator counter and host time of a pulse
/// that landed on the second grid.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PpsSync {
    /// Concentrator time latched at the pulse.
    pub pps_xtime: Xtime,
    /// The pulse instant expressed in host time.
    pub pps_ustime: Ustime,
}

#[derive(Debug, Default)]
struct PpsTrack {
    last: Option<Measurement>,
    sync: Option<PpsSync>,
    offset: i64,
    drift: DriftHistory,
    wobble: bool,
    fresh: bool,
    last_seen: Ustime,
    alarm_window: i64,
    alarm_since: Ustime,
}

#[derive(Debug)]
struct UnitSync {
    session: u8,
    sync: Measurement,
    drift: DriftHistory,
    rejects: u32,
    interval: i64,
}

impl UnitSync {
    fn new(session: u8, m: Measurement) -> Self {
        Self {
            session,
            sync: m,
            drift: DriftHistory::default(),
            rejects: 0,
            interval: TIMESYNC_INTERVAL,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct GpsAnchor {
    gpstime: Gpstime,
    ustime: Ustime,
}

/// Master-side timesync state over all txunits.
#[derive(Debug, Default)]
pub struct Timesync {
    units: [Option<UnitSync>; crate::MAX_TXUNITS],
    quality: QualityFilter,
    pps: PpsTrack,
    gps: Option<GpsAnchor>,
}

impl Timesync {
    /// Create empty timesync state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one measurement for `txunit`. Returns the delay in microseconds
    /// until the next measurement should be scheduled.
    ///
    /// `quality` is the round-trip duration of the measurement; noisy
    /// measurements are discarded before they can disturb the drift estimate.
    pub fn update(&mut self, txunit: u8, quality: i64, m: Measurement) -> i64 {
        let unit = usize::from(txunit);

        if unit >= crate::MAX_TXUNITS {
            log::error!("timesync for out-of-range txunit {}", txunit);

            return TIMESYNC_INTERVAL;
        }

        let session = xtime::session(m.xtime);

        if !self.quality.accept(quality) {
            log::debug!(
                "txunit {}: timesync measurement discarded, quality {} us",
                txunit,
                quality
            );

            return self.interval_for(unit);
        }

        match &mut self.units[unit] {
            slot @ None => {
                log::info!("txunit {}: first timesync, session {:#04x}", txunit, session);

                *slot = Some(UnitSync::new(session, m));
            }
            Some(u) if u.session != session => {
                log::info!(
                    "txunit {}: concentrator session changed {:#04x} -> {:#04x}",
                    txunit,
                    u.session,
                    session
                );

                *u = UnitSync::new(session, m);
            }
            Some(u) => {
                let du = m.ustime - u.sync.ustime;
                let dx = m.xtime - u.sync.xtime;

                if du <= 0 || dx <= 0 {
                    log::warn!(
                        "txunit {}: non-monotonic timesync measurement dropped (du={} dx={})",
                        txunit,
                        du,
                        dx
                    );

                    return u.interval;
                }

                let drift = encode_drift_ppm(du as f64 / dx as f64);

                if u.drift.exceeds(drift) {
                    u.rejects += 1;

                    log::debug!(
                        "txunit {}: drift {} > thres {} (tenths ppm), reject #{}",
                        txunit,
                        drift,
                        u.drift.threshold(),
                        u.rejects
                    );

                    if u.rejects >= REJECTS_TO_HALVE {
                        u.interval = (u.interval / 2).max(MIN_INTERVAL);
                    }

                    if u.rejects >= 2 * REJECTS_TO_HALVE {
                        log::warn!(
                            "txunit {}: {} consecutive drift rejections, resetting threshold",
                            txunit,
                            u.rejects
                        );

                        u.drift.reset_threshold();
                    }

                    return u.interval;
                }

                u.drift.record(drift);
                u.rejects = 0;
                u.interval = TIMESYNC_INTERVAL;
                u.sync = m;
            }
        }

        if txunit == 0 {
            self.track_pps(&m);
        }

        self.interval_for(unit)
    }

    fn interval_for(&mut self, unit: usize) -> i64 {
        let interval = self.units[unit]
            .as_ref()
            .map(|u| u.interval)
            .unwrap_or(TIMESYNC_INTERVAL);

        if unit == 0 {
            self.pps_adjusted_interval(interval)
        } else {
            interval
        }
    }

    /// PPS bookkeeping for txunit 0.
    ///
    /// Two consecutive measurements with latched pulses on the second grid
    /// establish a [`PpsSync`]; the offset of the pulse within the host second
    /// is tracked so later measurements can be steered away from the pulse
    /// instant (the latch is disabled while the chip is being polled).
    fn track_pps(&mut self, m: &Measurement) {
        let now = m.ustime;

        if m.pps_xtime == 0 {
            self.check_pps_alarm(now);

            return;
        }

        self.last_pps_seen(now);

        if let Some(last) = self.pps.last {
            let diff = m.pps_xtime - last.pps_xtime;

            if diff > 0 {
                let err = diff.rem_euclid(US_PER_SEC);
                let err = err.min(US_PER_SEC - err);

                if err > MAX_PPS_ERROR {
                    log::warn!("PPS edge {} us off the second grid, sample rejected", err);

                    self.pps.last = Some(*m);

                    return;
                }

                if let Some(sync) = &self.pps.sync {
                    // Same grid test against the established sync, at 1/10 ppm.
                    let span = m.pps_xtime - sync.pps_xtime;

                    if span > 0 {
                        let drift = encode_drift_ppm(span as f64 / (span - err).max(1) as f64);

                        if self.pps.drift.exceeds(drift) {
                            log::warn!("PPS drift {} tenths ppm over threshold", drift);

                            self.pps.last = Some(*m);

                            return;
                        }

                        self.pps.drift.record(drift);
                    }
                }

                if let Ok(pps_ustime) = self.xtime_to_ustime(m.pps_xtime) {
                    let had_sync = self.pps.sync.is_some();

                    self.pps.sync = Some(PpsSync {
                        pps_xtime: m.pps_xtime,
                        pps_ustime,
                    });
                    self.pps.offset = pps_ustime.rem_euclid(US_PER_SEC);
                    self.pps.fresh = true;

                    if !had_sync {
                        log::info!(
                            "PPS sync established, offset {} us into the host second",
                            self.pps.offset
                        );
                    }
                }
            }
        }

        self.pps.last = Some(*m);
    }

    fn last_pps_seen(&mut self, now: Ustime) {
        self.pps.last_seen = now;
        self.pps.alarm_window = NO_PPS_ALARM_INIT;
        self.pps.alarm_since = now;
    }

    fn check_pps_alarm(&mut self, now: Ustime) {
        if self.pps.last_seen == 0 {
            // Never saw a pulse; nothing to alarm about (no GPS wired up).
            return;
        }

        if self.pps.alarm_window == 0 {
            self.pps.alarm_window = NO_PPS_ALARM_INIT;
            self.pps.alarm_since = now;
        }

        if now - self.pps.alarm_since > self.pps.alarm_window {
            log::error!(
                "no PPS pulse for {} s",
                (now - self.pps.last_seen) / US_PER_SEC
            );

            self.pps.alarm_window = (self.pps.alarm_window * 2).min(NO_PPS_ALARM_MAX);
            self.pps.alarm_since = now;
        }
    }

    /// Steer the next measurement toward the midpoint between two expected
    /// pulses, with a ±0.1 s alternating wobble, so the PPS-latch disable
    /// window never coincides with the pulse itself.
    fn pps_adjusted_interval(&mut self, interval: i64) -> i64 {
        let Some(sync) = &self.pps.sync else {
            return interval;
        };

        if !self.pps.fresh {
            return interval;
        }

        self.pps.fresh = false;

        let target = US_PER_SEC / 2
            + if self.pps.wobble {
                US_PER_SEC / 10
            } else {
                -(US_PER_SEC / 10)
            };

        self.pps.wobble = !self.pps.wobble;

        let next = sync.pps_ustime + interval;
        let phase = (next - self.pps.offset).rem_euclid(US_PER_SEC);

        let mut adjust = target - phase;

        if adjust < -US_PER_SEC / 2 {
            adjust += US_PER_SEC;
        }

        interval + adjust
    }

    /// The current PPS sync, if one is established.
    pub fn pps_sync(&self) -> Option<PpsSync> {
        self.pps.sync
    }

    /// Offset of the PPS pulse within the host second, microseconds.
    pub fn pps_offset(&self) -> i64 {
        self.pps.offset
    }

    /// Session tag currently associated with `txunit`.
    pub fn session(&self, txunit: u8) -> Option<u8> {
        self.units.get(usize::from(txunit))?.as_ref().map(|u| u.session)
    }

    /// Last accepted `xtime` for `txunit`, used to extend raw counter values.
    pub fn last_xtime(&self, txunit: u8) -> Option<Xtime> {
        self.units
            .get(usize::from(txunit))?
            .as_ref()
            .map(|u| u.sync.xtime)
    }

    /// Convert a concentrator time to host time.
    ///
    /// Fails hard on a session tag mismatch: the `xtime` predates a
    /// concentrator restart and must not be used for scheduling.
    pub fn xtime_to_ustime(&self, x: Xtime) -> Result<Ustime, TimesyncError> {
        let txunit = xtime::txunit(x);

        let u = self.unit(txunit)?;

        let session = xtime::session(x);

        if session != u.session {
            return Err(TimesyncError::SessionMismatch {
                txunit,
                expected: u.session,
                got: session,
            });
        }

        Ok(u.sync.ustime + (x - u.sync.xtime))
    }

    /// Convert a host time to the `xtime` of `txunit`.
    pub fn ustime_to_xtime(&self, txunit: u8, ustime: Ustime) -> Result<Xtime, TimesyncError> {
        let u = self.unit(txunit)?;

        Ok(u.sync.xtime + (ustime - u.sync.ustime))
    }

    /// Re-express an `xtime` in the time base of another txunit.
    pub fn xtime_to_xtime(&self, x: Xtime, dst_txunit: u8) -> Result<Xtime, TimesyncError> {
        let ustime = self.xtime_to_ustime(x)?;

        self.ustime_to_xtime(dst_txunit, ustime)
    }

    /// Record a *fuzzy* GPS anchor: the LNS timestamp is taken on faith at the
    /// midpoint of the request round trip.
    pub fn gps_anchor_fuzzy(&mut self, txtime: Ustime, rxtime: Ustime, gpstime: Gpstime) {
        let mid = txtime + (rxtime - txtime) / 2;

        self.gps = Some(GpsAnchor {
            gpstime,
            ustime: mid,
        });

        log::info!("fuzzy GPS anchor at gpstime {} us", gpstime);
    }

    /// Record a *strict* GPS anchor.
    ///
    /// Enumerates candidate second boundaries within the round-trip window and
    /// accepts only if exactly one lands on the tracked PPS grid. Returns
    /// `false` (without touching state) when the exchange is unusable.
    pub fn gps_anchor_strict(
        &mut self,
        txtime: Ustime,
        rxtime: Ustime,
        gpstime: Gpstime,
    ) -> Result<bool, TimesyncError> {
        if self.pps.sync.is_none() {
            return Err(TimesyncError::NoPps);
        }

        let mut candidate = None;
        let mut count = 0;

        // First second boundary at or after txtime.
        let mut t = txtime - (txtime - self.pps.offset).rem_euclid(US_PER_SEC);

        if t < txtime {
            t += US_PER_SEC;
        }

        while t <= rxtime {
            candidate = Some(t);
            count += 1;
            t += US_PER_SEC;
        }

        if count != 1 {
            log::debug!(
                "strict GPS anchor: {} candidate boundaries in a {} us window",
                count,
                rxtime - txtime
            );

            return Ok(false);
        }

        let boundary = candidate.ok_or(TimesyncError::NoGpsSync)?;

        // The LNS gpstime refers to a moment inside the round trip; its
        // enclosing second boundary anchors to the candidate pulse.
        let gps_boundary = (gpstime + US_PER_SEC / 2) / US_PER_SEC * US_PER_SEC;

        if let Some(prev) = &self.gps {
            let span = boundary - prev.ustime;

            if span > 0 {
                let expected = prev.gpstime + span;
                let dev = gps_boundary - expected;
                let drift = dev * 10_000_000 / span;

                let thres = self
                    .unit(0)
                    .map(|u| u.drift.threshold())
                    .unwrap_or(DRIFT_THRES_MAX);

                if drift.abs() > thres {
                    log::warn!(
                        "strict GPS anchor drifts {} tenths ppm from tracked PPS, rejected",
                        drift
                    );

                    return Ok(false);
                }
            }
        }

        self.gps = Some(GpsAnchor {
            gpstime: gps_boundary,
            ustime: boundary,
        });

        log::info!("strict GPS anchor at gpstime {} us", gps_boundary);

        Ok(true)
    }

    /// Convert a concentrator time to GPS time.
    pub fn xtime_to_gpstime(&self, x: Xtime) -> Result<Gpstime, TimesyncError> {
        let anchor = self.gps.ok_or(TimesyncError::NoGpsSync)?;

        self.check_pps_valid()?;

        let ustime = self.xtime_to_ustime(x)?;

        Ok(anchor.gpstime + (ustime - anchor.ustime))
    }

    /// Convert a GPS time to the `xtime` of `txunit`.
    pub fn gpstime_to_xtime(&self, txunit: u8, gpstime: Gpstime) -> Result<Xtime, TimesyncError> {
        let anchor = self.gps.ok_or(TimesyncError::NoGpsSync)?;

        self.check_pps_valid()?;

        let ustime = anchor.ustime + (gpstime - anchor.gpstime);

        self.ustime_to_xtime(txunit, ustime)
    }

    fn check_pps_valid(&self) -> Result<(), TimesyncError> {
        let Some(_) = &self.pps.sync else {
            // Fuzzy-only operation: no PPS wired up, accept the anchor as-is.
            return Ok(());
        };

        let newest = self
            .unit(0)
            .map(|u| u.sync.ustime)
            .unwrap_or(self.pps.last_seen);

        if newest - self.pps.last_seen > PPS_VALID {
            return Err(TimesyncError::PpsStale);
        }

        Ok(())
    }

    fn unit(&self, txunit: u8) -> Result<&UnitSync, TimesyncError> {
        self.units
            .get(usize::from(txunit))
            .and_then(|u| u.as_ref())
            .ok_or(TimesyncError::NoSync { txunit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SESSION: u8 = 0x5a;

    fn meas(txunit: u8, ustime: i64, micros: i64, pps: i64) -> Measurement {
        Measurement {
            ustime,
            xtime: xtime::mk(txunit, SESSION, micros),
            pps_xtime: if pps == 0 {
                0
            } else {
                xtime::mk(txunit, SESSION, pps)
            },
        }
    }

    fn synced(txunit: u8) -> Timesync {
        let mut ts = Timesync::new();

        ts.update(txunit, 50, meas(txunit, 1_000_000, 500_000, 0));
        ts.update(txunit, 50, meas(txunit, 2_000_000, 1_500_000, 0));

        ts
    }

    #[test]
    fn xtime_packing() {
        let x = xtime::mk(3, 0xab, 123_456);

        assert_eq!(xtime::txunit(x), 3);
        assert_eq!(xtime::session(x), 0xab);
        assert_eq!(xtime::micros(x), 123_456);
        assert!(x > 0);
    }

    #[test]
    fn xticks_extension_is_int32_diff() {
        let last = xtime::mk(0, SESSION, 0x1_0000_1000);

        // Forward step.
        let x = xticks_to_xtime(0x2000, last).unwrap();
        assert_eq!(x, last + 0x1000);

        // Small backwards step stays within the decay budget.
        let x = xticks_to_xtime(0x0800, last).unwrap();
        assert_eq!(x, last - 0x0800);

        // Wrap of the raw counter still extends forward.
        let last = xtime::mk(0, SESSION, 0xffff_ff00);
        let x = xticks_to_xtime(0x0000_0100, last).unwrap();
        assert_eq!(xtime::micros(x), 0x1_0000_0100);
    }

    #[test]
    fn xticks_rollover_beyond_decay_fails() {
        let last = xtime::mk(0, SESSION, 60_000_000);

        // ~30 s backwards, far over the decay budget.
        let stale = (60_000_000u32).wrapping_sub(30_000_000);

        assert_eq!(xticks_to_xtime(stale, last), Err(TimesyncError::Rollover));
    }

    #[test]
    fn ustime_xtime_roundtrip() {
        let ts = synced(1);

        for u in [2_000_000i64, 2_345_678, 10_000_000] {
            let x = ts.ustime_to_xtime(1, u).unwrap();
            assert_eq!(ts.xtime_to_ustime(x).unwrap(), u);
        }
    }

    #[test]
    fn xtime_to_xtime_roundtrip() {
        let mut ts = Timesync::new();

        ts.update(0, 50, meas(0, 1_000_000, 100, 0));
        ts.update(0, 50, meas(0, 2_000_000, 1_000_100, 0));
        ts.update(1, 50, meas(1, 1_000_000, 777_000, 0));
        ts.update(1, 50, meas(1, 2_000_000, 1_777_000, 0));

        let x0 = ts.ustime_to_xtime(0, 5_000_000).unwrap();
        let x1 = ts.xtime_to_xtime(x0, 1).unwrap();

        assert_eq!(ts.xtime_to_xtime(x1, 0).unwrap(), x0);
    }

    #[test]
    fn session_mismatch_fails_hard() {
        let ts = synced(0);

        let stale = xtime::mk(0, SESSION ^ 0xff, 1_500_000);

        assert_eq!(
            ts.xtime_to_ustime(stale),
            Err(TimesyncError::SessionMismatch {
                txunit: 0,
                expected: SESSION,
                got: SESSION ^ 0xff,
            })
        );
    }

    #[test]
    fn session_change_resets_unit() {
        let mut ts = synced(0);

        let m = Measurement {
            ustime: 3_000_000,
            xtime: xtime::mk(0, 0x77, 100),
            pps_xtime: 0,
        };

        ts.update(0, 50, m);

        assert_eq!(ts.session(0), Some(0x77));

        // Old-session conversions now fail.
        assert!(ts.xtime_to_ustime(xtime::mk(0, SESSION, 200)).is_err());
    }

    #[test]
    fn drift_encode_decode_law() {
        for delta in [0.0, 12.3e-6, -44.0e-6, 1.5e-6] {
            let enc = encode_drift_ppm(1.0 + delta);

            assert!((decode_ppm(enc) - delta * 1e6).abs() < 0.05, "delta {}", delta);
        }
    }

    #[test]
    fn drift_threshold_stays_clamped() {
        let mut hist = DriftHistory::default();

        // Zero-mean samples with bounded support.
        for i in 0..DRIFT_RING_N as i64 {
            hist.record(if i % 2 == 0 { 30 } else { -30 });
        }

        assert!(hist.threshold() >= DRIFT_THRES_MIN);
        assert!(hist.threshold() <= DRIFT_THRES_MAX);
        assert_eq!(hist.threshold(), 30);

        // Tiny samples clamp up to the floor.
        for _ in 0..DRIFT_RING_N {
            hist.record(1);
        }

        assert_eq!(hist.threshold(), DRIFT_THRES_MIN);

        // Wild samples clamp down to the platform max.
        for _ in 0..DRIFT_RING_N {
            hist.record(99_999);
        }

        assert_eq!(hist.threshold(), DRIFT_THRES_MAX);
    }

    #[test]
    fn drift_threshold_monotone_in_percentile() {
        let mut lo = DriftHistory::default();
        let mut hi = DriftHistory::default();

        for i in 0..DRIFT_RING_N as i64 {
            lo.record(25 + i % 3);
            hi.record(50 + i % 3);
        }

        assert!(lo.threshold() <= hi.threshold());
    }

    #[test]
    fn rejections_halve_interval_then_reset_threshold() {
        let mut ts = Timesync::new();

        // Establish a tight threshold: identical 1:1 measurements.
        let mut u = 1_000_000i64;
        let mut x = 500_000i64;

        ts.update(0, 50, meas(0, u, x, 0));

        for _ in 0..DRIFT_RING_N + 1 {
            u += 1_000_000;
            x += 1_000_000;
            ts.update(0, 50, meas(0, u, x, 0));
        }

        let thres = ts.units[0].as_ref().unwrap().drift.threshold();
        assert_eq!(thres, DRIFT_THRES_MIN);

        // Now feed measurements drifting at ~150 ppm; all rejected against the
        // tight threshold.
        let mut interval = TIMESYNC_INTERVAL;

        for n in 1..=2 * REJECTS_TO_HALVE {
            u += 1_000_150;
            x += 1_000_000;

            interval = ts.update(0, 50, meas(0, u, x, 0));

            if n < REJECTS_TO_HALVE {
                assert_eq!(interval, TIMESYNC_INTERVAL, "reject #{}", n);
            }
        }

        assert!(interval < TIMESYNC_INTERVAL);

        // After 2k rejections the threshold has been reset to max, so the
        // next drifting measurement is accepted again.
        u += 1_000_150;
        x += 1_000_000;
        ts.update(0, 50, meas(0, u, x, 0));

        assert_eq!(ts.units[0].as_ref().unwrap().rejects, 0);
    }

    #[test]
    fn quality_gate_discards_noisy_measurements() {
        let mut ts = Timesync::new();

        let mut u = 1_000_000i64;
        let mut x = 500_000i64;

        // Fill the quality ring with good measurements.
        for _ in 0..QUALITY_RING_N + 1 {
            ts.update(0, 50, meas(0, u, x, 0));
            u += 1_000_000;
            x += 1_000_000;
        }

        let before = ts.units[0].as_ref().unwrap().sync;

        // An extremely slow measurement must not move the sync record.
        ts.update(0, 1_000_000, meas(0, u, x, 0));

        assert_eq!(ts.units[0].as_ref().unwrap().sync, before);
    }

    #[test]
    fn pps_acquisition() {
        let mut ts = Timesync::new();

        // Two consecutive timesyncs 1.000002 s apart in ustime whose latched
        // pulses are exactly 1.000000 s apart.
        ts.update(0, 50, meas(0, 1_000_000, 500_000, 400_000));
        ts.update(0, 50, meas(0, 2_000_002, 1_500_002, 1_400_000));

        let sync = ts.pps_sync().expect("PPS sync should be established");

        assert_eq!(xtime::micros(sync.pps_xtime), 1_400_000);

        // The pulse instant mapped into ustime, modulo one second.
        let pps_ustime = ts.xtime_to_ustime(sync.pps_xtime).unwrap();
        assert_eq!(ts.pps_offset(), pps_ustime.rem_euclid(1_000_000));

        // An LNS exchange then enables gpstime conversions.
        ts.gps_anchor_fuzzy(2_000_000, 2_100_000, 1_400_000_000_000_000);

        let x = ts.ustime_to_xtime(0, 3_000_000).unwrap();
        let g = ts.xtime_to_gpstime(x).unwrap();

        assert_eq!(g, 1_400_000_000_000_000 + (3_000_000 - 2_050_000));
    }

    #[test]
    fn pps_off_grid_is_rejected() {
        let mut ts = Timesync::new();

        ts.update(0, 50, meas(0, 1_000_000, 500_000, 400_000));
        // Pulse 1.005 s after the previous one: way off the grid.
        ts.update(0, 50, meas(0, 2_000_000, 1_500_000, 1_405_000));

        assert!(ts.pps_sync().is_none());
    }

    #[test]
    fn strict_anchor_needs_exactly_one_boundary() {
        let mut ts = Timesync::new();

        ts.update(0, 50, meas(0, 1_000_000, 500_000, 400_000));
        ts.update(0, 50, meas(0, 2_000_000, 1_500_000, 1_400_000));

        assert!(ts.pps_sync().is_some());
        let offset = ts.pps_offset();

        // Window containing exactly one boundary at offset + k s.
        let tx = offset + 4 * US_PER_SEC - 200_000;
        let rx = offset + 4 * US_PER_SEC + 300_000;

        assert_eq!(ts.gps_anchor_strict(tx, rx, 1_000_000_000_123_456).unwrap(), true);

        // A window spanning two boundaries is ambiguous.
        let tx = offset + 5 * US_PER_SEC - 200_000;
        let rx = offset + 6 * US_PER_SEC + 200_000;

        assert_eq!(ts.gps_anchor_strict(tx, rx, 1_000_002_000_123_456).unwrap(), false);
    }

    #[test]
    fn gpstime_roundtrip() {
        let mut ts = synced(0);

        ts.gps_anchor_fuzzy(2_000_000, 2_000_200, 1_300_000_000_000_000);

        let x = ts.ustime_to_xtime(0, 4_000_000).unwrap();
        let g = ts.xtime_to_gpstime(x).unwrap();

        assert_eq!(ts.gpstime_to_xtime(0, g).unwrap(), x);
    }

    #[test]
    fn gpstime_without_anchor_fails() {
        let ts = synced(0);

        let x = ts.ustime_to_xtime(0, 3_000_000).unwrap();

        assert_eq!(ts.xtime_to_gpstime(x), Err(TimesyncError::NoGpsSync));
    }
}
