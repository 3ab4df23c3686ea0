//! Mapping of logical uplink channels onto chip IF/RF resources.
//!
//! An SX130x chip has two RF front-ends and ten IF modems. Modems 0..7 listen
//! on 125 kHz multi-SF LoRa channels, modem 8 is the single fast-LoRa modem
//! (250/500 kHz) and modem 9 is FSK-only. Each front-end downconverts one
//! contiguous window; a channel can only be attached to a front-end whose
//! centre frequency ends up within the admissible offset for the channel's
//! bandwidth.
//!
//! The allocator is a pure function over the requested channel list. Results
//! are reported through a phase callback so the master can populate per-slave
//! channel sets while a slave can drive its HAL setup off the same code.

use crate::ral::Rps;

/// IF modems per chip.
pub const MODEMS_PER_CHIP: usize = 10;

/// Modems serving 125 kHz multi-SF LoRa channels.
pub const MULTISF_MODEMS: usize = 8;

/// The fast-LoRa modem index (250/500 kHz).
pub const FAST_MODEM: usize = 8;

/// The FSK modem index.
pub const FSK_MODEM: usize = 9;

/// RF front-ends per chip.
pub const RFF_PER_CHIP: usize = 2;

/// Largest admissible offset between a channel and its front-end centre
/// frequency, by channel bandwidth.
pub fn max_coff(bw: u32) -> i64 {
    i64::from((1_000_000 - bw) / 2)
}

/// A logical channel to be placed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChDef {
    /// Centre frequency, Hz.
    pub freq: u32,
    /// Radio parameters; the bandwidth and FSK/LoRa distinction drive modem
    /// selection.
    pub rps: Rps,
}

/// Allocation progress, emitted in order.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AllocPhase {
    /// Allocation begins.
    Start,
    /// Placement for one chip begins.
    ChipStart {
        /// Chip index.
        chip: usize,
    },
    /// One channel was placed.
    Ch {
        /// Chip index.
        chip: usize,
        /// IF modem index on that chip.
        modem: usize,
        /// RF front-end index on that chip.
        rff: usize,
        /// The channel.
        ch: ChDef,
    },
    /// Placement for one chip is complete.
    ChipDone {
        /// Chip index.
        chip: usize,
        /// Final centre frequency per front-end, `None` if unused.
        rff_freq: [Option<u32>; RFF_PER_CHIP],
        /// Lowest and highest channel frequency on this chip.
        span: (u32, u32),
        /// Number of modems in use.
        modems: usize,
    },
    /// Allocation finished.
    Done {
        /// Channels that fit on no chip. Callers treat a non-zero count as a
        /// configuration warning, not an error.
        unassigned: usize,
    },
}

/// Admissible centre-frequency interval of one RF front-end.
///
/// Every attached channel `f` with offset limit `c` constrains the centre to
/// `[f - c, f + c]`; the front-end is usable as long as the intersection is
/// non-empty. The final centre is the interval midpoint.
#[derive(Debug, Copy, Clone)]
struct RfFrontend {
    lo: i64,
    hi: i64,
    min_freq: u32,
    max_freq: u32,
    used: bool,
}

impl RfFrontend {
    fn new() -> Self {
        Self {
            lo: i64::MIN,
            hi: i64::MAX,
            min_freq: u32::MAX,
            max_freq: 0,
            used: false,
        }
    }

    /// Try to attach a channel; returns `false` (without changing state) if
    /// the admissible interval would become empty.
    fn absorb(&mut self, freq: u32, coff: i64) -> bool {
        let lo = self.lo.max(i64::from(freq) - coff);
        let hi = self.hi.min(i64::from(freq) + coff);

        if lo > hi {
            return false;
        }

        self.lo = lo;
        self.hi = hi;
        self.min_freq = self.min_freq.min(freq);
        self.max_freq = self.max_freq.max(freq);
        self.used = true;

        true
    }

    fn center(&self) -> Option<u32> {
        self.used.then(|| ((self.lo + self.hi) / 2) as u32)
    }
}

/// Place `channels` onto `num_chips` chips, reporting through `emit`.
///
/// Returns the number of channels that could not be placed.
pub fn assign<F: FnMut(AllocPhase)>(num_chips: usize, channels: &[ChDef], mut emit: F) -> usize {
    let mut placed = vec![false; channels.len()];

    emit(AllocPhase::Start);

    for chip in 0..num_chips {
        if placed.iter().all(|p| *p) {
            break;
        }

        emit(AllocPhase::ChipStart { chip });

        let mut rffs = [RfFrontend::new(); RFF_PER_CHIP];
        let mut modems = 0usize;
        let mut span = (u32::MAX, 0u32);

        let mut place = |rffs: &mut [RfFrontend; RFF_PER_CHIP],
                         span: &mut (u32, u32),
                         ch: &ChDef,
                         coff: i64|
         -> Option<usize> {
            let rff = (0..RFF_PER_CHIP).find(|&r| rffs[r].absorb(ch.freq, coff))?;

            span.0 = span.0.min(ch.freq);
            span.1 = span.1.max(ch.freq);

            Some(rff)
        };

        // 125 kHz multi-SF LoRa channels onto modems 0..7.
        let mut next_modem = 0usize;

        for (i, ch) in channels.iter().enumerate() {
            if placed[i] || ch.rps.is_fsk() || ch.rps.bw() != 125_000 {
                continue;
            }

            if next_modem >= MULTISF_MODEMS {
                break;
            }

            if let Some(rff) = place(&mut rffs, &mut span, ch, max_coff(125_000)) {
                placed[i] = true;
                modems += 1;

                emit(AllocPhase::Ch {
                    chip,
                    modem: next_modem,
                    rff,
                    ch: *ch,
                });

                next_modem += 1;
            }
        }

        // At most one FSK channel onto modem 9, with relaxed tolerance.
        for (i, ch) in channels.iter().enumerate() {
            if placed[i] || !ch.rps.is_fsk() {
                continue;
            }

            if let Some(rff) = place(&mut rffs, &mut span, ch, 2 * max_coff(125_000)) {
                placed[i] = true;
                modems += 1;

                emit(AllocPhase::Ch {
                    chip,
                    modem: FSK_MODEM,
                    rff,
                    ch: *ch,
                });
            }

            break;
        }

        // At most one fast-LoRa channel onto modem 8.
        for (i, ch) in channels.iter().enumerate() {
            if placed[i] || ch.rps.is_fsk() || ch.rps.bw() == 125_000 {
                continue;
            }

            if let Some(rff) = place(&mut rffs, &mut span, ch, max_coff(ch.rps.bw())) {
                placed[i] = true;
                modems += 1;

                emit(AllocPhase::Ch {
                    chip,
                    modem: FAST_MODEM,
                    rff,
                    ch: *ch,
                });
            }

            break;
        }

        emit(AllocPhase::ChipDone {
            chip,
            rff_freq: [rffs[0].center(), rffs[1].center()],
            span: if modems == 0 { (0, 0) } else { span },
            modems,
        });
    }

    let unassigned = placed.iter().filter(|p| !**p).count();

    emit(AllocPhase::Done { unassigned });

    unassigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lora125(freq: u32) -> ChDef {
        ChDef {
            freq,
            rps: Rps::lora(7, 125_000),
        }
    }

    fn collect(num_chips: usize, channels: &[ChDef]) -> (Vec<AllocPhase>, usize) {
        let mut phases = Vec::new();

        let unassigned = assign(num_chips, channels, |p| phases.push(p));

        (phases, unassigned)
    }

    /// Every placed channel must sit within the admissible offset of its
    /// front-end's final centre frequency.
    fn check_offsets(phases: &[AllocPhase]) {
        let mut chans: Vec<(usize, usize, ChDef)> = Vec::new();

        for phase in phases {
            match phase {
                AllocPhase::Ch { chip, rff, ch, .. } => chans.push((*chip, *rff, *ch)),
                AllocPhase::ChipDone { chip, rff_freq, .. } => {
                    for (c, rff, ch) in chans.iter().filter(|(c, ..)| c == chip) {
                        let center = rff_freq[*rff].expect("used front-end has a centre");

                        let coff = if ch.rps.is_fsk() {
                            2 * max_coff(125_000)
                        } else {
                            max_coff(ch.rps.bw())
                        };

                        assert!(
                            (i64::from(ch.freq) - i64::from(center)).abs() <= coff,
                            "chip {} rff {} channel {:?} outside window around {}",
                            c,
                            rff,
                            ch,
                            center
                        );
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn eu868_plan_fits_one_chip() {
        // Classic 8-channel EU868 plan plus FSK and a 250 kHz fast channel.
        let mut channels: Vec<ChDef> = [
            868_100_000,
            868_300_000,
            868_500_000,
            867_100_000,
            867_300_000,
            867_500_000,
            867_700_000,
            867_900_000,
        ]
        .iter()
        .map(|f| lora125(*f))
        .collect();

        channels.push(ChDef {
            freq: 868_800_000,
            rps: Rps::fsk(),
        });
        channels.push(ChDef {
            freq: 868_300_000,
            rps: Rps::lora(7, 250_000),
        });

        let (phases, unassigned) = collect(1, &channels);

        assert_eq!(unassigned, 0);
        check_offsets(&phases);

        let modems = phases
            .iter()
            .filter(|p| matches!(p, AllocPhase::Ch { .. }))
            .count();

        assert_eq!(modems, 10);

        // The fast channel went to modem 8, FSK to modem 9.
        assert!(phases.iter().any(|p| matches!(
            p,
            AllocPhase::Ch {
                modem: FAST_MODEM,
                ..
            }
        )));
        assert!(phases.iter().any(|p| matches!(
            p,
            AllocPhase::Ch {
                modem: FSK_MODEM,
                ..
            }
        )));
    }

    #[test]
    fn overflow_spills_to_second_chip() {
        // 10 LoRa channels: only 8 multi-SF modems per chip.
        let channels: Vec<ChDef> = (0..10)
            .map(|i| lora125(867_000_000 + i * 200_000))
            .collect();

        let (phases, unassigned) = collect(2, &channels);

        assert_eq!(unassigned, 0);
        check_offsets(&phases);

        let on_chip1 = phases
            .iter()
            .filter(|p| matches!(p, AllocPhase::Ch { chip: 1, .. }))
            .count();

        assert_eq!(on_chip1, 2);
    }

    #[test]
    fn too_wide_plan_leaves_channels_unassigned() {
        // Two channels 30 MHz apart cannot share a front-end, and a single
        // chip's second front-end absorbs the second one. A third at yet
        // another band stays unplaced.
        let channels = [
            lora125(868_100_000),
            lora125(898_100_000),
            lora125(920_100_000),
        ];

        let (phases, unassigned) = collect(1, &channels);

        assert_eq!(unassigned, 1);
        check_offsets(&phases);
    }

    #[test]
    fn single_fsk_per_chip() {
        let channels = [
            ChDef {
                freq: 868_800_000,
                rps: Rps::fsk(),
            },
            ChDef {
                freq: 868_900_000,
                rps: Rps::fsk(),
            },
        ];

        let (phases, unassigned) = collect(1, &channels);

        // Only one FSK modem per chip.
        assert_eq!(unassigned, 1);

        let fsk_placed = phases
            .iter()
            .filter(|p| matches!(p, AllocPhase::Ch { modem: FSK_MODEM, .. }))
            .count();

        assert_eq!(fsk_placed, 1);
    }
}
