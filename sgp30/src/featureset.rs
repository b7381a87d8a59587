//! Catalog of the profiles each SGP30 featureset supports.
//!
//! A profile is a command the chip executes on its own schedule: after the
//! command is written the host waits `duration_us` and can then read
//! `signals.len()` result words. The chip sends the result words in reverse
//! order of `signals`.

use crate::SensirionCommand;

/// Identifies a profile within a featureset.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileId {
    IaqInit = 0,
    IaqMeasure = 1,
    IaqGetBaseline = 2,
    IaqSetBaseline = 3,
    MeasureSignals = 4,
    SetAbsoluteHumidity = 5,
}

/// Turns a raw chip word into engineering units.
#[derive(Clone, Copy, Debug)]
pub enum Conversion {
    Identity,
    Function(fn(u16) -> u16),
}

impl Conversion {
    pub fn apply(&self, raw: u16) -> u16 {
        match self {
            Conversion::Identity => raw,
            Conversion::Function(convert) => convert(raw),
        }
    }
}

#[derive(Debug)]
pub struct Signal {
    pub name: &'static str,
    pub conversion: Conversion,
}

impl Signal {
    const fn raw(name: &'static str) -> Self {
        Self {
            name,
            conversion: Conversion::Identity,
        }
    }
}

#[derive(Debug)]
pub struct Profile {
    pub id: ProfileId,
    pub command: u16,
    pub duration_us: u32,
    pub signals: &'static [Signal],
}

impl Profile {
    pub fn result_words(&self) -> usize {
        self.signals.len()
    }
}

impl SensirionCommand for Profile {
    fn raw(&self) -> u16 {
        self.command
    }
}

#[derive(Debug)]
pub struct Featureset {
    pub name: &'static str,
    pub supported_versions: &'static [u16],
    pub profiles: &'static [Profile],
}

impl Featureset {
    /// Selected when the chip's version matches nothing in the catalog.
    pub const UNKNOWN: Featureset = Featureset {
        name: "unknown",
        supported_versions: &[],
        profiles: &[],
    };

    pub fn lookup(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn is_unknown(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn supports(&self, raw_version: u16) -> bool {
        self.supported_versions
            .iter()
            .any(|candidate| is_compatible(raw_version, *candidate))
    }
}

const PRODUCT_TYPE_MASK: u16 = 0xf000;
const ENGINEERING_SAMPLE_MASK: u16 = 0x0100;
const MAJOR_VERSION_MASK: u16 = 0x00e0;
const MINOR_VERSION_MASK: u16 = 0x001f;

/// Checks a chip featureset version against a version the catalog supports.
///
/// Bits 9-11 are reserved and never compared. When the candidate has a
/// major version the minor version is ignored, otherwise it must match
/// exactly. An engineering sample never matches a release candidate.
pub fn is_compatible(chip: u16, candidate: u16) -> bool {
    let mask = if candidate & MAJOR_VERSION_MASK > 0 {
        PRODUCT_TYPE_MASK | ENGINEERING_SAMPLE_MASK | MAJOR_VERSION_MASK
    } else {
        PRODUCT_TYPE_MASK | ENGINEERING_SAMPLE_MASK | MAJOR_VERSION_MASK | MINOR_VERSION_MASK
    };
    chip & mask == candidate & mask
}

/// Returns the first catalog featureset accepting `raw_version`.
pub fn detect(raw_version: u16) -> Option<&'static Featureset> {
    SUPPORTED_FEATURESETS
        .iter()
        .copied()
        .find(|featureset| featureset.supports(raw_version))
}

const TVOC_PPB: Signal = Signal::raw("tVOC");
const CO2_EQ_PPM: Signal = Signal::raw("CO2eq");
const TVOC_BASELINE: Signal = Signal::raw("tVOC baseline");
const CO2_EQ_BASELINE: Signal = Signal::raw("CO2eq baseline");
const SCALED_ETHANOL: Signal = Signal::raw("scaled ethanol");
const SCALED_H2: Signal = Signal::raw("scaled H2");

pub const SGP30_FEATURESET: Featureset = Featureset {
    name: "SGP30",
    supported_versions: &[0x0020, 0x0022],
    profiles: &[
        Profile {
            id: ProfileId::IaqInit,
            command: 0x2003,
            duration_us: 10_000,
            signals: &[],
        },
        Profile {
            id: ProfileId::IaqMeasure,
            command: 0x2008,
            duration_us: 12_000,
            signals: &[TVOC_PPB, CO2_EQ_PPM],
        },
        Profile {
            id: ProfileId::IaqGetBaseline,
            command: 0x2015,
            duration_us: 10_000,
            signals: &[TVOC_BASELINE, CO2_EQ_BASELINE],
        },
        Profile {
            id: ProfileId::IaqSetBaseline,
            command: 0x201e,
            duration_us: 10_000,
            signals: &[],
        },
        Profile {
            id: ProfileId::MeasureSignals,
            command: 0x2050,
            duration_us: 25_000,
            signals: &[SCALED_ETHANOL, SCALED_H2],
        },
        Profile {
            id: ProfileId::SetAbsoluteHumidity,
            command: 0x2061,
            duration_us: 10_000,
            signals: &[],
        },
    ],
};

pub const SUPPORTED_FEATURESETS: &[&Featureset] = &[&SGP30_FEATURESET];

/// Most result words any catalog profile returns.
pub const fn max_profile_words() -> usize {
    let mut max = 0;
    let mut i = 0;
    while i < SUPPORTED_FEATURESETS.len() {
        let profiles = SUPPORTED_FEATURESETS[i].profiles;
        let mut j = 0;
        while j < profiles.len() {
            if profiles[j].signals.len() > max {
                max = profiles[j].signals.len();
            }
            j += 1;
        }
        i += 1;
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_version_ignored_when_major_is_set() {
        for minor in 0..=MINOR_VERSION_MASK {
            assert!(is_compatible(0x0020 | minor, 0x0020));
            assert!(is_compatible(0x0020, 0x0020 | minor));
        }
    }

    #[test]
    fn major_version_must_match() {
        for major in [0x0000, 0x0040, 0x0060, 0x00e0] {
            for minor in 0..=MINOR_VERSION_MASK {
                assert!(!is_compatible(major | minor, 0x0020));
            }
        }
    }

    #[test]
    fn minor_version_must_match_without_major() {
        assert!(is_compatible(0x0009, 0x0009));
        assert!(!is_compatible(0x0008, 0x0009));
        assert!(!is_compatible(0x0029, 0x0009));
    }

    #[test]
    fn reserved_bits_are_ignored() {
        assert!(is_compatible(0x0e20, 0x0020));
        assert!(is_compatible(0x0209, 0x0009));
    }

    #[test]
    fn product_type_and_engineering_bit_must_match() {
        assert!(!is_compatible(0x1020, 0x0020));
        assert!(!is_compatible(0x0120, 0x0020));
        assert!(!is_compatible(0x0109, 0x0009));
    }

    #[test]
    fn detects_sgp30() {
        let featureset = detect(0x0022).unwrap();
        assert_eq!(featureset.name, "SGP30");
        assert!(!featureset.is_unknown());
    }

    #[test]
    fn unknown_version_is_not_detected() {
        assert!(detect(0x1020).is_none());
        assert!(detect(0x0040).is_none());
    }

    #[test]
    fn lookup_by_id() {
        let featureset = &SGP30_FEATURESET;
        let profile = featureset.lookup(ProfileId::MeasureSignals).unwrap();
        assert_eq!(profile.raw(), 0x2050);
        assert_eq!(profile.result_words(), 2);

        assert!(Featureset::UNKNOWN.lookup(ProfileId::IaqInit).is_none());
    }

    #[test]
    fn conversion_falls_back_to_identity() {
        fn double(raw: u16) -> u16 {
            raw * 2
        }

        assert_eq!(Conversion::Identity.apply(21), 21);
        assert_eq!(Conversion::Function(double).apply(21), 42);
    }

    #[test]
    fn largest_result_is_two_words() {
        assert_eq!(max_profile_words(), 2);
    }
}
