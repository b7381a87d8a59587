use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use getset::CopyGetters;
use heapless::Vec;

use crate::featureset::{self, Featureset, Profile, ProfileId};
use crate::{Error, ParsingError, SensirionCommand, SensirionI2c, ValidationError};

pub const DEFAULT_ADDRESS: u8 = 0x58;
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Added to every profile duration before the result is read.
pub const COMMAND_DURATION_MARGIN_US: u32 = 5;
/// Self-test result of a healthy chip.
pub const SELF_TEST_OK: u16 = 0xd400;
/// Raw signals are reported multiplied by this factor.
pub const SIGNAL_SCALE_FACTOR: u16 = 512;
/// Upper bound of [`Sgp30::set_absolute_humidity`] in mg/m³.
pub const MAX_ABSOLUTE_HUMIDITY: u32 = 256_000;

const SERIAL_ID_WORDS: usize = 2;
const FEATURESET_WORDS: usize = 1;
const SELF_TEST_WORDS: usize = 1;

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Capacity of the result scratch buffer.
pub const MAX_RESULT_WORDS: usize = max(
    featureset::max_profile_words(),
    max(SERIAL_ID_WORDS, max(FEATURESET_WORDS, SELF_TEST_WORDS)),
);

/// Commands that exist on every chip regardless of its featureset.
#[repr(u16)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Command {
    GetSerialId = 0x3682,
    GetFeatureset = 0x202f,
    MeasureTest = 0x2032,
}

impl Command {
    fn duration_us(&self) -> u32 {
        match self {
            Command::GetSerialId => 500,
            Command::GetFeatureset => 1_000,
            Command::MeasureTest => 220_000,
        }
    }
}

impl SensirionCommand for Command {
    fn raw(&self) -> u16 {
        *self as u16
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No command outstanding.
    Idle,
    /// A profile was issued and its result has not been read yet.
    Measuring,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, CopyGetters)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[get_copy = "pub"]
pub struct ChipInfo {
    /// 48-bit serial id.
    pub serial_id: u64,
    /// Raw featureset word as reported by the chip.
    pub feature_set_version: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[get_copy = "pub"]
pub struct FeatureSetVersion {
    pub version: u8,
    /// 0 for SGP30, 1 for SGPC3.
    pub product_type: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[get_copy = "pub"]
pub struct Iaq {
    pub tvoc_ppb: u16,
    pub co2_eq_ppm: u16,
}

/// Raw gas signals, both multiplied by [`SIGNAL_SCALE_FACTOR`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[get_copy = "pub"]
pub struct Signals {
    pub scaled_ethanol: u16,
    pub scaled_h2: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[get_copy = "pub"]
pub struct SelfTest {
    pub code: u16,
}

impl SelfTest {
    pub fn passed(&self) -> bool {
        self.code == SELF_TEST_OK
    }
}

pub struct Sgp30<T, D>
where
    T: I2c,
    D: DelayNs,
{
    bus: SensirionI2c<T>,
    delay: D,
    address: u8,
    state: State,
    info: ChipInfo,
    featureset: &'static Featureset,
    words: Vec<u16, MAX_RESULT_WORDS>,
}

impl<T, D> Sgp30<T, D>
where
    T: I2c,
    D: DelayNs,
{
    pub fn new(i2c: T, delay: D) -> Self {
        Self::new_with_address(i2c, delay, DEFAULT_ADDRESS)
    }

    pub fn new_with_address(i2c: T, delay: D, address: u8) -> Self {
        Self {
            bus: SensirionI2c::new(i2c),
            delay,
            address,
            state: State::Idle,
            info: ChipInfo::default(),
            featureset: &Featureset::UNKNOWN,
            words: Vec::new(),
        }
    }

    pub fn release(self) -> (T, D) {
        (self.bus.release(), self.delay)
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn info(&self) -> ChipInfo {
        self.info
    }

    pub fn serial_id(&self) -> u64 {
        self.info.serial_id
    }

    /// Featureset selected by the last probe.
    pub fn featureset(&self) -> &'static Featureset {
        self.featureset
    }

    /// Featureset version and product type cached by the last probe.
    pub fn feature_set_version(&self) -> FeatureSetVersion {
        raw_data_processing::feature_set_version(self.info.feature_set_version)
    }

    /// Checks that an SGP is present, detects its featureset and initializes
    /// the IAQ algorithm.
    ///
    /// When the featureset is unknown the probe fails, but the self-test stays
    /// usable.
    pub async fn probe(&mut self) -> Result<(), Error<T::Error>> {
        self.state = State::Idle;

        let mut serial = [0u16; SERIAL_ID_WORDS];
        self.bus
            .write_read_words(
                self.address,
                &Command::GetSerialId,
                &mut serial,
                Command::GetSerialId.duration_us(),
                &mut self.delay,
            )
            .await?;
        self.info.serial_id = raw_data_processing::serial_id(&serial);

        let mut version = [0u16; FEATURESET_WORDS];
        self.bus
            .write_read_words(
                self.address,
                &Command::GetFeatureset,
                &mut version,
                Command::GetFeatureset.duration_us(),
                &mut self.delay,
            )
            .await?;
        self.info.feature_set_version = version[0];

        match featureset::detect(version[0]) {
            Some(featureset) => {
                debug!("featureset {:#x} is {}", version[0], featureset.name);
                self.featureset = featureset;
            }
            None => {
                warn!("unsupported featureset {:#x}", version[0]);
                self.featureset = &Featureset::UNKNOWN;
                return Err(ValidationError::UnknownFeatureset.into());
            }
        }

        self.iaq_init().await
    }

    /// Resets the chip's IAQ baseline. Measurements are meaningless for the
    /// first 15 seconds afterwards.
    pub async fn iaq_init(&mut self) -> Result<(), Error<T::Error>> {
        self.run_profile(ProfileId::IaqInit).await?;
        Ok(())
    }

    /// Runs the on-chip self-test, blocking for about 220 ms.
    ///
    /// Bus and checksum failures are errors. A chip that answers with anything
    /// other than [`SELF_TEST_OK`] is reported through [`SelfTest::passed`].
    pub async fn self_test(&mut self) -> Result<SelfTest, Error<T::Error>> {
        let mut result = [0u16; SELF_TEST_WORDS];
        self.bus
            .write_read_words(
                self.address,
                &Command::MeasureTest,
                &mut result,
                Command::MeasureTest.duration_us(),
                &mut self.delay,
            )
            .await?;

        let test = SelfTest { code: result[0] };
        if !test.passed() {
            warn!("self-test failed with {:#x}", test.code);
        }
        Ok(test)
    }

    /// Starts an IAQ measurement. Poll [`Self::read_iaq`] for the result.
    pub async fn measure_iaq(&mut self) -> Result<(), Error<T::Error>> {
        self.issue(ProfileId::IaqMeasure).await
    }

    pub async fn read_iaq(&mut self) -> Result<Iaq, Error<T::Error>> {
        let (tvoc_ppb, co2_eq_ppm) =
            raw_data_processing::pair(self.read_result(ProfileId::IaqMeasure).await?)?;
        Ok(Iaq {
            tvoc_ppb,
            co2_eq_ppm,
        })
    }

    pub async fn measure_iaq_blocking(&mut self) -> Result<Iaq, Error<T::Error>> {
        let (tvoc_ppb, co2_eq_ppm) =
            raw_data_processing::pair(self.run_profile(ProfileId::IaqMeasure).await?)?;
        Ok(Iaq {
            tvoc_ppb,
            co2_eq_ppm,
        })
    }

    pub async fn measure_tvoc(&mut self) -> Result<(), Error<T::Error>> {
        self.measure_iaq().await
    }

    pub async fn read_tvoc(&mut self) -> Result<u16, Error<T::Error>> {
        Ok(self.read_iaq().await?.tvoc_ppb)
    }

    pub async fn measure_tvoc_blocking(&mut self) -> Result<u16, Error<T::Error>> {
        Ok(self.measure_iaq_blocking().await?.tvoc_ppb)
    }

    pub async fn measure_co2_eq(&mut self) -> Result<(), Error<T::Error>> {
        self.measure_iaq().await
    }

    pub async fn read_co2_eq(&mut self) -> Result<u16, Error<T::Error>> {
        Ok(self.read_iaq().await?.co2_eq_ppm)
    }

    pub async fn measure_co2_eq_blocking(&mut self) -> Result<u16, Error<T::Error>> {
        Ok(self.measure_iaq_blocking().await?.co2_eq_ppm)
    }

    /// Starts a raw signal measurement. Poll [`Self::read_signals`] for the
    /// result.
    pub async fn measure_signals(&mut self) -> Result<(), Error<T::Error>> {
        self.issue(ProfileId::MeasureSignals).await
    }

    pub async fn read_signals(&mut self) -> Result<Signals, Error<T::Error>> {
        let (scaled_ethanol, scaled_h2) =
            raw_data_processing::pair(self.read_result(ProfileId::MeasureSignals).await?)?;
        Ok(Signals {
            scaled_ethanol,
            scaled_h2,
        })
    }

    pub async fn measure_signals_blocking(&mut self) -> Result<Signals, Error<T::Error>> {
        let (scaled_ethanol, scaled_h2) =
            raw_data_processing::pair(self.run_profile(ProfileId::MeasureSignals).await?)?;
        Ok(Signals {
            scaled_ethanol,
            scaled_h2,
        })
    }

    /// Reads the IAQ baseline for persisting.
    ///
    /// The chip only reports a valid baseline about an hour after
    /// [`Self::iaq_init`]; until then this fails with
    /// [`ValidationError::InvalidBaseline`].
    pub async fn get_baseline(&mut self) -> Result<u32, Error<T::Error>> {
        let (low, high) =
            raw_data_processing::pair(self.run_profile(ProfileId::IaqGetBaseline).await?)?;
        let baseline = u32::from(high) << 16 | u32::from(low);

        if !is_valid_baseline(baseline) {
            return Err(ValidationError::InvalidBaseline.into());
        }
        Ok(baseline)
    }

    /// Restores a baseline obtained from [`Self::get_baseline`]. Baselines
    /// older than a week should not be restored.
    pub async fn set_baseline(&mut self, baseline: u32) -> Result<(), Error<T::Error>> {
        if !is_valid_baseline(baseline) {
            return Err(ValidationError::InvalidBaseline.into());
        }
        let profile = self.profile(ProfileId::IaqSetBaseline)?;

        self.bus
            .write_command_with_args(
                self.address,
                profile,
                &[baseline as u16, (baseline >> 16) as u16],
            )
            .await?;
        self.delay
            .delay_us(profile.duration_us + COMMAND_DURATION_MARGIN_US)
            .await;

        Ok(())
    }

    /// Sets the absolute humidity in mg/m³ used for compensation. Zero
    /// disables the compensation.
    pub async fn set_absolute_humidity(
        &mut self,
        absolute_humidity: u32,
    ) -> Result<(), Error<T::Error>> {
        let profile = self.profile(ProfileId::SetAbsoluteHumidity)?;
        let scaled = raw_data_processing::scale_absolute_humidity(absolute_humidity)?;

        self.bus
            .write_command_with_args(self.address, profile, &[scaled])
            .await?;
        self.delay
            .delay_us(profile.duration_us + COMMAND_DURATION_MARGIN_US)
            .await;

        Ok(())
    }

    fn profile(&self, id: ProfileId) -> Result<&'static Profile, Error<T::Error>> {
        let featureset: &'static Featureset = self.featureset;
        featureset.lookup(id).ok_or_else(|| {
            warn!("profile {} not in featureset {}", id as u16, featureset.name);
            ValidationError::UnsupportedProfile.into()
        })
    }

    /// Writes the profile command, waits for it to finish and reads the
    /// result right away. The engine is idle again afterwards.
    async fn run_profile(&mut self, id: ProfileId) -> Result<&[u16], Error<T::Error>> {
        let profile = self.profile(id)?;

        self.bus.write_command(self.address, profile).await?;
        self.delay
            .delay_us(profile.duration_us + COMMAND_DURATION_MARGIN_US)
            .await;

        if profile.result_words() == 0 {
            self.words.clear();
            return Ok(self.words.as_slice());
        }

        self.state = State::Measuring;
        if let Err(e) = self.read_measurement(profile).await {
            self.state = State::Idle;
            return Err(e);
        }
        Ok(self.words.as_slice())
    }

    /// Writes the profile command without waiting.
    async fn issue(&mut self, id: ProfileId) -> Result<(), Error<T::Error>> {
        let profile = self.profile(id)?;

        self.bus.write_command(self.address, profile).await?;
        self.state = State::Measuring;
        trace!("issued profile {}", id as u16);

        Ok(())
    }

    async fn read_result(&mut self, id: ProfileId) -> Result<&[u16], Error<T::Error>> {
        let profile = self.profile(id)?;
        self.read_measurement(profile).await?;
        Ok(self.words.as_slice())
    }

    /// A failed read leaves the engine measuring, so the caller may poll
    /// again without reissuing the command.
    async fn read_measurement(&mut self, profile: &Profile) -> Result<(), Error<T::Error>> {
        if self.state != State::Measuring {
            return Err(Error::NotMeasuring);
        }

        let mut raw = [0u16; MAX_RESULT_WORDS];
        let raw = raw
            .get_mut(..profile.result_words())
            .ok_or(ParsingError::Length)?;
        if let Err(e) = self.bus.read_words(self.address, raw).await {
            debug!("profile {} not ready", profile.id as u16);
            return Err(e);
        }

        raw_data_processing::unpack_signals(profile, raw, &mut self.words)?;
        self.state = State::Idle;

        Ok(())
    }
}

/// Zero is what the chip reports before it has a baseline.
pub fn is_valid_baseline(baseline: u32) -> bool {
    baseline != 0
}

mod raw_data_processing {
    use super::*;

    /// Reorders the chip words into the profile's signal order and converts
    /// them. The chip sends the last declared signal first.
    pub(super) fn unpack_signals(
        profile: &Profile,
        raw: &[u16],
        words: &mut Vec<u16, MAX_RESULT_WORDS>,
    ) -> Result<(), ParsingError> {
        words.clear();
        for (signal, value) in profile.signals.iter().zip(raw.iter().rev()) {
            words
                .push(signal.conversion.apply(*value))
                .map_err(|_| ParsingError::Length)?;
        }
        Ok(())
    }

    pub(super) fn pair(words: &[u16]) -> Result<(u16, u16), ParsingError> {
        match words {
            [first, second, ..] => Ok((*first, *second)),
            _ => Err(ParsingError::Length),
        }
    }

    /// Decodes the serial words big-endian into the top of a 64-bit value and
    /// keeps the upper 48 bits.
    pub(super) fn serial_id(words: &[u16; SERIAL_ID_WORDS]) -> u64 {
        let mut bytes = [0u8; 8];
        for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        u64::from_be_bytes(bytes) >> 16
    }

    pub(super) fn feature_set_version(raw: u16) -> FeatureSetVersion {
        FeatureSetVersion {
            version: (raw & 0x00ff) as u8,
            product_type: ((raw & 0xf000) >> 12) as u8,
        }
    }

    /// Scales mg/m³ to the chip's 8.8 fixed point g/m³ without floats:
    /// 16777 / 2^24 approximates 1 / 1000.
    pub(super) fn scale_absolute_humidity(absolute_humidity: u32) -> Result<u16, ValidationError> {
        if absolute_humidity > MAX_ABSOLUTE_HUMIDITY {
            return Err(ValidationError::HumidityOutOfRange);
        }
        Ok(((u64::from(absolute_humidity) * 256 * 16777) >> 24) as u16)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::featureset::{Conversion, Signal};

        fn plus_one(raw: u16) -> u16 {
            raw + 1
        }

        const A: Signal = Signal {
            name: "a",
            conversion: Conversion::Function(plus_one),
        };
        const B: Signal = Signal {
            name: "b",
            conversion: Conversion::Identity,
        };

        const PROFILE: Profile = Profile {
            id: ProfileId::IaqMeasure,
            command: 0x2008,
            duration_us: 12_000,
            signals: &[A, B],
        };

        #[test]
        fn signals_are_reversed_and_converted() {
            let mut words = Vec::new();

            unpack_signals(&PROFILE, &[10, 20], &mut words).unwrap();

            assert_eq!(words.as_slice(), &[21, 10]);
        }

        #[test]
        fn serial_keeps_upper_48_bits() {
            assert_eq!(serial_id(&[0x1234, 0x5678]), 0x1234_5678_0000);
        }

        #[test]
        fn product_type_from_high_nibble() {
            let version = feature_set_version(0x1022);

            assert_eq!(version.version(), 0x22);
            assert_eq!(version.product_type(), 1);
        }

        #[test]
        fn humidity_scaling() {
            assert_eq!(scale_absolute_humidity(0), Ok(0));
            assert_eq!(scale_absolute_humidity(1_000), Ok(255));
            assert_eq!(scale_absolute_humidity(11_570), Ok(2961));
            assert_eq!(scale_absolute_humidity(MAX_ABSOLUTE_HUMIDITY), Ok(0xffff));
            assert_eq!(
                scale_absolute_humidity(MAX_ABSOLUTE_HUMIDITY + 1),
                Err(ValidationError::HumidityOutOfRange)
            );
        }

        #[test]
        fn pair_needs_two_words() {
            assert_eq!(pair(&[1, 2]), Ok((1, 2)));
            assert_eq!(pair(&[1]), Err(ParsingError::Length));
        }
    }
}
