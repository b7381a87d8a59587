//! Async driver for the Sensirion SGP30 air-quality sensor.
//!
//! The SGP30 runs "profiles", short command sequences with a fixed execution
//! time and a fixed number of result words. The driver keeps a catalog of the
//! profiles each chip featureset supports (see [`featureset`]), detects the
//! featureset at probe time and then exposes typed operations through
//! [`sgp30::Sgp30`].
//!
//! Every data word on the wire is protected by a CRC-8. Inbound words are
//! checked one by one and a single mismatch fails the whole read.
#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("Features \"defmt\" and \"log\" are mutually exclusive");

#[macro_use]
mod fmt;

pub mod featureset;
pub mod humidity;
pub mod sgp30;

use crc_all::Crc;
use embedded_hal_async::{delay::DelayNs, i2c::I2c};

/// Length of a data word on the wire.
pub const WORD_LEN: usize = 2;
/// Length of the checksum following every data word.
pub const CRC_LEN: usize = 1;
/// Length of a command opcode.
pub const COMMAND_LEN: usize = 2;

/// Largest number of argument words any command takes.
const MAX_ARGUMENT_WORDS: usize = 2;
const MAX_WRITE_LEN: usize = COMMAND_LEN + MAX_ARGUMENT_WORDS * (WORD_LEN + CRC_LEN);

pub trait SensirionCommand {
    fn raw(&self) -> u16;
}

#[derive(Debug)]
pub enum Error<Inner: core::fmt::Debug> {
    Bus(Inner),
    Parsing(ParsingError),
    Validation(ValidationError),
    /// A result was requested although no command is outstanding.
    NotMeasuring,
}

impl<E: embedded_hal_async::i2c::Error> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Bus(e)
    }
}

#[cfg(feature = "defmt")]
impl<E: embedded_hal_async::i2c::Error + defmt::Format> defmt::Format for Error<E> {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::Bus(e) => e.format(fmt),
            Error::Parsing(e) => e.format(fmt),
            Error::Validation(e) => e.format(fmt),
            Error::NotMeasuring => defmt::write!(fmt, "NotMeasuring"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParsingError {
    Crc,
    /// The read does not fit the scratch buffer.
    Length,
}

impl<T: core::fmt::Debug> From<ParsingError> for Error<T> {
    fn from(e: ParsingError) -> Self {
        Error::Parsing(e)
    }
}

/// Input rejected before anything was put on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ValidationError {
    /// The active featureset has no such profile.
    UnsupportedProfile,
    /// The chip reported a featureset version no catalog entry accepts.
    UnknownFeatureset,
    /// Zero is the "never measured" baseline and is never valid.
    InvalidBaseline,
    HumidityOutOfRange,
}

impl<T: core::fmt::Debug> From<ValidationError> for Error<T> {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

pub struct SensirionI2c<T>
where
    T: I2c,
{
    bus: T,
    crc: SensirionCrc,
}

impl<T> SensirionI2c<T>
where
    T: I2c,
{
    pub fn new(bus: T) -> SensirionI2c<T> {
        Self {
            bus,
            crc: Default::default(),
        }
    }

    pub fn release(self) -> T {
        self.bus
    }

    pub async fn write_command<Command: SensirionCommand>(
        &mut self,
        address: u8,
        command: &Command,
    ) -> Result<(), Error<T::Error>> {
        trace!("write command {:#x}", command.raw());
        self.bus
            .write(address, &command.raw().to_be_bytes())
            .await?;
        Ok(())
    }

    /// Writes `command` followed by `args`, each argument word trailed by its
    /// checksum.
    pub async fn write_command_with_args<Command: SensirionCommand>(
        &mut self,
        address: u8,
        command: &Command,
        args: &[u16],
    ) -> Result<(), Error<T::Error>> {
        let mut buffer = [0u8; MAX_WRITE_LEN];
        let len = raw_data_processing::compose_command(
            &mut buffer,
            command.raw(),
            args,
            &mut self.crc,
        )?;

        trace!("write command {:#x} with {} args", command.raw(), args.len());
        self.bus.write(address, &buffer[..len]).await?;

        Ok(())
    }

    /// Reads `words.len()` checksummed words. On a checksum mismatch the
    /// whole read fails and `words` is left untouched.
    pub async fn read_words(
        &mut self,
        address: u8,
        words: &mut [u16],
    ) -> Result<(), Error<T::Error>> {
        let mut buffer = [0u8; sgp30::MAX_RESULT_WORDS * (WORD_LEN + CRC_LEN)];
        let buffer = buffer
            .get_mut(..words.len() * (WORD_LEN + CRC_LEN))
            .ok_or(ParsingError::Length)?;

        self.bus.read(address, buffer).await?;

        raw_data_processing::check_words(buffer, &mut self.crc)?;
        for (word, chunk) in words.iter_mut().zip(buffer.chunks_exact(WORD_LEN + CRC_LEN)) {
            *word = u16::from_be_bytes([chunk[0], chunk[1]]);
        }

        Ok(())
    }

    pub async fn write_read_words<Command: SensirionCommand>(
        &mut self,
        address: u8,
        command: &Command,
        words: &mut [u16],
        delay_us: u32,
        delay: &mut impl DelayNs,
    ) -> Result<(), Error<T::Error>> {
        self.write_command(address, command).await?;

        delay.delay_us(delay_us).await;

        self.read_words(address, words).await
    }
}

/// CRC-8 used by Sensirion sensors: polynomial 0x31, init 0xff, no
/// reflection, no final xor.
pub struct SensirionCrc {
    inner: Crc<u8>,
}

impl SensirionCrc {
    pub fn new() -> Self {
        Self {
            inner: crc_all::Crc::<u8>::new(0x31, 8, 0xff, 0x00, false),
        }
    }

    pub fn calculate(&mut self, input: &[u8]) -> u8 {
        self.inner.init();
        self.inner.update(input);
        self.inner.finish()
    }

    pub fn generate(&mut self, word: [u8; WORD_LEN]) -> u8 {
        self.calculate(&word)
    }

    pub fn verify(&mut self, word: [u8; WORD_LEN], checksum: u8) -> bool {
        self.generate(word) == checksum
    }
}

impl Default for SensirionCrc {
    fn default() -> Self {
        Self::new()
    }
}

mod raw_data_processing {
    use super::*;

    /// Fills `buffer` with the big-endian opcode and the checksummed
    /// arguments, returning the frame length.
    pub(super) fn compose_command(
        buffer: &mut [u8],
        command: u16,
        args: &[u16],
        crc: &mut SensirionCrc,
    ) -> Result<usize, ParsingError> {
        let len = COMMAND_LEN + args.len() * (WORD_LEN + CRC_LEN);
        let frame = buffer.get_mut(..len).ok_or(ParsingError::Length)?;

        frame[..COMMAND_LEN].copy_from_slice(&command.to_be_bytes());
        for (arg, chunk) in args
            .iter()
            .zip(frame[COMMAND_LEN..].chunks_exact_mut(WORD_LEN + CRC_LEN))
        {
            let word = arg.to_be_bytes();
            chunk[..WORD_LEN].copy_from_slice(&word);
            chunk[WORD_LEN] = crc.generate(word);
        }

        Ok(len)
    }

    pub(super) fn check_words(data: &[u8], crc: &mut SensirionCrc) -> Result<(), ParsingError> {
        for chunk in data.chunks_exact(WORD_LEN + CRC_LEN) {
            if !crc.verify([chunk[0], chunk[1]], chunk[WORD_LEN]) {
                warn!("checksum mismatch on word {:#x}", u16::from_be_bytes([chunk[0], chunk[1]]));
                return Err(ParsingError::Crc);
            }
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc() {
        let mut crc = SensirionCrc::new();

        assert_eq!(0x92, crc.calculate(&[0xbe, 0xef]));
    }

    #[test]
    fn every_word_verifies_against_its_own_checksum() {
        let mut crc = SensirionCrc::new();

        for word in 0..=u16::MAX {
            let word = word.to_be_bytes();
            let checksum = crc.generate(word);
            assert!(crc.verify(word, checksum));
        }
    }

    #[test]
    fn any_other_checksum_is_rejected() {
        let mut crc = SensirionCrc::new();

        for word in [0x0000u16, 0xbeef, 0x1234, 0xffff] {
            let word = word.to_be_bytes();
            let good = crc.generate(word);
            for checksum in (0..=u8::MAX).filter(|c| *c != good) {
                assert!(!crc.verify(word, checksum));
            }
        }
    }
}
