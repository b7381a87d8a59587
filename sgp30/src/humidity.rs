//! Absolute humidity for [`Sgp30::set_absolute_humidity`] from a relative
//! humidity/temperature sensor reading.
//!
//! [`Sgp30::set_absolute_humidity`]: crate::sgp30::Sgp30::set_absolute_humidity

use micromath::F32Ext;

use crate::sgp30::MAX_ABSOLUTE_HUMIDITY;

/// [J / (K * mol)]
const UNIVERSAL_GAS_CONSTANT: f32 = 8.314_462;
/// [kg / mol]
const WATER_MOLAR_MASS: f32 = 18.015e-3;

/// Saturation vapour pressure over water or ice [Pa] (Arden Buck).
fn saturation_vapour_pressure(temperature: f32) -> f32 {
    if temperature > 0.0 {
        611.21
            * F32Ext::exp((18.678 - temperature / 234.5) * (temperature / (257.14 + temperature)))
    } else {
        611.15
            * F32Ext::exp((23.036 - temperature / 333.7) * (temperature / (279.82 + temperature)))
    }
}

/// Converts relative humidity [%] at `temperature` [°C] to absolute humidity
/// [mg/m³], clamped to what the sensor accepts.
pub fn absolute_humidity(relative_humidity: f32, temperature: f32) -> u32 {
    let partial_pressure = relative_humidity / 100.0 * saturation_vapour_pressure(temperature);
    // ideal gas law, density = p * M / (R * T)
    let density = partial_pressure * WATER_MOLAR_MASS
        / (UNIVERSAL_GAS_CONSTANT * (temperature + 273.15)); // [kg / m³]

    ((density * 1_000_000.0) as u32).min(MAX_ABSOLUTE_HUMIDITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_conditions() {
        let ah = absolute_humidity(50.0, 25.0);
        assert!((11_300..11_700).contains(&ah), "{}", ah);
    }

    #[test]
    fn freezing_conditions() {
        let ah = absolute_humidity(80.0, -10.0);
        assert!((1_500..1_900).contains(&ah), "{}", ah);
    }

    #[test]
    fn dry_air_disables_compensation() {
        assert_eq!(absolute_humidity(0.0, 25.0), 0);
        assert_eq!(absolute_humidity(-5.0, 25.0), 0);
    }
}
