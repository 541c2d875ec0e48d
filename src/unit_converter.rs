/// Default calorific value (Brennwert) in kWh/m³
pub const DEFAULT_CALORIFIC_VALUE: f64 = 11.58;
/// Default compressibility factor (Zustandszahl)
pub const DEFAULT_COMPRESSIBILITY_FACTOR: f64 = 0.95;

/// Converts a gas volume in m³ into its energy equivalent in kWh.
/// Non-finite inputs propagate unchanged.
pub fn gas_energy_equivalent(
    volume_m3: f64,
    calorific_value: f64,
    compressibility_factor: f64,
) -> f64 {
    volume_m3 * calorific_value * compressibility_factor
}
