// Atmos - Environmental sensor readings as JSON or Cloud Monitoring metrics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::sensor::core::{Reading, RegisterBus, Sensor, SensorError, SensorErrorKind};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;

pub const ADDR_PRIMARY: u16 = 0x76;
pub const ADDR_SECONDARY: u16 = 0x77;

pub(crate) const CHIP_ID: u8 = 0x61;
pub(crate) const CHIP_ID_ADDR: u8 = 0xD0;
pub(crate) const SOFT_RESET_ADDR: u8 = 0xE0;
pub(crate) const SOFT_RESET_CMD: u8 = 0xB6;

pub(crate) const COEFF_ADDR1: u8 = 0x89;
pub(crate) const COEFF_ADDR1_LEN: usize = 25;
pub(crate) const COEFF_ADDR2: u8 = 0xE1;
pub(crate) const COEFF_ADDR2_LEN: usize = 16;
pub(crate) const RES_HEAT_VAL_ADDR: u8 = 0x00;
pub(crate) const RES_HEAT_RANGE_ADDR: u8 = 0x02;
pub(crate) const RANGE_SW_ERR_ADDR: u8 = 0x04;

pub(crate) const FIELD0_ADDR: u8 = 0x1D;
pub(crate) const FIELD_LENGTH: usize = 15;

pub(crate) const RES_HEAT0_ADDR: u8 = 0x5A;
pub(crate) const GAS_WAIT0_ADDR: u8 = 0x64;
pub(crate) const CTRL_GAS1_ADDR: u8 = 0x71;
pub(crate) const CTRL_HUM_ADDR: u8 = 0x72;
pub(crate) const CTRL_MEAS_ADDR: u8 = 0x74;
pub(crate) const CONFIG_ADDR: u8 = 0x75;

const NEW_DATA_MSK: u8 = 0x80;
const GAS_INDEX_MSK: u8 = 0x0F;
const GAS_RANGE_MSK: u8 = 0x0F;
const HEAT_STAB_MSK: u8 = 0x10;

const POLL_ATTEMPTS: usize = 10;
const POLL_DELAY: Duration = Duration::from_millis(10);
const RESET_DELAY: Duration = Duration::from_millis(10);
const AMBIENT_TEMPERATURE: i64 = 25;

/// Oversampling rate for temperature, pressure, or humidity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Oversampling {
    Skipped = 0,
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

/// Size of the IIR filter applied to temperature and pressure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterSize {
    Size0 = 0,
    Size1 = 1,
    Size3 = 2,
    Size7 = 3,
    Size15 = 4,
    Size31 = 5,
    Size63 = 6,
    Size127 = 7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerMode {
    Sleep = 0,
    Forced = 1,
}

/// A single bit field within a register: its mask and shift.
#[derive(Copy, Clone, Debug)]
struct BitField {
    register: u8,
    mask: u8,
    shift: u8,
}

const OSRS_H: BitField = BitField { register: CTRL_HUM_ADDR, mask: 0x07, shift: 0 };
const OSRS_P: BitField = BitField { register: CTRL_MEAS_ADDR, mask: 0x1C, shift: 2 };
const OSRS_T: BitField = BitField { register: CTRL_MEAS_ADDR, mask: 0xE0, shift: 5 };
const MODE: BitField = BitField { register: CTRL_MEAS_ADDR, mask: 0x03, shift: 0 };
const FILTER: BitField = BitField { register: CONFIG_ADDR, mask: 0x1C, shift: 2 };
const RUN_GAS: BitField = BitField { register: CTRL_GAS1_ADDR, mask: 0x10, shift: 4 };
const NB_CONV: BitField = BitField { register: CTRL_GAS1_ADDR, mask: 0x0F, shift: 0 };

// Lookup tables for gas resistance compensation, from the Bosch reference driver
const GAS_RANGE_LOOKUP1: [i64; 16] = [
    2147483647, 2147483647, 2147483647, 2147483647, 2147483647, 2126008810, 2147483647, 2130303777, 2147483647,
    2147483647, 2143188679, 2136746228, 2147483647, 2126008810, 2147483647, 2147483647,
];

const GAS_RANGE_LOOKUP2: [i64; 16] = [
    4096000000, 2048000000, 1024000000, 512000000, 255744255, 127110228, 64000000, 32258064, 16016016, 8000000,
    4000000, 2000000, 1000000, 500000, 250000, 125000,
];

/// Factory calibration parameters, unique to each device.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Calibration {
    pub(crate) par_t1: i64,
    pub(crate) par_t2: i64,
    pub(crate) par_t3: i64,
    pub(crate) par_p1: i64,
    pub(crate) par_p2: i64,
    pub(crate) par_p3: i64,
    pub(crate) par_p4: i64,
    pub(crate) par_p5: i64,
    pub(crate) par_p6: i64,
    pub(crate) par_p7: i64,
    pub(crate) par_p8: i64,
    pub(crate) par_p9: i64,
    pub(crate) par_p10: i64,
    pub(crate) par_h1: i64,
    pub(crate) par_h2: i64,
    pub(crate) par_h3: i64,
    pub(crate) par_h4: i64,
    pub(crate) par_h5: i64,
    pub(crate) par_h6: i64,
    pub(crate) par_h7: i64,
    pub(crate) par_gh1: i64,
    pub(crate) par_gh2: i64,
    pub(crate) par_gh3: i64,
    pub(crate) res_heat_range: i64,
    pub(crate) res_heat_val: i64,
    pub(crate) range_sw_err: i64,
}

impl Calibration {
    /// Parse calibration from the two coefficient blocks (concatenated) and the three
    /// single byte heater and switching error registers.
    fn from_registers(coeff: &[u8; COEFF_ADDR1_LEN + COEFF_ADDR2_LEN], heat_range: u8, heat_val: u8, sw_err: u8) -> Self {
        let u16_at = |msb: usize, lsb: usize| i64::from(u16::from_be_bytes([coeff[msb], coeff[lsb]]));
        let i16_at = |msb: usize, lsb: usize| i64::from(i16::from_be_bytes([coeff[msb], coeff[lsb]]));
        let i8_at = |idx: usize| i64::from(coeff[idx] as i8);
        let u8_at = |idx: usize| i64::from(coeff[idx]);

        Calibration {
            par_t1: u16_at(34, 33),
            par_t2: i16_at(2, 1),
            par_t3: i8_at(3),
            par_p1: u16_at(6, 5),
            par_p2: i16_at(8, 7),
            par_p3: i8_at(9),
            par_p4: i16_at(12, 11),
            par_p5: i16_at(14, 13),
            par_p6: i8_at(16),
            par_p7: i8_at(15),
            par_p8: i16_at(20, 19),
            par_p9: i16_at(22, 21),
            par_p10: u8_at(23),
            // Humidity parameters one and two share a byte, split on the nibble
            par_h1: (u8_at(27) << 4) | (u8_at(26) & 0x0F),
            par_h2: (u8_at(25) << 4) | (u8_at(26) >> 4),
            par_h3: i8_at(28),
            par_h4: i8_at(29),
            par_h5: i8_at(30),
            par_h6: u8_at(31),
            par_h7: i8_at(32),
            par_gh1: i8_at(37),
            par_gh2: i16_at(36, 35),
            par_gh3: i8_at(38),
            res_heat_range: i64::from((heat_range & 0x30) >> 4),
            res_heat_val: i64::from(heat_val as i8),
            range_sw_err: i64::from((sw_err as i8) & (0xF0u8 as i8)) / 16,
        }
    }

    /// Return `t_fine`, used by the other compensation steps, and temperature
    /// in hundredths of a degree celsius.
    fn temperature(&self, adc: i64) -> (i64, i64) {
        let var1 = (adc >> 3) - (self.par_t1 << 1);
        let var2 = (var1 * self.par_t2) >> 11;
        let var3 = ((var1 >> 1) * (var1 >> 1)) >> 12;
        let var3 = (var3 * (self.par_t3 << 4)) >> 14;
        let t_fine = var2 + var3;
        (t_fine, ((t_fine * 5) + 128) >> 8)
    }

    /// Pressure in pascals.
    fn pressure(&self, t_fine: i64, adc: i64) -> i64 {
        let var1 = (t_fine >> 1) - 64000;
        let var2 = ((((var1 >> 2) * (var1 >> 2)) >> 11) * self.par_p6) >> 2;
        let var2 = var2 + ((var1 * self.par_p5) << 1);
        let var2 = (var2 >> 2) + (self.par_p4 << 16);
        let var1 = (((((var1 >> 2) * (var1 >> 2)) >> 13) * (self.par_p3 << 5)) >> 3) + ((self.par_p2 * var1) >> 1);
        let var1 = var1 >> 18;
        let var1 = ((32768 + var1) * self.par_p1) >> 15;
        if var1 == 0 {
            return 0;
        }

        let mut pressure = 1048576 - adc;
        pressure = (pressure - (var2 >> 12)) * 3125;
        // Overflow threshold of the Bosch BME68x C driver (BME68X_MAX_OVERFLOW_VAL)
        pressure = if pressure >= 0x4000_0000 {
            (pressure / var1) << 1
        } else {
            (pressure << 1) / var1
        };

        let var1 = (self.par_p9 * (((pressure >> 3) * (pressure >> 3)) >> 13)) >> 12;
        let var2 = ((pressure >> 2) * self.par_p8) >> 13;
        let var3 = ((pressure >> 8) * (pressure >> 8) * (pressure >> 8) * self.par_p10) >> 17;
        pressure + ((var1 + var2 + var3 + (self.par_p7 << 7)) >> 4)
    }

    /// Relative humidity in thousandths of a percent, clamped to 0 - 100000.
    fn humidity(&self, t_fine: i64, adc: i64) -> i64 {
        let temp_scaled = ((t_fine * 5) + 128) >> 8;
        let var1 = (adc - (self.par_h1 * 16)) - (((temp_scaled * self.par_h3) / 100) >> 1);
        let var2 = (self.par_h2
            * (((temp_scaled * self.par_h4) / 100)
                + (((temp_scaled * ((temp_scaled * self.par_h5) / 100)) >> 6) / 100)
                + (1 << 14)))
            >> 10;
        let var3 = var1 * var2;
        let var4 = self.par_h6 << 7;
        let var4 = (var4 + ((temp_scaled * self.par_h7) / 100)) >> 4;
        let var5 = ((var3 >> 14) * (var3 >> 14)) >> 10;
        let var6 = (var4 * var5) >> 1;
        let humidity = (((var3 + var6) >> 10) * 1000) >> 12;
        humidity.clamp(0, 100_000)
    }

    /// Gas resistance in ohms.
    fn gas_resistance(&self, adc: i64, range: usize) -> i64 {
        let range = range & usize::from(GAS_RANGE_MSK);
        let var1 = ((1340 + (5 * self.range_sw_err)) * GAS_RANGE_LOOKUP1[range]) >> 16;
        let var2 = ((adc << 15) - 16777216) + var1;
        let var3 = (GAS_RANGE_LOOKUP2[range] * var1) >> 9;
        (var3 + (var2 >> 1)).checked_div(var2).unwrap_or(0)
    }

    /// Register value for the heater resistance needed to reach `target` degrees
    /// celsius (clamped to 200 - 400).
    fn heater_resistance(&self, target: u16) -> u8 {
        let target = i64::from(target.clamp(200, 400));
        let var1 = ((AMBIENT_TEMPERATURE * self.par_gh3) / 1000) * 256;
        let var2 = (self.par_gh1 + 784) * (((((self.par_gh2 + 154009) * target * 5) / 100) + 3276800) / 10);
        let var3 = var1 + (var2 / 2);
        let var4 = var3 / (self.res_heat_range + 4);
        let var5 = (131 * self.res_heat_val) + 65536;
        let res_x100 = ((var4 / var5) - 250) * 34;
        ((res_x100 + 50) / 100) as u8
    }
}

/// Register value for a heater duration in milliseconds: six bits of value and
/// two bits of a multiplication factor (1, 4, 16, 64).
pub(crate) fn heater_duration(millis: u16) -> u8 {
    if millis >= 0xFC0 {
        return 0xFF;
    }

    let mut duration = millis;
    let mut factor = 0;
    while duration > 0x3F {
        duration /= 4;
        factor += 1;
    }

    (duration + factor * 64) as u8
}

/// Read temperature, pressure, humidity, and gas resistance from a BME680 sensor
pub struct Bme680Sensor {
    bus: Box<dyn RegisterBus + Send + 'static>,
    address: u16,
    calibration: Calibration,
    heater_wait: Duration,
}

impl Bme680Sensor {
    /// Find the sensor at the primary I2C address, falling back to the secondary
    /// address if the primary can't be reached, then reset it and load its
    /// calibration data.
    pub fn open<T>(bus: T) -> Result<Self, SensorError>
    where
        T: RegisterBus + Send + 'static,
    {
        let mut bus: Box<dyn RegisterBus + Send + 'static> = Box::new(bus);
        let address = match Self::probe(bus.as_mut(), ADDR_PRIMARY) {
            Ok(()) => ADDR_PRIMARY,
            Err(e) if e.kind() == SensorErrorKind::Bus => {
                tracing::warn!(
                    message = "sensor not reachable at primary address, trying secondary",
                    primary = ADDR_PRIMARY,
                    secondary = ADDR_SECONDARY,
                    error = %e,
                );
                Self::probe(bus.as_mut(), ADDR_SECONDARY)?;
                ADDR_SECONDARY
            }
            Err(e) => return Err(e),
        };

        let mut sensor = Self {
            bus,
            address,
            calibration: Calibration::default(),
            heater_wait: Duration::ZERO,
        };

        sensor.bus.write(SOFT_RESET_ADDR, SOFT_RESET_CMD)?;
        thread::sleep(RESET_DELAY);
        sensor.set_power_mode(PowerMode::Sleep)?;
        sensor.calibration = sensor.read_calibration()?;

        tracing::debug!(message = "loaded sensor calibration", address = address, calibration = ?sensor.calibration);
        Ok(sensor)
    }

    fn probe(bus: &mut (dyn RegisterBus + Send + 'static), address: u16) -> Result<(), SensorError> {
        bus.select(address)?;
        let mut id = [0u8; 1];
        bus.read(CHIP_ID_ADDR, &mut id)?;

        if id[0] != CHIP_ID {
            return Err(SensorError::ChipId(CHIP_ID, id[0]));
        }

        Ok(())
    }

    fn read_calibration(&mut self) -> Result<Calibration, SensorError> {
        let mut coeff = [0u8; COEFF_ADDR1_LEN + COEFF_ADDR2_LEN];
        self.bus.read(COEFF_ADDR1, &mut coeff[..COEFF_ADDR1_LEN])?;
        self.bus.read(COEFF_ADDR2, &mut coeff[COEFF_ADDR1_LEN..])?;

        Ok(Calibration::from_registers(
            &coeff,
            self.read_byte(RES_HEAT_RANGE_ADDR)?,
            self.read_byte(RES_HEAT_VAL_ADDR)?,
            self.read_byte(RANGE_SW_ERR_ADDR)?,
        ))
    }

    fn read_byte(&mut self, register: u8) -> Result<u8, SensorError> {
        let mut buf = [0u8; 1];
        self.bus.read(register, &mut buf)?;
        Ok(buf[0])
    }

    fn set_bits(&mut self, field: BitField, value: u8) -> Result<(), SensorError> {
        let current = self.read_byte(field.register)?;
        let updated = (current & !field.mask) | ((value << field.shift) & field.mask);
        self.bus.write(field.register, updated)
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn set_humidity_oversample(&mut self, os: Oversampling) -> Result<(), SensorError> {
        self.set_bits(OSRS_H, os as u8)
    }

    pub fn set_pressure_oversample(&mut self, os: Oversampling) -> Result<(), SensorError> {
        self.set_bits(OSRS_P, os as u8)
    }

    pub fn set_temperature_oversample(&mut self, os: Oversampling) -> Result<(), SensorError> {
        self.set_bits(OSRS_T, os as u8)
    }

    pub fn set_filter(&mut self, size: FilterSize) -> Result<(), SensorError> {
        self.set_bits(FILTER, size as u8)
    }

    pub fn set_gas_measurement(&mut self, enabled: bool) -> Result<(), SensorError> {
        self.set_bits(RUN_GAS, u8::from(enabled))
    }

    /// Set the heater temperature, in degrees celsius, for one of ten heater profiles.
    pub fn set_gas_heater_temperature(&mut self, celsius: u16, profile: u8) -> Result<(), SensorError> {
        let value = self.calibration.heater_resistance(celsius);
        self.bus.write(RES_HEAT0_ADDR + profile.min(9), value)
    }

    /// Set the heater duration, in milliseconds, for one of ten heater profiles.
    pub fn set_gas_heater_duration(&mut self, millis: u16, profile: u8) -> Result<(), SensorError> {
        self.bus.write(GAS_WAIT0_ADDR + profile.min(9), heater_duration(millis))?;
        self.heater_wait = self.heater_wait.max(Duration::from_millis(u64::from(millis)));
        Ok(())
    }

    pub fn select_gas_heater_profile(&mut self, profile: u8) -> Result<(), SensorError> {
        self.set_bits(NB_CONV, profile.min(9))
    }

    pub fn set_power_mode(&mut self, mode: PowerMode) -> Result<(), SensorError> {
        self.set_bits(MODE, mode as u8)
    }

    /// Apply the fixed measurement settings used for all readings. Must be called
    /// once before polling.
    pub fn configure(&mut self) -> Result<(), SensorError> {
        self.set_humidity_oversample(Oversampling::X2)?;
        self.set_pressure_oversample(Oversampling::X2)?;
        self.set_temperature_oversample(Oversampling::X2)?;
        self.set_filter(FilterSize::Size3)?;
        self.set_gas_measurement(true)?;
        self.set_gas_heater_duration(150, 0)?;
        self.set_gas_heater_temperature(320, 0)?;
        self.select_gas_heater_profile(0)?;
        self.set_power_mode(PowerMode::Forced)?;

        tracing::info!(message = "configured sensor", address = self.address);
        Ok(())
    }

    /// Number of times to check for new data after triggering a measurement: a fixed
    /// number of attempts plus enough to cover the time the gas heater runs.
    fn poll_attempts(&self) -> usize {
        POLL_ATTEMPTS + (self.heater_wait.as_millis() / POLL_DELAY.as_millis()) as usize
    }

    fn parse_fields(&self, regs: &[u8; FIELD_LENGTH]) -> Reading {
        let adc_pres = (i64::from(regs[2]) << 12) | (i64::from(regs[3]) << 4) | (i64::from(regs[4]) >> 4);
        let adc_temp = (i64::from(regs[5]) << 12) | (i64::from(regs[6]) << 4) | (i64::from(regs[7]) >> 4);
        let adc_hum = (i64::from(regs[8]) << 8) | i64::from(regs[9]);
        let adc_gas = (i64::from(regs[13]) << 2) | (i64::from(regs[14]) >> 6);
        let gas_range = usize::from(regs[14] & GAS_RANGE_MSK);

        let (t_fine, temperature) = self.calibration.temperature(adc_temp);
        let pressure = self.calibration.pressure(t_fine, adc_pres);
        let humidity = self.calibration.humidity(t_fine, adc_hum);
        let gas_resistance = self.calibration.gas_resistance(adc_gas, gas_range);

        tracing::trace!(
            message = "parsed sensor data",
            adc_temperature = adc_temp,
            adc_pressure = adc_pres,
            adc_humidity = adc_hum,
            adc_gas = adc_gas,
            gas_range = gas_range,
        );

        Reading {
            temperature: temperature as f64 / 100.0,
            pressure: pressure as f64 / 100.0,
            humidity: humidity as f64 / 1000.0,
            gas_resistance: gas_resistance as f64,
            gas_index: regs[0] & GAS_INDEX_MSK,
            meas_index: regs[1],
            heat_stable: regs[14] & HEAT_STAB_MSK > 0,
        }
    }
}

impl Sensor for Bme680Sensor {
    /// Trigger a measurement and wait briefly for it to complete, returning
    /// `None` if the sensor hasn't flagged new data in that time.
    fn poll(&mut self) -> Result<Option<Reading>, SensorError> {
        self.set_power_mode(PowerMode::Forced)?;

        for _ in 0..self.poll_attempts() {
            let mut regs = [0u8; FIELD_LENGTH];
            self.bus.read(FIELD0_ADDR, &mut regs)?;

            if regs[0] & NEW_DATA_MSK == 0 {
                thread::sleep(POLL_DELAY);
                continue;
            }

            let reading = self.parse_fields(&regs);
            tracing::debug!(message = "read sensor", reading = ?reading);
            return Ok(Some(reading));
        }

        Ok(None)
    }
}

impl Debug for Bme680Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bme680Sensor").field("address", &self.address).finish()
    }
}

#[cfg(test)]
mod test {
    use super::{
        heater_duration, Bme680Sensor, Calibration, ADDR_PRIMARY, ADDR_SECONDARY, CTRL_GAS1_ADDR, CTRL_HUM_ADDR,
        CTRL_MEAS_ADDR, CONFIG_ADDR, GAS_WAIT0_ADDR, RES_HEAT0_ADDR,
    };
    use crate::sensor::core::{Sensor, SensorError, SensorErrorKind};
    use crate::sensor::test::{MockBus, MOCK_CALIBRATION};

    #[test]
    fn test_open_primary() {
        let bus = MockBus::new(&[ADDR_PRIMARY]);
        let sensor = Bme680Sensor::open(bus).unwrap();

        assert_eq!(ADDR_PRIMARY, sensor.address());
    }

    #[test]
    fn test_open_falls_back_to_secondary() {
        let bus = MockBus::new(&[ADDR_SECONDARY]);
        let selected = bus.selected();
        let sensor = Bme680Sensor::open(bus).unwrap();

        assert_eq!(ADDR_SECONDARY, sensor.address());
        assert_eq!(vec![ADDR_PRIMARY, ADDR_SECONDARY], *selected.lock().unwrap());
    }

    #[test]
    fn test_open_no_device() {
        let bus = MockBus::new(&[]);
        let selected = bus.selected();
        let res = Bme680Sensor::open(bus);

        assert_eq!(SensorErrorKind::Bus, res.unwrap_err().kind());
        assert_eq!(vec![ADDR_PRIMARY, ADDR_SECONDARY], *selected.lock().unwrap());
    }

    #[test]
    fn test_open_wrong_chip_does_not_fall_back() {
        let mut bus = MockBus::new(&[ADDR_PRIMARY, ADDR_SECONDARY]);
        bus.set_register(0xD0, 0x60);
        let selected = bus.selected();
        let res = Bme680Sensor::open(bus);

        match res.unwrap_err() {
            SensorError::ChipId(expected, got) => {
                assert_eq!(0x61, expected);
                assert_eq!(0x60, got);
            }
            e => panic!("unexpected error: {}", e),
        }
        assert_eq!(vec![ADDR_PRIMARY], *selected.lock().unwrap());
    }

    #[test]
    fn test_calibration_from_registers() {
        let cal = Calibration::from_registers(&MOCK_CALIBRATION, 0x10, 47, 0);

        assert_eq!(26000, cal.par_t1);
        assert_eq!(26181, cal.par_t2);
        assert_eq!(3, cal.par_t3);
        assert_eq!(36477, cal.par_p1);
        assert_eq!(-10685, cal.par_p2);
        assert_eq!(-114, cal.par_p5);
        assert_eq!(-3181, cal.par_p9);
        assert_eq!(700, cal.par_h1);
        assert_eq!(1025, cal.par_h2);
        assert_eq!(-100, cal.par_h7);
        assert_eq!(-35, cal.par_gh1);
        assert_eq!(-11325, cal.par_gh2);
        assert_eq!(18, cal.par_gh3);
        assert_eq!(1, cal.res_heat_range);
        assert_eq!(47, cal.res_heat_val);
        assert_eq!(0, cal.range_sw_err);
    }

    #[test]
    fn test_range_switching_error_is_signed() {
        let cal = Calibration::from_registers(&MOCK_CALIBRATION, 0x10, 47, 0xF0);
        assert_eq!(-1, cal.range_sw_err);
    }

    #[test]
    fn test_heater_duration() {
        assert_eq!(0x3F, heater_duration(63));
        assert_eq!(0x65, heater_duration(150));
        assert_eq!(0xFF, heater_duration(0xFC0));
    }

    #[test]
    fn test_configure_writes_settings() {
        let bus = MockBus::new(&[ADDR_PRIMARY]);
        let registers = bus.registers();
        let mut sensor = Bme680Sensor::open(bus).unwrap();
        sensor.configure().unwrap();

        let regs = registers.lock().unwrap();
        // humidity 2x
        assert_eq!(0b0000_0010, regs[CTRL_HUM_ADDR as usize]);
        // temperature 2x, pressure 2x, forced mode
        assert_eq!(0b0100_1001, regs[CTRL_MEAS_ADDR as usize]);
        // filter size 3
        assert_eq!(0b0000_1000, regs[CONFIG_ADDR as usize]);
        // gas enabled, profile 0
        assert_eq!(0b0001_0000, regs[CTRL_GAS1_ADDR as usize]);
        assert_eq!(0x65, regs[GAS_WAIT0_ADDR as usize]);
        assert_eq!(112, regs[RES_HEAT0_ADDR as usize]);
    }

    #[test]
    fn test_poll_new_data() {
        let bus = MockBus::new(&[ADDR_PRIMARY]).with_new_data();
        let mut sensor = Bme680Sensor::open(bus).unwrap();
        sensor.configure().unwrap();

        let reading = sensor.poll().unwrap().unwrap();

        assert_eq!(26.22, reading.temperature);
        assert_eq!(1047.32, reading.pressure);
        assert_eq!(79.359, reading.humidity);
        assert_eq!(271155.0, reading.gas_resistance);
        assert_eq!(0, reading.gas_index);
        assert_eq!(1, reading.meas_index);
        assert!(reading.heat_stable);
    }

    #[test]
    fn test_poll_no_new_data() {
        let bus = MockBus::new(&[ADDR_PRIMARY]);
        let mut sensor = Bme680Sensor::open(bus).unwrap();
        sensor.configure().unwrap();

        assert_eq!(None, sensor.poll().unwrap());
    }

    #[test]
    fn test_poll_waits_for_heater() {
        let bus = MockBus::new(&[ADDR_PRIMARY]).with_new_data_after(20);
        let mut sensor = Bme680Sensor::open(bus).unwrap();
        sensor.configure().unwrap();

        let reading = sensor.poll().unwrap().unwrap();
        assert_eq!(1, reading.meas_index);
    }

    #[test]
    fn test_poll_gives_up_without_heater() {
        let bus = MockBus::new(&[ADDR_PRIMARY]).with_new_data_after(20);
        let mut sensor = Bme680Sensor::open(bus).unwrap();

        assert_eq!(None, sensor.poll().unwrap());
    }

    #[test]
    fn test_poll_bus_error() {
        let bus = MockBus::new(&[ADDR_PRIMARY]);
        let present = bus.present();
        let mut sensor = Bme680Sensor::open(bus).unwrap();
        present.lock().unwrap().clear();

        let res = sensor.poll();
        assert_eq!(SensorErrorKind::Bus, res.unwrap_err().kind());
    }
}
