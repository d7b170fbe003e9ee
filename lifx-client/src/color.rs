use lifx_core::HSBK;

const U16_MAX: f64 = 65535.0;
const HUE_MAX: f64 = 360.0;

/// A color in the HSBK model used throughout this crate's public API: hue in
/// degrees `[0, 360)`, saturation and brightness as fractions `[0, 1]`, kelvin as the
/// raw wire value.
///
/// Kelvin is a direct passthrough of the 16-bit wire field, not rescaled against a
/// min/max range — see the design notes on why this crate departs from the reference
/// implementation here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub hue: f64,
    pub saturation: f64,
    pub brightness: f64,
    pub kelvin: u16,
}

impl From<HSBK> for Color {
    fn from(raw: HSBK) -> Color {
        Color {
            hue: raw.hue as f64 / U16_MAX * HUE_MAX,
            saturation: raw.saturation as f64 / U16_MAX,
            brightness: raw.brightness as f64 / U16_MAX,
            kelvin: raw.kelvin,
        }
    }
}

impl From<Color> for HSBK {
    fn from(c: Color) -> HSBK {
        HSBK {
            hue: scale_to_u16(c.hue / HUE_MAX),
            saturation: scale_to_u16(c.saturation),
            brightness: scale_to_u16(c.brightness),
            kelvin: c.kelvin,
        }
    }
}

fn scale_to_u16(fraction: f64) -> u16 {
    (fraction.clamp(0.0, 1.0) * U16_MAX).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decoding_then_encoding_a_color_round_trips_within_one_unit(
            hue: u16, saturation: u16, brightness: u16, kelvin: u16,
        ) {
            let original = HSBK { hue, saturation, brightness, kelvin };
            let round_tripped: HSBK = Color::from(original).into();
            prop_assert!((round_tripped.hue as i32 - original.hue as i32).abs() <= 1);
            prop_assert!((round_tripped.saturation as i32 - original.saturation as i32).abs() <= 1);
            prop_assert!((round_tripped.brightness as i32 - original.brightness as i32).abs() <= 1);
            prop_assert_eq!(round_tripped.kelvin, original.kelvin);
        }
    }

    #[test]
    fn full_saturation_and_brightness_round_trip_to_the_u16_max() {
        let raw = HSBK::from(Color {
            hue: 0.0,
            saturation: 1.0,
            brightness: 1.0,
            kelvin: 3500,
        });
        assert_eq!(raw.saturation, 65535);
        assert_eq!(raw.brightness, 65535);
        assert_eq!(raw.kelvin, 3500);
    }

    #[test]
    fn zero_saturation_and_brightness_round_trip_to_zero() {
        let raw = HSBK::from(Color {
            hue: 0.0,
            saturation: 0.0,
            brightness: 0.0,
            kelvin: 2700,
        });
        assert_eq!(raw.saturation, 0);
        assert_eq!(raw.brightness, 0);
    }

    #[test]
    fn hue_180_degrees_is_half_of_u16_max() {
        let raw = HSBK::from(Color {
            hue: 180.0,
            saturation: 0.0,
            brightness: 0.0,
            kelvin: 2700,
        });
        assert_eq!(raw.hue, 32768);
    }

    #[test]
    fn kelvin_is_a_direct_passthrough_not_rescaled() {
        let raw = HSBK {
            hue: 0,
            saturation: 0,
            brightness: 0,
            kelvin: 9000,
        };
        let color = Color::from(raw);
        assert_eq!(color.kelvin, 9000);
        let back: HSBK = color.into();
        assert_eq!(back.kelvin, 9000);
    }

    #[test]
    fn decoding_then_encoding_a_color_is_approximately_the_identity() {
        let original = HSBK {
            hue: 12345,
            saturation: 20000,
            brightness: 50000,
            kelvin: 4000,
        };
        let round_tripped: HSBK = Color::from(original).into();
        assert!((round_tripped.hue as i32 - original.hue as i32).abs() <= 1);
        assert!((round_tripped.saturation as i32 - original.saturation as i32).abs() <= 1);
        assert!((round_tripped.brightness as i32 - original.brightness as i32).abs() <= 1);
        assert_eq!(round_tripped.kelvin, original.kelvin);
    }
}
