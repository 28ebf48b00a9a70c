//! CPU-side sRGB encode for mapped output, the piecewise curve from the
//! sRGB standard.

pub fn linear_to_srgb(linear: f32) -> f32 {
    if linear < 0.003_130_8 {
        12.92 * linear
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear(srgb: f32) -> f32 {
    if srgb < 0.040_45 {
        srgb / 12.92
    } else {
        ((srgb + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanorand::{Rng, WyRand};

    #[test]
    fn endpoints_and_monotonicity() {
        assert_eq!(linear_to_srgb(0.0), 0.0);
        assert!((linear_to_srgb(1.0) - 1.0).abs() < 1.0e-6);
        let mut previous = -1.0f32;
        for i in 0..=1000 {
            let x = i as f32 / 1000.0;
            let y = linear_to_srgb(x);
            assert!(y >= previous, "curve must be monotonic at {x}");
            previous = y;
        }
    }

    #[test]
    fn continuity_at_the_piecewise_boundary() {
        let below = linear_to_srgb(0.003_130_8 - 1.0e-7);
        let above = linear_to_srgb(0.003_130_8 + 1.0e-7);
        assert!((above - below).abs() < 1.0e-6);
    }

    #[test]
    fn round_trip_of_random_values() {
        let mut rng = WyRand::new_seed(0xC0FFEE);
        for _ in 0..1024 {
            let x = rng.generate::<u32>() as f32 / u32::MAX as f32;
            let back = srgb_to_linear(linear_to_srgb(x));
            assert!((back - x).abs() < 1.0e-5, "{x} round-tripped to {back}");
        }
    }
}
