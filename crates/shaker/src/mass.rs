use serde::{Deserialize, Serialize};

pub const H2O: f64 = 18.010565;
pub const PROTON: f64 = 1.007_276_4;

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Tolerance {
    Ppm(f64, f64),
    Da(f64, f64),
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::Ppm(-10.0, 10.0)
    }
}

impl Tolerance {
    /// Compute the (`lower`, `upper`) window (in Da) around a theoretical
    /// m/z or mass for a given tolerance
    pub fn bounds(&self, center: f64) -> (f64, f64) {
        match self {
            Tolerance::Ppm(lo, hi) => {
                let delta_lo = center * lo / 1_000_000.0;
                let delta_hi = center * hi / 1_000_000.0;
                (center + delta_lo, center + delta_hi)
            }
            Tolerance::Da(lo, hi) => (center + lo, center + hi),
        }
    }

    pub fn contains(&self, center: f64, rhs: f64) -> bool {
        let (lo, hi) = self.bounds(center);
        rhs >= lo && rhs <= hi
    }
}

/// Monoisotopic residue mass of an amino acid, or `None` for anything that
/// is not one of the 22 proteinogenic residues
pub fn residue_mass(aa: u8) -> Option<f64> {
    let mass = match aa.to_ascii_uppercase() {
        b'A' => 71.03711,
        b'R' => 156.1011,
        b'N' => 114.04293,
        b'D' => 115.02694,
        b'C' => 103.00919,
        b'E' => 129.04259,
        b'Q' => 128.05858,
        b'G' => 57.02146,
        b'H' => 137.05891,
        b'I' => 113.08406,
        b'L' => 113.08406,
        b'K' => 128.09496,
        b'M' => 131.0405,
        b'F' => 147.0684,
        b'P' => 97.05276,
        b'S' => 87.03203,
        b'T' => 101.04768,
        b'W' => 186.07931,
        b'Y' => 163.06333,
        b'V' => 99.06841,
        b'U' => 150.95363,
        b'O' => 237.14773,
        _ => return None,
    };
    Some(mass)
}

/// m/z of a neutral monoisotopic mass carrying `charge` protons
pub fn mz(mass: f64, charge: u8) -> f64 {
    let z = charge.max(1) as f64;
    (mass + z * PROTON) / z
}

/// Signed precursor error in ppm, relative to the theoretical value
pub fn ppm_error(theoretical: f64, observed: f64) -> f64 {
    (observed - theoretical) / theoretical * 1_000_000.0
}
