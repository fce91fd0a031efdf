//! Time-domain IIR filtering for the seismic path: bandpass as cascaded
//! biquad sections, notch filters at power-line harmonics, cosine tapering,
//! and zero-phase (forward-backward) application.

use anyhow::{anyhow, Result};

/// One second-order IIR section, direct form I, normalized so `a0 = 1`.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Second-order Butterworth low-pass at `cutoff_hz`.
    pub fn lowpass(cutoff_hz: f64, sample_rate_hz: f64) -> Result<Biquad> {
        let (omega, alpha) = section_params(cutoff_hz, sample_rate_hz)?;
        let cos_w = omega.cos();
        let a0 = 1.0 + alpha;
        Ok(Biquad {
            b0: (1.0 - cos_w) / 2.0 / a0,
            b1: (1.0 - cos_w) / a0,
            b2: (1.0 - cos_w) / 2.0 / a0,
            a1: -2.0 * cos_w / a0,
            a2: (1.0 - alpha) / a0,
        })
    }

    /// Second-order Butterworth high-pass at `cutoff_hz`.
    pub fn highpass(cutoff_hz: f64, sample_rate_hz: f64) -> Result<Biquad> {
        let (omega, alpha) = section_params(cutoff_hz, sample_rate_hz)?;
        let cos_w = omega.cos();
        let a0 = 1.0 + alpha;
        Ok(Biquad {
            b0: (1.0 + cos_w) / 2.0 / a0,
            b1: -(1.0 + cos_w) / a0,
            b2: (1.0 + cos_w) / 2.0 / a0,
            a1: -2.0 * cos_w / a0,
            a2: (1.0 - alpha) / a0,
        })
    }

    /// Notch at `center_hz` with the given half-width.
    pub fn notch(center_hz: f64, half_width_hz: f64, sample_rate_hz: f64) -> Result<Biquad> {
        let nyquist = sample_rate_hz / 2.0;
        if center_hz <= 0.0 || center_hz >= nyquist {
            return Err(anyhow!(
                "notch center {center_hz} Hz outside (0, {nyquist}) Hz"
            ));
        }
        let omega = 2.0 * std::f64::consts::PI * center_hz / sample_rate_hz;
        let bandwidth = (2.0 * half_width_hz).max(f64::EPSILON);
        let q = center_hz / bandwidth;
        let alpha = omega.sin() / (2.0 * q);
        let cos_w = omega.cos();
        let a0 = 1.0 + alpha;
        Ok(Biquad {
            b0: 1.0 / a0,
            b1: -2.0 * cos_w / a0,
            b2: 1.0 / a0,
            a1: -2.0 * cos_w / a0,
            a2: (1.0 - alpha) / a0,
        })
    }

    /// Run the section over `data` in place (single forward pass).
    pub fn run(&self, data: &mut [f64]) {
        let mut x1 = 0.0;
        let mut x2 = 0.0;
        let mut y1 = 0.0;
        let mut y2 = 0.0;
        for sample in data.iter_mut() {
            let x0 = *sample;
            let y0 = self.b0 * x0 + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x0;
            y2 = y1;
            y1 = y0;
            *sample = y0;
        }
    }
}

fn section_params(cutoff_hz: f64, sample_rate_hz: f64) -> Result<(f64, f64)> {
    let nyquist = sample_rate_hz / 2.0;
    if !(cutoff_hz > 0.0 && cutoff_hz < nyquist) {
        return Err(anyhow!(
            "corner frequency {cutoff_hz} Hz outside (0, {nyquist}) Hz at fs={sample_rate_hz}"
        ));
    }
    let omega = 2.0 * std::f64::consts::PI * cutoff_hz / sample_rate_hz;
    // Butterworth Q = 1/sqrt(2) for a single second-order section
    let alpha = omega.sin() / (2.0 * std::f64::consts::FRAC_1_SQRT_2);
    Ok((omega, alpha))
}

/// Apply a biquad cascade with zero phase: forward, then time-reversed.
pub fn filtfilt(sections: &[Biquad], data: &mut [f64]) {
    for section in sections {
        section.run(data);
    }
    data.reverse();
    for section in sections {
        section.run(data);
    }
    data.reverse();
}

/// Apply the cascade forward only.
pub fn filter_forward(sections: &[Biquad], data: &mut [f64]) {
    for section in sections {
        section.run(data);
    }
}

/// Build a bandpass cascade: `corners / 2` high-pass sections at the low
/// corner plus the same number of low-pass sections at the high corner.
pub fn bandpass_sections(
    freqmin_hz: f64,
    freqmax_hz: f64,
    corners: usize,
    sample_rate_hz: f64,
) -> Result<Vec<Biquad>> {
    if freqmin_hz >= freqmax_hz {
        return Err(anyhow!(
            "bandpass corners inverted: {freqmin_hz} >= {freqmax_hz}"
        ));
    }
    let stages = (corners / 2).max(1);
    let mut sections = Vec::with_capacity(stages * 2);
    for _ in 0..stages {
        sections.push(Biquad::highpass(freqmin_hz, sample_rate_hz)?);
        sections.push(Biquad::lowpass(freqmax_hz, sample_rate_hz)?);
    }
    Ok(sections)
}

/// Notch sections at `base_hz` and its first `harmonics` multiples,
/// skipping any at or above Nyquist. Zero harmonics disables the notch.
pub fn notch_sections(
    base_hz: f64,
    half_width_hz: f64,
    harmonics: usize,
    sample_rate_hz: f64,
) -> Vec<Biquad> {
    let nyquist = sample_rate_hz / 2.0;
    let mut sections = Vec::new();
    for harmonic in 1..=harmonics {
        let center = base_hz * harmonic as f64;
        if center >= nyquist {
            break;
        }
        if let Ok(section) = Biquad::notch(center, half_width_hz, sample_rate_hz) {
            sections.push(section);
        }
    }
    sections
}

/// Cosine (Hann-edge) taper over `max_percentage` of each end, in place.
pub fn taper(data: &mut [f64], max_percentage: f64) {
    let len = data.len();
    if len < 2 || max_percentage <= 0.0 {
        return;
    }
    let edge = ((len as f64 * max_percentage.min(0.5)) as usize).min(len / 2);
    for i in 0..edge {
        let weight = 0.5 * (1.0 - (std::f64::consts::PI * i as f64 / edge as f64).cos());
        data[i] *= weight;
        data[len - 1 - i] *= weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq_hz: f64, sample_rate_hz: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq_hz * i as f64 / sample_rate_hz).sin())
            .collect()
    }

    fn rms(data: &[f64]) -> f64 {
        (data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64).sqrt()
    }

    #[test]
    fn bandpass_keeps_passband_and_rejects_dc() {
        let fs = 100.0;
        let sections = bandpass_sections(1.0, 10.0, 4, fs).unwrap();

        let mut passband = tone(5.0, fs, 2_000);
        filtfilt(&sections, &mut passband);
        // Skip edges where the transient lives.
        let core = &passband[500..1500];
        assert!(rms(core) > 0.5);

        let mut dc = vec![1.0; 2_000];
        filtfilt(&sections, &mut dc);
        assert!(rms(&dc[500..1500]) < 0.05);

        let mut high = tone(45.0, fs, 2_000);
        filtfilt(&sections, &mut high);
        assert!(rms(&high[500..1500]) < 0.05);
    }

    #[test]
    fn notch_kills_the_line_tone() {
        let fs = 200.0;
        let sections = notch_sections(50.0, 1.0, 1, fs);
        assert_eq!(sections.len(), 1);

        let mut line = tone(50.0, fs, 4_000);
        filtfilt(&sections, &mut line);
        assert!(rms(&line[1000..3000]) < 0.1);

        let mut nearby = tone(20.0, fs, 4_000);
        filtfilt(&sections, &mut nearby);
        assert!(rms(&nearby[1000..3000]) > 0.5);
    }

    #[test]
    fn harmonics_stop_at_nyquist() {
        let sections = notch_sections(50.0, 1.0, 5, 200.0);
        // 50 Hz only; 100 Hz == nyquist is skipped.
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn invalid_corners_are_rejected() {
        assert!(Biquad::lowpass(60.0, 100.0).is_err());
        assert!(bandpass_sections(10.0, 1.0, 4, 100.0).is_err());
    }

    #[test]
    fn taper_zeroes_endpoints_and_keeps_middle() {
        let mut data = vec![1.0; 100];
        taper(&mut data, 0.05);
        assert_eq!(data[0], 0.0);
        assert_eq!(data[99], 0.0);
        assert_eq!(data[50], 1.0);
    }
}
