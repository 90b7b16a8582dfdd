//! State-carrying linear resampler.
//!
//! Interpolation state (last sample + fractional phase) persists across
//! calls, so packet boundaries do not produce discontinuities.

/// Linear interpolating resampler between two fixed rates.
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    last: i16,
    /// Fractional read position relative to the carried sample.
    pos: f64,
    primed: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            last: 0,
            pos: 0.0,
            primed: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resample one block, carrying interpolation state to the next call.
    pub fn resample(&mut self, input: &[i16]) -> Vec<i16> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let mut src: Vec<i16> = Vec::with_capacity(input.len() + 1);
        if self.primed {
            src.push(self.last);
        }
        src.extend_from_slice(input);

        let step = f64::from(self.from_rate) / f64::from(self.to_rate);
        let mut pos = self.pos;
        let mut out = Vec::with_capacity((src.len() as f64 / step) as usize + 2);

        while pos + 1.0 < src.len() as f64 {
            let i = pos as usize;
            let frac = pos - i as f64;
            let a = f64::from(src[i]);
            let b = f64::from(src[i + 1]);
            out.push((a + (b - a) * frac).round() as i16);
            pos += step;
        }

        // Keep the final input sample; rebase the phase against it.
        let consumed = src.len() - 1;
        self.last = *src.last().expect("non-empty src");
        self.pos = pos - consumed as f64;
        self.primed = true;

        out
    }

    pub fn reset(&mut self) {
        self.last = 0;
        self.pos = 0.0;
        self.primed = false;
    }
}
