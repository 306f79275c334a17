//! Clamped piecewise-linear interpolation.
//!
//! Every tunable curve in the engine (aggregation grid size, cluster radius,
//! point radius, simplification tolerance) is a linear scale over a monotonic
//! domain, optionally clamped at the ends. Domains may be descending.

/// A piecewise-linear mapping from a monotonic domain to a range.
#[derive(Debug, Clone)]
pub struct LinearScale {
    domain: Vec<f64>,
    range: Vec<f64>,
    clamp: bool,
}

impl LinearScale {
    /// Two-point scale.
    pub fn new(domain: [f64; 2], range: [f64; 2]) -> Self {
        Self::piecewise(&domain, &range)
    }

    /// Multi-segment scale. `domain` and `range` must have equal lengths of
    /// at least two, and `domain` must be monotonic.
    pub fn piecewise(domain: &[f64], range: &[f64]) -> Self {
        debug_assert!(domain.len() >= 2 && domain.len() == range.len());
        let (mut domain, mut range) = (domain.to_vec(), range.to_vec());
        // Normalize to an ascending domain.
        if domain.first() > domain.last() {
            domain.reverse();
            range.reverse();
        }
        Self {
            domain,
            range,
            clamp: false,
        }
    }

    /// Clamp outputs to the range endpoints.
    pub fn clamped(mut self) -> Self {
        self.clamp = true;
        self
    }

    /// Evaluate the scale at `x`, extrapolating beyond the domain unless
    /// clamped.
    pub fn apply(&self, x: f64) -> f64 {
        let n = self.domain.len();
        let x = if self.clamp {
            x.max(self.domain[0]).min(self.domain[n - 1])
        } else {
            x
        };
        // Pick the segment containing x (end segments extrapolate).
        let mut i = 0;
        while i < n - 2 && x > self.domain[i + 1] {
            i += 1;
        }
        let (d0, d1) = (self.domain[i], self.domain[i + 1]);
        let (r0, r1) = (self.range[i], self.range[i + 1]);
        if d1 == d0 {
            // Degenerate segment: every input interpolates at the midpoint.
            return (r0 + r1) / 2.0;
        }
        let t = (x - d0) / (d1 - d0);
        r0 + t * (r1 - r0)
    }
}
