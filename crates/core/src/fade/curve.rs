use std::f32::consts::FRAC_PI_2;

/// Precomputed easing table used for every fade.
///
/// Coefficient `i` is `sin(π/2 · i/(n−1))^p`: 0 at the first index, 1 at the
/// last, non-decreasing in between. Fade-out walks the same table backwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FadeCurve {
    coefficients: Box<[f32]>,
}

impl FadeCurve {
    /// Builds `steps` coefficients. `shape_exponent` below 1 is treated as 1
    /// (the plain quarter-sine); higher values start more gently.
    pub fn build(steps: usize, shape_exponent: f32) -> Self {
        let steps = steps.max(1);
        let power = shape_exponent.max(1.0);
        let span = (steps - 1).max(1) as f32;

        let coefficients = (0..steps)
            .map(|i| {
                let x = if steps > 1 { i as f32 / span } else { 1.0 };
                (FRAC_PI_2 * x).sin().powf(power).clamp(0.0, 1.0)
            })
            .collect();

        Self { coefficients }
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Fade-in coefficient for `index`, saturating at the top of the table.
    pub fn fade_in(&self, index: usize) -> f32 {
        self.coefficients[index.min(self.last_index())]
    }

    /// Curve index used by fade-out step `step`.
    pub fn mirror(&self, step: usize) -> usize {
        self.last_index().saturating_sub(step)
    }

    /// Fade-out coefficient for step `step`.
    pub fn fade_out(&self, step: usize) -> f32 {
        self.coefficients[self.mirror(step)]
    }

    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }
}
