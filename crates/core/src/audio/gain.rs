use super::device::OutputDevice;

/// Multiplicative composition of the three independent volume factors.
///
/// Every setter re-applies the product to the device. Callers clamp their own
/// factor inputs to [0, 1]; the product is still clamped to the device range.
#[derive(Debug, Clone, PartialEq)]
pub struct GainStage {
    base_level: f32,
    fade_factor: f32,
    user_level: f32,
    device_max: f32,
    applied: f32,
}

impl GainStage {
    pub fn new(base_level: f32) -> Self {
        Self {
            base_level,
            fade_factor: 1.0,
            user_level: 1.0,
            device_max: 1.0,
            applied: 0.0,
        }
    }

    pub fn current_gain(&self) -> f32 {
        (self.base_level * self.fade_factor * self.user_level).clamp(0.0, self.device_max)
    }

    /// Value most recently pushed to the device.
    pub fn applied(&self) -> f32 {
        self.applied
    }

    pub fn base_level(&self) -> f32 {
        self.base_level
    }

    pub fn fade_factor(&self) -> f32 {
        self.fade_factor
    }

    pub fn user_level(&self) -> f32 {
        self.user_level
    }

    pub fn apply(&mut self, device: &mut impl OutputDevice) -> f32 {
        let gain = self.current_gain();
        device.set_gain(gain);
        self.applied = gain;
        gain
    }

    pub fn set_base_level(&mut self, value: f32, device: &mut impl OutputDevice) -> f32 {
        self.base_level = value;
        self.apply(device)
    }

    pub fn set_fade_factor(&mut self, value: f32, device: &mut impl OutputDevice) -> f32 {
        self.fade_factor = value;
        self.apply(device)
    }

    pub fn set_user_level(&mut self, value: f32, device: &mut impl OutputDevice) -> f32 {
        self.user_level = value;
        self.apply(device)
    }

    pub fn ceiling(&self) -> f32 {
        self.device_max
    }

    /// Caps the applied gain, whatever the factors multiply to.
    pub fn set_ceiling(&mut self, value: f32, device: &mut impl OutputDevice) -> f32 {
        self.device_max = value;
        self.apply(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemoryDevice;

    #[test]
    fn every_factor_change_reaches_the_device() {
        let mut device = MemoryDevice::new();
        let mut gain = GainStage::new(0.8);

        gain.set_fade_factor(0.5, &mut device);
        gain.set_user_level(0.5, &mut device);
        gain.set_base_level(1.0, &mut device);

        assert_eq!(device.gain_history(), &[0.4, 0.2, 0.25]);
        assert_eq!(gain.applied(), 0.25);
    }

    #[test]
    fn product_never_exceeds_device_range() {
        let mut device = MemoryDevice::new();
        let mut gain = GainStage::new(1.5);
        assert_eq!(gain.apply(&mut device), 1.0);
        gain.set_fade_factor(-1.0, &mut device);
        assert_eq!(device.gain, 0.0);
    }

    #[test]
    fn ceiling_caps_the_product() {
        let mut device = MemoryDevice::new();
        let mut gain = GainStage::new(0.8);
        assert_eq!(gain.set_ceiling(0.5, &mut device), 0.5);
        gain.set_user_level(0.5, &mut device);
        assert_eq!(device.gain, 0.4);
        assert_eq!(gain.set_ceiling(1.0, &mut device), 0.4);
    }
}
