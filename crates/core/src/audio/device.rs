use crate::meter::MeterTap;

/// Stereo 16-bit frame as handed to the output device.
pub type Frame = [i16; 2];

/// The single shared output device.
pub trait OutputDevice {
    fn set_gain(&mut self, gain: f32);
    fn set_sample_rate(&mut self, hz: u32);
    fn set_channels(&mut self, channels: u16);
    fn set_bits_per_sample(&mut self, bits: u16);
    /// Starts (or restarts) the output. May need several attempts.
    fn begin(&mut self) -> bool;
    /// Queues one frame; `false` means the buffer is full right now.
    fn consume_sample(&mut self, frame: Frame) -> bool;
    /// Lets the device drain its own buffers.
    fn pump(&mut self);
    fn flush(&mut self);
    fn stop(&mut self);
}

/// Device wrapper that feeds every accepted frame into the level meter.
#[derive(Debug)]
pub struct MeteredOutput<D> {
    inner: D,
    tap: MeterTap,
}

impl<D: OutputDevice> MeteredOutput<D> {
    pub fn new(inner: D, tap: MeterTap) -> Self {
        Self { inner, tap }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }
}

impl<D: OutputDevice> OutputDevice for MeteredOutput<D> {
    fn set_gain(&mut self, gain: f32) {
        self.inner.set_gain(gain);
    }

    fn set_sample_rate(&mut self, hz: u32) {
        self.inner.set_sample_rate(hz);
    }

    fn set_channels(&mut self, channels: u16) {
        self.inner.set_channels(channels);
    }

    fn set_bits_per_sample(&mut self, bits: u16) {
        self.inner.set_bits_per_sample(bits);
    }

    fn begin(&mut self) -> bool {
        self.inner.begin()
    }

    fn consume_sample(&mut self, frame: Frame) -> bool {
        let accepted = self.inner.consume_sample(frame);
        if accepted {
            self.tap.record(frame[0]);
        }
        accepted
    }

    fn pump(&mut self) {
        self.inner.pump();
    }

    fn flush(&mut self) {
        self.inner.flush();
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

/// In-memory device used by the simulator and the tests.
///
/// Frames are stored twice: as received, and scaled by the gain in effect
/// when they arrived (what a listener would hear).
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    pub gain: f32,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub running: bool,
    gains: Vec<f32>,
    frames: Vec<Frame>,
    rendered: Vec<Frame>,
    accepting: bool,
    capacity: Option<usize>,
    queued: usize,
    refused: u64,
    pumps: u64,
    begins: u32,
    failing_begins: u32,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
            running: false,
            gains: Vec::new(),
            frames: Vec::new(),
            rendered: Vec::new(),
            accepting: true,
            capacity: None,
            queued: 0,
            refused: 0,
            pumps: 0,
            begins: 0,
            failing_begins: 0,
        }
    }

    /// Limits how many frames can queue between two `pump` calls.
    pub fn with_capacity(mut self, frames: usize) -> Self {
        self.capacity = Some(frames);
        self
    }

    /// Makes the next `count` calls to `begin` fail.
    pub fn fail_next_begins(&mut self, count: u32) {
        self.failing_begins = count;
    }

    /// While `false`, every frame is refused regardless of capacity.
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    /// Every gain value applied, in order.
    pub fn gain_history(&self) -> &[f32] {
        &self.gains
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn rendered(&self) -> &[Frame] {
        &self.rendered
    }

    pub fn refused(&self) -> u64 {
        self.refused
    }

    pub fn pumps(&self) -> u64 {
        self.pumps
    }

    pub fn begins(&self) -> u32 {
        self.begins
    }

    pub fn clear_capture(&mut self) {
        self.gains.clear();
        self.frames.clear();
        self.rendered.clear();
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for MemoryDevice {
    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
        self.gains.push(gain);
    }

    fn set_sample_rate(&mut self, hz: u32) {
        self.sample_rate = hz;
    }

    fn set_channels(&mut self, channels: u16) {
        self.channels = channels;
    }

    fn set_bits_per_sample(&mut self, bits: u16) {
        self.bits_per_sample = bits;
    }

    fn begin(&mut self) -> bool {
        self.begins += 1;
        if self.failing_begins > 0 {
            self.failing_begins -= 1;
            return false;
        }
        self.running = true;
        true
    }

    fn consume_sample(&mut self, frame: Frame) -> bool {
        let full = self.capacity.map(|cap| self.queued >= cap).unwrap_or(false);
        if !self.accepting || full {
            self.refused += 1;
            return false;
        }
        self.queued += 1;
        self.frames.push(frame);
        let scale = |s: i16| (f32::from(s) * self.gain).clamp(-32768.0, 32767.0) as i16;
        self.rendered.push([scale(frame[0]), scale(frame[1])]);
        true
    }

    fn pump(&mut self) {
        self.pumps += 1;
        self.queued = 0;
    }

    fn flush(&mut self) {
        self.queued = 0;
    }

    fn stop(&mut self) {
        self.running = false;
        self.queued = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::LevelMeter;

    #[test]
    fn capacity_refuses_until_pumped() {
        let mut device = MemoryDevice::new().with_capacity(2);
        assert!(device.consume_sample([1, 1]));
        assert!(device.consume_sample([2, 2]));
        assert!(!device.consume_sample([3, 3]));
        device.pump();
        assert!(device.consume_sample([3, 3]));
        assert_eq!(device.refused(), 1);
    }

    #[test]
    fn rendered_frames_follow_gain() {
        let mut device = MemoryDevice::new();
        device.set_gain(0.5);
        device.consume_sample([1000, -1000]);
        assert_eq!(device.rendered()[0], [500, -500]);
        assert_eq!(device.frames()[0], [1000, -1000]);
    }

    #[test]
    fn metered_output_only_counts_accepted_frames() {
        let mut meter = LevelMeter::new(8);
        let mut device = MeteredOutput::new(MemoryDevice::new(), meter.tap());
        device.inner_mut().set_accepting(false);
        assert!(!device.consume_sample([i16::MAX, 0]));
        assert!(meter.publish().unwrap().is_none());

        device.inner_mut().set_accepting(true);
        assert!(device.consume_sample([300, 0]));
        assert_eq!(meter.publish().unwrap().unwrap().level_raw, 300);
    }
}
