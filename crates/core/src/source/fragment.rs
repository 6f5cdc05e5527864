use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io::{BufReader, Cursor},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{
    configure_device,
    decode::{ByteSource, DecodePump, Decoder},
    SourceKind, SourcePlayer,
};
use crate::{audio::OutputDevice, config::AudioConfig, DomeError, Result};

/// A stored item, addressed by directory and file number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub dir: u8,
    pub file: u8,
}

impl ItemId {
    pub fn new(dir: u8, file: u8) -> Self {
        Self { dir, file }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.dir, self.file)
    }
}

/// What to play from a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub item: ItemId,
    pub start_offset_ms: u32,
    /// Total play duration; the fade-out ends exactly here.
    pub duration_ms: u32,
    pub fade_ms: u32,
}

/// Opens stored items as byte sources.
pub trait ContentStore {
    fn open(&self, item: ItemId) -> Result<ByteSource>;
}

/// Items stored as `<root>/<dir:03>/<file:03>.wav`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, item: ItemId) -> PathBuf {
        self.root
            .join(format!("{:03}", item.dir))
            .join(format!("{:03}.wav", item.file))
    }
}

impl ContentStore for DirectoryStore {
    fn open(&self, item: ItemId) -> Result<ByteSource> {
        let path = self.path_for(item);
        let file = File::open(&path).map_err(|err| {
            tracing::error!(path = %path.display(), %err, "cannot open fragment");
            DomeError::Io(err)
        })?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Items held in memory; used by the simulator and the tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: HashMap<ItemId, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: ItemId, bytes: Vec<u8>) {
        self.items.insert(item, bytes);
    }
}

impl ContentStore for MemoryStore {
    fn open(&self, item: ItemId) -> Result<ByteSource> {
        let bytes = self
            .items
            .get(&item)
            .cloned()
            .ok_or_else(|| DomeError::msg(format!("no stored item {item}")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Input for [`FragmentPlayer::begin`]: an opened decoder plus the request.
pub struct FragmentSource {
    pub descriptor: FragmentDescriptor,
    pub decoder: Box<dyn Decoder>,
}

/// Plays a window of a stored item.
#[derive(Debug)]
pub struct FragmentPlayer {
    stream: DecodePump,
    descriptor: Option<FragmentDescriptor>,
}

impl FragmentPlayer {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            stream: DecodePump::new(SourceKind::Fragment, config),
            descriptor: None,
        }
    }

    pub fn descriptor(&self) -> Option<&FragmentDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn frames_played(&self) -> u64 {
        self.stream.position()
    }

    pub fn stall_count(&self) -> u64 {
        self.stream.stall_count()
    }
}

fn frames_for(ms: u32, sample_rate: u32) -> u64 {
    u64::from(ms) * u64::from(sample_rate) / 1000
}

impl SourcePlayer for FragmentPlayer {
    type Input = FragmentSource;

    fn begin<D: OutputDevice>(&mut self, input: FragmentSource, device: &mut D) -> Result<()> {
        let FragmentSource {
            descriptor,
            mut decoder,
        } = input;
        let rate = decoder.sample_rate();

        let offset = frames_for(descriptor.start_offset_ms, rate);
        if offset > 0 {
            let skipped = decoder.skip_frames(offset)?;
            if skipped < offset {
                return Err(DomeError::InvalidInput("start offset lies past the end of the item"));
            }
        }

        configure_device(device, rate)?;
        let limit = (descriptor.duration_ms > 0).then(|| frames_for(descriptor.duration_ms, rate));
        self.stream.start(decoder, limit);
        self.descriptor = Some(descriptor);
        tracing::info!(
            item = %descriptor.item,
            offset_ms = descriptor.start_offset_ms,
            duration_ms = descriptor.duration_ms,
            sample_rate = rate,
            "fragment started"
        );
        Ok(())
    }

    fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool {
        self.stream.pump(device)
    }

    fn stop<D: OutputDevice>(&mut self, device: &mut D) {
        if self.stream.is_open() {
            device.flush();
        }
        self.stream.close();
        self.descriptor = None;
    }

    fn is_running(&self) -> bool {
        self.stream.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::MemoryDevice,
        source::{decode::tests::wav_bytes, DecoderFactory, WavDecoderFactory},
    };

    fn source(samples: &[i16], offset_ms: u32, duration_ms: u32) -> FragmentSource {
        let bytes = wav_bytes(1, 1_000, samples);
        FragmentSource {
            descriptor: FragmentDescriptor {
                item: ItemId::new(1, 2),
                start_offset_ms: offset_ms,
                duration_ms,
                fade_ms: 0,
            },
            decoder: WavDecoderFactory.create(Box::new(Cursor::new(bytes))).unwrap(),
        }
    }

    #[test]
    fn directory_layout_uses_three_digit_names() {
        let store = DirectoryStore::new("/media");
        assert_eq!(
            store.path_for(ItemId::new(4, 17)),
            PathBuf::from("/media/004/017.wav")
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let store = DirectoryStore::new("/definitely/not/here");
        assert!(matches!(store.open(ItemId::new(1, 1)), Err(DomeError::Io(_))));
    }

    #[test]
    fn plays_the_requested_window() {
        let samples: Vec<i16> = (0..20).collect();
        let mut player = FragmentPlayer::new(&AudioConfig::default());
        let mut device = MemoryDevice::new();

        player.begin(source(&samples, 5, 10), &mut device).unwrap();
        assert_eq!(device.sample_rate, 1_000);
        assert_eq!(device.channels, 2);

        assert!(!player.pump(&mut device));
        let left: Vec<i16> = device.frames().iter().map(|f| f[0]).collect();
        assert_eq!(left, (5..15).collect::<Vec<i16>>());
        assert!(!player.is_running());
    }

    #[test]
    fn offset_past_the_end_is_rejected() {
        let mut player = FragmentPlayer::new(&AudioConfig::default());
        let mut device = MemoryDevice::new();
        let result = player.begin(source(&[1, 2, 3], 10, 0), &mut device);
        assert!(matches!(result, Err(DomeError::InvalidInput(_))));
        assert!(!player.is_running());
    }

    #[test]
    fn stalled_frames_resume_on_the_next_pump() {
        let samples: Vec<i16> = (0..10).collect();
        let mut player = FragmentPlayer::new(&AudioConfig::default());
        let mut device = MemoryDevice::new();
        player.begin(source(&samples, 0, 0), &mut device).unwrap();

        device.set_accepting(false);
        assert!(player.pump(&mut device));
        assert!(device.frames().is_empty());
        assert_eq!(player.stall_count(), 1);

        device.set_accepting(true);
        assert!(!player.pump(&mut device));
        let left: Vec<i16> = device.frames().iter().map(|f| f[0]).collect();
        assert_eq!(left, samples);
    }
}
