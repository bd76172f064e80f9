//! PCM transforms and forwarding filters.

use std::time::{Duration, Instant};

use anyhow::Result;
use voice_capture_common::RtcpPacket;

use super::{AudioSink, SinkFlow, VoiceData};
use crate::codec::{bytes_to_samples, samples_to_bytes};
use crate::connection::SpeakerId;

/// Highest gain the volume filter applies.
const MAX_VOLUME: f32 = 2.0;

/// Scales 16-bit PCM by a volume factor.
pub struct PcmVolumeFilter<D> {
    // ---
    destination: D,
    volume: f32,
}

impl<D: AudioSink> PcmVolumeFilter<D> {
    // ---
    /// Wraps a PCM sink.
    ///
    /// # Errors
    ///
    /// Returns error if `destination` asks for Opus, since there would be
    /// no samples to scale.
    pub fn new(destination: D, volume: f32) -> Result<Self> {
        // ---
        if destination.wants_opus() {
            anyhow::bail!("volume filter destination must accept PCM, not Opus");
        }

        let mut filter = Self {
            destination,
            volume: 1.0,
        };
        filter.set_volume(volume);
        Ok(filter)
    }

    /// Volume as a factor, e.g. 1.0 for unchanged.
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume; negative values become 0.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.max(0.0);
    }

    fn scale(&self, pcm: &[u8]) -> Vec<u8> {
        // ---
        let gain = self.volume.min(MAX_VOLUME);
        let scaled: Vec<i16> = bytes_to_samples(pcm)
            .into_iter()
            .map(|s| (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();
        samples_to_bytes(&scaled)
    }
}

impl<D: AudioSink> AudioSink for PcmVolumeFilter<D> {
    // ---
    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        let pcm = self.scale(&data.data);
        self.destination.write(VoiceData { data: pcm, ..data })
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.destination.on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        self.destination.flush()
    }

    fn cleanup(&mut self) {
        self.destination.cleanup()
    }
}

/// Forwards only the data a predicate accepts.
pub struct ConditionalFilter<D, P> {
    // ---
    destination: D,
    predicate: P,
}

impl<D, P> ConditionalFilter<D, P>
where
    D: AudioSink,
    P: FnMut(&VoiceData) -> bool + Send,
{
    pub fn new(destination: D, predicate: P) -> Self {
        Self {
            destination,
            predicate,
        }
    }
}

impl<D, P> AudioSink for ConditionalFilter<D, P>
where
    D: AudioSink,
    P: FnMut(&VoiceData) -> bool + Send,
{
    // ---
    fn wants_opus(&self) -> bool {
        self.destination.wants_opus()
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        if (self.predicate)(&data) {
            self.destination.write(data)
        } else {
            SinkFlow::Continue
        }
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.destination.on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        self.destination.flush()
    }

    fn cleanup(&mut self) {
        self.destination.cleanup()
    }
}

/// Forwards data for a fixed duration, then drops everything.
///
/// The window opens at construction with `start_now`, otherwise at the
/// first write.
pub struct TimedFilter<D> {
    // ---
    destination: D,
    duration: Duration,
    started: Option<Instant>,
}

impl<D: AudioSink> TimedFilter<D> {
    // ---
    pub fn new(destination: D, duration: Duration) -> Self {
        Self {
            destination,
            duration,
            started: None,
        }
    }

    pub fn start_now(destination: D, duration: Duration) -> Self {
        Self {
            destination,
            duration,
            started: Some(Instant::now()),
        }
    }

    /// True once the forwarding window has closed.
    pub fn expired(&self) -> bool {
        self.started
            .is_some_and(|start| start.elapsed() >= self.duration)
    }
}

impl<D: AudioSink> AudioSink for TimedFilter<D> {
    // ---
    fn wants_opus(&self) -> bool {
        self.destination.wants_opus()
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        self.started.get_or_insert_with(Instant::now);
        if self.expired() {
            return SinkFlow::Continue;
        }
        self.destination.write(data)
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.destination.on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        self.destination.flush()
    }

    fn cleanup(&mut self) {
        self.destination.cleanup()
    }
}

/// Forwards only one speaker's audio.
pub struct UserFilter<D> {
    destination: D,
    speaker: SpeakerId,
}

impl<D: AudioSink> UserFilter<D> {
    pub fn new(destination: D, speaker: SpeakerId) -> Self {
        Self {
            destination,
            speaker,
        }
    }
}

impl<D: AudioSink> AudioSink for UserFilter<D> {
    // ---
    fn wants_opus(&self) -> bool {
        self.destination.wants_opus()
    }

    fn write(&mut self, data: VoiceData) -> SinkFlow {
        // ---
        if data.speaker == Some(self.speaker) {
            self.destination.write(data)
        } else {
            SinkFlow::Continue
        }
    }

    fn on_rtcp(&mut self, packet: &RtcpPacket) {
        self.destination.on_rtcp(packet)
    }

    fn flush(&mut self) -> SinkFlow {
        self.destination.flush()
    }

    fn cleanup(&mut self) {
        self.destination.cleanup()
    }
}
