//! Streaming mono resampler for inbound audio.
//!
//! Input arrives in arbitrarily sized bursts, so samples are buffered until
//! the FFT resampler has a full input chunk. Leftover input stays queued for
//! the next call.

use bytes::Bytes;
use rubato::{FftFixedIn, Resampler as _};
use tracing::debug;

use live_bridge_core::types::{AudioChunk, BYTES_PER_SAMPLE};

use crate::MediaError;

/// Resample 16-bit mono PCM from one rate to another.
pub struct MonoResampler {
    input_rate: u32,
    output_rate: u32,
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl MonoResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, MediaError> {
        if input_rate == 0 || output_rate == 0 {
            return Err(MediaError::Resample(format!(
                "invalid rates {input_rate} -> {output_rate}"
            )));
        }

        let inner = if input_rate == output_rate {
            None
        } else {
            // 10ms input chunks keep latency low without starving the FFT
            let chunk = (input_rate as usize / 100).max(64);
            let resampler =
                FftFixedIn::<f32>::new(input_rate as usize, output_rate as usize, chunk, 2, 1)
                    .map_err(|e| MediaError::Resample(e.to_string()))?;
            debug!(input_rate, output_rate, chunk, "Created resampler");
            Some(resampler)
        };

        Ok(Self {
            input_rate,
            output_rate,
            inner,
            pending: Vec::new(),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Samples buffered but not yet resampled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed mono samples, returning whatever output is ready.
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>, MediaError> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending
            .extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));

        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let frames = resampler
                .process(&[chunk], None)
                .map_err(|e| MediaError::Resample(e.to_string()))?;
            if let Some(channel) = frames.first() {
                out.extend(channel.iter().map(|&s| to_i16(s)));
            }
        }
        Ok(out)
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Average interleaved channels down to one.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 | 1 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / n as i32) as i16
            })
            .collect(),
    }
}

/// Brings PCM chunks of any declared rate to one fixed output rate.
///
/// The inner resampler is rebuilt whenever the source rate changes; input
/// still buffered for the old rate is dropped.
pub struct RateConverter {
    output_rate: u32,
    resampler: Option<MonoResampler>,
}

impl RateConverter {
    pub fn new(output_rate: u32) -> Self {
        Self {
            output_rate,
            resampler: None,
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Convert one chunk, returning 16-bit little-endian mono PCM at the
    /// output rate. May return fewer bytes than a whole chunk while the
    /// resampler fills its window.
    pub fn convert(&mut self, chunk: &AudioChunk) -> Result<Bytes, MediaError> {
        if chunk.sample_rate == self.output_rate && chunk.channels <= 1 {
            return Ok(chunk.data.clone());
        }

        let stale = self
            .resampler
            .as_ref()
            .is_none_or(|r| r.input_rate() != chunk.sample_rate);
        if stale {
            self.resampler = Some(MonoResampler::new(chunk.sample_rate, self.output_rate)?);
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Bytes::new());
        };

        let mono = downmix_to_mono(&pcm_from_le_bytes(&chunk.data), chunk.channels);
        let out = resampler.process(&mono)?;
        Ok(Bytes::from(pcm_to_le_bytes(&out)))
    }
}

/// Parse 16-bit little-endian bytes. A trailing odd byte is ignored.
pub fn pcm_from_le_bytes(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Serialize samples as 16-bit little-endian bytes.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_passthrough() {
        let mut r = MonoResampler::new(16_000, 16_000).unwrap();
        let input = vec![1i16, -2, 3, -4];
        assert_eq!(r.process(&input).unwrap(), input);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(MonoResampler::new(0, 16_000).is_err());
    }

    #[test]
    fn test_downsample_ratio() {
        let mut r = MonoResampler::new(48_000, 16_000).unwrap();
        // One second of input in 20ms bursts
        let burst = vec![1000i16; 960];
        let mut produced = 0;
        for _ in 0..50 {
            produced += r.process(&burst).unwrap().len();
        }
        let consumed = 48_000 - r.pending();
        assert_eq!(produced, consumed / 3);
    }

    #[test]
    fn test_small_bursts_are_buffered() {
        let mut r = MonoResampler::new(48_000, 24_000).unwrap();
        let out = r.process(&[0i16; 10]).unwrap();
        assert!(out.is_empty());
        assert_eq!(r.pending(), 10);
    }

    #[test]
    fn test_downmix_stereo() {
        let stereo = vec![100i16, 300, -100, -300, 7, 7];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![200, -200, 7]);
        assert_eq!(downmix_to_mono(&stereo, 1), stereo);
    }

    #[test]
    fn test_pcm_le_bytes() {
        assert_eq!(pcm_to_le_bytes(&[1, -1]), vec![0x01, 0x00, 0xff, 0xff]);
        assert_eq!(pcm_from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x07]), vec![1, -1]);
    }

    #[test]
    fn test_converter_passes_matching_rate_through() {
        let mut c = RateConverter::new(24_000);
        let chunk = AudioChunk::mono(24_000, vec![9u8; 960]);
        assert_eq!(c.convert(&chunk).unwrap(), chunk.data);
    }

    #[test]
    fn test_converter_upsamples_agent_audio() {
        let mut c = RateConverter::new(48_000);
        // 20ms at 24kHz becomes 20ms at 48kHz
        let chunk = AudioChunk::mono(24_000, pcm_to_le_bytes(&[1000i16; 480]));
        let out = c.convert(&chunk).unwrap();
        assert_eq!(out.len(), 960 * BYTES_PER_SAMPLE);
    }

    #[test]
    fn test_converter_follows_rate_changes() {
        let mut c = RateConverter::new(48_000);
        let at_16k = AudioChunk::mono(16_000, pcm_to_le_bytes(&[0i16; 320]));
        assert_eq!(c.convert(&at_16k).unwrap().len(), 960 * BYTES_PER_SAMPLE);

        let at_24k = AudioChunk::mono(24_000, pcm_to_le_bytes(&[0i16; 480]));
        assert_eq!(c.convert(&at_24k).unwrap().len(), 960 * BYTES_PER_SAMPLE);
    }
}
