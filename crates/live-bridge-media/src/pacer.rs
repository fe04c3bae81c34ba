//! Outbound audio pacer: turns bursty agent audio into a steady frame cadence.
//!
//! The transport calls [`AudioPacer::pull`] once per frame period. Each call
//! yields exactly one frame. When the agent has not produced enough audio
//! within the underrun timeout, the pacer pads with silence instead of
//! stalling, so the outbound clock never stops.
//!
//! Presentation timestamps come from a frame counter, not the wall clock, so
//! consecutive frames are always exactly `samples_per_frame` apart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use live_bridge_core::types::{BYTES_PER_SAMPLE, FrameFormat};

use crate::frame_buffer::FrameBuffer;

/// One fixed-size unit of outbound audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Presentation timestamp in samples.
    pub pts: u64,
    pub sample_rate: u32,
    pub samples_per_frame: usize,
    /// `samples_per_frame * 2` bytes of 16-bit little-endian mono PCM.
    pub data: Bytes,
}

impl OutboundFrame {
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }
}

/// Running counters for a pacer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub frames_pulled: u64,
    pub silence_frames: u64,
    pub bytes_received: u64,
}

/// Producer side of the pacer. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct PacerSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    format: FrameFormat,
}

impl PacerSink {
    /// Format pushed bytes must already be in.
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Enqueue audio bytes for future pulls. Never blocks and never drops
    /// data while open; after [`PacerSink::close`] it is a no-op.
    ///
    /// Returns whether the bytes were accepted.
    pub fn push(&self, chunk: impl Into<Bytes>) -> bool {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return true;
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => {
                trace!("Pacer closed, dropping pushed audio");
                false
            }
        }
    }

    /// Stop accepting audio. Idempotent.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("Pacer sink closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Consumer side of the pacer, owned by the outbound transport.
pub struct AudioPacer {
    rx: mpsc::UnboundedReceiver<Bytes>,
    buffer: FrameBuffer,
    format: FrameFormat,
    underrun_timeout: Duration,
    next_pts: u64,
    started_at: Option<Instant>,
    finished: bool,
    stats: PacerStats,
}

impl AudioPacer {
    /// Create a connected sink/pacer pair.
    pub fn channel(format: FrameFormat, underrun_timeout: Duration) -> (PacerSink, AudioPacer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = PacerSink {
            tx: Arc::new(Mutex::new(Some(tx))),
            format,
        };
        let pacer = AudioPacer {
            rx,
            buffer: FrameBuffer::new(format.bytes_per_frame()),
            format,
            underrun_timeout,
            next_pts: 0,
            started_at: None,
            finished: false,
            stats: PacerStats::default(),
        };
        (sink, pacer)
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// Bytes received or padded but not yet pulled as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Wall-clock instant of the first pull, if any.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Produce the next frame, or `None` once the sink is closed and every
    /// whole frame has been delivered. A trailing partial frame is discarded.
    pub async fn pull(&mut self) -> Option<OutboundFrame> {
        if self.finished {
            return None;
        }
        self.started_at.get_or_insert_with(Instant::now);

        while !self.buffer.has_frame() {
            match tokio::time::timeout(self.underrun_timeout, self.rx.recv()).await {
                Ok(Some(chunk)) => {
                    self.stats.bytes_received += chunk.len() as u64;
                    self.buffer.extend(&chunk);
                }
                Ok(None) => {
                    let dropped = self.buffer.clear();
                    debug!(dropped, "Pacer drained, discarding partial frame");
                    self.finished = true;
                    return None;
                }
                Err(_) => {
                    self.buffer.pad_silence();
                    self.stats.silence_frames += 1;
                    #[cfg(feature = "metrics")]
                    metrics::counter!("pacer_silence_frames_total").increment(1);
                }
            }
        }

        let data = self.buffer.pop_frame()?;
        let pts = self.next_pts;
        self.next_pts += self.format.samples_per_frame() as u64;
        self.stats.frames_pulled += 1;
        #[cfg(feature = "metrics")]
        metrics::counter!("pacer_frames_total").increment(1);

        Some(OutboundFrame {
            pts,
            sample_rate: self.format.sample_rate,
            samples_per_frame: self.format.samples_per_frame(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn pacer_24k() -> (PacerSink, AudioPacer) {
        AudioPacer::channel(FrameFormat::new(24_000, 20), TIMEOUT)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifty_ms_chunk_then_underrun() {
        let (sink, mut pacer) = pacer_24k();

        // 50ms at 24kHz = 1200 samples = 2400 bytes
        let samples: Vec<i16> = (1..=1200).map(|i| i as i16).collect();
        assert!(sink.push(pcm_bytes(&samples)));

        let f1 = pacer.pull().await.unwrap();
        let f2 = pacer.pull().await.unwrap();
        let f3 = pacer.pull().await.unwrap();

        assert_eq!(f1.samples(), samples[..480].to_vec());
        assert_eq!(f2.samples(), samples[480..960].to_vec());

        let s3 = f3.samples();
        assert_eq!(s3.len(), 480);
        assert_eq!(&s3[..240], &samples[960..]);
        assert!(s3[240..].iter().all(|&s| s == 0));

        assert_eq!(f2.pts - f1.pts, 480);
        assert_eq!(f3.pts - f2.pts, 480);
        assert_eq!(pacer.stats().silence_frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_pull_is_one_frame_and_bytes_are_conserved() {
        let (sink, mut pacer) = pacer_24k();
        let chunk_sizes = [1usize, 333, 960, 7, 2048, 958, 4001];
        let total: usize = chunk_sizes.iter().sum();

        // Gaps longer than the underrun timeout force padding mid-stream
        let producer = sink.clone();
        tokio::spawn(async move {
            for size in chunk_sizes {
                producer.push(vec![1u8; size]);
                tokio::time::sleep(TIMEOUT * 3).await;
            }
            producer.close();
        });

        let mut pulled = 0usize;
        let mut real = 0usize;
        let mut last_pts = None;
        while let Some(frame) = pacer.pull().await {
            assert_eq!(frame.data.len(), 960);
            if let Some(prev) = last_pts {
                assert_eq!(frame.pts - prev, 480);
            }
            last_pts = Some(frame.pts);
            pulled += frame.data.len();
            real += frame.data.iter().filter(|&&b| b == 1).count();

            let padding = pacer.stats().silence_frames as usize * 960;
            let received = pacer.stats().bytes_received as usize;
            assert_eq!(pulled + pacer.buffered(), received + padding);
        }

        // Every pushed byte was pulled except the partial frame left at close
        let stats = pacer.stats();
        let padding = stats.silence_frames as usize * 960;
        assert!(stats.silence_frames > 0);
        assert_eq!(stats.bytes_received as usize, total);
        let discarded = total + padding - pulled;
        assert!(discarded < 960);
        assert!(total - real <= discarded);
        assert_eq!(pacer.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_reports_pacer_format() {
        let (sink, pacer) = AudioPacer::channel(FrameFormat::new(48_000, 20), TIMEOUT);
        assert_eq!(sink.format(), pacer.format());
        assert_eq!(sink.format().bytes_per_frame(), 1920);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_when_agent_is_quiet() {
        let (_sink, mut pacer) = pacer_24k();
        let mut pts = Vec::new();
        for _ in 0..5 {
            let frame = pacer.pull().await.unwrap();
            assert!(frame.data.iter().all(|&b| b == 0));
            pts.push(frame.pts);
        }
        assert_eq!(pts, vec![0, 480, 960, 1440, 1920]);
        assert_eq!(pacer.stats().silence_frames, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_arriving_within_timeout_is_not_padded() {
        let (sink, mut pacer) = pacer_24k();
        let producer = sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push(vec![7u8; 960]);
        });

        let frame = pacer.pull().await.unwrap();
        assert!(frame.data.iter().all(|&b| b == 7));
        assert_eq!(pacer.stats().silence_frames, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_close_is_noop() {
        let (sink, mut pacer) = pacer_24k();
        sink.push(vec![3u8; 960]);
        sink.close();
        sink.close();
        assert!(sink.is_closed());
        assert!(!sink.push(vec![4u8; 960]));

        // Audio queued before close is still delivered
        let frame = pacer.pull().await.unwrap();
        assert!(frame.data.iter().all(|&b| b == 3));
        assert!(pacer.pull().await.is_none());
        assert!(pacer.pull().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_final_chunk_is_discarded() {
        let (sink, mut pacer) = pacer_24k();
        sink.push(vec![5u8; 960 + 100]);
        sink.close();

        assert!(pacer.pull().await.is_some());
        assert!(pacer.pull().await.is_none());
        assert_eq!(pacer.stats().frames_pulled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_queue() {
        let (sink, mut pacer) = pacer_24k();
        let other = sink.clone();
        sink.push(vec![1u8; 480]);
        other.push(vec![2u8; 480]);
        let frame = pacer.pull().await.unwrap();
        assert!(frame.data[..480].iter().all(|&b| b == 1));
        assert!(frame.data[480..].iter().all(|&b| b == 2));

        other.close();
        assert!(sink.is_closed());
    }
}
