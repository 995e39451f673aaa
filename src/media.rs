//! Local media capture
//!
//! Device capture itself lives outside this crate; the client owns the
//! outgoing tracks and the embedding application writes encoded samples into
//! them through [`LocalMedia`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::utils::random_id;
use crate::{Error, Result};

/// Local audio/video tracks for one call
pub struct LocalMedia {
    stream_id: String,
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    released: Arc<AtomicBool>,
}

impl LocalMedia {
    pub fn new(
        stream_id: impl Into<String>,
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio,
            video,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Media without tracks, used when a transport only needs the handle
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self::new(stream_id, None, None)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn audio(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<TrackLocalStaticSample>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn track_count(&self) -> usize {
        self.tracks().count()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Flag shared with writers so they stop once the call is torn down
    pub fn release_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }

    pub fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub async fn write_audio(&self, data: Bytes, duration: Duration) -> Result<()> {
        let track = self
            .audio
            .as_ref()
            .ok_or_else(|| Error::MediaAccess("no audio track".to_string()))?;
        self.write(track, data, duration).await
    }

    pub async fn write_video(&self, data: Bytes, duration: Duration) -> Result<()> {
        let track = self
            .video
            .as_ref()
            .ok_or_else(|| Error::MediaAccess("no video track".to_string()))?;
        self.write(track, data, duration).await
    }

    async fn write(
        &self,
        track: &Arc<TrackLocalStaticSample>,
        data: Bytes,
        duration: Duration,
    ) -> Result<()> {
        if self.is_released() {
            return Err(Error::MediaAccess("media already released".to_string()));
        }
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Source of local tracks
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire tracks for a new call. Fails with [`Error::MediaAccess`] when
    /// the user has not granted camera/microphone use.
    async fn acquire(&self) -> Result<LocalMedia>;

    /// Give the tracks back; called exactly once per acquired [`LocalMedia`]
    async fn release(&self, media: LocalMedia);
}

/// Which devices the user allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConsent {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConsent {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Creates Opus/VP8 sample tracks fed by the embedding application
pub struct SampleTrackCapture {
    consent: MediaConsent,
}

impl SampleTrackCapture {
    pub fn new(consent: MediaConsent) -> Self {
        Self { consent }
    }
}

#[async_trait]
impl MediaCapture for SampleTrackCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        if !self.consent.audio && !self.consent.video {
            return Err(Error::MediaAccess(
                "camera and microphone access denied".to_string(),
            ));
        }

        let stream_id = format!("stream-{}", random_id());

        let audio = self.consent.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                stream_id.clone(),
            ))
        });

        let video = self.consent.video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                stream_id.clone(),
            ))
        });

        let media = LocalMedia::new(stream_id, audio, video);
        info!(
            "Acquired local media {} with {} track(s)",
            media.stream_id(),
            media.track_count()
        );
        Ok(media)
    }

    async fn release(&self, media: LocalMedia) {
        debug!("Releasing local media {}", media.stream_id());
        media.mark_released();
    }
}
