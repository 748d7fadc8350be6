//! Seam to the platform audio stack. The engine only ever asks for local
//! transmission to start, stop, or mute; device routing, codecs and RTP all
//! live on the other side of this trait.

use crate::error::Result;
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait AudioBridge: Send + Sync {
    async fn start_audio(&self) -> Result<()>;
    async fn stop_audio(&self) -> Result<()>;
    async fn set_mute(&self, muted: bool) -> Result<()>;
}

/// Default collaborator for headless runs and tests.
pub struct NullAudioBridge;

#[async_trait]
impl AudioBridge for NullAudioBridge {
    async fn start_audio(&self) -> Result<()> {
        debug!("audio start (null bridge)");
        Ok(())
    }

    async fn stop_audio(&self) -> Result<()> {
        debug!("audio stop (null bridge)");
        Ok(())
    }

    async fn set_mute(&self, muted: bool) -> Result<()> {
        debug!(muted, "audio mute (null bridge)");
        Ok(())
    }
}
