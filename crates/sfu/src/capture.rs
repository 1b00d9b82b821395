use std::fs::File;

use anyhow::{Context, Result};
use tracing::{info, warn};
use webrtc::media::io::Writer;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::rtp::packet::Packet;

/// Optional capture of a publisher's Opus audio into `<mid>.ogg`.
pub struct AudioCapture {
    writer: OggWriter<File>,
    path: String,
}

impl AudioCapture {
    pub fn create(mid: &str) -> Result<Self> {
        let path = format!("{mid}.ogg");
        let file = File::create(&path).with_context(|| format!("create {path}"))?;
        let writer = OggWriter::new(file, 48000, 2).context("ogg writer")?;
        info!(%path, "capturing publisher audio");
        Ok(Self { writer, path })
    }

    pub fn write(&mut self, pkt: &Packet) {
        if let Err(e) = self.writer.write_rtp(pkt) {
            warn!(path = %self.path, "audio capture write failed: {e}");
        }
    }

    pub fn close(mut self) {
        if let Err(e) = self.writer.close() {
            warn!(path = %self.path, "audio capture close failed: {e}");
        }
    }
}
