//! Opus-Decoder für eingehende RTP-Payloads und Opus-in-MP4-Segmente

use super::media::{pcm_i16_to_f32, to_media_format, MEDIA_SAMPLE_RATE};
use audiopus::{coder::Decoder, packet::Packet, Channels, MutSignals, SampleRate};
use thiserror::Error;

/// Maximale Opus-Framedauer: 120ms @ 48kHz
const MAX_FRAME_SAMPLES: usize = 5760;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Opus error: {0}")]
    Opus(#[from] audiopus::Error),

    #[error("Unsupported codec: {0}")]
    Unsupported(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Stream ended before any audio was decoded")]
    NoAudio,
}

pub struct OpusDecoder {
    decoder: Decoder,
    channels: usize,
    buffer: Vec<i16>,
}

impl OpusDecoder {
    /// Decoder für 48kHz mit 1 oder 2 Kanälen
    pub fn new(channels: usize) -> Result<Self, CodecError> {
        let (opus_channels, channels) = match channels {
            1 => (Channels::Mono, 1),
            2 => (Channels::Stereo, 2),
            other => {
                return Err(CodecError::Unsupported(format!(
                    "opus with {} channels",
                    other
                )))
            }
        };

        Ok(Self {
            decoder: Decoder::new(SampleRate::Hz48000, opus_channels)?,
            channels,
            buffer: vec![0i16; MAX_FRAME_SAMPLES * channels],
        })
    }

    /// Dekodiert ein Paket ins Media-Format (48kHz Stereo f32)
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, CodecError> {
        let packet = Packet::try_from(payload)?;
        let output = MutSignals::try_from(&mut self.buffer[..])?;
        let samples = self.decoder.decode(Some(packet), output, false)?;

        let pcm = pcm_i16_to_f32(&self.buffer[..samples * self.channels]);
        Ok(to_media_format(&pcm, self.channels, MEDIA_SAMPLE_RATE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiopus::coder::Encoder;
    use audiopus::Application;

    #[test]
    fn test_decodes_encoded_frame() {
        let encoder = Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
            .unwrap();
        let pcm = vec![0i16; 960 * 2];
        let mut packet = vec![0u8; 4000];
        let len = encoder.encode(&pcm, &mut packet).unwrap();

        let mut decoder = OpusDecoder::new(2).unwrap();
        let samples = decoder.decode(&packet[..len]).unwrap();
        assert_eq!(samples.len(), 960 * 2);
    }

    #[test]
    fn test_rejects_surround() {
        assert!(matches!(
            OpusDecoder::new(6),
            Err(CodecError::Unsupported(_))
        ));
    }
}
