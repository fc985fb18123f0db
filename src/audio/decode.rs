//! Container-Decoding für den Fallback-Pfad
//!
//! HLS-Segmente und der progressive Direkt-Stream werden mit symphonia
//! demuxt. Opus-Tracks (z.B. in fMP4) gehen an den `OpusDecoder`, alles
//! andere an die symphonia-Codecs. Beide Funktionen blockieren und laufen
//! in `spawn_blocking`.

use super::codec::{CodecError, OpusDecoder};
use super::media::{to_media_format, MediaWriter};
use parking_lot::Mutex;
use std::io::{Cursor, ErrorKind, Read};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_OPUS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::{MediaSource, MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// PACKET DECODER
// ============================================================================

enum PacketDecoder {
    Opus(OpusDecoder),
    Native(Box<dyn Decoder>),
}

impl PacketDecoder {
    /// Dekodiert ein Paket ins Media-Format. Defekte Pakete liefern
    /// `Ok(None)` und werden übersprungen.
    fn decode(&mut self, packet: &Packet) -> Result<Option<Vec<f32>>, CodecError> {
        match self {
            PacketDecoder::Opus(decoder) => match decoder.decode(packet.buf()) {
                Ok(samples) => Ok(Some(samples)),
                Err(e) => {
                    tracing::debug!("Skipping undecodable opus packet: {}", e);
                    Ok(None)
                }
            },
            PacketDecoder::Native(decoder) => match decoder.decode(packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    Ok(Some(to_media_format(
                        buffer.samples(),
                        spec.channels.count(),
                        spec.rate,
                    )))
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("Skipping undecodable packet: {}", e);
                    Ok(None)
                }
                Err(e) => Err(CodecError::Container(e.to_string())),
            },
        }
    }
}

struct OpenedMedia {
    format: Box<dyn FormatReader>,
    track_id: u32,
    decoder: PacketDecoder,
}

fn open_media(source: Box<dyn MediaSource>, extension: Option<&str>) -> Result<OpenedMedia, CodecError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CodecError::Container(e.to_string()))?;
    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| CodecError::Container("no audio track".to_string()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let decoder = if params.codec == CODEC_TYPE_OPUS {
        let channels = params.channels.map(|c| c.count()).unwrap_or(2);
        PacketDecoder::Opus(OpusDecoder::new(channels)?)
    } else {
        let native = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| CodecError::Unsupported(e.to_string()))?;
        PacketDecoder::Native(native)
    };

    Ok(OpenedMedia {
        format,
        track_id,
        decoder,
    })
}

/// Nächstes Paket des gewählten Tracks; `None` am Ende des Streams
fn next_packet(media: &mut OpenedMedia) -> Result<Option<Packet>, CodecError> {
    loop {
        match media.format.next_packet() {
            Ok(packet) if packet.track_id() == media.track_id => return Ok(Some(packet)),
            Ok(_) => continue,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                return Ok(None)
            }
            Err(SymphoniaError::ResetRequired) => return Ok(None),
            Err(e) => return Err(CodecError::Container(e.to_string())),
        }
    }
}

// ============================================================================
// SEGMENTS
// ============================================================================

/// Dekodiert ein vollständiges Segment (ggf. mit vorangestelltem Init-Segment)
pub fn decode_segment(bytes: Vec<u8>, extension: Option<&str>) -> Result<Vec<f32>, CodecError> {
    let mut media = open_media(Box::new(Cursor::new(bytes)), extension)?;

    let mut samples = Vec::new();
    while let Some(packet) = next_packet(&mut media)? {
        if let Some(decoded) = media.decoder.decode(&packet)? {
            samples.extend_from_slice(&decoded);
        }
    }
    Ok(samples)
}

// ============================================================================
// PROGRESSIVE STREAM
// ============================================================================

/// Blockierender `Read` über einen Kanal von Byte-Chunks
pub struct ChannelReader {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx: Mutex::new(rx),
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.get_mut().blocking_recv() {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Dekodiert einen progressiven Stream in `writer`, bis er endet oder der
/// Feed geschlossen wird. `started` meldet den ersten dekodierten Block
/// oder den Fehler davor.
pub fn decode_stream<R>(
    reader: R,
    extension: Option<&str>,
    writer: &MediaWriter,
    mut started: Option<oneshot::Sender<Result<(), CodecError>>>,
) -> Result<(), CodecError>
where
    R: Read + Send + Sync + 'static,
{
    let result = pump_stream(reader, extension, writer, &mut started);

    if let Some(tx) = started.take() {
        let _ = tx.send(match &result {
            Ok(()) => Err(CodecError::NoAudio),
            Err(e) => Err(CodecError::Container(e.to_string())),
        });
    }
    result
}

fn pump_stream<R>(
    reader: R,
    extension: Option<&str>,
    writer: &MediaWriter,
    started: &mut Option<oneshot::Sender<Result<(), CodecError>>>,
) -> Result<(), CodecError>
where
    R: Read + Send + Sync + 'static,
{
    let mut media = open_media(Box::new(ReadOnlySource::new(reader)), extension)?;

    while let Some(packet) = next_packet(&mut media)? {
        let Some(samples) = media.decoder.decode(&packet)? else {
            continue;
        };
        if samples.is_empty() {
            continue;
        }
        if !writer.push(&samples) {
            tracing::debug!("Direct stream closed by consumer");
            break;
        }
        if let Some(tx) = started.take() {
            let _ = tx.send(Ok(()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::media::{MediaKind, MediaSource as Feed};

    /// Minimale 16-bit PCM WAV-Datei
    fn wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_decode_segment_rejects_garbage() {
        assert!(decode_segment(vec![0u8; 64], Some("mp4")).is_err());
    }

    #[tokio::test]
    async fn test_channel_reader_concatenates_chunks() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(b"hel".to_vec()).await.unwrap();
        tx.send(b"lo".to_vec()).await.unwrap();
        drop(tx);

        let text = tokio::task::spawn_blocking(move || {
            let mut reader = ChannelReader::new(rx);
            let mut text = String::new();
            reader.read_to_string(&mut text).unwrap();
            text
        })
        .await
        .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_decode_stream_reports_garbage() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![0u8; 128]).await.unwrap();
        drop(tx);

        let (feed, writer) = Feed::new(MediaKind::Direct);
        let (started_tx, started_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = decode_stream(ChannelReader::new(rx), None, &writer, Some(started_tx));
        });

        assert!(started_rx.await.unwrap().is_err());
        assert!(!feed.has_first_frame());
    }

    #[test]
    fn test_decode_segment_wav() {
        let pcm: Vec<i16> = (0..480).flat_map(|_| [16384i16, -16384]).collect();
        let samples = decode_segment(wav(48000, 2, &pcm), Some("wav")).unwrap();

        assert_eq!(samples.len(), 960);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert!((samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_segment_resamples_mono() {
        let samples = decode_segment(wav(24000, 1, &[0i16; 2400]), Some("wav")).unwrap();
        assert_eq!(samples.len(), 4800 * 2);
    }

    #[tokio::test]
    async fn test_decode_stream_feeds_writer() {
        let (tx, rx) = mpsc::channel(4);
        let bytes = wav(48000, 2, &vec![1000i16; 4800]);
        for chunk in bytes.chunks(1000) {
            tx.send(chunk.to_vec()).await.unwrap();
        }
        drop(tx);

        let (feed, writer) = Feed::new(MediaKind::Direct);
        let tap = feed.tap();
        let (started_tx, started_rx) = oneshot::channel();
        let task = tokio::task::spawn_blocking(move || {
            decode_stream(ChannelReader::new(rx), Some("wav"), &writer, Some(started_tx))
        });

        assert!(started_rx.await.unwrap().is_ok());
        assert!(task.await.unwrap().is_ok());
        assert!(feed.has_first_frame());
        assert_eq!(tap.available(), 4800);
    }
}
