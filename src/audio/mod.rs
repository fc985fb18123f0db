//! Audio Module - Wiedergabe und Signalaufbereitung
//!
//! Media-Feeds, Lautsprecher-Output, die Conditioning-Chain
//! (Biquad-Kaskade + Analyser) und der Spectral Sampler.

mod analyser;
mod codec;
mod context;
mod decode;
mod filters;
mod media;
mod output;
mod pipeline;
mod playback;
mod sampler;

pub use analyser::{AnalyserTap, FFT_SIZE, SMOOTHING};
pub use codec::{CodecError, OpusDecoder};
pub use context::{AudioContext, AudioEngine, AudioGraphError, ContextState, DESTINATION_LABEL};
pub use decode::{decode_segment, decode_stream, ChannelReader};
pub use filters::{BiquadFilter, FilterKind, FilterSpec, FILTER_CASCADE, OUTPUT_GAIN};
pub use media::{
    pcm_i16_to_f32, to_media_format, MediaKind, MediaSource, MediaTap, MediaWriter,
    MEDIA_CHANNELS, MEDIA_SAMPLE_RATE,
};
pub use output::{AudioError, AudioOutput, CpalOutput, NullOutput, OutputStream, RenderCallback};
pub use pipeline::{
    AudioConditioningPipeline, AudioGraphHandle, ConditionedPlayback, NodeKind, PlaybackHandle,
};
pub use playback::RawPlayback;
pub use sampler::{
    rank_peaks, SpectralPeak, SpectralSampler, SpectralSnapshot, DEFAULT_INTERVAL, MAX_PEAKS,
    PEAK_THRESHOLD,
};
