//! Fallback Module - Wiedergabe wenn die WHEP-Verhandlung scheitert
//!
//! - Segmentiert (HLS), konditioniert über die Pipeline
//! - Direkt (progressiver HTTP-Stream), ungefiltert

mod fetch;
pub mod playlist;
mod transport;

pub use fetch::{HttpFetcher, MediaFetcher};
pub use playlist::{parse_playlist, MasterPlaylist, MediaPlaylist, Playlist, PlaylistError, Segment};
pub use transport::{FallbackError, FallbackStream, FallbackTransport};
