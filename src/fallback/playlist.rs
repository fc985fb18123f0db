//! HLS-Playlists
//!
//! Nur der Teil von RFC 8216, den ein Live-Audio-Fallback braucht:
//! Master-Playlists (Varianten und Audio-Renditions) sowie Media-Playlists
//! mit `EXT-X-MAP`, `EXTINF`, `EXT-X-MEDIA-SEQUENCE`,
//! `EXT-X-TARGETDURATION` und `EXT-X-ENDLIST`.

use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("Not an HLS playlist (missing #EXTM3U)")]
    MissingHeader,

    #[error("Master playlist lists no streams")]
    NoVariants,

    #[error("Expected a media playlist")]
    UnexpectedMaster,

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Invalid value for {tag}: '{value}'")]
    InvalidTag { tag: String, value: String },
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
    /// `EXT-X-MEDIA:TYPE=AUDIO` mit eigener URI
    pub audio_renditions: Vec<Url>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: Option<u64>,
    pub codecs: Option<String>,
}

impl MasterPlaylist {
    /// Playlist, der der Fallback folgt: bevorzugt eine separate
    /// Audio-Rendition, sonst die erste Variante
    pub fn preferred_media(&self) -> Result<&Url, PlaylistError> {
        self.audio_renditions
            .first()
            .or_else(|| self.variants.first().map(|v| &v.uri))
            .ok_or(PlaylistError::NoVariants)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: Duration,
    pub media_sequence: u64,
    pub init: Option<Url>,
    pub segments: Vec<Segment>,
    pub ended: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub sequence: u64,
    pub uri: Url,
    pub duration: Duration,
}

impl MediaPlaylist {
    /// Die letzten `count` Segmente (Live-Kante)
    pub fn live_edge(&self, count: usize) -> &[Segment] {
        let start = self.segments.len().saturating_sub(count);
        &self.segments[start..]
    }

    /// Segmente ab Sequenznummer `sequence`
    pub fn segments_from(&self, sequence: u64) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.sequence >= sequence)
    }

    /// Poll-Intervall für Live-Playlists, mindestens 500 ms
    pub fn refresh_interval(&self) -> Duration {
        self.target_duration.max(Duration::from_millis(500))
    }
}

// ============================================================================
// PARSER
// ============================================================================

/// Parst eine Playlist; relative URIs werden gegen `base` aufgelöst
pub fn parse_playlist(base: &Url, text: &str) -> Result<Playlist, PlaylistError> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(PlaylistError::MissingHeader);
    }

    let lines: Vec<&str> = lines.collect();
    if lines.iter().any(|l| l.starts_with("#EXT-X-STREAM-INF")) {
        parse_master(base, &lines).map(Playlist::Master)
    } else {
        parse_media(base, &lines).map(Playlist::Media)
    }
}

fn parse_master(base: &Url, lines: &[&str]) -> Result<MasterPlaylist, PlaylistError> {
    let mut variants = Vec::new();
    let mut audio_renditions = Vec::new();
    let mut pending: Option<(Option<u64>, Option<String>)> = None;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(attrs);
            let bandwidth = attribute(&attrs, "BANDWIDTH")
                .map(|v| {
                    v.parse::<u64>().map_err(|_| PlaylistError::InvalidTag {
                        tag: "BANDWIDTH".to_string(),
                        value: v.to_string(),
                    })
                })
                .transpose()?;
            let codecs = attribute(&attrs, "CODECS").map(str::to_string);
            pending = Some((bandwidth, codecs));
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attributes(attrs);
            if attribute(&attrs, "TYPE") == Some("AUDIO") {
                if let Some(uri) = attribute(&attrs, "URI") {
                    audio_renditions.push(resolve(base, uri)?);
                }
            }
        } else if line.starts_with('#') {
            continue;
        } else if let Some((bandwidth, codecs)) = pending.take() {
            variants.push(Variant {
                uri: resolve(base, line)?,
                bandwidth,
                codecs,
            });
        }
    }

    if variants.is_empty() && audio_renditions.is_empty() {
        return Err(PlaylistError::NoVariants);
    }

    Ok(MasterPlaylist {
        variants,
        audio_renditions,
    })
}

fn parse_media(base: &Url, lines: &[&str]) -> Result<MediaPlaylist, PlaylistError> {
    let mut target_duration = Duration::ZERO;
    let mut media_sequence = 0u64;
    let mut init = None;
    let mut segments = Vec::new();
    let mut ended = false;
    let mut next_duration: Option<Duration> = None;

    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = Duration::from_secs(parse_number(value, "EXT-X-TARGETDURATION")?);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = parse_number(value, "EXT-X-MEDIA-SEQUENCE")?;
        } else if let Some(attrs) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(attrs);
            if let Some(uri) = attribute(&attrs, "URI") {
                init = Some(resolve(base, uri)?);
            }
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let seconds = value.split(',').next().unwrap_or_default().trim();
            let seconds: f64 = seconds.parse().map_err(|_| PlaylistError::InvalidTag {
                tag: "EXTINF".to_string(),
                value: value.to_string(),
            })?;
            next_duration = Some(Duration::from_secs_f64(seconds.max(0.0)));
        } else if *line == "#EXT-X-ENDLIST" {
            ended = true;
        } else if line.starts_with('#') {
            continue;
        } else {
            let sequence = media_sequence + segments.len() as u64;
            segments.push(Segment {
                sequence,
                uri: resolve(base, line)?,
                duration: next_duration.take().unwrap_or(target_duration),
            });
        }
    }

    Ok(MediaPlaylist {
        target_duration,
        media_sequence,
        init,
        segments,
        ended,
    })
}

fn parse_number(value: &str, tag: &str) -> Result<u64, PlaylistError> {
    value.trim().parse().map_err(|_| PlaylistError::InvalidTag {
        tag: tag.to_string(),
        value: value.to_string(),
    })
}

fn resolve(base: &Url, uri: &str) -> Result<Url, PlaylistError> {
    base.join(uri).map_err(|e| PlaylistError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

/// Zerlegt eine Attributliste (`KEY=VALUE,KEY="a,b"`)
fn parse_attributes(input: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars().chain(std::iter::once(',')) {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                if let Some((key, value)) = current.split_once('=') {
                    attrs.push((
                        key.trim().to_string(),
                        value.trim().trim_matches('"').to_string(),
                    ));
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    attrs
}

fn attribute<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Dateiendung als Probe-Hint; fMP4-Segmente (`.m4s`) sind MP4
pub fn segment_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.next_back()?;
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    Some(match ext.as_str() {
        "m4s" | "m4a" | "cmfa" => "mp4".to_string(),
        _ => ext,
    })
}
