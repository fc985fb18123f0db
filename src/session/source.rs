//! Quellen und Stream-Endpunkte

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Die zwei Streams des Relays
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Vinyl,
    Cd,
}

impl Source {
    /// Pfadsegment auf Relay und Media-Server
    pub fn name(self) -> &'static str {
        match self {
            Source::Vinyl => "vinyl",
            Source::Cd => "cd",
        }
    }

    /// `{stream_url}/{name}/`
    pub fn stream_base(self, stream_url: &str) -> String {
        format!("{}/{}/", stream_url.trim_end_matches('/'), self.name())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vinyl" => Ok(Source::Vinyl),
            "cd" => Ok(Source::Cd),
            other => Err(format!("unknown source '{}' (expected vinyl or cd)", other)),
        }
    }
}

// ============================================================================
// ENDPOINT SET
// ============================================================================

/// Geordnete, duplikatfreie Kandidaten für die WHEP-Verhandlung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpointSet {
    candidates: Vec<String>,
}

impl StreamEndpointSet {
    pub fn from_base(base: &str) -> Self {
        let forms = [
            format!("{}whep", base),
            format!("{}/whep", base.trim_end_matches('/')),
            format!("{}webrtc", base),
        ];

        let mut candidates: Vec<String> = Vec::with_capacity(forms.len());
        for url in forms {
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }
        Self { candidates }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(String::as_str)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_base() {
        assert_eq!(
            Source::Vinyl.stream_base("http://host:8889/"),
            "http://host:8889/vinyl/"
        );
        assert_eq!(Source::Cd.stream_base("http://host:8889"), "http://host:8889/cd/");
    }

    #[test]
    fn test_endpoints_deduplicate_trailing_slash() {
        let set = StreamEndpointSet::from_base("http://host:8889/vinyl/");
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["http://host:8889/vinyl/whep", "http://host:8889/vinyl/webrtc"]
        );
    }

    #[test]
    fn test_endpoints_without_trailing_slash() {
        let set = StreamEndpointSet::from_base("http://host:8889/vinyl");
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![
                "http://host:8889/vinylwhep",
                "http://host:8889/vinyl/whep",
                "http://host:8889/vinylwebrtc",
            ]
        );
    }

    #[test]
    fn test_parse_source() {
        assert_eq!("Vinyl".parse::<Source>().unwrap(), Source::Vinyl);
        assert_eq!("cd".parse::<Source>().unwrap(), Source::Cd);
        assert!("tape".parse::<Source>().is_err());
    }
}
