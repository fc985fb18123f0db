//! SDP-Hilfen für die WHEP-Verhandlung
//!
//! Nur so viel SDP-Verständnis wie nötig: Media-Zeilen erkennen, die
//! Richtung eines Abschnitts lesen und Antworten aus Text- oder
//! JSON-Hüllen extrahieren.

use super::negotiator::NegotiationError;
use serde_json::Value;

/// Enthält das SDP mindestens eine Audio- oder Video-Media-Zeile?
pub fn has_media_line(sdp: &str) -> bool {
    media_kinds(sdp)
        .iter()
        .any(|kind| *kind == "audio" || *kind == "video")
}

/// Medientypen aller `m=`-Zeilen in Reihenfolge
pub fn media_kinds(sdp: &str) -> Vec<&str> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix("m="))
        .filter_map(|rest| rest.split_whitespace().next())
        .collect()
}

/// Richtungsattribut (`sendrecv`, `recvonly`, ...) des ersten Abschnitts
/// vom Typ `kind`
pub fn direction_of<'a>(sdp: &'a str, kind: &str) -> Option<&'a str> {
    let mut in_section = false;
    for line in sdp.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("m=") {
            if in_section {
                return None;
            }
            in_section = rest.split_whitespace().next() == Some(kind);
            continue;
        }
        if in_section {
            if let Some(attr) = line.strip_prefix("a=") {
                if matches!(attr, "sendrecv" | "sendonly" | "recvonly" | "inactive") {
                    return Some(attr);
                }
            }
        }
    }
    None
}

/// Extrahiert das Answer-SDP aus dem Response-Body.
///
/// Akzeptiert rohes SDP sowie JSON mit `sdp`, `answer` (String) oder
/// `answer.sdp`.
pub fn extract_answer(content_type: Option<&str>, body: &str) -> Result<String, NegotiationError> {
    let trimmed = body.trim_start();
    let is_json = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
        || trimmed.starts_with('{');

    if !is_json {
        return Ok(normalize_line_endings(body));
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| NegotiationError::InvalidAnswer(format!("malformed JSON answer: {}", e)))?;

    let sdp = match (value.get("sdp"), value.get("answer")) {
        (Some(Value::String(sdp)), _) => Some(sdp),
        (_, Some(Value::String(sdp))) => Some(sdp),
        (_, Some(Value::Object(answer))) => match answer.get("sdp") {
            Some(Value::String(sdp)) => Some(sdp),
            _ => None,
        },
        _ => None,
    };

    sdp.map(|s| normalize_line_endings(s)).ok_or_else(|| {
        NegotiationError::InvalidAnswer("JSON answer carries no `sdp` or `answer` field".to_string())
    })
}

/// Vereinheitlicht Zeilenenden auf CRLF
pub fn normalize_line_endings(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len() + 32);
    for line in sdp.lines().map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}
