//! Manifest document model.
//!
//! Deserializes the period / adaptation-set / representation hierarchy of an
//! MPD manifest and exposes the representation-selection policy. The model is
//! immutable after parsing; selection helpers borrow from it.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DashError;

/// Media type of an adaptation set. Only the two types the acquisition
/// pipeline downloads are modelled; anything else (subtitles, images) is
/// ignored during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
        }
    }
}

/// Root manifest element.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "@mediaPresentationDuration")]
    pub media_presentation_duration: Option<String>,

    #[serde(rename = "BaseURL")]
    pub base_url: Option<String>,

    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,

    #[serde(rename = "@duration")]
    pub duration: Option<String>,

    #[serde(rename = "BaseURL")]
    pub base_url: Option<String>,

    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,

    #[serde(rename = "@contentType")]
    pub content_type: Option<String>,

    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,

    /// Template declared at set level applies to every representation that
    /// does not carry its own.
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,

    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,

    /// Declared bandwidth in bits per second. Drives selection.
    #[serde(rename = "@bandwidth", default)]
    pub bandwidth: u64,

    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,

    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,

    #[serde(rename = "BaseURL")]
    pub base_url: Option<String>,

    #[serde(rename = "SegmentList")]
    pub segment_list: Option<SegmentList>,

    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentList {
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,

    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,

    #[serde(rename = "Initialization")]
    pub initialization: Option<Initialization>,

    #[serde(rename = "SegmentURL", default)]
    pub segment_urls: Vec<SegmentUrl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Initialization {
    #[serde(rename = "@sourceURL")]
    pub source_url: Option<String>,

    #[serde(rename = "@range")]
    pub range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentUrl {
    #[serde(rename = "@media")]
    pub media: Option<String>,

    #[serde(rename = "@mediaRange")]
    pub media_range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentTemplate {
    #[serde(rename = "@media")]
    pub media: Option<String>,

    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,

    #[serde(rename = "@startNumber")]
    pub start_number: Option<u64>,

    /// Fixed segment duration in `@timescale` units; absent when a
    /// `SegmentTimeline` spells the durations out instead.
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,

    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,

    #[serde(rename = "SegmentTimeline")]
    pub timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub spans: Vec<TimelineSpan>,
}

/// One `<S>` run of the timeline: a start time (optional, defaults to the
/// end of the previous run), a duration, and a repeat count.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineSpan {
    #[serde(rename = "@t")]
    pub start: Option<u64>,

    #[serde(rename = "@d")]
    pub duration: u64,

    #[serde(rename = "@r", default)]
    pub repeat: i64,
}

/// Parse a manifest document.
pub fn parse(bytes: &[u8]) -> Result<Manifest, DashError> {
    let manifest: Manifest = quick_xml::de::from_reader(bytes)?;
    Ok(manifest)
}

impl Manifest {
    /// Total presentation duration, when declared.
    pub fn presentation_duration(&self) -> Option<Duration> {
        self.media_presentation_duration
            .as_deref()
            .and_then(|s| parse_iso8601_duration(s).ok())
    }
}

impl Period {
    pub fn duration(&self) -> Option<Duration> {
        self.duration
            .as_deref()
            .and_then(|s| parse_iso8601_duration(s).ok())
    }

    /// First adaptation set of the requested media type, in document order.
    pub fn adaptation_set(&self, media: MediaType) -> Option<&AdaptationSet> {
        self.adaptation_sets
            .iter()
            .find(|set| set.media_type() == Some(media))
    }
}

impl AdaptationSet {
    /// Media type derived from `@contentType`, falling back to the mime type
    /// prefix declared on the set or on its first representation.
    pub fn media_type(&self) -> Option<MediaType> {
        let hint = self
            .content_type
            .as_deref()
            .or(self.mime_type.as_deref())
            .or_else(|| {
                self.representations
                    .first()
                    .and_then(|r| r.mime_type.as_deref())
            })?;

        if hint.starts_with("video") {
            Some(MediaType::Video)
        } else if hint.starts_with("audio") {
            Some(MediaType::Audio)
        } else {
            None
        }
    }

    /// Representation with the highest declared bandwidth. Ties resolve to
    /// the first-listed representation, so the choice is deterministic for a
    /// given manifest.
    pub fn best_representation(&self) -> Option<&Representation> {
        let mut best: Option<&Representation> = None;
        for rep in &self.representations {
            match best {
                Some(current) if rep.bandwidth <= current.bandwidth => {}
                _ => best = Some(rep),
            }
        }
        best
    }
}

impl Representation {
    /// The template governing this representation, preferring its own over
    /// the one inherited from the adaptation set.
    pub fn template<'a>(&'a self, set: &'a AdaptationSet) -> Option<&'a SegmentTemplate> {
        self.segment_template
            .as_ref()
            .or(set.segment_template.as_ref())
    }
}

/// Parse an ISO-8601 duration of the `P[nD][T[nH][nM][nS]]` shape used by
/// manifests. Fractional seconds are honored; year/month designators are not
/// supported (they do not occur in media presentations).
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, DashError> {
    let invalid = || DashError::InvalidDuration {
        input: input.to_string(),
    };

    let rest = input.strip_prefix('P').ok_or_else(invalid)?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut secs = 0f64;
    let mut number = String::new();

    for ch in date_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else if ch == 'D' {
            let days: f64 = number.parse().map_err(|_| invalid())?;
            secs += days * 86_400.0;
            number.clear();
        } else {
            return Err(invalid());
        }
    }
    if !number.is_empty() {
        return Err(invalid());
    }

    for ch in time_part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else {
            let value: f64 = number.parse().map_err(|_| invalid())?;
            match ch {
                'H' => secs += value * 3_600.0,
                'M' => secs += value * 60.0,
                'S' => secs += value,
                _ => return Err(invalid()),
            }
            number.clear();
        }
    }
    if !number.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs_f64(secs))
}
