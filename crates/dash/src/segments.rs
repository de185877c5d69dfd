//! Segment enumeration.
//!
//! Turns a selected representation into a lazy, one-shot, cancellable
//! sequence of segment descriptors. The iterator never touches the network;
//! it only does template/timeline arithmetic and URL resolution, so
//! cancelling it guarantees no further segment lookups are produced.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::DashError;
use crate::model::{AdaptationSet, Manifest, Period, Representation};

/// Playback position carried by a segment for progress math.
///
/// `elapsed` is the media time covered once this segment has been appended;
/// `total` is the whole presentation. Both are zero when the manifest does
/// not expose timing, in which case progress degrades to byte counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub elapsed: Duration,
    pub total: Duration,
}

impl Position {
    pub const ZERO: Position = Position {
        elapsed: Duration::ZERO,
        total: Duration::ZERO,
    };

    /// Fraction of the presentation covered, if timing is known.
    pub fn fraction(&self) -> Option<f64> {
        if self.total.is_zero() {
            return None;
        }
        Some((self.elapsed.as_secs_f64() / self.total.as_secs_f64()).min(1.0))
    }
}

/// Inclusive byte range within a segment resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    fn parse(input: &str) -> Option<ByteRange> {
        let (start, end) = input.split_once('-')?;
        Some(ByteRange {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
        })
    }
}

/// One addressable chunk of a representation's media data.
#[derive(Debug, Clone)]
pub struct Segment {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub position: Position,
}

/// Reference to a segment resource before URL resolution.
#[derive(Debug, Clone)]
struct RawRef {
    uri: String,
    byte_range: Option<ByteRange>,
}

/// Expanded addressing plan, one variant per manifest scheme.
#[derive(Debug)]
enum Plan {
    /// Explicit `<SegmentURL>` list.
    List {
        entries: Vec<RawRef>,
        segment_duration: Option<Duration>,
    },
    /// `SegmentTemplate` with a fixed segment duration.
    Template {
        media: String,
        rep_id: String,
        start_number: u64,
        count: u64,
        segment_duration: Duration,
    },
    /// `SegmentTemplate` with an explicit `SegmentTimeline`.
    Timeline {
        media: String,
        rep_id: String,
        start_number: u64,
        /// Normalized (start, duration, occurrences) runs in timescale units.
        runs: Vec<(u64, u64, u64)>,
        timescale: u64,
    },
}

impl Plan {
    fn media_segment_count(&self) -> u64 {
        match self {
            Plan::List { entries, .. } => entries.len() as u64,
            Plan::Template { count, .. } => *count,
            Plan::Timeline { runs, .. } => runs.iter().map(|(_, _, n)| n).sum(),
        }
    }
}

/// Lazy, finite, non-restartable sequence of [`Segment`] values for one
/// representation. Cancelling makes the sequence terminate promptly.
pub struct SegmentIter {
    cancel: CancellationToken,
    base: Url,
    init: Option<RawRef>,
    plan: Plan,
    total: Duration,
    /// Next media segment ordinal (0-based); the init segment is emitted
    /// before ordinal 0.
    next_index: u64,
    init_emitted: bool,
    elapsed: Duration,
    done: bool,
}

impl SegmentIter {
    /// Stop the sequence: the current and all subsequent `next()` calls
    /// return `None`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of segments the sequence will yield in total, including the
    /// init segment when present.
    pub fn segment_count(&self) -> u64 {
        self.plan.media_segment_count() + u64::from(self.init.is_some())
    }

    fn resolve(&self, raw: &RawRef, position: Position) -> Result<Segment, DashError> {
        let url = self
            .base
            .join(&raw.uri)
            .map_err(|e| DashError::invalid_url(&raw.uri, e.to_string()))?;
        Ok(Segment {
            url,
            byte_range: raw.byte_range,
            position,
        })
    }

    fn next_media_segment(&mut self) -> Option<Result<Segment, DashError>> {
        let index = self.next_index;

        let (raw, duration) = match &self.plan {
            Plan::List {
                entries,
                segment_duration,
            } => {
                let entry = entries.get(index as usize)?;
                (entry.clone(), segment_duration.unwrap_or(Duration::ZERO))
            }
            Plan::Template {
                media,
                rep_id,
                start_number,
                count,
                segment_duration,
            } => {
                if index >= *count {
                    return None;
                }
                let uri = expand_template(media, rep_id, Some(start_number + index), None);
                (
                    RawRef {
                        uri,
                        byte_range: None,
                    },
                    *segment_duration,
                )
            }
            Plan::Timeline {
                media,
                rep_id,
                start_number,
                runs,
                timescale,
            } => {
                let (start, dur) = timeline_entry(runs, index)?;
                let uri = expand_template(media, rep_id, Some(start_number + index), Some(start));
                (
                    RawRef {
                        uri,
                        byte_range: None,
                    },
                    Duration::from_secs_f64(dur as f64 / *timescale as f64),
                )
            }
        };

        self.next_index += 1;
        self.elapsed += duration;

        let position = if self.total.is_zero() {
            Position::ZERO
        } else {
            Position {
                elapsed: self.elapsed.min(self.total),
                total: self.total,
            }
        };

        Some(self.resolve(&raw, position))
    }
}

impl Iterator for SegmentIter {
    type Item = Result<Segment, DashError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cancel.is_cancelled() {
            self.done = true;
            return None;
        }

        if !self.init_emitted {
            self.init_emitted = true;
            if let Some(init) = self.init.clone() {
                return Some(self.resolve(&init, Position::ZERO));
            }
        }

        match self.next_media_segment() {
            Some(item) => Some(item),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Look up the (start, duration) of media segment `index` within the
/// normalized timeline runs.
fn timeline_entry(runs: &[(u64, u64, u64)], index: u64) -> Option<(u64, u64)> {
    let mut remaining = index;
    for (start, duration, occurrences) in runs {
        if remaining < *occurrences {
            return Some((start + remaining * duration, *duration));
        }
        remaining -= occurrences;
    }
    None
}

/// Substitute `$RepresentationID$`, `$Number$`, `$Time$` (with optional
/// `%0Nd` width) and `$$` in a segment template.
fn expand_template(template: &str, rep_id: &str, number: Option<u64>, time: Option<u64>) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut parts = template.split('$');
    // Text before the first '$' is literal.
    if let Some(first) = parts.next() {
        out.push_str(first);
    }

    let mut literal = false;
    for part in parts {
        if literal {
            out.push_str(part);
            literal = false;
            continue;
        }
        match expand_token(part, rep_id, number, time) {
            Some(expanded) => out.push_str(&expanded),
            None if part.is_empty() => {
                // "$$" escape.
                out.push('$');
                literal = true;
            }
            None => {
                // Unknown identifier: keep it verbatim, dollars included.
                out.push('$');
                out.push_str(part);
                out.push('$');
            }
        }
        if !literal {
            literal = true;
        }
    }
    out
}

fn expand_token(token: &str, rep_id: &str, number: Option<u64>, time: Option<u64>) -> Option<String> {
    if token == "RepresentationID" {
        return Some(rep_id.to_string());
    }

    let (name, width) = match token.split_once('%') {
        Some((name, format)) => {
            let digits = format.strip_prefix('0')?.strip_suffix('d')?;
            (name, digits.parse::<usize>().ok()?)
        }
        None => (token, 0),
    };

    let value = match name {
        "Number" => number?,
        "Time" => time?,
        _ => return None,
    };
    Some(format!("{value:0width$}"))
}

/// Build the segment sequence for one selected representation.
///
/// `manifest_url` is the URL the manifest was fetched from (after
/// redirects); segment URIs resolve against it through the `BaseURL`
/// chain. Returns an addressing error when the representation exposes no
/// usable scheme or the template's segment count cannot be determined.
pub fn segments_for(
    manifest: &Manifest,
    period: &Period,
    set: &AdaptationSet,
    representation: &Representation,
    manifest_url: &Url,
    cancel: CancellationToken,
) -> Result<SegmentIter, DashError> {
    let rep_label = representation.id.clone().unwrap_or_else(|| "?".to_string());

    let base = resolve_base(
        manifest_url,
        [
            manifest.base_url.as_deref(),
            period.base_url.as_deref(),
            representation.base_url.as_deref(),
        ],
    )?;

    let total = period
        .duration()
        .or_else(|| manifest.presentation_duration())
        .unwrap_or(Duration::ZERO);

    if let Some(list) = &representation.segment_list {
        let entries: Vec<RawRef> = list
            .segment_urls
            .iter()
            .filter_map(|s| {
                s.media.as_ref().map(|uri| RawRef {
                    uri: uri.clone(),
                    byte_range: s.media_range.as_deref().and_then(ByteRange::parse),
                })
            })
            .collect();
        if entries.is_empty() {
            return Err(DashError::addressing(rep_label, "segment list is empty"));
        }

        let segment_duration = match (list.duration, list.timescale) {
            (Some(d), ts) => Some(Duration::from_secs_f64(d as f64 / ts.unwrap_or(1) as f64)),
            _ => None,
        };
        // Without a declared presentation duration, derive it from the list.
        let total = if total.is_zero() {
            segment_duration
                .map(|d| d * entries.len() as u32)
                .unwrap_or(Duration::ZERO)
        } else {
            total
        };

        let init = list.initialization.as_ref().and_then(|i| {
            i.source_url.as_ref().map(|uri| RawRef {
                uri: uri.clone(),
                byte_range: i.range.as_deref().and_then(ByteRange::parse),
            })
        });

        return Ok(SegmentIter {
            cancel,
            base,
            init,
            plan: Plan::List {
                entries,
                segment_duration,
            },
            total,
            next_index: 0,
            init_emitted: false,
            elapsed: Duration::ZERO,
            done: false,
        });
    }

    let template = representation
        .template(set)
        .ok_or_else(|| DashError::addressing(&rep_label, "no segment list or template"))?;
    let media = template
        .media
        .clone()
        .ok_or_else(|| DashError::addressing(&rep_label, "template has no media attribute"))?;
    let timescale = template.timescale.unwrap_or(1);
    let start_number = template.start_number.unwrap_or(1);
    let init = template.initialization.as_ref().map(|uri| RawRef {
        uri: expand_template(uri, &rep_label, None, None),
        byte_range: None,
    });

    if let Some(timeline) = &template.timeline {
        let mut runs = Vec::with_capacity(timeline.spans.len());
        let mut next_start = 0u64;
        let mut total_units = 0u64;
        for span in &timeline.spans {
            let start = span.start.unwrap_or(next_start);
            // Negative repeat (repeat-to-end) only occurs in live manifests;
            // a catch-up presentation always spells its runs out.
            let occurrences = u64::try_from(span.repeat).unwrap_or(0) + 1;
            runs.push((start, span.duration, occurrences));
            next_start = start + span.duration * occurrences;
            total_units += span.duration * occurrences;
        }
        if runs.is_empty() {
            return Err(DashError::addressing(rep_label, "timeline is empty"));
        }

        let total = if total.is_zero() {
            Duration::from_secs_f64(total_units as f64 / timescale as f64)
        } else {
            total
        };

        return Ok(SegmentIter {
            cancel,
            base,
            init,
            plan: Plan::Timeline {
                media,
                rep_id: rep_label,
                start_number,
                runs,
                timescale,
            },
            total,
            next_index: 0,
            init_emitted: false,
            elapsed: Duration::ZERO,
            done: false,
        });
    }

    let duration_units = template
        .duration
        .ok_or_else(|| DashError::addressing(&rep_label, "template has no duration or timeline"))?;
    if duration_units == 0 {
        return Err(DashError::addressing(rep_label, "segment duration is zero"));
    }
    if total.is_zero() {
        return Err(DashError::addressing(
            rep_label,
            "segment count is indeterminate without a presentation duration",
        ));
    }

    let segment_duration = Duration::from_secs_f64(duration_units as f64 / timescale as f64);
    let count = (total.as_secs_f64() / segment_duration.as_secs_f64()).ceil() as u64;

    Ok(SegmentIter {
        cancel,
        base,
        init,
        plan: Plan::Template {
            media,
            rep_id: rep_label,
            start_number,
            count,
            segment_duration,
        },
        total,
        next_index: 0,
        init_emitted: false,
        elapsed: Duration::ZERO,
        done: false,
    })
}

/// Fold a chain of optional `BaseURL` values onto the manifest URL.
fn resolve_base<'a>(
    manifest_url: &Url,
    levels: impl IntoIterator<Item = Option<&'a str>>,
) -> Result<Url, DashError> {
    let mut base = manifest_url.clone();
    for level in levels.into_iter().flatten() {
        base = base
            .join(level)
            .map_err(|e| DashError::invalid_url(level, e.to_string()))?;
    }
    Ok(base)
}
