//! H.264 Annex-B bitstream normalization
//!
//! Encoders hand over one access unit at a time as an Annex-B byte stream
//! (NAL units separated by `00 00 01` or `00 00 00 01` start codes). Before an
//! access unit is queued for delivery it is normalized:
//!
//! - access unit delimiters are dropped (they carry nothing a viewer needs)
//! - every remaining NAL unit is re-framed with a 4-byte start code
//! - an IDR access unit that lacks SPS/PPS inline gets the most recently seen
//!   parameter sets prepended, so a viewer that joins mid-stream can decode it
//!
//! ```text
//! in:  [AUD] [IDR slice]                 cache: SPS, PPS
//! out: 00000001 SPS 00000001 PPS 00000001 IDR
//! ```
//!
//! Normalization never fails. Truncated or empty input just yields fewer NAL
//! units, and a key frame seen before any parameter set is passed through
//! unrepaired.

use bytes::{BufMut, Bytes, BytesMut};

/// Start code written in front of every emitted NAL unit
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit type (lower 5 bits of the NAL header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice,
    /// IDR slice (keyframe)
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Anything else (partitions, filler, end of sequence, ...)
    Other(u8),
}

impl NaluType {
    /// Classify a NAL unit by its header byte
    pub fn from_header(b: u8) -> Self {
        match b & 0x1F {
            1 => NaluType::Slice,
            5 => NaluType::Idr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::Aud,
            t => NaluType::Other(t),
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// Most recently observed SPS and PPS units
#[derive(Debug, Clone, Default)]
pub struct ParameterSetCache {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// True once at least one parameter set of either kind was seen
    pub fn is_primed(&self) -> bool {
        self.sps.is_some() || self.pps.is_some()
    }

    fn contains(&self, nal: &[u8]) -> bool {
        self.sps.as_deref() == Some(nal) || self.pps.as_deref() == Some(nal)
    }

    fn observe(&mut self, kind: NaluType, nal: &[u8]) {
        match kind {
            NaluType::Sps => self.sps = Some(Bytes::copy_from_slice(nal)),
            NaluType::Pps => self.pps = Some(Bytes::copy_from_slice(nal)),
            _ => {}
        }
    }
}

/// A normalized access unit ready to be queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFrame {
    /// Annex-B stream, every NAL unit prefixed with [`START_CODE`]
    pub data: Bytes,
    /// Access unit contains an IDR slice
    pub is_keyframe: bool,
    /// Access unit carried an SPS inline
    pub has_sps: bool,
    /// Access unit carried a PPS inline
    pub has_pps: bool,
}

impl NormalizedFrame {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn start_code_len(data: &[u8], i: usize) -> usize {
    let rest = &data[i..];
    if rest.len() >= 3 && rest[0] == 0 && rest[1] == 0 && rest[2] == 1 {
        3
    } else if rest.len() >= 4 && rest[0] == 0 && rest[1] == 0 && rest[2] == 0 && rest[3] == 1 {
        4
    } else {
        0
    }
}

/// Split an Annex-B byte stream into NAL unit payloads (start codes stripped)
///
/// Bytes before the first start code are skipped; zero-length units are
/// dropped. The last unit runs to the end of the buffer.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut i = 0;
    let mut current: Option<usize> = None;

    while i < data.len() {
        let sc = start_code_len(data, i);
        if sc == 0 {
            i += 1;
            continue;
        }
        if let Some(start) = current.take() {
            if i > start {
                units.push(&data[start..i]);
            }
        }
        i += sc;
        current = Some(i);
    }

    if let Some(start) = current {
        if data.len() > start {
            units.push(&data[start..]);
        }
    }

    units
}

/// Normalize one raw access unit, repairing key frames from `cache`
///
/// `cache` is updated with any SPS/PPS found in `payload` before the repair
/// decision is made.
pub fn normalize(payload: &[u8], cache: &mut ParameterSetCache) -> NormalizedFrame {
    let units: Vec<(NaluType, &[u8])> = split_annexb(payload)
        .into_iter()
        .map(|nal| (NaluType::from_header(nal[0]), nal))
        .filter(|(kind, _)| *kind != NaluType::Aud)
        .collect();

    let mut is_keyframe = false;
    let mut has_sps = false;
    let mut has_pps = false;
    for (kind, nal) in &units {
        match kind {
            NaluType::Idr => is_keyframe = true,
            NaluType::Sps => has_sps = true,
            NaluType::Pps => has_pps = true,
            _ => {}
        }
        cache.observe(*kind, nal);
    }

    let repair = is_keyframe && !(has_sps && has_pps) && cache.is_primed();

    let capacity = units.iter().map(|(_, n)| n.len() + START_CODE.len()).sum::<usize>()
        + if repair {
            cache.sps.as_ref().map_or(0, |s| s.len() + 4) + cache.pps.as_ref().map_or(0, |p| p.len() + 4)
        } else {
            0
        };
    let mut out = BytesMut::with_capacity(capacity);

    if repair {
        for ps in [cache.sps.as_ref(), cache.pps.as_ref()].into_iter().flatten() {
            out.put_slice(&START_CODE);
            out.put_slice(ps);
        }
    }

    for (kind, nal) in &units {
        // Inline parameter sets already emitted from the cache are not repeated;
        // any other ids stay in place.
        if repair && kind.is_parameter_set() && cache.contains(nal) {
            continue;
        }
        out.put_slice(&START_CODE);
        out.put_slice(nal);
    }

    NormalizedFrame {
        data: out.freeze(),
        is_keyframe,
        has_sps,
        has_pps,
    }
}
