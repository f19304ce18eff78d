//! Image dimension probing and vision token arithmetic.
//!
//! Vision-capable models bill images by how many 512x512 tiles survive the
//! provider's downscaling. Computing that requires the pixel dimensions,
//! which live in the first few bytes of the image container. The probe
//! reads only headers: a base64 `data:` URL is partially decoded, a remote
//! URL is fetched with a range request for the first 64 KiB. Anything that
//! fails falls back to a fixed conservative token count.

use async_trait::async_trait;
use base64::Engine;
use tracing::debug;

/// Tokens billed for a `low` detail image regardless of size.
pub const LOW_DETAIL_TOKENS: u32 = 85;
/// Tokens billed per surviving 512x512 tile.
const TOKENS_PER_TILE: u32 = 170;
/// Base cost added on top of the tiles.
const TILE_BASE_TOKENS: u32 = 85;
/// Conservative token count used when dimensions cannot be determined.
pub const FALLBACK_IMAGE_TOKENS: u32 = 765;

/// Longest-side cap applied before tiling.
const MAX_LONG_SIDE: u32 = 2048;
/// Shortest-side cap applied after the long-side scale.
const MAX_SHORT_SIDE: u32 = 768;
/// Tile edge length.
const TILE_SIDE: u32 = 512;

/// How many bytes of a remote image to request for header parsing.
const HEADER_RANGE_BYTES: u64 = 64 * 1024;

/// Token cost for an image of known dimensions at full detail.
///
/// Mirrors the provider algorithm: scale the longest side to at most 2048,
/// then the shortest side to at most 768, tile the result into 512x512
/// blocks, and bill `170 * tiles + 85`.
pub fn image_tokens(width: u32, height: u32) -> u32 {
    if width == 0 || height == 0 {
        return FALLBACK_IMAGE_TOKENS;
    }
    let (mut w, mut h) = (f64::from(width), f64::from(height));

    let long = w.max(h);
    if long > f64::from(MAX_LONG_SIDE) {
        let scale = f64::from(MAX_LONG_SIDE) / long;
        w *= scale;
        h *= scale;
    }
    let short = w.min(h);
    if short > f64::from(MAX_SHORT_SIDE) {
        let scale = f64::from(MAX_SHORT_SIDE) / short;
        w *= scale;
        h *= scale;
    }

    let tiles_w = (w / f64::from(TILE_SIDE)).ceil();
    let tiles_h = (h / f64::from(TILE_SIDE)).ceil();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let tiles = (tiles_w * tiles_h) as u32;

    TOKENS_PER_TILE
        .saturating_mul(tiles.max(1))
        .saturating_add(TILE_BASE_TOKENS)
}

// ---------------------------------------------------------------------------
// Probe interface
// ---------------------------------------------------------------------------

/// Resolves the pixel dimensions of an image reference.
///
/// Kept behind a trait so token counting can be tested without touching the
/// network or real image bytes.
#[async_trait]
pub trait ImageDimensionProbe: Send + Sync {
    /// `(width, height)` of the referenced image, or `None` when unknown.
    async fn dimensions(&self, url: &str) -> Option<(u32, u32)>;
}

/// A probe that always answers with a fixed result. Test helper.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub Option<(u32, u32)>);

#[async_trait]
impl ImageDimensionProbe for StaticProbe {
    async fn dimensions(&self, _url: &str) -> Option<(u32, u32)> {
        self.0
    }
}

/// The production probe: decodes `data:` URL prefixes and issues HTTP range
/// requests for remote images, then parses container headers.
#[derive(Debug, Clone, Default)]
pub struct HeaderProbe {
    client: reqwest::Client,
}

impl HeaderProbe {
    /// Create a probe with a fresh HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    async fn remote_header(&self, url: &str) -> Option<Vec<u8>> {
        let range = format!("bytes=0-{}", HEADER_RANGE_BYTES.saturating_sub(1));
        let response = self
            .client
            .get(url)
            .header("Range", range)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.bytes().await.ok().map(|b| b.to_vec())
    }
}

#[async_trait]
impl ImageDimensionProbe for HeaderProbe {
    async fn dimensions(&self, url: &str) -> Option<(u32, u32)> {
        let header = if let Some(payload) = data_url_payload(url) {
            decode_base64_prefix(payload)?
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.remote_header(url).await?
        } else {
            return None;
        };

        let dims = parse_dimensions(&header);
        if dims.is_none() {
            debug!(url_prefix = url.get(..48).unwrap_or(url), "unrecognised image header");
        }
        dims
    }
}

/// Extract the base64 payload of a `data:` URL, if it is one.
fn data_url_payload(url: &str) -> Option<&str> {
    if !url.starts_with("data:") {
        return None;
    }
    let comma = url.find(',')?;
    let meta = &url[..comma];
    if !meta.contains("base64") {
        return None;
    }
    Some(&url[comma.saturating_add(1)..])
}

/// Decode enough of a base64 payload to cover any supported header.
fn decode_base64_prefix(payload: &str) -> Option<Vec<u8>> {
    // 4096 base64 chars decode to 3072 bytes, plenty for every container.
    let prefix_len = payload.len().min(4096);
    // Stay on a 4-char base64 boundary so the decoder accepts the slice.
    let prefix_len = prefix_len.saturating_sub(prefix_len % 4);
    let prefix = payload.get(..prefix_len)?;
    base64::engine::general_purpose::STANDARD.decode(prefix).ok()
}

/// Parse `(width, height)` out of PNG, GIF or JPEG header bytes.
pub fn parse_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() >= 24 && bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        return Some((width, height));
    }
    if bytes.len() >= 10 && (bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")) {
        let width = u32::from(u16::from_le_bytes([bytes[6], bytes[7]]));
        let height = u32::from(u16::from_le_bytes([bytes[8], bytes[9]]));
        return Some((width, height));
    }
    if bytes.len() >= 4 && bytes.starts_with(&[0xFF, 0xD8]) {
        return parse_jpeg_dimensions(bytes);
    }
    None
}

/// Walk JPEG segments until a start-of-frame marker carrying dimensions.
fn parse_jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2usize;
    while i.saturating_add(9) < bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i.saturating_add(1)];
        // SOF0..SOF15 carry dimensions, except DHT/JPG/DAC markers.
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let h = u32::from(u16::from_be_bytes([
                bytes[i.saturating_add(5)],
                bytes[i.saturating_add(6)],
            ]));
            let w = u32::from(u16::from_be_bytes([
                bytes[i.saturating_add(7)],
                bytes[i.saturating_add(8)],
            ]));
            return Some((w, h));
        }
        let seg_len = usize::from(u16::from_be_bytes([
            bytes[i.saturating_add(2)],
            bytes[i.saturating_add(3)],
        ]));
        if seg_len < 2 {
            return None;
        }
        i = i.saturating_add(2).saturating_add(seg_len);
    }
    None
}
