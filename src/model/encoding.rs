//! Text encoding detection and decoding
//!
//! Detection runs once when a buffer is opened, on a small sample from the
//! start of the file:
//!
//! 1. **BOM Detection**: UTF-8 BOM, UTF-16 LE/BE BOM
//! 2. **UTF-16 Heuristics**: zero bytes concentrated on odd (LE) or even (BE)
//!    positions
//! 3. **Fallback**: UTF-8
//!
//! Decoding never fails. Malformed sequences become U+FFFD.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Default share of zero bytes that marks a BOM-less sample as UTF-16
pub const DEFAULT_UTF16_NULL_RATIO: f64 = 0.4;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16_BE_BOM: &[u8] = &[0xFE, 0xFF];

/// Encodings the buffer can read.
///
/// Text is handed out as UTF-8 regardless of the on-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum Encoding {
    /// UTF-8 (default, most common)
    #[default]
    Utf8,
    /// UTF-8 with Byte Order Mark
    Utf8Bom,
    /// UTF-16 Little Endian (Windows default for Unicode files)
    Utf16Le,
    /// UTF-16 Big Endian
    Utf16Be,
}

impl Encoding {
    /// Get the display name for status output
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Utf8Bom => "UTF-8 BOM",
            Self::Utf16Le => "UTF-16 LE",
            Self::Utf16Be => "UTF-16 BE",
        }
    }

    /// Get the encoding_rs Encoding for this type
    pub fn to_encoding_rs(&self) -> &'static encoding_rs::Encoding {
        match self {
            Self::Utf8 | Self::Utf8Bom => encoding_rs::UTF_8,
            Self::Utf16Le => encoding_rs::UTF_16LE,
            Self::Utf16Be => encoding_rs::UTF_16BE,
        }
    }

    /// Get the BOM bytes for this encoding (if any)
    pub fn bom_bytes(&self) -> Option<&'static [u8]> {
        match self {
            Self::Utf8Bom => Some(UTF8_BOM),
            Self::Utf16Le => Some(UTF16_LE_BOM),
            Self::Utf16Be => Some(UTF16_BE_BOM),
            Self::Utf8 => None,
        }
    }

    /// Length of the BOM actually present at the start of `bytes`.
    ///
    /// UTF-16 detected through the zero-byte heuristic has no BOM, so this
    /// looks at the data instead of trusting the variant alone.
    pub fn bom_len(&self, bytes: &[u8]) -> usize {
        match self.bom_bytes() {
            Some(bom) if bytes.starts_with(bom) => bom.len(),
            _ => 0,
        }
    }

    /// Width in bytes of one code unit. Line terminators are searched for
    /// in whole units.
    pub fn unit_width(&self) -> usize {
        match self {
            Self::Utf8 | Self::Utf8Bom => 1,
            Self::Utf16Le | Self::Utf16Be => 2,
        }
    }

    pub fn is_utf16(&self) -> bool {
        self.unit_width() == 2
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Detect the text encoding from a sample of bytes using the default
/// UTF-16 threshold
pub fn detect_encoding(sample: &[u8]) -> Encoding {
    detect_encoding_with_ratio(sample, DEFAULT_UTF16_NULL_RATIO)
}

/// Detect the text encoding from a sample of bytes.
///
/// Without a BOM, a sample where more than `null_ratio` of the code-unit
/// pairs carry a zero high byte is taken as UTF-16 of the matching
/// endianness. Anything else is UTF-8.
pub fn detect_encoding_with_ratio(sample: &[u8], null_ratio: f64) -> Encoding {
    if sample.starts_with(UTF8_BOM) {
        return Encoding::Utf8Bom;
    }
    if sample.starts_with(UTF16_LE_BOM) {
        return Encoding::Utf16Le;
    }
    if sample.starts_with(UTF16_BE_BOM) {
        return Encoding::Utf16Be;
    }

    // Align to even boundary so only complete pairs are counted
    let aligned = &sample[..sample.len() & !1];
    let pair_count = aligned.len() / 2;
    if pair_count < 2 {
        return Encoding::Utf8;
    }

    let odd_zeros = aligned.chunks_exact(2).filter(|pair| pair[1] == 0).count();
    let even_zeros = aligned.chunks_exact(2).filter(|pair| pair[0] == 0).count();
    let threshold = null_ratio * pair_count as f64;

    if odd_zeros as f64 > threshold && odd_zeros > even_zeros {
        Encoding::Utf16Le
    } else if even_zeros as f64 > threshold && even_zeros > odd_zeros {
        Encoding::Utf16Be
    } else {
        Encoding::Utf8
    }
}

/// Decode a byte range to UTF-8 text, replacing malformed sequences.
///
/// The caller strips any BOM: ranges handed in here come from arbitrary
/// line offsets, never necessarily the file start.
pub fn decode_lossy(bytes: &[u8], encoding: Encoding) -> Cow<'_, str> {
    match encoding {
        Encoding::Utf8 | Encoding::Utf8Bom => String::from_utf8_lossy(bytes),
        Encoding::Utf16Le | Encoding::Utf16Be => {
            let (text, had_errors) = encoding.to_encoding_rs().decode_without_bom_handling(bytes);
            if had_errors {
                tracing::trace!(
                    "replaced malformed {} sequence in {} bytes",
                    encoding,
                    bytes.len()
                );
            }
            text
        }
    }
}
