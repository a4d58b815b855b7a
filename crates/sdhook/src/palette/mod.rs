//! Palette image codec.
//!
//! Lossy but deterministic compression for thumbnail-sized previews:
//! 1. Quantize every channel (`round(c / divisor)`)
//! 2. Collect colors that repeat at least `min_run_length` times within some row
//! 3. Scan each column top to bottom, replacing qualifying runs with
//!    `"<count>y<paletteIndex>"` tokens that reference a 1-based palette
//!
//! The result is packed with [`crate::wire::pack`] before leaving the process.

mod codec;
mod raster;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::wire::{self, WireError};

pub use codec::{decode, encode, quantize};
pub use raster::RasterImage;

/// A single RGB pixel (quantized or not, depending on context).
pub type Rgb = [u8; 3];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Pixel buffer holds {actual} pixels, expected {expected} for {width}x{height}")]
    Dimensions {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid codec options: {0}")]
    InvalidOptions(&'static str),
    #[error("Palette index {index} out of range (palette has {len} colors)")]
    PaletteIndex { index: u32, len: usize },
    #[error("Expected {expected} columns, found {actual}")]
    ColumnCount { expected: u32, actual: usize },
    #[error("Column {column} decodes to {actual} pixels, expected {expected}")]
    ColumnLength {
        column: usize,
        expected: u32,
        actual: usize,
    },
    #[error("Invalid run token '{0}'")]
    InvalidToken(String),
    #[error("Invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Every channel is divided by this and rounded. Must be at least 1.
    pub quantize_divisor: u8,
    /// Shortest run that may become a palette token. Must be at least 1.
    pub min_run_length: u32,
}

impl EncodeOptions {
    pub const DEFAULT_QUANTIZE_DIVISOR: u8 = 5;
    pub const DEFAULT_MIN_RUN_LENGTH: u32 = 3;

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.quantize_divisor == 0 {
            return Err(CodecError::InvalidOptions("quantize_divisor must be >= 1"));
        }
        if self.min_run_length == 0 {
            return Err(CodecError::InvalidOptions("min_run_length must be >= 1"));
        }
        Ok(())
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quantize_divisor: Self::DEFAULT_QUANTIZE_DIVISOR,
            min_run_length: Self::DEFAULT_MIN_RUN_LENGTH,
        }
    }
}

/// One element of an encoded column.
///
/// Serializes as `[r, g, b]` for literals and `"<count>y<index>"` for runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Literal(Rgb),
    Run { count: u32, index: u32 },
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Literal([r, g, b]) => write!(f, "[{r},{g},{b}]"),
            Token::Run { count, index } => write!(f, "{count}y{index}"),
        }
    }
}

impl FromStr for Token {
    type Err = CodecError;

    /// Parses a run token. Literals never appear as strings on the wire.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CodecError::InvalidToken(s.to_string());
        let (count, index) = s.split_once('y').ok_or_else(invalid)?;
        let count: u32 = count.parse().map_err(|_| invalid())?;
        let index: u32 = index.parse().map_err(|_| invalid())?;
        if count == 0 || index == 0 {
            return Err(invalid());
        }
        Ok(Token::Run { count, index })
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Token::Literal(rgb) => rgb.serialize(serializer),
            Token::Run { .. } => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawToken {
            Literal(Rgb),
            Run(String),
        }

        match RawToken::deserialize(deserializer)? {
            RawToken::Literal(rgb) => Ok(Token::Literal(rgb)),
            RawToken::Run(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Encoded image: dimensions, 1-indexed palette and per-column tokens.
///
/// Wire form is the JSON array `[[width, height], palette, columns]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteImage {
    pub width: u32,
    pub height: u32,
    pub palette: Vec<Rgb>,
    pub columns: Vec<Vec<Token>>,
}

impl PaletteImage {
    pub fn token_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    pub fn run_count(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .filter(|t| matches!(t, Token::Run { .. }))
            .count()
    }

    /// Compact JSON, deflated and hex-encoded.
    pub fn to_wire(&self) -> Result<String, CodecError> {
        Ok(wire::pack(self)?)
    }

    pub fn from_wire(payload: &str) -> Result<Self, CodecError> {
        Ok(wire::unpack(payload)?)
    }
}

impl Serialize for PaletteImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ((self.width, self.height), &self.palette, &self.columns).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PaletteImage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ((width, height), palette, columns) =
            <((u32, u32), Vec<Rgb>, Vec<Vec<Token>>)>::deserialize(deserializer)?;
        Ok(Self {
            width,
            height,
            palette,
            columns,
        })
    }
}

/// Transport payload for a finished job's image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub width: u32,
    pub height: u32,
    /// Hex-encoded, deflated wire form of the [`PaletteImage`].
    pub data: String,
}

impl EncodedImage {
    pub fn from_raster(raster: &RasterImage, options: EncodeOptions) -> Result<Self, CodecError> {
        let encoded = encode(raster, options)?;
        let data = encoded.to_wire()?;
        tracing::debug!(
            width = encoded.width,
            height = encoded.height,
            palette_len = encoded.palette.len(),
            tokens = encoded.token_count(),
            runs = encoded.run_count(),
            wire_len = data.len(),
            "Encoded palette image"
        );
        Ok(Self {
            width: encoded.width,
            height: encoded.height,
            data,
        })
    }

    pub fn decode(&self) -> Result<RasterImage, CodecError> {
        decode(&PaletteImage::from_wire(&self.data)?)
    }
}
