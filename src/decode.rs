//! Text decoding for raw payloads
//!
//! Government exports arrive as UTF-16 with or without a BOM, UTF-8 with a
//! BOM, or Latin-1. Decoding never fails for `auto`: Latin-1 maps every byte.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Declared or detected character encoding of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// Detect from BOM and byte patterns
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "utf-16le")]
    Utf16Le,
    #[serde(rename = "utf-16be")]
    Utf16Be,
    #[serde(rename = "latin1")]
    Latin1,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Auto => "auto",
            Encoding::Utf8 => "utf-8",
            Encoding::Utf16Le => "utf-16le",
            Encoding::Utf16Be => "utf-16be",
            Encoding::Latin1 => "latin1",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(Encoding::Auto),
            "utf-8" | "utf8" | "utf-8-sig" => Ok(Encoding::Utf8),
            "utf-16le" | "utf-16" | "utf16le" => Ok(Encoding::Utf16Le),
            "utf-16be" | "utf16be" => Ok(Encoding::Utf16Be),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(Encoding::Latin1),
            _ => Err(format!("Unknown encoding: {}", s)),
        }
    }
}

/// Decoding failure for a declared encoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload is not valid {encoding}: {reason}")]
pub struct DecodeError {
    pub encoding: Encoding,
    pub reason: String,
}

/// Decoded text and the encoding actually used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub encoding: Encoding,
}

/// Decode `bytes` using `declared`, detecting when `Auto`
pub fn decode(bytes: &[u8], declared: Encoding) -> Result<Decoded, DecodeError> {
    let encoding = match declared {
        Encoding::Auto => detect(bytes),
        other => other,
    };
    let text = match encoding {
        Encoding::Utf16Le => decode_utf16(strip_prefix(bytes, &[0xFF, 0xFE]), u16::from_le_bytes)?,
        Encoding::Utf16Be => decode_utf16(strip_prefix(bytes, &[0xFE, 0xFF]), u16::from_be_bytes)?,
        Encoding::Utf8 => std::str::from_utf8(strip_prefix(bytes, &[0xEF, 0xBB, 0xBF]))
            .map(str::to_string)
            .map_err(|e| DecodeError {
                encoding,
                reason: e.to_string(),
            })?,
        Encoding::Latin1 | Encoding::Auto => bytes.iter().map(|&b| b as char).collect(),
    };
    Ok(Decoded {
        text: clean_bom(&text),
        encoding,
    })
}

/// Pick an encoding from the BOM, then from NUL byte placement, then by
/// checking UTF-8 validity
pub fn detect(bytes: &[u8]) -> Encoding {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Encoding::Utf8;
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return Encoding::Utf16Le;
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Encoding::Utf16Be;
    }

    let sample = &bytes[..bytes.len().min(4096)];
    if sample.len() >= 4 && sample.len() % 2 == 0 {
        let pairs = sample.len() / 2;
        let odd_nuls = sample.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
        let even_nuls = sample.iter().step_by(2).filter(|&&b| b == 0).count();
        if odd_nuls * 2 > pairs && even_nuls * 10 < pairs {
            return Encoding::Utf16Le;
        }
        if even_nuls * 2 > pairs && odd_nuls * 10 < pairs {
            return Encoding::Utf16Be;
        }
    }

    if std::str::from_utf8(bytes).is_ok() {
        Encoding::Utf8
    } else {
        Encoding::Latin1
    }
}

/// Remove byte-order marks, including a UTF-16 BOM that was decoded as
/// Latin-1 (`ÿþ`), and surrounding whitespace
pub fn clean_bom(text: &str) -> String {
    text.replace('\u{feff}', "")
        .replace("\u{ff}\u{fe}", "")
        .trim()
        .to_string()
}

fn strip_prefix<'a>(bytes: &'a [u8], bom: &[u8]) -> &'a [u8] {
    bytes.strip_prefix(bom).unwrap_or(bytes)
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> Result<String, DecodeError> {
    let encoding = if to_unit([0x01, 0x00]) == 1 {
        Encoding::Utf16Le
    } else {
        Encoding::Utf16Be
    };
    if bytes.len() % 2 != 0 {
        return Err(DecodeError {
            encoding,
            reason: format!("odd byte length {}", bytes.len()),
        });
    }
    let units = bytes.chunks_exact(2).map(|pair| to_unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| DecodeError {
            encoding,
            reason: e.to_string(),
        })
}
