use encoding_rs::{Encoding as RsEncoding, GB18030, SHIFT_JIS, UTF_8, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub trait TextDecoder {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str>;

    /// Decode a C string stored in a fixed-size array: stop at the first NUL (0x00),
    /// or use the whole array when it has none.
    fn decode_cstr<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        self.decode(cstr_bytes(bytes))
    }
}

/// The bytes of a fixed-size character array up to, not including, the first NUL.
#[inline]
pub fn cstr_bytes(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Engine symbol names are plain ASCII, which this covers.
    #[default]
    Utf8,
    /// Windows ANSI code page used by older Win32 builds.
    #[strum(to_string = "cp1252", serialize = "windows-1252")]
    #[serde(rename = "cp1252", alias = "windows-1252")]
    Cp1252,
    #[strum(to_string = "sjis", serialize = "shift_jis")]
    #[serde(rename = "sjis", alias = "shift_jis")]
    ShiftJis,
    /// GBK is read as GB18030 (superset).
    Gbk,
}

impl Encoding {
    #[inline]
    pub fn as_encoding_rs(self) -> &'static RsEncoding {
        match self {
            Encoding::Utf8 => UTF_8,
            Encoding::Cp1252 => WINDOWS_1252,
            Encoding::ShiftJis => SHIFT_JIS,
            Encoding::Gbk => GB18030,
        }
    }
}

/// A decoder bound to one encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decoder {
    enc: Encoding,
}

impl Decoder {
    #[inline]
    pub fn new(enc: Encoding) -> Self {
        Self { enc }
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.enc
    }
}

impl TextDecoder for Decoder {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self.enc {
            Encoding::Utf8 => String::from_utf8_lossy(bytes),
            Encoding::Cp1252 | Encoding::ShiftJis | Encoding::Gbk => {
                let (cow, _had_errors) = self.enc.as_encoding_rs().decode_without_bom_handling(bytes);
                cow
            }
        }
    }
}
