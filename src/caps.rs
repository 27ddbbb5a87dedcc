//! Media capability strings.
//!
//! Caps describe the format of data on a pad, in the textual form graph
//! engines use:
//!
//! ```text
//! application/x-rtp, media=(string)video, payload=(int)100, clock-rate=(int)90000, encoding-name=(string)VP8
//! ```
//!
//! [`Caps`] keeps field order so that a parsed string prints back the way it
//! was written. [`RtpCodecParameters`] is the transport-side view of the same
//! information (payload type, MIME type, clock rate, channels, fmtp line).

use crate::error::{Error, Result};
use std::fmt;
use winnow::Parser;
use winnow::ascii::multispace0;
use winnow::combinator::{alt, delimited, opt, preceded, repeat};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// Media type of RTP caps.
pub const RTP_MEDIA_TYPE: &str = "application/x-rtp";

/// Fields that map onto [`RtpCodecParameters`] members or are engine
/// bookkeeping, and so never end up in the fmtp line.
const RESERVED_FIELDS: &[&str] = &[
    "media",
    "payload",
    "clock-rate",
    "encoding-name",
    "encoding-params",
    "ssrc",
    "clock-base",
    "seqnum-base",
    "seqnum-offset",
    "timestamp-offset",
    "npt-start",
    "npt-stop",
    "play-speed",
    "play-scale",
];

// ============================================================================
// Values
// ============================================================================

/// A typed caps field value.
#[derive(Debug, Clone, PartialEq)]
pub enum CapsValue {
    /// `(string)` value.
    String(String),
    /// `(int)` value.
    Int(i64),
    /// `(uint)` value.
    UInt(u64),
    /// `(boolean)` value.
    Bool(bool),
    /// `(fraction)` value such as a frame rate.
    Fraction(i32, i32),
}

impl CapsValue {
    /// Type annotation used when printing.
    pub fn type_name(&self) -> &'static str {
        match self {
            CapsValue::String(_) => "string",
            CapsValue::Int(_) => "int",
            CapsValue::UInt(_) => "uint",
            CapsValue::Bool(_) => "boolean",
            CapsValue::Fraction(..) => "fraction",
        }
    }

    /// Value as a string slice, for string fields only.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CapsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Value as an integer, for int and uint fields.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CapsValue::Int(i) => Some(*i),
            CapsValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Value rendered without its type annotation.
    pub fn to_plain_string(&self) -> String {
        match self {
            CapsValue::String(s) => s.clone(),
            CapsValue::Int(i) => i.to_string(),
            CapsValue::UInt(u) => u.to_string(),
            CapsValue::Bool(b) => b.to_string(),
            CapsValue::Fraction(n, d) => format!("{n}/{d}"),
        }
    }

    fn from_typed(type_name: &str, raw: &str) -> Option<Self> {
        match type_name {
            "string" | "str" | "s" => Some(CapsValue::String(raw.to_string())),
            "int" | "i" | "gint" => raw.parse().ok().map(CapsValue::Int),
            "uint" | "u" | "guint" => raw.parse().ok().map(CapsValue::UInt),
            "boolean" | "bool" | "b" => match raw {
                "true" | "yes" | "1" => Some(CapsValue::Bool(true)),
                "false" | "no" | "0" => Some(CapsValue::Bool(false)),
                _ => None,
            },
            "fraction" | "f" => Self::parse_fraction(raw),
            _ => None,
        }
    }

    fn from_untyped(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return CapsValue::Int(i);
        }
        match raw {
            "true" => CapsValue::Bool(true),
            "false" => CapsValue::Bool(false),
            _ => CapsValue::String(raw.to_string()),
        }
    }

    fn parse_fraction(raw: &str) -> Option<Self> {
        let (num, den) = raw.split_once('/')?;
        Some(CapsValue::Fraction(
            num.trim().parse().ok()?,
            den.trim().parse().ok()?,
        ))
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.type_name())?;
        match self {
            CapsValue::String(s) if needs_quotes(s) => write!(f, "\"{s}\""),
            other => write!(f, "{}", other.to_plain_string()),
        }
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || matches!(c, ',' | ';' | '=' | '(' | ')' | '"'))
}

// ============================================================================
// Caps
// ============================================================================

/// A single caps structure: media type plus ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Caps {
    media_type: String,
    fields: Vec<(String, CapsValue)>,
}

impl Caps {
    /// Create caps with no fields.
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: Vec::new(),
        }
    }

    /// Parse a caps string.
    pub fn parse(input: &str) -> Result<Self> {
        caps.parse(input.trim())
            .map_err(|e| Error::Protocol(format!("invalid caps '{input}': {e}")))
    }

    /// Media type, e.g. `application/x-rtp`.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Fields in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &CapsValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&CapsValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(CapsValue::as_str)
    }

    /// Look up an integer field.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(CapsValue::as_i64)
    }

    /// Set a field, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: CapsValue) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with_field(mut self, key: impl Into<String>, value: CapsValue) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<CapsValue> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    /// Whether these are RTP caps.
    pub fn is_rtp(&self) -> bool {
        self.media_type == RTP_MEDIA_TYPE
    }

    /// Clock rate for RTP caps.
    pub fn clock_rate(&self) -> Option<u32> {
        self.get_int("clock-rate")
            .and_then(|v| u32::try_from(v).ok())
    }

    /// SSRC carried in the caps, if any.
    pub fn ssrc(&self) -> Option<u32> {
        self.get_int("ssrc").and_then(|v| u32::try_from(v).ok())
    }

    /// Build RTP caps for a codec.
    ///
    /// The fmtp line is split on `;` into string fields after the fixed ones.
    pub fn from_codec_parameters(codec: &RtpCodecParameters) -> Result<Self> {
        let (media, encoding) = codec.split_mime_type()?;
        let mut caps = Caps::new(RTP_MEDIA_TYPE)
            .with_field("media", CapsValue::String(media.to_string()))
            .with_field("payload", CapsValue::Int(codec.payload_type as i64))
            .with_field("clock-rate", CapsValue::Int(codec.clock_rate as i64))
            .with_field(
                "encoding-name",
                CapsValue::String(encoding.to_ascii_uppercase()),
            );
        if codec.channels > 0 {
            caps.set(
                "encoding-params",
                CapsValue::String(codec.channels.to_string()),
            );
        }
        for param in codec.sdp_fmtp_line.split(';') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (key, value) = param.split_once('=').ok_or_else(|| {
                Error::Protocol(format!("fmtp parameter without value: {param}"))
            })?;
            caps.set(key.trim(), CapsValue::String(value.trim().to_string()));
        }
        Ok(caps)
    }

    /// Extract RTP codec parameters.
    ///
    /// `media` and `encoding-name` are required; `payload` and `clock-rate`
    /// must be integers. Non-reserved fields become the fmtp line in order.
    pub fn to_codec_parameters(&self) -> Result<RtpCodecParameters> {
        if !self.is_rtp() {
            return Err(Error::Protocol(format!(
                "expected {RTP_MEDIA_TYPE} caps, got {}",
                self.media_type
            )));
        }
        let media = self
            .get_str("media")
            .ok_or_else(|| Error::Protocol("caps missing media type".into()))?;
        let encoding = self
            .get_str("encoding-name")
            .ok_or_else(|| Error::Protocol("caps missing encoding name".into()))?;
        let payload_type = self
            .get_int("payload")
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| Error::Protocol("caps missing payload type".into()))?;
        let clock_rate = self
            .clock_rate()
            .ok_or_else(|| Error::Protocol("caps missing clock rate".into()))?;
        let channels = self
            .get("encoding-params")
            .and_then(|v| v.to_plain_string().parse::<u16>().ok())
            .unwrap_or(0);

        let sdp_fmtp_line = self
            .fields
            .iter()
            .filter(|(k, _)| !is_reserved(k))
            .map(|(k, v)| format!("{k}={}", v.to_plain_string()))
            .collect::<Vec<_>>()
            .join(";");

        Ok(RtpCodecParameters {
            payload_type,
            mime_type: format!("{media}/{encoding}"),
            clock_rate,
            channels,
            sdp_fmtp_line,
        })
    }
}

fn is_reserved(key: &str) -> bool {
    RESERVED_FIELDS.contains(&key) || key.starts_with("a-") || key.starts_with("rtcp-fb-")
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        for (key, value) in &self.fields {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Caps {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Caps::parse(s)
    }
}

// ============================================================================
// RTP codec parameters
// ============================================================================

/// Transport-side description of an RTP stream's codec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtpCodecParameters {
    /// RTP payload type.
    pub payload_type: u8,
    /// MIME type such as `video/VP8` or `audio/opus`.
    pub mime_type: String,
    /// Clock rate in Hz.
    pub clock_rate: u32,
    /// Audio channel count, 0 when unspecified.
    pub channels: u16,
    /// SDP fmtp parameters, `;`-separated.
    pub sdp_fmtp_line: String,
}

impl RtpCodecParameters {
    /// Create parameters for a MIME type and clock rate.
    pub fn new(mime_type: impl Into<String>, clock_rate: u32, payload_type: u8) -> Self {
        Self {
            payload_type,
            mime_type: mime_type.into(),
            clock_rate,
            ..Default::default()
        }
    }

    /// Set the channel count.
    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Set the fmtp line.
    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.sdp_fmtp_line = fmtp.into();
        self
    }

    /// Split the MIME type into media kind and encoding name.
    pub fn split_mime_type(&self) -> Result<(&str, &str)> {
        match self.mime_type.split_once('/') {
            Some((media, encoding)) if !media.is_empty() && !encoding.is_empty() => {
                Ok((media, encoding))
            }
            _ => Err(Error::Protocol(format!(
                "invalid MIME type: {}",
                self.mime_type
            ))),
        }
    }

    /// Case-insensitive MIME type comparison.
    pub fn is_mime_type(&self, mime_type: &str) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
    }
}

// ============================================================================
// Parser
// ============================================================================

fn caps(input: &mut &str) -> WResult<Caps> {
    let media_type: &str = media_type.parse_next(input)?;
    let fields: Vec<(String, CapsValue)> =
        repeat(0.., preceded((multispace0, ',', multispace0), field)).parse_next(input)?;

    multispace0.parse_next(input)?;
    // Trailing `;` separates multiple structures; only the first is kept.
    let _ = opt((';', take_while(0.., |_: char| true))).parse_next(input)?;
    if !input.is_empty() {
        return Err(ContextError::new());
    }

    Ok(Caps {
        media_type: media_type.to_string(),
        fields,
    })
}

fn media_type<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '+' | '.' | '_')
    })
    .parse_next(input)
}

fn field_name<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
    })
    .parse_next(input)
}

fn type_annotation<'a>(input: &mut &'a str) -> WResult<&'a str> {
    delimited(
        ('(', multispace0),
        take_while(1.., |c: char| c.is_ascii_alphabetic()),
        (multispace0, ')'),
    )
    .parse_next(input)
}

fn raw_value<'a>(input: &mut &'a str) -> WResult<&'a str> {
    alt((
        delimited('"', take_till(0.., '"'), '"'),
        take_till(1.., |c: char| c == ',' || c == ';').map(str::trim_end),
    ))
    .parse_next(input)
}

fn field(input: &mut &str) -> WResult<(String, CapsValue)> {
    let key: &str = field_name.parse_next(input)?;
    (multispace0, '=', multispace0).parse_next(input)?;
    let type_name: Option<&str> = opt(type_annotation).parse_next(input)?;
    multispace0.parse_next(input)?;
    let raw: &str = raw_value.parse_next(input)?;

    let value = match type_name {
        Some(t) => CapsValue::from_typed(t, raw).ok_or_else(ContextError::new)?,
        None => CapsValue::from_untyped(raw),
    };
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VP8: &str = "application/x-rtp, media=(string)video, payload=(int)100, clock-rate=(int)90000, encoding-name=(string)VP8";
    const PCMA: &str = "application/x-rtp, media=(string)audio, payload=(int)111, clock-rate=(int)48000, encoding-name=(string)PCMA, encoding-params=(string)2";
    const H264: &str = "application/x-rtp, media=(string)video, payload=(int)111, clock-rate=(int)90000, encoding-name=(string)H264, packetization-mode=(string)1, profile-level-id=(string)42e01f";

    fn codecs() -> Vec<(&'static str, RtpCodecParameters)> {
        vec![
            (VP8, RtpCodecParameters::new("video/VP8", 90_000, 100)),
            (
                PCMA,
                RtpCodecParameters::new("audio/PCMA", 48_000, 111).with_channels(2),
            ),
            (
                H264,
                RtpCodecParameters::new("video/H264", 90_000, 111)
                    .with_fmtp("packetization-mode=1;profile-level-id=42e01f"),
            ),
        ]
    }

    #[test]
    fn test_codec_to_caps() {
        for (expected, codec) in codecs() {
            let caps = Caps::from_codec_parameters(&codec).unwrap();
            assert_eq!(caps.to_string(), expected);
        }
    }

    #[test]
    fn test_caps_to_codec() {
        for (text, expected) in codecs() {
            let caps = Caps::parse(text).unwrap();
            assert_eq!(caps.to_codec_parameters().unwrap(), expected);
        }
    }

    #[test]
    fn test_parse_untyped_fields() {
        let caps = Caps::parse("application/x-rtp,encoding-name=VP8,payload=96").unwrap();
        assert_eq!(caps.get_str("encoding-name"), Some("VP8"));
        assert_eq!(caps.get_int("payload"), Some(96));
        assert_eq!(
            caps.to_string(),
            "application/x-rtp, encoding-name=(string)VP8, payload=(int)96"
        );
    }

    #[test]
    fn test_parse_quoted_and_fraction() {
        let caps =
            Caps::parse(r#"video/x-raw, format=(string)"I420", framerate=(fraction)30/1"#).unwrap();
        assert_eq!(caps.get_str("format"), Some("I420"));
        assert_eq!(caps.get("framerate"), Some(&CapsValue::Fraction(30, 1)));
        assert!(!caps.is_rtp());
    }

    #[test]
    fn test_ssrc_and_rewrite() {
        let mut caps = Caps::parse(VP8).unwrap().with_field("ssrc", CapsValue::UInt(0xdead_beef));
        assert_eq!(caps.ssrc(), Some(0xdead_beef));
        caps.set("payload", CapsValue::Int(96));
        assert_eq!(caps.get_int("payload"), Some(96));
        assert_eq!(caps.fields().count(), 5);
        assert!(caps.remove("ssrc").is_some());
        assert_eq!(caps.ssrc(), None);
    }

    #[test]
    fn test_invalid_caps() {
        assert!(Caps::parse("").is_err());
        assert!(Caps::parse("application/x-rtp, payload=(int)abc").is_err());
        assert!(Caps::parse("application/x-rtp, payload").is_err());
        let no_encoding = Caps::parse("application/x-rtp, media=(string)video").unwrap();
        assert!(no_encoding.to_codec_parameters().is_err());
        assert!(Caps::from_codec_parameters(&RtpCodecParameters::new("vp8", 90_000, 96)).is_err());
    }
}
