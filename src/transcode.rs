//! Graph descriptions for RTP transcoding.
//!
//! Builds the description strings a media framework needs to depayload,
//! decode, re-encode and re-payload an RTP stream. The element names are
//! those of the GStreamer plugin set; the descriptions are meant for a
//! native [`GraphEngine`](crate::engine::GraphEngine) implementation.
//! [`loopback_description`] builds the equivalent for the local engine,
//! which moves packets without touching the codec.

use crate::caps::{Caps, CapsValue, RtpCodecParameters};
use crate::error::{Error, Result};

/// Framework elements used for one codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecElements {
    /// MIME type (`video/H264`).
    pub mime_type: &'static str,
    /// RTP encoding name (`H264`).
    pub encoding_name: &'static str,
    /// Depayloader element.
    pub depayloader: &'static str,
    /// Encoder with default settings.
    pub default_encoder: &'static str,
    /// Payloader element.
    pub payloader: &'static str,
    /// RTP clock rate.
    pub clock_rate: u32,
    /// Channel count, 0 for video.
    pub channels: u16,
}

const fn codec(
    mime_type: &'static str,
    encoding_name: &'static str,
    depayloader: &'static str,
    default_encoder: &'static str,
    payloader: &'static str,
    clock_rate: u32,
    channels: u16,
) -> CodecElements {
    CodecElements {
        mime_type,
        encoding_name,
        depayloader,
        default_encoder,
        payloader,
        clock_rate,
        channels,
    }
}

/// Every codec the builders know.
pub const SUPPORTED_CODECS: &[CodecElements] = &[
    codec("video/H264", "H264", "rtph264depay", "x264enc speed-preset=ultrafast tune=zerolatency key-int-max=20", "rtph264pay", 90_000, 0),
    codec("video/H265", "H265", "rtph265depay", "x265enc speed-preset=ultrafast tune=zerolatency key-int-max=20", "rtph265pay", 90_000, 0),
    codec("video/VP8", "VP8", "rtpvp8depay", "vp8enc deadline=1", "rtpvp8pay", 90_000, 0),
    codec("video/VP9", "VP9", "rtpvp9depay", "vp9enc deadline=1", "rtpvp9pay", 90_000, 0),
    codec("video/AV1", "AV1", "rtpav1depay", "av1enc deadline=1", "rtpav1pay", 90_000, 0),
    codec("audio/opus", "OPUS", "rtpopusdepay", "opusenc inband-fec=true", "rtpopuspay", 48_000, 2),
    codec("audio/aac", "MP4A-LATM", "rtpmp4adepay", "avenc_aac", "rtpmp4apay", 48_000, 2),
    codec("audio/mpeg", "MPEG", "rtpmpadepay", "lamemp3enc", "rtpmpapay", 90_000, 0),
    codec("audio/speex", "SPEEX", "rtpspeexdepay", "speexenc", "rtpspeexpay", 16_000, 1),
    codec("audio/G722", "G722", "rtpg722depay", "avenc_g722", "rtpg722pay", 8_000, 1),
    codec("audio/PCMA", "PCMA", "rtppcmadepay", "alawenc", "rtppcmapay", 8_000, 1),
    codec("audio/PCMU", "PCMU", "rtppcmudepay", "mulawenc", "rtppcmupay", 8_000, 1),
    codec("audio/ac3", "AC3", "rtpac3depay", "avenc_ac3", "rtpac3pay", 48_000, 2),
    codec("audio/vorbis", "VORBIS", "rtpvorbisdepay", "vorbisenc", "rtpvorbispay", 48_000, 2),
];

/// Elements for a MIME type, compared case-insensitively.
pub fn codec_elements(mime_type: &str) -> Result<&'static CodecElements> {
    SUPPORTED_CODECS
        .iter()
        .find(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
        .ok_or_else(|| Error::Config(format!("unsupported codec {mime_type}")))
}

/// Default output codec for a MIME type or a bare media kind.
///
/// `"video"` maps to H264 and `"audio"` to Opus; a supported MIME type maps
/// to itself at its standard clock rate.
pub fn target_codec(mime_or_kind: &str) -> Result<RtpCodecParameters> {
    let mime = match mime_or_kind {
        "video" => "video/H264",
        "audio" => "audio/opus",
        other => other,
    };
    let elements = codec_elements(mime)?;
    Ok(RtpCodecParameters::new(elements.mime_type, elements.clock_rate, 0)
        .with_channels(elements.channels))
}

fn media_kind(mime_type: &str) -> Result<&'static str> {
    match mime_type.split_once('/').map(|(kind, _)| kind) {
        Some(kind) if kind.eq_ignore_ascii_case("video") => Ok("video"),
        Some(kind) if kind.eq_ignore_ascii_case("audio") => Ok("audio"),
        _ => Err(Error::Config(format!("unsupported codec {mime_type}"))),
    }
}

/// RTP caps describing `codec`, with the framework's encoding name.
pub fn to_rtp_caps(codec: &RtpCodecParameters) -> Result<Caps> {
    let elements = codec_elements(&codec.mime_type)?;
    let mut caps = Caps::from_codec_parameters(codec)?;
    caps.set(
        "encoding-name",
        CapsValue::String(elements.encoding_name.to_string()),
    );
    Ok(caps)
}

fn caps_string(kind: &str, encoding_name: &str, clock_rate: u32, payload: Option<u8>) -> String {
    let mut caps = format!(
        "application/x-rtp,media=(string){kind},encoding-name=(string){encoding_name},clock-rate=(int){clock_rate}"
    );
    if let Some(payload) = payload {
        caps.push_str(&format!(",payload=(int){payload}"));
    }
    caps
}

/// Full transcoding graph from `from` to `to`, fed by an app source named
/// `source` and drained by an app sink named `sink`.
///
/// `encoder` overrides the target codec's default encoder.
pub fn pipeline_string(
    from: &RtpCodecParameters,
    to: &RtpCodecParameters,
    encoder: Option<&str>,
) -> Result<String> {
    let input = codec_elements(&from.mime_type)?;
    let output = codec_elements(&to.mime_type)?;
    let encoder = encoder.unwrap_or(output.default_encoder);

    match media_kind(&from.mime_type)? {
        "video" => {
            let input_caps = caps_string("video", input.encoding_name, from.clock_rate, None);
            let output_caps = caps_string("video", output.encoding_name, to.clock_rate, None);
            Ok(format!(
                "appsrc format=time name=source ! {input_caps} ! rtpjitterbuffer ! {} ! queue ! decodebin ! queue ! videoconvert ! {encoder} ! queue ! {} ! {output_caps} ! appsink name=sink",
                input.depayloader, output.payloader
            ))
        }
        _ => {
            let input_caps = caps_string(
                "audio",
                input.encoding_name,
                from.clock_rate,
                Some(from.payload_type),
            );
            Ok(format!(
                "appsrc format=time name=source ! {input_caps} ! rtpjitterbuffer ! {} ! queue ! decodebin ! queue ! audioconvert ! audioresample ! {encoder} ! {} pt=96 ! appsink name=sink",
                input.depayloader, output.payloader
            ))
        }
    }
}

/// Decode-and-encode section from `from` to `to` (default: H264 for video,
/// Opus for audio), without source or sink.
///
/// `via` overrides the target codec's default encoder.
pub fn encoding_pipeline(from: &str, to: Option<&str>, via: Option<&str>) -> Result<String> {
    let kind = media_kind(from)?;
    let to = match to {
        Some(to) => codec_elements(to)?,
        None => codec_elements(target_codec(kind)?.mime_type.as_str())?,
    };
    let input = codec_elements(from)?;
    let via = via.unwrap_or(to.default_encoder);
    let convert = match kind {
        "video" => "decodebin ! queue ! videoconvert ! videorate ! queue",
        _ => "decodebin ! queue ! audioconvert ! audioresample ! queue",
    };
    Ok([input.depayloader, convert, via, to.payloader].join(" ! "))
}

/// Description the local engine can run for `codec`: media in through
/// `source`, out through `sink`, receiver reports out through `feedback`.
pub fn loopback_description(codec: &RtpCodecParameters, reporter_ssrc: u32) -> Result<String> {
    let caps = to_rtp_caps(codec)?;
    Ok(format!(
        "packetsrc name=source caps=\"{caps}\" ! rtcpreporter ssrc={reporter_ssrc} clock-rate={} feedback=feedback ! appsink name=sink ; packetsrc name=rtcp-source ! feedbacksink name=feedback",
        codec.clock_rate
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::parse_description;

    #[test]
    fn test_target_codec() {
        let video = target_codec("video").unwrap();
        assert_eq!(video.mime_type, "video/H264");
        assert_eq!(video.clock_rate, 90_000);
        let audio = target_codec("audio").unwrap();
        assert_eq!(audio.mime_type, "audio/opus");
        assert_eq!(audio.channels, 2);
        assert!(target_codec("text/plain").is_err());
    }

    #[test]
    fn test_rtp_caps_uses_framework_encoding_name() {
        let caps = to_rtp_caps(&RtpCodecParameters::new("audio/aac", 48_000, 97)).unwrap();
        assert_eq!(caps.get_str("encoding-name"), Some("MP4A-LATM"));
        assert_eq!(caps.get_int("payload"), Some(97));
    }

    #[test]
    fn test_video_pipeline() {
        let from = RtpCodecParameters::new("video/VP8", 90_000, 96);
        let to = RtpCodecParameters::new("video/H264", 90_000, 102);
        let desc = pipeline_string(&from, &to, None).unwrap();
        assert!(desc.starts_with("appsrc format=time name=source ! application/x-rtp,media=(string)video,encoding-name=(string)VP8"));
        assert!(desc.contains("rtpvp8depay ! queue ! decodebin"));
        assert!(desc.contains("x264enc speed-preset=ultrafast"));
        assert!(
            desc.ends_with("encoding-name=(string)H264,clock-rate=(int)90000 ! appsink name=sink")
        );
    }

    #[test]
    fn test_audio_pipeline_with_encoder_override() {
        let from = RtpCodecParameters::new("audio/PCMU", 8_000, 0);
        let to = RtpCodecParameters::new("audio/opus", 48_000, 111);
        let desc = pipeline_string(&from, &to, Some("opusenc bitrate=32000")).unwrap();
        assert!(desc.contains("clock-rate=(int)8000,payload=(int)0"));
        assert!(desc.contains("audioresample ! opusenc bitrate=32000 ! rtpopuspay pt=96"));
    }

    #[test]
    fn test_encoding_pipeline() {
        assert_eq!(
            encoding_pipeline("video/VP9", None, None).unwrap(),
            "rtpvp9depay ! decodebin ! queue ! videoconvert ! videorate ! queue ! x264enc speed-preset=ultrafast tune=zerolatency key-int-max=20 ! rtph264pay"
        );
        assert_eq!(
            encoding_pipeline("audio/PCMA", Some("audio/PCMU"), None).unwrap(),
            "rtppcmadepay ! decodebin ! queue ! audioconvert ! audioresample ! queue ! mulawenc ! rtppcmupay"
        );
        assert!(encoding_pipeline("video/theora", None, None).is_err());
    }

    #[test]
    fn test_loopback_parses() {
        let desc =
            loopback_description(&RtpCodecParameters::new("video/VP8", 90_000, 96), 7).unwrap();
        let graph = parse_description(&desc).unwrap();
        assert_eq!(graph.chains.len(), 2);
        assert_eq!(graph.chains[0][1].factory, "rtcpreporter");
    }
}
