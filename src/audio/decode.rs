// ABOUTME: Decoder contract and the PCM pass-through decoder
// ABOUTME: Maps codec headers to sample formats, wire payloads to raw PCM

use bytes::Buf;

use crate::audio::{PcmChunk, SampleFormat};
use crate::error::{Error, Result};
use crate::protocol::messages::CodecHeader;

/// Turns codec-specific chunk payloads into raw PCM in place.
pub trait Decoder: Send {
    /// Initialize from the stream's codec header and announce the sample
    /// format of everything decoded afterwards. Called exactly once per
    /// codec installation.
    fn set_header(&mut self, header: &CodecHeader) -> Result<SampleFormat>;

    /// Decode one chunk in place, preserving its capture timestamp.
    /// `Ok(false)` drops the chunk without error (e.g. a partial frame
    /// waiting for more input).
    fn decode(&mut self, chunk: &mut PcmChunk) -> Result<bool>;
}

/// Look up a decoder by the codec name the server announced.
pub fn create_decoder(codec: &str) -> Result<Box<dyn Decoder>> {
    match codec {
        "pcm" => Ok(Box::new(PcmDecoder::new())),
        other => Err(Error::UnsupportedCodec(other.to_string())),
    }
}

/// Pass-through decoder for uncompressed streams. The codec header carries a
/// RIFF/WAVE header describing the sample layout.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    format: Option<SampleFormat>,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for PcmDecoder {
    fn set_header(&mut self, header: &CodecHeader) -> Result<SampleFormat> {
        let format = parse_wave_header(&header.payload)?;
        self.format = Some(format);
        Ok(format)
    }

    fn decode(&mut self, chunk: &mut PcmChunk) -> Result<bool> {
        let format = self
            .format
            .ok_or_else(|| Error::internal("decode called before set_header"))?;
        // the payload already is raw PCM; only the framing can be wrong
        if chunk.payload().len() % format.frame_size() != 0 {
            return Err(Error::Protocol(format!(
                "chunk of {} bytes is not aligned to {}-byte frames",
                chunk.payload().len(),
                format.frame_size()
            )));
        }
        Ok(true)
    }
}

/// Walk a RIFF/WAVE header to its `fmt ` block.
fn parse_wave_header(data: &[u8]) -> Result<SampleFormat> {
    if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(Error::Protocol(
            "pcm codec header is not a RIFF/WAVE header".into(),
        ));
    }
    let mut buf = &data[12..];
    while buf.remaining() >= 8 {
        let mut id = [0u8; 4];
        buf.copy_to_slice(&mut id);
        let len = buf.get_u32_le() as usize;
        if &id == b"fmt " {
            if len < 16 || buf.remaining() < 16 {
                return Err(Error::Protocol("short fmt chunk in wave header".into()));
            }
            let _audio_format = buf.get_u16_le();
            let channels = buf.get_u16_le();
            let rate = buf.get_u32_le();
            let _byte_rate = buf.get_u32_le();
            let _block_align = buf.get_u16_le();
            let bits = buf.get_u16_le();
            if channels == 0 || rate == 0 || bits == 0 {
                return Err(Error::Protocol(format!(
                    "implausible wave format {rate}:{bits}:{channels}"
                )));
            }
            return Ok(SampleFormat::new(rate, bits, channels));
        }
        if buf.remaining() < len {
            break;
        }
        buf.advance(len);
    }
    Err(Error::Protocol("wave header has no fmt chunk".into()))
}
