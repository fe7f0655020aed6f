use snapclient::audio::decode::{create_decoder, Decoder, PcmDecoder};
use snapclient::audio::PcmChunk;
use snapclient::protocol::messages::{CodecHeader, Tv};
use snapclient::Error;

/// Canonical 44-byte RIFF/WAVE header, as the server sends for pcm streams.
fn wave_header(rate: u32, bits: u16, channels: u16) -> Vec<u8> {
    let block_align = channels * (bits / 8);
    let byte_rate = rate * block_align as u32;
    let mut header = Vec::new();
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&36u32.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // PCM
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&0u32.to_le_bytes());
    header
}

fn pcm_header(rate: u32, bits: u16, channels: u16) -> CodecHeader {
    CodecHeader {
        codec: "pcm".to_string(),
        payload: wave_header(rate, bits, channels),
    }
}

// =============================================================================
// Codec selection
// =============================================================================

#[test]
fn test_pcm_codec_is_available() {
    assert!(create_decoder("pcm").is_ok());
}

#[test]
fn test_other_codecs_are_rejected() {
    for codec in ["flac", "ogg", "opus", "mp3", ""] {
        let result = create_decoder(codec);
        assert!(
            matches!(result, Err(Error::UnsupportedCodec(_))),
            "codec {codec:?}"
        );
    }
}

// =============================================================================
// Wave header parsing
// =============================================================================

#[test]
fn test_set_header_reads_the_wave_format() {
    let mut decoder = PcmDecoder::new();
    let format = decoder.set_header(&pcm_header(48_000, 16, 2)).unwrap();
    assert_eq!(format.rate, 48_000);
    assert_eq!(format.bits, 16);
    assert_eq!(format.channels, 2);
    assert_eq!(format.frame_size(), 4);
}

#[test]
fn test_set_header_rejects_non_riff_payload() {
    let mut decoder = PcmDecoder::new();
    let header = CodecHeader {
        codec: "pcm".to_string(),
        payload: b"not a wave header at all".to_vec(),
    };
    assert!(matches!(
        decoder.set_header(&header),
        Err(Error::Protocol(_))
    ));
}

#[test]
fn test_set_header_rejects_zero_rate() {
    let mut decoder = PcmDecoder::new();
    assert!(decoder.set_header(&pcm_header(0, 16, 2)).is_err());
}

// =============================================================================
// Decoding
// =============================================================================

#[test]
fn test_decode_passes_aligned_pcm_through() {
    let mut decoder = PcmDecoder::new();
    let format = decoder.set_header(&pcm_header(48_000, 16, 2)).unwrap();

    let payload: Vec<u8> = (0..96u8).collect();
    let mut chunk = PcmChunk::new(format, Tv { sec: 1, usec: 0 }, payload.clone());
    assert!(decoder.decode(&mut chunk).unwrap());
    assert_eq!(chunk.payload(), &payload[..]);
    assert_eq!(chunk.timestamp(), Tv { sec: 1, usec: 0 });
    assert_eq!(chunk.frame_count(), 24);
}

#[test]
fn test_decode_rejects_misaligned_chunks() {
    let mut decoder = PcmDecoder::new();
    let format = decoder.set_header(&pcm_header(48_000, 16, 2)).unwrap();

    let mut chunk = PcmChunk::new(format, Tv::default(), vec![0u8; 7]);
    assert!(decoder.decode(&mut chunk).is_err());
}

// decoding without a header is a contract violation: debug builds panic at
// the offending site, release builds fail the session with `Internal`

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "decode called before set_header")]
fn test_decode_before_header_panics_in_debug() {
    let mut decoder = PcmDecoder::new();
    let format = snapclient::audio::SampleFormat::new(48_000, 16, 2);
    let mut chunk = PcmChunk::new(format, Tv::default(), vec![0u8; 4]);
    let _ = decoder.decode(&mut chunk);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_decode_before_header_is_an_error() {
    let mut decoder = PcmDecoder::new();
    let format = snapclient::audio::SampleFormat::new(48_000, 16, 2);
    let mut chunk = PcmChunk::new(format, Tv::default(), vec![0u8; 4]);
    assert!(matches!(
        decoder.decode(&mut chunk),
        Err(Error::Internal(_))
    ));
}
