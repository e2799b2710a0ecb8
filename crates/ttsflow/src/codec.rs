//! Decoding of adapter payloads into canonical PCM16 mono samples.

use crate::error::{SynthesisError, SynthesisResult};

/// Decode an adapter payload. Raw PCM16LE is taken as-is; RIFF/WAV containers
/// are unwrapped and must hold mono 16-bit integer audio.
///
/// Returns the samples and the effective sample rate.
pub fn decode_payload(payload: &[u8], sample_rate: u32) -> SynthesisResult<(Vec<i16>, u32)> {
    if is_wav(payload) {
        return decode_wav(payload);
    }
    if sample_rate == 0 {
        return Err(SynthesisError::InvalidAudio(
            "sample rate must be greater than zero".to_string(),
        ));
    }
    Ok((decode_pcm16le(payload)?, sample_rate))
}

/// Raw little-endian PCM16 bytes to samples
pub fn decode_pcm16le(bytes: &[u8]) -> SynthesisResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(SynthesisError::InvalidAudio(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn is_wav(payload: &[u8]) -> bool {
    payload.len() >= 12 && &payload[..4] == b"RIFF" && &payload[8..12] == b"WAVE"
}

#[cfg(feature = "wav")]
fn decode_wav(payload: &[u8]) -> SynthesisResult<(Vec<i16>, u32)> {
    let reader = hound::WavReader::new(std::io::Cursor::new(payload))
        .map_err(|err| SynthesisError::InvalidAudio(format!("unreadable WAV payload: {err}")))?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(SynthesisError::InvalidAudio(format!(
            "expected mono audio, got {} channels",
            spec.channels
        )));
    }
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(SynthesisError::InvalidAudio(format!(
            "expected 16-bit integer PCM, got {} bits {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| SynthesisError::InvalidAudio(format!("truncated WAV payload: {err}")))?;
    Ok((samples, spec.sample_rate))
}

#[cfg(not(feature = "wav"))]
fn decode_wav(_payload: &[u8]) -> SynthesisResult<(Vec<i16>, u32)> {
    Err(SynthesisError::InvalidAudio(
        "WAV payloads require the `wav` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_raw_pcm() {
        let (samples, rate) = decode_payload(&[0x01, 0x00, 0xFF, 0x7F], 22_050).unwrap();
        assert_eq!(samples, vec![1, i16::MAX]);
        assert_eq!(rate, 22_050);
    }

    #[test]
    fn rejects_odd_length() {
        let err = decode_payload(&[0x01, 0x00, 0x02], 16_000).unwrap_err();
        assert!(matches!(err, SynthesisError::InvalidAudio(_)));
    }

    #[test]
    fn rejects_zero_sample_rate() {
        assert!(decode_payload(&[0, 0], 0).is_err());
    }

    #[cfg(feature = "wav")]
    #[test]
    fn decodes_wav_container() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for sample in [10i16, -10, 300] {
                writer.write_sample(sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        let (samples, rate) = decode_payload(cursor.get_ref(), 44_100).unwrap();
        assert_eq!(samples, vec![10, -10, 300]);
        assert_eq!(rate, 8_000);
    }

    #[cfg(feature = "wav")]
    #[test]
    fn rejects_stereo_wav() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(1i16).unwrap();
            writer.write_sample(1i16).unwrap();
            writer.finalize().unwrap();
        }
        assert!(decode_payload(cursor.get_ref(), 8_000).is_err());
    }
}
