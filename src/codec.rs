//! Binary frame codec for device sample blocks
//!
//! Inbound frames are little-endian:
//!
//! | field           | type       |
//! |-----------------|------------|
//! | device_id       | u8         |
//! | timestamp_start | i64 (ms)   |
//! | sample_rate     | i16 (Hz)   |
//! | sample_count    | i16        |
//! | samples         | n x f32    |
//!
//! Outbound broadcast frames carry the samples only, with no header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Size of the fixed frame header in bytes
pub const HEADER_SIZE: usize = 1 + 8 + 2 + 2;

/// Default upper bound on samples per frame
pub const DEFAULT_MAX_SAMPLES: usize = 2048;

/// Device id of the primary (front) electrode
pub const FRONT_CHANNEL: u8 = 1;

/// Device id of the reference electrode
pub const REFERENCE_CHANNEL: u8 = 2;

/// Errors produced while decoding a frame
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// One decoded block of samples from a single device
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    pub device_id: u8,
    /// Timestamp of the first sample, in milliseconds
    pub timestamp_start: i64,
    pub sample_rate: i16,
    pub samples: Vec<f32>,
}

impl SampleBlock {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Milliseconds between consecutive samples
    pub fn sample_period_ms(&self) -> f64 {
        1000.0 / self.sample_rate as f64
    }

    /// Absolute timestamp (ms) of the sample at `index`
    pub fn sample_time(&self, index: usize) -> f64 {
        self.timestamp_start as f64 + index as f64 * self.sample_period_ms()
    }
}

/// Stateless frame codec with a bounded sample count
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_samples: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

impl PacketCodec {
    pub fn new(max_samples: usize) -> Self {
        Self { max_samples }
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// Decode a complete inbound frame.
    ///
    /// The declared sample count is validated against the buffer length before
    /// any sample is read, so a lying header can never cause an over-read.
    pub fn decode(&self, bytes: &[u8]) -> Result<SampleBlock, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Malformed(format!(
                "frame of {} bytes is shorter than the {} byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let mut cursor = Cursor::new(bytes);
        let device_id = read(cursor.read_u8())?;
        let timestamp_start = read(cursor.read_i64::<LittleEndian>())?;
        let sample_rate = read(cursor.read_i16::<LittleEndian>())?;
        let sample_count = read(cursor.read_i16::<LittleEndian>())?;

        if sample_rate <= 0 {
            return Err(DecodeError::Malformed(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }

        if sample_count <= 0 {
            return Err(DecodeError::Malformed(format!(
                "sample count must be positive, got {}",
                sample_count
            )));
        }

        let sample_count = sample_count as usize;
        if sample_count > self.max_samples {
            return Err(DecodeError::Malformed(format!(
                "sample count {} exceeds maximum {}",
                sample_count, self.max_samples
            )));
        }

        let expected = HEADER_SIZE + 4 * sample_count;
        if bytes.len() != expected {
            return Err(DecodeError::Malformed(format!(
                "frame length {} does not match declared {} samples ({} bytes)",
                bytes.len(),
                sample_count,
                expected
            )));
        }

        let mut samples = vec![0.0f32; sample_count];
        read(cursor.read_f32_into::<LittleEndian>(&mut samples))?;

        Ok(SampleBlock {
            device_id,
            timestamp_start,
            sample_rate,
            samples,
        })
    }

    /// Encode a block into the inbound wire format (inverse of [`decode`](Self::decode))
    pub fn encode_frame(&self, block: &SampleBlock) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 4 * block.samples.len());
        // Writes into a Vec cannot fail
        let _ = out.write_u8(block.device_id);
        let _ = out.write_i64::<LittleEndian>(block.timestamp_start);
        let _ = out.write_i16::<LittleEndian>(block.sample_rate);
        let _ = out.write_i16::<LittleEndian>(block.samples.len() as i16);
        out.extend_from_slice(&encode_samples(&block.samples));
        out
    }
}

/// Encode samples as a headerless little-endian f32 array (broadcast payload)
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Decode a headerless broadcast payload
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::Malformed(format!(
            "payload of {} bytes is not a whole number of f32 samples",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn read<T>(result: std::io::Result<T>) -> Result<T, DecodeError> {
    result.map_err(|e| DecodeError::Malformed(format!("truncated frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(samples: Vec<f32>) -> SampleBlock {
        SampleBlock {
            device_id: FRONT_CHANNEL,
            timestamp_start: 1_700_000_000_000,
            sample_rate: 250,
            samples,
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let codec = PacketCodec::default();
        let sent = block(vec![0.5, -12.25, 3.0e-6, f32::MAX, -0.0]);

        let bytes = codec.encode_frame(&sent);
        assert_eq!(bytes.len(), HEADER_SIZE + 4 * 5);

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, sent);
    }

    #[test]
    fn test_broadcast_payload_round_trip() {
        let samples = vec![1.0, -2.5, 1.0e-3];
        let bytes = encode_samples(&samples);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_samples(&bytes).unwrap(), samples);
        assert!(decode_samples(&bytes[..11]).is_err());
    }

    #[test]
    fn test_rejects_truncated_frame() {
        let codec = PacketCodec::default();
        let bytes = codec.encode_frame(&block(vec![1.0; 10]));

        for cut in [0, 5, HEADER_SIZE - 1, HEADER_SIZE, bytes.len() - 1] {
            let result = codec.decode(&bytes[..cut]);
            assert!(
                matches!(result, Err(DecodeError::Malformed(_))),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let codec = PacketCodec::default();
        let mut bytes = codec.encode_frame(&block(vec![1.0; 4]));
        bytes.push(0);
        assert!(codec.decode(&bytes).is_err());
    }

    #[test]
    fn test_rejects_oversized_claim() {
        let codec = PacketCodec::new(16);
        let mut bytes = codec.encode_frame(&block(vec![1.0; 4]));
        // Claim 1000 samples while carrying 4
        bytes[11..13].copy_from_slice(&1000i16.to_le_bytes());

        let err = codec.decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_rejects_non_positive_count_and_rate() {
        let codec = PacketCodec::default();
        let mut bytes = codec.encode_frame(&block(vec![1.0; 4]));

        let mut zero_count = bytes.clone();
        zero_count[11..13].copy_from_slice(&0i16.to_le_bytes());
        assert!(codec.decode(&zero_count).is_err());

        let mut negative_count = bytes.clone();
        negative_count[11..13].copy_from_slice(&(-4i16).to_le_bytes());
        assert!(codec.decode(&negative_count).is_err());

        bytes[9..11].copy_from_slice(&0i16.to_le_bytes());
        assert!(codec.decode(&bytes).is_err());
    }

    #[test]
    fn test_sample_time() {
        let b = block(vec![0.0; 3]);
        assert_eq!(b.sample_time(0), 1_700_000_000_000.0);
        assert_eq!(b.sample_time(2), 1_700_000_000_008.0);
    }
}
