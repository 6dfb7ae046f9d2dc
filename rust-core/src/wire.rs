//! Binary Wire Format for Zero-Copy Trajectory Exchange
//!
//! Compact framing for pose estimates handed to behavioral inference.
//!
//! Design principles:
//! - **Zero-copy reads**: Consumer can read directly from buffer
//! - **Fixed-size headers**: O(1) to find any field
//! - **No allocations**: Write into pre-allocated buffers
//! - **Little-endian**: Native for ARM and x86
//!
//! # Message Types
//!
//! | Type ID | Name | Size | Description |
//! |---------|------|------|-------------|
//! | 0x01 | PoseEstimate | 144 bytes | One trajectory tick |
//! | 0x02 | SessionSummary | 48 bytes | End-of-session counts |
//!
//! # Header Format (8 bytes)
//!
//! ```text
//! ┌────────┬────────┬────────────────┬────────────────┐
//! │ Magic  │ Type   │ Reserved       │ Payload Length │
//! │ 2 bytes│ 1 byte │ 1 byte         │ 4 bytes        │
//! └────────┴────────┴────────────────┴────────────────┘
//! ```

use crate::types::{EstimateKind, PoseEstimate, POSE_DOF};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Magic bytes for message validation: "VT" (0x5456)
pub const WIRE_MAGIC: u16 = 0x5456;

/// Wire format version
pub const WIRE_VERSION: u8 = 1;

/// Upper-triangular entries of the 6×6 pose covariance.
const COVARIANCE_ENTRIES: usize = POSE_DOF * (POSE_DOF + 1) / 2;

/// Message type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PoseEstimate = 0x01,
    SessionSummary = 0x02,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(MessageType::PoseEstimate),
            0x02 => Some(MessageType::SessionSummary),
            _ => None,
        }
    }
}

// ============================================================================
// WIRE HEADER (8 bytes, fixed)
// ============================================================================

/// Message header - fixed 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub magic: u16,
    pub msg_type: u8,
    /// Carries [`WIRE_VERSION`]
    pub version: u8,
    /// Payload length in bytes (excludes header)
    pub payload_len: u32,
}

impl WireHeader {
    pub const SIZE: usize = 8;

    #[inline]
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: WIRE_MAGIC,
            msg_type: msg_type as u8,
            version: WIRE_VERSION,
            payload_len,
        }
    }

    /// Write header to buffer. Returns bytes written (always 8).
    #[inline]
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        if buf.len() < Self::SIZE {
            return 0;
        }
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2] = self.msg_type;
        buf[3] = self.version;
        buf[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        Self::SIZE
    }

    /// Read header from buffer.
    #[inline]
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let magic = u16::from_le_bytes([buf[0], buf[1]]);
        if magic != WIRE_MAGIC {
            return None;
        }
        Some(Self {
            magic,
            msg_type: buf[2],
            version: buf[3],
            payload_len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }
}

#[inline]
fn put_f32(buf: &mut [u8], offset: usize, value: f64) {
    buf[offset..offset + 4].copy_from_slice(&(value as f32).to_le_bytes());
}

#[inline]
fn get_f32(buf: &[u8], offset: usize) -> f64 {
    f32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]) as f64
}

#[inline]
fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

// ============================================================================
// POSE ESTIMATE (144 bytes payload)
// ============================================================================

/// Pose estimate wire format - 144 bytes.
///
/// ```text
/// 0..8     timestamp_us      u64
/// 8        flags             bit 0 fused, bit 1 low confidence, bit 2 recalibrated
/// 9        fused count       u8 (saturating)
/// 10       rejected count    u8 (saturating)
/// 11       padding
/// 12..36   pose              6 × f32
/// 36..60   velocity          6 × f32
/// 60..144  covariance        21 × f32, upper triangle row-major
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WirePose {
    pub timestamp_us: u64,
    pub flags: u8,
    pub fused: u8,
    pub rejected: u8,
    pub pose: [f32; POSE_DOF],
    pub velocity: [f32; POSE_DOF],
    pub covariance: [f32; COVARIANCE_ENTRIES],
}

impl WirePose {
    pub const SIZE: usize = 144;

    pub const FLAG_FUSED: u8 = 1;
    pub const FLAG_LOW_CONFIDENCE: u8 = 2;
    pub const FLAG_RECALIBRATED: u8 = 4;

    const POSE_AT: usize = 12;
    const VELOCITY_AT: usize = 36;
    const COVARIANCE_AT: usize = 60;

    pub fn from_estimate(estimate: &PoseEstimate) -> Self {
        let mut flags = 0;
        if estimate.kind == EstimateKind::Fused {
            flags |= Self::FLAG_FUSED;
        }
        if estimate.low_confidence {
            flags |= Self::FLAG_LOW_CONFIDENCE;
        }
        if estimate.recalibrated {
            flags |= Self::FLAG_RECALIBRATED;
        }

        let mut covariance = [0f32; COVARIANCE_ENTRIES];
        let mut k = 0;
        for i in 0..POSE_DOF {
            for j in i..POSE_DOF {
                covariance[k] = estimate.covariance[i][j] as f32;
                k += 1;
            }
        }

        Self {
            timestamp_us: estimate.timestamp_us,
            flags,
            fused: estimate.fused_observations.min(255) as u8,
            rejected: estimate.rejected_observations.min(255) as u8,
            pose: estimate.pose.map(|v| v as f32),
            velocity: estimate.velocity.map(|v| v as f32),
            covariance,
        }
    }

    /// Write to buffer. Returns bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        if buf.len() < Self::SIZE {
            return 0;
        }
        buf[0..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[8] = self.flags;
        buf[9] = self.fused;
        buf[10] = self.rejected;
        buf[11] = 0;
        for i in 0..POSE_DOF {
            put_f32(buf, Self::POSE_AT + 4 * i, self.pose[i] as f64);
            put_f32(buf, Self::VELOCITY_AT + 4 * i, self.velocity[i] as f64);
        }
        for (k, value) in self.covariance.iter().enumerate() {
            put_f32(buf, Self::COVARIANCE_AT + 4 * k, *value as f64);
        }
        Self::SIZE
    }

    /// Read from buffer.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            timestamp_us: get_u64(buf, 0),
            flags: buf[8],
            fused: buf[9],
            rejected: buf[10],
            pose: std::array::from_fn(|i| get_f32(buf, Self::POSE_AT + 4 * i) as f32),
            velocity: std::array::from_fn(|i| get_f32(buf, Self::VELOCITY_AT + 4 * i) as f32),
            covariance: std::array::from_fn(|k| get_f32(buf, Self::COVARIANCE_AT + 4 * k) as f32),
        })
    }

    #[inline]
    pub fn is_fused(&self) -> bool {
        self.flags & Self::FLAG_FUSED != 0
    }

    #[inline]
    pub fn low_confidence(&self) -> bool {
        self.flags & Self::FLAG_LOW_CONFIDENCE != 0
    }

    #[inline]
    pub fn recalibrated(&self) -> bool {
        self.flags & Self::FLAG_RECALIBRATED != 0
    }

    /// Full symmetric covariance rebuilt from the upper triangle.
    pub fn covariance_matrix(&self) -> [[f64; POSE_DOF]; POSE_DOF] {
        let mut m = [[0.0; POSE_DOF]; POSE_DOF];
        let mut k = 0;
        for i in 0..POSE_DOF {
            for j in i..POSE_DOF {
                m[i][j] = self.covariance[k] as f64;
                m[j][i] = self.covariance[k] as f64;
                k += 1;
            }
        }
        m
    }
}

// ============================================================================
// SESSION SUMMARY (48 bytes payload)
// ============================================================================

/// End-of-session summary wire format - 48 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireSessionSummary {
    /// First sample timestamp (µs)
    pub start_us: u64,              // 8 bytes
    /// Last sample timestamp (µs)
    pub end_us: u64,                // 8 bytes
    pub estimates: u32,             // 4 bytes
    pub events: u32,                // 4 bytes
    pub idle_gaps: u32,             // 4 bytes
    pub unclassified: u32,          // 4 bytes
    pub rejected_observations: u32, // 4 bytes
    /// Estimates evicted by a lossy sink
    pub dropped: u32,               // 4 bytes
    pub recalibrations: u16,        // 2 bytes
    /// Bit 0 = cancelled
    pub flags: u8,                  // 1 byte
}                                   // + 5 reserved = 48 bytes

impl WireSessionSummary {
    pub const SIZE: usize = 48;
    pub const FLAG_CANCELLED: u8 = 1;

    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        if buf.len() < Self::SIZE {
            return 0;
        }
        buf[0..8].copy_from_slice(&self.start_us.to_le_bytes());
        buf[8..16].copy_from_slice(&self.end_us.to_le_bytes());
        buf[16..20].copy_from_slice(&self.estimates.to_le_bytes());
        buf[20..24].copy_from_slice(&self.events.to_le_bytes());
        buf[24..28].copy_from_slice(&self.idle_gaps.to_le_bytes());
        buf[28..32].copy_from_slice(&self.unclassified.to_le_bytes());
        buf[32..36].copy_from_slice(&self.rejected_observations.to_le_bytes());
        buf[36..40].copy_from_slice(&self.dropped.to_le_bytes());
        buf[40..42].copy_from_slice(&self.recalibrations.to_le_bytes());
        buf[42] = self.flags;
        buf[43..48].copy_from_slice(&[0u8; 5]);
        Self::SIZE
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            start_us: get_u64(buf, 0),
            end_us: get_u64(buf, 8),
            estimates: get_u32(buf, 16),
            events: get_u32(buf, 20),
            idle_gaps: get_u32(buf, 24),
            unclassified: get_u32(buf, 28),
            rejected_observations: get_u32(buf, 32),
            dropped: get_u32(buf, 36),
            recalibrations: u16::from_le_bytes([buf[40], buf[41]]),
            flags: buf[42],
        })
    }

    #[inline]
    pub fn cancelled(&self) -> bool {
        self.flags & Self::FLAG_CANCELLED != 0
    }
}

// ============================================================================
// WIRE WRITER (zero-allocation streaming)
// ============================================================================

/// Pre-allocated buffer writer for streaming wire messages.
///
/// Designed for ring buffer / shared memory scenarios where
/// the buffer is pre-allocated and reused.
pub struct WireWriter {
    buffer: Vec<u8>,
    position: usize,
    sequence: u64,
}

impl WireWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            position: 0,
            sequence: 0,
        }
    }

    /// Reset writer position to beginning.
    #[inline]
    pub fn reset(&mut self) {
        self.position = 0;
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get buffer slice up to current position.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.position]
    }

    /// Messages written over the writer's lifetime.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Write one pose estimate. Returns false when the buffer is full.
    pub fn write_estimate(&mut self, estimate: &PoseEstimate) -> bool {
        let needed = WireHeader::SIZE + WirePose::SIZE;
        if self.position + needed > self.buffer.len() {
            return false;
        }

        let header = WireHeader::new(MessageType::PoseEstimate, WirePose::SIZE as u32);
        let pose = WirePose::from_estimate(estimate);

        self.position += header.write_to(&mut self.buffer[self.position..]);
        self.position += pose.write_to(&mut self.buffer[self.position..]);
        self.sequence += 1;
        true
    }

    /// Write session summary. Returns false when the buffer is full.
    pub fn write_session_summary(&mut self, summary: &WireSessionSummary) -> bool {
        let needed = WireHeader::SIZE + WireSessionSummary::SIZE;
        if self.position + needed > self.buffer.len() {
            return false;
        }

        let header = WireHeader::new(MessageType::SessionSummary, WireSessionSummary::SIZE as u32);

        self.position += header.write_to(&mut self.buffer[self.position..]);
        self.position += summary.write_to(&mut self.buffer[self.position..]);
        self.sequence += 1;
        true
    }
}

// ============================================================================
// WIRE READER
// ============================================================================

/// One decoded frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireMessage {
    Pose(WirePose),
    Summary(WireSessionSummary),
}

/// Decodes frames straight out of a byte buffer.
///
/// Iteration ends at the end of the buffer or at the first frame that is
/// torn, has a bad magic or an unknown type, or fails to decode. The cursor
/// stays on that frame, so [`consumed_all`](WireReader::consumed_all) tells
/// a clean end from a damaged tail.
pub struct WireReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    /// Type and payload of the next frame, advancing past it.
    pub fn next_message(&mut self) -> Option<(MessageType, &'a [u8])> {
        let (msg_type, payload, end) = self.frame()?;
        self.position = end;
        Some((msg_type, payload))
    }

    /// True once every byte has been read as part of a whole frame.
    pub fn consumed_all(&self) -> bool {
        self.position == self.buffer.len()
    }

    fn frame(&self) -> Option<(MessageType, &'a [u8], usize)> {
        let rest = self.buffer.get(self.position..)?;
        let header = WireHeader::read_from(rest)?;
        let msg_type = header.message_type()?;
        let start = self.position + WireHeader::SIZE;
        let end = start.checked_add(header.payload_len as usize)?;
        let payload = self.buffer.get(start..end)?;
        Some((msg_type, payload, end))
    }
}

impl Iterator for WireReader<'_> {
    type Item = WireMessage;

    fn next(&mut self) -> Option<WireMessage> {
        let (msg_type, payload, end) = self.frame()?;
        let message = match msg_type {
            MessageType::PoseEstimate => WireMessage::Pose(WirePose::read_from(payload)?),
            MessageType::SessionSummary => {
                WireMessage::Summary(WireSessionSummary::read_from(payload)?)
            }
        };
        self.position = end;
        Some(message)
    }
}

// ============================================================================
// TESTS
// ============================================================================
