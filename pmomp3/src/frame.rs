//! MPEG-1 Layer III frame header codec.
//!
//! Only the MPEG-1 / Layer III combination is recognised: the sync byte `0xFF`
//! must be followed by `0xFA` (CRC protected) or `0xFB` (unprotected). Every
//! frame carries 1152 samples, so its duration only depends on the sample rate.
//!
//! ```text
//! byte 0   byte 1   byte 2              byte 3
//! 11111111 1111101P BBBBSSpX            channel mode / flags
//!                 │ │   │ │└ private bit (ad marker)
//!                 │ │   │ └─ padding
//!                 │ │   └─── sample rate index
//!                 │ └─────── bitrate index
//!                 └───────── protection bit (0 = CRC present)
//! ```

use crate::error::Mp3Error;

/// Number of PCM samples encoded by one MPEG-1 Layer III frame.
pub const SAMPLES_PER_FRAME: u32 = 1152;

/// Size of a frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// MPEG-1 Layer III bitrates in kbps, indexed by the high nibble of byte 2.
/// Index 0 is the free format, which is not supported.
pub const BITRATES_KBPS: [u16; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];

/// MPEG-1 sample rates in Hz, indexed by bits 2–3 of byte 2.
pub const SAMPLE_RATES_HZ: [u32; 3] = [44_100, 48_000, 32_000];

const SYNC_BYTE: u8 = 0xFF;
const LAYER3_PROTECTED: u8 = 0xFA;
const LAYER3_UNPROTECTED: u8 = 0xFB;
const PADDING_MASK: u8 = 0x02;
const PRIVATE_MASK: u8 = 0x01;

/// Cheap pre-filter: true when the 4 bytes start with the MPEG-1 Layer III sync.
pub fn is_header(bytes: &[u8; HEADER_LEN]) -> bool {
    bytes[0] == SYNC_BYTE && (bytes[1] == LAYER3_PROTECTED || bytes[1] == LAYER3_UNPROTECTED)
}

/// Sets or clears the private bit of a raw header in place.
///
/// The private bit marks frames that come from inserted ad audio.
pub fn set_private_bit(bytes: &mut [u8; HEADER_LEN], marked: bool) {
    if marked {
        bytes[2] |= PRIVATE_MASK;
    } else {
        bytes[2] &= !PRIVATE_MASK;
    }
}

/// Decoded MPEG-1 Layer III frame header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// A 16-bit CRC follows the header.
    pub protection_present: bool,
    pub private_bit: bool,
    pub padding_present: bool,
    pub bitrate_kbps: u16,
    pub sample_rate_hz: u32,
    /// Bytes following the 4-byte header, CRC included.
    pub payload_bytes: usize,
}

impl FrameHeader {
    /// Decodes a header.
    ///
    /// Fails with [`Mp3Error::Format`] when the sync pattern is wrong or the
    /// bitrate / sample rate indexes do not map to a defined value.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, Mp3Error> {
        if !is_header(bytes) {
            return Err(Mp3Error::Format(format!(
                "no MPEG-1 Layer III sync in {:02X} {:02X}",
                bytes[0], bytes[1]
            )));
        }

        let protection_present = bytes[1] & 0x01 == 0;

        let bitrate_index = (bytes[2] >> 4) as usize;
        let bitrate_kbps = match BITRATES_KBPS.get(bitrate_index) {
            Some(&kbps) if kbps != 0 => kbps,
            _ => {
                return Err(Mp3Error::Format(format!(
                    "undefined bitrate index {bitrate_index}"
                )));
            }
        };

        let rate_index = ((bytes[2] >> 2) & 0x03) as usize;
        let sample_rate_hz = *SAMPLE_RATES_HZ.get(rate_index).ok_or_else(|| {
            Mp3Error::Format(format!("undefined sample rate index {rate_index}"))
        })?;

        let padding_present = bytes[2] & PADDING_MASK != 0;
        let private_bit = bytes[2] & PRIVATE_MASK != 0;

        Ok(Self {
            protection_present,
            private_bit,
            padding_present,
            bitrate_kbps,
            sample_rate_hz,
            payload_bytes: payload_len(bitrate_kbps, sample_rate_hz, padding_present, protection_present),
        })
    }

    /// Builds the 4 header bytes for a known combination.
    ///
    /// The channel mode byte is left at zero (stereo, no emphasis).
    pub fn encode(
        bitrate_kbps: u16,
        sample_rate_hz: u32,
        padding: bool,
        protected: bool,
        private: bool,
    ) -> Result<[u8; HEADER_LEN], Mp3Error> {
        let bitrate_index = BITRATES_KBPS
            .iter()
            .position(|&kbps| kbps == bitrate_kbps && kbps != 0)
            .ok_or_else(|| Mp3Error::Format(format!("unsupported bitrate {bitrate_kbps} kbps")))?;
        let rate_index = SAMPLE_RATES_HZ
            .iter()
            .position(|&hz| hz == sample_rate_hz)
            .ok_or_else(|| Mp3Error::Format(format!("unsupported sample rate {sample_rate_hz} Hz")))?;

        let mut byte2 = ((bitrate_index as u8) << 4) | ((rate_index as u8) << 2);
        if padding {
            byte2 |= PADDING_MASK;
        }
        if private {
            byte2 |= PRIVATE_MASK;
        }

        let byte1 = if protected {
            LAYER3_PROTECTED
        } else {
            LAYER3_UNPROTECTED
        };

        Ok([SYNC_BYTE, byte1, byte2, 0x00])
    }

    /// Playback duration of the frame, independent of the bitrate.
    pub fn duration_ms(&self) -> f64 {
        1000.0 * SAMPLES_PER_FRAME as f64 / self.sample_rate_hz as f64
    }

    /// Total frame length, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_bytes
    }
}

// Rounds down; the encoder's padding bit absorbs the accumulated error.
fn payload_len(bitrate_kbps: u16, sample_rate_hz: u32, padding: bool, protected: bool) -> usize {
    let bits = SAMPLES_PER_FRAME as u64 * bitrate_kbps as u64 * 1000;
    let body = (bits / sample_rate_hz as u64 / 8) as usize;
    body + usize::from(padding) - HEADER_LEN + if protected { 2 } else { 0 }
}
