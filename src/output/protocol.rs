use serde::{Deserialize, Serialize};

use crate::error::ProtocolViolation;

/// Width of the pattern trigger payload, in channels.
pub const PATTERN_CHANNELS: usize = 16;

/// Longest acknowledgment line accepted before the buffer is discarded.
pub const MAX_ACK_LEN: usize = 256;

/// Byte sent to switch the actuator off.
///
/// Firmware builds disagree: `A` is what current units expect, `b` is kept for
/// older boards that still use it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeactivateCode {
    #[default]
    UpperA,
    LowerB,
}

impl DeactivateCode {
    pub fn byte(self) -> u8 {
        match self {
            DeactivateCode::UpperA => b'A',
            DeactivateCode::LowerB => b'b',
        }
    }
}

/// One write to the actuator. Every command is encoded into a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Activate,
    Deactivate(DeactivateCode),
    Enable,
    Disable,
    SetDuration(u32),
    Pattern([u8; 2]),
}

impl ActuatorCommand {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            ActuatorCommand::Activate => vec![b'a'],
            ActuatorCommand::Deactivate(code) => vec![code.byte()],
            ActuatorCommand::Enable => vec![b'e'],
            ActuatorCommand::Disable => vec![b'E'],
            ActuatorCommand::SetDuration(ms) => format!("d{}", ms).into_bytes(),
            ActuatorCommand::Pattern(mask) => vec![b'p', mask[0], mask[1]],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActuatorCommand::Activate => "activate",
            ActuatorCommand::Deactivate(_) => "deactivate",
            ActuatorCommand::Enable => "enable",
            ActuatorCommand::Disable => "disable",
            ActuatorCommand::SetDuration(_) => "set_duration",
            ActuatorCommand::Pattern(_) => "pattern",
        }
    }
}

/// Packs channel flags MSB-first: channel 0 is bit 7 of the first byte.
///
/// Flags past the sixteenth are ignored; missing flags count as off.
pub fn pack_pattern(flags: &[bool]) -> [u8; 2] {
    let mut mask = [0u8; 2];
    for (i, _) in flags
        .iter()
        .take(PATTERN_CHANNELS)
        .enumerate()
        .filter(|(_, on)| **on)
    {
        mask[i / 8] |= 0x80 >> (i % 8);
    }
    mask
}

// ACK READER ------------------------------------------------------------------

/// Splits bytes read back from the device into newline-terminated lines.
#[derive(Debug, Default)]
pub struct AckReader {
    pending: Vec<u8>,
}

impl AckReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ProtocolViolation>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.is_empty() {
                    continue;
                }
                lines.push(match String::from_utf8(line) {
                    Ok(text) if text.is_ascii() => Ok(text),
                    Ok(text) => Err(ProtocolViolation::NonAscii(text.into_bytes())),
                    Err(err) => Err(ProtocolViolation::NonAscii(err.into_bytes())),
                });
                continue;
            }

            self.pending.push(byte);
            if self.pending.len() > MAX_ACK_LEN {
                self.pending.clear();
                lines.push(Err(ProtocolViolation::Oversized(MAX_ACK_LEN)));
            }
        }
        lines
    }

    /// Bytes of an incomplete line still waiting for a newline.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(ActuatorCommand::Activate.encode(), b"a");
        assert_eq!(
            ActuatorCommand::Deactivate(DeactivateCode::UpperA).encode(),
            b"A"
        );
        assert_eq!(
            ActuatorCommand::Deactivate(DeactivateCode::LowerB).encode(),
            b"b"
        );
        assert_eq!(ActuatorCommand::Enable.encode(), b"e");
        assert_eq!(ActuatorCommand::Disable.encode(), b"E");
        assert_eq!(ActuatorCommand::SetDuration(500).encode(), b"d500");
        assert_eq!(ActuatorCommand::SetDuration(0).encode(), b"d0");
        assert_eq!(
            ActuatorCommand::Pattern([0x81, 0x01]).encode(),
            vec![b'p', 0x81, 0x01]
        );
    }

    #[test]
    fn test_pack_pattern_bit_order() {
        let mut flags = [false; 16];
        flags[0] = true;
        flags[7] = true;
        flags[9] = true;
        assert_eq!(pack_pattern(&flags), [0x81, 0x40]);
        assert_eq!(pack_pattern(&[true, true]), [0xC0, 0x00]);
        assert_eq!(pack_pattern(&[]), [0x00, 0x00]);
    }

    #[test]
    fn test_pack_pattern_truncates_seventeen_channels() {
        let flags = [true; 17];
        assert_eq!(pack_pattern(&flags), [0xFF, 0xFF]);

        let mut only_extra = [false; 17];
        only_extra[16] = true;
        assert_eq!(pack_pattern(&only_extra), [0x00, 0x00]);
    }

    #[test]
    fn test_ack_reader_splits_lines_across_reads() {
        let mut reader = AckReader::new();
        assert!(reader.push(b"OK a").is_empty());
        assert_eq!(reader.pending(), 4);
        let lines = reader.push(b"\r\nOK d500\n\nOK");
        assert_eq!(
            lines,
            vec![Ok("OK a".to_string()), Ok("OK d500".to_string())]
        );
        assert_eq!(reader.pending(), 2);
    }

    #[test]
    fn test_ack_reader_flags_malformed_lines() {
        let mut reader = AckReader::new();
        let lines = reader.push(&[0xFF, b'x', b'\n', b'o', b'k', b'\n']);
        assert_eq!(lines[0], Err(ProtocolViolation::NonAscii(vec![0xFF, b'x'])));
        assert_eq!(lines[1], Ok("ok".to_string()));

        let flood = vec![b'x'; MAX_ACK_LEN + 1];
        let lines = reader.push(&flood);
        assert_eq!(lines, vec![Err(ProtocolViolation::Oversized(MAX_ACK_LEN))]);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn test_deactivate_code_yaml_names() {
        let code: DeactivateCode = serde_yaml::from_str("lower_b").unwrap();
        assert_eq!(code, DeactivateCode::LowerB);
        assert_eq!(DeactivateCode::default().byte(), b'A');
    }
}
