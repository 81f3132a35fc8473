//! 远程传输的字帧编解码
//!
//! 所有消息都是定长字数组（小端序）：
//!
//! ```text
//! 尺寸消息（i32 × 11）:
//!   [ctrl.disp, ctrl.vel, ctrl.accel, ctrl.force, ctrl.time,
//!    daq.disp,  daq.vel,  daq.accel,  daq.force,  daq.time, words]
//!
//! 请求帧（f64 × words）:
//!   [opcode, disp.., vel.., accel.., force.., time.., 0 ...]
//!
//! 应答帧（f64 × words）:
//!   [disp.., vel.., accel.., force.., time.., 0 ...]
//! ```
//!
//! 每个通道占用的字数由协商后的 [`SizeSpec`] 决定。

use crate::{Channel, ChannelSizes, Command, DaqResponse, ProtocolError, SizeSpec, TrialResponse};
use bytes::{Buf, BufMut, Bytes, BytesMut};

// ============================================================================
// Constants
// ============================================================================

/// 尺寸消息字数
pub const SIZE_MESSAGE_WORDS: usize = 2 * Channel::COUNT + 1;

/// 尺寸消息字节数（i32 字）
pub const SIZE_MESSAGE_BYTES: usize = SIZE_MESSAGE_WORDS * 4;

/// 数据帧每个字的字节数（f64 字）
pub const WORD_BYTES: usize = 8;

/// 单帧字数上限（512 KiB）
pub const MAX_FRAME_WORDS: usize = 1 << 16;

/// `words` 个字的数据帧字节数
pub fn frame_bytes(words: usize) -> usize {
    words * WORD_BYTES
}

// ============================================================================
// Size Message
// ============================================================================

/// 编码尺寸消息
pub fn encode_size_message(sizes: &SizeSpec, words: usize) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(SIZE_MESSAGE_BYTES);
    for size in sizes.ctrl.0.iter().chain(sizes.daq.0.iter()) {
        buf.put_i32_le(to_i32("size", *size)?);
    }
    buf.put_i32_le(to_i32("words", words)?);
    Ok(buf.freeze())
}

/// 解码尺寸消息，返回 `(SizeSpec, words)`
pub fn decode_size_message(mut buf: &[u8]) -> Result<(SizeSpec, usize), ProtocolError> {
    if buf.len() != SIZE_MESSAGE_BYTES {
        return Err(ProtocolError::InvalidLength {
            expected: SIZE_MESSAGE_BYTES,
            actual: buf.len(),
        });
    }

    let mut ctrl = ChannelSizes::default();
    let mut daq = ChannelSizes::default();
    for slot in ctrl.0.iter_mut().chain(daq.0.iter_mut()) {
        *slot = from_i32("size", buf.get_i32_le())?;
    }
    let words = from_i32("words", buf.get_i32_le())?;
    Ok((SizeSpec::new(ctrl, daq), words))
}

/// 校验对端尺寸消息里的帧字数
///
/// 必须能容纳 `sizes` 的全部通道，且不超过 [`MAX_FRAME_WORDS`]。
pub fn check_peer_words(sizes: &SizeSpec, words: usize) -> Result<usize, ProtocolError> {
    if words < sizes.payload_words(0) || words > MAX_FRAME_WORDS {
        return Err(ProtocolError::InvalidValue {
            field: "words",
            value: words as i64,
        });
    }
    Ok(words)
}

// ============================================================================
// Request Frame
// ============================================================================

/// 编码请求帧到 `buf`（覆盖原有内容）
///
/// 不携带负载的命令（或 `trial` 为 `None`）其数据区全部为零。
/// 控制侧协商了 force 但 `trial.force` 缺省时，force 区写零。
pub fn encode_request(
    command: Command,
    trial: Option<&TrialResponse>,
    sizes: &ChannelSizes,
    words: usize,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let required = 1 + sizes.total();
    if required > words {
        return Err(ProtocolError::PayloadTooSmall {
            required,
            available: words,
        });
    }
    if let Some(trial) = trial {
        trial.validate(sizes)?;
    }

    buf.clear();
    buf.reserve(frame_bytes(words));
    buf.put_f64_le(command.to_word());
    for channel in Channel::ALL {
        let n = sizes.get(channel);
        let values = trial.map(|t| t.channel(channel)).unwrap_or(&[]);
        put_channel(buf, values, n);
    }
    pad(buf, words - required);
    Ok(())
}

/// 解码请求帧
pub fn decode_request(
    mut buf: &[u8],
    sizes: &ChannelSizes,
    words: usize,
) -> Result<(Command, TrialResponse), ProtocolError> {
    check_frame_len(buf.len(), words)?;
    if 1 + sizes.total() > words {
        return Err(ProtocolError::PayloadTooSmall {
            required: 1 + sizes.total(),
            available: words,
        });
    }

    let command = Command::from_word(buf.get_f64_le())?;
    let disp = get_channel(&mut buf, sizes.get(Channel::Disp));
    let vel = get_channel(&mut buf, sizes.get(Channel::Vel));
    let accel = get_channel(&mut buf, sizes.get(Channel::Accel));
    let force = match sizes.get(Channel::Force) {
        0 => None,
        n => Some(get_channel(&mut buf, n)),
    };
    let time = get_channel(&mut buf, sizes.get(Channel::Time));

    Ok((
        command,
        TrialResponse {
            disp,
            vel,
            accel,
            force,
            time,
        },
    ))
}

// ============================================================================
// Reply Frame
// ============================================================================

/// 编码应答帧到 `buf`（覆盖原有内容）
pub fn encode_reply(
    daq: &DaqResponse,
    sizes: &ChannelSizes,
    words: usize,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let required = sizes.total();
    if required > words {
        return Err(ProtocolError::PayloadTooSmall {
            required,
            available: words,
        });
    }
    daq.validate(sizes)?;

    buf.clear();
    buf.reserve(frame_bytes(words));
    for channel in Channel::ALL {
        put_channel(buf, daq.channel(channel), sizes.get(channel));
    }
    pad(buf, words - required);
    Ok(())
}

/// 解码应答帧
pub fn decode_reply(
    mut buf: &[u8],
    sizes: &ChannelSizes,
    words: usize,
) -> Result<DaqResponse, ProtocolError> {
    check_frame_len(buf.len(), words)?;
    if sizes.total() > words {
        return Err(ProtocolError::PayloadTooSmall {
            required: sizes.total(),
            available: words,
        });
    }

    let mut daq = DaqResponse::default();
    for channel in Channel::ALL {
        *daq.channel_mut(channel) = get_channel(&mut buf, sizes.get(channel));
    }
    Ok(daq)
}

// ============================================================================
// Helpers
// ============================================================================

fn put_channel(buf: &mut BytesMut, values: &[f64], n: usize) {
    for i in 0..n {
        buf.put_f64_le(values.get(i).copied().unwrap_or(0.0));
    }
}

fn get_channel(buf: &mut &[u8], n: usize) -> Vec<f64> {
    (0..n).map(|_| buf.get_f64_le()).collect()
}

fn pad(buf: &mut BytesMut, words: usize) {
    buf.put_bytes(0, words * WORD_BYTES);
}

fn check_frame_len(actual: usize, words: usize) -> Result<(), ProtocolError> {
    let expected = frame_bytes(words);
    if actual != expected {
        return Err(ProtocolError::InvalidLength { expected, actual });
    }
    Ok(())
}

fn to_i32(field: &'static str, value: usize) -> Result<i32, ProtocolError> {
    i32::try_from(value).map_err(|_| ProtocolError::InvalidValue {
        field,
        value: value as i64,
    })
}

fn from_i32(field: &'static str, value: i32) -> Result<usize, ProtocolError> {
    usize::try_from(value).map_err(|_| ProtocolError::InvalidValue {
        field,
        value: i64::from(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_of(buf: &[u8]) -> Vec<f64> {
        buf.chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_size_message_layout() {
        let sizes = SizeSpec::for_dof(6);
        let encoded = encode_size_message(&sizes, 25).unwrap();
        assert_eq!(encoded.len(), SIZE_MESSAGE_BYTES);

        let ints: Vec<i32> = encoded
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(ints, vec![6, 6, 6, 0, 1, 6, 6, 6, 6, 1, 25]);

        let (decoded, words) = decode_size_message(&encoded).unwrap();
        assert_eq!(decoded, sizes);
        assert_eq!(words, 25);
    }

    #[test]
    fn test_size_message_rejects_negative() {
        let mut buf = BytesMut::new();
        for _ in 0..10 {
            buf.put_i32_le(1);
        }
        buf.put_i32_le(-3);
        assert!(matches!(
            decode_size_message(&buf),
            Err(ProtocolError::InvalidValue { field: "words", .. })
        ));
        assert!(decode_size_message(&buf[..8]).is_err());
    }

    #[test]
    fn test_peer_words_bounds() {
        let sizes = SizeSpec::for_dof(6);
        assert_eq!(check_peer_words(&sizes, 25).unwrap(), 25);
        assert_eq!(check_peer_words(&sizes, 64).unwrap(), 64);
        assert_eq!(check_peer_words(&sizes, MAX_FRAME_WORDS).unwrap(), MAX_FRAME_WORDS);
        for words in [0, 24, MAX_FRAME_WORDS + 1, i32::MAX as usize] {
            assert!(matches!(
                check_peer_words(&sizes, words),
                Err(ProtocolError::InvalidValue { field: "words", .. })
            ));
        }
    }

    /// numDOF=6，disp=[0.01,0,..]，time=1.0
    #[test]
    fn test_request_layout_set_trial() {
        let sizes = SizeSpec::for_dof(6);
        let words = sizes.payload_words(0);
        let mut disp = vec![0.0; 6];
        disp[0] = 0.01;
        let trial = TrialResponse::new(disp, vec![0.0; 6], vec![0.0; 6], vec![1.0]);

        let mut buf = BytesMut::new();
        encode_request(Command::SetTrialResponse, Some(&trial), &sizes.ctrl, words, &mut buf)
            .unwrap();
        assert_eq!(buf.len(), frame_bytes(words));

        let w = words_of(&buf);
        assert_eq!(w[0], 3.0);
        assert_eq!(w[1], 0.01);
        assert!(w[2..=18].iter().all(|v| *v == 0.0));
        // time 紧跟在 disp/vel/accel 之后
        assert_eq!(w[3 * 6 + 1], 1.0);
        assert!(w[20..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_request_without_payload_is_zeroed() {
        let sizes = SizeSpec::for_dof(2);
        let mut buf = BytesMut::new();
        encode_request(Command::Die, None, &sizes.ctrl, 9, &mut buf).unwrap();
        let w = words_of(&buf);
        assert_eq!(w[0], 99.0);
        assert!(w[1..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_request_decode_restores_trial() {
        let sizes = ChannelSizes::new(2, 2, 2, 2, 1);
        let trial = TrialResponse::new(vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0], vec![7.0])
            .with_force(vec![8.0, 9.0]);
        let mut buf = BytesMut::new();
        encode_request(Command::SetTrialResponse, Some(&trial), &sizes, 12, &mut buf).unwrap();

        let (command, decoded) = decode_request(&buf, &sizes, 12).unwrap();
        assert_eq!(command, Command::SetTrialResponse);
        assert_eq!(decoded, trial);
    }

    #[test]
    fn test_request_too_small() {
        let sizes = SizeSpec::for_dof(4);
        let mut buf = BytesMut::new();
        let err = encode_request(Command::Setup, None, &sizes.ctrl, 5, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PayloadTooSmall {
                required: 14,
                available: 5
            }
        ));
    }

    #[test]
    fn test_reply_layout_and_decode() {
        let sizes = SizeSpec::for_dof(2);
        let words = sizes.payload_words(0);
        let daq = DaqResponse {
            disp: vec![0.1, 0.2],
            vel: vec![0.3, 0.4],
            accel: vec![0.5, 0.6],
            force: vec![100.0, -50.0],
            time: vec![2.5],
        };
        let mut buf = BytesMut::new();
        encode_reply(&daq, &sizes.daq, words, &mut buf).unwrap();

        let w = words_of(&buf);
        assert_eq!(w[0], 0.1);
        assert_eq!(w[6], 100.0);
        assert_eq!(w[8], 2.5);

        assert_eq!(decode_reply(&buf, &sizes.daq, words).unwrap(), daq);
    }

    #[test]
    fn test_reply_length_mismatch() {
        let sizes = SizeSpec::for_dof(2);
        let buf = vec![0u8; frame_bytes(9) - 3];
        assert!(matches!(
            decode_reply(&buf, &sizes.daq, 9),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }
}
