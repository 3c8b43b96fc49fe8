//! Vendor stream cipher.
//!
//! Both the NFC memory image and the BLE payload are XORed with a keystream
//! produced by a small 16-bit feedback cipher keyed by a static table and the
//! sensor UID. The same primitive also signs the custom NFC commands and builds
//! the 12-byte challenge that unlocks BLE streaming.
//!
//! # Keystream
//!
//! [`process_crypto`] maps four 16-bit words to four new words through eight
//! shift+XOR rounds. Inputs are prepared from the UID, a per-use `x` (block
//! number or command code) and a per-use `y` (patch-info derived argument or
//! the frame nonce). Each output word contributes two keystream bytes,
//! little-endian.
//!
//! All functions here are pure and total: integrity failures are reported by
//! the callers that check a CRC, never by the keystream itself.

use crate::crc::{crc16, has_valid_crc16_trailer};
use crate::error::{FrameError, Result};
use crate::sensor::{MemoryCipher, SensorIdentity, SensorUid};

/// Static key table.
pub const KEY: [u16; 4] = [0xA0C5, 0x6860, 0x0000, 0x14C6];

/// `y` argument used to sign the activation command and to key BLE frames.
pub const ACTIVATE_ARGUMENT: u16 = 0x1B6A;

/// Argument for header and footer blocks of US 14-day images.
const US14_FIXED_ARGUMENT: u16 = 0xCADC;

/// Mask applied to the patch info tail for Libre 2 images.
const LIBRE2_ARGUMENT_MASK: u16 = 0x0044;

/// Constant mixed into the fourth word of [`prepare_variables`].
const PREPARE_CONSTANT: u16 = 0x241A;

/// Salts applied to the first two keystream words by [`command_key`].
const COMMAND_KEY_SALT: [u16; 2] = [0x4163, 0x4344];

/// Prefix hashed with the first challenge word when building the unlock payload.
const UNLOCK_PREFIX: [u8; 8] = [0xC1, 0xC4, 0xC3, 0xC0, 0xD4, 0xE1, 0xE7, 0xBA];

/// Encrypted BLE payload: 2-byte clear nonce followed by the ciphertext.
pub const STREAM_PAYLOAD_LEN: usize = 46;

/// Decrypted BLE frame, CRC trailer included.
pub const STREAM_FRAME_LEN: usize = 44;

/// Bytes of a decrypted frame covered by its CRC.
pub const STREAM_FRAME_CRC_OFFSET: usize = 42;

/// Vendor sub-commands carried inside custom command 0xA1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Subcommand {
    Activate = 0x1B,
    EnableStreaming = 0x1E,
}

impl Subcommand {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One feedback step: shift right by two, folding the dropped bits back in.
fn feedback(value: u16) -> u16 {
    let mut result = value >> 2;
    if value & 1 != 0 {
        result ^= KEY[1];
    }
    if value & 2 != 0 {
        result ^= KEY[0];
    }
    result
}

/// Run the eight-round cipher over four input words.
pub fn process_crypto(input: [u16; 4]) -> [u16; 4] {
    let r0 = feedback(input[0]) ^ input[3];
    let r1 = feedback(r0) ^ input[2];
    let r2 = feedback(r1) ^ input[1];
    let r3 = feedback(r2) ^ input[0];
    let r4 = feedback(r3);
    let r5 = feedback(r4 ^ r0);
    let r6 = feedback(r5 ^ r1);
    let r7 = feedback(r6 ^ r2);

    [r3 ^ r7, r2 ^ r6, r1 ^ r5, r0 ^ r4]
}

/// Cipher input for memory blocks, command signatures and BLE frames.
pub fn prepare_variables(uid: &SensorUid, x: u16, y: u16) -> [u16; 4] {
    [
        uid.word(4).wrapping_add(x).wrapping_add(y),
        uid.word(2).wrapping_add(KEY[2]),
        uid.word(0).wrapping_add(x.wrapping_mul(2)),
        PREPARE_CONSTANT ^ KEY[3],
    ]
}

/// Cipher input for the two rounds of the streaming unlock challenge.
pub fn prepare_variables2(uid: &SensorUid, i1: u16, i2: u16, i3: u16, i4: u16) -> [u16; 4] {
    [
        uid.word(4).wrapping_add(i1),
        uid.word(2).wrapping_add(i2),
        uid.word(0).wrapping_add(i3).wrapping_add(KEY[2]),
        i4.wrapping_add(KEY[3]),
    ]
}

/// Four-byte signature derived from the first two keystream words.
///
/// Used to sign custom NFC commands and as the seed of the unlock challenge.
pub fn command_key(uid: &SensorUid, x: u16, y: u16) -> [u8; 4] {
    let words = process_crypto(prepare_variables(uid, x, y));
    let low = (words[0] ^ COMMAND_KEY_SALT[0]).to_le_bytes();
    let high = (words[1] ^ COMMAND_KEY_SALT[1]).to_le_bytes();
    [low[0], low[1], high[0], high[1]]
}

fn words_to_bytes(words: [u16; 4]) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Keystream for one 8-byte memory block.
pub fn block_keystream(identity: &SensorIdentity, cipher: MemoryCipher, block: usize) -> [u8; 8] {
    let tail = identity.patch_info.tail_word();
    let y = match cipher {
        MemoryCipher::Plain => return [0; 8],
        MemoryCipher::Libre2 => tail ^ LIBRE2_ARGUMENT_MASK,
        MemoryCipher::Us14Day if block < 3 || block >= 40 => US14_FIXED_ARGUMENT,
        MemoryCipher::Us14Day => tail,
    };
    words_to_bytes(process_crypto(prepare_variables(&identity.uid, block as u16, y)))
}

/// XOR a memory image with its per-block keystream, in place.
///
/// The operation is its own inverse, so it both encrypts and decrypts. Any
/// trailing partial block is left untouched.
pub fn xor_memory_image(identity: &SensorIdentity, cipher: MemoryCipher, data: &mut [u8]) {
    for (block, chunk) in data.chunks_exact_mut(8).enumerate() {
        let key = block_keystream(identity, cipher, block);
        for (byte, k) in chunk.iter_mut().zip(key) {
            *byte ^= k;
        }
    }
}

/// Keystream covering a whole BLE frame for the given nonce.
pub fn frame_keystream(uid: &SensorUid, nonce: u16) -> [u8; 64] {
    let seed = command_key(uid, u16::from(Subcommand::Activate.code()), ACTIVATE_ARGUMENT);
    let x = (u16::from_le_bytes([seed[0], seed[1]]) ^ u16::from_le_bytes([seed[2], seed[3]])) | 0x63;
    let y = nonce ^ 0x63;

    let mut keystream = [0u8; 64];
    let mut words = process_crypto(prepare_variables(uid, x, y));
    for chunk in keystream.chunks_exact_mut(8) {
        chunk.copy_from_slice(&words_to_bytes(words));
        words = process_crypto(words);
    }
    keystream
}

/// Decrypt a 46-byte BLE payload and verify its CRC.
///
/// # Errors
/// - `FrameError::UndersizedBuffer` if `payload` is not exactly 46 bytes
/// - `FrameError::Crc` if the decrypted trailer does not match
pub fn decrypt_frame(uid: &SensorUid, payload: &[u8]) -> Result<[u8; STREAM_FRAME_LEN]> {
    if payload.len() != STREAM_PAYLOAD_LEN {
        return Err(FrameError::UndersizedBuffer {
            required: STREAM_PAYLOAD_LEN,
            actual: payload.len(),
        }
        .into());
    }

    let nonce = u16::from_le_bytes([payload[0], payload[1]]);
    let keystream = frame_keystream(uid, nonce);

    let mut frame = [0u8; STREAM_FRAME_LEN];
    for ((out, byte), k) in frame.iter_mut().zip(&payload[2..]).zip(keystream) {
        *out = byte ^ k;
    }

    if !has_valid_crc16_trailer(&frame) {
        return Err(FrameError::Crc {
            expected: u16::from_be_bytes([frame[STREAM_FRAME_CRC_OFFSET], frame[STREAM_FRAME_CRC_OFFSET + 1]]),
            actual: crc16(&frame[..STREAM_FRAME_CRC_OFFSET]),
        }
        .into());
    }

    Ok(frame)
}

/// Encrypt a decrypted frame (CRC trailer included) under `nonce`.
pub fn encrypt_frame(uid: &SensorUid, nonce: u16, frame: &[u8; STREAM_FRAME_LEN]) -> [u8; STREAM_PAYLOAD_LEN] {
    let keystream = frame_keystream(uid, nonce);

    let mut payload = [0u8; STREAM_PAYLOAD_LEN];
    payload[..2].copy_from_slice(&nonce.to_le_bytes());
    for ((out, byte), k) in payload[2..].iter_mut().zip(frame).zip(keystream) {
        *out = byte ^ k;
    }
    payload
}

/// Parameters of the activation sub-command: code followed by its signature.
pub fn activate_parameters(uid: &SensorUid) -> Vec<u8> {
    let code = Subcommand::Activate.code();
    let mut parameters = vec![code];
    parameters.extend_from_slice(&command_key(uid, u16::from(code), ACTIVATE_ARGUMENT));
    parameters
}

/// Parameters of the enable-streaming sub-command carrying a 32-bit unlock code.
pub fn enable_streaming_parameters(identity: &SensorIdentity, unlock_code: u32) -> Vec<u8> {
    let code = Subcommand::EnableStreaming.code();
    let code_bytes = unlock_code.to_le_bytes();
    let y = identity.patch_info.tail_word() ^ u16::from_le_bytes([code_bytes[0], code_bytes[1]]);

    let mut parameters = vec![code];
    parameters.extend_from_slice(&code_bytes);
    parameters.extend_from_slice(&command_key(&identity.uid, u16::from(code), y));
    parameters
}

/// 12-byte challenge written to the BLE peripheral to start notifications.
///
/// `enable_time` is the unlock code that was sent with the enable-streaming
/// command; `unlock_count` increases on every login so a captured challenge
/// cannot be replayed.
pub fn streaming_unlock_payload(identity: &SensorIdentity, enable_time: u32, unlock_count: u32) -> [u8; 12] {
    let uid = &identity.uid;
    let time = enable_time.wrapping_add(unlock_count).to_le_bytes();

    let ad = command_key(uid, u16::from(Subcommand::Activate.code()), ACTIVATE_ARGUMENT);
    let ed = command_key(
        uid,
        u16::from(Subcommand::EnableStreaming.code()),
        (enable_time as u16) ^ identity.patch_info.tail_word(),
    );

    let t1 = process_crypto(prepare_variables2(
        uid,
        u16::from_le_bytes([ed[0], ed[1]]) ^ u16::from_le_bytes([time[2], time[3]]),
        u16::from_le_bytes([ad[0], ad[1]]),
        u16::from_le_bytes([ed[2], ed[3]]) ^ u16::from_le_bytes([time[0], time[1]]),
        u16::from_le_bytes([ad[2], ad[3]]),
    ));

    let mut first = UNLOCK_PREFIX.to_vec();
    first.extend_from_slice(&t1[0].to_le_bytes());
    let t1_bytes = words_to_bytes(t1);
    let second = &t1_bytes[2..];
    let third = [ad[0], ad[1], ad[2], ad[3], ed[0], ed[1]];
    let fourth = [ed[2], ed[3], time[0], time[1], time[2], time[3]];

    let t2 = process_crypto(prepare_variables2(
        uid,
        crc16(&first).swap_bytes(),
        crc16(second).swap_bytes(),
        crc16(&third).swap_bytes(),
        crc16(&fourth).swap_bytes(),
    ));

    let mut payload = [0u8; 12];
    payload[..4].copy_from_slice(&time);
    payload[4..].copy_from_slice(&words_to_bytes(t2));
    payload
}
