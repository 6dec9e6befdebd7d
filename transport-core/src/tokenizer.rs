/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::FramingError;

/// Size of the framed message header: big-endian size then big-endian type.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Largest message a frame header can declare.
pub const MESSAGE_SIZE_MAX: usize = u16::MAX as usize;

/// Incremental tokenizer turning a byte stream into whole framed messages.
///
/// Callers push chunks in arrival order; every complete frame
/// `{size: u16, type: u16, body}` is handed to the callback with the header
/// already stripped. Partial frames are buffered across pushes. A declared
/// size smaller than the header itself is unrecoverable: the tokenizer
/// reports [`FramingError`] and the caller must discard the source.
pub struct StreamTokenizer {
    buf: Vec<u8>,
    dead: bool,
}

impl Default for StreamTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTokenizer {
    pub fn new() -> Self {
        Self { buf: Vec::new(), dead: false }
    }

    /// Number of buffered bytes belonging to a not-yet-complete frame.
    #[inline(always)]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and deliver every frame it completes, in order.
    ///
    /// The callback receives the message type and the body after the header.
    /// After an error the tokenizer refuses further input.
    pub fn push<F: FnMut(u16, &[u8])>(&mut self, data: &[u8], mut deliver: F) -> Result<(), FramingError> {
        if self.dead {
            return Err(FramingError);
        }
        self.buf.extend_from_slice(data);

        let mut consumed = 0;
        while self.buf.len() - consumed >= MESSAGE_HEADER_SIZE {
            let at = &self.buf[consumed..];
            let size = u16::from_be_bytes(at[0..2].try_into().unwrap()) as usize;
            if size < MESSAGE_HEADER_SIZE {
                self.dead = true;
                self.buf.clear();
                return Err(FramingError);
            }
            if at.len() < size {
                break;
            }
            let msg_type = u16::from_be_bytes(at[2..4].try_into().unwrap());
            deliver(msg_type, &at[MESSAGE_HEADER_SIZE..size]);
            consumed += size;
        }
        if consumed > 0 {
            self.buf.drain(0..consumed);
        }
        Ok(())
    }
}

/// Prefix a payload with the framed `{size, type}` header, producing one
/// complete message as the tokenizer on the far side expects it.
pub fn frame_message(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    let total = MESSAGE_HEADER_SIZE + payload.len();
    debug_assert!(total <= MESSAGE_SIZE_MAX);
    let mut v = Vec::with_capacity(total);
    v.extend_from_slice(&(total as u16).to_be_bytes());
    v.extend_from_slice(&msg_type.to_be_bytes());
    v.extend_from_slice(payload);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
        frame_message(msg_type, body)
    }

    #[test]
    fn whole_frames_in_one_push() {
        let mut t = StreamTokenizer::new();
        let mut out = Vec::new();
        let mut data = frame(7, b"hello");
        data.extend_from_slice(&frame(8, b""));
        t.push(&data, |ty, body| out.push((ty, body.to_vec()))).unwrap();
        assert_eq!(out, vec![(7, b"hello".to_vec()), (8, Vec::new())]);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn split_frame_across_pushes() {
        let mut t = StreamTokenizer::new();
        let mut out = Vec::new();
        let data = frame(42, &[1, 2, 3, 4, 5, 6, 7, 8]);
        for chunk in data.chunks(3) {
            t.push(chunk, |ty, body| out.push((ty, body.to_vec()))).unwrap();
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 42);
        assert_eq!(out[0].1, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn ordering_preserved() {
        let mut t = StreamTokenizer::new();
        let mut out = Vec::new();
        let mut data = Vec::new();
        for i in 0..16u16 {
            data.extend_from_slice(&frame(i, &i.to_be_bytes()));
        }
        t.push(&data, |ty, _| out.push(ty)).unwrap();
        assert_eq!(out, (0..16).collect::<Vec<u16>>());
    }

    #[test]
    fn undersized_declaration_is_fatal() {
        let mut t = StreamTokenizer::new();
        // declared size 2 < header size
        assert!(t.push(&[0, 2, 0, 0], |_, _| panic!("no delivery")).is_err());
        // tokenizer stays dead
        assert!(t.push(&frame(1, b"x"), |_, _| panic!("no delivery")).is_err());
    }
}
