/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::error::Error;
use std::fmt::{Debug, Display};

/// Error returned when a parameter is invalid at construction or call time.
pub struct InvalidParameterError(pub &'static str);

impl Display for InvalidParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl Debug for InvalidParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl Error for InvalidParameterError {}

/// Error returned when a human-readable or binary form fails to parse.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InvalidFormatError;

impl Display for InvalidFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("invalid format")
    }
}

impl Debug for InvalidFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("invalid format")
    }
}

impl Error for InvalidFormatError {}

/// Fatal framing error reported by the stream tokenizer.
///
/// After this the byte source is unusable and must be discarded by the
/// caller; the tokenizer makes no attempt to resynchronize.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FramingError;

impl Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("fatal framing error in message stream")
    }
}

impl Debug for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("fatal framing error in message stream")
    }
}

impl Error for FramingError {}
