// Copyright 2022-2023 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Associates a [`Codec`] with a writer to allow writing encoded frames.

use std::io::Write;

use crate::codec::Codec;
use crate::image::Picture;
use crate::params::Params;
use crate::{Error, Result};

/// An encoding session ready to start but which has not yet necessarily encoded
/// its first frame.
///
/// This mainly exists to hold the writer but defer opening the codec until we
/// have the first frame (in the `Configured` variant), since that is the
/// first point at which picture dimensions are known. After the first frame
/// is written, it will be in the `Recording` variant. (The `MovedOut` variant
/// should never be observed and represents a temporary internal state.)
enum WriteState<W> {
    Configured(W),
    Recording(RecordingState<W>),
    MovedOut,
}

impl<W: Write> WriteState<W> {
    fn write_frame(&mut self, frame: &Picture) -> Result<()> {
        // Temporarily replace ourself with a dummy value.
        let orig_state = std::mem::replace(self, WriteState::MovedOut);
        let mut state = match orig_state {
            WriteState::Configured(fd) => {
                let params = Params {
                    // The first coded picture is always an IDR, and
                    // `prepend_param_sets_to_i_pictures` already resends
                    // SPS/PPS ahead of it; generating them again here would
                    // just duplicate that first pair.
                    generate_param_sets_on_open: false,
                    ..Params::new(frame.width() as u32, frame.height() as u32)
                };
                let (_initial, codec) = Codec::open(params)?;
                RecordingState { wtr: fd, codec }
            }
            WriteState::Recording(state) => state,
            WriteState::MovedOut => {
                return Err(Error::InconsistentState {
                    #[cfg(feature = "backtrace")]
                    backtrace: std::backtrace::Backtrace::capture(),
                })
            }
        };

        let encoded = state.codec.code(frame)?;
        for nal in &encoded.nal_units {
            state.wtr.write_all(&nal.to_annex_b_data())?;
        }

        // Restore ourself to the correct state.
        *self = WriteState::Recording(state);

        Ok(())
    }
}

/// Small helper struct holding writer and codec for an ongoing encoding
/// session.
struct RecordingState<W> {
    wtr: W,
    codec: Codec,
}

/// Write pictures to an [std::io::Write] implementation in `.h264` file format.
pub struct H264Writer<W> {
    inner: WriteState<W>,
}

impl<W: Write> H264Writer<W> {
    /// Create a new [H264Writer] from an [std::io::Write] implementation.
    pub fn new(wtr: W) -> Result<Self> {
        Ok(Self {
            inner: WriteState::Configured(wtr),
        })
    }

    /// Retrieve the underlying [std::io::Write] implementation.
    pub fn into_inner(self) -> W {
        match self.inner {
            WriteState::Configured(w) => w,
            WriteState::Recording(state) => state.wtr,
            WriteState::MovedOut => {
                unreachable!("inconsistent internal state");
            }
        }
    }

    /// Encode and write a frame.
    pub fn write(&mut self, frame: &Picture) -> Result<()> {
        self.inner.write_frame(frame)
    }
}
