// Palaver - Line-oriented talker server over CRLF text with a flooding peer mesh
// Copyright (C) 2026  mossfet
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PalaverError;

/// CRLF record codec shared by the client and peer roles.
///
/// Records split at CRLF; a bare LF is tolerated for netcat-style clients.
/// A CR on its own never terminates and stays part of the record. Records
/// are bytes; nothing here assumes UTF-8. Outbound records get CRLF
/// appended, so callers must not include it themselves.
pub struct LineCodec {
    /// Cap on the record length, terminator excluded. Breaching it is a
    /// connection-fatal oversize error.
    max_length: usize,

    /// Scan resume offset into the buffer, so repeated decode calls do not
    /// rescan bytes already known to hold no LF.
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = PalaverError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        match buf[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let index = self.next_index + pos;
                self.next_index = 0;

                let mut line = buf.split_to(index + 1);
                line.truncate(line.len() - 1);

                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }

                if line.len() > self.max_length {
                    return Err(PalaverError::Oversize(self.max_length));
                }

                Ok(Some(line))
            }
            None => {
                if buf.len() > self.max_length {
                    return Err(PalaverError::Oversize(self.max_length));
                }

                // Partial record stays buffered until more bytes arrive.
                self.next_index = buf.len();

                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = PalaverError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 2);
        dst.put_slice(&item);
        dst.put_slice(b"\r\n");

        Ok(())
    }
}
