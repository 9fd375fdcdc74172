/*
 * CHAPPS postfix policy delegate
 * Copyright (C) 2023 The CHAPPS developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
 */

use crate::ProtocolError;
use chapps_common::PolicyRequest;
use tokio::io::AsyncReadExt;

/// Default cap on one request, terminator included.
pub const DEFAULT_SIZE_LIMIT: usize = 64 * 1024;

/// How many trailing attribute names an [`ProtocolError::IncompleteRequest`]
/// reports.
const DIAGNOSTIC_KEY_COUNT: usize = 3;

fn find(bytes: &[u8], search: &[u8]) -> Option<usize> {
    bytes
        .windows(search.len())
        .position(|window| window == search)
}

/// Stream of policy-delegation requests read from one Postfix connection.
pub struct Reader<R: tokio::io::AsyncRead + Unpin + Send> {
    inner: R,
    buffer: bytes::BytesMut,
    additional_reserve: usize,
    size_limit: usize,
    encoding: &'static encoding_rs::Encoding,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> Reader<R> {
    /// Create a reader over a connected stream.
    #[must_use]
    pub fn new(
        tcp_stream: R,
        size_limit: usize,
        encoding: &'static encoding_rs::Encoding,
    ) -> Self {
        Self {
            inner: tcp_stream,
            buffer: bytes::BytesMut::with_capacity(512),
            additional_reserve: 512,
            size_limit,
            encoding,
        }
    }

    /// Consume the instance and return the underlying reader.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read one request, buffering until the empty-line terminator.
    ///
    /// `Ok(None)` is a clean close: EOF on a request boundary.
    ///
    /// # Errors
    ///
    /// * [`ProtocolError::IncompleteRequest`] on EOF inside a request
    /// * [`ProtocolError::RequestTooLarge`] past the configured cap
    /// * [`ProtocolError::InvalidAttributeLine`] on an unsplittable line
    /// * [`ProtocolError::Io`] from the underlying stream
    pub async fn read_request(&mut self) -> Result<Option<PolicyRequest>, ProtocolError> {
        loop {
            if let Some(pos) = find(&self.buffer, b"\n\n") {
                let block = self.buffer.split_to(pos + 2);
                return self.decode_block(&block[..pos + 1]).map(Some);
            }

            if self.buffer.len() > self.size_limit {
                return Err(ProtocolError::RequestTooLarge {
                    limit: self.size_limit,
                    got: self.buffer.len(),
                });
            }

            self.buffer.reserve(self.additional_reserve);
            let read_size = self.inner.read_buf(&mut self.buffer).await?;
            if read_size == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::IncompleteRequest {
                    bytes_read: self.buffer.len(),
                    last_keys: self.trailing_keys(),
                });
            }
        }
    }

    /// Produce the stream of requests a connection is driven by.
    ///
    /// Recoverable errors (a malformed line inside an intact request) are
    /// yielded and the stream keeps going; a lost framing or a clean close
    /// ends it after the last item.
    pub fn as_request_stream(
        &mut self,
    ) -> impl tokio_stream::Stream<Item = Result<PolicyRequest, ProtocolError>> + '_ {
        async_stream::stream! {
            loop {
                match self.read_request().await {
                    Ok(Some(request)) => yield Ok(request),
                    Ok(None) => return,
                    Err(error) => {
                        let recoverable = error.is_recoverable();
                        yield Err(error);
                        if !recoverable {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One `name=value` block, final newline included, terminator excluded.
    fn decode_block(&self, block: &[u8]) -> Result<PolicyRequest, ProtocolError> {
        let mut attributes = Vec::new();
        for line in block.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            attributes.push(self.decode_line(line)?);
        }
        tracing::trace!(attributes = attributes.len(), "<< request");
        Ok(attributes.into_iter().collect())
    }

    /// Split on the first `=` only: values are free to contain `=`.
    fn decode_line(&self, line: &[u8]) -> Result<(String, String), ProtocolError> {
        let Some(split) = line.iter().position(|byte| *byte == b'=') else {
            return Err(ProtocolError::InvalidAttributeLine {
                line: preview(self.encoding, line),
            });
        };
        let (name, value) = (&line[..split], &line[split + 1..]);
        if name.is_empty()
            || !name
                .iter()
                .all(|byte| byte.is_ascii_alphabetic() || *byte == b'_')
        {
            return Err(ProtocolError::InvalidAttributeLine {
                line: preview(self.encoding, line),
            });
        }

        let (name, _, _) = self.encoding.decode(name);
        let (value, _, _) = self.encoding.decode(value);
        Ok((name.into_owned(), value.into_owned()))
    }

    /// Names of the last few complete attribute lines sitting in the
    /// buffer, for incomplete-request diagnostics.
    fn trailing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .buffer
            .as_ref()
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                line.iter().position(|byte| *byte == b'=').map(|split| {
                    let (name, _, _) = self.encoding.decode(&line[..split]);
                    name.into_owned()
                })
            })
            .collect();
        if keys.len() > DIAGNOSTIC_KEY_COUNT {
            keys.drain(..keys.len() - DIAGNOSTIC_KEY_COUNT);
        }
        keys
    }
}

fn preview(encoding: &'static encoding_rs::Encoding, line: &[u8]) -> String {
    const PREVIEW_LEN: usize = 80;
    let (decoded, _, _) = encoding.decode(&line[..line.len().min(PREVIEW_LEN)]);
    decoded.into_owned()
}
