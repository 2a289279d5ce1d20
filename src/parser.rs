//! implements a parser for beanstalkd TCP protocol response lines.
use std::fmt;

use crate::types::protocol::QueueResponse;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownResponse,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownResponse => "unknown response",
        })
    }
}

impl std::error::Error for ParsingError {}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.len() == 0 {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Reports whether all input has been consumed, to disambiguate response
    /// words that may or may not carry arguments (`BURIED` vs `BURIED <id>`).
    fn is_done(&self) -> bool {
        self.from.len() == 0
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.len() == 0 {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u32;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u32)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u64)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then a tube name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        fn char_is_name_safe(c: u8, is_first: bool) -> bool {
            match c {
                b'a'..=b'z' => true,
                b'A'..=b'Z' => true,
                b'0'..=b'9' => true,
                b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
                b'-' => !is_first, // - is only name safe outside first position
                _ => false,
            }
        }

        if token
            .iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
            && token.len() <= 200
        {
            // The name charset is a subset of ASCII, so this can't fail.
            String::from_utf8(token.to_vec())
                .map_err(|_| ParsingError::BadFormat)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.get(0) {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.len() == 0 {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for QueueResponse {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use QueueResponse::*;

        let mut ps: ParseState = value.into();

        let resp = match ps.expect_next_token()? {
            // <word>
            b"OUT_OF_MEMORY" => OutOfMemory,
            b"INTERNAL_ERROR" => InternalError,
            b"BAD_FORMAT" => BadFormat,
            b"UNKNOWN_COMMAND" => UnknownCommand,
            b"EXPECTED_CRLF" => ExpectedCrlf,
            b"JOB_TOO_BIG" => JobTooBig,
            b"DRAINING" => Draining,
            b"DEADLINE_SOON" => DeadlineSoon,
            b"TIMED_OUT" => TimedOut,
            b"NOT_FOUND" => NotFound,
            b"DELETED" => Deleted,
            b"RELEASED" => Released,
            b"TOUCHED" => Touched,
            b"NOT_IGNORED" => NotIgnored,

            // BURIED is sent bare for a failed release or a successful bury,
            // and with an ID for a put absorbed under memory pressure.
            b"BURIED" => {
                if ps.is_done() {
                    Buried
                } else {
                    BuriedId {
                        id: ps.expect_next_u64()?,
                    }
                }
            },

            // <word> <id>
            b"INSERTED" => Inserted {
                id: ps.expect_next_u64()?,
            },

            // <word> <count>
            b"WATCHING" => Watching {
                count: ps.expect_next_u32()?,
            },
            b"OK" => OkData {
                n_bytes: ps.expect_next_u32()?,
            },

            // <word> <tube>
            b"USING" => Using {
                tube: ps.expect_next_name()?,
            },

            // <word> <id> <n_bytes>
            b"RESERVED" => Reserved {
                id: ps.expect_next_u64()?,
                n_bytes: ps.expect_next_u32()?,
            },

            _ => return Err(ParsingError::UnknownResponse),
        };

        ps.expect_done_and(resp)
    }
}
