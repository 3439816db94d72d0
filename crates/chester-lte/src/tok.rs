//! # Tokenizer
//!
//! Zero-copy cursor over a comma-separated AT response body such as
//! `5,"B4DC","000AE520",9,,,"00000000","00111000"`.
//!
//! Every field reader distinguishes an empty-but-present field (`Ok(None)`,
//! cursor not advanced) from a malformed one (`Err`). Separators are
//! consumed explicitly with [`Tokenizer::sep`] or [`Tokenizer::more`].

use crate::error::ParseError;

/// Longest decimal field accepted by [`Tokenizer::num`], sign excluded.
pub const MAX_NUM_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Tokenizer { rest: input }
    }

    /// Unconsumed remainder of the input.
    pub fn rest(&self) -> &'a str {
        self.rest
    }

    pub fn end(&self) -> bool {
        self.rest.is_empty()
    }

    fn field_is_empty(&self) -> bool {
        self.rest.is_empty() || self.rest.starts_with(',')
    }

    /// Consumes a mandatory `,`.
    pub fn sep(&mut self, field: &'static str) -> Result<(), ParseError> {
        match self.rest.strip_prefix(',') {
            Some(rest) => {
                self.rest = rest;
                Ok(())
            }
            None if self.rest.is_empty() => Err(ParseError::Missing(field)),
            None => Err(ParseError::Malformed(field)),
        }
    }

    /// Returns `false` at end of input, otherwise consumes a `,` and
    /// returns `true`. Used for optional trailing fields.
    pub fn more(&mut self) -> Result<bool, ParseError> {
        if self.end() {
            return Ok(false);
        }
        match self.rest.strip_prefix(',') {
            Some(rest) => {
                self.rest = rest;
                Ok(true)
            }
            None => Err(ParseError::TrailingInput),
        }
    }

    /// Fails unless the whole input has been consumed.
    pub fn finish(&self) -> Result<(), ParseError> {
        if self.end() {
            Ok(())
        } else {
            Err(ParseError::TrailingInput)
        }
    }

    /// Reads a double-quoted string. The returned slice excludes the quotes.
    pub fn string(&mut self, field: &'static str) -> Result<Option<&'a str>, ParseError> {
        if self.field_is_empty() {
            return Ok(None);
        }
        let body = self
            .rest
            .strip_prefix('"')
            .ok_or(ParseError::Malformed(field))?;
        let close = body.find('"').ok_or(ParseError::Malformed(field))?;
        self.rest = &body[close + 1..];
        Ok(Some(&body[..close]))
    }

    /// Like [`Tokenizer::string`] but rejects values of `max_len` bytes or more.
    pub fn string_max(
        &mut self,
        field: &'static str,
        max_len: usize,
    ) -> Result<Option<&'a str>, ParseError> {
        match self.string(field)? {
            Some(s) if s.len() > max_len => Err(ParseError::Overflow(field)),
            other => Ok(other),
        }
    }

    /// Reads a signed decimal integer of at most [`MAX_NUM_DIGITS`] digits.
    pub fn num(&mut self, field: &'static str) -> Result<Option<i64>, ParseError> {
        if self.field_is_empty() {
            return Ok(None);
        }
        let len = self.rest.find(',').unwrap_or(self.rest.len());
        let token = &self.rest[..len];
        let digits = token.strip_prefix('-').unwrap_or(token);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Malformed(field));
        }
        if digits.len() > MAX_NUM_DIGITS {
            return Err(ParseError::Overflow(field));
        }
        let value = token.parse().map_err(|_| ParseError::Malformed(field))?;
        self.rest = &self.rest[len..];
        Ok(Some(value))
    }

    /// Reads a decimal integer and checks it fits the target type.
    pub fn num_as<T: TryFrom<i64>>(&mut self, field: &'static str) -> Result<Option<T>, ParseError> {
        self.num(field)?
            .map(|v| T::try_from(v).map_err(|_| ParseError::Overflow(field)))
            .transpose()
    }

    /// Reads a decimal floating point value (`-?[0-9.]+`).
    pub fn float(&mut self, field: &'static str) -> Result<Option<f64>, ParseError> {
        if self.field_is_empty() {
            return Ok(None);
        }
        let len = self.rest.find(',').unwrap_or(self.rest.len());
        let token = &self.rest[..len];
        let body = token.strip_prefix('-').unwrap_or(token);
        if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            return Err(ParseError::Malformed(field));
        }
        let value = token.parse().map_err(|_| ParseError::Malformed(field))?;
        self.rest = &self.rest[len..];
        Ok(Some(value))
    }
}

/// Decodes a hexadecimal cell id such as `000AE520` (at most 8 digits).
pub fn hex_u32(s: &str, field: &'static str) -> Result<u32, ParseError> {
    if s.is_empty() || s.len() > 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::Malformed(field));
    }
    u32::from_str_radix(s, 16).map_err(|_| ParseError::Malformed(field))
}

/// Strips one pair of surrounding double quotes, if present.
pub fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}
