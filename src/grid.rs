//! Heightmap text format.
//!
//! A map is a rectangle of whitespace separated elevations, one row per line,
//! each optionally followed by a `,0xRRGGBB` color:
//!
//! ```text
//! 0 0 0  0
//! 0 5 5,0xff0000 0
//! 0 0 0 -2
//! ```

use std::str::FromStr;

use crate::error::{ParseError, ParseErrorKind};
use crate::{Vec3, Vec4};

/// Alpha byte OR-ed into every parsed `0xRRGGBB` color.
const OPAQUE_ALPHA: u32 = 0xff;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vertex {
    pub pos: Vec3,
    pub color: Vec4,
}

impl Vertex {
    pub const WHITE: Vec4 = Vec4::new(1.0, 1.0, 1.0, 1.0);

    pub fn new(pos: Vec3, color: Vec4) -> Self {
        Self { pos, color }
    }

    /// Expands a `0xRRGGBB` literal to `0xRRGGBBff` and normalizes each channel.
    fn color_from_rgb(rgb: u32) -> Vec4 {
        let rgba = (rgb << 8) | OPAQUE_ALPHA;
        let channel = |shift: u32| ((rgba >> shift) & 0xff) as f32 / 255.0;
        Vec4::new(channel(24), channel(16), channel(8), channel(0))
    }
}

/// Rectangular, row-major vertex grid. Every row has `col_count()` vertices.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    vertices: Vec<Vertex>,
    row_length: usize,
}

impl Grid {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        GridParser::new(text.as_bytes()).parse()
    }

    pub fn row_count(&self) -> usize {
        self.vertices.len() / self.row_length
    }

    pub fn col_count(&self) -> usize {
        self.row_length
    }

    pub fn into_vertices(self) -> Vec<Vertex> {
        self.vertices
    }
}

impl FromStr for Grid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Forward-only recursive-descent parser over the raw map bytes.
///
/// Every decision is made on the current byte, so the cursor never moves
/// backwards.
pub struct GridParser<'a> {
    input: &'a [u8],
    cursor: usize,
    line_start: usize,
    row: usize,
    col: usize,
    vertices: Vec<Vertex>,
}

impl<'a> GridParser<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            cursor: 0,
            line_start: 0,
            row: 0,
            col: 0,
            vertices: Vec::new(),
        }
    }

    pub fn parse(mut self) -> Result<Grid, ParseError> {
        // The first row fixes the width every later row must match.
        let row_length = self.row()?;
        if row_length == 0 {
            return Err(self.error(ParseErrorKind::EmptyGrid));
        }

        while self.newline() {
            if self.at_end() {
                break;
            }
            self.row += 1;
            self.col = 0;

            let found = self.row()?;
            if found == 0 && self.only_blank_lines_remain() {
                break;
            }
            // Checked only once the whole row is consumed.
            if found != row_length {
                return Err(self.error(ParseErrorKind::IncompleteTetragon {
                    expected: row_length,
                    found,
                }));
            }
        }

        Ok(Grid {
            vertices: self.vertices,
            row_length,
        })
    }

    /// Parses vertices up to (not including) the next `\n` or end of input.
    /// Returns how many vertices the row held.
    fn row(&mut self) -> Result<usize, ParseError> {
        let first = self.vertices.len();
        self.delim();
        loop {
            match self.peek() {
                None | Some(b'\n') => break,
                Some(b'\r') => return Err(self.error(ParseErrorKind::InvalidNewline)),
                Some(_) => {
                    self.vertex()?;
                    self.delim();
                }
            }
        }
        Ok(self.vertices.len() - first)
    }

    fn vertex(&mut self) -> Result<(), ParseError> {
        let z = self.elevation()?;
        let color = if self.eat(b',') {
            Vertex::color_from_rgb(self.hex()?)
        } else {
            Vertex::WHITE
        };

        self.vertices.push(Vertex::new(
            Vec3::new(self.col as f32, self.row as f32, z as f32),
            color,
        ));
        self.col += 1;
        Ok(())
    }

    fn delim(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.cursor += 1;
        }
    }

    /// Consumes a `\n`. Returns `false` at end of input.
    fn newline(&mut self) -> bool {
        if self.eat(b'\n') {
            self.line_start = self.cursor;
            true
        } else {
            false
        }
    }

    fn elevation(&mut self) -> Result<i32, ParseError> {
        let start = self.cursor;
        let negative = self.eat(b'-');
        if !matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            return Err(self.error(ParseErrorKind::InvalidDigit));
        }

        let mut value: i64 = 0;
        while let Some(c) = self.peek().filter(u8::is_ascii_digit) {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(c - b'0')))
                .ok_or_else(|| self.error_at(start, ParseErrorKind::ElevationOutOfRange))?;
            self.cursor += 1;
        }

        let value = if negative { -value } else { value };
        i32::try_from(value).map_err(|_| self.error_at(start, ParseErrorKind::ElevationOutOfRange))
    }

    fn hex(&mut self) -> Result<u32, ParseError> {
        let start = self.cursor;
        if !(self.eat(b'0') && self.eat(b'x')) {
            return Err(self.error_at(start, ParseErrorKind::InvalidHex));
        }

        let mut value: u32 = 0;
        let mut digits = 0;
        while let Some(d) = self.peek().and_then(|c| char::from(c).to_digit(16)) {
            value = value.wrapping_mul(16).wrapping_add(d);
            digits += 1;
            self.cursor += 1;
        }

        if digits == 0 {
            return Err(self.error_at(start, ParseErrorKind::InvalidHex));
        }
        Ok(value)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.cursor).copied()
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.cursor >= self.input.len()
    }

    /// Looks ahead without consuming: nothing but `\n`, spaces and tabs until end of input.
    fn only_blank_lines_remain(&self) -> bool {
        self.input[self.cursor..]
            .iter()
            .all(|c| matches!(c, b'\n' | b' ' | b'\t'))
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        self.error_at(self.cursor, kind)
    }

    fn error_at(&self, position: usize, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            line: self.row + 1,
            column: position - self.line_start + 1,
        }
    }
}
