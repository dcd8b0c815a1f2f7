use std::fmt::Write;

use super::SecureBuffer;

/// Layout of the hex dumps produced by [`SecureBuffer::dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpFormat {
    pub bytes_per_line: usize,
    /// Replaces secure bytes in the ascii column; the hex column shows two of them.
    pub mask: char,
}

impl Default for DumpFormat {
    fn default() -> Self {
        Self {
            bytes_per_line: 16,
            mask: '*',
        }
    }
}

impl SecureBuffer {
    /// Renders the buffered bytes as `offset  hex  |ascii|` lines, masking
    /// every byte that falls inside a secure region.
    pub fn dump(&self, format: &DumpFormat) -> String {
        let Ok(data) = self.peek(self.len()) else {
            return String::from("<disposed>");
        };

        let width = format.bytes_per_line.max(1);
        let mut out = String::new();

        for (line, bytes) in data.chunks(width).enumerate() {
            let start = line * width;
            let _ = write!(out, "{start:04x}  ");

            let mut ascii = String::with_capacity(width);
            for (i, byte) in bytes.iter().enumerate() {
                if self.in_secure_region(self.lower_bound() + start + i) {
                    out.push(format.mask);
                    out.push(format.mask);
                    ascii.push(format.mask);
                } else {
                    let _ = write!(out, "{byte:02x}");
                    ascii.push(if byte.is_ascii_graphic() || *byte == b' ' {
                        *byte as char
                    } else {
                        '.'
                    });
                }
                out.push(' ');
            }

            for _ in bytes.len()..width {
                out.push_str("   ");
            }
            let _ = writeln!(out, " |{ascii}|");
        }

        out
    }
}
