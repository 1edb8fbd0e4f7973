//! Reassembly of delimiter-separated records from a byte stream.
//!
//! Bytes arrive in arbitrary chunks. Everything after the last delimiter is a
//! possibly-partial record and stays in the buffer, untouched, until the next
//! chunk completes it. A missing delimiter is never an error by itself.

/// Accumulation buffer that yields complete, trimmed, non-empty records.
#[derive(Debug, Clone)]
pub struct LineFramer {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Creates a framer. An empty delimiter falls back to `"\n"`.
    pub fn new(delimiter: &str) -> Self {
        let delimiter = if delimiter.is_empty() {
            b"\n".to_vec()
        } else {
            delimiter.as_bytes().to_vec()
        };
        Self {
            delimiter,
            buffer: Vec::new(),
        }
    }

    /// Appends a chunk and returns every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last) = rfind(&self.buffer, &self.delimiter) else {
            return Vec::new();
        };

        let remainder = self.buffer.split_off(last + self.delimiter.len());
        let complete = std::mem::replace(&mut self.buffer, remainder);

        split(&complete, &self.delimiter)
            .filter_map(|record| {
                let text = String::from_utf8_lossy(record);
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .collect()
    }

    /// The pending partial record, decoded lossily.
    pub fn buffer(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Bytes of the pending partial record.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drops the pending partial record.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn split<'a>(data: &'a [u8], delimiter: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match find(current, delimiter) {
            Some(pos) => {
                rest = Some(&current[pos + delimiter.len()..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_chunks_accumulate_without_emitting() {
        let mut framer = LineFramer::new("\n");
        assert!(framer.push(b"Hola").is_empty());
        assert!(framer.push(b" como esta").is_empty());
        assert_eq!(framer.buffer(), "Hola como esta");
    }

    #[test]
    fn delimiter_completes_the_accumulated_record() {
        let mut framer = LineFramer::new("\n");
        framer.push(b"Hola");
        framer.push(b" como esta");
        let records = framer.push(b"?\nadi");
        assert_eq!(records, vec!["Hola como esta?".to_string()]);
        assert_eq!(framer.buffer(), "adi");
    }

    #[test]
    fn remainder_is_kept_verbatim() {
        let mut framer = LineFramer::new("\n");
        framer.push(b"a\n  partial ");
        assert_eq!(framer.buffer(), "  partial ");
    }

    #[test]
    fn blank_records_are_skipped() {
        let mut framer = LineFramer::new("\n");
        let records = framer.push(b"hola\n            \n        adios\n");
        assert_eq!(records, vec!["hola".to_string(), "adios".to_string()]);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn multi_byte_delimiters_are_supported() {
        let mut framer = LineFramer::new("\r\n");
        let records = framer.push(b"one\r\ntwo\r");
        assert_eq!(records, vec!["one".to_string()]);
        let records = framer.push(b"\nthree");
        assert_eq!(records, vec!["two".to_string()]);
        assert_eq!(framer.buffer(), "three");
    }

    #[test]
    fn utf8_split_across_chunks_is_reassembled() {
        let mut framer = LineFramer::new("\n");
        let text = "cómo\n".as_bytes();
        framer.push(&text[..2]);
        let records = framer.push(&text[2..]);
        assert_eq!(records, vec!["cómo".to_string()]);
    }
}
