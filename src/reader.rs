use std::io::{self, BufRead, Read};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("line {line} is longer than the {limit} byte limit")]
    LineTooLong { line: u64, limit: usize },
    #[error("failed reading shard: {0}")]
    Io(#[from] io::Error),
}

/// A newline-joined group of shard lines, parsed by one extraction task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    pub lines: usize,
    pub data: Vec<u8>,
}

/// Streams a line-delimited shard in fixed-size batches. Memory is bounded
/// by `lines_per_batch * max_line_bytes` no matter how large the shard is.
pub struct BatchReader<R> {
    reader: R,
    lines_per_batch: usize,
    max_line_bytes: usize,
    lines_read: u64,
    line: Vec<u8>,
}

impl<R: BufRead> BatchReader<R> {
    pub fn new(reader: R, lines_per_batch: usize, max_line_bytes: usize) -> Self {
        Self {
            reader,
            lines_per_batch: lines_per_batch.max(1),
            max_line_bytes,
            lines_read: 0,
            line: Vec::new(),
        }
    }

    /// Lines consumed so far, blank ones included.
    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    /// Next batch of exactly `lines_per_batch` non-blank lines, or fewer
    /// at end of stream. `None` once the shard is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>, ReadError> {
        let mut batch = Batch::default();
        while batch.lines < self.lines_per_batch {
            if !self.read_line()? {
                break;
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            batch.data.extend_from_slice(&self.line);
            batch.data.push(b'\n');
            batch.lines += 1;
        }
        Ok((batch.lines > 0).then_some(batch))
    }

    /// Reads one line into `self.line` without its terminator. Returns
    /// false at end of stream. The limit applies to the content only, so
    /// room is left for a `\r\n` terminator.
    fn read_line(&mut self) -> Result<bool, ReadError> {
        self.line.clear();
        let limit = self.max_line_bytes as u64 + 2;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.line)?;
        if read == 0 {
            return Ok(false);
        }
        self.lines_read += 1;

        if self.line.last() == Some(&b'\n') {
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
        }
        if self.line.len() > self.max_line_bytes {
            return Err(ReadError::LineTooLong {
                line: self.lines_read,
                limit: self.max_line_bytes,
            });
        }
        Ok(true)
    }
}
