use std::collections::VecDeque;

#[derive(Debug)]
pub struct HistoryBuffer {
    chunks: VecDeque<String>,
    max_chunks: usize,
    total_bytes: usize,
    dropped_chunks_total: u64,
}

impl HistoryBuffer {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            max_chunks: max_chunks.max(1),
            total_bytes: 0,
            dropped_chunks_total: 0,
        }
    }

    pub fn append(&mut self, chunk: String) -> usize {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        self.enforce_limit()
    }

    pub fn concat(&self) -> String {
        let mut out = String::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.push_str(chunk);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn dropped_chunks_total(&self) -> u64 {
        self.dropped_chunks_total
    }

    fn enforce_limit(&mut self) -> usize {
        let mut dropped = 0usize;
        while self.chunks.len() > self.max_chunks {
            if let Some(chunk) = self.chunks.pop_front() {
                self.total_bytes -= chunk.len();
                dropped += 1;
            }
        }
        self.dropped_chunks_total = self.dropped_chunks_total.saturating_add(dropped as u64);
        dropped
    }
}

pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 16);
    let mut prev = None;
    for ch in text.chars() {
        if ch == '\n' && prev != Some('\r') {
            out.push('\r');
        }
        out.push(ch);
        prev = Some(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_chunks_first() {
        let mut buffer = HistoryBuffer::new(2);
        assert_eq!(buffer.append("a".to_string()), 0);
        assert_eq!(buffer.append("b".to_string()), 0);
        assert_eq!(buffer.append("c".to_string()), 1);
        assert_eq!(buffer.concat(), "bc");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_bytes(), 2);
        assert_eq!(buffer.dropped_chunks_total(), 1);
    }

    #[test]
    fn clear_empties_in_place() {
        let mut buffer = HistoryBuffer::new(4);
        buffer.append("hello".to_string());
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.concat(), "");
        assert_eq!(buffer.total_bytes(), 0);
    }

    #[test]
    fn normalize_adds_carriage_returns() {
        assert_eq!(normalize_line_endings("a\nb\n"), "a\r\nb\r\n");
        assert_eq!(normalize_line_endings("a\r\nb"), "a\r\nb");
        assert_eq!(normalize_line_endings("\n\n"), "\r\n\r\n");
        assert_eq!(normalize_line_endings("no breaks"), "no breaks");
    }

    #[test]
    fn normalize_keeps_ansi_sequences() {
        let text = "\x1b[1;36m/tmp\x1b[0m\n";
        assert_eq!(normalize_line_endings(text), "\x1b[1;36m/tmp\x1b[0m\r\n");
    }
}
