/// Accumulates streamed text and emits whole sentences at zh/en punctuation
/// or newline boundaries.
///
/// Pure delimiter splitter; `.` inside decimals or abbreviations breaks
/// early, which is tolerated because a phrase is still translatable.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buffer: String,
}

const TERMINATORS: [char; 7] = ['。', '？', '！', '.', '?', '!', '\n'];

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete sentence, terminators
    /// included.
    pub fn add(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();

        let mut start = 0usize;
        for (pos, c) in self.buffer.char_indices() {
            if TERMINATORS.contains(&c) {
                let end = pos + c.len_utf8();
                sentences.push(self.buffer[start..end].to_string());
                start = end;
            }
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        sentences
    }

    /// Return whatever is still buffered and empty the buffer.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn peek(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.chars().count()
    }
}
