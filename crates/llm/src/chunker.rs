//! Groups streamed model tokens into speakable chunks

/// Sentence-boundary chunker for streamed model text
///
/// Emits at sentence punctuation followed by whitespace. Once the buffer
/// reaches `min_chars` without a sentence end, it is cut at the last clause
/// mark, or failing that the last word boundary.
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
    min_chars: usize,
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '।' | '॥' | '\n')
}

fn is_clause_mark(c: char) -> bool {
    matches!(c, ',' | ';' | ':')
}

impl SentenceChunker {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
        }
    }

    /// Add a token, returning any chunks it completed
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut chunks = Vec::new();

        while let Some(cut) = self.sentence_cut().or_else(|| self.length_cut()) {
            let rest = self.buffer.split_off(cut);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
        }
        chunks
    }

    /// Byte offset just past a sentence terminator that is followed by whitespace
    fn sentence_cut(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !is_sentence_end(c) {
                continue;
            }
            match chars.peek() {
                Some((_, next)) if next.is_whitespace() => return Some(i + c.len_utf8()),
                _ if c == '\n' => return Some(i + c.len_utf8()),
                _ => {}
            }
        }
        None
    }

    fn length_cut(&self) -> Option<usize> {
        if self.buffer.trim().chars().count() < self.min_chars.max(1) {
            return None;
        }
        let clause = self.buffer.char_indices().filter(|&(i, c)| {
            is_clause_mark(c)
                && self.buffer[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(false, char::is_whitespace)
        });
        if let Some((i, c)) = clause.last() {
            return Some(i + c.len_utf8());
        }
        self.buffer
            .trim_end()
            .rfind(char::is_whitespace)
            .filter(|&i| !self.buffer[..i].trim().is_empty())
    }

    /// Take whatever remains at stream end
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Drop buffered text
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}
