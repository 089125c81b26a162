//! Input chunking for oversized calls.
//!
//! Input text longer than the threshold is split into overlapping character
//! windows. Consecutive chunks share exactly `overlap_chars` characters, so
//! the chunks cover the original text with only the overlap duplicated.
//! Chunks are an internal artifact of one call and are never persisted.

/// Configuration for input chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkConfig {
    /// Input longer than this many characters is chunked.
    pub threshold_chars: usize,
    /// Target chunk size in characters.
    pub chunk_chars: usize,
    /// Characters shared by consecutive chunks.
    pub overlap_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            threshold_chars: 60_000,
            chunk_chars: 40_000,
            overlap_chars: 2_000,
        }
    }
}

impl ChunkConfig {
    pub fn new(threshold_chars: usize, chunk_chars: usize, overlap_chars: usize) -> Self {
        Self {
            threshold_chars,
            chunk_chars,
            overlap_chars,
        }
    }

    pub fn needs_chunking(&self, text: &str) -> bool {
        text.chars().count() > self.threshold_chars
    }

    fn chunk_size(&self) -> usize {
        self.chunk_chars.max(1)
    }

    /// Overlap clamped below the chunk size so every step makes progress.
    fn overlap(&self) -> usize {
        self.overlap_chars.min(self.chunk_size() / 2)
    }
}

/// A window of the input text. Offsets are in characters.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split `content` into overlapping chunks.
///
/// A window ends on whitespace when one is found in its last tenth, so
/// chunks rarely split a word. Returns a single chunk when the content fits
/// in one window and no chunks for empty content.
pub fn chunk_text(content: &str, config: &ChunkConfig) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }

    // Byte offset of every char boundary, plus the end
    let mut bounds: Vec<usize> = content.char_indices().map(|(i, _)| i).collect();
    bounds.push(content.len());
    let total = bounds.len() - 1;

    let size = config.chunk_size();
    let overlap = config.overlap();

    if total <= size {
        return vec![Chunk {
            index: 0,
            start: 0,
            end: total,
            text: content.to_string(),
        }];
    }

    let chars: Vec<char> = content.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let mut end = (start + size).min(total);

        if end < total {
            let floor = (end - size / 10).max(start + overlap + 1);
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws + 1;
            }
        }

        chunks.push(Chunk {
            index: chunks.len(),
            start,
            end,
            text: content[bounds[start]..bounds[end]].to_string(),
        });

        if end >= total {
            break;
        }
        start = end - overlap;
    }

    chunks
}
