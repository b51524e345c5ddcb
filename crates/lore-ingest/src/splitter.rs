//! Recursive character splitting. Separators are tried from coarsest to
//! finest (paragraph breaks down to CJK sentence punctuation, then spaces,
//! then single characters); pieces still over the budget recurse with the
//! remaining separators, and adjacent pieces are merged greedily with an
//! overlap tail carried into the next chunk.

const SEPARATORS: &[&str] = &["\n\n", "\n", "。", "！", "？", "；", "，", " ", ""];

pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // The empty separator matches everything, so a separator is always
        // found; it splits into single characters as the last resort.
        let mut separator = *separators.last().unwrap_or(&"");
        let mut remaining: &[&str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let splits: Vec<String> = if separator.is_empty() {
            text.chars().map(|c| c.to_string()).collect()
        } else {
            text.split(separator).map(str::to_string).collect()
        };

        let mut pieces: Vec<String> = Vec::new();
        for piece in splits {
            if char_len(&piece) < self.chunk_size {
                pieces.push(piece);
            } else if !remaining.is_empty() {
                pieces.extend(self.split_with(&piece, remaining));
            } else {
                pieces.push(piece);
            }
        }

        self.merge(pieces, separator)
    }

    /// Greedy merge: join pieces with the separator while the running
    /// length stays within the budget; on flush, keep a tail of at most
    /// `chunk_overlap` characters as the start of the next chunk.
    fn merge(&self, pieces: Vec<String>, separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_len = 0usize;

        for piece in pieces {
            if piece.is_empty() {
                continue;
            }
            let piece_len = char_len(&piece);
            let join_cost = if current_len > 0 { sep_len } else { 0 };

            if current_len + piece_len + join_cost > self.chunk_size {
                if !current.is_empty() {
                    let chunk = current.join(separator).trim().to_string();
                    if !chunk.is_empty() {
                        chunks.push(chunk);
                    }
                    // Drop from the front until what remains fits the
                    // overlap budget; it seeds the next chunk.
                    while current_len > self.chunk_overlap && !current.is_empty() {
                        current_len =
                            current_len.saturating_sub(char_len(&current.remove(0)) + sep_len);
                    }
                }
            }

            current_len += piece_len + if current_len > 0 { sep_len } else { 0 };
            current.push(piece);
        }

        if !current.is_empty() {
            let chunk = current.join(separator).trim().to_string();
            if !chunk.is_empty() {
                chunks.push(chunk);
            }
        }
        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let splitter = TextSplitter::new(500, 50);
        let chunks = splitter.split("Hello world. 你好世界。");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("Hello world"));
        assert!(chunks[0].contains("你好世界"));
    }

    #[test]
    fn paragraphs_split_before_sentences() {
        let splitter = TextSplitter::new(20, 0);
        let text = "first paragraph here\n\nsecond paragraph text\n\nthird one";
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
    }

    #[test]
    fn cjk_sentence_punctuation_is_honored() {
        let splitter = TextSplitter::new(12, 0);
        let text = "这是第一句话。这是第二句话。这是第三句话。";
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 12, "oversized: {}", chunk);
        }
    }

    #[test]
    fn overlap_carries_a_tail_forward() {
        let splitter = TextSplitter::new(12, 6);
        let text = "aaaa bbbb cccc dddd eeee";
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 2);
        // some suffix of each chunk reappears at the start of the next
        for window in chunks.windows(2) {
            let (prev, next) = (&window[0], &window[1]);
            let shared = prev
                .split_whitespace()
                .filter(|w| next.starts_with(w) || next.contains(*w))
                .count();
            assert!(shared > 0, "no overlap between {:?} and {:?}", prev, next);
        }
    }

    #[test]
    fn zero_overlap_never_repeats_content() {
        let splitter = TextSplitter::new(10, 0);
        let text = "one two three four five six seven eight";
        let chunks = splitter.split(text);
        let rejoined = chunks.join(" ");
        for word in text.split_whitespace() {
            let in_text = text.matches(word).count();
            let in_chunks = rejoined.matches(word).count();
            assert!(in_chunks <= in_text + 1);
        }
    }

    #[test]
    fn boundary_configs_stay_valid() {
        let tight = TextSplitter::new(100, 0);
        let loose = TextSplitter::new(2000, 500);
        let text = "word ".repeat(600);
        let tight_chunks = tight.split(&text);
        let loose_chunks = loose.split(&text);
        assert!(tight_chunks.iter().all(|c| c.chars().count() <= 100));
        assert!(loose_chunks.iter().all(|c| c.chars().count() <= 2000));
        assert!(tight_chunks.len() > loose_chunks.len());
    }

    #[test]
    fn oversized_unbreakable_runs_fall_to_char_split() {
        let splitter = TextSplitter::new(10, 0);
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = splitter.split(text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let splitter = TextSplitter::new(500, 50);
        assert!(splitter.split("").is_empty());
        assert!(splitter.split("   \n\n  ").is_empty());
    }
}
