/// Overlapping text chunks for embedding.
///
/// Word-boundary windows: a chunk grows until it would exceed `chunk_size`
/// characters, then the next chunk restarts with roughly `chunk_overlap`
/// characters of trailing context. Defaults (1000/200) come from the index
/// configuration.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size / 2);

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let total_len: usize = words.iter().map(|w| w.len() + 1).sum();
    if total_len <= chunk_size {
        return vec![words.join(" ")];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < words.len() {
        let mut end = start;
        let mut len = 0usize;
        while end < words.len() {
            let add = words[end].len() + usize::from(len > 0);
            if len + add > chunk_size && len > 0 {
                break;
            }
            len += add;
            end += 1;
        }

        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }

        // Walk back from the cut until the overlap budget is spent.
        let mut overlap_len = 0usize;
        let mut overlap_start = end;
        while overlap_start > start + 1 {
            let candidate = words[overlap_start - 1].len() + 1;
            if overlap_len + candidate > chunk_overlap {
                break;
            }
            overlap_len += candidate;
            overlap_start -= 1;
        }
        start = overlap_start.max(start + 1);
    }

    chunks
}
