/// Target chunk size in characters
pub const CHUNK_SIZE: usize = 1000;
/// Characters carried over from the end of one chunk to the start of the next
pub const CHUNK_OVERLAP: usize = 200;

/// Split text into chunks of approximately `CHUNK_SIZE` characters.
///
/// Lines are accumulated whole; a line is never split, so a single line longer
/// than the target produces an oversized chunk. Each emitted chunk longer than
/// `CHUNK_OVERLAP` seeds the next one with its last `CHUNK_OVERLAP` characters.
/// Always returns at least one chunk.
pub fn split_into_chunks(text: &str) -> Vec<String> {
    split_with(text, CHUNK_SIZE, CHUNK_OVERLAP)
}

fn split_with(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();
    // Length of current_chunk in chars
    let mut current_len = 0;

    // Lines keep their trailing '\n' so the chunks reassemble into the input
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();

        if current_len + line_len > chunk_size && !current_chunk.is_empty() {
            chunks.push(current_chunk.clone());

            if current_len > overlap {
                current_chunk = tail_chars(&current_chunk, overlap).to_string();
                current_len = overlap;
            } else {
                current_chunk.clear();
                current_len = 0;
            }
        }

        current_chunk.push_str(line);
        current_len += line_len;
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    if chunks.is_empty() {
        return vec![text.to_string()];
    }

    chunks
}

/// The last `n` characters of `s`, on a char boundary
fn tail_chars(s: &str, n: usize) -> &str {
    let start = s
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}
