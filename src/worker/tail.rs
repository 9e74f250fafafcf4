use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Characters of each output stream kept on the job row.
pub const TAIL_CHARS: usize = 2000;

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    text.char_indices()
        .nth(count - max_chars)
        .map_or("", |(start, _)| &text[start..])
}

/// Read the trailing `max_chars` characters of a log file without loading all of it.
///
/// Invalid UTF-8 is replaced rather than rejected; job output is not guaranteed
/// to be text.
pub async fn read_tail(path: &Path, max_chars: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    // A UTF-8 character is at most four bytes.
    let window = (max_chars as u64).saturating_mul(4);
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;

    // Drop continuation bytes of a character cut by the window.
    let skip = if start > 0 {
        buf.iter().take_while(|b| (**b & 0xC0) == 0x80).count()
    } else {
        0
    };
    let text = String::from_utf8_lossy(&buf[skip..]);
    Ok(tail_chars(&text, max_chars).to_string())
}
