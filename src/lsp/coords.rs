//! Column translation between the editor's code-point columns and the
//! UTF-16 code-unit columns the protocol requires.

/// Number of UTF-16 code units in the first `char_index` code points of `line`.
///
/// An index past the end of the line is clamped to the line length.
pub fn utf16_index(line: &str, char_index: usize) -> usize {
    line.chars().take(char_index).map(char::len_utf16).sum()
}

/// Code-point index in `line` that contains the given UTF-16 offset.
///
/// An offset that lands inside a surrogate pair resolves to the character
/// owning that pair. Offsets past the end clamp to the line length.
pub fn char_index_from_utf16(line: &str, utf16_offset: usize) -> usize {
    let mut units = 0;
    for (index, ch) in line.chars().enumerate() {
        units += ch.len_utf16();
        if units > utf16_offset {
            return index;
        }
    }
    line.chars().count()
}
