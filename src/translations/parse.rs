use serde::Serialize;

/// One `[k] text` entry recovered from an oracle reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NumberedEntry {
    pub index: usize,
    pub text: String,
}

/// Scans `[digits]` markers; each entry runs to the next marker or the end of
/// input. Text before the first marker is ignored, as are non-numeric
/// brackets such as `[Laughs]`, which stay part of the entry text.
pub fn parse_numbered_response(text: &str) -> Vec<NumberedEntry> {
    let bytes = text.as_bytes();
    let mut markers: Vec<(usize, usize, Option<usize>)> = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == b'['
            && let Some((end, index)) = read_marker(bytes, pos)
        {
            markers.push((pos, end, index));
            pos = end;
            continue;
        }
        pos += 1;
    }

    let mut entries = Vec::with_capacity(markers.len());
    for (slot, (_, body_start, index)) in markers.iter().enumerate() {
        let body_end = markers
            .get(slot + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(bytes.len());
        if let Some(index) = index {
            entries.push(NumberedEntry {
                index: *index,
                text: text[*body_start..body_end].trim().to_string(),
            });
        }
    }
    entries
}

/// Returns the byte offset just past `]` and the parsed index; an index too
/// large for `usize` still counts as a marker but yields `None`.
fn read_marker(bytes: &[u8], open: usize) -> Option<(usize, Option<usize>)> {
    let digits_start = open + 1;
    let mut cursor = digits_start;
    while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
        cursor += 1;
    }
    if cursor == digits_start || bytes.get(cursor) != Some(&b']') {
        return None;
    }
    // ASCII digits only, so this slice is valid UTF-8.
    let index = std::str::from_utf8(&bytes[digits_start..cursor])
        .ok()
        .and_then(|digits| digits.parse().ok());
    Some((cursor + 1, index))
}

/// Exactly `count` strings: slot `k` takes the first non-empty entry tagged
/// `[k]`; anything missing becomes `sentinel`. Out-of-range indices are
/// dropped.
pub fn complete_translations(
    entries: &[NumberedEntry],
    count: usize,
    sentinel: &str,
) -> Vec<String> {
    let mut slots: Vec<Option<String>> = vec![None; count];
    for entry in entries {
        if entry.index == 0 || entry.index > count || entry.text.is_empty() {
            continue;
        }
        let slot = &mut slots[entry.index - 1];
        if slot.is_none() {
            *slot = Some(entry.text.clone());
        }
    }
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| sentinel.to_string()))
        .collect()
}
