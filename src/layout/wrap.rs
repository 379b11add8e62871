use super::font::TextMeasure;

/// Greedy word wrap against a pixel budget.
///
/// Words are never split: a word wider than `max_width` ends up alone on its
/// own line. Always yields at least one line; blank input gives a single
/// empty line.
pub fn wrap_words(
    text: &str,
    font_size: f32,
    max_width: f32,
    measure: &dyn TextMeasure,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        let candidate = format!("{} {}", current, word);
        if measure.text_width(&candidate, font_size) <= max_width {
            current = candidate;
        } else {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(text.trim().to_string());
    }
    lines
}
