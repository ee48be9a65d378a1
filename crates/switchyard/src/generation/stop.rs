/// Trim trailing stop sequences, longest first, until none matches. Returns the
/// trimmed text and whether anything was removed.
pub fn trim_stop_sequences(text: &str, stops: &[String]) -> (String, bool) {
    let mut sorted: Vec<&str> = stops
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();
    sorted.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut end = text.len();
    let mut matched = false;
    while let Some(stop) = sorted.iter().find(|s| text[..end].ends_with(**s)) {
        end -= stop.len();
        matched = true;
    }
    (text[..end].to_string(), matched)
}
