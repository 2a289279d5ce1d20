use std::ascii;

/// Renders arbitrary bytes as a printable string for log output, escaping
/// anything outside the printable ASCII range.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    String::from_utf8(
        input
            .iter()
            .flat_map(|&c| ascii::escape_default(c))
            .collect::<Vec<u8>>(),
    )
    .unwrap()
}
