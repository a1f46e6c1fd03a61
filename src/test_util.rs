/// Byte-slice equality that reports a context window around the first
/// mismatch instead of dumping megabytes of payload.
#[macro_export]
macro_rules! assert_bytes_eq {
    ($left:expr, $right:expr) => {{
        let left = &$left[..];
        let right = &$right[..];
        if left.len() != right.len() {
            panic!(
                "byte slices differ in length: left {} vs right {}",
                left.len(),
                right.len()
            );
        }
        if let Some(i) = left.iter().zip(right.iter()).position(|(a, b)| a != b) {
            let start = i.saturating_sub(16);
            let end = (i + 16).min(left.len());
            panic!(
                "byte slices differ at index {}\n  left:  {:02x?}\n  right: {:02x?}",
                i,
                &left[start..end],
                &right[start..end]
            );
        }
    }};
}
