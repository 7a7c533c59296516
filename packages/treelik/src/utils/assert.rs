#[macro_export]
macro_rules! pretty_assert_eq {
  ($left:expr, $right:expr) => {{
    pretty_assertions::assert_eq!(
      format!("{:#?}", $left).replace("\n", "\u{0085}"),
      format!("{:#?}", $right).replace("\n", "\u{0085}")
    );
  }};
}

/// Asserts that two float slices are equal bit for bit. NaN payloads and signed zeros are distinguished.
#[macro_export]
macro_rules! assert_bits_eq {
  ($left:expr, $right:expr) => {{
    let left: Vec<u64> = $left.iter().map(|x: &f64| x.to_bits()).collect();
    let right: Vec<u64> = $right.iter().map(|x: &f64| x.to_bits()).collect();
    pretty_assertions::assert_eq!(left, right);
  }};
}
