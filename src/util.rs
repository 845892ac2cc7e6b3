//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Case-insensitive comparison after trimming outer whitespace.
/// Used for the local Reading shortcut and the offline grader.
pub fn same_answer(a: &str, b: &str) -> bool {
  a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Lowercase, strip punctuation and collapse whitespace.
/// "Hi,  there!" and "hi there" normalize to the same string.
pub fn normalize_sentence(s: &str) -> String {
  s.chars()
    .filter(|c| !c.is_ascii_punctuation())
    .collect::<String>()
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase()
}

/// Log-safe truncation for large strings.
/// Avoids spamming logs with huge request/response payloads.
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}
