//! `LIKE` patterns compiled to regular expressions.

use kestrel_core::BasicError;
use regex::Regex;
use std::collections::HashMap;

/// Compiled patterns kept before the cache starts over.
pub const PATTERN_CACHE_LIMIT: usize = 256;

/// Per-engine state that would otherwise be global: compiled `LIKE`
/// patterns keyed by source text and comparison mode.
#[derive(Debug, Default)]
pub struct EngineContext {
    patterns: HashMap<(String, bool), Regex>,
}

impl EngineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn like(&mut self, text: &str, pattern: &str, compare_text: bool) -> Result<bool, BasicError> {
        let key = (pattern.to_string(), compare_text);
        if let Some(re) = self.patterns.get(&key) {
            return Ok(re.is_match(text));
        }
        let re = compile(pattern, compare_text)?;
        let matched = re.is_match(text);
        if self.patterns.len() >= PATTERN_CACHE_LIMIT {
            self.patterns.clear();
        }
        self.patterns.insert(key, re);
        Ok(matched)
    }

    pub fn cached_patterns(&self) -> usize {
        self.patterns.len()
    }
}

/// Translate `?`, `*`, `#`, `[list]` and `[!list]` into an anchored regex.
fn compile(pattern: &str, compare_text: bool) -> Result<Regex, BasicError> {
    let mut re = String::from(if compare_text { "(?is)^" } else { "(?s)^" });
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '?' => re.push('.'),
            '*' => re.push_str(".*"),
            '#' => re.push_str("[0-9]"),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                let mut first = true;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '!' if first => class.push('^'),
                        '-' => class.push('-'),
                        '\\' | '^' | '[' | '&' | '~' => {
                            class.push('\\');
                            class.push(c);
                        }
                        _ => class.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err(BasicError::InvalidPattern);
                }
                // `[!]` is a literal `!`; `[]` matches nothing in particular
                // and is dropped.
                if class == "^" {
                    re.push('!');
                } else if !class.is_empty() {
                    re.push('[');
                    re.push_str(&class);
                    re.push(']');
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|_| BasicError::InvalidPattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn like(text: &str, pattern: &str) -> bool {
        EngineContext::new().like(text, pattern, false).unwrap()
    }

    #[test]
    fn wildcards() {
        assert!(like("aBBBa", "a*a"));
        assert!(like("F", "[A-Z]"));
        assert!(!like("F", "[!A-Z]"));
        assert!(like("a2a", "a#a"));
        assert!(like("BAT123khg", "B?T*"));
        assert!(!like("CAT123khg", "B?T*"));
        assert!(like("a.b", "a.b"));
        assert!(!like("axb", "a.b"));
    }

    #[test]
    fn bang_alone_in_a_list_is_literal() {
        assert!(like("a!", "a[!]"));
        assert!(!like("ab", "a[!]"));
        assert!(like("ab", "a[!!]"));
    }

    #[test]
    fn compare_mode_is_part_of_the_key() {
        let mut ctx = EngineContext::new();
        assert!(!ctx.like("ABC", "abc", false).unwrap());
        assert!(ctx.like("ABC", "abc", true).unwrap());
        assert!(ctx.like("abc", "abc", false).unwrap());
        assert_eq!(ctx.cached_patterns(), 2);
    }

    #[test]
    fn generated_patterns_do_not_grow_the_cache() {
        let mut ctx = EngineContext::new();
        for i in 0..10_000 {
            assert!(ctx.like(&format!("x{i}y"), &format!("*{i}*"), false).unwrap());
        }
        assert!(ctx.cached_patterns() <= PATTERN_CACHE_LIMIT);
        assert!(ctx.cached_patterns() > 0);
    }

    #[test]
    fn unterminated_list_is_invalid() {
        assert_eq!(
            EngineContext::new().like("a", "[abc", false),
            Err(BasicError::InvalidPattern)
        );
    }
}
