/// Redis-style glob match supporting `*`, `?` and `\` escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                    p += 2;
                    t += 1;
                    continue;
                }
                c if c != '\\' && c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn matches_lock_family_patterns() {
        assert!(glob_match("user_bot_*_lock", "user_bot_42_lock"));
        assert!(glob_match("user_bot_*_lock", "user_bot_a_b_lock"));
        assert!(!glob_match("user_bot_*_lock", "user_bot_42_messages"));
        assert!(!glob_match("user_bot_*_lock", "user_other_42_lock"));
    }

    #[test]
    fn supports_single_char_and_escapes() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match(r"a\*c", "a*c"));
        assert!(!glob_match(r"a\*c", "abc"));
        assert!(glob_match("*", ""));
    }
}
