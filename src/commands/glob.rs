//! Glob matching for MMKEYS.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\x` escapes, on raw
//! bytes since keys need not be UTF-8.

/// A compiled-once KEYS pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern<'p> {
    pattern: &'p [u8],
}

impl<'p> GlobPattern<'p> {
    pub fn new(pattern: &'p [u8]) -> Self {
        Self { pattern }
    }

    /// A lone `*` matches everything; callers skip matching entirely.
    pub fn matches_all(&self) -> bool {
        self.pattern == b"*"
    }

    pub fn matches(&self, key: &[u8]) -> bool {
        match_from(self.pattern, key)
    }
}

/// Walks pattern and text together. On a mismatch the match restarts just
/// after the most recent `*`, consuming one more byte of text; every other
/// token matches exactly one byte, so earlier stars never need revisiting and
/// the walk is O(pattern × text).
fn match_from(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Pattern index after the last star, and the text index it resumes at.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                p += 1;
                star = Some((p, t));
                continue;
            }
            Some(_) => {
                if let Some(width) = match_token(&pattern[p..], text[t]) {
                    p += width;
                    t += 1;
                    continue;
                }
            }
            None => {}
        }
        let Some((after_star, resume)) = star else {
            return false;
        };
        p = after_star;
        t = resume + 1;
        star = Some((after_star, t));
    }
    pattern[p..].iter().all(|&b| b == b'*')
}

/// Matches the single non-star token at the head of `pattern` against `c`.
/// Returns the token's width in the pattern.
fn match_token(pattern: &[u8], c: u8) -> Option<usize> {
    match pattern {
        [b'?', ..] => Some(1),
        [b'[', body @ ..] => match match_class(body, c) {
            Some((true, after)) => Some(pattern.len() - after.len()),
            _ => None,
        },
        [b'\\', escaped, ..] => (*escaped == c).then_some(2),
        [literal, ..] => (*literal == c).then_some(1),
        [] => None,
    }
}

/// Matches `c` against the class body following `[`. Returns whether it
/// matched and the pattern after the closing `]`, or `None` if the class is
/// unterminated.
fn match_class(body: &[u8], c: u8) -> Option<(bool, &[u8])> {
    let (negate, mut i) = match body.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };

    let mut matched = false;
    while i < body.len() && body[i] != b']' {
        if body[i] == b'\\' && i + 1 < body.len() {
            matched |= body[i + 1] == c;
            i += 2;
        } else if i + 2 < body.len() && body[i + 1] == b'-' && body[i + 2] != b']' {
            let (lo, hi) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= body[i] == c;
            i += 1;
        }
    }

    if i >= body.len() {
        return None;
    }
    Some((matched != negate, &body[i + 1..]))
}
