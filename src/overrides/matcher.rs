use super::RateLimitOverride;

/// Match `text` against a pattern where `*` matches zero-or-more characters.
/// No other metacharacters. Iterative greedy scan with backtracking to the
/// last star; linear in `len(pattern) + len(text)` for real-world patterns.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            // Let the star absorb one more character and retry.
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Pick the override whose pattern wins for `identifier`.
///
/// Precedence: an exact literal match beats any wildcard; among wildcards the
/// fewest `*` wins, then the longest literal prefix, then the
/// lexicographically smallest pattern. Deterministic for a given override
/// set.
pub fn select_override<'a>(
    overrides: &'a [RateLimitOverride],
    identifier: &str,
) -> Option<&'a RateLimitOverride> {
    let mut best: Option<(&'a RateLimitOverride, usize, usize)> = None;

    for ov in overrides {
        let stars = ov.identifier.bytes().filter(|&b| b == b'*').count();

        if stars == 0 {
            if ov.identifier == identifier {
                return Some(ov);
            }
            continue;
        }

        if !wildcard_match(&ov.identifier, identifier) {
            continue;
        }

        let prefix = ov
            .identifier
            .find('*')
            .unwrap_or(ov.identifier.len());

        let better = match best {
            None => true,
            Some((cur, cur_stars, cur_prefix)) => {
                (stars, std::cmp::Reverse(prefix), ov.identifier.as_str())
                    < (cur_stars, std::cmp::Reverse(cur_prefix), cur.identifier.as_str())
            }
        };
        if better {
            best = Some((ov, stars, prefix));
        }
    }

    best.map(|(ov, _, _)| ov)
}
