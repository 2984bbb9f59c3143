//! Title preprocessing for dedup comparison: full-width to half-width,
//! Chinese digit normalization, punctuation stripping, whitespace collapse.

use std::collections::HashSet;

/// Normalize a title for clustering comparison.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_space = true; // leading whitespace is dropped

    for ch in title.chars() {
        let ch = to_half_width(ch);
        let ch = normalize_cn_digit(ch);

        if ch.is_alphanumeric() || ch == '_' {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        } else if !last_was_space {
            // Punctuation and whitespace both collapse to a single separator.
            out.push(' ');
            last_was_space = true;
        }
    }

    out.trim_end().to_string()
}

/// Character-bigram Jaccard similarity between two normalized titles.
/// Titles shorter than one bigram score 0.0.
pub fn bigram_jaccard(a: &str, b: &str) -> f64 {
    let grams_a = bigrams(a);
    let grams_b = bigrams(b);

    if grams_a.is_empty() || grams_b.is_empty() {
        return 0.0;
    }

    let intersection = grams_a.intersection(&grams_b).count();
    let union = grams_a.union(&grams_b).count();
    intersection as f64 / union as f64
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Full-width ASCII and ideographic space to their half-width forms.
fn to_half_width(ch: char) -> char {
    match ch as u32 {
        0x3000 => ' ',
        code @ 0xFF01..=0xFF5E => {
            char::from_u32(code - 0xFEE0).expect("range maps into printable ASCII")
        }
        _ => ch,
    }
}

/// Common Chinese numerals to ASCII digits. Positional characters
/// (十/百/千) are left alone to avoid mangling dates.
fn normalize_cn_digit(ch: char) -> char {
    match ch {
        '〇' | '零' => '0',
        '一' => '1',
        '二' | '两' => '2',
        '三' => '3',
        '四' => '4',
        '五' => '5',
        '六' => '6',
        '七' => '7',
        '八' => '8',
        '九' => '9',
        _ => ch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation() {
        assert_eq!(normalize_title("王传君：获东京电影节影帝！"), "王传君 获东京电影节影帝");
    }

    #[test]
    fn normalize_full_width_ascii() {
        assert_eq!(normalize_title("ＡＢＣ１２３"), "abc123");
    }

    #[test]
    fn normalize_cn_digits() {
        assert_eq!(normalize_title("三胎政策"), "3胎政策");
        assert_eq!(normalize_title("两会召开"), "2会召开");
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_title("  hello　　world  "), "hello world");
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize_title("NBA总决赛"), "nba总决赛");
    }

    #[test]
    fn normalize_empty() {
        assert_eq!(normalize_title(""), "");
        assert_eq!(normalize_title("！？。"), "");
    }

    #[test]
    fn jaccard_identical_titles() {
        let a = normalize_title("王传君获东京电影节影帝");
        assert!((bigram_jaccard(&a, &a) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn jaccard_disjoint_titles() {
        assert_eq!(bigram_jaccard("房价上涨", "球队夺冠"), 0.0);
    }

    #[test]
    fn jaccard_partial_overlap() {
        let a = normalize_title("王传君获东京电影节影帝");
        let b = normalize_title("王传君东京电影节夺奖");
        let sim = bigram_jaccard(&a, &b);
        assert!(sim > 0.3 && sim < 1.0, "partial overlap, got {sim}");
    }

    #[test]
    fn jaccard_short_strings() {
        assert_eq!(bigram_jaccard("a", "a"), 0.0);
        assert_eq!(bigram_jaccard("", "abc"), 0.0);
    }
}
