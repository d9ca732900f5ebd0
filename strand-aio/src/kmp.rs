//! Resumable Knuth–Morris–Pratt delimiter search.
//!
//! `read_until` commands keep one of these across drive passes: a delimiter
//! split across two network reads continues matching from the partial state
//! instead of rescanning, so the search stays O(n) over the life of the
//! command.

/// Incremental matcher for one delimiter over a growing window.
///
/// `scanned` is how far into the window the automaton has advanced; `matched`
/// is the length of the delimiter prefix currently matched at the scan point.
/// Both survive between calls, which is what makes split delimiters work.
pub struct DelimiterMatcher {
    delimiter: Vec<u8>,
    failure: Vec<usize>,
    scanned: usize,
    matched: usize,
}

impl DelimiterMatcher {
    pub fn new(delimiter: &[u8]) -> DelimiterMatcher {
        DelimiterMatcher {
            failure: failure_table(delimiter),
            delimiter: delimiter.to_vec(),
            scanned: 0,
            matched: 0,
        }
    }

    pub fn delimiter_len(&self) -> usize {
        self.delimiter.len()
    }

    /// Advance over `window`, which must be the same window as the previous
    /// call extended with newly arrived bytes. Returns the index one past the
    /// delimiter on a full match and resets the state for the next search.
    pub fn find(&mut self, window: &[u8]) -> Option<usize> {
        if self.delimiter.is_empty() {
            return Some(0);
        }
        while self.scanned < window.len() {
            let byte = window[self.scanned];
            while self.matched > 0 && byte != self.delimiter[self.matched] {
                self.matched = self.failure[self.matched - 1];
            }
            if byte == self.delimiter[self.matched] {
                self.matched += 1;
            }
            self.scanned += 1;
            if self.matched == self.delimiter.len() {
                let end = self.scanned;
                self.reset();
                return Some(end);
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.scanned = 0;
        self.matched = 0;
    }
}

fn failure_table(delimiter: &[u8]) -> Vec<usize> {
    let mut table = vec![0usize; delimiter.len()];
    let mut k = 0;
    for i in 1..delimiter.len() {
        while k > 0 && delimiter[i] != delimiter[k] {
            k = table[k - 1];
        }
        if delimiter[i] == delimiter[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_delimiter_in_one_window() {
        let mut m = DelimiterMatcher::new(b"\r\n");
        assert_eq!(m.find(b"hello\r\nworld"), Some(7));
    }

    #[test]
    fn no_match_reports_none() {
        let mut m = DelimiterMatcher::new(b"\r\n\r\n");
        assert_eq!(m.find(b"headers: going on"), None);
    }

    #[test]
    fn split_delimiter_matches_across_calls() {
        let mut m = DelimiterMatcher::new(b"\r\n\r\n");
        let mut window = b"abc\r\n".to_vec();
        assert_eq!(m.find(&window), None);
        window.extend_from_slice(b"\r");
        assert_eq!(m.find(&window), None);
        window.extend_from_slice(b"\n");
        assert_eq!(m.find(&window), Some(7));
    }

    #[test]
    fn self_overlapping_delimiter() {
        // "aab" inside "aaab": the failure table has to fall back rather than
        // skip the middle 'a'.
        let mut m = DelimiterMatcher::new(b"aab");
        assert_eq!(m.find(b"aaab"), Some(4));

        let mut m = DelimiterMatcher::new(b"abab");
        assert_eq!(m.find(b"abaabab!"), Some(7));
    }

    #[test]
    fn false_prefix_then_real_match_across_packets() {
        let mut m = DelimiterMatcher::new(b"\r\n.\r\n");
        let mut window = b"body\r\n.x".to_vec();
        assert_eq!(m.find(&window), None);
        window.extend_from_slice(b"\r\n.\r");
        assert_eq!(m.find(&window), None);
        window.extend_from_slice(b"\n");
        assert_eq!(m.find(&window), Some(13));
    }

    #[test]
    fn state_resets_after_match() {
        let mut m = DelimiterMatcher::new(b"\r\n");
        let window = b"a\r\nb\r\n";
        assert_eq!(m.find(window), Some(3));
        // Caller consumed the first line; the next search starts over on the
        // remaining window.
        assert_eq!(m.find(&window[3..]), Some(3));
    }
}
