//! Positional filters over candidate lists
//!
//! Two spellings are accepted after a selector step:
//! - bracketed: `[0]`, `[-1]`, `[1:3]`, `[0,2,4]`, `[::2]`, `[3:0]`, `[!0,1]`
//!   where ranges are `start:end:step` with an inclusive end
//! - legacy: `.0`, `.-1`, `.0:2:4` (a list of indices), `!0` (exclusion)
//!
//! Indices are resolved against the length of the list being filtered,
//! so negative indices count from that list's end.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Single(i64),
    Range {
        start: Option<i64>,
        end: Option<i64>,
        step: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSet {
    exclude: bool,
    entries: Vec<Entry>,
}

impl IndexSet {
    /// A set holding one index.
    pub fn single(index: i64) -> Self {
        Self {
            exclude: false,
            entries: vec![Entry::Single(index)],
        }
    }

    /// Parse the content of a `[...]` filter. `None` when it is not an
    /// index set (for instance a CSS attribute selector).
    pub fn parse_bracket(content: &str) -> Option<Self> {
        let content = content.trim();
        let (exclude, body) = match content.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, content),
        };
        if body.is_empty() {
            return None;
        }

        let mut entries = Vec::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.contains(':') {
                let mut bounds = part.split(':').map(str::trim);
                let start = parse_bound(bounds.next())?;
                let end = parse_bound(bounds.next())?;
                let step = parse_bound(bounds.next())?.unwrap_or(1);
                if bounds.next().is_some() {
                    return None;
                }
                entries.push(Entry::Range { start, end, step });
            } else {
                entries.push(Entry::Single(part.parse().ok()?));
            }
        }
        Some(Self { exclude, entries })
    }

    /// Parse the legacy `.0:2:4` / `!0` form; `marker` is `.` or `!`.
    pub fn parse_legacy(marker: char, list: &str) -> Option<Self> {
        let entries = list
            .split(':')
            .map(|p| p.trim().parse::<i64>().ok().map(Entry::Single))
            .collect::<Option<Vec<_>>>()?;
        if entries.is_empty() {
            return None;
        }
        Some(Self {
            exclude: marker == '!',
            entries,
        })
    }

    /// True for an inclusion set naming exactly one index.
    pub fn is_single(&self) -> bool {
        !self.exclude && matches!(self.entries.as_slice(), [Entry::Single(_)])
    }

    /// Indices this set names for a list of `len` items, in entry order
    /// and without duplicates.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        let len = len as i64;
        let mut out: Vec<usize> = Vec::new();
        let mut push = |i: i64| {
            if (0..len).contains(&i) && !out.contains(&(i as usize)) {
                out.push(i as usize);
            }
        };

        for entry in &self.entries {
            match *entry {
                Entry::Single(i) => push(resolve(i, len)),
                Entry::Range { start, end, step } => {
                    if len == 0 {
                        continue;
                    }
                    let start = start.map_or(0, |s| resolve(s, len)).clamp(0, len - 1);
                    let end = end.map_or(len - 1, |e| resolve(e, len)).clamp(0, len - 1);
                    let step = i64::try_from(step.unsigned_abs()).unwrap_or(i64::MAX).max(1);
                    let mut next = Some(start);
                    while let Some(i) = next {
                        if (start <= end && i > end) || (start > end && i < end) {
                            break;
                        }
                        push(i);
                        next = if start <= end {
                            i.checked_add(step)
                        } else {
                            i.checked_sub(step)
                        };
                    }
                }
            }
        }
        out
    }

    /// Filter `items`: an inclusion set picks items in the order it names
    /// them, an exclusion set keeps the original order minus its indices.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let picked = self.indices(items.len());
        if self.exclude {
            items
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !picked.contains(i))
                .map(|(_, item)| item)
                .collect()
        } else {
            let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
            picked.into_iter().filter_map(|i| slots[i].take()).collect()
        }
    }
}

fn parse_bound(part: Option<&str>) -> Option<Option<i64>> {
    match part {
        None | Some("") => Some(None),
        Some(p) => p.parse().ok().map(Some),
    }
}

fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn resolve(index: i64, len: i64) -> i64 {
    if index < 0 {
        len + index
    } else {
        index
    }
}

/// Split a trailing index filter off a selector step.
///
/// Recognizes a final `[...]` whose content is an index set, or a final
/// `.N[:N...]` / `!N[:N...]` legacy suffix.
pub fn split_index_suffix(step: &str) -> (&str, Option<IndexSet>) {
    let step = step.trim();

    if step.ends_with(']') {
        if let Some(open) = step.rfind('[') {
            if let Some(set) = IndexSet::parse_bracket(&step[open + 1..step.len() - 1]) {
                return (step[..open].trim_end(), Some(set));
            }
        }
        return (step, None);
    }

    if let Some(pos) = step.rfind(['.', '!']) {
        let suffix = &step[pos + 1..];
        if pos > 0 && suffix.split(':').all(is_integer) {
            let marker = step[pos..].chars().next().unwrap_or('.');
            if let Some(set) = IndexSet::parse_legacy(marker, suffix) {
                return (&step[..pos], Some(set));
            }
        }
    }
    (step, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five() -> Vec<usize> {
        (0..5).collect()
    }

    #[test]
    fn test_inclusive_range() {
        let set = IndexSet::parse_bracket("1:3").unwrap();
        assert_eq!(set.apply(five()), vec![1, 2, 3]);
    }

    #[test]
    fn test_negative_and_lists() {
        assert_eq!(IndexSet::parse_bracket("-1").unwrap().apply(five()), vec![4]);
        assert_eq!(IndexSet::parse_bracket("0, 2, -1").unwrap().apply(five()), vec![0, 2, 4]);
        assert_eq!(IndexSet::parse_bracket("-2:").unwrap().apply(five()), vec![3, 4]);
    }

    #[test]
    fn test_step_and_descending() {
        assert_eq!(IndexSet::parse_bracket("::2").unwrap().apply(five()), vec![0, 2, 4]);
        assert_eq!(IndexSet::parse_bracket("3:0").unwrap().apply(five()), vec![3, 2, 1, 0]);
        assert_eq!(IndexSet::parse_bracket("-1:0:2").unwrap().apply(five()), vec![4, 2, 0]);
    }

    #[test]
    fn test_exclusion() {
        assert_eq!(IndexSet::parse_legacy('!', "0").unwrap().apply(five()), vec![1, 2, 3, 4]);
        assert_eq!(IndexSet::parse_bracket("!0,-1").unwrap().apply(five()), vec![1, 2, 3]);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        assert_eq!(IndexSet::parse_bracket("7").unwrap().apply(five()), Vec::<usize>::new());
        assert_eq!(IndexSet::parse_bracket("3:10").unwrap().apply(five()), vec![3, 4]);
        assert!(IndexSet::single(0).apply(Vec::<usize>::new()).is_empty());
    }

    #[test]
    fn test_single_index_sets() {
        assert!(IndexSet::single(-1).is_single());
        assert!(IndexSet::parse_legacy('.', "2").unwrap().is_single());
        assert!(!IndexSet::parse_legacy('.', "0:2").unwrap().is_single());
        assert!(!IndexSet::parse_bracket("!0").unwrap().is_single());
        assert!(!IndexSet::parse_bracket("0:0").unwrap().is_single());
    }

    #[test]
    fn test_extreme_steps() {
        let huge = IndexSet::parse_bracket("1::9223372036854775807").unwrap();
        assert_eq!(huge.apply(five()), vec![1]);
        let min = IndexSet::parse_bracket("::-9223372036854775808").unwrap();
        assert_eq!(min.apply(five()), vec![0]);
        let down = IndexSet::parse_bracket("4:0:-9223372036854775808").unwrap();
        assert_eq!(down.apply(five()), vec![4]);
        assert_eq!(IndexSet::parse_bracket("-9223372036854775808").unwrap().apply(five()), Vec::<usize>::new());
    }

    #[test]
    fn test_not_an_index_set() {
        assert!(IndexSet::parse_bracket("href").is_none());
        assert!(IndexSet::parse_bracket("data-id=\"3\"").is_none());
        assert!(IndexSet::parse_bracket("").is_none());
    }

    #[test]
    fn test_split_index_suffix() {
        let (name, set) = split_index_suffix("tag.li.2");
        assert_eq!(name, "tag.li");
        assert_eq!(set.unwrap().apply(five()), vec![2]);

        let (name, set) = split_index_suffix("class.item!0");
        assert_eq!(name, "class.item");
        assert_eq!(set.unwrap().apply(five()), vec![1, 2, 3, 4]);

        let (name, set) = split_index_suffix("tag.li[1:3]");
        assert_eq!(name, "tag.li");
        assert!(set.is_some());

        let (name, set) = split_index_suffix("a[href]");
        assert_eq!(name, "a[href]");
        assert!(set.is_none());

        let (name, set) = split_index_suffix("class.item");
        assert_eq!(name, "class.item");
        assert!(set.is_none());

        let (name, set) = split_index_suffix("tag.td.-1");
        assert_eq!(name, "tag.td");
        assert_eq!(set.unwrap().apply(five()), vec![4]);
    }
}
