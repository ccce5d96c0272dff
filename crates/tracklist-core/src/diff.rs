//! Minimal edit scripts between two ordered sequences.
//!
//! Longest-common-subsequence over whole items. The common prefix and suffix
//! are trimmed before the quadratic table is filled, so small edits to long
//! playlists stay cheap. Ties prefer deleting from the current sequence before
//! inserting from the desired one, which keeps the output deterministic.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp<T> {
    Remove { index: usize, count: usize },
    Insert { index: usize, items: Vec<T> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("remove of {count} at {index} runs past length {len}")]
    RemoveOutOfRange {
        index: usize,
        count: usize,
        len: usize,
    },
    #[error("insert at {index} is past length {len}")]
    InsertOutOfRange { index: usize, len: usize },
}

impl<T: Clone> EditOp<T> {
    pub fn apply_to(&self, seq: &mut Vec<T>) -> Result<(), ScriptError> {
        match self {
            EditOp::Remove { index, count } => {
                let end = index
                    .checked_add(*count)
                    .filter(|end| *end <= seq.len())
                    .ok_or(ScriptError::RemoveOutOfRange {
                        index: *index,
                        count: *count,
                        len: seq.len(),
                    })?;
                seq.drain(*index..end);
            }
            EditOp::Insert { index, items } => {
                if *index > seq.len() {
                    return Err(ScriptError::InsertOutOfRange {
                        index: *index,
                        len: seq.len(),
                    });
                }
                seq.splice(*index..*index, items.iter().cloned());
            }
        }
        Ok(())
    }
}

/// Operations to apply in order. Each index refers to the sequence as left by
/// the operations before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditScript<T> {
    ops: Vec<EditOp<T>>,
}

impl<T> Default for EditScript<T> {
    fn default() -> Self {
        Self { ops: Vec::new() }
    }
}

impl<T> EditScript<T> {
    pub fn ops(&self) -> &[EditOp<T>] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<EditOp<T>> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<T: Clone> EditScript<T> {
    pub fn apply_to(&self, seq: &mut Vec<T>) -> Result<(), ScriptError> {
        self.ops.iter().try_for_each(|op| op.apply_to(seq))
    }

    /// Renders the script one item per line against the sequence it was
    /// computed from: `-<index> <item>` for removals, `+<index> <item>` for
    /// insertions.
    pub fn listing<'a>(&'a self, base: &'a [T]) -> Listing<'a, T> {
        Listing { script: self, base }
    }
}

pub struct Listing<'a, T> {
    script: &'a EditScript<T>,
    base: &'a [T],
}

impl<T: Clone + fmt::Display> fmt::Display for Listing<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seq = self.base.to_vec();
        for op in &self.script.ops {
            match op {
                EditOp::Remove { index, count } => {
                    for (offset, item) in seq.iter().skip(*index).take(*count).enumerate() {
                        writeln!(f, "-{} {}", index + offset, item)?;
                    }
                }
                EditOp::Insert { index, items } => {
                    for (offset, item) in items.iter().enumerate() {
                        writeln!(f, "+{} {}", index + offset, item)?;
                    }
                }
            }
            if op.apply_to(&mut seq).is_err() {
                return writeln!(f, "! script does not apply");
            }
        }
        Ok(())
    }
}

/// Reusable table storage. Owned by the loop thread for the whole process.
#[derive(Debug, Default)]
pub struct DiffScratch {
    table: Vec<u32>,
}

impl DiffScratch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }
}

pub fn compute<T: PartialEq + Clone>(current: &[T], desired: &[T]) -> EditScript<T> {
    compute_with(&mut DiffScratch::new(), current, desired)
}

pub fn compute_with<T: PartialEq + Clone>(
    scratch: &mut DiffScratch,
    current: &[T],
    desired: &[T],
) -> EditScript<T> {
    let prefix = current
        .iter()
        .zip(desired)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = current[prefix..]
        .iter()
        .rev()
        .zip(desired[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let a = &current[prefix..current.len() - suffix];
    let b = &desired[prefix..desired.len() - suffix];

    let mut builder = ScriptBuilder::new(prefix);
    if a.is_empty() || b.is_empty() {
        builder.remove(a.len());
        builder.insert(b);
        return builder.finish();
    }

    // lcs[i][j] = length of the LCS of a[i..] and b[j..]
    let width = b.len() + 1;
    let table = &mut scratch.table;
    table.clear();
    table.resize((a.len() + 1) * width, 0);
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            builder.keep();
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            builder.remove(1);
            i += 1;
        } else {
            builder.insert(&b[j..j + 1]);
            j += 1;
        }
    }
    builder.remove(a.len() - i);
    builder.insert(&b[j..]);
    builder.finish()
}

/// Accumulates one hunk at a time; a hunk becomes a Remove followed by an
/// Insert at the same position.
struct ScriptBuilder<T> {
    ops: Vec<EditOp<T>>,
    position: usize,
    removed: usize,
    inserted: Vec<T>,
}

impl<T: Clone> ScriptBuilder<T> {
    fn new(position: usize) -> Self {
        Self {
            ops: Vec::new(),
            position,
            removed: 0,
            inserted: Vec::new(),
        }
    }

    fn remove(&mut self, count: usize) {
        self.removed += count;
    }

    fn insert(&mut self, items: &[T]) {
        self.inserted.extend_from_slice(items);
    }

    fn keep(&mut self) {
        self.flush();
        self.position += 1;
    }

    fn flush(&mut self) {
        if self.removed > 0 {
            self.ops.push(EditOp::Remove {
                index: self.position,
                count: self.removed,
            });
            self.removed = 0;
        }
        if !self.inserted.is_empty() {
            let items = std::mem::take(&mut self.inserted);
            let index = self.position;
            self.position += items.len();
            self.ops.push(EditOp::Insert { index, items });
        }
    }

    fn finish(mut self) -> EditScript<T> {
        self.flush();
        EditScript { ops: self.ops }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn applied(current: &[char], desired: &[char]) -> Vec<char> {
        let mut seq = current.to_vec();
        compute(current, desired).apply_to(&mut seq).unwrap();
        seq
    }

    fn cost(script: &EditScript<char>) -> usize {
        script
            .ops()
            .iter()
            .map(|op| match op {
                EditOp::Remove { count, .. } => *count,
                EditOp::Insert { items, .. } => items.len(),
            })
            .sum()
    }

    #[test]
    fn drops_middle_and_appends() {
        let script = compute(&chars("ABC"), &chars("ACD"));
        assert_eq!(
            script.ops(),
            &[
                EditOp::Remove { index: 1, count: 1 },
                EditOp::Insert {
                    index: 2,
                    items: vec!['D']
                },
            ]
        );
        assert_eq!(applied(&chars("ABC"), &chars("ACD")), chars("ACD"));
    }

    #[test]
    fn empty_sides_produce_a_single_operation() {
        assert_eq!(
            compute(&[], &chars("XYZ")).into_ops(),
            vec![EditOp::Insert {
                index: 0,
                items: chars("XYZ")
            }]
        );
        assert_eq!(
            compute(&chars("XYZ"), &[]).into_ops(),
            vec![EditOp::Remove { index: 0, count: 3 }]
        );
        assert!(compute::<char>(&[], &[]).is_empty());
    }

    #[test]
    fn hunks_account_for_earlier_operations() {
        let current = chars("ABCDEF");
        let desired = chars("XBCYF");
        let script = compute(&current, &desired);
        assert_eq!(
            script.ops(),
            &[
                EditOp::Remove { index: 0, count: 1 },
                EditOp::Insert {
                    index: 0,
                    items: vec!['X']
                },
                EditOp::Remove { index: 3, count: 2 },
                EditOp::Insert {
                    index: 3,
                    items: vec!['Y']
                },
            ]
        );
        assert_eq!(applied(&current, &desired), desired);
    }

    #[test]
    fn repeated_items_stay_polynomial() {
        let current = vec!['a'; 400];
        let mut desired = vec!['a'; 399];
        desired.insert(200, 'b');
        let script = compute(&current, &desired);
        assert_eq!(cost(&script), 2);
        assert_eq!(applied(&current, &desired), desired);
    }

    #[test]
    fn scratch_is_reused_across_calls() {
        let mut scratch = DiffScratch::new();
        compute_with(&mut scratch, &chars("ABCDEFGH"), &chars("HGFEDCBA"));
        let grown = scratch.capacity();
        assert!(grown > 0);
        compute_with(&mut scratch, &chars("ABCD"), &chars("DCBA"));
        assert_eq!(scratch.capacity(), grown);
    }

    #[test]
    fn listing_names_each_item() {
        let current = chars("ABC");
        let script = compute(&current, &chars("ACD"));
        assert_eq!(script.listing(&current).to_string(), "-1 B\n+2 D\n");
    }

    #[test]
    fn out_of_range_operations_are_refused() {
        let mut seq = chars("AB");
        assert_eq!(
            EditOp::<char>::Remove { index: 1, count: 2 }.apply_to(&mut seq),
            Err(ScriptError::RemoveOutOfRange {
                index: 1,
                count: 2,
                len: 2
            })
        );
        assert!(EditOp::Insert {
            index: 3,
            items: vec!['C']
        }
        .apply_to(&mut seq)
        .is_err());
        assert_eq!(seq, chars("AB"));
    }

    fn lcs_len(a: &[u8], b: &[u8]) -> usize {
        let mut row = vec![0usize; b.len() + 1];
        for x in a {
            let mut diag = 0;
            for (j, y) in b.iter().enumerate() {
                let above = row[j + 1];
                row[j + 1] = if x == y { diag + 1 } else { above.max(row[j]) };
                diag = above;
            }
        }
        row[b.len()]
    }

    // A small alphabet forces plenty of duplicates.
    fn tokens() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0u8..4, 0..24)
    }

    proptest! {
        #[test]
        fn script_transforms_current_into_desired(current in tokens(), desired in tokens()) {
            let mut seq = current.clone();
            compute(&current, &desired).apply_to(&mut seq).unwrap();
            prop_assert_eq!(seq, desired);
        }

        #[test]
        fn script_is_minimal(current in tokens(), desired in tokens()) {
            let script = compute(&current, &desired);
            let edits: usize = script.ops().iter().map(|op| match op {
                EditOp::Remove { count, .. } => *count,
                EditOp::Insert { items, .. } => items.len(),
            }).sum();
            let lcs = lcs_len(&current, &desired);
            prop_assert_eq!(edits, current.len() + desired.len() - 2 * lcs);
        }

        #[test]
        fn script_is_deterministic(current in tokens(), desired in tokens()) {
            let mut scratch = DiffScratch::new();
            let first = compute_with(&mut scratch, &current, &desired);
            let second = compute_with(&mut scratch, &current, &desired);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn identical_sequences_need_no_edits(seq in tokens()) {
            prop_assert!(compute(&seq, &seq).is_empty());
        }
    }
}
