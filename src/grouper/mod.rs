//! Groups records into per-recipient batches.

use std::collections::HashMap;

use crate::types::{Batch, BatchKey, Record};

/// Partitions records into batches keyed by the raw (address, name) pair.
///
/// The first record seen for a key fixes that batch's position in the
/// output; later records for the same key are appended to it. Keys are
/// compared as raw strings: no trimming, no case folding, no validation.
pub fn group<I>(records: I) -> Vec<Batch>
where
    I: IntoIterator<Item = Record>,
{
    let mut batches: Vec<Batch> = Vec::new();
    let mut positions: HashMap<BatchKey, usize> = HashMap::new();

    for record in records {
        let key = record.key();
        let index = match positions.get(&key) {
            Some(&index) => index,
            None => {
                batches.push(Batch::new(key.clone()));
                positions.insert(key, batches.len() - 1);
                batches.len() - 1
            }
        };
        batches[index].push(record);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fields;

    fn row(email: &str, name: &str, section: &str) -> Record {
        Record::new()
            .with(fields::EMAIL, email)
            .with(fields::RECIPIENT_NAME, name)
            .with(fields::CLASS_SECTION, section)
    }

    #[test]
    fn test_groups_in_first_seen_order() {
        let batches = group(vec![
            row("b@x.com", "Bob", "L1"),
            row("a@x.com", "Alice", "L2"),
            row("b@x.com", "Bob", "L3"),
            row("c@x.com", "Carol", "L4"),
            row("a@x.com", "Alice", "L5"),
        ]);

        let names: Vec<_> = batches.iter().map(|b| b.recipient_name()).collect();
        assert_eq!(names, vec!["Bob", "Alice", "Carol"]);

        let bob: Vec<_> = batches[0]
            .records()
            .iter()
            .map(|r| r.get(fields::CLASS_SECTION))
            .collect();
        assert_eq!(bob, vec!["L1", "L3"]);
        assert_eq!(batches[1].size(), 2);
        assert_eq!(batches[2].size(), 1);
    }

    #[test]
    fn test_key_is_raw_string_pair() {
        let batches = group(vec![
            row("a@x.com", "Alice", "L1"),
            row("A@x.com", "Alice", "L2"),
            row("a@x.com ", "Alice", "L3"),
            row("a@x.com", "alice", "L4"),
            row("a@x.com", "Alice", "L5"),
        ]);

        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].size(), 2);
        for batch in &batches {
            for record in batch.records() {
                assert_eq!(&record.key(), batch.key());
            }
        }
    }

    #[test]
    fn test_invalid_addresses_still_form_batches() {
        let batches = group(vec![row("bad-address", "Bob", "L1"), row("", "", "L2")]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].address(), "bad-address");
        assert_eq!(batches[1].key(), &BatchKey::new("", ""));
    }

    #[test]
    fn test_sizes_match_key_counts() {
        let input = vec![
            row("a@x.com", "Alice", "L1"),
            row("b@x.com", "Bob", "L1"),
            row("a@x.com", "Alice", "L2"),
            row("a@x.com", "Alice", "L3"),
        ];

        let batches = group(input.clone());
        let total: usize = batches.iter().map(Batch::size).sum();
        assert_eq!(total, input.len());

        for batch in &batches {
            let expected = input.iter().filter(|r| &r.key() == batch.key()).count();
            assert_eq!(batch.size(), expected);
        }

        assert_eq!(group(input.clone()), batches);
    }

    #[test]
    fn test_empty_input() {
        assert!(group(Vec::new()).is_empty());
    }
}
