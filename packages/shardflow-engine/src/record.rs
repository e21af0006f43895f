//! Header-delimited record partitioning
//!
//! The engine treats the partition boundary abstractly: a [`Partitioner`]
//! guarantees that no logical record straddles two pieces, that the union of
//! the pieces is the original record set, and that order is preserved within
//! a piece. The shipped default understands header-delimited text records
//! (a record is a `>`-prefixed header line plus the lines that follow it,
//! up to the next header).

use crate::error::Result;

/// Domain-specific split policy
pub trait Partitioner: Send + Sync {
    /// Number of logical records in the input
    fn count_records(&self, input: &str) -> usize;

    /// Split into exactly `pieces` contiguous pieces. Pieces may be empty
    /// when there are fewer records than pieces; concatenating the pieces in
    /// order reproduces the input's records byte-exactly.
    fn partition(&self, input: &str, pieces: usize) -> Result<Vec<String>>;
}

/// Records delimited by `>`-prefixed header lines.
///
/// Content before the first header belongs to no record and is not part of
/// any piece.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderDelimited;

impl HeaderDelimited {
    fn records(input: &str) -> Vec<String> {
        let mut records: Vec<String> = Vec::new();
        for line in input.split_inclusive('\n') {
            if line.starts_with('>') {
                records.push(line.to_string());
            } else if let Some(current) = records.last_mut() {
                current.push_str(line);
            }
        }
        records
    }
}

impl Partitioner for HeaderDelimited {
    fn count_records(&self, input: &str) -> usize {
        Self::records(input).len()
    }

    fn partition(&self, input: &str, pieces: usize) -> Result<Vec<String>> {
        if pieces == 0 {
            return Ok(Vec::new());
        }

        let records = Self::records(input);
        let base = records.len() / pieces;
        let extra = records.len() % pieces;

        let mut out = Vec::with_capacity(pieces);
        let mut next = 0;
        for i in 0..pieces {
            let take = base + usize::from(i < extra);
            let mut piece = String::new();
            for record in &records[next..next + take] {
                piece.push_str(record);
            }
            next += take;
            out.push(piece);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = ">alpha\nAACCGG\nTT\n>beta\nGGTT\n>gamma\nCC\n";

    #[test]
    fn test_count_records() {
        let p = HeaderDelimited;
        assert_eq!(p.count_records(SAMPLE), 3);
        assert_eq!(p.count_records(""), 0);
        assert_eq!(p.count_records("no headers here\n"), 0);
    }

    #[test]
    fn test_partition_preserves_content_and_order() {
        let p = HeaderDelimited;
        let pieces = p.partition(SAMPLE, 2).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0], ">alpha\nAACCGG\nTT\n>beta\nGGTT\n");
        assert_eq!(pieces[1], ">gamma\nCC\n");
        assert_eq!(pieces.concat(), SAMPLE);
    }

    #[test]
    fn test_partition_more_pieces_than_records() {
        let p = HeaderDelimited;
        let pieces = p.partition(">only\nA\n", 3).unwrap();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], ">only\nA\n");
        assert_eq!(pieces[1], "");
        assert_eq!(pieces[2], "");
    }

    #[test]
    fn test_partition_empty_input() {
        let p = HeaderDelimited;
        let pieces = p.partition("", 4).unwrap();
        assert_eq!(pieces.len(), 4);
        assert!(pieces.iter().all(|p| p.is_empty()));
    }

    #[test]
    fn test_no_record_straddles_a_boundary() {
        let p = HeaderDelimited;
        for n in 1..=6 {
            let pieces = p.partition(SAMPLE, n).unwrap();
            for piece in &pieces {
                // Every non-empty piece starts at a record header
                assert!(piece.is_empty() || piece.starts_with('>'));
            }
        }
    }

    #[test]
    fn test_record_missing_final_newline() {
        let p = HeaderDelimited;
        let input = ">a\nAC\n>b\nGT";
        let pieces = p.partition(input, 2).unwrap();
        assert_eq!(pieces.concat(), input);
    }

    fn record_strategy() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", proptest::collection::vec("[ACGT]{0,12}", 0..4)).prop_map(
            |(name, lines)| {
                let mut record = format!(">{}\n", name);
                for line in lines {
                    record.push_str(&line);
                    record.push('\n');
                }
                record
            },
        )
    }

    proptest! {
        #[test]
        fn prop_partition_then_concat_is_identity(
            records in proptest::collection::vec(record_strategy(), 0..20),
            pieces in 1usize..6,
        ) {
            let input = records.concat();
            let p = HeaderDelimited;

            let parts = p.partition(&input, pieces).unwrap();
            prop_assert_eq!(parts.len(), pieces);
            prop_assert_eq!(parts.concat(), input.clone());

            let total: usize = parts.iter().map(|part| p.count_records(part)).sum();
            prop_assert_eq!(total, p.count_records(&input));
        }
    }
}
