// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{read_string, write_string, Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Indexed identity dimensions
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dimension {
    /// Resource kind
    Kind,

    /// Namespace
    Namespace,

    /// API group
    Group,
}

impl Dimension {
    /// All indexed dimensions.
    pub const ALL: [Self; 3] = [Self::Kind, Self::Namespace, Self::Group];

    fn idx(self) -> usize {
        match self {
            Self::Kind => 0,
            Self::Namespace => 1,
            Self::Group => 2,
        }
    }
}

impl From<Dimension> for u8 {
    fn from(value: Dimension) -> Self {
        value.idx() as Self
    }
}

impl TryFrom<u8> for Dimension {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Kind),
            1 => Ok(Self::Namespace),
            2 => Ok(Self::Group),
            _ => Err(()),
        }
    }
}

/// A posting: the run of rows inside one block that carry the value
///
/// Row bounds are inclusive. The run may contain rows with other
/// values; residual predicates re-check every decoded event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Posting {
    /// Index of the block inside its segment
    pub block_idx: u32,

    /// First and last row carrying the value
    pub rows: (u32, u32),
}

/// A block surviving posting-list intersection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockMatch {
    /// Index of the block inside its segment
    pub block_idx: u32,

    /// Row bound that every matching row falls into
    pub rows: (u32, u32),
}

/// Result of an AND-intersection across dimensions
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Selection {
    /// No dimension was constrained - all blocks are candidates
    Universe,

    /// Candidate blocks, sorted by block index
    ///
    /// An empty list is an authoritative miss: segments index every
    /// value they contain.
    Blocks(Vec<BlockMatch>),
}

/// Builds per-segment posting lists while events are appended
#[derive(Debug, Default)]
pub struct Builder {
    dims: [FxHashMap<String, Vec<Posting>>; 3],
}

impl Builder {
    /// Registers a value occurrence at (block, row).
    ///
    /// Rows must be registered in append order, so postings stay
    /// sorted and runs within one block coalesce.
    pub fn insert(&mut self, dim: Dimension, value: &str, block_idx: u32, row: u32) {
        let Some(map) = self.dims.get_mut(dim.idx()) else {
            return;
        };

        let posting = Posting {
            block_idx,
            rows: (row, row),
        };

        if let Some(postings) = map.get_mut(value) {
            if let Some(last) = postings.last_mut() {
                if last.block_idx == block_idx {
                    last.rows.1 = row;
                    return;
                }
            }

            postings.push(posting);
        } else {
            map.insert(value.to_owned(), vec![posting]);
        }
    }

    /// Finalizes the index.
    #[must_use]
    pub fn build(self) -> InvertedIndex {
        let dims = self.dims.map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, v.into_boxed_slice()))
                .collect()
        });

        InvertedIndex { dims }
    }
}

/// Per-segment inverted index over kind, namespace and group
///
/// Immutable after the segment is sealed, so the read path needs no
/// locking.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvertedIndex {
    dims: [FxHashMap<String, Box<[Posting]>>; 3],
}

impl InvertedIndex {
    /// Returns the posting list for a value, if present.
    #[must_use]
    pub fn postings(&self, dim: Dimension, value: &str) -> Option<&[Posting]> {
        self.dims.get(dim.idx())?.get(value).map(|v| &**v)
    }

    /// Iterates all distinct values of a dimension.
    pub fn values(&self, dim: Dimension) -> impl Iterator<Item = &str> {
        self.dims.get(dim.idx()).into_iter().flat_map(|m| m.keys().map(String::as_str))
    }

    /// Union of blocks matching any of `values` within one dimension.
    ///
    /// Returns `None` for an empty value list (universe, skip).
    fn dimension_blocks(&self, dim: Dimension, values: &[String]) -> Option<Vec<BlockMatch>> {
        if values.is_empty() {
            return None;
        }

        let mut merged: Vec<BlockMatch> = Vec::new();

        for value in values {
            let Some(postings) = self.postings(dim, value) else {
                // Authoritative miss for this value
                continue;
            };

            merged = union(&merged, postings);
        }

        Some(merged)
    }

    /// AND-intersection across dimensions via galloping merge.
    ///
    /// An empty filter in a dimension contributes the universe.
    #[must_use]
    pub fn intersect(
        &self,
        kinds: &[String],
        namespaces: &[String],
        groups: &[String],
    ) -> Selection {
        let mut lists: Vec<Vec<BlockMatch>> = Vec::with_capacity(3);

        for (dim, values) in [
            (Dimension::Kind, kinds),
            (Dimension::Namespace, namespaces),
            (Dimension::Group, groups),
        ] {
            if let Some(blocks) = self.dimension_blocks(dim, values) {
                // Short-circuit on any empty posting list
                if blocks.is_empty() {
                    return Selection::Blocks(vec![]);
                }

                lists.push(blocks);
            }
        }

        if lists.is_empty() {
            return Selection::Universe;
        }

        // Start from the shortest list, it bounds the result size
        lists.sort_by_key(Vec::len);

        let mut iter = lists.into_iter();
        let Some(mut acc) = iter.next() else {
            return Selection::Universe;
        };

        for list in iter {
            acc = intersect_galloping(&acc, &list);

            if acc.is_empty() {
                break;
            }
        }

        Selection::Blocks(acc)
    }
}

/// Merges two block lists sorted by block index, widening row bounds
/// on overlap.
fn union(a: &[BlockMatch], b: &[Posting]) -> Vec<BlockMatch> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut left = a.iter().peekable();
    let mut right = b.iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => {
                use std::cmp::Ordering::{Equal, Greater, Less};

                match l.block_idx.cmp(&r.block_idx) {
                    Less => {
                        out.push(**l);
                        left.next();
                    }
                    Greater => {
                        out.push(BlockMatch {
                            block_idx: r.block_idx,
                            rows: r.rows,
                        });
                        right.next();
                    }
                    Equal => {
                        out.push(BlockMatch {
                            block_idx: l.block_idx,
                            rows: (l.rows.0.min(r.rows.0), l.rows.1.max(r.rows.1)),
                        });
                        left.next();
                        right.next();
                    }
                }
            }
            (Some(l), None) => {
                out.push(**l);
                left.next();
            }
            (None, Some(r)) => {
                out.push(BlockMatch {
                    block_idx: r.block_idx,
                    rows: r.rows,
                });
                right.next();
            }
            (None, None) => break,
        }
    }

    out
}

/// Intersects two block lists sorted by block index.
///
/// Gallops through the longer list using binary search from the
/// current position; row bounds are narrowed, and a block whose
/// bounds become disjoint is dropped.
fn intersect_galloping(shorter: &[BlockMatch], longer: &[BlockMatch]) -> Vec<BlockMatch> {
    let mut out = Vec::with_capacity(shorter.len().min(longer.len()));
    let mut pos = 0;

    for probe in shorter {
        let Some(remaining) = longer.get(pos..) else {
            break;
        };

        let jump = remaining.partition_point(|b| b.block_idx < probe.block_idx);
        pos += jump;

        let Some(candidate) = longer.get(pos) else {
            break;
        };

        if candidate.block_idx == probe.block_idx {
            let rows = (
                probe.rows.0.max(candidate.rows.0),
                probe.rows.1.min(candidate.rows.1),
            );

            if rows.0 <= rows.1 {
                out.push(BlockMatch {
                    block_idx: probe.block_idx,
                    rows,
                });
            }

            pos += 1;
        }
    }

    out
}

impl Encode for InvertedIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        for dim in Dimension::ALL {
            writer.write_u8(u8::from(dim))?;

            let Some(map) = self.dims.get(dim.idx()) else {
                continue;
            };

            // Sort for deterministic output
            let mut values = map.iter().collect::<Vec<_>>();
            values.sort_by_key(|(k, _)| k.as_str());

            // NOTE: Distinct value count fits into u32
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(values.len() as u32)?;

            for (value, postings) in values {
                write_string(writer, value)?;

                // NOTE: Posting count is bounded by block count
                #[allow(clippy::cast_possible_truncation)]
                writer.write_u32_varint(postings.len() as u32)?;

                // Delta-encode block indices
                let mut prev_block = 0;

                for posting in postings.iter() {
                    writer.write_u32_varint(posting.block_idx - prev_block)?;
                    writer.write_u32_varint(posting.rows.0)?;
                    writer.write_u32_varint(posting.rows.1 - posting.rows.0)?;
                    prev_block = posting.block_idx;
                }
            }
        }

        Ok(())
    }
}

impl Decode for InvertedIndex {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut dims: [FxHashMap<String, Box<[Posting]>>; 3] = Default::default();

        for expected_dim in Dimension::ALL {
            let tag = reader.read_u8()?;

            if Dimension::try_from(tag) != Ok(expected_dim) {
                return Err(DecodeError::InvalidTag(("Dimension", tag)));
            }

            let value_count = reader.read_u32_varint()?;
            let mut map =
                FxHashMap::with_capacity_and_hasher(value_count as usize, Default::default());

            for _ in 0..value_count {
                let value = read_string(reader)?;
                let posting_count = reader.read_u32_varint()?;

                let mut postings = Vec::with_capacity(posting_count as usize);
                let mut prev_block = 0;

                for _ in 0..posting_count {
                    let block_idx = prev_block + reader.read_u32_varint()?;
                    let row_start = reader.read_u32_varint()?;
                    let row_end = row_start + reader.read_u32_varint()?;

                    postings.push(Posting {
                        block_idx,
                        rows: (row_start, row_end),
                    });

                    prev_block = block_idx;
                }

                map.insert(value, postings.into_boxed_slice());
            }

            if let Some(slot) = dims.get_mut(expected_dim.idx()) {
                *slot = map;
            }
        }

        Ok(Self { dims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample() -> InvertedIndex {
        let mut builder = Builder::default();

        // Block 0: rows 0..=3 Pods in default, row 4 ConfigMap in kube-system
        for row in 0..4 {
            builder.insert(Dimension::Kind, "Pod", 0, row);
            builder.insert(Dimension::Namespace, "default", 0, row);
            builder.insert(Dimension::Group, "", 0, row);
        }
        builder.insert(Dimension::Kind, "ConfigMap", 0, 4);
        builder.insert(Dimension::Namespace, "kube-system", 0, 4);
        builder.insert(Dimension::Group, "", 0, 4);

        // Block 1: Deployments in default
        for row in 0..2 {
            builder.insert(Dimension::Kind, "Deployment", 1, row);
            builder.insert(Dimension::Namespace, "default", 1, row);
            builder.insert(Dimension::Group, "apps", 1, row);
        }

        builder.build()
    }

    #[test]
    fn inverted_index_postings_coalesce_rows() {
        let index = sample();

        let postings = index.postings(Dimension::Kind, "Pod").unwrap_or_default();
        assert_eq!(
            &[Posting {
                block_idx: 0,
                rows: (0, 3)
            }],
            postings
        );
    }

    #[test]
    fn inverted_index_empty_filter_is_universe() {
        let index = sample();
        assert_eq!(Selection::Universe, index.intersect(&[], &[], &[]));
    }

    #[test]
    fn inverted_index_intersection() {
        let index = sample();

        // Pod AND default → block 0 only
        let selection = index.intersect(&["Pod".into()], &["default".into()], &[]);
        let Selection::Blocks(blocks) = selection else {
            panic!("expected block selection");
        };
        assert_eq!(1, blocks.len());
        assert_eq!(Some(0), blocks.first().map(|b| b.block_idx));

        // default spans both blocks
        let selection = index.intersect(&[], &["default".into()], &[]);
        let Selection::Blocks(blocks) = selection else {
            panic!("expected block selection");
        };
        assert_eq!(2, blocks.len());
    }

    #[test]
    fn inverted_index_absent_value_is_authoritative_miss() {
        let index = sample();

        let selection = index.intersect(&["Secret".into()], &[], &[]);
        assert_eq!(Selection::Blocks(vec![]), selection);
    }

    #[test]
    fn inverted_index_disjoint_row_bounds_drop_block() {
        let index = sample();

        // ConfigMap (rows 4..=4) AND default (rows 0..=3) never overlap in block 0
        let selection = index.intersect(&["ConfigMap".into()], &["default".into()], &[]);
        assert_eq!(Selection::Blocks(vec![]), selection);
    }

    #[test]
    fn inverted_index_multi_value_union() {
        let index = sample();

        let selection = index.intersect(&["Pod".into(), "Deployment".into()], &[], &[]);
        let Selection::Blocks(blocks) = selection else {
            panic!("expected block selection");
        };
        assert_eq!(2, blocks.len());
    }

    #[test]
    fn inverted_index_roundtrip() -> crate::Result<()> {
        let index = sample();
        let bytes = index.encode_into_vec();

        let decoded = InvertedIndex::decode_from(&mut std::io::Cursor::new(bytes))?;
        assert_eq!(index, decoded);

        Ok(())
    }

    #[test]
    fn inverted_index_values() {
        let index = sample();

        let mut kinds = index.values(Dimension::Kind).collect::<Vec<_>>();
        kinds.sort_unstable();
        assert_eq!(vec!["ConfigMap", "Deployment", "Pod"], kinds);
    }
}
