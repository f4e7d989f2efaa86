use super::BlockMap;
use crate::error::{Result, UpdaterError};
use crate::transport::ByteRange;
use std::collections::HashMap;

/// One step of rebuilding the new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Copy `length` bytes of the old file at `old_offset` to `new_offset`.
    CopyLocal {
        old_offset: u64,
        new_offset: u64,
        length: u64,
    },
    /// Download `length` bytes of the new file at `new_offset`.
    FetchRemote { new_offset: u64, length: u64 },
}

impl Operation {
    /// Where this operation's bytes land in the new file.
    pub fn new_offset(&self) -> u64 {
        match *self {
            Operation::CopyLocal { new_offset, .. } | Operation::FetchRemote { new_offset, .. } => {
                new_offset
            }
        }
    }

    /// Bytes written by this operation.
    pub fn length(&self) -> u64 {
        match *self {
            Operation::CopyLocal { length, .. } | Operation::FetchRemote { length, .. } => length,
        }
    }

    /// Whether the bytes come from the network.
    pub fn is_remote(&self) -> bool {
        matches!(self, Operation::FetchRemote { .. })
    }

    /// Extend this operation with `next` when both are contiguous and of the same kind.
    fn try_merge(&mut self, next: &Operation) -> bool {
        match (self, next) {
            (
                Operation::CopyLocal {
                    old_offset,
                    new_offset,
                    length,
                },
                Operation::CopyLocal {
                    old_offset: next_old,
                    new_offset: next_new,
                    length: next_len,
                },
            ) if *old_offset + *length == *next_old && *new_offset + *length == *next_new => {
                *length += next_len;
                true
            }
            (
                Operation::FetchRemote { new_offset, length },
                Operation::FetchRemote {
                    new_offset: next_new,
                    length: next_len,
                },
            ) if *new_offset + *length == *next_new => {
                *length += next_len;
                true
            }
            _ => false,
        }
    }
}

/// Tuning of [`DiffPlan::compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Look blocks without a positional match up by checksum anywhere in the old file.
    pub realign: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self { realign: true }
    }
}

/// Ordered operations covering the new file exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPlan {
    operations: Vec<Operation>,
    new_size: u64,
}

impl DiffPlan {
    /// Plan that downloads the whole file.
    pub fn full_download(new_size: u64) -> Self {
        let operations = if new_size == 0 {
            Vec::new()
        } else {
            vec![Operation::FetchRemote {
                new_offset: 0,
                length: new_size,
            }]
        };
        Self {
            operations,
            new_size,
        }
    }

    /// Compute the operations that turn the old file into the new one.
    ///
    /// Blocks are matched in lock-step by position while both lists stay aligned:
    /// equal length and checksum copy locally, a checksum mismatch of equal length
    /// does not break the alignment. A length difference does; from there on only
    /// the checksum lookup can match. With `options.realign` every block that found
    /// no positional match is looked up by checksum and size in the old map,
    /// otherwise it is fetched. Bytes of the new file outside its block map (such as
    /// an embedded block map trailer) are fetched.
    ///
    /// A missing, empty, or incompatible old map yields [`DiffPlan::full_download`].
    /// The plan is rejected with [`UpdaterError::PlanSizeMismatch`] when it does not
    /// cover exactly `declared_size` bytes.
    pub fn compute(
        old: Option<&BlockMap>,
        new: &BlockMap,
        declared_size: u64,
        options: PlanOptions,
    ) -> Result<Self> {
        let old = match old {
            Some(old) if !old.is_empty() && old.is_compatible_with(new) => old,
            _ => {
                tracing::debug!("no usable old block map, planning a full download");
                return Ok(Self::full_download(declared_size));
            }
        };

        let mut builder = PlanBuilder::default();
        if new.start() > 0 {
            builder.push(Operation::FetchRemote {
                new_offset: 0,
                length: new.start(),
            });
        }

        let index = options.realign.then(|| checksum_index(old));
        let mut aligned = true;
        for (position, block) in new.blocks().iter().enumerate() {
            let same_slot = old.blocks().get(position).filter(|_| aligned);
            if let Some(old_block) = same_slot {
                if old_block.size != block.size {
                    aligned = false;
                } else if old_block.checksum == block.checksum {
                    builder.push(Operation::CopyLocal {
                        old_offset: old_block.offset,
                        new_offset: block.offset,
                        length: block.size,
                    });
                    continue;
                }
            } else {
                aligned = false;
            }

            let relocated = index
                .as_ref()
                .and_then(|index| index.get(&(block.checksum.as_str(), block.size)))
                .copied();
            match relocated {
                Some(old_offset) => builder.push(Operation::CopyLocal {
                    old_offset,
                    new_offset: block.offset,
                    length: block.size,
                }),
                None => builder.push(Operation::FetchRemote {
                    new_offset: block.offset,
                    length: block.size,
                }),
            }
        }

        let covered = new.end();
        if covered < declared_size {
            builder.push(Operation::FetchRemote {
                new_offset: covered,
                length: declared_size - covered,
            });
        }

        let plan = Self {
            operations: builder.operations,
            new_size: declared_size,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check that operations are ascending, gap-free, and sum to the declared size.
    pub fn validate(&self) -> Result<()> {
        let mut expected_offset = 0u64;
        for op in &self.operations {
            if op.length() == 0 || op.new_offset() != expected_offset {
                return Err(UpdaterError::PlanSizeMismatch {
                    planned: self.planned_size(),
                    declared: self.new_size,
                });
            }
            expected_offset += op.length();
        }
        if expected_offset != self.new_size {
            return Err(UpdaterError::PlanSizeMismatch {
                planned: expected_offset,
                declared: self.new_size,
            });
        }
        Ok(())
    }

    /// Operations ordered by new-file offset.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Size of the file the plan rebuilds.
    pub fn new_size(&self) -> u64 {
        self.new_size
    }

    fn planned_size(&self) -> u64 {
        self.operations.iter().map(Operation::length).sum()
    }

    /// Bytes reconstructed from the old file.
    pub fn local_bytes(&self) -> u64 {
        self.operations
            .iter()
            .filter(|op| !op.is_remote())
            .map(Operation::length)
            .sum()
    }

    /// Bytes that must be downloaded.
    pub fn remote_bytes(&self) -> u64 {
        self.operations
            .iter()
            .filter(|op| op.is_remote())
            .map(Operation::length)
            .sum()
    }

    /// New-file ranges of all `FetchRemote` operations, ascending.
    pub fn remote_ranges(&self) -> Vec<ByteRange> {
        self.operations
            .iter()
            .filter_map(|op| match *op {
                Operation::FetchRemote { new_offset, length } => {
                    Some(ByteRange::from_len(new_offset, length))
                }
                Operation::CopyLocal { .. } => None,
            })
            .collect()
    }

    /// Whether nothing can be reused from the old file.
    pub fn is_full_download(&self) -> bool {
        self.local_bytes() == 0
    }
}

#[derive(Default)]
struct PlanBuilder {
    operations: Vec<Operation>,
}

impl PlanBuilder {
    fn push(&mut self, op: Operation) {
        if let Some(last) = self.operations.last_mut() {
            if last.try_merge(&op) {
                return;
            }
        }
        self.operations.push(op);
    }
}

/// First old offset of every `(checksum, size)` pair.
fn checksum_index(map: &BlockMap) -> HashMap<(&str, u64), u64> {
    let mut index = HashMap::with_capacity(map.blocks().len());
    for block in map.blocks() {
        index
            .entry((block.checksum.as_str(), block.size))
            .or_insert(block.offset);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockmap::{BlockMapDocument, BlockMapFileEntry};

    const BLOCK: usize = 1000;

    fn map_of(data: &[u8]) -> BlockMap {
        BlockMap::compute(data, BLOCK).unwrap()
    }

    fn ten_blocks() -> Vec<u8> {
        (0..10 * BLOCK).map(|i| ((i / BLOCK) * 17 + i % 7) as u8).collect()
    }

    #[test]
    fn identical_files_copy_everything_in_one_operation() {
        let data = ten_blocks();
        let map = map_of(&data);
        let plan = DiffPlan::compute(Some(&map), &map, data.len() as u64, PlanOptions::default())
            .unwrap();
        assert_eq!(
            plan.operations(),
            &[Operation::CopyLocal {
                old_offset: 0,
                new_offset: 0,
                length: data.len() as u64
            }]
        );
        assert_eq!(plan.remote_bytes(), 0);
    }

    #[test]
    fn disjoint_files_fetch_everything() {
        let old = vec![0u8; 4 * BLOCK];
        let new = vec![1u8; 4 * BLOCK + 123];
        let plan = DiffPlan::compute(
            Some(&map_of(&old)),
            &map_of(&new),
            new.len() as u64,
            PlanOptions::default(),
        )
        .unwrap();
        assert!(plan.operations().iter().all(Operation::is_remote));
        assert_eq!(plan.remote_bytes(), new.len() as u64);
    }

    #[test]
    fn two_changed_blocks_out_of_ten() {
        let old = ten_blocks();
        let mut new = old.clone();
        new[3 * BLOCK + 5] ^= 0xff;
        new[7 * BLOCK + 999] ^= 0xff;

        let plan = DiffPlan::compute(
            Some(&map_of(&old)),
            &map_of(&new),
            new.len() as u64,
            PlanOptions { realign: false },
        )
        .unwrap();

        let remote = plan.remote_ranges();
        assert_eq!(
            remote,
            vec![
                ByteRange::from_len(3000, 1000),
                ByteRange::from_len(7000, 1000)
            ]
        );
        assert_eq!(plan.remote_bytes(), 2000);
        assert_eq!(plan.operations().len(), 5);
        assert_eq!(
            plan.operations()[0],
            Operation::CopyLocal {
                old_offset: 0,
                new_offset: 0,
                length: 3000
            }
        );
    }

    fn manual_map(sizes: &[u64], checksums: &[&str]) -> BlockMap {
        BlockMap::from_document(BlockMapDocument {
            version: "2".into(),
            files: vec![BlockMapFileEntry {
                name: "file".into(),
                offset: 0,
                checksums: checksums.iter().map(|c| c.to_string()).collect(),
                sizes: sizes.to_vec(),
            }],
        })
        .unwrap()
    }

    #[test]
    fn shifted_content_only_matches_leading_blocks() {
        let old = ten_blocks();
        // a 10-byte insertion shifts the content of every later block
        let mut new = old[..BLOCK].to_vec();
        new.extend_from_slice(&[9u8; 10]);
        new.extend_from_slice(&old[BLOCK..]);

        let plan = DiffPlan::compute(
            Some(&map_of(&old)),
            &map_of(&new),
            new.len() as u64,
            PlanOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.local_bytes(), BLOCK as u64);
        assert_eq!(plan.remote_bytes(), new.len() as u64 - BLOCK as u64);
    }

    #[test]
    fn length_drift_stops_lock_step_matching() {
        let old = manual_map(&[100, 100, 100, 100], &["a", "b", "c", "d"]);
        let new = manual_map(&[100, 50, 100, 100], &["a", "x", "c", "d"]);

        let lock_step = DiffPlan::compute(Some(&old), &new, 350, PlanOptions { realign: false })
            .unwrap();
        assert_eq!(
            lock_step.operations(),
            &[
                Operation::CopyLocal {
                    old_offset: 0,
                    new_offset: 0,
                    length: 100
                },
                Operation::FetchRemote {
                    new_offset: 100,
                    length: 250
                },
            ]
        );

        let realigned =
            DiffPlan::compute(Some(&old), &new, 350, PlanOptions { realign: true }).unwrap();
        assert_eq!(
            realigned.operations(),
            &[
                Operation::CopyLocal {
                    old_offset: 0,
                    new_offset: 0,
                    length: 100
                },
                Operation::FetchRemote {
                    new_offset: 100,
                    length: 50
                },
                Operation::CopyLocal {
                    old_offset: 200,
                    new_offset: 150,
                    length: 200
                },
            ]
        );
    }

    #[test]
    fn realignment_recovers_moved_blocks() {
        let old = ten_blocks();
        // drop the first block; everything else moves 1000 bytes towards the start
        let new = old[BLOCK..].to_vec();
        let plan = DiffPlan::compute(
            Some(&map_of(&old)),
            &map_of(&new),
            new.len() as u64,
            PlanOptions { realign: true },
        )
        .unwrap();
        assert_eq!(plan.remote_bytes(), 0);
        assert_eq!(
            plan.operations(),
            &[Operation::CopyLocal {
                old_offset: BLOCK as u64,
                new_offset: 0,
                length: 9 * BLOCK as u64
            }]
        );
    }

    #[test]
    fn missing_or_incompatible_old_map_means_full_download() {
        let data = ten_blocks();
        let new = map_of(&data);
        let size = data.len() as u64;
        assert_eq!(
            DiffPlan::compute(None, &new, size, PlanOptions::default()).unwrap(),
            DiffPlan::full_download(size)
        );

        let mut document = new.to_document();
        document.version = "1".into();
        let old = BlockMap::from_document(document).unwrap();
        assert!(DiffPlan::compute(Some(&old), &new, size, PlanOptions::default())
            .unwrap()
            .is_full_download());

        let empty = BlockMap::from_document(BlockMapDocument {
            version: "2".into(),
            files: vec![BlockMapFileEntry {
                name: "file".into(),
                offset: 0,
                checksums: vec![],
                sizes: vec![],
            }],
        })
        .unwrap();
        assert!(DiffPlan::compute(Some(&empty), &new, size, PlanOptions::default())
            .unwrap()
            .is_full_download());
    }

    #[test]
    fn uncovered_tail_is_fetched() {
        let data = ten_blocks();
        let map = map_of(&data);
        let plan =
            DiffPlan::compute(Some(&map), &map, data.len() as u64 + 77, PlanOptions::default())
                .unwrap();
        assert_eq!(
            plan.operations().last(),
            Some(&Operation::FetchRemote {
                new_offset: data.len() as u64,
                length: 77
            })
        );
    }

    #[test]
    fn map_larger_than_declared_size_is_rejected() {
        let data = ten_blocks();
        let map = map_of(&data);
        let err = DiffPlan::compute(Some(&map), &map, 500, PlanOptions::default()).unwrap_err();
        assert!(matches!(err, UpdaterError::PlanSizeMismatch { .. }));
    }
}
