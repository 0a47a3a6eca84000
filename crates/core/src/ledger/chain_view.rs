use super::{Block, Chain};
use scaleout_common::NodeId;
use std::cell::Cell;
use std::sync::Arc;

/// Why a claimed update cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChainViewError {
    #[error("Gap in update of chain {owner}: expected block {expected}, got {found}")]
    Gap {
        owner: NodeId,
        expected: u32,
        found: u32,
    },

    #[error("Update of chain {owner} conflicts with the local block {number}")]
    Conflict { owner: NodeId, number: u32 },

    #[error("Block {number} of chain {owner} does not link to its predecessor")]
    BrokenLink { owner: NodeId, number: u32 },
}

/// Locally held blocks of one chain overlaid with a claimed update.
///
/// The integrity check runs once and is cached; [`ChainView::rebase`]
/// discards the cache when the backing chain moved on.
#[derive(Debug)]
pub struct ChainView {
    owner: NodeId,
    known: Vec<Arc<Block>>,
    updates: Vec<Arc<Block>>,
    overlap: Cell<usize>,
    checked: Cell<Option<Result<(), ChainViewError>>>,
}

impl ChainView {
    pub fn new(chain: &Chain, updates: &[Arc<Block>]) -> Self {
        Self {
            owner: chain.owner(),
            known: chain.blocks().to_vec(),
            updates: updates.to_vec(),
            overlap: Cell::new(0),
            checked: Cell::new(None),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// Take a fresh snapshot of the backing chain and forget the cached
    /// verdict
    pub fn rebase(&mut self, chain: &Chain) {
        self.known = chain.blocks().to_vec();
        self.reset_validation();
    }

    pub fn reset_validation(&self) {
        self.checked.set(None);
        self.overlap.set(0);
    }

    pub fn is_valid(&self) -> bool {
        self.check_integrity().is_ok()
    }

    pub fn check_integrity(&self) -> Result<(), ChainViewError> {
        if let Some(verdict) = self.checked.get() {
            return verdict;
        }
        let verdict = self.evaluate();
        self.checked.set(Some(verdict));
        verdict
    }

    fn evaluate(&self) -> Result<(), ChainViewError> {
        let Some(first) = self.updates.first() else {
            return Ok(());
        };

        let Some(last_known) = self.known.last() else {
            self.overlap.set(0);
            return self.check_contiguous(&self.updates, first.number(), None);
        };

        let next = last_known.number() + 1;
        if first.number() > next {
            return Err(ChainViewError::Gap {
                owner: self.owner,
                expected: next,
                found: first.number(),
            });
        }

        let overlap = self
            .updates
            .iter()
            .take_while(|block| block.number() < next)
            .count();

        for (offset, block) in self.updates[..overlap].iter().enumerate() {
            let expected = first.number() + offset as u32;
            if block.number() != expected {
                return Err(ChainViewError::Gap {
                    owner: self.owner,
                    expected,
                    found: block.number(),
                });
            }
            match self.known_block(block.number()) {
                Some(local) if **local == **block => {}
                _ => {
                    return Err(ChainViewError::Conflict {
                        owner: self.owner,
                        number: block.number(),
                    })
                }
            }
        }

        self.check_contiguous(&self.updates[overlap..], next, Some(last_known))?;
        self.overlap.set(overlap);
        Ok(())
    }

    fn check_contiguous<'b>(
        &self,
        blocks: &'b [Arc<Block>],
        start: u32,
        mut previous: Option<&'b Arc<Block>>,
    ) -> Result<(), ChainViewError> {
        for (offset, block) in blocks.iter().enumerate() {
            let expected = start + offset as u32;
            if block.number() != expected {
                return Err(ChainViewError::Gap {
                    owner: self.owner,
                    expected,
                    found: block.number(),
                });
            }
            if let Some(previous) = previous {
                if block.previous_hash() != Some(previous.hash()) {
                    return Err(ChainViewError::BrokenLink {
                        owner: self.owner,
                        number: block.number(),
                    });
                }
            }
            previous = Some(block);
        }
        Ok(())
    }

    fn known_block(&self, number: u32) -> Option<&Arc<Block>> {
        self.known
            .binary_search_by_key(&number, |block| block.number())
            .ok()
            .map(|index| &self.known[index])
    }

    /// Blocks the update adds on top of the local chain. Empty unless the
    /// view is valid.
    pub fn new_blocks(&self) -> &[Arc<Block>] {
        if !self.is_valid() {
            return &[];
        }
        &self.updates[self.overlap.get()..]
    }

    /// Whether applying the update would change nothing
    pub fn is_redundant(&self) -> bool {
        self.new_blocks().is_empty()
    }

    /// Look up a block in the local chain first, then in the update
    pub fn block(&self, number: u32) -> Option<&Arc<Block>> {
        self.known_block(number).or_else(|| {
            self.new_blocks()
                .iter()
                .find(|block| block.number() == number)
        })
    }

    /// Local blocks followed by the blocks the update adds, in order
    pub fn blocks(&self) -> impl Iterator<Item = &Arc<Block>> {
        self.known.iter().chain(self.new_blocks().iter())
    }

    pub fn last_block_number(&self) -> Option<u32> {
        self.new_blocks()
            .last()
            .or_else(|| self.known.last())
            .map(|block| block.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ChainKind, Transaction};

    fn node(id: i32) -> NodeId {
        NodeId::new(id)
    }

    /// The chain of node 2 with `blocks` sealed blocks, plus a mirror that
    /// holds only its first `known` blocks.
    fn fixture(blocks: usize, known: usize) -> (Chain, Chain) {
        let genesis = Arc::new(Block::genesis_for((0..3).map(node), 100).unwrap());
        let mut source = Chain::new(node(2), ChainKind::Own);
        source.set_genesis_block(genesis.clone()).unwrap();
        for _ in 0..blocks {
            source.seal_block().unwrap();
        }

        let mut mirror = Chain::new(node(2), ChainKind::Foreign);
        mirror.set_genesis_block(genesis).unwrap();
        mirror.update(&source.blocks()[..known]).unwrap();
        (source, mirror)
    }

    #[test]
    fn test_empty_update_is_valid() {
        let (_, mirror) = fixture(3, 2);
        let view = ChainView::new(&mirror, &[]);
        assert!(view.is_valid());
        assert!(view.is_redundant());
        assert_eq!(view.last_block_number(), Some(1));
    }

    #[test]
    fn test_contiguous_update_is_valid() {
        let (source, mirror) = fixture(4, 2);
        let view = ChainView::new(&mirror, &source.blocks()[2..5]);
        assert!(view.is_valid());
        assert_eq!(view.new_blocks().len(), 3);
        assert_eq!(view.last_block_number(), Some(4));
        assert_eq!(
            view.blocks().map(|b| b.number()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(view.block(3).unwrap().hash(), source.block(3).unwrap().hash());
    }

    #[test]
    fn test_gap_is_invalid() {
        let (source, mirror) = fixture(4, 2);
        let view = ChainView::new(&mirror, &source.blocks()[3..5]);
        assert_eq!(
            view.check_integrity(),
            Err(ChainViewError::Gap {
                owner: node(2),
                expected: 2,
                found: 3
            })
        );
        assert!(view.new_blocks().is_empty());
        assert!(view.block(3).is_none());
    }

    #[test]
    fn test_internal_gap_is_invalid() {
        let (source, mirror) = fixture(5, 2);
        let updates = vec![source.blocks()[2].clone(), source.blocks()[4].clone()];
        let view = ChainView::new(&mirror, &updates);
        assert!(!view.is_valid());
    }

    #[test]
    fn test_matching_overlap_is_trimmed() {
        let (source, mirror) = fixture(4, 3);
        let view = ChainView::new(&mirror, &source.blocks()[1..5]);
        assert!(view.is_valid());
        assert_eq!(
            view.new_blocks().iter().map(|b| b.number()).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[test]
    fn test_fully_known_update_is_redundant() {
        let (source, mirror) = fixture(4, 5);
        let view = ChainView::new(&mirror, &source.blocks()[1..3]);
        assert!(view.is_valid());
        assert!(view.is_redundant());
    }

    #[test]
    fn test_conflicting_overlap_is_invalid() {
        let (source, mirror) = fixture(3, 3);

        // A different block 2 for the same chain
        let forged_tx = Arc::new(Transaction::new(99, node(2), node(1), 1, 0, vec![]));
        let forged = Arc::new(
            Block::from_parts(2, Some(node(2)), Some(source.blocks()[1].hash()), vec![forged_tx])
                .unwrap(),
        );
        let updates = vec![forged];
        let view = ChainView::new(&mirror, &updates);
        assert_eq!(
            view.check_integrity(),
            Err(ChainViewError::Conflict {
                owner: node(2),
                number: 2
            })
        );
    }

    #[test]
    fn test_broken_link_is_invalid() {
        let (source, mirror) = fixture(3, 2);
        let unlinked = Arc::new(
            Block::from_parts(2, Some(node(2)), Some(source.blocks()[0].hash()), vec![]).unwrap(),
        );
        let view = ChainView::new(&mirror, &[unlinked]);
        assert!(matches!(
            view.check_integrity(),
            Err(ChainViewError::BrokenLink { number: 2, .. })
        ));
    }

    #[test]
    fn test_empty_chain_accepts_gap_free_update() {
        let (source, _) = fixture(3, 1);
        let empty = Chain::new(node(2), ChainKind::Foreign);

        let view = ChainView::new(&empty, &source.blocks()[1..4]);
        assert!(view.is_valid());

        let gappy = vec![source.blocks()[1].clone(), source.blocks()[3].clone()];
        let view = ChainView::new(&empty, &gappy);
        assert!(!view.is_valid());
    }

    #[test]
    fn test_rebase_reevaluates() {
        let (source, mut mirror) = fixture(4, 2);
        let mut view = ChainView::new(&mirror, &source.blocks()[3..5]);
        assert!(!view.is_valid());

        mirror.update(&source.blocks()[2..3]).unwrap();
        view.rebase(&mirror);
        assert!(view.is_valid());
        assert_eq!(view.new_blocks().len(), 2);
    }
}
