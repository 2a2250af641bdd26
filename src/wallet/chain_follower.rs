//! Tracks the orchestrator's cursor against the canonical chain.

use crate::chain::{BlockHeader, BlockLocator, Chain, GENESIS_SEQUENCE};
use crate::error::{Error, Result};

/// A hash cursor naming the last block whose notes and nullifiers have been
/// applied wallet-wide.
///
/// When the canonical chain reorganizes away from the cursor, the blocks on
/// the cursor's fork must be disconnected in reverse order before canonical
/// blocks are connected toward the head. The follower computes that rewind
/// path; the orchestrator applies it block by block, advancing the cursor
/// after each applied block so an aborted update leaves a consistent state.
#[derive(Debug, Default)]
pub(crate) struct ChainFollower {
    pub(crate) cursor: Option<BlockLocator>,
}

impl ChainFollower {
    /// The headers on the cursor's fork that are no longer canonical,
    /// newest first. Empty when the cursor is unset or still canonical.
    pub(crate) fn rewind_path<C: Chain>(&self, chain: &C) -> Result<Vec<BlockHeader>> {
        let mut path = Vec::new();
        let Some(cursor) = self.cursor else {
            return Ok(path);
        };

        let mut header = chain.get_header(&cursor.hash)?.ok_or_else(|| {
            Error::CorruptedData(format!("chain cursor block {} not found", cursor.hash))
        })?;

        loop {
            let canonical = chain.get_header_at_sequence(header.sequence)?;
            if canonical.map(|c| c.hash) == Some(header.hash) {
                break;
            }
            let previous = header.previous_block_hash;
            let sequence = header.sequence;
            path.push(header);
            if sequence == GENESIS_SEQUENCE {
                break;
            }
            header = chain.get_header(&previous)?.ok_or_else(|| {
                Error::CorruptedData(format!("fork parent block {previous} not found"))
            })?;
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use crate::primitives::SpendingKey;
    use crate::testing::{miners_fee_transaction, MemoryChain};

    #[test]
    fn rewind_path_walks_the_abandoned_fork_newest_first() {
        let mut rng = ChaChaRng::seed_from_u64(17);
        let chain = MemoryChain::new();
        let recipient = SpendingKey::generate(&mut rng).public_address();

        let one = chain.add_block(vec![miners_fee_transaction(&recipient, 1, &mut rng)]);
        let two = chain.add_block(vec![miners_fee_transaction(&recipient, 2, &mut rng)]);
        let three = chain.add_block(vec![miners_fee_transaction(&recipient, 3, &mut rng)]);

        let follower = ChainFollower {
            cursor: Some(three.locator()),
        };
        assert!(follower.rewind_path(&chain).unwrap().is_empty());

        // Reorg blocks two and three away.
        chain.rewind_head();
        chain.rewind_head();
        chain.add_block(vec![miners_fee_transaction(&recipient, 4, &mut rng)]);

        let path = follower.rewind_path(&chain).unwrap();
        assert_eq!(
            path.iter().map(|header| header.hash).collect::<Vec<_>>(),
            vec![three.hash, two.hash],
        );

        let caught_up = ChainFollower {
            cursor: Some(one.locator()),
        };
        assert!(caught_up.rewind_path(&chain).unwrap().is_empty());

        let unset = ChainFollower { cursor: None };
        assert!(unset.rewind_path(&chain).unwrap().is_empty());
    }
}
