use super::{MainChain, MainChainError};
use crate::directory::NodeDirectory;
use crate::identity::PublicKey;
use crate::ledger::BlockAbstract;
use parking_lot::Mutex;
use scaleout_common::ContentHash;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Single-process ordering service.
///
/// Commits are totally ordered by a height counter. Signature checks are
/// enabled by attaching a directory. Availability can be switched off to
/// exercise the retry paths of the nodes using it.
pub struct InMemoryMainChain {
    state: Mutex<MainChainState>,
    directory: Option<Arc<dyn NodeDirectory>>,
}

struct MainChainState {
    initialized: bool,
    available: bool,
    auto_finalize: bool,
    height: u64,
    committed: HashMap<ContentHash, BlockAbstract>,
    pending: Vec<BlockAbstract>,
}

impl InMemoryMainChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MainChainState {
                initialized: false,
                available: true,
                auto_finalize: true,
                height: 0,
                committed: HashMap::new(),
                pending: Vec::new(),
            }),
            directory: None,
        }
    }

    /// Reject abstracts whose signature does not match the owner's key
    pub fn with_directory(mut self, directory: Arc<dyn NodeDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// When off, commits wait for [`InMemoryMainChain::finalize_pending`]
    pub fn set_auto_finalize(&self, auto_finalize: bool) {
        self.state.lock().auto_finalize = auto_finalize;
    }

    /// Commit every waiting abstract in one new main-chain block
    pub fn finalize_pending(&self) -> u64 {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return state.height;
        }
        state.height += 1;
        let height = state.height;
        let pending = std::mem::take(&mut state.pending);
        for mut abstract_ in pending {
            abstract_.set_main_chain_hash(Self::entry_hash(height, &abstract_));
            state.committed.insert(abstract_.block_hash(), abstract_);
        }
        debug!(height, "Finalized pending abstracts");
        height
    }

    pub fn committed_count(&self) -> usize {
        self.state.lock().committed.len()
    }

    fn entry_hash(height: u64, abstract_: &BlockAbstract) -> ContentHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&height.to_be_bytes());
        hasher.update(&abstract_.to_bytes());
        ContentHash::from_bytes(*hasher.finalize().as_bytes())
    }

    fn check_signature(&self, abstract_: &BlockAbstract) -> Result<(), MainChainError> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };
        let info = directory.lookup(abstract_.owner()).ok_or_else(|| {
            MainChainError::Rejected(format!("unknown owner {}", abstract_.owner()))
        })?;
        let key = PublicKey::from_bytes(&info.public_key)
            .map_err(|e| MainChainError::Rejected(e.to_string()))?;
        if !abstract_.verify(&key) {
            return Err(MainChainError::Rejected(format!(
                "bad signature on block {} of {}",
                abstract_.block_number(),
                abstract_.owner()
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryMainChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MainChain for InMemoryMainChain {
    fn init(&self) -> Result<(), MainChainError> {
        let mut state = self.state.lock();
        if !state.initialized {
            state.initialized = true;
            info!("In-memory main chain initialized");
        }
        Ok(())
    }

    fn stop(&self) {
        self.state.lock().initialized = false;
    }

    fn commit_abstract(
        &self,
        abstract_: &BlockAbstract,
    ) -> Result<Option<ContentHash>, MainChainError> {
        self.check_signature(abstract_)?;

        let mut state = self.state.lock();
        if !state.initialized {
            return Err(MainChainError::NotInitialized);
        }
        if !state.available {
            warn!(owner = %abstract_.owner(), block = abstract_.block_number(), "Main chain unavailable");
            return Err(MainChainError::Unavailable("service switched off".into()));
        }
        if let Some(existing) = state.committed.get(&abstract_.block_hash()) {
            return Ok(existing.main_chain_hash());
        }

        if !state.auto_finalize {
            state.pending.push(abstract_.clone());
            return Ok(None);
        }

        state.height += 1;
        let hash = Self::entry_hash(state.height, abstract_);
        let mut committed = abstract_.clone();
        committed.set_main_chain_hash(hash);
        state.committed.insert(committed.block_hash(), committed);
        debug!(
            owner = %abstract_.owner(),
            block = abstract_.block_number(),
            height = state.height,
            "Committed abstract"
        );
        Ok(Some(hash))
    }

    fn is_present(&self, block_hash: &ContentHash) -> bool {
        self.state.lock().committed.contains_key(block_hash)
    }

    fn current_height(&self) -> u64 {
        self.state.lock().height
    }
}
