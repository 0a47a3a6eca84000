use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol constants
pub mod protocol {
    /// Current protocol version
    pub const VERSION: u32 = 1;

    /// Default port for proof delivery
    pub const DEFAULT_PORT: u16 = 40000;

    /// Maximum encoded proof size (64 MB)
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
}

/// Ledger model constants
pub mod ledger {
    /// Number of the genesis block on every chain
    pub const GENESIS_BLOCK_NUMBER: u32 = 0;

    /// Endowment every participant receives in the genesis block
    pub const INITIAL_MONEY: i64 = 1_000_000;

    /// Commit an abstract for every n-th sealed block
    pub const COMMIT_EVERY: u32 = 1;
}

/// Transaction sending constants
pub mod sender {
    /// Committed blocks that must follow a block before its transactions go out
    pub const REQUIRED_COMMITS: usize = 2;

    /// Delay before the first sending round
    pub const INITIAL_SENDING_DELAY_MS: u64 = 2000;

    /// Interval between sending rounds
    pub const SENDING_WAIT_TIME_MS: u64 = 2000;

    /// Backlog of unsent blocks above which a warning is logged
    pub const MAX_BLOCKS_PENDING: usize = 500;

    /// Proofs carrying more blocks than this are logged as large
    pub const LARGE_PROOF_BLOCKS: usize = 400;
}

/// Transaction delivery constants
pub mod receiver {
    /// Base interval between delivery attempts
    pub const DELIVER_RECHECK_MS: u64 = 200;

    /// Upper bound for the delivery backoff
    pub const MAX_DELIVER_BACKOFF_MS: u64 = 5000;
}

/// Cost measure the source selector minimizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    /// Number of chains the receiver would have to learn something about
    ChainCount,
    /// Total number of blocks the receiver would have to learn
    #[default]
    BlockSum,
}

/// Which MetaKnowledge implementation backs each peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetaKnowledgeMode {
    /// Monotonic record maintained from sent and received proofs
    #[default]
    Tracked,
    /// Reads peers' actual chain heights; only meaningful in-process
    Oracle,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Id of the local participant
    pub node_id: i32,

    /// Listen address
    pub listen_addr: String,

    /// Listen port
    pub listen_port: u16,

    /// Directory service location
    pub tracker_url: Option<String>,

    /// Genesis endowment per participant
    pub initial_money: i64,

    /// Commit an abstract every n-th sealed block
    pub commit_every: u32,

    /// Committed blocks required after a block before sending it
    pub required_commits: usize,

    pub initial_sending_delay_ms: u64,

    pub sending_wait_time_ms: u64,

    pub deliver_recheck_ms: u64,

    pub max_deliver_backoff_ms: u64,

    /// Unsent block backlog that triggers a warning
    pub max_blocks_pending: usize,

    pub selection_metric: SelectionMetric,

    /// When false, the genesis endowment is spent only as a last resort
    pub genesis_grouping: bool,

    pub meta_knowledge: MetaKnowledgeMode,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: "127.0.0.1".to_string(),
            listen_port: protocol::DEFAULT_PORT,
            tracker_url: None,
            initial_money: ledger::INITIAL_MONEY,
            commit_every: ledger::COMMIT_EVERY,
            required_commits: sender::REQUIRED_COMMITS,
            initial_sending_delay_ms: sender::INITIAL_SENDING_DELAY_MS,
            sending_wait_time_ms: sender::SENDING_WAIT_TIME_MS,
            deliver_recheck_ms: receiver::DELIVER_RECHECK_MS,
            max_deliver_backoff_ms: receiver::MAX_DELIVER_BACKOFF_MS,
            max_blocks_pending: sender::MAX_BLOCKS_PENDING,
            selection_metric: SelectionMetric::default(),
            genesis_grouping: false,
            meta_knowledge: MetaKnowledgeMode::default(),
            verbose: false,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: i32) -> Self {
        Self {
            node_id,
            listen_port: protocol::DEFAULT_PORT.saturating_add(node_id.max(0) as u16),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_tracker_url(mut self, url: impl Into<String>) -> Self {
        self.tracker_url = Some(url.into());
        self
    }

    pub fn with_initial_money(mut self, money: i64) -> Self {
        self.initial_money = money;
        self
    }

    pub fn with_required_commits(mut self, commits: usize) -> Self {
        self.required_commits = commits;
        self
    }

    pub fn with_commit_every(mut self, every: u32) -> Self {
        self.commit_every = every;
        self
    }

    pub fn with_selection_metric(mut self, metric: SelectionMetric) -> Self {
        self.selection_metric = metric;
        self
    }

    pub fn with_genesis_grouping(mut self, grouping: bool) -> Self {
        self.genesis_grouping = grouping;
        self
    }

    pub fn with_meta_knowledge(mut self, mode: MetaKnowledgeMode) -> Self {
        self.meta_knowledge = mode;
        self
    }

    /// Shrinks every timer, for in-process clusters and tests
    pub fn with_timings(mut self, sending_ms: u64, deliver_ms: u64) -> Self {
        self.initial_sending_delay_ms = sending_ms;
        self.sending_wait_time_ms = sending_ms;
        self.deliver_recheck_ms = deliver_ms;
        self.max_deliver_backoff_ms = self.max_deliver_backoff_ms.max(deliver_ms);
        self
    }

    pub fn initial_sending_delay(&self) -> Duration {
        Duration::from_millis(self.initial_sending_delay_ms)
    }

    pub fn sending_wait_time(&self) -> Duration {
        Duration::from_millis(self.sending_wait_time_ms)
    }

    pub fn deliver_recheck(&self) -> Duration {
        Duration::from_millis(self.deliver_recheck_ms)
    }

    pub fn max_deliver_backoff(&self) -> Duration {
        Duration::from_millis(self.max_deliver_backoff_ms)
    }

    /// Check values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id < 0 {
            return Err(ConfigError::Invalid(format!(
                "node_id must be non-negative, got {}",
                self.node_id
            )));
        }
        if self.initial_money <= 0 {
            return Err(ConfigError::Invalid("initial_money must be positive".into()));
        }
        if self.commit_every == 0 {
            return Err(ConfigError::Invalid("commit_every must be at least 1".into()));
        }
        if self.required_commits == 0 {
            return Err(ConfigError::Invalid(
                "required_commits must be at least 1".into(),
            ));
        }
        if self.deliver_recheck_ms == 0 || self.sending_wait_time_ms == 0 {
            return Err(ConfigError::Invalid("timer intervals must be non-zero".into()));
        }
        if self.max_deliver_backoff_ms < self.deliver_recheck_ms {
            return Err(ConfigError::Invalid(
                "max_deliver_backoff_ms must not be below deliver_recheck_ms".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
