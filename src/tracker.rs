use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Terminal routing decision for a completed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Valid,
    Invalid,
}

impl Outcome {
    /// Destination folder files of the batch are relocated to
    pub fn destination_folder(&self) -> &'static str {
        match self {
            Self::Valid => "valid-set",
            Self::Invalid => "invalid-set",
        }
    }
}

/// Lifecycle phase of one tracker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Collecting file-arrival signals until the expected set is covered
    Accumulating,
    /// Expected set covered and the batch claimed; validation underway
    Validating,
    /// Finished; the instance does no further work
    Terminal(Outcome),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accumulating => write!(f, "accumulating"),
            Self::Validating => write!(f, "validating"),
            Self::Terminal(Outcome::Valid) => write!(f, "terminal_valid"),
            Self::Terminal(Outcome::Invalid) => write!(f, "terminal_invalid"),
        }
    }
}

/// What the instance should do after a file-arrival signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Expected set not yet covered; suspend until the next signal
    Wait,
    /// Every expected type has arrived; attempt to claim validation
    BeginValidation,
}

/// Per-batch-key completion state machine.
///
/// Pure and deterministic: no I/O and no clock. Side effects (journal
/// writes, the validate-once claim, validation, relocation) belong to the
/// dispatcher, which makes replaying a restarted instance from its journal
/// trivially repeatable.
#[derive(Debug, Clone)]
pub struct Tracker {
    batch_key: String,
    expected: BTreeSet<String>,
    received: BTreeSet<String>,
    phase: Phase,
}

impl Tracker {
    /// Create a tracker for a batch with the resolved expected set
    pub fn new(batch_key: impl Into<String>, expected: BTreeSet<String>) -> Self {
        Self {
            batch_key: batch_key.into(),
            expected,
            received: BTreeSet::new(),
            phase: Phase::Accumulating,
        }
    }

    pub fn batch_key(&self) -> &str {
        &self.batch_key
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn received(&self) -> &BTreeSet<String> {
        &self.received
    }

    /// Expected types not seen yet
    pub fn missing(&self) -> BTreeSet<String> {
        self.expected.difference(&self.received).cloned().collect()
    }

    /// Record one arrived file type.
    ///
    /// Duplicates are a no-op: `received` is a set, not a multiset. Returns
    /// [`Advance::BeginValidation`] exactly when the received set covers the
    /// expected set; arrival order is irrelevant, only the superset test
    /// matters. Signals after leaving `Accumulating` are ignored.
    pub fn observe_file(&mut self, file_type: &str) -> Advance {
        if self.phase != Phase::Accumulating {
            return Advance::Wait;
        }

        self.received.insert(file_type.to_lowercase());

        if self.received.is_superset(&self.expected) {
            Advance::BeginValidation
        } else {
            Advance::Wait
        }
    }

    /// Enter the validating phase after winning the store claim
    pub fn begin_validation(&mut self) {
        debug_assert_eq!(self.phase, Phase::Accumulating);
        self.phase = Phase::Validating;
    }

    /// Enter the terminal phase; the tracker accepts no further work
    pub fn complete(&mut self, outcome: Outcome) {
        debug_assert_eq!(self.phase, Phase::Validating);
        self.phase = Phase::Terminal(outcome);
    }
}
