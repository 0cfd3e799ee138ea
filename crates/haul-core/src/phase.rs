//! Job lifecycle phases.
//!
//! A job moves strictly forward through
//! `Validating → Pulling → Compressing → Ready`, or into `Failed` from any
//! non-terminal phase. Nothing is skipped and nothing is revisited.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One stage of the job lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Checking that the reference exists remotely.
    Validating,
    /// Fetching layers.
    Pulling,
    /// Packaging the pulled layers into one archive.
    Compressing,
    /// Archive is waiting for retrieval.
    Ready,
    /// Terminal failure.
    Failed,
}

impl Phase {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// The only successful successor of this phase.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Validating => Some(Self::Pulling),
            Self::Pulling => Some(Self::Compressing),
            Self::Compressing => Some(Self::Ready),
            Self::Ready | Self::Failed => None,
        }
    }

    /// Whether `to` is a legal transition from `self`.
    pub fn can_advance_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    /// Wire name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Pulling => "pulling",
            Self::Compressing => "compressing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase-specific progress of a running job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseProgress {
    /// No progress reported yet, or the phase has none.
    #[default]
    None,
    /// Layer-level counters while pulling.
    Pulling {
        /// Zero-based index of the layer being fetched.
        layer_index: u32,
        /// Total number of layers.
        layer_count: u32,
        /// Bytes fetched so far for this layer.
        bytes_fetched: u64,
        /// Total bytes of this layer.
        bytes_total: u64,
    },
    /// Last liveness line from the archiver. No completion fraction exists.
    Compressing {
        /// Most recent log line.
        line: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [Phase; 5] = [
        Phase::Validating,
        Phase::Pulling,
        Phase::Compressing,
        Phase::Ready,
        Phase::Failed,
    ];

    #[test]
    fn happy_path_is_legal() {
        assert!(Phase::Validating.can_advance_to(Phase::Pulling));
        assert!(Phase::Pulling.can_advance_to(Phase::Compressing));
        assert!(Phase::Compressing.can_advance_to(Phase::Ready));
    }

    #[test]
    fn failure_reachable_from_every_running_phase() {
        for phase in [Phase::Validating, Phase::Pulling, Phase::Compressing] {
            assert!(phase.can_advance_to(Phase::Failed), "{phase}");
        }
    }

    #[test]
    fn skips_are_rejected() {
        assert!(!Phase::Validating.can_advance_to(Phase::Compressing));
        assert!(!Phase::Validating.can_advance_to(Phase::Ready));
        assert!(!Phase::Pulling.can_advance_to(Phase::Ready));
    }

    #[test]
    fn revisits_are_rejected() {
        assert!(!Phase::Pulling.can_advance_to(Phase::Pulling));
        assert!(!Phase::Compressing.can_advance_to(Phase::Pulling));
    }

    #[test]
    fn terminal_phases_are_final() {
        for to in ALL {
            assert!(!Phase::Ready.can_advance_to(to));
            assert!(!Phase::Failed.can_advance_to(to));
        }
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::Compressing).unwrap(),
            "\"compressing\""
        );
    }

    #[test]
    fn progress_is_tagged() {
        let p = PhaseProgress::Compressing {
            line: "checkpoint 3".into(),
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["kind"], "compressing");
        assert_eq!(json["line"], "checkpoint 3");
    }

    fn rank(phase: Phase) -> u8 {
        match phase {
            Phase::Validating => 0,
            Phase::Pulling => 1,
            Phase::Compressing => 2,
            Phase::Ready => 3,
            Phase::Failed => 4,
        }
    }

    proptest! {
        #[test]
        fn any_accepted_walk_is_a_prefix_or_ends_failed(
            attempts in proptest::collection::vec(0usize..5, 0..20)
        ) {
            let mut current = Phase::Validating;
            let mut walk = vec![current];
            for i in attempts {
                let to = ALL[i];
                if current.can_advance_to(to) {
                    current = to;
                    walk.push(to);
                }
            }
            let happy = [Phase::Validating, Phase::Pulling, Phase::Compressing, Phase::Ready];
            if *walk.last().unwrap() == Phase::Failed {
                let before = &walk[..walk.len() - 1];
                prop_assert_eq!(before, &happy[..before.len()]);
            } else {
                prop_assert_eq!(&walk[..], &happy[..walk.len()]);
            }
            for pair in walk.windows(2) {
                prop_assert!(rank(pair[0]) < rank(pair[1]));
            }
        }
    }
}
