//! Convergence decision table
//!
//! Pure functions mapping one tick's observations onto the action to take
//! and the state to publish. Every instance runs the same table over the
//! same inputs, which is what lets the fleet agree on a single seeder
//! without a coordinator.

use serde::{Deserialize, Serialize};

use crate::etcd::quorum;

/// State published on the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "OK")]
    Ok,
}

/// Status one peer exposes, collected during `evaluate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub name: String,
    pub state: State,
    /// Newest snapshot revision the peer knows of; only meaningful in START
    pub revision: i64,
}

/// Everything `execute` needs to pick a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub cluster_size: usize,
    pub etcd_running: bool,
    pub etcd_healthy: bool,
    pub is_seeder: bool,
    /// Peers whose last published state is OK
    pub states_ok: usize,
    /// Peers whose last published state is START
    pub states_start: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stop the store (snapshotting first) and exit the process
    Shutdown { graceful: bool },
    /// Join the healthy cluster
    Join,
    /// Healthy and running; nothing to do
    Standby,
    /// Locally unhealthy while a majority still reports OK; wait for the
    /// peers to confirm before destroying anything
    WaitMajority,
    /// A majority agrees health is lost: flush a snapshot and leave
    Leave,
    /// Publish START and the best known snapshot revision, then wait for the
    /// whole fleet to do the same
    PrepareSeed,
    /// Every peer is in START and this instance is the elected seeder
    Seed,
    /// No row matched; should be unreachable
    NoAdequateAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub next_state: State,
}

/// Sort peer states into the canonical seeder-election order.
///
/// The tail element is the seeder candidate: highest revision wins, and among
/// equal revisions the lexicographically smallest name wins. Every peer
/// observing the same states computes the same candidate.
pub fn sort_peer_states(peers: &mut [PeerState]) {
    peers.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| b.name.cmp(&a.name))
    });
}

/// Whether `self_name` is the elected seeder for the given peer states.
pub fn is_seeder(peers: &mut [PeerState], self_name: &str) -> bool {
    sort_peer_states(peers);
    peers
        .last()
        .map(|candidate| candidate.name == self_name)
        .unwrap_or(false)
}

/// The decision table; rows are evaluated first-match.
pub fn decide(shutdown: bool, view: &View) -> Decision {
    // Row 1: shutdown signal received.
    if shutdown {
        return Decision {
            action: Action::Shutdown {
                graceful: view.etcd_healthy,
            },
            next_state: State::Pending,
        };
    }

    match (view.etcd_healthy, view.etcd_running) {
        // Row 2: the cluster is healthy but we are not part of it.
        (true, false) => Decision {
            action: Action::Join,
            next_state: State::Pending,
        },
        // Row 3: healthy and running.
        (true, true) => Decision {
            action: Action::Standby,
            next_state: State::Ok,
        },
        // Rows 4 and 5: running but the cluster looks unhealthy from here.
        (false, true) => {
            if view.states_ok >= quorum(view.cluster_size) {
                Decision {
                    action: Action::WaitMajority,
                    next_state: State::Pending,
                }
            } else {
                Decision {
                    action: Action::Leave,
                    next_state: State::Pending,
                }
            }
        }
        // Rows 6 and 7: nothing runs locally; converge on a seeder.
        (false, false) => {
            if view.states_start == view.cluster_size && view.is_seeder {
                Decision {
                    action: Action::Seed,
                    next_state: State::Start,
                }
            } else {
                Decision {
                    action: Action::PrepareSeed,
                    next_state: State::Start,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str, state: State, revision: i64) -> PeerState {
        PeerState {
            name: name.to_string(),
            state,
            revision,
        }
    }

    #[test]
    fn test_seeder_highest_revision_wins() {
        let mut peers = vec![
            peer("a", State::Start, 0),
            peer("b", State::Start, 0),
            peer("c", State::Start, 0x2a),
        ];
        assert!(is_seeder(&mut peers.clone(), "c"));
        assert!(!is_seeder(&mut peers, "a"));
    }

    #[test]
    fn test_seeder_tie_break_smallest_name() {
        let mut peers = vec![
            peer("c", State::Start, 7),
            peer("a", State::Start, 7),
            peer("b", State::Start, 7),
        ];
        assert!(is_seeder(&mut peers.clone(), "a"));
        assert!(!is_seeder(&mut peers.clone(), "b"));
        assert!(!is_seeder(&mut peers, "c"));
    }

    #[test]
    fn test_seeder_is_unanimous() {
        // Every node applying the rule to the same states must elect the
        // same name, regardless of the order the states arrived in.
        let base = vec![
            peer("b", State::Start, 3),
            peer("a", State::Start, 9),
            peer("c", State::Start, 9),
            peer("d", State::Start, 1),
        ];

        let mut orderings = vec![base.clone()];
        let mut reversed = base.clone();
        reversed.reverse();
        orderings.push(reversed);
        let mut rotated = base.clone();
        rotated.rotate_left(2);
        orderings.push(rotated);

        for mut peers in orderings {
            sort_peer_states(&mut peers);
            assert_eq!(peers.last().unwrap().name, "a");
        }
    }

    #[test]
    fn test_seeder_empty_states() {
        let mut peers: Vec<PeerState> = Vec::new();
        assert!(!is_seeder(&mut peers, "a"));
    }

    #[test]
    fn test_row_1_shutdown_overrides_everything() {
        let view = View {
            cluster_size: 3,
            etcd_running: true,
            etcd_healthy: true,
            is_seeder: true,
            states_ok: 3,
            states_start: 0,
        };
        let decision = decide(true, &view);
        assert_eq!(decision.action, Action::Shutdown { graceful: true });
        assert_eq!(decision.next_state, State::Pending);

        let unhealthy = View {
            etcd_healthy: false,
            ..view
        };
        assert_eq!(
            decide(true, &unhealthy).action,
            Action::Shutdown { graceful: false }
        );
    }

    #[test]
    fn test_row_2_join() {
        let view = View {
            cluster_size: 3,
            etcd_running: false,
            etcd_healthy: true,
            is_seeder: false,
            states_ok: 2,
            states_start: 0,
        };
        let decision = decide(false, &view);
        assert_eq!(decision.action, Action::Join);
        assert_eq!(decision.next_state, State::Pending);
    }

    #[test]
    fn test_row_3_standby() {
        let view = View {
            cluster_size: 3,
            etcd_running: true,
            etcd_healthy: true,
            is_seeder: false,
            states_ok: 3,
            states_start: 0,
        };
        let decision = decide(false, &view);
        assert_eq!(decision.action, Action::Standby);
        assert_eq!(decision.next_state, State::Ok);
    }

    #[test]
    fn test_row_4_minority_partition_waits() {
        // 5-node cluster, this node is isolated with one other: the three
        // reachable peers still report OK, so nothing is destroyed.
        let view = View {
            cluster_size: 5,
            etcd_running: true,
            etcd_healthy: false,
            is_seeder: false,
            states_ok: 3,
            states_start: 0,
        };
        let decision = decide(false, &view);
        assert_eq!(decision.action, Action::WaitMajority);
        assert_eq!(decision.next_state, State::Pending);
    }

    #[test]
    fn test_row_5_majority_lost_leaves() {
        let view = View {
            cluster_size: 5,
            etcd_running: true,
            etcd_healthy: false,
            is_seeder: false,
            states_ok: 0,
            states_start: 0,
        };
        let decision = decide(false, &view);
        assert_eq!(decision.action, Action::Leave);
        assert_eq!(decision.next_state, State::Pending);
    }

    #[test]
    fn test_row_6_waits_for_whole_fleet() {
        // Not everyone is in START yet.
        let view = View {
            cluster_size: 3,
            etcd_running: false,
            etcd_healthy: false,
            is_seeder: true,
            states_ok: 0,
            states_start: 2,
        };
        let decision = decide(false, &view);
        assert_eq!(decision.action, Action::PrepareSeed);
        assert_eq!(decision.next_state, State::Start);

        // Everyone is in START but somebody else seeds.
        let not_seeder = View {
            states_start: 3,
            is_seeder: false,
            ..view
        };
        assert_eq!(decide(false, &not_seeder).action, Action::PrepareSeed);
    }

    #[test]
    fn test_row_7_seeds() {
        let view = View {
            cluster_size: 3,
            etcd_running: false,
            etcd_healthy: false,
            is_seeder: true,
            states_ok: 0,
            states_start: 3,
        };
        let decision = decide(false, &view);
        assert_eq!(decision.action, Action::Seed);
        assert_eq!(decision.next_state, State::Start);
    }

    #[test]
    fn test_table_is_exhaustive() {
        // Sweep every boolean combination plus count edge cases; no input may
        // reach the fallback row.
        for shutdown in [false, true] {
            for etcd_running in [false, true] {
                for etcd_healthy in [false, true] {
                    for is_seeder in [false, true] {
                        for cluster_size in [0usize, 1, 3, 5] {
                            for states_ok in 0..=cluster_size {
                                for states_start in 0..=cluster_size {
                                    let view = View {
                                        cluster_size,
                                        etcd_running,
                                        etcd_healthy,
                                        is_seeder,
                                        states_ok,
                                        states_start,
                                    };
                                    let decision = decide(shutdown, &view);
                                    assert_ne!(
                                        decision.action,
                                        Action::NoAdequateAction,
                                        "unhandled input: shutdown={} view={:?}",
                                        shutdown,
                                        view
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_row_order_is_observed() {
        // Shutdown (row 1) must win over a healthy standby (row 3), and the
        // majority check (row 4) must be evaluated before leaving (row 5).
        let healthy = View {
            cluster_size: 3,
            etcd_running: true,
            etcd_healthy: true,
            is_seeder: false,
            states_ok: 3,
            states_start: 0,
        };
        assert!(matches!(
            decide(true, &healthy).action,
            Action::Shutdown { .. }
        ));

        let borderline = View {
            cluster_size: 3,
            etcd_running: true,
            etcd_healthy: false,
            is_seeder: false,
            states_ok: 2, // exactly ⌊3/2⌋+1
            states_start: 0,
        };
        assert_eq!(decide(false, &borderline).action, Action::WaitMajority);

        let below = View {
            states_ok: 1,
            ..borderline
        };
        assert_eq!(decide(false, &below).action, Action::Leave);
    }

    #[test]
    fn test_scenario_cold_start() {
        // Three empty nodes publish START with revision 0; the smallest name
        // seeds, the others keep waiting until the seeder's cluster is up.
        let names = ["a", "b", "c"];
        let mut states: Vec<PeerState> = names
            .iter()
            .map(|name| peer(name, State::Start, 0))
            .collect();

        for name in names {
            let view = View {
                cluster_size: 3,
                etcd_running: false,
                etcd_healthy: false,
                is_seeder: is_seeder(&mut states, name),
                states_ok: 0,
                states_start: 3,
            };
            let expected = if name == "a" {
                Action::Seed
            } else {
                Action::PrepareSeed
            };
            assert_eq!(decide(false, &view).action, expected, "node {}", name);
        }

        // Once the seeder is up, the remaining nodes observe a healthy
        // cluster and join.
        for name in ["b", "c"] {
            let view = View {
                cluster_size: 3,
                etcd_running: false,
                etcd_healthy: true,
                is_seeder: is_seeder(&mut states, name),
                states_ok: 0,
                states_start: 3,
            };
            assert_eq!(decide(false, &view).action, Action::Join, "node {}", name);
        }
    }

    #[test]
    fn test_scenario_seed_from_snapshot() {
        // Peer c knows a snapshot at revision 0x2a, higher than the others;
        // c must be the seeder everywhere despite having the largest name.
        let mut states = vec![
            peer("a", State::Start, 0),
            peer("b", State::Start, 0),
            peer("c", State::Start, 0x2a),
        ];

        for name in ["a", "b"] {
            assert!(!is_seeder(&mut states, name));
        }
        assert!(is_seeder(&mut states, "c"));

        sort_peer_states(&mut states);
        assert_eq!(states.last().unwrap().revision, 0x2a);
    }

    #[test]
    fn test_scenario_minority_isolation() {
        // 5-node cluster, 2 nodes partitioned away. The isolated pair sees no
        // OK peer and leaves; the majority keeps running untouched.
        let isolated = View {
            cluster_size: 5,
            etcd_running: true,
            etcd_healthy: false,
            is_seeder: false,
            states_ok: 0,
            states_start: 0,
        };
        assert_eq!(decide(false, &isolated).action, Action::Leave);

        let majority = View {
            cluster_size: 5,
            etcd_running: true,
            etcd_healthy: true,
            is_seeder: false,
            states_ok: 3,
            states_start: 0,
        };
        assert_eq!(decide(false, &majority).action, Action::Standby);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&State::Ok).unwrap(), "\"OK\"");
        assert_eq!(serde_json::to_string(&State::Start).unwrap(), "\"START\"");
        assert_eq!(
            serde_json::to_string(&State::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&State::Unknown).unwrap(),
            "\"UNKNOWN\""
        );
        let state: State = serde_json::from_str("\"START\"").unwrap();
        assert_eq!(state, State::Start);
    }
}
