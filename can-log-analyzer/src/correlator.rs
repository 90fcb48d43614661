//! Root-cause correlation
//!
//! Groups error events into incident clusters. This is best-effort grouping, not
//! causal inference: a cluster says "these faults happened close together and
//! probably belong to one incident", nothing more.
//!
//! Events are visited in `(timestamp, id)` order. A cluster is open for an event
//! while the gap between the cluster's last event and the event is within the
//! window. Each event joins, in order of preference:
//!
//! 1. an open cluster sharing its bus ID or J1939 PGN family,
//! 2. an open cluster on the same channel,
//! 3. an open cluster whose first event is itself within the window (any channel,
//!    console text included),
//! 4. a new cluster.
//!
//! Linked events chain from a cluster's last event; unlinked events from other
//! channels only attach near the cluster's origin.
//!
//! Among several candidates the cluster with the latest last event wins, then
//! the oldest cluster. The result depends only on the event set and the window.

use crate::config::CorrelationConfig;
use crate::errors::j1939::J1939Id;
use crate::types::{ErrorEvent, Severity, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Strongest link that pulled events into a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterAffinity {
    /// Only one event
    Single,
    /// Temporal proximity to the cluster's first event, across channels
    Proximity,
    /// Temporal proximity on the same channel
    Temporal,
    /// Same J1939 parameter group family
    PgnFamily,
    /// Same bus ID
    SharedBusId,
}

/// A group of related error events
///
/// Holds event IDs only; the events stay owned by the analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentCluster {
    pub id: usize,
    /// Member event IDs in visiting order
    pub event_ids: Vec<u64>,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Earliest member, the most likely origin of the incident
    pub root_candidate: u64,
    pub affinity: ClusterAffinity,
    pub max_severity: Severity,
    pub bus_ids: BTreeSet<u32>,
    pub channels: BTreeSet<u8>,
}

#[derive(Debug)]
struct OpenCluster {
    cluster: IncidentCluster,
    families: BTreeSet<u32>,
}

fn pgn_family(event: &ErrorEvent) -> Option<u32> {
    event
        .bus_id
        .filter(|id| *id > 0x7FF)
        .map(|id| J1939Id::from_can_id(id).family())
}

/// Deterministic, window-based clustering of error events
#[derive(Debug, Clone)]
pub struct Correlator {
    window: f64,
}

impl Correlator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            window: config.window_ms.max(0.0) / 1000.0,
        }
    }

    /// Group `events` into incident clusters
    pub fn correlate(&self, events: &[ErrorEvent]) -> Vec<IncidentCluster> {
        let mut order: Vec<&ErrorEvent> = events.iter().collect();
        order.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        let mut clusters: Vec<OpenCluster> = Vec::new();
        // Indices into `clusters` that may still accept events
        let mut open: Vec<usize> = Vec::new();

        for event in order {
            let t = event.timestamp;
            open.retain(|&i| t - clusters[i].cluster.end <= self.window);

            let family = pgn_family(event);
            let affine = self.pick(&clusters, &open, |c| {
                event.bus_id.map_or(false, |id| c.cluster.bus_ids.contains(&id))
                    || family.map_or(false, |f| c.families.contains(&f))
            });

            let (index, link) = match affine {
                Some(i) => {
                    let shares_bus = event.bus_id.map_or(false, |id| clusters[i].cluster.bus_ids.contains(&id));
                    let link = if shares_bus {
                        ClusterAffinity::SharedBusId
                    } else {
                        ClusterAffinity::PgnFamily
                    };
                    (i, link)
                }
                None => match self
                    .pick(&clusters, &open, |c| c.cluster.channels.contains(&event.channel))
                    .map(|i| (i, ClusterAffinity::Temporal))
                    .or_else(|| {
                        self.pick(&clusters, &open, |c| t - c.cluster.start <= self.window)
                            .map(|i| (i, ClusterAffinity::Proximity))
                    }) {
                    Some(joined) => joined,
                    None => {
                        clusters.push(OpenCluster {
                            cluster: IncidentCluster {
                                id: clusters.len(),
                                event_ids: Vec::new(),
                                start: t,
                                end: t,
                                root_candidate: event.id,
                                affinity: ClusterAffinity::Single,
                                max_severity: event.severity,
                                bus_ids: BTreeSet::new(),
                                channels: BTreeSet::new(),
                            },
                            families: BTreeSet::new(),
                        });
                        open.push(clusters.len() - 1);
                        (clusters.len() - 1, ClusterAffinity::Single)
                    }
                },
            };

            let open_cluster = &mut clusters[index];
            let cluster = &mut open_cluster.cluster;
            cluster.event_ids.push(event.id);
            cluster.end = cluster.end.max(t);
            cluster.affinity = cluster.affinity.max(link);
            cluster.max_severity = cluster.max_severity.max(event.severity);
            cluster.channels.insert(event.channel);
            if let Some(id) = event.bus_id {
                cluster.bus_ids.insert(id);
            }
            if let Some(f) = family {
                open_cluster.families.insert(f);
            }
        }

        log::debug!("Correlated {} events into {} clusters", events.len(), clusters.len());
        clusters.into_iter().map(|c| c.cluster).collect()
    }

    /// Latest-ending open cluster matching `accept`, oldest first on ties
    fn pick(&self, clusters: &[OpenCluster], open: &[usize], accept: impl Fn(&OpenCluster) -> bool) -> Option<usize> {
        open.iter()
            .copied()
            .filter(|&i| accept(&clusters[i]))
            .fold(None, |best: Option<usize>, i| match best {
                Some(b) if clusters[b].cluster.end > clusters[i].cluster.end => Some(b),
                Some(b) if clusters[b].cluster.end == clusters[i].cluster.end && b < i => Some(b),
                _ => Some(i),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorType;

    fn event(id: u64, t: f64, bus_id: Option<u32>, channel: u8) -> ErrorEvent {
        ErrorEvent {
            id,
            error_type: ErrorType::ErrorFrame,
            severity: Severity::High,
            timestamp: t,
            source_message_ref: None,
            bus_id,
            channel,
            code: "E".to_string(),
            description: String::new(),
        }
    }

    fn correlator(window_ms: f64) -> Correlator {
        Correlator::new(&CorrelationConfig { window_ms })
    }

    #[test]
    fn test_window_splits_clusters() {
        let events = vec![
            event(0, 0.0, Some(0x100), 1),
            event(1, 0.3, Some(0x100), 1),
            event(2, 1.5, Some(0x100), 1),
        ];
        let clusters = correlator(500.0).correlate(&events);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].event_ids, vec![0, 1]);
        assert_eq!(clusters[0].affinity, ClusterAffinity::SharedBusId);
        assert_eq!(clusters[0].root_candidate, 0);
        assert_eq!(clusters[1].affinity, ClusterAffinity::Single);
    }

    #[test]
    fn test_window_chains_from_last_event() {
        let events: Vec<ErrorEvent> = (0..5).map(|i| event(i, i as f64 * 0.4, Some(0x1), 1)).collect();
        let clusters = correlator(500.0).correlate(&events);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].end, 1.6);
    }

    #[test]
    fn test_shared_bus_id_preferred_over_proximity() {
        let events = vec![
            event(0, 0.0, Some(0x100), 1),
            event(1, 0.05, Some(0x200), 1),
            event(2, 0.1, Some(0x100), 1),
        ];
        let clusters = correlator(500.0).correlate(&events);
        // 0x200 joins temporally, 0x100 rejoins through its bus ID
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].event_ids, vec![0, 1, 2]);

        // 0x100 on channel 2 prefers the cluster holding 0x100 over the one on its own channel
        let two_open = vec![
            event(0, 0.0, Some(0x100), 1),
            event(1, 0.4, Some(0x100), 1),
            event(2, 0.6, Some(0x200), 2),
            event(3, 0.7, Some(0x100), 2),
        ];
        let clusters = correlator(500.0).correlate(&two_open);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].event_ids, vec![0, 1, 3]);
        assert_eq!(clusters[0].affinity, ClusterAffinity::SharedBusId);
        assert_eq!(clusters[1].event_ids, vec![2]);
    }

    #[test]
    fn test_pgn_family_links_j1939_sources() {
        let events = vec![
            event(0, 0.0, Some(0x18FECA00), 1),
            event(1, 0.1, Some(0x18FECB17), 2),
        ];
        let clusters = correlator(500.0).correlate(&events);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].affinity, ClusterAffinity::PgnFamily);
    }

    #[test]
    fn test_cross_channel_events_share_a_cluster() {
        let events = vec![event(0, 1.0, Some(0x100), 1), event(1, 1.001, Some(0x200), 2)];
        let clusters = correlator(500.0).correlate(&events);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].event_ids, vec![0, 1]);
        assert_eq!(clusters[0].affinity, ClusterAffinity::Proximity);
        assert_eq!(clusters[0].channels, BTreeSet::from([1, 2]));

        // console text (channel 0, no bus ID) next to a bus fault
        let events = vec![event(0, 1.0, Some(0x100), 1), event(1, 1.01, None, 0)];
        assert_eq!(correlator(500.0).correlate(&events).len(), 1);
    }

    #[test]
    fn test_unlinked_events_only_attach_near_the_origin() {
        let events = vec![
            event(0, 0.0, Some(0x100), 1),
            event(1, 0.4, Some(0x100), 1),
            event(2, 0.7, Some(0x200), 2),
        ];
        let clusters = correlator(500.0).correlate(&events);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[1].event_ids, vec![2]);
        assert_eq!(clusters[1].affinity, ClusterAffinity::Single);
    }

    #[test]
    fn test_deterministic_under_input_permutation() {
        let events: Vec<ErrorEvent> = (0..30)
            .map(|i| event(i, (i % 7) as f64 * 0.2, Some(0x100 + (i % 3) as u32), (i % 2) as u8))
            .collect();
        let first = correlator(300.0).correlate(&events);

        let mut reversed = events.clone();
        reversed.reverse();
        assert_eq!(correlator(300.0).correlate(&reversed), first);
        assert_eq!(correlator(300.0).correlate(&events), first);

        let total: usize = first.iter().map(|c| c.event_ids.len()).sum();
        assert_eq!(total, 30);
    }
}
