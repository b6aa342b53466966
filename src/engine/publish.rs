//! Rate-limited publication of stored origins

use super::Autoloc3;
use crate::model::{time2str, Origin, OriginId};

/// Minimum age of the previous publication before a resend is allowed
/// on arrival count alone
const RESEND_MIN_AGE: f64 = 150.0;

impl Autoloc3 {
    /// Publication thresholds: secondary gap, score, rms and depth
    pub(super) fn publishable(&self, origin: &Origin) -> bool {
        let config = &self.config;
        if origin.quality.azi_gap_secondary > config.max_azi_gap_secondary {
            log::info!(
                "origin {} not sent (too large SGAP of {:3.0} > {:3.0})",
                origin.id,
                origin.quality.azi_gap_secondary,
                config.max_azi_gap_secondary
            );
            return false;
        }
        if origin.score < config.min_score {
            log::info!(
                "origin {} not sent (too low score of {:.1} < {:.1})",
                origin.id,
                origin.score,
                config.min_score
            );
            return false;
        }
        let rms = origin.rms();
        if rms > config.max_rms {
            log::info!(
                "origin {} not sent (too large RMS of {:.1} > {:.1})",
                origin.id,
                rms,
                config.max_rms
            );
            return false;
        }
        if origin.dep > config.max_depth {
            log::info!(
                "origin {} too deep: {:.1} km > {:.1} km (maxDepth)",
                origin.id,
                origin.dep,
                config.max_depth
            );
            return false;
        }
        true
    }

    /// Queue the origins stored since the last call and publish what is due.
    /// An origin seen for the first time is due immediately.
    pub fn report(&mut self) {
        for id in std::mem::take(&mut self.new_origins) {
            self.next_due.entry(id).or_insert(0.0);
            self.outgoing.insert(id);
        }
        self.flush();
    }

    /// Ids in the outgoing queue whose delay has elapsed or that gained
    /// enough phases since their last publication
    fn due_origins(&self, now: f64) -> Vec<OriginId> {
        let dnmax = self.config.publication_interval_pick_count;
        self.outgoing
            .iter()
            .copied()
            .filter(|id| {
                let Some(origin) = self.origins.find(*id) else {
                    return true;
                };
                let due = self.next_due.get(id).copied().unwrap_or(0.0);
                let dn = match self.last_sent.get(id) {
                    Some(previous) => origin
                        .phase_count()
                        .saturating_sub(previous.phase_count()),
                    None => dnmax,
                };
                now - due >= 0.0 || dn >= dnmax
            })
            .collect()
    }

    /// Whether a previously published version makes this one redundant
    fn no_improvement(&self, origin: &Origin, now: f64) -> bool {
        let Some(previous) = self.last_sent.get(&origin.id) else {
            return false;
        };
        if origin.defining_phase_count() > previous.defining_phase_count() {
            return false;
        }
        origin.arrivals.len() <= previous.arrivals.len()
            || now - previous.timestamp < RESEND_MIN_AGE
    }

    /// Publish every due origin of the outgoing queue. Origins the sink
    /// refuses stay queued for the next flush.
    pub fn flush(&mut self) {
        let now = self.now();

        for id in self.due_origins(now) {
            let Some(origin) = self.origins.find(id).cloned() else {
                self.outgoing.remove(&id);
                continue;
            };

            if !self.publishable(&origin) {
                self.outgoing.remove(&id);
                continue;
            }

            if self.no_improvement(&origin, now) {
                log::info!("origin {} not sent (no improvement)", id);
                self.outgoing.remove(&id);
                continue;
            }

            let sent = if self.config.test {
                log::info!("origin {} not sent (test mode)", id);
                true
            } else {
                self.sink.report(&origin)
            };
            if !sent {
                log::warn!("{} sink refused origin {}, keeping it queued", self.sink.sink_type(), id);
                continue;
            }
            log::info!(" OUT {}", origin.oneliner());

            let delay = self.config.publication_interval_time_slope
                * origin.defining_phase_count() as f64
                + self.config.publication_interval_time_intercept;
            let due = if delay < 0.0 { 0.0 } else { now + delay };
            if due == 0.0 {
                log::info!("origin {} next due immediately", id);
            } else {
                log::info!("origin {} next due: {}", id, time2str(due));
            }
            self.next_due.insert(id, due);

            let mut copy = origin;
            copy.timestamp = now;
            self.last_sent.insert(id, copy);
            self.outgoing.remove(&id);
        }
    }

    /// Time at which `id` may be published again, if it was published
    pub fn next_due(&self, id: OriginId) -> Option<f64> {
        self.next_due.get(&id).copied()
    }
}
