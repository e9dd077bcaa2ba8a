use crate::model::*;
use crate::observability::RESERVATIONS_EXPIRED_TOTAL;

use super::{Engine, EngineError};

impl Engine {
    /// Expire every active reservation with `end < now` and recompute each
    /// affected server's status. Servers are processed one row lock at a time.
    /// Returns how many reservations were expired; 0 when nothing lapsed.
    pub async fn sweep_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let mut expired = 0;
        for shared in self.servers_by_id() {
            let mut state = shared.write().await;
            if state.deleted {
                continue;
            }
            let lapsed: Vec<ReservationId> = state
                .reservations
                .iter()
                .filter(|r| r.is_active() && r.span.end < now)
                .map(|r| r.id)
                .collect();
            let server_id = state.id;
            for id in lapsed {
                self.commit(
                    Event::ReservationExpired {
                        id,
                        server_id,
                        at: now,
                    },
                    &mut [&mut *state],
                )
                .await?;
                expired += 1;
                tracing::debug!(reservation_id = id, server_id, "reservation expired");
            }
        }
        if expired > 0 {
            metrics::counter!(RESERVATIONS_EXPIRED_TOTAL).increment(expired as u64);
        }
        Ok(expired)
    }
}
