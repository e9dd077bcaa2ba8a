use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// First active reservation on this server that overlaps `span`, ignoring `exclude`.
///
/// The caller holds the server's row lock and has already checked `start < end`.
pub fn find_conflict(
    state: &ServerState,
    span: &Span,
    exclude: Option<ReservationId>,
) -> Option<ReservationId> {
    state
        .overlapping_active(span)
        .find(|r| Some(r.id) != exclude)
        .map(|r| r.id)
}

pub fn has_conflict(state: &ServerState, span: &Span, exclude: Option<ReservationId>) -> bool {
    find_conflict(state, span, exclude).is_some()
}

/// Temporal sanity for a new or edited interval: `start < end`, not in the
/// past, inside the representable range.
pub(crate) fn validate_span(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInput(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInput("timestamp out of range".into()));
    }
    if start < now {
        return Err(EngineError::InvalidInput(format!(
            "start ({start}) is in the past"
        )));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::InvalidInput("reservation too long".into()));
    }
    Ok(span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(spans: &[(ReservationId, Ms, Ms, ReservationStatus)]) -> ServerState {
        let mut s = ServerState::new(1, "s1".into(), Connection::default());
        for &(id, start, end, status) in spans {
            s.insert_reservation(Reservation {
                id,
                server_id: 1,
                user_id: 1,
                span: Span::new(start, end),
                status,
                created_at: 0,
                updated_at: 0,
            });
        }
        s
    }

    #[test]
    fn touching_boundaries_do_not_conflict() {
        let s = server(&[(1, 1000, 2000, ReservationStatus::Active)]);
        assert_eq!(find_conflict(&s, &Span::new(2000, 3000), None), None);
        assert_eq!(find_conflict(&s, &Span::new(0, 1000), None), None);
    }

    #[test]
    fn partial_overlap_conflicts() {
        let s = server(&[(1, 1000, 2000, ReservationStatus::Active)]);
        assert_eq!(find_conflict(&s, &Span::new(1500, 2500), None), Some(1));
        assert_eq!(find_conflict(&s, &Span::new(500, 1001), None), Some(1));
    }

    #[test]
    fn terminal_reservations_never_conflict() {
        let s = server(&[
            (1, 1000, 2000, ReservationStatus::Cancelled),
            (2, 1000, 2000, ReservationStatus::Expired),
        ]);
        assert!(!has_conflict(&s, &Span::new(1000, 2000), None));
    }

    #[test]
    fn exclude_skips_self() {
        let s = server(&[(1, 1000, 2000, ReservationStatus::Active)]);
        assert!(!has_conflict(&s, &Span::new(1500, 2500), Some(1)));
        assert!(has_conflict(&s, &Span::new(1500, 2500), Some(2)));
    }

    #[test]
    fn exclude_still_finds_other_overlaps() {
        let s = server(&[
            (1, 1000, 2000, ReservationStatus::Active),
            (2, 2000, 3000, ReservationStatus::Active),
        ]);
        assert_eq!(find_conflict(&s, &Span::new(1500, 2500), Some(1)), Some(2));
    }

    #[test]
    fn validate_span_rules() {
        assert!(matches!(validate_span(10, 10, 0), Err(EngineError::InvalidInput(_))));
        assert!(matches!(validate_span(20, 10, 0), Err(EngineError::InvalidInput(_))));
        assert!(matches!(validate_span(5, 10, 6), Err(EngineError::InvalidInput(_))));
        assert!(matches!(validate_span(-5, 10, -10), Err(EngineError::InvalidInput(_))));
        assert!(matches!(
            validate_span(0, MAX_SPAN_DURATION_MS + 1, 0),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(validate_span(6, 10, 6).unwrap(), Span::new(6, 10));
    }
}
