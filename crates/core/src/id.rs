//! Unique identifiers for Spire entities.
//!
//! Strongly-typed UUID identifiers built with
//! [`domain-key`](https://crates.io/crates/domain-key) `Uuid<D>` wrappers. Each
//! identifier type is parameterized by its own domain marker, so a [`RunId`]
//! can never be passed where a [`TicketId`] is expected.
//!
//! All ID types are `Copy` (16 bytes) and support `v4()`, `parse(&str)`,
//! serde (as a UUID string), `Display`, `Eq`, `Ord` and `Hash`.

use domain_key::define_uuid;

pub use domain_key::UuidParseError;

define_uuid!(pub RunIdDomain => RunId);
define_uuid!(pub TicketIdDomain => TicketId);
define_uuid!(pub TenantIdDomain => TenantId);

/// Namespace for name-derived ticket identifiers.
const TICKET_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6a1f_3c2e_9b4d_5e07_8c21_d0f4_a9b3_7e65);

/// Derive the ticket identifier for an interrupt raised at a checkpoint.
///
/// The same `(run, checkpoint, interrupt)` triple always maps to the same
/// ticket, so re-issuing a ticket after a crash finds the original row
/// instead of creating a duplicate.
#[must_use]
pub fn ticket_id_for(run_id: RunId, checkpoint: crate::CheckpointId, interrupt_id: &str) -> TicketId {
    let name = format!("{run_id}:{}:{interrupt_id}", checkpoint.get());
    TicketId::from(uuid::Uuid::new_v5(&TICKET_NAMESPACE, name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CheckpointId;

    #[test]
    fn run_id_v4_creates_non_nil_uuid() {
        assert!(!RunId::v4().is_nil());
    }

    #[test]
    fn id_parse_valid_uuid_string_succeeds() {
        let id = RunId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn id_parse_invalid_string_returns_error() {
        assert!(TicketId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn id_serde_json_roundtrip() {
        let id = TenantId::v4();
        let json = serde_json::to_string(&id).unwrap();
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn ticket_id_is_deterministic_per_interrupt() {
        let run = RunId::v4();
        let a = ticket_id_for(run, CheckpointId::new(2), "approve_refund");
        let b = ticket_id_for(run, CheckpointId::new(2), "approve_refund");
        assert_eq!(a, b);
    }

    #[test]
    fn ticket_id_differs_across_checkpoints_and_interrupts() {
        let run = RunId::v4();
        let base = ticket_id_for(run, CheckpointId::new(2), "approve_refund");
        assert_ne!(base, ticket_id_for(run, CheckpointId::new(3), "approve_refund"));
        assert_ne!(base, ticket_id_for(run, CheckpointId::new(2), "approve_payout"));
        assert_ne!(base, ticket_id_for(RunId::v4(), CheckpointId::new(2), "approve_refund"));
    }
}
