//! Per-protocol eligibility and participant selection
//!
//! | Protocol      | Eligible                  | Participants              |
//! |---------------|---------------------------|---------------------------|
//! | KEYGEN        | ACTIVE + PENDING_JOIN     | all eligible              |
//! | QUORUM_CHANGE | ACTIVE + PENDING_JOIN     | all eligible              |
//! | KEYREFRESH    | ACTIVE + PENDING_LEAVE    | all eligible              |
//! | SIGN          | ACTIVE + PENDING_LEAVE    | random threshold subset   |

use std::collections::HashSet;

use crate::error::{CoordinatorError, Result};
use crate::threshold::{select_random_threshold, threshold};
use crate::types::{PartyId, ProtocolType, Validator, ValidatorStatus};

/// Whether a validator in `status` may take part in `protocol`
pub fn is_eligible(protocol: ProtocolType, status: ValidatorStatus) -> bool {
    use ValidatorStatus::*;

    match protocol {
        // joining validators receive shares, leaving ones are already excluded
        ProtocolType::Keygen | ProtocolType::QuorumChange => matches!(status, Active | PendingJoin),
        // leaving validators still hold shares until the quorum change lands
        ProtocolType::Keyrefresh | ProtocolType::Sign => matches!(status, Active | PendingLeave),
    }
}

/// Every validator eligible for `protocol`, in registry order
pub fn eligible_validators(protocol: ProtocolType, validators: &[Validator]) -> Vec<Validator> {
    validators
        .iter()
        .filter(|v| is_eligible(protocol, v.status))
        .cloned()
        .collect()
}

/// Participants the coordinator should invite for `protocol`
///
/// Key-mutating protocols need full agreement, so every eligible validator is
/// required. Signing only needs a quorum and gets a random threshold subset.
pub fn select_participants(protocol: ProtocolType, validators: &[Validator]) -> Vec<Validator> {
    let eligible = eligible_validators(protocol, validators);
    if protocol.requires_all_eligible() {
        eligible
    } else {
        select_random_threshold(&eligible)
    }
}

/// Check a participant list received in a setup message
///
/// All participants must be eligible. Key-mutating protocols must list the
/// eligible set exactly; SIGN must list exactly `threshold(eligible)` parties.
pub fn validate_participants(
    protocol: ProtocolType,
    participants: &[PartyId],
    validators: &[Validator],
) -> Result<()> {
    let eligible: Vec<PartyId> = eligible_validators(protocol, validators)
        .into_iter()
        .map(|v| v.address)
        .collect();

    if eligible.is_empty() {
        return Err(CoordinatorError::InvalidParticipants(format!(
            "no eligible validators for {}",
            protocol
        )));
    }

    let eligible_set: HashSet<&str> = eligible.iter().map(String::as_str).collect();
    let mut seen = HashSet::with_capacity(participants.len());
    for party in participants {
        if !eligible_set.contains(party.as_str()) {
            return Err(CoordinatorError::InvalidParticipants(format!(
                "participant {} is not eligible for {}",
                party, protocol
            )));
        }
        if !seen.insert(party.as_str()) {
            return Err(CoordinatorError::InvalidParticipants(format!(
                "participant {} listed twice",
                party
            )));
        }
    }

    if protocol.requires_all_eligible() {
        if let Some(missing) = eligible.iter().find(|e| !seen.contains(e.as_str())) {
            return Err(CoordinatorError::InvalidParticipants(format!(
                "eligible participant {} is missing from {} participants",
                missing, protocol
            )));
        }
    } else {
        let needed = threshold(eligible.len());
        if participants.len() != needed {
            return Err(CoordinatorError::InvalidParticipants(format!(
                "{} participants, sign requires exactly {} of {} eligible",
                participants.len(),
                needed,
                eligible.len()
            )));
        }
    }

    Ok(())
}
