//! Lifecycle classifier: previous record + current resource -> ordered transitions.

use smallvec::SmallVec;

use crate::{diff_specs, ClassifyError, Identity, NotificationRecord, Transition, WatchedResource};

/// Transitions for one pass, in the order they must be notified.
pub type Transitions = SmallVec<[Transition; 2]>;

pub fn created_message(id: &Identity) -> String { format!("Created the deployment {}", id) }

pub fn updated_message(id: &Identity, diff: &crate::SpecDiff) -> String {
    format!("Updated the deployment {} with: {}", id, diff)
}

pub fn ready_message(id: &Identity) -> String { format!("The deployment {} is ready.", id) }

pub fn deleted_message(id: &Identity) -> String { format!("The deployment {} is deleted.", id) }

/// Classify one reconciliation pass.
///
/// `current == None` means the resource is gone from the store and always yields
/// `Deleted`. Otherwise a missing record, or one left behind by an earlier object with
/// the same identity, yields `Created`, a generation that differs
/// from the record's snapshot yields `Updated`, and independently a resource that is
/// ready at a generation the record has not confirmed yields `Ready` (after the
/// first transition). An empty outcome is reported as a single `NoOp`.
pub fn classify(
    identity: &Identity,
    previous: Option<&NotificationRecord>,
    current: Option<&WatchedResource>,
) -> Result<Transitions, ClassifyError> {
    let mut out = Transitions::new();
    let Some(current) = current else {
        out.push(Transition::Deleted { message: deleted_message(identity) });
        return Ok(out);
    };

    let previous = previous.filter(|p| p.snapshot.same_object(current));
    match previous {
        None => out.push(Transition::Created { message: created_message(identity) }),
        Some(prev) if prev.snapshot.generation != current.generation => {
            let diff = diff_specs(&prev.snapshot.spec, &current.spec)?;
            out.push(Transition::Updated { message: updated_message(identity, &diff), diff });
        }
        Some(_) => {}
    }

    let confirmed = previous.and_then(|p| p.ready_generation);
    if current.is_ready() && confirmed != Some(current.generation) {
        out.push(Transition::Ready { message: ready_message(identity) });
    }

    if out.is_empty() {
        out.push(Transition::NoOp);
    }
    Ok(out)
}
