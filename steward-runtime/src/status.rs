//! Status writes with conflict retry
use steward_client::{Client, Error as ClientError};
use steward_core::{Condition, ConditionStatus, DynamicObject, ObjectStatus, Resource, ResourceExt};
use tracing::{debug, warn};

const MAX_ATTEMPTS: usize = 5;

/// The condition type reporting that the controller cannot make progress
pub const DEGRADED: &str = "Degraded";

/// Apply `mutate` to the status of `obj` and persist it through the status write path
///
/// Nothing is written when `mutate` leaves the status unchanged. A conflicting write is
/// retried on a freshly read object, running `mutate` again, so `mutate` must compute the
/// status from what it is given rather than from captured state of an older read.
///
/// # Errors
///
/// Passes store failures through, including a conflict that persisted over every attempt.
pub async fn update_status(
    client: &dyn Client,
    obj: &DynamicObject,
    mutate: impl Fn(&mut ObjectStatus),
) -> Result<DynamicObject, ClientError> {
    let mut current = obj.clone();
    let mut attempt = 1;
    loop {
        let mut next = current.clone();
        mutate(next.status_mut());
        if next.status.clone().unwrap_or_default() == current.status.clone().unwrap_or_default() {
            return Ok(current);
        }
        match client.replace_status(&next).await {
            Ok(updated) => return Ok(updated),
            Err(err) if err.is_conflict() && attempt < MAX_ATTEMPTS => {
                debug!(attempt, object = %obj.name_any(), "status write conflicted, rereading");
                attempt += 1;
                current = client
                    .get(obj.kind(), obj.metadata.namespace.as_deref(), &obj.name_any())
                    .await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Surface a failure on the object as `Degraded=True`
///
/// # Errors
///
/// Passes store failures through.
pub async fn report_degraded(
    client: &dyn Client,
    obj: &DynamicObject,
    reason: &str,
    message: &str,
) -> Result<DynamicObject, ClientError> {
    warn!(object = %obj.name_any(), reason, message, "reporting degraded");
    update_status(client, obj, |status| {
        status.set_condition(Condition::new(DEGRADED, ConditionStatus::True, reason, message));
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::{report_degraded, update_status, DEGRADED};
    use steward_client::{Client, MemoryStore, Verb};
    use steward_core::{Condition, ConditionStatus, DynamicObject, ErrorResponse};

    async fn seeded(store: &MemoryStore) -> DynamicObject {
        store
            .create(&DynamicObject::new("Replicated", "x").within("ns"))
            .await
            .unwrap()
    }

    fn available(status: ConditionStatus) -> Condition {
        Condition::new("Available", status, "Creating", "waiting for replicas")
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let store = MemoryStore::new();
        let obj = seeded(&store).await;
        let obj = update_status(&store, &obj, |s| {
            s.set_condition(available(ConditionStatus::False));
        })
        .await
        .unwrap();
        let revision = store.revision();
        update_status(&store, &obj, |s| {
            s.set_condition(available(ConditionStatus::False));
        })
        .await
        .unwrap();
        update_status(&store, &obj, |_| {}).await.unwrap();
        assert_eq!(store.revision(), revision);
    }

    #[tokio::test]
    async fn conflicts_are_retried_on_a_fresh_read() {
        let store = MemoryStore::new();
        let stale = seeded(&store).await;
        let mut newer = stale.clone();
        newer.metadata.labels.insert("touched".into(), "yes".into());
        store.replace(&newer).await.unwrap();

        let updated = update_status(&store, &stale, |s| s.observed_generation = Some(1))
            .await
            .unwrap();
        assert_eq!(updated.status.unwrap().observed_generation, Some(1));
        assert_eq!(updated.metadata.labels.get("touched").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up() {
        let store = MemoryStore::new();
        let obj = seeded(&store).await;
        for _ in 0..5 {
            store.inject_error(Verb::ReplaceStatus, ErrorResponse::conflict("Replicated", "x"));
        }
        let err = update_status(&store, &obj, |s| s.observed_generation = Some(1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn degraded_is_reported_as_condition() {
        let store = MemoryStore::new();
        let obj = seeded(&store).await;
        let obj = report_degraded(&store, &obj, "MalformedSpec", "replicas must be a number")
            .await
            .unwrap();
        let degraded = obj.status.as_ref().and_then(|s| s.condition(DEGRADED)).unwrap();
        assert!(degraded.is_true());
        assert_eq!(degraded.reason, "MalformedSpec");
    }
}
