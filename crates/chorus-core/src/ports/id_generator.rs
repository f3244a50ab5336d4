//! IdGenerator port.
//!
//! # Implementations
//! - **UlidGenerator**: ULID whose time component comes from a `Clock`.

use ulid::Ulid;

use crate::domain::ids::{SubjectId, TaskId};
use crate::ports::Clock;

/// Generates ids that can be minted by any process without coordination.
///
/// # Thread Safety
/// - `Send + Sync`: shared by the stores across tasks.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_subject_id(&self) -> SubjectId;
}

/// ULID-based generator.
///
/// With a `FixedClock` the timestamp part is deterministic; the random part
/// still keeps ids unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_subject_id(&self) -> SubjectId {
        SubjectId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generated_ids_do_not_repeat() {
        let id_gen = UlidGenerator::new(SystemClock);

        let ids: std::collections::HashSet<_> =
            (0..256).map(|_| id_gen.generate_task_id()).collect();

        assert_eq!(ids.len(), 256);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_task_id();
        let id2 = id_gen.generate_task_id();
        assert_ne!(id1, id2);

        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn subject_and_task_ids_have_their_own_prefix() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.generate_task_id().to_string().starts_with("task-"));
        assert!(id_gen.generate_subject_id().to_string().starts_with("subject-"));
    }
}
