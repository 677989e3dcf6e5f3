//! Retention selection: which backups a cleanup deletes

use crate::config::RetentionPolicy;
use crate::providers::RemoteObject;
use chrono::{DateTime, Duration, Utc};

/// Split `objects` into the ones to keep and the ones to delete.
///
/// Backups are ordered newest first by modification time, ties broken by
/// name (artifact names sort by timestamp). Everything past `max_count`, and
/// everything modified before `now - max_age_days`, is expired.
pub fn select_expired(
    mut objects: Vec<RemoteObject>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> (Vec<RemoteObject>, Vec<RemoteObject>) {
    objects.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));

    let cutoff = policy
        .max_age_days
        .map(|days| now - Duration::days(i64::from(days)));
    let max_count = policy.max_count.unwrap_or(usize::MAX);

    let mut keep = Vec::new();
    let mut expired = Vec::new();
    for (index, object) in objects.into_iter().enumerate() {
        let too_many = index >= max_count;
        let too_old = cutoff.is_some_and(|cutoff| object.modified < cutoff);
        if too_many || too_old {
            expired.push(object);
        } else {
            keep.push(object);
        }
    }
    (keep, expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn backups(now: DateTime<Utc>, ages_in_days: &[i64]) -> Vec<RemoteObject> {
        ages_in_days
            .iter()
            .enumerate()
            .map(|(i, age)| {
                RemoteObject::new(
                    format!("homeserver_backup_{}.tar.gz", i + 1),
                    10,
                    now - Duration::days(*age),
                )
            })
            .collect()
    }

    fn names(objects: &[RemoteObject]) -> Vec<&str> {
        objects.iter().map(|o| o.name.as_str()).collect()
    }

    #[test]
    fn test_max_count_keeps_newest() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        // t1 is the oldest, t5 the newest
        let objects = backups(now, &[5, 4, 3, 2, 1]);
        let (keep, expired) = select_expired(objects, &RetentionPolicy::keep_last(2), now);

        assert_eq!(
            names(&keep),
            vec!["homeserver_backup_5.tar.gz", "homeserver_backup_4.tar.gz"]
        );
        assert_eq!(expired.len(), 3);
    }

    #[test]
    fn test_max_age() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let objects = backups(now, &[40, 31, 29, 1]);
        let policy = RetentionPolicy::new(Some(30), None);
        let (keep, expired) = select_expired(objects, &policy, now);

        assert_eq!(
            names(&expired),
            vec!["homeserver_backup_2.tar.gz", "homeserver_backup_1.tar.gz"]
        );
        assert_eq!(keep.len(), 2);
    }

    #[test]
    fn test_both_limits_apply() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let objects = backups(now, &[60, 3, 2, 1]);
        let (keep, expired) = select_expired(objects, &RetentionPolicy::new(Some(30), Some(2)), now);
        assert_eq!(keep.len(), 2);
        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let now = Utc::now();
        let objects = backups(now, &[400, 1]);
        let (keep, expired) = select_expired(objects, &RetentionPolicy::new(None, None), now);
        assert_eq!(keep.len(), 2);
        assert!(expired.is_empty());
    }

    #[test]
    fn test_equal_mtimes_fall_back_to_name() {
        let now = Utc::now();
        let objects = vec![
            RemoteObject::new("homeserver_backup_20240101_000000.tar.gz", 1, now),
            RemoteObject::new("homeserver_backup_20240103_000000.tar.gz", 1, now),
            RemoteObject::new("homeserver_backup_20240102_000000.tar.gz", 1, now),
        ];
        let (keep, _) = select_expired(objects, &RetentionPolicy::keep_last(1), now);
        assert_eq!(names(&keep), vec!["homeserver_backup_20240103_000000.tar.gz"]);
    }
}
