use uuid::Uuid;

/// Redis key semantics shared by the worker and anything that feeds it.
/// Defines naming only, not runtime logic, so producers and the worker
/// never drift on key shapes.

pub const REPORTS_CHANNEL: &str = "reports";
pub const FILE_FIELD_PREFIX: &str = "file:";
pub const PERSISTENT_FIELD: &str = "options:persistent";

/// Intake priority, highest first. The worker polls the queues in this
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

pub fn queue_key(priority: Priority) -> String {
    format!("queue:{}", priority.as_str())
}

/// Sorted set tracking arrival order next to each priority list.
pub fn order_key(queue_key: &str) -> String {
    format!("{queue_key}:order")
}

pub fn status_key(uuid: &Uuid) -> String {
    format!("status:{uuid}")
}

pub fn submission_key(uuid: &Uuid) -> String {
    format!("submission:{uuid}")
}

pub fn package_key(name: &str, version: u32) -> String {
    format!("package:{name}:{version}")
}

pub fn evaluation_key(uuid: &Uuid) -> String {
    format!("evaluation:{uuid}")
}

pub fn instance_lock_key(instance: &str) -> String {
    format!("instance_lock:{instance}")
}

pub fn alive_worker_key(instance: &str) -> String {
    format!("alive_workers:{instance}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_ordered_by_priority() {
        let keys: Vec<String> = Priority::ALL.iter().map(|p| queue_key(*p)).collect();
        assert_eq!(keys, vec!["queue:high", "queue:medium", "queue:low"]);
    }

    #[test]
    fn order_key_derives_from_queue_key() {
        assert_eq!(order_key("queue:high"), "queue:high:order");
    }

    #[test]
    fn submission_keys_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(submission_key(&id), submission_key(&id));
        assert!(status_key(&id).starts_with("status:"));
        assert!(evaluation_key(&id).contains(&id.to_string()));
    }

    #[test]
    fn package_key_format() {
        assert_eq!(package_key("sort", 3), "package:sort:3");
    }

    #[test]
    fn instance_keys() {
        assert_eq!(instance_lock_key("w1"), "instance_lock:w1");
        assert_eq!(alive_worker_key("w1"), "alive_workers:w1");
    }
}
